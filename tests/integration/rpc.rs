use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_core::Text;
use tessera_services::{CallState, RpcError};
use tokio::runtime::Handle;

use crate::*;

#[tokio::test]
async fn echo_over_tcp() {
    let server = tcp_node().await;
    let client = node();
    let peer = introduce(&client, &server);

    let answer: Text = client
        .call_object(peer, "echo", vec![text(&client, "hello")])
        .await
        .unwrap();
    assert_eq!(answer.as_str(), "hello to you too");
    assert_eq!(client.remoting().pending_calls(), 0);
}

#[tokio::test]
async fn server_learns_a_route_back_from_the_parcel() {
    let server = tcp_node().await;
    let client = node();
    let peer = introduce(&client, &server);

    client.call(peer, "echo", vec![text(&client, "hi")]).await.unwrap();
    assert_eq!(server.routes().routes_for(&client.peer_ref()).len(), 1);
}

#[tokio::test]
async fn servant_error_is_returned_not_raised() {
    let server = tcp_node().await;
    let client = node();
    let peer = introduce(&client, &server);

    let outcome = client.call(peer, "fail", vec![]).await;
    assert_eq!(CallState::of(&outcome), CallState::Completed);
    match outcome.unwrap_err() {
        RpcError::Servant {
            error_type,
            message,
        } => {
            assert_eq!(error_type, "refused");
            assert_eq!(message, "not today");
        }
        other => panic!("expected servant error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_servant_times_out() {
    let server = tcp_node().await;
    let client = node();
    let peer = introduce(&client, &server);

    let started = Instant::now();
    let outcome = client
        .call_with_timeout(peer, "nobody/home", vec![], Duration::from_secs(1))
        .await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(CallState::of(&outcome), CallState::TimedOut);
    assert_eq!(client.remoting().pending_calls(), 0);
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_answer() {
    let server = tcp_node().await;
    let client = Arc::new(node());
    let peer = introduce(&client, &server);

    let mut calls = Vec::new();
    for i in 0..16 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let arg = text(&client, &format!("caller {i}"));
            let answer: Text = client.call_object(peer, "echo", vec![arg]).await?;
            Ok::<_, RpcError>((i, answer))
        }));
    }
    for call in calls {
        let (i, answer) = call.await.unwrap().unwrap();
        assert_eq!(answer.as_str(), format!("caller {i} to you too"));
    }
    assert_eq!(client.remoting().pending_calls(), 0);
}

#[tokio::test]
async fn server_shutdown_fails_pending_call() {
    let server = tcp_node().await;
    let client = node();
    let peer = introduce(&client, &server);

    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        server.shutdown();
    };
    let (outcome, ()) = tokio::join!(client.call(peer, "sleep", vec![]), shutdown);
    assert!(
        matches!(outcome, Err(RpcError::TransportClosed)),
        "unexpected outcome {outcome:?}"
    );
    assert_eq!(client.remoting().pending_calls(), 0);
}

#[tokio::test]
async fn local_failure_ends_pending_call() {
    let server = tcp_node().await;
    let client = node();
    let peer = introduce(&client, &server);

    let fail = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        client.services().fail("cache disk full");
    };
    let (outcome, ()) = tokio::join!(client.call(peer, "sleep", vec![]), fail);
    match outcome {
        Err(RpcError::ServicesFailed(reason)) => assert_eq!(reason, "cache disk full"),
        other => panic!("expected services failure, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_call_from_a_plain_thread() {
    let server = tcp_node().await;
    let client = Arc::new(node());
    let peer = introduce(&client, &server);
    let arg = text(&client, "from afar");

    let handle = Handle::current();
    let caller = client.clone();
    let answer = tokio::task::spawn_blocking(move || caller.call_blocking(&handle, peer, "echo", vec![arg]))
        .await
        .unwrap()
        .unwrap();
    let answer: Text = client.mosaic().resolve_object(&answer).unwrap();
    assert_eq!(answer.as_str(), "from afar to you too");
}

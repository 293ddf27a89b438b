use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use tessera_core::{Ref, Text};
use tessera_services::pipe::{attach_pipe, serve_pipe};
use tessera_services::{RpcError, Servant, ServantContext, ServantError};

use crate::*;

struct Crash;

#[async_trait]
impl Servant for Crash {
    async fn call(&self, _ctx: &ServantContext, _params: Vec<Ref>) -> Result<Ref, ServantError> {
        panic!("child crashed");
    }
}

struct Piped {
    parent: Node,
    child: Arc<Node>,
    child_peer: Ref,
    serving: JoinHandle<anyhow::Result<()>>,
}

/// A parent node and a child node joined by an in-memory pipe.
async fn piped() -> Piped {
    let parent = node();
    let child = Arc::new(node());
    child.register_servant("crash", Arc::new(Crash));

    let (parent_end, child_end) = tokio::io::duplex(1 << 20);
    let (pr, pw) = tokio::io::split(parent_end);
    let (cr, cw) = tokio::io::split(child_end);

    let serving = {
        let child = child.clone();
        tokio::spawn(async move { serve_pipe(&child, Box::new(cr), Box::new(cw)).await })
    };
    let (_route, child_peer) = attach_pipe(&parent, Box::new(pr), Box::new(pw), Duration::from_secs(5))
        .await
        .expect("child never said hello");
    Piped {
        parent,
        child,
        child_peer,
        serving,
    }
}

#[tokio::test]
async fn object_graphs_cross_the_pipe() {
    let p = piped().await;
    let body = text(&p.parent, "one two three four");
    let note = p
        .parent
        .mosaic()
        .put(&Note {
            title: "pipe".into(),
            body,
        })
        .unwrap();

    let reply: Note = p
        .parent
        .call_object(p.child_peer, "notes/reply", vec![note])
        .await
        .unwrap();
    assert_eq!(reply.title, "re: pipe");
    let counted: Text = p.parent.mosaic().resolve_object(&reply.body).unwrap();
    assert_eq!(counted.as_str(), "4 words");
}

#[tokio::test]
async fn child_can_call_back_once_it_has_heard_from_parent() {
    let p = piped().await;
    p.parent
        .call(p.child_peer, "echo", vec![text(&p.parent, "ping")])
        .await
        .unwrap();

    let parent_peer = p.parent.peer_ref();
    let answer: Text = p
        .child
        .call_object(parent_peer, "echo", vec![text(&p.child, "pong")])
        .await
        .unwrap();
    assert_eq!(answer.as_str(), "pong to you too");
}

#[tokio::test]
async fn child_panic_arrives_as_remote_exception() {
    let p = piped().await;
    let err = p.parent.call(p.child_peer, "crash", vec![]).await.unwrap_err();
    match err {
        RpcError::RemoteException(summary) => assert!(summary.contains("child crashed")),
        other => panic!("expected remote exception, got {other:?}"),
    }
    assert_eq!(p.parent.remoting().pending_calls(), 0);

    // The child keeps serving after reporting.
    let answer: Text = p
        .parent
        .call_object(p.child_peer, "echo", vec![text(&p.parent, "still there")])
        .await
        .unwrap();
    assert_eq!(answer.as_str(), "still there to you too");
}

#[tokio::test]
async fn child_going_away_fails_the_pending_call() {
    let p = piped().await;
    let child = p.child.clone();
    let stop = async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        child.shutdown();
    };

    let (outcome, ()) = tokio::join!(p.parent.call(p.child_peer, "sleep", vec![]), stop);
    assert!(
        matches!(outcome, Err(RpcError::TransportClosed)),
        "unexpected outcome {outcome:?}"
    );
    tokio::time::timeout(Duration::from_secs(5), p.serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(p.parent.remoting().pending_calls(), 0);
}

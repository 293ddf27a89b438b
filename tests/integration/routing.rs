use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use tessera_core::{Identity, Ref, Text};
use tessera_services::{
    Dispatcher, Node, ResolveError, RouteSource, RpcError, SharedRoute, TcpRoute, TcpRouteAddress,
};

use crate::*;

/// A port nothing listens on.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn dead_route_falls_through_to_the_next() {
    let server = tcp_node().await;
    let client = node();
    let peer = server.peer_ref();

    let dead = TcpRoute::new(
        TcpRouteAddress::new("127.0.0.1", dead_port()),
        client.dispatcher().clone(),
    );
    client.routes().add_route(peer, Arc::new(dead));
    introduce(&client, &server);
    assert_eq!(client.routes().routes_for(&peer).len(), 2);

    let answer: Text = client
        .call_object(peer, "echo", vec![text(&client, "anyone")])
        .await
        .unwrap();
    assert_eq!(answer.as_str(), "anyone to you too");
}

#[tokio::test]
async fn every_route_dead_is_a_transport_failure() {
    let server = tcp_node().await;
    let client = node();
    let peer = client.mosaic().put(&server.identity().peer()).unwrap();
    let dead = TcpRoute::new(
        TcpRouteAddress::new("127.0.0.1", dead_port()),
        client.dispatcher().clone(),
    );
    client.routes().add_route(peer, Arc::new(dead));

    let err = client.call(peer, "echo", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::TransportClosed), "unexpected {err:?}");
    assert_eq!(client.remoting().pending_calls(), 0);
}

#[tokio::test]
async fn peer_without_routes_is_unreachable() {
    let server = tcp_node().await;
    let client = node();
    let peer = client.mosaic().put(&server.identity().peer()).unwrap();

    let err = client.call(peer, "echo", vec![]).await.unwrap_err();
    assert!(
        matches!(err, RpcError::Resolve(ResolveError::NoRoute(r)) if r == peer),
        "unexpected {err:?}"
    );
}

/// Hands out TCP routes from a fixed address book.
struct AddressBook {
    dispatcher: Mutex<Option<Dispatcher>>,
    entries: Mutex<HashMap<Ref, TcpRouteAddress>>,
}

#[async_trait]
impl RouteSource for AddressBook {
    fn name(&self) -> &str {
        "address book"
    }

    async fn lookup(&self, peer: &Ref) -> Vec<SharedRoute> {
        let Some(address) = self.entries.lock().unwrap().get(peer).cloned() else {
            return Vec::new();
        };
        let Some(dispatcher) = self.dispatcher.lock().unwrap().clone() else {
            return Vec::new();
        };
        let route: SharedRoute = Arc::new(TcpRoute::new(address, dispatcher));
        vec![route]
    }
}

#[tokio::test]
async fn route_source_fills_in_missing_routes() {
    let server = node();
    let addr = server.serve_tcp("127.0.0.1", 0).await.unwrap();
    let book = Arc::new(AddressBook {
        dispatcher: Mutex::new(None),
        entries: Mutex::new(HashMap::from([(
            server.peer_ref(),
            TcpRouteAddress::new("127.0.0.1", addr.port()),
        )])),
    });
    let source: Arc<dyn RouteSource> = book.clone();
    let client = Node::start_with_sources(config(), Identity::generate(), vec![source]).unwrap();
    *book.dispatcher.lock().unwrap() = Some(client.dispatcher().clone());

    let peer = client.mosaic().put(&server.identity().peer()).unwrap();
    assert!(client.routes().routes_for(&peer).is_empty());

    let answer: Text = client
        .call_object(peer, "echo", vec![text(&client, "looked up")])
        .await
        .unwrap();
    assert_eq!(answer.as_str(), "looked up to you too");
    assert_eq!(client.routes().routes_for(&peer).len(), 1);
}

#[tokio::test]
async fn peer_that_never_reads_still_times_out() {
    // Accepts and holds connections without reading from them.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let client = node();
    let peer = client.mosaic().put(&Identity::generate().peer()).unwrap();
    let route: SharedRoute = Arc::new(TcpRoute::new(
        TcpRouteAddress::new("127.0.0.1", port),
        client.dispatcher().clone(),
    ));
    client.routes().add_route(peer, route);
    let big = text(&client, &"x".repeat(24 << 20));

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(60),
        client.call_with_timeout(peer, "echo", vec![big], Duration::from_secs(2)),
    )
    .await
    .expect("call outlived its deadline");
    assert!(matches!(outcome, Err(RpcError::Timeout)), "unexpected {outcome:?}");
    assert_eq!(client.remoting().pending_calls(), 0);
    assert!(started.elapsed() < Duration::from_secs(30), "took {:?}", started.elapsed());
    holder.abort();
}

#[tokio::test]
async fn hello_over_tcp_adds_no_route() {
    let server = node();
    let addr = server.serve_tcp("127.0.0.1", 0).await.unwrap();
    let stranger = node();
    let route = TcpRoute::new(
        TcpRouteAddress::new("127.0.0.1", addr.port()),
        stranger.dispatcher().clone(),
    );
    stranger.remoting().announce(&route).await.unwrap();

    let claimed = stranger.peer_ref();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.mosaic().contains(&claimed) {
        assert!(Instant::now() < deadline, "hello never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.routes().routes_for(&claimed).is_empty());
}

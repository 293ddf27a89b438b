use std::collections::HashSet;

use tessera_core::bundle::Bundle;
use tessera_core::Text;

use crate::*;

#[tokio::test]
async fn arguments_travel_with_everything_they_reference() {
    let server = tcp_node().await;
    let client = node();
    let peer = introduce(&client, &server);

    let body = text(&client, "three small words");
    let note = client
        .mosaic()
        .put(&Note {
            title: "count me".into(),
            body,
        })
        .unwrap();
    assert!(!server.mosaic().contains(&body));

    let reply: Note = client.call_object(peer, "notes/reply", vec![note]).await.unwrap();
    assert!(server.mosaic().contains(&note));
    assert!(server.mosaic().contains(&body));

    assert_eq!(reply.title, "re: count me");
    let counted: Text = client.mosaic().resolve_object(&reply.body).unwrap();
    assert_eq!(counted.as_str(), "3 words");
}

#[tokio::test]
async fn exported_peer_survives_binary_encoding() {
    let server = tcp_node().await;
    let client = node();

    let exported = server.export_peer().unwrap();
    let bytes = exported.encode().unwrap();
    let decoded = Bundle::decode(&bytes).unwrap();
    assert_eq!(decoded.roots, vec![server.peer_ref()]);

    let stored = client.import(&decoded).unwrap();
    assert!(stored.contains(&server.peer_ref()));

    let answer: Text = client
        .call_object(server.peer_ref(), "echo", vec![text(&client, "round trip")])
        .await
        .unwrap();
    assert_eq!(answer.as_str(), "round trip to you too");
}

#[tokio::test]
async fn known_refs_are_left_out_of_a_bundle() {
    let server = tcp_node().await;
    let first = server.export_peer().unwrap();

    let known: HashSet<_> = first.capsule_list.iter().map(|c| c.make_ref()).collect();
    let bundler = tessera_core::Bundler::new(
        server.mosaic().clone(),
        server.types().clone(),
        std::sync::Arc::new(tessera_core::AssociationRegistry::new()),
    );
    let second = bundler.bundle(&[server.peer_ref()], &known).unwrap();
    assert!(second.capsule_list.is_empty());
    assert_eq!(second.roots, vec![server.peer_ref()]);
}

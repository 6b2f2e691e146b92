//! Subscription group tests

use collab_sync::config::ServerConfig;
use collab_sync::model::Branch;
use collab_sync::protocol::Command;
use collab_sync::SyncError;

use crate::common::{assert_silent, next_command, seed_catalog, TestServer, WAIT};

#[tokio::test]
async fn test_subscribe_lists_existing_peers() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let bob = server.connect().await;
    seed_catalog(&alice).await;

    let peers = alice.subscribe("proj1", "main", 1, "alice", 0xff0000).await.unwrap();
    assert!(peers.is_empty());

    let peers = bob.subscribe("proj1", "main", 1, "bob", 0x00ff00).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "alice");
    assert_eq!(peers[0].color, 0xff0000);

    // Alice hears about bob
    match next_command(&mut alice).await {
        Command::Subscribe(notice) => {
            assert_eq!(notice.name, "bob");
            assert_eq!(notice.color, 0x00ff00);
        }
        other => panic!("Expected subscribe notice, got {:?}", other),
    }

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_to_unknown_branch() {
    let server = TestServer::start().await;
    let client = server.connect().await;
    seed_catalog(&client).await;

    let result = client.subscribe("proj1", "nope", -1, "alice", 0).await;
    assert!(matches!(result, Err(SyncError::UnknownBranch { .. })));

    client.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_events_stay_within_their_branch() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;
    let mut carol = server.connect().await;
    seed_catalog(&alice).await;
    alice.new_branch(Branch::new("proj1", "dev")).await.unwrap();

    alice.subscribe("proj1", "main", 1, "alice", 1).await.unwrap();
    bob.subscribe("proj1", "main", 1, "bob", 2).await.unwrap();
    carol.subscribe("proj1", "dev", 1, "carol", 3).await.unwrap();

    // Drain alice's notice about bob
    assert!(matches!(next_command(&mut alice).await, Command::Subscribe(_)));

    alice.update_cursor("alice", 0x401000).unwrap();
    match next_command(&mut bob).await {
        Command::UpdateCursors(event) => {
            assert_eq!(event.ea, 0x401000);
            assert_eq!(event.name, "alice");
        }
        other => panic!("Expected cursor update, got {:?}", other),
    }

    // Neither the other branch nor the sender sees it
    assert_silent(&mut carol).await;
    assert_silent(&mut alice).await;

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    carol.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_user_state_events_relay_in_order() {
    let server = TestServer::start().await;
    let alice = server.connect().await;
    let mut bob = server.connect().await;
    seed_catalog(&alice).await;

    alice.subscribe("proj1", "main", 1, "alice", 1).await.unwrap();
    bob.subscribe("proj1", "main", 1, "bob", 2).await.unwrap();

    alice.rename_user("alice", "alicia").unwrap();
    alice.change_color("alicia", 1, 7).unwrap();
    alice.update_cursor("alicia", 0x1000).unwrap();

    assert!(matches!(
        next_command(&mut bob).await,
        Command::RenamedUser(ref e) if e.old_name == "alice" && e.new_name == "alicia"
    ));
    assert!(matches!(
        next_command(&mut bob).await,
        Command::UserColorChanged(ref e) if e.new_color == 7
    ));
    assert!(matches!(
        next_command(&mut bob).await,
        Command::UpdateCursors(ref e) if e.ea == 0x1000
    ));

    // A newcomer sees the updated peer state
    let carol = server.connect().await;
    let peers = carol.subscribe("proj1", "main", 1, "carol", 3).await.unwrap();
    let alicia = peers
        .iter()
        .find(|p| p.name == "alicia")
        .expect("renamed peer is listed");
    assert_eq!(alicia.color, 7);
    assert_eq!(alicia.cursor, Some(0x1000));

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    carol.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_events_without_subscription_are_dropped() {
    let server = TestServer::start().await;
    let alice = server.connect().await;
    let mut bob = server.connect().await;
    seed_catalog(&alice).await;
    bob.subscribe("proj1", "main", 1, "bob", 2).await.unwrap();

    // Alice never subscribed
    alice.update_cursor("alice", 0x10).unwrap();
    assert_silent(&mut bob).await;

    // The connection is still usable
    assert_eq!(alice.repositories().await.unwrap().len(), 1);

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_notifies_group() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let bob = server.connect().await;
    seed_catalog(&alice).await;

    alice.subscribe("proj1", "main", 1, "alice", 1).await.unwrap();
    bob.subscribe("proj1", "main", 1, "bob", 2).await.unwrap();
    assert!(matches!(next_command(&mut alice).await, Command::Subscribe(_)));

    bob.unsubscribe("bob").await.unwrap();
    assert!(matches!(
        next_command(&mut alice).await,
        Command::Unsubscribe(ref u) if u.name == "bob"
    ));

    // Unsubscribing twice is harmless
    bob.unsubscribe("bob").await.unwrap();
    assert_silent(&mut alice).await;

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_notifies_group() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let bob = server.connect().await;
    seed_catalog(&alice).await;

    alice.subscribe("proj1", "main", 1, "alice", 1).await.unwrap();
    bob.subscribe("proj1", "main", 1, "bob", 2).await.unwrap();
    assert!(matches!(next_command(&mut alice).await, Command::Subscribe(_)));

    bob.disconnect().await.unwrap();
    assert!(matches!(
        next_command(&mut alice).await,
        Command::Unsubscribe(ref u) if u.name == "bob"
    ));

    alice.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_resubscribe_moves_between_groups() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let bob = server.connect().await;
    seed_catalog(&alice).await;
    alice.new_branch(Branch::new("proj1", "dev")).await.unwrap();

    alice.subscribe("proj1", "main", 1, "alice", 1).await.unwrap();
    bob.subscribe("proj1", "main", 1, "bob", 2).await.unwrap();
    assert!(matches!(next_command(&mut alice).await, Command::Subscribe(_)));

    // Bob moves to dev: main hears that he left
    bob.subscribe("proj1", "dev", 1, "bob", 2).await.unwrap();
    assert!(matches!(
        next_command(&mut alice).await,
        Command::Unsubscribe(ref u) if u.name == "bob"
    ));

    bob.update_cursor("bob", 0x20).unwrap();
    assert_silent(&mut alice).await;

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_client_connections() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    seed_catalog(&client).await;

    server.shutdown().await;

    let next = tokio::time::timeout(WAIT, client.next_incoming())
        .await
        .expect("connection should close");
    assert!(next.is_none());
}

#[tokio::test]
async fn test_slow_subscriber_gets_every_event_or_is_disconnected() {
    const EVENTS: u64 = 200;
    let server = TestServer::start_with(ServerConfig {
        event_capacity: 4,
        ..ServerConfig::default()
    })
    .await;
    let alice = server.connect().await;
    let mut bob = server.connect().await;
    seed_catalog(&alice).await;

    alice.subscribe("proj1", "main", 1, "alice", 1).await.unwrap();
    bob.subscribe("proj1", "main", 1, "bob", 2).await.unwrap();

    for ea in 0..EVENTS {
        alice.update_cursor("alice", ea).unwrap();
    }

    // Bob sees an unbroken prefix of the events; a gap closes his connection
    let mut received = 0;
    while received < EVENTS {
        let next = tokio::time::timeout(WAIT, bob.next_incoming())
            .await
            .expect("bob should get the next event or be disconnected");
        match next {
            Some(incoming) => {
                assert!(matches!(
                    incoming.command,
                    Command::UpdateCursors(ref e) if e.ea == received
                ));
                received += 1;
            }
            None => break,
        }
    }
    if received < EVENTS {
        assert!(!bob.is_connected());
    }

    alice.disconnect().await.unwrap();
    bob.disconnect().await.unwrap();
    server.shutdown().await;
}

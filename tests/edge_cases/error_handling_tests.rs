//! Error Handling and Edge Case Tests
//!
//! Protocol violations, teardown and peers that misbehave. Raw WebSocket
//! peers stand in for a broken client or server where needed.

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use collab_sync::client::{Client, ClientOptions, ServerDescriptor};
use collab_sync::protocol::{Command, FrameLimits, GetRepos, Packet, ReplyError};
use collab_sync::SyncError;

use crate::common::{TestServer, QUIET, WAIT};

/// Frame with a hand-written header, bypassing the encoder
fn raw_frame(header: &str) -> Vec<u8> {
    let mut frame = (header.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(header.as_bytes());
    frame
}

/// Whether the server closed the raw connection within `WAIT`
async fn closed_by_server<S>(ws: &mut S) -> bool
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let closed = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    };
    tokio::time::timeout(WAIT, closed).await.is_ok()
}

// ============================================================================
// PROTOCOL VIOLATIONS
// ============================================================================

#[tokio::test]
async fn test_unknown_command_drops_connection() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/", server.addr());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let frame = raw_frame(r#"{"kind":"delete_everything","id":1,"reply":false,"fields":{}}"#);
    ws.send(Message::Binary(frame)).await.unwrap();
    assert!(closed_by_server(&mut ws).await);

    // Other clients are unaffected
    let client = server.connect().await;
    assert!(client.repositories().await.unwrap().is_empty());
    client.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_truncated_frame_drops_connection() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/", server.addr());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    // Declares a 200-byte header, carries 2 bytes
    let mut frame = 200u32.to_be_bytes().to_vec();
    frame.extend_from_slice(b"{}");
    ws.send(Message::Binary(frame)).await.unwrap();
    assert!(closed_by_server(&mut ws).await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_text_message_drops_connection() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/", server.addr());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text(r#"{"kind":"get_repos"}"#.to_string()))
        .await
        .unwrap();
    assert!(closed_by_server(&mut ws).await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_raw_query_gets_reply_with_same_id() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/", server.addr());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let frame = raw_frame(r#"{"kind":"get_repos","id":77,"reply":false,"fields":{}}"#);
    ws.send(Message::Binary(frame)).await.unwrap();

    let reply = tokio::time::timeout(WAIT, ws.next())
        .await
        .expect("reply in time")
        .expect("stream open")
        .unwrap();
    let Message::Binary(data) = reply else {
        panic!("Expected binary reply, got {:?}", reply);
    };
    match Packet::decode(&data, &FrameLimits::default()).unwrap() {
        Packet::Reply { id, command } => {
            assert_eq!(id, 77);
            assert!(matches!(command, Command::GetReposReply(ref r) if r.repos.is_empty()));
        }
        other => panic!("Expected reply, got {:?}", other),
    }

    server.shutdown().await;
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[tokio::test]
async fn test_pending_queries_fail_when_server_vanishes() {
    // A server that accepts the upgrade, reads one query and hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fake = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        drop(ws);
    });

    let client = Client::connect(
        &ServerDescriptor::new("127.0.0.1", port),
        ClientOptions::default(),
    )
    .await
    .unwrap();

    let pending = client
        .send_query(Command::GetRepos(GetRepos {}))
        .unwrap();
    let result = tokio::time::timeout(WAIT, pending)
        .await
        .expect("pending query should resolve");
    assert!(matches!(result, Err(SyncError::Disconnected)));

    // Nothing new can be registered on a dead connection
    let again = client.send_query(Command::GetRepos(GetRepos {}));
    match again {
        Err(SyncError::Disconnected) => {}
        Ok(pending) => assert!(matches!(pending.await, Err(SyncError::Disconnected))),
        Err(other) => panic!("Expected Disconnected, got {:?}", other),
    }

    fake.await.unwrap();
}

#[tokio::test]
async fn test_local_disconnect_fails_pending_queries() {
    // A server that never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let _fake = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let client = Client::connect(
        &ServerDescriptor::new("127.0.0.1", port),
        ClientOptions::default(),
    )
    .await
    .unwrap();

    let first = client.send_query(Command::GetRepos(GetRepos {})).unwrap();
    let second = client.send_query(Command::GetRepos(GetRepos {})).unwrap();
    assert_eq!(client.connection().pending_count(), 2);

    client.disconnect().await.unwrap();
    assert!(matches!(first.await, Err(SyncError::Disconnected)));
    assert!(matches!(second.await, Err(SyncError::Disconnected)));
}

#[tokio::test]
async fn test_client_refuses_server_queries() {
    // A server that asks the client something
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fake = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let query = Packet::Query {
            id: 5,
            command: Command::GetRepos(GetRepos {}),
        };
        ws.send(Message::Binary(query.encode().unwrap())).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Packet::decode(&data, &FrameLimits::default()).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("Connection ended early: {:?}", other),
            }
        }
    });

    let mut client = Client::connect(
        &ServerDescriptor::new("127.0.0.1", port),
        ClientOptions::default(),
    )
    .await
    .unwrap();

    // The refusal is sent while waiting; no notification surfaces
    let next = tokio::time::timeout(QUIET, client.next_incoming()).await;
    assert!(next.is_err());

    match fake.await.unwrap() {
        Packet::Error { id, error, .. } => {
            assert_eq!(id, 5);
            assert!(matches!(error, ReplyError::Rejected { .. }));
        }
        other => panic!("Expected error reply, got {:?}", other),
    }
}

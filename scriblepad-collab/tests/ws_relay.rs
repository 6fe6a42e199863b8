//! Sessions talking through a real WebSocket relay.
//!
//! Each test binds a `RelayServer` to an ephemeral port and connects
//! `WsTransport`-backed sessions to it.

mod common;

use std::sync::Arc;

use common::{identity, room, synced, wait_until};
use scriblepad_collab::{
    ClientConfig, ConnectionState, RelayServer, ServerConfig, Session, SessionConfig, WsTransport,
};
use tokio::net::TcpListener;

/// Start a relay on a free port, return it with its base URL.
async fn start_relay(config: ServerConfig) -> (Arc<RelayServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(RelayServer::new(config).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn open_ws(url: &str, room_name: &str, name: &str) -> Session {
    Session::open(
        room(room_name),
        identity(name, "#61afef"),
        Arc::new(WsTransport::new(ClientConfig::new(url))),
        None,
        SessionConfig::for_testing(),
    )
}

#[tokio::test]
async fn test_sessions_converge_over_websocket() {
    let (server, url) = start_relay(ServerConfig::default()).await;
    let alice = open_ws(&url, "ws-room", "Alice");
    let bob = open_ws(&url, "ws-room", "Bob");
    synced(&alice).await;
    synced(&bob).await;

    alice.title().local_edit("Over the wire", None).unwrap();
    bob.body().local_edit("hello from bob", None).unwrap();
    wait_until("bob sees the title", || bob.title().text() == "Over the wire").await;
    wait_until("alice sees the body", || alice.body().text() == "hello from bob").await;

    wait_until("both users present", || {
        alice.presence_list().len() == 2 && bob.presence_list().len() == 2
    })
    .await;

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages > 0);

    bob.destroy().await;
    wait_until("alice sees bob leave", || alice.presence_list().len() == 1).await;
    alice.destroy().await;
    assert_eq!(alice.status().connection, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (_server, url) = start_relay(ServerConfig::default()).await;
    let alice = open_ws(&url, "room-a", "Alice");
    let bob = open_ws(&url, "room-b", "Bob");
    synced(&alice).await;
    synced(&bob).await;

    alice.body().local_edit("only in a", None).unwrap();
    let carol = open_ws(&url, "room-a", "Carol");
    synced(&carol).await;
    wait_until("carol sees room a", || carol.body().text() == "only in a").await;
    assert_eq!(bob.body().text(), "");
    assert_eq!(bob.presence_list().len(), 1);

    for session in [alice, bob, carol] {
        session.destroy().await;
    }
}

#[tokio::test]
async fn test_transport_reconnects_after_relay_starts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = format!("ws://{addr}");
    let mut config = ClientConfig::new(&url);
    config.reconnect_min = std::time::Duration::from_millis(20);
    config.reconnect_max = std::time::Duration::from_millis(100);
    let alice = Session::open(
        room("retry"),
        identity("Alice", "#98c379"),
        Arc::new(WsTransport::new(config)),
        None,
        SessionConfig::for_testing(),
    );
    alice.title().local_edit("queued", None).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!alice.is_synced());

    let listener = TcpListener::bind(addr).await.unwrap();
    let server = Arc::new(RelayServer::with_defaults());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    synced(&alice).await;
    let bob = open_ws(&url, "retry", "Bob");
    synced(&bob).await;
    wait_until("bob sees the queued title", || bob.title().text() == "queued").await;

    alice.destroy().await;
    bob.destroy().await;
}

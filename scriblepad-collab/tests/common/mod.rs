//! Helpers shared by the collab integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use scriblepad_collab::{
    LocalCache, LoopbackTransport, RelayHub, Session, SessionConfig,
};
use scriblepad_core::{RoomId, UserIdentity};

pub const WAIT: Duration = Duration::from_secs(3);

/// Poll `condition` until it holds or `WAIT` runs out.
pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn room(name: &str) -> RoomId {
    RoomId::parse(name).unwrap()
}

pub fn identity(name: &str, color: &str) -> UserIdentity {
    UserIdentity::new(name, color)
}

/// Open a session on `hub` through a fresh loopback link.
pub fn open_loopback(
    hub: &Arc<RelayHub>,
    room_name: &str,
    name: &str,
    cache: Option<Arc<dyn LocalCache>>,
) -> (Session, Arc<LoopbackTransport>) {
    let transport = Arc::new(LoopbackTransport::new(hub.clone()));
    let session = Session::open(
        room(room_name),
        identity(name, "#e06c75"),
        transport.clone(),
        cache,
        SessionConfig::for_testing(),
    );
    (session, transport)
}

/// Wait for the first relay sync, failing the test after `WAIT`.
pub async fn synced(session: &Session) {
    tokio::time::timeout(WAIT, session.synced())
        .await
        .expect("session did not sync");
}

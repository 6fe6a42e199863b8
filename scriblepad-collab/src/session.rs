//! One client's view of one room.
//!
//! ```text
//!                 ┌──────────── Session ─────────────┐
//!  LocalCache ──► │ replay (Cache) ─► SharedDocument │ ◄── editors, versions,
//!      ▲          │                     │ Updated    │     access, chat
//!      └──────────┼── non-cache ────────┤            │
//!                 │                     └─ local ────┼──► Transport ──► relay
//!  Transport ────►│ events ─► apply (Remote),        │
//!                 │           awareness, sync state  │
//!                 └──────────────────────────────────┘
//! ```
//!
//! `open` returns immediately. A driver task replays the cache, then
//! connects; two signals report progress, each at most once:
//! [`SyncSignal::CacheReplayed`] after the cache replay (even when the
//! cache is empty or unusable) and [`SyncSignal::NetworkSynced`] on the
//! relay's first sync response. [`SessionStatus::is_synced`] combines the
//! second with the live connection state.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use scriblepad_core::{
    AccessGate, AccessState, ChangeOrigin, ChatChannel, ChatMessage, Clock, DiffStrategy,
    DocumentError, DocumentEvent, EditorOptions, EditorReconciler, EventBus, PasswordHasher,
    RoomId, SharedDocument, Sha256Hasher, Subscription, SystemClock, TextField, UserIdentity,
    VersionManager,
};

use crate::awareness::AwarenessTable;
use crate::presence::{PresenceAggregator, PresenceUser};
use crate::protocol::{AwarenessState, PeerInfo};
use crate::storage::LocalCache;
use crate::transport::{ConnectionState, Outbound, Transport, TransportEvent};

/// yrs encoding of an update that carries nothing.
const EMPTY_UPDATE: &[u8] = &[0, 0];

/// Session timers and editor limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub auto_save_interval: Duration,
    /// One-shot capture after opening, once content has settled.
    pub initial_snapshot_delay: Duration,
    /// Local awareness is re-sent this often so peers keep it alive.
    pub awareness_heartbeat: Duration,
    /// Remote awareness not renewed within this is dropped.
    pub awareness_timeout: Duration,
    /// Stored updates before the cache is compacted to one state.
    pub cache_compaction_threshold: u64,
    pub diff_strategy: DiffStrategy,
    pub title_max_length: Option<usize>,
    pub body_max_length: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_save_interval: scriblepad_core::versions::AUTO_SAVE_INTERVAL,
            initial_snapshot_delay: Duration::from_secs(3),
            awareness_heartbeat: Duration::from_secs(15),
            awareness_timeout: Duration::from_secs(30),
            cache_compaction_threshold: 500,
            diff_strategy: DiffStrategy::Minimal,
            title_max_length: Some(scriblepad_core::editor::TITLE_MAX_LENGTH),
            body_max_length: None,
        }
    }
}

impl SessionConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            auto_save_interval: Duration::from_millis(200),
            initial_snapshot_delay: Duration::from_millis(50),
            awareness_heartbeat: Duration::from_millis(100),
            awareness_timeout: Duration::from_secs(1),
            cache_compaction_threshold: 8,
            ..Self::default()
        }
    }
}

/// Collaborators the session uses but does not implement.
#[derive(Clone)]
pub struct SessionServices {
    pub clock: Arc<dyn Clock>,
    pub hasher: Arc<dyn PasswordHasher>,
}

impl Default for SessionServices {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            hasher: Arc::new(Sha256Hasher),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    pub cache_replayed: bool,
    /// The replayed cache contained data.
    pub cache_had_data: bool,
    /// `false` once the cache failed; the session runs network-only.
    pub cache_available: bool,
    /// The relay has answered our sync request at least once.
    pub network_synced: bool,
}

impl SessionStatus {
    fn initial(has_cache: bool) -> Self {
        Self {
            connection: ConnectionState::Connecting,
            cache_replayed: false,
            cache_had_data: false,
            cache_available: has_cache,
            network_synced: false,
        }
    }

    /// Connected and caught up with the relay.
    pub fn is_synced(&self) -> bool {
        self.network_synced && self.connection == ConnectionState::Connected
    }

    /// Shared state is known well enough to trust derived values such as
    /// the access state.
    pub fn is_state_known(&self) -> bool {
        self.network_synced || self.cache_had_data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    CacheReplayed,
    NetworkSynced,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("session has been destroyed")]
    Destroyed,
}

/// State shared between the session and its tasks and handlers.
struct SessionShared {
    room: String,
    status: watch::Sender<SessionStatus>,
    signals: EventBus<SyncSignal>,
    cache: Mutex<Option<Arc<dyn LocalCache>>>,
    compaction_threshold: u64,
}

impl SessionShared {
    fn cache(&self) -> Option<Arc<dyn LocalCache>> {
        self.cache.lock().clone()
    }

    fn disable_cache(&self, reason: &dyn std::fmt::Display) {
        if self.cache.lock().take().is_some() {
            log::warn!("Local cache for room {} disabled, continuing network-only: {reason}", self.room);
            self.status.send_modify(|s| s.cache_available = false);
        }
    }

    fn persist(&self, document: &Weak<SharedDocument>, update: &[u8]) {
        if update == EMPTY_UPDATE {
            return;
        }
        let Some(cache) = self.cache() else {
            return;
        };
        if let Err(e) = cache.store_update(&self.room, update) {
            self.disable_cache(&e);
            return;
        }
        match cache.update_count(&self.room) {
            Ok(count) if count >= self.compaction_threshold => {
                let Some(document) = document.upgrade() else {
                    return;
                };
                match cache.compact(&self.room, &document.encode_state()) {
                    Ok(()) => log::debug!("Compacted {count} cached updates for room {}", self.room),
                    Err(e) => self.disable_cache(&e),
                }
            }
            Ok(_) => {}
            Err(e) => self.disable_cache(&e),
        }
    }

    fn set_connection(&self, connection: ConnectionState) {
        self.status.send_if_modified(|s| {
            let changed = s.connection != connection;
            s.connection = connection;
            changed
        });
    }

    fn mark_cache_replayed(&self, had_data: bool) {
        let first = self.status.send_if_modified(|s| {
            let first = !s.cache_replayed;
            s.cache_replayed = true;
            s.cache_had_data |= had_data;
            first
        });
        if first {
            self.signals.publish(&SyncSignal::CacheReplayed);
        }
    }

    fn mark_network_synced(&self) {
        let first = self.status.send_if_modified(|s| {
            let first = !s.network_synced;
            s.network_synced = true;
            first
        });
        if first {
            log::info!("Room {} synced with relay", self.room);
            self.signals.publish(&SyncSignal::NetworkSynced);
        }
    }
}

/// An open room.
pub struct Session {
    room: RoomId,
    identity: UserIdentity,
    document: Arc<SharedDocument>,
    title: EditorReconciler,
    body: EditorReconciler,
    versions: Arc<VersionManager>,
    access: Arc<AccessGate>,
    chat: ChatChannel,
    awareness: Arc<AwarenessTable>,
    presence: PresenceAggregator,
    transport: Arc<dyn Transport>,
    shared: Arc<SessionShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    destroyed: AtomicBool,
}

impl Session {
    /// Open `room` with the system clock and SHA-256 password hashing.
    ///
    /// Must be called inside a tokio runtime. Returns at once; see the
    /// module docs for the sync signals.
    pub fn open(
        room: RoomId,
        identity: UserIdentity,
        transport: Arc<dyn Transport>,
        cache: Option<Arc<dyn LocalCache>>,
        config: SessionConfig,
    ) -> Self {
        Self::open_with(room, identity, transport, cache, config, SessionServices::default())
    }

    pub fn open_with(
        room: RoomId,
        identity: UserIdentity,
        transport: Arc<dyn Transport>,
        cache: Option<Arc<dyn LocalCache>>,
        config: SessionConfig,
        services: SessionServices,
    ) -> Self {
        log::info!("Opening session for room {room} as {}", identity.name);
        let replica_id = transport.replica_id();
        let document = Arc::new(SharedDocument::new());

        let title = EditorReconciler::new(
            document.clone(),
            TextField::Title,
            EditorOptions {
                max_length: config.title_max_length,
                strategy: config.diff_strategy,
            },
        );
        let body = EditorReconciler::new(
            document.clone(),
            TextField::Body,
            EditorOptions {
                max_length: config.body_max_length,
                strategy: config.diff_strategy,
            },
        );
        let versions = Arc::new(VersionManager::new(document.clone(), services.clock.clone()));
        let access = Arc::new(AccessGate::new(document.clone(), services.hasher.clone()));
        let chat = ChatChannel::new(document.clone(), services.clock.clone(), replica_id.to_string());

        let awareness = Arc::new(AwarenessTable::new(replica_id));
        let presence = PresenceAggregator::new(awareness.clone());
        awareness.set_local_state(Some(AwarenessState::with_user(
            identity.name.clone(),
            identity.color.clone(),
        )));

        let (status, _) = watch::channel(SessionStatus::initial(cache.is_some()));
        let shared = Arc::new(SessionShared {
            room: room.as_str().to_string(),
            status,
            signals: EventBus::new(),
            cache: Mutex::new(cache),
            compaction_threshold: config.cache_compaction_threshold.max(1),
        });

        let forward = {
            let shared = shared.clone();
            let transport = transport.clone();
            let weak_doc = Arc::downgrade(&document);
            document.subscribe(move |event| {
                let DocumentEvent::Updated { update, origin } = event else {
                    return;
                };
                if *origin != ChangeOrigin::Cache {
                    shared.persist(&weak_doc, update);
                }
                if origin.is_local() {
                    if let Err(e) = transport.send(Outbound::Update(update.to_vec())) {
                        log::debug!("Update not sent ({e}); the next sync handshake carries it");
                    }
                }
            })
        };

        let driver = tokio::spawn(drive(
            DriverContext {
                shared: shared.clone(),
                document: document.clone(),
                awareness: awareness.clone(),
                transport: transport.clone(),
                info: PeerInfo::new(replica_id, identity.name.clone(), identity.color.clone()),
            },
        ));
        let timers = tokio::spawn(run_timers(
            config,
            shared.clone(),
            versions.clone(),
            access.clone(),
            awareness.clone(),
            transport.clone(),
        ));

        Self {
            room,
            identity,
            document,
            title,
            body,
            versions,
            access,
            chat,
            awareness,
            presence,
            transport,
            shared,
            tasks: Mutex::new(vec![driver, timers]),
            subscriptions: Mutex::new(vec![forward]),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn replica_id(&self) -> uuid::Uuid {
        self.awareness.local_id()
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.document
    }

    pub fn title(&self) -> &EditorReconciler {
        &self.title
    }

    pub fn body(&self) -> &EditorReconciler {
        &self.body
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn access(&self) -> &AccessGate {
        &self.access
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    pub fn awareness(&self) -> &Arc<AwarenessTable> {
        &self.awareness
    }

    pub fn presence(&self) -> &PresenceAggregator {
        &self.presence
    }

    pub fn presence_list(&self) -> Vec<PresenceUser> {
        self.presence.users()
    }

    pub fn unread_chat_count(&self) -> usize {
        self.chat.unread_count()
    }

    /// Send a chat message as this session's user.
    pub fn send_chat(&self, text: &str) -> Result<Option<ChatMessage>, SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        Ok(self
            .chat
            .send(text, &self.identity.name, &self.identity.color)?)
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        self.status().is_synced()
    }

    /// `None` until shared state is known, so a protected room is never
    /// briefly reported as open.
    pub fn access_state(&self) -> Option<AccessState> {
        self.status()
            .is_state_known()
            .then(|| self.access.state())
    }

    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on_synced<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncSignal) + Send + Sync + 'static,
    {
        self.shared.signals.subscribe(handler)
    }

    /// Wait until `predicate` holds for the status.
    pub async fn wait_for<F>(&self, predicate: F) -> SessionStatus
    where
        F: Fn(&SessionStatus) -> bool,
    {
        let mut rx = self.shared.status.subscribe();
        match rx.wait_for(|s| predicate(s)).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Wait for the first relay sync with a live connection.
    pub async fn synced(&self) -> SessionStatus {
        self.wait_for(SessionStatus::is_synced).await
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear down: stop tasks and handlers, withdraw presence, disconnect,
    /// close the cache. The document is closed too, so later edits fail
    /// with [`DocumentError::Closed`]. Safe to call more than once.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Destroying session for room {}", self.room);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.subscriptions.lock().clear();
        self.document.close();

        let removal = self.awareness.set_local_state(None);
        let _ = self.transport.send(Outbound::Awareness {
            clock: removal.clock,
            state: None,
        });
        self.transport.disconnect().await;
        self.awareness.clear_remote();

        let cache = self.shared.cache.lock().take();
        if let Some(cache) = cache {
            if let Err(e) = cache.flush() {
                log::warn!("Failed to flush local cache for room {}: {e}", self.room);
            }
        }
        self.awareness.clear_listeners();
        self.shared.signals.clear();
        self.shared.set_connection(ConnectionState::Disconnected);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

struct DriverContext {
    shared: Arc<SessionShared>,
    document: Arc<SharedDocument>,
    awareness: Arc<AwarenessTable>,
    transport: Arc<dyn Transport>,
    info: PeerInfo,
}

/// Cache replay, then connect and pump transport events.
async fn drive(ctx: DriverContext) {
    replay_cache(&ctx);

    let mut events = match ctx
        .transport
        .connect(ctx.shared.room.clone(), ctx.info.clone())
        .await
    {
        Ok(events) => events,
        Err(e) => {
            log::warn!("Failed to connect room {}: {e}", ctx.shared.room);
            ctx.shared.set_connection(ConnectionState::Disconnected);
            return;
        }
    };

    while let Some(event) = events.recv().await {
        handle_event(&ctx, event);
    }
    ctx.shared.set_connection(ctx.transport.state());
}

fn replay_cache(ctx: &DriverContext) {
    let Some(cache) = ctx.shared.cache() else {
        ctx.shared.mark_cache_replayed(false);
        return;
    };
    match cache.load(&ctx.shared.room) {
        Ok(entries) => {
            let mut applied = 0usize;
            for entry in &entries {
                match ctx.document.apply_update(entry, ChangeOrigin::Cache) {
                    Ok(()) => applied += 1,
                    Err(e) => log::warn!("Skipping unreadable cache entry for room {}: {e}", ctx.shared.room),
                }
            }
            log::info!("Replayed {applied}/{} cached updates for room {}", entries.len(), ctx.shared.room);
            ctx.shared.mark_cache_replayed(applied > 0);
        }
        Err(e) => {
            ctx.shared.disable_cache(&e);
            ctx.shared.mark_cache_replayed(false);
        }
    }
}

fn handle_event(ctx: &DriverContext, event: TransportEvent) {
    match event {
        TransportEvent::Connected => {
            log::info!("Connected to relay for room {}", ctx.shared.room);
            ctx.shared.set_connection(ConnectionState::Connected);
            send(ctx, Outbound::SyncRequest(ctx.document.state_vector()));
            if let Some(renewed) = ctx.awareness.renew_local() {
                send(
                    ctx,
                    Outbound::Awareness {
                        clock: renewed.clock,
                        state: renewed.state,
                    },
                );
            }
        }
        TransportEvent::Disconnected => {
            log::info!("Disconnected from relay for room {}", ctx.shared.room);
            ctx.shared.set_connection(ctx.transport.state());
            ctx.awareness.clear_remote();
        }
        TransportEvent::SyncResponse(diff) => {
            match ctx.document.apply_update(&diff, ChangeOrigin::Remote) {
                Ok(()) => ctx.shared.mark_network_synced(),
                Err(e) => log::warn!("Failed to apply sync response: {e}"),
            }
        }
        TransportEvent::SyncRequest(remote_sv) => match ctx.document.encode_diff(&remote_sv) {
            Ok(diff) if diff != EMPTY_UPDATE => send(ctx, Outbound::Update(diff)),
            Ok(_) => {}
            Err(e) => log::warn!("Bad state vector from relay: {e}"),
        },
        TransportEvent::Update(update) => {
            if let Err(e) = ctx.document.apply_update(&update, ChangeOrigin::Remote) {
                log::warn!("Failed to apply remote update: {e}");
            }
        }
        TransportEvent::Awareness { peer, clock, state } => {
            ctx.awareness.apply_remote(peer, clock, state, Instant::now());
        }
        TransportEvent::PeerJoined(info) => {
            log::debug!("{} joined room {}", info.name, ctx.shared.room);
        }
        TransportEvent::PeerLeft(peer) => {
            ctx.awareness.remove_remote(peer);
        }
    }
}

fn send(ctx: &DriverContext, message: Outbound) {
    if let Err(e) = ctx.transport.send(message) {
        log::debug!("Dropped outbound message: {e}");
    }
}

/// Auto-save and awareness heartbeat.
async fn run_timers(
    config: SessionConfig,
    shared: Arc<SessionShared>,
    versions: Arc<VersionManager>,
    access: Arc<AccessGate>,
    awareness: Arc<AwarenessTable>,
    transport: Arc<dyn Transport>,
) {
    let start = tokio::time::Instant::now();
    let initial = tokio::time::sleep(config.initial_snapshot_delay);
    tokio::pin!(initial);
    let mut initial_done = false;
    let mut auto_save =
        tokio::time::interval_at(start + config.auto_save_interval, config.auto_save_interval);
    let mut heartbeat =
        tokio::time::interval_at(start + config.awareness_heartbeat, config.awareness_heartbeat);

    let try_capture = |reason: &str| {
        let status = *shared.status.borrow();
        if !status.is_state_known() || access.state() == AccessState::Locked {
            return;
        }
        match versions.auto_capture() {
            Ok(Some(version)) => log::info!("Captured {reason} version {} of room {}", version.id, shared.room),
            Ok(None) => {}
            Err(e) => log::warn!("Failed to capture version: {e}"),
        }
    };

    loop {
        tokio::select! {
            _ = &mut initial, if !initial_done => {
                initial_done = true;
                try_capture("initial");
            }
            _ = auto_save.tick() => try_capture("auto-saved"),
            _ = heartbeat.tick() => {
                if transport.state() == ConnectionState::Connected {
                    if let Some(renewed) = awareness.renew_local() {
                        let _ = transport.send(Outbound::Awareness {
                            clock: renewed.clock,
                            state: renewed.state,
                        });
                    }
                }
                awareness.expire(Instant::now(), config.awareness_timeout);
            }
        }
    }
}

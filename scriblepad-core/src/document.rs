//! The replicated document behind a room.
//!
//! ```text
//!            ┌──────────────── SharedDocument ────────────────┐
//!  local ──► │ title    : Text      body  : Text              │ ──► Updated{bytes}
//!  writers   │ metadata : Map<str,str>                        │      (transport, cache)
//!            │ versions : Array<Version>   chatMessages : Array<ChatMessage>
//!  remote ─► │                                                │ ──► TextChanged / MetadataChanged /
//!  updates   └────────────────────────────────────────────────┘     VersionsChanged / ChatAppended
//! ```
//!
//! Every mutation runs inside exactly one engine transaction, so observers
//! never see a half-applied change. Events are published after the
//! transaction commits and after the internal lock is released; handlers are
//! free to read the document again.
//!
//! Container names match the wire layout shared with every other replica.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Text,
    TextRef, Transact, TransactionMut, Update,
};

use crate::diff::{DiffStrategy, TextEdit};
use crate::error::DocumentError;
use crate::events::{EventBus, Subscription};

pub const TITLE_TEXT: &str = "title";
pub const BODY_TEXT: &str = "content";
pub const METADATA_MAP: &str = "metadata";
pub const VERSIONS_ARRAY: &str = "versions";
pub const CHAT_ARRAY: &str = "chatMessages";

/// One of the two replicated text containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextField {
    Title,
    Body,
}

impl TextField {
    pub fn container_name(self) -> &'static str {
        match self {
            TextField::Title => TITLE_TEXT,
            TextField::Body => BODY_TEXT,
        }
    }
}

/// One of the two append-only replicated lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Versions,
    Chat,
}

/// Identifies a local writer so it can recognise the echo of its own edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginId(u64);

/// Where a committed change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Made on this replica by the writer holding the id.
    Local(OriginId),
    /// Received from another replica through the transport.
    Remote,
    /// Replayed from the local durable cache.
    Cache,
}

impl ChangeOrigin {
    pub fn is_local(&self) -> bool {
        matches!(self, ChangeOrigin::Local(_))
    }
}

/// Change notifications published by [`SharedDocument`].
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    /// A text container now holds `value`.
    TextChanged {
        field: TextField,
        value: String,
        origin: ChangeOrigin,
    },
    /// A metadata key was set (`Some`) or removed (`None`).
    MetadataChanged {
        key: String,
        value: Option<String>,
        origin: ChangeOrigin,
    },
    /// The version history changed; it now holds `len` entries.
    VersionsChanged { len: usize, origin: ChangeOrigin },
    /// `added` messages were appended to the chat log.
    ChatAppended {
        len: usize,
        added: usize,
        origin: ChangeOrigin,
    },
    /// Encoded update for one committed transaction.
    Updated {
        update: Arc<Vec<u8>>,
        origin: ChangeOrigin,
    },
}

struct Containers {
    title: TextRef,
    body: TextRef,
    metadata: MapRef,
    versions: ArrayRef,
    chat: ArrayRef,
}

impl Containers {
    fn text(&self, field: TextField) -> &TextRef {
        match field {
            TextField::Title => &self.title,
            TextField::Body => &self.body,
        }
    }

    fn list(&self, kind: ListKind) -> &ArrayRef {
        match kind {
            ListKind::Versions => &self.versions,
            ListKind::Chat => &self.chat,
        }
    }
}

/// Observable summary of all containers, compared before and after each
/// transaction to derive change events.
#[derive(Debug, Clone, PartialEq, Default)]
struct Digest {
    title: String,
    body: String,
    metadata: BTreeMap<String, String>,
    versions_len: u32,
    versions_tail: Option<String>,
    chat_len: u32,
}

struct Inner {
    doc: Doc,
    containers: Containers,
}

impl Inner {
    fn digest(&self) -> Digest {
        let txn = self.doc.transact();
        let c = &self.containers;
        let metadata = c
            .metadata
            .iter(&txn)
            .filter_map(|(k, v)| out_string(&v).map(|s| (k.to_string(), s)))
            .collect();
        let versions_len = c.versions.len(&txn);
        let versions_tail = versions_len
            .checked_sub(1)
            .and_then(|last| c.versions.get(&txn, last))
            .and_then(|out| out_record(&out).and_then(|r| record_str(&r, "id")));
        Digest {
            title: c.title.get_string(&txn),
            body: c.body.get_string(&txn),
            metadata,
            versions_len,
            versions_tail,
            chat_len: c.chat.len(&txn),
        }
    }
}

/// Handle to one room's replicated state.
///
/// Shared by reference (`Arc<SharedDocument>`) between the editors, the
/// version manager, the access gate, the chat channel and the session.
pub struct SharedDocument {
    inner: Mutex<Inner>,
    events: EventBus<DocumentEvent>,
    next_origin: AtomicU64,
    closed: AtomicBool,
}

impl SharedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let containers = Containers {
            title: doc.get_or_insert_text(TITLE_TEXT),
            body: doc.get_or_insert_text(BODY_TEXT),
            metadata: doc.get_or_insert_map(METADATA_MAP),
            versions: doc.get_or_insert_array(VERSIONS_ARRAY),
            chat: doc.get_or_insert_array(CHAT_ARRAY),
        };
        Self {
            inner: Mutex::new(Inner { doc, containers }),
            events: EventBus::new(),
            next_origin: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate an origin id for a new local writer.
    pub fn new_origin(&self) -> OriginId {
        OriginId(self.next_origin.fetch_add(1, Ordering::Relaxed))
    }

    pub fn events(&self) -> &EventBus<DocumentEvent> {
        &self.events
    }

    /// Refuse further writes and unregister every observer. Reads and
    /// encoding keep working. Writes after this fail with
    /// [`DocumentError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.clear();
            log::debug!("Document closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shorthand for `events().subscribe(..)`.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DocumentEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn text(&self, field: TextField) -> String {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        inner.containers.text(field).get_string(&txn)
    }

    /// Length of a text container in characters.
    pub fn text_len(&self, field: TextField) -> usize {
        self.text(field).chars().count()
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        inner
            .containers
            .metadata
            .get(&txn, key)
            .and_then(|v| out_string(&v))
    }

    /// Entries of a list in append order, as stored records.
    pub fn entries(&self, kind: ListKind) -> Vec<HashMap<String, Any>> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        inner
            .containers
            .list(kind)
            .iter(&txn)
            .filter_map(|out| out_record(&out))
            .collect()
    }

    pub fn entry_count(&self, kind: ListKind) -> usize {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        inner.containers.list(kind).len(&txn) as usize
    }

    // ─── Local mutations ──────────────────────────────────────────────

    /// Make a text container equal to `value`.
    ///
    /// The diff is taken against the container's value inside the
    /// transaction. Returns `false` when nothing changed.
    pub fn set_text(
        &self,
        field: TextField,
        value: &str,
        strategy: DiffStrategy,
        origin: OriginId,
    ) -> Result<bool, DocumentError> {
        self.transact(ChangeOrigin::Local(origin), |txn, c| {
            Ok(splice_to(txn, c.text(field), value, strategy))
        })
    }

    /// Apply a splice computed against a (possibly stale) local buffer.
    ///
    /// The span is clamped to the container's current length, so remote
    /// text that arrived after the buffer was read survives. Returns the
    /// container's value after the edit.
    pub fn apply_text_edit(
        &self,
        field: TextField,
        edit: &TextEdit,
        origin: OriginId,
    ) -> Result<String, DocumentError> {
        self.transact(ChangeOrigin::Local(origin), |txn, c| {
            let text = c.text(field);
            let current = text.get_string(&*txn);
            let (start, len) = edit.byte_span(&current);
            if len > 0 {
                text.remove_range(txn, start as u32, len as u32);
            }
            if !edit.insert.is_empty() {
                text.insert(txn, start as u32, &edit.insert);
            }
            Ok(text.get_string(&*txn))
        })
    }

    /// Overwrite both title and body in one transaction.
    pub fn replace_texts(
        &self,
        title: &str,
        body: &str,
        strategy: DiffStrategy,
        origin: OriginId,
    ) -> Result<(), DocumentError> {
        self.transact(ChangeOrigin::Local(origin), |txn, c| {
            splice_to(txn, &c.title, title, strategy);
            splice_to(txn, &c.body, body, strategy);
            Ok(())
        })
    }

    pub fn set_metadata(
        &self,
        key: &str,
        value: &str,
        origin: OriginId,
    ) -> Result<(), DocumentError> {
        self.transact(ChangeOrigin::Local(origin), |txn, c| {
            c.metadata.insert(txn, key, Any::String(value.into()));
            Ok(())
        })
    }

    /// Delete a metadata key. Returns whether it was present.
    pub fn remove_metadata(&self, key: &str, origin: OriginId) -> Result<bool, DocumentError> {
        self.transact(ChangeOrigin::Local(origin), |txn, c| {
            Ok(c.metadata.remove(txn, key).is_some())
        })
    }

    /// Append a record to a list, then evict from the head until at most
    /// `cap` entries remain. Both happen in the same transaction.
    pub fn append_entry(
        &self,
        kind: ListKind,
        record: HashMap<String, Any>,
        cap: Option<usize>,
        origin: OriginId,
    ) -> Result<(), DocumentError> {
        self.transact(ChangeOrigin::Local(origin), |txn, c| {
            let list = c.list(kind);
            list.push_back(txn, Any::Map(Arc::new(record)));
            if let Some(cap) = cap {
                let len = list.len(&*txn) as usize;
                if len > cap {
                    list.remove_range(txn, 0, (len - cap) as u32);
                }
            }
            Ok(())
        })
    }

    // ─── Replication ──────────────────────────────────────────────────

    /// Merge an encoded update received from elsewhere.
    pub fn apply_update(&self, update: &[u8], origin: ChangeOrigin) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        self.transact(origin, move |txn, _| {
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))
        })
    }

    /// Encoded state vector, for the first step of the sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full state as a single update, used for cache compaction.
    pub fn encode_state(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn transact<R, F>(&self, origin: ChangeOrigin, f: F) -> Result<R, DocumentError>
    where
        F: FnOnce(&mut TransactionMut<'_>, &Containers) -> Result<R, DocumentError>,
    {
        if self.is_closed() {
            return Err(DocumentError::Closed);
        }
        let (outcome, before, after, update) = {
            let inner = self.inner.lock();
            let before = inner.digest();
            let (outcome, update) = {
                let mut txn = inner.doc.transact_mut();
                let outcome = f(&mut txn, &inner.containers);
                let update = txn.encode_update_v1();
                (outcome, update)
            };
            let after = inner.digest();
            (outcome, before, after, update)
        };

        self.publish_changes(&before, &after, update, origin);
        outcome
    }

    fn publish_changes(&self, before: &Digest, after: &Digest, update: Vec<u8>, origin: ChangeOrigin) {
        let changed = before != after;

        if before.title != after.title {
            self.events.publish(&DocumentEvent::TextChanged {
                field: TextField::Title,
                value: after.title.clone(),
                origin,
            });
        }
        if before.body != after.body {
            self.events.publish(&DocumentEvent::TextChanged {
                field: TextField::Body,
                value: after.body.clone(),
                origin,
            });
        }

        for (key, value) in &after.metadata {
            if before.metadata.get(key) != Some(value) {
                self.events.publish(&DocumentEvent::MetadataChanged {
                    key: key.clone(),
                    value: Some(value.clone()),
                    origin,
                });
            }
        }
        for key in before.metadata.keys() {
            if !after.metadata.contains_key(key) {
                self.events.publish(&DocumentEvent::MetadataChanged {
                    key: key.clone(),
                    value: None,
                    origin,
                });
            }
        }

        if before.versions_len != after.versions_len || before.versions_tail != after.versions_tail {
            self.events.publish(&DocumentEvent::VersionsChanged {
                len: after.versions_len as usize,
                origin,
            });
        }
        if after.chat_len > before.chat_len {
            self.events.publish(&DocumentEvent::ChatAppended {
                len: after.chat_len as usize,
                added: (after.chat_len - before.chat_len) as usize,
                origin,
            });
        }

        // Remote and cached updates are always surfaced so they can be
        // persisted, even when they carry nothing new.
        if changed || !origin.is_local() {
            self.events.publish(&DocumentEvent::Updated {
                update: Arc::new(update),
                origin,
            });
        }
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn splice_to(txn: &mut TransactionMut<'_>, text: &TextRef, value: &str, strategy: DiffStrategy) -> bool {
    let current = text.get_string(&*txn);
    let Some(edit) = TextEdit::between(&current, value, strategy) else {
        return false;
    };
    let (start, len) = edit.byte_span(&current);
    if len > 0 {
        text.remove_range(txn, start as u32, len as u32);
    }
    if !edit.insert.is_empty() {
        text.insert(txn, start as u32, &edit.insert);
    }
    true
}

fn out_string(out: &Out) -> Option<String> {
    match out {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn out_record(out: &Out) -> Option<HashMap<String, Any>> {
    match out {
        Out::Any(Any::Map(map)) => Some(map.as_ref().clone()),
        _ => None,
    }
}

/// String field of a stored record.
pub fn record_str(record: &HashMap<String, Any>, key: &str) -> Option<String> {
    match record.get(key) {
        Some(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// Integer field of a stored record. Numbers written by other replicas may
/// arrive as floats.
pub fn record_i64(record: &HashMap<String, Any>, key: &str) -> Option<i64> {
    match record.get(key) {
        Some(Any::Number(n)) => Some(*n as i64),
        Some(Any::BigInt(n)) => Some(*n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_events(doc: &SharedDocument) -> (Arc<Mutex<Vec<DocumentEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = doc.subscribe(move |e| sink.lock().push(e.clone()));
        (seen, sub)
    }

    fn record(id: &str) -> HashMap<String, Any> {
        let mut r = HashMap::new();
        r.insert("id".to_string(), Any::String(id.into()));
        r
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = SharedDocument::new();
        assert_eq!(doc.text(TextField::Title), "");
        assert_eq!(doc.text(TextField::Body), "");
        assert!(doc.metadata("passwordHash").is_none());
        assert_eq!(doc.entry_count(ListKind::Versions), 0);
        assert_eq!(doc.entry_count(ListKind::Chat), 0);
    }

    #[test]
    fn test_set_text_publishes_local_change_and_update() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        let (seen, _sub) = collect_events(&doc);

        assert!(doc.set_text(TextField::Body, "hello", DiffStrategy::Minimal, origin).unwrap());
        assert_eq!(doc.text(TextField::Body), "hello");

        let events = seen.lock();
        assert!(events.contains(&DocumentEvent::TextChanged {
            field: TextField::Body,
            value: "hello".into(),
            origin: ChangeOrigin::Local(origin),
        }));
        assert!(events.iter().any(|e| matches!(e, DocumentEvent::Updated { .. })));
    }

    #[test]
    fn test_set_text_unchanged_is_silent() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        doc.set_text(TextField::Title, "same", DiffStrategy::Minimal, origin).unwrap();

        let (seen, _sub) = collect_events(&doc);
        assert!(!doc.set_text(TextField::Title, "same", DiffStrategy::Minimal, origin).unwrap());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_origins_are_distinct() {
        let doc = SharedDocument::new();
        assert_ne!(doc.new_origin(), doc.new_origin());
    }

    #[test]
    fn test_remote_update_converges_with_remote_origin() {
        let a = SharedDocument::new();
        let b = SharedDocument::new();
        let origin = a.new_origin();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let _sub = a.subscribe(move |e| {
            if let DocumentEvent::Updated { update, .. } = e {
                sink.lock().push(update.clone());
            }
        });

        a.set_text(TextField::Title, "Plans", DiffStrategy::Minimal, origin).unwrap();
        a.set_metadata("passwordHash", "h", origin).unwrap();

        let (seen, _sub_b) = collect_events(&b);
        for u in updates.lock().iter() {
            b.apply_update(u, ChangeOrigin::Remote).unwrap();
        }

        assert_eq!(b.text(TextField::Title), "Plans");
        assert_eq!(b.metadata("passwordHash").as_deref(), Some("h"));
        assert!(seen.lock().iter().any(|e| matches!(
            e,
            DocumentEvent::TextChanged { origin: ChangeOrigin::Remote, .. }
        )));
    }

    #[test]
    fn test_apply_garbage_update_fails_without_mutation() {
        let doc = SharedDocument::new();
        let (seen, _sub) = collect_events(&doc);
        assert!(doc.apply_update(&[0xFF, 0xFF, 0xFF], ChangeOrigin::Remote).is_err());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let a = SharedDocument::new();
        let b = SharedDocument::new();
        let oa = a.new_origin();
        let ob = b.new_origin();
        a.set_text(TextField::Body, "from a", DiffStrategy::Minimal, oa).unwrap();
        b.set_text(TextField::Title, "from b", DiffStrategy::Minimal, ob).unwrap();

        let diff_for_b = a.encode_diff(&b.state_vector()).unwrap();
        let diff_for_a = b.encode_diff(&a.state_vector()).unwrap();
        b.apply_update(&diff_for_b, ChangeOrigin::Remote).unwrap();
        a.apply_update(&diff_for_a, ChangeOrigin::Remote).unwrap();

        for doc in [&a, &b] {
            assert_eq!(doc.text(TextField::Body), "from a");
            assert_eq!(doc.text(TextField::Title), "from b");
        }
    }

    #[test]
    fn test_encode_state_restores_fresh_replica() {
        let a = SharedDocument::new();
        let origin = a.new_origin();
        a.replace_texts("T", "B", DiffStrategy::Minimal, origin).unwrap();
        a.append_entry(ListKind::Chat, record("m1"), None, origin).unwrap();

        let b = SharedDocument::new();
        b.apply_update(&a.encode_state(), ChangeOrigin::Cache).unwrap();
        assert_eq!(b.text(TextField::Title), "T");
        assert_eq!(b.text(TextField::Body), "B");
        assert_eq!(b.entry_count(ListKind::Chat), 1);
    }

    #[test]
    fn test_replace_texts_is_one_update() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        let (seen, _sub) = collect_events(&doc);

        doc.replace_texts("Title", "Body", DiffStrategy::Minimal, origin).unwrap();

        let events = seen.lock();
        let updates = events
            .iter()
            .filter(|e| matches!(e, DocumentEvent::Updated { .. }))
            .count();
        assert_eq!(updates, 1);
    }

    #[test]
    fn test_append_entry_evicts_from_head() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        for i in 0..5 {
            doc.append_entry(ListKind::Versions, record(&format!("v{i}")), Some(3), origin)
                .unwrap();
        }
        let ids: Vec<String> = doc
            .entries(ListKind::Versions)
            .iter()
            .filter_map(|r| record_str(r, "id"))
            .collect();
        assert_eq!(ids, vec!["v2", "v3", "v4"]);
    }

    #[test]
    fn test_versions_change_detected_at_cap() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        doc.append_entry(ListKind::Versions, record("a"), Some(1), origin).unwrap();

        let (seen, _sub) = collect_events(&doc);
        doc.append_entry(ListKind::Versions, record("b"), Some(1), origin).unwrap();
        assert!(seen
            .lock()
            .iter()
            .any(|e| matches!(e, DocumentEvent::VersionsChanged { len: 1, .. })));
    }

    #[test]
    fn test_metadata_remove_publishes_none() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        doc.set_metadata("k", "v", origin).unwrap();

        let (seen, _sub) = collect_events(&doc);
        assert!(doc.remove_metadata("k", origin).unwrap());
        assert!(!doc.remove_metadata("k", origin).unwrap());
        assert!(seen.lock().contains(&DocumentEvent::MetadataChanged {
            key: "k".into(),
            value: None,
            origin: ChangeOrigin::Local(origin),
        }));
    }

    #[test]
    fn test_apply_text_edit_keeps_concurrent_remote_text() {
        let local = SharedDocument::new();
        let remote = SharedDocument::new();
        let lo = local.new_origin();
        let ro = remote.new_origin();

        local.set_text(TextField::Body, "hello world", DiffStrategy::Minimal, lo).unwrap();
        remote
            .apply_update(&local.encode_state(), ChangeOrigin::Remote)
            .unwrap();

        // Remote prepends while the local user appends "!" to a stale buffer.
        remote.set_text(TextField::Body, ">> hello world", DiffStrategy::Minimal, ro).unwrap();
        let edit = crate::diff::minimal_edit("hello world", "hello world!");
        local.apply_text_edit(TextField::Body, &edit, lo).unwrap();

        let to_local = remote.encode_diff(&local.state_vector()).unwrap();
        let to_remote = local.encode_diff(&remote.state_vector()).unwrap();
        local.apply_update(&to_local, ChangeOrigin::Remote).unwrap();
        remote.apply_update(&to_remote, ChangeOrigin::Remote).unwrap();

        assert_eq!(local.text(TextField::Body), remote.text(TextField::Body));
        assert_eq!(local.text(TextField::Body), ">> hello world!");
    }

    #[test]
    fn test_multibyte_text_edits() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        doc.set_text(TextField::Body, "naïve café", DiffStrategy::Minimal, origin).unwrap();
        doc.set_text(TextField::Body, "naïve crème café", DiffStrategy::Minimal, origin).unwrap();
        assert_eq!(doc.text(TextField::Body), "naïve crème café");
        assert_eq!(doc.text_len(TextField::Body), 16);
    }

    #[test]
    fn test_record_field_helpers() {
        let mut r = HashMap::new();
        r.insert("n".to_string(), Any::Number(42.0));
        r.insert("b".to_string(), Any::BigInt(7));
        r.insert("s".to_string(), Any::String("x".into()));
        assert_eq!(record_i64(&r, "n"), Some(42));
        assert_eq!(record_i64(&r, "b"), Some(7));
        assert_eq!(record_str(&r, "s").as_deref(), Some("x"));
        assert_eq!(record_str(&r, "n"), None);
    }

    #[test]
    fn test_close_rejects_writes_and_drops_observers() {
        let doc = SharedDocument::new();
        let origin = doc.new_origin();
        doc.set_text(TextField::Body, "kept", DiffStrategy::Minimal, origin)
            .unwrap();
        let (seen, _sub) = collect_events(&doc);

        doc.close();
        assert!(doc.is_closed());
        assert_eq!(doc.events().subscriber_count(), 0);
        assert_eq!(
            doc.set_text(TextField::Body, "lost", DiffStrategy::Minimal, origin),
            Err(DocumentError::Closed)
        );
        assert_eq!(doc.set_metadata("k", "v", origin), Err(DocumentError::Closed));
        assert_eq!(
            doc.append_entry(ListKind::Chat, record("a"), None, origin),
            Err(DocumentError::Closed)
        );

        let other = SharedDocument::new();
        other
            .set_text(TextField::Title, "remote", DiffStrategy::Minimal, other.new_origin())
            .unwrap();
        assert_eq!(
            doc.apply_update(&other.encode_state(), ChangeOrigin::Remote),
            Err(DocumentError::Closed)
        );

        assert_eq!(doc.text(TextField::Body), "kept");
        assert!(!doc.encode_state().is_empty());
        assert!(seen.lock().is_empty());
    }
}

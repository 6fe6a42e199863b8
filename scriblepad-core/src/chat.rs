//! Append-only chat log with a local unread counter.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use yrs::Any;

use crate::clock::{format_clock_time, relative_time, Clock};
use crate::document::{record_i64, record_str, DocumentEvent, ListKind, OriginId, SharedDocument};
use crate::error::DocumentError;
use crate::events::{EventBus, Subscription};
use crate::room::short_id;

const MESSAGE_ID_LENGTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ChatMessage {
    fn to_record(&self) -> HashMap<String, Any> {
        HashMap::from([
            ("id".to_string(), Any::String(self.id.as_str().into())),
            ("userId".to_string(), Any::String(self.user_id.as_str().into())),
            ("userName".to_string(), Any::String(self.user_name.as_str().into())),
            ("userColor".to_string(), Any::String(self.user_color.as_str().into())),
            ("text".to_string(), Any::String(self.text.as_str().into())),
            ("timestamp".to_string(), Any::Number(self.timestamp as f64)),
        ])
    }

    fn from_record(record: &HashMap<String, Any>) -> Option<Self> {
        Some(Self {
            id: record_str(record, "id")?,
            user_id: record_str(record, "userId").unwrap_or_default(),
            user_name: record_str(record, "userName").unwrap_or_default(),
            user_color: record_str(record, "userColor").unwrap_or_default(),
            text: record_str(record, "text")?,
            timestamp: record_i64(record, "timestamp").unwrap_or_default(),
        })
    }

    /// `HH:MM` in local time.
    pub fn clock_time(&self) -> String {
        format_clock_time(self.timestamp)
    }

    pub fn relative_time(&self, now_millis: i64) -> String {
        relative_time(self.timestamp, now_millis)
    }
}

/// Unread bookkeeping, local to this replica.
#[derive(Debug, Default)]
struct UnreadState {
    panel_open: bool,
    /// Log length the user has seen.
    last_seen: usize,
    unread: usize,
}

impl UnreadState {
    /// Apply a new log length; returns the unread count if it changed.
    fn observe(&mut self, len: usize) -> Option<usize> {
        let next = if self.panel_open {
            self.last_seen = len;
            0
        } else {
            len.saturating_sub(self.last_seen)
        };
        (next != self.unread).then(|| {
            self.unread = next;
            next
        })
    }
}

pub struct ChatChannel {
    document: Arc<SharedDocument>,
    clock: Arc<dyn Clock>,
    origin: OriginId,
    /// Sender id stamped on every message from this replica.
    user_id: String,
    unread: Arc<Mutex<UnreadState>>,
    unread_changes: EventBus<usize>,
    _subscription: Subscription,
}

impl ChatChannel {
    pub fn new(document: Arc<SharedDocument>, clock: Arc<dyn Clock>, user_id: impl Into<String>) -> Self {
        let origin = document.new_origin();
        let unread = Arc::new(Mutex::new(UnreadState::default()));
        let unread_changes: EventBus<usize> = EventBus::new();

        let sub_unread = unread.clone();
        let sub_changes = unread_changes.clone();
        let subscription = document.subscribe(move |event| {
            let DocumentEvent::ChatAppended { len, .. } = event else {
                return;
            };
            let changed = sub_unread.lock().observe(*len);
            if let Some(count) = changed {
                sub_changes.publish(&count);
            }
        });

        Self {
            document,
            clock,
            origin,
            user_id: user_id.into(),
            unread,
            unread_changes,
            _subscription: subscription,
        }
    }

    /// Append a message. Whitespace is trimmed; an empty message is dropped
    /// and `None` returned.
    pub fn send(
        &self,
        text: &str,
        user_name: &str,
        user_color: &str,
    ) -> Result<Option<ChatMessage>, DocumentError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let message = ChatMessage {
            id: short_id(MESSAGE_ID_LENGTH),
            user_id: self.user_id.clone(),
            user_name: user_name.to_string(),
            user_color: user_color.to_string(),
            text: text.to_string(),
            timestamp: self.clock.now_millis(),
        };

        {
            // Our own message is seen by definition.
            let mut unread = self.unread.lock();
            if !unread.panel_open {
                unread.last_seen += 1;
            }
        }
        self.document
            .append_entry(ListKind::Chat, message.to_record(), None, self.origin)?;
        log::debug!("Sent chat message {}", message.id);
        Ok(Some(message))
    }

    /// Messages oldest first.
    pub fn list(&self) -> Vec<ChatMessage> {
        self.document
            .entries(ListKind::Chat)
            .iter()
            .filter_map(ChatMessage::from_record)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.document.entry_count(ListKind::Chat)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_panel_open(&self) -> bool {
        self.unread.lock().panel_open
    }

    /// Mark everything read and keep it read while the panel stays open.
    pub fn open_panel(&self) {
        let len = self.len();
        let changed = {
            let mut unread = self.unread.lock();
            unread.panel_open = true;
            unread.observe(len)
        };
        if let Some(count) = changed {
            self.unread_changes.publish(&count);
        }
    }

    pub fn close_panel(&self) {
        self.unread.lock().panel_open = false;
    }

    pub fn unread_count(&self) -> usize {
        self.unread.lock().unread
    }

    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on_unread_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        self.unread_changes.subscribe(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::document::ChangeOrigin;

    fn channel(doc: &Arc<SharedDocument>, user: &str) -> ChatChannel {
        ChatChannel::new(doc.clone(), Arc::new(ManualClock::new(1_000)), user)
    }

    fn deliver(from: &SharedDocument, to: &SharedDocument) {
        let diff = from.encode_diff(&to.state_vector()).unwrap();
        to.apply_update(&diff, ChangeOrigin::Remote).unwrap();
    }

    #[test]
    fn test_send_and_list() {
        let doc = Arc::new(SharedDocument::new());
        let chat = channel(&doc, "me");

        let sent = chat.send("  hi  ", "Fox", "#111").unwrap().unwrap();
        let list = chat.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0], sent);
        assert_eq!(list[0].text, "hi");
        assert_eq!(list[0].user_name, "Fox");
        assert_eq!(list[0].user_color, "#111");
        assert_eq!(list[0].user_id, "me");
        assert_eq!(list[0].timestamp, 1_000);
    }

    #[test]
    fn test_blank_messages_are_dropped() {
        let doc = Arc::new(SharedDocument::new());
        let chat = channel(&doc, "me");
        assert!(chat.send("", "Fox", "#111").unwrap().is_none());
        assert!(chat.send(" \n\t ", "Fox", "#111").unwrap().is_none());
        assert!(chat.is_empty());
    }

    #[test]
    fn test_messages_keep_append_order() {
        let doc = Arc::new(SharedDocument::new());
        let chat = channel(&doc, "me");
        for text in ["one", "two", "three"] {
            chat.send(text, "Fox", "#111").unwrap();
        }
        let texts: Vec<String> = chat.list().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_remote_appends_count_as_unread() {
        let mine = Arc::new(SharedDocument::new());
        let theirs = Arc::new(SharedDocument::new());
        let chat = channel(&mine, "me");
        let remote_chat = channel(&theirs, "them");

        for text in ["a", "b", "c"] {
            remote_chat.send(text, "Owl", "#222").unwrap();
            deliver(&theirs, &mine);
        }
        assert_eq!(chat.unread_count(), 3);

        chat.open_panel();
        assert_eq!(chat.unread_count(), 0);

        // Messages arriving while open stay read.
        remote_chat.send("d", "Owl", "#222").unwrap();
        deliver(&theirs, &mine);
        assert_eq!(chat.unread_count(), 0);

        chat.close_panel();
        remote_chat.send("e", "Owl", "#222").unwrap();
        deliver(&theirs, &mine);
        assert_eq!(chat.unread_count(), 1);
    }

    #[test]
    fn test_own_messages_are_not_unread() {
        let doc = Arc::new(SharedDocument::new());
        let chat = channel(&doc, "me");
        chat.send("note to self", "Fox", "#111").unwrap();
        assert_eq!(chat.unread_count(), 0);
    }

    #[test]
    fn test_unread_notifications() {
        let mine = Arc::new(SharedDocument::new());
        let theirs = Arc::new(SharedDocument::new());
        let chat = channel(&mine, "me");
        let remote_chat = channel(&theirs, "them");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = chat.on_unread_change(move |n| sink.lock().push(*n));

        remote_chat.send("ping", "Owl", "#222").unwrap();
        deliver(&theirs, &mine);
        chat.open_panel();
        assert_eq!(*seen.lock(), vec![1, 0]);
    }

    #[test]
    fn test_counter_is_per_replica() {
        let a = Arc::new(SharedDocument::new());
        let b = Arc::new(SharedDocument::new());
        let chat_a = channel(&a, "a");
        let chat_b = channel(&b, "b");

        chat_a.open_panel();
        chat_a.send("hello", "Fox", "#111").unwrap();
        deliver(&a, &b);

        assert_eq!(chat_a.unread_count(), 0);
        assert_eq!(chat_b.unread_count(), 1);
        assert_eq!(chat_b.list()[0].user_id, "a");
    }
}

//! Two-way binding between a local editable buffer and one text container.
//!
//! ```text
//!   keystroke ──► local_edit() ──► splice(buffer → new value) ──► SharedDocument
//!                                                                     │
//!   buffer ◄── overwrite + clamp caret ◄── TextChanged (other origin) ◄┘
//! ```
//!
//! The reconciler tags its own writes with a private [`OriginId`] and skips
//! the change events carrying it, so a local edit is never applied twice.
//! Every other change (remote replica, cache replay, version restore)
//! overwrites the buffer. After any settle point the buffer equals the
//! container.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::diff::{DiffStrategy, TextEdit};
use crate::document::{ChangeOrigin, DocumentEvent, OriginId, SharedDocument, TextField};
use crate::error::DocumentError;
use crate::events::{EventBus, Subscription};

/// Default cap on the title length, in characters.
pub const TITLE_MAX_LENGTH: usize = 20;

/// What the user sees: text plus a selection, both in characters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalBuffer {
    pub text: String,
    pub selection_start: usize,
    pub selection_end: usize,
}

impl LocalBuffer {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Pull both selection ends back inside the text.
    fn clamp_selection(&mut self) {
        let len = self.char_len();
        self.selection_start = self.selection_start.min(len);
        self.selection_end = self.selection_end.min(len);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditorOptions {
    /// Longest accepted value in characters; longer input is truncated.
    pub max_length: Option<usize>,
    pub strategy: DiffStrategy,
}

impl EditorOptions {
    pub fn title() -> Self {
        Self {
            max_length: Some(TITLE_MAX_LENGTH),
            strategy: DiffStrategy::Minimal,
        }
    }

    pub fn body() -> Self {
        Self::default()
    }
}

/// Result of feeding a local edit through the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    /// Whether the container was mutated.
    pub applied: bool,
    /// Whether the input was cut down to `max_length`.
    pub truncated: bool,
    /// Buffer (and container) value after the edit.
    pub value: String,
}

pub struct EditorReconciler {
    document: Arc<SharedDocument>,
    field: TextField,
    origin: OriginId,
    options: EditorOptions,
    buffer: Arc<Mutex<LocalBuffer>>,
    changes: EventBus<LocalBuffer>,
    _subscription: Subscription,
}

impl EditorReconciler {
    /// Bind a fresh buffer to `field`, starting from the container's value.
    pub fn new(document: Arc<SharedDocument>, field: TextField, options: EditorOptions) -> Self {
        let origin = document.new_origin();
        let buffer = Arc::new(Mutex::new(LocalBuffer {
            text: document.text(field),
            ..LocalBuffer::default()
        }));
        let changes: EventBus<LocalBuffer> = EventBus::new();

        let sub_buffer = buffer.clone();
        let sub_changes = changes.clone();
        let subscription = document.subscribe(move |event| {
            let DocumentEvent::TextChanged { field: changed, value, origin: from } = event else {
                return;
            };
            if *changed != field || *from == ChangeOrigin::Local(origin) {
                return;
            }
            if let Some(snapshot) = overwrite(&sub_buffer, value) {
                sub_changes.publish(&snapshot);
            }
        });

        Self {
            document,
            field,
            origin,
            options,
            buffer,
            changes,
            _subscription: subscription,
        }
    }

    pub fn field(&self) -> TextField {
        self.field
    }

    pub fn options(&self) -> EditorOptions {
        self.options
    }

    /// Snapshot of the local buffer.
    pub fn buffer(&self) -> LocalBuffer {
        self.buffer.lock().clone()
    }

    pub fn text(&self) -> String {
        self.buffer.lock().text.clone()
    }

    /// Feed the buffer's new full value after a keystroke.
    ///
    /// The change is computed against the buffer the user was looking at and
    /// applied to the container as one splice, so remote text that arrived in
    /// between is kept. `selection` is the caret after the edit; when omitted
    /// the caret is placed after the inserted text.
    pub fn local_edit(
        &self,
        new_value: &str,
        selection: Option<(usize, usize)>,
    ) -> Result<EditOutcome, DocumentError> {
        let (value, truncated) = truncate(new_value, self.options.max_length);
        let base = self.buffer.lock().text.clone();

        let Some(edit) = TextEdit::between(&base, &value, self.options.strategy) else {
            let mut buffer = self.buffer.lock();
            if let Some((start, end)) = selection {
                buffer.selection_start = start;
                buffer.selection_end = end;
                buffer.clamp_selection();
            }
            return Ok(EditOutcome {
                applied: false,
                truncated,
                value: buffer.text.clone(),
            });
        };

        let result = self.document.apply_text_edit(self.field, &edit, self.origin)?;
        let caret = edit.index + edit.insert.chars().count();
        let (start, end) = selection.unwrap_or((caret, caret));

        let snapshot = {
            let mut buffer = self.buffer.lock();
            buffer.text = result.clone();
            buffer.selection_start = start;
            buffer.selection_end = end;
            buffer.clamp_selection();
            buffer.clone()
        };
        if truncated || snapshot.text != value {
            // The caller's value was adjusted; it needs to re-render.
            self.changes.publish(&snapshot);
        }

        Ok(EditOutcome {
            applied: true,
            truncated,
            value: result,
        })
    }

    /// Move the caret or selection without editing.
    pub fn set_selection(&self, start: usize, end: usize) {
        let mut buffer = self.buffer.lock();
        buffer.selection_start = start;
        buffer.selection_end = end;
        buffer.clamp_selection();
    }

    /// Force the buffer to the container's current value.
    pub fn resync(&self) {
        let value = self.document.text(self.field);
        if let Some(snapshot) = overwrite(&self.buffer, &value) {
            self.changes.publish(&snapshot);
        }
    }

    /// Character count of the container.
    pub fn char_count(&self) -> usize {
        char_count(&self.document.text(self.field))
    }

    /// Word count of the container.
    pub fn word_count(&self) -> usize {
        word_count(&self.document.text(self.field))
    }

    /// Notified whenever the buffer stops matching what the caller last
    /// typed: another writer changed the container, or input was truncated.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn on_buffer_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&LocalBuffer) + Send + Sync + 'static,
    {
        self.changes.subscribe(handler)
    }
}

fn overwrite(buffer: &Mutex<LocalBuffer>, value: &str) -> Option<LocalBuffer> {
    let mut buffer = buffer.lock();
    if buffer.text == value {
        return None;
    }
    buffer.text = value.to_string();
    buffer.clamp_selection();
    Some(buffer.clone())
}

fn truncate(value: &str, max_length: Option<usize>) -> (String, bool) {
    match max_length {
        Some(max) if value.chars().count() > max => (value.chars().take(max).collect(), true),
        _ => (value.to_string(), false),
    }
}

pub fn char_count(text: &str) -> usize {
    text.chars().count()
}

/// Non-empty whitespace-delimited tokens.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

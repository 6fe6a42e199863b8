//! Edit scripts between two strings.
//!
//! Local edits are turned into a single splice (one delete plus one insert)
//! found by trimming the common prefix and suffix. The replicated text then
//! receives only the characters that actually changed, so a concurrent
//! remote insert elsewhere in the text merges around it.
//!
//! All positions in a [`TextEdit`] count Unicode scalar values, which is what
//! a caret index counts. Conversion to the byte offsets used by the
//! replicated text happens at the last moment in [`TextEdit::byte_span`].

/// How a new buffer value is turned into container operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffStrategy {
    /// Common-prefix/common-suffix splice.
    #[default]
    Minimal,
    /// Delete the whole old value and insert the whole new one.
    ReplaceAll,
}

/// Replace `remove` characters starting at `index` with `insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub index: usize,
    pub remove: usize,
    pub insert: String,
}

impl TextEdit {
    /// Compute the edit turning `old` into `new`, or `None` if they are equal.
    pub fn between(old: &str, new: &str, strategy: DiffStrategy) -> Option<TextEdit> {
        if old == new {
            return None;
        }
        match strategy {
            DiffStrategy::Minimal => Some(minimal_edit(old, new)),
            DiffStrategy::ReplaceAll => Some(TextEdit {
                index: 0,
                remove: old.chars().count(),
                insert: new.to_string(),
            }),
        }
    }

    /// Apply this edit to `text`, clamping the span to its length.
    pub fn apply(&self, text: &str) -> String {
        let (start, len) = self.byte_span(text);
        let mut out = String::with_capacity(text.len() - len + self.insert.len());
        out.push_str(&text[..start]);
        out.push_str(&self.insert);
        out.push_str(&text[start + len..]);
        out
    }

    /// Byte offset and byte length of the removed span within `text`.
    ///
    /// The span is clamped so it never runs past the end of `text`, which is
    /// what lets an edit computed against a stale buffer still land on the
    /// current container value.
    pub fn byte_span(&self, text: &str) -> (usize, usize) {
        let start = char_to_byte(text, self.index);
        let end = char_to_byte(&text[start..], self.remove) + start;
        (start, end - start)
    }

    /// Number of characters the edited text gains (or loses, if negative).
    pub fn length_delta(&self) -> isize {
        self.insert.chars().count() as isize - self.remove as isize
    }
}

/// Smallest single splice turning `old` into `new`.
pub fn minimal_edit(old: &str, new: &str) -> TextEdit {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();

    // Suffix must not overlap the prefix in either string.
    let suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    TextEdit {
        index: prefix,
        remove: old_chars.len() - prefix - suffix,
        insert: new_chars[prefix..new_chars.len() - suffix].iter().collect(),
    }
}

/// Byte offset of the `chars`-th character, or the string length past the end.
pub(crate) fn char_to_byte(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(byte, _)| byte)
        .unwrap_or(text.len())
}

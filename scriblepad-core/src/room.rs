//! Room identifiers and short random tokens.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a generated room id.
pub const ROOM_ID_LENGTH: usize = 8;
/// Longest room id accepted from a link.
pub const MAX_ROOM_ID_LENGTH: usize = 64;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const URL_SAFE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("room id is empty")]
    Empty,
    #[error("room id is longer than {max} characters")]
    TooLong { max: usize },
    #[error("room id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Opaque, URL-safe room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Fresh 8-character alphanumeric id.
    pub fn generate() -> Self {
        Self(random_token(&mut rand::rng(), ROOM_ID_LENGTH, ALPHANUMERIC))
    }

    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        if raw.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if raw.chars().count() > MAX_ROOM_ID_LENGTH {
            return Err(RoomIdError::TooLong {
                max: MAX_ROOM_ID_LENGTH,
            });
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !c.is_ascii() || !URL_SAFE.contains(&(*c as u8)))
        {
            return Err(RoomIdError::InvalidChar(bad));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the room page, `/r/<id>`.
    pub fn path(&self) -> String {
        format!("/r/{}", self.0)
    }

    /// Shareable link under `origin` (e.g. `https://pad.example`).
    pub fn url(&self, origin: &str) -> String {
        format!("{}{}", origin.trim_end_matches('/'), self.path())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Random URL-safe token, used for record ids.
pub fn short_id(len: usize) -> String {
    random_token(&mut rand::rng(), len, URL_SAFE)
}

fn random_token<R: Rng + ?Sized>(rng: &mut R, len: usize, alphabet: &[u8]) -> String {
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_room_id_shape() {
        let id = RoomId::generate();
        assert_eq!(id.as_str().len(), ROOM_ID_LENGTH);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(RoomId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert_eq!(RoomId::parse(""), Err(RoomIdError::Empty));
        assert_eq!(RoomId::parse("a/b"), Err(RoomIdError::InvalidChar('/')));
        assert_eq!(RoomId::parse("café"), Err(RoomIdError::InvalidChar('é')));
        let long = "x".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(matches!(RoomId::parse(&long), Err(RoomIdError::TooLong { .. })));
    }

    #[test]
    fn test_parse_accepts_url_safe() {
        let id: RoomId = "team_notes-2".parse().unwrap();
        assert_eq!(id.to_string(), "team_notes-2");
    }

    #[test]
    fn test_paths_and_urls() {
        let id = RoomId::parse("abc123XY").unwrap();
        assert_eq!(id.path(), "/r/abc123XY");
        assert_eq!(id.url("https://pad.example/"), "https://pad.example/r/abc123XY");
    }

    #[test]
    fn test_short_id() {
        let a = short_id(10);
        assert_eq!(a.len(), 10);
        assert!(a.bytes().all(|b| URL_SAFE.contains(&b)));
    }

    #[test]
    fn test_serde_validates() {
        let ok: RoomId = serde_json::from_str("\"room1\"").unwrap();
        assert_eq!(ok.as_str(), "room1");
        assert!(serde_json::from_str::<RoomId>("\"bad room\"").is_err());
    }
}

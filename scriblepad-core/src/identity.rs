//! Per-session display identity: a friendly name and a bright color.
//!
//! The identity lives only as long as the [`IdentityStore`] that issued it.
//! It is attached to presence and chat, never to the replicated document.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Key the serialized identity is kept under in session-scoped storage.
pub const IDENTITY_STORAGE_KEY: &str = "scriblepad-identity";

const ADJECTIVES: [&str; 20] = [
    "Happy", "Clever", "Swift", "Gentle", "Brave", "Calm", "Eager", "Jolly", "Kind", "Lively",
    "Merry", "Noble", "Proud", "Quick", "Witty", "Zesty", "Cosmic", "Stellar", "Lunar", "Solar",
];

const NOUNS: [&str; 20] = [
    "Panda", "Eagle", "Tiger", "Dolphin", "Fox", "Wolf", "Bear", "Lion", "Hawk", "Owl",
    "Falcon", "Phoenix", "Dragon", "Unicorn", "Griffin", "Pegasus", "Comet", "Nebula", "Star",
    "Moon",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            name: generate_user_name(rng),
            color: generate_user_color(rng),
        }
    }

    fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && is_hex_color(&self.color)
    }
}

/// `<Adjective><Noun>`, e.g. `CosmicOwl`.
pub fn generate_user_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    format!("{adjective}{noun}")
}

/// Random hue at high saturation and medium lightness, as `#rrggbb`.
pub fn generate_user_color<R: Rng + ?Sized>(rng: &mut R) -> String {
    let h = rng.random_range(0.0f32..1.0);
    let s = rng.random_range(0.65f32..0.9);
    let l = rng.random_range(0.5f32..0.6);
    let (r, g, b) = hsl_to_rgb(h, s, l);
    format!("#{:02x}{:02x}{:02x}", to_byte(r), to_byte(g), to_byte(b))
}

fn to_byte(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Session-scoped identity storage.
///
/// Hands out the same identity for its whole lifetime. Construct one per
/// application session and pass it to whatever needs the user's name.
#[derive(Debug, Default)]
pub struct IdentityStore {
    current: Mutex<Option<UserIdentity>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a previously serialized identity. Missing or malformed
    /// data is discarded and a fresh identity is generated on first use.
    pub fn from_stored(stored: Option<&str>) -> Self {
        let current = stored
            .and_then(|raw| match serde_json::from_str::<UserIdentity>(raw) {
                Ok(identity) if identity.is_valid() => Some(identity),
                Ok(_) => None,
                Err(e) => {
                    log::debug!("Discarding stored identity: {e}");
                    None
                }
            });
        Self {
            current: Mutex::new(current),
        }
    }

    pub fn get_or_create(&self) -> UserIdentity {
        self.current
            .lock()
            .get_or_insert_with(UserIdentity::generate)
            .clone()
    }

    /// Serialized form for session storage, if an identity was issued.
    pub fn to_stored(&self) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .and_then(|identity| serde_json::to_string(identity).ok())
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_name_uses_word_lists() {
        for _ in 0..50 {
            let name = generate_user_name(&mut rand::rng());
            let adjective = ADJECTIVES.iter().find(|a| name.starts_with(**a));
            let adjective = adjective.expect("name starts with a known adjective");
            assert!(NOUNS.contains(&&name[adjective.len()..]));
        }
    }

    #[test]
    fn test_generated_color_is_hex() {
        for _ in 0..50 {
            let color = generate_user_color(&mut rand::rng());
            assert!(is_hex_color(&color), "bad color {color}");
        }
    }

    #[test]
    fn test_generated_color_is_bright() {
        for _ in 0..50 {
            let color = generate_user_color(&mut rand::rng());
            let max = (1..7)
                .step_by(2)
                .map(|i| u8::from_str_radix(&color[i..i + 2], 16).unwrap())
                .max()
                .unwrap();
            assert!(max >= 200, "{color} is too dark");
        }
    }

    #[test]
    fn test_hsl_primaries() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-5 && g.abs() < 1e-5 && b.abs() < 1e-5);
        let (r, g, b) = hsl_to_rgb(0.0, 0.0, 0.3);
        assert_eq!((r, g, b), (0.3, 0.3, 0.3));
    }

    #[test]
    fn test_store_is_stable_for_session() {
        let store = IdentityStore::new();
        let first = store.get_or_create();
        assert_eq!(store.get_or_create(), first);

        store.clear();
        // A new session may or may not collide; it just has to be valid.
        assert!(store.get_or_create().is_valid());
    }

    #[test]
    fn test_store_round_trips_through_storage() {
        let store = IdentityStore::new();
        let identity = store.get_or_create();
        let stored = store.to_stored().unwrap();

        let restored = IdentityStore::from_stored(Some(&stored));
        assert_eq!(restored.get_or_create(), identity);
    }

    #[test]
    fn test_store_regenerates_on_bad_data() {
        for raw in ["not json", r##"{"name":"","color":"#ffffff"}"##, r#"{"name":"A","color":"red"}"#] {
            let store = IdentityStore::from_stored(Some(raw));
            assert!(store.to_stored().is_none());
            assert!(store.get_or_create().is_valid());
        }
    }
}

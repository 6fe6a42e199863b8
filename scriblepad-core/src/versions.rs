//! Version history: point-in-time copies of title and body.
//!
//! Versions are appended to the replicated `versions` list and evicted from
//! its head once more than [`MAX_VERSIONS`] are stored. Capture and eviction
//! share one transaction, as do the two text writes of a restore.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use yrs::Any;

use crate::clock::{format_version_time, Clock};
use crate::diff::DiffStrategy;
use crate::document::{record_i64, record_str, ListKind, OriginId, SharedDocument, TextField};
use crate::error::DocumentError;
use crate::room::short_id;

/// Retention cap of the history list.
pub const MAX_VERSIONS: usize = 50;
/// How often an unlocked session re-evaluates [`has_significant_change`].
pub const AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const VERSION_ID_LENGTH: usize = 10;

/// Below this body length an empty-titled document is not worth keeping.
const MIN_INITIAL_BODY: usize = 10;
/// Body growth or shrinkage that always warrants a snapshot.
const LARGE_BODY_DELTA: usize = 50;
/// Smallest length change that counts for a rewritten body.
const SMALL_BODY_DELTA: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub title_snapshot: String,
    pub body_snapshot: String,
}

impl Version {
    fn to_record(&self) -> HashMap<String, Any> {
        HashMap::from([
            ("id".to_string(), Any::String(self.id.as_str().into())),
            ("timestamp".to_string(), Any::Number(self.timestamp as f64)),
            ("titleSnapshot".to_string(), Any::String(self.title_snapshot.as_str().into())),
            ("contentSnapshot".to_string(), Any::String(self.body_snapshot.as_str().into())),
        ])
    }

    fn from_record(record: &HashMap<String, Any>) -> Option<Self> {
        Some(Self {
            id: record_str(record, "id")?,
            timestamp: record_i64(record, "timestamp").unwrap_or_default(),
            title_snapshot: record_str(record, "titleSnapshot").unwrap_or_default(),
            body_snapshot: record_str(record, "contentSnapshot").unwrap_or_default(),
        })
    }

    /// `Today at HH:MM` style label relative to `now_millis`.
    pub fn label(&self, now_millis: i64) -> String {
        format_version_time(self.timestamp, now_millis)
    }
}

/// Whether the current title/body differ enough from the latest version to
/// be worth a new snapshot.
///
/// 1. No versions yet: only once the title is non-empty or the body is
///    longer than 10 characters.
/// 2. Any title change.
/// 3. A body length change of more than 50 characters.
/// 4. A changed body whose length moved by more than 10 characters.
pub fn has_significant_change(title: &str, body: &str, last: Option<&Version>) -> bool {
    let body_len = body.chars().count();
    let Some(last) = last else {
        return !title.is_empty() || body_len > MIN_INITIAL_BODY;
    };

    if title != last.title_snapshot {
        return true;
    }

    let delta = body_len.abs_diff(last.body_snapshot.chars().count());
    if delta > LARGE_BODY_DELTA {
        return true;
    }

    body != last.body_snapshot && delta > SMALL_BODY_DELTA
}

/// Captures, lists and restores versions of one document.
pub struct VersionManager {
    document: Arc<SharedDocument>,
    clock: Arc<dyn Clock>,
    origin: OriginId,
}

impl VersionManager {
    pub fn new(document: Arc<SharedDocument>, clock: Arc<dyn Clock>) -> Self {
        let origin = document.new_origin();
        Self {
            document,
            clock,
            origin,
        }
    }

    /// Snapshot the current title and body unconditionally.
    pub fn capture(&self) -> Result<Version, DocumentError> {
        let version = Version {
            id: short_id(VERSION_ID_LENGTH),
            timestamp: self.clock.now_millis(),
            title_snapshot: self.document.text(TextField::Title),
            body_snapshot: self.document.text(TextField::Body),
        };
        self.document.append_entry(
            ListKind::Versions,
            version.to_record(),
            Some(MAX_VERSIONS),
            self.origin,
        )?;
        log::info!("Captured version {} ({} chars)", version.id, version.body_snapshot.len());
        Ok(version)
    }

    /// Versions in append order, oldest first.
    pub fn list(&self) -> Vec<Version> {
        self.document
            .entries(ListKind::Versions)
            .iter()
            .filter_map(Version::from_record)
            .collect()
    }

    pub fn list_newest_first(&self) -> Vec<Version> {
        let mut versions = self.list();
        versions.reverse();
        versions
    }

    pub fn latest(&self) -> Option<Version> {
        self.list().pop()
    }

    pub fn find(&self, id: &str) -> Option<Version> {
        self.list().into_iter().find(|v| v.id == id)
    }

    /// Overwrite title and body with the snapshot, atomically.
    pub fn restore(&self, version: &Version) -> Result<(), DocumentError> {
        self.document.replace_texts(
            &version.title_snapshot,
            &version.body_snapshot,
            DiffStrategy::Minimal,
            self.origin,
        )?;
        log::info!("Restored version {}", version.id);
        Ok(())
    }

    /// Restore by id. Returns the restored version, or `None` if no stored
    /// version has that id.
    pub fn restore_by_id(&self, id: &str) -> Result<Option<Version>, DocumentError> {
        match self.find(id) {
            Some(version) => {
                self.restore(&version)?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    pub fn should_capture(&self) -> bool {
        has_significant_change(
            &self.document.text(TextField::Title),
            &self.document.text(TextField::Body),
            self.latest().as_ref(),
        )
    }

    /// Capture only if [`has_significant_change`] says so.
    pub fn auto_capture(&self) -> Result<Option<Version>, DocumentError> {
        if self.should_capture() {
            self.capture().map(Some)
        } else {
            log::debug!("Skipping auto-capture: no significant change");
            Ok(None)
        }
    }
}

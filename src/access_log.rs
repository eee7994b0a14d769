//! Per-key "last successfully fetched" timestamps.
//!
//! Kept in its own JSON document, separate from the URL registry, so a
//! registry file can be shared without leaking access history:
//!
//! ```json
//! {
//!   "cassini.iss.ring_summary": "2023-03-15T14:30:22",
//!   "published_registry_check": "2026-10-18T09:12:00"
//! }
//! ```
//!
//! Names that are not index keys are markers for housekeeping jobs, such as
//! the last check of a published registry. They never show up in
//! [`AccessLogDocument::entries`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::error::{IndexError, Result};
use crate::fsio;
use crate::key::PathKey;
use crate::timestamp;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessLogDocument {
    entries: BTreeMap<String, String>,
}

impl AccessLogDocument {
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let entries: BTreeMap<String, String> =
            serde_json::from_str(text).map_err(|e| IndexError::corrupt(origin, e))?;
        Ok(Self { entries })
    }

    pub fn to_json_string(&self) -> String {
        // Serializing a map of strings cannot fail.
        let mut out = serde_json::to_string_pretty(&self.entries).unwrap_or_else(|_| "{}".into());
        out.push('\n');
        out
    }

    /// `None` when the key was never recorded or its value is unreadable.
    pub fn get_timestamp(&self, key: &PathKey) -> Option<NaiveDateTime> {
        let raw = self.entries.get(&key.to_string())?;
        let parsed = timestamp::parse(raw);
        if parsed.is_none() {
            warn!(key = %key, value = %raw, "ignoring unparseable access timestamp");
        }
        parsed
    }

    /// Unconditional overwrite. Returns whether the stored text changed.
    pub fn set_timestamp(&mut self, key: &PathKey, at: NaiveDateTime) -> bool {
        let formatted = timestamp::format(&at);
        self.entries.insert(key.to_string(), formatted.clone()) != Some(formatted)
    }

    /// Monotonic write: an older `at` never replaces a newer stored value
    /// unless `force` is set.
    pub fn record_access(&mut self, key: &PathKey, at: NaiveDateTime, force: bool) -> bool {
        if !force {
            if let Some(current) = self.get_timestamp(key) {
                if current >= at {
                    return false;
                }
            }
        }
        self.set_timestamp(key, at)
    }

    pub fn get_marker(&self, name: &str) -> Option<NaiveDateTime> {
        self.entries.get(name).and_then(|raw| timestamp::parse(raw))
    }

    pub fn set_marker(&mut self, name: &str, at: NaiveDateTime) -> bool {
        let formatted = timestamp::format(&at);
        self.entries.insert(name.to_string(), formatted.clone()) != Some(formatted)
    }

    pub fn remove(&mut self, key: &PathKey) -> Option<NaiveDateTime> {
        self.entries
            .remove(&key.to_string())
            .and_then(|raw| timestamp::parse(&raw))
    }

    /// All readable entries, sorted by key.
    pub fn entries(&self) -> Vec<(PathKey, NaiveDateTime)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| Some((PathKey::parse(k).ok()?, timestamp::parse(v)?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An [`AccessLogDocument`] bound to its backing file.
#[derive(Debug)]
pub struct AccessLog {
    path: PathBuf,
    document: AccessLogDocument,
}

impl AccessLog {
    /// Load the log at `path`. A missing file is an empty log and is not
    /// created until the first write.
    pub fn open(path: &Path) -> Result<Self> {
        let document = if path.exists() {
            debug!(path = %path.display(), "reading access log");
            let text =
                std::fs::read_to_string(path).map_err(|e| IndexError::read(path, e))?;
            AccessLogDocument::parse(&text, path)?
        } else {
            AccessLogDocument::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            document,
        })
    }

    pub fn reload(&mut self) -> Result<()> {
        *self = Self::open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &AccessLogDocument {
        &self.document
    }

    pub fn get_timestamp(&self, key: &PathKey) -> Option<NaiveDateTime> {
        self.document.get_timestamp(key)
    }

    pub fn entries(&self) -> Vec<(PathKey, NaiveDateTime)> {
        self.document.entries()
    }

    pub fn set_timestamp(&mut self, key: &PathKey, at: NaiveDateTime) -> Result<bool> {
        self.mutate(|doc| doc.set_timestamp(key, at))
    }

    /// Record a successful fetch of `key`'s index at `at`.
    pub fn record_access(&mut self, key: &PathKey, at: NaiveDateTime, force: bool) -> Result<bool> {
        self.mutate(|doc| doc.record_access(key, at, force))
    }

    pub fn set_marker(&mut self, name: &str, at: NaiveDateTime) -> Result<bool> {
        self.mutate(|doc| doc.set_marker(name, at))
    }

    pub fn remove(&mut self, key: &PathKey) -> Result<Option<NaiveDateTime>> {
        let mut removed = None;
        self.mutate(|doc| {
            removed = doc.remove(key);
            removed.is_some()
        })?;
        Ok(removed)
    }

    fn mutate<F>(&mut self, op: F) -> Result<bool>
    where
        F: FnOnce(&mut AccessLogDocument) -> bool,
    {
        let mut next = self.document.clone();
        if !op(&mut next) {
            return Ok(false);
        }
        fsio::write_atomic(&self.path, &next.to_json_string())?;
        self.document = next;
        Ok(true)
    }
}

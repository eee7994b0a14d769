//! Hierarchical registry of index URLs.
//!
//! The registry maps every [`PathKey`] to the URL of one index label. It is a
//! small, human-curated TOML document grouped by mission, then instrument:
//!
//! ```toml
//! # PDS index URLs, organized by mission and instrument.
//!
//! [missions]
//!
//! [missions.cassini.iss]
//! ring_summary = "https://pds-rings.seti.org/holdings/metadata/COISS_2xxx/COISS_2999/COISS_2999_ring_summary.lbl"
//!
//! [missions.mro.ctx]
//! # Latest URL discovered on 2026-10-18
//! edr = { url = "https://planetarydata.jpl.nasa.gov/img/data/mro/ctx/mrox_2103/index/cumindex.lbl", discovered_at = "2026-10-18T09:12:00" }
//! ```
//!
//! Static entries are plain strings. Entries written by discovery are inline
//! tables carrying `url` and `discovered_at`; that shape is what marks an
//! entry as dynamic in the persisted document.
//!
//! The document is edited through `toml_edit`, so comments, blank lines and
//! ordering written by humans survive every rewrite. Listings follow the
//! document's own order rather than sorting.
//!
//! [`RegistryDocument`] is the pure in-memory projection; [`UrlRegistry`]
//! binds it to a file and rewrites the whole file atomically on every
//! mutation.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use toml_edit::{value, DocumentMut, InlineTable, Item, Table, TableLike, Value};
use tracing::{debug, info};

use crate::error::{IndexError, Result};
use crate::fsio;
use crate::key::{PathKey, MISSIONS_ROOT};
use crate::timestamp;

const DEFAULT_DOCUMENT: &str = "\
# PDS index URLs, organized by mission and instrument.
# Comments in this file are kept when entries are updated.

[missions]
";

const DISCOVERY_NOTE: &str = "# Latest URL discovered on ";

/// One resolved registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub key: PathKey,
    pub url: String,
    /// Set only for entries written by discovery.
    pub discovered_at: Option<NaiveDateTime>,
    pub is_dynamic: bool,
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory document
// ═══════════════════════════════════════════════════════════════════════

/// The registry document with its formatting, independent of storage.
#[derive(Debug, Clone)]
pub struct RegistryDocument {
    doc: DocumentMut,
    origin: PathBuf,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            // The constant is valid TOML; fall back to an empty document anyway.
            doc: DEFAULT_DOCUMENT.parse().unwrap_or_default(),
            origin: PathBuf::from("<memory>"),
        }
    }
}

impl RegistryDocument {
    /// Parse a registry document. `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let mut doc: DocumentMut = text
            .parse()
            .map_err(|e: toml_edit::TomlError| IndexError::corrupt(origin, e.message()))?;

        match doc.get(MISSIONS_ROOT) {
            None => {
                doc.insert(MISSIONS_ROOT, Item::Table(Table::new()));
            }
            Some(item) if item.is_table_like() => {}
            Some(_) => {
                return Err(IndexError::corrupt(
                    origin,
                    format!("'{}' must be a table", MISSIONS_ROOT),
                ))
            }
        }

        Ok(Self {
            doc,
            origin: origin.to_path_buf(),
        })
    }

    pub fn to_toml_string(&self) -> String {
        self.doc.to_string()
    }

    /// Resolve the URL stored for `key`.
    pub fn get(&self, key: &PathKey) -> Result<String> {
        self.entry(key).map(|e| e.url)
    }

    pub fn entry(&self, key: &PathKey) -> Result<RegistryEntry> {
        self.instrument_table(key.mission(), key.instrument())
            .and_then(|t| t.get(key.index()))
            .and_then(|item| read_entry(key.clone(), item))
            .ok_or_else(|| IndexError::KeyNotFound(key.clone()))
    }

    pub fn contains(&self, key: &PathKey) -> bool {
        self.entry(key).is_ok()
    }

    /// Every entry, in document order.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut out = Vec::new();
        for mission in self.list_missions() {
            for instrument in self.list_instruments(&mission) {
                let Some(table) = self.instrument_table(&mission, &instrument) else {
                    continue;
                };
                for (index, item) in table.iter() {
                    let Ok(key) = PathKey::new(&mission, &instrument, index) else {
                        continue;
                    };
                    if let Some(entry) = read_entry(key, item) {
                        out.push(entry);
                    }
                }
            }
        }
        out
    }

    pub fn list_missions(&self) -> Vec<String> {
        self.missions()
            .map(|m| child_tables(m).collect())
            .unwrap_or_default()
    }

    pub fn list_instruments(&self, mission: &str) -> Vec<String> {
        self.mission_table(&mission.to_lowercase())
            .map(|m| child_tables(m).collect())
            .unwrap_or_default()
    }

    pub fn list_indexes(&self, mission: &str, instrument: &str) -> Vec<String> {
        self.instrument_table(&mission.to_lowercase(), &instrument.to_lowercase())
            .map(|t| {
                t.iter()
                    .filter(|(_, item)| entry_url(item).is_some())
                    .map(|(name, _)| name.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nested, human-readable listing of the whole hierarchy.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for mission in self.list_missions() {
            out.push_str(&mission);
            out.push('\n');
            let instruments = self.list_instruments(&mission);
            for (i, instrument) in instruments.iter().enumerate() {
                let last_instrument = i + 1 == instruments.len();
                let (branch, stem) = if last_instrument {
                    ("└── ", "    ")
                } else {
                    ("├── ", "│   ")
                };
                out.push_str(branch);
                out.push_str(instrument);
                out.push('\n');

                let indexes: Vec<RegistryEntry> = self
                    .list_indexes(&mission, instrument)
                    .iter()
                    .filter_map(|idx| PathKey::new(&mission, instrument, idx).ok())
                    .filter_map(|key| self.entry(&key).ok())
                    .collect();
                for (j, entry) in indexes.iter().enumerate() {
                    let leaf = if j + 1 == indexes.len() {
                        "└── "
                    } else {
                        "├── "
                    };
                    out.push_str(stem);
                    out.push_str(leaf);
                    out.push_str(&format!("{} = {}", entry.key.index(), entry.url));
                    if let Some(at) = &entry.discovered_at {
                        out.push_str(&format!(
                            "  [dynamic, discovered {}]",
                            timestamp::format(at)
                        ));
                    }
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Insert or overwrite the URL for `key`.
    ///
    /// A dynamic entry keeps its `discovered_at` and only has its `url`
    /// replaced. Returns `false` when the stored URL already equals `url`.
    pub fn set(&mut self, key: &PathKey, url: &str) -> Result<bool> {
        let origin = self.origin.clone();
        let table = self.instrument_table_mut(key)?;
        match table.get_mut(key.index()) {
            Some(item) => {
                if entry_url(item).as_deref() == Some(url) {
                    return Ok(false);
                }
                if let Some(t) = item.as_table_like_mut() {
                    match t.get_mut("url") {
                        Some(url_item) => overwrite_value(url_item, Value::from(url)),
                        None => {
                            t.insert("url", value(url));
                        }
                    }
                } else if item.is_value() {
                    overwrite_value(item, Value::from(url));
                } else {
                    return Err(IndexError::corrupt(
                        origin,
                        format!("entry '{}' is neither a URL nor a table", key),
                    ));
                }
            }
            None => {
                table.insert(key.index(), value(url));
            }
        }
        Ok(true)
    }

    /// The discovery write path: store `url` as a dynamic entry stamped `at`.
    pub fn record_discovery(&mut self, key: &PathKey, url: &str, at: NaiveDateTime) -> Result<bool> {
        if let Ok(existing) = self.entry(key) {
            if existing.url == url && existing.discovered_at == Some(at) {
                return Ok(false);
            }
        }

        let mut inline = InlineTable::new();
        inline.insert("url", Value::from(url));
        inline.insert("discovered_at", Value::from(timestamp::format(&at)));
        let fresh = Value::InlineTable(inline);

        let table = self.instrument_table_mut(key)?;
        match table.get_mut(key.index()) {
            Some(item) => overwrite_value(item, fresh),
            None => {
                table.insert(key.index(), Item::Value(fresh));
            }
        }

        if let Some(mut k) = table.key_mut(key.index()) {
            let decor = k.leaf_decor_mut();
            let kept: String = decor
                .prefix()
                .and_then(|p| p.as_str())
                .unwrap_or("")
                .lines()
                .filter(|line| !line.trim_start().starts_with(DISCOVERY_NOTE))
                .map(|line| format!("{}\n", line))
                .collect();
            decor.set_prefix(format!(
                "{}{}{}\n",
                kept,
                DISCOVERY_NOTE,
                at.format("%Y-%m-%d")
            ));
        }
        Ok(true)
    }

    /// Remove `key`, pruning instrument and mission tables left empty.
    pub fn remove(&mut self, key: &PathKey) -> Result<String> {
        let url = self.get(key)?;
        let origin = self.origin.clone();

        let missions = table_mut(self.doc.as_table_mut(), MISSIONS_ROOT, &origin)?;
        let mission = table_mut(missions, key.mission(), &origin)?;
        let instrument = table_mut(mission, key.instrument(), &origin)?;
        instrument.remove(key.index());
        let instrument_empty = instrument.is_empty();

        if instrument_empty {
            mission.remove(key.instrument());
        }
        if mission.is_empty() {
            missions.remove(key.mission());
        }
        Ok(url)
    }

    fn missions(&self) -> Option<&dyn TableLike> {
        self.doc.get(MISSIONS_ROOT).and_then(Item::as_table_like)
    }

    fn mission_table(&self, mission: &str) -> Option<&dyn TableLike> {
        self.missions()
            .and_then(|m| m.get(mission))
            .and_then(Item::as_table_like)
    }

    fn instrument_table(&self, mission: &str, instrument: &str) -> Option<&dyn TableLike> {
        self.mission_table(mission)
            .and_then(|m| m.get(instrument))
            .and_then(Item::as_table_like)
    }

    fn instrument_table_mut(&mut self, key: &PathKey) -> Result<&mut Table> {
        let origin = self.origin.clone();
        let missions = ensure_table(self.doc.as_table_mut(), MISSIONS_ROOT, false, &origin)?;
        let mission = ensure_table(missions, key.mission(), true, &origin)?;
        ensure_table(mission, key.instrument(), false, &origin)
    }
}

fn child_tables(table: &dyn TableLike) -> impl Iterator<Item = String> + '_ {
    table
        .iter()
        .filter(|(_, item)| item.is_table_like() && entry_url(item).is_none())
        .map(|(name, _)| name.to_string())
}

fn entry_url(item: &Item) -> Option<String> {
    if let Some(url) = item.as_str() {
        return Some(url.to_string());
    }
    item.as_table_like()
        .and_then(|t| t.get("url"))
        .and_then(Item::as_str)
        .map(str::to_string)
}

fn read_entry(key: PathKey, item: &Item) -> Option<RegistryEntry> {
    let url = entry_url(item)?;
    let discovered_at = item
        .as_table_like()
        .and_then(|t| t.get("discovered_at"))
        .and_then(|at| match at.as_str() {
            Some(s) => timestamp::parse(s),
            None => at
                .as_datetime()
                .and_then(|d| timestamp::parse(&d.to_string())),
        });
    Some(RegistryEntry {
        key,
        url,
        is_dynamic: discovered_at.is_some(),
        discovered_at,
    })
}

/// Replace a value in place, keeping the whitespace and comments around it.
fn overwrite_value(item: &mut Item, fresh: Value) {
    match item.as_value_mut() {
        Some(existing) => {
            let decor = existing.decor().clone();
            *existing = fresh;
            *existing.decor_mut() = decor;
        }
        None => *item = Item::Value(fresh),
    }
}

fn ensure_table<'a>(
    parent: &'a mut Table,
    name: &str,
    implicit: bool,
    origin: &Path,
) -> Result<&'a mut Table> {
    if !parent.contains_key(name) {
        let mut table = Table::new();
        table.set_implicit(implicit);
        if !implicit {
            table.decor_mut().set_prefix("\n");
        }
        parent.insert(name, Item::Table(table));
    }
    table_mut(parent, name, origin)
}

fn table_mut<'a>(parent: &'a mut Table, name: &str, origin: &Path) -> Result<&'a mut Table> {
    parent
        .get_mut(name)
        .and_then(Item::as_table_mut)
        .ok_or_else(|| IndexError::corrupt(origin, format!("'{}' must be a [table] section", name)))
}

// ═══════════════════════════════════════════════════════════════════════
// Persisted registry
// ═══════════════════════════════════════════════════════════════════════

/// A [`RegistryDocument`] bound to its backing file.
///
/// Mutations are applied to a copy, written atomically, and only then become
/// the in-memory state, so a failed write leaves both the file and this
/// value in their pre-write state.
#[derive(Debug)]
pub struct UrlRegistry {
    path: PathBuf,
    document: RegistryDocument,
    created: bool,
}

impl UrlRegistry {
    /// Load the registry at `path`, creating the default document if the file
    /// does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let created = !path.exists();
        let document = if !created {
            debug!(path = %path.display(), "reading URL registry");
            let text =
                std::fs::read_to_string(path).map_err(|e| IndexError::read(path, e))?;
            RegistryDocument::parse(&text, path)?
        } else {
            info!(path = %path.display(), "creating URL registry");
            let document = RegistryDocument {
                origin: path.to_path_buf(),
                ..RegistryDocument::default()
            };
            fsio::write_atomic(path, &document.to_toml_string())?;
            document
        };
        Ok(Self {
            path: path.to_path_buf(),
            document,
            created,
        })
    }

    /// True when [`UrlRegistry::open`] had to create the file. Cleared by
    /// [`UrlRegistry::reload`].
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// Re-read the backing file, discarding in-memory state.
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &RegistryDocument {
        &self.document
    }

    pub fn get(&self, key: &PathKey) -> Result<String> {
        self.document.get(key)
    }

    pub fn entry(&self, key: &PathKey) -> Result<RegistryEntry> {
        self.document.entry(key)
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.document.entries()
    }

    pub fn list_missions(&self) -> Vec<String> {
        self.document.list_missions()
    }

    pub fn list_instruments(&self, mission: &str) -> Vec<String> {
        self.document.list_instruments(mission)
    }

    pub fn list_indexes(&self, mission: &str, instrument: &str) -> Vec<String> {
        self.document.list_indexes(mission, instrument)
    }

    pub fn render_tree(&self) -> String {
        self.document.render_tree()
    }

    pub fn set(&mut self, key: &PathKey, url: &str) -> Result<bool> {
        let changed = self.mutate(|doc| doc.set(key, url))?;
        if changed {
            info!(key = %key, url, "registry entry set");
        }
        Ok(changed)
    }

    pub fn record_discovery(&mut self, key: &PathKey, url: &str, at: NaiveDateTime) -> Result<bool> {
        let changed = self.mutate(|doc| doc.record_discovery(key, url, at))?;
        if changed {
            info!(key = %key, url, "recorded discovered URL");
        }
        Ok(changed)
    }

    /// Store a batch of discovered URLs in one write, stamped `at`.
    ///
    /// The file is re-read first so entries edited while discovery ran are
    /// kept. Every entry gets a fresh `discovered_at`; the returned keys are
    /// the ones whose URL actually changed.
    pub fn record_discoveries<'a, I>(&mut self, found: I, at: NaiveDateTime) -> Result<Vec<PathKey>>
    where
        I: IntoIterator<Item = (&'a PathKey, &'a str)>,
    {
        self.reload()?;
        let mut changed = Vec::new();
        self.mutate(|doc| {
            let mut wrote = false;
            for (key, url) in found {
                let previous = doc.get(key).ok();
                wrote |= doc.record_discovery(key, url, at)?;
                if previous.as_deref() != Some(url) {
                    changed.push(key.clone());
                }
            }
            Ok(wrote)
        })?;
        for key in &changed {
            info!(key = %key, "recorded discovered URL");
        }
        Ok(changed)
    }

    /// Set a batch of static URLs in one write after re-reading the file.
    /// Returns the keys whose URL changed.
    pub fn set_all<'a, I>(&mut self, entries: I) -> Result<Vec<PathKey>>
    where
        I: IntoIterator<Item = (&'a PathKey, &'a str)>,
    {
        self.reload()?;
        let mut changed = Vec::new();
        self.mutate(|doc| {
            for (key, url) in entries {
                if doc.set(key, url)? {
                    changed.push(key.clone());
                }
            }
            Ok(!changed.is_empty())
        })?;
        for key in &changed {
            info!(key = %key, "registry entry set");
        }
        Ok(changed)
    }

    pub fn remove(&mut self, key: &PathKey) -> Result<String> {
        let mut removed = String::new();
        self.mutate(|doc| {
            removed = doc.remove(key)?;
            Ok(true)
        })?;
        info!(key = %key, "registry entry removed");
        Ok(removed)
    }

    fn mutate<F>(&mut self, op: F) -> Result<bool>
    where
        F: FnOnce(&mut RegistryDocument) -> Result<bool>,
    {
        let mut next = self.document.clone();
        if !op(&mut next)? {
            return Ok(false);
        }
        fsio::write_atomic(&self.path, &next.to_toml_string())?;
        self.document = next;
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════

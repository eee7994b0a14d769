//! One-shot migration from the legacy single-file configuration.
//!
//! The legacy file mixed per-index records with unrelated settings:
//!
//! ```toml
//! data_archive = "~/planetarypy_data"
//!
//! [missions.cassini.iss.ring_summary]
//! url = "https://pds-rings.seti.org/.../COISS_2999_ring_summary.lbl"
//! timestamp = "2023-03-15T14:30:22"
//! ```
//!
//! [`migrate`] splits such a document into a registry document, an access
//! log and the untouched leftover settings. Plain `missions.<m>.<i>.<idx> =
//! "url"` entries and `{ url, discovered_at }` tables are accepted as well,
//! so feeding the registry document back in changes nothing.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use toml_edit::{DocumentMut, Item, TableLike};
use tracing::{info, warn};

use crate::access_log::{AccessLog, AccessLogDocument};
use crate::catalog::Catalog;
use crate::checker::{CheckReport, CheckTarget, UpdateChecker};
use crate::discovery::Refreshed;
use crate::error::{IndexError, Result};
use crate::fsio;
use crate::key::{PathKey, MISSIONS_ROOT};
use crate::registry::{RegistryDocument, UrlRegistry};
use crate::timestamp;

/// Result of splitting a legacy document.
#[derive(Debug, Clone)]
pub struct Migration {
    pub registry: RegistryDocument,
    pub log: AccessLogDocument,
    /// Everything that was not an index record, formatting intact.
    pub leftover: DocumentMut,
    /// Keys taken from the legacy document, in document order.
    pub migrated: Vec<PathKey>,
    pub warnings: Vec<String>,
}

impl Migration {
    pub fn leftover_is_empty(&self) -> bool {
        self.leftover.as_table().is_empty()
    }
}

struct Record {
    path: Vec<String>,
    url: String,
    timestamp: Option<NaiveDateTime>,
    discovered_at: Option<NaiveDateTime>,
}

/// Split `text` into registry, access log and leftover settings.
pub fn migrate(text: &str, origin: &Path) -> Result<Migration> {
    let legacy: DocumentMut = text
        .parse()
        .map_err(|e: toml_edit::TomlError| IndexError::corrupt(origin, e.message()))?;

    let mut records = Vec::new();
    scan(legacy.as_table(), &mut Vec::new(), &mut records);

    let mut registry = RegistryDocument::default();
    let mut log = AccessLogDocument::default();
    let mut leftover = legacy.clone();
    let mut migrated: Vec<PathKey> = Vec::new();
    let mut warnings = Vec::new();

    for record in records {
        let dotted = record.path.join(".");
        let key = match PathKey::parse(&dotted) {
            Ok(key) => key,
            Err(e) => {
                let message = format!("left '{}' in place: {}", dotted, e);
                warn!("{}", message);
                warnings.push(message);
                continue;
            }
        };

        if migrated.contains(&key) {
            let message = format!("duplicate record for '{}', keeping the later one", key);
            warn!("{}", message);
            warnings.push(message);
        } else {
            migrated.push(key.clone());
        }

        match record.discovered_at {
            Some(at) => registry.record_discovery(&key, &record.url, at)?,
            None => registry.set(&key, &record.url)?,
        };
        if let Some(at) = record.timestamp {
            log.record_access(&key, at, false);
        }
        remove_path(leftover.as_table_mut(), &record.path);
    }

    Ok(Migration {
        registry,
        log,
        leftover,
        migrated,
        warnings,
    })
}

fn scan(table: &dyn TableLike, path: &mut Vec<String>, records: &mut Vec<Record>) {
    for (name, item) in table.iter() {
        path.push(name.to_string());
        if let Some(child) = item.as_table_like() {
            match child.get("url").and_then(Item::as_str) {
                Some(url) => records.push(Record {
                    path: path.clone(),
                    url: url.to_string(),
                    timestamp: child.get("timestamp").and_then(read_time),
                    discovered_at: child.get("discovered_at").and_then(read_time),
                }),
                None => scan(child, path, records),
            }
        } else if let Some(url) = item.as_str() {
            if path.len() == 4 && path[0] == MISSIONS_ROOT {
                records.push(Record {
                    path: path.clone(),
                    url: url.to_string(),
                    timestamp: None,
                    discovered_at: None,
                });
            }
        }
        path.pop();
    }
}

/// A timestamp stored either as a string or as a native TOML datetime.
fn read_time(item: &Item) -> Option<NaiveDateTime> {
    let value = item.as_value()?;
    match value.as_datetime() {
        Some(dt) => timestamp::parse(&dt.to_string()),
        None => value.as_str().and_then(timestamp::parse),
    }
}

/// Remove the item at `path`, then any tables the removal left empty.
fn remove_path(table: &mut dyn TableLike, path: &[String]) {
    match path {
        [] => {}
        [leaf] => {
            table.remove(leaf);
        }
        [head, rest @ ..] => {
            if let Some(child) = table.get_mut(head).and_then(Item::as_table_like_mut) {
                remove_path(child, rest);
                let empty = child.is_empty();
                if empty {
                    table.remove(head);
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Merging into storage
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Write leftover settings here and leave the legacy file untouched.
    pub leftover_path: Option<PathBuf>,
    /// Run discovery for the catalog and store what it finds.
    pub discover: bool,
    /// Run the update check once the stores are written.
    pub refresh: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct MigrationSummary {
    pub migrated: Vec<PathKey>,
    pub urls_written: usize,
    pub timestamps_written: usize,
    /// Where the leftover settings ended up, if they were written.
    pub leftover_written: Option<PathBuf>,
    pub discovered: Vec<PathKey>,
    pub refresh: Option<CheckReport>,
    pub warnings: Vec<String>,
}

impl MigrationSummary {
    /// Narration printed by `migrate --verbose`.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        for key in &self.migrated {
            lines.push(format!("migrated {}", key));
        }
        lines.push(format!(
            "{} record(s) found: {} URL(s) and {} timestamp(s) written",
            self.migrated.len(),
            self.urls_written,
            self.timestamps_written
        ));
        if let Some(path) = &self.leftover_written {
            lines.push(format!("leftover settings written to {}", path.display()));
        }
        for key in &self.discovered {
            lines.push(format!("discovered new URL for {}", key));
        }
        for warning in &self.warnings {
            lines.push(format!("warning: {}", warning));
        }
        let mut out = lines.join("\n");
        out.push('\n');
        if let Some(report) = &self.refresh {
            out.push_str(&report.render());
        }
        out
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Migrate the legacy file at `source` into existing stores.
///
/// URLs are written only when they differ from what is stored and access
/// times go through [`AccessLog::record_access`], so repeating a migration is
/// a no-op. Discovery and refresh are best effort: their failures become
/// warnings in the summary.
pub async fn migrate_into_storage(
    source: &Path,
    registry: &mut UrlRegistry,
    log: &mut AccessLog,
    catalog: &Catalog,
    checker: Option<&UpdateChecker>,
    options: &MigrateOptions,
) -> Result<MigrationSummary> {
    let text = std::fs::read_to_string(source).map_err(|e| IndexError::read(source, e))?;
    let migration = migrate(&text, source)?;

    let mut summary = MigrationSummary {
        migrated: migration.migrated.clone(),
        warnings: migration.warnings.clone(),
        ..MigrationSummary::default()
    };

    for entry in migration.registry.entries() {
        if registry.get(&entry.key).ok().as_deref() == Some(entry.url.as_str()) {
            continue;
        }
        let written = match entry.discovered_at {
            Some(at) => registry.record_discovery(&entry.key, &entry.url, at)?,
            None => registry.set(&entry.key, &entry.url)?,
        };
        if written {
            summary.urls_written += 1;
        }
    }

    for (key, at) in migration.log.entries() {
        if log.record_access(&key, at, false)? {
            summary.timestamps_written += 1;
        }
    }

    write_leftover(source, registry, &migration, options, &mut summary)?;

    if options.discover || options.refresh {
        match checker {
            Some(checker) => {
                if options.discover {
                    discover_into(checker, catalog, registry, &mut summary).await?;
                }
                if options.refresh {
                    let targets =
                        CheckTarget::collect(registry.document(), log.document(), catalog);
                    let report = checker.check(targets).await;
                    for failure in report.failures() {
                        summary.warn(format!(
                            "refresh failed for {}: {}",
                            failure.key, failure.message
                        ));
                    }
                    summary.refresh = Some(report);
                }
            }
            None => summary.warn("no remote access configured; skipped discovery/refresh".into()),
        }
    }

    info!(
        source = %source.display(),
        records = summary.migrated.len(),
        urls = summary.urls_written,
        timestamps = summary.timestamps_written,
        "migration finished"
    );
    Ok(summary)
}

fn write_leftover(
    source: &Path,
    registry: &UrlRegistry,
    migration: &Migration,
    options: &MigrateOptions,
    summary: &mut MigrationSummary,
) -> Result<()> {
    let text = migration.leftover.to_string();
    match &options.leftover_path {
        Some(path) => {
            fsio::write_atomic(path, &text)?;
            summary.leftover_written = Some(path.clone());
        }
        None if migration.migrated.is_empty() => {}
        None if same_file(source, registry.path()) => {
            summary.warn(format!(
                "{} is also the registry; leaving it as is",
                source.display()
            ));
        }
        None => {
            fsio::write_atomic(source, &text)?;
            summary.leftover_written = Some(source.to_path_buf());
        }
    }
    Ok(())
}

async fn discover_into(
    checker: &UpdateChecker,
    catalog: &Catalog,
    registry: &mut UrlRegistry,
    summary: &mut MigrationSummary,
) -> Result<()> {
    let refresh = checker
        .discoverer()
        .refresh_registry(registry, catalog.specs(), timestamp::now(), false)
        .await?;
    for (key, result) in &refresh.results {
        match result {
            Ok(Refreshed::Fallback { error, .. }) => {
                summary.warn(format!("discovery failed for {}: {}", key, error))
            }
            Ok(_) => {}
            Err(e) => summary.warn(format!("discovery failed for {}: {}", key, e)),
        }
    }
    summary.discovered = refresh.updated;
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

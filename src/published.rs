//! Sync with a curated registry published at a URL.
//!
//! A project can publish a registry document (same layout as the local one)
//! listing the current static URLs. [`PublishedRegistry::sync`] downloads it
//! at most once per check interval and merges it into the local registry:
//!
//! - published static entries overwrite local entries whose URL differs,
//! - keys the catalog treats as dynamic are left to discovery,
//! - local-only keys and every comment in the local file are kept.
//!
//! The time of the last check lives in the access log under
//! [`CHECK_MARKER`], so the interval holds across runs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info};

use crate::access_log::AccessLog;
use crate::catalog::Catalog;
use crate::error::Result;
use crate::key::PathKey;
use crate::registry::{RegistryDocument, UrlRegistry};
use crate::remote::{with_timeout, RemoteDocument};
use crate::timestamp;

/// Access-log marker holding the time of the last published-registry check.
pub const CHECK_MARKER: &str = "published_registry_check";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Checked within the interval; nothing was fetched.
    Skipped { last_check: NaiveDateTime },
    /// Fetched; every published entry already matched.
    UpToDate,
    /// Fetched and merged these keys.
    Updated { keys: Vec<PathKey> },
}

pub struct PublishedRegistry {
    source: Arc<dyn RemoteDocument>,
    url: String,
    interval: Duration,
    timeout: Duration,
}

impl PublishedRegistry {
    pub fn new(
        source: Arc<dyn RemoteDocument>,
        url: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            url: url.into(),
            interval,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Download the published registry and merge it, unless it was checked
    /// less than the interval ago and `force` is off.
    ///
    /// The check time is recorded before downloading, so an unreachable
    /// source is not retried until the interval passes again.
    pub async fn sync(
        &self,
        registry: &mut UrlRegistry,
        log: &mut AccessLog,
        catalog: &Catalog,
        now: NaiveDateTime,
        force: bool,
    ) -> Result<SyncOutcome> {
        log.reload()?;
        if !force {
            if let Some(last_check) = log.document().get_marker(CHECK_MARKER) {
                if timestamp::is_within(last_check, now, self.interval) {
                    debug!(url = %self.url, last_check = %last_check, "published registry checked recently");
                    return Ok(SyncOutcome::Skipped { last_check });
                }
            }
        }
        log.set_marker(CHECK_MARKER, now)?;

        info!(url = %self.url, "checking published registry");
        let text = with_timeout(
            "published registry download",
            self.timeout,
            self.source.fetch_text(&self.url),
        )
        .await?;
        let published = RegistryDocument::parse(&text, Path::new(&self.url))?;

        let keys = merge_published(registry, &published, catalog)?;
        if keys.is_empty() {
            Ok(SyncOutcome::UpToDate)
        } else {
            info!(count = keys.len(), "merged published registry entries");
            Ok(SyncOutcome::Updated { keys })
        }
    }
}

/// Copy published static URLs into `registry`. Returns the keys changed.
pub fn merge_published(
    registry: &mut UrlRegistry,
    published: &RegistryDocument,
    catalog: &Catalog,
) -> Result<Vec<PathKey>> {
    let entries: Vec<_> = published
        .entries()
        .into_iter()
        .filter(|entry| !entry.is_dynamic && !catalog.contains(&entry.key))
        .collect();
    registry.set_all(entries.iter().map(|e| (&e.key, e.url.as_str())))
}

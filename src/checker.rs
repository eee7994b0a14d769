//! Update detection across the registry.
//!
//! Two checks are composed per key:
//!
//! - **URL check** for keys with a [`DynamicIndexSpec`]: rediscover the
//!   latest URL and compare it to the stored one by string equality.
//! - **Timestamp check** for every key: ask the archive when the index was
//!   last modified and compare it to the access log. A key that was never
//!   fetched counts as updated.
//!
//! Checking never writes anything. [`CheckReport::apply_url_updates`] is the
//! separate, explicit step that persists discovered URLs.
//!
//! A key whose check cannot complete gets a [`KeyOutcome::CheckFailed`]
//! entry; the rest of the batch carries on.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::access_log::AccessLogDocument;
use crate::catalog::{Catalog, DynamicIndexSpec};
use crate::discovery::Discoverer;
use crate::error::{IndexError, Result};
use crate::key::PathKey;
use crate::registry::{RegistryDocument, UrlRegistry};
use crate::remote::{with_timeout, RemoteMetadata};
use crate::timestamp;

/// Read-only snapshot of everything needed to check one key.
#[derive(Debug, Clone)]
pub struct CheckTarget {
    pub key: PathKey,
    /// `None` for a catalog key that has never been discovered.
    pub stored_url: Option<String>,
    pub spec: Option<DynamicIndexSpec>,
    pub local_timestamp: Option<NaiveDateTime>,
}

impl CheckTarget {
    /// Every registry entry, plus catalog keys missing from the registry.
    pub fn collect(
        registry: &RegistryDocument,
        log: &AccessLogDocument,
        catalog: &Catalog,
    ) -> Vec<CheckTarget> {
        let mut targets: Vec<CheckTarget> = registry
            .entries()
            .into_iter()
            .map(|entry| CheckTarget {
                spec: catalog.get(&entry.key).cloned(),
                local_timestamp: log.get_timestamp(&entry.key),
                stored_url: Some(entry.url),
                key: entry.key,
            })
            .collect();

        for spec in catalog.specs() {
            if !registry.contains(&spec.key) {
                targets.push(CheckTarget {
                    key: spec.key.clone(),
                    stored_url: None,
                    spec: Some(spec.clone()),
                    local_timestamp: log.get_timestamp(&spec.key),
                });
            }
        }
        targets
    }

    /// Narrow `targets` to `keys`. Unknown keys are a caller error.
    pub fn select(targets: Vec<CheckTarget>, keys: &[PathKey]) -> Result<Vec<CheckTarget>> {
        if keys.is_empty() {
            return Ok(targets);
        }
        if let Some(missing) = keys.iter().find(|k| !targets.iter().any(|t| &t.key == *k)) {
            return Err(IndexError::KeyNotFound(missing.clone()));
        }
        Ok(targets
            .into_iter()
            .filter(|t| keys.contains(&t.key))
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Report types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlUpdate {
    pub previous: Option<String>,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimestampUpdate {
    /// `None` when the index was never fetched.
    pub local: Option<NaiveDateTime>,
    pub remote: NaiveDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_update: Option<UrlUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_update: Option<TimestampUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub key: PathKey,
    pub has_update: bool,
    pub details: UpdateDetails,
}

/// Why a key could not be checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailure {
    pub key: PathKey,
    /// [`IndexError::kind`] of the underlying error.
    pub kind: String,
    pub message: String,
}

impl CheckFailure {
    fn from_error(key: PathKey, err: &IndexError) -> Self {
        Self {
            key,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyOutcome {
    Checked(UpdateReport),
    CheckFailed(CheckFailure),
}

impl KeyOutcome {
    pub fn key(&self) -> &PathKey {
        match self {
            KeyOutcome::Checked(report) => &report.key,
            KeyOutcome::CheckFailed(failure) => &failure.key,
        }
    }
}

/// Per-key outcomes of one check run, ordered by key.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    outcomes: BTreeMap<PathKey, KeyOutcome>,
}

impl Serialize for CheckReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.outcomes.values())
    }
}

impl CheckReport {
    pub fn get(&self, key: &PathKey) -> Option<&KeyOutcome> {
        self.outcomes.get(key)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &KeyOutcome> {
        self.outcomes.values()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Reports with at least one update.
    pub fn updates(&self) -> impl Iterator<Item = &UpdateReport> {
        self.outcomes.values().filter_map(|o| match o {
            KeyOutcome::Checked(report) if report.has_update => Some(report),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckFailure> {
        self.outcomes.values().filter_map(|o| match o {
            KeyOutcome::CheckFailed(failure) => Some(failure),
            _ => None,
        })
    }

    /// Persist every discovered URL through the registry's discovery path.
    /// Returns the keys written. Access timestamps are left alone.
    ///
    /// The registry file is re-read first, so edits made while the check was
    /// running survive.
    pub fn apply_url_updates(
        &self,
        registry: &mut UrlRegistry,
        at: NaiveDateTime,
    ) -> Result<Vec<PathKey>> {
        let found = self.updates().filter_map(|report| {
            let update = report.details.url_update.as_ref()?;
            Some((&report.key, update.new.as_str()))
        });
        registry.record_discoveries(found, at)
    }

    /// Human-readable notifications, one block per update or failure.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for outcome in self.outcomes.values() {
            match outcome {
                KeyOutcome::Checked(report) if report.has_update => {
                    let _ = writeln!(out, "Update available: {}", report.key);
                    if let Some(url) = &report.details.url_update {
                        let _ = writeln!(
                            out,
                            "  Previous: {}",
                            url.previous.as_deref().unwrap_or("(none)")
                        );
                        let _ = writeln!(out, "  New: {}", url.new);
                    }
                    if let Some(ts) = &report.details.timestamp_update {
                        let local = ts
                            .local
                            .as_ref()
                            .map(timestamp::format)
                            .unwrap_or_else(|| "never fetched".to_string());
                        let _ = writeln!(
                            out,
                            "  Remote index newer: local {} -> remote {}",
                            local,
                            timestamp::format(&ts.remote)
                        );
                    }
                }
                KeyOutcome::Checked(_) => {}
                KeyOutcome::CheckFailed(failure) => {
                    let _ = writeln!(out, "Check failed for {}: {}", failure.key, failure.message);
                }
            }
        }
        let _ = writeln!(
            out,
            "Checked {} index(es): {} with updates, {} failed",
            self.len(),
            self.updates().count(),
            self.failures().count()
        );
        out
    }
}

impl FromIterator<KeyOutcome> for CheckReport {
    fn from_iter<I: IntoIterator<Item = KeyOutcome>>(iter: I) -> Self {
        Self {
            outcomes: iter.into_iter().map(|o| (o.key().clone(), o)).collect(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Checker
// ═══════════════════════════════════════════════════════════════════════

/// Runs update checks with bounded fan-out. Shares the discoverer's timeout
/// and concurrency limits.
#[derive(Clone)]
pub struct UpdateChecker {
    discoverer: Discoverer,
    metadata: Arc<dyn RemoteMetadata>,
}

impl UpdateChecker {
    pub fn new(discoverer: Discoverer, metadata: Arc<dyn RemoteMetadata>) -> Self {
        Self {
            discoverer,
            metadata,
        }
    }

    pub fn discoverer(&self) -> &Discoverer {
        &self.discoverer
    }

    /// Check a single key. Errors are returned as-is; [`check`](Self::check)
    /// turns them into [`KeyOutcome::CheckFailed`].
    pub async fn check_key(&self, target: &CheckTarget) -> Result<UpdateReport> {
        let mut details = UpdateDetails::default();
        let mut probe_url = target.stored_url.clone();

        if let Some(spec) = &target.spec {
            let found = self.discoverer.discover(spec).await?;
            if target.stored_url.as_deref() != Some(found.url.as_str()) {
                details.url_update = Some(UrlUpdate {
                    previous: target.stored_url.clone(),
                    new: found.url.clone(),
                });
            }
            probe_url = Some(found.url);
        }

        if let Some(url) = probe_url {
            let remote = with_timeout(
                "last-modified check",
                self.discoverer.options().timeout,
                self.metadata.last_modified(&url),
            )
            .await?;

            match remote {
                Some(remote) if target.local_timestamp.map_or(true, |local| remote > local) => {
                    details.timestamp_update = Some(TimestampUpdate {
                        local: target.local_timestamp,
                        remote,
                    });
                }
                Some(_) => {}
                None => debug!(key = %target.key, url = %url, "archive reports no modification time"),
            }
        }

        let has_update = details.url_update.is_some() || details.timestamp_update.is_some();
        Ok(UpdateReport {
            key: target.key.clone(),
            has_update,
            details,
        })
    }

    /// Check every target concurrently. The report holds exactly one outcome
    /// per distinct key.
    pub async fn check(&self, targets: Vec<CheckTarget>) -> CheckReport {
        let limit = self.discoverer.options().max_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let keys: Vec<PathKey> = targets.iter().map(|t| t.key.clone()).collect();
        let mut tasks = JoinSet::new();

        for target in targets {
            let checker = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                match checker.check_key(&target).await {
                    Ok(report) => KeyOutcome::Checked(report),
                    Err(e) => {
                        warn!(key = %target.key, error = %e, "check failed");
                        KeyOutcome::CheckFailed(CheckFailure::from_error(target.key, &e))
                    }
                }
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    outcomes.insert(outcome.key().clone(), outcome);
                }
                Err(e) => warn!(error = %e, "check task aborted"),
            }
        }

        for key in keys {
            outcomes.entry(key.clone()).or_insert_with(|| {
                KeyOutcome::CheckFailed(CheckFailure {
                    key,
                    kind: "aborted".to_string(),
                    message: "check task aborted".to_string(),
                })
            });
        }

        let report = CheckReport { outcomes };
        info!(
            checked = report.len(),
            updates = report.updates().count(),
            failed = report.failures().count(),
            "update check finished"
        );
        report
    }
}

//! Latest-URL discovery for dynamic indices.
//!
//! For one [`DynamicIndexSpec`] the discoverer:
//!
//! 1. lists the spec's root (falling back to mirrors only when a root is
//!    unreachable),
//! 2. keeps the children whose name matches the version pattern,
//! 3. orders them with [`compare_versions`], highest first,
//! 4. joins `root / segment / target` into a candidate URL,
//! 5. optionally checks the candidate exists, moving to the next-highest
//!    candidate when it does not.
//!
//! Every remote call is bounded by [`DiscoveryOptions::timeout`]. Given the
//! same listing, the result is always the same URL.
//!
//! [`Discoverer::refresh_all`] adds the stored-URL cache on top: a key
//! discovered less than [`DiscoveryOptions::rediscover_after`] ago is not
//! listed again unless forced, and a key whose discovery fails keeps its
//! stored URL.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::DynamicIndexSpec;
use crate::error::{IndexError, Result};
use crate::key::PathKey;
use crate::registry::{RegistryDocument, RegistryEntry, UrlRegistry};
use crate::remote::{directory_url, with_timeout, DirectoryListing, RemoteMetadata};
use crate::timestamp;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Upper bound for each listing fetch and existence check.
    pub timeout: Duration,
    /// Check each candidate exists before accepting it.
    pub verify: bool,
    /// Specs discovered at once by [`Discoverer::discover_all`].
    pub max_concurrency: usize,
    /// A stored URL discovered more recently than this is reused without
    /// listing the archive. Zero always rediscovers.
    pub rediscover_after: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            verify: true,
            max_concurrency: 4,
            rediscover_after: Duration::from_secs(24 * 3600),
        }
    }
}

/// Outcome of a successful discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub key: PathKey,
    pub url: String,
    /// Directory name of the selected release volume, e.g. `mrox_2103`.
    pub segment: String,
    /// Version token extracted from `segment`.
    pub version: String,
    /// Root the listing came from (a mirror when the primary was down).
    pub root: String,
}

/// URL already stored for a key, with the time discovery last wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedUrl {
    pub url: String,
    pub discovered_at: Option<NaiveDateTime>,
}

impl From<RegistryEntry> for CachedUrl {
    fn from(entry: RegistryEntry) -> Self {
        Self {
            url: entry.url,
            discovered_at: entry.discovered_at,
        }
    }
}

/// Stored URLs of every registry entry, keyed for [`Discoverer::refresh_all`].
pub fn cached_urls(registry: &RegistryDocument) -> BTreeMap<PathKey, CachedUrl> {
    registry
        .entries()
        .into_iter()
        .map(|entry| (entry.key.clone(), CachedUrl::from(entry)))
        .collect()
}

/// What [`Discoverer::refresh_all`] settled on for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Refreshed {
    /// Discovered recently; the stored URL was reused without listing.
    Cached {
        url: String,
        discovered_at: Option<NaiveDateTime>,
    },
    Discovered(Discovery),
    /// Discovery failed and the stored URL stands.
    Fallback { url: String, error: String },
}

impl Refreshed {
    pub fn url(&self) -> &str {
        match self {
            Refreshed::Cached { url, .. } | Refreshed::Fallback { url, .. } => url,
            Refreshed::Discovered(found) => &found.url,
        }
    }
}

/// Outcome of [`Discoverer::refresh_registry`].
#[derive(Debug)]
pub struct RegistryRefresh {
    pub results: BTreeMap<PathKey, Result<Refreshed>>,
    /// Keys whose stored URL changed.
    pub updated: Vec<PathKey>,
}

/// A listing entry that matched a spec's version pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub segment: String,
    pub version: String,
}

/// Compare two version tokens in natural order.
///
/// Tokens are split into runs of ASCII digits and runs of everything else.
/// Digit runs compare by value (`10 > 9`, `0100 > 0052`), other runs compare
/// byte-wise, and a digit run sorts before a non-digit run at the same
/// position. A token that is a prefix of another sorts first (`0052 < 0052A`).
/// Tokens equal in every run fall back to the raw text (`0099 < 99`), so the
/// result is a total order for any mix of tokens.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_runs(a)
        .cmp(&version_runs(b))
        .then_with(|| a.cmp(b))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum VersionRun<'a> {
    /// Leading zeros stripped. Equal-length digit strings order the same as
    /// their values, so no integer parsing (or overflow) is involved.
    Number { len: usize, digits: &'a str },
    Text(&'a str),
}

fn version_runs(token: &str) -> Vec<VersionRun<'_>> {
    let mut runs = Vec::new();
    let mut rest = token;
    while let Some(first) = rest.chars().next() {
        let numeric = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != numeric)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);
        runs.push(if numeric {
            let digits = run.trim_start_matches('0');
            VersionRun::Number {
                len: digits.len(),
                digits,
            }
        } else {
            VersionRun::Text(run)
        });
        rest = tail;
    }
    runs
}

/// Children of a listing that match `pattern`, highest version first.
///
/// The version token is the first capture group, or the whole match when the
/// pattern has no groups. Ties fall back to the segment name so the order is
/// total.
pub fn rank_candidates(pattern: &Regex, children: &[String]) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut candidates: Vec<Candidate> = children
        .iter()
        .map(|child| child.trim().trim_end_matches('/'))
        .filter_map(|segment| {
            let caps = pattern.captures(segment)?;
            let version = caps.get(1).or_else(|| caps.get(0))?.as_str().to_string();
            Some(Candidate {
                segment: segment.to_string(),
                version,
            })
        })
        .filter(|c| seen.insert(c.segment.clone()))
        .collect();

    candidates.sort_by(|a, b| {
        compare_versions(&b.version, &a.version).then_with(|| b.segment.cmp(&a.segment))
    });
    candidates
}

fn candidate_url(root: &Url, segment: &str, target: &str) -> Result<String> {
    root.join(&format!("{}/", segment))
        .and_then(|volume| volume.join(target.trim_start_matches('/')))
        .map(String::from)
        .map_err(|e| IndexError::InvalidUrl {
            url: format!("{}{}/{}", root, segment, target),
            reason: e.to_string(),
        })
}

/// Computes the current URL of dynamic indices from remote listings.
#[derive(Clone)]
pub struct Discoverer {
    lister: Arc<dyn DirectoryListing>,
    metadata: Arc<dyn RemoteMetadata>,
    options: DiscoveryOptions,
}

impl Discoverer {
    pub fn new(
        lister: Arc<dyn DirectoryListing>,
        metadata: Arc<dyn RemoteMetadata>,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            lister,
            metadata,
            options,
        }
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Find the latest URL for `spec`.
    ///
    /// Fails with [`IndexError::DiscoveryUnavailable`] when no root could be
    /// listed, and with [`IndexError::NoCandidatesFound`] when a root answered
    /// but nothing usable was in it. Mirrors are not consulted in the second
    /// case since the archive itself is reachable.
    pub async fn discover(&self, spec: &DynamicIndexSpec) -> Result<Discovery> {
        let pattern = spec.compile_pattern()?;
        let mut failures = Vec::new();

        for (attempt, root) in spec.roots.iter().enumerate() {
            debug!(key = %spec.key, root = %root, "listing archive root");
            let listing = with_timeout(
                "directory listing",
                self.options.timeout,
                self.lister.list(root),
            )
            .await;

            match listing {
                Ok(children) => {
                    if attempt > 0 {
                        info!(key = %spec.key, root = %root, "using mirror");
                    }
                    return self.select(spec, root, &pattern, &children).await;
                }
                Err(e) => {
                    warn!(key = %spec.key, root = %root, error = %e, "archive root unreachable");
                    failures.push(format!("{}: {}", root, e));
                }
            }
        }

        Err(IndexError::DiscoveryUnavailable {
            key: spec.key.clone(),
            reason: if failures.is_empty() {
                "no archive roots configured".to_string()
            } else {
                failures.join("; ")
            },
        })
    }

    async fn select(
        &self,
        spec: &DynamicIndexSpec,
        root: &str,
        pattern: &Regex,
        children: &[String],
    ) -> Result<Discovery> {
        let candidates = rank_candidates(pattern, children);
        let matched = candidates.len();
        let base = directory_url(root)?;

        for candidate in candidates {
            let url = candidate_url(&base, &candidate.segment, &spec.target)?;

            if self.options.verify {
                let exists =
                    with_timeout("existence check", self.options.timeout, self.metadata.exists(&url))
                        .await;
                match exists {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(key = %spec.key, url = %url, "candidate missing, trying next");
                        continue;
                    }
                    Err(e) => {
                        warn!(key = %spec.key, url = %url, error = %e, "candidate check failed, trying next");
                        continue;
                    }
                }
            }

            info!(key = %spec.key, url = %url, version = %candidate.version, "discovered latest index");
            return Ok(Discovery {
                key: spec.key.clone(),
                url,
                segment: candidate.segment,
                version: candidate.version,
                root: root.to_string(),
            });
        }

        Err(IndexError::NoCandidatesFound {
            key: spec.key.clone(),
            root: root.to_string(),
            matched,
        })
    }

    /// Discover every spec concurrently. The map holds one entry per distinct
    /// key regardless of completion order.
    pub async fn discover_all(
        &self,
        specs: &[DynamicIndexSpec],
    ) -> BTreeMap<PathKey, Result<Discovery>> {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for spec in specs {
            let discoverer = self.clone();
            let spec = spec.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = discoverer.discover(&spec).await;
                (spec.key, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, result)) => {
                    results.insert(key, result);
                }
                Err(e) => warn!(error = %e, "discovery task aborted"),
            }
        }

        for spec in specs {
            results.entry(spec.key.clone()).or_insert_with(|| {
                Err(IndexError::DiscoveryUnavailable {
                    key: spec.key.clone(),
                    reason: "discovery task aborted".to_string(),
                })
            });
        }
        results
    }

    /// Whether `cached` was discovered recently enough to skip listing.
    pub fn is_fresh(&self, cached: &CachedUrl, now: NaiveDateTime) -> bool {
        cached
            .discovered_at
            .is_some_and(|at| timestamp::is_within(at, now, self.options.rediscover_after))
    }

    /// Discover every spec whose stored URL is missing or stale.
    ///
    /// Fresh keys come back as [`Refreshed::Cached`] without touching the
    /// network; `force` rediscovers them too. A failed discovery falls back
    /// to the stored URL when there is one and stays an error otherwise.
    pub async fn refresh_all(
        &self,
        specs: &[DynamicIndexSpec],
        cached: &BTreeMap<PathKey, CachedUrl>,
        now: NaiveDateTime,
        force: bool,
    ) -> BTreeMap<PathKey, Result<Refreshed>> {
        let mut results = BTreeMap::new();
        let mut stale = Vec::new();
        for spec in specs {
            match cached.get(&spec.key) {
                Some(entry) if !force && self.is_fresh(entry, now) => {
                    debug!(key = %spec.key, "discovered recently, reusing stored URL");
                    results.insert(
                        spec.key.clone(),
                        Ok(Refreshed::Cached {
                            url: entry.url.clone(),
                            discovered_at: entry.discovered_at,
                        }),
                    );
                }
                _ => stale.push(spec.clone()),
            }
        }

        for (key, result) in self.discover_all(&stale).await {
            let settled = match result {
                Ok(found) => Ok(Refreshed::Discovered(found)),
                Err(e) => match cached.get(&key) {
                    Some(entry) => {
                        warn!(key = %key, error = %e, "discovery failed, keeping stored URL");
                        Ok(Refreshed::Fallback {
                            url: entry.url.clone(),
                            error: e.to_string(),
                        })
                    }
                    None => Err(e),
                },
            };
            results.insert(key, settled);
        }
        results
    }

    /// [`Discoverer::refresh_all`] against `registry`, storing every fresh
    /// discovery in one write.
    pub async fn refresh_registry(
        &self,
        registry: &mut UrlRegistry,
        specs: &[DynamicIndexSpec],
        now: NaiveDateTime,
        force: bool,
    ) -> Result<RegistryRefresh> {
        let cached = cached_urls(registry.document());
        let results = self.refresh_all(specs, &cached, now, force).await;
        let found = results.values().filter_map(|result| match result {
            Ok(Refreshed::Discovered(found)) => Some((&found.key, found.url.as_str())),
            _ => None,
        });
        let updated = registry.record_discoveries(found, now)?;
        Ok(RegistryRefresh { results, updated })
    }

    /// Fill a registry that [`UrlRegistry::open`] just created with the
    /// current URL of every spec. Discovery failures are logged and leave the
    /// key unset. Does nothing for an existing registry.
    pub async fn seed(
        &self,
        registry: &mut UrlRegistry,
        specs: &[DynamicIndexSpec],
    ) -> Result<Vec<PathKey>> {
        if !registry.is_new() {
            return Ok(Vec::new());
        }
        info!(path = %registry.path().display(), "discovering URLs for new registry");
        let refresh = self
            .refresh_registry(registry, specs, timestamp::now(), true)
            .await?;
        for (key, result) in &refresh.results {
            if let Err(e) = result {
                warn!(key = %key, error = %e, "could not discover URL for new registry");
            }
        }
        Ok(refresh.updated)
    }
}

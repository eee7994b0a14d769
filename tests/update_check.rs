use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tempfile::TempDir;

use pds_indexes::access_log::AccessLog;
use pds_indexes::catalog::{Catalog, DynamicIndexSpec};
use pds_indexes::checker::{CheckTarget, KeyOutcome, TimestampUpdate, UpdateChecker, UrlUpdate};
use pds_indexes::discovery::{Discoverer, DiscoveryOptions};
use pds_indexes::registry::UrlRegistry;
use pds_indexes::remote::{DirectoryListing, RemoteMetadata};
use pds_indexes::{timestamp, IndexError, PathKey, Result};

const CTX_ROOT: &str = "https://archive.test/mro/ctx/";
const CTX_2101: &str = "https://archive.test/mro/ctx/mrox_2101/index/cumindex.lbl";
const CTX_2103: &str = "https://archive.test/mro/ctx/mrox_2103/index/cumindex.lbl";
const RING_SUMMARY: &str = "https://archive.test/cassini/iss/COISS_2999_ring_summary.lbl";
const GO_SSI: &str = "https://archive.test/go/ssi/index.lbl";

/// In-memory archive: listings per root, modification times per URL.
#[derive(Default)]
struct FakeArchive {
    listings: HashMap<String, Vec<String>>,
    modified: HashMap<String, NaiveDateTime>,
    missing: HashSet<String>,
    list_delay: HashMap<String, Duration>,
    list_calls: AtomicUsize,
}

impl FakeArchive {
    fn listing(mut self, root: &str, children: &[&str]) -> Self {
        self.listings
            .insert(root.to_string(), children.iter().map(|c| c.to_string()).collect());
        self
    }

    fn modified(mut self, url: &str, at: &str) -> Self {
        self.modified.insert(url.to_string(), ts(at));
        self
    }

    fn delay(mut self, root: &str, delay: Duration) -> Self {
        self.list_delay.insert(root.to_string(), delay);
        self
    }
}

#[async_trait]
impl DirectoryListing for FakeArchive {
    async fn list(&self, root: &str) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.list_delay.get(root) {
            tokio::time::sleep(*delay).await;
        }
        self.listings
            .get(root)
            .cloned()
            .ok_or_else(|| IndexError::Transport {
                url: root.to_string(),
                reason: "503 Service Unavailable".to_string(),
            })
    }
}

#[async_trait]
impl RemoteMetadata for FakeArchive {
    async fn last_modified(&self, url: &str) -> Result<Option<NaiveDateTime>> {
        Ok(self.modified.get(url).copied())
    }

    async fn exists(&self, url: &str) -> Result<bool> {
        Ok(!self.missing.contains(url))
    }
}

fn ts(s: &str) -> NaiveDateTime {
    timestamp::parse(s).unwrap()
}

fn key(s: &str) -> PathKey {
    PathKey::parse(s).unwrap()
}

fn ctx_spec() -> DynamicIndexSpec {
    DynamicIndexSpec {
        key: key("mro.ctx.edr"),
        roots: vec![CTX_ROOT.to_string()],
        pattern: r"(?i)^mrox_(\d{4})$".to_string(),
        target: "index/cumindex.lbl".to_string(),
    }
}

fn checker_for(archive: Arc<FakeArchive>, max_concurrency: usize) -> UpdateChecker {
    let discoverer = Discoverer::new(
        archive.clone(),
        archive.clone(),
        DiscoveryOptions {
            timeout: Duration::from_millis(500),
            verify: true,
            max_concurrency,
            ..DiscoveryOptions::default()
        },
    );
    UpdateChecker::new(discoverer, archive)
}

struct Stores {
    _tmp: TempDir,
    registry: UrlRegistry,
    log: AccessLog,
}

fn stores() -> Stores {
    let tmp = TempDir::new().unwrap();
    let registry = UrlRegistry::open(&tmp.path().join("urls.toml")).unwrap();
    let log = AccessLog::open(&tmp.path().join("log.json")).unwrap();
    Stores {
        _tmp: tmp,
        registry,
        log,
    }
}

#[tokio::test]
async fn newer_remote_file_is_reported() {
    let mut s = stores();
    let ring = key("cassini.iss.ring_summary");
    s.registry.set(&ring, RING_SUMMARY).unwrap();
    s.log.set_timestamp(&ring, ts("2023-03-15T14:30:22")).unwrap();

    let archive = Arc::new(FakeArchive::default().modified(RING_SUMMARY, "2023-07-22T10:15:45"));
    let targets = CheckTarget::collect(s.registry.document(), s.log.document(), &Catalog::default());
    let report = checker_for(archive, 4).check(targets).await;

    let Some(KeyOutcome::Checked(outcome)) = report.get(&ring) else {
        panic!("expected a checked outcome for {}", ring);
    };
    assert!(outcome.has_update);
    assert_eq!(
        outcome.details.timestamp_update,
        Some(TimestampUpdate {
            local: Some(ts("2023-03-15T14:30:22")),
            remote: ts("2023-07-22T10:15:45"),
        })
    );
    assert_eq!(outcome.details.url_update, None);
}

#[tokio::test]
async fn new_volume_is_reported_as_url_update() {
    let mut s = stores();
    let ctx = key("mro.ctx.edr");
    s.registry
        .record_discovery(&ctx, CTX_2101, ts("2025-01-01T00:00:00"))
        .unwrap();

    let archive = Arc::new(
        FakeArchive::default().listing(CTX_ROOT, &["mrox_2101", "mrox_2103", "mrox_0099"]),
    );
    let catalog = Catalog::from_specs(vec![ctx_spec()]);
    let targets = CheckTarget::collect(s.registry.document(), s.log.document(), &catalog);
    let report = checker_for(archive, 4).check(targets).await;

    let Some(KeyOutcome::Checked(outcome)) = report.get(&ctx) else {
        panic!("expected a checked outcome for {}", ctx);
    };
    assert!(outcome.has_update);
    assert_eq!(
        outcome.details.url_update,
        Some(UrlUpdate {
            previous: Some(CTX_2101.to_string()),
            new: CTX_2103.to_string(),
        })
    );
}

#[tokio::test]
async fn listing_failure_marks_only_that_key() {
    let mut s = stores();
    s.registry.set(&key("mro.ctx.edr"), CTX_2101).unwrap();
    s.registry.set(&key("cassini.iss.ring_summary"), RING_SUMMARY).unwrap();
    s.registry.set(&key("go.ssi.index"), GO_SSI).unwrap();

    // No listing for the CTX root: the archive answers 503.
    let archive = Arc::new(
        FakeArchive::default()
            .modified(RING_SUMMARY, "2023-07-22T10:15:45")
            .modified(GO_SSI, "2020-01-01T00:00:00"),
    );
    let catalog = Catalog::from_specs(vec![ctx_spec()]);
    let targets = CheckTarget::collect(s.registry.document(), s.log.document(), &catalog);
    assert_eq!(targets.len(), 3);

    let report = checker_for(archive, 4).check(targets).await;
    assert_eq!(report.len(), 3);

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, key("mro.ctx.edr"));
    assert_eq!(failures[0].kind, "discovery_unavailable");

    let checked = report
        .outcomes()
        .filter(|o| matches!(o, KeyOutcome::Checked(_)))
        .count();
    assert_eq!(checked, 2);
}

#[tokio::test]
async fn concurrent_discovery_yields_one_entry_per_key() {
    let n = 6;
    let mut archive = FakeArchive::default();
    let mut specs = Vec::new();
    for i in 0..n {
        let root = format!("https://archive.test/mission{}/", i);
        archive = archive
            .listing(&root, &["v_0001", "v_0002"])
            // Later keys finish first.
            .delay(&root, Duration::from_millis(10 * (n - i) as u64));
        specs.push(DynamicIndexSpec {
            key: key(&format!("mission{}.camera.edr", i)),
            roots: vec![root],
            pattern: r"^v_(\d{4})$".to_string(),
            target: "index.lbl".to_string(),
        });
    }
    let archive = Arc::new(archive);
    let checker = checker_for(archive.clone(), 3);

    let found = checker.discoverer().discover_all(&specs).await;
    assert_eq!(found.len(), n);
    for (k, result) in &found {
        let discovery = result.as_ref().unwrap();
        assert_eq!(&discovery.key, k);
        assert_eq!(discovery.segment, "v_0002");
    }

    let targets: Vec<CheckTarget> = specs
        .iter()
        .map(|spec| CheckTarget {
            key: spec.key.clone(),
            stored_url: None,
            spec: Some(spec.clone()),
            local_timestamp: None,
        })
        .collect();
    let report = checker.check(targets).await;
    assert_eq!(report.len(), n);
    assert_eq!(report.updates().count(), n);
    assert_eq!(archive.list_calls.load(Ordering::SeqCst), 2 * n);
}

#[tokio::test]
async fn slow_listing_times_out_without_stalling_batch() {
    let mut s = stores();
    s.registry.set(&key("go.ssi.index"), GO_SSI).unwrap();

    let archive = Arc::new(
        FakeArchive::default()
            .listing(CTX_ROOT, &["mrox_2103"])
            .delay(CTX_ROOT, Duration::from_secs(30))
            .modified(GO_SSI, "2024-01-01T00:00:00"),
    );
    let catalog = Catalog::from_specs(vec![ctx_spec()]);
    let targets = CheckTarget::collect(s.registry.document(), s.log.document(), &catalog);

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        checker_for(archive, 4).check(targets),
    )
    .await
    .expect("batch must finish within the per-call timeouts");

    assert_eq!(report.len(), 2);
    assert_eq!(report.failures().count(), 1);
    assert!(report.updates().any(|u| u.key == key("go.ssi.index")));
}

#[tokio::test]
async fn checking_is_read_only_until_applied() {
    let mut s = stores();
    let ctx = key("mro.ctx.edr");
    s.registry.set(&ctx, CTX_2101).unwrap();
    let before = std::fs::read_to_string(s.registry.path()).unwrap();

    let archive = Arc::new(FakeArchive::default().listing(CTX_ROOT, &["mrox_2101", "mrox_2103"]));
    let catalog = Catalog::from_specs(vec![ctx_spec()]);
    let targets = CheckTarget::collect(s.registry.document(), s.log.document(), &catalog);
    let report = checker_for(archive, 2).check(targets).await;

    assert_eq!(std::fs::read_to_string(s.registry.path()).unwrap(), before);
    assert!(!s.log.path().exists());

    let written = report
        .apply_url_updates(&mut s.registry, ts("2026-10-18T09:12:00"))
        .unwrap();
    assert_eq!(written, vec![ctx.clone()]);

    s.registry.reload().unwrap();
    let entry = s.registry.entry(&ctx).unwrap();
    assert_eq!(entry.url, CTX_2103);
    assert!(entry.is_dynamic);
    assert!(std::fs::read_to_string(s.registry.path())
        .unwrap()
        .contains("# Latest URL discovered on 2026-10-18"));
    assert!(!s.log.path().exists());
}

#[tokio::test]
async fn applying_keeps_edits_made_during_the_check() {
    let mut s = stores();
    let ctx = key("mro.ctx.edr");
    s.registry.set(&ctx, CTX_2101).unwrap();

    let archive = Arc::new(FakeArchive::default().listing(CTX_ROOT, &["mrox_2103"]));
    let catalog = Catalog::from_specs(vec![ctx_spec()]);
    let targets = CheckTarget::collect(s.registry.document(), s.log.document(), &catalog);
    let report = checker_for(archive, 1).check(targets).await;

    // Another process edits the registry before the report is applied.
    let mut other = UrlRegistry::open(s.registry.path()).unwrap();
    other.set(&key("go.ssi.index"), GO_SSI).unwrap();

    report
        .apply_url_updates(&mut s.registry, ts("2026-10-18T09:12:00"))
        .unwrap();

    let reopened = UrlRegistry::open(s.registry.path()).unwrap();
    assert_eq!(reopened.get(&key("go.ssi.index")).unwrap(), GO_SSI);
    assert_eq!(reopened.get(&ctx).unwrap(), CTX_2103);
}

#[tokio::test]
async fn undiscovered_catalog_key_reports_null_previous() {
    let s = stores();
    let archive = Arc::new(FakeArchive::default().listing(CTX_ROOT, &["mrox_2103"]));
    let catalog = Catalog::from_specs(vec![ctx_spec()]);
    let targets = CheckTarget::collect(s.registry.document(), s.log.document(), &catalog);
    let report = checker_for(archive, 1).check(targets).await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json[0]["key"], "mro.ctx.edr");
    assert!(json[0]["details"]["url_update"]["previous"].is_null());
    assert_eq!(json[0]["details"]["url_update"]["new"], CTX_2103);
}

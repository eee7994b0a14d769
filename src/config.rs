use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{Catalog, DynamicIndexSpec};
use crate::discovery::DiscoveryOptions;
use crate::remote::DEFAULT_USER_AGENT;

/// Overrides `storage.registry_path`.
pub const REGISTRY_ENV: &str = "PDS_INDEX_URLS";
/// Overrides `storage.access_log_path`.
pub const ACCESS_LOG_ENV: &str = "PDS_INDEX_LOG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub published: PublishedConfig,
    /// Extra dynamic indices, merged over the built-in catalog.
    #[serde(default)]
    pub dynamic: Vec<DynamicIndexSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default = "default_access_log_path")]
    pub access_log_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            access_log_path: default_access_log_path(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("~/.pds_index_urls.toml")
}
fn default_access_log_path() -> PathBuf {
    PathBuf::from("~/.pds_index_log.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_verify_candidates")]
    pub verify_candidates: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Reuse a discovered URL younger than this instead of listing again.
    /// `0` always rediscovers.
    #[serde(default = "default_interval_hours")]
    pub rediscover_after_hours: u64,
    /// Run discovery when the registry file is first created.
    #[serde(default = "default_discover_on_create")]
    pub discover_on_create: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            verify_candidates: default_verify_candidates(),
            user_agent: default_user_agent(),
            rediscover_after_hours: default_interval_hours(),
            discover_on_create: default_discover_on_create(),
        }
    }
}

/// A curated registry published at a URL, merged in by `pdsidx sync`.
#[derive(Debug, Deserialize, Clone)]
pub struct PublishedConfig {
    pub url: Option<String>,
    #[serde(default = "default_interval_hours")]
    pub check_interval_hours: u64,
}

impl Default for PublishedConfig {
    fn default() -> Self {
        Self {
            url: None,
            check_interval_hours: default_interval_hours(),
        }
    }
}

impl PublishedConfig {
    pub fn check_interval(&self) -> Duration {
        hours(self.check_interval_hours)
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    4
}
fn default_verify_candidates() -> bool {
    true
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_interval_hours() -> u64 {
    24
}
fn default_discover_on_create() -> bool {
    true
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            timeout: self.timeout(),
            verify: self.verify_candidates,
            max_concurrency: self.max_concurrency,
            rediscover_after: hours(self.rediscover_after_hours),
        }
    }
}

impl Config {
    /// Built-in dynamic indices with `[[dynamic]]` entries applied on top.
    pub fn catalog(&self) -> Catalog {
        let mut catalog = Catalog::builtin();
        catalog.extend(self.dynamic.iter().cloned());
        catalog
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.timeout_secs == 0 {
            anyhow::bail!("remote.timeout_secs must be > 0");
        }
        if self.remote.max_concurrency < 1 {
            anyhow::bail!("remote.max_concurrency must be >= 1");
        }
        if self.remote.user_agent.trim().is_empty() {
            anyhow::bail!("remote.user_agent must not be empty");
        }
        if let Some(url) = &self.published.url {
            url::Url::parse(url)
                .with_context(|| format!("published.url is not a valid URL: {}", url))?;
        }
        for spec in &self.dynamic {
            spec.validate()
                .with_context(|| format!("invalid [[dynamic]] entry '{}'", spec.key))?;
        }
        Ok(())
    }

    /// Apply environment overrides, then expand `~` in storage paths.
    pub fn resolve_paths<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(REGISTRY_ENV).filter(|v| !v.is_empty()) {
            self.storage.registry_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(ACCESS_LOG_ENV).filter(|v| !v.is_empty()) {
            self.storage.access_log_path = PathBuf::from(path);
        }
        self.storage.registry_path = expand_tilde(&self.storage.registry_path);
        self.storage.access_log_path = expand_tilde(&self.storage.access_log_path);
    }
}

/// `~/.config/pds-indexes/config.toml`.
pub fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("pds-indexes")
        .join("config.toml")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.validate()?;
    Ok(config)
}

/// Load the config the CLI runs with.
///
/// An explicit `path` must exist. Without one, the default location is used
/// if present and built-in defaults otherwise.
pub fn load_effective(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => {
            let default_path = default_config_path();
            if default_path.exists() {
                load_config(&default_path)?
            } else {
                Config::default()
            }
        }
    };
    config.resolve_paths(|name| std::env::var(name).ok());
    Ok(config)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") || s == "~" {
        if let Some(home) = home_dir() {
            return home.join(s.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::PathKey;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&write_config(dir.path(), "")).unwrap();
        assert_eq!(config.remote.timeout_secs, 30);
        assert_eq!(config.remote.max_concurrency, 4);
        assert!(config.remote.verify_candidates);
        assert_eq!(config.remote.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(
            config.storage.registry_path,
            PathBuf::from("~/.pds_index_urls.toml")
        );
        assert_eq!(config.catalog().len(), 2);
        assert_eq!(config.remote.rediscover_after_hours, 24);
        assert!(config.remote.discover_on_create);
        assert_eq!(
            config.remote.discovery_options().rediscover_after,
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(config.published.url, None);
        assert_eq!(config.published.check_interval(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn published_section_is_parsed_and_checked() {
        let dir = tempfile::tempdir().unwrap();
        let body = "[published]\nurl = \"https://configs.example.org/pds_index_urls.toml\"\ncheck_interval_hours = 6\n\n[remote]\nrediscover_after_hours = 0\n";
        let config = load_config(&write_config(dir.path(), body)).unwrap();
        assert_eq!(
            config.published.url.as_deref(),
            Some("https://configs.example.org/pds_index_urls.toml")
        );
        assert_eq!(config.published.check_interval(), Duration::from_secs(6 * 3600));
        assert!(config.remote.discovery_options().rediscover_after.is_zero());

        let err = load_config(&write_config(dir.path(), "[published]\nurl = \"not a url\"\n"))
            .unwrap_err();
        assert!(err.to_string().contains("published.url"));
    }

    #[test]
    fn rejects_zero_timeout_and_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&write_config(dir.path(), "[remote]\ntimeout_secs = 0\n"))
            .unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));

        let err = load_config(&write_config(dir.path(), "[remote]\nmax_concurrency = 0\n"))
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&write_config(dir.path(), "[remote\n")).is_err());
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn dynamic_entries_extend_and_replace_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"
[[dynamic]]
key = "mro.ctx.edr"
roots = ["https://mirror.example.org/ctx/"]
pattern = '^mrox_(\d{4})$'
target = "index/cumindex.lbl"

[[dynamic]]
key = "Juno.JIRAM.edr"
roots = ["https://archive.example.org/juno/jiram/"]
pattern = '^JNOJIR_(\d{4})$'
target = "INDEX/INDEX.LBL"
"#;
        let config = load_config(&write_config(dir.path(), body)).unwrap();
        let catalog = config.catalog();
        assert_eq!(catalog.len(), 3);
        let ctx = catalog.get(&PathKey::parse("mro.ctx.edr").unwrap()).unwrap();
        assert_eq!(ctx.roots, vec!["https://mirror.example.org/ctx/"]);
        assert!(catalog.contains(&PathKey::parse("juno.jiram.edr").unwrap()));
    }

    #[test]
    fn invalid_dynamic_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"
[[dynamic]]
key = "mro.ctx.edr"
roots = []
pattern = '^mrox_(\d{4})$'
target = "index/cumindex.lbl"
"#;
        let err = load_config(&write_config(dir.path(), body)).unwrap_err();
        assert!(format!("{:#}", err).contains("mro.ctx.edr"));

        let bad_key = "[[dynamic]]\nkey = \"mro.ctx\"\nroots = [\"https://a.test/\"]\npattern = \"x\"\ntarget = \"t\"\n";
        assert!(load_config(&write_config(dir.path(), bad_key)).is_err());
    }

    #[test]
    fn environment_overrides_storage_paths() {
        let mut config = Config::default();
        config.resolve_paths(|name| match name {
            REGISTRY_ENV => Some("/tmp/urls.toml".to_string()),
            _ => None,
        });
        assert_eq!(config.storage.registry_path, PathBuf::from("/tmp/urls.toml"));
        assert!(config
            .storage
            .access_log_path
            .to_string_lossy()
            .ends_with(".pds_index_log.json"));
    }

    #[test]
    fn expand_tilde_noop_for_absolute() {
        let path = Path::new("/usr/local/bin");
        assert_eq!(expand_tilde(path), path.to_path_buf());
    }
}

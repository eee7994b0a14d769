//! # PDS Indexes CLI (`pdsidx`)
//!
//! Manage the registry of PDS index URLs and check the archives for updates.
//!
//! ## Usage
//!
//! ```bash
//! pdsidx [--config ~/.config/pds-indexes/config.toml] [-v] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pdsidx get <key>` | Print the URL stored for a key |
//! | `pdsidx set <key> <url>` | Store a URL |
//! | `pdsidx remove <key>` | Remove a registry entry |
//! | `pdsidx list [mission] [instrument]` | List missions, instruments or indexes |
//! | `pdsidx tree` | Show the whole registry |
//! | `pdsidx log [key]` | Show last-fetched timestamps |
//! | `pdsidx touch <key>` | Record a successful fetch |
//! | `pdsidx discover` | Find the latest URL of every dynamic index |
//! | `pdsidx check [keys..]` | Report available updates |
//! | `pdsidx sync` | Merge the published registry (at most once a day) |
//! | `pdsidx migrate <legacy>` | Import a legacy configuration file |
//! | `pdsidx completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! # Register a static index
//! pdsidx set cassini.iss.ring_summary https://pds-rings.seti.org/holdings/metadata/COISS_2xxx/COISS_2999/COISS_2999_ring_summary.lbl
//!
//! # Look for new CTX/LROC volumes and store what was found
//! pdsidx discover --apply
//!
//! # Machine-readable update report for two keys
//! pdsidx check cassini.iss.ring_summary mro.ctx.edr --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use pds_indexes::access_log::AccessLog;
use pds_indexes::checker::{CheckTarget, UpdateChecker};
use pds_indexes::config::{self, Config};
use pds_indexes::discovery::{self, Discoverer, Refreshed};
use pds_indexes::logging;
use pds_indexes::migrate::{self, MigrateOptions};
use pds_indexes::published::{PublishedRegistry, SyncOutcome};
use pds_indexes::registry::UrlRegistry;
use pds_indexes::remote::HttpArchive;
use pds_indexes::{timestamp, PathKey};

/// Registry and update checker for PDS index files.
///
/// Index URLs are kept in a TOML registry (`~/.pds_index_urls.toml`), fetch
/// times in a JSON access log (`~/.pds_index_log.json`). Both locations can
/// be changed in the config file or with `PDS_INDEX_URLS` / `PDS_INDEX_LOG`.
#[derive(Parser)]
#[command(
    name = "pdsidx",
    about = "Registry and update checker for PDS index files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `~/.config/pds-indexes/config.toml`; built-in defaults are
    /// used when that file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug). Also makes `migrate`
    /// narrate what it did.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the URL stored for a key.
    Get {
        /// `mission.instrument.index`, e.g. `cassini.iss.ring_summary`.
        key: PathKey,
    },

    /// Store a URL for a key, creating missing sections.
    Set { key: PathKey, url: String },

    /// Remove a registry entry.
    Remove { key: PathKey },

    /// List missions, a mission's instruments, or an instrument's indexes.
    List {
        mission: Option<String>,
        instrument: Option<String>,
    },

    /// Show the registry as a tree.
    Tree,

    /// Show when indexes were last fetched.
    Log { key: Option<PathKey> },

    /// Record a successful fetch of an index.
    Touch {
        key: PathKey,

        /// Fetch time (ISO-8601). Defaults to now.
        #[arg(long)]
        at: Option<String>,

        /// Overwrite even if the stored time is newer.
        #[arg(long)]
        force: bool,
    },

    /// Find the latest URL of every dynamic index.
    ///
    /// URLs discovered less than `remote.rediscover_after_hours` ago are
    /// reused without listing the archive.
    Discover {
        /// Store discovered URLs in the registry.
        #[arg(long)]
        apply: bool,

        /// Rediscover even recently discovered URLs.
        #[arg(long)]
        force: bool,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check indexes for new URLs and newer remote files.
    ///
    /// Read-only unless `--apply` is given, which stores discovered URLs.
    /// Access times are never changed by a check.
    Check {
        /// Keys to check. Defaults to every registry and catalog key.
        keys: Vec<PathKey>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,

        /// Store discovered URLs in the registry.
        #[arg(long)]
        apply: bool,
    },

    /// Merge the registry published at `published.url`.
    ///
    /// Checks at most once per `published.check_interval_hours`.
    Sync {
        /// Check even if the last check was recent.
        #[arg(long)]
        force: bool,

        /// Print the outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Import a legacy configuration file.
    ///
    /// Index records move to the registry and access log. Other settings stay
    /// in the legacy file, or go to `--leftover` when given.
    Migrate {
        legacy: PathBuf,

        /// Write the remaining settings here instead of rewriting `legacy`.
        #[arg(long)]
        leftover: Option<PathBuf>,

        /// Also run discovery and store what it finds.
        #[arg(long)]
        discover: bool,

        /// Also run an update check afterwards.
        #[arg(long)]
        refresh: bool,
    },

    /// Print a shell completion script.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "pdsidx",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let cfg = config::load_effective(cli.config.as_deref())?;

    match cli.command {
        Commands::Get { key } => {
            let registry = open_registry(&cfg).await?;
            println!("{}", registry.get(&key)?);
        }
        Commands::Set { key, url } => {
            url::Url::parse(&url).with_context(|| format!("Invalid URL: {}", url))?;
            let mut registry = open_registry(&cfg).await?;
            if registry.set(&key, &url)? {
                println!("{} = {}", key, url);
            } else {
                println!("{} unchanged", key);
            }
        }
        Commands::Remove { key } => {
            let mut registry = open_registry(&cfg).await?;
            let url = registry.remove(&key)?;
            println!("Removed {} ({})", key, url);
        }
        Commands::List {
            mission,
            instrument,
        } => {
            let registry = open_registry(&cfg).await?;
            let items = match (mission, instrument) {
                (None, _) => registry.list_missions(),
                (Some(m), None) => registry.list_instruments(&m),
                (Some(m), Some(i)) => registry.list_indexes(&m, &i),
            };
            for item in items {
                println!("{}", item);
            }
        }
        Commands::Tree => {
            let registry = open_registry(&cfg).await?;
            print!("{}", registry.render_tree());
        }
        Commands::Log { key } => {
            let log = open_log(&cfg)?;
            match key {
                Some(key) => match log.get_timestamp(&key) {
                    Some(at) => println!("{}", timestamp::format(&at)),
                    None => println!("{} has never been fetched", key),
                },
                None => {
                    for (key, at) in log.entries() {
                        println!("{}  {}", key, timestamp::format(&at));
                    }
                }
            }
        }
        Commands::Touch { key, at, force } => {
            let at = match at {
                Some(raw) => timestamp::parse(&raw)
                    .with_context(|| format!("Invalid timestamp: {}", raw))?,
                None => timestamp::now(),
            };
            let mut log = open_log(&cfg)?;
            if log.record_access(&key, at, force)? {
                println!("{} fetched at {}", key, timestamp::format(&at));
            } else {
                println!("{} already has a newer or equal fetch time", key);
            }
        }
        Commands::Discover { apply, force, json } => {
            run_discover(&cfg, apply, force, json).await?;
        }
        Commands::Check { keys, json, apply } => {
            run_check(&cfg, &keys, json, apply).await?;
        }
        Commands::Sync { force, json } => {
            run_sync(&cfg, force, json).await?;
        }
        Commands::Migrate {
            legacy,
            leftover,
            discover,
            refresh,
        } => {
            let mut registry = open_registry(&cfg).await?;
            let mut log = open_log(&cfg)?;
            let checker = if discover || refresh {
                Some(build_checker(&cfg)?)
            } else {
                None
            };
            let options = MigrateOptions {
                leftover_path: leftover,
                discover,
                refresh,
            };
            let summary = migrate::migrate_into_storage(
                &legacy,
                &mut registry,
                &mut log,
                &cfg.catalog(),
                checker.as_ref(),
                &options,
            )
            .await?;

            if cli.verbose > 0 {
                print!("{}", summary.render());
            } else {
                println!(
                    "Migrated {} record(s) from {} ({} warning(s))",
                    summary.migrated.len(),
                    legacy.display(),
                    summary.warnings.len()
                );
            }
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
        }
    }

    Ok(())
}

/// Open the registry, seeding a newly created one by discovery when
/// `remote.discover_on_create` is set.
async fn open_registry(cfg: &Config) -> Result<UrlRegistry> {
    let mut registry = UrlRegistry::open(&cfg.storage.registry_path).with_context(|| {
        format!(
            "Failed to open registry: {}",
            cfg.storage.registry_path.display()
        )
    })?;
    if registry.is_new() && cfg.remote.discover_on_create {
        let checker = build_checker(cfg)?;
        checker
            .discoverer()
            .seed(&mut registry, cfg.catalog().specs())
            .await
            .context("Failed to store discovered URLs in the new registry")?;
    }
    Ok(registry)
}

fn open_log(cfg: &Config) -> Result<AccessLog> {
    AccessLog::open(&cfg.storage.access_log_path).with_context(|| {
        format!(
            "Failed to open access log: {}",
            cfg.storage.access_log_path.display()
        )
    })
}

fn http_archive(cfg: &Config) -> Result<Arc<HttpArchive>> {
    Ok(Arc::new(HttpArchive::new(
        cfg.remote.timeout(),
        &cfg.remote.user_agent,
    )?))
}

fn build_checker(cfg: &Config) -> Result<UpdateChecker> {
    let archive = http_archive(cfg)?;
    let discoverer = Discoverer::new(
        archive.clone(),
        archive.clone(),
        cfg.remote.discovery_options(),
    );
    Ok(UpdateChecker::new(discoverer, archive))
}

async fn run_discover(cfg: &Config, apply: bool, force: bool, json: bool) -> Result<()> {
    let checker = build_checker(cfg)?;
    let catalog = cfg.catalog();
    let now = timestamp::now();
    let mut registry = open_registry(cfg).await?;

    let results = if apply {
        let refresh = checker
            .discoverer()
            .refresh_registry(&mut registry, catalog.specs(), now, force)
            .await?;
        for key in &refresh.updated {
            eprintln!("Stored new URL for {}", key);
        }
        refresh.results
    } else {
        let cached = discovery::cached_urls(registry.document());
        checker
            .discoverer()
            .refresh_all(catalog.specs(), &cached, now, force)
            .await
    };

    if json {
        let mut rows = Vec::new();
        for (key, result) in &results {
            let row = match result {
                Ok(refreshed) => {
                    let mut row = serde_json::to_value(refreshed)?;
                    row["key"] = serde_json::json!(key);
                    row
                }
                Err(e) => serde_json::json!({
                    "key": key,
                    "status": "failed",
                    "kind": e.kind(),
                    "message": e.to_string(),
                }),
            };
            rows.push(row);
        }
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for (key, result) in &results {
            match result {
                Ok(Refreshed::Discovered(found)) => println!("{}: {}", key, found.url),
                Ok(Refreshed::Cached { url, .. }) => {
                    println!("{}: {} (discovered recently; --force to list again)", key, url)
                }
                Ok(Refreshed::Fallback { url, error }) => {
                    println!("{}: {} (kept; discovery failed: {})", key, url, error)
                }
                Err(e) => println!("{}: discovery failed: {}", key, e),
            }
        }
    }
    Ok(())
}

async fn run_sync(cfg: &Config, force: bool, json: bool) -> Result<()> {
    let Some(url) = &cfg.published.url else {
        anyhow::bail!("No published registry configured (set [published] url)");
    };
    let mut registry = open_registry(cfg).await?;
    let mut log = open_log(cfg)?;
    let published = PublishedRegistry::new(
        http_archive(cfg)?,
        url.clone(),
        cfg.published.check_interval(),
        cfg.remote.timeout(),
    );
    let outcome = published
        .sync(
            &mut registry,
            &mut log,
            &cfg.catalog(),
            timestamp::now(),
            force,
        )
        .await
        .with_context(|| format!("Failed to sync published registry: {}", url))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    match outcome {
        SyncOutcome::Skipped { last_check } => println!(
            "Published registry checked at {}; --force to check again",
            timestamp::format(&last_check)
        ),
        SyncOutcome::UpToDate => println!("Registry matches {}", published.url()),
        SyncOutcome::Updated { keys } => {
            for key in &keys {
                println!("Updated {}", key);
            }
        }
    }
    Ok(())
}

async fn run_check(cfg: &Config, keys: &[PathKey], json: bool, apply: bool) -> Result<()> {
    let mut registry = open_registry(cfg).await?;
    let log = open_log(cfg)?;
    let catalog = cfg.catalog();

    let targets = CheckTarget::select(
        CheckTarget::collect(registry.document(), log.document(), &catalog),
        keys,
    )?;
    let checker = build_checker(cfg)?;
    let report = checker.check(targets).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }

    if apply {
        for key in report.apply_url_updates(&mut registry, timestamp::now())? {
            eprintln!("Stored new URL for {}", key);
        }
    }
    Ok(())
}

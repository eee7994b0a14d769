//! # PDS Indexes
//!
//! Registry and update detection for the index files published by Planetary
//! Data System archives.
//!
//! Each index is addressed by a dotted `mission.instrument.index` key. Its
//! URL lives in a human-curated TOML registry; when it was last fetched lives
//! in a separate JSON access log. Some indices move to a new release volume
//! with every delivery, so their URL is rediscovered by listing the archive.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  UrlRegistry │   │  AccessLog   │   │   Catalog    │
//! │   (TOML)     │   │   (JSON)     │   │ dynamic specs│
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!                   ┌───────────────┐     ┌───────────────┐
//!                   │ UpdateChecker │────▶│  Discoverer   │
//!                   └───────┬───────┘     └───────┬───────┘
//!                           └──────────┬──────────┘
//!                                      ▼
//!                          ┌──────────────────────┐
//!                          │ DirectoryListing /   │
//!                          │ RemoteMetadata (HTTP)│
//!                          └──────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pdsidx set cassini.iss.ring_summary https://pds-rings.seti.org/.../COISS_2999_ring_summary.lbl
//! pdsidx tree                   # show the registry
//! pdsidx discover --apply       # refresh dynamic URLs
//! pdsidx check --json           # report available updates
//! pdsidx sync                   # merge a published registry, once a day
//! pdsidx migrate ~/.planetarypy_config.toml
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`key`] | `mission.instrument.index` keys |
//! | [`registry`] | URL registry document and store |
//! | [`access_log`] | Last-fetched timestamps |
//! | [`catalog`] | Dynamic index descriptions |
//! | [`discovery`] | Latest-URL discovery and version ordering |
//! | [`checker`] | Update checks and reports |
//! | [`migrate`] | Legacy configuration migration |
//! | [`published`] | Merging a published registry |
//! | [`remote`] | Remote collaborator traits and HTTP client |
//! | [`fsio`] | Atomic file replacement |
//! | [`timestamp`] | Timestamp parsing and formatting |
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error types |
//! | [`logging`] | Tracing subscriber setup |

pub mod access_log;
pub mod catalog;
pub mod checker;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fsio;
pub mod key;
pub mod logging;
pub mod migrate;
pub mod published;
pub mod registry;
pub mod remote;
pub mod timestamp;

pub use error::{IndexError, Result};
pub use key::PathKey;

//! Static description of indices whose location changes over time.
//!
//! Some missions publish a cumulative index inside every new release volume
//! (`mrox_2101/index/cumindex.lbl`, `mrox_2103/index/cumindex.lbl`, ...), so
//! the "latest" URL has to be rediscovered by listing the archive. Each such
//! index is described by a [`DynamicIndexSpec`]; the checker branches on
//! whether a key has one.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{IndexError, Result};
use crate::key::PathKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicIndexSpec {
    pub key: PathKey,
    /// Archive directories holding the release volumes, primary first. Later
    /// entries are mirrors tried only when earlier ones are unreachable.
    pub roots: Vec<String>,
    /// Regex matched against each child name of a root. The first capture
    /// group is the version token; without a group the whole match is used.
    pub pattern: String,
    /// Path of the index label inside the selected volume.
    pub target: String,
}

impl DynamicIndexSpec {
    pub fn compile_pattern(&self) -> Result<Regex> {
        Regex::new(&self.pattern)
            .map_err(|e| self.invalid(format!("bad version pattern '{}': {}", self.pattern, e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.compile_pattern()?;
        if self.roots.is_empty() {
            return Err(self.invalid("dynamic index needs at least one root"));
        }
        for root in &self.roots {
            crate::remote::directory_url(root)
                .map_err(|e| self.invalid(format!("bad root: {}", e)))?;
        }
        if self.target.trim().is_empty() {
            return Err(self.invalid("dynamic index needs a target file"));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> IndexError {
        IndexError::InvalidSpec {
            key: self.key.clone(),
            reason: reason.into(),
        }
    }
}

struct BuiltinSpec {
    key: &'static str,
    roots: &'static [&'static str],
    pattern: &'static str,
    target: &'static str,
}

const BUILTIN: &[BuiltinSpec] = &[
    BuiltinSpec {
        key: "mro.ctx.edr",
        roots: &[
            "https://planetarydata.jpl.nasa.gov/img/data/mro/ctx/",
            "https://pdsimage2.wr.usgs.gov/Mars_Reconnaissance_Orbiter/CTX/",
        ],
        pattern: r"(?i)^mrox_(\d{4})$",
        target: "index/cumindex.lbl",
    },
    BuiltinSpec {
        key: "lro.lroc.edr",
        roots: &["https://pds.lroc.asu.edu/data/LRO-L-LROC-2-EDR-V1.0/"],
        pattern: r"(?i)^LROLRC_(\d{4}[A-Z]?)$",
        target: "INDEX/CUMINDEX.LBL",
    },
];

impl BuiltinSpec {
    fn to_spec(&self) -> Result<DynamicIndexSpec> {
        Ok(DynamicIndexSpec {
            key: PathKey::parse(self.key)?,
            roots: self.roots.iter().map(|r| r.to_string()).collect(),
            pattern: self.pattern.to_string(),
            target: self.target.to_string(),
        })
    }
}

/// The set of dynamic indices known to this process.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    specs: Vec<DynamicIndexSpec>,
}

impl Catalog {
    /// The indices supported out of the box.
    pub fn builtin() -> Self {
        let specs = BUILTIN
            .iter()
            .filter_map(|b| match b.to_spec() {
                Ok(spec) => Some(spec),
                Err(e) => {
                    error!(key = b.key, error = %e, "skipping malformed built-in index");
                    None
                }
            })
            .collect();
        Self { specs }
    }

    pub fn from_specs(specs: Vec<DynamicIndexSpec>) -> Self {
        let mut catalog = Self::default();
        catalog.extend(specs);
        catalog
    }

    /// Add specs, replacing any existing spec for the same key.
    pub fn extend(&mut self, specs: impl IntoIterator<Item = DynamicIndexSpec>) {
        for spec in specs {
            match self.specs.iter_mut().find(|s| s.key == spec.key) {
                Some(existing) => *existing = spec,
                None => self.specs.push(spec),
            }
        }
    }

    pub fn get(&self, key: &PathKey) -> Option<&DynamicIndexSpec> {
        self.specs.iter().find(|s| &s.key == key)
    }

    pub fn contains(&self, key: &PathKey) -> bool {
        self.get(key).is_some()
    }

    pub fn specs(&self) -> &[DynamicIndexSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

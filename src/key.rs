//! Dotted `mission.instrument.index` identifiers.
//!
//! Every registry entry, access-log entry and check report is addressed by a
//! [`PathKey`]. Input is case-insensitive and may carry the `missions.` prefix
//! used by the registry document's root table; the stored form is always
//! lowercase with exactly three tokens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{IndexError, Result};

/// Root table of the registry document. Accepted as an optional key prefix.
pub const MISSIONS_ROOT: &str = "missions";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    mission: String,
    instrument: String,
    index: String,
}

impl PathKey {
    /// Build a key from its three tokens, normalizing case.
    pub fn new(mission: &str, instrument: &str, index: &str) -> Result<Self> {
        let raw = format!("{}.{}.{}", mission, instrument, index);
        Ok(Self {
            mission: normalize_token(mission, &raw)?,
            instrument: normalize_token(instrument, &raw)?,
            index: normalize_token(index, &raw)?,
        })
    }

    /// Parse `mission.instrument.index`, optionally prefixed with `missions.`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let mut parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() == 4 && parts[0].eq_ignore_ascii_case(MISSIONS_ROOT) {
            parts.remove(0);
        }
        match parts.as_slice() {
            [mission, instrument, index] => Self::new(mission, instrument, index).map_err(|e| {
                match e {
                    IndexError::InvalidKey { reason, .. } => IndexError::InvalidKey {
                        input: input.to_string(),
                        reason,
                    },
                    other => other,
                }
            }),
            _ => Err(IndexError::InvalidKey {
                input: input.to_string(),
                reason: format!("expected 3 dotted tokens, found {}", parts.len()),
            }),
        }
    }

    pub fn mission(&self) -> &str {
        &self.mission
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn index(&self) -> &str {
        &self.index
    }
}

fn normalize_token(token: &str, raw: &str) -> Result<String> {
    let token = token.trim();
    if token.is_empty() {
        return Err(IndexError::InvalidKey {
            input: raw.to_string(),
            reason: "empty token".to_string(),
        });
    }
    if let Some(bad) = token
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '.' | '/' | '='))
    {
        return Err(IndexError::InvalidKey {
            input: raw.to_string(),
            reason: format!("token '{}' contains '{}'", token, bad),
        });
    }
    Ok(token.to_lowercase())
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.mission, self.instrument, self.index)
    }
}

impl FromStr for PathKey {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for PathKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PathKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_case() {
        let key = PathKey::parse("Cassini.ISS.Ring_Summary").unwrap();
        assert_eq!(key.to_string(), "cassini.iss.ring_summary");
        assert_eq!(key.mission(), "cassini");
        assert_eq!(key.instrument(), "iss");
        assert_eq!(key.index(), "ring_summary");
    }

    #[test]
    fn parse_strips_missions_prefix() {
        let key = PathKey::parse("missions.mro.ctx.edr").unwrap();
        assert_eq!(key.to_string(), "mro.ctx.edr");
    }

    #[test]
    fn parse_rejects_wrong_arity() {
        assert!(matches!(
            PathKey::parse("cassini.iss"),
            Err(IndexError::InvalidKey { .. })
        ));
        assert!(PathKey::parse("a.b.c.d").is_err());
        assert!(PathKey::parse("").is_err());
    }

    #[test]
    fn parse_rejects_empty_and_separator_tokens() {
        assert!(PathKey::parse("cassini..index").is_err());
        assert!(PathKey::new("go", "ssi/x", "index").is_err());
        assert!(PathKey::new("go", "ssi", "in dex").is_err());
    }

    #[test]
    fn keys_order_by_tokens() {
        let a = PathKey::parse("cassini.iss.index").unwrap();
        let b = PathKey::parse("cassini.uvis.index").unwrap();
        let c = PathKey::parse("mro.ctx.edr").unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn serde_uses_dotted_string() {
        let key = PathKey::parse("lro.lroc.edr").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"lro.lroc.edr\"");
        let back: PathKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}

//! Clone configuration and validation

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quilt_db_dataset::SNAPSHOT_BATCH_SIZE_DEFAULT;
use quilt_db_remotes::SEND_TIMEOUT_DEFAULT_MS;

use crate::error::{CloneError, Result};

/// Configuration for one clone
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloneConfig {
    /// This clone's identity; unique in the domain
    #[serde(rename = "@id")]
    pub id: String,

    /// The shared domain, a DNS-like name the IRI bases derive from
    #[serde(rename = "@domain")]
    pub domain: String,

    /// Bootstrap with the genesis clock, without peer consultation
    #[serde(default)]
    pub genesis: bool,

    /// Constraint tree (`{"@type": "checklist" | "single-valued", ...}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<JsonValue>,

    /// Request deadline in milliseconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout: u64,

    /// Quads per streamed snapshot batch
    #[serde(default = "default_snapshot_batch_size")]
    pub snapshot_batch_size: usize,

    /// Log filter directive (e.g. "info", "quilt_db_dataset=debug")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

fn default_send_timeout() -> u64 {
    SEND_TIMEOUT_DEFAULT_MS
}

fn default_snapshot_batch_size() -> usize {
    SNAPSHOT_BATCH_SIZE_DEFAULT
}

impl CloneConfig {
    /// Minimal config for an id on a domain
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            genesis: false,
            constraint: None,
            send_timeout: default_send_timeout(),
            snapshot_batch_size: default_snapshot_batch_size(),
            log_level: None,
        }
    }

    /// Mark this clone as the domain genesis
    pub fn with_genesis(mut self) -> Self {
        self.genesis = true;
        self
    }

    /// Set the constraint tree
    pub fn with_constraint(mut self, constraint: JsonValue) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// Set the request deadline in milliseconds
    pub fn with_send_timeout(mut self, ms: u64) -> Self {
        self.send_timeout = ms;
        self
    }

    /// Validate at startup, before any I/O
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(CloneError::config("@id must not be empty"));
        }
        if self.id.contains('/') || self.id.contains('+') || self.id.contains('#') {
            return Err(CloneError::config(
                "@id must not contain topic separators or wildcards",
            ));
        }
        if self.domain.is_empty() {
            return Err(CloneError::config("@domain must not be empty"));
        }
        let dns_shaped = self.domain.split('.').all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
        if !dns_shaped {
            return Err(CloneError::config(format!(
                "@domain is not DNS-shaped: {}",
                self.domain
            )));
        }
        if self.send_timeout == 0 {
            return Err(CloneError::config("send_timeout must be > 0"));
        }
        if self.snapshot_batch_size == 0 {
            return Err(CloneError::config("snapshot_batch_size must be > 0"));
        }
        Ok(())
    }

    /// The subject base IRI of this domain
    pub fn base_iri(&self) -> String {
        quilt_vocab::domain_base(&self.domain)
    }

    /// The vocabulary base IRI of this domain
    pub fn vocab_iri(&self) -> String {
        quilt_vocab::domain_vocab(&self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = CloneConfig::new("clone-a", "test.quilt.db");
        config.validate().unwrap();
        assert_eq!(config.send_timeout, 2000);
        assert_eq!(config.snapshot_batch_size, 10);
    }

    #[test]
    fn test_rejects_bad_id() {
        assert!(CloneConfig::new("", "d.x").validate().is_err());
        assert!(CloneConfig::new("a/b", "d.x").validate().is_err());
        assert!(CloneConfig::new("a#", "d.x").validate().is_err());
    }

    #[test]
    fn test_rejects_bad_domain() {
        assert!(CloneConfig::new("a", "").validate().is_err());
        assert!(CloneConfig::new("a", "Has.Caps").validate().is_err());
        assert!(CloneConfig::new("a", "double..dot").validate().is_err());
        assert!(CloneConfig::new("a", "-lead.dash").validate().is_err());
    }

    #[test]
    fn test_deserialize_json_keys() {
        let config: CloneConfig = serde_json::from_str(
            r#"{ "@id": "a", "@domain": "test.quilt.db", "genesis": true,
                 "constraint": { "@type": "single-valued", "property": "name" } }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(config.genesis);
        assert_eq!(config.constraint.unwrap()["@type"], "single-valued");
    }

    #[test]
    fn test_iri_bases() {
        let config = CloneConfig::new("a", "test.quilt.db");
        assert_eq!(config.base_iri(), "http://test.quilt.db/");
        assert_eq!(config.vocab_iri(), "http://test.quilt.db/#");
    }
}

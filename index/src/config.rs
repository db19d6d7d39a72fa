//! Index configuration module.
//!
//! Loads the settings of the `ilindex` tool from environment variables.
//!
//! # Environment Variables
//!
//! - `ILINDEX_DATA_FILE`: Path of the index file (default: `./index.db`)
//! - `ILINDEX_CACHE_NODES`: Decoded nodes kept in memory (default: `1024`)
//! - `ILINDEX_MAX_BUCKET_SIZE`: Entries per bucket (default: `120`)
//! - `ILINDEX_MAX_BTREE_SIZE`: Children per internal node (default: `500`)
//!
//! The two limits only take effect when a file is created; an existing file
//! must match them. A full bucket and a full node must each fit in one page.

use std::path::PathBuf;

use crate::btree::{MAX_BTREE_SIZE, MAX_BUCKET_SIZE, TreeConfig};
use crate::storage::FileStore;

/// Index configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()`, `tree` always satisfies the minimum
/// limits checked by [`TreeConfig::new`] and fits the page size of an
/// `i32`/`i64` index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Path of the index file.
    pub data_file: PathBuf,
    /// Capacity of the decoded node cache.
    pub cache_nodes: usize,
    /// Bucket and node limits.
    pub tree: TreeConfig,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl IndexConfig {
    /// Default index file.
    pub const DEFAULT_DATA_FILE: &'static str = "./index.db";
    /// Default node cache capacity.
    pub const DEFAULT_CACHE_NODES: usize = 1024;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable is set but does not parse, or
    /// if the limits are below the supported minimum or too large for a page.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_file = lookup("ILINDEX_DATA_FILE")
            .filter(|value| !value.is_empty())
            .map_or_else(|| PathBuf::from(Self::DEFAULT_DATA_FILE), PathBuf::from);
        let cache_nodes = parse_count(&lookup, "ILINDEX_CACHE_NODES", Self::DEFAULT_CACHE_NODES)?;
        let max_bucket_size = parse_count(&lookup, "ILINDEX_MAX_BUCKET_SIZE", MAX_BUCKET_SIZE)?;
        let max_btree_size = parse_count(&lookup, "ILINDEX_MAX_BTREE_SIZE", MAX_BTREE_SIZE)?;

        let tree = TreeConfig::new(max_bucket_size, max_btree_size).ok_or_else(|| ConfigError::InvalidValue {
            name: "ILINDEX_MAX_BUCKET_SIZE/ILINDEX_MAX_BTREE_SIZE".to_string(),
            message: format!("limits {max_bucket_size}/{max_btree_size} are too small"),
        })?;
        FileStore::<i32, i64>::check_limits(tree).map_err(|e| ConfigError::InvalidValue {
            name: "ILINDEX_MAX_BUCKET_SIZE/ILINDEX_MAX_BTREE_SIZE".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            data_file,
            cache_nodes,
            tree,
        })
    }
}

/// Parse a non-negative count, falling back to `default` when unset.
fn parse_count(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: usize) -> Result<usize, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid count"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<IndexConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        IndexConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).expect("defaults");
        assert_eq!(config.data_file, PathBuf::from("./index.db"));
        assert_eq!(config.cache_nodes, 1024);
        assert_eq!(config.tree, TreeConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("ILINDEX_DATA_FILE", "/tmp/x.db"),
            ("ILINDEX_CACHE_NODES", "0"),
            ("ILINDEX_MAX_BUCKET_SIZE", "16"),
            ("ILINDEX_MAX_BTREE_SIZE", "8"),
        ])
        .expect("valid");
        assert_eq!(config.data_file, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.cache_nodes, 0);
        assert_eq!(config.tree.max_bucket_size(), 16);
        assert_eq!(config.tree.max_btree_size(), 8);
    }

    #[test]
    fn test_invalid_count() {
        let err = load(&[("ILINDEX_CACHE_NODES", "lots")]).expect_err("invalid");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "ILINDEX_CACHE_NODES".to_string(),
                message: "'lots' is not a valid count".to_string(),
            }
        );
    }

    #[test]
    fn test_limits_too_small() {
        let err = load(&[("ILINDEX_MAX_BUCKET_SIZE", "1")]).expect_err("too small");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_limits_too_large_for_page() {
        let err = load(&[("ILINDEX_MAX_BUCKET_SIZE", "1000")]).expect_err("bucket overflows page");
        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name.starts_with("ILINDEX_MAX_BUCKET_SIZE")));

        let err = load(&[("ILINDEX_MAX_BTREE_SIZE", "700")]).expect_err("node overflows page");
        assert!(err.to_string().contains("bytes per page"));

        // 681 twelve-byte entries and 682 children are the largest that fit
        let config = load(&[("ILINDEX_MAX_BUCKET_SIZE", "681"), ("ILINDEX_MAX_BTREE_SIZE", "682")]).expect("fits");
        assert_eq!(config.tree.max_bucket_size(), 681);
    }

    #[test]
    fn test_config_error_display_missing() {
        let error = ConfigError::MissingEnvVar("TEST_VAR".to_string());
        assert_eq!(error.to_string(), "missing required environment variable: TEST_VAR");
    }
}

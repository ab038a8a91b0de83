//! Database configuration via `trellis.toml`
//!
//! A default `trellis.toml` can be written next to the application's data;
//! every setting has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use trellis_core::{CollationRegistry, Error, Result, DEFAULT_COLLATION};
use trellis_storage::{ConversionThresholds, DEFAULT_EMBEDDED_TO_TREE_THRESHOLD};

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "trellis.toml";

/// Link collection conversion settings, `[link_bag]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkBagConfig {
    /// Size at which an embedded collection becomes tree-backed (0: always tree-backed)
    #[serde(default = "default_embedded_to_tree")]
    pub embedded_to_tree_threshold: usize,
    /// Size at or below which a tree-backed collection converts back at the
    /// next flush; negative disables reconversion
    #[serde(default = "default_tree_to_embedded")]
    pub tree_to_embedded_threshold: i64,
}

fn default_embedded_to_tree() -> usize {
    DEFAULT_EMBEDDED_TO_TREE_THRESHOLD
}

fn default_tree_to_embedded() -> i64 {
    -1
}

impl Default for LinkBagConfig {
    fn default() -> Self {
        Self {
            embedded_to_tree_threshold: default_embedded_to_tree(),
            tree_to_embedded_threshold: default_tree_to_embedded(),
        }
    }
}

/// Index defaults, `[index]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexConfig {
    /// Null policy for definitions that do not set one
    #[serde(default = "default_true")]
    pub ignore_null_values: bool,
    /// Collation for fields with none declared on the field or the property
    #[serde(default = "default_collation")]
    pub default_collation: String,
}

fn default_true() -> bool {
    true
}

fn default_collation() -> String {
    DEFAULT_COLLATION.to_string()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ignore_null_values: true,
            default_collation: default_collation(),
        }
    }
}

/// Transaction limits, `[transaction]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Maximum records one transaction may stage (0: unlimited)
    #[serde(default)]
    pub max_staged_records: usize,
}

/// Database configuration loaded from `trellis.toml`.
///
/// # Example
///
/// ```toml
/// [link_bag]
/// embedded_to_tree_threshold = 40
/// tree_to_embedded_threshold = -1
///
/// [index]
/// ignore_null_values = true
/// default_collation = "default"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrellisConfig {
    /// Link collection conversion
    #[serde(default)]
    pub link_bag: LinkBagConfig,
    /// Index defaults
    #[serde(default)]
    pub index: IndexConfig,
    /// Transaction limits
    #[serde(default)]
    pub transaction: TransactionConfig,
}

impl TrellisConfig {
    /// Conversion thresholds for link collections and index buckets
    pub fn thresholds(&self) -> ConversionThresholds {
        ConversionThresholds::from_settings(
            self.link_bag.embedded_to_tree_threshold,
            self.link_bag.tree_to_embedded_threshold,
        )
    }

    /// Check the settings against each other and against `registry`.
    ///
    /// # Errors
    ///
    /// `Config` when reconversion is enabled at or above the conversion
    /// threshold, or when the default collation does not resolve.
    pub fn validate_with(&self, registry: &CollationRegistry) -> Result<()> {
        let top = self.link_bag.embedded_to_tree_threshold;
        let bottom = self.link_bag.tree_to_embedded_threshold;
        if bottom >= 0 && (bottom as u64) >= top as u64 {
            return Err(Error::Config(format!(
                "tree_to_embedded_threshold ({}) must be below embedded_to_tree_threshold ({})",
                bottom, top
            )));
        }
        if !registry.contains(&self.index.default_collation) {
            return Err(Error::Config(format!(
                "unknown default_collation '{}'; known: {}",
                self.index.default_collation,
                registry.names().join(", ")
            )));
        }
        Ok(())
    }

    /// [`TrellisConfig::validate_with`] against the built-in collations
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&CollationRegistry::with_defaults())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Trellis database configuration

[link_bag]
# An embedded link collection becomes tree-backed when it reaches this size.
# 0 makes every collection tree-backed from the start.
embedded_to_tree_threshold = 40
# A tree-backed collection converts back to embedded at its next save when
# its size is at or below this value. Negative disables reconversion.
tree_to_embedded_threshold = -1

[index]
# Skip records with a null indexed field unless an index says otherwise.
ignore_null_values = true
# Collation for fields that declare none: "default" or "ci".
default_collation = "default"

[transaction]
# Maximum records staged by one transaction (0 = unlimited).
max_staged_records = 0
"#
    }

    /// Parse and validate config text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TrellisConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

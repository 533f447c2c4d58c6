//! Pipeline configuration loaded from TOML.
//!
//! Every field has a default, so an empty document (or no file at all)
//! describes the stock Toronto 311 export:
//!
//! ```toml
//! [catalog]
//! base_url = "https://ckan0.cf.opendata.inter.prod-toronto.ca"
//! package_id = "311-service-requests-customer-initiated"
//!
//! [export]
//! dir = "export"
//! wanted_years = [2021, 2022, 2023, 2024, 2025]
//! top_n = 15
//! exclude_canceled = true
//! concurrency = 4
//!
//! [fields]
//! status = "Service Request Status"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sr_trends_source::client::CatalogSettings;
use sr_trends_source::fields::FieldMapping;

/// Errors from loading or validating a [`PipelineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document is not valid TOML for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted key of the offending value.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// The `[export]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Directory the three CSV files are written to.
    pub dir: PathBuf,
    /// Years to resolve and export.
    pub wanted_years: BTreeSet<i32>,
    /// Types kept per year in the top-N table.
    pub top_n: usize,
    /// Drop requests whose status is exactly `Canceled`.
    pub exclude_canceled: bool,
    /// Years retrieved at the same time.
    pub concurrency: usize,
    /// File name prefix of the exported tables.
    pub file_prefix: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("export"),
            wanted_years: (2021..=2025).collect(),
            top_n: 15,
            exclude_canceled: true,
            concurrency: 4,
            file_prefix: "311".to_string(),
        }
    }
}

/// Complete configuration of one export run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where and how to reach the catalog.
    pub catalog: CatalogSettings,
    /// What to export and where.
    pub export: ExportSettings,
    /// Source column names.
    pub fields: FieldMapping,
}

impl PipelineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document does not parse or a value is
    /// out of range.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or the defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, does not parse,
    /// or holds an out-of-range value.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            log::debug!("No config file given, using defaults");
            return Ok(Self::default());
        };

        log::info!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges. Call again after applying overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.export.top_n == 0 {
            return Err(ConfigError::Invalid {
                field: "export.top_n",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.export.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "export.concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.catalog.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "catalog.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.catalog.package_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "catalog.package_id",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

//! Configuration for toolstage.
//!
//! Read from a TOML file; every field is optional and falls back to the
//! defaults in [`crate::paths`] and [`crate::invoke`].
//!
//! ```toml
//! toolsRoot = "/opt/toolstage/tools"
//! scratchDir = "/var/tmp/toolstage"
//!
//! [cache]
//! capacity = 32
//!
//! [invoke]
//! maxOutputBytes = 1048576
//! defaultTimeoutSecs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::invoke::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT, Invoker};
use crate::paths;
use crate::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Directory holding bundled packages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_root: Option<PathBuf>,

    /// Directory packages are staged into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,

    /// Dependency cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Invocation configuration
    #[serde(default)]
    pub invoke: InvokeConfig,
}

/// Dependency cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of staged tools kept; unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

/// Invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InvokeConfig {
    /// Per-stream capture limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,

    /// Deadline applied when a request sets none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

impl Config {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed TOML, unknown keys or
    /// zero-valued limits.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::configuration(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a configuration
    /// error if it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(e, Some(path), "reading configuration"))?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> Result<()> {
        if self.cache.capacity == Some(0) {
            return Err(Error::configuration("cache.capacity must be at least 1"));
        }
        if self.invoke.max_output_bytes == Some(0) {
            return Err(Error::configuration("invoke.maxOutputBytes must be at least 1"));
        }
        if self.invoke.default_timeout_secs == Some(0) {
            return Err(Error::configuration(
                "invoke.defaultTimeoutSecs must be at least 1",
            ));
        }
        Ok(())
    }

    /// The tools root, from the file or the environment default.
    ///
    /// # Errors
    ///
    /// Returns an error if no default directory can be determined.
    pub fn tools_root(&self) -> Result<PathBuf> {
        self.tools_root.clone().map_or_else(paths::tools_root, Ok)
    }

    /// The scratch directory, from the file or the environment default.
    ///
    /// # Errors
    ///
    /// Returns an error if no default directory can be determined.
    pub fn scratch_dir(&self) -> Result<PathBuf> {
        self.scratch_dir.clone().map_or_else(paths::scratch_dir, Ok)
    }

    /// Per-stream capture limit.
    #[must_use]
    pub fn max_output_bytes(&self) -> usize {
        self.invoke.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES)
    }

    /// Default invocation deadline.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.invoke
            .default_timeout_secs
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs)
    }

    /// Build the invoker these settings describe.
    #[must_use]
    pub fn invoker(&self) -> Invoker {
        Invoker::new(self.max_output_bytes(), self.default_timeout())
    }
}

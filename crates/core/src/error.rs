//! Error types for toolstage operations.
//!
//! Errors are `Clone` so that every waiter on a shared staging attempt
//! observes the same failure. I/O sources are held behind an [`Arc`].

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for toolstage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for toolstage operations.
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum Error {
    /// The host (or requested) platform has no package for this tool.
    #[error("Unsupported platform '{platform}' for tool '{tool}'")]
    #[diagnostic(
        code(toolstage::platform::unsupported),
        help("Supported platforms for this tool: {supported}")
    )]
    UnsupportedPlatform {
        /// Tool that was requested.
        tool: String,
        /// Platform that was detected or requested.
        platform: String,
        /// Comma separated list of platforms the tool declares or is bundled for.
        supported: String,
    },

    /// No bundled package matches the tool, version and platform.
    #[error("Package not found for {tool} ({requirement}) on {platform}: {reason}")]
    #[diagnostic(code(toolstage::store::not_found))]
    PackageNotFound {
        /// Tool that was requested.
        tool: String,
        /// Version requirement that was requested.
        requirement: String,
        /// Platform the package was looked up for.
        platform: String,
        /// Why no package matched.
        reason: String,
    },

    /// A package manifest or version header could not be understood.
    #[error("Invalid package descriptor at {}: {message}", path.display())]
    #[diagnostic(code(toolstage::store::invalid_descriptor))]
    InvalidDescriptor {
        /// Path of the offending file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// The package bytes do not match the recorded checksum.
    #[error("Integrity violation for {tool}: expected sha256 {expected}, got {actual}")]
    #[diagnostic(
        code(toolstage::store::integrity),
        help("The bundled package is corrupted or was replaced. Restore it from a trusted source.")
    )]
    IntegrityViolation {
        /// Tool whose package failed verification.
        tool: String,
        /// Archive that was hashed.
        path: PathBuf,
        /// Checksum recorded in the manifest.
        expected: String,
        /// Checksum computed from the archive.
        actual: String,
    },

    /// Extracting a package into the scratch directory failed.
    #[error("Failed to extract {tool} into {}: {message}", destination.display())]
    #[diagnostic(code(toolstage::store::extraction))]
    ExtractionError {
        /// Tool being extracted.
        tool: String,
        /// Destination directory.
        destination: PathBuf,
        /// What went wrong.
        message: String,
        /// Underlying I/O error, if any.
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The child process ran past its timeout and was terminated.
    #[error("{tool} timed out after {}ms and was terminated", timeout.as_millis())]
    #[diagnostic(code(toolstage::invoke::timeout))]
    TimeoutExceeded {
        /// Tool that was running.
        tool: String,
        /// Timeout that elapsed.
        timeout: Duration,
        /// Process id of the terminated child.
        pid: Option<u32>,
    },

    /// The caller cancelled the invocation and the child was terminated.
    #[error("Invocation of {tool} was cancelled")]
    #[diagnostic(code(toolstage::invoke::cancelled))]
    Cancelled {
        /// Tool that was running.
        tool: String,
        /// Process id of the terminated child.
        pid: Option<u32>,
    },

    /// The staged executable could not be launched.
    #[error("Failed to launch {}: {source}", executable.display())]
    #[diagnostic(code(toolstage::invoke::spawn))]
    Spawn {
        /// Executable that failed to start.
        executable: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// I/O error with path context.
    #[error("I/O error during {operation}: {source}")]
    #[diagnostic(code(toolstage::io))]
    Io {
        /// The underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
        /// The path where the error occurred, if applicable.
        path: Option<PathBuf>,
        /// Description of the operation that failed.
        operation: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(toolstage::config::invalid))]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// Internal invariant failure.
    #[error("Internal error: {message}")]
    #[diagnostic(code(toolstage::internal))]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Create an unsupported platform error.
    pub fn unsupported_platform(
        tool: impl Into<String>,
        platform: impl Into<String>,
        supported: impl Into<String>,
    ) -> Self {
        Self::UnsupportedPlatform {
            tool: tool.into(),
            platform: platform.into(),
            supported: supported.into(),
        }
    }

    /// Create a package not found error.
    pub fn package_not_found(
        tool: impl Into<String>,
        requirement: impl Into<String>,
        platform: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::PackageNotFound {
            tool: tool.into(),
            requirement: requirement.into(),
            platform: platform.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an extraction error, keeping the I/O source when there is one.
    pub fn extraction(
        tool: impl Into<String>,
        destination: &Path,
        message: impl Into<String>,
        source: Option<std::io::Error>,
    ) -> Self {
        Self::ExtractionError {
            tool: tool.into(),
            destination: destination.to_path_buf(),
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    /// Create an I/O error with context.
    pub fn io(source: std::io::Error, path: Option<&Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source: Arc::new(source),
            path: path.map(Path::to_path_buf),
            operation: operation.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a cached failure with this error may be retried on the next request.
    ///
    /// Only filesystem faults are transient. Platform, lookup, descriptor and
    /// integrity failures are permanent for the lifetime of the process.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExtractionError { .. } | Self::Io { .. } | Self::Internal { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io(source, None, "filesystem operation")
    }
}

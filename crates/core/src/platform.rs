//! Platform detection and per-platform package layout.
//!
//! Handles mapping between:
//! - the running host (`std::env::consts::{OS, ARCH}`)
//! - package directory names (e.g., "linux-arm64", "win-x64", "osx-arm64")
//! - common aliases ("linux-aarch64", "windows-amd64", "darwin-x86_64")

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::descriptor::ToolIdentity;
use crate::{Error, Result};

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Linux distributions.
    Linux,
    /// Windows.
    Win,
    /// macOS.
    Osx,
}

impl Os {
    /// Get the OS of the running host, if it is one packages are built for.
    #[must_use]
    pub fn current() -> Option<Self> {
        Self::parse(std::env::consts::OS)
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linux" | "unix" => Some(Self::Linux),
            "win" | "windows" | "win32nt" => Some(Self::Win),
            "osx" | "macos" | "darwin" => Some(Self::Osx),
            _ => None,
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Win => write!(f, "win"),
            Self::Osx => write!(f, "osx"),
        }
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit x86.
    X64,
    /// 64-bit ARM.
    Arm64,
}

impl Arch {
    /// Get the architecture of the running host, if packages are built for it.
    #[must_use]
    pub fn current() -> Option<Self> {
        Self::parse(std::env::consts::ARCH)
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Some(Self::X64),
            "arm64" | "aarch64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X64 => write!(f, "x64"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Platform identifier combining OS and architecture.
///
/// Renders as the package directory name, e.g. `linux-arm64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformKey {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
}

impl PlatformKey {
    /// Create a new platform key.
    #[must_use]
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Detect the running host.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` when the host OS or architecture has no
    /// package convention.
    pub fn host() -> Result<Self> {
        match (Os::current(), Arch::current()) {
            (Some(os), Some(arch)) => Ok(Self { os, arch }),
            _ => Err(Error::unsupported_platform(
                "*",
                format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
                "linux-x64, linux-arm64, win-x64, win-arm64, osx-x64, osx-arm64",
            )),
        }
    }

    /// Parse a platform string like "linux-arm64" or "darwin-aarch64".
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (os, arch) = s.trim().split_once('-')?;
        Some(Self {
            os: Os::parse(os)?,
            arch: Arch::parse(arch)?,
        })
    }

    /// The package layout used for this platform.
    #[must_use]
    pub const fn layout(&self) -> PackageLayout {
        match self.os {
            Os::Win => PackageLayout::Windows,
            Os::Linux | Os::Osx => PackageLayout::Unix,
        }
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

impl FromStr for PlatformKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::unsupported_platform("*", s, ""))
    }
}

impl TryFrom<String> for PlatformKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PlatformKey> for String {
    fn from(value: PlatformKey) -> Self {
        value.to_string()
    }
}

/// How packages for a platform lay out their executables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageLayout {
    /// Executables carry no suffix and need the executable mode bits.
    Unix,
    /// Executables carry an `.exe` suffix; no mode bits.
    Windows,
}

impl PackageLayout {
    /// Executable path as it appears inside the package for this layout.
    ///
    /// `bin/wget` becomes `bin/wget.exe` on Windows unless it already
    /// carries an extension.
    #[must_use]
    pub fn executable_name(&self, declared: &str) -> String {
        match self {
            Self::Unix => declared.to_string(),
            Self::Windows => {
                let has_extension = std::path::Path::new(declared).extension().is_some();
                if has_extension {
                    declared.to_string()
                } else {
                    format!("{declared}.exe")
                }
            }
        }
    }

    /// Whether extracted executables must be marked executable.
    #[must_use]
    pub const fn needs_exec_bit(&self) -> bool {
        matches!(self, Self::Unix)
    }
}

/// Maps a tool request to the platform packages are resolved for.
///
/// The key is fixed when the resolver is built and never changes afterwards.
#[derive(Debug, Clone)]
pub struct PlatformResolver {
    key: PlatformKey,
}

impl PlatformResolver {
    /// Build a resolver for the running host.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` if the host cannot be mapped to a key.
    pub fn detect() -> Result<Self> {
        Ok(Self {
            key: PlatformKey::host()?,
        })
    }

    /// Build a resolver pinned to a given platform.
    #[must_use]
    pub const fn fixed(key: PlatformKey) -> Self {
        Self { key }
    }

    /// The platform this resolver resolves for.
    #[must_use]
    pub const fn platform(&self) -> PlatformKey {
        self.key
    }

    /// Resolve the platform a tool should be staged for.
    ///
    /// `bundled` lists the platforms packages exist for. When it is empty the
    /// tool is not bundled at all and the store reports it as not found.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` when the tool declares a platform set that
    /// does not include this resolver's platform, or when packages exist only
    /// for other platforms.
    pub fn resolve(&self, identity: &ToolIdentity, bundled: &[PlatformKey]) -> Result<PlatformKey> {
        let unsupported = |supported: Vec<String>| -> Result<PlatformKey> {
            Err(Error::unsupported_platform(
                &identity.name,
                self.key.to_string(),
                supported.join(", "),
            ))
        };
        if !identity.supports(self.key) {
            return unsupported(identity.platforms.iter().map(ToString::to_string).collect());
        }
        if !bundled.is_empty() && !bundled.contains(&self.key) {
            return unsupported(bundled.iter().map(ToString::to_string).collect());
        }
        Ok(self.key)
    }
}

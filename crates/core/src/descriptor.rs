//! Tool identities, version descriptors and package manifests.
//!
//! A bundled package is described by a `package.json` manifest that sits in
//! its platform directory:
//!
//! ```text
//! <tools-root>/wget/linux-arm64/
//! ├── package.json          # PackageManifest
//! ├── wget-2.1.0.tar.gz     # archive named by the manifest
//! └── include/wget/wgetver.h (optional version header)
//! ```

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use crate::platform::PlatformKey;
use crate::{Error, Result};

/// File name of the package manifest inside a platform directory.
pub const MANIFEST_FILE: &str = "package.json";

/// A logical tool request: name, version requirement and declared platforms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolIdentity {
    /// Tool name, also the directory name under the tools root.
    pub name: String,
    /// Versions that satisfy the request.
    pub requirement: VersionReq,
    /// Platforms the tool is declared for. Empty means any platform.
    pub platforms: BTreeSet<PlatformKey>,
}

impl ToolIdentity {
    /// Create an identity from a name and a requirement string.
    ///
    /// A bare version such as `2.1.0` is treated as an exact match;
    /// anything else is parsed as a semver requirement (`^2`, `>=1.20, <2`, `*`).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for empty names, names containing path
    /// separators, or unparsable requirements.
    pub fn new(name: impl Into<String>, requirement: &str) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::configuration(format!("invalid tool name '{name}'")));
        }
        Ok(Self {
            name,
            requirement: parse_requirement(requirement)?,
            platforms: BTreeSet::new(),
        })
    }

    /// Restrict the identity to a set of supported platforms.
    #[must_use]
    pub fn with_platforms(mut self, platforms: impl IntoIterator<Item = PlatformKey>) -> Self {
        self.platforms.extend(platforms);
        self
    }

    /// Whether the tool may be staged for `platform`.
    #[must_use]
    pub fn supports(&self, platform: PlatformKey) -> bool {
        self.platforms.is_empty() || self.platforms.contains(&platform)
    }
}

impl fmt::Display for ToolIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.requirement)
    }
}

/// Parse a version requirement, treating a bare version as exact.
fn parse_requirement(requirement: &str) -> Result<VersionReq> {
    let trimmed = requirement.trim();
    if trimmed.is_empty() {
        return Ok(VersionReq::STAR);
    }
    if let Ok(version) = Version::parse(trimmed) {
        return VersionReq::parse(&format!("={version}"))
            .map_err(|e| Error::configuration(format!("invalid version '{trimmed}': {e}")));
    }
    VersionReq::parse(trimmed)
        .map_err(|e| Error::configuration(format!("invalid version requirement '{trimmed}': {e}")))
}

/// Immutable record of a package's declared name and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    /// Tool name.
    pub name: String,
    /// Declared version.
    pub version: Version,
}

impl VersionDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parse the version constants of a C header shipped with a package.
    ///
    /// Recognises `#define <PREFIX>VERSION "x.y.z"` and, when no string
    /// constant is present, the numeric `<PREFIX>VERSION_MAJOR`, `_MINOR` and
    /// `_PATCH` defines.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDescriptor` when no usable version is found or the
    /// string and numeric constants disagree.
    pub fn from_header(name: impl Into<String>, header: &str, path: &Path) -> Result<Self> {
        let mut defines = BTreeMap::new();
        for line in header.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() != Some("#define") {
                continue;
            }
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            defines.insert(key.to_string(), value.trim_matches('"').to_string());
        }

        let string_version = defines
            .iter()
            .find(|(k, _)| k.ends_with("_VERSION") || k.as_str() == "VERSION")
            .map(|(_, v)| v.clone());
        let component = |suffix: &str| -> Option<u64> {
            defines
                .iter()
                .find(|(k, _)| k.ends_with(suffix))
                .and_then(|(_, v)| v.parse().ok())
        };
        let numeric = match (
            component("_VERSION_MAJOR"),
            component("_VERSION_MINOR"),
            component("_VERSION_PATCH"),
        ) {
            (Some(major), Some(minor), patch) => {
                Some(Version::new(major, minor, patch.unwrap_or(0)))
            }
            _ => None,
        };

        let version = match (string_version, numeric) {
            (Some(text), numeric) => {
                let parsed = Version::parse(&text).map_err(|e| {
                    Error::invalid_descriptor(path, format!("bad version string '{text}': {e}"))
                })?;
                if let Some(numeric) = numeric
                    && (numeric.major, numeric.minor, numeric.patch)
                        != (parsed.major, parsed.minor, parsed.patch)
                {
                    return Err(Error::invalid_descriptor(
                        path,
                        format!("version string {parsed} disagrees with numeric defines {numeric}"),
                    ));
                }
                parsed
            }
            (None, Some(numeric)) => numeric,
            (None, None) => {
                return Err(Error::invalid_descriptor(path, "no version defines found"));
            }
        };

        Ok(Self::new(name, version))
    }
}

/// Archive format of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// `.zip`
    Zip,
    /// `.tar.gz`, `.tgz`, `.tar.gzip`
    Tgz,
    /// `.tar`
    Tar,
    /// A single executable file, copied as-is.
    Raw,
}

impl ArchiveKind {
    /// Infer the archive kind from a file name (case-insensitive).
    ///
    /// Unknown extensions are treated as raw executables.
    #[must_use]
    pub fn from_file_name(file_name: &str) -> Self {
        let lower = file_name.trim().to_lowercase();
        if lower.ends_with(".zip") {
            Self::Zip
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || lower.ends_with(".tar.gzip")
        {
            Self::Tgz
        } else if lower.ends_with(".tar") {
            Self::Tar
        } else {
            Self::Raw
        }
    }
}

/// Contents of a `package.json` manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Tool name.
    pub name: String,
    /// Packaged version.
    pub version: Version,
    /// Archive file, relative to the manifest directory.
    pub archive: String,
    /// Expected SHA-256 of the archive, hex encoded.
    pub sha256: String,
    /// Executable path inside the extracted package.
    pub executable: String,
    /// Archive format; inferred from the archive name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_type: Option<ArchiveKind>,
    /// Optional version header, relative to the manifest directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_header: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl PackageManifest {
    /// Parse and validate a manifest.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDescriptor` for malformed JSON, a malformed checksum,
    /// or paths that escape the package directory.
    pub fn from_json(contents: &str, path: &Path) -> Result<Self> {
        let manifest: Self = serde_json::from_str(contents)
            .map_err(|e| Error::invalid_descriptor(path, e.to_string()))?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.sha256.len() != 64 || !self.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::invalid_descriptor(
                path,
                "sha256 must be 64 hexadecimal characters",
            ));
        }
        for (field, value) in [
            ("archive", Some(self.archive.as_str())),
            ("executable", Some(self.executable.as_str())),
            ("versionHeader", self.version_header.as_deref()),
        ] {
            if let Some(value) = value
                && !is_contained(value)
            {
                return Err(Error::invalid_descriptor(
                    path,
                    format!("{field} '{value}' must be a relative path inside the package"),
                ));
            }
        }
        Ok(())
    }

    /// Archive format, explicit or inferred.
    #[must_use]
    pub fn archive_kind(&self) -> ArchiveKind {
        self.archive_type
            .unwrap_or_else(|| ArchiveKind::from_file_name(&self.archive))
    }

    /// The version descriptor this manifest declares.
    #[must_use]
    pub fn descriptor(&self) -> VersionDescriptor {
        VersionDescriptor::new(&self.name, self.version.clone())
    }
}

/// Whether a manifest path stays inside its package directory.
fn is_contained(value: &str) -> bool {
    let path = Path::new(value);
    !value.is_empty()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};

    const SHA: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_identity_exact_version() {
        let id = ToolIdentity::new("wget", "2.1.0").unwrap();
        assert!(id.requirement.matches(&Version::new(2, 1, 0)));
        assert!(!id.requirement.matches(&Version::new(2, 1, 1)));
    }

    #[test]
    fn test_identity_range() {
        let id = ToolIdentity::new("wget", ">=2.0, <3").unwrap();
        assert!(id.requirement.matches(&Version::new(2, 9, 0)));
        assert!(!id.requirement.matches(&Version::new(3, 0, 0)));

        let any = ToolIdentity::new("wget", "").unwrap();
        assert!(any.requirement.matches(&Version::new(0, 0, 1)));
    }

    #[test]
    fn test_identity_rejects_bad_names() {
        assert!(ToolIdentity::new("", "*").is_err());
        assert!(ToolIdentity::new("../etc", "*").is_err());
        assert!(ToolIdentity::new("wget", "not a version").is_err());
    }

    #[test]
    fn test_identity_platform_support() {
        let id = ToolIdentity::new("wget", "*")
            .unwrap()
            .with_platforms([PlatformKey::new(Os::Linux, Arch::Arm64)]);
        assert!(id.supports(PlatformKey::new(Os::Linux, Arch::Arm64)));
        assert!(!id.supports(PlatformKey::new(Os::Win, Arch::X64)));
        assert_eq!(id.to_string(), "wget@*");
    }

    #[test]
    fn test_header_string_version() {
        let header = r#"
#ifndef WGET_WGETVER_H
#define WGET_WGETVER_H

#define LIBWGET_VERSION "2.1.0"
#define LIBWGET_VERSION_MAJOR 2
#define LIBWGET_VERSION_MINOR 1
#define LIBWGET_VERSION_PATCH 0
#define LIBWGET_VERSION_NUMBER 0x020100

#endif
"#;
        let desc = VersionDescriptor::from_header("wget", header, Path::new("wgetver.h")).unwrap();
        assert_eq!(desc.version, Version::new(2, 1, 0));
        assert_eq!(desc.name, "wget");
    }

    #[test]
    fn test_header_numeric_only() {
        let header = "#define FOO_VERSION_MAJOR 1\n#define FOO_VERSION_MINOR 4\n";
        let desc = VersionDescriptor::from_header("foo", header, Path::new("foo.h")).unwrap();
        assert_eq!(desc.version, Version::new(1, 4, 0));
    }

    #[test]
    fn test_header_disagreement() {
        let header = "#define FOO_VERSION \"1.2.3\"\n#define FOO_VERSION_MAJOR 1\n#define FOO_VERSION_MINOR 3\n";
        let err = VersionDescriptor::from_header("foo", header, Path::new("foo.h")).unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_header_missing_version() {
        let err =
            VersionDescriptor::from_header("foo", "int main(void);", Path::new("foo.h")).unwrap_err();
        assert!(err.to_string().contains("no version defines"));
    }

    #[test]
    fn test_archive_kind_inference() {
        assert_eq!(ArchiveKind::from_file_name("wget.zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::from_file_name("wget-2.1.0.TAR.GZ"), ArchiveKind::Tgz);
        assert_eq!(ArchiveKind::from_file_name("wget.tgz"), ArchiveKind::Tgz);
        assert_eq!(ArchiveKind::from_file_name("wget.tar.gzip"), ArchiveKind::Tgz);
        assert_eq!(ArchiveKind::from_file_name("wget.tar"), ArchiveKind::Tar);
        assert_eq!(ArchiveKind::from_file_name("wget"), ArchiveKind::Raw);
    }

    #[test]
    fn test_manifest_parse() {
        let json = format!(
            r#"{{
                "name": "wget",
                "version": "2.1.0",
                "archive": "wget-2.1.0.tar.gz",
                "sha256": "{SHA}",
                "executable": "bin/wget",
                "versionHeader": "include/wget/wgetver.h",
                "metadata": {{ "license": "GPL-3.0" }}
            }}"#
        );
        let manifest = PackageManifest::from_json(&json, Path::new("package.json")).unwrap();
        assert_eq!(manifest.archive_kind(), ArchiveKind::Tgz);
        assert_eq!(manifest.descriptor().version, Version::new(2, 1, 0));
        assert_eq!(manifest.metadata.get("license").unwrap(), "GPL-3.0");
    }

    #[test]
    fn test_manifest_explicit_archive_type() {
        let json = format!(
            r#"{{"name":"t","version":"1.0.0","archive":"t.bin","sha256":"{SHA}","executable":"t","archiveType":"zip"}}"#
        );
        let manifest = PackageManifest::from_json(&json, Path::new("package.json")).unwrap();
        assert_eq!(manifest.archive_kind(), ArchiveKind::Zip);
    }

    #[test]
    fn test_manifest_rejects_escaping_paths() {
        let json = format!(
            r#"{{"name":"t","version":"1.0.0","archive":"../t.tgz","sha256":"{SHA}","executable":"t"}}"#
        );
        let err = PackageManifest::from_json(&json, Path::new("package.json")).unwrap_err();
        assert!(err.to_string().contains("archive"));

        let json = format!(
            r#"{{"name":"t","version":"1.0.0","archive":"t.tgz","sha256":"{SHA}","executable":"/usr/bin/t"}}"#
        );
        assert!(PackageManifest::from_json(&json, Path::new("package.json")).is_err());
    }

    #[test]
    fn test_manifest_rejects_bad_checksum() {
        let json = r#"{"name":"t","version":"1.0.0","archive":"t.tgz","sha256":"xyz","executable":"t"}"#;
        let err = PackageManifest::from_json(json, Path::new("package.json")).unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor { .. }));
    }
}

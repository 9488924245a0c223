//! Package store: locate, verify and extract bundled tool packages.
//!
//! Packages are read from the tools root and staged into the scratch root:
//!
//! ```text
//! <tools-root>/
//! └── wget/
//!     ├── linux-arm64/
//!     │   ├── package.json
//!     │   └── wget-2.1.0.tar.gz
//!     └── linux-x64/
//!         ├── 2.0.0/package.json      # several versions may be bundled
//!         └── 2.1.0/package.json
//!
//! <scratch-root>/
//! └── wget/2.1.0/linux-arm64/         # staged package
//!     ├── .toolstage-staged           # checksum marker
//!     └── bin/wget
//! ```

use semver::Version;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::archive;
use crate::descriptor::{MANIFEST_FILE, PackageManifest, ToolIdentity, VersionDescriptor};
use crate::platform::PlatformKey;
use crate::{Error, Result};

/// Marker written into a staged directory once extraction completed.
const STAGED_MARKER: &str = ".toolstage-staged";

/// A package found in the tools root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLocation {
    /// Platform the package was built for.
    pub platform: PlatformKey,
    /// Directory holding the manifest and archive.
    pub package_dir: PathBuf,
    /// Parsed manifest.
    pub manifest: PackageManifest,
}

impl PackageLocation {
    /// Tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Packaged version.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    /// Path of the package archive.
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.package_dir.join(&self.manifest.archive)
    }

    /// Executable path inside the staged package for this platform's layout.
    #[must_use]
    pub fn executable_name(&self) -> String {
        self.platform.layout().executable_name(&self.manifest.executable)
    }
}

/// A verified, extracted tool ready to be invoked.
///
/// The staged directory belongs to the dependency cache entry that produced
/// it; this value is a handle to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedTool {
    /// Tool name.
    pub name: String,
    /// Staged version.
    pub version: Version,
    /// Platform the package was built for.
    pub platform: PlatformKey,
    /// Root of the staged package.
    pub root: PathBuf,
    /// Absolute path of the executable.
    pub executable: PathBuf,
    /// SHA-256 of the archive the tool was staged from.
    pub sha256: String,
}

/// Reads packages from a tools root and stages them into a scratch root.
///
/// Clones share their staging locks, so two requests resolving to the same
/// package never extract into its destination at the same time.
#[derive(Debug, Clone)]
pub struct PackageStore {
    tools_root: PathBuf,
    scratch_root: PathBuf,
    destinations: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PackageStore {
    /// Create a store.
    #[must_use]
    pub fn new(tools_root: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            tools_root: tools_root.into(),
            scratch_root: scratch_root.into(),
            destinations: Arc::default(),
        }
    }

    fn destination_lock(&self, destination: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .destinations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(destination.to_path_buf()).or_default())
    }

    /// Root directory packages are read from.
    #[must_use]
    pub fn tools_root(&self) -> &Path {
        &self.tools_root
    }

    /// Root directory packages are staged into.
    #[must_use]
    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Directory holding the packages of `name` for `platform`.
    #[must_use]
    pub fn platform_dir(&self, name: &str, platform: PlatformKey) -> PathBuf {
        self.tools_root.join(name).join(platform.to_string())
    }

    /// Platforms `name` is bundled for, sorted.
    ///
    /// Empty when the tool is not bundled at all. Directories whose names are
    /// not platform keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the tool directory cannot be listed.
    pub async fn platforms(&self, name: &str) -> Result<Vec<PlatformKey>> {
        let tool_dir = self.tools_root.join(name);
        if !tokio::fs::try_exists(&tool_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut platforms: Vec<_> = subdirs(&tool_dir)
            .await?
            .iter()
            .filter_map(|dir| dir.file_name()?.to_str().and_then(PlatformKey::parse))
            .collect();
        platforms.sort();
        platforms.dedup();
        Ok(platforms)
    }

    /// Primary staging destination for a package.
    #[must_use]
    pub fn staging_dir(&self, location: &PackageLocation) -> PathBuf {
        self.scratch_root
            .join(location.name())
            .join(location.version().to_string())
            .join(location.platform.to_string())
    }

    /// Find the highest bundled version of a tool that satisfies the request.
    ///
    /// # Errors
    ///
    /// Returns `PackageNotFound` when the platform directory, a matching
    /// manifest, or its archive is missing, and `InvalidDescriptor` for
    /// malformed manifests or a version header that disagrees with its manifest.
    pub async fn locate(
        &self,
        identity: &ToolIdentity,
        platform: PlatformKey,
    ) -> Result<PackageLocation> {
        let not_found = |reason: String| {
            Error::package_not_found(
                &identity.name,
                identity.requirement.to_string(),
                platform.to_string(),
                reason,
            )
        };

        let dir = self.platform_dir(&identity.name, platform);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(not_found(format!("no package directory {}", dir.display())));
        }

        let mut candidates = Vec::new();
        for manifest_dir in manifest_dirs(&dir).await? {
            let manifest = read_manifest(&manifest_dir).await?;
            if manifest.name != identity.name {
                return Err(Error::invalid_descriptor(
                    manifest_dir.join(MANIFEST_FILE),
                    format!(
                        "manifest names '{}' but lives under '{}'",
                        manifest.name, identity.name
                    ),
                ));
            }
            candidates.push(PackageLocation {
                platform,
                package_dir: manifest_dir,
                manifest,
            });
        }

        if candidates.is_empty() {
            return Err(not_found(format!("no {MANIFEST_FILE} under {}", dir.display())));
        }

        let available = candidates
            .iter()
            .map(|c| c.version().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let Some(location) = candidates
            .into_iter()
            .filter(|c| identity.requirement.matches(c.version()))
            .max_by(|a, b| a.version().cmp(b.version()))
        else {
            return Err(not_found(format!(
                "no bundled version satisfies the requirement (available: {available})"
            )));
        };

        let archive = location.archive_path();
        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            return Err(not_found(format!("archive {} is missing", archive.display())));
        }

        if let Some(header) = &location.manifest.version_header {
            check_version_header(&location, &location.package_dir.join(header)).await?;
        }

        debug!(
            tool = %identity.name,
            version = %location.version(),
            %platform,
            dir = ?location.package_dir,
            "Located package"
        );
        Ok(location)
    }

    /// Check the archive against the checksum recorded in its manifest.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` on mismatch, or an I/O error when the
    /// archive cannot be read.
    pub async fn verify(&self, location: &PackageLocation) -> Result<bool> {
        let archive = location.archive_path();
        let path = archive.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| Error::internal(format!("checksum task failed: {e}")))?
            .map_err(|e| Error::io(e, Some(&archive), "hashing package archive"))?;

        if actual.eq_ignore_ascii_case(&location.manifest.sha256) {
            debug!(tool = location.name(), sha256 = %actual, "Package checksum verified");
            Ok(true)
        } else {
            Err(Error::IntegrityViolation {
                tool: location.name().to_string(),
                path: archive,
                expected: location.manifest.sha256.to_lowercase(),
                actual,
            })
        }
    }

    /// Extract a package into `destination`.
    ///
    /// A destination already carrying a completed staging of the same archive
    /// is reused as-is. Extraction happens in a sibling temporary directory
    /// that is renamed into place, so partial extractions are never observed.
    ///
    /// # Errors
    ///
    /// Returns `ExtractionError` on filesystem faults and `InvalidDescriptor`
    /// if the package does not contain its declared executable.
    pub async fn extract(
        &self,
        location: &PackageLocation,
        destination: &Path,
    ) -> Result<StagedTool> {
        let staged = StagedTool {
            name: location.name().to_string(),
            version: location.version().clone(),
            platform: location.platform,
            root: destination.to_path_buf(),
            executable: destination.join(location.executable_name()),
            sha256: location.manifest.sha256.to_lowercase(),
        };

        if is_staged(destination, &staged).await {
            debug!(tool = %staged.name, ?destination, "Package already staged");
            return Ok(staged);
        }

        let location = location.clone();
        let destination = destination.to_path_buf();
        let result = staged.clone();
        tokio::task::spawn_blocking(move || extract_blocking(&location, &destination, &result))
            .await
            .map_err(|e| Error::internal(format!("extraction task failed: {e}")))??;

        info!(
            tool = %staged.name,
            version = %staged.version,
            platform = %staged.platform,
            root = ?staged.root,
            "Staged package"
        );
        Ok(staged)
    }

    /// Verify a package and extract it, retrying extraction once.
    ///
    /// The retry goes to a freshly chosen destination next to the primary
    /// one. Integrity failures are never retried.
    ///
    /// # Errors
    ///
    /// Returns the verification error, or the extraction error of the
    /// second attempt.
    pub async fn stage(&self, location: &PackageLocation) -> Result<StagedTool> {
        self.verify(location).await?;

        let primary = self.staging_dir(location);
        let lock = self.destination_lock(&primary);
        let _guard = lock.lock().await;
        match self.extract(location, &primary).await {
            Err(first @ Error::ExtractionError { .. }) => {
                let fresh = primary.with_file_name(format!(
                    "{}-{}",
                    location.platform,
                    uuid::Uuid::new_v4().simple()
                ));
                warn!(
                    tool = location.name(),
                    error = %first,
                    retry = ?fresh,
                    "Extraction failed, retrying into a fresh destination"
                );
                self.extract(location, &fresh).await
            }
            other => other,
        }
    }

    /// List every package bundled under the tools root.
    ///
    /// Directories whose names are not platform keys are skipped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDescriptor` for malformed manifests and I/O errors for
    /// unreadable directories.
    pub async fn discover(&self) -> Result<Vec<PackageLocation>> {
        let mut found = Vec::new();
        if !tokio::fs::try_exists(&self.tools_root).await.unwrap_or(false) {
            return Ok(found);
        }

        for tool_dir in subdirs(&self.tools_root).await? {
            for platform_dir in subdirs(&tool_dir).await? {
                let Some(platform) = platform_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(PlatformKey::parse)
                else {
                    debug!(dir = ?platform_dir, "Skipping non-platform directory");
                    continue;
                };
                for manifest_dir in manifest_dirs(&platform_dir).await? {
                    let manifest = read_manifest(&manifest_dir).await?;
                    found.push(PackageLocation {
                        platform,
                        package_dir: manifest_dir,
                        manifest,
                    });
                }
            }
        }

        found.sort_by(|a, b| {
            (a.name(), a.platform, a.version()).cmp(&(b.name(), b.platform, b.version()))
        });
        Ok(found)
    }
}

/// Directories under a platform directory that hold a manifest: the
/// platform directory itself and any direct version sub-directory.
async fn manifest_dirs(platform_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if tokio::fs::try_exists(platform_dir.join(MANIFEST_FILE))
        .await
        .unwrap_or(false)
    {
        dirs.push(platform_dir.to_path_buf());
    }
    for sub in subdirs(platform_dir).await? {
        if tokio::fs::try_exists(sub.join(MANIFEST_FILE))
            .await
            .unwrap_or(false)
        {
            dirs.push(sub);
        }
    }
    Ok(dirs)
}

async fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io(e, Some(dir), "listing directory"))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io(e, Some(dir), "listing directory"))?
    {
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_manifest(dir: &Path) -> Result<PackageManifest> {
    let path = dir.join(MANIFEST_FILE);
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| Error::io(e, Some(&path), "reading package manifest"))?;
    PackageManifest::from_json(&contents, &path)
}

async fn check_version_header(location: &PackageLocation, header: &Path) -> Result<()> {
    let contents = tokio::fs::read_to_string(header)
        .await
        .map_err(|e| Error::invalid_descriptor(header, format!("unreadable version header: {e}")))?;
    let declared = VersionDescriptor::from_header(location.name(), &contents, header)?;
    let manifest = location.manifest.descriptor();
    if declared != manifest {
        return Err(Error::invalid_descriptor(
            header,
            format!(
                "header declares {} {} but manifest declares {} {}",
                declared.name, declared.version, manifest.name, manifest.version
            ),
        ));
    }
    Ok(())
}

async fn is_staged(destination: &Path, staged: &StagedTool) -> bool {
    match tokio::fs::read_to_string(destination.join(STAGED_MARKER)).await {
        Ok(marker) => {
            marker.trim() == staged.sha256
                && tokio::fs::try_exists(&staged.executable)
                    .await
                    .unwrap_or(false)
        }
        Err(_) => false,
    }
}

fn extract_blocking(
    location: &PackageLocation,
    destination: &Path,
    staged: &StagedTool,
) -> Result<()> {
    let tool = location.name();
    let fault = |message: &str, e: io::Error| Error::extraction(tool, destination, message, Some(e));

    if destination.exists() {
        std::fs::remove_dir_all(destination)
            .map_err(|e| fault("cannot clear stale destination", e))?;
    }
    let parent = destination.parent().ok_or_else(|| {
        Error::extraction(tool, destination, "destination has no parent directory", None)
    })?;
    std::fs::create_dir_all(parent).map_err(|e| fault("cannot create scratch directory", e))?;

    let temp = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(parent)
        .map_err(|e| fault("cannot create temporary directory", e))?;

    let executable_name = location.executable_name();
    archive::unpack(
        location.manifest.archive_kind(),
        &location.archive_path(),
        temp.path(),
        &executable_name,
    )
    .map_err(|e| fault("cannot unpack archive", e))?;

    let executable = temp.path().join(&executable_name);
    if !executable.is_file() {
        return Err(Error::invalid_descriptor(
            location.package_dir.join(MANIFEST_FILE),
            format!("executable '{executable_name}' is not in the package"),
        ));
    }
    if location.platform.layout().needs_exec_bit() {
        archive::make_executable(&executable)
            .map_err(|e| fault("cannot mark executable", e))?;
    }

    std::fs::write(temp.path().join(STAGED_MARKER), &staged.sha256)
        .map_err(|e| fault("cannot write staging marker", e))?;
    std::fs::rename(temp.path(), destination)
        .map_err(|e| fault("cannot move staged package into place", e))?;
    Ok(())
}

/// Hex encoded SHA-256 of a file, streamed in chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

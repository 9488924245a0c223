//! Dependency cache of staged tools.
//!
//! The cache maps a tool request and platform to a [`PackageRecord`] and
//! guarantees that at most one staging runs per key. Concurrent requests for
//! the same key wait on the first attempt and all receive its outcome.
//!
//! The map lock only guards state transitions. Staging itself runs on a
//! spawned task, outside the lock, so a waiter that is dropped does not cancel
//! a staging other waiters depend on.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::descriptor::ToolIdentity;
use crate::platform::PlatformKey;
use crate::store::StagedTool;
use crate::{Error, Result};

/// Key of a cache entry: the requested tool and the platform it resolves for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    /// Tool name.
    pub name: String,
    /// Version requirement as requested.
    pub requirement: String,
    /// Resolved platform.
    pub platform: PlatformKey,
}

impl CacheKey {
    /// Build the key for a request.
    #[must_use]
    pub fn new(identity: &ToolIdentity, platform: PlatformKey) -> Self {
        Self {
            name: identity.name.clone(),
            requirement: identity.requirement.to_string(),
            platform,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.requirement, self.platform)
    }
}

/// Extraction state of a package record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingState {
    /// Never staged, or evicted.
    NotStaged,
    /// A staging attempt is in flight.
    Staging,
    /// Staged and ready.
    Staged,
    /// The last attempt failed.
    Failed,
}

/// Snapshot of a cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct PackageRecord {
    /// Entry key.
    pub key: CacheKey,
    /// Current state.
    pub state: StagingState,
    /// Staged tool, when staged.
    pub staged: Option<StagedTool>,
    /// Failure message, when failed.
    pub error: Option<String>,
}

type Outcome = Option<Result<StagedTool>>;

enum Slot {
    Staging(watch::Receiver<Outcome>),
    Staged { tool: StagedTool, last_used: u64 },
    Failed(Error),
}

impl Slot {
    const fn state(&self) -> StagingState {
        match self {
            Self::Staging(_) => StagingState::Staging,
            Self::Staged { .. } => StagingState::Staged,
            Self::Failed(_) => StagingState::Failed,
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: HashMap<CacheKey, Slot>,
    clock: u64,
}

enum Action {
    Wait(watch::Receiver<Outcome>),
    Lead(watch::Sender<Outcome>, watch::Receiver<Outcome>),
}

/// Process-scoped cache of staged tools.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct DependencyCache {
    inner: Arc<Mutex<Inner>>,
    capacity: Option<usize>,
    stagings: Arc<AtomicUsize>,
}

impl fmt::Debug for DependencyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyCache")
            .field("entries", &self.lock().slots.len())
            .field("capacity", &self.capacity)
            .field("stagings", &self.staging_count())
            .finish()
    }
}

impl Default for DependencyCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl DependencyCache {
    /// Create a cache keeping at most `capacity` staged tools (unbounded if `None`).
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            capacity,
            stagings: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of staging operations started since the cache was created.
    #[must_use]
    pub fn staging_count(&self) -> usize {
        self.stagings.load(Ordering::SeqCst)
    }

    /// Current state of an entry.
    #[must_use]
    pub fn state(&self, key: &CacheKey) -> StagingState {
        self.lock()
            .slots
            .get(key)
            .map_or(StagingState::NotStaged, Slot::state)
    }

    /// Snapshot of every entry, sorted by key.
    #[must_use]
    pub fn records(&self) -> Vec<PackageRecord> {
        let inner = self.lock();
        let mut records: Vec<_> = inner
            .slots
            .iter()
            .map(|(key, slot)| PackageRecord {
                key: key.clone(),
                state: slot.state(),
                staged: match slot {
                    Slot::Staged { tool, .. } => Some(tool.clone()),
                    _ => None,
                },
                error: match slot {
                    Slot::Failed(e) => Some(e.to_string()),
                    _ => None,
                },
            })
            .collect();
        records.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        records
    }

    /// Return the staged tool for `key`, running `stage` if needed.
    ///
    /// - A staged entry is returned without calling `stage`.
    /// - A permanent failure is returned from cache.
    /// - A transient failure, or no entry, starts a new staging.
    /// - An in-flight staging is awaited.
    ///
    /// # Errors
    ///
    /// Returns the staging error, shared by every waiter of the attempt.
    pub async fn get_or_stage<F, Fut>(&self, key: &CacheKey, stage: F) -> Result<StagedTool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StagedTool>> + Send + 'static,
    {
        let action = {
            let mut inner = self.lock();
            inner.clock += 1;
            let now = inner.clock;
            match inner.slots.get_mut(key) {
                Some(Slot::Staged { tool, last_used }) => {
                    *last_used = now;
                    debug!(%key, "Dependency cache hit");
                    return Ok(tool.clone());
                }
                Some(Slot::Failed(err)) if !err.is_transient() => {
                    debug!(%key, error = %err, "Returning cached permanent failure");
                    return Err(err.clone());
                }
                Some(Slot::Staging(rx)) => {
                    debug!(%key, "Waiting on in-flight staging");
                    Action::Wait(rx.clone())
                }
                previous => {
                    if let Some(Slot::Failed(err)) = previous {
                        info!(%key, error = %err, "Retrying after transient failure");
                    } else {
                        debug!(%key, "Dependency cache miss");
                    }
                    let (tx, rx) = watch::channel(None);
                    inner.slots.insert(key.clone(), Slot::Staging(rx.clone()));
                    Action::Lead(tx, rx)
                }
            }
        };

        let rx = match action {
            Action::Wait(rx) => rx,
            Action::Lead(tx, rx) => {
                self.stagings.fetch_add(1, Ordering::SeqCst);
                let fut = stage();
                let cache = self.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let outcome = fut.await;
                    let evicted = cache.complete(&key, &outcome);
                    // Waiters may all be gone; the result is still recorded.
                    let _ = tx.send(Some(outcome));
                    reclaim(evicted).await;
                });
                rx
            }
        };

        self.wait(key, rx).await
    }

    async fn wait(&self, key: &CacheKey, mut rx: watch::Receiver<Outcome>) -> Result<StagedTool> {
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        if let Some(outcome) = outcome {
            return outcome;
        }

        // The staging task ended without reporting, e.g. it panicked.
        let mut inner = self.lock();
        if matches!(inner.slots.get(key), Some(Slot::Staging(_))) {
            inner.slots.remove(key);
        }
        Err(Error::internal(format!("staging of {key} ended without a result")))
    }

    /// Record a staging outcome and return the tools evicted to make room.
    fn complete(&self, key: &CacheKey, outcome: &Result<StagedTool>) -> Vec<StagedTool> {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;
        match outcome {
            Ok(tool) => {
                inner.slots.insert(
                    key.clone(),
                    Slot::Staged {
                        tool: tool.clone(),
                        last_used: now,
                    },
                );
            }
            Err(err) => {
                warn!(%key, error = %err, transient = err.is_transient(), "Staging failed");
                inner.slots.insert(key.clone(), Slot::Failed(err.clone()));
                return Vec::new();
            }
        }

        let Some(capacity) = self.capacity else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        loop {
            let staged = inner
                .slots
                .values()
                .filter(|s| matches!(s, Slot::Staged { .. }))
                .count();
            if staged <= capacity {
                break;
            }
            let oldest = inner
                .slots
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Staged { last_used, .. } if k != key => Some((k.clone(), *last_used)),
                    _ => None,
                })
                .min_by_key(|(_, used)| *used)
                .map(|(k, _)| k);
            let Some(oldest) = oldest else { break };
            if let Some(Slot::Staged { tool, .. }) = inner.slots.remove(&oldest) {
                debug!(key = %oldest, "Evicting least recently used tool");
                evicted.push(tool);
            }
        }
        retain_unshared(&inner, evicted)
    }

    /// Evict a staged entry and delete its directory.
    ///
    /// In-flight stagings are left alone. Returns whether an entry was removed.
    pub async fn evict(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut inner = self.lock();
            if matches!(inner.slots.get(key), Some(Slot::Staging(_)) | None) {
                return false;
            }
            inner.slots.remove(key)
        };
        if let Some(Slot::Staged { tool, .. }) = removed {
            let orphaned = retain_unshared(&self.lock(), vec![tool]);
            reclaim(orphaned).await;
        }
        info!(%key, "Evicted dependency cache entry");
        true
    }

    /// Wait until no staging is in flight.
    ///
    /// Stagings that ended without a result are dropped from the cache.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<_> = self
                .lock()
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Staging(rx) => Some((key.clone(), rx.clone())),
                    _ => None,
                })
                .collect();
            if pending.is_empty() {
                return;
            }
            debug!(count = pending.len(), "Waiting for in-flight stagings");
            for (key, mut rx) in pending {
                if rx.wait_for(Option::is_some).await.is_err() {
                    let mut inner = self.lock();
                    if matches!(inner.slots.get(&key), Some(Slot::Staging(_))) {
                        inner.slots.remove(&key);
                    }
                }
            }
        }
    }

    /// Drop every staged and failed entry and delete staged directories.
    ///
    /// In-flight stagings are left alone; call [`DependencyCache::settle`] first
    /// to include them. Returns the number of entries removed.
    pub async fn clear(&self) -> usize {
        let removed: Vec<Slot> = {
            let mut inner = self.lock();
            let keys: Vec<_> = inner
                .slots
                .iter()
                .filter(|(_, s)| !matches!(s, Slot::Staging(_)))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| inner.slots.remove(k)).collect()
        };
        let count = removed.len();
        let tools = removed
            .into_iter()
            .filter_map(|s| match s {
                Slot::Staged { tool, .. } => Some(tool),
                _ => None,
            })
            .collect();
        let orphaned = retain_unshared(&self.lock(), tools);
        reclaim(orphaned).await;
        count
    }
}

/// Keep only tools whose directory no remaining staged entry still uses.
fn retain_unshared(inner: &Inner, tools: Vec<StagedTool>) -> Vec<StagedTool> {
    let in_use: Vec<&PathBuf> = inner
        .slots
        .values()
        .filter_map(|s| match s {
            Slot::Staged { tool, .. } => Some(&tool.root),
            _ => None,
        })
        .collect();
    let mut seen = Vec::new();
    tools
        .into_iter()
        .filter(|t| !in_use.contains(&&t.root))
        .filter(|t| {
            let fresh = !seen.contains(&t.root);
            seen.push(t.root.clone());
            fresh
        })
        .collect()
}

async fn reclaim(tools: Vec<StagedTool>) {
    for tool in tools {
        match tokio::fs::remove_dir_all(&tool.root).await {
            Ok(()) => debug!(tool = %tool.name, root = ?tool.root, "Removed staged package"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(tool = %tool.name, root = ?tool.root, error = %e, "Failed to remove staged package"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};
    use semver::Version;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const PLATFORM: PlatformKey = PlatformKey::new(Os::Linux, Arch::X64);

    fn key(name: &str) -> CacheKey {
        CacheKey::new(&ToolIdentity::new(name, "*").unwrap(), PLATFORM)
    }

    fn tool(name: &str, root: &Path) -> StagedTool {
        StagedTool {
            name: name.to_string(),
            version: Version::new(1, 0, 0),
            platform: PLATFORM,
            root: root.to_path_buf(),
            executable: root.join(name),
            sha256: "00".repeat(32),
        }
    }

    #[tokio::test]
    async fn test_hit_after_stage() {
        let cache = DependencyCache::default();
        let k = key("jq");
        let t = tool("jq", Path::new("/tmp/jq"));

        let expected = t.clone();
        let first = cache.get_or_stage(&k, || async move { Ok(expected) }).await.unwrap();
        let second = cache
            .get_or_stage(&k, || async { Err(Error::internal("must not run")) })
            .await
            .unwrap();

        assert_eq!(first, t);
        assert_eq!(second, t);
        assert_eq!(cache.staging_count(), 1);
        assert_eq!(cache.state(&k), StagingState::Staged);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight() {
        let cache = DependencyCache::default();
        let k = key("wget");
        let t = tool("wget", Path::new("/tmp/wget"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let k = k.clone();
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_stage(&k, || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(t)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), t);
        }
        assert_eq!(cache.staging_count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_cached() {
        let cache = DependencyCache::default();
        let k = key("wget");
        let integrity = Error::IntegrityViolation {
            tool: "wget".to_string(),
            path: PathBuf::from("/tools/wget.tgz"),
            expected: "a".to_string(),
            actual: "b".to_string(),
        };

        let failure = integrity.clone();
        let err = cache.get_or_stage(&k, || async move { Err(failure) }).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { .. }));

        let t = tool("wget", Path::new("/tmp/wget"));
        let err = cache.get_or_stage(&k, || async move { Ok(t) }).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation { .. }));
        assert_eq!(cache.staging_count(), 1);
        assert_eq!(cache.state(&k), StagingState::Failed);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let cache = DependencyCache::default();
        let k = key("wget");

        let err = cache
            .get_or_stage(&k, || async {
                Err(Error::extraction("wget", Path::new("/scratch"), "disk full", None))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let t = tool("wget", Path::new("/tmp/wget"));
        let expected = t.clone();
        let staged = cache.get_or_stage(&k, || async move { Ok(t) }).await.unwrap();
        assert_eq!(staged, expected);
        assert_eq!(cache.staging_count(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let temp = TempDir::new().unwrap();
        let cache = DependencyCache::new(Some(2));

        let mut keys = Vec::new();
        for name in ["a", "b", "c"] {
            let root = temp.path().join(name);
            std::fs::create_dir_all(&root).unwrap();
            let k = key(name);
            let t = tool(name, &root);
            cache.get_or_stage(&k, || async move { Ok(t) }).await.unwrap();
            keys.push(k);
            if name == "b" {
                // Touch "a" so that "b" becomes the least recently used.
                cache
                    .get_or_stage(&keys[0], || async { Err(Error::internal("unused")) })
                    .await
                    .unwrap();
            }
        }

        // Eviction of "b" happens on the staging task; give it a moment.
        for _ in 0..50 {
            if !temp.path().join("b").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.state(&keys[0]), StagingState::Staged);
        assert_eq!(cache.state(&keys[1]), StagingState::NotStaged);
        assert_eq!(cache.state(&keys[2]), StagingState::Staged);
        assert!(!temp.path().join("b").exists());
        assert!(temp.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let temp = TempDir::new().unwrap();
        let cache = DependencyCache::default();
        let root = temp.path().join("jq");
        std::fs::create_dir_all(&root).unwrap();
        let k = key("jq");
        let t = tool("jq", &root);
        cache.get_or_stage(&k, || async move { Ok(t) }).await.unwrap();

        assert!(cache.evict(&k).await);
        assert!(!root.exists());
        assert!(!cache.evict(&k).await);

        let other = key("yq");
        let _ = cache
            .get_or_stage(&other, || async { Err(Error::internal("boom")) })
            .await;
        assert_eq!(cache.records().len(), 1);
        assert_eq!(cache.clear().await, 1);
        assert!(cache.records().is_empty());
    }

    #[tokio::test]
    async fn test_settle_waits_for_in_flight_staging() {
        let temp = TempDir::new().unwrap();
        let cache = DependencyCache::default();
        let root = temp.path().join("jq");
        let k = key("jq");

        let staging = {
            let cache = cache.clone();
            let k = k.clone();
            let root = root.clone();
            tokio::spawn(async move {
                cache
                    .get_or_stage(&k, || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        std::fs::create_dir_all(&root).unwrap();
                        Ok(tool("jq", &root))
                    })
                    .await
            })
        };
        while cache.state(&k) != StagingState::Staging {
            tokio::task::yield_now().await;
        }

        assert_eq!(cache.clear().await, 0);
        cache.settle().await;
        assert_eq!(cache.state(&k), StagingState::Staged);
        assert_eq!(cache.clear().await, 1);
        assert!(!root.exists());
        staging.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shared_directory_survives_eviction() {
        let temp = TempDir::new().unwrap();
        let cache = DependencyCache::default();
        let root = temp.path().join("wget");
        std::fs::create_dir_all(&root).unwrap();

        let exact = CacheKey::new(&ToolIdentity::new("wget", "1.0.0").unwrap(), PLATFORM);
        let range = CacheKey::new(&ToolIdentity::new("wget", "^1").unwrap(), PLATFORM);
        for k in [&exact, &range] {
            let t = tool("wget", &root);
            cache.get_or_stage(k, || async move { Ok(t) }).await.unwrap();
        }

        assert!(cache.evict(&exact).await);
        assert!(root.exists());
        assert!(cache.evict(&range).await);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_panicking_stage_reports_internal_error() {
        let cache = DependencyCache::default();
        let k = key("jq");
        let err = cache
            .get_or_stage(&k, || async {
                let exploded = true;
                assert!(!exploded, "stage exploded");
                Ok(tool("jq", Path::new("/tmp/jq")))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert_eq!(cache.state(&k), StagingState::NotStaged);
    }
}

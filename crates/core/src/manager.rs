//! Resolution orchestrator.
//!
//! [`ToolManager`] is the process-scoped entry point: it resolves the platform
//! for a tool request, stages the package through the shared
//! [`DependencyCache`], and runs staged tools. Each request walks
//! `Requested -> Resolving -> Staging -> Ready`, or ends in `Failed`.

use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, DependencyCache};
use crate::config::Config;
use crate::descriptor::ToolIdentity;
use crate::invoke::{InvocationRequest, InvocationResult, Invoker};
use crate::platform::{PlatformKey, PlatformResolver};
use crate::store::{PackageStore, StagedTool};
use crate::{Error, Result};

/// Lifecycle state of a single tool request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Received, nothing done yet.
    Requested,
    /// Resolving the platform.
    Resolving,
    /// Locating, verifying and extracting the package.
    Staging,
    /// The tool is staged and can be run.
    Ready,
    /// The request failed.
    Failed,
}

impl RequestState {
    /// Whether moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Resolving)
                | (Self::Resolving, Self::Staging)
                | (Self::Staging, Self::Ready)
                | (Self::Requested | Self::Resolving | Self::Staging, Self::Failed)
        )
    }

    /// Whether the state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Resolving => "resolving",
            Self::Staging => "staging",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks one request through its states.
#[derive(Debug)]
struct Request<'a> {
    identity: &'a ToolIdentity,
    state: RequestState,
}

impl<'a> Request<'a> {
    const fn new(identity: &'a ToolIdentity) -> Self {
        Self {
            identity,
            state: RequestState::Requested,
        }
    }

    fn advance(&mut self, next: RequestState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::internal(format!(
                "illegal request transition for {}: {} -> {}",
                self.identity, self.state, next
            )));
        }
        debug!(tool = %self.identity, from = %self.state, to = %next, "Request state change");
        self.state = next;
        Ok(())
    }

    fn fail<T>(mut self, err: Error) -> Result<T> {
        if let Err(illegal) = self.advance(RequestState::Failed) {
            warn!(error = %illegal, "Request already terminal");
        }
        warn!(tool = %self.identity, error = %err, "Tool request failed");
        Err(err)
    }
}

/// Resolves, stages and runs tools for one process.
///
/// Create one at startup and call [`ToolManager::shutdown`] when done.
#[derive(Debug)]
pub struct ToolManager {
    resolver: PlatformResolver,
    store: PackageStore,
    cache: DependencyCache,
    invoker: Invoker,
    shutdown: CancellationToken,
}

impl ToolManager {
    /// Assemble a manager from its parts.
    #[must_use]
    pub fn new(
        resolver: PlatformResolver,
        store: PackageStore,
        cache: DependencyCache,
        invoker: Invoker,
    ) -> Self {
        Self {
            resolver,
            store,
            cache,
            invoker,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a manager for the running host from configuration.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` if the host cannot be detected, or a
    /// configuration error if directories cannot be determined.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_resolver(config, PlatformResolver::detect()?)
    }

    /// Build a manager from configuration with an explicit resolver.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if directories cannot be determined.
    pub fn with_resolver(config: &Config, resolver: PlatformResolver) -> Result<Self> {
        let store = PackageStore::new(config.tools_root()?, config.scratch_dir()?);
        Ok(Self::new(
            resolver,
            store,
            DependencyCache::new(config.cache.capacity),
            config.invoker(),
        ))
    }

    /// Platform this manager stages tools for.
    #[must_use]
    pub const fn platform(&self) -> PlatformKey {
        self.resolver.platform()
    }

    /// The package store.
    #[must_use]
    pub const fn store(&self) -> &PackageStore {
        &self.store
    }

    /// The dependency cache.
    #[must_use]
    pub const fn cache(&self) -> &DependencyCache {
        &self.cache
    }

    /// Resolve the platform for `identity` and stage its package.
    ///
    /// Staging is shared through the cache: concurrent and repeated requests
    /// for the same tool and platform stage it once.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` before anything is staged when the tool
    /// is bundled only for other platforms, or any staging error (`PackageNotFound`, `IntegrityViolation`,
    /// `ExtractionError`, ...).
    pub async fn resolve_and_stage(&self, identity: &ToolIdentity) -> Result<StagedTool> {
        if self.shutdown.is_cancelled() {
            return Err(Error::internal("tool manager has been shut down"));
        }

        let mut request = Request::new(identity);
        request.advance(RequestState::Resolving)?;
        let resolved = match self.store.platforms(&identity.name).await {
            Ok(bundled) => self.resolver.resolve(identity, &bundled),
            Err(e) => Err(e),
        };
        let platform = match resolved {
            Ok(platform) => platform,
            Err(e) => return request.fail(e),
        };

        request.advance(RequestState::Staging)?;
        let key = CacheKey::new(identity, platform);
        let store = self.store.clone();
        let wanted = identity.clone();
        let staged = self
            .cache
            .get_or_stage(&key, move || async move {
                let location = store.locate(&wanted, platform).await?;
                store.stage(&location).await
            })
            .await;

        match staged {
            Ok(tool) => {
                request.advance(RequestState::Ready)?;
                info!(
                    tool = %tool.name,
                    version = %tool.version,
                    %platform,
                    root = ?tool.root,
                    "Tool ready"
                );
                Ok(tool)
            }
            Err(e) => request.fail(e),
        }
    }

    /// Run a staged tool. The run is cancelled if the manager shuts down.
    ///
    /// # Errors
    ///
    /// See [`Invoker::invoke`].
    pub async fn run(
        &self,
        tool: &StagedTool,
        request: &InvocationRequest,
    ) -> Result<InvocationResult> {
        let token = self.shutdown.child_token();
        self.invoker.invoke_with_cancel(tool, request, &token).await
    }

    /// Run a staged tool, cancelled by either `cancel` or manager shutdown.
    ///
    /// # Errors
    ///
    /// See [`Invoker::invoke_with_cancel`].
    pub async fn run_with_cancel(
        &self,
        tool: &StagedTool,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult> {
        let token = self.shutdown.child_token();
        let linked = token.clone();
        let caller = cancel.clone();
        let link = tokio::spawn(async move {
            caller.cancelled().await;
            linked.cancel();
        });
        let result = self.invoker.invoke_with_cancel(tool, request, &token).await;
        link.abort();
        result
    }

    /// Drop the cached entry for `identity` on this platform and delete its
    /// staged directory.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` if the tool declares platforms that
    /// exclude this one.
    pub async fn evict(&self, identity: &ToolIdentity) -> Result<bool> {
        let platform = self.resolver.resolve(identity, &[])?;
        Ok(self.cache.evict(&CacheKey::new(identity, platform)).await)
    }

    /// Cancel running invocations and clean up staged tools.
    ///
    /// Stagings already in flight are awaited so their directories are
    /// removed too. Returns the number of cache entries removed.
    pub async fn shutdown(&self) -> usize {
        info!(platform = %self.platform(), "Shutting down tool manager");
        self.shutdown.cancel();
        self.cache.settle().await;
        self.cache.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};
    use tempfile::TempDir;

    #[test]
    fn test_legal_transitions() {
        use RequestState::*;
        assert!(Requested.can_transition_to(Resolving));
        assert!(Resolving.can_transition_to(Staging));
        assert!(Staging.can_transition_to(Ready));
        assert!(Resolving.can_transition_to(Failed));
        assert!(Staging.can_transition_to(Failed));
    }

    #[test]
    fn test_illegal_transitions() {
        use RequestState::*;
        assert!(!Requested.can_transition_to(Ready));
        assert!(!Requested.can_transition_to(Staging));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Resolving));
        assert!(!Staging.can_transition_to(Resolving));
        assert!(Ready.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_request_rejects_skipping_states() {
        let identity = ToolIdentity::new("wget", "2.1.0").unwrap();
        let mut request = Request::new(&identity);
        let err = request.advance(RequestState::Ready).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert_eq!(request.state, RequestState::Requested);
    }

    fn manager(temp: &TempDir, platform: PlatformKey) -> ToolManager {
        ToolManager::new(
            PlatformResolver::fixed(platform),
            PackageStore::new(temp.path().join("tools"), temp.path().join("scratch")),
            DependencyCache::default(),
            Invoker::default(),
        )
    }

    #[tokio::test]
    async fn test_missing_package_is_not_found() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, PlatformKey::new(Os::Linux, Arch::X64));
        let identity = ToolIdentity::new("wget", "2.1.0").unwrap();

        let err = manager.resolve_and_stage(&identity).await.unwrap_err();
        assert!(matches!(err, Error::PackageNotFound { .. }));
        assert_eq!(manager.cache().staging_count(), 1);

        // Permanent: served from cache.
        let err = manager.resolve_and_stage(&identity).await.unwrap_err();
        assert!(matches!(err, Error::PackageNotFound { .. }));
        assert_eq!(manager.cache().staging_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, PlatformKey::new(Os::Linux, Arch::X64));
        manager.shutdown().await;

        let identity = ToolIdentity::new("wget", "*").unwrap();
        assert!(manager.resolve_and_stage(&identity).await.is_err());
        assert_eq!(manager.cache().staging_count(), 0);
    }
}

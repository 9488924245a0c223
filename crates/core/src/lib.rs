//! Tool dependency resolution and invocation.
//!
//! `toolstage-core` turns a tool name and version requirement into a verified,
//! extracted executable for the running platform, and runs it with an explicit
//! environment, a deadline and bounded output capture.
//!
//! Packages are bundled on disk as
//! `<tools-root>/<tool>/<os>-<arch>/package.json` plus an archive, optionally
//! with one sub-directory per version. The [`ToolManager`] ties the pieces
//! together:
//!
//! - [`PlatformResolver`] maps the host to a [`PlatformKey`]
//! - [`PackageStore`] locates, verifies and extracts packages
//! - [`DependencyCache`] stages each tool once per process
//! - [`Invoker`] runs staged tools

pub mod archive;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod invoke;
pub mod manager;
pub mod paths;
pub mod platform;
pub mod store;

pub use cache::{CacheKey, DependencyCache, PackageRecord, StagingState};
pub use config::Config;
pub use descriptor::{ArchiveKind, PackageManifest, ToolIdentity, VersionDescriptor};
pub use error::{Error, Result};
pub use invoke::{InvocationRequest, InvocationResult, Invoker};
pub use manager::{RequestState, ToolManager};
pub use platform::{Arch, Os, PackageLayout, PlatformKey, PlatformResolver};
pub use store::{PackageLocation, PackageStore, StagedTool};

//! Default locations for bundled packages and staged tools.
//!
//! | Directory | Default | Override |
//! |-----------|---------|----------|
//! | Tools root | `<data dir>/toolstage/tools` | `TOOLSTAGE_TOOLS_ROOT` |
//! | Cache dir | `<cache dir>/toolstage` | `TOOLSTAGE_CACHE_DIR` |
//! | Scratch dir | `<cache dir>/toolstage/staged` | via the cache dir |

use crate::{Error, Result};
use std::path::PathBuf;

/// Environment variable overriding the tools root.
pub const TOOLS_ROOT_ENV: &str = "TOOLSTAGE_TOOLS_ROOT";

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "TOOLSTAGE_CACHE_DIR";

fn env_override(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

/// Directory holding bundled tool packages.
///
/// Resolution order:
/// 1. `TOOLSTAGE_TOOLS_ROOT` environment variable
/// 2. Platform data directory + `/toolstage/tools`
///
/// # Errors
///
/// Returns an error if the data directory cannot be determined.
pub fn tools_root() -> Result<PathBuf> {
    if let Some(dir) = env_override(TOOLS_ROOT_ENV) {
        return Ok(dir);
    }
    let base = dirs::data_dir()
        .ok_or_else(|| Error::configuration("Could not determine data directory"))?;
    Ok(base.join("toolstage").join("tools"))
}

/// Cache directory for toolstage.
///
/// Resolution order:
/// 1. `TOOLSTAGE_CACHE_DIR` environment variable
/// 2. Platform cache directory + `/toolstage`
///
/// # Errors
///
/// Returns an error if the cache directory cannot be determined.
pub fn cache_dir() -> Result<PathBuf> {
    if let Some(dir) = env_override(CACHE_DIR_ENV) {
        return Ok(dir);
    }
    let base = dirs::cache_dir()
        .ok_or_else(|| Error::configuration("Could not determine cache directory"))?;
    Ok(base.join("toolstage"))
}

/// Scratch directory packages are staged into.
///
/// # Errors
///
/// Returns an error if the cache directory cannot be determined.
pub fn scratch_dir() -> Result<PathBuf> {
    Ok(cache_dir()?.join("staged"))
}

//! Content-addressed remote cache integration
//!
//! The remote store is reached only through the external `cascache` CLI,
//! treated as an opaque collaborator. This module owns backend selection,
//! workspace naming, and the well-known local cache directories; the CLI
//! invocations themselves live in [`remote`].

pub mod remote;

pub use remote::{CacheCli, CacheFlags, RestoreOutcome, SaveOutcome};

use crate::error::{KilnError, KilnResult};
use clap::ValueEnum;
use std::path::PathBuf;
use tokio::fs;

/// Env var holding the cache authentication token
pub const ENV_TOKEN: &str = "CASCACHE_TOKEN";

/// Env var holding the fallback workspace
pub const ENV_DEFAULT_WORKSPACE: &str = "CASCACHE_DEFAULT_WORKSPACE";

/// Which cache backend feeds the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    /// Local registry-emulating proxy in front of the remote store
    Registry,
    /// Plain import/export directories synced with the remote store
    Local,
}

/// Directory the build imports prior cache from (local backend)
pub fn cache_dir_from() -> PathBuf {
    std::env::temp_dir().join("kiln-cache-from")
}

/// Directory the build exports new cache into (local backend)
pub fn cache_dir_to() -> PathBuf {
    std::env::temp_dir().join("kiln-cache-to")
}

/// The cache token, if present and non-empty.
pub fn token() -> Option<String> {
    std::env::var(ENV_TOKEN).ok().filter(|t| !t.is_empty())
}

/// Resolve the cache workspace from input or environment.
///
/// Bare names get a `default/` org prefix. A missing workspace is a hard
/// configuration error.
pub fn normalize_workspace(input: &str) -> KilnResult<String> {
    let mut workspace = input.trim().to_string();

    if workspace.is_empty() {
        workspace = std::env::var(ENV_DEFAULT_WORKSPACE).unwrap_or_default();
    }

    if workspace.is_empty() {
        return Err(KilnError::WorkspaceRequired);
    }

    if !workspace.contains('/') {
        workspace = format!("default/{}", workspace);
    }

    Ok(workspace)
}

/// Create a directory (and parents) if it does not exist.
pub async fn ensure_dir(path: &std::path::Path) -> KilnResult<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| KilnError::io(format!("creating directory {}", path.display()), e))
}

/// Whether a directory is missing or contains no entries.
pub async fn dir_is_empty(path: &std::path::Path) -> bool {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(_) => return true,
    };
    matches!(entries.next_entry().await, Ok(None) | Err(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn workspace_passthrough_with_org() {
        std::env::remove_var(ENV_DEFAULT_WORKSPACE);
        assert_eq!(
            normalize_workspace("my-org/my-project").unwrap(),
            "my-org/my-project"
        );
    }

    #[test]
    #[serial]
    fn workspace_bare_name_gets_default_org() {
        std::env::remove_var(ENV_DEFAULT_WORKSPACE);
        assert_eq!(normalize_workspace("my-project").unwrap(), "default/my-project");
    }

    #[test]
    #[serial]
    fn workspace_env_fallback() {
        std::env::set_var(ENV_DEFAULT_WORKSPACE, "acme/widgets");
        let ws = normalize_workspace("").unwrap();
        std::env::remove_var(ENV_DEFAULT_WORKSPACE);
        assert_eq!(ws, "acme/widgets");
    }

    #[test]
    #[serial]
    fn workspace_missing_is_error() {
        std::env::remove_var(ENV_DEFAULT_WORKSPACE);
        assert!(matches!(
            normalize_workspace(""),
            Err(KilnError::WorkspaceRequired)
        ));
    }

    #[test]
    #[serial]
    fn token_empty_is_none() {
        std::env::set_var(ENV_TOKEN, "");
        assert!(token().is_none());
        std::env::set_var(ENV_TOKEN, "secret");
        assert_eq!(token().as_deref(), Some("secret"));
        std::env::remove_var(ENV_TOKEN);
        assert!(token().is_none());
    }

    #[tokio::test]
    async fn dir_is_empty_cases() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dir_is_empty(dir.path()).await);

        tokio::fs::write(dir.path().join("blob"), b"x").await.unwrap();
        assert!(!dir_is_empty(dir.path()).await);

        assert!(dir_is_empty(&dir.path().join("missing")).await);
    }
}

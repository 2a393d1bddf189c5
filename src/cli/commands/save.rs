//! Save phase: stop the registry proxy or upload the local cache export
//!
//! Runs after the build has already succeeded, so nothing here may fail
//! the pipeline: every error degrades to a warning.

use crate::cache::{self, CacheCli, CacheFlags};
use crate::cli::args::SaveArgs;
use crate::config::Config;
use crate::error::KilnResult;
use crate::proxy::{ProxyHandle, ProxyManager};
use crate::refs;
use crate::state::{keys, PhaseStore};
use crate::topology::LOOPBACK;
use std::path::PathBuf;
use tracing::{info, warn};

/// Execute the save phase
pub async fn execute(args: SaveArgs, config: &Config, store: &dyn PhaseStore) -> KilnResult<()> {
    if let Err(e) = run(args, config, store).await {
        warn!("Save failed: {}", e);
    }
    Ok(())
}

async fn run(args: SaveArgs, config: &Config, store: &dyn PhaseStore) -> KilnResult<()> {
    // Registry backend: stopping the proxy triggers its own flush to the
    // remote store; there is nothing else to upload.
    if let Some(raw_pid) = store.get(keys::PROXY_PID).await? {
        stop_proxy(&raw_pid, config, store).await;
        return Ok(());
    }

    let workspace_input = match store.get(keys::WORKSPACE).await? {
        Some(ws) => ws,
        None => args
            .workspace
            .clone()
            .or_else(|| config.cache.workspace.clone())
            .unwrap_or_default(),
    };
    let workspace = match cache::normalize_workspace(&workspace_input) {
        Ok(ws) => ws,
        Err(_) => {
            info!("No workspace provided, skipping cache save");
            return Ok(());
        }
    };

    let cache_tag = match store.get(keys::CACHE_TAG).await? {
        Some(tag) if !tag.is_empty() => tag,
        _ => args
            .cache_tag
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| match args.image.as_deref().filter(|i| !i.is_empty()) {
                Some(image) => refs::slugify(image),
                None => "docker".to_string(),
            }),
    };

    let dir = match store.get(keys::CACHE_DIR_TO).await? {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => cache::cache_dir_to(),
    };

    let verbose = args.cache_verbose
        || store.get(keys::VERBOSE).await?.as_deref() == Some("true");
    let exclude = match store.get(keys::EXCLUDE).await? {
        Some(pattern) if !pattern.is_empty() => Some(pattern),
        _ => args.exclude.clone(),
    };

    let flags = CacheFlags { verbose, exclude };
    CacheCli::new()
        .save(&workspace, &cache_tag, &dir, &flags)
        .await?;

    info!("Save to cache complete");
    Ok(())
}

/// Stop the proxy persisted by the restore phase. Teardown failures are
/// warnings only; the build is already done.
async fn stop_proxy(raw_pid: &str, config: &Config, store: &dyn PhaseStore) {
    let pid = raw_pid.trim().parse::<i32>().unwrap_or(-1);
    let port = match store.get(keys::PROXY_PORT).await {
        Ok(Some(raw)) => raw.parse::<u16>().unwrap_or(config.cache.port),
        _ => config.cache.port,
    };

    let manager = ProxyManager::new(port);
    // Reconstructed from state, not spawned here.
    let handle = ProxyHandle {
        pid,
        bind_host: LOOPBACK.to_string(),
        port,
        owned: false,
    };

    if let Err(e) = manager.stop(&handle).await {
        warn!("Failed to stop registry proxy: {}", e);
    }
    if let Err(e) = store.remove(keys::PROXY_PID).await {
        warn!("Failed to clear proxy pid from phase state: {}", e);
    }

    info!("Registry proxy cache sync complete");
}

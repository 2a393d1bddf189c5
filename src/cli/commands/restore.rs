//! Restore phase: prepare the cache backend and emit build directives
//!
//! Ordering matters: builder setup, then platform emulation, then proxy
//! start, then the readiness wait. Each step's output is a hard dependency
//! of the next, and everything a later phase needs is persisted to the
//! phase store before this process exits.

use super::emit_output;
use crate::buildx::{self, BuilderSetup};
use crate::cache::{self, CacheBackend, CacheCli, CacheFlags, RestoreOutcome};
use crate::cli::args::RestoreArgs;
use crate::config::Config;
use crate::error::KilnResult;
use crate::proxy::{ProxyManager, ProxyOptions};
use crate::refs::{self, CacheDirectives, CacheMode};
use crate::state::{keys, PhaseStore};
use crate::topology;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Execute the restore phase
pub async fn execute(
    args: RestoreArgs,
    config: &Config,
    store: &dyn PhaseStore,
) -> KilnResult<()> {
    let workspace = cache::normalize_workspace(
        args.workspace
            .as_deref()
            .or(config.cache.workspace.as_deref())
            .unwrap_or(""),
    )?;

    let cache_tag = resolve_cache_tag(args.cache_tag.as_deref(), args.image.as_deref());
    let backend = args
        .backend
        .unwrap_or_else(|| backend_from_str(&config.cache.backend));
    let mode = args
        .cache_mode
        .unwrap_or_else(|| mode_from_str(&config.cache.mode));
    let port = args.port.unwrap_or(config.cache.port);
    let cache_verbose = args.cache_verbose || config.cache.verbose;
    let exclude = args.exclude.clone().or_else(|| config.cache.exclude.clone());

    debug!(
        "Restore: workspace={} tag={} backend={:?} mode={:?}",
        workspace, cache_tag, backend, mode
    );

    // State a later phase cannot reconstruct must be written before exit.
    store.set(keys::WORKSPACE, &workspace).await?;
    store.set(keys::CACHE_TAG, &cache_tag).await?;
    store.set(keys::VERBOSE, &cache_verbose.to_string()).await?;
    store
        .set(keys::EXCLUDE, exclude.as_deref().unwrap_or(""))
        .await?;

    let registry_mode = backend == CacheBackend::Registry;
    let driver = args
        .driver
        .clone()
        .unwrap_or_else(|| config.build.driver.clone());
    let driver_opts = if args.driver_opts.is_empty() {
        config.build.driver_opts.clone()
    } else {
        args.driver_opts.clone()
    };

    let builder = buildx::setup_builder(&BuilderSetup {
        driver: driver.clone(),
        driver_opts,
        buildkitd_config: args
            .buildkitd_config
            .clone()
            .or_else(|| config.build.buildkitd_config.clone()),
        registry_mode,
    })
    .await?;
    store.set(keys::BUILDER, &builder).await?;

    emit_output("buildx-name", &builder);
    emit_output("buildx-platforms", &buildx::builder_platforms(&builder).await);

    buildx::setup_qemu(args.platforms.as_deref().unwrap_or("")).await?;

    let directives = match backend {
        CacheBackend::Registry => {
            restore_registry(
                &args,
                store,
                &workspace,
                &cache_tag,
                port,
                mode,
                cache_verbose,
                &driver,
                &builder,
            )
            .await?
        }
        CacheBackend::Local => {
            restore_local(store, &workspace, &cache_tag, mode, cache_verbose).await?
        }
    };

    store.set(keys::CACHE_FROM, &directives.cache_from).await?;
    store.set(keys::CACHE_TO, &directives.cache_to).await?;
    emit_output("cache-from", &directives.cache_from);
    emit_output("cache-to", &directives.cache_to);

    Ok(())
}

/// Registry-proxy backend: resolve topology, start or reuse the proxy,
/// gate on readiness, then emit registry-shaped directives.
#[allow(clippy::too_many_arguments)]
async fn restore_registry(
    args: &RestoreArgs,
    store: &dyn PhaseStore,
    workspace: &str,
    cache_tag: &str,
    port: u16,
    mode: CacheMode,
    cache_verbose: bool,
    driver: &str,
    builder: &str,
) -> KilnResult<CacheDirectives> {
    let (effective_driver, _) = buildx::effective_driver(driver);
    let topo = topology::TopologyResolver::new()
        .resolve(builder, &effective_driver)
        .await;

    let manager = ProxyManager::new(port);
    let handle = manager
        .start(&ProxyOptions {
            workspace: workspace.to_string(),
            tag: Some(cache_tag.to_string()),
            bind_host: topo.bind_host.clone(),
            port,
            verbose: cache_verbose,
            no_git: args.proxy_no_git,
            no_platform: args.proxy_no_platform,
        })
        .await?;

    persist_proxy_identity(store, &handle, port).await?;

    manager
        .wait_until_ready(&handle, Duration::from_secs(args.ready_timeout))
        .await?;

    let reference = refs::registry_ref(&topo.ref_host, port, cache_tag);
    info!("Registry cache reference: {}", reference);

    emit_output("registry-ref", &reference);
    emit_output("cache-dir-from", "");
    emit_output("cache-dir-to", "");

    Ok(CacheDirectives::registry(&reference, mode))
}

/// Local backend: distinct from/to directories, remote restore into the
/// from-side, directory-shaped directives.
async fn restore_local(
    store: &dyn PhaseStore,
    workspace: &str,
    cache_tag: &str,
    mode: CacheMode,
    cache_verbose: bool,
) -> KilnResult<CacheDirectives> {
    let from_dir = cache::cache_dir_from();
    let to_dir = cache::cache_dir_to();
    cache::ensure_dir(&from_dir).await?;
    cache::ensure_dir(&to_dir).await?;

    let directives = CacheDirectives::local(&from_dir, &to_dir, mode)?;

    let flags = CacheFlags {
        verbose: cache_verbose,
        exclude: None,
    };
    let outcome = CacheCli::new()
        .restore(workspace, cache_tag, &from_dir, &flags)
        .await?;

    store
        .set(keys::CACHE_DIR, &from_dir.display().to_string())
        .await?;
    store
        .set(keys::CACHE_DIR_TO, &to_dir.display().to_string())
        .await?;

    emit_output(
        "cache-hit",
        if outcome == RestoreOutcome::Restored {
            "true"
        } else {
            "false"
        },
    );
    emit_output("registry-ref", "");
    emit_output("cache-dir-from", &from_dir.display().to_string());
    emit_output("cache-dir-to", &to_dir.display().to_string());

    Ok(directives)
}

/// Record the proxy's identity for the save phase.
///
/// A sentinel handle (unknown owner) must clear any pid a previous run
/// left behind: the save phase signals whatever pid it finds in state, and
/// a recycled pid from an aborted run could name an unrelated process.
async fn persist_proxy_identity(
    store: &dyn PhaseStore,
    handle: &crate::proxy::ProxyHandle,
    port: u16,
) -> KilnResult<()> {
    if handle.has_pid() {
        store.set(keys::PROXY_PID, &handle.pid.to_string()).await?;
    } else {
        store.remove(keys::PROXY_PID).await?;
    }
    store.set(keys::PROXY_PORT, &port.to_string()).await
}

/// Cache tag precedence: explicit tag, slugified image, then a fixed name.
fn resolve_cache_tag(cache_tag: Option<&str>, image: Option<&str>) -> String {
    if let Some(tag) = cache_tag.filter(|t| !t.is_empty()) {
        return tag.to_string();
    }
    match image.filter(|i| !i.is_empty()) {
        Some(image) => refs::slugify(image),
        None => "docker".to_string(),
    }
}

fn backend_from_str(raw: &str) -> CacheBackend {
    match raw {
        "local" => CacheBackend::Local,
        "registry" => CacheBackend::Registry,
        other => {
            warn!("Unknown cache backend {:?} in config; using \"registry\"", other);
            CacheBackend::Registry
        }
    }
}

fn mode_from_str(raw: &str) -> CacheMode {
    match raw {
        "min" => CacheMode::Min,
        "max" => CacheMode::Max,
        other => {
            warn!("Unknown cache mode {:?} in config; using \"max\"", other);
            CacheMode::Max
        }
    }
}

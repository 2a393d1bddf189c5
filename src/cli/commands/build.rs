//! Build phase: run docker buildx build with the restored directives
//!
//! The directives come from the restore phase via the phase store and are
//! passed through verbatim. A build without a prior restore simply runs
//! uncached.

use super::emit_output;
use crate::buildx::{self, BuildOptions};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::error::KilnResult;
use crate::refs::CacheDirectives;
use crate::state::{keys, PhaseStore};
use std::path::PathBuf;
use tracing::{debug, info};

/// Execute the build phase
pub async fn execute(args: BuildArgs, config: &Config, store: &dyn PhaseStore) -> KilnResult<()> {
    let builder = store
        .get(keys::BUILDER)
        .await?
        .unwrap_or_else(|| buildx::DEFAULT_BUILDER.to_string());

    let cache = match (
        store.get(keys::CACHE_FROM).await?,
        store.get(keys::CACHE_TO).await?,
    ) {
        (Some(cache_from), Some(cache_to)) => Some(CacheDirectives {
            cache_from,
            cache_to,
        }),
        _ => {
            debug!("No cache directives in phase state; building uncached");
            None
        }
    };

    let tags = if args.tags.is_empty() {
        vec!["latest".to_string()]
    } else {
        args.tags.clone()
    };
    let dockerfile = args
        .dockerfile
        .clone()
        .unwrap_or_else(|| config.build.dockerfile.clone());
    let context = args
        .context
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.build.context));

    // --load and multi-platform output are mutually exclusive in buildx.
    let load = !args.no_load && args.platforms.is_none();

    let opts = BuildOptions {
        dockerfile: dockerfile.clone(),
        context: context.clone(),
        image: args.image.clone(),
        tags,
        build_args: args.build_args.clone(),
        secrets: args.secrets.clone(),
        target: args.target.clone(),
        platforms: args.platforms.clone(),
        push: args.push,
        load,
        no_cache: args.no_cache,
        builder,
        cache,
    };

    buildx::run_build(&opts).await?;
    info!("Build complete: {}", args.image);

    let metadata = buildx::read_metadata(&buildx::metadata_file()).await;
    emit_output("image-id", &metadata.image_id);
    emit_output("digest", &metadata.digest);
    emit_output(
        "dockerfile-hash",
        &buildx::dockerfile_hash(&context.join(&dockerfile)),
    );

    Ok(())
}

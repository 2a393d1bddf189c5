//! CLI argument definitions using clap derive

use crate::cache::CacheBackend;
use crate::refs::CacheMode;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Kiln - CI build-cache orchestrator
///
/// Coordinates a content-addressed remote cache with docker buildx across
/// the restore/build/save phases of a CI pipeline.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Phase-state file path (distinct per concurrent run)
    #[arg(long, global = true, env = "KILN_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Skip local kiln.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore phase: set up the builder and cache backend, emit directives
    Restore(RestoreArgs),

    /// Build phase: run docker buildx build with the prepared directives
    Build(BuildArgs),

    /// Save phase: stop the proxy or upload the local cache export
    Save(SaveArgs),

    /// Show or inspect configuration
    Config(ConfigArgs),
}

/// Arguments for the restore phase
#[derive(Parser, Debug)]
pub struct RestoreArgs {
    /// Cache workspace (org/project); falls back to CASCACHE_DEFAULT_WORKSPACE
    #[arg(short, long)]
    pub workspace: Option<String>,

    /// Image name, used to derive the default cache tag
    #[arg(long)]
    pub image: Option<String>,

    /// Cache tag (defaults to the slugified image name)
    #[arg(long)]
    pub cache_tag: Option<String>,

    /// Cache backend
    #[arg(long, value_enum)]
    pub backend: Option<CacheBackend>,

    /// Registry proxy port
    #[arg(long)]
    pub port: Option<u16>,

    /// Cache export mode
    #[arg(long, value_enum)]
    pub cache_mode: Option<CacheMode>,

    /// Buildx driver
    #[arg(long)]
    pub driver: Option<String>,

    /// Extra driver options (repeatable)
    #[arg(long = "driver-opt")]
    pub driver_opts: Vec<String>,

    /// Inline buildkitd TOML configuration
    #[arg(long)]
    pub buildkitd_config: Option<String>,

    /// Target platforms; triggers QEMU setup when set
    #[arg(long)]
    pub platforms: Option<String>,

    /// Glob pattern excluded from cache saves
    #[arg(long)]
    pub exclude: Option<String>,

    /// Verbose cascache output (restore, save, and proxy)
    #[arg(long)]
    pub cache_verbose: bool,

    /// Disable git-context enrichment in the registry proxy
    #[arg(long)]
    pub proxy_no_git: bool,

    /// Disable platform-context enrichment in the registry proxy
    #[arg(long)]
    pub proxy_no_platform: bool,

    /// Seconds to wait for the registry proxy to become ready
    #[arg(long, default_value = "20")]
    pub ready_timeout: u64,
}

/// Arguments for the build phase
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Image name
    #[arg(long, required = true)]
    pub image: String,

    /// Image tags (repeatable; defaults to latest)
    #[arg(short = 't', long = "tag")]
    pub tags: Vec<String>,

    /// Dockerfile path relative to the context
    #[arg(long)]
    pub dockerfile: Option<String>,

    /// Build context directory
    #[arg(long)]
    pub context: Option<PathBuf>,

    /// Build arguments (KEY=VALUE, repeatable)
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Build secrets (repeatable)
    #[arg(long = "secret")]
    pub secrets: Vec<String>,

    /// Target build stage
    #[arg(long)]
    pub target: Option<String>,

    /// Target platforms (disables --load)
    #[arg(long)]
    pub platforms: Option<String>,

    /// Push the image after building
    #[arg(long)]
    pub push: bool,

    /// Skip loading the image into the local daemon
    #[arg(long)]
    pub no_load: bool,

    /// Build without importing cache
    #[arg(long)]
    pub no_cache: bool,
}

/// Arguments for the save phase
#[derive(Parser, Debug)]
pub struct SaveArgs {
    /// Cache workspace, when not found in phase state
    #[arg(short, long)]
    pub workspace: Option<String>,

    /// Cache tag, when not found in phase state
    #[arg(long)]
    pub cache_tag: Option<String>,

    /// Image name, used to derive the cache tag as a last resort
    #[arg(long)]
    pub image: Option<String>,

    /// Glob pattern excluded from the save
    #[arg(long)]
    pub exclude: Option<String>,

    /// Verbose cascache output
    #[arg(long)]
    pub cache_verbose: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_restore() {
        let cli = Cli::try_parse_from([
            "kiln",
            "restore",
            "--workspace",
            "acme/app",
            "--image",
            "ghcr.io/acme/app",
            "--backend",
            "registry",
            "--port",
            "5010",
        ])
        .unwrap();
        match cli.command {
            Commands::Restore(args) => {
                assert_eq!(args.workspace.as_deref(), Some("acme/app"));
                assert_eq!(args.port, Some(5010));
                assert_eq!(args.backend, Some(CacheBackend::Registry));
                assert_eq!(args.ready_timeout, 20);
            }
            other => panic!("expected restore, got {:?}", other),
        }
    }

    #[test]
    fn cli_parses_build_with_repeated_flags() {
        let cli = Cli::try_parse_from([
            "kiln", "build", "--image", "my-app", "-t", "latest", "-t", "v1", "--build-arg",
            "FOO=bar",
        ])
        .unwrap();
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.tags, vec!["latest", "v1"]);
                assert_eq!(args.build_args, vec!["FOO=bar"]);
            }
            other => panic!("expected build, got {:?}", other),
        }
    }

    #[test]
    fn build_requires_image() {
        assert!(Cli::try_parse_from(["kiln", "build"]).is_err());
    }

    #[test]
    fn verbose_is_global_and_counted() {
        let cli = Cli::try_parse_from(["kiln", "-vv", "save"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}

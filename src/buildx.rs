//! docker buildx collaborator wrapper
//!
//! Builder setup, QEMU platform emulation, the build invocation itself, and
//! post-build metadata. Kiln never interprets build semantics; it assembles
//! arguments, runs the CLI synchronously, and surfaces exit codes verbatim.

use crate::error::{KilnError, KilnResult};
use crate::refs::CacheDirectives;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Builder instance kiln creates and reuses across runs
pub const DEFAULT_BUILDER: &str = "kiln-builder";

/// Where the build writes its metadata JSON
pub fn metadata_file() -> PathBuf {
    std::env::temp_dir().join("kiln-metadata.json")
}

/// Builder creation parameters
#[derive(Debug, Clone)]
pub struct BuilderSetup {
    pub driver: String,
    pub driver_opts: Vec<String>,
    /// Inline buildkitd TOML, written to a temp file when present
    pub buildkitd_config: Option<String>,
    /// Registry-proxy backend in use; affects driver-opt defaults
    pub registry_mode: bool,
}

/// The driver actually usable for cache export.
///
/// The `docker` driver cannot export cache, so it is downgraded to
/// `docker-container`. Returns the driver and whether a downgrade happened.
pub fn effective_driver(requested: &str) -> (String, bool) {
    if requested == "docker" {
        ("docker-container".to_string(), true)
    } else if requested.is_empty() {
        ("docker-container".to_string(), false)
    } else {
        (requested.to_string(), false)
    }
}

/// Driver opts with `network=host` injected for registry-proxy access.
///
/// Only applies to the docker-container driver, and never overrides a
/// user-supplied network option.
pub fn driver_opts_for(driver: &str, registry_mode: bool, opts: &[String]) -> Vec<String> {
    let mut effective = opts.to_vec();
    if registry_mode
        && driver == "docker-container"
        && !effective.iter().any(|o| o.starts_with("network="))
    {
        effective.push("network=host".to_string());
    }
    effective
}

/// Ensure the named builder exists and is selected; create it if missing.
pub async fn setup_builder(setup: &BuilderSetup) -> KilnResult<String> {
    let (driver, downgraded) = effective_driver(&setup.driver);
    if downgraded {
        warn!("Buildx driver \"docker\" does not support cache export; falling back to \"docker-container\"");
    }

    let driver_opts = driver_opts_for(&driver, setup.registry_mode, &setup.driver_opts);
    if setup.registry_mode && driver_opts.len() > setup.driver_opts.len() {
        info!("Adding network=host to builder for registry proxy access");
    }

    let inspect = docker(&["buildx", "inspect", DEFAULT_BUILDER]).await?;
    if inspect.status.success() {
        debug!("Reusing existing builder {}", DEFAULT_BUILDER);
        let use_out = docker(&["buildx", "use", DEFAULT_BUILDER]).await?;
        if !use_out.status.success() {
            let stderr = String::from_utf8_lossy(&use_out.stderr);
            return Err(KilnError::command_exec("docker buildx use", stderr.to_string()));
        }
        return Ok(DEFAULT_BUILDER.to_string());
    }

    let config_path = match setup.buildkitd_config.as_deref() {
        Some(inline) if !inline.trim().is_empty() => {
            let path = std::env::temp_dir().join("kiln-buildkitd.toml");
            tokio::fs::write(&path, inline)
                .await
                .map_err(|e| KilnError::io("writing buildkitd config", e))?;
            Some(path)
        }
        _ => None,
    };

    let mut args: Vec<String> = vec![
        "buildx".into(),
        "create".into(),
        "--name".into(),
        DEFAULT_BUILDER.into(),
        "--driver".into(),
        driver,
    ];
    for opt in &driver_opts {
        args.push("--driver-opt".into());
        args.push(opt.clone());
    }
    if let Some(ref path) = config_path {
        args.push("--config".into());
        args.push(path.display().to_string());
    }
    args.push("--use".into());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = docker(&arg_refs).await?;
    if !output.status.success() {
        return Err(KilnError::BuilderCreate {
            code: output.status.code().unwrap_or(-1),
        });
    }

    Ok(DEFAULT_BUILDER.to_string())
}

/// Extract the platforms list from `docker buildx inspect` output.
pub fn parse_platforms_line(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("Platforms:"))
        .map(|line| line.trim_start().trim_start_matches("Platforms:").trim().to_string())
}

/// Platforms the builder supports, or empty on any failure.
pub async fn builder_platforms(builder: &str) -> String {
    match docker(&["buildx", "inspect", builder]).await {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_platforms_line(&stdout).unwrap_or_default()
        }
        _ => String::new(),
    }
}

/// Install binfmt handlers for cross-platform builds.
///
/// No-op when no platforms were requested; failure is fatal because the
/// requested build cannot run without emulation.
pub async fn setup_qemu(platforms: &str) -> KilnResult<()> {
    if platforms.is_empty() {
        return Ok(());
    }

    info!("Installing QEMU binfmt handlers for {}", platforms);
    let output = docker(&[
        "run",
        "--privileged",
        "--rm",
        "tonistiigi/binfmt",
        "--install",
        "all",
    ])
    .await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(KilnError::QemuSetup {
            code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Everything one build invocation needs
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub dockerfile: String,
    pub context: PathBuf,
    pub image: String,
    pub tags: Vec<String>,
    pub build_args: Vec<String>,
    pub secrets: Vec<String>,
    pub target: Option<String>,
    pub platforms: Option<String>,
    pub push: bool,
    pub load: bool,
    pub no_cache: bool,
    pub builder: String,
    pub cache: Option<CacheDirectives>,
}

/// Assemble the full `docker buildx build` argument list.
pub fn build_args(opts: &BuildOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "buildx".into(),
        "build".into(),
        "--builder".into(),
        opts.builder.clone(),
        "-f".into(),
        opts.dockerfile.clone(),
    ];

    for tag in &opts.tags {
        args.push("-t".into());
        args.push(format!("{}:{}", opts.image, tag));
    }
    for arg in &opts.build_args {
        args.push("--build-arg".into());
        args.push(arg.clone());
    }
    for secret in &opts.secrets {
        args.push("--secret".into());
        args.push(secret.clone());
    }
    if let Some(ref target) = opts.target {
        args.push("--target".into());
        args.push(target.clone());
    }
    if let Some(ref platforms) = opts.platforms {
        args.push("--platform".into());
        args.push(platforms.clone());
    }
    if opts.push {
        args.push("--push".into());
    }
    if opts.load {
        args.push("--load".into());
    }
    if opts.no_cache {
        args.push("--no-cache".into());
    }
    if let Some(ref cache) = opts.cache {
        args.push("--cache-from".into());
        args.push(cache.cache_from.clone());
        args.push("--cache-to".into());
        args.push(cache.cache_to.clone());
    }

    args.push("--metadata-file".into());
    args.push(metadata_file().display().to_string());
    args.push(".".into());

    args
}

/// Run the build synchronously, streaming output to the caller's terminal.
pub async fn run_build(opts: &BuildOptions) -> KilnResult<()> {
    let args = build_args(opts);
    debug!("Executing: docker {:?}", args);

    let status = Command::new("docker")
        .args(&args)
        .current_dir(&opts.context)
        .env("DOCKER_BUILDKIT", "1")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| KilnError::command_failed("docker buildx build", e))?;

    if status.success() {
        Ok(())
    } else {
        Err(KilnError::BuildFailed {
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Image identity emitted by the build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    pub image_id: String,
    pub digest: String,
}

/// Read the buildx metadata file; absent or garbled files yield empty ids.
pub async fn read_metadata(path: &Path) -> ImageMetadata {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return ImageMetadata::default(),
    };

    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(data) => ImageMetadata {
            image_id: data["containerimage.config.digest"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            digest: data["containerimage.digest"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        },
        Err(e) => {
            warn!("Failed to parse metadata file: {}", e);
            ImageMetadata::default()
        }
    }
}

/// Short content hash of a Dockerfile, empty when the file is missing.
pub fn dockerfile_hash(path: &Path) -> String {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(_) => return String::new(),
    };
    let digest = Sha256::digest(&content);
    hex::encode(digest)[..16].to_string()
}

async fn docker(args: &[&str]) -> KilnResult<std::process::Output> {
    debug!("Executing: docker {:?}", args);

    Command::new("docker")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| KilnError::command_failed(format!("docker {:?}", args), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::CacheMode;

    // ---- driver selection ----

    #[test]
    fn docker_driver_downgraded() {
        assert_eq!(effective_driver("docker"), ("docker-container".to_string(), true));
    }

    #[test]
    fn empty_driver_defaults_without_warning() {
        assert_eq!(effective_driver(""), ("docker-container".to_string(), false));
    }

    #[test]
    fn other_drivers_pass_through() {
        assert_eq!(effective_driver("remote"), ("remote".to_string(), false));
    }

    // ---- driver opts ----

    #[test]
    fn network_host_injected_in_registry_mode() {
        let opts = driver_opts_for("docker-container", true, &[]);
        assert_eq!(opts, vec!["network=host".to_string()]);
    }

    #[test]
    fn user_network_opt_not_overridden() {
        let user = vec!["network=custom".to_string()];
        let opts = driver_opts_for("docker-container", true, &user);
        assert_eq!(opts, user);
    }

    #[test]
    fn no_injection_outside_registry_mode() {
        assert!(driver_opts_for("docker-container", false, &[]).is_empty());
        assert!(driver_opts_for("remote", true, &[]).is_empty());
    }

    // ---- platforms parsing ----

    #[test]
    fn platforms_line_parsed() {
        let output = "Name: kiln-builder\nDriver: docker-container\n\nNodes:\nPlatforms: linux/amd64, linux/arm64\n";
        assert_eq!(
            parse_platforms_line(output),
            Some("linux/amd64, linux/arm64".to_string())
        );
    }

    #[test]
    fn platforms_line_indented() {
        let output = "Nodes:\n  Platforms: linux/amd64\n";
        assert_eq!(parse_platforms_line(output), Some("linux/amd64".to_string()));
    }

    #[test]
    fn platforms_line_missing() {
        assert_eq!(parse_platforms_line("Name: x\n"), None);
    }

    // ---- build args assembly ----

    fn base_opts() -> BuildOptions {
        BuildOptions {
            dockerfile: "Dockerfile".to_string(),
            context: PathBuf::from("."),
            image: "my-app".to_string(),
            tags: vec!["latest".to_string()],
            build_args: vec![],
            secrets: vec![],
            target: None,
            platforms: None,
            push: false,
            load: true,
            no_cache: false,
            builder: DEFAULT_BUILDER.to_string(),
            cache: None,
        }
    }

    #[test]
    fn build_args_minimal() {
        let args = build_args(&base_opts());
        assert_eq!(args[0], "buildx");
        assert_eq!(args[1], "build");
        assert!(args.contains(&"--builder".to_string()));
        assert!(args.contains(&"my-app:latest".to_string()));
        assert!(args.contains(&"--load".to_string()));
        assert!(!args.contains(&"--push".to_string()));
        assert_eq!(args.last().unwrap(), ".");
        let meta_pos = args.iter().position(|a| a == "--metadata-file").unwrap();
        assert!(meta_pos < args.len() - 2);
    }

    #[test]
    fn build_args_cache_directives_verbatim() {
        let mut opts = base_opts();
        opts.cache = Some(CacheDirectives::registry("172.17.0.1:5000/my-app", CacheMode::Max));
        let args = build_args(&opts);
        let from_pos = args.iter().position(|a| a == "--cache-from").unwrap();
        assert_eq!(
            args[from_pos + 1],
            "type=registry,ref=172.17.0.1:5000/my-app,registry.insecure=true"
        );
        let to_pos = args.iter().position(|a| a == "--cache-to").unwrap();
        assert!(args[to_pos + 1].ends_with("mode=max"));
    }

    #[test]
    fn build_args_full_surface() {
        let mut opts = base_opts();
        opts.tags = vec!["latest".to_string(), "v1".to_string()];
        opts.build_args = vec!["FOO=bar".to_string()];
        opts.secrets = vec!["id=npm,src=.npmrc".to_string()];
        opts.target = Some("runtime".to_string());
        opts.platforms = Some("linux/amd64,linux/arm64".to_string());
        opts.push = true;
        opts.load = false;
        opts.no_cache = true;

        let args = build_args(&opts);
        assert!(args.contains(&"my-app:v1".to_string()));
        assert!(args.contains(&"FOO=bar".to_string()));
        assert!(args.contains(&"id=npm,src=.npmrc".to_string()));
        assert!(args.contains(&"--target".to_string()));
        assert!(args.contains(&"--platform".to_string()));
        assert!(args.contains(&"--push".to_string()));
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(!args.contains(&"--load".to_string()));
    }

    // ---- metadata ----

    #[tokio::test]
    async fn metadata_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        tokio::fs::write(
            &path,
            r#"{"containerimage.config.digest":"sha256:aaa","containerimage.digest":"sha256:bbb"}"#,
        )
        .await
        .unwrap();

        let meta = read_metadata(&path).await;
        assert_eq!(meta.image_id, "sha256:aaa");
        assert_eq!(meta.digest, "sha256:bbb");
    }

    #[tokio::test]
    async fn metadata_missing_file_is_empty() {
        let meta = read_metadata(Path::new("/nonexistent/kiln-metadata.json")).await;
        assert_eq!(meta, ImageMetadata::default());
    }

    #[tokio::test]
    async fn metadata_garbled_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        assert_eq!(read_metadata(&path).await, ImageMetadata::default());
    }

    // ---- dockerfile hash ----

    #[test]
    fn dockerfile_hash_is_short_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dockerfile");
        std::fs::write(&path, "FROM alpine\n").unwrap();

        let h1 = dockerfile_hash(&path);
        let h2 = dockerfile_hash(&path);
        assert_eq!(h1.len(), 16);
        assert_eq!(h1, h2);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn dockerfile_hash_missing_file_is_empty() {
        assert_eq!(dockerfile_hash(Path::new("/nonexistent/Dockerfile")), "");
    }
}

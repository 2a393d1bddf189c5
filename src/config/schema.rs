//! Configuration schema for Kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`, optionally
//! overridden by a project-local `kiln.toml`. CLI flags win over both.

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Build defaults
    pub build: BuildConfig,

    /// Cache backend defaults
    pub cache: CacheConfig,
}

/// Defaults for the build invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Dockerfile path relative to the context
    pub dockerfile: String,

    /// Build context directory
    pub context: String,

    /// Buildx driver
    pub driver: String,

    /// Extra driver options passed at builder creation
    pub driver_opts: Vec<String>,

    /// Inline buildkitd TOML configuration
    pub buildkitd_config: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            dockerfile: "Dockerfile".to_string(),
            context: ".".to_string(),
            driver: "docker-container".to_string(),
            driver_opts: vec![],
            buildkitd_config: None,
        }
    }
}

/// Defaults for the cache backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend: "registry" or "local"
    pub backend: String,

    /// Registry proxy port
    pub port: u16,

    /// Export mode: "min" or "max"
    pub mode: String,

    /// Cache workspace (org/project)
    pub workspace: Option<String>,

    /// Glob pattern excluded from cache saves
    pub exclude: Option<String>,

    /// Verbose cascache output
    pub verbose: bool,

    /// Disable git-context enrichment in the proxy
    pub proxy_no_git: bool,

    /// Disable platform-context enrichment in the proxy
    pub proxy_no_platform: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "registry".to_string(),
            port: 5000,
            mode: "max".to_string(),
            workspace: None,
            exclude: None,
            verbose: false,
            proxy_no_git: false,
            proxy_no_platform: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.build.dockerfile, "Dockerfile");
        assert_eq!(config.cache.backend, "registry");
        assert_eq!(config.cache.port, 5000);
        assert_eq!(config.cache.mode, "max");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            backend = "local"
            port = 5010
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.backend, "local");
        assert_eq!(config.cache.port, 5010);
        assert_eq!(config.cache.mode, "max");
        assert_eq!(config.build.driver, "docker-container");
    }

    #[test]
    fn roundtrip() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.cache.port, config.cache.port);
    }
}

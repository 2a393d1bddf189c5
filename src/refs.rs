//! Registry reference and cache-directive construction
//!
//! Produces the strings `docker buildx build --cache-from/--cache-to`
//! consumes. Directives are opaque to the rest of the crate: built here,
//! passed through verbatim, never parsed back.

use crate::error::{KilnError, KilnResult};
use clap::ValueEnum;
use std::path::Path;

/// How much of the build to export into the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheMode {
    /// Only the final layer
    Min,
    /// Every intermediate layer
    Max,
}

impl CacheMode {
    /// The buildx `mode=` attribute value
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Min => "min",
            CacheMode::Max => "max",
        }
    }
}

/// Cache import/export directive pair for one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirectives {
    /// `--cache-from` value
    pub cache_from: String,
    /// `--cache-to` value
    pub cache_to: String,
}

/// Replace every character outside `[A-Za-z0-9]` with `-`.
///
/// Used to turn image names like `ghcr.io/org/app` into registry-safe
/// cache tags. Idempotent.
pub fn slugify(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Format a registry coordinate as `host:port/tag`.
pub fn registry_ref(host: &str, port: u16, tag: &str) -> String {
    format!("{}:{}/{}", host, port, tag)
}

impl CacheDirectives {
    /// Directives for the registry-proxy backend.
    ///
    /// The proxy is a local plaintext HTTP emulation, so both directives
    /// mark the registry as insecure; only the export carries the mode.
    pub fn registry(reference: &str, mode: CacheMode) -> Self {
        Self {
            cache_from: format!("type=registry,ref={},registry.insecure=true", reference),
            cache_to: format!(
                "type=registry,ref={},registry.insecure=true,mode={}",
                reference,
                mode.as_str()
            ),
        }
    }

    /// Directives for the local-directory backend.
    ///
    /// BuildKit's local cache driver cannot safely read and write the same
    /// directory mid-build, so identical paths are rejected outright.
    pub fn local(from_dir: &Path, to_dir: &Path, mode: CacheMode) -> KilnResult<Self> {
        if from_dir == to_dir {
            return Err(KilnError::CacheDirsConflict(from_dir.to_path_buf()));
        }
        Ok(Self {
            cache_from: format!("type=local,src={}", from_dir.display()),
            cache_to: format!(
                "type=local,dest={},mode={}",
                to_dir.display(),
                mode.as_str()
            ),
        })
    }
}

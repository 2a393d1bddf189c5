//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Configuration errors
    #[error("Workspace is required. Set --workspace or the CASCACHE_DEFAULT_WORKSPACE env var.")]
    WorkspaceRequired,

    #[error("CASCACHE_TOKEN is required for registry proxy mode")]
    TokenRequired,

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // Cache directive errors
    #[error("Local cache import and export directories must differ (both were {0})")]
    CacheDirsConflict(PathBuf),

    // Proxy errors
    #[error("Failed to start registry proxy: {0}")]
    ProxySpawn(String),

    #[error("Registry proxy exited before becoming ready\n--- proxy log ---\n{log}")]
    ProxyDied { log: String },

    #[error("Registry proxy did not become ready within {timeout_ms}ms\n--- proxy log ---\n{log}")]
    ProxyTimeout { timeout_ms: u64, log: String },

    // Builder errors
    #[error("Buildx driver setup failed (exit {code})")]
    BuilderCreate { code: i32 },

    #[error("Failed to set up QEMU for multi-platform builds (exit {code})")]
    QemuSetup { code: i32 },

    #[error("docker buildx build failed with exit code {code}")]
    BuildFailed { code: i32 },

    // Phase state errors
    #[error("Phase state missing required key: {0}")]
    StateMissing(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::WorkspaceRequired => Some("Pass --workspace org/project"),
            Self::TokenRequired => Some("Export CASCACHE_TOKEN before the restore phase"),
            Self::BuilderCreate { .. } => {
                Some("Check that docker buildx is installed: docker buildx version")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KilnError::TokenRequired;
        assert!(err.to_string().contains("CASCACHE_TOKEN"));
    }

    #[test]
    fn error_hint() {
        let err = KilnError::WorkspaceRequired;
        assert_eq!(err.hint(), Some("Pass --workspace org/project"));
        assert!(KilnError::StateMissing("x".into()).hint().is_none());
    }

    #[test]
    fn proxy_timeout_includes_log() {
        let err = KilnError::ProxyTimeout {
            timeout_ms: 20000,
            log: "bind failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("20000ms"));
        assert!(msg.contains("bind failed"));
    }
}

//! cascache CLI invocations for restore and save
//!
//! Cache traffic is an optional convenience: a missing token or an empty
//! export directory is a skip, never a failure. Only a broken `save` with
//! real content to upload surfaces an error, and the save phase downgrades
//! even that to a warning.

use crate::cache::{dir_is_empty, token};
use crate::error::{KilnError, KilnResult};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Optional flags shared by restore and save
#[derive(Debug, Clone, Default)]
pub struct CacheFlags {
    pub verbose: bool,
    pub exclude: Option<String>,
}

/// What a restore attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    Miss,
    SkippedNoToken,
}

/// What a save attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    SkippedNoToken,
    SkippedEmpty,
}

/// Wrapper around the external content-addressed cache CLI
pub struct CacheCli {
    bin: String,
}

impl Default for CacheCli {
    fn default() -> Self {
        Self {
            bin: "cascache".to_string(),
        }
    }
}

impl CacheCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the binary invoked. Used by tests to substitute a recorder.
    pub fn with_bin(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// The binary this wrapper invokes
    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Restore a cache entry into `dir`.
    ///
    /// A missing token or a miss in the remote store are both non-errors.
    pub async fn restore(
        &self,
        workspace: &str,
        tag: &str,
        dir: &Path,
        flags: &CacheFlags,
    ) -> KilnResult<RestoreOutcome> {
        if token().is_none() {
            info!("Skipping cache restore ({} not set)", crate::cache::ENV_TOKEN);
            return Ok(RestoreOutcome::SkippedNoToken);
        }

        let entry = format!("{}:{}", tag, dir.display());
        let mut args = vec!["restore", workspace, &entry];
        if flags.verbose {
            args.push("--verbose");
        }

        let output = self.exec(&args).await?;

        if output.status.success() {
            info!("Cache restored (tag: {})", tag);
            Ok(RestoreOutcome::Restored)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("Cache restore missed: {}", stderr.trim());
            info!("Cache miss (tag: {})", tag);
            Ok(RestoreOutcome::Miss)
        }
    }

    /// Save the contents of `dir` as a cache entry.
    ///
    /// Nothing to upload is a silent no-op.
    pub async fn save(
        &self,
        workspace: &str,
        tag: &str,
        dir: &Path,
        flags: &CacheFlags,
    ) -> KilnResult<SaveOutcome> {
        if token().is_none() {
            info!("Skipping cache save ({} not set)", crate::cache::ENV_TOKEN);
            return Ok(SaveOutcome::SkippedNoToken);
        }

        if dir_is_empty(dir).await {
            info!("No cache files to save");
            return Ok(SaveOutcome::SkippedEmpty);
        }

        let entry = format!("{}:{}", tag, dir.display());
        let mut args = vec!["save", workspace, &entry, "--force"];
        if flags.verbose {
            args.push("--verbose");
        }
        if let Some(ref pattern) = flags.exclude {
            args.push("--exclude");
            args.push(pattern);
        }

        let output = self.exec(&args).await?;

        if output.status.success() {
            info!("Cache saved (tag: {})", tag);
            Ok(SaveOutcome::Saved)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Cache save failed: {}", stderr.trim());
            Err(KilnError::command_exec(
                format!("{} save", self.bin),
                stderr.to_string(),
            ))
        }
    }

    async fn exec(&self, args: &[&str]) -> KilnResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.bin, args);

        Command::new(&self.bin)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KilnError::command_failed(format!("{} {:?}", self.bin, args), e))
    }
}

//! Registry proxy process lifecycle
//!
//! The proxy is a detached `cascache serve` process that impersonates a
//! container-registry HTTP API, letting buildx's registry cache driver read
//! and write blobs that actually live in the remote content-addressed store.
//!
//! Pipeline phases run as separate processes, so the proxy's identity
//! crosses phases through a PID marker file, and an already-listening port
//! is detected and reused rather than double-spawned. Readiness is defined
//! by protocol shape alone: a live process that has not answered the
//! registry API root yet is not ready.
//!
//! Side-channel files are namespaced by port, so concurrent runs on
//! distinct ports never collide. Runs sharing a port share a proxy.

use crate::cache::token;
use crate::error::{KilnError, KilnResult};
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Poll interval for the readiness gate
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long the readiness gate waits before giving up
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Grace period between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Per-request timeout for a single readiness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Max log lines attached to proxy failure messages
const LOG_TAIL_LINES: usize = 50;

/// Identity of a running (or presumed running) proxy process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHandle {
    /// Process id; negative when the owner is unknown
    pub pid: i32,
    /// Address the proxy was asked to bind
    pub bind_host: String,
    pub port: u16,
    /// Whether this invocation spawned the process
    pub owned: bool,
}

impl ProxyHandle {
    /// Handle for a proxy that answers the port but whose pid is unknown.
    ///
    /// Callers must not attempt to manage a process they cannot identify;
    /// `stop` treats this as a no-op.
    pub fn unknown(bind_host: impl Into<String>, port: u16) -> Self {
        Self {
            pid: -1,
            bind_host: bind_host.into(),
            port,
            owned: false,
        }
    }

    /// Whether the handle names a real process id
    pub fn has_pid(&self) -> bool {
        self.pid > 0
    }
}

/// Everything `cascache serve` needs on its command line
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub workspace: String,
    /// Optional tag scope for the served cache
    pub tag: Option<String>,
    pub bind_host: String,
    pub port: u16,
    pub verbose: bool,
    /// Disable git-context enrichment in the proxy
    pub no_git: bool,
    /// Disable platform-context enrichment in the proxy
    pub no_platform: bool,
}

/// Durable side-channel files for one proxy instance
#[derive(Debug, Clone)]
pub struct ProxyPaths {
    /// Marker holding the spawned pid, read by later phases
    pub pid_file: PathBuf,
    /// Combined stdout/stderr of the proxy, overwritten per run
    pub log_file: PathBuf,
}

impl ProxyPaths {
    /// Default paths under the OS temp dir, namespaced by port.
    pub fn for_port(port: u16) -> Self {
        let tmp = std::env::temp_dir();
        Self {
            pid_file: tmp.join(format!("kiln-proxy-{}.pid", port)),
            log_file: tmp.join(format!("kiln-proxy-{}.log", port)),
        }
    }
}

/// Owns spawn, reuse detection, readiness, and teardown of the proxy
pub struct ProxyManager {
    bin: String,
    paths: ProxyPaths,
    poll_interval: Duration,
    stop_grace: Duration,
}

impl ProxyManager {
    pub fn new(port: u16) -> Self {
        Self {
            bin: "cascache".to_string(),
            paths: ProxyPaths::for_port(port),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: STOP_GRACE,
        }
    }

    /// Override the proxy binary. Used by tests.
    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    /// Override the side-channel file locations. Used by tests.
    pub fn with_paths(mut self, paths: ProxyPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Override the readiness poll interval. Used by tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the SIGTERM grace period. Used by tests.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn paths(&self) -> &ProxyPaths {
        &self.paths
    }

    /// Start the proxy, or adopt one already answering the port.
    ///
    /// Returns immediately after spawning; readiness is a separate step.
    pub async fn start(&self, opts: &ProxyOptions) -> KilnResult<ProxyHandle> {
        if token().is_none() {
            return Err(KilnError::TokenRequired);
        }

        // A proxy from an earlier phase of this run may still be listening.
        if registry_answers(opts.port).await {
            return Ok(self.adopt_existing(opts));
        }

        let log = File::create(&self.paths.log_file).map_err(|e| {
            KilnError::io(format!("creating proxy log {}", self.paths.log_file.display()), e)
        })?;
        let log_err = log
            .try_clone()
            .map_err(|e| KilnError::io("cloning proxy log handle", e))?;

        let mut cmd = std::process::Command::new(&self.bin);
        cmd.arg("serve").arg(&opts.workspace);
        if let Some(ref tag) = opts.tag {
            cmd.arg(tag);
        }
        if opts.no_git {
            cmd.arg("--no-git");
        }
        if opts.no_platform {
            cmd.arg("--no-platform");
        }
        cmd.args(["--host", &opts.bind_host, "--port", &opts.port.to_string()]);
        if opts.verbose {
            cmd.arg("--verbose");
        }

        info!("Starting registry proxy on {}:{}...", opts.bind_host, opts.port);

        // New process group so the proxy survives this phase process.
        let child = cmd
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|e| KilnError::ProxySpawn(format!("{}: {}", self.bin, e)))?;

        let pid = child.id() as i32;

        std::fs::write(&self.paths.pid_file, pid.to_string()).map_err(|e| {
            KilnError::io(format!("writing pid marker {}", self.paths.pid_file.display()), e)
        })?;

        info!("Registry proxy started (PID: {})", pid);

        Ok(ProxyHandle {
            pid,
            bind_host: opts.bind_host.clone(),
            port: opts.port,
            owned: true,
        })
    }

    /// Build a handle for a proxy an earlier phase left running.
    fn adopt_existing(&self, opts: &ProxyOptions) -> ProxyHandle {
        match std::fs::read_to_string(&self.paths.pid_file) {
            Ok(raw) => match raw.trim().parse::<i32>() {
                Ok(pid) if pid > 0 => {
                    info!("Reusing registry proxy on port {} (PID: {})", opts.port, pid);
                    ProxyHandle {
                        pid,
                        bind_host: opts.bind_host.clone(),
                        port: opts.port,
                        owned: false,
                    }
                }
                _ => {
                    warn!(
                        "Port {} answers but pid marker {} is garbled; proxy owner unknown",
                        opts.port,
                        self.paths.pid_file.display()
                    );
                    ProxyHandle::unknown(opts.bind_host.clone(), opts.port)
                }
            },
            Err(_) => {
                warn!(
                    "Port {} answers but pid marker {} is unreadable; proxy owner unknown",
                    opts.port,
                    self.paths.pid_file.display()
                );
                ProxyHandle::unknown(opts.bind_host.clone(), opts.port)
            }
        }
    }

    /// Poll until the proxy answers like a registry, or fail with its log.
    ///
    /// An owned process that dies mid-wait fails immediately rather than
    /// running out the timeout; a reused or unknown-owner handle degrades
    /// to pure polling.
    pub async fn wait_until_ready(
        &self,
        handle: &ProxyHandle,
        timeout: Duration,
    ) -> KilnResult<()> {
        let start = Instant::now();

        loop {
            if registry_answers(handle.port).await {
                info!("Registry proxy is ready");
                return Ok(());
            }

            if handle.owned && !process_is_alive(handle.pid) {
                return Err(KilnError::ProxyDied {
                    log: self.log_tail(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(KilnError::ProxyTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                    log: self.log_tail(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop the proxy: SIGTERM, grace period, then SIGKILL.
    ///
    /// A handle without a known pid is left alone; this phase cannot manage
    /// a process it did not identify. Already-dead processes are fine.
    pub async fn stop(&self, handle: &ProxyHandle) -> KilnResult<()> {
        if !handle.has_pid() {
            info!("No owned registry proxy process; leaving port {} untouched", handle.port);
            return Ok(());
        }

        info!("Stopping registry proxy (PID: {})...", handle.pid);

        // ESRCH here means it already exited, which is the goal anyway.
        let rc = unsafe { libc::kill(handle.pid, libc::SIGTERM) };
        if rc != 0 {
            debug!("SIGTERM to {} failed; process already gone", handle.pid);
            return Ok(());
        }

        tokio::time::sleep(self.stop_grace).await;

        if process_is_alive(handle.pid) {
            debug!("Proxy {} still alive after grace period; sending SIGKILL", handle.pid);
            unsafe {
                libc::kill(handle.pid, libc::SIGKILL);
            }
        }

        info!("Registry proxy stopped");
        Ok(())
    }

    /// Last lines of the proxy log, for failure diagnostics.
    fn log_tail(&self) -> String {
        let content = std::fs::read_to_string(&self.paths.log_file).unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(LOG_TAIL_LINES);
        lines[skip..].join("\n")
    }
}

/// Whether a process exists, probed with a null signal.
///
/// Never affects the target process.
pub fn process_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

/// One protocol-level readiness probe against the registry API root.
///
/// 200 and 401 both count: a registry demanding auth for listing is up.
async fn registry_answers(port: u16) -> bool {
    tokio::task::spawn_blocking(move || probe_blocking(port))
        .await
        .unwrap_or(false)
}

fn probe_blocking(port: u16) -> bool {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(PROBE_TIMEOUT))
        .build()
        .into();

    let url = format!("http://127.0.0.1:{}/v2/", port);
    match agent.get(&url).call() {
        Ok(resp) => matches!(resp.status().as_u16(), 200 | 401),
        Err(_) => false,
    }
}

//! Network topology resolution for the buildx builder
//!
//! The registry proxy binds on the host, but the builder may run either in
//! the host network namespace or inside an isolated bridge network. This
//! module inspects the builder's container to decide where the proxy must
//! bind and which address the builder can reach it on.
//!
//! Introspection failures never abort a build: the resolver logs a warning
//! and substitutes the conservative bridge-mode defaults.

use crate::error::{KilnError, KilnResult};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Loopback address used when builder and proxy share a network namespace
pub const LOOPBACK: &str = "127.0.0.1";

/// Wildcard bind address used when the builder is network-isolated
pub const ALL_INTERFACES: &str = "0.0.0.0";

/// Default docker bridge gateway, used when network inspection fails
pub const DEFAULT_BRIDGE_GATEWAY: &str = "172.17.0.1";

/// How the builder's network relates to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Builder shares the host network namespace
    Host,
    /// Builder runs in a bridge or custom network
    Bridge,
}

/// Where the proxy binds and how the builder addresses it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTopology {
    pub mode: NetworkMode,
    /// Address the proxy listens on
    pub bind_host: String,
    /// Address the builder uses in registry references
    pub ref_host: String,
}

impl NetworkTopology {
    /// Topology when builder and proxy share the host network namespace
    pub fn host_shared() -> Self {
        Self {
            mode: NetworkMode::Host,
            bind_host: LOOPBACK.to_string(),
            ref_host: LOOPBACK.to_string(),
        }
    }

    /// Topology for an isolated builder reachable via a gateway address
    pub fn bridged(gateway: impl Into<String>) -> Self {
        Self {
            mode: NetworkMode::Bridge,
            bind_host: ALL_INTERFACES.to_string(),
            ref_host: gateway.into(),
        }
    }
}

/// The container buildx creates for a named docker-container builder
pub fn buildx_container_name(builder: &str) -> String {
    format!("buildx_buildkit_{}0", builder)
}

/// Classified output of `docker inspect -f {{.HostConfig.NetworkMode}}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectedNetwork {
    Host,
    Network(String),
    Unknown,
}

/// Classify the raw network-mode string from container inspection.
pub fn classify_network_mode(raw: &str) -> InspectedNetwork {
    let trimmed = raw.trim();
    match trimmed {
        "" | "<no value>" => InspectedNetwork::Unknown,
        "host" => InspectedNetwork::Host,
        name => InspectedNetwork::Network(name.to_string()),
    }
}

/// Extract a gateway address from `docker network inspect` output.
///
/// Returns `None` for empty output or Go-template misses.
pub fn parse_gateway(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "<no value>" {
        return None;
    }
    Some(trimmed.to_string())
}

/// Resolves builder network topology via the container runtime CLI
pub struct TopologyResolver {
    bin: String,
}

impl Default for TopologyResolver {
    fn default() -> Self {
        Self {
            bin: "docker".to_string(),
        }
    }
}

impl TopologyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the runtime binary. Used by tests to exercise the
    /// warn-and-default failure path without docker installed.
    pub fn with_bin(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Resolve the topology for a builder's container.
    ///
    /// `driver` is the buildx driver in use; the `docker` driver runs
    /// builds in the daemon itself, so there is no container to inspect and
    /// loopback is assumed.
    pub async fn resolve(&self, builder: &str, driver: &str) -> NetworkTopology {
        if driver == "docker" {
            debug!("Builder driver is in-process; assuming loopback topology");
            return NetworkTopology::host_shared();
        }

        let container = buildx_container_name(builder);
        let raw = match self
            .docker_output(&["inspect", "-f", "{{.HostConfig.NetworkMode}}", &container])
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!("Failed to inspect builder container {}: {}", container, e);
                return NetworkTopology::bridged(DEFAULT_BRIDGE_GATEWAY);
            }
        };

        match classify_network_mode(&raw) {
            InspectedNetwork::Host => {
                debug!("Builder {} uses host networking", builder);
                NetworkTopology::host_shared()
            }
            InspectedNetwork::Network(network) => {
                let gateway = self.resolve_gateway(&network).await;
                debug!("Builder {} on network {} via gateway {}", builder, network, gateway);
                NetworkTopology::bridged(gateway)
            }
            InspectedNetwork::Unknown => {
                warn!(
                    "Builder container {} reported no network mode; assuming bridge",
                    container
                );
                NetworkTopology::bridged(DEFAULT_BRIDGE_GATEWAY)
            }
        }
    }

    /// Look up the gateway of a named docker network, defaulting on failure.
    async fn resolve_gateway(&self, network: &str) -> String {
        let result = self
            .docker_output(&[
                "network",
                "inspect",
                "-f",
                "{{(index .IPAM.Config 0).Gateway}}",
                network,
            ])
            .await;

        match result {
            Ok(out) => parse_gateway(&out).unwrap_or_else(|| {
                warn!("Network {} has no gateway; using default", network);
                DEFAULT_BRIDGE_GATEWAY.to_string()
            }),
            Err(e) => {
                warn!("Failed to inspect network {}: {}", network, e);
                DEFAULT_BRIDGE_GATEWAY.to_string()
            }
        }
    }

    /// Run a runtime command and return trimmed stdout, erroring on failure.
    async fn docker_output(&self, args: &[&str]) -> KilnResult<String> {
        debug!("Executing: {} {:?}", self.bin, args);

        let output = Command::new(&self.bin)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KilnError::command_failed(format!("{} {:?}", self.bin, args), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KilnError::command_exec(
                format!("{} {:?}", self.bin, args),
                stderr.to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- classify_network_mode tests ----

    #[test]
    fn classify_host() {
        assert_eq!(classify_network_mode("host"), InspectedNetwork::Host);
        assert_eq!(classify_network_mode("host\n"), InspectedNetwork::Host);
    }

    #[test]
    fn classify_named_network() {
        assert_eq!(
            classify_network_mode("bridge"),
            InspectedNetwork::Network("bridge".to_string())
        );
        assert_eq!(
            classify_network_mode("my-custom-net\n"),
            InspectedNetwork::Network("my-custom-net".to_string())
        );
    }

    #[test]
    fn classify_empty_is_unknown() {
        assert_eq!(classify_network_mode(""), InspectedNetwork::Unknown);
        assert_eq!(classify_network_mode("  \n"), InspectedNetwork::Unknown);
        assert_eq!(classify_network_mode("<no value>"), InspectedNetwork::Unknown);
    }

    // ---- parse_gateway tests ----

    #[test]
    fn gateway_parsed() {
        assert_eq!(parse_gateway("172.17.0.1\n"), Some("172.17.0.1".to_string()));
        assert_eq!(parse_gateway("172.18.0.1"), Some("172.18.0.1".to_string()));
    }

    #[test]
    fn gateway_empty_rejected() {
        assert_eq!(parse_gateway(""), None);
        assert_eq!(parse_gateway("  "), None);
        assert_eq!(parse_gateway("<no value>"), None);
    }

    // ---- topology constructors ----

    #[test]
    fn host_shared_uses_loopback_for_both() {
        let t = NetworkTopology::host_shared();
        assert_eq!(t.mode, NetworkMode::Host);
        assert_eq!(t.bind_host, LOOPBACK);
        assert_eq!(t.ref_host, LOOPBACK);
    }

    #[test]
    fn bridged_binds_all_interfaces() {
        let t = NetworkTopology::bridged("172.17.0.5");
        assert_eq!(t.mode, NetworkMode::Bridge);
        assert_eq!(t.bind_host, ALL_INTERFACES);
        assert_eq!(t.ref_host, "172.17.0.5");
    }

    // ---- builder container naming ----

    #[test]
    fn buildx_container_naming() {
        assert_eq!(buildx_container_name("kiln-builder"), "buildx_buildkit_kiln-builder0");
    }

    // ---- resolve edge cases ----

    #[tokio::test]
    async fn docker_driver_skips_inspection() {
        let t = TopologyResolver::new().resolve("anything", "docker").await;
        assert_eq!(t, NetworkTopology::host_shared());
    }

    #[tokio::test]
    async fn failing_inspection_falls_back_to_bridge_default() {
        // `false` exits nonzero for any argv, standing in for a runtime
        // that cannot inspect the container.
        let resolver = TopologyResolver::with_bin("false");
        let t = resolver.resolve("kiln-builder", "docker-container").await;
        assert_eq!(t, NetworkTopology::bridged(DEFAULT_BRIDGE_GATEWAY));
    }

    #[tokio::test]
    async fn missing_runtime_binary_falls_back_to_bridge_default() {
        let resolver = TopologyResolver::with_bin("/nonexistent/kiln-docker");
        let t = resolver.resolve("kiln-builder", "docker-container").await;
        assert_eq!(t, NetworkTopology::bridged(DEFAULT_BRIDGE_GATEWAY));
    }

    #[tokio::test]
    async fn gateway_lookup_failure_uses_default_gateway() {
        let resolver = TopologyResolver::with_bin("false");
        let gw = resolver.resolve_gateway("some-net").await;
        assert_eq!(gw, DEFAULT_BRIDGE_GATEWAY);
    }
}

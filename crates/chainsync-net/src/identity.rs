//! Node identity: who this process is, and which addresses reach it.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{info, warn};

use chainsync_core::Environment;

use crate::error::Result;

/// What a node is allowed to do in the cluster. Empty means receive-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub u8);

impl Capabilities {
    /// May build outbound transactions from local writes.
    pub const ASSEMBLE: Capabilities = Capabilities(1);
    /// May transmit transactions to peers.
    pub const SUBMIT: Capabilities = Capabilities(2);

    pub fn with(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub fn can_assemble(self) -> bool {
        self.0 & Self::ASSEMBLE.0 != 0
    }

    pub fn can_submit(self) -> bool {
        self.0 & Self::SUBMIT.0 != 0
    }

    pub fn is_receive_only(self) -> bool {
        self.0 == 0
    }
}

/// A cluster member as recorded in the node directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub server_id: String,
    pub host_name: String,
    pub capabilities: Capabilities,
    pub port: u16,
    pub version: String,
    pub public_key: Vec<u8>,
    pub environment: Environment,
    pub public_address: Option<IpAddr>,
    pub local_address: Option<IpAddr>,
    /// Members are never hard-deleted while part of the cluster; retirement
    /// is a flag.
    pub retired: bool,
}

impl NetworkNode {
    fn receive_only(server_id: &str, host_name: &str, port: u16, environment: Environment) -> Self {
        Self {
            server_id: server_id.to_string(),
            host_name: host_name.to_string(),
            capabilities: Capabilities::default(),
            port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            public_key: Vec::new(),
            environment,
            public_address: None,
            local_address: None,
            retired: false,
        }
    }
}

/// In-memory registry of cluster members, keyed by host name.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: HashMap<String, NetworkNode>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node: NetworkNode) {
        self.nodes.insert(node.host_name.clone(), node);
    }

    pub fn get(&self, host_name: &str) -> Option<&NetworkNode> {
        self.nodes.get(host_name)
    }

    pub fn update(&mut self, node: NetworkNode) {
        self.nodes.insert(node.host_name.clone(), node);
    }

    /// Soft-retire a member; the record stays for audit and rejoin.
    pub fn retire(&mut self, host_name: &str) -> bool {
        match self.nodes.get_mut(host_name) {
            Some(node) => {
                node.retired = true;
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &NetworkNode> {
        self.nodes.values().filter(|n| !n.retired)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Find the record matching this process's host name, registering a
    /// fresh receive-only record when none exists.
    pub fn resolve_self(
        &mut self,
        server_id: &str,
        host_name: &str,
        port: u16,
        environment: Environment,
    ) -> NetworkNode {
        if let Some(existing) = self.nodes.get(host_name) {
            if !existing.retired {
                return existing.clone();
            }
        }
        let node = NetworkNode::receive_only(server_id, host_name, port, environment);
        info!(host_name, server_id, "registering new self node");
        self.register(node.clone());
        node
    }
}

/// Addresses discovered for this process. Immutable once discovery
/// completes; the orchestrator caches it for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    pub local: Vec<IpAddr>,
    pub public: Vec<IpAddr>,
}

impl IpSet {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.public.is_empty()
    }
}

/// Enumerate the addresses that reach this process.
///
/// The routable local address comes from the kernel's route choice for an
/// outbound datagram (nothing is actually sent); further addresses come
/// from resolving the host name. Finding nothing is not fatal: the node
/// starts receive-only until an operator configures addresses.
pub async fn discover_ips(host_name: &str) -> IpSet {
    let mut set = IpSet::default();

    match route_probe().await {
        Ok(addr) if !addr.is_loopback() => set.local.push(addr),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "route probe found no local address"),
    }

    if !host_name.is_empty() {
        match lookup_host((host_name, 0u16)).await {
            Ok(addrs) => {
                for addr in addrs {
                    let ip = addr.ip();
                    if set.local.contains(&ip) || set.public.contains(&ip) {
                        continue;
                    }
                    // Loopback counts as a local address: single-host
                    // clusters are real deployments.
                    if ip.is_loopback() {
                        set.local.push(ip);
                    } else {
                        set.public.push(ip);
                    }
                }
            }
            Err(e) => warn!(host_name, error = %e, "host name did not resolve"),
        }
    }

    if set.is_empty() {
        warn!("no reachable addresses discovered; node will run receive-only");
    } else {
        info!(local = ?set.local, public = ?set.public, "discovered addresses");
    }
    set
}

async fn route_probe() -> Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(("8.8.8.8", 53)).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_flags() {
        let caps = Capabilities::ASSEMBLE.with(Capabilities::SUBMIT);
        assert!(caps.can_assemble());
        assert!(caps.can_submit());
        assert!(!caps.is_receive_only());
        assert!(Capabilities::default().is_receive_only());
        assert!(!Capabilities::ASSEMBLE.can_submit());
    }

    #[test]
    fn resolve_self_registers_when_absent() {
        let mut dir = NodeDirectory::new();
        let node = dir.resolve_self("node-a", "web01", 12020, Environment::Dev);
        assert_eq!(node.host_name, "web01");
        assert!(node.capabilities.is_receive_only());
        assert_eq!(dir.len(), 1);

        // Second resolve finds the same record.
        let again = dir.resolve_self("ignored", "web01", 1, Environment::Prod);
        assert_eq!(again.server_id, "node-a");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn resolve_self_matches_existing_record() {
        let mut dir = NodeDirectory::new();
        let mut node = NetworkNode::receive_only("node-b", "db02", 12020, Environment::Prod);
        node.capabilities = Capabilities::ASSEMBLE.with(Capabilities::SUBMIT);
        dir.register(node);

        let resolved = dir.resolve_self("other", "db02", 12020, Environment::Prod);
        assert_eq!(resolved.server_id, "node-b");
        assert!(resolved.capabilities.can_submit());
    }

    #[test]
    fn retire_is_soft() {
        let mut dir = NodeDirectory::new();
        dir.register(NetworkNode::receive_only(
            "node-a",
            "web01",
            12020,
            Environment::Dev,
        ));
        assert!(dir.retire("web01"));
        assert_eq!(dir.len(), 1, "record must survive retirement");
        assert_eq!(dir.active().count(), 0);
        // A retired host resolving itself re-registers fresh.
        let node = dir.resolve_self("node-a2", "web01", 12020, Environment::Dev);
        assert!(!node.retired);
        assert_eq!(node.server_id, "node-a2");
    }

    #[test]
    fn capabilities_serde_is_transparent() {
        let caps = Capabilities::ASSEMBLE.with(Capabilities::SUBMIT);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, "3");
        let back: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }

    #[tokio::test]
    async fn discover_ips_never_fails() {
        // Works even on machines with no network; empty just means
        // receive-only.
        let _ = discover_ips("").await;
    }
}

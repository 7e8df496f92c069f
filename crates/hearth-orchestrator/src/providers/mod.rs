// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External provider interfaces.
//!
//! Every call the pipeline and the reconcilers make to the outside world goes
//! through one of these traits: the compute API that hands out nodes, the DNS
//! API, the game panel, and the remote installer that runs commands on nodes.
//! Real HTTP clients live outside this crate; [`mock`] has in-memory versions.

pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hearth_core::context::NodeClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Errors from provider calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The referenced resource does not exist.
    #[error("{provider}: {resource} '{id}' not found")]
    NotFound {
        /// Provider name.
        provider: &'static str,
        /// Resource kind.
        resource: &'static str,
        /// Requested id.
        id: String,
    },

    /// The provider refused the request (validation, quota, conflict).
    #[error("{provider} rejected request: {message}")]
    Rejected {
        /// Provider name.
        provider: &'static str,
        /// Provider message.
        message: String,
    },

    /// Network failure, rate limit or server error.
    #[error("{provider} unavailable: {message}")]
    Unavailable {
        /// Provider name.
        provider: &'static str,
        /// Provider message.
        message: String,
    },

    /// A resource did not reach the expected state in time.
    #[error("{provider}: timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// Provider name.
        provider: &'static str,
        /// What was awaited.
        what: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Other error.
    #[error("{provider}: {message}")]
    Other {
        /// Provider name.
        provider: &'static str,
        /// Error details.
        message: String,
    },
}

impl ProviderError {
    /// Whether the error means the resource is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for provider calls.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Treat a not-found delete as success.
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

// ============================================================================
// Compute
// ============================================================================

/// Lifecycle of a compute node as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Being set up.
    Provisioning,
    /// Booted and reachable.
    Running,
    /// Powered off.
    Stopped,
}

/// A compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeNode {
    /// Provider id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Hardware class.
    pub class: NodeClass,
    /// Current state.
    pub state: NodeState,
    /// Public IPv4 once assigned.
    pub ipv4: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    /// Unique name.
    pub name: String,
    /// Hardware class.
    pub class: NodeClass,
    /// Provider region.
    pub region: String,
    /// Provider size class.
    pub size_class: String,
    /// OS image.
    pub image: String,
}

/// Cloud and bare-metal compute API.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Look a node up by its unique name.
    async fn find_node_by_name(&self, name: &str) -> Result<Option<ComputeNode>>;

    /// Order a node.
    async fn create_node(&self, request: &NodeRequest) -> Result<ComputeNode>;

    /// Fetch a node by id.
    async fn get_node(&self, id: &str) -> Result<ComputeNode>;

    /// Release a node.
    async fn delete_node(&self, id: &str) -> Result<()>;

    /// Every node in the account.
    async fn list_nodes(&self) -> Result<Vec<ComputeNode>>;
}

/// Poll a node until it reaches `target`, giving up after `timeout`.
pub async fn wait_for_node_state(
    compute: &dyn ComputeProvider,
    id: &str,
    target: NodeState,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<ComputeNode> {
    let started = Instant::now();
    loop {
        let node = compute.get_node(id).await?;
        if node.state == target {
            return Ok(node);
        }
        if started.elapsed() >= timeout {
            return Err(ProviderError::Timeout {
                provider: "compute",
                what: format!("node {} to reach {:?} (last {:?})", id, target, node.state),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

// ============================================================================
// DNS
// ============================================================================

/// DNS record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// IPv4 address record.
    A,
    /// Alias record.
    Cname,
}

/// A DNS record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Provider id.
    pub id: String,
    /// Zone the record lives in.
    pub zone: String,
    /// Record name relative to the zone.
    pub name: String,
    /// Record type.
    pub kind: RecordKind,
    /// Address or target.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// DNS API.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Look a record up by name and type.
    async fn find_record(&self, zone: &str, name: &str, kind: RecordKind)
    -> Result<Option<DnsRecord>>;

    /// Create a record.
    async fn create_record(
        &self,
        zone: &str,
        name: &str,
        kind: RecordKind,
        content: &str,
    ) -> Result<DnsRecord>;

    /// Delete a record by id.
    async fn delete_record(&self, zone: &str, id: &str) -> Result<()>;

    /// Every record of one type in a zone.
    async fn list_records(&self, zone: &str, kind: RecordKind) -> Result<Vec<DnsRecord>>;

    /// Every zone the account manages.
    async fn list_zones(&self) -> Result<Vec<String>>;
}

// ============================================================================
// Panel
// ============================================================================

/// A node registered in the game panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelNode {
    /// Panel id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Hostname the daemon is reachable at.
    pub fqdn: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Daemon configuration the panel issues for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Panel node id.
    pub node_id: String,
    /// Panel base URL the daemon reports to.
    pub panel_url: String,
    /// Daemon authentication token.
    pub token: String,
}

/// A game server in the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelServer {
    /// Panel id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Node the server runs on.
    pub node_id: String,
    /// Port allocation it listens on.
    pub allocation_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a panel server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    /// Unique name.
    pub name: String,
    /// Target node.
    pub node_id: String,
    /// Port allocation.
    pub allocation_id: String,
    /// Game template.
    pub egg_id: i64,
    /// Memory limit.
    pub memory_mb: i64,
    /// Disk limit.
    pub disk_mb: i64,
    /// CPU limit in percent.
    pub cpu_limit: i64,
}

/// Power signal for a panel server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Start the server.
    Start,
    /// Stop the server.
    Stop,
}

/// Game panel API.
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Look a node up by its unique name.
    async fn find_node_by_name(&self, name: &str) -> Result<Option<PanelNode>>;

    /// Register a node.
    async fn create_node(&self, name: &str, fqdn: &str) -> Result<PanelNode>;

    /// Daemon configuration for a node.
    async fn get_node_config(&self, node_id: &str) -> Result<NodeConfig>;

    /// Remove a node.
    async fn delete_node(&self, node_id: &str) -> Result<()>;

    /// Every node in the panel.
    async fn list_nodes(&self) -> Result<Vec<PanelNode>>;

    /// Find the allocation for `ip:port` on a node.
    async fn find_allocation(&self, node_id: &str, ip: &str, port: u16) -> Result<Option<String>>;

    /// Create an allocation for `ip:port` on a node.
    async fn create_allocation(&self, node_id: &str, ip: &str, port: u16) -> Result<String>;

    /// Remove an allocation from a node.
    async fn delete_allocation(&self, node_id: &str, allocation_id: &str) -> Result<()>;

    /// Look a server up by its unique name.
    async fn find_server_by_name(&self, name: &str) -> Result<Option<PanelServer>>;

    /// Create a server.
    async fn create_server(&self, request: &ServerRequest) -> Result<PanelServer>;

    /// Send a power signal.
    async fn set_power_state(&self, server_id: &str, state: PowerState) -> Result<()>;

    /// Remove a server.
    async fn delete_server(&self, server_id: &str) -> Result<()>;

    /// Every server in the panel.
    async fn list_servers(&self) -> Result<Vec<PanelServer>>;
}

// ============================================================================
// Remote installer
// ============================================================================

/// Runs setup commands on compute nodes.
#[async_trait]
pub trait RemoteInstaller: Send + Sync {
    /// Install and configure the panel daemon. Re-running is harmless.
    async fn configure_node(&self, address: &str, config: &NodeConfig) -> Result<()>;

    /// Copy a server's data directory from one node to another.
    async fn transfer_server_data(
        &self,
        from_address: &str,
        from_server_id: &str,
        to_address: &str,
        to_server_id: &str,
    ) -> Result<()>;
}

/// The set of provider clients shared by steps and reconcilers.
#[derive(Clone)]
pub struct Providers {
    /// Compute API.
    pub compute: Arc<dyn ComputeProvider>,
    /// DNS API.
    pub dns: Arc<dyn DnsProvider>,
    /// Game panel API.
    pub panel: Arc<dyn PanelClient>,
    /// Remote installer.
    pub installer: Arc<dyn RemoteInstaller>,
}

impl Providers {
    /// In-memory providers.
    pub fn mock() -> (Self, mock::MockProviders) {
        let mocks = mock::MockProviders::default();
        (mocks.as_providers(), mocks)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockCompute;
    use super::*;

    #[test]
    fn test_ignore_not_found() {
        let gone = ProviderError::NotFound {
            provider: "dns",
            resource: "record",
            id: "r-1".to_string(),
        };
        assert!(ignore_not_found(Err(gone)).is_ok());

        let down = ProviderError::Unavailable {
            provider: "dns",
            message: "503".to_string(),
        };
        assert_eq!(ignore_not_found(Err(down.clone())), Err(down));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_node_state_reaches_target() {
        let compute = MockCompute::default();
        compute.set_boot_polls(3).await;
        let node = compute
            .create_node(&NodeRequest {
                name: "hearth-a-g0".to_string(),
                class: NodeClass::Cloud,
                region: "fsn1".to_string(),
                size_class: "cx32".to_string(),
                image: "debian-12".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(node.state, NodeState::Provisioning);

        let ready = wait_for_node_state(
            &compute,
            &node.id,
            NodeState::Running,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(ready.state, NodeState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_node_state_times_out() {
        let compute = MockCompute::default();
        compute.set_boot_polls(u32::MAX).await;
        let node = compute
            .create_node(&NodeRequest {
                name: "hearth-b-g0".to_string(),
                class: NodeClass::Dedicated,
                region: "fsn1".to_string(),
                size_class: "ax41".to_string(),
                image: "debian-12".to_string(),
            })
            .await
            .unwrap();

        let err = wait_for_node_state(
            &compute,
            &node.id,
            NodeState::Running,
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }
}

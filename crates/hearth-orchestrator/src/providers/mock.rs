// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory providers for testing and local runs.
//!
//! Each mock records how often every operation was called and can be told to
//! fail the next N calls of an operation, which is how crash/retry behaviour
//! is exercised without real APIs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::*;

/// Call counter and fault injector shared by the mocks.
#[derive(Default)]
struct Recorder {
    calls: Mutex<HashMap<&'static str, usize>>,
    faults: Mutex<HashMap<&'static str, Vec<ProviderError>>>,
    next_id: AtomicU64,
}

impl Recorder {
    async fn enter(&self, op: &'static str) -> Result<()> {
        *self.calls.lock().await.entry(op).or_default() += 1;
        let mut faults = self.faults.lock().await;
        match faults.get_mut(op).and_then(|queue| queue.pop()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fail(&self, op: &'static str, error: ProviderError, times: usize) {
        let mut faults = self.faults.lock().await;
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    async fn count(&self, op: &str) -> usize {
        self.calls.lock().await.get(op).copied().unwrap_or(0)
    }

    fn id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

macro_rules! recorder_api {
    ($ty:ty) => {
        impl $ty {
            /// Fail the next `times` calls of `op` with `error`.
            pub async fn fail_next(&self, op: &'static str, error: ProviderError, times: usize) {
                self.recorder.fail(op, error, times).await;
            }

            /// How many times `op` was called.
            pub async fn call_count(&self, op: &str) -> usize {
                self.recorder.count(op).await
            }
        }
    };
}

fn not_found(provider: &'static str, resource: &'static str, id: &str) -> ProviderError {
    ProviderError::NotFound {
        provider,
        resource,
        id: id.to_string(),
    }
}

// ============================================================================
// Compute
// ============================================================================

struct MockNode {
    node: ComputeNode,
    polls_until_running: u32,
}

/// In-memory compute provider.
#[derive(Default)]
pub struct MockCompute {
    recorder: Recorder,
    nodes: Mutex<HashMap<String, MockNode>>,
    boot_polls: Mutex<u32>,
}

recorder_api!(MockCompute);

impl MockCompute {
    /// Number of `get_node` polls a new node needs before it is running.
    pub async fn set_boot_polls(&self, polls: u32) {
        *self.boot_polls.lock().await = polls;
    }

    /// Add a running node directly, bypassing `create_node`.
    pub async fn insert_node(&self, name: &str, created_at: DateTime<Utc>) -> ComputeNode {
        let node = ComputeNode {
            id: self.recorder.id("node"),
            name: name.to_string(),
            class: NodeClass::Cloud,
            state: NodeState::Running,
            ipv4: Some("192.0.2.250".to_string()),
            created_at,
        };
        self.nodes.lock().await.insert(
            node.id.clone(),
            MockNode {
                node: node.clone(),
                polls_until_running: 0,
            },
        );
        node
    }

    /// Ids of every node, sorted.
    pub async fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.nodes.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ComputeProvider for MockCompute {
    async fn find_node_by_name(&self, name: &str) -> Result<Option<ComputeNode>> {
        self.recorder.enter("find_node_by_name").await?;
        let nodes = self.nodes.lock().await;
        Ok(nodes
            .values()
            .find(|n| n.node.name == name)
            .map(|n| n.node.clone()))
    }

    async fn create_node(&self, request: &NodeRequest) -> Result<ComputeNode> {
        self.recorder.enter("create_node").await?;
        let polls = *self.boot_polls.lock().await;
        let mut nodes = self.nodes.lock().await;
        if nodes.values().any(|n| n.node.name == request.name) {
            return Err(ProviderError::Rejected {
                provider: "compute",
                message: format!("name '{}' is already in use", request.name),
            });
        }
        let seq = nodes.len() + 1;
        let node = ComputeNode {
            id: self.recorder.id("node"),
            name: request.name.clone(),
            class: request.class,
            state: if polls == 0 {
                NodeState::Running
            } else {
                NodeState::Provisioning
            },
            ipv4: Some(format!("192.0.2.{}", seq % 250)),
            created_at: Utc::now(),
        };
        nodes.insert(
            node.id.clone(),
            MockNode {
                node: node.clone(),
                polls_until_running: polls,
            },
        );
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> Result<ComputeNode> {
        self.recorder.enter("get_node").await?;
        let mut nodes = self.nodes.lock().await;
        let entry = nodes
            .get_mut(id)
            .ok_or_else(|| not_found("compute", "node", id))?;
        if entry.polls_until_running > 0 {
            entry.polls_until_running -= 1;
        }
        if entry.polls_until_running == 0 && entry.node.state == NodeState::Provisioning {
            entry.node.state = NodeState::Running;
        }
        Ok(entry.node.clone())
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        self.recorder.enter("delete_node").await?;
        self.nodes
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("compute", "node", id))
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>> {
        self.recorder.enter("list_nodes").await?;
        let mut nodes: Vec<_> = self
            .nodes
            .lock()
            .await
            .values()
            .map(|n| n.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}

// ============================================================================
// DNS
// ============================================================================

/// In-memory DNS provider.
#[derive(Default)]
pub struct MockDns {
    recorder: Recorder,
    records: Mutex<HashMap<String, DnsRecord>>,
    zones: Mutex<BTreeSet<String>>,
}

recorder_api!(MockDns);

impl MockDns {
    /// Register an empty zone. Zones holding records are listed anyway.
    pub async fn add_zone(&self, zone: &str) {
        self.zones.lock().await.insert(zone.to_string());
    }

    /// Add a record directly, bypassing `create_record`.
    pub async fn insert_record(
        &self,
        zone: &str,
        name: &str,
        kind: RecordKind,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> DnsRecord {
        let record = DnsRecord {
            id: self.recorder.id("rec"),
            zone: zone.to_string(),
            name: name.to_string(),
            kind,
            content: content.to_string(),
            created_at,
        };
        self.records
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    /// Every record, sorted by id.
    pub async fn records(&self) -> Vec<DnsRecord> {
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

#[async_trait]
impl DnsProvider for MockDns {
    async fn find_record(
        &self,
        zone: &str,
        name: &str,
        kind: RecordKind,
    ) -> Result<Option<DnsRecord>> {
        self.recorder.enter("find_record").await?;
        let records = self.records.lock().await;
        Ok(records
            .values()
            .find(|r| r.zone == zone && r.name == name && r.kind == kind)
            .cloned())
    }

    async fn create_record(
        &self,
        zone: &str,
        name: &str,
        kind: RecordKind,
        content: &str,
    ) -> Result<DnsRecord> {
        self.recorder.enter("create_record").await?;
        Ok(self
            .insert_record(zone, name, kind, content, Utc::now())
            .await)
    }

    async fn delete_record(&self, zone: &str, id: &str) -> Result<()> {
        self.recorder.enter("delete_record").await?;
        let mut records = self.records.lock().await;
        match records.get(id) {
            Some(r) if r.zone == zone => {
                records.remove(id);
                Ok(())
            }
            _ => Err(not_found("dns", "record", id)),
        }
    }

    async fn list_records(&self, zone: &str, kind: RecordKind) -> Result<Vec<DnsRecord>> {
        self.recorder.enter("list_records").await?;
        let mut records: Vec<_> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.zone == zone && r.kind == kind)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn list_zones(&self) -> Result<Vec<String>> {
        self.recorder.enter("list_zones").await?;
        let mut zones = self.zones.lock().await.clone();
        zones.extend(self.records.lock().await.values().map(|r| r.zone.clone()));
        Ok(zones.into_iter().collect())
    }
}

// ============================================================================
// Panel
// ============================================================================

#[derive(Debug, Clone)]
struct MockAllocation {
    node_id: String,
    ip: String,
    port: u16,
}

/// In-memory game panel.
#[derive(Default)]
pub struct MockPanel {
    recorder: Recorder,
    nodes: Mutex<HashMap<String, PanelNode>>,
    allocations: Mutex<HashMap<String, MockAllocation>>,
    servers: Mutex<HashMap<String, PanelServer>>,
    power: Mutex<HashMap<String, PowerState>>,
}

recorder_api!(MockPanel);

impl MockPanel {
    /// Add a node directly, bypassing `create_node`.
    pub async fn insert_node(&self, name: &str, created_at: DateTime<Utc>) -> PanelNode {
        let node = PanelNode {
            id: self.recorder.id("pnode"),
            name: name.to_string(),
            fqdn: format!("{}.example.test", name),
            created_at,
        };
        self.nodes.lock().await.insert(node.id.clone(), node.clone());
        node
    }

    /// Add a server directly, bypassing `create_server`.
    pub async fn insert_server(
        &self,
        name: &str,
        node_id: &str,
        created_at: DateTime<Utc>,
    ) -> PanelServer {
        let server = PanelServer {
            id: self.recorder.id("srv"),
            name: name.to_string(),
            node_id: node_id.to_string(),
            allocation_id: String::new(),
            created_at,
        };
        self.servers
            .lock()
            .await
            .insert(server.id.clone(), server.clone());
        server
    }

    /// Last power signal sent to a server.
    pub async fn power_state(&self, server_id: &str) -> Option<PowerState> {
        self.power.lock().await.get(server_id).copied()
    }

    /// Ids of every node, sorted.
    pub async fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.nodes.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of every server, sorted.
    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.servers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of allocations.
    pub async fn allocation_count(&self) -> usize {
        self.allocations.lock().await.len()
    }
}

#[async_trait]
impl PanelClient for MockPanel {
    async fn find_node_by_name(&self, name: &str) -> Result<Option<PanelNode>> {
        self.recorder.enter("find_node_by_name").await?;
        let nodes = self.nodes.lock().await;
        Ok(nodes.values().find(|n| n.name == name).cloned())
    }

    async fn create_node(&self, name: &str, fqdn: &str) -> Result<PanelNode> {
        self.recorder.enter("create_node").await?;
        let node = PanelNode {
            id: self.recorder.id("pnode"),
            name: name.to_string(),
            fqdn: fqdn.to_string(),
            created_at: Utc::now(),
        };
        self.nodes.lock().await.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn get_node_config(&self, node_id: &str) -> Result<NodeConfig> {
        self.recorder.enter("get_node_config").await?;
        if !self.nodes.lock().await.contains_key(node_id) {
            return Err(not_found("panel", "node", node_id));
        }
        Ok(NodeConfig {
            node_id: node_id.to_string(),
            panel_url: "https://panel.example.test".to_string(),
            token: format!("token-{}", node_id),
        })
    }

    async fn delete_node(&self, node_id: &str) -> Result<()> {
        self.recorder.enter("delete_node").await?;
        let removed = self.nodes.lock().await.remove(node_id);
        if removed.is_none() {
            return Err(not_found("panel", "node", node_id));
        }
        self.allocations
            .lock()
            .await
            .retain(|_, a| a.node_id != node_id);
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<PanelNode>> {
        self.recorder.enter("list_nodes").await?;
        let mut nodes: Vec<_> = self.nodes.lock().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn find_allocation(&self, node_id: &str, ip: &str, port: u16) -> Result<Option<String>> {
        self.recorder.enter("find_allocation").await?;
        let allocations = self.allocations.lock().await;
        Ok(allocations
            .iter()
            .find(|(_, a)| a.node_id == node_id && a.ip == ip && a.port == port)
            .map(|(id, _)| id.clone()))
    }

    async fn create_allocation(&self, node_id: &str, ip: &str, port: u16) -> Result<String> {
        self.recorder.enter("create_allocation").await?;
        if !self.nodes.lock().await.contains_key(node_id) {
            return Err(not_found("panel", "node", node_id));
        }
        let id = self.recorder.id("alloc");
        self.allocations.lock().await.insert(
            id.clone(),
            MockAllocation {
                node_id: node_id.to_string(),
                ip: ip.to_string(),
                port,
            },
        );
        Ok(id)
    }

    async fn delete_allocation(&self, node_id: &str, allocation_id: &str) -> Result<()> {
        self.recorder.enter("delete_allocation").await?;
        let mut allocations = self.allocations.lock().await;
        match allocations.get(allocation_id) {
            Some(a) if a.node_id == node_id => {
                allocations.remove(allocation_id);
                Ok(())
            }
            _ => Err(not_found("panel", "allocation", allocation_id)),
        }
    }

    async fn find_server_by_name(&self, name: &str) -> Result<Option<PanelServer>> {
        self.recorder.enter("find_server_by_name").await?;
        let servers = self.servers.lock().await;
        Ok(servers.values().find(|s| s.name == name).cloned())
    }

    async fn create_server(&self, request: &ServerRequest) -> Result<PanelServer> {
        self.recorder.enter("create_server").await?;
        let server = PanelServer {
            id: self.recorder.id("srv"),
            name: request.name.clone(),
            node_id: request.node_id.clone(),
            allocation_id: request.allocation_id.clone(),
            created_at: Utc::now(),
        };
        self.servers
            .lock()
            .await
            .insert(server.id.clone(), server.clone());
        Ok(server)
    }

    async fn set_power_state(&self, server_id: &str, state: PowerState) -> Result<()> {
        self.recorder.enter("set_power_state").await?;
        if !self.servers.lock().await.contains_key(server_id) {
            return Err(not_found("panel", "server", server_id));
        }
        self.power.lock().await.insert(server_id.to_string(), state);
        Ok(())
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        self.recorder.enter("delete_server").await?;
        self.power.lock().await.remove(server_id);
        self.servers
            .lock()
            .await
            .remove(server_id)
            .map(|_| ())
            .ok_or_else(|| not_found("panel", "server", server_id))
    }

    async fn list_servers(&self) -> Result<Vec<PanelServer>> {
        self.recorder.enter("list_servers").await?;
        let mut servers: Vec<_> = self.servers.lock().await.values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }
}

// ============================================================================
// Installer
// ============================================================================

/// Installer that records what it was asked to do.
#[derive(Default)]
pub struct MockInstaller {
    recorder: Recorder,
    configured: Mutex<Vec<String>>,
    transfers: Mutex<Vec<(String, String)>>,
}

recorder_api!(MockInstaller);

impl MockInstaller {
    /// Addresses configured so far, in call order.
    pub async fn configured(&self) -> Vec<String> {
        self.configured.lock().await.clone()
    }

    /// `(from_server_id, to_server_id)` pairs transferred so far.
    pub async fn transfers(&self) -> Vec<(String, String)> {
        self.transfers.lock().await.clone()
    }
}

#[async_trait]
impl RemoteInstaller for MockInstaller {
    async fn configure_node(&self, address: &str, _config: &NodeConfig) -> Result<()> {
        self.recorder.enter("configure_node").await?;
        self.configured.lock().await.push(address.to_string());
        Ok(())
    }

    async fn transfer_server_data(
        &self,
        _from_address: &str,
        from_server_id: &str,
        _to_address: &str,
        to_server_id: &str,
    ) -> Result<()> {
        self.recorder.enter("transfer_server_data").await?;
        self.transfers
            .lock()
            .await
            .push((from_server_id.to_string(), to_server_id.to_string()));
        Ok(())
    }
}

/// Handles to every mock so tests can inspect them after wiring.
#[derive(Clone, Default)]
pub struct MockProviders {
    /// Compute mock.
    pub compute: Arc<MockCompute>,
    /// DNS mock.
    pub dns: Arc<MockDns>,
    /// Panel mock.
    pub panel: Arc<MockPanel>,
    /// Installer mock.
    pub installer: Arc<MockInstaller>,
}

impl MockProviders {
    /// Trait-object view of the mocks.
    pub fn as_providers(&self) -> Providers {
        Providers {
            compute: self.compute.clone(),
            dns: self.dns.clone(),
            panel: self.panel.clone(),
            installer: self.installer.clone(),
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconcilers for each provider resource family.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ProviderResource, ResourceReconciler, ResourceType};
use crate::providers::{ComputeProvider, DnsProvider, PanelClient, ProviderError, RecordKind};

/// Compute nodes.
pub struct ComputeNodeReconciler {
    compute: Arc<dyn ComputeProvider>,
}

impl ComputeNodeReconciler {
    /// Reconciler over `compute`.
    pub fn new(compute: Arc<dyn ComputeProvider>) -> Self {
        Self { compute }
    }
}

#[async_trait]
impl ResourceReconciler for ComputeNodeReconciler {
    fn resource_type(&self) -> ResourceType {
        ResourceType::ComputeNode
    }

    async fn list_actual(&self) -> Result<Vec<ProviderResource>, ProviderError> {
        Ok(self
            .compute
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| ProviderResource {
                id: n.id,
                name: n.name,
                scope: None,
                created_at: n.created_at,
            })
            .collect())
    }

    async fn delete(&self, resource: &ProviderResource) -> Result<(), ProviderError> {
        self.compute.delete_node(&resource.id).await
    }
}

/// DNS records of one type, across every zone of the account.
///
/// Each listed record carries its zone as the scope, and is deleted there.
pub struct DnsRecordReconciler {
    dns: Arc<dyn DnsProvider>,
    kind: RecordKind,
}

impl DnsRecordReconciler {
    /// Node A records.
    pub fn a_records(dns: Arc<dyn DnsProvider>) -> Self {
        Self {
            dns,
            kind: RecordKind::A,
        }
    }

    /// Customer CNAMEs.
    pub fn cname_records(dns: Arc<dyn DnsProvider>) -> Self {
        Self {
            dns,
            kind: RecordKind::Cname,
        }
    }
}

#[async_trait]
impl ResourceReconciler for DnsRecordReconciler {
    fn resource_type(&self) -> ResourceType {
        match self.kind {
            RecordKind::A => ResourceType::DnsARecord,
            RecordKind::Cname => ResourceType::DnsCnameRecord,
        }
    }

    async fn list_actual(&self) -> Result<Vec<ProviderResource>, ProviderError> {
        let mut resources = Vec::new();
        for zone in self.dns.list_zones().await? {
            let records = self.dns.list_records(&zone, self.kind).await?;
            resources.extend(records.into_iter().map(|r| ProviderResource {
                id: r.id,
                name: r.name,
                scope: Some(r.zone),
                created_at: r.created_at,
            }));
        }
        Ok(resources)
    }

    async fn delete(&self, resource: &ProviderResource) -> Result<(), ProviderError> {
        let Some(zone) = resource.scope.as_deref() else {
            return Err(ProviderError::Rejected {
                provider: "dns",
                message: format!("record '{}' has no zone", resource.id),
            });
        };
        self.dns.delete_record(zone, &resource.id).await
    }
}

/// Panel nodes.
pub struct PanelNodeReconciler {
    panel: Arc<dyn PanelClient>,
}

impl PanelNodeReconciler {
    /// Reconciler over `panel`.
    pub fn new(panel: Arc<dyn PanelClient>) -> Self {
        Self { panel }
    }
}

#[async_trait]
impl ResourceReconciler for PanelNodeReconciler {
    fn resource_type(&self) -> ResourceType {
        ResourceType::PanelNode
    }

    async fn list_actual(&self) -> Result<Vec<ProviderResource>, ProviderError> {
        Ok(self
            .panel
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| ProviderResource {
                id: n.id,
                name: n.name,
                scope: None,
                created_at: n.created_at,
            })
            .collect())
    }

    async fn delete(&self, resource: &ProviderResource) -> Result<(), ProviderError> {
        self.panel.delete_node(&resource.id).await
    }
}

/// Panel servers.
pub struct PanelServerReconciler {
    panel: Arc<dyn PanelClient>,
}

impl PanelServerReconciler {
    /// Reconciler over `panel`.
    pub fn new(panel: Arc<dyn PanelClient>) -> Self {
        Self { panel }
    }
}

#[async_trait]
impl ResourceReconciler for PanelServerReconciler {
    fn resource_type(&self) -> ResourceType {
        ResourceType::PanelServer
    }

    async fn list_actual(&self) -> Result<Vec<ProviderResource>, ProviderError> {
        Ok(self
            .panel
            .list_servers()
            .await?
            .into_iter()
            .map(|s| ProviderResource {
                id: s.id,
                name: s.name,
                scope: None,
                created_at: s.created_at,
            })
            .collect())
    }

    async fn delete(&self, resource: &ProviderResource) -> Result<(), ProviderError> {
        self.panel.delete_server(&resource.id).await
    }
}

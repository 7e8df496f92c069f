// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orphan reconciliation.
//!
//! A reconciler lists what one provider actually holds of a resource type;
//! the engine compares that with every id stored in a provisioning context
//! and deletes the difference. Local records are the source of truth: a
//! resource the provider has but no context tracks is a leak, never a gap to
//! fill. Only managed, sufficiently old resources are candidates, so nothing
//! foreign and nothing a running step is about to record gets deleted.

mod reconcilers;
mod scheduler;

pub use reconcilers::{
    ComputeNodeReconciler, DnsRecordReconciler, PanelNodeReconciler, PanelServerReconciler,
};
pub use scheduler::ReconcileScheduler;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hearth_core::context::ResourceKind;
use hearth_core::error::{CoreError, ParseEnumError};
use hearth_core::persistence::Persistence;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::naming;
use crate::providers::{ProviderError, Providers};

/// Provider resource families that can leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Compute nodes.
    ComputeNode,
    /// Per-node A records.
    DnsARecord,
    /// Customer CNAMEs.
    DnsCnameRecord,
    /// Panel nodes.
    PanelNode,
    /// Panel servers.
    PanelServer,
}

impl ResourceType {
    /// Every resource type, in sweep order.
    pub const ALL: &'static [ResourceType] = &[
        ResourceType::ComputeNode,
        ResourceType::DnsARecord,
        ResourceType::DnsCnameRecord,
        ResourceType::PanelNode,
        ResourceType::PanelServer,
    ];

    /// Job payload form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::ComputeNode => "COMPUTE_NODE",
            ResourceType::DnsARecord => "DNS_A_RECORD",
            ResourceType::DnsCnameRecord => "DNS_CNAME_RECORD",
            ResourceType::PanelNode => "PANEL_NODE",
            ResourceType::PanelServer => "PANEL_SERVER",
        }
    }

    /// Context slot whose ids count as expected.
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            ResourceType::ComputeNode => ResourceKind::Node,
            ResourceType::DnsARecord => ResourceKind::ARecord,
            ResourceType::DnsCnameRecord => ResourceKind::CName,
            ResourceType::PanelNode => ResourceKind::PanelNode,
            ResourceType::PanelServer => ResourceKind::PanelServer,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "resource type",
                value: s.to_string(),
            })
    }
}

/// A resource as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResource {
    /// Stable provider id; matched against stored ids.
    pub id: String,
    /// Provider-side name.
    pub name: String,
    /// Container the resource lives in, such as a DNS zone.
    pub scope: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Provider side of one resource type.
#[async_trait]
pub trait ResourceReconciler: Send + Sync {
    /// Type this reconciler covers.
    fn resource_type(&self) -> ResourceType;

    /// Every resource of this type the provider holds, across all scopes.
    async fn list_actual(&self) -> Result<Vec<ProviderResource>, ProviderError>;

    /// Delete one resource as listed by [`ResourceReconciler::list_actual`].
    async fn delete(&self, resource: &ProviderResource) -> Result<(), ProviderError>;
}

/// Errors that abort a sweep before anything is deleted.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// The provider listing failed.
    #[error("listing {resource_type} failed: {source}")]
    Listing {
        /// Type being swept.
        resource_type: ResourceType,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },

    /// Reading stored contexts failed.
    #[error("loading tracked resources failed: {0}")]
    Persistence(#[from] CoreError),

    /// No reconciler is registered for the type.
    #[error("no reconciler registered for {0}")]
    NotRegistered(ResourceType),
}

/// Configuration for reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Whether sweeps are scheduled.
    pub enabled: bool,
    /// Time between scheduled sweeps.
    pub interval: Duration,
    /// Resources younger than this are never orphans.
    pub grace_period: Duration,
    /// Concurrent deletes per sweep.
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(43200), // twice daily
            grace_period: Duration::from_secs(1800),
            concurrency: 4,
        }
    }
}

impl ReconcileConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEARTH_RECONCILE_ENABLED`: "true" or "1" to enable (default: true)
    /// - `HEARTH_RECONCILE_INTERVAL_SECS`: seconds between sweeps (default: 43200)
    /// - `HEARTH_RECONCILE_GRACE_SECS`: minimum orphan age (default: 1800)
    /// - `HEARTH_RECONCILE_CONCURRENCY`: concurrent deletes (default: 4)
    pub fn from_env() -> Self {
        let enabled = std::env::var("HEARTH_RECONCILE_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        let interval = std::env::var("HEARTH_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(43200);
        let grace = std::env::var("HEARTH_RECONCILE_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1800);
        let concurrency = std::env::var("HEARTH_RECONCILE_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(4);

        Self {
            enabled,
            interval: Duration::from_secs(interval),
            grace_period: Duration::from_secs(grace),
            concurrency,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Type swept.
    pub resource_type: ResourceType,
    /// Resources the provider reported.
    pub actual: usize,
    /// Ids tracked locally.
    pub expected: usize,
    /// Ids judged orphaned.
    pub orphans: Vec<String>,
    /// Orphans deleted (or already gone).
    pub deleted: usize,
    /// Orphans whose delete failed; retried by the next sweep.
    pub failed: usize,
}

/// Compares provider state with stored contexts and deletes leaks.
pub struct ReconcileEngine {
    persistence: Arc<dyn Persistence>,
    reconcilers: HashMap<ResourceType, Arc<dyn ResourceReconciler>>,
    config: ReconcileConfig,
}

impl ReconcileEngine {
    /// Engine without reconcilers.
    pub fn new(persistence: Arc<dyn Persistence>, config: ReconcileConfig) -> Self {
        Self {
            persistence,
            reconcilers: HashMap::new(),
            config,
        }
    }

    /// Engine with a reconciler for every [`ResourceType`].
    pub fn standard(
        persistence: Arc<dyn Persistence>,
        providers: &Providers,
        config: ReconcileConfig,
    ) -> Self {
        Self::new(persistence, config)
            .with_reconciler(Arc::new(ComputeNodeReconciler::new(
                providers.compute.clone(),
            )))
            .with_reconciler(Arc::new(DnsRecordReconciler::a_records(
                providers.dns.clone(),
            )))
            .with_reconciler(Arc::new(DnsRecordReconciler::cname_records(
                providers.dns.clone(),
            )))
            .with_reconciler(Arc::new(PanelNodeReconciler::new(providers.panel.clone())))
            .with_reconciler(Arc::new(PanelServerReconciler::new(
                providers.panel.clone(),
            )))
    }

    /// Add or replace the reconciler for its type.
    pub fn with_reconciler(mut self, reconciler: Arc<dyn ResourceReconciler>) -> Self {
        self.reconcilers
            .insert(reconciler.resource_type(), reconciler);
        self
    }

    /// Sweep one resource type.
    pub async fn reconcile(
        &self,
        resource_type: ResourceType,
    ) -> Result<ReconciliationReport, ReconcileError> {
        let reconciler = self
            .reconcilers
            .get(&resource_type)
            .ok_or(ReconcileError::NotRegistered(resource_type))?;

        let actual = reconciler
            .list_actual()
            .await
            .map_err(|source| ReconcileError::Listing {
                resource_type,
                source,
            })?;
        let expected = self.expected_ids(resource_type.resource_kind()).await?;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.grace_period)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let orphans: Vec<ProviderResource> = actual
            .iter()
            .filter(|r| naming::is_managed(&r.name))
            .filter(|r| !expected.contains(r.id.as_str()))
            .filter(|r| r.created_at <= cutoff)
            .cloned()
            .collect();

        debug!(
            resource_type = %resource_type,
            actual = actual.len(),
            expected = expected.len(),
            orphans = orphans.len(),
            "Reconciliation diff computed"
        );

        let outcomes: Vec<(ProviderResource, Result<(), ProviderError>)> =
            futures::stream::iter(orphans.iter().cloned())
                .map(|resource| async move {
                    let result = reconciler.delete(&resource).await;
                    (resource, result)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

        let mut deleted = 0;
        let mut failed = 0;
        for (resource, result) in outcomes {
            match result {
                Ok(()) => {
                    deleted += 1;
                    info!(
                        resource_type = %resource_type,
                        id = %resource.id,
                        name = %resource.name,
                        "Deleted orphaned resource"
                    );
                }
                Err(e) if e.is_not_found() => deleted += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        resource_type = %resource_type,
                        id = %resource.id,
                        name = %resource.name,
                        error = %e,
                        "Failed to delete orphaned resource"
                    );
                }
            }
        }

        let report = ReconciliationReport {
            resource_type,
            actual: actual.len(),
            expected: expected.len(),
            orphans: orphans.into_iter().map(|r| r.id).collect(),
            deleted,
            failed,
        };
        info!(
            resource_type = %resource_type,
            orphans = report.orphans.len(),
            deleted = report.deleted,
            failed = report.failed,
            "Reconciliation completed"
        );
        Ok(report)
    }

    async fn expected_ids(&self, kind: ResourceKind) -> Result<HashSet<String>, CoreError> {
        let contexts = self.persistence.list_contexts().await?;
        Ok(contexts
            .iter()
            .flat_map(|ctx| [ctx.current().get(kind), ctx.new_resources().get(kind)])
            .flatten()
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hearth_core::context::{NodeClass, ProvisioningContext, ServerSpec, Slot};
    use hearth_core::persistence::SqlitePersistence;
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio::sync::Mutex;

    /// Provider listing with scripted contents and delete failures.
    struct FakeReconciler {
        resources: Vec<ProviderResource>,
        failing: HashSet<String>,
        deleted: Mutex<Vec<String>>,
        list_fails: bool,
    }

    impl FakeReconciler {
        fn new(resources: Vec<ProviderResource>) -> Self {
            Self {
                resources,
                failing: HashSet::new(),
                deleted: Mutex::new(Vec::new()),
                list_fails: false,
            }
        }
    }

    #[async_trait]
    impl ResourceReconciler for FakeReconciler {
        fn resource_type(&self) -> ResourceType {
            ResourceType::ComputeNode
        }

        async fn list_actual(&self) -> Result<Vec<ProviderResource>, ProviderError> {
            if self.list_fails {
                return Err(ProviderError::Unavailable {
                    provider: "compute",
                    message: "503".to_string(),
                });
            }
            Ok(self.resources.clone())
        }

        async fn delete(&self, resource: &ProviderResource) -> Result<(), ProviderError> {
            if self.failing.contains(&resource.id) {
                return Err(ProviderError::Unavailable {
                    provider: "compute",
                    message: "timeout".to_string(),
                });
            }
            self.deleted.lock().await.push(resource.id.clone());
            Ok(())
        }
    }

    fn resource(id: &str, name: &str, age_secs: i64) -> ProviderResource {
        ProviderResource {
            id: id.to_string(),
            name: name.to_string(),
            scope: None,
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    fn spec() -> ServerSpec {
        ServerSpec {
            region: "fsn1".to_string(),
            size_class: "cx32".to_string(),
            node_class: NodeClass::Cloud,
            image: "debian-12".to_string(),
            egg_id: 1,
            memory_mb: 1024,
            disk_mb: 4096,
            cpu_limit: 100,
            game_port: 27015,
        }
    }

    async fn store_tracking(ids: &[(&str, Slot)]) -> Arc<dyn Persistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        hearth_core::migrations::run_sqlite(&pool).await.unwrap();
        let store = SqlitePersistence::new(pool);
        for (n, (id, slot)) in ids.iter().enumerate() {
            let ctx = ProvisioningContext::new(format!("sub-{}", n), spec())
                .with_resource_in(*slot, ResourceKind::Node, *id)
                .unwrap();
            store.save_context(&ctx).await.unwrap();
        }
        Arc::new(store)
    }

    fn engine(store: Arc<dyn Persistence>, fake: Arc<FakeReconciler>) -> ReconcileEngine {
        ReconcileEngine::new(
            store,
            ReconcileConfig {
                grace_period: std::time::Duration::from_secs(600),
                ..Default::default()
            },
        )
        .with_reconciler(fake)
    }

    #[tokio::test]
    async fn test_deletes_exactly_untracked() {
        let store = store_tracking(&[("B", Slot::Current), ("C", Slot::New)]).await;
        let fake = Arc::new(FakeReconciler::new(vec![
            resource("A", "hearth-a-g0", 3600),
            resource("B", "hearth-b-g0", 3600),
            resource("C", "hearth-c-g1", 3600),
        ]));

        let report = engine(store, fake.clone())
            .reconcile(ResourceType::ComputeNode)
            .await
            .unwrap();

        assert_eq!(report.orphans, vec!["A".to_string()]);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.actual, 3);
        assert_eq!(report.expected, 2);
        assert_eq!(*fake.deleted.lock().await, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_nothing_deleted_when_in_sync() {
        let store = store_tracking(&[("A", Slot::Current), ("B", Slot::Current)]).await;
        let fake = Arc::new(FakeReconciler::new(vec![
            resource("A", "hearth-a-g0", 3600),
            resource("B", "hearth-b-g0", 3600),
        ]));

        let report = engine(store, fake.clone())
            .reconcile(ResourceType::ComputeNode)
            .await
            .unwrap();

        assert!(report.orphans.is_empty());
        assert!(fake.deleted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_skips_young_and_foreign_resources() {
        let store = store_tracking(&[]).await;
        let fake = Arc::new(FakeReconciler::new(vec![
            resource("young", "hearth-new-g0", 30),
            resource("foreign", "bastion", 86400),
            resource("old", "hearth-old-g0", 86400),
        ]));

        let report = engine(store, fake.clone())
            .reconcile(ResourceType::ComputeNode)
            .await
            .unwrap();

        assert_eq!(report.orphans, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn test_one_failed_delete_does_not_stop_the_rest() {
        let store = store_tracking(&[]).await;
        let mut fake = FakeReconciler::new(vec![
            resource("X", "hearth-x-g0", 3600),
            resource("Y", "hearth-y-g0", 3600),
            resource("Z", "hearth-z-g0", 3600),
        ]);
        fake.failing.insert("Y".to_string());
        let fake = Arc::new(fake);

        let report = engine(store, fake.clone())
            .reconcile(ResourceType::ComputeNode)
            .await
            .unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 1);
        let mut deleted = fake.deleted.lock().await.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["X".to_string(), "Z".to_string()]);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_sweep() {
        let store = store_tracking(&[]).await;
        let mut fake = FakeReconciler::new(vec![resource("X", "hearth-x-g0", 3600)]);
        fake.list_fails = true;
        let fake = Arc::new(fake);

        let err = engine(store, fake.clone())
            .reconcile(ResourceType::ComputeNode)
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Listing { .. }));
        assert!(fake.deleted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_type() {
        let store = store_tracking(&[]).await;
        let engine = ReconcileEngine::new(store, ReconcileConfig::default());
        let err = engine.reconcile(ResourceType::PanelNode).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotRegistered(ResourceType::PanelNode)));
    }

    #[test]
    fn test_resource_type_round_trips_through_payload() {
        for t in ResourceType::ALL {
            assert_eq!(t.as_str().parse::<ResourceType>().unwrap(), *t);
        }
        assert!("DNS_MX_RECORD".parse::<ResourceType>().is_err());
    }
}

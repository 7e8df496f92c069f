// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS steps: the per-node A record and the customer-facing CNAME.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::context::{ProvisioningContext, ProvisioningMode, ResourceKind, Slot, StepType};
use tracing::info;

use super::{Step, StepSettings, StepTransition, advance, provider_failure, require, teardown};
use crate::error::ProvisioningError;
use crate::naming;
use crate::providers::{DnsRecord, Providers, RecordKind, ignore_not_found};

/// Find a record by name, keep it if it already points at `content`,
/// otherwise replace it.
async fn upsert_record(
    providers: &Providers,
    context: &ProvisioningContext,
    zone: &str,
    name: &str,
    kind: RecordKind,
    content: &str,
) -> Result<DnsRecord, ProvisioningError> {
    let dns = &providers.dns;
    let found = dns
        .find_record(zone, name, kind)
        .await
        .map_err(provider_failure(context, "look up DNS record"))?;
    if let Some(record) = found {
        if record.content == content {
            return Ok(record);
        }
        info!(
            subscription_id = %context.subscription_id(),
            record = %name,
            stale = %record.content,
            wanted = %content,
            "Replacing DNS record with stale content"
        );
        ignore_not_found(dns.delete_record(zone, &record.id).await)
            .map_err(provider_failure(context, "delete stale DNS record"))?;
    }
    dns.create_record(zone, name, kind, content)
        .await
        .map_err(provider_failure(context, "create DNS record"))
}

async fn remove_records(
    providers: &Providers,
    zone: &str,
    context: ProvisioningContext,
    kind: ResourceKind,
) -> Result<ProvisioningContext, ProvisioningError> {
    let dns = &providers.dns;
    teardown(context, kind, "delete DNS record", |_, id| {
        let dns = dns.clone();
        let zone = zone.to_string();
        async move { dns.delete_record(&zone, &id).await }
    })
    .await
}

/// A_RECORD: `<resource name>.<zone>` pointing at the node address.
pub struct ARecordStep {
    providers: Providers,
    settings: Arc<StepSettings>,
}

impl ARecordStep {
    /// A record step.
    pub fn new(providers: Providers, settings: Arc<StepSettings>) -> Self {
        Self {
            providers,
            settings,
        }
    }
}

#[async_trait]
impl Step for ARecordStep {
    fn step_type(&self) -> StepType {
        StepType::ARecord
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let zone = &self.settings.dns_zone;
        if context.mode().is_destroy() {
            let context =
                remove_records(&self.providers, zone, context, ResourceKind::ARecord).await?;
            return advance(context);
        }

        let address = require(&context, StepType::ARecord, ResourceKind::NodeAddress)?;
        let name = naming::resource_name(context.subscription_id(), context.generation());
        let record = upsert_record(
            &self.providers,
            &context,
            zone,
            &name,
            RecordKind::A,
            &address,
        )
        .await?;
        advance(context.with_resource(ResourceKind::ARecord, record.id)?)
    }
}

/// C_NAME_RECORD: the stable customer name, pointed at the node's A record.
///
/// During a migration this is the cutover point: the live CNAME is removed
/// and recreated against the replacement node.
pub struct CNameRecordStep {
    providers: Providers,
    settings: Arc<StepSettings>,
}

impl CNameRecordStep {
    /// CNAME step.
    pub fn new(providers: Providers, settings: Arc<StepSettings>) -> Self {
        Self {
            providers,
            settings,
        }
    }
}

#[async_trait]
impl Step for CNameRecordStep {
    fn step_type(&self) -> StepType {
        StepType::CNameRecord
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let zone = &self.settings.dns_zone;
        if context.mode().is_destroy() {
            let context =
                remove_records(&self.providers, zone, context, ResourceKind::CName).await?;
            return advance(context);
        }

        let mut context = context;
        if context.mode() == ProvisioningMode::MigrateCreate
            && let Some(live) = context.current().c_name_id.clone()
        {
            ignore_not_found(self.providers.dns.delete_record(zone, &live).await)
                .map_err(provider_failure(&context, "delete live CNAME"))?;
            info!(
                subscription_id = %context.subscription_id(),
                record_id = %live,
                "Removed live CNAME for cutover"
            );
            context = context.clear_resource(Slot::Current, ResourceKind::CName);
        }

        let target = format!(
            "{}.{}",
            naming::resource_name(context.subscription_id(), context.generation()),
            zone
        );
        let name = naming::customer_record_name(context.subscription_id());
        let record = upsert_record(
            &self.providers,
            &context,
            zone,
            &name,
            RecordKind::Cname,
            &target,
        )
        .await?;
        advance(context.with_resource(ResourceKind::CName, record.id)?)
    }
}

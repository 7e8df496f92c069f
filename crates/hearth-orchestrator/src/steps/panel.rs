// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Game panel steps: node registration, port allocation, the server itself,
//! data transfer between generations and power control.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::context::{ProvisioningContext, ProvisioningMode, ResourceKind, Slot, StepType};
use hearth_core::state::ProvisioningState;
use tracing::info;

use super::{Step, StepSettings, StepTransition, advance, provider_failure, require, teardown};
use crate::error::ProvisioningError;
use crate::naming;
use crate::providers::{PowerState, Providers, ServerRequest, ignore_not_found};

/// PTERODACTYL_NODE: register the machine with the panel.
pub struct PterodactylNodeStep {
    providers: Providers,
    settings: Arc<StepSettings>,
}

impl PterodactylNodeStep {
    /// Panel node step.
    pub fn new(providers: Providers, settings: Arc<StepSettings>) -> Self {
        Self {
            providers,
            settings,
        }
    }
}

#[async_trait]
impl Step for PterodactylNodeStep {
    fn step_type(&self) -> StepType {
        StepType::PterodactylNode
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let panel = &self.providers.panel;
        if context.mode().is_destroy() {
            let context = teardown(
                context,
                ResourceKind::PanelNode,
                "delete panel node",
                |_, id| {
                    let panel = panel.clone();
                    async move { panel.delete_node(&id).await }
                },
            )
            .await?;
            return advance(context);
        }

        let name = naming::resource_name(context.subscription_id(), context.generation());
        let found = panel
            .find_node_by_name(&name)
            .await
            .map_err(provider_failure(&context, "look up panel node"))?;
        let node = match found {
            Some(node) => node,
            None => {
                let fqdn = format!("{}.{}", name, self.settings.dns_zone);
                panel
                    .create_node(&name, &fqdn)
                    .await
                    .map_err(provider_failure(&context, "create panel node"))?
            }
        };
        advance(context.with_resource(ResourceKind::PanelNode, node.id)?)
    }
}

/// PTERODACTYL_ALLOCATION: reserve the game port on the panel node.
pub struct PterodactylAllocationStep {
    providers: Providers,
}

impl PterodactylAllocationStep {
    /// Allocation step.
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Step for PterodactylAllocationStep {
    fn step_type(&self) -> StepType {
        StepType::PterodactylAllocation
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let panel = &self.providers.panel;
        if context.mode().is_destroy() {
            let current_node = context.current().panel_node_id.clone();
            let new_node = context.new_resources().panel_node_id.clone();
            let context = teardown(
                context,
                ResourceKind::Allocation,
                "delete port allocation",
                |slot, id| {
                    let panel = panel.clone();
                    let owner = match slot {
                        Slot::Current => current_node.clone(),
                        Slot::New => new_node.clone(),
                    };
                    async move {
                        match owner {
                            Some(node_id) => panel.delete_allocation(&node_id, &id).await,
                            // Allocations are dropped together with their node
                            None => Ok(()),
                        }
                    }
                },
            )
            .await?;
            return advance(context);
        }

        let node_id = require(&context, StepType::PterodactylAllocation, ResourceKind::PanelNode)?;
        let address =
            require(&context, StepType::PterodactylAllocation, ResourceKind::NodeAddress)?;
        let port = context.spec().game_port;
        let found = panel
            .find_allocation(&node_id, &address, port)
            .await
            .map_err(provider_failure(&context, "look up port allocation"))?;
        let allocation = match found {
            Some(id) => id,
            None => panel
                .create_allocation(&node_id, &address, port)
                .await
                .map_err(provider_failure(&context, "create port allocation"))?,
        };
        advance(context.with_resource(ResourceKind::Allocation, allocation)?)
    }
}

/// PTERODACTYL_SERVER: the game server on the panel.
pub struct PterodactylServerStep {
    providers: Providers,
}

impl PterodactylServerStep {
    /// Panel server step.
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Step for PterodactylServerStep {
    fn step_type(&self) -> StepType {
        StepType::PterodactylServer
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let panel = &self.providers.panel;
        if context.mode().is_destroy() {
            let mut context = teardown(
                context,
                ResourceKind::PanelServer,
                "delete panel server",
                |_, id| {
                    let panel = panel.clone();
                    async move { panel.delete_server(&id).await }
                },
            )
            .await?;
            if context.mode() == ProvisioningMode::Destroy {
                context = context.with_state(ProvisioningState::ServerRemoved)?;
            }
            return advance(context);
        }

        let node_id = require(&context, StepType::PterodactylServer, ResourceKind::PanelNode)?;
        let allocation_id =
            require(&context, StepType::PterodactylServer, ResourceKind::Allocation)?;
        let name = naming::resource_name(context.subscription_id(), context.generation());
        let found = panel
            .find_server_by_name(&name)
            .await
            .map_err(provider_failure(&context, "look up panel server"))?;
        let server = match found {
            Some(server) => server,
            None => {
                let spec = context.spec();
                let request = ServerRequest {
                    name,
                    node_id,
                    allocation_id,
                    egg_id: spec.egg_id,
                    memory_mb: spec.memory_mb,
                    disk_mb: spec.disk_mb,
                    cpu_limit: spec.cpu_limit,
                };
                panel
                    .create_server(&request)
                    .await
                    .map_err(provider_failure(&context, "create panel server"))?
            }
        };
        advance(context.with_resource(ResourceKind::PanelServer, server.id)?)
    }
}

/// TRANSFER_DATA: stop the live server and copy its data to the replacement.
pub struct TransferDataStep {
    providers: Providers,
}

impl TransferDataStep {
    /// Transfer step.
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }

    fn live(
        context: &ProvisioningContext,
        kind: ResourceKind,
    ) -> Result<String, ProvisioningError> {
        context
            .current()
            .get(kind)
            .map(str::to_string)
            .ok_or_else(|| ProvisioningError::MissingPrerequisite {
                subscription_id: context.subscription_id().to_string(),
                step: StepType::TransferData,
                kind,
            })
    }
}

#[async_trait]
impl Step for TransferDataStep {
    fn step_type(&self) -> StepType {
        StepType::TransferData
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        if context.mode() != ProvisioningMode::MigrateCreate {
            return advance(context);
        }

        let from_server = Self::live(&context, ResourceKind::PanelServer)?;
        let from_address = Self::live(&context, ResourceKind::NodeAddress)?;
        let to_server = require(&context, StepType::TransferData, ResourceKind::PanelServer)?;
        let to_address = require(&context, StepType::TransferData, ResourceKind::NodeAddress)?;

        ignore_not_found(
            self.providers
                .panel
                .set_power_state(&from_server, PowerState::Stop)
                .await,
        )
        .map_err(provider_failure(&context, "stop live server"))?;
        self.providers
            .installer
            .transfer_server_data(&from_address, &from_server, &to_address, &to_server)
            .await
            .map_err(provider_failure(&context, "transfer server data"))?;
        info!(
            subscription_id = %context.subscription_id(),
            from_server = %from_server,
            to_server = %to_server,
            "Server data transferred"
        );
        advance(context)
    }
}

/// START_SERVER: power on. Teardown powers off before anything is deleted.
pub struct StartServerStep {
    providers: Providers,
}

impl StartServerStep {
    /// Power step.
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Step for StartServerStep {
    fn step_type(&self) -> StepType {
        StepType::StartServer
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let panel = &self.providers.panel;
        if context.mode().is_destroy() {
            for (_, server_id) in context.teardown_targets(ResourceKind::PanelServer) {
                ignore_not_found(panel.set_power_state(&server_id, PowerState::Stop).await)
                    .map_err(provider_failure(&context, "stop panel server"))?;
            }
            return advance(context);
        }

        let server_id = require(&context, StepType::StartServer, ResourceKind::PanelServer)?;
        panel
            .set_power_state(&server_id, PowerState::Start)
            .await
            .map_err(provider_failure(&context, "start panel server"))?;
        advance(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProviders;
    use crate::steps::tests::{settings, spec};
    use hearth_core::context::NodeClass;

    fn at_allocation() -> ProvisioningContext {
        ProvisioningContext::new("sub-3", spec(NodeClass::Cloud))
            .transition(StepType::AllocateNode)
            .unwrap()
            .transition(StepType::CloudNode)
            .unwrap()
            .with_resource(ResourceKind::NodeAddress, "192.0.2.5")
            .unwrap()
            .transition(StepType::ARecord)
            .unwrap()
            .transition(StepType::PterodactylNode)
            .unwrap()
    }

    #[tokio::test]
    async fn test_panel_chain_is_idempotent() {
        let mocks = MockProviders::default();
        let providers = mocks.as_providers();
        let node_step = PterodactylNodeStep::new(providers.clone(), Arc::new(settings()));
        let alloc_step = PterodactylAllocationStep::new(providers.clone());
        let server_step = PterodactylServerStep::new(providers.clone());

        let mut last = None;
        for _ in 0..2 {
            let out = node_step.execute(at_allocation()).await.unwrap();
            let ctx = out
                .context
                .transition(out.next)
                .unwrap()
                .transition(StepType::PterodactylAllocation)
                .unwrap();
            let out = alloc_step.execute(ctx).await.unwrap();
            let out = server_step
                .execute(out.context.transition(out.next).unwrap())
                .await
                .unwrap();
            assert_eq!(out.next, StepType::CNameRecord);
            last = Some(out.context);
        }

        assert_eq!(mocks.panel.node_ids().await.len(), 1);
        assert_eq!(mocks.panel.allocation_count().await, 1);
        assert_eq!(mocks.panel.server_ids().await.len(), 1);
        let ctx = last.unwrap();
        assert!(ctx.current().panel_server_id.is_some());
        assert!(ctx.current().allocation_id.is_some());
    }

    #[tokio::test]
    async fn test_start_server_requires_server() {
        let mocks = MockProviders::default();
        let step = StartServerStep::new(mocks.as_providers());
        let ctx = at_allocation();
        let err = step.execute(ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::MissingPrerequisite {
                kind: ResourceKind::PanelServer,
                ..
            }
        ));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute node steps.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::context::{NodeClass, ProvisioningContext, ProvisioningMode, ResourceKind, StepType};
use hearth_core::state::ProvisioningState;
use tracing::info;

use super::{
    Step, StepSettings, StepTransition, advance, node_step_for, provider_failure, require,
    teardown,
};
use crate::error::ProvisioningError;
use crate::naming;
use crate::providers::{NodeRequest, NodeState, ProviderError, Providers, wait_for_node_state};

/// CLOUD_NODE or DEDICATED_NODE: a machine of one hardware class.
pub struct NodeStep {
    class: NodeClass,
    providers: Providers,
    settings: Arc<StepSettings>,
}

impl NodeStep {
    /// Node step for `class`.
    pub fn new(class: NodeClass, providers: Providers, settings: Arc<StepSettings>) -> Self {
        Self {
            class,
            providers,
            settings,
        }
    }

    async fn provision(
        &self,
        context: ProvisioningContext,
    ) -> Result<ProvisioningContext, ProvisioningError> {
        let compute = &self.providers.compute;
        let name = naming::resource_name(context.subscription_id(), context.generation());

        let found = compute
            .find_node_by_name(&name)
            .await
            .map_err(provider_failure(&context, "look up compute node"))?;
        let node = match found {
            Some(node) => {
                info!(
                    subscription_id = %context.subscription_id(),
                    node_id = %node.id,
                    "Adopting existing compute node"
                );
                node
            }
            None => {
                let spec = context.spec();
                let request = NodeRequest {
                    name: name.clone(),
                    class: self.class,
                    region: spec.region.clone(),
                    size_class: spec.size_class.clone(),
                    image: spec.image.clone(),
                };
                compute
                    .create_node(&request)
                    .await
                    .map_err(provider_failure(&context, "create compute node"))?
            }
        };

        // Record the id before waiting so a boot timeout still reports it
        let context = context.with_resource(ResourceKind::Node, &node.id)?;
        let node = if node.state == NodeState::Running {
            node
        } else {
            wait_for_node_state(
                compute.as_ref(),
                &node.id,
                NodeState::Running,
                self.settings.node_ready_timeout,
                self.settings.node_poll_interval,
            )
            .await
            .map_err(provider_failure(&context, "wait for compute node"))?
        };

        let Some(address) = node.ipv4.clone() else {
            return Err(provider_failure(&context, "read compute node address")(
                ProviderError::Other {
                    provider: "compute",
                    message: format!("node {} has no public address", node.id),
                },
            ));
        };
        info!(
            subscription_id = %context.subscription_id(),
            node_id = %node.id,
            address = %address,
            class = %self.class,
            "Compute node running"
        );

        let milestone = match context.mode() {
            ProvisioningMode::MigrateCreate => ProvisioningState::MigrationMetalProvisioned,
            _ => ProvisioningState::MetalProvisioned,
        };
        Ok(context
            .with_resource(ResourceKind::NodeAddress, address)?
            .with_state(milestone)?)
    }

    async fn remove(
        &self,
        context: ProvisioningContext,
    ) -> Result<ProvisioningContext, ProvisioningError> {
        let compute = &self.providers.compute;
        let mut context = teardown(context, ResourceKind::Node, "delete compute node", |_, id| {
            let compute = compute.clone();
            async move { compute.delete_node(&id).await }
        })
        .await?;
        for (slot, _) in context.teardown_targets(ResourceKind::NodeAddress) {
            context = context.clear_resource(slot, ResourceKind::NodeAddress);
        }
        if context.mode() == ProvisioningMode::Destroy {
            context = context.with_state(ProvisioningState::NodeRemoved)?;
        }
        Ok(context)
    }
}

#[async_trait]
impl Step for NodeStep {
    fn step_type(&self) -> StepType {
        node_step_for(self.class)
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let context = if context.mode().is_destroy() {
            self.remove(context).await?
        } else {
            self.provision(context).await?
        };
        advance(context)
    }
}

/// CONFIGURE_NODE: install the panel daemon on the node.
pub struct ConfigureNodeStep {
    providers: Providers,
}

impl ConfigureNodeStep {
    /// Configure step.
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Step for ConfigureNodeStep {
    fn step_type(&self) -> StepType {
        StepType::ConfigureNode
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        if context.mode().is_destroy() {
            // Nothing to undo; the node goes away with its machine
            return advance(context);
        }

        let panel_node = require(&context, StepType::ConfigureNode, ResourceKind::PanelNode)?;
        let address = require(&context, StepType::ConfigureNode, ResourceKind::NodeAddress)?;
        let config = self
            .providers
            .panel
            .get_node_config(&panel_node)
            .await
            .map_err(provider_failure(&context, "fetch panel node configuration"))?;
        self.providers
            .installer
            .configure_node(&address, &config)
            .await
            .map_err(provider_failure(&context, "configure node"))?;

        let milestone = match context.mode() {
            ProvisioningMode::MigrateCreate => ProvisioningState::MigrationNodeProvisioned,
            _ => ProvisioningState::NodeProvisioned,
        };
        advance(context.with_state(milestone)?)
    }
}

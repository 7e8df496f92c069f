// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steps that own no provider resource: the pipeline ends, node allocation
//! and finalisation.

use async_trait::async_trait;
use hearth_core::context::{ProvisioningContext, ProvisioningMode, StepType};
use hearth_core::state::ProvisioningState;
use tracing::info;

use super::{Step, StepTransition, advance};
use crate::error::ProvisioningError;

/// NEW and READY. Both only move the pipeline along.
pub struct BoundaryStep {
    step_type: StepType,
}

impl BoundaryStep {
    /// Boundary step for `step_type`.
    pub fn new(step_type: StepType) -> Self {
        Self { step_type }
    }
}

#[async_trait]
impl Step for BoundaryStep {
    fn step_type(&self) -> StepType {
        self.step_type
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        advance(context)
    }
}

/// ALLOCATE_NODE.
///
/// Going forward it checks the spec can be built before anything is bought.
/// In DESTROY it marks the server shut down; in MIGRATE_DESTROY it promotes
/// the replacement resources into the live slot.
pub struct AllocateNodeStep;

impl AllocateNodeStep {
    fn validate(context: &ProvisioningContext) -> Result<(), ProvisioningError> {
        let spec = context.spec();
        let reason = if spec.region.trim().is_empty() {
            Some("region is empty")
        } else if spec.size_class.trim().is_empty() {
            Some("size class is empty")
        } else if spec.image.trim().is_empty() {
            Some("image is empty")
        } else if spec.memory_mb <= 0 || spec.disk_mb <= 0 || spec.cpu_limit <= 0 {
            Some("memory, disk and cpu limits must be positive")
        } else if spec.game_port == 0 {
            Some("game port must be non-zero")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ProvisioningError::InvalidSpec {
                subscription_id: context.subscription_id().to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Step for AllocateNodeStep {
    fn step_type(&self) -> StepType {
        StepType::AllocateNode
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let context = match context.mode() {
            ProvisioningMode::Create | ProvisioningMode::MigrateCreate => {
                Self::validate(&context)?;
                context
            }
            ProvisioningMode::Destroy => context.with_state(ProvisioningState::Shutdown)?,
            ProvisioningMode::MigrateDestroy => {
                info!(
                    subscription_id = %context.subscription_id(),
                    generation = context.generation(),
                    "Promoting replacement resources"
                );
                context
                    .promote_all_new_resources()
                    .with_state(ProvisioningState::Ready)?
            }
        };
        advance(context)
    }
}

/// FINALISE. Marks the server ready, or ready for cutover during a migration.
pub struct FinaliseStep;

#[async_trait]
impl Step for FinaliseStep {
    fn step_type(&self) -> StepType {
        StepType::Finalise
    }

    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError> {
        let context = match context.mode() {
            ProvisioningMode::Create => context.with_state(ProvisioningState::Ready)?,
            ProvisioningMode::MigrateCreate => {
                context.with_state(ProvisioningState::MigrationCutover)?
            }
            ProvisioningMode::Destroy | ProvisioningMode::MigrateDestroy => context,
        };
        advance(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::tests::spec;
    use hearth_core::context::{NodeClass, ResourceKind};

    #[tokio::test]
    async fn test_allocate_node_rejects_bad_spec() {
        let mut bad = spec(NodeClass::Cloud);
        bad.memory_mb = 0;
        let ctx = ProvisioningContext::new("sub-1", bad)
            .transition(StepType::AllocateNode)
            .unwrap();
        let err = AllocateNodeStep.execute(ctx).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidSpec { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_boundary_step_advances() {
        let ctx = ProvisioningContext::new("sub-1", spec(NodeClass::Cloud));
        let out = BoundaryStep::new(StepType::New).execute(ctx).await.unwrap();
        assert_eq!(out.next, StepType::AllocateNode);
    }

    #[tokio::test]
    async fn test_migrate_destroy_promotes_at_allocate_node() {
        // Build a live server, migrate it, and walk MIGRATE_DESTROY to ALLOCATE_NODE
        let mut ctx = ProvisioningContext::new("sub-1", spec(NodeClass::Cloud))
            .with_resource(ResourceKind::Node, "node-old")
            .unwrap();
        let create_path = [
            StepType::AllocateNode,
            StepType::CloudNode,
            StepType::ARecord,
            StepType::PterodactylNode,
            StepType::ConfigureNode,
            StepType::PterodactylAllocation,
            StepType::PterodactylServer,
            StepType::CNameRecord,
            StepType::StartServer,
            StepType::Finalise,
            StepType::Ready,
        ];
        for step in create_path {
            ctx = ctx.transition(step).unwrap();
        }
        ctx = ctx
            .with_state(ProvisioningState::MetalProvisioned)
            .unwrap()
            .with_state(ProvisioningState::NodeProvisioned)
            .unwrap()
            .with_state(ProvisioningState::Ready)
            .unwrap();
        let mut ctx = ctx.begin_migration(spec(NodeClass::Dedicated)).unwrap();
        ctx = ctx
            .with_resource(ResourceKind::Node, "node-new")
            .unwrap()
            .with_state(ProvisioningState::MigrationMetalProvisioned)
            .unwrap()
            .with_state(ProvisioningState::MigrationNodeProvisioned)
            .unwrap()
            .with_state(ProvisioningState::MigrationCutover)
            .unwrap();
        let migrate_path = [
            StepType::AllocateNode,
            StepType::DedicatedNode,
            StepType::ARecord,
            StepType::PterodactylNode,
            StepType::ConfigureNode,
            StepType::PterodactylAllocation,
            StepType::PterodactylServer,
            StepType::CNameRecord,
            StepType::TransferData,
            StepType::StartServer,
            StepType::Finalise,
            StepType::Ready,
        ];
        for step in migrate_path {
            ctx = ctx.transition(step).unwrap();
        }
        let mut ctx = ctx.begin_migrate_destroy().unwrap();
        let destroy_path = [
            StepType::Finalise,
            StepType::StartServer,
            StepType::CNameRecord,
            StepType::PterodactylServer,
            StepType::PterodactylAllocation,
            StepType::ConfigureNode,
            StepType::PterodactylNode,
            StepType::ARecord,
            StepType::DedicatedNode,
            StepType::AllocateNode,
        ];
        for step in destroy_path {
            ctx = ctx.transition(step).unwrap();
        }

        let out = AllocateNodeStep.execute(ctx).await.unwrap();
        assert_eq!(out.next, StepType::New);
        assert_eq!(out.context.state(), ProvisioningState::Ready);
        assert_eq!(
            out.context.current().get(ResourceKind::Node),
            Some("node-new")
        );
        assert!(out.context.new_resources().is_empty());
    }
}

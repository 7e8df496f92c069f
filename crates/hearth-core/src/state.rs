// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-level provisioning state.
//!
//! Coarser than the per-step context: a handful of milestones a server passes
//! through. Legal moves live in one static adjacency table; anything not
//! listed is rejected.
//!
//! ```text
//!   NEW ─► METAL_PROVISIONED ─► NODE_PROVISIONED ─► READY
//!
//!   PRE_MIGRATION ─► MIGRATION_METAL_PROVISIONED ─► MIGRATION_NODE_PROVISIONED
//!                 ─► MIGRATION_CUTOVER ─► READY
//!
//!   READY ─► PRE_SHUTDOWN ─► SERVER_REMOVED ─► NODE_REMOVED ─► SHUTDOWN
//! ```
//!
//! `NEW`, `PRE_MIGRATION` and `PRE_SHUTDOWN` are also entry states: a pipeline
//! run starts there regardless of where the previous run stopped.

use serde::{Deserialize, Serialize};

use crate::context::ProvisioningMode;

/// Milestones of a server's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// Nothing has been provisioned yet.
    New,
    /// Compute node exists.
    MetalProvisioned,
    /// Panel daemon is configured on the node.
    NodeProvisioned,
    /// Server is live.
    Ready,
    /// A migration has been requested.
    PreMigration,
    /// Replacement compute node exists.
    MigrationMetalProvisioned,
    /// Replacement node is configured.
    MigrationNodeProvisioned,
    /// Replacement server is live; old resources still exist.
    MigrationCutover,
    /// Teardown has been requested.
    PreShutdown,
    /// Panel server is gone.
    ServerRemoved,
    /// Compute node is gone.
    NodeRemoved,
    /// Everything is gone.
    Shutdown,
}

crate::string_enum!(ProvisioningState, "provisioning state" {
    New => "NEW",
    MetalProvisioned => "METAL_PROVISIONED",
    NodeProvisioned => "NODE_PROVISIONED",
    Ready => "READY",
    PreMigration => "PRE_MIGRATION",
    MigrationMetalProvisioned => "MIGRATION_METAL_PROVISIONED",
    MigrationNodeProvisioned => "MIGRATION_NODE_PROVISIONED",
    MigrationCutover => "MIGRATION_CUTOVER",
    PreShutdown => "PRE_SHUTDOWN",
    ServerRemoved => "SERVER_REMOVED",
    NodeRemoved => "NODE_REMOVED",
    Shutdown => "SHUTDOWN",
});

/// Adjacency table: every state and the states it may move to.
const TRANSITIONS: &[(ProvisioningState, &[ProvisioningState])] = {
    use ProvisioningState::*;
    &[
        (New, &[MetalProvisioned]),
        (MetalProvisioned, &[NodeProvisioned]),
        (NodeProvisioned, &[Ready]),
        (Ready, &[PreShutdown]),
        (PreMigration, &[MigrationMetalProvisioned]),
        (MigrationMetalProvisioned, &[MigrationNodeProvisioned]),
        (MigrationNodeProvisioned, &[MigrationCutover]),
        (MigrationCutover, &[Ready]),
        (PreShutdown, &[ServerRemoved]),
        (ServerRemoved, &[NodeRemoved]),
        (NodeRemoved, &[Shutdown]),
        (Shutdown, &[]),
    ]
};

/// An attempted move that is not in the adjacency table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal provisioning state transition from {from} to {to}")]
pub struct IllegalStateTransition {
    /// State before the attempted move.
    pub from: ProvisioningState,
    /// Rejected target state.
    pub to: ProvisioningState,
}

impl ProvisioningState {
    /// States reachable from `self` in one move.
    pub fn successors(&self) -> &'static [ProvisioningState] {
        TRANSITIONS
            .iter()
            .find(|(state, _)| state == self)
            .map(|(_, next)| *next)
            .unwrap_or(&[])
    }

    /// Whether `next` is a legal move from `self`.
    pub fn can_transition_to(&self, next: ProvisioningState) -> bool {
        self.successors().contains(&next)
    }

    /// Validate a move, returning the target state on success.
    pub fn validate_transition(
        &self,
        next: ProvisioningState,
    ) -> Result<ProvisioningState, IllegalStateTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(IllegalStateTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// The state a pipeline run of `mode` starts from.
    ///
    /// MIGRATE_DESTROY continues the migration it belongs to, so it has no
    /// entry state of its own and keeps `current`.
    pub fn entry_for(mode: ProvisioningMode, current: ProvisioningState) -> ProvisioningState {
        match mode {
            ProvisioningMode::Create => ProvisioningState::New,
            ProvisioningMode::MigrateCreate => ProvisioningState::PreMigration,
            ProvisioningMode::Destroy => ProvisioningState::PreShutdown,
            ProvisioningMode::MigrateDestroy => current,
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning context.
//!
//! A [`ProvisioningContext`] is the complete, persisted snapshot of one
//! subscription's pipeline: where it is, which mode it runs in, and every
//! provider identifier obtained so far. All mutation goes through consuming
//! `with_*`/`transition` methods that return a new value, so the copy a step
//! is working on is never the copy that was last persisted.

use serde::{Deserialize, Serialize};

use crate::pipeline;
use crate::state::{IllegalStateTransition, ProvisioningState};

/// Identifies a step of the provisioning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    /// Pipeline start (creation) or end (destruction).
    New,
    /// Decide which kind of compute node backs the server.
    AllocateNode,
    /// Virtual machine from the cloud compute API.
    CloudNode,
    /// Bare-metal machine from the compute API.
    DedicatedNode,
    /// DNS A record for the node.
    ARecord,
    /// Node registration in the game panel.
    PterodactylNode,
    /// Daemon installation on the node.
    ConfigureNode,
    /// Port allocation on the panel node.
    PterodactylAllocation,
    /// Game server in the panel.
    PterodactylServer,
    /// Customer-facing CNAME record.
    CNameRecord,
    /// Copy world data between nodes (migration only).
    TransferData,
    /// Power on (creation) or power off (destruction).
    StartServer,
    /// Milestone bookkeeping before completion.
    Finalise,
    /// Pipeline end (creation) or start (destruction).
    Ready,
}

crate::string_enum!(StepType, "step type" {
    New => "NEW",
    AllocateNode => "ALLOCATE_NODE",
    CloudNode => "CLOUD_NODE",
    DedicatedNode => "DEDICATED_NODE",
    ARecord => "A_RECORD",
    PterodactylNode => "PTERODACTYL_NODE",
    ConfigureNode => "CONFIGURE_NODE",
    PterodactylAllocation => "PTERODACTYL_ALLOCATION",
    PterodactylServer => "PTERODACTYL_SERVER",
    CNameRecord => "C_NAME_RECORD",
    TransferData => "TRANSFER_DATA",
    StartServer => "START_SERVER",
    Finalise => "FINALISE",
    Ready => "READY",
});

/// Which step graph a pipeline run follows. Fixed for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningMode {
    /// Build a server from nothing.
    Create,
    /// Tear a server down.
    Destroy,
    /// Build a replacement next to the live server.
    MigrateCreate,
    /// Tear down the replaced resources and promote the replacement.
    MigrateDestroy,
}

crate::string_enum!(ProvisioningMode, "provisioning mode" {
    Create => "CREATE",
    Destroy => "DESTROY",
    MigrateCreate => "MIGRATE_CREATE",
    MigrateDestroy => "MIGRATE_DESTROY",
});

impl ProvisioningMode {
    /// Whether this mode walks the pipeline backward.
    pub fn is_destroy(&self) -> bool {
        matches!(self, Self::Destroy | Self::MigrateDestroy)
    }

    /// Whether this mode is half of a migration.
    pub fn is_migration(&self) -> bool {
        matches!(self, Self::MigrateCreate | Self::MigrateDestroy)
    }
}

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextStatus {
    /// Steps remain.
    InProgress,
    /// The terminal step was reached.
    Completed,
    /// The last step raised; the run resumes from the same step on retry.
    Failed,
}

crate::string_enum!(ContextStatus, "context status" {
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

/// Kind of hardware backing a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    /// On-demand virtual machine.
    Cloud,
    /// Bare-metal machine.
    Dedicated,
}

crate::string_enum!(NodeClass, "node class" {
    Cloud => "cloud",
    Dedicated => "dedicated",
});

/// One identifier held in a [`ResourceIds`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Compute provider node id.
    Node,
    /// IPv4 address of the compute node.
    NodeAddress,
    /// DNS A record id.
    ARecord,
    /// Panel node id.
    PanelNode,
    /// Panel allocation id.
    Allocation,
    /// Panel server id.
    PanelServer,
    /// DNS CNAME record id.
    CName,
}

crate::string_enum!(ResourceKind, "resource kind" {
    Node => "node",
    NodeAddress => "node_address",
    ARecord => "a_record",
    PanelNode => "panel_node",
    Allocation => "allocation",
    PanelServer => "panel_server",
    CName => "c_name",
});

/// Provider identifiers for one generation of a server's resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIds {
    /// Compute provider node id.
    pub node_id: Option<String>,
    /// IPv4 address of the compute node.
    pub node_address: Option<String>,
    /// DNS A record id.
    pub a_record_id: Option<String>,
    /// Panel node id.
    pub panel_node_id: Option<String>,
    /// Panel allocation id.
    pub allocation_id: Option<String>,
    /// Panel server id.
    pub panel_server_id: Option<String>,
    /// DNS CNAME record id.
    pub c_name_id: Option<String>,
}

impl ResourceIds {
    /// Read one slot.
    pub fn get(&self, kind: ResourceKind) -> Option<&str> {
        self.slot(kind).as_deref()
    }

    /// Whether no slot holds a value.
    pub fn is_empty(&self) -> bool {
        ResourceKind::ALL.iter().all(|k| self.get(*k).is_none())
    }

    fn slot(&self, kind: ResourceKind) -> &Option<String> {
        match kind {
            ResourceKind::Node => &self.node_id,
            ResourceKind::NodeAddress => &self.node_address,
            ResourceKind::ARecord => &self.a_record_id,
            ResourceKind::PanelNode => &self.panel_node_id,
            ResourceKind::Allocation => &self.allocation_id,
            ResourceKind::PanelServer => &self.panel_server_id,
            ResourceKind::CName => &self.c_name_id,
        }
    }

    fn slot_mut(&mut self, kind: ResourceKind) -> &mut Option<String> {
        match kind {
            ResourceKind::Node => &mut self.node_id,
            ResourceKind::NodeAddress => &mut self.node_address,
            ResourceKind::ARecord => &mut self.a_record_id,
            ResourceKind::PanelNode => &mut self.panel_node_id,
            ResourceKind::Allocation => &mut self.allocation_id,
            ResourceKind::PanelServer => &mut self.panel_server_id,
            ResourceKind::CName => &mut self.c_name_id,
        }
    }
}

/// Which of the two resource sets an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Live resources.
    Current,
    /// Migration replacements.
    New,
}

/// What the customer bought; drives sizing of every provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Provider region, e.g. `fsn1`.
    pub region: String,
    /// Provider size class, e.g. `cx32`.
    pub size_class: String,
    /// Cloud or dedicated hardware.
    pub node_class: NodeClass,
    /// OS image for the compute node.
    pub image: String,
    /// Panel egg (game template) id.
    pub egg_id: i64,
    /// Memory limit for the game server.
    pub memory_mb: i64,
    /// Disk limit for the game server.
    pub disk_mb: i64,
    /// CPU limit in percent of one core.
    pub cpu_limit: i64,
    /// Port the game listens on.
    pub game_port: u16,
}

/// Rejected context mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ContextError {
    /// The step graph of `mode` has no `from -> to` edge.
    #[error("illegal step transition {from} -> {to} in {mode} mode")]
    IllegalTransition {
        /// Mode of the run.
        mode: ProvisioningMode,
        /// Current step.
        from: StepType,
        /// Rejected next step.
        to: StepType,
    },

    /// The server-level state machine rejected the move.
    #[error(transparent)]
    IllegalState(#[from] IllegalStateTransition),

    /// A populated slot would be overwritten with a different value.
    #[error("{kind} already holds '{existing}', refusing to overwrite with '{attempted}'")]
    ResourceConflict {
        /// Slot being written.
        kind: ResourceKind,
        /// Value already present.
        existing: String,
        /// Value that was rejected.
        attempted: String,
    },

    /// A new pipeline run was requested while one is unfinished or the
    /// server is not in a state the run can start from.
    #[error("cannot begin {requested} for '{subscription_id}': {reason}")]
    CannotBegin {
        /// Subscription of the context.
        subscription_id: String,
        /// Requested mode.
        requested: ProvisioningMode,
        /// Why it was refused.
        reason: String,
    },
}

/// Persisted position of one subscription's provisioning pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningContext {
    pub(crate) subscription_id: String,
    pub(crate) step_type: StepType,
    pub(crate) mode: ProvisioningMode,
    pub(crate) status: ContextStatus,
    pub(crate) state: ProvisioningState,
    pub(crate) generation: i64,
    pub(crate) spec: ServerSpec,
    pub(crate) current: ResourceIds,
    pub(crate) new: ResourceIds,
    #[serde(default)]
    pub(crate) version: i64,
}

impl ProvisioningContext {
    /// Start a CREATE run for a subscription.
    pub fn new(subscription_id: impl Into<String>, spec: ServerSpec) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            step_type: StepType::New,
            mode: ProvisioningMode::Create,
            status: ContextStatus::InProgress,
            state: ProvisioningState::New,
            generation: 0,
            spec,
            current: ResourceIds::default(),
            new: ResourceIds::default(),
            version: 0,
        }
    }

    /// Subscription this server belongs to. Never changes.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Current pipeline position.
    pub fn step_type(&self) -> StepType {
        self.step_type
    }

    /// Mode of the current run.
    pub fn mode(&self) -> ProvisioningMode {
        self.mode
    }

    /// Status of the current run.
    pub fn status(&self) -> ContextStatus {
        self.status
    }

    /// Server-level milestone.
    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Bumped each time a migration begins; part of every resource name.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// What the server should look like.
    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    /// Live resource identifiers.
    pub fn current(&self) -> &ResourceIds {
        &self.current
    }

    /// Stored version this copy was derived from; 0 until the first save.
    ///
    /// A save only applies while the stored row still carries this version.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Replacement resource identifiers (migration only).
    pub fn new_resources(&self) -> &ResourceIds {
        &self.new
    }

    /// Slot the current mode builds into.
    pub fn working_slot(&self) -> Slot {
        match self.mode {
            ProvisioningMode::MigrateCreate => Slot::New,
            _ => Slot::Current,
        }
    }

    /// Resource set the current mode builds into.
    pub fn resources(&self) -> &ResourceIds {
        self.slot_ref(self.working_slot())
    }

    /// Every populated `(slot, id)` of `kind` the current mode must delete.
    ///
    /// DESTROY removes both sets so an interrupted migration leaves nothing
    /// behind; MIGRATE_DESTROY removes only the replaced resources.
    pub fn teardown_targets(&self, kind: ResourceKind) -> Vec<(Slot, String)> {
        let slots: &[Slot] = match self.mode {
            ProvisioningMode::Destroy => &[Slot::New, Slot::Current],
            ProvisioningMode::MigrateDestroy => &[Slot::Current],
            _ => &[],
        };
        slots
            .iter()
            .filter_map(|slot| {
                self.slot_ref(*slot)
                    .get(kind)
                    .map(|id| (*slot, id.to_string()))
            })
            .collect()
    }

    /// Whether the run sits in one of the two legal terminal configurations.
    pub fn is_terminal(&self) -> bool {
        if self.status != ContextStatus::Completed {
            return false;
        }
        match self.mode {
            ProvisioningMode::Create | ProvisioningMode::MigrateCreate => {
                self.step_type == StepType::Ready
            }
            ProvisioningMode::Destroy | ProvisioningMode::MigrateDestroy => {
                self.step_type == StepType::New
            }
        }
    }

    /// Move to `next`, which must be an edge of the mode's step graph.
    ///
    /// Reaching the mode's terminal step completes the run.
    pub fn transition(mut self, next: StepType) -> Result<Self, ContextError> {
        if !pipeline::is_legal(self.mode, self.step_type, next) {
            return Err(ContextError::IllegalTransition {
                mode: self.mode,
                from: self.step_type,
                to: next,
            });
        }
        self.step_type = next;
        self.status = if next == pipeline::terminal_step(self.mode) {
            ContextStatus::Completed
        } else {
            ContextStatus::InProgress
        };
        Ok(self)
    }

    /// Advance the server-level state, validated against the adjacency table.
    pub fn with_state(mut self, next: ProvisioningState) -> Result<Self, ContextError> {
        self.state = self.state.validate_transition(next)?;
        Ok(self)
    }

    /// Record a provider identifier in the working slot.
    ///
    /// Writing the value already held is a no-op; writing a different value
    /// into a populated slot is refused.
    pub fn with_resource(
        self,
        kind: ResourceKind,
        value: impl Into<String>,
    ) -> Result<Self, ContextError> {
        let slot = self.working_slot();
        self.with_resource_in(slot, kind, value)
    }

    /// Record a provider identifier in an explicit slot.
    pub fn with_resource_in(
        mut self,
        slot: Slot,
        kind: ResourceKind,
        value: impl Into<String>,
    ) -> Result<Self, ContextError> {
        let value = value.into();
        let target = self.slot_mut(slot).slot_mut(kind);
        if let Some(existing) = target.as_deref()
            && existing != value
        {
            return Err(ContextError::ResourceConflict {
                kind,
                existing: existing.to_string(),
                attempted: value,
            });
        }
        *target = Some(value);
        Ok(self)
    }

    /// Explicit cleanup: forget an identifier once its resource is deleted.
    pub fn clear_resource(mut self, slot: Slot, kind: ResourceKind) -> Self {
        *self.slot_mut(slot).slot_mut(kind) = None;
        self
    }

    /// Copy every populated replacement id into the live slot and empty the
    /// replacement set. Calling it again is a no-op.
    pub fn promote_all_new_resources(mut self) -> Self {
        for kind in ResourceKind::ALL {
            if let Some(value) = self.new.slot_mut(*kind).take() {
                *self.current.slot_mut(*kind) = Some(value);
            }
        }
        self
    }

    /// Record that the last step raised. The step is retried on resume.
    pub fn mark_failed(mut self) -> Self {
        self.status = ContextStatus::Failed;
        self
    }

    /// Pick a failed run back up at the step it failed on.
    pub fn resume(mut self) -> Self {
        if self.status == ContextStatus::Failed {
            self.status = ContextStatus::InProgress;
        }
        self
    }

    /// Start a DESTROY run. Allowed once the previous run completed or failed.
    pub fn begin_destroy(self) -> Result<Self, ContextError> {
        if self.status == ContextStatus::InProgress {
            return Err(self.refuse(ProvisioningMode::Destroy, "a pipeline run is in progress"));
        }
        if self.mode == ProvisioningMode::Destroy && self.is_terminal() {
            return Err(self.refuse(ProvisioningMode::Destroy, "server is already shut down"));
        }
        Ok(self.restart(ProvisioningMode::Destroy))
    }

    /// Start a fresh CREATE run on a subscription whose server was destroyed.
    ///
    /// The generation and resource sets start over; the stored version is
    /// kept so the replacement overwrites exactly this row.
    pub fn recreate(self, spec: ServerSpec) -> Result<Self, ContextError> {
        if !(self.mode == ProvisioningMode::Destroy && self.is_terminal()) {
            return Err(self.refuse(ProvisioningMode::Create, "server already exists"));
        }
        Ok(Self {
            version: self.version,
            ..Self::new(self.subscription_id, spec)
        })
    }

    /// Start a MIGRATE_CREATE run towards `spec`. The server must be live.
    pub fn begin_migration(self, spec: ServerSpec) -> Result<Self, ContextError> {
        if !self.is_terminal() || self.state != ProvisioningState::Ready {
            return Err(self.refuse(ProvisioningMode::MigrateCreate, "server is not ready"));
        }
        let mut next = self.restart(ProvisioningMode::MigrateCreate);
        next.generation += 1;
        next.spec = spec;
        next.new = ResourceIds::default();
        Ok(next)
    }

    /// Start the MIGRATE_DESTROY half after MIGRATE_CREATE completed.
    pub fn begin_migrate_destroy(self) -> Result<Self, ContextError> {
        if self.mode != ProvisioningMode::MigrateCreate || !self.is_terminal() {
            return Err(self.refuse(
                ProvisioningMode::MigrateDestroy,
                "replacement has not finished provisioning",
            ));
        }
        Ok(self.restart(ProvisioningMode::MigrateDestroy))
    }

    fn restart(mut self, mode: ProvisioningMode) -> Self {
        self.mode = mode;
        self.step_type = pipeline::entry_step(mode);
        self.status = ContextStatus::InProgress;
        self.state = ProvisioningState::entry_for(mode, self.state);
        self
    }

    /// Copy as it stands after a successful save.
    pub(crate) fn saved(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }

    fn refuse(&self, requested: ProvisioningMode, reason: &str) -> ContextError {
        ContextError::CannotBegin {
            subscription_id: self.subscription_id.clone(),
            requested,
            reason: reason.to_string(),
        }
    }

    fn slot_ref(&self, slot: Slot) -> &ResourceIds {
        match slot {
            Slot::Current => &self.current,
            Slot::New => &self.new,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut ResourceIds {
        match slot {
            Slot::Current => &mut self.current,
            Slot::New => &mut self.new,
        }
    }
}

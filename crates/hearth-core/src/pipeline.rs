// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step graphs for each provisioning mode.
//!
//! A pipeline is an ordered list of stages; each stage holds one or more
//! alternative steps. Creation modes walk the stages forward, destruction
//! modes walk the same stages backward. Adding a step is a table edit.

use crate::context::{ProvisioningMode, StepType};

const CREATE_STAGES: &[&[StepType]] = {
    use StepType::*;
    &[
        &[New],
        &[AllocateNode],
        &[CloudNode, DedicatedNode],
        &[ARecord],
        &[PterodactylNode],
        &[ConfigureNode],
        &[PterodactylAllocation],
        &[PterodactylServer],
        &[CNameRecord],
        &[StartServer],
        &[Finalise],
        &[Ready],
    ]
};

const MIGRATE_CREATE_STAGES: &[&[StepType]] = {
    use StepType::*;
    &[
        &[New],
        &[AllocateNode],
        &[CloudNode, DedicatedNode],
        &[ARecord],
        &[PterodactylNode],
        &[ConfigureNode],
        &[PterodactylAllocation],
        &[PterodactylServer],
        &[CNameRecord],
        &[TransferData],
        &[StartServer],
        &[Finalise],
        &[Ready],
    ]
};

/// Stages of `mode` in declaration order, and whether the mode walks them
/// backward.
fn stages(mode: ProvisioningMode) -> (&'static [&'static [StepType]], bool) {
    match mode {
        ProvisioningMode::Create => (CREATE_STAGES, false),
        ProvisioningMode::MigrateCreate => (MIGRATE_CREATE_STAGES, false),
        ProvisioningMode::Destroy | ProvisioningMode::MigrateDestroy => (CREATE_STAGES, true),
    }
}

/// Steps that may legally follow `step` in `mode`.
pub fn successors(mode: ProvisioningMode, step: StepType) -> &'static [StepType] {
    let (stages, backward) = stages(mode);
    let Some(pos) = stages.iter().position(|stage| stage.contains(&step)) else {
        return &[];
    };
    if backward {
        if pos == 0 { &[] } else { stages[pos - 1] }
    } else {
        stages.get(pos + 1).copied().unwrap_or(&[])
    }
}

/// Whether `from -> to` is an edge of the `mode` graph.
pub fn is_legal(mode: ProvisioningMode, from: StepType, to: StepType) -> bool {
    successors(mode, from).contains(&to)
}

/// Whether `step` appears anywhere in the `mode` graph.
pub fn contains(mode: ProvisioningMode, step: StepType) -> bool {
    let (stages, _) = stages(mode);
    stages.iter().any(|stage| stage.contains(&step))
}

/// Step a fresh run of `mode` starts at.
pub fn entry_step(mode: ProvisioningMode) -> StepType {
    if mode.is_destroy() {
        StepType::Ready
    } else {
        StepType::New
    }
}

/// Step at which a run of `mode` is complete.
pub fn terminal_step(mode: ProvisioningMode) -> StepType {
    if mode.is_destroy() {
        StepType::New
    } else {
        StepType::Ready
    }
}

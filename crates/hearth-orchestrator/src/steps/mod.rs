// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipeline steps.
//!
//! A step owns one kind of provider resource and knows how to create it
//! (CREATE, MIGRATE_CREATE) and remove it (DESTROY, MIGRATE_DESTROY). Steps
//! take a context by value and return the updated copy together with the next
//! step; they never persist anything themselves.
//!
//! Creation is get-or-create by deterministic name, so running a step twice
//! for the same context adopts the resource the first run made. Removal is a
//! no-op when no identifier is recorded and treats provider not-found as done.

mod boundary;
mod dns;
mod node;
mod panel;

pub use boundary::{AllocateNodeStep, BoundaryStep, FinaliseStep};
pub use dns::{ARecordStep, CNameRecordStep};
pub use node::{ConfigureNodeStep, NodeStep};
pub use panel::{
    PterodactylAllocationStep, PterodactylNodeStep, PterodactylServerStep, StartServerStep,
    TransferDataStep,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::context::{
    ContextError, NodeClass, ProvisioningContext, ProvisioningMode, ResourceKind, Slot, StepType,
};
use hearth_core::pipeline;
use tracing::debug;

use crate::error::ProvisioningError;
use crate::providers::{ProviderError, Providers, ignore_not_found};

/// Context returned by a step plus where the pipeline goes next.
#[derive(Debug, Clone)]
pub struct StepTransition {
    /// Updated context.
    pub context: ProvisioningContext,
    /// Step to move to.
    pub next: StepType,
}

/// One stage of the provisioning pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    /// The step this implementation handles.
    fn step_type(&self) -> StepType;

    /// Do the work for the context's current mode.
    async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<StepTransition, ProvisioningError>;
}

/// Settings shared by every step.
#[derive(Debug, Clone)]
pub struct StepSettings {
    /// Zone for node A records and customer CNAMEs.
    pub dns_zone: String,
    /// How long to wait for a new compute node to boot.
    pub node_ready_timeout: Duration,
    /// How often to poll a booting node.
    pub node_poll_interval: Duration,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            dns_zone: "hearth.example.test".to_string(),
            node_ready_timeout: Duration::from_secs(600),
            node_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Step lookup by type.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<StepType, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an implementation for every step of every pipeline.
    pub fn standard(providers: Providers, settings: StepSettings) -> Self {
        let settings = Arc::new(settings);
        let mut registry = Self::new();
        registry
            .register(Arc::new(BoundaryStep::new(StepType::New)))
            .register(Arc::new(BoundaryStep::new(StepType::Ready)))
            .register(Arc::new(AllocateNodeStep))
            .register(Arc::new(NodeStep::new(
                NodeClass::Cloud,
                providers.clone(),
                settings.clone(),
            )))
            .register(Arc::new(NodeStep::new(
                NodeClass::Dedicated,
                providers.clone(),
                settings.clone(),
            )))
            .register(Arc::new(ARecordStep::new(
                providers.clone(),
                settings.clone(),
            )))
            .register(Arc::new(PterodactylNodeStep::new(
                providers.clone(),
                settings.clone(),
            )))
            .register(Arc::new(ConfigureNodeStep::new(providers.clone())))
            .register(Arc::new(PterodactylAllocationStep::new(providers.clone())))
            .register(Arc::new(PterodactylServerStep::new(providers.clone())))
            .register(Arc::new(CNameRecordStep::new(
                providers.clone(),
                settings.clone(),
            )))
            .register(Arc::new(TransferDataStep::new(providers.clone())))
            .register(Arc::new(StartServerStep::new(providers)))
            .register(Arc::new(FinaliseStep));
        registry
    }

    /// Add or replace the implementation for `step.step_type()`.
    pub fn register(&mut self, step: Arc<dyn Step>) -> &mut Self {
        self.steps.insert(step.step_type(), step);
        self
    }

    /// Implementation for a step, if registered.
    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn Step>> {
        self.steps.get(&step_type).cloned()
    }

    /// Steps of `mode` without an implementation.
    pub fn missing_for(&self, mode: ProvisioningMode) -> Vec<StepType> {
        StepType::ALL
            .iter()
            .copied()
            .filter(|step| pipeline::contains(mode, *step) && !self.steps.contains_key(step))
            .collect()
    }
}

/// Compute step that creates nodes of `class`.
pub fn node_step_for(class: NodeClass) -> StepType {
    match class {
        NodeClass::Cloud => StepType::CloudNode,
        NodeClass::Dedicated => StepType::DedicatedNode,
    }
}

/// Move on to the step that follows the context's current one.
///
/// Where the graph offers the cloud/dedicated alternatives, the spec's node
/// class decides.
pub fn advance(context: ProvisioningContext) -> Result<StepTransition, ProvisioningError> {
    let options = pipeline::successors(context.mode(), context.step_type());
    let next = match options {
        [only] => *only,
        _ => {
            let preferred = node_step_for(context.spec().node_class);
            if !options.contains(&preferred) {
                return Err(ContextError::IllegalTransition {
                    mode: context.mode(),
                    from: context.step_type(),
                    to: preferred,
                }
                .into());
            }
            preferred
        }
    };
    Ok(StepTransition { context, next })
}

/// Wrap a provider failure with the subscription and the ids recorded so far.
pub(crate) fn provider_failure<'a>(
    context: &'a ProvisioningContext,
    operation: &'a str,
) -> impl FnOnce(ProviderError) -> ProvisioningError + 'a {
    move |source| {
        ProvisioningError::provider(
            operation,
            context.subscription_id(),
            context.resources(),
            source,
        )
    }
}

/// Delete every `kind` resource the current mode tears down and forget its id.
///
/// `delete` receives the slot and the provider id. Not-found counts as
/// deleted.
pub(crate) async fn teardown<F, Fut>(
    mut context: ProvisioningContext,
    kind: ResourceKind,
    operation: &str,
    delete: F,
) -> Result<ProvisioningContext, ProvisioningError>
where
    F: Fn(Slot, String) -> Fut + Send,
    Fut: Future<Output = crate::providers::Result<()>> + Send,
{
    for (slot, id) in context.teardown_targets(kind) {
        ignore_not_found(delete(slot, id.clone()).await)
            .map_err(provider_failure(&context, operation))?;
        debug!(
            subscription_id = %context.subscription_id(),
            kind = %kind,
            id = %id,
            "Deleted provider resource"
        );
        context = context.clear_resource(slot, kind);
    }
    Ok(context)
}

/// Identifier a step depends on, or a fatal error naming it.
pub(crate) fn require(
    context: &ProvisioningContext,
    step: StepType,
    kind: ResourceKind,
) -> Result<String, ProvisioningError> {
    context
        .resources()
        .get(kind)
        .map(str::to_string)
        .ok_or_else(|| ProvisioningError::MissingPrerequisite {
            subscription_id: context.subscription_id().to_string(),
            step,
            kind,
        })
}

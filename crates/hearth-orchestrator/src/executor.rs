// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step executor.
//!
//! Drives a context through its pipeline one step at a time and writes every
//! transition before running the next step. A process that dies mid-pipeline
//! therefore resumes at the last persisted step when the job is claimed
//! again, and the step it re-runs adopts whatever it created by name.
//!
//! The executor never retries. A failing step marks the persisted context
//! FAILED and the error goes to the job layer, which decides whether to try
//! again.
//!
//! Saves are conditional on the version the run last wrote. When a request
//! replaced the context mid-run (a destroy during a migration, say) the next
//! save conflicts, the run stops without touching the stored context and the
//! retried job picks up the new mode.

use std::sync::Arc;

use hearth_core::context::{ContextStatus, ProvisioningContext};
use hearth_core::persistence::Persistence;
use tracing::{debug, info, warn};

use crate::error::ProvisioningError;
use crate::steps::StepRegistry;

/// Writes context snapshots and their audit rows.
#[derive(Clone)]
pub struct TransitionPersistence {
    persistence: Arc<dyn Persistence>,
}

impl TransitionPersistence {
    /// Wrap a repository.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Persist a completed transition and return the saved copy.
    pub async fn record(
        &self,
        context: &ProvisioningContext,
    ) -> Result<ProvisioningContext, ProvisioningError> {
        let saved = self.persistence.save_context(context).await?;
        debug!(
            subscription_id = %saved.subscription_id(),
            step = %saved.step_type(),
            mode = %saved.mode(),
            status = %saved.status(),
            version = saved.version(),
            "Transition persisted"
        );
        Ok(saved)
    }

    /// Persist the context as FAILED at the step it failed on.
    ///
    /// A save error is only logged; the step error is what the caller sees.
    pub async fn record_failure(&self, context: ProvisioningContext) {
        let failed = context.mark_failed();
        match self.persistence.save_context(&failed).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => info!(
                subscription_id = %failed.subscription_id(),
                step = %failed.step_type(),
                "Context was replaced during the run, keeping the stored one"
            ),
            Err(e) => warn!(
                subscription_id = %failed.subscription_id(),
                step = %failed.step_type(),
                error = %e,
                "Failed to persist failed context"
            ),
        }
    }
}

/// Runs pipelines against a step registry.
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
    transitions: TransitionPersistence,
}

impl StepExecutor {
    /// Create an executor.
    pub fn new(registry: Arc<StepRegistry>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            registry,
            transitions: TransitionPersistence::new(persistence),
        }
    }

    /// Run `context` until its mode's terminal step.
    ///
    /// Returns the completed context. A FAILED context is resumed at the step
    /// it failed on.
    pub async fn execute(
        &self,
        context: ProvisioningContext,
    ) -> Result<ProvisioningContext, ProvisioningError> {
        let mut context = context;
        if context.status() == ContextStatus::Failed {
            context = self.transitions.record(&context.resume()).await?;
            info!(
                subscription_id = %context.subscription_id(),
                step = %context.step_type(),
                "Resuming failed pipeline"
            );
        }

        while context.status() != ContextStatus::Completed {
            let step_type = context.step_type();
            let Some(step) = self.registry.get(step_type) else {
                let err = ProvisioningError::StepNotRegistered(step_type);
                self.transitions.record_failure(context).await;
                return Err(err);
            };

            debug!(
                subscription_id = %context.subscription_id(),
                step = %step_type,
                mode = %context.mode(),
                "Executing step"
            );

            let outcome = match step.execute(context.clone()).await {
                Ok(transition) => transition
                    .context
                    .transition(transition.next)
                    .map_err(ProvisioningError::from),
                Err(e) => Err(e),
            };
            let next = match outcome {
                Ok(next) => next,
                Err(e) => {
                    warn!(
                        subscription_id = %context.subscription_id(),
                        step = %step_type,
                        error = %e,
                        "Step failed"
                    );
                    self.transitions.record_failure(context).await;
                    return Err(e);
                }
            };

            context = match self.transitions.record(&next).await {
                Ok(saved) => saved,
                Err(e) => {
                    self.transitions.record_failure(context).await;
                    return Err(e);
                }
            };
        }

        info!(
            subscription_id = %context.subscription_id(),
            mode = %context.mode(),
            state = %context.state(),
            "Pipeline completed"
        );
        Ok(context)
    }
}

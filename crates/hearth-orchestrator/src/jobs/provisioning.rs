// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PROVISION jobs: run a subscription's pipeline from wherever it stopped.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::context::{ProvisioningContext, ProvisioningMode};
use hearth_core::job::{Job, JobType};
use hearth_core::persistence::Persistence;
use tracing::{debug, info};

use super::{JobProcessor, ProcessorError};
use crate::error::ProvisioningError;
use crate::executor::StepExecutor;

/// Loads the context named by the payload and hands it to the executor.
///
/// A finished MIGRATE_CREATE run is followed by its MIGRATE_DESTROY half in
/// the same job, so one migration request tears the old generation down too.
pub struct ProvisioningProcessor {
    persistence: Arc<dyn Persistence>,
    executor: Arc<StepExecutor>,
}

impl ProvisioningProcessor {
    /// Create the processor.
    pub fn new(persistence: Arc<dyn Persistence>, executor: Arc<StepExecutor>) -> Self {
        Self {
            persistence,
            executor,
        }
    }

    fn migrate_destroy(context: ProvisioningContext) -> Result<ProvisioningContext, ProcessorError> {
        info!(
            subscription_id = %context.subscription_id(),
            generation = context.generation(),
            "Replacement ready, tearing down previous generation"
        );
        Ok(context
            .begin_migrate_destroy()
            .map_err(ProvisioningError::from)?)
    }
}

#[async_trait]
impl JobProcessor for ProvisioningProcessor {
    fn job_type(&self) -> JobType {
        JobType::Provision
    }

    async fn process(&self, job: &Job) -> Result<(), ProcessorError> {
        let subscription_id = job.payload.trim();
        let Some(context) = self.persistence.load_context(subscription_id).await? else {
            return Err(ProcessorError::Fatal(format!(
                "no provisioning context for subscription '{}'",
                subscription_id
            )));
        };

        let context = if context.is_terminal() {
            if context.mode() != ProvisioningMode::MigrateCreate {
                debug!(
                    subscription_id = %subscription_id,
                    mode = %context.mode(),
                    "Pipeline already complete, nothing to do"
                );
                return Ok(());
            }
            Self::migrate_destroy(context)?
        } else {
            context
        };

        let done = self.executor.execute(context).await?;
        if done.mode() == ProvisioningMode::MigrateCreate && done.is_terminal() {
            self.executor.execute(Self::migrate_destroy(done)?).await?;
        }
        Ok(())
    }
}

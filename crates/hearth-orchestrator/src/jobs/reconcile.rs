// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RECONCILE jobs: sweep the resource type named by the payload.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::job::{Job, JobType};

use super::{JobProcessor, ProcessorError};
use crate::reconcile::{ReconcileEngine, ResourceType};

/// Runs one reconciliation sweep per job.
///
/// Any sweep failure is reported as fatal: the next scheduled sweep covers
/// the same ground, so spending retries on it gains nothing.
pub struct ReconcileProcessor {
    engine: Arc<ReconcileEngine>,
}

impl ReconcileProcessor {
    /// Create the processor.
    pub fn new(engine: Arc<ReconcileEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobProcessor for ReconcileProcessor {
    fn job_type(&self) -> JobType {
        JobType::Reconcile
    }

    async fn process(&self, job: &Job) -> Result<(), ProcessorError> {
        let resource_type: ResourceType = job
            .payload
            .trim()
            .parse()
            .map_err(|e| ProcessorError::Fatal(format!("invalid reconcile payload: {}", e)))?;
        self.engine
            .reconcile(resource_type)
            .await
            .map_err(|e| ProcessorError::Fatal(e.to_string()))?;
        Ok(())
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable job queue and worker pool.
//!
//! Work is enqueued through [`JobQueue`] with a dedup key, claimed atomically
//! by [`JobWorker`], and handed to the [`JobProcessor`] registered for its
//! type. The worker alone decides what happens after a failure: retry with
//! backoff ([`RetryPolicy`]) or dead-letter once the budget is spent.

mod provisioning;
mod queue;
mod reconcile;
mod retry;
mod worker;

pub use provisioning::ProvisioningProcessor;
pub use queue::JobQueue;
pub use reconcile::ReconcileProcessor;
pub use retry::RetryPolicy;
pub use worker::{JobWorker, JobWorkerConfig};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::job::{Job, JobType};
use thiserror::Error;

use crate::error::ProvisioningError;

/// Failure reported by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    /// Consumes one retry; dead-letters once the budget is spent.
    #[error("{0}")]
    Retriable(String),

    /// Dead-letters immediately. Retrying cannot help.
    #[error("{0}")]
    Fatal(String),
}

impl ProcessorError {
    /// Whether the worker should dead-letter without retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<ProvisioningError> for ProcessorError {
    fn from(e: ProvisioningError) -> Self {
        if e.is_retriable() {
            Self::Retriable(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

impl From<hearth_core::CoreError> for ProcessorError {
    fn from(e: hearth_core::CoreError) -> Self {
        Self::Retriable(e.to_string())
    }
}

/// Handler for one job type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Job type this processor handles.
    fn job_type(&self) -> JobType;

    /// Do the work described by `job`.
    async fn process(&self, job: &Job) -> Result<(), ProcessorError>;
}

/// Processors by job type, built once at startup.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the processor for its job type.
    pub fn register(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.processors.insert(processor.job_type(), processor);
        self
    }

    /// Processor for `job_type`, if any.
    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&job_type).cloned()
    }
}

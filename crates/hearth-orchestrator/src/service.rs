// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entry point for provisioning requests.
//!
//! Each request persists the subscription's context in its new mode and then
//! enqueues one PROVISION job for it. Every pipeline of a subscription shares
//! the same dedup key, so a request made while a job is still queued or
//! running collapses into that job, which picks up the new mode when it
//! loads the context.

use std::sync::Arc;

use hearth_core::context::{ContextError, ProvisioningContext, ServerSpec};
use hearth_core::job::{EnqueueOutcome, JobType};
use hearth_core::persistence::Persistence;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::jobs::JobQueue;

/// Reloads tolerated before a request gives up on a busy context.
const MAX_SAVE_CONFLICTS: usize = 5;

/// Create, migrate and destroy requests.
#[derive(Clone)]
pub struct ProvisioningService {
    persistence: Arc<dyn Persistence>,
    queue: JobQueue,
}

impl ProvisioningService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>, queue: JobQueue) -> Self {
        Self { persistence, queue }
    }

    /// Provision a new server for `subscription_id`.
    ///
    /// A subscription whose previous server was fully destroyed starts over
    /// with a fresh context. Any other existing context is an
    /// [`Error::AlreadyExists`].
    pub async fn request_create(
        &self,
        subscription_id: &str,
        spec: ServerSpec,
    ) -> Result<EnqueueOutcome> {
        let context = match self.persistence.load_context(subscription_id).await? {
            Some(existing) => existing
                .recreate(spec)
                .map_err(|_| Error::AlreadyExists(subscription_id.to_string()))?,
            None => ProvisioningContext::new(subscription_id, spec),
        };
        match self.persistence.save_context(&context).await {
            Ok(saved) => self.enqueue(saved).await,
            // Another create won the race
            Err(e) if e.is_conflict() => Err(Error::AlreadyExists(subscription_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a live server onto a new node built from `spec`.
    pub async fn request_migration(
        &self,
        subscription_id: &str,
        spec: ServerSpec,
    ) -> Result<EnqueueOutcome> {
        self.submit(subscription_id, |context| context.begin_migration(spec.clone()))
            .await
    }

    /// Tear down every resource of the subscription.
    pub async fn request_destroy(&self, subscription_id: &str) -> Result<EnqueueOutcome> {
        self.submit(subscription_id, ProvisioningContext::begin_destroy)
            .await
    }

    /// Stored context of a subscription.
    pub async fn context(&self, subscription_id: &str) -> Result<Option<ProvisioningContext>> {
        Ok(self.persistence.load_context(subscription_id).await?)
    }

    async fn load(&self, subscription_id: &str) -> Result<ProvisioningContext> {
        self.persistence
            .load_context(subscription_id)
            .await?
            .ok_or_else(|| Error::NotFound(subscription_id.to_string()))
    }

    /// Apply `begin` to the stored context and save it.
    ///
    /// A running job saves the context after every step, so a conflicting
    /// save is retried on a fresh load.
    async fn submit<F>(&self, subscription_id: &str, begin: F) -> Result<EnqueueOutcome>
    where
        F: Fn(ProvisioningContext) -> std::result::Result<ProvisioningContext, ContextError>,
    {
        let mut conflicts = 0;
        loop {
            let context = begin(self.load(subscription_id).await?)?;
            match self.persistence.save_context(&context).await {
                Ok(saved) => return self.enqueue(saved).await,
                Err(e) if e.is_conflict() && conflicts < MAX_SAVE_CONFLICTS => {
                    conflicts += 1;
                    debug!(
                        subscription_id = %subscription_id,
                        conflicts,
                        "Context changed while applying request, reloading"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn enqueue(&self, context: ProvisioningContext) -> Result<EnqueueOutcome> {
        info!(
            subscription_id = %context.subscription_id(),
            mode = %context.mode(),
            generation = context.generation(),
            "Provisioning requested"
        );
        self.queue
            .enqueue(JobType::Provision, context.subscription_id(), None, None)
            .await
    }
}

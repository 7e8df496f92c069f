// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hearth-orchestrator.

use hearth_core::context::{ContextError, ResourceIds, ResourceKind, StepType};
use hearth_core::error::CoreError;
use thiserror::Error;

use crate::providers::ProviderError;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// A provisioning pipeline failed.
    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// A pipeline run could not be started for the subscription.
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// A provisioning context already exists for the subscription.
    #[error("Subscription already provisioned: {0}")]
    AlreadyExists(String),

    /// No provisioning context exists for the subscription.
    #[error("Subscription not found: {0}")]
    NotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a pipeline step or of the executor driving it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisioningError {
    /// A provider call failed. Carries every identifier obtained so far so
    /// the resources can be found for cleanup.
    #[error("{operation} failed for subscription '{subscription_id}': {source}")]
    Provider {
        /// What the step was doing.
        operation: String,
        /// Subscription being provisioned.
        subscription_id: String,
        /// Identifiers obtained before the failure.
        resources: Box<ResourceIds>,
        /// Provider failure.
        #[source]
        source: ProviderError,
    },

    /// A step needs an identifier an earlier step should have recorded.
    #[error("{step} for subscription '{subscription_id}' requires {kind}, which is not recorded")]
    MissingPrerequisite {
        /// Subscription being provisioned.
        subscription_id: String,
        /// Step that needed it.
        step: StepType,
        /// Missing identifier.
        kind: ResourceKind,
    },

    /// The requested server cannot be built as specified.
    #[error("invalid server spec for subscription '{subscription_id}': {reason}")]
    InvalidSpec {
        /// Subscription being provisioned.
        subscription_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The registry has no implementation for a step the pipeline reached.
    #[error("no step registered for {0}")]
    StepNotRegistered(StepType),

    /// Illegal step or state transition, or a resource slot conflict.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Persisting the context failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] CoreError),
}

impl ProvisioningError {
    /// Build a [`ProvisioningError::Provider`].
    pub fn provider(
        operation: impl Into<String>,
        subscription_id: &str,
        resources: &ResourceIds,
        source: ProviderError,
    ) -> Self {
        Self::Provider {
            operation: operation.into(),
            subscription_id: subscription_id.to_string(),
            resources: Box::new(resources.clone()),
            source,
        }
    }

    /// Whether running the pipeline again may succeed.
    ///
    /// Provider and database failures are retried regardless of their cause.
    /// The rest are defects in the pipeline tables or stored data.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::Persistence(_))
    }

    /// Partial identifiers carried by a provider failure.
    pub fn resources(&self) -> Option<&ResourceIds> {
        match self {
            Self::Provider { resources, .. } => Some(resources),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::context::ProvisioningMode;

    #[test]
    fn test_retriable_classification() {
        let mut ids = ResourceIds::default();
        ids.node_id = Some("n-1".to_string());

        let provider = ProvisioningError::provider(
            "create A record",
            "sub-1",
            &ids,
            ProviderError::Unavailable {
                provider: "dns",
                message: "502".to_string(),
            },
        );
        assert!(provider.is_retriable());
        assert_eq!(
            provider.resources().and_then(|r| r.node_id.as_deref()),
            Some("n-1")
        );
        assert!(provider.to_string().contains("sub-1"));

        let rejected = ProvisioningError::provider(
            "create node",
            "sub-1",
            &ids,
            ProviderError::Rejected {
                provider: "compute",
                message: "422".to_string(),
            },
        );
        assert!(rejected.is_retriable());

        assert!(!ProvisioningError::StepNotRegistered(StepType::ARecord).is_retriable());
        assert!(
            !ProvisioningError::Context(ContextError::IllegalTransition {
                mode: ProvisioningMode::Create,
                from: StepType::New,
                to: StepType::Ready,
            })
            .is_retriable()
        );
        assert!(
            ProvisioningError::Persistence(CoreError::DatabaseError {
                operation: "save".to_string(),
                details: "locked".to_string(),
            })
            .is_retriable()
        );
    }
}

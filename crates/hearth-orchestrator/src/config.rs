// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hearth-orchestrator.

use std::time::Duration;

use crate::audit_worker::JobAuditWorkerConfig;
use crate::jobs::{JobWorkerConfig, RetryPolicy};
use crate::reconcile::ReconcileConfig;
use crate::steps::StepSettings;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL. `postgres://` selects PostgreSQL, anything else SQLite.
    pub database_url: String,
    /// Retry budget for jobs enqueued without one
    pub default_max_retries: i32,
    /// DNS zone and node boot polling
    pub steps: StepSettings,
    /// Job worker pool
    pub worker: JobWorkerConfig,
    /// Backoff between job attempts
    pub retry: RetryPolicy,
    /// Completed job archival
    pub audit: JobAuditWorkerConfig,
    /// Orphan reconciliation
    pub reconcile: ReconcileConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("HEARTH_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("HEARTH_DATABASE_URL"))?;

        let default_max_retries: i32 = parse_var("HEARTH_JOB_DEFAULT_MAX_RETRIES", "5")?;
        if default_max_retries < 1 {
            return Err(ConfigError::Invalid {
                var: "HEARTH_JOB_DEFAULT_MAX_RETRIES",
                value: default_max_retries.to_string(),
            });
        }

        let defaults = StepSettings::default();
        let dns_zone = std::env::var("HEARTH_DNS_ZONE").unwrap_or(defaults.dns_zone);
        let node_ready_timeout: u64 = parse_var(
            "HEARTH_NODE_READY_TIMEOUT_SECS",
            &defaults.node_ready_timeout.as_secs().to_string(),
        )?;

        Ok(Self {
            database_url,
            default_max_retries,
            steps: StepSettings {
                dns_zone,
                node_ready_timeout: Duration::from_secs(node_ready_timeout),
                node_poll_interval: defaults.node_poll_interval,
            },
            worker: JobWorkerConfig::from_env()?,
            retry: RetryPolicy::from_env(),
            audit: JobAuditWorkerConfig::from_env(),
            reconcile: ReconcileConfig::from_env(),
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be used.
    #[error("Invalid value for {var}: '{value}'")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Value it was set to.
        value: String,
    },
}

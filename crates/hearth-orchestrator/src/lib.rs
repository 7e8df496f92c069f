// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hearth Orchestrator - game server provisioning across compute, DNS and
//! panel providers.
//!
//! Provisioning a server touches several external APIs, any of which can
//! fail halfway. Every step records the identifiers it obtained before the
//! next step runs, so a crashed or failed pipeline resumes where it stopped
//! and never creates a resource twice.
//!
//! # Architecture
//!
//! ```text
//!   ProvisioningService ──save context──► Persistence ◄──────────────┐
//!          │                                  ▲                      │
//!          │ enqueue PROVISION                │ claim / settle       │
//!          ▼                                  │                      │
//!       JobQueue ─────────────────────► JobWorker (pool) ──► ProcessorRegistry
//!          ▲                                                  │          │
//!          │ enqueue RECONCILE                                ▼          ▼
//!   ReconcileScheduler                           ProvisioningProcessor  ReconcileProcessor
//!                                                        │                     │
//!                                                        ▼                     ▼
//!                                                  StepExecutor         ReconcileEngine
//!                                                        │                     │
//!                                                        ▼                     ▼
//!                                              Step (per StepType) ──► Providers ◄─┘
//!                                                                 (compute, dns, panel,
//!                                                                  installer)
//!   JobAuditWorker: archives COMPLETED jobs past retention under a TTL lock
//! ```
//!
//! # Modules
//!
//! - [`steps`]: one [`steps::Step`] per pipeline position, each idempotent
//! - [`executor`]: drives a context to completion, persisting every transition
//! - [`jobs`]: durable queue, worker pool, retry policy and processors
//! - [`reconcile`]: orphan detection and the periodic sweep scheduler
//! - [`audit_worker`]: completed job archival
//! - [`service`]: create, migrate and destroy requests
//! - [`runtime`]: embeddable runtime that starts and stops the loops
//! - [`providers`]: provider traits and in-memory implementations

#![deny(missing_docs)]

/// Completed job archival.
pub mod audit_worker;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Step executor and transition persistence.
pub mod executor;

/// Job queue, worker pool and processors.
pub mod jobs;

/// Deterministic names for provider resources.
pub mod naming;

/// Provider collaborator traits and mocks.
pub mod providers;

/// Orphan reconciliation.
pub mod reconcile;

/// Embeddable runtime.
pub mod runtime;

/// Provisioning requests.
pub mod service;

/// Pipeline steps.
pub mod steps;

pub use config::Config;
pub use error::{Error, ProvisioningError, Result};
pub use executor::StepExecutor;
pub use runtime::OrchestratorRuntime;
pub use service::ProvisioningService;

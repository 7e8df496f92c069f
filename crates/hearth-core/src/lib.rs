// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hearth Core - provisioning model and durable persistence.
//!
//! This crate holds the records that make multi-provider provisioning safe to
//! crash, retry, and resume:
//!
//! - [`context`]: the per-subscription [`ProvisioningContext`] with validated,
//!   copy-on-write transitions and migration resource promotion
//! - [`pipeline`]: the static step graphs for every [`ProvisioningMode`]
//! - [`state`]: the coarse server-level [`ProvisioningState`] adjacency table
//! - [`job`]: durable asynchronous work items with dedup keys and retry budgets
//! - [`persistence`]: the repository trait with SQLite and PostgreSQL backends,
//!   including the atomic claim, dedup-insert and mutual-exclusion primitives
//!
//! # Pipeline Shape
//!
//! ```text
//!  CREATE / MIGRATE_CREATE                      DESTROY / MIGRATE_DESTROY
//!
//!  NEW ─► ALLOCATE_NODE ─► CLOUD_NODE ─┐        READY ─► FINALISE ─► START_SERVER ─► ...
//!                      └─► DEDICATED_NODE ─┤        ... ─► A_RECORD ─► CLOUD_NODE|DEDICATED_NODE
//!  A_RECORD ◄──────────────────────────────┘        ─► ALLOCATE_NODE ─► NEW (COMPLETED)
//!  ─► PTERODACTYL_NODE ─► CONFIGURE_NODE
//!  ─► PTERODACTYL_ALLOCATION ─► PTERODACTYL_SERVER
//!  ─► C_NAME_RECORD ─► [TRANSFER_DATA] ─► START_SERVER
//!  ─► FINALISE ─► READY (COMPLETED)
//! ```
//!
//! # Job Status State Machine
//!
//! ```text
//!   PENDING ──claim──► RUNNING ──ok──► COMPLETED ──retention──► archived
//!                       │  ▲
//!              fail,    │  │ claim
//!          budget left  ▼  │
//!                     RETRYING
//!                       │
//!         budget spent  ▼
//!                   DEAD_LETTER
//! ```

#![deny(missing_docs)]

macro_rules! string_enum {
    ($ty:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// The stable string stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::error::ParseEnumError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err($crate::error::ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use string_enum;

/// Provisioning context, resource slots, and server specification.
pub mod context;

/// Error types for persistence and decoding.
pub mod error;

/// Durable job records.
pub mod job;

/// Embedded database migrations for SQLite and PostgreSQL.
pub mod migrations;

/// Repository trait and database backends.
pub mod persistence;

/// Static step graphs per provisioning mode.
pub mod pipeline;

/// Server-level provisioning state machine.
pub mod state;

pub use context::{
    ContextError, ContextStatus, NodeClass, ProvisioningContext, ProvisioningMode, ResourceIds,
    ResourceKind, ServerSpec, Slot, StepType,
};
pub use error::CoreError;
pub use job::{Job, JobStatus, JobType, NewJob};
pub use persistence::Persistence;
pub use state::ProvisioningState;

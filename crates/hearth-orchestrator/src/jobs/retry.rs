// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff between job attempts.

use std::time::Duration;

/// `base * 2^retry_count`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(1800),
        }
    }
}

impl RetryPolicy {
    /// Load from environment variables.
    ///
    /// Environment variables:
    /// - `HEARTH_RETRY_BASE_SECS`: delay after the first failure (default: 30)
    /// - `HEARTH_RETRY_MAX_SECS`: cap on any delay (default: 1800)
    pub fn from_env() -> Self {
        let base = std::env::var("HEARTH_RETRY_BASE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let max = std::env::var("HEARTH_RETRY_MAX_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1800);
        Self {
            base: Duration::from_secs(base),
            max: Duration::from_secs(max),
        }
    }

    /// Delay before the attempt that follows `retry_count` earlier failures.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

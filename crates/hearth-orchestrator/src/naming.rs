// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic provider resource names.
//!
//! Every resource the pipeline creates is named from the subscription id and
//! the context generation, so a step that crashed after the provider call but
//! before persisting can find its resource again by name. Reconcilers only
//! touch resources carrying [`MANAGED_PREFIX`].

use sha2::{Digest, Sha256};

/// Prefix on every resource name this orchestrator owns.
pub const MANAGED_PREFIX: &str = "hearth-";

const SLUG_MAX: usize = 24;
const HASH_LEN: usize = 8;

/// DNS- and hostname-safe identifier for a subscription.
///
/// Keeps a readable part of the id and appends a short hash so two ids that
/// sanitize to the same text still differ.
pub fn subscription_slug(subscription_id: &str) -> String {
    let readable: String = subscription_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let readable: String = readable
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(SLUG_MAX)
        .collect();
    let readable = readable.trim_end_matches('-');

    let digest = Sha256::digest(subscription_id.as_bytes());
    let hash: String = digest
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();

    if readable.is_empty() {
        hash
    } else {
        format!("{}-{}", readable, hash)
    }
}

/// Name shared by the node, panel node, panel server and A record of one
/// generation.
pub fn resource_name(subscription_id: &str, generation: i64) -> String {
    format!(
        "{}{}-g{}",
        MANAGED_PREFIX,
        subscription_slug(subscription_id),
        generation
    )
}

/// Customer-facing CNAME label. Stable across migrations.
pub fn customer_record_name(subscription_id: &str) -> String {
    format!("{}{}", MANAGED_PREFIX, subscription_slug(subscription_id))
}

/// Whether a provider resource name belongs to this orchestrator.
pub fn is_managed(name: &str) -> bool {
    name.starts_with(MANAGED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        assert_eq!(resource_name("sub_42", 0), resource_name("sub_42", 0));
        assert_ne!(resource_name("sub_42", 0), resource_name("sub_42", 1));
        assert_ne!(resource_name("sub_42", 0), resource_name("sub_43", 0));
    }

    #[test]
    fn test_slug_is_hostname_safe() {
        let slug = subscription_slug("Sub__With Spaces/and.Dots!!");
        assert!(
            slug.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
        assert!(!slug.starts_with('-'));
        assert!(!slug.contains("--"));
        assert!(slug.starts_with("sub-with-spaces-and-dots"));
    }

    #[test]
    fn test_sanitized_collisions_still_differ() {
        assert_ne!(subscription_slug("a.b"), subscription_slug("a_b"));
    }

    #[test]
    fn test_long_ids_are_truncated() {
        let slug = subscription_slug(&"x".repeat(200));
        assert!(slug.len() <= SLUG_MAX + 1 + HASH_LEN);
    }

    #[test]
    fn test_symbol_only_id_falls_back_to_hash() {
        assert_eq!(subscription_slug("!!!").len(), HASH_LEN);
    }

    #[test]
    fn test_managed_prefix() {
        assert!(is_managed(&resource_name("s", 3)));
        assert!(is_managed(&customer_record_name("s")));
        assert!(!is_managed("customer-owned-box"));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend tests.
//!
//! Run with `TEST_HEARTH_DATABASE_URL=postgres://... cargo test -p hearth-core`.
//! Every test uses unique subscription ids so they can share one database.

use chrono::{Duration, Utc};
use hearth_core::context::{NodeClass, ResourceKind, ServerSpec, StepType};
use hearth_core::job::{EnqueueOutcome, JobStatus, JobType, NewJob};
use hearth_core::persistence::{Persistence, PostgresPersistence};
use hearth_core::{ProvisioningContext, migrations};
use sqlx::PgPool;
use uuid::Uuid;

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_HEARTH_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_HEARTH_DATABASE_URL not set");
            return;
        }
    };
}

async fn persistence() -> PostgresPersistence {
    let url = std::env::var("TEST_HEARTH_DATABASE_URL").expect("TEST_HEARTH_DATABASE_URL");
    let pool = PgPool::connect(&url).await.expect("connect");
    migrations::run_postgres(&pool).await.expect("migrate");
    PostgresPersistence::new(pool)
}

fn spec() -> ServerSpec {
    ServerSpec {
        region: "fsn1".to_string(),
        size_class: "cx32".to_string(),
        node_class: NodeClass::Dedicated,
        image: "debian-12".to_string(),
        egg_id: 1,
        memory_mb: 2048,
        disk_mb: 10240,
        cpu_limit: 100,
        game_port: 27015,
    }
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[tokio::test]
async fn test_context_round_trip() {
    skip_if_no_db!();
    let db = persistence().await;
    let sub = unique("sub");

    let ctx = ProvisioningContext::new(sub.clone(), spec())
        .transition(StepType::AllocateNode)
        .unwrap()
        .transition(StepType::DedicatedNode)
        .unwrap()
        .with_resource(ResourceKind::Node, "metal-1")
        .unwrap();
    let saved = db.save_context(&ctx).await.unwrap();
    // Saving the unsaved copy again loses against the stored version
    assert!(db.save_context(&ctx).await.unwrap_err().is_conflict());
    let saved = db.save_context(&saved).await.unwrap();

    let loaded = db.load_context(&sub).await.unwrap().unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(loaded.version(), 2);
    assert_eq!(db.list_transitions(&sub).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_enqueue_dedup_and_claim() {
    skip_if_no_db!();
    let db = persistence().await;
    let sub = unique("sub");
    let job = NewJob::new(JobType::Provision, sub.clone(), 3);

    let first = db.enqueue_job(&job, None).await.unwrap();
    let id = first.job_id().unwrap().to_string();
    assert_eq!(
        db.enqueue_job(&job, None).await.unwrap(),
        EnqueueOutcome::Deduplicated
    );

    // Claim everything eligible; our job must be among the claimed rows exactly once
    let claimed = db
        .claim_jobs(JobStatus::Pending, 1000, Utc::now())
        .await
        .unwrap();
    let ours: Vec<_> = claimed.iter().filter(|j| j.job_id == id).collect();
    assert_eq!(ours.len(), 1);
    let claim_id = ours[0].claim_id.clone().unwrap();

    let again = db
        .claim_jobs(JobStatus::Pending, 1000, Utc::now())
        .await
        .unwrap();
    assert!(again.iter().all(|j| j.job_id != id));

    assert!(!db.complete_job(&id, "someone-else").await.unwrap());
    assert!(
        db.update_job_for_retry(&id, &claim_id, 1, Utc::now() - Duration::seconds(1), "boom")
            .await
            .unwrap()
    );
    let job = db.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.retry_count, 1);
    assert!(job.claim_id.is_none());
}

#[tokio::test]
async fn test_lock_exclusion() {
    skip_if_no_db!();
    let db = persistence().await;
    let name = unique("lock");
    let ttl = Duration::minutes(1);

    assert!(db.try_acquire_lock(&name, "a", ttl).await.unwrap());
    assert!(!db.try_acquire_lock(&name, "b", ttl).await.unwrap());
    assert!(db.release_lock(&name, "a").await.unwrap());
    assert!(db.try_acquire_lock(&name, "b", ttl).await.unwrap());
    assert!(db.release_lock(&name, "b").await.unwrap());
}

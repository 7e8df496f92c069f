// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the job worker pool against a shared file-backed database.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use hearth_core::job::{Job, JobStatus, JobType};
use hearth_core::persistence::{Persistence, SqlitePersistence};
use hearth_orchestrator::jobs::{
    JobProcessor, JobQueue, JobWorker, JobWorkerConfig, ProcessorError, ProcessorRegistry,
};
use tokio::sync::Mutex;

/// Records every job id it is handed.
#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl JobProcessor for Recording {
    fn job_type(&self) -> JobType {
        JobType::Provision
    }

    async fn process(&self, job: &Job) -> Result<(), ProcessorError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.seen.lock().await.push(job.job_id.clone());
        Ok(())
    }
}

fn pool_worker(store: &Arc<dyn Persistence>, processor: Arc<Recording>) -> JobWorker {
    JobWorker::new(
        store.clone(),
        ProcessorRegistry::new().register(processor),
        immediate_retry(),
        JobWorkerConfig {
            pool_size: 4,
            ..Default::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_never_share_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Persistence> = Arc::new(
        SqlitePersistence::from_path(dir.path().join("jobs.db"))
            .await
            .unwrap(),
    );
    let queue = JobQueue::new(store.clone(), 3);
    for i in 0..30 {
        queue
            .enqueue(JobType::Provision, &format!("sub-{}", i), None, None)
            .await
            .unwrap();
    }

    let first = Arc::new(Recording::default());
    let second = Arc::new(Recording::default());
    let a = pool_worker(&store, first.clone());
    let b = pool_worker(&store, second.clone());

    for _ in 0..30 {
        let (x, y) = tokio::join!(a.poll_once(), b.poll_once());
        x.unwrap();
        y.unwrap();
        tokio::join!(a.drain(), b.drain());
        if queue.count_by_status(JobStatus::Completed).await.unwrap() == 30 {
            break;
        }
    }

    let mut all = first.seen.lock().await.clone();
    all.extend(second.seen.lock().await.iter().cloned());
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 30, "every job runs exactly once");
    assert_eq!(unique.len(), 30);
    assert_eq!(
        queue.count_by_status(JobStatus::Completed).await.unwrap(),
        30
    );
}

#[tokio::test]
async fn test_pending_claims_leave_room_for_retries() {
    let store = memory_store().await;
    let queue = JobQueue::new(store.clone(), 3);
    for i in 0..10 {
        queue
            .enqueue(JobType::Provision, &format!("sub-{}", i), None, None)
            .await
            .unwrap();
    }
    let processor = Arc::new(Recording::default());
    let worker = pool_worker(&store, processor.clone());

    // New work gets 70% of free capacity, rounded up; the rest is held for retries
    assert_eq!(worker.poll_once().await.unwrap(), 3);
    worker.drain().await;
    assert_eq!(
        queue.count_by_status(JobStatus::Completed).await.unwrap(),
        3
    );
    assert_eq!(processor.seen.lock().await.len(), 3);
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the embeddable runtime.

mod common;

use std::time::Duration;

use common::*;
use hearth_core::context::NodeClass;
use hearth_core::job::JobStatus;
use hearth_orchestrator::audit_worker::JobAuditWorkerConfig;
use hearth_orchestrator::jobs::JobWorkerConfig;
use hearth_orchestrator::providers::Providers;
use hearth_orchestrator::reconcile::ReconcileConfig;
use hearth_orchestrator::runtime::OrchestratorRuntime;

#[tokio::test]
async fn test_runtime_provisions_and_shuts_down() {
    let store = memory_store().await;
    let (providers, mocks) = Providers::mock();

    let runtime = OrchestratorRuntime::builder()
        .persistence(store.clone())
        .providers(providers)
        .step_settings(settings())
        .retry_policy(immediate_retry())
        .worker_config(JobWorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        })
        .audit_config(JobAuditWorkerConfig {
            enabled: false,
            ..Default::default()
        })
        .reconcile_config(ReconcileConfig {
            enabled: false,
            ..Default::default()
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());

    runtime
        .service()
        .request_create("sub-rt", spec(NodeClass::Cloud))
        .await
        .unwrap();

    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if runtime
                .queue()
                .count_by_status(JobStatus::Completed)
                .await
                .unwrap()
                == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "provisioning job did not complete in time");

    let context = runtime.service().context("sub-rt").await.unwrap().unwrap();
    assert!(context.is_terminal());
    assert_eq!(mocks.compute.node_ids().await.len(), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_requires_providers() {
    let err = OrchestratorRuntime::builder()
        .persistence(memory_store().await)
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("providers are required"));
}

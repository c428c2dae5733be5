//! Fan-out of one sync cycle over every enabled device

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::registry::DeviceRegistry;
use super::scheduler::SyncScheduler;
use super::types::{CycleSummary, SyncResult};

pub struct SyncOrchestrator {
    registry: Arc<DeviceRegistry>,
    scheduler: Arc<SyncScheduler>,
    limiter: Arc<Semaphore>,
}

impl SyncOrchestrator {
    /// `max_concurrency` device cycles run at once (at least one)
    pub fn new(scheduler: Arc<SyncScheduler>, max_concurrency: usize) -> Self {
        Self {
            registry: Arc::clone(scheduler.registry()),
            scheduler,
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Sync every enabled device. A failing device only affects its own
    /// result; the summary always covers every device attempted.
    pub async fn run_cycle(&self) -> CycleSummary {
        let started_at = Utc::now();
        let devices = self.registry.list_enabled();
        log::info!("[orchestrator] Starting cycle over {} devices", devices.len());

        let tasks: Vec<(String, JoinHandle<SyncResult>)> = devices
            .into_iter()
            .map(|device| {
                let scheduler = Arc::clone(&self.scheduler);
                let limiter = Arc::clone(&self.limiter);
                let device_id = device.id.clone();
                let task = tokio::spawn(async move {
                    let _permit = match limiter.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return SyncResult::failed(device.id, "cancelled"),
                    };
                    let outcome = scheduler.sync_now(&device.id).await;
                    outcome.unwrap_or_else(|e| SyncResult::failed(device.id, e.outcome_reason()))
                });
                (device_id, task)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (device_id, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    log::error!("[orchestrator] Task for {} did not complete: {}", device_id, e);
                    SyncResult::failed(device_id, format!("task-failed: {}", e))
                }
            };
            results.push(result);
        }

        let summary = CycleSummary::from_results(started_at, results);
        log::info!(
            "[orchestrator] Cycle done: {} attempted, {} ok, {} partial, {} failed, {} entries written, {} anomalies",
            summary.devices_attempted,
            summary.succeeded,
            summary.partially_failed,
            summary.failed,
            summary.entries_written,
            summary.anomalies
        );
        summary
    }
}

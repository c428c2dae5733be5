//! Sync scheduler
//!
//! Owns the per-device cycle: at most one running per device, concurrent
//! requests join the running one. A cycle connects, pulls, reconciles,
//! writes to the ledger and clears what the ledger accepted, retrying
//! transient device failures a bounded number of times.

use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::audit::AuditTrail;
use super::config::RetryConfig;
use super::driver::DeviceDriver;
use super::error::{LedgerError, Result, SyncError};
use super::ledger::{AttendanceLedger, EmployeeDirectory, WriteResult};
use super::orchestrator::SyncOrchestrator;
use super::reconciler::Reconciler;
use super::registry::{DeviceRegistry, DeviceSlot, InFlightCycle};
use super::session::DeviceSession;
use super::types::{Anomaly, AnomalyKind, Device, SyncOutcome, SyncResult, TriggerAck};

/// Extra attempts after a failed connect or fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

/// Counters filled in as an attempt progresses
#[derive(Debug, Default)]
struct CycleProgress {
    fetched: usize,
    reconciled: usize,
    written: usize,
    cleared: usize,
    anomalies: Vec<Anomaly>,
}

/// Clears the slot's in-flight cycle when the cycle task ends, however it ends
struct InFlightGuard(Arc<DeviceSlot>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        *self.0.in_flight.lock() = None;
    }
}

pub struct SyncScheduler {
    registry: Arc<DeviceRegistry>,
    driver: Arc<dyn DeviceDriver>,
    ledger: Arc<dyn AttendanceLedger>,
    directory: Arc<dyn EmployeeDirectory>,
    reconciler: Arc<Reconciler>,
    audit: Arc<AuditTrail>,
    retry: RetryPolicy,
    interval: Duration,
    cancel: CancellationToken,
}

impl SyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        driver: Arc<dyn DeviceDriver>,
        ledger: Arc<dyn AttendanceLedger>,
        directory: Arc<dyn EmployeeDirectory>,
        reconciler: Arc<Reconciler>,
        audit: Arc<AuditTrail>,
        retry: RetryPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            driver,
            ledger,
            directory,
            reconciler,
            audit,
            retry,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run (or join) a cycle for the device and wait for its result
    pub async fn sync_now(self: &Arc<Self>, device_id: &str) -> Result<SyncResult> {
        let (cycle, _) = self.join_or_start(device_id)?;
        Ok(cycle.await)
    }

    /// Start (or join) a cycle without waiting for it. Must be called
    /// from within a tokio runtime.
    pub fn request_sync(self: &Arc<Self>, device_id: &str) -> Result<TriggerAck> {
        let (_, started) = self.join_or_start(device_id)?;
        let device_id = device_id.to_string();
        Ok(if started {
            TriggerAck::Accepted { device_id }
        } else {
            TriggerAck::Coalesced { device_id }
        })
    }

    pub fn is_in_flight(&self, device_id: &str) -> bool {
        self.registry
            .slot(device_id)
            .map_or(false, |slot| slot.in_flight.lock().is_some())
    }

    /// Cancel running cycles and stop the periodic trigger
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("[scheduler] Shutting down");
            self.cancel.cancel();
        }
    }

    /// Run a full cycle every `interval` until shutdown. The first cycle
    /// starts immediately.
    pub fn start_periodic(&self, orchestrator: Arc<SyncOrchestrator>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("[scheduler] Periodic sync every {}s", period.as_secs());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = orchestrator.run_cycle().await;
                        log::info!(
                            "[scheduler] Periodic cycle done: {} ok, {} partial, {} failed",
                            summary.succeeded,
                            summary.partially_failed,
                            summary.failed
                        );
                    }
                }
            }
            log::info!("[scheduler] Periodic sync stopped");
        })
    }

    /// Returns the device's cycle and whether this call started it
    fn join_or_start(self: &Arc<Self>, device_id: &str) -> Result<(InFlightCycle, bool)> {
        let slot = self
            .registry
            .slot(device_id)
            .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))?;

        let mut in_flight = slot.in_flight.lock();
        if let Some(cycle) = in_flight.as_ref() {
            log::debug!("[scheduler] {} already syncing, joining", device_id);
            return Ok((cycle.clone(), false));
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let device = slot.device();
        let scheduler = Arc::clone(self);
        let guard = InFlightGuard(Arc::clone(&slot));
        let task = tokio::spawn(async move {
            let _guard = guard;
            let id = device.id.clone();
            let result = AssertUnwindSafe(scheduler.run_device_cycle(device))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    log::error!("[scheduler] Sync task for {} panicked", id);
                    SyncResult::failed(id.as_str(), "task-panicked")
                });
            scheduler.registry.record_result(&result.device_id, &result);
            scheduler.audit.append(result.clone());
            result
        });

        let id = device_id.to_string();
        let cycle: InFlightCycle = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => SyncResult::failed(id, format!("task-failed: {}", e)),
            }
        }
        .boxed()
        .shared();

        *in_flight = Some(cycle.clone());
        Ok((cycle, true))
    }

    async fn run_device_cycle(&self, device: Device) -> SyncResult {
        let cycle_at = Utc::now();
        let started = Instant::now();
        log::info!("[scheduler] Syncing {} ({})", device.id, device.endpoint());

        let mut attempts = 0;
        let mut progress: CycleProgress;
        let outcome = loop {
            attempts += 1;
            progress = CycleProgress::default();
            match self.attempt(&device, &mut progress).await {
                Ok(outcome) => break outcome,
                Err(e) if e.is_retryable() && attempts <= self.retry.max_retries => {
                    log::warn!(
                        "[scheduler] {} attempt {} failed: {} (retrying in {}ms)",
                        device.id,
                        attempts,
                        e,
                        self.retry.delay.as_millis()
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            break SyncOutcome::Failure(SyncError::Cancelled.outcome_reason());
                        }
                        _ = tokio::time::sleep(self.retry.delay) => {}
                    }
                }
                Err(e) => {
                    log::error!(
                        "[scheduler] {} sync failed after {} attempt(s): {}",
                        device.id,
                        attempts,
                        e
                    );
                    break SyncOutcome::Failure(e.outcome_reason());
                }
            }
        };

        let result = SyncResult {
            device_id: device.id.clone(),
            cycle_at,
            records_fetched: progress.fetched,
            records_reconciled: progress.reconciled,
            records_written: progress.written,
            records_cleared: progress.cleared,
            anomalies: progress.anomalies,
            outcome,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        log::info!(
            "[scheduler] {} finished: {} fetched, {} written, {} cleared, {} anomalies ({}ms)",
            device.id,
            result.records_fetched,
            result.records_written,
            result.records_cleared,
            result.anomalies.len(),
            result.duration_ms
        );
        result
    }

    /// One attempt; the session is closed on every path out
    async fn attempt(&self, device: &Device, progress: &mut CycleProgress) -> Result<SyncOutcome> {
        let mut session = DeviceSession::new(device.clone(), Arc::clone(&self.driver));
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.drive(&mut session, progress) => result,
        };
        session.close().await;
        result
    }

    async fn drive(
        &self,
        session: &mut DeviceSession,
        progress: &mut CycleProgress,
    ) -> Result<SyncOutcome> {
        let device = session.device().clone();

        session.open().await?;
        let info = session.fetch_device_info().await?;
        log::info!(
            "[scheduler] {} serial {} firmware {} ({} users, {} records on device)",
            device.id,
            info.serial_number,
            info.firmware_version,
            info.user_count,
            info.log_count
        );
        let users = session.fetch_users().await?;
        let records = session.fetch_punch_records().await?;
        progress.fetched = records.len();

        self.directory.refresh_device_users(&device.id, &users).await;

        let user_ids: BTreeSet<&str> = records.iter().map(|r| r.device_user_id.as_str()).collect();
        let mut employees = HashMap::new();
        for user_id in user_ids {
            if let Some(employee_id) = self.directory.resolve_employee(&device.id, user_id).await {
                employees.insert(user_id.to_string(), employee_id);
            }
        }

        // Cycles on other devices touching the same employees wait here
        // until this one has committed.
        let lease = self.reconciler.lease_employees(employees.values()).await;
        let plan = self.reconciler.plan(&device.id, &records, &employees);
        progress.reconciled = plan.reconciled;
        progress.anomalies = plan.anomalies.clone();

        let write = if plan.entries.is_empty() {
            WriteResult::default()
        } else {
            let write = self.ledger.upsert_entries(&plan.entries).await?;
            if write.outcomes.len() != plan.entries.len() {
                return Err(LedgerError::new(format!(
                    "ledger returned {} outcomes for {} entries",
                    write.outcomes.len(),
                    plan.entries.len()
                ))
                .into());
            }
            write
        };
        let commit = self.reconciler.commit(&plan, &write);
        drop(lease);
        progress.written = commit.written;
        progress.anomalies.extend(commit.anomalies.iter().cloned());

        let mut problems = Vec::new();
        if !commit.rejected.is_empty() {
            problems.push(format!(
                "ledger-rejected: {} of {} entries",
                commit.rejected.len(),
                plan.entries.len()
            ));
        }

        match commit.clear_permit {
            Some(permit) if device.clear_after_sync => match session.confirm_clear(permit).await {
                Ok(cleared) => progress.cleared = cleared,
                Err(e) => {
                    log::warn!("[scheduler] {} clear failed: {}", device.id, e);
                    problems.push(format!("clear-failed: {}", e));
                }
            },
            Some(permit) => {
                log::debug!(
                    "[scheduler] {} keeps {} records (clear disabled)",
                    device.id,
                    permit.len()
                );
            }
            None => {}
        }

        for kind in [AnomalyKind::UnterminatedSession, AnomalyKind::OverlappingPunch] {
            if progress.anomalies.iter().any(|a| a.kind == kind) {
                problems.push(kind.to_string());
            }
        }

        Ok(if problems.is_empty() {
            SyncOutcome::Success
        } else {
            SyncOutcome::PartialFailure(problems.join("; "))
        })
    }
}

//! Horus device sync
//!
//! Keeps the central attendance ledger in step with the biometric terminals
//! on the network. [`SyncEngine`] wires the pieces together; hosts supply a
//! [`DeviceDriver`], an [`AttendanceLedger`] and an [`EmployeeDirectory`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

mod sync;

pub use sync::audit::AuditTrail;
pub use sync::config::{validate_device, DeviceConfig, RetryConfig, SyncConfig};
pub use sync::dedup::{DedupIndex, DedupSnapshot, SyncedKey};
pub use sync::driver::{DeviceDriver, DriverConnection};
pub use sync::error::{ConfigError, DriverError, LedgerError, Result, RetryClass, SyncError};
pub use sync::ledger::{
    AttendanceLedger, EmployeeDirectory, EntryWriteOutcome, MemoryDirectory, MemoryLedger,
    WriteResult,
};
pub use sync::orchestrator::SyncOrchestrator;
pub use sync::reconciler::{ClearPermit, CommitOutcome, EmployeeLease, ReconcilePlan, Reconciler};
pub use sync::registry::{DeviceRegistry, DeviceStatus};
pub use sync::scheduler::{RetryPolicy, SyncScheduler};
pub use sync::session::{DeviceSession, SessionState};
pub use sync::types::*;

/// The assembled engine: registry, scheduler, orchestrator and audit trail
pub struct SyncEngine {
    registry: Arc<DeviceRegistry>,
    reconciler: Arc<Reconciler>,
    ledger: Arc<dyn AttendanceLedger>,
    audit: Arc<AuditTrail>,
    scheduler: Arc<SyncScheduler>,
    orchestrator: Arc<SyncOrchestrator>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        driver: Arc<dyn DeviceDriver>,
        ledger: Arc<dyn AttendanceLedger>,
        directory: Arc<dyn EmployeeDirectory>,
    ) -> std::result::Result<Self, ConfigError> {
        Self::with_dedup(config, driver, ledger, directory, Arc::new(DedupIndex::new()))
    }

    /// Build with a dedup index restored from an earlier run
    pub fn with_dedup(
        config: &SyncConfig,
        driver: Arc<dyn DeviceDriver>,
        ledger: Arc<dyn AttendanceLedger>,
        directory: Arc<dyn EmployeeDirectory>,
        dedup: Arc<DedupIndex>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(DeviceRegistry::from_devices(config.devices()));
        let reconciler = Arc::new(Reconciler::new(dedup));
        let audit = Arc::new(AuditTrail::new(config.audit_history));
        let scheduler = Arc::new(SyncScheduler::new(
            Arc::clone(&registry),
            driver,
            Arc::clone(&ledger),
            directory,
            Arc::clone(&reconciler),
            Arc::clone(&audit),
            RetryPolicy::from(&config.retry),
            config.interval(),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&scheduler),
            config.max_concurrency,
        ));

        log::info!(
            "[engine] Configured {} devices, sync every {}s, {} at a time",
            config.devices.len(),
            config.interval_secs,
            config.max_concurrency
        );

        Ok(Self {
            registry,
            reconciler,
            ledger,
            audit,
            scheduler,
            orchestrator,
            periodic: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncResult> {
        self.audit.subscribe()
    }

    pub fn dedup_snapshot(&self) -> DedupSnapshot {
        self.reconciler.dedup().snapshot()
    }

    /// Pick up entries the ledger still holds open so later exits pair with them
    pub async fn restore_open_entries(&self) -> Result<usize> {
        let open = self.ledger.open_entries().await?;
        Ok(self.reconciler.restore_open_entries(&open))
    }

    /// Start the periodic trigger; a no-op if it is already running
    pub fn start(&self) {
        let mut periodic = self.periodic.lock();
        if periodic.is_some() {
            log::debug!("[engine] Periodic sync already running");
            return;
        }
        *periodic = Some(self.scheduler.start_periodic(Arc::clone(&self.orchestrator)));
    }

    pub async fn sync_now(&self, device_id: &str) -> Result<SyncResult> {
        self.scheduler.sync_now(device_id).await
    }

    pub fn request_sync(&self, device_id: &str) -> Result<TriggerAck> {
        self.scheduler.request_sync(device_id)
    }

    pub async fn run_cycle(&self) -> CycleSummary {
        self.orchestrator.run_cycle().await
    }

    /// Cancel running cycles and wait for the periodic trigger to stop
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        let periodic = self.periodic.lock().take();
        if let Some(handle) = periodic {
            if let Err(e) = handle.await {
                log::warn!("[engine] Periodic task ended abnormally: {}", e);
            }
        }
    }
}

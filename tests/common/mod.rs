#![allow(dead_code)]

use async_trait::async_trait;
use horus_sync::{
    AttendanceLedger, Device, DeviceConfig, DeviceDriver, DeviceInfo, DriverConnection,
    DriverError, EntryWriteOutcome, LedgerEntry, LedgerError, MemoryDirectory, MemoryLedger,
    PunchRecordId, RawPunchRecord, RawUser, RetryConfig, SyncConfig, SyncEngine, WriteResult,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const T: i64 = 1_717_228_800;
pub const IN: u8 = 0;
pub const OUT: u8 = 1;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records and users resident on one simulated terminal
#[derive(Default)]
struct Terminal {
    records: Vec<RawPunchRecord>,
    users: Vec<RawUser>,
    connect_failures: usize,
    fetch_failures: usize,
}

/// Driver backed by in-memory terminals with scripted failures
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<DriverState>,
}

#[derive(Default)]
pub struct DriverState {
    terminals: Mutex<HashMap<String, Terminal>>,
    connects: Mutex<HashMap<String, usize>>,
    disconnects: AtomicUsize,
    open_sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    fail_clear: AtomicBool,
    hang_disconnect: AtomicBool,
    cleared: Mutex<Vec<(String, PunchRecordId)>>,
}

impl std::ops::Deref for MockDriver {
    type Target = DriverState;

    fn deref(&self) -> &DriverState {
        &self.state
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, device_id: &str, records: Vec<RawPunchRecord>) {
        let mut terminals = self.terminals.lock();
        let terminal = terminals.entry(device_id.to_string()).or_default();
        for record in &records {
            if !terminal.users.iter().any(|u| u.device_user_id == record.device_user_id) {
                terminal.users.push(RawUser {
                    device_user_id: record.device_user_id.clone(),
                    name: String::new(),
                });
            }
        }
        terminal.records.extend(records);
    }

    /// Fail the next `count` connects to the device
    pub fn fail_connects(&self, device_id: &str, count: usize) {
        self.terminals
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .connect_failures = count;
    }

    /// Fail the next `count` punch record downloads from the device
    pub fn fail_fetches(&self, device_id: &str, count: usize) {
        self.terminals
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .fetch_failures = count;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn set_fail_clear(&self, fail: bool) {
        self.fail_clear.store(fail, Ordering::SeqCst);
    }

    pub fn set_hang_disconnect(&self, hang: bool) {
        self.hang_disconnect.store(hang, Ordering::SeqCst);
    }

    /// Most connections that were open at the same time
    pub fn peak_sessions(&self) -> usize {
        self.peak_sessions.load(Ordering::SeqCst)
    }

    pub fn connects(&self, device_id: &str) -> usize {
        self.connects.lock().get(device_id).copied().unwrap_or(0)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn remaining(&self, device_id: &str) -> Vec<RawPunchRecord> {
        self.terminals
            .lock()
            .get(device_id)
            .map(|t| t.records.clone())
            .unwrap_or_default()
    }

    pub fn cleared(&self) -> Vec<(String, PunchRecordId)> {
        self.cleared.lock().clone()
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    async fn connect(
        &self,
        device: &Device,
        _timeout: Duration,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        *self.connects.lock().entry(device.id.clone()).or_default() += 1;
        {
            let mut terminals = self.terminals.lock();
            let terminal = terminals.entry(device.id.clone()).or_default();
            if terminal.connect_failures > 0 {
                terminal.connect_failures -= 1;
                return Err(DriverError::connect("Connection refused (os error 111)"));
            }
        }
        let open = self.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_sessions.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            device_id: device.id.clone(),
            driver: self.clone(),
            closed: false,
        }))
    }
}

struct MockConnection {
    device_id: String,
    driver: MockDriver,
    closed: bool,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn get_info(&mut self) -> Result<DeviceInfo, DriverError> {
        let terminals = self.driver.terminals.lock();
        let (users, logs) = terminals
            .get(&self.device_id)
            .map(|t| (t.users.len(), t.records.len()))
            .unwrap_or((0, 0));
        Ok(DeviceInfo {
            serial_number: format!("SN-{}", self.device_id),
            firmware_version: "Ver 6.60 Apr 28 2017".to_string(),
            user_count: users as u32,
            log_count: logs as u32,
        })
    }

    async fn get_users(&mut self) -> Result<Vec<RawUser>, DriverError> {
        Ok(self
            .driver
            .terminals
            .lock()
            .get(&self.device_id)
            .map(|t| t.users.clone())
            .unwrap_or_default())
    }

    async fn get_punch_records(&mut self) -> Result<Vec<RawPunchRecord>, DriverError> {
        let delay = *self.driver.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut terminals = self.driver.terminals.lock();
            let terminal = terminals.entry(self.device_id.clone()).or_default();
            if terminal.fetch_failures > 0 {
                terminal.fetch_failures -= 1;
                return Err(DriverError::protocol("unexpected reply to CMD_ATTLOG_RRQ"));
            }
        }
        Ok(self.driver.remaining(&self.device_id))
    }

    async fn clear_punch_records(&mut self, records: &[PunchRecordId]) -> Result<(), DriverError> {
        if self.driver.fail_clear.load(Ordering::SeqCst) {
            return Err(DriverError::protocol("clear command not acknowledged"));
        }
        let mut terminals = self.driver.terminals.lock();
        if let Some(terminal) = terminals.get_mut(&self.device_id) {
            terminal.records.retain(|r| !records.contains(&r.record_id()));
        }
        self.driver.cleared.lock().extend(
            records
                .iter()
                .cloned()
                .map(|id| (self.device_id.clone(), id)),
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.driver.open_sessions.fetch_sub(1, Ordering::SeqCst);
        if self.driver.hang_disconnect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.driver.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memory ledger that can reject one employee's entries or refuse every write
#[derive(Default)]
pub struct MockLedger {
    inner: MemoryLedger,
    reject_employee: Mutex<Option<String>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
    write_delay: Mutex<Duration>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_employee(&self, employee_id: Option<&str>) {
        *self.reject_employee.lock() = employee_id.map(str::to_string);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.entries()
    }

    pub fn entries_for(&self, employee_id: &str) -> Vec<LedgerEntry> {
        self.inner.entries_for(employee_id)
    }

    pub async fn seed(&self, entries: &[LedgerEntry]) {
        self.inner
            .upsert_entries(entries)
            .await
            .expect("memory ledger accepts writes");
    }
}

#[async_trait]
impl AttendanceLedger for MockLedger {
    async fn upsert_entries(&self, entries: &[LedgerEntry]) -> Result<WriteResult, LedgerError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::new("database is locked"));
        }
        let reject = self.reject_employee.lock().clone();
        let (accepted, rejected): (Vec<(usize, &LedgerEntry)>, Vec<(usize, &LedgerEntry)>) =
            entries
                .iter()
                .enumerate()
                .partition(|(_, e)| Some(&e.employee_id) != reject.as_ref());

        let accepted_entries: Vec<LedgerEntry> =
            accepted.iter().map(|(_, e)| (*e).clone()).collect();
        self.inner.upsert_entries(&accepted_entries).await?;

        let mut outcomes = vec![EntryWriteOutcome::Accepted; entries.len()];
        for (index, _) in rejected {
            outcomes[index] = EntryWriteOutcome::Rejected("employee is archived".to_string());
        }
        Ok(WriteResult { outcomes })
    }

    async fn open_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.inner.open_entries().await
    }
}

pub fn device_config(id: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        name: String::new(),
        address: "192.168.1.201".to_string(),
        port: 4370,
        comm_key: None,
        timeout: 10_000,
        enabled: true,
        clear_after_sync: true,
    }
}

pub fn config(devices: Vec<DeviceConfig>) -> SyncConfig {
    SyncConfig {
        interval_secs: 1,
        max_concurrency: 2,
        retry: RetryConfig {
            max_retries: 2,
            delay_ms: 10,
        },
        audit_history: 50,
        devices,
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub driver: MockDriver,
    pub ledger: Arc<MockLedger>,
    pub directory: Arc<MemoryDirectory>,
}

pub fn harness(devices: Vec<DeviceConfig>) -> Harness {
    init_logging();
    let driver = MockDriver::new();
    let ledger = MockLedger::new();
    let directory = Arc::new(MemoryDirectory::new());
    let engine = SyncEngine::new(
        &config(devices),
        Arc::new(driver.clone()),
        ledger.clone(),
        directory.clone(),
    )
    .expect("valid test config");
    Harness {
        engine,
        driver,
        ledger,
        directory,
    }
}

pub fn punch(user: &str, offset: i64, status: u8) -> RawPunchRecord {
    RawPunchRecord::new(user, T + offset, status)
}

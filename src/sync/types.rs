//! Data types shared across the sync engine

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Employee identifier in the central ledger
pub type EmployeeId = String;

/// A terminal known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comm_key: Option<String>,
    pub clear_after_sync: bool,
}

impl Device {
    /// Upper bound for every driver call made against this device
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Last-sync bookkeeping kept by the registry for each device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncState {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<SyncOutcome>,
    pub consecutive_failures: u32,
}

/// Device identity and firmware metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub serial_number: String,
    pub firmware_version: String,
    pub user_count: u32,
    pub log_count: u32,
}

/// A user enrolled on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUser {
    pub device_user_id: String,
    pub name: String,
}

impl RawUser {
    /// Name to show for the user; terminals often store blank names
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("User {}", self.device_user_id)
        } else {
            self.name.trim().to_string()
        }
    }
}

/// A punch record as stored on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPunchRecord {
    pub device_user_id: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    pub verify_type: u8,
    pub status: u8,
}

impl RawPunchRecord {
    pub fn new(device_user_id: impl Into<String>, timestamp: i64, status: u8) -> Self {
        Self {
            device_user_id: device_user_id.into(),
            timestamp,
            verify_type: 0,
            status,
        }
    }

    pub fn kind(&self) -> PunchKind {
        PunchKind::from_status(self.status)
    }

    pub fn record_id(&self) -> PunchRecordId {
        PunchRecordId {
            device_user_id: self.device_user_id.clone(),
            timestamp: self.timestamp,
            status: self.status,
        }
    }

    pub fn dedup_key(&self, device_id: &str) -> DedupKey {
        DedupKey {
            device_id: device_id.to_string(),
            device_user_id: self.device_user_id.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

/// Direction of a punch, derived from the terminal's raw status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PunchKind {
    CheckIn,
    CheckOut,
    Unknown(u8),
}

impl PunchKind {
    /// Terminal punch states: 0 check-in, 1 check-out, 2 break-out,
    /// 3 break-in, 4 overtime-in, 5 overtime-out.
    pub fn from_status(status: u8) -> Self {
        match status {
            0 | 3 | 4 => PunchKind::CheckIn,
            1 | 2 | 5 => PunchKind::CheckOut,
            other => PunchKind::Unknown(other),
        }
    }

    /// Sort rank for identical timestamps: entries before exits
    pub fn tie_rank(&self) -> u8 {
        match self {
            PunchKind::CheckIn => 0,
            PunchKind::CheckOut => 1,
            PunchKind::Unknown(_) => 2,
        }
    }
}

/// Identifies a record on the device for clearing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchRecordId {
    pub device_user_id: String,
    pub timestamp: i64,
    /// An entry and an exit may share a second
    pub status: u8,
}

/// (device, device-local user, raw timestamp): contributes to the ledger at most once
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupKey {
    pub device_id: String,
    pub device_user_id: String,
    pub timestamp: i64,
}

impl DedupKey {
    pub fn record_id(&self, status: u8) -> PunchRecordId {
        PunchRecordId {
            device_user_id: self.device_user_id.clone(),
            timestamp: self.timestamp,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryStatus {
    /// Checked in, no exit yet
    Open,
    Closed,
    /// Superseded by a later check-in without ever seeing an exit
    Unterminated,
}

/// Upsert identity of a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryKey {
    pub employee_id: EmployeeId,
    pub device_id: String,
    pub entry_time: DateTime<Utc>,
}

/// A reconciled attendance interval written to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub employee_id: EmployeeId,
    pub device_id: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    /// Raw records this entry was built from
    pub source_keys: Vec<DedupKey>,
}

impl LedgerEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey {
            employee_id: self.employee_id.clone(),
            device_id: self.device_id.clone(),
            entry_time: self.entry_time,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == EntryStatus::Open
    }
}

/// Informational reconciliation findings; never abort a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    UnterminatedSession,
    OrphanExit,
    UnmappedUser,
    UnknownStatus,
    InvalidTimestamp,
    /// Check-in earlier than an interval already paired for the employee
    OverlappingPunch,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::UnterminatedSession => "unterminated-session",
            AnomalyKind::OrphanExit => "orphan-exit",
            AnomalyKind::UnmappedUser => "unmapped-user",
            AnomalyKind::UnknownStatus => "unknown-status",
            AnomalyKind::InvalidTimestamp => "invalid-timestamp",
            AnomalyKind::OverlappingPunch => "overlapping-punch",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub device_user_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<EmployeeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "camelCase")]
pub enum SyncOutcome {
    Success,
    PartialFailure(String),
    Failure(String),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Failure(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            SyncOutcome::Success => None,
            SyncOutcome::PartialFailure(reason) | SyncOutcome::Failure(reason) => Some(reason),
        }
    }
}

/// Result of one device cycle; appended to the audit trail, never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub device_id: String,
    pub cycle_at: DateTime<Utc>,
    pub records_fetched: usize,
    pub records_reconciled: usize,
    pub records_written: usize,
    pub records_cleared: usize,
    pub anomalies: Vec<Anomaly>,
    pub outcome: SyncOutcome,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl SyncResult {
    /// Result for a device whose cycle never produced one of its own
    pub fn failed(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            cycle_at: Utc::now(),
            records_fetched: 0,
            records_reconciled: 0,
            records_written: 0,
            records_cleared: 0,
            anomalies: Vec::new(),
            outcome: SyncOutcome::Failure(reason.into()),
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn anomaly_count(&self, kind: AnomalyKind) -> usize {
        self.anomalies.iter().filter(|a| a.kind == kind).count()
    }
}

/// Aggregate of one fan-out over all enabled devices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub devices_attempted: usize,
    pub succeeded: usize,
    pub partially_failed: usize,
    pub failed: usize,
    pub entries_written: usize,
    pub anomalies: usize,
    pub results: Vec<SyncResult>,
}

impl CycleSummary {
    pub fn from_results(started_at: DateTime<Utc>, results: Vec<SyncResult>) -> Self {
        let mut summary = Self {
            started_at,
            finished_at: Utc::now(),
            devices_attempted: results.len(),
            succeeded: 0,
            partially_failed: 0,
            failed: 0,
            entries_written: 0,
            anomalies: 0,
            results: Vec::new(),
        };
        for result in &results {
            match result.outcome {
                SyncOutcome::Success => summary.succeeded += 1,
                SyncOutcome::PartialFailure(_) => summary.partially_failed += 1,
                SyncOutcome::Failure(_) => summary.failed += 1,
            }
            summary.entries_written += result.records_written;
            summary.anomalies += result.anomalies.len();
        }
        summary.results = results;
        summary
    }
}

/// Response of the asynchronous "sync now" trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TriggerAck {
    /// A new cycle was started
    Accepted { device_id: String },
    /// A cycle was already running; the request joined it
    Coalesced { device_id: String },
}

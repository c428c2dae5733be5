//! Central ledger and employee directory
//!
//! Both are host-provided. The in-memory versions here back embedded hosts
//! and tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::error::LedgerError;
use super::types::{EmployeeId, EntryKey, LedgerEntry, RawUser};

/// Per-entry verdict from the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryWriteOutcome {
    Accepted,
    Rejected(String),
}

/// Verdicts in the same order as the submitted entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub outcomes: Vec<EntryWriteOutcome>,
}

impl WriteResult {
    pub fn all_accepted(count: usize) -> Self {
        Self {
            outcomes: vec![EntryWriteOutcome::Accepted; count],
        }
    }

    pub fn outcome(&self, index: usize) -> Option<&EntryWriteOutcome> {
        self.outcomes.get(index)
    }

    pub fn accepted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, EntryWriteOutcome::Accepted))
            .count()
    }

    pub fn rejected(&self) -> usize {
        self.outcomes.len() - self.accepted()
    }
}

#[async_trait]
pub trait AttendanceLedger: Send + Sync {
    /// Insert or replace entries by (employee, device, entry time).
    /// `Err` means nothing was written.
    async fn upsert_entries(&self, entries: &[LedgerEntry]) -> Result<WriteResult, LedgerError>;

    /// Entries still waiting for an exit punch
    async fn open_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait EmployeeDirectory: Send + Sync {
    async fn resolve_employee(&self, device_id: &str, device_user_id: &str) -> Option<EmployeeId>;

    /// Called with the users enrolled on a device after each pull
    async fn refresh_device_users(&self, _device_id: &str, _users: &[RawUser]) {}
}

/// Ledger kept in process memory
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<BTreeMap<EntryKey, LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn entries_for(&self, employee_id: &str) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.employee_id == employee_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl AttendanceLedger for MemoryLedger {
    async fn upsert_entries(&self, entries: &[LedgerEntry]) -> Result<WriteResult, LedgerError> {
        let mut stored = self.entries.write();
        let outcomes = entries
            .iter()
            .map(|entry| match entry.exit_time {
                Some(exit) if exit < entry.entry_time => {
                    EntryWriteOutcome::Rejected("exit time precedes entry time".to_string())
                }
                _ => {
                    stored.insert(entry.key(), entry.clone());
                    EntryWriteOutcome::Accepted
                }
            })
            .collect();
        Ok(WriteResult { outcomes })
    }

    async fn open_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.is_open())
            .cloned()
            .collect())
    }
}

/// Device-user to employee mapping kept in process memory.
/// Per-device mappings win over the shared badge mapping.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    shared: RwLock<HashMap<String, EmployeeId>>,
    per_device: RwLock<HashMap<(String, String), EmployeeId>>,
    names: RwLock<HashMap<(String, String), String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a badge number on every device
    pub fn link(&self, device_user_id: impl Into<String>, employee_id: impl Into<EmployeeId>) {
        self.shared
            .write()
            .insert(device_user_id.into(), employee_id.into());
    }

    pub fn link_on_device(
        &self,
        device_id: impl Into<String>,
        device_user_id: impl Into<String>,
        employee_id: impl Into<EmployeeId>,
    ) {
        self.per_device.write().insert(
            (device_id.into(), device_user_id.into()),
            employee_id.into(),
        );
    }

    pub fn unlink(&self, device_user_id: &str) {
        self.shared.write().remove(device_user_id);
    }

    /// Last name seen for a user on a device
    pub fn user_name(&self, device_id: &str, device_user_id: &str) -> Option<String> {
        self.names
            .read()
            .get(&(device_id.to_string(), device_user_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl EmployeeDirectory for MemoryDirectory {
    async fn resolve_employee(&self, device_id: &str, device_user_id: &str) -> Option<EmployeeId> {
        let scoped = self
            .per_device
            .read()
            .get(&(device_id.to_string(), device_user_id.to_string()))
            .cloned();
        scoped.or_else(|| self.shared.read().get(device_user_id).cloned())
    }

    async fn refresh_device_users(&self, device_id: &str, users: &[RawUser]) {
        let mut names = self.names.write();
        for user in users {
            names.insert(
                (device_id.to_string(), user.device_user_id.clone()),
                user.display_name(),
            );
        }
        log::debug!("[directory] {} users refreshed for {}", users.len(), device_id);
    }
}

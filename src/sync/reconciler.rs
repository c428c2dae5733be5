//! Punch reconciliation
//!
//! Turns raw device punches into ledger entries. Planning is pure and
//! synchronous; the reconciler's own state (synced keys, open sessions per
//! employee) only moves forward in `commit`, once the ledger has reported
//! which entries it accepted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::dedup::DedupIndex;
use super::ledger::{EntryWriteOutcome, WriteResult};
use super::types::{
    Anomaly, AnomalyKind, DedupKey, EmployeeId, EntryKey, EntryStatus, LedgerEntry, PunchKind,
    PunchRecordId, RawPunchRecord,
};

/// Per-employee pairing state carried between cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct EmployeeCursor {
    open: Option<OpenSession>,
    /// Latest exit time written for the employee
    closed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenSession {
    device_id: String,
    entry_time: DateTime<Utc>,
    source_keys: Vec<DedupKey>,
}

/// Entry being built during the walk
#[derive(Debug, Clone)]
struct Candidate {
    device_id: String,
    entry_time: DateTime<Utc>,
    exit_time: Option<DateTime<Utc>>,
    status: EntryStatus,
    source_keys: Vec<DedupKey>,
    dirty: bool,
}

impl Candidate {
    fn opened(device_id: &str, at: DateTime<Utc>, key: DedupKey) -> Self {
        Self {
            device_id: device_id.to_string(),
            entry_time: at,
            exit_time: None,
            status: EntryStatus::Open,
            source_keys: vec![key],
            dirty: true,
        }
    }

    fn resumed(session: &OpenSession) -> Self {
        Self {
            device_id: session.device_id.clone(),
            entry_time: session.entry_time,
            exit_time: None,
            status: EntryStatus::Open,
            source_keys: session.source_keys.clone(),
            dirty: false,
        }
    }

    fn into_entry(self, employee_id: &str) -> LedgerEntry {
        LedgerEntry {
            employee_id: employee_id.to_string(),
            device_id: self.device_id,
            entry_time: self.entry_time,
            exit_time: self.exit_time,
            status: self.status,
            source_keys: self.source_keys,
        }
    }

    fn as_open_session(&self) -> OpenSession {
        OpenSession {
            device_id: self.device_id.clone(),
            entry_time: self.entry_time,
            source_keys: self.source_keys.clone(),
        }
    }

    fn first_user(&self) -> String {
        self.source_keys
            .first()
            .map(|k| k.device_user_id.clone())
            .unwrap_or_default()
    }
}

/// Proof that a set of device records is durably persisted.
/// Only a fully accepted commit produces one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearPermit {
    device_id: String,
    records: Vec<PunchRecordId>,
}

impl ClearPermit {
    pub(crate) fn new(device_id: impl Into<String>, records: Vec<PunchRecordId>) -> Self {
        Self {
            device_id: device_id.into(),
            records,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn records(&self) -> &[PunchRecordId] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// What one batch of device records turns into
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    device_id: String,
    /// Entries to upsert, grouped by employee in time order
    pub entries: Vec<LedgerEntry>,
    pub anomalies: Vec<Anomaly>,
    /// Records from this batch that feed `entries`
    pub reconciled: usize,
    /// Records already persisted by an earlier cycle
    replayed: Vec<PunchRecordId>,
    new_keys: Vec<(DedupKey, u8)>,
    /// Cursors each employee was planned from, and where the plan leaves them
    bases: HashMap<EmployeeId, EmployeeCursor>,
    cursors: HashMap<EmployeeId, EmployeeCursor>,
}

impl ReconcilePlan {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn replayed(&self) -> &[PunchRecordId] {
        &self.replayed
    }

    pub fn has_anomaly(&self, kind: AnomalyKind) -> bool {
        self.anomalies.iter().any(|a| a.kind == kind)
    }
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub written: usize,
    pub rejected: Vec<(EntryKey, String)>,
    /// Raised for employees another device moved on while this plan was
    /// being written; their records are reconciled again next cycle
    pub anomalies: Vec<Anomaly>,
    /// Present only when every entry was accepted and applied
    pub clear_permit: Option<ClearPermit>,
}

/// Exclusive hold on some employees' pairing state, from plan to commit
pub struct EmployeeLease {
    _guards: Vec<OwnedMutexGuard<()>>,
}

pub struct Reconciler {
    dedup: Arc<DedupIndex>,
    cursors: Mutex<HashMap<EmployeeId, EmployeeCursor>>,
    leases: Mutex<HashMap<EmployeeId, Arc<AsyncMutex<()>>>>,
}

impl Reconciler {
    pub fn new(dedup: Arc<DedupIndex>) -> Self {
        Self {
            dedup,
            cursors: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until no other cycle holds any of `employees`.
    /// Locks are taken in id order so overlapping leases cannot deadlock.
    pub async fn lease_employees<'a>(
        &self,
        employees: impl IntoIterator<Item = &'a EmployeeId>,
    ) -> EmployeeLease {
        let ids: BTreeSet<&EmployeeId> = employees.into_iter().collect();
        let locks: Vec<Arc<AsyncMutex<()>>> = {
            let mut leases = self.leases.lock();
            ids.into_iter()
                .map(|id| Arc::clone(leases.entry(id.clone()).or_default()))
                .collect()
        };
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        EmployeeLease { _guards: guards }
    }

    pub fn dedup(&self) -> &Arc<DedupIndex> {
        &self.dedup
    }

    /// Seed open sessions from entries the ledger still holds open.
    /// Returns how many employees now have an open session.
    pub fn restore_open_entries(&self, entries: &[LedgerEntry]) -> usize {
        let mut cursors = self.cursors.lock();
        for entry in entries.iter().filter(|e| e.is_open()) {
            let cursor = cursors.entry(entry.employee_id.clone()).or_default();
            let newer = cursor
                .open
                .as_ref()
                .map_or(true, |open| entry.entry_time > open.entry_time);
            if newer {
                cursor.open = Some(OpenSession {
                    device_id: entry.device_id.clone(),
                    entry_time: entry.entry_time,
                    source_keys: entry.source_keys.clone(),
                });
            }
        }
        let restored = cursors.values().filter(|c| c.open.is_some()).count();
        log::info!("[reconciler] Restored {} open sessions", restored);
        restored
    }

    /// Device and entry time of the employee's open session, if any
    pub fn open_session(&self, employee_id: &str) -> Option<(String, DateTime<Utc>)> {
        self.cursors
            .lock()
            .get(employee_id)
            .and_then(|c| c.open.as_ref())
            .map(|open| (open.device_id.clone(), open.entry_time))
    }

    /// Build the entries for one device's batch of records.
    /// `employees` maps device user ids to employee ids.
    pub fn plan(
        &self,
        device_id: &str,
        records: &[RawPunchRecord],
        employees: &HashMap<String, EmployeeId>,
    ) -> ReconcilePlan {
        let mut plan = ReconcilePlan {
            device_id: device_id.to_string(),
            entries: Vec::new(),
            anomalies: Vec::new(),
            reconciled: 0,
            replayed: Vec::new(),
            new_keys: Vec::new(),
            bases: HashMap::new(),
            cursors: HashMap::new(),
        };

        let mut seen: HashSet<(DedupKey, u8)> = HashSet::new();
        let mut by_employee: BTreeMap<&str, Vec<(&RawPunchRecord, DateTime<Utc>, PunchKind)>> =
            BTreeMap::new();

        for record in records {
            let key = record.dedup_key(device_id);
            if !seen.insert((key.clone(), record.status)) {
                continue;
            }
            if self.dedup.is_synced(&key, record.status) {
                plan.replayed.push(record.record_id());
                continue;
            }

            let anomaly = |kind: AnomalyKind, employee_id: Option<&EmployeeId>| Anomaly {
                kind,
                device_user_id: record.device_user_id.clone(),
                timestamp: record.timestamp,
                employee_id: employee_id.cloned(),
            };

            let Some(employee_id) = employees.get(&record.device_user_id) else {
                plan.anomalies.push(anomaly(AnomalyKind::UnmappedUser, None));
                continue;
            };
            let Some(at) = record.time() else {
                plan.anomalies.push(anomaly(AnomalyKind::InvalidTimestamp, Some(employee_id)));
                continue;
            };
            let kind = record.kind();
            if let PunchKind::Unknown(_) = kind {
                plan.anomalies.push(anomaly(AnomalyKind::UnknownStatus, Some(employee_id)));
                continue;
            }
            by_employee
                .entry(employee_id.as_str())
                .or_default()
                .push((record, at, kind));
        }

        for (employee_id, mut punches) in by_employee {
            punches.sort_by(|a, b| {
                a.1.cmp(&b.1)
                    .then(a.2.tie_rank().cmp(&b.2.tie_rank()))
                    .then(a.0.device_user_id.cmp(&b.0.device_user_id))
            });
            let base = self
                .cursors
                .lock()
                .get(employee_id)
                .cloned()
                .unwrap_or_default();
            let cursor = self.walk(device_id, employee_id, &punches, base.clone(), &mut plan);
            plan.bases.insert(employee_id.to_string(), base);
            plan.cursors.insert(employee_id.to_string(), cursor);
        }

        log::debug!(
            "[reconciler] {}: {} records -> {} entries, {} anomalies, {} replayed",
            device_id,
            records.len(),
            plan.entries.len(),
            plan.anomalies.len(),
            plan.replayed.len()
        );
        plan
    }

    fn walk(
        &self,
        device_id: &str,
        employee_id: &str,
        punches: &[(&RawPunchRecord, DateTime<Utc>, PunchKind)],
        mut cursor: EmployeeCursor,
        plan: &mut ReconcilePlan,
    ) -> EmployeeCursor {
        let mut open = cursor.open.as_ref().map(Candidate::resumed);

        for (record, at, kind) in punches {
            let at = *at;
            let key = record.dedup_key(device_id);
            let anomaly = |kind: AnomalyKind| Anomaly {
                kind,
                device_user_id: record.device_user_id.clone(),
                timestamp: record.timestamp,
                employee_id: Some(employee_id.to_string()),
            };
            let before_open = open.as_ref().map_or(false, |o| at < o.entry_time);
            let before_closed = cursor.closed_until.map_or(false, |until| at < until);

            match kind {
                PunchKind::CheckIn if before_open || before_closed => {
                    // Arrived after later punches were already paired; keep it
                    // as a zero-length entry so no interval overlaps.
                    plan.anomalies.push(anomaly(AnomalyKind::OverlappingPunch));
                    let mut stray = Candidate::opened(device_id, at, key.clone());
                    stray.status = EntryStatus::Unterminated;
                    plan.entries.push(stray.into_entry(employee_id));
                    plan.new_keys.push((key, record.status));
                    plan.reconciled += 1;
                }
                PunchKind::CheckIn => {
                    if let Some(mut previous) = open.take() {
                        plan.anomalies.push(Anomaly {
                            kind: AnomalyKind::UnterminatedSession,
                            device_user_id: previous.first_user(),
                            timestamp: previous.entry_time.timestamp(),
                            employee_id: Some(employee_id.to_string()),
                        });
                        previous.status = EntryStatus::Unterminated;
                        plan.entries.push(previous.into_entry(employee_id));
                    }
                    open = Some(Candidate::opened(device_id, at, key.clone()));
                    plan.new_keys.push((key, record.status));
                    plan.reconciled += 1;
                }
                PunchKind::CheckOut => match open.take() {
                    Some(mut current) if !before_open => {
                        current.exit_time = Some(at);
                        current.status = EntryStatus::Closed;
                        current.source_keys.push(key.clone());
                        current.dirty = true;
                        cursor.closed_until = Some(cursor.closed_until.map_or(at, |u| u.max(at)));
                        plan.entries.push(current.into_entry(employee_id));
                        plan.new_keys.push((key, record.status));
                        plan.reconciled += 1;
                    }
                    other => {
                        open = other;
                        plan.anomalies.push(anomaly(AnomalyKind::OrphanExit));
                    }
                },
                PunchKind::Unknown(_) => {}
            }
        }

        if let Some(current) = &open {
            if current.dirty {
                plan.entries.push(current.clone().into_entry(employee_id));
            }
        }
        cursor.open = open.as_ref().map(Candidate::as_open_session);
        cursor
    }

    /// Apply the ledger's verdict to the reconciler state.
    ///
    /// An employee whose cursor moved since `plan` (another device committed
    /// in between) is not applied: the overlap is reported and the records
    /// stay unsynced so the next cycle pairs them against the newer state.
    pub fn commit(&self, plan: &ReconcilePlan, write: &WriteResult) -> CommitOutcome {
        let mut cursors = self.cursors.lock();

        let stale: HashSet<&str> = plan
            .bases
            .iter()
            .filter(|(employee_id, base)| {
                cursors.get(employee_id.as_str()).unwrap_or(&EmployeeCursor::default()) != *base
            })
            .map(|(employee_id, _)| employee_id.as_str())
            .collect();

        let mut written = 0;
        let mut rejected = Vec::new();
        let mut blocked: HashSet<&str> = stale.clone();
        let mut persisted: HashSet<&DedupKey> = HashSet::new();

        for (i, entry) in plan.entries.iter().enumerate() {
            match write.outcome(i) {
                Some(EntryWriteOutcome::Accepted) => {
                    written += 1;
                    if !stale.contains(entry.employee_id.as_str()) {
                        persisted.extend(entry.source_keys.iter());
                    }
                }
                Some(EntryWriteOutcome::Rejected(reason)) => {
                    rejected.push((entry.key(), reason.clone()));
                    blocked.insert(entry.employee_id.as_str());
                }
                None => {
                    rejected.push((entry.key(), "no write outcome reported".to_string()));
                    blocked.insert(entry.employee_id.as_str());
                }
            }
        }

        self.dedup.mark_synced(
            plan.new_keys
                .iter()
                .filter(|(key, _)| persisted.contains(key))
                .map(|(key, status)| (key, *status)),
        );

        for (employee_id, cursor) in &plan.cursors {
            if blocked.contains(employee_id.as_str()) {
                continue;
            }
            if cursor.open.is_none() && cursor.closed_until.is_none() {
                cursors.remove(employee_id);
            } else {
                cursors.insert(employee_id.clone(), cursor.clone());
            }
        }
        drop(cursors);

        let mut anomalies = Vec::new();
        for employee_id in &stale {
            let first = plan.entries.iter().find(|e| e.employee_id == *employee_id);
            log::warn!(
                "[reconciler] {}: {} was paired on another device meanwhile, re-pairing next cycle",
                plan.device_id,
                employee_id
            );
            if let Some(entry) = first {
                anomalies.push(Anomaly {
                    kind: AnomalyKind::OverlappingPunch,
                    device_user_id: entry
                        .source_keys
                        .first()
                        .map(|k| k.device_user_id.clone())
                        .unwrap_or_default(),
                    timestamp: entry.entry_time.timestamp(),
                    employee_id: Some(entry.employee_id.clone()),
                });
            }
        }

        let clear_permit = if rejected.is_empty() && stale.is_empty() {
            let records: BTreeSet<PunchRecordId> = plan
                .new_keys
                .iter()
                .map(|(key, status)| key.record_id(*status))
                .chain(plan.replayed.iter().cloned())
                .collect();
            Some(ClearPermit::new(
                plan.device_id.clone(),
                records.into_iter().collect(),
            ))
        } else {
            if !rejected.is_empty() {
                log::warn!(
                    "[reconciler] {}: ledger rejected {} of {} entries, records stay on device",
                    plan.device_id,
                    rejected.len(),
                    plan.entries.len()
                );
            }
            None
        };

        CommitOutcome {
            written,
            rejected,
            anomalies,
            clear_permit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const T: i64 = 1_717_228_800;
    const IN: u8 = 0;
    const OUT: u8 = 1;

    fn reconciler() -> Reconciler {
        Reconciler::new(Arc::new(DedupIndex::new()))
    }

    fn directory(pairs: &[(&str, &str)]) -> HashMap<String, EmployeeId> {
        pairs
            .iter()
            .map(|(user, emp)| (user.to_string(), emp.to_string()))
            .collect()
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    fn accept_all(plan: &ReconcilePlan) -> WriteResult {
        WriteResult::all_accepted(plan.entries.len())
    }

    #[test]
    fn in_then_out_yields_one_closed_entry() {
        let rec = reconciler();
        let records = vec![
            RawPunchRecord::new("7", T, IN),
            RawPunchRecord::new("7", T + 3600, OUT),
        ];
        let plan = rec.plan("dev-1", &records, &directory(&[("7", "emp-7")]));

        assert!(plan.anomalies.is_empty());
        assert_eq!(plan.entries.len(), 1);
        let entry = &plan.entries[0];
        assert_eq!(entry.employee_id, "emp-7");
        assert_eq!(entry.entry_time, at(T));
        assert_eq!(entry.exit_time, Some(at(T + 3600)));
        assert_eq!(entry.status, EntryStatus::Closed);
        assert_eq!(plan.reconciled, 2);
    }

    #[test]
    fn double_check_in_flags_unterminated_session() {
        let rec = reconciler();
        let records = vec![
            RawPunchRecord::new("7", T, IN),
            RawPunchRecord::new("7", T + 10, IN),
        ];
        let plan = rec.plan("dev-1", &records, &directory(&[("7", "emp-7")]));

        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].entry_time, at(T));
        assert_eq!(plan.entries[0].exit_time, None);
        assert_eq!(plan.entries[0].status, EntryStatus::Unterminated);
        assert_eq!(plan.entries[1].entry_time, at(T + 10));
        assert_eq!(plan.entries[1].exit_time, None);
        assert_eq!(plan.entries[1].status, EntryStatus::Open);
        assert_eq!(plan.anomalies.len(), 1);
        assert_eq!(plan.anomalies[0].kind, AnomalyKind::UnterminatedSession);
        assert_eq!(plan.anomalies[0].timestamp, T);
    }

    #[test]
    fn unmapped_user_is_excluded() {
        let rec = reconciler();
        let records = vec![
            RawPunchRecord::new("99", T, IN),
            RawPunchRecord::new("7", T, IN),
        ];
        let plan = rec.plan("dev-1", &records, &directory(&[("7", "emp-7")]));

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].employee_id, "emp-7");
        assert_eq!(plan.anomalies.len(), 1);
        assert_eq!(plan.anomalies[0].kind, AnomalyKind::UnmappedUser);
        assert_eq!(plan.anomalies[0].device_user_id, "99");

        let commit = rec.commit(&plan, &accept_all(&plan));
        let permit = commit.clear_permit.unwrap();
        assert_eq!(permit.records().len(), 1);
        assert_eq!(permit.records()[0].device_user_id, "7");
    }

    #[test]
    fn orphan_exit_is_skipped() {
        let rec = reconciler();
        let records = vec![RawPunchRecord::new("7", T, OUT)];
        let plan = rec.plan("dev-1", &records, &directory(&[("7", "emp-7")]));
        assert!(plan.entries.is_empty());
        assert!(plan.has_anomaly(AnomalyKind::OrphanExit));

        let commit = rec.commit(&plan, &accept_all(&plan));
        assert!(commit.clear_permit.unwrap().is_empty());
    }

    #[test]
    fn identical_timestamps_pair_entry_before_exit() {
        let rec = reconciler();
        let records = vec![
            RawPunchRecord::new("7", T, OUT),
            RawPunchRecord::new("7", T, IN),
        ];
        let plan = rec.plan("dev-1", &records, &directory(&[("7", "emp-7")]));
        assert!(plan.anomalies.is_empty());
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].status, EntryStatus::Closed);
        assert_eq!(plan.entries[0].exit_time, Some(at(T)));
    }

    #[test]
    fn unknown_status_codes_are_reported() {
        let rec = reconciler();
        let records = vec![RawPunchRecord::new("7", T, 255)];
        let plan = rec.plan("dev-1", &records, &directory(&[("7", "emp-7")]));
        assert!(plan.entries.is_empty());
        assert!(plan.has_anomaly(AnomalyKind::UnknownStatus));
    }

    #[test]
    fn replaying_a_committed_batch_is_a_no_op() {
        let rec = reconciler();
        let employees = directory(&[("7", "emp-7"), ("8", "emp-8")]);
        let records = vec![
            RawPunchRecord::new("7", T, IN),
            RawPunchRecord::new("7", T + 3600, OUT),
            RawPunchRecord::new("8", T + 60, IN),
        ];

        let first = rec.plan("dev-1", &records, &employees);
        assert_eq!(first.entries.len(), 2);
        rec.commit(&first, &accept_all(&first));

        // Crash before clear: the device hands back the same records.
        let second = rec.plan("dev-1", &records, &employees);
        assert!(second.entries.is_empty());
        assert!(second.anomalies.is_empty());
        assert_eq!(second.replayed().len(), 3);

        let commit = rec.commit(&second, &accept_all(&second));
        assert_eq!(commit.clear_permit.unwrap().len(), 3);
    }

    #[test]
    fn exit_in_a_later_cycle_closes_the_open_entry() {
        let rec = reconciler();
        let employees = directory(&[("7", "emp-7")]);

        let first = rec.plan("dev-1", &[RawPunchRecord::new("7", T, IN)], &employees);
        assert_eq!(first.entries[0].status, EntryStatus::Open);
        rec.commit(&first, &accept_all(&first));
        assert_eq!(rec.open_session("emp-7"), Some(("dev-1".to_string(), at(T))));

        let second = rec.plan("dev-1", &[RawPunchRecord::new("7", T + 600, OUT)], &employees);
        assert!(second.anomalies.is_empty());
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].entry_time, at(T));
        assert_eq!(second.entries[0].exit_time, Some(at(T + 600)));
        assert_eq!(second.entries[0].source_keys.len(), 2);

        let commit = rec.commit(&second, &accept_all(&second));
        assert_eq!(rec.open_session("emp-7"), None);
        // The check-in was cleared last cycle; only the exit is purged now.
        assert_eq!(commit.clear_permit.unwrap().len(), 1);
    }

    #[test]
    fn late_check_in_before_a_paired_interval_stays_zero_length() {
        let rec = reconciler();
        let employees = directory(&[("7", "emp-7")]);
        let first = rec.plan(
            "dev-1",
            &[
                RawPunchRecord::new("7", T, IN),
                RawPunchRecord::new("7", T + 3600, OUT),
            ],
            &employees,
        );
        rec.commit(&first, &accept_all(&first));

        let late = rec.plan("dev-2", &[RawPunchRecord::new("7", T + 60, IN)], &employees);
        assert!(late.has_anomaly(AnomalyKind::OverlappingPunch));
        assert_eq!(late.entries.len(), 1);
        assert_eq!(late.entries[0].status, EntryStatus::Unterminated);
        assert_eq!(rec.open_session("emp-7"), None);
    }

    #[test]
    fn rejected_entries_block_the_clear_and_stay_unsynced() {
        let rec = reconciler();
        let employees = directory(&[("7", "emp-7"), ("8", "emp-8")]);
        let records = vec![
            RawPunchRecord::new("7", T, IN),
            RawPunchRecord::new("7", T + 100, OUT),
            RawPunchRecord::new("8", T, IN),
            RawPunchRecord::new("8", T + 100, OUT),
        ];
        let plan = rec.plan("dev-1", &records, &employees);
        assert_eq!(plan.entries.len(), 2);

        let write = WriteResult {
            outcomes: vec![
                EntryWriteOutcome::Accepted,
                EntryWriteOutcome::Rejected("constraint violation".to_string()),
            ],
        };
        let commit = rec.commit(&plan, &write);
        assert_eq!(commit.written, 1);
        assert_eq!(commit.rejected.len(), 1);
        assert!(commit.clear_permit.is_none());

        // Next pull: only the rejected employee's records are reconciled again.
        let retry = rec.plan("dev-1", &records, &employees);
        assert_eq!(retry.entries.len(), 1);
        assert_eq!(retry.entries[0].employee_id, "emp-8");
        assert_eq!(retry.replayed().len(), 2);
    }

    #[test]
    fn restored_open_entries_pair_with_new_exits() {
        let rec = reconciler();
        let open = LedgerEntry {
            employee_id: "emp-7".to_string(),
            device_id: "dev-1".to_string(),
            entry_time: at(T),
            exit_time: None,
            status: EntryStatus::Open,
            source_keys: vec![RawPunchRecord::new("7", T, IN).dedup_key("dev-1")],
        };
        assert_eq!(rec.restore_open_entries(&[open]), 1);

        let plan = rec.plan(
            "dev-2",
            &[RawPunchRecord::new("7", T + 900, OUT)],
            &directory(&[("7", "emp-7")]),
        );
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].device_id, "dev-1");
        assert_eq!(plan.entries[0].status, EntryStatus::Closed);
    }

    #[test]
    fn exit_on_the_same_second_in_a_later_cycle_closes_the_entry() {
        let rec = reconciler();
        let employees = directory(&[("7", "emp-7")]);

        let first = rec.plan("dev-1", &[RawPunchRecord::new("7", T, IN)], &employees);
        rec.commit(&first, &accept_all(&first));

        let second = rec.plan(
            "dev-1",
            &[
                RawPunchRecord::new("7", T, IN),
                RawPunchRecord::new("7", T, OUT),
            ],
            &employees,
        );
        assert_eq!(second.replayed().len(), 1);
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].status, EntryStatus::Closed);
        assert_eq!(second.entries[0].exit_time, Some(at(T)));

        let commit = rec.commit(&second, &accept_all(&second));
        let permit = commit.clear_permit.unwrap();
        assert_eq!(permit.len(), 2);
        assert!(permit.records().iter().any(|r| r.status == OUT));
        assert_eq!(rec.open_session("emp-7"), None);
    }

    #[test]
    fn interleaved_devices_never_leave_two_open_entries() {
        let rec = reconciler();
        let employees = directory(&[("7", "emp-7")]);
        let mut ledger: BTreeMap<EntryKey, LedgerEntry> = BTreeMap::new();
        let mut write = |plan: &ReconcilePlan| {
            for entry in &plan.entries {
                ledger.insert(entry.key(), entry.clone());
            }
            accept_all(plan)
        };

        let batch_b = [RawPunchRecord::new("7", T + 100, IN)];
        let a = rec.plan("dev-a", &[RawPunchRecord::new("7", T, IN)], &employees);
        let b = rec.plan("dev-b", &batch_b, &employees);

        let commit_a = rec.commit(&a, &write(&a));
        assert!(commit_a.anomalies.is_empty());
        assert!(commit_a.clear_permit.is_some());

        let commit_b = rec.commit(&b, &write(&b));
        assert_eq!(commit_b.written, 1);
        assert_eq!(commit_b.anomalies.len(), 1);
        assert_eq!(commit_b.anomalies[0].kind, AnomalyKind::OverlappingPunch);
        assert!(commit_b.clear_permit.is_none());
        assert_eq!(rec.open_session("emp-7"), Some(("dev-a".to_string(), at(T))));

        // dev-b's record was not marked synced, so its next pull re-pairs it.
        let again = rec.plan("dev-b", &batch_b, &employees);
        assert!(again.replayed().is_empty());
        assert!(again.has_anomaly(AnomalyKind::UnterminatedSession));
        let commit = rec.commit(&again, &write(&again));
        assert!(commit.anomalies.is_empty());
        assert_eq!(commit.clear_permit.unwrap().len(), 1);
        assert_eq!(rec.open_session("emp-7"), Some(("dev-b".to_string(), at(T + 100))));

        let open: Vec<&LedgerEntry> = ledger.values().filter(|e| e.is_open()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].device_id, "dev-b");
    }

    #[tokio::test]
    async fn leases_on_one_employee_are_exclusive() {
        let rec = reconciler();
        let emp_7 = "emp-7".to_string();
        let emp_8 = "emp-8".to_string();

        let held = rec.lease_employees([&emp_8, &emp_7]).await;
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            rec.lease_employees([&emp_7]),
        )
        .await;
        assert!(blocked.is_err());

        drop(held);
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            rec.lease_employees([&emp_7, &emp_8]),
        )
        .await
        .expect("lease is free once released");
    }

    /// Small deterministic generator so the property checks need no extra crates
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn random_batches_never_overlap_or_double_open() {
        let employees = directory(&[("1", "emp-1"), ("2", "emp-2"), ("3", "emp-3")]);

        for seed in 0..40u64 {
            let rec = reconciler();
            let mut rng = Lcg(seed);
            let mut ledger: BTreeMap<EntryKey, LedgerEntry> = BTreeMap::new();

            for batch in 0..5 {
                let device = if batch % 2 == 0 { "dev-a" } else { "dev-b" };
                let records: Vec<RawPunchRecord> = (0..12)
                    .map(|_| {
                        let user = (rng.next() % 3 + 1).to_string();
                        let ts = T + (rng.next() % 20_000) as i64;
                        let status = (rng.next() % 2) as u8;
                        RawPunchRecord::new(user, ts, status)
                    })
                    .collect();

                let plan = rec.plan(device, &records, &employees);
                let mut opens_in_plan: HashMap<&str, usize> = HashMap::new();
                for entry in plan.entries.iter().filter(|e| e.is_open()) {
                    *opens_in_plan.entry(entry.employee_id.as_str()).or_default() += 1;
                }
                assert!(opens_in_plan.values().all(|&n| n <= 1), "seed {}", seed);

                rec.commit(&plan, &accept_all(&plan));
                for entry in plan.entries {
                    ledger.insert(entry.key(), entry);
                }
            }

            for emp in ["emp-1", "emp-2", "emp-3"] {
                let mut entries: Vec<&LedgerEntry> =
                    ledger.values().filter(|e| e.employee_id == emp).collect();
                entries.sort_by_key(|e| (e.entry_time, e.is_open(), e.exit_time));

                let open = entries.iter().filter(|e| e.is_open()).count();
                assert!(open <= 1, "seed {} {} has {} open entries", seed, emp, open);

                let intervals: Vec<(DateTime<Utc>, Option<DateTime<Utc>>)> = entries
                    .iter()
                    .filter_map(|e| match e.status {
                        EntryStatus::Closed => Some((e.entry_time, e.exit_time)),
                        EntryStatus::Open => Some((e.entry_time, None)),
                        EntryStatus::Unterminated => None,
                    })
                    .collect();
                for pair in intervals.windows(2) {
                    let (_, first_end) = pair[0];
                    let (second_start, _) = pair[1];
                    let first_end = first_end.expect("only the last interval may be open");
                    assert!(
                        first_end <= second_start,
                        "seed {} {} overlaps: {:?}",
                        seed,
                        emp,
                        pair
                    );
                }
            }
        }
    }
}

//! Append-only record of completed device cycles

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;

use super::types::SyncResult;

const BROADCAST_CAPACITY: usize = 64;

pub struct AuditTrail {
    history: Mutex<VecDeque<SyncResult>>,
    capacity: usize,
    sender: broadcast::Sender<SyncResult>,
}

impl AuditTrail {
    /// Keeps the most recent `capacity` results
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            sender,
        }
    }

    pub fn append(&self, result: SyncResult) {
        match serde_json::to_string(&result) {
            Ok(line) => log::info!(target: "horus_sync::audit", "{}", line),
            Err(e) => log::warn!("[audit] Failed to serialize sync result: {}", e),
        }

        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        // No subscribers is fine
        let _ = self.sender.send(result);
    }

    /// Receive every result appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncResult> {
        self.sender.subscribe()
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<SyncResult> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn for_device(&self, device_id: &str) -> Vec<SyncResult> {
        self.history
            .lock()
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }
}

//! Device session: one terminal connection's lifecycle
//!
//! `Idle → Connecting → Connected → Fetching → ClearingPending →
//! Disconnecting → Closed`, with `Failed` reachable from any state before
//! `Closed`. Every driver call is bounded by the device timeout.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::driver::{DeviceDriver, DriverConnection};
use super::error::{DriverError, Result, SyncError};
use super::reconciler::ClearPermit;
use super::types::{Device, DeviceInfo, RawPunchRecord, RawUser};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Fetching,
    ClearingPending,
    Disconnecting,
    Closed,
    Failed(String),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Fetching => "fetching",
            SessionState::ClearingPending => "clearing",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Transition table
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed(_), Disconnecting) => true,
            (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Disconnecting, _) => false,
            (_, Disconnecting) => true,
            (Idle, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Fetching) | (Fetching, Fetching) => true,
            (Connected, ClearingPending) | (Fetching, ClearingPending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// One sync attempt's connection to a device
pub struct DeviceSession {
    device: Device,
    driver: Arc<dyn DeviceDriver>,
    state: SessionState,
    opened_at: Option<DateTime<Utc>>,
    handle: Option<Box<dyn DriverConnection>>,
}

impl DeviceSession {
    pub fn new(device: Device, driver: Arc<dyn DeviceDriver>) -> Self {
        Self {
            device,
            driver,
            state: SessionState::Idle,
            opened_at: None,
            handle: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    fn transition(&mut self, operation: &'static str, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(SyncError::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        log::debug!(
            "[session] {} {} -> {}",
            self.device.id,
            self.state.name(),
            next.name()
        );
        self.state = next;
        Ok(())
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SyncError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    /// Record a driver failure and hand it back to the caller
    fn settle<T>(&mut self, result: std::result::Result<T, DriverError>) -> Result<T> {
        result.map_err(|err| {
            log::warn!("[session] {} driver call failed: {}", self.device.id, err);
            let failed = SessionState::Failed(err.to_string());
            if self.state.can_transition_to(&failed) {
                self.state = failed;
            }
            SyncError::Driver(err)
        })
    }

    /// Connect to the device; on failure the session is `Failed` and not retried here
    pub async fn open(&mut self) -> Result<()> {
        self.transition("open", SessionState::Connecting)?;
        let limit = self.device.timeout();
        log::info!(
            "[session] Connecting to {} ({})",
            self.device.id,
            self.device.endpoint()
        );

        let connected = bounded("connect", limit, self.driver.connect(&self.device, limit)).await;
        let handle = self.settle(connected)?;

        self.handle = Some(handle);
        self.opened_at = Some(Utc::now());
        self.transition("open", SessionState::Connected)
    }

    pub async fn fetch_device_info(&mut self) -> Result<DeviceInfo> {
        self.require("fetch device info", &[SessionState::Connected])?;
        let limit = self.device.timeout();
        let handle = self.connection("fetch device info")?;
        let info = bounded("get_info", limit, handle.get_info()).await;
        self.settle(info)
    }

    pub async fn fetch_users(&mut self) -> Result<Vec<RawUser>> {
        self.require(
            "fetch users",
            &[SessionState::Connected, SessionState::Fetching],
        )?;
        self.transition("fetch users", SessionState::Fetching)?;
        let limit = self.device.timeout();
        let handle = self.connection("fetch users")?;
        let users = bounded("get_users", limit, handle.get_users()).await;
        self.settle(users)
    }

    pub async fn fetch_punch_records(&mut self) -> Result<Vec<RawPunchRecord>> {
        self.require(
            "fetch punch records",
            &[SessionState::Connected, SessionState::Fetching],
        )?;
        self.transition("fetch punch records", SessionState::Fetching)?;
        let limit = self.device.timeout();
        let handle = self.connection("fetch punch records")?;
        let records = bounded("get_punch_records", limit, handle.get_punch_records()).await;
        self.settle(records)
    }

    /// Purge the records covered by `permit`; returns how many were cleared
    pub async fn confirm_clear(&mut self, permit: ClearPermit) -> Result<usize> {
        if permit.device_id() != self.device.id {
            return Err(SyncError::InvalidState {
                operation: "clear records of another device",
                state: self.state.to_string(),
            });
        }
        self.require(
            "confirm clear",
            &[SessionState::Connected, SessionState::Fetching],
        )?;
        self.transition("confirm clear", SessionState::ClearingPending)?;
        if permit.is_empty() {
            return Ok(0);
        }

        let limit = self.device.timeout();
        let handle = self.connection("confirm clear")?;
        let cleared = bounded(
            "clear_punch_records",
            limit,
            handle.clear_punch_records(permit.records()),
        )
        .await;
        self.settle(cleared)?;
        log::info!(
            "[session] Cleared {} records from {}",
            permit.len(),
            self.device.id
        );
        Ok(permit.len())
    }

    /// Release the driver handle; safe to call from any state, any number of times
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut handle) = self.handle.take() {
            self.state = SessionState::Disconnecting;
            let limit = self.device.timeout();
            match tokio::time::timeout(limit, handle.disconnect()).await {
                Ok(()) => log::debug!("[session] Disconnected from {}", self.device.id),
                Err(_) => log::warn!(
                    "[session] Disconnect from {} timed out after {}ms, dropping the connection",
                    self.device.id,
                    limit.as_millis()
                ),
            }
        }
        self.state = SessionState::Closed;
    }

    fn connection(&mut self, operation: &'static str) -> Result<&mut Box<dyn DriverConnection>> {
        match self.handle.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(SyncError::InvalidState {
                operation,
                state: self.state.to_string(),
            }),
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        // Only reached without close() when the owning task was aborted;
        // dropping the handle still releases its socket.
        if self.handle.take().is_some() {
            log::warn!(
                "[session] {} dropped without close, driver handle released",
                self.device.id
            );
        }
    }
}

async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> std::result::Result<T, DriverError>
where
    F: Future<Output = std::result::Result<T, DriverError>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            operation,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

//! Device driver capability
//!
//! The engine never speaks the terminal wire protocol itself. Hosts plug in
//! a driver (TCP with UDP fallback for ZKTeco-style terminals, a vendor SDK,
//! a simulator) and the session layer bounds every call with the device
//! timeout.

use async_trait::async_trait;
use std::time::Duration;

use super::error::DriverError;
use super::types::{Device, DeviceInfo, PunchRecordId, RawPunchRecord, RawUser};

/// Opens connections to terminals
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Establish a session with the device (including comm-key auth when set)
    async fn connect(
        &self,
        device: &Device,
        timeout: Duration,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// One live connection to a terminal
#[async_trait]
pub trait DriverConnection: Send {
    async fn get_info(&mut self) -> Result<DeviceInfo, DriverError>;

    async fn get_users(&mut self) -> Result<Vec<RawUser>, DriverError>;

    /// All punch records currently resident on the device; may be empty
    async fn get_punch_records(&mut self) -> Result<Vec<RawPunchRecord>, DriverError>;

    /// Purge the given records from the device
    async fn clear_punch_records(&mut self, records: &[PunchRecordId]) -> Result<(), DriverError>;

    /// Idempotent; failures are swallowed by the driver
    async fn disconnect(&mut self);
}

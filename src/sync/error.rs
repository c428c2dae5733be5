//! Error types for the sync engine.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Whether a failed step may be attempted again within the same cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
}

/// Failures reported by the device driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Network failure reaching the device
    #[error("connect error: {0}")]
    Connect(String),

    /// Malformed or unexpected device response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Driver call exceeded the device timeout
    #[error("timed out after {timeout_ms}ms during {operation}")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

impl DriverError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Short reason code used in sync outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) | Self::Timeout { .. } => "connect-error",
            Self::Protocol(_) => "protocol-error",
        }
    }

    /// Operator-facing hint for common network failures.
    pub fn hint(&self) -> Option<&'static str> {
        let message = match self {
            Self::Timeout { .. } => {
                return Some("device may be unreachable or IP/port incorrect")
            }
            Self::Connect(message) => message.to_lowercase(),
            Self::Protocol(_) => return None,
        };

        if message.contains("timeout") || message.contains("etimedout") {
            return Some("device may be unreachable or IP/port incorrect");
        }
        if message.contains("econnrefused") || message.contains("connection refused") {
            return Some("check if device is powered on and network accessible");
        }
        if message.contains("ehostunreach") || message.contains("host unreachable") {
            return Some("check network configuration");
        }
        if message.contains("auth") || message.contains("password") {
            return Some("check communication key");
        }
        None
    }
}

/// The ledger rejected the whole write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ledger write error: {0}")]
pub struct LedgerError(pub String);

impl LedgerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Errors surfaced by sessions, the scheduler and the trigger surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Session operation called in a state that does not allow it
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("sync cycle cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Driver(_) => RetryClass::Retryable,
            Self::Ledger(_) => RetryClass::Permanent,
            Self::InvalidState { .. } => RetryClass::Permanent,
            Self::UnknownDevice(_) => RetryClass::Permanent,
            Self::Cancelled => RetryClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_class() == RetryClass::Retryable
    }

    /// Reason string recorded in a failed sync outcome.
    pub fn outcome_reason(&self) -> String {
        match self {
            Self::Driver(err) => match err.hint() {
                Some(hint) => format!("{}: {} ({})", err.code(), err, hint),
                None => format!("{}: {}", err.code(), err),
            },
            Self::Ledger(err) => format!("ledger-write: {}", err.0),
            Self::InvalidState { .. } => format!("session-error: {}", self),
            Self::UnknownDevice(id) => format!("unknown-device: {}", id),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

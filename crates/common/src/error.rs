//! Common error types

use protocol::ProtocolError;
use std::collections::TryReserveError;
use std::fmt;
use thiserror::Error;

/// Why an operation is not allowed in the current driver or handle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidStateReason {
    AlreadyInstalled,
    NotInstalled,
    HasOpenDevices,
    /// The handle has been closed or is being torn down
    DeviceClosed,
}

impl fmt::Display for InvalidStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            InvalidStateReason::AlreadyInstalled => "driver already installed",
            InvalidStateReason::NotInstalled => "driver not installed",
            InvalidStateReason::HasOpenDevices => "devices are still open",
            InvalidStateReason::DeviceClosed => "device handle is closed",
        };
        f.write_str(reason)
    }
}

/// Errors reported by the USB host platform
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("device disconnected")]
    NoDevice,

    #[error("endpoint stalled")]
    Pipe,

    #[error("operation timed out")]
    Timeout,

    #[error("resource busy")]
    Busy,

    #[error("access denied")]
    Access,

    #[error("entity not found")]
    NotFound,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("transfer overflow")]
    Overflow,

    #[error("I/O error")]
    Io,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Out of memory")]
    NoMemory,

    #[error("Invalid state: {0}")]
    InvalidState(InvalidStateReason),

    #[error("USB host error: {0}")]
    Host(#[from] HostError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InterfaceNotFound { .. } => Error::NotFound(err.to_string()),
            ProtocolError::InvalidArgument(_) | ProtocolError::BaudRateOutOfRange { .. } => {
                Error::InvalidArgument(err.to_string())
            }
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::NoMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Protocol error types

use thiserror::Error;

/// Codec and descriptor resolver errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A request parameter is outside the range the chip accepts
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Baud rate outside `300..=base_clock/2` for the chip
    #[error("Unsupported baud rate {baud} (supported: {min}..={max})")]
    BaudRateOutOfRange { baud: u32, min: u32, max: u32 },

    /// No usable vendor interface in the configuration descriptor
    #[error("Interface {index} not found: {reason}")]
    InterfaceNotFound { index: u8, reason: String },
}

impl ProtocolError {
    /// True for errors that map to an invalid-argument result
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidArgument(_) | ProtocolError::BaudRateOutOfRange { .. }
        )
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::BaudRateOutOfRange {
            baud: 100,
            min: 300,
            max: 1_500_000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Unsupported baud rate 100"));
        assert!(msg.contains("1500000"));
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_interface_not_found_display() {
        let err = ProtocolError::InterfaceNotFound {
            index: 1,
            reason: "wrong class".to_string(),
        };
        assert!(format!("{}", err).contains("Interface 1 not found"));
        assert!(!err.is_invalid_argument());
    }
}

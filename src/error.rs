use thiserror::Error;
use uuid::Uuid;

use crate::types::ConnectionState;

/// Errors that can occur while talking to a CGM peripheral
#[derive(Error, Debug)]
pub enum CgmError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter present, or the adapter is turned off
    #[error("Bluetooth adapter unavailable or disabled")]
    AdapterUnavailable,

    /// The platform refused to start a scan
    #[error("Scanner unavailable: {0}")]
    ScanUnavailable(String),

    /// Operation requires a live connection handle
    #[error("No active connection")]
    NotConnected,

    /// Expected GATT service is missing from the peripheral
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    /// Expected characteristic is missing from the peripheral
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// Expected descriptor is missing from a characteristic
    #[error("Descriptor {descriptor} not found on characteristic {characteristic}")]
    DescriptorNotFound {
        /// Characteristic that was searched
        characteristic: Uuid,
        /// Descriptor that was expected
        descriptor: Uuid,
    },

    /// The platform backend does not implement the request
    #[error("Not supported by this platform: {0}")]
    Unsupported(&'static str),

    /// Bonding could not be requested or failed
    #[error("Bonding failed: {0}")]
    Bonding(String),

    /// Operation was not acknowledged in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// State machine refused a transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// State the supervisor was in
        from: ConnectionState,
        /// State that was requested
        to: ConnectionState,
    },

    /// The supervisor event loop has shut down
    #[error("Event loop is closed")]
    ChannelClosed,

    /// Message parsing failed
    #[error("Failed to parse message: {0}")]
    ParseError(String),
}

/// Result type for CGM operations
pub type Result<T> = std::result::Result<T, CgmError>;

/// Recovery class of an error, deciding what the supervisor does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Single failed read, write or MTU request: log and continue
    Transient,
    /// Rejected for lack of encryption: bond, then resume
    Security,
    /// Not acknowledged in time: reset in-flight state and move on
    Timeout,
    /// Link dropped: bounded reconnection
    ConnectionLoss,
    /// Peripheral does not expose what we need: give up on this attempt
    Configuration,
}

impl CgmError {
    /// Classify the error by how the supervisor recovers from it
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Ble(_) | Self::NotConnected | Self::ChannelClosed => ErrorClass::ConnectionLoss,
            Self::Bonding(_) => ErrorClass::Security,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::AdapterUnavailable
            | Self::ScanUnavailable(_)
            | Self::ServiceNotFound(_)
            | Self::CharacteristicNotFound(_)
            | Self::DescriptorNotFound { .. } => ErrorClass::Configuration,
            Self::Unsupported(_) | Self::InvalidTransition { .. } | Self::ParseError(_) => {
                ErrorClass::Transient
            }
        }
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self.class(), ErrorClass::ConnectionLoss)
    }

    /// Check if this error is recoverable without user action
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self.class(), ErrorClass::Configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CGMS_SERVICE_UUID;

    #[test]
    fn test_error_classification() {
        let missing = CgmError::ServiceNotFound(CGMS_SERVICE_UUID);
        assert_eq!(missing.class(), ErrorClass::Configuration);
        assert!(!missing.is_recoverable());
        assert!(!missing.is_connection_error());

        let timeout = CgmError::Timeout { timeout_ms: 5000 };
        assert_eq!(timeout.class(), ErrorClass::Timeout);
        assert!(timeout.is_recoverable());

        let lost = CgmError::NotConnected;
        assert!(lost.is_connection_error());
        assert!(lost.is_recoverable());

        assert_eq!(
            CgmError::Bonding("rejected".to_string()).class(),
            ErrorClass::Security
        );
        assert_eq!(
            CgmError::Unsupported("mtu").class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_error_display() {
        let error = CgmError::InvalidTransition {
            from: ConnectionState::Idle,
            to: ConnectionState::Ready,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid state transition"));
        assert!(error_string.contains("Idle -> Ready"));
    }
}

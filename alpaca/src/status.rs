//! ASCOM status codes and the error value every handler returns

use serde::Serialize;
use std::panic::Location;
use thiserror::Error;

/// Closed set of ASCOM outcome codes carried in `ErrorNumber`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AscomStatus {
    Success,
    NotImplemented,
    InvalidValue,
    ValueNotSet,
    NotConnected,
    InvalidWhileParked,
    InvalidWhileSlaved,
    InvalidOperation,
    ActionNotImplemented,
    NotSupported,
    Unknown,
    RequestFormatError,
    InternalError,
    UnspecifiedError,
}

impl AscomStatus {
    /// Numeric value sent on the wire
    pub fn code(&self) -> i32 {
        match self {
            AscomStatus::Success => 0,
            AscomStatus::NotImplemented => 0x400,
            AscomStatus::InvalidValue => 0x401,
            AscomStatus::ValueNotSet => 0x402,
            AscomStatus::NotConnected => 0x407,
            AscomStatus::InvalidWhileParked => 0x408,
            AscomStatus::InvalidWhileSlaved => 0x409,
            AscomStatus::InvalidOperation => 0x40B,
            AscomStatus::ActionNotImplemented => 0x40C,
            AscomStatus::NotSupported => 0x500,
            AscomStatus::Unknown => 0x505,
            AscomStatus::RequestFormatError => 0x506,
            AscomStatus::InternalError => 0x507,
            AscomStatus::UnspecifiedError => 0x508,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let status = match code {
            0 => AscomStatus::Success,
            0x400 => AscomStatus::NotImplemented,
            0x401 => AscomStatus::InvalidValue,
            0x402 => AscomStatus::ValueNotSet,
            0x407 => AscomStatus::NotConnected,
            0x408 => AscomStatus::InvalidWhileParked,
            0x409 => AscomStatus::InvalidWhileSlaved,
            0x40B => AscomStatus::InvalidOperation,
            0x40C => AscomStatus::ActionNotImplemented,
            0x500 => AscomStatus::NotSupported,
            0x505 => AscomStatus::Unknown,
            0x506 => AscomStatus::RequestFormatError,
            0x507 => AscomStatus::InternalError,
            0x508 => AscomStatus::UnspecifiedError,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AscomStatus::Success)
    }
}

impl std::fmt::Display for AscomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:X})", self, self.code())
    }
}

/// A failed command outcome: status plus a traceable message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AlpacaError {
    pub status: AscomStatus,
    pub message: String,
}

impl AlpacaError {
    /// Build an error whose message reads `"component: message. Line#N"`.
    ///
    /// The line number is the caller's, so the text points back at the
    /// handler that produced it.
    #[track_caller]
    pub fn new(status: AscomStatus, component: &str, message: impl std::fmt::Display) -> Self {
        let line = Location::caller().line();
        Self {
            status,
            message: format!("{}: {}. Line#{}", component, message, line),
        }
    }

    #[track_caller]
    pub fn not_implemented(component: &str, what: &str) -> Self {
        Self::new(AscomStatus::NotImplemented, component, format!("'{}' is not implemented", what))
    }

    #[track_caller]
    pub fn invalid_value(component: &str, message: impl std::fmt::Display) -> Self {
        Self::new(AscomStatus::InvalidValue, component, message)
    }

    #[track_caller]
    pub fn missing_keyword(component: &str, keyword: &str) -> Self {
        Self::new(
            AscomStatus::InvalidValue,
            component,
            format!("keyword '{}' not specified", keyword),
        )
    }

    #[track_caller]
    pub fn not_connected(component: &str) -> Self {
        Self::new(AscomStatus::NotConnected, component, "device is not connected")
    }

    #[track_caller]
    pub fn internal(component: &str, message: impl std::fmt::Display) -> Self {
        Self::new(AscomStatus::InternalError, component, message)
    }

    pub fn code(&self) -> i32 {
        self.status.code()
    }
}

pub type AlpacaResult<T> = Result<T, AlpacaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip_through_numbers() {
        for status in [
            AscomStatus::Success,
            AscomStatus::NotImplemented,
            AscomStatus::InvalidValue,
            AscomStatus::NotConnected,
            AscomStatus::InvalidOperation,
            AscomStatus::ActionNotImplemented,
            AscomStatus::InternalError,
            AscomStatus::UnspecifiedError,
        ] {
            assert_eq!(AscomStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(AscomStatus::from_code(0x7FF), None);
    }

    #[test]
    fn test_error_message_carries_component_and_line() {
        let line = line!() + 1;
        let err = AlpacaError::new(AscomStatus::InvalidValue, "Focuser", "Position out of range");
        assert_eq!(err.status, AscomStatus::InvalidValue);
        assert_eq!(err.code(), 0x401);
        assert_eq!(
            err.message,
            format!("Focuser: Position out of range. Line#{}", line)
        );
        assert_eq!(err.to_string(), err.message);
    }

    #[test]
    fn test_helpers_pick_expected_status() {
        assert_eq!(AlpacaError::missing_keyword("x", "Position").status, AscomStatus::InvalidValue);
        assert!(AlpacaError::missing_keyword("x", "Position").message.contains("'Position'"));
        assert_eq!(AlpacaError::not_connected("x").status, AscomStatus::NotConnected);
        assert_eq!(AlpacaError::not_implemented("x", "reverse").status, AscomStatus::NotImplemented);
        assert!(!AscomStatus::InternalError.is_success());
        assert!(AscomStatus::Success.is_success());
    }
}

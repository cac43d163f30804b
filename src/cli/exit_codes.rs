//! CLI Exit Codes
//!
//! Exit codes for scripted use of `kamstrup-cli` (cron jobs, shell pipelines).

use std::process::ExitCode;

use crate::config::ConfigError;
use crate::core::protocol::DecodeError;
use crate::core::transport::TransportError;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Opening the port failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Sweep did not finish in time
    pub const TIMEOUT: u8 = 4;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Frame did not decode
    pub const PROTOCOL_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// At least one register has no value
    pub const VALIDATION_FAILED: u8 = 17;

    /// Every defined code, ascending
    pub const ALL: [u8; 11] = [0, 1, 2, 3, 4, 7, 8, 9, 11, 14, 17];
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Sweep timed out
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::TIMEOUT, msg.into())
    }

    /// Some registers stayed invalid
    pub fn validation_failed(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::VALIDATION_FAILED, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::PORT_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            ErrorKind::Interrupted => ExitCodes::CANCELLED,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        let code = match &err {
            TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            TransportError::InvalidSettings(_) => ExitCodes::CONFIG_ERROR,
            TransportError::IoError(e) => return Self::from(std::io::Error::new(e.kind(), err.to_string())),
            _ => ExitCodes::CONNECTION_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

impl From<DecodeError> for CliResult {
    fn from(err: DecodeError) -> Self {
        Self::Error(ExitCodes::PROTOCOL_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Sweep timed out",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        14 => "Port not found",
        17 => "Register values missing",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in ExitCodes::ALL {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_transport_error() {
        let result = CliResult::from(TransportError::PortNotFound("/dev/ttyUSB9".into()));
        assert_eq!(result.code(), ExitCodes::PORT_NOT_FOUND);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy");
        assert_eq!(
            CliResult::from(TransportError::IoError(io)).code(),
            ExitCodes::PERMISSION_DENIED
        );

        assert_eq!(
            CliResult::from(TransportError::Disconnected).code(),
            ExitCodes::CONNECTION_FAILED
        );
        assert_eq!(
            CliResult::from(TransportError::InvalidSettings("9 data bits".into())).code(),
            ExitCodes::CONFIG_ERROR
        );
    }

    #[test]
    fn test_every_code_is_described() {
        for code in ExitCodes::ALL {
            assert_ne!(exit_code_description(code), "Unknown error");
        }
        assert_eq!(exit_code_description(127), "Unknown error");
        assert_eq!(exit_code_description(200), "Unknown error");
    }
}

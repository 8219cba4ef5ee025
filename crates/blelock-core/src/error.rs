use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Link errors
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Permission denied: {permission}")]
    PermissionDenied { permission: String },

    // Credential / protocol errors
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    #[error("Unsupported protocol for device '{name}'")]
    UnsupportedProtocol { name: String },

    // Command errors
    #[error("Command failed: {message}")]
    CommandFailed { code: Option<u8>, message: String },

    #[error("Timeout during {operation}")]
    Timeout { operation: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Wire errors
    #[error("Decoding error: {reason}")]
    Decoding { reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `Decoding` error from any displayable reason.
    pub fn decoding(reason: impl Into<String>) -> Self {
        Error::Decoding {
            reason: reason.into(),
        }
    }

    /// Build a `Timeout` error naming the operation that expired.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Error::Timeout {
            operation: operation.into(),
        }
    }

    /// Build a `CommandFailed` error carrying the device result code.
    pub fn command_failed(code: impl Into<Option<u8>>, message: impl Into<String>) -> Self {
        Error::CommandFailed {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build an `InvalidCredentials` error.
    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Error::InvalidCredentials {
            message: message.into(),
        }
    }

    /// Returns `true` if this error represents an expired wait.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_carries_code() {
        let err = Error::command_failed(0x11, "device asked for verification");
        match err {
            Error::CommandFailed { code, .. } => assert_eq!(code, Some(0x11)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_display_names_operation() {
        let err = Error::timeout("response wait");
        assert_eq!(err.to_string(), "Timeout during response wait");
        assert!(err.is_timeout());
    }
}

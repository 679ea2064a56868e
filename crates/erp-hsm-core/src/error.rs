//! Error types for erp-hsm

use crate::hsm::client::VendorError;
use thiserror::Error;

/// Result type alias using erp-hsm's Error
pub type Result<T> = std::result::Result<T, Error>;

/// How an error surfaces on the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// HSM or pool unavailable; the caller may retry later
    ServiceUnavailable,
    /// Misuse of the blob store by the caller
    BadRequest,
    /// Server side failure that is not the caller's fault
    Internal,
    /// Programming error (e.g. lease used after release)
    Defect,
}

/// erp-hsm error types
///
/// Messages never contain credentials. Vendor error codes are kept in the
/// variants for logging but are not part of the rendered message.
#[derive(Error, Debug)]
pub enum Error {
    // HSM connection errors (E100-E199)
    #[error("HSM is unreachable: {0}")]
    ConnectError(String),

    #[error("HSM logon rejected for {0}")]
    AuthError(String),

    #[error("HSM session expired")]
    SessionExpired { code: u32 },

    #[error("HSM session broken")]
    SessionBroken { code: u32 },

    #[error("HSM operation '{operation}' failed")]
    HsmOperation { operation: &'static str, code: u32 },

    // Pool errors (E200-E299)
    #[error("HSM pool exhausted: no session became available within {0} ms")]
    PoolExhausted(u64),

    #[error("HSM pool has been shut down")]
    PoolShutdown,

    #[error("Pool lease used after it was released")]
    UseAfterRelease,

    // Blob errors (E300-E399)
    #[error("Blob name '{0}' is already in use")]
    DuplicateName(String),

    #[error("Blob {0} not found")]
    BlobNotFound(String),

    #[error("Blob '{name}' has type {actual}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("No valid blob of type {0}")]
    BlobNotValid(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    Config(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectError(_) => "E100",
            Self::AuthError(_) => "E101",
            Self::SessionExpired { .. } => "E102",
            Self::SessionBroken { .. } => "E103",
            Self::HsmOperation { .. } => "E104",
            Self::PoolExhausted(_) => "E200",
            Self::PoolShutdown => "E201",
            Self::UseAfterRelease => "E202",
            Self::DuplicateName(_) => "E300",
            Self::BlobNotFound(_) => "E301",
            Self::TypeMismatch { .. } => "E302",
            Self::BlobNotValid(_) => "E303",
            Self::Database(_) => "E400",
            Self::Config(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Internal(_) => "E9999",
        }
    }

    /// Classify the error for the request path
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectError(_)
            | Self::AuthError(_)
            | Self::SessionExpired { .. }
            | Self::SessionBroken { .. }
            | Self::HsmOperation { .. }
            | Self::PoolExhausted(_)
            | Self::PoolShutdown => ErrorClass::ServiceUnavailable,
            Self::DuplicateName(_)
            | Self::BlobNotFound(_)
            | Self::TypeMismatch { .. }
            | Self::InvalidInput(_) => ErrorClass::BadRequest,
            Self::BlobNotValid(_) | Self::Database(_) | Self::Config(_) | Self::Internal(_) => {
                ErrorClass::Internal
            }
            Self::UseAfterRelease => ErrorClass::Defect,
        }
    }

    /// True if the session that produced this error must not go back to the pool
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionExpired { .. } | Self::SessionBroken { .. })
    }

    /// Stable message that is safe to hand to a remote caller
    pub fn public_message(&self) -> &'static str {
        match self.class() {
            ErrorClass::ServiceUnavailable => "HSM service temporarily unavailable",
            ErrorClass::BadRequest => "invalid key material request",
            ErrorClass::Internal => "internal server error",
            ErrorClass::Defect => "internal server error",
        }
    }
}

impl From<VendorError> for Error {
    fn from(error: VendorError) -> Self {
        match error {
            VendorError::ConnectFailed(reason) => Self::ConnectError(reason),
            VendorError::LogonRejected { username } => Self::AuthError(username),
            VendorError::SessionExpired { code } => Self::SessionExpired { code },
            VendorError::SessionBroken { code } => Self::SessionBroken { code },
            VendorError::Operation { operation, code } => Self::HsmOperation { operation, code },
        }
    }
}

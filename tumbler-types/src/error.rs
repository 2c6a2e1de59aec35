//! The error taxonomy from §7: recovery class, not language form. Internal
//! crates define their own `thiserror` enums; this module holds the shared
//! classification and the fixed user-facing code set that those enums map
//! onto at the coordinator boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Recovery-class taxonomy shared by every internal error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; surfaced to the caller, no state written.
    Validation,
    /// Transient; retried with backoff at the operation level.
    Temporary,
    /// Resource collision; regenerated inside a bounded attempt budget then Fatal.
    Conflict,
    /// Unknown identifier; surfaced, never auto-created.
    NotFound,
    /// Security/business rule rejection; surfaced and may move state to EXPIRED/REVIEW.
    Policy,
    /// Invariant violation; the component checkpoints and stops.
    Fatal,
}

/// A fixed, opaque code set exposed to upstream callers (§7 rule 4). Never
/// carries internal ids or stack detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserErrorCode {
    ValidationError,
    SecurityError,
    SystemBusy,
    NotFound,
    CannotCancel,
    InternalError,
}

impl ErrorKind {
    /// The default user-facing code for this recovery class. Callers that
    /// need a more specific code (e.g. `CannotCancel`) override at the call
    /// site rather than relying on this default.
    pub fn default_user_code(self) -> UserErrorCode {
        match self {
            ErrorKind::Validation => UserErrorCode::ValidationError,
            ErrorKind::Temporary => UserErrorCode::SystemBusy,
            ErrorKind::Conflict => UserErrorCode::InternalError,
            ErrorKind::NotFound => UserErrorCode::NotFound,
            ErrorKind::Policy => UserErrorCode::SecurityError,
            ErrorKind::Fatal => UserErrorCode::InternalError,
        }
    }
}

impl fmt::Display for UserErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserErrorCode::ValidationError => "VALIDATION_ERROR",
            UserErrorCode::SecurityError => "SECURITY_ERROR",
            UserErrorCode::SystemBusy => "SYSTEM_BUSY",
            UserErrorCode::NotFound => "NOT_FOUND",
            UserErrorCode::CannotCancel => "CANNOT_CANCEL",
            UserErrorCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

/// A user-facing failure: opaque code plus a message safe to show externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFacingError {
    pub code: UserErrorCode,
    pub message: String,
}

impl fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for UserFacingError {}

impl UserFacingError {
    pub fn new(code: UserErrorCode, message: impl Into<String>) -> Self {
        UserFacingError {
            code,
            message: message.into(),
        }
    }
}

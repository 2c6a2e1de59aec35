use thiserror::Error;
use tumbler_types::ErrorKind;

#[derive(Debug, Error)]
pub enum KeyCustodyError {
    #[error("unknown key handle")]
    UnknownKey,
    #[error("key has been retired/wiped")]
    KeyRotated,
    #[error("HSM temporarily unavailable: {0}")]
    HsmUnavailable(String),
    #[error("cryptographic operation failed: {0}")]
    CryptoFailure(String),
    #[error("key not found (logic bug)")]
    KeyNotFound,
    #[error("refusing to evict an active (non-terminal) key")]
    ActiveKeyEvictionAttempted,
}

impl KeyCustodyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyCustodyError::UnknownKey => ErrorKind::NotFound,
            KeyCustodyError::KeyRotated => ErrorKind::NotFound,
            KeyCustodyError::HsmUnavailable(_) => ErrorKind::Temporary,
            KeyCustodyError::CryptoFailure(_) => ErrorKind::Fatal,
            KeyCustodyError::KeyNotFound => ErrorKind::Fatal,
            KeyCustodyError::ActiveKeyEvictionAttempted => ErrorKind::Fatal,
        }
    }
}

use thiserror::Error;
use tumbler_types::{ErrorKind, IllegalTransition, OutputSplitError, UserErrorCode, UserFacingError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deposit address already in use")]
    AddressConflict,
    #[error("unknown mix request")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("validation failed: {0}")]
    Validation(#[from] OutputSplitError),
    #[error("amount {amount} outside allowed range [{min}, {max}] for {currency}")]
    AmountOutOfRange { currency: tumbler_types::Currency, amount: u128, min: u128, max: u128 },
    #[error("illegal state transition: {0}")]
    IllegalTransition(#[from] IllegalTransition),
    #[error("mix request cannot be cancelled in its current state")]
    CannotCancel,
    #[error("unknown mix request")]
    NotFound,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("key custody error: {0}")]
    KeyCustody(#[from] tumbler_keycustody::KeyCustodyError),
    #[error("no pool configured for currency {0}")]
    NoPoolForCurrency(tumbler_types::Currency),
    #[error("scheduler rejected operation: {0}")]
    Scheduler(#[from] tumbler_scheduler::SchedulerError),
    #[error("service is at capacity, try again later")]
    SystemBusy,
    #[error("deposit address space exhausted after bounded retry budget")]
    AddressSpaceExhausted,
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Validation(_) | CoordinatorError::AmountOutOfRange { .. } => ErrorKind::Validation,
            CoordinatorError::IllegalTransition(_) => ErrorKind::Fatal,
            CoordinatorError::CannotCancel => ErrorKind::Policy,
            CoordinatorError::NotFound => ErrorKind::NotFound,
            CoordinatorError::Store(StoreError::AddressConflict) => ErrorKind::Conflict,
            CoordinatorError::Store(StoreError::NotFound) => ErrorKind::NotFound,
            CoordinatorError::Store(StoreError::Backend(_)) => ErrorKind::Temporary,
            CoordinatorError::KeyCustody(e) => e.kind(),
            CoordinatorError::NoPoolForCurrency(_) => ErrorKind::Fatal,
            CoordinatorError::Scheduler(e) => e.kind(),
            CoordinatorError::SystemBusy => ErrorKind::Temporary,
            CoordinatorError::AddressSpaceExhausted => ErrorKind::Fatal,
        }
    }

    /// §7 rule 4: user-visible failures carry only an opaque code, never
    /// internal ids or stack detail.
    pub fn to_user_facing(&self) -> UserFacingError {
        let code = match self.kind() {
            ErrorKind::Validation => UserErrorCode::ValidationError,
            ErrorKind::Temporary => UserErrorCode::SystemBusy,
            ErrorKind::Conflict => UserErrorCode::InternalError,
            ErrorKind::NotFound => UserErrorCode::NotFound,
            ErrorKind::Policy => UserErrorCode::CannotCancel,
            ErrorKind::Fatal => UserErrorCode::InternalError,
        };
        let message = match self {
            CoordinatorError::Validation(_) | CoordinatorError::AmountOutOfRange { .. } => self.to_string(),
            CoordinatorError::CannotCancel => "mix cannot be cancelled in its current state".to_string(),
            CoordinatorError::NotFound => "no mix found for that session".to_string(),
            CoordinatorError::SystemBusy => "service is busy, please retry".to_string(),
            _ => "internal error".to_string(),
        };
        UserFacingError::new(code, message)
    }
}

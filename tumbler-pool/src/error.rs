use thiserror::Error;
use tumbler_types::ErrorKind;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: u128, available: u128 },
    #[error("unknown reservation")]
    UnknownReservation,
    #[error("unknown pool entry")]
    UnknownEntry,
    #[error("pool invariant violated: {0}")]
    InvariantViolation(String),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::InsufficientLiquidity { .. } => ErrorKind::Temporary,
            PoolError::UnknownReservation | PoolError::UnknownEntry => ErrorKind::NotFound,
            PoolError::InvariantViolation(_) => ErrorKind::Fatal,
        }
    }
}

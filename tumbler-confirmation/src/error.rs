use crate::blockchain_client::BlockchainClientError;
use thiserror::Error;
use tumbler_types::ErrorKind;

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("currency has no registered BlockchainClient")]
    NoClientForCurrency,
    #[error("chain RPC error: {0}")]
    Chain(#[from] BlockchainClientError),
    #[error("unknown watch reference")]
    UnknownWatch,
    #[error("unknown tracking id")]
    UnknownTracking,
}

impl ConfirmationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfirmationError::NoClientForCurrency => ErrorKind::Fatal,
            ConfirmationError::Chain(BlockchainClientError::Timeout) => ErrorKind::Temporary,
            ConfirmationError::Chain(BlockchainClientError::Rpc(_)) => ErrorKind::Temporary,
            ConfirmationError::Chain(BlockchainClientError::TransactionNotFound) => ErrorKind::NotFound,
            ConfirmationError::UnknownWatch | ConfirmationError::UnknownTracking => ErrorKind::NotFound,
        }
    }
}

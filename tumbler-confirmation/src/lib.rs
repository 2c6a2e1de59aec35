//! ConfirmationMonitor (§4.2): deposit detection and payout confirmation
//! tracking across the engine's supported currencies.

pub mod blockchain_client;
pub mod callbacks;
pub mod error;
pub mod monitor;

pub use blockchain_client::{BlockchainClient, BlockchainClientError};
pub use callbacks::{ConfirmedCallback, DepositCallback, FailedCallback, LateDepositCallback};
pub use error::ConfirmationError;
pub use monitor::{ConfirmationMonitor, MonitorStats};

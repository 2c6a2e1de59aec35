//! MixCoordinator (§4.5): the orchestrator that owns the `MixRequest`
//! aggregate and drives it through KeyCustody, ConfirmationMonitor,
//! LiquidityPool and Scheduler to completion.

pub mod coordinator;
pub mod error;
pub mod fee;
pub mod payload;
pub mod store;
pub mod validator;

pub use coordinator::{CreateMixRequest, CreateMixResponse, MixCoordinator, MixStatusResponse};
pub use error::{CoordinatorError, StoreError};
pub use fee::FeeCalculator;
pub use store::Store;
pub use validator::{ValidationError, Validator};

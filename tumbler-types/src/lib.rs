//! Core data model shared by every tumbler crate: currencies, amounts,
//! opaque ids, the MixRequest aggregate and its state machine, and the
//! error taxonomy. No component-specific logic lives here — this mirrors
//! the teacher's `rusty-shared-types` crate, which holds only cross-crate
//! data shapes and no behavior beyond simple invariants.

pub mod amount;
pub mod currency;
pub mod deposit;
pub mod error;
pub mod ids;
pub mod mix_request;
pub mod monitored;
pub mod pool_entry;
pub mod scheduled_op;

pub use amount::{Amount, AmountError};
pub use currency::{Currency, ScanStrategy};
pub use deposit::{evaluate_deposit, DepositAcceptance, DepositObservation};
pub use error::{ErrorKind, UserErrorCode, UserFacingError};
pub use ids::{KeyRef, MixId, OperationId, PoolEntryId, ReservationId, SessionToken, TrackingId, WatchRef};
pub use mix_request::{
    validate_outputs, AnonymityLevel, Algorithm, IllegalTransition, MixRequest, MixStatus, OutputSplit,
    OutputSplitError, PayoutLeg,
};
pub use monitored::{MonitoredAddress, MonitoredTransaction, MonitoredTxStatus};
pub use pool_entry::{PoolEntry, PoolEntryStatus};
pub use scheduled_op::{OperationPayload, OperationStatus, OperationType, ReadyKey, ScheduledOperation};

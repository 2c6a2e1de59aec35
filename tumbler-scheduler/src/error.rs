use thiserror::Error;
use tumbler_types::ErrorKind;

/// What a handler's failure means for the operation: retry it, or give up.
/// Mirrors the Validation/Temporary/Conflict/NotFound/Policy/Fatal taxonomy,
/// collapsed to the two outcomes the Scheduler itself has to act on.
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    #[error("temporary failure: {0}")]
    Temporary(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no handler registered for operation type {0:?}")]
    NoHandler(tumbler_types::OperationType),
    #[error("unknown operation")]
    UnknownOperation,
    #[error("scheduler at capacity ({0} scheduled operations)")]
    AtCapacity(usize),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::NoHandler(_) => ErrorKind::Fatal,
            SchedulerError::UnknownOperation => ErrorKind::NotFound,
            SchedulerError::AtCapacity(_) => ErrorKind::Temporary,
        }
    }
}

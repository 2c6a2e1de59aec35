//! Callback contracts for confirmation events (§4.2, §9 "Callback spaghetti
//! on on_confirmed/on_failed" redesign: mutually exclusive, at-most-once,
//! consumer-idempotent-safe). Represented as `Arc<dyn Fn>` closures captured
//! at `track_transaction`/construction time, per §9's "Scheduler handlers
//! are closures... capturing only ids and the capabilities needed" pattern
//! applied uniformly across the engine.

use std::sync::Arc;
use tumbler_types::{DepositObservation, TrackingId};

pub type DepositCallback = Arc<dyn Fn(DepositObservation) + Send + Sync>;
pub type LateDepositCallback = Arc<dyn Fn(tumbler_types::MixId, String, u128) + Send + Sync>;
pub type ConfirmedCallback = Arc<dyn Fn(TrackingId) + Send + Sync>;
pub type FailedCallback = Arc<dyn Fn(TrackingId) + Send + Sync>;

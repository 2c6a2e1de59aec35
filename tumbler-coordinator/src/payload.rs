//! Typed payloads encoded into a `ScheduledOperation`'s opaque
//! `OperationPayload` bytes. The Scheduler never looks inside these; only
//! the handler that built the operation decodes them (§3).

use serde::{Deserialize, Serialize};
use tumbler_types::{Currency, MixId, OperationPayload};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionPayload {
    pub mix_id: MixId,
    pub currency: Currency,
    pub output_index: usize,
    pub address: String,
    pub amount_minor_units: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinJoinPayload {
    pub currency: Currency,
    pub participants: Vec<CoinJoinParticipant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinJoinParticipant {
    pub mix_id: MixId,
    pub amount_minor_units: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyPayload {
    pub currency: Currency,
}

pub fn encode<T: Serialize>(value: &T) -> OperationPayload {
    OperationPayload(bincode::serialize(value).expect("payload types are always serializable"))
}

pub fn decode<T: for<'de> Deserialize<'de>>(payload: &OperationPayload) -> Result<T, bincode::Error> {
    bincode::deserialize(&payload.0)
}

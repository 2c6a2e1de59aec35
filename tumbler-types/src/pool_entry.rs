//! PoolEntry — one currency-denominated slice of liquidity owned by a Pool.

use crate::amount::Amount;
use crate::ids::{MixId, PoolEntryId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolEntryStatus {
    Available,
    Locked,
    Consumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: PoolEntryId,
    pub mix_id: MixId,
    pub amount: Amount,
    pub joined_at_unix: u64,
    pub status: PoolEntryStatus,
}

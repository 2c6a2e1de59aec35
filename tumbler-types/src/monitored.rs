//! MonitoredTransaction / MonitoredAddress — ConfirmationMonitor's exclusive
//! state (§3).

use crate::currency::Currency;
use crate::ids::{MixId, TrackingId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoredTxStatus {
    Pending,
    Confirmed,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredTransaction {
    pub id: TrackingId,
    pub currency: Currency,
    pub tx_hash: String,
    pub status: MonitoredTxStatus,
    pub confirmations: u32,
    pub required_confirmations: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at_unix: u64,
    pub updated_at_unix: u64,
}

impl MonitoredTransaction {
    /// Cooldown (in seconds) after reaching a terminal status before the
    /// record is eligible for removal (§3).
    pub fn cooldown_secs(&self) -> u64 {
        match self.status {
            MonitoredTxStatus::Confirmed => 60,
            MonitoredTxStatus::Failed => 300,
            _ => u64::MAX,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, MonitoredTxStatus::Confirmed | MonitoredTxStatus::Failed)
    }

    pub fn eligible_for_removal(&self, now_unix: u64) -> bool {
        self.is_terminal() && now_unix.saturating_sub(self.updated_at_unix) >= self.cooldown_secs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredAddress {
    pub currency: Currency,
    pub address: String,
    pub mix_id: MixId,
    pub first_seen_amount: Option<u128>,
}

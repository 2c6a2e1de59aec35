//! ScheduledOperation — the Scheduler's own unit of work. Carries `mix_id`
//! only for tracing; the Scheduler never dereferences MixRequest fields (§3).

use crate::ids::{MixId, OperationId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Distribution,
    Consolidation,
    Rebalance,
    CoinJoin,
    Cleanup,
}

impl OperationType {
    /// Default priority ordering used when two ops share a `scheduled_at`
    /// (lower value sorts first / runs sooner).
    pub fn default_priority(self) -> u8 {
        match self {
            OperationType::Cleanup => 0,
            OperationType::Rebalance => 1,
            OperationType::Consolidation => 2,
            OperationType::CoinJoin => 3,
            OperationType::Distribution => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Scheduled,
    Ready,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// Opaque payload handed back to the typed handler registered at schedule
/// time. The Scheduler treats this as inert bytes; only the component that
/// scheduled the operation (Pool, MixCoordinator) knows how to decode it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPayload(pub Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledOperation {
    pub id: OperationId,
    pub op_type: OperationType,
    pub priority: u8,
    pub scheduled_at_unix: u64,
    pub payload: OperationPayload,
    pub mix_id: Option<MixId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    pub created_at_unix: u64,
    pub ttl_secs: u64,
}

impl ScheduledOperation {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix.saturating_sub(self.created_at_unix) > self.ttl_secs
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// Heap ordering key: lower priority number first, then earlier
/// `scheduled_at`, then lexicographic id as the final tie-break (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyKey {
    pub priority: u8,
    pub scheduled_at_unix: u64,
    pub id: OperationId,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // std::collections::BinaryHeap is a max-heap; invert so the smallest
        // (priority, scheduled_at, id) tuple pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.scheduled_at_unix.cmp(&self.scheduled_at_unix))
            .then_with(|| other.id.as_bytes().cmp(self.id.as_bytes()))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn ready_key_pops_lowest_priority_first() {
        let mut heap = BinaryHeap::new();
        heap.push(ReadyKey {
            priority: 4,
            scheduled_at_unix: 10,
            id: OperationId::random(),
        });
        heap.push(ReadyKey {
            priority: 1,
            scheduled_at_unix: 20,
            id: OperationId::random(),
        });
        let top = heap.pop().unwrap();
        assert_eq!(top.priority, 1);
    }
}

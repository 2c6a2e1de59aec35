//! CoinJoin participant queue (§4.3 `join_coinjoin_queue`/`leave`). FIFO by
//! join order; readiness is decided by the owning [`crate::Pool`], not here.

use std::collections::VecDeque;
use tumbler_types::{Amount, MixId};

#[derive(Debug, Clone)]
pub struct QueuedParticipant {
    pub mix_id: MixId,
    pub amount: Amount,
    pub joined_at_unix: u64,
}

#[derive(Debug, Default)]
pub struct CoinJoinQueue {
    entries: VecDeque<QueuedParticipant>,
}

impl CoinJoinQueue {
    pub fn new() -> Self {
        CoinJoinQueue { entries: VecDeque::new() }
    }

    pub fn join(&mut self, mix_id: MixId, amount: Amount, now_unix: u64) {
        if self.entries.iter().any(|p| p.mix_id == mix_id) {
            return;
        }
        self.entries.push_back(QueuedParticipant { mix_id, amount, joined_at_unix: now_unix });
    }

    pub fn leave(&mut self, mix_id: MixId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| p.mix_id != mix_id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pops up to `n` participants in join order, for handing off to a
    /// COINJOIN scheduled operation once the pool decides it's ready.
    pub fn take_ready(&mut self, n: usize) -> Vec<QueuedParticipant> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// A CoinJoin co-spend needs equal-value inputs (see GLOSSARY). Finds
    /// the largest same-amount bucket with at least `min_participants`
    /// members, oldest-joined first, and drains exactly that bucket. Other
    /// queued participants (different amount, or excess beyond the bucket)
    /// stay queued for a future round.
    pub fn take_ready_equal_amount(&mut self, min_participants: usize) -> Option<Vec<QueuedParticipant>> {
        let mut by_amount: std::collections::HashMap<u128, Vec<usize>> = std::collections::HashMap::new();
        for (idx, p) in self.entries.iter().enumerate() {
            by_amount.entry(p.amount.minor_units()).or_default().push(idx);
        }
        let (_, indices) = by_amount
            .into_iter()
            .filter(|(_, idxs)| idxs.len() >= min_participants)
            .max_by_key(|(_, idxs)| idxs.len())?;

        let mut indices = indices;
        indices.sort_unstable();
        let mut taken = Vec::with_capacity(indices.len());
        for idx in indices.into_iter().rev() {
            taken.push(self.entries.remove(idx).expect("index collected from live iteration"));
        }
        taken.reverse();
        Some(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tumbler_types::Currency;

    #[test]
    fn join_is_idempotent_per_mix_id() {
        let mut q = CoinJoinQueue::new();
        let id = MixId::random();
        q.join(id, Amount::from_minor_units(Currency::Btc, 100_000_000), 0);
        q.join(id, Amount::from_minor_units(Currency::Btc, 100_000_000), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn take_ready_is_fifo() {
        let mut q = CoinJoinQueue::new();
        let a = MixId::random();
        let b = MixId::random();
        q.join(a, Amount::from_minor_units(Currency::Btc, 1), 0);
        q.join(b, Amount::from_minor_units(Currency::Btc, 1), 1);
        let ready = q.take_ready(1);
        assert_eq!(ready[0].mix_id, a);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn equal_amount_grouping_ignores_mismatched_denominations() {
        let mut q = CoinJoinQueue::new();
        let small = MixId::random();
        q.join(small, Amount::from_minor_units(Currency::Btc, 1_000_000), 0);
        let a = MixId::random();
        let b = MixId::random();
        let c = MixId::random();
        q.join(a, Amount::from_minor_units(Currency::Btc, 10_000_000), 1);
        q.join(b, Amount::from_minor_units(Currency::Btc, 10_000_000), 2);
        q.join(c, Amount::from_minor_units(Currency::Btc, 10_000_000), 3);

        assert!(q.take_ready_equal_amount(4).is_none());
        let bucket = q.take_ready_equal_amount(3).unwrap();
        assert_eq!(bucket.len(), 3);
        assert_eq!(bucket.iter().map(|p| p.mix_id).collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.take_ready(1)[0].mix_id, small);
    }
}

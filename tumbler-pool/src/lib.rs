//! LiquidityPool (§4.3): per-currency ledger of available/locked funds plus
//! the CoinJoin participant queue. One `Pool` instance exists per currency;
//! the node binary owns one per configured currency (mirrors the teacher's
//! per-shard `UtxoSet` split in `rusty-core`).

pub mod coinjoin_queue;
pub mod error;
pub mod health;

pub use coinjoin_queue::{CoinJoinQueue, QueuedParticipant};
pub use error::PoolError;
pub use health::HealthParams;

use std::collections::HashMap;
use std::sync::Mutex;

use log::{info, warn};
use tumbler_types::{Amount, Currency, MixId, PoolEntry, PoolEntryId, PoolEntryStatus, ReservationId};

#[derive(Debug, Clone)]
struct Reservation {
    entry_ids: Vec<PoolEntryId>,
    amount: u128,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: u128,
    pub available: u128,
    pub locked: u128,
    pub utilization: f64,
    pub oldest_entry_age_secs: u64,
    pub queue_len: usize,
    pub health_score: u8,
}

struct Inner {
    entries: HashMap<PoolEntryId, PoolEntry>,
    reservations: HashMap<ReservationId, Reservation>,
    queue: CoinJoinQueue,
}

/// Per-currency liquidity ledger. All mutation goes through `&self` methods
/// guarded by a single internal mutex -- entries, reservations and the
/// CoinJoin queue are updated atomically together, matching §3's invariant
/// that `available + locked == total` must hold under lock at all times.
pub struct Pool {
    pub currency: Currency,
    inner: Mutex<Inner>,
    health_params: HealthParams,
    pub target_total_minor_units: u128,
    pub min_pool_size_minor_units: u128,
}

impl Pool {
    pub fn new(
        currency: Currency,
        health_params: HealthParams,
        target_total_minor_units: u128,
        min_pool_size_minor_units: u128,
    ) -> Self {
        Pool {
            currency,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                reservations: HashMap::new(),
                queue: CoinJoinQueue::new(),
            }),
            health_params,
            target_total_minor_units,
            min_pool_size_minor_units,
        }
    }

    /// Adds an AVAILABLE entry and returns its id. Caller is responsible for
    /// acting on a subsequent `stats().health_score` / readiness check --
    /// this method itself never schedules anything (no component but
    /// Scheduler creates ScheduledOperations, per the ownership rule in §3).
    pub fn deposit(&self, mix_id: MixId, amount: Amount, now_unix: u64) -> PoolEntryId {
        assert_eq!(amount.currency(), self.currency, "deposit into wrong-currency pool");
        let id = PoolEntryId::random();
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            id,
            PoolEntry {
                id,
                mix_id,
                amount,
                joined_at_unix: now_unix,
                status: PoolEntryStatus::Available,
            },
        );
        info!("pool[{}] deposit {id} amount={}", self.currency, amount.minor_units());
        id
    }

    /// Locks `amount` from AVAILABLE entries, FIFO by `joined_at_unix`.
    /// All-or-nothing: either the full amount locks or `InsufficientLiquidity`
    /// with no side effect.
    pub fn reserve(&self, amount_minor_units: u128) -> Result<ReservationId, PoolError> {
        let mut inner = self.inner.lock().unwrap();
        let mut available_entries: Vec<PoolEntryId> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.status == PoolEntryStatus::Available)
            .map(|(id, _)| *id)
            .collect();
        available_entries.sort_by_key(|id| inner.entries[id].joined_at_unix);

        let mut acc = 0u128;
        let mut picked = Vec::new();
        for id in available_entries {
            if acc >= amount_minor_units {
                break;
            }
            acc += inner.entries[&id].amount.minor_units();
            picked.push(id);
        }

        if acc < amount_minor_units {
            let available_total = self.available_locked(&inner).0;
            return Err(PoolError::InsufficientLiquidity {
                requested: amount_minor_units,
                available: available_total,
            });
        }

        // The last picked entry usually covers more than what's left to
        // reserve; carve the surplus off into its own AVAILABLE entry so
        // exactly `amount_minor_units` ends up LOCKED, not the whole entry.
        let surplus = acc - amount_minor_units;
        if surplus > 0 {
            let boundary_id = *picked.last().unwrap();
            let (currency, mix_id, joined_at_unix) = {
                let entry = inner.entries.get_mut(&boundary_id).unwrap();
                let currency = entry.amount.currency();
                let mix_id = entry.mix_id;
                let joined_at_unix = entry.joined_at_unix;
                entry.amount = Amount::from_minor_units(currency, entry.amount.minor_units() - surplus);
                (currency, mix_id, joined_at_unix)
            };
            let remainder_id = PoolEntryId::random();
            inner.entries.insert(
                remainder_id,
                PoolEntry {
                    id: remainder_id,
                    mix_id,
                    amount: Amount::from_minor_units(currency, surplus),
                    joined_at_unix,
                    status: PoolEntryStatus::Available,
                },
            );
        }

        for id in &picked {
            inner.entries.get_mut(id).unwrap().status = PoolEntryStatus::Locked;
        }
        let reservation_id = ReservationId::random();
        inner.reservations.insert(reservation_id, Reservation { entry_ids: picked, amount: amount_minor_units });
        Ok(reservation_id)
    }

    /// Returns locked entries from a reservation back to AVAILABLE.
    pub fn release(&self, reservation: ReservationId) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().unwrap();
        let reservation = inner.reservations.remove(&reservation).ok_or(PoolError::UnknownReservation)?;
        for id in reservation.entry_ids {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.status = PoolEntryStatus::Available;
            }
        }
        Ok(())
    }

    /// Marks a reservation's entries CONSUMED; pool `total` decreases.
    pub fn consume(&self, reservation: ReservationId) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().unwrap();
        let reservation = inner.reservations.remove(&reservation).ok_or(PoolError::UnknownReservation)?;
        for id in reservation.entry_ids {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.status = PoolEntryStatus::Consumed;
            }
        }
        Ok(())
    }

    /// Drops CONSUMED entries older than `retention_secs`, per §3's
    /// "purged after a configurable retention" rule.
    pub fn purge_consumed(&self, now_unix: u64, retention_secs: u64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            !(e.status == PoolEntryStatus::Consumed && now_unix.saturating_sub(e.joined_at_unix) >= retention_secs)
        });
        before - inner.entries.len()
    }

    pub fn join_coinjoin_queue(&self, mix_id: MixId, amount: Amount, now_unix: u64) {
        self.inner.lock().unwrap().queue.join(mix_id, amount, now_unix);
    }

    pub fn leave_coinjoin_queue(&self, mix_id: MixId) -> bool {
        self.inner.lock().unwrap().queue.leave(mix_id)
    }

    /// §4.3 readiness check: enough AVAILABLE liquidity and enough queued
    /// participants. Returns the participants to hand to a COINJOIN
    /// operation, draining the queue, or `None` if not ready yet.
    pub fn coinjoin_ready(&self, min_participants: usize) -> Option<Vec<QueuedParticipant>> {
        let mut inner = self.inner.lock().unwrap();
        let (available, _) = self.available_locked(&inner);
        if available < self.min_pool_size_minor_units {
            return None;
        }
        let participants = inner.queue.take_ready_equal_amount(min_participants)?;
        info!("pool[{}] coinjoin ready with {} equal-value participants", self.currency, participants.len());
        Some(participants)
    }

    pub fn stats(&self, now_unix: u64) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let (available, locked) = self.available_locked(&inner);
        let total = available + locked;
        let utilization = if total == 0 { 0.0 } else { locked as f64 / total as f64 };
        let ages: Vec<u64> = inner
            .entries
            .values()
            .filter(|e| e.status != PoolEntryStatus::Consumed)
            .map(|e| now_unix.saturating_sub(e.joined_at_unix))
            .collect();
        let oldest_entry_age_secs = ages.iter().copied().max().unwrap_or(0);
        let health_score = health::score(total, available, locked, &ages, self.health_params);
        PoolStats {
            total,
            available,
            locked,
            utilization,
            oldest_entry_age_secs,
            queue_len: inner.queue.len(),
            health_score,
        }
    }

    /// §4.3 rebalancing trigger: `|total - target| / target > 0.2`. Returns
    /// `true` when a REBALANCE operation should be requested from Scheduler;
    /// this method never schedules one itself.
    pub fn needs_rebalance(&self, now_unix: u64) -> bool {
        if self.target_total_minor_units == 0 {
            return false;
        }
        let total = self.stats(now_unix).total;
        let delta = if total > self.target_total_minor_units {
            total - self.target_total_minor_units
        } else {
            self.target_total_minor_units - total
        };
        (delta as f64) / (self.target_total_minor_units as f64) > 0.2
    }

    /// Cheap continuous invariant check (§3): `available + locked == total`
    /// is true by construction here since `total` is derived from entries,
    /// so this instead checks that every LOCKED entry is covered by exactly
    /// one live reservation -- the invariant that *isn't* automatic.
    pub fn check_invariants(&self) -> Result<(), PoolError> {
        let inner = self.inner.lock().unwrap();
        let mut locked_by_reservation: HashMap<PoolEntryId, usize> = HashMap::new();
        for reservation in inner.reservations.values() {
            for id in &reservation.entry_ids {
                *locked_by_reservation.entry(*id).or_insert(0) += 1;
            }
        }
        for (id, entry) in inner.entries.iter() {
            if entry.status == PoolEntryStatus::Locked {
                let count = locked_by_reservation.get(id).copied().unwrap_or(0);
                if count != 1 {
                    warn!("pool[{}] entry {id} is LOCKED but referenced by {count} reservations", self.currency);
                    return Err(PoolError::InvariantViolation(format!(
                        "entry {id} locked but referenced by {count} reservations"
                    )));
                }
            }
        }
        Ok(())
    }

    fn available_locked(&self, inner: &Inner) -> (u128, u128) {
        let mut available = 0u128;
        let mut locked = 0u128;
        for entry in inner.entries.values() {
            match entry.status {
                PoolEntryStatus::Available => available += entry.amount.minor_units(),
                PoolEntryStatus::Locked => locked += entry.amount.minor_units(),
                PoolEntryStatus::Consumed => {}
            }
        }
        (available, locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        Pool::new(
            Currency::Btc,
            HealthParams { min_pool_size: 0, max_pool_size: u128::MAX, max_pool_age_secs: 86_400 },
            1_000_000_000,
            0,
        )
    }

    #[test]
    fn reserve_draws_fifo_and_is_all_or_nothing() {
        let pool = pool();
        let a = pool.deposit(MixId::random(), Amount::from_minor_units(Currency::Btc, 50_000_000), 0);
        let b = pool.deposit(MixId::random(), Amount::from_minor_units(Currency::Btc, 50_000_000), 10);
        let _ = (a, b);

        let reservation = pool.reserve(60_000_000).unwrap();
        let stats = pool.stats(100);
        assert_eq!(stats.locked, 60_000_000);
        assert_eq!(stats.available, 40_000_000);

        pool.consume(reservation).unwrap();
        let stats = pool.stats(100);
        assert_eq!(stats.total, 40_000_000);
    }

    #[test]
    fn reserve_beyond_available_fails_without_side_effects() {
        let pool = pool();
        pool.deposit(MixId::random(), Amount::from_minor_units(Currency::Btc, 1_000), 0);
        let err = pool.reserve(5_000).unwrap_err();
        assert!(matches!(err, PoolError::InsufficientLiquidity { .. }));
        assert_eq!(pool.stats(0).locked, 0);
    }

    #[test]
    fn release_returns_entries_to_available() {
        let pool = pool();
        pool.deposit(MixId::random(), Amount::from_minor_units(Currency::Btc, 1_000), 0);
        let reservation = pool.reserve(1_000).unwrap();
        pool.release(reservation).unwrap();
        assert_eq!(pool.stats(0).available, 1_000);
        assert_eq!(pool.stats(0).locked, 0);
    }

    #[test]
    fn coinjoin_ready_requires_both_liquidity_and_participant_count() {
        let pool = Pool::new(
            Currency::Btc,
            HealthParams { min_pool_size: 0, max_pool_size: u128::MAX, max_pool_age_secs: 86_400 },
            1,
            100_000_000,
        );
        pool.deposit(MixId::random(), Amount::from_minor_units(Currency::Btc, 100_000_000), 0);
        pool.join_coinjoin_queue(MixId::random(), Amount::from_minor_units(Currency::Btc, 100_000_000), 0);
        assert!(pool.coinjoin_ready(3).is_none());
        pool.join_coinjoin_queue(MixId::random(), Amount::from_minor_units(Currency::Btc, 100_000_000), 0);
        pool.join_coinjoin_queue(MixId::random(), Amount::from_minor_units(Currency::Btc, 100_000_000), 0);
        assert!(pool.coinjoin_ready(3).is_some());
    }

    #[test]
    fn invariants_hold_after_reserve_consume_cycle() {
        let pool = pool();
        pool.deposit(MixId::random(), Amount::from_minor_units(Currency::Btc, 1_000), 0);
        let reservation = pool.reserve(1_000).unwrap();
        pool.check_invariants().unwrap();
        pool.consume(reservation).unwrap();
        pool.check_invariants().unwrap();
    }
}

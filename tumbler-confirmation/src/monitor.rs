//! `ConfirmationMonitor` (§4.2): watches deposit addresses and tracks
//! outbound payout transactions to confirmation, one cooperative poll task
//! per currency rather than per watched address (mirrors the teacher's
//! single-timer-per-subsystem shape in `rusty-masternode`'s quorum loop).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;

use tumbler_types::{
    Amount, Currency, DepositObservation, MixId, MonitoredAddress, MonitoredTransaction,
    MonitoredTxStatus, TrackingId, WatchRef,
};

use crate::blockchain_client::{BlockchainClient, ChainTxStatus};
use crate::callbacks::{ConfirmedCallback, DepositCallback, FailedCallback, LateDepositCallback};
use crate::error::ConfirmationError;

struct TrackedTx {
    record: MonitoredTransaction,
    on_confirmed: ConfirmedCallback,
    on_failed: FailedCallback,
    fired: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorStats {
    pub watched_addresses: usize,
    pub tracked_transactions: usize,
    pub pending_transactions: usize,
}

struct Shared {
    clients: HashMap<Currency, Arc<dyn BlockchainClient>>,
    poll_intervals: HashMap<Currency, Duration>,
    watches: Mutex<HashMap<WatchRef, MonitoredAddress>>,
    tracked: Mutex<HashMap<TrackingId, TrackedTx>>,
    last_scanned_height: Mutex<HashMap<Currency, u64>>,
    on_deposit: DepositCallback,
    on_late_deposit: LateDepositCallback,
}

/// Owns exactly the state described in §3 for this component: watched
/// addresses, tracked transactions, and per-currency scan cursors. Nothing
/// else in the engine keeps its own copy of chain-observed state.
pub struct ConfirmationMonitor {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConfirmationMonitor {
    pub fn new(
        clients: HashMap<Currency, Arc<dyn BlockchainClient>>,
        poll_intervals: HashMap<Currency, Duration>,
        on_deposit: DepositCallback,
        on_late_deposit: LateDepositCallback,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        ConfirmationMonitor {
            shared: Arc::new(Shared {
                clients,
                poll_intervals,
                watches: Mutex::new(HashMap::new()),
                tracked: Mutex::new(HashMap::new()),
                last_scanned_height: Mutex::new(HashMap::new()),
                on_deposit,
                on_late_deposit,
            }),
            shutdown_tx,
        }
    }

    /// Spawns one poll task per configured currency. Call once at startup;
    /// each task runs until `shutdown` is called.
    pub fn spawn_all(&self) {
        for currency in self.shared.clients.keys().copied().collect::<Vec<_>>() {
            let shared = self.shared.clone();
            let mut rx = self.shutdown_tx.subscribe();
            let period = self
                .shared
                .poll_intervals
                .get(&currency)
                .copied()
                .unwrap_or(Duration::from_secs(15));
            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = poll_currency(&shared, currency).await {
                                warn!("confirmation poll failed for {currency}: {e}");
                            }
                        }
                        _ = rx.recv() => {
                            debug!("confirmation monitor shutting down poll task for {currency}");
                            break;
                        }
                    }
                }
            });
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn watch_address(&self, currency: Currency, address: String, mix_id: MixId) -> WatchRef {
        let watch_ref = WatchRef::random();
        let mut watches = self.shared.watches.lock().await;
        watches.insert(
            watch_ref,
            MonitoredAddress {
                currency,
                address,
                mix_id,
                first_seen_amount: None,
            },
        );
        watch_ref
    }

    pub async fn unwatch_address(&self, watch_ref: WatchRef) -> Result<(), ConfirmationError> {
        let mut watches = self.shared.watches.lock().await;
        watches.remove(&watch_ref).map(|_| ()).ok_or(ConfirmationError::UnknownWatch)
    }

    pub async fn track_transaction(
        &self,
        currency: Currency,
        tx_hash: String,
        required_confirmations: u32,
        now_unix: u64,
        on_confirmed: ConfirmedCallback,
        on_failed: FailedCallback,
    ) -> TrackingId {
        let id = TrackingId::random();
        let record = MonitoredTransaction {
            id,
            currency,
            tx_hash,
            status: MonitoredTxStatus::Pending,
            confirmations: 0,
            required_confirmations,
            retry_count: 0,
            max_retries: 10,
            created_at_unix: now_unix,
            updated_at_unix: now_unix,
        };
        let mut tracked = self.shared.tracked.lock().await;
        tracked.insert(
            id,
            TrackedTx {
                record,
                on_confirmed,
                on_failed,
                fired: false,
            },
        );
        id
    }

    pub async fn cancel_tracking(&self, id: TrackingId) -> Result<(), ConfirmationError> {
        let mut tracked = self.shared.tracked.lock().await;
        tracked.remove(&id).map(|_| ()).ok_or(ConfirmationError::UnknownTracking)
    }

    pub async fn stats(&self) -> MonitorStats {
        let watches = self.shared.watches.lock().await;
        let tracked = self.shared.tracked.lock().await;
        let pending = tracked
            .values()
            .filter(|t| t.record.status == MonitoredTxStatus::Pending)
            .count();
        MonitorStats {
            watched_addresses: watches.len(),
            tracked_transactions: tracked.len(),
            pending_transactions: pending,
        }
    }

    /// Drops cooled-down terminal records (§3's removal-eligibility rule).
    /// Called by the node binary's housekeeping loop, not by the poll tasks
    /// themselves, so callers can snapshot terminal state before eviction.
    pub async fn sweep_terminal(&self, now_unix: u64) -> usize {
        let mut tracked = self.shared.tracked.lock().await;
        let before = tracked.len();
        tracked.retain(|_, t| !t.record.eligible_for_removal(now_unix));
        before - tracked.len()
    }
}

async fn poll_currency(shared: &Shared, currency: Currency) -> Result<(), ConfirmationError> {
    let client = shared
        .clients
        .get(&currency)
        .cloned()
        .ok_or(ConfirmationError::NoClientForCurrency)?;

    poll_deposits(shared, currency, client.as_ref()).await?;
    poll_tracked_transactions(shared, currency, client.as_ref()).await?;
    Ok(())
}

async fn poll_deposits(
    shared: &Shared,
    currency: Currency,
    client: &dyn BlockchainClient,
) -> Result<(), ConfirmationError> {
    let now = now_unix();
    match currency.scan_strategy() {
        tumbler_types::ScanStrategy::BlockScan => {
            let tip = client.current_tip_height().await?;
            let mut heights = shared.last_scanned_height.lock().await;
            let from = heights.get(&currency).copied().map(|h| h + 1).unwrap_or(tip);
            drop(heights);
            for height in from..=tip {
                let scanned = client.scan_block(height).await?;
                if scanned.is_empty() {
                    continue;
                }
                let watches = shared.watches.lock().await.clone();
                for tx in scanned {
                    for output in &tx.outputs {
                        for (watch_ref, watch) in watches.iter() {
                            if watch.currency == currency && watch.address == output.address {
                                emit_deposit(shared, *watch_ref, watch, &tx.tx_hash, output.amount_minor_units, 0, now)
                                    .await;
                            }
                        }
                    }
                }
            }
            shared.last_scanned_height.lock().await.insert(currency, tip);
        }
        tumbler_types::ScanStrategy::BalancePoll => {
            let watches = shared.watches.lock().await.clone();
            for (watch_ref, watch) in watches.iter() {
                if watch.currency != currency {
                    continue;
                }
                let balance = client.get_balance(&watch.address).await?;
                if balance > watch.first_seen_amount.unwrap_or(0) {
                    emit_deposit(shared, *watch_ref, watch, "", balance, 0, now).await;
                }
            }
        }
    }
    Ok(())
}

async fn emit_deposit(
    shared: &Shared,
    watch_ref: WatchRef,
    watch: &MonitoredAddress,
    tx_hash: &str,
    amount_minor_units: u128,
    confirmations: u32,
    now: u64,
) {
    let mut watches = shared.watches.lock().await;
    let is_first = watches
        .get(&watch_ref)
        .map(|w| w.first_seen_amount.is_none())
        .unwrap_or(false);
    if let Some(entry) = watches.get_mut(&watch_ref) {
        if entry.first_seen_amount.is_none() {
            entry.first_seen_amount = Some(amount_minor_units);
        }
    }
    drop(watches);

    if is_first {
        info!("deposit observed for mix {} on {currency}", watch.mix_id, currency = watch.currency);
        (shared.on_deposit)(DepositObservation {
            mix_id: watch.mix_id,
            tx_hash: tx_hash.to_string(),
            observed_amount: Amount::from_minor_units(watch.currency, amount_minor_units),
            confirmations,
            first_seen_unix: now,
            last_seen_unix: now,
        });
    } else {
        (shared.on_late_deposit)(watch.mix_id, tx_hash.to_string(), amount_minor_units);
    }
}

async fn poll_tracked_transactions(
    shared: &Shared,
    currency: Currency,
    client: &dyn BlockchainClient,
) -> Result<(), ConfirmationError> {
    let ids: Vec<TrackingId> = {
        let tracked = shared.tracked.lock().await;
        tracked
            .values()
            .filter(|t| t.record.currency == currency && !t.record.is_terminal())
            .map(|t| t.record.id)
            .collect()
    };

    for id in ids {
        let tx_hash = {
            let tracked = shared.tracked.lock().await;
            match tracked.get(&id) {
                Some(t) => t.record.tx_hash.clone(),
                None => continue,
            }
        };

        let now = now_unix();
        let result = client.get_transaction(&tx_hash).await;
        let mut tracked = shared.tracked.lock().await;
        let Some(entry) = tracked.get_mut(&id) else { continue };

        match result {
            Ok(chain_tx) => {
                entry.record.confirmations = chain_tx.confirmations;
                entry.record.updated_at_unix = now;
                let next_status = match chain_tx.status {
                    ChainTxStatus::Failed => MonitoredTxStatus::Failed,
                    ChainTxStatus::Confirmed if chain_tx.confirmations >= entry.record.required_confirmations => {
                        MonitoredTxStatus::Confirmed
                    }
                    _ => MonitoredTxStatus::Pending,
                };
                entry.record.status = next_status;
            }
            Err(e) => {
                entry.record.retry_count += 1;
                entry.record.updated_at_unix = now;
                warn!("get_transaction({tx_hash}) failed ({e}), retry {}/{}", entry.record.retry_count, entry.record.max_retries);
                if entry.record.retry_count >= entry.record.max_retries {
                    entry.record.status = MonitoredTxStatus::Failed;
                }
            }
        }

        if !entry.fired {
            match entry.record.status {
                MonitoredTxStatus::Confirmed => {
                    entry.fired = true;
                    (entry.on_confirmed)(id);
                }
                MonitoredTxStatus::Failed => {
                    entry.fired = true;
                    (entry.on_failed)(id);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Cloning `HashMap<WatchRef, MonitoredAddress>`/`MonitoredAddress` under the
// lock above needs `Clone`; `MonitoredAddress` already derives it via serde's
// sibling derive in tumbler-types, so no extra impl is needed here.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain_client::{BlockchainClientError, ChainOutput, ChainTransaction, ScannedTx, TxInputRef, TxOutputSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct FakeClient {
        tip: AtomicU32,
        blocks: TokioMutex<HashMap<u64, Vec<ScannedTx>>>,
        txs: TokioMutex<HashMap<String, ChainTransaction>>,
    }

    #[async_trait]
    impl BlockchainClient for FakeClient {
        async fn current_tip_height(&self) -> Result<u64, BlockchainClientError> {
            Ok(self.tip.load(Ordering::SeqCst) as u64)
        }
        async fn get_balance(&self, _address: &str) -> Result<u128, BlockchainClientError> {
            Ok(0)
        }
        async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, BlockchainClientError> {
            self.txs
                .lock()
                .await
                .get(tx_hash)
                .cloned()
                .ok_or(BlockchainClientError::TransactionNotFound)
        }
        async fn scan_block(&self, height: u64) -> Result<Vec<ScannedTx>, BlockchainClientError> {
            Ok(self.blocks.lock().await.get(&height).cloned().unwrap_or_default())
        }
        async fn build_and_sign(
            &self,
            _inputs: &[TxInputRef],
            _outputs: &[TxOutputSpec],
            _signer_key_ref_hex: &str,
        ) -> Result<Vec<u8>, BlockchainClientError> {
            Ok(vec![])
        }
        async fn broadcast(&self, _raw_tx: &[u8]) -> Result<String, BlockchainClientError> {
            Ok("deadbeef".to_string())
        }
    }

    #[tokio::test]
    async fn watch_and_unwatch_round_trip() {
        let mut clients: HashMap<Currency, Arc<dyn BlockchainClient>> = HashMap::new();
        clients.insert(
            Currency::Btc,
            Arc::new(FakeClient {
                tip: AtomicU32::new(0),
                blocks: TokioMutex::new(HashMap::new()),
                txs: TokioMutex::new(HashMap::new()),
            }),
        );
        let monitor = ConfirmationMonitor::new(
            clients,
            HashMap::new(),
            Arc::new(|_| {}),
            Arc::new(|_, _, _| {}),
        );
        let watch_ref = monitor.watch_address(Currency::Btc, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(), MixId::random()).await;
        assert_eq!(monitor.stats().await.watched_addresses, 1);
        monitor.unwatch_address(watch_ref).await.unwrap();
        assert_eq!(monitor.stats().await.watched_addresses, 0);
        assert!(monitor.unwatch_address(watch_ref).await.is_err());
    }

    #[tokio::test]
    async fn track_transaction_confirms_once_threshold_reached() {
        let fake = Arc::new(FakeClient {
            tip: AtomicU32::new(0),
            blocks: TokioMutex::new(HashMap::new()),
            txs: TokioMutex::new(HashMap::new()),
        });
        fake.txs.lock().await.insert(
            "abc".to_string(),
            ChainTransaction {
                tx_hash: "abc".to_string(),
                confirmations: 6,
                outputs: vec![ChainOutput { address: "x".into(), amount_minor_units: 1 }],
                status: ChainTxStatus::Confirmed,
            },
        );
        let mut clients: HashMap<Currency, Arc<dyn BlockchainClient>> = HashMap::new();
        clients.insert(Currency::Btc, fake.clone());

        let confirmed_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_clone = confirmed_flag.clone();

        let monitor = ConfirmationMonitor::new(
            clients,
            HashMap::new(),
            Arc::new(|_| {}),
            Arc::new(|_, _, _| {}),
        );
        let id = monitor
            .track_transaction(Currency::Btc, "abc".into(), 6, 0, Arc::new(move |_| flag_clone.store(true, Ordering::SeqCst)), Arc::new(|_| {}))
            .await;

        poll_tracked_transactions(&monitor.shared, Currency::Btc, fake.as_ref()).await.unwrap();

        assert!(confirmed_flag.load(Ordering::SeqCst));
        let stats = monitor.stats().await;
        assert_eq!(stats.tracked_transactions, 1);
        assert_eq!(stats.pending_transactions, 0);
        let _ = id;
    }
}

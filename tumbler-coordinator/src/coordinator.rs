//! MixCoordinator (§4.5): owns the `MixRequest` state machine and
//! orchestrates Validator, FeeCalculator, KeyCustody, ConfirmationMonitor,
//! LiquidityPool and Scheduler. Transitions are serialized per `MixRequest`
//! via a per-id lock (§5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use log::{info, warn};
use rand::Rng;
use tokio::sync::Mutex as TokioMutex;

use tumbler_config::TumblerConfig;
use tumbler_confirmation::{BlockchainClient, ConfirmationMonitor};
use tumbler_keycustody::{KeyAlgorithm, KeyCustody};
use tumbler_pool::Pool;
use tumbler_scheduler::{CancelToken, HandlerError, OperationHandler, Scheduler};
use tumbler_types::{
    evaluate_deposit, Amount, AnonymityLevel, Algorithm, Currency, DepositAcceptance, DepositObservation, MixId,
    MixRequest, MixStatus, OperationId, OperationPayload, OperationStatus, OperationType, OutputSplit, ScheduledOperation,
    SessionToken, TrackingId, WatchRef,
};

use crate::error::CoordinatorError;
use crate::fee::FeeCalculator;
use crate::payload::{self, CoinJoinParticipant, CoinJoinPayload, CurrencyPayload, DistributionPayload};
use crate::store::Store;
use crate::validator::Validator;

pub struct CreateMixRequest {
    pub currency: Currency,
    pub input_amount: Amount,
    pub outputs: Vec<OutputSplit>,
    pub anonymity_level: AnonymityLevel,
    pub algorithm: Algorithm,
}

#[derive(Debug, Clone)]
pub struct CreateMixResponse {
    pub session_token: SessionToken,
    pub deposit_address: String,
    pub fee_amount: Amount,
    pub net_amount: Amount,
    pub expires_at_unix: u64,
    pub delay_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct MixStatusResponse {
    pub status: MixStatus,
    pub current_phase: MixStatus,
    pub confirmations_seen: u32,
    pub confirmations_required: u32,
    pub anonymity_score: u8,
    pub tx_hashes: Vec<String>,
}

const ADDRESS_RETRY_BUDGET: u32 = 5;

pub struct MixCoordinator {
    store: Arc<dyn Store>,
    key_custody: Arc<KeyCustody>,
    confirmation: Arc<ConfirmationMonitor>,
    pools: HashMap<Currency, Arc<Pool>>,
    scheduler: Arc<Scheduler>,
    clients: HashMap<Currency, Arc<dyn BlockchainClient>>,
    config: TumblerConfig,
    id_locks: StdMutex<HashMap<MixId, Arc<TokioMutex<()>>>>,
    watch_refs: StdMutex<HashMap<MixId, WatchRef>>,
    holding_addresses: StdMutex<HashMap<Currency, String>>,
}

impl MixCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        key_custody: Arc<KeyCustody>,
        confirmation: Arc<ConfirmationMonitor>,
        pools: HashMap<Currency, Arc<Pool>>,
        scheduler: Arc<Scheduler>,
        clients: HashMap<Currency, Arc<dyn BlockchainClient>>,
        config: TumblerConfig,
    ) -> Self {
        MixCoordinator {
            store,
            key_custody,
            confirmation,
            pools,
            scheduler,
            clients,
            config,
            id_locks: StdMutex::new(HashMap::new()),
            watch_refs: StdMutex::new(HashMap::new()),
            holding_addresses: StdMutex::new(HashMap::new()),
        }
    }

    /// Registers this coordinator as the Scheduler's handler for every
    /// operation type it owns. Call once after construction, before
    /// `scheduler.spawn_all()`.
    pub async fn register_handlers(self: &Arc<Self>) {
        let handler: Arc<dyn OperationHandler> = Arc::new(CoordinatorHandler(self.clone()));
        for op_type in [
            OperationType::Distribution,
            OperationType::CoinJoin,
            OperationType::Consolidation,
            OperationType::Rebalance,
            OperationType::Cleanup,
        ] {
            self.scheduler.register_handler(op_type, handler.clone()).await;
        }
    }

    fn pool_for(&self, currency: Currency) -> Result<&Arc<Pool>, CoordinatorError> {
        self.pools.get(&currency).ok_or(CoordinatorError::NoPoolForCurrency(currency))
    }

    async fn lock_for(&self, id: MixId) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.id_locks.lock().unwrap();
            locks.entry(id).or_insert_with(|| Arc::new(TokioMutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }

    // ---- create flow (§4.5) ----

    pub async fn create_mix(self: &Arc<Self>, request: CreateMixRequest) -> Result<CreateMixResponse, CoordinatorError> {
        if self.scheduler.is_near_capacity().await {
            return Err(CoordinatorError::SystemBusy);
        }

        let currency_key = request.currency.to_string();
        let currency_config = self
            .config
            .currencies
            .get(&currency_key)
            .ok_or(CoordinatorError::NoPoolForCurrency(request.currency))?;

        Validator::validate_create(request.currency, request.input_amount, &request.outputs, currency_config)
            .map_err(|e| match e {
                crate::validator::ValidationError::Outputs(e) => CoordinatorError::Validation(e),
                crate::validator::ValidationError::AmountOutOfRange { currency, amount, min, max } => {
                    CoordinatorError::AmountOutOfRange { currency, amount, min, max }
                }
            })?;

        let fee_calc = FeeCalculator::new(&self.config.anonymity);
        let fee_amount = fee_calc.compute_fee(request.input_amount, request.anonymity_level);
        let net_amount = fee_calc.net_amount(request.input_amount, request.anonymity_level);

        let algorithm_bits = self.key_algorithm_for(request.currency);
        let (key_ref, deposit_address) = self.generate_unique_deposit_address(request.currency, algorithm_bits).await?;

        let now = now_unix();
        let delay_minutes = self.config.anonymity.tier(request.anonymity_level).delay_minutes;
        let confirmations_required = currency_config.required_confirmations;

        let mix_id = MixId::random();
        let session_token = SessionToken::random();

        let mix_request = MixRequest {
            id: mix_id,
            session_token,
            currency: request.currency,
            input_amount: request.input_amount,
            fee_amount,
            net_amount,
            anonymity_level: request.anonymity_level,
            algorithm: request.algorithm,
            deposit_address: deposit_address.clone(),
            deposit_key_ref: Some(key_ref),
            outputs: request.outputs,
            delay_minutes,
            created_at_unix: now,
            expires_at_unix: now + 24 * 3600,
            status: MixStatus::PendingDeposit,
            confirmations_seen: 0,
            confirmations_required,
            payouts: Vec::new(),
        };

        self.store.insert_mix_request(&mix_request).await?;

        let watch_ref = self.confirmation.watch_address(request.currency, deposit_address.clone(), mix_id).await;
        self.watch_refs.lock().unwrap().insert(mix_id, watch_ref);

        info!("mix {mix_id} created: {} {} -> {} outputs", request.input_amount, request.currency, mix_request.outputs.len());

        Ok(CreateMixResponse {
            session_token,
            deposit_address,
            fee_amount,
            net_amount,
            expires_at_unix: mix_request.expires_at_unix,
            delay_minutes,
        })
    }

    fn key_algorithm_for(&self, currency: Currency) -> KeyAlgorithm {
        match currency {
            Currency::Sol => KeyAlgorithm::Ed25519,
            _ => KeyAlgorithm::Secp256k1,
        }
    }

    async fn generate_unique_deposit_address(
        &self,
        currency: Currency,
        algorithm: KeyAlgorithm,
    ) -> Result<(tumbler_types::KeyRef, String), CoordinatorError> {
        for attempt in 0..ADDRESS_RETRY_BUDGET {
            let key_ref = self.key_custody.generate_key(algorithm)?;
            let address = self.key_custody.derive_address(key_ref, currency)?;
            if self.store.deposit_address_in_use(currency, &address).await? {
                warn!("deposit address collision on attempt {attempt}, regenerating");
                self.key_custody.wipe(key_ref)?;
                continue;
            }
            return Ok((key_ref, address));
        }
        Err(CoordinatorError::AddressSpaceExhausted)
    }

    // ---- status / cancel ----

    pub async fn get_status(&self, token: SessionToken) -> Result<MixStatusResponse, CoordinatorError> {
        let req = self.store.get_mix_request_by_token(token).await?.ok_or(CoordinatorError::NotFound)?;
        Ok(self.status_response(&req))
    }

    fn status_response(&self, req: &MixRequest) -> MixStatusResponse {
        let tier = self.config.anonymity.tier(req.anonymity_level);
        // §9 open question: anonymity_score formula is a policy choice, not
        // a core invariant. Monotone in confirmations, delay and participant
        // floor, capped at 100.
        let score = (req.confirmations_seen as u32 * 3)
            .saturating_add(req.delay_minutes / 2)
            .saturating_add(tier.min_participants as u32 * 10)
            .min(100) as u8;
        MixStatusResponse {
            status: req.status,
            current_phase: req.status,
            confirmations_seen: req.confirmations_seen,
            confirmations_required: req.confirmations_required,
            anonymity_score: score,
            tx_hashes: req.payouts.iter().filter_map(|p| p.tx_hash.clone()).collect(),
        }
    }

    pub async fn cancel(&self, token: SessionToken) -> Result<(), CoordinatorError> {
        let req = self.store.get_mix_request_by_token(token).await?.ok_or(CoordinatorError::NotFound)?;
        let _guard = self.lock_for(req.id).await;
        let mut req = self.store.get_mix_request(req.id).await?.ok_or(CoordinatorError::NotFound)?;
        if !req.status.cancellable() {
            return Err(CoordinatorError::CannotCancel);
        }
        req.transition(MixStatus::Cancelled)?;
        self.store.save_mix_request(&req).await?;
        self.wipe_and_unwatch(&req).await;
        Ok(())
    }

    async fn wipe_and_unwatch(&self, req: &MixRequest) {
        if let Some(key_ref) = req.deposit_key_ref {
            if let Err(e) = self.key_custody.wipe(key_ref) {
                warn!("failed to wipe key for terminal mix {}: {e}", req.id);
            }
        }
        let watch_ref = self.watch_refs.lock().unwrap().remove(&req.id);
        if let Some(watch_ref) = watch_ref {
            let _ = self.confirmation.unwatch_address(watch_ref).await;
        }
    }

    // ---- deposit lifecycle (§4.5 "Deposit observed" / "Deposit confirmed") ----

    /// Bridges `ConfirmationMonitor`'s synchronous callback contract into
    /// this coordinator's async handling; each invocation spawns a task so
    /// the monitor's poll loop is never blocked by coordinator work.
    /// Built from a `Weak` rather than `self: &Arc<Self>`: the
    /// `ConfirmationMonitor` this callback feeds is itself a field of
    /// `MixCoordinator`, so the coordinator's own `Arc` doesn't exist yet
    /// when its `ConfirmationMonitor` is constructed. The node binary wires
    /// this with `Arc::new_cyclic`.
    pub fn deposit_callback(weak: std::sync::Weak<MixCoordinator>) -> tumbler_confirmation::DepositCallback {
        Arc::new(move |obs: DepositObservation| {
            let Some(coordinator) = weak.upgrade() else { return };
            tokio::spawn(async move {
                if let Err(e) = coordinator.handle_deposit_observed(obs).await {
                    warn!("deposit handling failed: {e}");
                }
            });
        })
    }

    pub fn late_deposit_callback(_weak: std::sync::Weak<MixCoordinator>) -> tumbler_confirmation::LateDepositCallback {
        Arc::new(move |mix_id, tx_hash, amount| {
            warn!("late deposit on mix {mix_id}: tx {tx_hash} amount {amount} (not mixed)");
        })
    }

    async fn handle_deposit_observed(self: &Arc<Self>, obs: DepositObservation) -> Result<(), CoordinatorError> {
        let _guard = self.lock_for(obs.mix_id).await;
        let mut req = self.store.get_mix_request(obs.mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        if req.status != MixStatus::PendingDeposit {
            return Ok(()); // already handled; confirmation callbacks are idempotent (§7 rule 3)
        }

        let tolerance = self
            .config
            .currencies
            .get(&req.currency.to_string())
            .and_then(|c| Amount::from_decimal_string(req.currency, &c.underpayment_tolerance).ok())
            .unwrap_or_else(|| Amount::zero(req.currency))
            .minor_units();

        match evaluate_deposit(req.input_amount, obs.observed_amount, tolerance) {
            DepositAcceptance::Accept => {
                req.transition(MixStatus::DepositReceived)?;
                self.store.save_mix_request(&req).await?;

                let coordinator = self.clone();
                let mix_id = req.id;
                let on_confirmed: tumbler_confirmation::ConfirmedCallback = Arc::new(move |_tracking: TrackingId| {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.deposit_confirmed(mix_id).await {
                            warn!("deposit confirmation handling failed for {mix_id}: {e}");
                        }
                    });
                });
                let coordinator = self.clone();
                let on_failed: tumbler_confirmation::FailedCallback = Arc::new(move |_tracking: TrackingId| {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = coordinator.deposit_failed(mix_id).await {
                            warn!("deposit failure handling failed for {mix_id}: {e}");
                        }
                    });
                });
                self.confirmation
                    .track_transaction(req.currency, obs.tx_hash, req.confirmations_required, now_unix(), on_confirmed, on_failed)
                    .await;
            }
            DepositAcceptance::Underpaid => {
                // §4.5 default: hold, then expire after the configured grace
                // period rather than the full 24h window.
                let grace = self.config.policy.underpayment_grace_period_secs;
                req.expires_at_unix = req.expires_at_unix.min(now_unix() + grace);
                self.store.save_mix_request(&req).await?;
                warn!("mix {} underpaid: observed {}", req.id, obs.observed_amount);
            }
        }
        Ok(())
    }

    async fn deposit_confirmed(self: &Arc<Self>, mix_id: MixId) -> Result<(), CoordinatorError> {
        let _guard = self.lock_for(mix_id).await;
        let mut req = self.store.get_mix_request(mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        if req.status != MixStatus::DepositReceived {
            return Ok(());
        }
        req.transition(MixStatus::Pooling)?;
        req.confirmations_seen = req.confirmations_required;
        self.store.save_mix_request(&req).await?;

        let pool = self.pool_for(req.currency)?;
        pool.deposit(mix_id, req.net_amount, now_unix());

        let currency = req.currency;
        let use_coinjoin = req.algorithm == Algorithm::CoinJoin
            && currency.common_denominations().contains(&req.input_amount.minor_units());

        if use_coinjoin {
            pool.join_coinjoin_queue(mix_id, req.net_amount, now_unix());
            let min_participants = currency.default_required_participants().max(2);
            if let Some(participants) = pool.coinjoin_ready(min_participants) {
                self.schedule_coinjoin(currency, participants).await?;
            }
        } else {
            self.schedule_payouts(mix_id).await?;
        }
        Ok(())
    }

    async fn deposit_failed(&self, mix_id: MixId) -> Result<(), CoordinatorError> {
        let _guard = self.lock_for(mix_id).await;
        let mut req = self.store.get_mix_request(mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        if req.status.is_terminal() {
            return Ok(());
        }
        req.transition(MixStatus::Failed)?;
        self.store.save_mix_request(&req).await?;
        self.wipe_and_unwatch(&req).await;
        Ok(())
    }

    // ---- payout scheduling (§4.5 "Payout scheduling") ----

    async fn schedule_payouts(self: &Arc<Self>, mix_id: MixId) -> Result<(), CoordinatorError> {
        let mut req = self.store.get_mix_request(mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        // Reached either straight from PoolMix deposit confirmation
        // (Pooling->Mixing) or from a completed CoinJoin leg that already
        // made this transition when the co-spend was scheduled.
        if req.status != MixStatus::Mixing {
            req.transition(MixStatus::Mixing)?;
        }

        let legs = req.split_net_amount();
        let now = now_unix();
        let mut payouts = Vec::with_capacity(legs.len());

        for (index, (output, amount)) in req.outputs.iter().zip(legs.iter()).enumerate() {
            let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
            let delay_secs = (req.delay_minutes as f64 * 60.0 * (1.0 + jitter)) as u64;
            let stagger = (index as u64) * 120; // >= 2 min stagger within the batch
            let scheduled_at = now + delay_secs + stagger;

            let payload = payload::encode(&DistributionPayload {
                mix_id,
                currency: req.currency,
                output_index: index,
                address: output.address.clone(),
                amount_minor_units: amount.minor_units(),
            });

            let op = build_operation(
                OperationType::Distribution,
                scheduled_at,
                payload,
                Some(mix_id),
                self.scheduler_max_retries(),
                now,
            );
            let op_id = self.schedule_with_callbacks(op).await?;

            payouts.push(tumbler_types::PayoutLeg {
                output_index: index,
                amount: *amount,
                scheduled_operation: Some(op_id),
                tx_hash: None,
                confirmed: false,
            });
        }

        req.payouts = payouts;
        req.transition(MixStatus::PayingOut)?;
        self.store.save_mix_request(&req).await?;
        Ok(())
    }

    fn scheduler_max_retries(&self) -> u32 {
        self.config.scheduler.max_retries
    }

    async fn schedule_with_callbacks(self: &Arc<Self>, op: ScheduledOperation) -> Result<OperationId, CoordinatorError> {
        let on_completed: tumbler_scheduler::OnCompletedCallback = Arc::new(move |id, op_type, mix_id| {
            info!("operation {id} ({op_type:?}) for mix {mix_id:?} completed");
        });
        let coordinator = self.clone();
        let on_failed: tumbler_scheduler::OnFailedCallback = Arc::new(move |id, op_type, mix_id| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                if let Some(mix_id) = mix_id {
                    if let Err(e) = coordinator.operation_failed(mix_id, op_type).await {
                        warn!("failure handling for operation {id} ({op_type:?}) errored: {e}");
                    }
                }
            });
        });
        self.scheduler.schedule(op, Some(on_completed), Some(on_failed)).await.map_err(CoordinatorError::from)
    }

    /// A DISTRIBUTION/COINJOIN operation exhausting retries fails the whole
    /// mix (§4.5 payout failure policy). A Rebalance/Cleanup failure is
    /// housekeeping and does not touch any MixRequest.
    async fn operation_failed(&self, mix_id: MixId, op_type: OperationType) -> Result<(), CoordinatorError> {
        if !matches!(op_type, OperationType::Distribution | OperationType::CoinJoin) {
            return Ok(());
        }
        let _guard = self.lock_for(mix_id).await;
        let mut req = self.store.get_mix_request(mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        if req.status.is_terminal() {
            return Ok(());
        }
        req.transition(MixStatus::Failed)?;
        self.store.save_mix_request(&req).await?;
        self.wipe_and_unwatch(&req).await;
        Ok(())
    }

    // ---- CoinJoin flow (§4.6) ----

    async fn schedule_coinjoin(
        self: &Arc<Self>,
        currency: Currency,
        participants: Vec<tumbler_pool::QueuedParticipant>,
    ) -> Result<(), CoordinatorError> {
        let mix_ids: Vec<MixId> = participants.iter().map(|p| p.mix_id).collect();
        for mix_id in &mix_ids {
            let _guard = self.lock_for(*mix_id).await;
            let mut req = self.store.get_mix_request(*mix_id).await?.ok_or(CoordinatorError::NotFound)?;
            if req.status != MixStatus::Pooling {
                continue;
            }
            req.transition(MixStatus::Mixing)?;
            self.store.save_mix_request(&req).await?;
        }

        let payload = payload::encode(&CoinJoinPayload {
            currency,
            participants: participants
                .iter()
                .map(|p| CoinJoinParticipant { mix_id: p.mix_id, amount_minor_units: p.amount.minor_units() })
                .collect(),
        });
        let now = now_unix();
        let op = build_operation(OperationType::CoinJoin, now, payload, mix_ids.first().copied(), self.scheduler_max_retries(), now);
        self.schedule_with_callbacks(op).await?;
        Ok(())
    }

    async fn run_coinjoin(self: &Arc<Self>, payload: &CoinJoinPayload) -> Result<(), HandlerError> {
        let client = self.clients.get(&payload.currency).ok_or_else(|| {
            HandlerError::Fatal(format!("no BlockchainClient for {}", payload.currency))
        })?;
        let pool = self
            .pools
            .get(&payload.currency)
            .ok_or_else(|| HandlerError::Fatal(format!("no pool for {}", payload.currency)))?;

        // Participants already deposited into this currency's shared pool
        // (§4.3); reserving the co-spend's total amount draws fungibly from
        // that liquidity rather than needing to track which physical entry
        // belongs to which participant.
        let total: u128 = payload.participants.iter().map(|p| p.amount_minor_units).sum();
        let reservation = pool.reserve(total).map_err(|e| HandlerError::Temporary(e.to_string()))?;

        let mut inputs = Vec::with_capacity(payload.participants.len());
        let mut outputs = Vec::with_capacity(payload.participants.len());
        let mut signer_refs = Vec::with_capacity(payload.participants.len());

        for participant in &payload.participants {
            let req = self
                .store
                .get_mix_request(participant.mix_id)
                .await
                .map_err(|e| HandlerError::Temporary(e.to_string()))?
                .ok_or_else(|| HandlerError::Fatal("coinjoin participant vanished from store".into()))?;

            inputs.push(tumbler_confirmation::blockchain_client::TxInputRef { reference: req.deposit_address.clone() });

            let destination = match self.config.policy.coinjoin_output_routing {
                tumbler_config::CoinJoinOutputRouting::Direct => req
                    .outputs
                    .first()
                    .map(|o| o.address.clone())
                    .ok_or_else(|| HandlerError::Fatal("participant has no configured output".into()))?,
                tumbler_config::CoinJoinOutputRouting::HoldingAddress => self.holding_address_for(payload.currency)?,
            };
            outputs.push(tumbler_confirmation::blockchain_client::TxOutputSpec {
                address: destination,
                amount_minor_units: participant.amount_minor_units,
            });

            let key_ref = req.deposit_key_ref.ok_or_else(|| HandlerError::Fatal("missing deposit key ref".into()))?;
            signer_refs.push(key_ref.to_hex());
        }

        // One co-spend transaction signed once per input reference; our
        // simplified `BlockchainClient::build_and_sign` takes a single
        // signer, so the first participant's key stands in for the
        // multi-signer co-spend a real chain-specific client would perform.
        let signer = signer_refs.first().cloned().unwrap_or_default();
        let raw_tx = match client.build_and_sign(&inputs, &outputs, &signer).await {
            Ok(tx) => tx,
            Err(e) => {
                let _ = pool.release(reservation);
                return Err(HandlerError::Temporary(e.to_string()));
            }
        };
        let tx_hash = match client.broadcast(&raw_tx).await {
            Ok(hash) => hash,
            Err(e) => {
                let _ = pool.release(reservation);
                return Err(HandlerError::Temporary(e.to_string()));
            }
        };
        if let Err(e) = pool.consume(reservation) {
            warn!("reservation consume failed after coinjoin broadcast for {}: {e}", payload.currency);
        }

        for participant in &payload.participants {
            let mix_id = participant.mix_id;
            let required = self
                .store
                .get_mix_request(mix_id)
                .await
                .map_err(|e| HandlerError::Temporary(e.to_string()))?
                .map(|r| r.confirmations_required)
                .unwrap_or(6);
            let on_confirmed = self.coinjoin_confirmed_callback(mix_id);
            let on_failed = self.coinjoin_failed_callback(mix_id);
            self.confirmation
                .track_transaction(payload.currency, tx_hash.clone(), required, now_unix(), on_confirmed, on_failed)
                .await;
        }
        Ok(())
    }

    fn holding_address_for(&self, currency: Currency) -> Result<String, HandlerError> {
        let mut addrs = self.holding_addresses.lock().unwrap();
        if let Some(addr) = addrs.get(&currency) {
            return Ok(addr.clone());
        }
        let algorithm = self.key_algorithm_for(currency);
        let key_ref = self
            .key_custody
            .generate_key(algorithm)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;
        self.key_custody.mark_terminal_safe(key_ref).map_err(|e| HandlerError::Fatal(e.to_string()))?;
        let addr = self.key_custody.derive_address(key_ref, currency).map_err(|e| HandlerError::Fatal(e.to_string()))?;
        addrs.insert(currency, addr.clone());
        Ok(addr)
    }

    fn coinjoin_confirmed_callback(self: &Arc<Self>, mix_id: MixId) -> tumbler_confirmation::ConfirmedCallback {
        let coordinator = self.clone();
        Arc::new(move |_tracking| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.coinjoin_leg_confirmed(mix_id).await {
                    warn!("coinjoin confirmation handling failed for {mix_id}: {e}");
                }
            });
        })
    }

    fn coinjoin_failed_callback(self: &Arc<Self>, mix_id: MixId) -> tumbler_confirmation::FailedCallback {
        let coordinator = self.clone();
        Arc::new(move |_tracking| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.operation_failed(mix_id, OperationType::CoinJoin).await {
                    warn!("coinjoin failure handling errored for {mix_id}: {e}");
                }
            });
        })
    }

    async fn coinjoin_leg_confirmed(self: &Arc<Self>, mix_id: MixId) -> Result<(), CoordinatorError> {
        let _guard = self.lock_for(mix_id).await;
        let req = self.store.get_mix_request(mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        if req.status != MixStatus::Mixing {
            return Ok(());
        }
        if req.outputs.len() <= 1 && req.payouts.is_empty() {
            // Single-output co-spend: the CoinJoin leg itself is the payout.
            let mut req = req;
            req.payouts = vec![tumbler_types::PayoutLeg { output_index: 0, amount: req.net_amount, scheduled_operation: None, tx_hash: None, confirmed: true }];
            req.transition(MixStatus::PayingOut)?;
            req.transition(MixStatus::Completed)?;
            self.store.save_mix_request(&req).await?;
            self.wipe_and_unwatch(&req).await;
            Ok(())
        } else {
            self.schedule_payouts(mix_id).await
        }
    }

    // ---- Distribution / payout confirmation ----

    async fn run_distribution(self: &Arc<Self>, payload: &DistributionPayload) -> Result<(), HandlerError> {
        let client = self
            .clients
            .get(&payload.currency)
            .ok_or_else(|| HandlerError::Fatal(format!("no BlockchainClient for {}", payload.currency)))?;
        let pool = self
            .pools
            .get(&payload.currency)
            .ok_or_else(|| HandlerError::Fatal(format!("no pool for {}", payload.currency)))?;

        let reservation = pool.reserve(payload.amount_minor_units).map_err(|e| HandlerError::Temporary(e.to_string()))?;

        let outputs = [tumbler_confirmation::blockchain_client::TxOutputSpec {
            address: payload.address.clone(),
            amount_minor_units: payload.amount_minor_units,
        }];
        let req = self
            .store
            .get_mix_request(payload.mix_id)
            .await
            .map_err(|e| HandlerError::Temporary(e.to_string()))?
            .ok_or_else(|| HandlerError::Fatal("mix request vanished from store".into()))?;
        let signer = req.deposit_key_ref.map(|k| k.to_hex()).unwrap_or_default();

        let raw_tx = match client.build_and_sign(&[], &outputs, &signer).await {
            Ok(tx) => tx,
            Err(e) => {
                let _ = pool.release(reservation);
                return Err(HandlerError::Temporary(e.to_string()));
            }
        };
        let tx_hash = match client.broadcast(&raw_tx).await {
            Ok(hash) => hash,
            Err(e) => {
                let _ = pool.release(reservation);
                return Err(HandlerError::Temporary(e.to_string()));
            }
        };
        // Broadcast success is irrevocable: the funds have left the pool
        // regardless of how long chain confirmation takes, so the
        // reservation is consumed here rather than on confirmation.
        if let Err(e) = pool.consume(reservation) {
            warn!("reservation consume failed after broadcast for mix {}: {e}", payload.mix_id);
        }

        let mix_id = payload.mix_id;
        let output_index = payload.output_index;
        if let Some(mut req) = self.store.get_mix_request(mix_id).await.map_err(|e| HandlerError::Temporary(e.to_string()))? {
            if let Some(leg) = req.payouts.get_mut(output_index) {
                leg.tx_hash = Some(tx_hash.clone());
            }
            let confirmations_required = req.confirmations_required;
            self.store.save_mix_request(&req).await.map_err(|e| HandlerError::Temporary(e.to_string()))?;

            let on_confirmed = self.payout_confirmed_callback(mix_id, output_index);
            let on_failed = self.payout_failed_callback(mix_id);
            self.confirmation
                .track_transaction(payload.currency, tx_hash, confirmations_required, now_unix(), on_confirmed, on_failed)
                .await;
        }

        Ok(())
    }

    fn payout_confirmed_callback(self: &Arc<Self>, mix_id: MixId, output_index: usize) -> tumbler_confirmation::ConfirmedCallback {
        let coordinator = self.clone();
        Arc::new(move |_tracking| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.payout_confirmed(mix_id, output_index).await {
                    warn!("payout confirmation handling failed for {mix_id}: {e}");
                }
            });
        })
    }

    fn payout_failed_callback(self: &Arc<Self>, mix_id: MixId) -> tumbler_confirmation::FailedCallback {
        let coordinator = self.clone();
        Arc::new(move |_tracking| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.operation_failed(mix_id, OperationType::Distribution).await {
                    warn!("payout failure handling errored for {mix_id}: {e}");
                }
            });
        })
    }

    async fn payout_confirmed(&self, mix_id: MixId, output_index: usize) -> Result<(), CoordinatorError> {
        let _guard = self.lock_for(mix_id).await;
        let mut req = self.store.get_mix_request(mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        if req.status.is_terminal() {
            return Ok(());
        }
        if let Some(leg) = req.payouts.get_mut(output_index) {
            leg.confirmed = true;
        }
        let all_confirmed = !req.payouts.is_empty() && req.payouts.iter().all(|leg| leg.confirmed);
        self.store.save_mix_request(&req).await?;

        if all_confirmed {
            req.transition(MixStatus::Completed)?;
            self.store.save_mix_request(&req).await?;
            self.wipe_and_unwatch(&req).await;
            info!("mix {mix_id} completed");
        }
        Ok(())
    }

    // ---- housekeeping ----

    pub async fn check_expiries(&self) -> Result<usize, CoordinatorError> {
        // Demo-adapter Stores are expected to expose enumeration for this;
        // the trait-only boundary here keeps it to what the coordinator can
        // act on once a candidate id is known (node binary drives the scan).
        Ok(0)
    }

    pub async fn expire_one(&self, mix_id: MixId) -> Result<(), CoordinatorError> {
        let _guard = self.lock_for(mix_id).await;
        let mut req = self.store.get_mix_request(mix_id).await?.ok_or(CoordinatorError::NotFound)?;
        if req.status.is_terminal() || now_unix() < req.expires_at_unix {
            return Ok(());
        }
        req.transition(MixStatus::Expired)?;
        self.store.save_mix_request(&req).await?;
        self.wipe_and_unwatch(&req).await;
        Ok(())
    }
}

fn build_operation(
    op_type: OperationType,
    scheduled_at_unix: u64,
    payload: OperationPayload,
    mix_id: Option<MixId>,
    max_retries: u32,
    now: u64,
) -> ScheduledOperation {
    ScheduledOperation {
        id: OperationId::random(),
        op_type,
        priority: op_type.default_priority(),
        scheduled_at_unix,
        payload,
        mix_id,
        retry_count: 0,
        max_retries,
        status: OperationStatus::Scheduled,
        created_at_unix: now,
        ttl_secs: 7 * 24 * 3600,
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MixCoordinator {
    /// The actual per-`OperationType` dispatch (§3: Scheduler hands the
    /// opaque payload to whichever handler owns that type). Needs
    /// `Arc<Self>` because Distribution/CoinJoin register confirmation
    /// callbacks that must outlive this call; see [`CoordinatorHandler`].
    async fn run_operation(self: &Arc<Self>, op: &ScheduledOperation, _cancel: CancelToken) -> Result<(), HandlerError> {
        match op.op_type {
            OperationType::Distribution => {
                let payload: DistributionPayload =
                    payload::decode(&op.payload).map_err(|e| HandlerError::Fatal(e.to_string()))?;
                self.run_distribution(&payload).await
            }
            OperationType::CoinJoin => {
                let payload: CoinJoinPayload =
                    payload::decode(&op.payload).map_err(|e| HandlerError::Fatal(e.to_string()))?;
                self.run_coinjoin(&payload).await
            }
            OperationType::Consolidation => {
                let _payload: CurrencyPayload =
                    payload::decode(&op.payload).map_err(|e| HandlerError::Fatal(e.to_string()))?;
                // Consolidating pool UTXOs into fewer, larger entries is a
                // BlockchainClient-specific optimization with no behavior
                // this simplified client can exercise meaningfully; treated
                // as a no-op success so its scheduling/retry machinery is
                // still exercised end-to-end.
                Ok(())
            }
            OperationType::Rebalance => {
                let payload: CurrencyPayload =
                    payload::decode(&op.payload).map_err(|e| HandlerError::Fatal(e.to_string()))?;
                info!("rebalance requested for {}; external liquidity sourcing is out of scope", payload.currency);
                Ok(())
            }
            OperationType::Cleanup => {
                let payload: CurrencyPayload =
                    payload::decode(&op.payload).map_err(|e| HandlerError::Fatal(e.to_string()))?;
                if let Some(pool) = self.pools.get(&payload.currency) {
                    pool.purge_consumed(now_unix(), 7 * 24 * 3600);
                }
                Ok(())
            }
        }
    }
}

/// Thin `OperationHandler` adapter holding the `Arc<MixCoordinator>` the
/// trait's `&self` receiver can't carry on its own (§3's typed-handler
/// seam takes `&self`, but payout confirmation tracking needs to outlive
/// a single `execute` call).
struct CoordinatorHandler(Arc<MixCoordinator>);

#[async_trait::async_trait]
impl OperationHandler for CoordinatorHandler {
    async fn execute(&self, op: &ScheduledOperation, cancel: CancelToken) -> Result<(), HandlerError> {
        self.0.run_operation(op, cancel).await
    }
}

impl MixCoordinator {
    /// Builds and schedules the periodic CLEANUP operation for `currency`.
    /// Intended to be called by the node binary's housekeeping loop.
    pub async fn schedule_cleanup(self: &Arc<Self>, currency: Currency) -> Result<(), CoordinatorError> {
        let now = now_unix();
        let op = build_operation(OperationType::Cleanup, now, payload::encode(&CurrencyPayload { currency }), None, 1, now);
        self.schedule_with_callbacks(op).await?;
        Ok(())
    }

    pub async fn schedule_rebalance_if_needed(self: &Arc<Self>, currency: Currency) -> Result<(), CoordinatorError> {
        let pool = self.pool_for(currency)?;
        if pool.needs_rebalance(now_unix()) {
            let now = now_unix();
            let op = build_operation(OperationType::Rebalance, now, payload::encode(&CurrencyPayload { currency }), None, 1, now);
            self.schedule_with_callbacks(op).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex as AsyncMutex;
    use crate::error::StoreError;
    use tumbler_config::{AnonymityConfig, CurrencyConfig, PolicyConfig, SchedulerConfig};
    use tumbler_keycustody::SoftwareKeystore;

    struct FakeStore {
        by_id: AsyncMutex<StdHashMap<MixId, MixRequest>>,
    }

    impl FakeStore {
        fn new() -> Self {
            FakeStore { by_id: AsyncMutex::new(StdHashMap::new()) }
        }
    }

    #[async_trait::async_trait]
    impl Store for FakeStore {
        async fn insert_mix_request(&self, req: &MixRequest) -> Result<(), StoreError> {
            let mut by_id = self.by_id.lock().await;
            if by_id.values().any(|r| r.currency == req.currency && r.deposit_address == req.deposit_address) {
                return Err(StoreError::AddressConflict);
            }
            by_id.insert(req.id, req.clone());
            Ok(())
        }

        async fn save_mix_request(&self, req: &MixRequest) -> Result<(), StoreError> {
            self.by_id.lock().await.insert(req.id, req.clone());
            Ok(())
        }

        async fn get_mix_request(&self, id: MixId) -> Result<Option<MixRequest>, StoreError> {
            Ok(self.by_id.lock().await.get(&id).cloned())
        }

        async fn get_mix_request_by_token(&self, token: SessionToken) -> Result<Option<MixRequest>, StoreError> {
            Ok(self.by_id.lock().await.values().find(|r| r.session_token == token).cloned())
        }

        async fn deposit_address_in_use(&self, currency: Currency, address: &str) -> Result<bool, StoreError> {
            Ok(self.by_id.lock().await.values().any(|r| r.currency == currency && r.deposit_address == address))
        }
    }

    fn test_config() -> TumblerConfig {
        let mut currencies = StdHashMap::new();
        currencies.insert(
            "BTC".to_string(),
            CurrencyConfig {
                min_amount: "0.001".into(),
                max_amount: "10".into(),
                required_confirmations: 2,
                min_pool_size: "0".into(),
                max_pool_size: "100".into(),
                target_pool_size: "1".into(),
                poll_interval_ms: 15_000,
                address_format_rules: vec![],
                underpayment_tolerance: "0.0001".into(),
            },
        );
        TumblerConfig {
            currencies,
            anonymity: AnonymityConfig::default(),
            scheduler: SchedulerConfig::default(),
            keystore: Default::default(),
            hsm: None,
            policy: PolicyConfig::default(),
        }
    }

    fn test_coordinator() -> Arc<MixCoordinator> {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let key_custody = Arc::new(KeyCustody::software(Arc::new(SoftwareKeystore::new([7u8; 32], 100))));
        let monitor = Arc::new(ConfirmationMonitor::new(
            StdHashMap::new(),
            StdHashMap::new(),
            Arc::new(|_obs| {}),
            Arc::new(|_mix_id, _tx_hash, _amount| {}),
        ));
        let mut pools = StdHashMap::new();
        pools.insert(
            Currency::Btc,
            Arc::new(Pool::new(
                Currency::Btc,
                tumbler_pool::HealthParams { min_pool_size: 0, max_pool_size: u128::MAX, max_pool_age_secs: 86_400 },
                1,
                0,
            )),
        );
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        Arc::new(MixCoordinator::new(store, key_custody, monitor, pools, scheduler, StdHashMap::new(), test_config()))
    }

    fn sample_outputs() -> Vec<OutputSplit> {
        vec![OutputSplit { address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(), basis_points: 10_000 }]
    }

    #[tokio::test]
    async fn create_mix_persists_request_and_computes_fee() {
        let coordinator = test_coordinator();
        let input = Amount::from_decimal_string(Currency::Btc, "0.5").unwrap();
        let response = coordinator
            .create_mix(CreateMixRequest {
                currency: Currency::Btc,
                input_amount: input,
                outputs: sample_outputs(),
                anonymity_level: AnonymityLevel::Medium,
                algorithm: Algorithm::PoolMix,
            })
            .await
            .unwrap();

        assert_eq!(response.fee_amount.to_decimal_string(), "0.00900000");
        assert!(Currency::Btc.address_looks_valid(&response.deposit_address));

        let status = coordinator.get_status(response.session_token).await.unwrap();
        assert_eq!(status.status, MixStatus::PendingDeposit);
        assert_eq!(status.confirmations_required, 2);
    }

    #[tokio::test]
    async fn create_mix_rejects_amount_below_minimum() {
        let coordinator = test_coordinator();
        let input = Amount::from_decimal_string(Currency::Btc, "0.00001").unwrap();
        let err = coordinator
            .create_mix(CreateMixRequest {
                currency: Currency::Btc,
                input_amount: input,
                outputs: sample_outputs(),
                anonymity_level: AnonymityLevel::Low,
                algorithm: Algorithm::PoolMix,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AmountOutOfRange { .. }));
    }

    #[tokio::test]
    async fn cancel_before_deposit_succeeds_then_rejects_repeat() {
        let coordinator = test_coordinator();
        let input = Amount::from_decimal_string(Currency::Btc, "0.1").unwrap();
        let response = coordinator
            .create_mix(CreateMixRequest {
                currency: Currency::Btc,
                input_amount: input,
                outputs: sample_outputs(),
                anonymity_level: AnonymityLevel::Low,
                algorithm: Algorithm::PoolMix,
            })
            .await
            .unwrap();

        coordinator.cancel(response.session_token).await.unwrap();
        let status = coordinator.get_status(response.session_token).await.unwrap();
        assert_eq!(status.status, MixStatus::Cancelled);

        let err = coordinator.cancel(response.session_token).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::CannotCancel));
    }

    #[tokio::test]
    async fn deposit_confirmed_schedules_one_distribution_per_output() {
        let coordinator = test_coordinator();
        let input = Amount::from_decimal_string(Currency::Btc, "0.2").unwrap();
        let response = coordinator
            .create_mix(CreateMixRequest {
                currency: Currency::Btc,
                input_amount: input,
                outputs: sample_outputs(),
                anonymity_level: AnonymityLevel::Low,
                algorithm: Algorithm::PoolMix,
            })
            .await
            .unwrap();

        let req = coordinator.store.get_mix_request_by_token(response.session_token).await.unwrap().unwrap();
        coordinator
            .handle_deposit_observed(DepositObservation {
                mix_id: req.id,
                tx_hash: "deadbeef".into(),
                observed_amount: input,
                confirmations: 0,
                first_seen_unix: 0,
                last_seen_unix: 0,
            })
            .await
            .unwrap();
        coordinator.deposit_confirmed(req.id).await.unwrap();

        let status = coordinator.get_status(response.session_token).await.unwrap();
        assert_eq!(status.status, MixStatus::PayingOut);
        let req = coordinator.store.get_mix_request(req.id).await.unwrap().unwrap();
        assert_eq!(req.payouts.len(), 1);
        assert!(req.payouts[0].scheduled_operation.is_some());

        let stats = coordinator.scheduler.stats().await;
        assert_eq!(stats.scheduled, 1);
    }

    #[tokio::test]
    async fn underpaid_deposit_does_not_advance_status() {
        let coordinator = test_coordinator();
        let input = Amount::from_decimal_string(Currency::Btc, "0.2").unwrap();
        let response = coordinator
            .create_mix(CreateMixRequest {
                currency: Currency::Btc,
                input_amount: input,
                outputs: sample_outputs(),
                anonymity_level: AnonymityLevel::Low,
                algorithm: Algorithm::PoolMix,
            })
            .await
            .unwrap();

        let req = coordinator.store.get_mix_request_by_token(response.session_token).await.unwrap().unwrap();
        let short = Amount::from_decimal_string(Currency::Btc, "0.1").unwrap();
        coordinator
            .handle_deposit_observed(DepositObservation {
                mix_id: req.id,
                tx_hash: "short".into(),
                observed_amount: short,
                confirmations: 0,
                first_seen_unix: 0,
                last_seen_unix: 0,
            })
            .await
            .unwrap();

        let status = coordinator.get_status(response.session_token).await.unwrap();
        assert_eq!(status.status, MixStatus::PendingDeposit);
    }
}

//! Scheduler (§4.4): bounded concurrent execution of dated operations with
//! retries. One instance per node process; MixCoordinator and Pool schedule
//! operations against it and register the handler that knows how to run
//! each `OperationType`.

pub mod error;
pub mod handler;

pub use error::{HandlerError, SchedulerError};
pub use handler::{CancelToken, OnCompletedCallback, OnFailedCallback, OperationHandler};

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;

use tumbler_config::SchedulerConfig;
use tumbler_types::{OperationId, OperationStatus, OperationType, ReadyKey, ScheduledOperation};

struct Job {
    op: ScheduledOperation,
    on_completed: Option<OnCompletedCallback>,
    on_failed: Option<OnFailedCallback>,
}

struct ExecutionContext {
    cancel: CancelToken,
    started_at_unix: u64,
    op_type: OperationType,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub scheduled: usize,
    pub ready: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct Inner {
    operations: HashMap<OperationId, Job>,
    ready_queue: BinaryHeap<ReadyKey>,
    active: HashMap<OperationId, ExecutionContext>,
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    config: SchedulerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Scheduler {
            inner: Mutex::new(Inner {
                operations: HashMap::new(),
                ready_queue: BinaryHeap::new(),
                active: HashMap::new(),
                handlers: HashMap::new(),
            }),
            config,
            shutdown_tx,
        }
    }

    pub async fn register_handler(&self, op_type: OperationType, handler: Arc<dyn OperationHandler>) {
        self.inner.lock().await.handlers.insert(op_type, handler);
    }

    /// Enqueues `op` (already built by the caller with `OperationId::random()`
    /// and `status = SCHEDULED`). Rejects with `AtCapacity` once the
    /// scheduled table reaches its bound, per §4.4's capacity-10000 table.
    pub async fn schedule(
        &self,
        op: ScheduledOperation,
        on_completed: Option<OnCompletedCallback>,
        on_failed: Option<OnFailedCallback>,
    ) -> Result<OperationId, SchedulerError> {
        const CAPACITY: usize = 10_000;
        let mut inner = self.inner.lock().await;
        if inner.operations.len() >= CAPACITY {
            return Err(SchedulerError::AtCapacity(CAPACITY));
        }
        let id = op.id;
        inner.operations.insert(id, Job { op, on_completed, on_failed });
        Ok(id)
    }

    /// Backpressure check for request intake (§5): reject new mix creation
    /// once the scheduled table is 90% full.
    pub async fn is_near_capacity(&self) -> bool {
        const CAPACITY: usize = 10_000;
        let inner = self.inner.lock().await;
        inner.operations.len() as f64 >= 0.9 * CAPACITY as f64
    }

    /// Idempotent cancellation: aborts an active op's cancel token and marks
    /// it CANCELLED; a pending op is marked CANCELLED and skipped by the
    /// next promotion/execution pass (lazy removal from `ready_queue`).
    pub async fn cancel(&self, id: OperationId) {
        let mut inner = self.inner.lock().await;
        if let Some(ctx) = inner.active.get(&id) {
            ctx.cancel.cancel();
        }
        if let Some(job) = inner.operations.get_mut(&id) {
            if !job.op.is_terminal() {
                job.op.status = OperationStatus::Cancelled;
            }
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock().await;
        let mut stats = SchedulerStats::default();
        for job in inner.operations.values() {
            match job.op.status {
                OperationStatus::Scheduled => stats.scheduled += 1,
                OperationStatus::Ready => stats.ready += 1,
                OperationStatus::Executing => stats.active += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Spawns the promotion loop, execution loop and stuck-operation reaper.
    /// Call once at startup after registering all handlers.
    pub fn spawn_all(self: &Arc<Self>) {
        self.spawn_promotion_loop();
        self.spawn_execution_loop();
        self.spawn_stuck_reaper();
    }

    fn spawn_promotion_loop(self: &Arc<Self>) {
        let scheduler = self.clone();
        let mut rx = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(scheduler.config.schedule_check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.promote_once(now_unix()).await,
                    _ = rx.recv() => break,
                }
            }
        });
    }

    async fn promote_once(&self, now: u64) {
        let mut inner = self.inner.lock().await;

        let expired: Vec<OperationId> = inner
            .operations
            .values()
            .filter(|j| !j.op.is_terminal() && j.op.is_expired(now))
            .map(|j| j.op.id)
            .collect();
        for id in expired {
            if let Some(job) = inner.operations.get_mut(&id) {
                warn!("operation {id} ({:?}) exceeded its ttl, marking FAILED", job.op.op_type);
                job.op.status = OperationStatus::Failed;
                if let Some(cb) = job.on_failed.clone() {
                    cb(id, job.op.op_type, job.op.mix_id);
                }
            }
        }

        let mut due: Vec<OperationId> = inner
            .operations
            .values()
            .filter(|j| j.op.status == OperationStatus::Scheduled && j.op.scheduled_at_unix <= now)
            .map(|j| j.op.id)
            .collect();
        due.truncate(self.config.batch_size.max(1));
        for id in due {
            if let Some(job) = inner.operations.get_mut(&id) {
                job.op.status = OperationStatus::Ready;
                let priority = job.op.priority;
                let scheduled_at_unix = job.op.scheduled_at_unix;
                inner.ready_queue.push(ReadyKey {
                    priority,
                    scheduled_at_unix,
                    id,
                });
            }
        }
    }

    fn spawn_execution_loop(self: &Arc<Self>) {
        let scheduler = self.clone();
        let mut rx = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(scheduler.config.execution_loop_ms);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.dispatch_once().await,
                    _ = rx.recv() => break,
                }
            }
        });
    }

    async fn dispatch_once(self: &Arc<Self>) {
        let mut to_spawn: Vec<(OperationId, OperationType)> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let mut deferred = Vec::new();
            while inner.active.len() < self.config.max_concurrent {
                let Some(key) = inner.ready_queue.pop() else { break };
                let Some(job) = inner.operations.get(&key.id) else { continue };
                if job.op.status != OperationStatus::Ready {
                    continue;
                }
                let op_type = job.op.op_type;
                if self.sub_cap_full(&inner, op_type) {
                    deferred.push(key);
                    continue;
                }
                let cancel = CancelToken::new();
                inner.active.insert(key.id, ExecutionContext { cancel, started_at_unix: now_unix(), op_type });
                inner.operations.get_mut(&key.id).unwrap().op.status = OperationStatus::Executing;
                to_spawn.push((key.id, op_type));
            }
            for key in deferred {
                inner.ready_queue.push(key);
            }
        }

        for (id, _op_type) in to_spawn {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_one(id).await;
            });
        }
    }

    fn sub_cap_full(&self, inner: &Inner, op_type: OperationType) -> bool {
        let cap = match op_type {
            OperationType::Distribution => self.config.sub_caps.distribution,
            OperationType::Consolidation => self.config.sub_caps.consolidation,
            OperationType::CoinJoin => self.config.sub_caps.coinjoin,
            OperationType::Rebalance => self.config.sub_caps.rebalance,
            OperationType::Cleanup => self.config.sub_caps.cleanup,
        };
        let in_flight = inner.active.values().filter(|ctx| ctx.op_type == op_type).count();
        in_flight >= cap
    }

    async fn run_one(self: Arc<Self>, id: OperationId) {
        let (op, handler, cancel) = {
            let inner = self.inner.lock().await;
            let Some(job) = inner.operations.get(&id) else { return };
            let Some(ctx) = inner.active.get(&id) else { return };
            let Some(handler) = inner.handlers.get(&job.op.op_type).cloned() else {
                drop(inner);
                self.finish_without_handler(id).await;
                return;
            };
            (job.op.clone(), handler, ctx.cancel.clone())
        };

        let result = handler.execute(&op, cancel).await;
        self.finish(id, result).await;
    }

    async fn finish_without_handler(&self, id: OperationId) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(&id);
        if let Some(job) = inner.operations.get_mut(&id) {
            job.op.status = OperationStatus::Failed;
            warn!("operation {id} has no registered handler for {:?}", job.op.op_type);
            if let Some(cb) = job.on_failed.clone() {
                cb(id, job.op.op_type, job.op.mix_id);
            }
        }
    }

    async fn finish(&self, id: OperationId, result: Result<(), HandlerError>) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(&id);
        let Some(job) = inner.operations.get_mut(&id) else { return };
        if job.op.status == OperationStatus::Cancelled {
            return;
        }

        match result {
            Ok(()) => {
                job.op.status = OperationStatus::Completed;
                info!("operation {id} ({:?}) completed", job.op.op_type);
                if let Some(cb) = job.on_completed.clone() {
                    cb(id, job.op.op_type, job.op.mix_id);
                }
            }
            Err(HandlerError::Fatal(msg)) => {
                job.op.status = OperationStatus::Failed;
                warn!("operation {id} ({:?}) failed fatally: {msg}", job.op.op_type);
                if let Some(cb) = job.on_failed.clone() {
                    cb(id, job.op.op_type, job.op.mix_id);
                }
            }
            Err(HandlerError::Temporary(msg)) => {
                if job.op.retry_count < job.op.max_retries {
                    job.op.retry_count += 1;
                    let backoff = self
                        .config
                        .retry_backoff_multiplier
                        .saturating_pow(job.op.retry_count)
                        .saturating_mul(self.config.base_backoff_secs as u32) as u64;
                    job.op.scheduled_at_unix = now_unix() + backoff;
                    job.op.status = OperationStatus::Scheduled;
                    warn!(
                        "operation {id} ({:?}) temporary failure ({msg}), retry {}/{} in {backoff}s",
                        job.op.op_type, job.op.retry_count, job.op.max_retries
                    );
                } else {
                    job.op.status = OperationStatus::Failed;
                    warn!("operation {id} ({:?}) exhausted retries: {msg}", job.op.op_type);
                    if let Some(cb) = job.on_failed.clone() {
                        cb(id, job.op.op_type, job.op.mix_id);
                    }
                }
            }
        }
    }

    fn spawn_stuck_reaper(self: &Arc<Self>) {
        let scheduler = self.clone();
        let mut rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.reap_stuck_once(now_unix()).await,
                    _ = rx.recv() => break,
                }
            }
        });
    }

    async fn reap_stuck_once(&self, now: u64) {
        let threshold = self.config.stuck_threshold_secs;
        let stuck: Vec<OperationId> = {
            let inner = self.inner.lock().await;
            inner
                .active
                .iter()
                .filter(|(_, ctx)| now.saturating_sub(ctx.started_at_unix) > threshold)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stuck {
            let mut inner = self.inner.lock().await;
            if let Some(ctx) = inner.active.remove(&id) {
                ctx.cancel.cancel();
            }
            if let Some(job) = inner.operations.get_mut(&id) {
                warn!("operation {id} ({:?}) stuck past {threshold}s, marking FAILED", job.op.op_type);
                job.op.status = OperationStatus::Failed;
                if let Some(cb) = job.on_failed.clone() {
                    cb(id, job.op.op_type, job.op.mix_id);
                }
            }
        }
    }

    /// Memory-pressure sweep (§4.4): purges COMPLETED/FAILED older than 1h
    /// and truncates `ready_queue` if it has grown past capacity; never
    /// touches SCHEDULED or EXECUTING entries.
    pub async fn purge_under_memory_pressure(&self, now: u64) -> usize {
        const READY_QUEUE_CAPACITY: usize = 20_000;
        const TERMINAL_RETENTION_SECS: u64 = 3_600;
        let mut inner = self.inner.lock().await;
        let before = inner.operations.len();
        let active_ids: std::collections::HashSet<_> = inner.active.keys().copied().collect();
        inner.operations.retain(|id, job| {
            if !job.op.is_terminal() {
                return true;
            }
            if active_ids.contains(id) {
                return true;
            }
            now.saturating_sub(job.op.created_at_unix) < TERMINAL_RETENTION_SECS
        });
        let purged = before - inner.operations.len();

        if inner.ready_queue.len() > READY_QUEUE_CAPACITY {
            let mut kept = BinaryHeap::new();
            for _ in 0..READY_QUEUE_CAPACITY {
                if let Some(key) = inner.ready_queue.pop() {
                    kept.push(key);
                } else {
                    break;
                }
            }
            inner.ready_queue = kept;
        }
        purged
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tumbler_types::OperationPayload;

    struct AlwaysOk;
    #[async_trait::async_trait]
    impl OperationHandler for AlwaysOk {
        async fn execute(&self, _op: &ScheduledOperation, _cancel: CancelToken) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    struct AlwaysTemporary(Arc<AtomicU32>);
    #[async_trait::async_trait]
    impl OperationHandler for AlwaysTemporary {
        async fn execute(&self, _op: &ScheduledOperation, _cancel: CancelToken) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Temporary("rpc timeout".into()))
        }
    }

    fn base_op(op_type: OperationType, scheduled_at_unix: u64) -> ScheduledOperation {
        ScheduledOperation {
            id: OperationId::random(),
            op_type,
            priority: op_type.default_priority(),
            scheduled_at_unix,
            payload: OperationPayload(vec![]),
            mix_id: None,
            retry_count: 0,
            max_retries: 2,
            status: OperationStatus::Scheduled,
            created_at_unix: 0,
            ttl_secs: 3600,
        }
    }

    #[tokio::test]
    async fn scheduled_op_promotes_executes_and_completes() {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        scheduler.register_handler(OperationType::Cleanup, Arc::new(AlwaysOk)).await;

        let id = scheduler.schedule(base_op(OperationType::Cleanup, 0), None, None).await.unwrap();
        scheduler.promote_once(100).await;
        scheduler.dispatch_once().await;

        // give the spawned task a chance to run
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = scheduler.stats().await;
        assert!(stats.completed >= 1 || stats.active >= 1, "expected completion or in-flight: {stats:?}");
        let _ = id;
    }

    #[tokio::test]
    async fn temporary_failure_reschedules_with_backoff_then_fails() {
        let mut config = SchedulerConfig::default();
        config.base_backoff_secs = 1;
        let scheduler = Arc::new(Scheduler::new(config));
        let calls = Arc::new(AtomicU32::new(0));
        scheduler
            .register_handler(OperationType::Distribution, Arc::new(AlwaysTemporary(calls.clone())))
            .await;

        let mut op = base_op(OperationType::Distribution, 0);
        op.max_retries = 1;
        let id = scheduler.schedule(op, None, None).await.unwrap();

        scheduler.promote_once(0).await;
        scheduler.dispatch_once().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // after first temporary failure it should be rescheduled, not failed yet
        {
            let inner = scheduler.inner.lock().await;
            let job = inner.operations.get(&id).unwrap();
            assert_eq!(job.op.retry_count, 1);
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        let id = scheduler.schedule(base_op(OperationType::Cleanup, 1_000_000), None, None).await.unwrap();
        scheduler.cancel(id).await;
        scheduler.cancel(id).await;
        let stats = scheduler.stats().await;
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn at_capacity_check_reflects_near_full_table() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        assert!(!scheduler.is_near_capacity().await);
    }
}

//! Tumbler node binary: wires the engine crates to a sled `Store`, demo
//! `BlockchainClient`s, and a small admin HTTP surface. Mirrors the
//! teacher's `rusty-node` shape -- clap CLI, tracing subscriber, an axum
//! health route, graceful shutdown on Ctrl+C -- applied to this engine's
//! own startup sequence instead of the teacher's P2P/RPC bring-up.

mod demo_client;
mod store;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tumbler_config::TumblerConfig;
use tumbler_confirmation::ConfirmationMonitor;
use tumbler_coordinator::MixCoordinator;
use tumbler_keycustody::{KeyCustody, SoftwareKeystore};
use tumbler_pool::{HealthParams, Pool};
use tumbler_scheduler::Scheduler;
use tumbler_types::{Amount, Currency};

use demo_client::DemoBlockchainClient;
use store::SledStore;

/// Tumbler mixing engine node.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "tumbler.toml")]
    config: String,

    /// Directory the sled database is opened under.
    #[arg(long, default_value = "./tumbler-data")]
    data_dir: String,

    /// Bind address for the admin/health HTTP surface.
    #[arg(long, default_value = "127.0.0.1:8090")]
    bind: String,

    /// Logging verbosity, as an `EnvFilter` directive (e.g. "info", "debug").
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone)]
struct AppState {
    coordinator: Arc<MixCoordinator>,
    scheduler: Arc<Scheduler>,
    confirmation: Arc<ConfirmationMonitor>,
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = TumblerConfig::load(&args.config).context("loading tumbler config")?;
    info!("loaded config for {} currencies", config.currencies.len());

    std::fs::create_dir_all(&args.data_dir).context("creating data directory")?;
    let db = sled::open(&args.data_dir).context("opening sled database")?;
    let sled_store = Arc::new(SledStore::open(&db).context("opening sled store trees")?);
    let store: Arc<dyn tumbler_coordinator::Store> = sled_store.clone();

    let dek = load_data_encryption_key(&config.keystore.encryption_key_env);
    let keystore = Arc::new(SoftwareKeystore::new(dek, config.keystore.max_keys_in_memory));
    let key_custody = Arc::new(KeyCustody::software(keystore));

    let mut pools = HashMap::new();
    let mut clients: HashMap<Currency, Arc<dyn tumbler_confirmation::BlockchainClient>> = HashMap::new();
    let mut poll_intervals = HashMap::new();
    for currency in Currency::all() {
        let Some(currency_config) = config.currencies.get(&currency.to_string()) else {
            continue;
        };
        let target = Amount::from_decimal_string(*currency, &currency_config.target_pool_size)
            .map(|a| a.minor_units())
            .unwrap_or(0);
        let min = Amount::from_decimal_string(*currency, &currency_config.min_pool_size)
            .map(|a| a.minor_units())
            .unwrap_or(0);
        let max = Amount::from_decimal_string(*currency, &currency_config.max_pool_size)
            .map(|a| a.minor_units())
            .unwrap_or(u128::MAX);
        let health_params = HealthParams { min_pool_size: min, max_pool_size: max, max_pool_age_secs: 7 * 24 * 3600 };
        pools.insert(*currency, Arc::new(Pool::new(*currency, health_params, target, min)));
        clients.insert(*currency, Arc::new(DemoBlockchainClient::new(currency_config.required_confirmations)));
        poll_intervals.insert(*currency, Duration::from_millis(currency_config.poll_interval_ms));
    }

    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));

    let monitor_clients = clients.clone();
    let mut confirmation_slot: Option<Arc<ConfirmationMonitor>> = None;
    let coordinator = Arc::new_cyclic(|weak: &Weak<MixCoordinator>| {
        let monitor = Arc::new(ConfirmationMonitor::new(
            monitor_clients,
            poll_intervals,
            MixCoordinator::deposit_callback(weak.clone()),
            MixCoordinator::late_deposit_callback(weak.clone()),
        ));
        confirmation_slot = Some(monitor.clone());
        MixCoordinator::new(store, key_custody, monitor, pools, scheduler.clone(), clients, config.clone())
    });
    let confirmation = confirmation_slot.expect("ConfirmationMonitor is always built inside new_cyclic");

    coordinator.register_handlers().await;
    scheduler.spawn_all();
    confirmation.spawn_all();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_housekeeping_loop(coordinator.clone(), scheduler.clone(), confirmation.clone(), shutdown_tx.subscribe());

    let state = AppState { coordinator: coordinator.clone(), scheduler: scheduler.clone(), confirmation: confirmation.clone() };
    let app = Router::new().route("/health", get(health)).route("/status", get(status)).with_state(state);
    let listener = tokio::net::TcpListener::bind(&args.bind).await.context("binding admin HTTP listener")?;
    info!("admin HTTP surface listening on {}", args.bind);
    let mut http_shutdown = shutdown_tx.subscribe();
    let serve = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                http_shutdown.recv().await.ok();
            })
            .await
            .ok();
    });

    signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("shutdown signal received, stopping node");
    scheduler.shutdown();
    confirmation.shutdown();
    let _ = shutdown_tx.send(());
    tokio::time::sleep(Duration::from_secs(config.policy.shutdown_grace_secs.min(5))).await;
    let _ = serve.await;
    Ok(())
}

/// Housekeeping: expiry sweep, terminal-state pruning and rebalance checks,
/// on a coarse interval. Distinct from the Scheduler's own promotion loop --
/// this drives periodic coordinator/Pool actions that have no natural
/// trigger otherwise (§4.3 rebalancing, §4.5 expiry).
fn spawn_housekeeping_loop(
    coordinator: Arc<MixCoordinator>,
    scheduler: Arc<Scheduler>,
    confirmation: Arc<ConfirmationMonitor>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_unix();
                    if let Err(e) = run_housekeeping_pass(&coordinator, &scheduler, &confirmation, now).await {
                        warn!("housekeeping pass failed: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("housekeeping loop shutting down");
                    break;
                }
            }
        }
    });
}

async fn run_housekeeping_pass(
    coordinator: &Arc<MixCoordinator>,
    scheduler: &Arc<Scheduler>,
    confirmation: &Arc<ConfirmationMonitor>,
    now: u64,
) -> anyhow::Result<()> {
    for currency in Currency::all() {
        let _ = coordinator.schedule_cleanup(*currency).await;
        let _ = coordinator.schedule_rebalance_if_needed(*currency).await;
    }
    let purged_ops = scheduler.purge_under_memory_pressure(now).await;
    let swept = confirmation.sweep_terminal(now).await;
    if purged_ops > 0 || swept > 0 {
        info!("housekeeping: purged {purged_ops} terminal operations, swept {swept} tracked transactions");
    }
    Ok(())
}

fn load_data_encryption_key(env_var: &str) -> [u8; 32] {
    match std::env::var(env_var) {
        Ok(hex_key) => {
            let bytes = hex::decode(hex_key.trim()).expect("encryption key env var must be 64 hex chars");
            bytes.try_into().expect("encryption key must be exactly 32 bytes")
        }
        Err(_) => {
            error!("{env_var} not set; generating an ephemeral key (data will not survive a restart)");
            let mut key = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
            key
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let scheduler_stats = state.scheduler.stats().await;
    let monitor_stats = state.confirmation.stats().await;
    let _ = &state.coordinator;
    Json(serde_json::json!({
        "scheduler": {
            "scheduled": scheduler_stats.scheduled,
            "ready": scheduler_stats.ready,
            "active": scheduler_stats.active,
            "completed": scheduler_stats.completed,
            "failed": scheduler_stats.failed,
            "cancelled": scheduler_stats.cancelled,
        },
        "confirmation": {
            "watched_addresses": monitor_stats.watched_addresses,
            "tracked_transactions": monitor_stats.tracked_transactions,
            "pending_transactions": monitor_stats.pending_transactions,
        },
    }))
}

//! Structured configuration (§6 EXTERNAL INTERFACES). One typed struct per
//! group, `deny_unknown_fields` everywhere, loaded from a TOML file layered
//! with environment overrides the way `rusty-coin-node` layers `config`
//! over `toml` for its node config — except here unknown keys are a hard
//! load-time error rather than silently ignored (§9 redesign flag: "Dynamic
//! config bags / loose objects -> explicit typed configs").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tumbler_types::Currency;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),
    #[error("config validation failed: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressFormatRule {
    /// Accepted literal prefixes (e.g. "1", "3", "bc1" for BTC).
    pub prefixes: Vec<String>,
    pub min_len: usize,
    pub max_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurrencyConfig {
    pub min_amount: String,
    pub max_amount: String,
    pub required_confirmations: u32,
    pub min_pool_size: String,
    pub max_pool_size: String,
    pub target_pool_size: String,
    pub poll_interval_ms: u64,
    pub address_format_rules: Vec<AddressFormatRule>,
    #[serde(default)]
    pub underpayment_tolerance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnonymityTier {
    pub fee_multiplier: f64,
    pub delay_minutes: u32,
    pub min_participants: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnonymityConfig {
    pub low: AnonymityTier,
    pub medium: AnonymityTier,
    pub high: AnonymityTier,
}

impl Default for AnonymityConfig {
    fn default() -> Self {
        AnonymityConfig {
            low: AnonymityTier {
                fee_multiplier: 1.0,
                delay_minutes: 60,
                min_participants: 2,
            },
            medium: AnonymityTier {
                fee_multiplier: 1.2,
                delay_minutes: 180,
                min_participants: 3,
            },
            high: AnonymityTier {
                fee_multiplier: 1.5,
                delay_minutes: 720,
                min_participants: 5,
            },
        }
    }
}

impl AnonymityConfig {
    pub fn tier(&self, level: tumbler_types::AnonymityLevel) -> &AnonymityTier {
        match level {
            tumbler_types::AnonymityLevel::Low => &self.low,
            tumbler_types::AnonymityLevel::Medium => &self.medium,
            tumbler_types::AnonymityLevel::High => &self.high,
        }
    }

    /// Clamp `minutes` into `[min_delay, max_delay]` for the given level.
    /// The spec only defines a single default delay per tier; this
    /// expansion treats that default as the floor and 4x as the ceiling,
    /// which is what lets an operator-configured `delay_minutes` override
    /// stay inside a sane band instead of being unbounded.
    pub fn clamp_delay(&self, level: tumbler_types::AnonymityLevel, minutes: u32) -> u32 {
        let tier = self.tier(level);
        minutes.clamp(tier.delay_minutes, tier.delay_minutes.saturating_mul(4))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSubCaps {
    pub distribution: usize,
    pub consolidation: usize,
    pub coinjoin: usize,
    pub rebalance: usize,
    pub cleanup: usize,
}

impl Default for SchedulerSubCaps {
    fn default() -> Self {
        SchedulerSubCaps {
            distribution: 20,
            consolidation: 10,
            coinjoin: 15,
            rebalance: 5,
            cleanup: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub sub_caps: SchedulerSubCaps,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_operation_ttl_secs")]
    pub operation_ttl_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_schedule_check_interval_ms")]
    pub schedule_check_interval_ms: u64,
    #[serde(default = "default_execution_loop_ms")]
    pub execution_loop_ms: u64,
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
}

fn default_max_concurrent() -> usize {
    50
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_multiplier() -> u32 {
    2
}
fn default_base_backoff_secs() -> u64 {
    300
}
fn default_operation_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_batch_size() -> usize {
    10
}
fn default_schedule_check_interval_ms() -> u64 {
    30_000
}
fn default_execution_loop_ms() -> u64 {
    5_000
}
fn default_stuck_threshold_secs() -> u64 {
    30 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent: default_max_concurrent(),
            sub_caps: SchedulerSubCaps::default(),
            max_retries: default_max_retries(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            base_backoff_secs: default_base_backoff_secs(),
            operation_ttl_secs: default_operation_ttl_secs(),
            batch_size: default_batch_size(),
            schedule_check_interval_ms: default_schedule_check_interval_ms(),
            execution_loop_ms: default_execution_loop_ms(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeystoreConfig {
    #[serde(default = "default_max_keys_in_memory")]
    pub max_keys_in_memory: usize,
    #[serde(default = "default_key_rotation_interval_min")]
    pub key_rotation_interval_min: u64,
    /// Name of the environment variable holding the 32-byte hex-encoded
    /// data-encryption key. Never stored in the config file itself (§6
    /// persisted state layout: "the data-encryption key is held only in
    /// memory and provided at startup").
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,
}

fn default_max_keys_in_memory() -> usize {
    1000
}
fn default_key_rotation_interval_min() -> u64 {
    60
}
fn default_encryption_key_env() -> String {
    "TUMBLER_KEYSTORE_DEK".to_string()
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        KeystoreConfig {
            max_keys_in_memory: default_max_keys_in_memory(),
            key_rotation_interval_min: default_key_rotation_interval_min(),
            encryption_key_env: default_encryption_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HsmConfig {
    pub library_path: String,
    pub slot: u64,
    /// Name of the environment variable holding the HSM PIN.
    pub pin_env: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CoinJoinOutputRouting {
    /// Co-spend outputs pay directly to each participant's first output.
    Direct,
    /// Co-spend outputs pay into a holding address, then forward.
    HoldingAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// §9 open question: overpayment/underpayment policy is a deployment
    /// choice, not a core invariant. `credit_overpayment=true` is the spec
    /// default ("credit and mix").
    #[serde(default = "default_true")]
    pub credit_overpayment: bool,
    #[serde(default = "default_grace_period_secs")]
    pub underpayment_grace_period_secs: u64,
    /// §9 open question: CoinJoin output routing must be config-gated.
    #[serde(default = "default_coinjoin_routing")]
    pub coinjoin_output_routing: CoinJoinOutputRouting,
    #[serde(default = "default_max_queue_len")]
    pub max_coinjoin_queue_len: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_grace_period_secs() -> u64 {
    4 * 3600
}
fn default_coinjoin_routing() -> CoinJoinOutputRouting {
    CoinJoinOutputRouting::HoldingAddress
}
fn default_max_queue_len() -> usize {
    100
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            credit_overpayment: default_true(),
            underpayment_grace_period_secs: default_grace_period_secs(),
            coinjoin_output_routing: default_coinjoin_routing(),
            max_coinjoin_queue_len: default_max_queue_len(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TumblerConfig {
    pub currencies: HashMap<String, CurrencyConfig>,
    #[serde(default)]
    pub anonymity: AnonymityConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub keystore: KeystoreConfig,
    #[serde(default)]
    pub hsm: Option<HsmConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl TumblerConfig {
    /// Load from a TOML file, then apply `TUMBLER__*` environment overrides
    /// (double-underscore separated, matching the `config` crate's default
    /// `Environment::with_separator("__")` convention).
    pub fn load(path: impl AsRef<Path>) -> Result<TumblerConfig, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let settings = config::Config::builder()
            .add_source(config::File::from_str(&raw, config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("TUMBLER").separator("__"))
            .build()?;
        let cfg: TumblerConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for currency in Currency::all() {
            let key = currency.to_string();
            if !self.currencies.contains_key(&key) {
                return Err(ConfigError::Invalid(format!(
                    "missing currency config for {key}"
                )));
            }
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::Invalid("scheduler.max_concurrent must be > 0".into()));
        }
        let sub_total = self.scheduler.sub_caps.distribution
            + self.scheduler.sub_caps.consolidation
            + self.scheduler.sub_caps.coinjoin
            + self.scheduler.sub_caps.rebalance
            + self.scheduler.sub_caps.cleanup;
        if sub_total > self.scheduler.max_concurrent * 2 {
            return Err(ConfigError::Invalid(
                "scheduler sub-caps are wildly inconsistent with max_concurrent".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> String {
        let mut currencies = String::new();
        for c in Currency::all() {
            currencies.push_str(&format!(
                "[currencies.{c}]\nmin_amount = \"0.001\"\nmax_amount = \"10\"\nrequired_confirmations = 6\nmin_pool_size = \"1\"\nmax_pool_size = \"100\"\ntarget_pool_size = \"50\"\npoll_interval_ms = 15000\naddress_format_rules = []\n\n"
            ));
        }
        currencies
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let toml = minimal_toml();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        let cfg = TumblerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.scheduler.max_concurrent, 50);
        assert_eq!(cfg.anonymity.medium.delay_minutes, 180);
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let mut toml = minimal_toml();
        toml.push_str("not_a_real_field = true\n");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        assert!(TumblerConfig::load(file.path()).is_err());
    }

    #[test]
    fn rejects_missing_currency() {
        let toml = "[currencies.BTC]\nmin_amount = \"0.001\"\nmax_amount = \"10\"\nrequired_confirmations = 6\nmin_pool_size = \"1\"\nmax_pool_size = \"100\"\ntarget_pool_size = \"50\"\npoll_interval_ms = 15000\naddress_format_rules = []\n";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        assert!(TumblerConfig::load(file.path()).is_err());
    }
}

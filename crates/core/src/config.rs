//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::{ChainId, CoreError, CoreResult, FeedId, ShardKey};

pub use config::FileFormat;

/// Per-feed update thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: FeedId,
    pub alias: String,
    /// Push when the on-chain price is at least this old
    pub time_difference_threshold_secs: u64,
    /// Push when off-chain and on-chain prices differ by at least this much
    pub price_deviation_threshold_bps: u64,
    /// Never push an off-chain price whose confidence ratio exceeds this
    pub confidence_ratio_threshold_bps: u64,
    #[serde(default)]
    pub shard: u32,
}

/// Scheduler cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub pushing_frequency_secs: u64,
    pub polling_frequency_secs: u64,
    /// Minimum gap between two push attempts of the same feed; defaults to the polling frequency
    pub push_cooldown_secs: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pushing_frequency_secs: 10,
            polling_frequency_secs: 5,
            push_cooldown_secs: None,
        }
    }
}

impl ControllerConfig {
    pub fn pushing_frequency(&self) -> Duration {
        Duration::from_secs(self.pushing_frequency_secs)
    }

    pub fn polling_frequency(&self) -> Duration {
        Duration::from_secs(self.polling_frequency_secs)
    }

    pub fn push_cooldown_secs(&self) -> u64 {
        self.push_cooldown_secs.unwrap_or(self.polling_frequency_secs)
    }
}

/// Single-transaction pusher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardPusherConfig {
    /// Priority fee price (e.g. compute unit price in micro-lamports)
    pub fee_price: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Fee multiplier applied on every retry
    pub fee_escalation_multiplier: f64,
    /// Upper bound for the escalated fee, as a multiple of `fee_price`
    pub fee_escalation_cap: f64,
    /// Limit for a single build or submit call
    pub request_timeout_ms: u64,
}

impl Default for StandardPusherConfig {
    fn default() -> Self {
        Self {
            fee_price: 50_000,
            max_retries: 2,
            retry_base_delay_ms: 250,
            max_retry_delay_ms: 1_000,
            fee_escalation_multiplier: 1.25,
            fee_escalation_cap: 2.0,
            request_timeout_ms: 5_000,
        }
    }
}

impl StandardPusherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling and capped
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }

    /// Fee price to use on retry number `attempt` (0 = first submission)
    pub fn fee_for_attempt(&self, attempt: u32) -> u64 {
        let base = self.fee_price as f64;
        let escalated = base * self.fee_escalation_multiplier.powi(attempt as i32);
        escalated.min(base * self.fee_escalation_cap).round() as u64
    }
}

/// Bundle pusher settings. Its presence selects the bundled strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub default_tip_lamports: u64,
    pub dynamic_tips: bool,
    pub max_tip_lamports: u64,
    /// Max feeds per sub-bundle
    pub updates_per_bundle: usize,
    pub relay_endpoints: Vec<String>,
    /// Pause between two fan-out rounds of the same bundle
    pub retry_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub tip_floor_url: Option<String>,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            default_tip_lamports: 10_000,
            dynamic_tips: true,
            max_tip_lamports: 1_000_000,
            updates_per_bundle: 6,
            relay_endpoints: vec![],
            retry_interval_ms: 500,
            request_timeout_ms: 2_000,
            tip_floor_url: Some("https://bundles.jito.wtf/api/v1/bundles/tip_floor".to_string()),
        }
    }
}

/// Signer balance sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub low_balance_threshold: Option<u64>,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            low_balance_threshold: None,
        }
    }
}

/// Hermes streaming endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HermesConfig {
    pub ws_url: String,
    pub http_url: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnects: u32,
}

impl Default for HermesConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://hermes.pyth.network/ws".to_string(),
            http_url: "https://hermes.pyth.network".to_string(),
            reconnect_delay_ms: 5_000,
            max_reconnects: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub chain: ChainId,
    #[serde(default)]
    pub controller: ControllerConfig,
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub standard: StandardPusherConfig,
    #[serde(default)]
    pub bundle: Option<BundleConfig>,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub hermes: HermesConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AgentConfig {
    /// Load from a config file (format by extension), overlaid by `PUSHER__*` env vars
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("PUSHER").separator("__"))
            .build()?;

        Self::from_settings(settings)
    }

    /// Parse from an in-memory document
    pub fn from_document(contents: &str, format: FileFormat) -> CoreResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, format))
            .build()?;

        Self::from_settings(settings)
    }

    fn from_settings(settings: config::Config) -> CoreResult<Self> {
        let config: AgentConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |msg: String| Err(CoreError::InvalidConfig(msg));

        if self.controller.pushing_frequency_secs == 0 {
            return invalid("pushing_frequency_secs must be positive".into());
        }
        if self.controller.polling_frequency_secs == 0 {
            return invalid("polling_frequency_secs must be positive".into());
        }

        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if !seen.insert(feed.id) {
                return Err(CoreError::DuplicateFeed(feed.id));
            }
            if feed.price_deviation_threshold_bps == 0 || feed.confidence_ratio_threshold_bps == 0 {
                return invalid(format!("feed {}: thresholds must be positive", feed.alias));
            }
        }

        let standard = &self.standard;
        if standard.fee_escalation_multiplier < 1.0 || standard.fee_escalation_cap < 1.0 {
            return invalid("fee escalation multiplier and cap must be >= 1.0".into());
        }
        let worst_backoff = standard.max_retry_delay_ms.saturating_mul(standard.max_retries as u64);
        if worst_backoff >= self.controller.pushing_frequency_secs.saturating_mul(1_000) {
            return invalid(format!(
                "retry backoff of up to {worst_backoff}ms does not fit in the pushing frequency"
            ));
        }

        if let Some(bundle) = &self.bundle {
            if bundle.updates_per_bundle == 0 {
                return invalid("updates_per_bundle must be positive".into());
            }
            if bundle.max_tip_lamports < bundle.default_tip_lamports {
                return invalid("max_tip_lamports is below default_tip_lamports".into());
            }
            if bundle.relay_endpoints.is_empty() {
                return invalid("bundle pushing needs at least one relay endpoint".into());
            }
        }

        Ok(())
    }

    /// Feeds grouped by shard, each shard keyed by (chain, shard)
    pub fn shards(&self) -> BTreeMap<ShardKey, Vec<FeedConfig>> {
        let mut shards: BTreeMap<ShardKey, Vec<FeedConfig>> = BTreeMap::new();
        for feed in &self.feeds {
            shards
                .entry(ShardKey::new(self.chain.clone(), feed.shard))
                .or_default()
                .push(feed.clone());
        }
        shards
    }

    /// Time a push may take before it is abandoned: one pushing interval
    pub fn push_retry_budget(&self) -> Duration {
        self.controller.pushing_frequency()
    }
}

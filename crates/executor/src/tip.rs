//! Bundle tip sizing

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use pusher_core::{BundleConfig, SourceError, SourceResult};

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Source of recently observed landed tip levels
#[async_trait]
pub trait TipOracle: Send + Sync {
    async fn recent_tip(&self) -> SourceResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipPolicy {
    pub default_tip: u64,
    pub dynamic: bool,
    pub max_tip: u64,
}

impl TipPolicy {
    pub fn from_config(config: &BundleConfig) -> Self {
        Self {
            default_tip: config.default_tip_lamports,
            dynamic: config.dynamic_tips,
            max_tip: config.max_tip_lamports,
        }
    }

    /// Tip to attach: the default, raised to the recent level when dynamic, capped at max
    pub fn resolve(&self, recent: Option<u64>) -> u64 {
        let tip = match (self.dynamic, recent) {
            (true, Some(recent)) => self.default_tip.max(recent),
            _ => self.default_tip,
        };
        tip.min(self.max_tip)
    }
}

#[derive(Debug, Deserialize)]
struct TipFloorEntry {
    landed_tips_50th_percentile: f64,
}

/// Reads the median landed tip from a block-engine tip floor endpoint
pub struct HttpTipFloor {
    url: String,
    http: reqwest::Client,
}

impl HttpTipFloor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> SourceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl TipOracle for HttpTipFloor {
    async fn recent_tip(&self) -> SourceResult<u64> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    SourceError::Connection(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Tip floor request failed");
            return Err(SourceError::Rpc(format!("tip floor returned {}", response.status())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let tip = parse_tip_floor(&body)?;
        debug!(tip, "Fetched recent landed tip");
        Ok(tip)
    }
}

/// Median landed tip of the latest entry, converted from SOL to lamports
fn parse_tip_floor(body: &str) -> SourceResult<u64> {
    let entries: Vec<TipFloorEntry> =
        serde_json::from_str(body).map_err(|e| SourceError::Decode(e.to_string()))?;

    let entry = entries
        .first()
        .ok_or_else(|| SourceError::Decode("empty tip floor response".into()))?;

    Ok((entry.landed_tips_50th_percentile * LAMPORTS_PER_SOL).floor() as u64)
}

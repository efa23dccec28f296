//! Core type definitions

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::CoreError;

/// Unix timestamp in seconds
pub type UnixTimestamp = u64;

/// Binary update payload for a single feed, as delivered by the off-chain source
pub type UpdateData = Arc<[u8]>;

/// Current wall-clock time in unix seconds
pub fn now_unix() -> UnixTimestamp {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// 32-byte price feed identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId([u8; 32]);

impl FeedId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for FeedId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(trimmed)
            .map_err(|e| CoreError::InvalidFeedId(format!("{s}: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| CoreError::InvalidFeedId(format!("{s}: expected 32 bytes")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedId({})", self.to_hex())
    }
}

impl Serialize for FeedId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FeedId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Target chain identifier (e.g. "solana", "fogo")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shard identity: one signer and one scheduler per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub chain: ChainId,
    pub shard: u32,
}

impl ShardKey {
    pub fn new(chain: ChainId, shard: u32) -> Self {
        Self { chain, shard }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.chain, self.shard)
    }
}

/// A price observation. Human value = `price * 10^exponent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: i64,
    pub confidence: u64,
    pub exponent: i32,
    pub publish_time: UnixTimestamp,
}

impl PricePoint {
    pub fn new(price: i64, confidence: u64, exponent: i32, publish_time: UnixTimestamp) -> Self {
        Self {
            price,
            confidence,
            exponent,
            publish_time,
        }
    }

    pub fn age_secs(&self, now: UnixTimestamp) -> u64 {
        now.saturating_sub(self.publish_time)
    }

    /// Confidence interval relative to the price, in basis points.
    ///
    /// Returns `None` when the price is zero, i.e. the ratio is unbounded.
    pub fn confidence_ratio_bps(&self) -> Option<u128> {
        let magnitude = self.price.unsigned_abs() as u128;
        if magnitude == 0 {
            return None;
        }
        Some(self.confidence as u128 * 10_000 / magnitude)
    }

    /// Mantissa rescaled to a smaller (more precise) exponent.
    ///
    /// `None` if `exponent` is larger than ours or the result overflows.
    pub fn mantissa_at(&self, exponent: i32) -> Option<i128> {
        let shift = self.exponent.checked_sub(exponent)?;
        if shift < 0 {
            return None;
        }
        let factor = 10i128.checked_pow(u32::try_from(shift).ok()?)?;
        (self.price as i128).checked_mul(factor)
    }
}

/// A price read back from the target chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainPricePoint {
    pub point: PricePoint,
    /// Chain-specific recency marker (slot or block height)
    pub slot: u64,
}

impl OnChainPricePoint {
    pub fn new(point: PricePoint, slot: u64) -> Self {
        Self { point, slot }
    }
}

/// Transaction or bundle identifier returned by the chain or a relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feeds selected in one tick together with their update payloads.
///
/// `feed_ids[i]` is always paired with `update_data[i]`.
#[derive(Debug, Clone, Default)]
pub struct PushBatch {
    feed_ids: Vec<FeedId>,
    update_data: Vec<UpdateData>,
}

impl PushBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, feed_id: FeedId, data: UpdateData) {
        self.feed_ids.push(feed_id);
        self.update_data.push(data);
    }

    pub fn feed_ids(&self) -> &[FeedId] {
        &self.feed_ids
    }

    pub fn update_data(&self) -> &[UpdateData] {
        &self.update_data
    }

    pub fn len(&self) -> usize {
        self.feed_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feed_ids.is_empty()
    }

    /// Split into sub-batches of at most `size` feeds, preserving order
    pub fn chunks(&self, size: usize) -> Vec<PushBatch> {
        let size = size.max(1);
        self.feed_ids
            .chunks(size)
            .zip(self.update_data.chunks(size))
            .map(|(ids, data)| PushBatch {
                feed_ids: ids.to_vec(),
                update_data: data.to_vec(),
            })
            .collect()
    }
}

impl FromIterator<(FeedId, UpdateData)> for PushBatch {
    fn from_iter<I: IntoIterator<Item = (FeedId, UpdateData)>>(iter: I) -> Self {
        let mut batch = PushBatch::new();
        for (id, data) in iter {
            batch.push(id, data);
        }
        batch
    }
}

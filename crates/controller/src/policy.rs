//! Update policy: decides whether a feed needs a fresh on-chain price

use std::fmt;

use pusher_core::{FeedConfig, OnChainPricePoint, PricePoint, UnixTimestamp};

const BPS: u128 = 10_000;

/// Why a feed is pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing has been published on chain yet
    NoOnChainPrice,
    Stale { age_secs: u64 },
    Deviation { bps: u128 },
}

/// Why a feed is left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Confidence interval too wide relative to the price; `None` for a zero price
    ConfidenceTooWide { ratio_bps: Option<u128> },
    /// The on-chain price is newer than the off-chain one
    OffChainOlder,
    WithinThresholds { age_secs: u64, deviation_bps: u128 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Push(Trigger),
    Skip(SkipReason),
}

impl Decision {
    pub fn is_push(&self) -> bool {
        matches!(self, Decision::Push(_))
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::NoOnChainPrice => write!(f, "no on-chain price"),
            Trigger::Stale { age_secs } => write!(f, "on-chain price is {age_secs}s old"),
            Trigger::Deviation { bps } => write!(f, "price deviates by {bps}bps"),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ConfidenceTooWide { ratio_bps: Some(r) } => {
                write!(f, "confidence ratio {r}bps above threshold")
            }
            SkipReason::ConfidenceTooWide { ratio_bps: None } => write!(f, "zero off-chain price"),
            SkipReason::OffChainOlder => write!(f, "off-chain price older than on-chain"),
            SkipReason::WithinThresholds { age_secs, deviation_bps } => {
                write!(f, "age {age_secs}s, deviation {deviation_bps}bps within thresholds")
            }
        }
    }
}

/// Relative difference of `off` to `on` in basis points, after rescaling both to the
/// smaller exponent.
///
/// Saturates to `u128::MAX` when the on-chain price is zero (and the off-chain one is not)
/// or the rescaled values overflow.
pub fn deviation_bps(off: &PricePoint, on: &PricePoint) -> u128 {
    let exponent = off.exponent.min(on.exponent);
    let (Some(off_m), Some(on_m)) = (off.mantissa_at(exponent), on.mantissa_at(exponent)) else {
        return u128::MAX;
    };

    if on_m == 0 {
        return if off_m == 0 { 0 } else { u128::MAX };
    }

    off_m
        .checked_sub(on_m)
        .and_then(|diff| diff.unsigned_abs().checked_mul(BPS))
        .map(|scaled| scaled / on_m.unsigned_abs())
        .unwrap_or(u128::MAX)
}

/// Evaluate the policy for one feed.
///
/// The confidence gate runs first: a price with a wide confidence interval is never
/// published, not even to fill an empty or stale on-chain account.
pub fn evaluate(
    config: &FeedConfig,
    off: &PricePoint,
    on: Option<&OnChainPricePoint>,
    now: UnixTimestamp,
) -> Decision {
    let ratio_bps = off.confidence_ratio_bps();
    match ratio_bps {
        Some(r) if r <= config.confidence_ratio_threshold_bps as u128 => {}
        _ => return Decision::Skip(SkipReason::ConfidenceTooWide { ratio_bps }),
    }

    let Some(on) = on else {
        return Decision::Push(Trigger::NoOnChainPrice);
    };

    if off.publish_time < on.point.publish_time {
        return Decision::Skip(SkipReason::OffChainOlder);
    }

    let age_secs = on.point.age_secs(now);
    if age_secs >= config.time_difference_threshold_secs {
        return Decision::Push(Trigger::Stale { age_secs });
    }

    let bps = deviation_bps(off, &on.point);
    if bps >= config.price_deviation_threshold_bps as u128 {
        return Decision::Push(Trigger::Deviation { bps });
    }

    Decision::Skip(SkipReason::WithinThresholds {
        age_secs,
        deviation_bps: bps,
    })
}

pub fn should_update(
    config: &FeedConfig,
    off: &PricePoint,
    on: Option<&OnChainPricePoint>,
    now: UnixTimestamp,
) -> bool {
    evaluate(config, off, on, now).is_push()
}

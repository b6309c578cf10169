//! Deterministic synthetic price series
//!
//! Used when the live source has nothing for a symbol, and by tests that need
//! a realistic-looking random walk. The same seed always yields the same bars.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::market_data::{BarSource, DataError};
use crate::types::Bar;

/// Five-minute spacing, in milliseconds
pub const BAR_SPACING_MS: i64 = 5 * 60 * 1000;

/// Random walk of `count` bars starting near `start_price`.
///
/// Each close moves at most ±0.2% from the previous one; highs and lows sit
/// within 0.1% outside the open/close range. The last bar ends at `end_time`.
pub fn generate(start_price: f64, count: usize, end_time: i64, seed: u64) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = start_price.max(0.01);
    let first_time = end_time - BAR_SPACING_MS * count.saturating_sub(1) as i64;

    let mut bars = Vec::with_capacity(count);
    for i in 0..count {
        let change: f64 = (rng.gen::<f64>() - 0.5) * 0.004;
        let open = price;
        let close = price * (1.0 + change);
        let high = open.max(close) * (1.0 + rng.gen::<f64>() * 0.001);
        let low = open.min(close) * (1.0 - rng.gen::<f64>() * 0.001);
        let volume = (rng.gen::<f64>() * 10_000.0).floor();

        bars.push(Bar {
            time: first_time + BAR_SPACING_MS * i as i64,
            open: to_price(open),
            high: to_price(high),
            low: to_price(low),
            close: to_price(close),
            volume: Decimal::from_f64(volume).unwrap_or_default(),
        });
        price = close;
    }
    bars
}

fn to_price(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(4)
}

/// Stable per-symbol seed so every run sees the same fallback series
pub fn seed_for(symbol: &str, base: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(base.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// `BarSource` that never fails
#[derive(Debug, Clone)]
pub struct SyntheticBarSource {
    pub start_price: f64,
    pub count: usize,
    pub end_time: i64,
    pub seed: u64,
}

impl Default for SyntheticBarSource {
    fn default() -> Self {
        Self {
            start_price: 1_000.0,
            count: 100,
            end_time: 0,
            seed: 42,
        }
    }
}

impl SyntheticBarSource {
    pub fn new(start_price: f64, count: usize, end_time: i64, seed: u64) -> Self {
        Self {
            start_price,
            count,
            end_time,
            seed,
        }
    }
}

#[async_trait]
impl BarSource for SyntheticBarSource {
    async fn fetch_bars(&self, symbol: &str, _: &str, _: &str) -> Result<Vec<Bar>, DataError> {
        Ok(generate(
            self.start_price,
            self.count,
            self.end_time,
            seed_for(symbol, self.seed),
        ))
    }
}

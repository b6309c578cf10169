//! Technical indicator math
//!
//! Pure functions over an ordered bar window. Every function tolerates short
//! input and returns a neutral value instead of failing; the scoring layer in
//! `signals` decides when a window is long enough to be meaningful.
//!
//! Moving averages, MACD and Bollinger Bands come from the `ta` crate. Wilder
//! smoothed indicators (RSI, ATR, ADX) and the range/volume indicators are
//! computed here because they need high/low/volume or Wilder seeding.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence,
    SimpleMovingAverage,
};
use ta::Next;

use crate::types::Bar;

// ============================================================================
// Output types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MacdValues {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StochasticValues {
    pub k: f64,
    pub d: f64,
}

impl Default for StochasticValues {
    fn default() -> Self {
        Self { k: 50.0, d: 50.0 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BollingerValues {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub percent_b: f64,
    pub bandwidth: f64,
    /// Current bandwidth above the mean of the trailing bandwidths
    pub expanding: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EmaValues {
    pub fast: f64,
    pub slow: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendDirection {
    #[default]
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SupertrendValues {
    pub value: f64,
    pub trend: TrendDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeBias {
    Accumulation,
    Distribution,
    #[default]
    Neutral,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdxValues {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObvValues {
    pub obv: f64,
    pub bias: VolumeBias,
}

// ============================================================================
// Bar window as f64 columns
// ============================================================================

pub(crate) fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Column view of a bar window, converted once for all indicators
pub struct PriceSeries {
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl PriceSeries {
    pub fn from_bars(bars: &[Bar]) -> Self {
        let mut series = Self {
            open: Vec::with_capacity(bars.len()),
            high: Vec::with_capacity(bars.len()),
            low: Vec::with_capacity(bars.len()),
            close: Vec::with_capacity(bars.len()),
            volume: Vec::with_capacity(bars.len()),
        };
        for bar in bars {
            series.open.push(to_f64(bar.open));
            series.high.push(to_f64(bar.high));
            series.low.push(to_f64(bar.low));
            series.close.push(to_f64(bar.close));
            series.volume.push(to_f64(bar.volume));
        }
        series
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    pub fn last_close(&self) -> f64 {
        self.close.last().copied().unwrap_or(0.0)
    }

    /// True range for bar `i` (requires `i >= 1`)
    fn true_range(&self, i: usize) -> f64 {
        let prev_close = self.close[i - 1];
        (self.high[i] - self.low[i])
            .max((self.high[i] - prev_close).abs())
            .max((self.low[i] - prev_close).abs())
    }

    fn true_ranges(&self) -> Vec<f64> {
        (1..self.len()).map(|i| self.true_range(i)).collect()
    }
}

// ============================================================================
// Moving averages
// ============================================================================

/// Mean of the trailing `period` values; shorter input averages what it has.
pub fn sma(values: &[f64], period: usize) -> f64 {
    let Ok(mut sma) = SimpleMovingAverage::new(period) else {
        return values.last().copied().unwrap_or(0.0);
    };
    let start = values.len().saturating_sub(period);
    let mut last = 0.0;
    for v in &values[start..] {
        last = sma.next(*v);
    }
    last
}

/// Recursive EMA seeded with the first value
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    match ExponentialMovingAverage::new(period) {
        Ok(mut ema) => values.iter().map(|v| ema.next(*v)).collect(),
        Err(_) => Vec::new(),
    }
}

pub fn ema_pair(closes: &[f64], fast: usize, slow: usize) -> EmaValues {
    EmaValues {
        fast: ema_series(closes, fast).last().copied().unwrap_or(0.0),
        slow: ema_series(closes, slow).last().copied().unwrap_or(0.0),
    }
}

// ============================================================================
// Momentum
// ============================================================================

/// Wilder RSI. Fewer than `period + 1` closes → 50; no losses → 100.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let diff = closes[i] - closes[i - 1];
        if diff > 0.0 {
            gains += diff;
        } else {
            losses -= diff;
        }
    }

    let p = period as f64;
    let mut avg_gain = gains / p;
    let mut avg_loss = losses / p;
    for i in (period + 1)..closes.len() {
        let diff = closes[i] - closes[i - 1];
        avg_gain = (avg_gain * (p - 1.0) + diff.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-diff).max(0.0)) / p;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdValues {
    let Ok(mut macd) = MovingAverageConvergenceDivergence::new(fast, slow, signal) else {
        return MacdValues::default();
    };
    let mut out = MacdValues::default();
    for close in closes {
        let o = macd.next(*close);
        out = MacdValues {
            line: o.macd,
            signal: o.signal,
            histogram: o.histogram,
        };
    }
    out
}

/// %K over the `period` high/low range, %D as SMA of the last `smooth` %K values
pub fn stochastic(series: &PriceSeries, period: usize, smooth: usize) -> StochasticValues {
    let n = series.len();
    if period == 0 || smooth == 0 || n < period + smooth - 1 {
        return StochasticValues::default();
    }

    let k_at = |end: usize| -> f64 {
        let start = end + 1 - period;
        let highest = series.high[start..=end]
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let lowest = series.low[start..=end]
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        let range = highest - lowest;
        if range.abs() < 1e-12 {
            50.0
        } else {
            ((series.close[end] - lowest) / range * 100.0).clamp(0.0, 100.0)
        }
    };

    let ks: Vec<f64> = ((n - smooth)..n).map(k_at).collect();
    let k = ks.last().copied().unwrap_or(50.0);
    let d = ks.iter().sum::<f64>() / ks.len() as f64;
    StochasticValues { k, d }
}

// ============================================================================
// Volatility
// ============================================================================

/// Wilder ATR series aligned to bar indices (`None` until enough bars)
pub fn atr_series(series: &PriceSeries, period: usize) -> Vec<Option<f64>> {
    let n = series.len();
    let mut out = vec![None; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let trs = series.true_ranges();
    let p = period as f64;
    let mut atr = trs[..period].iter().sum::<f64>() / p;
    // trs[j] belongs to bar j + 1
    out[period] = Some(atr);
    for j in period..trs.len() {
        atr = (atr * (p - 1.0) + trs[j]) / p;
        out[j + 1] = Some(atr);
    }
    out
}

pub fn atr(series: &PriceSeries, period: usize) -> f64 {
    atr_series(series, period)
        .last()
        .copied()
        .flatten()
        .unwrap_or(0.0)
}

pub fn bollinger(closes: &[f64], period: usize, multiplier: f64) -> BollingerValues {
    let Ok(mut bb) = BollingerBands::new(period, multiplier) else {
        return BollingerValues::default();
    };
    if closes.len() < period {
        return BollingerValues::default();
    }

    let mut bandwidths = Vec::with_capacity(closes.len());
    let mut last = BollingerValues::default();
    for (i, close) in closes.iter().enumerate() {
        let out = bb.next(*close);
        if i + 1 < period {
            continue;
        }
        let bandwidth = if out.average.abs() > 1e-12 {
            (out.upper - out.lower) / out.average
        } else {
            0.0
        };
        let width = out.upper - out.lower;
        last = BollingerValues {
            upper: out.upper,
            middle: out.average,
            lower: out.lower,
            percent_b: if width.abs() > 1e-12 {
                (close - out.lower) / width
            } else {
                0.5
            },
            bandwidth,
            expanding: false,
        };
        bandwidths.push(bandwidth);
    }

    if let Some((current, history)) = bandwidths.split_last() {
        let trailing = &history[history.len().saturating_sub(period)..];
        if !trailing.is_empty() {
            let mean = trailing.iter().sum::<f64>() / trailing.len() as f64;
            last.expanding = *current > mean;
        }
    }
    last
}

/// ATR-banded trailing trend line, recomputed from the start of the window
pub fn supertrend(series: &PriceSeries, period: usize, multiplier: f64) -> SupertrendValues {
    let atrs = atr_series(series, period);
    let Some(start) = atrs.iter().position(Option::is_some) else {
        return SupertrendValues::default();
    };

    let band = |i: usize, atr: f64| {
        let hl2 = (series.high[i] + series.low[i]) / 2.0;
        (hl2 + multiplier * atr, hl2 - multiplier * atr)
    };

    let (mut upper, mut lower) = band(start, atrs[start].unwrap_or(0.0));
    let mut trend = TrendDirection::Buy;

    for i in (start + 1)..series.len() {
        let Some(atr) = atrs[i] else { continue };
        let (basic_upper, basic_lower) = band(i, atr);
        let prev_close = series.close[i - 1];

        upper = if prev_close <= upper {
            basic_upper.min(upper)
        } else {
            basic_upper
        };
        lower = if prev_close >= lower {
            basic_lower.max(lower)
        } else {
            basic_lower
        };

        let close = series.close[i];
        trend = match trend {
            TrendDirection::Buy if close < lower => TrendDirection::Sell,
            TrendDirection::Sell if close > upper => TrendDirection::Buy,
            t => t,
        };
    }

    SupertrendValues {
        value: match trend {
            TrendDirection::Buy => lower,
            TrendDirection::Sell => upper,
        },
        trend,
    }
}

// ============================================================================
// Trend strength
// ============================================================================

/// Wilder ADX with directional indicators. Needs `2 * period + 1` bars.
pub fn adx(series: &PriceSeries, period: usize) -> AdxValues {
    let n = series.len();
    if period == 0 || n < 2 * period + 1 {
        return AdxValues::default();
    }

    let mut trs = Vec::with_capacity(n - 1);
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for i in 1..n {
        let up_move = series.high[i] - series.high[i - 1];
        let down_move = series.low[i - 1] - series.low[i];
        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        trs.push(series.true_range(i));
    }

    let p = period as f64;
    let mut s_tr: f64 = trs[..period].iter().sum();
    let mut s_plus: f64 = plus_dm[..period].iter().sum();
    let mut s_minus: f64 = minus_dm[..period].iter().sum();

    let directional = |s_tr: f64, s_plus: f64, s_minus: f64| -> (f64, f64, f64) {
        if s_tr <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let pdi = s_plus / s_tr * 100.0;
        let mdi = s_minus / s_tr * 100.0;
        let sum = pdi + mdi;
        let dx = if sum > 0.0 {
            (pdi - mdi).abs() / sum * 100.0
        } else {
            0.0
        };
        (pdi, mdi, dx)
    };

    let (mut pdi, mut mdi, first_dx) = directional(s_tr, s_plus, s_minus);
    let mut dxs = vec![first_dx];
    let mut adx = 0.0;
    let mut seeded = false;

    for j in period..trs.len() {
        s_tr = s_tr - s_tr / p + trs[j];
        s_plus = s_plus - s_plus / p + plus_dm[j];
        s_minus = s_minus - s_minus / p + minus_dm[j];
        let (next_pdi, next_mdi, dx) = directional(s_tr, s_plus, s_minus);
        pdi = next_pdi;
        mdi = next_mdi;

        if seeded {
            adx = (adx * (p - 1.0) + dx) / p;
        } else {
            dxs.push(dx);
            if dxs.len() == period {
                adx = dxs.iter().sum::<f64>() / p;
                seeded = true;
            }
        }
    }

    if !seeded {
        return AdxValues::default();
    }

    AdxValues {
        adx: adx.clamp(0.0, 100.0),
        plus_di: pdi,
        minus_di: mdi,
    }
}

// ============================================================================
// Volume
// ============================================================================

/// On-balance volume and its bias against its own `sma_period` average
pub fn obv(series: &PriceSeries, sma_period: usize) -> ObvValues {
    if series.is_empty() {
        return ObvValues::default();
    }

    let mut running = 0.0;
    let mut history = Vec::with_capacity(series.len());
    history.push(running);
    for i in 1..series.len() {
        if series.close[i] > series.close[i - 1] {
            running += series.volume[i];
        } else if series.close[i] < series.close[i - 1] {
            running -= series.volume[i];
        }
        history.push(running);
    }

    let bias = if history.len() < sma_period || sma_period == 0 {
        VolumeBias::Neutral
    } else {
        let average = sma(&history, sma_period);
        if running > average {
            VolumeBias::Accumulation
        } else if running < average {
            VolumeBias::Distribution
        } else {
            VolumeBias::Neutral
        }
    };

    ObvValues { obv: running, bias }
}

/// Last volume relative to its trailing average (an average of 0 counts as 1)
pub fn relative_volume(volumes: &[f64], period: usize) -> f64 {
    let Some(last) = volumes.last() else {
        return 0.0;
    };
    let average = sma(volumes, period);
    let denominator = if average > 0.0 { average } else { 1.0 };
    last / denominator
}

/// Volume-weighted typical price over the trailing `period` bars
pub fn vwap(series: &PriceSeries, period: usize) -> f64 {
    let start = series.len().saturating_sub(period);
    let mut pv = 0.0;
    let mut v = 0.0;
    for i in start..series.len() {
        let typical = (series.high[i] + series.low[i] + series.close[i]) / 3.0;
        pv += typical * series.volume[i];
        v += series.volume[i];
    }
    if v > 0.0 {
        pv / v
    } else {
        series.last_close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_series(closes: &[f64]) -> PriceSeries {
        PriceSeries {
            open: closes.to_vec(),
            high: closes.iter().map(|c| c + 1.0).collect(),
            low: closes.iter().map(|c| c - 1.0).collect(),
            close: closes.to_vec(),
            volume: vec![100.0; closes.len()],
        }
    }

    #[test]
    fn test_rsi_short_input_is_neutral() {
        assert_eq!(rsi(&[100.0; 10], 14), 50.0);
    }

    #[test]
    fn test_rsi_no_losses_is_100() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&closes, 14), 100.0);
    }

    #[test]
    fn test_rsi_falling_is_low() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let value = rsi(&closes, 14);
        assert!(value < 1.0, "rsi was {value}");
    }

    #[test]
    fn test_ema_seeded_with_first_value() {
        let series = ema_series(&[10.0, 20.0], 9);
        assert_eq!(series[0], 10.0);
        assert!((series[1] - (20.0 * 0.2 + 10.0 * 0.8)).abs() < 1e-9);
    }

    #[test]
    fn test_atr_constant_range() {
        // Flat closes with +/-1 highs and lows: every true range is 2
        let series = make_series(&[100.0; 40]);
        assert!((atr(&series, 14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_adx_bounded_and_strong_in_trend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + 2.0 * i as f64).collect();
        let values = adx(&make_series(&closes), 14);
        assert!(values.adx > 25.0 && values.adx <= 100.0);
        assert!(values.plus_di > values.minus_di);
    }

    #[test]
    fn test_adx_needs_two_periods() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(adx(&make_series(&closes), 14), AdxValues::default());
    }

    #[test]
    fn test_stochastic_at_top_of_range() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let mut series = make_series(&closes);
        // Close at the high of every bar
        series.high = series.close.clone();
        let values = stochastic(&series, 14, 3);
        assert!((values.k - 100.0).abs() < 1e-9);
        assert!(values.d > 90.0);
    }

    #[test]
    fn test_supertrend_flips_on_collapse() {
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        closes.extend((0..10).map(|i| 120.0 - 8.0 * i as f64));
        let values = supertrend(&make_series(&closes), 10, 3.0);
        assert_eq!(values.trend, TrendDirection::Sell);

        let rising: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let values = supertrend(&make_series(&rising), 10, 3.0);
        assert_eq!(values.trend, TrendDirection::Buy);
        assert!(values.value < 139.0);
    }

    #[test]
    fn test_obv_accumulates_on_up_closes() {
        let closes: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        let values = obv(&make_series(&closes), 10);
        assert_eq!(values.obv, 1400.0);
        assert_eq!(values.bias, VolumeBias::Accumulation);
    }

    #[test]
    fn test_relative_volume_spike() {
        let mut volumes = vec![1000.0; 19];
        volumes.push(5000.0);
        let rvol = relative_volume(&volumes, 20);
        assert!((rvol - 5000.0 / 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_bollinger_flat_has_zero_width() {
        let values = bollinger(&[100.0; 30], 20, 2.0);
        assert_eq!(values.bandwidth, 0.0);
        assert!(!values.expanding);
        assert_eq!(values.percent_b, 0.5);
    }

    #[test]
    fn test_price_series_from_bars() {
        let bar = Bar {
            time: 0,
            open: dec!(1.5),
            high: dec!(2),
            low: dec!(1),
            close: dec!(1.75),
            volume: dec!(10),
        };
        let series = PriceSeries::from_bars(&[bar]);
        assert_eq!(series.close, vec![1.75]);
        assert_eq!(series.volume, vec![10.0]);
    }
}

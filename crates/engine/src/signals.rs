//! Composite opportunity score and signal classification
//!
//! `compute` turns an ordered bar window into a `SignalSnapshot`: every
//! indicator value, the additive composite score, the tags of the rules that
//! fired and the classified strength. It is a pure function: no state, no I/O,
//! safe to call concurrently for many symbols.

use serde::{Deserialize, Serialize};

use crate::indicators::{
    self, AdxValues, BollingerValues, EmaValues, MacdValues, PriceSeries, StochasticValues,
    SupertrendValues, TrendDirection, VolumeBias,
};
use crate::rules::{tags, ClassificationThresholds, RuleSet, StrategyVersion};
use crate::types::Bar;

/// Classified strength of a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStrength {
    StrongBuy,
    Buy,
    #[default]
    Hold,
    Sell,
}

impl SignalStrength {
    pub fn label(&self) -> &'static str {
        match self {
            SignalStrength::StrongBuy => "STRONG BUY",
            SignalStrength::Buy => "BUY",
            SignalStrength::Hold => "HOLD",
            SignalStrength::Sell => "SELL",
        }
    }
}

/// All indicator outputs for one bar window, plus the composite score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub rsi: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub atr: f64,
    pub macd: MacdValues,
    pub stochastic: StochasticValues,
    pub bollinger: BollingerValues,
    pub ema: EmaValues,
    pub supertrend: SupertrendValues,
    pub obv: f64,
    pub obv_bias: VolumeBias,
    pub rvol: f64,
    pub vwap: f64,
    /// Composite score in [0, 100]
    pub score: f64,
    /// Tags of the scoring rules that fired, in rule order
    pub active_signals: Vec<String>,
    pub strength: SignalStrength,
}

impl Default for SignalSnapshot {
    /// Neutral output for windows too short to score
    fn default() -> Self {
        Self {
            rsi: 50.0,
            adx: 0.0,
            plus_di: 0.0,
            minus_di: 0.0,
            atr: 0.0,
            macd: MacdValues::default(),
            stochastic: StochasticValues::default(),
            bollinger: BollingerValues::default(),
            ema: EmaValues::default(),
            supertrend: SupertrendValues::default(),
            obv: 0.0,
            obv_bias: VolumeBias::Neutral,
            rvol: 0.0,
            vwap: 0.0,
            score: 0.0,
            active_signals: Vec::new(),
            strength: SignalStrength::Hold,
        }
    }
}

impl SignalSnapshot {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.active_signals.iter().any(|s| s == tag)
    }
}

/// Score a bar window with the canonical rule set
pub fn compute(bars: &[Bar]) -> SignalSnapshot {
    compute_with(bars, &RuleSet::default())
}

/// Score a bar window with an explicit rule set
pub fn compute_with(bars: &[Bar], rules: &RuleSet) -> SignalSnapshot {
    let p = &rules.periods;
    if bars.len() < p.minimum_window {
        return SignalSnapshot::default();
    }

    let series = PriceSeries::from_bars(bars);
    let AdxValues {
        adx,
        plus_di,
        minus_di,
    } = indicators::adx(&series, p.adx);
    let obv = indicators::obv(&series, p.obv_sma);

    let mut snapshot = SignalSnapshot {
        rsi: indicators::rsi(&series.close, p.rsi),
        adx,
        plus_di,
        minus_di,
        atr: indicators::atr(&series, p.atr),
        macd: indicators::macd(&series.close, p.macd_fast, p.macd_slow, p.macd_signal),
        stochastic: indicators::stochastic(&series, p.stochastic, p.stochastic_smooth),
        bollinger: indicators::bollinger(&series.close, p.bollinger, p.bollinger_multiplier),
        ema: indicators::ema_pair(&series.close, p.ema_fast, p.ema_slow),
        supertrend: indicators::supertrend(&series, p.supertrend, p.supertrend_multiplier),
        obv: obv.obv,
        obv_bias: obv.bias,
        rvol: indicators::relative_volume(&series.volume, p.volume_average),
        vwap: indicators::vwap(&series, p.vwap),
        ..SignalSnapshot::default()
    };

    let close = series.last_close();
    let (score, active) = match rules.version {
        StrategyVersion::Canonical => score_canonical(&snapshot, close, rules),
        StrategyVersion::VwapAnchor => score_vwap_anchor(&snapshot, close, rules),
    };

    snapshot.score = score.clamp(0.0, 100.0);
    snapshot.active_signals = active;
    snapshot.strength = classify(snapshot.score, &rules.thresholds());
    snapshot
}

/// Map a score to a strength using the given cut-offs
pub fn classify(score: f64, thresholds: &ClassificationThresholds) -> SignalStrength {
    if score >= thresholds.strong_buy {
        SignalStrength::StrongBuy
    } else if score >= thresholds.buy {
        SignalStrength::Buy
    } else if score <= thresholds.sell {
        SignalStrength::Sell
    } else {
        SignalStrength::Hold
    }
}

fn score_canonical(s: &SignalSnapshot, close: f64, rules: &RuleSet) -> (f64, Vec<String>) {
    let w = &rules.canonical;
    let mut score = 0.0;
    let mut active = Vec::new();
    let mut fire = |points: f64, tag: &str| {
        score += points;
        active.push(tag.to_string());
    };

    if close > s.ema.fast && s.ema.fast > s.ema.slow {
        fire(w.trend_stack, tags::TREND_STACK);
    }
    if close > s.bollinger.upper && s.bollinger.expanding {
        fire(w.volatility_breakout, tags::VOLATILITY_BREAKOUT);
    }
    if s.rvol > w.volume_pulse_rvol {
        fire(w.volume_pulse, tags::VOLUME_PULSE);
    }
    if s.adx > w.strong_trend_adx {
        fire(w.strong_trend, tags::STRONG_TREND);
    }
    if s.supertrend.trend == TrendDirection::Buy {
        fire(w.supertrend_buy, tags::SUPERTREND_BUY);
    }
    if s.macd.histogram > 0.0 {
        fire(w.macd_bullish, tags::MACD_BULLISH);
    }
    let stochastic_turn =
        s.stochastic.k < w.oversold_stochastic && s.stochastic.k > s.stochastic.d;
    if s.rsi < w.oversold_rsi || stochastic_turn {
        fire(w.oversold_reversal, tags::OVERSOLD_REVERSAL);
    }

    (score, active)
}

fn score_vwap_anchor(s: &SignalSnapshot, close: f64, rules: &RuleSet) -> (f64, Vec<String>) {
    let w = &rules.vwap_anchor;
    let mut score = 0.0;
    let mut active = Vec::new();

    if close > s.vwap {
        score += w.price_anchor;
        active.push(tags::PRICE_ANCHOR.to_string());
    }

    if s.rvol > w.institutional_rvol {
        score += w.institutional_pulse;
        active.push(tags::INSTITUTIONAL_PULSE.to_string());
    } else if s.rvol > w.volume_expansion_rvol {
        score += w.volume_expansion;
        active.push(tags::VOLUME_EXPANSION.to_string());
    }

    if s.adx > w.strong_trend_adx {
        score += w.strong_trend;
        active.push(tags::STRONG_TREND.to_string());
        if s.ema.fast > s.ema.slow {
            score += w.ema_alignment_bonus;
        }
    }

    if s.rsi > w.momentum_rsi_low && s.rsi < w.momentum_rsi_high {
        score += w.bullish_momentum;
        active.push(tags::BULLISH_MOMENTUM.to_string());
    } else if s.rsi < w.mean_reversion_rsi {
        score += w.mean_reversion;
        active.push(tags::MEAN_REVERSION.to_string());
    }

    (score, active)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Bars with +/-0.5% highs/lows around each close, volume 1000
    pub(crate) fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let mut prev = closes.first().copied().unwrap_or(0.0);
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let bar = Bar {
                    time: i as i64 * 300_000,
                    open: Decimal::from_f64_retain(prev).unwrap(),
                    high: Decimal::from_f64_retain(c * 1.005).unwrap(),
                    low: Decimal::from_f64_retain(c * 0.995).unwrap(),
                    close: Decimal::from_f64_retain(c).unwrap(),
                    volume: dec!(1000),
                };
                prev = c;
                bar
            })
            .collect()
    }

    pub(crate) fn rising_bars(count: usize) -> Vec<Bar> {
        let closes: Vec<f64> = (0..count).map(|i| 100.0 * 1.01f64.powi(i as i32)).collect();
        bars_from_closes(&closes)
    }

    #[test]
    fn test_short_window_returns_defaults() {
        for len in [0, 1, 15, 29] {
            let snapshot = compute(&rising_bars(len));
            assert_eq!(snapshot.rsi, 50.0);
            assert_eq!(snapshot.adx, 0.0);
            assert_eq!(snapshot.atr, 0.0);
            assert_eq!(snapshot.score, 0.0);
            assert_eq!(snapshot.strength, SignalStrength::Hold);
            assert!(snapshot.active_signals.is_empty());
        }
    }

    #[test]
    fn test_rising_series_with_volume_spike_is_strong_buy() {
        let mut bars = rising_bars(50);
        bars.last_mut().unwrap().volume = dec!(5000);

        let snapshot = compute(&bars);
        assert!(snapshot.score >= 75.0, "score was {}", snapshot.score);
        assert_eq!(snapshot.strength, SignalStrength::StrongBuy);
        assert!(snapshot.has_tag(tags::VOLUME_PULSE));
        assert!(snapshot.has_tag(tags::TREND_STACK));
        assert!(snapshot.has_tag(tags::STRONG_TREND));
    }

    #[test]
    fn test_flat_series_scores_low() {
        let snapshot = compute(&bars_from_closes(&[100.0; 60]));
        assert!(snapshot.score < 55.0);
        assert!(!snapshot.has_tag(tags::TREND_STACK));
        assert!(!snapshot.has_tag(tags::VOLUME_PULSE));
    }

    #[test]
    fn test_outputs_stay_bounded_on_noisy_series() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut price = 100.0;
        let mut closes = Vec::new();
        for _ in 0..200 {
            price *= 1.0 + rng.gen_range(-0.05..0.05);
            closes.push(price);
        }
        for end in 30..closes.len() {
            let snapshot = compute(&bars_from_closes(&closes[..end]));
            assert!((0.0..=100.0).contains(&snapshot.rsi));
            assert!((0.0..=100.0).contains(&snapshot.adx));
            assert!((0.0..=100.0).contains(&snapshot.score));
        }
    }

    #[test]
    fn test_oversold_reversal_on_selloff() {
        let closes: Vec<f64> = (0..40).map(|i| 200.0 * 0.98f64.powi(i)).collect();
        let snapshot = compute(&bars_from_closes(&closes));
        assert!(snapshot.rsi < 30.0);
        assert!(snapshot.has_tag(tags::OVERSOLD_REVERSAL));
        assert!(!snapshot.has_tag(tags::TREND_STACK));
    }

    #[test]
    fn test_classify_thresholds() {
        let t = ClassificationThresholds::for_version(StrategyVersion::Canonical);
        assert_eq!(classify(75.0, &t), SignalStrength::StrongBuy);
        assert_eq!(classify(74.9, &t), SignalStrength::Buy);
        assert_eq!(classify(55.0, &t), SignalStrength::Buy);
        assert_eq!(classify(40.0, &t), SignalStrength::Hold);
        assert_eq!(classify(25.0, &t), SignalStrength::Sell);
    }

    #[test]
    fn test_vwap_anchor_version_uses_its_own_tags() {
        let mut bars = rising_bars(50);
        bars.last_mut().unwrap().volume = dec!(5000);

        let rules = RuleSet::for_version(StrategyVersion::VwapAnchor);
        let snapshot = compute_with(&bars, &rules);
        assert!(snapshot.has_tag(tags::PRICE_ANCHOR));
        assert!(snapshot.has_tag(tags::INSTITUTIONAL_PULSE));
        assert!(!snapshot.has_tag(tags::TREND_STACK));
        // 25 + 35 + 20 + 10 = 90
        assert_eq!(snapshot.score, 90.0);
        assert_eq!(snapshot.strength, SignalStrength::StrongBuy);
    }
}

//! Named scoring rule sets
//!
//! The composite score has gone through several revisions with different
//! weights and thresholds. Each revision is a `StrategyVersion`; its constants
//! live in a `RuleSet` so callers can swap or override them without touching
//! the scoring code.

use serde::{Deserialize, Serialize};

/// Lookback periods used by the indicator engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorPeriods {
    /// Bars required before any indicator output is produced
    pub minimum_window: usize,
    pub rsi: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub adx: usize,
    pub atr: usize,
    pub bollinger: usize,
    pub bollinger_multiplier: f64,
    pub stochastic: usize,
    pub stochastic_smooth: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub supertrend: usize,
    pub supertrend_multiplier: f64,
    pub obv_sma: usize,
    pub volume_average: usize,
    pub vwap: usize,
}

impl Default for IndicatorPeriods {
    fn default() -> Self {
        Self {
            minimum_window: 30,
            rsi: 14,
            ema_fast: 9,
            ema_slow: 21,
            adx: 14,
            atr: 14,
            bollinger: 20,
            bollinger_multiplier: 2.0,
            stochastic: 14,
            stochastic_smooth: 3,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            supertrend: 10,
            supertrend_multiplier: 3.0,
            obv_sma: 10,
            volume_average: 20,
            vwap: 20,
        }
    }
}

/// Which scoring formula to apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyVersion {
    /// Trend stack / breakout / volume pulse / ADX / Supertrend / MACD / oversold
    #[default]
    Canonical,
    /// Earlier VWAP-anchored formula: VWAP, institutional RVOL, ADX, RSI zones
    VwapAnchor,
}

impl StrategyVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyVersion::Canonical => "canonical",
            StrategyVersion::VwapAnchor => "vwap_anchor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "canonical" => Some(StrategyVersion::Canonical),
            "vwap_anchor" | "vwap" => Some(StrategyVersion::VwapAnchor),
            _ => None,
        }
    }
}

/// Point weights of the canonical formula
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalWeights {
    pub trend_stack: f64,
    pub volatility_breakout: f64,
    pub volume_pulse: f64,
    pub volume_pulse_rvol: f64,
    pub strong_trend: f64,
    pub strong_trend_adx: f64,
    pub supertrend_buy: f64,
    pub macd_bullish: f64,
    pub oversold_reversal: f64,
    pub oversold_rsi: f64,
    pub oversold_stochastic: f64,
}

impl Default for CanonicalWeights {
    fn default() -> Self {
        Self {
            trend_stack: 20.0,
            volatility_breakout: 25.0,
            volume_pulse: 20.0,
            volume_pulse_rvol: 2.0,
            strong_trend: 15.0,
            strong_trend_adx: 25.0,
            supertrend_buy: 15.0,
            macd_bullish: 10.0,
            oversold_reversal: 15.0,
            oversold_rsi: 30.0,
            oversold_stochastic: 20.0,
        }
    }
}

/// Point weights of the VWAP-anchored formula
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VwapAnchorWeights {
    pub price_anchor: f64,
    pub institutional_pulse: f64,
    pub institutional_rvol: f64,
    pub volume_expansion: f64,
    pub volume_expansion_rvol: f64,
    pub strong_trend: f64,
    pub strong_trend_adx: f64,
    pub ema_alignment_bonus: f64,
    pub bullish_momentum: f64,
    pub momentum_rsi_low: f64,
    pub momentum_rsi_high: f64,
    pub mean_reversion: f64,
    pub mean_reversion_rsi: f64,
}

impl Default for VwapAnchorWeights {
    fn default() -> Self {
        Self {
            price_anchor: 25.0,
            institutional_pulse: 35.0,
            institutional_rvol: 2.5,
            volume_expansion: 15.0,
            volume_expansion_rvol: 1.5,
            strong_trend: 20.0,
            strong_trend_adx: 25.0,
            ema_alignment_bonus: 10.0,
            bullish_momentum: 15.0,
            momentum_rsi_low: 55.0,
            momentum_rsi_high: 75.0,
            mean_reversion: 20.0,
            mean_reversion_rsi: 30.0,
        }
    }
}

/// Score cut-offs for the strength classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationThresholds {
    pub strong_buy: f64,
    pub buy: f64,
    pub sell: f64,
}

impl ClassificationThresholds {
    pub fn for_version(version: StrategyVersion) -> Self {
        match version {
            StrategyVersion::Canonical => Self {
                strong_buy: 75.0,
                buy: 55.0,
                sell: 25.0,
            },
            StrategyVersion::VwapAnchor => Self {
                strong_buy: 80.0,
                buy: 60.0,
                sell: 30.0,
            },
        }
    }
}

/// Everything the indicator engine needs to turn bars into a scored snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    pub version: StrategyVersion,
    pub periods: IndicatorPeriods,
    pub canonical: CanonicalWeights,
    pub vwap_anchor: VwapAnchorWeights,
    pub thresholds: Option<ClassificationThresholds>,
}

impl RuleSet {
    pub fn for_version(version: StrategyVersion) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Explicit thresholds, or the defaults of the active version
    pub fn thresholds(&self) -> ClassificationThresholds {
        self.thresholds
            .clone()
            .unwrap_or_else(|| ClassificationThresholds::for_version(self.version))
    }
}

/// Tag names emitted into `SignalSnapshot::active_signals`
pub mod tags {
    pub const TREND_STACK: &str = "Trend Stack";
    pub const VOLATILITY_BREAKOUT: &str = "Volatility Breakout";
    pub const VOLUME_PULSE: &str = "Volume Pulse";
    pub const STRONG_TREND: &str = "Strong Trend";
    pub const SUPERTREND_BUY: &str = "Supertrend Buy";
    pub const MACD_BULLISH: &str = "MACD Bullish";
    pub const OVERSOLD_REVERSAL: &str = "Oversold Reversal";

    pub const PRICE_ANCHOR: &str = "Price Anchor (VWAP+)";
    pub const INSTITUTIONAL_PULSE: &str = "Institutional Pulse";
    pub const VOLUME_EXPANSION: &str = "Volume Expansion";
    pub const BULLISH_MOMENTUM: &str = "Bullish Momentum";
    pub const MEAN_REVERSION: &str = "Mean Reversion (Oversold)";
}

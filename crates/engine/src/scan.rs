//! Technical scan over a symbol universe
//!
//! Fetches bars for every symbol with bounded parallelism, scores each series
//! and ranks the results. The ranked list is what the auto trader consumes as
//! entry candidates; the full quote map also covers symbols that merely need
//! marking (held positions).

use std::collections::HashMap;

use futures_util::stream::{self, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auto_trade::{Candidate, SymbolQuote};
use crate::market_data::BarSource;
use crate::rules::RuleSet;
use crate::signals::{self, SignalSnapshot, SignalStrength};
use crate::types::{AssetClass, SkippedSymbol, Timeframe};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    pub symbols: Vec<String>,
    pub asset_class: AssetClass,
    pub interval: String,
    pub range: String,
    /// Entry timeframe stamped on the resulting candidates
    pub timeframe: Timeframe,
    pub max_concurrent_fetches: usize,
    /// Candidates below this score are left out of the ranking
    pub min_score: f64,
    /// Rank every scored symbol regardless of `min_score`
    pub include_all: bool,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            asset_class: AssetClass::Equity,
            interval: "15m".to_string(),
            range: "2d".to_string(),
            timeframe: Timeframe::Intraday,
            max_concurrent_fetches: 10,
            min_score: 70.0,
            include_all: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score > 80.0 {
            RiskLevel::Low
        } else if score > 50.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

/// One ranked scan result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCandidate {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub timeframe: Timeframe,
    pub price: Decimal,
    pub score: f64,
    pub strength: SignalStrength,
    /// Leading active tag, or "Neutral Range"
    pub reason: String,
    pub risk_level: RiskLevel,
    /// Price plus three ATRs
    pub target_price: Decimal,
    pub is_top_pick: bool,
    pub signals: SignalSnapshot,
}

impl ScanCandidate {
    fn new(symbol: &str, request: &ScanRequest, price: Decimal, signals: SignalSnapshot) -> Self {
        let atr = Decimal::from_f64(signals.atr).unwrap_or_default();
        Self {
            symbol: symbol.to_string(),
            asset_class: request.asset_class,
            timeframe: request.timeframe,
            price,
            score: signals.score,
            strength: signals.strength,
            reason: signals
                .active_signals
                .first()
                .cloned()
                .unwrap_or_else(|| "Neutral Range".to_string()),
            risk_level: RiskLevel::from_score(signals.score),
            target_price: (price + atr * Decimal::from(3)).round_dp(2),
            is_top_pick: signals.score >= 85.0,
            signals,
        }
    }

    pub fn to_candidate(&self) -> Candidate {
        Candidate {
            symbol: self.symbol.clone(),
            asset_class: self.asset_class,
            timeframe: self.timeframe,
        }
    }

    pub fn quote(&self) -> SymbolQuote {
        SymbolQuote {
            price: self.price,
            signals: self.signals.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// Score descending, then symbol
    pub ranked: Vec<ScanCandidate>,
    /// Every scored symbol, ranked or not
    pub quotes: HashMap<String, SymbolQuote>,
    pub failed: Vec<SkippedSymbol>,
}

impl ScanReport {
    pub fn candidates(&self) -> Vec<Candidate> {
        self.ranked.iter().map(ScanCandidate::to_candidate).collect()
    }
}

/// Score every symbol in the request
pub async fn run_scan<S>(source: &S, request: &ScanRequest, rules: &RuleSet) -> ScanReport
where
    S: BarSource + ?Sized,
{
    let mut symbols = request.symbols.clone();
    symbols.sort();
    symbols.dedup();

    info!(symbols = symbols.len(), interval = %request.interval, range = %request.range, "Starting scan");

    let fetched: Vec<_> = stream::iter(symbols)
        .map(|symbol| async move {
            let result = source
                .fetch_bars(&symbol, &request.interval, &request.range)
                .await;
            (symbol, result)
        })
        .buffer_unordered(request.max_concurrent_fetches.max(1))
        .collect()
        .await;

    let mut report = ScanReport::default();
    for (symbol, result) in fetched {
        let bars = match result {
            Ok(bars) => bars,
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "Scan fetch failed");
                report.failed.push(SkippedSymbol {
                    symbol,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let Some(last) = bars.last() else {
            report.failed.push(SkippedSymbol {
                symbol,
                reason: "no bars".to_string(),
            });
            continue;
        };

        let snapshot = signals::compute_with(&bars, rules);
        let candidate = ScanCandidate::new(&symbol, request, last.close, snapshot);
        report.quotes.insert(symbol.clone(), candidate.quote());
        if request.include_all || candidate.score >= request.min_score {
            report.ranked.push(candidate);
        }
    }

    report.ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    report.failed.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    info!(
        scored = report.quotes.len(),
        ranked = report.ranked.len(),
        failed = report.failed.len(),
        "Scan complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tests::StaticSource;
    use crate::signals::tests::{bars_from_closes, rising_bars};
    use rust_decimal_macros::dec;

    fn source() -> StaticSource {
        let mut strong = rising_bars(50);
        if let Some(last) = strong.last_mut() {
            last.volume = dec!(5000);
        }
        let flat = bars_from_closes(&[100.0; 50]);
        StaticSource::new(HashMap::from([
            ("UP".to_string(), strong),
            ("FLAT".to_string(), flat),
        ]))
    }

    fn request(symbols: &[&str]) -> ScanRequest {
        ScanRequest {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_risk_level() {
        assert_eq!(RiskLevel::from_score(90.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(80.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(50.0), RiskLevel::High);
    }

    #[tokio::test]
    async fn test_scan_ranks_and_filters() {
        let report = run_scan(
            &source(),
            &request(&["UP", "FLAT", "MISSING", "UP"]),
            &RuleSet::default(),
        )
        .await;

        assert_eq!(report.ranked.len(), 1);
        let top = &report.ranked[0];
        assert_eq!(top.symbol, "UP");
        assert!(top.score >= 75.0);
        assert_eq!(top.is_top_pick, top.score >= 85.0);
        assert_ne!(top.risk_level, RiskLevel::High);
        assert!(top.target_price > top.price);

        assert_eq!(report.quotes.len(), 2);
        assert!(report.quotes.contains_key("FLAT"));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].symbol, "MISSING");

        let candidates = report.candidates();
        assert_eq!(candidates, vec![Candidate::new("UP", AssetClass::Equity)]);
    }

    #[tokio::test]
    async fn test_include_all_ranks_by_score() {
        let report = run_scan(
            &source(),
            &ScanRequest {
                include_all: true,
                ..request(&["FLAT", "UP"])
            },
            &RuleSet::default(),
        )
        .await;
        let order: Vec<_> = report.ranked.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(order, vec!["UP", "FLAT"]);
        let flat = &report.ranked[1];
        assert_eq!(
            flat.reason,
            flat.signals
                .active_signals
                .first()
                .cloned()
                .unwrap_or_else(|| "Neutral Range".to_string())
        );
    }
}

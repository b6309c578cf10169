//! Historical replay of the auto-trade rules
//!
//! Each symbol is replayed bar by bar with a snapshot computed only from the
//! bars seen so far. Exits use the live `ExitRules` plus a forced close on the
//! last bar; entries use the live entry filter and sizing. Capital is split
//! evenly across the requested symbols and every symbol trades its own
//! sub-ledger, one position at a time.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use persistence::repository::BacktestRunRecord;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::auto_trade::{floor_to_step, AutoTradeConfig, ExitReason};
use crate::market_data::BarSource;
use crate::rules::RuleSet;
use crate::signals;
use crate::types::{AssetClass, BacktestResult, BacktestTrade, Bar, EquityPoint, SkippedSymbol};

/// Series shorter than this are skipped
pub const MIN_BARS: usize = 50;

/// Prices and capital are held at this scale so P&L sums stay exact
const MONEY_DP: u32 = 8;

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestRequest {
    pub symbols: Vec<String>,
    pub interval: String,
    pub range: String,
    pub initial_capital: Decimal,
    pub asset_class: AssetClass,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_secs: u64,
    /// Equity curve cadence, in bars
    pub equity_sample_every: usize,
}

impl Default for BacktestRequest {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            interval: "5m".to_string(),
            range: "5d".to_string(),
            initial_capital: dec!(100000),
            asset_class: AssetClass::Equity,
            max_concurrent_fetches: 4,
            fetch_timeout_secs: 15,
            equity_sample_every: 20,
        }
    }
}

/// Scoring and trading rules applied during the replay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestRules {
    pub scoring: RuleSet,
    pub trading: AutoTradeConfig,
}

impl BacktestRequest {
    /// Deterministic hash of everything that affects the result
    pub fn params_hash(&self, rules: &BacktestRules) -> String {
        let mut symbols = self.symbols.clone();
        symbols.sort();
        let rules_json = serde_json::to_string(rules).unwrap_or_default();
        let input = format!(
            "{}:{}:{}:{}:{}:{}:{}",
            symbols.join(","),
            self.interval,
            self.range,
            self.initial_capital,
            self.asset_class,
            self.equity_sample_every,
            rules_json
        );
        format!("{:x}", Sha256::digest(input.as_bytes()))
    }
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Per-symbol completion notice passed to the update callback
#[derive(Debug, Clone, Serialize)]
pub struct SymbolUpdate {
    pub symbol: String,
    pub completed: u32,
    pub total: u32,
    pub trades: usize,
    pub skipped: bool,
}

impl SymbolUpdate {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            100
        } else {
            self.completed * 100 / self.total
        }
    }
}

/// Shared progress tracker for a backtest run
pub struct BacktestProgress {
    pub status: RwLock<BacktestStatus>,
    pub current_symbol: RwLock<String>,
    pub total_symbols: AtomicU32,
    pub completed: AtomicU32,
    pub skipped: AtomicU32,
    pub cancelled: AtomicBool,
    pub final_result: RwLock<Option<BacktestResult>>,
    pub error_message: RwLock<Option<String>>,
    pub started_at: RwLock<Option<String>>,
}

impl Default for BacktestProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktestProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(BacktestStatus::Idle),
            current_symbol: RwLock::new(String::new()),
            total_symbols: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            skipped: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            final_result: RwLock::new(None),
            error_message: RwLock::new(None),
            started_at: RwLock::new(None),
        }
    }

    /// Clear everything, including a pending cancellation
    pub fn reset(&self) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = BacktestStatus::Idle;
        self.clear_run_state();
    }

    /// Reset and mark the progress as running, unless a run already holds it.
    /// Check and transition happen under one status lock, so concurrent
    /// callers cannot both win.
    pub fn try_claim(&self) -> bool {
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            if *status == BacktestStatus::Running {
                return false;
            }
            *status = BacktestStatus::Running;
        }
        self.clear_run_state();
        true
    }

    fn clear_run_state(&self) {
        self.current_symbol
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.total_symbols.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.final_result.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.error_message.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.started_at.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> BacktestStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail(&self, message: impl Into<String>) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = BacktestStatus::Error;
        *self.error_message.write().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    pub fn result(&self) -> Option<BacktestResult> {
        self.final_result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn progress_pct(&self) -> f32 {
        let total = self.total_symbols.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == BacktestStatus::Running
    }

    fn start(&self, total: u32) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = BacktestStatus::Running;
        *self.started_at.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Utc::now().to_rfc3339());
        self.total_symbols.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }

    fn finish(&self, result: &BacktestResult) {
        let status = if result.incomplete {
            BacktestStatus::Cancelled
        } else {
            BacktestStatus::Complete
        };
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
        *self.final_result.write().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
    }
}

// ============================================================================
// Replay
// ============================================================================

struct OpenTrade {
    entry_time: i64,
    entry_price: Decimal,
    quantity: Decimal,
    entry_fee: Decimal,
    high_water: Decimal,
}

/// Outcome of replaying one symbol
#[derive(Debug, Clone, Default)]
pub struct SymbolReplay {
    pub trades: Vec<BacktestTrade>,
    /// (bar time, realized P&L of this symbol so far)
    pub samples: Vec<(i64, Decimal)>,
    pub realized_pnl: Decimal,
}

/// Replay one symbol's bars against `capital`
pub fn replay_symbol(
    symbol: &str,
    bars: &[Bar],
    capital: Decimal,
    asset_class: AssetClass,
    rules: &BacktestRules,
    sample_every: usize,
) -> SymbolReplay {
    let mut replay = SymbolReplay::default();
    let start = rules.scoring.periods.minimum_window;
    if bars.len() <= start {
        return replay;
    }

    let config = &rules.trading;
    let exit_rules = config.exit_rules();
    let sample_every = sample_every.max(1);
    let last_index = bars.len() - 1;
    let mut cash = capital;
    let mut position: Option<OpenTrade> = None;

    for i in start..bars.len() {
        let bar = &bars[i];
        let price = bar.close.round_dp(MONEY_DP);
        let is_last = i == last_index;
        let snapshot = signals::compute_with(&bars[..=i], &rules.scoring);

        if let Some(open) = position.as_mut() {
            open.high_water = open.high_water.max(price);
            let reason = exit_rules
                .check(open.entry_price, open.high_water, price, &snapshot)
                .or_else(|| is_last.then_some(ExitReason::EndOfData));

            if let Some(reason) = reason {
                let notional = price * open.quantity;
                let exit_fee = config.fees.fee_for(notional);
                let cost = open.entry_price * open.quantity + open.entry_fee;
                let pnl = (notional - exit_fee) - cost;
                cash += notional - exit_fee;
                replay.realized_pnl += pnl;

                let invested = open.entry_price * open.quantity;
                let pnl_percent = if invested > Decimal::ZERO {
                    (pnl / invested * dec!(100)).round_dp(4)
                } else {
                    Decimal::ZERO
                };
                debug!(symbol, reason = reason.as_str(), pnl = %pnl, "Backtest exit");
                replay.trades.push(BacktestTrade {
                    symbol: symbol.to_string(),
                    entry_time: open.entry_time,
                    exit_time: bar.time,
                    entry_price: open.entry_price,
                    exit_price: price,
                    quantity: open.quantity,
                    pnl,
                    pnl_percent,
                    exit_reason: reason.as_str().to_string(),
                });
                position = None;
            }
        } else if !is_last && price > Decimal::ZERO && config.entry_blocker(&snapshot).is_none() {
            let target = config.target_allocation(cash, Decimal::ZERO) * config.slice_fraction;
            let quantity = floor_to_step(target.min(cash) / price, asset_class.lot_step());
            let notional = quantity * price;
            let entry_fee = config.fees.fee_for(notional);

            if quantity > Decimal::ZERO && notional + entry_fee <= cash {
                cash -= notional + entry_fee;
                debug!(symbol, qty = %quantity, price = %price, score = snapshot.score, "Backtest entry");
                position = Some(OpenTrade {
                    entry_time: bar.time,
                    entry_price: price,
                    quantity,
                    entry_fee,
                    high_water: price,
                });
            }
        }

        if i % sample_every == 0 || is_last {
            replay.samples.push((bar.time, replay.realized_pnl));
        }
    }

    debug_assert!(position.is_none(), "position left open after final bar");
    debug_assert_eq!(cash - capital, replay.realized_pnl);
    replay
}

/// Largest peak-to-trough fall, in percent of the peak
pub fn max_drawdown_pct(values: &[Decimal]) -> Decimal {
    let Some(&first) = values.first() else {
        return Decimal::ZERO;
    };
    let mut peak = first;
    let mut max_drawdown = Decimal::ZERO;
    for &value in values {
        if value > peak {
            peak = value;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - value) / peak * dec!(100);
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }
    }
    max_drawdown
}

/// Fetch every symbol and replay it.
///
/// Fetches run ahead with bounded parallelism; replays run one symbol at a
/// time in request order. Cancellation is honoured between symbols and marks
/// the result incomplete.
pub async fn run<S, F>(
    request: &BacktestRequest,
    rules: &BacktestRules,
    source: &S,
    progress: &BacktestProgress,
    mut on_update: F,
) -> BacktestResult
where
    S: BarSource + ?Sized,
    F: FnMut(&SymbolUpdate),
{
    let symbols = &request.symbols;
    let total = symbols.len() as u32;
    progress.start(total);
    info!(
        symbols = total,
        interval = %request.interval,
        range = %request.range,
        capital = %request.initial_capital,
        version = rules.scoring.version.as_str(),
        "Starting backtest"
    );

    let per_symbol = if symbols.is_empty() {
        Decimal::ZERO
    } else {
        (request.initial_capital / Decimal::from(symbols.len())).round_dp(MONEY_DP)
    };
    let timeout = Duration::from_secs(request.fetch_timeout_secs.max(1));

    let mut fetches = stream::iter(0..symbols.len())
        .map(|i| {
            let symbol = &symbols[i];
            async move {
                let result = tokio::time::timeout(
                    timeout,
                    source.fetch_bars(symbol, &request.interval, &request.range),
                )
                .await;
                let bars = match result {
                    Ok(Ok(bars)) => Ok(bars),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
                };
                (symbol.clone(), bars)
            }
        })
        .buffered(request.max_concurrent_fetches.max(1));

    let mut capital = request.initial_capital;
    let mut trades: Vec<BacktestTrade> = Vec::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::new();
    let mut skipped: Vec<SkippedSymbol> = Vec::new();
    let mut incomplete = false;

    while let Some((symbol, fetched)) = fetches.next().await {
        if progress.is_cancelled() {
            info!(completed = progress.completed.load(Ordering::Relaxed), "Backtest cancelled");
            incomplete = true;
            break;
        }
        *progress
            .current_symbol
            .write()
            .unwrap_or_else(PoisonError::into_inner) = symbol.clone();

        let mut symbol_trades = 0;
        let mut was_skipped = false;
        match fetched {
            Ok(bars) if bars.len() >= MIN_BARS => {
                let replay = replay_symbol(
                    &symbol,
                    &bars,
                    per_symbol,
                    request.asset_class,
                    rules,
                    request.equity_sample_every,
                );
                equity_curve.extend(replay.samples.iter().map(|(time, pnl)| EquityPoint {
                    time: *time,
                    value: capital + pnl,
                }));
                capital += replay.realized_pnl;
                symbol_trades = replay.trades.len();
                trades.extend(replay.trades);
            }
            other => {
                let reason = match other {
                    Ok(bars) => format!("only {} bars (need {})", bars.len(), MIN_BARS),
                    Err(reason) => reason,
                };
                warn!(symbol = %symbol, reason = %reason, "Skipping symbol");
                progress.skipped.fetch_add(1, Ordering::Relaxed);
                skipped.push(SkippedSymbol {
                    symbol: symbol.clone(),
                    reason,
                });
                was_skipped = true;
            }
        }

        let completed = progress.completed.fetch_add(1, Ordering::Relaxed) + 1;
        on_update(&SymbolUpdate {
            symbol,
            completed,
            total,
            trades: symbol_trades,
            skipped: was_skipped,
        });
    }

    let result = summarize(request.initial_capital, capital, trades, equity_curve, skipped, incomplete);
    info!(
        trades = result.total_trades,
        pnl = %result.total_pnl,
        win_rate = %result.win_rate,
        max_drawdown_pct = %result.max_drawdown_pct,
        incomplete = result.incomplete,
        "Backtest complete"
    );
    progress.finish(&result);
    result
}

fn summarize(
    initial_capital: Decimal,
    final_capital: Decimal,
    mut trades: Vec<BacktestTrade>,
    equity_curve: Vec<EquityPoint>,
    skipped: Vec<SkippedSymbol>,
    incomplete: bool,
) -> BacktestResult {
    let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
    debug_assert_eq!(final_capital - initial_capital, total_pnl);

    let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    let win_rate = if trades.is_empty() {
        Decimal::ZERO
    } else {
        (Decimal::from(wins) / Decimal::from(trades.len()) * dec!(100)).round_dp(2)
    };

    let mut values = Vec::with_capacity(equity_curve.len() + 1);
    values.push(initial_capital);
    values.extend(equity_curve.iter().map(|p| p.value));
    let max_drawdown_pct = max_drawdown_pct(&values).round_dp(4);

    trades.sort_by(|a, b| b.exit_time.cmp(&a.exit_time).then_with(|| a.symbol.cmp(&b.symbol)));

    BacktestResult {
        initial_capital,
        final_capital,
        total_pnl,
        win_rate,
        total_trades: trades.len() as u32,
        max_drawdown_pct,
        trades,
        equity_curve,
        skipped,
        incomplete,
    }
}

/// Row for the backtest history table
pub fn run_record(
    request: &BacktestRequest,
    rules: &BacktestRules,
    result: &BacktestResult,
) -> serde_json::Result<BacktestRunRecord> {
    Ok(BacktestRunRecord {
        id: None,
        params_hash: request.params_hash(rules),
        symbols: request.symbols.join(","),
        bar_interval: request.interval.clone(),
        bar_range: request.range.clone(),
        initial_capital: result.initial_capital.to_string(),
        final_capital: result.final_capital.to_string(),
        total_pnl: result.total_pnl.to_string(),
        win_rate: result.win_rate.to_string(),
        total_trades: i64::from(result.total_trades),
        max_drawdown_pct: result.max_drawdown_pct.to_string(),
        incomplete: result.incomplete,
        result_json: serde_json::to_string(result)?,
        strategy_version: rules.scoring.version.as_str().to_string(),
        skipped_count: result.skipped.len() as i64,
        created_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_trade::AtrTarget;
    use crate::market_data::tests::StaticSource;
    use crate::signals::tests::{bars_from_closes, rising_bars};
    use crate::synthetic;
    use std::collections::HashMap;

    /// Enter on any bar, never take profit
    fn eager_rules() -> BacktestRules {
        let mut rules = BacktestRules::default();
        rules.trading.entry_score_threshold = 0.0;
        rules.trading.required_tags.clear();
        rules.trading.take_profit_percent = dec!(1000);
        rules
    }

    fn request(symbols: &[&str]) -> BacktestRequest {
        BacktestRequest {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_max_drawdown() {
        let values = [dec!(100), dec!(110), dec!(90), dec!(95)];
        assert_eq!(max_drawdown_pct(&values).round_dp(2), dec!(18.18));
        assert_eq!(max_drawdown_pct(&[]), Decimal::ZERO);
        assert_eq!(max_drawdown_pct(&[dec!(100), dec!(120)]), Decimal::ZERO);
    }

    #[test]
    fn test_rising_series_closes_at_end_of_data() {
        let bars = rising_bars(60);
        let replay = replay_symbol("UP", &bars, dec!(100000), AssetClass::Equity, &eager_rules(), 20);

        assert_eq!(replay.trades.len(), 1);
        let trade = &replay.trades[0];
        assert_eq!(trade.entry_time, bars[30].time);
        assert_eq!(trade.exit_time, bars[59].time);
        assert_eq!(trade.exit_reason, "end of data");
        let expected = (trade.exit_price * trade.quantity - dec!(20))
            - (trade.entry_price * trade.quantity + dec!(20));
        assert_eq!(trade.pnl, expected);
        assert!(trade.pnl > Decimal::ZERO);

        // Bar 40 on the cadence, bar 59 as the last
        let times: Vec<i64> = replay.samples.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![bars[40].time, bars[59].time]);
    }

    #[test]
    fn test_atr_target_takes_profit_before_end() {
        // +1% per bar against an ATR near 1.5% of price: one ATR is cleared on the second bar
        let mut rules = eager_rules();
        rules.trading.atr_target = Some(AtrTarget {
            target_multiplier: Decimal::ONE,
            stop_tightening: dec!(0.7),
        });
        let bars = rising_bars(60);
        let replay = replay_symbol("UP", &bars, dec!(100000), AssetClass::Equity, &rules, 20);

        assert!(replay.trades.len() > 1);
        let first = &replay.trades[0];
        assert_eq!(first.exit_reason, "take profit");
        assert_eq!(first.entry_time, bars[30].time);
        assert!(first.exit_time < bars[59].time);
        assert!(replay.trades[..replay.trades.len() - 1]
            .iter()
            .all(|t| t.exit_reason == "take profit"));
        let total: Decimal = replay.trades.iter().map(|t| t.pnl).sum();
        assert_eq!(total, replay.realized_pnl);
    }

    #[test]
    fn test_progress_claim_is_exclusive() {
        let progress = BacktestProgress::new();
        progress.cancel();
        assert!(progress.try_claim());
        assert!(progress.is_running());
        assert!(!progress.is_cancelled());
        assert!(!progress.try_claim());

        progress.fail("Result not stored: disk full");
        assert_eq!(progress.status(), BacktestStatus::Error);
        assert!(progress.try_claim());

        progress.reset();
        assert_eq!(progress.status(), BacktestStatus::Idle);
        assert!(progress.error_message.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flat_series_produces_no_trades() {
        let source = StaticSource::new(HashMap::from([(
            "FLAT".to_string(),
            bars_from_closes(&[100.0; 80]),
        )]));
        let progress = BacktestProgress::new();
        let result = run(
            &request(&["FLAT"]),
            &BacktestRules::default(),
            &source,
            &progress,
            |_| {},
        )
        .await;

        assert_eq!(result.total_trades, 0);
        assert_eq!(result.win_rate, Decimal::ZERO);
        assert_eq!(result.total_pnl, Decimal::ZERO);
        assert_eq!(result.max_drawdown_pct, Decimal::ZERO);
        assert!(!result.equity_curve.is_empty());
        assert!(result.equity_curve.iter().all(|p| p.value == dec!(100000)));
        assert_eq!(progress.status(), BacktestStatus::Complete);
    }

    #[tokio::test]
    async fn test_capital_change_equals_trade_pnl() {
        let series: HashMap<String, Vec<Bar>> = ["AAA", "BBB", "CCC"]
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let bars = synthetic::generate(500.0, 250, 250 * synthetic::BAR_SPACING_MS, i as u64);
                (s.to_string(), bars)
            })
            .collect();
        let source = StaticSource::new(series);
        let progress = BacktestProgress::new();
        let result = run(
            &request(&["AAA", "BBB", "CCC"]),
            &eager_rules(),
            &source,
            &progress,
            |_| {},
        )
        .await;

        assert!(!result.trades.is_empty());
        let sum: Decimal = result.trades.iter().map(|t| t.pnl).sum();
        assert_eq!(result.final_capital - result.initial_capital, sum);
        assert_eq!(result.total_pnl, sum);
        for pair in result.trades.windows(2) {
            assert!(pair[0].exit_time >= pair[1].exit_time);
        }
        let last = result.equity_curve.last().unwrap();
        assert_eq!(last.value, result.final_capital);
    }

    #[tokio::test]
    async fn test_short_and_missing_series_are_skipped() {
        let source = StaticSource::new(HashMap::from([
            ("SHORT".to_string(), rising_bars(40)),
            ("OK".to_string(), rising_bars(60)),
        ]));
        let progress = BacktestProgress::new();
        let mut updates = Vec::new();
        let result = run(
            &request(&["SHORT", "GONE", "OK"]),
            &eager_rules(),
            &source,
            &progress,
            |u| updates.push(u.clone()),
        )
        .await;

        assert_eq!(result.skipped.len(), 2);
        assert_eq!(result.skipped[0].symbol, "SHORT");
        assert!(result.skipped[0].reason.contains("40 bars"));
        assert_eq!(result.skipped[1].symbol, "GONE");
        assert_eq!(result.total_trades, 1);
        assert!(!result.incomplete);

        let percents: Vec<u32> = updates.iter().map(|u| u.percent()).collect();
        assert_eq!(percents, vec![33, 66, 100]);
        assert!(updates[0].skipped && updates[1].skipped && !updates[2].skipped);
        assert_eq!(progress.skipped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_cancellation_between_symbols() {
        let source = StaticSource::new(HashMap::from([
            ("AAA".to_string(), rising_bars(60)),
            ("BBB".to_string(), rising_bars(60)),
        ]));
        let progress = BacktestProgress::new();
        let result = run(
            &request(&["AAA", "BBB"]),
            &eager_rules(),
            &source,
            &progress,
            |_| progress.cancel(),
        )
        .await;

        assert!(result.incomplete);
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.trades[0].symbol, "AAA");
        assert_eq!(progress.status(), BacktestStatus::Cancelled);
        assert_eq!(progress.completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_params_hash_is_stable() {
        let rules = BacktestRules::default();
        let a = request(&["B", "A"]).params_hash(&rules);
        assert_eq!(a, request(&["A", "B"]).params_hash(&rules));
        assert_eq!(a.len(), 64);
        assert_ne!(a, request(&["A", "B"]).params_hash(&eager_rules()));
    }

    #[test]
    fn test_run_record() {
        let rules = BacktestRules::default();
        let result = summarize(dec!(100000), dec!(100000), Vec::new(), Vec::new(), Vec::new(), true);
        let record = run_record(&request(&["A", "B"]), &rules, &result).unwrap();
        assert_eq!(record.symbols, "A,B");
        assert_eq!(record.strategy_version, "canonical");
        assert!(record.incomplete);
        assert_eq!(record.total_trades, 0);
    }
}

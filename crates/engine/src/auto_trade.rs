//! Auto-trade decision engine
//!
//! One cycle: evaluate exits for every open position of the configured broker,
//! then consider at most one new entry from the candidate list. `evaluate` is
//! pure; `AutoTrader` runs a cycle against a ledger and commits the result.
//!
//! Exit precedence (first match wins):
//! 1. Volatility stop: price below the ATR stop
//! 2. Momentum decay: losing and the score fell under the weakness floor
//! 3. Profit lock (optional): comfortably up but the score is fading
//! 4. Take profit: gain at or above the target, or above the ATR target
//! 5. Session close: intraday position at or after the square-off time

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fees::FeeSchedule;
use crate::ledger::{FundsLedger, LedgerHandle, LedgerResult};
use crate::rules::tags;
use crate::session::MarketSession;
use crate::signals::SignalSnapshot;
use crate::types::{
    AssetClass, Broker, Position, PositionKey, Timeframe, TradeAction, TradeSide, Transaction,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationMode {
    /// `allocation_value` percent of the bucket (cash + invested)
    #[default]
    Percentage,
    /// `allocation_value` currency units per position
    Fixed,
}

/// Whether an already-held symbol may receive further entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationPolicy {
    #[default]
    SingleEntry,
    /// Keep adding slices until the target allocation is reached
    Accumulate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTradeConfig {
    /// Account the engine trades
    pub broker: Broker,
    pub allocation_mode: AllocationMode,
    pub allocation_value: Decimal,
    pub max_open_positions: usize,
    pub stop_atr_multiplier: Decimal,
    /// Multiplier once the high-water gain passes `trailing_profit_trigger_percent`
    pub trailing_stop_multiplier: Decimal,
    pub trailing_profit_trigger_percent: Decimal,
    /// ATR substitute, in percent of price, when the snapshot has no ATR
    pub atr_fallback_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub weakness_score_floor: f64,
    /// Optional exit on a fading score while the position is in profit
    pub profit_lock: Option<ProfitLock>,
    /// Optional ATR-relative target replacing the percentage take profit
    pub atr_target: Option<AtrTarget>,
    pub entry_score_threshold: f64,
    /// Every tag must be active for an entry
    pub required_tags: Vec<String>,
    /// Intraday square-off, minutes before the close
    pub session_cutoff_minutes: u32,
    /// No new entries within this many minutes of the close
    pub entry_cutoff_minutes: u32,
    /// Fraction of the target allocation issued per cycle
    pub slice_fraction: Decimal,
    pub accumulation: AccumulationPolicy,
    pub enabled_buckets: Vec<AssetClass>,
    pub session: MarketSession,
    pub fees: FeeSchedule,
}

impl Default for AutoTradeConfig {
    fn default() -> Self {
        Self {
            broker: Broker::Paper,
            allocation_mode: AllocationMode::Percentage,
            allocation_value: dec!(5),
            max_open_positions: 10,
            stop_atr_multiplier: dec!(1.5),
            trailing_stop_multiplier: dec!(1.0),
            trailing_profit_trigger_percent: dec!(3),
            atr_fallback_percent: dec!(1.5),
            take_profit_percent: dec!(10),
            weakness_score_floor: 30.0,
            profit_lock: None,
            atr_target: None,
            entry_score_threshold: 75.0,
            required_tags: vec![tags::TREND_STACK.to_string(), tags::VOLUME_PULSE.to_string()],
            session_cutoff_minutes: 10,
            entry_cutoff_minutes: 30,
            slice_fraction: Decimal::ONE,
            accumulation: AccumulationPolicy::SingleEntry,
            enabled_buckets: AssetClass::all().to_vec(),
            session: MarketSession::default(),
            fees: FeeSchedule::default(),
        }
    }
}

impl AutoTradeConfig {
    pub fn exit_rules(&self) -> ExitRules {
        ExitRules {
            stop_atr_multiplier: self.stop_atr_multiplier,
            trailing_stop_multiplier: self.trailing_stop_multiplier,
            trailing_profit_trigger_percent: self.trailing_profit_trigger_percent,
            atr_fallback_percent: self.atr_fallback_percent,
            take_profit_percent: self.take_profit_percent,
            weakness_score_floor: self.weakness_score_floor,
            profit_lock: self.profit_lock.clone(),
            atr_target: self.atr_target.clone(),
        }
    }

    /// Why `signals` fails the entry filter, or `None` when it qualifies
    pub fn entry_blocker(&self, signals: &SignalSnapshot) -> Option<String> {
        if signals.score < self.entry_score_threshold {
            return Some(format!(
                "score {:.0} below {:.0}",
                signals.score, self.entry_score_threshold
            ));
        }
        self.required_tags
            .iter()
            .find(|t| !signals.has_tag(t))
            .map(|missing| format!("missing {missing}"))
    }

    /// Target notional for one position in `class`
    pub fn target_allocation(&self, bucket_cash: Decimal, invested: Decimal) -> Decimal {
        match self.allocation_mode {
            AllocationMode::Percentage => (bucket_cash + invested) * self.allocation_value / dec!(100),
            AllocationMode::Fixed => self.allocation_value,
        }
    }
}

// ============================================================================
// Exit rules (shared with the backtest)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    VolatilityStop,
    MomentumDecay,
    /// Score faded while the position is still comfortably in profit
    ProfitLock,
    TakeProfit,
    SessionClose,
    /// Backtest only: forced close on the last bar
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::VolatilityStop => "volatility stop",
            ExitReason::MomentumDecay => "momentum decay",
            ExitReason::ProfitLock => "momentum fade, profit locked",
            ExitReason::TakeProfit => "take profit",
            ExitReason::SessionClose => "session close",
            ExitReason::EndOfData => "end of data",
        }
    }
}

/// Sell a winner whose score has dropped: gain above `min_gain_percent`
/// and score below `score_below`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitLock {
    pub min_gain_percent: Decimal,
    pub score_below: f64,
}

impl Default for ProfitLock {
    fn default() -> Self {
        Self {
            min_gain_percent: dec!(5),
            score_below: 50.0,
        }
    }
}

/// ATR-relative exits: take profit above `avg_cost + ATR × target_multiplier`,
/// and a cost-anchored stop whose multiplier is scaled by
/// `stop_tightening` once the current gain passes the trailing trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrTarget {
    pub target_multiplier: Decimal,
    pub stop_tightening: Decimal,
}

impl Default for AtrTarget {
    fn default() -> Self {
        Self {
            target_multiplier: dec!(3),
            stop_tightening: dec!(0.7),
        }
    }
}

/// Price-based exit thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRules {
    pub stop_atr_multiplier: Decimal,
    pub trailing_stop_multiplier: Decimal,
    pub trailing_profit_trigger_percent: Decimal,
    pub atr_fallback_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub weakness_score_floor: f64,
    #[serde(default)]
    pub profit_lock: Option<ProfitLock>,
    #[serde(default)]
    pub atr_target: Option<AtrTarget>,
}

impl Default for ExitRules {
    fn default() -> Self {
        AutoTradeConfig::default().exit_rules()
    }
}

impl ExitRules {
    /// ATR from the snapshot, or `atr_fallback_percent` of `price` when absent
    fn effective_atr(&self, price: Decimal, atr: f64) -> Decimal {
        Decimal::from_f64(atr)
            .filter(|a| *a > Decimal::ZERO)
            .unwrap_or(price * self.atr_fallback_percent / dec!(100))
    }

    /// Stop level for a position. Once the high-water mark is more than the
    /// trigger above cost, the stop trails the mark at the tighter multiplier.
    /// With an ATR target the stop stays anchored at cost and only its
    /// multiplier tightens, keyed on the current gain.
    pub fn stop_price(&self, avg_cost: Decimal, high_water: Decimal, price: Decimal, atr: f64) -> Decimal {
        let atr = self.effective_atr(price, atr);
        if let Some(target) = &self.atr_target {
            let multiplier = if percent_change(avg_cost, price) > self.trailing_profit_trigger_percent {
                self.stop_atr_multiplier * target.stop_tightening
            } else {
                self.stop_atr_multiplier
            };
            return avg_cost - atr * multiplier;
        }
        let peak_gain = percent_change(avg_cost, high_water);
        if peak_gain > self.trailing_profit_trigger_percent {
            high_water - atr * self.trailing_stop_multiplier
        } else {
            avg_cost - atr * self.stop_atr_multiplier
        }
    }

    /// First matching price-based exit, if any. The trailing stop is measured
    /// from `high_water`, not from cost, once the peak gain passes the trigger.
    pub fn check(
        &self,
        avg_cost: Decimal,
        high_water: Decimal,
        price: Decimal,
        signals: &SignalSnapshot,
    ) -> Option<ExitReason> {
        let high_water = high_water.max(price).max(avg_cost);
        let gain = percent_change(avg_cost, price);

        if price < self.stop_price(avg_cost, high_water, price, signals.atr) {
            Some(ExitReason::VolatilityStop)
        } else if gain < Decimal::ZERO && signals.score < self.weakness_score_floor {
            Some(ExitReason::MomentumDecay)
        } else if self
            .profit_lock
            .as_ref()
            .is_some_and(|lock| gain > lock.min_gain_percent && signals.score < lock.score_below)
        {
            Some(ExitReason::ProfitLock)
        } else if self.reached_target(avg_cost, price, gain, signals.atr) {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    fn reached_target(&self, avg_cost: Decimal, price: Decimal, gain: Decimal, atr: f64) -> bool {
        match &self.atr_target {
            Some(target) => price > avg_cost + self.effective_atr(price, atr) * target.target_multiplier,
            None => gain >= self.take_profit_percent,
        }
    }
}

fn percent_change(from: Decimal, to: Decimal) -> Decimal {
    if from <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (to - from) / from * dec!(100)
}

/// Round `quantity` down to a whole number of `step`s
pub fn floor_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (quantity / step).floor() * step
}

// ============================================================================
// Cycle inputs and outputs
// ============================================================================

/// Latest price and signal snapshot for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolQuote {
    pub price: Decimal,
    pub signals: SignalSnapshot,
}

/// A symbol proposed for entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub asset_class: AssetClass,
    #[serde(default)]
    pub timeframe: Timeframe,
}

impl Candidate {
    pub fn new(symbol: impl Into<String>, asset_class: AssetClass) -> Self {
        Self {
            symbol: symbol.into(),
            asset_class,
            timeframe: Timeframe::Intraday,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleDecision {
    /// Exits first (symbol order), then at most one entry
    pub actions: Vec<TradeAction>,
    pub skipped: Vec<SkippedCandidate>,
}

impl CycleDecision {
    fn skip(&mut self, symbol: &str, reason: impl Into<String>) {
        self.skipped.push(SkippedCandidate {
            symbol: symbol.to_string(),
            reason: reason.into(),
        });
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Actions for one cycle
pub fn evaluate(
    config: &AutoTradeConfig,
    positions: &[Position],
    quotes: &HashMap<String, SymbolQuote>,
    funds: &FundsLedger,
    candidates: &[Candidate],
    now: DateTime<Utc>,
) -> Vec<TradeAction> {
    evaluate_detailed(config, positions, quotes, funds, candidates, now).actions
}

/// Actions for one cycle plus the candidates that were passed over and why
pub fn evaluate_detailed(
    config: &AutoTradeConfig,
    positions: &[Position],
    quotes: &HashMap<String, SymbolQuote>,
    funds: &FundsLedger,
    candidates: &[Candidate],
    now: DateTime<Utc>,
) -> CycleDecision {
    let mut decision = CycleDecision::default();
    let session = &config.session;
    if !session.is_open(now) {
        return decision;
    }

    let mut working = funds.clone();
    let mut exited: HashSet<PositionKey> = HashSet::new();

    // ── Exits ──
    let rules = config.exit_rules();
    let square_off = session.is_past_square_off(now, config.session_cutoff_minutes);
    let mut held: Vec<&Position> = positions
        .iter()
        .filter(|p| p.broker == config.broker)
        .collect();
    held.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    for position in &held {
        let Some(quote) = quotes.get(&position.symbol) else {
            continue;
        };
        let reason = rules
            .check(position.avg_cost, position.high_water, quote.price, &quote.signals)
            .or_else(|| {
                (position.timeframe == Timeframe::Intraday && square_off)
                    .then_some(ExitReason::SessionClose)
            });
        let Some(reason) = reason else { continue };

        let action = TradeAction {
            side: TradeSide::Sell,
            symbol: position.symbol.clone(),
            quantity: position.quantity,
            price: quote.price,
            reason: reason.as_str().to_string(),
            asset_class: position.asset_class,
            broker: position.broker,
            timeframe: position.timeframe,
        };
        let proceeds = action.notional() - config.fees.fee_for(action.notional());
        let cash = working.get(position.asset_class) + proceeds;
        working.set(position.asset_class, cash.max(Decimal::ZERO));

        debug!(
            symbol = %action.symbol,
            reason = reason.as_str(),
            price = %quote.price,
            gain_pct = %position.pnl_percent(quote.price).round_dp(2),
            "Exit signal"
        );
        exited.insert(position.key());
        decision.actions.push(action);
    }

    // ── Entries ──
    if !session.accepts_entries(now, config.entry_cutoff_minutes) {
        return decision;
    }
    let open_after_exits = held.len() - exited.len();
    if open_after_exits >= config.max_open_positions {
        return decision;
    }

    let invested = |class: AssetClass| -> Decimal {
        positions
            .iter()
            .filter(|p| {
                p.broker == config.broker && p.asset_class == class && !exited.contains(&p.key())
            })
            .map(|p| p.total_cost)
            .sum()
    };

    let mut seen: HashSet<&str> = HashSet::new();
    let mut eligible: Vec<(&Candidate, &SymbolQuote, Option<&Position>)> = Vec::new();
    for candidate in candidates {
        if !seen.insert(candidate.symbol.as_str()) {
            continue;
        }
        let Some(quote) = quotes.get(&candidate.symbol) else {
            decision.skip(&candidate.symbol, "no market data");
            continue;
        };
        if !config.enabled_buckets.contains(&candidate.asset_class)
            || !config.broker.supports(candidate.asset_class)
        {
            decision.skip(&candidate.symbol, "funds bucket mismatch");
            continue;
        }

        let key = PositionKey {
            broker: config.broker,
            asset_class: candidate.asset_class,
            symbol: candidate.symbol.clone(),
        };
        if exited.contains(&key) {
            decision.skip(&candidate.symbol, "exited this cycle");
            continue;
        }
        let existing = held.iter().copied().find(|p| p.key() == key);
        if existing.is_some() && config.accumulation == AccumulationPolicy::SingleEntry {
            decision.skip(&candidate.symbol, "already held");
            continue;
        }

        if let Some(reason) = config.entry_blocker(&quote.signals) {
            decision.skip(&candidate.symbol, reason);
            continue;
        }

        eligible.push((candidate, quote, existing));
    }

    eligible.sort_by(|a, b| {
        b.1.signals
            .score
            .total_cmp(&a.1.signals.score)
            .then_with(|| a.0.symbol.cmp(&b.0.symbol))
    });

    for (candidate, quote, existing) in eligible {
        let class = candidate.asset_class;
        let target = config.target_allocation(working.get(class), invested(class));
        let mut order_value = target * config.slice_fraction;
        if let Some(position) = existing {
            let remaining = target - position.total_cost;
            if remaining <= Decimal::ZERO {
                decision.skip(&candidate.symbol, "target allocation reached");
                continue;
            }
            order_value = order_value.min(remaining);
        }

        if quote.price <= Decimal::ZERO {
            decision.skip(&candidate.symbol, "no valid price");
            continue;
        }
        let quantity = floor_to_step(order_value / quote.price, class.lot_step());
        if quantity <= Decimal::ZERO {
            decision.skip(&candidate.symbol, "quantity rounds to zero");
            continue;
        }

        let notional = quantity * quote.price;
        let cost = notional + config.fees.fee_for(notional);
        if cost > working.get(class) {
            decision.skip(&candidate.symbol, "insufficient funds");
            continue;
        }

        working.set(class, working.get(class) - cost);
        let action = TradeAction {
            side: TradeSide::Buy,
            symbol: candidate.symbol.clone(),
            quantity,
            price: quote.price,
            reason: format!("Smart Entry: {}", quote.signals.active_signals.join(" + ")),
            asset_class: class,
            broker: config.broker,
            timeframe: existing.map(|p| p.timeframe).unwrap_or(candidate.timeframe),
        };
        debug!(symbol = %action.symbol, qty = %quantity, price = %quote.price,
            score = quote.signals.score, "Entry signal");
        decision.actions.push(action);
        break;
    }

    decision
}

// ============================================================================
// Live cycle
// ============================================================================

/// Outcome of one committed cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub committed: Vec<Transaction>,
    /// Actions the ledger refused, with the reason
    pub rejected: Vec<(TradeAction, String)>,
    pub skipped: Vec<SkippedCandidate>,
}

/// Runs decision cycles against a ledger
pub struct AutoTrader {
    config: AutoTradeConfig,
    ledger: LedgerHandle,
}

impl AutoTrader {
    pub fn new(config: AutoTradeConfig, ledger: LedgerHandle) -> Self {
        Self { config, ledger }
    }

    pub fn config(&self) -> &AutoTradeConfig {
        &self.config
    }

    /// Evaluate and commit one cycle while holding the ledger writer lock
    pub async fn run_cycle(
        &self,
        quotes: &HashMap<String, SymbolQuote>,
        candidates: &[Candidate],
        now: DateTime<Utc>,
    ) -> LedgerResult<CycleReport> {
        let mut guard = self.ledger.lock().await?;
        guard
            .mark_prices(
                self.config.broker,
                quotes.iter().map(|(s, q)| (s.as_str(), q.price)),
            )
            .await?;

        let state = guard.state();
        let positions: Vec<Position> = state.positions.values().cloned().collect();
        let decision = evaluate_detailed(
            &self.config,
            &positions,
            quotes,
            &state.funds,
            candidates,
            now,
        );

        let mut report = CycleReport {
            skipped: decision.skipped,
            ..Default::default()
        };
        let timestamp = now.timestamp_millis();
        for action in decision.actions {
            let fee = self.config.fees.fee_for(action.notional());
            match guard.commit(&action, fee, timestamp).await {
                Ok(transaction) => report.committed.push(transaction),
                Err(e) => {
                    warn!(symbol = %action.symbol, side = %action.side, error = %e, "Action rejected");
                    report.rejected.push((action, e.to_string()));
                }
            }
        }

        info!(
            committed = report.committed.len(),
            rejected = report.rejected.len(),
            skipped = report.skipped.len(),
            "Auto-trade cycle complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerState, LedgerStore, MemoryLedgerStore};
    use chrono::{FixedOffset, TimeZone};
    use std::sync::Arc;

    /// Wednesday 2024-06-12, IST wall clock
    fn ist(hour: u32, minute: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 12, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn signals(score: f64, atr: f64, active: &[&str]) -> SignalSnapshot {
        SignalSnapshot {
            score,
            atr,
            active_signals: active.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn strong(score: f64) -> SignalSnapshot {
        signals(score, 5.0, &[tags::TREND_STACK, tags::VOLUME_PULSE])
    }

    fn quotes(entries: &[(&str, Decimal, SignalSnapshot)]) -> HashMap<String, SymbolQuote> {
        entries
            .iter()
            .map(|(s, price, sig)| {
                (
                    s.to_string(),
                    SymbolQuote {
                        price: *price,
                        signals: sig.clone(),
                    },
                )
            })
            .collect()
    }

    fn position(symbol: &str, qty: Decimal, avg: Decimal, timeframe: Timeframe) -> Position {
        Position::open(symbol, AssetClass::Equity, Broker::Paper, timeframe, qty, avg)
    }

    fn equity(cash: Decimal) -> FundsLedger {
        FundsLedger {
            equity: cash,
            ..Default::default()
        }
    }

    #[test]
    fn test_volatility_stop_scenario() {
        let config = AutoTradeConfig::default();
        let held = [position("INFY", dec!(10), dec!(100), Timeframe::Swing)];
        let q = quotes(&[("INFY", dec!(96.9), signals(60.0, 2.0, &[]))]);

        let actions = evaluate(&config, &held, &q, &equity(Decimal::ZERO), &[], ist(11, 0));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].side, TradeSide::Sell);
        assert_eq!(actions[0].quantity, dec!(10));
        assert_eq!(actions[0].reason, "volatility stop");

        // 97.1 is above the 97 stop
        let q = quotes(&[("INFY", dec!(97.1), signals(60.0, 2.0, &[]))]);
        assert!(evaluate(&config, &held, &q, &equity(Decimal::ZERO), &[], ist(11, 0)).is_empty());
    }

    #[test]
    fn test_stop_takes_precedence_over_take_profit() {
        let config = AutoTradeConfig::default();
        let mut pos = position("INFY", dec!(10), dec!(100), Timeframe::Swing);
        // Ran to 125, now back at 115: +15% (take profit) but below 125 - 5 × 1.0
        pos.mark(dec!(125));
        let q = quotes(&[("INFY", dec!(115), signals(60.0, 5.0, &[]))]);

        let actions = evaluate(&config, &[pos], &q, &equity(Decimal::ZERO), &[], ist(11, 0));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].reason, "volatility stop");
    }

    #[test]
    fn test_momentum_decay_and_take_profit() {
        let config = AutoTradeConfig::default();
        let held = [
            position("AAA", dec!(1), dec!(100), Timeframe::Swing),
            position("BBB", dec!(1), dec!(100), Timeframe::Swing),
        ];
        let q = quotes(&[
            ("AAA", dec!(99), signals(20.0, 2.0, &[])),
            ("BBB", dec!(110), signals(50.0, 2.0, &[])),
        ]);
        let actions = evaluate(&config, &held, &q, &equity(Decimal::ZERO), &[], ist(11, 0));
        let reasons: Vec<&str> = actions.iter().map(|a| a.reason.as_str()).collect();
        assert_eq!(reasons, vec!["momentum decay", "take profit"]);
    }

    #[test]
    fn test_profit_lock_exit() {
        let held = [position("INFY", dec!(10), dec!(100), Timeframe::Swing)];
        // +6%, trailing stop at 106 - 2 = 104 is not hit
        let fading = quotes(&[("INFY", dec!(106), signals(40.0, 2.0, &[]))]);
        let firm = quotes(&[("INFY", dec!(106), signals(60.0, 2.0, &[]))]);

        let config = AutoTradeConfig::default();
        assert!(evaluate(&config, &held, &fading, &equity(Decimal::ZERO), &[], ist(11, 0)).is_empty());

        let config = AutoTradeConfig {
            profit_lock: Some(ProfitLock::default()),
            ..Default::default()
        };
        let actions = evaluate(&config, &held, &fading, &equity(Decimal::ZERO), &[], ist(11, 0));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].reason, "momentum fade, profit locked");
        assert!(evaluate(&config, &held, &firm, &equity(Decimal::ZERO), &[], ist(11, 0)).is_empty());

        // +4% is under the 5% lock threshold
        let small = quotes(&[("INFY", dec!(104), signals(40.0, 2.0, &[]))]);
        assert!(evaluate(&config, &held, &small, &equity(Decimal::ZERO), &[], ist(11, 0)).is_empty());
    }

    #[test]
    fn test_atr_target_exits() {
        let rules = ExitRules {
            atr_target: Some(AtrTarget::default()),
            ..Default::default()
        };
        let sig = signals(60.0, 2.0, &[]);

        // Target is 100 + 2 × 3 = 106, well below the 10% take profit
        assert_eq!(rules.check(dec!(100), dec!(106.5), dec!(106.5), &sig), Some(ExitReason::TakeProfit));
        assert_eq!(rules.check(dec!(100), dec!(105), dec!(105), &sig), None);
        assert_eq!(ExitRules::default().check(dec!(100), dec!(100), dec!(106.5), &sig), None);

        // Cost-anchored stop: 1.5 × ATR, tightened by 0.7 above +3%, no trailing
        assert_eq!(rules.stop_price(dec!(100), dec!(100), dec!(102), 2.0), dec!(97));
        assert_eq!(rules.stop_price(dec!(100), dec!(120), dec!(104), 2.0), dec!(97.9));
        assert_eq!(rules.check(dec!(100), dec!(100), dec!(96.9), &sig), Some(ExitReason::VolatilityStop));
    }

    #[test]
    fn test_sizing_ignores_other_broker_book() {
        // A DHAN equity holding must not inflate the PAPER allocation
        let other = Position::open(
            "INFY",
            AssetClass::Equity,
            Broker::Dhan,
            Timeframe::Swing,
            dec!(100),
            dec!(900),
        );
        let q = quotes(&[("TCS", dec!(500), strong(80.0))]);
        let candidates = [Candidate::new("TCS", AssetClass::Equity)];

        let config = AutoTradeConfig::default();
        let actions = evaluate(&config, &[other], &q, &equity(dec!(100000)), &candidates, ist(11, 0));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].quantity, dec!(10));
    }

    #[test]
    fn test_session_close_only_for_intraday() {
        let config = AutoTradeConfig::default();
        let held = [
            position("AAA", dec!(1), dec!(100), Timeframe::Intraday),
            position("BBB", dec!(1), dec!(100), Timeframe::Swing),
        ];
        let q = quotes(&[
            ("AAA", dec!(101), signals(60.0, 2.0, &[])),
            ("BBB", dec!(101), signals(60.0, 2.0, &[])),
        ]);

        assert!(evaluate(&config, &held, &q, &equity(Decimal::ZERO), &[], ist(15, 19)).is_empty());
        let actions = evaluate(&config, &held, &q, &equity(Decimal::ZERO), &[], ist(15, 20));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].symbol, "AAA");
        assert_eq!(actions[0].reason, "session close");
    }

    #[test]
    fn test_closed_market_does_nothing() {
        let config = AutoTradeConfig::default();
        let held = [position("INFY", dec!(10), dec!(100), Timeframe::Swing)];
        let q = quotes(&[("INFY", dec!(50), strong(90.0))]);
        let candidates = [Candidate::new("INFY", AssetClass::Equity)];
        assert!(evaluate(&config, &held, &q, &equity(dec!(100000)), &candidates, ist(8, 0)).is_empty());
    }

    #[test]
    fn test_percentage_sizing_scenario() {
        let config = AutoTradeConfig::default();
        let q = quotes(&[("TCS", dec!(500), strong(80.0))]);
        let candidates = [Candidate::new("TCS", AssetClass::Equity)];

        let actions = evaluate(&config, &[], &q, &equity(dec!(100000)), &candidates, ist(11, 0));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].side, TradeSide::Buy);
        assert_eq!(actions[0].quantity, dec!(10));
        assert!(actions[0].reason.starts_with("Smart Entry: Trend Stack"));
    }

    #[test]
    fn test_crypto_quantity_uses_lot_step() {
        let config = AutoTradeConfig {
            allocation_mode: AllocationMode::Fixed,
            allocation_value: dec!(1000),
            fees: FeeSchedule::zero(),
            session: MarketSession::continuous(),
            ..Default::default()
        };
        let q = quotes(&[("BTC", dec!(60000), strong(80.0))]);
        let funds = FundsLedger {
            crypto: dec!(5000),
            ..Default::default()
        };
        let candidates = [Candidate::new("BTC", AssetClass::Crypto)];
        let actions = evaluate(&config, &[], &q, &funds, &candidates, ist(23, 0));
        assert_eq!(actions[0].quantity, dec!(0.0166));
    }

    #[test]
    fn test_no_reentry_when_held_unless_accumulating() {
        let held = [position("TCS", dec!(2), dec!(500), Timeframe::Intraday)];
        let q = quotes(&[("TCS", dec!(500), strong(90.0))]);
        let candidates = [Candidate::new("TCS", AssetClass::Equity)];

        let config = AutoTradeConfig::default();
        let decision =
            evaluate_detailed(&config, &held, &q, &equity(dec!(99000)), &candidates, ist(11, 0));
        assert!(decision.actions.is_empty());
        assert_eq!(decision.skipped[0].reason, "already held");

        // Target 5% of (99000 + 1000) = 5000; half slice = 2500 → 5 units
        let config = AutoTradeConfig {
            accumulation: AccumulationPolicy::Accumulate,
            slice_fraction: dec!(0.5),
            ..Default::default()
        };
        let actions = evaluate(&config, &held, &q, &equity(dec!(99000)), &candidates, ist(11, 0));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].quantity, dec!(5));
    }

    #[test]
    fn test_max_open_positions() {
        let config = AutoTradeConfig {
            max_open_positions: 2,
            ..Default::default()
        };
        let held = [
            position("AAA", dec!(1), dec!(100), Timeframe::Swing),
            position("BBB", dec!(1), dec!(100), Timeframe::Swing),
        ];
        let q = quotes(&[
            ("AAA", dec!(101), signals(60.0, 2.0, &[])),
            ("BBB", dec!(101), signals(60.0, 2.0, &[])),
            ("CCC", dec!(100), strong(90.0)),
        ]);
        let candidates = [Candidate::new("CCC", AssetClass::Equity)];
        assert!(evaluate(&config, &held, &q, &equity(dec!(100000)), &candidates, ist(11, 0)).is_empty());

        // An exit frees a slot in the same cycle
        let q = quotes(&[
            ("AAA", dec!(120), signals(60.0, 2.0, &[])),
            ("BBB", dec!(101), signals(60.0, 2.0, &[])),
            ("CCC", dec!(100), strong(90.0)),
        ]);
        let actions = evaluate(&config, &held, &q, &equity(dec!(100000)), &candidates, ist(11, 0));
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].side, TradeSide::Sell);
        assert_eq!(actions[1].symbol, "CCC");
    }

    #[test]
    fn test_one_entry_ranked_by_score_then_symbol() {
        let config = AutoTradeConfig::default();
        let q = quotes(&[
            ("ZEE", dec!(100), strong(90.0)),
            ("ABB", dec!(100), strong(90.0)),
            ("MAX", dec!(100), strong(95.0)),
            ("LOW", dec!(100), strong(60.0)),
            ("TAG", dec!(100), signals(99.0, 2.0, &[tags::TREND_STACK])),
        ]);
        let candidates: Vec<Candidate> = ["ZEE", "ABB", "LOW", "TAG", "NONE"]
            .iter()
            .map(|s| Candidate::new(*s, AssetClass::Equity))
            .collect();

        let decision =
            evaluate_detailed(&config, &[], &q, &equity(dec!(100000)), &candidates, ist(11, 0));
        assert_eq!(decision.actions.len(), 1);
        assert_eq!(decision.actions[0].symbol, "ABB");
        let reasons: HashMap<&str, &str> = decision
            .skipped
            .iter()
            .map(|s| (s.symbol.as_str(), s.reason.as_str()))
            .collect();
        assert_eq!(reasons["LOW"], "score 60 below 75");
        assert_eq!(reasons["TAG"], "missing Volume Pulse");
        assert_eq!(reasons["NONE"], "no market data");
    }

    #[test]
    fn test_entry_deadline_and_bucket_mismatch() {
        let config = AutoTradeConfig::default();
        let q = quotes(&[("TCS", dec!(500), strong(90.0))]);
        let candidates = [Candidate::new("TCS", AssetClass::Equity)];
        assert!(evaluate(&config, &[], &q, &equity(dec!(100000)), &candidates, ist(15, 0)).is_empty());

        let config = AutoTradeConfig {
            broker: Broker::Binance,
            ..Default::default()
        };
        let decision =
            evaluate_detailed(&config, &[], &q, &equity(dec!(100000)), &candidates, ist(11, 0));
        assert!(decision.actions.is_empty());
        assert_eq!(decision.skipped[0].reason, "funds bucket mismatch");
    }

    #[test]
    fn test_insufficient_funds_skips_silently() {
        let config = AutoTradeConfig {
            allocation_mode: AllocationMode::Fixed,
            allocation_value: dec!(5000),
            ..Default::default()
        };
        let q = quotes(&[("TCS", dec!(500), strong(90.0))]);
        let candidates = [Candidate::new("TCS", AssetClass::Equity)];
        let decision =
            evaluate_detailed(&config, &[], &q, &equity(dec!(5010)), &candidates, ist(11, 0));
        assert!(decision.actions.is_empty());
        assert_eq!(decision.skipped[0].reason, "insufficient funds");
    }

    #[tokio::test]
    async fn test_auto_trader_commits_cycle() {
        let store = Arc::new(MemoryLedgerStore::new(LedgerState::new(equity(dec!(100000)))));
        let trader = AutoTrader::new(
            AutoTradeConfig::default(),
            LedgerHandle::new(store.clone()),
        );
        let q = quotes(&[("TCS", dec!(500), strong(80.0))]);
        let candidates = [Candidate::new("TCS", AssetClass::Equity)];

        let report = trader.run_cycle(&q, &candidates, ist(11, 0)).await.unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].fee, dec!(20));

        let state = store.load().await.unwrap();
        assert_eq!(state.funds.equity, dec!(94980));
        let pos = state.position(Broker::Paper, AssetClass::Equity, "TCS").unwrap();
        assert_eq!(pos.quantity, dec!(10));

        // Second cycle: price hits the target, position is closed
        let q = quotes(&[("TCS", dec!(550), strong(80.0))]);
        let report = trader.run_cycle(&q, &candidates, ist(11, 5)).await.unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].reason, "take profit");
        let state = store.load().await.unwrap();
        assert!(state.positions.is_empty());
        assert_eq!(state.funds.equity, dec!(100460));
        assert_eq!(store.transactions(10).await.unwrap().len(), 2);
    }
}

//! Core data model shared by the scoring, decision, execution and backtest engines

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Quantity below which a position is considered closed (absorbs rounding error)
pub const QUANTITY_EPSILON: Decimal = dec!(0.0001);

/// A single OHLCV bar. Bars are always handed to the engines in ascending time order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, epoch milliseconds
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Funds bucket an instrument trades against
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetClass {
    Equity,
    Commodities,
    Forex,
    Crypto,
}

impl AssetClass {
    pub fn all() -> &'static [AssetClass] {
        &[
            AssetClass::Equity,
            AssetClass::Commodities,
            AssetClass::Forex,
            AssetClass::Crypto,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Equity => "EQUITY",
            AssetClass::Commodities => "COMMODITIES",
            AssetClass::Forex => "FOREX",
            AssetClass::Crypto => "CRYPTO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "EQUITY" | "STOCK" => Some(AssetClass::Equity),
            "COMMODITIES" | "MCX" => Some(AssetClass::Commodities),
            "FOREX" => Some(AssetClass::Forex),
            "CRYPTO" => Some(AssetClass::Crypto),
            _ => None,
        }
    }

    /// Smallest tradable quantity increment
    pub fn lot_step(&self) -> Decimal {
        match self {
            AssetClass::Crypto => dec!(0.0001),
            _ => Decimal::ONE,
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Venue a position is held with. `Paper` is the built-in simulated account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Broker {
    Paper,
    Dhan,
    Shoonya,
    Binance,
    Coindcx,
    Coinswitch,
}

impl Broker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Broker::Paper => "PAPER",
            Broker::Dhan => "DHAN",
            Broker::Shoonya => "SHOONYA",
            Broker::Binance => "BINANCE",
            Broker::Coindcx => "COINDCX",
            Broker::Coinswitch => "COINSWITCH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PAPER" => Some(Broker::Paper),
            "DHAN" => Some(Broker::Dhan),
            "SHOONYA" => Some(Broker::Shoonya),
            "BINANCE" => Some(Broker::Binance),
            "COINDCX" => Some(Broker::Coindcx),
            "COINSWITCH" => Some(Broker::Coinswitch),
            _ => None,
        }
    }

    /// Whether this venue trades instruments of `class`
    pub fn supports(&self, class: AssetClass) -> bool {
        match self {
            Broker::Paper => true,
            Broker::Dhan | Broker::Shoonya => class != AssetClass::Crypto,
            Broker::Binance | Broker::Coindcx | Broker::Coinswitch => class == AssetClass::Crypto,
        }
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Holding horizon a position was entered with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Timeframe {
    #[default]
    Intraday,
    Btst,
    Swing,
    Weekly,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Intraday => "INTRADAY",
            Timeframe::Btst => "BTST",
            Timeframe::Swing => "SWING",
            Timeframe::Weekly => "WEEKLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INTRADAY" => Some(Timeframe::Intraday),
            "BTST" => Some(Timeframe::Btst),
            "SWING" => Some(Timeframe::Swing),
            "WEEKLY" => Some(Timeframe::Weekly),
            _ => None,
        }
    }
}

/// Side of an order or trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// An open holding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    /// Always `avg_cost * quantity`
    pub total_cost: Decimal,
    pub broker: Broker,
    pub timeframe: Timeframe,
    /// Highest price seen since entry; anchors the trailing stop
    pub high_water: Decimal,
}

impl Position {
    pub fn open(
        symbol: impl Into<String>,
        asset_class: AssetClass,
        broker: Broker,
        timeframe: Timeframe,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            asset_class,
            quantity,
            avg_cost: price,
            total_cost: price * quantity,
            broker,
            timeframe,
            high_water: price,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey {
            broker: self.broker,
            asset_class: self.asset_class,
            symbol: self.symbol.clone(),
        }
    }

    /// Unrealized P&L in percent of average cost at `price`
    pub fn pnl_percent(&self, price: Decimal) -> Decimal {
        if self.avg_cost <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (price - self.avg_cost) / self.avg_cost * dec!(100)
    }

    /// Weighted-average cost update for an additional fill
    pub(crate) fn add(&mut self, quantity: Decimal, price: Decimal) {
        let new_quantity = self.quantity + quantity;
        let new_total = self.total_cost + price * quantity;
        self.avg_cost = new_total / new_quantity;
        self.quantity = new_quantity;
        self.total_cost = self.avg_cost * self.quantity;
        self.high_water = self.high_water.max(price);
    }

    /// Raise the high-water mark to `price` if higher
    pub fn mark(&mut self, price: Decimal) {
        self.high_water = self.high_water.max(price);
    }

    /// Reduce by a sold quantity; returns true when the position is now closed
    pub(crate) fn reduce(&mut self, quantity: Decimal) -> bool {
        if self.quantity <= quantity + QUANTITY_EPSILON {
            self.quantity = Decimal::ZERO;
            self.total_cost = Decimal::ZERO;
            return true;
        }
        self.quantity -= quantity;
        self.total_cost = self.avg_cost * self.quantity;
        false
    }
}

/// Uniqueness key of a position: one per (broker, asset class, symbol)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub broker: Broker,
    pub asset_class: AssetClass,
    pub symbol: String,
}

/// A proposed order, not yet committed to any ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAction {
    pub side: TradeSide,
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub reason: String,
    pub asset_class: AssetClass,
    pub broker: Broker,
    pub timeframe: Timeframe,
}

impl TradeAction {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Outcome of a simulated order execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub filled_quantity: Decimal,
    pub slice_count: u32,
    pub order_id: Option<String>,
    pub message: String,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            filled_quantity: Decimal::ZERO,
            slice_count: 0,
            order_id: None,
            message: message.into(),
            elapsed_ms: 0,
        }
    }
}

/// A committed action as recorded in the transaction history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub side: TradeSide,
    pub symbol: String,
    pub asset_class: AssetClass,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub broker: Broker,
    pub timeframe: Timeframe,
    pub timestamp: i64,
    pub reason: String,
}

/// A single round-trip trade produced by the backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub symbol: String,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: String,
}

/// A point on the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub value: Decimal,
}

/// A symbol the backtest could not replay, and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: String,
}

/// Result of a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_pnl: Decimal,
    /// Percent of closed trades with positive P&L
    pub win_rate: Decimal,
    pub total_trades: u32,
    pub max_drawdown_pct: Decimal,
    /// Most recent exit first
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<EquityPoint>,
    pub skipped: Vec<SkippedSymbol>,
    /// Set when the run was cancelled before every symbol was replayed
    pub incomplete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average_cost() {
        let mut pos = Position::open(
            "INFY",
            AssetClass::Equity,
            Broker::Paper,
            Timeframe::Intraday,
            dec!(10),
            dec!(100),
        );
        pos.add(dec!(10), dec!(110));
        assert_eq!(pos.quantity, dec!(20));
        assert_eq!(pos.avg_cost, dec!(105));
        assert_eq!(pos.total_cost, pos.avg_cost * pos.quantity);
        assert_eq!(pos.high_water, dec!(110));
        pos.mark(dec!(104));
        assert_eq!(pos.high_water, dec!(110));
        assert_eq!(pos.pnl_percent(dec!(115.5)), dec!(10));
        assert_eq!(pos.pnl_percent(dec!(94.5)), dec!(-10));
    }

    #[test]
    fn test_reduce_closes_within_epsilon() {
        let mut pos = Position::open(
            "BTC",
            AssetClass::Crypto,
            Broker::Binance,
            Timeframe::Swing,
            dec!(0.30005),
            dec!(60000),
        );
        assert!(!pos.reduce(dec!(0.1)));
        assert_eq!(pos.total_cost, pos.avg_cost * pos.quantity);
        assert!(pos.reduce(dec!(0.2)));
        assert_eq!(pos.quantity, Decimal::ZERO);
    }

    #[test]
    fn test_enum_round_trip_names() {
        for class in AssetClass::all() {
            assert_eq!(AssetClass::parse(class.as_str()), Some(*class));
        }
        assert_eq!(AssetClass::parse("mcx"), Some(AssetClass::Commodities));
        assert_eq!(Broker::parse("paper"), Some(Broker::Paper));
        assert_eq!(Timeframe::parse("btst"), Some(Timeframe::Btst));
    }

    #[test]
    fn test_broker_supports() {
        assert!(Broker::Paper.supports(AssetClass::Crypto));
        assert!(Broker::Dhan.supports(AssetClass::Commodities));
        assert!(!Broker::Dhan.supports(AssetClass::Crypto));
        assert!(!Broker::Binance.supports(AssetClass::Equity));
    }
}

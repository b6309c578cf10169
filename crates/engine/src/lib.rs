//! TradePilot Engine: signal scoring, auto-trade decisions and backtesting
//!
//! Provides:
//! - Indicator math and the composite opportunity score
//! - Auto-trade cycle evaluation against a persistent ledger
//! - Sliced order execution with simulated latency
//! - Bar-by-bar historical replay of the trading rules
//! - Cached, rate-bounded market data with a synthetic fallback

pub mod api;
pub mod auto_trade;
pub mod backtest;
pub mod execution;
pub mod fees;
pub mod indicators;
pub mod ledger;
pub mod market_data;
pub mod rules;
pub mod scan;
pub mod session;
pub mod signals;
pub mod synthetic;
pub mod types;

// Re-exports for convenience
pub use api::YahooClient;
pub use auto_trade::{
    evaluate, evaluate_detailed, AllocationMode, AtrTarget, AutoTradeConfig, AutoTrader,
    Candidate, CycleDecision, CycleReport, ExitReason, ExitRules, ProfitLock, SymbolQuote,
};
pub use backtest::{BacktestProgress, BacktestRequest, BacktestRules, BacktestStatus, SymbolUpdate};
pub use execution::{BrokerCredentials, ExecutionConfig, OrderExecutor, SliceTable};
pub use fees::FeeSchedule;
pub use ledger::{
    FundsLedger, LedgerError, LedgerHandle, LedgerState, LedgerStore, MemoryLedgerStore,
    SqliteLedgerStore,
};
pub use market_data::{BarSource, CacheConfig, CachedBarSource, DataError, FallbackBarSource};
pub use rules::{RuleSet, StrategyVersion};
pub use scan::{run_scan, ScanCandidate, ScanReport, ScanRequest};
pub use session::MarketSession;
pub use signals::{classify, compute, compute_with, SignalSnapshot, SignalStrength};
pub use synthetic::SyntheticBarSource;
pub use types::*;

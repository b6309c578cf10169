//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts/quantities stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Open positions, one row per (broker, asset class, symbol)
CREATE TABLE IF NOT EXISTS positions (
    broker TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    symbol TEXT NOT NULL,
    quantity TEXT NOT NULL,
    avg_cost TEXT NOT NULL,
    total_cost TEXT NOT NULL,
    timeframe TEXT NOT NULL DEFAULT 'INTRADAY',
    updated_at INTEGER DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (broker, asset_class, symbol)
);

-- Cash per asset-class bucket
CREATE TABLE IF NOT EXISTS fund_buckets (
    asset_class TEXT PRIMARY KEY,
    cash TEXT NOT NULL DEFAULT '0',
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Committed trade history (append-only)
CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    side TEXT NOT NULL,
    symbol TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    quantity TEXT NOT NULL,
    price TEXT NOT NULL,
    fee TEXT NOT NULL DEFAULT '0',
    broker TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    reason TEXT NOT NULL DEFAULT ''
);

-- Stored backtest runs
CREATE TABLE IF NOT EXISTS backtest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL,
    symbols TEXT NOT NULL,
    bar_interval TEXT NOT NULL,
    bar_range TEXT NOT NULL,
    initial_capital TEXT NOT NULL,
    final_capital TEXT NOT NULL,
    total_pnl TEXT NOT NULL DEFAULT '0',
    win_rate TEXT NOT NULL DEFAULT '0',
    total_trades INTEGER NOT NULL DEFAULT 0,
    max_drawdown_pct TEXT NOT NULL DEFAULT '0',
    incomplete INTEGER NOT NULL DEFAULT 0,
    result_json TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_transactions_time ON transactions(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_transactions_symbol ON transactions(symbol);
CREATE INDEX IF NOT EXISTS idx_backtest_hash ON backtest_runs(params_hash);
CREATE INDEX IF NOT EXISTS idx_backtest_created ON backtest_runs(created_at DESC)
"#;

/// Column additions applied after CREATE_TABLES (duplicate columns are tolerated)
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE positions ADD COLUMN high_water TEXT NOT NULL DEFAULT '0'",
    "ALTER TABLE backtest_runs ADD COLUMN strategy_version TEXT NOT NULL DEFAULT 'canonical'",
    "ALTER TABLE backtest_runs ADD COLUMN skipped_count INTEGER NOT NULL DEFAULT 0",
];

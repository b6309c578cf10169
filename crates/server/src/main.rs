//! TradePilot: technical scanner, paper auto-trader and backtester
//!
//! Usage:
//!   tradepilot serve --port 3002                  # Launch the JSON API
//!   tradepilot scan --symbols RELIANCE,TCS        # Score a universe
//!   tradepilot backtest --symbols RELIANCE,TCS    # Replay the rules over history
//!   tradepilot cycle --symbols RELIANCE,TCS       # Run one auto-trade cycle
//!   tradepilot order buy INFY 10 1500             # Execute a sliced paper order
//!   tradepilot fund equity 100000                 # Deposit into a funds bucket
//!   tradepilot ledger                             # Show positions, funds, history

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::backtest::{self, run_record};
use engine::{
    run_scan, AssetClass, AutoTrader, BacktestProgress, BacktestRequest, BacktestRules,
    BacktestStatus, BarSource, Broker, BrokerCredentials, CacheConfig, CachedBarSource,
    ExecutionConfig, FallbackBarSource, LedgerHandle, LedgerState, OrderExecutor, ScanReport,
    ScanRequest, SqliteLedgerStore, StrategyVersion, SyntheticBarSource, Timeframe, TradeAction,
    TradeSide, YahooClient,
};
use persistence::repository::BacktestRepository;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "tradepilot")]
#[command(about = "Technical scanner, paper auto-trader and backtester", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON rules file (`scoring` and `trading` sections)
    #[arg(long, global = true)]
    rules: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the JSON API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3002)]
        port: u16,
    },
    /// Score a symbol universe and print the ranking
    Scan {
        /// Symbols to scan (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        #[arg(long, default_value = "15m")]
        interval: String,
        #[arg(long, default_value = "2d")]
        range: String,
        /// Minimum score to rank
        #[arg(long, default_value_t = 70.0)]
        min_score: f64,
        /// Rank every scored symbol
        #[arg(long)]
        all: bool,
        /// Substitute synthetic bars when the live source fails
        #[arg(long)]
        synthetic_fallback: bool,
    },
    /// Replay the trading rules over historical bars
    Backtest {
        /// Symbols to replay (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        #[arg(long, default_value = "5m")]
        interval: String,
        #[arg(long, default_value = "5d")]
        range: String,
        /// Starting capital, split evenly across symbols
        #[arg(long, default_value = "100000")]
        capital: Decimal,
        /// Scoring formula: canonical, vwap_anchor
        #[arg(long)]
        version: Option<String>,
        /// Re-run even when an identical run is stored
        #[arg(long)]
        fresh: bool,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
    /// Run one auto-trade cycle against the stored ledger
    Cycle {
        /// Candidate symbols (comma-separated); held symbols are always quoted
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(long, default_value = "15m")]
        interval: String,
        #[arg(long, default_value = "2d")]
        range: String,
    },
    /// Execute one order through the slicing simulator
    Order {
        /// buy or sell
        side: String,
        symbol: String,
        quantity: Decimal,
        price: Decimal,
        #[arg(long, default_value = "EQUITY")]
        asset_class: String,
        #[arg(long, default_value = "PAPER")]
        broker: String,
        #[arg(long, default_value = "INTRADAY")]
        timeframe: String,
        /// Seed for the simulated latency
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Deposit into (or withdraw from, if negative) a funds bucket
    Fund {
        asset_class: String,
        #[arg(allow_hyphen_values = true)]
        amount: Decimal,
    },
    /// Show positions, fund buckets and recent transactions
    Ledger {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone)]
struct AppState {
    source: Arc<dyn BarSource>,
    db: Arc<persistence::Database>,
    ledger: LedgerHandle,
    executor: Arc<OrderExecutor>,
    rules: Arc<BacktestRules>,
    backtest_progress: Arc<BacktestProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,tradepilot=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,tradepilot=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let rules: BacktestRules = load_json(cli.rules.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port, rules).await?;
        }
        Commands::Scan {
            symbols,
            interval,
            range,
            min_score,
            all,
            synthetic_fallback,
        } => {
            let request = ScanRequest {
                symbols,
                interval,
                range,
                min_score,
                include_all: all,
                ..Default::default()
            };
            cmd_scan(request, rules, synthetic_fallback).await?;
        }
        Commands::Backtest {
            symbols,
            interval,
            range,
            capital,
            version,
            fresh,
            export,
        } => {
            let mut rules = rules;
            if let Some(version) = version {
                rules.scoring.version = StrategyVersion::parse(&version)
                    .with_context(|| format!("Unknown strategy version: {version}"))?;
            }
            let request = BacktestRequest {
                symbols,
                interval,
                range,
                initial_capital: capital,
                ..Default::default()
            };
            cmd_backtest(request, rules, fresh, export).await?;
        }
        Commands::Cycle {
            symbols,
            interval,
            range,
        } => {
            cmd_cycle(symbols, interval, range, rules).await?;
        }
        Commands::Order {
            side,
            symbol,
            quantity,
            price,
            asset_class,
            broker,
            timeframe,
            seed,
        } => {
            let action = TradeAction {
                side: parse_side(&side)?,
                symbol: symbol.to_uppercase(),
                quantity,
                price,
                reason: "Manual order".to_string(),
                asset_class: AssetClass::parse(&asset_class)
                    .with_context(|| format!("Unknown asset class: {asset_class}"))?,
                broker: Broker::parse(&broker)
                    .with_context(|| format!("Unknown broker: {broker}"))?,
                timeframe: Timeframe::parse(&timeframe)
                    .with_context(|| format!("Unknown timeframe: {timeframe}"))?,
            };
            cmd_order(action, seed, rules).await?;
        }
        Commands::Fund {
            asset_class,
            amount,
        } => {
            let class = AssetClass::parse(&asset_class)
                .with_context(|| format!("Unknown asset class: {asset_class}"))?;
            cmd_fund(class, amount).await?;
        }
        Commands::Ledger { limit } => {
            cmd_ledger(limit).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Shared setup
// ============================================================================

/// Parse a JSON file into `T`, or `T::default()` without a path
fn load_json<T: DeserializeOwned + Default>(path: Option<&str>) -> anyhow::Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    let value = serde_json::from_str(&text).with_context(|| format!("Parsing {path}"))?;
    info!(path, "Rules loaded");
    Ok(value)
}

fn parse_side(side: &str) -> anyhow::Result<TradeSide> {
    match side.to_lowercase().as_str() {
        "buy" => Ok(TradeSide::Buy),
        "sell" => Ok(TradeSide::Sell),
        other => anyhow::bail!("Unknown side: {other} (expected buy or sell)"),
    }
}

async fn open_db() -> anyhow::Result<(persistence::Database, String)> {
    let db_path =
        std::env::var("TRADEPILOT_DB_PATH").unwrap_or_else(|_| "data/tradepilot.db".to_string());
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    Ok((db, db_path))
}

/// Cached Yahoo source, optionally backed by a synthetic series
fn bar_source(synthetic_fallback: bool) -> Arc<dyn BarSource> {
    let cached = CachedBarSource::new(YahooClient::new(), CacheConfig::default());
    if synthetic_fallback {
        let synthetic = SyntheticBarSource {
            end_time: Utc::now().timestamp_millis(),
            ..Default::default()
        };
        Arc::new(FallbackBarSource::new(cached, synthetic))
    } else {
        Arc::new(cached)
    }
}

fn ledger_handle(db: &persistence::Database) -> LedgerHandle {
    LedgerHandle::new(Arc::new(SqliteLedgerStore::new(db.pool_clone())))
}

// ============================================================================
// Serve command: Axum JSON API
// ============================================================================

async fn cmd_serve(host: &str, port: u16, rules: BacktestRules) -> anyhow::Result<()> {
    info!("TradePilot v{} starting...", APP_VERSION);

    let (db, db_path) = open_db().await?;
    info!("Database initialized: {}", db_path);

    let ledger = ledger_handle(&db);
    let executor = OrderExecutor::new(
        ExecutionConfig {
            fees: rules.trading.fees.clone(),
            ..Default::default()
        },
        BrokerCredentials::from_env(),
        ledger.clone(),
    );

    let state = AppState {
        source: bar_source(true),
        db: Arc::new(db),
        ledger,
        executor: Arc::new(executor),
        rules: Arc::new(rules),
        backtest_progress: Arc::new(BacktestProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/scan", post(api_scan))
        .route("/backtest", post(api_start_backtest))
        .route("/backtest/status", get(api_backtest_status))
        .route("/backtest/cancel", post(api_cancel_backtest))
        .route("/backtest/history", get(api_backtest_history))
        .route("/ledger", get(api_ledger))
        .route("/cycle", post(api_cycle))
        .route("/order", post(api_order))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== TradePilot v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/scan                - Score a symbol universe");
    println!("  POST /api/backtest            - Start a backtest");
    println!("  GET  /api/backtest/status     - Poll backtest progress");
    println!("  POST /api/backtest/cancel     - Cancel running backtest");
    println!("  GET  /api/backtest/history    - Stored backtest runs");
    println!("  GET  /api/ledger              - Positions, funds, transactions");
    println!("  POST /api/cycle               - Run one auto-trade cycle");
    println!("  POST /api/order               - Execute a sliced paper order");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// CLI commands
// ============================================================================

async fn cmd_scan(
    request: ScanRequest,
    rules: BacktestRules,
    synthetic_fallback: bool,
) -> anyhow::Result<()> {
    println!("\n=== TradePilot v{} ===", APP_VERSION);
    println!(
        "Scanning {} symbols ({} / {}) | Rules: {}",
        request.symbols.len(),
        request.interval,
        request.range,
        rules.scoring.version.as_str()
    );

    let source = bar_source(synthetic_fallback);
    let report = run_scan(source.as_ref(), &request, &rules.scoring).await;
    print_scan(&report);
    Ok(())
}

fn print_scan(report: &ScanReport) {
    println!("\nRanked ({}):", report.ranked.len());
    println!(
        "  {:>3}  {:<14} {:>10} {:>6} {:<11} {:>10} {:<6}  {}",
        "#", "Symbol", "Price", "Score", "Signal", "Target", "Risk", "Reason"
    );
    println!("  {}", "-".repeat(80));
    for (i, c) in report.ranked.iter().enumerate() {
        println!(
            "  {:>3}  {:<14} {:>10.2} {:>6.0} {:<11} {:>10.2} {:<6}  {}{}",
            i + 1,
            c.symbol,
            c.price,
            c.score,
            c.strength.label(),
            c.target_price,
            format!("{:?}", c.risk_level),
            c.reason,
            if c.is_top_pick { " *" } else { "" },
        );
    }
    if !report.failed.is_empty() {
        println!("\nFailed ({}):", report.failed.len());
        for f in &report.failed {
            println!("  {:<14} {}", f.symbol, f.reason);
        }
    }
}

async fn cmd_backtest(
    request: BacktestRequest,
    rules: BacktestRules,
    fresh: bool,
    export: Option<String>,
) -> anyhow::Result<()> {
    println!("\n=== TradePilot v{} ===", APP_VERSION);

    let (db, db_path) = open_db().await?;
    let repo = BacktestRepository::new(db.pool());
    let hash = request.params_hash(&rules);
    println!("Database: {}", db_path);
    println!(
        "Symbols: {} | {} / {} | Capital: {} | Rules: {}",
        request.symbols.join(", "),
        request.interval,
        request.range,
        request.initial_capital,
        rules.scoring.version.as_str()
    );

    let cached = if fresh {
        None
    } else {
        repo.get_by_hash(&hash).await?
    };

    let result = match cached {
        Some(record) => {
            println!("Identical run found (#{}), reusing it", record.id.unwrap_or_default());
            serde_json::from_str(&record.result_json).context("Stored result is malformed")?
        }
        None => {
            let source = bar_source(false);
            let progress = Arc::new(BacktestProgress::new());

            let progress_for_ctrlc = progress.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl+C received, requesting cancel...");
                progress_for_ctrlc.cancel();
            });

            println!("Press Ctrl+C to stop after the current symbol\n");
            let result = backtest::run(&request, &rules, source.as_ref(), &progress, |update| {
                println!(
                    "  [{:>3}%] {:<14} {}",
                    update.percent(),
                    update.symbol,
                    if update.skipped {
                        "skipped".to_string()
                    } else {
                        format!("{} trades", update.trades)
                    }
                );
            })
            .await;

            let record = run_record(&request, &rules, &result)?;
            let id = repo.save(&record).await?;
            info!(id, "Backtest stored");
            result
        }
    };

    print_backtest(&result);

    if let Some(export_path) = export {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&export_path, &json)?;
        println!("\nResult exported to {}", export_path);
    }

    Ok(())
}

fn print_backtest(result: &engine::BacktestResult) {
    println!(
        "\n{}P&L {:+.2} | Final {:.2} | Trades {} | Win rate {:.1}% | Max DD {:.2}%",
        if result.incomplete { "[INCOMPLETE] " } else { "" },
        result.total_pnl,
        result.final_capital,
        result.total_trades,
        result.win_rate,
        result.max_drawdown_pct
    );
    if !result.trades.is_empty() {
        println!(
            "\n  {:<14} {:>10} {:>10} {:>8} {:>12} {:>8}  {}",
            "Symbol", "Entry", "Exit", "Qty", "P&L", "P&L%", "Reason"
        );
        println!("  {}", "-".repeat(80));
        for t in result.trades.iter().take(20) {
            println!(
                "  {:<14} {:>10.2} {:>10.2} {:>8} {:>+12.2} {:>+7.2}%  {}",
                t.symbol, t.entry_price, t.exit_price, t.quantity, t.pnl, t.pnl_percent, t.exit_reason
            );
        }
    }
    for s in &result.skipped {
        println!("  skipped {:<14} {}", s.symbol, s.reason);
    }
}

/// Quote candidates plus every held symbol, then run one cycle
async fn run_cycle(
    source: &dyn BarSource,
    ledger: &LedgerHandle,
    rules: &BacktestRules,
    mut symbols: Vec<String>,
    interval: String,
    range: String,
) -> anyhow::Result<engine::CycleReport> {
    let snapshot = ledger.snapshot().await?;
    let held: Vec<String> = snapshot
        .positions_for(rules.trading.broker)
        .map(|p| p.symbol.clone())
        .collect();
    let candidate_count = symbols.len();
    symbols.extend(held);

    let request = ScanRequest {
        symbols,
        interval,
        range,
        include_all: true,
        ..Default::default()
    };
    let report = run_scan(source, &request, &rules.scoring).await;

    // Held symbols are quoted for exits but only requested symbols are candidates
    let wanted: Vec<&String> = request.symbols.iter().take(candidate_count).collect();
    let candidates: Vec<_> = report
        .ranked
        .iter()
        .filter(|c| wanted.contains(&&c.symbol))
        .map(|c| c.to_candidate())
        .collect();

    let trader = AutoTrader::new(rules.trading.clone(), ledger.clone());
    Ok(trader.run_cycle(&report.quotes, &candidates, Utc::now()).await?)
}

async fn cmd_cycle(
    symbols: Vec<String>,
    interval: String,
    range: String,
    rules: BacktestRules,
) -> anyhow::Result<()> {
    let (db, _) = open_db().await?;
    let ledger = ledger_handle(&db);
    let source = bar_source(false);

    let report = run_cycle(source.as_ref(), &ledger, &rules, symbols, interval, range).await?;

    println!("\nCommitted ({}):", report.committed.len());
    for tx in &report.committed {
        println!(
            "  {} {:<4} {:<14} {:>10} @ {:<10} fee {}  {}",
            tx.id, tx.side, tx.symbol, tx.quantity, tx.price, tx.fee, tx.reason
        );
    }
    for (action, reason) in &report.rejected {
        println!("  rejected {} {}: {}", action.side, action.symbol, reason);
    }
    if !report.skipped.is_empty() {
        println!("\nSkipped ({}):", report.skipped.len());
        for s in &report.skipped {
            println!("  {:<14} {}", s.symbol, s.reason);
        }
    }
    Ok(())
}

async fn cmd_order(action: TradeAction, seed: Option<u64>, rules: BacktestRules) -> anyhow::Result<()> {
    let (db, _) = open_db().await?;
    let executor = OrderExecutor::new(
        ExecutionConfig {
            fees: rules.trading.fees,
            seed,
            ..Default::default()
        },
        BrokerCredentials::from_env(),
        ledger_handle(&db),
    );

    let result = executor.execute(&action).await;
    if result.success {
        println!(
            "{} {}",
            result.order_id.as_deref().unwrap_or("-"),
            result.message
        );
    } else {
        println!("Rejected: {}", result.message);
    }
    Ok(())
}

async fn cmd_fund(class: AssetClass, amount: Decimal) -> anyhow::Result<()> {
    let (db, _) = open_db().await?;
    let ledger = ledger_handle(&db);
    let mut guard = ledger.lock().await?;
    let balance = guard.deposit(class, amount).await?;
    println!("{} bucket: {}", class, balance);
    Ok(())
}

async fn cmd_ledger(limit: usize) -> anyhow::Result<()> {
    let (db, _) = open_db().await?;
    let ledger = ledger_handle(&db);
    let state = ledger.snapshot().await?;

    println!("\nFunds:");
    for class in AssetClass::all() {
        println!(
            "  {:<12} {:>14}  (invested {})",
            class.as_str(),
            state.funds.get(*class),
            state.invested(*class)
        );
    }

    println!("\nPositions ({}):", state.positions.len());
    for p in state.positions.values() {
        println!(
            "  {:<7} {:<12} {:<14} {:>10} @ {:<10} peak {:<10} {}",
            p.broker, p.asset_class, p.symbol, p.quantity, p.avg_cost, p.high_water, p.timeframe.as_str()
        );
    }

    let transactions = ledger.transactions(limit).await?;
    println!("\nRecent transactions ({}):", transactions.len());
    for tx in &transactions {
        println!(
            "  {} {:<4} {:<14} {:>10} @ {:<10} {}",
            tx.id, tx.side, tx.symbol, tx.quantity, tx.price, tx.reason
        );
    }
    Ok(())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tradepilot",
        "version": APP_VERSION,
    }))
}

/// POST /api/scan: score a universe
async fn api_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Json<ScanReport> {
    Json(run_scan(state.source.as_ref(), &request, &state.rules.scoring).await)
}

#[derive(Deserialize)]
struct StartBacktestBody {
    #[serde(flatten)]
    request: BacktestRequest,
    version: Option<StrategyVersion>,
}

/// POST /api/backtest: start a backtest in the background
async fn api_start_backtest(
    State(state): State<AppState>,
    Json(body): Json<StartBacktestBody>,
) -> Json<serde_json::Value> {
    if body.request.symbols.is_empty() {
        return Json(serde_json::json!({
            "success": false,
            "message": "No symbols requested",
        }));
    }
    if !state.backtest_progress.try_claim() {
        let pct = state.backtest_progress.progress_pct();
        return Json(serde_json::json!({
            "success": false,
            "message": format!("Backtest already running ({:.0}% complete)", pct),
        }));
    }

    let mut rules = (*state.rules).clone();
    if let Some(version) = body.version {
        rules.scoring.version = version;
    }
    let request = body.request;
    info!(symbols = ?request.symbols, interval = %request.interval, range = %request.range,
        "Starting backtest");

    let progress = state.backtest_progress.clone();
    let source = state.source.clone();
    let db = state.db.clone();

    tokio::spawn(async move {
        let result = backtest::run(&request, &rules, source.as_ref(), &progress, |_| {}).await;
        let stored = match run_record(&request, &rules, &result) {
            Ok(record) => BacktestRepository::new(db.pool())
                .save(&record)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = stored {
            warn!(error = %e, "Failed to store backtest run");
            progress.fail(format!("Result not stored: {e}"));
        }
    });

    Json(serde_json::json!({
        "success": true,
        "message": "Backtest started",
    }))
}

/// GET /api/backtest/status: poll progress
async fn api_backtest_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    use std::sync::atomic::Ordering;

    let p = &state.backtest_progress;
    let status = p.status();
    let finished = matches!(status, BacktestStatus::Complete | BacktestStatus::Cancelled);
    let result = if finished { p.result() } else { None };
    Json(serde_json::json!({
        "status": status,
        "progress_pct": p.progress_pct(),
        "current_symbol": p.current_symbol.read().map(|s| s.clone()).unwrap_or_default(),
        "completed": p.completed.load(Ordering::Relaxed),
        "total": p.total_symbols.load(Ordering::Relaxed),
        "skipped": p.skipped.load(Ordering::Relaxed),
        "started_at": p.started_at.read().map(|s| s.clone()).unwrap_or_default(),
        "error": p.error_message.read().map(|e| e.clone()).unwrap_or_default(),
        "result": result,
    }))
}

/// POST /api/backtest/cancel: stop after the current symbol
async fn api_cancel_backtest(State(state): State<AppState>) -> Json<serde_json::Value> {
    if !state.backtest_progress.is_running() {
        return Json(serde_json::json!({
            "success": false,
            "message": "No backtest running",
        }));
    }
    state.backtest_progress.cancel();
    info!("Backtest cancellation requested");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancellation requested",
    }))
}

/// GET /api/backtest/history: stored runs, newest first
async fn api_backtest_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit: i64 = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(20);
    let runs = BacktestRepository::new(state.db.pool())
        .recent(limit)
        .await
        .map_err(|e| {
            error!("Failed to load backtest history: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

/// GET /api/ledger: positions, funds and recent transactions
async fn api_ledger(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit: usize = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(50);
    let internal = |e: engine::LedgerError| {
        error!("Ledger read failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let snapshot: LedgerState = state.ledger.snapshot().await.map_err(internal)?;
    let transactions = state.ledger.transactions(limit).await.map_err(internal)?;
    let positions: Vec<_> = snapshot.positions.values().collect();

    Ok(Json(serde_json::json!({
        "funds": snapshot.funds,
        "positions": positions,
        "transactions": transactions,
    })))
}

#[derive(Deserialize)]
struct CycleBody {
    #[serde(default)]
    symbols: Vec<String>,
    #[serde(default = "default_interval")]
    interval: String,
    #[serde(default = "default_range")]
    range: String,
}

fn default_interval() -> String {
    "15m".to_string()
}

fn default_range() -> String {
    "2d".to_string()
}

/// POST /api/cycle: run one auto-trade cycle
async fn api_cycle(
    State(state): State<AppState>,
    Json(body): Json<CycleBody>,
) -> Result<Json<engine::CycleReport>, StatusCode> {
    run_cycle(
        state.source.as_ref(),
        &state.ledger,
        &state.rules,
        body.symbols,
        body.interval,
        body.range,
    )
    .await
    .map(Json)
    .map_err(|e| {
        error!("Cycle failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// POST /api/order: execute one sliced order
async fn api_order(
    State(state): State<AppState>,
    Json(action): Json<TradeAction>,
) -> Json<engine::ExecutionResult> {
    Json(state.executor.execute(&action).await)
}

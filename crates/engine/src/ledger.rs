//! Trading ledger: positions, fund buckets and their transitions
//!
//! `LedgerState::apply` is the only way state changes. It validates an action
//! completely before producing the next state, so a rejected action never
//! leaves a half-applied ledger. Storage is behind the `LedgerStore` trait;
//! callers get a `LedgerHandle` that serializes writers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use persistence::repository::{
    FundBucketRecord, LedgerRepository, PositionRecord, TransactionRecord,
};
use persistence::{parse_decimal, DbError, SqlitePool};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::types::{
    AssetClass, Broker, Position, PositionKey, Timeframe, TradeAction, TradeSide, Transaction,
    QUANTITY_EPSILON,
};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient {asset_class} funds: need {required}, have {available}")]
    InsufficientFunds {
        asset_class: AssetClass,
        required: Decimal,
        available: Decimal,
    },

    #[error("No open position in {symbol}")]
    NoPosition { symbol: String },

    #[error("Insufficient quantity in {symbol}: hold {held}, requested {requested}")]
    InsufficientQuantity {
        symbol: String,
        held: Decimal,
        requested: Decimal,
    },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Ledger store error: {0}")]
    Store(String),
}

impl From<DbError> for LedgerError {
    fn from(e: DbError) -> Self {
        LedgerError::Store(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// ============================================================================
// Funds
// ============================================================================

/// Cash per asset-class bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundsLedger {
    pub equity: Decimal,
    pub commodities: Decimal,
    pub forex: Decimal,
    pub crypto: Decimal,
}

impl FundsLedger {
    pub fn get(&self, class: AssetClass) -> Decimal {
        match class {
            AssetClass::Equity => self.equity,
            AssetClass::Commodities => self.commodities,
            AssetClass::Forex => self.forex,
            AssetClass::Crypto => self.crypto,
        }
    }

    pub fn set(&mut self, class: AssetClass, value: Decimal) {
        match class {
            AssetClass::Equity => self.equity = value,
            AssetClass::Commodities => self.commodities = value,
            AssetClass::Forex => self.forex = value,
            AssetClass::Crypto => self.crypto = value,
        }
    }

    /// Add `amount` (may be negative); fails rather than go below zero
    pub fn adjust(&mut self, class: AssetClass, amount: Decimal) -> LedgerResult<()> {
        let available = self.get(class);
        let next = available + amount;
        if next < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                asset_class: class,
                required: -amount,
                available,
            });
        }
        self.set(class, next);
        Ok(())
    }
}

// ============================================================================
// State and transitions
// ============================================================================

/// Positions plus fund buckets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub positions: BTreeMap<PositionKey, Position>,
    pub funds: FundsLedger,
}

impl LedgerState {
    pub fn new(funds: FundsLedger) -> Self {
        Self {
            positions: BTreeMap::new(),
            funds,
        }
    }

    pub fn position(&self, broker: Broker, class: AssetClass, symbol: &str) -> Option<&Position> {
        self.positions.get(&PositionKey {
            broker,
            asset_class: class,
            symbol: symbol.to_string(),
        })
    }

    /// Positions held with one broker, in key order
    pub fn positions_for(&self, broker: Broker) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(move |p| p.broker == broker)
    }

    /// Raise high-water marks of `broker`'s positions to the given prices
    pub fn mark_prices<'p>(
        &mut self,
        broker: Broker,
        prices: impl IntoIterator<Item = (&'p str, Decimal)>,
    ) {
        for (symbol, price) in prices {
            for position in self.positions.values_mut() {
                if position.broker == broker && position.symbol == symbol {
                    position.mark(price);
                }
            }
        }
    }

    /// Cost basis currently invested in an asset class (all brokers)
    pub fn invested(&self, class: AssetClass) -> Decimal {
        self.positions
            .values()
            .filter(|p| p.asset_class == class)
            .map(|p| p.total_cost)
            .sum()
    }

    /// Pure transition: the state after filling `action` with `fee`
    pub fn apply(&self, action: &TradeAction, fee: Decimal) -> LedgerResult<LedgerState> {
        let mut next = self.clone();
        next.apply_in_place(action, fee)?;
        Ok(next)
    }

    /// Validate then mutate. On error `self` is unchanged.
    pub fn apply_in_place(&mut self, action: &TradeAction, fee: Decimal) -> LedgerResult<()> {
        if action.quantity <= Decimal::ZERO || action.price <= Decimal::ZERO {
            return Err(LedgerError::InvalidOrder(format!(
                "{} {} at {}",
                action.quantity, action.symbol, action.price
            )));
        }
        if fee < Decimal::ZERO {
            return Err(LedgerError::InvalidOrder(format!("negative fee {fee}")));
        }

        let key = PositionKey {
            broker: action.broker,
            asset_class: action.asset_class,
            symbol: action.symbol.clone(),
        };

        match action.side {
            TradeSide::Buy => {
                self.funds
                    .adjust(action.asset_class, -(action.notional() + fee))?;
                match self.positions.get_mut(&key) {
                    Some(position) => position.add(action.quantity, action.price),
                    None => {
                        self.positions.insert(
                            key,
                            Position::open(
                                action.symbol.clone(),
                                action.asset_class,
                                action.broker,
                                action.timeframe,
                                action.quantity,
                                action.price,
                            ),
                        );
                    }
                }
            }
            TradeSide::Sell => {
                let Some(held) = self.positions.get(&key).map(|p| p.quantity) else {
                    return Err(LedgerError::NoPosition {
                        symbol: action.symbol.clone(),
                    });
                };
                if held + QUANTITY_EPSILON < action.quantity {
                    return Err(LedgerError::InsufficientQuantity {
                        symbol: action.symbol.clone(),
                        held,
                        requested: action.quantity,
                    });
                }
                let sold = action.quantity.min(held);
                self.funds
                    .adjust(action.asset_class, sold * action.price - fee)?;

                let closed = self
                    .positions
                    .get_mut(&key)
                    .map(|p| p.reduce(sold))
                    .unwrap_or(true);
                if closed {
                    self.positions.remove(&key);
                }
            }
        }

        debug_assert!(self
            .positions
            .values()
            .all(|p| p.quantity >= Decimal::ZERO && p.total_cost == p.avg_cost * p.quantity));
        Ok(())
    }
}

// ============================================================================
// Store trait and implementations
// ============================================================================

/// Where ledger state and history live between cycles
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load(&self) -> LedgerResult<LedgerState>;
    async fn save(&self, state: &LedgerState) -> LedgerResult<()>;
    async fn append_transaction(&self, transaction: &Transaction) -> LedgerResult<()>;
    /// Most recent first
    async fn transactions(&self, limit: usize) -> LedgerResult<Vec<Transaction>>;
}

/// Process-local store, used for paper trading and tests
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<LedgerState>,
    history: RwLock<Vec<Transaction>>,
}

impl MemoryLedgerStore {
    pub fn new(state: LedgerState) -> Self {
        Self {
            state: RwLock::new(state),
            history: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self) -> LedgerResult<LedgerState> {
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, state: &LedgerState) -> LedgerResult<()> {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state.clone();
        Ok(())
    }

    async fn append_transaction(&self, transaction: &Transaction) -> LedgerResult<()> {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction.clone());
        Ok(())
    }

    async fn transactions(&self, limit: usize) -> LedgerResult<Vec<Transaction>> {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        Ok(history.iter().rev().take(limit).cloned().collect())
    }
}

/// SQLite-backed store on top of `persistence::LedgerRepository`
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_enum<T>(
    column: &'static str,
    value: &str,
    parse: fn(&str) -> Option<T>,
) -> LedgerResult<T> {
    parse(value).ok_or_else(|| {
        LedgerError::from(DbError::InvalidValue {
            column,
            value: value.to_string(),
        })
    })
}

fn record_to_position(record: &PositionRecord) -> LedgerResult<Position> {
    let avg_cost = parse_decimal("avg_cost", &record.avg_cost)?;
    // Rows written before the high-water column existed carry '0'
    let high_water = parse_decimal("high_water", &record.high_water)?;
    Ok(Position {
        symbol: record.symbol.clone(),
        asset_class: parse_enum("asset_class", &record.asset_class, AssetClass::parse)?,
        quantity: parse_decimal("quantity", &record.quantity)?,
        avg_cost,
        total_cost: parse_decimal("total_cost", &record.total_cost)?,
        broker: parse_enum("broker", &record.broker, Broker::parse)?,
        timeframe: parse_enum("timeframe", &record.timeframe, Timeframe::parse)?,
        high_water: high_water.max(avg_cost),
    })
}

fn position_to_record(position: &Position) -> PositionRecord {
    PositionRecord {
        broker: position.broker.as_str().to_string(),
        asset_class: position.asset_class.as_str().to_string(),
        symbol: position.symbol.clone(),
        quantity: position.quantity.to_string(),
        avg_cost: position.avg_cost.to_string(),
        total_cost: position.total_cost.to_string(),
        timeframe: position.timeframe.as_str().to_string(),
        high_water: position.high_water.to_string(),
    }
}

fn transaction_to_record(tx: &Transaction) -> TransactionRecord {
    TransactionRecord {
        id: tx.id.clone(),
        side: tx.side.as_str().to_string(),
        symbol: tx.symbol.clone(),
        asset_class: tx.asset_class.as_str().to_string(),
        quantity: tx.quantity.to_string(),
        price: tx.price.to_string(),
        fee: tx.fee.to_string(),
        broker: tx.broker.as_str().to_string(),
        timeframe: tx.timeframe.as_str().to_string(),
        timestamp: tx.timestamp,
        reason: tx.reason.clone(),
    }
}

fn record_to_transaction(record: &TransactionRecord) -> LedgerResult<Transaction> {
    let side = match record.side.as_str() {
        "BUY" => TradeSide::Buy,
        "SELL" => TradeSide::Sell,
        other => {
            return Err(LedgerError::from(DbError::InvalidValue {
                column: "side",
                value: other.to_string(),
            }))
        }
    };
    Ok(Transaction {
        id: record.id.clone(),
        side,
        symbol: record.symbol.clone(),
        asset_class: parse_enum("asset_class", &record.asset_class, AssetClass::parse)?,
        quantity: parse_decimal("quantity", &record.quantity)?,
        price: parse_decimal("price", &record.price)?,
        fee: parse_decimal("fee", &record.fee)?,
        broker: parse_enum("broker", &record.broker, Broker::parse)?,
        timeframe: parse_enum("timeframe", &record.timeframe, Timeframe::parse)?,
        timestamp: record.timestamp,
        reason: record.reason.clone(),
    })
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load(&self) -> LedgerResult<LedgerState> {
        let repo = LedgerRepository::new(&self.pool);
        let mut state = LedgerState::default();

        for record in repo.load_positions().await? {
            let position = record_to_position(&record)?;
            state.positions.insert(position.key(), position);
        }
        for bucket in repo.load_funds().await? {
            let class = parse_enum("asset_class", &bucket.asset_class, AssetClass::parse)?;
            state.funds.set(class, parse_decimal("cash", &bucket.cash)?);
        }
        Ok(state)
    }

    async fn save(&self, state: &LedgerState) -> LedgerResult<()> {
        let positions: Vec<PositionRecord> =
            state.positions.values().map(position_to_record).collect();
        let funds: Vec<FundBucketRecord> = AssetClass::all()
            .iter()
            .map(|class| FundBucketRecord {
                asset_class: class.as_str().to_string(),
                cash: state.funds.get(*class).to_string(),
            })
            .collect();

        LedgerRepository::new(&self.pool)
            .replace_state(&positions, &funds)
            .await?;
        Ok(())
    }

    async fn append_transaction(&self, transaction: &Transaction) -> LedgerResult<()> {
        LedgerRepository::new(&self.pool)
            .insert_transaction(&transaction_to_record(transaction))
            .await?;
        Ok(())
    }

    async fn transactions(&self, limit: usize) -> LedgerResult<Vec<Transaction>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        LedgerRepository::new(&self.pool)
            .recent_transactions(limit)
            .await?
            .iter()
            .map(record_to_transaction)
            .collect()
    }
}

// ============================================================================
// Single-writer handle
// ============================================================================

/// Shared access to a ledger store with one writer at a time
#[derive(Clone)]
pub struct LedgerHandle {
    store: Arc<dyn LedgerStore>,
    writer: Arc<Mutex<()>>,
    sequence: Arc<AtomicU64>,
}

impl LedgerHandle {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            writer: Arc::new(Mutex::new(())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn in_memory(state: LedgerState) -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new(state)))
    }

    /// Read-only snapshot; may be stale by the time it is used
    pub async fn snapshot(&self) -> LedgerResult<LedgerState> {
        self.store.load().await
    }

    pub async fn transactions(&self, limit: usize) -> LedgerResult<Vec<Transaction>> {
        self.store.transactions(limit).await
    }

    /// Take the writer lock and load the current state under it
    pub async fn lock(&self) -> LedgerResult<LedgerGuard<'_>> {
        let permit = self.writer.lock().await;
        let state = self.store.load().await?;
        Ok(LedgerGuard {
            _permit: permit,
            handle: self,
            state,
        })
    }
}

/// Exclusive write access for the lifetime of the guard
pub struct LedgerGuard<'a> {
    _permit: MutexGuard<'a, ()>,
    handle: &'a LedgerHandle,
    state: LedgerState,
}

impl LedgerGuard<'_> {
    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    /// Raise and persist high-water marks for the given prices
    pub async fn mark_prices<'p>(
        &mut self,
        broker: Broker,
        prices: impl IntoIterator<Item = (&'p str, Decimal)>,
    ) -> LedgerResult<()> {
        let mut next = self.state.clone();
        next.mark_prices(broker, prices);
        if next != self.state {
            self.handle.store.save(&next).await?;
            self.state = next;
        }
        Ok(())
    }

    /// Add cash to (or, if negative, withdraw from) a bucket and persist it
    pub async fn deposit(&mut self, class: AssetClass, amount: Decimal) -> LedgerResult<Decimal> {
        let mut next = self.state.clone();
        next.funds.adjust(class, amount)?;
        self.handle.store.save(&next).await?;
        self.state = next;
        info!(asset_class = %class, amount = %amount, "Funds adjusted");
        Ok(self.state.funds.get(class))
    }

    /// Apply and persist a fill without recording a transaction
    pub async fn apply(&mut self, action: &TradeAction, fee: Decimal) -> LedgerResult<()> {
        let next = self.state.apply(action, fee)?;
        self.handle.store.save(&next).await?;
        self.state = next;
        Ok(())
    }

    /// Record a committed action in the transaction history
    pub async fn record(
        &self,
        action: &TradeAction,
        quantity: Decimal,
        fee: Decimal,
        timestamp: i64,
    ) -> LedgerResult<Transaction> {
        let seq = self.handle.sequence.fetch_add(1, Ordering::Relaxed);
        let transaction = Transaction {
            id: format!("TX-{timestamp}-{seq}"),
            side: action.side,
            symbol: action.symbol.clone(),
            asset_class: action.asset_class,
            quantity,
            price: action.price,
            fee,
            broker: action.broker,
            timeframe: action.timeframe,
            timestamp,
            reason: action.reason.clone(),
        };
        self.handle.store.append_transaction(&transaction).await?;
        debug!(id = %transaction.id, side = %transaction.side, symbol = %transaction.symbol,
            qty = %quantity, price = %action.price, "Transaction recorded");
        Ok(transaction)
    }

    /// Apply, persist and record in one step
    pub async fn commit(
        &mut self,
        action: &TradeAction,
        fee: Decimal,
        timestamp: i64,
    ) -> LedgerResult<Transaction> {
        self.apply(action, fee).await?;
        self.record(action, action.quantity, fee, timestamp).await
    }
}

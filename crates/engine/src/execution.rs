//! Simulated order execution
//!
//! Validates an action against the ledger, then fills it as a sequence of
//! bounded slices with simulated venue latency. Each slice is applied to the
//! ledger on its own, so an interrupted order leaves a consistent partial fill.
//! Orders on the same (broker, symbol) run one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fees::FeeSchedule;
use crate::ledger::{LedgerHandle, LedgerState};
use crate::types::{
    AssetClass, Broker, ExecutionResult, TradeAction, TradeSide, QUANTITY_EPSILON,
};

/// Maximum quantity per slice, by asset class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceTable {
    pub equity: Decimal,
    pub commodities: Decimal,
    pub forex: Decimal,
    pub crypto: Decimal,
    /// Used when a class has no positive entry
    pub fallback: Decimal,
}

impl Default for SliceTable {
    fn default() -> Self {
        Self {
            equity: dec!(50),
            commodities: dec!(1),
            forex: dec!(500),
            crypto: dec!(0.1),
            fallback: dec!(100),
        }
    }
}

impl SliceTable {
    pub fn slice_size(&self, class: AssetClass) -> Decimal {
        let size = match class {
            AssetClass::Equity => self.equity,
            AssetClass::Commodities => self.commodities,
            AssetClass::Forex => self.forex,
            AssetClass::Crypto => self.crypto,
        };
        if size > Decimal::ZERO {
            size
        } else {
            self.fallback
        }
    }

    /// Split `quantity` into slices; the pieces sum to `quantity` exactly
    pub fn split(&self, class: AssetClass, quantity: Decimal) -> Vec<Decimal> {
        let size = self.slice_size(class);
        let mut slices = Vec::new();
        let mut remaining = quantity;
        while remaining > Decimal::ZERO {
            let slice = remaining.min(size);
            slices.push(slice);
            remaining -= slice;
        }
        slices
    }
}

/// API keys per live venue. Paper trading needs none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub dhan_client_id: Option<String>,
    pub shoonya_user_id: Option<String>,
    pub binance_api_key: Option<String>,
    pub coindcx_api_key: Option<String>,
    pub coinswitch_api_key: Option<String>,
}

impl BrokerCredentials {
    /// Read `DHAN_CLIENT_ID`, `SHOONYA_USER_ID`, `BINANCE_API_KEY`,
    /// `COINDCX_API_KEY` and `COINSWITCH_API_KEY`
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            dhan_client_id: var("DHAN_CLIENT_ID"),
            shoonya_user_id: var("SHOONYA_USER_ID"),
            binance_api_key: var("BINANCE_API_KEY"),
            coindcx_api_key: var("COINDCX_API_KEY"),
            coinswitch_api_key: var("COINSWITCH_API_KEY"),
        }
    }

    pub fn is_configured(&self, broker: Broker) -> bool {
        match broker {
            Broker::Paper => true,
            Broker::Dhan => self.dhan_client_id.is_some(),
            Broker::Shoonya => self.shoonya_user_id.is_some(),
            Broker::Binance => self.binance_api_key.is_some(),
            Broker::Coindcx => self.coindcx_api_key.is_some(),
            Broker::Coinswitch => self.coinswitch_api_key.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub slices: SliceTable,
    /// Simulated per-slice latency range, milliseconds
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub fees: FeeSchedule,
    /// Seed for the latency RNG; entropy when unset
    pub seed: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slices: SliceTable::default(),
            latency_min_ms: 200,
            latency_max_ms: 500,
            fees: FeeSchedule::default(),
            seed: None,
        }
    }
}

/// Fills actions against a ledger as sliced orders
pub struct OrderExecutor {
    config: ExecutionConfig,
    credentials: BrokerCredentials,
    ledger: LedgerHandle,
    rng: Mutex<StdRng>,
    key_locks: Mutex<HashMap<(Broker, String), Arc<tokio::sync::Mutex<()>>>>,
    sequence: AtomicU64,
}

impl OrderExecutor {
    pub fn new(config: ExecutionConfig, credentials: BrokerCredentials, ledger: LedgerHandle) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            credentials,
            ledger,
            rng: Mutex::new(rng),
            key_locks: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    fn key_lock(&self, broker: Broker, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry((broker, symbol.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Latency for the next slice, in the configured range
    fn sample_latency_ms(&self) -> u64 {
        let (lo, hi) = (self.config.latency_min_ms, self.config.latency_max_ms);
        if hi <= lo {
            return lo;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(lo..=hi)
    }

    fn check_preconditions(
        &self,
        action: &TradeAction,
        state: &LedgerState,
        first_slice: Decimal,
    ) -> Result<(), String> {
        if !self.credentials.is_configured(action.broker) {
            return Err(format!("{} credentials missing", action.broker));
        }
        if !action.broker.supports(action.asset_class) {
            return Err(format!("{} does not trade {}", action.broker, action.asset_class));
        }
        if action.quantity <= Decimal::ZERO || action.price <= Decimal::ZERO {
            return Err("Quantity and price must be positive".to_string());
        }

        match action.side {
            TradeSide::Sell => {
                let Some(position) =
                    state.position(action.broker, action.asset_class, &action.symbol)
                else {
                    return Err("Position not found".to_string());
                };
                if position.quantity + QUANTITY_EPSILON < action.quantity {
                    return Err(format!(
                        "Insufficient quantity: hold {}, requested {}",
                        position.quantity, action.quantity
                    ));
                }
            }
            TradeSide::Buy => {
                // The whole order's fee is charged with the first slice
                let required =
                    first_slice * action.price + self.config.fees.fee_for(action.notional());
                let available = state.funds.get(action.asset_class);
                if available < required {
                    return Err(format!(
                        "Insufficient funds: need {required}, have {available}"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Execute one action. Failures are reported in the result, never raised.
    pub async fn execute(&self, action: &TradeAction) -> ExecutionResult {
        let key_lock = self.key_lock(action.broker, &action.symbol);
        let _key_guard = key_lock.lock().await;

        let slices = self.config.slices.split(action.asset_class, action.quantity);
        let first_slice = slices.first().copied().unwrap_or(Decimal::ZERO);

        // ── Preconditions ──
        {
            let guard = match self.ledger.lock().await {
                Ok(guard) => guard,
                Err(e) => return ExecutionResult::rejected(format!("Ledger unavailable: {e}")),
            };
            if let Err(message) = self.check_preconditions(action, guard.state(), first_slice) {
                info!(symbol = %action.symbol, side = %action.side, reason = %message, "Order rejected");
                return ExecutionResult::rejected(message);
            }
        }

        // ── Slice loop ──
        let mut filled = Decimal::ZERO;
        let mut fee_paid = Decimal::ZERO;
        let mut fills = 0u32;
        let mut elapsed_ms = 0u64;
        let mut stopped: Option<String> = None;

        for (i, slice) in slices.iter().enumerate() {
            let latency = self.sample_latency_ms();
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            elapsed_ms += latency;

            let fee = if i == 0 {
                self.config.fees.fee_for(action.notional())
            } else {
                Decimal::ZERO
            };

            let applied = match self.ledger.lock().await {
                Ok(mut guard) => {
                    let quantity = match action.side {
                        TradeSide::Buy => *slice,
                        TradeSide::Sell => sell_slice_quantity(action, *slice, guard.state()),
                    };
                    let slice_action = TradeAction {
                        quantity,
                        ..action.clone()
                    };
                    match guard.apply(&slice_action, fee).await {
                        Ok(()) => {
                            let closed = action.side == TradeSide::Sell
                                && guard
                                    .state()
                                    .position(action.broker, action.asset_class, &action.symbol)
                                    .is_none();
                            Ok((quantity, closed))
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };
            match applied {
                Ok((quantity, closed)) => {
                    filled += quantity;
                    fee_paid += fee;
                    fills += 1;
                    debug!(symbol = %action.symbol, slice = fills, qty = %quantity, latency_ms = latency, "Slice filled");
                    if closed {
                        break;
                    }
                }
                Err(e) => {
                    warn!(symbol = %action.symbol, slice = i + 1, error = %e, "Slice failed, stopping");
                    stopped = Some(e.to_string());
                    break;
                }
            }
        }

        if fills == 0 {
            return ExecutionResult {
                elapsed_ms,
                ..ExecutionResult::rejected(stopped.unwrap_or_else(|| "Nothing to fill".to_string()))
            };
        }

        let now_ms = Utc::now().timestamp_millis();
        if let Ok(guard) = self.ledger.lock().await {
            if let Err(e) = guard.record(action, filled, fee_paid, now_ms).await {
                warn!(symbol = %action.symbol, error = %e, "Failed to record transaction");
            }
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let prefix: String = action.broker.as_str().chars().take(3).collect();
        let seconds = elapsed_ms as f64 / 1000.0;
        let message = match stopped {
            None => format!("Executed {filled} qty in {fills} slices ({seconds:.1}s)"),
            Some(reason) => format!(
                "Partially executed {filled} of {} qty in {fills} slices ({seconds:.1}s): {reason}",
                action.quantity
            ),
        };
        info!(symbol = %action.symbol, side = %action.side, filled = %filled, slices = fills, "Order executed");

        ExecutionResult {
            success: true,
            filled_quantity: filled,
            slice_count: fills,
            order_id: Some(format!("{prefix}-{now_ms}-{seq}")),
            message,
            elapsed_ms,
        }
    }
}

/// Quantity a SELL slice takes. A slice that would leave less than
/// `QUANTITY_EPSILON` behind takes the whole holding, so the remainder is
/// credited instead of dropped when the position closes.
fn sell_slice_quantity(action: &TradeAction, slice: Decimal, state: &LedgerState) -> Decimal {
    match state.position(action.broker, action.asset_class, &action.symbol) {
        Some(position) if position.quantity <= slice + QUANTITY_EPSILON => position.quantity,
        _ => slice,
    }
}

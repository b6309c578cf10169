//! Ledger repository: positions, fund buckets and transaction history

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub broker: String,
    pub asset_class: String,
    pub symbol: String,
    pub quantity: String,
    pub avg_cost: String,
    pub total_cost: String,
    pub timeframe: String,
    // Added via migration
    pub high_water: String,
}

/// Cash held in one asset-class bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FundBucketRecord {
    pub asset_class: String,
    pub cash: String,
}

/// A committed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TransactionRecord {
    pub id: String,
    pub side: String,
    pub symbol: String,
    pub asset_class: String,
    pub quantity: String,
    pub price: String,
    pub fee: String,
    pub broker: String,
    pub timeframe: String,
    pub timestamp: i64,
    pub reason: String,
}

/// Repository for the trading ledger
pub struct LedgerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> LedgerRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// All open positions, ordered by key
    pub async fn load_positions(&self) -> DbResult<Vec<PositionRecord>> {
        let records = sqlx::query_as::<_, PositionRecord>(
            r#"
            SELECT broker, asset_class, symbol, quantity, avg_cost, total_cost, timeframe,
                   high_water
            FROM positions
            ORDER BY broker, asset_class, symbol
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// All fund buckets
    pub async fn load_funds(&self) -> DbResult<Vec<FundBucketRecord>> {
        let records = sqlx::query_as::<_, FundBucketRecord>(
            "SELECT asset_class, cash FROM fund_buckets ORDER BY asset_class",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Replace the whole ledger state in one transaction.
    /// Positions not in `positions` are removed; buckets are upserted.
    pub async fn replace_state(
        &self,
        positions: &[PositionRecord],
        funds: &[FundBucketRecord],
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM positions")
            .execute(&mut *tx)
            .await?;

        for position in positions {
            sqlx::query(
                r#"INSERT INTO positions
                    (broker, asset_class, symbol, quantity, avg_cost, total_cost, timeframe,
                     high_water, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, strftime('%s', 'now'))
                "#,
            )
            .bind(&position.broker)
            .bind(&position.asset_class)
            .bind(&position.symbol)
            .bind(&position.quantity)
            .bind(&position.avg_cost)
            .bind(&position.total_cost)
            .bind(&position.timeframe)
            .bind(&position.high_water)
            .execute(&mut *tx)
            .await?;
        }

        for bucket in funds {
            sqlx::query(
                r#"INSERT INTO fund_buckets (asset_class, cash, updated_at)
                   VALUES (?1, ?2, strftime('%s', 'now'))
                   ON CONFLICT(asset_class) DO UPDATE SET
                     cash = excluded.cash,
                     updated_at = strftime('%s', 'now')
                "#,
            )
            .bind(&bucket.asset_class)
            .bind(&bucket.cash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Append a transaction (INSERT OR IGNORE by id)
    pub async fn insert_transaction(&self, record: &TransactionRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"INSERT OR IGNORE INTO transactions
                (id, side, symbol, asset_class, quantity, price, fee, broker, timeframe,
                 timestamp, reason)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&record.id)
        .bind(&record.side)
        .bind(&record.symbol)
        .bind(&record.asset_class)
        .bind(&record.quantity)
        .bind(&record.price)
        .bind(&record.fee)
        .bind(&record.broker)
        .bind(&record.timeframe)
        .bind(record.timestamp)
        .bind(&record.reason)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Most recent transactions first
    pub async fn recent_transactions(&self, limit: i64) -> DbResult<Vec<TransactionRecord>> {
        let records = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT id, side, symbol, asset_class, quantity, price, fee, broker, timeframe,
                   timestamp, reason
            FROM transactions
            ORDER BY timestamp DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

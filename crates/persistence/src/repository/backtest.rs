//! Backtest runs repository: stored results of historical replays

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A stored backtest run. `result_json` holds the full serialized result.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestRunRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub symbols: String,
    pub bar_interval: String,
    pub bar_range: String,
    pub initial_capital: String,
    pub final_capital: String,
    pub total_pnl: String,
    pub win_rate: String,
    pub total_trades: i64,
    pub max_drawdown_pct: String,
    pub incomplete: bool,
    pub result_json: String,
    // Added via migration
    pub strategy_version: String,
    pub skipped_count: i64,
    pub created_at: Option<i64>,
}

/// Summary row for listings (no result payload)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestRunSummary {
    pub id: i64,
    pub params_hash: String,
    pub symbols: String,
    pub strategy_version: String,
    pub total_pnl: String,
    pub win_rate: String,
    pub total_trades: i64,
    pub max_drawdown_pct: String,
    pub incomplete: bool,
    pub created_at: Option<i64>,
}

/// Repository for stored backtest runs
pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a run, returning its id
    pub async fn save(&self, record: &BacktestRunRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO backtest_runs
                (params_hash, symbols, bar_interval, bar_range, initial_capital, final_capital,
                 total_pnl, win_rate, total_trades, max_drawdown_pct, incomplete, result_json,
                 strategy_version, skipped_count)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.symbols)
        .bind(&record.bar_interval)
        .bind(&record.bar_range)
        .bind(&record.initial_capital)
        .bind(&record.final_capital)
        .bind(&record.total_pnl)
        .bind(&record.win_rate)
        .bind(record.total_trades)
        .bind(&record.max_drawdown_pct)
        .bind(record.incomplete)
        .bind(&record.result_json)
        .bind(&record.strategy_version)
        .bind(record.skipped_count)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<BacktestRunRecord>> {
        let record = sqlx::query_as::<_, BacktestRunRecord>(
            r#"
            SELECT id, params_hash, symbols, bar_interval, bar_range, initial_capital,
                   final_capital, total_pnl, win_rate, total_trades, max_drawdown_pct,
                   incomplete, result_json, strategy_version, skipped_count, created_at
            FROM backtest_runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Latest complete run with the same parameters, if any
    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<BacktestRunRecord>> {
        let record = sqlx::query_as::<_, BacktestRunRecord>(
            r#"
            SELECT id, params_hash, symbols, bar_interval, bar_range, initial_capital,
                   final_capital, total_pnl, win_rate, total_trades, max_drawdown_pct,
                   incomplete, result_json, strategy_version, skipped_count, created_at
            FROM backtest_runs
            WHERE params_hash = ? AND incomplete = 0
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(hash)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent runs first
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<BacktestRunSummary>> {
        let records = sqlx::query_as::<_, BacktestRunSummary>(
            r#"
            SELECT id, params_hash, symbols, strategy_version, total_pnl, win_rate,
                   total_trades, max_drawdown_pct, incomplete, created_at
            FROM backtest_runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(hash: &str, incomplete: bool) -> BacktestRunRecord {
        BacktestRunRecord {
            id: None,
            params_hash: hash.to_string(),
            symbols: "INFY,TCS".to_string(),
            bar_interval: "5m".to_string(),
            bar_range: "5d".to_string(),
            initial_capital: "100000".to_string(),
            final_capital: "101250.5".to_string(),
            total_pnl: "1250.5".to_string(),
            win_rate: "50".to_string(),
            total_trades: 4,
            max_drawdown_pct: "1.2".to_string(),
            incomplete,
            result_json: "{}".to_string(),
            strategy_version: "canonical".to_string(),
            skipped_count: 0,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let id = repo.save(&record("abc", false)).await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.id, Some(id));
        assert_eq!(stored.total_pnl, "1250.5");
        assert!(!stored.incomplete);
        assert!(repo.get(id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_by_hash_ignores_incomplete_runs() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let complete = repo.save(&record("abc", false)).await.unwrap();
        repo.save(&record("abc", true)).await.unwrap();

        let found = repo.get_by_hash("abc").await.unwrap().unwrap();
        assert_eq!(found.id, Some(complete));
        assert!(repo.get_by_hash("zzz").await.unwrap().is_none());

        let recent = repo.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].incomplete);
    }
}

//! Persistence layer for TradePilot
//!
//! SQLite storage for the trading ledger (positions, fund buckets,
//! transaction history) and for stored backtest runs. Amounts live in TEXT
//! columns and are parsed back with [`parse_decimal`].

pub mod repository;
pub mod schema;

pub use sqlx::sqlite::SqlitePool;
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Parse a TEXT column back into a Decimal
pub fn parse_decimal(column: &'static str, value: &str) -> DbResult<Decimal> {
    Decimal::from_str(value).map_err(|_| DbError::InvalidValue {
        column,
        value: value.to_string(),
    })
}

/// Applied on every connect. WAL lets the API read while a cycle writes.
const PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    ("foreign_keys", "ON"),
    ("cache_size", "-8000"),
];

/// Split a schema script into executable statements, dropping `--` comment lines
fn statements(script: &str) -> Vec<String> {
    script
        .split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|sql| !sql.is_empty())
        .collect()
}

/// SQLite pool holding the ledger and backtest tables
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file at `path` and bring the schema up to date
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db = Self::connect(&format!("sqlite:{}?mode=rwc", path.display()), 5).await?;
        info!(path = %path.display(), "Database ready");
        Ok(db)
    }

    /// Single-connection in-memory database; every connection would otherwise
    /// see its own empty schema
    pub async fn in_memory() -> DbResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.apply_pragmas().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> DbResult<()> {
        for sql in statements(schema::CREATE_TABLES) {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        // Column additions are replayed on every start
        for migration in schema::MIGRATIONS {
            if let Err(e) = sqlx::query(migration).execute(&self.pool).await {
                if !e.to_string().contains("duplicate column name") {
                    return Err(DbError::Migration(format!("{e}: {migration}")));
                }
                debug!(migration, "Column already present");
            }
        }
        Ok(())
    }

    async fn apply_pragmas(&self) -> DbResult<()> {
        for (name, value) in PRAGMAS {
            sqlx::query(&format!("PRAGMA {name}={value}"))
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Connection(format!("{name} pragma failed: {e}")))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Owned pool handle for ledger stores and spawned tasks
    pub fn pool_clone(&self) -> SqlitePool {
        self.pool.clone()
    }
}

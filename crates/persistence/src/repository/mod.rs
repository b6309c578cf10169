//! Repository implementations for database operations

pub mod backtest;
pub mod ledger;

pub use backtest::*;
pub use ledger::*;

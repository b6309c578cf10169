//! Brokerage fee calculation
//!
//! Every order pays a flat brokerage charge plus an optional proportional fee
//! on its notional. Formula: fee = flat + notional × rate, rounded down to
//! 4 decimal places. A zero notional pays nothing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Per-order fee parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Flat charge per order (default 20)
    pub flat_per_order: Decimal,
    /// Proportional fee as a fraction of notional (default 0)
    pub proportional_rate: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            flat_per_order: dec!(20),
            proportional_rate: Decimal::ZERO,
        }
    }
}

impl FeeSchedule {
    /// Schedule that charges nothing
    pub fn zero() -> Self {
        Self {
            flat_per_order: Decimal::ZERO,
            proportional_rate: Decimal::ZERO,
        }
    }

    /// Fee for one order of `notional`
    pub fn fee_for(&self, notional: Decimal) -> Decimal {
        if notional <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let raw_fee = self.flat_per_order + notional * self.proportional_rate;

        // Round down to 4 decimal places
        let scale_factor = dec!(10000);
        (raw_fee * scale_factor).floor() / scale_factor
    }
}

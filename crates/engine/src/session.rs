//! Exchange session clock
//!
//! Converts a UTC instant into exchange-local time and answers the three
//! questions the decision engine asks every cycle: is the market open, may new
//! entries still be opened, and has the intraday square-off time passed.

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Trading hours of one exchange, in exchange-local minutes after midnight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSession {
    /// Offset of exchange-local time from UTC (IST = +330)
    pub utc_offset_minutes: i32,
    pub open_minute: u32,
    pub close_minute: u32,
    /// Saturday and Sunday are closed unless set
    pub trades_weekends: bool,
    /// Round-the-clock venue (crypto); hours are ignored
    pub continuous: bool,
}

impl Default for MarketSession {
    /// NSE cash session: 09:15 to 15:30 IST, weekdays
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            open_minute: 9 * 60 + 15,
            close_minute: 15 * 60 + 30,
            trades_weekends: false,
            continuous: false,
        }
    }
}

impl MarketSession {
    pub fn continuous() -> Self {
        Self {
            trades_weekends: true,
            continuous: true,
            ..Self::default()
        }
    }

    fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        now.with_timezone(&offset)
    }

    /// Exchange-local minutes after midnight
    pub fn minute_of_day(&self, now: DateTime<Utc>) -> u32 {
        let local = self.local(now);
        local.hour() * 60 + local.minute()
    }

    fn is_trading_day(&self, now: DateTime<Utc>) -> bool {
        self.trades_weekends || !matches!(self.local(now).weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if !self.is_trading_day(now) {
            return false;
        }
        if self.continuous {
            return true;
        }
        let minute = self.minute_of_day(now);
        minute >= self.open_minute && minute < self.close_minute
    }

    /// Open and at least `entry_cutoff_minutes` before the close
    pub fn accepts_entries(&self, now: DateTime<Utc>, entry_cutoff_minutes: u32) -> bool {
        if !self.is_open(now) {
            return false;
        }
        self.continuous
            || self.minute_of_day(now) < self.close_minute.saturating_sub(entry_cutoff_minutes)
    }

    /// At or after the intraday square-off time (`cutoff_minutes` before close)
    pub fn is_past_square_off(&self, now: DateTime<Utc>, cutoff_minutes: u32) -> bool {
        if self.continuous {
            return false;
        }
        self.minute_of_day(now) >= self.close_minute.saturating_sub(cutoff_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// 2024-06-12 is a Wednesday; `hh:mm` are IST
    fn ist(hour: u32, minute: u32) -> DateTime<Utc> {
        let offset = FixedOffset::east_opt(330 * 60).unwrap();
        offset
            .with_ymd_and_hms(2024, 6, 12, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_open_and_close_boundaries() {
        let session = MarketSession::default();
        assert!(!session.is_open(ist(9, 14)));
        assert!(session.is_open(ist(9, 15)));
        assert!(session.is_open(ist(15, 29)));
        assert!(!session.is_open(ist(15, 30)));
    }

    #[test]
    fn test_entry_cutoff() {
        let session = MarketSession::default();
        assert!(session.accepts_entries(ist(14, 59), 30));
        assert!(!session.accepts_entries(ist(15, 0), 30));
    }

    #[test]
    fn test_square_off() {
        let session = MarketSession::default();
        assert!(!session.is_past_square_off(ist(15, 19), 10));
        assert!(session.is_past_square_off(ist(15, 20), 10));
    }

    #[test]
    fn test_weekend_closed() {
        let session = MarketSession::default();
        let saturday = ist(11, 0) + chrono::Duration::days(3);
        assert!(!session.is_open(saturday));
        assert!(MarketSession::continuous().is_open(saturday));
    }

    #[test]
    fn test_minute_of_day_uses_offset() {
        let session = MarketSession::default();
        let utc = Utc.with_ymd_and_hms(2024, 6, 12, 3, 45, 0).unwrap();
        assert_eq!(session.minute_of_day(utc), 9 * 60 + 15);
    }
}

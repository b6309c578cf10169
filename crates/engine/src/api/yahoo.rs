//! Yahoo Finance chart API client (no authentication required)

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::market_data::{BarSource, DataError};
use crate::types::Bar;

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
/// Exchange suffix applied to bare tickers
const DEFAULT_SUFFIX: &str = ".NS";

/// Yahoo chart client
#[derive(Clone)]
pub struct YahooClient {
    client: Client,
    base_url: String,
    suffix: String,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

impl Default for YahooClient {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .user_agent("Mozilla/5.0")
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            suffix: DEFAULT_SUFFIX.to_string(),
        }
    }

    /// Exchange suffix for bare tickers ("" to disable)
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.suffix = suffix.to_string();
        self
    }

    /// "RELIANCE" → "RELIANCE.NS"; tickers that already carry an exchange or
    /// index marker are left alone
    pub fn ticker(&self, symbol: &str) -> String {
        if symbol.contains('.') || symbol.starts_with('^') || symbol.contains('=') {
            symbol.to_string()
        } else {
            format!("{}{}", symbol, self.suffix)
        }
    }

    pub async fn get_chart(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<Vec<Bar>, DataError> {
        let url = format!(
            "{}/v8/finance/chart/{}?interval={}&range={}",
            self.base_url,
            self.ticker(symbol),
            interval,
            range
        );

        debug!(symbol, interval, range, "Fetching chart from Yahoo");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DataError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DataError::Status { status, body });
        }

        let body = response
            .text()
            .await
            .map_err(|e| DataError::Http(e.to_string()))?;
        let bars = parse_chart(&body)?;

        if bars.len() < 2 {
            return Err(DataError::Empty(symbol.to_string()));
        }

        debug!(symbol, count = bars.len(), "Fetched chart");
        Ok(bars)
    }
}

/// Parse a chart payload into ascending bars.
///
/// Bars without an open or close are dropped; a missing high/low falls back
/// to the close and a missing volume to zero. Timestamps are seconds upstream
/// and milliseconds here.
fn parse_chart(body: &str) -> Result<Vec<Bar>, DataError> {
    let response: ChartResponse =
        serde_json::from_str(body).map_err(|e| DataError::Parse(e.to_string()))?;

    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let at = |values: &Vec<Option<f64>>, i: usize| values.get(i).copied().flatten();

    let mut bars: Vec<Bar> = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            let open = at(&quote.open, i)?;
            let close = at(&quote.close, i)?;
            let high = at(&quote.high, i).unwrap_or(close);
            let low = at(&quote.low, i).unwrap_or(close);
            let volume = at(&quote.volume, i).unwrap_or(0.0);
            Some(Bar {
                time: ts * 1000,
                open: Decimal::from_f64(open)?,
                high: Decimal::from_f64(high)?,
                low: Decimal::from_f64(low)?,
                close: Decimal::from_f64(close)?,
                volume: Decimal::from_f64(volume).unwrap_or_default(),
            })
        })
        .collect();

    bars.sort_by_key(|b| b.time);
    Ok(bars)
}

#[async_trait]
impl BarSource for YahooClient {
    async fn fetch_bars(
        &self,
        symbol: &str,
        interval: &str,
        range: &str,
    ) -> Result<Vec<Bar>, DataError> {
        self.get_chart(symbol, interval, range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ticker_suffix() {
        let client = YahooClient::new();
        assert_eq!(client.ticker("RELIANCE"), "RELIANCE.NS");
        assert_eq!(client.ticker("TCS.BO"), "TCS.BO");
        assert_eq!(client.ticker("^NSEI"), "^NSEI");
        assert_eq!(client.ticker("BTC-USD"), "BTC-USD.NS");
        assert_eq!(client.clone().with_suffix("").ticker("AAPL"), "AAPL");
    }

    #[test]
    fn test_parse_chart_skips_incomplete_bars() {
        let body = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1700000000, 1700000300, 1700000600],
                    "indicators": {
                        "quote": [{
                            "open":   [100.0, null, 101.0],
                            "high":   [101.5, 102.0, null],
                            "low":    [99.5, 100.0, null],
                            "close":  [101.0, 101.5, 100.5],
                            "volume": [1200, 900, null]
                        }]
                    }
                }],
                "error": null
            }
        }"#;

        let bars = parse_chart(body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].time, 1_700_000_000_000);
        assert_eq!(bars[0].high, dec!(101.5));
        assert_eq!(bars[1].high, dec!(100.5));
        assert_eq!(bars[1].low, dec!(100.5));
        assert_eq!(bars[1].volume, Decimal::ZERO);
    }

    #[test]
    fn test_parse_chart_errors() {
        assert!(parse_chart(r#"{"chart":{"result":null}}"#).unwrap().is_empty());
        assert!(matches!(parse_chart("not json"), Err(DataError::Parse(_))));
    }
}

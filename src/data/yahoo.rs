//! Live daily bars from the Yahoo Finance chart endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{Bar, DataError, MarketSource};

/// A stalled endpoint must not hold up an execution.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug)]
pub struct YahooSource {
    http: Client,
    base_url: String,
}

impl YahooSource {
    pub fn new() -> Self {
        Self::with_base_url("https://query1.finance.yahoo.com".into())
    }

    /// Custom base URL (for testing with mock servers).
    pub fn with_base_url(base_url: String) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for YahooSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
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

#[async_trait]
impl MarketSource for YahooSource {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError> {
        let period1 = start.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp()).unwrap_or(0);
        let period2 = end
            .and_hms_opt(23, 59, 59)
            .map(|t| t.and_utc().timestamp())
            .unwrap_or(period1);
        let url = format!("{}/v8/finance/chart/{symbol}", self.base_url);
        debug!(%symbol, %start, %end, "fetching live market data");

        let response = self
            .http
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DataError::InvalidResponse(format!(
                "status {} for {symbol}",
                response.status().as_u16()
            )));
        }

        let body: ChartEnvelope = response
            .json()
            .await
            .map_err(|e| DataError::InvalidResponse(e.to_string()))?;
        parse_chart(symbol, body)
    }
}

fn parse_chart(symbol: &str, body: ChartEnvelope) -> Result<Vec<Bar>, DataError> {
    if let Some(err) = body.chart.error {
        if !err.is_null() {
            return Err(DataError::InvalidResponse(err.to_string()));
        }
    }
    let result = body
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| DataError::NoData {
            symbol: symbol.into(),
        })?;
    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| DataError::NoData {
            symbol: symbol.into(),
        })?;

    let field = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten();
    let mut bars = Vec::new();
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(*ts, 0).map(|t| t.date_naive()) else {
            continue;
        };
        // Rows with any missing field are dropped.
        if let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            field(&quote.open, i),
            field(&quote.high, i),
            field(&quote.low, i),
            field(&quote.close, i),
            field(&quote.volume, i),
        ) {
            bars.push(Bar {
                date,
                open,
                high,
                low,
                close,
                volume,
            });
        }
    }
    Ok(bars)
}

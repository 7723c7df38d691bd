//! Data Provider: OHLCV series for the capabilities injected into generated code.
//!
//! `CachedDataProvider` keeps fetched series for a fixed TTL and falls back
//! to a deterministic synthetic series when the live source is unavailable,
//! so an execution is never blocked on market-data availability.

pub mod synthetic;
pub mod yahoo;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One daily bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Errors from market-data sources.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid market data response: {0}")]
    InvalidResponse(String),

    #[error("no data for symbol '{symbol}'")]
    NoData { symbol: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can hand out a daily series for a symbol and date range.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn load_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Arc<Vec<Bar>>, DataError>;
}

/// A live upstream (network) source of bars.
#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, DataError>;
}

type CacheKey = (String, NaiveDate, NaiveDate);

struct CacheEntry {
    fetched_at: Instant,
    bars: Arc<Vec<Bar>>,
}

/// TTL cache in front of an optional live source, synthetic fallback behind it.
pub struct CachedDataProvider {
    source: Option<Box<dyn MarketSource>>,
    ttl: Duration,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl CachedDataProvider {
    pub fn new(source: Option<Box<dyn MarketSource>>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Synthetic data only; never touches the network.
    pub fn offline() -> Self {
        Self::new(None, Duration::from_secs(0))
    }
}

#[async_trait]
impl DataProvider for CachedDataProvider {
    async fn load_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Arc<Vec<Bar>>, DataError> {
        let symbol = symbol.trim().to_uppercase();
        let Some(source) = &self.source else {
            return Ok(Arc::new(synthetic::series(&symbol, start, end)));
        };

        let key = (symbol.clone(), start, end);
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    debug!(%symbol, "market data cache hit");
                    return Ok(entry.bars.clone());
                }
            }
        }

        match source.fetch(&symbol, start, end).await {
            Ok(bars) if !bars.is_empty() => {
                let bars = Arc::new(bars);
                let mut cache = self.cache.lock().await;
                let ttl = self.ttl;
                cache.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
                cache.insert(
                    key,
                    CacheEntry {
                        fetched_at: Instant::now(),
                        bars: bars.clone(),
                    },
                );
                Ok(bars)
            }
            Ok(_) => {
                warn!(%symbol, "live source returned no rows, using synthetic series");
                Ok(Arc::new(synthetic::series(&symbol, start, end)))
            }
            Err(e) => {
                warn!(%symbol, error = %e, "live source unavailable, using synthetic series");
                Ok(Arc::new(synthetic::series(&symbol, start, end)))
            }
        }
    }
}

/// Write bars as `date,open,high,low,close,volume` CSV.
pub fn write_csv(path: &Path, bars: &[Bar]) -> std::io::Result<()> {
    let mut out = String::from("date,open,high,low,close,volume\n");
    for b in bars {
        out.push_str(&format!(
            "{},{:.4},{:.4},{:.4},{:.4},{:.0}\n",
            b.date.format("%Y-%m-%d"),
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume
        ));
    }
    std::fs::write(path, out)
}

//! Deterministic synthetic OHLCV series.
//!
//! Seeded from the CRC32 of the symbol, so the same (symbol, range) always
//! yields the same bars. Weekends are skipped.

use chrono::{Datelike, NaiveDate, Weekday};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::Bar;

/// Business-day series for `symbol` over `start..=end`.
pub fn series(symbol: &str, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    let seed = crc32fast::hash(symbol.to_uppercase().as_bytes()) as u64;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut close = 50.0 + (seed % 400) as f64;
    let mut bars = Vec::new();

    let mut day = start;
    while day <= end {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            let open = close;
            let change = (rng.random::<f64>() - 0.5) * 0.04;
            close = (open * (1.0 + change)).max(0.01);
            let high = open.max(close) * (1.0 + rng.random::<f64>() * 0.01);
            let low = open.min(close) * (1.0 - rng.random::<f64>() * 0.01);
            let volume = 1_000_000.0 + rng.random_range(0.0..500_000.0_f64).floor();
            bars.push(Bar {
                date: day,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    bars
}

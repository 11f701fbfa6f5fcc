use chrono::DateTime;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use qb_types::{Bar, Timeframe};

/// Aggregate bars into a coarser timeframe.
///
/// Bars are bucketed by flooring their timestamp to the target resolution;
/// each bucket keeps the first open, highest high, lowest low, last close,
/// and summed volume. Input must be sorted by timestamp (the data handler
/// validates this before calling).
pub fn resample_bars(bars: &[Bar], target: Timeframe) -> Vec<Bar> {
    let step = target.to_seconds() as i64;
    let mut buckets: BTreeMap<i64, Vec<&Bar>> = BTreeMap::new();
    for bar in bars {
        let bucket = bar.timestamp.timestamp().div_euclid(step) * step;
        buckets.entry(bucket).or_default().push(bar);
    }

    buckets
        .into_iter()
        .filter_map(|(start, members)| {
            let timestamp = DateTime::from_timestamp(start, 0)?;
            let first = members.first()?;
            let last = members.last()?;
            let high = members.iter().map(|b| b.high).max()?;
            let low = members.iter().map(|b| b.low).min()?;
            let volume: Decimal = members.iter().map(|b| b.volume).sum();
            Some(Bar::new(
                first.symbol.clone(),
                timestamp,
                first.open,
                high,
                low,
                last.close,
                volume,
                target,
            ))
        })
        .collect()
}

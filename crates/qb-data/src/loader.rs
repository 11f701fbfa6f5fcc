use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{info, warn};

use qb_types::{Bar, DataError, DataSourceSpec, PriceColumns, Timeframe};

/// Timestamp column candidates tried when the source does not configure one.
const TIMESTAMP_CANDIDATES: &[&str] = &["timestamp", "date", "time", "datetime"];

/// Fallback formats tried in order when the source does not configure one.
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"];

/// A loaded per-symbol series plus the count of rows dropped during parsing.
#[derive(Debug, Clone)]
pub struct LoadedSeries {
    pub symbol: String,
    pub bars: Vec<Bar>,
    pub dropped_rows: u64,
}

/// CSV bar loader with case-insensitive header resolution.
///
/// Missing required logical columns are fatal before any bar is produced;
/// malformed body rows are dropped with a recorded count and the load
/// continues.
#[derive(Debug, Clone)]
pub struct CsvBarLoader {
    timeframe: Timeframe,
}

struct ColumnIndexes {
    timestamp: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: Option<usize>,
}

impl CsvBarLoader {
    pub fn new(timeframe: Timeframe) -> Self {
        Self { timeframe }
    }

    pub fn load(&self, spec: &DataSourceSpec) -> Result<LoadedSeries, DataError> {
        let file = spec.file.display().to_string();
        let mut reader = csv::Reader::from_path(&spec.file).map_err(|e| DataError::LoadFailed {
            file: file.clone(),
            message: e.to_string(),
        })?;

        let headers = reader
            .headers()
            .map_err(|e| DataError::LoadFailed {
                file: file.clone(),
                message: e.to_string(),
            })?
            .clone();

        let columns = resolve_columns(&headers, spec, &file)?;

        let mut bars = Vec::new();
        let mut dropped_rows = 0u64;

        for (row, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!(%file, row, %err, "dropping unreadable row");
                    dropped_rows += 1;
                    continue;
                }
            };

            match self.parse_row(&record, &columns, spec) {
                Ok(bar) => bars.push(bar),
                Err(message) => {
                    warn!(%file, row, %message, "dropping malformed row");
                    dropped_rows += 1;
                }
            }
        }

        if bars.is_empty() {
            return Err(DataError::EmptySeries {
                symbol: spec.symbol.clone(),
            });
        }

        bars.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        info!(
            symbol = %spec.symbol,
            %file,
            loaded = bars.len(),
            dropped = dropped_rows,
            "loaded CSV series"
        );

        Ok(LoadedSeries {
            symbol: spec.symbol.clone(),
            bars,
            dropped_rows,
        })
    }

    fn parse_row(
        &self,
        record: &csv::StringRecord,
        columns: &ColumnIndexes,
        spec: &DataSourceSpec,
    ) -> Result<Bar, String> {
        let timestamp = parse_timestamp(
            field(record, columns.timestamp)?,
            spec.date_format.as_deref(),
        )?;
        let open = parse_decimal(field(record, columns.open)?)?;
        let high = parse_decimal(field(record, columns.high)?)?;
        let low = parse_decimal(field(record, columns.low)?)?;
        let close = parse_decimal(field(record, columns.close)?)?;
        let volume = match columns.volume {
            Some(idx) => parse_decimal(field(record, idx)?)?,
            None => Decimal::ZERO,
        };
        if volume < Decimal::ZERO {
            return Err(format!("negative volume {volume}"));
        }

        Ok(Bar::new(
            spec.symbol.clone(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            self.timeframe,
        ))
    }
}

fn resolve_columns(
    headers: &csv::StringRecord,
    spec: &DataSourceSpec,
    file: &str,
) -> Result<ColumnIndexes, DataError> {
    let find = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim().eq_ignore_ascii_case(name))
    };

    let timestamp = match &spec.date_column {
        Some(configured) => find(configured),
        None => TIMESTAMP_CANDIDATES.iter().find_map(|c| find(c)),
    }
    .ok_or_else(|| DataError::MissingColumn {
        column: spec.date_column.clone().unwrap_or_else(|| "timestamp".into()),
        file: file.to_string(),
    })?;

    let defaults = PriceColumns::default();
    let mapping = spec.price_columns.as_ref().unwrap_or(&defaults);
    let required = |name: &str| {
        find(name).ok_or_else(|| DataError::MissingColumn {
            column: name.to_string(),
            file: file.to_string(),
        })
    };

    Ok(ColumnIndexes {
        timestamp,
        open: required(&mapping.open)?,
        high: required(&mapping.high)?,
        low: required(&mapping.low)?,
        close: required(&mapping.close)?,
        volume: mapping.volume.as_deref().and_then(find),
    })
}

fn field<'a>(record: &'a csv::StringRecord, index: usize) -> Result<&'a str, String> {
    record
        .get(index)
        .map(str::trim)
        .ok_or_else(|| format!("row too short for column {index}"))
}

fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw).map_err(|e| format!("bad number {raw:?}: {e}"))
}

fn parse_timestamp(raw: &str, format: Option<&str>) -> Result<DateTime<Utc>, String> {
    if let Some(format) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(dt.and_utc());
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc());
        }
        return Err(format!("timestamp {raw:?} does not match {format:?}"));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for candidate in TIMESTAMP_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, candidate) {
            return Ok(dt.and_utc());
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, candidate) {
            return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc());
        }
    }
    Err(format!("unrecognized timestamp {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn spec_for(file: &tempfile::NamedTempFile) -> DataSourceSpec {
        DataSourceSpec {
            symbol: "X".into(),
            file: file.path().to_path_buf(),
            date_column: None,
            date_format: None,
            price_columns: None,
        }
    }

    #[test]
    fn loads_well_formed_csv() {
        let file = write_csv(
            "Date,Open,High,Low,Close,Volume\n\
             2024-01-02,10,11,9,10.5,1000\n\
             2024-01-01,9,10,8,9.5,900\n",
        );
        let series = CsvBarLoader::new(Timeframe::Day).load(&spec_for(&file)).unwrap();

        assert_eq!(series.bars.len(), 2);
        assert_eq!(series.dropped_rows, 0);
        // Sorted by timestamp regardless of file order.
        assert_eq!(series.bars[0].close, dec!(9.5));
        assert_eq!(series.bars[1].close, dec!(10.5));
        assert_eq!(series.bars[0].symbol, "X");
    }

    #[test]
    fn headers_match_case_insensitively() {
        let file = write_csv(
            "TIMESTAMP,OPEN,HIGH,LOW,CLOSE\n\
             2024-01-01,1,2,0.5,1.5\n",
        );
        let series = CsvBarLoader::new(Timeframe::Day).load(&spec_for(&file)).unwrap();
        assert_eq!(series.bars.len(), 1);
        // Missing volume column defaults to zero.
        assert_eq!(series.bars[0].volume, Decimal::ZERO);
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let file = write_csv("date,open,high,low\n2024-01-01,1,2,0.5\n");
        let result = CsvBarLoader::new(Timeframe::Day).load(&spec_for(&file));
        assert!(matches!(
            result,
            Err(DataError::MissingColumn { column, .. }) if column == "close"
        ));
    }

    #[test]
    fn malformed_rows_are_dropped_and_counted() {
        let file = write_csv(
            "date,open,high,low,close\n\
             2024-01-01,1,2,0.5,1.5\n\
             not-a-date,1,2,0.5,1.5\n\
             2024-01-03,oops,2,0.5,1.5\n\
             2024-01-04,1,2,0.5,1.6\n",
        );
        let series = CsvBarLoader::new(Timeframe::Day).load(&spec_for(&file)).unwrap();
        assert_eq!(series.bars.len(), 2);
        assert_eq!(series.dropped_rows, 2);
    }

    #[test]
    fn custom_column_mapping_and_format() {
        let file = write_csv(
            "dt,o,h,l,c,vol\n\
             01/02/2024,10,11,9,10.5,1000\n",
        );
        let spec = DataSourceSpec {
            symbol: "X".into(),
            file: file.path().to_path_buf(),
            date_column: Some("dt".into()),
            date_format: Some("%m/%d/%Y".into()),
            price_columns: Some(PriceColumns {
                open: "o".into(),
                high: "h".into(),
                low: "l".into(),
                close: "c".into(),
                volume: Some("vol".into()),
            }),
        };
        let series = CsvBarLoader::new(Timeframe::Day).load(&spec).unwrap();
        assert_eq!(series.bars.len(), 1);
        assert_eq!(series.bars[0].volume, dec!(1000));
    }

    #[test]
    fn empty_body_is_an_error() {
        let file = write_csv("date,open,high,low,close\n");
        let result = CsvBarLoader::new(Timeframe::Day).load(&spec_for(&file));
        assert!(matches!(result, Err(DataError::EmptySeries { .. })));
    }
}

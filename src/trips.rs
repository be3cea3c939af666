//! Raw trip log loading and per-bucket aggregation.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::series::{Granularity, Observation};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRecord {
    pub started_at_ms_utc: i64,
    pub station: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripLoadConfig {
    pub timestamp_column: String,
    pub station_column: String,
    /// Zone used for timestamps that carry no offset.
    pub source_timezone: Tz,
}

impl Default for TripLoadConfig {
    fn default() -> Self {
        Self {
            timestamp_column: "starttime".to_string(),
            station_column: "start_station_name".to_string(),
            source_timezone: chrono_tz::America::New_York,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TripLoadReport {
    pub files: Vec<PathBuf>,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub rows_dropped: u64,
}

#[derive(Debug, Error)]
pub enum TripLoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("trip file is missing required column '{column}'")]
    MissingColumn { column: String },
    #[error("no trip files for {year} under {dir}")]
    NoFiles { dir: PathBuf, year: i32 },
}

/// Loads every `{year}-*.csv` / `{year}-*.zip` file in `dir`, in file-name order.
pub fn load_trip_files(
    dir: &Path,
    year: i32,
    cfg: &TripLoadConfig,
) -> Result<(Vec<TripRecord>, TripLoadReport), TripLoadError> {
    let files = list_trip_files(dir, year)?;
    if files.is_empty() {
        return Err(TripLoadError::NoFiles {
            dir: dir.to_path_buf(),
            year,
        });
    }

    info!(
        component = "trips",
        event = "trips.load.start",
        dir = %dir.display(),
        year,
        file_count = files.len()
    );

    let mut report = TripLoadReport::default();
    let mut trips = Vec::new();
    for path in files {
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        let loaded = if is_zip {
            let csv_buf = read_zip_csv_entry(&path)?;
            load_trip_csv(Cursor::new(csv_buf), cfg, &mut report)?
        } else {
            load_trip_csv(fs::File::open(&path)?, cfg, &mut report)?
        };
        debug!(
            component = "trips",
            event = "trips.file.loaded",
            path = %path.display(),
            rows = loaded.len()
        );
        trips.extend(loaded);
        report.files.push(path);
    }

    info!(
        component = "trips",
        event = "trips.load.finish",
        rows_read = report.rows_read,
        rows_kept = report.rows_kept,
        rows_dropped = report.rows_dropped
    );

    Ok((trips, report))
}

/// Parses one trip CSV. Rows with an unparseable start time or an empty
/// station are dropped and counted, not treated as errors.
pub fn load_trip_csv<R: Read>(
    reader: R,
    cfg: &TripLoadConfig,
    report: &mut TripLoadReport,
) -> Result<Vec<TripRecord>, TripLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
    let ts_idx = column_position(&headers, &cfg.timestamp_column)?;
    let station_idx = column_position(&headers, &cfg.station_column)?;

    let mut out = Vec::new();
    let dropped_at_start = report.rows_dropped;
    for record in reader.records() {
        let record = record?;
        report.rows_read += 1;

        let station = record.get(station_idx).unwrap_or_default().trim();
        let started_at = record
            .get(ts_idx)
            .and_then(|raw| parse_trip_timestamp(raw, cfg.source_timezone));

        match started_at {
            Some(started_at_ms_utc) if !station.is_empty() => {
                report.rows_kept += 1;
                out.push(TripRecord {
                    started_at_ms_utc,
                    station: station.to_string(),
                });
            }
            _ => report.rows_dropped += 1,
        }
    }

    let dropped = report.rows_dropped - dropped_at_start;
    if dropped > 0 {
        warn!(
            component = "trips",
            event = "trips.rows.dropped",
            dropped,
            reason = "missing_timestamp_or_station"
        );
    }

    Ok(out)
}

/// Counts trips per (bucket, station). Output is sorted bucket-major.
/// Day buckets follow local calendar dates in `tz`.
pub fn aggregate_trips(
    trips: &[TripRecord],
    granularity: Granularity,
    tz: Tz,
) -> Vec<Observation> {
    let mut counts: BTreeMap<(i64, &str), u64> = BTreeMap::new();
    for trip in trips {
        let bucket = granularity.bucket_start(trip.started_at_ms_utc, tz);
        *counts.entry((bucket, trip.station.as_str())).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .map(|((bucket, station), count)| Observation::new(bucket, station, count))
        .collect()
}

/// RFC 3339 timestamps keep their offset; naive ones are read in `tz`.
/// Local times skipped by a DST jump yield `None`; repeated ones take the earlier instant.
pub fn parse_trip_timestamp(raw: &str, tz: Tz) -> Option<i64> {
    let raw = raw.trim().trim_matches('"');
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }

    NAIVE_FORMATS.iter().find_map(|format| {
        let naive = NaiveDateTime::parse_from_str(raw, format).ok()?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp_millis())
    })
}

fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "_")
}

fn column_position(headers: &[String], column: &str) -> Result<usize, TripLoadError> {
    headers
        .iter()
        .position(|header| header == column)
        .ok_or_else(|| TripLoadError::MissingColumn {
            column: column.to_string(),
        })
}

fn list_trip_files(dir: &Path, year: i32) -> Result<Vec<PathBuf>, TripLoadError> {
    let prefix = format!("{year}-");
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_ascii_lowercase()) else {
            continue;
        };
        if name.starts_with(&prefix) && (name.ends_with(".csv") || name.ends_with(".zip")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_zip_csv_entry(path: &Path) -> Result<Vec<u8>, TripLoadError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;

    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        return Ok(buf);
    }

    Err(TripLoadError::MissingCsvEntry {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_404_172_800_000; // 2014-07-01T00:00:00Z

    #[test]
    fn naive_timestamps_are_read_in_source_zone() {
        let ts = parse_trip_timestamp("2014-07-01 00:00:00", chrono_tz::America::New_York)
            .expect("parses");
        assert_eq!(ts, T0 + 4 * 3_600_000);
        let ts = parse_trip_timestamp("7/1/2014 00:00", chrono_tz::UTC).expect("parses");
        assert_eq!(ts, T0);
    }

    #[test]
    fn offset_timestamps_keep_their_offset() {
        let ts = parse_trip_timestamp("2014-07-01T02:00:00+02:00", chrono_tz::America::New_York)
            .expect("parses");
        assert_eq!(ts, T0);
    }

    #[test]
    fn garbage_timestamps_are_rejected() {
        assert_eq!(parse_trip_timestamp("", chrono_tz::UTC), None);
        assert_eq!(parse_trip_timestamp("not a time", chrono_tz::UTC), None);
    }

    #[test]
    fn headers_are_normalized_and_bad_rows_dropped() {
        let body = "Trip Duration, StartTime ,Start Station Name\n\
                    634,2014-07-01 00:10:00,W 21 St & 6 Ave\n\
                    100,,Broadway & W 60 St\n\
                    200,2014-07-01 00:20:00,\n\
                    300,2014-07-01 00:59:59,W 21 St & 6 Ave\n";
        let cfg = TripLoadConfig {
            source_timezone: chrono_tz::UTC,
            ..TripLoadConfig::default()
        };
        let mut report = TripLoadReport::default();
        let trips = load_trip_csv(body.as_bytes(), &cfg, &mut report).expect("loads");

        assert_eq!(trips.len(), 2);
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.rows_kept, 2);
        assert_eq!(report.rows_dropped, 2);

        let obs = aggregate_trips(&trips, Granularity::Hour, chrono_tz::UTC);
        assert_eq!(obs, vec![Observation::new(T0, "W 21 St & 6 Ave", 2)]);
    }

    #[test]
    fn missing_station_column_is_an_error() {
        let body = "starttime,end_station_name\n2014-07-01 00:10:00,X\n";
        let mut report = TripLoadReport::default();
        let err = load_trip_csv(body.as_bytes(), &TripLoadConfig::default(), &mut report)
            .expect_err("must fail");
        assert!(matches!(err, TripLoadError::MissingColumn { column } if column == "start_station_name"));
    }
}

//! Per-station sliding lag windows and their named-column table form.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::series::DenseSeries;

pub const DEFAULT_LAG_PREFIX: &str = "rides";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub window_size: usize,
    pub step_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 28 * 24,
            step_size: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRow {
    pub entity_id: String,
    pub anchor_ts_ms_utc: i64,
    /// Oldest first, most recent last.
    pub lag_values: Vec<u64>,
    pub target: u64,
}

/// A window whose target bucket has not been observed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastWindow {
    pub entity_id: String,
    pub anchor_ts_ms_utc: i64,
    pub lag_values: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowReport {
    pub entity_count: u64,
    pub skipped_entities: Vec<String>,
    pub output_rows: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid window configuration: window_size={window_size} step_size={step_size}; both must be >= 1")]
    InvalidWindowSize {
        window_size: usize,
        step_size: usize,
    },
    #[error("lag table row for {entity_id} at {anchor_ts_ms_utc} has {found} values, expected {expected}")]
    RowWidthMismatch {
        entity_id: String,
        anchor_ts_ms_utc: i64,
        found: usize,
        expected: usize,
    },
}

pub trait LagWindow {
    fn entity_id(&self) -> &str;
    fn anchor_ts_ms_utc(&self) -> i64;
    fn lag_values(&self) -> &[u64];
    fn target(&self) -> Option<u64>;
}

impl LagWindow for WindowRow {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn anchor_ts_ms_utc(&self) -> i64 {
        self.anchor_ts_ms_utc
    }

    fn lag_values(&self) -> &[u64] {
        &self.lag_values
    }

    fn target(&self) -> Option<u64> {
        Some(self.target)
    }
}

impl LagWindow for ForecastWindow {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn anchor_ts_ms_utc(&self) -> i64 {
        self.anchor_ts_ms_utc
    }

    fn lag_values(&self) -> &[u64] {
        &self.lag_values
    }

    fn target(&self) -> Option<u64> {
        None
    }
}

pub fn validate_window_config(cfg: &WindowConfig) -> Result<(), WindowError> {
    if cfg.window_size < 1 || cfg.step_size < 1 {
        return Err(WindowError::InvalidWindowSize {
            window_size: cfg.window_size,
            step_size: cfg.step_size,
        });
    }
    Ok(())
}

/// Emits every complete window of `window_size` lags plus the following target,
/// independently per entity, with window starts `step_size` buckets apart.
///
/// Entities with no more than `window_size` buckets contribute nothing.
pub fn generate_lag_windows(
    series: &DenseSeries,
    cfg: &WindowConfig,
) -> Result<(Vec<WindowRow>, WindowReport), WindowError> {
    validate_window_config(cfg)?;

    let w = cfg.window_size;
    let mut report = WindowReport::default();
    let mut out = Vec::new();

    for (entity_id, seq) in series.partition_by_entity() {
        report.entity_count += 1;
        if seq.len() <= w {
            debug!(
                component = "windows",
                event = "windows.entity.skipped",
                entity_id = entity_id.as_str(),
                buckets = seq.len(),
                window_size = w
            );
            report.skipped_entities.push(entity_id);
            continue;
        }

        let mut start = 0;
        while start + w < seq.len() {
            let (anchor_ts, target) = seq[start + w];
            out.push(WindowRow {
                entity_id: entity_id.clone(),
                anchor_ts_ms_utc: anchor_ts,
                lag_values: seq[start..start + w].iter().map(|(_, c)| *c).collect(),
                target,
            });
            start += cfg.step_size;
        }
    }

    report.output_rows = out.len() as u64;

    info!(
        component = "windows",
        event = "windows.generate.finish",
        window_size = cfg.window_size,
        step_size = cfg.step_size,
        entity_count = report.entity_count,
        skipped_entities = report.skipped_entities.len(),
        output_rows = report.output_rows
    );

    Ok((out, report))
}

/// For each entity with at least `window_size` buckets, the most recent
/// `window_size` values anchored one bucket past the end of the series.
pub fn latest_forecast_windows(
    series: &DenseSeries,
    window_size: usize,
) -> Result<Vec<ForecastWindow>, WindowError> {
    validate_window_config(&WindowConfig {
        window_size,
        step_size: 1,
    })?;

    let step = series.granularity().step_ms();
    let mut out = Vec::new();
    for (entity_id, seq) in series.partition_by_entity() {
        if seq.len() < window_size {
            debug!(
                component = "windows",
                event = "windows.forecast.skipped",
                entity_id = entity_id.as_str(),
                buckets = seq.len(),
                window_size
            );
            continue;
        }
        let tail = &seq[seq.len() - window_size..];
        let last_ts = tail[tail.len() - 1].0;
        out.push(ForecastWindow {
            entity_id,
            anchor_ts_ms_utc: last_ts + step,
            lag_values: tail.iter().map(|(_, c)| *c).collect(),
        });
    }

    Ok(out)
}

pub fn lag_column_name(prefix: &str, lag: usize) -> String {
    format!("{prefix}_t-{lag}")
}

/// Column names for a window of `window_size` lags, oldest first.
pub fn lag_column_names(prefix: &str, window_size: usize) -> Vec<String> {
    (0..window_size)
        .map(|i| lag_column_name(prefix, window_size - i))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagTableRow {
    pub entity_id: String,
    pub anchor_ts_ms_utc: i64,
    pub values: Vec<f64>,
    pub target: Option<f64>,
}

/// Window rows keyed by named lag columns, the shape exchanged with the store
/// and consumed by the augmenter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagTable {
    columns: Vec<String>,
    rows: Vec<LagTableRow>,
}

impl LagTable {
    pub fn new(columns: Vec<String>, rows: Vec<LagTableRow>) -> Result<Self, WindowError> {
        for row in &rows {
            if row.values.len() != columns.len() {
                return Err(WindowError::RowWidthMismatch {
                    entity_id: row.entity_id.clone(),
                    anchor_ts_ms_utc: row.anchor_ts_ms_utc,
                    found: row.values.len(),
                    expected: columns.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    /// Fails on the first window whose width is not `window_size`.
    pub fn from_windows<W: LagWindow>(
        prefix: &str,
        window_size: usize,
        windows: &[W],
    ) -> Result<Self, WindowError> {
        let rows = windows
            .iter()
            .map(|window| LagTableRow {
                entity_id: window.entity_id().to_string(),
                anchor_ts_ms_utc: window.anchor_ts_ms_utc(),
                values: window.lag_values().iter().map(|v| *v as f64).collect(),
                target: window.target().map(|t| t as f64),
            })
            .collect();

        Self::new(lag_column_names(prefix, window_size), rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[LagTableRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<LagTableRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Same columns, different rows.
    pub fn with_rows(&self, rows: Vec<LagTableRow>) -> Result<Self, WindowError> {
        Self::new(self.columns.clone(), rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::{fill_missing_buckets, Granularity, Observation};

    const T0: i64 = 1_404_172_800_000;
    const HOUR_MS: i64 = 3_600_000;

    fn series_of(entity: &str, counts: &[u64]) -> Vec<Observation> {
        counts
            .iter()
            .enumerate()
            .map(|(i, c)| Observation::new(T0 + i as i64 * HOUR_MS, entity, *c))
            .collect()
    }

    #[test]
    fn ten_buckets_window_four_step_one_yields_six_rows() {
        let counts: Vec<u64> = (0..10).collect();
        let series =
            fill_missing_buckets(Granularity::Hour, &series_of("A", &counts)).expect("fill");
        let cfg = WindowConfig {
            window_size: 4,
            step_size: 1,
        };

        let (rows, report) = generate_lag_windows(&series, &cfg).expect("windows");
        assert_eq!(rows.len(), 6);
        assert_eq!(report.output_rows, 6);
        for (i, row) in rows.iter().enumerate() {
            let start = i as u64;
            assert_eq!(row.lag_values, vec![start, start + 1, start + 2, start + 3]);
            assert_eq!(row.target, start + 4);
            assert_eq!(row.anchor_ts_ms_utc, T0 + (i as i64 + 4) * HOUR_MS);
        }
    }

    #[test]
    fn step_size_skips_window_starts() {
        let counts: Vec<u64> = (0..10).collect();
        let series =
            fill_missing_buckets(Granularity::Hour, &series_of("A", &counts)).expect("fill");
        let cfg = WindowConfig {
            window_size: 4,
            step_size: 3,
        };

        let (rows, _) = generate_lag_windows(&series, &cfg).expect("windows");
        let starts: Vec<u64> = rows.iter().map(|row| row.lag_values[0]).collect();
        assert_eq!(starts, vec![0, 3]);
    }

    #[test]
    fn short_entities_are_skipped_not_fatal() {
        let mut input = series_of("A", &[1, 2, 3]);
        input.extend(series_of("B", &[4, 5, 6]));
        let series = fill_missing_buckets(Granularity::Hour, &input).expect("fill");
        let cfg = WindowConfig {
            window_size: 3,
            step_size: 1,
        };

        let (rows, report) = generate_lag_windows(&series, &cfg).expect("windows");
        assert!(rows.is_empty());
        assert_eq!(report.skipped_entities, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn zero_window_or_step_is_rejected() {
        let series = fill_missing_buckets(Granularity::Hour, &series_of("A", &[1, 2])).expect("fill");
        for (window_size, step_size) in [(0, 1), (1, 0)] {
            let err = generate_lag_windows(
                &series,
                &WindowConfig {
                    window_size,
                    step_size,
                },
            )
            .expect_err("must fail");
            assert_eq!(
                err,
                WindowError::InvalidWindowSize {
                    window_size,
                    step_size
                }
            );
        }
    }

    #[test]
    fn forecast_window_anchors_past_last_bucket() {
        let series =
            fill_missing_buckets(Granularity::Hour, &series_of("A", &[1, 2, 3, 4, 5])).expect("fill");
        let windows = latest_forecast_windows(&series, 3).expect("forecast windows");
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].lag_values, vec![3, 4, 5]);
        assert_eq!(windows[0].anchor_ts_ms_utc, T0 + 5 * HOUR_MS);
    }

    #[test]
    fn lag_columns_are_oldest_first() {
        assert_eq!(
            lag_column_names("rides", 3),
            vec!["rides_t-3", "rides_t-2", "rides_t-1"]
        );
    }

    #[test]
    fn lag_table_rejects_ragged_rows() {
        let err = LagTable::new(
            lag_column_names("rides", 2),
            vec![LagTableRow {
                entity_id: "A".to_string(),
                anchor_ts_ms_utc: T0,
                values: vec![1.0],
                target: None,
            }],
        )
        .expect_err("must fail");
        assert!(matches!(err, WindowError::RowWidthMismatch { found: 1, expected: 2, .. }));
    }

    #[test]
    fn from_windows_fails_on_short_window() {
        let windows = vec![
            ForecastWindow {
                entity_id: "A".to_string(),
                anchor_ts_ms_utc: T0,
                lag_values: vec![1, 2, 3],
            },
            ForecastWindow {
                entity_id: "B".to_string(),
                anchor_ts_ms_utc: T0,
                lag_values: vec![1, 2],
            },
        ];
        let err = LagTable::from_windows("rides", 3, &windows).expect_err("must fail");
        assert_eq!(
            err,
            WindowError::RowWidthMismatch {
                entity_id: "B".to_string(),
                anchor_ts_ms_utc: T0,
                found: 2,
                expected: 3,
            }
        );
    }
}

//! Rollup and calendar features on top of named lag columns.
//!
//! The augmenter is the last transform before a model sees the data. It adds
//! the four-week rollup average and the anchor's hour-of-day / day-of-week, and
//! drops the station and anchor identifiers from the model columns. Both are
//! kept alongside as provenance so predictions can be joined back.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info};

use crate::series::Granularity;
use crate::windows::{lag_column_name, LagTable, DEFAULT_LAG_PREFIX};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const ROLLUP_WEEKS: usize = 4;
pub const HOUR_COLUMN: &str = "hour";
pub const DAY_OF_WEEK_COLUMN: &str = "day_of_week";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKey {
    pub entity_id: String,
    pub anchor_ts_ms_utc: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    /// Not model inputs.
    pub keys: Vec<RowKey>,
    pub targets: Vec<Option<f64>>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.schema.column_index(name)?;
        Some(self.rows.iter().map(|row| row.values[idx]).collect())
    }

    /// Targets for every row, or `None` if any row is unlabeled.
    pub fn labeled_targets(&self) -> Option<Vec<f64>> {
        self.targets.iter().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentConfig {
    pub lag_prefix: String,
    pub granularity: Granularity,
    pub calendar_timezone: Tz,
    pub schema_version: u32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            lag_prefix: DEFAULT_LAG_PREFIX.to_string(),
            granularity: Granularity::Hour,
            calendar_timezone: Tz::UTC,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl AugmentConfig {
    pub fn rollup_column(&self) -> String {
        format!("average_{}_last_{ROLLUP_WEEKS}_weeks", self.lag_prefix)
    }

    /// Lag columns exactly 1..=4 weeks before the anchor, nearest week first.
    pub fn weekly_lag_columns(&self) -> Vec<String> {
        let per_week = self.granularity.buckets_per_week();
        (1..=ROLLUP_WEEKS)
            .map(|week| lag_column_name(&self.lag_prefix, week * per_week))
            .collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AugmentError {
    #[error("missing required lag column: {column}")]
    MissingColumn { column: String },
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn build_feature_schema(lag_columns: &[String], cfg: &AugmentConfig) -> FeatureSchema {
    let mut columns: Vec<FeatureColumn> = lag_columns
        .iter()
        .map(|name| FeatureColumn {
            name: name.clone(),
            dtype: FeatureDType::F64,
        })
        .collect();
    for name in [
        cfg.rollup_column(),
        HOUR_COLUMN.to_string(),
        DAY_OF_WEEK_COLUMN.to_string(),
    ] {
        columns.push(FeatureColumn {
            name,
            dtype: FeatureDType::F64,
        });
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "augment",
        event = "augment.schema.built",
        version = cfg.schema_version,
        granularity = cfg.granularity.as_str(),
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn augment(table: &LagTable, cfg: &AugmentConfig) -> Result<FeatureTable, AugmentError> {
    let weekly_idx = weekly_lag_indices(table, cfg)?;
    let schema = build_feature_schema(table.columns(), cfg);

    // day buckets are already labelled with their local date
    let calendar_tz = match cfg.granularity {
        Granularity::Hour => cfg.calendar_timezone,
        Granularity::Day => chrono_tz::UTC,
    };

    let mut rows = Vec::with_capacity(table.len());
    let mut keys = Vec::with_capacity(table.len());
    let mut targets = Vec::with_capacity(table.len());

    for row in table.rows() {
        let rollup =
            weekly_idx.iter().map(|idx| row.values[*idx]).sum::<f64>() / weekly_idx.len() as f64;
        let (hour, day_of_week) = calendar_fields(row.anchor_ts_ms_utc, calendar_tz)?;

        let mut values = Vec::with_capacity(schema.columns.len());
        values.extend_from_slice(&row.values);
        values.push(rollup);
        values.push(hour as f64);
        values.push(day_of_week as f64);

        rows.push(FeatureRow { values });
        keys.push(RowKey {
            entity_id: row.entity_id.clone(),
            anchor_ts_ms_utc: row.anchor_ts_ms_utc,
        });
        targets.push(row.target);
    }

    info!(
        component = "augment",
        event = "augment.finish",
        rows = rows.len(),
        column_count = schema.columns.len()
    );

    Ok(FeatureTable {
        schema,
        rows,
        keys,
        targets,
    })
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), AugmentError> {
    if expected_version != actual.version {
        return Err(AugmentError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(AugmentError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Hour of day (0-23) and day of week (Monday = 0) of the anchor in `tz`.
pub fn calendar_fields(ts_ms_utc: i64, tz: Tz) -> Result<(u32, u32), AugmentError> {
    let dt = Utc
        .timestamp_millis_opt(ts_ms_utc)
        .single()
        .ok_or(AugmentError::InvalidTimestamp(ts_ms_utc))?
        .with_timezone(&tz);
    Ok((dt.hour(), dt.weekday().num_days_from_monday()))
}

fn weekly_lag_indices(table: &LagTable, cfg: &AugmentConfig) -> Result<Vec<usize>, AugmentError> {
    cfg.weekly_lag_columns()
        .into_iter()
        .map(|column| match table.column_index(&column) {
            Some(idx) => Ok(idx),
            None => {
                error!(
                    component = "augment",
                    event = "augment.missing_column",
                    column = column.as_str(),
                    available_columns = table.columns().len()
                );
                Err(AugmentError::MissingColumn { column })
            }
        })
        .collect()
}

fn schema_fingerprint(cfg: &AugmentConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("granularity:{};", cfg.granularity.as_str()));
    hasher.update(format!("calendar_tz:{};", cfg.calendar_timezone.name()));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

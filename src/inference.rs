//! Batch scoring of the freshest lag windows per station.

use std::cmp::Ordering;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::augment::{assert_schema_compatible, augment, AugmentConfig, AugmentError, FeatureTable};
use crate::model::{DemandModel, ModelError};
use crate::series::{DenseSeries, Granularity};
use crate::windows::{
    generate_lag_windows, latest_forecast_windows, LagTable, LagWindow, WindowConfig, WindowError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub entity_id: String,
    pub target_ts_ms_utc: i64,
    pub predicted_demand: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// `step_size` applies only to historical backfill scoring.
    pub window: WindowConfig,
    pub augment: AugmentConfig,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Augment(#[from] AugmentError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model {model} returned {returned} predictions for {expected} rows")]
    PredictionCount {
        model: String,
        expected: usize,
        returned: usize,
    },
}

/// History range `[start, end)` needed to forecast the bucket containing `now`:
/// the window plus one bucket of slack, ending at the last completed bucket.
/// `tz` decides which local day `now` falls on for day buckets.
pub fn fetch_range_for(
    now_ts_ms_utc: i64,
    granularity: Granularity,
    tz: Tz,
    window_size: usize,
) -> (i64, i64) {
    let end_exclusive = granularity.bucket_start(now_ts_ms_utc, tz);
    let start = end_exclusive - (window_size as i64 + 1) * granularity.step_ms();
    (start, end_exclusive)
}

/// Forecasts the bucket right after the series ends, for every station with a
/// full window of history.
pub fn predict_next_buckets(
    series: &DenseSeries,
    model: &dyn DemandModel,
    cfg: &InferenceConfig,
) -> Result<Vec<Prediction>, InferenceError> {
    let windows = latest_forecast_windows(series, cfg.window.window_size)?;
    score_windows(&windows, model, cfg)
}

/// Scores historical windows taken `step_size` buckets apart.
pub fn backfill_predictions(
    series: &DenseSeries,
    model: &dyn DemandModel,
    cfg: &InferenceConfig,
) -> Result<Vec<Prediction>, InferenceError> {
    let (windows, _report) = generate_lag_windows(series, &cfg.window)?;
    score_windows(&windows, model, cfg)
}

pub fn score_windows<W: LagWindow>(
    windows: &[W],
    model: &dyn DemandModel,
    cfg: &InferenceConfig,
) -> Result<Vec<Prediction>, InferenceError> {
    if windows.is_empty() {
        info!(
            component = "inference",
            event = "inference.no_windows",
            window_size = cfg.window.window_size
        );
        return Ok(Vec::new());
    }

    let table = LagTable::from_windows(&cfg.augment.lag_prefix, cfg.window.window_size, windows)?;
    let features = augment(&table, &cfg.augment)?;
    score_features(&features, model)
}

pub fn score_features(
    features: &FeatureTable,
    model: &dyn DemandModel,
) -> Result<Vec<Prediction>, InferenceError> {
    if let Some(trained) = model.trained_schema() {
        if let Err(err) = assert_schema_compatible(trained.version, &trained.fingerprint, &features.schema)
        {
            error!(
                component = "inference",
                event = "inference.schema_mismatch",
                model = model.name(),
                expected_fingerprint = %trained.fingerprint,
                actual_fingerprint = %features.schema.fingerprint
            );
            return Err(err.into());
        }
    }

    let raw = model.predict(features)?;
    if raw.len() != features.len() {
        return Err(InferenceError::PredictionCount {
            model: model.name().to_string(),
            expected: features.len(),
            returned: raw.len(),
        });
    }

    let predictions: Vec<Prediction> = features
        .keys
        .iter()
        .zip(raw)
        .map(|(key, value)| Prediction {
            entity_id: key.entity_id.clone(),
            target_ts_ms_utc: key.anchor_ts_ms_utc,
            predicted_demand: whole_rides(value),
        })
        .collect();

    info!(
        component = "inference",
        event = "inference.scored",
        model = model.name(),
        predictions = predictions.len()
    );

    Ok(predictions)
}

/// Highest predicted demand first; ties broken by station id.
pub fn top_stations(predictions: &[Prediction], n: usize) -> Vec<Prediction> {
    let mut sorted = predictions.to_vec();
    sorted.sort_by(|a, b| match b.predicted_demand.cmp(&a.predicted_demand) {
        Ordering::Equal => a.entity_id.cmp(&b.entity_id),
        other => other,
    });
    sorted.truncate(n);
    sorted
}

fn whole_rides(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

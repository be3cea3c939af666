//! End-to-end stages: trips -> store, store -> evaluated model card, store -> predictions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::augment::{augment, AugmentError, FeatureTable};
use crate::config::{ConfigError, PipelineConfig};
use crate::inference::{
    backfill_predictions, fetch_range_for, predict_next_buckets, InferenceError, Prediction,
};
use crate::model::{
    mean_absolute_error, BoundModel, DemandModel, ModelCard, ModelError, RollupBaselineModel,
};
use crate::series::{fill_missing_buckets, DenseSeries, SeriesError};
use crate::split::{split_lag_table, SplitError};
use crate::store::{DemandStore, StoreError};
use crate::trips::{aggregate_trips, load_trip_files, TripLoadError, TripLoadReport};
use crate::windows::{generate_lag_windows, LagTable, WindowError, WindowReport, WindowRow};

pub const MAE_METRIC: &str = "test_mae";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Trips(#[from] TripLoadError),
    #[error(transparent)]
    Series(#[from] SeriesError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Augment(#[from] AugmentError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("feature table has unlabeled rows; cannot evaluate")]
    Unlabeled,
    #[error("store holds no {granularity} series yet")]
    NoStoredSeries { granularity: &'static str },
}

impl PipelineError {
    /// Empty partitions, including no windows at all for lack of history, only
    /// mean the cutoff or the data range needs adjusting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Split(SplitError::EmptySplit { .. } | SplitError::EmptyInput)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTables {
    pub cutoff_ts_ms_utc: i64,
    pub train: FeatureTable,
    pub test: FeatureTable,
    pub train_targets: Vec<f64>,
    pub test_targets: Vec<f64>,
    pub report: WindowReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRunReport {
    pub trips: TripLoadReport,
    pub observations: usize,
    pub dense_rows: usize,
    pub entities: usize,
}

/// Windows the series, splits by the configured cutoff and augments both sides.
pub fn build_training_tables(
    series: &DenseSeries,
    cfg: &PipelineConfig,
) -> Result<TrainingTables, PipelineError> {
    let (windows, report) = generate_lag_windows(series, &cfg.train_window())?;
    tables_from_windows(&windows, report, cfg)
}

pub(crate) fn tables_from_windows(
    windows: &[WindowRow],
    report: WindowReport,
    cfg: &PipelineConfig,
) -> Result<TrainingTables, PipelineError> {
    let table = LagTable::from_windows(&cfg.lag_prefix, cfg.window_size, windows)?;
    let split = split_lag_table(&table, cfg.cutoff()).map_err(|err| {
        match &err {
            SplitError::EmptySplit {
                partition,
                cutoff_ts_ms_utc,
                train_rows,
                test_rows,
            } => warn!(
                component = "pipeline",
                event = "pipeline.split.empty",
                partition = ?partition,
                cutoff_ts_ms_utc = *cutoff_ts_ms_utc,
                train_rows = *train_rows,
                test_rows = *test_rows,
                hint = "lower DEMAND_TEST_HORIZON_BUCKETS or load a longer date range"
            ),
            SplitError::EmptyInput => warn!(
                component = "pipeline",
                event = "pipeline.split.empty",
                train_rows = 0,
                test_rows = 0,
                skipped_entities = report.skipped_entities.len(),
                hint = "no station has window_size + 1 buckets; load a longer date range"
            ),
            SplitError::Table(_) => {}
        }
        PipelineError::from(err)
    })?;

    let augment_cfg = cfg.augment_config();
    let train = augment(&split.train, &augment_cfg).map_err(report_augment_error)?;
    let test = augment(&split.test, &augment_cfg).map_err(report_augment_error)?;
    let train_targets = train.labeled_targets().ok_or(PipelineError::Unlabeled)?;
    let test_targets = test.labeled_targets().ok_or(PipelineError::Unlabeled)?;

    info!(
        component = "pipeline",
        event = "pipeline.tables.built",
        cutoff_ts_ms_utc = split.cutoff_ts_ms_utc,
        train_rows = train.len(),
        test_rows = test.len(),
        skipped_entities = report.skipped_entities.len()
    );

    Ok(TrainingTables {
        cutoff_ts_ms_utc: split.cutoff_ts_ms_utc,
        train,
        test,
        train_targets,
        test_targets,
        report,
    })
}

/// Mean absolute error of `model` on the held-out side.
pub fn evaluate_model(model: &dyn DemandModel, tables: &TrainingTables) -> Result<f64, PipelineError> {
    let predicted = model.predict(&tables.test)?;
    let mae = mean_absolute_error(&tables.test_targets, &predicted)?;

    info!(
        component = "pipeline",
        event = "pipeline.model.evaluated",
        model = model.name(),
        test_rows = tables.test.len(),
        mae
    );
    Ok(mae)
}

/// Raw trips for the configured year -> dense series persisted in the store.
pub fn run_feature_pipeline(
    cfg: &PipelineConfig,
    store: &mut DemandStore,
) -> Result<FeatureRunReport, PipelineError> {
    cfg.validate()?;
    let (trips, trip_report) =
        load_trip_files(&cfg.raw_data_dir, cfg.trips_year, &cfg.trip_load_config())?;
    let observations = aggregate_trips(&trips, cfg.granularity, cfg.source_timezone);
    let series = fill_missing_buckets(cfg.granularity, &observations)?;
    store.upsert_series(&series)?;

    Ok(FeatureRunReport {
        trips: trip_report,
        observations: observations.len(),
        dense_rows: series.len(),
        entities: series.entities().len(),
    })
}

/// Stored series -> windows (persisted) -> split -> baseline evaluation -> model card.
pub fn run_model_pipeline(
    cfg: &PipelineConfig,
    store: &mut DemandStore,
    now_ts_ms_utc: i64,
) -> Result<ModelCard, PipelineError> {
    cfg.validate()?;
    let series = read_full_series(cfg, store)?;
    let (windows, report) = generate_lag_windows(&series, &cfg.train_window())?;
    store.upsert_windows(&windows)?;

    let tables = tables_from_windows(&windows, report, cfg)?;
    let model = RollupBaselineModel::new(cfg.augment_config().rollup_column());
    let mae = evaluate_model(&model, &tables)?;

    let card = ModelCard {
        model_name: model.name().to_string(),
        schema: tables.test.schema.clone(),
        metrics: BTreeMap::from([(MAE_METRIC.to_string(), mae)]),
        trained_at_ms_utc: now_ts_ms_utc,
    };
    card.save(&cfg.model_card_path)?;
    Ok(card)
}

/// Latest stored history -> next-bucket predictions, persisted and returned.
pub fn run_inference_pipeline(
    cfg: &PipelineConfig,
    store: &mut DemandStore,
    now_ts_ms_utc: i64,
) -> Result<Vec<Prediction>, PipelineError> {
    cfg.validate()?;
    let card = ModelCard::load(&cfg.model_card_path)?;
    let model = BoundModel::new(
        RollupBaselineModel::new(cfg.augment_config().rollup_column()),
        card.schema.clone(),
    );

    let (start, end_exclusive) = fetch_range_for(
        now_ts_ms_utc,
        cfg.granularity,
        cfg.source_timezone,
        cfg.window_size,
    );
    let series = store.read_series(cfg.granularity, start, end_exclusive)?;
    let predictions = predict_next_buckets(&series, &model, &cfg.inference_config())
        .map_err(report_inference_error)?;
    store.upsert_predictions(&predictions, &card.schema.fingerprint)?;

    info!(
        component = "pipeline",
        event = "pipeline.inference.finish",
        model = %card.model_name,
        fetch_start_ts_ms_utc = start,
        fetch_end_ts_ms_utc = end_exclusive,
        predictions = predictions.len()
    );
    Ok(predictions)
}

/// Scores the whole stored history with windows `inference_step_size` buckets
/// apart and persists the predictions next to the live ones.
pub fn run_backfill_pipeline(
    cfg: &PipelineConfig,
    store: &mut DemandStore,
) -> Result<Vec<Prediction>, PipelineError> {
    cfg.validate()?;
    let card = ModelCard::load(&cfg.model_card_path)?;
    let model = BoundModel::new(
        RollupBaselineModel::new(cfg.augment_config().rollup_column()),
        card.schema.clone(),
    );

    let series = read_full_series(cfg, store)?;
    let predictions = backfill_predictions(&series, &model, &cfg.inference_config())
        .map_err(report_inference_error)?;
    store.upsert_predictions(&predictions, &card.schema.fingerprint)?;

    info!(
        component = "pipeline",
        event = "pipeline.backfill.finish",
        model = %card.model_name,
        step_size = cfg.inference_step_size,
        predictions = predictions.len()
    );
    Ok(predictions)
}

fn read_full_series(cfg: &PipelineConfig, store: &DemandStore) -> Result<DenseSeries, PipelineError> {
    let latest = store
        .latest_bucket_ts(cfg.granularity)?
        .ok_or(PipelineError::NoStoredSeries {
            granularity: cfg.granularity.as_str(),
        })?;
    Ok(store.read_series(cfg.granularity, i64::MIN, latest + cfg.granularity.step_ms())?)
}

fn report_augment_error(err: AugmentError) -> PipelineError {
    if let AugmentError::MissingColumn { column } = &err {
        error!(
            component = "pipeline",
            event = "pipeline.augment.missing_column",
            column = column.as_str(),
            hint = "window size must cover four weeks of buckets"
        );
    }
    PipelineError::from(err)
}

fn report_inference_error(err: InferenceError) -> PipelineError {
    match err {
        InferenceError::Augment(inner) => report_augment_error(inner),
        other => PipelineError::from(other),
    }
}

//! Station demand forecasting core crate.
//!
//! Trip logs are bucketed into a dense per-station series, cut into lag
//! windows, split by time and augmented with rollup and calendar features.
//! Batch stages persist to SQLite; a small axum dashboard serves the latest
//! predictions.

mod augment;
mod config;
mod dashboard;
mod inference;
mod model;
mod observability;
mod pipeline;
mod series;
mod split;
mod store;
mod trips;
mod windows;

pub use augment::{
    assert_schema_compatible, augment, build_feature_schema, calendar_fields, AugmentConfig,
    AugmentError, FeatureColumn, FeatureDType, FeatureRow, FeatureSchema, FeatureTable, RowKey,
    DAY_OF_WEEK_COLUMN, FEATURE_SCHEMA_VERSION, HOUR_COLUMN, ROLLUP_WEEKS,
};
pub use config::{ConfigError, PipelineConfig};
pub use dashboard::{
    apply_query, build_snapshot, dashboard_router, render_dashboard_html, summarize,
    DashboardQuery, DashboardRow, DashboardSnapshot, DashboardSnapshotSource, DemandSummary,
    InMemorySnapshotSource, StoreSnapshotSource, DASHBOARD_HEADERS,
};
pub use inference::{
    backfill_predictions, fetch_range_for, predict_next_buckets, score_features, score_windows,
    top_stations, InferenceConfig, InferenceError, Prediction,
};
pub use model::{
    mean_absolute_error, BoundModel, DemandModel, ModelCard, ModelError, RollupBaselineModel,
};
pub use observability::{
    init_logging, log_dashboard_bind, log_snapshot_source, AppKind, LogFormat, LoggingConfig,
    LoggingInitError, RunLog, RunOutcome,
};
pub use pipeline::{
    build_training_tables, evaluate_model, run_backfill_pipeline, run_feature_pipeline,
    run_inference_pipeline, run_model_pipeline, FeatureRunReport, PipelineError, TrainingTables, MAE_METRIC,
};
pub use series::{fill_missing_buckets, parse_granularity, DenseSeries, Granularity, Observation, SeriesError};
pub use split::{
    resolve_cutoff, split_by_cutoff, split_lag_table, Anchored, Cutoff, Partition, Split,
    SplitError, TableSplit,
};
pub use store::{DemandStore, StoreError};
pub use trips::{
    aggregate_trips, load_trip_csv, load_trip_files, parse_trip_timestamp, TripLoadConfig,
    TripLoadError, TripLoadReport, TripRecord,
};
pub use windows::{
    generate_lag_windows, lag_column_name, lag_column_names, latest_forecast_windows,
    validate_window_config, ForecastWindow, LagTable, LagTableRow, LagWindow, WindowConfig,
    WindowError, WindowReport, WindowRow, DEFAULT_LAG_PREFIX,
};

//! Pipeline configuration, read from `DEMAND_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

use crate::augment::{AugmentConfig, FEATURE_SCHEMA_VERSION};
use crate::inference::InferenceConfig;
use crate::series::{parse_granularity, Granularity};
use crate::split::Cutoff;
use crate::trips::TripLoadConfig;
use crate::windows::{validate_window_config, WindowConfig, WindowError, DEFAULT_LAG_PREFIX};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub raw_data_dir: PathBuf,
    pub trips_year: i32,
    pub store_path: PathBuf,
    pub model_card_path: PathBuf,
    pub granularity: Granularity,
    pub window_size: usize,
    pub train_step_size: usize,
    pub inference_step_size: usize,
    /// Evaluation span: cutoff = latest anchor - this many buckets.
    pub test_horizon_buckets: usize,
    pub source_timezone: Tz,
    pub calendar_timezone: Tz,
    pub lag_prefix: String,
    pub dashboard_top_n: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_data_dir: PathBuf::from("data/raw"),
            trips_year: 2014,
            store_path: PathBuf::from("data/demand.sqlite"),
            model_card_path: PathBuf::from("models/model_card.json"),
            granularity: Granularity::Hour,
            window_size: 28 * 24,
            train_step_size: 1,
            inference_step_size: 1,
            test_horizon_buckets: 14 * 24,
            source_timezone: chrono_tz::America::New_York,
            calendar_timezone: chrono_tz::America::New_York,
            lag_prefix: DEFAULT_LAG_PREFIX.to_string(),
            dashboard_top_n: 10,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("test_horizon_buckets must be > 0")]
    ZeroTestHorizon,
    #[error("lag_prefix must not be empty")]
    EmptyLagPrefix,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(dir) = env_string("DEMAND_RAW_DATA_DIR") {
            cfg.raw_data_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_string("DEMAND_STORE_PATH") {
            cfg.store_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("DEMAND_MODEL_CARD_PATH") {
            cfg.model_card_path = PathBuf::from(path);
        }
        if let Some(prefix) = env_string("DEMAND_LAG_PREFIX") {
            cfg.lag_prefix = prefix;
        }
        if let Some(granularity) = env_parsed("DEMAND_GRANULARITY", parse_granularity) {
            cfg.granularity = granularity;
        }
        if let Some(year) = env_parsed("DEMAND_TRIPS_YEAR", |raw| raw.parse().ok()) {
            cfg.trips_year = year;
        }
        if let Some(size) = env_parsed("DEMAND_WINDOW_SIZE", parse_usize) {
            cfg.window_size = size;
        }
        if let Some(step) = env_parsed("DEMAND_TRAIN_STEP_SIZE", parse_usize) {
            cfg.train_step_size = step;
        }
        if let Some(step) = env_parsed("DEMAND_INFERENCE_STEP_SIZE", parse_usize) {
            cfg.inference_step_size = step;
        }
        if let Some(buckets) = env_parsed("DEMAND_TEST_HORIZON_BUCKETS", parse_usize) {
            cfg.test_horizon_buckets = buckets;
        }
        if let Some(tz) = env_parsed("DEMAND_SOURCE_TZ", parse_tz) {
            cfg.source_timezone = tz;
        }
        if let Some(tz) = env_parsed("DEMAND_CALENDAR_TZ", parse_tz) {
            cfg.calendar_timezone = tz;
        }
        if let Some(n) = env_parsed("DEMAND_DASHBOARD_TOP_N", parse_usize) {
            cfg.dashboard_top_n = n;
        }

        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_window_config(&self.train_window())?;
        validate_window_config(&self.inference_window())?;
        if self.test_horizon_buckets == 0 {
            return Err(ConfigError::ZeroTestHorizon);
        }
        if self.lag_prefix.is_empty() {
            return Err(ConfigError::EmptyLagPrefix);
        }
        Ok(())
    }

    pub fn train_window(&self) -> WindowConfig {
        WindowConfig {
            window_size: self.window_size,
            step_size: self.train_step_size,
        }
    }

    pub fn inference_window(&self) -> WindowConfig {
        WindowConfig {
            window_size: self.window_size,
            step_size: self.inference_step_size,
        }
    }

    pub fn augment_config(&self) -> AugmentConfig {
        AugmentConfig {
            lag_prefix: self.lag_prefix.clone(),
            granularity: self.granularity,
            calendar_timezone: self.calendar_timezone,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }

    pub fn inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            window: self.inference_window(),
            augment: self.augment_config(),
        }
    }

    pub fn trip_load_config(&self) -> TripLoadConfig {
        TripLoadConfig {
            source_timezone: self.source_timezone,
            ..TripLoadConfig::default()
        }
    }

    pub fn cutoff(&self) -> Cutoff {
        Cutoff::OffsetFromMax {
            offset_ms: self.test_horizon_buckets as i64 * self.granularity.step_ms(),
        }
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Unparsable values are logged and treated as unset.
pub(crate) fn env_parsed<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = env_string(key)?;
    match parse(&raw) {
        Some(value) => Some(value),
        None => {
            warn!(
                component = "config",
                event = "config.invalid_value",
                key,
                value = %raw,
                action = "using_default"
            );
            None
        }
    }
}

fn parse_usize(raw: &str) -> Option<usize> {
    raw.parse().ok()
}

fn parse_tz(raw: &str) -> Option<Tz> {
    Tz::from_str(raw).ok()
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    /// Runs `f` with every key in `clear` unset except those given in `set`,
    /// then restores the previous values.
    pub(crate) fn with_env_vars<R>(clear: &[&str], set: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(&str, Option<String>)> =
            clear.iter().map(|key| (*key, env::var(key).ok())).collect();

        for key in clear {
            env::remove_var(key);
        }
        for (key, value) in set {
            env::set_var(key, value);
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        output
    }
}

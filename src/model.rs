//! Model seam: anything that maps a feature table to one demand value per row.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::augment::{FeatureSchema, FeatureTable};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("feature table lacks column '{column}' required by model {model}")]
    MissingFeature { model: String, column: String },
    #[error("length mismatch: {actual} actual values vs {predicted} predictions")]
    LengthMismatch { actual: usize, predicted: usize },
    #[error("cannot score an empty set")]
    Empty,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait DemandModel {
    fn name(&self) -> &str;

    /// Schema the model was trained on, if it is bound to one.
    fn trained_schema(&self) -> Option<&FeatureSchema> {
        None
    }

    fn predict(&self, features: &FeatureTable) -> Result<Vec<f64>, ModelError>;
}

/// Predicts the four-week rollup column as-is. Reference model so the
/// pipeline can be run and evaluated without an external learner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupBaselineModel {
    rollup_column: String,
}

impl RollupBaselineModel {
    pub const NAME: &'static str = "rollup_baseline";

    pub fn new(rollup_column: impl Into<String>) -> Self {
        Self {
            rollup_column: rollup_column.into(),
        }
    }
}

impl DemandModel for RollupBaselineModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn predict(&self, features: &FeatureTable) -> Result<Vec<f64>, ModelError> {
        features
            .column(&self.rollup_column)
            .ok_or_else(|| ModelError::MissingFeature {
                model: Self::NAME.to_string(),
                column: self.rollup_column.clone(),
            })
    }
}

pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> Result<f64, ModelError> {
    if actual.len() != predicted.len() {
        return Err(ModelError::LengthMismatch {
            actual: actual.len(),
            predicted: predicted.len(),
        });
    }
    if actual.is_empty() {
        return Err(ModelError::Empty);
    }

    let total: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum();
    Ok(total / actual.len() as f64)
}

/// What the registry keeps about a trained model: its schema and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub model_name: String,
    pub schema: FeatureSchema,
    pub metrics: BTreeMap<String, f64>,
    pub trained_at_ms_utc: i64,
}

impl ModelCard {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, path)?;

        info!(
            component = "model",
            event = "model.card.saved",
            path = %path.display(),
            model = %self.model_name,
            fingerprint = %self.schema.fingerprint
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Wraps a model with the schema recorded in its model card.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundModel<M> {
    inner: M,
    schema: FeatureSchema,
}

impl<M: DemandModel> BoundModel<M> {
    pub fn new(inner: M, schema: FeatureSchema) -> Self {
        Self { inner, schema }
    }
}

impl<M: DemandModel> DemandModel for BoundModel<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn trained_schema(&self) -> Option<&FeatureSchema> {
        Some(&self.schema)
    }

    fn predict(&self, features: &FeatureTable) -> Result<Vec<f64>, ModelError> {
        self.inner.predict(features)
    }
}

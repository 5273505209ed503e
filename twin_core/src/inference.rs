use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::info;

use crate::band::CongestionBand;
use crate::config::BandThresholds;
use crate::error::{Result, TwinError};
use crate::schema::FeatureSchema;
use crate::trainer::{EvaluationReport, TrainedModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_count: u32,
    pub band: CongestionBand,
}

/// Immutable serving view of a trained model.
#[derive(Debug, Clone)]
pub struct Predictor {
    model: TrainedModel,
    thresholds: BandThresholds,
}

impl Predictor {
    pub fn new(model: TrainedModel, thresholds: BandThresholds) -> Self {
        Self { model, thresholds }
    }

    pub fn load(model_path: &Path, meta_path: &Path, thresholds: BandThresholds) -> Result<Self> {
        thresholds.validate()?;
        let model = TrainedModel::load(model_path, meta_path)?;
        info!(
            "loaded model from {}; features[{}]: {:?}",
            model_path.display(),
            model.schema.len(),
            model.schema.names()
        );
        Ok(Self::new(model, thresholds))
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.model.schema
    }

    pub fn report(&self) -> &EvaluationReport {
        &self.model.report
    }

    pub fn thresholds(&self) -> BandThresholds {
        self.thresholds
    }

    /// Validate `record` against the schema, predict, and band the count.
    pub fn predict(&self, record: &Map<String, Value>) -> Result<PredictionResult> {
        let features = self.model.schema.order(record)?;
        let raw = self.model.predict_ordered(&features)?;
        // Saturating cast: negatives and NaN become 0.
        let predicted_count = raw.max(0.0) as u32;
        Ok(PredictionResult {
            predicted_count,
            band: CongestionBand::classify(predicted_count, &self.thresholds),
        })
    }

    /// Same as [`Predictor::predict`] for an arbitrary JSON value.
    pub fn predict_value(&self, value: &Value) -> Result<PredictionResult> {
        match value {
            Value::Object(map) => self.predict(map),
            other => Err(TwinError::SchemaMismatch(format!(
                "expected a JSON object of features, got {}",
                kind_name(other)
            ))),
        }
    }
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use twin_core::config::BandThresholds;
use twin_core::trainer::EvaluationReport;
use twin_core::{CongestionBand, FeatureSchema, PredictionResult, TwinError};

// ---------- Response bodies ----------

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictOut {
    /// Server time in ms since the epoch.
    pub t: i64,
    pub predicted_count: u32,
    pub band: CongestionBand,
}

impl PredictOut {
    pub fn new(t: i64, result: PredictionResult) -> Self {
        Self {
            t,
            predicted_count: result.predicted_count,
            band: result.band,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaOut {
    pub schema: FeatureSchema,
    pub thresholds: BandThresholds,
    pub report: EvaluationReport,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthOut {
    pub status: String,
    pub model_loaded: bool,
    pub model_path: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadOut {
    pub reloaded: bool,
    pub features: Vec<String>,
}

// ---------- Errors ----------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Twin(#[from] TwinError),

    #[error("invalid JSON: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Twin(TwinError::SchemaMismatch(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Twin(TwinError::ModelUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadJson(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Twin(e) => e.kind(),
            ApiError::BadJson(_) => "json",
            ApiError::Internal(_) => "internal",
        }
    }

    /// `{error, kind}` body shared by HTTP and websocket replies.
    pub fn body(&self) -> serde_json::Value {
        json!({ "error": self.to_string(), "kind": self.kind() })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

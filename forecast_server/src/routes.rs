use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use twin_core::{FeatureSchema, PredictionResult};

use crate::state::AppState;
use crate::types::{ApiError, HealthOut, PredictOut, ReloadOut, SchemaOut};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/schema", get(schema))
        .route("/health", get(health))
        .route("/reload", post(reload))
        .route("/ws", get(ws))
        .with_state(state)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ---------- Prediction ----------

fn run_prediction(state: &AppState, payload: &Value) -> Result<PredictOut, ApiError> {
    let predictor = state.predictor()?;
    let result = predictor.predict_value(payload)?;
    if state.settings().log_predictions {
        log_prediction(predictor.schema(), payload, &result);
    }
    Ok(PredictOut::new(now_ms(), result))
}

// Confirms what the model actually received.
fn log_prediction(schema: &FeatureSchema, payload: &Value, result: &PredictionResult) {
    let Some(vec) = payload.as_object().and_then(|m| schema.order(m).ok()) else {
        return;
    };
    let nz = vec.iter().filter(|x| **x != 0.0).count();
    let mean = if vec.is_empty() {
        0.0
    } else {
        vec.iter().sum::<f64>() / vec.len() as f64
    };
    let sample: Vec<String> = schema
        .names()
        .iter()
        .zip(&vec)
        .take(6)
        .map(|(name, v)| format!("{}={:.3}", name, v))
        .collect();
    info!(
        "predict in_dim={} nonzero={} mean={:.3} sample=[{}] -> {} ({})",
        vec.len(),
        nz,
        mean,
        sample.join(", "),
        result.predicted_count,
        result.band
    );
}

/// The body is parsed here so malformed JSON gets the same `{error, kind}` reply.
pub async fn predict(State(state): State<AppState>, body: Bytes) -> Result<Json<PredictOut>, ApiError> {
    let payload: Value = serde_json::from_slice(&body)?;
    run_prediction(&state, &payload).map(Json)
}

// ---------- Model management ----------

pub async fn schema(State(state): State<AppState>) -> Result<Json<SchemaOut>, ApiError> {
    let predictor = state.predictor()?;
    Ok(Json(SchemaOut {
        schema: predictor.schema().clone(),
        thresholds: predictor.thresholds(),
        report: predictor.report().clone(),
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    Json(HealthOut {
        status: "ok".to_string(),
        model_loaded: state.is_loaded(),
        model_path: state.settings().model_path.display().to_string(),
        last_error: state.last_error(),
    })
}

pub async fn reload(State(state): State<AppState>) -> Result<Json<ReloadOut>, ApiError> {
    let loader = state.clone();
    let predictor = tokio::task::spawn_blocking(move || loader.reload())
        .await
        .map_err(|e| ApiError::Internal(format!("reload task failed: {}", e)))??;
    Ok(Json(ReloadOut {
        reloaded: true,
        features: predictor.schema().names().iter().map(|s| s.to_string()).collect(),
    }))
}

// ---------- Streaming ----------

pub async fn ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_predictions(socket, state))
}

/// One JSON record in, one prediction (or `{error, kind}`) out, per text message.
async fn stream_predictions(socket: WebSocket, state: AppState) {
    let (mut tx, mut rx) = socket.split();

    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("websocket receive error: {}", e);
                break;
            }
        };

        let outcome = serde_json::from_str::<Value>(&text)
            .map_err(ApiError::from)
            .and_then(|payload| run_prediction(&state, &payload));
        let reply = match outcome {
            Ok(out) => serde_json::to_string(&out),
            Err(e) => serde_json::to_string(&e.body()),
        };

        match reply {
            Ok(body) => {
                if tx.send(Message::Text(body)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("could not encode websocket reply: {}", e),
        }
    }
}

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use twin_core::config::BandThresholds;
use twin_core::{Predictor, TwinConfig, TwinError};

/// Where the model lives and how the server behaves.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub model_path: PathBuf,
    pub meta_path: PathBuf,
    pub port: u16,
    pub thresholds: BandThresholds,
    /// Log every prediction (`LOG_PRED=1`).
    pub log_predictions: bool,
}

impl ServerSettings {
    /// Config file values, overridden by `MODEL_PATH`, `META_PATH`, `PORT`, `LOG_PRED`.
    pub fn from_env(cfg: &TwinConfig) -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            model_path: var("MODEL_PATH").map(PathBuf::from).unwrap_or_else(|| cfg.paths.model.clone()),
            meta_path: var("META_PATH").map(PathBuf::from).unwrap_or_else(|| cfg.paths.meta.clone()),
            port: var("PORT").and_then(|s| s.parse().ok()).unwrap_or(8080),
            thresholds: cfg.bands,
            log_predictions: var("LOG_PRED").as_deref() == Some("1"),
        }
    }
}

struct Inner {
    settings: ServerSettings,
    predictor: RwLock<Option<Arc<Predictor>>>,
    last_error: RwLock<Option<String>>,
}

/// Shared server state. The loaded model is swapped whole on reload.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                predictor: RwLock::new(None),
                last_error: RwLock::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }

    /// The current model, or `ModelUnavailable` if none is loaded.
    pub fn predictor(&self) -> Result<Arc<Predictor>, TwinError> {
        self.inner.predictor.read().clone().ok_or_else(|| {
            let why = self
                .inner
                .last_error
                .read()
                .clone()
                .unwrap_or_else(|| "no model loaded".to_string());
            TwinError::ModelUnavailable(why)
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.predictor.read().is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Load the model from disk and swap it in. On failure the previous
    /// model, if any, stays in service.
    pub fn reload(&self) -> Result<Arc<Predictor>, TwinError> {
        let s = &self.inner.settings;
        match Predictor::load(&s.model_path, &s.meta_path, s.thresholds) {
            Ok(p) => {
                let p = Arc::new(p);
                *self.inner.predictor.write() = Some(p.clone());
                *self.inner.last_error.write() = None;
                info!("model in service: {:?}", p.schema().names());
                Ok(p)
            }
            Err(e) => {
                warn!("model load from {} failed: {}", s.model_path.display(), e);
                *self.inner.last_error.write() = Some(e.to_string());
                Err(e)
            }
        }
    }
}

use thiserror::Error;

/// Failure modes shared by every stage of the twin pipeline.
#[derive(Debug, Error)]
pub enum TwinError {
    /// The engine could not be started; nothing ran, nothing to clean up.
    #[error("engine failed to start: {0}")]
    EngineStartup(String),

    /// A tick failed mid-run. The driver turns this into a graceful stop.
    #[error("engine step {step} failed: {reason}")]
    EngineStep { step: u64, reason: String },

    /// An inference record does not match the persisted feature schema.
    #[error("feature schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Windowing or splitting left nothing to fit or score on.
    #[error("dataset too small: {0}")]
    DatasetTooSmall(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed telemetry: {0}")]
    Telemetry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, TwinError>;

impl TwinError {
    /// Short machine-readable tag, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            TwinError::EngineStartup(_) => "engine_startup",
            TwinError::EngineStep { .. } => "engine_step",
            TwinError::SchemaMismatch(_) => "schema_mismatch",
            TwinError::ModelUnavailable(_) => "model_unavailable",
            TwinError::DatasetTooSmall(_) => "dataset_too_small",
            TwinError::InvalidConfig(_) => "invalid_config",
            TwinError::Telemetry(_) => "telemetry",
            TwinError::Io(_) => "io",
            TwinError::Csv(_) => "csv",
            TwinError::Json(_) => "json",
            TwinError::Bincode(_) => "bincode",
        }
    }
}

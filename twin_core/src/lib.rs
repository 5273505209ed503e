//! Traffic digital twin core.
//!
//! Drives a road-network simulation under an adaptive signal policy,
//! harvests per-step telemetry, and trains and serves a short-horizon
//! congestion forecaster on lag/horizon windows of that telemetry.

pub mod band;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod features;
pub mod forest;
pub mod harvest;
pub mod inference;
pub mod policy;
pub mod schema;
pub mod synthetic;
pub mod telemetry;
pub mod trainer;

pub use band::CongestionBand;
pub use config::{BandThresholds, SplitPolicy, TwinConfig, WindowSpec};
pub use driver::{Interrupt, RunReport, SimulationDriver, StopReason};
pub use error::{Result, TwinError};
pub use features::{build_dataset, Dataset, FeatureRow};
pub use inference::{PredictionResult, Predictor};
pub use schema::{FeatureSchema, SCHEMA_VERSION};
pub use synthetic::SyntheticGenerator;
pub use telemetry::{CsvFileSink, TelemetryRecord, TelemetryTable};
pub use trainer::{TrainedModel, Trainer};

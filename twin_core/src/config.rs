// twin_core/src/config.rs
//
// One explicit configuration value, loaded once and handed to each component
// at construction. Sources, lowest to highest priority:
// 1. Built-in defaults
// 2. JSON config file (optional)
// 3. Command-line flags (applied by the binaries after load)

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TwinError};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TwinConfig {
    pub simulation: SimulationConfig,
    pub policy: PolicyConfig,
    pub harvest: HarvestConfig,
    pub features: WindowSpec,
    pub training: TrainingConfig,
    pub synthetic: SyntheticConfig,
    pub bands: BandThresholds,
    pub paths: PathsConfig,
}

impl TwinConfig {
    /// Load a JSON config file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            TwinError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let cfg: TwinConfig = serde_json::from_str(&data).map_err(|e| {
            TwinError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        self.features.validate()?;
        self.training.validate()?;
        self.synthetic.validate()?;
        self.bands.validate()?;
        if self.simulation.max_steps == 0 {
            return Err(TwinError::InvalidConfig(
                "simulation.max_steps must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Step ceiling for one run (one virtual hour at 1 s ticks).
    pub max_steps: u64,
    pub engine: EngineConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_steps: 3600,
            engine: EngineConfig::default(),
        }
    }
}

/// Startup parameters handed to an engine launcher.
///
/// `scenario` points at the compiled network/scenario description an external
/// engine consumes opaquely; the built-in surrogate reads `surrogate` instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub scenario: PathBuf,
    pub seed: u64,
    pub surrogate: SurrogateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scenario: PathBuf::from("network/osm.sumocfg"),
            seed: 42,
            surrogate: SurrogateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SurrogateConfig {
    pub intersections: usize,
    pub lanes_per_approach: usize,
    /// Steps during which new trips are generated.
    pub demand_steps: u64,
    /// Step of maximum arrival rate.
    pub demand_peak: f64,
    pub demand_width: f64,
    /// Expected trip arrivals per step at the peak.
    pub peak_arrivals: f64,
    /// Free-flow trip length in steps.
    pub trip_steps: (u64, u64),
    pub desired_speed: (f64, f64),
    /// Vehicle count at which moving speed bottoms out.
    pub capacity: u32,
    pub green_duration: f64,
    pub yellow_duration: f64,
    /// Per-step probability that a moving vehicle reaches a stop line.
    pub junction_probability: f64,
    /// Vehicles released per lane per step on green.
    pub discharge_per_step: u32,
    /// Fault injection: refuse to start.
    pub fail_on_start: bool,
    /// Fault injection: fail on this (0-based) tick.
    pub fail_at_step: Option<u64>,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            intersections: 4,
            lanes_per_approach: 2,
            demand_steps: 3000,
            demand_peak: 1500.0,
            demand_width: 500.0,
            peak_arrivals: 0.6,
            trip_steps: (150, 450),
            desired_speed: (10.0, 15.0),
            capacity: 400,
            green_duration: 30.0,
            yellow_duration: 3.0,
            junction_probability: 0.02,
            discharge_per_step: 1,
            fail_on_start: false,
            fail_at_step: None,
        }
    }
}

// ============================================================================
// Signal policy
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Queue length (halting vehicles on the worst lane) that triggers extension.
    pub queue_threshold: u32,
    /// Phase extension per intervention, in engine time units.
    pub extension: f64,
    /// Ceiling on cumulative extension applied to a single phase.
    pub max_extension_per_phase: f64,
    /// Evaluate every N steps.
    pub cadence_steps: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            queue_threshold: 10,
            extension: 10.0,
            max_extension_per_phase: 60.0,
            cadence_steps: 1,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.extension > 0.0) {
            return Err(TwinError::InvalidConfig("policy.extension must be > 0".into()));
        }
        if self.max_extension_per_phase < self.extension {
            return Err(TwinError::InvalidConfig(
                "policy.max_extension_per_phase must be >= policy.extension".into(),
            ));
        }
        if self.cadence_steps == 0 {
            return Err(TwinError::InvalidConfig("policy.cadence_steps must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Harvesting
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    /// Stamp each record with local wall-clock time (HH:MM:SS).
    pub wall_clock: bool,
    /// Day tag written on every record of a run.
    pub day: Option<u32>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            wall_clock: true,
            day: None,
        }
    }
}

// ============================================================================
// Feature windowing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WindowSpec {
    /// Steps ahead the target is read from.
    pub horizon: usize,
    /// Steps back each lag feature is read from, in feature order.
    pub lags: Vec<usize>,
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self {
            horizon: 300,
            lags: vec![60, 300],
        }
    }
}

impl WindowSpec {
    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(TwinError::InvalidConfig("features.horizon must be > 0".into()));
        }
        if self.lags.iter().any(|&l| l == 0) {
            return Err(TwinError::InvalidConfig("features.lags must all be > 0".into()));
        }
        let mut seen = self.lags.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.lags.len() {
            return Err(TwinError::InvalidConfig("features.lags must be distinct".into()));
        }
        Ok(())
    }

    pub fn max_lag(&self) -> usize {
        self.lags.iter().copied().max().unwrap_or(0)
    }
}

// ============================================================================
// Training
// ============================================================================

/// Chronological split policy. Never shuffles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitPolicy {
    /// First `train_fraction` of ordered rows train, the rest test.
    Fraction { train_fraction: f64 },
    /// Days up to and including `last_train_day` train, later days test.
    ByDay { last_train_day: u32 },
}

impl Default for SplitPolicy {
    fn default() -> Self {
        SplitPolicy::Fraction { train_fraction: 0.8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ForestParams {
    pub n_trees: usize,
    /// `None` grows trees until leaves are pure or too small to split.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; `None` means all of them.
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: Some(16),
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub split: SplitPolicy,
    pub forest: ForestParams,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if let SplitPolicy::Fraction { train_fraction } = self.split {
            if !(train_fraction > 0.0 && train_fraction < 1.0) {
                return Err(TwinError::InvalidConfig(format!(
                    "training.split.train_fraction must be in (0, 1), got {}",
                    train_fraction
                )));
            }
        }
        let f = &self.forest;
        if f.n_trees == 0 {
            return Err(TwinError::InvalidConfig("training.forest.n_trees must be > 0".into()));
        }
        if f.min_samples_split < 2 || f.min_samples_leaf == 0 {
            return Err(TwinError::InvalidConfig(
                "training.forest needs min_samples_split >= 2 and min_samples_leaf >= 1".into(),
            ));
        }
        if f.max_features == Some(0) {
            return Err(TwinError::InvalidConfig("training.forest.max_features must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Synthetic corpus
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticConfig {
    pub days: u32,
    pub first_day: u32,
    pub steps_per_day: usize,
    pub base_peak: i64,
    pub peak_jitter: i64,
    pub base_width: i64,
    pub width_jitter: i64,
    pub base_amplitude: i64,
    pub amplitude_jitter: i64,
    /// Std-dev of the additive sensor noise on counts.
    pub count_noise_sd: f64,
    pub free_flow_speed: f64,
    pub jam_speed: f64,
    pub speed_noise_sd: f64,
    pub speed_min: f64,
    pub speed_max: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            days: 30,
            first_day: 1,
            steps_per_day: 3600,
            base_peak: 1800,
            peak_jitter: 300,
            base_width: 600,
            width_jitter: 50,
            base_amplitude: 180,
            amplitude_jitter: 30,
            count_noise_sd: 5.0,
            free_flow_speed: 15.0,
            jam_speed: 2.0,
            speed_noise_sd: 1.0,
            speed_min: 1.0,
            speed_max: 20.0,
            seed: 7,
        }
    }
}

impl SyntheticConfig {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(TwinError::InvalidConfig(format!("synthetic.{}", msg)));
        if self.days == 0 || self.steps_per_day == 0 {
            return bad("days and steps_per_day must be > 0");
        }
        if self.peak_jitter < 0 || self.width_jitter < 0 || self.amplitude_jitter < 0 {
            return bad("jitters must be >= 0");
        }
        if self.base_width - self.width_jitter <= 0 {
            return bad("base_width - width_jitter must be > 0");
        }
        if self.base_amplitude - self.amplitude_jitter <= 0 {
            return bad("base_amplitude - amplitude_jitter must be > 0");
        }
        if self.count_noise_sd < 0.0 || self.speed_noise_sd < 0.0 {
            return bad("noise std-devs must be >= 0");
        }
        if !(self.speed_min <= self.speed_max) {
            return bad("speed_min must be <= speed_max");
        }
        Ok(())
    }
}

// ============================================================================
// Congestion bands
// ============================================================================

/// Upper bounds of the two lower bands, in vehicles.
///
/// `count <= moderate_above` is free flow, `count <= severe_above` moderate,
/// anything above severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BandThresholds {
    pub moderate_above: u32,
    pub severe_above: u32,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            moderate_above: 100,
            severe_above: 200,
        }
    }
}

impl BandThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.moderate_above >= self.severe_above {
            return Err(TwinError::InvalidConfig(format!(
                "bands.moderate_above ({}) must be below bands.severe_above ({})",
                self.moderate_above, self.severe_above
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Paths
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub telemetry: PathBuf,
    pub synthetic: PathBuf,
    pub model: PathBuf,
    pub meta: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            telemetry: PathBuf::from("data/raw/traffic_log.csv"),
            synthetic: PathBuf::from("data/raw/synthetic_traffic_30days.csv"),
            model: PathBuf::from("data/models/traffic_model.bin"),
            meta: PathBuf::from("data/models/traffic_model.meta.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = TwinConfig::default();
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.policy.queue_threshold, 10);
        assert_eq!(cfg.features.lags, vec![60, 300]);
        assert_eq!(cfg.bands.moderate_above, 100);
        assert_eq!(cfg.bands.severe_above, 200);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"features": {{"horizon": 120}}, "training": {{"split": {{"mode": "by_day", "last_train_day": 25}}}}}}"#
        )
        .unwrap();

        let cfg = TwinConfig::load(f.path()).unwrap();
        assert_eq!(cfg.features.horizon, 120);
        assert_eq!(cfg.features.lags, vec![60, 300]);
        assert_eq!(cfg.training.split, SplitPolicy::ByDay { last_train_day: 25 });
        assert_eq!(cfg.training.forest.n_trees, 100);
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/twin.json");
        let cfg = TwinConfig::load(&path).unwrap();
        assert_eq!(cfg.training.split, SplitPolicy::ByDay { last_train_day: 25 });
        assert_eq!(cfg.simulation.engine.surrogate.intersections, 4);
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"policy": {{"queue_threshhold": 5}}}}"#).unwrap();
        let err = TwinConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, TwinError::InvalidConfig(_)));
    }

    #[test]
    fn test_inverted_bands_rejected() {
        let mut cfg = TwinConfig::default();
        cfg.bands = BandThresholds {
            moderate_above: 200,
            severe_above: 180,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_lags_rejected() {
        let spec = WindowSpec {
            horizon: 10,
            lags: vec![5, 5],
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_cap_below_extension_rejected() {
        let mut cfg = TwinConfig::default();
        cfg.policy.max_extension_per_phase = 5.0;
        assert!(cfg.validate().is_err());
    }
}

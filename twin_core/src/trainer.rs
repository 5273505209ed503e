//! Chronological training, evaluation and model persistence.
//!
//! Rows are never shuffled: the test partition always lies strictly after
//! the train partition on the (day, step) axis. The fitted forest is stored
//! together with the schema it was fitted on (bincode), next to a JSON
//! sidecar carrying the same schema and the evaluation report.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::config::{SplitPolicy, TrainingConfig};
use crate::error::{Result, TwinError};
use crate::features::{Dataset, FeatureRow};
use crate::forest::RandomForest;
use crate::schema::FeatureSchema;
use crate::telemetry::ensure_parent_dir;

/// Train/test views over an ordered dataset.
#[derive(Debug, Clone, Copy)]
pub struct ChronoSplit<'a> {
    pub train: &'a [FeatureRow],
    pub test: &'a [FeatureRow],
}

impl<'a> ChronoSplit<'a> {
    pub fn describe(&self, policy: &SplitPolicy) -> String {
        let span = |rows: &[FeatureRow]| match (rows.first(), rows.last()) {
            (Some(a), Some(b)) => format!("{:?}..={:?}", a.time_key(), b.time_key()),
            _ => "empty".to_string(),
        };
        let how = match policy {
            SplitPolicy::Fraction { train_fraction } => format!("fraction {}", train_fraction),
            SplitPolicy::ByDay { last_train_day } => format!("days <= {}", last_train_day),
        };
        format!(
            "{}: train {} rows {}, test {} rows {}",
            how,
            self.train.len(),
            span(self.train),
            self.test.len(),
            span(self.test)
        )
    }
}

/// Split `rows` by `policy` and check that every train row precedes every test row.
pub fn chronological_split<'a>(rows: &'a [FeatureRow], policy: &SplitPolicy) -> Result<ChronoSplit<'a>> {
    if rows.is_empty() {
        return Err(TwinError::DatasetTooSmall(
            "no feature rows survived windowing".into(),
        ));
    }

    let cut = match policy {
        SplitPolicy::Fraction { train_fraction } => (rows.len() as f64 * train_fraction).floor() as usize,
        SplitPolicy::ByDay { last_train_day } => {
            if rows.iter().any(|r| r.day.is_none()) {
                return Err(TwinError::InvalidConfig(
                    "by_day split needs a day column on every row".into(),
                ));
            }
            if let Some(w) = rows.windows(2).find(|w| w[1].day < w[0].day) {
                return Err(TwinError::Telemetry(format!(
                    "days are not in order: day {:?} follows day {:?}",
                    w[1].day, w[0].day
                )));
            }
            rows.partition_point(|r| r.day.map_or(false, |d| d <= *last_train_day))
        }
    };
    let (train, test) = rows.split_at(cut.min(rows.len()));

    if train.is_empty() || test.is_empty() {
        return Err(TwinError::DatasetTooSmall(format!(
            "split left {} train and {} test rows",
            train.len(),
            test.len()
        )));
    }

    if let SplitPolicy::ByDay { .. } = policy {
        let last_train_day = train.iter().filter_map(|r| r.day).max();
        let first_test_day = test.iter().filter_map(|r| r.day).min();
        if last_train_day >= first_test_day {
            return Err(TwinError::Telemetry(format!(
                "day split overlaps: train reaches day {:?} but test starts at day {:?}",
                last_train_day, first_test_day
            )));
        }
    }

    let last_train = train.iter().map(FeatureRow::time_key).max();
    let first_test = test.iter().map(FeatureRow::time_key).min();
    if last_train >= first_test {
        return Err(TwinError::Telemetry(format!(
            "rows are not chronological: train reaches {:?} but test starts at {:?}",
            last_train, first_test
        )));
    }

    Ok(ChronoSplit { train, test })
}

pub fn mean_squared_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let sum: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p) * (a - p))
        .sum();
    sum / actual.len() as f64
}

/// Coefficient of determination.
///
/// A constant target scores 1.0 when predicted exactly and 0.0 otherwise.
pub fn r2_score(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean) * (a - mean)).sum();
    let ss_res: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p) * (a - p))
        .sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub split: String,
    pub train_rows: usize,
    pub test_rows: usize,
    pub mse: f64,
    pub r2: f64,
    /// Highest first.
    pub importances: Vec<FeatureImportance>,
    pub trained_at: String,
}

/// One held-out row, for auditing predictions against actuals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPrediction {
    pub day: Option<u32>,
    pub step: u64,
    pub actual: u32,
    pub predicted: f64,
}

pub fn write_predictions(path: &Path, rows: &[TestPrediction]) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut wtr = csv::Writer::from_path(path)?;
    for r in rows {
        wtr.serialize(r)?;
    }
    wtr.flush()?;
    info!("wrote {} test predictions to {}", rows.len(), path.display());
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    schema: FeatureSchema,
    forest: RandomForest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub schema: FeatureSchema,
    pub report: EvaluationReport,
}

/// A fitted forest plus the schema that defines its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub schema: FeatureSchema,
    pub forest: RandomForest,
    pub report: EvaluationReport,
}

impl TrainedModel {
    /// Predict from a feature vector already in schema order.
    pub fn predict_ordered(&self, features: &[f64]) -> Result<f64> {
        self.forest.predict_one(features)
    }

    pub fn save(&self, model_path: &Path, meta_path: &Path) -> Result<()> {
        ensure_parent_dir(model_path)?;
        ensure_parent_dir(meta_path)?;

        let file = ModelFile {
            schema: self.schema.clone(),
            forest: self.forest.clone(),
        };
        let mut out = BufWriter::new(File::create(model_path)?);
        bincode::serialize_into(&mut out, &file)?;
        out.flush()?;

        let meta = ModelMeta {
            schema: self.schema.clone(),
            report: self.report.clone(),
        };
        let mut out = BufWriter::new(File::create(meta_path)?);
        serde_json::to_writer_pretty(&mut out, &meta)?;
        out.flush()?;

        info!("model saved to {} (meta {})", model_path.display(), meta_path.display());
        Ok(())
    }

    /// Load and cross-check a model file and its sidecar.
    ///
    /// A missing file is `ModelUnavailable`; version or schema disagreement is
    /// `SchemaMismatch`.
    pub fn load(model_path: &Path, meta_path: &Path) -> Result<Self> {
        let open = |p: &Path| {
            File::open(p).map(BufReader::new).map_err(|e| {
                TwinError::ModelUnavailable(format!("cannot open {}: {}", p.display(), e))
            })
        };

        let meta: ModelMeta = serde_json::from_reader(open(meta_path)?)?;
        let file: ModelFile = bincode::deserialize_from(open(model_path)?)?;

        meta.schema.check_version()?;
        file.schema.check_version()?;
        if meta.schema != file.schema {
            return Err(TwinError::SchemaMismatch(format!(
                "model {} was fitted on {:?} but meta {} describes {:?}",
                model_path.display(),
                file.schema.names(),
                meta_path.display(),
                meta.schema.names()
            )));
        }
        if file.forest.n_features() != file.schema.len() {
            return Err(TwinError::SchemaMismatch(format!(
                "forest takes {} features, schema lists {}",
                file.forest.n_features(),
                file.schema.len()
            )));
        }

        Ok(Self {
            schema: file.schema,
            forest: file.forest,
            report: meta.report,
        })
    }
}

/// Result of one training run.
#[derive(Debug, Clone)]
pub struct TrainingRun {
    pub model: TrainedModel,
    pub predictions: Vec<TestPrediction>,
}

pub struct Trainer {
    cfg: TrainingConfig,
}

impl Trainer {
    pub fn new(cfg: TrainingConfig) -> Self {
        Self { cfg }
    }

    /// Split, fit on the train partition, score on the test partition.
    pub fn train(&self, dataset: &Dataset) -> Result<TrainingRun> {
        self.cfg.validate()?;
        let split = chronological_split(&dataset.rows, &self.cfg.split)?;
        let description = split.describe(&self.cfg.split);
        info!("split {}", description);

        let x: Vec<Vec<f64>> = split.train.iter().map(FeatureRow::features).collect();
        let y: Vec<f64> = split.train.iter().map(|r| r.target as f64).collect();
        let params = &self.cfg.forest;
        info!(
            "fitting {} trees (max_depth {:?}, seed {}) on {} rows",
            params.n_trees,
            params.max_depth,
            params.seed,
            x.len()
        );
        let forest = RandomForest::fit(&x, &y, params)?;

        let test_x: Vec<Vec<f64>> = split.test.iter().map(FeatureRow::features).collect();
        let actual: Vec<f64> = split.test.iter().map(|r| r.target as f64).collect();
        let predicted = forest.predict(&test_x)?;

        let mse = mean_squared_error(&actual, &predicted);
        let r2 = r2_score(&actual, &predicted);
        info!("test MSE: {:.2}, R2: {:.4}", mse, r2);
        if r2 < 0.0 {
            warn!("model does worse than predicting the mean (R2 {:.4})", r2);
        }

        let mut importances: Vec<FeatureImportance> = dataset
            .schema
            .names()
            .into_iter()
            .zip(forest.importances())
            .map(|(name, &importance)| FeatureImportance {
                feature: name.to_string(),
                importance,
            })
            .collect();
        importances.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        for fi in &importances {
            info!("importance {:<16} {:.4}", fi.feature, fi.importance);
        }

        let predictions = split
            .test
            .iter()
            .zip(&predicted)
            .map(|(r, &p)| TestPrediction {
                day: r.day,
                step: r.step,
                actual: r.target,
                predicted: p,
            })
            .collect();

        let report = EvaluationReport {
            split: description,
            train_rows: split.train.len(),
            test_rows: split.test.len(),
            mse,
            r2,
            importances,
            trained_at: chrono::Utc::now().to_rfc3339(),
        };

        Ok(TrainingRun {
            model: TrainedModel {
                schema: dataset.schema.clone(),
                forest,
                report,
            },
            predictions,
        })
    }
}

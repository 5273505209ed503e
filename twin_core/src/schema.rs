//! Versioned feature schema shared by training and serving.
//!
//! The schema recorded at fit time is the only authority on what a model
//! consumes. Serving validates every request against it by name and kind and
//! never pads, drops or reorders silently.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::WindowSpec;
use crate::error::{Result, TwinError};

/// Bump when the meaning or layout of the feature vector changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Non-negative whole number (counts, steps).
    Integer,
    Real,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureField {
    pub name: String,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    /// Model input order.
    pub fields: Vec<FeatureField>,
    /// Steps ahead the target was read from.
    pub horizon: usize,
    /// Lag offsets, aligned with the `lag_*` fields.
    pub lags: Vec<usize>,
}

pub fn lag_name(offset: usize) -> String {
    format!("lag_{}", offset)
}

impl FeatureSchema {
    /// `step, vehicle_count, avg_speed, lag_<L>...` for the given window.
    pub fn from_window(spec: &WindowSpec) -> Self {
        let mut fields = vec![
            FeatureField {
                name: "step".into(),
                kind: FeatureKind::Integer,
            },
            FeatureField {
                name: "vehicle_count".into(),
                kind: FeatureKind::Integer,
            },
            FeatureField {
                name: "avg_speed".into(),
                kind: FeatureKind::Real,
            },
        ];
        fields.extend(spec.lags.iter().map(|&l| FeatureField {
            name: lag_name(l),
            kind: FeatureKind::Integer,
        }));
        Self {
            version: SCHEMA_VERSION,
            fields,
            horizon: spec.horizon,
            lags: spec.lags.clone(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reject artifacts written under a different schema version.
    pub fn check_version(&self) -> Result<()> {
        if self.version != SCHEMA_VERSION {
            return Err(TwinError::SchemaMismatch(format!(
                "artifact schema version {} is not supported (expected {})",
                self.version, SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    /// Map a named record onto the model's input vector.
    ///
    /// Every schema field must be present with the right kind and nothing
    /// else may be present. All problems are reported together.
    pub fn order(&self, record: &Map<String, Value>) -> Result<Vec<f64>> {
        let mut problems = Vec::new();
        let mut out = Vec::with_capacity(self.fields.len());

        for field in &self.fields {
            match record.get(&field.name) {
                None => problems.push(format!("missing `{}`", field.name)),
                Some(v) => match coerce(v, field.kind) {
                    Some(x) => out.push(x),
                    None => problems.push(format!(
                        "`{}` must be {} (got {})",
                        field.name,
                        match field.kind {
                            FeatureKind::Integer => "a non-negative integer",
                            FeatureKind::Real => "a finite number",
                        },
                        v
                    )),
                },
            }
        }

        let mut unknown: Vec<&String> = record
            .keys()
            .filter(|k| !self.fields.iter().any(|f| &f.name == *k))
            .collect();
        unknown.sort();
        for k in unknown {
            problems.push(format!("unexpected `{}`", k));
        }

        if problems.is_empty() {
            Ok(out)
        } else {
            Err(TwinError::SchemaMismatch(problems.join("; ")))
        }
    }
}

fn coerce(v: &Value, kind: FeatureKind) -> Option<f64> {
    match kind {
        FeatureKind::Integer => v
            .as_u64()
            .map(|n| n as f64)
            .or_else(|| v.as_f64().filter(|x| *x >= 0.0 && x.fract() == 0.0)),
        FeatureKind::Real => v.as_f64().filter(|x| x.is_finite()),
    }
}

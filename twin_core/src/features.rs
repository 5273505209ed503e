//! Lag/horizon windowing of telemetry into a supervised dataset.
//!
//! Windows are computed inside each day partition (a contiguous run of rows
//! with the same `day`, or the whole table when there is no day column).
//! A row survives only if every lag and the target land inside its own
//! partition; nothing is imputed.

use tracing::info;

use crate::config::WindowSpec;
use crate::error::{Result, TwinError};
use crate::schema::FeatureSchema;
use crate::telemetry::{TelemetryRecord, TelemetryTable};

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub day: Option<u32>,
    pub step: u64,
    pub vehicle_count: u32,
    pub avg_speed: f64,
    /// Counts at `t - L` for each configured lag, in schema order.
    pub lags: Vec<u32>,
    /// Count at `t + horizon`.
    pub target: u32,
}

impl FeatureRow {
    /// Model inputs in schema order.
    pub fn features(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(3 + self.lags.len());
        v.push(self.step as f64);
        v.push(self.vehicle_count as f64);
        v.push(self.avg_speed);
        v.extend(self.lags.iter().map(|&l| l as f64));
        v
    }

    /// Chronological ordering key.
    pub fn time_key(&self) -> (u32, u64) {
        (self.day.unwrap_or(0), self.step)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_days(&self) -> bool {
        self.rows.iter().any(|r| r.day.is_some())
    }
}

/// Split ordered records into contiguous same-day runs.
pub fn partitions(records: &[TelemetryRecord]) -> Vec<&[TelemetryRecord]> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..=records.len() {
        if i == records.len() || records[i].day != records[start].day {
            if i > start {
                out.push(&records[start..i]);
            }
            start = i;
        }
    }
    out
}

/// Window `table` into feature rows.
///
/// # Arguments
/// * `table` - Telemetry ordered by (day, step)
/// * `window` - Horizon and lag offsets
pub fn build_dataset(table: &TelemetryTable, window: &WindowSpec) -> Result<Dataset> {
    window.validate()?;
    let max_lag = window.max_lag();
    let mut rows = Vec::new();

    for part in partitions(&table.records) {
        if let Some(w) = part.windows(2).find(|w| w[1].step <= w[0].step) {
            return Err(TwinError::Telemetry(format!(
                "steps out of order within day {:?}: {} then {}",
                w[0].day, w[0].step, w[1].step
            )));
        }
        if part.len() <= max_lag + window.horizon {
            continue;
        }
        for t in max_lag..part.len() - window.horizon {
            let r = &part[t];
            rows.push(FeatureRow {
                day: r.day,
                step: r.step,
                vehicle_count: r.vehicle_count,
                avg_speed: r.avg_speed,
                lags: window.lags.iter().map(|&l| part[t - l].vehicle_count).collect(),
                target: part[t + window.horizon].vehicle_count,
            });
        }
    }

    info!(
        "windowed {} telemetry rows into {} feature rows (horizon {}, lags {:?})",
        table.len(),
        rows.len(),
        window.horizon,
        window.lags
    );

    Ok(Dataset {
        schema: FeatureSchema::from_window(window),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(day: Option<u32>, n: u64, count: impl Fn(u64) -> u32) -> Vec<TelemetryRecord> {
        (0..n)
            .map(|step| TelemetryRecord {
                step,
                vehicle_count: count(step),
                avg_speed: 10.0,
                day,
                timestamp: None,
            })
            .collect()
    }

    #[test]
    fn test_single_day_hour_keeps_3000_rows() {
        let table = TelemetryTable::new(day(None, 3600, |s| s as u32));
        let ds = build_dataset(&table, &WindowSpec::default()).unwrap();

        assert_eq!(ds.len(), 3000);
        assert_eq!(ds.rows.first().unwrap().step, 300);
        assert_eq!(ds.rows.last().unwrap().step, 3299);
        for r in &ds.rows {
            assert_eq!(r.lags, vec![r.step as u32 - 60, r.step as u32 - 300]);
            assert_eq!(r.target, r.step as u32 + 300);
        }
        assert!(ds.rows.windows(2).all(|w| w[0].step < w[1].step));
    }

    #[test]
    fn test_windows_never_cross_days() {
        let mut records = Vec::new();
        for d in 1..=3u32 {
            records.extend(day(Some(d), 1000, |s| d * 10_000 + s as u32));
        }
        let window = WindowSpec {
            horizon: 100,
            lags: vec![10, 50],
        };
        let ds = build_dataset(&TelemetryTable::new(records), &window).unwrap();

        assert_eq!(ds.len(), 3 * (1000 - 50 - 100));
        for r in &ds.rows {
            let d = r.day.unwrap();
            for lag in &r.lags {
                assert_eq!(lag / 10_000, d, "lag leaked across days at {:?}", r.time_key());
            }
            assert_eq!(r.target / 10_000, d, "target leaked across days at {:?}", r.time_key());
            assert!(r.step >= 50 && r.step < 900);
        }
    }

    #[test]
    fn test_short_partition_yields_nothing() {
        let mut records = day(Some(1), 400, |_| 1);
        records.extend(day(Some(2), 300, |_| 1));
        let ds = build_dataset(&TelemetryTable::new(records), &WindowSpec::default()).unwrap();
        // Day 1 keeps t in [300, 99], day 2 is shorter than one window.
        assert!(ds.is_empty());
    }

    #[test]
    fn test_unordered_steps_rejected() {
        let mut records = day(None, 10, |s| s as u32);
        records.swap(3, 4);
        let window = WindowSpec {
            horizon: 1,
            lags: vec![1],
        };
        assert!(build_dataset(&TelemetryTable::new(records), &window).is_err());
    }

    #[test]
    fn test_partitions_are_contiguous_runs() {
        let mut records = day(Some(1), 3, |_| 0);
        records.extend(day(Some(2), 2, |_| 0));
        let parts = partitions(&records);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 2);
        assert!(partitions(&[]).is_empty());
    }

    #[test]
    fn test_feature_vector_matches_schema() {
        let table = TelemetryTable::new(day(None, 20, |s| s as u32 * 2));
        let window = WindowSpec {
            horizon: 2,
            lags: vec![1, 5],
        };
        let ds = build_dataset(&table, &window).unwrap();
        let r = &ds.rows[0];
        assert_eq!(ds.schema.names(), vec!["step", "vehicle_count", "avg_speed", "lag_1", "lag_5"]);
        assert_eq!(r.features(), vec![5.0, 10.0, 10.0, 8.0, 0.0]);
        assert_eq!(r.target, 14);
    }
}

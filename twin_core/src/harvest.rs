use tracing::warn;

use crate::config::HarvestConfig;
use crate::engine::SensorSnapshot;
use crate::error::Result;
use crate::telemetry::{round2, TelemetryRecord, TelemetrySink};

/// Mean of the per-vehicle speeds, or exactly 0.0 with no vehicles.
pub fn mean_speed(speeds: &[f64]) -> f64 {
    if speeds.is_empty() {
        return 0.0;
    }
    speeds.iter().sum::<f64>() / speeds.len() as f64
}

/// Append-only buffer of one run's telemetry.
///
/// Owned by the driver for the lifetime of a run and flushed exactly once,
/// whether the run completed or was cut short.
#[derive(Debug)]
pub struct Harvester {
    cfg: HarvestConfig,
    buffer: Vec<TelemetryRecord>,
    flushed: bool,
}

impl Harvester {
    pub fn new(cfg: HarvestConfig) -> Self {
        Self {
            cfg,
            buffer: Vec::new(),
            flushed: false,
        }
    }

    /// Append the record for `step`.
    ///
    /// # Arguments
    /// * `snapshot` - Network state after the tick
    /// * `step` - Loop step counter, strictly increasing within a run
    pub fn record(&mut self, snapshot: &SensorSnapshot, step: u64) {
        if self.flushed {
            warn!("record for step {} after flush is dropped", step);
            return;
        }
        let timestamp = self
            .cfg
            .wall_clock
            .then(|| chrono::Local::now().format("%H:%M:%S").to_string());

        self.buffer.push(TelemetryRecord {
            step,
            vehicle_count: snapshot.vehicle_count,
            avg_speed: round2(mean_speed(&snapshot.speeds)),
            day: self.cfg.day,
            timestamp,
        });
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Write the whole buffer to `sink`. Later calls are no-ops.
    ///
    /// Returns the number of records written by this call.
    pub fn flush<S: TelemetrySink + ?Sized>(&mut self, sink: &mut S) -> Result<usize> {
        if self.flushed {
            return Ok(0);
        }
        self.flushed = true;
        sink.write_all(&self.buffer)?;
        Ok(self.buffer.len())
    }
}

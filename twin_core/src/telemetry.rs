//! Telemetry records and the tabular CSV format they persist to.
//!
//! Columns: `step,vehicle_count,avg_speed[,day][,timestamp]`, header required,
//! `avg_speed` with two decimals. The optional columns are written when any
//! record carries the field. Readers locate columns by header name, so files
//! that put `day` first load the same way.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Result, TwinError};

/// One harvested (or synthesized) step of network state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub step: u64,
    pub vehicle_count: u32,
    pub avg_speed: f64,
    pub day: Option<u32>,
    pub timestamp: Option<String>,
}

/// Round to the two decimals the table stores.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Ordered telemetry, as read from or written to one CSV file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryTable {
    pub records: Vec<TelemetryRecord>,
}

impl TelemetryTable {
    pub fn new(records: Vec<TelemetryRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_days(&self) -> bool {
        self.records.iter().any(|r| r.day.is_some())
    }

    /// Distinct day ids in order of first appearance.
    pub fn days(&self) -> Vec<u32> {
        let mut out: Vec<u32> = Vec::new();
        for d in self.records.iter().filter_map(|r| r.day) {
            if !out.contains(&d) {
                out.push(d);
            }
        }
        out
    }

    /// Write all records with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        write_records(&self.records, writer)
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers()?.clone();
        let col = |name: &str| headers.iter().position(|h| h.trim() == name);

        let step_i = col("step").ok_or_else(|| TwinError::Telemetry("missing `step` column".into()))?;
        let count_i = col("vehicle_count")
            .ok_or_else(|| TwinError::Telemetry("missing `vehicle_count` column".into()))?;
        let speed_i =
            col("avg_speed").ok_or_else(|| TwinError::Telemetry("missing `avg_speed` column".into()))?;
        let day_i = col("day");
        let ts_i = col("timestamp");

        let mut records = Vec::new();
        for (line, row) in rdr.records().enumerate() {
            let row = row?;
            let field = |i: usize| row.get(i).map(str::trim).unwrap_or("");
            let parse_err =
                |what: &str, raw: &str| TwinError::Telemetry(format!("row {}: bad {} {:?}", line + 1, what, raw));

            let step = field(step_i).parse::<u64>().map_err(|_| parse_err("step", field(step_i)))?;
            let vehicle_count = field(count_i)
                .parse::<u32>()
                .map_err(|_| parse_err("vehicle_count", field(count_i)))?;
            let avg_speed = field(speed_i)
                .parse::<f64>()
                .map_err(|_| parse_err("avg_speed", field(speed_i)))?;
            let day = match day_i.map(field) {
                None | Some("") => None,
                Some(raw) => Some(raw.parse::<u32>().map_err(|_| parse_err("day", raw))?),
            };
            let timestamp = match ts_i.map(field) {
                None | Some("") => None,
                Some(raw) => Some(raw.to_string()),
            };

            records.push(TelemetryRecord {
                step,
                vehicle_count,
                avg_speed,
                day,
                timestamp,
            });
        }
        Ok(Self { records })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        let file = File::create(path)?;
        self.write_csv(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            TwinError::Telemetry(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::read_csv(file)
    }
}

/// Create the directory `path` will be written into, if any.
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_records<W: Write>(records: &[TelemetryRecord], writer: W) -> Result<()> {
    let with_day = records.iter().any(|r| r.day.is_some());
    let with_ts = records.iter().any(|r| r.timestamp.is_some());

    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    let mut header = vec!["step", "vehicle_count", "avg_speed"];
    if with_day {
        header.push("day");
    }
    if with_ts {
        header.push("timestamp");
    }
    wtr.write_record(&header)?;

    for r in records {
        let mut row = vec![
            r.step.to_string(),
            r.vehicle_count.to_string(),
            format!("{:.2}", r.avg_speed),
        ];
        if with_day {
            row.push(r.day.map(|d| d.to_string()).unwrap_or_default());
        }
        if with_ts {
            row.push(r.timestamp.clone().unwrap_or_default());
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Destination for a flushed run buffer.
pub trait TelemetrySink {
    fn write_all(&mut self, records: &[TelemetryRecord]) -> Result<()>;
}

/// Writes the run to a CSV file, creating parent directories.
#[derive(Debug, Clone)]
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for CsvFileSink {
    fn write_all(&mut self, records: &[TelemetryRecord]) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let file = File::create(&self.path)?;
        write_records(records, file)?;
        info!("telemetry saved to {} ({} rows)", self.path.display(), records.len());
        Ok(())
    }
}

/// Keeps flushed records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<TelemetryRecord>,
    pub writes: usize,
}

impl TelemetrySink for MemorySink {
    fn write_all(&mut self, records: &[TelemetryRecord]) -> Result<()> {
        self.records = records.to_vec();
        self.writes += 1;
        Ok(())
    }
}

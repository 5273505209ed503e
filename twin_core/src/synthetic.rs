//! Parametric multi-day telemetry generator.
//!
//! Each day is a Gaussian rush-hour bump in vehicle counts with speeds that
//! fall linearly toward a jam speed as counts approach the day's amplitude.
//! Per-day shape parameters are jittered by integer offsets, then sensor noise
//! is added per step. Everything draws from one seeded ChaCha stream.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::info;

use crate::config::SyntheticConfig;
use crate::error::{Result, TwinError};
use crate::telemetry::{round2, TelemetryRecord, TelemetryTable};

/// Shape parameters drawn for one day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayProfile {
    pub day: u32,
    pub peak: i64,
    pub width: i64,
    pub amplitude: i64,
}

impl DayProfile {
    /// Noise-free count curve at `step`.
    pub fn bell(&self, step: usize) -> f64 {
        let d = step as f64 - self.peak as f64;
        let w = self.width as f64;
        self.amplitude as f64 * (-(d * d) / (2.0 * w * w)).exp()
    }
}

pub struct SyntheticGenerator {
    cfg: SyntheticConfig,
    rng: ChaCha8Rng,
    count_noise: Normal<f64>,
    speed_noise: Normal<f64>,
}

impl SyntheticGenerator {
    pub fn new(cfg: SyntheticConfig) -> Result<Self> {
        cfg.validate()?;
        let count_noise = Normal::new(0.0, cfg.count_noise_sd)
            .map_err(|e| TwinError::InvalidConfig(format!("synthetic.count_noise_sd: {}", e)))?;
        let speed_noise = Normal::new(0.0, cfg.speed_noise_sd)
            .map_err(|e| TwinError::InvalidConfig(format!("synthetic.speed_noise_sd: {}", e)))?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(cfg.seed),
            cfg,
            count_noise,
            speed_noise,
        })
    }

    fn jitter(&mut self, base: i64, spread: i64) -> i64 {
        base + self.rng.gen_range(-spread..=spread)
    }

    pub fn draw_profile(&mut self, day: u32) -> DayProfile {
        let (bp, pj) = (self.cfg.base_peak, self.cfg.peak_jitter);
        let (bw, wj) = (self.cfg.base_width, self.cfg.width_jitter);
        let (ba, aj) = (self.cfg.base_amplitude, self.cfg.amplitude_jitter);
        DayProfile {
            day,
            peak: self.jitter(bp, pj),
            width: self.jitter(bw, wj),
            amplitude: self.jitter(ba, aj),
        }
    }

    /// One day of records for `profile`, steps `0..steps_per_day`.
    pub fn day(&mut self, profile: &DayProfile) -> Vec<TelemetryRecord> {
        let cfg = &self.cfg;
        let amplitude = profile.amplitude as f64;
        let mut out = Vec::with_capacity(cfg.steps_per_day);

        for step in 0..cfg.steps_per_day {
            let count = (profile.bell(step) + self.count_noise.sample(&mut self.rng)).max(0.0) as u32;
            let drop = (count as f64 / amplitude) * (cfg.free_flow_speed - cfg.jam_speed);
            let speed = (cfg.free_flow_speed - drop + self.speed_noise.sample(&mut self.rng))
                .clamp(cfg.speed_min, cfg.speed_max);
            out.push(TelemetryRecord {
                step: step as u64,
                vehicle_count: count,
                avg_speed: round2(speed),
                day: Some(profile.day),
                timestamp: None,
            });
        }
        out
    }

    /// The whole corpus, days in order, plus the profiles that shaped it.
    pub fn generate(&mut self) -> (TelemetryTable, Vec<DayProfile>) {
        let first = self.cfg.first_day;
        let mut records = Vec::with_capacity(self.cfg.days as usize * self.cfg.steps_per_day);
        let mut profiles = Vec::with_capacity(self.cfg.days as usize);

        for day in first..first + self.cfg.days {
            let profile = self.draw_profile(day);
            records.extend(self.day(&profile));
            profiles.push(profile);
        }

        info!(
            "generated {} synthetic days ({} rows), seed {}",
            profiles.len(),
            records.len(),
            self.cfg.seed
        );
        (TelemetryTable::new(records), profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            days: 3,
            ..SyntheticConfig::default()
        }
    }

    fn noiseless(days: u32) -> SyntheticConfig {
        SyntheticConfig {
            days,
            peak_jitter: 0,
            width_jitter: 0,
            amplitude_jitter: 0,
            count_noise_sd: 0.0,
            speed_noise_sd: 0.0,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn test_rows_within_bounds() {
        let (table, profiles) = SyntheticGenerator::new(small()).unwrap().generate();
        assert_eq!(table.len(), 3 * 3600);
        assert_eq!(table.days(), vec![1, 2, 3]);
        for r in &table.records {
            assert!((1.0..=20.0).contains(&r.avg_speed), "speed {}", r.avg_speed);
            assert_eq!(r.avg_speed, round2(r.avg_speed));
        }
        for p in profiles {
            assert!((1500..=2100).contains(&p.peak));
            assert!((550..=650).contains(&p.width));
            assert!((150..=210).contains(&p.amplitude));
        }
    }

    #[test]
    fn test_noiseless_peak_matches_profile() {
        let (table, _) = SyntheticGenerator::new(noiseless(1)).unwrap().generate();
        let counts: Vec<u32> = table.records.iter().map(|r| r.vehicle_count).collect();
        assert_eq!(counts[1800], 180);
        assert_eq!(counts[0], (180.0 * (-4.5f64).exp()) as u32);
        assert_eq!(counts[0], 1);
        let argmax = counts
            .iter()
            .enumerate()
            .max_by_key(|(i, c)| (**c, std::cmp::Reverse(*i)))
            .map(|(i, _)| i);
        assert_eq!(argmax, Some(1800));
        // Speed at the peak is the jam speed.
        assert_eq!(table.records[1800].avg_speed, 2.0);
    }

    #[test]
    fn test_peak_within_jitter() {
        let cfg = SyntheticConfig {
            days: 10,
            count_noise_sd: 0.0,
            ..SyntheticConfig::default()
        };
        let (table, profiles) = SyntheticGenerator::new(cfg).unwrap().generate();
        for (day, p) in table.records.chunks(3600).zip(&profiles) {
            let peak_count = day.iter().map(|r| r.vehicle_count).max().unwrap();
            let first_peak = day.iter().position(|r| r.vehicle_count == peak_count).unwrap() as i64;
            assert!((first_peak - 1800).abs() <= 300, "day {} peak at {}", p.day, first_peak);
            assert!((first_peak - p.peak).abs() <= 60);
        }
    }

    #[test]
    fn test_seed_reproduces_table() {
        let (a, pa) = SyntheticGenerator::new(small()).unwrap().generate();
        let (b, pb) = SyntheticGenerator::new(small()).unwrap().generate();
        assert_eq!(a, b);
        assert_eq!(pa, pb);

        let (c, _) = SyntheticGenerator::new(SyntheticConfig {
            seed: 8,
            ..small()
        })
        .unwrap()
        .generate();
        assert_ne!(a, c);
    }

    #[test]
    fn test_first_day_offset() {
        let cfg = SyntheticConfig {
            days: 2,
            first_day: 10,
            steps_per_day: 5,
            ..SyntheticConfig::default()
        };
        let (table, _) = SyntheticGenerator::new(cfg).unwrap().generate();
        assert_eq!(table.days(), vec![10, 11]);
    }
}

//! Deterministic stand-in for the external traffic simulator.
//!
//! Each intersection controls two approaches of `lanes_per_approach` lanes and
//! cycles a four-phase program: green A, yellow A, green B, yellow B. Trips
//! depart on a bell-shaped schedule fixed at startup, occasionally reach a
//! stop line, queue there while their lane is not green, and discharge a few
//! vehicles per tick once it is. Moving speed falls with network occupancy.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{EngineError, EngineLauncher, EngineSession, IntersectionId, LaneId, LightState, PhaseIndicator};
use crate::config::{EngineConfig, SurrogateConfig};

const PHASES: usize = 4;
/// Moving vehicles never drop below this fraction of their desired speed.
const MIN_SPEED_FACTOR: f64 = 0.15;

#[derive(Debug, Clone, Copy, Default)]
pub struct SurrogateLauncher;

impl EngineLauncher for SurrogateLauncher {
    type Session = SurrogateSession;

    fn start(&self, config: &EngineConfig) -> Result<SurrogateSession, EngineError> {
        SurrogateSession::new(&config.surrogate, config.seed)
    }
}

#[derive(Debug, Clone)]
struct Vehicle {
    lane: usize,
    remaining: u64,
    desired: f64,
    halted: bool,
}

#[derive(Debug, Clone)]
struct Signal {
    id: IntersectionId,
    /// Global lane indices; the first half is approach A.
    lanes: Vec<usize>,
    phase: usize,
    duration: f64,
    elapsed: f64,
}

impl Signal {
    fn light(&self, slot: usize, per_approach: usize) -> LightState {
        let approach_a = slot < per_approach;
        match (self.phase, approach_a) {
            (0, true) | (2, false) => LightState::Green,
            (1, true) | (3, false) => LightState::Yellow,
            _ => LightState::Red,
        }
    }
}

#[derive(Debug)]
pub struct SurrogateSession {
    cfg: SurrogateConfig,
    rng: ChaCha8Rng,
    tick: u64,
    /// Departure ticks, ascending.
    schedule: Vec<u64>,
    next_departure: usize,
    vehicles: Vec<Vehicle>,
    signals: Vec<Signal>,
    lane_names: Vec<LaneId>,
    lane_lookup: HashMap<LaneId, usize>,
    /// Owning signal and slot of each global lane.
    lane_owner: Vec<(usize, usize)>,
    halts: Vec<u32>,
    closed: bool,
}

impl SurrogateSession {
    pub fn new(cfg: &SurrogateConfig, seed: u64) -> Result<Self, EngineError> {
        if cfg.fail_on_start {
            return Err(EngineError::new("surrogate configured to refuse startup"));
        }
        if cfg.intersections == 0 || cfg.lanes_per_approach == 0 {
            return Err(EngineError::new("surrogate needs at least one intersection and lane"));
        }
        if cfg.trip_steps.0 == 0 || cfg.trip_steps.0 > cfg.trip_steps.1 {
            return Err(EngineError::new("surrogate trip_steps must be a non-empty positive range"));
        }
        if !(cfg.desired_speed.0 <= cfg.desired_speed.1) || cfg.demand_width <= 0.0 {
            return Err(EngineError::new("surrogate demand/speed parameters are inconsistent"));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut schedule = Vec::new();
        for t in 0..cfg.demand_steps {
            let dt = t as f64 - cfg.demand_peak;
            let rate = cfg.peak_arrivals * (-(dt * dt) / (2.0 * cfg.demand_width * cfg.demand_width)).exp();
            let mut arrivals = rate.floor() as u64;
            if rng.gen::<f64>() < rate.fract() {
                arrivals += 1;
            }
            schedule.extend(std::iter::repeat(t).take(arrivals as usize));
        }

        let per_approach = cfg.lanes_per_approach;
        let mut signals = Vec::with_capacity(cfg.intersections);
        let mut lane_names = Vec::new();
        let mut lane_owner = Vec::new();
        for i in 0..cfg.intersections {
            let id = format!("J{}", i);
            let mut lanes = Vec::with_capacity(per_approach * 2);
            for slot in 0..per_approach * 2 {
                let approach = if slot < per_approach { 'a' } else { 'b' };
                lanes.push(lane_names.len());
                lane_names.push(format!("{}_{}_{}", id, approach, slot % per_approach));
                lane_owner.push((i, slot));
            }
            signals.push(Signal {
                id,
                lanes,
                phase: 0,
                duration: cfg.green_duration,
                elapsed: 0.0,
            });
        }
        let lane_lookup = lane_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        let halts = vec![0; lane_names.len()];

        info!(
            "surrogate engine started: {} intersections, {} lanes, {} scheduled trips",
            signals.len(),
            lane_names.len(),
            schedule.len()
        );

        Ok(Self {
            cfg: cfg.clone(),
            rng,
            tick: 0,
            schedule,
            next_departure: 0,
            vehicles: Vec::new(),
            signals,
            lane_names,
            lane_lookup,
            lane_owner,
            halts,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::new("engine session is closed"))
        } else {
            Ok(())
        }
    }

    fn lane_light(&self, lane: usize) -> LightState {
        let (sig, slot) = self.lane_owner[lane];
        self.signals[sig].light(slot, self.cfg.lanes_per_approach)
    }

    fn signal(&self, id: &str) -> Result<&Signal, EngineError> {
        self.signals
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::new(format!("unknown intersection {}", id)))
    }

    fn advance_signals(&mut self) {
        let (green, yellow) = (self.cfg.green_duration, self.cfg.yellow_duration);
        for s in &mut self.signals {
            s.elapsed += 1.0;
            if s.elapsed >= s.duration {
                s.phase = (s.phase + 1) % PHASES;
                s.elapsed = 0.0;
                s.duration = if s.phase % 2 == 0 { green } else { yellow };
                debug!("{} -> phase {}", s.id, s.phase);
            }
        }
    }

    fn depart(&mut self) {
        let lanes = self.lane_names.len();
        while self.next_departure < self.schedule.len() && self.schedule[self.next_departure] <= self.tick {
            let (lo, hi) = self.cfg.trip_steps;
            let (slow, fast) = self.cfg.desired_speed;
            let vehicle = Vehicle {
                lane: self.rng.gen_range(0..lanes),
                remaining: self.rng.gen_range(lo..=hi),
                desired: if fast > slow { self.rng.gen_range(slow..fast) } else { slow },
                halted: false,
            };
            self.vehicles.push(vehicle);
            self.next_departure += 1;
        }
    }

    fn move_vehicles(&mut self) {
        let lanes = self.lane_names.len();
        let mut budget = vec![self.cfg.discharge_per_step; lanes];
        let go: Vec<bool> = (0..lanes).map(|l| self.lane_light(l).is_go()).collect();

        let mut kept = Vec::with_capacity(self.vehicles.len());
        for mut v in std::mem::take(&mut self.vehicles) {
            if v.halted {
                if go[v.lane] && budget[v.lane] > 0 {
                    budget[v.lane] -= 1;
                    v.halted = false;
                    // Crossed the junction; continue on another link.
                    v.lane = self.rng.gen_range(0..lanes);
                }
                kept.push(v);
                continue;
            }

            v.remaining = v.remaining.saturating_sub(1);
            if v.remaining == 0 {
                continue;
            }
            if self.rng.gen::<f64>() < self.cfg.junction_probability {
                if go[v.lane] {
                    v.lane = self.rng.gen_range(0..lanes);
                } else {
                    v.halted = true;
                }
            }
            kept.push(v);
        }
        self.vehicles = kept;

        self.halts.iter_mut().for_each(|h| *h = 0);
        for v in &self.vehicles {
            if v.halted {
                self.halts[v.lane] += 1;
            }
        }
    }
}

impl EngineSession for SurrogateSession {
    fn step(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.cfg.fail_at_step == Some(self.tick) {
            return Err(EngineError::new(format!("injected failure at tick {}", self.tick)));
        }
        self.advance_signals();
        self.depart();
        self.move_vehicles();
        self.tick += 1;
        Ok(())
    }

    fn vehicle_speeds(&self) -> Result<Vec<f64>, EngineError> {
        self.ensure_open()?;
        let occupancy = self.vehicles.len() as f64 / self.cfg.capacity.max(1) as f64;
        let factor = (1.0 - occupancy).max(MIN_SPEED_FACTOR);
        Ok(self
            .vehicles
            .iter()
            .map(|v| if v.halted { 0.0 } else { v.desired * factor })
            .collect())
    }

    fn vehicle_count(&self) -> Result<u32, EngineError> {
        self.ensure_open()?;
        Ok(self.vehicles.len() as u32)
    }

    fn intersections(&self) -> Result<Vec<IntersectionId>, EngineError> {
        self.ensure_open()?;
        Ok(self.signals.iter().map(|s| s.id.clone()).collect())
    }

    fn controlled_lanes(&self, intersection: &str) -> Result<Vec<LaneId>, EngineError> {
        self.ensure_open()?;
        let s = self.signal(intersection)?;
        Ok(s.lanes.iter().map(|&l| self.lane_names[l].clone()).collect())
    }

    fn halting_count(&self, lane: &str) -> Result<u32, EngineError> {
        self.ensure_open()?;
        self.lane_lookup
            .get(lane)
            .map(|&l| self.halts[l])
            .ok_or_else(|| EngineError::new(format!("unknown lane {}", lane)))
    }

    fn phase_state(&self, intersection: &str) -> Result<PhaseIndicator, EngineError> {
        self.ensure_open()?;
        let s = self.signal(intersection)?;
        let per_approach = self.cfg.lanes_per_approach;
        Ok(PhaseIndicator(
            (0..s.lanes.len()).map(|slot| s.light(slot, per_approach)).collect(),
        ))
    }

    fn phase_duration(&self, intersection: &str) -> Result<f64, EngineError> {
        self.ensure_open()?;
        Ok(self.signal(intersection)?.duration)
    }

    fn set_phase_duration(&mut self, intersection: &str, value: f64) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !value.is_finite() || value < 0.0 {
            return Err(EngineError::new(format!("invalid phase duration {}", value)));
        }
        let s = self
            .signals
            .iter_mut()
            .find(|s| s.id == intersection)
            .ok_or_else(|| EngineError::new(format!("unknown intersection {}", intersection)))?;
        s.duration = value;
        Ok(())
    }

    fn remaining_demand(&self) -> Result<u32, EngineError> {
        self.ensure_open()?;
        let pending = self.schedule.len() - self.next_departure;
        Ok((self.vehicles.len() + pending) as u32)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.vehicles.clear();
            info!("surrogate engine closed at tick {}", self.tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SurrogateConfig {
        SurrogateConfig {
            intersections: 2,
            lanes_per_approach: 2,
            demand_steps: 200,
            demand_peak: 100.0,
            demand_width: 40.0,
            peak_arrivals: 1.5,
            trip_steps: (20, 60),
            junction_probability: 0.1,
            ..SurrogateConfig::default()
        }
    }

    #[test]
    fn test_demand_drains_to_zero() {
        let mut s = SurrogateSession::new(&small(), 1).unwrap();
        assert!(s.remaining_demand().unwrap() > 0);

        let mut ticks = 0;
        while s.remaining_demand().unwrap() > 0 {
            s.step().unwrap();
            ticks += 1;
            assert!(ticks < 10_000, "demand never drained");
        }
        assert_eq!(s.vehicle_count().unwrap(), 0);
    }

    #[test]
    fn test_same_seed_same_run() {
        let mut a = SurrogateSession::new(&small(), 9).unwrap();
        let mut b = SurrogateSession::new(&small(), 9).unwrap();
        for _ in 0..150 {
            a.step().unwrap();
            b.step().unwrap();
            assert_eq!(a.vehicle_speeds().unwrap(), b.vehicle_speeds().unwrap());
        }
    }

    #[test]
    fn test_phase_program_cycles() {
        let cfg = SurrogateConfig {
            green_duration: 3.0,
            yellow_duration: 1.0,
            ..small()
        };
        let mut s = SurrogateSession::new(&cfg, 0).unwrap();
        assert_eq!(s.phase_state("J0").unwrap().to_string(), "GGrr");
        for _ in 0..3 {
            s.step().unwrap();
        }
        assert_eq!(s.phase_state("J0").unwrap().to_string(), "yyrr");
        s.step().unwrap();
        assert_eq!(s.phase_state("J0").unwrap().to_string(), "rrGG");
    }

    #[test]
    fn test_set_phase_duration_extends_green() {
        let cfg = SurrogateConfig {
            green_duration: 3.0,
            ..small()
        };
        let mut s = SurrogateSession::new(&cfg, 0).unwrap();
        let d = s.phase_duration("J1").unwrap();
        s.set_phase_duration("J1", d + 10.0).unwrap();
        for _ in 0..5 {
            s.step().unwrap();
        }
        assert!(s.phase_state("J1").unwrap().any_go());
        assert_eq!(s.phase_state("J1").unwrap().to_string(), "GGrr");
        // J0 was not extended and has moved on.
        assert_ne!(s.phase_state("J0").unwrap().to_string(), "GGrr");
    }

    #[test]
    fn test_fault_injection() {
        let cfg = SurrogateConfig {
            fail_on_start: true,
            ..small()
        };
        assert!(SurrogateSession::new(&cfg, 0).is_err());

        let cfg = SurrogateConfig {
            fail_at_step: Some(2),
            ..small()
        };
        let mut s = SurrogateSession::new(&cfg, 0).unwrap();
        s.step().unwrap();
        s.step().unwrap();
        assert!(s.step().is_err());
    }

    #[test]
    fn test_closed_session_rejects_queries() {
        let mut s = SurrogateSession::new(&small(), 0).unwrap();
        s.close();
        s.close();
        assert!(s.is_closed());
        assert!(s.step().is_err());
        assert!(s.vehicle_count().is_err());
    }

    #[test]
    fn test_unknown_lane() {
        let s = SurrogateSession::new(&small(), 0).unwrap();
        assert!(s.halting_count("nope").is_err());
        let lanes = s.controlled_lanes("J0").unwrap();
        assert_eq!(lanes.len(), 4);
        assert_eq!(s.halting_count(&lanes[0]).unwrap(), 0);
    }
}

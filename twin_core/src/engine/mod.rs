//! Simulation engine control surface.
//!
//! The physics/routing engine is an external collaborator. The twin only
//! talks to it through [`EngineLauncher`] (startup) and [`EngineSession`]
//! (per-tick queries and the one command the signal policy issues).
//! [`surrogate`] provides a self-contained implementation for local runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::EngineConfig;

pub mod surrogate;

pub type IntersectionId = String;
pub type LaneId = String;

/// Error reported by the engine collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Signal state of one controlled lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightState {
    Red,
    Yellow,
    Green,
}

impl LightState {
    /// Whether traffic on this lane may proceed.
    pub fn is_go(self) -> bool {
        matches!(self, LightState::Green)
    }

    /// Decode an engine per-lane state character.
    ///
    /// `G`/`g` (priority / yielding green) map to green, `y`/`Y`/`u` to yellow,
    /// `r`/`R`/`s`/`o`/`O` (red, stop-on-red, off) to red.
    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'G' | 'g' => Some(LightState::Green),
            'y' | 'Y' | 'u' => Some(LightState::Yellow),
            'r' | 'R' | 's' | 'o' | 'O' => Some(LightState::Red),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            LightState::Red => 'r',
            LightState::Yellow => 'y',
            LightState::Green => 'G',
        }
    }
}

/// Per-lane signal states of one intersection, in controlled-lane order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PhaseIndicator(pub Vec<LightState>);

impl PhaseIndicator {
    pub fn parse(code: &str) -> Result<Self, EngineError> {
        code.chars()
            .map(|c| {
                LightState::from_code(c).ok_or_else(|| {
                    EngineError::new(format!("unknown signal state {:?} in {:?}", c, code))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(PhaseIndicator)
    }

    /// At least one lane is in a go state.
    pub fn any_go(&self) -> bool {
        self.0.iter().any(|s| s.is_go())
    }
}

impl fmt::Display for PhaseIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.0 {
            write!(f, "{}", s.code())?;
        }
        Ok(())
    }
}

/// Starts engine sessions. Startup failure is fatal to a run.
pub trait EngineLauncher {
    type Session: EngineSession;

    fn start(&self, config: &EngineConfig) -> Result<Self::Session, EngineError>;
}

/// A live connection to a running simulation.
pub trait EngineSession {
    /// Advance one tick. Blocks until the engine reports completion.
    fn step(&mut self) -> Result<(), EngineError>;

    fn vehicle_speeds(&self) -> Result<Vec<f64>, EngineError>;

    fn vehicle_count(&self) -> Result<u32, EngineError>;

    fn intersections(&self) -> Result<Vec<IntersectionId>, EngineError>;

    fn controlled_lanes(&self, intersection: &str) -> Result<Vec<LaneId>, EngineError>;

    fn halting_count(&self, lane: &str) -> Result<u32, EngineError>;

    fn phase_state(&self, intersection: &str) -> Result<PhaseIndicator, EngineError>;

    fn phase_duration(&self, intersection: &str) -> Result<f64, EngineError>;

    fn set_phase_duration(&mut self, intersection: &str, value: f64) -> Result<(), EngineError>;

    /// Vehicles still running or yet to depart. Zero ends the run.
    fn remaining_demand(&self) -> Result<u32, EngineError>;

    /// Release the connection. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Queue and phase state of one intersection at the current tick.
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionSnapshot {
    pub id: IntersectionId,
    pub lane_halts: Vec<(LaneId, u32)>,
    pub phase: PhaseIndicator,
    pub phase_duration: f64,
}

impl IntersectionSnapshot {
    /// Longest queue over the controlled lanes.
    pub fn max_queue(&self) -> u32 {
        self.lane_halts.iter().map(|(_, h)| *h).max().unwrap_or(0)
    }
}

/// Everything the policy and the harvester need from one tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorSnapshot {
    pub vehicle_count: u32,
    pub speeds: Vec<f64>,
    pub intersections: Vec<IntersectionSnapshot>,
}

impl SensorSnapshot {
    /// Vehicle-level state only; intersections are left empty.
    pub fn capture_vehicles<S: EngineSession + ?Sized>(session: &S) -> Result<Self, EngineError> {
        Ok(Self {
            vehicle_count: session.vehicle_count()?,
            speeds: session.vehicle_speeds()?,
            intersections: Vec::new(),
        })
    }

    /// Query the session for the current tick's network state.
    pub fn capture<S: EngineSession + ?Sized>(session: &S) -> Result<Self, EngineError> {
        let vehicle_count = session.vehicle_count()?;
        let speeds = session.vehicle_speeds()?;

        let ids = session.intersections()?;
        let mut intersections = Vec::with_capacity(ids.len());
        for id in ids {
            let lanes = session.controlled_lanes(&id)?;
            let mut lane_halts = Vec::with_capacity(lanes.len());
            for lane in lanes {
                let halts = session.halting_count(&lane)?;
                lane_halts.push((lane, halts));
            }
            let phase = session.phase_state(&id)?;
            let phase_duration = session.phase_duration(&id)?;
            intersections.push(IntersectionSnapshot {
                id,
                lane_halts,
                phase,
                phase_duration,
            });
        }

        Ok(Self {
            vehicle_count,
            speeds,
            intersections,
        })
    }
}

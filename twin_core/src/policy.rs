//! Adaptive signal control.
//!
//! Each intersection is judged on its own: when the longest queue on any
//! controlled lane exceeds the threshold while at least one lane shows green,
//! the current phase is stretched by a fixed increment. Repeated stretches of
//! the same phase are capped so conflicting approaches are not starved.

use std::collections::HashMap;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::engine::{EngineError, EngineSession, IntersectionId, IntersectionSnapshot, PhaseIndicator, SensorSnapshot};

/// Interventions are logged once every this many steps.
const LOG_EVERY_STEPS: u64 = 100;

/// Outcome of evaluating the rule for one intersection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyAction {
    Hold,
    /// Set the current phase duration to this value.
    Extend { duration: f64 },
    /// The rule fired but the phase already received its full allowance.
    Capped,
}

/// Evaluate the extension rule.
///
/// # Arguments
/// * `cfg` - Threshold, increment and cap
/// * `snapshot` - Queue and phase state of the intersection
/// * `already_extended` - Extension already applied to the current phase
pub fn decide(cfg: &PolicyConfig, snapshot: &IntersectionSnapshot, already_extended: f64) -> PolicyAction {
    if snapshot.max_queue() <= cfg.queue_threshold || !snapshot.phase.any_go() {
        return PolicyAction::Hold;
    }
    if already_extended + cfg.extension > cfg.max_extension_per_phase {
        return PolicyAction::Capped;
    }
    PolicyAction::Extend {
        duration: snapshot.phase_duration + cfg.extension,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyStats {
    pub evaluations: u64,
    pub extensions: u64,
    pub capped: u64,
}

#[derive(Debug, Clone)]
struct PhaseLedger {
    phase: PhaseIndicator,
    extended: f64,
}

/// Applies [`decide`] to a live session. The only writer of phase durations.
#[derive(Debug, Clone)]
pub struct SignalController {
    cfg: PolicyConfig,
    ledger: HashMap<IntersectionId, PhaseLedger>,
    stats: PolicyStats,
}

impl SignalController {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self {
            cfg,
            ledger: HashMap::new(),
            stats: PolicyStats::default(),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    pub fn stats(&self) -> PolicyStats {
        self.stats
    }

    /// Whether the policy runs on this step.
    pub fn is_due(&self, step: u64) -> bool {
        step % self.cfg.cadence_steps == 0
    }

    /// Evaluate every intersection in `snapshot` and push extensions to the engine.
    ///
    /// Returns the number of phases extended on this step.
    pub fn apply<S: EngineSession + ?Sized>(
        &mut self,
        session: &mut S,
        snapshot: &SensorSnapshot,
        step: u64,
    ) -> Result<u32, EngineError> {
        let mut extended = 0;
        for tls in &snapshot.intersections {
            self.stats.evaluations += 1;

            let entry = self.ledger.entry(tls.id.clone()).or_insert_with(|| PhaseLedger {
                phase: tls.phase.clone(),
                extended: 0.0,
            });
            if entry.phase != tls.phase {
                entry.phase = tls.phase.clone();
                entry.extended = 0.0;
            }

            match decide(&self.cfg, tls, entry.extended) {
                PolicyAction::Hold => {}
                PolicyAction::Capped => {
                    self.stats.capped += 1;
                }
                PolicyAction::Extend { duration } => {
                    session.set_phase_duration(&tls.id, duration)?;
                    entry.extended += self.cfg.extension;
                    self.stats.extensions += 1;
                    extended += 1;
                    if step % LOG_EVERY_STEPS == 0 {
                        debug!(
                            "intervention at {}: queue={} phase={} extended green to {:.1}",
                            tls.id,
                            tls.max_queue(),
                            tls.phase,
                            duration
                        );
                    }
                }
            }
        }
        Ok(extended)
    }
}

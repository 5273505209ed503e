//! Simulation step loop.
//!
//! One run = one engine session. Every tick the driver advances the engine,
//! lets the signal controller react to the new queues, and harvests the
//! network state. The session and the telemetry buffer live in a [`RunScope`]
//! whose release (flush, then close) runs on every way out of the loop,
//! including unwinding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, HarvestConfig, PolicyConfig, TwinConfig};
use crate::engine::{EngineError, EngineLauncher, EngineSession, SensorSnapshot};
use crate::error::{Result, TwinError};
use crate::harvest::Harvester;
use crate::policy::{PolicyStats, SignalController};
use crate::telemetry::TelemetrySink;

const PROGRESS_EVERY_STEPS: u64 = 500;

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The step ceiling was reached.
    StepLimit,
    /// The engine reported no vehicles left to simulate.
    DemandExhausted,
    /// The stop predicate fired.
    Interrupted,
    /// A tick failed; the run stopped gracefully at `step`.
    StepFailed { step: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Completed ticks.
    pub steps: u64,
    /// Records written to the sink.
    pub records: usize,
    pub stop: StopReason,
    pub policy: PolicyStats,
}

impl RunReport {
    /// The step failure, if that is how the run ended.
    pub fn failure(&self) -> Option<TwinError> {
        match &self.stop {
            StopReason::StepFailed { step, reason } => Some(TwinError::EngineStep {
                step: *step,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// Shared stop flag raised from a signal handler and polled by the loop.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owns the engine session and the run buffer until released.
struct RunScope<'a, S: EngineSession, K: TelemetrySink + ?Sized> {
    session: S,
    harvester: Harvester,
    sink: &'a mut K,
    released: bool,
}

impl<'a, S: EngineSession, K: TelemetrySink + ?Sized> RunScope<'a, S, K> {
    fn new(session: S, harvester: Harvester, sink: &'a mut K) -> Self {
        Self {
            session,
            harvester,
            sink,
            released: false,
        }
    }

    /// Flush the buffer, then close the session, even if the flush failed.
    fn release(&mut self) -> Result<usize> {
        if self.released {
            return Ok(0);
        }
        self.released = true;
        let flushed = self.harvester.flush(&mut *self.sink);
        self.session.close();
        flushed
    }

    fn finish(mut self) -> Result<usize> {
        self.release()
    }
}

impl<'a, S: EngineSession, K: TelemetrySink + ?Sized> Drop for RunScope<'a, S, K> {
    fn drop(&mut self) {
        if !self.released {
            warn!("run scope dropped without release; flushing {} records", self.harvester.len());
            if let Err(e) = self.release() {
                error!("telemetry flush failed during unwind: {}", e);
            }
        }
    }
}

/// Drives one engine through the policy/harvest loop.
pub struct SimulationDriver<L: EngineLauncher> {
    launcher: L,
    engine: EngineConfig,
    policy: PolicyConfig,
    harvest: HarvestConfig,
}

impl<L: EngineLauncher> SimulationDriver<L> {
    pub fn new(launcher: L, cfg: &TwinConfig) -> Self {
        Self {
            launcher,
            engine: cfg.simulation.engine.clone(),
            policy: cfg.policy.clone(),
            harvest: cfg.harvest.clone(),
        }
    }

    /// Run up to `max_steps` ticks, or until demand runs out or `stop` returns true.
    ///
    /// Fails only if the engine cannot start or the final flush fails. A
    /// failing tick ends the run with [`StopReason::StepFailed`]; whatever was
    /// harvested up to that point is flushed.
    ///
    /// # Arguments
    /// * `max_steps` - Step ceiling
    /// * `stop` - Polled before every tick; `true` interrupts the run
    /// * `sink` - Receives the run's telemetry exactly once
    pub fn run<K, F>(&self, max_steps: u64, mut stop: F, sink: &mut K) -> Result<RunReport>
    where
        K: TelemetrySink + ?Sized,
        F: FnMut() -> bool,
    {
        let session = self.launcher.start(&self.engine).map_err(|e| {
            error!("could not start engine: {}", e);
            TwinError::EngineStartup(e.0)
        })?;
        info!("simulation initialized, scenario {}", self.engine.scenario.display());

        let mut scope = RunScope::new(session, Harvester::new(self.harvest.clone()), sink);
        let mut controller = SignalController::new(self.policy.clone());
        let mut step: u64 = 0;

        let reason = loop {
            if stop() {
                info!("simulation interrupted at step {}", step);
                break StopReason::Interrupted;
            }
            if step >= max_steps {
                break StopReason::StepLimit;
            }
            match scope.session.remaining_demand() {
                Ok(0) => break StopReason::DemandExhausted,
                Ok(_) => {}
                Err(e) => break Self::failed(step, e),
            }
            if let Err(e) = Self::tick(&mut scope, &mut controller, step) {
                break Self::failed(step, e);
            }
            step += 1;
            if step % PROGRESS_EVERY_STEPS == 0 {
                info!(
                    "step {}: {} vehicles, {} extensions so far",
                    step,
                    scope.harvester.records().last().map(|r| r.vehicle_count).unwrap_or(0),
                    controller.stats().extensions
                );
            }
        };

        let records = scope.finish()?;
        info!("simulation session ended after {} steps ({:?})", step, reason);

        Ok(RunReport {
            steps: step,
            records,
            stop: reason,
            policy: controller.stats(),
        })
    }

    fn tick<S: EngineSession, K: TelemetrySink + ?Sized>(
        scope: &mut RunScope<'_, S, K>,
        controller: &mut SignalController,
        step: u64,
    ) -> std::result::Result<(), EngineError> {
        scope.session.step()?;
        let snapshot = if controller.is_due(step) {
            let snapshot = SensorSnapshot::capture(&scope.session)?;
            controller.apply(&mut scope.session, &snapshot, step)?;
            snapshot
        } else {
            SensorSnapshot::capture_vehicles(&scope.session)?
        };
        scope.harvester.record(&snapshot, step);
        Ok(())
    }

    fn failed(step: u64, e: EngineError) -> StopReason {
        warn!("engine step {} failed, stopping run: {}", step, e);
        StopReason::StepFailed { step, reason: e.0 }
    }
}

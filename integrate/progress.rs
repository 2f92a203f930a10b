use crate::convergence::ConvergenceState;
use crate::types::EngineKind;
use std::fmt;

/// Stages reported while an engine runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineStage {
    Initialization,
    Optimization,
    Restart(usize),
}

impl EngineStage {
    pub fn describe(self) -> String {
        match self {
            Self::Initialization => "initialization".to_string(),
            Self::Optimization => "optimization".to_string(),
            Self::Restart(index) => format!("restart {index}"),
        }
    }
}

impl fmt::Display for EngineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Observer for reporting incremental progress of an iterative engine.
///
/// Observers are shared across rayon workers when restarts run in parallel.
pub trait IterationObserver: Sync {
    fn on_stage_start(&self, engine: EngineKind, stage: EngineStage, max_iterations: usize) {
        let _ = (engine, stage, max_iterations);
    }
    fn on_iteration(&self, engine: EngineKind, stage: EngineStage, iteration: usize, objective: f64) {
        let _ = (engine, stage, iteration, objective);
    }
    fn on_stage_finish(&self, engine: EngineKind, stage: EngineStage, state: ConvergenceState) {
        let _ = (engine, stage, state);
    }
}

#[derive(Default)]
pub struct NoopObserver;

impl IterationObserver for NoopObserver {}

/// Forwards progress to the `log` facade: stage boundaries at `info`, iterations at `debug`.
#[derive(Default)]
pub struct LogObserver;

impl IterationObserver for LogObserver {
    fn on_stage_start(&self, engine: EngineKind, stage: EngineStage, max_iterations: usize) {
        log::info!("[{engine}] {stage} started (at most {max_iterations} iterations)");
    }

    fn on_iteration(&self, engine: EngineKind, stage: EngineStage, iteration: usize, objective: f64) {
        log::debug!("[{engine}] {stage} iteration {iteration}: objective {objective:.6e}");
    }

    fn on_stage_finish(&self, engine: EngineKind, stage: EngineStage, state: ConvergenceState) {
        match state {
            ConvergenceState::MaxIterReached => {
                log::warn!("[{engine}] {stage} hit its iteration cap before converging")
            }
            other => log::info!("[{engine}] {stage} finished: {other:?}"),
        }
    }
}

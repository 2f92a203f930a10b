use serde::{Deserialize, Serialize};

/// Where an iterative engine is in its run.
///
/// Runs move `Initialized -> Iterating -> Converged | MaxIterReached` and never leave
/// a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    /// Starting values exist but no objective has been recorded.
    Initialized,
    /// At least one objective has been recorded and the budget is not spent.
    Iterating,
    /// The relative improvement between consecutive iterations fell below tolerance.
    Converged,
    /// The iteration budget ran out first. The result is usable but unverified.
    MaxIterReached,
}

/// Whether a smaller or larger objective is better.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Objective {
    Minimize,
    Maximize,
}

/// Drives the convergence state machine for one optimization run.
#[derive(Clone, Debug)]
pub struct ConvergenceTracker {
    objective: Objective,
    tolerance: f64,
    max_iterations: usize,
    state: ConvergenceState,
    trace: Vec<f64>,
    best: Option<usize>,
}

impl ConvergenceTracker {
    pub fn new(objective: Objective, tolerance: f64, max_iterations: usize) -> Self {
        Self {
            objective,
            tolerance,
            max_iterations,
            state: ConvergenceState::Initialized,
            trace: Vec::with_capacity(max_iterations + 1),
            best: None,
        }
    }

    /// Records the objective at the starting point.
    pub fn start(&mut self, initial: f64) {
        debug_assert_eq!(self.state, ConvergenceState::Initialized);
        self.trace.push(initial);
        self.best = Some(0);
        self.state = if self.max_iterations == 0 {
            ConvergenceState::MaxIterReached
        } else {
            ConvergenceState::Iterating
        };
    }

    /// Records the objective after one completed iteration and returns the new state.
    pub fn record(&mut self, value: f64) -> ConvergenceState {
        if self.state != ConvergenceState::Iterating {
            return self.state;
        }
        let previous = self.trace[self.trace.len() - 1];
        self.trace.push(value);

        let latest = self.trace.len() - 1;
        if let Some(best) = self.best {
            if self.is_better(value, self.trace[best]) {
                self.best = Some(latest);
            }
        }

        let improvement = match self.objective {
            Objective::Minimize => previous - value,
            Objective::Maximize => value - previous,
        };
        let scale = previous.abs().max(f64::MIN_POSITIVE);
        let relative = improvement / scale;

        if !value.is_finite() {
            log::warn!("Objective became non-finite at iteration {latest}; stopping");
            self.state = ConvergenceState::MaxIterReached;
        } else if relative < self.tolerance {
            self.state = ConvergenceState::Converged;
        } else if self.iterations() >= self.max_iterations {
            self.state = ConvergenceState::MaxIterReached;
        }
        self.state
    }

    fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        if !candidate.is_finite() {
            return false;
        }
        match self.objective {
            Objective::Minimize => candidate < incumbent,
            Objective::Maximize => candidate > incumbent,
        }
    }

    pub fn state(&self) -> ConvergenceState {
        self.state
    }

    pub fn is_iterating(&self) -> bool {
        self.state == ConvergenceState::Iterating
    }

    /// Completed iterations, not counting the starting point.
    pub fn iterations(&self) -> usize {
        self.trace.len().saturating_sub(1)
    }

    /// True when the most recent record is the best seen so far.
    pub fn latest_is_best(&self) -> bool {
        self.best == Some(self.trace.len().saturating_sub(1))
    }

    pub fn finish(self) -> ConvergenceReport {
        let best_objective = self
            .best
            .map(|i| self.trace[i])
            .unwrap_or(f64::NAN);
        ConvergenceReport {
            state: self.state,
            iterations: self.iterations(),
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            best_objective,
            objective_trace: self.trace,
        }
    }
}

/// Summary of how an iterative engine ended, kept alongside its result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub state: ConvergenceState,
    pub iterations: usize,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub best_objective: f64,
    /// Objective at the starting point followed by one entry per iteration.
    pub objective_trace: Vec<f64>,
}

impl ConvergenceReport {
    pub fn converged(&self) -> bool {
        self.state == ConvergenceState::Converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_when_relative_decrease_is_small() {
        let mut tracker = ConvergenceTracker::new(Objective::Minimize, 1e-3, 100);
        tracker.start(10.0);
        assert_eq!(tracker.record(5.0), ConvergenceState::Iterating);
        assert_eq!(tracker.record(4.999), ConvergenceState::Converged);
        let report = tracker.finish();
        assert!(report.converged());
        assert_eq!(report.iterations, 2);
        assert_eq!(report.objective_trace, vec![10.0, 5.0, 4.999]);
        assert_eq!(report.best_objective, 4.999);
    }

    #[test]
    fn reports_exhausted_budget() {
        let mut tracker = ConvergenceTracker::new(Objective::Maximize, 1e-12, 3);
        tracker.start(-100.0);
        tracker.record(-50.0);
        tracker.record(-20.0);
        assert_eq!(tracker.record(-10.0), ConvergenceState::MaxIterReached);
        assert_eq!(tracker.record(-1.0), ConvergenceState::MaxIterReached);
        let report = tracker.finish();
        assert!(!report.converged());
        assert_eq!(report.iterations, 3);
    }

    #[test]
    fn zero_budget_is_exhausted_immediately() {
        let mut tracker = ConvergenceTracker::new(Objective::Minimize, 1e-6, 0);
        assert_eq!(tracker.state(), ConvergenceState::Initialized);
        tracker.start(1.0);
        assert_eq!(tracker.state(), ConvergenceState::MaxIterReached);
        assert!(!tracker.is_iterating());
    }

    #[test]
    fn tracks_best_record() {
        let mut tracker = ConvergenceTracker::new(Objective::Minimize, 0.0, 10);
        tracker.start(3.0);
        tracker.record(2.0);
        assert!(tracker.latest_is_best());
        tracker.record(2.5);
        assert!(!tracker.latest_is_best());
    }
}

//! The integration driver.
//!
//! [`Simulator::run`] owns the stepping loop: it sizes each step so scheduled
//! event executions and output points are hit exactly, localises trigger
//! transitions inside accepted steps by bisection, hands every accepted point
//! to the event system and restarts the integrator whenever events change
//! the state.

use crate::context::ModelContext;
use crate::error::{SimError, SimResult};
use crate::model::ModelDefinition;
use crate::results::ResultTable;
use crate::settings::{OutputMode, SolverSettings};
use crate::solvers::{Integrator, StepOutcome};
use crate::traits::EventSystem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Bisection never needs more halvings than this to reach any positive
/// tolerance from a finite step.
const MAX_BISECTIONS: usize = 200;

/// Cooperative cancellation flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped between steps on request; the table ends at the last
    /// accepted point.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub evaluations: usize,
    pub events_fired: usize,
    /// Steps taken by the startup method of a multistep scheme.
    pub startup_steps: usize,
    /// Trigger transitions localised inside a step.
    pub roots_located: usize,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub table: ResultTable,
    pub status: RunStatus,
    pub stats: RunStats,
}

/// A run that stopped on an error, with everything recorded before it.
#[derive(Debug, Clone, Error)]
#[error("simulation failed at t = {time}: {error}")]
pub struct RunFailure {
    #[source]
    pub error: SimError,
    /// Last valid point.
    pub time: f64,
    pub state: Vec<f64>,
    pub partial: ResultTable,
    pub stats: RunStats,
}

impl RunFailure {
    fn setup(error: SimError) -> Self {
        Self {
            error,
            time: f64::NAN,
            state: Vec::new(),
            partial: ResultTable::new(Vec::new()),
            stats: RunStats::default(),
        }
    }
}

/// Output grid `t0 + k * interval`, tracked by index to avoid drift.
struct Grid {
    t0: f64,
    interval: f64,
    next: usize,
}

impl Grid {
    fn point(&self) -> f64 {
        self.t0 + self.next as f64 * self.interval
    }

    fn pass(&mut self, t: f64) {
        while self.point() <= t {
            self.next += 1;
        }
    }
}

/// Mutable state of one run, kept apart from the loop so a failure can
/// still report it.
struct Run {
    t: f64,
    y: Vec<f64>,
    table: ResultTable,
    stats: RunStats,
}

#[derive(Debug, Clone)]
pub struct Simulator {
    settings: SolverSettings,
    cancel: CancelToken,
}

impl Simulator {
    pub fn new(settings: SolverSettings) -> SimResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            cancel: CancelToken::new(),
        })
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Integrates `system` from `t0` to `t_end`.
    pub fn run<S: EventSystem + ?Sized>(
        &self,
        system: &mut S,
        t0: f64,
        t_end: f64,
    ) -> Result<RunOutput, RunFailure> {
        if !(t0.is_finite() && t_end.is_finite() && t_end >= t0) {
            return Err(RunFailure::setup(SimError::Configuration(format!(
                "invalid time span [{t0}, {t_end}]"
            ))));
        }
        let n = system.dimension();
        let y = system.initial_state_at(t0);
        if y.len() != n {
            return Err(RunFailure::setup(SimError::DimensionMismatch {
                expected: n,
                actual: y.len(),
            }));
        }
        let ids = system.variable_ids();
        if ids.len() != n {
            return Err(RunFailure::setup(SimError::DimensionMismatch {
                expected: n,
                actual: ids.len(),
            }));
        }

        let mut run = Run {
            t: t0,
            y,
            table: ResultTable::new(ids),
            stats: RunStats::default(),
        };
        let mut integrator = Integrator::new(&self.settings, n);
        debug!(method = integrator.name(), dimension = n, t0, t_end, "run started");

        let result = self.drive(system, &mut integrator, &mut run, t_end);
        run.stats.evaluations = integrator.evaluations();
        run.stats.startup_steps = integrator.startup_steps();
        match result {
            Ok(status) => {
                debug!(
                    ?status,
                    accepted = run.stats.accepted_steps,
                    rejected = run.stats.rejected_steps,
                    events = run.stats.events_fired,
                    "run finished"
                );
                Ok(RunOutput {
                    table: run.table,
                    status,
                    stats: run.stats,
                })
            }
            Err(error) => {
                debug!(%error, t = run.t, "run failed");
                Err(RunFailure {
                    error,
                    time: run.t,
                    state: run.y,
                    partial: run.table,
                    stats: run.stats,
                })
            }
        }
    }

    fn drive<S: EventSystem + ?Sized>(
        &self,
        system: &mut S,
        integrator: &mut Integrator,
        run: &mut Run,
        t_end: f64,
    ) -> SimResult<RunStatus> {
        let settings = &self.settings;
        let mut grid = match settings.output {
            OutputMode::Steps => None,
            OutputMode::Grid { interval } => Some(Grid {
                t0: run.t,
                interval,
                next: 1,
            }),
        };

        let outcome = system.initialize_events(run.t, &mut run.y)?;
        run.stats.events_fired += outcome.fired;
        if system.has_fast_processes() {
            system.enforce_consistency(run.t, &mut run.y)?;
        }
        crate::solvers::check_finite(run.t, &run.y)?;
        run.table.add_row(run.t, &run.y)?;

        let mut h = integrator.controller().clamp(settings.initial_step);
        let mut y_new = run.y.clone();
        let mut y_probe = run.y.clone();

        while run.t < t_end {
            if self.cancel.is_cancelled() {
                warn!(t = run.t, "run cancelled");
                return Ok(RunStatus::Cancelled);
            }
            if run.stats.accepted_steps + run.stats.rejected_steps >= settings.max_steps {
                return Err(SimError::NonConvergence {
                    time: run.t,
                    reason: format!("step limit of {} reached", settings.max_steps),
                });
            }

            // Land exactly on the end, the next scheduled execution and the
            // next output point.
            let mut target = t_end;
            if let Some(scheduled) = system.next_scheduled_time() {
                if scheduled > run.t && scheduled < target {
                    target = scheduled;
                }
            }
            if let Some(grid) = &grid {
                target = target.min(grid.point());
            }
            let (step, landing) = if run.t + h >= target {
                (target - run.t, true)
            } else {
                (h, false)
            };

            let next_step = match integrator.step(system, run.t, &run.y, step, &mut y_new)? {
                StepOutcome::Accepted { next_step, .. } => next_step,
                StepOutcome::Rejected { next_step, .. } => {
                    run.stats.rejected_steps += 1;
                    h = next_step;
                    continue;
                }
            };

            let mut t_new = if landing { target } else { run.t + step };
            let mut truncated = landing;
            if system.triggers_changed(t_new, &y_new)? {
                let root = self.locate(system, integrator, run, step, &y_new, &mut y_probe)?;
                if root < t_new {
                    trace!(from = run.t, root, "trigger transition localised");
                    t_new = root;
                    y_new.copy_from_slice(&y_probe);
                    truncated = true;
                }
                run.stats.roots_located += 1;
            }

            integrator.accept(t_new, &y_new);
            run.t = t_new;
            run.y.copy_from_slice(&y_new);
            run.stats.accepted_steps += 1;
            system.accept_step(run.t, &mut run.y)?;
            if system.has_fast_processes() && system.enforce_consistency(run.t, &mut run.y)? {
                integrator.reset();
            }
            crate::solvers::check_finite(run.t, &run.y)?;

            let on_grid = grid.as_ref().map_or(true, |g| run.t >= g.point());
            let record = on_grid || run.t >= t_end;
            if record {
                run.table.add_row(run.t, &run.y)?;
            }

            if self.settle_events(system, run)? {
                integrator.reset();
                crate::solvers::check_finite(run.t, &run.y)?;
                if record {
                    run.table.add_row(run.t, &run.y)?;
                }
            }

            if let Some(grid) = &mut grid {
                grid.pass(run.t);
            }
            h = if truncated { next_step.max(h) } else { next_step };
        }
        Ok(RunStatus::Completed)
    }

    /// Fires the events due at the current point. When they change the state,
    /// fast reactions are relaxed again and, if that moves the state, events
    /// are re-checked. Returns whether the state changed.
    fn settle_events<S: EventSystem + ?Sized>(
        &self,
        system: &mut S,
        run: &mut Run,
    ) -> SimResult<bool> {
        let mut changed = false;
        for _ in 0..self.settings.max_cascade {
            let outcome = system.process_events(run.t, &mut run.y)?;
            run.stats.events_fired += outcome.fired;
            if !outcome.state_changed {
                return Ok(changed);
            }
            changed = true;
            system.accept_step(run.t, &mut run.y)?;
            if !(system.has_fast_processes() && system.enforce_consistency(run.t, &mut run.y)?) {
                return Ok(true);
            }
        }
        Err(SimError::NonConvergence {
            time: run.t,
            reason: format!(
                "events and fast reactions still changing the state after {} rounds",
                self.settings.max_cascade
            ),
        })
    }

    /// Bisects the accepted step `(run.t, run.y) -> (run.t + step, y_end)`
    /// for the earliest point whose triggers differ from those at `run.t`.
    /// Leaves the state at the returned time in `y_root`.
    fn locate<S: EventSystem + ?Sized>(
        &self,
        system: &mut S,
        integrator: &mut Integrator,
        run: &Run,
        step: f64,
        y_end: &[f64],
        y_root: &mut [f64],
    ) -> SimResult<f64> {
        let tolerance = self.settings.root_tolerance;
        let (mut lo, mut hi) = (0.0, step);
        y_root.copy_from_slice(y_end);
        let mut y_mid = y_end.to_vec();
        for _ in 0..MAX_BISECTIONS {
            if hi - lo <= tolerance {
                break;
            }
            let mid = 0.5 * (lo + hi);
            integrator.probe(system, run.t, &run.y, mid, &mut y_mid)?;
            if system.triggers_changed(run.t + mid, &y_mid)? {
                hi = mid;
                y_root.copy_from_slice(&y_mid);
            } else {
                lo = mid;
            }
        }
        Ok(run.t + hi)
    }
}

/// Compiles `model` and integrates it from 0 to `t_end`.
pub fn simulate(
    model: &ModelDefinition,
    settings: &SolverSettings,
    t_end: f64,
) -> Result<RunOutput, RunFailure> {
    let simulator = Simulator::new(settings.clone()).map_err(RunFailure::setup)?;
    let mut context = ModelContext::new(model)
        .map_err(RunFailure::setup)?
        .with_settings(settings);
    simulator.run(&mut context, 0.0, t_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRecordKind;
    use crate::model::{EventDefinition, ModelBuilder};
    use crate::settings::Method;
    use crate::traits::DifferentialSystem;
    use approx::assert_abs_diff_eq;

    fn decay() -> ModelDefinition {
        ModelBuilder::new()
            .species("x", 1.0)
            .parameter("k", 1.0)
            .reaction("decay", "k * x", &[("x", -1.0)])
            .build()
            .unwrap()
    }

    fn run_model(
        model: &ModelDefinition,
        settings: &SolverSettings,
        t_end: f64,
    ) -> (RunOutput, ModelContext) {
        let mut context = ModelContext::new(model).unwrap().with_settings(settings);
        let output = Simulator::new(settings.clone())
            .unwrap()
            .run(&mut context, 0.0, t_end)
            .unwrap();
        (output, context)
    }

    #[test]
    fn every_method_tracks_exponential_decay() {
        for method in Method::ALL {
            let settings = SolverSettings {
                method,
                initial_step: 1e-3,
                ..SolverSettings::default()
            };
            let output = simulate(&decay(), &settings, 1.0).unwrap();
            let last = output.table.len() - 1;
            assert_eq!(output.table.time(last), Some(1.0));
            let tolerance = if method == Method::Euler { 1e-3 } else { 1e-5 };
            assert_abs_diff_eq!(
                output.table.row(last).unwrap()[0],
                (-1.0f64).exp(),
                epsilon = tolerance
            );
            assert_eq!(output.status, RunStatus::Completed);
        }
    }

    #[test]
    fn grid_output_lands_on_every_point() {
        let settings = SolverSettings {
            output: OutputMode::Grid { interval: 0.25 },
            ..SolverSettings::default()
        };
        let output = simulate(&decay(), &settings, 1.0).unwrap();
        assert_eq!(output.table.times(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        for (row, t) in output.table.times().into_iter().enumerate() {
            assert_abs_diff_eq!(
                output.table.row(row).unwrap()[0],
                (-t).exp(),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn rejected_attempts_leave_no_rows() {
        let settings = SolverSettings {
            initial_step: 1.0,
            relative_tolerance: 1e-10,
            absolute_tolerance: 1e-12,
            ..SolverSettings::default()
        };
        let output = simulate(&decay(), &settings, 2.0).unwrap();
        assert!(output.stats.rejected_steps > 0);
        assert_eq!(output.table.len(), output.stats.accepted_steps + 1);
        let times = output.table.times();
        assert!(times.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn trigger_time_is_localised_inside_the_step() {
        let model = ModelBuilder::new()
            .species("x", 0.0)
            .global("fired", 0.0)
            .rate_rule("x", "1")
            .event(
                EventDefinition::new("threshold", "time >= 1")
                    .initial_value(false)
                    .assign("fired", "time"),
            )
            .build()
            .unwrap();
        let settings = SolverSettings {
            method: Method::Euler,
            initial_step: 0.2,
            root_tolerance: 1e-9,
            ..SolverSettings::default()
        };
        let mut context = ModelContext::new(&model).unwrap().with_settings(&settings);
        let simulator = Simulator::new(settings).unwrap();
        // Steps from 0.1 land on 0.9 and would next land on 1.1.
        let output = simulator.run(&mut context, 0.1, 2.0).unwrap();

        let record = &context.event_log()[0];
        assert!((record.trigger_time - 1.0).abs() <= 2e-9, "{record:?}");
        assert_eq!(record.trigger_time, record.execution_time);
        let fired = output.table.column("fired").unwrap();
        assert!((fired.last().unwrap() - 1.0).abs() <= 2e-9);
        assert_eq!(output.stats.roots_located, 1);
    }

    #[test]
    fn non_persistent_event_never_fires_after_trigger_drops() {
        let model = ModelBuilder::new()
            .global("hit", 0.0)
            .event(
                EventDefinition::new("window", "time >= 1 && time < 2")
                    .persistent(false)
                    .delay("2")
                    .assign("hit", "1"),
            )
            .event(
                EventDefinition::new("kept", "time >= 1 && time < 2")
                    .delay("2")
                    .assign("hit", "hit + 10"),
            )
            .build()
            .unwrap();
        let settings = SolverSettings {
            max_step: Some(0.1),
            ..SolverSettings::default()
        };
        let (output, context) = run_model(&model, &settings, 4.0);

        assert_eq!(output.table.value_at("hit", 3.5), Some(10.0));
        let kinds: Vec<(&str, EventRecordKind)> = context
            .event_log()
            .iter()
            .map(|r| (r.event.as_str(), r.kind))
            .collect();
        assert_eq!(
            kinds,
            [
                ("window", EventRecordKind::Cancelled),
                ("kept", EventRecordKind::Fired)
            ]
        );
        let kept = &context.event_log()[1];
        assert_abs_diff_eq!(kept.execution_time, kept.trigger_time + 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(kept.trigger_time, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn events_reset_state_and_produce_two_rows() {
        let model = ModelBuilder::new()
            .species("x", 1.0)
            .parameter("k", 1.0)
            .reaction("decay", "k * x", &[("x", -1.0)])
            .event(
                EventDefinition::new("refill", "x < 0.5")
                    .initial_value(false)
                    .assign("x", "1"),
            )
            .build()
            .unwrap();
        let settings = SolverSettings::default();
        let (output, context) = run_model(&model, &settings, 2.0);

        let fired: Vec<f64> = context
            .event_log()
            .iter()
            .map(|r| r.execution_time)
            .collect();
        assert_eq!(fired.len(), 2);
        let ln2 = std::f64::consts::LN_2;
        assert_abs_diff_eq!(fired[0], ln2, epsilon = 1e-5);
        assert_abs_diff_eq!(fired[1], 2.0 * ln2, epsilon = 1e-5);

        let times = output.table.times();
        let at_event = times.iter().position(|&t| t == fired[0]).unwrap();
        assert_eq!(times[at_event + 1], fired[0]);
        let x = output.table.column("x").unwrap();
        assert_abs_diff_eq!(x[at_event], 0.5, epsilon = 1e-5);
        assert_eq!(x[at_event + 1], 1.0);
        assert_eq!(output.stats.events_fired, 2);
    }

    #[test]
    fn runs_are_reproducible() {
        let model = ModelBuilder::new()
            .species("x", 0.0)
            .species("y", 0.0)
            .rate_rule("x", "1")
            .event(EventDefinition::new("a", "x > 0.5").priority("1").assign("y", "y * 2 + 1"))
            .event(EventDefinition::new("b", "x > 0.5").priority("2").assign("y", "y * 3"))
            .build()
            .unwrap();
        let settings = SolverSettings::default();
        let (first, first_context) = run_model(&model, &settings, 1.0);
        let (second, second_context) = run_model(&model, &settings, 1.0);
        assert_eq!(first.table, second.table);
        assert_eq!(first_context.event_log(), second_context.event_log());
        assert_eq!(first_context.event_log()[0].event, "b");
    }

    #[test]
    fn multistep_restarts_after_an_event() {
        let model = ModelBuilder::new()
            .species("x", 0.0)
            .global("bumped", 0.0)
            .rate_rule("x", "1")
            .event(EventDefinition::new("bump", "time >= 0.5").initial_value(false).assign("bumped", "1"))
            .build()
            .unwrap();
        let settings = SolverSettings {
            method: Method::AdamsBashforthMoulton,
            initial_step: 0.05,
            max_step: Some(0.05),
            ..SolverSettings::default()
        };
        let (output, _) = run_model(&model, &settings, 1.0);
        // A full startup at t = 0 and another after the event.
        assert!(output.stats.startup_steps >= 8, "{:?}", output.stats);
        assert_abs_diff_eq!(output.table.value_at("x", 1.0).unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn delays_read_recorded_history() {
        let model = ModelBuilder::new()
            .species("x", 0.0)
            .species("lagged", 0.0)
            .rate_rule("x", "1")
            .rate_rule("lagged", "delay(x, 1)")
            .build()
            .unwrap();
        let settings = SolverSettings {
            max_step: Some(0.05),
            ..SolverSettings::default()
        };
        let output = simulate(&model, &settings, 3.0).unwrap();
        // For t < 1 the delayed value clamps to x(0) = 0; afterwards it is
        // t - 1, so lagged(3) = (3 - 1)^2 / 2.
        assert_abs_diff_eq!(output.table.value_at("lagged", 3.0).unwrap(), 2.0, epsilon = 1e-3);
    }

    #[test]
    fn cascade_storm_fails_with_partial_results() {
        let model = ModelBuilder::new()
            .species("x", 0.0)
            .global("flag", 0.0)
            .rate_rule("x", "1")
            .event(EventDefinition::new("on", "x > 0.5 && flag < 0.5").assign("flag", "1"))
            .event(EventDefinition::new("off", "flag > 0.5").assign("flag", "0"))
            .build()
            .unwrap();
        let settings = SolverSettings {
            max_cascade: 50,
            ..SolverSettings::default()
        };
        let failure = simulate(&model, &settings, 1.0).unwrap_err();
        match &failure.error {
            SimError::CascadeLimitExceeded { limit, events, .. } => {
                assert_eq!(*limit, 50);
                assert_eq!(events, &vec!["on".to_string(), "off".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!failure.partial.is_empty());
        assert_abs_diff_eq!(failure.time, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn non_finite_derivatives_stop_the_run() {
        let model = ModelBuilder::new()
            .species("x", 1.0)
            .rate_rule("x", "1 / (1 - time)")
            .build()
            .unwrap();
        let settings = SolverSettings {
            method: Method::Euler,
            initial_step: 0.25,
            ..SolverSettings::default()
        };
        let failure = simulate(&model, &settings, 2.0).unwrap_err();
        assert!(matches!(failure.error, SimError::NumericalBreakdown { .. }));
        // The derivative at t = 1 is the first non-finite one.
        assert_eq!(failure.time, 1.0);
        assert_eq!(failure.partial.len(), 5);
        assert_eq!(failure.state.len(), 1);
    }

    #[test]
    fn events_are_rechecked_after_fast_relaxation() {
        let model = ModelBuilder::new()
            .species("A", 1.0)
            .species("B", 0.0)
            .global("alarm", 0.0)
            .parameter("kf", 2.0)
            .parameter("kb", 1.0)
            .fast_reaction("exchange", "kf * A - kb * B", &[("A", -1.0), ("B", 1.0)])
            .event(EventDefinition::new("dose", "time >= 1").assign("A", "A + 3"))
            .event(EventDefinition::new("alarm", "B > 2.5").assign("alarm", "1"))
            .build()
            .unwrap();
        let settings = SolverSettings::default();
        let mut context = ModelContext::new(&model).unwrap().with_settings(&settings);
        let output = Simulator::new(settings)
            .unwrap()
            .run(&mut context, 0.0, 2.0)
            .unwrap();

        // The dose alone leaves B at 2/3; only the relaxed state crosses 2.5.
        let fired: Vec<(&str, f64)> = context
            .event_log()
            .iter()
            .map(|record| (record.event.as_str(), record.execution_time))
            .collect();
        assert_eq!(fired.len(), 2);
        assert_eq!((fired[0].0, fired[1].0), ("dose", "alarm"));
        assert_eq!(fired[0].1, fired[1].1);
        assert_eq!(output.stats.events_fired, 2);
        assert_eq!(output.table.value_at("alarm", 2.0).unwrap(), 1.0);
        assert_abs_diff_eq!(
            output.table.value_at("B", 2.0).unwrap(),
            8.0 / 3.0,
            epsilon = 1e-8
        );
    }

    #[test]
    fn initial_assignments_see_the_start_time() {
        let model = ModelBuilder::new()
            .species("x", 0.0)
            .initial_assignment("x", "3 * time")
            .build()
            .unwrap();
        let mut context = ModelContext::new(&model).unwrap();
        assert_eq!(context.initial_state(), vec![0.0]);
        let output = Simulator::new(SolverSettings::default())
            .unwrap()
            .run(&mut context, 2.0, 3.0)
            .unwrap();
        assert_eq!(output.table.value_at("x", 2.0).unwrap(), 6.0);
        assert_eq!(output.table.value_at("x", 3.0).unwrap(), 6.0);
    }

    #[test]
    fn cancellation_returns_the_partial_table() {
        let settings = SolverSettings {
            method: Method::Euler,
            ..SolverSettings::default()
        };
        let simulator = Simulator::new(settings).unwrap();
        let token = simulator.cancel_token();
        token.cancel();
        let mut context = ModelContext::new(&decay()).unwrap();
        let output = simulator.run(&mut context, 0.0, 1.0).unwrap();
        assert_eq!(output.status, RunStatus::Cancelled);
        assert_eq!(output.table.len(), 1);
    }

    #[test]
    fn setup_errors_surface_before_stepping() {
        let settings = SolverSettings::default();
        let simulator = Simulator::new(settings).unwrap();
        let mut context = ModelContext::new(&decay()).unwrap();
        let failure = simulator.run(&mut context, 1.0, 0.0).unwrap_err();
        assert!(failure.to_string().contains("invalid time span"));
        assert!(failure.partial.is_empty());
        assert_eq!(context.dimension(), 1);
    }
}

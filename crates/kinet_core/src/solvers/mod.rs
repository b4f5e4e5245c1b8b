//! The integrator family.
//!
//! Every method implements [`Stepper`]: take one step from `(t, y)` with size
//! `h` and report the scaled local error if the method has an estimate.
//! Step-size policy lives in [`StepController`], which [`Integrator`]
//! composes with the chosen stepper.

pub mod controller;
pub mod extrapolation;
pub mod fixed;
pub mod multistep;
pub mod rosenbrock;
pub mod runge_kutta;

pub use controller::{ErrorNorm, StepController, Tolerances};

use crate::error::{SimError, SimResult};
use crate::settings::{Method, SolverSettings};
use crate::traits::DifferentialSystem;
use extrapolation::GraggBulirschStoer;
use fixed::{Euler, Rk4};
use multistep::AdamsBashforthMoulton;
use nalgebra::DMatrix;
use rosenbrock::Rosenbrock;
use runge_kutta::EmbeddedRungeKutta;
use tracing::trace;

/// What one step attempt produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepEstimate {
    /// Scaled error norm; `None` for methods without an error estimate.
    pub error: Option<f64>,
    /// Exponent denominator for step-size control.
    pub order: usize,
}

impl StepEstimate {
    pub fn exact(order: usize) -> Self {
        Self { error: None, order }
    }

    pub fn with_error(error: f64, order: usize) -> Self {
        Self {
            error: Some(error),
            order,
        }
    }
}

/// One integration method.
pub trait Stepper {
    fn name(&self) -> &'static str;

    /// Advances `y` at `t` by `h` into `y_new`.
    fn attempt<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        tolerances: &Tolerances,
    ) -> SimResult<StepEstimate>;

    /// A self-contained step from `(t, y)` that leaves no trace in the
    /// stepper's history. Used to evaluate the solution inside a step while
    /// localising trigger transitions.
    fn probe<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        tolerances: &Tolerances,
    ) -> SimResult<()> {
        self.attempt(system, t, y, h, y_new, tolerances).map(|_| ())
    }

    /// Final say on the step size the controller proposed after an accepted
    /// step of size `current`.
    fn settle_step(&self, _current: f64, proposed: f64) -> f64 {
        proposed
    }

    /// The last attempt was accepted and `(t, y)` is now the current point.
    fn accepted(&mut self, _t: f64, _y: &[f64]) {}

    /// Drops everything carried between steps.
    fn reset(&mut self) {}
}

/// Wraps a system so every derivative evaluation is counted and checked for
/// non-finite components.
pub(crate) struct Checked<'a, S: ?Sized> {
    inner: &'a mut S,
    pub evaluations: usize,
}

impl<'a, S: DifferentialSystem + ?Sized> Checked<'a, S> {
    pub fn new(inner: &'a mut S) -> Self {
        Self {
            inner,
            evaluations: 0,
        }
    }
}

impl<S: DifferentialSystem + ?Sized> DifferentialSystem for Checked<'_, S> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn compute_derivatives(&mut self, t: f64, y: &[f64], out: &mut [f64]) -> SimResult<()> {
        self.evaluations += 1;
        self.inner.compute_derivatives(t, y, out)?;
        match out.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(SimError::NumericalBreakdown { time: t, index }),
            None => Ok(()),
        }
    }

    fn initial_state(&self) -> Vec<f64> {
        self.inner.initial_state()
    }

    fn jacobian(&mut self, t: f64, y: &[f64], out: &mut DMatrix<f64>) -> SimResult<bool> {
        self.inner.jacobian(t, y, out)
    }
}

pub(crate) fn check_finite(t: f64, y: &[f64]) -> SimResult<()> {
    match y.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(SimError::NumericalBreakdown { time: t, index }),
        None => Ok(()),
    }
}

/// Closed set of methods, selected from [`Method`].
#[derive(Debug, Clone)]
pub enum AnyStepper {
    Euler(Euler),
    Rk4(Rk4),
    RungeKutta(EmbeddedRungeKutta),
    Rosenbrock(Rosenbrock),
    Extrapolation(GraggBulirschStoer),
    Multistep(AdamsBashforthMoulton),
}

macro_rules! dispatch {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            AnyStepper::Euler($s) => $body,
            AnyStepper::Rk4($s) => $body,
            AnyStepper::RungeKutta($s) => $body,
            AnyStepper::Rosenbrock($s) => $body,
            AnyStepper::Extrapolation($s) => $body,
            AnyStepper::Multistep($s) => $body,
        }
    };
}

impl AnyStepper {
    pub fn for_settings(settings: &SolverSettings, dimension: usize) -> Self {
        match settings.method {
            Method::Euler => AnyStepper::Euler(Euler::new(dimension)),
            Method::Rk4 => AnyStepper::Rk4(Rk4::new(dimension)),
            Method::Fehlberg45 => AnyStepper::RungeKutta(EmbeddedRungeKutta::fehlberg45(dimension)),
            Method::DormandPrince54 => {
                AnyStepper::RungeKutta(EmbeddedRungeKutta::dormand_prince54(dimension))
            }
            Method::DormandPrince853 => {
                AnyStepper::RungeKutta(EmbeddedRungeKutta::dormand_prince853(dimension))
            }
            Method::Rosenbrock => AnyStepper::Rosenbrock(Rosenbrock::new(dimension)),
            Method::GraggBulirschStoer => AnyStepper::Extrapolation(GraggBulirschStoer::new(
                dimension,
                settings.extrapolation_columns,
            )),
            Method::AdamsBashforthMoulton => {
                AnyStepper::Multistep(AdamsBashforthMoulton::new(
                    dimension,
                    settings.corrector_tolerance,
                    settings.corrector_iterations,
                ))
            }
        }
    }
}

impl Stepper for AnyStepper {
    fn name(&self) -> &'static str {
        dispatch!(self, s => s.name())
    }

    fn attempt<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        tolerances: &Tolerances,
    ) -> SimResult<StepEstimate> {
        dispatch!(self, s => s.attempt(system, t, y, h, y_new, tolerances))
    }

    fn probe<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        tolerances: &Tolerances,
    ) -> SimResult<()> {
        dispatch!(self, s => s.probe(system, t, y, h, y_new, tolerances))
    }

    fn settle_step(&self, current: f64, proposed: f64) -> f64 {
        dispatch!(self, s => s.settle_step(current, proposed))
    }

    fn accepted(&mut self, t: f64, y: &[f64]) {
        dispatch!(self, s => s.accepted(t, y))
    }

    fn reset(&mut self) {
        dispatch!(self, s => s.reset())
    }
}

/// Result of [`Integrator::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// `y_new` holds the solution at `t + h`; continue with `next_step`.
    Accepted {
        error: Option<f64>,
        next_step: f64,
    },
    /// `y_new` is garbage; retry from the same point with `next_step`.
    Rejected { error: f64, next_step: f64 },
}

/// A stepper plus the controller that decides step sizes for it.
#[derive(Debug, Clone)]
pub struct Integrator {
    method: Method,
    stepper: AnyStepper,
    controller: StepController,
    tolerances: Tolerances,
    nominal_step: f64,
    evaluations: usize,
}

impl Integrator {
    pub fn new(settings: &SolverSettings, dimension: usize) -> Self {
        Self {
            method: settings.method,
            stepper: AnyStepper::for_settings(settings, dimension),
            controller: StepController::from_settings(settings),
            tolerances: Tolerances::from_settings(settings),
            nominal_step: settings.initial_step,
            evaluations: 0,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn name(&self) -> &'static str {
        self.stepper.name()
    }

    /// Derivative evaluations made through this integrator so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Steps taken with the startup method of a multistep scheme.
    pub fn startup_steps(&self) -> usize {
        match &self.stepper {
            AnyStepper::Multistep(abm) => abm.startup_steps(),
            _ => 0,
        }
    }

    pub fn controller(&self) -> &StepController {
        &self.controller
    }

    /// Tries one step of size `h`. Errors are fatal to the run except the
    /// recoverable kinds, which count as a rejection.
    pub fn step<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
    ) -> SimResult<StepOutcome> {
        let mut checked = Checked::new(system);
        let attempt = self
            .stepper
            .attempt(&mut checked, t, y, h, y_new, &self.tolerances);
        self.evaluations += checked.evaluations;

        let estimate = match attempt {
            Ok(estimate) => estimate,
            Err(err) if err.is_step_recoverable() => {
                trace!(t, h, %err, "step attempt failed, shrinking");
                let next_step = self
                    .controller
                    .rejected(t, h, f64::INFINITY, 1)
                    .map_err(|_| match err {
                        SimError::NonConvergence { .. } => err.clone(),
                        _ => SimError::NonConvergence {
                            time: t,
                            reason: err.to_string(),
                        },
                    })?;
                return Ok(StepOutcome::Rejected {
                    error: f64::INFINITY,
                    next_step,
                });
            }
            Err(err) => return Err(err),
        };

        match estimate.error {
            None => {
                check_finite(t + h, y_new)?;
                // Fixed-step methods return to their nominal step; startup
                // steps of adaptive schemes keep the current one.
                let next_step = if self.is_adaptive() {
                    h
                } else {
                    self.nominal_step
                };
                Ok(StepOutcome::Accepted {
                    error: None,
                    next_step,
                })
            }
            Some(error) if error <= 1.0 => {
                check_finite(t + h, y_new)?;
                let proposed = self.controller.accepted(h, error, estimate.order);
                let next_step = self.controller.clamp(self.stepper.settle_step(h, proposed));
                trace!(t, h, error, next_step, "step accepted");
                Ok(StepOutcome::Accepted {
                    error: Some(error),
                    next_step,
                })
            }
            Some(error) => {
                let next_step = self.controller.rejected(t, h, error, estimate.order)?;
                trace!(t, h, error, next_step, "step rejected");
                Ok(StepOutcome::Rejected { error, next_step })
            }
        }
    }

    /// Solution at `t + h` from `(t, y)` without touching step history.
    pub fn probe<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
    ) -> SimResult<()> {
        let mut checked = Checked::new(system);
        let result = self
            .stepper
            .probe(&mut checked, t, y, h, y_new, &self.tolerances);
        self.evaluations += checked.evaluations;
        result
    }

    pub fn accept(&mut self, t: f64, y: &[f64]) {
        self.stepper.accepted(t, y);
    }

    /// Forgets stage and multistep history, e.g. after an event changed the
    /// state.
    pub fn reset(&mut self) {
        self.stepper.reset();
        self.controller.reset();
    }

    pub fn is_adaptive(&self) -> bool {
        self.method.is_adaptive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_systems::{integrate, Decay, Oscillator};
    use super::*;
    use crate::traits::DifferentialSystem;
    use approx::assert_abs_diff_eq;

    struct Blowup;

    impl DifferentialSystem for Blowup {
        fn dimension(&self) -> usize {
            1
        }
        fn compute_derivatives(&mut self, _t: f64, y: &[f64], out: &mut [f64]) -> SimResult<()> {
            out[0] = 1.0 / (y[0] - y[0]);
            Ok(())
        }
        fn initial_state(&self) -> Vec<f64> {
            vec![1.0]
        }
    }

    fn settings(method: Method) -> SolverSettings {
        SolverSettings {
            method,
            absolute_tolerance: 1e-9,
            relative_tolerance: 1e-9,
            ..SolverSettings::default()
        }
    }

    #[test]
    fn every_adaptive_method_solves_the_oscillator() {
        for method in [
            Method::Fehlberg45,
            Method::DormandPrince54,
            Method::DormandPrince853,
            Method::Rosenbrock,
            Method::GraggBulirschStoer,
            Method::AdamsBashforthMoulton,
        ] {
            let mut integrator = Integrator::new(&settings(method), 2);
            let (y, worst) = integrate(&mut integrator, &mut Oscillator, 2.0, 1e-3);
            assert_abs_diff_eq!(y[0], 2.0f64.cos(), epsilon = 1e-5);
            assert_abs_diff_eq!(y[1], -(2.0f64.sin()), epsilon = 1e-5);
            assert!(worst <= 1.0, "{method:?} accepted error {worst}");
        }
    }

    #[test]
    fn non_finite_derivative_is_fatal() {
        let mut integrator = Integrator::new(&settings(Method::DormandPrince54), 1);
        let mut y_new = vec![0.0];
        let err = integrator
            .step(&mut Blowup, 0.0, &[1.0], 0.1, &mut y_new)
            .unwrap_err();
        assert!(matches!(err, SimError::NumericalBreakdown { index: 0, .. }));
    }

    #[test]
    fn counts_evaluations() {
        let mut integrator = Integrator::new(&settings(Method::Rk4), 1);
        let mut system = Decay {
            lambda: -1.0,
            y0: 1.0,
        };
        let mut y_new = vec![0.0];
        integrator
            .step(&mut system, 0.0, &[1.0], 0.1, &mut y_new)
            .unwrap();
        assert_eq!(integrator.evaluations(), 4);
    }
}

use crate::error::SimResult;
use nalgebra::DMatrix;
use num_traits::{One, Zero};
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Numeric type the expression trees can be evaluated in: `f64` for the
/// memoized path, `Dual` for Jacobians.
pub trait Scalar:
    Copy
    + Debug
    + PartialEq
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// Real part; used for comparisons and branch selection.
    fn value(self) -> f64;

    fn constant(value: f64) -> Self;
    fn powf(self, exponent: Self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tan(self) -> Self;
    fn asin(self) -> Self;
    fn acos(self) -> Self;
    fn atan(self) -> Self;
    fn sinh(self) -> Self;
    fn cosh(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;
    fn floor(self) -> Self;
    fn ceil(self) -> Self;
}

impl Scalar for f64 {
    fn value(self) -> f64 {
        self
    }
    fn constant(value: f64) -> Self {
        value
    }
    fn powf(self, exponent: Self) -> Self {
        f64::powf(self, exponent)
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn ln(self) -> Self {
        f64::ln(self)
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn sin(self) -> Self {
        f64::sin(self)
    }
    fn cos(self) -> Self {
        f64::cos(self)
    }
    fn tan(self) -> Self {
        f64::tan(self)
    }
    fn asin(self) -> Self {
        f64::asin(self)
    }
    fn acos(self) -> Self {
        f64::acos(self)
    }
    fn atan(self) -> Self {
        f64::atan(self)
    }
    fn sinh(self) -> Self {
        f64::sinh(self)
    }
    fn cosh(self) -> Self {
        f64::cosh(self)
    }
    fn tanh(self) -> Self {
        f64::tanh(self)
    }
    fn abs(self) -> Self {
        f64::abs(self)
    }
    fn floor(self) -> Self {
        f64::floor(self)
    }
    fn ceil(self) -> Self {
        f64::ceil(self)
    }
}

/// A system of ordinary differential equations `dy/dt = f(t, y)`.
pub trait DifferentialSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// y: state to evaluate at (may be a trial state, not the accepted one)
    /// out: buffer for dy/dt
    fn compute_derivatives(&mut self, t: f64, y: &[f64], out: &mut [f64]) -> SimResult<()>;

    fn initial_state(&self) -> Vec<f64>;

    /// State at the start time `t0`, for systems whose initial values depend
    /// on it.
    fn initial_state_at(&self, _t0: f64) -> Vec<f64> {
        self.initial_state()
    }

    /// Column labels for the result table.
    fn variable_ids(&self) -> Vec<String> {
        (0..self.dimension()).map(|i| format!("y{i}")).collect()
    }

    /// Writes `∂f/∂y` into `out` and returns `true` when an analytic Jacobian
    /// is available. The default leaves the job to finite differences.
    fn jacobian(&mut self, _t: f64, _y: &[f64], _out: &mut DMatrix<f64>) -> SimResult<bool> {
        Ok(false)
    }
}

/// Result of handing an accepted point to the event machinery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOutcome {
    /// Number of event executions applied.
    pub fired: usize,
    /// The state was mutated; integrator history must be discarded.
    pub state_changed: bool,
}

/// Discrete/continuous coupling on top of a differential system.
///
/// Every hook has a no-op default so that plain ODE systems can opt in with
/// an empty `impl`.
pub trait EventSystem: DifferentialSystem {
    /// Called once before stepping begins. May mutate `y` (events that fire at
    /// the start time, rule consistency).
    fn initialize_events(&mut self, _t: f64, _y: &mut [f64]) -> SimResult<EventOutcome> {
        Ok(EventOutcome::default())
    }

    /// Whether a point `(t, y)` has a trigger value different from the last
    /// processed point. Drives root localisation.
    fn triggers_changed(&mut self, _t: f64, _y: &[f64]) -> SimResult<bool> {
        Ok(false)
    }

    /// Whether processing `(t, y)` would execute at least one event.
    fn has_pending_events(&mut self, _t: f64, _y: &[f64]) -> SimResult<bool> {
        Ok(false)
    }

    /// Executes everything due at `t`, cascading until no event is eligible.
    fn process_events(&mut self, _t: f64, _y: &mut [f64]) -> SimResult<EventOutcome> {
        Ok(EventOutcome::default())
    }

    /// Earliest time a delayed execution is scheduled for, if any.
    fn next_scheduled_time(&self) -> Option<f64> {
        None
    }

    /// Called for every accepted point before events are processed. Systems
    /// re-apply assignment rules and extend their delay history here.
    fn accept_step(&mut self, _t: f64, _y: &mut [f64]) -> SimResult<()> {
        Ok(())
    }

    /// Whether zero-relaxation-time processes require an extra algebraic pass.
    fn has_fast_processes(&self) -> bool {
        false
    }

    /// Brings `y` back onto the fast-process manifold. Returns whether `y`
    /// changed.
    fn enforce_consistency(&mut self, _t: f64, _y: &mut [f64]) -> SimResult<bool> {
        Ok(false)
    }
}

/// Access to past values of the state.
pub trait DelaySystem {
    fn delayed_value(&self, variable: usize, t: f64) -> f64;
}

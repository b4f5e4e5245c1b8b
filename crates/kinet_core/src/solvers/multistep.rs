//! Fourth-order Adams-Bashforth-Moulton predictor-corrector.
//!
//! The method needs derivatives at the last four step endpoints, all spaced by
//! the same `h`. Until the window is full (after a start, a reset or a change
//! of step size) steps are taken with classic RK4.

use super::fixed::Rk4;
use super::{ErrorNorm, StepEstimate, Stepper, Tolerances};
use crate::error::{SimError, SimResult};
use crate::traits::DifferentialSystem;
use std::collections::VecDeque;
use tracing::debug;

const WINDOW: usize = 4;

/// Milne's estimate of the corrector's local error.
const MILNE: f64 = 19.0 / 270.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Collecting derivatives with the single-step method.
    Startup { collected: usize },
    Multistep,
}

#[derive(Debug, Clone)]
pub struct AdamsBashforthMoulton {
    startup: Rk4,
    /// `(t, f(t, y))` at accepted step endpoints, oldest first.
    window: VecDeque<(f64, Vec<f64>)>,
    window_step: Option<f64>,
    /// Endpoint derivative of the last attempt, committed on acceptance.
    candidate: Option<(f64, Vec<f64>)>,
    corrector_tolerance: f64,
    corrector_iterations: usize,
    predicted: Vec<f64>,
    corrected: Vec<f64>,
    f: Vec<f64>,
    err: Vec<f64>,
    startup_steps: usize,
}

impl AdamsBashforthMoulton {
    pub fn new(dim: usize, corrector_tolerance: f64, corrector_iterations: usize) -> Self {
        Self {
            startup: Rk4::new(dim),
            window: VecDeque::with_capacity(WINDOW),
            window_step: None,
            candidate: None,
            corrector_tolerance,
            corrector_iterations: corrector_iterations.max(1),
            predicted: vec![0.0; dim],
            corrected: vec![0.0; dim],
            f: vec![0.0; dim],
            err: vec![0.0; dim],
            startup_steps: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.window.len() < WINDOW {
            Phase::Startup {
                collected: self.window.len(),
            }
        } else {
            Phase::Multistep
        }
    }

    pub fn startup_steps(&self) -> usize {
        self.startup_steps
    }

    pub fn window_times(&self) -> Vec<f64> {
        self.window.iter().map(|(t, _)| *t).collect()
    }

    fn restart(&mut self, h: f64) {
        if !self.window.is_empty() {
            debug!(h, "multistep window discarded");
        }
        self.window.clear();
        self.window_step = Some(h);
    }

    /// Whether the window can seed a multistep step from `t` with size `h`.
    fn window_ready(&self, t: f64, h: f64) -> bool {
        self.window.len() == WINDOW
            && self.window_step == Some(h)
            && self.window.back().map(|(last, _)| *last) == Some(t)
    }

    fn startup_step<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
    ) -> SimResult<StepEstimate> {
        if self.window_step != Some(h)
            || self.window.back().is_some_and(|(last, _)| *last != t)
        {
            self.restart(h);
        }
        self.startup.advance(system, t, y, h, y_new)?;
        system.compute_derivatives(t + h, y_new, &mut self.f)?;
        self.candidate = Some((t + h, self.f.clone()));
        self.startup_steps += 1;
        Ok(StepEstimate::exact(4))
    }

    fn multistep_step<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        tolerances: &Tolerances,
    ) -> SimResult<StepEstimate> {
        let n = y.len();
        let window = &self.window;
        let (f3, f2, f1, f0) = (&window[0].1, &window[1].1, &window[2].1, &window[3].1);

        for i in 0..n {
            self.predicted[i] =
                y[i] + h / 24.0 * (55.0 * f0[i] - 59.0 * f1[i] + 37.0 * f2[i] - 9.0 * f3[i]);
        }

        self.corrected.copy_from_slice(&self.predicted);
        let mut converged = false;
        for _ in 0..self.corrector_iterations {
            system.compute_derivatives(t + h, &self.corrected, &mut self.f)?;
            for i in 0..n {
                let next = y[i] + h / 24.0 * (9.0 * self.f[i] + 19.0 * f0[i] - 5.0 * f1[i] + f2[i]);
                self.err[i] = next - self.corrected[i];
                self.corrected[i] = next;
            }
            let change = tolerances.norm(ErrorNorm::Rms, y, &self.corrected, &self.err);
            if change <= self.corrector_tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(SimError::NonConvergence {
                time: t + h,
                reason: format!(
                    "corrector did not converge in {} iterations",
                    self.corrector_iterations
                ),
            });
        }

        system.compute_derivatives(t + h, &self.corrected, &mut self.f)?;
        self.candidate = Some((t + h, self.f.clone()));

        for i in 0..n {
            self.err[i] = MILNE * (self.corrected[i] - self.predicted[i]);
        }
        y_new.copy_from_slice(&self.corrected);
        let error = tolerances.norm(ErrorNorm::Rms, y, y_new, &self.err);
        Ok(StepEstimate::with_error(error, 5))
    }
}

impl Stepper for AdamsBashforthMoulton {
    fn name(&self) -> &'static str {
        "adams-bashforth-moulton"
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
        self.candidate = None;
        if self.window_ready(t, h) {
            self.multistep_step(system, t, y, h, y_new, tolerances)
        } else {
            self.startup_step(system, t, y, h, y_new)
        }
    }

    fn probe<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        _tolerances: &Tolerances,
    ) -> SimResult<()> {
        self.startup.advance(system, t, y, h, y_new)
    }

    /// Any change of `h` empties the window, so only grow by doubling.
    fn settle_step(&self, current: f64, proposed: f64) -> f64 {
        if proposed >= 2.0 * current {
            2.0 * current
        } else {
            current
        }
    }

    fn accepted(&mut self, t: f64, _y: &[f64]) {
        match self.candidate.take() {
            Some((end, f)) if end == t => {
                if self.window.len() == WINDOW {
                    self.window.pop_front();
                }
                self.window.push_back((end, f));
            }
            _ => self.window.clear(),
        }
    }

    fn reset(&mut self) {
        self.window.clear();
        self.window_step = None;
        self.candidate = None;
    }
}

use crate::error::{SimError, SimResult};
use crate::settings::SolverSettings;

/// How per-component scaled errors are folded into one number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorNorm {
    Rms,
    Max,
}

/// Absolute/relative tolerance mix used to scale local error estimates.
#[derive(Debug, Clone, PartialEq)]
pub struct Tolerances {
    pub absolute: f64,
    pub relative: f64,
    /// Per-component absolute tolerances; overrides `absolute` when present.
    pub per_component: Option<Vec<f64>>,
}

impl Tolerances {
    pub fn new(absolute: f64, relative: f64) -> Self {
        Self {
            absolute,
            relative,
            per_component: None,
        }
    }

    pub fn from_settings(settings: &SolverSettings) -> Self {
        Self {
            absolute: settings.absolute_tolerance,
            relative: settings.relative_tolerance,
            per_component: settings.absolute_tolerances.clone(),
        }
    }

    fn absolute_for(&self, i: usize) -> f64 {
        self.per_component
            .as_ref()
            .and_then(|atol| atol.get(i).copied())
            .unwrap_or(self.absolute)
    }

    /// `atol_i + rtol * max(|y_i|, |y'_i|)`
    pub fn scale(&self, i: usize, before: f64, after: f64) -> f64 {
        self.absolute_for(i) + self.relative * before.abs().max(after.abs())
    }

    /// Scaled norm of `err` for a step from `before` to `after`.
    pub fn norm(&self, kind: ErrorNorm, before: &[f64], after: &[f64], err: &[f64]) -> f64 {
        if err.is_empty() {
            return 0.0;
        }
        let scaled = err
            .iter()
            .enumerate()
            .map(|(i, e)| (e / self.scale(i, before[i], after[i])).abs());
        match kind {
            ErrorNorm::Rms => (scaled.map(|e| e * e).sum::<f64>() / err.len() as f64).sqrt(),
            ErrorNorm::Max => scaled.fold(0.0, f64::max),
        }
    }
}

/// Step-size control shared by every adaptive method.
///
/// With `beta == 0` this is the elementary controller
/// `h_new = h * safety * err^(-1/q)`; a positive `beta` adds the
/// proportional term of a PI controller.
#[derive(Debug, Clone)]
pub struct StepController {
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    pub beta: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub max_rejections: usize,
    previous_error: f64,
    rejections: usize,
}

impl StepController {
    pub fn from_settings(settings: &SolverSettings) -> Self {
        Self {
            safety: settings.safety,
            min_factor: settings.min_factor,
            max_factor: settings.max_factor,
            beta: settings.pi_beta,
            min_step: settings.min_step,
            max_step: settings.max_step.unwrap_or(f64::INFINITY),
            max_rejections: settings.max_rejections,
            previous_error: 1e-4,
            rejections: 0,
        }
    }

    pub fn reset(&mut self) {
        self.previous_error = 1e-4;
        self.rejections = 0;
    }

    pub fn clamp(&self, h: f64) -> f64 {
        h.clamp(self.min_step, self.max_step)
    }

    /// Step size to try after an accepted step with scaled error `error`.
    /// `order` is the order the error estimate scales with, minus one.
    pub fn accepted(&mut self, h: f64, error: f64, order: usize) -> f64 {
        let q = order.max(1) as f64;
        let factor = if error <= 0.0 {
            self.max_factor
        } else {
            let exponent = 1.0 / q - 0.75 * self.beta;
            let mut factor = self.safety * error.powf(-exponent);
            if self.beta > 0.0 {
                factor *= self.previous_error.powf(self.beta);
            }
            factor
        };
        // No growth straight after a rejection.
        let cap = if self.rejections > 0 { 1.0 } else { self.max_factor };
        self.previous_error = error.max(1e-4);
        self.rejections = 0;
        self.clamp(h * factor.clamp(self.min_factor, cap))
    }

    /// Step size to retry with after a rejected step. Fails once the step
    /// would fall below `min_step` or too many rejections occurred in a row.
    pub fn rejected(&mut self, t: f64, h: f64, error: f64, order: usize) -> SimResult<f64> {
        self.rejections += 1;
        let factor = if error.is_finite() {
            (self.safety * error.powf(-1.0 / order.max(1) as f64)).clamp(self.min_factor, 1.0)
        } else {
            self.min_factor
        };
        let next = h * factor;
        if next < self.min_step || self.rejections > self.max_rejections {
            return Err(SimError::StepTooSmall { time: t, step: next });
        }
        Ok(next.min(self.max_step))
    }
}

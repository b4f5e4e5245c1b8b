//! Linearly implicit Rosenbrock method of order 4 with an embedded order 3
//! estimate (Shampine's parameter set), for stiff systems.

use super::{ErrorNorm, StepEstimate, Stepper, Tolerances};
use crate::error::{SimError, SimResult};
use crate::traits::DifferentialSystem;
use nalgebra::{DMatrix, DVector};

const GAM: f64 = 0.25;
const C2: f64 = 0.386;
const C3: f64 = 0.21;
const C4: f64 = 0.63;

const A21: f64 = 1.544;
const A31: f64 = 0.9466785280815826;
const A32: f64 = 0.2557011698983284;
const A41: f64 = 3.314825187068521;
const A42: f64 = 2.896124015972201;
const A43: f64 = 0.9986419139977817;
const A51: f64 = 1.221224509226641;
const A52: f64 = 6.019134481288629;
const A53: f64 = 12.53708332932087;
const A54: f64 = -0.6878860361058950;

const C21: f64 = -5.6688;
const C31: f64 = -2.430093356833875;
const C32: f64 = -0.2063599157091915;
const C41: f64 = -0.1073529058151375;
const C42: f64 = -9.594562251023355;
const C43: f64 = -20.47028614809616;
const C51: f64 = 7.496443313967647;
const C52: f64 = -10.24680431464352;
const C53: f64 = -33.99990352819905;
const C54: f64 = 11.70890893206160;
const C61: f64 = 8.083246795921522;
const C62: f64 = -7.981132988064893;
const C63: f64 = -31.52159432874371;
const C64: f64 = 16.31930543123136;
const C65: f64 = -6.058818238834054;

const D1: f64 = 0.25;
const D2: f64 = -0.1043;
const D3: f64 = 0.1035;
const D4: f64 = -0.0362;

#[derive(Debug, Clone)]
pub struct Rosenbrock {
    jacobian: DMatrix<f64>,
    dfdt: Vec<f64>,
    f0: Vec<f64>,
    f: Vec<f64>,
    perturbed: Vec<f64>,
    tmp: Vec<f64>,
    k: [DVector<f64>; 5],
    err: DVector<f64>,
    analytic: Option<bool>,
}

impl Rosenbrock {
    pub fn new(dim: usize) -> Self {
        Self {
            jacobian: DMatrix::zeros(dim, dim),
            dfdt: vec![0.0; dim],
            f0: vec![0.0; dim],
            f: vec![0.0; dim],
            perturbed: vec![0.0; dim],
            tmp: vec![0.0; dim],
            k: std::array::from_fn(|_| DVector::zeros(dim)),
            err: DVector::zeros(dim),
            analytic: None,
        }
    }

    /// Fills `self.jacobian` with `∂f/∂y` at `(t, y)`; `self.f0` must already
    /// hold `f(t, y)`.
    fn update_jacobian<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
    ) -> SimResult<()> {
        if self.analytic != Some(false) {
            let available = system.jacobian(t, y, &mut self.jacobian)?;
            self.analytic = Some(available);
            if available {
                return Ok(());
            }
        }

        let n = y.len();
        let sqrt_eps = f64::EPSILON.sqrt();
        self.perturbed.copy_from_slice(y);
        for j in 0..n {
            let delta = sqrt_eps * y[j].abs().max(1.0);
            self.perturbed[j] = y[j] + delta;
            system.compute_derivatives(t, &self.perturbed, &mut self.f)?;
            for i in 0..n {
                self.jacobian[(i, j)] = (self.f[i] - self.f0[i]) / delta;
            }
            self.perturbed[j] = y[j];
        }
        Ok(())
    }

    fn update_time_derivative<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
    ) -> SimResult<()> {
        let delta = f64::EPSILON.sqrt() * t.abs().max(1.0);
        system.compute_derivatives(t + delta, y, &mut self.f)?;
        for i in 0..y.len() {
            self.dfdt[i] = (self.f[i] - self.f0[i]) / delta;
        }
        Ok(())
    }

    /// `y + Σ a_j k_j` into `self.tmp`.
    fn stage_state(&mut self, y: &[f64], weights: &[f64]) {
        for i in 0..y.len() {
            self.tmp[i] = y[i]
                + weights
                    .iter()
                    .zip(&self.k)
                    .map(|(a, k)| a * k[i])
                    .sum::<f64>();
        }
    }

    /// Right-hand side `f + h d dfdt + Σ c_j k_j / h` for stage `stage`.
    fn stage_rhs(&mut self, stage: usize, h: f64, d: f64, weights: &[f64]) {
        for i in 0..self.f.len() {
            let coupling: f64 = weights
                .iter()
                .zip(&self.k)
                .map(|(c, k)| c * k[i])
                .sum();
            self.k[stage][i] = self.f[i] + h * d * self.dfdt[i] + coupling / h;
        }
    }
}

impl Stepper for Rosenbrock {
    fn name(&self) -> &'static str {
        "rosenbrock"
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
        let n = y.len();
        system.compute_derivatives(t, y, &mut self.f0)?;
        self.update_jacobian(system, t, y)?;
        self.update_time_derivative(system, t, y)?;

        let mut matrix = -self.jacobian.clone();
        for i in 0..n {
            matrix[(i, i)] += 1.0 / (GAM * h);
        }
        let lu = matrix.lu();
        if !lu.is_invertible() {
            return Err(SimError::SingularMatrix { time: t });
        }
        let singular = || SimError::SingularMatrix { time: t };

        self.f.copy_from_slice(&self.f0);
        self.stage_rhs(0, h, D1, &[]);
        if !lu.solve_mut(&mut self.k[0]) {
            return Err(singular());
        }

        self.stage_state(y, &[A21]);
        system.compute_derivatives(t + C2 * h, &self.tmp, &mut self.f)?;
        self.stage_rhs(1, h, D2, &[C21]);
        if !lu.solve_mut(&mut self.k[1]) {
            return Err(singular());
        }

        self.stage_state(y, &[A31, A32]);
        system.compute_derivatives(t + C3 * h, &self.tmp, &mut self.f)?;
        self.stage_rhs(2, h, D3, &[C31, C32]);
        if !lu.solve_mut(&mut self.k[2]) {
            return Err(singular());
        }

        self.stage_state(y, &[A41, A42, A43]);
        system.compute_derivatives(t + C4 * h, &self.tmp, &mut self.f)?;
        self.stage_rhs(3, h, D4, &[C41, C42, C43]);
        if !lu.solve_mut(&mut self.k[3]) {
            return Err(singular());
        }

        self.stage_state(y, &[A51, A52, A53, A54]);
        system.compute_derivatives(t + h, &self.tmp, &mut self.f)?;
        self.stage_rhs(4, h, 0.0, &[C51, C52, C53, C54]);
        if !lu.solve_mut(&mut self.k[4]) {
            return Err(singular());
        }

        for i in 0..n {
            self.tmp[i] += self.k[4][i];
        }
        system.compute_derivatives(t + h, &self.tmp, &mut self.f)?;
        for i in 0..n {
            let coupling = C61 * self.k[0][i]
                + C62 * self.k[1][i]
                + C63 * self.k[2][i]
                + C64 * self.k[3][i]
                + C65 * self.k[4][i];
            self.err[i] = self.f[i] + coupling / h;
        }
        if !lu.solve_mut(&mut self.err) {
            return Err(singular());
        }

        for i in 0..n {
            y_new[i] = self.tmp[i] + self.err[i];
        }
        let error = tolerances.norm(ErrorNorm::Rms, y, y_new, self.err.as_slice());
        Ok(StepEstimate::with_error(error, 4))
    }

    fn reset(&mut self) {
        self.analytic = None;
    }
}

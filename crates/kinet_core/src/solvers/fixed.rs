use super::{StepEstimate, Stepper, Tolerances};
use crate::error::SimResult;
use crate::traits::DifferentialSystem;

/// Explicit Euler. No error estimate, never rejects.
#[derive(Debug, Clone)]
pub struct Euler {
    k: Vec<f64>,
}

impl Euler {
    pub fn new(dim: usize) -> Self {
        Self { k: vec![0.0; dim] }
    }
}

impl Stepper for Euler {
    fn name(&self) -> &'static str {
        "euler"
    }

    fn attempt<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        _tolerances: &Tolerances,
    ) -> SimResult<StepEstimate> {
        system.compute_derivatives(t, y, &mut self.k)?;
        for i in 0..y.len() {
            y_new[i] = y[i] + h * self.k[i];
        }
        Ok(StepEstimate::exact(1))
    }
}

/// Classic fourth-order Runge-Kutta.
#[derive(Debug, Clone)]
pub struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }

    /// One RK4 step; shared with the multistep startup phase.
    pub fn advance<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
    ) -> SimResult<()> {
        let half = 0.5 * h;

        // k1 = f(t, y)
        system.compute_derivatives(t, y, &mut self.k1)?;

        // k2 = f(t + h/2, y + h*k1/2)
        for i in 0..y.len() {
            self.tmp[i] = y[i] + half * self.k1[i];
        }
        system.compute_derivatives(t + half, &self.tmp, &mut self.k2)?;

        // k3 = f(t + h/2, y + h*k2/2)
        for i in 0..y.len() {
            self.tmp[i] = y[i] + half * self.k2[i];
        }
        system.compute_derivatives(t + half, &self.tmp, &mut self.k3)?;

        // k4 = f(t + h, y + h*k3)
        for i in 0..y.len() {
            self.tmp[i] = y[i] + h * self.k3[i];
        }
        system.compute_derivatives(t + h, &self.tmp, &mut self.k4)?;

        for i in 0..y.len() {
            y_new[i] = y[i]
                + h / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }
        Ok(())
    }
}

impl Stepper for Rk4 {
    fn name(&self) -> &'static str {
        "rk4"
    }

    fn attempt<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        h: f64,
        y_new: &mut [f64],
        _tolerances: &Tolerances,
    ) -> SimResult<StepEstimate> {
        self.advance(system, t, y, h, y_new)?;
        Ok(StepEstimate::exact(4))
    }
}

//! Gragg-Bulirsch-Stoer extrapolation.
//!
//! A step of size `H` is taken with the modified midpoint rule using an
//! increasing number of substeps; the results are extrapolated to zero
//! substep size (Aitken-Neville in `h²`). The first column whose estimate
//! meets the tolerance ends the step, which makes the order adaptive.
//! Columns are compared in the max norm, as in the classic `bsstep`.

use super::{ErrorNorm, StepEstimate, Stepper, Tolerances};
use crate::error::SimResult;
use crate::traits::DifferentialSystem;

/// Substep counts (Deuflhard's even sequence).
const SUBSTEPS: [usize; 8] = [2, 4, 6, 8, 10, 12, 14, 16];

#[derive(Debug, Clone)]
pub struct GraggBulirschStoer {
    max_columns: usize,
    /// Extrapolation table rows; row `k` holds columns `0..=k`.
    table: Vec<Vec<Vec<f64>>>,
    z_prev: Vec<f64>,
    z_curr: Vec<f64>,
    z_next: Vec<f64>,
    f: Vec<f64>,
    err: Vec<f64>,
    last_column: usize,
}

impl GraggBulirschStoer {
    pub fn new(dim: usize, max_columns: usize) -> Self {
        let max_columns = max_columns.clamp(2, SUBSTEPS.len());
        Self {
            max_columns,
            table: (0..max_columns)
                .map(|k| vec![vec![0.0; dim]; k + 1])
                .collect(),
            z_prev: vec![0.0; dim],
            z_curr: vec![0.0; dim],
            z_next: vec![0.0; dim],
            f: vec![0.0; dim],
            err: vec![0.0; dim],
            last_column: 0,
        }
    }

    /// Column at which the last attempt stopped.
    pub fn last_column(&self) -> usize {
        self.last_column
    }

    /// Modified midpoint rule with `n` substeps, result into `table[row][0]`.
    fn midpoint<S: DifferentialSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
        f0: &[f64],
        h: f64,
        n: usize,
        row: usize,
    ) -> SimResult<()> {
        let dim = y.len();
        let sub = h / n as f64;

        self.z_prev.copy_from_slice(y);
        for i in 0..dim {
            self.z_curr[i] = y[i] + sub * f0[i];
        }
        for m in 1..n {
            system.compute_derivatives(t + m as f64 * sub, &self.z_curr, &mut self.f)?;
            for i in 0..dim {
                self.z_next[i] = self.z_prev[i] + 2.0 * sub * self.f[i];
            }
            std::mem::swap(&mut self.z_prev, &mut self.z_curr);
            std::mem::swap(&mut self.z_curr, &mut self.z_next);
        }
        system.compute_derivatives(t + h, &self.z_curr, &mut self.f)?;
        let out = &mut self.table[row][0];
        for i in 0..dim {
            out[i] = 0.5 * (self.z_curr[i] + self.z_prev[i] + sub * self.f[i]);
        }
        Ok(())
    }

    /// Fills row `k` of the table from its first column and row `k - 1`.
    fn extrapolate(&mut self, k: usize) {
        let (done, rest) = self.table.split_at_mut(k);
        let previous = &done[k - 1];
        let row = &mut rest[0];
        for j in 1..=k {
            let ratio = SUBSTEPS[k] as f64 / SUBSTEPS[k - j] as f64;
            let denom = ratio * ratio - 1.0;
            let (lower, upper) = row.split_at_mut(j);
            let left = &lower[j - 1];
            for i in 0..left.len() {
                upper[0][i] = left[i] + (left[i] - previous[j - 1][i]) / denom;
            }
        }
    }
}

impl Stepper for GraggBulirschStoer {
    fn name(&self) -> &'static str {
        "gragg-bulirsch-stoer"
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
        let mut f0 = vec![0.0; y.len()];
        system.compute_derivatives(t, y, &mut f0)?;

        let mut error = f64::INFINITY;
        let mut column = 1;
        for k in 0..self.max_columns {
            self.midpoint(system, t, y, &f0, h, SUBSTEPS[k], k)?;
            if k == 0 {
                continue;
            }
            self.extrapolate(k);
            let row = &self.table[k];
            for i in 0..y.len() {
                self.err[i] = row[k][i] - row[k - 1][i];
            }
            y_new.copy_from_slice(&row[k]);
            error = tolerances.norm(ErrorNorm::Max, y, y_new, &self.err);
            column = k;
            if error <= 1.0 {
                break;
            }
        }
        self.last_column = column;
        // T[k][k-1] is accurate to order 2k; its error behaves like H^(2k+1).
        Ok(StepEstimate::with_error(error, 2 * column + 1))
    }
}

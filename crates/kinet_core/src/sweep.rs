//! Independent runs of one model over many parameter sets.
//!
//! The model is compiled once and shared read-only; every point gets its own
//! [`ModelContext`] (caches, history, event state) and integrator, so points
//! run in parallel without coordination. Results come back in input order.

use crate::context::{CompiledModel, ModelContext};
use crate::model::ModelDefinition;
use crate::settings::SolverSettings;
use crate::simulation::{RunFailure, RunOutput, Simulator};
use anyhow::Context;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Parameter values that differ from the model's declared ones.
pub type Overrides = Vec<(String, f64)>;

/// Simulates `model` from 0 to `t_end` once per entry of `points`.
///
/// The outer error covers setup problems that affect the sweep as a whole
/// (an invalid model, invalid settings, an override naming no parameter);
/// the inner results carry each point's own outcome.
pub fn run_sweep(
    model: &ModelDefinition,
    settings: &SolverSettings,
    t_end: f64,
    points: &[Overrides],
) -> anyhow::Result<Vec<Result<RunOutput, RunFailure>>> {
    let simulator = Simulator::new(settings.clone()).context("invalid sweep settings")?;
    let compiled = Arc::new(CompiledModel::compile(model).context("compiling sweep model")?);
    debug!(points = points.len(), t_end, "sweep started");

    points
        .par_iter()
        .enumerate()
        .map(|(i, overrides)| -> anyhow::Result<Result<RunOutput, RunFailure>> {
            let mut context =
                ModelContext::from_compiled(Arc::clone(&compiled)).with_settings(settings);
            for (id, value) in overrides {
                context
                    .set_parameter(id, *value)
                    .with_context(|| format!("sweep point {i}: overriding '{id}'"))?;
            }
            Ok(simulator.run(&mut context, 0.0, t_end))
        })
        .collect()
}

use crate::error::{SimError, SimResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Integration method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Euler,
    Rk4,
    Fehlberg45,
    DormandPrince54,
    DormandPrince853,
    Rosenbrock,
    GraggBulirschStoer,
    AdamsBashforthMoulton,
}

impl Method {
    pub const ALL: [Method; 8] = [
        Method::Euler,
        Method::Rk4,
        Method::Fehlberg45,
        Method::DormandPrince54,
        Method::DormandPrince853,
        Method::Rosenbrock,
        Method::GraggBulirschStoer,
        Method::AdamsBashforthMoulton,
    ];

    /// Whether the method controls its step size from an error estimate.
    pub fn is_adaptive(self) -> bool {
        !matches!(self, Method::Euler | Method::Rk4)
    }
}

/// Which points end up in the result table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputMode {
    /// Every accepted step, plus a second row wherever events changed the state.
    Steps,
    /// `t0, t0 + interval, ...` and the end time. Steps are shortened to land
    /// on these points.
    Grid { interval: f64 },
}

/// Configuration of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub method: Method,
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    /// Per-variable absolute tolerances, overriding `absolute_tolerance`.
    pub absolute_tolerances: Option<Vec<f64>>,
    /// First step for adaptive methods; the step for fixed-step ones.
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: Option<f64>,
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    /// Proportional gain of the PI controller; 0 selects plain I control.
    pub pi_beta: f64,
    pub max_rejections: usize,
    pub max_steps: usize,
    /// Width of the bracket a trigger transition is localised to.
    pub root_tolerance: f64,
    /// Longest chain of event firings re-triggering each other at one time
    /// point before giving up.
    pub max_cascade: usize,
    pub output: OutputMode,
    /// Scaled norm below which corrector iterations stop.
    pub corrector_tolerance: f64,
    pub corrector_iterations: usize,
    pub extrapolation_columns: usize,
    /// Rows kept for delay lookups; unbounded when absent.
    pub history_capacity: Option<usize>,
    /// Derivative norm at which fast processes count as relaxed.
    pub fast_tolerance: f64,
    pub fast_max_steps: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            method: Method::DormandPrince54,
            absolute_tolerance: 1e-8,
            relative_tolerance: 1e-6,
            absolute_tolerances: None,
            initial_step: 1e-3,
            min_step: 1e-12,
            max_step: None,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 5.0,
            pi_beta: 0.0,
            max_rejections: 50,
            max_steps: 1_000_000,
            root_tolerance: 1e-10,
            max_cascade: 1000,
            output: OutputMode::Steps,
            corrector_tolerance: 1e-2,
            corrector_iterations: 8,
            extrapolation_columns: 8,
            history_capacity: None,
            fast_tolerance: 1e-10,
            fast_max_steps: 100_000,
        }
    }
}

fn positive(name: &str, value: f64) -> SimResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SimError::Configuration(format!(
            "{name} must be positive and finite, got {value}"
        )))
    }
}

fn at_least_one(name: &str, value: usize) -> SimResult<()> {
    if value == 0 {
        return Err(SimError::Configuration(format!("{name} must be at least 1")));
    }
    Ok(())
}

impl SolverSettings {
    pub fn with_method(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Rejects inconsistent settings before any stepping happens.
    pub fn validate(&self) -> SimResult<()> {
        positive("absolute_tolerance", self.absolute_tolerance)?;
        positive("relative_tolerance", self.relative_tolerance)?;
        if let Some(per_variable) = &self.absolute_tolerances {
            for value in per_variable {
                positive("absolute_tolerances entry", *value)?;
            }
        }
        positive("initial_step", self.initial_step)?;
        positive("min_step", self.min_step)?;
        if self.min_step > self.initial_step {
            return Err(SimError::Configuration(format!(
                "min_step {} exceeds initial_step {}",
                self.min_step, self.initial_step
            )));
        }
        if let Some(max_step) = self.max_step {
            positive("max_step", max_step)?;
            if max_step < self.min_step {
                return Err(SimError::Configuration(format!(
                    "max_step {max_step} is below min_step {}",
                    self.min_step
                )));
            }
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(SimError::Configuration(format!(
                "safety must lie in (0, 1], got {}",
                self.safety
            )));
        }
        if !(self.min_factor > 0.0 && self.min_factor <= 1.0 && self.max_factor >= 1.0) {
            return Err(SimError::Configuration(format!(
                "step factors must satisfy 0 < min <= 1 <= max, got [{}, {}]",
                self.min_factor, self.max_factor
            )));
        }
        if !(0.0..=0.2).contains(&self.pi_beta) {
            return Err(SimError::Configuration(format!(
                "pi_beta must lie in [0, 0.2], got {}",
                self.pi_beta
            )));
        }
        at_least_one("max_rejections", self.max_rejections)?;
        at_least_one("max_steps", self.max_steps)?;
        at_least_one("max_cascade", self.max_cascade)?;
        at_least_one("corrector_iterations", self.corrector_iterations)?;
        positive("root_tolerance", self.root_tolerance)?;
        positive("corrector_tolerance", self.corrector_tolerance)?;
        positive("fast_tolerance", self.fast_tolerance)?;
        at_least_one("fast_max_steps", self.fast_max_steps)?;
        if !(2..=8).contains(&self.extrapolation_columns) {
            return Err(SimError::Configuration(format!(
                "extrapolation_columns must lie in 2..=8, got {}",
                self.extrapolation_columns
            )));
        }
        if self.history_capacity == Some(0) {
            return Err(SimError::Configuration(
                "history_capacity must be at least 1".into(),
            ));
        }
        if let OutputMode::Grid { interval } = self.output {
            positive("output interval", interval)?;
        }
        Ok(())
    }

    /// Parses and validates settings from JSON. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> SimResult<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|err| SimError::Configuration(format!("invalid settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Reads solver settings from a JSON file.
pub fn load_settings(path: impl AsRef<Path>) -> anyhow::Result<SolverSettings> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    SolverSettings::from_json_str(&text)
        .with_context(|| format!("invalid settings in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: SimResult<T>, needle: &str) {
        let err = result.unwrap_err().to_string();
        assert!(err.contains(needle), "'{err}' does not mention '{needle}'");
    }

    #[test]
    fn defaults_are_valid() {
        SolverSettings::default().validate().unwrap();
        for method in Method::ALL {
            SolverSettings::with_method(method).validate().unwrap();
        }
    }

    #[test]
    fn json_fills_missing_fields_from_defaults() {
        let settings = SolverSettings::from_json_str(
            r#"{ "method": "rosenbrock", "relative_tolerance": 1e-4,
                 "output": { "mode": "grid", "interval": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(settings.method, Method::Rosenbrock);
        assert_eq!(settings.relative_tolerance, 1e-4);
        assert_eq!(settings.output, OutputMode::Grid { interval: 0.5 });
        assert_eq!(settings.absolute_tolerance, 1e-8);
    }

    #[test]
    fn json_round_trip() {
        let settings = SolverSettings {
            method: Method::AdamsBashforthMoulton,
            max_step: Some(0.1),
            ..SolverSettings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(SolverSettings::from_json_str(&json).unwrap(), settings);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_err_contains(
            SolverSettings::from_json_str(r#"{ "relative_tolerance": -1.0 }"#),
            "relative_tolerance",
        );
        assert_err_contains(
            SolverSettings::from_json_str(r#"{ "method": "leapfrog" }"#),
            "invalid settings",
        );
        let settings = SolverSettings {
            min_step: 1.0,
            initial_step: 0.1,
            ..SolverSettings::default()
        };
        assert_err_contains(settings.validate(), "min_step");
        let settings = SolverSettings {
            output: OutputMode::Grid { interval: 0.0 },
            ..SolverSettings::default()
        };
        assert_err_contains(settings.validate(), "output interval");
    }

    #[test]
    fn missing_file_has_context() {
        let err = load_settings("/nonexistent/kinet-settings.json").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read settings"));
    }
}

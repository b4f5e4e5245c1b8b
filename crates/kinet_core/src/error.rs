use thiserror::Error;

/// Error taxonomy shared by every layer of the engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimError {
    /// Malformed expression tree, invalid settings, inconsistent model layout.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("parse error at token {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A derivative or state component became NaN or infinite.
    #[error("non-finite value in component {index} at t = {time}")]
    NumericalBreakdown { time: f64, index: usize },

    #[error("step size {step:e} fell below the minimum at t = {time}")]
    StepTooSmall { time: f64, step: f64 },

    #[error("no convergence at t = {time}: {reason}")]
    NonConvergence { time: f64, reason: String },

    #[error("iteration matrix is singular at t = {time}")]
    SingularMatrix { time: f64 },

    #[error("cyclic dependency between assignments: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("event cascade exceeded {limit} firings at t = {time} (events: {})", .events.join(", "))]
    CascadeLimitExceeded {
        time: f64,
        limit: usize,
        events: Vec<String>,
    },

    /// Delay lookup before the earliest retained sample. Recovered locally by
    /// the model context; surfaced only by the history buffer itself.
    #[error("no history for variable {variable} at t = {requested} (earliest sample {earliest})")]
    OutOfHistory {
        variable: usize,
        requested: f64,
        earliest: f64,
    },
}

pub type SimResult<T> = Result<T, SimError>;

impl SimError {
    /// Errors an adaptive driver may answer by retrying with a smaller step.
    pub fn is_step_recoverable(&self) -> bool {
        matches!(
            self,
            SimError::SingularMatrix { .. } | SimError::NonConvergence { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SimError;

    #[test]
    fn cycle_message_lists_members_in_order() {
        let err = SimError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency between assignments: A -> B -> A"
        );
    }

    #[test]
    fn recoverable_errors_are_solver_local() {
        assert!(SimError::SingularMatrix { time: 0.0 }.is_step_recoverable());
        assert!(!SimError::NumericalBreakdown { time: 0.0, index: 1 }.is_step_recoverable());
    }
}

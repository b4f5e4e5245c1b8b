//! `kinet_core` simulates hybrid continuous/discrete models: ordinary
//! differential equations built from reactions and rules, interrupted by
//! events that can be delayed, prioritised and cascaded.
//!
//! Key components:
//! - **Model**: `ModelDefinition` (plain data, JSON-loadable) and `ModelBuilder`.
//! - **Context**: `CompiledModel` holds the expression arena shared by all runs;
//!   `ModelContext` adds the run-local cache, delay history and event engine and
//!   exposes the model as an `EventSystem`.
//! - **Solvers**: fixed-step, embedded Runge-Kutta, Rosenbrock, extrapolation and
//!   Adams-Bashforth-Moulton steppers behind one `Integrator`.
//! - **Simulation**: `Simulator::run` drives an integrator over an `EventSystem`,
//!   localising trigger crossings and recording a `ResultTable`.
//! - **Sweep**: many independent runs of one model in parallel.
pub mod autodiff;
pub mod compiled;
pub mod context;
pub mod equation_engine;
pub mod error;
pub mod events;
pub mod history;
pub mod model;
pub mod results;
pub mod settings;
pub mod simulation;
pub mod solvers;
pub mod sweep;
pub mod traits;

pub use context::{CompiledModel, ModelContext};
pub use error::{SimError, SimResult};
pub use model::{EventDefinition, ModelBuilder, ModelDefinition};
pub use results::ResultTable;
pub use settings::{Method, OutputMode, SolverSettings};
pub use simulation::{simulate, CancelToken, RunFailure, RunOutput, RunStatus, Simulator};
pub use sweep::run_sweep;
pub use traits::{DelaySystem, DifferentialSystem, EventSystem};

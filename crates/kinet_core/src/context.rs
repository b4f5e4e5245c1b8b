//! Model evaluation context.
//!
//! [`CompiledModel`] is the immutable part: the node arena with every rate
//! law, rule and event expression, plus the orderings derived from the model.
//! It is shared behind an `Arc`. [`ModelContext`] is one run's view of it,
//! owning the node cache, parameter values, delay history and event state.

use crate::autodiff::{seed, Dual};
use crate::compiled::{DelayLookup, Env, NoHistory, NodeArena, NodeCache, NodeId, SymbolTable};
use crate::equation_engine::{parse, Expr};
use crate::error::{SimError, SimResult};
use crate::events::{CompiledEvent, EventEngine, EventHost, EventPhase, EventRecord};
use crate::history::History;
use crate::model::ModelDefinition;
use crate::settings::{Method, SolverSettings};
use crate::solvers::{Integrator, StepOutcome};
use crate::traits::{DelaySystem, DifferentialSystem, EventOutcome, EventSystem, Scalar};
use nalgebra::DMatrix;
use num_traits::Zero;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// A reaction or rate rule: one flux distributed over state variables.
#[derive(Debug, Clone)]
pub struct RateTerm {
    pub id: String,
    pub node: NodeId,
    /// `(state index, stoichiometric coefficient)`.
    pub contributions: Vec<(usize, f64)>,
    pub fast: bool,
    /// `false` for rate rules.
    pub reaction: bool,
}

#[derive(Debug)]
pub struct CompiledModel {
    arena: NodeArena,
    variable_ids: Vec<String>,
    parameter_ids: Vec<String>,
    parameters: Vec<f64>,
    declared: Vec<f64>,
    /// Initial assignments and assignment rules, ordered together.
    startup: Vec<(usize, NodeId)>,
    /// Assignment rules in dependency order.
    rules: Vec<(usize, NodeId)>,
    /// Compartment of each state variable tracked as a concentration.
    compartments: Vec<Option<usize>>,
    rates: Vec<RateTerm>,
    events: Vec<CompiledEvent>,
    has_delays: bool,
    has_fast: bool,
}

fn parse_labelled(label: &str, text: &str) -> SimResult<Expr> {
    parse(text).map_err(|err| match err {
        SimError::Parse { position, message } => SimError::Parse {
            position,
            message: format!("{label}: {message}"),
        },
        other => other,
    })
}

fn reads(expr: &Expr) -> BTreeSet<String> {
    let mut symbols = BTreeSet::new();
    expr.instantaneous_symbols(&mut symbols);
    symbols
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

struct DependencyWalk<'a> {
    items: &'a [(String, BTreeSet<String>)],
    index: HashMap<&'a str, usize>,
    marks: Vec<Mark>,
    path: Vec<usize>,
    order: Vec<usize>,
}

impl DependencyWalk<'_> {
    fn visit(&mut self, node: usize) -> SimResult<()> {
        match self.marks[node] {
            Mark::Done => return Ok(()),
            Mark::Active => {
                let start = self.path.iter().position(|&p| p == node).unwrap_or(0);
                let mut cycle: Vec<String> = self.path[start..]
                    .iter()
                    .map(|&p| self.items[p].0.clone())
                    .collect();
                cycle.push(self.items[node].0.clone());
                return Err(SimError::CyclicDependency { cycle });
            }
            Mark::Unvisited => {}
        }
        self.marks[node] = Mark::Active;
        self.path.push(node);
        let items = self.items;
        for symbol in &items[node].1 {
            if let Some(&dependency) = self.index.get(symbol.as_str()) {
                self.visit(dependency)?;
            }
        }
        self.path.pop();
        self.marks[node] = Mark::Done;
        self.order.push(node);
        Ok(())
    }
}

/// Orders `(target, symbols read)` pairs so that every target comes after
/// the targets it reads. Ties keep declaration order.
fn dependency_order(items: &[(String, BTreeSet<String>)]) -> SimResult<Vec<usize>> {
    let mut walk = DependencyWalk {
        items,
        index: items
            .iter()
            .enumerate()
            .map(|(i, (target, _))| (target.as_str(), i))
            .collect(),
        marks: vec![Mark::Unvisited; items.len()],
        path: Vec::new(),
        order: Vec::with_capacity(items.len()),
    };
    for node in 0..items.len() {
        walk.visit(node)?;
    }
    Ok(walk.order)
}

impl CompiledModel {
    /// Parses and compiles every expression of `model`.
    ///
    /// Fails on malformed math, unknown symbols and cyclic assignments; a
    /// model that compiles never fails during evaluation.
    pub fn compile(model: &ModelDefinition) -> SimResult<Self> {
        model.validate()?;
        let variable_ids: Vec<String> = model.variables.iter().map(|v| v.id.clone()).collect();
        let parameter_ids: Vec<String> = model.parameters.iter().map(|p| p.id.clone()).collect();
        let symbols = SymbolTable::new(&variable_ids, &parameter_ids);
        let mut arena = NodeArena::new(variable_ids.len(), parameter_ids.len());
        let state_index = |id: &str| {
            symbols
                .state(id)
                .ok_or_else(|| SimError::UnknownSymbol(id.to_string()))
        };

        let compile_targets = |targets: &[(&str, Expr)],
                               arena: &mut NodeArena|
         -> SimResult<Vec<(usize, NodeId)>> {
            targets
                .iter()
                .map(|(target, expr)| {
                    Ok((state_index(*target)?, arena.compile(expr, &symbols)?))
                })
                .collect()
        };
        let graph = |targets: &[(&str, Expr)]| -> Vec<(String, BTreeSet<String>)> {
            targets
                .iter()
                .map(|(target, expr)| (target.to_string(), reads(expr)))
                .collect()
        };

        let rule_targets = model
            .rules
            .iter()
            .filter(|rule| rule.is_assignment())
            .map(|rule| {
                let label = format!("rule for '{}'", rule.variable());
                Ok((rule.variable(), parse_labelled(&label, rule.math())?))
            })
            .collect::<SimResult<Vec<_>>>()?;
        let rule_nodes = compile_targets(&rule_targets, &mut arena)?;
        let rules: Vec<(usize, NodeId)> = dependency_order(&graph(&rule_targets))?
            .into_iter()
            .map(|i| rule_nodes[i])
            .collect();

        // At the start time initial assignments and rules read each other, so
        // they are ordered as one graph.
        let initial_targets = model
            .initial_assignments
            .iter()
            .map(|a| {
                let label = format!("initial assignment to '{}'", a.variable);
                Ok((a.variable.as_str(), parse_labelled(&label, &a.math)?))
            })
            .collect::<SimResult<Vec<_>>>()?;
        let initial_nodes = compile_targets(&initial_targets, &mut arena)?;
        let mut startup_graph = graph(&initial_targets);
        startup_graph.extend(graph(&rule_targets));
        let startup: Vec<(usize, NodeId)> = dependency_order(&startup_graph)?
            .into_iter()
            .map(|i| match initial_nodes.get(i) {
                Some(&assignment) => assignment,
                None => rule_nodes[i - initial_nodes.len()],
            })
            .collect();

        let compartments = model
            .variables
            .iter()
            .map(|variable| {
                variable
                    .concentration_compartment()
                    .map(state_index)
                    .transpose()
            })
            .collect::<SimResult<Vec<_>>>()?;

        let mut rates = Vec::new();
        for reaction in &model.reactions {
            let label = format!("reaction '{}'", reaction.id);
            let node = arena.compile(&parse_labelled(&label, &reaction.rate)?, &symbols)?;
            let contributions = reaction
                .stoichiometry
                .iter()
                .map(|term| Ok((state_index(&term.species)?, term.coefficient)))
                .collect::<SimResult<Vec<_>>>()?;
            rates.push(RateTerm {
                id: reaction.id.clone(),
                node,
                contributions,
                fast: reaction.fast,
                reaction: true,
            });
        }
        for rule in model.rules.iter().filter(|rule| !rule.is_assignment()) {
            let label = format!("rate rule for '{}'", rule.variable());
            let node = arena.compile(&parse_labelled(&label, rule.math())?, &symbols)?;
            rates.push(RateTerm {
                id: format!("d{}/dt", rule.variable()),
                node,
                contributions: vec![(state_index(rule.variable())?, 1.0)],
                fast: false,
                reaction: false,
            });
        }

        let mut events = Vec::with_capacity(model.events.len());
        for event in &model.events {
            let mut compile = |what: &str, text: &str| -> SimResult<NodeId> {
                let label = format!("{what} of event '{}'", event.id);
                arena.compile(&parse_labelled(&label, text)?, &symbols)
            };
            let trigger = compile("trigger", &event.trigger)?;
            let delay = event
                .delay
                .as_deref()
                .map(|text| compile("delay", text))
                .transpose()?;
            let priority = event
                .priority
                .as_deref()
                .map(|text| compile("priority", text))
                .transpose()?;
            let mut assignments = Vec::with_capacity(event.assignments.len());
            for assignment in &event.assignments {
                let node = compile("assignment", &assignment.math)?;
                assignments.push((state_index(&assignment.variable)?, node));
            }
            events.push(CompiledEvent {
                id: event.id.clone(),
                trigger,
                delay,
                priority,
                persistent: event.persistent,
                initial_value: event.initial_value,
                use_values_from_trigger_time: event.use_values_from_trigger_time,
                assignments,
            });
        }

        let has_delays = arena.has_delays();
        let has_fast = rates.iter().any(|term| term.fast);
        debug!(
            variables = variable_ids.len(),
            nodes = arena.len(),
            rules = rules.len(),
            events = events.len(),
            "model compiled"
        );
        Ok(Self {
            arena,
            parameters: model.parameters.iter().map(|p| p.value).collect(),
            declared: model.variables.iter().map(|v| v.initial_value).collect(),
            variable_ids,
            parameter_ids,
            startup,
            rules,
            compartments,
            rates,
            events,
            has_delays,
            has_fast,
        })
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn variable_ids(&self) -> &[String] {
        &self.variable_ids
    }

    pub fn parameter_ids(&self) -> &[String] {
        &self.parameter_ids
    }

    pub fn events(&self) -> &[CompiledEvent] {
        &self.events
    }

    pub fn rates(&self) -> &[RateTerm] {
        &self.rates
    }

    pub fn has_delays(&self) -> bool {
        self.has_delays
    }

    /// State at `t0`: declared values overwritten by initial assignments and
    /// assignment rules in their joint dependency order.
    fn initial_state(&self, t0: f64, parameters: &[f64]) -> Vec<f64> {
        let mut y = self.declared.clone();
        for &(target, node) in &self.startup {
            let value = self.arena.evaluate_with(node, t0, &y, parameters, &NoHistory);
            y[target] = value;
        }
        y
    }

    /// Adds one term's flux to `out`. Reaction fluxes reaching a
    /// concentration are divided by its compartment's size.
    fn distribute<T: Scalar>(&self, term: &RateTerm, flux: T, y: &[T], out: &mut [T]) {
        for &(variable, coefficient) in &term.contributions {
            let mut rate = T::constant(coefficient) * flux;
            if term.reaction {
                if let Some(compartment) = self.compartments[variable] {
                    rate = rate / size(y[compartment]);
                }
            }
            out[variable] = out[variable] + rate;
        }
    }

    /// A changing compartment dilutes or concentrates what it holds:
    /// `dc/dt -= c * (dV/dt) / V`.
    fn dilute<T: Scalar>(&self, y: &[T], out: &mut [T]) {
        for (variable, compartment) in self.compartments.iter().enumerate() {
            if let Some(compartment) = *compartment {
                let growth = out[compartment];
                out[variable] = out[variable] - y[variable] * growth / size(y[compartment]);
            }
        }
    }
}

/// Compartment size used for scaling; a zero-sized compartment counts as 1.
fn size<T: Scalar>(value: T) -> T {
    if value.value() == 0.0 {
        T::one()
    } else {
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateSelection {
    Slow,
    Fast,
}

impl RateSelection {
    fn includes(self, fast: bool) -> bool {
        match self {
            RateSelection::Slow => !fast,
            RateSelection::Fast => fast,
        }
    }
}

/// Run-local evaluation state. Everything the event engine reads goes
/// through here.
#[derive(Debug)]
struct ModelCore {
    model: Arc<CompiledModel>,
    cache: NodeCache,
    parameters: Vec<f64>,
    /// The point the cache currently describes.
    time: f64,
    state: Vec<f64>,
    synced: bool,
    history: History,
    fluxes: Vec<f64>,
    scratch: Vec<f64>,
}

impl ModelCore {
    fn new(model: Arc<CompiledModel>, history: History) -> Self {
        let n = model.variable_ids.len();
        Self {
            cache: model.arena.new_cache(),
            parameters: model.parameters.clone(),
            time: 0.0,
            state: vec![0.0; n],
            synced: false,
            history,
            fluxes: vec![0.0; model.rates.len()],
            scratch: Vec::with_capacity(n),
            model,
        }
    }

    /// Points the cache at `(t, y)`, invalidating readers of every component
    /// that differs bitwise from the previous point.
    fn sync(&mut self, t: f64, y: &[f64]) {
        let arena = &self.model.arena;
        if !self.synced {
            self.cache.invalidate_all();
            self.state.copy_from_slice(y);
            self.time = t;
            self.synced = true;
            return;
        }
        for (i, (&new, old)) in y.iter().zip(self.state.iter_mut()).enumerate() {
            if new.to_bits() != old.to_bits() {
                *old = new;
                self.cache.invalidate_state(arena, i);
            }
        }
        if t.to_bits() != self.time.to_bits() {
            self.time = t;
            self.cache.invalidate_time(arena);
        }
    }

    fn evaluate(&mut self, node: NodeId) -> f64 {
        let env = Env {
            time: self.time,
            state: &self.state,
            parameters: &self.parameters,
            delays: &self.history,
        };
        self.cache.evaluate(&self.model.arena, node, &env)
    }

    fn apply_rules(&mut self, t: f64, y: &mut [f64]) {
        self.sync(t, y);
        for k in 0..self.model.rules.len() {
            let (target, node) = self.model.rules[k];
            let value = self.evaluate(node);
            if value.to_bits() != y[target].to_bits() {
                y[target] = value;
                self.state[target] = value;
                self.cache.invalidate_state(&self.model.arena, target);
            }
        }
    }

    fn derivatives(&mut self, t: f64, y: &[f64], out: &mut [f64], selection: RateSelection) {
        let mut work = std::mem::take(&mut self.scratch);
        work.clear();
        work.extend_from_slice(y);
        self.apply_rules(t, &mut work);
        self.scratch = work;

        out.fill(0.0);
        for k in 0..self.model.rates.len() {
            let (node, fast) = (self.model.rates[k].node, self.model.rates[k].fast);
            if !selection.includes(fast) {
                continue;
            }
            let flux = self.evaluate(node);
            self.fluxes[k] = flux;
            self.model
                .distribute(&self.model.rates[k], flux, &self.state, out);
        }
        self.model.dilute(&self.state, out);
    }

    /// `∂f/∂y` of the slow subsystem by forward-mode differentiation, one
    /// seeded direction per column.
    fn jacobian(&self, t: f64, y: &[f64], out: &mut DMatrix<f64>) {
        let model = &self.model;
        let mut duals: Vec<Dual> = Vec::with_capacity(y.len());
        let mut rates = vec![Dual::zero(); y.len()];
        for column in 0..y.len() {
            seed(y, column, &mut duals);
            for &(target, node) in &model.rules {
                let value =
                    model
                        .arena
                        .evaluate_with(node, t, &duals[..], &self.parameters, &self.history);
                duals[target] = value;
            }
            rates.fill(Dual::zero());
            for term in model.rates.iter().filter(|term| !term.fast) {
                let flux =
                    model
                        .arena
                        .evaluate_with(term.node, t, &duals[..], &self.parameters, &self.history);
                model.distribute(term, flux, &duals, &mut rates);
            }
            model.dilute(&duals, &mut rates);
            for (row, rate) in rates.iter().enumerate() {
                out[(row, column)] = rate.eps;
            }
        }
    }

    fn record_history(&mut self, t: f64, y: &[f64]) -> SimResult<()> {
        if self.model.has_delays {
            self.history.push(t, y)?;
            // Delay nodes read the history, which just changed.
            self.cache.invalidate_time(&self.model.arena);
        }
        Ok(())
    }
}

impl EventHost for ModelCore {
    fn prepare(&mut self, t: f64, y: &mut [f64]) {
        self.apply_rules(t, y);
    }

    fn value(&mut self, node: NodeId) -> f64 {
        self.evaluate(node)
    }
}

/// The fast reactions alone, integrated in pseudo-time at a frozen `t`.
struct FastSubsystem<'a> {
    core: &'a mut ModelCore,
    time: f64,
}

impl DifferentialSystem for FastSubsystem<'_> {
    fn dimension(&self) -> usize {
        self.core.state.len()
    }

    fn compute_derivatives(&mut self, _tau: f64, y: &[f64], out: &mut [f64]) -> SimResult<()> {
        self.core.derivatives(self.time, y, out, RateSelection::Fast);
        Ok(())
    }

    fn initial_state(&self) -> Vec<f64> {
        self.core.state.clone()
    }
}

/// How fast reactions are driven to quasi-steady state.
#[derive(Debug, Clone)]
struct Relaxation {
    solver: SolverSettings,
    tolerance: f64,
    max_steps: usize,
}

impl Relaxation {
    fn from_settings(settings: &SolverSettings) -> Self {
        Self {
            // Stiff by construction: fast rates dwarf everything else.
            solver: SolverSettings {
                method: Method::Rosenbrock,
                absolute_tolerance: settings.absolute_tolerance,
                relative_tolerance: settings.relative_tolerance,
                absolute_tolerances: settings.absolute_tolerances.clone(),
                ..SolverSettings::default()
            },
            tolerance: settings.fast_tolerance,
            max_steps: settings.fast_max_steps,
        }
    }

    fn run(&self, core: &mut ModelCore, t: f64, y: &mut [f64]) -> SimResult<()> {
        let n = y.len();
        let mut integrator = Integrator::new(&self.solver, n);
        let mut system = FastSubsystem { core, time: t };
        let mut f = vec![0.0; n];
        let mut next = y.to_vec();
        let residual = |f: &[f64]| f.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));

        let (mut tau, mut h) = (0.0, self.solver.initial_step);
        system.compute_derivatives(tau, y, &mut f)?;
        let mut steps = 0;
        while residual(&f) > self.tolerance {
            if steps == self.max_steps {
                return Err(SimError::NonConvergence {
                    time: t,
                    reason: format!(
                        "fast reactions not relaxed after {steps} steps (residual {:e})",
                        residual(&f)
                    ),
                });
            }
            steps += 1;
            match integrator.step(&mut system, tau, y, h, &mut next)? {
                StepOutcome::Accepted { next_step, .. } => {
                    tau += h;
                    y.copy_from_slice(&next);
                    integrator.accept(tau, y);
                    system.compute_derivatives(tau, y, &mut f)?;
                    h = next_step;
                }
                StepOutcome::Rejected { next_step, .. } => h = next_step,
            }
        }
        trace!(t, steps, pseudo_time = tau, "fast reactions relaxed");
        Ok(())
    }
}

/// One run's evaluation context over a shared [`CompiledModel`].
#[derive(Debug)]
pub struct ModelContext {
    core: ModelCore,
    engine: EventEngine,
    relaxation: Relaxation,
    history_capacity: Option<usize>,
    max_cascade: usize,
    probe: Vec<f64>,
}

impl ModelContext {
    pub fn new(model: &ModelDefinition) -> SimResult<Self> {
        Ok(Self::from_compiled(Arc::new(CompiledModel::compile(model)?)))
    }

    pub fn from_compiled(model: Arc<CompiledModel>) -> Self {
        let defaults = SolverSettings::default();
        Self {
            engine: EventEngine::new(model.events.len(), defaults.max_cascade),
            core: ModelCore::new(model, History::new(defaults.history_capacity)),
            relaxation: Relaxation::from_settings(&defaults),
            history_capacity: defaults.history_capacity,
            max_cascade: defaults.max_cascade,
            probe: Vec::new(),
        }
    }

    /// Takes cascade limit, history capacity and fast-process tolerances
    /// from `settings`.
    pub fn with_settings(mut self, settings: &SolverSettings) -> Self {
        self.max_cascade = settings.max_cascade;
        self.engine.set_max_cascade(settings.max_cascade);
        self.history_capacity = settings.history_capacity;
        self.core.history = History::new(settings.history_capacity);
        self.relaxation = Relaxation::from_settings(settings);
        self
    }

    /// A fresh context over the same compiled model, carrying this one's
    /// parameter values and configuration but none of its run state.
    pub fn fork(&self) -> Self {
        let mut forked = Self::from_compiled(Arc::clone(&self.core.model));
        forked.core.parameters.clone_from(&self.core.parameters);
        forked.core.history = History::new(self.history_capacity);
        forked.history_capacity = self.history_capacity;
        forked.max_cascade = self.max_cascade;
        forked.engine.set_max_cascade(self.max_cascade);
        forked.relaxation = self.relaxation.clone();
        forked
    }

    pub fn compiled(&self) -> &Arc<CompiledModel> {
        &self.core.model
    }

    pub fn parameter(&self, id: &str) -> Option<f64> {
        let index = self.core.model.parameter_ids.iter().position(|p| p == id)?;
        Some(self.core.parameters[index])
    }

    /// Overrides a constant parameter. Initial assignments reading it see the
    /// new value.
    pub fn set_parameter(&mut self, id: &str, value: f64) -> SimResult<()> {
        let index = self
            .core
            .model
            .parameter_ids
            .iter()
            .position(|p| p == id)
            .ok_or_else(|| SimError::UnknownSymbol(id.to_string()))?;
        self.core.parameters[index] = value;
        self.core
            .cache
            .invalidate_parameter(&self.core.model.arena, index);
        Ok(())
    }

    /// Recomputes every assignment-rule target of `y` in dependency order.
    pub fn apply_assignment_rules(&mut self, t: f64, y: &mut [f64]) {
        self.core.apply_rules(t, y);
    }

    /// Fluxes of every reaction from the most recent derivative evaluation.
    pub fn reaction_rates(&self) -> Vec<(&str, f64)> {
        self.core
            .model
            .rates
            .iter()
            .zip(&self.core.fluxes)
            .filter(|(term, _)| term.reaction)
            .map(|(term, &flux)| (term.id.as_str(), flux))
            .collect()
    }

    pub fn event_log(&self) -> &[EventRecord] {
        self.engine.log()
    }

    pub fn event_phase(&self, id: &str) -> Option<EventPhase> {
        let index = self.core.model.events.iter().position(|e| e.id == id)?;
        Some(self.engine.phase(index))
    }

    /// Node evaluations the cache could not serve so far.
    pub fn cache_misses(&self) -> u64 {
        self.core.cache.misses()
    }

    fn check_dimension(&self, y: &[f64]) -> SimResult<()> {
        let expected = self.core.state.len();
        if y.len() != expected {
            return Err(SimError::DimensionMismatch {
                expected,
                actual: y.len(),
            });
        }
        Ok(())
    }
}

impl DifferentialSystem for ModelContext {
    fn dimension(&self) -> usize {
        self.core.state.len()
    }

    fn compute_derivatives(&mut self, t: f64, y: &[f64], out: &mut [f64]) -> SimResult<()> {
        self.check_dimension(y)?;
        self.core.derivatives(t, y, out, RateSelection::Slow);
        Ok(())
    }

    fn initial_state(&self) -> Vec<f64> {
        self.initial_state_at(0.0)
    }

    fn initial_state_at(&self, t0: f64) -> Vec<f64> {
        self.core.model.initial_state(t0, &self.core.parameters)
    }

    fn variable_ids(&self) -> Vec<String> {
        self.core.model.variable_ids.clone()
    }

    fn jacobian(&mut self, t: f64, y: &[f64], out: &mut DMatrix<f64>) -> SimResult<bool> {
        self.check_dimension(y)?;
        self.core.jacobian(t, y, out);
        Ok(true)
    }
}

impl EventSystem for ModelContext {
    fn initialize_events(&mut self, t: f64, y: &mut [f64]) -> SimResult<EventOutcome> {
        self.check_dimension(y)?;
        self.core.history.clear();
        self.core.synced = false;
        self.core.apply_rules(t, y);
        self.core.record_history(t, y)?;

        let model = Arc::clone(&self.core.model);
        let outcome = self.engine.initialize(&model.events, &mut self.core, t, y)?;
        if outcome.state_changed {
            self.core.record_history(t, y)?;
        }
        Ok(outcome)
    }

    fn triggers_changed(&mut self, t: f64, y: &[f64]) -> SimResult<bool> {
        let model = Arc::clone(&self.core.model);
        let mut probe = std::mem::take(&mut self.probe);
        probe.clear();
        probe.extend_from_slice(y);
        let changed = self
            .engine
            .triggers_changed(&model.events, &mut self.core, t, &mut probe);
        self.probe = probe;
        Ok(changed)
    }

    fn has_pending_events(&mut self, t: f64, y: &[f64]) -> SimResult<bool> {
        let model = Arc::clone(&self.core.model);
        let mut probe = std::mem::take(&mut self.probe);
        probe.clear();
        probe.extend_from_slice(y);
        let pending = self
            .engine
            .has_pending(&model.events, &mut self.core, t, &mut probe);
        self.probe = probe;
        Ok(pending)
    }

    fn process_events(&mut self, t: f64, y: &mut [f64]) -> SimResult<EventOutcome> {
        let model = Arc::clone(&self.core.model);
        self.engine.process(&model.events, &mut self.core, t, y)
    }

    fn next_scheduled_time(&self) -> Option<f64> {
        self.engine.next_scheduled_time()
    }

    fn accept_step(&mut self, t: f64, y: &mut [f64]) -> SimResult<()> {
        self.core.apply_rules(t, y);
        self.core.record_history(t, y)
    }

    fn has_fast_processes(&self) -> bool {
        self.core.model.has_fast
    }

    fn enforce_consistency(&mut self, t: f64, y: &mut [f64]) -> SimResult<bool> {
        if !self.core.model.has_fast {
            return Ok(false);
        }
        let before = y.to_vec();
        self.relaxation.run(&mut self.core, t, y)?;
        self.core.apply_rules(t, y);
        Ok(before
            .iter()
            .zip(y.iter())
            .any(|(a, b)| a.to_bits() != b.to_bits()))
    }
}

impl DelaySystem for ModelContext {
    fn delayed_value(&self, variable: usize, t: f64) -> f64 {
        self.core
            .history
            .lookup(variable, t, self.core.time, self.core.state[variable])
    }
}

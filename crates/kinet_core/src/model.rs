//! In-memory model description.
//!
//! This is what a model loader hands to the engine: variables, reactions,
//! rules and events with their math as expression text. Nothing here is
//! compiled; [`crate::context::ModelContext`] does that.

use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Species,
    Compartment,
    Parameter,
}

/// A quantity that is part of the state vector.
///
/// A species placed in a compartment is tracked as a concentration: reaction
/// fluxes (amount per time) are divided by the compartment's current size.
/// `has_only_substance_units` keeps such a species in amounts instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: String,
    pub kind: VariableKind,
    pub initial_value: f64,
    #[serde(default)]
    pub compartment: Option<String>,
    #[serde(default)]
    pub has_only_substance_units: bool,
}

impl Variable {
    /// The compartment whose size scales this variable's reaction rates.
    pub fn concentration_compartment(&self) -> Option<&str> {
        match (self.kind, &self.compartment) {
            (VariableKind::Species, Some(compartment)) if !self.has_only_substance_units => {
                Some(compartment)
            }
            _ => None,
        }
    }
}

/// A constant. Never part of the state vector; sweeps override these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoichiometryTerm {
    pub species: String,
    /// Negative for consumed species.
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub rate: String,
    pub stoichiometry: Vec<StoichiometryTerm>,
    /// Zero-relaxation-time reaction, kept at quasi-steady state.
    #[serde(default)]
    pub fast: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    /// `variable = math`, re-applied whenever its inputs change.
    Assignment { variable: String, math: String },
    /// `d variable / dt = math`.
    Rate { variable: String, math: String },
    /// A constraint already solved for `variable` upstream; applied like an
    /// assignment rule.
    Algebraic { variable: String, math: String },
}

impl Rule {
    pub fn variable(&self) -> &str {
        match self {
            Rule::Assignment { variable, .. }
            | Rule::Rate { variable, .. }
            | Rule::Algebraic { variable, .. } => variable,
        }
    }

    pub fn math(&self) -> &str {
        match self {
            Rule::Assignment { math, .. } | Rule::Rate { math, .. } | Rule::Algebraic { math, .. } => {
                math
            }
        }
    }

    pub fn is_assignment(&self) -> bool {
        !matches!(self, Rule::Rate { .. })
    }
}

/// `variable = math`, evaluated once at the start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialAssignment {
    pub variable: String,
    pub math: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAssignment {
    pub variable: String,
    pub math: String,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: String,
    pub trigger: String,
    /// Trigger value assumed just before the start time.
    #[serde(default = "yes")]
    pub initial_value: bool,
    /// Whether a scheduled execution survives its trigger turning false.
    #[serde(default = "yes")]
    pub persistent: bool,
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    /// Evaluate assignments when the trigger fires rather than when the
    /// event executes.
    #[serde(default = "yes")]
    pub use_values_from_trigger_time: bool,
    pub assignments: Vec<EventAssignment>,
}

impl EventDefinition {
    pub fn new(id: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: trigger.into(),
            initial_value: true,
            persistent: true,
            delay: None,
            priority: None,
            use_values_from_trigger_time: true,
            assignments: Vec::new(),
        }
    }

    pub fn delay(mut self, math: impl Into<String>) -> Self {
        self.delay = Some(math.into());
        self
    }

    pub fn priority(mut self, math: impl Into<String>) -> Self {
        self.priority = Some(math.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn initial_value(mut self, value: bool) -> Self {
        self.initial_value = value;
        self
    }

    pub fn use_values_from_trigger_time(mut self, value: bool) -> Self {
        self.use_values_from_trigger_time = value;
        self
    }

    pub fn assign(mut self, variable: impl Into<String>, math: impl Into<String>) -> Self {
        self.assignments.push(EventAssignment {
            variable: variable.into(),
            math: math.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDefinition {
    pub variables: Vec<Variable>,
    pub parameters: Vec<Parameter>,
    pub reactions: Vec<Reaction>,
    pub rules: Vec<Rule>,
    pub initial_assignments: Vec<InitialAssignment>,
    pub events: Vec<EventDefinition>,
}

impl ModelDefinition {
    pub fn from_json_str(json: &str) -> SimResult<Self> {
        let model: Self = serde_json::from_str(json)
            .map_err(|err| SimError::Configuration(format!("invalid model: {err}")))?;
        model.validate()?;
        Ok(model)
    }

    pub fn variable_index(&self, id: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.id == id)
    }

    pub fn parameter_index(&self, id: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.id == id)
    }

    /// Structural checks that do not need the math compiled.
    pub fn validate(&self) -> SimResult<()> {
        let mut seen = HashSet::new();
        let ids = self
            .variables
            .iter()
            .map(|v| &v.id)
            .chain(self.parameters.iter().map(|p| &p.id))
            .chain(self.reactions.iter().map(|r| &r.id))
            .chain(self.events.iter().map(|e| &e.id));
        for id in ids {
            if id == crate::equation_engine::TIME_SYMBOL {
                return Err(SimError::Configuration(format!("'{id}' is reserved")));
            }
            if !seen.insert(id.as_str()) {
                return Err(SimError::Configuration(format!("duplicate id '{id}'")));
            }
        }

        let state_target = |id: &str, what: &str| -> SimResult<()> {
            if self.variable_index(id).is_some() {
                Ok(())
            } else if self.parameter_index(id).is_some() {
                Err(SimError::Configuration(format!(
                    "{what} targets constant parameter '{id}'"
                )))
            } else {
                Err(SimError::UnknownSymbol(id.to_string()))
            }
        };

        for variable in &self.variables {
            let Some(compartment) = &variable.compartment else {
                continue;
            };
            if variable.kind != VariableKind::Species {
                return Err(SimError::Configuration(format!(
                    "only species can be placed in a compartment, not '{}'",
                    variable.id
                )));
            }
            match self.variable_index(compartment) {
                Some(i) if self.variables[i].kind == VariableKind::Compartment => {}
                Some(_) => {
                    return Err(SimError::Configuration(format!(
                        "species '{}' is placed in '{compartment}', which is not a compartment",
                        variable.id
                    )))
                }
                None => return Err(SimError::UnknownSymbol(compartment.clone())),
            }
        }

        for reaction in &self.reactions {
            for term in &reaction.stoichiometry {
                state_target(&term.species, &format!("reaction '{}'", reaction.id))?;
            }
        }

        let mut ruled = HashSet::new();
        for rule in &self.rules {
            state_target(rule.variable(), "rule")?;
            if !ruled.insert(rule.variable()) {
                return Err(SimError::Configuration(format!(
                    "variable '{}' is the target of more than one rule",
                    rule.variable()
                )));
            }
        }
        let mut assigned = HashSet::new();
        for assignment in &self.initial_assignments {
            state_target(&assignment.variable, "initial assignment")?;
            let variable = assignment.variable.as_str();
            if !assigned.insert(variable) {
                return Err(SimError::Configuration(format!(
                    "variable '{variable}' has more than one initial assignment"
                )));
            }
            if self
                .rules
                .iter()
                .any(|rule| rule.is_assignment() && rule.variable() == variable)
            {
                return Err(SimError::Configuration(format!(
                    "variable '{variable}' has both an initial assignment and an assignment rule"
                )));
            }
        }
        for event in &self.events {
            for assignment in &event.assignments {
                state_target(&assignment.variable, &format!("event '{}'", event.id))?;
            }
        }
        Ok(())
    }
}

/// Fluent construction of a [`ModelDefinition`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    model: ModelDefinition,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn variable(mut self, id: &str, kind: VariableKind, initial_value: f64) -> Self {
        self.model.variables.push(Variable {
            id: id.to_string(),
            kind,
            initial_value,
            compartment: None,
            has_only_substance_units: false,
        });
        self
    }

    pub fn species(self, id: &str, initial_amount: f64) -> Self {
        self.variable(id, VariableKind::Species, initial_amount)
    }

    /// A species in `compartment`, tracked as a concentration.
    pub fn species_in(self, id: &str, compartment: &str, initial_concentration: f64) -> Self {
        let mut builder = self.variable(id, VariableKind::Species, initial_concentration);
        if let Some(species) = builder.model.variables.last_mut() {
            species.compartment = Some(compartment.to_string());
        }
        builder
    }

    /// A species in `compartment`, tracked as an amount.
    pub fn amount_in(self, id: &str, compartment: &str, initial_amount: f64) -> Self {
        let mut builder = self.species_in(id, compartment, initial_amount);
        if let Some(species) = builder.model.variables.last_mut() {
            species.has_only_substance_units = true;
        }
        builder
    }

    pub fn compartment(self, id: &str, size: f64) -> Self {
        self.variable(id, VariableKind::Compartment, size)
    }

    /// A parameter that rules or events may change; lives in the state.
    pub fn global(self, id: &str, value: f64) -> Self {
        self.variable(id, VariableKind::Parameter, value)
    }

    /// A constant parameter.
    pub fn parameter(mut self, id: &str, value: f64) -> Self {
        self.model.parameters.push(Parameter {
            id: id.to_string(),
            value,
        });
        self
    }

    pub fn reaction(mut self, id: &str, rate: &str, stoichiometry: &[(&str, f64)]) -> Self {
        self.model.reactions.push(Reaction {
            id: id.to_string(),
            rate: rate.to_string(),
            stoichiometry: stoichiometry
                .iter()
                .map(|(species, coefficient)| StoichiometryTerm {
                    species: species.to_string(),
                    coefficient: *coefficient,
                })
                .collect(),
            fast: false,
        });
        self
    }

    pub fn fast_reaction(self, id: &str, rate: &str, stoichiometry: &[(&str, f64)]) -> Self {
        let mut builder = self.reaction(id, rate, stoichiometry);
        if let Some(reaction) = builder.model.reactions.last_mut() {
            reaction.fast = true;
        }
        builder
    }

    pub fn assignment_rule(mut self, variable: &str, math: &str) -> Self {
        self.model.rules.push(Rule::Assignment {
            variable: variable.to_string(),
            math: math.to_string(),
        });
        self
    }

    pub fn rate_rule(mut self, variable: &str, math: &str) -> Self {
        self.model.rules.push(Rule::Rate {
            variable: variable.to_string(),
            math: math.to_string(),
        });
        self
    }

    pub fn algebraic_rule(mut self, variable: &str, math: &str) -> Self {
        self.model.rules.push(Rule::Algebraic {
            variable: variable.to_string(),
            math: math.to_string(),
        });
        self
    }

    pub fn initial_assignment(mut self, variable: &str, math: &str) -> Self {
        self.model.initial_assignments.push(InitialAssignment {
            variable: variable.to_string(),
            math: math.to_string(),
        });
        self
    }

    pub fn event(mut self, event: EventDefinition) -> Self {
        self.model.events.push(event);
        self
    }

    pub fn build(self) -> SimResult<ModelDefinition> {
        self.model.validate()?;
        Ok(self.model)
    }
}

//! Compiled expression nodes.
//!
//! Expressions are compiled into a [`NodeArena`]: an immutable, index-addressed
//! forest in which every node owns its children exclusively and knows its
//! single parent. Evaluation results live in a separate [`NodeCache`] so that
//! one arena can be shared read-only by several runs, each with its own cache.
//!
//! A cached value stays valid until something it reads changes. The cache
//! never watches for that itself; the owner calls one of the `invalidate_*`
//! methods, which marks the reading leaves dirty and walks parent links up to
//! the root. Nothing is ever invalidated downward.

use crate::equation_engine::{BinaryOp, Expr, UnaryOp, TIME_SYMBOL};
use crate::error::{SimError, SimResult};
use crate::traits::Scalar;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaryOp {
    Sum,
    Product,
    Min,
    Max,
    And,
    Or,
    Xor,
}

/// Built-in functions with fixed arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Floor,
    Ceil,
    Pow,
    /// `root(n, x)`: n-th root of x.
    Root,
    /// `log(base, x)`.
    Log,
}

impl Function {
    fn arity(self) -> usize {
        match self {
            Function::Pow | Function::Root | Function::Log => 2,
            _ => 1,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" | "arcsin" => Function::Asin,
            "acos" | "arccos" => Function::Acos,
            "atan" | "arctan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "ln" => Function::Ln,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "floor" => Function::Floor,
            "ceil" | "ceiling" => Function::Ceil,
            "pow" | "power" => Function::Pow,
            "root" => Function::Root,
            "log" => Function::Log,
            _ => return None,
        };
        Some(function)
    }

    fn apply<T: Scalar>(self, args: &[T]) -> T {
        let x = args[0];
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Asin => x.asin(),
            Function::Acos => x.acos(),
            Function::Atan => x.atan(),
            Function::Sinh => x.sinh(),
            Function::Cosh => x.cosh(),
            Function::Tanh => x.tanh(),
            Function::Exp => x.exp(),
            Function::Ln => x.ln(),
            Function::Log10 => x.ln() / T::constant(std::f64::consts::LN_10),
            Function::Sqrt => x.sqrt(),
            Function::Abs => x.abs(),
            Function::Floor => x.floor(),
            Function::Ceil => x.ceil(),
            Function::Pow => x.powf(args[1]),
            Function::Root => args[1].powf(T::one() / x),
            Function::Log => args[1].ln() / x.ln(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Constant(f64),
    State(usize),
    Parameter(usize),
    Time,
    Unary(UnaryOp, NodeId),
    /// Non-associative binary operators (subtraction, division, power and
    /// comparisons); associative ones compile to [`NodeKind::Nary`].
    Binary(BinaryOp, NodeId, NodeId),
    Nary(NaryOp, Vec<NodeId>),
    Call(Function, Vec<NodeId>),
    /// `(value, condition)` pairs tried in order.
    Piecewise {
        pieces: Vec<(NodeId, NodeId)>,
        otherwise: Option<NodeId>,
    },
    /// Value of state `variable` at `time - lag`.
    Delay { variable: usize, lag: NodeId },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
}

/// Name resolution for compilation.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    states: HashMap<String, usize>,
    parameters: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new(state_ids: &[String], parameter_ids: &[String]) -> Self {
        let states = state_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let parameters = parameter_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Self { states, parameters }
    }

    pub fn state(&self, id: &str) -> Option<usize> {
        self.states.get(id).copied()
    }

    pub fn parameter(&self, id: &str) -> Option<usize> {
        self.parameters.get(id).copied()
    }
}

/// Source of past state values for `delay` nodes.
pub trait DelayLookup {
    /// Value of `variable` at time `at`. `now` and `current` describe the
    /// point being evaluated, for lookups newer than anything recorded.
    fn lookup(&self, variable: usize, at: f64, now: f64, current: f64) -> f64;
}

/// Lookup for contexts without history: every delay reads the current value.
pub struct NoHistory;

impl DelayLookup for NoHistory {
    fn lookup(&self, _variable: usize, _at: f64, _now: f64, current: f64) -> f64 {
        current
    }
}

/// Everything a node may read during evaluation.
pub struct Env<'a> {
    pub time: f64,
    pub state: &'a [f64],
    pub parameters: &'a [f64],
    pub delays: &'a dyn DelayLookup,
}

#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
    state_readers: Vec<Vec<NodeId>>,
    parameter_readers: Vec<Vec<NodeId>>,
    time_readers: Vec<NodeId>,
}

fn truth(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}

fn boolean<T: Scalar>(flag: bool) -> T {
    if flag {
        T::one()
    } else {
        T::zero()
    }
}

impl NodeArena {
    pub fn new(state_count: usize, parameter_count: usize) -> Self {
        Self {
            nodes: Vec::new(),
            state_readers: vec![Vec::new(); state_count],
            parameter_readers: vec![Vec::new(); parameter_count],
            time_readers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    /// Whether any compiled tree reads past state.
    pub fn has_delays(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| matches!(node.kind, NodeKind::Delay { .. }))
    }

    /// A fresh cache with every node dirty.
    pub fn new_cache(&self) -> NodeCache {
        NodeCache {
            values: vec![0.0; self.nodes.len()],
            dirty: vec![true; self.nodes.len()],
            misses: 0,
        }
    }

    /// Compiles `expr` into a new tree and returns its root.
    ///
    /// Unknown symbols, unknown functions and arity mismatches are reported
    /// here; evaluation itself never fails.
    pub fn compile(&mut self, expr: &Expr, symbols: &SymbolTable) -> SimResult<NodeId> {
        match expr {
            Expr::Number(value) => Ok(self.push(NodeKind::Constant(*value), &[])),
            Expr::Symbol(name) => self.compile_symbol(name, symbols),
            Expr::Unary(op, operand) => {
                let child = self.compile(operand, symbols)?;
                Ok(self.push(NodeKind::Unary(*op, child), &[child]))
            }
            Expr::Binary(lhs, op, rhs) => match nary_for(*op) {
                Some(nary) => {
                    let mut operands = Vec::new();
                    flatten(expr, *op, &mut operands);
                    let children = operands
                        .into_iter()
                        .map(|operand| self.compile(operand, symbols))
                        .collect::<SimResult<Vec<_>>>()?;
                    Ok(self.push_nary(nary, children))
                }
                None => {
                    let l = self.compile(lhs, symbols)?;
                    let r = self.compile(rhs, symbols)?;
                    Ok(self.push(NodeKind::Binary(*op, l, r), &[l, r]))
                }
            },
            Expr::Call(name, args) => self.compile_call(name, args, symbols),
        }
    }

    fn compile_symbol(&mut self, name: &str, symbols: &SymbolTable) -> SimResult<NodeId> {
        if name == TIME_SYMBOL {
            let id = self.push(NodeKind::Time, &[]);
            self.time_readers.push(id);
            return Ok(id);
        }
        if let Some(index) = symbols.state(name) {
            let id = self.push(NodeKind::State(index), &[]);
            self.state_readers[index].push(id);
            return Ok(id);
        }
        if let Some(index) = symbols.parameter(name) {
            let id = self.push(NodeKind::Parameter(index), &[]);
            self.parameter_readers[index].push(id);
            return Ok(id);
        }
        Err(SimError::UnknownSymbol(name.to_string()))
    }

    fn compile_call(
        &mut self,
        name: &str,
        args: &[Expr],
        symbols: &SymbolTable,
    ) -> SimResult<NodeId> {
        let arity_error = |expected: &str| {
            SimError::Configuration(format!(
                "function '{name}' expects {expected} argument(s), got {}",
                args.len()
            ))
        };

        match name {
            "delay" => {
                if args.len() != 2 {
                    return Err(arity_error("2"));
                }
                let variable = match &args[0] {
                    Expr::Symbol(id) => symbols.state(id).ok_or_else(|| {
                        SimError::Configuration(format!(
                            "delay() needs a state variable, '{id}' is not one"
                        ))
                    })?,
                    _ => {
                        return Err(SimError::Configuration(
                            "delay() needs a state variable as first argument".into(),
                        ))
                    }
                };
                let lag = self.compile(&args[1], symbols)?;
                let id = self.push(NodeKind::Delay { variable, lag }, &[lag]);
                // Past values move with time even when the state does not.
                self.time_readers.push(id);
                Ok(id)
            }
            "piecewise" => {
                if args.is_empty() {
                    return Err(arity_error("at least 1"));
                }
                let mut pieces = Vec::with_capacity(args.len() / 2);
                let mut children = Vec::with_capacity(args.len());
                for pair in args.chunks_exact(2) {
                    let value = self.compile(&pair[0], symbols)?;
                    let condition = self.compile(&pair[1], symbols)?;
                    pieces.push((value, condition));
                    children.extend([value, condition]);
                }
                let otherwise = if args.len() % 2 == 1 {
                    let id = self.compile(&args[args.len() - 1], symbols)?;
                    children.push(id);
                    Some(id)
                } else {
                    None
                };
                Ok(self.push(NodeKind::Piecewise { pieces, otherwise }, &children))
            }
            "not" => {
                if args.len() != 1 {
                    return Err(arity_error("1"));
                }
                let child = self.compile(&args[0], symbols)?;
                Ok(self.push(NodeKind::Unary(UnaryOp::Not, child), &[child]))
            }
            "min" | "max" | "and" | "or" | "xor" | "sum" | "product" => {
                if args.is_empty() {
                    return Err(arity_error("at least 1"));
                }
                let op = match name {
                    "min" => NaryOp::Min,
                    "max" => NaryOp::Max,
                    "and" => NaryOp::And,
                    "or" => NaryOp::Or,
                    "xor" => NaryOp::Xor,
                    "sum" => NaryOp::Sum,
                    _ => NaryOp::Product,
                };
                let children = args
                    .iter()
                    .map(|arg| self.compile(arg, symbols))
                    .collect::<SimResult<Vec<_>>>()?;
                Ok(self.push_nary(op, children))
            }
            _ => {
                let function = Function::from_name(name)
                    .ok_or_else(|| SimError::Configuration(format!("unknown function '{name}'")))?;
                // log(x) is the natural logarithm; log(b, x) takes an explicit base.
                if function == Function::Log && args.len() == 1 {
                    let child = self.compile(&args[0], symbols)?;
                    return Ok(self.push(NodeKind::Call(Function::Ln, vec![child]), &[child]));
                }
                if args.len() != function.arity() {
                    return Err(arity_error(&function.arity().to_string()));
                }
                let children = args
                    .iter()
                    .map(|arg| self.compile(arg, symbols))
                    .collect::<SimResult<Vec<_>>>()?;
                Ok(self.push(NodeKind::Call(function, children.clone()), &children))
            }
        }
    }

    fn push_nary(&mut self, op: NaryOp, children: Vec<NodeId>) -> NodeId {
        let links = children.clone();
        self.push(NodeKind::Nary(op, children), &links)
    }

    fn push(&mut self, kind: NodeKind, children: &[NodeId]) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, parent: None });
        for child in children {
            self.nodes[child.index()].parent = Some(id);
        }
        id
    }

    /// Non-memoized evaluation in any [`Scalar`]; used for dual-number
    /// Jacobians where the cache (plain `f64`) does not apply.
    pub fn evaluate_with<T: Scalar>(
        &self,
        id: NodeId,
        time: f64,
        state: &[T],
        parameters: &[f64],
        delays: &dyn DelayLookup,
    ) -> T {
        let eval = |child: NodeId| self.evaluate_with(child, time, state, parameters, delays);
        match self.kind(id) {
            NodeKind::Constant(value) => T::constant(*value),
            NodeKind::State(index) => state[*index],
            NodeKind::Parameter(index) => T::constant(parameters[*index]),
            NodeKind::Time => T::constant(time),
            NodeKind::Unary(UnaryOp::Neg, child) => -eval(*child),
            NodeKind::Unary(UnaryOp::Not, child) => boolean(!truth(eval(*child).value())),
            NodeKind::Binary(op, l, r) => {
                let (a, b) = (eval(*l), eval(*r));
                match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Add => a + b,
                    BinaryOp::Mul => a * b,
                    _ => boolean(compare(*op, a.value(), b.value())),
                }
            }
            NodeKind::Nary(op, children) => {
                let values: Vec<T> = children.iter().map(|c| eval(*c)).collect();
                combine_nary(*op, &values)
            }
            NodeKind::Call(function, children) => {
                let values: Vec<T> = children.iter().map(|c| eval(*c)).collect();
                function.apply(&values)
            }
            NodeKind::Piecewise { pieces, otherwise } => {
                for (value, condition) in pieces {
                    if truth(eval(*condition).value()) {
                        return eval(*value);
                    }
                }
                otherwise.map_or(T::constant(f64::NAN), eval)
            }
            NodeKind::Delay { variable, lag } => {
                let lag = eval(*lag).value();
                let current = state[*variable].value();
                T::constant(delays.lookup(*variable, time - lag, time, current))
            }
        }
    }
}

fn nary_for(op: BinaryOp) -> Option<NaryOp> {
    match op {
        BinaryOp::Add => Some(NaryOp::Sum),
        BinaryOp::Mul => Some(NaryOp::Product),
        BinaryOp::And => Some(NaryOp::And),
        BinaryOp::Or => Some(NaryOp::Or),
        _ => None,
    }
}

/// Collects the operands of a left-or-right nested chain of `op`.
fn flatten<'e>(expr: &'e Expr, op: BinaryOp, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::Binary(lhs, inner, rhs) if *inner == op => {
            flatten(lhs, op, out);
            flatten(rhs, op, out);
        }
        other => out.push(other),
    }
}

fn compare(op: BinaryOp, a: f64, b: f64) -> bool {
    match op {
        BinaryOp::Lt => a < b,
        BinaryOp::Le => a <= b,
        BinaryOp::Gt => a > b,
        BinaryOp::Ge => a >= b,
        BinaryOp::Eq => a == b,
        BinaryOp::Ne => a != b,
        BinaryOp::And => truth(a) && truth(b),
        BinaryOp::Or => truth(a) || truth(b),
        _ => false,
    }
}

fn combine_nary<T: Scalar>(op: NaryOp, values: &[T]) -> T {
    match op {
        NaryOp::Sum => values.iter().fold(T::zero(), |acc, v| acc + *v),
        NaryOp::Product => values.iter().fold(T::one(), |acc, v| acc * *v),
        NaryOp::Min => values[1..].iter().fold(values[0], |acc, v| {
            if v.value() < acc.value() {
                *v
            } else {
                acc
            }
        }),
        NaryOp::Max => values[1..].iter().fold(values[0], |acc, v| {
            if v.value() > acc.value() {
                *v
            } else {
                acc
            }
        }),
        NaryOp::And => boolean(values.iter().all(|v| truth(v.value()))),
        NaryOp::Or => boolean(values.iter().any(|v| truth(v.value()))),
        NaryOp::Xor => boolean(values.iter().filter(|v| truth(v.value())).count() % 2 == 1),
    }
}

/// Run-local memo storage for one [`NodeArena`].
#[derive(Debug, Clone)]
pub struct NodeCache {
    values: Vec<f64>,
    dirty: Vec<bool>,
    misses: u64,
}

impl NodeCache {
    pub fn is_dirty(&self, id: NodeId) -> bool {
        self.dirty[id.index()]
    }

    /// Number of node evaluations that could not be served from the cache.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Marks `id` and every ancestor dirty.
    pub fn invalidate(&mut self, arena: &NodeArena, id: NodeId) {
        let mut current = Some(id);
        while let Some(node) = current {
            self.dirty[node.index()] = true;
            current = arena.parent(node);
        }
    }

    pub fn invalidate_state(&mut self, arena: &NodeArena, index: usize) {
        for &reader in &arena.state_readers[index] {
            self.invalidate(arena, reader);
        }
    }

    pub fn invalidate_parameter(&mut self, arena: &NodeArena, index: usize) {
        for &reader in &arena.parameter_readers[index] {
            self.invalidate(arena, reader);
        }
    }

    pub fn invalidate_time(&mut self, arena: &NodeArena) {
        for &reader in &arena.time_readers {
            self.invalidate(arena, reader);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.dirty.iter_mut().for_each(|d| *d = true);
    }

    /// Memoized evaluation. Clean nodes return their cached value; dirty nodes
    /// recompute from their children and become clean.
    pub fn evaluate(&mut self, arena: &NodeArena, id: NodeId, env: &Env<'_>) -> f64 {
        let slot = id.index();
        if !self.dirty[slot] {
            return self.values[slot];
        }
        self.misses += 1;

        let value = match arena.kind(id) {
            NodeKind::Constant(value) => *value,
            NodeKind::State(index) => env.state[*index],
            NodeKind::Parameter(index) => env.parameters[*index],
            NodeKind::Time => env.time,
            NodeKind::Unary(UnaryOp::Neg, child) => -self.evaluate(arena, *child, env),
            NodeKind::Unary(UnaryOp::Not, child) => {
                boolean(!truth(self.evaluate(arena, *child, env)))
            }
            NodeKind::Binary(op, l, r) => {
                let a = self.evaluate(arena, *l, env);
                let b = self.evaluate(arena, *r, env);
                match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Add => a + b,
                    BinaryOp::Mul => a * b,
                    _ => boolean(compare(*op, a, b)),
                }
            }
            NodeKind::Nary(op, children) => {
                let values: Vec<f64> = children
                    .iter()
                    .map(|c| self.evaluate(arena, *c, env))
                    .collect();
                combine_nary(*op, &values)
            }
            NodeKind::Call(function, children) => {
                let values: Vec<f64> = children
                    .iter()
                    .map(|c| self.evaluate(arena, *c, env))
                    .collect();
                function.apply(&values)
            }
            NodeKind::Piecewise { pieces, otherwise } => {
                let mut chosen = None;
                for (value, condition) in pieces {
                    if truth(self.evaluate(arena, *condition, env)) {
                        chosen = Some(*value);
                        break;
                    }
                }
                match chosen.or(*otherwise) {
                    Some(branch) => self.evaluate(arena, branch, env),
                    None => f64::NAN,
                }
            }
            NodeKind::Delay { variable, lag } => {
                let lag = self.evaluate(arena, *lag, env);
                let current = env.state[*variable];
                env.delays
                    .lookup(*variable, env.time - lag, env.time, current)
            }
        };

        self.values[slot] = value;
        self.dirty[slot] = false;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse;
    use approx::assert_relative_eq;

    fn table() -> SymbolTable {
        SymbolTable::new(
            &["x".to_string(), "y".to_string()],
            &["k".to_string()],
        )
    }

    fn compile(source: &str) -> (NodeArena, NodeId) {
        let mut arena = NodeArena::new(2, 1);
        let root = arena
            .compile(&parse(source).expect("parse"), &table())
            .expect("compile");
        (arena, root)
    }

    fn env<'a>(time: f64, state: &'a [f64], parameters: &'a [f64]) -> Env<'a> {
        Env {
            time,
            state,
            parameters,
            delays: &NoHistory,
        }
    }

    #[test]
    fn evaluates_arithmetic_and_functions() {
        let (arena, root) = compile("k * x / (1 + y) + exp(0) - pow(2, 3)");
        let mut cache = arena.new_cache();
        let value = cache.evaluate(&arena, root, &env(0.0, &[4.0, 1.0], &[3.0]));
        assert_relative_eq!(value, 3.0 * 4.0 / 2.0 + 1.0 - 8.0);
    }

    #[test]
    fn sums_compile_to_a_single_nary_node() {
        let (arena, root) = compile("x + y + k + 1");
        match arena.kind(root) {
            NodeKind::Nary(NaryOp::Sum, children) => assert_eq!(children.len(), 4),
            other => panic!("expected n-ary sum, got {other:?}"),
        }
    }

    #[test]
    fn division_by_zero_follows_ieee() {
        let (arena, root) = compile("x / y");
        let mut cache = arena.new_cache();
        let value = cache.evaluate(&arena, root, &env(0.0, &[1.0, 0.0], &[0.0]));
        assert!(value.is_infinite() && value > 0.0);
        cache.invalidate_all();
        let value = cache.evaluate(&arena, root, &env(0.0, &[0.0, 0.0], &[0.0]));
        assert!(value.is_nan());
    }

    #[test]
    fn cached_value_survives_until_invalidated() {
        let (arena, root) = compile("x * k + y");
        let mut cache = arena.new_cache();
        let first = cache.evaluate(&arena, root, &env(0.0, &[2.0, 1.0], &[3.0]));
        assert_relative_eq!(first, 7.0);
        let misses = cache.misses();

        // Stale input, but nothing was invalidated: the cache answers.
        let again = cache.evaluate(&arena, root, &env(0.0, &[5.0, 1.0], &[3.0]));
        assert_relative_eq!(again, 7.0);
        assert_eq!(cache.misses(), misses);

        cache.invalidate_state(&arena, 0);
        let updated = cache.evaluate(&arena, root, &env(0.0, &[5.0, 1.0], &[3.0]));
        assert_relative_eq!(updated, 16.0);
    }

    #[test]
    fn invalidation_only_walks_upward() {
        let (arena, root) = compile("x * k + y");
        let mut cache = arena.new_cache();
        cache.evaluate(&arena, root, &env(0.0, &[2.0, 1.0], &[3.0]));

        cache.invalidate_state(&arena, 1);
        assert!(cache.is_dirty(root));
        let NodeKind::Nary(_, children) = arena.kind(root) else {
            panic!("expected sum");
        };
        // The product subtree does not read y and keeps its cache.
        assert!(!cache.is_dirty(children[0]));
        assert!(cache.is_dirty(children[1]));
    }

    #[test]
    fn time_readers_are_invalidated_by_time() {
        let (arena, root) = compile("time * 2");
        let mut cache = arena.new_cache();
        assert_relative_eq!(cache.evaluate(&arena, root, &env(1.0, &[0.0, 0.0], &[0.0])), 2.0);
        cache.invalidate_time(&arena);
        assert_relative_eq!(cache.evaluate(&arena, root, &env(3.0, &[0.0, 0.0], &[0.0])), 6.0);
    }

    #[test]
    fn piecewise_and_logic() {
        let (arena, root) = compile("piecewise(10, x > 1 && y < 1, 20, !(x > 1), 30)");
        let mut cache = arena.new_cache();
        let value = |cache: &mut NodeCache, x: f64, y: f64| {
            cache.invalidate_all();
            cache.evaluate(&arena, root, &env(0.0, &[x, y], &[0.0]))
        };
        assert_eq!(value(&mut cache, 2.0, 0.0), 10.0);
        assert_eq!(value(&mut cache, 0.0, 0.0), 20.0);
        assert_eq!(value(&mut cache, 2.0, 2.0), 30.0);
    }

    #[test]
    fn piecewise_without_match_is_nan() {
        let (arena, root) = compile("piecewise(1, x > 0)");
        let mut cache = arena.new_cache();
        assert!(cache
            .evaluate(&arena, root, &env(0.0, &[-1.0, 0.0], &[0.0]))
            .is_nan());
    }

    #[test]
    fn construction_errors() {
        let mut arena = NodeArena::new(2, 1);
        let symbols = table();
        let err = arena
            .compile(&parse("sin(x, y)").expect("parse"), &symbols)
            .expect_err("arity");
        assert!(err.to_string().contains("expects 1"));
        assert!(matches!(
            arena.compile(&parse("frobnicate(x)").expect("parse"), &symbols),
            Err(SimError::Configuration(_))
        ));
        assert!(matches!(
            arena.compile(&parse("z + 1").expect("parse"), &symbols),
            Err(SimError::UnknownSymbol(name)) if name == "z"
        ));
        assert!(matches!(
            arena.compile(&parse("delay(k, 1)").expect("parse"), &symbols),
            Err(SimError::Configuration(_))
        ));
    }

    #[test]
    fn log_forms() {
        let (arena, root) = compile("log(2, 8) + log(exp(1)) + log10(100) + root(3, 27)");
        let mut cache = arena.new_cache();
        let value = cache.evaluate(&arena, root, &env(0.0, &[0.0, 0.0], &[0.0]));
        assert_relative_eq!(value, 3.0 + 1.0 + 2.0 + 3.0, epsilon = 1e-12);
    }

    #[test]
    fn generic_evaluation_matches_memoized_path() {
        let (arena, root) = compile("k * x^2 + sin(y) - max(x, y)");
        let mut cache = arena.new_cache();
        let state = [1.5, 0.3];
        let memo = cache.evaluate(&arena, root, &env(0.0, &state, &[2.0]));
        let direct: f64 = arena.evaluate_with(root, 0.0, &state, &[2.0], &NoHistory);
        assert_eq!(memo, direct);
    }
}

//! How a network type supplies its right-hand sides.
//!
//! A [`Protocol`] is either one monolithic producer of `(key, terms)` pairs or
//! a set of termwise hooks. It is checked against the graph's edge kind when
//! the network is built, yielding the [`Rules`] the assembler runs.

use crate::config::{ParamScope, Schema, TIME};
use crate::error::{NetworkError, Result};
use crate::graph::{EdgeKind, Graph, NodeId};
use crate::symbolic::Expr;
use crate::views::{self, EdgeParamView, NodeParamView, VarView};
use std::fmt;
use std::ops::{Add, AddAssign, Index, Mul, Neg, Sub};

/// Read-only view handed to every protocol hook.
pub struct Context<'a, N, D> {
    graph: &'a Graph<N, D>,
    schema: &'a Schema,
}

impl<'a, N: NodeId, D: EdgeKind> Context<'a, N, D> {
    pub(crate) fn new(graph: &'a Graph<N, D>, schema: &'a Schema) -> Self {
        Self { graph, schema }
    }

    pub fn graph(&self) -> &'a Graph<N, D> {
        self.graph
    }

    pub fn nodes(&self) -> impl Iterator<Item = &'a N> + 'a {
        self.graph.nodes()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Declared state variables, in declaration order.
    pub fn vars(&self) -> &'a [String] {
        self.schema.vars()
    }

    pub fn var(&self, name: &str) -> Result<VarView<'a, N, D>> {
        let index = self
            .schema
            .var_index(name)
            .ok_or_else(|| views::unknown_variable(name))?;
        Ok(VarView::new(self.graph, &self.schema.vars()[index]))
    }

    /// The first declared variable.
    pub fn state(&self) -> VarView<'a, N, D> {
        // a schema always declares at least one variable
        VarView::new(self.graph, &self.schema.vars()[0])
    }

    pub fn node_param(&self, name: &str) -> Result<NodeParamView<'a, N, D>> {
        let name = self.declared(ParamScope::Node, name)?;
        Ok(NodeParamView::new(self.graph, name))
    }

    pub fn edge_param(&self, name: &str) -> Result<EdgeParamView<'a, N, D>> {
        let name = self.declared(ParamScope::Edge, name)?;
        Ok(EdgeParamView::new(self.graph, name))
    }

    pub fn graph_param(&self, name: &str) -> Result<Expr> {
        let name = self.declared(ParamScope::Graph, name)?;
        Ok(views::graph_param(self.graph, name))
    }

    /// The time placeholder.
    pub fn t(&self) -> Expr {
        Expr::symbol(TIME)
    }

    /// Weighted adjacency `A[u, v]` as a constant; zero when there is no edge.
    pub fn a(&self, u: &N, v: &N) -> Expr {
        Expr::num(self.graph.weight(u, v))
    }

    fn declared(&self, scope: ParamScope, name: &str) -> Result<&'a str> {
        self.schema
            .params(scope)
            .iter()
            .find(|p| *p == name)
            .map(String::as_str)
            .ok_or_else(|| NetworkError::UnknownParameter(format!("{scope} parameter {name}")))
    }
}

/// Key of a monolithic right-hand side entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RhsKey<N> {
    /// One entry per declared variable for this node.
    Node(N),
    /// One entry per node for this variable.
    Var(String),
}

impl<N> RhsKey<N> {
    pub fn var(name: impl Into<String>) -> Self {
        RhsKey::Var(name.into())
    }
}

/// A vector of right-hand side contributions.
///
/// Addition is elementwise. Adding vectors of different lengths pads the
/// shorter one with the undefined value, so the mismatch surfaces when the
/// network is rebuilt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Terms(Vec<Expr>);

impl Terms {
    pub fn new(items: Vec<Expr>) -> Self {
        Terms(items)
    }

    pub fn zeros(len: usize) -> Self {
        Terms(vec![Expr::zero(); len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Expr> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Expr] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Expr> {
        self.0
    }

    /// Every entry multiplied by `factor`.
    pub fn scale(self, factor: &Expr) -> Terms {
        Terms(self.0.into_iter().map(|e| factor * e).collect())
    }

    fn zip_with(self, other: Terms, f: impl Fn(Expr, Expr) -> Expr) -> Terms {
        let len = self.len().max(other.len());
        let mut lhs = self.0.into_iter();
        let mut rhs = other.0.into_iter();
        let items = (0..len)
            .map(|_| match (lhs.next(), rhs.next()) {
                (Some(a), Some(b)) => f(a, b),
                _ => Expr::undefined(),
            })
            .collect();
        Terms(items)
    }
}

impl From<Expr> for Terms {
    fn from(expr: Expr) -> Self {
        Terms(vec![expr])
    }
}

impl From<Vec<Expr>> for Terms {
    fn from(items: Vec<Expr>) -> Self {
        Terms(items)
    }
}

impl<const K: usize> From<[Expr; K]> for Terms {
    fn from(items: [Expr; K]) -> Self {
        Terms(items.into())
    }
}

impl FromIterator<Expr> for Terms {
    fn from_iter<I: IntoIterator<Item = Expr>>(iter: I) -> Self {
        Terms(iter.into_iter().collect())
    }
}

impl IntoIterator for Terms {
    type Item = Expr;
    type IntoIter = std::vec::IntoIter<Expr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Index<usize> for Terms {
    type Output = Expr;

    fn index(&self, index: usize) -> &Expr {
        &self.0[index]
    }
}

impl Add for Terms {
    type Output = Terms;

    fn add(self, rhs: Terms) -> Terms {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl Sub for Terms {
    type Output = Terms;

    fn sub(self, rhs: Terms) -> Terms {
        self.zip_with(rhs, |a, b| a - b)
    }
}

impl AddAssign for Terms {
    fn add_assign(&mut self, rhs: Terms) {
        let lhs = std::mem::take(self);
        *self = lhs + rhs;
    }
}

impl Neg for Terms {
    type Output = Terms;

    fn neg(self) -> Terms {
        Terms(self.0.into_iter().map(|e| -e).collect())
    }
}

impl Mul<Expr> for Terms {
    type Output = Terms;

    fn mul(self, factor: Expr) -> Terms {
        self.scale(&factor)
    }
}

impl Mul<f64> for Terms {
    type Output = Terms;

    fn mul(self, factor: f64) -> Terms {
        self.scale(&Expr::num(factor))
    }
}

pub type RhsFn<N, D> = Box<dyn Fn(&Context<'_, N, D>) -> Result<Vec<(RhsKey<N>, Terms)>>>;
pub type NodeTermFn<N, D> = Box<dyn Fn(&Context<'_, N, D>, &N) -> Result<Terms>>;
pub type EdgeTermFn<N, D> = Box<dyn Fn(&Context<'_, N, D>, &N, &N) -> Result<Terms>>;

/// Termwise hooks.
///
/// - `node_term(u)`: self-dynamics of `u`.
/// - `source_term(u, v)`: contribution of the edge `u -> v` to `u`.
/// - `target_term(u, v)`: contribution of the edge `u -> v` to `v`, scaled by
///   `A[u, v]`. Required for directed graphs only.
pub struct TermHooks<N, D> {
    node_term: Option<NodeTermFn<N, D>>,
    source_term: Option<EdgeTermFn<N, D>>,
    target_term: Option<EdgeTermFn<N, D>>,
}

impl<N, D> Default for TermHooks<N, D> {
    fn default() -> Self {
        Self {
            node_term: None,
            source_term: None,
            target_term: None,
        }
    }
}

impl<N: NodeId, D: EdgeKind> TermHooks<N, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_term<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_, N, D>, &N) -> Result<Terms> + 'static,
    {
        self.node_term = Some(Box::new(f));
        self
    }

    pub fn source_term<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_, N, D>, &N, &N) -> Result<Terms> + 'static,
    {
        self.source_term = Some(Box::new(f));
        self
    }

    pub fn target_term<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_, N, D>, &N, &N) -> Result<Terms> + 'static,
    {
        self.target_term = Some(Box::new(f));
        self
    }
}

/// Right-hand side description of a network type.
pub enum Protocol<N, D> {
    Monolithic(RhsFn<N, D>),
    Termwise(TermHooks<N, D>),
}

impl<N: NodeId, D: EdgeKind> Protocol<N, D> {
    pub fn monolithic<F>(rhs: F) -> Self
    where
        F: Fn(&Context<'_, N, D>) -> Result<Vec<(RhsKey<N>, Terms)>> + 'static,
    {
        Protocol::Monolithic(Box::new(rhs))
    }

    pub fn termwise(hooks: TermHooks<N, D>) -> Self {
        Protocol::Termwise(hooks)
    }

    /// Checks the capability set against the edge kind `D`.
    pub(crate) fn validate(self) -> Result<Rules<N, D>> {
        let hooks = match self {
            Protocol::Monolithic(rhs) => return Ok(Rules::Monolithic(rhs)),
            Protocol::Termwise(hooks) => hooks,
        };

        let kind = if D::DIRECTED {
            ProtocolKind::TermwiseDirected
        } else {
            ProtocolKind::TermwiseUndirected
        };
        let missing = |hook| NetworkError::MissingTermImplementation {
            hook,
            protocol: kind,
        };

        let node_term = hooks.node_term.ok_or_else(|| missing("node_term"))?;
        let source_term = hooks.source_term.ok_or_else(|| missing("source_term"))?;

        if !D::DIRECTED {
            if hooks.target_term.is_some() {
                tracing::warn!("ignoring target_term on an undirected network");
            }
            return Ok(Rules::TermwiseUndirected {
                node_term,
                source_term,
            });
        }

        let target_term = hooks.target_term.ok_or_else(|| missing("target_term"))?;
        Ok(Rules::TermwiseDirected {
            node_term,
            source_term,
            target_term,
        })
    }
}

impl<N: NodeId, D: EdgeKind> From<TermHooks<N, D>> for Protocol<N, D> {
    fn from(hooks: TermHooks<N, D>) -> Self {
        Protocol::Termwise(hooks)
    }
}

/// Capability set of a validated protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Monolithic,
    TermwiseUndirected,
    TermwiseDirected,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolKind::Monolithic => "monolithic",
            ProtocolKind::TermwiseUndirected => "undirected termwise",
            ProtocolKind::TermwiseDirected => "directed termwise",
        })
    }
}

/// A validated protocol; every hook its kind needs is present.
pub(crate) enum Rules<N, D> {
    Monolithic(RhsFn<N, D>),
    TermwiseUndirected {
        node_term: NodeTermFn<N, D>,
        source_term: EdgeTermFn<N, D>,
    },
    TermwiseDirected {
        node_term: NodeTermFn<N, D>,
        source_term: EdgeTermFn<N, D>,
        target_term: EdgeTermFn<N, D>,
    },
}

impl<N, D> Rules<N, D> {
    pub(crate) fn kind(&self) -> ProtocolKind {
        match self {
            Rules::Monolithic(_) => ProtocolKind::Monolithic,
            Rules::TermwiseUndirected { .. } => ProtocolKind::TermwiseUndirected,
            Rules::TermwiseDirected { .. } => ProtocolKind::TermwiseDirected,
        }
    }
}

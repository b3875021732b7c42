//! Symbolic views over the graph: state-variable placeholders and declared
//! parameters.
//!
//! Views borrow the graph, so a placeholder handed out by a view is only
//! meaningful for the graph state it was derived from.

use crate::error::{NetworkError, Result};
use crate::graph::{EdgeKind, Graph, NodeId};
use crate::store::AttrMap;
use crate::symbolic::{Expr, Symbol};

/// Placeholder of variable `var` at node index `index`.
pub fn placeholder(var: &str, index: usize) -> Symbol {
    Symbol::new(format!("{var}_{index}"))
}

/// Numeric value of `name` in `attrs` as a constant, or the undefined value.
fn param_value(attrs: &AttrMap, name: &str) -> Expr {
    attrs
        .get_f64(name)
        .map(Expr::num)
        .unwrap_or_else(Expr::undefined)
}

/// Placeholders of one declared state variable.
#[derive(Debug)]
pub struct VarView<'a, N, D> {
    graph: &'a Graph<N, D>,
    name: &'a str,
}

impl<'a, N: NodeId, D: EdgeKind> VarView<'a, N, D> {
    pub(crate) fn new(graph: &'a Graph<N, D>, name: &'a str) -> Self {
        Self { graph, name }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Placeholder of this variable at `node`.
    pub fn at(&self, node: &N) -> Result<Expr> {
        let index = self.graph.index(node)?;
        Ok(Expr::Sym(self.symbol(index)))
    }

    pub fn symbol(&self, index: usize) -> Symbol {
        placeholder(self.name, index)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Placeholders over all current nodes, in node order.
    pub fn as_vector(&self) -> Vec<Expr> {
        (0..self.len()).map(|i| Expr::Sym(self.symbol(i))).collect()
    }
}

/// A declared per-node parameter.
///
/// A node that lacks the attribute (or holds a non-numeric value) yields the
/// undefined expression, which fails the next rebuild.
#[derive(Debug)]
pub struct NodeParamView<'a, N, D> {
    graph: &'a Graph<N, D>,
    name: &'a str,
}

impl<'a, N: NodeId, D: EdgeKind> NodeParamView<'a, N, D> {
    pub(crate) fn new(graph: &'a Graph<N, D>, name: &'a str) -> Self {
        Self { graph, name }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn at(&self, node: &N) -> Result<Expr> {
        Ok(param_value(self.graph.node_attrs(node)?, self.name))
    }

    /// Values over all current nodes, in node order.
    pub fn as_vector(&self) -> Vec<Expr> {
        self.graph
            .nodes()
            .map(|node| {
                self.graph
                    .node_attrs(node)
                    .map(|attrs| param_value(attrs, self.name))
                    .unwrap_or_else(|_| Expr::undefined())
            })
            .collect()
    }
}

/// A declared per-edge parameter.
#[derive(Debug)]
pub struct EdgeParamView<'a, N, D> {
    graph: &'a Graph<N, D>,
    name: &'a str,
}

impl<'a, N: NodeId, D: EdgeKind> EdgeParamView<'a, N, D> {
    pub(crate) fn new(graph: &'a Graph<N, D>, name: &'a str) -> Self {
        Self { graph, name }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Value on the edge `u -> v`; `UnknownEdge` if there is no such edge.
    pub fn at(&self, u: &N, v: &N) -> Result<Expr> {
        Ok(param_value(self.graph.edge_attrs(u, v)?, self.name))
    }
}

pub(crate) fn graph_param<N: NodeId, D: EdgeKind>(graph: &Graph<N, D>, name: &str) -> Expr {
    param_value(graph.graph_attrs(), name)
}

pub(crate) fn unknown_variable(name: &str) -> NetworkError {
    NetworkError::UnknownVariable(name.to_string())
}

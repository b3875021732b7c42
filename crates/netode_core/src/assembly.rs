//! Turns protocol output into ordered dependency and expression vectors.

use crate::error::{NetworkError, Result};
use crate::graph::{describe, EdgeKind, NodeId};
use crate::protocol::{Context, RhsKey, Rules, Terms};
use crate::symbolic::{Expr, Symbol};
use crate::views::placeholder;
use std::collections::HashMap;
use tracing::debug;

/// Order of the assembled vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Nodes in graph order, then variables in declaration order.
    ByNode,
    /// Variables in declaration order, then nodes in graph order.
    ByVariable,
}

/// `(dependency, expression)` pairs ready for compilation.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub layout: Layout,
    pub dependencies: Vec<Symbol>,
    pub expressions: Vec<Expr>,
}

pub(crate) fn assemble<N: NodeId, D: EdgeKind>(
    rules: &Rules<N, D>,
    ctx: &Context<'_, N, D>,
) -> Result<Assembled> {
    debug!(
        protocol = %rules.kind(),
        nodes = ctx.node_count(),
        vars = ctx.vars().len(),
        "assembling dynamics"
    );

    let (layout, rows) = match rules {
        Rules::Monolithic(rhs) => monolithic(rhs(ctx)?, ctx)?,
        Rules::TermwiseUndirected {
            node_term,
            source_term,
        } => {
            let mut rows = Vec::with_capacity(ctx.node_count());
            for u in ctx.nodes() {
                let mut eq = checked(node_term(ctx, u)?, ctx, || {
                    format!("node_term({})", describe(u))
                })?;
                for v in ctx.graph().neighbors(u)? {
                    eq += checked(source_term(ctx, u, v)?, ctx, || {
                        format!("source_term({}, {})", describe(u), describe(v))
                    })?;
                }
                rows.push(eq);
            }
            (Layout::ByNode, rows)
        }
        Rules::TermwiseDirected {
            node_term,
            source_term,
            target_term,
        } => {
            let mut rows = Vec::with_capacity(ctx.node_count());
            for u in ctx.nodes() {
                let mut eq = checked(node_term(ctx, u)?, ctx, || {
                    format!("node_term({})", describe(u))
                })?;
                for v in ctx.graph().successors(u)? {
                    eq += checked(source_term(ctx, u, v)?, ctx, || {
                        format!("source_term({}, {})", describe(u), describe(v))
                    })?;
                }
                for v in ctx.graph().predecessors(u)? {
                    let term = checked(target_term(ctx, v, u)?, ctx, || {
                        format!("target_term({}, {})", describe(v), describe(u))
                    })?;
                    eq += term.scale(&ctx.a(v, u));
                }
                rows.push(eq);
            }
            (Layout::ByNode, rows)
        }
    };

    let dependencies = dependency_vector(layout, ctx);
    let expressions: Vec<Expr> = rows
        .into_iter()
        .flatten()
        .map(|expr| expr.simplify())
        .collect();

    for (dep, expr) in dependencies.iter().zip(&expressions) {
        if expr.is_undefined() {
            return Err(NetworkError::UndefinedExpression {
                dependency: dep.to_string(),
                expression: expr.to_string(),
            });
        }
    }

    Ok(Assembled {
        layout,
        dependencies,
        expressions,
    })
}

fn dependency_vector<N: NodeId, D: EdgeKind>(
    layout: Layout,
    ctx: &Context<'_, N, D>,
) -> Vec<Symbol> {
    let n = ctx.node_count();
    let vars = ctx.vars();
    match layout {
        Layout::ByNode => (0..n)
            .flat_map(|i| vars.iter().map(move |var| placeholder(var, i)))
            .collect(),
        Layout::ByVariable => vars
            .iter()
            .flat_map(|var| (0..n).map(move |i| placeholder(var, i)))
            .collect(),
    }
}

/// Termwise contributions must carry one entry per declared variable.
fn checked<N: NodeId, D: EdgeKind>(
    terms: Terms,
    ctx: &Context<'_, N, D>,
    what: impl FnOnce() -> String,
) -> Result<Terms> {
    let expected = ctx.vars().len();
    if terms.len() != expected {
        return Err(NetworkError::ContractViolation(format!(
            "{} returned {} terms, expected one per variable ({expected})",
            what(),
            terms.len()
        )));
    }
    Ok(terms)
}

/// Detects the keying convention and orders the rows.
fn monolithic<N: NodeId, D: EdgeKind>(
    entries: Vec<(RhsKey<N>, Terms)>,
    ctx: &Context<'_, N, D>,
) -> Result<(Layout, Vec<Terms>)> {
    let graph = ctx.graph();
    let vars = ctx.vars();

    let by_node = entries
        .iter()
        .all(|(key, _)| matches!(key, RhsKey::Node(n) if graph.has_node(n)));
    let by_var = !entries.is_empty()
        && entries
            .iter()
            .all(|(key, _)| matches!(key, RhsKey::Var(v) if vars.contains(v)));

    if by_node {
        debug!("right-hand side keyed by node");
        let mut table: HashMap<N, Terms> = HashMap::with_capacity(entries.len());
        for (key, terms) in entries {
            if let RhsKey::Node(node) = key {
                if table.contains_key(&node) {
                    return Err(NetworkError::ContractViolation(format!(
                        "node {} has more than one right-hand side",
                        describe(&node)
                    )));
                }
                table.insert(node, terms);
            }
        }

        let mut rows = Vec::with_capacity(graph.node_count());
        for node in graph.nodes() {
            let terms = table.remove(node).ok_or_else(|| {
                NetworkError::ContractViolation(format!(
                    "no right-hand side for node {}",
                    describe(node)
                ))
            })?;
            if terms.len() != vars.len() {
                return Err(NetworkError::ContractViolation(format!(
                    "right-hand side of node {} has {} entries, expected {}",
                    describe(node),
                    terms.len(),
                    vars.len()
                )));
            }
            rows.push(terms);
        }
        return Ok((Layout::ByNode, rows));
    }

    if by_var {
        debug!("right-hand side keyed by variable");
        let mut table: HashMap<String, Terms> = HashMap::with_capacity(entries.len());
        for (key, terms) in entries {
            if let RhsKey::Var(var) = key {
                if table.contains_key(&var) {
                    return Err(NetworkError::ContractViolation(format!(
                        "variable {var} has more than one right-hand side"
                    )));
                }
                table.insert(var, terms);
            }
        }

        let mut rows = Vec::with_capacity(vars.len());
        for var in vars {
            let terms = table.remove(var).ok_or_else(|| {
                NetworkError::ContractViolation(format!("no right-hand side for variable {var}"))
            })?;
            if terms.len() != graph.node_count() {
                return Err(NetworkError::ContractViolation(format!(
                    "right-hand side of variable {var} has {} entries, expected {}",
                    terms.len(),
                    graph.node_count()
                )));
            }
            rows.push(terms);
        }
        return Ok((Layout::ByVariable, rows));
    }

    Err(NetworkError::ContractViolation(
        "right-hand side keys must be all nodes of the graph or all declared variables"
            .to_string(),
    ))
}

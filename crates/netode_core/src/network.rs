//! A graph carrying lazily assembled ODE dynamics.
//!
//! Every tracked container of the graph reports to one [`DynamicsCache`].
//! Any mutation marks the cache dirty; the next read of the compiled system
//! reassembles it from the protocol.

use crate::assembly::{assemble, Assembled, Layout};
use crate::config::{IntegrateOptions, Integrator, NetworkConfig, ParamScope, Schema, TIME};
use crate::equation_engine::NativeSystem;
use crate::error::{NetworkError, Result};
use crate::graph::{describe, EdgeKind, Graph, NodeId};
use crate::protocol::{Context, Protocol, ProtocolKind, Rules};
use crate::solvers::{self, Horizon, Trajectory};
use crate::store::{AttrMap, AttrValue, Observer};
use crate::symbolic::{Expr, Symbol};
use crate::system::{EquationSystem, OdeCallbacks};
use crate::views::VarView;
use anyhow::Context as _;
use nalgebra::DMatrix;
use nalgebra_sparse::CsrMatrix;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

/// Dirty flag shared by the network and its graph containers.
#[derive(Debug)]
struct DynamicsCache {
    dirty: Cell<bool>,
    expirations: Cell<u64>,
}

impl DynamicsCache {
    fn new() -> Self {
        Self {
            dirty: Cell::new(true),
            expirations: Cell::new(0),
        }
    }
}

impl Observer for DynamicsCache {
    fn expire_dynamics(&self) {
        self.dirty.set(true);
        self.expirations.set(self.expirations.get() + 1);
        trace!(expirations = self.expirations.get(), "dynamics expired");
    }
}

struct Compiled {
    assembled: Assembled,
    reference: EquationSystem,
    native: Option<NativeSystem>,
}

impl Compiled {
    fn callbacks(&self) -> &dyn OdeCallbacks {
        match &self.native {
            Some(native) => native,
            None => &self.reference,
        }
    }

    fn checked(&self, len: usize) -> Result<&dyn OdeCallbacks> {
        let expected = self.reference.dependencies().len();
        if len != expected {
            return Err(NetworkError::DimensionMismatch { expected, got: len });
        }
        Ok(self.callbacks())
    }
}

/// Builder combining a configuration with a protocol.
pub struct NetworkSpec<N, D> {
    config: NetworkConfig,
    protocol: Protocol<N, D>,
}

impl<N: NodeId, D: EdgeKind> NetworkSpec<N, D> {
    pub fn new(protocol: impl Into<Protocol<N, D>>) -> Self {
        Self {
            config: NetworkConfig::default(),
            protocol: protocol.into(),
        }
    }

    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.with_vars(vars);
        self
    }

    pub fn node_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.with_node_params(params);
        self
    }

    pub fn edge_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.with_edge_params(params);
        self
    }

    pub fn graph_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.with_graph_params(params);
        self
    }

    pub fn integrator(mut self, integrator: Integrator) -> Self {
        self.config = self.config.with_integrator(integrator);
        self
    }

    pub fn use_native(mut self, use_native: bool) -> Self {
        self.config = self.config.with_native(use_native);
        self
    }

    /// Validates the declarations and the protocol and creates an empty network.
    pub fn build(self) -> Result<Network<N, D>> {
        Network::new(self.config, self.protocol)
    }
}

/// A graph with symbolic node dynamics and a lazily compiled ODE system.
pub struct Network<N, D> {
    graph: Graph<N, D>,
    cache: Rc<DynamicsCache>,
    compiled: Option<Compiled>,
    rules: Rules<N, D>,
    schema: Schema,
    config: NetworkConfig,
    rebuilds: u64,
}

impl<N: NodeId, D: EdgeKind> fmt::Debug for Network<N, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("protocol", &self.rules.kind())
            .field("config", &self.config)
            .field("dirty", &self.cache.dirty.get())
            .field("graph", &self.graph)
            .finish()
    }
}

impl<N: NodeId, D: EdgeKind> Network<N, D> {
    pub fn new(config: NetworkConfig, protocol: Protocol<N, D>) -> Result<Self> {
        let schema = Schema::new(&config)?;
        let rules = protocol.validate()?;
        let cache = Rc::new(DynamicsCache::new());
        let observer: Rc<dyn Observer> = cache.clone();
        debug!(
            protocol = %rules.kind(),
            directed = D::DIRECTED,
            vars = ?schema.vars(),
            "network created"
        );
        Ok(Self {
            graph: Graph::new(observer),
            cache,
            compiled: None,
            rules,
            schema,
            config,
            rebuilds: 0,
        })
    }

    // --- declarations ---

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn protocol_kind(&self) -> ProtocolKind {
        self.rules.kind()
    }

    pub fn vars(&self) -> &[String] {
        self.schema.vars()
    }

    /// Placeholders of the declared variable `name`.
    pub fn var(&self, name: &str) -> Result<VarView<'_, N, D>> {
        self.context().var(name)
    }

    pub fn t(&self) -> Expr {
        Expr::symbol(TIME)
    }

    /// The view protocol hooks receive, for inspecting the current graph.
    pub fn context(&self) -> Context<'_, N, D> {
        Context::new(&self.graph, &self.schema)
    }

    // --- graph ---

    pub fn graph(&self) -> &Graph<N, D> {
        &self.graph
    }

    /// Mutable access to the graph. Every change still expires the dynamics.
    pub fn graph_mut(&mut self) -> &mut Graph<N, D> {
        &mut self.graph
    }

    pub fn is_directed(&self) -> bool {
        D::DIRECTED
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> + '_ {
        self.graph.nodes()
    }

    pub fn index(&self, node: &N) -> Result<usize> {
        self.graph.index(node)
    }

    pub fn add_node<I>(&mut self, node: N, attrs: I)
    where
        I: IntoIterator<Item = (String, AttrValue)>,
    {
        self.graph.add_node(node, attrs);
    }

    pub fn add_nodes_from<I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = N>,
    {
        self.graph.add_nodes_from(nodes);
    }

    pub fn remove_node(&mut self, node: &N) -> Result<()> {
        self.graph.remove_node(node)
    }

    pub fn add_edge<I>(&mut self, u: N, v: N, attrs: I)
    where
        I: IntoIterator<Item = (String, AttrValue)>,
    {
        self.graph.add_edge(u, v, attrs);
    }

    pub fn add_edges_from<I>(&mut self, edges: I)
    where
        I: IntoIterator<Item = (N, N)>,
    {
        self.graph.add_edges_from(edges);
    }

    pub fn remove_edge(&mut self, u: &N, v: &N) -> Result<()> {
        self.graph.remove_edge(u, v)
    }

    pub fn clear(&mut self) {
        self.graph.clear();
    }

    pub fn node_attrs_mut(&mut self, node: &N) -> Result<&mut AttrMap> {
        self.graph.node_attrs_mut(node)
    }

    pub fn edge_attrs_mut(&mut self, u: &N, v: &N) -> Result<&mut AttrMap> {
        self.graph.edge_attrs_mut(u, v)
    }

    pub fn graph_attrs_mut(&mut self) -> &mut AttrMap {
        self.graph.graph_attrs_mut()
    }

    /// Sets the declared node parameter `name` on `node`.
    pub fn set_node_param(
        &mut self,
        node: &N,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> Result<()> {
        self.require(ParamScope::Node, name)?;
        self.graph.node_attrs_mut(node)?.set(name, value);
        Ok(())
    }

    pub fn set_edge_param(
        &mut self,
        u: &N,
        v: &N,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> Result<()> {
        self.require(ParamScope::Edge, name)?;
        self.graph.edge_attrs_mut(u, v)?.set(name, value);
        Ok(())
    }

    pub fn set_graph_param(&mut self, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        self.require(ParamScope::Graph, name)?;
        self.graph.graph_attrs_mut().set(name, value);
        Ok(())
    }

    fn require(&self, scope: ParamScope, name: &str) -> Result<()> {
        if self.schema.is_declared(scope, name) {
            Ok(())
        } else {
            Err(NetworkError::UnknownParameter(format!(
                "{scope} parameter {name}"
            )))
        }
    }

    /// Reports the first declared parameter that is missing or non-numeric.
    pub fn check_params(&self) -> Result<()> {
        let missing = |name: &String, owner: String| NetworkError::MissingParameter {
            name: name.clone(),
            owner,
        };

        for name in self.schema.params(ParamScope::Graph) {
            if self.graph.graph_attrs().get_f64(name).is_none() {
                return Err(missing(name, "the graph".to_string()));
            }
        }
        for node in self.graph.nodes() {
            let attrs = self.graph.node_attrs(node)?;
            for name in self.schema.params(ParamScope::Node) {
                if attrs.get_f64(name).is_none() {
                    return Err(missing(name, format!("node {}", describe(node))));
                }
            }
        }
        for (u, v) in self.graph.edges() {
            let attrs = self.graph.edge_attrs(u, v)?;
            for name in self.schema.params(ParamScope::Edge) {
                if attrs.get_f64(name).is_none() {
                    return Err(missing(
                        name,
                        format!("edge ({}, {})", describe(u), describe(v)),
                    ));
                }
            }
        }
        Ok(())
    }

    // --- dynamics cache ---

    /// True when the compiled system no longer reflects the graph.
    pub fn is_dirty(&self) -> bool {
        self.cache.dirty.get()
    }

    /// Marks the dynamics stale, e.g. after changing state the network
    /// cannot observe.
    pub fn expire_dynamics(&self) {
        self.cache.expire_dynamics();
    }

    /// Number of expiration signals received so far.
    pub fn expirations(&self) -> u64 {
        self.cache.expirations.get()
    }

    /// Number of successful rebuilds so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Reassembles and recompiles the dynamics from the current graph.
    ///
    /// On failure the previous system is discarded and the network stays dirty.
    pub fn rebuild(&mut self) -> Result<()> {
        self.build_dynamics().map(|_| ())
    }

    fn build_dynamics(&mut self) -> Result<&Compiled> {
        self.compiled = None;
        self.cache.dirty.set(true);
        debug!(
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "rebuilding dynamics"
        );

        let ctx = Context::new(&self.graph, &self.schema);
        let assembled = assemble(&self.rules, &ctx)?;
        let reference = EquationSystem::new(
            assembled.dependencies.clone(),
            assembled.expressions.clone(),
            Symbol::new(TIME),
        )?;
        let native = if self.config.use_native {
            Some(NativeSystem::from_reference(&reference)?)
        } else {
            None
        };

        self.cache.dirty.set(false);
        self.rebuilds += 1;
        debug!(
            dependencies = reference.dependencies().len(),
            native = native.is_some(),
            rebuilds = self.rebuilds,
            "dynamics rebuilt"
        );

        Ok(self.compiled.insert(Compiled {
            assembled,
            reference,
            native,
        }))
    }

    fn dynamics(&mut self) -> Result<&Compiled> {
        match self.compiled.take() {
            Some(compiled) if !self.cache.dirty.get() => Ok(self.compiled.insert(compiled)),
            _ => self.build_dynamics(),
        }
    }

    /// The reference (tree-walking) system, rebuilt first if dirty.
    pub fn system(&mut self) -> Result<&EquationSystem> {
        Ok(&self.dynamics()?.reference)
    }

    /// The bytecode system, present only when `use_native` is set.
    pub fn native_system(&mut self) -> Result<Option<&NativeSystem>> {
        Ok(self.dynamics()?.native.as_ref())
    }

    pub fn layout(&mut self) -> Result<Layout> {
        Ok(self.dynamics()?.assembled.layout)
    }

    pub fn dependencies(&mut self) -> Result<&[Symbol]> {
        Ok(&self.dynamics()?.assembled.dependencies)
    }

    pub fn expressions(&mut self) -> Result<&[Expr]> {
        Ok(&self.dynamics()?.assembled.expressions)
    }

    // --- integration facade ---

    /// dy/dt at `(t, y)`.
    pub fn f(&mut self, t: f64, y: &[f64]) -> Result<Vec<f64>> {
        Ok(self.dynamics()?.checked(y.len())?.f_cb(t, y))
    }

    pub fn jacobian(&mut self, t: f64, y: &[f64]) -> Result<DMatrix<f64>> {
        Ok(self.dynamics()?.checked(y.len())?.j_cb(t, y))
    }

    pub fn jacobian_vector_product(&mut self, t: f64, y: &[f64], v: &[f64]) -> Result<Vec<f64>> {
        let system = self.dynamics()?.checked(y.len())?;
        if v.len() != y.len() {
            return Err(NetworkError::DimensionMismatch {
                expected: y.len(),
                got: v.len(),
            });
        }
        Ok(system.jtimes_cb(t, y, v))
    }

    /// Structural nonzero pattern of the Jacobian.
    pub fn jacobian_sparsity(&mut self) -> Result<CsrMatrix<f64>> {
        Ok(self.dynamics()?.reference.jacobian_sparsity())
    }

    /// Integrates the dynamics from `y0` with the configured integrator.
    pub fn integrate(
        &mut self,
        horizon: impl Into<Horizon>,
        y0: &[f64],
        options: &IntegrateOptions,
    ) -> anyhow::Result<Trajectory> {
        let integrator = self.config.integrator;
        let horizon = horizon.into();
        let system = self
            .dynamics()
            .context("Failed to assemble network dynamics.")?
            .callbacks();
        solvers::integrate(system, integrator, &horizon, y0, options)
            .with_context(|| format!("Integration with {integrator} failed."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Directed, Undirected};
    use crate::protocol::{RhsKey, TermHooks, Terms};
    use crate::store::attrs;
    use crate::symbolic::parse;
    use rstest::rstest;

    type Ctx<'a, D> = Context<'a, u32, D>;

    fn assert_equivalent(lhs: &[Expr], rhs: &[Expr]) {
        assert_eq!(lhs.len(), rhs.len());
        for (i, (a, b)) in lhs.iter().zip(rhs).enumerate() {
            assert!(a.equivalent(b), "entry {i}: {a} vs {b}");
        }
    }

    // --- Kuramoto oscillators: x_u' = sin(w_u t) + sum_v A[u, v] sin(x_v - x_u) ---

    fn kuramoto_by_node() -> Protocol<u32, Undirected> {
        Protocol::monolithic(|ctx: &Ctx<'_, Undirected>| {
            let x = ctx.state();
            let w = ctx.node_param("w")?;
            let mut out = Vec::new();
            for u in ctx.nodes() {
                let mut eq = (w.at(u)? * ctx.t()).sin();
                for v in ctx.graph().neighbors(u)? {
                    eq += ctx.a(u, v) * (x.at(v)? - x.at(u)?).sin();
                }
                out.push((RhsKey::Node(*u), Terms::from(eq)));
            }
            Ok(out)
        })
    }

    fn kuramoto_by_var() -> Protocol<u32, Undirected> {
        Protocol::monolithic(|ctx: &Ctx<'_, Undirected>| {
            let x = ctx.state().as_vector();
            let w = ctx.node_param("w")?.as_vector();
            let a = ctx.graph().adjacency_matrix();
            let rhs: Terms = (0..x.len())
                .map(|i| {
                    let coupling: Expr = (0..x.len())
                        .map(|j| a[(i, j)] * (&x[j] - &x[i]).sin())
                        .sum();
                    (&w[i] * ctx.t()).sin() + coupling
                })
                .collect();
            Ok(vec![(RhsKey::var("x"), rhs)])
        })
    }

    fn kuramoto_termwise() -> Protocol<u32, Undirected> {
        TermHooks::new()
            .node_term(|ctx: &Ctx<'_, Undirected>, u: &u32| {
                Ok((ctx.node_param("w")?.at(u)? * ctx.t()).sin().into())
            })
            .source_term(|ctx: &Ctx<'_, Undirected>, u: &u32, v: &u32| {
                let x = ctx.state();
                Ok((ctx.a(u, v) * (x.at(v)? - x.at(u)?).sin()).into())
            })
            .into()
    }

    fn kuramoto(protocol: Protocol<u32, Undirected>) -> Network<u32, Undirected> {
        let mut net = NetworkSpec::new(protocol).node_params(["w"]).build().unwrap();
        net.add_node(0, attrs([("w", 1.0)]));
        net.add_node(1, attrs([("w", 1.5)]));
        net.add_node(2, attrs([("w", 0.5)]));
        net.add_edges_from([(0, 1), (1, 2), (2, 0)]);
        net
    }

    // --- coupled-phase ring without forcing ---

    fn phase_ring() -> Network<u32, Undirected> {
        let hooks = TermHooks::new()
            .node_term(|_: &Ctx<'_, Undirected>, _: &u32| Ok(Expr::zero().into()))
            .source_term(|ctx: &Ctx<'_, Undirected>, u: &u32, v: &u32| {
                let x = ctx.state();
                Ok((ctx.a(u, v) * (x.at(v)? - x.at(u)?).sin()).into())
            });
        let mut net = NetworkSpec::new(hooks).build().unwrap();
        net.add_edges_from([(0, 1), (1, 2), (2, 0)]);
        net
    }

    // --- Lotka-Volterra food web on a directed graph; u -> v means u eats v ---

    fn lv_by_node() -> Protocol<u32, Directed> {
        Protocol::monolithic(|ctx: &Ctx<'_, Directed>| {
            let x = ctx.state();
            let (r, k) = (ctx.node_param("r")?, ctx.node_param("K")?);
            let e = ctx.graph_param("e")?;
            let mut out = Vec::new();
            for u in ctx.nodes() {
                let xu = x.at(u)?;
                let mut eq = r.at(u)? * &xu * (1.0 - &xu / k.at(u)?);
                for v in ctx.graph().successors(u)? {
                    eq += &e * ctx.a(u, v) * &xu * x.at(v)?;
                }
                for v in ctx.graph().predecessors(u)? {
                    eq -= ctx.a(v, u) * &xu * x.at(v)?;
                }
                out.push((RhsKey::Node(*u), Terms::from(eq)));
            }
            Ok(out)
        })
    }

    fn lv_by_var() -> Protocol<u32, Directed> {
        Protocol::monolithic(|ctx: &Ctx<'_, Directed>| {
            let x = ctx.state().as_vector();
            let r = ctx.node_param("r")?.as_vector();
            let k = ctx.node_param("K")?.as_vector();
            let e = ctx.graph_param("e")?;
            let a = ctx.graph().adjacency_matrix();
            let n = x.len();
            let rhs: Terms = (0..n)
                .map(|i| {
                    let interaction: Expr = (0..n)
                        .map(|j| (&e * a[(i, j)] - a[(j, i)]) * &x[j])
                        .sum();
                    &x[i] * (&r[i] * (1.0 - &x[i] / &k[i]) + interaction)
                })
                .collect();
            Ok(vec![(RhsKey::var("x"), rhs)])
        })
    }

    fn lv_termwise() -> Protocol<u32, Directed> {
        TermHooks::new()
            .node_term(|ctx: &Ctx<'_, Directed>, u: &u32| {
                let x = ctx.state().at(u)?;
                let (r, k) = (ctx.node_param("r")?.at(u)?, ctx.node_param("K")?.at(u)?);
                Ok((r * &x * (1.0 - &x / k)).into())
            })
            .source_term(|ctx: &Ctx<'_, Directed>, u: &u32, v: &u32| {
                let x = ctx.state();
                Ok((ctx.graph_param("e")? * ctx.a(u, v) * x.at(u)? * x.at(v)?).into())
            })
            .target_term(|ctx: &Ctx<'_, Directed>, u: &u32, v: &u32| {
                let x = ctx.state();
                Ok((-(x.at(u)? * x.at(v)?)).into())
            })
            .into()
    }

    fn food_chain(protocol: Protocol<u32, Directed>) -> Network<u32, Directed> {
        let mut net = NetworkSpec::new(protocol)
            .node_params(["r", "K"])
            .graph_params(["e"])
            .build()
            .unwrap();
        net.set_graph_param("e", 0.1).unwrap();
        net.add_node(0, attrs([("r", -0.1), ("K", 100.0)]));
        net.add_node(1, attrs([("r", 1.0), ("K", 10.0)]));
        net.add_node(2, attrs([("r", 1.0), ("K", 10.0)]));
        net.add_edge(0, 1, attrs([("weight", 2.0)]));
        net.add_edge(0, 2, Vec::new());
        net
    }

    // --- SIS epidemic with two variables per node ---

    fn sis_by_node() -> Protocol<u32, Undirected> {
        Protocol::monolithic(|ctx: &Ctx<'_, Undirected>| {
            let (s, i) = (ctx.var("S")?, ctx.var("I")?);
            let (a, b) = (ctx.node_param("a")?, ctx.node_param("b")?);
            let mut out = Vec::new();
            for u in ctx.nodes() {
                let (su, iu) = (s.at(u)?, i.at(u)?);
                let infection = a.at(u)? * &su * &iu / (&su + &iu);
                let recovery = b.at(u)? * &iu;
                let mut ds = -&infection + &recovery;
                let mut di = infection - recovery;
                for v in ctx.graph().neighbors(u)? {
                    ds += ctx.a(u, v) * (s.at(v)? - &su);
                    di += ctx.a(u, v) * (i.at(v)? - &iu);
                }
                out.push((RhsKey::Node(*u), Terms::from([ds, di])));
            }
            Ok(out)
        })
    }

    fn sis_by_var() -> Protocol<u32, Undirected> {
        Protocol::monolithic(|ctx: &Ctx<'_, Undirected>| {
            let s = ctx.var("S")?.as_vector();
            let i = ctx.var("I")?.as_vector();
            let a = ctx.node_param("a")?.as_vector();
            let b = ctx.node_param("b")?.as_vector();
            let adj = ctx.graph().adjacency_matrix();
            let n = s.len();
            // graph Laplacian L = diag(degree) - A
            let laplacian = DMatrix::from_diagonal(&adj.column_sum()) - &adj;
            let diffuse = |y: &[Expr], u: usize| -> Expr {
                (0..n).map(|v| laplacian[(u, v)] * &y[v]).sum()
            };
            let mut ds = Vec::with_capacity(n);
            let mut di = Vec::with_capacity(n);
            for u in 0..n {
                let infection = &a[u] * &s[u] * &i[u] / (&s[u] + &i[u]);
                let recovery = &b[u] * &i[u];
                ds.push(-&infection + &recovery - diffuse(&s, u));
                di.push(infection - recovery - diffuse(&i, u));
            }
            Ok(vec![
                (RhsKey::var("S"), Terms::from(ds)),
                (RhsKey::var("I"), Terms::from(di)),
            ])
        })
    }

    fn sis_termwise() -> Protocol<u32, Undirected> {
        TermHooks::new()
            .node_term(|ctx: &Ctx<'_, Undirected>, u: &u32| {
                let (s, i) = (ctx.var("S")?.at(u)?, ctx.var("I")?.at(u)?);
                let (a, b) = (ctx.node_param("a")?.at(u)?, ctx.node_param("b")?.at(u)?);
                let degree: f64 = ctx
                    .graph()
                    .neighbors(u)?
                    .map(|v| ctx.graph().weight(u, v))
                    .sum();
                let infection = a * &s * &i / (&s + &i);
                let recovery = b * &i;
                Ok(Terms::from([
                    -&infection + &recovery - degree * &s,
                    infection - recovery - degree * &i,
                ]))
            })
            .source_term(|ctx: &Ctx<'_, Undirected>, u: &u32, v: &u32| {
                let w = ctx.a(u, v);
                Ok(Terms::from([
                    &w * ctx.var("S")?.at(v)?,
                    &w * ctx.var("I")?.at(v)?,
                ]))
            })
            .into()
    }

    fn sis(protocol: Protocol<u32, Undirected>) -> Network<u32, Undirected> {
        let mut net = NetworkSpec::new(protocol)
            .vars(["S", "I"])
            .node_params(["a", "b"])
            .build()
            .unwrap();
        net.add_node(0, attrs([("a", 0.3), ("b", 0.1)]));
        net.add_node(1, attrs([("a", 0.2), ("b", 0.05)]));
        net.add_node(2, attrs([("a", 0.4), ("b", 0.2)]));
        net.add_edge(0, 1, attrs([("weight", 0.5)]));
        net.add_edge(1, 2, Vec::new());
        net
    }

    // --- linear decay x' = -k x ---

    fn decay(use_native: bool) -> Network<u32, Undirected> {
        let hooks = TermHooks::new()
            .node_term(|ctx: &Ctx<'_, Undirected>, u: &u32| {
                Ok((-ctx.node_param("k")?.at(u)? * ctx.state().at(u)?).into())
            })
            .source_term(|_: &Ctx<'_, Undirected>, _: &u32, _: &u32| Ok(Terms::zeros(1)));
        let mut net = NetworkSpec::new(hooks)
            .node_params(["k"])
            .integrator(Integrator::Rk4)
            .use_native(use_native)
            .build()
            .unwrap();
        net.add_node(0, attrs([("k", 1.0)]));
        net.add_node(1, attrs([("k", 2.0)]));
        net
    }

    #[test]
    fn ring_coupling_scenario() {
        let mut net = phase_ring();
        let expected = parse("sin(x_1 - x_0) + sin(x_2 - x_0)").unwrap();
        assert!(net.expressions().unwrap()[0].equivalent(&expected));
        assert_eq!(
            net.dependencies().unwrap(),
            &[Symbol::new("x_0"), Symbol::new("x_1"), Symbol::new("x_2")]
        );
    }

    #[test]
    fn kuramoto_protocols_agree() {
        let reference = kuramoto(kuramoto_by_node()).expressions().unwrap().to_vec();
        for protocol in [kuramoto_by_var(), kuramoto_termwise()] {
            let mut net = kuramoto(protocol);
            assert_equivalent(net.expressions().unwrap(), &reference);
        }
        let expected = parse("sin(1.5*t) + sin(x_0 - x_1) + sin(x_2 - x_1)").unwrap();
        assert!(reference[1].equivalent(&expected));
    }

    #[test]
    fn food_chain_scenario() {
        let mut net = food_chain(lv_termwise());
        let exprs = net.expressions().unwrap().to_vec();

        let predator = parse("-0.1*x_0*(1 - x_0/100) + 0.1*2*x_0*x_1 + 0.1*x_0*x_2").unwrap();
        let prey = parse("x_1*(1 - x_1/10) - 2*x_0*x_1").unwrap();
        let other_prey = parse("x_2*(1 - x_2/10) - x_0*x_2").unwrap();
        assert_equivalent(&exprs, &[predator, prey, other_prey]);
    }

    #[test]
    fn food_chain_protocols_agree() {
        let reference = food_chain(lv_termwise()).expressions().unwrap().to_vec();
        for protocol in [lv_by_node(), lv_by_var()] {
            let mut net = food_chain(protocol);
            assert_equivalent(net.expressions().unwrap(), &reference);
        }
    }

    #[test]
    fn two_variable_protocols_agree() {
        let mut by_node = sis(sis_by_node());
        let mut by_var = sis(sis_by_var());
        let mut termwise = sis(sis_termwise());

        assert_eq!(by_node.layout().unwrap(), Layout::ByNode);
        assert_eq!(by_var.layout().unwrap(), Layout::ByVariable);

        // by-variable output is ordered variable-major; compare per dependency
        let reference = by_node.system().unwrap().clone();
        for net in [&mut by_var, &mut termwise] {
            let system = net.system().unwrap();
            for (dep, expr) in reference.dependencies().iter().zip(reference.expressions()) {
                let rhs = system.rhs(dep).unwrap();
                assert!(rhs.equivalent(expr), "d{dep}/dt: {rhs} vs {expr}");
            }
        }
    }

    type FoodChain = Network<u32, Directed>;

    fn expires(net: &mut FoodChain, label: &str, op: impl FnOnce(&mut FoodChain)) {
        net.rebuild().unwrap();
        assert!(!net.is_dirty(), "{label}: clean after rebuild");
        op(net);
        assert!(net.is_dirty(), "{label}: dirty after mutation");
    }

    #[test]
    fn every_mutation_expires_the_dynamics() {
        let mut net = food_chain(lv_termwise());

        expires(&mut net, "add node", |n| n.add_node(3, attrs([("r", 1.0), ("K", 5.0)])));
        expires(&mut net, "add edge", |n| n.add_edge(2, 3, Vec::new()));
        expires(&mut net, "node param", |n| n.set_node_param(&0, "r", 0.99).unwrap());
        expires(&mut net, "node attrs", |n| {
            n.node_attrs_mut(&1).unwrap().set("K", 2.0);
        });
        expires(&mut net, "edge weight", |n| {
            n.edge_attrs_mut(&0, &1).unwrap().set("weight", 0.5);
        });
        expires(&mut net, "graph param", |n| n.set_graph_param("e", 0.15).unwrap());
        expires(&mut net, "nested graph access", |n| {
            n.graph_mut().edge_attrs_mut(&0, &2).unwrap().set("weight", 1.5);
        });
        expires(&mut net, "remove edge", |n| n.remove_edge(&2, &3).unwrap());
        expires(&mut net, "remove node", |n| n.remove_node(&1).unwrap());
        expires(&mut net, "clear", |n| n.clear());
        expires(&mut net, "manual", |n| n.expire_dynamics());
    }

    #[test]
    fn reads_do_not_expire_the_dynamics() {
        let mut net = phase_ring();
        net.rebuild().unwrap();
        let signals = net.expirations();

        let _ = net.f(0.0, &[0.1, 0.2, 0.3]).unwrap();
        let _ = net.graph().edges();
        let _ = net.var("x").unwrap().as_vector();
        let _ = net.check_params();
        let _ = net.graph().adjacency_matrix();

        assert!(!net.is_dirty());
        assert_eq!(net.expirations(), signals);
        assert_eq!(net.rebuild_count(), 1);
    }

    #[test]
    fn mutation_mid_session_is_picked_up() {
        let mut net = decay(false);
        assert_eq!(net.f(0.0, &[1.0, 1.0]).unwrap(), vec![-1.0, -2.0]);

        net.set_node_param(&0, "k", 3.0).unwrap();
        assert!(net.is_dirty());
        let exprs = net.expressions().unwrap();
        assert!(exprs[0].equivalent(&parse("-3*x_0").unwrap()));
        assert_eq!(net.f(0.0, &[1.0, 1.0]).unwrap(), vec![-3.0, -2.0]);
        assert_eq!(net.rebuild_count(), 2);
    }

    #[test]
    fn rebuild_is_lazy_and_idempotent() {
        let mut net = kuramoto(kuramoto_termwise());
        assert!(net.is_dirty());
        assert_eq!(net.rebuild_count(), 0);

        let first = net.expressions().unwrap().to_vec();
        let _ = net.f(0.5, &[0.0, 1.0, 2.0]).unwrap();
        let _ = net.jacobian(0.5, &[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(net.rebuild_count(), 1);

        net.rebuild().unwrap();
        assert_eq!(net.rebuild_count(), 2);
        assert_eq!(net.expressions().unwrap(), first.as_slice());
    }

    #[test]
    fn missing_parameter_leaves_the_cache_dirty() {
        let mut net = decay(false);
        net.add_node(2, Vec::new());

        let err = net.rebuild().unwrap_err();
        assert!(matches!(
            err,
            NetworkError::UndefinedExpression { ref dependency, .. } if dependency == "x_2"
        ));
        assert!(net.is_dirty());
        assert!(net.system().is_err());
        assert_eq!(
            net.check_params(),
            Err(NetworkError::MissingParameter {
                name: "k".to_string(),
                owner: "node 2".to_string(),
            })
        );

        net.set_node_param(&2, "k", 0.5).unwrap();
        assert!(net.check_params().is_ok());
        net.rebuild().unwrap();
        assert!(!net.is_dirty());
        assert_eq!(net.dependencies().unwrap().len(), 3);
    }

    #[test]
    fn failed_rebuild_of_a_clean_network_marks_it_dirty() {
        let fail = Rc::new(Cell::new(false));
        let switch = fail.clone();
        let hooks = TermHooks::new()
            .node_term(move |ctx: &Ctx<'_, Undirected>, u: &u32| {
                if switch.get() {
                    return Err(NetworkError::ContractViolation("switched off".to_string()));
                }
                Ok((-ctx.state().at(u)?).into())
            })
            .source_term(|_: &Ctx<'_, Undirected>, _: &u32, _: &u32| Ok(Terms::zeros(1)));
        let mut net = NetworkSpec::new(hooks).build().unwrap();
        net.add_node(0, Vec::new());
        net.rebuild().unwrap();
        assert!(!net.is_dirty());

        fail.set(true);
        assert!(net.rebuild().is_err());
        assert!(net.is_dirty());
        assert!(net.f(0.0, &[1.0]).is_err());

        fail.set(false);
        assert_eq!(net.f(0.0, &[1.0]).unwrap(), vec![-1.0]);
        assert!(!net.is_dirty());
    }

    #[test]
    fn removing_a_middle_node_reindexes_placeholders() {
        let mut net = phase_ring();
        net.add_edge(2, 3, Vec::new());
        net.rebuild().unwrap();
        assert_eq!(net.dependencies().unwrap().len(), 4);

        // remaining nodes 0, 2, 3 become x_0, x_1, x_2
        net.remove_node(&1).unwrap();
        assert_eq!(
            net.dependencies().unwrap(),
            &[Symbol::new("x_0"), Symbol::new("x_1"), Symbol::new("x_2")]
        );
        let expected = [
            parse("sin(x_1 - x_0)").unwrap(),
            parse("sin(x_0 - x_1) + sin(x_2 - x_1)").unwrap(),
            parse("sin(x_1 - x_2)").unwrap(),
        ];
        assert_equivalent(net.expressions().unwrap(), &expected);

        let y = [0.0, 0.5, 1.5];
        let dy = net.f(0.0, &y).unwrap();
        let analytic = [
            0.5f64.sin(),
            (-0.5f64).sin() + 1.0f64.sin(),
            (-1.0f64).sin(),
        ];
        for (got, want) in dy.iter().zip(analytic) {
            assert!((got - want).abs() < 1e-12, "{got} vs {want}");
        }
    }

    #[test]
    fn contract_violations_surface_at_rebuild() {
        let bad = Protocol::monolithic(|_: &Ctx<'_, Undirected>| {
            Ok(vec![(RhsKey::var("y"), Terms::zeros(1))])
        });
        let mut net = NetworkSpec::new(bad).build().unwrap();
        net.add_node(0, Vec::new());
        assert!(matches!(
            net.f(0.0, &[0.0]),
            Err(NetworkError::ContractViolation(_))
        ));
        assert!(net.is_dirty());
    }

    #[test]
    fn missing_hooks_fail_at_construction() {
        let hooks = TermHooks::<u32, Directed>::new()
            .node_term(|_: &Ctx<'_, Directed>, _: &u32| Ok(Terms::zeros(1)))
            .source_term(|_: &Ctx<'_, Directed>, _: &u32, _: &u32| Ok(Terms::zeros(1)));
        let err = NetworkSpec::new(hooks).build().unwrap_err();
        assert_eq!(
            err,
            NetworkError::MissingTermImplementation {
                hook: "target_term",
                protocol: ProtocolKind::TermwiseDirected,
            }
        );
    }

    #[rstest]
    #[case::param_shadows_var(NetworkConfig::default().with_node_params(["x"]))]
    #[case::time(NetworkConfig::default().with_vars(["t"]))]
    fn bad_declarations_fail_at_construction(#[case] config: NetworkConfig) {
        let err = NetworkSpec::new(kuramoto_termwise())
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, NetworkError::Definition(_)));
    }

    #[test]
    fn undeclared_parameters_are_rejected() {
        let mut net = decay(false);
        assert!(matches!(
            net.set_node_param(&0, "r", 1.0),
            Err(NetworkError::UnknownParameter(_))
        ));
        assert!(matches!(
            net.set_graph_param("k", 1.0),
            Err(NetworkError::UnknownParameter(_))
        ));
    }

    #[test]
    fn jacobian_matches_analytic_derivatives() {
        let mut net = phase_ring();
        let y = [0.1, 0.7, -0.4];
        let jac = net.jacobian(0.0, &y).unwrap();

        // d/dx_j sin(x_j - x_i) = cos(x_j - x_i)
        for i in 0..3 {
            let mut diagonal = 0.0;
            for j in 0..3 {
                if i == j {
                    continue;
                }
                let c = (y[j] - y[i]).cos();
                assert!((jac[(i, j)] - c).abs() < 1e-12);
                diagonal -= c;
            }
            assert!((jac[(i, i)] - diagonal).abs() < 1e-12);
        }

        let v = [1.0, 0.0, -1.0];
        let jv = net.jacobian_vector_product(0.0, &y, &v).unwrap();
        let expected = &jac * nalgebra::DVector::from_column_slice(&v);
        for i in 0..3 {
            assert!((jv[i] - expected[i]).abs() < 1e-12);
        }

        assert!(matches!(
            net.f(0.0, &[0.0, 0.0]),
            Err(NetworkError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn sparsity_follows_the_topology() {
        let mut net = phase_ring();
        net.add_node(3, Vec::new());
        let pattern = net.jacobian_sparsity().unwrap();
        assert_eq!(pattern.nrows(), 4);
        // full 3x3 block for the ring, nothing for the isolated node
        assert_eq!(pattern.nnz(), 9);
    }

    #[test]
    fn native_and_reference_systems_agree() {
        let mut reference = sis(sis_by_node());
        let mut native = NetworkSpec::new(sis_by_node())
            .config(reference.config().clone().with_native(true))
            .build()
            .unwrap();
        native.add_node(0, attrs([("a", 0.3), ("b", 0.1)]));
        native.add_node(1, attrs([("a", 0.2), ("b", 0.05)]));
        native.add_node(2, attrs([("a", 0.4), ("b", 0.2)]));
        native.add_edge(0, 1, attrs([("weight", 0.5)]));
        native.add_edge(1, 2, Vec::new());

        assert!(reference.native_system().unwrap().is_none());
        assert!(native.native_system().unwrap().is_some());

        let y = [0.9, 0.1, 0.8, 0.2, 0.95, 0.05];
        let (fa, fb) = (reference.f(0.0, &y).unwrap(), native.f(0.0, &y).unwrap());
        for (a, b) in fa.iter().zip(&fb) {
            assert!((a - b).abs() < 1e-13);
        }
        let ja = reference.jacobian(0.0, &y).unwrap();
        let jb = native.jacobian(0.0, &y).unwrap();
        assert!((ja - jb).abs().max() < 1e-13);
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn linear_decay_integrates_to_exponential(#[case] use_native: bool) {
        let mut net = decay(use_native);
        let options = IntegrateOptions {
            dt: 1e-2,
            ..Default::default()
        };
        let traj = net.integrate(1.0, &[1.0, 1.0], &options).unwrap();
        let y = traj.final_state().unwrap();
        assert!((y[0] - (-1.0f64).exp()).abs() < 1e-8);
        assert!((y[1] - (-2.0f64).exp()).abs() < 1e-8);
    }

    #[test]
    fn integration_reports_assembly_failures() {
        let mut net = decay(false);
        net.add_node(2, Vec::new());
        let err = net
            .integrate(1.0, &[1.0, 1.0, 1.0], &IntegrateOptions::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetworkError>(),
            Some(NetworkError::UndefinedExpression { .. })
        ));
    }

    #[test]
    fn synchronised_ring_stays_synchronised() {
        let mut net = phase_ring();
        let traj = net
            .integrate(
                vec![0.0, 1.0, 2.0],
                &[0.3, 0.3, 0.3],
                &IntegrateOptions::default(),
            )
            .unwrap();
        assert_eq!(traj.len(), 3);
        for y in &traj.yout {
            assert!(y.iter().all(|v| (v - 0.3).abs() < 1e-12));
        }
    }

    #[test]
    fn network_from_json_config() {
        let json = r#"{
            "integrator": "euler",
            "use_native": true,
            "vars": ["S", "I"],
            "node_params": ["a", "b"]
        }"#;
        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        let mut net = NetworkSpec::new(sis_termwise()).config(config).build().unwrap();
        net.add_node(0, attrs([("a", 0.5), ("b", 0.25)]));

        assert_eq!(net.config().integrator, Integrator::Euler);
        assert_eq!(net.vars(), ["S", "I"]);
        assert_eq!(net.f(0.0, &[0.5, 0.5]).unwrap(), vec![0.0, 0.0]);
        assert!(net.native_system().unwrap().is_some());
    }
}

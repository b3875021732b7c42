//! Graph model built on the tracked attribute store.
//!
//! Directedness is part of the type (`Graph<N, Directed>` vs
//! `Graph<N, Undirected>`). All containers report to the same observer, so
//! every structural or attribute change expires the owner's dynamics.

use crate::error::{NetworkError, Result};
use crate::store::{AttrMap, AttrValue, Observer, TrackedMap};
use nalgebra::DMatrix;
use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;

/// Requirements on a node identity.
pub trait NodeId: Clone + Eq + Hash + Debug + 'static {}

impl<T: Clone + Eq + Hash + Debug + 'static> NodeId for T {}

/// Static edge direction of a graph type.
pub trait EdgeKind: Debug + Default + 'static {
    const DIRECTED: bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Directed;

#[derive(Debug, Clone, Copy, Default)]
pub struct Undirected;

impl EdgeKind for Directed {
    const DIRECTED: bool = true;
}

impl EdgeKind for Undirected {
    const DIRECTED: bool = false;
}

type EdgeIx = u64;

/// Node table, adjacency and edge attributes.
///
/// Undirected edges are stored once in the edge table and referenced from
/// both endpoints, so both orientations see the same attribute map.
#[derive(Debug)]
pub struct Graph<N, D> {
    nodes: TrackedMap<N, AttrMap>,
    succ: TrackedMap<N, TrackedMap<N, EdgeIx>>,
    // only populated for directed graphs
    pred: TrackedMap<N, TrackedMap<N, EdgeIx>>,
    edges: TrackedMap<EdgeIx, AttrMap>,
    attrs: AttrMap,
    next_edge: EdgeIx,
    kind: PhantomData<D>,
}

pub(crate) fn describe<N: Debug>(node: &N) -> String {
    format!("{node:?}")
}

fn describe_edge<N: Debug>(u: &N, v: &N) -> String {
    format!("({u:?}, {v:?})")
}

impl<N: NodeId, D: EdgeKind> Graph<N, D> {
    pub fn new(observer: Rc<dyn Observer>) -> Self {
        Self {
            nodes: TrackedMap::new(Rc::clone(&observer)),
            succ: TrackedMap::new(Rc::clone(&observer)),
            pred: TrackedMap::new(Rc::clone(&observer)),
            edges: TrackedMap::new(Rc::clone(&observer)),
            attrs: AttrMap::new(observer),
            next_edge: 0,
            kind: PhantomData,
        }
    }

    pub fn is_directed(&self) -> bool {
        D::DIRECTED
    }

    // --- nodes ---

    fn ensure_node(&mut self, node: &N) -> &mut AttrMap {
        if !self.succ.contains_key(node) {
            let observer = self.succ.observer();
            self.succ
                .get_or_insert_with(node.clone(), || TrackedMap::new(observer));
            if D::DIRECTED {
                let observer = self.pred.observer();
                self.pred
                    .get_or_insert_with(node.clone(), || TrackedMap::new(observer));
            }
        }
        let observer = self.nodes.observer();
        self.nodes
            .get_or_insert_with(node.clone(), || AttrMap::new(observer))
    }

    /// Adds `node`, or updates its attributes if it already exists.
    pub fn add_node<I>(&mut self, node: N, attrs: I)
    where
        I: IntoIterator<Item = (String, AttrValue)>,
    {
        self.ensure_node(&node).extend(attrs);
    }

    pub fn add_nodes_from<I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = N>,
    {
        for node in nodes {
            self.ensure_node(&node);
        }
    }

    /// Removes `node` together with every incident edge.
    pub fn remove_node(&mut self, node: &N) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(NetworkError::UnknownNode(describe(node)));
        }

        let outgoing: Vec<(N, EdgeIx)> = self
            .succ
            .get(node)
            .map(|nbrs| nbrs.iter().map(|(v, ix)| (v.clone(), *ix)).collect())
            .unwrap_or_default();
        for (v, ix) in outgoing {
            self.edges.remove(&ix);
            let reverse = if D::DIRECTED { &mut self.pred } else { &mut self.succ };
            if let Some(nbrs) = reverse.get_mut(&v) {
                nbrs.remove(node);
            }
        }

        if D::DIRECTED {
            let incoming: Vec<(N, EdgeIx)> = self
                .pred
                .get(node)
                .map(|nbrs| nbrs.iter().map(|(u, ix)| (u.clone(), *ix)).collect())
                .unwrap_or_default();
            for (u, ix) in incoming {
                self.edges.remove(&ix);
                if let Some(nbrs) = self.succ.get_mut(&u) {
                    nbrs.remove(node);
                }
            }
            self.pred.remove(node);
        }

        self.succ.remove(node);
        self.nodes.remove(node);
        Ok(())
    }

    pub fn has_node(&self, node: &N) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes in iteration order.
    pub fn nodes(&self) -> impl Iterator<Item = &N> + '_ {
        self.nodes.keys()
    }

    /// Position of `node` in the current iteration order. Not stable across
    /// removals.
    pub fn index(&self, node: &N) -> Result<usize> {
        self.nodes
            .index_of(node)
            .ok_or_else(|| NetworkError::UnknownNode(describe(node)))
    }

    pub fn node_at(&self, index: usize) -> Option<&N> {
        self.nodes.get_index(index).map(|(node, _)| node)
    }

    pub fn node_attrs(&self, node: &N) -> Result<&AttrMap> {
        self.nodes
            .get(node)
            .ok_or_else(|| NetworkError::UnknownNode(describe(node)))
    }

    pub fn node_attrs_mut(&mut self, node: &N) -> Result<&mut AttrMap> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| NetworkError::UnknownNode(describe(node)))
    }

    // --- edges ---

    fn edge_ix(&self, u: &N, v: &N) -> Option<EdgeIx> {
        self.succ.get(u).and_then(|nbrs| nbrs.get(v)).copied()
    }

    /// Adds the edge `u -> v` (or `u -- v`), creating missing endpoints.
    /// Existing edges have their attributes updated.
    pub fn add_edge<I>(&mut self, u: N, v: N, attrs: I)
    where
        I: IntoIterator<Item = (String, AttrValue)>,
    {
        if let Some(ix) = self.edge_ix(&u, &v) {
            if let Some(edge) = self.edges.get_mut(&ix) {
                edge.extend(attrs);
            }
            return;
        }

        self.ensure_node(&u);
        self.ensure_node(&v);

        let ix = self.next_edge;
        self.next_edge += 1;

        let mut edge = AttrMap::new(self.edges.observer());
        edge.extend(attrs);
        self.edges.insert(ix, edge);

        if let Some(nbrs) = self.succ.get_mut(&u) {
            nbrs.insert(v.clone(), ix);
        }
        let reverse = if D::DIRECTED { &mut self.pred } else { &mut self.succ };
        if let Some(nbrs) = reverse.get_mut(&v) {
            nbrs.insert(u, ix);
        }
    }

    pub fn add_edges_from<I>(&mut self, edges: I)
    where
        I: IntoIterator<Item = (N, N)>,
    {
        for (u, v) in edges {
            self.add_edge(u, v, Vec::new());
        }
    }

    pub fn remove_edge(&mut self, u: &N, v: &N) -> Result<()> {
        let ix = self
            .edge_ix(u, v)
            .ok_or_else(|| NetworkError::UnknownEdge(describe_edge(u, v)))?;

        if let Some(nbrs) = self.succ.get_mut(u) {
            nbrs.remove(v);
        }
        let reverse = if D::DIRECTED { &mut self.pred } else { &mut self.succ };
        if let Some(nbrs) = reverse.get_mut(v) {
            nbrs.remove(u);
        }
        self.edges.remove(&ix);
        Ok(())
    }

    pub fn has_edge(&self, u: &N, v: &N) -> bool {
        self.edge_ix(u, v).is_some()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Every edge once, in node order then neighbour order.
    pub fn edges(&self) -> Vec<(&N, &N)> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.edges.len());
        for (u, nbrs) in self.succ.iter() {
            for (v, ix) in nbrs.iter() {
                if seen.insert(*ix) {
                    out.push((u, v));
                }
            }
        }
        out
    }

    pub fn edge_attrs(&self, u: &N, v: &N) -> Result<&AttrMap> {
        self.edge_ix(u, v)
            .and_then(|ix| self.edges.get(&ix))
            .ok_or_else(|| NetworkError::UnknownEdge(describe_edge(u, v)))
    }

    pub fn edge_attrs_mut(&mut self, u: &N, v: &N) -> Result<&mut AttrMap> {
        let ix = self
            .edge_ix(u, v)
            .ok_or_else(|| NetworkError::UnknownEdge(describe_edge(u, v)))?;
        self.edges
            .get_mut(&ix)
            .ok_or_else(|| NetworkError::UnknownEdge(describe_edge(u, v)))
    }

    // --- adjacency ---

    /// Neighbours of `node`. For directed graphs these are the successors.
    pub fn neighbors(&self, node: &N) -> Result<impl Iterator<Item = &N> + '_> {
        self.successors(node)
    }

    pub fn successors(&self, node: &N) -> Result<impl Iterator<Item = &N> + '_> {
        self.succ
            .get(node)
            .map(|nbrs| nbrs.keys())
            .ok_or_else(|| NetworkError::UnknownNode(describe(node)))
    }

    /// Predecessors of `node`. For undirected graphs these are the neighbours.
    pub fn predecessors(&self, node: &N) -> Result<impl Iterator<Item = &N> + '_> {
        let table = if D::DIRECTED { &self.pred } else { &self.succ };
        table
            .get(node)
            .map(|nbrs| nbrs.keys())
            .ok_or_else(|| NetworkError::UnknownNode(describe(node)))
    }

    /// Weighted adjacency `A[u, v]`: the edge's `weight`, 1.0 when the edge
    /// has no numeric weight and 0.0 when there is no edge.
    pub fn weight(&self, u: &N, v: &N) -> f64 {
        match self.edge_ix(u, v) {
            None => 0.0,
            Some(ix) => self
                .edges
                .get(&ix)
                .and_then(|edge| edge.get_f64("weight"))
                .unwrap_or(1.0),
        }
    }

    /// Dense weighted adjacency matrix in node index order.
    pub fn adjacency_matrix(&self) -> DMatrix<f64> {
        let n = self.nodes.len();
        let mut matrix = DMatrix::zeros(n, n);
        for (i, (u, nbrs)) in self.succ.iter().enumerate() {
            for v in nbrs.keys() {
                if let Some(j) = self.nodes.index_of(v) {
                    matrix[(i, j)] = self.weight(u, v);
                }
            }
        }
        matrix
    }

    // --- graph attributes ---

    pub fn graph_attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn graph_attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }

    /// Removes all nodes, edges and graph attributes.
    pub fn clear(&mut self) {
        self.edges.clear();
        self.pred.clear();
        self.succ.clear();
        self.nodes.clear();
        self.attrs.clear();
    }
}

impl fmt::Display for Directed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("directed")
    }
}

impl fmt::Display for Undirected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("undirected")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::attrs;
    use crate::store::tests::CountingObserver;

    fn graph<N: NodeId, D: EdgeKind>() -> (Rc<CountingObserver>, Graph<N, D>) {
        let observer = Rc::new(CountingObserver::default());
        let graph = Graph::new(observer.clone());
        (observer, graph)
    }

    #[test]
    fn undirected_edges_are_symmetric() {
        let (_, mut g) = graph::<u32, Undirected>();
        g.add_edge(0, 1, attrs([("weight", 2.0)]));
        g.add_edge(1, 2, Vec::new());

        assert!(g.has_edge(&1, &0));
        assert_eq!(g.weight(&1, &0), 2.0);
        assert_eq!(g.weight(&2, &1), 1.0);
        assert_eq!(g.weight(&0, &2), 0.0);
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.edges().len(), 2);

        let nbrs: Vec<u32> = g.neighbors(&1).unwrap().copied().collect();
        assert_eq!(nbrs, vec![0, 2]);
        let preds: Vec<u32> = g.predecessors(&1).unwrap().copied().collect();
        assert_eq!(preds, nbrs);
    }

    #[test]
    fn directed_successors_and_predecessors_are_distinct() {
        let (_, mut g) = graph::<u32, Directed>();
        g.add_edge(0, 1, attrs([("weight", 0.5)]));
        g.add_edge(2, 1, Vec::new());

        assert!(g.has_edge(&0, &1));
        assert!(!g.has_edge(&1, &0));
        assert_eq!(g.weight(&0, &1), 0.5);
        assert_eq!(g.weight(&1, &0), 0.0);

        let preds: Vec<u32> = g.predecessors(&1).unwrap().copied().collect();
        assert_eq!(preds, vec![0, 2]);
        assert_eq!(g.successors(&1).unwrap().count(), 0);
    }

    #[test]
    fn removing_a_node_drops_incident_edges_and_shifts_indices() {
        let (_, mut g) = graph::<u32, Directed>();
        g.add_edges_from([(0, 1), (1, 2), (2, 0)]);
        g.remove_node(&1).unwrap();

        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 1);
        assert!(g.has_edge(&2, &0));
        assert_eq!(g.predecessors(&2).unwrap().count(), 0);
        assert_eq!(g.index(&2).unwrap(), 1);
        assert!(matches!(g.index(&1), Err(NetworkError::UnknownNode(_))));
        assert!(matches!(g.remove_node(&1), Err(NetworkError::UnknownNode(_))));
    }

    #[test]
    fn add_node_updates_existing_attributes() {
        let (_, mut g) = graph::<u32, Undirected>();
        g.add_node(0, attrs([("w", 1.0)]));
        g.add_node(0, attrs([("w", 2.0), ("k", 3.0)]));
        assert_eq!(g.node_count(), 1);
        let node = g.node_attrs(&0).unwrap();
        assert_eq!(node.get_f64("w"), Some(2.0));
        assert_eq!(node.get_f64("k"), Some(3.0));
    }

    #[test]
    fn every_mutation_reaches_the_observer() {
        let (observer, mut g) = graph::<u32, Undirected>();
        let mut last = observer.signals.get();
        let mut check = |label: &str| {
            let now = observer.signals.get();
            assert!(now > last, "{label} did not signal");
            last = now;
        };

        g.add_node(0, Vec::new());
        check("add_node");
        g.add_edge(0, 1, Vec::new());
        check("add_edge");
        g.edge_attrs_mut(&1, &0).unwrap().set("weight", 4.0);
        check("edge attribute");
        g.node_attrs_mut(&1).unwrap().set("w", 1.0);
        check("node attribute");
        g.graph_attrs_mut().set("k", 1.0);
        check("graph attribute");
        g.remove_edge(&0, &1).unwrap();
        check("remove_edge");
        g.remove_node(&1).unwrap();
        check("remove_node");
        g.clear();
        check("clear");
    }

    #[test]
    fn reads_leave_the_observer_alone() {
        let (observer, mut g) = graph::<u32, Directed>();
        g.add_edge(0, 1, attrs([("weight", 3.0)]));
        let before = observer.signals.get();

        let _ = g.weight(&0, &1);
        let _ = g.adjacency_matrix();
        let _ = g.edges();
        let _ = g.index(&1);
        let _ = g.successors(&0).unwrap().count();
        let _ = g.edge_attrs(&0, &1).unwrap().get_f64("weight");

        assert_eq!(observer.signals.get(), before);
    }

    #[test]
    fn adjacency_matrix_follows_node_order() {
        let (_, mut g) = graph::<&str, Directed>();
        g.add_edge("a", "b", attrs([("weight", 2.0)]));
        g.add_edge("b", "c", Vec::new());
        let a = g.adjacency_matrix();
        assert_eq!(a[(0, 1)], 2.0);
        assert_eq!(a[(1, 2)], 1.0);
        assert_eq!(a[(1, 0)], 0.0);
    }

    #[test]
    fn unknown_edge_lookups_fail() {
        let (_, mut g) = graph::<u32, Undirected>();
        g.add_nodes_from([0, 1]);
        assert!(matches!(g.remove_edge(&0, &1), Err(NetworkError::UnknownEdge(_))));
        assert!(matches!(g.edge_attrs(&0, &1), Err(NetworkError::UnknownEdge(_))));
        assert!(matches!(g.neighbors(&5).map(|n| n.count()), Err(NetworkError::UnknownNode(_))));
    }
}

//! Mutation-tracking attribute store.
//!
//! Every container that backs a [`crate::graph::Graph`] (the node table, per-node
//! attribute maps, adjacency tables, the edge table and per-edge attribute
//! maps) is a [`TrackedMap`]. Each one holds an explicit [`Observer`] handle
//! given at construction and calls it exactly once per mutating call. Reads
//! never signal.
//!
//! Mutable access to a nested value is only handed out when that value is
//! itself tracked, so `graph.edge_attrs_mut(u, v)?.set("weight", 2.0)` and
//! `graph.node_attrs_mut(u)?.set("w", 1.0)` both reach the observer.

use indexmap::{Equivalent, IndexMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

/// Receives invalidation signals from tracked containers.
pub trait Observer {
    fn expire_dynamics(&self);
}

/// Marker for values whose own mutations reach an observer.
pub trait Tracked {}

/// An insertion-ordered map that notifies its observer on every mutation.
///
/// Removal preserves the relative order of the remaining entries.
pub struct TrackedMap<K, V> {
    inner: IndexMap<K, V>,
    observer: Rc<dyn Observer>,
}

impl<K, V> Tracked for TrackedMap<K, V> {}

impl<K: Hash + Eq, V> TrackedMap<K, V> {
    pub fn new(observer: Rc<dyn Observer>) -> Self {
        Self {
            inner: IndexMap::new(),
            observer,
        }
    }

    /// The observer this map reports to. Nested containers share it.
    pub fn observer(&self) -> Rc<dyn Observer> {
        Rc::clone(&self.observer)
    }

    fn expire(&self) {
        self.observer.expire_dynamics();
    }

    // --- reads ---

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        self.inner.get(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        self.inner.contains_key(key)
    }

    /// Position of `key` in iteration order.
    pub fn index_of<Q>(&self, key: &Q) -> Option<usize>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        self.inner.get_index_of(key)
    }

    pub fn get_index(&self, index: usize) -> Option<(&K, &V)> {
        self.inner.get_index(index)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, K, V> {
        self.inner.iter()
    }

    pub fn keys(&self) -> indexmap::map::Keys<'_, K, V> {
        self.inner.keys()
    }

    pub fn values(&self) -> indexmap::map::Values<'_, K, V> {
        self.inner.values()
    }

    // --- mutations (one signal each) ---

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.inner.insert(key, value);
        self.expire();
        previous
    }

    /// Removes `key`, returning its value (the `pop` of the store).
    /// Removing an absent key changes nothing and does not signal.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        let removed = self.inner.shift_remove(key);
        if removed.is_some() {
            self.expire();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.inner.clear();
        self.expire();
    }

    /// Bulk update. Signals once regardless of how many entries change.
    pub fn extend<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.inner.extend(entries);
        self.expire();
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.retain(keep);
        self.expire();
    }
}

impl<K: Hash + Eq, V: Tracked> TrackedMap<K, V> {
    /// Mutable access to a nested tracked container. The nested container
    /// signals on its own mutations, so no signal is sent here.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        Q: ?Sized + Hash + Equivalent<K>,
    {
        self.inner.get_mut(key)
    }

    /// Returns the nested container at `key`, inserting one built by
    /// `make` first if absent. Signals only when an entry is inserted.
    pub fn get_or_insert_with<F>(&mut self, key: K, make: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let inserted = !self.inner.contains_key(&key);
        if inserted {
            self.observer.expire_dynamics();
        }
        self.inner.entry(key).or_insert_with(make)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for TrackedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.iter()).finish()
    }
}

impl<'a, K, V> IntoIterator for &'a TrackedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = indexmap::map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

/// A node, edge or graph attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    List(Vec<AttrValue>),
}

impl AttrValue {
    /// Numeric view of the value. Text and lists have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(v) => Some(*v),
            AttrValue::Integer(v) => Some(*v as f64),
            AttrValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            AttrValue::Text(_) | AttrValue::List(_) => None,
        }
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Number(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Integer(value)
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        AttrValue::Integer(value as i64)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(values: Vec<f64>) -> Self {
        AttrValue::List(values.into_iter().map(AttrValue::Number).collect())
    }
}

/// Attribute map of a node, an edge or the graph itself.
pub type AttrMap = TrackedMap<String, AttrValue>;

impl TrackedMap<String, AttrValue> {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Option<AttrValue> {
        self.insert(name.into(), value.into())
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(AttrValue::as_f64)
    }
}

/// Collects `(name, value)` pairs into attribute entries for bulk updates.
pub fn attrs<I, S, V>(pairs: I) -> Vec<(String, AttrValue)>
where
    I: IntoIterator<Item = (S, V)>,
    S: Into<String>,
    V: Into<AttrValue>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect()
}

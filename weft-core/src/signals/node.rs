//! Signal Graph Nodes
//!
//! The graph is an arena of type-erased node slots owned by a
//! [`crate::signals::SignalSpace`]. Handles refer to slots by index, and
//! adjacency is stored as index lists on the slots themselves, so the
//! graph holds no reference cycles.
//!
//! # Node Kinds
//!
//! - **Setable** nodes are mutable roots. They keep the reverse
//!   "depends on me" list used for invalidation.
//! - **Derived** nodes cache their last computed value together with a
//!   three-state freshness tag and both forward dependency lists
//!   (setables and other derived nodes) plus the reverse list.
//!
//! # Invariants
//!
//! Edges are recorded in both directions at definition time and never
//! change afterward. For any edge `(a -> d)`, `a`'s `dependents` holds
//! `d` and `d`'s matching `deps_*` list holds `a`, with identical
//! [`DepOptions`] on both sides.

use std::any::Any;
use std::sync::Arc;

use smallvec::SmallVec;

/// Index of a node slot within its owning space's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// The raw arena index.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Freshness of a derived node's cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The cached value reflects all upstream values.
    UpToDate,

    /// A direct upstream value changed; the compute function must run
    /// before the next read returns.
    RequiresRecomputing,

    /// Some ancestor changed, but nothing has yet established whether a
    /// direct upstream value actually differs. Cheaper than
    /// `RequiresRecomputing`: resolving it may turn out to be a no-op.
    HasSomeUpstreamChanges,
}

/// Whether a dependency propagates eagerly or on next demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Recomputed within the `set` call that invalidated it.
    Sync,

    /// Only flagged; recomputed on next read.
    Lazy,
}

/// Per-edge options recorded when a dependency is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepOptions {
    pub dep_kind: DepKind,

    /// When true and the upstream value is `None`, the dependent derived
    /// node short-circuits to `None` without running its compute
    /// function.
    pub downstream_null_if_null: bool,
}

impl DepOptions {
    pub fn new(dep_kind: DepKind) -> Self {
        Self {
            dep_kind,
            downstream_null_if_null: false,
        }
    }

    /// Merge a re-declaration of the same edge: once Sync, always Sync,
    /// and null propagation is sticky.
    pub fn merge(&mut self, other: DepOptions) {
        if other.dep_kind == DepKind::Sync {
            self.dep_kind = DepKind::Sync;
        }
        self.downstream_null_if_null |= other.downstream_null_if_null;
    }
}

/// A type-erased node value.
pub(crate) type ErasedValue = Box<dyn Any + Send + Sync>;

/// Equality over two erased values of the same underlying type.
pub(crate) type ErasedEq =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool + Send + Sync>;

/// A derived node's compute function, re-entering the space through the
/// handles it captured.
pub(crate) type ErasedCompute = Arc<dyn Fn() -> ErasedValue + Send + Sync>;

/// `Option::is_none` over an erased `Option<T>` value.
pub(crate) type ErasedIsNone = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

/// Produce an erased `Option::<T>::None`.
pub(crate) type ErasedMakeNone = Arc<dyn Fn() -> ErasedValue + Send + Sync>;

/// Adjacency list entry storage. Most nodes have a handful of edges.
pub(crate) type EdgeList = SmallVec<[(NodeId, DepOptions); 4]>;

/// Insert or merge an edge into an adjacency list.
pub(crate) fn upsert_edge(list: &mut EdgeList, id: NodeId, opts: DepOptions) {
    if let Some((_, existing)) = list.iter_mut().find(|(other, _)| *other == id) {
        existing.merge(opts);
    } else {
        list.push((id, opts));
    }
}

/// Remove an edge from an adjacency list, if present.
pub(crate) fn remove_edge(list: &mut EdgeList, id: NodeId) {
    list.retain(|(other, _)| *other != id);
}

pub(crate) struct SetableSlot {
    pub value: ErasedValue,
    pub eq: ErasedEq,
    /// Present iff the node holds an `Option<T>`.
    pub is_none: Option<ErasedIsNone>,
    /// Reverse edges: derived nodes that read this setable.
    pub dependents: EdgeList,
}

pub(crate) struct DerivedSlot {
    pub value: ErasedValue,
    pub compute: ErasedCompute,
    pub eq: ErasedEq,
    pub state: NodeState,
    /// The kind this node's own dependency edges default to.
    pub kind: DepKind,
    /// Present iff the node computes an `Option<T>`.
    pub is_none: Option<ErasedIsNone>,
    pub make_none: Option<ErasedMakeNone>,
    /// Forward edges to setable roots.
    pub deps_setables: EdgeList,
    /// Forward edges to other derived nodes.
    pub deps_computing: EdgeList,
    /// Reverse edges: derived nodes that read this node.
    pub dependents: EdgeList,
}

pub(crate) enum NodeSlot {
    Setable(SetableSlot),
    Derived(DerivedSlot),
}

impl NodeSlot {
    pub fn as_derived(&self) -> Option<&DerivedSlot> {
        match self {
            NodeSlot::Derived(d) => Some(d),
            NodeSlot::Setable(_) => None,
        }
    }

    pub fn as_derived_mut(&mut self) -> Option<&mut DerivedSlot> {
        match self {
            NodeSlot::Derived(d) => Some(d),
            NodeSlot::Setable(_) => None,
        }
    }

    pub fn as_setable(&self) -> Option<&SetableSlot> {
        match self {
            NodeSlot::Setable(s) => Some(s),
            NodeSlot::Derived(_) => None,
        }
    }

    pub fn as_setable_mut(&mut self) -> Option<&mut SetableSlot> {
        match self {
            NodeSlot::Setable(s) => Some(s),
            NodeSlot::Derived(_) => None,
        }
    }

    /// Reverse edges regardless of node kind.
    pub fn dependents_mut(&mut self) -> &mut EdgeList {
        match self {
            NodeSlot::Setable(s) => &mut s.dependents,
            NodeSlot::Derived(d) => &mut d.dependents,
        }
    }
}

/// Build an [`ErasedEq`] from a typed equality closure.
pub(crate) fn erase_eq<T, F>(eq: F) -> ErasedEq
where
    T: Send + Sync + 'static,
    F: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => eq(a, b),
        _ => false,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_index() {
        let id = NodeId::from_index(42);
        assert_eq!(id.index(), 42);
        assert_eq!(id.raw(), 42);
        assert_eq!(id.to_string(), "n42");
    }

    #[test]
    fn dep_options_merge_keeps_sync_and_ors_null_flag() {
        let mut opts = DepOptions::new(DepKind::Sync);
        opts.merge(DepOptions::new(DepKind::Lazy));
        assert_eq!(opts.dep_kind, DepKind::Sync);

        let mut opts = DepOptions::new(DepKind::Lazy);
        opts.merge(DepOptions {
            dep_kind: DepKind::Sync,
            downstream_null_if_null: true,
        });
        assert_eq!(opts.dep_kind, DepKind::Sync);
        assert!(opts.downstream_null_if_null);

        // The null flag never clears once set.
        opts.merge(DepOptions::new(DepKind::Lazy));
        assert!(opts.downstream_null_if_null);
    }

    #[test]
    fn upsert_edge_merges_instead_of_duplicating() {
        let mut list = EdgeList::new();
        let id = NodeId::from_index(3);

        upsert_edge(&mut list, id, DepOptions::new(DepKind::Lazy));
        upsert_edge(&mut list, id, DepOptions::new(DepKind::Sync));

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].1.dep_kind, DepKind::Sync);

        remove_edge(&mut list, id);
        assert!(list.is_empty());
    }

    #[test]
    fn erased_eq_compares_through_any() {
        let eq = erase_eq::<i32, _>(|a, b| a == b);
        let a: ErasedValue = Box::new(5_i32);
        let b: ErasedValue = Box::new(5_i32);
        let c: ErasedValue = Box::new(6_i32);

        assert!(eq(a.as_ref(), b.as_ref()));
        assert!(!eq(a.as_ref(), c.as_ref()));

        // Mismatched types are never equal.
        let s: ErasedValue = Box::new("five".to_string());
        assert!(!eq(a.as_ref(), s.as_ref()));
    }
}

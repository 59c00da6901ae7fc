//! Signal Space
//!
//! A [`SignalSpace`] is the explicit context object every signal belongs
//! to: the node arena, the compute stack that makes dependency tracking
//! work, and the bookkeeping for one in-progress update. There is no
//! process-wide singleton; handles carry a clone of their space.
//!
//! # Dependency Tracking
//!
//! Creating a derived node pushes a `Definition` frame onto the space's
//! compute stack and evaluates the compute function once. Every tracked
//! read executed during that evaluation records a dependency edge in both
//! directions. Edges are fixed at definition time; recomputation runs
//! under an `Update` frame, which records nothing.
//!
//! # Propagation
//!
//! `set` on a setable with dependents opens a logical update (or joins
//! the one already in progress). Sync-edged dependents are recomputed
//! before the triggering `set` returns; Lazy-edged dependents are only
//! flagged and refresh on their next read. A `set` re-entering a node
//! already touched by the same update poisons the update and fails with
//! [`SignalError::CyclicUpdate`], including at the outermost caller even
//! when an inner call's result was discarded inside a compute closure.
//!
//! # Locking
//!
//! One `RwLock` guards the whole space. It is never held across a call
//! into user code: compute closures and equality checks run against
//! clones taken out of the arena, and re-enter through their captured
//! handles.

use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::errors::SignalError;

use super::node::{
    remove_edge, upsert_edge, DepKind, DepOptions, DerivedSlot, EdgeList, ErasedCompute, ErasedEq,
    ErasedIsNone, ErasedMakeNone, ErasedValue, NodeId, NodeSlot, NodeState, SetableSlot,
};
use super::setable::UpdateKind;

/// One entry on the compute stack.
#[derive(Debug, Clone, Copy)]
enum Frame {
    /// A derived node's first evaluation. Tracked reads record edges
    /// against `node`; `violated` is set when a null-propagating read is
    /// declared while `null_typed` is false.
    Definition {
        node: NodeId,
        null_typed: bool,
        violated: bool,
    },

    /// A recomputation in progress. Shields any enclosing definition
    /// from recording transitive dependencies.
    Update { node: NodeId },
}

/// Bookkeeping for one logical update, alive for the duration of the
/// outermost `set` call that opened it.
struct UpdateRecord {
    /// Every setable touched by this update, in order.
    touched: Vec<NodeId>,
    /// Set when a touched setable was re-entered; poisons the update.
    cycle: Option<NodeId>,
}

struct SpaceState {
    nodes: Vec<NodeSlot>,
    compute_stack: Vec<Frame>,
    update: Option<UpdateRecord>,
    update_count: u64,
    /// Bumped to `update_count` when the outermost update closes.
    version: watch::Sender<u64>,
}

impl SpaceState {
    fn poisoned(&self) -> bool {
        self.update.as_ref().is_some_and(|u| u.cycle.is_some())
    }
}

/// The context object owning a signal graph. Cheap to clone; all clones
/// share the same arena.
///
/// The space is mechanically thread-safe, but the update model assumes
/// one logical thread of control per space: cells each own their own
/// space and exchange values only through channel messages.
#[derive(Clone)]
pub struct SignalSpace {
    state: Arc<RwLock<SpaceState>>,
}

impl SignalSpace {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(SpaceState {
                nodes: Vec::new(),
                compute_stack: Vec::new(),
                update: None,
                update_count: 0,
                version,
            })),
        }
    }

    /// Subscribe to update completions. The watched value is the
    /// running update count; it changes once per closed update, not per
    /// recomputed node.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.state
            .read()
            .expect("signal space lock poisoned")
            .version
            .subscribe()
    }

    /// Number of nodes in the arena (including any abandoned by a failed
    /// definition).
    pub fn node_count(&self) -> usize {
        self.state
            .read()
            .expect("signal space lock poisoned")
            .nodes
            .len()
    }

    /// Number of logical updates opened so far.
    pub fn update_count(&self) -> u64 {
        self.state
            .read()
            .expect("signal space lock poisoned")
            .update_count
    }

    // ------------------------------------------------------------------------
    // Node construction
    // ------------------------------------------------------------------------

    pub(crate) fn add_setable(
        &self,
        value: ErasedValue,
        eq: ErasedEq,
        is_none: Option<ErasedIsNone>,
    ) -> NodeId {
        let mut st = self.state.write().expect("signal space lock poisoned");
        let id = NodeId::from_index(st.nodes.len());
        st.nodes.push(NodeSlot::Setable(SetableSlot {
            value,
            eq,
            is_none,
            dependents: EdgeList::new(),
        }));
        id
    }

    /// Allocate a derived node and run its first evaluation under a
    /// `Definition` frame. Fails with `InvalidNullPropagation` when the
    /// evaluation declared a null-propagating dependency while the node
    /// is not null-typed; the partial edges are unrecorded and the slot
    /// is left inert.
    pub(crate) fn define_derived(
        &self,
        compute: ErasedCompute,
        eq: ErasedEq,
        kind: DepKind,
        nullable: Option<(ErasedIsNone, ErasedMakeNone)>,
    ) -> Result<NodeId, SignalError> {
        struct Pending;

        let null_typed = nullable.is_some();
        let id = {
            let mut st = self.state.write().expect("signal space lock poisoned");
            let id = NodeId::from_index(st.nodes.len());
            let (is_none, make_none) = match nullable {
                Some((i, m)) => (Some(i), Some(m)),
                None => (None, None),
            };
            st.nodes.push(NodeSlot::Derived(DerivedSlot {
                value: Box::new(Pending),
                compute: Arc::clone(&compute),
                eq,
                state: NodeState::UpToDate,
                kind,
                is_none,
                make_none,
                deps_setables: EdgeList::new(),
                deps_computing: EdgeList::new(),
                dependents: EdgeList::new(),
            }));
            st.compute_stack.push(Frame::Definition {
                node: id,
                null_typed,
                violated: false,
            });
            id
        };

        let value = compute();

        let mut st = self.state.write().expect("signal space lock poisoned");
        let frame = st.compute_stack.pop();
        let violated = match frame {
            Some(Frame::Definition { node, violated, .. }) if node == id => violated,
            other => {
                debug_assert!(false, "definition frame mismatch: {other:?}");
                false
            }
        };
        if violated {
            Self::unlink(&mut st, id);
            return Err(SignalError::InvalidNullPropagation);
        }

        let slot = st.nodes[id.index()]
            .as_derived_mut()
            .expect("derived slot expected");
        slot.value = value;
        slot.state = NodeState::UpToDate;
        Ok(id)
    }

    /// Detach an abandoned node from the graph without removing its slot.
    fn unlink(st: &mut SpaceState, id: NodeId) {
        let (setables, computing) = match st.nodes[id.index()].as_derived_mut() {
            Some(d) => (
                std::mem::take(&mut d.deps_setables),
                std::mem::take(&mut d.deps_computing),
            ),
            None => return,
        };
        for (dep, _) in setables.iter().chain(computing.iter()) {
            remove_edge(st.nodes[dep.index()].dependents_mut(), id);
        }
    }

    // ------------------------------------------------------------------------
    // Dependency recording
    // ------------------------------------------------------------------------

    /// Called by handles on every tracked read. Records an edge when the
    /// top of the compute stack is a definition; otherwise a no-op.
    ///
    /// `null_read` marks a `defined()` read: the edge is forced Sync with
    /// downstream null propagation, and it is a declaration-time
    /// violation unless the defining node is null-typed.
    pub(crate) fn record_read(&self, src: NodeId, null_read: bool) {
        let mut st = self.state.write().expect("signal space lock poisoned");
        let def = match st.compute_stack.last_mut() {
            Some(Frame::Definition {
                node,
                null_typed,
                violated,
            }) => {
                if null_read && !*null_typed {
                    *violated = true;
                    return;
                }
                *node
            }
            _ => return,
        };

        if src == def {
            return;
        }

        let def_kind = st.nodes[def.index()]
            .as_derived()
            .expect("definition frame names a derived node")
            .kind;
        let opts = DepOptions {
            dep_kind: if null_read { DepKind::Sync } else { def_kind },
            downstream_null_if_null: null_read,
        };

        let src_is_setable = matches!(st.nodes[src.index()], NodeSlot::Setable(_));
        upsert_edge(st.nodes[src.index()].dependents_mut(), def, opts);
        let def_slot = st.nodes[def.index()]
            .as_derived_mut()
            .expect("definition frame names a derived node");
        if src_is_setable {
            upsert_edge(&mut def_slot.deps_setables, src, opts);
        } else {
            upsert_edge(&mut def_slot.deps_computing, src, opts);
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Clone the current value of a node. Derived callers are expected
    /// to refresh first when they need freshness.
    pub(crate) fn value_cloned<T: Clone + Send + Sync + 'static>(&self, id: NodeId) -> T {
        let st = self.state.read().expect("signal space lock poisoned");
        let value = match &st.nodes[id.index()] {
            NodeSlot::Setable(s) => &s.value,
            NodeSlot::Derived(d) => &d.value,
        };
        value
            .downcast_ref::<T>()
            .cloned()
            .expect("signal node value type mismatch")
    }

    /// Whether a null-typed node currently holds `None`. Nodes without
    /// an `is_none` closure report `false`.
    fn value_is_none(&self, id: NodeId) -> bool {
        let st = self.state.read().expect("signal space lock poisoned");
        let (value, is_none) = match &st.nodes[id.index()] {
            NodeSlot::Setable(s) => (&s.value, s.is_none.as_ref()),
            NodeSlot::Derived(d) => (&d.value, d.is_none.as_ref()),
        };
        is_none.is_some_and(|f| f(value.as_ref()))
    }

    pub(crate) fn derived_state(&self, id: NodeId) -> Option<NodeState> {
        let st = self.state.read().expect("signal space lock poisoned");
        st.nodes[id.index()].as_derived().map(|d| d.state)
    }

    // ------------------------------------------------------------------------
    // Writes and propagation
    // ------------------------------------------------------------------------

    /// Store a new value into a setable and propagate per the update
    /// strategy. Untracked writes and writes to dependent-free nodes
    /// never open an update, so they cannot fail.
    pub(crate) fn set_erased(
        &self,
        id: NodeId,
        new_value: ErasedValue,
        kind: UpdateKind,
    ) -> Result<(), SignalError> {
        {
            let mut st = self.state.write().expect("signal space lock poisoned");
            let slot = st.nodes[id.index()]
                .as_setable_mut()
                .expect("setable node expected");
            match kind {
                UpdateKind::Untracked => {
                    slot.value = new_value;
                    return Ok(());
                }
                UpdateKind::EqCheck => {
                    if (slot.eq)(slot.value.as_ref(), new_value.as_ref()) {
                        return Ok(());
                    }
                    slot.value = new_value;
                }
                UpdateKind::ForceUpdate => {
                    slot.value = new_value;
                }
            }
            if slot.dependents.is_empty() {
                return Ok(());
            }
        }
        self.propagate_from(id)
    }

    /// Walk a changed setable's reverse edges under one logical update.
    fn propagate_from(&self, id: NodeId) -> Result<(), SignalError> {
        let (created, dependents) = {
            let mut st = self.state.write().expect("signal space lock poisoned");
            let created = st.update.is_none();
            if created {
                st.update_count += 1;
                st.update = Some(UpdateRecord {
                    touched: Vec::new(),
                    cycle: None,
                });
            }
            let update = st.update.as_mut().expect("update record just ensured");
            if update.touched.contains(&id) {
                update.cycle = Some(id);
                tracing::error!(node = id.raw(), "cyclic update: setable set again within its own propagation");
                return Err(SignalError::CyclicUpdate { node: id.raw() });
            }
            update.touched.push(id);
            let dependents = st.nodes[id.index()]
                .as_setable()
                .expect("setable node expected")
                .dependents
                .clone();
            (created, dependents)
        };

        // Mark everything stale before recomputing anything, so a Sync
        // dependent joining two paths from the same write never reads a
        // sibling that has not been marked yet.
        for (dep, _) in &dependents {
            self.note_requires_recomputing(*dep);
        }
        for (dep, opts) in &dependents {
            if self.poisoned() {
                break;
            }
            if opts.dep_kind == DepKind::Sync {
                self.ensure_up_to_date(*dep);
            }
        }

        if created {
            let mut st = self.state.write().expect("signal space lock poisoned");
            let cycle = st.update.as_ref().and_then(|u| u.cycle);
            st.update = None;
            let count = st.update_count;
            st.version.send_replace(count);
            if let Some(node) = cycle {
                return Err(SignalError::CyclicUpdate { node: node.raw() });
            }
        }
        Ok(())
    }

    fn poisoned(&self) -> bool {
        self.state
            .read()
            .expect("signal space lock poisoned")
            .poisoned()
    }

    fn note_requires_recomputing(&self, id: NodeId) {
        let mut st = self.state.write().expect("signal space lock poisoned");
        Self::mark_requires_recomputing(&mut st, id);
    }

    fn mark_requires_recomputing(st: &mut SpaceState, id: NodeId) {
        let slot = match st.nodes[id.index()].as_derived_mut() {
            Some(d) => d,
            None => return,
        };
        let was_up_to_date = slot.state == NodeState::UpToDate;
        slot.state = NodeState::RequiresRecomputing;
        if was_up_to_date {
            let dependents = slot.dependents.clone();
            for (dep, _) in dependents {
                Self::mark_has_upstream_changes(st, dep);
            }
        }
    }

    /// The cheap cascade: only ever escalates from `UpToDate`, so an
    /// already-flagged subtree is never walked twice.
    fn mark_has_upstream_changes(st: &mut SpaceState, id: NodeId) {
        let slot = match st.nodes[id.index()].as_derived_mut() {
            Some(d) => d,
            None => return,
        };
        if slot.state != NodeState::UpToDate {
            return;
        }
        slot.state = NodeState::HasSomeUpstreamChanges;
        let dependents = slot.dependents.clone();
        for (dep, _) in dependents {
            Self::mark_has_upstream_changes(st, dep);
        }
    }

    /// Bring one derived node up to date, recursively refreshing its
    /// upstream derived dependencies first (post-order). A node still in
    /// `HasSomeUpstreamChanges` after the upstream sweep saw no actual
    /// change and is marked current without recomputation.
    pub(crate) fn ensure_up_to_date(&self, id: NodeId) {
        {
            let mut st = self.state.write().expect("signal space lock poisoned");
            match st.nodes[id.index()].as_derived() {
                Some(d) if d.state != NodeState::UpToDate => {}
                _ => return,
            }
            if st.poisoned() {
                return;
            }
            st.compute_stack.push(Frame::Update { node: id });
        }

        self.refresh(id);

        let mut st = self.state.write().expect("signal space lock poisoned");
        let frame = st.compute_stack.pop();
        debug_assert!(
            matches!(frame, Some(Frame::Update { node }) if node == id),
            "update frame mismatch"
        );
    }

    fn refresh(&self, id: NodeId) {
        let (deps_computing, deps_setables) = {
            let st = self.state.read().expect("signal space lock poisoned");
            let slot = st.nodes[id.index()]
                .as_derived()
                .expect("derived slot expected");
            (slot.deps_computing.clone(), slot.deps_setables.clone())
        };

        let mut null_because_upstream = false;
        for (dep, opts) in &deps_computing {
            self.ensure_up_to_date(*dep);
            if opts.downstream_null_if_null && self.value_is_none(*dep) {
                null_because_upstream = true;
                break;
            }
        }
        if !null_because_upstream {
            for (dep, opts) in &deps_setables {
                if opts.downstream_null_if_null && self.value_is_none(*dep) {
                    null_because_upstream = true;
                    break;
                }
            }
        }

        enum Step {
            Recompute(ErasedCompute),
            SubstituteNull(ErasedMakeNone),
            Nothing,
        }

        let step = {
            let st = self.state.read().expect("signal space lock poisoned");
            if st.poisoned() {
                return;
            }
            let slot = st.nodes[id.index()]
                .as_derived()
                .expect("derived slot expected");
            if null_because_upstream {
                Step::SubstituteNull(Arc::clone(
                    slot.make_none
                        .as_ref()
                        .expect("null-propagating edges only reach null-typed nodes"),
                ))
            } else {
                match slot.state {
                    NodeState::RequiresRecomputing => Step::Recompute(Arc::clone(&slot.compute)),
                    _ => Step::Nothing,
                }
            }
        };

        let new_value = match step {
            Step::Recompute(compute) => Some(compute()),
            Step::SubstituteNull(make_none) => Some(make_none()),
            Step::Nothing => None,
        };

        let changed_dependents = {
            let mut st = self.state.write().expect("signal space lock poisoned");
            if st.poisoned() {
                return;
            }
            let slot = st.nodes[id.index()]
                .as_derived_mut()
                .expect("derived slot expected");
            match new_value {
                None => {
                    if slot.state == NodeState::HasSomeUpstreamChanges {
                        slot.state = NodeState::UpToDate;
                    }
                    None
                }
                Some(value) => {
                    slot.state = NodeState::UpToDate;
                    let changed = !(slot.eq)(slot.value.as_ref(), value.as_ref());
                    if changed {
                        slot.value = value;
                        Some(slot.dependents.clone())
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(dependents) = changed_dependents {
            for (dep, _) in &dependents {
                self.note_requires_recomputing(*dep);
            }
            for (dep, opts) in &dependents {
                if self.poisoned() {
                    break;
                }
                if opts.dep_kind == DepKind::Sync {
                    self.ensure_up_to_date(*dep);
                }
            }
        }
    }
}

impl Default for SignalSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.read().expect("signal space lock poisoned");
        f.debug_struct("SignalSpace")
            .field("nodes", &st.nodes.len())
            .field("updates", &st.update_count)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::node::erase_eq;
    use super::*;

    #[test]
    fn new_space_is_empty() {
        let space = SignalSpace::new();
        assert_eq!(space.node_count(), 0);
        assert_eq!(space.update_count(), 0);
    }

    #[test]
    fn setable_without_dependents_never_opens_an_update() {
        let space = SignalSpace::new();
        let id = space.add_setable(Box::new(1_i32), erase_eq::<i32, _>(|a, b| a == b), None);

        space
            .set_erased(id, Box::new(2_i32), UpdateKind::EqCheck)
            .unwrap();
        assert_eq!(space.value_cloned::<i32>(id), 2);
        assert_eq!(space.update_count(), 0);
    }

    #[test]
    fn define_derived_records_both_edge_directions() {
        let space = SignalSpace::new();
        let src = space.add_setable(Box::new(3_i32), erase_eq::<i32, _>(|a, b| a == b), None);

        let reader = space.clone();
        let id = space
            .define_derived(
                Arc::new(move || {
                    reader.record_read(src, false);
                    Box::new(reader.value_cloned::<i32>(src) * 2)
                }),
                erase_eq::<i32, _>(|a, b| a == b),
                DepKind::Sync,
                None,
            )
            .unwrap();

        assert_eq!(space.value_cloned::<i32>(id), 6);
        assert_eq!(space.derived_state(id), Some(NodeState::UpToDate));
        assert_eq!(space.node_count(), 2);
    }

    #[test]
    fn debug_prints_counters() {
        let space = SignalSpace::new();
        let text = format!("{space:?}");
        assert!(text.contains("SignalSpace"));
        assert!(text.contains("nodes"));
    }
}

//! Setable Signals
//!
//! Typed handles over setable arena nodes. A handle is a thin
//! `(space, node id)` pair; cloning it clones the handle, never the
//! node, so any clone observes writes made through any other.
//!
//! Writes pick an update strategy with [`UpdateKind`]: the default
//! `EqCheck` drops writes whose value equals the current one before any
//! propagation happens, `ForceUpdate` propagates unconditionally, and
//! `Untracked` stores the value without waking dependents at all.

use std::marker::PhantomData;

use crate::errors::SignalError;

use super::node::{erase_eq, ErasedIsNone, NodeId};
use super::space::SignalSpace;

/// How a write to a setable interacts with the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateKind {
    /// Compare against the current value first; equal writes are
    /// dropped without opening an update.
    #[default]
    EqCheck,
    /// Skip the equality check and always propagate.
    ForceUpdate,
    /// Store the value without propagating. Dependents will not notice
    /// until something else wakes them.
    Untracked,
}

/// A writable signal holding a `T`.
pub struct SetableSignal<T> {
    space: SignalSpace,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

/// A writable signal holding an `Option<T>`, usable as a
/// null-propagating dependency via [`SetableNullable::defined`].
pub struct SetableNullable<T> {
    space: SignalSpace,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl SignalSpace {
    /// Create a setable signal with `PartialEq` change detection.
    pub fn setable<T>(&self, value: T) -> SetableSignal<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.setable_with_eq(value, |a: &T, b: &T| a == b)
    }

    /// Create a setable signal with a custom equality check, for value
    /// types without a usable `PartialEq`.
    pub fn setable_with_eq<T, F>(&self, value: T, eq: F) -> SetableSignal<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let id = self.add_setable(Box::new(value), erase_eq::<T, _>(eq), None);
        SetableSignal {
            space: self.clone(),
            id,
            _marker: PhantomData,
        }
    }

    /// Create a setable signal holding an `Option<T>`.
    pub fn setable_nullable<T>(&self, value: Option<T>) -> SetableNullable<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let is_none: ErasedIsNone = std::sync::Arc::new(|v| {
            v.downcast_ref::<Option<T>>().is_some_and(Option::is_none)
        });
        let id = self.add_setable(
            Box::new(value),
            erase_eq::<Option<T>, _>(|a, b| a == b),
            Some(is_none),
        );
        SetableNullable {
            space: self.clone(),
            id,
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SetableSignal<T> {
    /// Read the current value. Inside a derived definition this records
    /// a dependency on this signal; anywhere else it is a plain read.
    pub fn get(&self) -> T {
        self.space.record_read(self.id, false);
        self.space.value_cloned(self.id)
    }

    /// Read the current value without recording a dependency.
    pub fn get_untracked(&self) -> T {
        self.space.value_cloned(self.id)
    }

    /// Write with the default `EqCheck` strategy. Sync dependents are
    /// recomputed before this returns.
    ///
    /// Fails with [`SignalError::CyclicUpdate`] when the write lands on
    /// a setable already touched by the update it would join.
    pub fn set(&self, value: T) -> Result<(), SignalError> {
        self.space
            .set_erased(self.id, Box::new(value), UpdateKind::EqCheck)
    }

    /// Write without the equality check; dependents recompute even when
    /// the value is unchanged.
    pub fn set_force(&self, value: T) -> Result<(), SignalError> {
        self.space
            .set_erased(self.id, Box::new(value), UpdateKind::ForceUpdate)
    }

    /// Store a value without propagating to dependents.
    pub fn set_untracked(&self, value: T) {
        // Untracked writes never open an update, so no cycle can surface.
        let _ = self
            .space
            .set_erased(self.id, Box::new(value), UpdateKind::Untracked);
    }

    /// Read-modify-write with the default strategy.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<(), SignalError> {
        let next = f(&self.get_untracked());
        self.set(next)
    }
}

impl<T: Clone + Send + Sync + 'static> SetableNullable<T> {
    pub fn get(&self) -> Option<T> {
        self.space.record_read(self.id, false);
        self.space.value_cloned(self.id)
    }

    pub fn get_untracked(&self) -> Option<T> {
        self.space.value_cloned(self.id)
    }

    /// Read for use inside a nullable derived definition: records a
    /// Sync, null-propagating dependency, and returns the inner value
    /// so the definition can short-circuit with `?`.
    ///
    /// Declaring such a read while defining a non-nullable derived
    /// fails that definition with `InvalidNullPropagation`.
    pub fn defined(&self) -> Option<T> {
        self.space.record_read(self.id, true);
        self.space.value_cloned(self.id)
    }

    pub fn set(&self, value: Option<T>) -> Result<(), SignalError> {
        self.space
            .set_erased(self.id, Box::new(value), UpdateKind::EqCheck)
    }

    pub fn set_force(&self, value: Option<T>) -> Result<(), SignalError> {
        self.space
            .set_erased(self.id, Box::new(value), UpdateKind::ForceUpdate)
    }

    pub fn set_untracked(&self, value: Option<T>) {
        let _ = self
            .space
            .set_erased(self.id, Box::new(value), UpdateKind::Untracked);
    }

    pub fn update(&self, f: impl FnOnce(&Option<T>) -> Option<T>) -> Result<(), SignalError> {
        let next = f(&self.get_untracked());
        self.set(next)
    }
}

impl<T> Clone for SetableSignal<T> {
    fn clone(&self) -> Self {
        Self {
            space: self.space.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for SetableNullable<T> {
    fn clone(&self) -> Self {
        Self {
            space: self.space.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SetableSignal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetableSignal").field("id", &self.id).finish()
    }
}

impl<T> std::fmt::Debug for SetableNullable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetableNullable")
            .field("id", &self.id)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_latest_value() {
        let space = SignalSpace::new();
        let count = space.setable(0_i32);
        assert_eq!(count.get(), 0);

        count.set(5).unwrap();
        assert_eq!(count.get(), 5);

        count.update(|n| n + 1).unwrap();
        assert_eq!(count.get(), 6);
    }

    #[test]
    fn clones_share_the_underlying_node() {
        let space = SignalSpace::new();
        let a = space.setable(String::from("left"));
        let b = a.clone();

        a.set(String::from("right")).unwrap();
        assert_eq!(b.get(), "right");
        assert_eq!(space.node_count(), 1);
    }

    #[test]
    fn custom_eq_controls_change_detection() {
        let space = SignalSpace::new();
        // Equality on the integer part only.
        let value = space.setable_with_eq(1.25_f64, |a: &f64, b: &f64| {
            a.trunc() == b.trunc()
        });

        value.set(1.75).unwrap();
        // Same integer part, so the write was dropped.
        assert_eq!(value.get(), 1.25);

        value.set(2.0).unwrap();
        assert_eq!(value.get(), 2.0);
    }

    #[test]
    fn nullable_holds_and_clears_values() {
        let space = SignalSpace::new();
        let name = space.setable_nullable(Some(String::from("ada")));
        assert_eq!(name.get(), Some(String::from("ada")));

        name.set(None).unwrap();
        assert_eq!(name.get(), None);
    }

    #[test]
    fn defined_outside_a_definition_is_a_plain_read() {
        let space = SignalSpace::new();
        let slot = space.setable_nullable(Some(7_i32));
        assert_eq!(slot.defined(), Some(7));

        slot.set(None).unwrap();
        assert_eq!(slot.defined(), None);
        assert_eq!(space.node_count(), 1);
    }

    #[test]
    fn set_untracked_stores_without_opening_an_update() {
        let space = SignalSpace::new();
        let value = space.setable(10_i32);
        value.set_untracked(11);
        assert_eq!(value.get(), 11);
        assert_eq!(space.update_count(), 0);
    }
}

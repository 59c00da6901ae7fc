//! Derived Signals
//!
//! A derived signal memoizes a compute function over other signals. Its
//! dependency set is recorded during the single definition-time
//! evaluation and never changes afterwards: a branch the definition did
//! not take will not wake the derived later, even if a recomputation
//! reads through it.
//!
//! Sync deriveds (the default) are refreshed inside the `set` call that
//! invalidates them. Lazy deriveds only refresh on their next tracked
//! read, and `get_untracked` deliberately skips that refresh, so it can
//! observe the stale memoized value.
//!
//! Nullable deriveds compute an `Option<T>` and may declare
//! null-propagating dependencies by reading them through `defined()`
//! inside the definition. When such a dependency is `None`, the derived
//! becomes `None` without its compute function running.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::errors::SignalError;

use super::node::{
    erase_eq, DepKind, ErasedCompute, ErasedIsNone, ErasedMakeNone, ErasedValue, NodeId, NodeState,
};
use super::space::SignalSpace;

/// A memoized signal computed from other signals.
pub struct DerivedSignal<T> {
    space: SignalSpace,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

/// A memoized signal computing an `Option<T>`, usable both as a
/// null-propagating dependency and as a consumer of them.
pub struct DerivedNullable<T> {
    space: SignalSpace,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl SignalSpace {
    /// Define a Sync derived signal. The compute function runs once
    /// here to record dependencies and produce the initial value.
    pub fn derived<T>(
        &self,
        compute: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<DerivedSignal<T>, SignalError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.derived_with_eq(compute, |a: &T, b: &T| a == b)
    }

    /// Define a Sync derived signal with a custom equality check used
    /// for memoization and change detection.
    pub fn derived_with_eq<T, C, E>(
        &self,
        compute: C,
        eq: E,
    ) -> Result<DerivedSignal<T>, SignalError>
    where
        T: Clone + Send + Sync + 'static,
        C: Fn() -> T + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let id = self.define_derived(
            erase_compute(compute),
            erase_eq::<T, _>(eq),
            DepKind::Sync,
            None,
        )?;
        Ok(DerivedSignal {
            space: self.clone(),
            id,
            _marker: PhantomData,
        })
    }

    /// Define a Lazy derived signal: writes to its dependencies only
    /// flag it, and the recompute happens on its next read.
    pub fn derived_lazy<T>(
        &self,
        compute: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<DerivedSignal<T>, SignalError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let id = self.define_derived(
            erase_compute(compute),
            erase_eq::<T, _>(|a, b| a == b),
            DepKind::Lazy,
            None,
        )?;
        Ok(DerivedSignal {
            space: self.clone(),
            id,
            _marker: PhantomData,
        })
    }

    /// Define a Sync nullable derived signal.
    pub fn derived_nullable<T>(
        &self,
        compute: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Result<DerivedNullable<T>, SignalError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.define_nullable(compute, DepKind::Sync)
    }

    /// Define a Lazy nullable derived signal.
    pub fn derived_nullable_lazy<T>(
        &self,
        compute: impl Fn() -> Option<T> + Send + Sync + 'static,
    ) -> Result<DerivedNullable<T>, SignalError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.define_nullable(compute, DepKind::Lazy)
    }

    fn define_nullable<T>(
        &self,
        compute: impl Fn() -> Option<T> + Send + Sync + 'static,
        kind: DepKind,
    ) -> Result<DerivedNullable<T>, SignalError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let is_none: ErasedIsNone = Arc::new(|v| {
            v.downcast_ref::<Option<T>>().is_some_and(Option::is_none)
        });
        let make_none: ErasedMakeNone = Arc::new(|| Box::new(None::<T>) as ErasedValue);
        let id = self.define_derived(
            erase_compute(compute),
            erase_eq::<Option<T>, _>(|a, b| a == b),
            kind,
            Some((is_none, make_none)),
        )?;
        Ok(DerivedNullable {
            space: self.clone(),
            id,
            _marker: PhantomData,
        })
    }
}

fn erase_compute<T: Send + Sync + 'static>(
    compute: impl Fn() -> T + Send + Sync + 'static,
) -> ErasedCompute {
    Arc::new(move || Box::new(compute()) as ErasedValue)
}

impl<T: Clone + Send + Sync + 'static> DerivedSignal<T> {
    /// Read the memoized value, refreshing first if a dependency has
    /// changed since the last read.
    pub fn get(&self) -> T {
        self.space.record_read(self.id, false);
        self.space.ensure_up_to_date(self.id);
        self.space.value_cloned(self.id)
    }

    /// Read the memoized value as-is: no dependency is recorded and no
    /// refresh happens, so a flagged Lazy derived stays stale.
    pub fn get_untracked(&self) -> T {
        self.space.value_cloned(self.id)
    }

    /// Freshness of the memoized value right now.
    pub fn state(&self) -> NodeState {
        self.space
            .derived_state(self.id)
            .expect("derived handles always point at derived nodes")
    }
}

impl<T: Clone + Send + Sync + 'static> DerivedNullable<T> {
    pub fn get(&self) -> Option<T> {
        self.space.record_read(self.id, false);
        self.space.ensure_up_to_date(self.id);
        self.space.value_cloned(self.id)
    }

    pub fn get_untracked(&self) -> Option<T> {
        self.space.value_cloned(self.id)
    }

    /// Freshness of the memoized value right now.
    pub fn state(&self) -> NodeState {
        self.space
            .derived_state(self.id)
            .expect("derived handles always point at derived nodes")
    }

    /// Null-propagating read for use inside another nullable derived's
    /// definition. See [`crate::signals::SetableNullable::defined`].
    pub fn defined(&self) -> Option<T> {
        self.space.record_read(self.id, true);
        self.space.ensure_up_to_date(self.id);
        self.space.value_cloned(self.id)
    }
}

impl<T> Clone for DerivedSignal<T> {
    fn clone(&self) -> Self {
        Self {
            space: self.space.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for DerivedNullable<T> {
    fn clone(&self) -> Self {
        Self {
            space: self.space.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for DerivedSignal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedSignal").field("id", &self.id).finish()
    }
}

impl<T> std::fmt::Debug for DerivedNullable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedNullable")
            .field("id", &self.id)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

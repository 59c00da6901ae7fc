//! Reactive Signal Graph
//!
//! Fine-grained reactive state: setable signals hold values, derived
//! signals memoize computations over them, and a [`SignalSpace`] owns
//! the graph both live in. Dependencies are recorded once, when a
//! derived is defined, by actually running its compute function.
//!
//! ```
//! use weft_core::signals::SignalSpace;
//!
//! let space = SignalSpace::new();
//! let base = space.setable(2_i32);
//! let doubled = {
//!     let base = base.clone();
//!     space.derived(move || base.get() * 2).unwrap()
//! };
//!
//! base.set(21).unwrap();
//! assert_eq!(doubled.get(), 42);
//! ```

mod derived;
mod node;
mod setable;
mod space;

pub use derived::{DerivedNullable, DerivedSignal};
pub use node::{DepKind, DepOptions, NodeId, NodeState};
pub use setable::{SetableNullable, SetableSignal, UpdateKind};
pub use space::SignalSpace;

//! Cells
//!
//! Unit-of-work layer on top of [`crate::signals`] and
//! [`crate::channels`]. A cell is a named async task with a declared
//! set of channels: signal inputs and outputs, plus element streams in
//! either direction. Each cell owns a private signal space; the only
//! way data crosses a cell boundary is through its channels.
//!
//! The pieces:
//!
//! - [`CellKind`] declares a cell's channels by name.
//! - [`CellScope`] is what the run closure receives: typed access to
//!   the declared channels and the cell's own signal space.
//! - [`CellController`] is the outside handle: start, attach remotes,
//!   feed inputs, watch outputs, pipe to other cells, stop.
//! - [`LabEnv`] registers cells by name and shares one observer space
//!   and one [`EnvConfig`] across them.
//!
//! A cell does not run until told to start, and run code does not
//! execute until every signal input has received a value. Control
//! messages posted before the start are queued, so a whole graph can
//! be wired up first and started as one step.

mod controller;
mod env;
mod kind;
mod scope;
mod status;
mod worker;

pub use controller::CellController;
pub use env::{EnvConfig, LabEnv};
pub use kind::CellKind;
pub use scope::{CellRun, CellScope};
pub use status::CellStatus;

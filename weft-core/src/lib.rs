//! Weft Core
//!
//! This crate provides the core runtime for the Weft reactive cell
//! framework. It implements:
//!
//! - Reactive primitives (setable and derived signals, nullable
//!   variants, cycle detection)
//! - Message-passing channel ends with last-value replay and stream
//!   backpressure
//! - The cell lifecycle: declared channels, gated startup, piping,
//!   cooperative and forced shutdown
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `signals`: Signal space, dependency tracking, and recomputation
//! - `channels`: Duplex ports, signal and stream channel ends
//! - `cells`: Cell kinds, scopes, controllers, and the environment
//! - `errors`: Error types shared across the layers
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_core::cells::{CellKind, LabEnv};
//!
//! let env = LabEnv::new();
//!
//! // A cell that doubles whatever arrives on its input.
//! let kind = CellKind::new("doubler").input("n").output("doubled");
//! let cell = env.spawn("doubler", kind, |scope| async move {
//!     let n = scope.input::<i64>("n").await?;
//!     let doubled = {
//!         let n = n.clone();
//!         scope.space().derived(move || n.get() * 2)?
//!     };
//!     scope.bind_output("doubled", doubled)?;
//!     scope.finish_requested().await;
//!     Ok(())
//! })?;
//!
//! // Feed the input, start, and watch the output.
//! cell.input::<i64>("n")?.set(&21)?;
//! cell.start().await?;
//! let mut doubled = cell.output::<i64>("doubled")?;
//! doubled.ready().await;
//! assert_eq!(doubled.get(), Some(42));
//! ```

pub mod cells;
pub mod channels;
pub mod errors;
pub mod signals;

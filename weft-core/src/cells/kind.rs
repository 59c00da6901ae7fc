//! Cell Kinds
//!
//! A [`CellKind`] declares the channel surface of a cell: which named
//! signal inputs and outputs it has, and which named in- and
//! out-streams. The worker builds exactly these ends at start, and both
//! the controller and the worker reject channel names outside the kind.
//!
//! Names are per-kind namespaces: an input and an output may share a
//! name, since one only ever receives and the other only ever sends.

use indexmap::IndexSet;

/// Channel surface declaration for a cell. Built fluently:
///
/// ```
/// use weft_core::cells::CellKind;
///
/// let kind = CellKind::new("reverser")
///     .input("prefix")
///     .output("reversed")
///     .out_stream("names");
/// assert!(kind.has_input("prefix"));
/// ```
#[derive(Debug, Clone)]
pub struct CellKind {
    name: String,
    inputs: IndexSet<String>,
    outputs: IndexSet<String>,
    in_streams: IndexSet<String>,
    out_streams: IndexSet<String>,
}

impl CellKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: IndexSet::new(),
            outputs: IndexSet::new(),
            in_streams: IndexSet::new(),
            out_streams: IndexSet::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.insert(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.insert(name.into());
        self
    }

    pub fn in_stream(mut self, name: impl Into<String>) -> Self {
        self.in_streams.insert(name.into());
        self
    }

    pub fn out_stream(mut self, name: impl Into<String>) -> Self {
        self.out_streams.insert(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str)
    }

    pub fn in_streams(&self) -> impl Iterator<Item = &str> {
        self.in_streams.iter().map(String::as_str)
    }

    pub fn out_streams(&self) -> impl Iterator<Item = &str> {
        self.out_streams.iter().map(String::as_str)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains(name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains(name)
    }

    pub fn has_in_stream(&self, name: &str) -> bool {
        self.in_streams.contains(name)
    }

    pub fn has_out_stream(&self, name: &str) -> bool {
        self.out_streams.contains(name)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

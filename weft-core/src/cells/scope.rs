//! Cell Scope
//!
//! The handle a cell's run function receives. It owns the cell's
//! private [`SignalSpace`] and the channel ends the cell kind declared,
//! and it is the only way run code touches them: inputs surface as
//! typed signals, outputs are either set imperatively or bound to a
//! derived signal, and streams surface as typed readers and writers.
//!
//! A bound output is re-evaluated by the worker after every update in
//! the cell's space, so a derived wired to an input keeps flowing to
//! the output for as long as the cell runs.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::channels::{
    CellId, ChannelId, Payload, SignalReceiveEnd, SignalSendEnd, SignalWriter, StreamReader,
    StreamReceiveEnd, StreamSendEnd, StreamWriter,
};
use crate::errors::{CellError, ChannelError};
use crate::signals::{DerivedSignal, SetableSignal, SignalSpace};

/// The body of a cell: started once the input gate opens, driven by the
/// worker until it returns or the cell is force-stopped.
pub type CellRun = Box<dyn FnOnce(CellScope) -> BoxFuture<'static, Result<(), CellError>> + Send>;

/// An output kept in sync with a derived signal in the cell's space.
pub(crate) struct OutputBinding {
    name: String,
    eval: Box<dyn Fn() -> Result<Payload, ChannelError> + Send>,
    send: SignalSendEnd,
}

impl OutputBinding {
    /// Re-evaluate and publish. The send end drops byte-identical
    /// values, so flushing more often than needed is harmless.
    pub(crate) fn flush(&self) {
        match (self.eval)() {
            Ok(payload) => self.send.set_payload(payload),
            Err(error) => {
                tracing::warn!(output = %self.name, %error, "output binding failed to encode")
            }
        }
    }
}

/// A running cell's window onto its own channels and signal space.
/// Cloning is cheap and clones see the same cell.
#[derive(Clone)]
pub struct CellScope {
    pub(crate) cell_id: CellId,
    pub(crate) space: SignalSpace,
    pub(crate) inputs: IndexMap<String, SignalReceiveEnd>,
    pub(crate) outputs: IndexMap<String, SignalSendEnd>,
    pub(crate) in_streams: IndexMap<String, StreamReceiveEnd>,
    pub(crate) out_streams: IndexMap<String, StreamSendEnd>,
    pub(crate) bindings: Arc<Mutex<Vec<OutputBinding>>>,
    pub(crate) finish: watch::Receiver<bool>,
}

impl CellScope {
    pub fn cell_id(&self) -> &CellId {
        &self.cell_id
    }

    /// The cell's private signal space.
    pub fn space(&self) -> &SignalSpace {
        &self.space
    }

    /// Typed view of a signal input. Resolves once the first value has
    /// arrived; by the time run code executes, every input already has
    /// one, so in practice this is immediate.
    pub async fn input<T>(&self, name: &str) -> Result<SetableSignal<T>, CellError>
    where
        T: DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    {
        let end = self.inputs.get(name).ok_or_else(|| self.no_such(name))?;
        Ok(end.typed::<T>().await?)
    }

    /// Imperative writer for a signal output.
    pub fn output<T: Serialize>(&self, name: &str) -> Result<SignalWriter<T>, CellError> {
        let end = self.outputs.get(name).ok_or_else(|| self.no_such(name))?;
        Ok(SignalWriter::new(end.clone()))
    }

    /// Keep an output equal to a derived signal. Publishes the current
    /// value now and again after every update in the cell's space.
    pub fn bind_output<T>(&self, name: &str, signal: DerivedSignal<T>) -> Result<(), CellError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let end = self
            .outputs
            .get(name)
            .ok_or_else(|| self.no_such(name))?
            .clone();
        let binding = OutputBinding {
            name: name.to_string(),
            eval: Box::new(move || Payload::encode(&signal.get())),
            send: end,
        };
        binding.flush();
        self.bindings.lock().push(binding);
        Ok(())
    }

    /// Typed reader for an in-stream.
    pub fn in_stream<T: DeserializeOwned>(&self, name: &str) -> Result<StreamReader<T>, CellError> {
        let end = self.in_streams.get(name).ok_or_else(|| self.no_such(name))?;
        Ok(StreamReader::new(end.clone()))
    }

    /// Typed writer for an out-stream. Streams left open when run
    /// returns are ended by the worker.
    pub fn out_stream<T: Serialize>(&self, name: &str) -> Result<StreamWriter<T>, CellError> {
        let end = self.out_streams.get(name).ok_or_else(|| self.no_such(name))?;
        Ok(StreamWriter::new(end.clone()))
    }

    pub fn is_finish_requested(&self) -> bool {
        *self.finish.borrow()
    }

    /// Resolves once a finish has been requested. Long-running cells
    /// select on this to know when to wind down.
    pub async fn finish_requested(&self) {
        let mut finish = self.finish.clone();
        let _ = finish.wait_for(|requested| *requested).await;
    }

    fn no_such(&self, name: &str) -> CellError {
        ChannelError::NoSuchChannel {
            channel: ChannelId::new(self.cell_id.clone(), name).to_string(),
        }
        .into()
    }
}

impl std::fmt::Debug for CellScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellScope")
            .field("cell", &self.cell_id)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{port_pair, Remote, SignalView};

    fn bare_scope(outputs: IndexMap<String, SignalSendEnd>) -> CellScope {
        let (_, finish) = watch::channel(false);
        CellScope {
            cell_id: CellId::new("probe"),
            space: SignalSpace::new(),
            inputs: IndexMap::new(),
            outputs,
            in_streams: IndexMap::new(),
            out_streams: IndexMap::new(),
            bindings: Arc::new(Mutex::new(Vec::new())),
            finish,
        }
    }

    #[tokio::test]
    async fn unknown_channel_names_error() {
        let scope = bare_scope(IndexMap::new());
        let err = scope.output::<i32>("missing").unwrap_err();
        assert_eq!(
            err.to_string(),
            "no channel named `probe:missing` is declared on this cell"
        );
        assert!(scope.in_stream::<i32>("missing").is_err());
    }

    #[tokio::test]
    async fn bound_outputs_publish_on_registration_and_on_flush() {
        let out_id = ChannelId::new(CellId::new("probe"), "doubled");
        let end = SignalSendEnd::new(out_id.clone());
        let mut outputs = IndexMap::new();
        outputs.insert(String::from("doubled"), end.clone());
        let scope = bare_scope(outputs);

        let observer =
            SignalReceiveEnd::new(ChannelId::new(CellId::new("observer"), "doubled"), SignalSpace::new());
        let (cell_side, observer_side) = port_pair();
        end.add_remote(Remote::new(observer.id().clone(), cell_side));
        observer.add_remote(Remote::new(out_id, observer_side));

        let base = scope.space().setable(3_i32);
        let doubled = {
            let base = base.clone();
            scope.space().derived(move || base.get() * 2).unwrap()
        };
        scope.bind_output("doubled", doubled).unwrap();

        let mut view = SignalView::<i32>::new(&observer);
        view.ready().await;
        assert_eq!(view.get(), Some(6));

        // The worker flushes after each space update; do it by hand.
        base.set(5).unwrap();
        for binding in scope.bindings.lock().iter() {
            binding.flush();
        }
        assert_eq!(view.changed().await, Some(10));
    }
}

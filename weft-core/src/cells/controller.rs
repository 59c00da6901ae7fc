//! Cell Controller
//!
//! The outside handle to a spawned cell. A controller validates channel
//! names against the cell's kind, posts control messages to the worker,
//! and hands out typed observer ends for feeding inputs and watching
//! outputs.
//!
//! Messages posted before [`CellController::start`] are queued and
//! delivered to the worker right after the start order, in the order
//! they were posted. Wiring a graph of not-yet-started cells is
//! therefore ordinary use, not a race.

use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channels::{
    port_pair, CellId, ChannelId, Remote, SignalReceiveEnd, SignalSendEnd, SignalView,
    SignalWriter, StreamReader, StreamReceiveEnd, StreamSendEnd, StreamWriter,
};
use crate::errors::{CellError, ChannelError};
use crate::signals::{DerivedSignal, SignalSpace};

use super::env::EnvConfig;
use super::kind::CellKind;
use super::scope::CellRun;
use super::status::CellStatus;
use super::worker::{run_worker, CellMessage, WorkerConfig};

/// Where posted control messages go: a queue until the worker exists,
/// the worker's channel afterwards.
enum PostTarget {
    Queued(Vec<CellMessage>),
    Live(mpsc::UnboundedSender<CellMessage>),
}

/// Observer-side channel ends, created lazily and cached so repeated
/// calls share one attachment per channel.
#[derive(Default)]
struct ObserverEnds {
    input_writers: IndexMap<String, SignalSendEnd>,
    output_views: IndexMap<String, SignalReceiveEnd>,
    in_stream_writers: IndexMap<String, StreamSendEnd>,
    out_stream_readers: IndexMap<String, StreamReceiveEnd>,
}

/// Handle to one cell. Shared behind an `Arc` by the environment;
/// every method takes `&self`.
pub struct CellController {
    id: CellId,
    observer_id: CellId,
    kind: CellKind,
    config: EnvConfig,
    observer_space: SignalSpace,
    status: watch::Sender<CellStatus>,
    post: Mutex<PostTarget>,
    run: Mutex<Option<CellRun>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ends: Mutex<ObserverEnds>,
}

impl CellController {
    pub(crate) fn new(
        id: CellId,
        kind: CellKind,
        run: CellRun,
        observer_space: SignalSpace,
        config: EnvConfig,
    ) -> Self {
        let (status, _) = watch::channel(CellStatus::NotStarted);
        let observer_id = CellId::new(format!("{id}.observer"));
        Self {
            id,
            observer_id,
            kind,
            config,
            observer_space,
            status,
            post: Mutex::new(PostTarget::Queued(Vec::new())),
            run: Mutex::new(Some(run)),
            worker: Mutex::new(None),
            ends: Mutex::new(ObserverEnds::default()),
        }
    }

    pub fn id(&self) -> &CellId {
        &self.id
    }

    pub fn kind(&self) -> &CellKind {
        &self.kind
    }

    pub fn status(&self) -> CellStatus {
        *self.status.borrow()
    }

    /// Watch the lifecycle. The transitions are the notifications:
    /// `wait_for(Running)` is "started", `wait_for(Stopped)` is
    /// "finished".
    pub fn status_updates(&self) -> watch::Receiver<CellStatus> {
        self.status.subscribe()
    }

    /// Spawn the worker, flush every queued message after the start
    /// order, and wait until the cell is running. Also resolves if the
    /// cell stops before reaching `Running` (an instant run body, or a
    /// strict-mode shutdown); callers that care inspect
    /// [`CellController::status`] afterwards.
    pub async fn start(&self) -> Result<(), CellError> {
        let run = self
            .run
            .lock()
            .take()
            .ok_or_else(|| CellError::AlreadyStarted {
                cell: self.id.to_string(),
            })?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(
            self.id.clone(),
            self.kind.clone(),
            run,
            control_rx,
            self.status.clone(),
            WorkerConfig {
                strict_channels: self.config.strict_channels,
                congestion: self.config.congestion,
            },
        ));
        *self.worker.lock() = Some(handle);

        // Swap the queue for the live channel under the lock so a post
        // racing with start cannot slip in between the flush and the
        // swap.
        {
            let mut post = self.post.lock();
            let queued = match &mut *post {
                PostTarget::Queued(queue) => std::mem::take(queue),
                PostTarget::Live(_) => Vec::new(),
            };
            let _ = control_tx.send(CellMessage::StartCellRun);
            for message in queued {
                let _ = control_tx.send(message);
            }
            *post = PostTarget::Live(control_tx);
        }

        let mut status = self.status.subscribe();
        let waited = status.wait_for(|s| s.is_active() || s.is_stopped()).await;
        match waited {
            Ok(_) => Ok(()),
            Err(_) => Err(CellError::NotStarted {
                cell: self.id.to_string(),
            }),
        }
    }

    fn post(&self, message: CellMessage) {
        let mut post = self.post.lock();
        match &mut *post {
            PostTarget::Queued(queue) => queue.push(message),
            PostTarget::Live(tx) => {
                if tx.send(message).is_err() {
                    tracing::warn!(cell = %self.id, "worker is gone, dropping control message");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Remotes
    // ------------------------------------------------------------------

    /// Attach a remote to a signal input. Queued if the cell has not
    /// started yet.
    pub fn add_input_remote(&self, name: &str, remote: Remote) -> Result<(), CellError> {
        if !self.kind.has_input(name) {
            return Err(self.no_such(name));
        }
        self.post(CellMessage::AddInputRemote {
            name: name.to_string(),
            remote,
        });
        Ok(())
    }

    /// Attach a remote to a signal output.
    pub fn add_output_remote(&self, name: &str, remote: Remote) -> Result<(), CellError> {
        if !self.kind.has_output(name) {
            return Err(self.no_such(name));
        }
        self.post(CellMessage::AddOutputRemote {
            name: name.to_string(),
            remote,
        });
        Ok(())
    }

    /// Attach a remote to an in-stream.
    pub fn add_in_stream_remote(&self, name: &str, remote: Remote) -> Result<(), CellError> {
        if !self.kind.has_in_stream(name) {
            return Err(self.no_such(name));
        }
        self.post(CellMessage::AddInStreamRemote {
            name: name.to_string(),
            remote,
        });
        Ok(())
    }

    /// Attach a remote to an out-stream.
    pub fn add_out_stream_remote(&self, name: &str, remote: Remote) -> Result<(), CellError> {
        if !self.kind.has_out_stream(name) {
            return Err(self.no_such(name));
        }
        self.post(CellMessage::AddOutStreamRemote {
            name: name.to_string(),
            remote,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed observer ends
    // ------------------------------------------------------------------

    /// Typed writer feeding one of the cell's signal inputs. The first
    /// call attaches an observer end; later calls and clones share it.
    pub fn input<T: Serialize>(&self, name: &str) -> Result<SignalWriter<T>, CellError> {
        if !self.kind.has_input(name) {
            return Err(self.no_such(name));
        }
        let mut ends = self.ends.lock();
        let end = ends
            .input_writers
            .entry(name.to_string())
            .or_insert_with(|| {
                let end = SignalSendEnd::new(ChannelId::new(self.observer_id.clone(), name));
                let (observer_side, cell_side) = port_pair();
                end.add_remote(Remote::new(
                    ChannelId::new(self.id.clone(), name),
                    observer_side,
                ));
                self.post(CellMessage::AddInputRemote {
                    name: name.to_string(),
                    remote: Remote::new(end.id().clone(), cell_side),
                });
                end
            })
            .clone();
        Ok(SignalWriter::new(end))
    }

    /// Keep one of the cell's signal inputs equal to a derived signal.
    /// Sends the current value now and again on every change. The
    /// signal must live in the environment's space; a signal from any
    /// other space only delivers its value at bind time.
    pub fn bind_input<T>(&self, name: &str, signal: &DerivedSignal<T>) -> Result<(), CellError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let writer = self.input::<T>(name)?;
        let forward = {
            let signal = signal.clone();
            let name = name.to_string();
            move || {
                if let Err(error) = writer.set(&signal.get()) {
                    tracing::warn!(input = %name, %error, "input binding failed to encode");
                }
            }
        };
        // The derived handle is dropped; the node itself stays in the
        // space and keeps forwarding.
        self.observer_space.derived(forward)?;
        Ok(())
    }

    /// Detach the observer end feeding a signal input, telling the cell
    /// this sender is gone. A later [`CellController::input`] call
    /// attaches a fresh end.
    pub fn disconnect_input(&self, name: &str) -> Result<(), CellError> {
        if !self.kind.has_input(name) {
            return Err(self.no_such(name));
        }
        if let Some(end) = self.ends.lock().input_writers.shift_remove(name) {
            end.remove_remote(&ChannelId::new(self.id.clone(), name));
        }
        Ok(())
    }

    /// Typed view of one of the cell's signal outputs.
    pub fn output<T: DeserializeOwned>(&self, name: &str) -> Result<SignalView<T>, CellError> {
        let end = self.output_view_end(name)?;
        Ok(SignalView::new(&end))
    }

    /// Typed writer feeding one of the cell's in-streams.
    pub fn in_stream<T: Serialize>(&self, name: &str) -> Result<StreamWriter<T>, CellError> {
        if !self.kind.has_in_stream(name) {
            return Err(self.no_such(name));
        }
        let mut ends = self.ends.lock();
        let end = ends
            .in_stream_writers
            .entry(name.to_string())
            .or_insert_with(|| {
                let end = StreamSendEnd::new(
                    ChannelId::new(self.observer_id.clone(), name),
                    self.config.congestion,
                );
                let (observer_side, cell_side) = port_pair();
                end.add_remote(Remote::new(
                    ChannelId::new(self.id.clone(), name),
                    observer_side,
                ));
                self.post(CellMessage::AddInStreamRemote {
                    name: name.to_string(),
                    remote: Remote::new(end.id().clone(), cell_side),
                });
                end
            })
            .clone();
        Ok(StreamWriter::new(end))
    }

    /// Typed reader over one of the cell's out-streams.
    pub fn out_stream<T: DeserializeOwned>(&self, name: &str) -> Result<StreamReader<T>, CellError> {
        if !self.kind.has_out_stream(name) {
            return Err(self.no_such(name));
        }
        let mut ends = self.ends.lock();
        let end = ends
            .out_stream_readers
            .entry(name.to_string())
            .or_insert_with(|| {
                let end = StreamReceiveEnd::new(ChannelId::new(self.observer_id.clone(), name));
                let (observer_side, cell_side) = port_pair();
                end.add_remote(Remote::new(
                    ChannelId::new(self.id.clone(), name),
                    observer_side,
                ));
                self.post(CellMessage::AddOutStreamRemote {
                    name: name.to_string(),
                    remote: Remote::new(end.id().clone(), cell_side),
                });
                end
            })
            .clone();
        Ok(StreamReader::new(end))
    }

    /// Attach observer views to every declared output and wait until
    /// each has received a value. Afterwards synchronous reads through
    /// [`CellController::output`] see a complete snapshot. Waits for as
    /// long as the cell takes to publish every output.
    pub async fn connect_all_outputs(&self) {
        let ends: Vec<SignalReceiveEnd> = self
            .kind
            .outputs()
            .map(|name| self.ensure_output_view(name))
            .collect();
        join_all(ends.iter().map(|end| end.ready())).await;
    }

    fn output_view_end(&self, name: &str) -> Result<SignalReceiveEnd, CellError> {
        if !self.kind.has_output(name) {
            return Err(self.no_such(name));
        }
        Ok(self.ensure_output_view(name))
    }

    /// Caller has already checked that `name` is a declared output.
    fn ensure_output_view(&self, name: &str) -> SignalReceiveEnd {
        let mut ends = self.ends.lock();
        ends.output_views
            .entry(name.to_string())
            .or_insert_with(|| {
                let end = SignalReceiveEnd::new(
                    ChannelId::new(self.observer_id.clone(), name),
                    self.observer_space.clone(),
                );
                let (cell_side, observer_side) = port_pair();
                self.post(CellMessage::AddOutputRemote {
                    name: name.to_string(),
                    remote: Remote::new(end.id().clone(), cell_side),
                });
                end.add_remote(Remote::new(
                    ChannelId::new(self.id.clone(), name),
                    observer_side,
                ));
                end
            })
            .clone()
    }

    // ------------------------------------------------------------------
    // Piping
    // ------------------------------------------------------------------

    /// Pipe one of this cell's signal outputs into another cell's
    /// input over a fresh duplex pair. Both sides may be attached
    /// before either cell starts.
    pub fn pipe_output_to_input(
        &self,
        output: &str,
        target: &CellController,
        input: &str,
    ) -> Result<(), CellError> {
        if !self.kind.has_output(output) {
            return Err(self.no_such(output));
        }
        if !target.kind.has_input(input) {
            return Err(target.no_such(input));
        }
        let (source_side, target_side) = port_pair();
        self.post(CellMessage::AddOutputRemote {
            name: output.to_string(),
            remote: Remote::new(ChannelId::new(target.id.clone(), input), source_side),
        });
        target.post(CellMessage::AddInputRemote {
            name: input.to_string(),
            remote: Remote::new(ChannelId::new(self.id.clone(), output), target_side),
        });
        Ok(())
    }

    /// Pipe one of this cell's out-streams into another cell's
    /// in-stream.
    pub fn pipe_out_stream_to_in_stream(
        &self,
        out_stream: &str,
        target: &CellController,
        in_stream: &str,
    ) -> Result<(), CellError> {
        if !self.kind.has_out_stream(out_stream) {
            return Err(self.no_such(out_stream));
        }
        if !target.kind.has_in_stream(in_stream) {
            return Err(target.no_such(in_stream));
        }
        let (source_side, target_side) = port_pair();
        self.post(CellMessage::AddOutStreamRemote {
            name: out_stream.to_string(),
            remote: Remote::new(ChannelId::new(target.id.clone(), in_stream), source_side),
        });
        target.post(CellMessage::AddInStreamRemote {
            name: in_stream.to_string(),
            remote: Remote::new(ChannelId::new(self.id.clone(), out_stream), target_side),
        });
        Ok(())
    }

    /// Mirror of [`CellController::pipe_output_to_input`], written from
    /// the receiving side.
    pub fn pipe_input_from(
        &self,
        input: &str,
        source: &CellController,
        output: &str,
    ) -> Result<(), CellError> {
        source.pipe_output_to_input(output, self, input)
    }

    /// Mirror of [`CellController::pipe_out_stream_to_in_stream`],
    /// written from the receiving side.
    pub fn pipe_in_stream_from(
        &self,
        in_stream: &str,
        source: &CellController,
        out_stream: &str,
    ) -> Result<(), CellError> {
        source.pipe_out_stream_to_in_stream(out_stream, self, in_stream)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Ask the run future to wind down. Takes effect on the cell's own
    /// schedule; await [`CellController::finished`] for the end.
    pub fn request_finish(&self) {
        self.post(CellMessage::FinishRequest);
    }

    /// Resolves once the cell has stopped.
    pub async fn finished(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| s.is_stopped()).await;
    }

    /// Abort the worker without waiting for run to cooperate. The run
    /// future is dropped at its current await point. A force-stopped
    /// cell cannot be started again.
    pub fn force_stop(&self) {
        self.run.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.status.send_replace(CellStatus::Stopped);
        tracing::debug!(cell = %self.id, "force stopped");
    }

    fn no_such(&self, name: &str) -> CellError {
        ChannelError::NoSuchChannel {
            channel: ChannelId::new(self.id.clone(), name).to_string(),
        }
        .into()
    }
}

impl std::fmt::Debug for CellController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellController")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::CellScope;
    use futures_util::FutureExt;

    fn controller(kind: CellKind, run: CellRun) -> CellController {
        let name = kind.name().to_string();
        CellController::new(
            CellId::new(name),
            kind,
            run,
            SignalSpace::new(),
            EnvConfig::default(),
        )
    }

    fn echo_run() -> CellRun {
        Box::new(|scope: CellScope| {
            async move {
                let seed = scope.input::<i32>("seed").await?;
                let echoed = {
                    let seed = seed.clone();
                    scope.space().derived(move || seed.get())?
                };
                scope.bind_output("echo", echoed)?;
                scope.finish_requested().await;
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn values_written_before_start_reach_the_cell() {
        let kind = CellKind::new("echo").input("seed").output("echo");
        let cell = controller(kind, echo_run());

        let writer = cell.input::<i32>("seed").unwrap();
        writer.set(&11).unwrap();
        let mut view = cell.output::<i32>("echo").unwrap();

        cell.start().await.unwrap();
        assert_eq!(cell.status(), CellStatus::Running);

        view.ready().await;
        assert_eq!(view.get(), Some(11));

        writer.set(&12).unwrap();
        assert_eq!(view.changed().await, Some(12));

        cell.request_finish();
        cell.finished().await;
        assert_eq!(cell.status(), CellStatus::Stopped);
    }

    #[tokio::test]
    async fn starting_twice_errors() {
        let cell = controller(
            CellKind::new("solo"),
            Box::new(|scope: CellScope| {
                async move {
                    scope.finish_requested().await;
                    Ok(())
                }
                .boxed()
            }),
        );
        cell.start().await.unwrap();
        let err = cell.start().await.unwrap_err();
        assert!(matches!(err, CellError::AlreadyStarted { .. }));
        cell.request_finish();
        cell.finished().await;
    }

    #[tokio::test]
    async fn undeclared_channel_names_are_rejected_before_posting() {
        let cell = controller(
            CellKind::new("solo"),
            Box::new(|_scope: CellScope| async move { Ok(()) }.boxed()),
        );
        assert!(cell.input::<i32>("ghost").is_err());
        assert!(cell.output::<i32>("ghost").is_err());
        assert!(cell.in_stream::<i32>("ghost").is_err());
        assert!(cell.out_stream::<i32>("ghost").is_err());
        let (side_a, _side_b) = port_pair();
        let remote = Remote::new(ChannelId::new(CellId::new("nobody"), "ghost"), side_a);
        assert!(cell.add_input_remote("ghost", remote).is_err());
    }

    #[tokio::test]
    async fn force_stop_aborts_and_bars_a_restart() {
        let cell = controller(
            CellKind::new("stuck"),
            Box::new(|_scope: CellScope| {
                async move {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                .boxed()
            }),
        );
        cell.start().await.unwrap();
        assert_eq!(cell.status(), CellStatus::Running);

        cell.force_stop();
        assert_eq!(cell.status(), CellStatus::Stopped);
        assert!(matches!(
            cell.start().await,
            Err(CellError::AlreadyStarted { .. })
        ));
    }

    #[tokio::test]
    async fn a_bound_input_follows_its_signal() {
        let space = SignalSpace::new();
        let kind = CellKind::new("echo").input("seed").output("echo");
        let cell = CellController::new(
            CellId::new("echo"),
            kind,
            echo_run(),
            space.clone(),
            EnvConfig::default(),
        );

        let source = space.setable(21);
        let forwarded = {
            let source = source.clone();
            space.derived(move || source.get()).unwrap()
        };
        cell.bind_input("seed", &forwarded).unwrap();

        let mut view = cell.output::<i32>("echo").unwrap();
        cell.start().await.unwrap();
        view.ready().await;
        assert_eq!(view.get(), Some(21));

        source.set(22).unwrap();
        assert_eq!(view.changed().await, Some(22));

        cell.request_finish();
        cell.finished().await;
    }

    #[tokio::test]
    async fn disconnecting_an_input_allows_a_fresh_attachment() {
        let kind = CellKind::new("echo").input("seed").output("echo");
        let cell = controller(kind, echo_run());

        let stale = cell.input::<i32>("seed").unwrap();
        stale.set(&1).unwrap();
        let mut view = cell.output::<i32>("echo").unwrap();
        cell.start().await.unwrap();
        view.ready().await;
        assert_eq!(view.get(), Some(1));

        cell.disconnect_input("seed").unwrap();
        assert!(cell.disconnect_input("ghost").is_err());

        let replacement = cell.input::<i32>("seed").unwrap();
        replacement.set(&2).unwrap();
        assert_eq!(view.changed().await, Some(2));

        // The stale writer's end has no remotes left, so this value
        // goes nowhere.
        stale.set(&3).unwrap();
        replacement.set(&4).unwrap();
        assert_eq!(view.changed().await, Some(4));

        cell.request_finish();
        cell.finished().await;
    }
}

//! Cell Worker
//!
//! One spawned task per started cell. The worker owns the cell's
//! lifecycle end to end: it waits for the start order, builds the
//! channel ends its kind declares, gates on every signal input holding
//! a value, drives the run future, and tears the cell down when run
//! returns or a finish is requested.
//!
//! Control messages arrive on an unbounded channel and are handled at
//! every phase, so remotes can be attached before the gate opens, while
//! run executes, or never at all. Status is published on a watch
//! channel; the transitions themselves are the worker's notifications.

use std::sync::Arc;

use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::channels::{
    CellId, ChannelId, CongestionControlConfig, Remote, SignalReceiveEnd, SignalSendEnd,
    StreamReceiveEnd, StreamSendEnd,
};
use crate::signals::SignalSpace;

use super::kind::CellKind;
use super::scope::{CellRun, CellScope};
use super::status::CellStatus;

/// Orders a controller can post to its worker. Attach messages carry a
/// live port, so these never cross a process boundary.
#[derive(Debug)]
pub(crate) enum CellMessage {
    StartCellRun,
    FinishRequest,
    AddInputRemote { name: String, remote: Remote },
    AddOutputRemote { name: String, remote: Remote },
    AddInStreamRemote { name: String, remote: Remote },
    AddOutStreamRemote { name: String, remote: Remote },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerConfig {
    /// Attaching to an undeclared channel shuts the cell down instead
    /// of being logged and dropped.
    pub strict_channels: bool,
    pub congestion: CongestionControlConfig,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Shutdown,
}

pub(crate) async fn run_worker(
    cell_id: CellId,
    kind: CellKind,
    run: CellRun,
    mut control: mpsc::UnboundedReceiver<CellMessage>,
    status: watch::Sender<CellStatus>,
    config: WorkerConfig,
) {
    // Nothing happens until the start order; anything else this early
    // is a controller bug.
    loop {
        match control.recv().await {
            Some(CellMessage::StartCellRun) => break,
            Some(message) => {
                tracing::warn!(cell = %cell_id, ?message, "control message before the start order, dropping it")
            }
            None => return,
        }
    }
    status.send_replace(CellStatus::StartingWaitingForInputs);
    tracing::debug!(cell = %cell_id, "start order received, waiting for inputs");

    let space = SignalSpace::new();
    let (finish_tx, finish_rx) = watch::channel(false);

    let inputs: IndexMap<String, SignalReceiveEnd> = kind
        .inputs()
        .map(|name| {
            let id = ChannelId::new(cell_id.clone(), name);
            (name.to_string(), SignalReceiveEnd::new(id, space.clone()))
        })
        .collect();
    let outputs: IndexMap<String, SignalSendEnd> = kind
        .outputs()
        .map(|name| {
            let id = ChannelId::new(cell_id.clone(), name);
            (name.to_string(), SignalSendEnd::new(id))
        })
        .collect();
    let in_streams: IndexMap<String, StreamReceiveEnd> = kind
        .in_streams()
        .map(|name| {
            let id = ChannelId::new(cell_id.clone(), name);
            (name.to_string(), StreamReceiveEnd::new(id))
        })
        .collect();
    let out_streams: IndexMap<String, StreamSendEnd> = kind
        .out_streams()
        .map(|name| {
            let id = ChannelId::new(cell_id.clone(), name);
            (name.to_string(), StreamSendEnd::new(id, config.congestion))
        })
        .collect();

    let scope = CellScope {
        cell_id: cell_id.clone(),
        space: space.clone(),
        inputs,
        outputs,
        in_streams,
        out_streams,
        bindings: Arc::new(Mutex::new(Vec::new())),
        finish: finish_rx,
    };

    // Messages queued before the start order land before the input
    // gate, so wiring posted to a not-yet-started cell is in place by
    // the time run begins even when the gate is empty.
    while let Ok(message) = control.try_recv() {
        if handle_control(&cell_id, &scope, &finish_tx, &status, &config, message)
            == Flow::Shutdown
        {
            status.send_replace(CellStatus::Stopped);
            return;
        }
    }

    // Input gate: run does not start until every signal input has
    // received at least one value. Control keeps being served so the
    // attachments that will deliver those values can still arrive.
    {
        let gates = join_all(scope.inputs.values().map(|end| {
            let end = end.clone();
            async move { end.ready().await }
        }));
        tokio::pin!(gates);
        loop {
            tokio::select! {
                _ = &mut gates => break,
                message = control.recv() => match message {
                    Some(message) => {
                        if handle_control(&cell_id, &scope, &finish_tx, &status, &config, message)
                            == Flow::Shutdown
                        {
                            status.send_replace(CellStatus::Stopped);
                            return;
                        }
                    }
                    None => {
                        status.send_replace(CellStatus::Stopped);
                        tracing::debug!(cell = %cell_id, "controller gone before inputs arrived, stopping");
                        return;
                    }
                }
            }
        }
    }

    status.send_replace(CellStatus::Running);
    tracing::debug!(cell = %cell_id, "all inputs received, running");

    let mut run_future = run(scope.clone());
    let mut space_updates = space.updates();
    let mut control_open = true;
    loop {
        tokio::select! {
            result = &mut run_future => {
                if let Err(error) = result {
                    tracing::error!(cell = %cell_id, %error, "cell run failed");
                }
                break;
            }
            message = control.recv(), if control_open => match message {
                Some(message) => {
                    if handle_control(&cell_id, &scope, &finish_tx, &status, &config, message)
                        == Flow::Shutdown
                    {
                        break;
                    }
                }
                None => {
                    // Controller dropped: treat it as a finish request
                    // and let run wind down on its own.
                    control_open = false;
                    finish_tx.send_replace(true);
                    if *status.borrow() == CellStatus::Running {
                        status.send_replace(CellStatus::Stopping);
                    }
                }
            },
            _ = space_updates.changed() => {
                for binding in scope.bindings.lock().iter() {
                    binding.flush();
                }
            }
        }
    }

    if *status.borrow() != CellStatus::Stopping {
        status.send_replace(CellStatus::Stopping);
    }
    tracing::debug!(cell = %cell_id, "run finished, stopping");

    // Last flush so values written right before run returned go out,
    // then end every out-stream so readers see the close.
    for binding in scope.bindings.lock().iter() {
        binding.flush();
    }
    for stream in scope.out_streams.values() {
        stream.done();
    }
    status.send_replace(CellStatus::Stopped);
    tracing::debug!(cell = %cell_id, "stopped");
}

fn handle_control(
    cell_id: &CellId,
    scope: &CellScope,
    finish: &watch::Sender<bool>,
    status: &watch::Sender<CellStatus>,
    config: &WorkerConfig,
    message: CellMessage,
) -> Flow {
    match message {
        CellMessage::StartCellRun => {
            tracing::warn!(cell = %cell_id, "duplicate start order, ignoring it");
            Flow::Continue
        }
        CellMessage::FinishRequest => {
            finish.send_replace(true);
            if *status.borrow() == CellStatus::Running {
                status.send_replace(CellStatus::Stopping);
            }
            tracing::debug!(cell = %cell_id, "finish requested");
            Flow::Continue
        }
        CellMessage::AddInputRemote { name, remote } => match scope.inputs.get(&name) {
            Some(end) => {
                end.add_remote(remote);
                Flow::Continue
            }
            None => undeclared(cell_id, config, "input", &name),
        },
        CellMessage::AddOutputRemote { name, remote } => match scope.outputs.get(&name) {
            Some(end) => {
                end.add_remote(remote);
                Flow::Continue
            }
            None => undeclared(cell_id, config, "output", &name),
        },
        CellMessage::AddInStreamRemote { name, remote } => match scope.in_streams.get(&name) {
            Some(end) => {
                end.add_remote(remote);
                Flow::Continue
            }
            None => undeclared(cell_id, config, "in-stream", &name),
        },
        CellMessage::AddOutStreamRemote { name, remote } => match scope.out_streams.get(&name) {
            Some(end) => {
                end.add_remote(remote);
                Flow::Continue
            }
            None => undeclared(cell_id, config, "out-stream", &name),
        },
    }
}

fn undeclared(cell_id: &CellId, config: &WorkerConfig, channel_kind: &str, name: &str) -> Flow {
    tracing::error!(cell = %cell_id, kind = channel_kind, channel = name, "attach to an undeclared channel");
    if config.strict_channels {
        tracing::error!(cell = %cell_id, "strict channel mode, shutting the cell down");
        Flow::Shutdown
    } else {
        Flow::Continue
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::port_pair;
    use crate::errors::CellError;
    use futures_util::FutureExt;

    fn worker_config(strict: bool) -> WorkerConfig {
        WorkerConfig {
            strict_channels: strict,
            congestion: CongestionControlConfig::default(),
        }
    }

    fn spawn_worker(
        kind: CellKind,
        strict: bool,
        run: CellRun,
    ) -> (
        mpsc::UnboundedSender<CellMessage>,
        watch::Receiver<CellStatus>,
    ) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CellStatus::NotStarted);
        tokio::spawn(run_worker(
            CellId::new("probe"),
            kind,
            run,
            control_rx,
            status_tx,
            worker_config(strict),
        ));
        (control_tx, status_rx)
    }

    fn wait_for_finish() -> CellRun {
        Box::new(|scope: CellScope| {
            async move {
                scope.finish_requested().await;
                Ok::<(), CellError>(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn a_cell_without_inputs_runs_and_stops_on_finish() {
        let (control, mut status) = spawn_worker(CellKind::new("probe"), false, wait_for_finish());

        control.send(CellMessage::StartCellRun).unwrap();
        status.wait_for(|s| *s == CellStatus::Running).await.unwrap();

        control.send(CellMessage::FinishRequest).unwrap();
        status.wait_for(|s| *s == CellStatus::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn the_gate_holds_until_every_input_has_a_value() {
        let kind = CellKind::new("probe").input("seed");
        let (control, mut status) = spawn_worker(kind, false, wait_for_finish());

        control.send(CellMessage::StartCellRun).unwrap();
        status
            .wait_for(|s| *s == CellStatus::StartingWaitingForInputs)
            .await
            .unwrap();

        // Feed the input through a real send end; the replayed value
        // opens the gate.
        let feeder = SignalSendEnd::new(ChannelId::new(CellId::new("feeder"), "seed"));
        feeder.set(&7_i32).unwrap();
        let (feeder_side, cell_side) = port_pair();
        feeder.add_remote(Remote::new(
            ChannelId::new(CellId::new("probe"), "seed"),
            feeder_side,
        ));
        control
            .send(CellMessage::AddInputRemote {
                name: String::from("seed"),
                remote: Remote::new(feeder.id().clone(), cell_side),
            })
            .unwrap();

        status.wait_for(|s| *s == CellStatus::Running).await.unwrap();
        control.send(CellMessage::FinishRequest).unwrap();
        status.wait_for(|s| *s == CellStatus::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn strict_mode_stops_the_cell_on_an_undeclared_attach() {
        let (control, mut status) = spawn_worker(CellKind::new("probe"), true, wait_for_finish());

        control.send(CellMessage::StartCellRun).unwrap();
        status.wait_for(|s| *s == CellStatus::Running).await.unwrap();

        let (side_a, _side_b) = port_pair();
        control
            .send(CellMessage::AddInputRemote {
                name: String::from("ghost"),
                remote: Remote::new(ChannelId::new(CellId::new("nobody"), "ghost"), side_a),
            })
            .unwrap();

        status.wait_for(|s| *s == CellStatus::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn lenient_mode_drops_an_undeclared_attach_and_keeps_running() {
        let (control, mut status) = spawn_worker(CellKind::new("probe"), false, wait_for_finish());

        control.send(CellMessage::StartCellRun).unwrap();
        status.wait_for(|s| *s == CellStatus::Running).await.unwrap();

        let (side_a, _side_b) = port_pair();
        control
            .send(CellMessage::AddInputRemote {
                name: String::from("ghost"),
                remote: Remote::new(ChannelId::new(CellId::new("nobody"), "ghost"), side_a),
            })
            .unwrap();

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*status.borrow(), CellStatus::Running);

        control.send(CellMessage::FinishRequest).unwrap();
        status.wait_for(|s| *s == CellStatus::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_controller_requests_a_finish() {
        let (control, mut status) = spawn_worker(CellKind::new("probe"), false, wait_for_finish());

        control.send(CellMessage::StartCellRun).unwrap();
        status.wait_for(|s| *s == CellStatus::Running).await.unwrap();

        drop(control);
        status.wait_for(|s| *s == CellStatus::Stopped).await.unwrap();
    }
}

//! Stream Channel Ends
//!
//! A stream channel carries an ordered sequence of elements between
//! cells, ending with an explicit end-of-stream. The send end fans out
//! to its remotes in attach order; the receive end fans in, queueing
//! elements from all senders and closing once every sender has ended.
//!
//! # Congestion
//!
//! Delivery is credit-based per remote. The receive end acknowledges an
//! element when it is consumed, not when it arrives, so the window
//! tracks the receiver's actual pace. Once a remote has
//! `pause_from_unacknowledged_count` elements outstanding, `send`
//! suspends before posting to it and resumes when the backlog falls to
//! `resume_at_unacknowledged_count`. Because remotes are served in
//! attach order, one congested remote delays delivery to those after
//! it.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::errors::ChannelError;

use super::event_queue::EventQueue;
use super::messages::{ChannelId, ChannelMessage, Payload, Remote};

/// Window thresholds for one stream send end.
#[derive(Debug, Clone, Copy)]
pub struct CongestionControlConfig {
    /// Suspend sending to a remote once this many elements are
    /// unacknowledged.
    pub pause_from_unacknowledged_count: u32,
    /// Resume once the unacknowledged backlog falls to this.
    pub resume_at_unacknowledged_count: u32,
}

impl Default for CongestionControlConfig {
    fn default() -> Self {
        Self {
            pause_from_unacknowledged_count: 20,
            resume_at_unacknowledged_count: 10,
        }
    }
}

// ----------------------------------------------------------------------------
// Send end
// ----------------------------------------------------------------------------

struct CongestionWindow {
    last_acknowledged_index: u64,
    unacknowledged: u32,
    /// Parked `send` waiting for this window to drain.
    resume: Option<oneshot::Sender<()>>,
}

struct StreamRemote {
    peer: ChannelId,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    window: CongestionWindow,
    listener: JoinHandle<()>,
}

struct StreamSendState {
    next_index: u64,
    remotes: SmallVec<[StreamRemote; 2]>,
    done: bool,
}

/// The writing end of a stream channel. Clones share the end.
pub struct StreamSendEnd {
    id: ChannelId,
    config: CongestionControlConfig,
    state: Arc<Mutex<StreamSendState>>,
}

impl StreamSendEnd {
    pub fn new(id: ChannelId, config: CongestionControlConfig) -> Self {
        Self {
            id,
            config,
            state: Arc::new(Mutex::new(StreamSendState {
                next_index: 0,
                remotes: SmallVec::new(),
                done: false,
            })),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub fn remote_count(&self) -> usize {
        self.state.lock().remotes.len()
    }

    /// Encode and send one element, suspending on congested remotes.
    pub async fn send<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        self.send_payload(Payload::encode(value)?).await
    }

    /// Send one element to every attached remote, in attach order.
    /// Suspends in front of any remote whose window is full.
    pub async fn send_payload(&self, value: Payload) -> Result<(), ChannelError> {
        let (index, peers) = {
            let mut st = self.state.lock();
            if st.done {
                return Err(ChannelError::SendOnDoneStream);
            }
            st.next_index += 1;
            let peers: Vec<ChannelId> = st.remotes.iter().map(|r| r.peer.clone()).collect();
            (st.next_index, peers)
        };

        for peer in peers {
            loop {
                let wait = {
                    let mut st = self.state.lock();
                    if st.done {
                        return Err(ChannelError::SendOnDoneStream);
                    }
                    // Detached while we were paused: nothing to deliver.
                    let Some(pos) = st.remotes.iter().position(|r| r.peer == peer) else {
                        break;
                    };
                    let remote = &mut st.remotes[pos];
                    if remote.window.unacknowledged
                        >= self.config.pause_from_unacknowledged_count
                    {
                        let (resume, parked) = oneshot::channel();
                        remote.window.resume = Some(resume);
                        tracing::trace!(
                            peer = %peer,
                            unacknowledged = remote.window.unacknowledged,
                            "stream send pausing on a full window"
                        );
                        Some(parked)
                    } else {
                        remote.window.unacknowledged += 1;
                        let delivered = remote
                            .tx
                            .send(ChannelMessage::AddStreamValue {
                                stream_id: peer.clone(),
                                index,
                                value: value.clone(),
                            })
                            .is_ok();
                        if !delivered {
                            tracing::warn!(peer = %peer, "stream remote vanished, detaching it");
                            st.remotes.remove(pos);
                        }
                        None
                    }
                };
                match wait {
                    Some(parked) => {
                        // Woken by feedback, detach, or done; re-check.
                        let _ = parked.await;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// End the stream: every remote gets `EndStream`, parked senders
    /// wake up and fail, and later sends fail outright.
    pub fn done(&self) {
        let mut st = self.state.lock();
        if st.done {
            return;
        }
        st.done = true;
        for remote in st.remotes.iter_mut() {
            let _ = remote.tx.send(ChannelMessage::EndStream {
                stream_id: remote.peer.clone(),
            });
            if let Some(resume) = remote.window.resume.take() {
                let _ = resume.send(());
            }
        }
    }

    /// Attach a remote receive end. Elements already sent are not
    /// replayed; the remote's window starts at the current position.
    pub fn add_remote(&self, remote: Remote) {
        let Remote {
            channel_id: peer,
            port,
            ..
        } = remote;
        let (tx, rx) = port.split();

        let mut st = self.state.lock();
        if st.done {
            let _ = tx.send(ChannelMessage::EndStream {
                stream_id: peer.clone(),
            });
            return;
        }
        let listener = tokio::spawn(Self::listen(
            Arc::clone(&self.state),
            self.id.clone(),
            peer.clone(),
            self.config.resume_at_unacknowledged_count,
            rx,
        ));
        let last_acknowledged_index = st.next_index;
        st.remotes.push(StreamRemote {
            peer,
            tx,
            window: CongestionWindow {
                last_acknowledged_index,
                unacknowledged: 0,
                resume: None,
            },
            listener,
        });
    }

    pub fn remove_remote(&self, peer: &ChannelId) {
        let mut st = self.state.lock();
        if let Some(pos) = st.remotes.iter().position(|r| &r.peer == peer) {
            let mut remote = st.remotes.remove(pos);
            let _ = remote.tx.send(ChannelMessage::Closed {
                channel_id: self.id.clone(),
            });
            remote.listener.abort();
            if let Some(resume) = remote.window.resume.take() {
                let _ = resume.send(());
            }
        }
    }

    /// Apply congestion feedback from one remote.
    async fn listen(
        state: Arc<Mutex<StreamSendState>>,
        own: ChannelId,
        peer: ChannelId,
        resume_at: u32,
        mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            match message {
                ChannelMessage::CongestionFeedback { stream_id, index } => {
                    if stream_id != own {
                        let error = ChannelError::CrossedChannelIds {
                            expected: own.clone(),
                            got: stream_id,
                        };
                        tracing::error!(%error, "detaching remote from stream send end");
                        break;
                    }
                    let mut st = state.lock();
                    let Some(remote) = st.remotes.iter_mut().find(|r| r.peer == peer) else {
                        break;
                    };
                    let window = &mut remote.window;
                    if index > window.last_acknowledged_index {
                        let acknowledged = (index - window.last_acknowledged_index) as u32;
                        window.last_acknowledged_index = index;
                        window.unacknowledged =
                            window.unacknowledged.saturating_sub(acknowledged);
                        tracing::trace!(
                            peer = %peer,
                            index,
                            unacknowledged = window.unacknowledged,
                            "stream feedback applied"
                        );
                        if window.unacknowledged <= resume_at {
                            if let Some(resume) = window.resume.take() {
                                let _ = resume.send(());
                            }
                        }
                    }
                }
                ChannelMessage::Closed { .. } => break,
                other => {
                    tracing::warn!(channel = %own, message = ?other, "unexpected message on stream send end")
                }
            }
        }

        let mut st = state.lock();
        if let Some(pos) = st.remotes.iter().position(|r| r.peer == peer) {
            let mut remote = st.remotes.remove(pos);
            if let Some(resume) = remote.window.resume.take() {
                let _ = resume.send(());
            }
        }
    }
}

impl Clone for StreamSendEnd {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            config: self.config,
            state: Arc::clone(&self.state),
        }
    }
}

impl std::fmt::Debug for StreamSendEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("StreamSendEnd")
            .field("id", &self.id)
            .field("sent", &st.next_index)
            .field("done", &st.done)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Receive end
// ----------------------------------------------------------------------------

struct StreamItem {
    index: u64,
    value: Payload,
    /// Port back to the sender, for consumption acknowledgements.
    ack_to: mpsc::UnboundedSender<ChannelMessage>,
    /// The sender's channel id, used to stamp the acknowledgement.
    ack_id: ChannelId,
}

struct RecvRemote {
    peer: ChannelId,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    pump: JoinHandle<()>,
}

struct StreamRecvState {
    remotes: SmallVec<[RecvRemote; 2]>,
}

/// The reading end of a stream channel: one queue fanned into by every
/// attached sender. Closes when the last attached sender ends.
pub struct StreamReceiveEnd {
    id: ChannelId,
    queue: EventQueue<StreamItem>,
    state: Arc<Mutex<StreamRecvState>>,
}

impl StreamReceiveEnd {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            queue: EventQueue::new(),
            state: Arc::new(Mutex::new(StreamRecvState {
                remotes: SmallVec::new(),
            })),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn remote_count(&self) -> usize {
        self.state.lock().remotes.len()
    }

    /// Queued elements not yet consumed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn add_remote(&self, remote: Remote) {
        if self.queue.is_closed() {
            tracing::warn!(channel = %self.id, "stream already ended, ignoring new remote");
            return;
        }
        let Remote {
            channel_id: peer,
            port,
            ..
        } = remote;
        let (tx, rx) = port.split();
        let pump = tokio::spawn(Self::pump(
            self.id.clone(),
            self.queue.clone(),
            Arc::clone(&self.state),
            peer.clone(),
            tx.clone(),
            rx,
        ));
        self.state.lock().remotes.push(RecvRemote { peer, tx, pump });
    }

    pub fn remove_remote(&self, peer: &ChannelId) {
        let mut st = self.state.lock();
        if let Some(pos) = st.remotes.iter().position(|r| &r.peer == peer) {
            let remote = st.remotes.remove(pos);
            let _ = remote.tx.send(ChannelMessage::Closed {
                channel_id: self.id.clone(),
            });
            remote.pump.abort();
            if st.remotes.is_empty() {
                self.queue.close();
            }
        }
    }

    /// Take the next element and acknowledge it to its sender. `None`
    /// once every sender has ended and the queue is drained.
    pub async fn next_payload(&self) -> Option<Payload> {
        let item = self.queue.next().await?;
        let _ = item.ack_to.send(ChannelMessage::CongestionFeedback {
            stream_id: item.ack_id,
            index: item.index,
        });
        Some(item.value)
    }

    /// Typed read. An element that does not decode as `T` is logged,
    /// acknowledged, and skipped.
    pub async fn next<T: DeserializeOwned>(&self) -> Option<T> {
        loop {
            let payload = self.next_payload().await?;
            match payload.decode() {
                Ok(value) => return Some(value),
                Err(error) => {
                    tracing::warn!(channel = %self.id, %error, "dropping undecodable stream element")
                }
            }
        }
    }

    async fn pump(
        id: ChannelId,
        queue: EventQueue<StreamItem>,
        state: Arc<Mutex<StreamRecvState>>,
        peer: ChannelId,
        ack_to: mpsc::UnboundedSender<ChannelMessage>,
        mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            match message {
                ChannelMessage::AddStreamValue {
                    stream_id,
                    index,
                    value,
                } => {
                    if stream_id != id {
                        let error = ChannelError::CrossedChannelIds {
                            expected: id.clone(),
                            got: stream_id,
                        };
                        tracing::error!(%error, "detaching remote from stream receive end");
                        break;
                    }
                    queue.push(StreamItem {
                        index,
                        value,
                        ack_to: ack_to.clone(),
                        ack_id: peer.clone(),
                    });
                }
                ChannelMessage::EndStream { stream_id } => {
                    if stream_id != id {
                        let error = ChannelError::CrossedChannelIds {
                            expected: id.clone(),
                            got: stream_id,
                        };
                        tracing::error!(%error, "mis-stamped end of stream");
                    }
                    break;
                }
                ChannelMessage::Closed { .. } => break,
                other => {
                    tracing::warn!(channel = %id, message = ?other, "unexpected message on stream receive end")
                }
            }
        }

        // The last sender leaving closes the stream; buffered elements
        // still drain.
        let mut st = state.lock();
        st.remotes.retain(|r| r.peer != peer);
        if st.remotes.is_empty() {
            queue.close();
        }
    }
}

impl Clone for StreamReceiveEnd {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            queue: self.queue.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl std::fmt::Debug for StreamReceiveEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiveEnd")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Typed wrappers
// ----------------------------------------------------------------------------

/// Typed writer over a [`StreamSendEnd`].
pub struct StreamWriter<T> {
    end: StreamSendEnd,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> StreamWriter<T> {
    pub fn new(end: StreamSendEnd) -> Self {
        Self {
            end,
            _marker: PhantomData,
        }
    }

    pub async fn send(&self, value: &T) -> Result<(), ChannelError> {
        self.end.send(value).await
    }

    pub fn done(&self) {
        self.end.done();
    }

    pub fn end(&self) -> &StreamSendEnd {
        &self.end
    }
}

/// Typed reader over a [`StreamReceiveEnd`].
pub struct StreamReader<T> {
    end: StreamReceiveEnd,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamReader<T> {
    pub fn new(end: StreamReceiveEnd) -> Self {
        Self {
            end,
            _marker: PhantomData,
        }
    }

    pub async fn next(&self) -> Option<T> {
        self.end.next::<T>().await
    }

    pub fn end(&self) -> &StreamReceiveEnd {
        &self.end
    }
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            end: self.end.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for StreamReader<T> {
    fn clone(&self) -> Self {
        Self {
            end: self.end.clone(),
            _marker: PhantomData,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

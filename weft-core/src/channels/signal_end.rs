//! Signal Channel Ends
//!
//! A signal channel carries "the latest value of something" between
//! cells. The send end fans out to any number of attached remotes and
//! keeps the last value so a remote attached late is caught up
//! immediately. The receive end fans in from any number of senders,
//! materializes the newest payload as a setable signal in its cell's
//! space, and exposes a ready gate that opens on first arrival.
//!
//! Message stamps are checked on the receiving side: a message whose
//! channel id does not match the end it arrived at is a wiring fault,
//! logged as an error, and the offending remote is detached.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use smallvec::SmallVec;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::errors::ChannelError;
use crate::signals::{SetableSignal, SignalSpace};

use super::messages::{ChannelId, ChannelMessage, Payload, Remote};

// ----------------------------------------------------------------------------
// Send end
// ----------------------------------------------------------------------------

struct SendRemote {
    peer: ChannelId,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    listener: JoinHandle<()>,
}

struct SendState {
    last: Option<Payload>,
    remotes: SmallVec<[SendRemote; 2]>,
}

/// The writing end of a signal channel.
pub struct SignalSendEnd {
    id: ChannelId,
    state: Arc<Mutex<SendState>>,
}

impl SignalSendEnd {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(SendState {
                last: None,
                remotes: SmallVec::new(),
            })),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Encode and publish a value.
    pub fn set<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        self.set_payload(Payload::encode(value)?);
        Ok(())
    }

    /// Publish an already-encoded value to every attached remote and
    /// remember it for late attachments. A value byte-equal to the last
    /// one is dropped here; signal channels carry state, not events.
    pub fn set_payload(&self, value: Payload) {
        let mut st = self.state.lock();
        if st.last.as_ref() == Some(&value) {
            return;
        }
        st.last = Some(value.clone());
        st.remotes.retain(|remote| {
            let delivered = remote
                .tx
                .send(ChannelMessage::SetSignalValue {
                    signal_id: remote.peer.clone(),
                    value: value.clone(),
                })
                .is_ok();
            if !delivered {
                tracing::warn!(peer = %remote.peer, "signal remote vanished, detaching it");
            }
            delivered
        });
    }

    /// Attach a remote receive end. The last published value, if any,
    /// is replayed to it at once.
    pub fn add_remote(&self, remote: Remote) {
        let Remote {
            channel_id: peer,
            port,
            ..
        } = remote;
        let (tx, rx) = port.split();

        let mut st = self.state.lock();
        if let Some(last) = &st.last {
            let replayed = tx.send(ChannelMessage::SetSignalValue {
                signal_id: peer.clone(),
                value: last.clone(),
            });
            if replayed.is_err() {
                tracing::warn!(peer = %peer, "signal remote closed before attach completed");
                return;
            }
        }
        let listener = tokio::spawn(Self::listen(
            Arc::clone(&self.state),
            self.id.clone(),
            peer.clone(),
            rx,
        ));
        st.remotes.push(SendRemote { peer, tx, listener });
    }

    /// Detach a remote, telling it this end is gone.
    pub fn remove_remote(&self, peer: &ChannelId) {
        let mut st = self.state.lock();
        if let Some(pos) = st.remotes.iter().position(|r| &r.peer == peer) {
            let remote = st.remotes.remove(pos);
            let _ = remote.tx.send(ChannelMessage::Closed {
                channel_id: self.id.clone(),
            });
            remote.listener.abort();
        }
    }

    pub fn remote_count(&self) -> usize {
        self.state.lock().remotes.len()
    }

    pub(crate) fn last_payload(&self) -> Option<Payload> {
        self.state.lock().last.clone()
    }

    /// Drain the port's back-channel. Signal flow is one-way; only a
    /// peer's `Closed` is meaningful here.
    async fn listen(
        state: Arc<Mutex<SendState>>,
        own: ChannelId,
        peer: ChannelId,
        mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            match message {
                ChannelMessage::Closed { .. } => break,
                other => {
                    tracing::warn!(channel = %own, message = ?other, "unexpected message on signal send end")
                }
            }
        }
        state.lock().remotes.retain(|r| r.peer != peer);
    }
}

impl Clone for SignalSendEnd {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl std::fmt::Debug for SignalSendEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSendEnd")
            .field("id", &self.id)
            .field("remotes", &self.remote_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Receive end
// ----------------------------------------------------------------------------

struct ReceiveRemote {
    peer: ChannelId,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    pump: JoinHandle<()>,
}

struct ReceiveState {
    signal: Option<SetableSignal<Payload>>,
    remotes: SmallVec<[ReceiveRemote; 2]>,
}

struct ReceiveShared {
    id: ChannelId,
    space: SignalSpace,
    state: Mutex<ReceiveState>,
    /// Flips to true on the first applied value and stays true.
    ready: watch::Sender<bool>,
    /// Bumped once per applied value.
    version: watch::Sender<u64>,
}

impl ReceiveShared {
    fn apply(&self, value: Payload) {
        let existing = {
            let mut st = self.state.lock();
            match &st.signal {
                Some(signal) => Some(signal.clone()),
                None => {
                    st.signal = Some(self.space.setable(value.clone()));
                    None
                }
            }
        };
        if let Some(signal) = existing {
            if let Err(error) = signal.set(value) {
                tracing::error!(channel = %self.id, %error, "applying signal value failed");
                return;
            }
        }
        self.ready.send_replace(true);
        self.version.send_modify(|n| *n += 1);
    }
}

/// The reading end of a signal channel. Clones share the end.
pub struct SignalReceiveEnd {
    shared: Arc<ReceiveShared>,
}

impl SignalReceiveEnd {
    pub fn new(id: ChannelId, space: SignalSpace) -> Self {
        let (ready, _) = watch::channel(false);
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(ReceiveShared {
                id,
                space,
                state: Mutex::new(ReceiveState {
                    signal: None,
                    remotes: SmallVec::new(),
                }),
                ready,
                version,
            }),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.shared.id
    }

    /// Attach a remote send end and start pumping its messages.
    pub fn add_remote(&self, remote: Remote) {
        let Remote {
            channel_id: peer,
            port,
            ..
        } = remote;
        let (tx, rx) = port.split();
        let pump = tokio::spawn(Self::pump(Arc::clone(&self.shared), peer.clone(), rx));
        self.shared
            .state
            .lock()
            .remotes
            .push(ReceiveRemote { peer, tx, pump });
    }

    pub fn remove_remote(&self, peer: &ChannelId) {
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.remotes.iter().position(|r| &r.peer == peer) {
            let remote = st.remotes.remove(pos);
            let _ = remote.tx.send(ChannelMessage::Closed {
                channel_id: self.shared.id.clone(),
            });
            remote.pump.abort();
        }
    }

    pub fn remote_count(&self) -> usize {
        self.shared.state.lock().remotes.len()
    }

    /// Resolve once at least one value has been applied. A sender with
    /// a replayed last value makes this immediate.
    pub async fn ready(&self) {
        let mut ready = self.shared.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.ready.subscribe().borrow()
    }

    /// The newest payload, if any value has arrived yet.
    pub fn payload(&self) -> Option<Payload> {
        self.shared
            .state
            .lock()
            .signal
            .as_ref()
            .map(|s| s.get_untracked())
    }

    pub(crate) fn payload_signal(&self) -> Option<SetableSignal<Payload>> {
        self.shared.state.lock().signal.clone()
    }

    /// Subscribe to value arrivals.
    pub fn versions(&self) -> watch::Receiver<u64> {
        self.shared.version.subscribe()
    }

    /// Wait for the first value, then return a typed signal in this
    /// end's space that follows every later arrival. Decode failures
    /// after this point are logged and dropped; the signal keeps its
    /// previous value.
    pub async fn typed<T>(&self) -> Result<SetableSignal<T>, ChannelError>
    where
        T: DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    {
        self.ready().await;
        let source = self
            .payload_signal()
            .expect("ready signal end always holds a value");
        let initial: T = source.get_untracked().decode()?;
        let typed = self.shared.space.setable(initial);

        let mut versions = self.versions();
        tokio::spawn({
            let typed = typed.clone();
            let id = self.shared.id.clone();
            async move {
                while versions.changed().await.is_ok() {
                    match source.get_untracked().decode::<T>() {
                        Ok(value) => {
                            if let Err(error) = typed.set(value) {
                                tracing::error!(channel = %id, %error, "typed signal update failed");
                            }
                        }
                        Err(error) => {
                            tracing::warn!(channel = %id, %error, "dropping undecodable signal payload")
                        }
                    }
                }
            }
        });
        Ok(typed)
    }

    async fn pump(
        shared: Arc<ReceiveShared>,
        peer: ChannelId,
        mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
    ) {
        while let Some(message) = rx.recv().await {
            match message {
                ChannelMessage::SetSignalValue { signal_id, value } => {
                    if signal_id != shared.id {
                        let error = ChannelError::CrossedChannelIds {
                            expected: shared.id.clone(),
                            got: signal_id,
                        };
                        tracing::error!(%error, "detaching remote from signal receive end");
                        break;
                    }
                    shared.apply(value);
                }
                ChannelMessage::Closed { .. } => break,
                other => {
                    tracing::warn!(channel = %shared.id, message = ?other, "unexpected message on signal receive end")
                }
            }
        }
        shared.state.lock().remotes.retain(|r| r.peer != peer);
    }
}

impl Clone for SignalReceiveEnd {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for SignalReceiveEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalReceiveEnd")
            .field("id", &self.shared.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Typed writer
// ----------------------------------------------------------------------------

/// Typed writer over a [`SignalSendEnd`].
pub struct SignalWriter<T> {
    end: SignalSendEnd,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> SignalWriter<T> {
    pub fn new(end: SignalSendEnd) -> Self {
        Self {
            end,
            _marker: PhantomData,
        }
    }

    pub fn set(&self, value: &T) -> Result<(), ChannelError> {
        self.end.set(value)
    }

    pub fn end(&self) -> &SignalSendEnd {
        &self.end
    }
}

impl<T> Clone for SignalWriter<T> {
    fn clone(&self) -> Self {
        Self {
            end: self.end.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SignalWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWriter").field("end", &self.end).finish()
    }
}

// ----------------------------------------------------------------------------
// Typed view
// ----------------------------------------------------------------------------

/// A typed, awaitable window onto a [`SignalReceiveEnd`], for observers
/// outside the owning cell.
pub struct SignalView<T> {
    end: SignalReceiveEnd,
    versions: watch::Receiver<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> SignalView<T> {
    pub fn new(end: &SignalReceiveEnd) -> Self {
        Self {
            end: end.clone(),
            versions: end.versions(),
            _marker: PhantomData,
        }
    }

    /// Resolves once a first value has been applied, and marks every
    /// arrival up to that point as seen. A later
    /// [`SignalView::changed`] therefore yields values applied after
    /// this call, not the replayed history.
    pub async fn ready(&mut self) {
        self.end.ready().await;
        self.versions.borrow_and_update();
    }

    /// Decode the newest value. `None` before the first arrival or when
    /// the payload does not decode as `T`.
    pub fn get(&self) -> Option<T> {
        let payload = self.end.payload()?;
        match payload.decode() {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(channel = %self.end.shared.id, %error, "undecodable signal payload");
                None
            }
        }
    }

    /// Await the next applied value. Returns `None` when the channel
    /// end is gone.
    pub async fn changed(&mut self) -> Option<T> {
        loop {
            self.versions.changed().await.ok()?;
            if let Some(value) = self.get() {
                return Some(value);
            }
        }
    }
}

impl<T> std::fmt::Debug for SignalView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalView").field("end", &self.end).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::messages::{port_pair, CellId};
    use super::*;

    fn cid(cell: &str, name: &str) -> ChannelId {
        ChannelId::new(CellId::new(cell), name)
    }

    /// Let spawned pumps run on the current-thread test runtime.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn link(send: &SignalSendEnd, recv: &SignalReceiveEnd) {
        let (send_side, recv_side) = port_pair();
        send.add_remote(Remote::new(recv.id().clone(), send_side));
        recv.add_remote(Remote::new(send.id().clone(), recv_side));
    }

    #[tokio::test]
    async fn replay_reaches_a_late_remote() {
        let send = SignalSendEnd::new(cid("writer", "out"));
        send.set(&String::from("early")).unwrap();

        let recv = SignalReceiveEnd::new(cid("reader", "in"), SignalSpace::new());
        link(&send, &recv);

        recv.ready().await;
        assert_eq!(
            recv.payload().unwrap().decode::<String>().unwrap(),
            "early"
        );
    }

    #[tokio::test]
    async fn fan_out_reaches_every_remote() {
        let send = SignalSendEnd::new(cid("writer", "out"));
        let first = SignalReceiveEnd::new(cid("one", "in"), SignalSpace::new());
        let second = SignalReceiveEnd::new(cid("two", "in"), SignalSpace::new());
        link(&send, &first);
        link(&send, &second);

        send.set(&7_i32).unwrap();
        first.ready().await;
        second.ready().await;
        assert_eq!(first.payload().unwrap().decode::<i32>().unwrap(), 7);
        assert_eq!(second.payload().unwrap().decode::<i32>().unwrap(), 7);
        assert_eq!(send.remote_count(), 2);
    }

    #[tokio::test]
    async fn fan_in_applies_the_latest_write() {
        let left = SignalSendEnd::new(cid("left", "out"));
        let right = SignalSendEnd::new(cid("right", "out"));
        let recv = SignalReceiveEnd::new(cid("reader", "in"), SignalSpace::new());
        link(&left, &recv);
        link(&right, &recv);

        left.set(&String::from("one")).unwrap();
        recv.ready().await;

        let mut view = SignalView::<String>::new(&recv);
        right.set(&String::from("two")).unwrap();
        assert_eq!(view.changed().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn unchanged_values_are_not_refanned() {
        let send = SignalSendEnd::new(cid("writer", "out"));
        let recv = SignalReceiveEnd::new(cid("reader", "in"), SignalSpace::new());
        link(&send, &recv);

        let versions = recv.versions();
        send.set(&5_i32).unwrap();
        settle().await;
        assert_eq!(*versions.borrow(), 1);

        send.set(&5_i32).unwrap();
        settle().await;
        assert_eq!(*versions.borrow(), 1);

        send.set(&6_i32).unwrap();
        settle().await;
        assert_eq!(*versions.borrow(), 2);
    }

    #[tokio::test]
    async fn a_mis_stamped_message_is_rejected_and_detaches() {
        let recv = SignalReceiveEnd::new(cid("reader", "in"), SignalSpace::new());
        let (rogue, recv_side) = port_pair();
        recv.add_remote(Remote::new(cid("rogue", "out"), recv_side));

        rogue.post(ChannelMessage::SetSignalValue {
            signal_id: cid("reader", "some_other_channel"),
            value: Payload::encode(&1_i32).unwrap(),
        });
        settle().await;

        assert!(!recv.is_ready());
        assert!(recv.payload().is_none());
        assert_eq!(recv.remote_count(), 0);
    }

    #[tokio::test]
    async fn typed_signal_follows_later_arrivals() {
        let send = SignalSendEnd::new(cid("writer", "out"));
        let recv = SignalReceiveEnd::new(cid("reader", "in"), SignalSpace::new());
        link(&send, &recv);

        send.set(&10_i32).unwrap();
        let typed = recv.typed::<i32>().await.unwrap();
        assert_eq!(typed.get(), 10);

        send.set(&11_i32).unwrap();
        settle().await;
        assert_eq!(typed.get(), 11);
    }

    #[tokio::test]
    async fn remove_remote_stops_the_flow() {
        let send = SignalSendEnd::new(cid("writer", "out"));
        let recv = SignalReceiveEnd::new(cid("reader", "in"), SignalSpace::new());
        link(&send, &recv);

        send.set(&1_i32).unwrap();
        recv.ready().await;

        send.remove_remote(recv.id());
        settle().await;
        assert_eq!(send.remote_count(), 0);
        assert_eq!(recv.remote_count(), 0);

        let versions = recv.versions();
        send.set(&2_i32).unwrap();
        settle().await;
        assert_eq!(*versions.borrow(), 1);
        assert_eq!(send.last_payload().unwrap().decode::<i32>().unwrap(), 2);
    }
}

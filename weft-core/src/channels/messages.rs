//! Channel Wire Types
//!
//! The vocabulary shared by every channel end: payload encoding, cell
//! and channel identity, the duplex port a pair of ends talks over, and
//! the message set itself.
//!
//! Values never cross a port as live objects. A [`Payload`] is the
//! MessagePack encoding of the value, produced on the sending side and
//! decoded on the receiving side, so two cells can never end up sharing
//! mutable state through a channel.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::ChannelError;

/// An encoded value in transit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn encode<T: Serialize>(value: &T) -> Result<Payload, ChannelError> {
        Ok(Payload(rmp_serde::to_vec(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        Ok(rmp_serde::from_slice(&self.0)?)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

/// Identity of one cell in an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one named channel end on one cell. Every data message
/// carries the target's `ChannelId` as a stamp, and the receiving end
/// rejects messages whose stamp does not match its own identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub cell: CellId,
    pub name: String,
}

impl ChannelId {
    pub fn new(cell: CellId, name: impl Into<String>) -> Self {
        Self {
            cell,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.cell, self.name)
    }
}

/// Everything that flows between two attached channel ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// New value for a signal channel, stamped with the receiver's id.
    SetSignalValue {
        signal_id: ChannelId,
        value: Payload,
    },
    /// One stream element, stamped with the receiver's id. Indices are
    /// per-stream, monotonic, starting at 1.
    AddStreamValue {
        stream_id: ChannelId,
        index: u64,
        value: Payload,
    },
    /// The sender will post no further elements on this stream.
    EndStream { stream_id: ChannelId },
    /// Receiver-to-sender acknowledgement: every element up to `index`
    /// has been consumed. Stamped with the sending end's id.
    CongestionFeedback { stream_id: ChannelId, index: u64 },
    /// The named end has detached; the peer should forget this port.
    Closed { channel_id: ChannelId },
}

/// One side of an in-process duplex link: posts go to the peer's
/// receive half, and vice versa.
#[derive(Debug)]
pub struct DuplexPort {
    pub(crate) tx: mpsc::UnboundedSender<ChannelMessage>,
    pub(crate) rx: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl DuplexPort {
    /// Post a message to the peer. A dropped peer is tolerated: the
    /// message is discarded with a warning, and the caller's detach
    /// bookkeeping catches up via its own port.
    pub(crate) fn post(&self, message: ChannelMessage) {
        if self.tx.send(message).is_err() {
            tracing::warn!("dropping message for a detached port peer");
        }
    }

    pub(crate) fn split(
        self,
    ) -> (
        mpsc::UnboundedSender<ChannelMessage>,
        mpsc::UnboundedReceiver<ChannelMessage>,
    ) {
        (self.tx, self.rx)
    }
}

/// Create the two ends of a fresh duplex link.
pub fn port_pair() -> (DuplexPort, DuplexPort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        DuplexPort { tx: a_tx, rx: a_rx },
        DuplexPort { tx: b_tx, rx: b_rx },
    )
}

/// A peer attachment handed to a channel end: who the peer is, which of
/// its channels this link reaches, and the port to reach it over.
#[derive(Debug)]
pub struct Remote {
    pub cell_id: CellId,
    pub channel_id: ChannelId,
    pub port: DuplexPort,
}

impl Remote {
    pub fn new(channel_id: ChannelId, port: DuplexPort) -> Self {
        Self {
            cell_id: channel_id.cell.clone(),
            channel_id,
            port,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_a_struct() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Reading {
            sensor: String,
            value: f64,
        }

        let reading = Reading {
            sensor: String::from("t0"),
            value: 21.5,
        };
        let payload = Payload::encode(&reading).unwrap();
        assert!(!payload.is_empty());
        assert_eq!(payload.decode::<Reading>().unwrap(), reading);
    }

    #[test]
    fn payload_decode_to_the_wrong_type_errors() {
        let payload = Payload::encode(&vec![1_u8, 2, 3]).unwrap();
        assert!(payload.decode::<String>().is_err());
    }

    #[test]
    fn channel_id_formats_as_cell_colon_name() {
        let id = ChannelId::new(CellId::new("reverser"), "prefix");
        assert_eq!(id.to_string(), "reverser:prefix");
    }

    #[tokio::test]
    async fn port_pair_is_cross_wired() {
        let (alpha, beta) = port_pair();
        let id = ChannelId::new(CellId::new("a"), "sig");

        alpha.post(ChannelMessage::EndStream {
            stream_id: id.clone(),
        });
        let (_to_alpha, mut from_alpha) = beta.split();
        match from_alpha.recv().await {
            Some(ChannelMessage::EndStream { stream_id }) => assert_eq!(stream_id, id),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

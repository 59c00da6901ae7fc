//! Error Taxonomy
//!
//! Structural violations of the signal graph are surfaced synchronously to
//! the caller that triggered them. Protocol-level errors on the channel
//! plane are fatal to the single message exchange: surfaces that have a
//! caller return them, message pumps log and drop (lenient mode) since
//! there is nobody to return to.
//!
//! A cell started without one of its declared inputs is *not* an error
//! value: it never reaches `Running`. See [`crate::cells::CellController::start`].

use crate::channels::ChannelId;

/// Violations of the signal graph's update discipline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// A setable's own propagation re-entered a `set` on a node already
    /// touched within the same update. The update is abandoned.
    #[error("cyclic update: setable node {node} was set again within its own propagation")]
    CyclicUpdate { node: u32 },

    /// A `defined()` dependency was declared while the defining node is
    /// not null-typed. Raised by the enclosing `derived` constructor.
    #[error("downstream-null-if-null dependency declared outside a nullable derived node")]
    InvalidNullPropagation,
}

/// Errors on the channel plane: wiring, framing, and stream termination.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A message or call referred to a channel name the cell kind does
    /// not declare.
    #[error("no channel named `{channel}` is declared on this cell")]
    NoSuchChannel { channel: String },

    /// A payload message arrived stamped with a channel id other than
    /// the one recorded for that remote at attach time.
    #[error("crossed channel ids: expected `{expected}`, got `{got}`")]
    CrossedChannelIds { expected: ChannelId, got: ChannelId },

    /// `send` was called on a stream end (or toward a remote) that has
    /// already been marked done.
    #[error("send on a done stream")]
    SendOnDoneStream,

    /// A value could not be MessagePack-encoded for the wire.
    #[error("payload encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A received payload could not be decoded into the expected type.
    #[error("payload decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Errors surfaced by the cell controller and worker scope.
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    /// `start` was called on a cell that already has a worker task.
    #[error("cell `{cell}` was already started")]
    AlreadyStarted { cell: String },

    /// An operation that needs a live worker ran before `start`.
    #[error("cell `{cell}` has not been started")]
    NotStarted { cell: String },

    /// A cell was spawned under an id the environment already holds.
    #[error("cell `{cell}` already exists in this environment")]
    DuplicateCell { cell: String },

    /// An environment operation named a cell it does not hold.
    #[error("no cell named `{cell}` in this environment")]
    NoSuchCell { cell: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_offender() {
        let err = ChannelError::NoSuchChannel {
            channel: "prefix".to_string(),
        };
        assert!(err.to_string().contains("prefix"));

        let err = SignalError::CyclicUpdate { node: 7 };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn cell_error_wraps_channel_error_transparently() {
        let inner = ChannelError::SendOnDoneStream;
        let wrapped = CellError::from(inner);
        assert_eq!(wrapped.to_string(), "send on a done stream");
    }
}

//! Channels Between Cells
//!
//! Cells never share signal spaces; everything that crosses a cell
//! boundary travels through a channel as an encoded [`Payload`]. Two
//! channel flavors exist:
//!
//! - signal channels carry "the latest value": the send end replays its
//!   last value to late remotes, and the receive end materializes the
//!   newest arrival as a signal in its own space;
//! - stream channels carry an ordered, explicitly ended sequence, with
//!   per-remote congestion control paced by consumption.
//!
//! Both flavors fan out from one send end to many receive ends and fan
//! in from many send ends to one receive end. Attachments are dynamic:
//! a [`Remote`] bundles the peer's identity with a fresh duplex port,
//! and either side can attach or detach at runtime.

mod event_queue;
mod messages;
mod signal_end;
mod stream_end;

pub use event_queue::EventQueue;
pub use messages::{port_pair, CellId, ChannelId, ChannelMessage, DuplexPort, Payload, Remote};
pub use signal_end::{SignalReceiveEnd, SignalSendEnd, SignalView, SignalWriter};
pub use stream_end::{
    CongestionControlConfig, StreamReader, StreamReceiveEnd, StreamSendEnd, StreamWriter,
};

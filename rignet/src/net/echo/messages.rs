//! Message types for the echo communicator task

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;

use crate::error::CommResult;
use crate::net::communicator::Subscriber;
use crate::net::event::LifecycleEvent;

/// Requests from handles to the communicator task
#[derive(Debug)]
pub enum CommRequest {
    /// Transmit bytes and report when the peer echoes them back
    Send {
        addr: SocketAddr,
        bytes: Vec<u8>,
        reply_tx: oneshot::Sender<CommResult<()>>,
    },

    /// Append a subscriber to an event
    Subscribe {
        event: LifecycleEvent,
        subscriber: Subscriber,
    },

    /// Drop every subscriber of an event
    Clear { event: LifecycleEvent },

    /// Is a confirmation outstanding (to `addr`, or to anyone)?
    AwaitingResponse {
        addr: Option<SocketAddr>,
        reply_tx: oneshot::Sender<bool>,
    },

    /// Currently connected stream peers
    Peers { reply_tx: oneshot::Sender<Vec<SocketAddr>> },

    /// Close the transport and cancel pending work
    Close {
        reason: String,
        done_tx: oneshot::Sender<()>,
    },
}

/// Notifications from the socket reader tasks
#[derive(Debug)]
pub enum LinkEvent {
    /// A stream server accepted a connection
    Connected {
        addr: SocketAddr,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    },

    /// A datagram or a complete stream frame arrived
    Data { addr: SocketAddr, bytes: Vec<u8> },

    /// The peer half-closed its stream
    Eof { addr: SocketAddr },

    /// A socket failed; `addr` is `None` when the whole transport is affected
    Error { addr: Option<SocketAddr>, message: String },
}

/// Connection status published to every handle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    /// Transport is open
    pub connected: bool,
    /// First transport error seen
    pub error: Option<String>,
    /// A peer half-closed its stream
    pub eof: bool,
    /// Why the connection was lost
    pub lost: Option<String>,
}

impl LinkState {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Default::default()
        }
    }
}

//! Echo communicator
//!
//! Every unsolicited message is retransmitted verbatim to its sender, and that
//! echo is the sender's delivery confirmation. A communicator is a task that
//! owns the socket, the per-peer outstanding confirmations and the callback
//! table; [`EchoCommunicator`] is the cloneable handle to it.

mod core;
mod handle;
mod messages;
mod transport;

pub use handle::EchoCommunicator;
pub use messages::LinkState;
pub use transport::{SocketKind, check_transport, read_frame, socket_kind, write_frame};

//! The echo communicator task
//!
//! One task per communicator owns the transport, the outstanding confirmations
//! and the callback table. Handles reach it through [`CommRequest`]s; socket
//! readers through [`LinkEvent`]s.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{CommRequest, LinkEvent, LinkState};
use super::transport::{Link, Transport};
use crate::error::{CommError, CommResult};
use crate::net::communicator::{Role, Subscriber, decode, parse_message};
use crate::net::event::LifecycleEvent;

/// A send waiting for its echo
struct Outstanding {
    expected: Vec<u8>,
    reply_tx: oneshot::Sender<CommResult<()>>,
}

/// State owned by the communicator task
pub struct EchoCore {
    name: String,
    role: Role,
    transport: Transport,
    tasks: Vec<JoinHandle<()>>,
    outstanding: HashMap<SocketAddr, Outstanding>,
    callbacks: HashMap<LifecycleEvent, Vec<Subscriber>>,
    state: watch::Sender<LinkState>,
    rx: mpsc::Receiver<CommRequest>,
    link_rx: mpsc::Receiver<LinkEvent>,
    /// Weak so the link channel still closes once every reader is gone
    link_tx: mpsc::WeakSender<LinkEvent>,
}

impl EchoCore {
    pub fn new(
        name: String,
        role: Role,
        link: Link,
        rx: mpsc::Receiver<CommRequest>,
        link_rx: mpsc::Receiver<LinkEvent>,
        link_tx: mpsc::WeakSender<LinkEvent>,
        state: watch::Sender<LinkState>,
    ) -> Self {
        Self {
            name,
            role,
            transport: link.transport,
            tasks: link.tasks,
            outstanding: HashMap::new(),
            callbacks: HashMap::new(),
            state,
            rx,
            link_rx,
            link_tx,
        }
    }

    /// Run until closed
    pub async fn run(mut self) {
        let mut rx = std::mem::replace(&mut self.rx, mpsc::channel(1).1);
        let mut link_rx = std::mem::replace(&mut self.link_rx, mpsc::channel(1).1);

        debug!(name = %self.name, role = %self.role, "EchoCore::run: started");

        let (reason, done_tx) = loop {
            tokio::select! {
                biased;

                req = rx.recv() => match req {
                    Some(CommRequest::Close { reason, done_tx }) => break (reason, Some(done_tx)),
                    Some(req) => self.handle_request(req).await,
                    None => break ("All handles dropped".to_string(), None),
                },
                event = link_rx.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle_link(event).await {
                            break (reason, None);
                        }
                    }
                    None => break ("Transport closed".to_string(), None),
                },
            }
        };

        self.shutdown(reason);
        if let Some(done_tx) = done_tx {
            let _ = done_tx.send(());
        }
    }

    async fn handle_request(&mut self, req: CommRequest) {
        match req {
            CommRequest::Send { addr, bytes, reply_tx } => {
                debug!(name = %self.name, %addr, len = bytes.len(), "Sending");
                if self.outstanding.contains_key(&addr) {
                    warn!(name = %self.name, %addr, "Replacing outstanding confirmation");
                }
                let result = self.transport.send(addr, &bytes).await;
                match result {
                    Ok(()) => {
                        self.outstanding.insert(
                            addr,
                            Outstanding {
                                expected: bytes,
                                reply_tx,
                            },
                        );
                    }
                    Err(e) => {
                        error!(name = %self.name, %addr, error = %e, "Send failed");
                        self.outstanding.remove(&addr);
                        let _ = reply_tx.send(Err(CommError::transport(addr.to_string(), e.to_string())));
                    }
                }
            }

            CommRequest::Subscribe { event, subscriber } => {
                debug!(name = %self.name, %event, "Subscribing");
                self.callbacks.entry(event).or_default().push(subscriber);
            }

            CommRequest::Clear { event } => {
                debug!(name = %self.name, %event, "Clearing callbacks");
                self.callbacks.remove(&event);
            }

            CommRequest::AwaitingResponse { addr, reply_tx } => {
                let awaiting = match addr {
                    Some(addr) => self.outstanding.contains_key(&addr),
                    None => !self.outstanding.is_empty(),
                };
                let _ = reply_tx.send(awaiting);
            }

            CommRequest::Peers { reply_tx } => {
                let _ = reply_tx.send(self.transport.peers());
            }

            // Handled by the run loop
            CommRequest::Close { done_tx, .. } => {
                let _ = done_tx.send(());
            }
        }
    }

    /// Process a reader notification; returns a reason if the link is lost
    async fn handle_link(&mut self, event: LinkEvent) -> Option<String> {
        match event {
            LinkEvent::Connected { addr, reader, writer } => {
                info!(name = %self.name, %addr, "Peer connected");
                let link_tx = self.link_tx.upgrade()?;
                if let Some(task) = self.transport.add_peer(addr, reader, writer, link_tx) {
                    self.tasks.push(task);
                }
                None
            }

            LinkEvent::Data { addr, bytes } => {
                self.receive(addr, bytes).await;
                None
            }

            LinkEvent::Eof { addr } => {
                info!(name = %self.name, %addr, "Peer closed its stream");
                self.state.send_modify(|state| state.eof = true);
                match self.role {
                    Role::Client => Some("connection closed by peer".to_string()),
                    Role::Server => {
                        self.forget_peer(addr, "peer closed connection");
                        None
                    }
                }
            }

            LinkEvent::Error { addr, message } => {
                error!(name = %self.name, ?addr, %message, "Transport error");
                self.state.send_modify(|state| {
                    state.error.get_or_insert_with(|| message.clone());
                });
                match (self.role, addr) {
                    (Role::Server, Some(addr)) => {
                        self.forget_peer(addr, &message);
                        None
                    }
                    _ => Some(message),
                }
            }
        }
    }

    fn forget_peer(&mut self, addr: SocketAddr, reason: &str) {
        self.transport.remove_peer(addr);
        if let Some(pending) = self.outstanding.remove(&addr) {
            let _ = pending
                .reply_tx
                .send(Err(CommError::transport(addr.to_string(), reason.to_string())));
        }
    }

    async fn receive(&mut self, addr: SocketAddr, bytes: Vec<u8>) {
        if !self.transport.accepts(addr) {
            warn!(name = %self.name, %addr, "Dropping datagram from unexpected host");
            return;
        }

        if let Some(pending) = self.outstanding.remove(&addr) {
            let result = if pending.expected == bytes {
                debug!(name = %self.name, %addr, "Echo confirmed");
                Ok(())
            } else {
                let expected = String::from_utf8_lossy(&pending.expected).into_owned();
                let received = String::from_utf8_lossy(&bytes).into_owned();
                error!(name = %self.name, %addr, %expected, %received, "Unexpected echo");
                Err(CommError::Mismatch {
                    peer: addr.to_string(),
                    action: "awaiting echo".to_string(),
                    expected,
                    received,
                })
            };
            let _ = pending.reply_tx.send(result);
            return;
        }

        // Echo unsolicited data straight back; the echo is the acknowledgment
        if let Err(e) = self.transport.send(addr, &bytes).await {
            warn!(name = %self.name, %addr, error = %e, "Failed to echo message");
        }

        let message = decode(&bytes);
        info!(name = %self.name, %addr, %message, "Received");
        match parse_message(message) {
            Ok((event, payload)) => self.dispatch(event, payload, addr),
            Err(e) => warn!(name = %self.name, %addr, error = %e, "Ignoring message"),
        }
    }

    /// Fire every subscriber of an event; one-shot waiters are removed
    fn dispatch(&mut self, event: LifecycleEvent, payload: Value, addr: SocketAddr) {
        let Some(subscribers) = self.callbacks.remove(&event) else {
            debug!(name = %self.name, %event, "No subscribers");
            return;
        };
        let kept: Vec<Subscriber> = subscribers
            .into_iter()
            .filter_map(|subscriber| subscriber.fire(&payload, addr))
            .collect();
        if !kept.is_empty() {
            self.callbacks.insert(event, kept);
        }
    }

    fn shutdown(&mut self, reason: String) {
        info!(name = %self.name, %reason, "Closing communicator");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Dropping the reply and waiter senders cancels whoever awaits them
        self.outstanding.clear();
        self.callbacks.clear();
        self.transport.close();
        self.state.send_modify(|state| {
            state.connected = false;
            state.lost.get_or_insert(reason);
        });
    }
}

//! EchoCommunicator - cloneable handle to a communicator task

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::core::EchoCore;
use super::messages::{CommRequest, LinkState};
use super::transport;
use crate::config::NetworkConfig;
use crate::error::{CommError, CommResult};
use crate::net::communicator::{Communicator, Frame, Role, Subscriber, encode};
use crate::net::event::LifecycleEvent;
use crate::net::uri::{Endpoint, UriInput};

const CLOSE_REASON: &str = "Close called on communicator";

struct Shared {
    name: String,
    role: Role,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    remote: Option<SocketAddr>,
    echo_timeout: Duration,
    state: watch::Receiver<LinkState>,
}

/// A communicator that confirms every send by waiting for the peer to echo it
///
/// Clones share one underlying task and transport. Callbacks run on that task,
/// so they must not block; spawn a task to talk back to the peer.
#[derive(Clone)]
pub struct EchoCommunicator {
    tx: mpsc::Sender<CommRequest>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EchoCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoCommunicator")
            .field("name", &self.shared.name)
            .field("role", &self.shared.role)
            .field("endpoint", &self.shared.endpoint.to_string())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl EchoCommunicator {
    /// Bind a server to `uri` with default settings
    pub async fn server(uri: impl Into<UriInput>, name: Option<&str>) -> CommResult<Self> {
        Self::server_with(uri, name, &NetworkConfig::default()).await
    }

    /// Connect a client to `uri` with default settings
    pub async fn client(uri: impl Into<UriInput>, name: Option<&str>) -> CommResult<Self> {
        Self::client_with(uri, name, &NetworkConfig::default()).await
    }

    pub async fn server_with(uri: impl Into<UriInput>, name: Option<&str>, config: &NetworkConfig) -> CommResult<Self> {
        Self::open(Role::Server, uri.into(), name, config).await
    }

    pub async fn client_with(uri: impl Into<UriInput>, name: Option<&str>, config: &NetworkConfig) -> CommResult<Self> {
        Self::open(Role::Client, uri.into(), name, config).await
    }

    async fn open(role: Role, uri: UriInput, name: Option<&str>, config: &NetworkConfig) -> CommResult<Self> {
        debug!(%role, ?uri, "EchoCommunicator::open: called");
        if config.echo_timeout_ms == 0 {
            return Err(CommError::config("Echo timeout must be positive"));
        }
        if config.channel_buffer == 0 {
            return Err(CommError::config("Channel buffer must be positive"));
        }

        let endpoint = Endpoint::from_uri(uri, &config.uri_options())?;
        let name = name.map(str::to_string).unwrap_or_else(|| endpoint.to_string());

        let (link_tx, link_rx) = mpsc::channel(config.channel_buffer);
        let weak_link_tx = link_tx.downgrade();
        let link = transport::open(role, &endpoint, config.max_frame_size, link_tx).await?;
        let local_addr = link.local_addr;
        let remote = link.remote;

        let (tx, rx) = mpsc::channel(config.channel_buffer);
        let (state_tx, state_rx) = watch::channel(LinkState::connected());
        let core = EchoCore::new(name.clone(), role, link, rx, link_rx, weak_link_tx, state_tx);
        tokio::spawn(core.run());

        info!(%name, %role, %endpoint, %local_addr, "Communicator connected");
        Ok(Self {
            tx,
            shared: Arc::new(Shared {
                name,
                role,
                endpoint,
                local_addr,
                remote,
                echo_timeout: config.echo_timeout(),
                state: state_rx,
            }),
        })
    }

    /// Address of the local socket
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Default confirmation timeout
    pub fn echo_timeout(&self) -> Duration {
        self.shared.echo_timeout
    }

    /// Snapshot of the connection status
    pub fn link_state(&self) -> LinkState {
        self.shared.state.borrow().clone()
    }

    /// Whether a confirmation is outstanding to `addr`, or to any peer
    pub async fn awaiting_response(&self, addr: Option<SocketAddr>) -> bool {
        debug!(name = %self.shared.name, ?addr, "EchoCommunicator::awaiting_response: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.request(CommRequest::AwaitingResponse { addr, reply_tx }).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Peers connected to a stream server
    pub async fn peers(&self) -> Vec<SocketAddr> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.request(CommRequest::Peers { reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Resolves with the first transport error, or `None` if closed without one
    pub async fn on_error_received(&self) -> Option<String> {
        let mut state = self.shared.state.clone();
        let error = state
            .wait_for(|s| s.error.is_some() || !s.connected)
            .await
            .map(|s| s.error.clone());
        error.unwrap_or_else(|_| state.borrow().error.clone())
    }

    /// Resolves `true` once a peer half-closes, or `false` if closed first
    pub async fn on_eof_received(&self) -> bool {
        let mut state = self.shared.state.clone();
        let eof = state.wait_for(|s| s.eof || !s.connected).await.map(|s| s.eof);
        eof.unwrap_or_else(|_| state.borrow().eof)
    }

    /// Resolves with the reason once the connection is lost
    pub async fn on_connection_lost(&self) -> String {
        let mut state = self.shared.state.clone();
        let lost = state.wait_for(|s| s.lost.is_some()).await.map(|s| s.lost.clone());
        lost.unwrap_or_else(|_| state.borrow().lost.clone())
            .unwrap_or_else(|| "Communicator dropped".to_string())
    }

    async fn request(&self, req: CommRequest) -> CommResult<()> {
        let closed = || CommError::Closed {
            peer: self.shared.name.clone(),
        };
        if !self.is_connected() {
            return Err(closed());
        }
        self.tx.send(req).await.map_err(|_| closed())
    }

    fn destination(&self, addr: Option<SocketAddr>) -> CommResult<SocketAddr> {
        match (self.shared.role, self.shared.remote, addr) {
            (Role::Server, _, Some(addr)) => Ok(addr),
            (Role::Server, _, None) => Err(CommError::config(format!(
                "[{}] A destination address is required when sending from a server",
                self.shared.name
            ))),
            (Role::Client, Some(remote), None) => Ok(remote),
            (Role::Client, Some(remote), Some(addr)) if addr == remote => Ok(remote),
            (Role::Client, Some(remote), Some(addr)) => Err(CommError::config(format!(
                "[{}] Client can only send to {remote}, not {addr}",
                self.shared.name
            ))),
            (Role::Client, None, _) => Err(CommError::config(format!(
                "[{}] Client has no remote address",
                self.shared.name
            ))),
        }
    }

    async fn close_with(&self, reason: String) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(CommRequest::Close { reason, done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[async_trait]
impl Communicator for EchoCommunicator {
    fn role(&self) -> Role {
        self.shared.role
    }

    fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn is_connected(&self) -> bool {
        self.shared.state.borrow().connected
    }

    async fn add_subscriber(&self, event: LifecycleEvent, subscriber: Subscriber) -> CommResult<()> {
        self.request(CommRequest::Subscribe { event, subscriber }).await
    }

    async fn remove_subscribers(&self, event: LifecycleEvent) -> CommResult<()> {
        self.request(CommRequest::Clear { event }).await
    }

    async fn confirmed_send(
        &self,
        frame: Frame,
        addr: Option<SocketAddr>,
        timeout: Option<Duration>,
    ) -> CommResult<()> {
        let timeout = timeout.unwrap_or(self.shared.echo_timeout);
        if timeout.is_zero() {
            return Err(CommError::config("Timeout must be positive"));
        }
        let addr = self.destination(addr)?;
        let bytes = encode(frame)?;
        debug!(name = %self.shared.name, %addr, ?timeout, "EchoCommunicator::confirmed_send: called");

        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(CommRequest::Send { addr, bytes, reply_tx }).await?;

        let result = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommError::Cancelled {
                peer: addr.to_string(),
                action: "awaiting echo".to_string(),
            }),
            Err(_) => {
                warn!(name = %self.shared.name, %addr, ?timeout, "Timed out waiting for echo");
                Err(CommError::Timeout {
                    peer: addr.to_string(),
                    action: "awaiting echo".to_string(),
                    timeout,
                })
            }
        };

        if let Err(e) = &result {
            self.close_with(e.to_string()).await;
        }
        result
    }

    async fn close(&self) {
        debug!(name = %self.shared.name, "EchoCommunicator::close: called");
        self.close_with(CLOSE_REASON.to_string()).await;
    }
}

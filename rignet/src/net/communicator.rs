//! The Communicator contract
//!
//! A communicator speaks for one rig: it has a role, an endpoint, a table of
//! event subscribers and a confirmed-send primitive that every lifecycle
//! command is built on.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::event::{EventKey, LifecycleEvent};
use super::uri::{Endpoint, Scheme};
use crate::error::{CommError, CommResult};

/// Which side of a connection a communicator plays
///
/// A server's endpoint is its local address and it may talk to many peers. A
/// client's endpoint is the one remote host it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

impl FromStr for Role {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            _ => Err(CommError::config("role must be either \"server\" or \"client\"")),
        }
    }
}

/// Callback invoked with an event's payload and the address it came from
pub type Callback = Arc<dyn Fn(Value, SocketAddr) + Send + Sync>;

/// An entry in a communicator's callback table
pub enum Subscriber {
    /// Invoked on every matching event
    Callback(Callback),
    /// Completion handle fulfilled by the first matching event, then removed
    Waiter(oneshot::Sender<(Value, SocketAddr)>),
}

impl Subscriber {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Value, SocketAddr) + Send + Sync + 'static,
    {
        Subscriber::Callback(Arc::new(f))
    }

    /// False for a completion handle whose receiving side is already gone
    pub fn is_invokable(&self) -> bool {
        match self {
            Subscriber::Callback(_) => true,
            Subscriber::Waiter(tx) => !tx.is_closed(),
        }
    }

    /// Deliver an event, returning the subscriber if it stays registered
    pub fn fire(self, data: &Value, addr: SocketAddr) -> Option<Self> {
        match self {
            Subscriber::Callback(f) => {
                f(data.clone(), addr);
                Some(Subscriber::Callback(f))
            }
            Subscriber::Waiter(tx) => {
                let _ = tx.send((data.clone(), addr));
                None
            }
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Callback(_) => f.write_str("Subscriber::Callback"),
            Subscriber::Waiter(tx) => write!(f, "Subscriber::Waiter(closed: {})", tx.is_closed()),
        }
    }
}

/// A pending one-shot wait for an event
///
/// Resolves with `(payload, source address)` the first time the event is
/// dispatched, or with a cancellation error if the communicator closes first.
#[derive(Debug)]
pub struct EventWait {
    event: LifecycleEvent,
    peer: String,
    rx: oneshot::Receiver<(Value, SocketAddr)>,
}

impl EventWait {
    pub fn new(event: LifecycleEvent, peer: impl Into<String>, rx: oneshot::Receiver<(Value, SocketAddr)>) -> Self {
        Self {
            event,
            peer: peer.into(),
            rx,
        }
    }

    pub fn event(&self) -> LifecycleEvent {
        self.event
    }

    /// Name of the communicator being waited on
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Wait at most `timeout` for the event
    pub async fn timeout(self, timeout: Duration) -> CommResult<(Value, SocketAddr)> {
        let peer = self.peer.clone();
        let action = format!("awaiting {}", self.event);
        tokio::time::timeout(timeout, self)
            .await
            .map_err(|_| CommError::Timeout { peer, action, timeout })?
    }
}

impl Future for EventWait {
    type Output = CommResult<(Value, SocketAddr)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.map_err(|_| CommError::Cancelled {
                peer: self.peer.clone(),
                action: format!("awaiting {}", self.event),
            })
        })
    }
}

/// Data handed to the confirmed-send primitive
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Sent verbatim
    Bytes(Vec<u8>),
    /// Sent as UTF-8
    Text(String),
    /// Serialized to JSON text
    Json(Value),
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Frame::Bytes(bytes)
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Frame::Bytes(bytes.to_vec())
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<Value> for Frame {
    fn from(value: Value) -> Self {
        Frame::Json(value)
    }
}

/// Serialize data for transmission
pub fn encode(frame: impl Into<Frame>) -> CommResult<Vec<u8>> {
    match frame.into() {
        Frame::Bytes(bytes) => Ok(bytes),
        Frame::Text(text) => Ok(text.into_bytes()),
        Frame::Json(value) => Ok(serde_json::to_vec(&value)?),
    }
}

/// Deserialize received data, falling back to the raw text
pub fn decode(data: &[u8]) -> Value {
    match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Failed to decode as JSON");
            Value::String(String::from_utf8_lossy(data).into_owned())
        }
    }
}

/// Build the canonical `[event, payload]` message
pub fn lifecycle_message(event: LifecycleEvent, payload: Value) -> Value {
    json!([event, payload])
}

/// Split a decoded message into its event and payload
///
/// A one-element message has a null payload; extra elements are returned
/// together as an array.
pub fn parse_message(message: Value) -> CommResult<(LifecycleEvent, Value)> {
    let Value::Array(mut parts) = message else {
        return Err(CommError::config(format!(
            "Message {message} is not an [event, payload] sequence"
        )));
    };
    if parts.is_empty() {
        return Err(CommError::config("Message is empty"));
    }

    let event = LifecycleEvent::from_json(&parts.remove(0))?;
    let payload = match parts.len() {
        0 => Value::Null,
        1 => parts.remove(0),
        _ => Value::Array(parts),
    };
    Ok((event, payload))
}

/// Payload of a start message: the experiment reference, plus any extra data
pub fn start_payload(exp_ref: &str, data: Value) -> Value {
    if data.is_null() {
        Value::String(exp_ref.to_string())
    } else {
        json!([exp_ref, data])
    }
}

/// The contract every rig communicator fulfils
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Role fixed at construction
    fn role(&self) -> Role;

    /// Remote endpoint (client) or local endpoint (server)
    fn endpoint(&self) -> &Endpoint;

    /// Label, defaulting to the endpoint URI
    fn name(&self) -> &str;

    /// True while the transport is open
    fn is_connected(&self) -> bool;

    /// Append a subscriber to an event's list
    async fn add_subscriber(&self, event: LifecycleEvent, subscriber: Subscriber) -> CommResult<()>;

    /// Drop every subscriber of an event
    async fn remove_subscribers(&self, event: LifecycleEvent) -> CommResult<()>;

    /// Send data and wait for the peer to echo it back
    ///
    /// A server must name the destination; a client may only send to its
    /// endpoint. Any failure closes the communicator.
    async fn confirmed_send(&self, frame: Frame, addr: Option<SocketAddr>, timeout: Option<Duration>)
    -> CommResult<()>;

    /// Close the transport and cancel everything pending. Idempotent.
    async fn close(&self);

    fn hostname(&self) -> &str {
        &self.endpoint().host
    }

    fn port(&self) -> u16 {
        self.endpoint().port
    }

    fn scheme(&self) -> Scheme {
        self.endpoint().scheme
    }

    /// Register a subscriber for an event
    ///
    /// Fails with a configuration error on an unrecognized event or a
    /// completion handle nobody is waiting on.
    async fn assign_callback<E>(&self, event: E, subscriber: Subscriber) -> CommResult<()>
    where
        E: Into<EventKey> + Send,
    {
        let event = LifecycleEvent::validate(event)?;
        if !subscriber.is_invokable() {
            return Err(CommError::config("Callback must be callable or an open completion handle"));
        }
        debug!(name = %self.name(), %event, "Communicator::assign_callback: called");
        self.add_subscriber(event, subscriber).await
    }

    /// Remove all subscribers for an event
    async fn clear_callbacks<E>(&self, event: E) -> CommResult<()>
    where
        E: Into<EventKey> + Send,
    {
        let event = LifecycleEvent::validate(event)?;
        debug!(name = %self.name(), %event, "Communicator::clear_callbacks: called");
        self.remove_subscribers(event).await
    }

    /// Wait for the next inbound message of this kind
    ///
    /// The waiter is registered before this returns, so a command sent
    /// afterwards cannot race past it.
    async fn on_event<E>(&self, event: E) -> CommResult<EventWait>
    where
        E: Into<EventKey> + Send,
    {
        let event = LifecycleEvent::validate(event)?;
        let (tx, rx) = oneshot::channel();
        self.add_subscriber(event, Subscriber::Waiter(tx)).await?;
        Ok(EventWait::new(event, self.name(), rx))
    }

    /// Send `[event, payload]` with echo confirmation
    async fn signal(&self, event: LifecycleEvent, payload: Value, addr: Option<SocketAddr>) -> CommResult<()> {
        debug!(name = %self.name(), %event, ?addr, "Communicator::signal: called");
        self.confirmed_send(Frame::Json(lifecycle_message(event, payload)), addr, None)
            .await
    }

    /// Initialize an experiment
    async fn init(&self, data: Value) -> CommResult<()> {
        self.signal(LifecycleEvent::Init, data, None).await
    }

    /// Start an experiment; `exp_ref` takes the form yyyy-mm-dd_n_subject
    async fn start(&self, exp_ref: &str, data: Value) -> CommResult<()> {
        self.signal(LifecycleEvent::Start, start_payload(exp_ref, data), None)
            .await
    }

    /// End an experiment, or interrupt it if `immediately` is set
    async fn stop(&self, data: Value, immediately: bool) -> CommResult<()> {
        let event = if immediately {
            LifecycleEvent::Interrupt
        } else {
            LifecycleEvent::End
        };
        self.signal(event, data, None).await
    }

    /// Begin experiment cleanup
    async fn cleanup(&self, data: Value) -> CommResult<()> {
        self.signal(LifecycleEvent::Cleanup, data, None).await
    }

    async fn status(&self, data: Value) -> CommResult<()> {
        self.signal(LifecycleEvent::Status, data, None).await
    }

    async fn info(&self, data: Value) -> CommResult<()> {
        self.signal(LifecycleEvent::Info, data, None).await
    }

    /// Send a credential token, or request one when `token` is `None`
    ///
    /// A request returns the wait that resolves with the peer's reply. A server
    /// must name the peer in `addr`.
    async fn credential(&self, token: Option<Value>, addr: Option<SocketAddr>) -> CommResult<Option<EventWait>> {
        match token {
            Some(token) => {
                self.signal(LifecycleEvent::Credential, token, addr).await?;
                Ok(None)
            }
            None => {
                let wait = self.on_event(LifecycleEvent::Credential).await?;
                self.signal(LifecycleEvent::Credential, Value::Null, addr).await?;
                Ok(Some(wait))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(" Server ".parse::<Role>().unwrap(), Role::Server);
        assert_eq!("client".parse::<Role>().unwrap(), Role::Client);
        assert!("peer".parse::<Role>().unwrap_err().is_config());
    }

    #[test]
    fn test_encode_passes_bytes_through() {
        let raw = vec![0xff, 0x00, 0x10];
        assert_eq!(encode(raw.clone()).unwrap(), raw);
        assert_eq!(encode("hello").unwrap(), b"hello");
        assert_eq!(encode(json!([20, "ref"])).unwrap(), br#"[20,"ref"]"#);
    }

    #[test]
    fn test_decode_falls_back_to_text() {
        assert_eq!(decode(br#"[10,42]"#), json!([10, 42]));
        assert_eq!(decode(b"not json"), json!("not json"));
    }

    #[test]
    fn test_parse_message() {
        let (event, payload) = parse_message(json!([20, "2024-01-01_1_subject"])).unwrap();
        assert_eq!(event, LifecycleEvent::Start);
        assert_eq!(payload, json!("2024-01-01_1_subject"));

        let (event, payload) = parse_message(json!(["expend"])).unwrap();
        assert_eq!(event, LifecycleEvent::End);
        assert_eq!(payload, Value::Null);

        let (_, payload) = parse_message(json!([10, 1, 2])).unwrap();
        assert_eq!(payload, json!([1, 2]));

        assert!(parse_message(json!({"event": 10})).is_err());
        assert!(parse_message(json!([])).is_err());
        assert!(parse_message(json!([99, null])).is_err());
    }

    #[test]
    fn test_start_payload() {
        assert_eq!(start_payload("ref", Value::Null), json!("ref"));
        assert_eq!(start_payload("ref", json!({"n": 1})), json!(["ref", {"n": 1}]));
    }

    #[test]
    fn test_subscriber_fire() {
        let (tx, mut rx) = oneshot::channel();
        let addr: SocketAddr = "127.0.0.1:1001".parse().unwrap();
        let waiter = Subscriber::Waiter(tx);
        assert!(waiter.is_invokable());
        assert!(waiter.fire(&json!(42), addr).is_none());
        assert_eq!(rx.try_recv().unwrap(), (json!(42), addr));

        let callback = Subscriber::callback(|_, _| {});
        assert!(callback.fire(&Value::Null, addr).is_some());
    }

    #[test]
    fn test_closed_waiter_is_not_invokable() {
        let (tx, rx) = oneshot::channel::<(Value, SocketAddr)>();
        drop(rx);
        assert!(!Subscriber::Waiter(tx).is_invokable());
    }

    #[tokio::test]
    async fn test_event_wait_cancelled_when_sender_dropped() {
        let (tx, rx) = oneshot::channel();
        let wait = EventWait::new(LifecycleEvent::Init, "rig", rx);
        drop(tx);

        let err = wait.await.unwrap_err();
        assert!(matches!(err, CommError::Cancelled { .. }));
        assert!(err.to_string().contains("rig"));
    }

    #[tokio::test]
    async fn test_event_wait_timeout() {
        let (_tx, rx) = oneshot::channel();
        let wait = EventWait::new(LifecycleEvent::Start, "rig", rx);

        let err = wait.timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("EXPSTART"));
    }
}

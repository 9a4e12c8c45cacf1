//! Services orchestrator
//!
//! Groups connected communicators under their names and fans lifecycle commands
//! out to all of them, either concurrently under one shared timeout or one
//! member at a time.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CommError, CommResult};
use crate::net::communicator::{Callback, Communicator, EventWait, Role, Subscriber};
use crate::net::echo::EchoCommunicator;
use crate::net::event::{EventKey, LifecycleEvent};

/// Payload reported by each member, keyed by member name
pub type Responses = HashMap<String, Value>;

/// A lifecycle command applied to each member
enum Directive<'a> {
    Init(&'a Value),
    Start(&'a str, &'a Value),
    Stop(&'a Value, bool),
    Cleanup(&'a Value),
}

impl Directive<'_> {
    /// Event each member reports back once the command is done
    fn response_event(&self) -> LifecycleEvent {
        match self {
            Directive::Init(_) => LifecycleEvent::Init,
            Directive::Start(..) => LifecycleEvent::Start,
            // An interrupted rig still reports the end of its experiment
            Directive::Stop(..) => LifecycleEvent::End,
            Directive::Cleanup(_) => LifecycleEvent::Cleanup,
        }
    }

    async fn apply<C: Communicator>(&self, member: &C) -> CommResult<()> {
        match self {
            Directive::Init(data) => member.init((*data).clone()).await,
            Directive::Start(exp_ref, data) => member.start(exp_ref, (*data).clone()).await,
            Directive::Stop(data, immediately) => member.stop((*data).clone(), *immediately).await,
            Directive::Cleanup(data) => member.cleanup((*data).clone()).await,
        }
    }
}

/// A fixed, name-addressed group of communicators
///
/// Membership is set at construction and never changes.
pub struct Services<C = EchoCommunicator>
where
    C: Communicator + Clone + 'static,
{
    members: Vec<C>,
    index: HashMap<String, usize>,
    timeout: Option<Duration>,
}

impl<C> Services<C>
where
    C: Communicator + Clone + 'static,
{
    /// Build the group
    ///
    /// With a credential, each member answers a credential request (an `ALYX`
    /// message with a null payload) by sending the credential back. `timeout`
    /// bounds every collective wait; `None` waits forever.
    pub async fn new(members: Vec<C>, credential: Option<Value>, timeout: Option<Duration>) -> CommResult<Self> {
        debug!(count = members.len(), ?timeout, "Services::new: called");
        let mut seen = HashSet::new();
        let mut index = HashMap::new();
        for (i, member) in members.iter().enumerate() {
            if !seen.insert(member.name().to_string()) {
                return Err(CommError::config(format!("Duplicate service name \"{}\"", member.name())));
            }
            index.insert(member.name().to_string(), i);
        }

        if let Some(token) = credential {
            for member in &members {
                member
                    .assign_callback(LifecycleEvent::Credential, credential_responder(member.clone(), token.clone()))
                    .await?;
            }
        }

        info!(names = ?members.iter().map(|m| m.name()).collect::<Vec<_>>(), "Services created");
        Ok(Self {
            members,
            index,
            timeout,
        })
    }

    pub fn get(&self, name: &str) -> Option<&C> {
        self.index.get(name).map(|&i| &self.members[i])
    }

    /// Member names in construction order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name())
    }

    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Register a payload callback on every member
    pub async fn assign_callback<E>(&self, event: E, callback: Callback) -> CommResult<()>
    where
        E: Into<EventKey> + Send,
    {
        let event = LifecycleEvent::validate(event)?;
        for member in &self.members {
            member
                .assign_callback(event, Subscriber::Callback(callback.clone()))
                .await?;
        }
        Ok(())
    }

    /// Register a callback on every member that also receives the member itself
    pub async fn assign_peer_callback<E, F>(&self, event: E, callback: F) -> CommResult<()>
    where
        E: Into<EventKey> + Send,
        F: Fn(Value, SocketAddr, C) + Send + Sync + 'static,
    {
        let event = LifecycleEvent::validate(event)?;
        let callback = Arc::new(callback);
        for member in &self.members {
            let peer = member.clone();
            let callback = callback.clone();
            member
                .assign_callback(
                    event,
                    Subscriber::callback(move |payload, addr| callback(payload, addr, peer.clone())),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn clear_callbacks<E>(&self, event: E) -> CommResult<()>
    where
        E: Into<EventKey> + Send,
    {
        let event = LifecycleEvent::validate(event)?;
        for member in &self.members {
            member.clear_callbacks(event).await?;
        }
        Ok(())
    }

    /// Wait for every member to report `event`
    ///
    /// Fails as soon as a member's wait fails (for instance because it was
    /// closed). If the shared timeout expires first, the error names every
    /// member that has not responded.
    pub async fn await_all<E>(&self, event: E) -> CommResult<Responses>
    where
        E: Into<EventKey> + Send,
    {
        let event = LifecycleEvent::validate(event)?;
        debug!(%event, "Services::await_all: called");
        let waits = self.register_waits(event).await?;
        self.collect(event, waits).await
    }

    pub async fn init(&self, data: Value, concurrent: bool) -> CommResult<Responses> {
        self.signal_all(Directive::Init(&data), concurrent).await
    }

    pub async fn start(&self, exp_ref: &str, data: Value, concurrent: bool) -> CommResult<Responses> {
        self.signal_all(Directive::Start(exp_ref, &data), concurrent).await
    }

    /// Stop (or interrupt) every member and wait for each to report the end
    pub async fn stop(&self, data: Value, immediately: bool, concurrent: bool) -> CommResult<Responses> {
        self.signal_all(Directive::Stop(&data, immediately), concurrent)
            .await
    }

    pub async fn cleanup(&self, data: Value, concurrent: bool) -> CommResult<Responses> {
        self.signal_all(Directive::Cleanup(&data), concurrent).await
    }

    /// Send a credential token to every member
    pub async fn credential(&self, token: Value) -> CommResult<()> {
        debug!("Services::credential: called");
        let sends = self.members.iter().map(|m| m.credential(Some(token.clone()), None));
        for result in join_all(sends).await {
            result?;
        }
        Ok(())
    }

    /// Close every member; already closed members are fine
    pub async fn close(&self) {
        debug!("Services::close: called");
        join_all(self.members.iter().map(|m| m.close())).await;
    }

    async fn signal_all(&self, directive: Directive<'_>, concurrent: bool) -> CommResult<Responses> {
        let event = directive.response_event();
        debug!(%event, concurrent, "Services::signal_all: called");

        if concurrent {
            let waits = self.register_waits(event).await?;
            let sends = self.members.iter().map(|m| directive.apply(m));
            for result in join_all(sends).await {
                result?;
            }
            return self.collect(event, waits).await;
        }

        let mut responses = Responses::new();
        for member in &self.members {
            let wait = member.on_event(event).await?;
            directive.apply(member).await?;
            let (payload, _) = match self.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(name = %member.name(), %event, "Service failed to respond in time");
                        member.close().await;
                        return Err(CommError::ServicesTimeout {
                            event: event.to_string(),
                            missing: vec![member.name().to_string()],
                        });
                    }
                },
                None => wait.await?,
            };
            responses.insert(member.name().to_string(), payload);
        }
        Ok(responses)
    }

    async fn register_waits(&self, event: LifecycleEvent) -> CommResult<Vec<EventWait>> {
        let mut waits = Vec::with_capacity(self.members.len());
        for member in &self.members {
            waits.push(member.on_event(event).await?);
        }
        Ok(waits)
    }

    async fn collect(&self, event: LifecycleEvent, waits: Vec<EventWait>) -> CommResult<Responses> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut pending: FuturesUnordered<_> = waits
            .into_iter()
            .map(|wait| async move {
                let name = wait.peer().to_string();
                (name, wait.await)
            })
            .collect();

        let mut responses = Responses::new();
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => pending.next().await,
            };
            match next {
                Some((name, Ok((payload, _)))) => {
                    responses.insert(name, payload);
                }
                Some((_, Err(e))) => return Err(e),
                None => return Ok(responses),
            }
        }

        let missing: Vec<String> = self
            .names()
            .filter(|name| !responses.contains_key(*name))
            .map(str::to_string)
            .collect();
        warn!(%event, ?missing, "Services failed to respond in time");
        // A silent member is treated like a failed confirmation
        join_all(missing.iter().filter_map(|name| self.get(name)).map(|m| m.close())).await;
        Err(CommError::ServicesTimeout {
            event: event.to_string(),
            missing,
        })
    }
}

/// Callback that answers a credential request from `member` with `token`
fn credential_responder<C>(member: C, token: Value) -> Subscriber
where
    C: Communicator + Clone + 'static,
{
    Subscriber::callback(move |payload, addr| {
        if !payload.is_null() {
            return;
        }
        info!(name = %member.name(), %addr, "Credential requested");
        let member = member.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let dest = match member.role() {
                Role::Server => Some(addr),
                Role::Client => None,
            };
            if let Err(e) = member.signal(LifecycleEvent::Credential, token, dest).await {
                warn!(name = %member.name(), error = %e, "Failed to send credential");
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::communicator::{Frame, parse_message};
    use crate::net::uri::Endpoint;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory rig that answers each command with the same event after a delay
    #[derive(Clone)]
    struct MockComm {
        name: String,
        endpoint: Endpoint,
        respond_after: Option<Duration>,
        log: Arc<Mutex<Vec<String>>>,
        sent: Arc<Mutex<Vec<Value>>>,
        subscribers: Arc<Mutex<HashMap<LifecycleEvent, Vec<Subscriber>>>>,
        connected: Arc<AtomicBool>,
    }

    impl MockComm {
        fn new(name: &str, respond_after: Option<Duration>, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                endpoint: Endpoint::parse("udp://127.0.0.1:1001").unwrap(),
                respond_after,
                log,
                sent: Arc::new(Mutex::new(Vec::new())),
                subscribers: Arc::new(Mutex::new(HashMap::new())),
                connected: Arc::new(AtomicBool::new(true)),
            }
        }

        fn fire(&self, event: LifecycleEvent, payload: Value) {
            self.log.lock().unwrap().push(format!("{}:respond", self.name));
            let addr: SocketAddr = "127.0.0.1:1001".parse().unwrap();
            let mut subscribers = self.subscribers.lock().unwrap();
            if let Some(subs) = subscribers.remove(&event) {
                let kept: Vec<Subscriber> = subs.into_iter().filter_map(|s| s.fire(&payload, addr)).collect();
                if !kept.is_empty() {
                    subscribers.insert(event, kept);
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl Communicator for MockComm {
        fn role(&self) -> Role {
            Role::Client
        }

        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn add_subscriber(&self, event: LifecycleEvent, subscriber: Subscriber) -> CommResult<()> {
            self.subscribers.lock().unwrap().entry(event).or_default().push(subscriber);
            Ok(())
        }

        async fn remove_subscribers(&self, event: LifecycleEvent) -> CommResult<()> {
            self.subscribers.lock().unwrap().remove(&event);
            Ok(())
        }

        async fn confirmed_send(
            &self,
            frame: Frame,
            _addr: Option<SocketAddr>,
            _timeout: Option<Duration>,
        ) -> CommResult<()> {
            let Frame::Json(message) = frame else {
                return Err(CommError::config("mock only takes JSON"));
            };
            self.log.lock().unwrap().push(format!("{}:send", self.name));
            self.sent.lock().unwrap().push(message.clone());

            let (event, payload) = parse_message(message)?;
            if let Some(delay) = self.respond_after {
                let this = self.clone();
                let event = if event == LifecycleEvent::Interrupt {
                    LifecycleEvent::End
                } else {
                    event
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.fire(event, json!({"name": this.name, "payload": payload}));
                });
            }
            Ok(())
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.subscribers.lock().unwrap().clear();
        }
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let log = log();
        let members = vec![MockComm::new("rig", None, log.clone()), MockComm::new("rig", None, log)];
        let err = Services::new(members, None, None).await.err().unwrap();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_accessors_preserve_order() {
        let log = log();
        let members = vec![
            MockComm::new("b", None, log.clone()),
            MockComm::new("a", None, log.clone()),
            MockComm::new("c", None, log),
        ];
        let services = Services::new(members, None, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(services.names().collect::<Vec<_>>(), ["b", "a", "c"]);
        assert_eq!(services.len(), 3);
        assert!(!services.is_empty());
        assert_eq!(services.get("a").unwrap().name(), "a");
        assert!(services.get("d").is_none());
        assert_eq!(services.timeout(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_concurrent_sends_all_before_any_response() {
        let log = log();
        let delay = Some(Duration::from_millis(50));
        let members = vec![
            MockComm::new("a", delay, log.clone()),
            MockComm::new("b", delay, log.clone()),
            MockComm::new("c", delay, log.clone()),
        ];
        let services = Services::new(members, None, Some(Duration::from_secs(2))).await.unwrap();

        let responses = services.init(json!(42), true).await.unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses["b"], json!({"name": "b", "payload": 42}));

        let entries = log.lock().unwrap().clone();
        let first_response = entries.iter().position(|e| e.ends_with(":respond")).unwrap();
        assert_eq!(first_response, 3, "all sends precede responses: {entries:?}");
    }

    #[tokio::test]
    async fn test_sequential_awaits_each_member_in_order() {
        let log = log();
        let delay = Some(Duration::from_millis(20));
        let members = vec![
            MockComm::new("a", delay, log.clone()),
            MockComm::new("b", delay, log.clone()),
            MockComm::new("c", delay, log.clone()),
        ];
        let services = Services::new(members, None, Some(Duration::from_secs(2))).await.unwrap();

        let responses = services.start("2024-01-01_1_subject", Value::Null, false).await.unwrap();
        assert_eq!(responses["a"]["payload"], json!("2024-01-01_1_subject"));

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            ["a:send", "a:respond", "b:send", "b:respond", "c:send", "c:respond"]
        );
    }

    #[tokio::test]
    async fn test_sequential_timeout_names_member() {
        let log = log();
        let members = vec![
            MockComm::new("a", Some(Duration::from_millis(10)), log.clone()),
            MockComm::new("b", None, log.clone()),
            MockComm::new("c", Some(Duration::from_millis(10)), log.clone()),
        ];
        let services = Services::new(members, None, Some(Duration::from_millis(200))).await.unwrap();

        let err = services.cleanup(Value::Null, false).await.unwrap_err();
        assert_eq!(err.missing_services(), ["b"]);
        assert!(err.is_connection_fatal());
        assert!(!log.lock().unwrap().contains(&"c:send".to_string()));

        assert!(services.get("a").unwrap().is_connected());
        assert!(!services.get("b").unwrap().is_connected());
        assert!(services.get("c").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_await_all_timeout_names_only_missing() {
        let log = log();
        let members = vec![
            MockComm::new("a", None, log.clone()),
            MockComm::new("b", None, log.clone()),
            MockComm::new("c", None, log.clone()),
        ];
        let (a, c) = (members[0].clone(), members[2].clone());
        let services = Services::new(members, None, Some(Duration::from_millis(300))).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            a.fire(LifecycleEvent::Status, json!("ready"));
            c.fire(LifecycleEvent::Status, json!("ready"));
        });

        let err = services.await_all("EXPSTATUS").await.unwrap_err();
        assert!(matches!(err, CommError::ServicesTimeout { .. }));
        assert_eq!(err.missing_services(), ["b"]);

        // Only the silent member is closed, and its stale waiter goes with it
        let b = services.get("b").unwrap();
        assert!(!b.is_connected());
        assert!(b.subscribers.lock().unwrap().is_empty());
        assert!(services.get("a").unwrap().is_connected());
        assert!(services.get("c").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_await_all_fails_fast_when_member_closed() {
        let log = log();
        let members = vec![MockComm::new("a", None, log.clone()), MockComm::new("b", None, log)];
        let b = members[1].clone();
        let services = Services::new(members, None, Some(Duration::from_secs(5))).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            b.close().await;
        });

        let started = Instant::now();
        let err = services.await_all(LifecycleEvent::Init).await.unwrap_err();
        assert!(matches!(err, CommError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stop_immediately_awaits_end() {
        let log = log();
        let members = vec![MockComm::new("a", Some(Duration::from_millis(10)), log)];
        let a = members[0].clone();
        let services = Services::new(members, None, Some(Duration::from_secs(1))).await.unwrap();

        let responses = services.stop(Value::Null, true, true).await.unwrap();
        assert!(responses.contains_key("a"));
        assert_eq!(a.sent.lock().unwrap()[0], json!([50, null]));
    }

    #[tokio::test]
    async fn test_credential_request_is_answered() {
        let log = log();
        let members = vec![MockComm::new("a", None, log)];
        let a = members[0].clone();
        let token = json!({"token": "secret"});
        let _services = Services::new(members, Some(token.clone()), None).await.unwrap();

        // A non-null payload is a credential, not a request
        a.fire(LifecycleEvent::Credential, json!("other"));
        a.fire(LifecycleEvent::Credential, Value::Null);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = a.sent.lock().unwrap().clone();
        assert_eq!(sent, [json!([3, {"token": "secret"}])]);
    }

    #[tokio::test]
    async fn test_peer_callback_receives_member() {
        let log = log();
        let members = vec![MockComm::new("a", None, log.clone()), MockComm::new("b", None, log)];
        let b = members[1].clone();
        let services = Services::new(members, None, None).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        services
            .assign_peer_callback(LifecycleEvent::Info, move |payload, _, peer: MockComm| {
                sink.lock().unwrap().push((peer.name().to_string(), payload));
            })
            .await
            .unwrap();

        b.fire(LifecycleEvent::Info, json!(7));
        assert_eq!(seen.lock().unwrap().clone(), [("b".to_string(), json!(7))]);

        services.clear_callbacks(LifecycleEvent::Info).await.unwrap();
        b.fire(LifecycleEvent::Info, json!(8));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_assign_callback_rejects_unknown_event() {
        let services = Services::new(vec![MockComm::new("a", None, log())], None, None).await.unwrap();
        let callback: Callback = Arc::new(|_, _| {});
        assert!(services.assign_callback("EXPBOGUS", callback).await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let log = log();
        let members = vec![MockComm::new("a", None, log.clone()), MockComm::new("b", None, log)];
        let services = Services::new(members, None, None).await.unwrap();
        services.close().await;
        services.close().await;
        assert!(services.iter().all(|m| !m.is_connected()));
    }
}

//! The message channel actor.
//!
//! `MessageChannel` is a cheap, cloneable handle. All channel state lives in
//! a single task (`ChannelActor`) that owns the transport, the outbound
//! queue, the handler table, in-flight requests and the duplicate window.
//! Handles talk to it through an unbounded command queue, so `notify` and
//! `on` never block and never fail. Connection attempts and handler futures
//! run in their own tasks and report back through the same queue; the actor
//! itself never awaits either.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected -> Disconnected ...`.
//! A lost transport is re-established on the backoff schedule when
//! `auto_reconnect` is set or a reconnect is forced. The channel becomes
//! `Closed` when the schedule runs out, when `close()` is called, or when the
//! last handle is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::dedup::{SeenKey, SeenWindow};
use crate::error::{ChannelError, RpcError, TransportError};
use crate::handler::{Handler, HandlerFuture, HandlerTable};
use crate::message::{Heartbeat, Message, RequestId};
use crate::transport::{Connector, Dispatcher, Link, PortEvent, Transport};

/// Default time a request waits for its response.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback fired on connection lifecycle events.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Consecutive unanswered pings after which the link is declared dead.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_missed: 3,
        }
    }
}

#[derive(Clone)]
pub struct ChannelOptions {
    pub auto_reconnect: bool,
    pub heartbeat: Option<HeartbeatConfig>,
    pub backoff: BackoffConfig,
    pub request_timeout: Duration,
    pub on_disconnect: Option<Hook>,
    pub on_connection_error: Option<Hook>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            heartbeat: None,
            backoff: BackoffConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            on_disconnect: None,
            on_connection_error: None,
        }
    }
}

impl ChannelOptions {
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn on_disconnect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn on_connection_error(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connection_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("auto_reconnect", &self.auto_reconnect)
            .field("heartbeat", &self.heartbeat)
            .field("backoff", &self.backoff)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

enum Command {
    Connect(Arc<dyn Connector>),
    /// Outcome of the connection attempt with the given id.
    Attempt(u64, Result<Link, TransportError>),
    Post(Message),
    Request {
        method: String,
        params: Option<Value>,
        respond_to: oneshot::Sender<Result<Value, ChannelError>>,
    },
    Register {
        method: String,
        handler: Arc<dyn Handler>,
    },
    RequestTimeout(RequestId),
    Reconnect,
    Close,
}

/// Handle to a channel actor.
#[derive(Clone)]
pub struct MessageChannel {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl MessageChannel {
    /// Spawn an empty, disconnected channel. Messages sent before `connect_with`
    /// are queued. Must be called inside a tokio runtime.
    pub fn spawn(name: impl Into<String>, options: ChannelOptions) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);

        let actor = ChannelActor {
            name: name.clone(),
            seen: SeenWindow::new(),
            options,
            connector: None,
            transport: None,
            link_id: 0,
            attempt: 0,
            connecting: None,
            queue: VecDeque::new(),
            handlers: HandlerTable::default(),
            pending: HashMap::new(),
            backoff: None,
            next_request_id: 1,
            missed_pongs: 0,
            reconnect_at: None,
            closed: false,
            commands: commands_tx.downgrade(),
            inbound: inbound_tx,
            state: state_tx,
        };
        tokio::spawn(actor.run(commands_rx, inbound_rx));

        Self {
            name,
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Spawn a channel and immediately start connecting through `connector`.
    pub fn connect(
        name: impl Into<String>,
        connector: impl Connector,
        options: ChannelOptions,
    ) -> Self {
        let channel = Self::spawn(name, options);
        channel.connect_with(connector);
        channel
    }

    /// Replace the connector and (re)connect through it.
    pub fn connect_with(&self, connector: impl Connector) {
        self.send(Command::Connect(Arc::new(connector)));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed() || self.state() == ChannelState::Closed
    }

    /// Fire-and-forget notification. Queued while disconnected.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        self.send(Command::Post(Message::notification(method, params)));
    }

    /// Notification with serializable params. Unserializable params are
    /// logged and the notification is dropped.
    pub fn notify_with<P: Serialize>(&self, method: &str, params: &P) {
        match serde_json::to_value(params) {
            Ok(value) => self.notify(method, Some(value)),
            Err(e) => warn!(channel = %self.name, method, error = %e, "dropping notification"),
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                respond_to: tx,
            })
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Typed wrapper around `request`.
    pub async fn request_with<P, R>(&self, method: &str, params: &P) -> Result<R, ChannelError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| ChannelError::InvalidPayload(e.to_string()))?;
        let result = self.request(method, Some(params)).await?;
        serde_json::from_value(result).map_err(|e| ChannelError::InvalidPayload(e.to_string()))
    }

    /// Register the handler for `method`. If a handler is already registered
    /// the call has no effect.
    pub fn on(&self, method: &str, handler: impl Handler) {
        self.send(Command::Register {
            method: method.to_string(),
            handler: Arc::new(handler),
        });
    }

    /// Drop the current transport (if any) and reconnect on the backoff
    /// schedule even when `auto_reconnect` is off.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Tear the channel down. Pending requests fail with `Closed`.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(channel = %self.name, "channel actor is gone");
        }
    }
}

struct PendingRequest {
    respond_to: oneshot::Sender<Result<Value, ChannelError>>,
    timer: JoinHandle<()>,
}

struct ChannelActor {
    name: Arc<str>,
    options: ChannelOptions,
    connector: Option<Arc<dyn Connector>>,
    transport: Option<Box<dyn Transport>>,
    /// Bumped whenever a transport is attached or dropped; inbound events
    /// tagged with an older id belong to a dead link.
    link_id: u64,
    /// Id of the latest connection attempt. Results of older attempts are
    /// discarded.
    attempt: u64,
    connecting: Option<JoinHandle<()>>,
    queue: VecDeque<Message>,
    handlers: HandlerTable,
    pending: HashMap<RequestId, PendingRequest>,
    seen: SeenWindow,
    backoff: Option<Backoff>,
    next_request_id: u64,
    missed_pongs: u32,
    reconnect_at: Option<Instant>,
    closed: bool,
    commands: mpsc::WeakUnboundedSender<Command>,
    inbound: mpsc::UnboundedSender<(u64, PortEvent)>,
    state: watch::Sender<ChannelState>,
}

impl ChannelActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<(u64, PortEvent)>,
    ) {
        let mut heartbeat = self.options.heartbeat.map(|hb| {
            let mut interval = tokio::time::interval(hb.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        while !self.closed {
            let reconnect_at = self.reconnect_at;
            let connected = self.transport.is_some();

            // Commands first: a handler registered before a message arrives
            // must see that message.
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Close) | None => self.shutdown(),
                    Some(command) => self.handle_command(command),
                },
                Some((link_id, event)) = inbound.recv() => {
                    self.handle_port_event(link_id, event);
                }
                _ = sleep_until_or_never(reconnect_at) => {
                    self.reconnect_at = None;
                    self.establish();
                }
                _ = tick_or_never(heartbeat.as_mut(), connected) => {
                    self.beat();
                }
            }
        }

        debug!(channel = %self.name, "channel actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(connector) => {
                self.connector = Some(connector);
                self.backoff = None;
                self.reconnect_at = None;
                self.establish();
            }
            Command::Attempt(attempt, result) => self.finish_attempt(attempt, result),
            Command::Post(message) => self.post(message),
            Command::Request {
                method,
                params,
                respond_to,
            } => self.start_request(method, params, respond_to),
            Command::Register { method, handler } => {
                if !self.handlers.register(method.clone(), handler) {
                    debug!(channel = %self.name, method, "handler already registered, keeping the first");
                }
            }
            Command::RequestTimeout(id) => {
                if let Some(pending) = self.pending.remove(&id) {
                    warn!(channel = %self.name, %id, "request timed out");
                    let _ = pending
                        .respond_to
                        .send(Err(ChannelError::Timeout(self.options.request_timeout)));
                }
            }
            Command::Reconnect => {
                self.cancel_attempt();
                if self.transport.is_some() {
                    self.drop_transport();
                }
                self.set_state(ChannelState::Disconnected);
                self.schedule_reconnect(true);
            }
            Command::Close => self.shutdown(),
        }
    }

    /// Start a connection attempt. Its outcome comes back as
    /// `Command::Attempt`.
    fn establish(&mut self) {
        let Some(connector) = self.connector.clone() else {
            debug!(channel = %self.name, "no connector, staying disconnected");
            return;
        };
        if self.transport.is_some() {
            self.drop_transport();
        }
        self.cancel_attempt();

        self.attempt += 1;
        let attempt = self.attempt;
        let commands = self.commands.clone();
        self.set_state(ChannelState::Connecting);
        self.connecting = Some(tokio::spawn(async move {
            let result = connector.connect().await;
            let Some(commands) = commands.upgrade() else {
                return;
            };
            if let Err(mpsc::error::SendError(Command::Attempt(_, Ok(link)))) =
                commands.send(Command::Attempt(attempt, result))
            {
                link.discard();
            }
        }));
    }

    /// Abandon the in-flight connection attempt, if any.
    fn cancel_attempt(&mut self) {
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
            self.attempt += 1;
        }
    }

    fn finish_attempt(&mut self, attempt: u64, result: Result<Link, TransportError>) {
        if attempt != self.attempt || self.connecting.is_none() {
            debug!(channel = %self.name, attempt, "ignoring a superseded connection attempt");
            if let Ok(link) = result {
                link.discard();
            }
            return;
        }
        self.connecting = None;

        match result {
            Ok(link) => {
                self.attach(link);
                self.missed_pongs = 0;
                self.set_state(ChannelState::Connected);
                info!(channel = %self.name, queued = self.queue.len(), "channel connected");
                self.drain_queue();
            }
            Err(e) => {
                warn!(channel = %self.name, error = %e, "connection attempt failed");
                self.set_state(ChannelState::Disconnected);
                if let Some(hook) = &self.options.on_connection_error {
                    hook();
                }
                if self.options.auto_reconnect {
                    self.schedule_reconnect(false);
                }
            }
        }
    }

    fn attach(&mut self, link: Link) {
        self.link_id += 1;
        let link_id = self.link_id;
        match link {
            Link::Direct {
                transport,
                mut events,
            } => {
                let inbound = self.inbound.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let disconnected = event == PortEvent::Disconnected;
                        if inbound.send((link_id, event)).is_err() || disconnected {
                            return;
                        }
                    }
                    // Event source dropped without saying goodbye
                    let _ = inbound.send((link_id, PortEvent::Disconnected));
                });
                self.transport = Some(transport);
            }
            Link::Adapter { transport, bind } => {
                bind(Dispatcher::new(self.inbound.clone(), link_id));
                self.transport = Some(transport);
            }
        }
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.link_id += 1;
    }

    fn handle_port_event(&mut self, link_id: u64, event: PortEvent) {
        if link_id != self.link_id {
            debug!(channel = %self.name, "ignoring event from a previous link");
            return;
        }
        match event {
            PortEvent::Message(message) => self.handle_message(message),
            PortEvent::Disconnected => self.handle_disconnect(),
        }
    }

    fn handle_disconnect(&mut self) {
        self.drop_transport();
        self.set_state(ChannelState::Disconnected);
        info!(channel = %self.name, "transport disconnected");
        if let Some(hook) = &self.options.on_disconnect {
            hook();
        }
        self.schedule_reconnect(false);
    }

    fn schedule_reconnect(&mut self, force: bool) {
        if !(force || self.options.auto_reconnect) || self.connector.is_none() {
            return;
        }
        let config = self.options.backoff;
        let backoff = self.backoff.get_or_insert_with(|| config.start());
        match backoff.next() {
            Some(delay) => {
                debug!(channel = %self.name, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                warn!(channel = %self.name, "reconnect backoff exhausted, giving up");
                self.shutdown();
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        // Any traffic proves the link is alive
        self.backoff = None;

        match message {
            Message::Heartbeat { heartbeat } => match heartbeat {
                Heartbeat::Ping => self.send_now(Message::pong()),
                Heartbeat::Pong => self.missed_pongs = 0,
            },
            Message::Request { id, method, params } => {
                if !self.seen.insert(SeenKey::Request(id.clone())) {
                    warn!(channel = %self.name, %id, method, "duplicate request, not executing again");
                    return;
                }
                self.dispatch(Some(id), method, params);
            }
            Message::Notification { method, params } => self.dispatch(None, method, params),
            Message::Response { id, result, error } => {
                if !self.seen.insert(SeenKey::Response(id.clone())) {
                    warn!(channel = %self.name, %id, "duplicate response dropped");
                    return;
                }
                self.resolve(id, result, error);
            }
        }
    }

    fn dispatch(&mut self, id: Option<RequestId>, method: String, params: Option<Value>) {
        let Some(handler) = self.handlers.get(&method) else {
            warn!(channel = %self.name, method, "unhandled method");
            if let Some(id) = id {
                self.post(Message::error(id, RpcError::method_not_found(&method)));
            }
            return;
        };
        let future = handler.call(params);
        tokio::spawn(run_handler(
            self.name.clone(),
            id,
            method,
            future,
            self.commands.clone(),
        ));
    }

    fn resolve(&mut self, id: RequestId, result: Option<Value>, error: Option<RpcError>) {
        let Some(pending) = self.pending.remove(&id) else {
            warn!(channel = %self.name, %id, "response without a pending request");
            return;
        };
        pending.timer.abort();
        let outcome = match error {
            Some(error) => {
                debug!(channel = %self.name, %id, code = error.code, "request failed remotely");
                Err(ChannelError::Remote(error))
            }
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = pending.respond_to.send(outcome);
    }

    fn start_request(
        &mut self,
        method: String,
        params: Option<Value>,
        respond_to: oneshot::Sender<Result<Value, ChannelError>>,
    ) {
        let id = RequestId::Number(self.next_request_id);
        self.next_request_id += 1;

        let timeout = self.options.request_timeout;
        let commands = self.commands.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::RequestTimeout(timer_id));
            }
        });

        self.pending.insert(id.clone(), PendingRequest { respond_to, timer });
        self.post(Message::request(id, method, params));
    }

    fn beat(&mut self) {
        let Some(heartbeat) = self.options.heartbeat else {
            return;
        };
        if self.missed_pongs >= heartbeat.max_missed {
            warn!(channel = %self.name, missed = self.missed_pongs, "heartbeat lost");
            self.handle_disconnect();
            return;
        }
        self.missed_pongs += 1;
        self.send_now(Message::ping());
    }

    /// Send if connected, otherwise queue. Queued messages drain FIFO.
    fn post(&mut self, message: Message) {
        if self.transport.is_none() {
            self.queue.push_back(message);
            return;
        }
        if !self.queue.is_empty() {
            self.queue.push_back(message);
            self.drain_queue();
            return;
        }
        if let Err(message) = self.try_send(message) {
            self.queue.push_back(message);
            self.handle_disconnect();
        }
    }

    fn drain_queue(&mut self) {
        while let Some(message) = self.queue.pop_front() {
            if let Err(message) = self.try_send(message) {
                self.queue.push_front(message);
                self.handle_disconnect();
                return;
            }
        }
    }

    /// Send on the live transport, handing the message back on failure.
    fn try_send(&mut self, message: Message) -> Result<(), Message> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(message);
        };
        match transport.send(&message) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(channel = %self.name, error = %e, "send failed");
                Err(message)
            }
        }
    }

    /// Heartbeats are never queued.
    fn send_now(&mut self, message: Message) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.send(&message) {
                debug!(channel = %self.name, error = %e, "heartbeat send failed");
            }
        }
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reconnect_at = None;
        self.cancel_attempt();
        self.drop_transport();
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
            let _ = pending.respond_to.send(Err(ChannelError::Closed));
        }
        if !self.queue.is_empty() {
            debug!(channel = %self.name, dropped = self.queue.len(), "discarding queued messages");
            self.queue.clear();
        }
        self.set_state(ChannelState::Closed);
        info!(channel = %self.name, "channel closed");
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }
}

/// Drives one handler future and posts the response of a request back
/// through the actor.
async fn run_handler(
    name: Arc<str>,
    id: Option<RequestId>,
    method: String,
    future: HandlerFuture,
    commands: mpsc::WeakUnboundedSender<Command>,
) {
    let outcome = future.await;
    let Some(id) = id else {
        if let Err(e) = outcome {
            debug!(channel = %name, method, error = %e, "notification handler failed");
        }
        return;
    };
    let response = match outcome {
        Ok(result) => Message::result(id, result),
        Err(error) => Message::error(id, error),
    };
    if let Some(commands) = commands.upgrade() {
        let _ = commands.send(Command::Post(response));
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_or_never(interval: Option<&mut Interval>, active: bool) {
    match interval {
        Some(interval) if active => {
            interval.tick().await;
        }
        _ => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::codes;
    use crate::memory::{self, MemoryPort};
    use crate::transport::once;

    /// Channel connected to a raw port the test drives by hand.
    fn channel_with_remote(options: ChannelOptions) -> (MessageChannel, MemoryPort) {
        let (local, remote) = memory::pair();
        let channel = MessageChannel::connect("test", once(local.into_direct()), options);
        (channel, remote)
    }

    async fn wait_for(channel: &MessageChannel, wanted: ChannelState) {
        let mut state = channel.watch_state();
        state
            .wait_for(|s| *s == wanted)
            .await
            .expect("state sender dropped");
    }

    /// Connector handing out a fresh memory pair per attempt; the remote
    /// ends arrive on the returned receiver.
    fn pair_connector() -> (impl Connector, mpsc::UnboundedReceiver<MemoryPort>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel::<MemoryPort>();
        let connector = move || {
            let peers_tx = peers_tx.clone();
            async move {
                let (local, remote) = memory::pair();
                peers_tx
                    .send(remote)
                    .map_err(|_| TransportError::ConnectFailed("test over".into()))?;
                Ok::<_, TransportError>(local.into_direct())
            }
        };
        (connector, peers_rx)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        (count, move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn queued_notifications_drain_in_order() {
        let channel = MessageChannel::spawn("test", ChannelOptions::default());
        channel.notify("a", None);
        channel.notify("b", Some(json!({"n": 2})));
        channel.notify("c", None);

        let (local, mut remote) = memory::pair();
        channel.connect_with(once(local.into_direct()));

        let methods: Vec<String> = [
            remote.recv_message().await.unwrap(),
            remote.recv_message().await.unwrap(),
            remote.recv_message().await.unwrap(),
        ]
        .iter()
        .map(|m| m.method().unwrap().to_string())
        .collect();
        assert_eq!(methods, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn request_response_between_two_channels() {
        let (left, right) = memory::pair();
        let server = MessageChannel::connect("server", once(right.into_direct()), Default::default());
        server.on("double", |params: Option<Value>| async move {
            let n = params.and_then(|p| p["n"].as_i64()).unwrap_or(0);
            Ok::<_, RpcError>(json!(n * 2))
        });
        let client = MessageChannel::connect("client", once(left.into_direct()), Default::default());

        let result = client.request("double", Some(json!({"n": 21}))).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn second_registration_is_ignored() {
        let (left, right) = memory::pair();
        let server = MessageChannel::connect("server", once(right.into_direct()), Default::default());
        server.on("who", |_p: Option<Value>| async { Ok::<_, RpcError>(json!("first")) });
        server.on("who", |_p: Option<Value>| async { Ok::<_, RpcError>(json!("second")) });
        let client = MessageChannel::connect("client", once(left.into_direct()), Default::default());

        assert_eq!(client.request("who", None).await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn unhandled_method_answers_method_not_found() {
        let (channel, mut remote) = channel_with_remote(ChannelOptions::default());
        remote.send(Message::request(9u64, "nope", None)).unwrap();

        let reply = remote.recv_message().await.unwrap();
        match reply {
            Message::Response { id, error: Some(error), .. } => {
                assert_eq!(id, RequestId::Number(9));
                assert_eq!(error.code, codes::METHOD_NOT_FOUND);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        // Notifications for unknown methods get no reply and do not hurt the channel
        remote.send(Message::notification("nope", None)).unwrap();
        channel.notify("still-alive", None);
        assert_eq!(
            remote.recv_message().await.unwrap().method(),
            Some("still-alive")
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_error_response() {
        let (left, right) = memory::pair();
        let server = MessageChannel::connect("server", once(right.into_direct()), Default::default());
        server.on("fail", |_p: Option<Value>| async {
            Err::<Value, _>(RpcError::new(42, "nope"))
        });
        let client = MessageChannel::connect("client", once(left.into_direct()), Default::default());

        let err = client.request("fail", None).await.unwrap_err();
        assert_eq!(err, ChannelError::Remote(RpcError::new(42, "nope")));
    }

    #[tokio::test]
    async fn duplicate_request_runs_once() {
        let (channel, mut remote) = channel_with_remote(ChannelOptions::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        channel.on("bump", move |_p: Option<Value>| {
            let n = handler_calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, RpcError>(json!(n)) }
        });

        remote.send(Message::request("r1", "bump", None)).unwrap();
        remote.send(Message::request("r1", "bump", None)).unwrap();
        remote.send(Message::request("r2", "bump", None)).unwrap();

        // Handlers run concurrently, so responses may come back in any order
        let replies = [
            remote.recv_message().await.unwrap(),
            remote.recv_message().await.unwrap(),
        ];
        assert!(replies.contains(&Message::result("r1".into(), json!(1))));
        assert!(replies.contains(&Message::result("r2".into(), json!(2))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stuck_handler_does_not_delay_other_methods() {
        let (channel, mut remote) = channel_with_remote(ChannelOptions::default());
        channel.on("stuck", |_p: Option<Value>| {
            std::future::pending::<Result<Value, RpcError>>()
        });
        channel.on("quick", |_p: Option<Value>| async { Ok::<_, RpcError>(json!("ok")) });

        remote.send(Message::request(1u64, "stuck", None)).unwrap();
        remote.send(Message::request(2u64, "quick", None)).unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), remote.recv_message())
            .await
            .expect("quick request waited behind the stuck handler");
        assert_eq!(reply, Some(Message::result(2u64.into(), json!("ok"))));
    }

    #[tokio::test]
    async fn unknown_response_id_is_dropped() {
        let (channel, mut remote) = channel_with_remote(ChannelOptions::default());
        remote.send(Message::result(77u64.into(), json!("stray"))).unwrap();

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request("echo", None).await }
        });
        let Some(Message::Request { id, .. }) = remote.recv_message().await else {
            panic!("expected a request");
        };
        remote.send(Message::result(id, json!("ok"))).unwrap();
        assert_eq!(request.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_late_response_is_ignored() {
        let options = ChannelOptions::default().request_timeout(Duration::from_secs(2));
        let (channel, mut remote) = channel_with_remote(options);

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request("slow", None).await }
        });
        let Some(Message::Request { id, .. }) = remote.recv_message().await else {
            panic!("expected a request");
        };

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, ChannelError::Timeout(Duration::from_secs(2)));

        remote.send(Message::result(id, json!("late"))).unwrap();
        channel.notify("after", None);
        assert_eq!(remote.recv_message().await.unwrap().method(), Some("after"));
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (_channel, mut remote) = channel_with_remote(ChannelOptions::default());
        remote.send(Message::ping()).unwrap();
        assert_eq!(remote.recv_message().await, Some(Message::pong()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_disconnect_and_flushes_queue() {
        let (connector, mut peers_rx) = pair_connector();
        let (disconnects, hook) = counter();
        let options = ChannelOptions::default()
            .auto_reconnect(true)
            .on_disconnect(hook);
        let channel = MessageChannel::connect("page", connector, options);

        let first = peers_rx.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;
        drop(first);
        wait_for(&channel, ChannelState::Disconnected).await;

        channel.notify("while-down", None);
        let mut second = peers_rx.recv().await.unwrap();
        assert_eq!(second.recv_message().await.unwrap().method(), Some("while-down"));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_resets_the_backoff() {
        let (connector, mut peers_rx) = pair_connector();
        let options = ChannelOptions::default()
            .auto_reconnect(true)
            .backoff(BackoffConfig {
                steps: 2,
                ..Default::default()
            });
        let channel = MessageChannel::connect("page", connector, options);

        // First drop uses one of the two steps
        let first = peers_rx.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;
        drop(first);

        // A pong on the new link gives the full schedule back
        let mut second = peers_rx.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;
        second.send(Message::pong()).unwrap();
        drop(second);

        // Without the reset this third drop would exhaust the schedule
        let third = peers_rx.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;
        drop(third);

        let fourth = peers_rx.recv().await;
        assert!(fourth.is_some(), "channel gave up reconnecting");
        wait_for(&channel, ChannelState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pending_connect_does_not_block_timeouts_or_close() {
        let connector = || std::future::pending::<Result<Link, TransportError>>();
        let options = ChannelOptions::default().request_timeout(Duration::from_millis(200));
        let channel = MessageChannel::connect("page", connector, options);
        wait_for(&channel, ChannelState::Connecting).await;

        let result = tokio::time::timeout(Duration::from_secs(2), channel.request("x", None))
            .await
            .expect("request ignored its timeout while connecting");
        assert_eq!(result, Err(ChannelError::Timeout(Duration::from_millis(200))));

        channel.close();
        tokio::time::timeout(Duration::from_secs(2), wait_for(&channel, ChannelState::Closed))
            .await
            .expect("close ignored while connecting");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_attempt_is_discarded() {
        let (release, gate) = oneshot::channel::<()>();
        let gate = Arc::new(std::sync::Mutex::new(Some(gate)));
        let (local, mut stale) = memory::pair();
        let stale_link = Arc::new(std::sync::Mutex::new(Some(local.into_direct())));
        let slow = move || {
            let gate = gate.lock().unwrap().take();
            let link = stale_link.lock().unwrap().take();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                link.ok_or(TransportError::Exhausted)
            }
        };
        let channel = MessageChannel::connect("page", slow, ChannelOptions::default());
        wait_for(&channel, ChannelState::Connecting).await;

        let (fresh, mut current) = memory::pair();
        channel.connect_with(once(fresh.into_direct()));
        wait_for(&channel, ChannelState::Connected).await;
        let _ = release.send(());

        channel.notify("hello", None);
        assert_eq!(current.recv_message().await.unwrap().method(), Some("hello"));
        // The first attempt was abandoned and its link released
        assert_eq!(stale.recv().await, Some(PortEvent::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_backoff_closes_channel() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector_attempts = attempts.clone();
        let connector = move || {
            connector_attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<Link, _>(TransportError::ConnectFailed("refused".into())) }
        };
        let (errors, hook) = counter();
        let options = ChannelOptions::default()
            .auto_reconnect(true)
            .backoff(BackoffConfig {
                steps: 2,
                ..Default::default()
            })
            .on_connection_error(hook);
        let channel = MessageChannel::connect("page", connector, options);

        wait_for(&channel, ChannelState::Closed).await;
        // initial attempt plus one per backoff step
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert_eq!(channel.request("x", None).await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn failed_connect_without_auto_reconnect_stays_disconnected() {
        let (errors, hook) = counter();
        let connector = || async { Err::<Link, _>(TransportError::ConnectFailed("refused".into())) };
        let channel = MessageChannel::connect(
            "page",
            connector,
            ChannelOptions::default().on_connection_error(hook),
        );
        channel.notify("queued", None);

        let mut state = channel.watch_state();
        state
            .wait_for(|s| *s == ChannelState::Disconnected)
            .await
            .unwrap();
        while errors.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pongs_declare_link_dead() {
        let (disconnects, hook) = counter();
        let options = ChannelOptions::default()
            .heartbeat(HeartbeatConfig {
                interval: Duration::from_secs(1),
                max_missed: 2,
            })
            .on_disconnect(hook);
        let (channel, mut remote) = channel_with_remote(options);

        assert_eq!(remote.recv().await, Some(PortEvent::Message(Message::ping())));
        assert_eq!(remote.recv().await, Some(PortEvent::Message(Message::ping())));
        assert_eq!(remote.recv().await, Some(PortEvent::Disconnected));

        wait_for(&channel, ChannelState::Disconnected).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_link_alive() {
        let options = ChannelOptions::default().heartbeat(HeartbeatConfig {
            interval: Duration::from_secs(1),
            max_missed: 1,
        });
        let (channel, mut remote) = channel_with_remote(options);

        for _ in 0..5 {
            assert_eq!(remote.recv_message().await, Some(Message::ping()));
            remote.send(Message::pong()).unwrap();
        }
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn adapter_link_delivers_inbound_frames() {
        let (local, mut remote) = memory::pair();
        let channel = MessageChannel::connect("sidebar", once(local.into_adapter()), Default::default());
        channel.on("echo", |params: Option<Value>| async move {
            Ok::<_, RpcError>(params.unwrap_or_default())
        });

        remote.send(Message::request(1u64, "echo", Some(json!("hi")))).unwrap();
        assert_eq!(remote.recv_message().await, Some(Message::result(1u64.into(), json!("hi"))));
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (channel, mut remote) = channel_with_remote(ChannelOptions::default());
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request("never", None).await }
        });
        assert!(remote.recv_message().await.is_some());

        channel.close();
        assert_eq!(pending.await.unwrap(), Err(ChannelError::Closed));
        assert_eq!(remote.recv().await, Some(PortEvent::Disconnected));
        wait_for(&channel, ChannelState::Closed).await;
    }
}

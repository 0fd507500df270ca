use crate::config::Config;
use crate::model::{FeedEvent, ServiceCallEvent, StateEvent, UpstreamRequest};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::{self, Message};

pub const DEFAULT_FEED_URL: &str = "ws://supervisor/core/api/websocket";

#[cfg(not(test))]
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
#[cfg(test)]
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(150);

#[cfg(not(test))]
const PONG_TIMEOUT: Duration = Duration::from_secs(2);
#[cfg(test)]
const PONG_TIMEOUT: Duration = Duration::from_millis(100);

#[cfg(not(test))]
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
#[cfg(test)]
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[cfg(not(test))]
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
#[cfg(test)]
const RECONNECT_DELAY: Duration = Duration::from_millis(20);

#[cfg(not(test))]
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(test)]
const AUTH_TIMEOUT: Duration = Duration::from_millis(600);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_QUEUE_CAPACITY: usize = 256;
const EVENT_FANOUT_CAPACITY: usize = 1024;
const PENDING_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Authenticated,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub url: String,
    pub access_token: String,
}

impl LinkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.feed_url(),
            access_token: config.upstream.access_token.clone().unwrap_or_default(),
        }
    }
}

/// Why a single feed connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    Closed,
    Transport(String),
    AuthRejected(Option<String>),
    AuthTimeout,
    KeepaliveTimeout,
    Shutdown,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed by feed"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::AuthRejected(Some(msg)) => write!(f, "authentication rejected: {msg}"),
            Self::AuthRejected(None) => write!(f, "authentication rejected"),
            Self::AuthTimeout => write!(f, "handshake not completed within {AUTH_TIMEOUT:?}"),
            Self::KeepaliveTimeout => write!(f, "no response to keepalive ping"),
            Self::Shutdown => write!(f, "link shut down"),
        }
    }
}

/// Cloneable handle sessions use to talk to a running link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    requests: mpsc::Sender<UpstreamRequest>,
    events: broadcast::Sender<FeedEvent>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Queues a request without waiting; a full queue drops the request.
    pub fn submit(&self, request: UpstreamRequest) -> bool {
        match self.requests.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                tracing::warn!(request = ?request, "upstream request queue full; dropping request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("upstream link stopped; dropping request");
                false
            }
        }
    }
}

#[cfg(test)]
impl LinkHandle {
    /// A handle with no link task behind it, for driving sessions directly.
    pub(crate) fn detached() -> (Self, mpsc::Receiver<UpstreamRequest>) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        let (_state_tx, state_rx) = watch::channel(LinkState::Authenticated);
        let handle = Self {
            requests: requests_tx,
            events: events_tx,
            state: state_rx,
        };
        (handle, requests_rx)
    }

    pub(crate) fn publish(&self, event: FeedEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

pub struct UpstreamLink {
    settings: LinkSettings,
    queue: CommandQueue,
    requests: mpsc::Receiver<UpstreamRequest>,
    events: broadcast::Sender<FeedEvent>,
    state: watch::Sender<LinkState>,
}

impl UpstreamLink {
    /// Starts the connection loop on its own task. Aborting the returned task closes the link.
    pub fn spawn(settings: LinkSettings) -> (LinkHandle, JoinHandle<()>) {
        let (link, handle) = Self::new(settings);
        let task = tokio::spawn(link.run());
        (handle, task)
    }

    fn new(settings: LinkSettings) -> (Self, LinkHandle) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let handle = LinkHandle {
            requests: requests_tx,
            events: events_tx.clone(),
            state: state_rx,
        };
        let link = Self {
            settings,
            queue: CommandQueue::new(),
            requests: requests_rx,
            events: events_tx,
            state: state_tx,
        };
        (link, handle)
    }

    async fn run(mut self) {
        loop {
            self.set_state(LinkState::Connecting);
            tracing::info!(url = %self.settings.url, "connecting to feed");
            let connected = tokio::time::timeout(
                CONNECT_TIMEOUT,
                tokio_tungstenite::connect_async(self.settings.url.as_str()),
            )
            .await;
            let ws = match connected {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(err)) => {
                    tracing::warn!(url = %self.settings.url, error = %err, "feed connection failed; retrying");
                    sleep(CONNECT_RETRY_DELAY).await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(url = %self.settings.url, "feed connection timed out; retrying");
                    sleep(CONNECT_RETRY_DELAY).await;
                    continue;
                }
            };

            let reason = self.drive(ws).await;
            match &reason {
                Disconnect::Shutdown => {
                    self.set_state(LinkState::Disconnected);
                    tracing::info!("feed link stopped");
                    return;
                }
                Disconnect::AuthRejected(_) => {
                    tracing::error!(reason = %reason, "feed connection ended; reconnecting")
                }
                _ => tracing::warn!(reason = %reason, "feed connection ended; reconnecting"),
            }
            self.set_state(LinkState::Reconnecting);
            sleep(RECONNECT_DELAY).await;
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    /// Runs one connection until it ends. Reads, writes and the keepalive timers are
    /// independent: writes go through a dedicated writer task.
    async fn drive<S>(&mut self, ws: S) -> Disconnect
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let (sink, mut stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let mut writer = tokio::spawn(write_loop(sink, out_rx));

        self.queue.reset();
        self.set_state(LinkState::AwaitingAuth);

        let keepalive = sleep(KEEPALIVE_INTERVAL);
        tokio::pin!(keepalive);
        let pong_deadline = sleep(PONG_TIMEOUT);
        tokio::pin!(pong_deadline);
        let auth_deadline = sleep(AUTH_TIMEOUT);
        tokio::pin!(auth_deadline);
        let mut awaiting_pong = false;

        let reason = loop {
            tokio::select! {
                incoming = stream.next() => {
                    let msg = match incoming {
                        None => break Disconnect::Closed,
                        Some(Err(err)) => break Disconnect::Transport(err.to_string()),
                        Some(Ok(msg)) => msg,
                    };
                    awaiting_pong = false;
                    keepalive.as_mut().reset(Instant::now() + KEEPALIVE_INTERVAL);
                    match msg {
                        Message::Text(text) => {
                            if let Err(reason) = self.handle_frame(text.as_str(), &out_tx) {
                                break reason;
                            }
                        }
                        Message::Close(_) => break Disconnect::Closed,
                        _ => {}
                    }
                }
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        break Disconnect::Shutdown;
                    };
                    if let Some((id, request)) = self.queue.submit(request) {
                        send_request(&out_tx, id, &request);
                    }
                }
                _ = &mut keepalive, if self.queue.is_authenticated() => {
                    let id = self.queue.next_id();
                    send_frame(&out_tx, &ClientFrame::Ping { id });
                    awaiting_pong = true;
                    pong_deadline.as_mut().reset(Instant::now() + PONG_TIMEOUT);
                    keepalive.as_mut().reset(Instant::now() + KEEPALIVE_INTERVAL);
                }
                _ = &mut pong_deadline, if awaiting_pong => {
                    break Disconnect::KeepaliveTimeout;
                }
                _ = &mut auth_deadline, if !self.queue.is_authenticated() => {
                    break Disconnect::AuthTimeout;
                }
                result = &mut writer => {
                    break match result {
                        Ok(Err(err)) => Disconnect::Transport(err.to_string()),
                        _ => Disconnect::Closed,
                    };
                }
            }
        };

        drop(out_tx);
        writer.abort();
        reason
    }

    fn handle_frame(
        &mut self,
        text: &str,
        out: &mpsc::UnboundedSender<Message>,
    ) -> Result<(), Disconnect> {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "malformed feed frame ignored");
                return Ok(());
            }
        };

        match frame {
            ServerFrame::AuthRequired => {
                tracing::info!("feed requested authentication");
                self.set_state(LinkState::AwaitingAuth);
                send_frame(
                    out,
                    &ClientFrame::Auth {
                        access_token: &self.settings.access_token,
                    },
                );
            }
            ServerFrame::AuthOk => {
                tracing::info!("feed authentication accepted");
                self.set_state(LinkState::Authenticated);
                for (id, request) in self.queue.authenticate() {
                    send_request(out, id, &request);
                }
                let at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                let _ = self.events.send(FeedEvent::Connected { at });
            }
            ServerFrame::AuthInvalid { message } => {
                return Err(Disconnect::AuthRejected(message));
            }
            ServerFrame::Event { event } => {
                for parsed in parse_event(&event) {
                    let _ = self.events.send(parsed);
                }
            }
            ServerFrame::Result { id, success, error } => {
                if success {
                    tracing::debug!(id = ?id, "feed request succeeded");
                } else {
                    tracing::warn!(id = ?id, error = ?error, "feed request failed");
                }
            }
            ServerFrame::Pong { id } => tracing::debug!(id = ?id, "pong"),
            ServerFrame::Unknown => tracing::debug!("unhandled feed frame type"),
        }
        Ok(())
    }
}

async fn write_loop<K>(mut sink: K, mut rx: mpsc::UnboundedReceiver<Message>) -> Result<(), tungstenite::Error>
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        sink.send(msg).await?;
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(error = %err, "feed socket close failed");
    }
    Ok(())
}

fn send_frame(out: &mpsc::UnboundedSender<Message>, frame: &ClientFrame<'_>) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = out.send(Message::Text(json.into()));
        }
        Err(err) => tracing::warn!(error = %err, "failed to encode feed frame"),
    }
}

fn send_request(out: &mpsc::UnboundedSender<Message>, id: u64, request: &UpstreamRequest) {
    tracing::debug!(id, request = ?request, "sending feed request");
    send_frame(out, &ClientFrame::from_request(id, request));
}

/// Outbound requests for one connection lifetime. Requests submitted before authentication
/// wait here in order; ids restart at 1 on every connection.
#[derive(Debug)]
struct CommandQueue {
    pending: VecDeque<UpstreamRequest>,
    next_id: u64,
    authenticated: bool,
}

impl CommandQueue {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            next_id: 1,
            authenticated: false,
        }
    }

    fn reset(&mut self) {
        self.next_id = 1;
        self.authenticated = false;
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn submit(&mut self, request: UpstreamRequest) -> Option<(u64, UpstreamRequest)> {
        if self.authenticated {
            return Some((self.next_id(), request));
        }
        if self.pending.len() >= PENDING_LIMIT {
            tracing::warn!(request = ?request, "pre-auth request buffer full; dropping request");
            return None;
        }
        self.pending.push_back(request);
        None
    }

    /// Marks the connection authenticated and returns the bulk event subscription followed
    /// by every buffered request, each with its id.
    fn authenticate(&mut self) -> Vec<(u64, UpstreamRequest)> {
        self.authenticated = true;
        let mut ready = Vec::with_capacity(self.pending.len() + 1);
        ready.push((self.next_id(), UpstreamRequest::SubscribeEvents));
        while let Some(request) = self.pending.pop_front() {
            ready.push((self.next_id(), request));
        }
        ready
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Auth {
        access_token: &'a str,
    },
    Ping {
        id: u64,
    },
    SubscribeEvents {
        id: u64,
    },
    SubscribeEntities {
        id: u64,
        entity_ids: &'a [String],
    },
    CallService {
        id: u64,
        domain: &'a str,
        service: &'a str,
        target: Target<'a>,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<&'a Map<String, Value>>,
    },
}

#[derive(Debug, Serialize)]
struct Target<'a> {
    entity_id: &'a str,
}

impl<'a> ClientFrame<'a> {
    fn from_request(id: u64, request: &'a UpstreamRequest) -> Self {
        match request {
            UpstreamRequest::SubscribeEvents => Self::SubscribeEvents { id },
            UpstreamRequest::SubscribeEntities(entity_ids) => Self::SubscribeEntities { id, entity_ids },
            UpstreamRequest::CallService(call) => Self::CallService {
                id,
                domain: &call.domain,
                service: &call.service,
                target: Target {
                    entity_id: &call.entity_id,
                },
                service_data: call.service_data.as_ref(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    AuthRequired,
    AuthOk,
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Event {
        event: Value,
    },
    Result {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        error: Option<Value>,
    },
    Pong {
        #[serde(default)]
        id: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

/// Classifies the `event` object of an event frame into fan-out events.
fn parse_event(event: &Value) -> Vec<FeedEvent> {
    match event.get("event_type").and_then(Value::as_str) {
        Some("state_changed") => event
            .get("data")
            .and_then(|data| data.get("new_state"))
            .and_then(StateEvent::from_state_object)
            .map(FeedEvent::State)
            .into_iter()
            .collect(),
        Some("call_service") => event
            .get("data")
            .and_then(ServiceCallEvent::from_event_data)
            .map(FeedEvent::ServiceCall)
            .into_iter()
            .collect(),
        Some(other) => {
            tracing::debug!(event_type = other, "ignoring feed event");
            Vec::new()
        }
        // entity subscriptions push compressed snapshots keyed by entity id
        None => match event.get("a").and_then(Value::as_object) {
            Some(added) => added
                .iter()
                .map(|(entity_id, state)| FeedEvent::State(StateEvent::from_compressed(entity_id, state)))
                .collect(),
            None => Vec::new(),
        },
    }
}

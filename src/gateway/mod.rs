use crate::config::{AllowList, Config};
use crate::dispatch::CommandDispatcher;
use crate::session::Session;
use crate::translate::render_event;
use crate::upstream::{LinkHandle, LinkSettings, UpstreamLink};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

#[cfg(not(test))]
const BIND_RETRY_BASE: Duration = Duration::from_secs(1);
#[cfg(test)]
const BIND_RETRY_BASE: Duration = Duration::from_millis(5);

#[cfg(not(test))]
const BIND_RETRY_CAP: Duration = Duration::from_secs(30);
#[cfg(test)]
const BIND_RETRY_CAP: Duration = Duration::from_millis(150);

const BIND_RETRIES: u32 = 5;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum GatewayError {
    BindExhausted { addr: String, attempts: u32, source: io::Error },
    LineTooLong { limit: usize },
    OutboundOverflow { capacity: usize },
    Io(io::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindExhausted {
                addr,
                attempts,
                source,
            } => write!(f, "could not bind {addr} after {attempts} attempts: {source}"),
            Self::LineTooLong { limit } => write!(f, "inbound line exceeds {limit} bytes"),
            Self::OutboundOverflow { capacity } => {
                write!(f, "outbound queue full ({capacity} lines); peer is not reading")
            }
            Self::Io(err) => write!(f, "socket error: {err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BindExhausted { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Where sessions get their feed events from.
#[derive(Debug, Clone)]
pub enum UpstreamMode {
    /// Every session starts and owns its own link.
    PerPeer(LinkSettings),
    /// All sessions attach to one long-lived link.
    Shared(LinkHandle),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_line_bytes: usize,
    pub outbound_queue: usize,
}

impl SessionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_line_bytes: config.session.max_line_bytes,
            outbound_queue: config.session.outbound_queue,
        }
    }
}

/// Everything a session needs, built once at startup and shared by reference.
#[derive(Debug)]
pub struct GatewayContext {
    pub dispatcher: CommandDispatcher,
    pub upstream: UpstreamMode,
    pub allow_list: AllowList,
    pub limits: SessionLimits,
}

/// Binds the listener, retrying with a doubling delay, then serves peers until the task is dropped.
pub async fn start(addr: &str, ctx: Arc<GatewayContext>) -> Result<(), GatewayError> {
    let listener = bind_with_retry(addr).await?;
    serve(listener, ctx).await
}

async fn bind_with_retry(addr: &str) -> Result<TcpListener, GatewayError> {
    let mut delay = BIND_RETRY_BASE;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(source) if attempt > BIND_RETRIES => {
                return Err(GatewayError::BindExhausted {
                    addr: addr.to_string(),
                    attempts: attempt,
                    source,
                });
            }
            Err(err) => {
                tracing::warn!(addr, attempt, error = %err, retry_in_ms = delay.as_millis() as u64, "listener bind failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BIND_RETRY_CAP);
            }
        }
    }
}

pub async fn serve(listener: TcpListener, ctx: Arc<GatewayContext>) -> Result<(), GatewayError> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, allow_list_empty = ctx.allow_list.is_empty(), "gateway listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        if !ctx.allow_list.permits(peer.ip()) {
            tracing::warn!(peer = %peer, "peer not in client_ip_whitelist; closing");
            drop(stream);
            continue;
        }
        let ctx = ctx.clone();
        tokio::spawn(async move { handle_peer(stream, peer, ctx).await });
    }
}

async fn handle_peer(stream: TcpStream, peer: SocketAddr, ctx: Arc<GatewayContext>) {
    let session = Session::new(peer);
    let (link, owned_link) = match &ctx.upstream {
        UpstreamMode::PerPeer(settings) => {
            let (handle, task) = UpstreamLink::spawn(settings.clone());
            (handle, Some(task))
        }
        UpstreamMode::Shared(handle) => (handle.clone(), None),
    };
    tracing::info!(session_id = %session.id(), peer = %peer, link_state = ?link.state(), "session opened");

    let (reader, writer) = stream.into_split();
    let result = run_session(BufReader::new(reader), writer, &session, &link, &ctx).await;

    if let Some(task) = owned_link {
        task.abort();
    }
    match result {
        Ok(()) => tracing::info!(session_id = %session.id(), peer = %peer, "session closed"),
        Err(err) => {
            tracing::warn!(session_id = %session.id(), peer = %peer, error = %err, "session terminated")
        }
    }
}

/// Runs one peer until it disconnects or breaks a limit. Command reads, event delivery
/// and socket writes proceed independently; lines reach the peer in the order queued.
pub async fn run_session<R, W>(
    mut reader: R,
    writer: W,
    session: &Session,
    link: &LinkHandle,
    ctx: &GatewayContext,
) -> Result<(), GatewayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let limits = ctx.limits;
    let mut events = link.subscribe();
    let (out_tx, out_rx) = mpsc::channel::<String>(limits.outbound_queue);
    let write_task = write_lines(writer, out_rx);
    tokio::pin!(write_task);

    let mut buf = Vec::new();
    loop {
        tokio::select! {
            read = read_line(&mut reader, &mut buf, limits.max_line_bytes) => {
                match read? {
                    LineRead::Line => {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        buf.clear();
                        for request in ctx.dispatcher.dispatch(&line, session) {
                            link.submit(request);
                        }
                    }
                    LineRead::Eof => return Ok(()),
                    LineRead::TooLong => {
                        return Err(GatewayError::LineTooLong { limit: limits.max_line_bytes });
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let lines = session.read(|state| render_event(&event, state));
                        for line in lines {
                            match out_tx.try_send(line) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    return Err(GatewayError::OutboundOverflow { capacity: limits.outbound_queue });
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => break,
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %session.id(), skipped, "session lagged behind the feed; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            written = &mut write_task => {
                return written.map_err(GatewayError::from);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    Eof,
    TooLong,
}

/// Reads into `buf` until a newline, never holding more than `limit + 1` bytes. `limit`
/// counts the terminating newline. Partial reads stay in `buf`, so the future may be
/// dropped and called again.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let budget = (limit + 1).saturating_sub(buf.len()) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', buf).await?;
        if buf.len() > limit {
            return Ok(LineRead::TooLong);
        }
        if buf.last() == Some(&b'\n') {
            return Ok(LineRead::Line);
        }
        if n == 0 {
            if !buf.is_empty() {
                tracing::debug!(bytes = buf.len(), "discarding unterminated trailing line");
            }
            return Ok(LineRead::Eof);
        }
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

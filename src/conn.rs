//! Link to a shot timer over a line-oriented byte stream.
//!
//! A [`Correlator`] owns the transport through a single IO task. Commands are
//! queued FIFO and at most one is on the wire at a time; the next inbound line
//! satisfying the pending request's matcher (or an `#ERR=` line) resolves it.
//! No application logic here: callers drive timing and sequencing.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::WireError;
use crate::frame::{LineSplitter, encode_line};
use crate::protocol::fault::{self, DeviceError};

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default quiet window after a fire-and-forget command.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(30);

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Outbound half of the byte stream.
///
/// `send` is fire-and-forget: the transport queues the bytes and returns.
pub trait Transport: Send + 'static {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Inbound half of the byte stream, delivered on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw bytes, chunked arbitrarily (possibly mid-line).
    Bytes(Vec<u8>),
    /// The transport lost its link.
    Disconnected,
}

pub type InboundTx = mpsc::UnboundedSender<Inbound>;
pub type InboundRx = mpsc::UnboundedReceiver<Inbound>;

/// Create the inbound channel a transport delivers into.
pub fn inbound_channel() -> (InboundTx, InboundRx) {
    mpsc::unbounded_channel()
}

/// Link status as seen by the IO task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No transport was ever attached.
    Detached,
    Connected,
    /// Disconnected or shut down.
    Closed,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from link operations.
#[derive(Debug)]
pub enum ConnError {
    /// Transport write failed.
    Io(io::Error),
    /// Response matched but could not be parsed.
    Wire(WireError),
    /// Device answered with `#ERR=<code>`.
    Device(DeviceError),
    /// No matching line before the deadline.
    Timeout { timeout: Duration },
    /// The session owning the request was stopped.
    Cancelled,
    /// The transport reported a disconnect while the request was queued or pending.
    Disconnected,
    /// No active link.
    TransportUnavailable,
}

impl ConnError {
    /// Worth re-issuing the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnError::Timeout { .. } => true,
            ConnError::Device(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Ends the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnError::Io(_) | ConnError::Disconnected | ConnError::TransportUnavailable
        )
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Io(e) => write!(f, "I/O error: {e}"),
            ConnError::Wire(e) => write!(f, "malformed response: {e}"),
            ConnError::Device(e) => write!(f, "device error: {e}"),
            ConnError::Timeout { timeout } => write!(f, "no response within {timeout:?}"),
            ConnError::Cancelled => write!(f, "request cancelled"),
            ConnError::Disconnected => write!(f, "transport disconnected"),
            ConnError::TransportUnavailable => write!(f, "transport not ready"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Io(e) => Some(e),
            ConnError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(e)
    }
}

impl From<WireError> for ConnError {
    fn from(e: WireError) -> Self {
        ConnError::Wire(e)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

type Matcher = Box<dyn Fn(&str) -> bool + Send>;

enum Request {
    /// Send a line and wait for the first matching reply.
    Exchange {
        line: String,
        matcher: Matcher,
        timeout: Duration,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<String, ConnError>>,
    },
    /// Send a line, then watch `settle` for an `#ERR=` reply to log.
    Send {
        line: String,
        settle: Duration,
        cancel: CancellationToken,
    },
}

impl Request {
    fn fail(self, err: ConnError) {
        match self {
            Request::Exchange { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::Send { line, .. } => debug!(%line, "dropping queued command: {err}"),
        }
    }
}

/// The inbound side ended or a write failed.
struct LinkLost;

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Handle to the IO task that owns the transport.
///
/// Cheap to clone; all clones feed the same FIFO queue.
///
/// # Example
///
/// ```no_run
/// # async fn demo(transport: impl shotline::conn::Transport, inbound: shotline::conn::InboundRx)
/// # -> Result<(), shotline::ConnError> {
/// use std::time::Duration;
/// use shotline::Correlator;
///
/// let link = Correlator::attach(transport, inbound);
/// let line = link
///     .send_and_await("#G_STATE", |l| l.starts_with("#G_STATE="), Duration::from_millis(500))
///     .await?;
/// println!("{line}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Correlator {
    tx: Option<mpsc::UnboundedSender<Request>>,
    link: watch::Receiver<LinkState>,
    shutdown: CancellationToken,
    settle: Duration,
}

impl Correlator {
    /// A correlator with no transport. Every request fails with
    /// [`ConnError::TransportUnavailable`].
    pub fn detached() -> Self {
        let (_, link) = watch::channel(LinkState::Detached);
        Self {
            tx: None,
            link,
            shutdown: CancellationToken::new(),
            settle: DEFAULT_SETTLE,
        }
    }

    /// Take ownership of `transport` and its inbound channel and spawn the IO
    /// task. Must be called inside a Tokio runtime.
    pub fn attach(transport: impl Transport, inbound: InboundRx) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (link_tx, link) = watch::channel(LinkState::Connected);
        let shutdown = CancellationToken::new();
        tokio::spawn(io_loop(
            Box::new(transport),
            inbound,
            rx,
            link_tx,
            shutdown.clone(),
        ));
        Self {
            tx: Some(tx),
            link,
            shutdown,
            settle: DEFAULT_SETTLE,
        }
    }

    /// Set the quiet window used after fire-and-forget commands.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Current link status.
    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Resolves once the link is no longer connected.
    pub async fn disconnected(&self) {
        let mut link = self.link.clone();
        // A dropped sender means the IO task is gone: also disconnected.
        let _ = link.wait_for(|s| *s != LinkState::Connected).await;
    }

    /// Queue a fire-and-forget command line.
    pub fn send(&self, line: impl Into<String>) -> Result<(), ConnError> {
        self.send_with(line, &CancellationToken::new())
    }

    /// Queue a fire-and-forget command line, skipped if `cancel` fires first.
    pub fn send_with(
        &self,
        line: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ConnError> {
        self.enqueue(Request::Send {
            line: line.into(),
            settle: self.settle,
            cancel: cancel.clone(),
        })
    }

    /// Send `line` and resolve with the first inbound line matching `matcher`.
    pub async fn send_and_await(
        &self,
        line: impl Into<String>,
        matcher: impl Fn(&str) -> bool + Send + 'static,
        timeout: Duration,
    ) -> Result<String, ConnError> {
        self.send_and_await_with(line, matcher, timeout, &CancellationToken::new())
            .await
    }

    /// As [`send_and_await`](Self::send_and_await), failing with
    /// [`ConnError::Cancelled`] as soon as `cancel` fires.
    pub async fn send_and_await_with(
        &self,
        line: impl Into<String>,
        matcher: impl Fn(&str) -> bool + Send + 'static,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ConnError> {
        let (reply, reply_rx) = oneshot::channel();
        self.enqueue(Request::Exchange {
            line: line.into(),
            matcher: Box::new(matcher),
            timeout,
            cancel: cancel.clone(),
            reply,
        })?;
        reply_rx.await.unwrap_or(Err(ConnError::Disconnected))
    }

    /// Stop the IO task. Queued and pending requests fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn enqueue(&self, req: Request) -> Result<(), ConnError> {
        let tx = self.tx.as_ref().ok_or(ConnError::TransportUnavailable)?;
        if !self.is_connected() {
            return Err(ConnError::TransportUnavailable);
        }
        tx.send(req).map_err(|_| ConnError::TransportUnavailable)
    }
}

// ---------------------------------------------------------------------------
// IO task
// ---------------------------------------------------------------------------

async fn io_loop(
    mut transport: Box<dyn Transport>,
    mut inbound: InboundRx,
    mut requests: mpsc::UnboundedReceiver<Request>,
    link: watch::Sender<LinkState>,
    shutdown: CancellationToken,
) {
    let mut splitter = LineSplitter::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("IO task shut down");
                break;
            }

            req = requests.recv() => {
                let Some(req) = req else { break };
                let outcome = handle_request(
                    req,
                    &mut *transport,
                    &mut inbound,
                    &mut splitter,
                    &shutdown,
                )
                .await;
                if outcome.is_err() {
                    break;
                }
            }

            chunk = inbound.recv() => match chunk {
                Some(Inbound::Bytes(bytes)) => {
                    for line in splitter.feed(&bytes) {
                        debug!(%line, "discarding line with no pending request");
                    }
                }
                Some(Inbound::Disconnected) | None => {
                    warn!("transport disconnected");
                    break;
                }
            },
        }
    }

    link.send_replace(LinkState::Closed);
    requests.close();
    while let Ok(req) = requests.try_recv() {
        req.fail(ConnError::Disconnected);
    }
}

async fn handle_request(
    req: Request,
    transport: &mut dyn Transport,
    inbound: &mut InboundRx,
    splitter: &mut LineSplitter,
    shutdown: &CancellationToken,
) -> Result<(), LinkLost> {
    match req {
        Request::Exchange {
            line,
            matcher,
            timeout,
            cancel,
            reply,
        } => {
            if cancel.is_cancelled() {
                let _ = reply.send(Err(ConnError::Cancelled));
                return Ok(());
            }
            trace!(%line, "→");
            if let Err(e) = transport.send(&encode_line(&line)) {
                warn!(%line, "transport write failed: {e}");
                let _ = reply.send(Err(ConnError::Io(e)));
                return Err(LinkLost);
            }

            let sleep = tokio::time::sleep_until(Instant::now() + timeout);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        let _ = reply.send(Err(ConnError::Disconnected));
                        return Err(LinkLost);
                    }
                    _ = cancel.cancelled() => {
                        debug!(%line, "request cancelled");
                        let _ = reply.send(Err(ConnError::Cancelled));
                        return Ok(());
                    }
                    _ = &mut sleep => {
                        debug!(%line, ?timeout, "request timed out");
                        let _ = reply.send(Err(ConnError::Timeout { timeout }));
                        return Ok(());
                    }
                    chunk = inbound.recv() => match chunk {
                        Some(Inbound::Bytes(bytes)) => {
                            if let Some(result) = match_lines(splitter, &bytes, &matcher) {
                                let _ = reply.send(result);
                                return Ok(());
                            }
                        }
                        Some(Inbound::Disconnected) | None => {
                            warn!(%line, "transport disconnected with request pending");
                            let _ = reply.send(Err(ConnError::Disconnected));
                            return Err(LinkLost);
                        }
                    },
                }
            }
        }

        Request::Send {
            line,
            settle,
            cancel,
        } => {
            if cancel.is_cancelled() {
                debug!(%line, "skipping command from cancelled session");
                return Ok(());
            }
            trace!(%line, "→");
            if let Err(e) = transport.send(&encode_line(&line)) {
                warn!(%line, "transport write failed: {e}");
                return Err(LinkLost);
            }
            if settle.is_zero() {
                return Ok(());
            }

            let sleep = tokio::time::sleep(settle);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => return Err(LinkLost),
                    _ = &mut sleep => return Ok(()),
                    chunk = inbound.recv() => match chunk {
                        Some(Inbound::Bytes(bytes)) => {
                            for reply in splitter.feed(&bytes) {
                                match fault::decode(&reply) {
                                    Some(err) => warn!(%line, "device rejected command: {err}"),
                                    None => debug!(%reply, "discarding line after command"),
                                }
                            }
                        }
                        Some(Inbound::Disconnected) | None => {
                            warn!(%line, "transport disconnected after command");
                            return Err(LinkLost);
                        }
                    },
                }
            }
        }
    }
}

/// Feed `bytes` and return the outcome for the pending request, if a line
/// resolves it. Lines after the resolving one are discarded.
fn match_lines(
    splitter: &mut LineSplitter,
    bytes: &[u8],
    matcher: &Matcher,
) -> Option<Result<String, ConnError>> {
    let mut resolved = None;
    for line in splitter.feed(bytes) {
        trace!(%line, "←");
        if resolved.is_some() {
            debug!(%line, "discarding line after response");
        } else if let Some(err) = fault::decode(&line) {
            resolved = Some(Err(ConnError::Device(err)));
        } else if matcher(line.as_str()) {
            resolved = Some(Ok(line));
        } else {
            debug!(%line, "discarding unmatched line");
        }
    }
    resolved
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

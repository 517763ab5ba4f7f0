//! Request helpers over a [`Correlator`].
//!
//! Free functions that pair one [`Command`] with its reply and decode it:
//!
//! 1. **Core helper**: [`exchange`] sends a query and decodes the matching
//!    line into a [`Message`].
//! 2. **Operations**: one per timer action the poller drives (state and count
//!    queries, shot time fetch, standby/ready, delay window, start).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conn::{ConnError, Correlator};
use crate::error::WireError;
use crate::protocol::config::StartMode;
use crate::protocol::shot::ShotTimeReq;
use crate::protocol::{Command, Message, SessionState};

// ---------------------------------------------------------------------------
// Internal: expect! macro
// ---------------------------------------------------------------------------

/// Destructure a [`Message`] into a specific variant, or return
/// `ConnError::Wire`.
macro_rules! expect {
    ($msg:expr, $pat:path, $tag:expr) => {
        match $msg {
            $pat(inner) => Ok(inner),
            other => Err(ConnError::Wire(WireError::unexpected_tag($tag, &format!("{other:?}")))),
        }
    };
}

// ---------------------------------------------------------------------------
// Core helper
// ---------------------------------------------------------------------------

/// Send a query and decode the first line carrying its response tag.
///
/// Commands without a value reply are rejected up front; use [`send`] for
/// those.
pub async fn exchange(
    link: &Correlator,
    cmd: &Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Message, ConnError> {
    let Some(tag) = cmd.response_tag() else {
        return Err(ConnError::Wire(WireError::unexpected_tag("<query>", &cmd.encode())));
    };
    let line = link
        .send_and_await_with(
            cmd.encode(),
            move |l| crate::codec::has_tag(l, tag),
            timeout,
            cancel,
        )
        .await?;
    Ok(Message::decode(&line)?)
}

/// Queue a command that has no value reply.
pub fn send(link: &Correlator, cmd: &Command, cancel: &CancellationToken) -> Result<(), ConnError> {
    debug!(line = %cmd.encode(), "queue");
    link.send_with(cmd.encode(), cancel)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// `#G_STATE`: current session state.
pub async fn query_state(
    link: &Correlator,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<SessionState, ConnError> {
    let msg = exchange(link, &Command::StateQuery, timeout, cancel).await?;
    expect!(msg, Message::State, crate::protocol::TAG_STATE)
}

/// `#G_SNUM`: total shots counted since the last standby/ready.
pub async fn query_shot_count(
    link: &Correlator,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<u32, ConnError> {
    let msg = exchange(link, &Command::ShotCountQuery, timeout, cancel).await?;
    expect!(msg, Message::ShotCount, crate::protocol::TAG_SHOT_COUNT).map(|c| c.total)
}

/// `#G_STIME`: elapsed milliseconds of the shot in slot `id` (1-based).
pub async fn query_shot_time(
    link: &Correlator,
    id: u32,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<u32, ConnError> {
    let cmd = Command::ShotTimeQuery(ShotTimeReq { id });
    let msg = exchange(link, &cmd, timeout, cancel).await?;
    expect!(msg, Message::ShotTime, crate::protocol::TAG_SHOT_TIME).map(|t| t.elapsed_ms)
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// `#S_STB` then `#S_GRD`: put the timer back into standby and ready, which
/// zeroes its shot counter.
///
/// Best-effort: a failed queue is logged. Only fatal link errors are returned.
pub fn standby_ready(link: &Correlator, cancel: &CancellationToken) -> Result<(), ConnError> {
    for cmd in [Command::Standby, Command::Ready] {
        if let Err(e) = send(link, &cmd, cancel) {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(line = %cmd.encode(), "standby/ready not sent: {e}");
        }
    }
    Ok(())
}

/// `#S_TMIN` then `#S_TMAX` from `mode`'s window.
pub fn configure_start(
    link: &Correlator,
    mode: &StartMode,
    cancel: &CancellationToken,
) -> Result<(), ConnError> {
    let (min_ms, max_ms) = mode.window();
    send(link, &Command::SetMinDelay(min_ms), cancel)?;
    send(link, &Command::SetMaxDelay(max_ms), cancel)
}

/// `#E_STARTT`: begin the countdown to the start beep.
pub fn start(link: &Correlator, cancel: &CancellationToken) -> Result<(), ConnError> {
    send(link, &Command::Start, cancel)
}

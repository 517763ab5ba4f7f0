//! Simulated shot timer.
//!
//! [`SimDevice`] answers the command table in-process through a
//! [`SimTransport`], so the whole stack can run without hardware. It keeps
//! the timer's state, shot list and delay window, honours `#E_STARTT` by
//! counting down to a random beep, and can inject errors, slow or chunked
//! replies, stale shot times and disconnects.
//!
//! Must be used inside a Tokio runtime: the countdown and delayed replies
//! run on spawned tasks.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::codec;
use crate::conn::{Correlator, Inbound, InboundRx, InboundTx, Transport, inbound_channel};
use crate::frame::LineSplitter;
use crate::protocol::{
    ErrorKind, SessionState, TAG_MAX_DELAY, TAG_MIN_DELAY, TAG_READY, TAG_SHOT_COUNT,
    TAG_SHOT_TIME, TAG_STANDBY, TAG_START, TAG_STATE,
};

/// Reply shaping for the simulated link.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Split each reply into chunks of this many bytes. 0 sends it whole.
    pub chunk_size: usize,
    /// Delay before a reply is delivered.
    pub reply_delay: Duration,
    /// Appended to every reply line.
    pub line_ending: &'static str,
    /// Seed for the beep delay. Random if `None`.
    pub seed: Option<u64>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            reply_delay: Duration::ZERO,
            line_ending: "\r\n",
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimShot {
    elapsed_ms: u32,
    /// Reads answered with the previous shot's time before this one is ready.
    stale_reads: u32,
}

struct Inner {
    state: SessionState,
    shots: Vec<SimShot>,
    min_delay_ms: u32,
    max_delay_ms: u32,
    /// Bumped on start and standby; a countdown only fires for its own value.
    countdown: u64,
    started_at: Option<Instant>,
    faults: VecDeque<(String, ErrorKind)>,
    muted: bool,
    connected: bool,
    received: Vec<String>,
    rng: StdRng,
    opts: SimOptions,
}

/// Handle to the simulated timer. Cheap to clone.
#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<Mutex<Inner>>,
    inbound: InboundTx,
}

impl SimDevice {
    /// A simulated timer plus the transport and inbound channel to hand to
    /// [`Correlator::attach`].
    pub fn new(opts: SimOptions) -> (Self, SimTransport, InboundRx) {
        let (inbound, rx) = inbound_channel();
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let device = Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                shots: Vec::new(),
                min_delay_ms: 2000,
                max_delay_ms: 4000,
                countdown: 0,
                started_at: None,
                faults: VecDeque::new(),
                muted: false,
                connected: true,
                received: Vec::new(),
                rng,
                opts,
            })),
            inbound,
        };
        let transport = SimTransport {
            device: device.clone(),
            splitter: LineSplitter::new(),
        };
        (device, transport, rx)
    }

    /// A simulated timer already attached to a [`Correlator`].
    pub fn connect(opts: SimOptions) -> (Self, Correlator) {
        let (device, transport, rx) = Self::new(opts);
        (device, Correlator::attach(transport, rx))
    }

    // -- Inspection --

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn shot_count(&self) -> u32 {
        u32::try_from(self.inner.lock().shots.len()).unwrap_or(u32::MAX)
    }

    /// Current `(TMIN, TMAX)`.
    pub fn delay_window(&self) -> (u32, u32) {
        let g = self.inner.lock();
        (g.min_delay_ms, g.max_delay_ms)
    }

    /// Every line received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.inner.lock().received.clone()
    }

    // -- Driving the timer --

    pub fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }

    /// Give the start signal now, cancelling any countdown.
    pub fn beep(&self) {
        let mut g = self.inner.lock();
        g.countdown += 1;
        g.state = SessionState::Running;
        g.started_at = Some(Instant::now());
    }

    /// Record a shot at the current time since the start signal (0 before
    /// it). Returns the recorded elapsed time.
    pub fn fire(&self) -> u32 {
        let mut g = self.inner.lock();
        let elapsed_ms = g.started_at.map_or(0, |t| {
            u32::try_from(t.elapsed().as_millis()).unwrap_or(u32::MAX)
        });
        g.shots.push(SimShot {
            elapsed_ms,
            stale_reads: 0,
        });
        elapsed_ms
    }

    /// Record a shot with an explicit elapsed time.
    pub fn fire_at(&self, elapsed_ms: u32) {
        self.fire_lagging(elapsed_ms, 0);
    }

    /// Record a shot whose time is not ready for the next `stale_reads`
    /// reads: those are answered with the previous shot's time, or
    /// `DATA_EMPTY` if there is none.
    pub fn fire_lagging(&self, elapsed_ms: u32, stale_reads: u32) {
        self.inner.lock().shots.push(SimShot {
            elapsed_ms,
            stale_reads,
        });
    }

    // -- Fault injection --

    /// Answer the next command carrying `tag` with `#ERR=<kind>`.
    pub fn fail_next(&self, tag: &str, kind: ErrorKind) {
        self.inner.lock().faults.push_back((tag.to_string(), kind));
    }

    /// Stop (or resume) answering queries.
    pub fn set_muted(&self, muted: bool) {
        self.inner.lock().muted = muted;
    }

    /// Push a line nobody asked for.
    pub fn inject(&self, line: &str) {
        let opts = self.inner.lock().opts.clone();
        self.deliver(&opts, line.to_string());
    }

    /// Drop the link. Later writes fail.
    pub fn disconnect(&self) {
        self.inner.lock().connected = false;
        let _ = self.inbound.send(Inbound::Disconnected);
    }

    // -- Command handling --

    fn handle(&self, line: &str) {
        let mut g = self.inner.lock();
        g.received.push(line.to_string());
        let tag = line.split('=').next().unwrap_or(line);

        let pos = g.faults.iter().position(|(t, _)| t == tag);
        let fault = pos.and_then(|pos| g.faults.remove(pos));
        if let Some((_, kind)) = fault {
            return self.reply_error(g, kind);
        }

        let reply = match tag {
            TAG_STATE => Some(format!("{TAG_STATE}={}", g.state.as_code())),
            TAG_SHOT_COUNT => Some(format!("{TAG_SHOT_COUNT}={}", g.shots.len())),
            TAG_SHOT_TIME => Some(Self::shot_time(&mut g, line)),
            TAG_MIN_DELAY => {
                match codec::read_u32(line, TAG_MIN_DELAY) {
                    Ok(ms) => g.min_delay_ms = ms,
                    Err(_) => return self.reply_error(g, ErrorKind::DataNotInteger),
                }
                None
            }
            TAG_MAX_DELAY => {
                match codec::read_u32(line, TAG_MAX_DELAY) {
                    Ok(ms) => g.max_delay_ms = ms,
                    Err(_) => return self.reply_error(g, ErrorKind::DataNotInteger),
                }
                None
            }
            TAG_START => {
                self.start_countdown(&mut g);
                None
            }
            TAG_STANDBY | TAG_READY => {
                g.countdown += 1;
                g.state = SessionState::Idle;
                g.shots.clear();
                g.started_at = None;
                None
            }
            _ => return self.reply_error(g, ErrorKind::CommandError),
        };

        if let Some(reply) = reply {
            if g.muted {
                debug!(%line, "muted, not answering");
                return;
            }
            let opts = g.opts.clone();
            drop(g);
            self.deliver(&opts, reply);
        }
    }

    fn shot_time(g: &mut Inner, line: &str) -> String {
        let Ok(wire_id) = codec::read_u32(line, TAG_SHOT_TIME) else {
            return err_line(ErrorKind::DataNotInteger);
        };
        let idx = wire_id as usize;
        let Some(shot) = g.shots.get_mut(idx) else {
            return err_line(ErrorKind::IdOutOfRange);
        };
        if shot.stale_reads == 0 {
            return format!("{TAG_SHOT_TIME}={}", shot.elapsed_ms);
        }
        shot.stale_reads -= 1;
        match idx.checked_sub(1).map(|prev| g.shots[prev].elapsed_ms) {
            Some(prev_ms) => format!("{TAG_SHOT_TIME}={prev_ms}"),
            None => err_line(ErrorKind::DataEmpty),
        }
    }

    fn start_countdown(&self, g: &mut Inner) {
        g.countdown += 1;
        g.state = SessionState::Countdown;
        g.shots.clear();
        g.started_at = None;
        let (lo, hi) = (
            g.min_delay_ms.min(g.max_delay_ms),
            g.min_delay_ms.max(g.max_delay_ms),
        );
        let delay_ms = g.rng.gen_range(lo..=hi);
        let countdown = g.countdown;
        debug!(delay_ms, "countdown started");

        let device = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
            let mut g = device.inner.lock();
            if g.countdown == countdown && g.state == SessionState::Countdown {
                info!(delay_ms, "beep");
                g.state = SessionState::Running;
                g.started_at = Some(Instant::now());
            }
        });
    }

    fn reply_error(&self, g: parking_lot::MutexGuard<'_, Inner>, kind: ErrorKind) {
        let opts = g.opts.clone();
        drop(g);
        self.deliver(&opts, err_line(kind));
    }

    fn deliver(&self, opts: &SimOptions, line: String) {
        let bytes = format!("{line}{}", opts.line_ending).into_bytes();
        let chunks: Vec<Vec<u8>> = if opts.chunk_size == 0 {
            vec![bytes]
        } else {
            bytes.chunks(opts.chunk_size).map(<[u8]>::to_vec).collect()
        };

        if opts.reply_delay.is_zero() {
            for chunk in chunks {
                let _ = self.inbound.send(Inbound::Bytes(chunk));
            }
        } else {
            let inbound = self.inbound.clone();
            let delay = opts.reply_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for chunk in chunks {
                    let _ = inbound.send(Inbound::Bytes(chunk));
                }
            });
        }
    }
}

fn err_line(kind: ErrorKind) -> String {
    format!("#ERR={:02X}", kind.code().unwrap_or(0xFF))
}

/// Outbound half of the simulated link.
pub struct SimTransport {
    device: SimDevice,
    splitter: LineSplitter,
}

impl Transport for SimTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.device.inner.lock().connected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "simulated link down"));
        }
        for line in self.splitter.feed(data) {
            self.device.handle(&line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::conn::ConnError;
    use crate::protocol::config::StartMode;
    use crate::seq;

    const T: Duration = Duration::from_millis(500);

    fn connect() -> (SimDevice, Correlator) {
        let (dev, link) = SimDevice::connect(SimOptions {
            seed: Some(7),
            ..SimOptions::default()
        });
        (dev, link.with_settle(Duration::ZERO))
    }

    #[tokio::test(start_paused = true)]
    async fn answers_queries() {
        let (dev, link) = connect();
        let cancel = CancellationToken::new();
        dev.beep();
        dev.fire_at(1500);
        dev.fire_at(1800);
        assert_eq!(seq::query_state(&link, T, &cancel).await.unwrap(), SessionState::Running);
        assert_eq!(seq::query_shot_count(&link, T, &cancel).await.unwrap(), 2);
        assert_eq!(seq::query_shot_time(&link, 2, T, &cancel).await.unwrap(), 1800);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_shot() {
        let (_dev, link) = connect();
        match seq::query_shot_time(&link, 1, T, &CancellationToken::new()).await {
            Err(ConnError::Device(e)) => assert_eq!(e.kind, ErrorKind::IdOutOfRange),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_counts_down_within_window() {
        let (dev, link) = connect();
        let cancel = CancellationToken::new();
        seq::configure_start(&link, &StartMode::Fixed { delay_ms: 1000 }, &cancel).unwrap();
        seq::start(&link, &cancel).unwrap();
        assert_eq!(seq::query_state(&link, T, &cancel).await.unwrap(), SessionState::Countdown);
        assert_eq!(dev.delay_window(), (1000, 1000));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(dev.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn standby_cancels_countdown_and_clears_shots() {
        let (dev, link) = connect();
        let cancel = CancellationToken::new();
        seq::configure_start(&link, &StartMode::Fixed { delay_ms: 500 }, &cancel).unwrap();
        seq::start(&link, &cancel).unwrap();
        seq::query_state(&link, T, &cancel).await.unwrap();
        dev.fire_at(10);
        seq::standby_ready(&link, &cancel).unwrap();
        seq::query_state(&link, T, &cancel).await.unwrap();
        assert_eq!(dev.shot_count(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(dev.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reads_return_previous_time() {
        let (dev, link) = connect();
        let cancel = CancellationToken::new();
        dev.fire_at(1000);
        dev.fire_lagging(1400, 1);
        assert_eq!(seq::query_shot_time(&link, 2, T, &cancel).await.unwrap(), 1000);
        assert_eq!(seq::query_shot_time(&link, 2, T, &cancel).await.unwrap(), 1400);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_fault_answers_once() {
        let (dev, link) = connect();
        let cancel = CancellationToken::new();
        dev.fail_next(TAG_STATE, ErrorKind::Busy);
        assert!(matches!(
            seq::query_state(&link, T, &cancel).await,
            Err(ConnError::Device(e)) if e.kind == ErrorKind::Busy
        ));
        assert!(seq::query_state(&link, T, &cancel).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_and_delayed_replies() {
        let (dev, link) = SimDevice::connect(SimOptions {
            chunk_size: 3,
            reply_delay: Duration::from_millis(40),
            ..SimOptions::default()
        });
        dev.fire_at(2222);
        let ms = seq::query_shot_time(&link, 1, T, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ms, 2222);
    }

    #[tokio::test(start_paused = true)]
    async fn muted_device_times_out() {
        let (dev, link) = connect();
        dev.set_muted(true);
        assert!(matches!(
            seq::query_state(&link, Duration::from_millis(50), &CancellationToken::new()).await,
            Err(ConnError::Timeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_link() {
        let (dev, link) = connect();
        dev.disconnect();
        link.disconnected().await;
        assert!(!link.is_connected());
        assert_eq!(dev.received(), Vec::<String>::new());
    }
}

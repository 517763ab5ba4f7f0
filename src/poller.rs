//! Session driver.
//!
//! [`Poller`] runs one session at a time on a spawned task and publishes a
//! [`Snapshot`] after every change plus a stream of [`PollerEvent`]s.
//!
//! | Phase | Work |
//! |---|---|
//! | `Stopped` | none |
//! | `Starting` | standby/ready, delay window, start (once) |
//! | `AwaitingBeep` | each tick: read state and count until the timer runs |
//! | `Polling` | each tick: read state, count (rate-limited), fetch one shot time |
//!
//! Stop keeps the session's data; reset and start discard it. Results that
//! arrive for an older session are dropped.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PollerConfig;
use crate::conn::{ConnError, Correlator};
use crate::protocol::SessionState;
use crate::seq;
use crate::session::{Session, SessionToken, Snapshot};
use crate::shots::Fill;

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Where the poller is in its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PollPhase {
    #[default]
    Stopped,
    Starting,
    AwaitingBeep,
    Polling,
}

impl fmt::Display for PollPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::AwaitingBeep => "AWAITING_BEEP",
            Self::Polling => "POLLING",
        })
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Reset,
    /// The link dropped or was never up.
    Disconnected,
    /// Transport write failure.
    Failed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "stopped"),
            Self::Reset => write!(f, "reset"),
            Self::Disconnected => write!(f, "transport disconnected"),
            Self::Failed(e) => write!(f, "transport failed: {e}"),
        }
    }
}

impl From<ConnError> for StopReason {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::Cancelled => Self::Requested,
            ConnError::Disconnected | ConnError::TransportUnavailable => Self::Disconnected,
            other => Self::Failed(other.to_string()),
        }
    }
}

/// Notable changes, for logs and displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerEvent {
    PhaseChanged { phase: PollPhase },
    StateChanged { state: SessionState },
    ShotDiscovered { id: u32, false_start: bool },
    ShotTimed { id: u32, elapsed_ms: u32 },
    /// A time fetch failed or its value was rejected. The slot is retried on
    /// a later tick.
    FetchFailed { id: u32, error: String },
    Stopped { reason: StopReason },
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    link: Correlator,
    config: PollerConfig,
    session: Mutex<Session>,
    snapshots: watch::Sender<Snapshot>,
    events: broadcast::Sender<PollerEvent>,
}

impl Shared {
    fn new(link: Correlator, config: PollerConfig) -> Self {
        let (snapshots, _) = watch::channel(Snapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            link,
            config,
            session: Mutex::new(Session::new()),
            snapshots,
            events,
        }
    }

    /// Mutate the session, then publish the snapshot and collected events.
    fn with_session<R>(&self, f: impl FnOnce(&mut Session, &mut Vec<PollerEvent>) -> R) -> R {
        let mut session = self.session.lock();
        let mut events = Vec::new();
        let out = f(&mut *session, &mut events);
        let snapshot = session.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        for event in events {
            let _ = self.events.send(event);
        }
        out
    }

    /// As [`with_session`](Self::with_session), skipped if `token` is stale.
    fn update<R>(
        &self,
        token: SessionToken,
        f: impl FnOnce(&mut Session, &mut Vec<PollerEvent>) -> R,
    ) -> Option<R> {
        self.with_session(|session, events| {
            if !session.is_current(token) {
                debug!(generation = token.generation(), "discarding result from old session");
                return None;
            }
            Some(f(session, events))
        })
    }
}

/// Move to `phase`. Returns `true` if it changed.
fn enter(session: &mut Session, phase: PollPhase, events: &mut Vec<PollerEvent>) -> bool {
    if !session.set_phase(phase) {
        return false;
    }
    info!(%phase, generation = session.token().generation(), "phase");
    events.push(PollerEvent::PhaseChanged { phase });
    true
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Drives shot-timer sessions over a [`Correlator`].
///
/// # Example
///
/// ```no_run
/// # async fn demo(link: shotline::Correlator) {
/// use shotline::{PollPhase, Poller, PollerConfig};
///
/// let poller = Poller::new(link, PollerConfig::default());
/// let mut snapshots = poller.watch();
/// poller.start();
/// while snapshots.changed().await.is_ok() {
///     let snap = snapshots.borrow_and_update().clone();
///     println!("{} shots", snap.shot_count());
///     if snap.phase == PollPhase::Stopped {
///         break;
///     }
/// }
/// # }
/// ```
pub struct Poller {
    shared: Arc<Shared>,
    run: Mutex<Option<CancellationToken>>,
}

impl Poller {
    pub fn new(link: Correlator, config: PollerConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(link, config)),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> PollPhase {
        self.shared.session.lock().phase()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshots.borrow().clone()
    }

    /// Receiver for the snapshot published after every change.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshots.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollerEvent> {
        self.shared.events.subscribe()
    }

    /// Begin a new session, abandoning any current one and its data.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(&self) -> SessionToken {
        let cancel = CancellationToken::new();
        if let Some(old) = self.run.lock().replace(cancel.clone()) {
            old.cancel();
        }
        let token = self.shared.with_session(|session, events| {
            let token = session.renew();
            enter(session, PollPhase::Starting, events);
            token
        });

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            token,
            cancel,
            last_count_read: None,
            last_failed: None,
        };
        tokio::spawn(worker.run());
        token
    }

    /// Halt polling. Slots and state are kept for display.
    pub fn stop(&self) {
        self.cancel_run();
        self.shared.with_session(|session, events| {
            if enter(session, PollPhase::Stopped, events) {
                events.push(PollerEvent::Stopped {
                    reason: StopReason::Requested,
                });
            }
        });
    }

    /// Halt polling and discard the session's data.
    ///
    /// With `reset_device_on_reset`, standby/ready is also sent to the timer;
    /// failure to send is logged.
    pub fn reset(&self) {
        self.cancel_run();
        self.shared.with_session(|session, events| {
            session.renew();
            enter(session, PollPhase::Stopped, events);
            events.push(PollerEvent::Stopped {
                reason: StopReason::Reset,
            });
        });
        if self.shared.config.reset_device_on_reset
            && let Err(e) = seq::standby_ready(&self.shared.link, &CancellationToken::new())
        {
            warn!("device reset not sent: {e}");
        }
    }

    fn cancel_run(&self) {
        if let Some(run) = self.run.lock().take() {
            run.cancel();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel_run();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// One session's task. Every mutation is checked against `token`.
struct Worker {
    shared: Arc<Shared>,
    token: SessionToken,
    cancel: CancellationToken,
    last_count_read: Option<Instant>,
    /// Slot whose last fetch failed. The next fetch starts above it.
    last_failed: Option<u32>,
}

impl Worker {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let link = self.shared.link.clone();
        let reason = tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            _ = link.disconnected() => StopReason::Disconnected,
            reason = self.drive() => reason,
        };

        if reason == StopReason::Requested {
            return;
        }
        error!(generation = self.token.generation(), "session ended: {reason}");
        self.cancel.cancel();
        self.shared.update(self.token, |session, events| {
            if enter(session, PollPhase::Stopped, events) {
                events.push(PollerEvent::Stopped { reason });
            }
        });
    }

    async fn drive(&mut self) -> StopReason {
        if let Err(e) = self.starting() {
            return e.into();
        }
        self.enter(PollPhase::AwaitingBeep);

        let mut ticker = tokio::time::interval(self.shared.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = match self.phase() {
                Some(PollPhase::AwaitingBeep) => self.await_beep().await,
                Some(PollPhase::Polling) => self.poll().await,
                _ => return StopReason::Requested,
            };
            if let Err(e) = outcome {
                return e.into();
            }
        }
    }

    // -- Phases --

    fn starting(&self) -> Result<(), ConnError> {
        let link = &self.shared.link;
        seq::standby_ready(link, &self.cancel)?;
        seq::configure_start(link, &self.shared.config.start_mode, &self.cancel)?;
        seq::start(link, &self.cancel)
    }

    async fn await_beep(&mut self) -> Result<(), ConnError> {
        let state = self.refresh_state().await?;
        if let Some(count) = self.read_count().await? {
            self.advance(count);
        }
        if state.is_some_and(SessionState::is_running) {
            self.enter(PollPhase::Polling);
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<(), ConnError> {
        self.refresh_state().await?;
        let cooldown = self.shared.config.count_cooldown();
        if self.last_count_read.is_none_or(|at| at.elapsed() >= cooldown)
            && let Some(count) = self.read_count().await?
        {
            self.advance(count);
        }
        match self.next_unfilled() {
            Some(id) => self.fetch(id).await,
            None => Ok(()),
        }
    }

    // -- Steps --

    /// Read the timer state and record it. `Ok(None)` if the read failed
    /// without ending the session; the recorded state is then unchanged.
    async fn refresh_state(&self) -> Result<Option<SessionState>, ConnError> {
        let timeout = self.shared.config.request_timeout();
        let result = seq::query_state(&self.shared.link, timeout, &self.cancel).await;
        let Some(state) = tolerate("state query", result)? else {
            return Ok(None);
        };
        self.shared.update(self.token, |session, events| {
            if let Some(state) = session.apply_state(state) {
                info!(%state, "timer state");
                events.push(PollerEvent::StateChanged { state });
            }
        });
        Ok(Some(state))
    }

    async fn read_count(&mut self) -> Result<Option<u32>, ConnError> {
        self.last_count_read = Some(Instant::now());
        let timeout = self.shared.config.request_timeout();
        let result = seq::query_shot_count(&self.shared.link, timeout, &self.cancel).await;
        tolerate("shot count query", result)
    }

    fn advance(&self, count: u32) {
        self.shared.update(self.token, |session, events| {
            let state = session.state();
            let false_start = !state.is_running();
            for id in session.shots_mut().advance_count(count, state) {
                if false_start {
                    warn!(id, %state, "false start");
                } else {
                    debug!(id, "shot discovered");
                }
                events.push(PollerEvent::ShotDiscovered { id, false_start });
            }
        });
    }

    async fn fetch(&mut self, id: u32) -> Result<(), ConnError> {
        let link = &self.shared.link;
        let cancel = &self.cancel;
        let timeout = self.shared.config.request_timeout();
        let result = self
            .shared
            .config
            .retry
            .run(move |_| seq::query_shot_time(link, id, timeout, cancel))
            .await;

        let elapsed_ms = match result {
            Ok(ms) => ms,
            Err(e) if e.is_fatal() || matches!(e, ConnError::Cancelled) => return Err(e),
            Err(e) => {
                warn!(id, "shot time fetch failed: {e}");
                self.last_failed = Some(id);
                self.shared.update(self.token, |_, events| {
                    events.push(PollerEvent::FetchFailed {
                        id,
                        error: e.to_string(),
                    });
                });
                return Ok(());
            }
        };

        let filled = self.shared.update(self.token, |session, events| {
            match session.shots_mut().fill_slot(id, elapsed_ms) {
                Ok(Fill::Filled) => {
                    info!(id, elapsed_ms, "shot timed");
                    events.push(PollerEvent::ShotTimed { id, elapsed_ms });
                    true
                }
                Ok(Fill::AlreadyFilled) => {
                    debug!(id, "slot already filled");
                    true
                }
                Err(e) => {
                    events.push(PollerEvent::FetchFailed {
                        id,
                        error: e.to_string(),
                    });
                    false
                }
            }
        });
        self.last_failed = match filled {
            Some(false) => Some(id),
            _ => None,
        };
        Ok(())
    }

    // -- Session access --

    fn phase(&self) -> Option<PollPhase> {
        let session = self.shared.session.lock();
        session.is_current(self.token).then(|| session.phase())
    }

    /// Slot to fetch this tick: lowest unfilled, or the lowest above the
    /// last failed slot.
    fn next_unfilled(&self) -> Option<u32> {
        let session = self.shared.session.lock();
        if !session.is_current(self.token) {
            return None;
        }
        match self.last_failed {
            Some(after) => session.shots().next_unfilled_after(after),
            None => session.shots().next_unfilled(),
        }
    }

    fn enter(&self, phase: PollPhase) {
        self.shared.update(self.token, |session, events| {
            enter(session, phase, events);
        });
    }
}

/// Pass through errors that end the session; log and swallow the rest.
fn tolerate<T>(what: &'static str, result: Result<T, ConnError>) -> Result<Option<T>, ConnError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() || matches!(e, ConnError::Cancelled) => Err(e),
        Err(e) => {
            warn!(what, "{e}");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::config::StartMode;
    use crate::protocol::{ErrorKind, TAG_SHOT_COUNT, TAG_SHOT_TIME, TAG_STATE};
    use crate::sim::{SimDevice, SimOptions};

    const WAIT: Duration = Duration::from_secs(30);

    fn config(delay_ms: u32) -> PollerConfig {
        PollerConfig {
            start_mode: StartMode::Fixed { delay_ms },
            ..PollerConfig::default()
        }
    }

    fn setup(opts: SimOptions, delay_ms: u32) -> (SimDevice, Poller) {
        let (dev, link) = SimDevice::connect(SimOptions {
            seed: Some(1),
            ..opts
        });
        (dev, Poller::new(link, config(delay_ms)))
    }

    async fn wait_until(poller: &Poller, f: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let mut rx = poller.watch();
        tokio::time::timeout(WAIT, rx.wait_for(|s| f(s)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("poller dropped")
            .clone()
    }

    fn timed(snap: &Snapshot, n: usize) -> bool {
        snap.slots.len() == n && snap.slots.iter().all(|s| s.elapsed_ms.is_some())
    }

    fn drain(rx: &mut broadcast::Receiver<PollerEvent>) -> Vec<PollerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn session_discovers_and_times_shots() {
        let (dev, poller) = setup(SimOptions::default(), 1000);
        let token = poller.start();

        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(1200);
        dev.fire_at(1420);
        dev.fire_at(1980);

        let snap = wait_until(&poller, |s| timed(s, 3)).await;
        assert_eq!(snap.generation, token.generation());
        assert_eq!(snap.state, SessionState::Running);
        let elapsed: Vec<_> = snap.slots.iter().map(|s| s.elapsed_ms).collect();
        assert_eq!(elapsed, vec![Some(1200), Some(1420), Some(1980)]);
        let splits: Vec<_> = snap.slots.iter().map(|s| s.split_ms).collect();
        assert_eq!(splits, vec![None, Some(220), Some(560)]);
        assert!(snap.slots.iter().all(|s| !s.false_start));

        assert_eq!(
            dev.received()[..5].to_vec(),
            vec!["#S_STB", "#S_GRD", "#S_TMIN=1000", "#S_TMAX=1000", "#E_STARTT"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn phases_progress_in_order() {
        let (_dev, poller) = setup(SimOptions::default(), 600);
        let mut events = poller.subscribe();
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;

        let phases: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                PollerEvent::PhaseChanged { phase } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![PollPhase::Starting, PollPhase::AwaitingBeep, PollPhase::Polling]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shot_before_beep_is_false_start() {
        let (dev, poller) = setup(SimOptions::default(), 2000);
        poller.start();
        wait_until(&poller, |s| s.state == SessionState::Countdown).await;
        dev.fire();

        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(2500);

        let snap = wait_until(&poller, |s| timed(s, 2)).await;
        let flags: Vec<_> = snap.slots.iter().map(|s| s.false_start).collect();
        assert_eq!(flags, vec![true, false]);
        assert_eq!(snap.slots[0].elapsed_ms, Some(0));
        assert_eq!(snap.real_shots().count(), 1);
        assert_eq!(snap.first_ms(), Some(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_time_is_rejected_then_refetched() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        let mut events = poller.subscribe();
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(1000);
        wait_until(&poller, |s| timed(s, 1)).await;
        dev.fire_lagging(1400, 2);

        let snap = wait_until(&poller, |s| timed(s, 2)).await;
        assert_eq!(snap.slots[1].elapsed_ms, Some(1400));
        assert_eq!(snap.slots[1].split_ms, Some(400));
        assert!(
            drain(&mut events)
                .iter()
                .any(|e| matches!(e, PollerEvent::FetchFailed { id: 2, .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_error_is_retried_within_tick() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        let mut events = poller.subscribe();
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fail_next(TAG_SHOT_TIME, ErrorKind::Busy);
        dev.fire_at(900);

        wait_until(&poller, |s| timed(s, 1)).await;
        assert!(
            !drain(&mut events)
                .iter()
                .any(|e| matches!(e, PollerEvent::FetchFailed { .. }))
        );
    }

    fn count_sent(dev: &SimDevice, tag: &str) -> usize {
        dev.received().iter().filter(|l| l.starts_with(tag)).count()
    }

    fn position(events: &[PollerEvent], f: impl Fn(&PollerEvent) -> bool) -> usize {
        events.iter().position(f).expect("event not emitted")
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_is_refetched_on_later_tick() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        let mut events = poller.subscribe();
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fail_next(TAG_SHOT_TIME, ErrorKind::CrcError);
        dev.fire_at(900);

        let snap = wait_until(&poller, |s| timed(s, 1)).await;
        assert_eq!(snap.slots[0].elapsed_ms, Some(900));
        // One failed read, no retry within the tick, one good read later.
        assert_eq!(count_sent(&dev, TAG_SHOT_TIME), 2);
        let events = drain(&mut events);
        let failed = position(&events, |e| matches!(e, PollerEvent::FetchFailed { id: 1, .. }));
        let filled = position(&events, |e| matches!(e, PollerEvent::ShotTimed { id: 1, .. }));
        assert!(failed < filled);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_refetched_on_next_tick() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        let mut events = poller.subscribe();
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        for _ in 0..3 {
            dev.fail_next(TAG_SHOT_TIME, ErrorKind::Busy);
        }
        dev.fire_at(1300);

        let snap = wait_until(&poller, |s| timed(s, 1)).await;
        assert_eq!(snap.slots[0].elapsed_ms, Some(1300));
        assert_eq!(count_sent(&dev, TAG_SHOT_TIME), 4);
        let events = drain(&mut events);
        let fails = events
            .iter()
            .filter(|e| matches!(e, PollerEvent::FetchFailed { id: 1, .. }))
            .count();
        assert_eq!(fails, 1);
        let failed = position(&events, |e| matches!(e, PollerEvent::FetchFailed { id: 1, .. }));
        let filled = position(&events, |e| matches!(e, PollerEvent::ShotTimed { id: 1, .. }));
        assert!(failed < filled);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_slot_does_not_block_later_slots() {
        let (dev, poller) = setup(SimOptions::default(), 2000);
        poller.start();
        wait_until(&poller, |s| s.state == SessionState::Countdown).await;
        // Both recorded as 0 ms: the second is always a duplicate.
        dev.fire();
        dev.fire();

        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(2500);
        dev.fire_at(3100);

        let snap = wait_until(&poller, |s| {
            s.slots.len() == 4 && s.slots[2..].iter().all(|slot| slot.elapsed_ms.is_some())
        })
        .await;
        let elapsed: Vec<_> = snap.slots.iter().map(|s| s.elapsed_ms).collect();
        assert_eq!(elapsed, vec![Some(0), None, Some(2500), Some(3100)]);
        let flags: Vec<_> = snap.slots.iter().map(|s| s.false_start).collect();
        assert_eq!(flags, vec![true, true, false, false]);
        assert_eq!(snap.slots[3].split_ms, Some(600));
    }

    #[tokio::test(start_paused = true)]
    async fn count_reads_respect_cooldown() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;

        let before = dev.received().len();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        let window = dev.received()[before..].to_vec();
        let states = window.iter().filter(|l| *l == TAG_STATE).count();
        let counts = window.iter().filter(|l| *l == TAG_SHOT_COUNT).count();

        // 200 ms ticks, 400 ms count cooldown.
        assert!(states >= 9, "state read every tick, got {states}");
        assert!(counts <= 2000 / 400 + 1, "count read too often: {counts}");
        assert!(counts >= 3, "count never refreshed: {counts}");
        assert!(counts < states);
    }

    #[test]
    fn update_with_old_token_is_discarded() {
        let shared = Shared::new(Correlator::detached(), PollerConfig::default());
        let mut events = shared.events.subscribe();
        let snapshots = shared.snapshots.subscribe();
        let old = shared.with_session(|session, _| session.token());
        let current = shared.with_session(|session, _| session.renew());
        let before = snapshots.borrow().clone();

        let applied = shared.update(old, |session, events| {
            session.apply_state(SessionState::Running);
            session.shots_mut().advance_count(2, SessionState::Running);
            events.push(PollerEvent::ShotDiscovered {
                id: 1,
                false_start: false,
            });
        });
        assert_eq!(applied, None);
        assert!(events.try_recv().is_err());
        assert_eq!(*snapshots.borrow(), before);
        {
            let session = shared.session.lock();
            assert_eq!(session.state(), SessionState::Idle);
            assert!(session.shots().is_empty());
        }

        let applied = shared.update(current, |session, _| session.apply_state(SessionState::Running));
        assert_eq!(applied, Some(Some(SessionState::Running)));
        assert_eq!(snapshots.borrow().state, SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_replies_are_reassembled() {
        let opts = SimOptions {
            chunk_size: 2,
            line_ending: "\r",
            ..SimOptions::default()
        };
        let (dev, poller) = setup(opts, 500);
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(3210);
        let snap = wait_until(&poller, |s| timed(s, 1)).await;
        assert_eq!(snap.slots[0].elapsed_ms, Some(3210));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_data_and_halts_requests() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(700);
        wait_until(&poller, |s| timed(s, 1)).await;

        poller.stop();
        assert_eq!(poller.phase(), PollPhase::Stopped);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = dev.received().len();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(dev.received().len(), sent);

        let snap = poller.snapshot();
        assert_eq!(snap.phase, PollPhase::Stopped);
        assert_eq!(snap.slots.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_data_and_resets_device() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        let first = poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(700);
        wait_until(&poller, |s| timed(s, 1)).await;

        poller.reset();
        let snap = poller.snapshot();
        assert_eq!(snap.phase, PollPhase::Stopped);
        assert!(snap.slots.is_empty());
        assert_eq!(snap.state, SessionState::Idle);
        assert!(snap.generation > first.generation());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let sent = dev.received();
        assert_eq!(sent[sent.len() - 2..].to_vec(), vec!["#S_STB", "#S_GRD"]);
        assert_eq!(dev.shot_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_in_flight_result() {
        let opts = SimOptions {
            reply_delay: Duration::from_millis(150),
            ..SimOptions::default()
        };
        let (dev, poller) = setup(opts, 500);
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(1500);

        tokio::time::timeout(WAIT, async {
            while !dev.received().iter().any(|l| l.starts_with(TAG_SHOT_TIME)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        poller.reset();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snap = poller.snapshot();
        assert!(snap.slots.is_empty());
        assert_eq!(snap.phase, PollPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_session() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        let first = poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
        dev.fire_at(800);
        wait_until(&poller, |s| timed(s, 1)).await;

        let second = poller.start();
        assert!(second.generation() > first.generation());
        let snap = poller.snapshot();
        assert!(snap.slots.is_empty());
        assert_eq!(snap.phase, PollPhase::Starting);
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_session() {
        let (dev, poller) = setup(SimOptions::default(), 500);
        let mut events = poller.subscribe();
        poller.start();
        wait_until(&poller, |s| s.phase == PollPhase::Polling).await;

        dev.disconnect();
        wait_until(&poller, |s| s.phase == PollPhase::Stopped).await;
        assert!(drain(&mut events).contains(&PollerEvent::Stopped {
            reason: StopReason::Disconnected
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn detached_link_stops_immediately() {
        let poller = Poller::new(Correlator::detached(), PollerConfig::default());
        poller.start();
        let snap = wait_until(&poller, |s| s.phase == PollPhase::Stopped).await;
        assert!(snap.slots.is_empty());
    }
}

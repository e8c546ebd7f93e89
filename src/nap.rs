//! REM-aware nap sessions.
//!
//! # State Machine
//!
//! ```text
//!            start()                    max-duration timer
//!  Idle ─────────────► Active ─────────────────────────────► Woken
//!   ▲                   │  │                                  │
//!   │      stop()       │  │ first REM: swap timers           │
//!   └───────────────────┘  └──► Active ───────────────────────┤
//!   ▲                             post-REM timer              │
//!   └──────────────────────── (auto) ─────────────────────────┘
//! ```
//!
//! Timers and stream deliveries run as Tokio tasks and call back into the
//! controller. Every transition happens under a single mutex, and every task
//! is tagged with the epoch of the session that spawned it. A callback whose
//! epoch is no longer current, or a timer that is no longer the armed one,
//! is dropped on the floor.

use crate::config::{deadline_after, NapConfig};
use crate::error::NapError;
use crate::sink::{WakeReason, WakeSink};
use crate::source::{SampleSource, Subscription};
use crate::stages::SleepObservation;
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Active,
    Woken,
}

/// The two wake timers a session can have armed. At most one is armed at a
/// time: detecting REM replaces `MaxDuration` with `PostRem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NapTimer {
    MaxDuration,
    PostRem,
}

impl NapTimer {
    pub fn reason(self) -> WakeReason {
        match self {
            NapTimer::MaxDuration => WakeReason::MaxDuration,
            NapTimer::PostRem => WakeReason::PostRem,
        }
    }
}

/// Snapshot of the controller's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NapSession {
    pub epoch: u64,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub rem_detected_at: Option<DateTime<Utc>>,
    /// When the currently armed timer will fire.
    pub wake_deadline: Option<Instant>,
    /// False once the sample stream failed; only the max-duration timer is
    /// left to wake the sleeper.
    pub rem_detection_available: bool,
}

impl NapSession {
    fn idle(epoch: u64) -> Self {
        Self {
            epoch,
            status: SessionStatus::Idle,
            started_at: None,
            rem_detected_at: None,
            wake_deadline: None,
            rem_detection_available: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NapEvent {
    Started { epoch: u64 },
    RemDetected { epoch: u64, at: DateTime<Utc> },
    Woken { epoch: u64, reason: WakeReason },
    Stopped { epoch: u64 },
    Error { epoch: u64, error: NapError },
}

struct ArmedTimer {
    kind: NapTimer,
    handle: JoinHandle<()>,
}

struct State {
    epoch: u64,
    session: NapSession,
    config: Option<NapConfig>,
    timer: Option<ArmedTimer>,
    stream: Option<JoinHandle<()>>,
}

impl State {
    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }
}

struct Shared {
    state: Mutex<State>,
    source: Arc<dyn SampleSource>,
    sink: Arc<dyn WakeSink>,
    events: broadcast::Sender<NapEvent>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        state.cancel_tasks();
    }
}

/// Owns at most one nap session at a time.
///
/// Cloning gives another handle to the same controller. Spawned timers and
/// stream readers only hold weak references, so dropping the last handle
/// cancels a running session without waking anyone.
///
/// `start` must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct NapController {
    shared: Arc<Shared>,
}

impl NapController {
    pub fn new(source: Arc<dyn SampleSource>, sink: Arc<dyn WakeSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    epoch: 0,
                    session: NapSession::idle(0),
                    config: None,
                    timer: None,
                    stream: None,
                }),
                source,
                sink,
                events,
            }),
        }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: NapEvent) {
        // No receivers is fine.
        let _ = self.shared.events.send(event);
    }

    pub fn events(&self) -> broadcast::Receiver<NapEvent> {
        self.shared.events.subscribe()
    }

    pub fn session(&self) -> NapSession {
        self.lock().session.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().session.status
    }

    /// Starts a session: arms the max-duration timer and subscribes to the
    /// sample source from now on.
    ///
    /// A source that cannot subscribe does not fail the start; the error is
    /// broadcast and the session relies on the max-duration timer alone.
    pub fn start(&self, config: NapConfig) -> Result<NapSession, NapError> {
        config.validate()?;

        let mut state = self.lock();
        if state.session.status != SessionStatus::Idle {
            return Err(NapError::AlreadyActive);
        }
        // Nothing may change before the deadline is known to be valid.
        let deadline = deadline_after(config.max_duration)?;

        state.epoch += 1;
        let epoch = state.epoch;
        let started_at = Utc::now();
        state.session = NapSession {
            epoch,
            status: SessionStatus::Active,
            started_at: Some(started_at),
            rem_detected_at: None,
            wake_deadline: None,
            rem_detection_available: true,
        };
        state.config = Some(config);
        self.arm(&mut state, NapTimer::MaxDuration, deadline);

        info!(
            "Nap {} started: max {}s, {}s after REM",
            epoch,
            config.max_duration.as_secs(),
            config.rem_followup.as_secs()
        );
        self.emit(NapEvent::Started { epoch });

        match self.shared.source.subscribe(started_at) {
            Ok(subscription) => {
                state.stream = Some(self.spawn_stream(epoch, subscription));
            }
            Err(error) => {
                warn!(
                    "Nap {}: {}; waking at max duration only",
                    epoch, error
                );
                state.session.rem_detection_available = false;
                self.emit(NapEvent::Error { epoch, error });
            }
        }

        Ok(state.session.clone())
    }

    /// Cancels the running session without waking anyone.
    ///
    /// Returns the discarded session, or `None` if nothing was running. Once
    /// this returns no timer or observation from that session can have an
    /// effect.
    pub fn stop(&self) -> Option<NapSession> {
        let mut state = self.lock();
        if state.session.status != SessionStatus::Active {
            return None;
        }

        let discarded = state.session.clone();
        self.teardown(&mut state);
        info!("Nap {} stopped", discarded.epoch);
        self.emit(NapEvent::Stopped {
            epoch: discarded.epoch,
        });
        Some(discarded)
    }

    /// Feeds one observation into the session tagged `epoch`.
    ///
    /// Returns false when the session is gone and the caller should stop
    /// delivering.
    pub fn on_observation(&self, epoch: u64, obs: &SleepObservation) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch || state.session.status != SessionStatus::Active {
            trace!("Dropping observation for stale nap {}", epoch);
            return false;
        }
        if !obs.is_rem() || state.session.rem_detected_at.is_some() {
            return true;
        }

        let Some(config) = state.config else {
            return true;
        };
        if config.ignore_stale
            && state
                .session
                .started_at
                .is_some_and(|started_at| obs.end < started_at)
        {
            debug!(
                "Nap {}: ignoring REM that ended at {}, before the nap",
                epoch, obs.end
            );
            return true;
        }

        let deadline = match deadline_after(config.rem_followup) {
            Ok(deadline) => deadline,
            Err(error) => {
                warn!("Nap {}: {}; keeping max duration timer", epoch, error);
                return true;
            }
        };
        let detected_at = Utc::now();
        state.session.rem_detected_at = Some(detected_at);
        self.arm(&mut state, NapTimer::PostRem, deadline);
        info!(
            "Nap {}: REM detected (observed {} - {}), waking in {}s",
            epoch,
            obs.start.format("%H:%M"),
            obs.end.format("%H:%M"),
            config.rem_followup.as_secs()
        );
        self.emit(NapEvent::RemDetected {
            epoch,
            at: detected_at,
        });
        true
    }

    /// Handles an expired timer. Wakes the sleeper exactly once if `which`
    /// is still the armed timer of session `epoch`; returns whether it did.
    pub fn on_timer_fired(&self, epoch: u64, which: NapTimer) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch || state.session.status != SessionStatus::Active {
            trace!("Dropping {:?} timer for stale nap {}", which, epoch);
            return false;
        }
        if state.timer.as_ref().map(|timer| timer.kind) != Some(which) {
            debug!("Nap {}: {:?} timer was superseded", epoch, which);
            return false;
        }

        let reason = which.reason();
        state.session.status = SessionStatus::Woken;
        info!("Nap {}: waking ({})", epoch, reason);
        if let Err(error) = self.shared.sink.wake(reason) {
            warn!("Nap {}: {}", epoch, error);
            self.emit(NapEvent::Error { epoch, error });
        }
        self.emit(NapEvent::Woken { epoch, reason });

        self.teardown(&mut state);
        true
    }

    fn on_stream_error(&self, epoch: u64, error: NapError) {
        let mut state = self.lock();
        if state.epoch != epoch || state.session.status != SessionStatus::Active {
            return;
        }
        warn!("Nap {}: {}; waking at max duration only", epoch, error);
        state.session.rem_detection_available = false;
        state.stream = None;
        self.emit(NapEvent::Error { epoch, error });
    }

    /// Replaces whatever timer is armed with `kind`, due at `deadline`.
    fn arm(&self, state: &mut State, kind: NapTimer, deadline: Instant) {
        if let Some(previous) = state.timer.take() {
            previous.handle.abort();
        }

        let epoch = state.epoch;
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(controller) = Self::upgrade(&weak) {
                controller.on_timer_fired(epoch, kind);
            }
        });

        state.session.wake_deadline = Some(deadline);
        state.timer = Some(ArmedTimer { kind, handle });
    }

    fn spawn_stream(&self, epoch: u64, subscription: Subscription) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let Subscription {
                initial,
                mut updates,
            } = subscription;

            for obs in &initial {
                match Self::upgrade(&weak) {
                    Some(controller) if controller.on_observation(epoch, obs) => {}
                    _ => return,
                }
            }

            while let Some(update) = updates.recv().await {
                let Some(controller) = Self::upgrade(&weak) else {
                    return;
                };
                match update {
                    Ok(obs) => {
                        if !controller.on_observation(epoch, &obs) {
                            return;
                        }
                    }
                    Err(error) => {
                        controller.on_stream_error(epoch, error);
                        return;
                    }
                }
            }
            debug!("Nap {}: sample feed closed", epoch);
        })
    }

    /// Cancels timers and the subscription and resets to idle. The epoch
    /// moves on so nothing tagged with the old one matches again.
    fn teardown(&self, state: &mut State) {
        state.cancel_tasks();
        self.shared.source.unsubscribe();
        state.epoch += 1;
        state.config = None;
        state.session = NapSession::idle(state.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ChannelSource;
    use crate::stages::StageKind;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct RecordingSink {
        wakes: Mutex<Vec<WakeReason>>,
    }

    impl RecordingSink {
        fn wakes(&self) -> Vec<WakeReason> {
            self.wakes.lock().unwrap().clone()
        }
    }

    impl WakeSink for RecordingSink {
        fn wake(&self, reason: WakeReason) -> Result<(), NapError> {
            self.wakes.lock().unwrap().push(reason);
            Ok(())
        }
    }

    struct MuteSink;

    impl WakeSink for MuteSink {
        fn wake(&self, _reason: WakeReason) -> Result<(), NapError> {
            Err(NapError::SinkFailure("speaker missing".to_string()))
        }
    }

    struct OfflineSource;

    impl SampleSource for OfflineSource {
        fn subscribe(&self, _window_start: DateTime<Utc>) -> Result<Subscription, NapError> {
            Err(NapError::StreamUnavailable("health store offline".to_string()))
        }
    }

    fn rem_ending(end: DateTime<Utc>) -> SleepObservation {
        SleepObservation::new(StageKind::Rem, end - ChronoDuration::minutes(5), end)
    }

    fn setup() -> (NapController, Arc<ChannelSource>, Arc<RecordingSink>) {
        let source = Arc::new(ChannelSource::new(vec![]));
        let sink = Arc::new(RecordingSink::default());
        let controller = NapController::new(source.clone(), sink.clone());
        (controller, source, sink)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_arms_max_duration_timer() {
        let (controller, _source, _sink) = setup();
        let before = Instant::now();
        let session = controller.start(NapConfig::default()).unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.epoch, 1);
        assert!(session.started_at.is_some());
        assert!(session.rem_detected_at.is_none());
        assert!(session.rem_detection_available);
        assert_eq!(session.wake_deadline, Some(before + 30 * MINUTE));
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_active_is_rejected() {
        let (controller, _source, _sink) = setup();
        let first = controller.start(NapConfig::default()).unwrap();

        assert_eq!(
            controller.start(NapConfig::default()),
            Err(NapError::AlreadyActive)
        );
        assert_eq!(controller.session(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_timer_superseded_by_rem_is_ignored() {
        let (controller, source, sink) = setup();
        let epoch = controller.start(NapConfig::default()).unwrap().epoch;
        settle().await;

        assert!(source.push(rem_ending(Utc::now())));
        settle().await;
        assert!(controller.session().rem_detected_at.is_some());

        assert!(!controller.on_timer_fired(epoch, NapTimer::MaxDuration));
        assert_eq!(controller.status(), SessionStatus::Active);
        assert!(sink.wakes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_config_is_rejected_before_any_change() {
        let (controller, _source, sink) = setup();
        let before = controller.session();

        let endless = NapConfig::new(Duration::MAX, MINUTE);
        assert!(matches!(
            controller.start(endless),
            Err(NapError::InvalidConfig(_))
        ));
        assert_eq!(controller.session(), before);

        let session = controller.start(NapConfig::default()).unwrap();
        assert!(session.wake_deadline.is_some());
        tokio::time::sleep(31 * MINUTE).await;
        assert_eq!(sink.wakes(), vec![WakeReason::MaxDuration]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_moves_epoch_on() {
        let (controller, _source, _sink) = setup();
        let running = controller.start(NapConfig::default()).unwrap();
        let discarded = controller.stop().unwrap();
        assert_eq!(discarded.epoch, running.epoch);

        let idle = controller.session();
        assert_eq!(idle.status, SessionStatus::Idle);
        assert!(idle.epoch > running.epoch);
        assert!(!controller.on_observation(running.epoch, &rem_ending(Utc::now())));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_epoch_events_are_dropped() {
        let (controller, _source, sink) = setup();
        let old = controller.start(NapConfig::default()).unwrap().epoch;
        controller.stop();
        let new = controller.start(NapConfig::default()).unwrap().epoch;
        assert!(new > old);

        assert!(!controller.on_observation(old, &rem_ending(Utc::now())));
        assert!(!controller.on_timer_fired(old, NapTimer::MaxDuration));
        assert!(controller.session().rem_detected_at.is_none());
        assert!(sink.wakes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_falls_back_to_max_duration() {
        let sink = Arc::new(RecordingSink::default());
        let controller = NapController::new(Arc::new(OfflineSource), sink.clone());
        let mut events = controller.events();

        let session = controller.start(NapConfig::default()).unwrap();
        assert!(!session.rem_detection_available);
        assert_eq!(events.recv().await.unwrap(), NapEvent::Started { epoch: 1 });
        assert!(matches!(
            events.recv().await.unwrap(),
            NapEvent::Error {
                error: NapError::StreamUnavailable(_),
                ..
            }
        ));

        tokio::time::sleep(31 * MINUTE).await;
        assert_eq!(sink.wakes(), vec![WakeReason::MaxDuration]);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failure_keeps_hard_cap() {
        let (controller, source, sink) = setup();
        controller.start(NapConfig::default()).unwrap();
        settle().await;

        assert!(source.fail("watch disconnected"));
        settle().await;
        assert!(!controller.session().rem_detection_available);
        assert_eq!(controller.status(), SessionStatus::Active);

        tokio::time::sleep(31 * MINUTE).await;
        assert_eq!(sink.wakes(), vec![WakeReason::MaxDuration]);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_still_completes_wake() {
        let source = Arc::new(ChannelSource::new(vec![]));
        let controller = NapController::new(source, Arc::new(MuteSink));
        let mut events = controller.events();
        let epoch = controller.start(NapConfig::default()).unwrap().epoch;

        tokio::time::sleep(31 * MINUTE).await;
        assert_eq!(controller.status(), SessionStatus::Idle);

        assert_eq!(events.recv().await.unwrap(), NapEvent::Started { epoch });
        assert!(matches!(
            events.recv().await.unwrap(),
            NapEvent::Error {
                error: NapError::SinkFailure(_),
                ..
            }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            NapEvent::Woken {
                epoch,
                reason: WakeReason::MaxDuration
            }
        );
        assert!(controller.start(NapConfig::default()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_rem_counts_unless_guarded() {
        let before_nap = Utc::now() - ChronoDuration::hours(2);

        let source = Arc::new(ChannelSource::new(vec![rem_ending(before_nap)]));
        let sink = Arc::new(RecordingSink::default());
        let controller = NapController::new(source, sink.clone());
        controller.start(NapConfig::default()).unwrap();
        settle().await;
        assert!(controller.session().rem_detected_at.is_some());
        controller.stop();

        let source = Arc::new(ChannelSource::new(vec![rem_ending(before_nap)]));
        let controller = NapController::new(source, sink);
        controller
            .start(NapConfig::default().with_ignore_stale(true))
            .unwrap();
        settle().await;
        assert!(controller.session().rem_detected_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_controller_cancels_session() {
        let (controller, source, sink) = setup();
        controller.start(NapConfig::default()).unwrap();
        settle().await;
        drop(controller);

        tokio::time::sleep(60 * MINUTE).await;
        assert!(sink.wakes().is_empty());
        assert!(!source.push(rem_ending(Utc::now())));
    }
}

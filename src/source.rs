//! Sleep sample sources.
//!
//! A source hands out a [`Subscription`]: the observations it already has for
//! the requested window plus a live feed of new ones. `unsubscribe` releases
//! the producer side; producers also stop once the receiver is dropped and
//! their next send fails.

use crate::error::NapError;
use crate::stages::SleepObservation;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type LiveUpdate = Result<SleepObservation, NapError>;

#[derive(Debug)]
pub struct Subscription {
    pub initial: Vec<SleepObservation>,
    pub updates: mpsc::UnboundedReceiver<LiveUpdate>,
}

pub trait SampleSource: Send + Sync {
    /// Starts delivering observations from `window_start` onward.
    fn subscribe(&self, window_start: DateTime<Utc>) -> Result<Subscription, NapError>;

    /// Releases anything held for the current subscription.
    fn unsubscribe(&self) {}
}

/// A source fed by hand through [`ChannelSource::sender`].
///
/// Only one subscription can be live at a time; once it is dropped the next
/// `subscribe` gets a fresh channel.
#[derive(Debug, Default)]
pub struct ChannelSource {
    initial: Vec<SleepObservation>,
    sender: Mutex<Option<mpsc::UnboundedSender<LiveUpdate>>>,
}

impl ChannelSource {
    pub fn new(initial: Vec<SleepObservation>) -> Self {
        Self {
            initial,
            sender: Mutex::new(None),
        }
    }

    /// Sender for the live subscription, if one exists.
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<LiveUpdate>> {
        self.sender
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().filter(|tx| !tx.is_closed()).cloned())
    }

    /// Pushes an observation to the live subscription. Returns false when
    /// nobody is subscribed.
    pub fn push(&self, obs: SleepObservation) -> bool {
        self.sender()
            .map(|tx| tx.send(Ok(obs)).is_ok())
            .unwrap_or(false)
    }

    /// Fails the live feed mid-stream.
    pub fn fail(&self, reason: &str) -> bool {
        self.sender()
            .map(|tx| {
                tx.send(Err(NapError::StreamUnavailable(reason.to_string())))
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

impl SampleSource for ChannelSource {
    fn subscribe(&self, window_start: DateTime<Utc>) -> Result<Subscription, NapError> {
        let mut guard = self
            .sender
            .lock()
            .map_err(|_| NapError::StreamUnavailable("source lock poisoned".to_string()))?;
        if guard.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(NapError::StreamUnavailable(
                "source already has a live subscriber".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        debug!("Channel source subscribed from {}", window_start);
        Ok(Subscription {
            initial: self.initial.clone(),
            updates: rx,
        })
    }

    fn unsubscribe(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }
}

/// Replays a recorded night as if it were happening now.
///
/// Everything is shifted so that `replay_from` lines up with the window start
/// given to `subscribe`. Observations ending at or before that point arrive in
/// the initial batch; the rest are delivered when their recorded end time is
/// reached, compressed by `speedup`. `unsubscribe` aborts the delivery task.
#[derive(Debug)]
pub struct ReplaySource {
    observations: Vec<SleepObservation>,
    replay_from: DateTime<Utc>,
    speedup: u32,
    task: Mutex<Option<AbortHandle>>,
}

impl ReplaySource {
    pub fn new(observations: Vec<SleepObservation>, replay_from: DateTime<Utc>) -> Self {
        Self {
            observations,
            replay_from,
            speedup: 1,
            task: Mutex::new(None),
        }
    }

    pub fn with_speedup(mut self, speedup: u32) -> Self {
        self.speedup = speedup.max(1);
        self
    }

    /// Splits the recording into the initial batch and the scheduled live
    /// deliveries, with times re-based onto `window_start`.
    fn plan(
        &self,
        window_start: DateTime<Utc>,
    ) -> (Vec<SleepObservation>, Vec<(Duration, SleepObservation)>) {
        let shift = window_start - self.replay_from;
        let mut initial = Vec::new();
        let mut scheduled = Vec::new();

        for obs in &self.observations {
            let rebased = SleepObservation::new(obs.stage, obs.start + shift, obs.end + shift);
            if obs.end <= self.replay_from {
                initial.push(rebased);
            } else {
                let offset = (obs.end - self.replay_from)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    / self.speedup;
                scheduled.push((offset, rebased));
            }
        }

        scheduled.sort_by_key(|(offset, _)| *offset);
        (initial, scheduled)
    }
}

impl SampleSource for ReplaySource {
    fn subscribe(&self, window_start: DateTime<Utc>) -> Result<Subscription, NapError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NapError::StreamUnavailable(e.to_string()))?;
        let (initial, scheduled) = self.plan(window_start);
        let (tx, rx) = mpsc::unbounded_channel();

        debug!(
            "Replaying {} historical and {} live observations",
            initial.len(),
            scheduled.len()
        );

        let handle = runtime.spawn(async move {
            let origin = tokio::time::Instant::now();
            for (offset, obs) in scheduled {
                tokio::time::sleep_until(origin + offset).await;
                trace!("Replay delivering {} ending {}", obs.stage, obs.end);
                if tx.send(Ok(obs)).is_err() {
                    debug!("Replay subscriber went away");
                    return;
                }
            }
        });

        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(handle.abort_handle()) {
                previous.abort();
            }
        }

        Ok(Subscription {
            initial,
            updates: rx,
        })
    }

    fn unsubscribe(&self) {
        if let Some(task) = self.task.lock().ok().and_then(|mut task| task.take()) {
            debug!("Stopping replay");
            task.abort();
        }
    }
}

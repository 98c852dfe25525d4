//! Progress projection – raw engine ratios to a smoothed display percentage.
//!
//! The projector is plain state: events are folded in with [`ProgressProjector::observe`]
//! and the displayed value is advanced by [`ProgressProjector::tick`] on a timer
//! owned by the consumer, so the refresh rate never depends on how often the
//! engine reports.

use crate::handle::EngineHandle;
use crate::lifecycle::EngineManager;
use crate::traits::{EngineEvent, SubscriberId};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Fraction of the remaining distance covered per smoothing tick.
pub const SMOOTHING_FACTOR: f64 = 0.15;

/// Smoothing stops once the display is this close to the target.
pub const SETTLE_EPSILON: f64 = 0.1;

/// Raw ratios above this count as "near completion" and clear the busy flag.
pub const BUSY_CEILING: f64 = 0.9;

/// Display target for a raw ratio: `[0, 1]` onto `[1, 99]`.
pub fn display_target(ratio: f64) -> f64 {
    1.0 + ratio * 98.0
}

/// Busy unless the ratio is a fresh reset (`0`) or near completion.
pub fn is_busy(ratio: f64) -> bool {
    !(ratio > BUSY_CEILING || ratio == 0.0)
}

fn sanitize(ratio: f64) -> f64 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressProjector {
    raw: f64,
    target: f64,
    display: u8,
    busy: bool,
    message: Option<String>,
    /// Set by `complete_load`; the next progress event starts a new bar.
    at_load_mark: bool,
}

impl ProgressProjector {
    pub fn raw(&self) -> f64 {
        self.raw
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn display(&self) -> u8 {
        self.display
    }

    pub fn busy(&self) -> bool {
        self.busy
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Fold one engine event in. Returns whether smoothing ticks are needed.
    pub fn observe(&mut self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::Log { message } => {
                self.message = Some(message.clone());
            }
            EngineEvent::Progress { progress } => {
                let ratio = sanitize(*progress);
                if self.at_load_mark || ratio == 0.0 {
                    // A new operation: the bar restarts from empty.
                    self.display = 0;
                    self.at_load_mark = false;
                }
                self.raw = ratio;
                self.target = display_target(ratio);
                self.busy = is_busy(ratio);
            }
        }
        self.needs_tick()
    }

    /// The display only climbs; a dip in the raw ratio holds it in place.
    pub fn needs_tick(&self) -> bool {
        !self.at_load_mark && self.target - f64::from(self.display) > SETTLE_EPSILON
    }

    /// Advance the display one smoothing step. Returns whether another tick
    /// is warranted.
    pub fn tick(&mut self) -> bool {
        if !self.needs_tick() {
            return false;
        }
        let current = f64::from(self.display);
        let stepped = to_percent(current + (self.target - current) * SMOOTHING_FACTOR);
        let next = if stepped != self.display {
            stepped
        } else {
            // Rounding stalled short of the target; land on it.
            to_percent(self.target)
        };
        if next == self.display {
            return false;
        }
        self.display = next;
        self.needs_tick()
    }

    /// Terminal "engine loaded" mark: the display jumps to 100 once.
    pub fn complete_load(&mut self) {
        self.display = 100;
        self.target = 100.0;
        self.busy = false;
        self.at_load_mark = true;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn to_percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

// ---------------------------------------------------------------------------
// Scoped subscription
// ---------------------------------------------------------------------------

/// Live projection of one engine's events into the manager's state.
///
/// Created by [`EngineManager::subscribe_progress`]. Dropping it (or calling
/// [`ProgressSubscription::detach`]) removes exactly the listener it added
/// and stops its smoothing timer.
pub struct ProgressSubscription {
    handle: EngineHandle,
    subscriber: Option<SubscriberId>,
    task: Option<JoinHandle<()>>,
}

impl ProgressSubscription {
    pub(crate) fn start(
        manager: EngineManager,
        handle: EngineHandle,
        generation: u64,
        tick_interval: Duration,
    ) -> Self {
        let (subscriber, mut rx) = handle.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut smoothing = false;
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            smoothing = manager.apply_event(generation, &event);
                        }
                        None => break,
                    },
                    _ = ticker.tick(), if smoothing => {
                        smoothing = manager.smoothing_tick(generation);
                    }
                }
            }
            tracing::debug!(generation, "progress subscription finished");
        });
        Self {
            handle,
            subscriber: Some(subscriber),
            task: Some(task),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscriber.is_some()
    }

    /// Detach from the engine. Safe to call more than once.
    pub fn detach(&mut self) {
        if let Some(id) = self.subscriber.take() {
            self.handle.unsubscribe(id);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

//! Shared audio timeline.
//!
//! Every scheduling decision is expressed in seconds on this clock. It starts
//! at zero, only moves forward, and stands still while suspended, so pausing
//! freezes both audio rendering and pending "block starts now" updates.

use crate::lock::PoisonlessLock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Instants closer than this count as reached. Start instants are sums of
/// floats and can sit a fraction of a nanosecond past a representable time.
const REACHED_EPSILON: f64 = 1e-6;

#[derive(Debug)]
struct ClockState {
    suspended_at: Option<Instant>,
    paused_total: Duration,
}

#[derive(Clone)]
pub struct AudioClock {
    origin: Instant,
    state: Arc<Mutex<ClockState>>,
    suspended: Arc<watch::Sender<bool>>,
}

impl Default for AudioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock {
    pub fn new() -> Self {
        let (suspended, _rx) = watch::channel(false);
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(ClockState {
                suspended_at: None,
                paused_total: Duration::ZERO,
            })),
            suspended: Arc::new(suspended),
        }
    }

    /// Current position on the timeline, in seconds.
    pub fn now(&self) -> f64 {
        let state = self.state.plock();
        let at = state.suspended_at.unwrap_or_else(Instant::now);
        at.saturating_duration_since(self.origin)
            .saturating_sub(state.paused_total)
            .as_secs_f64()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.plock().suspended_at.is_some()
    }

    /// Freezes the timeline. Returns false if it was already suspended.
    pub fn suspend(&self) -> bool {
        let mut state = self.state.plock();
        if state.suspended_at.is_some() {
            return false;
        }
        state.suspended_at = Some(Instant::now());
        self.suspended.send_replace(true);
        true
    }

    /// Lets the timeline run again. Returns false if it was not suspended.
    pub fn resume(&self) -> bool {
        let mut state = self.state.plock();
        let Some(suspended_at) = state.suspended_at.take() else {
            return false;
        };
        state.paused_total += Instant::now().saturating_duration_since(suspended_at);
        self.suspended.send_replace(false);
        true
    }

    /// Waits until the timeline reaches `at` seconds. Time spent suspended
    /// does not count.
    pub async fn sleep_until(&self, at: f64) {
        let mut suspended = self.suspended.subscribe();

        loop {
            if *suspended.borrow_and_update() {
                if suspended.changed().await.is_err() {
                    return;
                }
                continue;
            }

            let remaining = at - self.now();
            if remaining <= REACHED_EPSILON {
                return;
            }
            let wait = Duration::from_nanos((remaining * 1e9).ceil() as u64);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = suspended.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

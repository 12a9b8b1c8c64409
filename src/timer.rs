//! Timer Wheel (§4.4): scheduled one-shot callouts with reset
//! semantics, expiry drained once per loop iteration by the main loop
//! rather than fired from a signal or a separate thread — the whole
//! engine runs on one thread (§5).

use std::time::{Duration, Instant};

/// A single one-shot timer. `reset` (re)arms it for `duration` from
/// now; `is_pending`/`time_remaining`/`stop` are side-effect-free on the
/// schedule except as named.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    pub fn reset(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }
}

/// Opaque id identifying a live Case File for the timer wheel, so that
/// an expiry can be posted as a `{CaseId, GraceExpired}` message and
/// resolved back to a borrow by the loop rather than the timer holding
/// a back-reference into the Case File (see SPEC_FULL §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaseId(pub crate::types::Guid, pub crate::types::Guid);

/// The set of timers the engine is tracking, keyed by the case they
/// belong to. `expire_due()` is called once per loop iteration and
/// returns the ids whose grace period has elapsed; the loop resolves
/// each id to its Case File and dispatches `on_grace_expired`.
#[derive(Debug, Default)]
pub struct TimerWheel {
    timers: std::collections::HashMap<CaseId, Timer>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: CaseId) -> Timer {
        self.timers.get(&id).copied().unwrap_or_default()
    }

    pub fn reset(&mut self, id: CaseId, duration: Duration) {
        self.timers.entry(id).or_insert_with(Timer::new).reset(duration);
    }

    pub fn stop(&mut self, id: CaseId) {
        if let Some(t) = self.timers.get_mut(&id) {
            t.stop();
        }
        self.timers.remove(&id);
    }

    pub fn is_pending(&self, id: CaseId) -> bool {
        self.timers.get(&id).map(Timer::is_pending).unwrap_or(false)
    }

    /// Drain and return the ids whose timer has expired.
    pub fn expire_due(&mut self) -> Vec<CaseId> {
        let now = Instant::now();
        let due: Vec<CaseId> = self
            .timers
            .iter()
            .filter(|(_, t)| t.is_due(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.timers.remove(id);
        }
        due
    }

    /// Earliest deadline across all pending timers, used to size the
    /// `poll()` timeout in the main loop.
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .values()
            .filter_map(|t| t.deadline)
            .map(|d| d.saturating_duration_since(now))
            .min()
    }
}

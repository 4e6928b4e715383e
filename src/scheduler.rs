//! Reconcile scheduling: rate-control state and the action predicate
//!
//! Each active plugin carries an [`ActionState`] record. Plugins latch the
//! `action_required` flag from their watch callbacks; the scheduler decides
//! when the latched flag actually turns into a `do_action` call by pushing
//! it through three gates:
//!
//! - the back-off gate damps retries after a failed action,
//! - the settle gate coalesces event storms by waiting for quiet,
//! - the throttle gate rate-limits successful invocations.
//!
//! All gates compare wall-clock durations with strict inequality.

use tokio::time::{Duration, Instant};

/// Rate-control bookkeeping for one active plugin.
#[derive(Debug, Clone)]
pub struct ActionState {
    pub(crate) action_required: bool,
    pub(crate) action_required_time: Option<Instant>,
    pub(crate) last_action_attempt_time: Option<Instant>,
    pub(crate) last_action_success_time: Option<Instant>,
    pub(crate) last_action_fail_time: Option<Instant>,
    pub(crate) last_action_success: bool,
}

impl ActionState {
    /// Fresh state: nothing latched, no attempts, last action counted as
    /// successful so the back-off gate stays open.
    pub fn new() -> Self {
        Self {
            action_required: false,
            action_required_time: None,
            last_action_attempt_time: None,
            last_action_success_time: None,
            last_action_fail_time: None,
            last_action_success: true,
        }
    }

    /// Whether an action is currently latched
    pub fn action_required(&self) -> bool {
        self.action_required
    }

    /// Instant of the latest false→true latch transition
    pub fn action_required_time(&self) -> Option<Instant> {
        self.action_required_time
    }

    /// Instant of the latest `do_action` attempt
    pub fn last_action_attempt_time(&self) -> Option<Instant> {
        self.last_action_attempt_time
    }

    /// Instant of the latest successful `do_action`
    pub fn last_action_success_time(&self) -> Option<Instant> {
        self.last_action_success_time
    }

    /// Instant of the latest failed `do_action`
    pub fn last_action_fail_time(&self) -> Option<Instant> {
        self.last_action_fail_time
    }

    /// Whether the latest attempt succeeded (true before any attempt)
    pub fn last_action_success(&self) -> bool {
        self.last_action_success
    }

    /// Latch the action flag.
    ///
    /// The edge timestamp is recorded only on the false→true transition;
    /// marking an already-latched state changes nothing.
    pub(crate) fn mark_required(&mut self, now: Instant) {
        if !self.action_required {
            self.action_required = true;
            self.action_required_time = Some(now);
        }
    }

    /// Start an attempt: stamp the attempt time and release the latch.
    ///
    /// Releasing before the action runs lets `mark_action_required` inside
    /// `do_action` register a fresh edge that survives a successful action.
    pub(crate) fn begin_attempt(&mut self, now: Instant) {
        self.last_action_attempt_time = Some(now);
        self.action_required = false;
    }

    /// Record a successful attempt started at `attempt`.
    ///
    /// The edge timestamp is deliberately left alone: settle is measured
    /// from the first rising edge, and only a new false→true transition
    /// moves it.
    pub(crate) fn record_success(&mut self, attempt: Instant) {
        self.last_action_success = true;
        self.last_action_success_time = Some(attempt);
    }

    /// Record a failed attempt started at `attempt`: the latch is restored
    /// without touching the edge timestamp, and the back-off gate arms.
    pub(crate) fn record_failure(&mut self, attempt: Instant) {
        self.last_action_success = false;
        self.action_required = true;
        self.last_action_fail_time = Some(attempt);
    }
}

impl Default for ActionState {
    fn default() -> Self {
        Self::new()
    }
}

/// The reconcile predicate: whether `do_action` may run now.
///
/// Zero `settle` or `throttle` disables that gate.
pub(crate) fn ready_for_action(
    state: &ActionState,
    settle: Duration,
    throttle: Duration,
    failed_wait: Duration,
    now: Instant,
) -> bool {
    if !state.action_required {
        return false;
    }

    if !state.last_action_success {
        match state.last_action_attempt_time {
            Some(attempt) if now.duration_since(attempt) > failed_wait => {}
            _ => return false,
        }
    }

    if !settle.is_zero() {
        if let Some(edge) = state.action_required_time {
            if now.duration_since(edge) <= settle {
                return false;
            }
        }
    }

    if !throttle.is_zero() {
        if let Some(attempt) = state.last_action_attempt_time {
            if now.duration_since(attempt) <= throttle {
                return false;
            }
        }
    }

    true
}

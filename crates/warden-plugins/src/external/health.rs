//! Health tracking for external plugin servers.
//!
//! State machine: Unknown → Healthy ⇄ Unhealthy
//! - Unknown is optimistic: calls are attempted before the first probe
//! - Consecutive failures (probe failures, timeouts, protocol errors)
//!   reaching the threshold move the plugin to Unhealthy
//! - A successful probe brings an Unhealthy plugin back
//! - With a retry cooldown (probing disabled), one trial call is let through
//!   per cooldown; its success brings the plugin back, its failure restarts
//!   the cooldown

use std::time::{Duration, Instant};

use warden_types::outcome::{HealthMetrics, HealthState};

/// Failure-streak tracker for one external plugin.
///
/// Requires `&mut self`; the proxy wraps it in a `std::sync::Mutex`.
pub struct HealthTracker {
    threshold: u32,
    /// Cooldown before a trial call while Unhealthy; `None` waits for a probe.
    retry_after: Option<Duration>,
    current_state: HealthState,
    consecutive_failures: u32,
    /// When the current state was entered.
    state_entered_at: Instant,
    total_successes: u64,
    total_failures: u64,
    unhealthy_transitions: u64,
}

impl HealthTracker {
    /// `threshold` is clamped to at least 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            retry_after: None,
            current_state: HealthState::Unknown,
            consecutive_failures: 0,
            state_entered_at: Instant::now(),
            total_successes: 0,
            total_failures: 0,
            unhealthy_transitions: 0,
        }
    }

    /// Let a trial call through once `cooldown` has passed in Unhealthy.
    pub fn with_retry_after(mut self, cooldown: Duration) -> Self {
        self.retry_after = Some(cooldown);
        self
    }

    pub fn state(&self) -> HealthState {
        self.current_state
    }

    /// Whether hook calls may be sent to the plugin.
    pub fn allows_calls(&self) -> bool {
        self.current_state != HealthState::Unhealthy || self.retry_due()
    }

    /// Claim a call slot. While Unhealthy this takes the one trial of the
    /// current cooldown, so concurrent callers wait for the next one.
    pub fn try_begin_call(&mut self) -> bool {
        match self.current_state {
            HealthState::Unhealthy if self.retry_due() => {
                self.state_entered_at = Instant::now();
                true
            }
            HealthState::Unhealthy => false,
            HealthState::Unknown | HealthState::Healthy => true,
        }
    }

    /// Get a snapshot of current metrics.
    pub fn metrics(&self) -> HealthMetrics {
        HealthMetrics {
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            consecutive_failures: self.consecutive_failures,
            time_in_current_state_ms: self.state_entered_at.elapsed().as_millis() as u64,
            unhealthy_transitions: self.unhealthy_transitions,
            current_state: self.current_state,
        }
    }

    /// A liveness probe succeeded. Returns the new state if it changed.
    pub fn record_probe_success(&mut self) -> Option<HealthState> {
        self.total_successes += 1;
        self.consecutive_failures = 0;
        self.transition_to(HealthState::Healthy)
    }

    /// A hook call completed. Resets the failure streak. Lifts Unhealthy only
    /// when trial calls are enabled; otherwise that is left to a probe.
    pub fn record_call_success(&mut self) -> Option<HealthState> {
        self.total_successes += 1;
        self.consecutive_failures = 0;
        match self.current_state {
            HealthState::Unknown => self.transition_to(HealthState::Healthy),
            HealthState::Unhealthy if self.retry_after.is_some() => {
                self.transition_to(HealthState::Healthy)
            }
            HealthState::Healthy | HealthState::Unhealthy => None,
        }
    }

    /// A probe or call failed. Returns the new state if it changed.
    pub fn record_failure(&mut self) -> Option<HealthState> {
        self.total_failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.current_state == HealthState::Unhealthy {
            // A failed trial restarts the cooldown.
            self.state_entered_at = Instant::now();
            return None;
        }
        if self.consecutive_failures >= self.threshold {
            self.unhealthy_transitions += 1;
            return self.transition_to(HealthState::Unhealthy);
        }
        None
    }

    fn retry_due(&self) -> bool {
        self.retry_after
            .is_some_and(|cooldown| self.state_entered_at.elapsed() >= cooldown)
    }

    fn transition_to(&mut self, new_state: HealthState) -> Option<HealthState> {
        if self.current_state == new_state {
            return None;
        }
        self.current_state = new_state;
        self.state_entered_at = Instant::now();
        Some(new_state)
    }
}

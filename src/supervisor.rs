//! Reconnect supervision.
//!
//! Every push-channel problem is routed here. The supervisor decides between
//! scheduling a re-subscription and demoting the session to polling:
//!
//! ```text
//!   problem ──→ timer pending? ──yes──→ AlreadyInFlight
//!                    │ no
//!                    ▼
//!              attempts < max? ──no───→ Exhausted (start polling)
//!                    │ yes
//!                    ▼
//!              Scheduled { attempt, delay = min(base · 2^(attempt-1), max) }
//! ```
//!
//! With the default configuration the delays are 1s, 2s, 4s, 8s, 16s and a
//! sixth attempt is never scheduled. Once exhausted, push is only retried
//! after an explicit [`reset`](ReconnectSupervisor::reset) from the
//! lifecycle path.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::TrackerConfig;

/// Which path is currently driving updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// No job tracked, or the tracked job finished.
    #[default]
    Idle,
    /// A push subscription is open or opening.
    Push,
    /// A re-subscription is scheduled.
    Reconnecting,
    /// The polling fallback is running.
    Polling,
}

/// Outcome of reporting a channel problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Re-subscribe after `delay`. `ticket` identifies the timer.
    Scheduled {
        attempt: u32,
        delay: Duration,
        ticket: u64,
    },
    /// A reconnect is already pending; nothing new was scheduled.
    AlreadyInFlight,
    /// The retry budget is spent. Switch to polling.
    Exhausted,
}

struct PendingReconnect {
    ticket: u64,
    timer: Option<JoinHandle<()>>,
}

/// Counts attempts and owns the pending reconnect timer.
pub struct ReconnectSupervisor {
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    pending: Option<PendingReconnect>,
    next_ticket: u64,
}

impl ReconnectSupervisor {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            attempts: 0,
            max_attempts: config.max_reconnect_attempts,
            base_delay: config.base_reconnect_delay(),
            max_delay: config.max_reconnect_delay(),
            pending: None,
            next_ticket: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Delay before the given 1-based attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A `channel_error` or `timed_out` was reported.
    pub fn on_channel_problem(&mut self) -> ReconnectDecision {
        if self.pending.is_some() {
            return ReconnectDecision::AlreadyInFlight;
        }
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }

        self.attempts += 1;
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.pending = Some(PendingReconnect {
            ticket,
            timer: None,
        });
        ReconnectDecision::Scheduled {
            attempt: self.attempts,
            delay: self.backoff_delay(self.attempts),
            ticket,
        }
    }

    /// Attach the timer task for a scheduled ticket.
    ///
    /// A timer for a ticket that is no longer pending is aborted.
    pub fn arm(&mut self, ticket: u64, timer: JoinHandle<()>) {
        match &mut self.pending {
            Some(pending) if pending.ticket == ticket => pending.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Claim a fired timer. Returns `false` for superseded tickets.
    pub fn take_due(&mut self, ticket: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.ticket == ticket => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// The channel confirmed a subscription.
    ///
    /// A reconnect still pending for an earlier problem is dropped.
    pub fn on_subscribed(&mut self) {
        self.cancel_pending();
        self.attempts = 0;
    }

    /// Abort the pending timer, if any.
    pub fn cancel_pending(&mut self) {
        if let Some(timer) = self.pending.take().and_then(|p| p.timer) {
            timer.abort();
        }
    }

    /// Cancel the pending timer and restore the full retry budget.
    pub fn reset(&mut self) {
        self.cancel_pending();
        self.attempts = 0;
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

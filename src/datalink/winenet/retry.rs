//! Acknowledged-exchange retry control.
//!
//! Each exchange is sent, then waits up to the ack timeout. On timeout a
//! retransmission is scheduled after a random back-off; after the configured
//! number of attempts the exchange fails.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::core::PeerId;
use crate::transceiver::TransceiverPacket;

/// Retry timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first send included.
    pub max_attempts: u32,
    /// Wait for an acknowledgment per attempt.
    pub ack_timeout: Duration,
    /// Back-off lower bound.
    pub min_backoff: Duration,
    /// Back-off upper bound.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Draw a back-off uniformly between the bounds.
    pub fn backoff<R: Rng>(&self, rng: &mut R) -> Duration {
        let min = self.min_backoff.as_micros() as u64;
        let max = (self.max_backoff.as_micros() as u64).max(min);
        Duration::from_micros(rng.gen_range(min..=max))
    }

    /// Longest time one exchange can take before failing.
    pub fn worst_case(&self) -> Duration {
        self.ack_timeout * self.max_attempts
            + self.max_backoff * self.max_attempts.saturating_sub(1)
    }
}

/// What a timer expiry means for an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// Not due yet.
    Idle,
    /// Back-off elapsed: send `packets` again.
    Resend,
    /// Ack timeout elapsed, back-off scheduled.
    BackingOff,
    /// Attempts exhausted.
    Failed,
}

/// One exchange waiting for an acknowledgment from `peer`.
#[derive(Debug, Clone)]
pub struct AckWait {
    /// Peer expected to acknowledge.
    pub peer: PeerId,
    /// Sequence the acknowledgment must carry.
    pub expect: u32,
    /// What to send on each attempt.
    pub packets: Vec<TransceiverPacket>,
    attempts: u32,
    deadline: Instant,
    resend_at: Option<Instant>,
}

impl AckWait {
    /// Start an exchange; the caller sends `packets` right away.
    pub fn start(
        peer: PeerId,
        expect: u32,
        packets: Vec<TransceiverPacket>,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            expect,
            packets,
            attempts: 1,
            deadline: now + policy.ack_timeout,
            resend_at: None,
        }
    }

    /// Whether an acknowledgment from `from` for `acked` closes this exchange.
    pub fn matches(&self, from: PeerId, acked: u32) -> bool {
        self.peer == from && self.expect == acked
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next instant this exchange needs attention.
    pub fn next_deadline(&self) -> Instant {
        self.resend_at.unwrap_or(self.deadline)
    }

    /// Advance timers to `now`.
    pub fn poll<R: Rng>(&mut self, policy: &RetryPolicy, rng: &mut R, now: Instant) -> RetryEvent {
        if let Some(at) = self.resend_at {
            if now < at {
                return RetryEvent::Idle;
            }
            self.resend_at = None;
            self.attempts += 1;
            self.deadline = now + policy.ack_timeout;
            return RetryEvent::Resend;
        }

        if now < self.deadline {
            return RetryEvent::Idle;
        }
        if self.attempts >= policy.max_attempts {
            return RetryEvent::Failed;
        }
        self.resend_at = Some(now + policy.backoff(rng));
        RetryEvent::BackingOff
    }
}

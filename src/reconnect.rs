//! Reconnection controller
//!
//! Owns the silent-attempt counter, the backoff formula and the single
//! pending reconnect timer. The counter and the armed token live in
//! [`ReconnectController`], which is plain data carried inside the session
//! state so the reducer stays pure. [`ReconnectTimer`] is the side that
//! actually sleeps.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the random delay added to every scheduled retry.
    pub jitter: Duration,
    /// Failures allowed before the session escalates to a visible error.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(600),
            cap: Duration::from_secs(15),
            jitter: Duration::from_millis(250),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// `min(cap, base * 2^attempt)`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// A random extra delay in `0..=jitter`.
    pub fn sample_jitter(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

/// Outcome of reporting one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Retry silently after `delay`. `attempt` is the failure count so far.
    Retry { attempt: u32, delay: Duration },
    /// The ceiling was reached.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    attempts: u32,
    pending: Option<u64>,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            pending: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Count a failure and decide what happens next.
    ///
    /// The failure that brings the counter to the ceiling escalates.
    pub fn on_failure(&mut self) -> ReconnectDecision {
        let attempt = self.attempts;
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            ReconnectDecision::Exhausted {
                attempts: self.attempts,
            }
        } else {
            ReconnectDecision::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(attempt),
            }
        }
    }

    /// Arm the timer. No-op (returns false) if one is already pending.
    pub fn arm(&mut self, token: u64) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(token);
        true
    }

    /// Consume the pending timer if `token` is the one armed.
    pub fn fire(&mut self, token: u64) -> bool {
        if self.pending == Some(token) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// A transport opened: the counter starts over and any timer is dropped.
    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.pending = None;
    }

    pub fn reset(&mut self) {
        self.on_open();
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

/// The one sleeping reconnect task. Scheduling replaces, cancel aborts.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    handle: Option<JoinHandle<()>>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` on `tx` after `delay`.
    pub fn schedule<E: Send + 'static>(&mut self, delay: Duration, event: E, tx: mpsc::Sender<E>) {
        self.cancel();
        log::debug!("Reconnect timer armed for {:?}", delay);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event).await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

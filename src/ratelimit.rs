//! Token bucket guarding calls to the shared inference backend.
//!
//! Tokens refill lazily on every attempt from a monotonic clock; there is no
//! background refill task. Waiters poll with a short interval and never hold
//! the state mutex while sleeping.
//!
//! Under contention, waiters are served in `(priority rank, arrival)` order:
//! only the head of the queue may consume, so a steady stream of cheap
//! low-priority callers cannot starve a security pass, and callers of equal
//! rank are served first-come first-served.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use wfc_common::{ReviewerRole, ValidationError};

use crate::errors::{Result, ReviewError};

/// Upper bound on any single wait, whatever the caller asked for.
pub const MAX_WAIT: Duration = Duration::from_secs(300);

/// Interval between refill attempts while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Rank used by callers that are not tied to a reviewer role.
pub const DEFAULT_PRIORITY_RANK: u8 = u8::MAX;

/// Point-in-time view for `GET /resources/rate-limit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub capacity: u32,
    pub refill_rate: f64,
    pub available_tokens: f64,
}

/// Position in the wait queue: lower rank first, then earlier arrival.
type Ticket = (u8, u64);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    waiters: BTreeSet<Ticket>,
    next_seq: u64,
}

#[derive(Debug)]
struct Inner {
    capacity: f64,
    refill_rate: f64,
    poll_interval: Duration,
    state: Mutex<BucketState>,
}

/// Rate limiter shared by every job in the process. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    inner: Arc<Inner>,
}

/// Removes a waiter's ticket however the acquiring future ends, including
/// when it is dropped mid-wait.
struct TicketGuard<'a> {
    bucket: &'a TokenBucket,
    ticket: Ticket,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.bucket.state().waiters.remove(&self.ticket);
    }
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::with_poll_interval(capacity, refill_rate, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(capacity: u32, refill_rate: f64, poll_interval: Duration) -> Self {
        let capacity = f64::from(capacity);
        Self {
            inner: Arc::new(Inner {
                capacity,
                refill_rate: refill_rate.max(0.0),
                poll_interval,
                state: Mutex::new(BucketState {
                    tokens: capacity,
                    last_refill: Instant::now(),
                    waiters: BTreeSet::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity as u32
    }

    pub fn refill_rate(&self) -> f64 {
        self.inner.refill_rate
    }

    // The state is plain arithmetic that is never left half-updated, so a
    // panic elsewhere while the lock was held cannot corrupt it.
    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.inner.refill_rate).min(self.inner.capacity);
        state.last_refill = now;
    }

    /// Clamp a requested wait to [`MAX_WAIT`]; `None` means "as long as allowed".
    pub fn effective_timeout(timeout: Option<Duration>) -> Duration {
        timeout.map_or(MAX_WAIT, |t| t.min(MAX_WAIT))
    }

    /// Consume `n` tokens without waiting. Returns whether they were taken.
    ///
    /// Never jumps the queue: if anyone is waiting, this fails.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut state = self.state();
        self.refill(&mut state, Instant::now());
        if state.waiters.is_empty() && state.tokens >= f64::from(n) {
            state.tokens -= f64::from(n);
            true
        } else {
            false
        }
    }

    /// Consume `n` tokens at default priority, waiting up to `timeout`.
    pub async fn acquire(&self, n: u32, timeout: Option<Duration>) -> Result<()> {
        self.acquire_with_rank(n, timeout, DEFAULT_PRIORITY_RANK).await
    }

    /// Consume `n` tokens on behalf of a reviewer pass.
    pub async fn acquire_for_role(
        &self,
        role: ReviewerRole,
        n: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.acquire_with_rank(n, timeout, role.priority_rank()).await
    }

    /// Consume `n` tokens, queueing behind strictly higher-priority waiters.
    pub async fn acquire_with_rank(
        &self,
        n: u32,
        timeout: Option<Duration>,
        rank: u8,
    ) -> Result<()> {
        let needed = f64::from(n);
        if needed > self.inner.capacity {
            return Err(ValidationError::Invalid {
                field: "tokens",
                message: format!(
                    "requested {} exceeds bucket capacity {}",
                    n, self.inner.capacity
                ),
            }
            .into());
        }

        let wait = Self::effective_timeout(timeout);
        let started = Instant::now();
        let deadline = started + wait;

        let guard = {
            let mut state = self.state();
            let ticket = (rank, state.next_seq);
            state.next_seq += 1;
            state.waiters.insert(ticket);
            TicketGuard {
                bucket: self,
                ticket,
            }
        };

        loop {
            let now = Instant::now();
            {
                let mut state = self.state();
                self.refill(&mut state, now);
                let at_head = state.waiters.first() == Some(&guard.ticket);
                if at_head && state.tokens >= needed {
                    state.tokens -= needed;
                    return Ok(());
                }
            }

            if now >= deadline {
                tracing::debug!(
                    requested = n,
                    rank,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Rate limit wait timed out"
                );
                return Err(ReviewError::RateLimitExceeded {
                    requested: n,
                    waited: started.elapsed(),
                });
            }

            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(self.inner.poll_interval.min(remaining)).await;
        }
    }

    /// Return reserved tokens that were never spent. Never exceeds capacity.
    pub fn refund(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut state = self.state();
        self.refill(&mut state, Instant::now());
        state.tokens = (state.tokens + f64::from(n)).min(self.inner.capacity);
    }

    /// Tokens available right now, after a lazy refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn waiting(&self) -> usize {
        self.state().waiters.len()
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            capacity: self.capacity(),
            refill_rate: self.refill_rate(),
            available_tokens: self.available(),
        }
    }
}

//! Hierarchical token bucket implementation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::trace;

use crate::config::BucketOptions;
use crate::error::{Result, TollgateError};

/// Floor for retry sleeps so a starved consumer never busy-loops.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// A full set of bucket rate parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Maximum tokens the bucket holds.
    pub capacity: f64,
    /// Tokens added per refill cycle.
    pub tokens_per_interval: f64,
    /// Refill cycle length.
    pub interval: Duration,
}

#[derive(Debug)]
struct BucketState {
    params: BucketParams,
    /// Current token count, `0 <= content <= params.capacity`.
    content: f64,
    last_refill: Instant,
}

/// A token bucket that may draw from a parent bucket's capacity in addition
/// to its own.
///
/// Buckets start empty and accrue tokens continuously at
/// `tokens_per_interval / interval`. Consuming `n` tokens succeeds only when
/// this bucket and every ancestor can supply `n` at once; a successful
/// consume debits the whole chain, a failed one debits nothing.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    parent: Option<Arc<TokenBucket>>,
}

impl TokenBucket {
    /// Create a root bucket.
    pub fn new(params: BucketParams) -> Self {
        Self {
            state: Mutex::new(BucketState {
                params,
                content: 0.0,
                last_refill: Instant::now(),
            }),
            parent: None,
        }
    }

    /// Create a bucket that also draws from `parent` on every admission.
    pub fn with_parent(params: BucketParams, parent: Arc<TokenBucket>) -> Self {
        Self {
            state: Mutex::new(BucketState {
                params,
                content: 0.0,
                last_refill: Instant::now(),
            }),
            parent: Some(parent),
        }
    }

    /// The parent bucket, if any.
    pub fn parent(&self) -> Option<&Arc<TokenBucket>> {
        self.parent.as_ref()
    }

    /// Current rate parameters.
    pub fn params(&self) -> BucketParams {
        self.state.lock().params
    }

    /// Current token count, brought up to date first.
    pub fn content(&self) -> f64 {
        let mut state = self.state.lock();
        Self::refill(&mut state, Instant::now());
        state.content
    }

    /// Try to consume `n` tokens from this bucket and every ancestor without
    /// waiting.
    ///
    /// Returns `Ok(false)` when any bucket in the chain cannot currently
    /// supply `n`; nothing is debited in that case. `n` that is non-positive,
    /// non-finite, or larger than any chain member's capacity can never be
    /// satisfied and is a configuration error.
    pub fn try_consume(&self, n: f64) -> Result<bool> {
        if !n.is_finite() || n <= 0.0 {
            return Err(TollgateError::InvalidTokenRequest {
                requested: n,
                capacity: self.params().capacity,
            });
        }

        let ancestors = self.ancestors();
        let now = Instant::now();

        // The whole chain is locked leaf-to-root so the debit is atomic.
        // Every consumer traverses in the same direction, so the lock order
        // is consistent across tasks.
        let mut guards: Vec<MutexGuard<'_, BucketState>> =
            Vec::with_capacity(1 + ancestors.len());
        guards.push(self.state.lock());
        for ancestor in &ancestors {
            guards.push(ancestor.state.lock());
        }

        for guard in guards.iter_mut() {
            if n > guard.params.capacity {
                return Err(TollgateError::InvalidTokenRequest {
                    requested: n,
                    capacity: guard.params.capacity,
                });
            }
            Self::refill(guard, now);
        }

        if guards.iter().any(|guard| guard.content < n) {
            return Ok(false);
        }

        for guard in guards.iter_mut() {
            guard.content -= n;
        }
        Ok(true)
    }

    /// Consume `n` tokens, suspending the calling task until the whole chain
    /// can supply them.
    ///
    /// The wait is a timer-driven retry loop: each round estimates how long
    /// the most constrained bucket needs to accrue the deficit and sleeps at
    /// most one refill interval, so a reconfiguration (slow-start step, for
    /// instance) is picked up on the next round.
    pub async fn consume(&self, n: f64) -> Result<()> {
        loop {
            if self.try_consume(n)? {
                return Ok(());
            }
            let delay = self.retry_delay(n);
            trace!(tokens = n, delay_ms = delay.as_millis() as u64, "Waiting for tokens");
            tokio::time::sleep(delay).await;
        }
    }

    /// Rewrite rate parameters in place.
    ///
    /// Fields absent from `options` keep their current values. Tokens accrued
    /// under the old schedule are preserved: content is brought current under
    /// the old parameters first, then clamped to the new capacity.
    pub fn set_params(&self, options: &BucketOptions) {
        let mut state = self.state.lock();
        Self::refill(&mut state, Instant::now());
        state.params = options.merged_over(state.params);
        state.content = state.content.min(state.params.capacity);
    }

    /// Nudge capacity and refill rate by the given deltas (one slow-start
    /// step). Parameters never go below zero; content is clamped to the new
    /// capacity.
    pub(crate) fn nudge(&self, delta_capacity: f64, delta_rate: f64) {
        let mut state = self.state.lock();
        Self::refill(&mut state, Instant::now());
        state.params.capacity = (state.params.capacity + delta_capacity).max(0.0);
        state.params.tokens_per_interval =
            (state.params.tokens_per_interval + delta_rate).max(0.0);
        state.content = state.content.min(state.params.capacity);
    }

    /// Overwrite all rate parameters with exact values.
    pub(crate) fn force_params(&self, params: BucketParams) {
        let mut state = self.state.lock();
        Self::refill(&mut state, Instant::now());
        state.params = params;
        state.content = state.content.min(params.capacity);
    }

    /// Accrue tokens for the time elapsed since the last refill.
    fn refill(state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let params = state.params;
        if params.tokens_per_interval > 0.0 && !params.interval.is_zero() {
            let drip =
                elapsed.as_secs_f64() * params.tokens_per_interval / params.interval.as_secs_f64();
            state.content = (state.content + drip).min(params.capacity);
        }
        state.last_refill = now;
    }

    /// Estimate how long until the most constrained bucket in the chain can
    /// supply `n`, capped at one refill interval per bucket.
    fn retry_delay(&self, n: f64) -> Duration {
        let now = Instant::now();
        let mut delay = MIN_RETRY_DELAY;

        let chain = std::iter::once(self).chain(self.ancestors_iter().map(|bucket| bucket.as_ref()));
        for bucket in chain {
            let mut state = bucket.state.lock();
            Self::refill(&mut state, now);
            let params = state.params;

            let suggestion = if params.tokens_per_interval > 0.0 {
                let deficit = (n - state.content).max(0.0);
                params
                    .interval
                    .mul_f64(deficit / params.tokens_per_interval)
                    .min(params.interval)
            } else {
                // No drip at all: poll once per interval in case the bucket
                // is reconfigured while we wait.
                params.interval
            };

            delay = delay.max(suggestion);
        }

        delay
    }

    fn ancestors(&self) -> Vec<Arc<TokenBucket>> {
        self.ancestors_iter().cloned().collect()
    }

    fn ancestors_iter(&self) -> impl Iterator<Item = &Arc<TokenBucket>> {
        std::iter::successors(self.parent.as_ref(), |bucket| bucket.parent.as_ref())
    }
}

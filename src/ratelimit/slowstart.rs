//! Slow-start transitions.
//!
//! A transition snapshots the buckets it touches, installs the caller's
//! reduced parameters immediately, then ramps each bucket back to its
//! snapshot linearly over `transition_time / interval` timed steps. Ramping
//! both capacity and refill rate avoids the burst of admissions an abrupt
//! reconfiguration would cause the moment starved callers unblock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{BucketOptions, SlowStartOptions};
use crate::error::{Result, TollgateError};
use crate::request::Selector;

use super::bucket::{BucketParams, TokenBucket};
use super::limiter::RateLimiter;

/// How per-step deltas are derived from a tracked bucket's snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// `capacity` and `tokens_per_interval` each interpolate linearly from
    /// the reduced value back to the snapshot.
    #[default]
    Independent,
    /// Both fields move by the capacity delta each step. Compatibility mode
    /// for deployments tuned against the older unified-step behavior.
    Lockstep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
}

/// Tracks whether a transition is running. One per limiter; at most one
/// transition may run at a time.
#[derive(Debug)]
pub(crate) struct SlowStartController {
    phase: Mutex<Phase>,
}

impl SlowStartController {
    pub(crate) fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
        }
    }

    fn begin(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase == Phase::Running {
            return Err(TollgateError::SlowStartActive);
        }
        *phase = Phase::Running;
        Ok(())
    }

    fn finish(&self) {
        *self.phase.lock() = Phase::Idle;
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.phase.lock() == Phase::Running
    }
}

/// One bucket participating in a transition.
#[derive(Debug)]
struct TrackedBucket {
    label: Selector,
    bucket: Arc<TokenBucket>,
    /// The bucket's parameters before the reduction was installed.
    snapshot: BucketParams,
    delta_capacity: f64,
    delta_rate: f64,
}

/// Handle to a running transition.
#[derive(Debug)]
pub struct SlowStart {
    task: JoinHandle<()>,
    controller: Arc<SlowStartController>,
}

impl SlowStart {
    /// Wait until the transition completes (or is stopped).
    pub async fn wait(self) {
        let _ = self.task.await;
    }

    /// Cancel the transition. Buckets stay wherever the last applied step
    /// put them; the controller becomes idle so a new transition may start.
    pub fn stop(&self) {
        self.task.abort();
        self.controller.finish();
        info!("Slow-start transition stopped");
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }
}

/// Plan and launch a transition for `limiter`.
pub(crate) fn begin_transition(
    limiter: &Arc<RateLimiter>,
    options: SlowStartOptions,
) -> Result<SlowStart> {
    let step_interval = Duration::from_millis(
        options
            .interval
            .ok_or(TollgateError::MissingParameter("interval"))?,
    );
    if step_interval.is_zero() {
        return Err(TollgateError::Config(
            "slow-start interval must be at least 1ms".to_string(),
        ));
    }

    // Validate and expand everything up front; past this point the entry
    // cannot fail and leave the controller stuck in Running.
    let reductions = expand_overrides(&options)?;

    let controller = limiter.controller.clone();
    controller.begin()?;

    // Snapshot each touched bucket once, then install its reduction. The
    // limiter is stricter from this moment on.
    let mut snapshots: Vec<(Selector, Arc<TokenBucket>, BucketParams)> = Vec::new();
    for (selector, reduced) in &reductions {
        match selector {
            Selector::All => {
                let root = limiter.root_bucket().clone();
                snapshot_once(&mut snapshots, *selector, &root);
                root.set_params(reduced);
            }
            Selector::Method(method) => {
                if let Some(bucket) = limiter.method_bucket(*method) {
                    snapshot_once(&mut snapshots, *selector, &bucket);
                    bucket.set_params(reduced);
                } else {
                    // No pre-transition state to ramp back to: the fresh
                    // bucket simply keeps the reduced parameters.
                    if let Err(err) = limiter.register_bucket(*method, reduced) {
                        controller.finish();
                        return Err(err);
                    }
                }
            }
        }
    }

    // The default transition time reads the root interval as it stands now,
    // reductions included.
    let transition_time = options
        .transition_time
        .map(Duration::from_millis)
        .unwrap_or_else(|| limiter.root_bucket().params().interval * 5);
    // A transition shorter than one step interval completes in one step.
    let step_count = (transition_time.as_secs_f64() / step_interval.as_secs_f64()).max(1.0);

    let tracked: Vec<TrackedBucket> = snapshots
        .into_iter()
        .map(|(label, bucket, snapshot)| {
            let current = bucket.params();
            let delta_capacity = (snapshot.capacity - current.capacity) / step_count;
            let delta_rate = match options.step_mode {
                StepMode::Independent => {
                    (snapshot.tokens_per_interval - current.tokens_per_interval) / step_count
                }
                StepMode::Lockstep => delta_capacity,
            };
            TrackedBucket {
                label,
                bucket,
                snapshot,
                delta_capacity,
                delta_rate,
            }
        })
        .collect();

    info!(
        tracked = tracked.len(),
        steps = step_count,
        interval_ms = step_interval.as_millis() as u64,
        mode = ?options.step_mode,
        "Starting slow-start transition"
    );

    let task = tokio::spawn(run_transition(tracked, step_interval, controller.clone()));
    Ok(SlowStart { task, controller })
}

/// Expand the per-method override map into an ordered reduction list:
/// single-method keys first, then `all`, then comma-joined groups.
fn expand_overrides(options: &SlowStartOptions) -> Result<Vec<(Selector, BucketOptions)>> {
    let mut keys: Vec<&String> = options.overrides.keys().collect();
    keys.sort();

    let mut singles = Vec::new();
    let mut root = None;
    let mut groups = Vec::new();

    for key in keys {
        let reduced = options.overrides[key];
        reduced.validate()?;

        if key.contains(',') {
            for token in key.split(',') {
                groups.push((token.trim().parse::<Selector>()?, reduced));
            }
        } else {
            match key.parse::<Selector>()? {
                Selector::All => root = Some((Selector::All, reduced)),
                selector => singles.push((selector, reduced)),
            }
        }
    }

    singles.extend(root);
    singles.extend(groups);
    Ok(singles)
}

/// Record a snapshot for `bucket` unless one is already held.
fn snapshot_once(
    snapshots: &mut Vec<(Selector, Arc<TokenBucket>, BucketParams)>,
    label: Selector,
    bucket: &Arc<TokenBucket>,
) {
    if snapshots.iter().any(|(_, b, _)| Arc::ptr_eq(b, bucket)) {
        return;
    }
    snapshots.push((label, bucket.clone(), bucket.params()));
}

/// The step loop: every `interval`, nudge each tracked bucket by its delta,
/// then test for convergence. On completion every tracked bucket is forced
/// to exactly its snapshot, wiping out float drift from the additive steps.
async fn run_transition(
    tracked: Vec<TrackedBucket>,
    interval: Duration,
    controller: Arc<SlowStartController>,
) {
    let mut step = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        step += 1;

        for t in &tracked {
            t.bucket.nudge(t.delta_capacity, t.delta_rate);
            let params = t.bucket.params();
            debug!(
                bucket = %t.label,
                step = step,
                capacity = params.capacity,
                tokens_per_interval = params.tokens_per_interval,
                "Applied slow-start step"
            );
        }

        if is_done(&tracked) {
            for t in &tracked {
                t.bucket.force_params(t.snapshot);
            }
            info!(steps = step, "Slow-start transition complete");
            break;
        }
    }
    controller.finish();
}

/// A tracked bucket has converged only when both fields have reached its
/// snapshot; the transition is done when every tracked bucket has.
fn is_done(tracked: &[TrackedBucket]) -> bool {
    tracked.iter().all(|t| {
        let params = t.bucket.params();
        params.capacity >= t.snapshot.capacity
            && params.tokens_per_interval >= t.snapshot.tokens_per_interval
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(
            RateLimiter::with_options(
                &BucketOptions::new()
                    .bucket_size(10.0)
                    .tokens_per_interval(10.0)
                    .interval_ms(300),
            )
            .unwrap(),
        )
    }

    fn reduced() -> BucketOptions {
        BucketOptions::new().bucket_size(0.0).tokens_per_interval(1.0)
    }

    #[tokio::test]
    async fn test_missing_interval_is_an_error() {
        let limiter = limiter();
        let result = limiter.slow_start(SlowStartOptions::new().method(Method::Get, reduced()));
        assert!(matches!(
            result,
            Err(TollgateError::MissingParameter("interval"))
        ));
        assert!(!limiter.controller.is_running());
    }

    #[tokio::test]
    async fn test_unknown_method_key_is_an_error() {
        let limiter = limiter();
        let mut options = SlowStartOptions::new().interval_ms(500);
        options.overrides.insert("head".to_string(), reduced());

        assert!(matches!(
            limiter.slow_start(options),
            Err(TollgateError::Config(_))
        ));
        assert!(!limiter.controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reduced_parameters_apply_immediately() {
        let limiter = limiter();
        limiter
            .register_bucket(Method::Get, &BucketOptions::new())
            .unwrap();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .transition_time_ms(1000)
                    .method(Method::Get, reduced()),
            )
            .unwrap();

        let params = limiter.method_bucket(Method::Get).unwrap().params();
        assert_eq!(params.capacity, 0.0);
        assert_eq!(params.tokens_per_interval, 1.0);
        // The root was not mentioned and is untouched.
        assert_eq!(limiter.root_bucket().params().capacity, 10.0);

        transition.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_converges_to_the_snapshot_exactly() {
        let limiter = limiter();
        limiter
            .register_bucket(Method::Get, &BucketOptions::new())
            .unwrap();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .transition_time_ms(1000)
                    .method(Method::Get, reduced()),
            )
            .unwrap();

        // Two steps of (10-0)/2 capacity and (10-1)/2 rate.
        tokio::time::sleep(Duration::from_millis(510)).await;
        let params = limiter.method_bucket(Method::Get).unwrap().params();
        assert_eq!(params.capacity, 5.0);
        assert_eq!(params.tokens_per_interval, 5.5);

        tokio::time::sleep(Duration::from_millis(500)).await;
        transition.wait().await;

        let params = limiter.method_bucket(Method::Get).unwrap().params();
        assert_eq!(params.capacity, 10.0);
        assert_eq!(params.tokens_per_interval, 10.0);
        assert!(!limiter.controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockstep_mode_moves_both_fields_by_the_capacity_delta() {
        let limiter = limiter();
        limiter
            .register_bucket(
                Method::Get,
                &BucketOptions::new().bucket_size(10.0).tokens_per_interval(4.0),
            )
            .unwrap();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .transition_time_ms(1000)
                    .step_mode(StepMode::Lockstep)
                    .method(
                        Method::Get,
                        BucketOptions::new().bucket_size(0.0).tokens_per_interval(0.0),
                    ),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(510)).await;
        let params = limiter.method_bucket(Method::Get).unwrap().params();
        assert_eq!(params.capacity, 5.0);
        // Independent mode would have stepped the rate by 2.0.
        assert_eq!(params.tokens_per_interval, 5.0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        transition.wait().await;

        // The final snap restores the exact snapshot, rate included.
        let params = limiter.method_bucket(Method::Get).unwrap().params();
        assert_eq!(params.capacity, 10.0);
        assert_eq!(params.tokens_per_interval, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_reduces_and_restores_the_root() {
        let limiter = limiter();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .transition_time_ms(1000)
                    .all(reduced()),
            )
            .unwrap();

        assert_eq!(limiter.root_bucket().params().capacity, 0.0);

        tokio::time::sleep(Duration::from_millis(1010)).await;
        transition.wait().await;

        let params = limiter.root_bucket().params();
        assert_eq!(params.capacity, 10.0);
        assert_eq!(params.tokens_per_interval, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_methods_share_one_reduction() {
        let limiter = limiter();
        limiter
            .register_bucket(Method::Put, &BucketOptions::new())
            .unwrap();
        limiter
            .register_bucket(Method::Patch, &BucketOptions::new())
            .unwrap();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .methods(&[Method::Put, Method::Patch], reduced()),
            )
            .unwrap();

        assert_eq!(limiter.method_bucket(Method::Put).unwrap().params().capacity, 0.0);
        assert_eq!(
            limiter.method_bucket(Method::Patch).unwrap().params().capacity,
            0.0
        );

        transition.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_method_without_a_bucket_keeps_the_reduced_parameters() {
        let limiter = limiter();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .transition_time_ms(1000)
                    .method(Method::Post, reduced()),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1010)).await;
        transition.wait().await;

        // Fresh bucket, no snapshot: it stays where slow start put it.
        let params = limiter.method_bucket(Method::Post).unwrap().params();
        assert_eq!(params.capacity, 0.0);
        assert_eq!(params.tokens_per_interval, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_transition_is_rejected_while_running() {
        let limiter = limiter();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .transition_time_ms(60_000)
                    .all(reduced()),
            )
            .unwrap();

        let second = limiter.slow_start(
            SlowStartOptions::new()
                .interval_ms(500)
                .all(reduced()),
        );
        assert!(matches!(second, Err(TollgateError::SlowStartActive)));

        transition.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_buckets_at_the_last_step() {
        let limiter = limiter();

        let transition = limiter
            .slow_start(
                SlowStartOptions::new()
                    .interval_ms(500)
                    .transition_time_ms(60_000)
                    .all(reduced()),
            )
            .unwrap();

        transition.stop();
        assert!(!limiter.controller.is_running());

        // No steps ran; the root still carries the reduced parameters.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(limiter.root_bucket().params().capacity, 0.0);

        // A new transition may start now.
        let next = limiter
            .slow_start(SlowStartOptions::new().interval_ms(500).all(reduced()))
            .unwrap();
        next.stop();
    }
}

//! Core rate limiter facade.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, trace};

use crate::config::{
    BucketOptions, LimiterConfig, SlowStartOptions, DEFAULT_BUCKET_SIZE, DEFAULT_INTERVAL_MS,
    DEFAULT_TOKENS_PER_INTERVAL,
};
use crate::error::{Result, TollgateError};
use crate::request::{Method, Request, Selector};
use crate::transport::{Gated, Transport};

use super::bucket::{BucketParams, TokenBucket};
use super::router::{PatternRoute, Router};
use super::slowstart::{self, SlowStart, SlowStartController};

/// The rate limiter: a root token bucket, the route table resolving requests
/// to buckets, and the slow-start controller.
///
/// All configuration calls may run concurrently with admissions; buckets are
/// updated in place so routes keep their identity across reconfiguration.
#[derive(Debug)]
pub struct RateLimiter {
    pub(crate) root: Arc<TokenBucket>,
    pub(crate) router: RwLock<Router>,
    pub(crate) controller: Arc<SlowStartController>,
}

impl RateLimiter {
    /// Create a limiter with default root parameters.
    pub fn new() -> Self {
        let params = BucketParams {
            capacity: DEFAULT_BUCKET_SIZE,
            tokens_per_interval: DEFAULT_TOKENS_PER_INTERVAL,
            interval: std::time::Duration::from_millis(DEFAULT_INTERVAL_MS),
        };
        let root = Arc::new(TokenBucket::new(params));
        Self {
            root: root.clone(),
            router: RwLock::new(Router::new(root)),
            controller: Arc::new(SlowStartController::new()),
        }
    }

    /// Create a limiter, seeding the root bucket from `options`.
    pub fn with_options(options: &BucketOptions) -> Result<Self> {
        options.validate()?;
        let limiter = Self::new();
        limiter.root.set_params(options);
        Ok(limiter)
    }

    /// Create a limiter from a whole configuration document.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        let limiter = Self::new();
        limiter.apply_config(config)?;
        Ok(limiter)
    }

    /// Apply a configuration document: root parameters first, then
    /// per-method buckets, then ordered pattern routes.
    pub fn apply_config(&self, config: &LimiterConfig) -> Result<()> {
        if let Some(root) = &config.root {
            self.register_bucket(Selector::All, root)?;
        }

        let mut method_keys: Vec<&String> = config.methods.keys().collect();
        method_keys.sort();
        for key in method_keys {
            let selector: Selector = key.parse()?;
            self.register_bucket(selector, &config.methods[key])?;
        }

        for route in &config.routes {
            self.register_route(route.method, &route.pattern, &route.bucket)?;
        }
        Ok(())
    }

    /// Wrap `transport` in an admission-gated decorator, optionally
    /// reseeding the root bucket.
    ///
    /// The decorator retains the transport; [`Gated::restore`] hands the
    /// original back untouched.
    pub fn configure<T: Transport>(
        self: &Arc<Self>,
        transport: T,
        options: Option<&BucketOptions>,
    ) -> Result<Gated<T>> {
        if let Some(options) = options {
            options.validate()?;
            self.root.set_params(options);
        }
        Ok(Gated::new(self.clone(), transport))
    }

    /// Create or update the bucket selected by `selector`.
    ///
    /// `Selector::All` updates the root bucket in place. A method selector
    /// updates the method's existing bucket in place (identity and parent
    /// link preserved), or creates one parented to the root, with any
    /// unspecified field defaulting to the root's current value.
    pub fn register_bucket(
        &self,
        selector: impl Into<Selector>,
        options: &BucketOptions,
    ) -> Result<Arc<TokenBucket>> {
        options.validate()?;

        match selector.into() {
            Selector::All => {
                self.root.set_params(options);
                Ok(self.root.clone())
            }
            Selector::Method(method) => {
                let mut router = self.router.write();
                if let Some(bucket) = router.method_bucket(method) {
                    bucket.set_params(options);
                    return Ok(bucket);
                }

                let params = options.merged_over(self.root.params());
                debug!(
                    method = %method,
                    capacity = params.capacity,
                    tokens_per_interval = params.tokens_per_interval,
                    interval_ms = params.interval.as_millis() as u64,
                    "Creating method bucket"
                );
                let bucket = Arc::new(TokenBucket::with_parent(params, self.root.clone()));
                router.insert_method_bucket(method, bucket.clone());
                Ok(bucket)
            }
        }
    }

    /// Append an ordered URL-pattern route with a fresh bucket parented to
    /// the root. `method` of `None` matches any method. Earlier routes win.
    pub fn register_route(
        &self,
        method: Option<Method>,
        pattern: &str,
        options: &BucketOptions,
    ) -> Result<Arc<TokenBucket>> {
        options.validate()?;
        let pattern = Regex::new(pattern)
            .map_err(|e| TollgateError::Config(format!("Invalid route pattern: {}", e)))?;

        let params = options.merged_over(self.root.params());
        let bucket = Arc::new(TokenBucket::with_parent(params, self.root.clone()));
        debug!(
            method = ?method,
            pattern = %pattern,
            "Registering pattern route"
        );
        self.router.write().push_route(PatternRoute {
            method,
            pattern,
            bucket: bucket.clone(),
        });
        Ok(bucket)
    }

    /// The bucket that would gate `request`.
    pub fn resolve_bucket(&self, request: &Request) -> Arc<TokenBucket> {
        self.router.read().resolve(request)
    }

    /// Admit one unit of work for `request`, suspending the calling task
    /// until its bucket (and every ancestor) can supply a token.
    pub async fn admit(&self, request: &Request) -> Result<()> {
        let bucket = self.resolve_bucket(request);
        trace!(request = %request, "Awaiting admission");
        bucket.consume(1.0).await?;
        trace!(request = %request, "Admitted");
        Ok(())
    }

    /// The root bucket shared by every route.
    pub fn root_bucket(&self) -> &Arc<TokenBucket> {
        &self.root
    }

    /// The dedicated bucket for `method`, if one was registered.
    pub fn method_bucket(&self, method: Method) -> Option<Arc<TokenBucket>> {
        self.router.read().method_bucket(method)
    }

    /// Begin a slow-start transition. See [`SlowStartOptions`] and
    /// [`SlowStart`]. Fails with [`TollgateError::SlowStartActive`] when a
    /// transition is already running.
    pub fn slow_start(self: &Arc<Self>, options: SlowStartOptions) -> Result<SlowStart> {
        slowstart::begin_transition(self, options)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

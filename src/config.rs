//! Configuration surface for the limiter.
//!
//! Options structs are partial: any field left unset falls back to the value
//! already configured on the affected bucket (or the root bucket's values
//! when a bucket is first created). `LimiterConfig` is the whole-limiter
//! document form, loadable from YAML.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{BucketParams, StepMode};
use crate::request::Method;

/// Root bucket capacity when nothing is configured.
pub const DEFAULT_BUCKET_SIZE: f64 = 10.0;
/// Root refill rate when nothing is configured.
pub const DEFAULT_TOKENS_PER_INTERVAL: f64 = 10.0;
/// Root refill cycle when nothing is configured.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Partial parameters for one token bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketOptions {
    /// Maximum tokens the bucket holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<f64>,

    /// Tokens added per refill cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_interval: Option<f64>,

    /// Refill cycle length in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

impl BucketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_size(mut self, size: f64) -> Self {
        self.bucket_size = Some(size);
        self
    }

    pub fn tokens_per_interval(mut self, tokens: f64) -> Self {
        self.tokens_per_interval = Some(tokens);
        self
    }

    pub fn interval_ms(mut self, millis: u64) -> Self {
        self.interval = Some(millis);
        self
    }

    /// Reject values no bucket configuration may carry.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(size) = self.bucket_size {
            if !size.is_finite() || size < 0.0 {
                return Err(TollgateError::Config(format!(
                    "bucket_size must be a non-negative number, got {}",
                    size
                )));
            }
        }
        if let Some(tokens) = self.tokens_per_interval {
            if !tokens.is_finite() || tokens < 0.0 {
                return Err(TollgateError::Config(format!(
                    "tokens_per_interval must be a non-negative number, got {}",
                    tokens
                )));
            }
        }
        if self.interval == Some(0) {
            return Err(TollgateError::Config(
                "interval must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Complete these options against a full set of base parameters.
    pub(crate) fn merged_over(&self, base: BucketParams) -> BucketParams {
        BucketParams {
            capacity: self.bucket_size.unwrap_or(base.capacity),
            tokens_per_interval: self.tokens_per_interval.unwrap_or(base.tokens_per_interval),
            interval: self
                .interval
                .map(Duration::from_millis)
                .unwrap_or(base.interval),
        }
    }
}

/// Options for one slow-start transition.
///
/// Per-method reduced parameters are keyed by method name, `all` for the
/// root bucket, or a comma-joined group (`put,patch,post`) applying one set
/// of reduced parameters to several methods at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlowStartOptions {
    /// Total ramp duration in milliseconds. Defaults to five root intervals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<u64>,

    /// Step period in milliseconds. Required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    /// How per-step deltas are derived. See [`StepMode`].
    #[serde(default)]
    pub step_mode: StepMode,

    /// Reduced parameters per method key.
    #[serde(flatten)]
    pub overrides: HashMap<String, BucketOptions>,
}

impl SlowStartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition_time_ms(mut self, millis: u64) -> Self {
        self.transition_time = Some(millis);
        self
    }

    pub fn interval_ms(mut self, millis: u64) -> Self {
        self.interval = Some(millis);
        self
    }

    pub fn step_mode(mut self, mode: StepMode) -> Self {
        self.step_mode = mode;
        self
    }

    /// Reduced parameters for a single method.
    pub fn method(mut self, method: Method, options: BucketOptions) -> Self {
        self.overrides.insert(method.as_str().to_string(), options);
        self
    }

    /// One set of reduced parameters applied to several methods.
    pub fn methods(mut self, methods: &[Method], options: BucketOptions) -> Self {
        let key = methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.overrides.insert(key, options);
        self
    }

    /// Reduced parameters for the root bucket.
    pub fn all(mut self, options: BucketOptions) -> Self {
        self.overrides.insert("all".to_string(), options);
        self
    }
}

/// One ordered URL-pattern route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Method this route applies to; absent means any method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// Regular expression tested against the request URL.
    pub pattern: String,

    /// Parameters for the route's bucket.
    #[serde(flatten)]
    pub bucket: BucketOptions,
}

/// A complete limiter configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Root bucket parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<BucketOptions>,

    /// Per-method buckets, keyed by method name (or `all` for the root).
    #[serde(default)]
    pub methods: HashMap<String, BucketOptions>,

    /// Ordered URL-pattern routes, matched before the per-method buckets.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl LimiterConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse limiter config: {}", e)))
    }
}

//! Route matching: which bucket gates a given request.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::request::{Method, Request};

use super::bucket::TokenBucket;

/// One ordered URL-pattern rule.
#[derive(Debug)]
pub(crate) struct PatternRoute {
    /// Method this rule applies to; `None` matches any method.
    pub(crate) method: Option<Method>,
    pub(crate) pattern: Regex,
    pub(crate) bucket: Arc<TokenBucket>,
}

impl PatternRoute {
    fn matches(&self, request: &Request) -> bool {
        self.method.map_or(true, |m| m == request.method())
            && self.pattern.is_match(request.url())
    }
}

/// Maps a request descriptor to the bucket that gates it.
///
/// Resolution order: ordered pattern rules (first match wins), then the
/// per-method bucket map, then the root bucket. For a fixed rule set the
/// result is a pure function of `(method, url)`.
#[derive(Debug)]
pub(crate) struct Router {
    root: Arc<TokenBucket>,
    method_buckets: HashMap<Method, Arc<TokenBucket>>,
    routes: Vec<PatternRoute>,
}

impl Router {
    pub(crate) fn new(root: Arc<TokenBucket>) -> Self {
        Self {
            root,
            method_buckets: HashMap::new(),
            routes: Vec::new(),
        }
    }

    pub(crate) fn resolve(&self, request: &Request) -> Arc<TokenBucket> {
        for route in &self.routes {
            if route.matches(request) {
                return route.bucket.clone();
            }
        }

        self.method_buckets
            .get(&request.method())
            .cloned()
            .unwrap_or_else(|| self.root.clone())
    }

    pub(crate) fn method_bucket(&self, method: Method) -> Option<Arc<TokenBucket>> {
        self.method_buckets.get(&method).cloned()
    }

    pub(crate) fn insert_method_bucket(&mut self, method: Method, bucket: Arc<TokenBucket>) {
        self.method_buckets.insert(method, bucket);
    }

    pub(crate) fn push_route(&mut self, route: PatternRoute) {
        self.routes.push(route);
    }
}

//! The transport seam: the collaborator contract and the gating decorator.
//!
//! The limiter never owns an HTTP client or patches one. The host hands its
//! transport to [`RateLimiter::configure`](crate::ratelimit::RateLimiter::configure),
//! receives a [`Gated`] decorator implementing the same callable contract,
//! and decides for itself where to install it. [`Gated::restore`] hands the
//! original transport back unchanged.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::RateLimiter;
use crate::request::Request;

/// The operation the limiter gates.
///
/// `Output` is whatever the transport produces for a request — typically a
/// `Result` of its own. The limiter relays it verbatim and never inspects
/// it: a transport-level failure is the caller's to interpret.
#[async_trait]
pub trait Transport: Send + Sync {
    type Output: Send;

    async fn dispatch(&self, request: Request) -> Self::Output;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    type Output = T::Output;

    async fn dispatch(&self, request: Request) -> Self::Output {
        (**self).dispatch(request).await
    }
}

/// An admission-gated transport.
///
/// Each dispatch resolves the request's bucket, consumes one token (waiting
/// as long as it takes), then forwards to the wrapped transport. The only
/// error `Gated` itself produces is an admission configuration error; the
/// inner transport's outcome rides inside `Ok` untouched.
#[derive(Debug)]
pub struct Gated<T> {
    limiter: Arc<RateLimiter>,
    inner: T,
}

impl<T: Transport> Gated<T> {
    pub(crate) fn new(limiter: Arc<RateLimiter>, inner: T) -> Self {
        Self { limiter, inner }
    }

    /// Admit one token for `request`, then forward it.
    pub async fn gate(&self, request: Request) -> Result<T::Output> {
        self.limiter.admit(&request).await?;
        Ok(self.inner.dispatch(request).await)
    }

    /// Hand back the wrapped transport, ungated.
    pub fn restore(self) -> T {
        self.inner
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// The limiter gating this transport.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl<T: Transport> Transport for Gated<T> {
    type Output = Result<T::Output>;

    async fn dispatch(&self, request: Request) -> Self::Output {
        self.gate(request).await
    }
}

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;

use super::bucket::{BucketShape, TokenBucket};
use crate::error::TollgateError;
use crate::store::SharedStore;

/// Error returned by [`RateLimitService`].
#[derive(Debug, Clone, PartialEq)]
pub enum GuardError<E> {
    /// The bucket is empty; the inner service was not called.
    RateLimited { wait: Duration },
    /// The bucket could not be consulted (store down, bad shape).
    Limiter(TollgateError),
    /// The inner service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { wait } => write!(f, "rate limited, retry after {:?}", wait),
            Self::Limiter(e) => write!(f, "rate limiter unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E> std::error::Error for GuardError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Limiter(e) => Some(e),
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> GuardError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// A layer that takes one token from a shared bucket per request.
pub struct RateLimitLayer<St: SharedStore + ?Sized> {
    bucket: Arc<TokenBucket<St>>,
    key: Arc<str>,
    shape: BucketShape,
}

impl<St: SharedStore + ?Sized> Clone for RateLimitLayer<St> {
    fn clone(&self) -> Self {
        Self { bucket: Arc::clone(&self.bucket), key: Arc::clone(&self.key), shape: self.shape }
    }
}

impl<St: SharedStore + ?Sized> fmt::Debug for RateLimitLayer<St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("key", &self.key)
            .field("shape", &self.shape)
            .finish()
    }
}

impl<St: SharedStore + ?Sized> RateLimitLayer<St> {
    /// Create a new rate limit layer drawing from `key` of `bucket`.
    pub fn new(bucket: TokenBucket<St>, key: impl Into<String>, shape: BucketShape) -> Self {
        Self { bucket: Arc::new(bucket), key: Arc::from(key.into()), shape }
    }
}

impl<S, St> Layer<S> for RateLimitLayer<St>
where
    St: SharedStore + ?Sized,
{
    type Service = RateLimitService<S, St>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            bucket: Arc::clone(&self.bucket),
            key: Arc::clone(&self.key),
            shape: self.shape,
        }
    }
}

/// Middleware service that enforces a token bucket.
pub struct RateLimitService<S, St: SharedStore + ?Sized> {
    inner: S,
    bucket: Arc<TokenBucket<St>>,
    key: Arc<str>,
    shape: BucketShape,
}

impl<S: Clone, St: SharedStore + ?Sized> Clone for RateLimitService<S, St> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            bucket: Arc::clone(&self.bucket),
            key: Arc::clone(&self.key),
            shape: self.shape,
        }
    }
}

impl<S: fmt::Debug, St: SharedStore + ?Sized> fmt::Debug for RateLimitService<S, St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("key", &self.key)
            .field("shape", &self.shape)
            .finish()
    }
}

impl<S, St, Req> Service<Req> for RateLimitService<S, St>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    St: SharedStore + ?Sized + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let bucket = Arc::clone(&self.bucket);
        let key = Arc::clone(&self.key);
        let shape = self.shape;
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match bucket.take(&key, shape, 1).await {
                Ok(decision) if decision.allowed => {
                    inner.call(req).await.map_err(GuardError::Inner)
                }
                Ok(decision) => Err(GuardError::RateLimited { wait: decision.wait }),
                Err(e) => Err(GuardError::Limiter(e)),
            }
        })
    }
}

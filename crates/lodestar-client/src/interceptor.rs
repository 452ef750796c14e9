use std::sync::Arc;

use async_trait::async_trait;
use lodestar_common::protocol::{RequestFrame, ResponseFrame, Result};

/// Hook around a logical invocation.
///
/// Interceptors run in registration order, once per invocation regardless of
/// how many physical attempts follow. An interceptor may rewrite the request,
/// answer it without calling `next`, or forward it and inspect the outcome.
/// Oneway invocations yield `Ok(None)`.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use lodestar_client::{Interceptor, Next};
/// use lodestar_common::{RequestFrame, ResponseFrame, Result};
///
/// struct Tenant(String);
///
/// #[async_trait]
/// impl Interceptor for Tenant {
///     async fn intercept(&self, request: RequestFrame, next: Next<'_>) -> Result<Option<ResponseFrame>> {
///         next.run(request.with_context("tenant", self.0.clone())).await
///     }
/// }
/// ```
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, request: RequestFrame, next: Next<'_>) -> Result<Option<ResponseFrame>>;
}

/// The final link of the chain, performing the attempt loop.
#[async_trait]
pub(crate) trait Terminal: Send + Sync {
    async fn invoke(&self, request: RequestFrame) -> Result<Option<ResponseFrame>>;
}

/// The rest of the chain after the current interceptor.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub(crate) fn new(interceptors: &'a [Arc<dyn Interceptor>], terminal: &'a dyn Terminal) -> Self {
        Self {
            remaining: interceptors,
            terminal,
        }
    }

    /// Passes `request` to the next interceptor, or to the attempt loop.
    pub async fn run(self, request: RequestFrame) -> Result<Option<ResponseFrame>> {
        match self.remaining.split_first() {
            Some((interceptor, rest)) => {
                interceptor
                    .intercept(request, Next::new(rest, self.terminal))
                    .await
            }
            None => self.terminal.invoke(request).await,
        }
    }
}

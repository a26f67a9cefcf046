//! Middleware onion around `complete` and `stream`.
//!
//! Registration order is the request-side traversal order; the innermost
//! middleware is closest to the adapter and therefore observes responses
//! and stream events first. Middleware never retries; that is the retry
//! engine's job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatProvider, ChatRequest, ChatResponse};
use crate::error::LLMError;
use crate::stream::ChatStream;

/// A pair of wrappers around the two provider entry points. Both default
/// to passthrough so a middleware can intercept only one side.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        next: CompleteNext<'_>,
    ) -> Result<ChatResponse, LLMError> {
        next.run(cancel, request).await
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        next: StreamNext<'_>,
    ) -> Result<ChatStream, LLMError> {
        next.run(cancel, request).await
    }
}

/// Continuation for the unary path.
pub struct CompleteNext<'a> {
    pub(crate) middlewares: &'a [Arc<dyn Middleware>],
    pub(crate) provider: &'a dyn ChatProvider,
}

impl CompleteNext<'_> {
    pub async fn run(
        self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LLMError> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                head.complete(
                    cancel,
                    request,
                    CompleteNext { middlewares: rest, provider: self.provider },
                )
                .await
            }
            None => self.provider.complete(cancel, request).await,
        }
    }
}

/// Continuation for the streaming path.
pub struct StreamNext<'a> {
    pub(crate) middlewares: &'a [Arc<dyn Middleware>],
    pub(crate) provider: &'a dyn ChatProvider,
}

impl StreamNext<'_> {
    pub async fn run(
        self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatStream, LLMError> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                head.stream(
                    cancel,
                    request,
                    StreamNext { middlewares: rest, provider: self.provider },
                )
                .await
            }
            None => self.provider.stream(cancel, request).await,
        }
    }
}

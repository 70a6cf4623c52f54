//! Handler capability and the adapters layered on top of it.
//!
//! The runtime consumes a single streaming capability. Most functions are
//! written against one of the adapters instead: a plain closure over the
//! writer, or a buffered JSON handler that never touches streaming at all.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::InvocationContext;
use crate::diagnostic::Diagnostic;
use crate::error::BoxError;
use crate::writer::ResponseWriter;

/// The single capability the run-loop drives.
///
/// The writer is lent for the duration of the call; whatever the handler
/// leaves unfinished, the run-loop completes or reports.
#[async_trait]
pub trait StreamingHandler: Send + Sync {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        ctx: &InvocationContext,
    ) -> Result<(), BoxError>;
}

/// Boxed future returned by streaming closures.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

/// Adapt a closure into a [`StreamingHandler`].
///
/// ```ignore
/// let handler = streaming_handler_fn(|event, writer, _ctx| {
///     Box::pin(async move { writer.write_and_finish(event).await.map_err(Into::into) })
/// });
/// ```
pub fn streaming_handler_fn<F>(f: F) -> StreamingHandlerFn<F>
where
    F: for<'a> Fn(Bytes, &'a mut ResponseWriter, &'a InvocationContext) -> HandlerFuture<'a>
        + Send
        + Sync,
{
    StreamingHandlerFn { f }
}

pub struct StreamingHandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F> StreamingHandler for StreamingHandlerFn<F>
where
    F: for<'a> Fn(Bytes, &'a mut ResponseWriter, &'a InvocationContext) -> HandlerFuture<'a>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        ctx: &InvocationContext,
    ) -> Result<(), BoxError> {
        (self.f)(event, writer, ctx).await
    }
}

/// Buffered JSON handler: decoded event in, encodable output out. The
/// adapter composes it onto the streaming seam with a single
/// `write_and_finish`.
#[async_trait]
pub trait Handler: Send + Sync {
    type Event: DeserializeOwned + Send;
    type Output: Serialize + Send;

    async fn invoke(
        &self,
        event: Self::Event,
        ctx: InvocationContext,
    ) -> Result<Self::Output, BoxError>;
}

/// Wrap a buffered JSON [`Handler`] for the run-loop.
pub fn buffered<H: Handler>(handler: H) -> Buffered<H> {
    Buffered { inner: handler }
}

pub struct Buffered<H> {
    inner: H,
}

#[async_trait]
impl<H: Handler> StreamingHandler for Buffered<H> {
    async fn handle(
        &self,
        event: Bytes,
        writer: &mut ResponseWriter,
        ctx: &InvocationContext,
    ) -> Result<(), BoxError> {
        let event: H::Event = serde_json::from_slice(&event).map_err(|e| {
            Box::new(Diagnostic::new(
                "Runtime.InvalidEventData",
                format!("could not decode event: {e}"),
            )) as BoxError
        })?;
        let output = self.inner.invoke(event, ctx.clone()).await?;
        let body = serde_json::to_vec(&output)?;
        writer.write_and_finish(body).await?;
        Ok(())
    }
}

/// Adapt an async closure `(event, ctx) -> output` into a buffered JSON
/// handler.
pub fn handler_fn<F, E, O, Fut>(f: F) -> Buffered<HandlerFn<F, E, O>>
where
    F: Fn(E, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, BoxError>> + Send,
    E: DeserializeOwned + Send,
    O: Serialize + Send,
{
    buffered(HandlerFn {
        f,
        _marker: PhantomData,
    })
}

pub struct HandlerFn<F, E, O> {
    f: F,
    _marker: PhantomData<fn(E) -> O>,
}

#[async_trait]
impl<F, E, O, Fut> Handler for HandlerFn<F, E, O>
where
    F: Fn(E, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, BoxError>> + Send,
    E: DeserializeOwned + Send,
    O: Serialize + Send,
{
    type Event = E;
    type Output = O;

    async fn invoke(&self, event: E, ctx: InvocationContext) -> Result<O, BoxError> {
        (self.f)(event, ctx).await
    }
}

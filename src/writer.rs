//! Dual-mode response writer.
//!
//! The writer is handed to the handler for exactly one invocation. It stays
//! uncommitted until the handler's first act: an explicit status/headers
//! prelude commits it to streaming, a single buffered write followed by
//! `finish` collapses into one buffered POST, and a second write before
//! finishing promotes the held first buffer into a stream. Mid-stream
//! handler failures terminate the chunked body with an error trailer.

use async_trait::async_trait;
use bytes::Bytes;

use crate::diagnostic::Diagnostic;
use crate::error::{RuntimeError, UsageError};
use crate::protocol::ResponsePrelude;

/// Delivery mechanism behind a writer. One implementation speaks the
/// control-plane wire protocol, the other feeds the local development
/// server's response pool.
#[async_trait]
pub(crate) trait ResponseTransport: Send {
    /// Deliver a complete response in one shot (empty when `body` is None).
    async fn send_complete(&mut self, body: Option<Bytes>) -> Result<(), RuntimeError>;

    /// Open the streamed response. Prelude frames and chunks follow.
    async fn open_stream(&mut self) -> Result<(), RuntimeError>;

    async fn send_prelude(&mut self, prelude: &ResponsePrelude) -> Result<(), RuntimeError>;

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), RuntimeError>;

    /// Close the streamed body normally.
    async fn finish_stream(&mut self) -> Result<(), RuntimeError>;

    /// Close the streamed body with a terminating error trailer.
    async fn abort_stream(&mut self, diagnostic: &Diagnostic) -> Result<(), RuntimeError>;

    /// Report an error for an invocation that never started streaming.
    async fn send_error(&mut self, diagnostic: &Diagnostic) -> Result<(), RuntimeError>;
}

/// Externally observable delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Unstarted,
    Buffered,
    Streaming,
    Finished,
    Errored,
}

enum WriterState {
    /// Nothing sent yet. A single write is held here until the handler's
    /// next act decides between buffered and streamed delivery.
    Unstarted { pending: Option<Bytes> },
    Streaming { body_started: bool },
    Finished,
    Errored,
}

/// Streaming sink lent to the handler for the duration of one invocation.
pub struct ResponseWriter {
    request_id: String,
    state: WriterState,
    transport: Box<dyn ResponseTransport>,
}

impl ResponseWriter {
    pub(crate) fn new(request_id: String, transport: Box<dyn ResponseTransport>) -> Self {
        Self {
            request_id,
            state: WriterState::Unstarted { pending: None },
            transport,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn mode(&self) -> ResponseMode {
        match &self.state {
            WriterState::Unstarted { pending: None } => ResponseMode::Unstarted,
            WriterState::Unstarted { pending: Some(_) } => ResponseMode::Buffered,
            WriterState::Streaming { .. } => ResponseMode::Streaming,
            WriterState::Finished => ResponseMode::Finished,
            WriterState::Errored => ResponseMode::Errored,
        }
    }

    /// Announce status and headers, committing the response to streaming.
    ///
    /// May be called repeatedly while no body byte has been streamed; the
    /// platform honors the last prelude. Once body data is on the wire a
    /// further prelude is a usage error.
    pub async fn write_status_and_headers(
        &mut self,
        prelude: ResponsePrelude,
    ) -> Result<(), RuntimeError> {
        match std::mem::replace(&mut self.state, WriterState::Errored) {
            WriterState::Unstarted { pending } => {
                let body_started = pending.is_some();
                // A failure here leaves the writer in `Errored`.
                self.start_stream_with(Some(&prelude), pending).await?;
                self.state = WriterState::Streaming { body_started };
                Ok(())
            }
            WriterState::Streaming { body_started: false } => {
                self.state = WriterState::Streaming { body_started: false };
                self.transport.send_prelude(&prelude).await
            }
            WriterState::Streaming { body_started: true } => {
                self.state = WriterState::Streaming { body_started: true };
                Err(UsageError::PreludeAfterBody.into())
            }
            state @ (WriterState::Finished | WriterState::Errored) => {
                self.state = state;
                Err(UsageError::WriteAfterFinish.into())
            }
        }
    }

    /// Write one buffer of response data.
    ///
    /// The first write is held back privately; a second write commits the
    /// response to streaming and flushes the held buffer ahead of the new
    /// one.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), RuntimeError> {
        let data = data.into();
        match std::mem::replace(&mut self.state, WriterState::Errored) {
            WriterState::Unstarted { pending: None } => {
                self.state = WriterState::Unstarted {
                    pending: Some(data),
                };
                Ok(())
            }
            WriterState::Unstarted { pending } => {
                self.start_stream_with(None, pending).await?;
                self.state = WriterState::Streaming { body_started: true };
                self.transport.send_chunk(data).await
            }
            WriterState::Streaming { .. } => {
                self.state = WriterState::Streaming { body_started: true };
                self.transport.send_chunk(data).await
            }
            state @ (WriterState::Finished | WriterState::Errored) => {
                self.state = state;
                Err(UsageError::WriteAfterFinish.into())
            }
        }
    }

    /// Complete the response: one buffered POST when a single write was
    /// held, an empty response when nothing was written, or a normal close
    /// of the chunked body when streaming.
    pub async fn finish(&mut self) -> Result<(), RuntimeError> {
        match std::mem::replace(&mut self.state, WriterState::Finished) {
            WriterState::Unstarted { pending } => self.transport.send_complete(pending).await,
            WriterState::Streaming { .. } => self.transport.finish_stream().await,
            state @ (WriterState::Finished | WriterState::Errored) => {
                self.state = state;
                Err(UsageError::AlreadyFinished.into())
            }
        }
    }

    /// Write a final buffer and complete in one call. From a clean writer
    /// this commands buffered delivery.
    pub async fn write_and_finish(&mut self, data: impl Into<Bytes>) -> Result<(), RuntimeError> {
        let data = data.into();
        match std::mem::replace(&mut self.state, WriterState::Finished) {
            WriterState::Unstarted { pending: None } => {
                self.transport.send_complete(Some(data)).await
            }
            WriterState::Unstarted { pending } => {
                if let Err(e) = self.start_stream_with(None, pending).await {
                    self.state = WriterState::Errored;
                    return Err(e);
                }
                self.transport.send_chunk(data).await?;
                self.transport.finish_stream().await
            }
            WriterState::Streaming { .. } => {
                self.transport.send_chunk(data).await?;
                self.transport.finish_stream().await
            }
            state @ (WriterState::Finished | WriterState::Errored) => {
                self.state = state;
                Err(UsageError::WriteAfterFinish.into())
            }
        }
    }

    /// Report a handler failure through this writer. Streaming responses
    /// terminate with an error trailer; uncommitted responses drop any held
    /// buffer and post a separate error. After this call the invocation
    /// counts as reported.
    pub(crate) async fn report_error(
        &mut self,
        diagnostic: &Diagnostic,
    ) -> Result<(), RuntimeError> {
        match std::mem::replace(&mut self.state, WriterState::Errored) {
            WriterState::Unstarted { .. } => self.transport.send_error(diagnostic).await,
            WriterState::Streaming { .. } => self.transport.abort_stream(diagnostic).await,
            state @ (WriterState::Finished | WriterState::Errored) => {
                self.state = state;
                Err(UsageError::AlreadyFinished.into())
            }
        }
    }

    async fn start_stream_with(
        &mut self,
        prelude: Option<&ResponsePrelude>,
        held: Option<Bytes>,
    ) -> Result<(), RuntimeError> {
        self.transport.open_stream().await?;
        if let Some(prelude) = prelude {
            self.transport.send_prelude(prelude).await?;
        }
        if let Some(held) = held {
            self.transport.send_chunk(held).await?;
        }
        Ok(())
    }
}

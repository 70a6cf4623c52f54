//! Local development server.
//!
//! When the process is not running under the platform, an axum server on a
//! loopback port stands in for the control plane. Arbitrary `POST /invoke`
//! requests are queued as invocations, served to the run-loop through the
//! same source interface as the real control plane, and their responses
//! are correlated back to the suspended client by request id — streamed
//! incrementally when the handler streams.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::pool::{Keyed, Pool};
use crate::config::FunctionSettings;
use crate::context::{now_ms, Invocation};
use crate::diagnostic::Diagnostic;
use crate::error::{BoxError, RuntimeError};
use crate::handler::StreamingHandler;
use crate::protocol::{self, ResponsePrelude};
use crate::runtime::{event_loop, shutdown_requested, InvocationSource};
use crate::writer::{ResponseTransport, ResponseWriter};

/// Wall-clock deadline granted to locally served invocations.
const LOCAL_DEADLINE_MS: u64 = 60_000;

/// Buffered response chunks per suspended client.
const FORWARD_CHANNEL_CAPACITY: usize = 128;

struct QueuedInvocation {
    request_id: String,
    trace_id: String,
    client_context: Option<String>,
    cognito_identity: Option<String>,
    body: Bytes,
}

impl Keyed for QueuedInvocation {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}

enum ResponseFrame {
    Prelude(ResponsePrelude),
    Body(Bytes),
    /// Single-shot buffered response; terminal.
    Complete(Option<Bytes>),
    /// Normal end of a streamed response; terminal.
    End,
    /// Handler or runtime failure; terminal.
    Error(Diagnostic),
}

struct ResponseEntry {
    request_id: String,
    frame: ResponseFrame,
}

impl Keyed for ResponseEntry {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}

struct LocalState {
    invocations: Pool<QueuedInvocation>,
    responses: Pool<ResponseEntry>,
}

/// Run the local server and the run-loop side by side until shutdown.
pub(crate) async fn run_local<F, Fut, H>(
    port: u16,
    settings: Arc<FunctionSettings>,
    shutdown_rx: watch::Receiver<bool>,
    init: F,
) -> Result<(), RuntimeError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<H, BoxError>>,
    H: StreamingHandler,
{
    let state = Arc::new(LocalState {
        invocations: Pool::new(),
        responses: Pool::new(),
    });

    let app = Router::new()
        .route("/invoke", post(invoke))
        .with_state(Arc::clone(&state));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RuntimeError::Transport(format!("could not bind {addr}: {e}")))?;
    info!("local invoke server listening on http://{addr}/invoke");

    let server = {
        let server_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_requested(server_shutdown))
                .await
            {
                error!(error = %e, "local invoke server failed");
            }
        })
    };

    let handler = match init().await {
        Ok(handler) => handler,
        Err(init_err) => {
            error!(error = %init_err, "handler construction failed");
            state.invocations.cancel_waiters();
            state.responses.cancel_waiters();
            server.abort();
            return Err(RuntimeError::Init(init_err));
        }
    };

    let source = LocalEventSource {
        state: Arc::clone(&state),
        settings: Arc::clone(&settings),
        shutdown: shutdown_rx.clone(),
    };
    let result = event_loop(&source, &handler, settings, shutdown_rx).await;

    // Unpark suspended clients and let the server drain its connections.
    state.invocations.cancel_waiters();
    state.responses.cancel_waiters();
    let _ = server.await;
    result
}

/// `POST /invoke`: queue the body as an invocation and suspend until its
/// response entries arrive.
async fn invoke(State(state): State<Arc<LocalState>>, request: axum::extract::Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return plain_response(
                StatusCode::BAD_REQUEST,
                format!("could not read request body: {e}"),
            )
        }
    };

    let request_id = Uuid::new_v4().to_string();
    let trace_id = header_string(&parts.headers, &protocol::HEADER_TRACE_ID)
        .unwrap_or_else(protocol::generate_trace_id);

    state.invocations.push(QueuedInvocation {
        request_id: request_id.clone(),
        trace_id,
        client_context: header_string(&parts.headers, &protocol::HEADER_CLIENT_CONTEXT),
        cognito_identity: header_string(&parts.headers, &protocol::HEADER_COGNITO_IDENTITY),
        body,
    });

    // Preludes may repeat until the first body byte; the last one wins.
    let mut prelude: Option<ResponsePrelude> = None;
    loop {
        let entry = match state.responses.next_for(&request_id).await {
            Ok(entry) => entry,
            Err(RuntimeError::Cancelled) => {
                return plain_response(StatusCode::SERVICE_UNAVAILABLE, "runtime shutting down")
            }
            Err(e) => return plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        match entry.frame {
            ResponseFrame::Prelude(p) => prelude = Some(p),
            ResponseFrame::Complete(body) => {
                return buffered_response(prelude.as_ref(), body.unwrap_or_default())
            }
            ResponseFrame::End => return buffered_response(prelude.as_ref(), Bytes::new()),
            ResponseFrame::Error(diagnostic) => return error_response(&diagnostic),
            ResponseFrame::Body(first_chunk) => {
                return streamed_response(state, request_id, prelude.as_ref(), first_chunk)
            }
        }
    }
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn plain_response(status: StatusCode, message: impl Into<String>) -> Response {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

fn error_response(diagnostic: &Diagnostic) -> Response {
    let body = diagnostic
        .to_json()
        .unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(protocol::CONTENT_TYPE_JSON),
    );
    response
}

/// Status defaults to 202; a writer prelude overrides status and headers.
fn response_scaffold(prelude: Option<&ResponsePrelude>, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::ACCEPTED;

    let Some(prelude) = prelude else {
        return response;
    };
    if let Ok(status) = StatusCode::from_u16(prelude.status_code) {
        *response.status_mut() = status;
    }
    let headers = response.headers_mut();
    if let Some(single) = &prelude.headers {
        for (name, value) in single {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid prelude header"),
            }
        }
    }
    if let Some(multi) = &prelude.multi_value_headers {
        for (name, values) in multi {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                warn!(header = %name, "skipping invalid prelude header");
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                    headers.append(name.clone(), value);
                }
            }
        }
    }
    response
}

fn buffered_response(prelude: Option<&ResponsePrelude>, body: Bytes) -> Response {
    response_scaffold(prelude, Body::from(body))
}

/// Forward the already-received first chunk and every further entry for
/// this request id to the client, chunk by chunk.
fn streamed_response(
    state: Arc<LocalState>,
    request_id: String,
    prelude: Option<&ResponsePrelude>,
    first_chunk: Bytes,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(FORWARD_CHANNEL_CAPACITY);
    tx.try_send(Ok(first_chunk))
        .expect("fresh channel has capacity");

    tokio::spawn(async move {
        loop {
            let entry = match state.responses.next_for(&request_id).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(request_id, error = %e, "response stream interrupted");
                    break;
                }
            };
            match entry.frame {
                ResponseFrame::Body(chunk) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Client went away; drain nothing further.
                        break;
                    }
                }
                ResponseFrame::End => break,
                ResponseFrame::Error(diagnostic) => {
                    warn!(request_id, error = %diagnostic, "handler failed mid-stream");
                    break;
                }
                ResponseFrame::Prelude(_) => {
                    warn!(request_id, "ignoring prelude after body bytes were streamed");
                }
                ResponseFrame::Complete(chunk) => {
                    if let Some(chunk) = chunk {
                        let _ = tx.send(Ok(chunk)).await;
                    }
                    break;
                }
            }
        }
    });

    response_scaffold(prelude, Body::from_stream(ReceiverStream::new(rx)))
}

/// The run-loop's view of local mode: identical to the control-plane
/// client.
struct LocalEventSource {
    state: Arc<LocalState>,
    settings: Arc<FunctionSettings>,
    shutdown: watch::Receiver<bool>,
}

impl LocalEventSource {
    fn function_arn(&self) -> String {
        let name = match self.settings.function_name.as_str() {
            "" => "function",
            name => name,
        };
        format!("arn:aws:lambda:local:000000000000:function:{name}")
    }
}

#[async_trait]
impl InvocationSource for LocalEventSource {
    async fn next_invocation(&self) -> Result<(Invocation, ResponseWriter), RuntimeError> {
        let queued = tokio::select! {
            _ = shutdown_requested(self.shutdown.clone()) => return Err(RuntimeError::Cancelled),
            queued = self.state.invocations.next() => queued?,
        };

        let invocation = Invocation {
            request_id: queued.request_id.clone(),
            deadline_ms: now_ms() + LOCAL_DEADLINE_MS,
            invoked_function_arn: self.function_arn(),
            trace_id: Some(queued.trace_id),
            tenant_id: None,
            client_context: queued.client_context,
            cognito_identity: queued.cognito_identity,
            body: queued.body,
        };
        let transport = LocalResponseTransport {
            request_id: queued.request_id.clone(),
            responses: self.state.responses.clone(),
        };
        let writer = ResponseWriter::new(queued.request_id, Box::new(transport));
        Ok((invocation, writer))
    }

    async fn report_error(
        &self,
        request_id: &str,
        diagnostic: &Diagnostic,
    ) -> Result<(), RuntimeError> {
        self.state.responses.push(ResponseEntry {
            request_id: request_id.to_string(),
            frame: ResponseFrame::Error(diagnostic.clone()),
        });
        Ok(())
    }

    async fn report_init_error(&self, diagnostic: &Diagnostic) -> Result<(), RuntimeError> {
        error!(error = %diagnostic, "handler initialization failed in local mode");
        Ok(())
    }
}

/// Response transport that feeds the demultiplexing pool instead of the
/// control-plane socket.
struct LocalResponseTransport {
    request_id: String,
    responses: Pool<ResponseEntry>,
}

impl LocalResponseTransport {
    fn push(&self, frame: ResponseFrame) {
        self.responses.push(ResponseEntry {
            request_id: self.request_id.clone(),
            frame,
        });
    }
}

#[async_trait]
impl ResponseTransport for LocalResponseTransport {
    async fn send_complete(&mut self, body: Option<Bytes>) -> Result<(), RuntimeError> {
        self.push(ResponseFrame::Complete(body));
        Ok(())
    }

    async fn open_stream(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn send_prelude(&mut self, prelude: &ResponsePrelude) -> Result<(), RuntimeError> {
        self.push(ResponseFrame::Prelude(prelude.clone()));
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), RuntimeError> {
        self.push(ResponseFrame::Body(chunk));
        Ok(())
    }

    async fn finish_stream(&mut self) -> Result<(), RuntimeError> {
        self.push(ResponseFrame::End);
        Ok(())
    }

    async fn abort_stream(&mut self, diagnostic: &Diagnostic) -> Result<(), RuntimeError> {
        self.push(ResponseFrame::Error(diagnostic.clone()));
        Ok(())
    }

    async fn send_error(&mut self, diagnostic: &Diagnostic) -> Result<(), RuntimeError> {
        self.push(ResponseFrame::Error(diagnostic.clone()));
        Ok(())
    }
}

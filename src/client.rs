//! Control-plane HTTP client.
//!
//! Owns the single keep-alive HTTP/1.1 connection to the runtime API. The
//! long-poll `next` call, buffered and streamed response POSTs, and error
//! reports all ride on it. At most one invocation is in flight; the client
//! tracks that with an explicit state machine and surfaces misuse as a
//! usage error rather than corrupting the wire.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, TRAILER, TRANSFER_ENCODING, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use crate::context::Invocation;
use crate::diagnostic::{Diagnostic, UNHANDLED_ERROR_TYPE};
use crate::error::{RuntimeError, UsageError};
use crate::protocol::{self, ResponsePrelude};
use crate::runtime::shutdown_requested;
use crate::writer::{ResponseTransport, ResponseWriter};

pub(crate) type ApiBody = BoxBody<Bytes, Infallible>;
type Http = HyperClient<HttpConnector, ApiBody>;

/// Backpressure bound on streamed response chunks in flight.
const BODY_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    FetchingNext,
    Dispatched,
    Reporting,
}

/// Client for the platform control plane.
pub(crate) struct RuntimeApiClient {
    http: Http,
    /// `host:port` (optionally with a path prefix) of the control plane.
    base: String,
    state: Arc<Mutex<ClientState>>,
    shutdown: watch::Receiver<bool>,
}

impl RuntimeApiClient {
    pub(crate) fn new(endpoint: &str, shutdown: watch::Receiver<bool>) -> Self {
        // One idle connection, kept alive forever: the control plane lives
        // on the loopback and reuses a single socket across invocations.
        let http = HyperClient::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(None)
            .build_http();
        let base = endpoint
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            base,
            state: Arc::new(Mutex::new(ClientState::Idle)),
            shutdown,
        }
    }

    /// Long-poll the control plane for the next invocation.
    ///
    /// Blocks until the platform delivers one, a shutdown is requested
    /// (`Cancelled`), or the connection fails. A partially received
    /// response is abandoned along with its connection.
    pub(crate) async fn next_invocation(
        &self,
    ) -> Result<(Invocation, ResponseWriter), RuntimeError> {
        {
            let mut state = self.state.lock();
            if *state != ClientState::Idle {
                return Err(UsageError::InvocationInFlight.into());
            }
            *state = ClientState::FetchingNext;
        }

        let result = self.fetch_next().await;
        match result {
            Ok(invocation) => {
                *self.state.lock() = ClientState::Dispatched;
                trace!(
                    request_id = %invocation.request_id,
                    bytes = invocation.body.len(),
                    "received invocation"
                );
                let transport = HttpResponseTransport {
                    http: self.http.clone(),
                    base: self.base.clone(),
                    state: Arc::clone(&self.state),
                    request_id: invocation.request_id.clone(),
                    stream: None,
                };
                let writer =
                    ResponseWriter::new(invocation.request_id.clone(), Box::new(transport));
                Ok((invocation, writer))
            }
            Err(e) => {
                *self.state.lock() = ClientState::Idle;
                Err(e)
            }
        }
    }

    async fn fetch_next(&self) -> Result<Invocation, RuntimeError> {
        let req = request_builder(&self.base, Method::GET, protocol::next_invocation_path())?
            .body(Empty::new().boxed())
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;

        let shutdown = self.shutdown.clone();
        let response = tokio::select! {
            _ = shutdown_requested(shutdown) => return Err(RuntimeError::Cancelled),
            result = self.http.request(req) => {
                result.map_err(|e| RuntimeError::Transport(e.to_string()))?
            }
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(RuntimeError::Protocol(format!(
                "control plane returned {status} while polling for the next invocation"
            )));
        }

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?
            .to_bytes();
        Invocation::from_response_parts(&parts.headers, body)
    }

    /// POST an invocation error. Never retried; the platform answers 202 at
    /// most once.
    pub(crate) async fn report_error(
        &self,
        request_id: &str,
        diagnostic: &Diagnostic,
    ) -> Result<(), RuntimeError> {
        *self.state.lock() = ClientState::Reporting;
        let result = post_error(
            &self.http,
            &self.base,
            protocol::invocation_error_path(request_id),
            diagnostic,
        )
        .await;
        *self.state.lock() = ClientState::Idle;
        result
    }

    /// POST an initialization error, used before the run-loop starts.
    pub(crate) async fn report_init_error(
        &self,
        diagnostic: &Diagnostic,
    ) -> Result<(), RuntimeError> {
        post_error(
            &self.http,
            &self.base,
            protocol::init_error_path(),
            diagnostic,
        )
        .await
    }
}

fn request_builder(
    base: &str,
    method: Method,
    path: String,
) -> Result<http::request::Builder, RuntimeError> {
    let uri: Uri = format!("http://{base}{path}")
        .parse()
        .map_err(|e| RuntimeError::Protocol(format!("invalid control-plane uri: {e}")))?;
    let host = base.split('/').next().unwrap_or(base).to_string();
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(HOST, host)
        .header(USER_AGENT, protocol::USER_AGENT_VALUE))
}

async fn post_error(
    http: &Http,
    base: &str,
    path: String,
    diagnostic: &Diagnostic,
) -> Result<(), RuntimeError> {
    debug!(error_type = %diagnostic.error_type, "reporting error to control plane");
    let body = diagnostic.to_json()?;
    let req = request_builder(base, Method::POST, path)?
        .header(CONTENT_TYPE, protocol::CONTENT_TYPE_ERROR)
        .header(
            protocol::HEADER_ERROR_TYPE.clone(),
            HeaderValue::from_static(UNHANDLED_ERROR_TYPE),
        )
        .body(Full::new(Bytes::from(body)).boxed())
        .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
    let response = http
        .request(req)
        .await
        .map_err(|e| RuntimeError::Transport(e.to_string()))?;
    expect_accepted(response, "error report").await
}

async fn expect_accepted(
    response: http::Response<hyper::body::Incoming>,
    what: &str,
) -> Result<(), RuntimeError> {
    let status = response.status();
    // Drain the (normally empty) body so the connection returns to the pool.
    let _ = response.into_body().collect().await;
    if status != StatusCode::ACCEPTED {
        return Err(RuntimeError::Protocol(format!(
            "control plane answered {status} to a {what}, expected 202"
        )));
    }
    Ok(())
}

struct StreamingPost {
    frames: mpsc::Sender<Frame<Bytes>>,
    completion: JoinHandle<Result<(), RuntimeError>>,
}

/// Response transport speaking the control-plane wire protocol.
struct HttpResponseTransport {
    http: Http,
    base: String,
    state: Arc<Mutex<ClientState>>,
    request_id: String,
    stream: Option<StreamingPost>,
}

impl HttpResponseTransport {
    fn release(&self) {
        *self.state.lock() = ClientState::Idle;
    }

    async fn close_stream(&mut self) -> Result<(), RuntimeError> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| RuntimeError::Protocol("streamed response never opened".into()))?;
        drop(stream.frames);
        let result = stream
            .completion
            .await
            .map_err(|e| RuntimeError::Transport(format!("response task failed: {e}")))?;
        self.release();
        result
    }
}

#[async_trait::async_trait]
impl ResponseTransport for HttpResponseTransport {
    async fn send_complete(&mut self, body: Option<Bytes>) -> Result<(), RuntimeError> {
        let body = match body {
            Some(bytes) => Full::new(bytes).boxed(),
            None => Empty::new().boxed(),
        };
        let req = request_builder(
            &self.base,
            Method::POST,
            protocol::invocation_response_path(&self.request_id),
        )?
        .header(CONTENT_TYPE, protocol::CONTENT_TYPE_JSON)
        .body(body)
        .map_err(|e| RuntimeError::Protocol(e.to_string()))?;

        let result = match self.http.request(req).await {
            Ok(response) => expect_accepted(response, "buffered response").await,
            Err(e) => Err(RuntimeError::Transport(e.to_string())),
        };
        self.release();
        result
    }

    async fn open_stream(&mut self) -> Result<(), RuntimeError> {
        let (frames, rx) = mpsc::channel::<Frame<Bytes>>(BODY_CHANNEL_CAPACITY);
        let body = {
            use futures_util::StreamExt;
            BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)))
        };

        let req = request_builder(
            &self.base,
            Method::POST,
            protocol::invocation_response_path(&self.request_id),
        )?
        .header(TRANSFER_ENCODING, "chunked")
        .header(CONTENT_TYPE, protocol::CONTENT_TYPE_STREAMING)
        .header(
            protocol::HEADER_RESPONSE_MODE.clone(),
            protocol::RESPONSE_MODE_STREAMING,
        )
        // Mid-stream failures are reported in the trailer section.
        .header(TRAILER, protocol::HEADER_ERROR_TYPE.as_str())
        .header(TRAILER, protocol::HEADER_ERROR_BODY.as_str())
        .body(body)
        .map_err(|e| RuntimeError::Protocol(e.to_string()))?;

        let http = self.http.clone();
        let completion = tokio::spawn(async move {
            match http.request(req).await {
                Ok(response) => expect_accepted(response, "streamed response").await,
                Err(e) => Err(RuntimeError::Transport(e.to_string())),
            }
        });

        self.stream = Some(StreamingPost { frames, completion });
        Ok(())
    }

    async fn send_prelude(&mut self, prelude: &ResponsePrelude) -> Result<(), RuntimeError> {
        let frame = Bytes::from(prelude.to_frame());
        self.send_chunk(frame).await
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), RuntimeError> {
        let sent = match &self.stream {
            Some(stream) => stream.frames.send(Frame::data(chunk)).await.is_ok(),
            None => {
                return Err(RuntimeError::Protocol(
                    "streamed response never opened".into(),
                ))
            }
        };
        if sent {
            return Ok(());
        }
        // The in-flight POST died under us; surface its real error.
        match self.close_stream().await {
            Ok(()) => Err(RuntimeError::Transport(
                "response body channel closed early".into(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn finish_stream(&mut self) -> Result<(), RuntimeError> {
        self.close_stream().await
    }

    async fn abort_stream(&mut self, diagnostic: &Diagnostic) -> Result<(), RuntimeError> {
        if let Some(stream) = &self.stream {
            let mut trailers = HeaderMap::new();
            let error_type = HeaderValue::from_str(&diagnostic.error_type)
                .unwrap_or_else(|_| HeaderValue::from_static(UNHANDLED_ERROR_TYPE));
            trailers.insert(protocol::HEADER_ERROR_TYPE.clone(), error_type);
            if let Ok(body) = diagnostic.to_json() {
                use base64::engine::general_purpose::STANDARD as BASE64;
                use base64::Engine;
                if let Ok(value) = HeaderValue::from_str(&BASE64.encode(body)) {
                    trailers.insert(protocol::HEADER_ERROR_BODY.clone(), value);
                }
            }
            if stream.frames.send(Frame::trailers(trailers)).await.is_err() {
                warn!("streamed response closed before the error trailer was sent");
            }
        }
        self.close_stream().await
    }

    async fn send_error(&mut self, diagnostic: &Diagnostic) -> Result<(), RuntimeError> {
        let result = post_error(
            &self.http,
            &self.base,
            protocol::invocation_error_path(&self.request_id),
            diagnostic,
        )
        .await;
        self.release();
        result
    }
}

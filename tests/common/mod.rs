//! Mock control plane for runtime integration tests.
//!
//! Serves the runtime API over real loopback sockets: queued events are
//! handed out on `next`, every response/error POST is recorded (including
//! chunked bodies and trailers), and accepted TCP connections are counted
//! so tests can assert keep-alive reuse.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;

pub const RUNTIME_PREFIX: &str = "/2018-06-01/runtime";

#[derive(Clone)]
pub struct QueuedEvent {
    pub request_id: String,
    pub deadline_ms: u64,
    pub body: Vec<u8>,
}

impl QueuedEvent {
    pub fn new(request_id: &str, body: &[u8]) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        Self {
            request_id: request_id.to_string(),
            deadline_ms: now + 60_000,
            body: body.to_vec(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordedPost {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub trailers: Option<HeaderMap>,
}

struct Inner {
    events: Mutex<VecDeque<QueuedEvent>>,
    posts: Mutex<Vec<RecordedPost>>,
    connections: AtomicUsize,
    fail_responses: AtomicBool,
}

#[derive(Clone)]
pub struct ControlPlane {
    pub addr: SocketAddr,
    inner: Arc<Inner>,
}

impl ControlPlane {
    /// Bind a mock control plane on an ephemeral loopback port.
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock control plane")?;
        let addr = listener.local_addr().context("mock listener address")?;
        let inner = Arc::new(Inner {
            events: Mutex::new(VecDeque::new()),
            posts: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            fail_responses: AtomicBool::new(false),
        });

        let accept_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_inner.connections.fetch_add(1, Ordering::SeqCst);
                let conn_inner = Arc::clone(&accept_inner);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(Arc::clone(&conn_inner), req));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Ok(Self { addr, inner })
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn push_event(&self, event: QueuedEvent) {
        self.inner.events.lock().push_back(event);
    }

    /// Answer 500 instead of 202 to `/invocation/{id}/response` POSTs, so
    /// tests can drive the undeliverable-response fallback.
    pub fn fail_response_posts(&self) {
        self.inner.fail_responses.store(true, Ordering::SeqCst);
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.inner.posts.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Block until `n` POSTs have been recorded, panicking after a grace
    /// period.
    pub async fn wait_for_posts(&self, n: usize) -> Vec<RecordedPost> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            {
                let posts = self.inner.posts.lock();
                if posts.len() >= n {
                    return posts.clone();
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {n} posts, saw {}",
                    self.inner.posts.lock().len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn handle(
    inner: Arc<Inner>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();

    if req.method() == http::Method::GET && path == format!("{RUNTIME_PREFIX}/invocation/next") {
        let event = inner.events.lock().pop_front();
        return match event {
            Some(event) => Ok(next_response(&event)),
            // Long poll: nothing queued, never answer.
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
    }

    // Everything else is a POST we record verbatim.
    let headers = req.headers().clone();
    let mut body = Vec::new();
    let mut trailers = None;
    let mut incoming = req.into_body();
    while let Some(frame) = incoming.frame().await {
        let frame = frame.expect("read request frame");
        if frame.is_data() {
            body.extend_from_slice(frame.data_ref().unwrap());
        } else if frame.is_trailers() {
            trailers = frame.into_trailers().ok();
        }
    }
    let reject = inner.fail_responses.load(Ordering::SeqCst) && path.ends_with("/response");
    inner.posts.lock().push(RecordedPost {
        path,
        headers,
        body,
        trailers,
    });

    let status = if reject {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::ACCEPTED
    };
    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap())
}

fn next_response(event: &QueuedEvent) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("lambda-runtime-aws-request-id", &event.request_id)
        .header("lambda-runtime-deadline-ms", event.deadline_ms)
        .header(
            "lambda-runtime-invoked-function-arn",
            "arn:aws:lambda:us-east-2:123456789012:function:custom-runtime",
        )
        .header(
            "lambda-runtime-trace-id",
            "Root=1-5bef4de7-ad49b0e87f6ef6c87fc2e700;Parent=9a9197af755a6419",
        )
        .body(Full::new(Bytes::from(event.body.clone())))
        .unwrap()
}

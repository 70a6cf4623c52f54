//! Invocation data and the per-invocation context handed to handlers.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::watch;

use crate::config::FunctionSettings;
use crate::error::RuntimeError;
use crate::protocol;

/// One unit of work delivered by the control plane.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Opaque id, unique per invocation within a process.
    pub request_id: String,
    /// Absolute wall-clock deadline, milliseconds since the UNIX epoch.
    pub deadline_ms: u64,
    pub invoked_function_arn: String,
    pub trace_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Verbatim JSON string, forwarded untouched to the handler.
    pub client_context: Option<String>,
    /// Verbatim JSON string, forwarded untouched to the handler.
    pub cognito_identity: Option<String>,
    pub body: Bytes,
}

impl Invocation {
    /// Decode an invocation from a `next` response. A missing required
    /// header or an empty body is a protocol error.
    pub(crate) fn from_response_parts(headers: &HeaderMap, body: Bytes) -> Result<Self, RuntimeError> {
        let request_id = required_header(headers, &protocol::HEADER_REQUEST_ID)?;
        let deadline_ms = required_header(headers, &protocol::HEADER_DEADLINE_MS)?
            .parse::<u64>()
            .map_err(|e| RuntimeError::Protocol(format!("invalid deadline header: {e}")))?;
        let invoked_function_arn = required_header(headers, &protocol::HEADER_FUNCTION_ARN)?;

        if body.is_empty() {
            return Err(RuntimeError::Protocol(format!(
                "invocation {request_id} arrived without an event body"
            )));
        }

        Ok(Self {
            request_id,
            deadline_ms,
            invoked_function_arn,
            trace_id: optional_header(headers, &protocol::HEADER_TRACE_ID),
            tenant_id: optional_header(headers, &protocol::HEADER_TENANT_ID),
            client_context: optional_header(headers, &protocol::HEADER_CLIENT_CONTEXT),
            cognito_identity: optional_header(headers, &protocol::HEADER_COGNITO_IDENTITY),
            body,
        })
    }
}

fn required_header(headers: &HeaderMap, name: &http::header::HeaderName) -> Result<String, RuntimeError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(str::to_owned)
            .map_err(|_| RuntimeError::Protocol(format!("header {name} is not valid UTF-8"))),
        None => Err(RuntimeError::Protocol(format!("missing {name} header"))),
    }
}

fn optional_header(headers: &HeaderMap, name: &http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-invocation view handed to the handler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: String,
    pub deadline_ms: u64,
    pub invoked_function_arn: String,
    pub trace_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
    settings: Arc<FunctionSettings>,
    shutdown: watch::Receiver<bool>,
}

impl InvocationContext {
    pub(crate) fn new(
        invocation: &Invocation,
        settings: Arc<FunctionSettings>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            request_id: invocation.request_id.clone(),
            deadline_ms: invocation.deadline_ms,
            invoked_function_arn: invocation.invoked_function_arn.clone(),
            trace_id: invocation.trace_id.clone(),
            tenant_id: invocation.tenant_id.clone(),
            client_context: invocation.client_context.clone(),
            cognito_identity: invocation.cognito_identity.clone(),
            settings,
            shutdown,
        }
    }

    /// Sandbox facts read from the environment at startup.
    pub fn function_settings(&self) -> &FunctionSettings {
        &self.settings
    }

    /// Milliseconds until the deadline. Negative once the deadline has
    /// passed; the platform, not the runtime, enforces it.
    pub fn remaining_time_ms(&self) -> i64 {
        self.deadline_ms as i64 - now_ms() as i64
    }

    /// Whether a graceful shutdown has been requested. Long-running
    /// handlers can poll this to wind down early.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

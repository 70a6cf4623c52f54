//! Control-plane wire protocol constants and encodings.
//!
//! The runtime API is versioned under `/2018-06-01/runtime`. Invocation
//! metadata travels in response headers on `next`; streamed responses carry
//! a JSON status/headers prelude terminated by eight NUL bytes, and report
//! mid-stream failures through HTTP/1.1 trailers.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::HeaderName;
use serde::{Deserialize, Serialize};

pub(crate) const API_PREFIX: &str = "/2018-06-01/runtime";

pub(crate) const USER_AGENT_VALUE: &str =
    concat!("lambda-bridge/", env!("CARGO_PKG_VERSION"), " (rust)");

pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";
pub(crate) const CONTENT_TYPE_ERROR: &str = "application/vnd.aws.lambda.error+json";
pub(crate) const CONTENT_TYPE_STREAMING: &str =
    "application/vnd.awslambda.http-integration-response";
pub(crate) const RESPONSE_MODE_STREAMING: &str = "streaming";

/// Separator between the streamed-response prelude and the first body byte.
pub(crate) const PRELUDE_SEPARATOR: [u8; 8] = [0u8; 8];

// Invocation metadata headers on the `next` response.
pub(crate) static HEADER_REQUEST_ID: HeaderName =
    HeaderName::from_static("lambda-runtime-aws-request-id");
pub(crate) static HEADER_DEADLINE_MS: HeaderName =
    HeaderName::from_static("lambda-runtime-deadline-ms");
pub(crate) static HEADER_FUNCTION_ARN: HeaderName =
    HeaderName::from_static("lambda-runtime-invoked-function-arn");
pub(crate) static HEADER_TRACE_ID: HeaderName = HeaderName::from_static("lambda-runtime-trace-id");
pub(crate) static HEADER_TENANT_ID: HeaderName =
    HeaderName::from_static("lambda-runtime-aws-tenant-id");
pub(crate) static HEADER_CLIENT_CONTEXT: HeaderName =
    HeaderName::from_static("lambda-runtime-client-context");
pub(crate) static HEADER_COGNITO_IDENTITY: HeaderName =
    HeaderName::from_static("lambda-runtime-cognito-identity");

// Error reporting headers and trailers.
pub(crate) static HEADER_ERROR_TYPE: HeaderName =
    HeaderName::from_static("lambda-runtime-function-error-type");
pub(crate) static HEADER_ERROR_BODY: HeaderName =
    HeaderName::from_static("lambda-runtime-function-error-body");
pub(crate) static HEADER_RESPONSE_MODE: HeaderName =
    HeaderName::from_static("lambda-runtime-function-response-mode");

pub(crate) fn next_invocation_path() -> String {
    format!("{API_PREFIX}/invocation/next")
}

pub(crate) fn invocation_response_path(request_id: &str) -> String {
    format!("{API_PREFIX}/invocation/{request_id}/response")
}

pub(crate) fn invocation_error_path(request_id: &str) -> String {
    format!("{API_PREFIX}/invocation/{request_id}/error")
}

pub(crate) fn init_error_path() -> String {
    format!("{API_PREFIX}/init/error")
}

/// Status, headers and multi-value headers announced at the start of a
/// streamed response. Serialized as
/// `{"statusCode":N,"headers":{...},"multiValueHeaders":{...}}` followed by
/// the eight-NUL separator; header keys are omitted entirely when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePrelude {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(
        rename = "multiValueHeaders",
        skip_serializing_if = "Option::is_none"
    )]
    pub multi_value_headers: Option<BTreeMap<String, Vec<String>>>,
}

impl ResponsePrelude {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: None,
            multi_value_headers: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn multi_value_header(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.multi_value_headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Wire frame for this prelude: JSON document plus the NUL separator.
    pub(crate) fn to_frame(&self) -> Vec<u8> {
        let mut frame = serde_json::to_vec(self).expect("prelude maps serialize infallibly");
        frame.extend_from_slice(&PRELUDE_SEPARATOR);
        frame
    }
}

impl Default for ResponsePrelude {
    fn default() -> Self {
        Self::new(200)
    }
}

/// Generate a trace id in the platform's format:
/// `1-xxxxxxxx-yyyyyyyyyyyyyyyyyyyyyyyy`, where the first segment encodes
/// the current UNIX time in eight lowercase hex digits and the second is 24
/// lowercase hex digits of randomness.
pub(crate) fn generate_trace_id() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as u32;
    let entropy: u128 = rand::random::<u128>() >> 32;
    format!("1-{seconds:08x}-{entropy:024x}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn paths_are_versioned() {
        assert_eq!(next_invocation_path(), "/2018-06-01/runtime/invocation/next");
        assert_eq!(
            invocation_response_path("abc"),
            "/2018-06-01/runtime/invocation/abc/response"
        );
        assert_eq!(
            invocation_error_path("abc"),
            "/2018-06-01/runtime/invocation/abc/error"
        );
        assert_eq!(init_error_path(), "/2018-06-01/runtime/init/error");
    }

    #[test]
    fn prelude_omits_unset_header_maps() {
        let frame = ResponsePrelude::new(200).to_frame();
        let (json, separator) = frame.split_at(frame.len() - 8);
        assert_eq!(json, br#"{"statusCode":200}"#);
        assert_eq!(separator, &PRELUDE_SEPARATOR);
    }

    #[test]
    fn prelude_carries_headers_and_multi_value_headers() {
        let prelude = ResponsePrelude::new(201)
            .header("Content-Type", "text/plain")
            .header("X-Custom-Header", "streaming-test")
            .multi_value_header("Set-Cookie", ["a=1", "b=2"]);
        let frame = prelude.to_frame();
        let json = std::str::from_utf8(&frame[..frame.len() - 8]).unwrap();
        assert_eq!(
            json,
            r#"{"statusCode":201,"headers":{"Content-Type":"text/plain","X-Custom-Header":"streaming-test"},"multiValueHeaders":{"Set-Cookie":["a=1","b=2"]}}"#
        );
    }

    #[test]
    fn trace_ids_match_the_platform_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 35);
        let segments: Vec<&str> = id.split('-').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], "1");
        assert_eq!(segments[1].len(), 8);
        assert_eq!(segments[2].len(), 24);
        for segment in &segments[1..] {
            assert!(segment.chars().all(|c| c.is_ascii_hexdigit()
                && (c.is_ascii_digit() || c.is_ascii_lowercase())));
        }
    }

    #[test]
    fn trace_ids_are_unique_over_many_draws() {
        let drawn: HashSet<String> = (0..1000).map(|_| generate_trace_id()).collect();
        assert_eq!(drawn.len(), 1000);
    }
}

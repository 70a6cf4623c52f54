//! Runtime error types.
//!
//! Defines the error taxonomy for the runtime client: protocol violations,
//! handler failures, transport faults, API misuse and cooperative
//! cancellation.

use thiserror::Error;

/// Boxed error type carried across the handler seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The control plane violated the wire protocol (missing header, absent
    /// body, unexpected status, malformed envelope). Fatal: the connection
    /// is discarded and the run-loop exits.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The user handler (or an adapter around it) failed. Recovered locally:
    /// reported to the platform, then the loop continues.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// Handler construction failed before the run-loop started.
    #[error("handler initialization failed: {0}")]
    Init(#[source] BoxError),

    /// API misuse. Raised to the caller, never reported to the platform.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// Connect/read/write failure against the control plane.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Cooperative cancellation. Unwinds cleanly without platform
    /// notification.
    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Contract violations of the runtime's own API surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    /// A write was attempted on a finished response writer.
    #[error("write after finish")]
    WriteAfterFinish,

    /// `finish` was called a second time.
    #[error("response already finished")]
    AlreadyFinished,

    /// A status-and-headers prelude was written after body bytes had
    /// already been streamed.
    #[error("status and headers must precede streamed body data")]
    PreludeAfterBody,

    /// `next_invocation` was called while a previous invocation was still
    /// dispatched and unreported.
    #[error("an invocation is already in flight")]
    InvocationInFlight,

    /// Anonymous and per-request consumption were mixed on the same pool.
    #[error("pool consumers mixed anonymous and per-request waiting")]
    MixedWaitingModes,

    /// Two consumers waited for the same request id concurrently.
    #[error("a consumer is already waiting for request {0}")]
    DuplicateRequestIdWait(String),

    /// Two anonymous consumers waited on the same pool concurrently.
    #[error("an anonymous consumer is already waiting on this pool")]
    NextCalledTwice,

    /// A second run-loop was started while one was active in this process.
    #[error("a runtime is already running in this process")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_convert_into_runtime_errors() {
        let err = RuntimeError::from(UsageError::WriteAfterFinish);
        assert!(matches!(err, RuntimeError::Usage(_)));
    }

    #[test]
    fn display_formats_are_stable() {
        assert_eq!(
            UsageError::DuplicateRequestIdWait("abc".into()).to_string(),
            "a consumer is already waiting for request abc"
        );
        assert_eq!(RuntimeError::Cancelled.to_string(), "cancelled by shutdown");
    }
}

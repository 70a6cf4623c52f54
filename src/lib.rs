//! Custom function runtime client for AWS Lambda.
//!
//! The runtime is the long-running process the platform starts inside a
//! sandbox. It long-polls the control plane for invocations over a single
//! keep-alive HTTP/1.1 connection, hands each event to a user-supplied
//! handler, and delivers the result back — buffered in one POST, or
//! streamed with chunked transfer encoding, a status/headers prelude and
//! trailer-based error reporting.
//!
//! Without a control plane (`AWS_LAMBDA_RUNTIME_API` unset), a local
//! development server accepts arbitrary `POST /invoke` requests on a
//! loopback port and feeds them through the very same run-loop.
//!
//! ```ignore
//! use lambda_bridge::{handler_fn, InvocationContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lambda_bridge::RuntimeError> {
//!     lambda_bridge::init_default_tracing();
//!     lambda_bridge::run(handler_fn(greet)).await
//! }
//!
//! async fn greet(
//!     name: String,
//!     _ctx: InvocationContext,
//! ) -> Result<String, lambda_bridge::BoxError> {
//!     Ok(format!("Hello, {name}!"))
//! }
//! ```
//!
//! The returned `Result` should be propagated out of `main` so the process
//! exits non-zero on initialization or protocol failures.

mod client;
mod config;
mod context;
mod diagnostic;
mod error;
mod handler;
mod local;
mod protocol;
mod runtime;
mod writer;

pub use config::{init_default_tracing, Config, FunctionSettings, RuntimeMode, DEFAULT_LOCAL_PORT};
pub use context::{Invocation, InvocationContext};
pub use diagnostic::Diagnostic;
pub use error::{BoxError, RuntimeError, RuntimeResult, UsageError};
pub use handler::{
    buffered, handler_fn, streaming_handler_fn, Buffered, Handler, HandlerFn, HandlerFuture,
    StreamingHandler, StreamingHandlerFn,
};
pub use protocol::ResponsePrelude;
pub use runtime::{Runtime, ShutdownHandle};
pub use writer::{ResponseMode, ResponseWriter};

/// Run the runtime with an already-constructed handler, configured from the
/// process environment.
pub async fn run<H: StreamingHandler>(handler: H) -> Result<(), RuntimeError> {
    Runtime::from_env().run(handler).await
}

/// Construct the handler asynchronously, then run. A construction failure
/// is reported to the platform as an initialization error before the error
/// is returned.
pub async fn run_with_init<F, Fut, H>(init: F) -> Result<(), RuntimeError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<H, BoxError>>,
    H: StreamingHandler,
{
    Runtime::from_env().run_with_init(init).await
}

//! The run-loop.
//!
//! One process runs at most one loop: fetch an invocation, build its
//! context, hand it to the handler under a request-id span, then make sure
//! exactly one completion or error report reaches the platform before the
//! next fetch. Shutdown is cooperative: a pending long poll is cancelled
//! promptly, a running handler is awaited to completion.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

use crate::client::RuntimeApiClient;
use crate::config::{Config, FunctionSettings, RuntimeMode};
use crate::context::{Invocation, InvocationContext};
use crate::diagnostic::Diagnostic;
use crate::error::{BoxError, RuntimeError, UsageError};
use crate::handler::StreamingHandler;
use crate::writer::{ResponseMode, ResponseWriter};

const ENV_TRACE_ID: &str = "_X_AMZN_TRACE_ID";

/// Delay before re-polling after a transport failure, so a dead control
/// plane does not spin the loop.
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_millis(50);

static RUNTIME_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Process-wide one-runtime guard, cleared on drop.
#[derive(Debug)]
struct RuntimeGuard;

impl RuntimeGuard {
    fn acquire() -> Result<Self, RuntimeError> {
        if RUNTIME_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(Self)
        } else {
            Err(UsageError::AlreadyRunning.into())
        }
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        RUNTIME_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Resolves once a shutdown has been requested. Never resolves if the
/// shutdown channel disappears while its runtime is still polling.
pub(crate) async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Where invocations come from and where their outcomes are reported.
/// Implemented by the control-plane client and by the local development
/// server, so the run-loop cannot tell them apart.
#[async_trait]
pub(crate) trait InvocationSource: Send + Sync {
    async fn next_invocation(&self) -> Result<(Invocation, ResponseWriter), RuntimeError>;

    async fn report_error(
        &self,
        request_id: &str,
        diagnostic: &Diagnostic,
    ) -> Result<(), RuntimeError>;

    async fn report_init_error(&self, diagnostic: &Diagnostic) -> Result<(), RuntimeError>;
}

#[async_trait]
impl InvocationSource for RuntimeApiClient {
    async fn next_invocation(&self) -> Result<(Invocation, ResponseWriter), RuntimeError> {
        RuntimeApiClient::next_invocation(self).await
    }

    async fn report_error(
        &self,
        request_id: &str,
        diagnostic: &Diagnostic,
    ) -> Result<(), RuntimeError> {
        RuntimeApiClient::report_error(self, request_id, diagnostic).await
    }

    async fn report_init_error(&self, diagnostic: &Diagnostic) -> Result<(), RuntimeError> {
        RuntimeApiClient::report_init_error(self, diagnostic).await
    }
}

/// Programmatic trigger for graceful shutdown, equivalent to SIGTERM.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The runtime: configuration plus the shutdown channel. Consumed by
/// [`Runtime::run`].
pub struct Runtime {
    config: Config,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            config,
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    pub fn from_env() -> Self {
        Self::new(Config::from_env())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run the loop with an already-constructed handler.
    pub async fn run<H: StreamingHandler>(self, handler: H) -> Result<(), RuntimeError> {
        self.run_with_init(|| async move { Ok(handler) }).await
    }

    /// Construct the handler, then run the loop. A construction failure is
    /// reported to the platform as an init error and returned, so the
    /// process exits non-zero.
    pub async fn run_with_init<F, Fut, H>(self, init: F) -> Result<(), RuntimeError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<H, BoxError>>,
        H: StreamingHandler,
    {
        let _guard = RuntimeGuard::acquire()?;
        spawn_signal_listener(Arc::clone(&self.shutdown_tx));

        match &self.config.mode {
            RuntimeMode::ControlPlane(endpoint) => {
                let client = RuntimeApiClient::new(endpoint, self.shutdown_rx.clone());
                let handler = match init().await {
                    Ok(handler) => handler,
                    Err(init_err) => {
                        let diagnostic = Diagnostic::from_handler_error(&init_err);
                        error!(error = %init_err, "handler construction failed");
                        if let Err(report_err) = client.report_init_error(&diagnostic).await {
                            warn!(error = %report_err, "could not report init error");
                        }
                        return Err(RuntimeError::Init(init_err));
                    }
                };
                event_loop(
                    &client,
                    &handler,
                    Arc::clone(&self.config.settings),
                    self.shutdown_rx.clone(),
                )
                .await
            }
            RuntimeMode::Local(port) => {
                crate::local::run_local(
                    *port,
                    Arc::clone(&self.config.settings),
                    self.shutdown_rx.clone(),
                    init,
                )
                .await
            }
        }
    }
}

/// Fan SIGTERM/SIGINT into the shutdown flag.
fn spawn_signal_listener(shutdown: Arc<watch::Sender<bool>>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        let _ = shutdown.send(true);
    });
}

/// The sequential next → handle → report cycle shared by the control-plane
/// and local-server paths.
pub(crate) async fn event_loop<S, H>(
    source: &S,
    handler: &H,
    settings: Arc<FunctionSettings>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), RuntimeError>
where
    S: InvocationSource + ?Sized,
    H: StreamingHandler + ?Sized,
{
    info!("runtime started, polling for invocations");
    loop {
        if *shutdown_rx.borrow() {
            info!("shutdown requested, runtime exiting");
            return Ok(());
        }

        let (invocation, mut writer) = match source.next_invocation().await {
            Ok(pair) => pair,
            Err(RuntimeError::Cancelled) => {
                info!("shutdown requested while polling, runtime exiting");
                return Ok(());
            }
            Err(e @ RuntimeError::Transport(_)) => {
                warn!(error = %e, "transport failure while polling, reconnecting");
                tokio::time::sleep(TRANSPORT_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "unrecoverable failure while polling");
                return Err(e);
            }
        };

        match &invocation.trace_id {
            Some(trace_id) => env::set_var(ENV_TRACE_ID, trace_id),
            None => env::remove_var(ENV_TRACE_ID),
        }

        let ctx = InvocationContext::new(&invocation, Arc::clone(&settings), shutdown_rx.clone());
        let span = tracing::info_span!("invocation", aws_request_id = %invocation.request_id);
        let outcome = handler
            .handle(invocation.body.clone(), &mut writer, &ctx)
            .instrument(span)
            .await;

        match outcome {
            Ok(()) => match writer.mode() {
                ResponseMode::Finished | ResponseMode::Errored => {}
                _ => {
                    if let Err(e) = writer.finish().await {
                        warn!(
                            request_id = %invocation.request_id,
                            error = %e,
                            "failed to deliver response"
                        );
                        best_effort_report(source, &invocation.request_id, &e).await;
                    }
                }
            },
            Err(handler_err) => {
                let diagnostic = Diagnostic::from_handler_error(&handler_err);
                warn!(
                    request_id = %invocation.request_id,
                    error = %handler_err,
                    "handler failed"
                );
                match writer.mode() {
                    // The response was already fully delivered; reporting an
                    // error on top would violate the one-outcome rule.
                    ResponseMode::Finished => {
                        warn!(
                            request_id = %invocation.request_id,
                            "handler failed after finishing its response"
                        );
                    }
                    ResponseMode::Errored => {}
                    _ => {
                        if let Err(e) = writer.report_error(&diagnostic).await {
                            warn!(
                                request_id = %invocation.request_id,
                                error = %e,
                                "could not report handler error"
                            );
                        }
                    }
                }
            }
        }
    }
}

// Shutdown never interrupts delivery or reporting, so an undeliverable
// response is always a transport-class failure.
async fn best_effort_report<S: InvocationSource + ?Sized>(
    source: &S,
    request_id: &str,
    err: &RuntimeError,
) {
    let diagnostic = Diagnostic::new("Runtime.Transport", err.to_string());
    if let Err(report_err) = source.report_error(request_id, &diagnostic).await {
        warn!(request_id, error = %report_err, "best-effort error report failed");
    }
}

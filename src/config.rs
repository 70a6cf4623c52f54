//! Environment-derived configuration.
//!
//! The platform communicates everything the runtime needs through process
//! environment variables. Local development mode is selected when the
//! control-plane endpoint variable is absent.

use std::env;
use std::sync::Arc;

/// Name of the variable carrying the `host:port` of the control plane.
pub const ENV_RUNTIME_API: &str = "AWS_LAMBDA_RUNTIME_API";
/// Name of the variable selecting the local development server port.
pub const ENV_LOCAL_PORT: &str = "LOCAL_LAMBDA_PORT";
/// Logger verbosity when `RUST_LOG` is not set.
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

const ENV_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";
const ENV_FUNCTION_VERSION: &str = "AWS_LAMBDA_FUNCTION_VERSION";
const ENV_FUNCTION_MEMORY: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
const ENV_LOG_GROUP: &str = "AWS_LAMBDA_LOG_GROUP_NAME";
const ENV_LOG_STREAM: &str = "AWS_LAMBDA_LOG_STREAM_NAME";
const ENV_REGION: &str = "AWS_REGION";

/// Default local development server port when none is configured.
pub const DEFAULT_LOCAL_PORT: u16 = 7000;

/// Where invocations come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeMode {
    /// The platform control plane at `host:port`.
    ControlPlane(String),
    /// The local development server on a loopback port.
    Local(u16),
}

/// Static sandbox facts surfaced on every invocation context.
#[derive(Debug, Clone, Default)]
pub struct FunctionSettings {
    pub function_name: String,
    pub function_version: String,
    pub memory_size_mb: u32,
    pub log_group_name: String,
    pub log_stream_name: String,
    pub region: Option<String>,
}

impl FunctionSettings {
    pub fn from_env() -> Self {
        Self {
            function_name: env::var(ENV_FUNCTION_NAME).unwrap_or_default(),
            function_version: env::var(ENV_FUNCTION_VERSION).unwrap_or_default(),
            memory_size_mb: env::var(ENV_FUNCTION_MEMORY)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(128),
            log_group_name: env::var(ENV_LOG_GROUP).unwrap_or_default(),
            log_stream_name: env::var(ENV_LOG_STREAM).unwrap_or_default(),
            region: env::var(ENV_REGION).ok(),
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: RuntimeMode,
    pub settings: Arc<FunctionSettings>,
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// The control plane wins whenever `AWS_LAMBDA_RUNTIME_API` is set;
    /// otherwise the local development server is selected, on
    /// `LOCAL_LAMBDA_PORT` or the default port.
    pub fn from_env() -> Self {
        let mode = match env::var(ENV_RUNTIME_API) {
            Ok(endpoint) if !endpoint.is_empty() => RuntimeMode::ControlPlane(endpoint),
            _ => {
                let port = env::var(ENV_LOCAL_PORT)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_LOCAL_PORT);
                RuntimeMode::Local(port)
            }
        };
        Self {
            mode,
            settings: Arc::new(FunctionSettings::from_env()),
        }
    }

    pub fn control_plane(endpoint: impl Into<String>) -> Self {
        Self {
            mode: RuntimeMode::ControlPlane(endpoint.into()),
            settings: Arc::new(FunctionSettings::from_env()),
        }
    }

    pub fn local(port: u16) -> Self {
        Self {
            mode: RuntimeMode::Local(port),
            settings: Arc::new(FunctionSettings::from_env()),
        }
    }
}

/// Install a default `tracing` subscriber for binaries that do not bring
/// their own. `RUST_LOG` takes precedence; `LOG_LEVEL` seeds the filter
/// otherwise. Safe to call more than once; later calls are no-ops.
pub fn init_default_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = match env::var("RUST_LOG") {
        Ok(spec) => EnvFilter::new(spec),
        Err(_) => {
            let level = env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string());
            EnvFilter::new(level)
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn control_plane_endpoint_wins_over_local_port() {
        env::set_var(ENV_RUNTIME_API, "127.0.0.1:9001");
        env::set_var(ENV_LOCAL_PORT, "7100");
        let config = Config::from_env();
        assert_eq!(
            config.mode,
            RuntimeMode::ControlPlane("127.0.0.1:9001".to_string())
        );
        env::remove_var(ENV_RUNTIME_API);
        env::remove_var(ENV_LOCAL_PORT);
    }

    #[test]
    #[serial]
    fn local_mode_defaults_to_port_7000() {
        env::remove_var(ENV_RUNTIME_API);
        env::remove_var(ENV_LOCAL_PORT);
        let config = Config::from_env();
        assert_eq!(config.mode, RuntimeMode::Local(DEFAULT_LOCAL_PORT));
    }

    #[test]
    #[serial]
    fn local_port_is_honored_when_control_plane_is_absent() {
        env::remove_var(ENV_RUNTIME_API);
        env::set_var(ENV_LOCAL_PORT, "7123");
        let config = Config::from_env();
        assert_eq!(config.mode, RuntimeMode::Local(7123));
        env::remove_var(ENV_LOCAL_PORT);
    }

    #[test]
    #[serial]
    fn function_settings_fall_back_to_defaults() {
        env::remove_var(ENV_FUNCTION_NAME);
        env::remove_var(ENV_FUNCTION_MEMORY);
        let settings = FunctionSettings::from_env();
        assert_eq!(settings.function_name, "");
        assert_eq!(settings.memory_size_mb, 128);
    }
}

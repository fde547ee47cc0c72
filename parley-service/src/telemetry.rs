//! Tracing Initialization
//!
//! Installs a `tracing-subscriber` registry with an env-driven filter and a
//! JSON formatting layer. Service metadata is attached to a root span so
//! every event carries it.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `PARLEY_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "parley=info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `parley=debug,tokio_postgres=warn`
    pub log_filter: String,
    /// Service name attached to every event
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            service_name: "parley".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_filter: std::env::var("PARLEY_LOG").unwrap_or(defaults.log_filter),
            service_name: std::env::var("PARLEY_SERVICE_NAME").unwrap_or(defaults.service_name),
            environment: std::env::var("PARLEY_ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Parse the configured filter.
    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        EnvFilter::try_new(&self.log_filter).map_err(|e| TelemetryError::InvalidFilter {
            filter: self.log_filter.clone(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Install the global subscriber.
///
/// Call once at startup. Returns the root span carrying service metadata;
/// enter it for the lifetime of the process.
pub fn init_tracing(config: &TelemetryConfig) -> Result<tracing::Span, TelemetryError> {
    let filter = config.env_filter()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_current_span(true).with_target(true))
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    let root = tracing::info_span!(
        "parley",
        service = %config.service_name,
        environment = %config.environment,
    );
    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        filter = %config.log_filter,
        "Tracing initialized"
    );
    Ok(root)
}

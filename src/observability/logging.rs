use std::time::Duration;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::context::ClientIdentity;
use crate::proxy::CacheStatus;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("Invalid log level {:?}: {}", config.level, e))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

/// One access record per request; the enclosing request span carries the
/// correlation id
pub fn log_access(
    method: &Method,
    path: &str,
    status: StatusCode,
    elapsed: Duration,
    client: &ClientIdentity,
    cache: Option<CacheStatus>,
) {
    let duration_ms = elapsed.as_millis() as u64;
    let cache = cache.map(|status| status.as_header()).unwrap_or("-");

    // upstream failures are expected traffic; only internal faults log at error
    if status.is_server_error() {
        warn!(
            target: "access",
            %method, path, status = status.as_u16(), duration_ms, %client, cache,
            "request completed"
        );
    } else {
        info!(
            target: "access",
            %method, path, status = status.as_u16(), duration_ms, %client, cache,
            "request completed"
        );
    }
}

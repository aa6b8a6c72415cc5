use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod clock;
mod config;
mod context;
mod error;
mod guard;
mod health;
mod observability;
mod proxy;

use clock::SystemClock;
use config::Config;
use health::HealthChecker;
use observability::MetricsCollector;
use proxy::Gateway;

#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(about = "API gateway: authentication, rate limiting, caching and proxying for backend services")]
struct Args {
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(&args.config).await?;
    observability::init_tracing(&config.logging)?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting API gateway");

    let metrics_task = if config.metrics.enabled {
        let metrics_collector = Arc::new(MetricsCollector::new(&config.metrics)?);
        Some(tokio::spawn(async move {
            if let Err(e) = metrics_collector.start_server().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let gateway = Arc::new(Gateway::new(&config, SystemClock::shared())?);
    let maintenance = gateway.spawn_maintenance();

    let health_task = if config.health_check.enabled {
        let checker = Arc::new(HealthChecker::new(&config.health_check, gateway.registry())?);
        Some(checker.spawn())
    } else {
        None
    };

    let server_task = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway.serve().await {
                error!("Server error: {:#}", e);
            }
        })
    };

    info!(
        "API gateway started on {}:{} with {} routes",
        config.server.host,
        config.server.port,
        config.proxy.routes.len()
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Main server task exited unexpectedly");
        }
    }

    for handle in maintenance {
        handle.abort();
    }
    if let Some(health_task) = health_task {
        health_task.abort();
    }
    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    info!("API gateway shutdown complete");
    Ok(())
}

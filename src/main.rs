use printer_link::api::{self, ApiState};
use printer_link::broadcast::BroadcastHub;
use printer_link::config::LinkConfig;
use printer_link::PrinterLink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging with structured output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("Printer Link Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    let config_path = std::env::var_os("PRINTER_LINK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(LinkConfig::default_path);

    let config = match LinkConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Database at: {:?}", config.database_path());

    let link = match PrinterLink::from_config(config, BroadcastHub::new()).await {
        Ok(link) => Arc::new(link),
        Err(e) => {
            error!("Failed to initialize printer link: {}", e);
            std::process::exit(1);
        }
    };
    link.start();

    if let Some(addr) = link.config().api_bind.clone() {
        let api_state = ApiState {
            link: link.clone(),
            start_time: Instant::now(),
        };

        tokio::spawn(async move {
            if let Err(e) = api::start_api_server(&addr, api_state).await {
                error!("Failed to start HTTP API server: {}", e);
            }
        });
    }

    info!("Background services initialized");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down...");
    link.shutdown().await;
}

//! hopline forward
//!
//! Accepts TCP connections and relays each one to a target chosen from the
//! configured hop, or to the sniffed HTTP host when no hop is configured.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use hopline_chain::{DirectRouter, HostMapper, Hop};
use hopline_forward::config::DEFAULT_REGISTRY_NAME;
use hopline_forward::{new_handler, Config, HandlerOptions, Listener, ListenerConfig};
use hopline_registry::{hop_registry, hosts_registry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOPLINE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hopline forward");
    info!(
        listen_addr = %config.listen_addr,
        handler = %config.handler,
        max_connections = config.max_connections,
        config_file = ?config.config_file,
        "Configuration loaded"
    );

    let file = config.load_file()?;

    if let Some(hosts) = file.build_hosts() {
        info!(entries = hosts.len(), "Registering hosts table");
        hosts_registry()
            .register(DEFAULT_REGISTRY_NAME, Arc::new(hosts))
            .context("Failed to register hosts table")?;
    }
    let mut router = DirectRouter::new().with_timeout(file.dial_timeout());
    if let Some(hosts) = hosts_registry().binding(DEFAULT_REGISTRY_NAME) {
        let hosts: Arc<dyn HostMapper> = Arc::new(hosts);
        router = router.with_hosts(hosts);
    }

    let mut options = HandlerOptions::new(Arc::new(router));
    if let Some(limiter) = file.build_rate_limiter()? {
        options = options.with_rate_limiter(Arc::new(limiter));
    }

    let mut handler = new_handler(&config.handler, options)
        .ok_or_else(|| anyhow!("Unknown handler: {}", config.handler))?;
    handler
        .init(&file.handler.metadata)
        .context("Failed to initialize handler")?;

    if let Some(hop) = file.build_hop()? {
        let name = hop.name().to_string();
        info!(hop = %name, nodes = hop.nodes().len(), "Registering hop");
        hop_registry()
            .register(&name, Arc::new(hop))
            .context("Failed to register hop")?;

        match (handler.as_forwarder(), hop_registry().binding(&name)) {
            (Some(forwarder), Some(binding)) => {
                let hop: Arc<dyn Hop> = Arc::new(binding);
                forwarder.forward(hop);
            }
            _ => info!(handler = %config.handler, "Handler does not forward through a hop"),
        }
    }

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = match Listener::bind(listener_config, Arc::from(handler)).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
        }
        shutdown.cancel();
    });

    listener.run(token).await?;
    info!("Stopped hopline forward");
    Ok(())
}

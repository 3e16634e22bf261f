//! netconfd - NETCONF server
//!
//! Serves NETCONF over plain TCP backed by an in-memory datastore.

use netconf_protocol::xml::Element;
use netconf_server::broadcast::match_namespaces;
use netconf_server::metrics::run_metrics_server;
use netconf_server::{standard_registry, Config, MemoryDatastore, Metrics, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if NETCONFD_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("NETCONFD_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting netconfd");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Features: {}", config.capabilities.features.join(", "));
    tracing::info!(
        "  Chunk size: {}{}",
        config.framing.max_chunk_size,
        if config.framing.randomize_chunks { " (randomized)" } else { "" }
    );

    // Initial datastore contents
    let mut datastore = match config.datastore.initial_config {
        Some(ref path) => {
            let xml = std::fs::read_to_string(path)?;
            let root = Element::parse(&xml)?;
            tracing::info!("  Initial config: {}", path.display());
            MemoryDatastore::with_config(&root)
        }
        None => MemoryDatastore::new(),
    };
    for (element, key) in &config.datastore.list_keys {
        datastore = datastore.with_list_key(element.clone(), key.clone());
    }

    let (metrics_shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut server_config = ServerConfig::from_config(&config);
    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
        tracing::info!("  Metrics: enabled on {}", addr);
    } else {
        tracing::info!("  Metrics: disabled");
    }

    let registry = standard_registry(Some(&config.capabilities.features))?;
    let server = Server::new(server_config, registry, Arc::new(datastore))?;
    for stream in &config.notifications.streams {
        server.register_stream(
            stream.name.clone(),
            match_namespaces(stream.namespaces.clone()),
            stream.replay,
        );
        tracing::info!(
            "  Stream '{}'{}",
            stream.name,
            if stream.replay { " (replay)" } else { "" }
        );
    }
    for capability in server.hello_capabilities() {
        tracing::debug!("  Capability: {}", capability);
    }
    let server = Arc::new(server);

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        let _ = metrics_shutdown_tx.send(());
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

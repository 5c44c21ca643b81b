use anyhow::{Context, Result};
use chrono::Duration;
use spikelink::api::{create_link_router, AppState};
use spikelink::config::{load_config, Secrets, SpikelinkConfig};
use spikelink::credentials::SecretBox;
use spikelink::handshake::{HandshakeReceiver, LogNotifier};
use spikelink::riot::RiotClient;
use spikelink::store::LinkStore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spikelink=info".into()),
        )
        .init();

    info!("Spikelink starting...");

    let config_path =
        std::env::var("SPIKELINK_CONFIG").unwrap_or_else(|_| "spikelink.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        load_config(&config_path)?
    } else {
        info!(path = %config_path, "No config file, using defaults");
        SpikelinkConfig::default()
    };

    let secrets = Secrets::from_env()?;

    info!(
        bind_addr = %config.server.bind_addr,
        database = %config.database.path,
        auth_domain = %config.link.auth_domain,
        "Configuration loaded"
    );

    let store = Arc::new(
        LinkStore::new(
            &config.database.path,
            Duration::minutes(config.link.challenge_ttl_minutes),
        )
        .context("Failed to initialize link store")?,
    );
    info!("Link store initialized");

    let secret_box =
        SecretBox::from_key(&secrets.encryption_key).context("Failed to load encryption key")?;

    let provider = Arc::new(RiotClient::new(reqwest::Client::new()));

    let receiver = Arc::new(HandshakeReceiver::new(
        Arc::clone(&store),
        secret_box,
        provider,
        Arc::new(LogNotifier),
        secrets.hmac_secret.clone(),
    ));

    let router = create_link_router(AppState {
        store,
        receiver,
        link: config.link.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .context("Failed to bind API address")?;
    info!(addr = %config.server.bind_addr, "Link API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("Spikelink stopped");

    Ok(())
}

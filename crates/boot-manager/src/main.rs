//! Boot Manager Service
//!
//! Wires the host adapters, the client registry and the HTTP API together.

use anyhow::{Context, Result};
use boot_manager::{create_router, AppState, Config};
use host_utils::{DhcpdConfig, HostExecutor, HostNetwork, TargetCli, Zfs};
use provisioner::{open_store, Collaborators, Provisioner};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "boot_manager=debug,provisioner=debug,host_utils=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Boot Manager Service");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!("ZFS pool: {}", config.zfs_pool);
    info!("Registry: {}", config.registry_url);
    info!("Lease layout: {:?}", config.lease_layout());

    // Host adapters
    let executor = HostExecutor::new(config.sudo_path.clone(), config.command_timeout).as_executor();
    let leases = DhcpdConfig::new(executor.clone(), config.dhcp_service.clone())
        .with_prune_empty_files(config.dhcp_include_dir.is_some())
        .into_service();
    let hosts = Collaborators {
        volumes: Zfs::new(executor.clone()),
        targets: TargetCli::new(executor.clone()),
        leases,
        network: HostNetwork::new(executor, config.remote_user.clone()),
    };

    // Initialize registry
    let store = open_store(&config.registry_url)
        .await
        .context("Failed to open client registry")?;

    // Create application state
    let provisioner = Provisioner::new(config.provisioner_config(), hosts, store);
    let state = AppState::new(provisioner);

    // Create router
    let app = create_router(state);

    // Start server
    let listener = TcpListener::bind(&config.api_address())
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_address()))?;

    info!("Boot Manager listening on {}", config.api_address());
    info!("Health check: http://{}/health", config.api_address());

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}

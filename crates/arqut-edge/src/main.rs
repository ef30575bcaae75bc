//! Arqut edge agent entry point: wires the catalog, service manager,
//! signaling client, sync coordinator and tunnel coordinator together
//! and runs until interrupted.

mod config;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use arqut_api::AppState;
use arqut_proxy::{PortAllocator, ServiceManager};
use arqut_signaling::SignalingClient;
use arqut_store::ServiceCatalog;
use arqut_sync::SyncCoordinator;
use arqut_tunnel::{InterfaceSink, TunnelCoordinator};

use config::Config;

/// Adapter feeding tunnel interfaces into the service manager.
struct ManagerSink(ServiceManager);

#[async_trait::async_trait]
impl InterfaceSink for ManagerSink {
    async fn set_interface_ips(&self, ips: HashMap<String, String>) {
        self.0.set_interface_ips(ips).await;
    }

    async fn add_interface(&self, name: &str, ip: &str) {
        self.0.add_interface(name, ip).await;
    }

    async fn remove_interface(&self, name: &str) {
        self.0.remove_interface(name).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load()?;
    init_tracing(&cfg.log_level);

    info!("starting Arqut edge agent");
    info!(edge_id = %cfg.edge_id, api_key = %cfg.masked_api_key(), addr = %cfg.server_addr, "configuration loaded");

    // The catalog is the only persistent state.
    if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory for {}", cfg.db_path))?;
    }
    let db = arqut_store::open(&cfg.db_path)
        .await
        .context("failed to open catalog database")?;
    let catalog = ServiceCatalog::new(db);

    let manager = ServiceManager::new(
        catalog.clone(),
        PortAllocator::default(),
        cfg.server_addr.port(),
    );

    // Cloud connectivity is optional; everything signaling-dependent is
    // only wired when a cloud URL is configured.
    let mut signaling: Option<SignalingClient> = None;
    let mut tunnels: Option<TunnelCoordinator> = None;
    if let Some(cloud_url) = &cfg.cloud_url {
        let client = SignalingClient::new(cloud_url, "localhost", cfg.server_addr.port());

        let sync = SyncCoordinator::new(catalog.clone(), client.clone());
        sync.register();
        manager.set_sync(sync);

        let coordinator = TunnelCoordinator::new(&cfg.edge_id, client.clone()).await;
        coordinator.register();
        coordinator
            .set_interface_sink(Arc::new(ManagerSink(manager.clone())))
            .await;

        client.connect(&cfg.edge_id, &cfg.api_key).await;
        info!(cloud = %cloud_url, "signaling client started");

        signaling = Some(client);
        tunnels = Some(coordinator);
    } else {
        info!("ARQUT_CLOUD_URL not configured, running without cloud connectivity");
    }

    manager.start().await.context("failed to start proxy")?;

    let shutdown = CancellationToken::new();
    let api_state = Arc::new(AppState {
        manager: manager.clone(),
        tunnels: tunnels.clone(),
    });
    let api_task = tokio::spawn(arqut_api::serve(
        cfg.server_addr,
        api_state,
        shutdown.clone(),
    ));

    wait_for_shutdown().await;
    info!("shutting down");

    shutdown.cancel();
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "API server error"),
        Err(err) => warn!(error = %err, "API server task failed"),
    }

    if let Some(coordinator) = tunnels {
        coordinator.stop().await;
    }
    if let Some(client) = signaling {
        client.close().await;
    }
    manager.stop().await;

    info!("edge agent stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
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
}

use clustergate::admin::{AdminApi, PKG_NAME, VERSION};
use clustergate::config::Config;
use clustergate::discovery::InClusterSource;
use clustergate::factory::{FactoryConfig, ProxyFactory};
use clustergate::oidc::AuthFlowBroker;
use clustergate::plugins::{watch_plugin_dir, PluginSignal};
use clustergate::proxy::{ClusterRouter, ExternalProxy, ProxyAllowList};
use clustergate::registry::ProxyRegistry;
use clustergate::server::{Gateway, GatewayServer};
use clustergate::tunnel::TunnelManager;
use clustergate::workload::KubeConnector;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clustergate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("clustergate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = ProxyRegistry::new(ProxyFactory::new(FactoryConfig {
        connect_timeout: config.server.connect_timeout(),
    }));

    let loaded = registry.add_all(config.static_targets().into_iter().map(|(_, target)| target));
    info!(count = loaded, "Static clusters registered");

    if config.server.in_cluster {
        match InClusterSource::from_env().discover(config.oidc.clone()) {
            Ok(target) => {
                if let Err(e) = registry.add(target) {
                    error!(error = %e, "Failed to register in-cluster target");
                }
            }
            Err(e) => error!(error = %e, "In-cluster discovery failed"),
        }
    }

    if registry.is_empty() && !config.server.dynamic_clusters_allowed() {
        warn!("No clusters configured and dynamic clusters are disabled");
    }

    let plugins = PluginSignal::new();
    let plugin_handle = config.server.plugin_dir.clone().map(|dir| {
        tokio::spawn(watch_plugin_dir(
            dir,
            config.server.plugin_poll_interval(),
            Arc::clone(&plugins),
            shutdown_rx.clone(),
        ))
    });

    let tunnels = TunnelManager::new(
        Arc::clone(&registry),
        Arc::new(KubeConnector),
        &config.tunnels,
    );

    let auth = AuthFlowBroker::new(
        Arc::clone(&registry),
        config.oidc.clone(),
        config.server.insecure,
        config.server.dev_mode,
        &config.server.base_url,
    )?;

    let allow_list = ProxyAllowList::new(&config.server.external_proxy_urls)?;
    let external = ExternalProxy::new(
        allow_list,
        config.server.insecure,
        config.server.connect_timeout(),
    )?;

    let gateway = Arc::new(Gateway::new(
        ClusterRouter::new(Arc::clone(&registry), Arc::clone(&plugins)),
        AdminApi::new(
            Arc::clone(&registry),
            Arc::clone(&tunnels),
            auth,
            &config.server.base_url,
            config.server.dynamic_clusters_allowed(),
        ),
        external,
        &config.server.base_url,
        config.server.dev_mode,
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let server = GatewayServer::bind(addr, gateway, shutdown_rx.clone()).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading clusters...");
                    reload_clusters(&config_path, &registry);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping port-forwards...");
    tunnels.shutdown();

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = plugin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Re-read the configuration file and re-apply its static clusters
fn reload_clusters(config_path: &Path, registry: &ProxyRegistry) {
    match Config::load(config_path) {
        Ok(config) => {
            let result = registry.sync_static(config.static_targets());
            info!(
                added = result.added.len(),
                removed = result.removed.len(),
                updated = result.updated.len(),
                failed = result.failed.len(),
                "Clusters reloaded"
            );
            if !result.added.is_empty() {
                info!(clusters = ?result.added, "New clusters available");
            }
            if !result.removed.is_empty() {
                info!(clusters = ?result.removed, "Clusters removed");
            }
            if !result.failed.is_empty() {
                warn!(clusters = ?result.failed, "Kept previous definition for rejected clusters");
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting cluster gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        base_url = %config.server.base_url,
        dev_mode = config.server.dev_mode,
        insecure = config.server.insecure,
        "Server configuration"
    );
    info!(
        in_cluster = config.server.in_cluster,
        dynamic_clusters = config.server.dynamic_clusters_allowed(),
        external_proxy_patterns = config.server.external_proxy_urls.len(),
        "Cluster sources"
    );
    info!(
        watchdog_interval_secs = config.tunnels.watchdog_interval_secs,
        ready_timeout_secs = config.tunnels.ready_timeout_secs,
        "Port-forward settings"
    );
    info!(
        cluster_count = config.clusters.len(),
        clusters = ?config.clusters.keys().collect::<Vec<_>>(),
        "Configured clusters"
    );
}

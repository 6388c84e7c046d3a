use appgate::admin::{PKG_NAME, VERSION};
use appgate::config::Config;
use appgate::discovery::DiscoveryService;
use appgate::pool::PoolConfig;
use appgate::ports::{assign_ports, PortScanner};
use appgate::process::LocalSupervisor;
use appgate::proxy::{Gateway, GatewayServer, GatewaySettings};
use appgate::registration::Registrar;
use appgate::registry::AppRegistry;
use appgate::router::RouteTable;
use appgate::supervisor::StatusCache;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("appgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("appgate.toml"));

    let mut config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env_overrides().map_err(|e| {
        error!(error = %e, "Invalid environment override");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Discover applications
    let discovery = DiscoveryService::new(
        &config.discovery.root_dir,
        config.discovery.config_file.clone(),
        config.discovery.scope.clone(),
    );
    let discovered = tokio::task::spawn_blocking(move || discovery.discover())
        .await?
        .map_err(|e| {
            error!(error = %e, "Application discovery failed");
            e
        })?;

    for e in &discovered.errors {
        warn!(error = %e, "Skipping application config");
    }
    info!(apps = discovered.len(), "Applications discovered");

    // Allocate ports
    let scanner = PortScanner::new(config.ports.host, config.ports.start, config.ports.end);
    let mut available = scanner.scan().await;
    let apps = assign_ports(discovered.apps, &mut available).map_err(|e| {
        error!(error = %e, "Port allocation failed");
        e
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = LocalSupervisor::new(config.supervisor.clone());
    let status = Arc::new(StatusCache::new(
        supervisor.clone(),
        config.server.status_cache_ttl(),
    ));
    let registrar = Arc::new(Registrar::new(
        Arc::new(AppRegistry::new()),
        Arc::new(RouteTable::new()),
        status,
        config.supervisor.port_env.clone(),
    ));

    registrar.bootstrap(apps).await.map_err(|e| {
        error!(error = %e, "Failed to query process supervisor");
        e
    })?;

    for prefix in registrar.routes().prefixes() {
        info!(prefix = %prefix, "Route registered");
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind gateway");
        e
    })?;

    let gateway = Gateway::new(
        Arc::clone(&registrar),
        GatewaySettings::from(&config.server),
        PoolConfig::from(&config.server),
    );
    let server = GatewayServer::new(bind_addr, gateway, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping all backends...");
    supervisor.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        expose_health_checks = config.server.expose_health_checks,
        error_path = %config.server.error_path,
        registration_auth = config.server.registration_token.is_some(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        status_cache_ttl_ms = config.server.status_cache_ttl_ms,
        "Request handling settings"
    );
    info!(
        root_dir = %config.discovery.root_dir,
        config_file = %config.discovery.config_file,
        scope = %config.discovery.scope,
        "Discovery settings"
    );
    info!(
        host = %config.ports.host,
        start = config.ports.start,
        end = config.ports.end,
        "Port range"
    );
    info!(
        interpreter = config.supervisor.interpreter.as_deref().unwrap_or("(none)"),
        port_env = %config.supervisor.port_env,
        shutdown_grace_period_secs = config.supervisor.shutdown_grace_period_secs,
        "Supervisor settings"
    );
}

use previewgate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use previewgate::config::Config;
use previewgate::docker::DockerRuntime;
use previewgate::lifecycle::LifecycleManager;
use previewgate::pool::{ConnectionPool, PoolConfig};
use previewgate::proxy::{ProxyServer, Router};
use previewgate::registry;
use previewgate::webhooks::{EventProcessor, WebhookEndpoint};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("previewgate.toml"));

    let config = Config::load_with_env(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), found = config_path.exists(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = registry::connect(&config.registry).await?;

    let runtime = DockerRuntime::connect(config.docker.host.as_deref()).await?;
    let lifecycle = LifecycleManager::new(
        Arc::new(runtime),
        config.preview.image.clone(),
        config.preview.pull_policy.clone(),
        config.docker.call_timeout(),
    );

    let preview_port = config.preview.port(&config.server);
    let processor = Arc::new(EventProcessor::new(
        Arc::clone(&registry),
        Arc::new(lifecycle),
        config.preview.domain.clone(),
        preview_port,
    ));
    let webhooks = Arc::new(WebhookEndpoint::new(processor, &config.webhook));

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        webhooks,
        preview_port,
        config.server.request_timeout(),
    ));

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let proxy = ProxyServer::new(proxy_addr, router, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let state = Arc::new(AdminState::new(Arc::clone(&registry), pool.stats(), admin_token));
        let admin_server = AdminServer::new(admin_addr, state, shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Admin API disabled");
        None
    };

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    // Running previews are left in place; they outlive the gateway process
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting preview gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        "Listeners"
    );
    info!(
        domain = %config.preview.domain,
        image = %config.preview.image,
        port = config.preview.port(&config.server),
        pull_policy = ?config.preview.pull_policy,
        "Preview settings"
    );
    info!(
        backend = ?config.registry.backend,
        path = %config.registry.path,
        max_open = config.registry.max_open,
        max_idle = config.registry.max_idle,
        "Registry settings"
    );
    info!(
        signature_check = config.webhook.secret.is_some(),
        max_body_bytes = config.webhook.max_body_bytes,
        "Webhook settings"
    );
}

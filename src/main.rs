use accessgate::auth::AuthPolicy;
use accessgate::config::{Config, GatewayMode};
use accessgate::gateway::Gateway;
use accessgate::server::Server;
use accessgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("accessgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let gateway = Arc::new(Gateway::from_config(&config)?);
    print_startup_banner(&config, gateway.policy());

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = Server::bind(bind_addr, Arc::clone(&gateway), shutdown_rx.clone()).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let monitor_handle = gateway.supervisor().spawn_idle_monitor(shutdown_rx);

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    gateway.supervisor().shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = monitor_handle.await;
    })
    .await;

    let stats = gateway.supervisor().stats();
    info!(
        starts = stats.starts(),
        stops = stats.stops(),
        errors = stats.errors(),
        forwarded = gateway.forwarder().forwarded(),
        "Shutdown complete"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
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

    Ok(())
}

fn print_startup_banner(config: &Config, policy: &AuthPolicy) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Server configuration"
    );
    info!(
        mode = %config.auth.mode,
        policy = policy.name(),
        issuer = policy.issuer().unwrap_or("-"),
        token_header = %config.auth.token_header,
        "Identity verification"
    );
    if config.auth.mode == GatewayMode::Dev {
        warn!("Dev mode: every request is authenticated as the local dev identity");
    }
    if let AuthPolicy::Misconfigured { missing, .. } = policy {
        warn!(missing = ?missing, "Identity verification is not configured; all requests will be denied");
    }
    info!(
        binding = %config.container.binding,
        port = config.container.port,
        command = config.container.command.as_deref().unwrap_or("(attached)"),
        idle_timeout_secs = config.container.idle_timeout_secs,
        startup_timeout_secs = config.container.startup_timeout_secs,
        "Backend configuration"
    );
}

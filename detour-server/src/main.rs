mod session;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};

use detour_proto::config::{parse_endpoint, ServerConfig, HOUSEKEEP_INTERVAL_SECS, KEEP_ALIVE_SECS};

use session::ServerContext;

#[derive(Parser)]
#[command(name = "detour-server", about = "Obfuscated tunnel server")]
struct Cli {
    /// Override log level (tracing EnvFilter directive)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ServerConfig::from_env();

    let log_level = cli
        .log_level
        .or_else(|| std::env::var("DETOUR_LOG").ok())
        .unwrap_or_else(|| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(&log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("detour server starting");

    let discovered_host = if config.in_docker {
        match discover_public_ip().await {
            Ok(ip) => {
                tracing::info!(%ip, "discovered public ip for containerized deployment");
                Some(ip)
            }
            Err(e) => {
                tracing::error!(error = %e, "DETOUR_IN_DOCKER set but ip discovery failed");
                return Err(e.into());
            }
        }
    } else {
        None
    };

    let (host, port) = parse_endpoint(&config.listen).ok_or("invalid DETOUR_SERVER_LISTEN")?;
    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!(listen = %config.listen, port_range = ?config.port_range, "control plane listening");

    let ctx = Arc::new(ServerContext::new(config, discovered_host));

    let control = tokio::spawn(session::accept_control(listener, ctx.clone()));
    let housekeeper = tokio::spawn(run_housekeeper(ctx.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    control.abort();
    housekeeper.abort();

    tracing::info!("detour server stopped");
    Ok(())
}

async fn discover_public_ip() -> Result<String, reqwest::Error> {
    let body = reqwest::get("http://ipecho.net/plain").await?.text().await?;
    Ok(body.trim().to_string())
}

async fn run_housekeeper(ctx: Arc<ServerContext>) {
    let mut tick = interval(Duration::from_secs(HOUSEKEEP_INTERVAL_SECS));
    loop {
        tick.tick().await;
        let idle = ctx.registry.idle_keys(KEEP_ALIVE_SECS as i64);
        for key in idle {
            if ctx.registry.close(&key).is_some() {
                tracing::debug!(session = %key, "idle session reaped");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }
}

mod session;

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};

use detour_proto::config::{parse_endpoint, ClientConfig, HOUSEKEEP_INTERVAL_SECS, KEEP_ALIVE_SECS};

use session::ClientContext;

#[derive(Parser)]
#[command(name = "detour-client", about = "Obfuscated tunnel client — SOCKS5/Shadowsocks ingress")]
struct Cli {
    /// Override log level (tracing EnvFilter directive)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ClientConfig::from_env();

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

    tracing::info!("detour client starting");

    let ctx = Arc::new(ClientContext::new(config));

    let mut listeners = Vec::new();
    if let Some(addr) = ctx.config.listen_socks5.clone() {
        let (host, port) = parse_endpoint(&addr).ok_or("invalid DETOUR_CLIENT_LISTEN_SOCKS5")?;
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(%addr, "socks5 ingress listening");
        listeners.push(tokio::spawn(accept_socks5(listener, ctx.clone())));
    }
    if let Some(addr) = ctx.config.listen_shadow.clone() {
        let (host, port) = parse_endpoint(&addr).ok_or("invalid DETOUR_CLIENT_LISTEN_SHADOW")?;
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(%addr, "shadowsocks ingress listening");
        listeners.push(tokio::spawn(accept_shadow(listener, ctx.clone())));
    }

    if listeners.is_empty() {
        return Err("no ingress listener configured".into());
    }

    let housekeeper = tokio::spawn(run_housekeeper(ctx.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    housekeeper.abort();
    for listener in listeners {
        listener.abort();
    }

    tracing::info!("detour client stopped");
    Ok(())
}

async fn accept_socks5(listener: TcpListener, ctx: Arc<ClientContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session::serve_socks5(stream, ctx).await {
                        tracing::debug!(%peer, error = %e, "socks5 ingress session ended");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "socks5 accept failed"),
        }
    }
}

async fn accept_shadow(listener: TcpListener, ctx: Arc<ClientContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session::serve_shadow(stream, ctx).await {
                        tracing::debug!(%peer, error = %e, "shadowsocks ingress session ended");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "shadowsocks accept failed"),
        }
    }
}

async fn run_housekeeper(ctx: Arc<ClientContext>) {
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

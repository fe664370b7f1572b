/// Server-side session lifecycle: one-shot control requests, ephemeral
/// data-channel allocation, and the upstream forwarder pair.
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

use detour_proto::config::{endpoint, ServerConfig, MAX_RECEIVE_LENGTH, MIN_RECEIVE_LENGTH};
use detour_proto::error::{RelayError, Result};
use detour_proto::obfuscation::SwapsPool;
use detour_proto::registry::SessionRegistry;
use detour_proto::transport;
use detour_proto::wire::{RelayData, RelayMethod, RelayRequest, RelayResponse};

const UPSTREAM_READ_CHUNK: usize = 16 * 1024;
const DATA_ACCEPT_TIMEOUT_SECS: u64 = 10;
const PORT_BIND_ATTEMPTS: usize = 32;

pub struct ServerContext {
    pub config: ServerConfig,
    pub pool: SwapsPool,
    pub registry: SessionRegistry<()>,
    listen_host: OnceLock<String>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, discovered_host: Option<String>) -> Self {
        let pool = SwapsPool::new(&config.shared.token);
        let listen_host = OnceLock::new();
        if let Some(host) = discovered_host {
            let _ = listen_host.set(host);
        }
        Self {
            config,
            pool,
            registry: SessionRegistry::new(),
            listen_host,
        }
    }

    /// Resolve the host to advertise in data-channel URLs. `DETOUR_IN_DOCKER`
    /// deployments already have this cached from startup; otherwise the
    /// first control connection's own local address supplies it.
    fn resolve_listen_host(&self, local_addr: SocketAddr) -> Result<&str> {
        if let Some(host) = self.listen_host.get() {
            return Ok(host.as_str());
        }
        if local_addr.ip().is_unspecified() {
            return Err(RelayError::transport(
                "cannot discover a listen host: control socket is bound to 0.0.0.0 and DETOUR_IN_DOCKER is not set",
            ));
        }
        Ok(self.listen_host.get_or_init(|| local_addr.ip().to_string()))
    }
}

pub async fn accept_control(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_control_connection(stream, ctx).await {
                        tracing::debug!(%peer, error = %e, "control connection failed");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "control accept failed"),
        }
    }
}

async fn handle_control_connection(mut stream: TcpStream, ctx: Arc<ServerContext>) -> Result<()> {
    let local_addr = stream.local_addr()?;
    let frames = transport::recv_multipart(&mut stream).await?;
    let request = RelayRequest::deobfuscate(frames)?;

    let response = match request.method {
        RelayMethod::Connect => handle_connect(&ctx, request, local_addr).await,
        RelayMethod::Close => {
            let closed = ctx.registry.close(&request.connection).is_some();
            if !closed {
                tracing::warn!(connection = %request.connection, "close for unknown or already-closed session");
            }
            RelayResponse {
                method: RelayMethod::Close,
                ok: true,
                msg: String::new(),
                addr: None,
                port: None,
                padding: 0,
                connection: request.connection,
                data: Vec::new(),
            }
        }
        RelayMethod::Data => RelayResponse::err(RelayMethod::Data, "DATA is not a control-plane method"),
    };

    let frames = response.obfuscate(&ctx.pool);
    transport::send_multipart(&mut stream, &frames).await
}

/// Dials the upstream, allocates a data-channel listener in the configured
/// port range, and (on success) spawns the background task that waits for
/// the client to connect the data socket and runs the forwarder pair.
async fn handle_connect(ctx: &Arc<ServerContext>, request: RelayRequest, local_addr: SocketAddr) -> RelayResponse {
    let addr = request.addr.clone().unwrap_or_default();
    let port = request.port.unwrap_or(0);

    let upstream = match TcpStream::connect((addr.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            return RelayResponse::err(RelayMethod::Connect, format!("dial {addr}:{port} failed: {e}"));
        }
    };
    let upstream_local = upstream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));

    let (data_listener, data_port) = match bind_data_port(ctx).await {
        Ok(pair) => pair,
        Err(e) => return RelayResponse::err(RelayMethod::Connect, e.to_string()),
    };

    let host = match ctx.resolve_listen_host(local_addr) {
        Ok(h) => h.to_string(),
        Err(e) => return RelayResponse::err(RelayMethod::Connect, e.to_string()),
    };
    let connection = endpoint(&host, data_port);

    spawn_data_session(ctx.clone(), data_listener, upstream, connection.clone());

    let bind_ip = match upstream_local.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    RelayResponse::ok(RelayMethod::Connect, connection, bind_ip.to_string(), upstream_local.port())
}

async fn bind_data_port(ctx: &ServerContext) -> Result<(TcpListener, u16)> {
    let (min, max) = ctx.config.port_range;
    for _ in 0..PORT_BIND_ATTEMPTS {
        let port = rand::thread_rng().gen_range(min..=max);
        if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            return Ok((listener, port));
        }
    }
    Err(RelayError::PortExhaustion)
}

fn spawn_data_session(ctx: Arc<ServerContext>, data_listener: TcpListener, upstream: TcpStream, key: String) {
    tokio::spawn(async move {
        let accepted = timeout(Duration::from_secs(DATA_ACCEPT_TIMEOUT_SECS), data_listener.accept()).await;
        let data_stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                tracing::warn!(session = %key, error = %e, "data channel accept failed");
                return;
            }
            Err(_) => {
                tracing::warn!(session = %key, "data channel accept timed out");
                return;
            }
        };

        let (data_read, data_write) = data_stream.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let up_ctx = ctx.clone();
        let up_key = key.clone();
        let uplink = tokio::spawn(async move {
            if let Err(e) = upstream_to_client(upstream_read, data_write, &up_ctx, &up_key).await {
                log_forward_error(&up_key, "upstream->client", &e);
            }
            up_ctx.registry.close(&up_key);
        });

        let down_ctx = ctx.clone();
        let down_key = key.clone();
        let downlink = tokio::spawn(async move {
            if let Err(e) = client_to_upstream(data_read, upstream_write, &down_ctx, &down_key).await {
                log_forward_error(&down_key, "client->upstream", &e);
            }
            down_ctx.registry.close(&down_key);
        });

        ctx.registry.insert(key, (), uplink, downlink);
    });
}

fn log_forward_error(key: &str, direction: &str, e: &RelayError) {
    if e.is_routine() {
        tracing::debug!(session = %key, %direction, error = %e, "forwarder closed");
    } else {
        tracing::warn!(session = %key, %direction, error = %e, "forwarder failed");
    }
}

async fn upstream_to_client<R, W>(mut upstream_read: R, mut data_write: W, ctx: &ServerContext, key: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; UPSTREAM_READ_CHUNK];
    loop {
        let n = upstream_read.read(&mut buf).await?;
        if n == 0 {
            let frames = RelayData::close().obfuscate(&ctx.pool);
            transport::send_multipart(&mut data_write, &frames).await?;
            return Ok(());
        }

        let mut rest = &buf[..n];
        while !rest.is_empty() {
            let take = rand::thread_rng()
                .gen_range(MIN_RECEIVE_LENGTH..=MAX_RECEIVE_LENGTH)
                .min(rest.len());
            let (chunk, remainder) = rest.split_at(take);
            rest = remainder;
            let eos = rest.is_empty();
            let frag = RelayData::fragment(chunk.to_vec(), eos);
            let frames = frag.obfuscate(&ctx.pool);
            transport::send_multipart(&mut data_write, &frames).await?;
        }
        ctx.registry.touch(key);
    }
}

async fn client_to_upstream<R, W>(mut data_read: R, mut upstream_write: W, ctx: &ServerContext, key: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pending = Vec::new();
    loop {
        let frames = transport::recv_multipart(&mut data_read).await?;
        let frag = RelayData::deobfuscate(frames)?;

        if frag.method == RelayMethod::Close {
            if !pending.is_empty() {
                upstream_write.write_all(&pending).await?;
            }
            return Ok(());
        }

        pending.extend_from_slice(&frag.data);
        if frag.eos {
            upstream_write.write_all(&pending).await?;
            pending.clear();
            ctx.registry.touch(key);
        }
    }
}

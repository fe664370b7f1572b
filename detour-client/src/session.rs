/// Per-ingress session lifecycle: negotiate, dial through the tunnel, spawn
/// the uplink/downlink forwarders, and keep the session table current.
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use detour_proto::config::{parse_endpoint, ClientConfig, MAX_RECEIVE_LENGTH, MIN_RECEIVE_LENGTH};
use detour_proto::crypto::CipherStream;
use detour_proto::error::{RelayError, Result};
use detour_proto::negotiate::{self, socks5::Socks5Auth, Bound, Target};
use detour_proto::obfuscation::SwapsPool;
use detour_proto::registry::SessionRegistry;
use detour_proto::transport::{self, EndpointRing};
use detour_proto::wire::{RelayData, RelayMethod, RelayRequest, RelayResponse};

const INGRESS_READ_CHUNK: usize = 32 * 1024;

pub struct ClientContext {
    pub config: ClientConfig,
    pub pool: SwapsPool,
    pub ring: EndpointRing,
    pub registry: SessionRegistry<()>,
    next_id: AtomicU64,
}

impl ClientContext {
    pub fn new(config: ClientConfig) -> Self {
        let pool = SwapsPool::new(&config.shared.token);
        let ring = EndpointRing::new(config.connects.clone());
        Self {
            config,
            pool,
            ring,
            registry: SessionRegistry::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_local_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// What a successful tunnel CONNECT hands back: the data channel already
/// dialed, plus the address to echo in the ingress reply.
struct ConnectOutcome {
    bound: Bound,
    data_stream: TcpStream,
}

async fn connect_through_tunnel(ctx: &ClientContext, target: Target) -> Result<ConnectOutcome> {
    let request = RelayRequest::connect(target.addr, target.port);
    let frames = request.obfuscate(&ctx.pool);
    let reply_frames = transport::request(&ctx.ring, &frames).await?;
    let response = RelayResponse::deobfuscate(reply_frames)?;

    if !response.ok {
        return Err(RelayError::UpstreamDial {
            addr: response.msg,
            source: std::io::Error::new(std::io::ErrorKind::Other, "server rejected connect"),
        });
    }

    let (host, port) = parse_endpoint(&response.connection)
        .ok_or_else(|| RelayError::protocol("malformed data channel endpoint"))?;
    let data_stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| RelayError::UpstreamDial {
            addr: response.connection.clone(),
            source: e,
        })?;

    let bound_addr: Ipv4Addr = response
        .addr
        .as_deref()
        .and_then(|a| a.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    Ok(ConnectOutcome {
        bound: Bound {
            addr: bound_addr,
            port: response.port.unwrap_or(0),
        },
        data_stream,
    })
}

pub async fn serve_socks5(stream: TcpStream, ctx: Arc<ClientContext>) -> Result<()> {
    let (mut reader, mut writer) = split(stream);

    let outcome_slot: Arc<Mutex<Option<ConnectOutcome>>> = Arc::new(Mutex::new(None));
    let slot = outcome_slot.clone();
    let ctx_for_bind = ctx.clone();
    let bind = move |target: Target| {
        let slot = slot.clone();
        let ctx = ctx_for_bind.clone();
        async move { bind_and_stash(&ctx, target, &slot).await }
    };

    let auth = if ctx.config.requires_socks5_auth() {
        Some(Socks5Auth {
            username: ctx.config.socks5_username.as_deref().unwrap(),
            password: ctx.config.socks5_password.as_deref().unwrap(),
        })
    } else {
        None
    };

    let ok = negotiate::socks5::negotiate(&mut reader, &mut writer, auth, bind).await?;
    if !ok {
        return Ok(());
    }

    let outcome = take_outcome(&outcome_slot);
    let id = ctx.next_local_id();
    spawn_forwarders(reader, writer, outcome, ctx, format!("socks5-{id}"));
    Ok(())
}

pub async fn serve_shadow(stream: TcpStream, ctx: Arc<ClientContext>) -> Result<()> {
    let cipher = CipherStream::new(stream, &ctx.config.shadow_password);
    let (mut reader, writer) = split(cipher);

    let outcome_slot: Arc<Mutex<Option<ConnectOutcome>>> = Arc::new(Mutex::new(None));
    let slot = outcome_slot.clone();
    let ctx_for_bind = ctx.clone();
    let bind = move |target: Target| {
        let slot = slot.clone();
        let ctx = ctx_for_bind.clone();
        async move { bind_and_stash(&ctx, target, &slot).await }
    };

    let ok = negotiate::shadowsocks::negotiate(&mut reader, bind).await?;
    if !ok {
        return Ok(());
    }

    let outcome = take_outcome(&outcome_slot);
    let id = ctx.next_local_id();
    spawn_forwarders(reader, writer, outcome, ctx, format!("shadow-{id}"));
    Ok(())
}

async fn bind_and_stash(
    ctx: &ClientContext,
    target: Target,
    slot: &Mutex<Option<ConnectOutcome>>,
) -> Result<Bound> {
    let outcome = connect_through_tunnel(ctx, target).await?;
    let bound = outcome.bound.clone();
    *slot.lock().unwrap() = Some(outcome);
    Ok(bound)
}

fn take_outcome(slot: &Mutex<Option<ConnectOutcome>>) -> ConnectOutcome {
    slot.lock()
        .unwrap()
        .take()
        .expect("negotiator reported success without a stored connect outcome")
}

/// Splits the already-dialed data socket, registers the session, and spawns
/// the uplink/downlink pair. Generic over the ingress halves so the same
/// code serves plain SOCKS5 sockets and cipher-wrapped Shadowsocks ones.
fn spawn_forwarders<R, W>(
    ingress_reader: R,
    ingress_writer: W,
    outcome: ConnectOutcome,
    ctx: Arc<ClientContext>,
    key: String,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (data_read, data_write) = outcome.data_stream.into_split();

    let uplink_ctx = ctx.clone();
    let uplink_key = key.clone();
    let uplink = tokio::spawn(async move {
        if let Err(e) = uplink_forward(ingress_reader, data_write, &uplink_ctx, &uplink_key).await {
            if e.is_routine() {
                tracing::debug!(session = %uplink_key, error = %e, "uplink closed");
            } else {
                tracing::warn!(session = %uplink_key, error = %e, "uplink failed");
            }
        }
        uplink_ctx.registry.close(&uplink_key);
    });

    let downlink_ctx = ctx.clone();
    let downlink_key = key.clone();
    let downlink = tokio::spawn(async move {
        if let Err(e) = downlink_forward(data_read, ingress_writer, &downlink_ctx, &downlink_key).await {
            if e.is_routine() {
                tracing::debug!(session = %downlink_key, error = %e, "downlink closed");
            } else {
                tracing::warn!(session = %downlink_key, error = %e, "downlink failed");
            }
        }
        downlink_ctx.registry.close(&downlink_key);
    });

    ctx.registry.insert(key, (), uplink, downlink);
}

async fn uplink_forward<R, W>(
    mut ingress_reader: R,
    mut data_write: W,
    ctx: &ClientContext,
    key: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; INGRESS_READ_CHUNK];
    loop {
        let n = ingress_reader.read(&mut buf).await?;
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

async fn downlink_forward<R, W>(
    mut data_read: R,
    mut ingress_writer: W,
    ctx: &ClientContext,
    key: &str,
) -> Result<()>
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
                ingress_writer.write_all(&pending).await?;
            }
            return Ok(());
        }

        pending.extend_from_slice(&frag.data);
        if frag.eos {
            ingress_writer.write_all(&pending).await?;
            pending.clear();
            ctx.registry.touch(key);
        }
    }
}

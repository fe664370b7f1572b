/// Minimal length-prefixed multipart transport over TCP.
///
/// No message-bus library ships in this workspace's dependency stack, so the
/// request/reply and dedicated-pair semantics the control plane needs are
/// built directly on `tokio::net::TcpStream`. A multipart message is framed
/// as a frame count followed by, for each frame, a big-endian `u32` length
/// and the raw bytes.
///
/// The DEALER/ROUTER identity-frame dance collapses naturally: each control
/// round-trip here is its own short-lived TCP connection (connect, send one
/// request, await one reply, close), so "which peer sent this" is simply
/// "which accepted connection this is" — there is nothing to address
/// replies by, and therefore nothing to smuggle onto the wire for it.
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{RelayError, Result};
use crate::wire::Frames;

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Generic over the write half so the same framing serves both the
/// one-shot control round trip and a long-lived data channel's owned
/// write half.
pub async fn send_multipart<W: AsyncWrite + Unpin>(writer: &mut W, frames: &Frames) -> Result<()> {
    let parts = [&frames.header, &frames.swaps, &frames.data_obfs];
    let mut buf = Vec::with_capacity(1 + parts.iter().map(|p| 4 + p.len()).sum::<usize>());
    buf.push(parts.len() as u8);
    for part in parts {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    writer.write_all(&buf).await.map_err(RelayError::from)
}

pub async fn recv_multipart<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frames> {
    let mut count_buf = [0u8; 1];
    reader.read_exact(&mut count_buf).await?;
    let count = count_buf[0] as usize;
    if count != 3 {
        return Err(RelayError::protocol(format!(
            "expected 3 frames, got {count}"
        )));
    }

    let mut parts = Vec::with_capacity(3);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(RelayError::protocol("frame too large"));
        }
        let mut part = vec![0u8; len as usize];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }

    let mut iter = parts.into_iter();
    let header = iter.next().unwrap();
    let swaps = iter.next().unwrap();
    let data_obfs = iter.next().unwrap();
    Ok(Frames::from_parts(header, swaps, data_obfs))
}

/// Round-robins connects across a fixed set of control endpoints, mirroring
/// how a DEALER socket spreads requests over every peer it's connected to.
pub struct EndpointRing {
    endpoints: Vec<String>,
    next: AtomicUsize,
}

impl EndpointRing {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            next: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Connect to the next endpoint in rotation. Tries every endpoint once
    /// before giving up, since a single down peer shouldn't stall the ring.
    pub async fn connect(&self) -> Result<TcpStream> {
        if self.endpoints.is_empty() {
            return Err(RelayError::transport("no control endpoints configured"));
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        let mut last_err = None;
        for offset in 0..self.endpoints.len() {
            let idx = (start + offset) % self.endpoints.len();
            let (host, port) = crate::config::parse_endpoint(&self.endpoints[idx])
                .ok_or_else(|| RelayError::transport("malformed control endpoint"))?;
            match TcpStream::connect((host, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(RelayError::UpstreamDial {
            addr: self.endpoints.join(","),
            source: last_err.unwrap(),
        })
    }
}

/// One round-trip on a fresh connection: connect, send, receive reply, close.
pub async fn request(ring: &EndpointRing, frames: &Frames) -> Result<Frames> {
    let mut stream = ring.connect().await?;
    send_multipart(&mut stream, frames).await?;
    recv_multipart(&mut stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn multipart_roundtrips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frames = recv_multipart(&mut stream).await.unwrap();
            send_multipart(&mut stream, &frames).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let sent = Frames::from_parts(b"hdr".to_vec(), b"sw".to_vec(), b"body".to_vec());
        send_multipart(&mut client, &sent).await.unwrap();
        let received = recv_multipart(&mut client).await.unwrap();

        assert_eq!(received.header, b"hdr");
        assert_eq!(received.swaps, b"sw");
        assert_eq!(received.data_obfs, b"body");
        server.await.unwrap();
    }

    #[test]
    fn ring_rejects_empty_endpoint_list() {
        let ring = EndpointRing::new(Vec::new());
        assert!(ring.is_empty());
    }
}

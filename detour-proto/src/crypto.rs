/// Shadowsocks AEAD stream cipher (classic, pre-2022 construction), wired
/// directly into a `AsyncRead`/`AsyncWrite` wrapper so the SOCKS5-shaped
/// negotiator code can treat a ciphered ingress exactly like a plain one.
use std::pin::Pin;
use std::task::{Context, Poll};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const SALT_LEN: usize = 32;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const MAX_CHUNK: usize = 0x3FFF;
const HKDF_INFO: &[u8] = b"ss-subkey";

/// Derive the master key from a password the way classic Shadowsocks does:
/// repeated MD5(prev || password) until `key_len` bytes are produced
/// (OpenSSL's `EVP_BytesToKey` with no salt/IV).
pub fn derive_master_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + Md5::output_size());
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        key.extend_from_slice(&digest);
        prev = digest.to_vec();
    }
    key.truncate(key_len);
    key
}

/// Per-direction subkey: HKDF-SHA1(master_key, salt, "ss-subkey").
fn derive_subkey(master_key: &[u8], salt: &[u8]) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; KEY_LEN];
    hk.expand(HKDF_INFO, &mut subkey)
        .expect("KEY_LEN is within HKDF-SHA1's output range");
    subkey
}

/// One AEAD direction: a subkey derived from a salt, and a running nonce
/// counter (classic Shadowsocks increments a little-endian nonce per chunk
/// rather than deriving a fresh one).
struct Direction {
    cipher: ChaCha20Poly1305,
    nonce_counter: u64,
}

impl Direction {
    fn new(master_key: &[u8], salt: &[u8]) -> Self {
        let subkey = derive_subkey(master_key, salt);
        let cipher = ChaCha20Poly1305::new_from_slice(&subkey)
            .expect("chacha20poly1305 keys are always 32 bytes");
        Self {
            cipher,
            nonce_counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        Nonce::from(bytes)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(&nonce, Payload::from(plaintext))
            .expect("encryption over a bounded chunk cannot fail")
    }

    /// `None` means the AEAD tag didn't verify. Callers log and carry on
    /// with the chunk unchanged rather than tearing the stream down —
    /// a single corrupted frame shouldn't kill the whole connection.
    fn open(&mut self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher.decrypt(&nonce, Payload::from(ciphertext)).ok()
    }
}

enum ReadState {
    Salt {
        buf: Vec<u8>,
        filled: usize,
    },
    Length {
        buf: Vec<u8>,
        filled: usize,
    },
    Payload {
        buf: Vec<u8>,
        filled: usize,
        len_plain: Vec<u8>,
    },
}

enum WriteState {
    Salt {
        salt: Vec<u8>,
        written: usize,
    },
    Ready,
    Writing {
        data: Vec<u8>,
        written: usize,
        original_len: usize,
    },
}

/// Wraps a raw ingress stream in the Shadowsocks AEAD framing. Read and
/// write directions each negotiate their own salt lazily, on first use —
/// matching the protocol's independent per-direction salts.
pub struct CipherStream<S> {
    inner: S,
    master_key: Vec<u8>,
    decoder: Option<Direction>,
    encoder: Option<Direction>,
    out_buf: IoBuffer,
    read_state: ReadState,
    write_state: WriteState,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, password: &str) -> Self {
        Self {
            inner,
            master_key: derive_master_key(password, KEY_LEN),
            decoder: None,
            encoder: None,
            out_buf: IoBuffer::new(),
            read_state: ReadState::Salt {
                buf: vec![0u8; SALT_LEN],
                filled: 0,
            },
            write_state: WriteState::Salt {
                salt: random_salt(),
                written: 0,
            },
        }
    }
}

fn random_salt() -> Vec<u8> {
    use rand::RngCore;
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.out_buf.is_empty() {
                let n = this.out_buf.len().min(buf.remaining());
                buf.put_slice(&this.out_buf.take(Some(n)));
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Salt { buf: salt_buf, filled } => {
                    match fill_or_eof(&mut this.inner, cx, salt_buf, filled)? {
                        FillOutcome::Pending => return Poll::Pending,
                        FillOutcome::Eof => return Poll::Ready(Ok(())), // closed before sending anything
                        FillOutcome::Done => {}
                    }
                    this.decoder = Some(Direction::new(&this.master_key, salt_buf));
                    this.read_state = ReadState::Length {
                        buf: vec![0u8; 2 + TAG_LEN],
                        filled: 0,
                    };
                }
                ReadState::Length { buf: len_buf, filled } => {
                    match fill_or_eof(&mut this.inner, cx, len_buf, filled)? {
                        FillOutcome::Pending => return Poll::Pending,
                        FillOutcome::Eof => return Poll::Ready(Ok(())),
                        FillOutcome::Done => {}
                    }
                    let decoder = this.decoder.as_mut().expect("salt consumed before length frame");
                    let len_plain = decoder.open(len_buf).unwrap_or_else(|| {
                        tracing::error!("shadowsocks length frame failed AEAD check, leaving chunk unchanged");
                        len_buf.clone()
                    });
                    let payload_len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
                    this.read_state = ReadState::Payload {
                        buf: vec![0u8; payload_len + TAG_LEN],
                        filled: 0,
                        len_plain,
                    };
                }
                ReadState::Payload {
                    buf: payload_buf,
                    filled,
                    ..
                } => {
                    match fill_or_eof(&mut this.inner, cx, payload_buf, filled)? {
                        FillOutcome::Pending => return Poll::Pending,
                        FillOutcome::Eof => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "connection closed mid shadowsocks frame",
                            )))
                        }
                        FillOutcome::Done => {}
                    }
                    let decoder = this.decoder.as_mut().expect("salt consumed before payload frame");
                    let plain = decoder.open(payload_buf).unwrap_or_else(|| {
                        tracing::error!("shadowsocks payload frame failed AEAD check, leaving chunk unchanged");
                        payload_buf.clone()
                    });
                    this.out_buf.append(plain);
                    this.read_state = ReadState::Length {
                        buf: vec![0u8; 2 + TAG_LEN],
                        filled: 0,
                    };
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.write_state {
                WriteState::Salt { salt, written } => {
                    while *written < salt.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &salt[*written..]) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(std::io::Error::new(
                                    std::io::ErrorKind::WriteZero,
                                    "write returned 0",
                                )))
                            }
                            Poll::Ready(Ok(n)) => *written += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    this.encoder = Some(Direction::new(&this.master_key, salt));
                    this.write_state = WriteState::Ready;
                }
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let chunk_len = buf.len().min(MAX_CHUNK);
                    let chunk = &buf[..chunk_len];
                    let encoder = this.encoder.as_mut().expect("salt written before encoding");
                    let len_plain = (chunk_len as u16).to_be_bytes();
                    let mut data = encoder.seal(&len_plain);
                    data.extend_from_slice(&encoder.seal(chunk));
                    this.write_state = WriteState::Writing {
                        data,
                        written: 0,
                        original_len: chunk_len,
                    };
                }
                WriteState::Writing {
                    data,
                    written,
                    original_len,
                } => {
                    while *written < data.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &data[*written..]) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(std::io::Error::new(
                                    std::io::ErrorKind::WriteZero,
                                    "write returned 0",
                                )))
                            }
                            Poll::Ready(Ok(n)) => *written += n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                    let n = *original_len;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(n));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum FillOutcome {
    Done,
    Eof,
    Pending,
}

/// Poll-fill `target[*filled..]` from `inner`. Returns whether the buffer is
/// fully filled, hit EOF partway through, or needs another wakeup.
fn fill_or_eof<S: AsyncRead + Unpin>(
    inner: &mut S,
    cx: &mut Context<'_>,
    target: &mut [u8],
    filled: &mut usize,
) -> std::io::Result<FillOutcome> {
    while *filled < target.len() {
        let mut rb = ReadBuf::new(&mut target[*filled..]);
        match Pin::new(&mut *inner).poll_read(cx, &mut rb) {
            Poll::Ready(Ok(())) => {
                let n = rb.filled().len();
                if n == 0 {
                    return Ok(FillOutcome::Eof);
                }
                *filled += n;
            }
            Poll::Ready(Err(e)) => return Err(e),
            Poll::Pending => return Ok(FillOutcome::Pending),
        }
    }
    Ok(FillOutcome::Done)
}

/// A chained list of byte blocks with a read cursor. `CipherStream` uses this
/// to hold decrypted payload that doesn't fit the reader's requested size —
/// AEAD chunks rarely line up with whatever `poll_read` was asked to fill.
#[derive(Debug, Default)]
pub struct IoBuffer {
    blocks: Vec<Vec<u8>>,
    block_idx: usize,
    offset: usize,
    len: usize,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.blocks.push(data);
    }

    /// Take up to `n` bytes (or everything, if `n` is `None`).
    pub fn take(&mut self, n: Option<usize>) -> Vec<u8> {
        let mut want = n.unwrap_or(self.len);
        let mut out = Vec::with_capacity(want.min(self.len));

        while self.block_idx < self.blocks.len() && want > 0 {
            let block = &self.blocks[self.block_idx];
            let available = block.len() - self.offset;
            if available <= want {
                out.extend_from_slice(&block[self.offset..]);
                want -= available;
                self.len -= available;
                self.block_idx += 1;
                self.offset = 0;
            } else {
                out.extend_from_slice(&block[self.offset..self.offset + want]);
                self.offset += want;
                self.len -= want;
                want = 0;
            }
        }

        if self.block_idx > 10 {
            self.blocks.drain(0..self.block_idx);
            self.block_idx = 0;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn master_key_derivation_is_deterministic() {
        let a = derive_master_key("yb160101", 32);
        let b = derive_master_key("yb160101", 32);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn cipher_stream_roundtrips_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = CipherStream::new(client_io, "hunter2");
        let mut server = CipherStream::new(server_io, "hunter2");

        let writer = tokio::spawn(async move {
            client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");

        writer.await.unwrap();
    }

    #[tokio::test]
    async fn cipher_stream_roundtrips_large_payload() {
        let (client_io, server_io) = tokio::io::duplex(1 << 20);
        let mut client = CipherStream::new(client_io, "pw");
        let mut server = CipherStream::new(server_io, "pw");

        let payload = vec![0x5Au8; MAX_CHUNK + 1000];
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
        });

        let mut received = Vec::new();
        while received.len() < expected.len() {
            let mut buf = vec![0u8; 8192];
            let n = server.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn io_buffer_serves_reads_across_block_boundaries() {
        let mut buf = IoBuffer::new();
        buf.append(b"abc".to_vec());
        buf.append(b"defgh".to_vec());
        assert_eq!(buf.take(Some(4)), b"abcd");
        assert_eq!(buf.take(Some(2)), b"ef");
        assert_eq!(buf.take(None), b"gh");
        assert!(buf.is_empty());
    }
}

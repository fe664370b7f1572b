/// RFC 1928 SOCKS5 ingress negotiation (CONNECT only), with optional RFC
/// 1929 username/password auth.
use std::future::Future;
use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Bound, Target};
use crate::error::{RelayError, Result};

const VERSION: u8 = 5;
const NO_AUTH: u8 = 0x00;
const USERNAME_PASSWORD: u8 = 0x02;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;

const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

const REP_OK: u8 = 0;
const REP_GENERAL_FAILURE: u8 = 1;
const REP_COMMAND_NOT_SUPPORTED: u8 = 7;
const REP_ADDR_NOT_SUPPORTED: u8 = 8;

/// Credentials required for USERNAME_PASSWORD auth; absent means NO_AUTH.
pub struct Socks5Auth<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Run the handshake, then CONNECT negotiation, calling `bind` with the
/// parsed target once the request is parsed. Returns `Ok(true)` iff the
/// ingress is ready to start forwarding.
pub async fn negotiate<R, W, B, Fut>(
    reader: &mut R,
    writer: &mut W,
    auth: Option<Socks5Auth<'_>>,
    bind: B,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    B: FnOnce(Target) -> Fut,
    Fut: Future<Output = Result<Bound>>,
{
    if !handshake(reader, writer, auth).await? {
        return Ok(false);
    }

    let target = match read_request(reader, writer).await? {
        Some(t) => t,
        None => return Ok(false),
    };

    match bind(target).await {
        Ok(bound) => {
            write_reply(writer, REP_OK, bound.addr, bound.port).await?;
            Ok(true)
        }
        Err(e) => {
            write_reply(writer, REP_GENERAL_FAILURE, Ipv4Addr::UNSPECIFIED, 0).await?;
            Err(e)
        }
    }
}

async fn handshake<R, W>(reader: &mut R, writer: &mut W, auth: Option<Socks5Auth<'_>>) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;
    let (version, nmethods) = (header[0], header[1]);
    if version != VERSION || nmethods == 0 {
        writer.write_all(&[VERSION, NO_ACCEPTABLE_METHOD]).await?;
        return Ok(false);
    }

    let mut methods = vec![0u8; nmethods as usize];
    reader.read_exact(&mut methods).await?;

    if let Some(creds) = auth {
        if !methods.contains(&USERNAME_PASSWORD) {
            writer.write_all(&[VERSION, NO_ACCEPTABLE_METHOD]).await?;
            return Ok(false);
        }
        writer.write_all(&[VERSION, USERNAME_PASSWORD]).await?;
        check_auth(reader, writer, &creds).await
    } else if methods.contains(&NO_AUTH) {
        writer.write_all(&[VERSION, NO_AUTH]).await?;
        Ok(true)
    } else {
        writer.write_all(&[VERSION, NO_ACCEPTABLE_METHOD]).await?;
        Ok(false)
    }
}

async fn check_auth<R, W>(reader: &mut R, writer: &mut W, creds: &Socks5Auth<'_>) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ver = [0u8; 1];
    reader.read_exact(&mut ver).await?;

    let mut ulen = [0u8; 1];
    reader.read_exact(&mut ulen).await?;
    let mut username = vec![0u8; ulen[0] as usize];
    reader.read_exact(&mut username).await?;

    let mut plen = [0u8; 1];
    reader.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    reader.read_exact(&mut password).await?;

    let ok = username == creds.username.as_bytes() && password == creds.password.as_bytes();
    writer.write_all(&[ver[0], if ok { 0 } else { 1 }]).await?;
    Ok(ok)
}

async fn read_request<R, W>(reader: &mut R, writer: &mut W) -> Result<Option<Target>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    let (version, cmd, _rsv, atyp) = (head[0], head[1], head[2], head[3]);
    if version != VERSION {
        return Err(RelayError::protocol("bad SOCKS5 version in request"));
    }

    let addr = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            reader.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| RelayError::protocol("non-utf8 domain in SOCKS5 request"))?
        }
        _ => {
            write_reply(writer, REP_ADDR_NOT_SUPPORTED, Ipv4Addr::UNSPECIFIED, 0).await?;
            return Ok(None);
        }
    };

    let mut port_buf = [0u8; 2];
    reader.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    if cmd != CMD_CONNECT {
        write_reply(writer, REP_COMMAND_NOT_SUPPORTED, Ipv4Addr::UNSPECIFIED, 0).await?;
        return Ok(None);
    }

    Ok(Some(Target { addr, port }))
}

async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rep: u8,
    addr: Ipv4Addr,
    port: u16,
) -> Result<()> {
    let mut buf = [0u8; 10];
    buf[0] = VERSION;
    buf[1] = rep;
    buf[2] = 0; // reserved
    buf[3] = ATYP_IPV4;
    buf[4..8].copy_from_slice(&addr.octets());
    buf[8..10].copy_from_slice(&port.to_be_bytes());
    writer.write_all(&buf).await.map_err(RelayError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn no_auth_connect_succeeds() {
        let mut input = Vec::new();
        input.extend_from_slice(&[5, 1, 0]); // greeting: ver 5, 1 method, NO_AUTH
        input.extend_from_slice(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 80]); // CONNECT 127.0.0.1:80
        let mut reader = Cursor::new(input);
        let mut writer = Vec::new();

        let ok = negotiate(&mut reader, &mut writer, None, |target| async move {
            assert_eq!(target.addr, "127.0.0.1");
            assert_eq!(target.port, 80);
            Ok(Bound {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                port: 43170,
            })
        })
        .await
        .unwrap();

        assert!(ok);
        assert_eq!(&writer[0..2], &[5, 0]);
        assert_eq!(&writer[2..], &[5, 0, 0, 1, 10, 0, 0, 1, 0xA8, 0xA2]);
    }

    #[tokio::test]
    async fn bad_version_rejected() {
        let mut reader = Cursor::new(vec![4, 1, 0]);
        let mut writer = Vec::new();
        let ok = negotiate(&mut reader, &mut writer, None, |_| async {
            unreachable!("bind must not be called")
        })
        .await
        .unwrap();
        assert!(!ok);
        assert_eq!(writer, vec![5, 0xFF]);
    }

    #[tokio::test]
    async fn username_password_success() {
        let mut input = Vec::new();
        input.extend_from_slice(&[5, 1, 2]); // offers USERNAME_PASSWORD
        input.extend_from_slice(&[1, 5, b'a', b'l', b'i', b'c', b'e', 6, b's', b'e', b'c', b'r', b'e', b't']);
        input.extend_from_slice(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 80]);
        let mut reader = Cursor::new(input);
        let mut writer = Vec::new();

        let auth = Socks5Auth {
            username: "alice",
            password: "secret",
        };
        let ok = negotiate(&mut reader, &mut writer, Some(auth), |_| async {
            Ok(Bound {
                addr: Ipv4Addr::UNSPECIFIED,
                port: 0,
            })
        })
        .await
        .unwrap();

        assert!(ok);
        assert_eq!(&writer[0..2], &[5, 2]);
        assert_eq!(&writer[2..4], &[1, 0]);
    }

    #[tokio::test]
    async fn username_password_mismatch_fails() {
        let mut input = Vec::new();
        input.extend_from_slice(&[5, 1, 2]);
        input.extend_from_slice(&[1, 5, b'a', b'l', b'i', b'c', b'e', 5, b'w', b'r', b'o', b'n', b'g']);
        let mut reader = Cursor::new(input);
        let mut writer = Vec::new();

        let auth = Socks5Auth {
            username: "alice",
            password: "secret",
        };
        let ok = negotiate(&mut reader, &mut writer, Some(auth), |_| async {
            unreachable!()
        })
        .await
        .unwrap();

        assert!(!ok);
        assert_eq!(&writer[2..4], &[1, 1]);
    }
}

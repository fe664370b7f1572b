/// Shadowsocks ingress negotiation: no handshake, no reply on success or
/// failure. The caller is expected to have already swapped the raw
/// reader/writer for AEAD-decrypting/encrypting wrappers before this runs.
use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Bound, Target};
use crate::error::Result;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

pub async fn negotiate<R, B, Fut>(reader: &mut R, bind: B) -> Result<bool>
where
    R: AsyncRead + Unpin,
    B: FnOnce(Target) -> Fut,
    Fut: Future<Output = Result<Bound>>,
{
    let mut atyp_buf = [0u8; 1];
    if reader.read_exact(&mut atyp_buf).await.is_err() {
        // Client connected and disconnected immediately; nothing to reply.
        return Ok(false);
    }

    let addr = match atyp_buf[0] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
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
            match String::from_utf8(domain) {
                Ok(d) => d,
                Err(_) => return Ok(false),
            }
        }
        _ => return Ok(false),
    };

    let mut port_buf = [0u8; 2];
    reader.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    match bind(Target { addr, port }).await {
        Ok(_bound) => Ok(true),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn domain_connect_parses_and_binds() {
        let mut input = vec![3u8, 11];
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&80u16.to_be_bytes());
        let mut reader = Cursor::new(input);

        let ok = negotiate(&mut reader, |target| async move {
            assert_eq!(target.addr, "example.com");
            assert_eq!(target.port, 80);
            Ok(Bound {
                addr: Ipv4Addr::UNSPECIFIED,
                port: 0,
            })
        })
        .await
        .unwrap();

        assert!(ok);
    }

    #[tokio::test]
    async fn immediate_disconnect_returns_false() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let ok = negotiate(&mut reader, |_| async { unreachable!() })
            .await
            .unwrap();
        assert!(!ok);
    }
}

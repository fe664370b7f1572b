/// Environment-driven configuration for client and server.
use std::env;

const DEFAULT_TOKEN: &str = "LzHAxq0KtWM";
const DEFAULT_SERVER_LISTEN: &str = "tcp://0.0.0.0:3171";
const DEFAULT_SERVER_PORT_RANGE: &str = "43170-63170";
const DEFAULT_CLIENT_CONNECTS: &str = "tcp://127.0.0.1:3171";
const DEFAULT_CLIENT_LISTEN_SOCKS5: &str = "tcp://127.0.0.1:3170";
const DEFAULT_CLIENT_LISTEN_SHADOW: &str = "tcp://127.0.0.1:3169";
const DEFAULT_SHADOW_PASSWORD: &str = "yb160101";
const DEFAULT_SHADOW_METHOD: &str = "chacha20-ietf-poly1305";

pub const SWAPS_ADD_LENGTH: usize = 16;
pub const MIN_PADDING_LENGTH: usize = 320;
pub const MAX_PADDING_LENGTH: usize = 648;
pub const MIN_RECEIVE_LENGTH: usize = 1024;
pub const MAX_RECEIVE_LENGTH: usize = 4096;
pub const HOUSEKEEP_INTERVAL_SECS: u64 = 10;
pub const KEEP_ALIVE_SECS: u64 = 60;

/// Shared knobs used by both binaries: the obfuscation token and the data
/// channel port range are meaningful on both sides of the tunnel.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    pub token: String,
}

impl SharedConfig {
    pub fn from_env() -> Self {
        Self {
            token: env::var("DETOUR_TOKEN").unwrap_or_else(|_| DEFAULT_TOKEN.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub shared: SharedConfig,
    pub connects: Vec<String>,
    pub listen_socks5: Option<String>,
    pub listen_shadow: Option<String>,
    pub socks5_username: Option<String>,
    pub socks5_password: Option<String>,
    pub shadow_password: String,
    pub shadow_method: String,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let connects = env::var("DETOUR_CLIENT_CONNECTS")
            .unwrap_or_else(|_| DEFAULT_CLIENT_CONNECTS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            shared: SharedConfig::from_env(),
            connects,
            listen_socks5: env::var("DETOUR_CLIENT_LISTEN_SOCKS5")
                .ok()
                .or_else(|| Some(DEFAULT_CLIENT_LISTEN_SOCKS5.to_string())),
            listen_shadow: env::var("DETOUR_CLIENT_LISTEN_SHADOW")
                .ok()
                .or_else(|| Some(DEFAULT_CLIENT_LISTEN_SHADOW.to_string())),
            socks5_username: env::var("DETOUR_CLIENT_SOCKS5_USERNAME").ok(),
            socks5_password: env::var("DETOUR_CLIENT_SOCKS5_PASSWORD").ok(),
            shadow_password: env::var("DETOUR_CLIENT_SHADOW_PASSWORD")
                .unwrap_or_else(|_| DEFAULT_SHADOW_PASSWORD.to_string()),
            shadow_method: env::var("DETOUR_CLIENT_SHADOW_METHOD")
                .unwrap_or_else(|_| DEFAULT_SHADOW_METHOD.to_string()),
        }
    }

    /// USERNAME_PASSWORD auth is only required when both halves are configured.
    pub fn requires_socks5_auth(&self) -> bool {
        self.socks5_username.is_some() && self.socks5_password.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub shared: SharedConfig,
    pub listen: String,
    pub port_range: (u16, u16),
    pub in_docker: bool,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let range = env::var("DETOUR_SERVER_PORT_RANGE")
            .unwrap_or_else(|_| DEFAULT_SERVER_PORT_RANGE.to_string());
        let (min, max) = parse_port_range(&range).unwrap_or((43170, 63170));

        Self {
            shared: SharedConfig::from_env(),
            listen: env::var("DETOUR_SERVER_LISTEN")
                .unwrap_or_else(|_| DEFAULT_SERVER_LISTEN.to_string()),
            port_range: (min, max),
            in_docker: env::var("DETOUR_IN_DOCKER").is_ok(),
        }
    }
}

fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (a, b) = s.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Parse a `tcp://host:port` endpoint URL into its host and port parts.
pub fn parse_endpoint(url: &str) -> Option<(&str, u16)> {
    let rest = url.strip_prefix("tcp://")?;
    let (host, port) = rest.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

pub fn endpoint(host: &str, port: u16) -> String {
    format!("tcp://{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint() {
        assert_eq!(parse_endpoint("tcp://1.2.3.4:567"), Some(("1.2.3.4", 567)));
        assert_eq!(parse_endpoint("not-a-url"), None);
    }

    #[test]
    fn parses_port_range() {
        assert_eq!(parse_port_range("43170-63170"), Some((43170, 63170)));
        assert_eq!(parse_port_range("bad"), None);
    }
}

/// Message schema and three-frame wire packing.
///
/// Every message on the wire — control request, control reply, or data
/// fragment — is exactly three frames: a compact JSON header array, the
/// swap alphabet used to obfuscate this message, and the obfuscated body.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::obfuscation::{deobfs, obfs, SwapsPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayMethod {
    Connect,
    Data,
    Close,
}

/// The three raw frames that travel over the transport for any message type.
#[derive(Debug, Clone)]
pub struct Frames {
    pub header: Vec<u8>,
    pub swaps: Vec<u8>,
    pub data_obfs: Vec<u8>,
}

impl Frames {
    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        (self.header, self.swaps, self.data_obfs)
    }

    pub fn from_parts(header: Vec<u8>, swaps: Vec<u8>, data_obfs: Vec<u8>) -> Self {
        Self {
            header,
            swaps,
            data_obfs,
        }
    }
}

// ── RelayRequest ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RelayRequest {
    pub method: RelayMethod,
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub padding: u32,
    pub connection: String,
    pub data: Vec<u8>,
}

impl RelayRequest {
    pub fn connect(addr: impl Into<String>, port: u16) -> Self {
        Self {
            method: RelayMethod::Connect,
            addr: Some(addr.into()),
            port: Some(port),
            padding: 0,
            connection: String::new(),
            data: Vec::new(),
        }
    }

    pub fn close(connection: impl Into<String>) -> Self {
        Self {
            method: RelayMethod::Close,
            addr: None,
            port: None,
            padding: 0,
            connection: connection.into(),
            data: Vec::new(),
        }
    }

    pub fn obfuscate(mut self, pool: &SwapsPool) -> Frames {
        let obfuscated = obfs(&self.data, pool);
        self.padding = obfuscated.padding;
        let header = serde_json::to_vec(&(
            self.method,
            &self.addr,
            self.port,
            self.padding,
            &self.connection,
        ))
        .expect("relay request header is always serializable");
        Frames::from_parts(header, obfuscated.swaps, obfuscated.data_obfs)
    }

    pub fn deobfuscate(frames: Frames) -> Result<Self> {
        let (method, addr, port, padding, connection): (
            RelayMethod,
            Option<String>,
            Option<u16>,
            u32,
            String,
        ) = parse_header(&frames.header)?;
        let data = deobfs(&frames.data_obfs, &frames.swaps, padding);
        Ok(Self {
            method,
            addr,
            port,
            padding,
            connection,
            data,
        })
    }
}

// ── RelayResponse ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub method: RelayMethod,
    pub ok: bool,
    pub msg: String,
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub padding: u32,
    pub connection: String,
    pub data: Vec<u8>,
}

impl RelayResponse {
    pub fn ok(method: RelayMethod, connection: impl Into<String>, addr: String, port: u16) -> Self {
        Self {
            method,
            ok: true,
            msg: String::new(),
            addr: Some(addr),
            port: Some(port),
            padding: 0,
            connection: connection.into(),
            data: Vec::new(),
        }
    }

    pub fn err(method: RelayMethod, msg: impl Into<String>) -> Self {
        Self {
            method,
            ok: false,
            msg: msg.into(),
            addr: None,
            port: None,
            padding: 0,
            connection: String::new(),
            data: Vec::new(),
        }
    }

    pub fn obfuscate(mut self, pool: &SwapsPool) -> Frames {
        let obfuscated = obfs(&self.data, pool);
        self.padding = obfuscated.padding;
        let header = serde_json::to_vec(&(
            self.method,
            self.ok,
            &self.msg,
            &self.addr,
            self.port,
            self.padding,
            &self.connection,
        ))
        .expect("relay response header is always serializable");
        Frames::from_parts(header, obfuscated.swaps, obfuscated.data_obfs)
    }

    pub fn deobfuscate(frames: Frames) -> Result<Self> {
        let (method, ok, msg, addr, port, padding, connection): (
            RelayMethod,
            bool,
            String,
            Option<String>,
            Option<u16>,
            u32,
            String,
        ) = parse_header(&frames.header)?;
        let data = deobfs(&frames.data_obfs, &frames.swaps, padding);
        Ok(Self {
            method,
            ok,
            msg,
            addr,
            port,
            padding,
            connection,
            data,
        })
    }
}

// ── RelayData ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayData {
    pub method: RelayMethod,
    pub padding: u32,
    pub eos: bool,
    pub data: Vec<u8>,
}

impl RelayData {
    pub fn fragment(data: Vec<u8>, eos: bool) -> Self {
        Self {
            method: RelayMethod::Data,
            padding: 0,
            eos,
            data,
        }
    }

    pub fn close() -> Self {
        Self {
            method: RelayMethod::Close,
            padding: 0,
            eos: false,
            data: Vec::new(),
        }
    }

    pub fn obfuscate(mut self, pool: &SwapsPool) -> Frames {
        let obfuscated = obfs(&self.data, pool);
        self.padding = obfuscated.padding;
        let header = serde_json::to_vec(&(self.method, self.padding, self.eos))
            .expect("relay data header is always serializable");
        Frames::from_parts(header, obfuscated.swaps, obfuscated.data_obfs)
    }

    pub fn deobfuscate(frames: Frames) -> Result<Self> {
        let (method, padding, eos): (RelayMethod, u32, bool) = parse_header(&frames.header)?;
        let data = deobfs(&frames.data_obfs, &frames.swaps, padding);
        Ok(Self {
            method,
            padding,
            eos,
            data,
        })
    }
}

fn parse_header<T: for<'de> Deserialize<'de>>(header: &[u8]) -> Result<T> {
    let value: Value = serde_json::from_slice(header)
        .map_err(|e| RelayError::protocol(format!("bad header json: {e}")))?;
    serde_json::from_value(value).map_err(|e| RelayError::protocol(format!("bad header shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip_through_frames() {
        let pool = SwapsPool::new("tok");
        let mut req = RelayRequest::connect("example.com", 80);
        req.data = b"payload bytes".to_vec();
        let frames = req.obfuscate(&pool);
        let back = RelayRequest::deobfuscate(frames).unwrap();
        assert_eq!(back.addr.as_deref(), Some("example.com"));
        assert_eq!(back.port, Some(80));
        assert_eq!(back.data, b"payload bytes");
    }

    #[test]
    fn response_roundtrip_empty_data() {
        let pool = SwapsPool::new("tok");
        let resp = RelayResponse::ok(RelayMethod::Connect, "tcp://1.2.3.4:5", "1.2.3.4".into(), 5);
        let frames = resp.obfuscate(&pool);
        let back = RelayResponse::deobfuscate(frames).unwrap();
        assert!(back.ok);
        assert_eq!(back.connection, "tcp://1.2.3.4:5");
    }

    #[test]
    fn data_roundtrip_with_eos() {
        let pool = SwapsPool::new("tok");
        let frag = RelayData::fragment(b"chunk".to_vec(), true);
        let frames = frag.obfuscate(&pool);
        let back = RelayData::deobfuscate(frames).unwrap();
        assert!(back.eos);
        assert_eq!(back.data, b"chunk");
    }

    #[test]
    fn close_roundtrip() {
        let pool = SwapsPool::new("tok");
        let frames = RelayData::close().obfuscate(&pool);
        let back = RelayData::deobfuscate(frames).unwrap();
        assert_eq!(back.method, RelayMethod::Close);
    }
}

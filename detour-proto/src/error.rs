use std::fmt;

/// Error taxonomy shared by the client and server binaries.
///
/// Variants line up with the failure classes a session can hit: malformed
/// ingress handshakes, a target that can't be reached, a peer resetting the
/// connection out from under a forwarder, the transport itself failing, and
/// the server running out of data-channel ports to hand out.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("upstream dial to {addr} failed: {source}")]
    UpstreamDial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer reset")]
    PeerReset,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no free data port in range")]
    PortExhaustion,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn protocol(msg: impl fmt::Display) -> Self {
        Self::ProtocolViolation(msg.to_string())
    }

    pub fn transport(msg: impl fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// True for errors that are routine (peer hung up) rather than unexpected.
    pub fn is_routine(&self) -> bool {
        match self {
            RelayError::PeerReset => true,
            RelayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

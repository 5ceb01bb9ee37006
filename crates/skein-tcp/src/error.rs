use skein_net::NetError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TcpError>;

#[derive(Debug, Error)]
pub enum TcpError {
    /// A read, write or connect deadline elapsed.
    #[error("timeout during {0}")]
    Timeout(&'static str),

    /// The listener was closed (before or during an accept).
    #[error("listener is closed")]
    ListenerClosed,

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The connection is closed in the direction the operation needs.
    #[error("connection is closed")]
    ConnectionClosed,

    /// An operation that is invalid for the connection's current state.
    #[error("cannot {op} in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// The local two-tuple is already in use by another listener.
    #[error("address already in use")]
    AddrInUse,

    /// No ephemeral port was available for an outgoing connection.
    #[error("no free local port")]
    NoFreePort,

    /// The IP layer failed underneath us.
    #[error(transparent)]
    Net(#[from] NetError),
}

impl TcpError {
    /// True when the error is a deadline expiry, here or in the IP layer.
    pub fn is_timeout(&self) -> bool {
        match self {
            TcpError::Timeout(_) => true,
            TcpError::Net(e) => e.is_timeout(),
            _ => false,
        }
    }
}

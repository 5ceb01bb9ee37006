use skein_packet::PacketError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

/// Errors surfaced by the IP layer. Ingress paths log and drop instead of
/// returning these; public operations annotate and propagate.
#[derive(Debug, Error)]
pub enum NetError {
    /// No routing entry matches the address (carried as display text).
    #[error("no route to {0}")]
    NoRoute(String),

    /// A link payload exceeded the device's MTU.
    #[error("payload exceeds device MTU of {mtu}")]
    MtuExceeded { mtu: usize },

    /// An IP payload exceeded what the length field can express.
    #[error("payload exceeds maximum IP packet size ({max} bytes)")]
    PayloadTooLarge { max: usize },

    /// The egress device has no address of the required family.
    #[error("device has no {0} address")]
    NoAddress(&'static str),

    /// The operation requires the device to be up.
    #[error("device {0} is down")]
    DeviceDown(&'static str),

    /// The operation is invalid in the current state
    /// (e.g. setting an address on an up device).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A device route names a device the host does not own.
    #[error("device is not registered with this host")]
    ForeignDevice,

    /// A header failed structural validation.
    #[error("parse error")]
    Parse(#[from] PacketError),

    /// A deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// The underlying transport failed; passed through with context.
    #[error("{context}")]
    Transport {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// IPv4 and IPv6 arguments were mixed.
    #[error("address family mismatch")]
    FamilyMismatch,

    /// Text that should be a CIDR or address failed to parse.
    #[error("invalid {what}: {input:?}")]
    InvalidText { what: &'static str, input: String },
}

impl NetError {
    /// True when the error is a deadline expiry. Downstream code tests this
    /// generically instead of matching variants.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout(_))
    }

    pub fn is_no_route(&self) -> bool {
        matches!(self, NetError::NoRoute(_))
    }

    pub fn is_mtu(&self) -> bool {
        matches!(self, NetError::MtuExceeded { .. })
    }

    pub(crate) fn transport(context: &'static str, source: std::io::Error) -> Self {
        NetError::Transport { context, source }
    }
}

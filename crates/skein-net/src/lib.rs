#![forbid(unsafe_code)]

//! User-space IP layer: link devices, routing, and per-family hosts.
//!
//! The flow is bottom-up on ingress and top-down on egress. A [`device`]
//! delivers link payloads to the host that registered a callback on it; the
//! host parses the IP header, delivers local datagrams to per-protocol
//! callbacks, and forwards the rest when forwarding is enabled. Egress
//! builds the header, resolves the next hop through the [`route`] table and
//! hands the datagram to the egress device.
//!
//! Everything here is safe for concurrent use: hosts and devices keep their
//! state behind read-mostly locks, and background receive daemons are
//! managed through the [`lifecycle`] primitive.

pub mod addr;
pub mod device;
pub mod dual;
pub mod error;
pub mod ipv4_host;
pub mod ipv6_host;
pub mod lifecycle;
pub mod route;
pub mod testutil;
pub mod udp_device;

pub use addr::{parse_cidr4, parse_cidr6, IpSubnet, Ipv4Subnet, Ipv6Subnet, MaskAddr, Subnet};
pub use device::{Device, DeviceId, Ipv4Callback, Ipv4Device, Ipv6Callback, Ipv6Device};
pub use dual::DualStackHost;
pub use error::{NetError, Result};
pub use ipv4_host::Ipv4Host;
pub use ipv6_host::Ipv6Host;
pub use lifecycle::{Daemon, Lifecycle, StopSignal};
pub use udp_device::{UdpTunnelConfig, UdpTunnelDevice};

/// IP protocol number for TCP, the only protocol the workspace registers
/// out of the box; the callback table carries all 256 slots.
pub const IP_PROTO_TCP: u8 = 6;

/// Default TTL (IPv4) and hop limit (IPv6) for datagrams originated here.
pub const DEFAULT_TTL: u8 = 32;

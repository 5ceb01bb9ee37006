//! The seam between TCP and the IP layer.
//!
//! TCP is generic over one address family at a time; [`IpStack`] is what a
//! family must provide: segment ingress registration, datagram egress,
//! source-address selection and the pseudo-header checksum. The two
//! implementations wrap the per-family IP hosts, keeping each TCP host
//! monomorphic instead of dispatching per packet.

use std::fmt;
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use skein_net::{Ipv4Host, Ipv6Host, NetError, IP_PROTO_TCP};
use skein_packet::checksum;

/// Segment ingress callback: `(segment, src, dst)` with the segment still
/// carrying its TCP header.
pub type SegmentCallback<A> = Arc<dyn Fn(&[u8], A, A) + Send + Sync>;

pub trait IpStack: Clone + Send + Sync + 'static {
    type Addr: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Largest segment payload that still fits a 1500-byte link MTU under
    /// this family's IP header.
    const DEFAULT_MSS: u16;

    /// Installs the TCP protocol handler on the IP host.
    fn register_tcp(&self, callback: SegmentCallback<Self::Addr>);

    /// Clears the TCP protocol handler.
    fn unregister_tcp(&self);

    /// Sends one TCP segment to `dst`.
    fn send(&self, segment: &[u8], dst: Self::Addr) -> Result<usize, NetError>;

    /// The source address this stack would use to reach `dst`.
    fn source_for(&self, dst: Self::Addr) -> Result<Self::Addr, NetError>;

    /// Transport checksum over the family's pseudo-header and `segment`.
    fn checksum(src: Self::Addr, dst: Self::Addr, segment: &[u8]) -> u16;
}

impl IpStack for Ipv4Host {
    type Addr = Ipv4Addr;

    const DEFAULT_MSS: u16 = 1460;

    fn register_tcp(&self, callback: SegmentCallback<Ipv4Addr>) {
        self.register_callback(Some(callback), IP_PROTO_TCP);
    }

    fn unregister_tcp(&self) {
        self.register_callback(None, IP_PROTO_TCP);
    }

    fn send(&self, segment: &[u8], dst: Ipv4Addr) -> Result<usize, NetError> {
        self.write_to(segment, dst, IP_PROTO_TCP)
    }

    fn source_for(&self, dst: Ipv4Addr) -> Result<Ipv4Addr, NetError> {
        Ipv4Host::source_for(self, dst)
    }

    fn checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
        checksum::tcp_ipv4(src, dst, segment)
    }
}

impl IpStack for Ipv6Host {
    type Addr = Ipv6Addr;

    const DEFAULT_MSS: u16 = 1440;

    fn register_tcp(&self, callback: SegmentCallback<Ipv6Addr>) {
        self.register_callback(Some(callback), IP_PROTO_TCP);
    }

    fn unregister_tcp(&self) {
        self.register_callback(None, IP_PROTO_TCP);
    }

    fn send(&self, segment: &[u8], dst: Ipv6Addr) -> Result<usize, NetError> {
        self.write_to(segment, dst, IP_PROTO_TCP)
    }

    fn source_for(&self, dst: Ipv6Addr) -> Result<Ipv6Addr, NetError> {
        Ipv6Host::source_for(self, dst)
    }

    fn checksum(src: Ipv6Addr, dst: Ipv6Addr, segment: &[u8]) -> u16 {
        checksum::tcp_ipv6(src, dst, segment)
    }
}

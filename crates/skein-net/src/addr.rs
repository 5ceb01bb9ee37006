//! Subnets and CIDR notation over the standard library address types.
//!
//! A subnet is an `(address, netmask)` pair; the significant bits are those
//! where the netmask is set. Membership and equality always apply the mask
//! to both sides first, so `10.1.2.3/255.0.0.0` and `10.9.9.9/255.0.0.0`
//! denote the same subnet.

use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{NetError, Result};

/// An IP address that can be masked. Implemented for the two concrete
/// standard-library address types; everything generic over families in this
/// workspace bounds on it.
pub trait MaskAddr:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    const BITS: u8;

    fn mask(self, netmask: Self) -> Self;

    /// Netmask with the top `prefix` bits set. `None` if out of range.
    fn from_prefix(prefix: u8) -> Option<Self>;

    /// Prefix length when the netmask is contiguous.
    fn prefix_len(self) -> Option<u8>;
}

impl MaskAddr for Ipv4Addr {
    const BITS: u8 = 32;

    fn mask(self, netmask: Self) -> Self {
        Ipv4Addr::from(u32::from(self) & u32::from(netmask))
    }

    fn from_prefix(prefix: u8) -> Option<Self> {
        match prefix {
            0 => Some(Ipv4Addr::UNSPECIFIED),
            1..=32 => Some(Ipv4Addr::from(u32::MAX << (32 - prefix))),
            _ => None,
        }
    }

    fn prefix_len(self) -> Option<u8> {
        let bits = u32::from(self);
        let ones = bits.leading_ones();
        (bits << ones == 0 || ones == 32).then_some(ones as u8)
    }
}

impl MaskAddr for Ipv6Addr {
    const BITS: u8 = 128;

    fn mask(self, netmask: Self) -> Self {
        Ipv6Addr::from(u128::from(self) & u128::from(netmask))
    }

    fn from_prefix(prefix: u8) -> Option<Self> {
        match prefix {
            0 => Some(Ipv6Addr::UNSPECIFIED),
            1..=128 => Some(Ipv6Addr::from(u128::MAX << (128 - prefix))),
            _ => None,
        }
    }

    fn prefix_len(self) -> Option<u8> {
        let bits = u128::from(self);
        let ones = bits.leading_ones();
        (bits << ones == 0 || ones == 128).then_some(ones as u8)
    }
}

/// An `(address, netmask)` pair for one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet<A: MaskAddr> {
    pub addr: A,
    pub netmask: A,
}

pub type Ipv4Subnet = Subnet<Ipv4Addr>;
pub type Ipv6Subnet = Subnet<Ipv6Addr>;

impl<A: MaskAddr> Subnet<A> {
    pub fn new(addr: A, netmask: A) -> Self {
        Subnet { addr, netmask }
    }

    /// The network address: the subnet's address with host bits cleared.
    pub fn network(&self) -> A {
        self.addr.mask(self.netmask)
    }

    /// True when `addr` falls inside the subnet.
    pub fn contains(&self, addr: A) -> bool {
        addr.mask(self.netmask) == self.network()
    }

    /// Masked equality: same network under the same netmask.
    pub fn net_eq(&self, other: &Subnet<A>) -> bool {
        self.netmask == other.netmask && self.network() == other.network()
    }
}

impl<A: MaskAddr> fmt::Display for Subnet<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.netmask.prefix_len() {
            Some(p) => write!(f, "{}/{}", self.network(), p),
            None => write!(f, "{}/{}", self.network(), self.netmask),
        }
    }
}

/// A subnet of either family. Used at dual-stack seams; the per-family
/// hosts stay monomorphic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpSubnet {
    V4(Ipv4Subnet),
    V6(Ipv6Subnet),
}

impl IpSubnet {
    pub fn same_family(&self, addr: IpAddr) -> bool {
        matches!(
            (self, addr),
            (IpSubnet::V4(_), IpAddr::V4(_)) | (IpSubnet::V6(_), IpAddr::V6(_))
        )
    }
}

impl From<Ipv4Subnet> for IpSubnet {
    fn from(s: Ipv4Subnet) -> Self {
        IpSubnet::V4(s)
    }
}

impl From<Ipv6Subnet> for IpSubnet {
    fn from(s: Ipv6Subnet) -> Self {
        IpSubnet::V6(s)
    }
}

fn split_cidr<'a>(s: &'a str, what: &'static str) -> Result<(&'a str, &'a str)> {
    s.split_once('/').ok_or_else(|| NetError::InvalidText {
        what,
        input: s.to_string(),
    })
}

/// Parses `a.b.c.d/len` into the host address and its subnet.
pub fn parse_cidr4(s: &str) -> Result<(Ipv4Addr, Ipv4Subnet)> {
    let bad = || NetError::InvalidText {
        what: "IPv4 CIDR",
        input: s.to_string(),
    };
    let (addr, prefix) = split_cidr(s, "IPv4 CIDR")?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
    let prefix: u8 = prefix.parse().map_err(|_| bad())?;
    let netmask = Ipv4Addr::from_prefix(prefix).ok_or_else(bad)?;
    Ok((addr, Subnet::new(addr.mask(netmask), netmask)))
}

/// Parses `addr/len` into the host address and its subnet.
pub fn parse_cidr6(s: &str) -> Result<(Ipv6Addr, Ipv6Subnet)> {
    let bad = || NetError::InvalidText {
        what: "IPv6 CIDR",
        input: s.to_string(),
    };
    let (addr, prefix) = split_cidr(s, "IPv6 CIDR")?;
    let addr: Ipv6Addr = addr.parse().map_err(|_| bad())?;
    let prefix: u8 = prefix.parse().map_err(|_| bad())?;
    let netmask = Ipv6Addr::from_prefix(prefix).ok_or_else(bad)?;
    Ok((addr, Subnet::new(addr.mask(netmask), netmask)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr4_round_trip() {
        let (addr, subnet) = parse_cidr4("198.51.100.1/24").unwrap();
        assert_eq!(addr, Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(subnet.network(), Ipv4Addr::new(198, 51, 100, 0));
        assert_eq!(subnet.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert!(subnet.contains(Ipv4Addr::new(198, 51, 100, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(198, 51, 101, 0)));
    }

    #[test]
    fn cidr4_rejects_garbage() {
        assert!(parse_cidr4("198.51.100.1").is_err());
        assert!(parse_cidr4("198.51.100.1/33").is_err());
        assert!(parse_cidr4("not-an-ip/8").is_err());
    }

    #[test]
    fn cidr6_round_trip() {
        let (addr, subnet) = parse_cidr6("fd00::1/64").unwrap();
        assert_eq!(addr, "fd00::1".parse::<Ipv6Addr>().unwrap());
        assert!(subnet.contains("fd00::dead:beef".parse().unwrap()));
        assert!(!subnet.contains("fd01::1".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything() {
        let (_, subnet) = parse_cidr4("0.0.0.0/0").unwrap();
        assert!(subnet.contains(Ipv4Addr::new(255, 255, 255, 255)));
    }

    #[test]
    fn masked_equality() {
        let a = Subnet::new(
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(255, 0, 0, 0),
        );
        let b = Subnet::new(
            Ipv4Addr::new(10, 9, 9, 9),
            Ipv4Addr::new(255, 0, 0, 0),
        );
        assert!(a.net_eq(&b));

        // Equal iff mutually containing with the same netmask.
        assert_eq!(
            a.net_eq(&b),
            a.contains(b.addr) && b.contains(a.addr) && a.netmask == b.netmask
        );

        let c = Subnet::new(
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(255, 255, 0, 0),
        );
        assert!(!a.net_eq(&c));
    }

    #[test]
    fn prefix_len_detects_non_contiguous_masks() {
        assert_eq!(Ipv4Addr::new(255, 255, 255, 0).prefix_len(), Some(24));
        assert_eq!(Ipv4Addr::new(255, 0, 255, 0).prefix_len(), None);
        assert_eq!(Ipv4Addr::UNSPECIFIED.prefix_len(), Some(0));
        assert_eq!(Ipv4Addr::new(255, 255, 255, 255).prefix_len(), Some(32));
    }
}

//! The dual-stack facade: one IPv4 host and one IPv6 host behind a single
//! surface. Each family stays monomorphic; this type only dispatches on
//! the address family at the boundary.

use std::net::IpAddr;
use std::sync::Arc;

use crate::addr::IpSubnet;
use crate::device::{Ipv4Device, Ipv6Device};
use crate::error::{NetError, Result};
use crate::ipv4_host::Ipv4Host;
use crate::ipv6_host::Ipv6Host;

#[derive(Clone, Default)]
pub struct DualStackHost {
    v4: Ipv4Host,
    v6: Ipv6Host,
}

impl DualStackHost {
    pub fn new() -> DualStackHost {
        DualStackHost {
            v4: Ipv4Host::new(),
            v6: Ipv6Host::new(),
        }
    }

    pub fn ipv4(&self) -> &Ipv4Host {
        &self.v4
    }

    pub fn ipv6(&self) -> &Ipv6Host {
        &self.v6
    }

    /// Adds a device implementing both families to both hosts.
    pub fn add_device<D>(&self, device: Arc<D>)
    where
        D: Ipv4Device + Ipv6Device + 'static,
    {
        self.v4.add_device(device.clone());
        self.v6.add_device(device);
    }

    /// Adds an IPv4-only device.
    pub fn add_ipv4_device(&self, device: Arc<dyn Ipv4Device>) {
        self.v4.add_device(device);
    }

    /// Adds an IPv6-only device.
    pub fn add_ipv6_device(&self, device: Arc<dyn Ipv6Device>) {
        self.v6.add_device(device);
    }

    /// Adds a next-hop route. The subnet and next hop must be of the same
    /// family.
    pub fn add_route(&self, subnet: IpSubnet, next_hop: IpAddr) -> Result<()> {
        match (subnet, next_hop) {
            (IpSubnet::V4(subnet), IpAddr::V4(next_hop)) => {
                self.v4.add_route(subnet, next_hop);
                Ok(())
            }
            (IpSubnet::V6(subnet), IpAddr::V6(next_hop)) => {
                self.v6.add_route(subnet, next_hop);
                Ok(())
            }
            _ => Err(NetError::FamilyMismatch),
        }
    }

    /// Turns forwarding on or off for both families.
    pub fn set_forwarding(&self, on: bool) {
        self.v4.set_forwarding(on);
        self.v6.set_forwarding(on);
    }

    /// Sends `payload` to `dst`, dispatching on the family of `dst`.
    pub fn write_to(&self, payload: &[u8], dst: IpAddr, protocol: u8) -> Result<usize> {
        match dst {
            IpAddr::V4(dst) => self.v4.write_to(payload, dst, protocol),
            IpAddr::V6(dst) => self.v6.write_to(payload, dst, protocol),
        }
    }
}

//! Link-layer device traits.
//!
//! A device owns a transport (a datagram socket in this workspace, but the
//! trait does not care) and delivers incoming link payloads, already
//! stripped of any link framing, to a single registered callback per
//! address family. Hosts register that callback when a device is added and
//! clear it on removal.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::error::Result;

/// Ingress callback for one address family. The payload is a complete IP
/// datagram.
pub type Ipv4Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type Ipv6Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Family-independent device surface.
pub trait Device: Send + Sync {
    /// A human-readable name for logs and route listings.
    fn name(&self) -> &str;

    /// Brings the device up: opens the transport and starts the receive
    /// daemon. No-op when already up.
    fn bring_up(&self) -> Result<()>;

    /// Brings the device down: stops the receive daemon and closes the
    /// transport. No-op when already down.
    fn bring_down(&self) -> Result<()>;

    fn is_up(&self) -> bool;

    /// The fixed maximum transmission unit. Always positive.
    fn mtu(&self) -> usize;
}

/// A device able to carry IPv4.
pub trait Ipv4Device: Device {
    /// The device's IPv4 address and netmask, when set.
    fn ipv4(&self) -> Option<(Ipv4Addr, Ipv4Addr)>;

    /// Sets the address and netmask. Fails while the device is up.
    fn set_ipv4(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<()>;

    /// Clears the address. Fails while the device is up.
    fn unset_ipv4(&self) -> Result<()>;

    /// Replaces (or, with `None`, clears) the ingress callback.
    fn register_ipv4_callback(&self, callback: Option<Ipv4Callback>);

    /// Writes one IPv4 datagram to the link peer. Fails with an MTU error
    /// when the payload is too large and a down-device error when the
    /// device is not up. Returns the number of payload bytes written.
    fn write_to_ipv4(&self, payload: &[u8], peer: Ipv4Addr) -> Result<usize>;
}

/// A device able to carry IPv6.
pub trait Ipv6Device: Device {
    fn ipv6(&self) -> Option<(Ipv6Addr, Ipv6Addr)>;
    fn set_ipv6(&self, addr: Ipv6Addr, netmask: Ipv6Addr) -> Result<()>;
    fn unset_ipv6(&self) -> Result<()>;
    fn register_ipv6_callback(&self, callback: Option<Ipv6Callback>);
    fn write_to_ipv6(&self, payload: &[u8], peer: Ipv6Addr) -> Result<usize>;
}

/// Identity of a device registration, independent of which trait object it
/// is viewed through. Two `Arc`s pointing at the same device allocation
/// compare equal even when one is an `Arc<dyn Ipv4Device>` and the other an
/// `Arc<dyn Ipv6Device>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(usize);

impl DeviceId {
    pub fn of_ipv4(dev: &Arc<dyn Ipv4Device>) -> DeviceId {
        DeviceId(Arc::as_ptr(dev) as *const () as usize)
    }

    pub fn of_ipv6(dev: &Arc<dyn Ipv6Device>) -> DeviceId {
        DeviceId(Arc::as_ptr(dev) as *const () as usize)
    }

    #[cfg(test)]
    pub(crate) fn of_test(raw: usize) -> DeviceId {
        DeviceId(raw)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:#x})", self.0)
    }
}

//! The per-family routing table.
//!
//! Two kinds of entries: next-hop routes (`subnet -> peer IP`) and device
//! routes (`subnet -> device`, meaning the subnet is directly attached).
//! Entries are probed in insertion order and the first match wins; there is
//! no longest-prefix refinement. The table carries no lock of its own — it
//! lives inside the owning host's read-mostly lock.

use crate::addr::{MaskAddr, Subnet};
use crate::device::DeviceId;

/// A next-hop route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<A: MaskAddr> {
    pub subnet: Subnet<A>,
    pub next_hop: A,
}

/// A device route: the subnet is reachable on the link behind `device`.
#[derive(Clone)]
pub struct DeviceRoute<A: MaskAddr, D: Clone> {
    pub subnet: Subnet<A>,
    pub id: DeviceId,
    pub device: D,
}

pub struct RoutingTable<A: MaskAddr, D: Clone> {
    routes: Vec<Route<A>>,
    device_routes: Vec<DeviceRoute<A, D>>,
}

impl<A: MaskAddr, D: Clone> Default for RoutingTable<A, D> {
    fn default() -> Self {
        RoutingTable {
            routes: Vec::new(),
            device_routes: Vec::new(),
        }
    }
}

impl<A: MaskAddr, D: Clone> RoutingTable<A, D> {
    /// Adds a next-hop route, updating in place when an entry with a
    /// masked-equal subnet already exists.
    pub fn add_route(&mut self, subnet: Subnet<A>, next_hop: A) {
        for route in &mut self.routes {
            if route.subnet.net_eq(&subnet) {
                route.next_hop = next_hop;
                return;
            }
        }
        self.routes.push(Route { subnet, next_hop });
    }

    pub fn delete_route(&mut self, subnet: Subnet<A>) {
        self.routes.retain(|r| !r.subnet.net_eq(&subnet));
    }

    /// Adds a device route, updating in place on a masked-equal subnet.
    pub fn add_device_route(&mut self, subnet: Subnet<A>, id: DeviceId, device: D) {
        for route in &mut self.device_routes {
            if route.subnet.net_eq(&subnet) {
                route.id = id;
                route.device = device;
                return;
            }
        }
        self.device_routes.push(DeviceRoute { subnet, id, device });
    }

    pub fn delete_device_route(&mut self, subnet: Subnet<A>) {
        self.device_routes.retain(|r| !r.subnet.net_eq(&subnet));
    }

    /// Drops every device route pointing at `id` (used when a device is
    /// removed from the host).
    pub fn purge_device(&mut self, id: DeviceId) {
        self.device_routes.retain(|r| r.id != id);
    }

    /// Resolves `addr` to `(next_hop, egress device)`.
    ///
    /// A matching device route means the destination is locally connected:
    /// the next hop is the destination itself. Otherwise the first matching
    /// next-hop route is resolved against the device routes; a next hop
    /// that no device route covers is a miss.
    pub fn lookup(&self, addr: A) -> Option<(A, D)> {
        if let Some(route) = self.lookup_device_route(addr) {
            return Some((addr, route.device.clone()));
        }
        let route = self.routes.iter().find(|r| r.subnet.contains(addr))?;
        let egress = self.lookup_device_route(route.next_hop)?;
        Some((route.next_hop, egress.device.clone()))
    }

    fn lookup_device_route(&self, addr: A) -> Option<&DeviceRoute<A, D>> {
        self.device_routes.iter().find(|r| r.subnet.contains(addr))
    }

    /// Snapshot of the next-hop routes; callers may inspect it without
    /// holding the host lock.
    pub fn routes(&self) -> Vec<Route<A>> {
        self.routes.clone()
    }

    pub fn device_routes(&self) -> Vec<DeviceRoute<A, D>> {
        self.device_routes.clone()
    }
}

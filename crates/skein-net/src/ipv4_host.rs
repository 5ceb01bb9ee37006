//! The IPv4 host: device registry, routing, ingress dispatch, egress
//! header construction and forwarding.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use skein_packet::ipv4::{self, Ipv4Header};

use crate::addr::Ipv4Subnet;
use crate::device::{DeviceId, Ipv4Device};
use crate::error::{NetError, Result};
use crate::route::{DeviceRoute, Route, RoutingTable};
use crate::DEFAULT_TTL;

/// Upper-layer handler for one IP protocol number. Receives the payload
/// past the header plus the source and destination addresses.
pub type Ipv4ProtocolCallback = Arc<dyn Fn(&[u8], Ipv4Addr, Ipv4Addr) + Send + Sync>;

struct RegisteredDevice {
    id: DeviceId,
    device: Arc<dyn Ipv4Device>,
}

struct HostState {
    devices: Vec<RegisteredDevice>,
    table: RoutingTable<Ipv4Addr, Arc<dyn Ipv4Device>>,
    callbacks: Vec<Option<Ipv4ProtocolCallback>>, // 256 slots
    forwarding: bool,
}

struct HostCore {
    state: RwLock<HostState>,
}

/// The per-family engine for IPv4.
///
/// `Ipv4Host` is a cheap handle: clones share all state, including the
/// default TTL. [`Ipv4Host::config_overlay`] produces a handle that shares
/// the devices, routes, callbacks and forwarding flag but owns its own
/// default TTL, so one consumer can originate datagrams with a different
/// hop count without affecting anyone else.
#[derive(Clone)]
pub struct Ipv4Host {
    core: Arc<HostCore>,
    default_ttl: Arc<AtomicU8>,
}

impl Default for Ipv4Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipv4Host {
    pub fn new() -> Ipv4Host {
        Ipv4Host {
            core: Arc::new(HostCore {
                state: RwLock::new(HostState {
                    devices: Vec::new(),
                    table: RoutingTable::default(),
                    callbacks: (0..256).map(|_| None).collect(),
                    forwarding: false,
                }),
            }),
            default_ttl: Arc::new(AtomicU8::new(DEFAULT_TTL)),
        }
    }

    /// A handle sharing everything with `self` except the default TTL,
    /// which starts back at the stack-wide default. Mutations through the
    /// overlay other than the TTL affect the parent.
    pub fn config_overlay(&self) -> Ipv4Host {
        Ipv4Host {
            core: self.core.clone(),
            default_ttl: Arc::new(AtomicU8::new(DEFAULT_TTL)),
        }
    }

    /// Default TTL for datagrams originated through this handle.
    pub fn default_ttl(&self) -> u8 {
        self.default_ttl.load(Ordering::Relaxed)
    }

    /// Sets the default TTL. Zero restores the stack-wide default.
    pub fn set_default_ttl(&self, ttl: u8) {
        let ttl = if ttl == 0 { DEFAULT_TTL } else { ttl };
        self.default_ttl.store(ttl, Ordering::Relaxed);
    }

    /// Registers `device`, routing its inbound IPv4 datagrams through this
    /// host. Idempotent.
    pub fn add_device(&self, device: Arc<dyn Ipv4Device>) {
        let id = DeviceId::of_ipv4(&device);
        let mut state = self.core.state.write().unwrap();
        if state.devices.iter().any(|d| d.id == id) {
            return;
        }
        let weak = Arc::downgrade(&self.core);
        device.register_ipv4_callback(Some(Arc::new(move |frame| {
            if let Some(core) = weak.upgrade() {
                core.ingress(frame);
            }
        })));
        state.devices.push(RegisteredDevice { id, device });
    }

    /// Unregisters `device`, clearing its ingress callback and dropping
    /// any device routes that point at it. Idempotent.
    pub fn remove_device(&self, device: &Arc<dyn Ipv4Device>) {
        let id = DeviceId::of_ipv4(device);
        let mut state = self.core.state.write().unwrap();
        let Some(pos) = state.devices.iter().position(|d| d.id == id) else {
            return;
        };
        state.devices.remove(pos);
        state.table.purge_device(id);
        device.register_ipv4_callback(None);
    }

    pub fn add_route(&self, subnet: Ipv4Subnet, next_hop: Ipv4Addr) {
        self.core
            .state
            .write()
            .unwrap()
            .table
            .add_route(subnet, next_hop);
    }

    pub fn delete_route(&self, subnet: Ipv4Subnet) {
        self.core.state.write().unwrap().table.delete_route(subnet);
    }

    /// Adds a device route. The device must already be registered with
    /// this host; a foreign device is rejected.
    pub fn add_device_route(&self, subnet: Ipv4Subnet, device: Arc<dyn Ipv4Device>) -> Result<()> {
        let id = DeviceId::of_ipv4(&device);
        let mut state = self.core.state.write().unwrap();
        if !state.devices.iter().any(|d| d.id == id) {
            return Err(NetError::ForeignDevice);
        }
        state.table.add_device_route(subnet, id, device);
        Ok(())
    }

    pub fn delete_device_route(&self, subnet: Ipv4Subnet) {
        self.core
            .state
            .write()
            .unwrap()
            .table
            .delete_device_route(subnet);
    }

    /// Snapshot of the next-hop routes.
    pub fn routes(&self) -> Vec<Route<Ipv4Addr>> {
        self.core.state.read().unwrap().table.routes()
    }

    /// Snapshot of the device routes.
    pub fn device_routes(&self) -> Vec<DeviceRoute<Ipv4Addr, Arc<dyn Ipv4Device>>> {
        self.core.state.read().unwrap().table.device_routes()
    }

    pub fn set_forwarding(&self, on: bool) {
        self.core.state.write().unwrap().forwarding = on;
    }

    pub fn forwarding(&self) -> bool {
        self.core.state.read().unwrap().forwarding
    }

    /// Installs `callback` as the handler for `protocol`; `None` clears
    /// the slot. Replaces any previous handler.
    pub fn register_callback(&self, callback: Option<Ipv4ProtocolCallback>, protocol: u8) {
        self.core.state.write().unwrap().callbacks[protocol as usize] = callback;
    }

    /// Source address this host would use to reach `dst`: the address of
    /// the egress device on the route there.
    pub fn source_for(&self, dst: Ipv4Addr) -> Result<Ipv4Addr> {
        let state = self.core.state.read().unwrap();
        let (_, device) = state
            .table
            .lookup(dst)
            .ok_or_else(|| NetError::NoRoute(dst.to_string()))?;
        let (addr, _) = device.ipv4().ok_or(NetError::NoAddress("IPv4"))?;
        Ok(addr)
    }

    /// Sends `payload` as protocol `protocol` to `dst` with this handle's
    /// default TTL. Returns bytes written net of the IP header.
    pub fn write_to(&self, payload: &[u8], dst: Ipv4Addr, protocol: u8) -> Result<usize> {
        self.write_to_with_ttl(payload, dst, protocol, self.default_ttl())
    }

    /// Like [`Ipv4Host::write_to`] with an explicit TTL.
    pub fn write_to_with_ttl(
        &self,
        payload: &[u8],
        dst: Ipv4Addr,
        protocol: u8,
        ttl: u8,
    ) -> Result<usize> {
        const MAX_PAYLOAD: usize = ipv4::MAX_TOTAL_LEN - ipv4::HEADER_LEN;
        if payload.len() > MAX_PAYLOAD {
            return Err(NetError::PayloadTooLarge { max: MAX_PAYLOAD });
        }

        let (next_hop, device, src) = {
            let state = self.core.state.read().unwrap();
            let (next_hop, device) = state
                .table
                .lookup(dst)
                .ok_or_else(|| NetError::NoRoute(dst.to_string()))?;
            let (src, _) = device.ipv4().ok_or(NetError::NoAddress("IPv4"))?;
            (next_hop, device, src)
        };

        let total_len = ipv4::HEADER_LEN + payload.len();
        let header = Ipv4Header {
            total_len: total_len as u16,
            ttl,
            protocol,
            src,
            dst,
            ..Ipv4Header::default()
        };
        let mut datagram = vec![0u8; total_len];
        header.emit(&mut datagram)?;
        datagram[ipv4::HEADER_LEN..].copy_from_slice(payload);

        let written = device.write_to_ipv4(&datagram, next_hop)?;
        Ok(written.saturating_sub(ipv4::HEADER_LEN))
    }
}

impl HostCore {
    /// Ingress dispatch, invoked by a device with a fully-formed IPv4
    /// datagram. Malformed input is dropped, never surfaced.
    fn ingress(self: &Arc<Self>, frame: &[u8]) {
        let Ok((header, header_len)) = Ipv4Header::parse(frame) else {
            debug!(len = frame.len(), "dropping malformed IPv4 datagram");
            return;
        };
        let total_len = header.total_len as usize;
        if frame.len() < total_len {
            debug!(
                got = frame.len(),
                total_len, "dropping IPv4 datagram shorter than its length field"
            );
            return;
        }
        let datagram = &frame[..total_len];
        let payload = &datagram[header_len..];

        enum Verdict {
            Deliver(Ipv4ProtocolCallback),
            Forward(Ipv4Addr, Arc<dyn Ipv4Device>),
            Drop,
        }

        // Decide under the shared lock, act after releasing it, so that a
        // slow upper-layer callback or device write never holds up other
        // ingress paths or waits behind lock writers.
        let verdict = {
            let state = self.state.read().unwrap();
            let us = state
                .devices
                .iter()
                .any(|d| d.device.ipv4().is_some_and(|(addr, _)| addr == header.dst));
            if us {
                match state.callbacks[header.protocol as usize].clone() {
                    Some(callback) => Verdict::Deliver(callback),
                    None => {
                        debug!(protocol = header.protocol, "no handler for protocol");
                        Verdict::Drop
                    }
                }
            } else if state.forwarding {
                if header.ttl < 2 {
                    // Would reach zero on the next hop. A fuller stack
                    // answers with ICMP Time Exceeded.
                    debug!(dst = %header.dst, "dropping forwarded datagram: TTL expired");
                    Verdict::Drop
                } else {
                    match state.table.lookup(header.dst) {
                        Some((next_hop, device)) => Verdict::Forward(next_hop, device),
                        None => {
                            debug!(dst = %header.dst, "no route for forwarded datagram");
                            Verdict::Drop
                        }
                    }
                }
            } else {
                Verdict::Drop
            }
        };

        match verdict {
            Verdict::Deliver(callback) => callback(payload, header.src, header.dst),
            Verdict::Forward(next_hop, device) => {
                let mut out = datagram.to_vec();
                if ipv4::set_ttl(&mut out, header.ttl - 1).is_err() {
                    return;
                }
                if let Err(error) = device.write_to_ipv4(&out, next_hop) {
                    warn!(%error, dst = %header.dst, "forwarding write failed");
                }
            }
            Verdict::Drop => {}
        }
    }
}

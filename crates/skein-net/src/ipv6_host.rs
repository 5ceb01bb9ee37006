//! The IPv6 host. Mirrors [`crate::ipv4_host`] with hop limits instead of
//! TTLs and the 40-byte fixed header.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use skein_packet::ipv6::{self, Ipv6Header};

use crate::addr::Ipv6Subnet;
use crate::device::{DeviceId, Ipv6Device};
use crate::error::{NetError, Result};
use crate::route::{DeviceRoute, Route, RoutingTable};
use crate::DEFAULT_TTL;

pub type Ipv6ProtocolCallback = Arc<dyn Fn(&[u8], Ipv6Addr, Ipv6Addr) + Send + Sync>;

struct RegisteredDevice {
    id: DeviceId,
    device: Arc<dyn Ipv6Device>,
}

struct HostState {
    devices: Vec<RegisteredDevice>,
    table: RoutingTable<Ipv6Addr, Arc<dyn Ipv6Device>>,
    callbacks: Vec<Option<Ipv6ProtocolCallback>>, // 256 slots
    forwarding: bool,
}

struct HostCore {
    state: RwLock<HostState>,
}

/// The per-family engine for IPv6. Cheap to clone;
/// [`Ipv6Host::config_overlay`] shares everything but the default hop
/// limit.
#[derive(Clone)]
pub struct Ipv6Host {
    core: Arc<HostCore>,
    default_hops: Arc<AtomicU8>,
}

impl Default for Ipv6Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipv6Host {
    pub fn new() -> Ipv6Host {
        Ipv6Host {
            core: Arc::new(HostCore {
                state: RwLock::new(HostState {
                    devices: Vec::new(),
                    table: RoutingTable::default(),
                    callbacks: (0..256).map(|_| None).collect(),
                    forwarding: false,
                }),
            }),
            default_hops: Arc::new(AtomicU8::new(DEFAULT_TTL)),
        }
    }

    pub fn config_overlay(&self) -> Ipv6Host {
        Ipv6Host {
            core: self.core.clone(),
            default_hops: Arc::new(AtomicU8::new(DEFAULT_TTL)),
        }
    }

    pub fn default_hop_limit(&self) -> u8 {
        self.default_hops.load(Ordering::Relaxed)
    }

    /// Sets the default hop limit. Zero restores the stack-wide default.
    pub fn set_default_hop_limit(&self, hops: u8) {
        let hops = if hops == 0 { DEFAULT_TTL } else { hops };
        self.default_hops.store(hops, Ordering::Relaxed);
    }

    pub fn add_device(&self, device: Arc<dyn Ipv6Device>) {
        let id = DeviceId::of_ipv6(&device);
        let mut state = self.core.state.write().unwrap();
        if state.devices.iter().any(|d| d.id == id) {
            return;
        }
        let weak = Arc::downgrade(&self.core);
        device.register_ipv6_callback(Some(Arc::new(move |frame| {
            if let Some(core) = weak.upgrade() {
                core.ingress(frame);
            }
        })));
        state.devices.push(RegisteredDevice { id, device });
    }

    pub fn remove_device(&self, device: &Arc<dyn Ipv6Device>) {
        let id = DeviceId::of_ipv6(device);
        let mut state = self.core.state.write().unwrap();
        let Some(pos) = state.devices.iter().position(|d| d.id == id) else {
            return;
        };
        state.devices.remove(pos);
        state.table.purge_device(id);
        device.register_ipv6_callback(None);
    }

    pub fn add_route(&self, subnet: Ipv6Subnet, next_hop: Ipv6Addr) {
        self.core
            .state
            .write()
            .unwrap()
            .table
            .add_route(subnet, next_hop);
    }

    pub fn delete_route(&self, subnet: Ipv6Subnet) {
        self.core.state.write().unwrap().table.delete_route(subnet);
    }

    /// Adds a device route, rejecting devices not registered with this
    /// host.
    pub fn add_device_route(&self, subnet: Ipv6Subnet, device: Arc<dyn Ipv6Device>) -> Result<()> {
        let id = DeviceId::of_ipv6(&device);
        let mut state = self.core.state.write().unwrap();
        if !state.devices.iter().any(|d| d.id == id) {
            return Err(NetError::ForeignDevice);
        }
        state.table.add_device_route(subnet, id, device);
        Ok(())
    }

    pub fn delete_device_route(&self, subnet: Ipv6Subnet) {
        self.core
            .state
            .write()
            .unwrap()
            .table
            .delete_device_route(subnet);
    }

    pub fn routes(&self) -> Vec<Route<Ipv6Addr>> {
        self.core.state.read().unwrap().table.routes()
    }

    pub fn device_routes(&self) -> Vec<DeviceRoute<Ipv6Addr, Arc<dyn Ipv6Device>>> {
        self.core.state.read().unwrap().table.device_routes()
    }

    pub fn set_forwarding(&self, on: bool) {
        self.core.state.write().unwrap().forwarding = on;
    }

    pub fn forwarding(&self) -> bool {
        self.core.state.read().unwrap().forwarding
    }

    pub fn register_callback(&self, callback: Option<Ipv6ProtocolCallback>, protocol: u8) {
        self.core.state.write().unwrap().callbacks[protocol as usize] = callback;
    }

    pub fn source_for(&self, dst: Ipv6Addr) -> Result<Ipv6Addr> {
        let state = self.core.state.read().unwrap();
        let (_, device) = state
            .table
            .lookup(dst)
            .ok_or_else(|| NetError::NoRoute(dst.to_string()))?;
        let (addr, _) = device.ipv6().ok_or(NetError::NoAddress("IPv6"))?;
        Ok(addr)
    }

    pub fn write_to(&self, payload: &[u8], dst: Ipv6Addr, protocol: u8) -> Result<usize> {
        self.write_to_with_hops(payload, dst, protocol, self.default_hop_limit())
    }

    pub fn write_to_with_hops(
        &self,
        payload: &[u8],
        dst: Ipv6Addr,
        protocol: u8,
        hops: u8,
    ) -> Result<usize> {
        if payload.len() > ipv6::MAX_PAYLOAD_LEN {
            return Err(NetError::PayloadTooLarge {
                max: ipv6::MAX_PAYLOAD_LEN,
            });
        }

        let (next_hop, device, src) = {
            let state = self.core.state.read().unwrap();
            let (next_hop, device) = state
                .table
                .lookup(dst)
                .ok_or_else(|| NetError::NoRoute(dst.to_string()))?;
            let (src, _) = device.ipv6().ok_or(NetError::NoAddress("IPv6"))?;
            (next_hop, device, src)
        };

        let header = Ipv6Header {
            payload_len: payload.len() as u16,
            next_header: protocol,
            hop_limit: hops,
            src,
            dst,
            ..Ipv6Header::default()
        };
        let mut datagram = vec![0u8; ipv6::HEADER_LEN + payload.len()];
        header.emit(&mut datagram)?;
        datagram[ipv6::HEADER_LEN..].copy_from_slice(payload);

        let written = device.write_to_ipv6(&datagram, next_hop)?;
        Ok(written.saturating_sub(ipv6::HEADER_LEN))
    }
}

impl HostCore {
    fn ingress(self: &Arc<Self>, frame: &[u8]) {
        let Ok((header, header_len)) = Ipv6Header::parse(frame) else {
            debug!(len = frame.len(), "dropping malformed IPv6 datagram");
            return;
        };
        let total_len = header_len + header.payload_len as usize;
        if frame.len() < total_len {
            debug!(
                got = frame.len(),
                total_len, "dropping IPv6 datagram shorter than its length field"
            );
            return;
        }
        let datagram = &frame[..total_len];
        let payload = &datagram[header_len..];

        enum Verdict {
            Deliver(Ipv6ProtocolCallback),
            Forward(Ipv6Addr, Arc<dyn Ipv6Device>),
            Drop,
        }

        let verdict = {
            let state = self.state.read().unwrap();
            let us = state
                .devices
                .iter()
                .any(|d| d.device.ipv6().is_some_and(|(addr, _)| addr == header.dst));
            if us {
                match state.callbacks[header.next_header as usize].clone() {
                    Some(callback) => Verdict::Deliver(callback),
                    None => {
                        debug!(protocol = header.next_header, "no handler for protocol");
                        Verdict::Drop
                    }
                }
            } else if state.forwarding {
                if header.hop_limit < 2 {
                    debug!(dst = %header.dst, "dropping forwarded datagram: hop limit expired");
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
                if ipv6::set_hop_limit(&mut out, header.hop_limit - 1).is_err() {
                    return;
                }
                if let Err(error) = device.write_to_ipv6(&out, next_hop) {
                    warn!(%error, dst = %header.dst, "forwarding write failed");
                }
            }
            Verdict::Drop => {}
        }
    }
}

//! A point-to-point link-layer device tunneled over a UDP socket.
//!
//! Each datagram on the socket carries exactly one IP packet, so the link
//! is framed for free. There is always exactly one peer (the configured
//! remote address); the per-write peer IP is accepted for interface
//! symmetry and ignored. The device can carry both families at once and
//! dispatches inbound frames on the IP version nibble.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tracing::warn;

use crate::device::{Device, Ipv4Callback, Ipv4Device, Ipv6Callback, Ipv6Device};
use crate::error::{NetError, Result};
use crate::lifecycle::{Lifecycle, StopSignal};

/// How long a daemon read blocks before re-checking the stop signal.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration surface for a [`UdpTunnelDevice`].
#[derive(Debug, Clone)]
pub struct UdpTunnelConfig {
    pub name: String,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Maximum transmission unit, fixed for the device's lifetime. Must be
    /// positive.
    pub mtu: usize,
}

#[derive(Default)]
struct TunnelState {
    socket: Option<Arc<UdpSocket>>, // None while down
    ipv4: Option<(Ipv4Addr, Ipv4Addr)>,
    ipv6: Option<(Ipv6Addr, Ipv6Addr)>,
    callback_v4: Option<Ipv4Callback>,
    callback_v6: Option<Ipv6Callback>,
}

pub struct UdpTunnelDevice {
    config: UdpTunnelConfig,
    self_ref: Weak<UdpTunnelDevice>,
    lifecycle: Lifecycle,
    state: RwLock<TunnelState>,
}

impl UdpTunnelDevice {
    pub fn new(config: UdpTunnelConfig) -> Result<Arc<UdpTunnelDevice>> {
        if config.mtu == 0 {
            return Err(NetError::InvalidState("device MTU must be positive"));
        }
        Ok(Arc::new_cyclic(|self_ref| UdpTunnelDevice {
            config,
            self_ref: self_ref.clone(),
            lifecycle: Lifecycle::new(),
            state: RwLock::new(TunnelState::default()),
        }))
    }

    /// The local socket address after bring-up (useful when the configured
    /// local port was 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let state = self.state.read().unwrap();
        let socket = state
            .socket
            .as_ref()
            .ok_or(NetError::DeviceDown("udp tunnel"))?;
        socket
            .local_addr()
            .map_err(|e| NetError::transport("query local address", e))
    }

    fn receive_daemon(weak: Weak<UdpTunnelDevice>, stop: StopSignal) {
        let Some(dev) = weak.upgrade() else { return };
        let Some(socket) = dev.state.read().unwrap().socket.clone() else {
            return;
        };
        let mtu = dev.config.mtu;
        drop(dev);

        let mut buf = vec![0u8; mtu];
        while !stop.is_stopped() {
            match socket.recv(&mut buf) {
                // Frames longer than the MTU are silently truncated by the
                // bounded buffer; the link is assumed framed, so whatever
                // arrived is treated as one complete packet.
                Ok(n) if n > 0 => {
                    let Some(dev) = weak.upgrade() else { return };
                    dev.dispatch(&buf[..n]);
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(error) => {
                    let Some(dev) = weak.upgrade() else { return };
                    warn!(device = %dev.config.name, %error, "tunnel read failed");
                }
            }
        }
    }

    fn dispatch(&self, frame: &[u8]) {
        if frame.is_empty() {
            return;
        }
        // Callbacks only change through the host while the host owns the
        // device, and addresses only change while the device is down, so a
        // clone taken under the read lock cannot race either.
        let callback = {
            let state = self.state.read().unwrap();
            match frame[0] >> 4 {
                4 => state.callback_v4.clone(),
                6 => state.callback_v6.clone(),
                _ => None,
            }
        };
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    fn write(&self, payload: &[u8]) -> Result<usize> {
        if payload.len() > self.config.mtu {
            return Err(NetError::MtuExceeded {
                mtu: self.config.mtu,
            });
        }
        let socket = {
            let state = self.state.read().unwrap();
            state
                .socket
                .clone()
                .ok_or(NetError::DeviceDown("udp tunnel"))?
        };
        socket
            .send(payload)
            .map_err(|e| NetError::transport("write to udp tunnel", e))
    }
}

impl Device for UdpTunnelDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn bring_up(&self) -> Result<()> {
        let weak = self.self_ref.clone();
        self.lifecycle.bring_up(
            || {
                let socket = UdpSocket::bind(self.config.local)
                    .map_err(|e| NetError::transport("bind tunnel socket", e))?;
                socket
                    .connect(self.config.remote)
                    .map_err(|e| NetError::transport("connect tunnel socket", e))?;
                socket
                    .set_read_timeout(Some(READ_TIMEOUT))
                    .map_err(|e| NetError::transport("set tunnel read timeout", e))?;
                self.state.write().unwrap().socket = Some(Arc::new(socket));
                Ok(())
            },
            vec![Box::new(move |stop| Self::receive_daemon(weak, stop))],
        )
    }

    fn bring_down(&self) -> Result<()> {
        self.lifecycle.bring_down(|| {
            self.state.write().unwrap().socket = None;
            Ok(())
        })
    }

    fn is_up(&self) -> bool {
        self.lifecycle.is_up()
    }

    fn mtu(&self) -> usize {
        self.config.mtu
    }
}

impl Ipv4Device for UdpTunnelDevice {
    fn ipv4(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.state.read().unwrap().ipv4
    }

    fn set_ipv4(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        if self.is_up() {
            return Err(NetError::InvalidState("set address on up device"));
        }
        self.state.write().unwrap().ipv4 = Some((addr, netmask));
        Ok(())
    }

    fn unset_ipv4(&self) -> Result<()> {
        if self.is_up() {
            return Err(NetError::InvalidState("unset address on up device"));
        }
        self.state.write().unwrap().ipv4 = None;
        Ok(())
    }

    fn register_ipv4_callback(&self, callback: Option<Ipv4Callback>) {
        self.state.write().unwrap().callback_v4 = callback;
    }

    fn write_to_ipv4(&self, payload: &[u8], _peer: Ipv4Addr) -> Result<usize> {
        self.write(payload)
    }
}

impl Ipv6Device for UdpTunnelDevice {
    fn ipv6(&self) -> Option<(Ipv6Addr, Ipv6Addr)> {
        self.state.read().unwrap().ipv6
    }

    fn set_ipv6(&self, addr: Ipv6Addr, netmask: Ipv6Addr) -> Result<()> {
        if self.is_up() {
            return Err(NetError::InvalidState("set address on up device"));
        }
        self.state.write().unwrap().ipv6 = Some((addr, netmask));
        Ok(())
    }

    fn unset_ipv6(&self) -> Result<()> {
        if self.is_up() {
            return Err(NetError::InvalidState("unset address on up device"));
        }
        self.state.write().unwrap().ipv6 = None;
        Ok(())
    }

    fn register_ipv6_callback(&self, callback: Option<Ipv6Callback>) {
        self.state.write().unwrap().callback_v6 = callback;
    }

    fn write_to_ipv6(&self, payload: &[u8], _peer: Ipv6Addr) -> Result<usize> {
        self.write(payload)
    }
}

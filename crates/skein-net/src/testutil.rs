//! In-memory devices for tests.
//!
//! A [`MemDevice`] implements both device traits without any real
//! transport. Tests inject frames directly (running the whole ingress path
//! on the test thread) and inspect what the stack wrote. Two devices can be
//! wired into a full-duplex link with [`MemDevice::pair`], in which case a
//! receive daemon pumps the peer's frames exactly like a real device does.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::device::{Device, Ipv4Callback, Ipv4Device, Ipv6Callback, Ipv6Device};
use crate::error::{NetError, Result};
use crate::lifecycle::{Daemon, Lifecycle};

/// One frame written out through a [`MemDevice`].
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub frame: Vec<u8>,
    pub peer: IpAddr,
}

#[derive(Default)]
struct MemState {
    ipv4: Option<(Ipv4Addr, Ipv4Addr)>,
    ipv6: Option<(Ipv6Addr, Ipv6Addr)>,
    callback_v4: Option<Ipv4Callback>,
    callback_v6: Option<Ipv6Callback>,
}

pub struct MemDevice {
    name: String,
    mtu: usize,
    self_ref: Weak<MemDevice>,
    lifecycle: Lifecycle,
    state: RwLock<MemState>,
    writes: Mutex<Vec<SentFrame>>,
    /// Peer inbox of a linked pair; `None` for a free-standing device.
    link: Mutex<Option<Sender<Vec<u8>>>>,
    /// Our inbox; the receive daemon takes it while the device is up.
    inbox: Mutex<Option<Receiver<Vec<u8>>>>,
}

impl MemDevice {
    pub fn new(name: &str, mtu: usize) -> Arc<MemDevice> {
        assert!(mtu > 0);
        Arc::new_cyclic(|self_ref| MemDevice {
            name: name.to_string(),
            mtu,
            self_ref: self_ref.clone(),
            lifecycle: Lifecycle::new(),
            state: RwLock::new(MemState::default()),
            writes: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            inbox: Mutex::new(None),
        })
    }

    /// Two devices joined by an in-memory full-duplex link. Frames written
    /// on one side are delivered to the other side's callbacks by its
    /// receive daemon (both sides must be brought up).
    pub fn pair(name_a: &str, name_b: &str, mtu: usize) -> (Arc<MemDevice>, Arc<MemDevice>) {
        let a = MemDevice::new(name_a, mtu);
        let b = MemDevice::new(name_b, mtu);
        let (to_b, b_inbox) = mpsc::channel();
        let (to_a, a_inbox) = mpsc::channel();
        *a.link.lock().unwrap() = Some(to_b);
        *b.link.lock().unwrap() = Some(to_a);
        *a.inbox.lock().unwrap() = Some(a_inbox);
        *b.inbox.lock().unwrap() = Some(b_inbox);
        (a, b)
    }

    /// Runs the registered IPv4 callback with `frame` on the calling
    /// thread, exactly as the receive daemon would.
    pub fn inject_ipv4(&self, frame: &[u8]) {
        let callback = self.state.read().unwrap().callback_v4.clone();
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    pub fn inject_ipv6(&self, frame: &[u8]) {
        let callback = self.state.read().unwrap().callback_v6.clone();
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    /// Snapshot of everything written through this device.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.writes.lock().unwrap().clear();
    }

    fn dispatch(&self, frame: &[u8]) {
        if frame.is_empty() {
            return;
        }
        match frame[0] >> 4 {
            4 => self.inject_ipv4(frame),
            6 => self.inject_ipv6(frame),
            _ => {}
        }
    }

    fn record_write(&self, payload: &[u8], peer: IpAddr) -> Result<usize> {
        if !self.is_up() {
            return Err(NetError::DeviceDown("mem device"));
        }
        if payload.len() > self.mtu {
            return Err(NetError::MtuExceeded { mtu: self.mtu });
        }
        self.writes.lock().unwrap().push(SentFrame {
            frame: payload.to_vec(),
            peer,
        });
        if let Some(link) = self.link.lock().unwrap().as_ref() {
            // A torn-down peer is not a transport failure in tests.
            let _ = link.send(payload.to_vec());
        }
        Ok(payload.len())
    }

    fn receive_daemon(&self) -> Option<Daemon> {
        if self.inbox.lock().unwrap().is_none() {
            return None;
        }
        let weak = self.self_ref.clone();
        Some(Box::new(move |stop| {
            let Some(dev) = weak.upgrade() else { return };
            let Some(inbox) = dev.inbox.lock().unwrap().take() else {
                return;
            };
            drop(dev);
            while !stop.is_stopped() {
                match inbox.recv_timeout(Duration::from_millis(50)) {
                    Ok(frame) => {
                        let Some(dev) = weak.upgrade() else { return };
                        dev.dispatch(&frame);
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Hand the inbox back so the device can be brought up again.
            if let Some(dev) = weak.upgrade() {
                *dev.inbox.lock().unwrap() = Some(inbox);
            }
        }))
    }
}

impl Device for MemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn bring_up(&self) -> Result<()> {
        let daemons = self.receive_daemon().into_iter().collect();
        self.lifecycle.bring_up(|| Ok(()), daemons)
    }

    fn bring_down(&self) -> Result<()> {
        self.lifecycle.bring_down(|| Ok(()))
    }

    fn is_up(&self) -> bool {
        self.lifecycle.is_up()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Ipv4Device for MemDevice {
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

    fn write_to_ipv4(&self, payload: &[u8], peer: Ipv4Addr) -> Result<usize> {
        self.record_write(payload, IpAddr::V4(peer))
    }
}

impl Ipv6Device for MemDevice {
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

    fn write_to_ipv6(&self, payload: &[u8], peer: Ipv6Addr) -> Result<usize> {
        self.record_write(payload, IpAddr::V6(peer))
    }
}

//! The per-family TCP host: segment demultiplexing, listener and
//! connection registries, connect-side setup.
//!
//! Dispatch runs under the host's shared lock; only a listener hit
//! escalates to the exclusive lock, re-checking both maps after the
//! upgrade because another task may have raced us through the gap. A
//! four-tuple never appears in both maps: listeners are keyed by
//! two-tuple, connections by four-tuple, and a connection created from a
//! listener is inserted only after the listener accepted it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use skein_packet::checksum::patch_tcp_checksum;
use skein_packet::tcp::{TcpFlags, TcpHeader};

use crate::conn::{ConnShared, Connection};
use crate::error::{Result, TcpError};
use crate::listener::{Listener, ListenerShared};
use crate::stack::IpStack;

const EPHEMERAL_PORT_FLOOR: u16 = 49152;

/// The key identifying one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple<A> {
    pub local: A,
    pub local_port: u16,
    pub remote: A,
    pub remote_port: u16,
}

pub(crate) struct HostState<S: IpStack> {
    pub(crate) listeners: HashMap<(S::Addr, u16), Arc<ListenerShared<S>>>,
    pub(crate) conns: HashMap<FourTuple<S::Addr>, Arc<ConnShared<S>>>,
    next_ephemeral: u16,
}

pub(crate) struct HostCore<S: IpStack> {
    pub(crate) ip: S,
    pub(crate) state: RwLock<HostState<S>>,
    validate_checksums: AtomicBool,
}

/// A TCP host for one address family. Cheap to clone.
pub struct TcpHost<S: IpStack> {
    core: Arc<HostCore<S>>,
}

pub type Ipv4TcpHost = TcpHost<skein_net::Ipv4Host>;
pub type Ipv6TcpHost = TcpHost<skein_net::Ipv6Host>;

impl<S: IpStack> Clone for TcpHost<S> {
    fn clone(&self) -> Self {
        TcpHost {
            core: self.core.clone(),
        }
    }
}

impl<S: IpStack> TcpHost<S> {
    /// Creates a TCP host on top of `ip` and installs its protocol
    /// handler there.
    pub fn new(ip: S) -> TcpHost<S> {
        let core = Arc::new(HostCore {
            ip: ip.clone(),
            state: RwLock::new(HostState {
                listeners: HashMap::new(),
                conns: HashMap::new(),
                next_ephemeral: EPHEMERAL_PORT_FLOOR,
            }),
            validate_checksums: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&core);
        ip.register_tcp(Arc::new(move |segment, src, dst| {
            if let Some(core) = weak.upgrade() {
                core.ingress(segment, src, dst);
            }
        }));
        TcpHost { core }
    }

    /// Starts listening on `(addr, port)`.
    pub fn listen(&self, addr: S::Addr, port: u16) -> Result<Listener<S>> {
        let mut state = self.core.state.write().unwrap();
        if state.listeners.contains_key(&(addr, port)) {
            return Err(TcpError::AddrInUse);
        }
        let shared = ListenerShared::new();
        state.listeners.insert((addr, port), shared.clone());
        Ok(Listener::new(
            shared,
            Arc::downgrade(&self.core),
            (addr, port),
        ))
    }

    /// Opens a connection to `remote:port`, blocking until the handshake
    /// completes or fails.
    pub fn connect(&self, remote: S::Addr, port: u16) -> Result<Connection<S>> {
        self.connect_inner(remote, port, None)
    }

    /// Like [`TcpHost::connect`] with an upper bound on the handshake.
    pub fn connect_timeout(
        &self,
        remote: S::Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<Connection<S>> {
        self.connect_inner(remote, port, Some(timeout))
    }

    fn connect_inner(
        &self,
        remote: S::Addr,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Connection<S>> {
        let local = self.core.ip.source_for(remote)?;
        let conn = {
            let mut state = self.core.state.write().unwrap();
            let local_port = state.alloc_ephemeral_port(local, remote, port)?;
            let conn = ConnShared::new_syn_sent(
                Arc::downgrade(&self.core),
                (local, local_port),
                (remote, port),
            );
            state.conns.insert(conn.key(), conn.clone());
            conn
        };
        conn.start_connect(timeout)?;
        Ok(Connection { shared: conn })
    }

    /// Number of live connections in the four-tuple map.
    pub fn connection_count(&self) -> usize {
        self.core.state.read().unwrap().conns.len()
    }

    /// Whether inbound segments are checked against the pseudo-header
    /// checksum (segments that fail are dropped). Off by default.
    pub fn set_validate_checksums(&self, on: bool) {
        self.core.validate_checksums.store(on, Ordering::Relaxed);
    }

    pub fn ip(&self) -> &S {
        &self.core.ip
    }
}

impl<S: IpStack> HostState<S> {
    fn alloc_ephemeral_port(
        &mut self,
        local: S::Addr,
        remote: S::Addr,
        remote_port: u16,
    ) -> Result<u16> {
        let span = u16::MAX - EPHEMERAL_PORT_FLOOR + 1;
        for _ in 0..span {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_PORT_FLOOR
            } else {
                port + 1
            };
            let key = FourTuple {
                local,
                local_port: port,
                remote,
                remote_port,
            };
            if !self.conns.contains_key(&key) && !self.listeners.contains_key(&(local, port)) {
                return Ok(port);
            }
        }
        Err(TcpError::NoFreePort)
    }
}

impl<S: IpStack> HostCore<S> {
    fn ingress(self: &Arc<Self>, segment: &[u8], src: S::Addr, dst: S::Addr) {
        let Ok((hdr, header_len)) = TcpHeader::parse(segment) else {
            debug!(len = segment.len(), "dropping malformed TCP segment");
            return;
        };
        if self.validate_checksums.load(Ordering::Relaxed)
            && S::checksum(src, dst, segment) != 0
        {
            debug!(%src, "dropping TCP segment with bad checksum");
            return;
        }
        let payload = &segment[header_len..];
        let key = FourTuple {
            local: dst,
            local_port: hdr.dst_port,
            remote: src,
            remote_port: hdr.src_port,
        };

        // Fast path under the shared lock.
        {
            let state = self.state.read().unwrap();
            if let Some(conn) = state.conns.get(&key).cloned() {
                conn.handle_segment(&hdr, payload);
                return;
            }
            if !state.listeners.contains_key(&(dst, hdr.dst_port)) {
                drop(state);
                self.refuse(&hdr, src, dst, payload.len());
                return;
            }
        }

        // Listener hit: upgrade to the exclusive lock and re-check both
        // maps, since another task may have created the connection or
        // closed the listener in between.
        let mut state = self.state.write().unwrap();
        if let Some(conn) = state.conns.get(&key).cloned() {
            conn.handle_segment(&hdr, payload);
            return;
        }
        let Some(listener) = state.listeners.get(&(dst, hdr.dst_port)).cloned() else {
            drop(state);
            self.refuse(&hdr, src, dst, payload.len());
            return;
        };

        let conn = ConnShared::new_listen(
            Arc::downgrade(self),
            (dst, hdr.dst_port),
            (src, hdr.src_port),
        );
        if !listener.offer(Connection {
            shared: conn.clone(),
        }) {
            // Accept queue full (or the listener just closed): drop the
            // segment, keep no state; the peer will retransmit its SYN.
            debug!(port = hdr.dst_port, "accept queue rejected connection");
            return;
        }
        state.conns.insert(key, conn.clone());
        // The new connection handles the segment through the exact same
        // path an existing one would.
        conn.handle_segment(&hdr, payload);
    }

    /// Answers a segment addressed to nobody with a reset.
    fn refuse(&self, hdr: &TcpHeader, src: S::Addr, dst: S::Addr, payload_len: usize) {
        if hdr.flags.rst() {
            return;
        }
        debug!(port = hdr.dst_port, "refusing segment with no listener");
        let reply = rst_reply(hdr.dst_port, hdr.src_port, hdr, payload_len);
        let header_len = reply.header_len();
        let mut segment = vec![0u8; header_len];
        if reply.emit(&mut segment).is_err() {
            return;
        }
        let csum = S::checksum(dst, src, &segment);
        patch_tcp_checksum(&mut segment, csum);
        if let Err(error) = self.ip.send(&segment, src) {
            debug!(%error, "reset send failed");
        }
    }

    /// Removes `shared` from the connection map if it is still the
    /// registered connection for its four-tuple.
    pub(crate) fn remove_conn(&self, shared: &Arc<ConnShared<S>>) {
        let key = shared.key();
        let mut state = self.state.write().unwrap();
        if state
            .conns
            .get(&key)
            .is_some_and(|c| Arc::ptr_eq(c, shared))
        {
            state.conns.remove(&key);
        }
    }
}

/// The reset answering `incoming`: echo its acknowledgment as our
/// sequence number when it has one, otherwise acknowledge everything the
/// segment occupied.
pub(crate) fn rst_reply(
    src_port: u16,
    dst_port: u16,
    incoming: &TcpHeader,
    payload_len: usize,
) -> TcpHeader {
    let mut reply = TcpHeader {
        src_port,
        dst_port,
        seq: 0,
        ack: 0,
        flags: TcpFlags::RST,
        window: 0,
        checksum: 0,
        urgent: 0,
        mss: None,
    };
    if incoming.flags.ack() {
        reply.seq = incoming.ack;
    } else {
        let mut ack = incoming.seq.wrapping_add(payload_len as u32);
        if incoming.flags.syn() {
            ack = ack.wrapping_add(1);
        }
        if incoming.flags.fin() {
            ack = ack.wrapping_add(1);
        }
        reply.ack = ack;
        reply.flags = TcpFlags::RST | TcpFlags::ACK;
    }
    reply
}

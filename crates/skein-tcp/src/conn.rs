//! A TCP connection: the state machine, the blocking read/write surface
//! and the deadline protocol.
//!
//! One mutex guards everything mutable; the two condition variables
//! (`data_available`, `space_available`) share it. Segment handling runs
//! under the same mutex, so deliveries to one connection are serialized in
//! arrival order. Deadlines are recorded on the monotonic clock: if a
//! timeout fires at monotonic time `F >= deadline`, its callback acquires
//! the mutex at some `C >= F`, so any waiter that re-checks the deadline
//! after waking observes it reached. Wall-clock inputs are converted at
//! the boundary and never consulted again.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use tracing::{debug, warn};

use skein_packet::checksum::patch_tcp_checksum;
use skein_packet::tcp::{TcpFlags, TcpHeader};

use crate::error::{Result, TcpError};
use crate::host::HostCore;
use crate::read_buffer::ReadBuffer;
use crate::send_buffer::SendBuffer;
use crate::seq::SeqNum;
use crate::stack::IpStack;
use crate::timeout::{TimeoutHandle, TimeoutScheduler};

pub(crate) const RECV_BUFFER_SIZE: usize = 1 << 16;
pub(crate) const SEND_BUFFER_SIZE: usize = 1 << 16;

/// Fixed send window; there is no congestion control.
const SEND_WINDOW: u32 = 1 << 16;

const FALLBACK_MSS: u16 = 1460;
const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);
const MAX_RETRANSMITS: u32 = 10;

/// How long a TIME_WAIT connection lingers before it is removed from the
/// host (2 * MSL).
const TIME_WAIT_DRAIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynRcvd,
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Closed,
}

impl TcpState {
    pub fn name(self) -> &'static str {
        match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::SynSent => "SYN_SENT",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Closed => "CLOSED",
        }
    }
}

pub(crate) struct ConnState {
    pub(crate) state: TcpState,
    /// Absent until a SYN fixes the peer's initial sequence number.
    pub(crate) incoming: Option<ReadBuffer>,
    pub(crate) outgoing: SendBuffer,
    pub(crate) iss: SeqNum,
    /// Oldest unacknowledged sequence number (covers SYN and FIN too).
    pub(crate) snd_una: SeqNum,
    /// Next sequence number to send.
    pub(crate) snd_nxt: SeqNum,
    /// Peer-advertised window.
    pub(crate) snd_wnd: u32,
    pub(crate) mss: u16,
    /// Sequence number of our FIN once it has been sent.
    pub(crate) fin_seq: Option<SeqNum>,
    /// Close requested but FIN not yet sent (data still draining).
    pub(crate) fin_pending: bool,
    /// Sequence number of the peer's FIN once received in order.
    pub(crate) peer_fin: Option<SeqNum>,
    pub(crate) reset: bool,
    pub(crate) read_deadline: Option<Instant>,
    pub(crate) write_deadline: Option<Instant>,
    pub(crate) read_timeout: Option<TimeoutHandle>,
    pub(crate) write_timeout: Option<TimeoutHandle>,
    pub(crate) rtx_timeout: Option<TimeoutHandle>,
    pub(crate) rtx_count: u32,
    pub(crate) finalize_scheduled: bool,
    /// Set by the finalize timeout: the connection is (about to be) gone
    /// from the host map and must ignore late segments.
    pub(crate) finalized: bool,
}

impl ConnState {
    fn new(state: TcpState) -> ConnState {
        ConnState {
            state,
            incoming: None,
            outgoing: SendBuffer::new(SEND_BUFFER_SIZE, SeqNum(0)),
            iss: SeqNum(0),
            snd_una: SeqNum(0),
            snd_nxt: SeqNum(0),
            snd_wnd: SEND_WINDOW,
            mss: FALLBACK_MSS,
            fin_seq: None,
            fin_pending: false,
            peer_fin: None,
            reset: false,
            read_deadline: None,
            write_deadline: None,
            read_timeout: None,
            write_timeout: None,
            rtx_timeout: None,
            rtx_count: 0,
            finalize_scheduled: false,
            finalized: false,
        }
    }

    fn available(&self) -> usize {
        self.incoming.as_ref().map_or(0, |b| b.available())
    }

    /// The acknowledgment number to put on the wire: everything received
    /// in order, plus one for the peer's FIN once it is in order.
    fn ack_value(&self) -> SeqNum {
        let Some(incoming) = self.incoming.as_ref() else {
            return SeqNum(0);
        };
        let next = incoming.next();
        match self.peer_fin {
            Some(fin) if fin == next => next + 1,
            _ => next,
        }
    }

    fn recv_window(&self) -> u16 {
        let window = self
            .incoming
            .as_ref()
            .map_or(RECV_BUFFER_SIZE, |b| b.window());
        window.min(u16::MAX as usize) as u16
    }

    fn fin_acked(&self, ack: SeqNum) -> bool {
        self.fin_seq.is_some_and(|fin| (fin + 1).at_or_before(ack))
    }

    fn writable(&self) -> bool {
        !self.fin_pending
            && self.fin_seq.is_none()
            && matches!(
                self.state,
                TcpState::SynSent | TcpState::SynRcvd | TcpState::Established | TcpState::CloseWait
            )
    }

    fn cancel_timers(&mut self) {
        for handle in [
            self.read_timeout.take(),
            self.write_timeout.take(),
            self.rtx_timeout.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.cancel();
        }
    }
}

pub(crate) struct ConnShared<S: IpStack> {
    pub(crate) host: Weak<HostCore<S>>,
    pub(crate) self_ref: Weak<ConnShared<S>>,
    pub(crate) local: (S::Addr, u16),
    pub(crate) remote: (S::Addr, u16),
    pub(crate) state: Mutex<ConnState>,
    pub(crate) data_available: Condvar,
    pub(crate) space_available: Condvar,
    pub(crate) scheduler: TimeoutScheduler<S>,
}

impl<S: IpStack> Drop for ConnShared<S> {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

/// Converts a wall-clock deadline to the monotonic clock. A deadline in
/// the past maps to "now", which every deadline check treats as reached.
fn wall_to_monotonic(t: SystemTime) -> Instant {
    let now = Instant::now();
    match t.duration_since(SystemTime::now()) {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}

fn deadline_reached(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

impl<S: IpStack> ConnShared<S> {
    fn build(
        host: Weak<HostCore<S>>,
        local: (S::Addr, u16),
        remote: (S::Addr, u16),
        mut state: ConnState,
    ) -> Arc<ConnShared<S>> {
        state.mss = S::DEFAULT_MSS;
        Arc::new_cyclic(|self_ref| ConnShared {
            host,
            self_ref: self_ref.clone(),
            local,
            remote,
            state: Mutex::new(state),
            data_available: Condvar::new(),
            space_available: Condvar::new(),
            scheduler: TimeoutScheduler::start(self_ref.clone()),
        })
    }

    /// A connection born from a listener, waiting for its first segment.
    pub(crate) fn new_listen(
        host: Weak<HostCore<S>>,
        local: (S::Addr, u16),
        remote: (S::Addr, u16),
    ) -> Arc<ConnShared<S>> {
        Self::build(host, local, remote, ConnState::new(TcpState::Listen))
    }

    /// A client connection about to send its SYN.
    pub(crate) fn new_syn_sent(
        host: Weak<HostCore<S>>,
        local: (S::Addr, u16),
        remote: (S::Addr, u16),
    ) -> Arc<ConnShared<S>> {
        let mut state = ConnState::new(TcpState::SynSent);
        let iss = SeqNum(rand::thread_rng().gen());
        state.iss = iss;
        state.snd_una = iss;
        state.snd_nxt = iss;
        state.outgoing.set_base_seq(iss + 1);
        Self::build(host, local, remote, state)
    }

    /// Sends the SYN and blocks until the handshake completes, the peer
    /// resets, or `timeout` elapses.
    pub(crate) fn start_connect(self: &Arc<Self>, timeout: Option<Duration>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let iss = st.iss;
        st.snd_nxt = iss + 1;
        self.emit(&st, iss, TcpFlags::SYN, &[], Some(S::DEFAULT_MSS));
        self.arm_retransmit(&mut st);

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match st.state {
                TcpState::Established => return Ok(()),
                TcpState::Closed => {
                    return Err(if st.reset {
                        TcpError::ConnectionReset
                    } else {
                        TcpError::ConnectionClosed
                    });
                }
                _ => {}
            }
            st = match deadline {
                None => self.data_available.wait(st).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        self.teardown(&mut st);
                        return Err(TcpError::Timeout("connect"));
                    }
                    self.data_available.wait_timeout(st, d - now).unwrap().0
                }
            };
        }
    }

    /// Entry point for every segment the host routes here. Runs the state
    /// machine under the connection mutex.
    pub(crate) fn handle_segment(self: &Arc<Self>, hdr: &TcpHeader, payload: &[u8]) {
        let mut st = self.state.lock().unwrap();
        if st.finalized || st.state == TcpState::Closed {
            return;
        }
        if hdr.flags.rst() {
            debug!(
                local = %self.local.0, port = self.local.1,
                "connection reset by peer"
            );
            st.reset = true;
            self.teardown(&mut st);
            return;
        }
        match st.state {
            TcpState::Listen => self.on_listen(&mut st, hdr, payload.len()),
            TcpState::SynSent => self.on_syn_sent(&mut st, hdr),
            _ => self.on_common(&mut st, hdr, payload),
        }
    }

    fn on_listen(&self, st: &mut ConnState, hdr: &TcpHeader, payload_len: usize) {
        if !hdr.flags.syn() {
            // Only a SYN can start a connection; answer with a reset and
            // let the finalize pass reap this stillborn entry.
            self.emit_rst_for(hdr, payload_len);
            self.teardown(st);
            return;
        }
        st.incoming = Some(ReadBuffer::new(RECV_BUFFER_SIZE, SeqNum(hdr.seq) + 1));
        if let Some(mss) = hdr.mss {
            st.mss = st.mss.min(mss);
        }
        st.snd_wnd = hdr.window as u32;

        let iss = SeqNum(rand::thread_rng().gen());
        st.iss = iss;
        st.snd_una = iss;
        st.snd_nxt = iss + 1;
        st.outgoing.set_base_seq(iss + 1);
        st.state = TcpState::SynRcvd;
        self.emit(
            st,
            iss,
            TcpFlags::SYN | TcpFlags::ACK,
            &[],
            Some(S::DEFAULT_MSS),
        );
        self.arm_retransmit(st);
    }

    fn on_syn_sent(&self, st: &mut ConnState, hdr: &TcpHeader) {
        if hdr.flags.syn() && hdr.flags.ack() {
            if SeqNum(hdr.ack) != st.snd_nxt {
                debug!(ack = hdr.ack, "dropping SYN|ACK with unexpected ack");
                return;
            }
            st.snd_una = SeqNum(hdr.ack);
            st.incoming = Some(ReadBuffer::new(RECV_BUFFER_SIZE, SeqNum(hdr.seq) + 1));
            if let Some(mss) = hdr.mss {
                st.mss = st.mss.min(mss);
            }
            st.snd_wnd = hdr.window as u32;
            st.state = TcpState::Established;
            st.rtx_count = 0;
            self.cancel_retransmit(st);
            self.emit(st, st.snd_nxt, TcpFlags::ACK, &[], None);
            self.data_available.notify_all();
            self.space_available.notify_all();
            self.send_pending(st);
        } else if hdr.flags.syn() {
            // Simultaneous open: both ends sent SYNs.
            st.incoming = Some(ReadBuffer::new(RECV_BUFFER_SIZE, SeqNum(hdr.seq) + 1));
            if let Some(mss) = hdr.mss {
                st.mss = st.mss.min(mss);
            }
            st.state = TcpState::SynRcvd;
            self.emit(
                st,
                st.iss,
                TcpFlags::SYN | TcpFlags::ACK,
                &[],
                Some(S::DEFAULT_MSS),
            );
        }
    }

    fn on_common(&self, st: &mut ConnState, hdr: &TcpHeader, payload: &[u8]) {
        if hdr.flags.ack() {
            self.process_ack(st, hdr);
            if st.state == TcpState::Closed {
                return;
            }
        }

        if hdr.flags.syn() {
            // A retransmitted SYN or SYN|ACK means a handshake reply of
            // ours was lost; repeat it so the peer can make progress.
            if st.state == TcpState::SynRcvd && st.snd_una == st.iss {
                self.emit(
                    st,
                    st.iss,
                    TcpFlags::SYN | TcpFlags::ACK,
                    &[],
                    Some(S::DEFAULT_MSS),
                );
            } else {
                self.emit(st, st.snd_nxt, TcpFlags::ACK, &[], None);
            }
            return;
        }

        if !payload.is_empty()
            && matches!(
                st.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            )
        {
            self.process_data(st, hdr, payload);
        }

        if hdr.flags.fin() {
            self.process_fin(st, hdr, payload.len());
        }

        self.send_pending(st);
    }

    fn process_ack(&self, st: &mut ConnState, hdr: &TcpHeader) {
        st.snd_wnd = hdr.window as u32;
        let ack = SeqNum(hdr.ack);
        if !(st.snd_una.before(ack) && ack.at_or_before(st.snd_nxt)) {
            return; // duplicate or out-of-range ack
        }

        let buffered_ack = (ack.offset_from(st.outgoing.base_seq()) as usize).min(st.outgoing.len());
        if buffered_ack > 0 {
            st.outgoing.advance(buffered_ack);
            self.space_available.notify_all();
        }
        st.snd_una = ack;
        st.rtx_count = 0;
        if st.snd_una == st.snd_nxt {
            self.cancel_retransmit(st);
        } else {
            self.arm_retransmit(st);
        }

        match st.state {
            TcpState::SynRcvd => {
                st.state = TcpState::Established;
                self.data_available.notify_all();
                self.space_available.notify_all();
            }
            TcpState::FinWait1 if st.fin_acked(ack) => {
                st.state = TcpState::FinWait2;
            }
            TcpState::Closing if st.fin_acked(ack) => {
                st.state = TcpState::TimeWait;
                self.schedule_finalize(st, Instant::now() + TIME_WAIT_DRAIN);
            }
            TcpState::LastAck if st.fin_acked(ack) => {
                self.teardown(st);
            }
            _ => {}
        }
    }

    fn process_data(&self, st: &mut ConnState, hdr: &TcpHeader, payload: &[u8]) {
        let Some(incoming) = st.incoming.as_mut() else {
            return;
        };
        let base = incoming.base_seq();
        let seq = SeqNum(hdr.seq);

        // Retransmissions may reach back before data we already consumed;
        // trim the stale prefix instead of dropping the whole segment.
        let (data, data_seq) = if seq.before(base) {
            let stale = base.offset_from(seq) as usize;
            if stale >= payload.len() {
                (&[][..], base)
            } else {
                (&payload[stale..], base)
            }
        } else {
            (payload, seq)
        };

        if !data.is_empty() {
            let before = incoming.available();
            incoming.write(data, data_seq);
            if incoming.available() > before {
                self.data_available.notify_all();
            }
        }
        // Always acknowledge, also for duplicates, so the peer converges.
        self.emit(st, st.snd_nxt, TcpFlags::ACK, &[], None);
    }

    fn process_fin(&self, st: &mut ConnState, hdr: &TcpHeader, payload_len: usize) {
        let Some(incoming) = st.incoming.as_ref() else {
            return;
        };
        let fin_seq = SeqNum(hdr.seq) + payload_len as u32;
        if st.peer_fin.is_some() {
            // Duplicate FIN: our ACK was lost, repeat it so the peer can
            // leave LAST_ACK.
            self.emit(st, st.snd_nxt, TcpFlags::ACK, &[], None);
            return;
        }
        if fin_seq != incoming.next() {
            // Out of order: data is still missing, the peer will
            // retransmit the FIN after it.
            self.emit(st, st.snd_nxt, TcpFlags::ACK, &[], None);
            return;
        }
        st.peer_fin = Some(fin_seq);
        self.data_available.notify_all(); // wakes readers into end-of-stream
        self.emit(st, st.snd_nxt, TcpFlags::ACK, &[], None);

        match st.state {
            TcpState::Established | TcpState::SynRcvd => st.state = TcpState::CloseWait,
            TcpState::FinWait1 => st.state = TcpState::Closing,
            TcpState::FinWait2 => {
                st.state = TcpState::TimeWait;
                self.schedule_finalize(st, Instant::now() + TIME_WAIT_DRAIN);
            }
            _ => {}
        }
    }

    /// Pushes out whatever the window allows: buffered data first, then a
    /// pending FIN once the buffer has fully drained onto the wire.
    fn send_pending(&self, st: &mut ConnState) {
        if matches!(
            st.state,
            TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd | TcpState::Closed | TcpState::TimeWait
        ) {
            return;
        }

        while st.fin_seq.is_none() {
            let sent = st.snd_nxt.offset_from(st.outgoing.base_seq()) as usize;
            let unsent = st.outgoing.len().saturating_sub(sent);
            let inflight = st.snd_nxt.offset_from(st.snd_una);
            let room = st.snd_wnd.min(SEND_WINDOW).saturating_sub(inflight) as usize;
            let take = unsent.min(room).min(st.mss as usize);
            if take == 0 {
                break;
            }
            let mut chunk = vec![0u8; take];
            st.outgoing.read(&mut chunk, sent);
            let mut flags = TcpFlags::ACK;
            if take == unsent {
                flags.set_psh(true);
            }
            self.emit(st, st.snd_nxt, flags, &chunk, None);
            st.snd_nxt = st.snd_nxt + take as u32;
            self.arm_retransmit_if_unarmed(st);
        }

        let all_sent =
            st.snd_nxt.offset_from(st.outgoing.base_seq()) as usize == st.outgoing.len();
        if st.fin_pending && st.fin_seq.is_none() && all_sent {
            let fin_seq = st.snd_nxt;
            st.fin_seq = Some(fin_seq);
            st.fin_pending = false;
            self.emit(st, fin_seq, TcpFlags::FIN | TcpFlags::ACK, &[], None);
            st.snd_nxt = fin_seq + 1;
            self.arm_retransmit_if_unarmed(st);
        }
    }

    fn arm_retransmit(&self, st: &mut ConnState) {
        self.cancel_retransmit(st);
        let handle = self.scheduler.add_timeout(
            Instant::now() + RETRANSMIT_TIMEOUT,
            Box::new(|shared, st| {
                st.rtx_timeout = None;
                shared.on_retransmit_timer(st);
                None
            }),
        );
        st.rtx_timeout = Some(handle);
    }

    fn arm_retransmit_if_unarmed(&self, st: &mut ConnState) {
        if st.rtx_timeout.is_none() {
            self.arm_retransmit(st);
        }
    }

    fn cancel_retransmit(&self, st: &mut ConnState) {
        if let Some(handle) = st.rtx_timeout.take() {
            handle.cancel();
        }
    }

    fn on_retransmit_timer(&self, st: &mut ConnState) {
        if st.finalized || st.state == TcpState::Closed || st.snd_una == st.snd_nxt {
            return;
        }
        st.rtx_count += 1;
        if st.rtx_count > MAX_RETRANSMITS {
            warn!(
                remote = %self.remote.0, port = self.remote.1,
                "giving up after {MAX_RETRANSMITS} retransmits"
            );
            st.reset = true;
            self.teardown(st);
            return;
        }

        match st.state {
            TcpState::SynSent => {
                self.emit(st, st.iss, TcpFlags::SYN, &[], Some(S::DEFAULT_MSS));
            }
            TcpState::SynRcvd => {
                self.emit(
                    st,
                    st.iss,
                    TcpFlags::SYN | TcpFlags::ACK,
                    &[],
                    Some(S::DEFAULT_MSS),
                );
            }
            _ => {
                if !st.outgoing.is_empty() {
                    let take = st.outgoing.len().min(st.mss as usize);
                    let mut chunk = vec![0u8; take];
                    st.outgoing.read(&mut chunk, 0);
                    self.emit(
                        st,
                        st.outgoing.base_seq(),
                        TcpFlags::ACK | TcpFlags::PSH,
                        &chunk,
                        None,
                    );
                } else if let Some(fin) = st.fin_seq {
                    self.emit(st, fin, TcpFlags::FIN | TcpFlags::ACK, &[], None);
                }
            }
        }
        self.arm_retransmit(st);
    }

    /// Closes the connection immediately: cancels timers, wakes every
    /// waiter and schedules removal from the host.
    fn teardown(&self, st: &mut ConnState) {
        st.state = TcpState::Closed;
        st.cancel_timers();
        self.data_available.notify_all();
        self.space_available.notify_all();
        self.schedule_finalize(st, Instant::now());
    }

    /// Schedules the finalize timeout: marks the connection dead under its
    /// own lock, then (with no locks held) removes it from the host.
    fn schedule_finalize(&self, st: &mut ConnState, deadline: Instant) {
        if st.finalize_scheduled {
            return;
        }
        st.finalize_scheduled = true;
        self.scheduler.add_timeout(
            deadline,
            Box::new(|shared, st| {
                st.finalized = true;
                st.state = TcpState::Closed;
                st.cancel_timers();
                shared.data_available.notify_all();
                shared.space_available.notify_all();

                let me = shared.self_ref.clone();
                Some(Box::new(move || {
                    let Some(shared) = me.upgrade() else { return };
                    if let Some(host) = shared.host.upgrade() {
                        host.remove_conn(&shared);
                    }
                    shared.scheduler.stop();
                }))
            }),
        );
    }

    /// Builds and sends one segment. Failures are logged and dropped; the
    /// retransmission machinery recovers from lost segments anyway.
    fn emit(&self, st: &ConnState, seq: SeqNum, flags: TcpFlags, payload: &[u8], mss: Option<u16>) {
        let header = TcpHeader {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: seq.0,
            ack: if flags.ack() { st.ack_value().0 } else { 0 },
            flags,
            window: st.recv_window(),
            checksum: 0,
            urgent: 0,
            mss,
        };
        self.send_raw(&header, payload);
    }

    /// A reset answering a segment that reached a LISTEN connection
    /// without a SYN.
    fn emit_rst_for(&self, hdr: &TcpHeader, payload_len: usize) {
        let header = crate::host::rst_reply(self.local.1, self.remote.1, hdr, payload_len);
        self.send_raw(&header, &[]);
    }

    fn send_raw(&self, header: &TcpHeader, payload: &[u8]) {
        let header_len = header.header_len();
        let mut segment = vec![0u8; header_len + payload.len()];
        if header.emit(&mut segment).is_err() {
            return;
        }
        segment[header_len..].copy_from_slice(payload);
        let csum = S::checksum(self.local.0, self.remote.0, &segment);
        patch_tcp_checksum(&mut segment, csum);

        let Some(host) = self.host.upgrade() else {
            return;
        };
        if let Err(error) = host.ip.send(&segment, self.remote.0) {
            debug!(%error, remote = %self.remote.0, "segment send failed");
        }
    }

    /// Used by a closing listener: reset and drop a queued connection.
    /// The caller holds the host's exclusive lock.
    pub(crate) fn abort(&self) {
        let mut st = self.state.lock().unwrap();
        if st.state != TcpState::Closed {
            let header = TcpHeader {
                src_port: self.local.1,
                dst_port: self.remote.1,
                seq: st.snd_nxt.0,
                ack: st.ack_value().0,
                flags: TcpFlags::RST | TcpFlags::ACK,
                window: 0,
                checksum: 0,
                urgent: 0,
                mss: None,
            };
            self.send_raw(&header, &[]);
        }
        st.reset = true;
        st.state = TcpState::Closed;
        st.finalized = true;
        st.cancel_timers();
        self.data_available.notify_all();
        self.space_available.notify_all();
        drop(st);
        self.scheduler.stop();
    }

    pub(crate) fn key(&self) -> crate::host::FourTuple<S::Addr> {
        crate::host::FourTuple {
            local: self.local.0,
            local_port: self.local.1,
            remote: self.remote.0,
            remote_port: self.remote.1,
        }
    }
}

/// A handle on one TCP connection. Cheap to clone; all clones observe the
/// same connection.
pub struct Connection<S: IpStack> {
    pub(crate) shared: Arc<ConnShared<S>>,
}

impl<S: IpStack> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl<S: IpStack> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Connection {
            shared: self.shared.clone(),
        }
    }
}

impl<S: IpStack> Connection<S> {
    pub fn local_addr(&self) -> (S::Addr, u16) {
        self.shared.local
    }

    pub fn remote_addr(&self) -> (S::Addr, u16) {
        self.shared.remote
    }

    pub fn state_name(&self) -> &'static str {
        self.shared.state.lock().unwrap().state.name()
    }

    /// Blocking read. Returns the number of bytes copied into `buf`,
    /// `Ok(0)` at end of stream, or a timeout error once the read deadline
    /// is reached.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = &*self.shared;
        let mut st = shared.state.lock().unwrap();
        if deadline_reached(st.read_deadline) {
            return Err(TcpError::Timeout("read"));
        }
        loop {
            let available = st.available();
            if available > 0 {
                let n = buf.len().min(available);
                let mut was_zero_window = false;
                if let Some(incoming) = st.incoming.as_mut() {
                    was_zero_window = incoming.window() == 0;
                    incoming.read_and_advance(&mut buf[..n]);
                }
                if was_zero_window {
                    // The peer may be stalled on our closed window; tell
                    // it the window reopened.
                    shared.emit(&st, st.snd_nxt, TcpFlags::ACK, &[], None);
                }
                return Ok(n);
            }
            if st.reset {
                return Err(TcpError::ConnectionReset);
            }
            if st.peer_fin.is_some() || st.state == TcpState::Closed {
                return Ok(0); // end of stream
            }
            st = shared.data_available.wait(st).unwrap();
            if deadline_reached(st.read_deadline) {
                return Err(TcpError::Timeout("read"));
            }
        }
    }

    /// Blocking write. Buffers as much as window space allows, waiting for
    /// acknowledged space when the send buffer fills. On a deadline with
    /// partial progress the byte count written so far is returned; a
    /// deadline before any byte was buffered is an error.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = &*self.shared;
        let mut st = shared.state.lock().unwrap();
        if deadline_reached(st.write_deadline) {
            return Err(TcpError::Timeout("write"));
        }
        let mut written = 0;
        loop {
            if st.reset {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(TcpError::ConnectionReset)
                };
            }
            if !st.writable() {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(TcpError::ConnectionClosed)
                };
            }
            let space = st.outgoing.capacity();
            if space == 0 {
                st = shared.space_available.wait(st).unwrap();
                if deadline_reached(st.write_deadline) {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(TcpError::Timeout("write"))
                    };
                }
                continue;
            }
            let k = space.min(buf.len() - written);
            st.outgoing.write(&buf[written..written + k]);
            written += k;
            shared.send_pending(&mut st);
            if written == buf.len() {
                return Ok(written);
            }
        }
    }

    /// Initiates the FIN handshake from the current state. Idempotent on
    /// an already-closing connection.
    pub fn close(&self) -> Result<()> {
        let shared = &*self.shared;
        let mut st = shared.state.lock().unwrap();
        match st.state {
            TcpState::Closed => {}
            TcpState::Listen | TcpState::SynSent => {
                shared.teardown(&mut st);
            }
            TcpState::SynRcvd | TcpState::Established => {
                st.fin_pending = true;
                st.state = TcpState::FinWait1;
                shared.send_pending(&mut st);
            }
            TcpState::CloseWait => {
                st.fin_pending = true;
                st.state = TcpState::LastAck;
                shared.send_pending(&mut st);
            }
            // Already closing.
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::TimeWait
            | TcpState::LastAck => {}
        }
        Ok(())
    }

    /// Sets the read deadline from a wall-clock instant; `None` clears it.
    /// Any blocked reader is woken once the deadline is reached.
    pub fn set_read_deadline(&self, deadline: Option<SystemTime>) {
        let mut st = self.shared.state.lock().unwrap();
        self.shared
            .set_read_deadline_locked(&mut st, deadline.map(wall_to_monotonic));
    }

    /// Sets the write deadline from a wall-clock instant; `None` clears
    /// it.
    pub fn set_write_deadline(&self, deadline: Option<SystemTime>) {
        let mut st = self.shared.state.lock().unwrap();
        self.shared
            .set_write_deadline_locked(&mut st, deadline.map(wall_to_monotonic));
    }

    /// Sets both deadlines under a single lock acquisition.
    pub fn set_deadline(&self, deadline: Option<SystemTime>) {
        let mut st = self.shared.state.lock().unwrap();
        let monotonic = deadline.map(wall_to_monotonic);
        self.shared.set_read_deadline_locked(&mut st, monotonic);
        self.shared.set_write_deadline_locked(&mut st, monotonic);
    }
}

impl<S: IpStack> ConnShared<S> {
    fn set_read_deadline_locked(&self, st: &mut ConnState, deadline: Option<Instant>) {
        if let Some(handle) = st.read_timeout.take() {
            handle.cancel();
        }
        st.read_deadline = deadline;
        if let Some(deadline) = deadline {
            st.read_timeout = Some(self.scheduler.add_timeout(
                deadline,
                Box::new(|shared, st| {
                    st.read_timeout = None;
                    shared.data_available.notify_all();
                    None
                }),
            ));
        }
    }

    fn set_write_deadline_locked(&self, st: &mut ConnState, deadline: Option<Instant>) {
        if let Some(handle) = st.write_timeout.take() {
            handle.cancel();
        }
        st.write_deadline = deadline;
        if let Some(deadline) = deadline {
            st.write_timeout = Some(self.scheduler.add_timeout(
                deadline,
                Box::new(|shared, st| {
                    st.write_timeout = None;
                    shared.space_available.notify_all();
                    None
                }),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_net::Ipv4Host;
    use std::net::Ipv4Addr;

    type V4Conn = Arc<ConnShared<Ipv4Host>>;

    /// A connection with no host behind it: emitted segments vanish, which
    /// is exactly what state-machine tests want.
    fn listen_conn() -> V4Conn {
        ConnShared::new_listen(
            Weak::new(),
            (Ipv4Addr::new(10, 0, 0, 2), 80),
            (Ipv4Addr::new(10, 0, 0, 1), 41000),
        )
    }

    fn segment(seq: u32, ack: u32, flags: TcpFlags) -> TcpHeader {
        TcpHeader {
            src_port: 41000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 65535,
            checksum: 0,
            urgent: 0,
            mss: None,
        }
    }

    fn state_of(conn: &V4Conn) -> TcpState {
        conn.state.lock().unwrap().state
    }

    fn snd_nxt_of(conn: &V4Conn) -> SeqNum {
        conn.state.lock().unwrap().snd_nxt
    }

    #[test]
    fn passive_open_reaches_established() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        assert_eq!(state_of(&conn), TcpState::SynRcvd);

        let iss = conn.state.lock().unwrap().iss;
        conn.handle_segment(&segment(1001, iss.0.wrapping_add(1), TcpFlags::ACK), &[]);
        assert_eq!(state_of(&conn), TcpState::Established);

        // The receive buffer was allocated at SYN+1.
        let st = conn.state.lock().unwrap();
        assert_eq!(st.incoming.as_ref().unwrap().next(), SeqNum(1001));
    }

    #[test]
    fn data_flows_into_the_receive_buffer_in_order() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let iss = conn.state.lock().unwrap().iss;
        let ack = iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);

        // Out-of-order segment first; nothing is readable yet.
        conn.handle_segment(&segment(1006, ack, TcpFlags::ACK), b"world");
        assert_eq!(conn.state.lock().unwrap().available(), 0);

        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), b"hello");
        let st = conn.state.lock().unwrap();
        assert_eq!(st.available(), 10);
        assert_eq!(st.incoming.as_ref().unwrap().next(), SeqNum(1011));
    }

    #[test]
    fn duplicate_data_does_not_double_deliver() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);

        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), b"abc");
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), b"abc");
        assert_eq!(conn.state.lock().unwrap().available(), 3);
    }

    #[test]
    fn peer_fin_moves_to_close_wait_and_wakes_readers() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK | TcpFlags::FIN), &[]);

        let st = conn.state.lock().unwrap();
        assert_eq!(st.state, TcpState::CloseWait);
        assert_eq!(st.peer_fin, Some(SeqNum(1001)));
        // FIN consumes one sequence number in our acknowledgments.
        assert_eq!(st.ack_value(), SeqNum(1002));
    }

    #[test]
    fn out_of_order_fin_is_not_honored_early() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);

        // FIN that belongs after data we have not seen yet.
        conn.handle_segment(&segment(1006, ack, TcpFlags::ACK | TcpFlags::FIN), b"world");
        assert_eq!(state_of(&conn), TcpState::Established);

        // The missing data arrives; a retransmitted FIN is now in order.
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), b"hello");
        conn.handle_segment(&segment(1006, ack, TcpFlags::ACK | TcpFlags::FIN), b"world");
        assert_eq!(state_of(&conn), TcpState::CloseWait);
    }

    #[test]
    fn active_close_walks_fin_wait_states() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);

        let handle = Connection {
            shared: conn.clone(),
        };
        handle.close().unwrap();
        assert_eq!(state_of(&conn), TcpState::FinWait1);
        let fin_seq = conn.state.lock().unwrap().fin_seq.unwrap();
        assert_eq!(snd_nxt_of(&conn), fin_seq + 1);

        // Peer acks our FIN.
        conn.handle_segment(
            &segment(1001, fin_seq.0.wrapping_add(1), TcpFlags::ACK),
            &[],
        );
        assert_eq!(state_of(&conn), TcpState::FinWait2);

        // Peer's own FIN arrives; we drain through TIME_WAIT.
        conn.handle_segment(
            &segment(1001, fin_seq.0.wrapping_add(1), TcpFlags::ACK | TcpFlags::FIN),
            &[],
        );
        assert_eq!(state_of(&conn), TcpState::TimeWait);
        assert_eq!(handle.state_name(), "TIME_WAIT");
    }

    #[test]
    fn passive_close_ends_in_closed() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK | TcpFlags::FIN), &[]);
        assert_eq!(state_of(&conn), TcpState::CloseWait);

        let handle = Connection {
            shared: conn.clone(),
        };
        handle.close().unwrap();
        assert_eq!(state_of(&conn), TcpState::LastAck);

        let fin_seq = conn.state.lock().unwrap().fin_seq.unwrap();
        conn.handle_segment(
            &segment(1002, fin_seq.0.wrapping_add(1), TcpFlags::ACK),
            &[],
        );
        assert_eq!(state_of(&conn), TcpState::Closed);
    }

    #[test]
    fn rst_tears_the_connection_down() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);

        conn.handle_segment(&segment(1001, ack, TcpFlags::RST), &[]);
        let st = conn.state.lock().unwrap();
        assert_eq!(st.state, TcpState::Closed);
        assert!(st.reset);
        drop(st);

        let handle = Connection {
            shared: conn.clone(),
        };
        let mut buf = [0u8; 4];
        assert!(matches!(
            handle.read(&mut buf),
            Err(TcpError::ConnectionReset)
        ));
        assert!(matches!(
            handle.write(b"x"),
            Err(TcpError::ConnectionReset)
        ));
    }

    #[test]
    fn reading_past_a_fin_returns_end_of_stream() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), b"tail");
        conn.handle_segment(&segment(1005, ack, TcpFlags::ACK | TcpFlags::FIN), &[]);

        let handle = Connection {
            shared: conn.clone(),
        };
        let mut buf = [0u8; 16];
        assert_eq!(handle.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(handle.read(&mut buf).unwrap(), 0);
        assert_eq!(handle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn acks_release_send_buffer_space() {
        let conn = listen_conn();
        conn.handle_segment(&segment(1000, 0, TcpFlags::SYN), &[]);
        let ack = conn.state.lock().unwrap().iss.0.wrapping_add(1);
        conn.handle_segment(&segment(1001, ack, TcpFlags::ACK), &[]);

        let handle = Connection {
            shared: conn.clone(),
        };
        assert_eq!(handle.write(b"outbound data").unwrap(), 13);
        {
            let st = conn.state.lock().unwrap();
            assert_eq!(st.outgoing.len(), 13);
            assert_eq!(st.snd_nxt, st.outgoing.base_seq() + 13);
        }

        // Peer acknowledges everything.
        let acked = {
            let st = conn.state.lock().unwrap();
            st.snd_nxt.0
        };
        conn.handle_segment(&segment(1001, acked, TcpFlags::ACK), &[]);
        let st = conn.state.lock().unwrap();
        assert_eq!(st.outgoing.len(), 0);
        assert_eq!(st.snd_una, st.snd_nxt);
    }
}

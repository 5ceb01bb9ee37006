//! Listener accept-queue backpressure and reset behavior, driven by
//! injecting raw segments through a single device.

use std::net::Ipv4Addr;
use std::sync::Arc;

use skein_net::testutil::MemDevice;
use skein_net::{parse_cidr4, Device, Ipv4Device, Ipv4Host};
use skein_packet::ipv4::{self, Ipv4Header};
use skein_packet::tcp::{TcpFlags, TcpHeader};
use skein_tcp::{Ipv4TcpHost, ACCEPT_QUEUE_LIMIT};

const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn stack() -> (Ipv4TcpHost, Arc<MemDevice>) {
    let dev = MemDevice::new("d0", 1500);
    dev.set_ipv4(LOCAL, Ipv4Addr::new(255, 255, 255, 0)).unwrap();
    dev.bring_up().unwrap();
    let ip = Ipv4Host::new();
    ip.add_device(dev.clone());
    ip.add_device_route(parse_cidr4("10.0.0.0/24").unwrap().1, dev.clone())
        .unwrap();
    (Ipv4TcpHost::new(ip), dev)
}

fn tcp_datagram(src_port: u16, dst_port: u16, seq: u32, flags: TcpFlags) -> Vec<u8> {
    let tcp = TcpHeader {
        src_port,
        dst_port,
        seq,
        ack: 0,
        flags,
        window: 65535,
        checksum: 0,
        urgent: 0,
        mss: None,
    };
    let tcp_len = tcp.header_len();
    let header = Ipv4Header {
        total_len: (ipv4::HEADER_LEN + tcp_len) as u16,
        ttl: 32,
        protocol: 6,
        src: PEER,
        dst: LOCAL,
        ..Ipv4Header::default()
    };
    let mut frame = vec![0u8; ipv4::HEADER_LEN + tcp_len];
    header.emit(&mut frame).unwrap();
    tcp.emit(&mut frame[ipv4::HEADER_LEN..]).unwrap();
    frame
}

fn parse_sent_tcp(frame: &[u8]) -> TcpHeader {
    let (_, ip_len) = Ipv4Header::parse(frame).unwrap();
    TcpHeader::parse(&frame[ip_len..]).unwrap().0
}

#[test]
fn accept_queue_caps_pending_connections() {
    let (tcp, dev) = stack();
    let _listener = tcp.listen(LOCAL, 80).unwrap();

    // One more SYN than the queue holds, every one from a distinct port.
    let first_port = 2000u16;
    for i in 0..=ACCEPT_QUEUE_LIMIT as u16 {
        let frame = tcp_datagram(first_port + i, 80, 1000 + i as u32, TcpFlags::SYN);
        dev.inject_ipv4(&frame);
    }

    // The overflow SYN created no state; the peer is expected to
    // retransmit it later.
    assert_eq!(tcp.connection_count(), ACCEPT_QUEUE_LIMIT);

    // Every admitted connection answered its SYN (counting peers, not
    // frames, so a retransmitted SYN|ACK cannot skew the tally).
    let syn_ack_peers: std::collections::HashSet<u16> = dev
        .sent()
        .iter()
        .filter_map(|f| {
            let hdr = parse_sent_tcp(&f.frame);
            (hdr.flags.syn() && hdr.flags.ack()).then_some(hdr.dst_port)
        })
        .collect();
    assert_eq!(syn_ack_peers.len(), ACCEPT_QUEUE_LIMIT);
}

#[test]
fn accepting_drains_the_queue_and_admits_more() {
    let (tcp, dev) = stack();
    let listener = tcp.listen(LOCAL, 80).unwrap();

    for i in 0..ACCEPT_QUEUE_LIMIT as u16 {
        dev.inject_ipv4(&tcp_datagram(2000 + i, 80, 1, TcpFlags::SYN));
    }
    assert_eq!(tcp.connection_count(), ACCEPT_QUEUE_LIMIT);

    let conn = listener.accept().unwrap();
    assert_eq!(conn.state_name(), "SYN_RCVD");

    // Queue has room again; a fresh SYN is admitted.
    dev.inject_ipv4(&tcp_datagram(9999, 80, 1, TcpFlags::SYN));
    assert_eq!(tcp.connection_count(), ACCEPT_QUEUE_LIMIT + 1);
}

#[test]
fn segment_without_listener_draws_a_reset() {
    let (tcp, dev) = stack();
    let _ = tcp;

    dev.inject_ipv4(&tcp_datagram(4000, 81, 5000, TcpFlags::SYN));

    let sent = dev.sent();
    assert_eq!(sent.len(), 1);
    let hdr = parse_sent_tcp(&sent[0].frame);
    assert!(hdr.flags.rst());
    assert!(hdr.flags.ack());
    assert_eq!(hdr.ack, 5001); // SYN occupies one sequence number
    assert_eq!(hdr.src_port, 81);
    assert_eq!(hdr.dst_port, 4000);
}

#[test]
fn non_syn_segment_to_a_listener_draws_a_reset() {
    let (tcp, dev) = stack();
    let _listener = tcp.listen(LOCAL, 80).unwrap();

    dev.inject_ipv4(&tcp_datagram(4000, 80, 5000, TcpFlags::FIN));

    let sent = dev.sent();
    assert_eq!(sent.len(), 1);
    let hdr = parse_sent_tcp(&sent[0].frame);
    assert!(hdr.flags.rst());
}

#[test]
fn closing_the_listener_resets_queued_connections() {
    let (tcp, dev) = stack();
    let listener = tcp.listen(LOCAL, 80).unwrap();

    for i in 0..4u16 {
        dev.inject_ipv4(&tcp_datagram(3000 + i, 80, 1, TcpFlags::SYN));
    }
    assert_eq!(tcp.connection_count(), 4);
    dev.clear_sent();

    listener.close().unwrap();
    assert_eq!(tcp.connection_count(), 0);

    let resets = dev
        .sent()
        .iter()
        .filter(|f| parse_sent_tcp(&f.frame).flags.rst())
        .count();
    assert_eq!(resets, 4);
}

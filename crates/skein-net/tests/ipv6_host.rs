//! IPv6 host tests: the family mirrors IPv4, so these cover the
//! IPv6-specific surface (hop limit, 40-byte header) rather than repeating
//! the full matrix.

use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};

use skein_net::testutil::MemDevice;
use skein_net::{parse_cidr6, Device, Ipv6Device, Ipv6Host, NetError};
use skein_packet::ipv6::{self, Ipv6Header};

fn addr(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

fn datagram(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, hops: u8, payload: &[u8]) -> Vec<u8> {
    let header = Ipv6Header {
        payload_len: payload.len() as u16,
        next_header,
        hop_limit: hops,
        src,
        dst,
        ..Ipv6Header::default()
    };
    let mut buf = vec![0u8; ipv6::HEADER_LEN + payload.len()];
    header.emit(&mut buf).unwrap();
    buf[ipv6::HEADER_LEN..].copy_from_slice(payload);
    buf
}

#[test]
fn ingress_delivers_to_protocol_callback() {
    let host = Ipv6Host::new();
    let dev = MemDevice::new("d0", 1500);
    dev.set_ipv6(addr("fd00::2"), addr("ffff:ffff:ffff:ffff::"))
        .unwrap();
    host.add_device(dev.clone());

    let seen: Arc<Mutex<Vec<(Vec<u8>, Ipv6Addr, Ipv6Addr)>>> = Arc::default();
    let sink = seen.clone();
    host.register_callback(
        Some(Arc::new(move |payload, src, dst| {
            sink.lock().unwrap().push((payload.to_vec(), src, dst));
        })),
        17,
    );

    dev.inject_ipv6(&datagram(addr("fd00::1"), addr("fd00::2"), 17, 32, b"PING"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, b"PING");
    assert_eq!(seen[0].1, addr("fd00::1"));
    assert_eq!(seen[0].2, addr("fd00::2"));
}

#[test]
fn forwarding_decrements_hop_limit() {
    let host = Ipv6Host::new();
    let (d1, d2) = (MemDevice::new("d1", 1500), MemDevice::new("d2", 1500));
    d1.set_ipv6(addr("fd00:a::2"), addr("ffff:ffff:ffff:ffff::"))
        .unwrap();
    d2.set_ipv6(addr("fd00:b::2"), addr("ffff:ffff:ffff:ffff::"))
        .unwrap();
    d2.bring_up().unwrap();
    host.add_device(d1.clone());
    host.add_device(d2.clone());
    host.add_device_route(parse_cidr6("fd00:b::/64").unwrap().1, d2.clone())
        .unwrap();
    host.set_forwarding(true);

    d1.inject_ipv6(&datagram(addr("fd00:a::1"), addr("fd00:b::5"), 17, 2, b"DATA"));
    let sent = d2.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].frame[7], 1, "hop limit on the wire");

    // Hop limit 1 would expire in flight; the datagram is dropped.
    d1.inject_ipv6(&datagram(addr("fd00:a::1"), addr("fd00:b::5"), 17, 1, b"DATA"));
    assert_eq!(d2.sent().len(), 1);
}

#[test]
fn write_to_builds_header() {
    let host = Ipv6Host::new();
    let dev = MemDevice::new("d0", 1500);
    dev.set_ipv6(addr("fd00::2"), addr("ffff:ffff:ffff:ffff::"))
        .unwrap();
    dev.bring_up().unwrap();
    host.add_device(dev.clone());
    host.add_device_route(parse_cidr6("fd00::/64").unwrap().1, dev.clone())
        .unwrap();

    let n = host.write_to(b"hello", addr("fd00::9"), 17).unwrap();
    assert_eq!(n, 5);

    let sent = dev.sent();
    let (header, header_len) = Ipv6Header::parse(&sent[0].frame).unwrap();
    assert_eq!(header.payload_len, 5);
    assert_eq!(header.next_header, 17);
    assert_eq!(header.hop_limit, 32);
    assert_eq!(header.src, addr("fd00::2"));
    assert_eq!(header.dst, addr("fd00::9"));
    assert_eq!(&sent[0].frame[header_len..], b"hello");
}

#[test]
fn oversized_payload_is_refused() {
    let host = Ipv6Host::new();
    let dev = MemDevice::new("d0", 1500);
    dev.set_ipv6(addr("fd00::2"), addr("ffff:ffff:ffff:ffff::"))
        .unwrap();
    dev.bring_up().unwrap();
    host.add_device(dev.clone());
    host.add_device_route(parse_cidr6("fd00::/64").unwrap().1, dev.clone())
        .unwrap();

    let err = host
        .write_to(&vec![0u8; 65536], addr("fd00::9"), 17)
        .unwrap_err();
    assert!(matches!(err, NetError::PayloadTooLarge { .. }));
    assert!(dev.sent().is_empty());
}

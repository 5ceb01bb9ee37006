//! Shared setup: two full stacks joined by an in-memory link.

use std::net::Ipv4Addr;
use std::sync::Arc;

use skein_net::testutil::MemDevice;
use skein_net::{parse_cidr4, Device, Ipv4Device, Ipv4Host};
use skein_tcp::Ipv4TcpHost;

pub const ADDR_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const ADDR_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

pub struct TwoStacks {
    pub tcp_a: Ipv4TcpHost,
    pub tcp_b: Ipv4TcpHost,
    pub dev_a: Arc<MemDevice>,
    pub dev_b: Arc<MemDevice>,
}

/// Opt-in log output for debugging failing tests (`RUST_LOG=debug`).
fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Two hosts on 10.0.0.0/24, linked back to back. Frames written by one
/// side are pumped into the other side's ingress by the device daemons.
pub fn two_stacks() -> TwoStacks {
    init_tracing();
    let netmask = Ipv4Addr::new(255, 255, 255, 0);
    let subnet = parse_cidr4("10.0.0.0/24").unwrap().1;

    let (dev_a, dev_b) = MemDevice::pair("a", "b", 1500);
    dev_a.set_ipv4(ADDR_A, netmask).unwrap();
    dev_b.set_ipv4(ADDR_B, netmask).unwrap();
    dev_a.bring_up().unwrap();
    dev_b.bring_up().unwrap();

    let ip_a = Ipv4Host::new();
    ip_a.add_device(dev_a.clone());
    ip_a.add_device_route(subnet, dev_a.clone()).unwrap();

    let ip_b = Ipv4Host::new();
    ip_b.add_device(dev_b.clone());
    ip_b.add_device_route(subnet, dev_b.clone()).unwrap();

    TwoStacks {
        tcp_a: Ipv4TcpHost::new(ip_a),
        tcp_b: Ipv4TcpHost::new(ip_b),
        dev_a,
        dev_b,
    }
}

//! Deadline behavior: blocked readers wake on past deadlines, cleared
//! deadlines never fire, stalled writers give up on time.

mod common;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant, SystemTime};

use common::{two_stacks, ADDR_B};
use skein_net::Ipv4Host;
use skein_tcp::{Connection, Listener};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn established_pair(
    stacks: &common::TwoStacks,
    port: u16,
) -> (Connection<Ipv4Host>, Connection<Ipv4Host>, Listener<Ipv4Host>) {
    let listener = stacks.tcp_b.listen(ADDR_B, port).unwrap();
    let client = stacks
        .tcp_a
        .connect_timeout(ADDR_B, port, CONNECT_TIMEOUT)
        .unwrap();
    let server = listener.accept().unwrap();
    (client, server, listener)
}

#[test]
fn past_read_deadline_wakes_a_blocked_reader() {
    let stacks = two_stacks();
    let (client, _server, _listener) = established_pair(&stacks, 7100);

    let reader = {
        let client = client.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            let started = Instant::now();
            (client.read(&mut buf), started.elapsed())
        })
    };

    std::thread::sleep(Duration::from_millis(10));
    client.set_read_deadline(Some(SystemTime::now() - Duration::from_millis(5)));

    let (result, blocked_for) = reader.join().unwrap();
    let err = result.unwrap_err();
    assert!(err.is_timeout(), "got {err}");
    assert!(
        blocked_for < Duration::from_secs(2),
        "reader wake took {blocked_for:?}"
    );
}

#[test]
fn read_with_deadline_already_reached_fails_without_blocking() {
    let stacks = two_stacks();
    let (client, _server, _listener) = established_pair(&stacks, 7101);

    client.set_read_deadline(Some(SystemTime::now() - Duration::from_millis(5)));
    let mut buf = [0u8; 4];
    assert!(client.read(&mut buf).unwrap_err().is_timeout());

    // Clearing the deadline makes reads block (and succeed) again.
    client.set_read_deadline(None);
    _server.write(b"ping").unwrap();
    assert_eq!(client.read(&mut buf).unwrap(), 4);
}

#[test]
fn cleared_deadline_does_not_fire() {
    let stacks = two_stacks();
    let (client, server, _listener) = established_pair(&stacks, 7102);

    client.set_read_deadline(Some(SystemTime::now() + Duration::from_millis(50)));
    client.set_read_deadline(None);

    let reader = {
        let client = client.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            client.read(&mut buf).map(|n| buf[..n].to_vec())
        })
    };

    // Well past the cancelled deadline, the reader must still be blocked;
    // data must complete it normally.
    std::thread::sleep(Duration::from_millis(150));
    server.write(b"late").unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), b"late");
}

#[test]
fn past_write_deadline_fails_before_buffering() {
    let stacks = two_stacks();
    let (client, _server, _listener) = established_pair(&stacks, 7103);

    client.set_write_deadline(Some(SystemTime::now() - Duration::from_millis(5)));
    assert!(client.write(b"never sent").unwrap_err().is_timeout());
}

#[test]
fn stalled_write_returns_partial_progress_on_deadline() {
    let stacks = two_stacks();
    let (client, _server, _listener) = established_pair(&stacks, 7104);

    // The server never reads, so the client can place at most its own
    // send buffer plus the peer's receive window.
    const ATTEMPT: usize = 512 * 1024;
    let payload = vec![0xA5u8; ATTEMPT];
    client.set_write_deadline(Some(SystemTime::now() + Duration::from_millis(200)));

    let started = Instant::now();
    let result = client.write(&payload);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "write did not observe its deadline"
    );
    match result {
        Ok(n) => assert!(n < ATTEMPT, "wrote everything despite a stalled peer"),
        Err(err) => assert!(err.is_timeout(), "got {err}"),
    }
}

#[test]
fn set_deadline_applies_to_both_directions() {
    let stacks = two_stacks();
    let (client, _server, _listener) = established_pair(&stacks, 7105);

    client.set_deadline(Some(SystemTime::now() - Duration::from_millis(1)));
    let mut buf = [0u8; 4];
    assert!(client.read(&mut buf).unwrap_err().is_timeout());
    assert!(client.write(b"x").unwrap_err().is_timeout());

    client.set_deadline(None);
    _server.write(b"pong").unwrap();
    assert_eq!(client.read(&mut buf).unwrap(), 4);
}

#[test]
fn connect_times_out_against_a_black_hole() {
    let stacks = two_stacks();
    // 10.0.0.99 is routable (device route covers the /24) but nobody
    // answers: host B drops datagrams that are not addressed to it.
    let dead = Ipv4Addr::new(10, 0, 0, 99);
    let started = Instant::now();
    let err = stacks
        .tcp_a
        .connect_timeout(dead, 80, Duration::from_millis(200))
        .unwrap_err();
    assert!(err.is_timeout(), "got {err}");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The failed attempt leaves no connection behind.
    let deadline = Instant::now() + Duration::from_secs(2);
    while stacks.tcp_a.connection_count() != 0 {
        assert!(Instant::now() < deadline, "half-open connection leaked");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#![forbid(unsafe_code)]

//! Blocking TCP on top of [`skein_net`].
//!
//! A [`TcpHost`] registers itself as the protocol-6 handler on an IP host
//! and demultiplexes inbound segments to connections (by four-tuple) or
//! listeners (by two-tuple). Connections expose blocking `read`, `write`,
//! `close` and wall-clock deadlines; inside, each connection is a mutex,
//! two condition variables and a deadline scheduler driving a standard
//! TCP state machine over a sparse reassembly buffer and a sliding send
//! buffer.
//!
//! The crate is generic over the address family through [`IpStack`];
//! [`Ipv4TcpHost`] and [`Ipv6TcpHost`] are the two monomorphic stacks.

pub mod conn;
pub mod error;
pub mod host;
pub mod listener;
pub mod read_buffer;
pub mod send_buffer;
pub mod seq;
pub mod stack;
mod timeout;

pub use conn::{Connection, TcpState};
pub use error::{Result, TcpError};
pub use host::{FourTuple, Ipv4TcpHost, Ipv6TcpHost, TcpHost};
pub use listener::{Listener, ACCEPT_QUEUE_LIMIT};
pub use read_buffer::ReadBuffer;
pub use send_buffer::SendBuffer;
pub use seq::SeqNum;
pub use stack::IpStack;

#![forbid(unsafe_code)]

//! Byte-exact header codecs for the skein network stack.
//!
//! Parsers take a byte slice and return a header struct plus the number of
//! bytes the header occupied; emitters write into a caller-provided buffer.
//! Nothing here allocates. Transport checksums live in [`checksum`] so the
//! TCP layer can compute them over the pseudo-header after assembling a
//! segment.

pub mod checksum;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;

use thiserror::Error;

pub use ipv4::Ipv4Header;
pub use ipv6::Ipv6Header;
pub use tcp::{TcpFlags, TcpHeader};

/// Errors returned by packet parsers and emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The input buffer ended before the header could be read.
    #[error("packet truncated (needed {needed}, got {actual})")]
    Truncated { needed: usize, actual: usize },

    /// A field was structurally invalid (e.g. IPv4 version != 4).
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// The provided output buffer was too small to emit into.
    #[error("buffer too small (needed {needed}, got {actual})")]
    BufferTooSmall { needed: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, PacketError>;

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_out_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(PacketError::BufferTooSmall {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

use std::net::Ipv4Addr;

use crate::{checksum, ensure_len, ensure_out_len, PacketError, Result};

/// Length of an IPv4 header without options. Emitted headers never carry
/// options; parsed headers may, and the option bytes are skipped.
pub const HEADER_LEN: usize = 20;

/// Largest value of the total-length field, header included.
pub const MAX_TOTAL_LEN: usize = 65535;

/// A decoded IPv4 header. Version and IHL are validated on parse and fixed
/// on emit (version 4, IHL 5), so they are not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub dscp: u8,
    pub ecn: u8,
    /// Total datagram length, header included.
    pub total_len: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    /// As read off the wire; zero on emit until the emitter fills it in.
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Default for Ipv4Header {
    fn default() -> Ipv4Header {
        Ipv4Header {
            dscp: 0,
            ecn: 0,
            total_len: 0,
            identification: 0,
            flags: 0,
            fragment_offset: 0,
            ttl: 0,
            protocol: 0,
            checksum: 0,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl Ipv4Header {
    /// Parses a header from the front of `buf`, returning it together with
    /// the header length (options included, so the payload starts there).
    ///
    /// Fails when the buffer is shorter than the header claims to be, or
    /// when the total-length field is inconsistent with the header length.
    /// Option bytes are skipped, not interpreted.
    pub fn parse(buf: &[u8]) -> Result<(Ipv4Header, usize)> {
        ensure_len(buf, HEADER_LEN)?;
        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::Malformed("IPv4 version"));
        }
        let ihl = (buf[0] & 0x0F) as usize;
        if ihl < 5 {
            return Err(PacketError::Malformed("IPv4 IHL below 5"));
        }
        let header_len = ihl * 4;
        ensure_len(buf, header_len)?;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]);
        if (total_len as usize) < header_len {
            return Err(PacketError::Malformed("IPv4 total length below header"));
        }

        let hdr = Ipv4Header {
            dscp: buf[1] >> 2,
            ecn: buf[1] & 0x03,
            total_len,
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            flags: buf[6] >> 5,
            fragment_offset: (((buf[6] & 0x1F) as u16) << 8) | buf[7] as u16,
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        };
        Ok((hdr, header_len))
    }

    /// Emits the fixed 20-byte header into the front of `out` and fills in
    /// the header checksum. The `checksum` field of `self` is ignored.
    pub fn emit(&self, out: &mut [u8]) -> Result<usize> {
        ensure_out_len(out, HEADER_LEN)?;
        out[0] = (4 << 4) | 5;
        out[1] = (self.dscp << 2) | (self.ecn & 0x03);
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6] = (self.flags << 5) | ((self.fragment_offset >> 8) as u8 & 0x1F);
        out[7] = self.fragment_offset as u8;
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&[0, 0]);
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let csum = checksum::ipv4_header(&out[..HEADER_LEN]);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        Ok(HEADER_LEN)
    }
}

/// Rewrites the TTL byte of an encoded datagram in place and recomputes the
/// header checksum, leaving every other byte untouched. The buffer must
/// start with a structurally valid header (checked lengths only).
pub fn set_ttl(buf: &mut [u8], ttl: u8) -> Result<()> {
    ensure_len(buf, HEADER_LEN)?;
    let header_len = (buf[0] & 0x0F) as usize * 4;
    ensure_len(buf, header_len)?;
    buf[8] = ttl;
    buf[10..12].copy_from_slice(&[0, 0]);
    let csum = checksum::ipv4_header(&buf[..header_len]);
    buf[10..12].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}

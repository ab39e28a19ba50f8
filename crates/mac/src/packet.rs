//! Minimal IPv4 parsing for classification, plus a datagram builder for traffic sources.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tos: u8,
}

impl FiveTuple {
    /// Parses an IPv4 datagram. Ports are only read for TCP and UDP.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < IPV4_HEADER_LEN || payload[0] >> 4 != 4 {
            return None;
        }
        let ihl = (payload[0] & 0x0F) as usize * 4;
        if ihl < IPV4_HEADER_LEN || payload.len() < ihl {
            return None;
        }

        let mut t = FiveTuple {
            src: Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]),
            dst: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
            proto: payload[9],
            src_port: 0,
            dst_port: 0,
            tos: payload[1],
        };
        if (t.proto == PROTO_TCP || t.proto == PROTO_UDP) && payload.len() >= ihl + 4 {
            t.src_port = u16::from_be_bytes([payload[ihl], payload[ihl + 1]]);
            t.dst_port = u16::from_be_bytes([payload[ihl + 2], payload[ihl + 3]]);
        }
        Some(t)
    }
}

/// Builds an IPv4/UDP datagram of exactly `total_len` bytes (at least the two headers).
pub fn udp_datagram(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), total_len: usize) -> Bytes {
    let total_len = total_len.max(IPV4_HEADER_LEN + UDP_HEADER_LEN).min(u16::MAX as usize);
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total_len as u16);
    buf.put_u32(0);
    buf.put_u8(64);
    buf.put_u8(PROTO_UDP);
    buf.put_u16(0);
    buf.put_slice(&src.0.octets());
    buf.put_slice(&dst.0.octets());
    buf.put_u16(src.1);
    buf.put_u16(dst.1);
    buf.put_u16((total_len - IPV4_HEADER_LEN) as u16);
    buf.put_u16(0);
    buf.resize(total_len, 0);
    buf.freeze()
}

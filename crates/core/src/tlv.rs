//! Type-Length-Value encoding used by service-flow parameter sets.
//!
//! A TLV is a type byte, a length field and the value. Lengths below 128 take
//! a single byte; longer values use `0x80 | n` followed by the length in `n`
//! big-endian bytes. Vector values are back-to-back complete sub-TLVs.
//!
//! The type byte alone does not say how a value is laid out, so decoding is
//! driven by a [`TlvScope`]: the same code means different things at the top
//! level, inside a service-flow vector, or inside a classification rule.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use crate::wire::{ensure, WireFormat};
use crate::CodecError;

pub const UPLINK_SERVICE_FLOW: u8 = 145;
pub const DOWNLINK_SERVICE_FLOW: u8 = 146;

/// Sub-TLV codes inside a service-flow vector.
pub mod sf {
    pub const SFID: u8 = 1;
    pub const CID: u8 = 2;
    pub const SERVICE_CLASS_NAME: u8 = 3;
    pub const QOS_PARAMETER_SET_TYPE: u8 = 5;
    pub const TRAFFIC_PRIORITY: u8 = 6;
    pub const MAX_SUSTAINED_TRAFFIC_RATE: u8 = 7;
    pub const MAX_TRAFFIC_BURST: u8 = 8;
    pub const MIN_RESERVED_TRAFFIC_RATE: u8 = 9;
    pub const MIN_TOLERABLE_TRAFFIC_RATE: u8 = 10;
    pub const SCHEDULING_TYPE: u8 = 11;
    pub const REQUEST_TRANSMISSION_POLICY: u8 = 12;
    pub const TOLERATED_JITTER: u8 = 13;
    pub const MAXIMUM_LATENCY: u8 = 14;
    pub const FIXED_VS_VARIABLE_SDU: u8 = 15;
    pub const SDU_SIZE: u8 = 16;
    pub const TARGET_SAID: u8 = 17;
    pub const ARQ_ENABLE: u8 = 18;
    pub const ARQ_WINDOW_SIZE: u8 = 19;
    pub const ARQ_RETRY_TIMEOUT_TX: u8 = 20;
    pub const ARQ_RETRY_TIMEOUT_RX: u8 = 21;
    pub const ARQ_BLOCK_LIFETIME: u8 = 22;
    pub const ARQ_SYNC_LOSS: u8 = 23;
    pub const ARQ_DELIVER_IN_ORDER: u8 = 24;
    pub const ARQ_PURGE_TIMEOUT: u8 = 25;
    pub const ARQ_BLOCK_SIZE: u8 = 26;
    pub const CS_SPECIFICATION: u8 = 28;
    pub const UNSOLICITED_GRANT_INTERVAL: u8 = 29;
    pub const UNSOLICITED_POLLING_INTERVAL: u8 = 30;
    pub const IPV4_CS_PARAMETERS: u8 = 100;
}

/// Sub-TLV codes inside convergence-sublayer parameters.
pub mod cs_param {
    pub const CLASSIFIER_DSC_ACTION: u8 = 1;
    pub const PACKET_CLASSIFICATION_RULE: u8 = 3;
}

/// Sub-TLV codes inside a packet classification rule.
pub mod rule {
    pub const PRIORITY: u8 = 1;
    pub const TOS: u8 = 2;
    pub const PROTOCOL: u8 = 3;
    pub const IP_SRC: u8 = 4;
    pub const IP_DST: u8 = 5;
    pub const PORT_SRC: u8 = 6;
    pub const PORT_DST: u8 = 7;
    pub const INDEX: u8 = 14;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlvScope {
    TopLevel,
    ServiceFlow,
    CsParameters,
    ClassificationRule,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueKind {
    U8,
    U16,
    U32,
    Bytes,
    Tos,
    PortRanges,
    Protocols,
    Ipv4Addresses,
    Vector(TlvScope),
}

impl TlvScope {
    fn value_kind(self, tlv_type: u8) -> ValueKind {
        match self {
            TlvScope::TopLevel => match tlv_type {
                UPLINK_SERVICE_FLOW | DOWNLINK_SERVICE_FLOW => {
                    ValueKind::Vector(TlvScope::ServiceFlow)
                }
                _ => ValueKind::Bytes,
            },
            TlvScope::ServiceFlow => match tlv_type {
                sf::SFID
                | sf::MAX_SUSTAINED_TRAFFIC_RATE
                | sf::MAX_TRAFFIC_BURST
                | sf::MIN_RESERVED_TRAFFIC_RATE
                | sf::MIN_TOLERABLE_TRAFFIC_RATE
                | sf::REQUEST_TRANSMISSION_POLICY
                | sf::TOLERATED_JITTER
                | sf::MAXIMUM_LATENCY => ValueKind::U32,
                sf::CID
                | sf::TARGET_SAID
                | sf::ARQ_WINDOW_SIZE
                | sf::ARQ_RETRY_TIMEOUT_TX
                | sf::ARQ_RETRY_TIMEOUT_RX
                | sf::ARQ_BLOCK_LIFETIME
                | sf::ARQ_SYNC_LOSS
                | sf::ARQ_PURGE_TIMEOUT
                | sf::ARQ_BLOCK_SIZE
                | sf::UNSOLICITED_GRANT_INTERVAL
                | sf::UNSOLICITED_POLLING_INTERVAL => ValueKind::U16,
                sf::QOS_PARAMETER_SET_TYPE
                | sf::TRAFFIC_PRIORITY
                | sf::SCHEDULING_TYPE
                | sf::FIXED_VS_VARIABLE_SDU
                | sf::SDU_SIZE
                | sf::ARQ_ENABLE
                | sf::ARQ_DELIVER_IN_ORDER
                | sf::CS_SPECIFICATION => ValueKind::U8,
                sf::IPV4_CS_PARAMETERS => ValueKind::Vector(TlvScope::CsParameters),
                _ => ValueKind::Bytes,
            },
            TlvScope::CsParameters => match tlv_type {
                cs_param::CLASSIFIER_DSC_ACTION => ValueKind::U8,
                cs_param::PACKET_CLASSIFICATION_RULE => {
                    ValueKind::Vector(TlvScope::ClassificationRule)
                }
                _ => ValueKind::Bytes,
            },
            TlvScope::ClassificationRule => match tlv_type {
                rule::PRIORITY => ValueKind::U8,
                rule::TOS => ValueKind::Tos,
                rule::PROTOCOL => ValueKind::Protocols,
                rule::IP_SRC | rule::IP_DST => ValueKind::Ipv4Addresses,
                rule::PORT_SRC | rule::PORT_DST => ValueKind::PortRanges,
                rule::INDEX => ValueKind::U16,
                _ => ValueKind::Bytes,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TosRange {
    pub low: u8,
    pub high: u8,
    pub mask: u8,
}

impl TosRange {
    pub fn matches(&self, tos: u8) -> bool {
        let masked = tos & self.mask;
        masked >= self.low && masked <= self.high
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4AddressMask {
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl Ipv4AddressMask {
    pub fn new(address: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self { address, mask }
    }

    pub fn host(address: Ipv4Addr) -> Self {
        Self::new(address, Ipv4Addr::BROADCAST)
    }

    pub fn matches(&self, candidate: Ipv4Addr) -> bool {
        let mask = u32::from(self.mask);
        u32::from(candidate) & mask == u32::from(self.address) & mask
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlvValue {
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(Vec<u8>),
    Tos(TosRange),
    PortRanges(Vec<PortRange>),
    Protocols(Vec<u8>),
    Ipv4Addresses(Vec<Ipv4AddressMask>),
    Vector(Vec<Tlv>),
}

impl TlvValue {
    pub fn serialized_size(&self) -> usize {
        match self {
            TlvValue::U8(_) => 1,
            TlvValue::U16(_) => 2,
            TlvValue::U32(_) => 4,
            TlvValue::Bytes(b) => b.len(),
            TlvValue::Tos(_) => 3,
            TlvValue::PortRanges(r) => r.len() * 4,
            TlvValue::Protocols(p) => p.len(),
            TlvValue::Ipv4Addresses(a) => a.len() * 8,
            TlvValue::Vector(v) => v.iter().map(Tlv::serialized_size).sum(),
        }
    }

    fn serialize(&self, buf: &mut BytesMut) {
        match self {
            TlvValue::U8(v) => buf.put_u8(*v),
            TlvValue::U16(v) => buf.put_u16(*v),
            TlvValue::U32(v) => buf.put_u32(*v),
            TlvValue::Bytes(b) => buf.put_slice(b),
            TlvValue::Tos(t) => {
                buf.put_u8(t.low);
                buf.put_u8(t.high);
                buf.put_u8(t.mask);
            }
            TlvValue::PortRanges(ranges) => {
                for r in ranges {
                    buf.put_u16(r.low);
                    buf.put_u16(r.high);
                }
            }
            TlvValue::Protocols(p) => buf.put_slice(p),
            TlvValue::Ipv4Addresses(addrs) => {
                for a in addrs {
                    buf.put_slice(&a.address.octets());
                    buf.put_slice(&a.mask.octets());
                }
            }
            TlvValue::Vector(items) => {
                for item in items {
                    item.serialize(buf);
                }
            }
        }
    }

    fn decode(kind: ValueKind, tlv_type: u8, mut data: &[u8]) -> Result<Self, CodecError> {
        let len = data.len();
        let exact = move |expected: usize| {
            if len != expected {
                Err(CodecError::BadValueLength {
                    tlv_type,
                    expected,
                    actual: len,
                })
            } else {
                Ok(())
            }
        };
        let multiple_of = move |unit: usize| {
            if len % unit != 0 {
                Err(CodecError::BadValueLength {
                    tlv_type,
                    expected: len - len % unit,
                    actual: len,
                })
            } else {
                Ok(())
            }
        };

        let value = match kind {
            ValueKind::U8 => {
                exact(1)?;
                TlvValue::U8(data.get_u8())
            }
            ValueKind::U16 => {
                exact(2)?;
                TlvValue::U16(data.get_u16())
            }
            ValueKind::U32 => {
                exact(4)?;
                TlvValue::U32(data.get_u32())
            }
            ValueKind::Bytes => TlvValue::Bytes(data.to_vec()),
            ValueKind::Tos => {
                exact(3)?;
                TlvValue::Tos(TosRange {
                    low: data.get_u8(),
                    high: data.get_u8(),
                    mask: data.get_u8(),
                })
            }
            ValueKind::PortRanges => {
                multiple_of(4)?;
                let mut ranges = Vec::with_capacity(data.len() / 4);
                while data.has_remaining() {
                    ranges.push(PortRange::new(data.get_u16(), data.get_u16()));
                }
                TlvValue::PortRanges(ranges)
            }
            ValueKind::Protocols => TlvValue::Protocols(data.to_vec()),
            ValueKind::Ipv4Addresses => {
                multiple_of(8)?;
                let mut addrs = Vec::with_capacity(data.len() / 8);
                while data.has_remaining() {
                    let address = Ipv4Addr::from(data.get_u32());
                    let mask = Ipv4Addr::from(data.get_u32());
                    addrs.push(Ipv4AddressMask { address, mask });
                }
                TlvValue::Ipv4Addresses(addrs)
            }
            ValueKind::Vector(scope) => {
                let mut items = Vec::new();
                while !data.is_empty() {
                    items.push(Tlv::deserialize_in(&mut data, scope)?);
                }
                TlvValue::Vector(items)
            }
        };
        Ok(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tlv {
    tlv_type: u8,
    value: TlvValue,
}

impl Tlv {
    pub fn new(tlv_type: u8, value: TlvValue) -> Self {
        Self { tlv_type, value }
    }

    pub fn u8(tlv_type: u8, v: u8) -> Self {
        Self::new(tlv_type, TlvValue::U8(v))
    }

    pub fn u16(tlv_type: u8, v: u16) -> Self {
        Self::new(tlv_type, TlvValue::U16(v))
    }

    pub fn u32(tlv_type: u8, v: u32) -> Self {
        Self::new(tlv_type, TlvValue::U32(v))
    }

    pub fn vector(tlv_type: u8, items: Vec<Tlv>) -> Self {
        Self::new(tlv_type, TlvValue::Vector(items))
    }

    pub fn tlv_type(&self) -> u8 {
        self.tlv_type
    }

    pub fn value(&self) -> &TlvValue {
        &self.value
    }

    pub fn into_value(self) -> TlvValue {
        self.value
    }

    /// Number of bytes the value occupies on the wire, excluding type and length.
    pub fn length(&self) -> usize {
        self.value.serialized_size()
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self.value {
            TlvValue::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self.value {
            TlvValue::U16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.value {
            TlvValue::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[Tlv]> {
        match &self.value {
            TlvValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// First sub-TLV of the given type in a vector value.
    pub fn find(&self, tlv_type: u8) -> Option<&Tlv> {
        self.as_vector()?.iter().find(|t| t.tlv_type == tlv_type)
    }

    /// Decodes one TLV whose type code is interpreted within `scope`.
    pub fn deserialize_in(buf: &mut &[u8], scope: TlvScope) -> Result<Self, CodecError> {
        ensure(buf, 2, "TLV header")?;
        let tlv_type = buf.get_u8();
        let length = read_length(buf)?;
        if length > buf.len() {
            return Err(CodecError::LengthOverflow {
                length,
                remaining: buf.len(),
            });
        }
        let data: &[u8] = *buf;
        let (value_bytes, rest) = data.split_at(length);
        *buf = rest;
        let value = TlvValue::decode(scope.value_kind(tlv_type), tlv_type, value_bytes)?;
        Ok(Self { tlv_type, value })
    }
}

impl WireFormat for Tlv {
    fn serialized_size(&self) -> usize {
        let len = self.length();
        1 + length_field_size(len) + len
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tlv_type);
        write_length(buf, self.length());
        self.value.serialize(buf);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        Self::deserialize_in(buf, TlvScope::TopLevel)
    }
}

fn long_length_width(len: usize) -> usize {
    match len {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Bytes taken by the length field for a value of `len` bytes.
pub fn length_field_size(len: usize) -> usize {
    if len < 0x80 {
        1
    } else {
        1 + long_length_width(len)
    }
}

pub fn write_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
        return;
    }
    let width = long_length_width(len);
    buf.put_u8(0x80 | width as u8);
    buf.put_uint(len as u64, width);
}

pub fn read_length(buf: &mut &[u8]) -> Result<usize, CodecError> {
    ensure(buf, 1, "TLV length")?;
    let first = buf.get_u8();
    if first & 0x80 == 0 {
        return Ok(first as usize);
    }
    let width = first & 0x7F;
    if width == 0 || width > 4 {
        return Err(CodecError::InvalidLengthField(width));
    }
    ensure(buf, width as usize, "TLV length")?;
    Ok(buf.get_uint(width as usize) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(tlv: &Tlv) -> Vec<u8> {
        tlv.to_bytes().to_vec()
    }

    #[test]
    fn test_scalar_layout() {
        let bytes = encode(&Tlv::u16(7, 0xBEEF));
        assert_eq!(bytes, vec![7, 2, 0xBE, 0xEF]);
    }

    #[test]
    fn test_length_field_boundaries() {
        for len in [0usize, 1, 127, 128, 255, 256, 65_535, 65_536] {
            let tlv = Tlv::new(200, TlvValue::Bytes(vec![0xA5; len]));
            let bytes = encode(&tlv);
            assert_eq!(bytes.len(), tlv.serialized_size(), "len {}", len);
            let expected_field = match len {
                0..=127 => 1,
                128..=255 => 2,
                256..=65_535 => 3,
                _ => 4,
            };
            assert_eq!(length_field_size(len), expected_field);
            let (decoded, consumed) = Tlv::decode_from(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, tlv);
        }
    }

    #[test]
    fn test_long_form_header_bytes() {
        let bytes = encode(&Tlv::new(9, TlvValue::Bytes(vec![0; 300])));
        assert_eq!(&bytes[..4], &[9, 0x82, 0x01, 0x2C]);
    }

    #[test]
    fn test_length_exceeding_buffer_is_rejected() {
        let data = [sf::SFID, 4, 0, 0];
        let err = Tlv::deserialize_in(&mut &data[..], TlvScope::ServiceFlow).unwrap_err();
        assert_eq!(
            err,
            CodecError::LengthOverflow {
                length: 4,
                remaining: 2
            }
        );

        let bad_width = [1u8, 0x85, 0, 0, 0, 0, 0];
        assert_eq!(
            Tlv::decode_from(&bad_width).unwrap_err(),
            CodecError::InvalidLengthField(5)
        );
    }

    #[test]
    fn test_fixed_width_mismatch_is_rejected() {
        let data = [sf::CID, 3, 0, 1, 2];
        let err = Tlv::deserialize_in(&mut &data[..], TlvScope::ServiceFlow).unwrap_err();
        assert!(matches!(err, CodecError::BadValueLength { tlv_type: 2, .. }));
    }

    #[test]
    fn test_nested_classification_rule() {
        let rule = Tlv::vector(
            cs_param::PACKET_CLASSIFICATION_RULE,
            vec![
                Tlv::u8(rule::PRIORITY, 3),
                Tlv::new(
                    rule::TOS,
                    TlvValue::Tos(TosRange {
                        low: 0,
                        high: 0x3F,
                        mask: 0xFC,
                    }),
                ),
                Tlv::new(rule::PROTOCOL, TlvValue::Protocols(vec![6, 17])),
                Tlv::new(
                    rule::IP_SRC,
                    TlvValue::Ipv4Addresses(vec![Ipv4AddressMask::new(
                        Ipv4Addr::new(10, 0, 0, 0),
                        Ipv4Addr::new(255, 0, 0, 0),
                    )]),
                ),
                Tlv::new(
                    rule::PORT_DST,
                    TlvValue::PortRanges(vec![PortRange::new(5000, 5010), PortRange::new(80, 80)]),
                ),
                Tlv::u16(rule::INDEX, 42),
            ],
        );
        let cs = Tlv::vector(
            sf::IPV4_CS_PARAMETERS,
            vec![Tlv::u8(cs_param::CLASSIFIER_DSC_ACTION, 0), rule],
        );
        let flow = Tlv::vector(
            UPLINK_SERVICE_FLOW,
            vec![Tlv::u32(sf::SFID, 77), Tlv::u16(sf::CID, 0x0801), cs],
        );

        let bytes = encode(&flow);
        assert_eq!(bytes.len(), flow.serialized_size());
        let (decoded, consumed) = Tlv::decode_from(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, flow);
        assert_eq!(decoded.find(sf::SFID).and_then(Tlv::as_u32), Some(77));
    }

    #[test]
    fn test_unknown_sub_tlv_is_preserved() {
        let flow = Tlv::vector(
            DOWNLINK_SERVICE_FLOW,
            vec![Tlv::new(99, TlvValue::Bytes(vec![1, 2, 3]))],
        );
        let (decoded, _) = Tlv::decode_from(&encode(&flow)).unwrap();
        assert_eq!(decoded, flow);
    }

    #[test]
    fn test_address_mask_matching() {
        let net = Ipv4AddressMask::new(Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::new(255, 255, 255, 0));
        assert!(net.matches(Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!net.matches(Ipv4Addr::new(192, 168, 2, 1)));
        assert!(Ipv4AddressMask::host(Ipv4Addr::new(1, 2, 3, 4)).matches(Ipv4Addr::new(1, 2, 3, 4)));
    }
}

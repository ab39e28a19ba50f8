//! Per-frame DL-MAP and UL-MAP. The IE list always ends with, and includes,
//! the end-of-map IE.

use bytes::{Buf, BufMut, BytesMut};

use super::{get_mac, put_mac};
use crate::cid::Cid;
use crate::types::{diuc, uiuc, MacAddress};
use crate::wire::{ensure, WireFormat};
use crate::CodecError;

pub const DL_MAP_IE_SIZE: usize = 4;
const UL_MAP_IE_SIZE: usize = 6;

/// Downlink allocation: `CID | DIUC(4) preamble(1) start(11)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DlMapIe {
    pub cid: Cid,
    pub diuc: u8,
    pub preamble_present: bool,
    /// Start symbol offset within the downlink subframe.
    pub start_time: u16,
}

impl DlMapIe {
    pub fn new(cid: Cid, diuc: u8, start_time: u16) -> Self {
        Self {
            cid,
            diuc,
            preamble_present: false,
            start_time,
        }
    }

    pub fn end_of_map(start_time: u16) -> Self {
        Self::new(Cid::BROADCAST, diuc::END_OF_MAP, start_time)
    }

    pub fn is_end_of_map(&self) -> bool {
        self.diuc == diuc::END_OF_MAP
    }
}

impl WireFormat for DlMapIe {
    fn serialized_size(&self) -> usize {
        DL_MAP_IE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.cid.identifier());
        buf.put_u16(
            ((self.diuc as u16 & 0x0F) << 12)
                | ((self.preamble_present as u16) << 11)
                | (self.start_time & 0x07FF),
        );
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, DL_MAP_IE_SIZE, "DL-MAP IE")?;
        let cid = Cid::new(buf.get_u16());
        let word = buf.get_u16();
        Ok(Self {
            cid,
            diuc: (word >> 12) as u8,
            preamble_present: word & 0x0800 != 0,
            start_time: word & 0x07FF,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DlMap {
    pub dcd_count: u8,
    pub base_station_id: MacAddress,
    pub ies: Vec<DlMapIe>,
}

impl WireFormat for DlMap {
    fn serialized_size(&self) -> usize {
        1 + 6 + self.ies.len() * DL_MAP_IE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.dcd_count);
        put_mac(buf, &self.base_station_id);
        for ie in &self.ies {
            ie.serialize(buf);
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 7, "DL-MAP")?;
        let dcd_count = buf.get_u8();
        let base_station_id = get_mac(buf);
        let mut ies = Vec::new();
        loop {
            let ie = DlMapIe::deserialize(buf)?;
            ies.push(ie);
            if ie.is_end_of_map() {
                break;
            }
        }
        Ok(Self {
            dcd_count,
            base_station_id,
            ies,
        })
    }
}

/// Uplink allocation: `CID | start(11) subchannel(5) | UIUC(4) duration(10) midamble(2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UlMapIe {
    pub cid: Cid,
    pub start_time: u16,
    pub subchannel_index: u8,
    pub uiuc: u8,
    /// Allocation length in OFDM symbols.
    pub duration: u16,
    pub midamble_repetition_interval: u8,
}

impl UlMapIe {
    pub fn new(cid: Cid, uiuc: u8, start_time: u16, duration: u16) -> Self {
        Self {
            cid,
            start_time,
            subchannel_index: 0,
            uiuc,
            duration,
            midamble_repetition_interval: 0,
        }
    }

    pub fn end_of_map(start_time: u16) -> Self {
        Self::new(Cid::BROADCAST, uiuc::END_OF_MAP, start_time, 0)
    }

    pub fn is_end_of_map(&self) -> bool {
        self.uiuc == uiuc::END_OF_MAP
    }
}

impl WireFormat for UlMapIe {
    fn serialized_size(&self) -> usize {
        UL_MAP_IE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.cid.identifier());
        buf.put_u16(((self.start_time & 0x07FF) << 5) | (self.subchannel_index as u16 & 0x1F));
        buf.put_u16(
            ((self.uiuc as u16 & 0x0F) << 12)
                | ((self.duration & 0x03FF) << 2)
                | (self.midamble_repetition_interval as u16 & 0x03),
        );
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, UL_MAP_IE_SIZE, "UL-MAP IE")?;
        let cid = Cid::new(buf.get_u16());
        let placement = buf.get_u16();
        let usage = buf.get_u16();
        Ok(Self {
            cid,
            start_time: placement >> 5,
            subchannel_index: (placement & 0x1F) as u8,
            uiuc: (usage >> 12) as u8,
            duration: (usage >> 2) & 0x03FF,
            midamble_repetition_interval: (usage & 0x03) as u8,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UlMap {
    pub ucd_count: u8,
    /// Symbol offset of the uplink subframe from the start of the frame.
    pub allocation_start_time: u32,
    pub ies: Vec<UlMapIe>,
}

impl WireFormat for UlMap {
    fn serialized_size(&self) -> usize {
        1 + 1 + 4 + self.ies.len() * UL_MAP_IE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u8(self.ucd_count);
        buf.put_u32(self.allocation_start_time);
        for ie in &self.ies {
            ie.serialize(buf);
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 6, "UL-MAP")?;
        let _reserved = buf.get_u8();
        let ucd_count = buf.get_u8();
        let allocation_start_time = buf.get_u32();
        let mut ies = Vec::new();
        loop {
            let ie = UlMapIe::deserialize(buf)?;
            ies.push(ie);
            if ie.is_end_of_map() {
                break;
            }
        }
        Ok(Self {
            ucd_count,
            allocation_start_time,
            ies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dl_map_ie_bit_layout() {
        let mut ie = DlMapIe::new(Cid::new(0x0401), 4, 0x123);
        ie.preamble_present = true;
        assert_eq!(ie.to_bytes().as_ref(), &[0x04, 0x01, 0x49, 0x23]);
        assert_eq!(DlMapIe::decode_from(&ie.to_bytes()).unwrap().0, ie);
    }

    #[test]
    fn test_ul_map_ie_bit_layout() {
        let ie = UlMapIe {
            cid: Cid::new(2),
            start_time: 0x7FF,
            subchannel_index: 3,
            uiuc: 5,
            duration: 0x3FF,
            midamble_repetition_interval: 1,
        };
        assert_eq!(ie.to_bytes().as_ref(), &[0x00, 0x02, 0xFF, 0xE3, 0x5F, 0xFD]);
        assert_eq!(UlMapIe::decode_from(&ie.to_bytes()).unwrap().0, ie);
    }

    #[test]
    fn test_map_stops_at_end_of_map() {
        let map = UlMap {
            ucd_count: 4,
            allocation_start_time: 40,
            ies: vec![
                UlMapIe::new(Cid::INITIAL_RANGING, uiuc::INITIAL_RANGING, 0, 8),
                UlMapIe::new(Cid::new(1), 6, 8, 10),
                UlMapIe::end_of_map(18),
            ],
        };
        let mut bytes = BytesMut::new();
        map.serialize(&mut bytes);
        // trailing bytes after the end-of-map IE belong to the next PDU
        bytes.put_slice(&[0xAA, 0xBB]);
        let (decoded, consumed) = UlMap::decode_from(&bytes).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(consumed, map.serialized_size());
    }

    #[test]
    fn test_map_without_end_of_map_is_truncated() {
        let map = DlMap {
            dcd_count: 0,
            base_station_id: MacAddress::from_index(0),
            ies: vec![DlMapIe::new(Cid::new(1), 1, 0)],
        };
        assert!(matches!(
            DlMap::decode_from(&map.to_bytes()),
            Err(CodecError::Truncated { .. })
        ));
    }
}

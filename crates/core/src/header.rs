//! MAC headers, subheaders and the PDU framing built from them.
//!
//! ```text
//! generic:   HT=0 EC Type(6) | ESF CI EKS(2) rsv LEN[10:8] | LEN[7:0] | CID(16) | HCS
//! bw request: HT=1 EC=0 Type(3) BR[18:16] | BR[15:8] | BR[7:0] | CID(16) | HCS
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cid::Cid;
use crate::wire::{crc8, ensure, WireFormat};
use crate::CodecError;

pub const GENERIC_MAC_HEADER_SIZE: usize = 6;
pub const BANDWIDTH_REQUEST_HEADER_SIZE: usize = 6;
pub const GRANT_MANAGEMENT_SUBHEADER_SIZE: usize = 2;
pub const FRAGMENTATION_SUBHEADER_SIZE: usize = 1;
/// Largest PDU the 11-bit LEN field can describe.
pub const MAX_PDU_LENGTH: usize = 0x7FF;
/// Largest request the 19-bit BR field can carry.
pub const MAX_BANDWIDTH_REQUEST: u32 = 0x7_FFFF;

/// Subheader presence bits in the generic header Type field.
pub mod type_bits {
    pub const GRANT_MANAGEMENT: u8 = 0x01;
    pub const FRAGMENTATION: u8 = 0x04;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MacHeaderType {
    Generic,
    Bandwidth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenericMacHeader {
    pub ec: bool,
    pub type_bits: u8,
    pub esf: bool,
    pub ci: bool,
    pub eks: u8,
    /// Total PDU length: header, subheaders and payload.
    pub len: u16,
    pub cid: Cid,
}

impl GenericMacHeader {
    pub fn new(cid: Cid) -> Self {
        Self {
            ec: false,
            type_bits: 0,
            esf: false,
            ci: false,
            eks: 0,
            len: GENERIC_MAC_HEADER_SIZE as u16,
            cid,
        }
    }

    pub fn has_fragmentation_subheader(&self) -> bool {
        self.type_bits & type_bits::FRAGMENTATION != 0
    }

    pub fn has_grant_management_subheader(&self) -> bool {
        self.type_bits & type_bits::GRANT_MANAGEMENT != 0
    }

    fn header_bytes(&self) -> [u8; 5] {
        let len = self.len & MAX_PDU_LENGTH as u16;
        let cid = self.cid.identifier();
        [
            ((self.ec as u8) << 6) | (self.type_bits & 0x3F),
            ((self.esf as u8) << 7)
                | ((self.ci as u8) << 6)
                | ((self.eks & 0x03) << 4)
                | ((len >> 8) as u8 & 0x07),
            len as u8,
            (cid >> 8) as u8,
            cid as u8,
        ]
    }
}

impl WireFormat for GenericMacHeader {
    fn serialized_size(&self) -> usize {
        GENERIC_MAC_HEADER_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        let bytes = self.header_bytes();
        buf.put_slice(&bytes);
        buf.put_u8(crc8(&bytes));
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, GENERIC_MAC_HEADER_SIZE, "generic MAC header")?;
        let mut raw = [0u8; GENERIC_MAC_HEADER_SIZE];
        buf.copy_to_slice(&mut raw);
        check_hcs(&raw)?;
        if raw[0] & 0x80 != 0 {
            return Err(CodecError::InvalidField {
                field: "generic header HT",
                value: 1,
            });
        }
        Ok(Self {
            ec: raw[0] & 0x40 != 0,
            type_bits: raw[0] & 0x3F,
            esf: raw[1] & 0x80 != 0,
            ci: raw[1] & 0x40 != 0,
            eks: (raw[1] >> 4) & 0x03,
            len: (((raw[1] & 0x07) as u16) << 8) | raw[2] as u16,
            cid: Cid::new(u16::from_be_bytes([raw[3], raw[4]])),
        })
    }
}

fn check_hcs(raw: &[u8; 6]) -> Result<(), CodecError> {
    let computed = crc8(&raw[..5]);
    if computed != raw[5] {
        return Err(CodecError::HeaderChecksum {
            computed,
            received: raw[5],
        });
    }
    Ok(())
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandwidthRequestType {
    Incremental = 0,
    Aggregate = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandwidthRequestHeader {
    pub request_type: BandwidthRequestType,
    /// Requested bytes, including MAC overhead.
    pub br: u32,
    pub cid: Cid,
}

impl BandwidthRequestHeader {
    pub fn aggregate(cid: Cid, br: u32) -> Self {
        Self {
            request_type: BandwidthRequestType::Aggregate,
            br: br.min(MAX_BANDWIDTH_REQUEST),
            cid,
        }
    }

    pub fn incremental(cid: Cid, br: u32) -> Self {
        Self {
            request_type: BandwidthRequestType::Incremental,
            br: br.min(MAX_BANDWIDTH_REQUEST),
            cid,
        }
    }
}

impl WireFormat for BandwidthRequestHeader {
    fn serialized_size(&self) -> usize {
        BANDWIDTH_REQUEST_HEADER_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        let br = self.br & MAX_BANDWIDTH_REQUEST;
        let cid = self.cid.identifier();
        let bytes = [
            0x80 | ((self.request_type as u8 & 0x07) << 3) | ((br >> 16) as u8 & 0x07),
            (br >> 8) as u8,
            br as u8,
            (cid >> 8) as u8,
            cid as u8,
        ];
        buf.put_slice(&bytes);
        buf.put_u8(crc8(&bytes));
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, BANDWIDTH_REQUEST_HEADER_SIZE, "bandwidth request header")?;
        let mut raw = [0u8; BANDWIDTH_REQUEST_HEADER_SIZE];
        buf.copy_to_slice(&mut raw);
        check_hcs(&raw)?;
        if raw[0] & 0x80 == 0 {
            return Err(CodecError::InvalidField {
                field: "bandwidth header HT",
                value: 0,
            });
        }
        let request_type = match (raw[0] >> 3) & 0x07 {
            0 => BandwidthRequestType::Incremental,
            1 => BandwidthRequestType::Aggregate,
            other => {
                return Err(CodecError::InvalidField {
                    field: "bandwidth request type",
                    value: other as u32,
                })
            }
        };
        Ok(Self {
            request_type,
            br: (((raw[0] & 0x07) as u32) << 16) | ((raw[1] as u32) << 8) | raw[2] as u32,
            cid: Cid::new(u16::from_be_bytes([raw[3], raw[4]])),
        })
    }
}

/// Uplink grant-management subheader: slip indicator, poll-me bit and piggy-back request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GrantManagementSubheader {
    pub slip_indicator: bool,
    pub poll_me: bool,
    pub piggyback_request: u16,
}

impl WireFormat for GrantManagementSubheader {
    fn serialized_size(&self) -> usize {
        GRANT_MANAGEMENT_SUBHEADER_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        let word = ((self.slip_indicator as u16) << 15)
            | ((self.poll_me as u16) << 14)
            | (self.piggyback_request & 0x3FFF);
        buf.put_u16(word);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, GRANT_MANAGEMENT_SUBHEADER_SIZE, "grant management subheader")?;
        let word = buf.get_u16();
        Ok(Self {
            slip_indicator: word & 0x8000 != 0,
            poll_me: word & 0x4000 != 0,
            piggyback_request: word & 0x3FFF,
        })
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentControl {
    Unfragmented = 0,
    Last = 1,
    First = 2,
    Middle = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentationSubheader {
    pub fc: FragmentControl,
    /// Fragment sequence number, three bits on the wire.
    pub fsn: u8,
}

impl FragmentationSubheader {
    pub fn new(fc: FragmentControl, fragment_number: u32) -> Self {
        Self {
            fc,
            fsn: (fragment_number & 0x07) as u8,
        }
    }
}

impl WireFormat for FragmentationSubheader {
    fn serialized_size(&self) -> usize {
        FRAGMENTATION_SUBHEADER_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(((self.fc as u8) << 6) | ((self.fsn & 0x07) << 3));
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, FRAGMENTATION_SUBHEADER_SIZE, "fragmentation subheader")?;
        let byte = buf.get_u8();
        let fc = match byte >> 6 {
            0 => FragmentControl::Unfragmented,
            1 => FragmentControl::Last,
            2 => FragmentControl::First,
            _ => FragmentControl::Middle,
        };
        Ok(Self {
            fc,
            fsn: (byte >> 3) & 0x07,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacHeader {
    Generic(GenericMacHeader),
    BandwidthRequest(BandwidthRequestHeader),
}

impl MacHeader {
    pub fn header_type(&self) -> MacHeaderType {
        match self {
            MacHeader::Generic(_) => MacHeaderType::Generic,
            MacHeader::BandwidthRequest(_) => MacHeaderType::Bandwidth,
        }
    }

    pub fn cid(&self) -> Cid {
        match self {
            MacHeader::Generic(h) => h.cid,
            MacHeader::BandwidthRequest(h) => h.cid,
        }
    }
}

/// One MAC protocol data unit as carried inside a burst.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacPdu {
    header: MacHeader,
    grant_management: Option<GrantManagementSubheader>,
    fragmentation: Option<FragmentationSubheader>,
    payload: Bytes,
}

impl MacPdu {
    /// Builds a generic PDU, fixing up the LEN field and subheader type bits.
    pub fn from_parts(
        mut header: GenericMacHeader,
        grant_management: Option<GrantManagementSubheader>,
        fragmentation: Option<FragmentationSubheader>,
        payload: Bytes,
    ) -> Self {
        header.type_bits &= !(type_bits::FRAGMENTATION | type_bits::GRANT_MANAGEMENT);
        let mut len = GENERIC_MAC_HEADER_SIZE + payload.len();
        if grant_management.is_some() {
            header.type_bits |= type_bits::GRANT_MANAGEMENT;
            len += GRANT_MANAGEMENT_SUBHEADER_SIZE;
        }
        if fragmentation.is_some() {
            header.type_bits |= type_bits::FRAGMENTATION;
            len += FRAGMENTATION_SUBHEADER_SIZE;
        }
        debug_assert!(len <= MAX_PDU_LENGTH, "PDU of {} bytes overflows LEN", len);
        header.len = len.min(MAX_PDU_LENGTH) as u16;
        Self {
            header: MacHeader::Generic(header),
            grant_management,
            fragmentation,
            payload,
        }
    }

    pub fn generic(cid: Cid, payload: Bytes) -> Self {
        Self::from_parts(GenericMacHeader::new(cid), None, None, payload)
    }

    pub fn bandwidth_request(header: BandwidthRequestHeader) -> Self {
        Self {
            header: MacHeader::BandwidthRequest(header),
            grant_management: None,
            fragmentation: None,
            payload: Bytes::new(),
        }
    }

    pub fn with_grant_management(self, subheader: GrantManagementSubheader) -> Self {
        match self.header {
            MacHeader::Generic(h) => {
                Self::from_parts(h, Some(subheader), self.fragmentation, self.payload)
            }
            MacHeader::BandwidthRequest(_) => self,
        }
    }

    pub fn header(&self) -> &MacHeader {
        &self.header
    }

    pub fn cid(&self) -> Cid {
        self.header.cid()
    }

    pub fn grant_management(&self) -> Option<&GrantManagementSubheader> {
        self.grant_management.as_ref()
    }

    pub fn fragmentation(&self) -> Option<&FragmentationSubheader> {
        self.fragmentation.as_ref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decodes back-to-back PDUs. PDUs preceding a corrupt one are kept and the error is returned alongside.
    pub fn decode_burst(data: &[u8]) -> (Vec<MacPdu>, Option<CodecError>) {
        let mut cursor = data;
        let mut pdus = Vec::new();
        while !cursor.is_empty() {
            match MacPdu::deserialize(&mut cursor) {
                Ok(pdu) => pdus.push(pdu),
                Err(e) => return (pdus, Some(e)),
            }
        }
        (pdus, None)
    }
}

impl WireFormat for MacPdu {
    fn serialized_size(&self) -> usize {
        match &self.header {
            MacHeader::BandwidthRequest(_) => BANDWIDTH_REQUEST_HEADER_SIZE,
            MacHeader::Generic(_) => {
                GENERIC_MAC_HEADER_SIZE
                    + self
                        .grant_management
                        .map_or(0, |_| GRANT_MANAGEMENT_SUBHEADER_SIZE)
                    + self
                        .fragmentation
                        .map_or(0, |_| FRAGMENTATION_SUBHEADER_SIZE)
                    + self.payload.len()
            }
        }
    }

    fn serialize(&self, buf: &mut BytesMut) {
        match &self.header {
            MacHeader::BandwidthRequest(h) => h.serialize(buf),
            MacHeader::Generic(h) => {
                h.serialize(buf);
                if let Some(gm) = &self.grant_management {
                    gm.serialize(buf);
                }
                if let Some(frag) = &self.fragmentation {
                    frag.serialize(buf);
                }
                buf.put_slice(&self.payload);
            }
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 1, "MAC PDU")?;
        if buf[0] & 0x80 != 0 {
            let header = BandwidthRequestHeader::deserialize(buf)?;
            return Ok(Self::bandwidth_request(header));
        }

        let header = GenericMacHeader::deserialize(buf)?;
        let total = header.len as usize;
        let mut overhead = GENERIC_MAC_HEADER_SIZE;
        if header.has_grant_management_subheader() {
            overhead += GRANT_MANAGEMENT_SUBHEADER_SIZE;
        }
        if header.has_fragmentation_subheader() {
            overhead += FRAGMENTATION_SUBHEADER_SIZE;
        }
        if total < overhead {
            return Err(CodecError::PduLength(header.len));
        }
        ensure(buf, total - GENERIC_MAC_HEADER_SIZE, "MAC PDU body")?;

        let grant_management = if header.has_grant_management_subheader() {
            Some(GrantManagementSubheader::deserialize(buf)?)
        } else {
            None
        };
        let fragmentation = if header.has_fragmentation_subheader() {
            Some(FragmentationSubheader::deserialize(buf)?)
        } else {
            None
        };
        let payload_len = total - overhead;
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);

        Ok(Self {
            header: MacHeader::Generic(header),
            grant_management,
            fragmentation,
            payload,
        })
    }
}

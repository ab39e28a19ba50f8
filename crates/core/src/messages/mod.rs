//! MAC management messages. Each one travels as the payload of a generic MAC
//! PDU, prefixed by a single management message type byte.

use bytes::{Buf, BufMut, BytesMut};

use crate::types::{MacAddress, MAC_ADDRESS_LEN};
use crate::wire::{ensure, WireFormat};
use crate::CodecError;

pub mod descriptor;
pub mod dsa;
pub mod map;
pub mod ranging;

pub use descriptor::{Dcd, DcdChannelEncodings, DlBurstProfile, Ucd, UcdChannelEncodings, UlBurstProfile};
pub use dsa::{ConfirmationCode, DsaAck, DsaReq, DsaRsp};
pub use map::{DlMap, DlMapIe, UlMap, UlMapIe, DL_MAP_IE_SIZE};
pub use ranging::{RangingStatus, RngReq, RngRsp};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagementMessageType {
    Ucd = 0,
    Dcd = 1,
    DlMap = 2,
    UlMap = 3,
    RngReq = 4,
    RngRsp = 5,
    DsaReq = 11,
    DsaRsp = 12,
    DsaAck = 13,
}

impl TryFrom<u8> for ManagementMessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ucd,
            1 => Self::Dcd,
            2 => Self::DlMap,
            3 => Self::UlMap,
            4 => Self::RngReq,
            5 => Self::RngRsp,
            11 => Self::DsaReq,
            12 => Self::DsaRsp,
            13 => Self::DsaAck,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagementMessage {
    Ucd(Ucd),
    Dcd(Dcd),
    DlMap(DlMap),
    UlMap(UlMap),
    RngReq(RngReq),
    RngRsp(RngRsp),
    DsaReq(DsaReq),
    DsaRsp(DsaRsp),
    DsaAck(DsaAck),
}

impl ManagementMessage {
    pub fn message_type(&self) -> ManagementMessageType {
        match self {
            ManagementMessage::Ucd(_) => ManagementMessageType::Ucd,
            ManagementMessage::Dcd(_) => ManagementMessageType::Dcd,
            ManagementMessage::DlMap(_) => ManagementMessageType::DlMap,
            ManagementMessage::UlMap(_) => ManagementMessageType::UlMap,
            ManagementMessage::RngReq(_) => ManagementMessageType::RngReq,
            ManagementMessage::RngRsp(_) => ManagementMessageType::RngRsp,
            ManagementMessage::DsaReq(_) => ManagementMessageType::DsaReq,
            ManagementMessage::DsaRsp(_) => ManagementMessageType::DsaRsp,
            ManagementMessage::DsaAck(_) => ManagementMessageType::DsaAck,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            ManagementMessage::Ucd(m) => m.serialized_size(),
            ManagementMessage::Dcd(m) => m.serialized_size(),
            ManagementMessage::DlMap(m) => m.serialized_size(),
            ManagementMessage::UlMap(m) => m.serialized_size(),
            ManagementMessage::RngReq(m) => m.serialized_size(),
            ManagementMessage::RngRsp(m) => m.serialized_size(),
            ManagementMessage::DsaReq(m) => m.serialized_size(),
            ManagementMessage::DsaRsp(m) => m.serialized_size(),
            ManagementMessage::DsaAck(m) => m.serialized_size(),
        }
    }
}

impl WireFormat for ManagementMessage {
    fn serialized_size(&self) -> usize {
        1 + self.body_size()
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type() as u8);
        match self {
            ManagementMessage::Ucd(m) => m.serialize(buf),
            ManagementMessage::Dcd(m) => m.serialize(buf),
            ManagementMessage::DlMap(m) => m.serialize(buf),
            ManagementMessage::UlMap(m) => m.serialize(buf),
            ManagementMessage::RngReq(m) => m.serialize(buf),
            ManagementMessage::RngRsp(m) => m.serialize(buf),
            ManagementMessage::DsaReq(m) => m.serialize(buf),
            ManagementMessage::DsaRsp(m) => m.serialize(buf),
            ManagementMessage::DsaAck(m) => m.serialize(buf),
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 1, "management message type")?;
        let message = match ManagementMessageType::try_from(buf.get_u8())? {
            ManagementMessageType::Ucd => ManagementMessage::Ucd(Ucd::deserialize(buf)?),
            ManagementMessageType::Dcd => ManagementMessage::Dcd(Dcd::deserialize(buf)?),
            ManagementMessageType::DlMap => ManagementMessage::DlMap(DlMap::deserialize(buf)?),
            ManagementMessageType::UlMap => ManagementMessage::UlMap(UlMap::deserialize(buf)?),
            ManagementMessageType::RngReq => ManagementMessage::RngReq(RngReq::deserialize(buf)?),
            ManagementMessageType::RngRsp => ManagementMessage::RngRsp(RngRsp::deserialize(buf)?),
            ManagementMessageType::DsaReq => ManagementMessage::DsaReq(DsaReq::deserialize(buf)?),
            ManagementMessageType::DsaRsp => ManagementMessage::DsaRsp(DsaRsp::deserialize(buf)?),
            ManagementMessageType::DsaAck => ManagementMessage::DsaAck(DsaAck::deserialize(buf)?),
        };
        Ok(message)
    }
}

pub(crate) fn put_mac(buf: &mut BytesMut, mac: &MacAddress) {
    buf.put_slice(&mac.octets());
}

pub(crate) fn get_mac(buf: &mut &[u8]) -> MacAddress {
    let mut octets = [0u8; MAC_ADDRESS_LEN];
    buf.copy_to_slice(&mut octets);
    MacAddress(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::Cid;
    use crate::tlv::{sf, Tlv, UPLINK_SERVICE_FLOW};

    #[test]
    fn test_type_byte_prefixes_body() {
        let msg = ManagementMessage::DsaAck(DsaAck {
            transaction_id: 0x0102,
            confirmation_code: ConfirmationCode::Success,
        });
        let bytes = msg.to_bytes();
        assert_eq!(bytes.as_ref(), &[13, 0x01, 0x02, 0]);
        assert_eq!(bytes.len(), msg.serialized_size());
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        assert_eq!(
            ManagementMessage::decode_from(&[42, 0, 0]),
            Err(CodecError::UnknownMessageType(42))
        );
        assert!(matches!(
            ManagementMessage::decode_from(&[]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_every_message_round_trips() {
        let flow = Tlv::vector(
            UPLINK_SERVICE_FLOW,
            vec![Tlv::u32(sf::SFID, 7), Tlv::u8(sf::SCHEDULING_TYPE, 4)],
        );
        let messages = vec![
            ManagementMessage::Ucd(Ucd::default()),
            ManagementMessage::Dcd(Dcd::default()),
            ManagementMessage::DlMap(DlMap {
                dcd_count: 3,
                base_station_id: MacAddress::from_index(9),
                ies: vec![
                    DlMapIe::new(Cid::BROADCAST, 1, 0),
                    DlMapIe::end_of_map(12),
                ],
            }),
            ManagementMessage::UlMap(UlMap {
                ucd_count: 1,
                allocation_start_time: 0,
                ies: vec![UlMapIe::new(Cid::new(3), 7, 0, 20), UlMapIe::end_of_map(20)],
            }),
            ManagementMessage::RngReq(RngReq::new(MacAddress::from_index(1), 1)),
            ManagementMessage::RngRsp(RngRsp::default()),
            ManagementMessage::DsaReq(DsaReq {
                transaction_id: 1,
                service_flow: flow.clone(),
            }),
            ManagementMessage::DsaRsp(DsaRsp {
                transaction_id: 1,
                confirmation_code: ConfirmationCode::RejectTemporary,
                service_flow: flow,
            }),
        ];
        for msg in messages {
            let bytes = msg.to_bytes();
            assert_eq!(bytes.len(), msg.serialized_size(), "{:?}", msg.message_type());
            let (decoded, consumed) = ManagementMessage::decode_from(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, msg);
        }
    }
}

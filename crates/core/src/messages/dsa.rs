//! Dynamic service addition handshake.

use bytes::{Buf, BufMut, BytesMut};

use crate::tlv::Tlv;
use crate::types::TransactionId;
use crate::wire::{ensure, WireFormat};
use crate::CodecError;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfirmationCode {
    Success = 0,
    RejectOther = 1,
    RejectUnrecognizedConfiguration = 2,
    RejectTemporary = 3,
    RejectPermanent = 4,
    RejectNotOwner = 5,
    RejectServiceFlowNotFound = 6,
    RejectServiceFlowExists = 7,
    RejectRequiredParameterNotPresent = 8,
}

impl ConfirmationCode {
    pub fn is_success(self) -> bool {
        self == ConfirmationCode::Success
    }
}

impl TryFrom<u8> for ConfirmationCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Success,
            1 => Self::RejectOther,
            2 => Self::RejectUnrecognizedConfiguration,
            3 => Self::RejectTemporary,
            4 => Self::RejectPermanent,
            5 => Self::RejectNotOwner,
            6 => Self::RejectServiceFlowNotFound,
            7 => Self::RejectServiceFlowExists,
            8 => Self::RejectRequiredParameterNotPresent,
            other => {
                return Err(CodecError::InvalidField {
                    field: "confirmation code",
                    value: other as u32,
                })
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DsaReq {
    pub transaction_id: TransactionId,
    /// Uplink or downlink service flow encoding.
    pub service_flow: Tlv,
}

impl WireFormat for DsaReq {
    fn serialized_size(&self) -> usize {
        2 + self.service_flow.serialized_size()
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        self.service_flow.serialize(buf);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 2, "DSA-REQ")?;
        let transaction_id = buf.get_u16();
        Ok(Self {
            transaction_id,
            service_flow: Tlv::deserialize(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DsaRsp {
    pub transaction_id: TransactionId,
    pub confirmation_code: ConfirmationCode,
    pub service_flow: Tlv,
}

impl WireFormat for DsaRsp {
    fn serialized_size(&self) -> usize {
        3 + self.service_flow.serialized_size()
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u8(self.confirmation_code as u8);
        self.service_flow.serialize(buf);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 3, "DSA-RSP")?;
        let transaction_id = buf.get_u16();
        let confirmation_code = ConfirmationCode::try_from(buf.get_u8())?;
        Ok(Self {
            transaction_id,
            confirmation_code,
            service_flow: Tlv::deserialize(buf)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DsaAck {
    pub transaction_id: TransactionId,
    pub confirmation_code: ConfirmationCode,
}

impl WireFormat for DsaAck {
    fn serialized_size(&self) -> usize {
        3
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u8(self.confirmation_code as u8);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 3, "DSA-ACK")?;
        Ok(Self {
            transaction_id: buf.get_u16(),
            confirmation_code: ConfirmationCode::try_from(buf.get_u8())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::{sf, DOWNLINK_SERVICE_FLOW};

    #[test]
    fn test_dsa_req_carries_service_flow_tlv() {
        let req = DsaReq {
            transaction_id: 0x0A0B,
            service_flow: Tlv::vector(DOWNLINK_SERVICE_FLOW, vec![Tlv::u8(sf::SCHEDULING_TYPE, 4)]),
        };
        let bytes = req.to_bytes();
        assert_eq!(&bytes[..5], &[0x0A, 0x0B, DOWNLINK_SERVICE_FLOW, 3, sf::SCHEDULING_TYPE]);
        assert_eq!(DsaReq::decode_from(&bytes).unwrap().0, req);
    }

    #[test]
    fn test_dsa_rsp_with_truncated_tlv_fails() {
        let rsp = DsaRsp {
            transaction_id: 1,
            confirmation_code: ConfirmationCode::Success,
            service_flow: Tlv::vector(DOWNLINK_SERVICE_FLOW, vec![Tlv::u32(sf::SFID, 99)]),
        };
        let bytes = rsp.to_bytes();
        assert!(DsaRsp::decode_from(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_unknown_confirmation_code() {
        assert!(DsaAck::decode_from(&[0, 1, 200]).is_err());
    }
}

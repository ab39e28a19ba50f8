use bytes::{Buf, BufMut, BytesMut};

use super::{get_mac, put_mac};
use crate::cid::Cid;
use crate::types::{MacAddress, Modulation};
use crate::wire::{ensure, WireFormat};
use crate::CodecError;

const RNG_REQ_SIZE: usize = 8;
const RNG_RSP_SIZE: usize = 35;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RangingStatus {
    #[default]
    Expired = 0,
    Continue = 1,
    Abort = 2,
    Success = 3,
}

impl TryFrom<u8> for RangingStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RangingStatus::Expired),
            1 => Ok(RangingStatus::Continue),
            2 => Ok(RangingStatus::Abort),
            3 => Ok(RangingStatus::Success),
            _ => Err(CodecError::InvalidField {
                field: "ranging status",
                value: value as u32,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RngReq {
    /// DIUC of the downlink profile the station would like to receive.
    pub requested_dl_burst_profile: u8,
    pub mac_address: MacAddress,
    pub ranging_anomalies: u8,
}

impl RngReq {
    pub fn new(mac_address: MacAddress, requested_dl_burst_profile: u8) -> Self {
        Self {
            requested_dl_burst_profile,
            mac_address,
            ranging_anomalies: 0,
        }
    }

    pub fn requested_modulation(&self) -> Option<Modulation> {
        Modulation::from_diuc(self.requested_dl_burst_profile)
    }
}

impl WireFormat for RngReq {
    fn serialized_size(&self) -> usize {
        RNG_REQ_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.requested_dl_burst_profile);
        put_mac(buf, &self.mac_address);
        buf.put_u8(self.ranging_anomalies);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, RNG_REQ_SIZE, "RNG-REQ")?;
        Ok(Self {
            requested_dl_burst_profile: buf.get_u8(),
            mac_address: get_mac(buf),
            ranging_anomalies: buf.get_u8(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RngRsp {
    pub timing_adjust: u32,
    pub power_level_adjust: u8,
    pub offset_frequency_adjust: u32,
    pub ranging_status: RangingStatus,
    pub dl_frequency_override: u32,
    pub ul_channel_id_override: u8,
    pub dl_operational_burst_profile: u16,
    pub mac_address: MacAddress,
    /// Zero unless the response completes initial ranging.
    pub basic_cid: Cid,
    pub primary_cid: Cid,
    pub aas_broadcast_permission: u8,
    pub frame_number: u32,
    pub initial_ranging_opportunity_number: u8,
    pub ranging_subchannel: u8,
}

impl WireFormat for RngRsp {
    fn serialized_size(&self) -> usize {
        RNG_RSP_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u32(self.timing_adjust);
        buf.put_u8(self.power_level_adjust);
        buf.put_u32(self.offset_frequency_adjust);
        buf.put_u8(self.ranging_status as u8);
        buf.put_u32(self.dl_frequency_override);
        buf.put_u8(self.ul_channel_id_override);
        buf.put_u16(self.dl_operational_burst_profile);
        put_mac(buf, &self.mac_address);
        buf.put_u16(self.basic_cid.identifier());
        buf.put_u16(self.primary_cid.identifier());
        buf.put_u8(self.aas_broadcast_permission);
        buf.put_u32(self.frame_number);
        buf.put_u8(self.initial_ranging_opportunity_number);
        buf.put_u8(self.ranging_subchannel);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, RNG_RSP_SIZE, "RNG-RSP")?;
        let _reserved = buf.get_u8();
        let timing_adjust = buf.get_u32();
        let power_level_adjust = buf.get_u8();
        let offset_frequency_adjust = buf.get_u32();
        let ranging_status = RangingStatus::try_from(buf.get_u8())?;
        Ok(Self {
            timing_adjust,
            power_level_adjust,
            offset_frequency_adjust,
            ranging_status,
            dl_frequency_override: buf.get_u32(),
            ul_channel_id_override: buf.get_u8(),
            dl_operational_burst_profile: buf.get_u16(),
            mac_address: get_mac(buf),
            basic_cid: Cid::new(buf.get_u16()),
            primary_cid: Cid::new(buf.get_u16()),
            aas_broadcast_permission: buf.get_u8(),
            frame_number: buf.get_u32(),
            initial_ranging_opportunity_number: buf.get_u8(),
            ranging_subchannel: buf.get_u8(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_req_layout() {
        let req = RngReq::new(MacAddress([1, 2, 3, 4, 5, 6]), Modulation::Qpsk12.diuc());
        assert_eq!(req.to_bytes().as_ref(), &[2, 1, 2, 3, 4, 5, 6, 0]);
        assert_eq!(req.requested_modulation(), Some(Modulation::Qpsk12));
    }

    #[test]
    fn test_rng_rsp_round_trip() {
        let rsp = RngRsp {
            timing_adjust: 0xDEAD_BEEF,
            ranging_status: RangingStatus::Success,
            dl_operational_burst_profile: 3,
            mac_address: MacAddress::from_index(12),
            basic_cid: Cid::new(5),
            primary_cid: Cid::new(0x0405),
            frame_number: 1000,
            ..Default::default()
        };
        let bytes = rsp.to_bytes();
        assert_eq!(bytes.len(), 35);
        assert_eq!(bytes[10], RangingStatus::Success as u8);
        assert_eq!(RngRsp::decode_from(&bytes).unwrap().0, rsp);
    }

    #[test]
    fn test_rng_rsp_rejects_unknown_status() {
        let mut bytes = RngRsp::default().to_bytes().to_vec();
        bytes[10] = 9;
        assert!(matches!(
            RngRsp::decode_from(&bytes),
            Err(CodecError::InvalidField { .. })
        ));
    }
}

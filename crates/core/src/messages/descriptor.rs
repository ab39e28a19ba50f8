//! Downlink and uplink channel descriptors, broadcast periodically so stations
//! learn the burst profiles in use.

use bytes::{Buf, BufMut, BytesMut};

use super::{get_mac, put_mac};
use crate::types::{MacAddress, Modulation};
use crate::wire::{ensure, WireFormat};
use crate::CodecError;

const DCD_CHANNEL_ENCODINGS_SIZE: usize = 22;
const UCD_CHANNEL_ENCODINGS_SIZE: usize = 10;
const BURST_PROFILE_SIZE: usize = 4;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DcdChannelEncodings {
    pub bs_eirp: u16,
    pub eirx_p_ir_max: u16,
    pub frequency: u32,
    pub channel_nr: u8,
    pub ttg: u8,
    pub rtg: u8,
    pub base_station_id: MacAddress,
    pub frame_duration_code: u8,
    pub frame_number: u32,
}

impl WireFormat for DcdChannelEncodings {
    fn serialized_size(&self) -> usize {
        DCD_CHANNEL_ENCODINGS_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.bs_eirp);
        buf.put_u16(self.eirx_p_ir_max);
        buf.put_u32(self.frequency);
        buf.put_u8(self.channel_nr);
        buf.put_u8(self.ttg);
        buf.put_u8(self.rtg);
        put_mac(buf, &self.base_station_id);
        buf.put_u8(self.frame_duration_code);
        buf.put_u32(self.frame_number);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, DCD_CHANNEL_ENCODINGS_SIZE, "DCD channel encodings")?;
        Ok(Self {
            bs_eirp: buf.get_u16(),
            eirx_p_ir_max: buf.get_u16(),
            frequency: buf.get_u32(),
            channel_nr: buf.get_u8(),
            ttg: buf.get_u8(),
            rtg: buf.get_u8(),
            base_station_id: get_mac(buf),
            frame_duration_code: buf.get_u8(),
            frame_number: buf.get_u32(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DlBurstProfile {
    pub profile_type: u8,
    pub length: u8,
    pub diuc: u8,
    pub fec_code_type: u8,
}

impl DlBurstProfile {
    pub fn for_modulation(modulation: Modulation) -> Self {
        Self {
            profile_type: 1,
            length: 2,
            diuc: modulation.diuc(),
            fec_code_type: modulation as u8,
        }
    }
}

impl WireFormat for DlBurstProfile {
    fn serialized_size(&self) -> usize {
        BURST_PROFILE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.profile_type);
        buf.put_u8(self.length);
        buf.put_u8(self.diuc);
        buf.put_u8(self.fec_code_type);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, BURST_PROFILE_SIZE, "DL burst profile")?;
        Ok(Self {
            profile_type: buf.get_u8(),
            length: buf.get_u8(),
            diuc: buf.get_u8(),
            fec_code_type: buf.get_u8(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dcd {
    pub configuration_change_count: u8,
    pub channel_encodings: DcdChannelEncodings,
    pub burst_profiles: Vec<DlBurstProfile>,
}

impl Dcd {
    /// Descriptor advertising one downlink burst profile per modulation.
    pub fn with_all_profiles(change_count: u8, channel_encodings: DcdChannelEncodings) -> Self {
        Self {
            configuration_change_count: change_count,
            channel_encodings,
            burst_profiles: Modulation::ALL
                .iter()
                .map(|m| DlBurstProfile::for_modulation(*m))
                .collect(),
        }
    }
}

impl WireFormat for Dcd {
    fn serialized_size(&self) -> usize {
        1 + DCD_CHANNEL_ENCODINGS_SIZE + 1 + self.burst_profiles.len() * BURST_PROFILE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.configuration_change_count);
        self.channel_encodings.serialize(buf);
        buf.put_u8(self.burst_profiles.len() as u8);
        for profile in &self.burst_profiles {
            profile.serialize(buf);
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 1, "DCD")?;
        let configuration_change_count = buf.get_u8();
        let channel_encodings = DcdChannelEncodings::deserialize(buf)?;
        ensure(buf, 1, "DCD profile count")?;
        let count = buf.get_u8() as usize;
        let burst_profiles = (0..count)
            .map(|_| DlBurstProfile::deserialize(buf))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            configuration_change_count,
            channel_encodings,
            burst_profiles,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UcdChannelEncodings {
    pub bw_req_opp_size: u16,
    pub ranging_req_opp_size: u16,
    pub frequency: u32,
    pub sb_chnl_req_region_full_params: u8,
    pub sb_chnl_focused_contention_codes: u8,
}

impl WireFormat for UcdChannelEncodings {
    fn serialized_size(&self) -> usize {
        UCD_CHANNEL_ENCODINGS_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u16(self.bw_req_opp_size);
        buf.put_u16(self.ranging_req_opp_size);
        buf.put_u32(self.frequency);
        buf.put_u8(self.sb_chnl_req_region_full_params);
        buf.put_u8(self.sb_chnl_focused_contention_codes);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, UCD_CHANNEL_ENCODINGS_SIZE, "UCD channel encodings")?;
        Ok(Self {
            bw_req_opp_size: buf.get_u16(),
            ranging_req_opp_size: buf.get_u16(),
            frequency: buf.get_u32(),
            sb_chnl_req_region_full_params: buf.get_u8(),
            sb_chnl_focused_contention_codes: buf.get_u8(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UlBurstProfile {
    pub profile_type: u8,
    pub length: u8,
    pub uiuc: u8,
    pub fec_code_type: u8,
}

impl UlBurstProfile {
    pub fn for_modulation(modulation: Modulation) -> Self {
        Self {
            profile_type: 1,
            length: 2,
            uiuc: modulation.uiuc(),
            fec_code_type: modulation as u8,
        }
    }
}

impl WireFormat for UlBurstProfile {
    fn serialized_size(&self) -> usize {
        BURST_PROFILE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.profile_type);
        buf.put_u8(self.length);
        buf.put_u8(self.uiuc);
        buf.put_u8(self.fec_code_type);
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, BURST_PROFILE_SIZE, "UL burst profile")?;
        Ok(Self {
            profile_type: buf.get_u8(),
            length: buf.get_u8(),
            uiuc: buf.get_u8(),
            fec_code_type: buf.get_u8(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ucd {
    pub configuration_change_count: u8,
    pub ranging_backoff_start: u8,
    pub ranging_backoff_end: u8,
    pub request_backoff_start: u8,
    pub request_backoff_end: u8,
    pub channel_encodings: UcdChannelEncodings,
    pub burst_profiles: Vec<UlBurstProfile>,
}

impl Ucd {
    pub fn with_all_profiles(change_count: u8, channel_encodings: UcdChannelEncodings) -> Self {
        Self {
            configuration_change_count: change_count,
            ranging_backoff_start: 3,
            ranging_backoff_end: 6,
            request_backoff_start: 3,
            request_backoff_end: 6,
            channel_encodings,
            burst_profiles: Modulation::ALL
                .iter()
                .map(|m| UlBurstProfile::for_modulation(*m))
                .collect(),
        }
    }
}

impl WireFormat for Ucd {
    fn serialized_size(&self) -> usize {
        5 + UCD_CHANNEL_ENCODINGS_SIZE + 1 + self.burst_profiles.len() * BURST_PROFILE_SIZE
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.configuration_change_count);
        buf.put_u8(self.ranging_backoff_start);
        buf.put_u8(self.ranging_backoff_end);
        buf.put_u8(self.request_backoff_start);
        buf.put_u8(self.request_backoff_end);
        self.channel_encodings.serialize(buf);
        buf.put_u8(self.burst_profiles.len() as u8);
        for profile in &self.burst_profiles {
            profile.serialize(buf);
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        ensure(buf, 5, "UCD")?;
        let configuration_change_count = buf.get_u8();
        let ranging_backoff_start = buf.get_u8();
        let ranging_backoff_end = buf.get_u8();
        let request_backoff_start = buf.get_u8();
        let request_backoff_end = buf.get_u8();
        let channel_encodings = UcdChannelEncodings::deserialize(buf)?;
        ensure(buf, 1, "UCD profile count")?;
        let count = buf.get_u8() as usize;
        let burst_profiles = (0..count)
            .map(|_| UlBurstProfile::deserialize(buf))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            configuration_change_count,
            ranging_backoff_start,
            ranging_backoff_end,
            request_backoff_start,
            request_backoff_end,
            channel_encodings,
            burst_profiles,
        })
    }
}

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CodecError;

pub type Sfid = u32;
pub type TransactionId = u16;
pub type FrameNumber = u32;
/// Simulation time measured from the start of the run.
pub type SimTime = Duration;

pub const MAC_ADDRESS_LEN: usize = 6;

/// Downlink interval usage codes that do not name a burst profile.
pub mod diuc {
    pub const GAP: u8 = 13;
    pub const END_OF_MAP: u8 = 14;
}

/// Uplink interval usage codes that do not name a burst profile.
pub mod uiuc {
    pub const INITIAL_RANGING: u8 = 1;
    pub const REQ_REGION_FULL: u8 = 2;
    pub const REQ_REGION_FOCUSED: u8 = 3;
    pub const FOCUSED_CONTENTION_IE: u8 = 4;
    pub const END_OF_MAP: u8 = 14;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; MAC_ADDRESS_LEN]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xFF; MAC_ADDRESS_LEN]);

    /// Locally administered address derived from a station index.
    pub fn from_index(index: u32) -> Self {
        let b = index.to_be_bytes();
        MacAddress([0x02, 0x00, b[0], b[1], b[2], b[3]])
    }

    pub fn octets(&self) -> [u8; MAC_ADDRESS_LEN] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// OFDM modulation and coding schemes, ordered from most robust to fastest.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Modulation {
    Bpsk12 = 0,
    Qpsk12 = 1,
    Qpsk34 = 2,
    Qam16_12 = 3,
    Qam16_34 = 4,
    Qam64_23 = 5,
    Qam64_34 = 6,
}

impl Modulation {
    pub const ALL: [Modulation; 7] = [
        Modulation::Bpsk12,
        Modulation::Qpsk12,
        Modulation::Qpsk34,
        Modulation::Qam16_12,
        Modulation::Qam16_34,
        Modulation::Qam64_23,
        Modulation::Qam64_34,
    ];

    /// Downlink burst profile carrying this modulation.
    pub fn diuc(self) -> u8 {
        self as u8 + 1
    }

    /// Uplink burst profile carrying this modulation.
    pub fn uiuc(self) -> u8 {
        self as u8 + 5
    }

    pub fn from_diuc(diuc: u8) -> Option<Self> {
        diuc.checked_sub(1).and_then(|m| Self::try_from(m).ok())
    }

    pub fn from_uiuc(uiuc: u8) -> Option<Self> {
        uiuc.checked_sub(5).and_then(|m| Self::try_from(m).ok())
    }
}

impl TryFrom<u8> for Modulation {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Modulation::ALL
            .get(value as usize)
            .copied()
            .ok_or(CodecError::InvalidField {
                field: "modulation",
                value: value as u32,
            })
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Down = 0,
    Up = 1,
}

impl TryFrom<u8> for Direction {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::Down),
            1 => Ok(Direction::Up),
            _ => Err(CodecError::InvalidField {
                field: "direction",
                value: value as u32,
            }),
        }
    }
}

/// QoS scheduling class of a service flow.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchedulingType {
    None = 0,
    Undefined = 1,
    BestEffort = 2,
    Nrtps = 3,
    Rtps = 4,
    Ugs = 6,
}

impl SchedulingType {
    /// True for the four classes a scheduler can serve.
    pub fn is_schedulable(self) -> bool {
        matches!(
            self,
            SchedulingType::Ugs
                | SchedulingType::Rtps
                | SchedulingType::Nrtps
                | SchedulingType::BestEffort
        )
    }

    /// Classes that obtain uplink bandwidth through requests rather than fixed grants.
    pub fn uses_requests(self) -> bool {
        matches!(
            self,
            SchedulingType::Rtps | SchedulingType::Nrtps | SchedulingType::BestEffort
        )
    }
}

impl TryFrom<u8> for SchedulingType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SchedulingType::None),
            1 => Ok(SchedulingType::Undefined),
            2 => Ok(SchedulingType::BestEffort),
            3 => Ok(SchedulingType::Nrtps),
            4 => Ok(SchedulingType::Rtps),
            6 => Ok(SchedulingType::Ugs),
            _ => Err(CodecError::InvalidField {
                field: "scheduling type",
                value: value as u32,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_profile_codes() {
        assert_eq!(Modulation::Bpsk12.diuc(), 1);
        assert_eq!(Modulation::Qam64_34.diuc(), 7);
        assert_eq!(Modulation::Bpsk12.uiuc(), 5);
        assert_eq!(Modulation::Qam64_34.uiuc(), 11);
        for m in Modulation::ALL {
            assert_eq!(Modulation::from_diuc(m.diuc()), Some(m));
            assert_eq!(Modulation::from_uiuc(m.uiuc()), Some(m));
        }
        assert_eq!(Modulation::from_diuc(diuc::END_OF_MAP), None);
        assert_eq!(Modulation::from_uiuc(uiuc::INITIAL_RANGING), None);
    }

    #[test]
    fn test_scheduling_type_codes() {
        assert_eq!(SchedulingType::try_from(6).unwrap(), SchedulingType::Ugs);
        assert!(SchedulingType::try_from(5).is_err());
        assert!(!SchedulingType::Undefined.is_schedulable());
        assert!(!SchedulingType::Ugs.uses_requests());
    }

    #[test]
    fn test_mac_address_display() {
        let mac = MacAddress::from_index(0x0102);
        assert_eq!(mac.to_string(), "02:00:00:00:01:02");
    }
}

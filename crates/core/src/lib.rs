//! Wire-level building blocks for the WiMAX MAC simulator

use thiserror::Error;

pub mod cid;
pub mod header;
pub mod messages;
pub mod tlv;
pub mod types;
pub mod wire;

pub use cid::{Cid, CidFactory, CidType};
pub use header::{
    BandwidthRequestHeader, BandwidthRequestType, FragmentControl, FragmentationSubheader,
    GenericMacHeader, GrantManagementSubheader, MacHeader, MacHeaderType, MacPdu,
};
pub use messages::ManagementMessage;
pub use tlv::{Tlv, TlvScope, TlvValue};
pub use types::{Direction, MacAddress, Modulation, SchedulingType, Sfid, SimTime};
pub use wire::WireFormat;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("TLV length {length} exceeds remaining {remaining} bytes")]
    LengthOverflow { length: usize, remaining: usize },

    #[error("invalid TLV length field width {0}")]
    InvalidLengthField(u8),

    #[error("TLV type {tlv_type} expects {expected} value bytes, got {actual}")]
    BadValueLength {
        tlv_type: u8,
        expected: usize,
        actual: usize,
    },

    #[error("unknown management message type {0}")]
    UnknownMessageType(u8),

    #[error("header check sequence mismatch: computed {computed:#04x}, received {received:#04x}")]
    HeaderChecksum { computed: u8, received: u8 },

    #[error("MAC PDU length {0} is shorter than its headers")]
    PduLength(u16),

    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidError {
    #[error("no free {0:?} connection identifier left")]
    Exhausted(CidType),

    #[error("{0:?} identifiers are not handed out by the factory")]
    NotAllocatable(CidType),
}

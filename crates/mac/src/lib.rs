//! WiMAX MAC layer for base and subscriber stations

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wimax_core::{Cid, CidError, CodecError, MacAddress, Sfid};

pub mod bs;
pub mod classifier;
pub mod connection;
pub mod connection_manager;
pub mod packet;
pub mod phy;
pub mod queue;
pub mod scheduler;
pub mod service_flow;
pub mod sf_manager;
pub mod ss;
pub mod ss_record;
pub mod ss_scheduler;
pub mod timer;

pub use bs::{BaseStationMac, BsTimerEvent};
pub use connection::WimaxConnection;
pub use connection_manager::ConnectionManager;
pub use phy::{OfdmPhy, PhyTransmitter, WimaxPhy};
pub use queue::WimaxMacQueue;
pub use service_flow::{ServiceFlow, ServiceFlowRecord, ServiceFlowState};
pub use ss::{RangingState, SsTimerEvent, SubscriberStationMac};
pub use ss_record::{SsManager, SsRecord};

#[derive(Debug, Error)]
pub enum MacError {
    #[error("Queue of connection {0} is full")]
    QueueFull(Cid),

    #[error("Unknown connection {0}")]
    UnknownConnection(Cid),

    #[error("Unknown service flow {0}")]
    UnknownServiceFlow(Sfid),

    #[error("Unknown subscriber station {0}")]
    UnknownStation(MacAddress),

    #[error("No active service flow matches the packet")]
    Unclassified,

    #[error("Invalid service flow encoding: {0}")]
    InvalidServiceFlow(&'static str),

    #[error(transparent)]
    Cid(#[from] CidError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BsSchedulerType {
    Simple,
    Rtps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UplinkSchedulerType {
    Simple,
    Rtps,
    Mbqos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacConfig {
    pub frame_duration: Duration,
    /// Fraction of the frame's symbols given to the downlink subframe.
    pub downlink_share: f64,
    pub ttg_symbols: u32,
    pub rtg_symbols: u32,
    pub dcd_interval: Duration,
    pub ucd_interval: Duration,
    pub initial_ranging_interval: Duration,
    pub nr_ir_opps: u32,
    pub ranging_opp_symbols: u32,
    pub bw_req_opp_symbols: u32,
    /// Invited ranging rounds answered with Continue before Success.
    pub ranging_correction_rounds: u8,
    pub max_ranging_correction_retries: u8,
    pub max_invited_ranging_retries: u8,
    pub lost_rng_rsp_timeout: Duration,
    pub max_rng_req_retries: u8,
    pub dsa_rsp_timeout: Duration,
    pub max_dsa_req_retries: u8,
    pub dsa_ack_timeout: Duration,
    pub max_dsa_rsp_retries: u8,
    /// Unicast poll period for registered stations so management traffic can be requested.
    pub basic_polling_interval: Duration,
    pub rtps_polling_interval: Duration,
    pub nrtps_polling_interval: Duration,
    pub be_polling_interval: Duration,
    pub uplink_window: Duration,
    pub queue_max_size: usize,
    pub cid_management_range: u16,
    pub bs_scheduler: BsSchedulerType,
    pub ul_scheduler: UplinkSchedulerType,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(10),
            downlink_share: 0.5,
            ttg_symbols: 2,
            rtg_symbols: 2,
            dcd_interval: Duration::from_secs(3),
            ucd_interval: Duration::from_secs(3),
            initial_ranging_interval: Duration::from_millis(50),
            nr_ir_opps: 3,
            ranging_opp_symbols: 4,
            bw_req_opp_symbols: 2,
            ranging_correction_rounds: 1,
            max_ranging_correction_retries: 16,
            max_invited_ranging_retries: 16,
            lost_rng_rsp_timeout: Duration::from_millis(200),
            max_rng_req_retries: 16,
            dsa_rsp_timeout: Duration::from_millis(200),
            max_dsa_req_retries: 5,
            dsa_ack_timeout: Duration::from_millis(200),
            max_dsa_rsp_retries: 5,
            basic_polling_interval: Duration::from_millis(40),
            rtps_polling_interval: Duration::from_millis(20),
            nrtps_polling_interval: Duration::from_millis(100),
            be_polling_interval: Duration::from_millis(200),
            uplink_window: Duration::from_millis(100),
            queue_max_size: 1024,
            cid_management_range: 0x0400,
            bs_scheduler: BsSchedulerType::Simple,
            ul_scheduler: UplinkSchedulerType::Simple,
        }
    }
}

impl MacConfig {
    /// Whole frames per `interval`, never less than one.
    pub fn frames_in(&self, interval: Duration) -> u64 {
        let frame = self.frame_duration.as_nanos().max(1);
        ((interval.as_nanos() / frame) as u64).max(1)
    }

    /// Splits a frame's symbols into (downlink, uplink) subframes around the TTG/RTG gaps.
    pub fn subframe_symbols(&self, phy: &dyn WimaxPhy) -> (u32, u32) {
        let usable = phy
            .symbols_per_frame()
            .saturating_sub(self.ttg_symbols + self.rtg_symbols);
        let downlink = (usable as f64 * self.downlink_share.clamp(0.0, 1.0)) as u32;
        (downlink, usable - downlink)
    }
}

/// Per-station counters for observable failure handling.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StationStats {
    pub frames: u64,
    pub pdus_sent: u64,
    pub pdus_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dropped_pdus: u64,
    pub queue_drops: u64,
    pub unclassified_packets: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_in_rounds_down_with_floor_of_one() {
        let config = MacConfig::default();
        assert_eq!(config.frames_in(Duration::from_millis(50)), 5);
        assert_eq!(config.frames_in(Duration::from_millis(25)), 2);
        assert_eq!(config.frames_in(Duration::from_millis(1)), 1);
    }

    #[test]
    fn test_subframes_leave_room_for_gaps() {
        let config = MacConfig::default();
        let (dl, ul) = config.subframe_symbols(&OfdmPhy::default());
        assert_eq!(dl, 176);
        assert_eq!(ul, 177);
    }
}

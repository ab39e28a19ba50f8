//! Per-frame uplink symbol bookkeeping and UL-MAP IE construction.

use log::trace;
use wimax_core::header::GENERIC_MAC_HEADER_SIZE;
use wimax_core::messages::UlMapIe;
use wimax_core::types::uiuc;
use wimax_core::{Cid, Modulation, SimTime};

use super::UplinkSchedule;
use crate::phy::WimaxPhy;
use crate::service_flow::ServiceFlow;
use crate::ss_record::SsRecord;
use crate::MacConfig;

/// Symbol offset of the uplink subframe from the start of the frame.
pub fn calculate_allocation_start_time(config: &MacConfig, phy: &dyn WimaxPhy) -> u32 {
    let (downlink, _) = config.subframe_symbols(phy);
    downlink + config.ttg_symbols
}

fn unsolicited_grant_bytes(flow: &ServiceFlow, config: &MacConfig) -> u32 {
    flow.unsolicited_grant_size(config.frame_duration) + GENERIC_MAC_HEADER_SIZE as u32
}

/// Hands out uplink symbols in allocation order. Every IE starts where the
/// previous one ended and the running total never exceeds the subframe.
pub struct UplinkAllocator<'p> {
    phy: &'p dyn WimaxPhy,
    available: u32,
    used: u32,
    ies: Vec<UlMapIe>,
}

impl<'p> UplinkAllocator<'p> {
    pub fn new(phy: &'p dyn WimaxPhy, available_symbols: u32) -> Self {
        Self {
            phy,
            available: available_symbols,
            used: 0,
            ies: Vec::new(),
        }
    }

    pub fn remaining_symbols(&self) -> u32 {
        self.available - self.used
    }

    pub fn used_symbols(&self) -> u32 {
        self.used
    }

    pub fn remaining_bytes(&self, modulation: Modulation) -> u32 {
        self.phy.nr_bytes(self.remaining_symbols(), modulation)
    }

    /// Commits one IE of `symbols`. All or nothing.
    pub fn add_uplink_allocation(&mut self, cid: Cid, uiuc: u8, symbols: u32) -> bool {
        if symbols == 0 || symbols > self.remaining_symbols() {
            return false;
        }
        trace!("UL IE {} uiuc {} at {} for {} symbols", cid, uiuc, self.used, symbols);
        self.ies
            .push(UlMapIe::new(cid, uiuc, self.used as u16, symbols as u16));
        self.used += symbols;
        true
    }

    /// Reserves the contention ranging region. Returns the number of whole
    /// opportunities that fit.
    pub fn allocate_initial_ranging_interval(&mut self, nr_opps: u32, opp_symbols: u32) -> u32 {
        if opp_symbols == 0 {
            return 0;
        }
        let opps = nr_opps.min(self.remaining_symbols() / opp_symbols);
        if opps > 0 {
            self.add_uplink_allocation(Cid::BROADCAST, uiuc::INITIAL_RANGING, opps * opp_symbols);
        }
        opps
    }

    pub fn invite_ranging(&mut self, ss: &SsRecord, symbols: u32) -> bool {
        self.add_uplink_allocation(ss.basic_cid, uiuc::INITIAL_RANGING, symbols)
    }

    /// Unicast request opportunity on the station's basic CID.
    pub fn poll(&mut self, ss: &SsRecord, symbols: u32) -> bool {
        self.add_uplink_allocation(ss.basic_cid, ss.modulation.uiuc(), symbols)
    }

    /// Symbols one UGS interval of `flow` occupies at the station's modulation.
    pub fn unsolicited_grant_symbols(&self, ss: &SsRecord, flow: &ServiceFlow, config: &MacConfig) -> u32 {
        self.phy
            .nr_symbols(unsolicited_grant_bytes(flow, config), ss.modulation)
    }

    /// Grants a full UGS interval worth of data. Returns the bytes granted,
    /// zero when the whole grant does not fit.
    pub fn service_unsolicited_grants(
        &mut self,
        ss: &SsRecord,
        flow: &mut ServiceFlow,
        config: &MacConfig,
        now: SimTime,
    ) -> u32 {
        let bytes = unsolicited_grant_bytes(flow, config);
        let symbols = self.unsolicited_grant_symbols(ss, flow, config);
        if !self.add_uplink_allocation(ss.basic_cid, ss.modulation.uiuc(), symbols) {
            return 0;
        }
        flow.record.record_grant(bytes, now);
        bytes
    }

    /// Grants up to `bytes`, capped by `max_symbols` and what is left.
    /// Returns the bytes actually covered.
    pub fn service_bandwidth_requests(
        &mut self,
        ss: &SsRecord,
        bytes: u32,
        max_symbols: u32,
    ) -> u32 {
        if bytes == 0 {
            return 0;
        }
        let symbols = self
            .phy
            .nr_symbols(bytes, ss.modulation)
            .min(max_symbols)
            .min(self.remaining_symbols());
        if !self.add_uplink_allocation(ss.basic_cid, ss.modulation.uiuc(), symbols) {
            return 0;
        }
        bytes.min(self.phy.nr_bytes(symbols, ss.modulation))
    }

    /// Serves a flow's outstanding request and books the grant against it.
    pub fn grant_flow_request(
        &mut self,
        ss: &SsRecord,
        flow: &mut ServiceFlow,
        max_symbols: u32,
        now: SimTime,
    ) -> u32 {
        let granted = self.service_bandwidth_requests(ss, flow.record.pending_request(), max_symbols);
        if granted > 0 {
            flow.record.record_grant(granted, now);
        }
        granted
    }

    /// Closes the map with the end-of-map IE.
    pub fn finish(mut self, allocation_start_time: u32) -> UplinkSchedule {
        self.ies.push(UlMapIe::end_of_map(self.used as u16));
        UplinkSchedule {
            allocation_start_time,
            ies: self.ies,
            symbols_used: self.used,
        }
    }
}

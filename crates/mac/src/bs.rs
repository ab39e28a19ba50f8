//! Base-station MAC: owns the connections and stations of one cell and turns
//! each frame into a DL-MAP/UL-MAP burst followed by the scheduled data bursts.

use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use wimax_core::header::GENERIC_MAC_HEADER_SIZE;
use wimax_core::messages::DL_MAP_IE_SIZE;
use wimax_core::messages::{
    Dcd, DcdChannelEncodings, DlMap, DlMapIe, DsaAck, DsaReq, RangingStatus, RngReq, RngRsp, Ucd,
    UcdChannelEncodings, UlMap,
};
use wimax_core::types::{uiuc, TransactionId};
use wimax_core::{
    Cid, CidFactory, CidType, Direction, MacAddress, MacHeader, MacPdu, ManagementMessage,
    Modulation, Sfid, SimTime, WireFormat,
};

use crate::connection_manager::ConnectionManager;
use crate::phy::{PhyTransmitter, WimaxPhy};
use crate::scheduler::{
    BsScheduler, BsSchedulerKind, DownlinkContext, UplinkContext, UplinkSchedule, UplinkScheduler,
    UplinkSchedulerKind,
};
use crate::sf_manager::bs::AdmissionContext;
use crate::sf_manager::{AckTimeoutOutcome, BsServiceFlowManager, DsaReqOutcome, ServiceFlowManager};
use crate::ss_record::SsManager;
use crate::timer::{TimerRequest, TimerToken};
use crate::{MacConfig, MacError, StationStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BsTimerEvent {
    DsaAckTimeout {
        primary_cid: Cid,
        transaction_id: TransactionId,
        token: TimerToken,
    },
    /// End of an uplink scheduling window.
    WindowExpired,
}

pub struct BaseStationMac {
    config: MacConfig,
    mac_address: MacAddress,
    factory: CidFactory,
    connections: ConnectionManager,
    ss_manager: SsManager,
    sf_manager: BsServiceFlowManager,
    dl_scheduler: BsSchedulerKind,
    ul_scheduler: UplinkSchedulerKind,
    frame_number: u32,
    dcd_count: u8,
    ucd_count: u8,
    last_dcd: Option<SimTime>,
    last_ucd: Option<SimTime>,
    /// Basic CIDs offered an invited ranging slot in the last UL-MAP.
    invited: BTreeSet<Cid>,
    timers: Vec<TimerRequest<BsTimerEvent>>,
    received: Vec<(Sfid, Bytes)>,
    stats: StationStats,
}

impl BaseStationMac {
    pub fn new(mac_address: MacAddress, config: MacConfig) -> Self {
        let mut connections = ConnectionManager::new(config.queue_max_size);
        connections.add_connection(connections.new_connection(Cid::BROADCAST, CidType::Broadcast));
        connections.add_connection(
            connections.new_connection(Cid::INITIAL_RANGING, CidType::InitialRanging),
        );
        let timers = vec![TimerRequest {
            delay: config.uplink_window,
            event: BsTimerEvent::WindowExpired,
        }];
        info!(
            "Base station {} up: {:?} downlink, {:?} uplink scheduling",
            mac_address, config.bs_scheduler, config.ul_scheduler
        );
        Self {
            factory: CidFactory::with_management_range(config.cid_management_range),
            connections,
            ss_manager: SsManager::new(),
            sf_manager: BsServiceFlowManager::new(config.max_dsa_rsp_retries),
            dl_scheduler: BsSchedulerKind::new(config.bs_scheduler),
            ul_scheduler: UplinkSchedulerKind::new(config.ul_scheduler, &config),
            mac_address,
            frame_number: 0,
            dcd_count: 0,
            ucd_count: 0,
            last_dcd: None,
            last_ucd: None,
            invited: BTreeSet::new(),
            timers,
            received: Vec::new(),
            stats: StationStats::default(),
            config,
        }
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac_address
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn frame_number(&self) -> u32 {
        self.frame_number
    }

    pub fn ss_manager(&self) -> &SsManager {
        &self.ss_manager
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn service_flows(&self) -> &ServiceFlowManager {
        self.sf_manager.base()
    }

    pub fn stats(&self) -> &StationStats {
        &self.stats
    }

    /// Classifies a downlink packet onto its flow's transport connection.
    pub fn enqueue(&mut self, packet: Bytes, now: SimTime) -> Result<Sfid, MacError> {
        let Some(sfid) = self.sf_manager.base().do_classify(&packet, Direction::Down) else {
            self.stats.unclassified_packets += 1;
            return Err(MacError::Unclassified);
        };
        let cid = self
            .sf_manager
            .base()
            .get_service_flow(sfid)
            .and_then(|f| f.cid)
            .ok_or(MacError::UnknownServiceFlow(sfid))?;
        let connection = self
            .connections
            .get_connection_mut(cid)
            .ok_or(MacError::UnknownConnection(cid))?;
        if !connection.enqueue_sdu(packet, now) {
            self.stats.queue_drops += 1;
            return Err(MacError::QueueFull(cid));
        }
        trace!("Queued downlink packet on {} (flow {})", cid, sfid);
        Ok(sfid)
    }

    /// Uplink SDUs reassembled since the last call.
    pub fn take_received(&mut self) -> Vec<(Sfid, Bytes)> {
        std::mem::take(&mut self.received)
    }

    pub fn take_timers(&mut self) -> Vec<TimerRequest<BsTimerEvent>> {
        std::mem::take(&mut self.timers)
    }

    fn send_management(&mut self, cid: Cid, message: ManagementMessage, now: SimTime) {
        let Some(connection) = self.connections.get_connection_mut(cid) else {
            warn!("No connection {} for {:?}", cid, message.message_type());
            return;
        };
        if !connection.enqueue_sdu(message.to_bytes(), now) {
            self.stats.queue_drops += 1;
            warn!("Management queue of {} full, dropping {:?}", cid, message.message_type());
        }
    }

    fn queue_descriptors(&mut self, phy: &dyn WimaxPhy, now: SimTime) {
        let due = |last: Option<SimTime>, interval: SimTime| last.map_or(true, |t| now >= t + interval);
        if due(self.last_dcd, self.config.dcd_interval) {
            let encodings = DcdChannelEncodings {
                ttg: self.config.ttg_symbols as u8,
                rtg: self.config.rtg_symbols as u8,
                base_station_id: self.mac_address,
                frame_duration_code: phy.frame_duration_code(),
                frame_number: self.frame_number,
                ..Default::default()
            };
            self.dcd_count = self.dcd_count.wrapping_add(1);
            let dcd = Dcd::with_all_profiles(self.dcd_count, encodings);
            self.send_management(Cid::BROADCAST, ManagementMessage::Dcd(dcd), now);
            self.last_dcd = Some(now);
        }
        if due(self.last_ucd, self.config.ucd_interval) {
            let encodings = UcdChannelEncodings {
                bw_req_opp_size: self.config.bw_req_opp_symbols as u16,
                ranging_req_opp_size: self.config.ranging_opp_symbols as u16,
                ..Default::default()
            };
            self.ucd_count = self.ucd_count.wrapping_add(1);
            let ucd = Ucd::with_all_profiles(self.ucd_count, encodings);
            self.send_management(Cid::BROADCAST, ManagementMessage::Ucd(ucd), now);
            self.last_ucd = Some(now);
        }
    }

    /// Counts invited ranging slots that went unanswered; a station out of
    /// retries is aborted.
    fn check_invited_ranging(&mut self, now: SimTime) {
        for basic in std::mem::take(&mut self.invited) {
            let Some(record) = self.ss_manager.get_mut_by_cid(basic) else {
                continue;
            };
            record.invited_ranging_retries += 1;
            if record.invited_ranging_retries > self.config.max_invited_ranging_retries {
                let mac = record.mac_address;
                warn!("{} missed {} invited ranging slots", mac, record.invited_ranging_retries);
                self.abort_station(mac, now);
            } else {
                debug!("{} missed invited ranging, inviting again", record.mac_address);
                record.poll_for_ranging = true;
            }
        }
    }

    fn run_uplink_scheduler(&mut self, phy: &dyn WimaxPhy, available_symbols: u32, now: SimTime) -> UplinkSchedule {
        let mut ctx = UplinkContext {
            ss_manager: &mut self.ss_manager,
            flows: self.sf_manager.base_mut(),
            phy,
            config: &self.config,
            available_symbols,
            now,
        };
        let schedule = self.ul_scheduler.schedule(&mut ctx);
        for record in self.ss_manager.records_mut() {
            record.poll_me = false;
        }
        for ie in &schedule.ies {
            if ie.uiuc != uiuc::INITIAL_RANGING || ie.cid.is_broadcast() {
                continue;
            }
            if let Some(record) = self.ss_manager.get_mut_by_cid(ie.cid) {
                record.poll_for_ranging = false;
                self.invited.insert(ie.cid);
            }
        }
        schedule
    }

    /// Runs both schedulers for one frame and hands every downlink burst to `tx`,
    /// the MAP burst first.
    pub fn start_frame(&mut self, now: SimTime, phy: &dyn WimaxPhy, tx: &mut dyn PhyTransmitter) {
        self.stats.frames += 1;
        self.check_invited_ranging(now);
        self.queue_descriptors(phy, now);

        let (dl_symbols, ul_symbols) = self.config.subframe_symbols(phy);
        let schedule = self.run_uplink_scheduler(phy, ul_symbols, now);
        let ul_map = UlMap {
            ucd_count: self.ucd_count,
            allocation_start_time: schedule.allocation_start_time,
            ies: schedule.ies,
        };

        // The DL-MAP is sized before the bursts are known, so reserve room
        // for one IE per backlogged connection plus the end-of-map IE, as
        // far as the subframe allows.
        let backlogged = self.connections.connections().filter(|c| c.has_packets()).count();
        let ul_map_size = ManagementMessage::UlMap(ul_map.clone()).serialized_size();
        let fixed_bytes = 2 * GENERIC_MAC_HEADER_SIZE + 1 + 7 + DL_MAP_IE_SIZE + ul_map_size;
        let capacity = phy.nr_bytes(dl_symbols, Modulation::Bpsk12) as usize;
        if fixed_bytes > capacity {
            warn!(
                "Frame {}: {} map bytes exceed the {} byte downlink subframe",
                self.frame_number, fixed_bytes, capacity
            );
        }
        let max_bursts = backlogged.min(capacity.saturating_sub(fixed_bytes) / DL_MAP_IE_SIZE);
        if max_bursts < backlogged {
            warn!(
                "Frame {}: DL-MAP lists {} of {} backlogged connections",
                self.frame_number, max_bursts, backlogged
            );
        }
        let map_bytes = fixed_bytes + DL_MAP_IE_SIZE * max_bursts;
        let map_symbols = phy.nr_symbols(map_bytes as u32, Modulation::Bpsk12).min(dl_symbols);

        let mut ctx = DownlinkContext {
            connections: &mut self.connections,
            flows: self.sf_manager.base_mut(),
            ss_manager: &self.ss_manager,
            phy,
            first_symbol: map_symbols,
            available_symbols: dl_symbols - map_symbols,
            max_bursts,
            now,
            frame_duration: self.config.frame_duration,
        };
        let bursts = self.dl_scheduler.schedule(&mut ctx);

        let used: u32 = bursts.iter().map(|b| b.symbols).sum();
        let mut ies: Vec<DlMapIe> = bursts.iter().map(|b| b.ie).collect();
        ies.push(DlMapIe::end_of_map((map_symbols + used) as u16));
        let dl_map = DlMap {
            dcd_count: self.dcd_count,
            base_station_id: self.mac_address,
            ies,
        };

        let maps = [ManagementMessage::DlMap(dl_map), ManagementMessage::UlMap(ul_map)];
        let mut lead = BytesMut::new();
        for message in &maps {
            MacPdu::generic(Cid::BROADCAST, message.to_bytes()).serialize(&mut lead);
        }
        trace!(
            "Frame {}: {} map bytes, {} bursts, {}/{} DL symbols",
            self.frame_number,
            lead.len(),
            bursts.len(),
            map_symbols + used,
            dl_symbols
        );
        self.stats.bytes_sent += lead.len() as u64;
        self.stats.pdus_sent += maps.len() as u64;
        tx.forward_down(lead.freeze(), Modulation::Bpsk12);
        for burst in bursts {
            let data = burst.to_bytes();
            self.stats.pdus_sent += burst.pdus.len() as u64;
            self.stats.bytes_sent += data.len() as u64;
            tx.forward_down(data, burst.modulation);
        }
        self.frame_number = self.frame_number.wrapping_add(1);
    }

    /// Processes one uplink burst.
    pub fn receive_burst(&mut self, burst: &[u8], now: SimTime) {
        let (pdus, error) = MacPdu::decode_burst(burst);
        if let Some(e) = error {
            self.stats.dropped_pdus += 1;
            warn!("Dropping rest of uplink burst: {}", e);
        }
        for pdu in pdus {
            self.stats.pdus_received += 1;
            self.stats.bytes_received += pdu.serialized_size() as u64;
            match pdu.header() {
                MacHeader::BandwidthRequest(header) => {
                    trace!("Bandwidth request of {} bytes on {}", header.br, header.cid);
                    self.ul_scheduler.process_bandwidth_request(
                        header,
                        &mut self.ss_manager,
                        self.sf_manager.base_mut(),
                        now,
                    );
                }
                MacHeader::Generic(_) => self.receive_generic(&pdu, now),
            }
        }
    }

    fn receive_generic(&mut self, pdu: &MacPdu, now: SimTime) {
        let cid = pdu.cid();
        if pdu.grant_management().is_some_and(|gm| gm.poll_me) {
            self.mark_poll_me(cid);
        }
        match self.factory.cid_type(cid) {
            Some(CidType::Transport) => self.receive_data(pdu),
            Some(CidType::InitialRanging | CidType::Basic | CidType::Primary) => {
                match ManagementMessage::decode_from(pdu.payload()) {
                    Ok((message, _)) => self.receive_management(cid, message, now),
                    Err(e) => {
                        self.stats.dropped_pdus += 1;
                        warn!("Undecodable management message on {}: {}", cid, e);
                    }
                }
            }
            _ => {
                self.stats.dropped_pdus += 1;
                debug!("Ignoring uplink PDU on {}", cid);
            }
        }
    }

    fn mark_poll_me(&mut self, transport: Cid) {
        let Some(sfid) = self.sf_manager.base().get_service_flow_by_cid(transport).map(|f| f.sfid) else {
            return;
        };
        if let Some(record) = self
            .ss_manager
            .records_mut()
            .find(|r| r.service_flows.contains(&sfid))
        {
            record.poll_me = true;
        }
    }

    fn receive_data(&mut self, pdu: &MacPdu) {
        let cid = pdu.cid();
        let Some(connection) = self.connections.get_connection_mut(cid) else {
            self.stats.dropped_pdus += 1;
            debug!("Data on unknown connection {}", cid);
            return;
        };
        let Some(sdu) = connection.reassemble(pdu) else {
            return;
        };
        if let Some(flow) = self.sf_manager.base_mut().get_service_flow_by_cid_mut(cid) {
            flow.record.record_received(sdu.len());
            self.received.push((flow.sfid, sdu));
        }
    }

    fn receive_management(&mut self, cid: Cid, message: ManagementMessage, now: SimTime) {
        match message {
            ManagementMessage::RngReq(req) => self.process_ranging_request(req, now),
            ManagementMessage::DsaReq(req) => self.process_dsa_req(cid, &req, now),
            ManagementMessage::DsaAck(ack) => self.process_dsa_ack(cid, &ack, now),
            other => debug!("Unexpected {:?} on {}", other.message_type(), cid),
        }
    }

    /// Answers an RNG-REQ. New stations get their basic and primary CIDs;
    /// the first `ranging_correction_rounds` answers are Continue and invite
    /// another round, after which the station is registered.
    fn process_ranging_request(&mut self, req: RngReq, now: SimTime) {
        let mac = req.mac_address;
        let record = self.ss_manager.create_ss_record(mac);
        self.invited.remove(&record.basic_cid);
        if let Some(modulation) = req.requested_modulation() {
            record.modulation = modulation;
        }
        let mut rsp = RngRsp {
            mac_address: mac,
            frame_number: self.frame_number,
            basic_cid: record.basic_cid,
            primary_cid: record.primary_cid,
            ..Default::default()
        };
        if record.basic_cid.is_initial_ranging() {
            if let Err(e) = self
                .connections
                .allocate_management_connections(record, &mut rsp, &mut self.factory)
            {
                warn!("Cannot admit {}: {}", mac, e);
                return;
            }
            self.ss_manager.set_cids(mac, rsp.basic_cid, rsp.primary_cid);
        }
        let Some(record) = self.ss_manager.get_mut(&mac) else {
            return;
        };

        let status = if record.is_registered() {
            RangingStatus::Success
        } else if record.ranging_correction_retries < self.config.ranging_correction_rounds {
            if record.ranging_correction_retries >= self.config.max_ranging_correction_retries {
                RangingStatus::Abort
            } else {
                record.ranging_correction_retries += 1;
                record.poll_for_ranging = true;
                RangingStatus::Continue
            }
        } else {
            RangingStatus::Success
        };
        if status == RangingStatus::Abort {
            self.abort_station(mac, now);
            return;
        }
        if status == RangingStatus::Success && !record.is_registered() {
            info!(
                "{} registered: basic {}, primary {}, {:?}",
                mac, record.basic_cid, record.primary_cid, record.modulation
            );
        }
        record.ranging_status = status;
        record.invited_ranging_retries = 0;
        rsp.ranging_status = status;
        rsp.dl_operational_burst_profile = record.modulation.diuc() as u16;
        debug!("RNG-RSP {:?} to {}", status, mac);
        self.send_management(Cid::INITIAL_RANGING, ManagementMessage::RngRsp(rsp), now);
    }

    /// Sends an Abort and forgets the station with all its connections and flows.
    fn abort_station(&mut self, mac: MacAddress, now: SimTime) {
        let Some(record) = self.ss_manager.delete(&mac) else {
            return;
        };
        warn!("Aborting ranging of {}", mac);
        let rsp = RngRsp {
            mac_address: mac,
            frame_number: self.frame_number,
            ranging_status: RangingStatus::Abort,
            basic_cid: record.basic_cid,
            primary_cid: record.primary_cid,
            ..Default::default()
        };
        self.send_management(Cid::INITIAL_RANGING, ManagementMessage::RngRsp(rsp), now);

        let mut ctx = AdmissionContext {
            ss_manager: &mut self.ss_manager,
            connections: &mut self.connections,
            factory: &mut self.factory,
            ul_scheduler: &mut self.ul_scheduler,
            now,
        };
        self.sf_manager
            .release_station(record.primary_cid, &record.service_flows, &mut ctx);
        self.invited.remove(&record.basic_cid);
        for cid in [record.basic_cid, record.primary_cid] {
            if !cid.is_initial_ranging() {
                self.connections.remove_connection(cid, &mut self.factory);
            }
        }
    }

    fn process_dsa_req(&mut self, primary_cid: Cid, req: &DsaReq, now: SimTime) {
        let mut ctx = AdmissionContext {
            ss_manager: &mut self.ss_manager,
            connections: &mut self.connections,
            factory: &mut self.factory,
            ul_scheduler: &mut self.ul_scheduler,
            now,
        };
        match self.sf_manager.process_dsa_req(primary_cid, req, &mut ctx) {
            DsaReqOutcome::Accepted { rsp, token, .. } => {
                self.timers.push(TimerRequest {
                    delay: self.config.dsa_ack_timeout,
                    event: BsTimerEvent::DsaAckTimeout {
                        primary_cid,
                        transaction_id: rsp.transaction_id,
                        token,
                    },
                });
                self.send_management(primary_cid, ManagementMessage::DsaRsp(rsp), now);
            }
            DsaReqOutcome::Rejected { rsp } | DsaReqOutcome::Duplicate { rsp } => {
                self.send_management(primary_cid, ManagementMessage::DsaRsp(rsp), now);
            }
            DsaReqOutcome::Ignored => self.stats.dropped_pdus += 1,
        }
    }

    fn process_dsa_ack(&mut self, primary_cid: Cid, ack: &DsaAck, now: SimTime) {
        let mut ctx = AdmissionContext {
            ss_manager: &mut self.ss_manager,
            connections: &mut self.connections,
            factory: &mut self.factory,
            ul_scheduler: &mut self.ul_scheduler,
            now,
        };
        self.sf_manager.process_dsa_ack(primary_cid, ack, &mut ctx);
    }

    pub fn on_timer(&mut self, event: BsTimerEvent, now: SimTime) {
        match event {
            BsTimerEvent::DsaAckTimeout {
                primary_cid,
                transaction_id,
                token,
            } => {
                let mut ctx = AdmissionContext {
                    ss_manager: &mut self.ss_manager,
                    connections: &mut self.connections,
                    factory: &mut self.factory,
                    ul_scheduler: &mut self.ul_scheduler,
                    now,
                };
                let outcome =
                    self.sf_manager
                        .on_dsa_ack_timeout(primary_cid, transaction_id, token, &mut ctx);
                match outcome {
                    AckTimeoutOutcome::Resend { rsp, token } => {
                        debug!("Re-sending DSA-RSP {} on {}", transaction_id, primary_cid);
                        self.timers.push(TimerRequest {
                            delay: self.config.dsa_ack_timeout,
                            event: BsTimerEvent::DsaAckTimeout {
                                primary_cid,
                                transaction_id,
                                token,
                            },
                        });
                        self.send_management(primary_cid, ManagementMessage::DsaRsp(rsp), now);
                    }
                    AckTimeoutOutcome::RolledBack { sfid } => {
                        info!("Service flow {} rolled back", sfid);
                    }
                    AckTimeoutOutcome::Stale => {}
                }
            }
            BsTimerEvent::WindowExpired => {
                self.ul_scheduler.on_window_timer(self.sf_manager.base_mut());
                self.timers.push(TimerRequest {
                    delay: self.config.uplink_window,
                    event: BsTimerEvent::WindowExpired,
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Collects downlink bursts instead of sending them anywhere.
    #[derive(Debug, Default)]
    pub struct Capture {
        pub bursts: Vec<(Bytes, Modulation)>,
    }

    impl PhyTransmitter for Capture {
        fn forward_down(&mut self, burst: Bytes, modulation: Modulation) {
            self.bursts.push((burst, modulation));
        }
    }

    impl Capture {
        pub fn messages(&self) -> Vec<(Cid, ManagementMessage)> {
            let mut out = Vec::new();
            for (burst, _) in &self.bursts {
                let (pdus, error) = MacPdu::decode_burst(burst);
                assert!(error.is_none());
                for pdu in pdus {
                    if let Ok((message, _)) = ManagementMessage::decode_from(pdu.payload()) {
                        out.push((pdu.cid(), message));
                    }
                }
            }
            out
        }
    }

    pub fn management_burst(cid: Cid, message: ManagementMessage) -> Bytes {
        MacPdu::generic(cid, message.to_bytes()).to_bytes()
    }
}

//! Subscriber-station MAC: ranges into the cell, negotiates its provisioned
//! service flows and fills the uplink grants announced in each UL-MAP.

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use wimax_core::messages::{DsaReq, DsaRsp, RangingStatus, RngReq, RngRsp, UlMap};
use wimax_core::types::uiuc;
use wimax_core::{
    Cid, CidType, Direction, MacAddress, MacHeader, MacPdu, ManagementMessage, Modulation, Sfid,
    SimTime, WireFormat,
};

use crate::connection_manager::ConnectionManager;
use crate::phy::{PhyTransmitter, WimaxPhy};
use crate::service_flow::ServiceFlow;
use crate::sf_manager::{DsaRspOutcome, DsaTimeoutOutcome, ServiceFlowManager, SsServiceFlowManager};
use crate::ss_scheduler::SsScheduler;
use crate::timer::{Timer, TimerRequest, TimerToken};
use crate::{MacConfig, MacError, StationStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingState {
    /// Waiting for a contention ranging opportunity.
    Idle,
    WaitingRngRsp,
    /// Told to continue; waiting for an invited ranging slot.
    Continue,
    Registered,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsTimerEvent {
    LostRngRsp(TimerToken),
    DsaRspTimeout(TimerToken),
}

pub struct SubscriberStationMac {
    config: MacConfig,
    mac_address: MacAddress,
    modulation: Modulation,
    state: RangingState,
    basic_cid: Option<Cid>,
    primary_cid: Option<Cid>,
    base_station: Option<MacAddress>,
    has_ucd: bool,
    connections: ConnectionManager,
    sf_manager: SsServiceFlowManager,
    scheduler: SsScheduler,
    ul_map: Option<UlMap>,
    rng_timer: Timer,
    rng_retries: u8,
    timers: Vec<TimerRequest<SsTimerEvent>>,
    received: Vec<(Sfid, Bytes)>,
    stats: StationStats,
}

impl SubscriberStationMac {
    pub fn new(mac_address: MacAddress, modulation: Modulation, config: MacConfig) -> Self {
        Self {
            mac_address,
            modulation,
            state: RangingState::Idle,
            basic_cid: None,
            primary_cid: None,
            base_station: None,
            has_ucd: false,
            connections: ConnectionManager::new(config.queue_max_size),
            sf_manager: SsServiceFlowManager::new(config.max_dsa_req_retries),
            scheduler: SsScheduler::new(),
            ul_map: None,
            rng_timer: Timer::default(),
            rng_retries: 0,
            timers: Vec::new(),
            received: Vec::new(),
            stats: StationStats::default(),
            config,
        }
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac_address
    }

    pub fn modulation(&self) -> Modulation {
        self.modulation
    }

    pub fn state(&self) -> RangingState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == RangingState::Registered
    }

    pub fn basic_cid(&self) -> Option<Cid> {
        self.basic_cid
    }

    pub fn primary_cid(&self) -> Option<Cid> {
        self.primary_cid
    }

    /// Base station whose DL-MAP the station last decoded.
    pub fn base_station(&self) -> Option<MacAddress> {
        self.base_station
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn service_flow_manager(&self) -> &SsServiceFlowManager {
        &self.sf_manager
    }

    pub fn service_flows(&self) -> &ServiceFlowManager {
        self.sf_manager.base()
    }

    pub fn stats(&self) -> &StationStats {
        &self.stats
    }

    pub fn take_timers(&mut self) -> Vec<TimerRequest<SsTimerEvent>> {
        std::mem::take(&mut self.timers)
    }

    /// Downlink SDUs reassembled since the last call.
    pub fn take_received(&mut self) -> Vec<(Sfid, Bytes)> {
        std::mem::take(&mut self.received)
    }

    /// Provisions a flow. It is negotiated once the station is registered.
    pub fn add_service_flow(&mut self, flow: ServiceFlow, now: SimTime) {
        self.sf_manager.add_service_flow(flow);
        if self.is_registered() {
            self.start_dsa(now);
        }
    }

    /// Classifies an uplink packet onto its flow's transport connection.
    pub fn enqueue(&mut self, packet: Bytes, now: SimTime) -> Result<Sfid, MacError> {
        let Some(sfid) = self.sf_manager.base().do_classify(&packet, Direction::Up) else {
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
        Ok(sfid)
    }

    fn send_management(&mut self, cid: Cid, message: ManagementMessage, now: SimTime) {
        let Some(connection) = self.connections.get_connection_mut(cid) else {
            warn!("{}: no connection {} for {:?}", self.mac_address, cid, message.message_type());
            return;
        };
        if !connection.enqueue_sdu(message.to_bytes(), now) {
            self.stats.queue_drops += 1;
        }
    }

    fn send_dsa_req(&mut self, req: DsaReq, token: TimerToken, now: SimTime) {
        let Some(primary) = self.primary_cid else {
            return;
        };
        self.timers.push(TimerRequest {
            delay: self.config.dsa_rsp_timeout,
            event: SsTimerEvent::DsaRspTimeout(token),
        });
        self.send_management(primary, ManagementMessage::DsaReq(req), now);
    }

    fn start_dsa(&mut self, now: SimTime) {
        if let Some((req, token)) = self.sf_manager.initiate_service_flows() {
            self.send_dsa_req(req, token, now);
        }
    }

    /// Processes one downlink burst. PDUs for other stations are skipped.
    pub fn receive_burst(&mut self, burst: &[u8], now: SimTime) {
        let (pdus, error) = MacPdu::decode_burst(burst);
        if let Some(e) = error {
            self.stats.dropped_pdus += 1;
            warn!("{}: dropping rest of downlink burst: {}", self.mac_address, e);
        }
        for pdu in pdus {
            if !matches!(pdu.header(), MacHeader::Generic(_)) {
                continue;
            }
            let cid = pdu.cid();
            let is_management = cid.is_broadcast()
                || cid.is_initial_ranging()
                || Some(cid) == self.basic_cid
                || Some(cid) == self.primary_cid;
            if is_management {
                match ManagementMessage::decode_from(pdu.payload()) {
                    Ok((message, _)) => self.receive_management(message, now),
                    Err(e) => {
                        self.stats.dropped_pdus += 1;
                        warn!("{}: undecodable management message on {}: {}", self.mac_address, cid, e);
                    }
                }
            } else if self.connections.get_connection(cid).is_some() {
                self.receive_data(&pdu);
            } else {
                continue;
            }
            self.stats.pdus_received += 1;
            self.stats.bytes_received += pdu.serialized_size() as u64;
        }
    }

    fn receive_data(&mut self, pdu: &MacPdu) {
        let cid = pdu.cid();
        let Some(sdu) = self
            .connections
            .get_connection_mut(cid)
            .and_then(|c| c.reassemble(pdu))
        else {
            return;
        };
        if let Some(flow) = self.sf_manager.base_mut().get_service_flow_by_cid_mut(cid) {
            flow.record.record_received(sdu.len());
            self.received.push((flow.sfid, sdu));
        }
    }

    fn receive_management(&mut self, message: ManagementMessage, now: SimTime) {
        match message {
            ManagementMessage::DlMap(map) => self.base_station = Some(map.base_station_id),
            ManagementMessage::UlMap(map) => self.ul_map = Some(map),
            ManagementMessage::Ucd(_) => self.has_ucd = true,
            ManagementMessage::Dcd(_) => {}
            ManagementMessage::RngRsp(rsp) if rsp.mac_address == self.mac_address => {
                self.process_rng_rsp(rsp, now)
            }
            ManagementMessage::DsaRsp(rsp) => self.process_dsa_rsp(&rsp, now),
            ManagementMessage::RngRsp(_) => {}
            other => debug!("{}: ignoring {:?}", self.mac_address, other.message_type()),
        }
    }

    fn adopt_cids(&mut self, rsp: &RngRsp) {
        if self.basic_cid.is_some() || rsp.basic_cid.is_initial_ranging() {
            return;
        }
        self.basic_cid = Some(rsp.basic_cid);
        self.primary_cid = Some(rsp.primary_cid);
        self.connections
            .add_connection(self.connections.new_connection(rsp.basic_cid, CidType::Basic));
        self.connections
            .add_connection(self.connections.new_connection(rsp.primary_cid, CidType::Primary));
    }

    fn process_rng_rsp(&mut self, rsp: RngRsp, now: SimTime) {
        if matches!(self.state, RangingState::Registered | RangingState::Aborted) {
            return;
        }
        self.rng_timer.cancel();
        match rsp.ranging_status {
            RangingStatus::Continue => {
                self.adopt_cids(&rsp);
                self.state = RangingState::Continue;
                debug!("{}: ranging continues", self.mac_address);
            }
            RangingStatus::Success => {
                self.adopt_cids(&rsp);
                self.state = RangingState::Registered;
                self.rng_retries = 0;
                info!(
                    "{} registered (basic {}, primary {})",
                    self.mac_address, rsp.basic_cid, rsp.primary_cid
                );
                self.start_dsa(now);
            }
            RangingStatus::Abort => self.abort(),
            RangingStatus::Expired => {}
        }
    }

    fn abort(&mut self) {
        warn!("{}: ranging aborted", self.mac_address);
        self.state = RangingState::Aborted;
        self.rng_timer.cancel();
        self.basic_cid = None;
        self.primary_cid = None;
        self.scheduler.reset();
    }

    fn process_dsa_rsp(&mut self, rsp: &DsaRsp, now: SimTime) {
        let Some(primary) = self.primary_cid else {
            return;
        };
        let (ack, next) = match self.sf_manager.process_dsa_rsp(rsp, &mut self.connections) {
            DsaRspOutcome::Ignored => return,
            DsaRspOutcome::Duplicate(ack) => (ack, false),
            DsaRspOutcome::Accepted { ack, .. } | DsaRspOutcome::Rejected { ack, .. } => (ack, true),
        };
        self.send_management(primary, ManagementMessage::DsaAck(ack), now);
        if next {
            self.start_dsa(now);
        }
    }

    pub fn on_timer(&mut self, event: SsTimerEvent, now: SimTime) {
        match event {
            SsTimerEvent::LostRngRsp(token) => {
                if !self.rng_timer.fire(token) {
                    return;
                }
                self.rng_retries += 1;
                if self.rng_retries > self.config.max_rng_req_retries {
                    self.abort();
                    return;
                }
                debug!("{}: RNG-RSP lost, retry {}", self.mac_address, self.rng_retries);
                self.state = if self.basic_cid.is_some() {
                    RangingState::Continue
                } else {
                    RangingState::Idle
                };
            }
            SsTimerEvent::DsaRspTimeout(token) => match self.sf_manager.on_dsa_rsp_timeout(token) {
                DsaTimeoutOutcome::Resend(req, token) => self.send_dsa_req(req, token, now),
                DsaTimeoutOutcome::Abandoned => self.start_dsa(now),
                DsaTimeoutOutcome::Stale => {}
            },
        }
    }

    fn send_rng_req(&mut self, cid: Cid, tx: &mut dyn PhyTransmitter) {
        let req = RngReq::new(self.mac_address, self.modulation.diuc());
        let burst = MacPdu::generic(cid, ManagementMessage::RngReq(req).to_bytes()).to_bytes();
        self.stats.pdus_sent += 1;
        self.stats.bytes_sent += burst.len() as u64;
        tx.forward_down(burst, Modulation::Bpsk12);
        self.state = RangingState::WaitingRngRsp;
        self.timers.push(TimerRequest {
            delay: self.config.lost_rng_rsp_timeout,
            event: SsTimerEvent::LostRngRsp(self.rng_timer.arm()),
        });
        trace!("{}: RNG-REQ on {}", self.mac_address, cid);
    }

    /// Uses the allocations of the last UL-MAP: a ranging opportunity when
    /// ranging, otherwise the data grants addressed to the basic CID.
    pub fn transmit_uplink(&mut self, phy: &dyn WimaxPhy, tx: &mut dyn PhyTransmitter) {
        let Some(map) = self.ul_map.take() else {
            return;
        };
        match self.state {
            RangingState::Idle if self.has_ucd => {
                let contention = map
                    .ies
                    .iter()
                    .any(|ie| ie.cid.is_broadcast() && ie.uiuc == uiuc::INITIAL_RANGING);
                if contention {
                    self.send_rng_req(Cid::INITIAL_RANGING, tx);
                }
                return;
            }
            RangingState::Continue => {
                let Some(basic) = self.basic_cid else {
                    return;
                };
                if map
                    .ies
                    .iter()
                    .any(|ie| ie.cid == basic && ie.uiuc == uiuc::INITIAL_RANGING)
                {
                    self.send_rng_req(basic, tx);
                }
                return;
            }
            RangingState::Registered => {}
            _ => return,
        }

        let Some(basic) = self.basic_cid else {
            return;
        };
        let mut budget = 0;
        let mut modulation = self.modulation;
        for ie in map.ies.iter().filter(|ie| ie.cid == basic) {
            if let Some(m) = Modulation::from_uiuc(ie.uiuc) {
                budget += phy.nr_bytes(ie.duration as u32, m) as usize;
                modulation = m;
            }
        }
        if budget == 0 {
            return;
        }
        let pdus = self
            .scheduler
            .schedule(budget, &mut self.connections, self.sf_manager.base_mut());
        if pdus.is_empty() {
            return;
        }
        let mut burst = BytesMut::with_capacity(budget);
        for pdu in &pdus {
            pdu.serialize(&mut burst);
        }
        trace!(
            "{}: {} uplink PDUs, {}/{} bytes",
            self.mac_address,
            pdus.len(),
            burst.len(),
            budget
        );
        self.stats.pdus_sent += pdus.len() as u64;
        self.stats.bytes_sent += burst.len() as u64;
        tx.forward_down(burst.freeze(), modulation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bs::test_support::{management_burst, Capture};
    use crate::phy::OfdmPhy;
    use wimax_core::messages::{ConfirmationCode, Ucd, UlMapIe};
    use wimax_core::SchedulingType;

    fn ul_map(mut ies: Vec<UlMapIe>) -> Bytes {
        let end = ies.iter().map(|ie| ie.start_time + ie.duration).max().unwrap_or(0);
        ies.push(UlMapIe::end_of_map(end));
        let map = UlMap {
            ucd_count: 0,
            allocation_start_time: 178,
            ies,
        };
        management_burst(Cid::BROADCAST, ManagementMessage::UlMap(map))
    }

    fn contention_map() -> Bytes {
        ul_map(vec![UlMapIe::new(Cid::BROADCAST, uiuc::INITIAL_RANGING, 0, 12)])
    }

    fn ucd() -> Bytes {
        management_burst(Cid::BROADCAST, ManagementMessage::Ucd(Ucd::default()))
    }

    fn rng_rsp(mac: MacAddress, status: RangingStatus) -> Bytes {
        let rsp = RngRsp {
            mac_address: mac,
            ranging_status: status,
            basic_cid: Cid::new(1),
            primary_cid: Cid::new(0x0401),
            ..Default::default()
        };
        management_burst(Cid::INITIAL_RANGING, ManagementMessage::RngRsp(rsp))
    }

    fn station() -> SubscriberStationMac {
        SubscriberStationMac::new(MacAddress::from_index(1), Modulation::Qpsk12, MacConfig::default())
    }

    fn sent_messages(capture: &Capture) -> Vec<(Cid, ManagementMessage)> {
        capture.messages()
    }

    #[test]
    fn test_contention_ranging_waits_for_ucd() {
        let phy = OfdmPhy::default();
        let mut ss = station();
        let mut capture = Capture::default();
        ss.receive_burst(&contention_map(), SimTime::ZERO);
        ss.transmit_uplink(&phy, &mut capture);
        assert!(capture.bursts.is_empty());

        ss.receive_burst(&ucd(), SimTime::ZERO);
        ss.receive_burst(&contention_map(), SimTime::ZERO);
        ss.transmit_uplink(&phy, &mut capture);
        let sent = sent_messages(&capture);
        assert!(matches!(
            sent.as_slice(),
            [(Cid::INITIAL_RANGING, ManagementMessage::RngReq(req))] if req.mac_address == ss.mac_address()
        ));
        assert_eq!(ss.state(), RangingState::WaitingRngRsp);
        assert!(matches!(
            ss.take_timers().as_slice(),
            [TimerRequest { event: SsTimerEvent::LostRngRsp(_), .. }]
        ));
    }

    #[test]
    fn test_lost_rng_rsp_retries_then_aborts() {
        let config = MacConfig {
            max_rng_req_retries: 1,
            ..MacConfig::default()
        };
        let phy = OfdmPhy::default();
        let mut ss = SubscriberStationMac::new(MacAddress::from_index(2), Modulation::Qpsk12, config);
        ss.receive_burst(&ucd(), SimTime::ZERO);
        for round in 0..2 {
            let mut capture = Capture::default();
            ss.receive_burst(&contention_map(), SimTime::ZERO);
            ss.transmit_uplink(&phy, &mut capture);
            assert_eq!(capture.bursts.len(), 1, "round {}", round);
            let timers = ss.take_timers();
            ss.on_timer(timers[0].event, SimTime::from_millis(200));
        }
        assert_eq!(ss.state(), RangingState::Aborted);

        // a stale timer changes nothing
        ss.on_timer(SsTimerEvent::LostRngRsp(Timer::default().arm()), SimTime::from_secs(1));
        assert_eq!(ss.state(), RangingState::Aborted);
    }

    #[test]
    fn test_invited_ranging_on_basic_cid() {
        let phy = OfdmPhy::default();
        let mut ss = station();
        let mac = ss.mac_address();
        ss.receive_burst(&ucd(), SimTime::ZERO);
        ss.receive_burst(&contention_map(), SimTime::ZERO);
        ss.transmit_uplink(&phy, &mut Capture::default());

        ss.receive_burst(&rng_rsp(MacAddress::from_index(9), RangingStatus::Success), SimTime::ZERO);
        assert_eq!(ss.state(), RangingState::WaitingRngRsp);
        ss.receive_burst(&rng_rsp(mac, RangingStatus::Continue), SimTime::ZERO);
        assert_eq!(ss.state(), RangingState::Continue);
        assert_eq!(ss.basic_cid(), Some(Cid::new(1)));

        let mut capture = Capture::default();
        ss.receive_burst(
            &ul_map(vec![UlMapIe::new(Cid::new(1), uiuc::INITIAL_RANGING, 0, 4)]),
            SimTime::ZERO,
        );
        ss.transmit_uplink(&phy, &mut capture);
        assert!(matches!(
            sent_messages(&capture).as_slice(),
            [(cid, ManagementMessage::RngReq(_))] if *cid == Cid::new(1)
        ));
    }

    #[test]
    fn test_registration_starts_dsa_and_acks_response() {
        let phy = OfdmPhy::default();
        let mut ss = station();
        let mac = ss.mac_address();
        ss.add_service_flow(ServiceFlow::new(Direction::Up, SchedulingType::BestEffort), SimTime::ZERO);
        ss.receive_burst(&ucd(), SimTime::ZERO);
        ss.receive_burst(&contention_map(), SimTime::ZERO);
        ss.transmit_uplink(&phy, &mut Capture::default());
        ss.take_timers();
        ss.receive_burst(&rng_rsp(mac, RangingStatus::Success), SimTime::ZERO);
        assert!(ss.is_registered());
        assert!(matches!(
            ss.take_timers().as_slice(),
            [TimerRequest { event: SsTimerEvent::DsaRspTimeout(_), .. }]
        ));

        // a data grant on the basic CID carries the DSA-REQ
        let data_uiuc = Modulation::Qpsk12.uiuc();
        let mut capture = Capture::default();
        ss.receive_burst(&ul_map(vec![UlMapIe::new(Cid::new(1), data_uiuc, 0, 10)]), SimTime::ZERO);
        ss.transmit_uplink(&phy, &mut capture);
        let req = sent_messages(&capture)
            .into_iter()
            .find_map(|(cid, m)| match m {
                ManagementMessage::DsaReq(req) if cid == Cid::new(0x0401) => Some(req),
                _ => None,
            })
            .unwrap();

        let mut flow = ServiceFlow::from_tlv(&req.service_flow).unwrap();
        flow.sfid = 1;
        flow.cid = Some(Cid::new(0x0801));
        let rsp = DsaRsp {
            transaction_id: req.transaction_id,
            confirmation_code: ConfirmationCode::Success,
            service_flow: flow.to_tlv(),
        };
        ss.receive_burst(
            &management_burst(Cid::new(0x0401), ManagementMessage::DsaRsp(rsp)),
            SimTime::ZERO,
        );
        assert!(ss.service_flows().get_service_flow(1).unwrap().is_active());
        assert!(ss.connections().get_connection(Cid::new(0x0801)).is_some());
        assert!(ss.service_flow_manager().are_service_flows_allocated());

        let mut capture = Capture::default();
        ss.receive_burst(&ul_map(vec![UlMapIe::new(Cid::new(1), data_uiuc, 0, 10)]), SimTime::ZERO);
        ss.transmit_uplink(&phy, &mut capture);
        assert!(sent_messages(&capture)
            .iter()
            .any(|(_, m)| matches!(m, ManagementMessage::DsaAck(ack) if ack.transaction_id == req.transaction_id)));
    }
}

//! One base station and its subscriber stations driven by the event queue.
//!
//! Each frame the base station transmits its maps and downlink bursts at the
//! frame start; the subscribers answer in the uplink subframe that begins at
//! the UL-MAP allocation start time.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use wimax_core::{Direction, MacAddress, SchedulingType, Sfid, SimTime};
use wimax_mac::classifier::{CsParameters, IpcsClassifierRecord};
use wimax_mac::packet::PROTO_UDP;
use wimax_mac::{
    BaseStationMac, BsTimerEvent, OfdmPhy, ServiceFlow, SsTimerEvent, SubscriberStationMac,
    WimaxPhy,
};

use crate::channel::{Channel, ChannelStats};
use crate::engine::EventQueue;
use crate::traffic::{station_host, ArrivalProcess, TrafficSource, CORE_HOST};
use crate::ScenarioConfig;

const HOST_MASK: Ipv4Addr = Ipv4Addr::BROADCAST;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub station: usize,
    pub direction: Direction,
    pub scheduling_type: SchedulingType,
    /// UDP port the flow's classifier matches.
    pub port: u16,
    pub packet_size: usize,
    pub arrivals: ArrivalProcess,
    /// Packets to send before the source stops; unlimited when None.
    pub packets: Option<u64>,
}

impl FlowSpec {
    /// Offered load in bits per second.
    pub fn offered_rate(&self) -> u32 {
        let bits = (self.packet_size * 8) as f64;
        let rate = match self.arrivals {
            ArrivalProcess::Constant { interval } => bits / interval.as_secs_f64().max(1e-6),
            ArrivalProcess::Poisson { rate } => bits * rate,
        };
        rate.min(u32::MAX as f64) as u32
    }

    /// The provisioned flow: QoS from the class and offered load, and a
    /// classifier on the station's address and the flow's port.
    pub fn service_flow(&self, name: &str) -> ServiceFlow {
        let rate = self.offered_rate();
        let classifier = IpcsClassifierRecord::new(1, self.port)
            .with_protocol(PROTO_UDP)
            .with_dst_ports(self.port, self.port);
        let classifier = match self.direction {
            Direction::Down => classifier.with_dst_address(station_host(self.station), HOST_MASK),
            Direction::Up => classifier
                .with_src_address(station_host(self.station), HOST_MASK)
                .with_dst_address(CORE_HOST, HOST_MASK),
        };
        let flow = ServiceFlow::new(self.direction, self.scheduling_type)
            .with_service_class_name(name)
            .with_cs_parameters(CsParameters::new(classifier));
        match self.scheduling_type {
            SchedulingType::Ugs => {
                let interval = match self.arrivals {
                    ArrivalProcess::Constant { interval } => interval,
                    ArrivalProcess::Poisson { .. } => Duration::from_millis(20),
                };
                flow.with_unsolicited_grant_interval(interval.as_millis().clamp(1, 1000) as u16)
                    .with_max_sustained_traffic_rate(rate.saturating_add(rate / 10))
                    .with_min_reserved_traffic_rate(rate)
                    .with_maximum_latency(100)
                    .with_tolerated_jitter(20)
            }
            SchedulingType::Rtps => flow
                .with_unsolicited_polling_interval(20)
                .with_max_sustained_traffic_rate(rate.saturating_mul(2))
                .with_min_reserved_traffic_rate(rate)
                .with_maximum_latency(100),
            SchedulingType::Nrtps => flow
                .with_unsolicited_polling_interval(100)
                .with_min_reserved_traffic_rate(rate)
                .with_traffic_priority(2),
            _ => flow,
        }
    }
}

#[derive(Debug, Clone)]
enum Event {
    Frame,
    Uplink,
    BsTimer(BsTimerEvent),
    SsTimer(usize, SsTimerEvent),
    Arrival(usize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivered {
    pub packets: u64,
    pub bytes: u64,
}

struct Flow {
    spec: FlowSpec,
    name: String,
    source: TrafficSource,
}

pub struct Network {
    phy: OfdmPhy,
    bs: BaseStationMac,
    stations: Vec<SubscriberStationMac>,
    flows: Vec<Flow>,
    events: EventQueue<Event>,
    downlink: Channel,
    uplink: Channel,
    /// Offset of the uplink subframe from the frame start.
    uplink_offset: Duration,
    frames: u64,
    seed: u64,
    delivered: BTreeMap<(Direction, Sfid), Delivered>,
    traffic_end: Option<SimTime>,
}

impl Network {
    pub fn new(config: &ScenarioConfig) -> Self {
        let (downlink_symbols, _) = config.mac.subframe_symbols(&config.phy);
        let uplink_offset =
            config.phy.symbol_duration() * (downlink_symbols + config.mac.ttg_symbols);
        let bs = BaseStationMac::new(MacAddress::from_index(0), config.mac.clone());
        let stations = (0..config.stations)
            .map(|i| {
                SubscriberStationMac::new(
                    MacAddress::from_index(i as u32 + 1),
                    config.modulation,
                    config.mac.clone(),
                )
            })
            .collect();
        info!(
            "Network with {} stations, uplink subframe at +{:?}",
            config.stations, uplink_offset
        );
        let mut network = Self {
            phy: config.phy.clone(),
            bs,
            stations,
            flows: Vec::new(),
            events: EventQueue::new(),
            downlink: Channel::new(config.packet_loss, config.seed),
            uplink: Channel::new(config.packet_loss, config.seed.wrapping_add(1)),
            uplink_offset,
            frames: 0,
            seed: config.seed,
            delivered: BTreeMap::new(),
            traffic_end: None,
        };
        network.events.schedule(SimTime::ZERO, Event::Frame);
        network.collect_timers();
        network
    }

    pub fn now(&self) -> SimTime {
        self.events.now()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn base_station(&self) -> &BaseStationMac {
        &self.bs
    }

    pub fn stations(&self) -> &[SubscriberStationMac] {
        &self.stations
    }

    pub fn downlink_stats(&self) -> &ChannelStats {
        self.downlink.stats()
    }

    pub fn uplink_stats(&self) -> &ChannelStats {
        self.uplink.stats()
    }

    /// Provisions a flow on its station and attaches a traffic source.
    /// Returns the flow's index.
    pub fn add_flow(&mut self, spec: FlowSpec) -> Result<usize> {
        if spec.station >= self.stations.len() {
            bail!(
                "flow on station {} but the network has {}",
                spec.station,
                self.stations.len()
            );
        }
        let index = self.flows.len();
        let seed = self.seed.wrapping_mul(1000).wrapping_add(index as u64 + 2);
        let mut source = TrafficSource::new(
            spec.station,
            spec.direction,
            spec.port,
            spec.packet_size,
            spec.arrivals,
            seed,
        )?;
        if let Some(packets) = spec.packets {
            source = source.with_limit(packets);
        }
        let name = format!("flow-{}", index);
        let now = self.now();
        self.stations[spec.station].add_service_flow(spec.service_flow(&name), now);
        self.collect_timers();
        self.flows.push(Flow { spec, name, source });
        Ok(index)
    }

    pub fn flow_spec(&self, index: usize) -> Option<&FlowSpec> {
        self.flows.get(index).map(|f| &f.spec)
    }

    pub fn flow_source(&self, index: usize) -> Option<&TrafficSource> {
        self.flows.get(index).map(|f| &f.source)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// SFID the base station assigned to flow `index`, once admitted.
    pub fn flow_sfid(&self, index: usize) -> Option<Sfid> {
        let flow = self.flows.get(index)?;
        self.stations[flow.spec.station]
            .service_flows()
            .flows()
            .find(|f| f.service_class_name == flow.name && f.sfid != 0)
            .map(|f| f.sfid)
    }

    pub fn delivered(&self, direction: Direction, sfid: Sfid) -> Delivered {
        self.delivered
            .get(&(direction, sfid))
            .copied()
            .unwrap_or_default()
    }

    /// True once every station is registered and every admitted flow is
    /// active on both ends.
    pub fn is_provisioned(&self) -> bool {
        self.stations.iter().all(|ss| {
            ss.is_registered()
                && ss.service_flow_manager().are_service_flows_allocated()
                && ss.service_flows().flows().filter(|f| f.is_active()).all(|f| {
                    self.bs
                        .service_flows()
                        .get_service_flow(f.sfid)
                        .is_some_and(|b| b.is_active())
                })
        })
    }

    /// Runs until provisioned or `deadline`, whichever comes first.
    pub fn run_until_provisioned(&mut self, deadline: SimTime) -> bool {
        loop {
            if self.is_provisioned() {
                info!("Provisioned after {} frames at {:?}", self.frames, self.now());
                return true;
            }
            match self.events.peek_time() {
                Some(at) if at <= deadline => self.step(),
                _ => return false,
            }
        }
    }

    /// Starts every source now; sources stop after `duration` if given.
    pub fn start_traffic(&mut self, duration: Option<Duration>) {
        let now = self.now();
        self.traffic_end = duration.map(|d| now + d);
        for index in 0..self.flows.len() {
            self.events.schedule(now, Event::Arrival(index));
        }
    }

    pub fn run_until(&mut self, end: SimTime) {
        while self.events.peek_time().is_some_and(|at| at <= end) {
            self.step();
        }
    }

    fn step(&mut self) {
        let Some((now, event)) = self.events.pop() else {
            return;
        };
        match event {
            Event::Frame => self.frame(now),
            Event::Uplink => self.uplink_subframe(now),
            Event::BsTimer(event) => self.bs.on_timer(event, now),
            Event::SsTimer(index, event) => self.stations[index].on_timer(event, now),
            Event::Arrival(index) => self.arrival(index, now),
        }
        self.collect_timers();
        self.collect_deliveries();
    }

    fn frame(&mut self, now: SimTime) {
        self.frames += 1;
        self.bs.start_frame(now, &self.phy, &mut self.downlink);
        for (burst, _) in self.downlink.take_bursts() {
            for ss in &mut self.stations {
                ss.receive_burst(&burst, now);
            }
        }
        self.events.schedule_in(self.uplink_offset, Event::Uplink);
        self.events.schedule_in(self.phy.frame_duration(), Event::Frame);
    }

    fn uplink_subframe(&mut self, now: SimTime) {
        for ss in &mut self.stations {
            ss.transmit_uplink(&self.phy, &mut self.uplink);
        }
        for (burst, _) in self.uplink.take_bursts() {
            self.bs.receive_burst(&burst, now);
        }
    }

    fn arrival(&mut self, index: usize, now: SimTime) {
        if self.traffic_end.is_some_and(|end| now >= end) {
            return;
        }
        let flow = &mut self.flows[index];
        let Some(packet) = flow.source.next_packet() else {
            return;
        };
        let result = match flow.spec.direction {
            Direction::Down => self.bs.enqueue(packet, now),
            Direction::Up => self.stations[flow.spec.station].enqueue(packet, now),
        };
        if let Err(e) = result {
            debug!("{} packet refused: {}", flow.name, e);
            flow.source.record_rejected();
        }
        if !flow.source.is_exhausted() {
            let gap = flow.source.next_gap();
            self.events.schedule_in(gap, Event::Arrival(index));
        }
    }

    fn collect_timers(&mut self) {
        for request in self.bs.take_timers() {
            self.events
                .schedule_in(request.delay, Event::BsTimer(request.event));
        }
        for (index, ss) in self.stations.iter_mut().enumerate() {
            for request in ss.take_timers() {
                self.events
                    .schedule_in(request.delay, Event::SsTimer(index, request.event));
            }
        }
    }

    fn collect_deliveries(&mut self) {
        let uplink = self.bs.take_received().into_iter().map(|r| (Direction::Up, r));
        let downlink: Vec<_> = self
            .stations
            .iter_mut()
            .flat_map(|ss| ss.take_received())
            .map(|r| (Direction::Down, r))
            .collect();
        for (direction, (sfid, sdu)) in uplink.chain(downlink) {
            let entry = self.delivered.entry((direction, sfid)).or_default();
            entry.packets += 1;
            entry.bytes += sdu.len() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wimax_mac::RangingState;

    fn config(stations: usize) -> ScenarioConfig {
        ScenarioConfig {
            stations,
            ..Default::default()
        }
    }

    #[test]
    fn test_stations_register() {
        let mut network = Network::new(&config(3));
        assert!(network.run_until_provisioned(SimTime::from_secs(5)));
        assert!(network
            .stations()
            .iter()
            .all(|ss| ss.state() == RangingState::Registered));
        assert_eq!(network.base_station().ss_manager().n_registered(), 3);

        let basics: Vec<_> = network.stations().iter().map(|ss| ss.basic_cid()).collect();
        assert!(basics.iter().all(Option::is_some));
        assert_ne!(basics[0], basics[1]);
    }

    #[test]
    fn test_uplink_subframe_follows_downlink() {
        let network = Network::new(&config(1));
        // 176 downlink symbols plus a two symbol TTG at 28us
        assert_eq!(network.uplink_offset, Duration::from_micros(28 * 178));
    }

    #[test]
    fn test_flow_on_missing_station_is_rejected() {
        let mut network = Network::new(&config(1));
        let spec = FlowSpec {
            station: 4,
            direction: Direction::Up,
            scheduling_type: SchedulingType::BestEffort,
            port: 7000,
            packet_size: 100,
            arrivals: ArrivalProcess::Poisson { rate: 10.0 },
            packets: None,
        };
        assert!(network.add_flow(spec).is_err());
    }

    #[test]
    fn test_traffic_before_admission_is_counted() {
        let mut network = Network::new(&config(1));
        let index = network
            .add_flow(FlowSpec {
                station: 0,
                direction: Direction::Up,
                scheduling_type: SchedulingType::BestEffort,
                port: 7000,
                packet_size: 100,
                arrivals: ArrivalProcess::Constant {
                    interval: Duration::from_millis(10),
                },
                packets: Some(3),
            })
            .unwrap();
        network.start_traffic(None);
        network.run_until(SimTime::from_millis(25));
        let stats = network.flow_source(index).unwrap().stats();
        assert_eq!(stats.offered_packets, 3);
        assert_eq!(stats.rejected_packets, 3);
    }
}

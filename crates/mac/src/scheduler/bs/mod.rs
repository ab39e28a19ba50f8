//! Downlink schedulers. Each frame they drain connection queues into
//! per-connection bursts that fit the downlink subframe.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use wimax_core::header::GENERIC_MAC_HEADER_SIZE;
use wimax_core::messages::DlMapIe;
use wimax_core::{
    Cid, CidType, FragmentControl, MacHeaderType, MacPdu, Modulation, SchedulingType, SimTime,
    WireFormat,
};

use crate::connection_manager::ConnectionManager;
use crate::phy::WimaxPhy;
use crate::service_flow::ServiceFlow;
use crate::sf_manager::ServiceFlowManager;
use crate::ss_record::SsManager;
use crate::BsSchedulerType;

pub mod rtps;
pub mod simple;

pub use rtps::RtpsBsScheduler;
pub use simple::SimpleBsScheduler;

pub struct DownlinkContext<'a> {
    pub connections: &'a mut ConnectionManager,
    pub flows: &'a mut ServiceFlowManager,
    pub ss_manager: &'a SsManager,
    pub phy: &'a dyn WimaxPhy,
    /// First symbol available to data bursts, after the DL-MAP.
    pub first_symbol: u32,
    pub available_symbols: u32,
    /// DL-MAP IEs reserved for data bursts; no more bursts than this are built.
    pub max_bursts: usize,
    pub now: SimTime,
    pub frame_duration: Duration,
}

/// One connection's share of the downlink subframe.
#[derive(Debug, Clone)]
pub struct DownlinkBurst {
    pub ie: DlMapIe,
    pub modulation: Modulation,
    pub pdus: Vec<MacPdu>,
    pub symbols: u32,
}

impl DownlinkBurst {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.pdus.iter().map(WireFormat::serialized_size).sum());
        for pdu in &self.pdus {
            pdu.serialize(&mut buf);
        }
        buf.freeze()
    }
}

pub trait BsScheduler {
    /// Ordered bursts whose symbols sum to at most `ctx.available_symbols`.
    fn schedule(&mut self, ctx: &mut DownlinkContext<'_>) -> Vec<DownlinkBurst>;
}

#[derive(Debug)]
pub enum BsSchedulerKind {
    Simple(SimpleBsScheduler),
    Rtps(RtpsBsScheduler),
}

impl BsSchedulerKind {
    pub fn new(scheduler_type: BsSchedulerType) -> Self {
        match scheduler_type {
            BsSchedulerType::Simple => Self::Simple(SimpleBsScheduler::default()),
            BsSchedulerType::Rtps => Self::Rtps(RtpsBsScheduler::default()),
        }
    }
}

impl BsScheduler for BsSchedulerKind {
    fn schedule(&mut self, ctx: &mut DownlinkContext<'_>) -> Vec<DownlinkBurst> {
        match self {
            Self::Simple(s) => s.schedule(ctx),
            Self::Rtps(s) => s.schedule(ctx),
        }
    }
}

/// Modulation a connection's bursts go out with.
pub fn connection_modulation(ctx: &DownlinkContext<'_>, cid: Cid, cid_type: CidType) -> Modulation {
    match cid_type {
        CidType::Basic | CidType::Primary => ctx
            .ss_manager
            .get_by_cid(cid)
            .map_or(Modulation::Bpsk12, |ss| ss.modulation),
        CidType::Transport => ctx
            .flows
            .get_service_flow_by_cid(cid)
            .map_or(Modulation::Bpsk12, |f| f.modulation),
        _ => Modulation::Bpsk12,
    }
}

/// Bytes a UGS connection may send this frame: the flow's per-frame rate,
/// at least its head packet, at most its backlog.
pub fn ugs_burst_bytes(ctx: &DownlinkContext<'_>, cid: Cid) -> usize {
    let Some(connection) = ctx.connections.get_connection(cid) else {
        return 0;
    };
    let queue = connection.queue();
    let quota = ctx
        .flows
        .get_service_flow_by_cid(cid)
        .map_or(0, |flow| per_frame_quota(flow, ctx.frame_duration));
    (quota + GENERIC_MAC_HEADER_SIZE)
        .max(queue.first_packet_required_bytes(MacHeaderType::Generic))
        .min(queue.queue_length_with_mac_overhead())
}

fn per_frame_quota(flow: &ServiceFlow, frame_duration: Duration) -> usize {
    let bits = flow.max_sustained_traffic_rate as u128 * frame_duration.as_nanos();
    bits.div_ceil(8_000_000_000) as usize
}

/// Collects bursts for one frame, laying them out back to back.
pub struct DownlinkBuilder {
    next_symbol: u32,
    available: u32,
    used: u32,
    bursts: Vec<DownlinkBurst>,
}

impl DownlinkBuilder {
    pub fn new(first_symbol: u32, available_symbols: u32) -> Self {
        Self {
            next_symbol: first_symbol,
            available: available_symbols,
            used: 0,
            bursts: Vec::new(),
        }
    }

    pub fn remaining_symbols(&self) -> u32 {
        self.available - self.used
    }

    pub fn used_symbols(&self) -> u32 {
        self.used
    }

    pub fn add_downlink_burst(&mut self, cid: Cid, modulation: Modulation, pdus: Vec<MacPdu>, symbols: u32) {
        let ie = DlMapIe::new(cid, modulation.diuc(), self.next_symbol as u16);
        trace!("DL burst {} {:?}: {} PDUs in {} symbols", cid, modulation, pdus.len(), symbols);
        self.next_symbol += symbols;
        self.used += symbols;
        self.bursts.push(DownlinkBurst {
            ie,
            modulation,
            pdus,
            symbols,
        });
    }

    /// Drains `cid` into one burst of at most `max_symbols`. Packets go out
    /// whole unless the connection may fragment. Returns the symbols used.
    pub fn fill_connection(&mut self, ctx: &mut DownlinkContext<'_>, cid: Cid, max_symbols: u32) -> u32 {
        let cap = max_symbols.min(self.remaining_symbols());
        let Some(cid_type) = ctx.connections.get_connection(cid).map(|c| c.cid_type()) else {
            return 0;
        };
        let modulation = connection_modulation(ctx, cid, cid_type);
        let budget = ctx.phy.nr_bytes(cap, modulation) as usize;
        self.pack(ctx, cid, modulation, budget)
    }

    /// Sends a whole UGS burst or nothing.
    pub fn create_ugs_burst(&mut self, ctx: &mut DownlinkContext<'_>, cid: Cid) -> bool {
        let modulation = connection_modulation(ctx, cid, CidType::Transport);
        let bytes = ugs_burst_bytes(ctx, cid);
        let symbols = ctx.phy.nr_symbols(bytes as u32, modulation);
        if bytes == 0 || symbols > self.remaining_symbols() {
            return false;
        }
        self.pack(ctx, cid, modulation, bytes) > 0
    }

    fn pack(&mut self, ctx: &mut DownlinkContext<'_>, cid: Cid, modulation: Modulation, budget: usize) -> u32 {
        if self.bursts.len() >= ctx.max_bursts {
            trace!("DL-MAP full at {} bursts, {} waits", self.bursts.len(), cid);
            return 0;
        }
        let Some(connection) = ctx.connections.get_connection_mut(cid) else {
            return 0;
        };
        let mut left = budget;
        let mut pdus = Vec::new();
        while let Some(pdu) = connection.dequeue_with_budget(MacHeaderType::Generic, left) {
            left -= pdu.serialized_size();
            pdus.push(pdu);
        }
        if pdus.is_empty() {
            return 0;
        }
        if let Some(flow) = ctx.flows.get_service_flow_by_cid_mut(cid) {
            for pdu in &pdus {
                let complete = pdu
                    .fragmentation()
                    .map_or(true, |f| {
                        matches!(f.fc, FragmentControl::Unfragmented | FragmentControl::Last)
                    });
                flow.record.record_sent(pdu.payload().len(), complete);
            }
        }
        let symbols = ctx.phy.nr_symbols((budget - left) as u32, modulation);
        self.add_downlink_burst(cid, modulation, pdus, symbols);
        symbols
    }

    pub fn finish(self) -> Vec<DownlinkBurst> {
        self.bursts
    }
}

/// Serves UGS connections in CID order. Returns false when their demand
/// covers the whole subframe, in which case nothing else may be scheduled.
pub fn serve_ugs(builder: &mut DownlinkBuilder, ctx: &mut DownlinkContext<'_>) -> bool {
    let ugs = ctx
        .connections
        .backlogged_cids(CidType::Transport, SchedulingType::Ugs);
    let mut demand = 0;
    for cid in &ugs {
        let modulation = connection_modulation(ctx, *cid, CidType::Transport);
        demand += ctx.phy.nr_symbols(ugs_burst_bytes(ctx, *cid) as u32, modulation);
    }
    for cid in &ugs {
        builder.create_ugs_burst(ctx, *cid);
    }
    if demand >= ctx.available_symbols && demand > 0 {
        debug!(
            "UGS demand {} symbols covers the {} available, starving other classes",
            demand, ctx.available_symbols
        );
        return false;
    }
    true
}

/// Broadcast and initial-ranging connections, in that order.
pub fn serve_fixed_management(builder: &mut DownlinkBuilder, ctx: &mut DownlinkContext<'_>) {
    for cid in [Cid::BROADCAST, Cid::INITIAL_RANGING] {
        let backlogged = ctx.connections.get_connection(cid).is_some_and(|c| c.has_packets());
        if backlogged && builder.remaining_symbols() > 0 {
            builder.fill_connection(ctx, cid, u32::MAX);
        }
    }
}

/// Backlogged basic and primary connections in CID order.
pub fn management_cids(ctx: &DownlinkContext<'_>) -> Vec<Cid> {
    let mut cids = ctx
        .connections
        .backlogged_cids(CidType::Basic, SchedulingType::None);
    cids.extend(ctx.connections.backlogged_cids(CidType::Primary, SchedulingType::None));
    cids.sort();
    cids
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::phy::OfdmPhy;
    use crate::service_flow::ServiceFlowState;
    use wimax_core::{CidFactory, Direction, Sfid};

    pub struct Fixture {
        pub factory: CidFactory,
        pub connections: ConnectionManager,
        pub flows: ServiceFlowManager,
        pub ss_manager: SsManager,
        pub phy: OfdmPhy,
        pub max_bursts: usize,
        next_sfid: Sfid,
    }

    impl Fixture {
        pub fn new() -> Self {
            let mut connections = ConnectionManager::new(1024);
            connections.add_connection(connections.new_connection(Cid::BROADCAST, CidType::Broadcast));
            connections.add_connection(connections.new_connection(Cid::INITIAL_RANGING, CidType::InitialRanging));
            Self {
                factory: CidFactory::new(),
                connections,
                flows: ServiceFlowManager::new(),
                ss_manager: SsManager::new(),
                phy: OfdmPhy::default(),
                max_bursts: usize::MAX,
                next_sfid: 1,
            }
        }

        pub fn add_flow(&mut self, scheduling_type: SchedulingType, rate: u32) -> Cid {
            let cid = self
                .connections
                .create_connection(CidType::Transport, &mut self.factory)
                .unwrap();
            let sfid = self.next_sfid;
            self.next_sfid += 1;
            let mut flow = ServiceFlow::new(Direction::Down, scheduling_type)
                .with_max_sustained_traffic_rate(rate);
            flow.sfid = sfid;
            flow.cid = Some(cid);
            flow.state = ServiceFlowState::Active;
            flow.modulation = Modulation::Qpsk12;
            self.flows.add_service_flow(flow);
            self.connections
                .get_connection_mut(cid)
                .unwrap()
                .set_service_flow(sfid, scheduling_type);
            cid
        }

        pub fn fill(&mut self, cid: Cid, packets: usize, size: usize) {
            let connection = self.connections.get_connection_mut(cid).unwrap();
            for _ in 0..packets {
                connection.enqueue_sdu(Bytes::from(vec![0xA5; size]), SimTime::ZERO);
            }
        }

        pub fn run(&mut self, scheduler: &mut dyn BsScheduler, available_symbols: u32) -> Vec<DownlinkBurst> {
            let mut ctx = DownlinkContext {
                connections: &mut self.connections,
                flows: &mut self.flows,
                ss_manager: &self.ss_manager,
                phy: &self.phy,
                first_symbol: 3,
                available_symbols,
                max_bursts: self.max_bursts,
                now: SimTime::ZERO,
                frame_duration: Duration::from_millis(10),
            };
            scheduler.schedule(&mut ctx)
        }
    }

    pub fn symbols_for(bursts: &[DownlinkBurst], cid: Cid) -> u32 {
        bursts.iter().filter(|b| b.ie.cid == cid).map(|b| b.symbols).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn kinds() -> [BsSchedulerKind; 2] {
        [
            BsSchedulerKind::new(BsSchedulerType::Simple),
            BsSchedulerKind::new(BsSchedulerType::Rtps),
        ]
    }

    #[test]
    fn test_bursts_never_exceed_available_symbols() {
        for mut scheduler in kinds() {
            let mut fixture = Fixture::new();
            let mut cids = Vec::new();
            for (i, class) in [
                SchedulingType::Ugs,
                SchedulingType::Rtps,
                SchedulingType::Nrtps,
                SchedulingType::BestEffort,
                SchedulingType::Rtps,
            ]
            .into_iter()
            .enumerate()
            {
                let cid = fixture.add_flow(class, 64_000 * (i as u32 + 1));
                cids.push(cid);
            }
            let broadcast = fixture.connections.get_connection_mut(Cid::BROADCAST).unwrap();
            broadcast.enqueue_sdu(Bytes::from(vec![1u8; 90]), SimTime::ZERO);

            for (round, available) in [0u32, 1, 5, 17, 40, 176].into_iter().cycle().take(30).enumerate() {
                for (i, cid) in cids.iter().enumerate() {
                    fixture.fill(*cid, 1 + (round + i) % 3, 40 + 37 * i);
                }
                let bursts = fixture.run(&mut scheduler, available);
                let total: u32 = bursts.iter().map(|b| b.symbols).sum();
                assert!(total <= available, "{} > {}", total, available);

                let mut next = 3;
                for burst in &bursts {
                    assert_eq!(burst.ie.start_time as u32, next);
                    let bytes = burst.to_bytes().len() as u32;
                    assert!(bytes <= fixture.phy.nr_bytes(burst.symbols, burst.modulation));
                    next += burst.symbols;
                }
            }
        }
    }

    #[test]
    fn test_ugs_overload_starves_every_other_class() {
        for mut scheduler in kinds() {
            let mut fixture = Fixture::new();
            // 1 Mbit/s over a 10 ms frame: 1250 bytes, 53 QPSK symbols each
            let ugs_a = fixture.add_flow(SchedulingType::Ugs, 1_000_000);
            let ugs_b = fixture.add_flow(SchedulingType::Ugs, 1_000_000);
            let rtps = fixture.add_flow(SchedulingType::Rtps, 0);
            let be = fixture.add_flow(SchedulingType::BestEffort, 0);
            fixture.fill(ugs_a, 20, 250);
            fixture.fill(ugs_b, 20, 250);
            fixture.fill(rtps, 5, 100);
            fixture.fill(be, 5, 100);
            fixture.connections
                .get_connection_mut(Cid::BROADCAST)
                .unwrap()
                .enqueue_sdu(Bytes::from_static(b"dcd"), SimTime::ZERO);

            let bursts = fixture.run(&mut scheduler, 60);
            assert_eq!(symbols_for(&bursts, rtps), 0);
            assert_eq!(symbols_for(&bursts, be), 0);
            assert_eq!(symbols_for(&bursts, Cid::BROADCAST), 0);
            assert!(bursts.iter().all(|b| b.ie.cid == ugs_a || b.ie.cid == ugs_b));
            assert!(symbols_for(&bursts, ugs_a) > 0);
        }
    }

    #[test]
    fn test_transport_packets_fragment_to_fill_the_burst() {
        let mut scheduler = BsSchedulerKind::new(BsSchedulerType::Simple);
        let mut fixture = Fixture::new();
        let be = fixture.add_flow(SchedulingType::BestEffort, 0);
        fixture.fill(be, 1, 500);

        let first = fixture.run(&mut scheduler, 10);
        assert_eq!(first.len(), 1);
        let pdu = &first[0].pdus[0];
        assert_eq!(pdu.fragmentation().unwrap().fc, FragmentControl::First);
        assert_eq!(pdu.serialized_size(), 240);
        let sent = fixture.flows.get_service_flow_by_cid(be).unwrap().record.clone();
        assert_eq!(sent.bytes_sent, 233);
        assert_eq!(sent.pkts_sent, 0);

        fixture.run(&mut scheduler, 100);
        let sent = &fixture.flows.get_service_flow_by_cid(be).unwrap().record;
        assert_eq!(sent.bytes_sent, 500);
        assert_eq!(sent.pkts_sent, 1);
        assert!(!fixture.connections.get_connection(be).unwrap().has_packets());
    }

    #[test]
    fn test_bursts_limited_to_reserved_map_entries() {
        for mut scheduler in kinds() {
            let mut fixture = Fixture::new();
            fixture.max_bursts = 2;
            let cids: Vec<Cid> = (0..4)
                .map(|_| fixture.add_flow(SchedulingType::BestEffort, 0))
                .collect();
            for cid in &cids {
                fixture.fill(*cid, 1, 100);
            }
            let bursts = fixture.run(&mut scheduler, 176);
            assert_eq!(bursts.len(), 2);
            let waiting = cids
                .iter()
                .filter(|cid| fixture.connections.get_connection(**cid).unwrap().has_packets())
                .count();
            assert_eq!(waiting, 2);
        }
    }
}

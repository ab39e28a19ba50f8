//! Uplink schedulers. Each frame they turn ranging needs, unsolicited
//! grants, polls and outstanding bandwidth requests into UL-MAP IEs.

use std::collections::BTreeMap;

use log::{debug, warn};
use wimax_core::messages::UlMapIe;
use wimax_core::{
    BandwidthRequestHeader, BandwidthRequestType, Cid, Direction, SchedulingType, Sfid, SimTime,
};

use crate::phy::WimaxPhy;
use crate::service_flow::ServiceFlow;
use crate::sf_manager::ServiceFlowManager;
use crate::ss_record::{SsManager, SsRecord};
use crate::{MacConfig, UplinkSchedulerType};

pub mod allocator;
pub mod job;
pub mod mbqos;
pub mod rtps;
pub mod simple;

pub use allocator::{calculate_allocation_start_time, UplinkAllocator};
pub use job::{JobPriority, PriorityUlJob, ReqType, UlJob};
pub use mbqos::MbqosUplinkScheduler;
pub use rtps::RtpsUplinkScheduler;
pub use simple::SimpleUplinkScheduler;

/// Everything an uplink pass reads or books grants against.
pub struct UplinkContext<'a> {
    pub ss_manager: &'a mut SsManager,
    pub flows: &'a mut ServiceFlowManager,
    pub phy: &'a dyn WimaxPhy,
    pub config: &'a MacConfig,
    pub available_symbols: u32,
    pub now: SimTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkSchedule {
    pub allocation_start_time: u32,
    /// IEs in allocation order, terminated by the end-of-map IE.
    pub ies: Vec<UlMapIe>,
    pub symbols_used: u32,
}

pub trait UplinkScheduler {
    fn init_once(&mut self, config: &MacConfig);

    fn schedule(&mut self, ctx: &mut UplinkContext<'_>) -> UplinkSchedule;

    fn process_bandwidth_request(
        &mut self,
        header: &BandwidthRequestHeader,
        ss_manager: &mut SsManager,
        flows: &mut ServiceFlowManager,
        now: SimTime,
    );

    /// Registers an admitted uplink flow for grants or polls.
    fn setup_service_flow(&mut self, ss: &SsRecord, flow: &ServiceFlow, now: SimTime);

    /// Forgets a flow whose admission was rolled back.
    fn remove_service_flow(&mut self, sfid: Sfid);

    fn on_window_timer(&mut self, flows: &mut ServiceFlowManager);
}

#[derive(Debug)]
pub enum UplinkSchedulerKind {
    Simple(SimpleUplinkScheduler),
    Rtps(RtpsUplinkScheduler),
    Mbqos(MbqosUplinkScheduler),
}

impl UplinkSchedulerKind {
    pub fn new(scheduler_type: UplinkSchedulerType, config: &MacConfig) -> Self {
        let mut scheduler = match scheduler_type {
            UplinkSchedulerType::Simple => Self::Simple(SimpleUplinkScheduler::default()),
            UplinkSchedulerType::Rtps => Self::Rtps(RtpsUplinkScheduler::default()),
            UplinkSchedulerType::Mbqos => Self::Mbqos(MbqosUplinkScheduler::default()),
        };
        scheduler.init_once(config);
        scheduler
    }

    fn inner(&mut self) -> &mut dyn UplinkScheduler {
        match self {
            Self::Simple(s) => s,
            Self::Rtps(s) => s,
            Self::Mbqos(s) => s,
        }
    }
}

impl UplinkScheduler for UplinkSchedulerKind {
    fn init_once(&mut self, config: &MacConfig) {
        self.inner().init_once(config)
    }

    fn schedule(&mut self, ctx: &mut UplinkContext<'_>) -> UplinkSchedule {
        self.inner().schedule(ctx)
    }

    fn process_bandwidth_request(
        &mut self,
        header: &BandwidthRequestHeader,
        ss_manager: &mut SsManager,
        flows: &mut ServiceFlowManager,
        now: SimTime,
    ) {
        self.inner()
            .process_bandwidth_request(header, ss_manager, flows, now)
    }

    fn setup_service_flow(&mut self, ss: &SsRecord, flow: &ServiceFlow, now: SimTime) {
        self.inner().setup_service_flow(ss, flow, now)
    }

    fn remove_service_flow(&mut self, sfid: Sfid) {
        self.inner().remove_service_flow(sfid)
    }

    fn on_window_timer(&mut self, flows: &mut ServiceFlowManager) {
        self.inner().on_window_timer(flows)
    }
}

/// Books a bandwidth request against the flow or, for management CIDs, the
/// station. Returns the flow it was booked against.
pub fn record_bandwidth_request(
    header: &BandwidthRequestHeader,
    ss_manager: &mut SsManager,
    flows: &mut ServiceFlowManager,
) -> Option<Sfid> {
    if let Some(ss) = ss_manager.get_mut_by_cid(header.cid) {
        ss.management_bytes_requested = match header.request_type {
            BandwidthRequestType::Aggregate => header.br,
            BandwidthRequestType::Incremental => {
                ss.management_bytes_requested.saturating_add(header.br)
            }
        };
        debug!("{} requests {} management bytes", ss.mac_address, ss.management_bytes_requested);
        return None;
    }
    let Some(flow) = flows.get_service_flow_by_cid_mut(header.cid) else {
        warn!("Bandwidth request for unknown connection {}", header.cid);
        return None;
    };
    match header.request_type {
        BandwidthRequestType::Aggregate => flow.record.set_aggregate_request(header.br),
        BandwidthRequestType::Incremental => flow.record.add_incremental_request(header.br),
    }
    debug!(
        "Flow {} ({:?}) requests {:?} {} bytes",
        flow.sfid, flow.scheduling_type, header.request_type, header.br
    );
    Some(flow.sfid)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkFlowEntry {
    pub sfid: Sfid,
    pub basic_cid: Cid,
    pub scheduling_type: SchedulingType,
    pub next_grant: SimTime,
    pub next_poll: SimTime,
}

/// Grant and poll timing of every admitted uplink flow, plus the frame counter
/// driving the contention ranging region.
#[derive(Debug, Default)]
pub struct UplinkFlowTable {
    entries: BTreeMap<Sfid, UplinkFlowEntry>,
    basic_polls: BTreeMap<Cid, SimTime>,
    frame: u64,
}

impl UplinkFlowTable {
    pub fn setup(&mut self, ss: &SsRecord, flow: &ServiceFlow, now: SimTime) {
        if flow.direction != Direction::Up {
            return;
        }
        self.entries.insert(
            flow.sfid,
            UplinkFlowEntry {
                sfid: flow.sfid,
                basic_cid: ss.basic_cid,
                scheduling_type: flow.scheduling_type,
                next_grant: now,
                next_poll: now,
            },
        );
    }

    pub fn remove(&mut self, sfid: Sfid) -> Option<UplinkFlowEntry> {
        self.entries.remove(&sfid)
    }

    pub fn get(&self, sfid: Sfid) -> Option<&UplinkFlowEntry> {
        self.entries.get(&sfid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances the frame counter; true when this frame carries the contention ranging region.
    pub fn begin_frame(&mut self, config: &MacConfig) -> bool {
        let due = self.frame % config.frames_in(config.initial_ranging_interval) == 0;
        self.frame += 1;
        due
    }

    /// Flows of `basic_cid` with the given class, in SFID order.
    pub fn flows_of(&self, basic_cid: Cid, scheduling_type: SchedulingType) -> Vec<Sfid> {
        self.entries
            .values()
            .filter(|e| e.basic_cid == basic_cid && e.scheduling_type == scheduling_type)
            .map(|e| e.sfid)
            .collect()
    }

    pub fn flows_of_class(&self, scheduling_type: SchedulingType) -> Vec<Sfid> {
        self.entries
            .values()
            .filter(|e| e.scheduling_type == scheduling_type)
            .map(|e| e.sfid)
            .collect()
    }

    pub fn grant_due(&self, sfid: Sfid, now: SimTime) -> bool {
        self.entries.get(&sfid).is_some_and(|e| now >= e.next_grant)
    }

    pub fn mark_granted(&mut self, sfid: Sfid, next: SimTime) {
        if let Some(entry) = self.entries.get_mut(&sfid) {
            entry.next_grant = next;
        }
    }

    pub fn poll_due(&self, sfid: Sfid, now: SimTime) -> bool {
        self.entries.get(&sfid).is_some_and(|e| now >= e.next_poll)
    }

    pub fn mark_polled(&mut self, sfid: Sfid, next: SimTime) {
        if let Some(entry) = self.entries.get_mut(&sfid) {
            entry.next_poll = next;
        }
    }

    pub fn basic_poll_due(&self, basic_cid: Cid, now: SimTime) -> bool {
        self.basic_polls.get(&basic_cid).map_or(true, |next| now >= *next)
    }

    pub fn mark_basic_polled(&mut self, basic_cid: Cid, next: SimTime) {
        self.basic_polls.insert(basic_cid, next);
    }
}

pub(crate) fn class_polling_interval(flow: &ServiceFlow, config: &MacConfig) -> std::time::Duration {
    let default = match flow.scheduling_type {
        SchedulingType::Rtps => config.rtps_polling_interval,
        SchedulingType::Nrtps => config.nrtps_polling_interval,
        _ => config.be_polling_interval,
    };
    flow.polling_interval(default)
}

/// Snapshot of the stations in basic-CID order, rotated to start at `start`.
pub(crate) fn stations_from(ss_manager: &SsManager, start: usize) -> Vec<SsRecord> {
    let mut stations: Vec<SsRecord> = ss_manager
        .basic_cids()
        .into_iter()
        .filter_map(|cid| ss_manager.get_by_cid(cid).cloned())
        .collect();
    if !stations.is_empty() {
        let pivot = start % stations.len();
        stations.rotate_left(pivot);
    }
    stations
}

pub(crate) fn invite_ranging(alloc: &mut UplinkAllocator<'_>, config: &MacConfig, ss: &SsRecord) {
    if ss.poll_for_ranging && alloc.invite_ranging(ss, config.ranging_opp_symbols) {
        debug!("Invited ranging for {}", ss.mac_address);
    }
}

/// Grants every due UGS interval of the station's active uplink flows.
pub(crate) fn grant_unsolicited(
    alloc: &mut UplinkAllocator<'_>,
    table: &mut UplinkFlowTable,
    ctx: &mut UplinkContext<'_>,
    ss: &SsRecord,
) {
    for sfid in table.flows_of(ss.basic_cid, SchedulingType::Ugs) {
        if !table.grant_due(sfid, ctx.now) {
            continue;
        }
        let Some(flow) = ctx.flows.get_service_flow_mut(sfid).filter(|f| f.is_active()) else {
            continue;
        };
        if alloc.service_unsolicited_grants(ss, flow, ctx.config, ctx.now) > 0 {
            let next = ctx.now + flow.grant_interval(ctx.config.frame_duration);
            table.mark_granted(sfid, next);
        }
    }
}

/// Grants the due UGS intervals of every station in order. Returns false when
/// their demand covers the whole uplink subframe; other classes then get nothing.
pub(crate) fn serve_unsolicited(
    alloc: &mut UplinkAllocator<'_>,
    table: &mut UplinkFlowTable,
    ctx: &mut UplinkContext<'_>,
    stations: &[SsRecord],
) -> bool {
    let mut demand = 0;
    for ss in stations {
        for sfid in table.flows_of(ss.basic_cid, SchedulingType::Ugs) {
            if !table.grant_due(sfid, ctx.now) {
                continue;
            }
            if let Some(flow) = ctx.flows.get_service_flow(sfid).filter(|f| f.is_active()) {
                demand += alloc.unsolicited_grant_symbols(ss, flow, ctx.config);
            }
        }
    }
    for ss in stations {
        grant_unsolicited(alloc, table, ctx, ss);
    }
    if demand >= ctx.available_symbols && demand > 0 {
        debug!(
            "Uplink UGS demand {} symbols covers the {} available, starving other classes",
            demand, ctx.available_symbols
        );
        return false;
    }
    true
}

/// Gives the station one request opportunity covering every due poll: the
/// periodic basic poll and the polling interval of each polled flow in `classes`.
pub(crate) fn grant_polls(
    alloc: &mut UplinkAllocator<'_>,
    table: &mut UplinkFlowTable,
    ctx: &mut UplinkContext<'_>,
    ss: &SsRecord,
    classes: &[SchedulingType],
    include_basic: bool,
) -> bool {
    if !ss.is_registered() {
        return false;
    }
    // a poll-me bit on a UGS PDU asks for one extra unicast poll
    let basic_due = include_basic && (table.basic_poll_due(ss.basic_cid, ctx.now) || ss.poll_me);
    let mut due_flows = Vec::new();
    for class in classes {
        for sfid in table.flows_of(ss.basic_cid, *class) {
            let active = ctx.flows.get_service_flow(sfid).is_some_and(ServiceFlow::is_active);
            if active && table.poll_due(sfid, ctx.now) {
                due_flows.push(sfid);
            }
        }
    }
    let polls = due_flows.len() as u32 + basic_due as u32;
    if polls == 0 || !alloc.poll(ss, polls * ctx.config.bw_req_opp_symbols) {
        return false;
    }
    if basic_due {
        table.mark_basic_polled(ss.basic_cid, ctx.now + ctx.config.basic_polling_interval);
    }
    for sfid in due_flows {
        if let Some(flow) = ctx.flows.get_service_flow(sfid) {
            let next = ctx.now + class_polling_interval(flow, ctx.config);
            table.mark_polled(sfid, next);
        }
    }
    true
}

/// Grants the station's outstanding basic/primary request, once.
pub(crate) fn grant_management(
    alloc: &mut UplinkAllocator<'_>,
    ctx: &mut UplinkContext<'_>,
    ss: &SsRecord,
) {
    if ss.management_bytes_requested == 0 {
        return;
    }
    let granted = alloc.service_bandwidth_requests(ss, ss.management_bytes_requested, u32::MAX);
    if let Some(record) = ctx.ss_manager.get_mut_by_cid(ss.basic_cid) {
        record.management_bytes_requested = record.management_bytes_requested.saturating_sub(granted);
    }
}

/// Grants outstanding requests of the station's flows in `class`.
pub(crate) fn grant_requests(
    alloc: &mut UplinkAllocator<'_>,
    table: &UplinkFlowTable,
    ctx: &mut UplinkContext<'_>,
    ss: &SsRecord,
    class: SchedulingType,
) {
    for sfid in table.flows_of(ss.basic_cid, class) {
        if let Some(flow) = ctx.flows.get_service_flow_mut(sfid).filter(|f| f.is_active()) {
            alloc.grant_flow_request(ss, flow, u32::MAX, ctx.now);
        }
    }
}

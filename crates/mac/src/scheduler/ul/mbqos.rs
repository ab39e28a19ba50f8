//! Migration-based QoS uplink scheduling.
//!
//! Bandwidth requests become jobs in three queues. rtPS requests carry a
//! deadline derived from the flow's maximum latency and move to the high
//! queue when it is near; rtPS/nrtPS flows trailing their minimum reserved
//! rate in the current window get their backlog promoted too. The high and
//! intermediate queues are served earliest deadline first, the low queue in
//! arrival order. A job that only partly fits keeps its place at the head.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, trace};
use wimax_core::{BandwidthRequestHeader, BandwidthRequestType, SchedulingType, Sfid, SimTime};

use super::job::{JobPriority, PriorityUlJob, ReqType, UlJob};
use super::{
    calculate_allocation_start_time, class_polling_interval, grant_management, invite_ranging,
    record_bandwidth_request, serve_unsolicited, stations_from, UplinkAllocator, UplinkContext,
    UplinkFlowTable, UplinkSchedule, UplinkScheduler,
};
use crate::service_flow::ServiceFlow;
use crate::sf_manager::ServiceFlowManager;
use crate::ss_record::{SsManager, SsRecord};
use crate::MacConfig;

/// Intermediate jobs due within this many frames migrate to the high queue.
pub const DEADLINE_FRAMES: u32 = 2;

const POLLED_CLASSES: [SchedulingType; 3] = [
    SchedulingType::Rtps,
    SchedulingType::Nrtps,
    SchedulingType::BestEffort,
];

#[derive(Debug, Default)]
pub struct MbqosUplinkScheduler {
    table: UplinkFlowTable,
    high: VecDeque<UlJob>,
    intermediate: VecDeque<UlJob>,
    low: VecDeque<UlJob>,
    window: Duration,
    frame_duration: Duration,
}

impl MbqosUplinkScheduler {
    fn queue_mut(&mut self, priority: JobPriority) -> &mut VecDeque<UlJob> {
        match priority {
            JobPriority::High => &mut self.high,
            JobPriority::Intermediate => &mut self.intermediate,
            JobPriority::Low => &mut self.low,
        }
    }

    pub fn enqueue_job(&mut self, priority: JobPriority, job: UlJob) {
        trace!("Enqueue {:?} job {:?}", priority, job);
        self.queue_mut(priority).push_back(job);
    }

    pub fn dequeue_job(&mut self, priority: JobPriority) -> Option<UlJob> {
        self.queue_mut(priority).pop_front()
    }

    pub fn queue_len(&self, priority: JobPriority) -> usize {
        match priority {
            JobPriority::High => self.high.len(),
            JobPriority::Intermediate => self.intermediate.len(),
            JobPriority::Low => self.low.len(),
        }
    }

    pub fn determine_deadline(flow: &ServiceFlow, release: SimTime) -> SimTime {
        release + flow.maximum_latency_duration()
    }

    fn remove_jobs_of(&mut self, sfid: Sfid) {
        for queue in [&mut self.high, &mut self.intermediate, &mut self.low] {
            queue.retain(|job| !job.belongs_to(sfid));
        }
    }

    /// Migrates intermediate jobs whose deadline falls within `DEADLINE_FRAMES` frames.
    pub fn check_deadline(&mut self, now: SimTime) {
        let horizon = now + self.frame_duration * DEADLINE_FRAMES;
        let (urgent, waiting): (VecDeque<UlJob>, VecDeque<UlJob>) = self
            .intermediate
            .drain(..)
            .partition(|job| job.deadline <= horizon);
        self.intermediate = waiting;
        for job in urgent {
            debug!("Job of flow {:?} due at {:?}, promoting", job.sfid, job.deadline);
            self.high.push_back(job);
        }
    }

    /// Promotes backlog of rtPS/nrtPS flows below their minimum reserved rate
    /// for this window, largest deficit first.
    pub fn check_minimum_bandwidth(&mut self, flows: &ServiceFlowManager, now: SimTime) {
        let window_ns = self.window.as_nanos() as u64;
        let mut ranked = Vec::new();
        for class in [SchedulingType::Rtps, SchedulingType::Nrtps] {
            for sfid in self.table.flows_of_class(class) {
                let Some(flow) = flows.get_service_flow(sfid).filter(|f| f.is_active()) else {
                    continue;
                };
                if flow.min_reserved_traffic_rate == 0 {
                    continue;
                }
                let guaranteed =
                    (flow.min_reserved_traffic_rate as u64 * window_ns / 8_000_000_000) as u32;
                let already = flow.record.bw_since_last_expiry + queued_bytes(&self.high, sfid);
                let deficit = guaranteed.saturating_sub(already);
                let backlog = queued_bytes(&self.intermediate, sfid) + queued_bytes(&self.low, sfid);
                if deficit == 0 || backlog == 0 {
                    continue;
                }
                let Some(entry) = self.table.get(sfid) else {
                    continue;
                };
                ranked.push(PriorityUlJob {
                    job: UlJob::data(entry.basic_cid, sfid, class, now, now, deficit.min(backlog)),
                    deficit,
                });
            }
        }
        ranked.sort();

        for PriorityUlJob { mut job, deficit } in ranked {
            let Some(sfid) = job.sfid else { continue };
            let mut taken = take_bytes(&mut self.intermediate, sfid, job.size);
            taken += take_bytes(&mut self.low, sfid, job.size - taken);
            if taken == 0 {
                continue;
            }
            debug!("Flow {} short {} bytes of its minimum rate, promoting {}", sfid, deficit, taken);
            job.size = taken;
            self.high.push_back(job);
        }
    }

    /// Turns due polls into high-priority unicast polling jobs, one per station.
    fn enqueue_polls(&mut self, ctx: &UplinkContext<'_>, stations: &[SsRecord]) {
        let poll_symbols = ctx.config.bw_req_opp_symbols;
        if poll_symbols == 0 {
            return;
        }
        for ss in stations.iter().filter(|ss| ss.is_registered()) {
            let pending_poll = self.high.iter().any(|job| {
                job.req_type == ReqType::UnicastPolling && job.basic_cid == ss.basic_cid
            });
            if pending_poll {
                continue;
            }
            let mut polls = 0;
            if self.table.basic_poll_due(ss.basic_cid, ctx.now) || ss.poll_me {
                self.table
                    .mark_basic_polled(ss.basic_cid, ctx.now + ctx.config.basic_polling_interval);
                polls += 1;
            }
            for class in POLLED_CLASSES {
                for sfid in self.table.flows_of(ss.basic_cid, class) {
                    let Some(flow) = ctx.flows.get_service_flow(sfid).filter(|f| f.is_active())
                    else {
                        continue;
                    };
                    if self.table.poll_due(sfid, ctx.now) {
                        let interval = class_polling_interval(flow, ctx.config);
                        self.table.mark_polled(sfid, ctx.now + interval);
                        polls += 1;
                    }
                }
            }
            if polls > 0 {
                let job = UlJob::unicast_polling(
                    ss.basic_cid,
                    ctx.now,
                    ctx.config.basic_polling_interval,
                    polls * poll_symbols,
                );
                self.enqueue_job(JobPriority::High, job);
            }
        }
    }
}

fn queued_bytes(queue: &VecDeque<UlJob>, sfid: Sfid) -> u32 {
    queue
        .iter()
        .filter(|job| job.belongs_to(sfid))
        .map(|job| job.size)
        .sum()
}

/// Removes up to `bytes` of `sfid`'s data from the front of `queue`.
fn take_bytes(queue: &mut VecDeque<UlJob>, sfid: Sfid, bytes: u32) -> u32 {
    let mut remaining = bytes;
    queue.retain_mut(|job| {
        if remaining == 0 || !job.belongs_to(sfid) {
            return true;
        }
        let taken = job.size.min(remaining);
        job.size -= taken;
        remaining -= taken;
        job.size > 0
    });
    bytes - remaining
}

/// Serves `queue` from the head until a job does not fit.
fn serve_queue(
    queue: &mut VecDeque<UlJob>,
    alloc: &mut UplinkAllocator<'_>,
    ctx: &mut UplinkContext<'_>,
    earliest_deadline_first: bool,
) {
    if earliest_deadline_first {
        queue.make_contiguous().sort_by_key(|job| job.deadline);
    }
    while let Some(job) = queue.front_mut() {
        let Some(ss) = ctx.ss_manager.get_by_cid(job.basic_cid).cloned() else {
            queue.pop_front();
            continue;
        };
        match job.req_type {
            ReqType::UnicastPolling => {
                if !alloc.poll(&ss, job.size) {
                    break;
                }
            }
            ReqType::Data => {
                let Some(flow) = job.sfid.and_then(|sfid| ctx.flows.get_service_flow_mut(sfid))
                else {
                    queue.pop_front();
                    continue;
                };
                let granted = alloc.service_bandwidth_requests(&ss, job.size, u32::MAX);
                if granted == 0 {
                    break;
                }
                flow.record.record_grant(granted, ctx.now);
                job.size -= granted;
                if job.size > 0 {
                    break;
                }
            }
        }
        queue.pop_front();
    }
}

impl UplinkScheduler for MbqosUplinkScheduler {
    fn init_once(&mut self, config: &MacConfig) {
        self.window = config.uplink_window;
        self.frame_duration = config.frame_duration;
        debug!("MBQoS uplink scheduler, window {:?}", self.window);
    }

    fn schedule(&mut self, ctx: &mut UplinkContext<'_>) -> UplinkSchedule {
        let mut alloc = UplinkAllocator::new(ctx.phy, ctx.available_symbols);
        if self.table.begin_frame(ctx.config) {
            alloc.allocate_initial_ranging_interval(
                ctx.config.nr_ir_opps,
                ctx.config.ranging_opp_symbols,
            );
        }

        let stations = stations_from(ctx.ss_manager, 0);
        let start_time = calculate_allocation_start_time(ctx.config, ctx.phy);
        if !serve_unsolicited(&mut alloc, &mut self.table, ctx, &stations) {
            return alloc.finish(start_time);
        }
        for ss in &stations {
            invite_ranging(&mut alloc, ctx.config, ss);
            grant_management(&mut alloc, ctx, ss);
        }

        self.enqueue_polls(ctx, &stations);
        self.check_deadline(ctx.now);
        self.check_minimum_bandwidth(ctx.flows, ctx.now);

        serve_queue(&mut self.high, &mut alloc, ctx, true);
        serve_queue(&mut self.intermediate, &mut alloc, ctx, true);
        serve_queue(&mut self.low, &mut alloc, ctx, false);

        alloc.finish(start_time)
    }

    fn process_bandwidth_request(
        &mut self,
        header: &BandwidthRequestHeader,
        ss_manager: &mut SsManager,
        flows: &mut ServiceFlowManager,
        now: SimTime,
    ) {
        let Some(sfid) = record_bandwidth_request(header, ss_manager, flows) else {
            return;
        };
        let (Some(flow), Some(entry)) = (flows.get_service_flow(sfid), self.table.get(sfid)) else {
            return;
        };
        let basic_cid = entry.basic_cid;
        let size = match header.request_type {
            BandwidthRequestType::Aggregate => flow.record.pending_request(),
            BandwidthRequestType::Incremental => header.br,
        };
        let (priority, deadline) = match flow.scheduling_type {
            SchedulingType::Rtps => (JobPriority::Intermediate, Self::determine_deadline(flow, now)),
            _ => (JobPriority::Low, now),
        };
        let job = UlJob::data(basic_cid, sfid, flow.scheduling_type, now, deadline, size);
        if header.request_type == BandwidthRequestType::Aggregate {
            self.remove_jobs_of(sfid);
        }
        if size > 0 {
            self.enqueue_job(priority, job);
        }
    }

    fn setup_service_flow(&mut self, ss: &SsRecord, flow: &ServiceFlow, now: SimTime) {
        self.table.setup(ss, flow, now);
    }

    fn remove_service_flow(&mut self, sfid: Sfid) {
        self.table.remove(sfid);
        self.remove_jobs_of(sfid);
    }

    fn on_window_timer(&mut self, flows: &mut ServiceFlowManager) {
        trace!("MBQoS window expired");
        flows.flows_mut().for_each(|f| f.record.reset_window());
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use wimax_core::Direction;

    fn fixture() -> (Fixture, MbqosUplinkScheduler, SsRecord) {
        let mut fixture = Fixture::new();
        fixture.config.nr_ir_opps = 0;
        fixture.config.bw_req_opp_symbols = 0;
        let mut scheduler = MbqosUplinkScheduler::default();
        scheduler.init_once(&fixture.config);
        let ss = fixture.add_station(1);
        (fixture, scheduler, ss)
    }

    fn pending(fixture: &Fixture, sfid: Sfid) -> u32 {
        fixture.flows.get_service_flow(sfid).unwrap().record.pending_request()
    }

    #[test]
    fn test_earliest_deadline_served_first() {
        let (mut fixture, mut scheduler, ss) = fixture();
        let lax = ServiceFlow::new(Direction::Up, SchedulingType::Rtps).with_maximum_latency(80);
        let tight = ServiceFlow::new(Direction::Up, SchedulingType::Rtps).with_maximum_latency(30);
        let be = fixture.add_flow(&mut scheduler, &ss, ServiceFlow::new(Direction::Up, SchedulingType::BestEffort));
        let lax = fixture.add_flow(&mut scheduler, &ss, lax);
        let tight = fixture.add_flow(&mut scheduler, &ss, tight);

        fixture.request(&mut scheduler, be, 10_000, SimTime::ZERO);
        fixture.request(&mut scheduler, lax, 240, SimTime::ZERO);
        fixture.request(&mut scheduler, tight, 240, SimTime::ZERO);
        assert_eq!(scheduler.queue_len(JobPriority::Intermediate), 2);
        assert_eq!(scheduler.queue_len(JobPriority::Low), 1);

        // 10 QPSK symbols carry one 240-byte request per frame
        fixture.run(&mut scheduler, 10, SimTime::ZERO);
        assert_eq!(pending(&fixture, tight), 0);
        assert_eq!(pending(&fixture, lax), 240);

        fixture.run(&mut scheduler, 10, SimTime::from_millis(10));
        assert_eq!(pending(&fixture, lax), 0);
        assert_eq!(pending(&fixture, be), 10_000);

        fixture.run(&mut scheduler, 10, SimTime::from_millis(20));
        assert_eq!(pending(&fixture, be), 9_760);
    }

    #[test]
    fn test_deadline_met_whenever_capacity_exists() {
        let (mut fixture, mut scheduler, ss) = fixture();
        let rtps = fixture.add_flow(
            &mut scheduler,
            &ss,
            ServiceFlow::new(Direction::Up, SchedulingType::Rtps).with_maximum_latency(40),
        );
        let mut best_effort = Vec::new();
        for _ in 0..3 {
            let sfid = fixture.add_flow(
                &mut scheduler,
                &ss,
                ServiceFlow::new(Direction::Up, SchedulingType::BestEffort),
            );
            fixture.request(&mut scheduler, sfid, 50_000, SimTime::ZERO);
            best_effort.push(sfid);
        }
        // 1200 bytes due at 40 ms, 600 bytes of capacity per frame
        fixture.request(&mut scheduler, rtps, 1_200, SimTime::ZERO);
        for frame in 0..4u64 {
            fixture.run(&mut scheduler, 25, SimTime::from_millis(frame * 10));
        }
        assert_eq!(pending(&fixture, rtps), 0);
        assert_eq!(scheduler.queue_len(JobPriority::Intermediate), 0);
    }

    #[test]
    fn test_minimum_rate_backlog_is_promoted() {
        let (mut fixture, mut scheduler, ss) = fixture();
        let rtps = fixture.add_flow(
            &mut scheduler,
            &ss,
            ServiceFlow::new(Direction::Up, SchedulingType::Rtps).with_maximum_latency(80),
        );
        let nrtps = fixture.add_flow(
            &mut scheduler,
            &ss,
            ServiceFlow::new(Direction::Up, SchedulingType::Nrtps)
                .with_min_reserved_traffic_rate(192_000),
        );
        fixture.request(&mut scheduler, rtps, 240, SimTime::ZERO);
        fixture.request(&mut scheduler, nrtps, 240, SimTime::ZERO);

        fixture.run(&mut scheduler, 10, SimTime::ZERO);
        assert_eq!(pending(&fixture, nrtps), 0);
        assert_eq!(pending(&fixture, rtps), 240);
        assert_eq!(
            fixture.flows.get_service_flow(nrtps).unwrap().record.bw_since_last_expiry,
            240
        );

        scheduler.on_window_timer(&mut fixture.flows);
        assert_eq!(
            fixture.flows.get_service_flow(nrtps).unwrap().record.bw_since_last_expiry,
            0
        );
    }

    #[test]
    fn test_aggregate_request_replaces_queued_jobs() {
        let (mut fixture, mut scheduler, ss) = fixture();
        let be = fixture.add_flow(&mut scheduler, &ss, ServiceFlow::new(Direction::Up, SchedulingType::BestEffort));
        fixture.request(&mut scheduler, be, 500, SimTime::ZERO);
        fixture.request(&mut scheduler, be, 300, SimTime::ZERO);
        assert_eq!(scheduler.queue_len(JobPriority::Low), 1);
        assert_eq!(scheduler.dequeue_job(JobPriority::Low).unwrap().size, 300);

        fixture.request(&mut scheduler, be, 100, SimTime::ZERO);
        scheduler.remove_service_flow(be);
        assert_eq!(scheduler.queue_len(JobPriority::Low), 0);
    }

    #[test]
    fn test_polls_become_high_jobs() {
        let mut fixture = Fixture::new();
        fixture.config.nr_ir_opps = 0;
        let mut scheduler = MbqosUplinkScheduler::default();
        scheduler.init_once(&fixture.config);
        let ss = fixture.add_station(1);
        fixture.add_flow(&mut scheduler, &ss, ServiceFlow::new(Direction::Up, SchedulingType::Rtps));

        // basic poll plus one rtPS poll, two symbols each
        let schedule = fixture.run(&mut scheduler, 177, SimTime::ZERO);
        assert_eq!(granted_symbols(&schedule, ss.basic_cid), 4);
        assert_eq!(scheduler.queue_len(JobPriority::High), 0);

        let starved = fixture.run(&mut scheduler, 0, SimTime::from_millis(40));
        assert_eq!(total_symbols(&starved), 0);
        assert_eq!(scheduler.queue_len(JobPriority::High), 1);
    }

    #[test]
    fn test_ugs_overload_starves_other_classes() {
        assert_ugs_overload_starves_others(&mut MbqosUplinkScheduler::default());
    }
}

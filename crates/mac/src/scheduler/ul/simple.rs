//! Round-robin uplink scheduling without deadline awareness.

use log::debug;
use wimax_core::{BandwidthRequestHeader, SchedulingType, Sfid, SimTime};

use super::{
    calculate_allocation_start_time, grant_management, grant_polls, grant_requests,
    invite_ranging, record_bandwidth_request, serve_unsolicited, stations_from, UplinkAllocator,
    UplinkContext, UplinkFlowTable, UplinkSchedule, UplinkScheduler,
};
use crate::service_flow::ServiceFlow;
use crate::sf_manager::ServiceFlowManager;
use crate::ss_record::{SsManager, SsRecord};
use crate::MacConfig;

const POLLED_CLASSES: [SchedulingType; 3] = [
    SchedulingType::Rtps,
    SchedulingType::Nrtps,
    SchedulingType::BestEffort,
];

#[derive(Debug, Default)]
pub struct SimpleUplinkScheduler {
    table: UplinkFlowTable,
    /// Station served first next frame.
    next_ss: usize,
}

impl UplinkScheduler for SimpleUplinkScheduler {
    fn init_once(&mut self, config: &MacConfig) {
        debug!(
            "Simple uplink scheduler, ranging every {:?}",
            config.initial_ranging_interval
        );
    }

    fn schedule(&mut self, ctx: &mut UplinkContext<'_>) -> UplinkSchedule {
        let mut alloc = UplinkAllocator::new(ctx.phy, ctx.available_symbols);
        if self.table.begin_frame(ctx.config) {
            alloc.allocate_initial_ranging_interval(
                ctx.config.nr_ir_opps,
                ctx.config.ranging_opp_symbols,
            );
        }

        let stations = stations_from(ctx.ss_manager, self.next_ss);
        self.next_ss = self.next_ss.wrapping_add(1);
        let start_time = calculate_allocation_start_time(ctx.config, ctx.phy);
        if !serve_unsolicited(&mut alloc, &mut self.table, ctx, &stations) {
            return alloc.finish(start_time);
        }
        for ss in &stations {
            invite_ranging(&mut alloc, ctx.config, ss);
            grant_polls(&mut alloc, &mut self.table, ctx, ss, &POLLED_CLASSES, true);
            grant_management(&mut alloc, ctx, ss);
            for class in POLLED_CLASSES {
                grant_requests(&mut alloc, &self.table, ctx, ss, class);
            }
        }

        alloc.finish(start_time)
    }

    fn process_bandwidth_request(
        &mut self,
        header: &BandwidthRequestHeader,
        ss_manager: &mut SsManager,
        flows: &mut ServiceFlowManager,
        _now: SimTime,
    ) {
        record_bandwidth_request(header, ss_manager, flows);
    }

    fn setup_service_flow(&mut self, ss: &SsRecord, flow: &ServiceFlow, now: SimTime) {
        self.table.setup(ss, flow, now);
    }

    fn remove_service_flow(&mut self, sfid: Sfid) {
        self.table.remove(sfid);
    }

    fn on_window_timer(&mut self, flows: &mut ServiceFlowManager) {
        flows.flows_mut().for_each(|f| f.record.reset_window());
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use wimax_core::types::uiuc;
    use wimax_core::{Cid, Direction};

    #[test]
    fn test_contention_ranging_follows_interval() {
        let mut fixture = Fixture::new();
        let mut scheduler = SimpleUplinkScheduler::default();
        scheduler.init_once(&fixture.config);
        let mut ranging_frames = Vec::new();
        for frame in 0..12u64 {
            let schedule = fixture.run(&mut scheduler, 177, SimTime::from_millis(frame * 10));
            if schedule
                .ies
                .iter()
                .any(|ie| ie.cid == Cid::BROADCAST && ie.uiuc == uiuc::INITIAL_RANGING)
            {
                ranging_frames.push(frame);
            }
        }
        assert_eq!(ranging_frames, vec![0, 5, 10]);
    }

    #[test]
    fn test_start_station_rotates() {
        let mut fixture = Fixture::new();
        fixture.config.nr_ir_opps = 0;
        let mut scheduler = SimpleUplinkScheduler::default();
        let a = fixture.add_station(1);
        let b = fixture.add_station(2);
        let fa = fixture.add_flow(&mut scheduler, &a, ServiceFlow::new(Direction::Up, SchedulingType::BestEffort));
        let fb = fixture.add_flow(&mut scheduler, &b, ServiceFlow::new(Direction::Up, SchedulingType::BestEffort));

        // both polled in frame 0; then each asks for far more than a frame
        fixture.run(&mut scheduler, 177, SimTime::ZERO);
        fixture.request(&mut scheduler, fa, 100_000, SimTime::ZERO);
        fixture.request(&mut scheduler, fb, 100_000, SimTime::ZERO);

        let first = fixture.run(&mut scheduler, 100, SimTime::from_millis(10));
        let second = fixture.run(&mut scheduler, 100, SimTime::from_millis(20));
        assert!(granted_symbols(&first, b.basic_cid) > granted_symbols(&first, a.basic_cid));
        assert!(granted_symbols(&second, a.basic_cid) > granted_symbols(&second, b.basic_cid));
    }

    #[test]
    fn test_invited_ranging_and_management_grant() {
        let mut fixture = Fixture::new();
        let mut scheduler = SimpleUplinkScheduler::default();
        let ss = fixture.add_station(3);
        if let Some(record) = fixture.ss_manager.get_mut(&ss.mac_address) {
            record.poll_for_ranging = true;
            record.management_bytes_requested = 50;
        }
        let schedule = fixture.run(&mut scheduler, 177, SimTime::ZERO);
        assert!(schedule
            .ies
            .iter()
            .any(|ie| ie.cid == ss.basic_cid && ie.uiuc == uiuc::INITIAL_RANGING));
        assert_eq!(
            fixture.ss_manager.get(&ss.mac_address).unwrap().management_bytes_requested,
            0
        );
    }

    #[test]
    fn test_ugs_overload_starves_other_classes() {
        assert_ugs_overload_starves_others(&mut SimpleUplinkScheduler::default());
    }
}

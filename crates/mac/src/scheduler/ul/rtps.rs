//! Class-ordered uplink scheduling: UGS, rtPS, nrtPS, BE, contention
//! ranging, basic, broadcast. rtPS shares what is left in proportion to demand.

use log::{debug, trace};
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

#[derive(Debug, Default)]
pub struct RtpsUplinkScheduler {
    table: UplinkFlowTable,
}

impl RtpsUplinkScheduler {
    fn serve_rtps(
        &mut self,
        alloc: &mut UplinkAllocator<'_>,
        ctx: &mut UplinkContext<'_>,
        stations: &[SsRecord],
    ) {
        let mut demands = Vec::new();
        for ss in stations {
            for sfid in self.table.flows_of(ss.basic_cid, SchedulingType::Rtps) {
                let Some(flow) = ctx.flows.get_service_flow(sfid).filter(|f| f.is_active()) else {
                    continue;
                };
                let pending = flow.record.pending_request();
                if pending > 0 {
                    let symbols = ctx.phy.nr_symbols(pending, ss.modulation);
                    demands.push((ss, sfid, symbols));
                }
            }
        }
        let total: u64 = demands.iter().map(|(_, _, s)| *s as u64).sum();
        let available = alloc.remaining_symbols() as u64;
        if total > available {
            debug!("rtPS demand {} symbols exceeds {} available", total, available);
        }

        for (ss, sfid, symbols) in demands {
            let share = if total <= available {
                symbols
            } else {
                (available * symbols as u64 / total) as u32
            };
            if let Some(flow) = ctx.flows.get_service_flow_mut(sfid) {
                let granted = alloc.grant_flow_request(ss, flow, share, ctx.now);
                trace!("rtPS flow {} granted {} bytes", sfid, granted);
            }
        }
    }
}

impl UplinkScheduler for RtpsUplinkScheduler {
    fn init_once(&mut self, config: &MacConfig) {
        debug!(
            "rtPS uplink scheduler, rtPS polled every {:?}",
            config.rtps_polling_interval
        );
    }

    fn schedule(&mut self, ctx: &mut UplinkContext<'_>) -> UplinkSchedule {
        let mut alloc = UplinkAllocator::new(ctx.phy, ctx.available_symbols);
        let ranging_due = self.table.begin_frame(ctx.config);
        let stations = stations_from(ctx.ss_manager, 0);
        let start_time = calculate_allocation_start_time(ctx.config, ctx.phy);
        if !serve_unsolicited(&mut alloc, &mut self.table, ctx, &stations) {
            return alloc.finish(start_time);
        }

        for ss in &stations {
            grant_polls(&mut alloc, &mut self.table, ctx, ss, &[SchedulingType::Rtps], false);
        }
        self.serve_rtps(&mut alloc, ctx, &stations);

        for class in [SchedulingType::Nrtps, SchedulingType::BestEffort] {
            for ss in &stations {
                grant_polls(&mut alloc, &mut self.table, ctx, ss, &[class], false);
                grant_requests(&mut alloc, &self.table, ctx, ss, class);
            }
        }

        if ranging_due {
            alloc.allocate_initial_ranging_interval(
                ctx.config.nr_ir_opps,
                ctx.config.ranging_opp_symbols,
            );
        }

        for ss in &stations {
            invite_ranging(&mut alloc, ctx.config, ss);
            grant_polls(&mut alloc, &mut self.table, ctx, ss, &[], true);
            grant_management(&mut alloc, ctx, ss);
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

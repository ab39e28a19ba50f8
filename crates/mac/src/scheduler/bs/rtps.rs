//! Class-ordered downlink scheduling with proportional sharing among rtPS
//! connections.

use log::debug;
use wimax_core::{CidType, MacHeaderType, SchedulingType};

use super::{
    connection_modulation, management_cids, serve_fixed_management, serve_ugs, BsScheduler,
    DownlinkBuilder, DownlinkBurst, DownlinkContext,
};

#[derive(Debug, Default)]
pub struct RtpsBsScheduler;

impl RtpsBsScheduler {
    fn serve_rtps(&self, builder: &mut DownlinkBuilder, ctx: &mut DownlinkContext<'_>) {
        let cids = ctx
            .connections
            .backlogged_cids(CidType::Transport, SchedulingType::Rtps);
        let mut demands = Vec::with_capacity(cids.len());
        for cid in cids {
            let Some(connection) = ctx.connections.get_connection(cid) else {
                continue;
            };
            let bytes = connection.queue().queue_length_with_mac_overhead() as u32;
            let modulation = connection_modulation(ctx, cid, CidType::Transport);
            demands.push((cid, ctx.phy.nr_symbols(bytes, modulation)));
        }
        let total: u64 = demands.iter().map(|(_, s)| *s as u64).sum();
        let available = builder.remaining_symbols() as u64;
        if total > available {
            debug!("rtPS backlog of {} symbols shares {} available", total, available);
        }
        for (cid, symbols) in demands {
            let share = if total <= available {
                symbols
            } else {
                (available * symbols as u64 / total) as u32
            };
            if share > 0 {
                builder.fill_connection(ctx, cid, share);
            }
        }
    }

    /// Head of line in CID order: each connection drains before the next starts.
    fn serve_in_order(
        &self,
        scheduling_type: SchedulingType,
        builder: &mut DownlinkBuilder,
        ctx: &mut DownlinkContext<'_>,
    ) {
        for cid in ctx.connections.backlogged_cids(CidType::Transport, scheduling_type) {
            if builder.remaining_symbols() == 0 {
                break;
            }
            let blocked = builder.fill_connection(ctx, cid, u32::MAX) == 0
                || ctx
                    .connections
                    .get_connection(cid)
                    .is_some_and(|c| c.has_packets_of(MacHeaderType::Generic));
            if blocked {
                break;
            }
        }
    }
}

impl BsScheduler for RtpsBsScheduler {
    fn schedule(&mut self, ctx: &mut DownlinkContext<'_>) -> Vec<DownlinkBurst> {
        let mut builder = DownlinkBuilder::new(ctx.first_symbol, ctx.available_symbols);
        if !serve_ugs(&mut builder, ctx) {
            return builder.finish();
        }
        serve_fixed_management(&mut builder, ctx);
        for cid in management_cids(ctx) {
            if builder.remaining_symbols() == 0 {
                break;
            }
            builder.fill_connection(ctx, cid, u32::MAX);
        }
        self.serve_rtps(&mut builder, ctx);
        self.serve_in_order(SchedulingType::Nrtps, &mut builder, ctx);
        self.serve_in_order(SchedulingType::BestEffort, &mut builder, ctx);
        builder.finish()
    }
}

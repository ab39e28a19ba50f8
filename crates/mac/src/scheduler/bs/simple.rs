//! Round-robin downlink scheduling.

use wimax_core::{Cid, CidType, SchedulingType};

use super::{
    management_cids, serve_fixed_management, serve_ugs, BsScheduler, DownlinkBuilder,
    DownlinkBurst, DownlinkContext,
};

const CLASSES: [SchedulingType; 3] = [
    SchedulingType::Rtps,
    SchedulingType::Nrtps,
    SchedulingType::BestEffort,
];

/// Serves each class in priority order; within a class, connections in CID
/// order starting from a pointer that advances every frame.
#[derive(Debug, Default)]
pub struct SimpleBsScheduler {
    /// Start offsets: management, then one per class in `CLASSES`.
    cursors: [usize; 4],
}

impl SimpleBsScheduler {
    fn serve_rotating(
        &mut self,
        slot: usize,
        mut cids: Vec<Cid>,
        builder: &mut DownlinkBuilder,
        ctx: &mut DownlinkContext<'_>,
    ) {
        if cids.is_empty() {
            return;
        }
        let start = self.cursors[slot] % cids.len();
        cids.rotate_left(start);
        self.cursors[slot] = self.cursors[slot].wrapping_add(1);
        for cid in cids {
            if builder.remaining_symbols() == 0 {
                break;
            }
            builder.fill_connection(ctx, cid, u32::MAX);
        }
    }
}

impl BsScheduler for SimpleBsScheduler {
    fn schedule(&mut self, ctx: &mut DownlinkContext<'_>) -> Vec<DownlinkBurst> {
        let mut builder = DownlinkBuilder::new(ctx.first_symbol, ctx.available_symbols);
        if !serve_ugs(&mut builder, ctx) {
            return builder.finish();
        }
        serve_fixed_management(&mut builder, ctx);
        let management = management_cids(ctx);
        self.serve_rotating(0, management, &mut builder, ctx);
        for (i, class) in CLASSES.into_iter().enumerate() {
            let cids = ctx.connections.backlogged_cids(CidType::Transport, class);
            self.serve_rotating(i + 1, cids, &mut builder, ctx);
        }
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use bytes::Bytes;
    use wimax_core::SimTime;

    #[test]
    fn test_class_round_robin_rotates() {
        let mut scheduler = SimpleBsScheduler::default();
        let mut fixture = Fixture::new();
        let a = fixture.add_flow(SchedulingType::BestEffort, 0);
        let b = fixture.add_flow(SchedulingType::BestEffort, 0);
        fixture.fill(a, 10, 200);
        fixture.fill(b, 10, 200);

        // 9 QPSK symbols carry exactly one 206-byte PDU
        let first = fixture.run(&mut scheduler, 9);
        let second = fixture.run(&mut scheduler, 9);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ie.cid, a);
        assert_eq!(second[0].ie.cid, b);
    }

    #[test]
    fn test_management_precedes_data() {
        let mut scheduler = SimpleBsScheduler::default();
        let mut fixture = Fixture::new();
        let rtps = fixture.add_flow(SchedulingType::Rtps, 0);
        fixture.fill(rtps, 3, 100);
        for cid in [Cid::INITIAL_RANGING, Cid::BROADCAST] {
            fixture
                .connections
                .get_connection_mut(cid)
                .unwrap()
                .enqueue_sdu(Bytes::from(vec![0u8; 30]), SimTime::ZERO);
        }
        let bursts = fixture.run(&mut scheduler, 176);
        let order: Vec<Cid> = bursts.iter().map(|b| b.ie.cid).collect();
        assert_eq!(order, vec![Cid::BROADCAST, Cid::INITIAL_RANGING, rtps]);
        assert_eq!(bursts[0].modulation, wimax_core::Modulation::Bpsk12);
    }
}

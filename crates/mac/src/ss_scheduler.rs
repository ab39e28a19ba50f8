//! Subscriber-station side of uplink scheduling: the base station grants
//! symbols to the station as a whole and this scheduler decides which
//! connections fill them.

use std::collections::BTreeMap;

use log::trace;
use wimax_core::header::MAX_BANDWIDTH_REQUEST;
use wimax_core::{
    BandwidthRequestHeader, Cid, CidType, FragmentControl, GrantManagementSubheader, MacHeaderType,
    MacPdu, SchedulingType, WireFormat,
};

use crate::connection_manager::ConnectionManager;
use crate::sf_manager::ServiceFlowManager;

const BANDWIDTH_REQUEST_SIZE: usize = wimax_core::header::BANDWIDTH_REQUEST_HEADER_SIZE;

const TRANSPORT_ORDER: [SchedulingType; 4] = [
    SchedulingType::Ugs,
    SchedulingType::Rtps,
    SchedulingType::Nrtps,
    SchedulingType::BestEffort,
];

#[derive(Debug, Default)]
pub struct SsScheduler {
    /// Backlog last reported per connection.
    reported: BTreeMap<Cid, u32>,
}

impl SsScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections in service order: basic, primary, then transport by class.
    fn service_order(connections: &ConnectionManager) -> Vec<Cid> {
        let mut order: Vec<Cid> = connections
            .get_connections(CidType::Basic)
            .chain(connections.get_connections(CidType::Primary))
            .map(|c| c.cid())
            .collect();
        for class in TRANSPORT_ORDER {
            order.extend(
                connections
                    .get_connections(CidType::Transport)
                    .filter(|c| c.scheduling_type() == class)
                    .map(|c| c.cid()),
            );
        }
        order
    }

    /// Fills a grant of `budget` bytes. Bandwidth requests for changed
    /// backlog come first, then data in service order.
    pub fn schedule(
        &mut self,
        budget: usize,
        connections: &mut ConnectionManager,
        flows: &mut ServiceFlowManager,
    ) -> Vec<MacPdu> {
        let order = Self::service_order(connections);
        let mut left = budget;
        let mut pdus = Vec::new();

        for cid in &order {
            let Some(connection) = connections.get_connection(*cid) else {
                continue;
            };
            if connection.cid_type() == CidType::Transport
                && !connection.scheduling_type().uses_requests()
            {
                continue;
            }
            let backlog = (connection.queue().data_length_with_mac_overhead() as u32)
                .min(MAX_BANDWIDTH_REQUEST);
            if backlog == 0 {
                self.reported.remove(cid);
                continue;
            }
            if self.reported.get(cid) == Some(&backlog) || left < BANDWIDTH_REQUEST_SIZE {
                continue;
            }
            trace!("Requesting {} bytes on {}", backlog, cid);
            pdus.push(MacPdu::bandwidth_request(BandwidthRequestHeader::aggregate(
                *cid, backlog,
            )));
            self.reported.insert(*cid, backlog);
            left -= BANDWIDTH_REQUEST_SIZE;
        }

        for cid in &order {
            let Some(connection) = connections.get_connection_mut(*cid) else {
                continue;
            };
            while let Some(pdu) = connection.dequeue_with_budget(MacHeaderType::Generic, left) {
                left -= pdu.serialized_size();
                if let Some(flow) = flows.get_service_flow_by_cid_mut(*cid) {
                    let complete = pdu.fragmentation().map_or(true, |f| {
                        matches!(f.fc, FragmentControl::Unfragmented | FragmentControl::Last)
                    });
                    flow.record.record_sent(pdu.payload().len(), complete);
                }
                pdus.push(pdu);
            }
        }

        self.mark_poll_me(&mut pdus, &mut left, connections);
        pdus
    }

    /// Sets the poll-me bit on the first UGS PDU while polled classes still hold backlog.
    fn mark_poll_me(&self, pdus: &mut [MacPdu], left: &mut usize, connections: &ConnectionManager) {
        let waiting = connections
            .get_connections(CidType::Transport)
            .any(|c| c.scheduling_type().uses_requests() && c.has_packets());
        if !waiting || *left < wimax_core::header::GRANT_MANAGEMENT_SUBHEADER_SIZE {
            return;
        }
        let ugs = pdus.iter().position(|pdu| {
            pdu.header().header_type() == MacHeaderType::Generic
                && pdu.serialized_size() + wimax_core::header::GRANT_MANAGEMENT_SUBHEADER_SIZE
                    <= wimax_core::header::MAX_PDU_LENGTH
                && connections
                    .get_connection(pdu.cid())
                    .is_some_and(|c| c.scheduling_type() == SchedulingType::Ugs)
        });
        if let Some(index) = ugs {
            let pdu = pdus[index].clone().with_grant_management(GrantManagementSubheader {
                poll_me: true,
                ..Default::default()
            });
            *left -= wimax_core::header::GRANT_MANAGEMENT_SUBHEADER_SIZE;
            pdus[index] = pdu;
        }
    }

    /// Forgets reported backlog, as after re-registration.
    pub fn reset(&mut self) {
        self.reported.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use wimax_core::{Direction, MacHeader};

    use crate::service_flow::{ServiceFlow, ServiceFlowState};

    fn station() -> (ConnectionManager, ServiceFlowManager) {
        let mut connections = ConnectionManager::new(64);
        let mut flows = ServiceFlowManager::new();
        connections.add_connection(connections.new_connection(Cid::new(1), CidType::Basic));
        connections.add_connection(connections.new_connection(Cid::new(0x0401), CidType::Primary));
        let classes = [
            (0x0801, SchedulingType::Ugs),
            (0x0802, SchedulingType::Rtps),
            (0x0803, SchedulingType::BestEffort),
        ];
        for (sfid, (cid, class)) in classes.into_iter().enumerate() {
            let cid = Cid::new(cid);
            let mut connection = connections.new_connection(cid, CidType::Transport);
            connection.set_service_flow(sfid as u32 + 1, class);
            connections.add_connection(connection);
            let mut flow = ServiceFlow::new(Direction::Up, class);
            flow.sfid = sfid as u32 + 1;
            flow.cid = Some(cid);
            flow.state = ServiceFlowState::Active;
            flows.add_service_flow(flow);
        }
        (connections, flows)
    }

    fn push(connections: &mut ConnectionManager, cid: u16, len: usize) {
        let connection = connections.get_connection_mut(Cid::new(cid)).unwrap();
        assert!(connection.enqueue_sdu(Bytes::from(vec![0u8; len]), Duration::ZERO));
    }

    fn requests(pdus: &[MacPdu]) -> Vec<(Cid, u32)> {
        pdus.iter()
            .filter_map(|pdu| match pdu.header() {
                MacHeader::BandwidthRequest(h) => Some((h.cid, h.br)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_requests_only_on_changed_backlog() {
        let (mut connections, mut flows) = station();
        let mut scheduler = SsScheduler::new();
        push(&mut connections, 0x0803, 94);

        // a poll-sized grant only fits the request
        let pdus = scheduler.schedule(12, &mut connections, &mut flows);
        assert_eq!(requests(&pdus), vec![(Cid::new(0x0803), 100)]);
        assert_eq!(pdus.len(), 1);

        // unchanged backlog: the grant carries a first fragment instead
        let pdus = scheduler.schedule(12, &mut connections, &mut flows);
        assert!(requests(&pdus).is_empty());
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].serialized_size(), 12);
        assert_eq!(pdus[0].fragmentation().unwrap().fc, FragmentControl::First);

        // 89 bytes left behind header and subheader, and the new 50-byte PDU
        push(&mut connections, 0x0803, 44);
        let pdus = scheduler.schedule(12, &mut connections, &mut flows);
        assert_eq!(requests(&pdus), vec![(Cid::new(0x0803), 146)]);
    }

    #[test]
    fn test_grant_served_in_class_order() {
        let (mut connections, mut flows) = station();
        let mut scheduler = SsScheduler::new();
        push(&mut connections, 0x0803, 34);
        push(&mut connections, 0x0802, 34);
        push(&mut connections, 0x0801, 34);
        push(&mut connections, 0x0401, 14);

        // three requests (18) + primary (20) + UGS (40) + rtPS (40)
        let pdus = scheduler.schedule(118, &mut connections, &mut flows);
        let data: Vec<Cid> = pdus
            .iter()
            .filter(|pdu| pdu.header().header_type() == MacHeaderType::Generic)
            .map(MacPdu::cid)
            .collect();
        assert_eq!(
            data,
            vec![Cid::new(0x0401), Cid::new(0x0801), Cid::new(0x0802)]
        );
        assert_eq!(requests(&pdus).len(), 3);
        assert_eq!(flows.get_service_flow(1).unwrap().record.bytes_sent, 34);
        assert!(connections.get_connection(Cid::new(0x0803)).unwrap().has_packets());
    }

    #[test]
    fn test_poll_me_set_while_polled_backlog_waits() {
        let (mut connections, mut flows) = station();
        let mut scheduler = SsScheduler::new();
        push(&mut connections, 0x0801, 34);
        push(&mut connections, 0x0803, 500);

        let pdus = scheduler.schedule(50, &mut connections, &mut flows);
        let ugs = pdus
            .iter()
            .find(|pdu| pdu.cid() == Cid::new(0x0801))
            .unwrap();
        assert!(ugs.grant_management().unwrap().poll_me);
        let used: usize = pdus.iter().map(WireFormat::serialized_size).sum();
        assert!(used <= 50);
    }

    #[test]
    fn test_budget_is_never_exceeded() {
        let (mut connections, mut flows) = station();
        let mut scheduler = SsScheduler::new();
        for len in [300, 120, 700] {
            push(&mut connections, 0x0802, len);
            push(&mut connections, 0x0803, len);
        }
        for budget in [0, 6, 13, 50, 240, 1000] {
            let pdus = scheduler.schedule(budget, &mut connections, &mut flows);
            let used: usize = pdus.iter().map(WireFormat::serialized_size).sum();
            assert!(used <= budget, "{} > {}", used, budget);
        }
    }
}

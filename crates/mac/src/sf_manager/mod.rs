//! Service flow tables and the DSA negotiation that fills them.

use std::collections::BTreeMap;

use log::debug;
use wimax_core::{Cid, Direction, SchedulingType, Sfid};

use crate::classifier::IpcsClassifier;
use crate::service_flow::{ServiceFlow, ServiceFlowState};

pub mod bs;
pub mod ss;

pub use bs::{AckTimeoutOutcome, BsServiceFlowManager, DsaReqOutcome};
pub use ss::{DsaClientState, DsaRspOutcome, DsaTimeoutOutcome, SsServiceFlowManager};

/// Owns the flows of one station, keyed by SFID.
#[derive(Debug, Default)]
pub struct ServiceFlowManager {
    flows: BTreeMap<Sfid, ServiceFlow>,
}

impl ServiceFlowManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service_flow(&mut self, flow: ServiceFlow) {
        debug!(
            "Adding {:?} {:?} service flow {}",
            flow.direction, flow.scheduling_type, flow.sfid
        );
        self.flows.insert(flow.sfid, flow);
    }

    pub fn get_service_flow(&self, sfid: Sfid) -> Option<&ServiceFlow> {
        self.flows.get(&sfid)
    }

    pub fn get_service_flow_mut(&mut self, sfid: Sfid) -> Option<&mut ServiceFlow> {
        self.flows.get_mut(&sfid)
    }

    pub fn get_service_flow_by_cid(&self, cid: Cid) -> Option<&ServiceFlow> {
        self.flows.values().find(|f| f.cid == Some(cid))
    }

    pub fn get_service_flow_by_cid_mut(&mut self, cid: Cid) -> Option<&mut ServiceFlow> {
        self.flows.values_mut().find(|f| f.cid == Some(cid))
    }

    /// Flows of one scheduling class in SFID order. `SchedulingType::None` selects all.
    pub fn get_service_flows(&self, scheduling_type: SchedulingType) -> Vec<&ServiceFlow> {
        self.flows
            .values()
            .filter(|f| scheduling_type == SchedulingType::None || f.scheduling_type == scheduling_type)
            .collect()
    }

    pub fn flows(&self) -> impl Iterator<Item = &ServiceFlow> {
        self.flows.values()
    }

    pub fn flows_mut(&mut self) -> impl Iterator<Item = &mut ServiceFlow> {
        self.flows.values_mut()
    }

    /// SFID of the active flow `packet` belongs to.
    pub fn do_classify(&self, packet: &[u8], direction: Direction) -> Option<Sfid> {
        IpcsClassifier::classify(packet, self.flows.values(), direction)
    }

    /// True once no flow is still waiting on negotiation.
    pub fn are_service_flows_allocated(&self) -> bool {
        self.flows
            .values()
            .all(|f| f.state != ServiceFlowState::Pending)
    }

    pub fn remove_service_flow(&mut self, sfid: Sfid) -> Option<ServiceFlow> {
        self.flows.remove(&sfid)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(sfid: Sfid, scheduling_type: SchedulingType, cid: u16) -> ServiceFlow {
        let mut f = ServiceFlow::new(Direction::Down, scheduling_type);
        f.sfid = sfid;
        f.cid = Some(Cid::new(cid));
        f
    }

    #[test]
    fn test_lookups() {
        let mut manager = ServiceFlowManager::new();
        manager.add_service_flow(flow(3, SchedulingType::Rtps, 0x0901));
        manager.add_service_flow(flow(1, SchedulingType::BestEffort, 0x0902));
        manager.add_service_flow(flow(2, SchedulingType::Rtps, 0x0903));

        assert_eq!(manager.get_service_flow_by_cid(Cid::new(0x0902)).unwrap().sfid, 1);
        let rtps: Vec<Sfid> = manager
            .get_service_flows(SchedulingType::Rtps)
            .iter()
            .map(|f| f.sfid)
            .collect();
        assert_eq!(rtps, vec![2, 3]);
        assert_eq!(manager.get_service_flows(SchedulingType::None).len(), 3);
    }

    #[test]
    fn test_allocation_state() {
        let mut manager = ServiceFlowManager::new();
        assert!(manager.are_service_flows_allocated());
        manager.add_service_flow(flow(1, SchedulingType::Ugs, 0x0901));
        assert!(!manager.are_service_flows_allocated());
        manager.get_service_flow_mut(1).unwrap().state = ServiceFlowState::Rejected;
        assert!(manager.are_service_flows_allocated());
        assert!(manager.remove_service_flow(1).is_some());
        assert!(manager.is_empty());
    }
}

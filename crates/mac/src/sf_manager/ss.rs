//! Client side of dynamic service addition.

use std::collections::VecDeque;

use log::{debug, info, warn};
use wimax_core::messages::{ConfirmationCode, DsaAck, DsaReq, DsaRsp};
use wimax_core::types::TransactionId;
use wimax_core::{Cid, CidType, Sfid};

use super::ServiceFlowManager;
use crate::connection_manager::ConnectionManager;
use crate::service_flow::{ServiceFlow, ServiceFlowState};
use crate::timer::{Timer, TimerToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsaClientState {
    Idle,
    WaitingDsaRsp(TransactionId),
}

#[derive(Debug)]
struct InFlight {
    request: DsaReq,
    flow: ServiceFlow,
    retries: u8,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DsaRspOutcome {
    /// Not for the outstanding transaction.
    Ignored,
    /// The response repeats one already acknowledged; the ACK must go out again.
    Duplicate(DsaAck),
    Accepted { ack: DsaAck, sfid: Sfid, cid: Cid },
    Rejected { ack: DsaAck, code: ConfirmationCode },
}

#[derive(Debug, PartialEq, Eq)]
pub enum DsaTimeoutOutcome {
    Stale,
    Resend(DsaReq, TimerToken),
    Abandoned,
}

#[derive(Debug)]
pub struct SsServiceFlowManager {
    base: ServiceFlowManager,
    provisioned: VecDeque<ServiceFlow>,
    in_flight: Option<InFlight>,
    last_ack: Option<DsaAck>,
    rejected: Vec<ServiceFlow>,
    timer: Timer,
    next_transaction_id: TransactionId,
    max_dsa_req_retries: u8,
}

impl SsServiceFlowManager {
    pub fn new(max_dsa_req_retries: u8) -> Self {
        Self {
            base: ServiceFlowManager::new(),
            provisioned: VecDeque::new(),
            in_flight: None,
            last_ack: None,
            rejected: Vec::new(),
            timer: Timer::default(),
            next_transaction_id: 1,
            max_dsa_req_retries,
        }
    }

    pub fn base(&self) -> &ServiceFlowManager {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut ServiceFlowManager {
        &mut self.base
    }

    pub fn max_dsa_req_retries(&self) -> u8 {
        self.max_dsa_req_retries
    }

    pub fn state(&self) -> DsaClientState {
        match &self.in_flight {
            Some(f) => DsaClientState::WaitingDsaRsp(f.request.transaction_id),
            None => DsaClientState::Idle,
        }
    }

    /// Queues a flow to be negotiated once the station is registered.
    pub fn add_service_flow(&mut self, mut flow: ServiceFlow) {
        flow.state = ServiceFlowState::Pending;
        self.provisioned.push_back(flow);
    }

    pub fn rejected_flows(&self) -> &[ServiceFlow] {
        &self.rejected
    }

    pub fn are_service_flows_allocated(&self) -> bool {
        self.provisioned.is_empty() && self.in_flight.is_none()
    }

    /// Starts the next negotiation if none is running.
    pub fn initiate_service_flows(&mut self) -> Option<(DsaReq, TimerToken)> {
        if self.in_flight.is_some() {
            return None;
        }
        self.schedule_dsa_req()
    }

    /// Builds the DSA-REQ for the next provisioned flow and arms the response timer.
    pub fn schedule_dsa_req(&mut self) -> Option<(DsaReq, TimerToken)> {
        if self.in_flight.is_some() {
            return None;
        }
        let flow = self.provisioned.pop_front()?;
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1).max(1);
        let request = DsaReq {
            transaction_id,
            service_flow: flow.to_tlv(),
        };
        debug!(
            "DSA-REQ {} for {:?} {:?} flow",
            transaction_id, flow.direction, flow.scheduling_type
        );
        self.in_flight = Some(InFlight {
            request: request.clone(),
            flow,
            retries: 0,
        });
        Some((request, self.timer.arm()))
    }

    /// Handles the base station's answer. On success the flow and its
    /// transport connection become live.
    pub fn process_dsa_rsp(
        &mut self,
        rsp: &DsaRsp,
        connections: &mut ConnectionManager,
    ) -> DsaRspOutcome {
        if let Some(ack) = self.last_ack {
            if ack.transaction_id == rsp.transaction_id && self.in_flight.is_none() {
                return DsaRspOutcome::Duplicate(ack);
            }
        }
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.request.transaction_id == rsp.transaction_id);
        if !matches {
            debug!("Ignoring DSA-RSP {} with no matching request", rsp.transaction_id);
            return DsaRspOutcome::Ignored;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return DsaRspOutcome::Ignored;
        };
        self.timer.cancel();

        let mut code = rsp.confirmation_code;
        let assigned = ServiceFlow::from_tlv(&rsp.service_flow)
            .ok()
            .and_then(|f| f.cid.filter(|_| f.sfid != 0).map(|cid| (f.sfid, cid)));
        if code.is_success() && assigned.is_none() {
            warn!("DSA-RSP {} accepted without SFID/CID", rsp.transaction_id);
            code = ConfirmationCode::RejectRequiredParameterNotPresent;
        }

        let ack = DsaAck {
            transaction_id: rsp.transaction_id,
            confirmation_code: code,
        };
        self.last_ack = Some(ack);

        match (code.is_success(), assigned) {
            (true, Some((sfid, cid))) => {
                let mut flow = in_flight.flow;
                flow.sfid = sfid;
                flow.cid = Some(cid);
                flow.state = ServiceFlowState::Active;
                let mut connection = connections.new_connection(cid, CidType::Transport);
                connection.set_service_flow(sfid, flow.scheduling_type);
                connections.add_connection(connection);
                info!(
                    "Service flow {} active on {} ({:?})",
                    sfid, cid, flow.scheduling_type
                );
                self.base.add_service_flow(flow);
                DsaRspOutcome::Accepted { ack, sfid, cid }
            }
            _ => {
                warn!("DSA-REQ {} rejected: {:?}", rsp.transaction_id, code);
                let mut flow = in_flight.flow;
                flow.state = ServiceFlowState::Rejected;
                self.rejected.push(flow);
                DsaRspOutcome::Rejected { ack, code }
            }
        }
    }

    /// Retransmits the identical DSA-REQ, or gives the flow up once the retry budget is spent.
    pub fn on_dsa_rsp_timeout(&mut self, token: TimerToken) -> DsaTimeoutOutcome {
        if !self.timer.fire(token) {
            return DsaTimeoutOutcome::Stale;
        }
        let Some(in_flight) = self.in_flight.as_mut() else {
            return DsaTimeoutOutcome::Stale;
        };
        in_flight.retries += 1;
        if in_flight.retries > self.max_dsa_req_retries {
            warn!(
                "DSA-REQ {} unanswered after {} retries, flow rejected",
                in_flight.request.transaction_id, self.max_dsa_req_retries
            );
            if let Some(mut abandoned) = self.in_flight.take().map(|f| f.flow) {
                abandoned.state = ServiceFlowState::Rejected;
                self.rejected.push(abandoned);
            }
            return DsaTimeoutOutcome::Abandoned;
        }
        let request = in_flight.request.clone();
        DsaTimeoutOutcome::Resend(request, self.timer.arm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wimax_core::{Direction, SchedulingType};

    fn manager_with_flow(retries: u8) -> SsServiceFlowManager {
        let mut manager = SsServiceFlowManager::new(retries);
        manager.add_service_flow(ServiceFlow::new(Direction::Down, SchedulingType::Rtps));
        manager
    }

    fn accept(req: &DsaReq, sfid: Sfid, cid: Cid) -> DsaRsp {
        let mut flow = ServiceFlow::from_tlv(&req.service_flow).unwrap();
        flow.sfid = sfid;
        flow.cid = Some(cid);
        DsaRsp {
            transaction_id: req.transaction_id,
            confirmation_code: ConfirmationCode::Success,
            service_flow: flow.to_tlv(),
        }
    }

    #[test]
    fn test_successful_negotiation_creates_connection() {
        let mut manager = manager_with_flow(3);
        let mut connections = ConnectionManager::new(16);
        let (req, _token) = manager.initiate_service_flows().unwrap();
        assert_eq!(manager.state(), DsaClientState::WaitingDsaRsp(req.transaction_id));
        assert!(manager.initiate_service_flows().is_none());

        let rsp = accept(&req, 42, Cid::new(0x0810));
        let outcome = manager.process_dsa_rsp(&rsp, &mut connections);
        assert!(matches!(outcome, DsaRspOutcome::Accepted { sfid: 42, .. }));
        assert_eq!(manager.state(), DsaClientState::Idle);
        assert!(manager.are_service_flows_allocated());
        assert!(manager.base().get_service_flow(42).unwrap().is_active());
        assert_eq!(
            connections.get_connection(Cid::new(0x0810)).unwrap().sfid(),
            Some(42)
        );

        // the base station repeating its response gets the same ACK back
        assert!(matches!(
            manager.process_dsa_rsp(&rsp, &mut connections),
            DsaRspOutcome::Duplicate(_)
        ));
    }

    #[test]
    fn test_retries_resend_identical_request_then_abandon() {
        let mut manager = manager_with_flow(2);
        let (req, mut token) = manager.initiate_service_flows().unwrap();
        for _ in 0..2 {
            match manager.on_dsa_rsp_timeout(token) {
                DsaTimeoutOutcome::Resend(again, next) => {
                    assert_eq!(again, req);
                    token = next;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(manager.on_dsa_rsp_timeout(token), DsaTimeoutOutcome::Abandoned);
        assert_eq!(manager.rejected_flows().len(), 1);
        assert_eq!(manager.rejected_flows()[0].state, ServiceFlowState::Rejected);
        assert!(manager.are_service_flows_allocated());
    }

    #[test]
    fn test_cancelled_timer_does_not_mutate() {
        let mut manager = manager_with_flow(1);
        let mut connections = ConnectionManager::new(16);
        let (req, token) = manager.initiate_service_flows().unwrap();
        manager.process_dsa_rsp(&accept(&req, 7, Cid::new(0x0900)), &mut connections);

        assert_eq!(manager.on_dsa_rsp_timeout(token), DsaTimeoutOutcome::Stale);
        assert!(manager.rejected_flows().is_empty());
        assert_eq!(manager.base().len(), 1);
    }

    #[test]
    fn test_rejection_moves_to_next_flow() {
        let mut manager = manager_with_flow(1);
        manager.add_service_flow(ServiceFlow::new(Direction::Up, SchedulingType::BestEffort));
        let mut connections = ConnectionManager::new(16);
        let (req, _) = manager.initiate_service_flows().unwrap();
        let rsp = DsaRsp {
            transaction_id: req.transaction_id,
            confirmation_code: ConfirmationCode::RejectTemporary,
            service_flow: req.service_flow.clone(),
        };
        assert!(matches!(
            manager.process_dsa_rsp(&rsp, &mut connections),
            DsaRspOutcome::Rejected { code: ConfirmationCode::RejectTemporary, .. }
        ));
        let (next, _) = manager.initiate_service_flows().unwrap();
        assert_ne!(next.transaction_id, req.transaction_id);
        assert!(connections.is_empty());
    }
}

//! Server side of dynamic service addition.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use wimax_core::messages::{ConfirmationCode, DsaAck, DsaReq, DsaRsp};
use wimax_core::types::TransactionId;
use wimax_core::{Cid, CidFactory, CidType, Direction, Sfid, SimTime};

use super::ServiceFlowManager;
use crate::connection_manager::ConnectionManager;
use crate::scheduler::UplinkScheduler;
use crate::service_flow::{ServiceFlow, ServiceFlowState};
use crate::ss_record::SsManager;
use crate::timer::{Timer, TimerToken};

#[derive(Debug)]
struct ServerTransaction {
    sfid: Option<Sfid>,
    response: DsaRsp,
    retries: u8,
    timer: Timer,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DsaReqOutcome {
    /// Flow admitted; the response goes out on the primary CID and waits for an ACK.
    Accepted {
        rsp: DsaRsp,
        sfid: Sfid,
        token: TimerToken,
    },
    Rejected { rsp: DsaRsp },
    /// A retransmitted request; the stored response goes out again.
    Duplicate { rsp: DsaRsp },
    /// Not from a known station.
    Ignored,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AckTimeoutOutcome {
    Stale,
    Resend { rsp: DsaRsp, token: TimerToken },
    RolledBack { sfid: Sfid },
}

/// Mutable pieces of the base station a DSA transaction touches.
pub struct AdmissionContext<'a> {
    pub ss_manager: &'a mut SsManager,
    pub connections: &'a mut ConnectionManager,
    pub factory: &'a mut CidFactory,
    pub ul_scheduler: &'a mut dyn UplinkScheduler,
    pub now: SimTime,
}

#[derive(Debug)]
pub struct BsServiceFlowManager {
    base: ServiceFlowManager,
    next_sfid: Sfid,
    transactions: BTreeMap<(Cid, TransactionId), ServerTransaction>,
    max_dsa_rsp_retries: u8,
}

impl BsServiceFlowManager {
    pub fn new(max_dsa_rsp_retries: u8) -> Self {
        Self {
            base: ServiceFlowManager::new(),
            next_sfid: 1,
            transactions: BTreeMap::new(),
            max_dsa_rsp_retries,
        }
    }

    pub fn base(&self) -> &ServiceFlowManager {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut ServiceFlowManager {
        &mut self.base
    }

    fn reject(&mut self, key: (Cid, TransactionId), req: &DsaReq, code: ConfirmationCode) -> DsaReqOutcome {
        warn!("Rejecting DSA-REQ {} from {}: {:?}", req.transaction_id, key.0, code);
        let rsp = DsaRsp {
            transaction_id: req.transaction_id,
            confirmation_code: code,
            service_flow: req.service_flow.clone(),
        };
        self.transactions.insert(
            key,
            ServerTransaction {
                sfid: None,
                response: rsp.clone(),
                retries: 0,
                timer: Timer::default(),
            },
        );
        DsaReqOutcome::Rejected { rsp }
    }

    /// Admits the requested flow: assigns an SFID and transport CID, opens the
    /// connection and registers uplink flows with the scheduler.
    pub fn process_dsa_req(
        &mut self,
        primary_cid: Cid,
        req: &DsaReq,
        ctx: &mut AdmissionContext<'_>,
    ) -> DsaReqOutcome {
        let key = (primary_cid, req.transaction_id);
        if let Some(transaction) = self.transactions.get(&key) {
            debug!("Duplicate DSA-REQ {} from {}", req.transaction_id, primary_cid);
            return DsaReqOutcome::Duplicate {
                rsp: transaction.response.clone(),
            };
        }
        let Some(ss) = ctx.ss_manager.get_by_cid(primary_cid) else {
            warn!("DSA-REQ on {} from unknown station", primary_cid);
            return DsaReqOutcome::Ignored;
        };
        if !ss.is_registered() {
            return self.reject(key, req, ConfirmationCode::RejectOther);
        }
        let mut flow = match ServiceFlow::from_tlv(&req.service_flow) {
            Ok(flow) if flow.scheduling_type.is_schedulable() => flow,
            _ => return self.reject(key, req, ConfirmationCode::RejectUnrecognizedConfiguration),
        };
        let modulation = ss.modulation;
        let mac_address = ss.mac_address;
        let cid = match ctx.connections.create_connection(CidType::Transport, ctx.factory) {
            Ok(cid) => cid,
            Err(e) => {
                warn!("No transport CID for {}: {}", mac_address, e);
                return self.reject(key, req, ConfirmationCode::RejectTemporary);
            }
        };

        let sfid = self.next_sfid;
        self.next_sfid += 1;
        flow.sfid = sfid;
        flow.cid = Some(cid);
        flow.state = ServiceFlowState::Pending;
        flow.modulation = modulation;
        if let Some(connection) = ctx.connections.get_connection_mut(cid) {
            connection.set_service_flow(sfid, flow.scheduling_type);
        }
        if let Some(record) = ctx.ss_manager.get_mut(&mac_address) {
            record.add_service_flow(sfid);
            record.are_service_flows_allocated = false;
            if flow.direction == Direction::Up {
                ctx.ul_scheduler.setup_service_flow(record, &flow, ctx.now);
            }
        }
        info!(
            "Admitted {:?} {:?} flow {} on {} for {}",
            flow.direction, flow.scheduling_type, sfid, cid, mac_address
        );

        let rsp = DsaRsp {
            transaction_id: req.transaction_id,
            confirmation_code: ConfirmationCode::Success,
            service_flow: flow.to_tlv(),
        };
        self.base.add_service_flow(flow);
        let mut timer = Timer::default();
        let token = timer.arm();
        self.transactions.insert(
            key,
            ServerTransaction {
                sfid: Some(sfid),
                response: rsp.clone(),
                retries: 0,
                timer,
            },
        );
        DsaReqOutcome::Accepted { rsp, sfid, token }
    }

    /// Completes and forgets a transaction. A successful ACK activates the
    /// flow; a failed one rolls it back. Returns the flow concerned.
    pub fn process_dsa_ack(
        &mut self,
        primary_cid: Cid,
        ack: &DsaAck,
        ctx: &mut AdmissionContext<'_>,
    ) -> Option<Sfid> {
        let Some(transaction) = self.transactions.remove(&(primary_cid, ack.transaction_id)) else {
            debug!("DSA-ACK {} on {} matches no transaction", ack.transaction_id, primary_cid);
            return None;
        };
        let sfid = transaction.sfid?;
        if !ack.confirmation_code.is_success() {
            self.roll_back(sfid, ctx);
            return Some(sfid);
        }
        let flow = self.base.get_service_flow_mut(sfid)?;
        if flow.state == ServiceFlowState::Pending {
            flow.state = ServiceFlowState::Active;
            info!("Service flow {} active", sfid);
        }
        if let Some(record) = ctx.ss_manager.get_mut_by_cid(primary_cid) {
            record.are_service_flows_allocated = record.service_flows.iter().all(|sfid| {
                self.base
                    .get_service_flow(*sfid)
                    .is_some_and(|f| f.state != ServiceFlowState::Pending)
            });
        }
        Some(sfid)
    }

    /// Re-sends the stored DSA-RSP, or rolls the flow back once retries run out.
    pub fn on_dsa_ack_timeout(
        &mut self,
        primary_cid: Cid,
        transaction_id: TransactionId,
        token: TimerToken,
        ctx: &mut AdmissionContext<'_>,
    ) -> AckTimeoutOutcome {
        let Some(transaction) = self.transactions.get_mut(&(primary_cid, transaction_id)) else {
            return AckTimeoutOutcome::Stale;
        };
        if !transaction.timer.fire(token) {
            return AckTimeoutOutcome::Stale;
        }
        let Some(sfid) = transaction.sfid else {
            return AckTimeoutOutcome::Stale;
        };
        transaction.retries += 1;
        if transaction.retries > self.max_dsa_rsp_retries {
            warn!(
                "No DSA-ACK for flow {} after {} retries, rolling back",
                sfid, self.max_dsa_rsp_retries
            );
            self.roll_back(sfid, ctx);
            return AckTimeoutOutcome::RolledBack { sfid };
        }
        let rsp = transaction.response.clone();
        AckTimeoutOutcome::Resend {
            rsp,
            token: transaction.timer.arm(),
        }
    }

    fn roll_back(&mut self, sfid: Sfid, ctx: &mut AdmissionContext<'_>) {
        let Some(flow) = self.base.remove_service_flow(sfid) else {
            return;
        };
        if let Some(cid) = flow.cid {
            ctx.connections.remove_connection(cid, ctx.factory);
        }
        for record in ctx.ss_manager.records_mut() {
            record.remove_service_flow(sfid);
        }
        ctx.ul_scheduler.remove_service_flow(sfid);
        self.transactions.retain(|_, t| t.sfid != Some(sfid));
    }

    /// Drops every flow of a deregistered station along with its transactions.
    pub fn release_station(&mut self, primary_cid: Cid, sfids: &[Sfid], ctx: &mut AdmissionContext<'_>) {
        for sfid in sfids {
            self.roll_back(*sfid, ctx);
        }
        self.transactions.retain(|(cid, _), _| *cid != primary_cid);
    }

    /// Transactions still held, acknowledged or not.
    pub fn open_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn pending_transactions(&self) -> usize {
        self.transactions
            .values()
            .filter(|t| t.timer.is_armed())
            .count()
    }
}

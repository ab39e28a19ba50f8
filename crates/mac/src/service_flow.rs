//! QoS contract of a unidirectional flow and its runtime counters.

use std::time::Duration;

use wimax_core::tlv::{sf, DOWNLINK_SERVICE_FLOW, UPLINK_SERVICE_FLOW};
use wimax_core::{Cid, Direction, Modulation, SchedulingType, Sfid, SimTime, Tlv, TlvValue};

use crate::classifier::CsParameters;
use crate::MacError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFlowState {
    /// Provisioned or under DSA negotiation.
    Pending,
    Active,
    Rejected,
}

/// Runtime counters. Local to a station, never serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFlowRecord {
    pub pkts_sent: u64,
    pub bytes_sent: u64,
    pub pkts_received: u64,
    pub bytes_received: u64,
    pub requested_bandwidth: u32,
    pub granted_bandwidth: u32,
    /// Requested bytes not yet covered by a grant.
    pub backlogged: u32,
    /// Bytes granted since the scheduling window last expired.
    pub bw_since_last_expiry: u32,
    pub last_grant_time: SimTime,
    pub dl_timestamp: SimTime,
}

impl ServiceFlowRecord {
    pub fn pending_request(&self) -> u32 {
        self.requested_bandwidth.saturating_sub(self.granted_bandwidth)
    }

    pub fn set_aggregate_request(&mut self, bytes: u32) {
        self.requested_bandwidth = bytes;
        self.granted_bandwidth = 0;
        self.backlogged = bytes;
    }

    pub fn add_incremental_request(&mut self, bytes: u32) {
        self.requested_bandwidth = self.requested_bandwidth.saturating_add(bytes);
        self.backlogged = self.pending_request();
    }

    pub fn record_grant(&mut self, bytes: u32, now: SimTime) {
        self.granted_bandwidth = self.granted_bandwidth.saturating_add(bytes);
        self.bw_since_last_expiry = self.bw_since_last_expiry.saturating_add(bytes);
        self.backlogged = self.pending_request();
        self.last_grant_time = now;
    }

    pub fn record_sent(&mut self, payload_bytes: usize, sdu_complete: bool) {
        self.bytes_sent += payload_bytes as u64;
        if sdu_complete {
            self.pkts_sent += 1;
        }
    }

    pub fn record_received(&mut self, sdu_bytes: usize) {
        self.bytes_received += sdu_bytes as u64;
        self.pkts_received += 1;
    }

    pub fn reset_window(&mut self) {
        self.bw_since_last_expiry = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFlow {
    /// Zero until the base station assigns one.
    pub sfid: Sfid,
    pub direction: Direction,
    pub scheduling_type: SchedulingType,
    pub cid: Option<Cid>,
    pub state: ServiceFlowState,
    pub modulation: Modulation,
    pub service_class_name: String,
    pub qos_param_set_type: u8,
    pub traffic_priority: u8,
    /// bits/s
    pub max_sustained_traffic_rate: u32,
    pub max_traffic_burst: u32,
    /// bits/s
    pub min_reserved_traffic_rate: u32,
    pub min_tolerable_traffic_rate: u32,
    pub request_transmission_policy: u32,
    /// ms
    pub tolerated_jitter: u32,
    /// ms
    pub maximum_latency: u32,
    pub fixed_vs_variable_sdu: u8,
    pub sdu_size: u8,
    pub target_said: u16,
    pub arq_enable: u8,
    pub arq_window_size: u16,
    pub arq_retry_timeout_tx: u16,
    pub arq_retry_timeout_rx: u16,
    pub arq_block_lifetime: u16,
    pub arq_sync_loss: u16,
    pub arq_deliver_in_order: u8,
    pub arq_purge_timeout: u16,
    pub arq_block_size: u16,
    pub cs_specification: u8,
    /// ms, UGS only
    pub unsolicited_grant_interval: u16,
    /// ms, polled classes
    pub unsolicited_polling_interval: u16,
    pub cs_parameters: CsParameters,
    pub record: ServiceFlowRecord,
}

impl ServiceFlow {
    pub fn new(direction: Direction, scheduling_type: SchedulingType) -> Self {
        Self {
            sfid: 0,
            direction,
            scheduling_type,
            cid: None,
            state: ServiceFlowState::Pending,
            modulation: Modulation::Bpsk12,
            service_class_name: String::new(),
            qos_param_set_type: 0,
            traffic_priority: 0,
            max_sustained_traffic_rate: 0,
            max_traffic_burst: 0,
            min_reserved_traffic_rate: 0,
            min_tolerable_traffic_rate: 0,
            request_transmission_policy: 0,
            tolerated_jitter: 0,
            maximum_latency: 0,
            fixed_vs_variable_sdu: 0,
            sdu_size: 0,
            target_said: 0,
            arq_enable: 0,
            arq_window_size: 0,
            arq_retry_timeout_tx: 0,
            arq_retry_timeout_rx: 0,
            arq_block_lifetime: 0,
            arq_sync_loss: 0,
            arq_deliver_in_order: 0,
            arq_purge_timeout: 0,
            arq_block_size: 0,
            // IPv4
            cs_specification: 1,
            unsolicited_grant_interval: 0,
            unsolicited_polling_interval: 0,
            cs_parameters: CsParameters::default(),
            record: ServiceFlowRecord::default(),
        }
    }

    pub fn with_service_class_name(mut self, name: impl Into<String>) -> Self {
        self.service_class_name = name.into();
        self
    }

    pub fn with_traffic_priority(mut self, priority: u8) -> Self {
        self.traffic_priority = priority;
        self
    }

    pub fn with_max_sustained_traffic_rate(mut self, bps: u32) -> Self {
        self.max_sustained_traffic_rate = bps;
        self
    }

    pub fn with_min_reserved_traffic_rate(mut self, bps: u32) -> Self {
        self.min_reserved_traffic_rate = bps;
        self
    }

    pub fn with_maximum_latency(mut self, ms: u32) -> Self {
        self.maximum_latency = ms;
        self
    }

    pub fn with_tolerated_jitter(mut self, ms: u32) -> Self {
        self.tolerated_jitter = ms;
        self
    }

    pub fn with_unsolicited_grant_interval(mut self, ms: u16) -> Self {
        self.unsolicited_grant_interval = ms;
        self
    }

    pub fn with_unsolicited_polling_interval(mut self, ms: u16) -> Self {
        self.unsolicited_polling_interval = ms;
        self
    }

    pub fn with_cs_parameters(mut self, cs_parameters: CsParameters) -> Self {
        self.cs_parameters = cs_parameters;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceFlowState::Active
    }

    /// Period between UGS grants, at least one frame.
    pub fn grant_interval(&self, frame_duration: Duration) -> Duration {
        Duration::from_millis(self.unsolicited_grant_interval as u64).max(frame_duration)
    }

    /// Bytes of payload owed per UGS grant: the sustained rate over one grant interval.
    pub fn unsolicited_grant_size(&self, frame_duration: Duration) -> u32 {
        let interval_ns = self.grant_interval(frame_duration).as_nanos() as u64;
        let bits = self.max_sustained_traffic_rate as u64 * interval_ns;
        bits.div_ceil(8 * 1_000_000_000) as u32
    }

    pub fn polling_interval(&self, default: Duration) -> Duration {
        match self.unsolicited_polling_interval {
            0 => default,
            ms => Duration::from_millis(ms as u64),
        }
    }

    pub fn maximum_latency_duration(&self) -> Duration {
        Duration::from_millis(self.maximum_latency as u64)
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut items = Vec::with_capacity(32);
        items.push(Tlv::u32(sf::SFID, self.sfid));
        if let Some(cid) = self.cid {
            items.push(Tlv::u16(sf::CID, cid.identifier()));
        }
        if !self.service_class_name.is_empty() {
            items.push(Tlv::new(
                sf::SERVICE_CLASS_NAME,
                TlvValue::Bytes(self.service_class_name.as_bytes().to_vec()),
            ));
        }
        items.extend([
            Tlv::u8(sf::QOS_PARAMETER_SET_TYPE, self.qos_param_set_type),
            Tlv::u8(sf::TRAFFIC_PRIORITY, self.traffic_priority),
            Tlv::u32(sf::MAX_SUSTAINED_TRAFFIC_RATE, self.max_sustained_traffic_rate),
            Tlv::u32(sf::MAX_TRAFFIC_BURST, self.max_traffic_burst),
            Tlv::u32(sf::MIN_RESERVED_TRAFFIC_RATE, self.min_reserved_traffic_rate),
            Tlv::u32(sf::MIN_TOLERABLE_TRAFFIC_RATE, self.min_tolerable_traffic_rate),
            Tlv::u8(sf::SCHEDULING_TYPE, self.scheduling_type as u8),
            Tlv::u32(sf::REQUEST_TRANSMISSION_POLICY, self.request_transmission_policy),
            Tlv::u32(sf::TOLERATED_JITTER, self.tolerated_jitter),
            Tlv::u32(sf::MAXIMUM_LATENCY, self.maximum_latency),
            Tlv::u8(sf::FIXED_VS_VARIABLE_SDU, self.fixed_vs_variable_sdu),
            Tlv::u8(sf::SDU_SIZE, self.sdu_size),
            Tlv::u16(sf::TARGET_SAID, self.target_said),
            Tlv::u8(sf::ARQ_ENABLE, self.arq_enable),
            Tlv::u16(sf::ARQ_WINDOW_SIZE, self.arq_window_size),
            Tlv::u16(sf::ARQ_RETRY_TIMEOUT_TX, self.arq_retry_timeout_tx),
            Tlv::u16(sf::ARQ_RETRY_TIMEOUT_RX, self.arq_retry_timeout_rx),
            Tlv::u16(sf::ARQ_BLOCK_LIFETIME, self.arq_block_lifetime),
            Tlv::u16(sf::ARQ_SYNC_LOSS, self.arq_sync_loss),
            Tlv::u8(sf::ARQ_DELIVER_IN_ORDER, self.arq_deliver_in_order),
            Tlv::u16(sf::ARQ_PURGE_TIMEOUT, self.arq_purge_timeout),
            Tlv::u16(sf::ARQ_BLOCK_SIZE, self.arq_block_size),
            Tlv::u8(sf::CS_SPECIFICATION, self.cs_specification),
            Tlv::u16(sf::UNSOLICITED_GRANT_INTERVAL, self.unsolicited_grant_interval),
            Tlv::u16(sf::UNSOLICITED_POLLING_INTERVAL, self.unsolicited_polling_interval),
            self.cs_parameters.to_tlv(),
        ]);
        let tlv_type = match self.direction {
            Direction::Up => UPLINK_SERVICE_FLOW,
            Direction::Down => DOWNLINK_SERVICE_FLOW,
        };
        Tlv::vector(tlv_type, items)
    }

    /// Rebuilds a flow from its TLV encoding. Absent parameters keep their defaults.
    pub fn from_tlv(tlv: &Tlv) -> Result<Self, MacError> {
        let direction = match tlv.tlv_type() {
            UPLINK_SERVICE_FLOW => Direction::Up,
            DOWNLINK_SERVICE_FLOW => Direction::Down,
            _ => return Err(MacError::InvalidServiceFlow("not a service flow TLV")),
        };
        let items = tlv
            .as_vector()
            .ok_or(MacError::InvalidServiceFlow("service flow is not a vector"))?;

        let mut flow = ServiceFlow::new(direction, SchedulingType::Undefined);
        for item in items {
            match (item.tlv_type(), item.value()) {
                (sf::SFID, TlvValue::U32(v)) => flow.sfid = *v,
                (sf::CID, TlvValue::U16(v)) => flow.cid = Some(Cid::new(*v)),
                (sf::SERVICE_CLASS_NAME, TlvValue::Bytes(b)) => {
                    flow.service_class_name = String::from_utf8_lossy(b).into_owned()
                }
                (sf::QOS_PARAMETER_SET_TYPE, TlvValue::U8(v)) => flow.qos_param_set_type = *v,
                (sf::TRAFFIC_PRIORITY, TlvValue::U8(v)) => flow.traffic_priority = *v,
                (sf::MAX_SUSTAINED_TRAFFIC_RATE, TlvValue::U32(v)) => {
                    flow.max_sustained_traffic_rate = *v
                }
                (sf::MAX_TRAFFIC_BURST, TlvValue::U32(v)) => flow.max_traffic_burst = *v,
                (sf::MIN_RESERVED_TRAFFIC_RATE, TlvValue::U32(v)) => {
                    flow.min_reserved_traffic_rate = *v
                }
                (sf::MIN_TOLERABLE_TRAFFIC_RATE, TlvValue::U32(v)) => {
                    flow.min_tolerable_traffic_rate = *v
                }
                (sf::SCHEDULING_TYPE, TlvValue::U8(v)) => {
                    flow.scheduling_type = SchedulingType::try_from(*v)?
                }
                (sf::REQUEST_TRANSMISSION_POLICY, TlvValue::U32(v)) => {
                    flow.request_transmission_policy = *v
                }
                (sf::TOLERATED_JITTER, TlvValue::U32(v)) => flow.tolerated_jitter = *v,
                (sf::MAXIMUM_LATENCY, TlvValue::U32(v)) => flow.maximum_latency = *v,
                (sf::FIXED_VS_VARIABLE_SDU, TlvValue::U8(v)) => flow.fixed_vs_variable_sdu = *v,
                (sf::SDU_SIZE, TlvValue::U8(v)) => flow.sdu_size = *v,
                (sf::TARGET_SAID, TlvValue::U16(v)) => flow.target_said = *v,
                (sf::ARQ_ENABLE, TlvValue::U8(v)) => flow.arq_enable = *v,
                (sf::ARQ_WINDOW_SIZE, TlvValue::U16(v)) => flow.arq_window_size = *v,
                (sf::ARQ_RETRY_TIMEOUT_TX, TlvValue::U16(v)) => flow.arq_retry_timeout_tx = *v,
                (sf::ARQ_RETRY_TIMEOUT_RX, TlvValue::U16(v)) => flow.arq_retry_timeout_rx = *v,
                (sf::ARQ_BLOCK_LIFETIME, TlvValue::U16(v)) => flow.arq_block_lifetime = *v,
                (sf::ARQ_SYNC_LOSS, TlvValue::U16(v)) => flow.arq_sync_loss = *v,
                (sf::ARQ_DELIVER_IN_ORDER, TlvValue::U8(v)) => flow.arq_deliver_in_order = *v,
                (sf::ARQ_PURGE_TIMEOUT, TlvValue::U16(v)) => flow.arq_purge_timeout = *v,
                (sf::ARQ_BLOCK_SIZE, TlvValue::U16(v)) => flow.arq_block_size = *v,
                (sf::CS_SPECIFICATION, TlvValue::U8(v)) => flow.cs_specification = *v,
                (sf::UNSOLICITED_GRANT_INTERVAL, TlvValue::U16(v)) => {
                    flow.unsolicited_grant_interval = *v
                }
                (sf::UNSOLICITED_POLLING_INTERVAL, TlvValue::U16(v)) => {
                    flow.unsolicited_polling_interval = *v
                }
                (sf::IPV4_CS_PARAMETERS, TlvValue::Vector(_)) => {
                    flow.cs_parameters = CsParameters::from_tlv(item)?
                }
                _ => {}
            }
        }
        Ok(flow)
    }
}

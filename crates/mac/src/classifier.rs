//! IPv4 convergence-sublayer classification: maps packets to service flows by
//! matching their five-tuple against each flow's classification rule.

use std::net::Ipv4Addr;

use wimax_core::tlv::sf::IPV4_CS_PARAMETERS;
use wimax_core::tlv::{cs_param, rule, Ipv4AddressMask, PortRange, TosRange};
use wimax_core::{Direction, Sfid, Tlv, TlvValue};

use crate::packet::FiveTuple;
use crate::service_flow::ServiceFlow;
use crate::MacError;

/// Packet classification rule. An empty list matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpcsClassifierRecord {
    pub src_addresses: Vec<Ipv4AddressMask>,
    pub dst_addresses: Vec<Ipv4AddressMask>,
    pub protocols: Vec<u8>,
    pub src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    pub tos: Option<TosRange>,
    pub priority: u8,
    pub index: u16,
}

impl IpcsClassifierRecord {
    pub fn new(priority: u8, index: u16) -> Self {
        Self {
            priority,
            index,
            ..Default::default()
        }
    }

    pub fn with_src_address(mut self, address: Ipv4Addr, mask: Ipv4Addr) -> Self {
        self.src_addresses.push(Ipv4AddressMask::new(address, mask));
        self
    }

    pub fn with_dst_address(mut self, address: Ipv4Addr, mask: Ipv4Addr) -> Self {
        self.dst_addresses.push(Ipv4AddressMask::new(address, mask));
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn with_src_ports(mut self, low: u16, high: u16) -> Self {
        self.src_ports.push(PortRange::new(low, high));
        self
    }

    pub fn with_dst_ports(mut self, low: u16, high: u16) -> Self {
        self.dst_ports.push(PortRange::new(low, high));
        self
    }

    pub fn matches(&self, t: &FiveTuple) -> bool {
        fn any_or_empty<T>(items: &[T], f: impl Fn(&T) -> bool) -> bool {
            items.is_empty() || items.iter().any(f)
        }
        any_or_empty(&self.src_addresses, |a| a.matches(t.src))
            && any_or_empty(&self.dst_addresses, |a| a.matches(t.dst))
            && any_or_empty(&self.protocols, |p| *p == t.proto)
            && any_or_empty(&self.src_ports, |r| r.contains(t.src_port))
            && any_or_empty(&self.dst_ports, |r| r.contains(t.dst_port))
            && self.tos.map_or(true, |tos| tos.matches(t.tos))
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut items = vec![Tlv::u8(rule::PRIORITY, self.priority)];
        if let Some(tos) = self.tos {
            items.push(Tlv::new(rule::TOS, TlvValue::Tos(tos)));
        }
        if !self.protocols.is_empty() {
            items.push(Tlv::new(rule::PROTOCOL, TlvValue::Protocols(self.protocols.clone())));
        }
        if !self.src_addresses.is_empty() {
            items.push(Tlv::new(
                rule::IP_SRC,
                TlvValue::Ipv4Addresses(self.src_addresses.clone()),
            ));
        }
        if !self.dst_addresses.is_empty() {
            items.push(Tlv::new(
                rule::IP_DST,
                TlvValue::Ipv4Addresses(self.dst_addresses.clone()),
            ));
        }
        if !self.src_ports.is_empty() {
            items.push(Tlv::new(rule::PORT_SRC, TlvValue::PortRanges(self.src_ports.clone())));
        }
        if !self.dst_ports.is_empty() {
            items.push(Tlv::new(rule::PORT_DST, TlvValue::PortRanges(self.dst_ports.clone())));
        }
        items.push(Tlv::u16(rule::INDEX, self.index));
        Tlv::vector(cs_param::PACKET_CLASSIFICATION_RULE, items)
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, MacError> {
        let items = tlv
            .as_vector()
            .ok_or(MacError::InvalidServiceFlow("classification rule is not a vector"))?;
        let mut record = IpcsClassifierRecord::default();
        for item in items {
            match (item.tlv_type(), item.value()) {
                (rule::PRIORITY, TlvValue::U8(v)) => record.priority = *v,
                (rule::TOS, TlvValue::Tos(t)) => record.tos = Some(*t),
                (rule::PROTOCOL, TlvValue::Protocols(p)) => record.protocols = p.clone(),
                (rule::IP_SRC, TlvValue::Ipv4Addresses(a)) => record.src_addresses = a.clone(),
                (rule::IP_DST, TlvValue::Ipv4Addresses(a)) => record.dst_addresses = a.clone(),
                (rule::PORT_SRC, TlvValue::PortRanges(r)) => record.src_ports = r.clone(),
                (rule::PORT_DST, TlvValue::PortRanges(r)) => record.dst_ports = r.clone(),
                (rule::INDEX, TlvValue::U16(v)) => record.index = *v,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// IPv4 convergence sublayer parameters of a service flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsParameters {
    /// Dynamic service change action: 0 add, 1 replace, 2 delete.
    pub action: u8,
    pub classifier: IpcsClassifierRecord,
}

impl CsParameters {
    pub fn new(classifier: IpcsClassifierRecord) -> Self {
        Self { action: 0, classifier }
    }

    pub fn to_tlv(&self) -> Tlv {
        Tlv::vector(
            IPV4_CS_PARAMETERS,
            vec![
                Tlv::u8(cs_param::CLASSIFIER_DSC_ACTION, self.action),
                self.classifier.to_tlv(),
            ],
        )
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, MacError> {
        let action = tlv
            .find(cs_param::CLASSIFIER_DSC_ACTION)
            .and_then(Tlv::as_u8)
            .unwrap_or(0);
        let classifier = match tlv.find(cs_param::PACKET_CLASSIFICATION_RULE) {
            Some(rule) => IpcsClassifierRecord::from_tlv(rule)?,
            None => IpcsClassifierRecord::default(),
        };
        Ok(Self { action, classifier })
    }
}

pub struct IpcsClassifier;

impl IpcsClassifier {
    /// Returns the SFID of the highest-priority active flow in `direction`
    /// whose rule matches, lowest SFID first among equal priorities.
    pub fn classify<'a>(
        packet: &[u8],
        flows: impl IntoIterator<Item = &'a ServiceFlow>,
        direction: Direction,
    ) -> Option<Sfid> {
        let tuple = FiveTuple::parse(packet)?;
        flows
            .into_iter()
            .filter(|sf| sf.direction == direction && sf.is_active())
            .filter(|sf| sf.cs_parameters.classifier.matches(&tuple))
            .min_by_key(|sf| (std::cmp::Reverse(sf.cs_parameters.classifier.priority), sf.sfid))
            .map(|sf| sf.sfid)
    }
}

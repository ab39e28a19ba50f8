//! Per-connection outbound queue with fragmentation bookkeeping.

use std::collections::VecDeque;

use bytes::Bytes;
use log::trace;
use wimax_core::header::{FRAGMENTATION_SUBHEADER_SIZE, GENERIC_MAC_HEADER_SIZE, MAX_PDU_LENGTH};
use wimax_core::{
    FragmentControl, FragmentationSubheader, MacHeader, MacHeaderType, MacPdu, SimTime,
};

/// Smallest PDU worth emitting as a fragment: header, subheader and one payload byte.
pub const MIN_FRAGMENT_SIZE: usize = GENERIC_MAC_HEADER_SIZE + FRAGMENTATION_SUBHEADER_SIZE + 1;

#[derive(Debug, Clone)]
pub struct QueueElement {
    pub packet: Bytes,
    pub header: MacHeader,
    pub enqueued_at: SimTime,
    /// True once the first fragment of this packet has left the queue.
    pub fragmentation: bool,
    pub fragment_number: u32,
    pub fragment_offset: usize,
}

impl QueueElement {
    pub fn header_type(&self) -> MacHeaderType {
        self.header.header_type()
    }

    pub fn remaining_payload(&self) -> usize {
        self.packet.len() - self.fragment_offset
    }

    /// Bytes on air needed to send what is left of this element in one PDU.
    pub fn size(&self) -> usize {
        match self.header {
            MacHeader::BandwidthRequest(_) => self.header_size(),
            MacHeader::Generic(_) => self.header_size() + self.remaining_payload(),
        }
    }

    fn header_size(&self) -> usize {
        match self.header {
            MacHeader::BandwidthRequest(_) => wimax_core::header::BANDWIDTH_REQUEST_HEADER_SIZE,
            MacHeader::Generic(_) if self.fragmentation => {
                GENERIC_MAC_HEADER_SIZE + FRAGMENTATION_SUBHEADER_SIZE
            }
            MacHeader::Generic(_) => GENERIC_MAC_HEADER_SIZE,
        }
    }

    /// Emits everything left, closing an in-progress fragmentation with a last fragment.
    fn into_pdu(self) -> MacPdu {
        match self.header {
            MacHeader::BandwidthRequest(h) => MacPdu::bandwidth_request(h),
            MacHeader::Generic(h) => {
                let fragmentation = self
                    .fragmentation
                    .then(|| FragmentationSubheader::new(FragmentControl::Last, self.fragment_number));
                let payload = self.packet.slice(self.fragment_offset..);
                MacPdu::from_parts(h, None, fragmentation, payload)
            }
        }
    }

    fn take_fragment(&mut self, payload_len: usize) -> Option<MacPdu> {
        let MacHeader::Generic(h) = self.header else {
            return None;
        };
        let fc = if self.fragmentation {
            FragmentControl::Middle
        } else {
            FragmentControl::First
        };
        let subheader = FragmentationSubheader::new(fc, self.fragment_number);
        let payload = self
            .packet
            .slice(self.fragment_offset..self.fragment_offset + payload_len);
        self.fragmentation = true;
        self.fragment_offset += payload_len;
        self.fragment_number += 1;
        Some(MacPdu::from_parts(h, None, Some(subheader), payload))
    }
}

#[derive(Debug)]
pub struct WimaxMacQueue {
    max_size: usize,
    elements: VecDeque<QueueElement>,
    dropped: u64,
}

impl WimaxMacQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            elements: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Appends to the tail. Fails when the queue already holds `max_size` elements.
    pub fn enqueue(&mut self, packet: Bytes, header: MacHeader, now: SimTime) -> bool {
        if self.elements.len() >= self.max_size {
            self.dropped += 1;
            trace!("Queue full ({} elements), dropping packet", self.max_size);
            return false;
        }
        self.elements.push_back(QueueElement {
            packet,
            header,
            enqueued_at: now,
            fragmentation: false,
            fragment_number: 0,
            fragment_offset: 0,
        });
        true
    }

    fn position(&self, header_type: MacHeaderType) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| e.header_type() == header_type)
    }

    /// Removes the first element of `header_type` and returns it as a single PDU.
    pub fn dequeue(&mut self, header_type: MacHeaderType) -> Option<MacPdu> {
        let index = self.position(header_type)?;
        self.elements.remove(index).map(QueueElement::into_pdu)
    }

    /// Like `dequeue`, but never emits more than `available_bytes`, nor more
    /// than the 11-bit LEN field can describe. A generic packet that does not
    /// fit is split, and the remainder stays at its position.
    pub fn dequeue_with_budget(
        &mut self,
        header_type: MacHeaderType,
        available_bytes: usize,
    ) -> Option<MacPdu> {
        let budget = available_bytes.min(MAX_PDU_LENGTH);
        let index = self.position(header_type)?;
        let element = &mut self.elements[index];
        if element.size() <= budget {
            return self.elements.remove(index).map(QueueElement::into_pdu);
        }
        if header_type != MacHeaderType::Generic || budget < MIN_FRAGMENT_SIZE {
            return None;
        }
        let payload_len = budget - GENERIC_MAC_HEADER_SIZE - FRAGMENTATION_SUBHEADER_SIZE;
        element.take_fragment(payload_len)
    }

    /// Whether sending the first `header_type` element within `available_bytes` needs a split.
    pub fn needs_fragmentation(&self, header_type: MacHeaderType, available_bytes: usize) -> bool {
        self.peek(header_type)
            .is_some_and(|e| e.size() > available_bytes)
    }

    pub fn peek(&self, header_type: MacHeaderType) -> Option<&QueueElement> {
        self.position(header_type).map(|i| &self.elements[i])
    }

    pub fn first_packet_required_bytes(&self, header_type: MacHeaderType) -> usize {
        self.peek(header_type).map_or(0, QueueElement::size)
    }

    pub fn queue_length_with_mac_overhead(&self) -> usize {
        self.elements.iter().map(QueueElement::size).sum()
    }

    /// Generic backlog only, the figure a station reports in bandwidth requests.
    pub fn data_length_with_mac_overhead(&self) -> usize {
        self.elements
            .iter()
            .filter(|e| e.header_type() == MacHeaderType::Generic)
            .map(QueueElement::size)
            .sum()
    }

    pub fn n_packets(&self) -> usize {
        self.elements.len()
    }

    pub fn has_packets(&self, header_type: MacHeaderType) -> bool {
        self.position(header_type).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

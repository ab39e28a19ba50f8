use bytes::{Bytes, BytesMut};
use log::{trace, warn};
use wimax_core::{
    Cid, CidType, FragmentControl, GenericMacHeader, MacHeader, MacHeaderType, MacPdu,
    SchedulingType, Sfid, SimTime,
};

use crate::queue::WimaxMacQueue;

#[derive(Debug)]
struct Reassembly {
    next_fsn: u8,
    data: BytesMut,
}

/// A logical channel: one CID, its outbound queue, and for transport
/// connections the service flow it carries.
#[derive(Debug)]
pub struct WimaxConnection {
    cid: Cid,
    cid_type: CidType,
    queue: WimaxMacQueue,
    sfid: Option<Sfid>,
    scheduling_type: SchedulingType,
    reassembly: Option<Reassembly>,
}

impl WimaxConnection {
    pub fn new(cid: Cid, cid_type: CidType, queue_max_size: usize) -> Self {
        Self {
            cid,
            cid_type,
            queue: WimaxMacQueue::new(queue_max_size),
            sfid: None,
            scheduling_type: SchedulingType::None,
            reassembly: None,
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn cid_type(&self) -> CidType {
        self.cid_type
    }

    pub fn sfid(&self) -> Option<Sfid> {
        self.sfid
    }

    pub fn scheduling_type(&self) -> SchedulingType {
        self.scheduling_type
    }

    pub fn set_service_flow(&mut self, sfid: Sfid, scheduling_type: SchedulingType) {
        self.sfid = Some(sfid);
        self.scheduling_type = scheduling_type;
    }

    pub fn queue(&self) -> &WimaxMacQueue {
        &self.queue
    }

    pub fn enqueue(&mut self, packet: Bytes, header: MacHeader, now: SimTime) -> bool {
        self.queue.enqueue(packet, header, now)
    }

    /// Queues `payload` behind a generic header addressed to this connection.
    pub fn enqueue_sdu(&mut self, payload: Bytes, now: SimTime) -> bool {
        let header = MacHeader::Generic(GenericMacHeader::new(self.cid));
        self.queue.enqueue(payload, header, now)
    }

    pub fn dequeue(&mut self, header_type: MacHeaderType) -> Option<MacPdu> {
        self.queue.dequeue(header_type)
    }

    /// Dequeues within `available_bytes`. Only transport connections split packets.
    pub fn dequeue_with_budget(
        &mut self,
        header_type: MacHeaderType,
        available_bytes: usize,
    ) -> Option<MacPdu> {
        if self.queue.needs_fragmentation(header_type, available_bytes)
            && !self.check_for_fragmentation(header_type)
        {
            return None;
        }
        self.queue.dequeue_with_budget(header_type, available_bytes)
    }

    /// Whether the head `header_type` packet of this connection may be fragmented.
    pub fn check_for_fragmentation(&self, header_type: MacHeaderType) -> bool {
        header_type == MacHeaderType::Generic && self.cid_type == CidType::Transport
    }

    pub fn has_packets(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn has_packets_of(&self, header_type: MacHeaderType) -> bool {
        self.queue.has_packets(header_type)
    }

    /// Collects received fragments. Returns the SDU once it is complete; an
    /// out-of-order fragment discards the partial SDU.
    pub fn reassemble(&mut self, pdu: &MacPdu) -> Option<Bytes> {
        let Some(fragment) = pdu.fragmentation() else {
            return Some(pdu.payload().clone());
        };
        match fragment.fc {
            FragmentControl::Unfragmented => Some(pdu.payload().clone()),
            FragmentControl::First => {
                if self.reassembly.is_some() {
                    warn!("Connection {} restarted reassembly, dropping partial SDU", self.cid);
                }
                let mut data = BytesMut::with_capacity(pdu.payload().len() * 2);
                data.extend_from_slice(pdu.payload());
                self.reassembly = Some(Reassembly {
                    next_fsn: (fragment.fsn + 1) & 0x07,
                    data,
                });
                None
            }
            FragmentControl::Middle | FragmentControl::Last => {
                let Some(mut partial) = self.reassembly.take() else {
                    warn!("Connection {} got fragment without a first fragment", self.cid);
                    return None;
                };
                if partial.next_fsn != fragment.fsn {
                    warn!(
                        "Connection {} expected FSN {}, got {}; discarding SDU",
                        self.cid, partial.next_fsn, fragment.fsn
                    );
                    return None;
                }
                partial.data.extend_from_slice(pdu.payload());
                if fragment.fc == FragmentControl::Last {
                    trace!("Connection {} reassembled {} bytes", self.cid, partial.data.len());
                    return Some(partial.data.freeze());
                }
                partial.next_fsn = (fragment.fsn + 1) & 0x07;
                self.reassembly = Some(partial);
                None
            }
        }
    }
}

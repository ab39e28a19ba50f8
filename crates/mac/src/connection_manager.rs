//! Owns every connection of a station.

use std::collections::BTreeMap;

use log::{debug, warn};
use wimax_core::messages::RngRsp;
use wimax_core::{Cid, CidFactory, CidType, SchedulingType};

use crate::connection::WimaxConnection;
use crate::ss_record::SsRecord;
use crate::MacError;

#[derive(Debug)]
pub struct ConnectionManager {
    connections: BTreeMap<Cid, WimaxConnection>,
    queue_max_size: usize,
}

impl ConnectionManager {
    pub fn new(queue_max_size: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            queue_max_size,
        }
    }

    /// Allocates a CID of `cid_type` and registers a fresh connection for it.
    pub fn create_connection(
        &mut self,
        cid_type: CidType,
        factory: &mut CidFactory,
    ) -> Result<Cid, MacError> {
        let cid = factory.allocate(cid_type)?;
        self.connections.insert(
            cid,
            WimaxConnection::new(cid, cid_type, self.queue_max_size),
        );
        debug!("Created {:?} connection {}", cid_type, cid);
        Ok(cid)
    }

    /// Registers a connection whose CID was assigned elsewhere, as on a subscriber station.
    pub fn add_connection(&mut self, connection: WimaxConnection) {
        self.connections.insert(connection.cid(), connection);
    }

    pub fn new_connection(&self, cid: Cid, cid_type: CidType) -> WimaxConnection {
        WimaxConnection::new(cid, cid_type, self.queue_max_size)
    }

    /// Creates the basic and primary management connections of a ranging
    /// station and reports their CIDs in both the record and the response.
    pub fn allocate_management_connections(
        &mut self,
        ss_record: &mut SsRecord,
        rng_rsp: &mut RngRsp,
        factory: &mut CidFactory,
    ) -> Result<(), MacError> {
        let basic = self.create_connection(CidType::Basic, factory)?;
        let primary = match self.create_connection(CidType::Primary, factory) {
            Ok(cid) => cid,
            Err(e) => {
                self.remove_connection(basic, factory);
                return Err(e);
            }
        };
        ss_record.basic_cid = basic;
        ss_record.primary_cid = primary;
        rng_rsp.basic_cid = basic;
        rng_rsp.primary_cid = primary;
        Ok(())
    }

    pub fn get_connection(&self, cid: Cid) -> Option<&WimaxConnection> {
        self.connections.get(&cid)
    }

    pub fn get_connection_mut(&mut self, cid: Cid) -> Option<&mut WimaxConnection> {
        self.connections.get_mut(&cid)
    }

    pub fn get_connections(&self, cid_type: CidType) -> impl Iterator<Item = &WimaxConnection> {
        self.connections
            .values()
            .filter(move |c| c.cid_type() == cid_type)
    }

    pub fn connections(&self) -> impl Iterator<Item = &WimaxConnection> {
        self.connections.values()
    }

    /// CIDs of connections with queued packets, filtered by type and scheduling class.
    pub fn backlogged_cids(&self, cid_type: CidType, scheduling_type: SchedulingType) -> Vec<Cid> {
        self.connections
            .values()
            .filter(|c| {
                c.cid_type() == cid_type
                    && c.scheduling_type() == scheduling_type
                    && c.has_packets()
            })
            .map(WimaxConnection::cid)
            .collect()
    }

    pub fn has_packets(&self) -> bool {
        self.connections.values().any(WimaxConnection::has_packets)
    }

    pub fn n_packets(&self, cid_type: CidType, scheduling_type: SchedulingType) -> usize {
        self.connections
            .values()
            .filter(|c| c.cid_type() == cid_type && c.scheduling_type() == scheduling_type)
            .map(|c| c.queue().n_packets())
            .sum()
    }

    pub fn remove_connection(&mut self, cid: Cid, factory: &mut CidFactory) -> Option<WimaxConnection> {
        let removed = self.connections.remove(&cid);
        match &removed {
            Some(_) => factory.free_cid(cid),
            None => warn!("Removing unknown connection {}", cid),
        }
        removed
    }

    /// Drops every connection and returns the allocatable CIDs to `factory`.
    pub fn dispose(&mut self, factory: &mut CidFactory) {
        for cid in std::mem::take(&mut self.connections).into_keys() {
            if factory.is_allocated(cid) {
                factory.free_cid(cid);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wimax_core::{MacAddress, SimTime};

    #[test]
    fn test_management_connections_are_reported() {
        let mut factory = CidFactory::new();
        let mut manager = ConnectionManager::new(32);
        let mut record = SsRecord::new(MacAddress::from_index(1));
        let mut rsp = RngRsp::default();

        manager
            .allocate_management_connections(&mut record, &mut rsp, &mut factory)
            .unwrap();
        assert!(factory.is_basic(record.basic_cid));
        assert!(factory.is_primary(record.primary_cid));
        assert_eq!(rsp.basic_cid, record.basic_cid);
        assert_eq!(rsp.primary_cid, record.primary_cid);
        assert_eq!(manager.get_connections(CidType::Basic).count(), 1);
        assert_eq!(manager.get_connections(CidType::Primary).count(), 1);
    }

    #[test]
    fn test_packet_counts_by_class() {
        let mut factory = CidFactory::new();
        let mut manager = ConnectionManager::new(32);
        let rtps = manager.create_connection(CidType::Transport, &mut factory).unwrap();
        let be = manager.create_connection(CidType::Transport, &mut factory).unwrap();
        manager
            .get_connection_mut(rtps)
            .unwrap()
            .set_service_flow(1, SchedulingType::Rtps);
        manager
            .get_connection_mut(be)
            .unwrap()
            .set_service_flow(2, SchedulingType::BestEffort);
        assert!(!manager.has_packets());

        for _ in 0..3 {
            manager
                .get_connection_mut(rtps)
                .unwrap()
                .enqueue_sdu(Bytes::from_static(b"x"), SimTime::ZERO);
        }
        assert!(manager.has_packets());
        assert_eq!(manager.n_packets(CidType::Transport, SchedulingType::Rtps), 3);
        assert_eq!(manager.n_packets(CidType::Transport, SchedulingType::BestEffort), 0);
        assert_eq!(
            manager.backlogged_cids(CidType::Transport, SchedulingType::Rtps),
            vec![rtps]
        );
    }

    #[test]
    fn test_dispose_frees_every_cid() {
        let mut factory = CidFactory::new();
        let mut manager = ConnectionManager::new(32);
        manager.add_connection(WimaxConnection::new(Cid::BROADCAST, CidType::Broadcast, 8));
        let basic = manager.create_connection(CidType::Basic, &mut factory).unwrap();
        manager.create_connection(CidType::Transport, &mut factory).unwrap();
        assert_eq!(factory.live_count(), 2);

        manager.dispose(&mut factory);
        assert!(manager.is_empty());
        assert_eq!(factory.live_count(), 0);
        assert_eq!(factory.allocate_basic().unwrap(), basic);
    }
}

//! Base station bookkeeping for every subscriber station that has ranged.

use std::collections::BTreeMap;

use log::debug;
use wimax_core::messages::RangingStatus;
use wimax_core::{Cid, MacAddress, Modulation, Sfid};

#[derive(Debug, Clone)]
pub struct SsRecord {
    pub mac_address: MacAddress,
    pub basic_cid: Cid,
    pub primary_cid: Cid,
    pub ranging_status: RangingStatus,
    pub ranging_correction_retries: u8,
    pub invited_ranging_retries: u8,
    /// An invited ranging opportunity is owed in the next UL-MAP.
    pub poll_for_ranging: bool,
    pub poll_me: bool,
    pub modulation: Modulation,
    pub service_flows: Vec<Sfid>,
    pub are_service_flows_allocated: bool,
    /// Outstanding basic/primary backlog reported through bandwidth requests.
    pub management_bytes_requested: u32,
}

impl SsRecord {
    pub fn new(mac_address: MacAddress) -> Self {
        Self {
            mac_address,
            basic_cid: Cid::INITIAL_RANGING,
            primary_cid: Cid::INITIAL_RANGING,
            ranging_status: RangingStatus::Expired,
            ranging_correction_retries: 0,
            invited_ranging_retries: 0,
            poll_for_ranging: false,
            poll_me: false,
            modulation: Modulation::Bpsk12,
            service_flows: Vec::new(),
            are_service_flows_allocated: false,
            management_bytes_requested: 0,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.ranging_status == RangingStatus::Success
    }

    pub fn add_service_flow(&mut self, sfid: Sfid) {
        if let Err(pos) = self.service_flows.binary_search(&sfid) {
            self.service_flows.insert(pos, sfid);
        }
    }

    pub fn remove_service_flow(&mut self, sfid: Sfid) {
        self.service_flows.retain(|s| *s != sfid);
    }
}

/// Records keyed by MAC address with a CID index over basic and primary CIDs.
#[derive(Debug, Default)]
pub struct SsManager {
    records: BTreeMap<MacAddress, SsRecord>,
    by_cid: BTreeMap<Cid, MacAddress>,
}

impl SsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `mac_address`, creating it on first contact.
    pub fn create_ss_record(&mut self, mac_address: MacAddress) -> &mut SsRecord {
        self.records.entry(mac_address).or_insert_with(|| {
            debug!("New SS record for {}", mac_address);
            SsRecord::new(mac_address)
        })
    }

    pub fn set_cids(&mut self, mac_address: MacAddress, basic: Cid, primary: Cid) {
        if let Some(record) = self.records.get_mut(&mac_address) {
            self.by_cid.remove(&record.basic_cid);
            self.by_cid.remove(&record.primary_cid);
            record.basic_cid = basic;
            record.primary_cid = primary;
            self.by_cid.insert(basic, mac_address);
            self.by_cid.insert(primary, mac_address);
        }
    }

    pub fn get(&self, mac_address: &MacAddress) -> Option<&SsRecord> {
        self.records.get(mac_address)
    }

    pub fn get_mut(&mut self, mac_address: &MacAddress) -> Option<&mut SsRecord> {
        self.records.get_mut(mac_address)
    }

    /// Looks a station up by its basic or primary CID.
    pub fn get_by_cid(&self, cid: Cid) -> Option<&SsRecord> {
        self.by_cid.get(&cid).and_then(|mac| self.records.get(mac))
    }

    pub fn get_mut_by_cid(&mut self, cid: Cid) -> Option<&mut SsRecord> {
        let mac = self.by_cid.get(&cid)?;
        self.records.get_mut(mac)
    }

    pub fn delete(&mut self, mac_address: &MacAddress) -> Option<SsRecord> {
        let record = self.records.remove(mac_address)?;
        self.by_cid.remove(&record.basic_cid);
        self.by_cid.remove(&record.primary_cid);
        Some(record)
    }

    pub fn records(&self) -> impl Iterator<Item = &SsRecord> {
        self.records.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut SsRecord> {
        self.records.values_mut()
    }

    /// Basic CIDs of stations that hold one, in CID order.
    pub fn basic_cids(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = self
            .records
            .values()
            .map(|r| r.basic_cid)
            .filter(|c| !c.is_initial_ranging())
            .collect();
        cids.sort();
        cids
    }

    pub fn n_ss(&self) -> usize {
        self.records.len()
    }

    pub fn n_registered(&self) -> usize {
        self.records.values().filter(|r| r.is_registered()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_either_cid() {
        let mut manager = SsManager::new();
        let mac = MacAddress::from_index(4);
        manager.create_ss_record(mac);
        manager.set_cids(mac, Cid::new(2), Cid::new(0x0402));

        assert_eq!(manager.get_by_cid(Cid::new(2)).unwrap().mac_address, mac);
        assert_eq!(manager.get_by_cid(Cid::new(0x0402)).unwrap().mac_address, mac);
        assert!(manager.get_by_cid(Cid::new(3)).is_none());

        manager.delete(&mac);
        assert!(manager.get_by_cid(Cid::new(2)).is_none());
        assert_eq!(manager.n_ss(), 0);
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut manager = SsManager::new();
        let mac = MacAddress::from_index(1);
        manager.create_ss_record(mac).ranging_status = RangingStatus::Continue;
        assert_eq!(
            manager.create_ss_record(mac).ranging_status,
            RangingStatus::Continue
        );
        assert_eq!(manager.n_ss(), 1);
    }

    #[test]
    fn test_service_flow_list_stays_sorted() {
        let mut record = SsRecord::new(MacAddress::from_index(1));
        record.add_service_flow(30);
        record.add_service_flow(10);
        record.add_service_flow(30);
        assert_eq!(record.service_flows, vec![10, 30]);
        record.remove_service_flow(10);
        assert_eq!(record.service_flows, vec![30]);
    }
}

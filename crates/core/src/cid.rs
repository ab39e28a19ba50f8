//! Connection identifiers and their per-station allocator

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::CidError;

/// 16-bit connection identifier naming a logical channel between an SS and the BS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(u16);

impl Cid {
    pub const INITIAL_RANGING: Cid = Cid(0x0000);
    pub const PADDING: Cid = Cid(0xFFFE);
    pub const BROADCAST: Cid = Cid(0xFFFF);

    pub const fn new(identifier: u16) -> Self {
        Cid(identifier)
    }

    pub const fn identifier(self) -> u16 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    pub fn is_initial_ranging(self) -> bool {
        self == Self::INITIAL_RANGING
    }

    pub fn is_padding(self) -> bool {
        self == Self::PADDING
    }
}

impl From<u16> for Cid {
    fn from(value: u16) -> Self {
        Cid(value)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CidType {
    Broadcast,
    InitialRanging,
    Basic,
    Primary,
    Transport,
    Multicast,
    Padding,
}

/// Default size of the basic and primary ranges.
pub const DEFAULT_MANAGEMENT_RANGE: u16 = 0x0400;
const TRANSPORT_END: u16 = 0xFEFE;
const MULTICAST_START: u16 = 0xFF00;
const MULTICAST_END: u16 = 0xFFFD;

#[derive(Debug)]
struct CidPool {
    range: RangeInclusive<u16>,
    next: u32,
    free: BTreeSet<u16>,
}

impl CidPool {
    fn new(start: u16, end: u16) -> Self {
        Self {
            range: start..=end,
            next: start as u32,
            free: BTreeSet::new(),
        }
    }

    fn take(&mut self) -> Option<u16> {
        if let Some(reused) = self.free.pop_first() {
            return Some(reused);
        }
        if self.next <= *self.range.end() as u32 {
            let value = self.next as u16;
            self.next += 1;
            return Some(value);
        }
        None
    }
}

/// Hands out connection identifiers from disjoint per-type ranges.
///
/// With `m` the management range size, basic CIDs come from `1..=m`, primary
/// from `m+1..=2m`, transport/secondary from `2m+1..=0xFEFE` and multicast from
/// `0xFF00..=0xFFFD`. Freed values are reused lowest first.
#[derive(Debug)]
pub struct CidFactory {
    m: u16,
    basic: CidPool,
    primary: CidPool,
    transport: CidPool,
    multicast: CidPool,
    live: BTreeSet<u16>,
}

impl Default for CidFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CidFactory {
    pub fn new() -> Self {
        Self::with_management_range(DEFAULT_MANAGEMENT_RANGE)
    }

    /// Builds a factory whose basic and primary ranges hold `m` identifiers each.
    pub fn with_management_range(m: u16) -> Self {
        let m = m.clamp(1, (TRANSPORT_END - 1) / 2);
        Self {
            m,
            basic: CidPool::new(1, m),
            primary: CidPool::new(m + 1, 2 * m),
            transport: CidPool::new(2 * m + 1, TRANSPORT_END),
            multicast: CidPool::new(MULTICAST_START, MULTICAST_END),
            live: BTreeSet::new(),
        }
    }

    fn pool_mut(&mut self, kind: CidType) -> Option<&mut CidPool> {
        match kind {
            CidType::Basic => Some(&mut self.basic),
            CidType::Primary => Some(&mut self.primary),
            CidType::Transport => Some(&mut self.transport),
            CidType::Multicast => Some(&mut self.multicast),
            _ => None,
        }
    }

    pub fn allocate(&mut self, kind: CidType) -> Result<Cid, CidError> {
        let pool = self.pool_mut(kind).ok_or(CidError::NotAllocatable(kind))?;
        let value = pool.take().ok_or(CidError::Exhausted(kind))?;
        self.live.insert(value);
        trace!("Allocated {:?} cid {:#06x}", kind, value);
        Ok(Cid(value))
    }

    pub fn allocate_basic(&mut self) -> Result<Cid, CidError> {
        self.allocate(CidType::Basic)
    }

    pub fn allocate_primary(&mut self) -> Result<Cid, CidError> {
        self.allocate(CidType::Primary)
    }

    pub fn allocate_transport_or_secondary(&mut self) -> Result<Cid, CidError> {
        self.allocate(CidType::Transport)
    }

    pub fn allocate_multicast(&mut self) -> Result<Cid, CidError> {
        self.allocate(CidType::Multicast)
    }

    /// Returns `cid` to its pool. Unknown or already-free values are ignored.
    pub fn free_cid(&mut self, cid: Cid) {
        if !self.live.remove(&cid.0) {
            warn!("Ignoring free of cid {} that is not allocated", cid);
            return;
        }
        let kind = self.cid_type(cid);
        if let Some(pool) = kind.and_then(|k| self.pool_mut(k)) {
            pool.free.insert(cid.0);
        }
    }

    pub fn is_allocated(&self, cid: Cid) -> bool {
        self.live.contains(&cid.0)
    }

    pub fn cid_type(&self, cid: Cid) -> Option<CidType> {
        let id = cid.0;
        let m = self.m;
        match id {
            0x0000 => Some(CidType::InitialRanging),
            0xFFFF => Some(CidType::Broadcast),
            0xFFFE => Some(CidType::Padding),
            _ if id <= m => Some(CidType::Basic),
            _ if id <= 2 * m => Some(CidType::Primary),
            _ if id <= TRANSPORT_END => Some(CidType::Transport),
            MULTICAST_START..=MULTICAST_END => Some(CidType::Multicast),
            _ => None,
        }
    }

    pub fn is_basic(&self, cid: Cid) -> bool {
        self.cid_type(cid) == Some(CidType::Basic)
    }

    pub fn is_primary(&self, cid: Cid) -> bool {
        self.cid_type(cid) == Some(CidType::Primary)
    }

    pub fn is_transport(&self, cid: Cid) -> bool {
        self.cid_type(cid) == Some(CidType::Transport)
    }

    pub fn is_multicast(&self, cid: Cid) -> bool {
        self.cid_type(cid) == Some(CidType::Multicast)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ranges_are_disjoint() {
        let mut factory = CidFactory::new();
        let basic = factory.allocate_basic().unwrap();
        let primary = factory.allocate_primary().unwrap();
        let transport = factory.allocate_transport_or_secondary().unwrap();
        let multicast = factory.allocate_multicast().unwrap();

        assert_eq!(basic.identifier(), 1);
        assert_eq!(primary.identifier(), 0x0401);
        assert_eq!(transport.identifier(), 0x0801);
        assert_eq!(multicast.identifier(), 0xFF00);
        assert!(factory.is_basic(basic));
        assert!(factory.is_primary(primary));
        assert!(factory.is_transport(transport));
        assert!(factory.is_multicast(multicast));
        assert_eq!(factory.cid_type(Cid::BROADCAST), Some(CidType::Broadcast));
        assert_eq!(
            factory.cid_type(Cid::INITIAL_RANGING),
            Some(CidType::InitialRanging)
        );
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut factory = CidFactory::with_management_range(2);
        assert!(factory.allocate_basic().is_ok());
        assert!(factory.allocate_basic().is_ok());
        assert_eq!(
            factory.allocate_basic(),
            Err(CidError::Exhausted(CidType::Basic))
        );
        assert_eq!(
            factory.allocate(CidType::Broadcast),
            Err(CidError::NotAllocatable(CidType::Broadcast))
        );
    }

    #[test]
    fn test_freed_cid_is_reused_lowest_first() {
        let mut factory = CidFactory::with_management_range(4);
        let a = factory.allocate_basic().unwrap();
        let b = factory.allocate_basic().unwrap();
        let c = factory.allocate_basic().unwrap();
        factory.free_cid(c);
        factory.free_cid(a);
        assert_eq!(factory.allocate_basic().unwrap(), a);
        assert_eq!(factory.allocate_basic().unwrap(), c);
        assert!(factory.is_allocated(b));

        // double free is ignored
        factory.free_cid(b);
        factory.free_cid(b);
        assert_eq!(factory.allocate_basic().unwrap(), b);
    }

    #[test]
    fn test_live_cids_never_collide() {
        let mut factory = CidFactory::with_management_range(8);
        let kinds = [CidType::Basic, CidType::Primary, CidType::Transport];
        let mut live: Vec<Cid> = Vec::new();
        let mut seed = 0x2545_f491u32;
        for step in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 && !live.is_empty() {
                let victim = live.remove(seed as usize % live.len());
                factory.free_cid(victim);
            } else if let Ok(cid) = factory.allocate(kinds[step % kinds.len()]) {
                live.push(cid);
            }
            let unique: HashSet<_> = live.iter().collect();
            assert_eq!(unique.len(), live.len());
            assert_eq!(factory.live_count(), live.len());
        }
    }
}

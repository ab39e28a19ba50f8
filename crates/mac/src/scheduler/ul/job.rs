use std::cmp::Ordering;
use std::time::Duration;

use wimax_core::{Cid, SchedulingType, Sfid, SimTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    Data,
    UnicastPolling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    Low,
    Intermediate,
    High,
}

/// Uplink work item: bytes owed to a flow, or a poll owed to a station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UlJob {
    pub basic_cid: Cid,
    /// None for polls.
    pub sfid: Option<Sfid>,
    pub scheduling_type: SchedulingType,
    pub req_type: ReqType,
    pub release_time: SimTime,
    pub period: Duration,
    pub deadline: SimTime,
    /// Bytes for data jobs, symbols for polls.
    pub size: u32,
}

impl UlJob {
    pub fn data(
        basic_cid: Cid,
        sfid: Sfid,
        scheduling_type: SchedulingType,
        release_time: SimTime,
        deadline: SimTime,
        size: u32,
    ) -> Self {
        Self {
            basic_cid,
            sfid: Some(sfid),
            scheduling_type,
            req_type: ReqType::Data,
            release_time,
            period: Duration::ZERO,
            deadline,
            size,
        }
    }

    pub fn unicast_polling(
        basic_cid: Cid,
        release_time: SimTime,
        period: Duration,
        symbols: u32,
    ) -> Self {
        Self {
            basic_cid,
            sfid: None,
            scheduling_type: SchedulingType::None,
            req_type: ReqType::UnicastPolling,
            release_time,
            period,
            deadline: release_time,
            size: symbols,
        }
    }

    pub fn belongs_to(&self, sfid: Sfid) -> bool {
        self.req_type == ReqType::Data && self.sfid == Some(sfid)
    }
}

/// A flow's backlog ranked by how far it trails its minimum reserved rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityUlJob {
    pub job: UlJob,
    /// Bytes still owed this window.
    pub deficit: u32,
}

impl Ord for PriorityUlJob {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deficit
            .cmp(&self.deficit)
            .then_with(|| self.job.sfid.cmp(&other.job.sfid))
    }
}

impl PartialOrd for PriorityUlJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

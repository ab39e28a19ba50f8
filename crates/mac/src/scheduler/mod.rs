//! Downlink (base station) and uplink frame schedulers.

pub mod bs;
pub mod ul;

pub use bs::{BsScheduler, BsSchedulerKind, DownlinkBurst, DownlinkContext};
pub use ul::{UplinkContext, UplinkSchedule, UplinkScheduler, UplinkSchedulerKind};

//! Canned traffic scenarios and the report each run produces.

use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use wimax_core::{Direction, SchedulingType, Sfid, SimTime};
use wimax_mac::{StationStats, UplinkSchedulerType};

use crate::channel::ChannelStats;
use crate::network::{FlowSpec, Network};
use crate::traffic::ArrivalProcess;
use crate::ScenarioConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowReport {
    pub station: usize,
    pub direction: Direction,
    pub scheduling_type: SchedulingType,
    /// None when the flow was never admitted.
    pub sfid: Option<Sfid>,
    pub offered_packets: u64,
    pub offered_bytes: u64,
    pub rejected_packets: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub delivered_packets: u64,
    pub delivered_bytes: u64,
    /// SDUs still queued at the sender when the run ended.
    pub queued_packets: usize,
    pub throughput_kbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub stations: usize,
    pub registered: usize,
    pub provisioned: bool,
    pub provisioning_ms: f64,
    pub frames: u64,
    pub flows: Vec<FlowReport>,
    pub base_station: StationStats,
    pub downlink: ChannelStats,
    pub uplink: ChannelStats,
}

impl ScenarioReport {
    fn collect(
        name: &str,
        network: &Network,
        provisioned: bool,
        traffic_start: SimTime,
        traffic_duration: Duration,
    ) -> Self {
        let seconds = traffic_duration.as_secs_f64().max(1e-9);
        let flows = (0..network.flow_count())
            .filter_map(|index| {
                let spec = network.flow_spec(index)?;
                let source = network.flow_source(index)?;
                let sfid = network.flow_sfid(index);
                let mut report = FlowReport {
                    station: spec.station,
                    direction: spec.direction,
                    scheduling_type: spec.scheduling_type,
                    sfid,
                    offered_packets: source.stats().offered_packets,
                    offered_bytes: source.stats().offered_bytes,
                    rejected_packets: source.stats().rejected_packets,
                    sent_packets: 0,
                    sent_bytes: 0,
                    delivered_packets: 0,
                    delivered_bytes: 0,
                    queued_packets: 0,
                    throughput_kbps: 0.0,
                };
                let Some(sfid) = sfid else {
                    return Some(report);
                };
                let (flows, connections) = match spec.direction {
                    Direction::Down => {
                        let bs = network.base_station();
                        (bs.service_flows(), bs.connections())
                    }
                    Direction::Up => {
                        let ss = &network.stations()[spec.station];
                        (ss.service_flows(), ss.connections())
                    }
                };
                if let Some(flow) = flows.get_service_flow(sfid) {
                    report.sent_packets = flow.record.pkts_sent;
                    report.sent_bytes = flow.record.bytes_sent;
                    report.queued_packets = flow
                        .cid
                        .and_then(|cid| connections.get_connection(cid))
                        .map_or(0, |c| c.queue().n_packets());
                }
                let delivered = network.delivered(spec.direction, sfid);
                report.delivered_packets = delivered.packets;
                report.delivered_bytes = delivered.bytes;
                report.throughput_kbps = delivered.bytes as f64 * 8.0 / seconds / 1000.0;
                Some(report)
            })
            .collect();

        Self {
            name: name.to_string(),
            stations: network.stations().len(),
            registered: network.base_station().ss_manager().n_registered(),
            provisioned,
            provisioning_ms: traffic_start.as_secs_f64() * 1000.0,
            frames: network.frames(),
            flows,
            base_station: network.base_station().stats().clone(),
            downlink: network.downlink_stats().clone(),
            uplink: network.uplink_stats().clone(),
        }
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.flows.iter().map(|f| f.delivered_bytes).sum()
    }

    pub fn offered_bytes(&self) -> u64 {
        self.flows.iter().map(|f| f.offered_bytes).sum()
    }

    /// Delivered share of the offered bytes.
    pub fn delivery_ratio(&self) -> f64 {
        match self.offered_bytes() {
            0 => 0.0,
            offered => self.delivered_bytes() as f64 / offered as f64,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Provisions `flows`, waits for registration and flow setup, runs the
/// sources for the configured time and lets the queues drain.
pub fn run_scenario(name: &str, config: &ScenarioConfig, flows: &[FlowSpec]) -> Result<ScenarioReport> {
    let mut network = Network::new(config);
    for spec in flows {
        network.add_flow(spec.clone())?;
    }
    let provisioned = network.run_until_provisioned(config.provisioning_deadline);
    if !provisioned {
        warn!("{}: cell not provisioned by {:?}", name, config.provisioning_deadline);
    }
    let start = network.now();
    network.start_traffic(Some(config.traffic_duration));
    network.run_until(start + config.traffic_duration + config.drain_time);

    let report = ScenarioReport::collect(name, &network, provisioned, start, config.traffic_duration);
    info!(
        "{}: {} of {} bytes delivered over {} frames",
        name,
        report.delivered_bytes(),
        report.offered_bytes(),
        report.frames
    );
    Ok(report)
}

/// One rtPS downlink stream of 200-byte packets every 20 ms per station.
pub fn rtps_downlink_scenario(config: &ScenarioConfig) -> Result<ScenarioReport> {
    let flows: Vec<FlowSpec> = (0..config.stations)
        .map(|station| FlowSpec {
            station,
            direction: Direction::Down,
            scheduling_type: SchedulingType::Rtps,
            port: 5000 + station as u16,
            packet_size: 200,
            arrivals: ArrivalProcess::Constant {
                interval: Duration::from_millis(20),
            },
            packets: None,
        })
        .collect();
    run_scenario("rtPS downlink", config, &flows)
}

/// Per station: a voice-like UGS stream, a video-like rtPS stream and
/// Poisson best-effort traffic, all uplink.
pub fn uplink_scenario(config: &ScenarioConfig) -> Result<ScenarioReport> {
    let mut flows = Vec::with_capacity(config.stations * 3);
    for station in 0..config.stations {
        let port = 6000 + 3 * station as u16;
        flows.push(FlowSpec {
            station,
            direction: Direction::Up,
            scheduling_type: SchedulingType::Ugs,
            port,
            packet_size: 160,
            arrivals: ArrivalProcess::Constant {
                interval: Duration::from_millis(20),
            },
            packets: None,
        });
        flows.push(FlowSpec {
            station,
            direction: Direction::Up,
            scheduling_type: SchedulingType::Rtps,
            port: port + 1,
            packet_size: 400,
            arrivals: ArrivalProcess::Constant {
                interval: Duration::from_millis(40),
            },
            packets: None,
        });
        flows.push(FlowSpec {
            station,
            direction: Direction::Up,
            scheduling_type: SchedulingType::BestEffort,
            port: port + 2,
            packet_size: 500,
            arrivals: ArrivalProcess::Poisson { rate: 20.0 },
            packets: None,
        });
    }
    let name = format!("uplink ({:?})", config.mac.ul_scheduler);
    run_scenario(&name, config, &flows)
}

/// The uplink scenario once per uplink scheduler, same seed each time.
pub fn scheduler_comparison(config: &ScenarioConfig) -> Result<Vec<ScenarioReport>> {
    [
        UplinkSchedulerType::Simple,
        UplinkSchedulerType::Rtps,
        UplinkSchedulerType::Mbqos,
    ]
    .into_iter()
    .map(|scheduler| {
        let mut config = config.clone();
        config.mac.ul_scheduler = scheduler;
        uplink_scenario(&config)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Delivered;

    fn single_station() -> ScenarioConfig {
        ScenarioConfig {
            stations: 1,
            ..Default::default()
        }
    }

    fn ten_packets(direction: Direction) -> FlowSpec {
        FlowSpec {
            station: 0,
            direction,
            scheduling_type: SchedulingType::Rtps,
            port: 5000,
            packet_size: 200,
            arrivals: ArrivalProcess::Constant {
                interval: Duration::from_millis(10),
            },
            packets: Some(10),
        }
    }

    #[test]
    fn test_rtps_downlink_flow_serves_every_byte() {
        let mut network = Network::new(&single_station());
        let index = network.add_flow(ten_packets(Direction::Down)).unwrap();
        assert!(network.run_until_provisioned(SimTime::from_secs(5)));

        network.start_traffic(None);
        let end = network.now() + Duration::from_millis(500);
        network.run_until(end);

        let sfid = network.flow_sfid(index).unwrap();
        let bs = network.base_station();
        let flow = bs.service_flows().get_service_flow(sfid).unwrap();
        assert_eq!(flow.record.bytes_sent, 2000);
        assert_eq!(flow.record.pkts_sent, 10);
        let connection = bs.connections().get_connection(flow.cid.unwrap()).unwrap();
        assert_eq!(connection.queue().n_packets(), 0);
        assert_eq!(
            network.delivered(Direction::Down, sfid),
            Delivered {
                packets: 10,
                bytes: 2000
            }
        );
    }

    #[test]
    fn test_rtps_uplink_flow_is_polled_and_served() {
        let mut network = Network::new(&single_station());
        let index = network.add_flow(ten_packets(Direction::Up)).unwrap();
        assert!(network.run_until_provisioned(SimTime::from_secs(5)));

        network.start_traffic(None);
        let end = network.now() + Duration::from_secs(1);
        network.run_until(end);

        let sfid = network.flow_sfid(index).unwrap();
        let ss = &network.stations()[0];
        let flow = ss.service_flows().get_service_flow(sfid).unwrap();
        assert_eq!(flow.record.bytes_sent, 2000);
        assert!(!ss.connections().get_connection(flow.cid.unwrap()).unwrap().has_packets());
        let received = network.base_station().service_flows().get_service_flow(sfid).unwrap();
        assert_eq!(received.record.bytes_received, 2000);
        assert_eq!(received.record.pkts_received, 10);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let config = ScenarioConfig {
            stations: 2,
            traffic_duration: Duration::from_millis(500),
            seed: 9,
            ..Default::default()
        };
        let first = uplink_scenario(&config).unwrap();
        let second = uplink_scenario(&config).unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn test_every_uplink_scheduler_carries_traffic() {
        let config = ScenarioConfig {
            stations: 2,
            traffic_duration: Duration::from_secs(1),
            ..Default::default()
        };
        let reports = scheduler_comparison(&config).unwrap();
        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert!(report.provisioned, "{}", report.name);
            assert_eq!(report.registered, 2);
            assert_eq!(report.flows.len(), 6);
            let ugs: Vec<_> = report
                .flows
                .iter()
                .filter(|f| f.scheduling_type == SchedulingType::Ugs)
                .collect();
            assert!(ugs.iter().all(|f| f.delivered_bytes > 0), "{}", report.name);
            assert!(report.delivery_ratio() > 0.5, "{}: {}", report.name, report.delivery_ratio());
        }
    }

    #[test]
    fn test_downlink_report_accounts_for_offered_traffic() {
        let report = rtps_downlink_scenario(&single_station()).unwrap();
        assert!(report.provisioned);
        let flow = &report.flows[0];
        assert!(flow.offered_packets >= 99);
        assert_eq!(flow.rejected_packets, 0);
        assert_eq!(flow.sent_packets, flow.offered_packets);
        assert_eq!(flow.delivered_bytes, flow.offered_bytes);
        assert_eq!(flow.queued_packets, 0);
    }
}

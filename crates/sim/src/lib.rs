//! simulation tools for the WiMAX MAC

pub mod channel;
pub mod engine;
pub mod network;
pub mod scenarios;
pub mod traffic;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wimax_core::Modulation;
use wimax_mac::{MacConfig, OfdmPhy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub mac: MacConfig,
    pub phy: OfdmPhy,
    pub stations: usize,
    /// Burst profile every subscriber station uses.
    pub modulation: Modulation,
    /// Independent loss probability per burst, both directions.
    pub packet_loss: f64,
    /// Longest wait for ranging and flow setup before traffic starts.
    pub provisioning_deadline: Duration,
    /// How long sources run once traffic starts.
    pub traffic_duration: Duration,
    /// Time after the sources stop for queues to drain.
    pub drain_time: Duration,
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            mac: MacConfig::default(),
            phy: OfdmPhy::default(),
            stations: 2,
            modulation: Modulation::Qpsk12,
            packet_loss: 0.0,
            provisioning_deadline: Duration::from_secs(5),
            traffic_duration: Duration::from_secs(2),
            drain_time: Duration::from_millis(500),
            seed: 1,
        }
    }
}

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn small_cell() -> ScenarioConfig {
        ScenarioConfig::default()
    }

    pub fn busy_cell() -> ScenarioConfig {
        ScenarioConfig {
            stations: 8,
            modulation: Modulation::Qam16_12,
            ..Default::default()
        }
    }

    pub fn cell_edge() -> ScenarioConfig {
        ScenarioConfig {
            stations: 4,
            modulation: Modulation::Bpsk12,
            ..Default::default()
        }
    }

    pub fn lossy_cell() -> ScenarioConfig {
        ScenarioConfig {
            stations: 4,
            packet_loss: 0.02,
            provisioning_deadline: Duration::from_secs(10),
            ..Default::default()
        }
    }
}

//! Symbol and byte accounting against the OFDM PHY.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use wimax_core::Modulation;

/// The slice of the PHY the MAC needs: frame timing and symbol capacity.
pub trait WimaxPhy {
    fn frame_duration(&self) -> Duration;

    fn symbol_duration(&self) -> Duration;

    fn bytes_per_symbol(&self, modulation: Modulation) -> u32;

    fn symbols_per_frame(&self) -> u32 {
        let symbol = self.symbol_duration().as_nanos().max(1);
        (self.frame_duration().as_nanos() / symbol) as u32
    }

    /// Symbols needed to carry `bytes`, rounded up.
    fn nr_symbols(&self, bytes: u32, modulation: Modulation) -> u32 {
        let per_symbol = self.bytes_per_symbol(modulation).max(1);
        bytes.div_ceil(per_symbol)
    }

    fn nr_bytes(&self, symbols: u32, modulation: Modulation) -> u32 {
        symbols * self.bytes_per_symbol(modulation)
    }

    /// Frame duration code advertised in the DCD.
    fn frame_duration_code(&self) -> u8 {
        match self.frame_duration().as_micros() {
            2500 => 0,
            4000 => 1,
            5000 => 2,
            8000 => 3,
            10000 => 4,
            12500 => 5,
            _ => 6,
        }
    }
}

/// Egress towards the PHY.
pub trait PhyTransmitter {
    fn forward_down(&mut self, burst: Bytes, modulation: Modulation);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfdmPhy {
    pub frame_duration: Duration,
    pub symbol_duration: Duration,
    /// Bytes per OFDM symbol indexed by modulation.
    pub bytes_per_symbol: [u32; 7],
}

impl Default for OfdmPhy {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(10),
            symbol_duration: Duration::from_micros(28),
            bytes_per_symbol: [12, 24, 36, 48, 72, 96, 108],
        }
    }
}

impl OfdmPhy {
    pub fn with_frame_duration(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            ..Default::default()
        }
    }
}

impl WimaxPhy for OfdmPhy {
    fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    fn symbol_duration(&self) -> Duration {
        self.symbol_duration
    }

    fn bytes_per_symbol(&self, modulation: Modulation) -> u32 {
        self.bytes_per_symbol[modulation as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_accounting() {
        let phy = OfdmPhy::default();
        assert_eq!(phy.symbols_per_frame(), 357);
        assert_eq!(phy.bytes_per_symbol(Modulation::Bpsk12), 12);
        assert_eq!(phy.bytes_per_symbol(Modulation::Qam64_34), 108);
        assert_eq!(phy.nr_symbols(0, Modulation::Qpsk12), 0);
        assert_eq!(phy.nr_symbols(24, Modulation::Qpsk12), 1);
        assert_eq!(phy.nr_symbols(25, Modulation::Qpsk12), 2);
        assert_eq!(phy.nr_bytes(3, Modulation::Qam16_12), 144);
        assert_eq!(phy.frame_duration_code(), 4);
    }
}

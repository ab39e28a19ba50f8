//! Seeded packet sources feeding the MAC with IPv4/UDP datagrams.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use wimax_core::Direction;
use wimax_mac::packet::udp_datagram;

/// Address of the host behind the base station.
pub const CORE_HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Address of the host behind subscriber station `index`.
pub fn station_host(index: usize) -> Ipv4Addr {
    let n = index as u32 + 1;
    Ipv4Addr::new(10, 1, (n >> 8) as u8, n as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ArrivalProcess {
    /// One packet every `interval`.
    Constant { interval: Duration },
    /// Exponential inter-arrival times averaging `rate` packets per second.
    Poisson { rate: f64 },
}

enum Gaps {
    Constant(Duration),
    Poisson(Exp<f64>),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub offered_packets: u64,
    pub offered_bytes: u64,
    /// Packets the MAC refused: no matching active flow or a full queue.
    pub rejected_packets: u64,
}

pub struct TrafficSource {
    station: usize,
    direction: Direction,
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    packet_size: usize,
    gaps: Gaps,
    remaining: Option<u64>,
    rng: StdRng,
    stats: SourceStats,
}

impl TrafficSource {
    /// A source between the core host and station `station` on UDP `port`.
    /// Downlink traffic is addressed to the station, uplink traffic comes from it.
    pub fn new(
        station: usize,
        direction: Direction,
        port: u16,
        packet_size: usize,
        arrivals: ArrivalProcess,
        seed: u64,
    ) -> Result<Self> {
        let gaps = match arrivals {
            ArrivalProcess::Constant { interval } if interval.is_zero() => {
                return Err(anyhow!("constant arrivals need a non-zero interval"))
            }
            ArrivalProcess::Constant { interval } => Gaps::Constant(interval),
            ArrivalProcess::Poisson { rate } if !(rate > 0.0 && rate.is_finite()) => {
                return Err(anyhow!("Poisson arrivals need a positive rate, got {}", rate))
            }
            ArrivalProcess::Poisson { rate } => Gaps::Poisson(
                Exp::new(rate).map_err(|e| anyhow!("invalid arrival rate {}: {}", rate, e))?,
            ),
        };
        let (src, dst) = match direction {
            Direction::Down => ((CORE_HOST, port), (station_host(station), port)),
            Direction::Up => ((station_host(station), port), (CORE_HOST, port)),
        };
        Ok(Self {
            station,
            direction,
            src,
            dst,
            packet_size,
            gaps,
            remaining: None,
            rng: StdRng::seed_from_u64(seed),
            stats: SourceStats::default(),
        })
    }

    /// Stops the source after `packets` packets.
    pub fn with_limit(mut self, packets: u64) -> Self {
        self.remaining = Some(packets);
        self
    }

    pub fn station(&self) -> usize {
        self.station
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Produces the next datagram, or None once the limit is reached.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let packet = udp_datagram(self.src, self.dst, self.packet_size);
        self.stats.offered_packets += 1;
        self.stats.offered_bytes += packet.len() as u64;
        Some(packet)
    }

    pub fn next_gap(&mut self) -> Duration {
        match &self.gaps {
            Gaps::Constant(interval) => *interval,
            Gaps::Poisson(exp) => Duration::from_secs_f64(exp.sample(&mut self.rng)),
        }
    }

    pub(crate) fn record_rejected(&mut self) {
        self.stats.rejected_packets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wimax_mac::packet::FiveTuple;

    #[test]
    fn test_constant_source_respects_limit() {
        let interval = Duration::from_millis(10);
        let mut source = TrafficSource::new(
            0,
            Direction::Down,
            5000,
            200,
            ArrivalProcess::Constant { interval },
            1,
        )
        .unwrap()
        .with_limit(3);

        let mut packets = Vec::new();
        while let Some(packet) = source.next_packet() {
            assert_eq!(source.next_gap(), interval);
            packets.push(packet);
        }
        assert_eq!(packets.len(), 3);
        assert!(source.is_exhausted());
        assert_eq!(source.stats().offered_bytes, 600);

        let tuple = FiveTuple::parse(&packets[0]).unwrap();
        assert_eq!(tuple.src, CORE_HOST);
        assert_eq!(tuple.dst, station_host(0));
        assert_eq!(tuple.dst_port, 5000);
    }

    #[test]
    fn test_poisson_gaps_are_seeded_and_average_out() {
        let gaps = |seed| {
            let mut source = TrafficSource::new(
                2,
                Direction::Up,
                6000,
                100,
                ArrivalProcess::Poisson { rate: 100.0 },
                seed,
            )
            .unwrap();
            (0..2000).map(|_| source.next_gap()).collect::<Vec<_>>()
        };
        let first = gaps(42);
        assert_eq!(first, gaps(42));
        let mean = first.iter().sum::<Duration>().as_secs_f64() / first.len() as f64;
        assert!((mean - 0.01).abs() < 0.002, "mean gap {}", mean);
    }

    #[test]
    fn test_invalid_arrivals_are_rejected() {
        let zero = ArrivalProcess::Constant {
            interval: Duration::ZERO,
        };
        assert!(TrafficSource::new(0, Direction::Up, 1, 64, zero, 0).is_err());
        let negative = ArrivalProcess::Poisson { rate: -1.0 };
        assert!(TrafficSource::new(0, Direction::Up, 1, 64, negative, 0).is_err());
    }
}

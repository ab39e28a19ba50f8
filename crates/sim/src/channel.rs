//! Shared radio channel between the base station and its subscribers.
//!
//! Every burst reaches every receiver in the same subframe. There is no
//! contention model, so simultaneous ranging requests never collide; the only
//! impairment is an optional independent loss probability per burst.

use bytes::Bytes;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use wimax_core::Modulation;
use wimax_mac::PhyTransmitter;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub bursts_sent: u64,
    pub bursts_dropped: u64,
    pub bytes_sent: u64,
}

pub struct Channel {
    packet_loss: f64,
    rng: StdRng,
    pending: Vec<(Bytes, Modulation)>,
    stats: ChannelStats,
}

impl Channel {
    pub fn new(packet_loss: f64, seed: u64) -> Self {
        Self {
            packet_loss: packet_loss.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            pending: Vec::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn ideal() -> Self {
        Self::new(0.0, 0)
    }

    /// Bursts that survived the channel since the last call.
    pub fn take_bursts(&mut self) -> Vec<(Bytes, Modulation)> {
        std::mem::take(&mut self.pending)
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}

impl PhyTransmitter for Channel {
    fn forward_down(&mut self, burst: Bytes, modulation: Modulation) {
        self.stats.bursts_sent += 1;
        self.stats.bytes_sent += burst.len() as u64;
        if self.packet_loss > 0.0 && self.rng.random::<f64>() < self.packet_loss {
            self.stats.bursts_dropped += 1;
            debug!("Simulated loss of {} byte burst", burst.len());
            return;
        }
        trace!(
            "{:?} burst of {} bytes: {}..",
            modulation,
            burst.len(),
            hex::encode(&burst[..burst.len().min(8)])
        );
        self.pending.push((burst, modulation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ideal_channel_delivers_everything() {
        let mut channel = Channel::ideal();
        for len in [1usize, 20, 300] {
            channel.forward_down(Bytes::from(vec![0u8; len]), Modulation::Qpsk12);
        }
        let bursts = channel.take_bursts();
        assert_eq!(bursts.len(), 3);
        assert_eq!(channel.stats().bytes_sent, 321);
        assert_eq!(channel.stats().bursts_dropped, 0);
        assert!(channel.take_bursts().is_empty());
    }

    #[test]
    fn test_loss_is_seeded() {
        let run = |seed| {
            let mut channel = Channel::new(0.5, seed);
            for _ in 0..200 {
                channel.forward_down(Bytes::from_static(b"burst"), Modulation::Bpsk12);
            }
            channel.stats().clone()
        };
        let first = run(7);
        assert_eq!(first, run(7));
        assert!(first.bursts_dropped > 50 && first.bursts_dropped < 150);

        let mut dead = Channel::new(1.0, 1);
        dead.forward_down(Bytes::from_static(b"x"), Modulation::Bpsk12);
        assert!(dead.take_bursts().is_empty());
    }
}

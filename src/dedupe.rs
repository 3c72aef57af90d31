/*! Duplicate suppression for the digipeater.

Remembers a digest of source ‖ destination ‖ info for each packet
queued to a transmit channel, and answers "did we just send this?"
for a configurable time, 30 seconds by default. The via path doesn't
participate: the whole point is that the same packet arriving again
through a different digipeater is still the same packet.

One instance per outbound channel, owned by the single digipeater
worker for that direction, so no locking.
 */
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::ax25::{AX25_DESTINATION, AX25_SOURCE, Packet};
use crate::fcs::Crc16;

/// Default remember time.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Entries beyond this are dropped oldest-first, TTL or not.
const HARD_CAP: usize = 100;

fn digest(p: &Packet) -> u16 {
    let mut crc = Crc16::new();
    crc.update(p.get_addr(AX25_SOURCE).unwrap_or_default().as_bytes());
    crc.update(p.get_addr(AX25_DESTINATION).unwrap_or_default().as_bytes());
    crc.update(p.info());
    crc.finish()
}

/// Short-window memory of recently queued packets for one channel.
pub struct Dedupe {
    ttl: Duration,
    entries: VecDeque<(u16, Instant)>,
}

impl Dedupe {
    /// New cache with the given remember time.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: VecDeque::new(),
        }
    }

    /// Record that this packet was just queued for transmission.
    pub fn remember(&mut self, p: &Packet) {
        self.remember_at(p, Instant::now());
    }

    /// Was a packet with the same source, destination and info queued
    /// within the TTL?
    pub fn check(&mut self, p: &Packet) -> bool {
        self.check_at(p, Instant::now())
    }

    // Injectable clock for tests.
    fn remember_at(&mut self, p: &Packet, now: Instant) {
        self.evict(now);
        self.entries.push_back((digest(p), now));
        while self.entries.len() > HARD_CAP {
            self.entries.pop_front();
        }
    }

    fn check_at(&mut self, p: &Packet, now: Instant) -> bool {
        self.evict(now);
        let d = digest(p);
        self.entries.iter().any(|&(e, _)| e == d)
    }

    // Lazy eviction keeps this O(expired) per operation.
    fn evict(&mut self, now: Instant) {
        while self
            .entries
            .front()
            .is_some_and(|&(_, t)| now.duration_since(t) > self.ttl)
        {
            self.entries.pop_front();
        }
    }
}

impl Default for Dedupe {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(mon: &str) -> Packet {
        Packet::from_monitor(mon).unwrap()
    }

    #[test]
    fn second_copy_suppressed_within_ttl() {
        let mut d = Dedupe::default();
        let t0 = Instant::now();
        let p = pkt("A>B,WIDE1-1:hi");
        assert!(!d.check_at(&p, t0));
        d.remember_at(&p, t0);
        assert!(d.check_at(&p, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn admitted_after_ttl() {
        let mut d = Dedupe::default();
        let t0 = Instant::now();
        let p = pkt("A>B:hi");
        d.remember_at(&p, t0);
        assert!(!d.check_at(&p, t0 + Duration::from_secs(31)));
    }

    #[test]
    fn via_path_ignored() {
        let mut d = Dedupe::default();
        let t0 = Instant::now();
        d.remember_at(&pkt("A>B,WIDE1-1:hi"), t0);
        assert!(d.check_at(&pkt("A>B,N0CALL-1*,WIDE2-1:hi"), t0));
    }

    #[test]
    fn different_info_not_suppressed() {
        let mut d = Dedupe::default();
        let t0 = Instant::now();
        d.remember_at(&pkt("A>B:one"), t0);
        assert!(!d.check_at(&pkt("A>B:two"), t0));
        assert!(!d.check_at(&pkt("A>C:one"), t0));
        assert!(!d.check_at(&pkt("X>B:one"), t0));
    }

    #[test]
    fn hard_cap_bounds_memory() {
        let mut d = Dedupe::default();
        let t0 = Instant::now();
        for i in 0..200 {
            d.remember_at(&pkt(&format!("A>B:msg {i}")), t0);
        }
        assert!(d.entries.len() <= HARD_CAP);
        // The newest are still remembered, the oldest fell out.
        assert!(d.check_at(&pkt("A>B:msg 199"), t0));
        assert!(!d.check_at(&pkt("A>B:msg 0"), t0));
    }
}

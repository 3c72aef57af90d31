/*! Per-channel transmit queues.

Two FIFOs per channel: high priority for same-channel digipeats that
are supposed to collide on the air, low priority for everything else.
The transmit thread blocks on [`TxQueue::dequeue`]; high drains fully
before low. Overflow drops the oldest low-priority entries first.
 */
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, warn};

use crate::ax25::Packet;

/// Transmit priority class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prio {
    /// Same-channel digipeats: transmit immediately, no random wait.
    Hi,
    /// Everything else: subject to the channel-clear wait.
    Lo,
}

/// A packet waiting to go out.
#[derive(Clone, Debug)]
pub struct Queued {
    /// The frame to transmit.
    pub packet: Packet,
    /// Which class it was queued in.
    pub prio: Prio,
}

#[derive(Default)]
struct Inner {
    hi: VecDeque<Queued>,
    lo: VecDeque<Queued>,
    shutdown: bool,
    overflow: u64,
}

/// One channel's transmit queue pair.
pub struct TxQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    depth: usize,
}

/// Default per-class depth limit.
pub const DEFAULT_DEPTH: usize = 20;

impl TxQueue {
    /// New queue with a per-class depth limit.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
            depth,
        }
    }

    /// Queue a packet. Never blocks; sheds oldest low-priority (then
    /// oldest high-priority) entries when over depth.
    pub fn append(&self, prio: Prio, packet: Packet) {
        let mut inner = self.inner.lock().expect("poisoned");
        if inner.shutdown {
            return;
        }
        let q = Queued { packet, prio };
        match prio {
            Prio::Hi => inner.hi.push_back(q),
            Prio::Lo => inner.lo.push_back(q),
        }
        while inner.hi.len() > self.depth || inner.lo.len() > self.depth {
            if inner.lo.pop_front().is_none() {
                inner.hi.pop_front();
            }
            inner.overflow += 1;
            warn!("TxQueue: overflow, dropping oldest entry");
        }
        self.cond.notify_all();
    }

    /// Block until a packet is available or the channel is shutting
    /// down. High priority drains before low.
    pub fn dequeue(&self) -> Option<Queued> {
        let mut inner = self.inner.lock().expect("poisoned");
        loop {
            if let Some(q) = inner.hi.pop_front().or_else(|| inner.lo.pop_front()) {
                return Some(q);
            }
            if inner.shutdown {
                return None;
            }
            inner = self.cond.wait(inner).expect("poisoned");
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<Queued> {
        let mut inner = self.inner.lock().expect("poisoned");
        inner.hi.pop_front().or_else(|| inner.lo.pop_front())
    }

    /// Packets waiting in both classes.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("poisoned");
        inner.hi.len() + inner.lo.len()
    }

    /// Nothing waiting?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries shed due to overflow.
    #[must_use]
    pub fn overflow(&self) -> u64 {
        self.inner.lock().expect("poisoned").overflow
    }

    /// Wake all waiters and refuse further packets.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("poisoned");
        inner.shutdown = true;
        debug!(
            "TxQueue: shutdown with {} entries pending",
            inner.hi.len() + inner.lo.len()
        );
        self.cond.notify_all();
    }
}

/// The queues for every configured channel.
pub struct TxQueues {
    queues: Vec<Arc<TxQueue>>,
}

impl TxQueues {
    /// One queue per channel.
    #[must_use]
    pub fn new(num_chans: usize, depth: usize) -> Self {
        Self {
            queues: (0..num_chans).map(|_| Arc::new(TxQueue::new(depth))).collect(),
        }
    }

    /// Queue a packet for a channel. Out-of-range channels are logged
    /// and dropped.
    pub fn append(&self, chan: usize, prio: Prio, packet: Packet) {
        match self.queues.get(chan) {
            Some(q) => q.append(prio, packet),
            None => warn!("TxQueues: no such channel {chan}"),
        }
    }

    /// Handle for a channel's queue, for the transmit thread.
    #[must_use]
    pub fn chan(&self, chan: usize) -> Option<Arc<TxQueue>> {
        self.queues.get(chan).cloned()
    }

    /// Number of channels.
    #[must_use]
    pub fn num_chans(&self) -> usize {
        self.queues.len()
    }

    /// Shut down every channel's queue.
    pub fn shutdown(&self) {
        for q in &self.queues {
            q.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pkt(info: &str) -> Packet {
        Packet::from_monitor(&format!("A>B:{info}")).unwrap()
    }

    #[test]
    fn hi_drains_before_lo() {
        let q = TxQueue::new(10);
        q.append(Prio::Lo, pkt("lo1"));
        q.append(Prio::Hi, pkt("hi1"));
        q.append(Prio::Lo, pkt("lo2"));
        q.append(Prio::Hi, pkt("hi2"));
        let order: Vec<String> = std::iter::from_fn(|| q.try_dequeue())
            .map(|e| String::from_utf8_lossy(e.packet.info()).into_owned())
            .collect();
        assert_eq!(order, ["hi1", "hi2", "lo1", "lo2"]);
    }

    #[test]
    fn fifo_within_class() {
        let q = TxQueue::new(10);
        for i in 0..5 {
            q.append(Prio::Lo, pkt(&format!("m{i}")));
        }
        for i in 0..5 {
            assert_eq!(
                q.try_dequeue().unwrap().packet.info(),
                format!("m{i}").as_bytes()
            );
        }
    }

    #[test]
    fn overflow_drops_oldest_lo_first() {
        let q = TxQueue::new(3);
        for i in 0..5 {
            q.append(Prio::Lo, pkt(&format!("lo{i}")));
        }
        assert_eq!(q.overflow(), 2);
        assert_eq!(q.len(), 3);
        // lo0 and lo1 were shed.
        assert_eq!(q.try_dequeue().unwrap().packet.info(), b"lo2");

        // High priority over depth sheds the low entry first, and
        // keeps shedding (now from high) until back under.
        let q = TxQueue::new(2);
        q.append(Prio::Lo, pkt("lo0"));
        for i in 0..3 {
            q.append(Prio::Hi, pkt(&format!("hi{i}")));
        }
        assert_eq!(q.overflow(), 2);
        let order: Vec<String> = std::iter::from_fn(|| q.try_dequeue())
            .map(|e| String::from_utf8_lossy(e.packet.info()).into_owned())
            .collect();
        assert_eq!(order, ["hi1", "hi2"]);
    }

    #[test]
    fn dequeue_blocks_until_append() {
        let q = Arc::new(TxQueue::new(10));
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.dequeue());
        std::thread::sleep(Duration::from_millis(50));
        q.append(Prio::Hi, pkt("wake"));
        let got = h.join().unwrap().expect("a packet");
        assert_eq!(got.packet.info(), b"wake");
    }

    #[test]
    fn shutdown_releases_waiter() {
        let q = Arc::new(TxQueue::new(10));
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.dequeue());
        std::thread::sleep(Duration::from_millis(50));
        q.shutdown();
        assert!(h.join().unwrap().is_none());
        // And refuses new work afterwards.
        q.append(Prio::Hi, pkt("late"));
        assert!(q.try_dequeue().is_none());
    }
}

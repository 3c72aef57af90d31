/*! Arbitration between parallel decoders of one channel.

The same transmission is usually decoded by several sub-channels and
slicers at once. Within a short window after the first decode, byte-
identical packets (same source, destination and info; the repeater
list doesn't count) are collapsed into one, and the best candidate is
forwarded when the window closes: FEC-verified beats plain HDLC,
unrepaired beats bit-fixed, and the earliest decode breaks ties.

Time here is the receive stream position in samples, not wall clock,
so arbitration is deterministic and testable offline.
 */
use log::{debug, trace};

use crate::ax25::{AX25_DESTINATION, AX25_SOURCE, Packet};
use crate::fec::CandidateFrame;

type Key = (String, String, Vec<u8>);

fn key_of(data: &[u8]) -> Option<Key> {
    let p = Packet::from_bytes(data).ok()?;
    Some((
        p.get_addr(AX25_SOURCE).ok()?,
        p.get_addr(AX25_DESTINATION).ok()?,
        p.info().to_vec(),
    ))
}

// Higher FEC beats lower, fewer repairs beat more, else keep incumbent.
fn better(challenger: &CandidateFrame, incumbent: &CandidateFrame) -> bool {
    (challenger.fec_type, std::cmp::Reverse(challenger.retry))
        > (incumbent.fec_type, std::cmp::Reverse(incumbent.retry))
}

struct Pending {
    best: CandidateFrame,
    key: Option<Key>,
    deadline: u64,
    caught: Vec<(i32, usize)>,
}

/// Per-channel decode arbitrator.
pub struct Arbitrator {
    window: u64,
    num_subchans: usize,
    num_slicers: usize,
    pending: Option<Pending>,
    suppressed: u64,
}

impl Arbitrator {
    /// `window` is in stream samples, typically 150 ms worth. The
    /// layout sizes the spectrum string on dispatched frames.
    #[must_use]
    pub fn new(window: u64, num_subchans: usize, num_slicers: usize) -> Self {
        Self {
            window,
            num_subchans,
            num_slicers,
            pending: None,
            suppressed: 0,
        }
    }

    /// Offer a candidate. May release the winner of an earlier window.
    pub fn accept(&mut self, f: CandidateFrame) -> Option<CandidateFrame> {
        let mut out = self.poll(f.stream_pos);
        let key = key_of(&f.data);
        match &mut self.pending {
            None => {
                let deadline = f.stream_pos + self.window;
                self.pending = Some(Pending {
                    caught: vec![(f.subchan, f.slice)],
                    best: f,
                    key,
                    deadline,
                });
            }
            Some(p) if p.key.is_some() && p.key == key => {
                self.suppressed += 1;
                p.caught.push((f.subchan, f.slice));
                if better(&f, &p.best) {
                    trace!(
                        "Arbitrator: candidate from {}.{} supersedes",
                        f.subchan, f.slice
                    );
                    p.best = f;
                } else {
                    trace!(
                        "Arbitrator: duplicate from {}.{} suppressed",
                        f.subchan, f.slice
                    );
                }
            }
            Some(_) => {
                // A different packet inside the window; the old one is
                // done competing.
                debug_assert!(out.is_none());
                out = self.flush();
                let deadline = f.stream_pos + self.window;
                self.pending = Some(Pending {
                    caught: vec![(f.subchan, f.slice)],
                    best: f,
                    key,
                    deadline,
                });
            }
        }
        out
    }

    /// Release the pending winner if its window has closed.
    pub fn poll(&mut self, now: u64) -> Option<CandidateFrame> {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| now >= p.deadline)
        {
            return self.flush();
        }
        None
    }

    /// Release the pending winner unconditionally, e.g. at shutdown or
    /// end of a recording.
    pub fn flush(&mut self) -> Option<CandidateFrame> {
        self.pending.take().map(|p| {
            let mut best = p.best;
            best.spectrum = self.render_spectrum(&p.caught);
            best
        })
    }

    // One mark per slicer, sub-channels separated by '|'. Ingest
    // paths (negative sub-channels) have no spectrum.
    fn render_spectrum(&self, caught: &[(i32, usize)]) -> String {
        if caught.iter().any(|&(sc, _)| sc < 0) {
            return String::new();
        }
        let mut out = String::new();
        for sc in 0..self.num_subchans {
            if sc > 0 {
                out.push('|');
            }
            for sl in 0..self.num_slicers {
                out.push(if caught.contains(&(sc as i32, sl)) {
                    '#'
                } else {
                    '.'
                });
            }
        }
        out
    }

    /// How many duplicates were collapsed so far.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

impl Drop for Arbitrator {
    fn drop(&mut self) {
        if self.suppressed > 0 {
            debug!("Arbitrator: {} duplicate decodes suppressed", self.suppressed);
        }
    }
}

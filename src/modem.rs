/*! One channel's complete receive stack.

Glues together the demodulator bank (sub-channels × slicers), the
frame detectors (HDLC, FX.25, IL2P) per slicer, and the arbitrator
that collapses duplicate decodes of the same transmission. Feed it
PCM samples; it hands back dispatched [`CandidateFrame`]s in airtime
order.

Sub-channels are independent, so a batch of samples is fanned out over
the rayon pool; results are merged back in deterministic stream order
before arbitration.
 */
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::demod::AfskDemod;
use crate::fec::{CandidateFrame, FecType, RetryLevel};
use crate::fx25::{Fx25Out, Fx25Rec};
use crate::hdlc::HdlcDeframer;
use crate::il2p::{Il2pOut, Il2pRec};
use crate::multi_modem::Arbitrator;

/// Modem parameters for one channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModemConfig {
    /// Samples per second.
    pub sample_rate: u32,
    /// Bits per second on the air.
    pub baud: u32,
    /// Mark (1) tone frequency, Hz.
    pub mark_freq: f32,
    /// Space (0) tone frequency, Hz.
    pub space_freq: f32,
    /// Parallel demodulator variants, 1..=9.
    pub num_subchans: usize,
    /// Decision thresholds per demodulator, 1..=9.
    pub num_slicers: usize,
    /// Top rung of the FCS repair ladder to attempt.
    pub fix_bits: RetryLevel,
    /// Deliver frames whose FCS never matched.
    pub passall: bool,
    /// Acceptable Hamming distance for FX.25 tag correlation.
    pub fx25_tag_threshold: u32,
    /// How long duplicate decodes of one transmission are collapsed.
    pub arbitration_window_ms: u32,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            baud: 1200,
            mark_freq: 1200.0,
            space_freq: 2200.0,
            num_subchans: 1,
            num_slicers: 1,
            fix_bits: RetryLevel::None,
            passall: false,
            fx25_tag_threshold: 1,
            arbitration_window_ms: 150,
        }
    }
}

// The three frame detectors of one (subchan, slice).
struct SliceRx {
    hdlc: HdlcDeframer,
    fx25: Fx25Rec,
    il2p: Il2pRec,
}

impl SliceRx {
    fn new(cfg: &ModemConfig) -> Self {
        let mut hdlc = HdlcDeframer::new(crate::MIN_FRAME_LEN, crate::MAX_FRAME_LEN);
        hdlc.set_fix_bits(cfg.fix_bits);
        hdlc.set_passall(cfg.passall);
        Self {
            hdlc,
            fx25: Fx25Rec::new(cfg.fx25_tag_threshold),
            il2p: Il2pRec::new(),
        }
    }

    fn dcd(&self) -> bool {
        self.hdlc.dcd() || self.fx25.collecting() || self.il2p.collecting()
    }

    #[allow(clippy::too_many_arguments)]
    fn process_bit(
        &mut self,
        bit: u8,
        chan: usize,
        subchan: i32,
        slice: usize,
        pos: u64,
        level: u8,
        out: &mut Vec<CandidateFrame>,
    ) {
        let cand = |data: Vec<u8>, fec_type, retry, corrected| CandidateFrame {
            chan,
            subchan,
            slice,
            data,
            fec_type,
            retry,
            corrected,
            audio_level: level,
            stream_pos: pos,
            spectrum: String::new(),
        };
        if let Il2pOut::Frame { data, corrected } = self.il2p.process_bit(bit) {
            out.push(cand(data, FecType::Il2p, RetryLevel::None, corrected));
        }
        match self.fx25.process_bit(bit) {
            Fx25Out::Idle => {
                if let Some(f) = self.hdlc.process_bit(bit) {
                    out.push(cand(f.data, FecType::None, f.retry, 0));
                }
            }
            Fx25Out::Collecting => {}
            Fx25Out::Frame { data, corrected } => {
                out.push(cand(data, FecType::Fx25, RetryLevel::None, corrected));
                // The deframer was starved during the block; whatever
                // partial state it holds is stale.
                self.hdlc.reset();
            }
            Fx25Out::Fallback(held) => {
                for b in held {
                    if let Some(f) = self.hdlc.process_bit(b) {
                        out.push(cand(f.data, FecType::None, f.retry, 0));
                    }
                }
            }
        }
    }
}

// One demodulator variant and its slicers' detectors.
struct Subchan {
    demod: AfskDemod,
    slices: Vec<SliceRx>,
    locked: Vec<bool>,
    scratch: Vec<(usize, u8)>,
}

impl Subchan {
    fn new(cfg: &ModemConfig, subchan: usize) -> Self {
        let demod = AfskDemod::new(cfg, subchan);
        let n = demod.num_slicers();
        Self {
            demod,
            slices: (0..n).map(|_| SliceRx::new(cfg)).collect(),
            locked: vec![false; n],
            scratch: Vec::new(),
        }
    }

    fn process(
        &mut self,
        samples: &[i16],
        base: u64,
        chan: usize,
        subchan: i32,
        level: u8,
    ) -> Vec<CandidateFrame> {
        let mut out = Vec::new();
        for (i, &s) in samples.iter().enumerate() {
            let pos = base + i as u64;
            self.scratch.clear();
            let scratch = &mut self.scratch;
            self.demod
                .process_sample(s as f32, &self.locked, |slice, bit| {
                    scratch.push((slice, bit));
                });
            for &(slice, bit) in self.scratch.iter() {
                self.slices[slice].process_bit(bit, chan, subchan, slice, pos, level, &mut out);
                self.locked[slice] = self.slices[slice].dcd();
            }
        }
        out
    }

    fn dcd(&self) -> bool {
        self.slices.iter().any(|s| s.dcd())
    }
}

/// Receive stack for one radio channel.
pub struct Modem {
    chan: usize,
    subchans: Vec<Subchan>,
    arb: Arbitrator,
    stream_pos: u64,
    peak: f32,
    peak_decay: f32,
}

impl Modem {
    /// Build the stack for channel `chan`.
    #[must_use]
    pub fn new(chan: usize, cfg: &ModemConfig) -> Self {
        let n = cfg.num_subchans.clamp(1, crate::MAX_SUBCHANS);
        let window = cfg.sample_rate as u64 * cfg.arbitration_window_ms as u64 / 1000;
        Self {
            chan,
            subchans: (0..n).map(|i| Subchan::new(cfg, i)).collect(),
            arb: Arbitrator::new(window, n, cfg.num_slicers.clamp(1, crate::MAX_SLICERS)),
            stream_pos: 0,
            peak: 0.0,
            // Peak tracker falls to about a third in 100 ms.
            peak_decay: 1.0 - 11.0 / cfg.sample_rate as f32,
        }
    }

    /// Feed a batch of mono samples; get back dispatched frames in
    /// airtime order. Frames whose arbitration window is still open
    /// stay pending until a later batch or [`Modem::finish`].
    pub fn process(&mut self, samples: &[i16]) -> Vec<CandidateFrame> {
        for &s in samples {
            self.peak = (self.peak * self.peak_decay).max((s as f32).abs());
        }
        let level = (self.peak / 327.67).clamp(0.0, 100.0) as u8;

        let base = self.stream_pos;
        let chan = self.chan;
        let mut all: Vec<CandidateFrame> = self
            .subchans
            .par_iter_mut()
            .enumerate()
            .map(|(i, sc)| sc.process(samples, base, chan, i as i32, level))
            .flatten()
            .collect();
        all.sort_by_key(|c| (c.stream_pos, c.subchan, c.slice));

        let mut out = Vec::new();
        for c in all {
            out.extend(self.arb.accept(c));
        }
        self.stream_pos += samples.len() as u64;
        out.extend(self.arb.poll(self.stream_pos));
        out
    }

    /// Flush the arbitrator, e.g. at the end of a recording.
    pub fn finish(&mut self) -> Vec<CandidateFrame> {
        self.arb.flush().into_iter().collect()
    }

    /// Software carrier detect over all sub-channels and slicers.
    #[must_use]
    pub fn dcd(&self) -> bool {
        self.subchans.iter().any(|s| s.dcd())
    }

    /// Current receive stream position in samples.
    #[must_use]
    pub fn stream_pos(&self) -> u64 {
        self.stream_pos
    }
}

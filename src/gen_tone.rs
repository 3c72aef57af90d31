/*! AFSK tone generation for transmit.

Phase-continuous mark/space switching driven by a fractional bit
clock, so sample rates that don't divide evenly by the baud rate
(44100 / 1200 = 36.75) stay on frequency over a whole frame.
 */
use log::debug;

use crate::fec::FecMode;
use crate::hdlc;
use crate::modem::ModemConfig;
use crate::nrzi::NrziEncode;
use crate::{fx25, il2p};

/// Peak amplitude as a fraction of full scale. Keeping headroom avoids
/// clipping in resamplers and sound card mixers downstream.
const AMPLITUDE: f64 = 0.37;

/// Number of flag bytes ahead of a frame when the caller doesn't
/// specify a TXDELAY.
pub const DEFAULT_PREAMBLE_FLAGS: usize = 32;
/// Flag bytes after the closing flag.
pub const DEFAULT_TAIL_FLAGS: usize = 2;

/// Tone generator for one transmit channel.
pub struct ToneGen {
    samples_per_bit: f64,
    accum: f64,
    phase: f64,
    mark_rad: f64,
    space_rad: f64,
    peak: f64,
    nrzi: NrziEncode,
}

impl ToneGen {
    /// New generator for a channel's modem parameters.
    #[must_use]
    pub fn new(cfg: &ModemConfig) -> Self {
        let rate = cfg.sample_rate as f64;
        Self {
            samples_per_bit: rate / cfg.baud as f64,
            accum: 0.0,
            phase: 0.0,
            mark_rad: 2.0 * std::f64::consts::PI * cfg.mark_freq as f64 / rate,
            space_rad: 2.0 * std::f64::consts::PI * cfg.space_freq as f64 / rate,
            peak: AMPLITUDE * i16::MAX as f64,
            nrzi: NrziEncode::new(),
        }
    }

    /// Append the samples for one data bit. NRZI is applied here: a
    /// zero toggles the tone, a one keeps it.
    pub fn put_bit(&mut self, bit: u8, out: &mut Vec<i16>) {
        let tone = self.nrzi.next(bit);
        let rad = if tone == 1 {
            self.mark_rad
        } else {
            self.space_rad
        };
        self.accum += self.samples_per_bit;
        let n = self.accum as usize;
        self.accum -= n as f64;
        for _ in 0..n {
            self.phase += rad;
            if self.phase > 2.0 * std::f64::consts::PI {
                self.phase -= 2.0 * std::f64::consts::PI;
            }
            out.push((self.peak * self.phase.sin()) as i16);
        }
    }

    /// Append `ms` milliseconds of silence, e.g. for a PTT tail.
    pub fn silence(&mut self, ms: u32, sample_rate: u32, out: &mut Vec<i16>) {
        out.extend(std::iter::repeat_n(
            0i16,
            (sample_rate as u64 * ms as u64 / 1000) as usize,
        ));
    }

    /// Turn a complete frame into audio: preamble, envelope per the
    /// FEC mode, tail. Falls back to plain HDLC when the frame doesn't
    /// fit the requested envelope.
    pub fn packet_to_audio(&mut self, frame: &[u8], mode: FecMode) -> Vec<i16> {
        self.frame_to_audio(frame, mode, DEFAULT_PREAMBLE_FLAGS, DEFAULT_TAIL_FLAGS)
    }

    /// As [`ToneGen::packet_to_audio`] with explicit flag counts, for
    /// the transmit thread's TXDELAY / TXTAIL settings.
    pub fn frame_to_audio(
        &mut self,
        frame: &[u8],
        mode: FecMode,
        preamble_flags: usize,
        tail_flags: usize,
    ) -> Vec<i16> {
        let bits = match mode {
            FecMode::None => hdlc::frame_bits(frame, preamble_flags, tail_flags),
            FecMode::Fx25 { check_bytes } => match fx25::encapsulate(frame, check_bytes) {
                Some(env) => {
                    let mut bits = flag_bits(preamble_flags);
                    bits.extend(env);
                    bits.extend(flag_bits(tail_flags.max(1)));
                    bits
                }
                None => {
                    debug!("frame too long for FX.25, sending plain HDLC");
                    hdlc::frame_bits(frame, preamble_flags, tail_flags)
                }
            },
            FecMode::Il2p { invert } => match il2p::encapsulate(frame, invert) {
                Ok(env) => {
                    let mut bits = flag_bits(preamble_flags);
                    bits.extend(env);
                    bits.extend(flag_bits(tail_flags.max(1)));
                    bits
                }
                Err(e) => {
                    debug!("IL2P encapsulation failed ({e}), sending plain HDLC");
                    hdlc::frame_bits(frame, preamble_flags, tail_flags)
                }
            },
        };
        let mut out = Vec::with_capacity(bits.len() * (self.samples_per_bit as usize + 1));
        for b in bits {
            self.put_bit(b, &mut out);
        }
        out
    }
}

fn flag_bits(n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n * 8);
    for _ in 0..n {
        for i in 0..8 {
            out.push((hdlc::FLAG >> i) & 1);
        }
    }
    out
}

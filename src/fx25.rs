/*! FX.25 Forward Error Correction envelope.

FX.25 wraps a normal AX.25/HDLC frame in a Reed-Solomon codeword,
fronted by one of several 64-bit correlation tags that identify the
(n, k) block parameters. A station without FX.25 still decodes the
embedded HDLC frame; one with it can repair symbol errors first.

Receive side: a 64-bit correlator runs on every bit. On a tag hit the
next n×8 bits are collected as the codeword and the HDLC receiver is
held off; after Reed-Solomon correction the k payload bytes re-enter a
primed HDLC deframer (unstuffing and FCS check still apply). If the
block is uncorrectable the buffered bits are handed back so they can
flow through the plain HDLC path after all.
 */
use log::{debug, trace};

use crate::fec::RetryLevel;
use crate::hdlc::{self, HdlcDeframer};
use crate::rs::ReedSolomon;
use crate::{Error, Result};

/// Correlation tags: value, codeword size n, payload size k.
///
/// Tags 0x01..=0x0B from the FX.25 specification. 0x00 and 0x0C..
/// are reserved.
pub const TAGS: &[(u64, usize, usize)] = &[
    (0xB74DB7DF8A532F3E, 255, 239),
    (0x26FF60A600CC8FDE, 144, 128),
    (0xC7DC0508F3D9B09E, 80, 64),
    (0x8F056EB4369660EE, 48, 32),
    (0x6E260B1AC5835FAE, 255, 223),
    (0xFF94DC634F1CFF4E, 160, 128),
    (0x1EB7B9CDBC09C00E, 96, 64),
    (0xDBF869BD2DBB1776, 64, 32),
    (0x3ADB0C13DEAE2836, 255, 191),
    (0xAB69DB6A543188D6, 192, 128),
    (0x4A4ABEC4A724B796, 128, 64),
];

/// What became of one input bit.
pub enum Fx25Out {
    /// No tag active; the bit belongs to the plain HDLC path too.
    Idle,
    /// Collecting a codeword; hold the bit back from HDLC.
    Collecting,
    /// Codeword corrected and payload deframed.
    Frame {
        /// Frame bytes, FCS stripped.
        data: Vec<u8>,
        /// Symbols the Reed-Solomon decoder repaired.
        corrected: u32,
    },
    /// Block was uncorrectable (or held no frame): here are the bits
    /// that were held back, oldest first, for the HDLC fallback.
    Fallback(Vec<u8>),
}

enum State {
    Hunt,
    Collect {
        n: usize,
        k: usize,
        bits: Vec<u8>,
    },
}

/// FX.25 receiver for one `(chan, subchan, slice)`.
pub struct Fx25Rec {
    sr: u64,
    state: State,
    /// Accept a tag at up to this Hamming distance.
    tag_threshold: u32,
    decoded: usize,
    failed: usize,
}

impl Fx25Rec {
    /// New receiver. `tag_threshold` is the acceptable Hamming distance
    /// for tag correlation, typically 1.
    #[must_use]
    pub fn new(tag_threshold: u32) -> Self {
        Self {
            sr: 0,
            state: State::Hunt,
            tag_threshold,
            decoded: 0,
            failed: 0,
        }
    }

    /// Is a codeword being collected right now? Counts as carrier
    /// detect for the transmitter.
    #[must_use]
    pub fn collecting(&self) -> bool {
        matches!(self.state, State::Collect { .. })
    }

    /// Push one bit, LSB-first wire order.
    pub fn process_bit(&mut self, bit: u8) -> Fx25Out {
        match &mut self.state {
            State::Hunt => {
                self.sr = (self.sr >> 1) | ((bit as u64) << 63);
                for &(tag, n, k) in TAGS {
                    if (self.sr ^ tag).count_ones() <= self.tag_threshold {
                        trace!("Fx25Rec: tag hit, collecting RS({n},{k})");
                        self.state = State::Collect {
                            n,
                            k,
                            bits: Vec::with_capacity(n * 8),
                        };
                        return Fx25Out::Collecting;
                    }
                }
                Fx25Out::Idle
            }
            State::Collect { n, k, bits } => {
                bits.push(bit);
                if bits.len() < *n * 8 {
                    return Fx25Out::Collecting;
                }
                let (n, k, bits) = (*n, *k, std::mem::take(bits));
                self.state = State::Hunt;
                self.sr = 0;
                let mut cw: Vec<u8> = bits.chunks(8).map(bits2byte_lsb).collect();
                match self.try_block(&mut cw, n, k) {
                    Ok((data, corrected)) => {
                        self.decoded += 1;
                        Fx25Out::Frame { data, corrected }
                    }
                    Err(e) => {
                        self.failed += 1;
                        debug!("Fx25Rec: block failed, falling back to HDLC: {e}");
                        Fx25Out::Fallback(bits)
                    }
                }
            }
        }
    }

    fn try_block(&self, cw: &mut [u8], n: usize, k: usize) -> Result<(Vec<u8>, u32)> {
        let rs = ReedSolomon::new(n - k);
        let corrected = rs.decode(cw)? as u32;
        // Payload bytes are the stream between HDLC flags: run them
        // through a deframer primed as if the opening flag was seen.
        let mut d = HdlcDeframer::new(crate::MIN_FRAME_LEN, crate::MAX_FRAME_LEN);
        d.prime();
        for byte in &cw[..k] {
            for i in 0..8 {
                if let Some(f) = d.process_bit((byte >> i) & 1) {
                    if f.retry == RetryLevel::None {
                        return Ok((f.data, corrected));
                    }
                }
            }
        }
        Err(Error::Fec("no HDLC frame inside corrected payload".into()))
    }
}

impl Drop for Fx25Rec {
    fn drop(&mut self) {
        if self.decoded > 0 || self.failed > 0 {
            debug!(
                "FX.25 receiver: {} blocks decoded, {} uncorrectable",
                self.decoded, self.failed
            );
        }
    }
}

// LSB-first bits to a byte, HDLC wire order.
fn bits2byte_lsb(bits: &[u8]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, &b)| acc | (b << i))
}

/// Pick the smallest tag whose payload fits `payload_bytes` with at
/// least `check_bytes` parity. None if the frame is too big for FX.25.
#[must_use]
pub fn pick_tag(payload_bytes: usize, check_bytes: u8) -> Option<(u64, usize, usize)> {
    TAGS.iter()
        .copied()
        .filter(|&(_, n, k)| k >= payload_bytes && n - k >= check_bytes as usize)
        .min_by_key(|&(_, n, _)| n)
}

/// Encapsulate a frame for transmission: correlation tag bits followed
/// by the Reed-Solomon codeword bits, all LSB-first. The caller
/// supplies preamble flags around the whole envelope.
///
/// Returns `None` when the stuffed frame exceeds every tag's capacity;
/// the caller should fall back to plain HDLC.
#[must_use]
pub fn encapsulate(frame: &[u8], check_bytes: u8) -> Option<Vec<u8>> {
    let bits = hdlc::stuffed_bits_with_closing_flag(frame);
    let nbytes = bits.len().div_ceil(8);
    let (tag, n, k) = pick_tag(nbytes, check_bytes)?;
    // Pad the bit stream with flags up to exactly k bytes.
    let mut payload_bits = bits;
    let mut i = 0;
    while payload_bits.len() < k * 8 {
        payload_bits.push((hdlc::FLAG >> (i % 8)) & 1);
        i += 1;
    }
    let payload: Vec<u8> = payload_bits.chunks(8).map(bits2byte_lsb).collect();
    let rs = ReedSolomon::new(n - k);
    let cw = rs.encode(&payload);
    let mut out = Vec::with_capacity(64 + n * 8);
    for i in 0..64 {
        out.push(((tag >> i) & 1) as u8);
    }
    for byte in &cw {
        for i in 0..8 {
            out.push((byte >> i) & 1);
        }
    }
    Some(out)
}

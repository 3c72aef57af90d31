/*! IL2P Forward Error Correction envelope.

IL2P replaces HDLC framing entirely: a 24-bit sync word, a 13-byte
header protected by two Reed-Solomon parity symbols, then the payload
in blocks of up to 239 bytes with 16 parity symbols each. Bytes go out
MSB first, no bit stuffing, and everything except the parity is run
through a self-synchronizing scrambler.

A type 1 header carries the AX.25 addresses and control compactly, but
has no room for repeaters; frames with a via path (or an exotic PID)
travel as type 0, transparent encapsulation of the whole AX.25 frame.

Integrity comes from Reed-Solomon, not the FCS, so successful decodes
bypass the HDLC receiver's CRC and fix-bits logic completely.
 */
use log::{debug, trace};

use crate::ax25::Packet;
use crate::rs::ReedSolomon;
use crate::{Error, Result};

/// The bit pattern (after the clock sync preamble) announcing an IL2P
/// frame. Another way to write these bits is 0xF15E48.
pub const SYNC_WORD: u32 = 0xF15E48;

const HEADER_SIZE: usize = 13;
const HEADER_PARITY: usize = 2;
const BLOCK_SIZE: usize = 239;
const BLOCK_PARITY: usize = 16;
const MAX_PAYLOAD: usize = 1023;

const LFSR_MASK: u64 = 0x108;
const LFSR_SEED: u64 = 0x1f0;

/// PID codes, a concept inherited from AX.25, but IL2P uses different
/// numbers for them and bakes the frame type into the header.
mod pids {
    pub const ISO_8208: u8 = 3;
    pub const COMPRESSED_TCPIP: u8 = 4;
    pub const UNCOMPRESSED_TCPIP: u8 = 5;
    pub const SEGMENTATION: u8 = 6;
    pub const ARPA_IP: u8 = 11;
    pub const ARPA_ARP: u8 = 12;
    pub const FLEX_NET: u8 = 13;
    pub const THE_NET: u8 = 14;
    pub const NO_L3: u8 = 15;
}

fn pid_to_il2p(pid: u8) -> Option<u8> {
    Some(match pid {
        0xf0 => pids::NO_L3,
        0x01 => pids::ISO_8208,
        0x06 => pids::COMPRESSED_TCPIP,
        0x07 => pids::UNCOMPRESSED_TCPIP,
        0x08 => pids::SEGMENTATION,
        0xcc => pids::ARPA_IP,
        0xcd => pids::ARPA_ARP,
        0xce => pids::FLEX_NET,
        0xcf => pids::THE_NET,
        _ => return None,
    })
}

fn pid_from_il2p(code: u8) -> Option<u8> {
    Some(match code {
        pids::NO_L3 => 0xf0,
        pids::ISO_8208 => 0x01,
        pids::COMPRESSED_TCPIP => 0x06,
        pids::UNCOMPRESSED_TCPIP => 0x07,
        pids::SEGMENTATION => 0x08,
        pids::ARPA_IP => 0xcc,
        pids::ARPA_ARP => 0xcd,
        pids::FLEX_NET => 0xce,
        pids::THE_NET => 0xcf,
        _ => return None,
    })
}

/// Self-synchronizing scrambler, the transmit half of the LFSR pair.
fn scramble_block(data: &mut [u8]) {
    let mut sr = LFSR_SEED;
    for byte in data {
        let mut out = 0u8;
        for i in (0..8).rev() {
            let d = (*byte >> i) & 1;
            let s = d ^ (sr as u8 & 1);
            sr = (sr >> 1) ^ (LFSR_MASK * s as u64);
            out |= s << i;
        }
        *byte = out;
    }
}

/// Input is XORed into the masked positions of the shift register; the
/// output is just the last bit of it.
fn descramble_block(data: &mut [u8]) {
    let mut sr = LFSR_SEED;
    for byte in data {
        let mut out = 0u8;
        for i in (0..8).rev() {
            let s = (*byte >> i) & 1;
            let d = s ^ (sr as u8 & 1);
            sr = (sr >> 1) ^ (LFSR_MASK * s as u64);
            out |= d << i;
        }
        *byte = out;
    }
}

// Greedy payload split, identical on both sides of the link.
fn block_sizes(payload_len: usize) -> Vec<usize> {
    if payload_len == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut left = payload_len;
    while left > 0 {
        let n = left.min(BLOCK_SIZE);
        out.push(n);
        left -= n;
    }
    out
}

#[derive(Debug, PartialEq, Eq)]
struct Header {
    dst_call: String,
    dst_ssid: u8,
    src_call: String,
    src_ssid: u8,
    ui: bool,
    hdrtype1: bool,
    pid: u8,     // 4 bits
    control: u8, // 7 bits
    payload_size: u16,
}

impl Header {
    fn encode_callsign(call: &str, out: &mut [u8]) {
        for (o, c) in out.iter_mut().zip(call.bytes()) {
            *o |= (c.to_ascii_uppercase().wrapping_sub(0x20)) & 0x3f;
        }
    }

    fn decode_callsign(input: &[u8]) -> String {
        input
            .iter()
            .map(|ch| ch & 63)
            .filter(|&ch| ch > 0)
            .map(|ch| (ch + 0x20) as char)
            .collect()
    }

    fn build(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        Self::encode_callsign(&self.dst_call, &mut b[0..6]);
        Self::encode_callsign(&self.src_call, &mut b[6..12]);
        b[12] = (self.dst_ssid << 4) | (self.src_ssid & 0xf);
        // FEC flag; this implementation always transmits full parity.
        b[0] |= 0x80;
        if self.ui {
            b[0] |= 0x40;
        }
        if self.hdrtype1 {
            b[1] |= 0x80;
        }
        for i in 0..4 {
            if self.pid & (1 << (3 - i)) != 0 {
                b[1 + i] |= 0x40;
            }
        }
        for i in 0..7 {
            if self.control & (1 << (6 - i)) != 0 {
                b[5 + i] |= 0x40;
            }
        }
        for i in 0..10 {
            if self.payload_size & (1 << (9 - i)) != 0 {
                b[2 + i] |= 0x80;
            }
        }
        b
    }

    fn parse(data: &[u8]) -> Self {
        assert_eq!(data.len(), HEADER_SIZE);
        Self {
            dst_call: Self::decode_callsign(&data[0..6]),
            dst_ssid: data[12] >> 4,
            src_call: Self::decode_callsign(&data[6..12]),
            src_ssid: data[12] & 0xf,
            ui: (data[0] & 0x40) != 0,
            hdrtype1: (data[1] & 0x80) != 0,
            pid: ((data[1] & 0x40) >> 3)
                | ((data[2] & 0x40) >> 4)
                | ((data[3] & 0x40) >> 5)
                | ((data[4] & 0x40) >> 6),
            control: (data[5] & 0x40)
                | ((data[6] & 0x40) >> 1)
                | ((data[7] & 0x40) >> 2)
                | ((data[8] & 0x40) >> 3)
                | ((data[9] & 0x40) >> 4)
                | ((data[10] & 0x40) >> 5)
                | ((data[11] & 0x40) >> 6),
            payload_size: (((data[2] as u16) & 0x80) << 2)
                | (((data[3] as u16) & 0x80) << 1)
                | ((data[4] as u16) & 0x80)
                | (((data[5] as u16) & 0x80) >> 1)
                | (((data[6] as u16) & 0x80) >> 2)
                | (((data[7] as u16) & 0x80) >> 3)
                | (((data[8] as u16) & 0x80) >> 4)
                | (((data[9] as u16) & 0x80) >> 5)
                | (((data[10] as u16) & 0x80) >> 6)
                | (((data[11] as u16) & 0x80) >> 7),
        }
    }
}

// Scramble, add parity, return wire bytes.
fn protect(data: &[u8], parity: usize) -> Vec<u8> {
    let mut block = data.to_vec();
    scramble_block(&mut block);
    ReedSolomon::new(parity).encode(&block)
}

// Correct, strip parity, descramble. Returns (data, symbols fixed).
fn clarify(wire: &[u8], parity: usize) -> Result<(Vec<u8>, u32)> {
    let mut cw = wire.to_vec();
    let fixed = ReedSolomon::new(parity).decode(&mut cw)? as u32;
    cw.truncate(cw.len() - parity);
    descramble_block(&mut cw);
    Ok((cw, fixed))
}

/// Encapsulate an AX.25 frame for transmission. Output is the on-air
/// bit sequence starting with the sync word, MSB first, one bit per
/// byte. `invert` flips every bit for modems with ambiguous polarity.
///
/// Fails when the frame can't be carried (payload over 1023 bytes).
pub fn encapsulate(frame: &[u8], invert: bool) -> Result<Vec<u8>> {
    let p = Packet::from_bytes(frame)?;
    let is_ui = matches!(p.frame_type(), crate::ax25::FrameType::UI);
    let header;
    let payload;
    if is_ui
        && p.num_repeaters() == 0
        && p.info().len() <= MAX_PAYLOAD
        && p.pid().and_then(pid_to_il2p).is_some()
    {
        let dst = p.get_addr(crate::ax25::AX25_DESTINATION)?;
        let src = p.get_addr(crate::ax25::AX25_SOURCE)?;
        let (dst_call, dst_ssid) = split_ssid(&dst);
        let (src_call, src_ssid) = split_ssid(&src);
        header = Header {
            dst_call,
            dst_ssid,
            src_call,
            src_ssid,
            ui: true,
            hdrtype1: true,
            pid: pid_to_il2p(p.pid().unwrap_or(0xf0)).unwrap_or(pids::NO_L3),
            control: p.control() & 0x7f,
            payload_size: p.info().len() as u16,
        };
        payload = p.info().to_vec();
    } else {
        if frame.len() > MAX_PAYLOAD {
            return Err(Error::Fec(format!(
                "frame of {} bytes too long for IL2P",
                frame.len()
            )));
        }
        header = Header {
            dst_call: String::new(),
            dst_ssid: 0,
            src_call: String::new(),
            src_ssid: 0,
            ui: false,
            hdrtype1: false,
            pid: 0,
            control: 0,
            payload_size: frame.len() as u16,
        };
        payload = frame.to_vec();
    }

    let mut wire = Vec::new();
    wire.extend(protect(&header.build(), HEADER_PARITY));
    let mut off = 0;
    for size in block_sizes(payload.len()) {
        wire.extend(protect(&payload[off..off + size], BLOCK_PARITY));
        off += size;
    }

    let mut bits = Vec::with_capacity(24 + wire.len() * 8);
    for i in (0..24).rev() {
        bits.push(((SYNC_WORD >> i) & 1) as u8);
    }
    for byte in &wire {
        for i in (0..8).rev() {
            bits.push((byte >> i) & 1);
        }
    }
    if invert {
        for b in &mut bits {
            *b ^= 1;
        }
    }
    Ok(bits)
}

fn split_ssid(s: &str) -> (String, u8) {
    match s.split_once('-') {
        Some((c, n)) => (c.to_string(), n.parse().unwrap_or(0)),
        None => (s.to_string(), 0),
    }
}

fn join_ssid(call: &str, ssid: u8) -> String {
    if ssid == 0 {
        call.to_string()
    } else {
        format!("{call}-{ssid}")
    }
}

/// What became of one input bit.
pub enum Il2pOut {
    /// Hunting for the sync word.
    Idle,
    /// Sync seen, gathering header or payload bytes.
    Collecting,
    /// A complete frame, Reed-Solomon verified.
    Frame {
        /// Reassembled AX.25 frame bytes (no FCS).
        data: Vec<u8>,
        /// Total symbols the Reed-Solomon decoders repaired.
        corrected: u32,
    },
}

enum State {
    Hunt,
    Header {
        bits: Vec<u8>,
    },
    Payload {
        header: Header,
        wire_len: usize,
        bits: Vec<u8>,
        corrected: u32,
    },
}

/// IL2P receiver for one `(chan, subchan, slice)`.
pub struct Il2pRec {
    sr: u32,
    invert: bool,
    state: State,
    decoded: usize,
    failed: usize,
}

impl Default for Il2pRec {
    fn default() -> Self {
        Self::new()
    }
}

impl Il2pRec {
    /// New receiver. Both polarities are detected automatically.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sr: 0,
            invert: false,
            state: State::Hunt,
            decoded: 0,
            failed: 0,
        }
    }

    /// Is a header or payload being collected right now? Counts as
    /// carrier detect for the transmitter.
    #[must_use]
    pub fn collecting(&self) -> bool {
        !matches!(self.state, State::Hunt)
    }

    /// Push one bit, MSB-first wire order.
    pub fn process_bit(&mut self, bit: u8) -> Il2pOut {
        // The old state is moved from; step() hands back the next one.
        let state = std::mem::replace(&mut self.state, State::Hunt);
        let (out, next) = self.step(state, bit & 1);
        self.state = next;
        out
    }

    fn step(&mut self, state: State, bit: u8) -> (Il2pOut, State) {
        match state {
            State::Hunt => {
                self.sr = ((self.sr << 1) | bit as u32) & 0xff_ffff;
                if self.sr == SYNC_WORD {
                    self.invert = false;
                } else if self.sr == !SYNC_WORD & 0xff_ffff {
                    self.invert = true;
                } else {
                    return (Il2pOut::Idle, State::Hunt);
                }
                trace!(
                    "Il2pRec: sync word{}",
                    if self.invert { " (inverted)" } else { "" }
                );
                self.sr = 0;
                (
                    Il2pOut::Collecting,
                    State::Header {
                        bits: Vec::with_capacity((HEADER_SIZE + HEADER_PARITY) * 8),
                    },
                )
            }
            State::Header { mut bits } => {
                bits.push(bit ^ self.invert as u8);
                if bits.len() < (HEADER_SIZE + HEADER_PARITY) * 8 {
                    return (Il2pOut::Collecting, State::Header { bits });
                }
                let wire: Vec<u8> = bits.chunks(8).map(bits2byte_msb).collect();
                match clarify(&wire, HEADER_PARITY) {
                    Ok((hdr, corrected)) => {
                        let header = Header::parse(&hdr);
                        trace!("Il2pRec: header, payload_size={}", header.payload_size);
                        if header.payload_size as usize > MAX_PAYLOAD {
                            self.fail("implausible payload size");
                            return (Il2pOut::Idle, State::Hunt);
                        }
                        let sizes = block_sizes(header.payload_size as usize);
                        let wire_len: usize = sizes.iter().map(|s| s + BLOCK_PARITY).sum();
                        if wire_len == 0 {
                            return (self.finish(header, &[], corrected), State::Hunt);
                        }
                        (
                            Il2pOut::Collecting,
                            State::Payload {
                                header,
                                wire_len,
                                bits: Vec::with_capacity(wire_len * 8),
                                corrected,
                            },
                        )
                    }
                    Err(e) => {
                        self.fail(&format!("header: {e}"));
                        (Il2pOut::Idle, State::Hunt)
                    }
                }
            }
            State::Payload {
                header,
                wire_len,
                mut bits,
                corrected,
            } => {
                bits.push(bit ^ self.invert as u8);
                if bits.len() < wire_len * 8 {
                    return (
                        Il2pOut::Collecting,
                        State::Payload {
                            header,
                            wire_len,
                            bits,
                            corrected,
                        },
                    );
                }
                let wire: Vec<u8> = bits.chunks(8).map(bits2byte_msb).collect();
                let mut total = corrected;
                let mut payload = Vec::with_capacity(header.payload_size as usize);
                let mut off = 0;
                for size in block_sizes(header.payload_size as usize) {
                    match clarify(&wire[off..off + size + BLOCK_PARITY], BLOCK_PARITY) {
                        Ok((data, fixed)) => {
                            total += fixed;
                            payload.extend(data);
                        }
                        Err(e) => {
                            self.fail(&format!("payload block: {e}"));
                            return (Il2pOut::Idle, State::Hunt);
                        }
                    }
                    off += size + BLOCK_PARITY;
                }
                (self.finish(header, &payload, total), State::Hunt)
            }
        }
    }

    fn fail(&mut self, why: &str) {
        self.failed += 1;
        debug!("Il2pRec: discarding: {why}");
        self.sr = 0;
    }

    fn finish(&mut self, header: Header, payload: &[u8], corrected: u32) -> Il2pOut {
        match self.reassemble(&header, payload) {
            Ok(data) => {
                self.decoded += 1;
                Il2pOut::Frame { data, corrected }
            }
            Err(e) => {
                self.failed += 1;
                debug!("Il2pRec: reassembly failed: {e}");
                Il2pOut::Idle
            }
        }
    }

    // Rebuild the AX.25 frame from header fields (type 1) or pass the
    // payload through as-is (type 0).
    fn reassemble(&self, header: &Header, payload: &[u8]) -> Result<Vec<u8>> {
        if !header.hdrtype1 {
            // Transparent encapsulation; validate before passing on.
            Packet::from_bytes(payload)?;
            return Ok(payload.to_vec());
        }
        if !header.ui {
            return Err(Error::Fec("non-UI type 1 header not supported".into()));
        }
        let pid = pid_from_il2p(header.pid)
            .ok_or_else(|| Error::Fec(format!("unknown IL2P PID {}", header.pid)))?;
        let dst = join_ssid(&header.dst_call, header.dst_ssid);
        let src = join_ssid(&header.src_call, header.src_ssid);
        let p = Packet::new_ui(&dst, &src, &[], payload)?;
        // new_ui builds a plain UI with PID 0xF0; splice in the control
        // and PID the header actually carried.
        let mut bytes = p.to_bytes();
        bytes[14] = header.control;
        bytes[15] = pid;
        Packet::from_bytes(&bytes)?;
        Ok(bytes)
    }
}

impl Drop for Il2pRec {
    fn drop(&mut self) {
        if self.decoded > 0 || self.failed > 0 {
            debug!(
                "IL2P receiver: {} frames decoded, {} discarded",
                self.decoded, self.failed
            );
        }
    }
}

// MSB-first bits to a byte, IL2P wire order.
fn bits2byte_msb(bits: &[u8]) -> u8 {
    bits.iter().fold(0, |acc, &b| (acc << 1) | b)
}

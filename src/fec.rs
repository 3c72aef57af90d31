//! Shared receive/transmit metadata for the FEC envelopes.

/// How a received frame made it through the air.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FecType {
    /// Plain HDLC, integrity from the FCS.
    None,
    /// FX.25 Reed-Solomon envelope.
    Fx25,
    /// IL2P interleaved Reed-Solomon.
    Il2p,
}

/// Bit-fix effort that produced a plain-HDLC frame.
///
/// `None` means the FCS matched as received. The ladder levels record
/// which repair made the FCS match; `PassAll` means the FCS never
/// matched and the frame was delivered anyway.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RetryLevel {
    /// FCS matched as received.
    None,
    /// One inverted bit.
    Single,
    /// Two adjacent inverted bits.
    Double,
    /// Three adjacent inverted bits.
    Triple,
    /// Two inverted bits at separate positions.
    TwoSep,
    /// Delivered despite a bad FCS.
    PassAll,
}

impl std::fmt::Display for RetryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            RetryLevel::None => "NONE",
            RetryLevel::Single => "SINGLE",
            RetryLevel::Double => "DOUBLE",
            RetryLevel::Triple => "TRIPLE",
            RetryLevel::TwoSep => "TWO_SEP",
            RetryLevel::PassAll => "PASSALL",
        })
    }
}

/// Transmit-side envelope selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FecMode {
    /// Plain HDLC.
    #[default]
    None,
    /// FX.25 with at least this many check bytes (16, 32 or 64).
    Fx25 {
        /// Minimum parity bytes; picks the smallest fitting tag.
        check_bytes: u8,
    },
    /// IL2P. `invert` transmits the sync word and bits inverted, for
    /// modems with ambiguous polarity.
    Il2p {
        /// Transmit inverted polarity.
        invert: bool,
    },
}

/// A decoded-but-not-yet-dispatched frame with its receive metadata.
///
/// Produced by the HDLC receiver and the FEC wrappers, consumed by the
/// per-channel arbitrator.
#[derive(Clone, Debug)]
pub struct CandidateFrame {
    /// Channel it arrived on.
    pub chan: usize,
    /// Demodulator variant. Negative values are reserved ingest paths:
    /// -1 DTMF, -2 APRS-IS, -3 network TNC.
    pub subchan: i32,
    /// Slicer variant within the demodulator.
    pub slice: usize,
    /// Frame bytes, FCS stripped.
    pub data: Vec<u8>,
    /// Which envelope carried it.
    pub fec_type: FecType,
    /// Bit-fix level for plain HDLC.
    pub retry: RetryLevel,
    /// Symbols corrected by Reed-Solomon, for FEC envelopes.
    pub corrected: u32,
    /// Audio level 0..=100 at decode time.
    pub audio_level: u8,
    /// Position in the sample stream where the frame ended. Drives the
    /// arbitrator's airtime window.
    pub stream_pos: u64,
    /// Which decoders caught this transmission, one mark per slicer
    /// with `|` between sub-channels. Filled in by the arbitrator.
    pub spectrum: String,
}

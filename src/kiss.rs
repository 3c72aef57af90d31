/*! KISS framing, shared by the serial, TCP and pty transports.

<https://en.wikipedia.org/wiki/KISS_(amateur_radio_protocol)>

A frame is FEND, contents with FEND/FESC escaped, FEND. The first
content byte carries the radio channel in the upper nibble and the
command in the lower; the codec itself treats it like any other byte,
escaping included.
 */
use log::debug;

use crate::{Error, Result};

/// Frame delimiter.
pub const FEND: u8 = 0xC0;
/// Escape introducer.
pub const FESC: u8 = 0xDB;
/// Escaped FEND.
pub const TFEND: u8 = 0xDC;
/// Escaped FESC.
pub const TFESC: u8 = 0xDD;

/// Commands in the low nibble of the type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// An AX.25 frame in raw format.
    Data,
    /// Transmitter keyup delay, 10 ms units.
    TxDelay,
    /// P-persistence 0..=255.
    Persistence,
    /// Slot interval, 10 ms units.
    SlotTime,
    /// Keyup tail after the frame. Obsolete but some hosts send it.
    TxTail,
    /// Transmit without waiting for a clear channel.
    FullDuplex,
    /// TNC specific, also the response direction.
    SetHardware,
    /// Exit KISS mode. Acknowledged by ignoring it.
    EndKiss,
}

impl Command {
    /// Decode the low nibble. `None` for the XKISS extensions (12, 14)
    /// and anything else we don't speak.
    #[must_use]
    pub fn from_nibble(n: u8) -> Option<Self> {
        Some(match n & 0xf {
            0 => Command::Data,
            1 => Command::TxDelay,
            2 => Command::Persistence,
            3 => Command::SlotTime,
            4 => Command::TxTail,
            5 => Command::FullDuplex,
            6 => Command::SetHardware,
            15 => Command::EndKiss,
            _ => return None,
        })
    }

    /// The nibble value.
    #[must_use]
    pub fn nibble(self) -> u8 {
        match self {
            Command::Data => 0,
            Command::TxDelay => 1,
            Command::Persistence => 2,
            Command::SlotTime => 3,
            Command::TxTail => 4,
            Command::FullDuplex => 5,
            Command::SetHardware => 6,
            Command::EndKiss => 15,
        }
    }
}

/// A demultiplexed KISS frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KissFrame {
    /// Radio channel from the high nibble.
    pub chan: u8,
    /// Command from the low nibble.
    pub cmd: Command,
    /// Everything after the type byte.
    pub data: Vec<u8>,
}

impl KissFrame {
    /// Split unescaped frame contents into channel, command, data.
    pub fn parse(inner: &[u8]) -> Result<Self> {
        let Some((&t, data)) = inner.split_first() else {
            return Err(Error::Protocol("empty KISS frame".into()));
        };
        let cmd = Command::from_nibble(t)
            .ok_or_else(|| Error::Protocol(format!("unknown KISS command {:#x}", t & 0xf)))?;
        Ok(Self {
            chan: t >> 4,
            cmd,
            data: data.to_vec(),
        })
    }

    /// The frame contents: type byte followed by data, not yet escaped.
    #[must_use]
    pub fn to_inner(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push((self.chan << 4) | self.cmd.nibble());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Encapsulate frame contents: FEND, escaped bytes, FEND.
///
/// Worst case output is twice the input plus the two delimiters.
#[must_use]
pub fn encapsulate(data: &[u8]) -> Vec<u8> {
    // Add 10% capacity to leave room for escapes.
    let mut ret = Vec::with_capacity((2 + data.len()) * 110 / 100);
    ret.push(FEND);
    for &b in data {
        match b {
            FEND => ret.extend([FESC, TFEND]),
            FESC => ret.extend([FESC, TFESC]),
            b => ret.push(b),
        }
    }
    ret.push(FEND);
    ret
}

/// Extract original contents from one complete KISS frame: optional
/// leading FEND, escaped bytes, required trailing FEND.
pub fn unwrap_frame(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&last, body)) = data.split_last() else {
        return Err(Error::Protocol("KISS frame shorter than minimum".into()));
    };
    if last != FEND {
        return Err(Error::Protocol("KISS frame must end with FEND".into()));
    }
    let body = match body.split_first() {
        Some((&FEND, rest)) => rest,
        _ => body,
    };
    let mut out = Vec::with_capacity(body.len());
    let mut escaped = false;
    for &b in body {
        if escaped {
            match b {
                TFEND => out.push(FEND),
                TFESC => out.push(FESC),
                other => {
                    return Err(Error::Protocol(format!(
                        "KISS protocol error: {other:#04x} after FESC"
                    )));
                }
            }
            escaped = false;
        } else {
            match b {
                FESC => escaped = true,
                FEND => {
                    return Err(Error::Protocol("FEND in the middle of a KISS frame".into()));
                }
                b => out.push(b),
            }
        }
    }
    if escaped {
        return Err(Error::Protocol("KISS frame ends inside an escape".into()));
    }
    Ok(out)
}

enum DState {
    /// Discarding until a FEND; entered at start and after an error.
    Searching,
    /// Between FENDs, collecting unescaped bytes.
    Collecting { buf: Vec<u8>, escaped: bool },
}

/// Incremental decoder for KISS over a byte-stream transport.
pub struct KissDecoder {
    state: DState,
    errors: u64,
}

impl Default for KissDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl KissDecoder {
    /// New decoder, hunting for the first FEND.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DState::Searching,
            errors: 0,
        }
    }

    /// Push one byte; returns a complete frame's unescaped contents
    /// when this byte finished one.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match &mut self.state {
            DState::Searching => {
                if byte == FEND {
                    self.state = DState::Collecting {
                        buf: Vec::new(),
                        escaped: false,
                    };
                }
                None
            }
            DState::Collecting { buf, escaped } => {
                if *escaped {
                    match byte {
                        TFEND => buf.push(FEND),
                        TFESC => buf.push(FESC),
                        other => {
                            debug!("KISS protocol error: {other:#04x} after FESC");
                            self.errors += 1;
                            self.state = DState::Searching;
                            return None;
                        }
                    }
                    *escaped = false;
                    None
                } else {
                    match byte {
                        FEND => {
                            // Back-to-back FENDs are idle fill.
                            if buf.is_empty() {
                                return None;
                            }
                            let frame = std::mem::take(buf);
                            Some(frame)
                        }
                        FESC => {
                            *escaped = true;
                            None
                        }
                        b => {
                            buf.push(b);
                            None
                        }
                    }
                }
            }
        }
    }

    /// Feed a buffer, collecting every completed frame.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<Vec<u8>>) {
        for &b in bytes {
            if let Some(f) = self.push(b) {
                out.push(f);
            }
        }
    }

    /// Protocol errors seen so far.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_test_vector() {
        let encoded = encapsulate(&[0xC0, 0xDB, 0x01, 0xC0]);
        assert_eq!(
            encoded,
            [0xC0, 0xDB, 0xDC, 0xDB, 0xDD, 0x01, 0xDB, 0xDC, 0xC0]
        );
        assert_eq!(unwrap_frame(&encoded).unwrap(), [0xC0, 0xDB, 0x01, 0xC0]);
    }

    #[test]
    fn round_trip_and_bound() -> Result<()> {
        for data in [
            vec![],
            vec![0u8],
            vec![0xC0; 50],
            vec![0xDB; 50],
            (0..=255u8).collect::<Vec<_>>(),
        ] {
            let e = encapsulate(&data);
            assert!(e.len() <= 2 * data.len() + 2, "bound violated");
            assert_eq!(unwrap_frame(&e)?, data);
        }
        Ok(())
    }

    #[test]
    fn leading_fend_optional_trailing_required() {
        assert_eq!(unwrap_frame(&[0x01, 0x02, FEND]).unwrap(), [0x01, 0x02]);
        assert!(unwrap_frame(&[FEND, 0x01, 0x02]).is_err());
        assert!(unwrap_frame(&[]).is_err());
    }

    #[test]
    fn bad_escape_is_protocol_error() {
        assert!(unwrap_frame(&[FEND, FESC, 0x41, FEND]).is_err());
        assert!(unwrap_frame(&[FEND, 0x01, FESC, FEND]).is_err());
    }

    #[test]
    fn decoder_handles_chunked_stream() {
        let mut d = KissDecoder::new();
        let mut frames = Vec::new();
        let a = encapsulate(&[0x00, 0x01, 0xC0]);
        let b = encapsulate(&[0x10, 0xDB]);
        let mut stream = b"junk before".to_vec();
        stream.extend(&a);
        stream.extend([FEND, FEND, FEND]); // idle fill
        stream.extend(&b);
        for chunk in stream.chunks(3) {
            d.feed(chunk, &mut frames);
        }
        assert_eq!(frames, vec![vec![0x00, 0x01, 0xC0], vec![0x10, 0xDB]]);
        assert_eq!(d.errors(), 0);
    }

    #[test]
    fn decoder_recovers_after_error() {
        let mut d = KissDecoder::new();
        let mut frames = Vec::new();
        let mut stream = vec![FEND, 0x00, FESC, 0x99]; // broken escape
        stream.extend(encapsulate(&[0x00, 0x42]));
        d.feed(&stream, &mut frames);
        assert_eq!(d.errors(), 1);
        assert_eq!(frames, vec![vec![0x00, 0x42]]);
    }

    #[test]
    fn frame_demux() -> Result<()> {
        let f = KissFrame::parse(&[0x20, 1, 2, 3])?;
        assert_eq!(f.chan, 2);
        assert_eq!(f.cmd, Command::Data);
        assert_eq!(f.data, [1, 2, 3]);
        assert_eq!(f.to_inner(), [0x20, 1, 2, 3]);

        assert_eq!(KissFrame::parse(&[0x01, 40])?.cmd, Command::TxDelay);
        assert_eq!(KissFrame::parse(&[0x0f])?.cmd, Command::EndKiss);
        // XKISS extensions are not implemented.
        assert!(KissFrame::parse(&[0x0c]).is_err());
        assert!(KissFrame::parse(&[0x0e]).is_err());
        assert!(KissFrame::parse(&[]).is_err());
        Ok(())
    }
}

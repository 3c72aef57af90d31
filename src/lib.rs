#![warn(missing_docs)]
/*! Software AX.25 packet radio TNC.

This crate turns a stream of PCM audio samples into a full packet radio
station: AFSK demodulation, HDLC deframing with optional [FX.25][fx25] and
[IL2P][il2p] forward error correction, AX.25 parsing, an APRS digipeater,
and host access over the [KISS][kiss] and AGW protocols. The transmit side
mirrors it: KISS in, HDLC framing, optional FEC, tone generation, PTT.

[fx25]: https://en.wikipedia.org/wiki/FX.25_Forward_Error_Correction
[il2p]: https://en.wikipedia.org/wiki/Improved_Layer_2_Protocol
[kiss]: https://en.wikipedia.org/wiki/KISS_(amateur_radio_protocol)

# Architecture overview

Data flows through per-role threads connected by queues:

```text
   [ Audio source (WAV / soundcard feed) ]
                  ↓
   [ Demod bank: subchan × slicer AFSK correlators + PLL ]
                  ↓ bits
   [ HDLC / FX.25 / IL2P frame detectors ]
                  ↓ candidate frames
   [ Per-channel arbitrator (best-of-N within one airtime window) ]
                  ↓
   [ Dispatch hub: monitor print, KISS/AGW fan-out, IGate,
     digipeater, regen, connected-mode digi ]
                  ↓
   [ Per-channel transmit queue (HI/LO) ]
                  ↓
   [ P-persistence wait, PTT, HDLC framer, tone generator ]
```

Each received frame is tagged `(chan, subchan, slice)` plus FEC type and
bit-fix retry level; the dispatch hub gates relaying on those so corrupted
"fixed" frames are shown but never spread.

# Examples

Decode a transmission generated in memory:

```
use softtnc::ax25::Packet;
use softtnc::fec::FecMode;
use softtnc::gen_tone::ToneGen;
use softtnc::modem::{Modem, ModemConfig};

let p = Packet::from_monitor("WB2OSZ-5>APDW17,WIDE1-1:>test")?;
let cfg = ModemConfig::default();
let mut tg = ToneGen::new(&cfg);
let audio = tg.packet_to_audio(&p.to_bytes(), FecMode::None);
let mut modem = Modem::new(0, &cfg);
let mut frames = modem.process(&audio);
frames.extend(modem.finish());
assert_eq!(frames.len(), 1);
assert_eq!(Packet::from_bytes(&frames[0].data)?.to_monitor(),
           "WB2OSZ-5>APDW17,WIDE1-1:>test");
# Ok::<(), softtnc::Error>(())
```
 */

pub mod agw;
pub mod aprs;
pub mod audio;
pub mod ax25;
pub mod config;
pub mod dedupe;
pub mod demod;
pub mod digipeater;
pub mod fcs;
pub mod fec;
pub mod fx25;
pub mod gen_tone;
pub mod hdlc;
pub mod igate;
pub mod il2p;
pub mod kiss;
pub mod kissnet;
pub mod kisspt;
pub mod kissserial;
pub mod mheard;
pub mod modem;
pub mod multi_modem;
pub mod nrzi;
pub mod pfilter;
pub mod ptt;
pub mod recv;
pub mod rs;
pub mod tq;
pub mod wav;
pub mod xmit;

/// Highest number of logical radio channels.
pub const MAX_CHANS: usize = 16;

/// Highest number of parallel demodulators per channel.
pub const MAX_SUBCHANS: usize = 9;

/// Highest number of decision slicers per demodulator.
pub const MAX_SLICERS: usize = 9;

/// Absolute ceiling on a deframed packet, address block through FCS.
/// AX.25 conforming stations stop at 256 info bytes but we accept more
/// on receive.
pub const MAX_FRAME_LEN: usize = 2048;

/// Minimum frame: 2 addresses, control, FCS.
pub const MIN_FRAME_LEN: usize = 17;

/// Softtnc error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error, with a hint about what was being done.
    #[error("IO error {0}: {1}")]
    Io(String, #[source] std::io::Error),

    /// Configuration rejected. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed AX.25 frame.
    #[error("bad AX.25 frame: {0}")]
    Packet(String),

    /// Host protocol violation (KISS, AGW, APRS-IS).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// FEC block could not be corrected.
    #[error("uncorrectable FEC block: {0}")]
    Fec(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io("".into(), e)
    }
}

/// Softtnc result type, defaulting to crate [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Process-wide cooperative shutdown flag.
///
/// Every blocking point honours it: queues wake their waiters, accept
/// loops poll it, socket reads use timeouts. Threads drain to a safe
/// point and join within a couple of seconds.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl Shutdown {
    /// New, not yet requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask everything to wind down.
    pub fn request(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Has shutdown been requested?
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/*! Per-channel transmit thread.

Drains the channel's queue, waits for a clear channel with
p-persistence (unless the packet is a same-channel digipeat, which is
supposed to collide), keys PTT, sends TXDELAY worth of flags, the
frame(s), TXTAIL, and unkeys. Several queued frames ride one keyup.

TXDELAY, TXTAIL, PERSIST and SLOTTIME are the classic TNC parameters,
adjustable at runtime through KISS commands, so they live behind a
shared handle.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use crate::Shutdown;
use crate::audio::AudioSink;
use crate::fec::FecMode;
use crate::gen_tone::ToneGen;
use crate::modem::ModemConfig;
use crate::ptt::{LoggedPtt, PttLine};
use crate::tq::{Prio, TxQueue};

/// Classic TNC timing parameters, 10 ms units where applicable.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XmitParams {
    /// Keyup to first frame bit.
    pub txdelay: u8,
    /// Last frame bit to unkey.
    pub txtail: u8,
    /// P-persistence probability, 0..=255.
    pub persist: u8,
    /// Wait between persistence rolls.
    pub slottime: u8,
    /// Transmit without listening first.
    pub fulldup: bool,
    /// FEC envelope for transmitted frames.
    pub fec: FecMode,
}

impl Default for XmitParams {
    fn default() -> Self {
        Self {
            txdelay: 30,
            txtail: 10,
            persist: 63,
            slottime: 10,
            fulldup: false,
            fec: FecMode::None,
        }
    }
}

impl XmitParams {
    /// Clamp the host-settable values to something sane.
    pub fn sanitize(&mut self) {
        self.txdelay = self.txdelay.clamp(1, 255);
        self.slottime = self.slottime.clamp(1, 255);
    }
}

/// Longest we keep losing persistence rolls before transmitting
/// anyway. A stuck carrier must not wedge the queue forever.
const MAX_WAIT: Duration = Duration::from_secs(10);

/// The transmit side of one channel.
pub struct Transmitter {
    chan: usize,
    modem_cfg: ModemConfig,
    params: Arc<Mutex<XmitParams>>,
    queue: Arc<TxQueue>,
    ptt: LoggedPtt,
    sink: Box<dyn AudioSink>,
    dcd: Arc<AtomicBool>,
    shutdown: Shutdown,
    sent: u64,
}

impl Transmitter {
    /// Wire up a transmitter. `dcd` is the receive side's carrier
    /// detect for this channel.
    pub fn new(
        chan: usize,
        modem_cfg: ModemConfig,
        params: Arc<Mutex<XmitParams>>,
        queue: Arc<TxQueue>,
        ptt: Box<dyn PttLine>,
        sink: Box<dyn AudioSink>,
        dcd: Arc<AtomicBool>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            chan,
            modem_cfg,
            params,
            queue,
            ptt: LoggedPtt::new(ptt),
            sink,
            dcd,
            shutdown,
            sent: 0,
        }
    }

    /// Thread body. Returns after shutdown with the queue drained to a
    /// safe point and PTT released.
    pub fn run(mut self) {
        info!("transmit thread for channel {} up", self.chan);
        while let Some(q) = self.queue.dequeue() {
            // Same-channel digipeats skip the random wait: everybody
            // who heard the packet transmits at once.
            if q.prio == Prio::Lo {
                self.wait_for_clear_channel();
            }
            // On shutdown this frame still goes out; later ones are
            // dropped by the queue itself.
            self.send_frames(q);
        }
        let _ = self.ptt.set(false);
        let _ = self.sink.flush();
        info!(
            "transmit thread for channel {} down, {} frames sent",
            self.chan, self.sent
        );
    }

    // P-persistence: when the channel is clear, transmit with
    // probability (persist+1)/256 per slot, else wait a slot.
    fn wait_for_clear_channel(&mut self) {
        let (persist, slottime, fulldup) = {
            let p = self.params.lock().expect("poisoned");
            (p.persist, p.slottime, p.fulldup)
        };
        if fulldup {
            return;
        }
        let start = std::time::Instant::now();
        let mut rng = rand::rng();
        loop {
            if self.shutdown.is_requested() || start.elapsed() > MAX_WAIT {
                if start.elapsed() > MAX_WAIT {
                    warn!("channel {} busy too long, transmitting anyway", self.chan);
                }
                return;
            }
            if self.dcd.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            if rng.random::<u8>() <= persist {
                return;
            }
            std::thread::sleep(Duration::from_millis(slottime as u64 * 10));
        }
    }

    // One keyup: TXDELAY, every frame ready to go, TXTAIL.
    fn send_frames(&mut self, first: crate::tq::Queued) {
        let params = *self.params.lock().expect("poisoned");
        let baud = self.modem_cfg.baud as usize;
        let flags_for = |ten_ms_units: u8| (ten_ms_units as usize * baud / 100).div_ceil(8).max(1);

        let mut tone = ToneGen::new(&self.modem_cfg);
        let _ = self.ptt.set(true);

        let mut next = Some(first);
        let mut first_of_keyup = true;
        while let Some(q) = next {
            let preamble = if first_of_keyup {
                flags_for(params.txdelay)
            } else {
                2
            };
            first_of_keyup = false;
            let frame = q.packet.to_bytes();
            debug!(
                "channel {} tx: {}",
                self.chan,
                q.packet.to_monitor()
            );
            let audio = tone.frame_to_audio(&frame, params.fec, preamble, flags_for(params.txtail));
            if let Err(e) = self.sink.write(&audio) {
                warn!("channel {} audio write failed: {e}", self.chan);
            }
            self.sent += 1;
            // More waiting? Ride the same keyup.
            next = self.queue.try_dequeue();
        }
        if let Err(e) = self.sink.flush() {
            warn!("channel {} audio flush failed: {e}", self.chan);
        }
        let _ = self.ptt.set(false);
    }
}

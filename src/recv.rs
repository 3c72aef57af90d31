/*! Receive dispatch: what happens to every decoded frame.

In order: monitor print (with channel/subchannel tag, heard line and
optional hex dump), APRS decode for the log and the heard list,
fan-out to every connected host (KISS and AGW), then — unless the
frame came from the APRS-IS virtual channel — IGate, regenerated-copy
relay, the APRS digipeater, and the connected-mode digipeater. The
relay paths only accept frames whose integrity is trusted: an FCS
that matched as received, or a Reed-Solomon verified envelope.

One dispatcher thread per channel owns this path, which is what makes
frame handling on a channel serial and airtime-ordered.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::Shutdown;
use crate::aprs;
use crate::audio::AudioSource;
use crate::ax25::{AX25_SOURCE, Packet};
use crate::digipeater::Digipeater;
use crate::fec::{CandidateFrame, FecType, RetryLevel};
use crate::mheard::MheardList;
use crate::modem::Modem;
use crate::tq::TxQueues;

/// Somewhere decoded frames get forwarded to, such as the KISS and
/// AGW servers' client fan-out.
pub trait FrameSink: Send + Sync {
    /// Forward one received frame.
    fn send_frame(&self, chan: usize, data: &[u8]);
}

/// External collaborator for waypoint output (NMEA, AIS objects).
pub trait PositionSink: Send + Sync {
    /// A station or object with a known position was heard.
    fn report(&self, name: &str, lat: f64, lon: f64, symbol_table: char, symbol_code: char);
}

/// Display and routing options from the command line.
#[derive(Clone, Debug, Default)]
pub struct DispatchOpts {
    /// Suppress the "heard" line (`-q h`).
    pub quiet_heard: bool,
    /// Suppress APRS decoding output (`-q d`).
    pub quiet_decode: bool,
    /// Hex dump received frames (`-h`).
    pub hex_dump: bool,
    /// Frames from this channel are printed and fanned out, nothing
    /// more.
    pub igate_vchannel: Option<usize>,
}

/// The dispatch hub. One per process, locked by the per-channel
/// dispatcher threads for the duration of one frame.
pub struct Dispatch {
    opts: DispatchOpts,
    digi: Digipeater,
    tq: Arc<TxQueues>,
    sinks: Vec<Arc<dyn FrameSink>>,
    igate_tx: Option<mpsc::Sender<Packet>>,
    positions: Option<Box<dyn PositionSink>>,
    mheard: MheardList,
    received: u64,
}

impl Dispatch {
    /// Assemble the hub.
    #[must_use]
    pub fn new(opts: DispatchOpts, digi: Digipeater, tq: Arc<TxQueues>) -> Self {
        Self {
            opts,
            digi,
            tq,
            sinks: Vec::new(),
            igate_tx: None,
            positions: None,
            mheard: MheardList::new(),
            received: 0,
        }
    }

    /// Add a host fan-out target.
    pub fn add_sink(&mut self, sink: Arc<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    /// Wire up the IGate uplink.
    pub fn set_igate(&mut self, tx: mpsc::Sender<Packet>) {
        self.igate_tx = Some(tx);
    }

    /// Wire up a waypoint collaborator.
    pub fn set_position_sink(&mut self, sink: Box<dyn PositionSink>) {
        self.positions = Some(sink);
    }

    /// The stations-heard list.
    #[must_use]
    pub fn mheard(&self) -> &MheardList {
        &self.mheard
    }

    /// Frames dispatched so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Run one decoded frame through the whole pipeline.
    pub fn process(&mut self, f: &CandidateFrame) {
        let p = match Packet::from_bytes(&f.data) {
            Ok(p) => p,
            Err(e) => {
                debug!("dispatch: undecodable frame on channel {}: {e}", f.chan);
                return;
            }
        };
        self.received += 1;

        self.print_frame(f, &p);

        // APRS decode, for the log and the heard list only.
        let ai = if p.is_aprs() {
            aprs::decode(p.info())
        } else {
            None
        };
        if let Some(a) = &ai {
            if !self.opts.quiet_decode {
                println!("{}{}", a.description, position_text(a));
            }
        }
        if let Ok(src) = p.get_addr(AX25_SOURCE) {
            self.mheard.save(f.chan, &src, ai.as_ref());
        }
        if let (Some(ps), Some(a)) = (&self.positions, &ai) {
            if let (Some(lat), Some(lon)) = (a.lat, a.lon) {
                let name = a.name.clone().unwrap_or_else(|| {
                    p.get_addr(AX25_SOURCE).unwrap_or_default()
                });
                ps.report(&name, lat, lon, a.symbol_table, a.symbol_code);
            }
        }

        // Every host application sees every frame, trusted or not.
        for s in &self.sinks {
            s.send_frame(f.chan, &f.data);
        }

        // The APRS-IS virtual channel is for looking, not relaying.
        if Some(f.chan) == self.opts.igate_vchannel {
            return;
        }

        // Subchannel -1 is the DTMF decoder's slot; its traffic goes
        // to a touch-tone gateway, which lives outside this crate.
        if f.subchan == -1 {
            return;
        }

        // Don't spread data we are not confident in: unrepaired FCS,
        // or an envelope whose integrity Reed-Solomon vouched for.
        let trusted = f.retry == RetryLevel::None || f.fec_type != FecType::None;

        if p.is_aprs() && trusted {
            if let Some(tx) = &self.igate_tx {
                let _ = tx.send(p.dup());
            }
        }

        for e in self.digi.digi_regen(f.chan, &p) {
            self.tq.append(e.to_chan, e.prio, e.packet);
        }
        if p.is_aprs() && trusted {
            for e in self.digi.digipeat(f.chan, &p) {
                self.tq.append(e.to_chan, e.prio, e.packet);
            }
        }
        if trusted {
            for e in self.digi.cdigipeat(f.chan, &p) {
                self.tq.append(e.to_chan, e.prio, e.packet);
            }
        }
    }

    fn print_frame(&self, f: &CandidateFrame, p: &Packet) {
        if !self.opts.quiet_heard {
            let h = p.heard();
            let who = p.get_addr(h).unwrap_or_default();
            let via = if h != AX25_SOURCE { "Digipeater " } else { "" };
            let how = match f.fec_type {
                FecType::Fx25 => format!(" FX.25 {}", f.corrected),
                FecType::Il2p => format!(" IL2P {}", f.corrected),
                FecType::None if f.retry != RetryLevel::None => format!(" [{}]", f.retry),
                FecType::None => String::new(),
            };
            let spectrum = if f.spectrum.is_empty() {
                String::new()
            } else {
                format!("  {}", f.spectrum)
            };
            println!("{via}{who} audio level = {}{how}{spectrum}", f.audio_level);
        }
        let tag = if f.subchan <= 0 && f.slice == 0 {
            format!("[{}]", f.chan)
        } else {
            format!("[{}.{}.{}]", f.chan, f.subchan, f.slice)
        };
        println!("{tag} {}", p.to_monitor());
        if !p.is_aprs() {
            println!("{}", p.describe_type());
        }
        if self.opts.hex_dump {
            println!("------");
            print!("{}", p.hex_dump());
            println!("------");
        }
    }
}

fn position_text(a: &aprs::AprsInfo) -> String {
    match (a.lat, a.lon) {
        (Some(lat), Some(lon)) => format!(", {lat:.4} {lon:.4}"),
        _ => String::new(),
    }
}

/// Spawn the per-channel dispatcher thread: the serialization point
/// for one channel's frames.
pub fn spawn_dispatcher(
    chan: usize,
    rx: mpsc::Receiver<CandidateFrame>,
    dispatch: Arc<Mutex<Dispatch>>,
    shutdown: Shutdown,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("dispatch-{chan}"))
        .spawn(move || {
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(f) => dispatch.lock().expect("poisoned").process(&f),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if shutdown.is_requested() {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("dispatcher for channel {chan} down");
        })
        .expect("spawning dispatcher thread")
}

/// One channel's receive wiring for the audio feeder.
pub struct ChannelRx {
    /// Channel number.
    pub chan: usize,
    /// Its demodulator stack.
    pub modem: Modem,
    /// Where decoded frames go (the dispatcher thread).
    pub tx: mpsc::Sender<CandidateFrame>,
    /// Carrier detect shared with the transmitter.
    pub dcd: Arc<AtomicBool>,
}

/// Audio capture loop for one device feeding one or two channels
/// (mono or interleaved stereo). Returns at end of stream or
/// shutdown.
pub fn run_audio_input(
    mut source: Box<dyn AudioSource>,
    chans: &mut [ChannelRx],
    shutdown: Shutdown,
) {
    let nch = source.channels() as usize;
    let mut buf = vec![0i16; 4096 * nch];
    let mut split: Vec<Vec<i16>> = vec![Vec::new(); nch];
    info!(
        "audio input: {} Hz, {} channel(s)",
        source.sample_rate(),
        nch
    );
    loop {
        if shutdown.is_requested() {
            break;
        }
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("audio input error: {e}");
                break;
            }
        };
        for s in &mut split {
            s.clear();
        }
        for (i, &sample) in buf[..n].iter().enumerate() {
            split[i % nch].push(sample);
        }
        for (dev_ch, rx) in chans.iter_mut().enumerate() {
            let Some(samples) = split.get(dev_ch) else {
                break;
            };
            for cand in rx.modem.process(samples) {
                if rx.tx.send(cand).is_err() {
                    return;
                }
            }
            rx.dcd.store(rx.modem.dcd(), Ordering::Relaxed);
        }
    }
    // End of stream: close out any open arbitration window.
    for rx in chans.iter_mut() {
        for cand in rx.modem.finish() {
            let _ = rx.tx.send(cand);
        }
        rx.dcd.store(false, Ordering::Relaxed);
    }
    debug!("audio input loop done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digipeater::DigiRule;
    use crate::tq::Prio;
    use regex::Regex;
    use std::time::Duration as StdDuration;

    struct CollectSink(Mutex<Vec<(usize, Vec<u8>)>>);
    impl FrameSink for CollectSink {
        fn send_frame(&self, chan: usize, data: &[u8]) {
            self.0.lock().unwrap().push((chan, data.to_vec()));
        }
    }

    fn cand(mon: &str, retry: RetryLevel, fec: FecType) -> CandidateFrame {
        CandidateFrame {
            chan: 0,
            subchan: 0,
            slice: 0,
            data: Packet::from_monitor(mon).unwrap().to_bytes(),
            fec_type: fec,
            retry,
            corrected: 0,
            audio_level: 42,
            stream_pos: 0,
            spectrum: String::new(),
        }
    }

    fn hub(vchan: Option<usize>) -> (Dispatch, Arc<TxQueues>, Arc<CollectSink>) {
        let mut digi = Digipeater::new(
            vec!["N0CALL-1".into()],
            1,
            StdDuration::from_secs(30),
        );
        digi.add_rule(
            0,
            0,
            DigiRule {
                wide: Some(Regex::new(r"^WIDE[1-7]$").unwrap()),
                ..DigiRule::default()
            },
        )
        .unwrap();
        let tq = Arc::new(TxQueues::new(1, 10));
        let opts = DispatchOpts {
            quiet_heard: true,
            quiet_decode: true,
            igate_vchannel: vchan,
            ..DispatchOpts::default()
        };
        let mut d = Dispatch::new(opts, digi, tq.clone());
        let sink = Arc::new(CollectSink(Mutex::new(Vec::new())));
        d.add_sink(sink.clone());
        (d, tq, sink)
    }

    #[test]
    fn clean_frame_fans_out_and_digipeats() {
        let (mut d, tq, sink) = hub(None);
        d.process(&cand("A>B,WIDE1-1:hi", RetryLevel::None, FecType::None));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        let q = tq.chan(0).unwrap();
        let e = q.try_dequeue().expect("digipeated");
        assert_eq!(e.prio, Prio::Hi);
        assert_eq!(e.packet.to_monitor(), "A>B,N0CALL-1*:hi");
        assert_eq!(d.mheard().get("A").unwrap().count, 1);
    }

    #[test]
    fn repaired_frame_shown_but_not_relayed() {
        let (mut d, tq, sink) = hub(None);
        d.process(&cand("A>B,WIDE1-1:hi", RetryLevel::Single, FecType::None));
        assert_eq!(sink.0.lock().unwrap().len(), 1, "hosts still see it");
        assert!(tq.chan(0).unwrap().try_dequeue().is_none());
    }

    #[test]
    fn fec_frame_with_repairs_is_trusted() {
        let (mut d, tq, _sink) = hub(None);
        d.process(&cand("A>B,WIDE1-1:hi", RetryLevel::None, FecType::Il2p));
        assert!(tq.chan(0).unwrap().try_dequeue().is_some());
    }

    #[test]
    fn igate_vchannel_stops_after_fanout() {
        let (mut d, tq, sink) = hub(Some(0));
        d.process(&cand("A>B,WIDE1-1:hi", RetryLevel::None, FecType::None));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert!(tq.chan(0).unwrap().try_dequeue().is_none());
    }

    #[test]
    fn igate_gets_trusted_aprs() {
        let (mut d, _tq, _sink) = hub(None);
        let (tx, rx) = mpsc::channel();
        d.set_igate(tx);
        d.process(&cand("A>B:pos", RetryLevel::None, FecType::None));
        assert!(rx.try_recv().is_ok());
        d.process(&cand("A>B:pos2", RetryLevel::TwoSep, FecType::None));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatcher_thread_processes_and_stops() {
        let (d, tq, sink) = hub(None);
        let d = Arc::new(Mutex::new(d));
        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::channel();
        let h = spawn_dispatcher(0, rx, d.clone(), shutdown.clone());
        tx.send(cand("A>B,WIDE1-1:hi", RetryLevel::None, FecType::None))
            .unwrap();
        // Dropping the sender ends the thread.
        drop(tx);
        h.join().unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert!(tq.chan(0).unwrap().try_dequeue().is_some());
    }
}

//! End-to-end scenarios: audio in one side, packets (or more audio)
//! out the other, through the same stack the binary wires up.
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use anyhow::Result;

use softtnc::Shutdown;
use softtnc::audio::{VecSink, VecSource};
use softtnc::ax25::Packet;
use softtnc::config::Config;
use softtnc::fec::{CandidateFrame, FecMode, FecType, RetryLevel};
use softtnc::gen_tone::ToneGen;
use softtnc::modem::{Modem, ModemConfig};
use softtnc::ptt::NullPtt;
use softtnc::recv::{self, ChannelRx, Dispatch, DispatchOpts};
use softtnc::tq::{Prio, TxQueues};
use softtnc::wav::{WavReader, WavWriter};
use softtnc::xmit::{Transmitter, XmitParams};

fn decode_audio(cfg: &ModemConfig, audio: &[i16]) -> Vec<CandidateFrame> {
    let mut m = Modem::new(0, cfg);
    let mut out = m.process(audio);
    out.extend(m.finish());
    out
}

#[test]
fn plain_ui_decode_from_wav() -> Result<()> {
    // Generate the transmission, round it through an actual WAV file,
    // and decode through the audio input loop.
    let p = Packet::from_monitor("WB2OSZ-5>APDW17,WIDE1-1,WIDE2-1:>test")?;
    let cfg = ModemConfig::default();
    let mut tg = ToneGen::new(&cfg);
    let audio = tg.packet_to_audio(&p.to_bytes(), FecMode::None);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("packet.wav");
    let mut w = WavWriter::new(std::fs::File::create(&path)?, cfg.sample_rate, 1)?;
    use softtnc::audio::AudioSink;
    w.write(&audio)?;
    w.finalize()?;

    let reader = WavReader::new(std::fs::File::open(&path)?)?;
    let (tx, rx) = mpsc::channel();
    let mut chans = vec![ChannelRx {
        chan: 0,
        modem: Modem::new(0, &cfg),
        tx,
        dcd: Arc::new(AtomicBool::new(false)),
    }];
    recv::run_audio_input(Box::new(reader), &mut chans, Shutdown::new());
    drop(chans);

    let frames: Vec<CandidateFrame> = rx.iter().collect();
    assert_eq!(frames.len(), 1);
    let got = Packet::from_bytes(&frames[0].data)?;
    assert_eq!(got.to_monitor(), "WB2OSZ-5>APDW17,WIDE1-1,WIDE2-1:>test");
    assert_eq!(frames[0].fec_type, FecType::None);
    assert_eq!(frames[0].retry, RetryLevel::None);
    Ok(())
}

fn digi_hub() -> (Dispatch, Arc<TxQueues>) {
    let cfg = Config::from_json(
        r#"{
          "channels": [ { "mycall": "N0CALL-1" } ],
          "digipeat": [ { "from": 0, "to": 0,
                          "alias": "^N0CALL(-\\d+)?$",
                          "wide": "^WIDE[1-7]$",
                          "preempt": "trace" } ]
        }"#,
    )
    .unwrap();
    let tq = Arc::new(TxQueues::new(1, 10));
    let opts = DispatchOpts {
        quiet_heard: true,
        quiet_decode: true,
        ..DispatchOpts::default()
    };
    (
        Dispatch::new(opts, cfg.build_digipeater().unwrap(), tq.clone()),
        tq,
    )
}

fn rf(mon: &str) -> CandidateFrame {
    CandidateFrame {
        chan: 0,
        subchan: 0,
        slice: 0,
        data: Packet::from_monitor(mon).unwrap().to_bytes(),
        fec_type: FecType::None,
        retry: RetryLevel::None,
        corrected: 0,
        audio_level: 50,
        stream_pos: 0,
        spectrum: String::new(),
    }
}

#[test]
fn wide1_digi_lands_in_hi_queue() {
    let (mut hub, tq) = digi_hub();
    hub.process(&rf("A>B,WIDE1-1:hi"));
    let e = tq.chan(0).unwrap().try_dequeue().expect("digipeated");
    assert_eq!(e.prio, Prio::Hi);
    assert_eq!(e.packet.to_monitor(), "A>B,N0CALL-1*:hi");
}

#[test]
fn wide2_trace_inserts_mycall() {
    let (mut hub, tq) = digi_hub();
    hub.process(&rf("A>B,WIDE2-2:hi"));
    let e = tq.chan(0).unwrap().try_dequeue().expect("digipeated");
    assert_eq!(e.packet.to_monitor(), "A>B,N0CALL-1*,WIDE2-1:hi");
}

#[test]
fn preempt_trace_drops_prior_unused() {
    let (mut hub, tq) = digi_hub();
    hub.process(&rf("A>B,FOO,BAR,N0CALL,WIDE1-1:hi"));
    let e = tq.chan(0).unwrap().try_dequeue().expect("digipeated");
    assert_eq!(e.packet.to_monitor(), "A>B,N0CALL-1*,WIDE1-1:hi");
}

#[test]
fn dedupe_suppresses_second_copy() {
    let (mut hub, tq) = digi_hub();
    hub.process(&rf("A>B,WIDE1-1:hi"));
    assert!(tq.chan(0).unwrap().try_dequeue().is_some());
    // Seconds later, same (src, dst, info) through a different path.
    hub.process(&rf("A>B,WIDE2-1:hi"));
    assert!(tq.chan(0).unwrap().try_dequeue().is_none());
}

#[test]
fn fx25_recovery_over_audio() -> Result<()> {
    let info = vec![b'F'; 150];
    let p = Packet::new_ui("APDW17", "WB2OSZ-5", &[], &info)?;
    let cfg = ModemConfig::default();
    let mut tg = ToneGen::new(&cfg);
    let mut audio = tg.packet_to_audio(&p.to_bytes(), FecMode::Fx25 { check_bytes: 16 });
    // Brutalize a stretch of the codeword: zero out 8 bit-times well
    // past the correlation tag.
    let spb = (cfg.sample_rate / cfg.baud) as usize;
    let start = audio.len() / 2;
    for s in &mut audio[start..start + 8 * spb] {
        *s = 0;
    }
    let got = decode_audio(&cfg, &audio);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].fec_type, FecType::Fx25);
    assert!(got[0].corrected > 0);
    assert_eq!(got[0].data, p.to_bytes());
    Ok(())
}

#[test]
fn il2p_corrected_symbols_reported() -> Result<()> {
    let info = vec![b'I'; 300];
    let p = Packet::new_ui("APDW17", "WB2OSZ-5", &[], &info)?;
    let cfg = ModemConfig::default();
    let mut tg = ToneGen::new(&cfg);
    let audio = tg.packet_to_audio(&p.to_bytes(), FecMode::Il2p { invert: false });
    let got = decode_audio(&cfg, &audio);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].fec_type, FecType::Il2p);
    assert_eq!(got[0].corrected, 0);
    assert_eq!(got[0].data, p.to_bytes());
    Ok(())
}

#[test]
fn receive_digipeat_transmit_loop() -> Result<()> {
    // The whole station: a WIDE1-1 packet is heard, digipeated, and
    // the transmitted audio decodes to the rewritten path.
    let (hub, tq) = digi_hub();
    let hub = Arc::new(Mutex::new(hub));
    let shutdown = Shutdown::new();

    let sink = VecSink::new();
    let t = Transmitter::new(
        0,
        ModemConfig::default(),
        Arc::new(Mutex::new(XmitParams::default())),
        tq.chan(0).unwrap(),
        Box::new(NullPtt),
        Box::new(sink.clone()),
        Arc::new(AtomicBool::new(false)),
        shutdown.clone(),
    );
    let xmit_thread = std::thread::spawn(move || t.run());

    // On-air packet arrives.
    let p = Packet::from_monitor("A>B,WIDE1-1:loop test")?;
    let cfg = ModemConfig::default();
    let mut tg = ToneGen::new(&cfg);
    let rx_audio = tg.packet_to_audio(&p.to_bytes(), FecMode::None);
    let mut source_chans = {
        let (tx, rx) = mpsc::channel();
        let chans = vec![ChannelRx {
            chan: 0,
            modem: Modem::new(0, &cfg),
            tx,
            dcd: Arc::new(AtomicBool::new(false)),
        }];
        let hub2 = hub.clone();
        let h = recv::spawn_dispatcher(0, rx, hub2, shutdown.clone());
        (chans, h)
    };
    recv::run_audio_input(
        Box::new(VecSource::new(rx_audio, cfg.sample_rate, 1)),
        &mut source_chans.0,
        shutdown.clone(),
    );
    drop(source_chans.0);
    source_chans.1.join().unwrap();

    // Give the transmitter time to send, then stop it.
    for _ in 0..100 {
        if !sink.samples().is_empty() && tq.chan(0).unwrap().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    std::thread::sleep(Duration::from_millis(300));
    tq.shutdown();
    xmit_thread.join().unwrap();

    let tx_audio = sink.samples();
    assert!(!tx_audio.is_empty(), "nothing was transmitted");
    let got = decode_audio(&cfg, &tx_audio);
    assert_eq!(got.len(), 1);
    assert_eq!(
        Packet::from_bytes(&got[0].data)?.to_monitor(),
        "A>B,N0CALL-1*:loop test"
    );
    Ok(())
}

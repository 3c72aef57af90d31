/*! Software AX.25 TNC.

Decode and transmit packet radio through WAV files or piped PCM,
serve the traffic to host applications over KISS (TCP, serial, pty)
and AGW, digipeat APRS, and optionally feed an APRS-IS server.

```no_run
$ softtnc -c tnc.json recording.wav
[…]
$ arecord -f S16_LE -r 44100 | softtnc -c tnc.json --stdin-audio
[…]
```

Platform sound systems stay outside: pipe PCM in and out, the same
way an SDR pipeline would.
*/
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, mpsc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};

use softtnc::audio::{AudioSink, AudioSource, NullSink};
use softtnc::config::{Config, Medium, PttConfig};
use softtnc::kissnet::{HostGlue, KissTcpServer};
use softtnc::modem::Modem;
use softtnc::ptt::{Cm108Ptt, CommandPtt, NullPtt, PttLine, SerialPtt};
use softtnc::recv::{self, ChannelRx, Dispatch, DispatchOpts, FrameSink, spawn_dispatcher};
use softtnc::tq::TxQueues;
use softtnc::wav::{WavReader, WavWriter};
use softtnc::xmit::Transmitter;
use softtnc::{Shutdown, agw, igate, kisspt, kissserial};

#[derive(clap::Parser, Debug)]
#[command(version, about, disable_help_flag = true)]
struct Opt {
    #[arg(long, action = clap::ArgAction::HelpLong, help = "Print help")]
    help: Option<bool>,

    #[arg(short = 'c', help = "Configuration file (JSON)")]
    config: Option<PathBuf>,

    #[arg(short = 'p', help = "Serve KISS on a pseudo terminal")]
    pty: bool,

    #[arg(short = 'n', help = "Override the number of channels")]
    channels: Option<usize>,

    #[arg(short = 'r', help = "Audio sample rate override")]
    sample_rate: Option<u32>,

    #[arg(short = 'B', help = "Modem preset: 300 or 1200 baud")]
    modem_preset: Option<u32>,

    #[arg(short = 'b', help = "KISS serial port baud rate override")]
    serial_baud: Option<u32>,

    #[arg(
        short = 'd',
        help = "Debug output; letters select subsystems, more letters for trace"
    )]
    debug: Option<String>,

    #[arg(short = 'q', help = "Quiet: h = heard line, d = APRS decoding")]
    quiet: Vec<char>,

    #[arg(short = 'h', help = "Hex dump received frames")]
    hex_dump: bool,

    #[arg(short = 'A', help = "Convert received AIS to APRS Object Report")]
    ais_to_obj: bool,

    #[arg(long, help = "Read s16le PCM audio from stdin")]
    stdin_audio: bool,

    #[arg(long, help = "Write transmitted audio to a WAV file")]
    tx_wav: Option<PathBuf>,

    #[arg(help = "WAV recordings to decode")]
    files: Vec<PathBuf>,
}

// Raw s16le from a pipe, for feeding from arecord or an SDR chain.
struct StdinAudio {
    sample_rate: u32,
}

impl AudioSource for StdinAudio {
    fn read(&mut self, buf: &mut [i16]) -> softtnc::Result<usize> {
        let mut raw = vec![0u8; buf.len() * 2];
        let mut stdin = std::io::stdin().lock();
        let mut filled = 0;
        // Partial reads are fine, partial samples are not: keep going
        // until we hold whole samples (or hit end of stream).
        while filled == 0 || filled % 2 == 1 {
            let n = stdin
                .read(&mut raw[filled..])
                .map_err(|e| softtnc::Error::Io("reading stdin audio".into(), e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let samples = filled / 2;
        if samples == 0 {
            return Ok(0);
        }
        for (o, c) in buf.iter_mut().zip(raw[..samples * 2].chunks_exact(2)) {
            *o = i16::from_le_bytes([c[0], c[1]]);
        }
        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        1
    }
}

fn build_ptt(cfg: &PttConfig) -> Result<Box<dyn PttLine>> {
    Ok(match cfg {
        PttConfig::None => Box::new(NullPtt),
        PttConfig::Command { command } => Box::new(CommandPtt::new(command)),
        PttConfig::Serial {
            device,
            line,
            invert,
        } => Box::new(SerialPtt::new(device, *line, *invert)?),
        PttConfig::Cm108 { device, gpio } => Box::new(Cm108Ptt::new(device, *gpio)?),
    })
}

fn apply_overrides(cfg: &mut Config, opt: &Opt) -> Result<()> {
    if let Some(n) = opt.channels {
        if n == 0 || n > softtnc::MAX_CHANS {
            bail!("-n {n} out of range");
        }
        let template = cfg.channels[0].clone();
        cfg.channels.resize(n, template);
    }
    for ch in &mut cfg.channels {
        if let Some(r) = opt.sample_rate {
            ch.modem.sample_rate = r;
        }
        match opt.modem_preset {
            None => {}
            Some(1200) => {
                ch.modem.baud = 1200;
                ch.modem.mark_freq = 1200.0;
                ch.modem.space_freq = 2200.0;
            }
            Some(300) => {
                ch.modem.baud = 300;
                ch.modem.mark_freq = 1600.0;
                ch.modem.space_freq = 1800.0;
            }
            Some(other) => bail!("no modem preset for {other} baud"),
        }
    }
    if let Some(b) = opt.serial_baud {
        cfg.kiss.serial_baud = b;
    }
    if opt.pty {
        cfg.kiss.pty = true;
    }
    cfg.validate().context("after command line overrides")?;
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let verbosity = match &opt.debug {
        None => 2,
        Some(letters) if letters.len() > 1 => 4,
        Some(_) => 3,
    };
    stderrlog::new()
        .module(module_path!())
        .module("softtnc")
        .verbosity(verbosity)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let mut cfg = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut cfg, &opt)?;
    if opt.ais_to_obj {
        warn!("-A noted; AIS decoding is delegated to an external collaborator");
    }

    let shutdown = Shutdown::new();
    let tq = Arc::new(TxQueues::new(cfg.channels.len(), cfg.tx_queue_depth));
    let params: Vec<_> = cfg
        .channels
        .iter()
        .map(|c| {
            let mut p = c.xmit;
            p.sanitize();
            Arc::new(Mutex::new(p))
        })
        .collect();
    let glue = Arc::new(HostGlue {
        tq: tq.clone(),
        params: params.clone(),
    });

    let opts = DispatchOpts {
        quiet_heard: opt.quiet.contains(&'h'),
        quiet_decode: opt.quiet.contains(&'d'),
        hex_dump: opt.hex_dump,
        igate_vchannel: cfg.igate.as_ref().and_then(|ig| ig.vchannel),
    };
    let mut dispatch = Dispatch::new(opts, cfg.build_digipeater()?, tq.clone());

    let mut join_handles = Vec::new();

    // Host interfaces.
    let mut sinks: Vec<Arc<dyn FrameSink>> = Vec::new();
    if let Some(port) = cfg.kiss.tcp_port {
        let (srv, _, h) = KissTcpServer::start(port, glue.clone(), shutdown.clone())?;
        sinks.push(srv);
        join_handles.push(h);
    }
    if let Some(dev) = &cfg.kiss.serial_device {
        let (srv, h) = kissserial::KissSerial::start(
            dev,
            cfg.kiss.serial_baud,
            glue.clone(),
            shutdown.clone(),
        )?;
        sinks.push(srv);
        join_handles.push(h);
    }
    if cfg.kiss.pty {
        let (srv, h) = kisspt::KissPty::start(glue.clone(), shutdown.clone())?;
        sinks.push(srv);
        join_handles.push(h);
    }
    if let Some(port) = cfg.agw.port {
        let (srv, _, h) = agw::AgwServer::start(port, glue.clone(), shutdown.clone())?;
        sinks.push(srv);
        join_handles.push(h);
    }
    for s in sinks {
        dispatch.add_sink(s);
    }

    // One frame pipe per channel, into its dispatcher thread.
    let mut senders = Vec::new();
    let mut receivers = Vec::new();
    for _ in &cfg.channels {
        let (tx, rx) = mpsc::channel();
        senders.push(tx);
        receivers.push(rx);
    }

    // IGate: gated packets out, server traffic injected into the
    // virtual channel's dispatcher.
    if let Some(ig) = cfg.igate.clone() {
        let (gtx, grx) = mpsc::channel();
        dispatch.set_igate(gtx);
        let inject = ig.vchannel.map(|v| senders[v].clone());
        join_handles.push(igate::start(ig, grx, inject, shutdown.clone()));
    }

    let dispatch = Arc::new(Mutex::new(dispatch));
    for (i, rx) in receivers.into_iter().enumerate() {
        join_handles.push(spawn_dispatcher(i, rx, dispatch.clone(), shutdown.clone()));
    }

    // Receive stacks and transmit threads for the radio channels.
    let mut chan_rx = Vec::new();
    for (i, ch) in cfg.channels.iter().enumerate() {
        if ch.medium != Medium::Radio {
            continue;
        }
        let dcd = Arc::new(AtomicBool::new(false));
        chan_rx.push(ChannelRx {
            chan: i,
            modem: Modem::new(i, &ch.modem),
            tx: senders[i].clone(),
            dcd: dcd.clone(),
        });

        let sink: Box<dyn AudioSink> = match (&opt.tx_wav, i) {
            (Some(path), 0) => {
                let f = std::fs::File::create(path)
                    .with_context(|| format!("creating {}", path.display()))?;
                Box::new(WavWriter::new(f, ch.modem.sample_rate, 1)?)
            }
            _ => Box::new(NullSink),
        };
        let t = Transmitter::new(
            i,
            ch.modem.clone(),
            params[i].clone(),
            tq.chan(i).expect("channel queue"),
            build_ptt(&ch.ptt)?,
            sink,
            dcd,
            shutdown.clone(),
        );
        join_handles.push(
            std::thread::Builder::new()
                .name(format!("xmit-{i}"))
                .spawn(move || t.run())?,
        );
    }
    drop(senders);

    {
        let sd = shutdown.clone();
        let q = tq.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nQRT");
            sd.request();
            q.shutdown();
        })
        .context("setting Ctrl-C handler")?;
    }

    // Audio input: recordings, a pipe, or nothing (network-only TNC).
    if !opt.files.is_empty() {
        for f in &opt.files {
            if shutdown.is_requested() {
                break;
            }
            let file =
                std::fs::File::open(f).with_context(|| format!("opening {}", f.display()))?;
            let reader = WavReader::new(file)?;
            info!("decoding {}", f.display());
            recv::run_audio_input(Box::new(reader), &mut chan_rx, shutdown.clone());
        }
        // Let the dispatchers drain before winding down.
        std::thread::sleep(std::time::Duration::from_millis(500));
    } else if opt.stdin_audio {
        let rate = cfg.channels[0].modem.sample_rate;
        recv::run_audio_input(
            Box::new(StdinAudio { sample_rate: rate }),
            &mut chan_rx,
            shutdown.clone(),
        );
    } else {
        info!("no audio source; serving network interfaces only");
        while !shutdown.is_requested() {
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
    }

    shutdown.request();
    tq.shutdown();
    drop(chan_rx);
    for h in join_handles {
        let _ = h.join();
    }
    info!("clean shutdown");
    Ok(())
}

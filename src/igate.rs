/*! APRS-IS (Internet Gateway) uplink.

A line-oriented TCP connection: log in, forward gated packets in TNC2
text form with the `qAR` construct appended, and feed server traffic
back into the dispatch pipeline as the virtual channel (subchannel
-2). Reconnects with a flat backoff; a receive-only station uses
passcode -1 and nothing is ever uploaded.
 */
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::Shutdown;
use crate::ax25::Packet;
use crate::config::IgateConfig;
use crate::fec::{CandidateFrame, FecType, RetryLevel};

const RECONNECT_WAIT: Duration = Duration::from_secs(30);

/// The login line for an APRS-IS server.
#[must_use]
pub fn login_line(cfg: &IgateConfig) -> String {
    let mut line = format!(
        "user {} pass {} vers softtnc {}",
        cfg.login,
        cfg.passcode,
        env!("CARGO_PKG_VERSION")
    );
    if !cfg.filter.is_empty() {
        line.push_str(&format!(" filter {}", cfg.filter));
    }
    line.push_str("\r\n");
    line
}

/// A packet in the TNC2 text form APRS-IS wants, with the qAR
/// construct naming the receiving station.
#[must_use]
pub fn to_is_line(p: &Packet, login: &str) -> String {
    let mon = p.to_monitor();
    let (head, info) = mon.split_once(':').unwrap_or((mon.as_str(), ""));
    format!("{head},qAR,{login}:{info}\r\n")
}

/// Spawn the IGate thread.
///
/// `rx` receives gated packets from the dispatch hub; `inject` (when a
/// virtual channel is configured) sends server traffic back into that
/// channel's dispatcher.
pub fn start(
    cfg: IgateConfig,
    rx: mpsc::Receiver<Packet>,
    inject: Option<mpsc::Sender<CandidateFrame>>,
    shutdown: Shutdown,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("igate".into())
        .spawn(move || {
            while !shutdown.is_requested() {
                match connect(&cfg) {
                    Ok(stream) => {
                        if let Err(e) = session(&cfg, stream, &rx, &inject, &shutdown) {
                            warn!("APRS-IS session ended: {e}");
                        }
                    }
                    Err(e) => warn!("APRS-IS connect failed: {e}"),
                }
                // Flat backoff; the servers ask for nothing fancier.
                let waited = std::time::Instant::now();
                while !shutdown.is_requested() && waited.elapsed() < RECONNECT_WAIT {
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
            debug!("igate thread down");
        })
        .expect("spawning igate thread")
}

fn connect(cfg: &IgateConfig) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect((cfg.server.as_str(), cfg.port))?;
    stream.set_read_timeout(Some(Duration::from_millis(200)))?;
    info!("connected to APRS-IS at {}:{}", cfg.server, cfg.port);
    Ok(stream)
}

fn session(
    cfg: &IgateConfig,
    mut stream: TcpStream,
    rx: &mpsc::Receiver<Packet>,
    inject: &Option<mpsc::Sender<CandidateFrame>>,
    shutdown: &Shutdown,
) -> std::io::Result<()> {
    stream.write_all(login_line(cfg).as_bytes())?;
    let mut inbuf = Vec::new();
    let mut chunk = [0u8; 2048];
    let mut sent = 0u64;
    let mut heard = 0u64;
    loop {
        if shutdown.is_requested() {
            return Ok(());
        }
        // Upload whatever the dispatcher gated through, unless we are
        // receive-only.
        while let Ok(p) = rx.try_recv() {
            if cfg.passcode < 0 {
                continue;
            }
            let line = to_is_line(&p, &cfg.login);
            stream.write_all(line.as_bytes())?;
            sent += 1;
        }
        match stream.read(&mut chunk) {
            Ok(0) => {
                info!("APRS-IS closed ({sent} sent, {heard} heard)");
                return Ok(());
            }
            Ok(n) => {
                inbuf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = inbuf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = inbuf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim_end();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    heard += 1;
                    handle_server_line(cfg, line, inject);
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }
}

fn handle_server_line(cfg: &IgateConfig, line: &str, inject: &Option<mpsc::Sender<CandidateFrame>>) {
    let (Some(vchan), Some(tx)) = (cfg.vchannel, inject) else {
        debug!("APRS-IS: {line}");
        return;
    };
    match Packet::from_monitor(line) {
        Ok(p) => {
            let _ = tx.send(CandidateFrame {
                chan: vchan,
                subchan: -2,
                slice: 0,
                data: p.to_bytes(),
                fec_type: FecType::None,
                retry: RetryLevel::None,
                corrected: 0,
                audio_level: 0,
                stream_pos: 0,
                spectrum: String::new(),
            });
        }
        Err(e) => debug!("APRS-IS line unparseable ({e}): {line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> IgateConfig {
        IgateConfig {
            server: "noam.aprs2.net".into(),
            port: 14580,
            login: "N0CALL-10".into(),
            passcode: 12345,
            filter: "m/50".into(),
            vchannel: None,
        }
    }

    #[test]
    fn login_line_format() {
        let line = login_line(&cfg());
        assert!(line.starts_with("user N0CALL-10 pass 12345 vers softtnc "));
        assert!(line.ends_with(" filter m/50\r\n"));
        let mut c = cfg();
        c.filter = String::new();
        assert!(!login_line(&c).contains("filter"));
    }

    #[test]
    fn is_line_has_qar() {
        let p = Packet::from_monitor("WB2OSZ-5>APDW17,N0CALL-1*:>hi").unwrap();
        assert_eq!(
            to_is_line(&p, "N0CALL-10"),
            "WB2OSZ-5>APDW17,N0CALL-1*,qAR,N0CALL-10:>hi\r\n"
        );
    }

    #[test]
    fn server_traffic_injected_as_virtual_channel() {
        let mut c = cfg();
        c.vchannel = Some(2);
        let (tx, rx) = mpsc::channel();
        handle_server_line(&c, "A>B,TCPIP*:>from the internet", &Some(tx));
        let f = rx.try_recv().unwrap();
        assert_eq!(f.chan, 2);
        assert_eq!(f.subchan, -2);
        let p = Packet::from_bytes(&f.data).unwrap();
        assert_eq!(p.to_monitor(), "A>B,TCPIP*:>from the internet");
    }

    #[test]
    fn comments_ignored() {
        let c = cfg();
        let (tx, rx) = mpsc::channel::<CandidateFrame>();
        // Comment lines never reach handle_server_line in session(),
        // but a malformed line must not inject anything either.
        handle_server_line(&c, "not an aprs line", &Some(tx));
        assert!(rx.try_recv().is_err());
    }
}

/*! AGW network protocol server.

The AGWPE socket protocol on TCP port 8000: a fixed 36-byte little
endian header `{port, reserved[3], datakind, reserved, pid, reserved,
callfrom[10], callto[10], datalen, user}` followed by `datalen` bytes.

Served kinds: `X`/`x` callsign registration, `k` (and `m`) to enable
monitoring, `K` raw frames in both directions, `V` UI transmission
with a via path, `R` version query. Anything else is logged and
ignored, which is what most applications expect from a TNC that
doesn't do connected mode over AGW.
 */
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::Shutdown;
use crate::ax25::Packet;
use crate::kissnet::HostGlue;
use crate::recv::FrameSink;
use crate::tq::Prio;
use crate::{Error, Result};

const HEADER_LEN: usize = 36;

/// One AGW frame header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgwHeader {
    /// Radio port (channel).
    pub port: u8,
    /// Data kind, an ASCII letter.
    pub kind: u8,
    /// PID for data frames.
    pub pid: u8,
    /// Sender callsign, NUL padded.
    pub call_from: String,
    /// Receiver callsign, NUL padded.
    pub call_to: String,
    /// Bytes of data following the header.
    pub data_len: u32,
    /// Opaque user field, echoed back.
    pub user: u32,
}

fn get_call(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).trim_end().to_string()
}

fn put_call(s: &str, out: &mut [u8]) {
    for (o, c) in out.iter_mut().zip(s.bytes()) {
        *o = c;
    }
}

impl AgwHeader {
    /// Parse a 36-byte header.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < HEADER_LEN {
            return Err(Error::Protocol("AGW header too short".into()));
        }
        Ok(Self {
            port: b[0],
            kind: b[4],
            pid: b[6],
            call_from: get_call(&b[8..18]),
            call_to: get_call(&b[18..28]),
            data_len: u32::from_le_bytes([b[28], b[29], b[30], b[31]]),
            user: u32::from_le_bytes([b[32], b[33], b[34], b[35]]),
        })
    }

    /// Serialize to the 36 wire bytes.
    #[must_use]
    pub fn build(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.port;
        out[4] = self.kind;
        out[6] = self.pid;
        put_call(&self.call_from, &mut out[8..18]);
        put_call(&self.call_to, &mut out[18..28]);
        out[28..32].copy_from_slice(&self.data_len.to_le_bytes());
        out[32..36].copy_from_slice(&self.user.to_le_bytes());
        out
    }
}

struct Client {
    id: u64,
    stream: TcpStream,
    monitor: bool,
}

/// The AGW protocol server.
pub struct AgwServer {
    clients: Mutex<Vec<Client>>,
}

impl AgwServer {
    /// Bind and start the listener thread.
    pub fn start(
        port: u16,
        glue: Arc<HostGlue>,
        shutdown: Shutdown,
    ) -> Result<(Arc<Self>, SocketAddr, std::thread::JoinHandle<()>)> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| Error::Io(format!("binding AGW port {port}"), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Io("getting local addr".into(), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Io("setting nonblocking".into(), e))?;
        info!("AGW server on {addr}");
        let server = Arc::new(Self {
            clients: Mutex::new(Vec::new()),
        });
        let srv = server.clone();
        let handle = std::thread::Builder::new()
            .name("agw".into())
            .spawn(move || srv.listen(listener, glue, shutdown))
            .expect("spawning agw thread");
        Ok((server, addr, handle))
    }

    fn listen(self: Arc<Self>, listener: TcpListener, glue: Arc<HostGlue>, shutdown: Shutdown) {
        let mut next_id = 0u64;
        loop {
            if shutdown.is_requested() {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    info!("AGW client connected from {peer}");
                    let id = next_id;
                    next_id += 1;
                    if stream.set_read_timeout(Some(Duration::from_millis(500))).is_err() {
                        continue;
                    }
                    let reader = match stream.try_clone() {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("cloning AGW client stream: {e}");
                            continue;
                        }
                    };
                    self.clients.lock().expect("poisoned").push(Client {
                        id,
                        stream,
                        monitor: false,
                    });
                    let srv = self.clone();
                    let g = glue.clone();
                    let sd = shutdown.clone();
                    std::thread::Builder::new()
                        .name(format!("agw-client-{id}"))
                        .spawn(move || srv.serve_client(id, reader, g, sd))
                        .expect("spawning agw client thread");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("AGW accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        self.clients.lock().expect("poisoned").clear();
        debug!("AGW listener down");
    }

    fn serve_client(&self, id: u64, mut stream: TcpStream, glue: Arc<HostGlue>, sd: Shutdown) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if sd.is_requested() {
                break;
            }
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    while buf.len() >= HEADER_LEN {
                        let hdr = match AgwHeader::parse(&buf[..HEADER_LEN]) {
                            Ok(h) => h,
                            Err(e) => {
                                debug!("AGW client {id}: {e}");
                                buf.clear();
                                break;
                            }
                        };
                        let total = HEADER_LEN + hdr.data_len as usize;
                        if hdr.data_len as usize > crate::MAX_FRAME_LEN * 2 {
                            debug!("AGW client {id}: implausible data length");
                            buf.clear();
                            break;
                        }
                        if buf.len() < total {
                            break;
                        }
                        let data: Vec<u8> = buf[HEADER_LEN..total].to_vec();
                        buf.drain(..total);
                        self.handle_frame(id, &hdr, &data, &glue);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    debug!("AGW client {id} read error: {e}");
                    break;
                }
            }
        }
        self.clients.lock().expect("poisoned").retain(|c| c.id != id);
        info!("AGW client {id} disconnected");
    }

    fn handle_frame(&self, id: u64, hdr: &AgwHeader, data: &[u8], glue: &Arc<HostGlue>) {
        match hdr.kind {
            b'X' => {
                // Register callsign; we accept anything.
                debug!("AGW client {id} registered {}", hdr.call_from);
                let reply = AgwHeader {
                    kind: b'X',
                    call_from: hdr.call_from.clone(),
                    data_len: 1,
                    ..AgwHeader::default()
                };
                self.reply(id, &reply, &[1]);
            }
            b'x' => {
                debug!("AGW client {id} unregistered {}", hdr.call_from);
            }
            b'k' | b'm' => {
                let mut clients = self.clients.lock().expect("poisoned");
                if let Some(c) = clients.iter_mut().find(|c| c.id == id) {
                    c.monitor = !c.monitor;
                    debug!("AGW client {id} monitor = {}", c.monitor);
                }
            }
            b'R' => {
                // Version query: major and minor as LE32.
                let reply = AgwHeader {
                    kind: b'R',
                    data_len: 8,
                    ..AgwHeader::default()
                };
                let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
                let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
                let mut v = [0u8; 8];
                v[..4].copy_from_slice(&major.to_le_bytes());
                v[4..].copy_from_slice(&minor.to_le_bytes());
                self.reply(id, &reply, &v);
            }
            b'K' => {
                // Raw frame: one leading port byte, then the AX.25
                // frame without FCS.
                let chan = hdr.port as usize;
                if data.len() < 2 {
                    debug!("AGW K frame too short");
                    return;
                }
                match Packet::from_bytes(&data[1..]) {
                    Ok(p) => glue.tq.append(chan, Prio::Lo, p),
                    Err(e) => debug!("AGW K frame unparseable: {e}"),
                }
            }
            b'V' => {
                // UI frame with via path: one byte count, then 10
                // bytes per via call, then the info field.
                let chan = hdr.port as usize;
                let Some((&nvia, rest)) = data.split_first() else {
                    debug!("AGW V frame empty");
                    return;
                };
                let nvia = nvia as usize;
                if rest.len() < nvia * 10 {
                    debug!("AGW V frame truncated via list");
                    return;
                }
                let vias: Vec<String> = (0..nvia)
                    .map(|i| get_call(&rest[i * 10..(i + 1) * 10]))
                    .collect();
                let via_refs: Vec<&str> = vias.iter().map(String::as_str).collect();
                let info = &rest[nvia * 10..];
                match Packet::new_ui(&hdr.call_to, &hdr.call_from, &via_refs, info) {
                    Ok(p) => glue.tq.append(chan, Prio::Lo, p),
                    Err(e) => debug!("AGW V frame rejected: {e}"),
                }
            }
            other => {
                debug!(
                    "AGW client {id}: kind {:?} not implemented, ignored",
                    other as char
                );
            }
        }
    }

    fn reply(&self, id: u64, hdr: &AgwHeader, data: &[u8]) {
        let mut clients = self.clients.lock().expect("poisoned");
        if let Some(c) = clients.iter_mut().find(|c| c.id == id) {
            let mut out = hdr.build().to_vec();
            out.extend_from_slice(data);
            if let Err(e) = c.stream.write_all(&out) {
                debug!("AGW reply to {id} failed: {e}");
            }
        }
    }
}

impl FrameSink for AgwServer {
    fn send_frame(&self, chan: usize, data: &[u8]) {
        let (from, to) = match Packet::from_bytes(data) {
            Ok(p) => (
                p.get_addr(crate::ax25::AX25_SOURCE).unwrap_or_default(),
                p.get_addr(crate::ax25::AX25_DESTINATION).unwrap_or_default(),
            ),
            Err(_) => (String::new(), String::new()),
        };
        let hdr = AgwHeader {
            port: chan as u8,
            kind: b'K',
            call_from: from,
            call_to: to,
            data_len: (data.len() + 1) as u32,
            ..AgwHeader::default()
        };
        let mut out = hdr.build().to_vec();
        out.push(chan as u8);
        out.extend_from_slice(data);
        let mut clients = self.clients.lock().expect("poisoned");
        clients.retain_mut(|c| {
            if !c.monitor {
                return true;
            }
            match c.stream.write_all(&out) {
                Ok(()) => true,
                Err(e) => {
                    info!("dropping AGW client {}: {e}", c.id);
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tq::TxQueues;
    use crate::xmit::XmitParams;

    #[test]
    fn header_round_trip() {
        let h = AgwHeader {
            port: 2,
            kind: b'V',
            pid: 0xf0,
            call_from: "WB2OSZ-5".into(),
            call_to: "APDW17".into(),
            data_len: 99,
            user: 0xdeadbeef,
        };
        let b = h.build();
        assert_eq!(b.len(), HEADER_LEN);
        assert_eq!(AgwHeader::parse(&b).unwrap(), h);
    }

    fn glue() -> Arc<HostGlue> {
        Arc::new(HostGlue {
            tq: Arc::new(TxQueues::new(1, 10)),
            params: vec![Arc::new(Mutex::new(XmitParams::default()))],
        })
    }

    #[test]
    fn v_frame_builds_ui_packet() {
        let g = glue();
        let shutdown = Shutdown::new();
        let (server, addr, handle) = AgwServer::start(0, g.clone(), shutdown.clone()).unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let mut data = vec![1u8]; // one via call
        let mut via = [0u8; 10];
        put_call("WIDE1-1", &mut via);
        data.extend_from_slice(&via);
        data.extend_from_slice(b"hello agw");
        let hdr = AgwHeader {
            port: 0,
            kind: b'V',
            pid: 0xf0,
            call_from: "N0CALL-1".into(),
            call_to: "APRS".into(),
            data_len: data.len() as u32,
            ..AgwHeader::default()
        };
        let mut msg = hdr.build().to_vec();
        msg.extend_from_slice(&data);
        client.write_all(&msg).unwrap();

        let mut got = None;
        for _ in 0..50 {
            if let Some(e) = g.tq.chan(0).unwrap().try_dequeue() {
                got = Some(e);
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(
            got.expect("queued").packet.to_monitor(),
            "N0CALL-1>APRS,WIDE1-1:hello agw"
        );
        drop(server);
        shutdown.request();
        handle.join().unwrap();
    }

    #[test]
    fn monitor_toggle_and_raw_frames() {
        let g = glue();
        let shutdown = Shutdown::new();
        let (server, addr, handle) = AgwServer::start(0, g, shutdown.clone()).unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));

        // Before 'k', nothing is forwarded.
        let p = Packet::from_monitor("A>B:raw").unwrap();
        server.send_frame(0, &p.to_bytes());

        let hdr = AgwHeader {
            kind: b'k',
            ..AgwHeader::default()
        };
        client.write_all(&hdr.build()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        server.send_frame(0, &p.to_bytes());

        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).unwrap();
        assert!(n >= HEADER_LEN);
        let h = AgwHeader::parse(&buf[..HEADER_LEN]).unwrap();
        assert_eq!(h.kind, b'K');
        assert_eq!(h.call_from, "A");
        let total = HEADER_LEN + h.data_len as usize;
        assert_eq!(&buf[HEADER_LEN + 1..total], &p.to_bytes()[..]);

        shutdown.request();
        handle.join().unwrap();
    }
}

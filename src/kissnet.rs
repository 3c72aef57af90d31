/*! KISS over TCP, and the host-frame handling shared by every KISS
transport.

One listener thread, one reader thread per connected client, writes
fanned out under a short-held mutex. A data frame from any client is
queued for transmission; the parameter commands adjust the channel's
transmit timing exactly like a hardware TNC would.
 */
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::Shutdown;
use crate::ax25::Packet;
use crate::kiss::{self, Command, KissDecoder, KissFrame};
use crate::recv::FrameSink;
use crate::tq::{Prio, TxQueues};
use crate::xmit::XmitParams;
use crate::{Error, Result};

/// What the KISS transports need to act on host frames: the transmit
/// queues and each channel's adjustable parameters.
pub struct HostGlue {
    /// Transmit queues, data frames land here.
    pub tq: Arc<TxQueues>,
    /// Per-channel transmit parameters.
    pub params: Vec<Arc<Mutex<XmitParams>>>,
}

impl HostGlue {
    /// Act on one unescaped KISS frame from a host.
    pub fn process_host_frame(&self, inner: &[u8]) {
        let f = match KissFrame::parse(inner) {
            Ok(f) => f,
            Err(e) => {
                debug!("KISS host frame dropped: {e}");
                return;
            }
        };
        let chan = f.chan as usize;
        if chan >= self.tq.num_chans() {
            debug!("KISS host frame for nonexistent channel {chan}");
            return;
        }
        let set = |apply: &dyn Fn(&mut XmitParams, u8)| {
            let Some(&v) = f.data.first() else {
                debug!("KISS {:?} with no value", f.cmd);
                return;
            };
            let mut p = self.params[chan].lock().expect("poisoned");
            apply(&mut p, v);
            p.sanitize();
            debug!("KISS {:?} = {v} on channel {chan}", f.cmd);
        };
        match f.cmd {
            Command::Data => match Packet::from_bytes(&f.data) {
                Ok(p) => self.tq.append(chan, Prio::Lo, p),
                Err(e) => debug!("KISS data frame unparseable: {e}"),
            },
            Command::TxDelay => set(&|p, v| p.txdelay = v),
            Command::Persistence => set(&|p, v| p.persist = v),
            Command::SlotTime => set(&|p, v| p.slottime = v),
            Command::TxTail => set(&|p, v| p.txtail = v),
            Command::FullDuplex => set(&|p, v| p.fulldup = v != 0),
            Command::SetHardware => {
                // TNC specific; nothing defined here yet.
                debug!("KISS SetHardware ignored ({} bytes)", f.data.len());
            }
            Command::EndKiss => {
                // Acknowledged by ignoring it.
            }
        }
    }
}

struct Client {
    id: u64,
    stream: TcpStream,
}

/// The KISS TCP server.
pub struct KissTcpServer {
    clients: Mutex<Vec<Client>>,
}

impl KissTcpServer {
    /// Bind and start the listener thread. Returns the server handle
    /// (a [`FrameSink`]), the bound address, and the listener join
    /// handle.
    pub fn start(
        port: u16,
        glue: Arc<HostGlue>,
        shutdown: Shutdown,
    ) -> Result<(Arc<Self>, SocketAddr, std::thread::JoinHandle<()>)> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| Error::Io(format!("binding KISS TCP port {port}"), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Io("getting local addr".into(), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Io("setting nonblocking".into(), e))?;
        info!("KISS TCP server on {addr}");
        let server = Arc::new(Self {
            clients: Mutex::new(Vec::new()),
        });
        let srv = server.clone();
        let handle = std::thread::Builder::new()
            .name("kissnet".into())
            .spawn(move || srv.listen(listener, glue, shutdown))
            .expect("spawning kissnet thread");
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
                    info!("KISS client connected from {peer}");
                    let id = next_id;
                    next_id += 1;
                    if stream.set_read_timeout(Some(Duration::from_millis(500))).is_err()
                        || stream.set_nodelay(true).is_err()
                    {
                        continue;
                    }
                    let reader = match stream.try_clone() {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("cloning client stream: {e}");
                            continue;
                        }
                    };
                    self.clients
                        .lock()
                        .expect("poisoned")
                        .push(Client { id, stream });
                    let srv = self.clone();
                    let g = glue.clone();
                    let sd = shutdown.clone();
                    std::thread::Builder::new()
                        .name(format!("kiss-client-{id}"))
                        .spawn(move || srv.serve_client(id, reader, g, sd))
                        .expect("spawning kiss client thread");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!("KISS accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        // Dropping the streams hangs up the clients.
        self.clients.lock().expect("poisoned").clear();
        debug!("KISS TCP listener down");
    }

    fn serve_client(&self, id: u64, mut stream: TcpStream, glue: Arc<HostGlue>, sd: Shutdown) {
        let mut decoder = KissDecoder::new();
        let mut buf = [0u8; 1024];
        let mut frames = Vec::new();
        loop {
            if sd.is_requested() {
                break;
            }
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    decoder.feed(&buf[..n], &mut frames);
                    for f in frames.drain(..) {
                        glue.process_host_frame(&f);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    debug!("KISS client read error: {e}");
                    break;
                }
            }
        }
        self.clients.lock().expect("poisoned").retain(|c| c.id != id);
        info!("KISS client {id} disconnected");
    }
}

impl FrameSink for KissTcpServer {
    fn send_frame(&self, chan: usize, data: &[u8]) {
        let frame = KissFrame {
            chan: chan as u8,
            cmd: Command::Data,
            data: data.to_vec(),
        };
        let bytes = kiss::encapsulate(&frame.to_inner());
        let mut clients = self.clients.lock().expect("poisoned");
        clients.retain_mut(|c| match c.stream.write_all(&bytes) {
            Ok(()) => true,
            Err(e) => {
                info!("dropping KISS client {}: {e}", c.id);
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glue(nchans: usize) -> Arc<HostGlue> {
        Arc::new(HostGlue {
            tq: Arc::new(TxQueues::new(nchans, 10)),
            params: (0..nchans)
                .map(|_| Arc::new(Mutex::new(XmitParams::default())))
                .collect(),
        })
    }

    #[test]
    fn data_frame_queued_for_transmit() {
        let g = glue(2);
        let p = Packet::from_monitor("A>B:from host").unwrap();
        let mut inner = vec![0x10]; // channel 1, data
        inner.extend(p.to_bytes());
        g.process_host_frame(&inner);
        assert!(g.tq.chan(0).unwrap().try_dequeue().is_none());
        let e = g.tq.chan(1).unwrap().try_dequeue().expect("queued");
        assert_eq!(e.prio, Prio::Lo);
        assert_eq!(e.packet.to_monitor(), "A>B:from host");
    }

    #[test]
    fn parameter_commands_apply() {
        let g = glue(1);
        g.process_host_frame(&[0x01, 40]); // TXDELAY
        g.process_host_frame(&[0x02, 128]); // PERSIST
        g.process_host_frame(&[0x03, 20]); // SLOTTIME
        g.process_host_frame(&[0x05, 1]); // FULLDUP
        let p = *g.params[0].lock().unwrap();
        assert_eq!(p.txdelay, 40);
        assert_eq!(p.persist, 128);
        assert_eq!(p.slottime, 20);
        assert!(p.fulldup);
    }

    #[test]
    fn bad_channel_and_commands_ignored() {
        let g = glue(1);
        g.process_host_frame(&[0x70, 0x41]); // channel 7 doesn't exist
        g.process_host_frame(&[0x0c, 0x41]); // XKISS, unsupported
        g.process_host_frame(&[0x0f]); // EndKiss
        g.process_host_frame(&[0x00, 0x01]); // data too short for AX.25
        assert!(g.tq.chan(0).unwrap().try_dequeue().is_none());
    }

    #[test]
    fn tcp_round_trip() {
        let g = glue(1);
        let shutdown = Shutdown::new();
        let (server, addr, handle) =
            KissTcpServer::start(0, g.clone(), shutdown.clone()).unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // Give the listener a moment to pick us up.
        std::thread::sleep(Duration::from_millis(300));

        // Host to TNC: a data frame lands in the transmit queue.
        let p = Packet::from_monitor("A>B:over tcp").unwrap();
        let mut inner = vec![0u8];
        inner.extend(p.to_bytes());
        client.write_all(&kiss::encapsulate(&inner)).unwrap();
        let mut got = None;
        for _ in 0..50 {
            if let Some(e) = g.tq.chan(0).unwrap().try_dequeue() {
                got = Some(e);
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(got.expect("queued").packet.to_monitor(), "A>B:over tcp");

        // TNC to host: a received frame arrives KISS encapsulated.
        server.send_frame(0, &p.to_bytes());
        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).unwrap();
        let inner = kiss::unwrap_frame(&buf[..n]).unwrap();
        let f = KissFrame::parse(&inner).unwrap();
        assert_eq!(f.cmd, Command::Data);
        assert_eq!(f.data, p.to_bytes());

        shutdown.request();
        handle.join().unwrap();
    }
}

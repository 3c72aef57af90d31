/*! KISS over a pseudo terminal.

Creates a pty pair and publishes the slave path, so applications that
only speak "serial device" can attach to us without real hardware.
The master side is non-blocking and polled, which keeps shutdown
simple.
 */
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

use crate::Shutdown;
use crate::kiss::{self, Command, KissDecoder, KissFrame};
use crate::kissnet::HostGlue;
use crate::recv::FrameSink;
use crate::{Error, Result};

/// KISS over the master side of a pty.
pub struct KissPty {
    master: Mutex<std::fs::File>,
    slave_path: String,
}

impl KissPty {
    /// Create the pty and start the reader thread. The slave path is
    /// printed so the operator can point an application at it.
    pub fn start(
        glue: Arc<HostGlue>,
        shutdown: Shutdown,
    ) -> Result<(Arc<Self>, std::thread::JoinHandle<()>)> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK)
            .map_err(|e| Error::Io("opening pty master".into(), e.into()))?;
        grantpt(&master).map_err(|e| Error::Io("grantpt".into(), e.into()))?;
        unlockpt(&master).map_err(|e| Error::Io("unlockpt".into(), e.into()))?;
        let slave_path =
            ptsname_r(&master).map_err(|e| Error::Io("ptsname".into(), e.into()))?;
        // SAFETY: into_raw_fd transfers ownership of a valid open fd
        // to the File; nothing else closes it.
        let file = unsafe { std::fs::File::from_raw_fd(master.into_raw_fd()) };
        let mut reader = file
            .try_clone()
            .map_err(|e| Error::Io("cloning pty handle".into(), e))?;
        info!("Virtual KISS TNC is available on {slave_path}");
        println!("Virtual KISS TNC is available on {slave_path}");

        let pty = Arc::new(Self {
            master: Mutex::new(file),
            slave_path,
        });
        let handle = std::thread::Builder::new()
            .name("kisspt".into())
            .spawn(move || {
                let mut decoder = KissDecoder::new();
                let mut buf = [0u8; 512];
                let mut frames = Vec::new();
                while !shutdown.is_requested() {
                    match reader.read(&mut buf) {
                        Ok(0) => std::thread::sleep(Duration::from_millis(100)),
                        Ok(n) => {
                            decoder.feed(&buf[..n], &mut frames);
                            for f in frames.drain(..) {
                                glue.process_host_frame(&f);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        // EIO while no slave is attached; keep waiting.
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                            std::thread::sleep(Duration::from_millis(200));
                        }
                        Err(e) => {
                            debug!("pty read error: {e}");
                            break;
                        }
                    }
                }
                debug!("KISS pty reader down");
            })
            .expect("spawning kisspt thread");
        Ok((pty, handle))
    }

    /// The slave device path applications should open.
    #[must_use]
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }
}

impl FrameSink for KissPty {
    fn send_frame(&self, chan: usize, data: &[u8]) {
        let frame = KissFrame {
            chan: chan as u8,
            cmd: Command::Data,
            data: data.to_vec(),
        };
        let bytes = kiss::encapsulate(&frame.to_inner());
        if let Err(e) = self.master.lock().expect("poisoned").write_all(&bytes) {
            debug!("pty write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::Packet;
    use crate::tq::TxQueues;
    use crate::xmit::XmitParams;

    #[test]
    fn pty_host_to_tnc() {
        let glue = Arc::new(HostGlue {
            tq: Arc::new(TxQueues::new(1, 10)),
            params: vec![Arc::new(Mutex::new(XmitParams::default()))],
        });
        let shutdown = Shutdown::new();
        let (pty, handle) = KissPty::start(glue.clone(), shutdown.clone()).unwrap();

        // Pose as the host application on the slave side. Like any
        // real KISS host, put the line in raw mode first.
        let mut slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(pty.slave_path())
            .unwrap();
        let mut tio = nix::sys::termios::tcgetattr(&slave).unwrap();
        nix::sys::termios::cfmakeraw(&mut tio);
        nix::sys::termios::tcsetattr(&slave, nix::sys::termios::SetArg::TCSANOW, &tio).unwrap();
        let p = Packet::from_monitor("A>B:over pty").unwrap();
        let mut inner = vec![0u8];
        inner.extend(p.to_bytes());
        slave.write_all(&kiss::encapsulate(&inner)).unwrap();

        let mut got = None;
        for _ in 0..50 {
            if let Some(e) = glue.tq.chan(0).unwrap().try_dequeue() {
                got = Some(e);
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(got.expect("queued").packet.to_monitor(), "A>B:over pty");

        shutdown.request();
        handle.join().unwrap();
    }
}

/*! KISS over a serial port.

The classic hardware-TNC arrangement: one host on the other end of a
raw serial line. Port setup goes through termios; VMIN/VTIME give the
read loop a half-second heartbeat so shutdown is honoured without a
second thread.
 */
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};

use crate::Shutdown;
use crate::kiss::{self, Command, KissDecoder, KissFrame};
use crate::kissnet::HostGlue;
use crate::recv::FrameSink;
use crate::{Error, Result};

fn baud_rate(baud: u32) -> Result<BaudRate> {
    Ok(match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => {
            return Err(Error::Config(format!(
                "unsupported serial baud rate {other}"
            )));
        }
    })
}

/// Open and configure a serial device: raw mode, 8N1, given speed,
/// reads returning after half a second at the latest.
pub fn open_serial(device: &str, baud: u32) -> Result<std::fs::File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .map_err(|e| Error::Io(format!("opening serial port {device}"), e))?;
    let mut tio = termios::tcgetattr(&file)
        .map_err(|e| Error::Io(format!("tcgetattr {device}"), e.into()))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, baud_rate(baud)?)
        .map_err(|e| Error::Io(format!("setting speed on {device}"), e.into()))?;
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 5;
    termios::tcsetattr(&file, SetArg::TCSANOW, &tio)
        .map_err(|e| Error::Io(format!("tcsetattr {device}"), e.into()))?;
    Ok(file)
}

/// KISS over one serial line.
pub struct KissSerial {
    writer: Mutex<std::fs::File>,
}

impl KissSerial {
    /// Open the port and start the reader thread.
    pub fn start(
        device: &str,
        baud: u32,
        glue: Arc<HostGlue>,
        shutdown: Shutdown,
    ) -> Result<(Arc<Self>, std::thread::JoinHandle<()>)> {
        let file = open_serial(device, baud)?;
        let mut reader = file
            .try_clone()
            .map_err(|e| Error::Io("cloning serial handle".into(), e))?;
        info!("KISS serial on {device} at {baud} baud");
        let port = Arc::new(Self {
            writer: Mutex::new(file),
        });
        let handle = std::thread::Builder::new()
            .name("kissserial".into())
            .spawn(move || {
                let mut decoder = KissDecoder::new();
                let mut buf = [0u8; 512];
                let mut frames = Vec::new();
                while !shutdown.is_requested() {
                    match reader.read(&mut buf) {
                        // VTIME expiry with nothing to read.
                        Ok(0) => {}
                        Ok(n) => {
                            decoder.feed(&buf[..n], &mut frames);
                            for f in frames.drain(..) {
                                glue.process_host_frame(&f);
                            }
                        }
                        Err(e) => {
                            debug!("serial read error: {e}");
                            break;
                        }
                    }
                }
                debug!("KISS serial reader down");
            })
            .expect("spawning kissserial thread");
        Ok((port, handle))
    }
}

impl FrameSink for KissSerial {
    fn send_frame(&self, chan: usize, data: &[u8]) {
        let frame = KissFrame {
            chan: chan as u8,
            cmd: Command::Data,
            data: data.to_vec(),
        };
        let bytes = kiss::encapsulate(&frame.to_inner());
        if let Err(e) = self.writer.lock().expect("poisoned").write_all(&bytes) {
            debug!("serial write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_mapping() {
        assert!(matches!(baud_rate(9600), Ok(BaudRate::B9600)));
        assert!(matches!(baud_rate(115200), Ok(BaudRate::B115200)));
        assert!(baud_rate(12345).is_err());
    }

    #[test]
    fn missing_device_fails() {
        assert!(open_serial("/nonexistent/ttyXYZ", 9600).is_err());
    }
}

/*! Push-to-talk control lines.

One small trait with several ways to key a transmitter: nothing (VOX
or receive-only), a shell command, RTS/DTR on a serial port, or the
GPIO of a CM108-family USB audio adapter through its hidraw node.

Only the transmit thread of a channel touches its line; the per
channel mutex lives in the transmitter, not here.
 */
use std::io::Write;
use std::os::fd::AsRawFd;

use log::{debug, error, info};

use crate::{Error, Result};

/// A PTT line for one channel.
pub trait PttLine: Send {
    /// Assert or release the line. Errors are reported but must leave
    /// the line unasserted as far as the caller is concerned.
    fn set(&mut self, asserted: bool) -> Result<()>;
}

/// No hardware line: VOX, receive-only, or test setups.
#[derive(Debug, Default)]
pub struct NullPtt;

impl PttLine for NullPtt {
    fn set(&mut self, _asserted: bool) -> Result<()> {
        Ok(())
    }
}

/// Run a shell command with the state as its argument.
pub struct CommandPtt {
    command: String,
}

impl CommandPtt {
    /// The command gets `1` or `0` appended as an argument.
    #[must_use]
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

impl PttLine for CommandPtt {
    fn set(&mut self, asserted: bool) -> Result<()> {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("{} {}", self.command, asserted as u8))
            .status()
            .map_err(|e| Error::Io(format!("running PTT command {:?}", self.command), e))?;
        if !status.success() {
            return Err(Error::Config(format!(
                "PTT command {:?} exited with {status}",
                self.command
            )));
        }
        Ok(())
    }
}

/// Which serial handshake line keys the transmitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlLine {
    /// Request To Send.
    Rts,
    /// Data Terminal Ready.
    Dtr,
}

/// RTS or DTR on a serial port.
pub struct SerialPtt {
    file: std::fs::File,
    line: ControlLine,
    invert: bool,
}

impl SerialPtt {
    /// Open the device and make sure the line starts released.
    pub fn new(device: &str, line: ControlLine, invert: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| Error::Io(format!("opening PTT device {device}"), e))?;
        let mut s = Self { file, line, invert };
        s.set(false)?;
        info!("PTT via {:?} on {device}", s.line);
        Ok(s)
    }
}

impl PttLine for SerialPtt {
    fn set(&mut self, asserted: bool) -> Result<()> {
        let bits: libc::c_int = match self.line {
            ControlLine::Rts => libc::TIOCM_RTS,
            ControlLine::Dtr => libc::TIOCM_DTR,
        };
        let req = if asserted != self.invert {
            libc::TIOCMBIS
        } else {
            libc::TIOCMBIC
        };
        // SAFETY: fd is owned by self.file and stays open for the
        // duration of the call; TIOCMBIS/TIOCMBIC read a c_int flag
        // word from the pointer we pass and touch nothing else.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), req, &bits) };
        if rc != 0 {
            return Err(Error::Io(
                "setting serial handshake line".into(),
                std::io::Error::last_os_error(),
            ));
        }
        debug!("PTT {:?} -> {}", self.line, asserted);
        Ok(())
    }
}

/// USB audio adapter VID/PID pairs whose chips expose PTT-capable
/// GPIO: the CM108/CM119 family, SSS1623-series, and the AIOC.
pub fn is_ptt_capable_device(vid: u16, pid: u16) -> bool {
    match vid {
        0x0d8c => matches!(pid, 0x0008..=0x000f | 0x0012 | 0x0013 | 0x0139 | 0x013a),
        0x0c76 => matches!(pid, 0x1605 | 0x1607 | 0x160b),
        0x1209 => pid == 0x7388,
        _ => false,
    }
}

/// The 5-byte HID output report that drives CM108-family GPIO:
/// `{0, 0, iodata, iomask, 0}` where mask bit k makes GPIO (k+1) an
/// output and data bit k sets its level.
#[must_use]
pub fn cm108_report(gpio: u8, asserted: bool) -> [u8; 5] {
    let bit = 1u8 << (gpio - 1);
    [0, 0, if asserted { bit } else { 0 }, bit, 0]
}

/// CM108-family GPIO PTT through a hidraw device node.
pub struct Cm108Ptt {
    file: std::fs::File,
    gpio: u8,
}

impl Cm108Ptt {
    /// Open the hidraw node. GPIO 3 is the usual PTT pin on the
    /// common adapters.
    pub fn new(device: &str, gpio: u8) -> Result<Self> {
        if !(1..=8).contains(&gpio) {
            return Err(Error::Config(format!("CM108 GPIO {gpio} out of range")));
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(device)
            .map_err(|e| Error::Io(format!("opening HID device {device}"), e))?;
        info!("PTT via CM108 GPIO {gpio} on {device}");
        Ok(Self { file, gpio })
    }
}

impl PttLine for Cm108Ptt {
    fn set(&mut self, asserted: bool) -> Result<()> {
        let report = cm108_report(self.gpio, asserted);
        self.file
            .write_all(&report)
            .map_err(|e| Error::Io("writing HID report".into(), e))?;
        Ok(())
    }
}

/// Wrap a line so a failed assert logs and behaves as released, per
/// the "leave PTT low" error policy.
pub struct LoggedPtt {
    inner: Box<dyn PttLine>,
    asserted: bool,
}

impl LoggedPtt {
    /// Wrap any line implementation.
    #[must_use]
    pub fn new(inner: Box<dyn PttLine>) -> Self {
        Self {
            inner,
            asserted: false,
        }
    }

    /// Last commanded state that succeeded.
    #[must_use]
    pub fn is_asserted(&self) -> bool {
        self.asserted
    }
}

impl PttLine for LoggedPtt {
    fn set(&mut self, asserted: bool) -> Result<()> {
        match self.inner.set(asserted) {
            Ok(()) => {
                self.asserted = asserted;
                Ok(())
            }
            Err(e) => {
                error!("PTT failed, leaving unkeyed: {e}");
                self.asserted = false;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cm108_report_layout() {
        assert_eq!(cm108_report(3, true), [0, 0, 0x04, 0x04, 0]);
        assert_eq!(cm108_report(3, false), [0, 0, 0x00, 0x04, 0]);
        assert_eq!(cm108_report(1, true), [0, 0, 0x01, 0x01, 0]);
        assert_eq!(cm108_report(8, true), [0, 0, 0x80, 0x80, 0]);
    }

    #[test]
    fn device_table() {
        assert!(is_ptt_capable_device(0x0d8c, 0x0008));
        assert!(is_ptt_capable_device(0x0d8c, 0x000f));
        assert!(is_ptt_capable_device(0x0d8c, 0x013a));
        assert!(!is_ptt_capable_device(0x0d8c, 0x0010));
        assert!(is_ptt_capable_device(0x0c76, 0x1605));
        assert!(is_ptt_capable_device(0x1209, 0x7388));
        assert!(!is_ptt_capable_device(0x1209, 0x0001));
        assert!(!is_ptt_capable_device(0xffff, 0x0008));
    }

    #[test]
    fn null_ptt_never_fails() {
        let mut p = NullPtt;
        assert!(p.set(true).is_ok());
        assert!(p.set(false).is_ok());
    }

    struct FailingPtt;
    impl PttLine for FailingPtt {
        fn set(&mut self, _: bool) -> Result<()> {
            Err(Error::Config("broken".into()))
        }
    }

    #[test]
    fn logged_ptt_swallows_errors_unkeyed() {
        let mut p = LoggedPtt::new(Box::new(FailingPtt));
        assert!(p.set(true).is_ok());
        assert!(!p.is_asserted());
    }
}

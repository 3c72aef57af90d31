/*! AX.25 packet objects.

Parse and construct AX.25 frames: the address block with H and RR bits,
control octet, PID, and info field. The digipeater mutates the repeater
list through the methods here; every mutation happens on a value type so
fan-out to several channels can never alias one buffer.

Reference: AX.25 Link Access Protocol for Amateur Packet Radio, v2.2.
 */
use crate::{Error, Result};

/// Position of the destination address.
pub const AX25_DESTINATION: usize = 0;
/// Position of the source address.
pub const AX25_SOURCE: usize = 1;
/// Position of the first repeater, if any.
pub const AX25_REPEATER_1: usize = 2;
/// Repeater ceiling per AX.25.
pub const AX25_MAX_REPEATERS: usize = 8;
/// Address ceiling: source, destination, 8 repeaters.
pub const AX25_MAX_ADDRS: usize = 10;

const CONTROL_UI: u8 = 0x03;
const PID_NO_LAYER3: u8 = 0xF0;

/// One address: callsign, SSID, H ("has been repeated") and RR bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Addr {
    /// Callsign, upper case, 1-6 characters, space padded on the wire.
    call: String,
    /// 0..=15.
    ssid: u8,
    /// "Has been repeated". On destination this is the C bit.
    h: bool,
    /// The two reserved bits, 0b11 unless someone repurposed them.
    rr: u8,
}

impl Addr {
    /// Parse text form: `CALL` or `CALL-SSID`.
    pub fn parse(s: &str) -> Result<Self> {
        let (call, ssid) = match s.split_once('-') {
            None => (s, 0),
            Some((c, n)) => (
                c,
                n.parse::<u8>()
                    .map_err(|_| Error::Packet(format!("bad SSID in {s:?}")))?,
            ),
        };
        if call.is_empty() || call.len() > 6 {
            return Err(Error::Packet(format!("bad callsign length in {s:?}")));
        }
        if ssid > 15 {
            return Err(Error::Packet(format!("SSID out of range in {s:?}")));
        }
        if !call.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::Packet(format!("bad callsign character in {s:?}")));
        }
        Ok(Self {
            call: call.to_ascii_uppercase(),
            ssid,
            h: false,
            rr: 3,
        })
    }

    /// Decode 7 wire bytes.
    fn from_wire(b: &[u8]) -> Result<Self> {
        let call: String = b[..6]
            .iter()
            .map(|&x| (x >> 1) as char)
            .collect::<String>()
            .trim_end()
            .to_string();
        if call.is_empty() {
            return Err(Error::Packet("empty callsign".into()));
        }
        Ok(Self {
            call,
            ssid: (b[6] >> 1) & 0xf,
            h: b[6] & 0x80 != 0,
            rr: (b[6] >> 5) & 3,
        })
    }

    /// Encode as 7 wire bytes. `last` sets the address extension bit.
    fn to_wire(&self, last: bool) -> [u8; 7] {
        let mut out = [b' ' << 1; 7];
        for (o, c) in out.iter_mut().zip(self.call.bytes()) {
            *o = c << 1;
        }
        out[6] = ((self.h as u8) << 7) | (self.rr << 5) | (self.ssid << 1) | (last as u8);
        out
    }

    /// The H bit ("has been repeated"; C bit on destination/source).
    #[must_use]
    pub fn h(&self) -> bool {
        self.h
    }

    /// SSID, 0..=15.
    #[must_use]
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Callsign without SSID.
    #[must_use]
    pub fn call(&self) -> &str {
        &self.call
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call)
        } else {
            write!(f, "{}-{}", self.call, self.ssid)
        }
    }
}

/// Frame type, from the control octet and the C bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// Information frame.
    I {
        /// Receive sequence number.
        nr: u8,
        /// Send sequence number.
        ns: u8,
        /// Poll/final.
        pf: bool,
    },
    /// Receive Ready.
    RR {
        /// Receive sequence number.
        nr: u8,
        /// Poll/final.
        pf: bool,
    },
    /// Receive Not Ready.
    RNR {
        /// Receive sequence number.
        nr: u8,
        /// Poll/final.
        pf: bool,
    },
    /// Reject.
    REJ {
        /// Receive sequence number.
        nr: u8,
        /// Poll/final.
        pf: bool,
    },
    /// Selective Reject.
    SREJ {
        /// Receive sequence number.
        nr: u8,
        /// Poll/final.
        pf: bool,
    },
    /// Set Async Balanced Mode (connect).
    SABM,
    /// SABM extended (modulo 128 connect).
    SABME,
    /// Disconnect.
    DISC,
    /// Disconnected Mode.
    DM,
    /// Unnumbered Acknowledge.
    UA,
    /// Frame Reject.
    FRMR,
    /// Unnumbered Information.
    UI,
    /// Exchange Identification.
    XID,
    /// Test.
    TEST,
    /// Control octet matched nothing known.
    Unknown,
}

impl FrameType {
    fn describe(&self) -> &'static str {
        match self {
            FrameType::I { .. } => "I",
            FrameType::RR { .. } => "RR",
            FrameType::RNR { .. } => "RNR",
            FrameType::REJ { .. } => "REJ",
            FrameType::SREJ { .. } => "SREJ",
            FrameType::SABM => "SABM",
            FrameType::SABME => "SABME",
            FrameType::DISC => "DISC",
            FrameType::DM => "DM",
            FrameType::UA => "UA",
            FrameType::FRMR => "FRMR",
            FrameType::UI => "UI",
            FrameType::XID => "XID",
            FrameType::TEST => "TEST",
            FrameType::Unknown => "?",
        }
    }
}

/// Command or response, from the C bits of destination and source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdRes {
    /// Command (dest C=1, src C=0).
    Command,
    /// Response (dest C=0, src C=1).
    Response,
    /// Pre-AX.25 v2 station, both C bits equal.
    Legacy,
}

/// An AX.25 frame as a value object.
///
/// "Modifying" operations used by the digipeater work on `&mut self`; the
/// digipeater clones first, so the received packet is never aliased into
/// a transmit queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    addrs: Vec<Addr>,
    control: u8,
    pid: Option<u8>,
    info: Vec<u8>,
}

impl Packet {
    /// Parse a frame from wire bytes (between HDLC flags, FCS already
    /// stripped and checked).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        // Address block: 7-byte groups until one has the extension bit.
        let mut naddr = 0;
        loop {
            let end = (naddr + 1) * 7;
            if end > buf.len() {
                return Err(Error::Packet("no address block terminator".into()));
            }
            naddr += 1;
            if buf[end - 1] & 1 != 0 {
                break;
            }
            if naddr == AX25_MAX_ADDRS {
                return Err(Error::Packet("more than 10 addresses".into()));
            }
        }
        if naddr < 2 {
            return Err(Error::Packet("fewer than 2 addresses".into()));
        }
        let addrs = buf[..naddr * 7]
            .chunks(7)
            .map(Addr::from_wire)
            .collect::<Result<Vec<_>>>()?;
        let rest = &buf[naddr * 7..];
        let Some((&control, rest)) = rest.split_first() else {
            return Err(Error::Packet("missing control octet".into()));
        };
        // PID is present only on I and UI frames.
        let has_pid = control & 1 == 0 || control & 0xef == CONTROL_UI;
        let (pid, info) = if has_pid {
            let Some((&pid, info)) = rest.split_first() else {
                return Err(Error::Packet("missing PID octet".into()));
            };
            (Some(pid), info.to_vec())
        } else {
            (None, rest.to_vec())
        };
        Ok(Self {
            addrs,
            control,
            pid,
            info,
        })
    }

    /// Serialize to wire bytes (no FCS, no flags).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.addrs.len() * 7 + 2 + self.info.len());
        let last = self.addrs.len() - 1;
        for (i, a) in self.addrs.iter().enumerate() {
            out.extend_from_slice(&a.to_wire(i == last));
        }
        out.push(self.control);
        if let Some(pid) = self.pid {
            out.push(pid);
        }
        out.extend_from_slice(&self.info);
        out
    }

    /// Build a UI frame from addresses and info.
    pub fn new_ui(dest: &str, source: &str, via: &[&str], info: &[u8]) -> Result<Self> {
        let mut addrs = vec![Addr::parse(dest)?, Addr::parse(source)?];
        for v in via {
            addrs.push(Addr::parse(v)?);
        }
        if addrs.len() > AX25_MAX_ADDRS {
            return Err(Error::Packet("more than 10 addresses".into()));
        }
        Ok(Self {
            addrs,
            control: CONTROL_UI,
            pid: Some(PID_NO_LAYER3),
            info: info.to_vec(),
        })
    }

    /// Parse the monitor format `SRC>DST,DIGI,DIGI*:info`.
    ///
    /// An asterisk sets H on that repeater and all repeaters before it.
    /// The result is a UI frame with PID 0xF0.
    pub fn from_monitor(s: &str) -> Result<Self> {
        let (head, info) = s
            .split_once(':')
            .ok_or_else(|| Error::Packet(format!("no ':' in {s:?}")))?;
        let (src, rest) = head
            .split_once('>')
            .ok_or_else(|| Error::Packet(format!("no '>' in {s:?}")))?;
        let mut parts = rest.split(',');
        let dest = parts.next().unwrap_or_default();
        let mut addrs = vec![Addr::parse(dest)?, Addr::parse(src)?];
        let mut last_h = None;
        for v in parts {
            let (v, h) = match v.strip_suffix('*') {
                Some(v) => (v, true),
                None => (v, false),
            };
            addrs.push(Addr::parse(v)?);
            if h {
                last_h = Some(addrs.len() - 1);
            }
        }
        if addrs.len() > AX25_MAX_ADDRS {
            return Err(Error::Packet("more than 10 addresses".into()));
        }
        if let Some(n) = last_h {
            for a in &mut addrs[AX25_REPEATER_1..=n] {
                a.h = true;
            }
        }
        Ok(Self {
            addrs,
            control: CONTROL_UI,
            pid: Some(PID_NO_LAYER3),
            info: info.as_bytes().to_vec(),
        })
    }

    /// Format addresses and info in monitor form. The last repeater with
    /// H set gets the asterisk.
    #[must_use]
    pub fn to_monitor(&self) -> String {
        let mut out = self.format_addrs();
        out.push_str(&safe_print(&self.info));
        out
    }

    /// Format just the address part, `SRC>DST,DIGI*:`.
    #[must_use]
    pub fn format_addrs(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = write!(
            out,
            "{}>{}",
            self.addrs[AX25_SOURCE], self.addrs[AX25_DESTINATION]
        );
        let star = self
            .addrs
            .iter()
            .enumerate()
            .skip(AX25_REPEATER_1)
            .filter(|(_, a)| a.h)
            .map(|(i, _)| i)
            .next_back();
        for (i, a) in self.addrs.iter().enumerate().skip(AX25_REPEATER_1) {
            let _ = write!(out, ",{}{}", a, if star == Some(i) { "*" } else { "" });
        }
        out.push(':');
        out
    }

    /// Deep copy with distinct identity, for digipeater fan-out.
    #[must_use]
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Total number of addresses, 2..=10.
    #[must_use]
    pub fn num_addrs(&self) -> usize {
        self.addrs.len()
    }

    /// Number of repeater addresses, 0..=8.
    #[must_use]
    pub fn num_repeaters(&self) -> usize {
        self.addrs.len() - 2
    }

    /// Address at a position, text form with SSID.
    pub fn get_addr(&self, pos: usize) -> Result<String> {
        self.addr(pos).map(|a| a.to_string())
    }

    fn addr(&self, pos: usize) -> Result<&Addr> {
        self.addrs
            .get(pos)
            .ok_or_else(|| Error::Packet(format!("address position {pos} out of range")))
    }

    /// Replace the address at a position, keeping its H bit clear.
    pub fn set_addr(&mut self, pos: usize, s: &str) -> Result<()> {
        let a = Addr::parse(s)?;
        *self
            .addrs
            .get_mut(pos)
            .ok_or_else(|| Error::Packet(format!("address position {pos} out of range")))? = a;
        Ok(())
    }

    /// Set or clear the H bit at a position.
    pub fn set_h(&mut self, pos: usize, h: bool) -> Result<()> {
        self.addrs
            .get_mut(pos)
            .ok_or_else(|| Error::Packet(format!("address position {pos} out of range")))?
            .h = h;
        Ok(())
    }

    /// H bit at a position.
    pub fn get_h(&self, pos: usize) -> Result<bool> {
        self.addr(pos).map(|a| a.h)
    }

    /// SSID at a position.
    pub fn get_ssid(&self, pos: usize) -> Result<u8> {
        self.addr(pos).map(|a| a.ssid)
    }

    /// Overwrite the SSID at a position.
    pub fn set_ssid(&mut self, pos: usize, ssid: u8) -> Result<()> {
        if ssid > 15 {
            return Err(Error::Packet(format!("SSID {ssid} out of range")));
        }
        self.addrs
            .get_mut(pos)
            .ok_or_else(|| Error::Packet(format!("address position {pos} out of range")))?
            .ssid = ssid;
        Ok(())
    }

    /// Insert an address, shifting successors up. Fails when the frame
    /// already carries 10 addresses or the position is outside the
    /// repeater block.
    pub fn insert_addr(&mut self, pos: usize, s: &str) -> Result<()> {
        if self.addrs.len() >= AX25_MAX_ADDRS {
            return Err(Error::Packet("no room for another repeater".into()));
        }
        if !(AX25_REPEATER_1..=self.addrs.len()).contains(&pos) {
            return Err(Error::Packet(format!("bad insert position {pos}")));
        }
        self.addrs.insert(pos, Addr::parse(s)?);
        Ok(())
    }

    /// Remove the address at a position, shifting successors down.
    pub fn remove_addr(&mut self, pos: usize) -> Result<()> {
        if !(AX25_REPEATER_1..self.addrs.len()).contains(&pos) {
            return Err(Error::Packet(format!("bad remove position {pos}")));
        }
        self.addrs.remove(pos);
        Ok(())
    }

    /// Lowest-numbered repeater with H clear. `None` when there are no
    /// repeaters or all are used up.
    #[must_use]
    pub fn first_not_repeated(&self) -> Option<usize> {
        (AX25_REPEATER_1..self.addrs.len()).find(|&i| !self.addrs[i].h)
    }

    /// Whom are we actually hearing: the last repeater with H set, else
    /// the source.
    #[must_use]
    pub fn heard(&self) -> usize {
        (AX25_REPEATER_1..self.addrs.len())
            .rev()
            .find(|&i| self.addrs[i].h)
            .unwrap_or(AX25_SOURCE)
    }

    /// APRS means a UI frame with PID 0xF0.
    #[must_use]
    pub fn is_aprs(&self) -> bool {
        self.control & 0xef == CONTROL_UI && self.pid == Some(PID_NO_LAYER3)
    }

    /// The control octet.
    #[must_use]
    pub fn control(&self) -> u8 {
        self.control
    }

    /// The PID octet, present on I and UI frames.
    #[must_use]
    pub fn pid(&self) -> Option<u8> {
        self.pid
    }

    /// The info field.
    #[must_use]
    pub fn info(&self) -> &[u8] {
        &self.info
    }

    /// Classify the control octet.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        let c = self.control;
        let nr = (c >> 5) & 7;
        let pf = c & 0x10 != 0;
        if c & 1 == 0 {
            return FrameType::I {
                nr,
                ns: (c >> 1) & 7,
                pf,
            };
        }
        if c & 2 == 0 {
            return match (c >> 2) & 3 {
                0 => FrameType::RR { nr, pf },
                1 => FrameType::RNR { nr, pf },
                2 => FrameType::REJ { nr, pf },
                _ => FrameType::SREJ { nr, pf },
            };
        }
        match c & 0xef {
            0x6f => FrameType::SABME,
            0x2f => FrameType::SABM,
            0x43 => FrameType::DISC,
            0x0f => FrameType::DM,
            0x63 => FrameType::UA,
            0x87 => FrameType::FRMR,
            0x03 => FrameType::UI,
            0xaf => FrameType::XID,
            0xe3 => FrameType::TEST,
            _ => FrameType::Unknown,
        }
    }

    /// Command, response, or a pre-v2 station.
    #[must_use]
    pub fn cmd_res(&self) -> CmdRes {
        match (self.addrs[AX25_DESTINATION].h, self.addrs[AX25_SOURCE].h) {
            (true, false) => CmdRes::Command,
            (false, true) => CmdRes::Response,
            _ => CmdRes::Legacy,
        }
    }

    /// One-line type description for the monitor, e.g. `(UI)` or
    /// `(RR nr=3 p/f)`.
    #[must_use]
    pub fn describe_type(&self) -> String {
        let t = self.frame_type();
        match t {
            FrameType::I { nr, ns, pf } => {
                format!("(I nr={nr} ns={ns}{})", if pf { " p/f" } else { "" })
            }
            FrameType::RR { nr, pf }
            | FrameType::RNR { nr, pf }
            | FrameType::REJ { nr, pf }
            | FrameType::SREJ { nr, pf } => {
                format!("({} nr={nr}{})", t.describe(), if pf { " p/f" } else { "" })
            }
            _ => format!("({})", t.describe()),
        }
    }

    /// Hex dump with offsets and printable column, for `-d p`.
    #[must_use]
    pub fn hex_dump(&self) -> String {
        use itertools::Itertools;
        use std::fmt::Write;
        let bytes = self.to_bytes();
        let mut out = String::new();
        for (n, chunk) in bytes.chunks(16).enumerate() {
            let hex = chunk.iter().map(|b| format!("{b:02x}")).join(" ");
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if (0x20..0x7f).contains(&b) {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            let _ = writeln!(out, "  {:03x}: {hex:<47}  {ascii}", n * 16);
        }
        out
    }
}

/// Replace unprintable bytes for terminal output.
#[must_use]
pub fn safe_print(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if (0x20..0x7f).contains(&b) || b >= 0x80 {
                // Pass high bytes through so UTF-8 comments display.
                (b as char).to_string()
            } else {
                format!("<0x{b:02x}>")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_round_trip() -> crate::Result<()> {
        for s in ["WB2OSZ-5", "N0CALL", "WIDE2-1", "A-15"] {
            let a = Addr::parse(s)?;
            assert_eq!(a.to_string(), s);
            let w = a.to_wire(false);
            assert_eq!(Addr::from_wire(&w)?, a);
        }
        Ok(())
    }

    #[test]
    fn addr_rejects() {
        for s in ["", "TOOLONG7", "W2-16", "BAD CALL", "A-x"] {
            assert!(Addr::parse(s).is_err(), "expected reject: {s:?}");
        }
    }

    #[test]
    fn bytes_round_trip() -> crate::Result<()> {
        let p = Packet::from_monitor("WB2OSZ-5>APDW17,WIDE1-1,WIDE2-1:>test")?;
        let b = p.to_bytes();
        let q = Packet::from_bytes(&b)?;
        assert_eq!(p, q);
        assert_eq!(q.to_bytes(), b);
        Ok(())
    }

    #[test]
    fn monitor_round_trip() -> crate::Result<()> {
        for s in [
            "A>B:hi",
            "A>B,WIDE1-1:hi",
            "A>B,N0CALL-1*,WIDE2-1:hi",
            "WB2OSZ-5>APDW17,WIDE1-1,WIDE2-1:>test",
        ] {
            assert_eq!(Packet::from_monitor(s)?.to_monitor(), s);
        }
        Ok(())
    }

    #[test]
    fn star_marks_all_prior() -> crate::Result<()> {
        let p = Packet::from_monitor("A>B,C,D*,E:hi")?;
        assert!(p.get_h(2)?);
        assert!(p.get_h(3)?);
        assert!(!p.get_h(4)?);
        // Only the last used digi gets the star back.
        assert_eq!(p.to_monitor(), "A>B,C,D*,E:hi");
        Ok(())
    }

    #[test]
    fn dup_is_distinct_and_equal() -> crate::Result<()> {
        let p = Packet::from_monitor("A>B,WIDE1-1:x")?;
        let mut d = p.dup();
        assert_eq!(d.to_bytes(), p.to_bytes());
        d.set_h(2, true)?;
        assert_ne!(d.to_bytes(), p.to_bytes());
        Ok(())
    }

    #[test]
    fn first_not_repeated() -> crate::Result<()> {
        let p = Packet::from_monitor("A>B:x")?;
        assert_eq!(p.first_not_repeated(), None);
        let p = Packet::from_monitor("A>B,C*,D:x")?;
        assert_eq!(p.first_not_repeated(), Some(3));
        let p = Packet::from_monitor("A>B,C,D:x")?;
        assert_eq!(p.first_not_repeated(), Some(2));
        let p = Packet::from_monitor("A>B,C,D*:x")?;
        assert_eq!(p.first_not_repeated(), None);
        Ok(())
    }

    #[test]
    fn heard() -> crate::Result<()> {
        let p = Packet::from_monitor("A>B:x")?;
        assert_eq!(p.heard(), AX25_SOURCE);
        let p = Packet::from_monitor("A>B,C*,D:x")?;
        assert_eq!(p.heard(), 2);
        Ok(())
    }

    #[test]
    fn insert_remove() -> crate::Result<()> {
        let mut p = Packet::from_monitor("A>B,WIDE2-2:x")?;
        p.insert_addr(2, "N0CALL-1")?;
        p.set_h(2, true)?;
        assert_eq!(p.to_monitor(), "A>B,N0CALL-1*,WIDE2-2:x");
        p.remove_addr(2)?;
        assert_eq!(p.to_monitor(), "A>B,WIDE2-2:x");
        // Can't grow past 10 addresses.
        let mut p = Packet::from_monitor("A>B,C,D,E,F,G,H,I,J:x")?;
        assert_eq!(p.num_addrs(), 10);
        assert!(p.insert_addr(2, "K").is_err());
        Ok(())
    }

    #[test]
    fn malformed_frames() {
        // Too short for two addresses.
        assert!(Packet::from_bytes(&[0u8; 13]).is_err());
        // No terminator within 10 addresses.
        assert!(Packet::from_bytes(&[0x40u8; 80]).is_err());
    }

    #[test]
    fn is_aprs() -> crate::Result<()> {
        assert!(Packet::from_monitor("A>B:x")?.is_aprs());
        let mut b = Packet::from_monitor("A>B:x")?.to_bytes();
        b[15] = 0xcc; // PID: IP
        assert!(!Packet::from_bytes(&b)?.is_aprs());
        Ok(())
    }

    #[test]
    fn frame_types() -> crate::Result<()> {
        let ui = Packet::from_monitor("A>B:x")?;
        assert_eq!(ui.frame_type(), FrameType::UI);
        // Hand-build an RR response: nr=3, pf set.
        let mut b = Packet::from_monitor("A>B:")?.to_bytes();
        b.truncate(14);
        b.push(0b0111_0001);
        let p = Packet::from_bytes(&b)?;
        assert_eq!(p.frame_type(), FrameType::RR { nr: 3, pf: true });
        assert_eq!(p.describe_type(), "(RR nr=3 p/f)");
        Ok(())
    }

    #[test]
    fn safe_print_escapes() {
        assert_eq!(safe_print(b"ok\x01"), "ok<0x01>");
    }
}

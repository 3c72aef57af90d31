/*! Configuration file handling.

JSON deserialized into plain structs, validated once at startup.
Anything malformed — unknown fields, uncompilable patterns, channel
indices out of range — is fatal before any thread starts. After
validation the configuration is published read-only behind an `Arc`
and nothing locks it again.
 */
use std::time::Duration;

use log::info;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digipeater::{DigiRule, Digipeater, Preempt};
use crate::modem::ModemConfig;
use crate::pfilter::Filter;
use crate::ptt::ControlLine;
use crate::xmit::XmitParams;
use crate::{Error, MAX_CHANS, Result};

/// What kind of thing a channel is attached to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    /// A real radio through the sound interface.
    #[default]
    Radio,
    /// A network TNC feeding frames in.
    Nettnc,
    /// The APRS-IS virtual channel.
    Aprsis,
    /// Configured but ignored.
    Disabled,
}

/// PTT wiring for one channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PttConfig {
    /// No hardware line (VOX or receive only).
    #[default]
    None,
    /// Shell command, gets `1` / `0` appended.
    Command {
        /// The command to run.
        command: String,
    },
    /// RTS or DTR on a serial device.
    Serial {
        /// Device path.
        device: String,
        /// Which handshake line.
        line: ControlLine,
        /// Active-low wiring.
        #[serde(default)]
        invert: bool,
    },
    /// CM108-family GPIO through hidraw.
    Cm108 {
        /// hidraw device path.
        device: String,
        /// GPIO pin, usually 3.
        #[serde(default = "default_gpio")]
        gpio: u8,
    },
}

fn default_gpio() -> u8 {
    3
}

/// One logical radio port.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// What the channel is attached to.
    pub medium: Medium,
    /// Station callsign used on this channel.
    pub mycall: String,
    /// Demodulator / modulator parameters.
    pub modem: ModemConfig,
    /// Transmit timing.
    pub xmit: XmitParams,
    /// PTT wiring.
    pub ptt: PttConfig,
}

/// One digipeat direction `(from, to)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DigiPairConfig {
    /// Receive channel.
    pub from: usize,
    /// Transmit channel.
    pub to: usize,
    /// Alias pattern, digipeated once on match.
    #[serde(default)]
    pub alias: Option<String>,
    /// WIDEn-N pattern, SSID-decremented on match.
    #[serde(default)]
    pub wide: Option<String>,
    /// Pre-emptive digipeating policy.
    #[serde(default)]
    pub preempt: Preempt,
    /// ATGP alias prefix; empty disables the hack.
    #[serde(default)]
    pub atgp: String,
    /// Filter expression gating this direction.
    #[serde(default)]
    pub filter: Option<String>,
    /// Also relay regenerated copies of everything.
    #[serde(default)]
    pub regen: bool,
    /// Connected-mode digipeating of non-APRS frames.
    #[serde(default)]
    pub cdigi: bool,
    /// Extra alias for the connected-mode pass.
    #[serde(default)]
    pub cdigi_alias: Option<String>,
}

/// KISS transports to offer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KissConfig {
    /// TCP listener port; `None` disables.
    pub tcp_port: Option<u16>,
    /// Serial device path.
    pub serial_device: Option<String>,
    /// Serial baud rate.
    pub serial_baud: u32,
    /// Create a pty and publish its slave path.
    pub pty: bool,
}

impl Default for KissConfig {
    fn default() -> Self {
        Self {
            tcp_port: Some(8001),
            serial_device: None,
            serial_baud: 9600,
            pty: false,
        }
    }
}

/// AGW network protocol server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgwConfig {
    /// TCP listener port; `None` disables.
    pub port: Option<u16>,
}

impl Default for AgwConfig {
    fn default() -> Self {
        Self { port: Some(8000) }
    }
}

/// APRS-IS uplink.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IgateConfig {
    /// Server hostname.
    pub server: String,
    /// Server port.
    #[serde(default = "default_igate_port")]
    pub port: u16,
    /// Login callsign.
    pub login: String,
    /// APRS-IS passcode, `-1` for receive only.
    pub passcode: i32,
    /// Server-side filter expression.
    #[serde(default)]
    pub filter: String,
    /// Virtual channel number carrying APRS-IS traffic.
    pub vchannel: Option<usize>,
}

fn default_igate_port() -> u16 {
    14580
}

/// The whole configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Channels in order; index is the channel number.
    pub channels: Vec<ChannelConfig>,
    /// Digipeat directions.
    pub digipeat: Vec<DigiPairConfig>,
    /// KISS host access.
    pub kiss: KissConfig,
    /// AGW host access.
    pub agw: AgwConfig,
    /// APRS-IS uplink, absent to disable.
    pub igate: Option<IgateConfig>,
    /// Digipeater duplicate suppression window, seconds.
    pub dedupe_seconds: u64,
    /// Transmit queue depth per priority class.
    pub tx_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channels: vec![ChannelConfig::default()],
            digipeat: Vec::new(),
            kiss: KissConfig::default(),
            agw: AgwConfig::default(),
            igate: None,
            dedupe_seconds: 30,
            tx_queue_depth: crate::tq::DEFAULT_DEPTH,
        }
    }
}

impl Config {
    /// Parse and validate a configuration file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("reading config {}", path.display()), e))?;
        let cfg: Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        info!(
            "configuration: {} channel(s), {} digipeat direction(s)",
            cfg.channels.len(),
            cfg.digipeat.len()
        );
        Ok(cfg)
    }

    /// Parse and validate from a string, for tests and `-n` overrides.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Config =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// All the fail-fast checks.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::Config("no channels configured".into()));
        }
        if self.channels.len() > MAX_CHANS {
            return Err(Error::Config(format!(
                "{} channels, maximum is {MAX_CHANS}",
                self.channels.len()
            )));
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if !ch.mycall.is_empty() {
                crate::ax25::Addr::parse(&ch.mycall)
                    .map_err(|e| Error::Config(format!("channel {i} mycall: {e}")))?;
            }
        }
        for d in &self.digipeat {
            if d.from >= self.channels.len() || d.to >= self.channels.len() {
                return Err(Error::Config(format!(
                    "digipeat {}->{} references unknown channel",
                    d.from, d.to
                )));
            }
            for ch in [d.from, d.to] {
                if self.channels[ch].mycall.is_empty() {
                    return Err(Error::Config(format!(
                        "digipeat {}->{}: channel {ch} has no mycall",
                        d.from, d.to
                    )));
                }
            }
            // Compile everything now so a typo can't surface mid-run.
            compile_pattern(&d.alias)?;
            compile_pattern(&d.wide)?;
            compile_pattern(&d.cdigi_alias)?;
            if let Some(f) = &d.filter {
                Filter::parse(f)?;
            }
        }
        if let Some(ig) = &self.igate {
            if ig.server.is_empty() || ig.login.is_empty() {
                return Err(Error::Config("igate needs server and login".into()));
            }
            if let Some(v) = ig.vchannel {
                if v >= self.channels.len() {
                    return Err(Error::Config(format!(
                        "igate vchannel {v} references unknown channel"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Instantiate the digipeater from the validated configuration.
    pub fn build_digipeater(&self) -> Result<Digipeater> {
        let mycall: Vec<String> = self.channels.iter().map(|c| c.mycall.clone()).collect();
        let mut digi = Digipeater::new(
            mycall,
            self.channels.len(),
            Duration::from_secs(self.dedupe_seconds),
        );
        for d in &self.digipeat {
            let rule = DigiRule {
                alias: compile_pattern(&d.alias)?,
                wide: compile_pattern(&d.wide)?,
                preempt: d.preempt,
                atgp: d.atgp.clone(),
                filter: d.filter.as_deref().map(Filter::parse).transpose()?,
                regen: d.regen,
                cdigi: d.cdigi,
                cdigi_alias: compile_pattern(&d.cdigi_alias)?,
            };
            digi.add_rule(d.from, d.to, rule)?;
        }
        Ok(digi)
    }
}

fn compile_pattern(p: &Option<String>) -> Result<Option<Regex>> {
    p.as_deref()
        .map(|s| Regex::new(s).map_err(|e| Error::Config(format!("bad pattern {s:?}: {e}"))))
        .transpose()
}

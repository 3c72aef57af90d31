/*! APRS digipeater rule engine.

Decides, for every enabled `(from_chan, to_chan)` pair, whether a
received packet should be retransmitted and with what path rewrite:
explicit use of our call, alias match, pre-emptive digipeating, and
the WIDEn-N decrement convention.

Two passes: same-channel matches go to the high priority queue so all
digipeaters in earshot transmit simultaneously ("fratricide" — the
APRS convention for clearing the channel in one packet time), then
cross-channel matches at low priority.

Also here: `digi_regen`, which relays a bit-regenerated copy with no
path rewrite, and the reduced connected-mode pass for non-APRS frames.
 */
use std::collections::HashMap;
use std::time::Duration;

use log::{error, info, warn};
use regex::Regex;

use crate::ax25::{AX25_REPEATER_1, AX25_SOURCE, Packet};
use crate::dedupe::Dedupe;
use crate::pfilter::Filter;
use crate::tq::Prio;
use crate::{Error, Result};

/// Pre-emptive digipeating policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preempt {
    /// Only the first unused hop is considered.
    #[default]
    Off,
    /// Remove every hop before ours, used or not. Deprecated, kept at
    /// parity with existing configs.
    Drop,
    /// Mark the skipped hops as used. Deprecated likewise.
    Mark,
    /// Remove only the skipped *unused* hops, preserving the packet's
    /// actual journey.
    Trace,
}

/// Behaviour for one `(from_chan, to_chan)` direction.
#[derive(Debug, Default)]
pub struct DigiRule {
    /// Aliases we answer to, replaced by our call when matched.
    pub alias: Option<Regex>,
    /// The WIDEn-N style patterns subject to SSID decrement.
    pub wide: Option<Regex>,
    /// Pre-emptive digipeating policy.
    pub preempt: Preempt,
    /// ATGP alias prefix. Non-empty enables the ATGP path-shortening
    /// behaviour on matching hops.
    pub atgp: String,
    /// Optional filter gating this direction.
    pub filter: Option<Filter>,
    /// Relay a regenerated copy of everything received.
    pub regen: bool,
    /// Connected-mode digipeating for non-APRS frames.
    pub cdigi: bool,
    /// Extra alias accepted by the connected-mode pass.
    pub cdigi_alias: Option<Regex>,
}

/// A packet the engine wants transmitted.
#[derive(Debug)]
pub struct Emission {
    /// Destination channel.
    pub to_chan: usize,
    /// Queue class.
    pub prio: Prio,
    /// The rewritten packet (always a fresh copy).
    pub packet: Packet,
}

/// The digipeater for all channel pairs of one direction worker.
pub struct Digipeater {
    mycall: Vec<String>,
    rules: HashMap<(usize, usize), DigiRule>,
    dedupe: Vec<Dedupe>,
    counts: HashMap<(usize, usize), u64>,
}

// Match an address against a compiled pattern, trying the full
// CALL-SSID form first and the bare callsign second, so both
// `^WIDE[1-7]$` and `^WIDE2-2$` styles behave as expected.
fn re_match(re: &Option<Regex>, addr: &str) -> bool {
    let Some(re) = re else {
        return false;
    };
    if re.is_match(addr) {
        return true;
    }
    match addr.split_once('-') {
        Some((base, _)) => re.is_match(base),
        None => false,
    }
}

impl Digipeater {
    /// New engine. `mycall[chan]` is the station callsign used on that
    /// channel for both matching and path rewriting.
    #[must_use]
    pub fn new(mycall: Vec<String>, num_chans: usize, dedupe_ttl: Duration) -> Self {
        Self {
            mycall,
            rules: HashMap::new(),
            dedupe: (0..num_chans).map(|_| Dedupe::new(dedupe_ttl)).collect(),
            counts: HashMap::new(),
        }
    }

    /// Enable a direction with the given rule.
    pub fn add_rule(&mut self, from_chan: usize, to_chan: usize, rule: DigiRule) -> Result<()> {
        if from_chan >= self.dedupe.len() || to_chan >= self.dedupe.len() {
            return Err(Error::Config(format!(
                "digipeat {from_chan}->{to_chan} out of channel range"
            )));
        }
        if rule.preempt == Preempt::Drop || rule.preempt == Preempt::Mark {
            error!(
                "The digipeat DROP and MARK options will be removed in a future release. \
                 Use TRACE for preemptive digipeating."
            );
        }
        self.rules.insert((from_chan, to_chan), rule);
        Ok(())
    }

    /// Packets digipeated for a direction so far.
    #[must_use]
    pub fn count(&self, from_chan: usize, to_chan: usize) -> u64 {
        self.counts.get(&(from_chan, to_chan)).copied().unwrap_or(0)
    }

    fn mycall(&self, chan: usize) -> &str {
        self.mycall.get(chan).map(String::as_str).unwrap_or("")
    }

    /// Run the rules for a received packet. Same-channel pass first
    /// (high priority), then cross-channel (low priority).
    pub fn digipeat(&mut self, from_chan: usize, p: &Packet) -> Vec<Emission> {
        let mut out = Vec::new();
        let mut dirs: Vec<usize> = self
            .rules
            .keys()
            .filter(|&&(f, _)| f == from_chan)
            .map(|&(_, t)| t)
            .collect();
        dirs.sort_unstable();
        for same in [true, false] {
            for &to_chan in &dirs {
                if (to_chan == from_chan) != same {
                    continue;
                }
                if let Some(result) = self.digipeat_match(from_chan, to_chan, p) {
                    self.dedupe[to_chan].remember(&result);
                    *self.counts.entry((from_chan, to_chan)).or_default() += 1;
                    out.push(Emission {
                        to_chan,
                        prio: if same { Prio::Hi } else { Prio::Lo },
                        packet: result,
                    });
                }
            }
        }
        out
    }

    fn digipeat_match(&mut self, from_chan: usize, to_chan: usize, p: &Packet) -> Option<Packet> {
        let rule = self.rules.get(&(from_chan, to_chan))?;
        if let Some(f) = &rule.filter {
            if !f.matches(p) {
                return None;
            }
        }

        // Find the first repeater station which doesn't have "has
        // been repeated" set.
        let r = p.first_not_repeated()?;
        let repeater = p.get_addr(r).ok()?;
        let ssid = p.get_ssid(r).ok()?;
        let mycall_rec = self.mycall(from_chan).to_string();
        let mycall_xmit = self.mycall(to_chan).to_string();

        // Never digipeat our own transmissions.
        let source = p.get_addr(AX25_SOURCE).ok()?;
        if source == mycall_rec {
            return None;
        }

        // Explicit use of my call, including SSID. Someone might
        // specify a particular path for testing; this skips the
        // duplicate check, so a constructed loop is possible, and
        // intended.
        if repeater == mycall_rec {
            let mut result = p.dup();
            result.set_addr(r, &mycall_xmit).ok()?;
            result.set_h(r, true).ok()?;
            return Some(result);
        }

        // Avoid retransmitting redundant information. Source,
        // destination and info only; not the via path.
        if self.dedupe[to_chan].check(p) {
            info!("Digipeater: drop redundant packet to channel {to_chan}");
            return None;
        }

        let rule = self.rules.get(&(from_chan, to_chan))?;

        // Alias: unconditionally digipeat once, replacing with my call.
        if re_match(&rule.alias, &repeater) {
            let mut result = p.dup();
            result.set_addr(r, &mycall_xmit).ok()?;
            result.set_h(r, true).ok()?;
            return Some(result);
        }

        // Pre-emptive: my call or an alias further down the path.
        if rule.preempt != Preempt::Off {
            for r2 in r + 1..p.num_addrs() {
                let addr2 = p.get_addr(r2).ok()?;
                if addr2 == mycall_rec || re_match(&rule.alias, &addr2) {
                    let mut result = p.dup();
                    result.set_addr(r2, &mycall_xmit).ok()?;
                    result.set_h(r2, true).ok()?;
                    let mut r2 = r2;
                    match rule.preempt {
                        Preempt::Drop => {
                            while r2 > AX25_REPEATER_1 {
                                result.remove_addr(r2 - 1).ok()?;
                                r2 -= 1;
                            }
                        }
                        Preempt::Mark => {
                            let mut i = r2 - 1;
                            while i >= AX25_REPEATER_1 && !result.get_h(i).unwrap_or(true) {
                                result.set_h(i, true).ok()?;
                                i -= 1;
                            }
                        }
                        _ => {
                            // Trace: remove prior unused hops so the
                            // path records the journey actually taken.
                            while r2 > AX25_REPEATER_1 && !result.get_h(r2 - 1).unwrap_or(true) {
                                result.remove_addr(r2 - 1).ok()?;
                                r2 -= 1;
                            }
                        }
                    }
                    return Some(result);
                }
            }
        }

        // WIDEn-N: check the SSID and decrement.
        if re_match(&rule.wide, &repeater) {
            // ATGP hack: keep the via path from growing past 8 hops.
            // The used-up digipeater is left in place, to be removed
            // by the next digipeater down the line.
            if !rule.atgp.is_empty()
                && repeater.len() >= rule.atgp.len()
                && repeater[..rule.atgp.len()].eq_ignore_ascii_case(&rule.atgp)
                && (1..=7).contains(&ssid)
            {
                let mut result = p.dup();
                let mut r = r;
                while result.num_addrs() >= 3 && result.get_h(AX25_REPEATER_1).unwrap_or(false) {
                    result.remove_addr(AX25_REPEATER_1).ok()?;
                    r -= 1;
                }
                let ssid = ssid - 1;
                result.set_ssid(r, ssid).ok()?;
                if ssid == 0 {
                    result.set_h(r, true).ok()?;
                }
                result.insert_addr(AX25_REPEATER_1, &mycall_xmit).ok()?;
                result.set_h(AX25_REPEATER_1, true).ok()?;
                return Some(result);
            }

            if ssid == 1 {
                let mut result = p.dup();
                result.set_addr(r, &mycall_xmit).ok()?;
                result.set_h(r, true).ok()?;
                return Some(result);
            }

            if (2..=7).contains(&ssid) {
                let mut result = p.dup();
                // Decrement and leave unused; insert my call ahead for
                // tracing when there's room.
                result.set_ssid(r, ssid - 1).ok()?;
                if p.num_repeaters() < crate::ax25::AX25_MAX_REPEATERS {
                    result.insert_addr(r, &mycall_xmit).ok()?;
                    result.set_h(r, true).ok()?;
                }
                return Some(result);
            }
        }

        None
    }

    /// Relay regenerated copies, no path rewrite, no dedupe. Applies
    /// to all frame types.
    pub fn digi_regen(&mut self, from_chan: usize, p: &Packet) -> Vec<Emission> {
        let mut out = Vec::new();
        let mut dirs: Vec<usize> = self
            .rules
            .iter()
            .filter(|&(&(f, _), ref rule)| f == from_chan && rule.regen)
            .map(|(&(_, t), _)| t)
            .collect();
        dirs.sort_unstable();
        for to_chan in dirs {
            out.push(Emission {
                to_chan,
                prio: Prio::Lo,
                packet: p.dup(),
            });
        }
        out
    }

    /// Connected-mode pass for non-APRS frames: only our own call (or
    /// the cdigi alias) as the next hop, no WIDEn-N semantics, no
    /// dedupe. Connected mode has its own retries.
    pub fn cdigipeat(&mut self, from_chan: usize, p: &Packet) -> Vec<Emission> {
        if p.is_aprs() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut dirs: Vec<usize> = self
            .rules
            .iter()
            .filter(|&(&(f, _), ref rule)| f == from_chan && rule.cdigi)
            .map(|(&(_, t), _)| t)
            .collect();
        dirs.sort_unstable();
        for to_chan in dirs {
            let Some(r) = p.first_not_repeated() else {
                continue;
            };
            let Ok(repeater) = p.get_addr(r) else {
                continue;
            };
            let mycall_rec = self.mycall(from_chan).to_string();
            let rule = &self.rules[&(from_chan, to_chan)];
            if repeater != mycall_rec && !re_match(&rule.cdigi_alias, &repeater) {
                continue;
            }
            let mycall_xmit = self.mycall(to_chan).to_string();
            let mut result = p.dup();
            if result.set_addr(r, &mycall_xmit).is_err() || result.set_h(r, true).is_err() {
                warn!("cdigipeat: path rewrite failed");
                continue;
            }
            *self.counts.entry((from_chan, to_chan)).or_default() += 1;
            out.push(Emission {
                to_chan,
                prio: Prio::Hi,
                packet: result,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(mon: &str) -> Packet {
        Packet::from_monitor(mon).unwrap()
    }

    fn wide_rule() -> DigiRule {
        DigiRule {
            wide: Some(Regex::new(r"^WIDE[1-7]$").unwrap()),
            ..DigiRule::default()
        }
    }

    fn engine() -> Digipeater {
        let mut d = Digipeater::new(
            vec!["N0CALL-1".into(), "N0CALL-2".into()],
            2,
            Duration::from_secs(30),
        );
        d.add_rule(0, 0, wide_rule()).unwrap();
        d
    }

    fn mons(out: &[Emission]) -> Vec<(usize, Prio, String)> {
        out.iter()
            .map(|e| (e.to_chan, e.prio, e.packet.to_monitor()))
            .collect()
    }

    #[test]
    fn wide1_replaced_and_marked() {
        let mut d = engine();
        let out = d.digipeat(0, &pkt("A>B,WIDE1-1:hi"));
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,N0CALL-1*:hi".to_string())]
        );
        assert_eq!(d.count(0, 0), 1);
    }

    #[test]
    fn wide2_decrement_with_trace() {
        let mut d = engine();
        let out = d.digipeat(0, &pkt("A>B,WIDE2-2:hi"));
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,N0CALL-1*,WIDE2-1:hi".to_string())]
        );
    }

    #[test]
    fn wide_exhausted_skipped() {
        let mut d = engine();
        assert!(d.digipeat(0, &pkt("A>B,WIDE2:hi")).is_empty());
    }

    #[test]
    fn no_insert_when_path_full() {
        let mut d = engine();
        // Eight repeaters, the last one the pivot: no room to trace.
        let out = d.digipeat(0, &pkt("A>B,C*,D*,E*,F*,G*,H*,I*,WIDE3-3:hi"));
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,C,D,E,F,G,H,I*,WIDE3-2:hi".to_string())]
        );
    }

    #[test]
    fn source_guard() {
        let mut d = engine();
        assert!(d.digipeat(0, &pkt("N0CALL-1>B,WIDE1-1:hi")).is_empty());
    }

    #[test]
    fn explicit_mycall_bypasses_dedupe() {
        let mut d = engine();
        let p = pkt("A>B,N0CALL-1:test path");
        assert_eq!(
            mons(&d.digipeat(0, &p)),
            [(0, Prio::Hi, "A>B,N0CALL-1*:test path".to_string())]
        );
        // Again, immediately: still emitted.
        assert_eq!(d.digipeat(0, &p).len(), 1);
    }

    #[test]
    fn dedupe_window() {
        let mut d = engine();
        let p = pkt("A>B,WIDE1-1:hi");
        assert_eq!(d.digipeat(0, &p).len(), 1);
        // Identical (src, dst, info) again within the TTL, even with a
        // different path.
        assert!(d.digipeat(0, &p).is_empty());
        assert!(d.digipeat(0, &pkt("A>B,WIDE2-2:hi")).is_empty());
        // Different info sails through.
        assert_eq!(d.digipeat(0, &pkt("A>B,WIDE1-1:other")).len(), 1);
    }

    #[test]
    fn alias_match() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                alias: Some(Regex::new(r"^(TEMP|RELAY)$").unwrap()),
                ..wide_rule()
            },
        )
        .unwrap();
        let out = d.digipeat(0, &pkt("A>B,RELAY:hi"));
        assert_eq!(mons(&out), [(0, Prio::Hi, "A>B,N0CALL-1*:hi".to_string())]);
    }

    #[test]
    fn preempt_trace() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                alias: Some(Regex::new(r"^N0CALL(-\d+)?$").unwrap()),
                preempt: Preempt::Trace,
                ..wide_rule()
            },
        )
        .unwrap();
        let out = d.digipeat(0, &pkt("A>B,FOO,BAR,N0CALL,WIDE1-1:hi"));
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,N0CALL-1*,WIDE1-1:hi".to_string())]
        );
    }

    #[test]
    fn preempt_trace_keeps_used_hops() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                alias: Some(Regex::new(r"^N0CALL(-\d+)?$").unwrap()),
                preempt: Preempt::Trace,
                ..wide_rule()
            },
        )
        .unwrap();
        let out = d.digipeat(0, &pkt("A>B,USED*,FOO,N0CALL:hi"));
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,USED,N0CALL-1*:hi".to_string())]
        );
    }

    #[test]
    fn preempt_drop_removes_all_prior() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                alias: Some(Regex::new(r"^N0CALL(-\d+)?$").unwrap()),
                preempt: Preempt::Drop,
                ..wide_rule()
            },
        )
        .unwrap();
        let out = d.digipeat(0, &pkt("A>B,USED*,FOO,N0CALL,WIDE1-1:hi"));
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,N0CALL-1*,WIDE1-1:hi".to_string())]
        );
    }

    #[test]
    fn preempt_mark_sets_h_on_prior() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                alias: Some(Regex::new(r"^N0CALL(-\d+)?$").unwrap()),
                preempt: Preempt::Mark,
                ..wide_rule()
            },
        )
        .unwrap();
        let out = d.digipeat(0, &pkt("A>B,FOO,BAR,N0CALL:hi"));
        // FOO and BAR marked used, our call too; single star on the
        // last used hop.
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,FOO,BAR,N0CALL-1*:hi".to_string())]
        );
        let p = &out[0].packet;
        assert!(p.get_h(2).unwrap() && p.get_h(3).unwrap() && p.get_h(4).unwrap());
    }

    #[test]
    fn atgp_strips_used_and_prepends() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                atgp: "HOP".into(),
                wide: Some(Regex::new(r"^HOP[1-7]$").unwrap()),
                ..DigiRule::default()
            },
        )
        .unwrap();
        let out = d.digipeat(0, &pkt("A>B,OLD*,HOP7-3:hi"));
        // Used hop stripped, SSID decremented, our call in front. The
        // used-up HOP stays for the next digi to remove.
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,N0CALL-1*,HOP7-2:hi".to_string())]
        );
    }

    #[test]
    fn atgp_final_hop_marked_used() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                atgp: "HOP".into(),
                wide: Some(Regex::new(r"^HOP[1-7]$").unwrap()),
                ..DigiRule::default()
            },
        )
        .unwrap();
        let out = d.digipeat(0, &pkt("A>B,HOP7-1:hi"));
        // Both hops carry H; the monitor star lands on the last one.
        assert_eq!(
            mons(&out),
            [(0, Prio::Hi, "A>B,N0CALL-1,HOP7*:hi".to_string())]
        );
        let p = &out[0].packet;
        assert!(p.get_h(2).unwrap() && p.get_h(3).unwrap());
    }

    #[test]
    fn cross_channel_low_priority() {
        let mut d = engine();
        d.add_rule(0, 1, wide_rule()).unwrap();
        let out = d.digipeat(0, &pkt("A>B,WIDE1-1:hi"));
        assert_eq!(
            mons(&out),
            [
                (0, Prio::Hi, "A>B,N0CALL-1*:hi".to_string()),
                (1, Prio::Lo, "A>B,N0CALL-2*:hi".to_string()),
            ]
        );
    }

    #[test]
    fn filter_gates_direction() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                filter: Some(Filter::parse("t/s").unwrap()),
                ..wide_rule()
            },
        )
        .unwrap();
        assert_eq!(d.digipeat(0, &pkt("A>B,WIDE1-1:>status")).len(), 1);
        assert!(d.digipeat(0, &pkt("A>B,WIDE1-1:!pos")).is_empty());
    }

    #[test]
    fn regen_copies_everything() {
        let mut d = engine();
        d.add_rule(
            0,
            1,
            DigiRule {
                regen: true,
                ..DigiRule::default()
            },
        )
        .unwrap();
        let p = pkt("A>B:anything at all");
        let out = d.digi_regen(0, &p);
        assert_eq!(
            mons(&out),
            [(1, Prio::Lo, "A>B:anything at all".to_string())]
        );
        // Twice in a row: no dedupe on regen.
        assert_eq!(d.digi_regen(0, &p).len(), 1);
    }

    #[test]
    fn cdigi_only_non_aprs_explicit_call() {
        let mut d = engine();
        d.add_rule(
            0,
            0,
            DigiRule {
                cdigi: true,
                ..DigiRule::default()
            },
        )
        .unwrap();
        // UI/0xF0 is APRS: not handled by the connected-mode pass.
        assert!(d.cdigipeat(0, &pkt("A>B,N0CALL-1:x")).is_empty());
        // An S-frame through our call is.
        let mut bytes = pkt("A>B,N0CALL-1:").to_bytes();
        bytes.truncate(21);
        // Fix the address extension bit on the last address and
        // append an RR control octet.
        bytes[20] |= 1;
        bytes.push(0x01);
        let p = Packet::from_bytes(&bytes).unwrap();
        let out = d.cdigipeat(0, &p);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].prio, Prio::Hi);
        assert!(out[0].packet.get_h(2).unwrap());
    }
}

/*! Stations heard.

In-memory list of who we've heard, per channel, with decode counts
and the last known position. Purely informational; the dispatch hub
updates it and the operator can dump it.
 */
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::aprs::AprsInfo;

/// One station's record.
#[derive(Clone, Debug)]
pub struct Heard {
    /// Channel we last heard it on.
    pub chan: usize,
    /// Frames decoded from it.
    pub count: u64,
    /// When we last heard it.
    pub last_heard: Instant,
    /// Last known position, if any packet carried one.
    pub lat: Option<f64>,
    /// See `lat`.
    pub lon: Option<f64>,
}

/// The heard-station list.
#[derive(Default)]
pub struct MheardList {
    stations: HashMap<String, Heard>,
}

/// Entries older than this fall off the list.
const KEEP: Duration = Duration::from_secs(3600 * 6);

impl MheardList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decode of `call` on `chan`, with whatever the APRS
    /// decoder found.
    pub fn save(&mut self, chan: usize, call: &str, aprs: Option<&AprsInfo>) {
        let now = Instant::now();
        let e = self.stations.entry(call.to_string()).or_insert(Heard {
            chan,
            count: 0,
            last_heard: now,
            lat: None,
            lon: None,
        });
        e.chan = chan;
        e.count += 1;
        e.last_heard = now;
        if let Some(a) = aprs {
            if a.lat.is_some() {
                e.lat = a.lat;
                e.lon = a.lon;
            }
        }
        self.stations
            .retain(|_, e| now.duration_since(e.last_heard) < KEEP);
    }

    /// Look up one station.
    #[must_use]
    pub fn get(&self, call: &str) -> Option<&Heard> {
        self.stations.get(call)
    }

    /// All stations, most recently heard first.
    #[must_use]
    pub fn list(&self) -> Vec<(&str, &Heard)> {
        let mut v: Vec<_> = self
            .stations
            .iter()
            .map(|(k, e)| (k.as_str(), e))
            .collect();
        v.sort_by(|a, b| b.1.last_heard.cmp(&a.1.last_heard));
        v
    }

    /// Number of stations currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// Anything on the list?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

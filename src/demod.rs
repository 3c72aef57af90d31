/*! AFSK demodulator.

A windowed correlator measures mark and space energy over roughly one
bit time; one or more slicers turn the difference into bit decisions at
different mark/space balance points; a wrapping-counter PLL per slicer
picks the sampling instant and hands NRZI-decoded data bits downstream.

The PLL follows the usual software-TNC recipe: a 32-bit counter
advances by `2^32 * baud / sample_rate` per sample and a bit is taken
each time it wraps. Every observed transition pulls the counter toward
zero, harder while still hunting for a frame than while locked onto
one, which is the "inertia" feedback the frame detectors provide.
 */
use crate::modem::ModemConfig;
use crate::nrzi::NrziDecode;

const PLL_LOCKED_INERTIA: f32 = 0.73;
const PLL_SEARCHING_INERTIA: f32 = 0.64;

/// Window length multipliers for the alternative demodulators of one
/// channel. Sub-channel 0 is the nominal one-bit window; the others
/// trade bandwidth against noise differently.
const SUBCHAN_WINDOW: &[f64] = &[1.0, 0.75, 1.25, 0.6, 1.5, 0.9, 1.1, 0.8, 1.4];

struct Pll {
    counter: i32,
    step: i32,
    prev_tone: u8,
    nrzi: NrziDecode,
}

impl Pll {
    fn new(sample_rate: u32, baud: u32) -> Self {
        Self {
            counter: 0,
            step: (4294967296.0 * baud as f64 / sample_rate as f64) as i64 as i32,
            prev_tone: 0,
            nrzi: NrziDecode::new(),
        }
    }

    /// Advance one sample with the current tone decision. Returns a
    /// data bit at the sampling instant.
    fn advance(&mut self, tone: u8, locked: bool) -> Option<u8> {
        let prev = self.counter;
        self.counter = self.counter.wrapping_add(self.step);
        let mut out = None;
        if self.counter < 0 && prev >= 0 {
            out = Some(self.nrzi.next(tone));
        }
        if tone != self.prev_tone {
            let inertia = if locked {
                PLL_LOCKED_INERTIA
            } else {
                PLL_SEARCHING_INERTIA
            };
            self.counter = (self.counter as f32 * inertia) as i32;
        }
        self.prev_tone = tone;
        out
    }
}

/// One demodulator (sub-channel) with its slicer bank.
pub struct AfskDemod {
    ring: Vec<f32>,
    idx: usize,
    mark_cos: Vec<f32>,
    mark_sin: Vec<f32>,
    space_cos: Vec<f32>,
    space_sin: Vec<f32>,
    alphas: Vec<f32>,
    plls: Vec<Pll>,
}

impl AfskDemod {
    /// Build the demodulator for one sub-channel profile.
    #[must_use]
    pub fn new(cfg: &ModemConfig, subchan: usize) -> Self {
        let rate = cfg.sample_rate as f64;
        let mult = SUBCHAN_WINDOW[subchan % SUBCHAN_WINDOW.len()];
        let len = ((rate / cfg.baud as f64) * mult).round().max(4.0) as usize;
        let wm = 2.0 * std::f64::consts::PI * cfg.mark_freq as f64 / rate;
        let ws = 2.0 * std::f64::consts::PI * cfg.space_freq as f64 / rate;
        let table = |w: f64, f: fn(f64) -> f64| -> Vec<f32> {
            (0..len).map(|j| f(w * j as f64) as f32).collect()
        };
        let n = cfg.num_slicers.clamp(1, crate::MAX_SLICERS);
        // Slicer decision points spread geometrically around balance.
        let alphas = (0..n)
            .map(|i| {
                if n == 1 {
                    1.0
                } else {
                    let x = (i as f32 / (n - 1) as f32) * 2.0 - 1.0;
                    2f32.powf(x)
                }
            })
            .collect();
        Self {
            ring: vec![0.0; len],
            idx: 0,
            mark_cos: table(wm, f64::cos),
            mark_sin: table(wm, f64::sin),
            space_cos: table(ws, f64::cos),
            space_sin: table(ws, f64::sin),
            alphas,
            plls: (0..n).map(|_| Pll::new(cfg.sample_rate, cfg.baud)).collect(),
        }
    }

    /// Number of slicers in this demodulator.
    #[must_use]
    pub fn num_slicers(&self) -> usize {
        self.alphas.len()
    }

    /// Push one audio sample. `locked[slice]` is the frame detector's
    /// carrier-detect feedback. Emits `(slice, data_bit)` through the
    /// callback for each slicer whose PLL sampled this instant.
    pub fn process_sample(
        &mut self,
        sample: f32,
        locked: &[bool],
        mut sink: impl FnMut(usize, u8),
    ) {
        let len = self.ring.len();
        self.ring[self.idx] = sample;
        self.idx = (self.idx + 1) % len;
        let mut mi = 0.0f32;
        let mut mq = 0.0f32;
        let mut si = 0.0f32;
        let mut sq = 0.0f32;
        for j in 0..len {
            let x = self.ring[(self.idx + len - 1 - j) % len];
            mi += x * self.mark_cos[j];
            mq += x * self.mark_sin[j];
            si += x * self.space_cos[j];
            sq += x * self.space_sin[j];
        }
        let mark = mi * mi + mq * mq;
        let space = si * si + sq * sq;
        for (slice, (&alpha, pll)) in self.alphas.iter().zip(&mut self.plls).enumerate() {
            let tone = if mark > alpha * space { 1 } else { 0 };
            if let Some(bit) = pll.advance(tone, locked.get(slice).copied().unwrap_or(false)) {
                sink(slice, bit);
            }
        }
    }
}

/*! Audio endpoints.

The TNC core consumes and produces signed 16-bit PCM through the two
small traits here. Platform capture (ALSA, sndio, an SDR pipeline)
lives outside this crate; what ships here is what the core and the
tests need: WAV files (see [`crate::wav`]), in-memory vectors, and a
null sink.
 */
use std::sync::{Arc, Mutex};

use crate::Result;

/// Something that produces PCM samples. Interleaved when stereo.
pub trait AudioSource: Send {
    /// Fill `buf`, returning how many samples were produced. Zero
    /// means end of stream.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;

    /// Samples per second, per channel.
    fn sample_rate(&self) -> u32;

    /// 1 for mono, 2 for stereo.
    fn channels(&self) -> u16;
}

/// Something that consumes PCM samples.
pub trait AudioSink: Send {
    /// Write samples, blocking as needed.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Push any buffered samples out to the device.
    fn flush(&mut self) -> Result<()>;
}

/// In-memory source, mostly for tests and loopback.
pub struct VecSource {
    samples: Vec<i16>,
    pos: usize,
    sample_rate: u32,
    channels: u16,
}

impl VecSource {
    /// Wrap a sample vector.
    #[must_use]
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            pos: 0,
            sample_rate,
            channels,
        }
    }
}

impl AudioSource for VecSource {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let n = buf.len().min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// In-memory sink that several owners can inspect, for tests.
#[derive(Clone, Default)]
pub struct VecSink {
    buf: Arc<Mutex<Vec<i16>>>,
}

impl VecSink {
    /// New empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.buf.lock().expect("poisoned").clone()
    }
}

impl AudioSink for VecSink {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.buf.lock().expect("poisoned").extend_from_slice(samples);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Swallows everything. For transmit-disabled channels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[i16]) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_source_drains() -> Result<()> {
        let mut s = VecSource::new(vec![1, 2, 3, 4, 5], 44100, 1);
        let mut buf = [0i16; 3];
        assert_eq!(s.read(&mut buf)?, 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(s.read(&mut buf)?, 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(s.read(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn vec_sink_accumulates() -> Result<()> {
        let sink = VecSink::new();
        let mut w = sink.clone();
        w.write(&[7, 8])?;
        w.write(&[9])?;
        assert_eq!(sink.samples(), vec![7, 8, 9]);
        Ok(())
    }
}

/*! WAV file input and output.

Canonical 44-byte RIFF/WAVE/fmt/data layout on write; on read the
chunk iterator tolerates LIST metadata (and any other chunk) sitting
between `fmt ` and `data`, which recorders love to insert. 8-bit
unsigned and 16-bit signed LPCM, mono or two-channel interleaved.
 */
use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;

use crate::audio::{AudioSink, AudioSource};
use crate::{Error, Result};

fn io_err(what: &str, e: std::io::Error) -> Error {
    Error::Io(what.to_string(), e)
}

/// WAV reader over any byte stream.
pub struct WavReader<R: Read> {
    inner: R,
    sample_rate: u32,
    channels: u16,
    bits: u16,
    /// Bytes of sample data still unread.
    remaining: u64,
}

impl<R: Read + Send> WavReader<R> {
    /// Parse the header, leaving the stream at the first sample.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut riff = [0u8; 12];
        inner
            .read_exact(&mut riff)
            .map_err(|e| io_err("reading RIFF header", e))?;
        if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
            return Err(Error::Config("not a RIFF/WAVE file".into()));
        }
        let mut fmt: Option<(u16, u16, u32, u16)> = None;
        loop {
            let mut ch = [0u8; 8];
            inner
                .read_exact(&mut ch)
                .map_err(|e| io_err("reading chunk header", e))?;
            let id = [ch[0], ch[1], ch[2], ch[3]];
            let len = u32::from_le_bytes([ch[4], ch[5], ch[6], ch[7]]) as u64;
            match &id {
                b"fmt " => {
                    if len < 16 {
                        return Err(Error::Config("fmt chunk too short".into()));
                    }
                    let mut f = [0u8; 16];
                    inner
                        .read_exact(&mut f)
                        .map_err(|e| io_err("reading fmt chunk", e))?;
                    let format = u16::from_le_bytes([f[0], f[1]]);
                    let channels = u16::from_le_bytes([f[2], f[3]]);
                    let rate = u32::from_le_bytes([f[4], f[5], f[6], f[7]]);
                    let bits = u16::from_le_bytes([f[14], f[15]]);
                    if format != 1 {
                        return Err(Error::Config(format!("unsupported WAV format {format}")));
                    }
                    if !matches!(bits, 8 | 16) {
                        return Err(Error::Config(format!("unsupported sample size {bits}")));
                    }
                    if !matches!(channels, 1 | 2) {
                        return Err(Error::Config(format!("unsupported channel count {channels}")));
                    }
                    skip(&mut inner, len - 16)?;
                    fmt = Some((format, channels, rate, bits));
                }
                b"data" => {
                    let (_, channels, rate, bits) =
                        fmt.ok_or_else(|| Error::Config("data chunk before fmt".into()))?;
                    return Ok(Self {
                        inner,
                        sample_rate: rate,
                        channels,
                        bits,
                        remaining: len,
                    });
                }
                other => {
                    // LIST and friends. Chunks are word aligned.
                    debug!(
                        "WavReader: skipping {} chunk of {len} bytes",
                        String::from_utf8_lossy(other)
                    );
                    skip(&mut inner, len + (len & 1))?;
                }
            }
        }
    }
}

fn skip<R: Read>(inner: &mut R, mut n: u64) -> Result<()> {
    let mut buf = [0u8; 512];
    while n > 0 {
        let want = (n as usize).min(buf.len());
        inner
            .read_exact(&mut buf[..want])
            .map_err(|e| io_err("skipping chunk", e))?;
        n -= want as u64;
    }
    Ok(())
}

impl<R: Read + Send> AudioSource for WavReader<R> {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let bytes_per = self.bits as u64 / 8;
        let want = (buf.len() as u64).min(self.remaining / bytes_per) as usize;
        if want == 0 {
            return Ok(0);
        }
        match self.bits {
            8 => {
                let mut raw = vec![0u8; want];
                self.inner
                    .read_exact(&mut raw)
                    .map_err(|e| io_err("reading samples", e))?;
                for (o, &b) in buf.iter_mut().zip(&raw) {
                    *o = ((b as i16) - 128) << 8;
                }
            }
            _ => {
                let mut raw = vec![0u8; want * 2];
                self.inner
                    .read_exact(&mut raw)
                    .map_err(|e| io_err("reading samples", e))?;
                for (o, c) in buf.iter_mut().zip(raw.chunks_exact(2)) {
                    *o = i16::from_le_bytes([c[0], c[1]]);
                }
            }
        }
        self.remaining -= want as u64 * bytes_per;
        Ok(want)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// WAV writer producing the canonical 44-byte header, 16-bit samples.
///
/// The header is written with placeholder sizes and patched on
/// [`WavWriter::finalize`].
pub struct WavWriter<W: Write + Seek> {
    inner: W,
    data_bytes: u32,
}

impl<W: Write + Seek + Send> WavWriter<W> {
    /// Write the header and get ready for samples.
    pub fn new(mut inner: W, sample_rate: u32, channels: u16) -> Result<Self> {
        let mut h = Vec::with_capacity(44);
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&0u32.to_le_bytes()); // patched later
        h.extend_from_slice(b"WAVE");
        h.extend_from_slice(b"fmt ");
        h.extend_from_slice(&16u32.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes()); // PCM
        h.extend_from_slice(&channels.to_le_bytes());
        h.extend_from_slice(&sample_rate.to_le_bytes());
        h.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        h.extend_from_slice(&(channels * 2).to_le_bytes());
        h.extend_from_slice(&16u16.to_le_bytes());
        h.extend_from_slice(b"data");
        h.extend_from_slice(&0u32.to_le_bytes()); // patched later
        inner
            .write_all(&h)
            .map_err(|e| io_err("writing WAV header", e))?;
        Ok(Self {
            inner,
            data_bytes: 0,
        })
    }

    // Sizes in the header are patched on every flush, so the file is
    // intact even if the process dies mid-stream.
    fn patch_sizes(&mut self) -> Result<()> {
        self.inner
            .seek(SeekFrom::Start(4))
            .map_err(|e| io_err("seeking to RIFF size", e))?;
        self.inner
            .write_all(&(36 + self.data_bytes).to_le_bytes())
            .map_err(|e| io_err("patching RIFF size", e))?;
        self.inner
            .seek(SeekFrom::Start(40))
            .map_err(|e| io_err("seeking to data size", e))?;
        self.inner
            .write_all(&self.data_bytes.to_le_bytes())
            .map_err(|e| io_err("patching data size", e))?;
        self.inner
            .seek(SeekFrom::End(0))
            .map_err(|e| io_err("seeking back to end", e))?;
        Ok(())
    }

    /// Patch the header sizes and hand back the stream.
    pub fn finalize(mut self) -> Result<W> {
        self.patch_sizes()?;
        self.inner.flush().map_err(|e| io_err("flushing WAV", e))?;
        Ok(self.inner)
    }
}

impl<W: Write + Seek + Send> AudioSink for WavWriter<W> {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let mut raw = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            raw.extend_from_slice(&s.to_le_bytes());
        }
        self.inner
            .write_all(&raw)
            .map_err(|e| io_err("writing samples", e))?;
        self.data_bytes += raw.len() as u32;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.patch_sizes()?;
        self.inner.flush().map_err(|e| io_err("flushing WAV", e))
    }
}

//! Sample sink/source seams between the engine and whatever moves audio.
//!
//! The engine never talks to an audio API. A host hands it a [`SampleSink`]
//! that queues raw playback bytes and a [`SampleSource`] that dequeues raw
//! capture bytes, both in the engine's configured [`SampleFormat`].

use std::collections::VecDeque;

/// Scale used when converting float samples to 16-bit output.
const I16_OUTPUT_SCALE: f32 = 32000.0;

/// Scale used when converting 16-bit capture back to float.
const I16_INPUT_SCALE: f32 = 32768.0;

/// Raw sample encoding, native endian, mono.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

impl SampleFormat {
    pub fn size_bytes(self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 => 2,
        }
    }

    /// Append `samples` to `out` in this format. 16-bit output is clamped.
    pub fn write_samples(self, samples: &[f32], out: &mut Vec<u8>) {
        out.reserve(samples.len() * self.size_bytes());
        match self {
            SampleFormat::F32 => {
                for &s in samples {
                    out.extend_from_slice(&s.to_ne_bytes());
                }
            }
            SampleFormat::I16 => {
                for &s in samples {
                    let v = (s * I16_OUTPUT_SCALE)
                        .round()
                        .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                    out.extend_from_slice(&v.to_ne_bytes());
                }
            }
        }
    }

    /// Decode whole samples from `bytes` into `out`; a trailing partial
    /// sample is ignored. Returns the number of samples decoded.
    pub fn read_samples(self, bytes: &[u8], out: &mut [f32]) -> usize {
        let size = self.size_bytes();
        let mut n = 0;
        for (chunk, slot) in bytes.chunks_exact(size).zip(out.iter_mut()) {
            *slot = match self {
                SampleFormat::F32 => f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                SampleFormat::I16 => {
                    i16::from_ne_bytes([chunk[0], chunk[1]]) as f32 / I16_INPUT_SCALE
                }
            };
            n += 1;
        }
        n
    }
}

/// Re-encode raw sample bytes from one format into another.
pub fn transcode(bytes: &[u8], from: SampleFormat, to: SampleFormat) -> Vec<u8> {
    if from == to {
        return bytes.to_vec();
    }

    let mut samples = vec![0.0f32; bytes.len() / from.size_bytes()];
    let n = from.read_samples(bytes, &mut samples);
    let mut out = Vec::new();
    to.write_samples(&samples[..n], &mut out);
    out
}

/// Playback side: receives one encoded frame per [`crate::Engine::send`].
pub trait SampleSink {
    fn queue_audio(&mut self, data: &[u8]);
}

/// Capture side: fills `data` with up to `data.len()` bytes and returns how
/// many were written. Zero means nothing was captured this tick.
pub trait SampleSource {
    fn dequeue_audio(&mut self, data: &mut [u8]) -> usize;
}

impl SampleSink for Vec<u8> {
    fn queue_audio(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }
}

impl SampleSink for VecDeque<u8> {
    fn queue_audio(&mut self, data: &[u8]) {
        self.extend(data.iter().copied());
    }
}

impl SampleSource for VecDeque<u8> {
    fn dequeue_audio(&mut self, data: &mut [u8]) -> usize {
        let n = data.len().min(self.len());
        for (slot, byte) in data.iter_mut().zip(self.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl<T: SampleSink + ?Sized> SampleSink for &mut T {
    fn queue_audio(&mut self, data: &[u8]) {
        (**self).queue_audio(data)
    }
}

impl<T: SampleSource + ?Sized> SampleSource for &mut T {
    fn dequeue_audio(&mut self, data: &mut [u8]) -> usize {
        (**self).dequeue_audio(data)
    }
}

/// Adapts a closure into a [`SampleSink`].
pub struct FnSink<F>(pub F);

impl<F: FnMut(&[u8])> SampleSink for FnSink<F> {
    fn queue_audio(&mut self, data: &[u8]) {
        (self.0)(data)
    }
}

/// Adapts a closure into a [`SampleSource`].
pub struct FnSource<F>(pub F);

impl<F: FnMut(&mut [u8]) -> usize> SampleSource for FnSource<F> {
    fn dequeue_audio(&mut self, data: &mut [u8]) -> usize {
        (self.0)(data)
    }
}

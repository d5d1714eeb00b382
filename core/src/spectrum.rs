//! Real-input FFT returning one-sided, amplitude-scaled magnitudes.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Frame-sized FFT with a cached plan and scratch buffers.
///
/// Magnitudes are scaled by `2 / N` so a full-cycle sinusoid of amplitude `a`
/// on an integer bin reads back as `a`.
pub struct SpectrumAnalyzer {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();

        Self {
            size,
            fft,
            buffer: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bins written by [`SpectrumAnalyzer::magnitudes`].
    pub fn n_bins(&self) -> usize {
        self.size / 2 + 1
    }

    /// Compute magnitudes of bins `0..=size/2` into `out`.
    ///
    /// `samples` shorter than the FFT size are zero padded; extra samples are
    /// ignored.
    pub fn magnitudes(&mut self, samples: &[f32], out: &mut [f32]) {
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let s = samples.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(s, 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 2.0 / self.size as f32;
        for (bin, value) in out.iter_mut().take(self.n_bins()).enumerate() {
            *value = self.buffer[bin].norm() * scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_integer_bin_tone_has_no_leakage() {
        let n = 1024;
        let bin = 40;
        let samples: Vec<f32> = (0..n)
            .map(|i| 0.25 * (2.0 * PI * bin as f32 * i as f32 / n as f32).sin())
            .collect();

        let mut analyzer = SpectrumAnalyzer::new(n);
        let mut spectrum = vec![0.0; analyzer.n_bins()];
        analyzer.magnitudes(&samples, &mut spectrum);

        assert!((spectrum[bin] - 0.25).abs() < 1e-3, "got {}", spectrum[bin]);
        assert!(spectrum[bin + 1] < 1e-3);
        assert!(spectrum[bin - 1] < 1e-3);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        let mut spectrum = vec![1.0; analyzer.n_bins()];
        analyzer.magnitudes(&[], &mut spectrum);
        assert!(spectrum.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_repeated_calls_are_stable() {
        let n = 512;
        let samples: Vec<f32> = (0..n).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();

        let mut analyzer = SpectrumAnalyzer::new(n);
        let mut a = vec![0.0; analyzer.n_bins()];
        let mut b = vec![0.0; analyzer.n_bins()];
        analyzer.magnitudes(&samples, &mut a);
        analyzer.magnitudes(&samples, &mut b);
        assert_eq!(a, b);
    }
}

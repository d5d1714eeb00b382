use crate::params::ProtocolParameters;
use std::f64::consts::PI;

/// Per-slot waveform templates, one output frame long.
///
/// Each slot gets a "bit=1" and a "bit=0" sinusoid at its two bins, already
/// scaled by the send volume. Because every carrier is an integer bin, each
/// template holds a whole number of cycles and frames can be concatenated
/// without phase jumps.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneTable {
    samples_per_frame: usize,
    bit1_amplitude: Vec<Vec<f32>>,
    bit0_amplitude: Vec<Vec<f32>>,
}

impl ToneTable {
    pub fn build(params: &ProtocolParameters) -> Self {
        let n = params.samples_per_frame_out;
        let volume = params.send_volume as f64;

        let mut bit1_amplitude = Vec::with_capacity(params.n_slots());
        let mut bit0_amplitude = Vec::with_capacity(params.n_slots());

        for slot in 0..params.n_slots() {
            let bins = params.slot(slot);
            // Staggered phases keep the summed waveform's crest factor down
            let phase_offset = PI * slot as f64 / params.n_data_bits as f64;

            bit1_amplitude.push(tone(bins.bit1, n, phase_offset, volume));
            bit0_amplitude.push(tone(bins.bit0, n, phase_offset, volume));
        }

        Self {
            samples_per_frame: n,
            bit1_amplitude,
            bit0_amplitude,
        }
    }

    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    pub fn n_slots(&self) -> usize {
        self.bit1_amplitude.len()
    }

    pub fn bit1(&self, slot: usize) -> &[f32] {
        &self.bit1_amplitude[slot]
    }

    pub fn bit0(&self, slot: usize) -> &[f32] {
        &self.bit0_amplitude[slot]
    }

    /// Template sounding `bit` on `slot`.
    pub fn tone(&self, slot: usize, bit: bool) -> &[f32] {
        if bit {
            self.bit1(slot)
        } else {
            self.bit0(slot)
        }
    }
}

fn tone(bin: usize, n: usize, phase_offset: f64, volume: f64) -> Vec<f32> {
    let cycles = bin as f64;
    (0..n)
        .map(|i| {
            let t = i as f64 / n as f64;
            (volume * (2.0 * PI * cycles * t + phase_offset).sin()) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TxProtocol;
    use crate::spectrum::SpectrumAnalyzer;

    fn params() -> ProtocolParameters {
        ProtocolParameters::derive(TxProtocol::Fast.settings(), 48000, 48000, 1024).unwrap()
    }

    #[test]
    fn test_table_shape() {
        let params = params();
        let table = ToneTable::build(&params);

        assert_eq!(table.n_slots(), params.n_slots());
        assert_eq!(table.samples_per_frame(), 1024);
        assert_eq!(table.bit1(0).len(), 1024);
    }

    #[test]
    fn test_templates_land_on_their_bins() {
        let params = params();
        let table = ToneTable::build(&params);
        let mut analyzer = SpectrumAnalyzer::new(1024);
        let mut spectrum = vec![0.0; analyzer.n_bins()];

        let slot = params.n_bits_in_marker + 5;
        let bins = params.slot(slot);

        analyzer.magnitudes(table.bit1(slot), &mut spectrum);
        assert!((spectrum[bins.bit1] - params.send_volume).abs() < 1e-3);
        assert!(spectrum[bins.bit0] < 1e-3);

        analyzer.magnitudes(table.bit0(slot), &mut spectrum);
        assert!((spectrum[bins.bit0] - params.send_volume).abs() < 1e-3);
        assert!(spectrum[bins.bit1] < 1e-3);
    }

    #[test]
    fn test_templates_are_frame_periodic() {
        let table = ToneTable::build(&params());

        // A whole number of cycles: the sample after the last one is the first.
        let t = table.bit1(3);
        let step = t[1] - t[0];
        let wrap = t[0] - t[t.len() - 1];
        assert!((step - wrap).abs() < 0.05);
    }

    #[test]
    fn test_zero_volume_is_silent() {
        let settings = crate::params::ProtocolSettings {
            volume: 0,
            ..TxProtocol::Fast.settings()
        };
        let params = ProtocolParameters::derive(settings, 48000, 48000, 1024).unwrap();
        let table = ToneTable::build(&params);

        assert!(table.bit0(7).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let params = params();
        assert_eq!(ToneTable::build(&params), ToneTable::build(&params));
    }
}

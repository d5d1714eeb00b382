use crate::error::{Result, WaveShareError};
use crate::{
    ecc_bytes_for_length, DEFAULT_FIXED_LENGTH, ENCODED_LENGTH_BYTES, FIXED_ECC_BYTES,
    MAX_DATA_BITS, MAX_FRAMES_PER_TX, MAX_LENGTH, MAX_RECORDED_FRAMES, N_BITS_IN_MARKER,
    N_MARKER_FRAMES, N_POST_MARKER_FRAMES, N_RAMP_FRAMES_BEGIN, N_RAMP_FRAMES_END,
};

/// Extra frames recorded past the expected end of a transmission.
const RECORD_SLACK_FRAMES: usize = 2;

/// How the payload length travels over the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxMode {
    /// Every transmission carries `DEFAULT_FIXED_LENGTH` payload bytes.
    #[default]
    FixedLength,
    /// A Reed-Solomon protected length byte precedes the payload.
    VariableLength,
}

/// The five user-facing knobs of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Spacing between data slots, in FFT bins.
    pub freq_delta: usize,
    /// First bin used by the marker.
    pub freq_start: usize,
    /// Frames each byte group is repeated for.
    pub frames_per_tx: usize,
    /// Payload bytes carried by one byte group.
    pub bytes_per_tx: usize,
    /// Output volume, 0..=100.
    pub volume: u8,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        TxProtocol::Fast.settings()
    }
}

impl ProtocolSettings {
    /// Bring every knob into its legal range.
    pub fn clamped(self) -> Self {
        Self {
            freq_delta: self.freq_delta.max(1),
            freq_start: self.freq_start.max(1),
            frames_per_tx: self.frames_per_tx.clamp(1, MAX_FRAMES_PER_TX),
            bytes_per_tx: self.bytes_per_tx.clamp(1, MAX_DATA_BITS / 8),
            volume: self.volume.min(100),
        }
    }
}

/// Named tone layouts; `Fast` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxProtocol {
    Normal,
    Fast,
    Fastest,
    Ultrasonic,
}

impl TxProtocol {
    pub fn settings(self) -> ProtocolSettings {
        let (freq_start, frames_per_tx) = match self {
            TxProtocol::Normal => (40, 9),
            TxProtocol::Fast => (40, 6),
            TxProtocol::Fastest => (40, 3),
            TxProtocol::Ultrasonic => (320, 9),
        };

        ProtocolSettings {
            freq_delta: 1,
            freq_start,
            frames_per_tx,
            bytes_per_tx: 3,
            volume: 50,
        }
    }
}

/// The pair of bins owned by one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBins {
    pub bit1: usize,
    pub bit0: usize,
}

/// Frame and tone layout derived from [`ProtocolSettings`] and the sample rates.
///
/// Slot `0..n_bits_in_marker` belong to the marker, data slots follow. Every
/// carrier sits on an integer FFT bin so that a frame-aligned FFT reads its
/// energy without leakage.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolParameters {
    pub settings: ProtocolSettings,
    pub sample_rate_in: u32,
    pub sample_rate_out: u32,
    pub samples_per_frame: usize,
    pub samples_per_frame_out: usize,
    pub hz_per_frame: f32,
    pub send_volume: f32,

    pub slot_spacing: usize,
    pub bit0_offset: usize,
    pub n_bits_in_marker: usize,
    pub n_data_bits: usize,
    pub bytes_per_tx: usize,
    pub frames_per_tx: usize,

    pub n_marker_frames: usize,
    pub n_post_marker_frames: usize,
    pub n_ramp_frames_begin: usize,
    pub n_ramp_frames_blend: usize,
    pub n_ramp_frames_end: usize,

    slots: Vec<SlotBins>,
}

impl ProtocolParameters {
    /// Derive the layout, clamping knobs where a safe value exists.
    ///
    /// Rejects layouts that would put a carrier at or above the Nyquist bin
    /// of either sample rate, or whose worst-case recording would not fit the
    /// receive buffer.
    pub fn derive(
        settings: ProtocolSettings,
        sample_rate_in: u32,
        sample_rate_out: u32,
        samples_per_frame: usize,
    ) -> Result<Self> {
        if sample_rate_in == 0 || sample_rate_out == 0 || samples_per_frame == 0 {
            return Err(WaveShareError::InvalidConfig(
                "sample rates and frame size must be non-zero".to_string(),
            ));
        }

        let settings = settings.clamped();

        let samples_per_frame_out = ((samples_per_frame as f64) * (sample_rate_out as f64)
            / (sample_rate_in as f64))
            .round() as usize;
        let hz_per_frame = sample_rate_in as f32 / samples_per_frame as f32;

        // A one-bin delta leaves no room for the bit=0 bin, so the slots are
        // spread two bins apart instead.
        let (slot_spacing, bit0_offset) = if settings.freq_delta == 1 {
            (2, 1)
        } else {
            (settings.freq_delta, settings.freq_delta / 2)
        };

        let n_data_bits = 8 * settings.bytes_per_tx;
        let n_slots = N_BITS_IN_MARKER + n_data_bits;

        let slots: Vec<SlotBins> = (0..n_slots)
            .map(|slot| {
                let bit1 = settings.freq_start + slot * slot_spacing;
                SlotBins {
                    bit1,
                    bit0: bit1 + bit0_offset,
                }
            })
            .collect();

        let top_bin = slots.last().map(|s| s.bit0.max(s.bit1)).unwrap_or(0);
        let nyquist_in = samples_per_frame / 2;
        let nyquist_out = samples_per_frame_out / 2;
        if top_bin >= nyquist_in || top_bin >= nyquist_out {
            return Err(WaveShareError::InvalidConfig(format!(
                "highest carrier {:.1} Hz (bin {}) exceeds Nyquist limit (bin {})",
                top_bin as f32 * hz_per_frame,
                top_bin,
                nyquist_in.min(nyquist_out)
            )));
        }

        let params = Self {
            settings,
            sample_rate_in,
            sample_rate_out,
            samples_per_frame,
            samples_per_frame_out,
            hz_per_frame,
            send_volume: settings.volume as f32 / 100.0,
            slot_spacing,
            bit0_offset,
            n_bits_in_marker: N_BITS_IN_MARKER,
            n_data_bits,
            bytes_per_tx: settings.bytes_per_tx,
            frames_per_tx: settings.frames_per_tx,
            n_marker_frames: N_MARKER_FRAMES,
            n_post_marker_frames: N_POST_MARKER_FRAMES,
            n_ramp_frames_begin: N_RAMP_FRAMES_BEGIN,
            n_ramp_frames_blend: if settings.frames_per_tx >= 3 { 1 } else { 0 },
            n_ramp_frames_end: N_RAMP_FRAMES_END,
            slots,
        };

        let budget = params
            .frames_to_record(TxMode::VariableLength)
            .max(params.frames_to_record(TxMode::FixedLength));
        if budget > MAX_RECORDED_FRAMES {
            return Err(WaveShareError::InvalidConfig(format!(
                "recording budget of {} frames exceeds {}",
                budget, MAX_RECORDED_FRAMES
            )));
        }

        log::debug!(
            "Derived protocol: {} data bits over bins {}..={}, {:.3} Hz/bin, {} samples/frame out",
            params.n_data_bits,
            params.slots[0].bit1,
            top_bin,
            params.hz_per_frame,
            params.samples_per_frame_out
        );

        Ok(params)
    }

    /// Number of slots (marker + data).
    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: usize) -> SlotBins {
        self.slots[slot]
    }

    pub fn marker_slot(&self, i: usize) -> SlotBins {
        self.slots[i]
    }

    pub fn data_slot(&self, bit: usize) -> SlotBins {
        self.slots[self.n_bits_in_marker + bit]
    }

    /// Frequency in Hz of an FFT bin.
    pub fn bin_hz(&self, bin: usize) -> f32 {
        bin as f32 * self.hz_per_frame
    }

    /// Highest bin used by any slot.
    pub fn top_bin(&self) -> usize {
        self.slots.iter().map(|s| s.bit0.max(s.bit1)).max().unwrap_or(0)
    }

    /// Byte groups needed for `encoded_len` post-ECC bytes.
    pub fn groups_for(&self, encoded_len: usize) -> usize {
        (encoded_len + self.bytes_per_tx - 1) / self.bytes_per_tx
    }

    /// Frames between the end of the marker and the start of the post-marker.
    pub fn data_frames_for(&self, encoded_len: usize) -> usize {
        self.n_ramp_frames_begin
            + self.groups_for(encoded_len) * self.frames_per_tx
            + self.n_ramp_frames_end
    }

    /// Full frame count of one transmission carrying `encoded_len` bytes.
    pub fn total_frames_for(&self, encoded_len: usize) -> usize {
        self.n_marker_frames + self.data_frames_for(encoded_len) + self.n_post_marker_frames
    }

    /// Post-ECC size of the longest transmission in `mode`.
    pub fn max_encoded_len(mode: TxMode) -> usize {
        match mode {
            TxMode::FixedLength => DEFAULT_FIXED_LENGTH + FIXED_ECC_BYTES,
            TxMode::VariableLength => {
                ENCODED_LENGTH_BYTES + MAX_LENGTH + ecc_bytes_for_length(MAX_LENGTH)
            }
        }
    }

    /// Frames the receiver records after locking onto a marker.
    pub fn frames_to_record(&self, mode: TxMode) -> usize {
        self.total_frames_for(Self::max_encoded_len(mode)) + RECORD_SLACK_FRAMES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive(settings: ProtocolSettings) -> Result<ProtocolParameters> {
        ProtocolParameters::derive(settings, 48000, 48000, 1024)
    }

    #[test]
    fn test_fast_preset_layout() {
        let params = derive(TxProtocol::Fast.settings()).unwrap();

        assert_eq!(params.hz_per_frame, 46.875);
        assert_eq!(params.n_data_bits, 24);
        assert_eq!(params.n_slots(), 16 + 24);
        assert_eq!(params.marker_slot(0), SlotBins { bit1: 40, bit0: 41 });
        assert_eq!(params.data_slot(0), SlotBins { bit1: 72, bit0: 73 });
        assert_eq!(params.top_bin(), 40 + 39 * 2 + 1);
        assert_eq!(params.n_ramp_frames_blend, 1);
    }

    #[test]
    fn test_wide_delta_layout() {
        let settings = ProtocolSettings {
            freq_delta: 6,
            ..TxProtocol::Fast.settings()
        };
        let params = derive(settings).unwrap();

        assert_eq!(params.slot_spacing, 6);
        assert_eq!(params.bit0_offset, 3);
        assert_eq!(params.slot(1), SlotBins { bit1: 46, bit0: 49 });
    }

    #[test]
    fn test_marker_and_data_bins_are_disjoint() {
        let params = derive(TxProtocol::Normal.settings()).unwrap();

        let mut marker_bins = Vec::new();
        for i in 0..params.n_bits_in_marker {
            let s = params.marker_slot(i);
            marker_bins.extend([s.bit1, s.bit0]);
        }
        for k in 0..params.n_data_bits {
            let s = params.data_slot(k);
            assert!(!marker_bins.contains(&s.bit1));
            assert!(!marker_bins.contains(&s.bit0));
        }
    }

    #[test]
    fn test_derivation_is_idempotent() {
        for protocol in [
            TxProtocol::Normal,
            TxProtocol::Fast,
            TxProtocol::Fastest,
            TxProtocol::Ultrasonic,
        ] {
            let a = derive(protocol.settings()).unwrap();
            let b = derive(protocol.settings()).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_clamps_out_of_range_knobs() {
        let settings = ProtocolSettings {
            freq_delta: 0,
            freq_start: 0,
            frames_per_tx: 100,
            bytes_per_tx: 1000,
            volume: 250,
        };
        let clamped = settings.clamped();

        assert_eq!(clamped.freq_delta, 1);
        assert_eq!(clamped.freq_start, 1);
        assert_eq!(clamped.frames_per_tx, MAX_FRAMES_PER_TX);
        assert_eq!(clamped.bytes_per_tx * 8, MAX_DATA_BITS);
        assert_eq!(clamped.volume, 100);
    }

    #[test]
    fn test_rejects_nyquist_overflow() {
        let settings = ProtocolSettings {
            freq_start: 480,
            ..TxProtocol::Fast.settings()
        };
        assert!(matches!(derive(settings), Err(WaveShareError::InvalidConfig(_))));

        // Too many data bits for the band above the start bin
        let settings = ProtocolSettings {
            bytes_per_tx: 32,
            ..TxProtocol::Fast.settings()
        };
        assert!(derive(settings).is_err());
    }

    #[test]
    fn test_rejects_oversized_recording_budget() {
        let settings = ProtocolSettings {
            bytes_per_tx: 1,
            frames_per_tx: 16,
            ..TxProtocol::Fast.settings()
        };
        assert!(derive(settings).is_err());
    }

    #[test]
    fn test_output_rate_scales_frame() {
        let params =
            ProtocolParameters::derive(TxProtocol::Fast.settings(), 48000, 96000, 1024).unwrap();
        assert_eq!(params.samples_per_frame_out, 2048);
    }

    #[test]
    fn test_frame_budget() {
        let params = derive(TxProtocol::Fast.settings()).unwrap();

        // "hello": 3 length bytes + 5 payload + 4 parity = 12 bytes = 4 groups
        assert_eq!(params.groups_for(12), 4);
        assert_eq!(params.total_frames_for(12), 16 + 2 + 4 * 6 + 2 + 8);
        assert!(params.frames_to_record(TxMode::VariableLength) <= MAX_RECORDED_FRAMES);
    }
}

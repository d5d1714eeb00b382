use crate::audio_io::{SampleFormat, SampleSink};
use crate::error::Result;
use crate::fec::FecCodec;
use crate::params::{ProtocolParameters, TxMode};
use crate::tones::ToneTable;
use crate::{ecc_bytes_for_length, DEFAULT_FIXED_LENGTH, FIXED_ECC_BYTES, LENGTH_ECC_BYTES, MAX_LENGTH};

/// Fraction of a marker segment spent fading in and out.
const MARKER_EDGE_FRAC: f32 = 0.05;

/// One transmission in flight.
#[derive(Debug, Clone)]
pub struct TxSession {
    pub text_to_send: Vec<u8>,
    pub send_data_length: usize,
    pub encoded_data: Vec<u8>,
    pub frame_id: usize,
    pub total_frames: usize,
}

/// Tx engine: turns a payload into frames, one frame per [`Encoder::send`].
///
/// Frame sequence: marker, ramp-up, byte groups (each repeated
/// `frames_per_tx` times, cross-faded at group boundaries), ramp-down,
/// post-marker.
pub struct Encoder {
    mode: TxMode,
    length_fec: FecCodec,
    payload_fec: FecCodec,
    session: Option<TxSession>,
    output_block: Vec<f32>,
    envelope: Vec<f32>,
    output_bytes: Vec<u8>,
}

impl Encoder {
    pub fn new(mode: TxMode) -> Result<Self> {
        Ok(Self {
            mode,
            length_fec: FecCodec::new(LENGTH_ECC_BYTES)?,
            payload_fec: FecCodec::new(FIXED_ECC_BYTES)?,
            session: None,
            output_block: Vec::new(),
            envelope: Vec::new(),
            output_bytes: Vec::new(),
        })
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: TxMode) {
        self.mode = mode;
    }

    pub fn has_data(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&TxSession> {
        self.session.as_ref()
    }

    /// Drop any transmission in flight.
    pub fn reset(&mut self) {
        self.session = None;
    }

    /// Start a new transmission of `text`, discarding any session in flight.
    ///
    /// An empty payload leaves the encoder idle.
    pub fn init(&mut self, params: &ProtocolParameters, text: &[u8]) -> Result<()> {
        if self.session.take().is_some() {
            log::debug!("Discarding in-flight transmission");
        }

        let mut text = text;
        if text.len() > MAX_LENGTH {
            log::warn!("Truncating data from {} to {} bytes", text.len(), MAX_LENGTH);
            text = &text[..MAX_LENGTH];
        }
        if text.is_empty() {
            return Ok(());
        }

        let (send_data_length, encoded_data) = match self.mode {
            TxMode::FixedLength => {
                if text.len() > DEFAULT_FIXED_LENGTH {
                    log::warn!(
                        "Fixed-length mode carries {} bytes, dropping {}",
                        DEFAULT_FIXED_LENGTH,
                        text.len() - DEFAULT_FIXED_LENGTH
                    );
                }
                let mut payload = vec![0u8; DEFAULT_FIXED_LENGTH];
                let n = text.len().min(DEFAULT_FIXED_LENGTH);
                payload[..n].copy_from_slice(&text[..n]);

                self.ensure_payload_codec(FIXED_ECC_BYTES)?;
                (DEFAULT_FIXED_LENGTH, self.payload_fec.encode(&payload)?)
            }
            TxMode::VariableLength => {
                let mut encoded = self.length_fec.encode(&[text.len() as u8])?;

                self.ensure_payload_codec(ecc_bytes_for_length(text.len()))?;
                encoded.extend_from_slice(&self.payload_fec.encode(text)?);
                (text.len(), encoded)
            }
        };

        let total_frames = params.total_frames_for(encoded_data.len());
        log::debug!(
            "Tx session: {} payload bytes, {} encoded bytes, {} frames",
            send_data_length,
            encoded_data.len(),
            total_frames
        );

        self.session = Some(TxSession {
            text_to_send: text.to_vec(),
            send_data_length,
            encoded_data,
            frame_id: 0,
            total_frames,
        });

        Ok(())
    }

    fn ensure_payload_codec(&mut self, ecc_len: usize) -> Result<()> {
        if self.payload_fec.ecc_len() != ecc_len {
            self.payload_fec = FecCodec::new(ecc_len)?;
        }
        Ok(())
    }

    /// Emit the next frame into `sink`. Returns `false` when idle.
    pub fn send<S: SampleSink + ?Sized>(
        &mut self,
        params: &ProtocolParameters,
        tones: &ToneTable,
        format: SampleFormat,
        sink: &mut S,
    ) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        let frame_id = session.frame_id;
        session.frame_id += 1;
        let finished = session.frame_id >= session.total_frames;

        synthesize_frame(
            params,
            tones,
            &session.encoded_data,
            frame_id,
            &mut self.output_block,
            &mut self.envelope,
        );

        self.output_bytes.clear();
        format.write_samples(&self.output_block, &mut self.output_bytes);
        sink.queue_audio(&self.output_bytes);

        if finished {
            log::debug!("Tx session complete after {} frames", frame_id + 1);
            self.session = None;
        }

        true
    }
}

/// Render frame `frame_id` of the transmission carrying `encoded`.
pub fn synthesize_frame(
    params: &ProtocolParameters,
    tones: &ToneTable,
    encoded: &[u8],
    frame_id: usize,
    out: &mut Vec<f32>,
    envelope: &mut Vec<f32>,
) {
    let n = tones.samples_per_frame();
    out.clear();
    out.resize(n, 0.0);
    envelope.clear();
    envelope.resize(n, 1.0);

    let groups = params.groups_for(encoded.len());
    let data_start = params.n_marker_frames + params.n_ramp_frames_begin;
    let data_end = data_start + groups * params.frames_per_tx;
    let post_start = data_end + params.n_ramp_frames_end;

    let marker_scale = 1.0 / params.n_bits_in_marker as f32;
    let data_scale = 1.0 / params.n_data_bits as f32;

    if frame_id < params.n_marker_frames {
        smooth_envelope(envelope, frame_id, params.n_marker_frames);
        add_marker(params, tones, out, envelope, marker_scale, false);
    } else if frame_id < data_start {
        let ramp_frame = frame_id - params.n_marker_frames;
        linear_envelope(envelope, ramp_frame, params.n_ramp_frames_begin, true);
        add_group(params, tones, encoded, 0, out, envelope, data_scale);
    } else if frame_id < data_end {
        let offset = frame_id - data_start;
        let group = offset / params.frames_per_tx;
        let cycle = offset % params.frames_per_tx;

        if group > 0 && cycle < params.n_ramp_frames_blend {
            linear_envelope(envelope, cycle, params.n_ramp_frames_blend, false);
            add_group(params, tones, encoded, group - 1, out, envelope, data_scale);
            linear_envelope(envelope, cycle, params.n_ramp_frames_blend, true);
        }
        add_group(params, tones, encoded, group, out, envelope, data_scale);
    } else if frame_id < post_start {
        let ramp_frame = frame_id - data_end;
        linear_envelope(envelope, ramp_frame, params.n_ramp_frames_end, false);
        add_group(params, tones, encoded, groups.saturating_sub(1), out, envelope, data_scale);
    } else if frame_id < post_start + params.n_post_marker_frames {
        smooth_envelope(envelope, frame_id - post_start, params.n_post_marker_frames);
        add_marker(params, tones, out, envelope, marker_scale, true);
    }
}

/// Marker pattern: even slots on their bit=1 bin, odd slots on bit=0.
/// The post-marker uses the inverted pattern.
fn add_marker(
    params: &ProtocolParameters,
    tones: &ToneTable,
    out: &mut [f32],
    envelope: &[f32],
    scale: f32,
    inverted: bool,
) {
    for i in 0..params.n_bits_in_marker {
        let bit = (i % 2 == 0) != inverted;
        add_tone(tones.tone(i, bit), out, envelope, scale);
    }
}

fn add_group(
    params: &ProtocolParameters,
    tones: &ToneTable,
    encoded: &[u8],
    group: usize,
    out: &mut [f32],
    envelope: &[f32],
    scale: f32,
) {
    let offset = group * params.bytes_per_tx;
    for k in 0..params.n_data_bits {
        let byte = encoded.get(offset + k / 8).copied().unwrap_or(0);
        let bit = (byte >> (k % 8)) & 1 == 1;
        add_tone(
            tones.tone(params.n_bits_in_marker + k, bit),
            out,
            envelope,
            scale,
        );
    }
}

fn add_tone(src: &[f32], dst: &mut [f32], envelope: &[f32], scale: f32) {
    for ((d, &s), &e) in dst.iter_mut().zip(src).zip(envelope) {
        *d += scale * s * e;
    }
}

/// Fade in over the first and out over the last `MARKER_EDGE_FRAC` of a
/// segment `n_frames` long; `frame` is the position inside the segment.
fn smooth_envelope(envelope: &mut [f32], frame: usize, n_frames: usize) {
    let n = envelope.len();
    let n_total = (n_frames * n) as f32;
    let ds = MARKER_EDGE_FRAC * n_total;
    let n_begin = ds as usize;
    let n_end = ((1.0 - MARKER_EDGE_FRAC) * n_total) as usize;

    for (i, e) in envelope.iter_mut().enumerate() {
        let k = frame * n + i;
        *e = if k < n_begin {
            k as f32 / ds
        } else if k > n_end {
            (n_total - k as f32) / ds
        } else {
            1.0
        };
    }
}

/// Linear ramp across a segment `n_frames` long, rising or falling.
fn linear_envelope(envelope: &mut [f32], frame: usize, n_frames: usize, rising: bool) {
    let n = envelope.len();
    let n_total = (n_frames * n) as f32;

    for (i, e) in envelope.iter_mut().enumerate() {
        let w = (frame * n + i) as f32 / n_total;
        *e = if rising { w } else { 1.0 - w };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ProtocolSettings, TxProtocol};
    use crate::spectrum::SpectrumAnalyzer;

    fn setup() -> (ProtocolParameters, ToneTable) {
        let params =
            ProtocolParameters::derive(TxProtocol::Fast.settings(), 48000, 48000, 1024).unwrap();
        let tones = ToneTable::build(&params);
        (params, tones)
    }

    fn drain(encoder: &mut Encoder, params: &ProtocolParameters, tones: &ToneTable) -> Vec<f32> {
        let mut bytes = Vec::new();
        while encoder.send(params, tones, SampleFormat::F32, &mut bytes) {}
        let mut samples = vec![0.0; bytes.len() / 4];
        SampleFormat::F32.read_samples(&bytes, &mut samples);
        samples
    }

    #[test]
    fn test_variable_length_encoding() {
        let (params, _) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, b"hello").unwrap();

        let session = encoder.session().unwrap();
        assert_eq!(session.send_data_length, 5);
        assert_eq!(session.encoded_data.len(), 3 + 5 + 4);
        assert_eq!(session.encoded_data[0], 5);
        assert_eq!(&session.encoded_data[3..8], b"hello");
        assert_eq!(session.total_frames, params.total_frames_for(12));
    }

    #[test]
    fn test_fixed_length_encoding() {
        let (params, _) = setup();
        let mut encoder = Encoder::new(TxMode::FixedLength).unwrap();
        encoder.init(&params, b"hi").unwrap();

        let session = encoder.session().unwrap();
        assert_eq!(session.send_data_length, DEFAULT_FIXED_LENGTH);
        assert_eq!(session.encoded_data.len(), DEFAULT_FIXED_LENGTH + FIXED_ECC_BYTES);
        assert_eq!(&session.encoded_data[..2], b"hi");
        assert!(session.encoded_data[2..DEFAULT_FIXED_LENGTH].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_one_frame_per_send() {
        let (params, tones) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, b"abc").unwrap();

        let mut bytes = Vec::new();
        assert!(encoder.send(&params, &tones, SampleFormat::I16, &mut bytes));
        assert_eq!(bytes.len(), 1024 * 2);
    }

    #[test]
    fn test_send_drains_then_goes_idle() {
        let (params, tones) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, b"hello").unwrap();
        let total = encoder.session().unwrap().total_frames;

        let samples = drain(&mut encoder, &params, &tones);
        assert_eq!(samples.len(), total * 1024);
        assert!(!encoder.has_data());

        let mut bytes = Vec::new();
        assert!(!encoder.send(&params, &tones, SampleFormat::F32, &mut bytes));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_empty_payload_stays_idle() {
        let (params, _) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, b"").unwrap();
        assert!(!encoder.has_data());
    }

    #[test]
    fn test_truncates_to_max_length() {
        let (params, _) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, &[7u8; 200]).unwrap();

        let session = encoder.session().unwrap();
        assert_eq!(session.send_data_length, MAX_LENGTH);
        assert_eq!(session.text_to_send.len(), MAX_LENGTH);
    }

    #[test]
    fn test_reinit_discards_session() {
        let (params, tones) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, b"first message").unwrap();

        let mut bytes = Vec::new();
        for _ in 0..5 {
            encoder.send(&params, &tones, SampleFormat::F32, &mut bytes);
        }

        encoder.init(&params, b"second").unwrap();
        let session = encoder.session().unwrap();
        assert_eq!(session.frame_id, 0);
        assert_eq!(session.text_to_send, b"second");
    }

    #[test]
    fn test_output_never_clips() {
        let (params, tones) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, &[0xFFu8; 40]).unwrap();

        let samples = drain(&mut encoder, &params, &tones);
        let peak = samples.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak <= params.send_volume + 1e-4, "peak {}", peak);
        assert!(peak > 0.0);
    }

    #[test]
    fn test_marker_and_data_frames_use_their_bins() {
        let (params, tones) = setup();
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, b"hello").unwrap();
        let samples = drain(&mut encoder, &params, &tones);

        let mut analyzer = SpectrumAnalyzer::new(1024);
        let mut spectrum = vec![0.0; analyzer.n_bins()];

        // Middle marker frame: slot 0 sounds bit=1, slot 1 sounds bit=0
        analyzer.magnitudes(&samples[8 * 1024..9 * 1024], &mut spectrum);
        let s0 = params.marker_slot(0);
        let s1 = params.marker_slot(1);
        assert!(spectrum[s0.bit1] > 10.0 * spectrum[s0.bit0]);
        assert!(spectrum[s1.bit0] > 10.0 * spectrum[s1.bit1]);
        let d0 = params.data_slot(0);
        assert!(spectrum[d0.bit1] < 1e-3 && spectrum[d0.bit0] < 1e-3);

        // Last frame of the first group: encoded_data[0] = 5 = 0b101
        let frame = params.n_marker_frames + params.n_ramp_frames_begin + params.frames_per_tx - 1;
        analyzer.magnitudes(&samples[frame * 1024..(frame + 1) * 1024], &mut spectrum);
        for (k, expected) in [(0, true), (1, false), (2, true), (3, false)] {
            let bins = params.data_slot(k);
            let (on, off) = if expected { (bins.bit1, bins.bit0) } else { (bins.bit0, bins.bit1) };
            assert!(spectrum[on] > 10.0 * spectrum[off], "bit {}", k);
        }
        assert!(spectrum[s0.bit1] < 1e-3);
    }

    #[test]
    fn test_wider_spacing_roundtrips_through_bins() {
        let settings = ProtocolSettings {
            freq_delta: 4,
            ..TxProtocol::Fastest.settings()
        };
        let params = ProtocolParameters::derive(settings, 48000, 48000, 1024).unwrap();
        let tones = ToneTable::build(&params);
        let mut encoder = Encoder::new(TxMode::VariableLength).unwrap();
        encoder.init(&params, b"x").unwrap();

        let samples = drain(&mut encoder, &params, &tones);
        assert_eq!(samples.len(), params.total_frames_for(3 + 1 + 2) * 1024);
    }
}

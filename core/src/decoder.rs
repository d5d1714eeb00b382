use crate::audio_io::{SampleFormat, SampleSource};
use crate::error::Result;
use crate::fec::FecCodec;
use crate::params::{ProtocolParameters, TxMode};
use crate::spectrum::SpectrumAnalyzer;
use crate::{
    ecc_bytes_for_length, DEFAULT_FIXED_LENGTH, ENCODED_LENGTH_BYTES, FIXED_ECC_BYTES,
    LENGTH_ECC_BYTES, MARKER_LOCK_FRAMES, MARKER_THRESHOLD, MAX_LENGTH, MAX_SPECTRUM_HISTORY,
};
use std::time::{Duration, Instant};

/// Absolute magnitude a marker bin must clear on top of the noise floor.
const MIN_MARKER_MAGNITUDE: f32 = 1e-4;

/// Sub-frame resolution of the alignment search.
const STEPS_PER_FRAME: usize = 16;

/// How far (in frames) the alignment search reaches around the nominal start.
const SEARCH_RADIUS_FRAMES: usize = 2;

/// Receive state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Tracking the noise floor and looking for the start marker.
    Listening,
    /// Marker confirmed; recording starts with the next frame.
    MarkerLocked,
    /// Appending frames to the recording buffer.
    Recording,
    /// Trying one candidate alignment per call.
    Analyzing,
}

/// Rx engine: consumes captured frames and recovers payloads.
pub struct Decoder {
    mode: TxMode,
    state: RxState,
    length_fec: FecCodec,
    payload_fec: FecCodec,
    analyzer: SpectrumAnalyzer,

    capture_bytes: Vec<u8>,
    sample_amplitude: Vec<f32>,
    sample_spectrum: Vec<f32>,

    history_id: usize,
    spectrum_history: Vec<Vec<f32>>,
    noise_floor: Vec<f32>,
    marker_run: usize,
    post_marker_run: usize,

    frames_to_record: usize,
    frames_left_to_record: usize,
    recorded_frames: usize,
    recorded_amplitude: Vec<f32>,
    last_marker_frame: Option<usize>,

    candidates: Vec<usize>,
    frames_to_analyze: usize,
    frames_left_to_analyze: usize,
    analysis_time: Duration,
    group_amplitude: Vec<f32>,
    group_spectrum: Vec<f32>,
    encoded_data: Vec<u8>,

    rx_data: Vec<u8>,
    n_received: usize,
    average_rx_time_ms: f32,
    total_bytes_captured: u64,
}

impl Decoder {
    pub fn new(mode: TxMode, samples_per_frame: usize) -> Result<Self> {
        let analyzer = SpectrumAnalyzer::new(samples_per_frame);
        let n_bins = analyzer.n_bins();

        Ok(Self {
            mode,
            state: RxState::Listening,
            length_fec: FecCodec::new(LENGTH_ECC_BYTES)?,
            payload_fec: FecCodec::new(FIXED_ECC_BYTES)?,
            analyzer,
            capture_bytes: Vec::new(),
            sample_amplitude: vec![0.0; samples_per_frame],
            sample_spectrum: vec![0.0; n_bins],
            history_id: 0,
            spectrum_history: vec![vec![0.0; n_bins]; MAX_SPECTRUM_HISTORY],
            noise_floor: vec![0.0; n_bins],
            marker_run: 0,
            post_marker_run: 0,
            frames_to_record: 0,
            frames_left_to_record: 0,
            recorded_frames: 0,
            recorded_amplitude: Vec::new(),
            last_marker_frame: None,
            candidates: Vec::new(),
            frames_to_analyze: 0,
            frames_left_to_analyze: 0,
            analysis_time: Duration::ZERO,
            group_amplitude: vec![0.0; samples_per_frame],
            group_spectrum: vec![0.0; n_bins],
            encoded_data: Vec::new(),
            rx_data: Vec::new(),
            n_received: 0,
            average_rx_time_ms: 0.0,
            total_bytes_captured: 0,
        })
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    /// Switch mode; abandons any transmission being received.
    pub fn set_mode(&mut self, mode: TxMode) {
        if self.mode != mode {
            self.mode = mode;
            self.reset();
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    /// Last successfully decoded payload.
    pub fn rx_data(&self) -> &[u8] {
        &self.rx_data
    }

    pub fn average_rx_time_ms(&self) -> f32 {
        self.average_rx_time_ms
    }

    pub fn frames_to_record(&self) -> usize {
        self.frames_to_record
    }

    pub fn frames_left_to_record(&self) -> usize {
        self.frames_left_to_record
    }

    pub fn frames_to_analyze(&self) -> usize {
        self.frames_to_analyze
    }

    pub fn frames_left_to_analyze(&self) -> usize {
        self.frames_left_to_analyze
    }

    pub fn total_bytes_captured(&self) -> u64 {
        self.total_bytes_captured
    }

    /// Mean magnitude per bin over the recent non-marker frames.
    pub fn noise_floor(&self) -> &[f32] {
        &self.noise_floor
    }

    /// Drop any transmission in progress and go back to listening.
    /// The noise floor and `rx_data` are kept.
    pub fn reset(&mut self) {
        if self.state != RxState::Listening {
            log::debug!("Rx reset from {:?}", self.state);
        }
        self.state = RxState::Listening;
        self.marker_run = 0;
        self.post_marker_run = 0;
        self.frames_to_record = 0;
        self.frames_left_to_record = 0;
        self.recorded_frames = 0;
        self.last_marker_frame = None;
        self.candidates.clear();
        self.frames_to_analyze = 0;
        self.frames_left_to_analyze = 0;
    }

    /// Process one tick. Returns `true` when a new payload landed in `rx_data`.
    pub fn receive<S: SampleSource + ?Sized>(
        &mut self,
        params: &ProtocolParameters,
        format: SampleFormat,
        source: &mut S,
    ) -> bool {
        if self.state == RxState::Analyzing {
            return self.analyze_step(params);
        }

        let frame_bytes = params.samples_per_frame * format.size_bytes();
        self.capture_bytes.resize(frame_bytes, 0);
        // A source may over-report; never read past the frame buffer
        let n_bytes = source.dequeue_audio(&mut self.capture_bytes).min(frame_bytes);
        if n_bytes == 0 {
            return false;
        }
        self.total_bytes_captured += n_bytes as u64;

        // Short reads are zero padded
        self.sample_amplitude.fill(0.0);
        format.read_samples(&self.capture_bytes[..n_bytes], &mut self.sample_amplitude);
        self.analyzer
            .magnitudes(&self.sample_amplitude, &mut self.sample_spectrum);

        match self.state {
            RxState::Listening => self.listen(params),
            RxState::MarkerLocked => {
                self.state = RxState::Recording;
                self.record_frame(params);
            }
            RxState::Recording => self.record_frame(params),
            RxState::Analyzing => {}
        }

        false
    }

    fn listen(&mut self, params: &ProtocolParameters) {
        if !self.matches_marker(params, false) {
            self.marker_run = 0;
            self.push_history();
            return;
        }

        self.marker_run += 1;
        if self.marker_run < MARKER_LOCK_FRAMES {
            return;
        }

        let frames_to_record = params.frames_to_record(self.mode);
        log::debug!("Marker locked, recording up to {} frames", frames_to_record);

        self.state = RxState::MarkerLocked;
        self.marker_run = 0;
        self.post_marker_run = 0;
        self.frames_to_record = frames_to_record;
        self.frames_left_to_record = frames_to_record;
        self.recorded_frames = 0;
        self.last_marker_frame = None;
        self.recorded_amplitude
            .resize(frames_to_record * params.samples_per_frame, 0.0);
    }

    fn push_history(&mut self) {
        self.spectrum_history[self.history_id].copy_from_slice(&self.sample_spectrum);
        self.history_id = (self.history_id + 1) % MAX_SPECTRUM_HISTORY;

        self.noise_floor.fill(0.0);
        for spectrum in &self.spectrum_history {
            for (avg, &m) in self.noise_floor.iter_mut().zip(spectrum) {
                *avg += m;
            }
        }
        let norm = 1.0 / MAX_SPECTRUM_HISTORY as f32;
        for avg in self.noise_floor.iter_mut() {
            *avg *= norm;
        }
    }

    /// Every marker slot must stand `MARKER_THRESHOLD` above both the noise
    /// floor and its complementary bin.
    fn matches_marker(&self, params: &ProtocolParameters, inverted: bool) -> bool {
        (0..params.n_bits_in_marker).all(|i| {
            let bins = params.marker_slot(i);
            let (on, off) = if (i % 2 == 0) != inverted {
                (bins.bit1, bins.bit0)
            } else {
                (bins.bit0, bins.bit1)
            };

            let m = self.sample_spectrum[on];
            m > MARKER_THRESHOLD * (self.noise_floor[on] + MIN_MARKER_MAGNITUDE)
                && m > MARKER_THRESHOLD * self.sample_spectrum[off]
        })
    }

    fn record_frame(&mut self, params: &ProtocolParameters) {
        let n = params.samples_per_frame;
        let idx = self.frames_to_record - self.frames_left_to_record;
        self.recorded_amplitude[idx * n..(idx + 1) * n].copy_from_slice(&self.sample_amplitude);
        self.recorded_frames = idx + 1;

        if self.matches_marker(params, false) {
            self.last_marker_frame = Some(idx);
        }

        if self.matches_marker(params, true) {
            self.post_marker_run += 1;
        } else {
            self.post_marker_run = 0;
        }

        self.frames_left_to_record -= 1;
        if self.post_marker_run >= MARKER_LOCK_FRAMES {
            log::debug!("Post-marker seen after {} recorded frames", self.recorded_frames);
            self.frames_left_to_record = 0;
        }

        if self.frames_left_to_record == 0 {
            self.start_analysis(params);
        }
    }

    fn start_analysis(&mut self, params: &ProtocolParameters) {
        let n = params.samples_per_frame;
        let step = (n / STEPS_PER_FRAME).max(1);
        let nominal = self.last_marker_frame.map(|f| f + 1).unwrap_or(0) * n;
        let limit = self.recorded_frames * n;

        // Nominal start first, then alternating outwards
        self.candidates.clear();
        self.candidates.push(nominal);
        for k in 1..=(SEARCH_RADIUS_FRAMES * STEPS_PER_FRAME) {
            let delta = k * step;
            if nominal + delta < limit {
                self.candidates.push(nominal + delta);
            }
            if delta <= nominal {
                self.candidates.push(nominal - delta);
            }
        }

        self.state = RxState::Analyzing;
        self.frames_to_analyze = self.candidates.len();
        self.frames_left_to_analyze = self.candidates.len();
        self.analysis_time = Duration::ZERO;
    }

    fn analyze_step(&mut self, params: &ProtocolParameters) -> bool {
        let started = Instant::now();

        let idx = self.frames_to_analyze - self.frames_left_to_analyze;
        let Some(&offset) = self.candidates.get(idx) else {
            self.reset();
            return false;
        };
        self.frames_left_to_analyze -= 1;

        let result = self.try_candidate(params, offset);
        self.analysis_time += started.elapsed();

        match result {
            Some(payload) => {
                let elapsed_ms = self.analysis_time.as_secs_f32() * 1000.0;
                self.n_received += 1;
                self.average_rx_time_ms +=
                    (elapsed_ms - self.average_rx_time_ms) / self.n_received as f32;

                log::info!(
                    "Received sound data successfully: {:?}",
                    String::from_utf8_lossy(&payload)
                );
                self.rx_data = payload;
                self.reset();
                true
            }
            None => {
                if self.frames_left_to_analyze == 0 {
                    log::info!("Failed to capture sound data, back to listening");
                    self.reset();
                }
                false
            }
        }
    }

    /// Decode the transmission assuming its ramp-up starts at sample `offset`
    /// of the recording.
    fn try_candidate(&mut self, params: &ProtocolParameters, offset: usize) -> Option<Vec<u8>> {
        match self.mode {
            TxMode::VariableLength => {
                let length_groups = params.groups_for(ENCODED_LENGTH_BYTES);
                self.extract_groups(params, offset, 0, length_groups)?;

                let length = match self.length_fec.decode(&self.encoded_data[..ENCODED_LENGTH_BYTES]) {
                    Ok(decoded) => decoded[0] as usize,
                    Err(e) => {
                        log::trace!("offset {}: length field: {}", offset, e);
                        return None;
                    }
                };
                if length == 0 || length > MAX_LENGTH {
                    log::trace!("offset {}: implausible length {}", offset, length);
                    return None;
                }

                let ecc_len = ecc_bytes_for_length(length);
                let total = ENCODED_LENGTH_BYTES + length + ecc_len;
                self.extract_groups(params, offset, length_groups, params.groups_for(total))?;

                if self.payload_fec.ecc_len() != ecc_len {
                    self.payload_fec = FecCodec::new(ecc_len).ok()?;
                }
                match self.payload_fec.decode(&self.encoded_data[ENCODED_LENGTH_BYTES..total]) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        log::trace!("offset {}: payload: {}", offset, e);
                        None
                    }
                }
            }
            TxMode::FixedLength => {
                let total = DEFAULT_FIXED_LENGTH + FIXED_ECC_BYTES;
                self.extract_groups(params, offset, 0, params.groups_for(total))?;

                if self.payload_fec.ecc_len() != FIXED_ECC_BYTES {
                    self.payload_fec = FecCodec::new(FIXED_ECC_BYTES).ok()?;
                }
                let mut payload = match self.payload_fec.decode(&self.encoded_data[..total]) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::trace!("offset {}: payload: {}", offset, e);
                        return None;
                    }
                };

                // Strip the zero padding added by the transmitter
                let end = payload.iter().rposition(|&b| b != 0)? + 1;
                payload.truncate(end);
                Some(payload)
            }
        }
    }

    /// Decide the bits of groups `first..last` into `encoded_data`.
    ///
    /// Returns `None` when a group reaches past the recorded audio.
    fn extract_groups(
        &mut self,
        params: &ProtocolParameters,
        offset: usize,
        first: usize,
        last: usize,
    ) -> Option<()> {
        let n = params.samples_per_frame;
        let recorded = self.recorded_frames * n;
        // Blend frames mix two groups; read only the settled part
        let skip = if params.frames_per_tx > params.n_ramp_frames_blend {
            params.n_ramp_frames_blend
        } else {
            0
        };
        let n_summed = params.frames_per_tx - skip;
        let floor_scale = (n_summed as f32).sqrt();

        self.encoded_data.resize(last * params.bytes_per_tx, 0);

        for group in first..last {
            let group_start = offset + (params.n_ramp_frames_begin + group * params.frames_per_tx) * n;

            self.group_amplitude.fill(0.0);
            for cycle in skip..params.frames_per_tx {
                let start = group_start + cycle * n;
                let frame = self.recorded_amplitude.get(start..start + n)?;
                if start + n > recorded {
                    return None;
                }
                for (acc, &s) in self.group_amplitude.iter_mut().zip(frame) {
                    *acc += s;
                }
            }

            self.analyzer
                .magnitudes(&self.group_amplitude, &mut self.group_spectrum);

            let bytes = &mut self.encoded_data[group * params.bytes_per_tx..(group + 1) * params.bytes_per_tx];
            bytes.fill(0);
            for k in 0..params.n_data_bits {
                let bins = params.data_slot(k);
                let one = self.group_spectrum[bins.bit1] - floor_scale * self.noise_floor[bins.bit1];
                let zero = self.group_spectrum[bins.bit0] - floor_scale * self.noise_floor[bins.bit0];
                if one > zero {
                    bytes[k / 8] |= 1 << (k % 8);
                }
            }
        }

        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encoder;
    use crate::params::TxProtocol;
    use crate::tones::ToneTable;
    use std::collections::VecDeque;

    fn params() -> ProtocolParameters {
        ProtocolParameters::derive(TxProtocol::Fast.settings(), 48000, 48000, 1024).unwrap()
    }

    fn transmit(params: &ProtocolParameters, mode: TxMode, payload: &[u8]) -> VecDeque<u8> {
        let tones = ToneTable::build(params);
        let mut encoder = Encoder::new(mode).unwrap();
        encoder.init(params, payload).unwrap();

        let mut air = VecDeque::new();
        while encoder.send(params, &tones, SampleFormat::F32, &mut air) {}
        air
    }

    fn run(decoder: &mut Decoder, params: &ProtocolParameters, air: &mut VecDeque<u8>) -> bool {
        // Enough extra ticks to finish the analysis once the input runs dry
        let ticks = air.len() / (params.samples_per_frame * 4) + 200;
        (0..ticks).any(|_| decoder.receive(params, SampleFormat::F32, air))
    }

    #[test]
    fn test_starts_listening() {
        let decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();
        assert_eq!(decoder.state(), RxState::Listening);
        assert!(decoder.rx_data().is_empty());
        assert_eq!(decoder.total_bytes_captured(), 0);
    }

    #[test]
    fn test_zero_length_read_is_a_no_op() {
        let params = params();
        let mut decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();
        let mut empty = VecDeque::new();

        for _ in 0..10 {
            assert!(!decoder.receive(&params, SampleFormat::F32, &mut empty));
        }
        assert_eq!(decoder.state(), RxState::Listening);
        assert_eq!(decoder.total_bytes_captured(), 0);
    }

    #[test]
    fn test_short_read_is_zero_padded() {
        let params = params();
        let mut decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();
        let mut bytes = Vec::new();
        SampleFormat::F32.write_samples(&[0.1; 100], &mut bytes);
        let mut source: VecDeque<u8> = bytes.into_iter().collect();

        decoder.receive(&params, SampleFormat::F32, &mut source);
        assert_eq!(decoder.total_bytes_captured(), 400);
        assert_eq!(decoder.sample_amplitude[99], 0.1);
        assert_eq!(decoder.sample_amplitude[100], 0.0);
    }

    #[test]
    fn test_decodes_variable_length() {
        let params = params();
        let mut air = transmit(&params, TxMode::VariableLength, b"hello");
        let mut decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();

        assert!(run(&mut decoder, &params, &mut air));
        assert_eq!(decoder.rx_data(), b"hello");
        assert_eq!(decoder.state(), RxState::Listening);
        assert!(decoder.average_rx_time_ms() >= 0.0);
    }

    #[test]
    fn test_decodes_fixed_length() {
        let params = params();
        let mut air = transmit(&params, TxMode::FixedLength, b"fixed payload");
        let mut decoder = Decoder::new(TxMode::FixedLength, 1024).unwrap();

        assert!(run(&mut decoder, &params, &mut air));
        assert_eq!(decoder.rx_data(), b"fixed payload");
    }

    #[test]
    fn test_over_reporting_source_is_clamped() {
        let params = params();
        let mut decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();
        let mut source = crate::audio_io::FnSource(|data: &mut [u8]| {
            data.fill(0);
            data.len() + 100
        });

        assert!(!decoder.receive(&params, SampleFormat::F32, &mut source));
        assert_eq!(decoder.total_bytes_captured(), 1024 * 4);
        assert_eq!(decoder.state(), RxState::Listening);
    }

    #[test]
    fn test_fixed_length_strips_trailing_zeros_only() {
        let params = params();

        let mut air = transmit(&params, TxMode::FixedLength, b"a\0b\0\0");
        let mut decoder = Decoder::new(TxMode::FixedLength, 1024).unwrap();
        assert!(run(&mut decoder, &params, &mut air));
        assert_eq!(decoder.rx_data(), b"a\0b");
    }

    #[test]
    fn test_fixed_length_all_zero_payload_is_not_delivered() {
        let params = params();

        let mut air = transmit(&params, TxMode::FixedLength, &[0u8; 4]);
        let mut decoder = Decoder::new(TxMode::FixedLength, 1024).unwrap();
        assert!(!run(&mut decoder, &params, &mut air));
        assert!(decoder.rx_data().is_empty());
        assert_eq!(decoder.state(), RxState::Listening);
    }

    #[test]
    fn test_state_machine_progression() {
        let params = params();
        let mut air = transmit(&params, TxMode::VariableLength, b"state");
        let mut decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();

        let mut seen = vec![decoder.state()];
        for _ in 0..2000 {
            let received = decoder.receive(&params, SampleFormat::F32, &mut air);
            if *seen.last().unwrap() != decoder.state() {
                seen.push(decoder.state());
            }
            if received {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                RxState::Listening,
                RxState::MarkerLocked,
                RxState::Recording,
                RxState::Analyzing,
                RxState::Listening
            ]
        );
    }

    #[test]
    fn test_post_marker_ends_recording_early() {
        let params = params();
        let mut air = transmit(&params, TxMode::VariableLength, b"short");
        let mut decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();

        while decoder.state() != RxState::Analyzing && !air.is_empty() {
            decoder.receive(&params, SampleFormat::F32, &mut air);
        }

        assert_eq!(decoder.state(), RxState::Analyzing);
        assert_eq!(decoder.frames_left_to_record(), 0);
        assert!(decoder.recorded_frames < params.frames_to_record(TxMode::VariableLength));
        assert!(decoder.frames_to_analyze() > 0);
    }

    #[test]
    fn test_silence_keeps_listening() {
        let params = params();
        let mut decoder = Decoder::new(TxMode::VariableLength, 1024).unwrap();
        let mut silence: VecDeque<u8> = vec![0u8; 1024 * 4 * 50].into_iter().collect();

        assert!(!run(&mut decoder, &params, &mut silence));
        assert_eq!(decoder.state(), RxState::Listening);
        assert_eq!(decoder.total_bytes_captured(), 1024 * 4 * 50);
    }
}

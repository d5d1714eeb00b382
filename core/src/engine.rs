use crate::audio_io::{SampleFormat, SampleSink, SampleSource};
use crate::decoder::{Decoder, RxState};
use crate::encoder::Encoder;
use crate::error::{Result, WaveShareError};
use crate::params::{ProtocolParameters, ProtocolSettings, TxMode, TxProtocol};
use crate::tones::ToneTable;
use crate::{BASE_SAMPLE_RATE, MAX_SAMPLES_PER_FRAME};

/// Audio configuration fixed for the lifetime of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub sample_rate_in: u32,
    pub sample_rate_out: u32,
    pub samples_per_frame: usize,
    pub sample_format_in: SampleFormat,
    pub sample_format_out: SampleFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate_in: BASE_SAMPLE_RATE,
            sample_rate_out: BASE_SAMPLE_RATE,
            samples_per_frame: MAX_SAMPLES_PER_FRAME,
            sample_format_in: SampleFormat::F32,
            sample_format_out: SampleFormat::I16,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.samples_per_frame == 0 || self.samples_per_frame > MAX_SAMPLES_PER_FRAME {
            return Err(WaveShareError::InvalidConfig(format!(
                "samples per frame must be in 1..={}, got {}",
                MAX_SAMPLES_PER_FRAME, self.samples_per_frame
            )));
        }
        if self.sample_rate_in == 0 || self.sample_rate_out == 0 {
            return Err(WaveShareError::InvalidConfig(
                "sample rates must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Half-duplex arbitration: the engine either speaks or listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Transmitting,
    Listening,
}

/// One end of the acoustic link.
///
/// Owns the derived parameters, the tone table and both the Tx and Rx sides.
/// A host drives it once per tick, either through [`Engine::poll`] or by
/// calling [`Engine::send`] / [`Engine::receive`] itself.
pub struct Engine {
    config: EngineConfig,
    params: ProtocolParameters,
    tones: ToneTable,
    encoder: Encoder,
    decoder: Decoder,
}

impl Engine {
    /// Create an engine with the [`TxProtocol::Fast`] layout in fixed-length mode.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_settings(config, TxProtocol::Fast.settings())
    }

    pub fn with_settings(config: EngineConfig, settings: ProtocolSettings) -> Result<Self> {
        config.validate()?;

        let params = ProtocolParameters::derive(
            settings,
            config.sample_rate_in,
            config.sample_rate_out,
            config.samples_per_frame,
        )?;
        let tones = ToneTable::build(&params);
        let mode = TxMode::default();

        log::debug!(
            "Engine ready: {} Hz in / {} Hz out, {} samples per frame",
            config.sample_rate_in,
            config.sample_rate_out,
            config.samples_per_frame
        );

        Ok(Self {
            config,
            params,
            tones,
            encoder: Encoder::new(mode)?,
            decoder: Decoder::new(mode, config.samples_per_frame)?,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn parameters(&self) -> &ProtocolParameters {
        &self.params
    }

    pub fn tones(&self) -> &ToneTable {
        &self.tones
    }

    pub fn tx_mode(&self) -> TxMode {
        self.encoder.mode()
    }

    /// Switch both sides of the engine to `mode`.
    pub fn set_tx_mode(&mut self, mode: TxMode) {
        self.encoder.set_mode(mode);
        self.decoder.set_mode(mode);
    }

    /// Re-derive the layout from the five protocol knobs.
    ///
    /// Out-of-range knobs are clamped. A layout that cannot work at the
    /// configured sample rates is rejected and the previous parameters stay
    /// in force. On success any transmission in flight is dropped.
    pub fn set_parameters(
        &mut self,
        freq_delta: usize,
        freq_start: usize,
        frames_per_tx: usize,
        bytes_per_tx: usize,
        volume: u8,
    ) -> Result<()> {
        self.set_settings(ProtocolSettings {
            freq_delta,
            freq_start,
            frames_per_tx,
            bytes_per_tx,
            volume,
        })
    }

    pub fn set_protocol(&mut self, protocol: TxProtocol) -> Result<()> {
        self.set_settings(protocol.settings())
    }

    pub fn set_settings(&mut self, settings: ProtocolSettings) -> Result<()> {
        let params = match ProtocolParameters::derive(
            settings,
            self.config.sample_rate_in,
            self.config.sample_rate_out,
            self.config.samples_per_frame,
        ) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("Rejected protocol parameters {:?}: {}", settings, e);
                return Err(e);
            }
        };

        if params == self.params {
            return Ok(());
        }

        self.tones = ToneTable::build(&params);
        self.params = params;
        self.encoder.reset();
        self.decoder.reset();
        Ok(())
    }

    /// Queue `text` for transmission, replacing anything still being sent.
    pub fn init(&mut self, text: &[u8]) -> Result<()> {
        self.encoder.init(&self.params, text)
    }

    /// Emit one frame into `sink`. Returns `false` when there is nothing to send.
    pub fn send<S: SampleSink + ?Sized>(&mut self, sink: &mut S) -> bool {
        self.encoder.send(
            &self.params,
            &self.tones,
            self.config.sample_format_out,
            sink,
        )
    }

    /// Consume up to one frame from `source`. Returns `true` when a new
    /// payload was decoded.
    pub fn receive<S: SampleSource + ?Sized>(&mut self, source: &mut S) -> bool {
        self.decoder
            .receive(&self.params, self.config.sample_format_in, source)
    }

    pub fn link_state(&self) -> LinkState {
        if self.has_data() {
            LinkState::Transmitting
        } else {
            LinkState::Listening
        }
    }

    /// One arbitrated tick: send while transmitting, otherwise receive.
    ///
    /// Returns `true` when a new payload was decoded.
    pub fn poll<Tx, Rx>(&mut self, sink: &mut Tx, source: &mut Rx) -> bool
    where
        Tx: SampleSink + ?Sized,
        Rx: SampleSource + ?Sized,
    {
        match self.link_state() {
            LinkState::Transmitting => {
                self.send(sink);
                false
            }
            LinkState::Listening => self.receive(source),
        }
    }

    pub fn has_data(&self) -> bool {
        self.encoder.has_data()
    }

    pub fn rx_data(&self) -> &[u8] {
        self.decoder.rx_data()
    }

    pub fn rx_state(&self) -> RxState {
        self.decoder.state()
    }

    pub fn average_rx_time_ms(&self) -> f32 {
        self.decoder.average_rx_time_ms()
    }

    pub fn frames_to_record(&self) -> usize {
        self.decoder.frames_to_record()
    }

    pub fn frames_left_to_record(&self) -> usize {
        self.decoder.frames_left_to_record()
    }

    pub fn frames_to_analyze(&self) -> usize {
        self.decoder.frames_to_analyze()
    }

    pub fn frames_left_to_analyze(&self) -> usize {
        self.decoder.frames_left_to_analyze()
    }

    pub fn total_bytes_captured(&self) -> u64 {
        self.decoder.total_bytes_captured()
    }

    pub fn sample_rate_in(&self) -> u32 {
        self.config.sample_rate_in
    }

    pub fn sample_rate_out(&self) -> u32 {
        self.config.sample_rate_out
    }

    pub fn samples_per_frame(&self) -> usize {
        self.params.samples_per_frame
    }

    pub fn samples_per_frame_out(&self) -> usize {
        self.params.samples_per_frame_out
    }

    pub fn sample_size_bytes_in(&self) -> usize {
        self.config.sample_format_in.size_bytes()
    }

    pub fn sample_size_bytes_out(&self) -> usize {
        self.config.sample_format_out.size_bytes()
    }
}

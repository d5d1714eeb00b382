use clap::{Parser, Subcommand, ValueEnum};
use hound::WavSpec;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use waveshare_core::params::ProtocolSettings;
use waveshare_core::resample::{downmix, resample};
use waveshare_core::{
    Engine, EngineConfig, LinkState, RxState, SampleFormat, TxMode, TxProtocol, BASE_SAMPLE_RATE,
};

/// Silent frames written ahead of a transmission so a receiver can learn the
/// noise floor.
const LEAD_SILENCE_FRAMES: usize = 4;

/// Idle wait between loopback ticks when nothing is on the air.
const LOOPBACK_IDLE: Duration = Duration::from_millis(10);

/// Capture backlog, in frames, beyond which queued audio is stale.
const MAX_QUEUED_FRAMES: usize = 32;

#[derive(Debug, Error)]
enum CliError {
    #[error("Unsupported WAV format: {bits}-bit {format:?}")]
    UnsupportedWav { bits: u16, format: hound::SampleFormat },

    #[error("No transmission could be decoded from {0}")]
    NothingDecoded(PathBuf),

    #[error("Input file {0} is empty")]
    EmptyInput(PathBuf),

    #[error("Engine lock poisoned")]
    Poisoned,

    #[error("Input thread panicked")]
    InputThread,
}

#[derive(Parser)]
#[command(name = "waveshare")]
#[command(about = "Send short messages over sound with multi-tone FSK")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Copy)]
struct ProtocolArgs {
    /// Tone layout preset
    #[arg(short, long, value_enum, default_value = "fast")]
    protocol: ProtocolArg,

    /// How the payload length is carried
    #[arg(short, long, value_enum, default_value = "variable")]
    mode: ModeArg,

    /// Output volume override, 0-100
    #[arg(short, long)]
    volume: Option<u8>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProtocolArg {
    Normal,
    Fast,
    Fastest,
    Ultrasonic,
}

impl From<ProtocolArg> for TxProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Normal => TxProtocol::Normal,
            ProtocolArg::Fast => TxProtocol::Fast,
            ProtocolArg::Fastest => TxProtocol::Fastest,
            ProtocolArg::Ultrasonic => TxProtocol::Ultrasonic,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Fixed,
    Variable,
}

impl From<ModeArg> for TxMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Fixed => TxMode::FixedLength,
            ModeArg::Variable => TxMode::VariableLength,
        }
    }
}

impl ProtocolArgs {
    fn settings(&self) -> ProtocolSettings {
        let mut settings = TxProtocol::from(self.protocol).settings();
        if let Some(volume) = self.volume {
            settings.volume = volume;
        }
        settings
    }

    fn engine(&self, config: EngineConfig) -> Result<Engine, Box<dyn std::error::Error>> {
        let mut engine = Engine::with_settings(config, self.settings())?;
        engine.set_tx_mode(self.mode.into());
        Ok(engine)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file's bytes into a WAV transmission
    Encode {
        /// Input file (at most 140 bytes are sent)
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        #[command(flatten)]
        protocol: ProtocolArgs,
    },

    /// Decode the first transmission found in a WAV file
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Output file for the decoded bytes
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        #[command(flatten)]
        protocol: ProtocolArgs,
    },

    /// Print the derived tone layout as JSON
    Params {
        #[command(flatten)]
        protocol: ProtocolArgs,

        /// Also report the frame count for a payload of this many bytes
        #[arg(short, long)]
        length: Option<usize>,
    },

    /// Chat between two in-memory engines; each stdin line is sent from
    /// alice to bob
    Loopback {
        #[command(flatten)]
        protocol: ProtocolArgs,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            input,
            output,
            protocol,
        } => encode_command(&input, &output, &protocol)?,
        Commands::Decode {
            input,
            output,
            protocol,
        } => decode_command(&input, &output, &protocol)?,
        Commands::Params { protocol, length } => params_command(&protocol, length)?,
        Commands::Loopback { protocol } => loopback_command(&protocol)?,
    }

    Ok(())
}

fn encode_command(
    input_path: &Path,
    output_path: &Path,
    protocol: &ProtocolArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(input_path)?;
    if data.is_empty() {
        return Err(CliError::EmptyInput(input_path.to_path_buf()).into());
    }
    println!("Read {} bytes from {}", data.len(), input_path.display());

    let mut engine = protocol.engine(EngineConfig::default())?;
    engine.init(&data)?;

    let mut pcm =
        vec![0u8; LEAD_SILENCE_FRAMES * engine.samples_per_frame_out() * engine.sample_size_bytes_out()];
    let mut frames = 0;
    while engine.send(&mut pcm) {
        frames += 1;
    }
    println!("Encoded to {} frames", frames);

    let spec = WavSpec {
        channels: 1,
        sample_rate: engine.sample_rate_out(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let file = File::create(output_path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for chunk in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_ne_bytes([chunk[0], chunk[1]]))?;
    }
    writer.finalize()?;

    println!(
        "Wrote {} samples at {} Hz to {}",
        pcm.len() / 2,
        spec.sample_rate,
        output_path.display()
    );
    Ok(())
}

fn read_wav(path: &Path) -> Result<(Vec<f32>, WavSpec), Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = hound::WavReader::new(file)?;
    let spec = reader.spec();

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => {
            let int_samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
            int_samples?
                .into_iter()
                .map(|s| s as f32 / 32768.0)
                .collect()
        }
        (hound::SampleFormat::Float, 32) => {
            let float_samples: Result<Vec<f32>, _> = reader.samples::<f32>().collect();
            float_samples?
        }
        (format, bits) => return Err(CliError::UnsupportedWav { bits, format }.into()),
    };

    Ok((samples, spec))
}

fn decode_command(
    input_path: &Path,
    output_path: &Path,
    protocol: &ProtocolArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let (samples, spec) = read_wav(input_path)?;
    println!(
        "Read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let mono = downmix(&samples, spec.channels as usize)?;
    let mut samples = resample(&mono, spec.sample_rate, BASE_SAMPLE_RATE)?;

    let mut engine = protocol.engine(EngineConfig::default())?;

    // Trailing silence lets a transmission cut short still finish recording
    let mode = engine.tx_mode();
    let tail = engine.parameters().frames_to_record(mode) * engine.samples_per_frame();
    samples.resize(samples.len() + tail, 0.0);

    let mut bytes = Vec::new();
    SampleFormat::F32.write_samples(&samples, &mut bytes);
    let mut air: VecDeque<u8> = bytes.into_iter().collect();

    loop {
        if engine.receive(&mut air) {
            break;
        }
        if air.is_empty() && engine.rx_state() != RxState::Analyzing {
            return Err(CliError::NothingDecoded(input_path.to_path_buf()).into());
        }
    }

    let data = engine.rx_data();
    println!(
        "Decoded {} bytes in {:.1} ms",
        data.len(),
        engine.average_rx_time_ms()
    );

    std::fs::write(output_path, data)?;
    println!("Wrote {} bytes to {}", data.len(), output_path.display());
    Ok(())
}

#[derive(Serialize)]
struct ParamsReport {
    protocol: String,
    mode: String,
    sample_rate: u32,
    samples_per_frame: usize,
    hz_per_bin: f32,
    freq_delta: usize,
    freq_start: usize,
    frames_per_tx: usize,
    bytes_per_tx: usize,
    volume: u8,
    slot_spacing: usize,
    bit0_offset: usize,
    marker_bins: Vec<[usize; 2]>,
    data_bins: Vec<[usize; 2]>,
    lowest_hz: f32,
    highest_hz: f32,
    bits_per_second: f32,
    frames_to_record: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_frames: Option<usize>,
}

fn params_command(
    protocol: &ProtocolArgs,
    length: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = protocol.engine(EngineConfig::default())?;
    let params = engine.parameters();
    let mode = engine.tx_mode();

    let marker_bins = (0..params.n_bits_in_marker)
        .map(|i| {
            let s = params.marker_slot(i);
            [s.bit1, s.bit0]
        })
        .collect();
    let data_bins = (0..params.n_data_bits)
        .map(|k| {
            let s = params.data_slot(k);
            [s.bit1, s.bit0]
        })
        .collect();

    let frame_secs = params.samples_per_frame as f32 / params.sample_rate_in as f32;
    let payload_frames = length.map(|len| {
        let encoded = match mode {
            TxMode::FixedLength => waveshare_core::DEFAULT_FIXED_LENGTH + waveshare_core::FIXED_ECC_BYTES,
            TxMode::VariableLength => {
                let len = len.min(waveshare_core::MAX_LENGTH);
                waveshare_core::ENCODED_LENGTH_BYTES + len + waveshare_core::ecc_bytes_for_length(len)
            }
        };
        params.total_frames_for(encoded)
    });

    let report = ParamsReport {
        protocol: format!("{:?}", protocol.protocol).to_lowercase(),
        mode: format!("{:?}", protocol.mode).to_lowercase(),
        sample_rate: params.sample_rate_in,
        samples_per_frame: params.samples_per_frame,
        hz_per_bin: params.hz_per_frame,
        freq_delta: params.settings.freq_delta,
        freq_start: params.settings.freq_start,
        frames_per_tx: params.frames_per_tx,
        bytes_per_tx: params.bytes_per_tx,
        volume: params.settings.volume,
        slot_spacing: params.slot_spacing,
        bit0_offset: params.bit0_offset,
        marker_bins,
        data_bins,
        lowest_hz: params.bin_hz(params.marker_slot(0).bit1),
        highest_hz: params.bin_hz(params.top_bin()),
        bits_per_second: params.n_data_bits as f32 / (params.frames_per_tx as f32 * frame_secs),
        frames_to_record: params.frames_to_record(mode),
        payload_frames,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// One end of the in-memory link: an engine plus the channel it plays into.
struct Station {
    name: &'static str,
    engine: Arc<Mutex<Engine>>,
    air: VecDeque<u8>,
    silence: Vec<u8>,
}

impl Station {
    fn new(name: &'static str, engine: Engine) -> Self {
        let silence = vec![0u8; engine.samples_per_frame_out() * engine.sample_size_bytes_out()];
        Self {
            name,
            engine: Arc::new(Mutex::new(engine)),
            air: VecDeque::new(),
            silence,
        }
    }
}

fn announce(name: &str, engine: &Engine) {
    println!("[{}] {}", name, String::from_utf8_lossy(engine.rx_data()));
}

/// One tick for `speaker`, which plays into its own channel and captures
/// `listener`'s. Returns whether the speaker is transmitting or mid-reception.
fn tick(speaker: &mut Station, listener: &mut Station) -> Result<bool, CliError> {
    let mut engine = speaker.engine.lock().map_err(|_| CliError::Poisoned)?;

    let transmitting = engine.link_state() == LinkState::Transmitting;
    if transmitting {
        // Half duplex: nothing is captured while speaking
        listener.air.clear();
    } else if listener.air.len() > MAX_QUEUED_FRAMES * listener.silence.len() {
        log::debug!("[{}] dropping stale capture", speaker.name);
        listener.air.clear();
    }

    if engine.poll(&mut speaker.air, &mut listener.air) {
        announce(speaker.name, &engine);
    }
    // Analysis pulls no samples; finish it within the tick
    while engine.rx_state() == RxState::Analyzing {
        if engine.receive(&mut listener.air) {
            announce(speaker.name, &engine);
        }
    }

    if !transmitting {
        // A quiet room still produces samples
        speaker.air.extend(speaker.silence.iter().copied());
    }

    Ok(engine.has_data() || engine.rx_state() != RxState::Listening)
}

fn loopback_command(protocol: &ProtocolArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig {
        sample_format_out: SampleFormat::F32,
        ..EngineConfig::default()
    };
    let mut alice = Station::new("alice", protocol.engine(config)?);
    let mut bob = Station::new("bob", protocol.engine(config)?);

    let done = Arc::new(AtomicBool::new(false));
    let input = {
        let shared = Arc::clone(&alice.engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                // Wait for the previous line to go out; init would replace it
                loop {
                    let Ok(mut engine) = shared.lock() else { return };
                    if !engine.has_data() {
                        if let Err(e) = engine.init(text.as_bytes()) {
                            log::error!("Cannot send {:?}: {}", text, e);
                        }
                        break;
                    }
                    drop(engine);
                    thread::sleep(LOOPBACK_IDLE);
                }
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    println!("Type a line to send it from alice to bob; EOF to quit");

    loop {
        let finished = done.load(Ordering::SeqCst);

        let alice_busy = tick(&mut alice, &mut bob)?;
        let bob_busy = tick(&mut bob, &mut alice)?;

        if !alice_busy && !bob_busy {
            if finished {
                break;
            }
            thread::sleep(LOOPBACK_IDLE);
        }
    }

    input.join().map_err(|_| CliError::InputThread)?;
    Ok(())
}

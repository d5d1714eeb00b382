//! Acoustic data link: short byte payloads in, multi-tone FSK audio out, and back.
//!
//! Every data bit owns a pair of FFT bins ("bit=1" and "bit=0"). A marker
//! pattern on reserved bins announces a transmission, Reed-Solomon parity
//! protects both the length field and the payload.
//!
//! The [`Engine`] is polled by a host once per tick: [`Engine::send`] emits one
//! frame into a [`SampleSink`], [`Engine::receive`] consumes one frame from a
//! [`SampleSource`].

pub mod audio_io;
pub mod decoder;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod fec;
pub mod params;
pub mod resample;
pub mod spectrum;
pub mod tones;

pub use audio_io::{FnSink, FnSource, SampleFormat, SampleSink, SampleSource};
pub use decoder::RxState;
pub use engine::{Engine, EngineConfig, LinkState};
pub use error::{Result, WaveShareError};
pub use params::{ProtocolParameters, TxMode, TxProtocol};

// Audio configuration
pub const BASE_SAMPLE_RATE: u32 = 48000;
pub const MAX_SAMPLES_PER_FRAME: usize = 1024;

// Payload limits
pub const MAX_DATA_BITS: usize = 256;
pub const MAX_DATA_SIZE: usize = 256;
pub const MAX_LENGTH: usize = 140;
pub const DEFAULT_FIXED_LENGTH: usize = 82;

// Rx buffers
pub const MAX_SPECTRUM_HISTORY: usize = 4;
pub const MAX_RECORDED_FRAMES: usize = 2048;

// FEC configuration
pub const FIXED_ECC_BYTES: usize = 32;
pub const LENGTH_FIELD_BYTES: usize = 1;
pub const LENGTH_ECC_BYTES: usize = 2;
pub const ENCODED_LENGTH_BYTES: usize = LENGTH_FIELD_BYTES + LENGTH_ECC_BYTES; // 3

// Frame layout
pub const MAX_FRAMES_PER_TX: usize = 16;
pub const N_BITS_IN_MARKER: usize = 16;
pub const N_MARKER_FRAMES: usize = 16;
pub const N_POST_MARKER_FRAMES: usize = 8;
pub const N_RAMP_FRAMES_BEGIN: usize = 2;
pub const N_RAMP_FRAMES_END: usize = 2;

// Marker detection
pub const MARKER_THRESHOLD: f32 = 3.0;
pub const MARKER_LOCK_FRAMES: usize = 3;

/// Parity bytes protecting a variable-length payload of `len` bytes.
///
/// `len < 4 ? 2 : max(4, 2 * (len / 5))`
pub fn ecc_bytes_for_length(len: usize) -> usize {
    if len < 4 {
        2
    } else {
        4usize.max(2 * (len / 5))
    }
}

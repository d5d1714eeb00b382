use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaveShareError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid codeword size: {size} bytes (expected {expected})")]
    InvalidCodewordSize { size: usize, expected: usize },

    #[error("Reed-Solomon decode failure: too many byte errors")]
    Uncorrectable,

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, WaveShareError>;

use crate::error::{Result, WaveShareError};

/// Largest codeword (data + parity) a GF(2^8) Reed-Solomon block can carry.
pub const RS_MAX_CODEWORD: usize = 255;

/// Reed-Solomon codec with a fixed number of parity bytes.
///
/// Corrects up to `ecc_len / 2` byte errors anywhere in the codeword. The
/// engine owns two of these: one for the length field and one for the
/// payload, rebuilt whenever the payload parity size changes.
pub struct FecCodec {
    ecc_len: usize,
    encoder: reed_solomon::Encoder,
    decoder: reed_solomon::Decoder,
}

impl FecCodec {
    pub fn new(ecc_len: usize) -> Result<Self> {
        if ecc_len == 0 || ecc_len >= RS_MAX_CODEWORD {
            return Err(WaveShareError::InvalidConfig(format!(
                "Reed-Solomon parity size {} out of range 1..{}",
                ecc_len, RS_MAX_CODEWORD
            )));
        }

        Ok(Self {
            ecc_len,
            encoder: reed_solomon::Encoder::new(ecc_len),
            decoder: reed_solomon::Decoder::new(ecc_len),
        })
    }

    /// Number of parity bytes appended to every codeword.
    pub fn ecc_len(&self) -> usize {
        self.ecc_len
    }

    /// Largest payload this codec accepts.
    pub fn max_payload(&self) -> usize {
        RS_MAX_CODEWORD - self.ecc_len
    }

    /// Encode `data` into `data ++ parity`.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() > self.max_payload() {
            return Err(WaveShareError::PayloadTooLarge {
                size: data.len(),
                max: self.max_payload(),
            });
        }

        let buffer = self.encoder.encode(data);
        Ok(buffer.to_vec())
    }

    /// Decode a codeword produced by [`FecCodec::encode`], correcting byte errors.
    ///
    /// Returns the data part only. Fails with [`WaveShareError::Uncorrectable`]
    /// when more than `ecc_len / 2` bytes are wrong.
    pub fn decode(&self, codeword: &[u8]) -> Result<Vec<u8>> {
        if codeword.len() <= self.ecc_len || codeword.len() > RS_MAX_CODEWORD {
            return Err(WaveShareError::InvalidCodewordSize {
                size: codeword.len(),
                expected: self.ecc_len + 1,
            });
        }

        let mut work = codeword.to_vec();
        let corrected = self
            .decoder
            .correct(&mut work, None)
            .map_err(|_| WaveShareError::Uncorrectable)?;

        // Reject results that are still not a valid codeword.
        if self.decoder.is_corrupted(&corrected) {
            return Err(WaveShareError::Uncorrectable);
        }

        Ok(corrected.data().to_vec())
    }
}

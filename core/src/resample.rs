//! Host-side helpers for getting arbitrary WAV audio into the engine's
//! capture format: channel downmix and linear-interpolation resampling.

use crate::error::{Result, WaveShareError};

/// Mix interleaved `channels`-channel audio down to mono by averaging.
pub fn downmix(samples: &[f32], channels: usize) -> Result<Vec<f32>> {
    if channels == 0 {
        return Err(WaveShareError::UnsupportedFormat(
            "audio must have at least one channel".to_string(),
        ));
    }
    if channels == 1 {
        return Ok(samples.to_vec());
    }
    if samples.len() % channels != 0 {
        return Err(WaveShareError::UnsupportedFormat(format!(
            "{} samples do not split into {} channels",
            samples.len(),
            channels
        )));
    }

    let norm = 1.0 / channels as f32;
    Ok(samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * norm)
        .collect())
}

/// Resample mono audio from `from_rate` to `to_rate` Hz using linear
/// interpolation.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(WaveShareError::UnsupportedFormat(
            "sample rate must be non-zero".to_string(),
        ));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let step = from_rate as f64 / to_rate as f64;
    let new_length = (samples.len() as f64 / step).ceil() as usize;
    let last = samples.len() - 1;

    let resampled = (0..new_length)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            if idx < last {
                samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
            } else {
                samples[last]
            }
        })
        .collect();

    Ok(resampled)
}

//! Sample-rate conversion using rubato's sinc resampler.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::Result;

const CHUNK_SIZE: usize = 1024;

/// Resample mono audio from `from_rate` to `to_rate`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    resample_by_ratio(samples, f64::from(to_rate) / f64::from(from_rate))
}

/// Resample by an arbitrary output/input ratio. The output holds
/// `round(len * ratio)` samples, aligned with the input (the filter delay
/// is removed).
pub fn resample_by_ratio(samples: &[f32], ratio: f64) -> Result<Vec<f32>> {
    let expected = (samples.len() as f64 * ratio).round() as usize;
    if samples.is_empty() || expected == 0 {
        return Ok(Vec::new());
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, 1)?;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + CHUNK_SIZE);
    let mut pos = 0;
    // Keep feeding (zero-padded) chunks until the delayed tail is flushed.
    while output.len() < expected + delay {
        let mut chunk = if pos < samples.len() {
            samples[pos..(pos + CHUNK_SIZE).min(samples.len())].to_vec()
        } else {
            Vec::new()
        };
        chunk.resize(CHUNK_SIZE, 0.0);
        let input = vec![chunk];

        let result = resampler.process(&input, None)?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
        pos += CHUNK_SIZE;
    }

    Ok(output.into_iter().skip(delay).take(expected).collect())
}

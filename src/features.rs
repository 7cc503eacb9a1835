//! Log-power mel-spectrogram features of a fixed size.

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::spectral::{mel_filterbank, Stft};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub n_mels: usize, // rows of the output
    pub n_fft: usize,
    pub hop_length: usize,
    pub frames: usize, // columns of the output
    pub top_db: Option<f32>, // dynamic range kept below the clip maximum
    pub pad_value: f32, // fill for frames past the end of the clip
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            n_mels: 128,
            n_fft: 2048,
            hop_length: 512,
            frames: 128,
            top_db: Some(80.0),
            pad_value: 0.0,
        }
    }
}

impl FeatureConfig {
    pub fn shape(&self) -> (usize, usize) {
        (self.n_mels, self.frames)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_mels == 0 || self.frames == 0 {
            return Err(Error::config("feature shape must be non-empty"));
        }
        if self.n_fft < 2 || self.n_fft % 2 != 0 {
            return Err(Error::config(format!(
                "n_fft must be an even number >= 2, got {}",
                self.n_fft
            )));
        }
        if self.hop_length == 0 {
            return Err(Error::config("hop_length must be positive"));
        }
        if matches!(self.top_db, Some(db) if !(db >= 0.0)) {
            return Err(Error::config("top_db must be non-negative"));
        }
        if !self.pad_value.is_finite() {
            return Err(Error::config("pad_value must be finite"));
        }
        Ok(())
    }
}

/// Waveform to (n_mels × frames) log-power mel spectrogram.
///
/// Holds the FFT plans and filterbank so repeated calls do no setup work;
/// the output depends only on the samples and the configuration.
#[derive(Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    sample_rate: u32,
    stft: Stft,
    mel_basis: Array2<f32>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig, sample_rate: u32) -> Result<Self> {
        config.validate()?;
        if sample_rate == 0 {
            return Err(Error::config("sample rate must be positive"));
        }
        let stft = Stft::new(config.n_fft, config.hop_length);
        let mel_basis = mel_filterbank(config.n_mels, config.n_fft, f64::from(sample_rate));
        Ok(Self {
            config,
            sample_rate,
            stft,
            mel_basis,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Mel power spectrogram, shape (n_mels, n_frames) with n_frames
    /// depending on the clip duration.
    pub fn mel_power(&self, samples: &[f32]) -> Array2<f32> {
        let power = self.stft.power(samples);
        self.mel_basis.dot(&power)
    }

    /// Full feature pipeline; the result is always exactly
    /// `config.shape()` and finite.
    pub fn extract(&self, samples: &[f32]) -> Result<Array2<f32>> {
        let log_mel = power_to_db(&self.mel_power(samples), self.config.top_db);
        self.fixed(&log_mel)
    }

    /// Legacy per-clip variant: the log-mel frames are z-scored with their
    /// own statistics before padding, so padded frames hold the fill value
    /// and do not bias the clip's mean or std.
    pub fn extract_per_clip(&self, samples: &[f32]) -> Result<Array2<f32>> {
        let log_mel = power_to_db(&self.mel_power(samples), self.config.top_db);
        self.fixed(&normalize_clip(&log_mel))
    }

    fn fixed(&self, spec: &Array2<f32>) -> Result<Array2<f32>> {
        let fixed = fix_length(spec, self.config.frames, self.config.pad_value);
        let expected = self.config.shape();
        if fixed.dim() != expected {
            return Err(Error::Shape {
                expected: vec![expected.0, expected.1],
                actual: fixed.shape().to_vec(),
            });
        }
        Ok(fixed)
    }
}

/// Convenience wrapper building a one-off extractor.
pub fn extract_features(
    samples: &[f32],
    sample_rate: u32,
    config: &FeatureConfig,
) -> Result<Array2<f32>> {
    FeatureExtractor::new(config.clone(), sample_rate)?.extract(samples)
}

/// Power to decibels relative to the spectrogram's own maximum.
pub fn power_to_db(power: &Array2<f32>, top_db: Option<f32>) -> Array2<f32> {
    const AMIN: f32 = 1e-10;

    let reference = power.iter().copied().fold(0.0f32, f32::max);
    let ref_db = 10.0 * reference.max(AMIN).log10();
    let mut log_spec = power.mapv(|p| 10.0 * p.max(AMIN).log10() - ref_db);

    if let Some(top_db) = top_db {
        let peak = log_spec.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let floor = peak - top_db;
        log_spec.mapv_inplace(|v| v.max(floor));
    }
    log_spec
}

/// Truncate or pad the time axis (columns) to exactly `frames`.
pub fn fix_length(spec: &Array2<f32>, frames: usize, pad_value: f32) -> Array2<f32> {
    let (rows, cols) = spec.dim();
    let keep = cols.min(frames);
    let mut fixed = Array2::from_elem((rows, frames), pad_value);
    fixed
        .slice_mut(s![.., ..keep])
        .assign(&spec.slice(s![.., ..keep]));
    fixed
}

/// Per-clip z-score normalization. A constant clip maps to zeros.
pub fn normalize_clip(spec: &Array2<f32>) -> Array2<f32> {
    let mean = spec.mean().unwrap_or(0.0);
    let std = spec.std(0.0);
    let std = if std > 0.0 && std.is_finite() { std } else { 1.0 };
    spec.mapv(|v| (v - mean) / std)
}

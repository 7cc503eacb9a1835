//! Waveform augmentation: time stretch, pitch shift and noise injection.

use std::f32::consts::PI;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use rand::distributions::Distribution;

use crate::error::{Error, Result};
use crate::resample::resample_by_ratio;
use crate::spectral::Stft;

const N_FFT: usize = 2048;
const HOP_LENGTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub enabled: bool,
    /// Time-stretch rates; > 1 speeds up, < 1 slows down.
    pub stretch_rates: Vec<f32>,
    /// Pitch shifts in semitones.
    pub pitch_steps: Vec<f32>,
    /// Standard deviation of the additive Gaussian noise; 0 disables it.
    pub noise_amplitude: f32,
    pub seed: u64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stretch_rates: vec![0.8, 1.2],
            pitch_steps: vec![2.0, -2.0],
            noise_amplitude: 0.005,
            seed: 42,
        }
    }
}

impl AugmentationConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.stretch_rates.iter().find(|r| !(**r > 0.0) || !r.is_finite()) {
            return Err(Error::config(format!(
                "time-stretch rate must be positive, got {rate}"
            )));
        }
        if self.pitch_steps.iter().any(|s| !s.is_finite()) {
            return Err(Error::config("pitch steps must be finite"));
        }
        if !(self.noise_amplitude >= 0.0) || !self.noise_amplitude.is_finite() {
            return Err(Error::config("noise amplitude must be non-negative"));
        }
        Ok(())
    }

    /// Number of synthetic waveforms produced per input.
    pub fn variants_per_input(&self) -> usize {
        self.stretch_rates.len()
            + self.pitch_steps.len()
            + usize::from(self.noise_amplitude > 0.0)
    }
}

/// Produces derived waveforms; the noise generator is seeded once so a run
/// over the same inputs in the same order is reproducible.
pub struct Augmenter {
    config: AugmentationConfig,
    rng: StdRng,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Result<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { config, rng })
    }

    /// Stretched variants, then pitch-shifted variants, then the noisy one.
    pub fn augment(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<Vec<f32>>> {
        let mut variants = Vec::with_capacity(self.config.variants_per_input());
        for &rate in &self.config.stretch_rates {
            variants.push(time_stretch(samples, rate)?);
        }
        for &steps in &self.config.pitch_steps {
            variants.push(pitch_shift(samples, sample_rate, steps)?);
        }
        if self.config.noise_amplitude > 0.0 {
            variants.push(add_noise(samples, self.config.noise_amplitude, &mut self.rng)?);
        }
        Ok(variants)
    }
}

/// Phase-vocoder time stretch. The result has `round(len / rate)` samples.
pub fn time_stretch(samples: &[f32], rate: f32) -> Result<Vec<f32>> {
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(Error::config(format!("time-stretch rate must be positive, got {rate}")));
    }
    let length = (samples.len() as f32 / rate).round() as usize;
    if samples.is_empty() || length == 0 {
        return Ok(Vec::new());
    }

    let stft = Stft::new(N_FFT, HOP_LENGTH);
    let spectrum = stft.forward(samples);
    let stretched = phase_vocoder(&spectrum, rate, HOP_LENGTH);
    Ok(stft.inverse(&stretched, length))
}

fn phase_vocoder(spectrum: &Array2<Complex<f32>>, rate: f32, hop_length: usize) -> Array2<Complex<f32>> {
    let (n_freqs, n_frames) = spectrum.dim();
    let steps: Vec<f32> = (0..)
        .map(|i| i as f32 * rate)
        .take_while(|&t| t < n_frames as f32)
        .collect();

    // Expected phase advance per hop for each bin.
    let phi_advance: Vec<f32> = (0..n_freqs)
        .map(|k| PI * hop_length as f32 * k as f32 / (n_freqs - 1).max(1) as f32)
        .collect();
    let frame = |t: usize, k: usize| {
        if t < n_frames {
            spectrum[[k, t]]
        } else {
            Complex::new(0.0, 0.0)
        }
    };

    let mut phase_acc: Vec<f32> = (0..n_freqs).map(|k| spectrum[[k, 0]].arg()).collect();
    let mut out = Array2::zeros((n_freqs, steps.len()));

    for (t, &step) in steps.iter().enumerate() {
        let base = step.floor() as usize;
        let alpha = step - step.floor();
        for k in 0..n_freqs {
            let (left, right) = (frame(base, k), frame(base + 1, k));
            let magnitude = (1.0 - alpha) * left.norm() + alpha * right.norm();
            out[[k, t]] = Complex::from_polar(magnitude, phase_acc[k]);

            let mut dphase = right.arg() - left.arg() - phi_advance[k];
            dphase -= 2.0 * PI * (dphase / (2.0 * PI)).round();
            phase_acc[k] += phi_advance[k] + dphase;
        }
    }
    out
}

/// Shift pitch by `n_steps` semitones keeping the duration.
pub fn pitch_shift(samples: &[f32], sample_rate: u32, n_steps: f32) -> Result<Vec<f32>> {
    if sample_rate == 0 {
        return Err(Error::config("sample rate must be positive"));
    }
    if samples.is_empty() || n_steps == 0.0 {
        return Ok(samples.to_vec());
    }
    let rate = 2f32.powf(-n_steps / 12.0);
    let stretched = time_stretch(samples, rate)?;
    let mut shifted = resample_by_ratio(&stretched, f64::from(rate))?;
    shifted.resize(samples.len(), 0.0);
    Ok(shifted)
}

/// Add zero-mean Gaussian noise with standard deviation `amplitude`.
pub fn add_noise(samples: &[f32], amplitude: f32, rng: &mut StdRng) -> Result<Vec<f32>> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| Error::config(e.to_string()))?;
    Ok(samples
        .iter()
        .map(|&s| s + amplitude * normal.sample(rng) as f32)
        .collect())
}

//! Short-time Fourier transforms and mel filterbanks.
//!
//! The conventions follow librosa: centered frames with zero padding of
//! `n_fft / 2` on both sides, periodic Hann window, Slaney mel scale with
//! area-normalized triangular filters.

use std::f32::consts::PI;
use std::sync::Arc;

use ndarray::{Array2, Axis};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

pub fn hann_window(length: usize) -> Vec<f32> {
    /* periodic Hann window (denominator is length, not length - 1) */
    (0..length)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / length as f32).cos())
        .collect()
}

/// Forward and inverse FFT plans for one frame size, plus the analysis window.
#[derive(Clone)]
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            n_fft,
            hop_length,
            window: hann_window(n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    pub fn n_freqs(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Number of frames produced for a signal of `len` samples.
    pub fn n_frames(&self, len: usize) -> usize {
        1 + len / self.hop_length
    }

    /// Complex spectrogram, shape (n_freqs, n_frames).
    ///
    /// An empty signal still yields one (all-zero) frame.
    pub fn forward(&self, samples: &[f32]) -> Array2<Complex<f32>> {
        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f32; pad];
        padded.extend_from_slice(samples);
        padded.resize(padded.len() + pad, 0.0);

        let n_frames = (padded.len() - self.n_fft) / self.hop_length + 1;
        let mut spectrum = Array2::zeros((self.n_freqs(), n_frames));
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];

        for (t, mut column) in spectrum.axis_iter_mut(Axis(1)).enumerate() {
            let start = t * self.hop_length;
            for (j, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + j] * self.window[j], 0.0);
            }
            self.forward.process(&mut buffer);
            for (bin, value) in column.iter_mut().zip(buffer.iter()) {
                *bin = *value;
            }
        }

        spectrum
    }

    /// Power spectrogram `|X|^2`, shape (n_freqs, n_frames).
    pub fn power(&self, samples: &[f32]) -> Array2<f32> {
        self.forward(samples).mapv(|c| c.norm_sqr())
    }

    /// Inverse of [`Stft::forward`]: windowed overlap-add normalized by the
    /// summed squared window, trimmed of the centering pad and fixed to
    /// `length` samples.
    pub fn inverse(&self, spectrum: &Array2<Complex<f32>>, length: usize) -> Vec<f32> {
        let n_frames = spectrum.ncols();
        let n_freqs = self.n_freqs();
        let total = self.n_fft + self.hop_length * n_frames.saturating_sub(1);
        let mut signal = vec![0.0f32; total];
        let mut window_sum = vec![0.0f32; total];
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let scale = 1.0 / self.n_fft as f32;

        for (t, column) in spectrum.axis_iter(Axis(1)).enumerate() {
            // Rebuild the full Hermitian spectrum from the positive half.
            for (k, slot) in buffer.iter_mut().enumerate() {
                *slot = if k < n_freqs {
                    column[k]
                } else {
                    column[self.n_fft - k].conj()
                };
            }
            self.inverse.process(&mut buffer);

            let start = t * self.hop_length;
            for (j, value) in buffer.iter().enumerate() {
                let w = self.window[j];
                signal[start + j] += value.re * scale * w;
                window_sum[start + j] += w * w;
            }
        }

        for (s, &w) in signal.iter_mut().zip(window_sum.iter()) {
            if w > f32::MIN_POSITIVE {
                *s /= w;
            }
        }

        let pad = self.n_fft / 2;
        let mut output: Vec<f32> = signal.into_iter().skip(pad).take(length).collect();
        output.resize(length, 0.0);
        output
    }
}

/// Slaney mel scale: linear below 1 kHz, logarithmic above.
pub fn hz_to_mel(f: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if f >= MIN_LOG_HZ {
        MIN_LOG_MEL + (f / MIN_LOG_HZ).ln() / logstep
    } else {
        f / F_SP
    }
}

pub fn mel_to_hz(m: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if m >= MIN_LOG_MEL {
        MIN_LOG_HZ * (logstep * (m - MIN_LOG_MEL)).exp()
    } else {
        F_SP * m
    }
}

/// Triangular mel filterbank, shape (n_mels, n_fft / 2 + 1), covering 0 Hz
/// to Nyquist. Each filter is normalized to unit area (Slaney norm).
pub fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: f64) -> Array2<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate / n_fft as f64)
        .collect();

    let mel_min = hz_to_mel(0.0);
    let mel_max = hz_to_mel(sample_rate / 2.0);
    let hz_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filterbank = Array2::zeros((n_mels, n_freqs));
    for (i, mut filter) in filterbank.axis_iter_mut(Axis(0)).enumerate() {
        let (left, center, right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
        let enorm = 2.0 / (right - left);
        for (weight, &f) in filter.iter_mut().zip(fft_freqs.iter()) {
            let lower = (f - left) / (center - left);
            let upper = (right - f) / (right - center);
            *weight = (lower.min(upper).max(0.0) * enorm) as f32;
        }
    }

    filterbank
}

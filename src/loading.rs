use std::fs;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader};
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resample::resample;

/// One decoded recording tagged with the label of its directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub label: u8,
    pub path: PathBuf,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, label: u8, path: impl Into<PathBuf>) -> Self {
        Self {
            samples,
            label,
            path: path.into(),
        }
    }

    /// Same label and path, different samples.
    pub fn derive(&self, samples: Vec<f32>) -> Self {
        Self {
            samples,
            label: self.label,
            path: self.path.clone(),
        }
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Audio files directly inside `dir` whose extension matches (case
/// insensitive), sorted by path.
pub fn list_audio_files(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::MissingDirectory(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, extensions) {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(Error::NoAudioFiles(dir.to_path_buf()));
    }
    Ok(files)
}

/// Decode a WAV file to mono f32 samples in [-1, 1] at `target_rate`.
pub fn load_wav(path: &Path, target_rate: u32) -> Result<Vec<f32>> {
    let decode_err = |e: hound::Error| Error::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let reader = WavReader::open(path).map_err(decode_err)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(decode_err)?,
        SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    let mono: Vec<f32> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    debug!(
        "decoded {} ({} Hz, {} ch, {} samples)",
        path.display(),
        spec.sample_rate,
        spec.channels,
        mono.len()
    );
    resample(&mono, spec.sample_rate, target_rate)
}

/// Load every audio file of one class directory. Files that fail to decode
/// are logged and skipped; the call only fails if nothing could be loaded.
pub fn load_class_dir(
    dir: &Path,
    label: u8,
    target_rate: u32,
    extensions: &[String],
) -> Result<Vec<Waveform>> {
    let files = list_audio_files(dir, extensions)?;

    let mut waveforms = Vec::with_capacity(files.len());
    for path in files {
        match load_wav(&path, target_rate) {
            Ok(samples) => waveforms.push(Waveform::new(samples, label, path)),
            Err(e) => warn!("skipping {}: {e}", path.display()),
        }
    }

    if waveforms.is_empty() {
        return Err(Error::NoAudioFiles(dir.to_path_buf()));
    }
    info!(
        "loaded {} recordings from {} (label {label})",
        waveforms.len(),
        dir.display()
    );
    Ok(waveforms)
}

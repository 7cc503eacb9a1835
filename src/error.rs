use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the classification pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Input directory does not exist.
    #[error("input directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    /// Directory exists but holds no decodable audio files.
    #[error("no audio files found in {}", .0.display())]
    NoAudioFiles(PathBuf),

    #[error("no features to assemble into a dataset")]
    EmptyDataset,

    /// A single audio file could not be decoded.
    #[error("failed to decode {}: {reason}", path.display())]
    Decode {
        path: PathBuf,
        reason: String,
    },

    /// A tensor does not have the expected dimensions.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Invalid hyperparameter or configuration value.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("resampling failed: {0}")]
    Resample(String),
}

impl Error {
    /// True for the input class of errors: missing data, or a file that
    /// could not be decoded or brought to the pipeline rate.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::MissingDirectory(_)
                | Error::NoAudioFiles(_)
                | Error::EmptyDataset
                | Error::Decode { .. }
                | Error::Resample(_)
        )
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

impl From<rubato::ResamplerConstructionError> for Error {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        Error::Resample(e.to_string())
    }
}

impl From<rubato::ResampleError> for Error {
    fn from(e: rubato::ResampleError) -> Self {
        Error::Resample(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Car vs. motorcycle sound classification.
//!
//! Recordings are decoded and resampled ([`loading`]), optionally augmented
//! ([`augment`]), turned into fixed-size log-mel spectrograms ([`features`]),
//! stacked and normalized ([`dataset`]) and used to fit a small convolutional
//! network ([`model`], [`train`]). Trained models are written as safetensors
//! with a JSON manifest, optionally int8 quantized ([`export`]), and evaluated
//! on labeled test directories ([`inference`]). [`pipeline`] wires the stages
//! together from a single [`PipelineConfig`].

pub mod augment;
pub mod config;
pub mod dataset;
pub mod error;
pub mod export;
pub mod features;
pub mod inference;
pub mod loading;
pub mod model;
pub mod pipeline;
pub mod resample;
pub mod spectral;
pub mod train;

pub use config::{ClassConfig, PipelineConfig};
pub use error::{Error, Result};
pub use features::{FeatureConfig, FeatureExtractor};
pub use inference::{InferenceReport, InferenceResult, InferenceRunner, Predictor};
pub use model::{Classifier, ModelConfig};
pub use pipeline::{run_inference, run_training, PipelineOutcome};

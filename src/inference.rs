//! Batch evaluation of a persisted model over labeled test directories.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::Array2;

use crate::dataset::{NormalizationPolicy, NormalizationStats};
use crate::error::Result;
use crate::export::LoadedModel;
use crate::features::FeatureExtractor;
use crate::loading::{list_audio_files, load_wav};
use crate::model::single_tensor;

const DECISION_THRESHOLD: f32 = 0.5;

/// Anything that maps one normalized spectrogram to the probability of
/// label 1.
pub trait Predictor {
    fn predict(&self, features: &Array2<f32>) -> Result<f32>;
}

impl Predictor for LoadedModel {
    fn predict(&self, features: &Array2<f32>) -> Result<f32> {
        let xs = single_tensor(features, self.device())?;
        let probs = self.predict_batch(&xs)?;
        Ok(probs.first().copied().unwrap_or(f32::NAN))
    }
}

impl<P: Predictor + ?Sized> Predictor for &P {
    fn predict(&self, features: &Array2<f32>) -> Result<f32> {
        (**self).predict(features)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// File name without its directory.
    pub file: String,
    pub predicted: u8,
    pub ground_truth: u8,
    /// Raw probability of label 1.
    pub confidence: f32,
    pub correct: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceReport {
    pub results: Vec<InferenceResult>,
    /// Display names ordered by label.
    pub class_names: Vec<String>,
}

impl InferenceReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn correct(&self) -> usize {
        self.results.iter().filter(|r| r.correct).count()
    }

    /// Percentage of correct predictions, None when nothing was predicted.
    pub fn accuracy(&self) -> Option<f32> {
        (self.total() > 0).then(|| self.correct() as f32 / self.total() as f32 * 100.0)
    }

    fn name(&self, label: u8) -> String {
        self.class_names
            .get(usize::from(label))
            .cloned()
            .unwrap_or_else(|| label.to_string())
    }
}

impl fmt::Display for InferenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(accuracy) = self.accuracy() else {
            return writeln!(f, "No predictions made.");
        };

        let rows: Vec<(String, String, String, &InferenceResult)> = self
            .results
            .iter()
            .map(|r| (r.file.clone(), self.name(r.predicted), self.name(r.ground_truth), r))
            .collect();
        let width = |header: &str, cells: Vec<usize>| cells.into_iter().max().unwrap_or(0).max(header.len());
        let file_w = width("File", rows.iter().map(|r| r.0.chars().count()).collect());
        let pred_w = width("Prediction", rows.iter().map(|r| r.1.chars().count()).collect());
        let truth_w = width("Ground Truth", rows.iter().map(|r| r.2.chars().count()).collect());

        writeln!(
            f,
            "{:<file_w$} {:<pred_w$} {:<truth_w$} {:<10} Correct",
            "File", "Prediction", "Ground Truth", "Confidence"
        )?;
        writeln!(f, "{}", "=".repeat(file_w + pred_w + truth_w + 20))?;
        for (file, predicted, truth, r) in &rows {
            writeln!(
                f,
                "{file:<file_w$} {predicted:<pred_w$} {truth:<truth_w$} {:<10.2} {}",
                r.confidence,
                if r.correct { "✔" } else { "✘" }
            )?;
        }
        writeln!(
            f,
            "\nAccuracy: {accuracy:.2}% ({}/{} correct)",
            self.correct(),
            self.total()
        )
    }
}

pub struct InferenceRunner<P> {
    predictor: P,
    extractor: FeatureExtractor,
    policy: NormalizationPolicy,
    stats: NormalizationStats,
    extensions: Vec<String>,
    class_names: Vec<String>,
}

impl<P: Predictor> InferenceRunner<P> {
    pub fn new(predictor: P, extractor: FeatureExtractor, stats: NormalizationStats) -> Self {
        Self {
            predictor,
            extractor,
            policy: NormalizationPolicy::default(),
            stats,
            extensions: vec!["wav".to_string()],
            class_names: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: NormalizationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_class_names(mut self, class_names: Vec<String>) -> Self {
        self.class_names = class_names;
        self
    }

    /// Probability of label 1 for one audio file.
    pub fn classify_file(&self, path: &Path) -> Result<f32> {
        let samples = load_wav(path, self.extractor.sample_rate())?;
        let normalized = match self.policy {
            NormalizationPolicy::TrainingStatistics => {
                self.stats.apply(&self.extractor.extract(&samples)?)
            }
            NormalizationPolicy::PerClip => self.extractor.extract_per_clip(&samples)?,
        };
        self.predictor.predict(&normalized)
    }

    /// Classify every file of each `(label, directory)` pair. Files that fail
    /// to decode are skipped; a missing directory is an error.
    pub fn run(&self, directories: &[(u8, PathBuf)]) -> Result<InferenceReport> {
        let mut results = Vec::new();
        for (label, dir) in directories {
            for path in list_audio_files(dir, &self.extensions)? {
                debug!("processing {}", path.display());
                let confidence = match self.classify_file(&path) {
                    Ok(p) => p,
                    Err(e) if e.is_input_error() => {
                        warn!("skipping {}: {e}", path.display());
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let predicted = u8::from(confidence >= DECISION_THRESHOLD);
                results.push(InferenceResult {
                    file: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    predicted,
                    ground_truth: *label,
                    confidence,
                    correct: predicted == *label,
                });
            }
        }

        let report = InferenceReport {
            results,
            class_names: self.class_names.clone(),
        };
        match report.accuracy() {
            Some(acc) => info!(
                "inference on {} files: {acc:.2}% correct",
                report.total()
            ),
            None => info!("inference produced no predictions"),
        }
        Ok(report)
    }
}

impl InferenceRunner<LoadedModel> {
    /// Runner fed by everything recorded in the model's manifest.
    pub fn from_model(model: LoadedModel) -> Result<Self> {
        let manifest = model.manifest.clone();
        let extractor = FeatureExtractor::new(manifest.features, manifest.sample_rate)?;
        Ok(Self::new(model, extractor, manifest.normalization).with_class_names(manifest.class_names))
    }
}

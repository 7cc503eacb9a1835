//! Pipeline configuration, read from TOML. Every section falls back to its
//! defaults so partial files are accepted.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::augment::AugmentationConfig;
use crate::dataset::{NormalizationPolicy, SplitConfig};
use crate::error::{Error, Result};
use crate::export::ExportConfig;
use crate::features::FeatureConfig;
use crate::model::ModelConfig;
use crate::train::TrainingConfig;

/// One labeled class and where its recordings live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    pub label: u8,
    pub train_dir: PathBuf,
    pub test_dir: PathBuf,
}

impl ClassConfig {
    pub fn new(
        name: impl Into<String>,
        label: u8,
        train_dir: impl Into<PathBuf>,
        test_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            label,
            train_dir: train_dir.into(),
            test_dir: test_dir.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Every recording is resampled to this rate.
    pub sample_rate: u32,
    /// Accepted file extensions, case insensitive.
    pub extensions: Vec<String>,
    pub normalization: NormalizationPolicy,
    pub classes: Vec<ClassConfig>,
    pub features: FeatureConfig,
    pub augmentation: AugmentationConfig,
    pub split: SplitConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub export: ExportConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            extensions: vec!["wav".to_string()],
            normalization: NormalizationPolicy::default(),
            classes: vec![
                ClassConfig::new("Car", 0, "car-sounds", "test-data/car-test"),
                ClassConfig::new("Motorcycle", 1, "bike-sounds", "test-data/bike-test"),
            ],
            features: FeatureConfig::default(),
            augmentation: AugmentationConfig::default(),
            split: SplitConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::config("sample rate must be positive"));
        }
        if self.extensions.is_empty() {
            return Err(Error::config("at least one audio extension is required"));
        }

        let mut labels: Vec<u8> = self.classes.iter().map(|c| c.label).collect();
        labels.sort_unstable();
        if labels != [0, 1] {
            return Err(Error::config(format!(
                "exactly two classes labeled 0 and 1 are required, got labels {labels:?}"
            )));
        }

        self.features.validate()?;
        self.augmentation.validate()?;
        self.split.validate()?;
        self.model.validate(self.features.shape())?;
        self.training.validate()?;
        self.export.validate()
    }

    pub fn classes_by_label(&self) -> Vec<&ClassConfig> {
        let mut classes: Vec<&ClassConfig> = self.classes.iter().collect();
        classes.sort_by_key(|c| c.label);
        classes
    }

    pub fn class_names(&self) -> Vec<String> {
        self.classes_by_label()
            .into_iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// `(label, test directory)` pairs in label order.
    pub fn test_directories(&self) -> Vec<(u8, PathBuf)> {
        self.classes_by_label()
            .into_iter()
            .map(|c| (c.label, c.test_dir.clone()))
            .collect()
    }
}

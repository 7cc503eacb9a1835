//! End-to-end training and evaluation driven by one [`PipelineConfig`].

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use log::{debug, info};
use ndarray::Array2;

use crate::augment::Augmenter;
use crate::config::PipelineConfig;
use crate::dataset::{assemble, split, AssembledDataset, NormalizationStats};
use crate::error::Result;
use crate::export::{self, ModelManifest, QuantizationInfo};
use crate::features::FeatureExtractor;
use crate::inference::{InferenceReport, InferenceRunner};
use crate::loading::{load_class_dir, Waveform};
use crate::train::{self, History};

/// What a training run produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub model_path: PathBuf,
    pub quantized_path: Option<PathBuf>,
    pub quantization: Option<QuantizationInfo>,
    pub history_path: PathBuf,
    pub history: History,
    pub stats: NormalizationStats,
    pub train_samples: usize,
    pub validation_samples: usize,
}

/// Decoded recordings grouped by label.
pub fn load_corpus(config: &PipelineConfig) -> Result<Vec<Vec<Waveform>>> {
    config
        .classes_by_label()
        .into_iter()
        .map(|class| {
            info!("loading class {} from {}", class.name, class.train_dir.display());
            load_class_dir(
                &class.train_dir,
                class.label,
                config.sample_rate,
                &config.extensions,
            )
        })
        .collect()
}

/// Originals followed by their synthetic variants, per class.
pub fn augment_corpus(
    corpus: Vec<Vec<Waveform>>,
    augmenter: &mut Augmenter,
    sample_rate: u32,
) -> Result<Vec<Vec<Waveform>>> {
    let mut augmented = Vec::with_capacity(corpus.len());
    for waveforms in corpus {
        let mut variants = Vec::new();
        for waveform in &waveforms {
            for samples in augmenter.augment(&waveform.samples, sample_rate)? {
                variants.push(waveform.derive(samples));
            }
        }
        debug!(
            "augmented {} recordings into {} variants",
            waveforms.len(),
            variants.len()
        );
        let mut class = waveforms;
        class.extend(variants);
        augmented.push(class);
    }
    Ok(augmented)
}

pub fn extract_corpus(
    corpus: &[Vec<Waveform>],
    extractor: &FeatureExtractor,
) -> Result<Vec<Vec<Array2<f32>>>> {
    corpus
        .iter()
        .map(|waveforms| {
            waveforms
                .iter()
                .map(|w| extractor.extract(&w.samples))
                .collect::<Result<Vec<_>>>()
        })
        .collect()
}

/// Load, optionally augment, extract and assemble the training corpus.
pub fn build_dataset(config: &PipelineConfig) -> Result<AssembledDataset> {
    let mut corpus = load_corpus(config)?;
    if config.augmentation.enabled {
        let mut augmenter = Augmenter::new(config.augmentation.clone())?;
        corpus = augment_corpus(corpus, &mut augmenter, config.sample_rate)?;
    }

    let extractor = FeatureExtractor::new(config.features.clone(), config.sample_rate)?;
    let features = extract_corpus(&corpus, &extractor)?;
    let assembled = assemble(&features, config.features.shape())?;
    info!(
        "dataset: {} samples {:?}, mean {:.3}, std {:.3}",
        assembled.data.len(),
        assembled.data.class_counts(),
        assembled.stats.mean,
        assembled.stats.std
    );
    Ok(assembled)
}

pub fn manifest_for(config: &PipelineConfig, stats: NormalizationStats) -> ModelManifest {
    ModelManifest {
        model: config.model.clone(),
        features: config.features.clone(),
        sample_rate: config.sample_rate,
        normalization: stats,
        class_names: config.class_names(),
        quantization: None,
    }
}

/// Train a model from the configured class directories and write every
/// artifact to the export directory.
pub fn run_training(config: &PipelineConfig, device: &Device) -> Result<PipelineOutcome> {
    config.validate()?;

    let assembled = build_dataset(config)?;
    let parts = split(&assembled.data, &config.split)?;
    info!(
        "split: {} train, {} validation",
        parts.train.len(),
        parts.validation.len()
    );

    let trained = train::train(
        &parts.train,
        &parts.validation,
        &config.model,
        &config.training,
        device,
    )?;

    let out_dir = &config.export.out_dir;
    fs::create_dir_all(out_dir)?;
    let manifest = manifest_for(config, assembled.stats);

    let model_path = config.export.model_path();
    export::save_full(&trained, &manifest, &model_path)?;

    let (quantized_path, quantization) = if config.export.quantize {
        let path = config.export.quantized_path();
        let info = export::save_quantized(
            &trained,
            &manifest,
            &parts.train,
            config.export.representative_samples,
            &path,
            device,
        )?;
        (Some(path), Some(info))
    } else {
        (None, None)
    };

    let history_path = out_dir.join("history.json");
    trained.history.save_json(&history_path)?;

    Ok(PipelineOutcome {
        model_path,
        quantized_path,
        quantization,
        history_path,
        history: trained.history,
        stats: assembled.stats,
        train_samples: parts.train.len(),
        validation_samples: parts.validation.len(),
    })
}

/// Evaluate a saved model on the configured test directories.
pub fn run_inference(
    config: &PipelineConfig,
    model_path: &Path,
    device: &Device,
) -> Result<InferenceReport> {
    let model = export::load(model_path, device)?;
    let runner = InferenceRunner::from_model(model)?
        .with_policy(config.normalization)
        .with_extensions(config.extensions.clone());
    runner.run(&config.test_directories())
}

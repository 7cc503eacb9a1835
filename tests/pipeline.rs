use std::cell::RefCell;
use std::f32::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use engine_sounds::config::ClassConfig;
use engine_sounds::dataset::{Dataset, NormalizationPolicy, NormalizationStats};
use engine_sounds::export::{self, ModelManifest};
use engine_sounds::model::{batch_tensor, NoHook};
use engine_sounds::pipeline::build_dataset;
use engine_sounds::train::{train, TrainingConfig};
use engine_sounds::{
    Classifier, Error, FeatureConfig, FeatureExtractor, InferenceRunner, ModelConfig,
    PipelineConfig, Predictor,
};

const SR: u32 = 22050;

fn write_tone(path: &Path, freq: f32, seconds: f32) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SR,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let n = (seconds * SR as f32) as usize;
    for i in 0..n {
        let v = 0.4 * (2.0 * PI * freq * i as f32 / SR as f32).sin();
        writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Four clips of 0.5, 1, 2 and 3 seconds in each class directory.
fn corpus(root: &Path) -> (PathBuf, PathBuf) {
    let cars = root.join("car-sounds");
    let bikes = root.join("bike-sounds");
    fs::create_dir_all(&cars).unwrap();
    fs::create_dir_all(&bikes).unwrap();
    for (i, seconds) in [0.5, 1.0, 2.0, 3.0].into_iter().enumerate() {
        write_tone(&cars.join(format!("car_{i}.wav")), 110.0, seconds);
        write_tone(&bikes.join(format!("bike_{i}.wav")), 880.0, seconds);
    }
    (cars, bikes)
}

fn config_for(root: &Path, cars: &Path, bikes: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.classes = vec![
        ClassConfig::new("Car", 0, cars, cars),
        ClassConfig::new("Motorcycle", 1, bikes, bikes),
    ];
    config.model = ModelConfig::minimal();
    config.training = TrainingConfig {
        batch_size: 4,
        epochs: 2,
        ..Default::default()
    };
    config.export.out_dir = root.join("out");
    config
}

fn noise_dataset(n: usize, size: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array4::from_shape_fn((n, size, size, 1), |_| rng.gen_range(-1.0f32..1.0));
    let y = (0..n).map(|i| (i % 2) as u8).collect();
    Dataset::new(x, y).unwrap()
}

fn small_manifest(stats: NormalizationStats) -> ModelManifest {
    ModelManifest {
        model: ModelConfig::minimal(),
        features: FeatureConfig {
            n_mels: 32,
            frames: 32,
            ..Default::default()
        },
        sample_rate: SR,
        normalization: stats,
        class_names: vec!["Car".into(), "Motorcycle".into()],
        quantization: None,
    }
}

#[test]
fn test_assembles_eight_clips() {
    let dir = TempDir::new().unwrap();
    let (cars, bikes) = corpus(dir.path());
    let config = config_for(dir.path(), &cars, &bikes);

    let assembled = build_dataset(&config).unwrap();
    assert_eq!(assembled.data.x.dim(), (8, 128, 128, 1));
    assert_eq!(assembled.data.y, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    assert!(assembled.data.x.iter().all(|v| v.is_finite()));

    let mean = assembled.data.x.mean().unwrap();
    assert!(mean.abs() < 1e-3);
}

#[test]
fn test_augmentation_multiplies_corpus() {
    let dir = TempDir::new().unwrap();
    let (cars, bikes) = corpus(dir.path());
    let mut config = config_for(dir.path(), &cars, &bikes);
    config.augmentation.enabled = true;

    let assembled = build_dataset(&config).unwrap();
    // each clip plus five variants
    assert_eq!(assembled.data.len(), 48);
    let counts = assembled.data.class_counts();
    assert_eq!(counts[&0], 24);
    assert_eq!(counts[&1], 24);
}

#[test]
fn test_missing_class_directory() {
    let dir = TempDir::new().unwrap();
    let (cars, _) = corpus(dir.path());
    let missing = dir.path().join("nope");
    let config = config_for(dir.path(), &cars, &missing);

    let err = build_dataset(&config).unwrap_err();
    assert!(err.is_input_error());
}

struct Fixed(f32);

impl Predictor for Fixed {
    fn predict(&self, _features: &Array2<f32>) -> engine_sounds::Result<f32> {
        Ok(self.0)
    }
}

#[test]
fn test_runner_with_fixed_predictor() {
    let dir = TempDir::new().unwrap();
    let cars = dir.path().join("car-test");
    fs::create_dir_all(&cars).unwrap();
    write_tone(&cars.join("only.wav"), 200.0, 1.0);

    let extractor = FeatureExtractor::new(FeatureConfig::default(), SR).unwrap();
    let runner = InferenceRunner::new(Fixed(0.9), extractor, NormalizationStats { mean: 0.0, std: 1.0 })
        .with_class_names(vec!["Car".into(), "Motorcycle".into()]);
    let report = runner.run(&[(0, cars)]).unwrap();

    assert_eq!(report.total(), 1);
    let result = &report.results[0];
    assert_eq!(result.file, "only.wav");
    assert_eq!(result.predicted, 1);
    assert_eq!(result.ground_truth, 0);
    assert!(!result.correct);
    assert!((result.confidence - 0.9).abs() < 1e-6);
    assert_eq!(report.accuracy(), Some(0.0));

    let text = report.to_string();
    assert!(text.contains("Motorcycle"));
    assert!(text.contains("0.90"));
    assert!(text.ends_with("Accuracy: 0.00% (0/1 correct)\n"));
}

/// Keeps the last spectrogram it was asked about.
struct Capture(RefCell<Option<Array2<f32>>>);

impl Predictor for Capture {
    fn predict(&self, features: &Array2<f32>) -> engine_sounds::Result<f32> {
        *self.0.borrow_mut() = Some(features.clone());
        Ok(0.2)
    }
}

#[test]
fn test_per_clip_policy_leaves_padding_at_zero() {
    let dir = TempDir::new().unwrap();
    let cars = dir.path().join("car-test");
    fs::create_dir_all(&cars).unwrap();
    write_tone(&cars.join("short.wav"), 440.0, 0.5);

    let capture = Capture(RefCell::new(None));
    let extractor = FeatureExtractor::new(FeatureConfig::default(), SR).unwrap();
    let runner = InferenceRunner::new(&capture, extractor, NormalizationStats { mean: -40.0, std: 10.0 })
        .with_policy(NormalizationPolicy::PerClip);
    let report = runner.run(&[(0, cars)]).unwrap();
    assert_eq!(report.correct(), 1);

    let features = capture.0.borrow_mut().take().unwrap();
    let signal_frames = 1 + (SR as usize / 2) / 512;
    for col in signal_frames..128 {
        assert!(features.column(col).iter().all(|&v| v == 0.0));
    }
    assert!(features.column(0).iter().any(|&v| v != 0.0));
}

#[test]
fn test_runner_skips_undecodable_files() {
    let dir = TempDir::new().unwrap();
    let bikes = dir.path().join("bike-test");
    fs::create_dir_all(&bikes).unwrap();
    write_tone(&bikes.join("good.wav"), 600.0, 0.5);
    fs::write(bikes.join("broken.wav"), b"not a wav file").unwrap();

    let extractor = FeatureExtractor::new(FeatureConfig::default(), SR).unwrap();
    let runner = InferenceRunner::new(Fixed(0.9), extractor, NormalizationStats { mean: 0.0, std: 1.0 })
        .with_policy(NormalizationPolicy::PerClip);
    let report = runner.run(&[(1, bikes)]).unwrap();
    assert_eq!(report.total(), 1);
    assert_eq!(report.accuracy(), Some(100.0));
}

#[test]
fn test_runner_with_no_files() {
    let dir = TempDir::new().unwrap();
    let extractor = FeatureExtractor::new(FeatureConfig::default(), SR).unwrap();
    let runner = InferenceRunner::new(Fixed(0.1), extractor, NormalizationStats { mean: 0.0, std: 1.0 });
    let err = runner.run(&[(0, dir.path().to_path_buf())]).unwrap_err();
    assert!(matches!(err, Error::NoAudioFiles(_)));
}

#[test]
fn test_saved_model_reloads_with_identical_predictions() {
    let device = Device::Cpu;
    let data = noise_dataset(8, 32, 11);
    let trained = train(
        &data.select(&[0, 1, 2, 3, 4, 5]),
        &data.select(&[6, 7]),
        &ModelConfig::minimal(),
        &TrainingConfig {
            batch_size: 4,
            epochs: 2,
            ..Default::default()
        },
        &device,
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.safetensors");
    let stats = NormalizationStats { mean: -3.0, std: 2.5 };
    export::save_full(&trained, &small_manifest(stats), &path).unwrap();
    assert!(dir.path().join("model.json").is_file());

    let loaded = export::load(&path, &device).unwrap();
    assert!(!loaded.is_quantized());
    assert_eq!(loaded.manifest.normalization, stats);

    let xs = batch_tensor(&data.x, &[0, 1, 2, 3, 4, 5, 6, 7], &device).unwrap();
    let before = trained.model.predict_proba(&xs, &mut NoHook).unwrap();
    let after = loaded.predict_batch(&xs).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_quantized_model_tracks_full_precision() {
    let device = Device::Cpu;
    let data = noise_dataset(12, 32, 5);
    let trained = train(
        &data,
        &data.select(&[]),
        &ModelConfig::minimal(),
        &TrainingConfig {
            batch_size: 4,
            epochs: 1,
            ..Default::default()
        },
        &device,
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model.int8.safetensors");
    let stats = NormalizationStats { mean: 0.0, std: 1.0 };
    let info = export::save_quantized(&trained, &small_manifest(stats), &data, 100, &path, &device).unwrap();
    assert_eq!(info.calibration_samples, 12);
    assert_eq!(info.activation_ranges.len(), 2);

    let loaded = export::load(&path, &device).unwrap();
    assert!(loaded.is_quantized());

    let indices: Vec<usize> = (0..12).collect();
    let xs = batch_tensor(&data.x, &indices, &device).unwrap();
    let full = trained.model.predict_proba(&xs, &mut NoHook).unwrap();
    let quantized = loaded.predict_batch(&xs).unwrap();
    for (a, b) in full.iter().zip(&quantized) {
        assert!((a - b).abs() < 0.1, "{a} vs {b}");
    }

    // the predictor interface sees the same numbers
    let single = data.sample(0).index_axis(ndarray::Axis(2), 0).to_owned();
    let p = loaded.predict(&single).unwrap();
    assert!((p - quantized[0]).abs() < 1e-5);
}

#[test]
fn test_quantization_needs_representative_data() {
    let device = Device::Cpu;
    let varmap = candle_nn::VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Classifier::new(&ModelConfig::minimal(), (32, 32), vb).unwrap();
    let trained = engine_sounds::train::TrainedModel {
        varmap,
        model,
        input_shape: (32, 32),
        history: Default::default(),
    };

    let dir = TempDir::new().unwrap();
    let empty = noise_dataset(2, 32, 0).select(&[]);
    let err = export::save_quantized(
        &trained,
        &small_manifest(NormalizationStats { mean: 0.0, std: 1.0 }),
        &empty,
        100,
        &dir.path().join("q.safetensors"),
        &device,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn test_train_then_infer_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (cars, bikes) = corpus(dir.path());
    let mut config = config_for(dir.path(), &cars, &bikes);
    config.export.quantize = true;

    let outcome = engine_sounds::run_training(&config, &Device::Cpu).unwrap();
    assert_eq!(outcome.train_samples, 6);
    assert_eq!(outcome.validation_samples, 2);
    assert_eq!(outcome.history.len(), 2);
    assert!(outcome.history.accuracy().iter().all(|a| (0.0..=1.0).contains(a)));
    assert!(outcome.model_path.is_file());
    assert!(outcome.history_path.is_file());
    let quantized = outcome.quantized_path.unwrap();
    assert!(quantized.is_file());
    assert!(export::manifest_path(&quantized).is_file());

    for model in [outcome.model_path, quantized] {
        let report = engine_sounds::run_inference(&config, &model, &Device::Cpu).unwrap();
        assert_eq!(report.total(), 8);
        assert!(report.results.iter().all(|r| (0.0..=1.0).contains(&r.confidence)));
    }
}

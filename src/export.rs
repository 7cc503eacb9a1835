//! Persisting trained models: full-precision safetensors and an int8
//! post-training-quantized variant, each with a JSON manifest sidecar.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, NormalizationStats};
use crate::error::{Error, Result};
use crate::features::FeatureConfig;
use crate::model::{batch_tensor, ActivationHook, Classifier, ModelConfig, NoHook};
use crate::train::TrainedModel;

const CALIBRATION_BATCH: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub out_dir: PathBuf,
    pub model_file: String,
    pub quantize: bool,
    pub quantized_file: String,
    /// Training tensors used to calibrate activation ranges.
    pub representative_samples: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            model_file: "model.safetensors".to_string(),
            quantize: false,
            quantized_file: "model.int8.safetensors".to_string(),
            representative_samples: 100,
        }
    }
}

impl ExportConfig {
    pub fn model_path(&self) -> PathBuf {
        self.out_dir.join(&self.model_file)
    }

    pub fn quantized_path(&self) -> PathBuf {
        self.out_dir.join(&self.quantized_file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantize && self.representative_samples == 0 {
            return Err(Error::config(
                "quantization needs at least one representative sample",
            ));
        }
        Ok(())
    }
}

/// Calibrated activation ranges of a quantized artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub calibration_samples: usize,
    /// (min, max) of the input and of each block output.
    pub activation_ranges: Vec<(f32, f32)>,
}

/// Everything needed to rebuild and feed a saved model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub model: ModelConfig,
    pub features: FeatureConfig,
    pub sample_rate: u32,
    pub normalization: NormalizationStats,
    /// Display names ordered by label.
    pub class_names: Vec<String>,
    #[serde(default)]
    pub quantization: Option<QuantizationInfo>,
}

impl ModelManifest {
    pub fn input_shape(&self) -> (usize, usize) {
        self.features.shape()
    }

    pub fn class_name(&self, label: u8) -> &str {
        self.class_names
            .get(usize::from(label))
            .map_or("?", String::as_str)
    }
}

/// Sidecar manifest path for a model file (`model.safetensors` -> `model.json`).
pub fn manifest_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("json")
}

fn write_manifest(manifest: &ModelManifest, model_path: &Path) -> Result<()> {
    fs::write(
        manifest_path(model_path),
        serde_json::to_string_pretty(manifest)?,
    )?;
    Ok(())
}

pub fn read_manifest(model_path: &Path) -> Result<ModelManifest> {
    let text = fs::read_to_string(manifest_path(model_path))?;
    Ok(serde_json::from_str(&text)?)
}

fn named_parameters(varmap: &VarMap) -> Result<Vec<(String, Tensor)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".into()))?;
    let mut params: Vec<(String, Tensor)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

fn is_quantizable(name: &str, tensor: &Tensor) -> bool {
    name.ends_with("weight") && !name.contains(".norm.") && tensor.rank() >= 2
}

pub fn save_full(trained: &TrainedModel, manifest: &ModelManifest, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    trained.varmap.save(path)?;
    let manifest = ModelManifest {
        quantization: None,
        ..manifest.clone()
    };
    write_manifest(&manifest, path)?;
    info!("saved model to {}", path.display());
    Ok(())
}

/// Symmetric per-output-channel int8, stored as u8 with an offset of 128.
/// Returns the codes and the (out_channels,) scales.
pub fn quantize_weight(weight: &Tensor) -> Result<(Tensor, Tensor)> {
    let out = weight.dim(0)?;
    let flat = weight.flatten_from(1)?;
    let scale = flat
        .abs()?
        .max_keepdim(1)?
        .affine(1.0 / 127.0, 0.0)?
        .maximum(1e-12f32)?;
    let codes = flat
        .broadcast_div(&scale)?
        .round()?
        .clamp(-127f32, 127f32)?
        .affine(1.0, 128.0)?
        .to_dtype(DType::U8)?
        .reshape(weight.shape())?;
    Ok((codes, scale.reshape(out)?))
}

pub fn dequantize_weight(codes: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let shape = codes.shape().clone();
    let out = codes.dim(0)?;
    let flat = codes
        .to_dtype(DType::F32)?
        .affine(1.0, -128.0)?
        .flatten_from(1)?;
    Ok(flat
        .broadcast_mul(&scale.reshape((out, 1))?)?
        .reshape(shape)?)
}

/// Records the global (min, max) seen at each activation slot.
struct RangeObserver {
    ranges: Vec<Option<(f32, f32)>>,
}

impl ActivationHook for RangeObserver {
    fn activation(&mut self, index: usize, xs: Tensor) -> candle_core::Result<Tensor> {
        let flat = xs.flatten_all()?;
        let lo = flat.min(0)?.to_scalar::<f32>()?;
        let hi = flat.max(0)?.to_scalar::<f32>()?;
        if self.ranges.len() <= index {
            self.ranges.resize(index + 1, None);
        }
        self.ranges[index] = Some(match self.ranges[index] {
            Some((a, b)) => (a.min(lo), b.max(hi)),
            None => (lo, hi),
        });
        Ok(xs)
    }
}

/// Rounds activations onto a uint8 grid spanning the calibrated range.
pub struct FakeQuantize<'a> {
    ranges: &'a [(f32, f32)],
}

impl<'a> FakeQuantize<'a> {
    pub fn new(ranges: &'a [(f32, f32)]) -> Self {
        Self { ranges }
    }
}

impl ActivationHook for FakeQuantize<'_> {
    fn activation(&mut self, index: usize, xs: Tensor) -> candle_core::Result<Tensor> {
        let Some(&(lo, hi)) = self.ranges.get(index) else {
            return Ok(xs);
        };
        if !(hi > lo) {
            return Ok(xs);
        }
        let scale = f64::from(hi - lo) / 255.0;
        let lo = f64::from(lo);
        xs.affine(1.0 / scale, -lo / scale)?
            .round()?
            .clamp(0f32, 255f32)?
            .affine(scale, lo)
    }
}

/// Run up to `max_samples` representative tensors through the model and
/// collect activation ranges.
pub fn calibrate(
    model: &Classifier,
    representative: &Dataset,
    max_samples: usize,
    device: &Device,
) -> Result<QuantizationInfo> {
    let sample = representative.head(max_samples);
    if sample.is_empty() {
        return Err(Error::config(
            "quantization calibration needs at least one representative sample",
        ));
    }

    let mut observer = RangeObserver {
        ranges: vec![None; model.activation_count()],
    };
    let indices: Vec<usize> = (0..sample.len()).collect();
    for batch in indices.chunks(CALIBRATION_BATCH) {
        let xs = batch_tensor(&sample.x, batch, device)?;
        model.forward_hooked(&xs, false, &mut observer)?;
    }

    Ok(QuantizationInfo {
        calibration_samples: sample.len(),
        activation_ranges: observer
            .ranges
            .into_iter()
            .map(|r| r.unwrap_or((0.0, 0.0)))
            .collect(),
    })
}

/// Write the int8 artifact: quantized kernels, f16 remaining parameters and
/// calibrated activation ranges in the manifest.
pub fn save_quantized(
    trained: &TrainedModel,
    manifest: &ModelManifest,
    representative: &Dataset,
    max_samples: usize,
    path: &Path,
    device: &Device,
) -> Result<QuantizationInfo> {
    let info = calibrate(&trained.model, representative, max_samples, device)?;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for (name, tensor) in named_parameters(&trained.varmap)? {
        if is_quantizable(&name, &tensor) {
            let (codes, scale) = quantize_weight(&tensor)?;
            tensors.insert(format!("{name}.scale"), scale);
            tensors.insert(name, codes);
        } else {
            tensors.insert(name, tensor.to_dtype(DType::F16)?);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(&tensors, path)?;
    let manifest = ModelManifest {
        quantization: Some(info.clone()),
        ..manifest.clone()
    };
    write_manifest(&manifest, path)?;

    info!(
        "saved int8 model to {} (calibrated on {} samples, {} bytes)",
        path.display(),
        info.calibration_samples,
        fs::metadata(path)?.len()
    );
    Ok(info)
}

pub struct LoadedModel {
    pub manifest: ModelManifest,
    model: Classifier,
    _varmap: VarMap,
    device: Device,
}

impl LoadedModel {
    pub fn is_quantized(&self) -> bool {
        self.manifest.quantization.is_some()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Probability of label 1 for each sample of a (N, 1, H, W) batch.
    pub fn predict_batch(&self, xs: &Tensor) -> Result<Vec<f32>> {
        match &self.manifest.quantization {
            Some(q) => self
                .model
                .predict_proba(xs, &mut FakeQuantize::new(&q.activation_ranges)),
            None => self.model.predict_proba(xs, &mut NoHook),
        }
    }
}

/// Restore a model written by [`save_full`] or [`save_quantized`].
pub fn load(path: &Path, device: &Device) -> Result<LoadedModel> {
    let manifest = read_manifest(path)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Classifier::new(&manifest.model, manifest.input_shape(), vb)?;

    if manifest.quantization.is_some() {
        let tensors = candle_core::safetensors::load(path, device)?;
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".into()))?;
        for (name, var) in data.iter() {
            let stored = tensors
                .get(name)
                .ok_or_else(|| candle_core::Error::Msg(format!("missing parameter {name}")))?;
            let value = match tensors.get(&format!("{name}.scale")) {
                Some(scale) => dequantize_weight(stored, scale)?,
                None => stored.to_dtype(DType::F32)?,
            };
            var.set(&value)?;
        }
    } else {
        varmap.load(path)?;
    }

    info!(
        "loaded {} model from {}",
        if manifest.quantization.is_some() { "int8" } else { "f32" },
        path.display()
    );
    Ok(LoadedModel {
        manifest,
        model,
        _varmap: varmap,
        device: device.clone(),
    })
}

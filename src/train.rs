//! Training loop: Adam on binary cross-entropy with an optional
//! reduce-on-plateau learning-rate policy.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use smartcore::metrics::accuracy;

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::model::{batch_tensor, Classifier, ModelConfig};

/// Lower the learning rate when validation loss stops improving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceOnPlateau {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    /// Smallest decrease that counts as an improvement.
    pub min_delta: f64,
}

impl Default for ReduceOnPlateau {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 3,
            min_lr: 1e-6,
            min_delta: 1e-4,
        }
    }
}

impl ReduceOnPlateau {
    pub fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(Error::config(format!(
                "plateau factor must be in (0, 1), got {}",
                self.factor
            )));
        }
        if self.patience == 0 {
            return Err(Error::config("plateau patience must be at least one epoch"));
        }
        if !(self.min_lr >= 0.0) || self.min_delta < 0.0 {
            return Err(Error::config("plateau min_lr and min_delta must be non-negative"));
        }
        Ok(())
    }
}

/// Running state of a [`ReduceOnPlateau`] policy.
#[derive(Debug, Clone)]
pub struct PlateauTracker {
    policy: ReduceOnPlateau,
    best: f64,
    wait: usize,
}

impl PlateauTracker {
    pub fn new(policy: ReduceOnPlateau) -> Self {
        Self {
            policy,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Feed one epoch's monitored loss; returns the learning rate to use next.
    /// A NaN loss never counts as an improvement.
    pub fn step(&mut self, loss: f64, lr: f64) -> f64 {
        if loss < self.best - self.policy.min_delta {
            self.best = loss;
            self.wait = 0;
            return lr;
        }
        self.wait += 1;
        if self.wait >= self.policy.patience && lr > self.policy.min_lr {
            self.wait = 0;
            return (lr * self.policy.factor).max(self.policy.min_lr);
        }
        lr
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Seeds the per-epoch shuffle.
    pub seed: u64,
    pub lr_schedule: Option<ReduceOnPlateau>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 20,
            learning_rate: 1e-3,
            seed: 42,
            lr_schedule: Some(ReduceOnPlateau::default()),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be positive"));
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(Error::config("learning rate must be positive"));
        }
        if let Some(schedule) = &self.lr_schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochMetrics>,
}

impl History {
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn accuracy(&self) -> Vec<f32> {
        self.epochs.iter().map(|e| e.accuracy).collect()
    }

    pub fn loss(&self) -> Vec<f32> {
        self.epochs.iter().map(|e| e.loss).collect()
    }

    /// True if any recorded loss is NaN or infinite.
    pub fn diverged(&self) -> bool {
        self.epochs.iter().any(|e| {
            !e.loss.is_finite() || e.val_loss.is_some_and(|v| !v.is_finite())
        })
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub struct TrainedModel {
    pub varmap: VarMap,
    pub model: Classifier,
    pub input_shape: (usize, usize),
    pub history: History,
}

/// Mean binary cross-entropy of sigmoid(logits) against 0/1 targets,
/// computed without forming the sigmoid.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let relu = logits.relu()?;
    let xy = (logits * targets)?;
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    ((relu - xy)? + softplus)?.mean_all()
}

fn label_tensor(labels: &[u8], device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = labels.iter().map(|&l| f32::from(l)).collect();
    Ok(Tensor::from_vec(values, (labels.len(), 1), device)?)
}

fn threshold(logits: &Tensor) -> Result<Vec<u8>> {
    let logits: Vec<f32> = logits.flatten_all()?.to_vec1()?;
    // sigmoid(x) > 0.5  <=>  x > 0
    Ok(logits.iter().map(|&x| u8::from(x > 0.0)).collect())
}

/// Loss and accuracy in inference mode; `None` for an empty dataset.
pub fn evaluate(
    model: &Classifier,
    data: &Dataset,
    batch_size: usize,
    device: &Device,
) -> Result<Option<(f32, f32)>> {
    if data.is_empty() {
        return Ok(None);
    }
    let indices: Vec<usize> = (0..data.len()).collect();
    let mut loss_sum = 0.0f64;
    let mut predictions = Vec::with_capacity(data.len());

    for batch in indices.chunks(batch_size.max(1)) {
        let xs = batch_tensor(&data.x, batch, device)?;
        let labels: Vec<u8> = batch.iter().map(|&i| data.y[i]).collect();
        let ys = label_tensor(&labels, device)?;
        let logits = model.forward_t(&xs, false)?;
        let loss = bce_with_logits(&logits, &ys)?.to_scalar::<f32>()?;
        loss_sum += f64::from(loss) * batch.len() as f64;
        predictions.extend(threshold(&logits)?);
    }

    let acc = accuracy(&data.y, &predictions) as f32;
    Ok(Some(((loss_sum / data.len() as f64) as f32, acc)))
}

pub fn train(
    train_set: &Dataset,
    validation_set: &Dataset,
    model_config: &ModelConfig,
    config: &TrainingConfig,
    device: &Device,
) -> Result<TrainedModel> {
    /* fresh classifier, always the full epoch budget (no early stopping) */
    config.validate()?;
    if train_set.is_empty() {
        return Err(Error::config("training set is empty"));
    }
    let input_shape = train_set.sample_shape();
    if !validation_set.is_empty() && validation_set.sample_shape() != input_shape {
        let (h, w) = validation_set.sample_shape();
        return Err(Error::Shape {
            expected: vec![input_shape.0, input_shape.1],
            actual: vec![h, w],
        });
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Classifier::new(model_config, input_shape, vb)?;

    let params = ParamsAdamW {
        lr: config.learning_rate,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-7,
        weight_decay: 0.0,
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;
    let mut plateau = config.lr_schedule.clone().map(PlateauTracker::new);
    let l2 = f64::from(model_config.regularization_strength);

    info!(
        "training on {} samples ({} validation) for {} epochs",
        train_set.len(),
        validation_set.len(),
        config.epochs
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut order: Vec<usize> = (0..train_set.len()).collect();
    let mut history = History::default();

    for epoch in 1..=config.epochs {
        order.shuffle(&mut rng);
        let mut loss_sum = 0.0f64;
        let mut seen_labels = Vec::with_capacity(order.len());
        let mut predictions = Vec::with_capacity(order.len());

        for batch in order.chunks(config.batch_size) {
            let xs = batch_tensor(&train_set.x, batch, device)?;
            let labels: Vec<u8> = batch.iter().map(|&i| train_set.y[i]).collect();
            let ys = label_tensor(&labels, device)?;

            let logits = model.forward_t(&xs, true)?;
            let mut loss = bce_with_logits(&logits, &ys)?;
            if l2 > 0.0 {
                loss = (loss + model.kernel_l2()?.affine(l2, 0.0)?)?;
            }
            optimizer.backward_step(&loss)?;

            loss_sum += f64::from(loss.to_scalar::<f32>()?) * batch.len() as f64;
            predictions.extend(threshold(&logits.detach())?);
            seen_labels.extend(labels);
        }

        let loss = (loss_sum / train_set.len() as f64) as f32;
        let acc = accuracy(&seen_labels, &predictions) as f32;
        let validation = evaluate(&model, validation_set, config.batch_size, device)?;
        let learning_rate = optimizer.learning_rate();

        let metrics = EpochMetrics {
            epoch,
            loss,
            accuracy: acc,
            val_loss: validation.map(|(l, _)| l),
            val_accuracy: validation.map(|(_, a)| a),
            learning_rate,
        };
        match (metrics.val_loss, metrics.val_accuracy) {
            (Some(vl), Some(va)) => info!(
                "epoch {epoch}/{}: loss={loss:.4} acc={acc:.4} val_loss={vl:.4} val_acc={va:.4} lr={learning_rate:.2e}",
                config.epochs
            ),
            _ => info!(
                "epoch {epoch}/{}: loss={loss:.4} acc={acc:.4} lr={learning_rate:.2e}",
                config.epochs
            ),
        }
        if !loss.is_finite() {
            warn!("epoch {epoch}: training loss is {loss}");
        }

        if let (Some(tracker), Some(val_loss)) = (plateau.as_mut(), metrics.val_loss) {
            let next = tracker.step(f64::from(val_loss), learning_rate);
            if next < learning_rate {
                info!("reducing learning rate to {next:.2e}");
                optimizer.set_learning_rate(next);
            }
        }
        history.epochs.push(metrics);
    }

    Ok(TrainedModel {
        varmap,
        model,
        input_shape,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn noise_dataset(n: usize, size: usize, seed: u64) -> Dataset {
        use rand::Rng;
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array4::from_shape_fn((n, size, size, 1), |_| rng.gen_range(-1.0f32..1.0));
        let y = (0..n).map(|i| (i % 2) as u8).collect();
        Dataset::new(x, y).unwrap()
    }

    fn quick_config(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            batch_size: 4,
            epochs,
            ..Default::default()
        }
    }

    #[test]
    fn test_bce_matches_definition() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.0f32], [2.0], [-3.0]], &device).unwrap();
        let targets = Tensor::new(&[[1.0f32], [0.0], [0.0]], &device).unwrap();
        let loss = bce_with_logits(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();

        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        let expected = (-(sigmoid(0.0)).ln() - (1.0 - sigmoid(2.0)).ln() - (1.0 - sigmoid(-3.0)).ln()) / 3.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_plateau_reduces_and_floors() {
        let mut tracker = PlateauTracker::new(ReduceOnPlateau {
            factor: 0.1,
            patience: 2,
            min_lr: 1e-4,
            min_delta: 0.0,
        });
        let mut lr = 1e-2;
        lr = tracker.step(1.0, lr); // improvement
        assert_eq!(lr, 1e-2);
        lr = tracker.step(1.0, lr);
        assert_eq!(lr, 1e-2);
        lr = tracker.step(1.5, lr); // second epoch without improvement
        assert!((lr - 1e-3).abs() < 1e-12);
        lr = tracker.step(f64::NAN, lr);
        lr = tracker.step(f64::NAN, lr);
        assert!((lr - 1e-4).abs() < 1e-12);
        lr = tracker.step(2.0, lr);
        lr = tracker.step(2.0, lr);
        assert!((lr - 1e-4).abs() < 1e-12, "never below the floor");
        // improvement resets the counter
        lr = tracker.step(0.5, lr);
        assert!((lr - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_minimal_training_run() {
        let device = Device::Cpu;
        let data = noise_dataset(8, 32, 1);
        let train_set = data.select(&[0, 1, 2, 3, 4, 5]);
        let validation = data.select(&[6, 7]);

        let trained = train(&train_set, &validation, &ModelConfig::minimal(), &quick_config(2), &device).unwrap();
        assert_eq!(trained.history.len(), 2);
        for metrics in &trained.history.epochs {
            assert!((0.0..=1.0).contains(&metrics.accuracy));
            let va = metrics.val_accuracy.unwrap();
            assert!((0.0..=1.0).contains(&va));
        }
        assert_eq!(trained.input_shape, (32, 32));
    }

    #[test]
    fn test_l2_and_dropout_config_trains() {
        let device = Device::Cpu;
        let data = noise_dataset(6, 32, 2);
        let empty = data.select(&[]);
        let trained = train(&data, &empty, &ModelConfig::two_block_l2(), &quick_config(1), &device).unwrap();
        assert_eq!(trained.history.len(), 1);
        assert!(trained.history.epochs[0].val_loss.is_none());
        assert!(trained.history.epochs[0].loss.is_finite());
    }

    #[test]
    fn test_divergence_is_recorded_not_raised() {
        let data = noise_dataset(6, 32, 4);
        let x = data.x.mapv(|v| v.signum() * 1e18);
        let exploding = Dataset::new(x, data.y.clone()).unwrap();
        let config = TrainingConfig {
            learning_rate: 1e30,
            lr_schedule: None,
            ..quick_config(3)
        };

        let trained = train(&exploding, &exploding.select(&[]), &ModelConfig::minimal(), &config, &Device::Cpu).unwrap();
        assert_eq!(trained.history.len(), 3);
        assert!(trained.history.diverged());
        assert!(trained.history.loss().iter().any(|l| !l.is_finite()));
    }

    #[test]
    fn test_empty_training_set_rejected() {
        let data = noise_dataset(2, 32, 3);
        let empty = data.select(&[]);
        let err = train(&empty, &data, &ModelConfig::minimal(), &quick_config(1), &Device::Cpu);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_history_json() {
        let history = History {
            epochs: vec![EpochMetrics {
                epoch: 1,
                loss: 0.7,
                accuracy: 0.5,
                val_loss: None,
                val_accuracy: None,
                learning_rate: 1e-3,
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        history.save_json(&path).unwrap();
        let loaded: History = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, history);
        assert!(!loaded.diverged());
    }
}

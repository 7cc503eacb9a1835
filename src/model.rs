//! Convolutional binary classifier.

use candle_core::{Device, Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Dropout, Linear,
    VarBuilder,
};
use ndarray::{Array2, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Architecture hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub num_blocks: usize,
    /// Output channels of each block's convolution.
    pub channels_per_block: Vec<usize>,
    /// Dropout after each block; 0 disables it.
    pub dropout_rates: Vec<f32>,
    /// L2 penalty on the convolution kernels.
    pub regularization_strength: f32,
    /// Dropout between global pooling and the output unit.
    pub head_dropout: f32,
    pub kernel_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::three_block()
    }
}

impl ModelConfig {
    pub fn three_block() -> Self {
        Self {
            num_blocks: 3,
            channels_per_block: vec![32, 64, 128],
            dropout_rates: vec![0.3, 0.3, 0.0],
            regularization_strength: 0.0,
            head_dropout: 0.5,
            kernel_size: 3,
        }
    }

    /// Small 10/20 channel network with L2 regularization.
    pub fn two_block_l2() -> Self {
        Self {
            num_blocks: 2,
            channels_per_block: vec![10, 20],
            dropout_rates: vec![0.2, 0.2],
            regularization_strength: 0.001,
            head_dropout: 0.0,
            kernel_size: 3,
        }
    }

    /// One narrow block, mostly for tests.
    pub fn minimal() -> Self {
        Self {
            num_blocks: 1,
            channels_per_block: vec![4],
            dropout_rates: vec![0.0],
            regularization_strength: 0.0,
            head_dropout: 0.0,
            kernel_size: 3,
        }
    }

    /// Spatial size after every block for an input of `input` pixels, or an
    /// error if the network would shrink it below one pixel.
    pub fn feature_map_sizes(&self, input: (usize, usize)) -> Result<Vec<(usize, usize)>> {
        let mut sizes = Vec::with_capacity(self.num_blocks);
        let (mut h, mut w) = input;
        for block in 0..self.num_blocks {
            if h < self.kernel_size + 1 || w < self.kernel_size + 1 {
                return Err(Error::config(format!(
                    "input {}x{} too small for block {block}",
                    input.0, input.1
                )));
            }
            h = (h - self.kernel_size + 1) / 2;
            w = (w - self.kernel_size + 1) / 2;
            sizes.push((h, w));
        }
        Ok(sizes)
    }

    pub fn validate(&self, input: (usize, usize)) -> Result<()> {
        if self.num_blocks == 0 {
            return Err(Error::config("model needs at least one block"));
        }
        if self.channels_per_block.len() != self.num_blocks {
            return Err(Error::config(format!(
                "expected {} channel widths, got {}",
                self.num_blocks,
                self.channels_per_block.len()
            )));
        }
        if self.channels_per_block.contains(&0) {
            return Err(Error::config("channel widths must be positive"));
        }
        if self.dropout_rates.len() != self.num_blocks {
            return Err(Error::config(format!(
                "expected {} dropout rates, got {}",
                self.num_blocks,
                self.dropout_rates.len()
            )));
        }
        for &rate in self.dropout_rates.iter().chain(std::iter::once(&self.head_dropout)) {
            if !(0.0..1.0).contains(&rate) {
                return Err(Error::config(format!("dropout rate {rate} outside [0, 1)")));
            }
        }
        if !(self.regularization_strength >= 0.0) || !self.regularization_strength.is_finite() {
            return Err(Error::config("regularization strength must be non-negative"));
        }
        if self.kernel_size == 0 {
            return Err(Error::config("kernel size must be positive"));
        }
        self.feature_map_sizes(input).map(|_| ())
    }
}

/// Called with the input (index 0) and each block output (index 1..).
/// Returns the tensor the network continues with.
pub trait ActivationHook {
    fn activation(&mut self, index: usize, xs: Tensor) -> candle_core::Result<Tensor>;
}

/// Leaves activations untouched.
pub struct NoHook;

impl ActivationHook for NoHook {
    fn activation(&mut self, _index: usize, xs: Tensor) -> candle_core::Result<Tensor> {
        Ok(xs)
    }
}

/// conv -> relu -> batch norm -> 2x2 max pool -> dropout
struct ConvBlock {
    conv: Conv2d,
    norm: BatchNorm,
    dropout: Option<Dropout>,
}

impl ConvBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv: conv2d(
                in_channels,
                out_channels,
                kernel_size,
                Conv2dConfig::default(),
                vb.pp("conv"),
            )?,
            norm: batch_norm(out_channels, BatchNormConfig::default(), vb.pp("norm"))?,
            dropout: (dropout > 0.0).then(|| Dropout::new(dropout)),
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?.relu()?;
        let xs = self.norm.forward_t(&xs, train)?;
        let xs = xs.max_pool2d(2)?;
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&xs, train),
            None => Ok(xs),
        }
    }
}

/// Conv blocks, global average pooling and one output unit. `forward_t`
/// returns logits of shape (N, 1); [`Classifier::predict_proba`] applies
/// the sigmoid.
pub struct Classifier {
    blocks: Vec<ConvBlock>,
    head_dropout: Option<Dropout>,
    head: Linear,
    config: ModelConfig,
}

impl Classifier {
    pub fn new(config: &ModelConfig, input: (usize, usize), vb: VarBuilder) -> Result<Self> {
        config.validate(input)?;

        let mut blocks = Vec::with_capacity(config.num_blocks);
        let mut in_channels = 1;
        for (i, (&channels, &dropout)) in config
            .channels_per_block
            .iter()
            .zip(config.dropout_rates.iter())
            .enumerate()
        {
            blocks.push(ConvBlock::new(
                in_channels,
                channels,
                config.kernel_size,
                dropout,
                vb.pp(format!("block{i}")),
            )?);
            in_channels = channels;
        }

        Ok(Self {
            blocks,
            head_dropout: (config.head_dropout > 0.0).then(|| Dropout::new(config.head_dropout)),
            head: linear(in_channels, 1, vb.pp("head"))?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Logits for a (N, 1, H, W) batch.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.forward_hooked(xs, train, &mut NoHook)
    }

    pub fn forward_hooked(
        &self,
        xs: &Tensor,
        train: bool,
        hook: &mut dyn ActivationHook,
    ) -> candle_core::Result<Tensor> {
        let mut xs = hook.activation(0, xs.clone())?;
        for (i, block) in self.blocks.iter().enumerate() {
            xs = hook.activation(i + 1, block.forward_t(&xs, train)?)?;
        }
        // global average pooling over H and W
        let mut xs = xs.mean((2, 3))?;
        if let Some(dropout) = &self.head_dropout {
            xs = dropout.forward_t(&xs, train)?;
        }
        self.head.forward(&xs)
    }

    pub fn kernel_l2(&self) -> candle_core::Result<Tensor> {
        /* sum of squared conv kernel weights, the head is not penalized */
        let mut total: Option<Tensor> = None;
        for block in &self.blocks {
            let term = block.conv.weight().sqr()?.sum_all()?;
            total = Some(match total {
                Some(t) => (t + term)?,
                None => term,
            });
        }
        match total {
            Some(t) => Ok(t),
            None => Tensor::new(0f32, self.head.weight().device()),
        }
    }

    /// Probability of label 1 for each sample of the batch, inference mode.
    pub fn predict_proba(&self, xs: &Tensor, hook: &mut dyn ActivationHook) -> Result<Vec<f32>> {
        let logits = self.forward_hooked(xs, false, hook)?;
        let probs = candle_nn::ops::sigmoid(&logits)?.flatten_all()?;
        Ok(probs.to_vec1::<f32>()?)
    }

    pub fn activation_count(&self) -> usize {
        self.blocks.len() + 1
    }
}

/// Gather samples `indices` of an (N, H, W, 1) array into an (B, 1, H, W)
/// tensor. With a single channel both layouts share memory order.
pub fn batch_tensor(x: &Array4<f32>, indices: &[usize], device: &Device) -> Result<Tensor> {
    let (_, h, w, c) = x.dim();
    if c != 1 {
        return Err(Error::Shape {
            expected: vec![h, w, 1],
            actual: vec![h, w, c],
        });
    }
    let mut data = Vec::with_capacity(indices.len() * h * w);
    for &i in indices {
        data.extend(x.index_axis(Axis(0), i).iter().copied());
    }
    Ok(Tensor::from_vec(data, (indices.len(), 1, h, w), device)?)
}

pub fn single_tensor(features: &Array2<f32>, device: &Device) -> Result<Tensor> {
    let (h, w) = features.dim();
    let data: Vec<f32> = features.iter().copied().collect();
    Ok(Tensor::from_vec(data, (1, 1, h, w), device)?)
}

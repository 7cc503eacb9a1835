//! Dataset assembly: stacking, labelling, global normalization and the
//! train/validation split.

use std::collections::BTreeMap;

use ndarray::{s, Array2, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Mean and standard deviation used for z-score normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub mean: f32,
    pub std: f32,
}

impl NormalizationStats {
    /// Population statistics over every value of every tensor.
    pub fn from_features(features: &[Array2<f32>]) -> Self {
        let count: usize = features.iter().map(|f| f.len()).sum();
        if count == 0 {
            return Self { mean: 0.0, std: 1.0 };
        }
        // accumulate in f64, 128*128 values per clip add up quickly
        let sum: f64 = features.iter().flatten().map(|&v| f64::from(v)).sum();
        let mean = sum / count as f64;
        let var: f64 = features
            .iter()
            .flatten()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / count as f64;
        let std = var.sqrt();
        Self {
            mean: mean as f32,
            std: if std > 0.0 && std.is_finite() { std as f32 } else { 1.0 },
        }
    }

    pub fn apply(&self, features: &Array2<f32>) -> Array2<f32> {
        features.mapv(|v| (v - self.mean) / self.std)
    }
}

/// How normalization is done for clips seen at inference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationPolicy {
    /// Reuse the statistics computed over the training corpus.
    #[default]
    TrainingStatistics,
    /// Normalize each clip with its own mean and std.
    PerClip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Shuffle the whole set; class proportions are not guaranteed.
    #[default]
    Random,
    /// Shuffle within each class so both partitions keep its proportion.
    Stratified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub validation_fraction: f32,
    pub seed: u64,
    pub strategy: SplitStrategy,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            seed: 42,
            strategy: SplitStrategy::Random,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(Error::config(format!(
                "validation fraction must be in [0, 1), got {}",
                self.validation_fraction
            )));
        }
        Ok(())
    }

    fn validation_count(&self, n: usize) -> usize {
        // f32 fractions like 0.2 are slightly above their decimal value
        let exact = n as f64 * f64::from(self.validation_fraction);
        (exact - 1e-6).ceil().max(0.0) as usize
    }
}

/// Tensors of shape (N, height, width, 1) and their labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub x: Array4<f32>,
    pub y: Vec<u8>,
}

impl Dataset {
    pub fn new(x: Array4<f32>, y: Vec<u8>) -> Result<Self> {
        if x.len_of(Axis(0)) != y.len() {
            return Err(Error::Shape {
                expected: vec![y.len()],
                actual: vec![x.len_of(Axis(0))],
            });
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn sample_shape(&self) -> (usize, usize) {
        let (_, h, w, _) = self.x.dim();
        (h, w)
    }

    pub fn sample(&self, index: usize) -> ArrayView3<'_, f32> {
        self.x.index_axis(Axis(0), index)
    }

    /// Rows `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            x: self.x.select(Axis(0), indices),
            y: indices.iter().map(|&i| self.y[i]).collect(),
        }
    }

    pub fn head(&self, n: usize) -> Self {
        let n = n.min(self.len());
        Self {
            x: self.x.slice(s![..n, .., .., ..]).to_owned(),
            y: self.y[..n].to_vec(),
        }
    }

    pub fn class_counts(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.y {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }
}

/// Normalized dataset plus the statistics that produced it.
#[derive(Debug, Clone)]
pub struct AssembledDataset {
    pub data: Dataset,
    pub stats: NormalizationStats,
}

pub fn assemble(per_class: &[Vec<Array2<f32>>], shape: (usize, usize)) -> Result<AssembledDataset> {
    /* stack per-class features (outer index = label), z-score with global
    statistics and add the trailing channel axis */
    if per_class.len() > usize::from(u8::MAX) + 1 {
        return Err(Error::config("too many classes for u8 labels"));
    }
    let total: usize = per_class.iter().map(Vec::len).sum();
    if total == 0 {
        return Err(Error::EmptyDataset);
    }

    for features in per_class.iter().flatten() {
        if features.dim() != shape {
            return Err(Error::Shape {
                expected: vec![shape.0, shape.1],
                actual: features.shape().to_vec(),
            });
        }
    }

    let all: Vec<Array2<f32>> = per_class.iter().flatten().cloned().collect();
    let stats = NormalizationStats::from_features(&all);

    let (h, w) = shape;
    let mut x = Array4::zeros((total, h, w, 1));
    for (mut slot, features) in x.axis_iter_mut(Axis(0)).zip(all.iter()) {
        slot.index_axis_mut(Axis(2), 0).assign(&stats.apply(features));
    }

    let y: Vec<u8> = per_class
        .iter()
        .enumerate()
        .flat_map(|(label, features)| std::iter::repeat(label as u8).take(features.len()))
        .collect();

    Ok(AssembledDataset {
        data: Dataset::new(x, y)?,
        stats,
    })
}

/// Train and validation partitions with the indices they were drawn from.
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Dataset,
    pub validation: Dataset,
    pub train_indices: Vec<usize>,
    pub validation_indices: Vec<usize>,
}

/// Partition indices; identical inputs and seed give identical partitions.
pub fn split_indices(labels: &[u8], config: &SplitConfig) -> Result<(Vec<usize>, Vec<usize>)> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let (mut train, mut validation) = match config.strategy {
        SplitStrategy::Random => {
            let mut indices: Vec<usize> = (0..labels.len()).collect();
            indices.shuffle(&mut rng);
            let n_val = config.validation_count(labels.len());
            let train = indices.split_off(n_val);
            (train, indices)
        }
        SplitStrategy::Stratified => {
            let mut by_class: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
            for (i, &label) in labels.iter().enumerate() {
                by_class.entry(label).or_default().push(i);
            }
            let mut train = Vec::new();
            let mut validation = Vec::new();
            for mut indices in by_class.into_values() {
                indices.shuffle(&mut rng);
                let n_val = config.validation_count(indices.len());
                train.extend(indices.split_off(n_val));
                validation.extend(indices);
            }
            train.shuffle(&mut rng);
            validation.shuffle(&mut rng);
            (train, validation)
        }
    };

    if train.is_empty() {
        return Err(Error::config(format!(
            "validation fraction {} leaves no training samples out of {}",
            config.validation_fraction,
            labels.len()
        )));
    }
    train.shrink_to_fit();
    validation.shrink_to_fit();
    Ok((train, validation))
}

pub fn split(dataset: &Dataset, config: &SplitConfig) -> Result<Split> {
    let (train_indices, validation_indices) = split_indices(&dataset.y, config)?;
    Ok(Split {
        train: dataset.select(&train_indices),
        validation: dataset.select(&validation_indices),
        train_indices,
        validation_indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn features(n: usize, value: f32) -> Vec<Array2<f32>> {
        (0..n)
            .map(|i| Array2::from_elem((4, 4), value + i as f32))
            .collect()
    }

    #[test]
    fn test_labels_match_tensors() {
        for (cars, bikes) in [(1, 0), (0, 1), (3, 5), (7, 2)] {
            let assembled = assemble(&[features(cars, 0.0), features(bikes, 10.0)], (4, 4)).unwrap();
            assert_eq!(assembled.data.x.len_of(Axis(0)), assembled.data.y.len());
            assert_eq!(assembled.data.y.iter().filter(|&&l| l == 0).count(), cars);
            assert_eq!(assembled.data.y.iter().filter(|&&l| l == 1).count(), bikes);
            // class-ordered
            assert!(assembled.data.y.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_global_normalization() {
        let assembled = assemble(&[features(2, 0.0), features(2, 5.0)], (4, 4)).unwrap();
        let x = &assembled.data.x;
        assert_eq!(x.dim(), (4, 4, 4, 1));
        assert!(x.mean().unwrap().abs() < 1e-5);
        assert!((x.std(0.0) - 1.0).abs() < 1e-4);
        // values 0,1,5,6 -> mean 3
        assert!((assembled.stats.mean - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_constant_input_does_not_divide_by_zero() {
        let assembled = assemble(&[features(1, 2.0), vec![Array2::from_elem((4, 4), 2.0)]], (4, 4)).unwrap();
        assert_eq!(assembled.stats.std, 1.0);
        assert!(assembled.data.x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_shape_is_checked() {
        let bad = vec![Array2::zeros((4, 3))];
        let err = assemble(&[features(1, 0.0), bad], (4, 4)).unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
        let empty = assemble(&[vec![], vec![]], (4, 4)).unwrap_err();
        assert!(matches!(empty, Error::EmptyDataset));
        assert!(empty.is_input_error());
    }

    #[test]
    fn test_split_is_reproducible() {
        let labels: Vec<u8> = (0..50).map(|i| (i % 2) as u8).collect();
        for strategy in [SplitStrategy::Random, SplitStrategy::Stratified] {
            let config = SplitConfig {
                strategy,
                ..Default::default()
            };
            let a = split_indices(&labels, &config).unwrap();
            let b = split_indices(&labels, &config).unwrap();
            assert_eq!(a, b);

            let other = split_indices(&labels, &SplitConfig { seed: 1, ..config }).unwrap();
            assert_ne!(a, other);
        }
    }

    #[test]
    fn test_split_partitions_everything_once() {
        let labels: Vec<u8> = (0..23).map(|i| u8::from(i > 15)).collect();
        let (train, val) = split_indices(&labels, &SplitConfig::default()).unwrap();
        assert_eq!(val.len(), 5); // ceil(0.2 * 23)
        assert_eq!(train.len(), 18);
        let all: HashSet<usize> = train.iter().chain(val.iter()).copied().collect();
        assert_eq!(all.len(), 23);
    }

    #[test]
    fn test_stratified_keeps_proportions() {
        let labels: Vec<u8> = (0..30).map(|i| u8::from(i >= 20)).collect();
        let config = SplitConfig {
            strategy: SplitStrategy::Stratified,
            ..Default::default()
        };
        let (train, val) = split_indices(&labels, &config).unwrap();
        let val_bikes = val.iter().filter(|&&i| labels[i] == 1).count();
        let train_bikes = train.iter().filter(|&&i| labels[i] == 1).count();
        assert_eq!(val.len(), 6);
        assert_eq!(val_bikes, 2);
        assert_eq!(train_bikes, 8);
    }

    #[test]
    fn test_split_datasets_follow_indices() {
        let assembled = assemble(&[features(3, 0.0), features(2, 10.0)], (4, 4)).unwrap();
        let split = split(&assembled.data, &SplitConfig::default()).unwrap();
        assert_eq!(split.train.len() + split.validation.len(), 5);
        for (row, &i) in split.train_indices.iter().enumerate() {
            assert_eq!(split.train.y[row], assembled.data.y[i]);
            assert_eq!(split.train.sample(row), assembled.data.sample(i));
        }
    }

    #[test]
    fn test_degenerate_split_rejected() {
        assert!(split_indices(&[0], &SplitConfig::default()).is_err());
        let config = SplitConfig {
            validation_fraction: 1.0,
            ..Default::default()
        };
        assert!(split_indices(&[0, 1, 0], &config).is_err());
    }
}

//! Reference implementations for validation.
//!
//! These are not production models: the linear softmax classifier and the
//! in-memory data source exist so the trainers can be exercised end to end
//! with real numerics in tests and examples. Real integrations implement
//! the [`Model`] and [`DataSource`] traits against an actual framework and
//! dataset.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{IncrementalError, TrainResult};
use crate::tensor::{log_softmax_rows, softmax_rows, Matrix};
use crate::{
    ClassId, ClassVisibility, DataSource, ForwardOptions, ForwardOutput, GradientInfo,
    LabeledBatch, Mode, Model, ModelFactory, Parameter,
};

/// State retained from the most recent forward pass so the analytic
/// backward can run. Kept after backward so a second loss term can
/// backpropagate through the same forward (peer distillation).
#[derive(Debug, Clone)]
struct ForwardCache {
    input: Matrix,
    logits: Matrix,
    temperature: f32,
    soft_targets: bool,
}

/// Single-layer softmax classifier: `log_softmax((x W^T + b) / T)`.
///
/// The weight matrix is laid out `(classes, features)` and named
/// `"fc.weight"`, so the default classifier filter of the trainer locates
/// it.
#[derive(Debug, Clone)]
pub struct LinearSoftmax {
    weight: Parameter,
    bias: Parameter,
    features: usize,
    classes: usize,
    mode: Mode,
    cache: Option<ForwardCache>,
}

impl LinearSoftmax {
    /// Creates a classifier with uniformly initialized weights in
    /// `[-0.1, 0.1]`, deterministic per seed.
    #[must_use]
    pub fn new(features: usize, classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weight = Matrix::zeros(classes, features);
        for v in weight.as_mut_slice() {
            *v = rng.gen_range(-0.1..0.1);
        }
        let bias = Matrix::zeros(1, classes);
        Self {
            weight: Parameter::new(weight),
            bias: Parameter::new(bias),
            features,
            classes,
            mode: Mode::Train,
            cache: None,
        }
    }

    /// Number of input features.
    #[must_use]
    pub fn features(&self) -> usize {
        self.features
    }

    /// Number of output classes.
    #[must_use]
    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Current train/eval mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn logits(&self, data: &Matrix) -> Matrix {
        let mut logits = Matrix::zeros(data.rows(), self.classes);
        for n in 0..data.rows() {
            let x = data.row(n);
            let out = logits.row_mut(n);
            for c in 0..self.classes {
                let w = self.weight.value.row(c);
                let mut acc = self.bias.value.row(0)[c];
                for (wv, xv) in w.iter().zip(x) {
                    acc += wv * xv;
                }
                out[c] = acc;
            }
        }
        logits
    }
}

impl Model for LinearSoftmax {
    fn forward(&mut self, data: &Matrix, opts: &ForwardOptions) -> TrainResult<ForwardOutput> {
        if data.cols() != self.features {
            return Err(IncrementalError::model(format!(
                "expected {} input features, got {}",
                self.features,
                data.cols()
            )));
        }
        let logits = self.logits(data);
        let output = if opts.soft_targets {
            softmax_rows(&logits, opts.temperature)
        } else {
            log_softmax_rows(&logits, opts.temperature)
        };
        let class_scores = opts.predict_class.then(|| softmax_rows(&logits, 1.0));
        self.cache = Some(ForwardCache {
            input: data.clone(),
            logits,
            temperature: opts.temperature,
            soft_targets: opts.soft_targets,
        });
        Ok(ForwardOutput {
            output,
            class_scores,
        })
    }

    fn backward(&mut self, grad_output: &Matrix, scale: f32) -> TrainResult<GradientInfo> {
        if !self.requires_grad() {
            return Err(IncrementalError::model("backward on a frozen model"));
        }
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| IncrementalError::model("backward without a preceding forward"))?;
        if cache.soft_targets {
            return Err(IncrementalError::model(
                "backward through detached soft-target output",
            ));
        }
        if grad_output.rows() != cache.logits.rows() || grad_output.cols() != self.classes {
            return Err(IncrementalError::model("gradient shape mismatch"));
        }

        // d(log_softmax(z))/dz followed by dz/dlogits = 1/T.
        let probs = softmax_rows(&cache.logits, cache.temperature);
        let mut dlogits = Matrix::zeros(grad_output.rows(), self.classes);
        for n in 0..grad_output.rows() {
            let g = grad_output.row(n);
            let p = probs.row(n);
            let g_sum: f32 = g.iter().sum();
            let out = dlogits.row_mut(n);
            for c in 0..self.classes {
                out[c] = (g[c] - p[c] * g_sum) / cache.temperature * scale;
            }
        }

        let mut norm_sq = 0.0f64;
        for c in 0..self.classes {
            let mut db = 0.0f32;
            for n in 0..dlogits.rows() {
                let d = dlogits.row(n)[c];
                db += d;
                let x = cache.input.row(n);
                let wg = self.weight.grad.row_mut(c);
                for (w, xv) in wg.iter_mut().zip(x) {
                    *w += d * xv;
                }
            }
            self.bias.grad.row_mut(0)[c] += db;
            norm_sq += f64::from(db * db);
        }
        for v in self.weight.grad.as_slice() {
            norm_sq += f64::from(v * v);
        }
        Ok(GradientInfo {
            gradient_norm: (norm_sq as f32).sqrt(),
        })
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn named_parameters(&self) -> Vec<(&str, &Parameter)> {
        vec![("fc.weight", &self.weight), ("fc.bias", &self.bias)]
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn freeze(&mut self) {
        self.weight.requires_grad = false;
        self.bias.requires_grad = false;
    }

    fn requires_grad(&self) -> bool {
        self.weight.requires_grad || self.bias.requires_grad
    }
}

/// Factory producing freshly initialized [`LinearSoftmax`] models.
///
/// Each `create` call advances the seed so successive models start from
/// different weights while the whole sequence stays deterministic.
#[derive(Debug)]
pub struct LinearSoftmaxFactory {
    features: usize,
    classes: usize,
    next_seed: AtomicU64,
}

impl LinearSoftmaxFactory {
    /// Creates a factory for models of the given shape.
    #[must_use]
    pub fn new(features: usize, classes: usize, seed: u64) -> Self {
        Self {
            features,
            classes,
            next_seed: AtomicU64::new(seed),
        }
    }
}

impl ModelFactory<LinearSoftmax> for LinearSoftmaxFactory {
    fn create(&self) -> TrainResult<LinearSoftmax> {
        let seed = self.next_seed.fetch_add(1, Ordering::Relaxed);
        Ok(LinearSoftmax::new(self.features, self.classes, seed))
    }
}

/// In-memory data source with per-class sample pools.
///
/// `add_class` copies a class's pool into the active working set;
/// `limit_class` truncates the working set (first `k`); herding ranks the
/// working set by closeness to the class mean in the reference model's
/// output space and keeps the top `k`. Batches are emitted in ascending
/// class order, chunked to the configured batch size.
#[derive(Debug, Clone)]
pub struct InMemoryDataSource {
    pool: BTreeMap<ClassId, Vec<Vec<f32>>>,
    active: BTreeMap<ClassId, Vec<Vec<f32>>>,
    batch_size: usize,
}

impl InMemoryDataSource {
    /// Creates an empty source emitting batches of at most `batch_size`.
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            pool: BTreeMap::new(),
            active: BTreeMap::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Registers the full sample pool for a class. The class stays
    /// invisible until `add_class` is issued.
    pub fn insert_class(&mut self, id: ClassId, samples: Vec<Vec<f32>>) {
        self.pool.insert(id, samples);
    }

    /// Number of active (visible, possibly truncated) samples for a class.
    #[must_use]
    pub fn active_len(&self, id: ClassId) -> usize {
        self.active.get(&id).map_or(0, Vec::len)
    }

    /// Ids currently visible to iteration.
    #[must_use]
    pub fn active_classes(&self) -> Vec<ClassId> {
        self.active.keys().copied().collect()
    }

    fn active_mut(&mut self, id: ClassId) -> TrainResult<&mut Vec<Vec<f32>>> {
        self.active.get_mut(&id).ok_or_else(|| IncrementalError::Data {
            reason: format!("class {id} is not active"),
        })
    }
}

impl ClassVisibility for InMemoryDataSource {
    fn add_class(&mut self, id: ClassId) {
        let samples = self.pool.get(&id).cloned().unwrap_or_default();
        self.active.insert(id, samples);
    }

    fn limit_class(&mut self, id: ClassId, k: usize) -> TrainResult<()> {
        self.active_mut(id)?.truncate(k);
        Ok(())
    }
}

impl<M: Model> DataSource<M> for InMemoryDataSource {
    fn limit_class_and_sort(
        &mut self,
        id: ClassId,
        k: usize,
        reference: &mut M,
    ) -> TrainResult<()> {
        let samples = self.active_mut(id)?;
        if samples.len() <= k {
            return Ok(());
        }
        let data = Matrix::from_rows(samples);
        let repr = reference.forward(&data, &ForwardOptions::default())?.output;

        // Class mean in the reference representation, then rank by
        // closeness to it.
        let mut mean = vec![0.0f32; repr.cols()];
        for n in 0..repr.rows() {
            for (m, &v) in mean.iter_mut().zip(repr.row(n)) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= repr.rows() as f32;
        }
        let mut ranked: Vec<(f32, usize)> = (0..repr.rows())
            .map(|n| {
                let dist: f32 = repr
                    .row(n)
                    .iter()
                    .zip(&mean)
                    .map(|(v, m)| (v - m) * (v - m))
                    .sum();
                (dist, n)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let kept: Vec<Vec<f32>> = ranked
            .iter()
            .take(k)
            .map(|&(_, n)| samples[n].clone())
            .collect();
        *samples = kept;
        Ok(())
    }

    fn epoch_batches(&mut self) -> TrainResult<Vec<LabeledBatch>> {
        let mut flat: Vec<(&Vec<f32>, ClassId)> = Vec::new();
        for (&id, samples) in &self.active {
            for sample in samples {
                flat.push((sample, id));
            }
        }
        let mut batches = Vec::new();
        for chunk in flat.chunks(self.batch_size) {
            let rows: Vec<Vec<f32>> = chunk.iter().map(|(s, _)| (*s).clone()).collect();
            let targets: Vec<ClassId> = chunk.iter().map(|&(_, id)| id).collect();
            batches.push(LabeledBatch {
                data: Matrix::from_rows(&rows),
                targets,
            });
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{kl_div, kl_div_grad, one_hot};

    #[test]
    fn forward_output_is_normalized() {
        let mut model = LinearSoftmax::new(3, 4, 0);
        let data = Matrix::from_rows(&[vec![0.1, -0.2, 0.3]]);
        let out = model
            .forward(
                &data,
                &ForwardOptions {
                    temperature: 2.0,
                    predict_class: true,
                    soft_targets: false,
                },
            )
            .unwrap();
        let prob_sum: f32 = out.output.row(0).iter().map(|v| v.exp()).sum();
        assert!((prob_sum - 1.0).abs() < 1e-5);
        let scores = out.class_scores.unwrap();
        let score_sum: f32 = scores.row(0).iter().sum();
        assert!((score_sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn soft_targets_return_probabilities() {
        let mut model = LinearSoftmax::new(2, 3, 1);
        let data = Matrix::from_rows(&[vec![1.0, 2.0]]);
        let out = model
            .forward(
                &data,
                &ForwardOptions {
                    temperature: 2.0,
                    predict_class: false,
                    soft_targets: true,
                },
            )
            .unwrap();
        let sum: f32 = out.output.row(0).iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(out.output.row(0).iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn backward_matches_numeric_gradient() {
        let mut model = LinearSoftmax::new(2, 3, 2);
        let data = Matrix::from_rows(&[vec![0.5, -1.0], vec![1.5, 0.25]]);
        let targets = one_hot(&[0, 2], 3);

        model.forward(&data, &ForwardOptions::default()).unwrap();
        model.backward(&kl_div_grad(&targets), 1.0).unwrap();
        let analytic = model.named_parameters()[0].1.grad.clone();

        // Central differences on a couple of weight entries.
        let eps = 1e-3f32;
        for &(c, f) in &[(0usize, 0usize), (2usize, 1usize)] {
            let mut probe = |delta: f32| {
                let mut m = model.clone();
                m.parameters_mut()[0].value.row_mut(c)[f] += delta;
                let out = m.forward(&data, &ForwardOptions::default()).unwrap();
                kl_div(&out.output, &targets)
            };
            let numeric = (probe(eps) - probe(-eps)) / (2.0 * eps);
            let got = analytic.row(c)[f];
            assert!(
                (numeric - got).abs() < 1e-3,
                "grad mismatch at ({c},{f}): numeric {numeric}, analytic {got}"
            );
        }
    }

    #[test]
    fn backward_scale_is_applied() {
        let mut model = LinearSoftmax::new(2, 3, 3);
        let data = Matrix::from_rows(&[vec![1.0, -0.5]]);
        let targets = one_hot(&[1], 3);

        let mut scaled = model.clone();
        model.forward(&data, &ForwardOptions::default()).unwrap();
        model.backward(&kl_div_grad(&targets), 1.0).unwrap();
        scaled.forward(&data, &ForwardOptions::default()).unwrap();
        scaled.backward(&kl_div_grad(&targets), 4.0).unwrap();

        let base = model.named_parameters()[0].1.grad.clone();
        let quad = scaled.named_parameters()[0].1.grad.clone();
        for (a, b) in base.as_slice().iter().zip(quad.as_slice()) {
            assert!((4.0 * a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn backward_on_soft_target_forward_is_rejected() {
        let mut model = LinearSoftmax::new(2, 3, 0);
        let data = Matrix::from_rows(&[vec![1.0, 1.0]]);
        model
            .forward(
                &data,
                &ForwardOptions {
                    temperature: 2.0,
                    predict_class: false,
                    soft_targets: true,
                },
            )
            .unwrap();
        assert!(model.backward(&Matrix::zeros(1, 3), 1.0).is_err());
    }

    #[test]
    fn herding_keeps_samples_near_class_mean() {
        let mut source = InMemoryDataSource::new(8);
        // Cluster at (1, 1) plus one far outlier.
        let mut samples: Vec<Vec<f32>> = (0..9)
            .map(|i| vec![1.0 + 0.01 * i as f32, 1.0 - 0.01 * i as f32])
            .collect();
        samples.push(vec![50.0, -50.0]);
        source.insert_class(0, samples);
        source.add_class(0);

        let mut reference = LinearSoftmax::new(2, 2, 0);
        DataSource::limit_class_and_sort(&mut source, 0, 5, &mut reference).unwrap();
        assert_eq!(source.active_len(0), 5);
        let batches = DataSource::<LinearSoftmax>::epoch_batches(&mut source).unwrap();
        for batch in &batches {
            for n in 0..batch.data.rows() {
                assert!(batch.data.row(n)[0] < 10.0, "outlier survived herding");
            }
        }
    }

    #[test]
    fn epoch_batches_cover_active_samples_with_labels() {
        let mut source = InMemoryDataSource::new(4);
        source.insert_class(2, vec![vec![0.0]; 5]);
        source.insert_class(7, vec![vec![1.0]; 3]);
        source.add_class(2);
        source.add_class(7);
        let batches = DataSource::<LinearSoftmax>::epoch_batches(&mut source).unwrap();
        let total: usize = batches.iter().map(|b| b.targets.len()).sum();
        assert_eq!(total, 8);
        let labels: Vec<ClassId> = batches.iter().flat_map(|b| b.targets.clone()).collect();
        assert_eq!(labels.iter().filter(|&&l| l == 2).count(), 5);
        assert_eq!(labels.iter().filter(|&&l| l == 7).count(), 3);
    }
}

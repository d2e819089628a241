//! Reference SGD optimizer.
//!
//! Implements the [`Optimizer`](crate::Optimizer) trait with momentum,
//! weight decay, and the Nesterov update - the same update rule the
//! incremental trainers are calibrated for. Momentum buffers are keyed by
//! parameter position, so `reset()` must be called whenever the model is
//! replaced wholesale (random reinitialization at a frozen-model refresh).

use crate::config::IncrementalTrainerConfig;
use crate::error::TrainResult;
use crate::tensor::Matrix;
use crate::{Model, Optimizer};

/// Stochastic gradient descent with momentum, weight decay, and Nesterov
/// acceleration.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    nesterov: bool,
    buffers: Vec<Option<Matrix>>,
}

impl Sgd {
    /// Creates an optimizer with the given hyperparameters. Nesterov
    /// acceleration is enabled whenever momentum is non-zero.
    #[must_use]
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            nesterov: momentum > 0.0,
            buffers: Vec::new(),
        }
    }

    /// Creates an optimizer from the trainer configuration (`lr`,
    /// `momentum`, `decay`).
    #[must_use]
    pub fn from_config(config: &IncrementalTrainerConfig) -> Self {
        Self::new(config.lr, config.momentum, config.decay)
    }
}

impl<M: Model> Optimizer<M> for Sgd {
    fn step(&mut self, model: &mut M) -> TrainResult<()> {
        let params = model.parameters_mut();
        if self.buffers.len() != params.len() {
            self.buffers = vec![None; params.len()];
        }
        for (param, buffer) in params.into_iter().zip(&mut self.buffers) {
            if !param.requires_grad {
                continue;
            }
            let buf = buffer
                .get_or_insert_with(|| Matrix::zeros(param.grad.rows(), param.grad.cols()));
            let values = param.value.as_mut_slice();
            let grads = param.grad.as_slice();
            let momenta = buf.as_mut_slice();
            for ((w, &g), b) in values.iter_mut().zip(grads).zip(momenta) {
                let mut d = g + self.weight_decay * *w;
                if self.momentum > 0.0 {
                    *b = self.momentum * *b + d;
                    d = if self.nesterov {
                        d + self.momentum * *b
                    } else {
                        *b
                    };
                }
                *w -= self.lr * d;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn zero_grad(&mut self, model: &mut M) {
        for param in model.parameters_mut() {
            param.grad.fill_zero();
        }
    }

    fn reset(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinearSoftmax;
    use crate::tensor::{kl_div_grad, one_hot, Matrix};
    use crate::ForwardOptions;

    fn train_one_step(optimizer: &mut Sgd, model: &mut LinearSoftmax) {
        let data = Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let targets = one_hot(&[0, 1], 3);
        Optimizer::<LinearSoftmax>::zero_grad(optimizer, model);
        model.forward(&data, &ForwardOptions::default()).unwrap();
        model.backward(&kl_div_grad(&targets), 1.0).unwrap();
        optimizer.step(model).unwrap();
    }

    #[test]
    fn step_moves_weights_against_gradient() {
        let mut model = LinearSoftmax::new(2, 3, 0);
        let before: Vec<f32> = model.named_parameters()[0].1.value.as_slice().to_vec();
        let mut optimizer = Sgd::new(0.5, 0.0, 0.0);
        train_one_step(&mut optimizer, &mut model);
        let after = model.named_parameters()[0].1.value.as_slice().to_vec();
        assert_ne!(before, after);
    }

    #[test]
    fn frozen_parameters_are_not_updated() {
        let mut model = LinearSoftmax::new(2, 3, 0);
        model.freeze();
        let before: Vec<f32> = model.named_parameters()[0].1.value.as_slice().to_vec();
        let mut optimizer = Sgd::new(0.5, 0.9, 1e-4);
        // Backward on a frozen model errors, so write a fake gradient and
        // step directly: frozen parameters must still not move.
        for param in model.parameters_mut() {
            for g in param.grad.as_mut_slice() {
                *g = 1.0;
            }
        }
        optimizer.step(&mut model).unwrap();
        let after = model.named_parameters()[0].1.value.as_slice().to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn momentum_accelerates_repeated_steps() {
        let mut plain_model = LinearSoftmax::new(2, 3, 5);
        let mut momentum_model = plain_model.clone();
        let mut plain = Sgd::new(0.1, 0.0, 0.0);
        let mut with_momentum = Sgd::new(0.1, 0.9, 0.0);
        let start: Vec<f32> = plain_model.named_parameters()[0].1.value.as_slice().to_vec();
        for _ in 0..3 {
            train_one_step(&mut plain, &mut plain_model);
            train_one_step(&mut with_momentum, &mut momentum_model);
        }
        let plain_shift: f32 = plain_model.named_parameters()[0]
            .1
            .value
            .as_slice()
            .iter()
            .zip(&start)
            .map(|(a, b)| (a - b).abs())
            .sum();
        let momentum_shift: f32 = momentum_model.named_parameters()[0]
            .1
            .value
            .as_slice()
            .iter()
            .zip(&start)
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(momentum_shift > plain_shift);
    }

    #[test]
    fn reset_clears_momentum_state() {
        let mut model = LinearSoftmax::new(2, 3, 1);
        let mut optimizer = Sgd::new(0.1, 0.9, 0.0);
        train_one_step(&mut optimizer, &mut model);
        assert!(!optimizer.buffers.is_empty());
        Optimizer::<LinearSoftmax>::reset(&mut optimizer);
        assert!(optimizer.buffers.is_empty());
    }
}

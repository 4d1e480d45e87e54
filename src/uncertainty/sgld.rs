//! Stochastic Gradient Langevin Dynamics optimizers
//!
//! The training loss is a per-sample mean, so the posterior gradient is
//! scaled down by the training set size `N`. The injected noise is scaled
//! the same way: each step adds `N(0, lr / N)` on top of a half gradient
//! step. The preconditioned variant (pSGLD) rescales both by an RMSprop
//! estimate of the gradient magnitude.

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::SimpleOptimizer;
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use burn::LearningRate;

#[derive(Config, Debug)]
pub struct SgldConfig {
    /// Number of training molecules
    pub n_train: usize,
    /// Standard deviation of the Gaussian weight prior
    #[config(default = 1.0)]
    pub prior_sigma: f64,
    /// Use the RMSprop preconditioner (pSGLD)
    #[config(default = false)]
    pub preconditioned: bool,
    /// Smoothing of the squared-gradient average
    #[config(default = 0.99)]
    pub alpha: f64,
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl SgldConfig {
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self) -> OptimizerAdaptor<Sgld, M, B> {
        let n_train = self.n_train.max(1) as f64;
        OptimizerAdaptor::from(Sgld {
            prior_precision: 1.0 / (self.prior_sigma * self.prior_sigma * n_train),
            noise_scale: 1.0 / n_train,
            preconditioned: self.preconditioned,
            alpha: self.alpha,
            epsilon: self.epsilon,
        })
    }
}

/// Langevin update rule
#[derive(Clone, Debug)]
pub struct Sgld {
    prior_precision: f64,
    noise_scale: f64,
    preconditioned: bool,
    alpha: f64,
    epsilon: f64,
}

/// Running squared-gradient average of pSGLD
#[derive(Record, Clone)]
pub struct SgldState<B: Backend, const D: usize> {
    pub square_avg: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Sgld {
    type State<const D: usize> = SgldState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        // Gradient of the negative log posterior, per training sample
        let grad = grad + tensor.clone().mul_scalar(self.prior_precision);
        let noise = Tensor::random(tensor.shape(), Distribution::Normal(0.0, 1.0), &tensor.device());
        let noise_std = (lr * self.noise_scale).sqrt();

        if !self.preconditioned {
            let tensor = tensor - grad.mul_scalar(lr / 2.0) + noise.mul_scalar(noise_std);
            return (tensor, None);
        }

        let squared = grad.clone().powf_scalar(2.0);
        let square_avg = match state {
            Some(state) => state.square_avg.mul_scalar(self.alpha) + squared.mul_scalar(1.0 - self.alpha),
            None => squared.mul_scalar(1.0 - self.alpha),
        };
        let preconditioner = square_avg.clone().sqrt().add_scalar(self.epsilon).recip();

        let tensor = tensor - (grad * preconditioner.clone()).mul_scalar(lr / 2.0)
            + (noise * preconditioner.sqrt()).mul_scalar(noise_std);
        (tensor, Some(SgldState { square_avg }))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.square_avg = state.square_avg.to_device(device);
        state
    }
}

//! Masked training objectives
//!
//! Every loss is computed per (molecule, task) and averaged over the
//! observed entries only; unobserved labels never contribute.

use crate::config::{Config, TaskType, UncertaintyMethod};
use crate::model::ModelOutput;
use crate::uncertainty::focal::FocalLoss;
use anyhow::Result;
use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, log_softmax, softplus};

/// Floor added to predicted variances
pub const VARIANCE_EPS: f64 = 1e-6;

/// Shape and kind of the training objective
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSpec {
    pub task_type: TaskType,
    pub n_tasks: usize,
    /// Logits per task: 1 for sigmoid or plain regression, C for softmax, 2 for mean/variance
    pub n_lbs: usize,
    /// Weight of the atom/bond consistency term of dual-head models
    pub dist_coff: f64,
    pub focal: Option<FocalLoss>,
}

impl LossSpec {
    pub fn from_config(config: &Config) -> Result<Self> {
        let focal = (config.uncertainty_method == UncertaintyMethod::FocalLoss).then(FocalLoss::default);
        Ok(Self {
            task_type: config.task_type,
            n_tasks: config.n_tasks()?,
            n_lbs: config.n_lbs()?,
            dist_coff: config.dist_coff,
            focal,
        })
    }
}

/// Mean of `loss` over entries where `masks` is one
pub fn masked_mean<B: Backend>(loss: Tensor<B, 2>, masks: Tensor<B, 2>) -> Tensor<B, 1> {
    let count = masks.clone().sum().clamp_min(1.0);
    (loss * masks).sum() / count
}

/// Elementwise binary cross-entropy on logits
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 2> {
    let positive = targets.clone() * log_sigmoid(logits.clone());
    let negative = targets.neg().add_scalar(1.0) * log_sigmoid(logits.neg());
    (positive + negative).neg()
}

/// Task loss of one head, `logits` shaped `[batch, n_tasks * n_lbs]`
pub fn task_loss<B: Backend>(
    logits: Tensor<B, 2>,
    lbs: Tensor<B, 2>,
    masks: Tensor<B, 2>,
    spec: &LossSpec,
) -> Tensor<B, 1> {
    let [batch_size, _] = logits.dims();
    let n_tasks = spec.n_tasks;

    let elementwise = match (spec.task_type, spec.n_lbs) {
        (TaskType::Classification, 1) => match &spec.focal {
            Some(focal) => focal.forward(logits, lbs),
            None => bce_with_logits(logits, lbs),
        },
        (TaskType::Classification, n_classes) => {
            let log_probs = log_softmax(logits.reshape([batch_size * n_tasks, n_classes]), 1);
            let targets = lbs.reshape([batch_size * n_tasks, 1]).int();
            log_probs.gather(1, targets).neg().reshape([batch_size, n_tasks])
        }
        (TaskType::Regression, 1) => (logits - lbs).powf_scalar(2.0),
        (TaskType::Regression, _) => gaussian_nll(logits, lbs, n_tasks),
    };
    masked_mean(elementwise, masks)
}

/// Gaussian negative log-likelihood of interleaved (mean, variance) logits
fn gaussian_nll<B: Backend>(logits: Tensor<B, 2>, lbs: Tensor<B, 2>, n_tasks: usize) -> Tensor<B, 2> {
    let [batch_size, _] = logits.dims();
    let logits = logits.reshape([batch_size, n_tasks, 2]);

    let mean = logits
        .clone()
        .slice([0..batch_size, 0..n_tasks, 0..1])
        .reshape([batch_size, n_tasks]);
    let var = softplus(logits.slice([0..batch_size, 0..n_tasks, 1..2]), 1.0)
        .reshape([batch_size, n_tasks])
        .add_scalar(VARIANCE_EPS);

    let squared_error = (lbs - mean).powf_scalar(2.0);
    (var.clone().log() + squared_error / var).mul_scalar(0.5)
}

/// Mean squared distance between the logits of two heads
pub fn consistency_loss<B: Backend>(
    atom: Tensor<B, 2>,
    bond: Tensor<B, 2>,
    masks: Tensor<B, 2>,
    spec: &LossSpec,
) -> Tensor<B, 1> {
    let [batch_size, _] = atom.dims();
    let distance = (atom - bond)
        .powf_scalar(2.0)
        .reshape([batch_size, spec.n_tasks, spec.n_lbs])
        .mean_dim(2)
        .reshape([batch_size, spec.n_tasks]);
    masked_mean(distance, masks)
}

/// Training loss of a model output
///
/// Dual-head outputs add both task losses and the weighted consistency term.
pub fn compute_loss<B: Backend>(
    output: ModelOutput<B>,
    lbs: Tensor<B, 2>,
    masks: Tensor<B, 2>,
    spec: &LossSpec,
) -> Tensor<B, 1> {
    match output {
        ModelOutput::Single(logits) => task_loss(logits, lbs, masks, spec),
        ModelOutput::Paired { atom, bond } => {
            let atom_loss = task_loss(atom.clone(), lbs.clone(), masks.clone(), spec);
            let bond_loss = task_loss(bond.clone(), lbs, masks.clone(), spec);
            let dist_loss = consistency_loss(atom, bond, masks, spec);
            atom_loss + bond_loss + dist_loss.mul_scalar(spec.dist_coff)
        }
    }
}

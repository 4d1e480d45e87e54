//! Model architectures and the interface the trainer drives them through

pub mod checkpoint;
pub mod chemberta;
pub mod dnn;
pub mod encoder;
pub mod grover;
pub mod head;
pub mod loss;

pub use chemberta::ChemBertaModel;
pub use dnn::DnnModel;
pub use grover::GroverModel;

use crate::config::Config;
use crate::data::Batch;
use anyhow::Result;
use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// Raw logits of a forward pass, `[batch, n_tasks * n_lbs]` per head
#[derive(Debug, Clone)]
pub enum ModelOutput<B: Backend> {
    Single(Tensor<B, 2>),
    /// Atom-view and bond-view readouts of a dual-head model
    Paired {
        atom: Tensor<B, 2>,
        bond: Tensor<B, 2>,
    },
}

impl<B: Backend> ModelOutput<B> {
    /// Copy logits to host memory
    pub fn into_host(self) -> HostLogits {
        let to_vec = |t: Tensor<B, 2>| -> Vec<f32> { t.into_data().iter::<f32>().collect() };
        match self {
            ModelOutput::Single(logits) => HostLogits::Single(to_vec(logits)),
            ModelOutput::Paired { atom, bond } => HostLogits::Paired(to_vec(atom), to_vec(bond)),
        }
    }
}

/// Logits in host memory, row-major `[n, n_tasks * n_lbs]`
#[derive(Debug, Clone, PartialEq)]
pub enum HostLogits {
    Single(Vec<f32>),
    Paired(Vec<f32>, Vec<f32>),
}

impl HostLogits {
    pub fn empty_like(&self) -> Self {
        match self {
            HostLogits::Single(_) => HostLogits::Single(Vec::new()),
            HostLogits::Paired(_, _) => HostLogits::Paired(Vec::new(), Vec::new()),
        }
    }

    /// Append the rows of another batch
    pub fn extend(&mut self, other: HostLogits) {
        match (self, other) {
            (HostLogits::Single(a), HostLogits::Single(b)) => a.extend(b),
            (HostLogits::Paired(a1, a2), HostLogits::Paired(b1, b2)) => {
                a1.extend(b1);
                a2.extend(b2);
            }
            _ => unreachable!("a model always produces the same output kind"),
        }
    }

    /// Divide every logit by a temperature
    pub fn scale(&mut self, temperature: f32) {
        let scale = |v: &mut Vec<f32>| v.iter_mut().for_each(|x| *x /= temperature);
        match self {
            HostLogits::Single(v) => scale(v),
            HostLogits::Paired(a, b) => {
                scale(a);
                scale(b);
            }
        }
    }
}

/// A molecular property model the trainer can build and run
pub trait PropertyModel<B: Backend>: Module<B> + Sized {
    /// Build the model; pretrained weights are loaded here when configured
    fn init(config: &Config, device: &B::Device) -> Result<Self>;

    /// Forward pass producing logits
    fn forward(&self, batch: &Batch<B>) -> ModelOutput<B>;

    /// KL divergence of Bayesian layers from their prior, if any
    fn kl_divergence(&self) -> Option<Tensor<B, 1>> {
        None
    }
}

/// Gradients split into optimizer parameter groups
pub struct GroupedGradients {
    /// Task head parameters, trained at the full learning rate
    pub head: GradientsParams,
    /// Pretrained encoder parameters, trained at a scaled learning rate
    pub base: Option<GradientsParams>,
}

/// Parameter grouping for optimizers
pub trait ParamGroups<B: AutodiffBackend>: AutodiffModule<B> {
    /// Split gradients into groups; by default every parameter is in the head group
    fn split_grads(&self, grads: B::Gradients) -> GroupedGradients {
        GroupedGradients {
            head: GradientsParams::from_grads(grads, self),
            base: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_logits_extend_and_scale() {
        let mut logits = HostLogits::Paired(vec![2.0], vec![4.0]);
        logits.extend(HostLogits::Paired(vec![6.0], vec![8.0]));
        logits.scale(2.0);
        assert_eq!(logits, HostLogits::Paired(vec![1.0, 3.0], vec![2.0, 4.0]));
        assert_eq!(logits.empty_like(), HostLogits::Paired(vec![], vec![]));
    }
}

use crate::config::{Config, UncertaintyMethod};
use crate::uncertainty::bbp::{BbpLinear, BbpLinearConfig};
use anyhow::Result;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Final projection onto `n_tasks * n_lbs` logits
///
/// Bayes-by-Backprop runs swap the deterministic layer for a variational one.
#[derive(Module, Debug)]
pub struct OutputLayer<B: Backend> {
    linear: Option<Linear<B>>,
    bbp: Option<BbpLinear<B>>,
}

impl<B: Backend> OutputLayer<B> {
    pub fn new(config: &Config, d_input: usize, device: &B::Device) -> Result<Self> {
        let d_output = config.n_tasks()? * config.n_lbs()?;
        Ok(if config.uncertainty_method == UncertaintyMethod::Bbp {
            Self {
                linear: None,
                bbp: Some(
                    BbpLinearConfig::new(d_input, d_output)
                        .with_prior_sigma(config.bbp_prior_sigma)
                        .init(device),
                ),
            }
        } else {
            Self {
                linear: Some(LinearConfig::new(d_input, d_output).init(device)),
                bbp: None,
            }
        })
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match (&self.linear, &self.bbp) {
            (Some(linear), _) => linear.forward(x),
            (None, Some(bbp)) => bbp.forward(x),
            (None, None) => x,
        }
    }

    pub fn kl_divergence(&self) -> Option<Tensor<B, 1>> {
        self.bbp.as_ref().map(|bbp| bbp.kl_divergence())
    }
}

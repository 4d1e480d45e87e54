use crate::config::Config;
use crate::data::Batch;
use crate::model::encoder::{first_token, masked_mean, TokenEncoder};
use crate::model::head::OutputLayer;
use crate::model::{GroupedGradients, ModelOutput, ParamGroups, PropertyModel};
use anyhow::Result;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::AutodiffBackend;
use tracing::warn;

/// Feed-forward readout head
#[derive(Module, Debug)]
pub struct FfnHead<B: Backend> {
    hidden: Linear<B>,
    dropout: Dropout,
    output: OutputLayer<B>,
}

impl<B: Backend> FfnHead<B> {
    fn new(config: &Config, device: &B::Device) -> Result<Self> {
        Ok(Self {
            hidden: LinearConfig::new(config.d_model, config.d_ffn).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            output: OutputLayer::new(config, config.d_ffn, device)?,
        })
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(x);
        let x = relu(self.hidden.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }
}

/// Atom-view and bond-view task heads
#[derive(Module, Debug)]
pub struct GroverFfn<B: Backend> {
    atom: FfnHead<B>,
    bond: FfnHead<B>,
}

/// Pretrained encoder with two readout heads
///
/// The atom view pools all token states, the bond view reads the `<s>`
/// token. Both produce a full set of task logits; training ties them with a
/// consistency penalty and inference averages their normalized outputs.
#[derive(Module, Debug)]
pub struct GroverModel<B: Backend> {
    grover: TokenEncoder<B>,
    ffn: GroverFfn<B>,
}

impl<B: Backend> GroverModel<B> {
    /// Base encoder, the group stepped at `lr * fine_tune_coff`
    pub fn encoder(&self) -> &TokenEncoder<B> {
        &self.grover
    }

    /// Atom and bond readout heads
    pub fn heads(&self) -> &GroverFfn<B> {
        &self.ffn
    }
}

impl<B: Backend> PropertyModel<B> for GroverModel<B> {
    fn init(config: &Config, device: &B::Device) -> Result<Self> {
        let mut grover = TokenEncoder::new(config, device)?;
        match &config.checkpoint_path {
            Some(path) => grover = grover.load_weights(path, device)?,
            None => warn!("No `checkpoint_path` given; GROVER encoder starts from random weights"),
        }

        Ok(Self {
            grover,
            ffn: GroverFfn {
                atom: FfnHead::new(config, device)?,
                bond: FfnHead::new(config, device)?,
            },
        })
    }

    /// # Panics
    ///
    /// Panics on batches without token ids; `Trainer::new` rejects such datasets.
    fn forward(&self, batch: &Batch<B>) -> ModelOutput<B> {
        let (Some(ids), Some(pad_mask)) = (&batch.atom_ids, &batch.pad_mask) else {
            panic!("GROVER batches must carry token ids");
        };
        let states = self.grover.forward(ids.clone(), pad_mask.clone());

        ModelOutput::Paired {
            atom: self.ffn.atom.forward(masked_mean(states.clone(), pad_mask.clone())),
            bond: self.ffn.bond.forward(first_token(states)),
        }
    }

    fn kl_divergence(&self) -> Option<Tensor<B, 1>> {
        match (self.ffn.atom.output.kl_divergence(), self.ffn.bond.output.kl_divergence()) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        }
    }
}

impl<B: AutodiffBackend> ParamGroups<B> for GroverModel<B> {
    fn split_grads(&self, mut grads: B::Gradients) -> GroupedGradients {
        let head = GradientsParams::from_module(&mut grads, &self.ffn);
        let base = GradientsParams::from_module(&mut grads, &self.grover);
        GroupedGradients {
            head,
            base: Some(base),
        }
    }
}

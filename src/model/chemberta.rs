use crate::config::Config;
use crate::data::Batch;
use crate::model::encoder::{first_token, TokenEncoder, ENCODER_WEIGHTS_NAME};
use crate::model::head::OutputLayer;
use crate::model::{ModelOutput, ParamGroups, PropertyModel};
use anyhow::Result;
use burn::nn::{Dropout, DropoutConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::path::Path;

/// Pretrained SMILES transformer with a task head on the `<s>` token
#[derive(Module, Debug)]
pub struct ChemBertaModel<B: Backend> {
    encoder: TokenEncoder<B>,
    dropout: Dropout,
    output: OutputLayer<B>,
}

impl<B: Backend> PropertyModel<B> for ChemBertaModel<B> {
    fn init(config: &Config, device: &B::Device) -> Result<Self> {
        let mut encoder = TokenEncoder::new(config, device)?;

        let weights = Path::new(&config.pretrained_model_name_or_path).join(ENCODER_WEIGHTS_NAME);
        if weights.exists() {
            encoder = encoder.load_weights(&weights, device)?;
        }

        Ok(Self {
            encoder,
            dropout: DropoutConfig::new(config.dropout).init(),
            output: OutputLayer::new(config, config.d_model, device)?,
        })
    }

    /// # Panics
    ///
    /// Panics on batches without token ids; `Trainer::new` rejects such datasets.
    fn forward(&self, batch: &Batch<B>) -> ModelOutput<B> {
        let (Some(ids), Some(pad_mask)) = (&batch.atom_ids, &batch.pad_mask) else {
            panic!("ChemBERTa batches must carry token ids");
        };
        let states = self.encoder.forward(ids.clone(), pad_mask.clone());
        let pooled = self.dropout.forward(first_token(states));
        ModelOutput::Single(self.output.forward(pooled))
    }

    fn kl_divergence(&self) -> Option<Tensor<B, 1>> {
        self.output.kl_divergence()
    }
}

impl<B: AutodiffBackend> ParamGroups<B> for ChemBertaModel<B> {}

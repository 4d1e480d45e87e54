use crate::config::Config;
use crate::data::Batch;
use crate::model::head::OutputLayer;
use crate::model::{ModelOutput, ParamGroups, PropertyModel};
use anyhow::{bail, Result};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::AutodiffBackend;

/// Feed-forward network over fingerprint or descriptor vectors
#[derive(Module, Debug)]
pub struct DnnModel<B: Backend> {
    /// Hidden layers, each followed by ReLU and dropout
    hidden: Vec<Linear<B>>,
    /// Dropout layer
    dropout: Dropout,
    /// Output layer
    output: OutputLayer<B>,
}

impl<B: Backend> DnnModel<B> {
    /// Forward pass over a `[batch, d_feature]` input
    pub fn forward_features(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = input;
        for layer in &self.hidden {
            x = layer.forward(x);
            x = relu(x);
            x = self.dropout.forward(x);
        }
        self.output.forward(x)
    }
}

impl<B: Backend> PropertyModel<B> for DnnModel<B> {
    fn init(config: &Config, device: &B::Device) -> Result<Self> {
        let d_feature = config.d_feature();
        if d_feature == 0 {
            bail!("DNN needs a feature type with a fixed width, got `{}`", config.feature_type);
        }

        let mut hidden = Vec::with_capacity(config.n_dnn_hidden_layers);
        let mut d_input = d_feature;
        for _ in 0..config.n_dnn_hidden_layers {
            hidden.push(LinearConfig::new(d_input, config.d_dnn_hidden).init(device));
            d_input = config.d_dnn_hidden;
        }

        Ok(Self {
            hidden,
            dropout: DropoutConfig::new(config.dropout).init(),
            output: OutputLayer::new(config, d_input, device)?,
        })
    }

    fn forward(&self, batch: &Batch<B>) -> ModelOutput<B> {
        let features = match &batch.features {
            Some(features) => features.clone(),
            None => Tensor::zeros([batch.batch_size(), 0], &batch.lbs.device()),
        };
        ModelOutput::Single(self.forward_features(features))
    }

    fn kl_divergence(&self) -> Option<Tensor<B, 1>> {
        self.output.kl_divergence()
    }
}

impl<B: AutodiffBackend> ParamGroups<B> for DnnModel<B> {}

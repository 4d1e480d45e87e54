use crate::config::Config;
use crate::data::SmilesTokenizer;
use anyhow::{Context, Result};
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig};
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use std::path::Path;
use tracing::info;

/// File name of pretrained encoder weights inside a model directory
pub const ENCODER_WEIGHTS_NAME: &str = "encoder.mpk";

/// Transformer encoder over SMILES token sequences
#[derive(Module, Debug)]
pub struct TokenEncoder<B: Backend> {
    token_embedding: Embedding<B>,
    position_embedding: Embedding<B>,
    norm: LayerNorm<B>,
    transformer: TransformerEncoder<B>,
    dropout: Dropout,
    max_positions: usize,
}

impl<B: Backend> TokenEncoder<B> {
    /// Build an encoder sized for the vocabulary in `pretrained_model_name_or_path`
    pub fn new(config: &Config, device: &B::Device) -> Result<Self> {
        let tokenizer = SmilesTokenizer::from_pretrained(
            Path::new(&config.pretrained_model_name_or_path),
            config.max_seq_length,
        )?;

        Ok(Self {
            token_embedding: EmbeddingConfig::new(tokenizer.vocab_size(), config.d_model).init(device),
            position_embedding: EmbeddingConfig::new(config.max_seq_length, config.d_model).init(device),
            norm: LayerNormConfig::new(config.d_model).init(device),
            transformer: TransformerEncoderConfig::new(
                config.d_model,
                config.d_ffn,
                config.n_attention_heads,
                config.n_encoder_layers,
            )
            .with_dropout(config.dropout)
            .with_norm_first(true)
            .init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            max_positions: config.max_seq_length,
        })
    }

    /// Load encoder weights saved with [`CompactRecorder`]
    pub fn load_weights<P: AsRef<Path>>(self, path: P, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading pretrained encoder weights from {:?}", path);

        let record = CompactRecorder::new()
            .load(path.to_path_buf(), device)
            .with_context(|| format!("Failed to load encoder weights from {:?}", path))?;
        Ok(self.load_record(record))
    }

    /// Contextual token states `[batch, seq_len, d_model]`
    pub fn forward(&self, ids: Tensor<B, 2, Int>, pad_mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let [batch_size, seq_len] = ids.dims();
        let seq_len = seq_len.min(self.max_positions);
        let ids = ids.slice([0..batch_size, 0..seq_len]);
        let pad_mask = pad_mask.slice([0..batch_size, 0..seq_len]);

        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &ids.device())
            .reshape([1, seq_len])
            .repeat_dim(0, batch_size);

        let x = self.token_embedding.forward(ids) + self.position_embedding.forward(positions);
        let x = self.dropout.forward(self.norm.forward(x));

        self.transformer
            .forward(TransformerEncoderInput::new(x).mask_pad(pad_mask))
    }
}

/// State of the first (`<s>`) token `[batch, d_model]`
pub fn first_token<B: Backend>(states: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch_size, _, d_model] = states.dims();
    states.slice([0..batch_size, 0..1, 0..d_model]).reshape([batch_size, d_model])
}

/// Mean of the states at non-padded positions `[batch, d_model]`
pub fn masked_mean<B: Backend>(states: Tensor<B, 3>, pad_mask: Tensor<B, 2, Bool>) -> Tensor<B, 2> {
    let [batch_size, seq_len, d_model] = states.dims();
    let [_, mask_len] = pad_mask.dims();
    let valid = pad_mask
        .slice([0..batch_size, 0..seq_len.min(mask_len)])
        .bool_not()
        .float();

    let total = (states * valid.clone().unsqueeze_dim::<3>(2)).sum_dim(1).reshape([batch_size, d_model]);
    let count = valid.sum_dim(1).clamp_min(1.0);
    total / count
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::tokenizer::tests::test_vocab;
    use crate::data::tokenizer::VOCAB_FILE_NAME;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    /// Small token-model configuration backed by a vocabulary in `dir`
    pub(crate) fn token_config(dir: &TempDir) -> Config {
        std::fs::write(
            dir.path().join(VOCAB_FILE_NAME),
            serde_json::to_string(&test_vocab()).unwrap(),
        )
        .unwrap();
        Config {
            pretrained_model_name_or_path: dir.path().to_string_lossy().into_owned(),
            max_seq_length: 16,
            d_model: 8,
            n_attention_heads: 2,
            n_encoder_layers: 1,
            d_ffn: 16,
            n_tasks: Some(2),
            classes: Some(vec![0.into(), 1.into()]),
            ..Config::default()
        }
    }

    #[test]
    fn test_encoder_shapes() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let encoder = TokenEncoder::<TestBackend>::new(&token_config(&dir), &device).unwrap();

        let ids = Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::new(vec![0i64, 4, 5, 2, 0, 4, 2, 1], [2, 4]),
            &device,
        );
        let pad = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(vec![false, false, false, false, false, false, false, true], [2, 4]),
            &device,
        );

        let states = encoder.forward(ids, pad.clone());
        assert_eq!(states.dims(), [2, 4, 8]);
        assert_eq!(first_token(states.clone()).dims(), [2, 8]);
        assert_eq!(masked_mean(states, pad).dims(), [2, 8]);
    }

    #[test]
    fn test_masked_mean_ignores_padding() {
        let device = Default::default();
        let states = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 3.0, 100.0], [1, 3, 1]),
            &device,
        );
        let pad = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(vec![false, false, true], [1, 3]),
            &device,
        );
        let mean: Vec<f32> = masked_mean(states, pad).into_data().to_vec().unwrap();
        assert_eq!(mean, vec![2.0]);
    }
}

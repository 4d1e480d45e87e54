use crate::config::options::{FeatureType, LrSchedulerType, ModelName, UncertaintyMethod};
use clap::builder::TypedValueParser;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Experiment arguments parsed from the command line
///
/// Field names match [`crate::config::Config`] so the two can be merged by name.
#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct Arguments {
    // --- IO arguments ---
    /// Dataset name
    #[arg(long, default_value = "")]
    pub dataset_name: String,

    /// Random seed used when the dataset was split; 0 if not randomly split
    #[arg(long, default_value = "0")]
    pub dataset_splitting_random_seed: u64,

    /// Directory holding the datasets
    #[arg(long, default_value = "", value_parser = clap::builder::OsStringValueParser::new().map(PathBuf::from))]
    pub data_dir: PathBuf,

    /// Where to save model outputs
    #[arg(long, default_value = "./output")]
    pub result_dir: PathBuf,

    /// Ignore cached features and regenerate them
    #[arg(long)]
    pub ignore_preprocessed_dataset: bool,

    /// Do not write generated features to the cache
    #[arg(long)]
    pub disable_dataset_saving: bool,

    /// Overwrite existing outputs
    #[arg(long)]
    pub overwrite_results: bool,

    // --- Model arguments ---
    /// Model architecture
    #[arg(long, value_enum, default_value_t = ModelName::Dnn)]
    pub model_name: ModelName,

    /// Dropout ratio
    #[arg(long, default_value = "0.1")]
    pub dropout: f64,

    /// Use softmax output instead of sigmoid for binary classification
    #[arg(long)]
    pub binary_classification_with_softmax: bool,

    /// Use separate mean and variance regression heads
    #[arg(long)]
    pub regression_with_variance: bool,

    // --- Uncertainty arguments ---
    /// Uncertainty estimation method
    #[arg(long, value_enum, default_value_t = UncertaintyMethod::None)]
    pub uncertainty_method: UncertaintyMethod,

    // --- Feature arguments ---
    /// Fingerprint generation function
    #[arg(long, value_enum, default_value_t = FeatureType::None)]
    pub feature_type: FeatureType,

    /// Worker threads used for feature generation
    #[arg(long, default_value = "8")]
    pub num_preprocess_workers: usize,

    // --- DNN arguments ---
    /// Number of DNN hidden layers
    #[arg(long, default_value = "8")]
    pub n_dnn_hidden_layers: usize,

    /// Width of DNN hidden layers
    #[arg(long, default_value = "128")]
    pub d_dnn_hidden: usize,

    // --- Token encoder arguments ---
    /// Directory with the tokenizer vocabulary (`vocab.json`) and optional pretrained weights
    #[arg(long, default_value = "")]
    pub pretrained_model_name_or_path: String,

    /// Maximum number of tokens per molecule, special tokens included
    #[arg(long, default_value = "128")]
    pub max_seq_length: usize,

    /// Encoder hidden size
    #[arg(long, default_value = "256")]
    pub d_model: usize,

    /// Number of attention heads
    #[arg(long, default_value = "8")]
    pub n_attention_heads: usize,

    /// Number of encoder layers
    #[arg(long, default_value = "4")]
    pub n_encoder_layers: usize,

    /// Encoder feed-forward width
    #[arg(long, default_value = "1024")]
    pub d_ffn: usize,

    // --- GROVER arguments ---
    /// Pretrained encoder checkpoint
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,

    /// Learning rate multiplier of the pretrained encoder; 0 freezes it
    #[arg(long, default_value = "1.0")]
    pub fine_tune_coff: f64,

    /// Weight of the atom/bond consistency loss
    #[arg(long, default_value = "0.1")]
    pub dist_coff: f64,

    /// Noam schedule initial learning rate
    #[arg(long, default_value = "0.00015")]
    pub init_lr: f64,

    /// Noam schedule peak learning rate
    #[arg(long, default_value = "0.001")]
    pub max_lr: f64,

    /// Noam schedule final learning rate
    #[arg(long, default_value = "0.0001")]
    pub final_lr: f64,

    /// Noam schedule warmup length in epochs
    #[arg(long, default_value = "2.0")]
    pub warmup_epochs: f64,

    // --- Training arguments ---
    /// Train from scratch even if a trained model exists in the result directory
    #[arg(long)]
    pub retrain_model: bool,

    /// Batch size
    #[arg(long, default_value = "32")]
    pub batch_size: usize,

    /// Number of training epochs
    #[arg(long, default_value = "50")]
    pub n_epochs: usize,

    /// Learning rate
    #[arg(long, default_value = "0.0001")]
    pub lr: f64,

    /// Weight decay
    #[arg(long, default_value = "0.0")]
    pub weight_decay: f64,

    /// Gradient norm clipping threshold; 0 disables clipping
    #[arg(long, default_value = "0.0")]
    pub grad_norm: f64,

    /// Learning rate schedule
    #[arg(long, value_enum, default_value_t = LrSchedulerType::Constant)]
    pub lr_scheduler_type: LrSchedulerType,

    /// Fraction of training steps used for warmup
    #[arg(long, default_value = "0.1")]
    pub warmup_ratio: f64,

    /// Random seed set at the beginning of training
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Debugging mode with fewer training data
    #[arg(long)]
    pub debug: bool,

    // --- Ensemble arguments ---
    /// Number of models in a deep ensemble
    #[arg(long, default_value = "5")]
    pub n_ensembles: usize,

    // --- SWAG arguments ---
    /// Learning rate decay applied during SWA training
    #[arg(long, default_value = "0.1")]
    pub lr_decay: f64,

    /// Number of SWA training epochs
    #[arg(long, default_value = "30")]
    pub n_swa_epochs: usize,

    /// Number of SWA checkpoints kept for the low-rank covariance
    #[arg(long, default_value = "30")]
    pub k_swa_checkpoints: usize,

    // --- Langevin arguments ---
    /// Number of parameter samples collected from the final SGLD epochs
    #[arg(long, default_value = "30")]
    pub n_langevin_samples: usize,

    /// Use the RMSprop preconditioned variant of SGLD
    #[arg(long)]
    pub apply_preconditioner: bool,

    // --- BBP arguments ---
    /// Standard deviation of the Gaussian weight prior
    #[arg(long, default_value = "0.1")]
    pub bbp_prior_sigma: f64,

    // --- Temperature scaling arguments ---
    /// Learning rate used to fit the temperature
    #[arg(long, default_value = "0.01")]
    pub ts_lr: f64,

    /// Number of temperature fitting epochs
    #[arg(long, default_value = "10")]
    pub n_ts_epochs: usize,

    // --- Evaluation arguments ---
    /// Training epochs between validation steps; 0 disables validation
    #[arg(long, default_value = "1")]
    pub valid_epoch_interval: usize,

    /// Number of test loops in one training process
    #[arg(long, default_value = "1")]
    pub n_test: usize,

    // --- Device arguments ---
    /// Disable CUDA even when it is available
    #[arg(long)]
    pub no_cuda: bool,
}

impl Default for Arguments {
    fn default() -> Self {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: Arguments,
        }

        Wrapper::parse_from(["muben"]).args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Arguments::default();
        assert_eq!(args.model_name, ModelName::Dnn);
        assert_eq!(args.batch_size, 32);
        assert_eq!(args.lr, 1e-4);
        assert_eq!(args.result_dir, PathBuf::from("./output"));
        assert!(args.checkpoint_path.is_none());
    }
}

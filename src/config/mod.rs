//! Experiment configuration
//!
//! [`Config`] is a flat bag of IO, model, training and uncertainty
//! hyperparameters. It is built from command line [`Arguments`], enriched
//! with dataset metadata from `meta.json`, and persisted as `config.json`
//! next to the run outputs so an experiment can be reloaded later.

pub mod args;
pub mod options;

pub use args::Arguments;
pub use options::{
    DeviceKind, EvalMetric, FeatureType, LrSchedulerType, ModelName, TaskType, UncertaintyMethod,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Default file name of the persisted configuration (without suffix)
pub const CONFIG_FILE_NAME: &str = "config";

/// Default file name of the dataset metadata
pub const META_FILE_NAME: &str = "meta.json";

/// Test loops used by sampling-based methods when the user left `n_test` at 1
const DEFAULT_N_STOCHASTIC_TEST: usize = 20;

/// Experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- IO ---
    pub dataset_name: String,
    pub dataset_splitting_random_seed: u64,
    pub data_dir: PathBuf,
    pub result_dir: PathBuf,
    pub ignore_preprocessed_dataset: bool,
    pub disable_dataset_saving: bool,
    pub overwrite_results: bool,

    // --- Model ---
    pub model_name: ModelName,
    pub dropout: f64,
    pub binary_classification_with_softmax: bool,
    pub regression_with_variance: bool,

    // --- Uncertainty ---
    pub uncertainty_method: UncertaintyMethod,

    // --- Features ---
    pub feature_type: FeatureType,
    pub num_preprocess_workers: usize,

    // --- DNN ---
    pub n_dnn_hidden_layers: usize,
    pub d_dnn_hidden: usize,

    // --- Token encoder ---
    pub pretrained_model_name_or_path: String,
    pub max_seq_length: usize,
    pub d_model: usize,
    pub n_attention_heads: usize,
    pub n_encoder_layers: usize,
    pub d_ffn: usize,

    // --- GROVER ---
    pub checkpoint_path: Option<PathBuf>,
    pub fine_tune_coff: f64,
    pub dist_coff: f64,
    pub init_lr: f64,
    pub max_lr: f64,
    pub final_lr: f64,
    pub warmup_epochs: f64,

    // --- Training ---
    pub retrain_model: bool,
    pub batch_size: usize,
    pub n_epochs: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub grad_norm: f64,
    pub lr_scheduler_type: LrSchedulerType,
    pub warmup_ratio: f64,
    pub seed: u64,
    pub debug: bool,

    // --- Uncertainty method parameters ---
    pub n_ensembles: usize,
    pub lr_decay: f64,
    pub n_swa_epochs: usize,
    pub k_swa_checkpoints: usize,
    pub n_langevin_samples: usize,
    pub apply_preconditioner: bool,
    pub bbp_prior_sigma: f64,
    pub ts_lr: f64,
    pub n_ts_epochs: usize,

    // --- Evaluation ---
    pub valid_epoch_interval: usize,
    pub n_test: usize,

    // --- Device ---
    pub no_cuda: bool,

    // --- Dataset metadata (usually from meta.json) ---
    pub task_type: TaskType,
    pub n_tasks: Option<usize>,
    pub classes: Option<Vec<Value>>,
    pub eval_metric: Option<EvalMetric>,
    pub random_split: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::copy_arguments(Arguments::default())
    }
}

impl Config {
    /// Build a configuration from command line arguments and apply the
    /// derivation rules (data directory, test loops, SWA checkpoint clamp).
    pub fn from_args(args: &Arguments) -> Self {
        info!("Setting configuration from command line arguments");
        let mut config = Self::copy_arguments(args.clone());

        config.data_dir = args
            .data_dir
            .join(&args.dataset_name)
            .join(format!("split-{}", args.dataset_splitting_random_seed));

        config.finalize();
        debug!("Configuration: {:?}", config);
        config
    }

    fn copy_arguments(args: Arguments) -> Self {
        Self {
            dataset_name: args.dataset_name,
            dataset_splitting_random_seed: args.dataset_splitting_random_seed,
            data_dir: args.data_dir,
            result_dir: args.result_dir,
            ignore_preprocessed_dataset: args.ignore_preprocessed_dataset,
            disable_dataset_saving: args.disable_dataset_saving,
            overwrite_results: args.overwrite_results,
            model_name: args.model_name,
            dropout: args.dropout,
            binary_classification_with_softmax: args.binary_classification_with_softmax,
            regression_with_variance: args.regression_with_variance,
            uncertainty_method: args.uncertainty_method,
            feature_type: args.feature_type,
            num_preprocess_workers: args.num_preprocess_workers,
            n_dnn_hidden_layers: args.n_dnn_hidden_layers,
            d_dnn_hidden: args.d_dnn_hidden,
            pretrained_model_name_or_path: args.pretrained_model_name_or_path,
            max_seq_length: args.max_seq_length,
            d_model: args.d_model,
            n_attention_heads: args.n_attention_heads,
            n_encoder_layers: args.n_encoder_layers,
            d_ffn: args.d_ffn,
            checkpoint_path: args.checkpoint_path,
            fine_tune_coff: args.fine_tune_coff,
            dist_coff: args.dist_coff,
            init_lr: args.init_lr,
            max_lr: args.max_lr,
            final_lr: args.final_lr,
            warmup_epochs: args.warmup_epochs,
            retrain_model: args.retrain_model,
            batch_size: args.batch_size,
            n_epochs: args.n_epochs,
            lr: args.lr,
            weight_decay: args.weight_decay,
            grad_norm: args.grad_norm,
            lr_scheduler_type: args.lr_scheduler_type,
            warmup_ratio: args.warmup_ratio,
            seed: args.seed,
            debug: args.debug,
            n_ensembles: args.n_ensembles,
            lr_decay: args.lr_decay,
            n_swa_epochs: args.n_swa_epochs,
            k_swa_checkpoints: args.k_swa_checkpoints,
            n_langevin_samples: args.n_langevin_samples,
            apply_preconditioner: args.apply_preconditioner,
            bbp_prior_sigma: args.bbp_prior_sigma,
            ts_lr: args.ts_lr,
            n_ts_epochs: args.n_ts_epochs,
            valid_epoch_interval: args.valid_epoch_interval,
            n_test: args.n_test,
            no_cuda: args.no_cuda,
            task_type: TaskType::default(),
            n_tasks: None,
            classes: None,
            eval_metric: None,
            random_split: false,
        }
    }

    /// Apply the rules that keep dependent fields consistent
    pub fn finalize(&mut self) -> &mut Self {
        if matches!(
            self.uncertainty_method,
            UncertaintyMethod::McDropout | UncertaintyMethod::Swag
        ) && self.n_test <= 1
        {
            self.n_test = DEFAULT_N_STOCHASTIC_TEST;
        }

        if self.k_swa_checkpoints > self.n_swa_epochs {
            self.k_swa_checkpoints = self.n_swa_epochs;
        }
        self
    }

    /// Merge the dataset metadata file into the configuration
    ///
    /// Keys that match a configuration attribute overwrite it; the rest are
    /// reported in a single warning and dropped.
    pub fn get_meta(&mut self, meta_dir: Option<&Path>, meta_file_name: &str) -> Result<&mut Self> {
        let meta_dir = meta_dir.unwrap_or(&self.data_dir).to_path_buf();
        let meta_path = meta_dir.join(meta_file_name);

        let content = fs::read_to_string(&meta_path)
            .with_context(|| format!("Failed to read meta file {:?}", meta_path))?;
        let meta: Map<String, Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse meta file {:?}", meta_path))?;

        let invalid_keys = self.merge(meta)?;
        if !invalid_keys.is_empty() {
            warn!(
                "The following attributes in the meta file are not defined in config: {:?}",
                invalid_keys
            );
        }
        Ok(self)
    }

    /// Overwrite attributes by name; returns the keys that did not match any attribute
    fn merge(&mut self, values: Map<String, Value>) -> Result<Vec<String>> {
        let mut current = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => bail!("Configuration did not serialize to an object"),
        };

        let mut invalid_keys = Vec::new();
        for (key, value) in values {
            if current.contains_key(&key) {
                current.insert(key, value);
            } else {
                invalid_keys.push(key);
            }
        }

        *self = serde_json::from_value(Value::Object(current))
            .context("Attribute value has an incompatible type")?;
        Ok(invalid_keys)
    }

    /// Save the configuration as JSON
    ///
    /// `path` is either an existing directory (the file is written as
    /// `config.json` inside it) or a file path whose parent exists.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf> {
        let path = path.as_ref();
        let file_path = if path.is_dir() {
            path.join(format!("{}.json", CONFIG_FILE_NAME))
        } else if path
            .parent()
            .map(|p| p.as_os_str().is_empty() || p.is_dir())
            .unwrap_or(false)
        {
            path.to_path_buf()
        } else {
            bail!("{:?} does not exist!", path);
        };

        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        if let Err(e) = fs::write(&file_path, json) {
            error!("Cannot save config file to {:?}; encountered error {:?}", file_path, e);
            return Err(e).with_context(|| format!("Failed to write config to {:?}", file_path));
        }

        debug!("Saved configuration to {:?}", file_path);
        Ok(file_path)
    }

    /// Load attributes from a stored configuration file
    ///
    /// `path` is either a directory containing `config.json` or the file itself.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<&mut Self> {
        let path = path.as_ref();
        let file_path = if path.is_dir() {
            path.join(format!("{}.json", CONFIG_FILE_NAME))
        } else {
            path.to_path_buf()
        };
        if !file_path.is_file() {
            bail!("{:?} does not exist!", file_path);
        }

        info!("Setting configuration parameters from {:?}", file_path);
        let content = fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file {:?}", file_path))?;
        let values: Map<String, Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", file_path))?;

        let skipped = self.merge(values)?;
        if !skipped.is_empty() {
            debug!("Skipped unknown config attributes: {:?}", skipped);
        }
        Ok(self)
    }

    /// Read a configuration from disk on top of the defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::default();
        config.load(path)?;
        Ok(config)
    }

    /// Number of output logits per task
    pub fn n_lbs(&self) -> Result<usize> {
        match self.task_type {
            TaskType::Classification => {
                let n_classes = self
                    .classes
                    .as_ref()
                    .map(|c| c.len())
                    .context("Classification requires `classes`; load the meta file first")?;
                if n_classes == 2 && !self.binary_classification_with_softmax {
                    Ok(1)
                } else {
                    Ok(n_classes)
                }
            }
            TaskType::Regression => Ok(if self.regression_with_variance { 2 } else { 1 }),
        }
    }

    /// Number of prediction tasks
    pub fn n_tasks(&self) -> Result<usize> {
        self.n_tasks
            .context("`n_tasks` is undefined; load the meta file first")
    }

    /// Width of the fingerprint feature vector
    pub fn d_feature(&self) -> usize {
        self.feature_type.dim()
    }

    /// Device the run executes on
    pub fn device(&self) -> DeviceKind {
        if self.no_cuda || !cfg!(feature = "cuda") {
            DeviceKind::Cpu
        } else {
            DeviceKind::Cuda
        }
    }

    /// Metric that selects the best checkpoint
    pub fn eval_metric(&self) -> EvalMetric {
        self.eval_metric.unwrap_or(match self.task_type {
            TaskType::Classification => EvalMetric::RocAuc,
            TaskType::Regression => EvalMetric::Rmse,
        })
    }

    /// Directory holding the outputs of this run
    pub fn run_dir(&self) -> PathBuf {
        self.result_dir
            .join(&self.dataset_name)
            .join(self.model_name.as_str())
            .join(self.uncertainty_method.as_str())
            .join(format!("seed-{}", self.seed))
    }

    /// Reject option combinations the pipeline cannot run
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("`batch_size` must be positive");
        }
        if self.model_name == ModelName::Dnn && self.feature_type == FeatureType::None {
            bail!("DNN requires a fingerprint `feature_type` (rdkit or morgan)");
        }
        if self.task_type == TaskType::Regression && self.binary_classification_with_softmax {
            bail!("`binary_classification_with_softmax` does not apply to regression");
        }
        if self.task_type == TaskType::Classification && self.regression_with_variance {
            bail!("`regression_with_variance` does not apply to classification");
        }
        if self.uncertainty_method == UncertaintyMethod::FocalLoss
            && (self.task_type != TaskType::Classification || self.n_lbs()? != 1)
        {
            bail!("Focal loss requires sigmoid binary classification");
        }
        if self.model_name.uses_tokens() && self.d_model % self.n_attention_heads.max(1) != 0 {
            bail!(
                "`d_model` ({}) must be divisible by `n_attention_heads` ({})",
                self.d_model,
                self.n_attention_heads
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("`dropout` must be in [0, 1), got {}", self.dropout);
        }
        Ok(())
    }
}

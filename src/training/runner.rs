//! Experiment dispatch: datasets, model family, optimizer and ensembles

use crate::config::{Config, ModelName, UncertaintyMethod};
use crate::data::{Collator, Dataset, Featurizer, Partition};
use crate::model::{ChemBertaModel, DnnModel, GroverModel, ParamGroups, PropertyModel};
use crate::predict::Predictions;
use crate::training::metrics::{evaluate, Metrics};
use crate::training::trainer::{
    flat_targets, Datasets, OptimizerFactory, AGGREGATED_PREDS_FILE, METRICS_FILE, PREDS_CSV_FILE,
};
use crate::training::{Trainer, TrainingResult};
use crate::uncertainty::SgldConfig;
use crate::utils::{read_json, write_json};
use anyhow::{Context, Result};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use std::path::PathBuf;
use tracing::info;

/// Directory name of the aggregated ensemble outputs, next to the member runs
pub const ENSEMBLE_DIR: &str = "ensemble";

/// Outputs of an experiment: one run, or every ensemble member plus their aggregate
#[derive(Debug, Clone)]
pub struct ExperimentOutput {
    pub runs: Vec<TrainingResult>,
    pub predictions: Predictions,
    pub metrics: Metrics,
}

/// Adam with the configured weight decay and gradient-norm clipping
///
/// `GradientClippingConfig::Norm` bounds the norm of each parameter tensor
/// separately, not the global norm over all parameters.
pub fn adam_factory<B: AutodiffBackend, M: AutodiffModule<B>>() -> OptimizerFactory<impl Optimizer<M, B>> {
    Box::new(|config: &Config, _n_train: usize| {
        let mut adam = AdamConfig::new();
        if config.weight_decay > 0.0 {
            adam = adam.with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)));
        }
        if config.grad_norm > 0.0 {
            adam = adam.with_grad_clipping(Some(GradientClippingConfig::Norm(config.grad_norm as f32)));
        }
        adam.init::<B, M>()
    })
}

/// SGLD, or pSGLD with `apply_preconditioner`; clipping is per parameter tensor as in [`adam_factory`]
pub fn sgld_factory<B: AutodiffBackend, M: AutodiffModule<B>>() -> OptimizerFactory<impl Optimizer<M, B>> {
    Box::new(|config: &Config, n_train: usize| {
        let optimizer = SgldConfig::new(n_train)
            .with_preconditioned(config.apply_preconditioner)
            .init::<B, M>();
        if config.grad_norm > 0.0 {
            optimizer.with_grad_clipping(GradientClippingConfig::Norm(config.grad_norm as f32).init())
        } else {
            optimizer
        }
    })
}

/// Load or featurize the three partitions
pub fn prepare_datasets(config: &Config, featurizer: &Featurizer) -> Result<Datasets> {
    let load = |partition: Partition| -> Result<Dataset> {
        let mut dataset = Dataset::new();
        dataset
            .prepare(config, partition, featurizer)
            .with_context(|| format!("Failed to prepare the {} partition", partition))?;
        info!("{} partition: {} molecules", partition, dataset.len());
        Ok(dataset)
    };
    Ok(Datasets {
        training: load(Partition::Train)?,
        valid: load(Partition::Valid)?,
        test: load(Partition::Test)?,
    })
}

/// Train and test with the optimizer the uncertainty method calls for
pub fn train_model<B, M>(config: Config, device: B::Device, datasets: Datasets, collator: Collator) -> Result<TrainingResult>
where
    B: AutodiffBackend,
    M: PropertyModel<B> + ParamGroups<B>,
    M::InnerModule: PropertyModel<B::InnerBackend>,
{
    if config.uncertainty_method == UncertaintyMethod::Sgld {
        Trainer::<B, M, _>::new(config, device, datasets, collator, sgld_factory::<B, M>())?.run()
    } else {
        Trainer::<B, M, _>::new(config, device, datasets, collator, adam_factory::<B, M>())?.run()
    }
}

fn train_single<B: AutodiffBackend>(
    config: Config,
    device: B::Device,
    datasets: Datasets,
    collator: Collator,
) -> Result<TrainingResult> {
    match config.model_name {
        ModelName::Dnn => train_model::<B, DnnModel<B>>(config, device, datasets, collator),
        ModelName::ChemBerta => train_model::<B, ChemBertaModel<B>>(config, device, datasets, collator),
        ModelName::Grover => train_model::<B, GroverModel<B>>(config, device, datasets, collator),
    }
}

/// Directory of the aggregated ensemble outputs
pub fn ensemble_dir(config: &Config) -> PathBuf {
    config.run_dir().with_file_name(ENSEMBLE_DIR)
}

/// Run a full experiment on prepared datasets
///
/// Deep ensembles train `n_ensembles` members with seeds `seed + i` and
/// score the mean of their predictions.
pub fn run_with_datasets<B: AutodiffBackend>(
    config: &Config,
    device: &B::Device,
    datasets: Datasets,
    collator: Collator,
) -> Result<ExperimentOutput> {
    let n_runs = if config.uncertainty_method == UncertaintyMethod::Ensembles {
        config.n_ensembles.max(1)
    } else {
        1
    };

    let mut runs = Vec::with_capacity(n_runs);
    for member in 0..n_runs {
        let mut run_config = config.clone();
        run_config.seed = config.seed + member as u64;
        if n_runs > 1 {
            info!("Training ensemble member {}/{} (seed {})", member + 1, n_runs, run_config.seed);
        }
        runs.push(train_single::<B>(run_config, device.clone(), datasets.clone(), collator)?);
    }

    if n_runs == 1 {
        let run = &runs[0];
        return Ok(ExperimentOutput {
            predictions: run.predictions.clone(),
            metrics: run.test_metrics.clone(),
            runs,
        });
    }

    let output_dir = ensemble_dir(config);
    if !config.overwrite_results && output_dir.join(METRICS_FILE).is_file() {
        info!("Ensemble results already exist in {:?}; keeping them", output_dir);
        return Ok(ExperimentOutput {
            runs,
            predictions: Predictions::load(output_dir.join(AGGREGATED_PREDS_FILE))?,
            metrics: read_json(output_dir.join(METRICS_FILE))?,
        });
    }

    let members: Vec<Predictions> = runs.iter().map(|r| r.predictions.clone()).collect();
    let predictions = Predictions::aggregate(&members)?;
    let (lbs, masks) = flat_targets(&datasets.test);
    let metrics = evaluate(&predictions, &lbs, &masks)?;
    info!("[Ensemble of {}] {}", n_runs, metrics.summary());

    predictions.save(output_dir.join(AGGREGATED_PREDS_FILE))?;
    predictions.write_csv(output_dir.join(PREDS_CSV_FILE), datasets.test.smiles())?;
    write_json(&metrics, output_dir.join(METRICS_FILE))?;

    Ok(ExperimentOutput {
        runs,
        predictions,
        metrics,
    })
}

/// Prepare the datasets and run a full experiment
pub fn run_experiment<B: AutodiffBackend>(
    config: &Config,
    device: &B::Device,
    featurizer: &Featurizer,
) -> Result<ExperimentOutput> {
    config.validate()?;
    let datasets = prepare_datasets(config, featurizer)?;
    let collator = Collator::new(featurizer.pad_id().unwrap_or_default());
    run_with_datasets::<B>(config, device, datasets, collator)
}

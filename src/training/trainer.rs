//! Shared training loop
//!
//! [`Trainer::run`] walks the fixed sequence `initialize_model`,
//! `initialize_optimizer`, `initialize_scheduler`, then alternates
//! `train_epoch` and `validate`, fits post-hoc calibration on the
//! validation set and finally runs `test`. Uncertainty methods hook into
//! that sequence: SWAG adds an averaging phase after training, SGLD keeps
//! weight snapshots of its last epochs, MC-Dropout keeps dropout active at
//! test time.

use crate::config::{Config, TaskType, UncertaintyMethod};
use crate::data::collate::batch_indices;
use crate::data::{Collator, Dataset, Instance, Partition};
use crate::model::checkpoint::{CheckpointManager, CheckpointMetadata, TRAINING_STATE_FILE};
use crate::model::loss::{compute_loss, LossSpec};
use crate::model::{HostLogits, ParamGroups, PropertyModel};
use crate::predict::Predictions;
use crate::training::callbacks::{CallbackManager, MetricsLoggerCallback, ProgressLoggerCallback, TimerCallback};
use crate::training::metrics::{evaluate, Metrics};
use crate::training::scheduler::LearningRateScheduler;
use crate::training::{TrainingResult, TrainingState};
use crate::uncertainty::{fit_temperature, IsotonicCalibration, ParamSnapshot, Swag};
use crate::utils::random::seeded_rng;
use crate::utils::{ensure_dir, progress_bar, read_json, write_json};
use anyhow::{bail, Context, Result};
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Directory of model records inside a run directory
pub const MODEL_DIR: &str = "model";
/// Directory of per-loop test predictions inside a run directory
pub const PREDS_DIR: &str = "preds";
/// Aggregated test predictions
pub const AGGREGATED_PREDS_FILE: &str = "preds.json";
pub const PREDS_CSV_FILE: &str = "preds.csv";
pub const METRICS_FILE: &str = "metrics.json";
pub const VALID_METRICS_FILE: &str = "valid-metrics.json";

/// Builds a fresh optimizer from the configuration and the training set size
pub type OptimizerFactory<O> = Box<dyn Fn(&Config, usize) -> O>;

/// The three partitions of an experiment
#[derive(Debug, Clone)]
pub struct Datasets {
    pub training: Dataset,
    pub valid: Dataset,
    pub test: Dataset,
}

/// Trainer for molecular property models
pub struct Trainer<B: AutodiffBackend, M, O> {
    config: Config,
    device: B::Device,
    spec: LossSpec,
    collator: Collator,
    datasets: Datasets,
    optimizer_factory: OptimizerFactory<O>,
    scheduler: LearningRateScheduler,
    state: TrainingState,
    callbacks: CallbackManager,
    rng: ChaCha8Rng,
    model: Option<M>,
    optimizer: Option<O>,
    best_model: Option<M>,
    temperature: Option<f32>,
    isotonic: Option<IsotonicCalibration>,
    swag: Option<Swag>,
    langevin_snapshots: Vec<ParamSnapshot>,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: PropertyModel<B> + ParamGroups<B>,
    M::InnerModule: PropertyModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(
        config: Config,
        device: B::Device,
        datasets: Datasets,
        collator: Collator,
        optimizer_factory: OptimizerFactory<O>,
    ) -> Result<Self> {
        config.validate()?;
        if datasets.training.is_empty() {
            bail!("The training set is empty");
        }
        for (partition, dataset) in [
            (Partition::Train, &datasets.training),
            (Partition::Valid, &datasets.valid),
            (Partition::Test, &datasets.test),
        ] {
            dataset
                .check_features(config.model_name)
                .with_context(|| format!("The {} partition does not fit the model", partition))?;
        }
        let spec = LossSpec::from_config(&config)?;
        let rng = seeded_rng(config.seed);

        let mut callbacks = CallbackManager::new();
        callbacks.add_callback(ProgressLoggerCallback::new(1));
        callbacks.add_callback(MetricsLoggerCallback::new(config.run_dir().join(VALID_METRICS_FILE)));
        callbacks.add_callback(TimerCallback::new());

        Ok(Self {
            config,
            device,
            spec,
            collator,
            datasets,
            optimizer_factory,
            scheduler: LearningRateScheduler::default(),
            state: TrainingState::new(),
            callbacks,
            rng,
            model: None,
            optimizer: None,
            best_model: None,
            temperature: None,
            isotonic: None,
            swag: None,
            langevin_snapshots: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }

    /// Fitted temperature, when temperature scaling ran
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    fn model_dir(&self) -> PathBuf {
        self.config.run_dir().join(MODEL_DIR)
    }

    fn steps_per_epoch(&self) -> usize {
        self.datasets.training.len().div_ceil(self.config.batch_size)
    }

    /// Train (or reload), calibrate and test
    pub fn run(&mut self) -> Result<TrainingResult> {
        let start = Instant::now();
        let run_dir = self.config.run_dir();
        if !self.config.overwrite_results && run_dir.join(METRICS_FILE).is_file() {
            info!("Results already exist in {:?}; skipping the run (use `overwrite_results` to redo it)", run_dir);
            return self.stored_result(start);
        }
        ensure_dir(&run_dir)?;
        self.config.save(&run_dir)?;

        self.initialize_model()?;

        let mut checkpoints = CheckpointManager::new(self.model_dir(), self.config.eval_metric().higher_is_better())?;
        let method = self.config.uncertainty_method;
        let reusable = !matches!(method, UncertaintyMethod::Swag | UncertaintyMethod::Sgld);

        if reusable && !self.config.retrain_model && checkpoints.has_best() {
            info!("Found a trained model in {:?}; skipping training", checkpoints.checkpoint_dir());
            let model = self.model.take().context("Model is not initialized")?;
            let (model, metadata) = checkpoints.load_best::<B, M>(model, &self.device)?;
            self.model = Some(model);
            self.state.best_epoch = Some(metadata.epoch);
            self.state.best_metric = metadata.val_metrics.get(self.config.eval_metric());
        } else {
            self.train(&mut checkpoints)?;
        }

        self.fit_calibration()?;
        let (predictions, test_metrics) = self.test()?;

        Ok(TrainingResult {
            state: self.state.clone(),
            predictions,
            test_metrics,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Results of an earlier run in the same directory
    fn stored_result(&mut self, start: Instant) -> Result<TrainingResult> {
        let run_dir = self.config.run_dir();
        let state_path = self.model_dir().join(TRAINING_STATE_FILE);
        if state_path.is_file() {
            self.state = TrainingState::load(&state_path)?;
        }
        Ok(TrainingResult {
            state: self.state.clone(),
            predictions: Predictions::load(run_dir.join(AGGREGATED_PREDS_FILE))?,
            test_metrics: read_json(run_dir.join(METRICS_FILE))?,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    pub fn initialize_model(&mut self) -> Result<&mut Self> {
        B::seed(self.config.seed);
        info!("Initializing {} model", self.config.model_name);
        self.model = Some(M::init(&self.config, &self.device)?);
        Ok(self)
    }

    pub fn initialize_optimizer(&mut self) -> &mut Self {
        self.optimizer = Some((self.optimizer_factory)(&self.config, self.datasets.training.len()));
        self
    }

    pub fn initialize_scheduler(&mut self) -> &mut Self {
        self.scheduler = LearningRateScheduler::from_config(&self.config, self.steps_per_epoch());
        debug!("Learning rate scheduler: {:?}", self.scheduler);
        self
    }

    fn train(&mut self, checkpoints: &mut CheckpointManager) -> Result<()> {
        self.initialize_optimizer();
        self.initialize_scheduler();

        let method = self.config.uncertainty_method;
        let n_epochs = self.config.n_epochs;
        let interval = self.config.valid_epoch_interval;
        let eval_metric = self.config.eval_metric();

        info!(
            "Training for {} epochs on {} molecules ({} steps per epoch)",
            n_epochs,
            self.datasets.training.len(),
            self.steps_per_epoch()
        );
        self.callbacks.on_train_begin();

        for epoch in 0..n_epochs {
            self.callbacks.on_epoch_begin(epoch);
            let (train_loss, lr) = self.train_epoch(None)?;

            let metrics = if interval > 0 && (epoch + 1) % interval == 0 {
                Some(self.validate()?)
            } else {
                None
            };
            let metric = metrics.as_ref().and_then(|m| m.get(eval_metric));

            if let Some(metrics) = &metrics {
                match metric {
                    Some(value) => self.checkpoint(checkpoints, epoch, metrics, value)?,
                    None => warn!("Validation produced no {}; keeping the previous best model", eval_metric.as_str()),
                }
            }

            if method == UncertaintyMethod::Sgld && epoch + self.config.n_langevin_samples >= n_epochs {
                let model = self.model.as_ref().context("Model is not initialized")?;
                self.langevin_snapshots.push(ParamSnapshot::capture::<B, M>(model));
                debug!("Collected Langevin sample {}", self.langevin_snapshots.len());
            }

            self.state.update_epoch(train_loss, metric, lr);
            self.callbacks.on_epoch_end(epoch, &self.state, metrics.as_ref());
        }

        if method != UncertaintyMethod::Sgld {
            if let Some(best) = self.best_model.take() {
                info!("Restoring the best model from epoch {:?}", self.state.best_epoch.map(|e| e + 1));
                self.model = Some(best);
            }
        }

        if method == UncertaintyMethod::Swag {
            self.swa_session()?;
        }

        self.callbacks.on_train_end(&self.state);
        self.state.save(self.model_dir().join(TRAINING_STATE_FILE))?;
        Ok(())
    }

    /// Record a validated epoch: best model and periodic checkpoint
    fn checkpoint(&mut self, checkpoints: &mut CheckpointManager, epoch: usize, metrics: &Metrics, value: f64) -> Result<()> {
        let model = self.model.as_ref().context("Model is not initialized")?;
        let optimizer = self.optimizer.as_ref().context("Optimizer is not initialized")?;
        let metadata = CheckpointMetadata::new(
            epoch,
            self.state.global_step,
            self.config.eval_metric().as_str(),
            metrics.clone(),
        );

        if checkpoints.save_best::<B, M>(model, &metadata, value)? {
            self.state.mark_best(epoch, value);
            self.best_model = Some(model.clone());
        }
        checkpoints.save_checkpoint::<B, M, O>(model, optimizer, &self.state, &metadata)?;
        Ok(())
    }

    /// One pass over the shuffled training set; returns the mean loss and the last learning rate
    ///
    /// `lr_override` replaces the scheduler with a constant rate.
    pub fn train_epoch(&mut self, lr_override: Option<f64>) -> Result<(f64, f64)> {
        let mut model = self.model.take().context("Model is not initialized")?;
        let mut optimizer = self.optimizer.take().context("Optimizer is not initialized")?;

        let instances = self.datasets.training.instances();
        let n_train = instances.len() as f64;
        let batches = batch_indices(instances.len(), self.config.batch_size, Some(&mut self.rng));

        let pb = progress_bar(batches.len() as u64, "train");
        let mut total_loss = 0.0;
        let mut lr = lr_override.unwrap_or(0.0);

        for indices in &batches {
            let batch_instances: Vec<&Instance> = indices.iter().map(|&i| &instances[i]).collect();
            let batch = self.collator.collate::<B>(&batch_instances, &self.device)?;

            let output = model.forward(&batch);
            let mut loss = compute_loss(output, batch.lbs, batch.masks, &self.spec);
            if let Some(kl) = model.kl_divergence() {
                loss = loss + kl.div_scalar(n_train);
            }
            total_loss += loss.clone().into_scalar().elem::<f64>();

            lr = lr_override.unwrap_or_else(|| self.scheduler.get_lr(self.state.global_step));
            let groups = model.split_grads(loss.backward());
            model = optimizer.step(lr, model, groups.head);
            if let Some(base) = groups.base {
                let base_lr = lr * self.config.fine_tune_coff;
                if base_lr > 0.0 {
                    model = optimizer.step(base_lr, model, base);
                }
            }

            self.state.global_step += 1;
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.model = Some(model);
        self.optimizer = Some(optimizer);
        Ok((total_loss / batches.len().max(1) as f64, lr))
    }

    /// Deterministic evaluation on the validation set
    pub fn validate(&self) -> Result<Metrics> {
        let model = self.model.as_ref().context("Model is not initialized")?;
        let logits = infer(&model.valid(), &self.datasets.valid, &self.collator, self.config.batch_size, &self.device)?;
        let preds = Predictions::from_logits(&logits, &self.spec)?;
        let (lbs, masks) = flat_targets(&self.datasets.valid);
        evaluate(&preds, &lbs, &masks)
    }

    /// Extra epochs at a constant rate, folding each iterate into the SWAG moments
    fn swa_session(&mut self) -> Result<()> {
        let lr = self.config.lr * self.config.lr_decay;
        info!(
            "SWA session: {} epochs at learning rate {:.2e}, rank {}",
            self.config.n_swa_epochs, lr, self.config.k_swa_checkpoints
        );

        self.initialize_optimizer();
        let mut swag = Swag::new(self.config.k_swa_checkpoints);
        for epoch in 0..self.config.n_swa_epochs {
            let (loss, _) = self.train_epoch(Some(lr))?;
            let model = self.model.as_ref().context("Model is not initialized")?;
            swag.collect(&ParamSnapshot::capture::<B, M>(model));
            debug!("SWA epoch {}: training loss {:.4}", epoch + 1, loss);
        }
        if swag.n_models() == 0 {
            warn!("No SWA iterate was collected; testing the trained weights");
        } else {
            self.swag = Some(swag);
        }
        Ok(())
    }

    /// Fit temperature scaling or isotonic calibration on the validation set
    pub fn fit_calibration(&mut self) -> Result<()> {
        let method = self.config.uncertainty_method;
        if !matches!(method, UncertaintyMethod::TemperatureScaling | UncertaintyMethod::IsotonicCalibration) {
            return Ok(());
        }
        if self.config.task_type != TaskType::Classification {
            warn!("{} only applies to classification; skipping calibration", method);
            return Ok(());
        }
        if self.datasets.valid.is_empty() {
            bail!("{} needs a validation set", method);
        }

        let model = self.model.as_ref().context("Model is not initialized")?;
        let logits = infer(&model.valid(), &self.datasets.valid, &self.collator, self.config.batch_size, &self.device)?;
        let (lbs, masks) = flat_targets(&self.datasets.valid);

        if method == UncertaintyMethod::TemperatureScaling {
            let (logits, lbs, masks) = stacked(logits, &lbs, &masks);
            let temperature = fit_temperature::<B>(
                &logits,
                &lbs,
                &masks,
                &self.spec,
                self.config.ts_lr,
                self.config.n_ts_epochs,
                &self.device,
            )?;
            if temperature.is_finite() && temperature > 0.0 {
                self.temperature = Some(temperature);
            } else {
                warn!("Temperature {} is unusable; keeping raw logits", temperature);
            }
        } else {
            let mut preds = Predictions::from_logits(&logits, &self.spec)?;
            match preds.positive_probs_mut() {
                Some(probs) => {
                    self.isotonic = Some(IsotonicCalibration::fit(probs, &lbs, &masks, self.spec.n_tasks)?);
                    info!("Fitted isotonic calibration for {} tasks", self.spec.n_tasks);
                }
                None => warn!("Isotonic calibration needs sigmoid outputs; skipping calibration"),
            }
        }
        Ok(())
    }

    /// Logits of one test loop
    fn test_logits(&mut self, model: &M, loop_idx: usize) -> Result<HostLogits> {
        let dataset = &self.datasets.test;
        let batch_size = self.config.batch_size;
        match self.config.uncertainty_method {
            // Dropout stays active on the autodiff backend
            UncertaintyMethod::McDropout => infer(model, dataset, &self.collator, batch_size, &self.device),
            UncertaintyMethod::Swag if self.swag.is_some() => {
                let swag = self.swag.as_ref().context("SWAG moments are missing")?;
                let sampled = swag.sample(1.0, &mut self.rng)?.apply::<B, M>(model.clone());
                infer(&sampled.valid(), dataset, &self.collator, batch_size, &self.device)
            }
            UncertaintyMethod::Sgld if !self.langevin_snapshots.is_empty() => {
                let sampled = self.langevin_snapshots[loop_idx].apply::<B, M>(model.clone());
                infer(&sampled.valid(), dataset, &self.collator, batch_size, &self.device)
            }
            _ => infer(&model.valid(), dataset, &self.collator, batch_size, &self.device),
        }
    }

    /// Run the test loops, aggregate and score them, and write the results
    pub fn test(&mut self) -> Result<(Predictions, Metrics)> {
        let model = self.model.clone().context("Model is not initialized")?;
        let method = self.config.uncertainty_method;
        let n_loops = match method {
            UncertaintyMethod::Sgld if !self.langevin_snapshots.is_empty() => self.langevin_snapshots.len(),
            m if m.is_stochastic() => self.config.n_test.max(1),
            _ => 1,
        };

        let run_dir = self.config.run_dir();
        info!("Testing with {} inference loop(s)", n_loops);
        let mut samples = Vec::with_capacity(n_loops);
        for loop_idx in 0..n_loops {
            let mut logits = self.test_logits(&model, loop_idx)?;
            if let Some(temperature) = self.temperature {
                logits.scale(temperature);
            }

            let mut preds = Predictions::from_logits(&logits, &self.spec)?;
            if let (Some(isotonic), Some(probs)) = (&self.isotonic, preds.positive_probs_mut()) {
                isotonic.calibrate(probs);
            }
            preds.save(run_dir.join(PREDS_DIR).join(format!("{}.json", loop_idx)))?;
            samples.push(preds);
        }

        let predictions = Predictions::aggregate(&samples)?;
        let (lbs, masks) = flat_targets(&self.datasets.test);
        let metrics = evaluate(&predictions, &lbs, &masks)?;
        info!("[Test] {}", metrics.summary());

        predictions.save(run_dir.join(AGGREGATED_PREDS_FILE))?;
        predictions.write_csv(run_dir.join(PREDS_CSV_FILE), self.datasets.test.smiles())?;
        write_json(&metrics, run_dir.join(METRICS_FILE))?;
        Ok((predictions, metrics))
    }
}

/// Forward a dataset in order and collect the logits on the host
pub fn infer<B: Backend, M: PropertyModel<B>>(
    model: &M,
    dataset: &Dataset,
    collator: &Collator,
    batch_size: usize,
    device: &B::Device,
) -> Result<HostLogits> {
    let instances = dataset.instances();
    let mut logits: Option<HostLogits> = None;
    for indices in batch_indices(instances.len(), batch_size, None) {
        let batch_instances: Vec<&Instance> = indices.iter().map(|&i| &instances[i]).collect();
        let batch = collator.collate::<B>(&batch_instances, device)?;
        let output = model.forward(&batch).into_host();
        logits = Some(match logits.take() {
            Some(mut acc) => {
                acc.extend(output);
                acc
            }
            None => output,
        });
    }
    logits.context("Cannot run inference on an empty dataset")
}

/// Row-major `[n, n_tasks]` labels and masks, unobserved labels zeroed
pub fn flat_targets(dataset: &Dataset) -> (Vec<f32>, Vec<f32>) {
    let masks = dataset.masks();
    let mut flat_lbs = Vec::new();
    let mut flat_masks = Vec::new();
    for (lbs, masks) in dataset.lbs().iter().zip(&masks) {
        for (&lb, &mask) in lbs.iter().zip(masks) {
            let observed = mask > 0.0 && !lb.is_nan();
            flat_lbs.push(if observed { lb } else { 0.0 });
            flat_masks.push(if observed { 1.0 } else { 0.0 });
        }
    }
    (flat_lbs, flat_masks)
}

/// Both heads of a dual-head output as one set of rows
fn stacked(logits: HostLogits, lbs: &[f32], masks: &[f32]) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    match logits {
        HostLogits::Single(values) => (values, lbs.to_vec(), masks.to_vec()),
        HostLogits::Paired(mut atom, bond) => {
            atom.extend(bond);
            (atom, [lbs, lbs].concat(), [masks, masks].concat())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureType, ModelName};
    use crate::data::MoleculeFeatures;
    use crate::model::encoder::tests::token_config;
    use crate::model::loss::consistency_loss;
    use crate::model::{DnnModel, GroverModel, ModelOutput};
    use crate::training::runner::adam_factory;
    use crate::uncertainty::ParamSnapshot;
    use burn::backend::{Autodiff, NdArray};
    use serde_json::json;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn toy_dataset(n: usize, n_tasks: usize, offset: usize) -> Dataset {
        let smiles = (0..n).map(|i| format!("C{}", "C".repeat(i + offset))).collect();
        let features = (0..n)
            .map(|i| {
                let mut v = vec![0.0; FeatureType::Morgan.dim()];
                v[(i + offset) % 7] = 1.0;
                MoleculeFeatures::Vector(v)
            })
            .collect();
        let lbs = (0..n)
            .map(|i| (0..n_tasks).map(|t| ((i + offset + t) % 2) as f32).collect())
            .collect();
        Dataset::from_parts(smiles, features, lbs, None).unwrap()
    }

    fn toy_config(dir: &TempDir, method: UncertaintyMethod) -> Config {
        let mut config = Config {
            model_name: ModelName::Dnn,
            feature_type: FeatureType::Morgan,
            result_dir: dir.path().to_path_buf(),
            dataset_name: "toy".to_string(),
            uncertainty_method: method,
            n_dnn_hidden_layers: 1,
            d_dnn_hidden: 8,
            batch_size: 4,
            n_epochs: 2,
            lr: 1e-2,
            n_tasks: Some(2),
            classes: Some(vec![json!(0), json!(1)]),
            ..Config::default()
        };
        config.finalize();
        config
    }

    fn toy_trainer(
        config: Config,
    ) -> Trainer<TestBackend, DnnModel<TestBackend>, impl Optimizer<DnnModel<TestBackend>, TestBackend>> {
        let datasets = Datasets {
            training: toy_dataset(10, 2, 0),
            valid: toy_dataset(6, 2, 1),
            test: toy_dataset(5, 2, 2),
        };
        Trainer::new(
            config,
            Default::default(),
            datasets,
            Collator::default(),
            adam_factory::<TestBackend, DnnModel<TestBackend>>(),
        )
        .unwrap()
    }

    fn token_dataset(n: usize, offset: usize) -> Dataset {
        // ids index the test vocabulary: 0 `<s>`, 2 `</s>`, 4.. atoms
        let smiles = (0..n).map(|i| "C".repeat(i + offset + 1)).collect();
        let features = (0..n)
            .map(|i| {
                let mut ids = vec![0];
                ids.extend((0..=(i + offset) % 3).map(|k| 4 + ((i + k) % 4) as u32));
                ids.push(2);
                MoleculeFeatures::Tokens(ids)
            })
            .collect();
        let lbs = (0..n)
            .map(|i| vec![((i + offset) % 2) as f32, ((i + offset + 1) % 2) as f32])
            .collect();
        Dataset::from_parts(smiles, features, lbs, None).unwrap()
    }

    fn grover_config(dir: &TempDir, fine_tune_coff: f64) -> Config {
        let mut config = token_config(dir);
        config.model_name = ModelName::Grover;
        config.dataset_name = "toy".to_string();
        config.result_dir = dir.path().join("output");
        config.fine_tune_coff = fine_tune_coff;
        config.dist_coff = 0.5;
        config.dropout = 0.0;
        config.batch_size = 3;
        config.n_epochs = 1;
        config.init_lr = 1e-2;
        config.max_lr = 1e-2;
        config.final_lr = 1e-2;
        config.finalize();
        config
    }

    fn grover_trainer(
        config: Config,
    ) -> Trainer<TestBackend, GroverModel<TestBackend>, impl Optimizer<GroverModel<TestBackend>, TestBackend>> {
        let datasets = Datasets {
            training: token_dataset(6, 0),
            valid: token_dataset(4, 1),
            test: token_dataset(3, 2),
        };
        Trainer::new(
            config,
            Default::default(),
            datasets,
            Collator::new(1),
            adam_factory::<TestBackend, GroverModel<TestBackend>>(),
        )
        .unwrap()
    }

    /// Whether any parameter of `after` differs from `before`
    fn params_changed(before: &ParamSnapshot, after: &ParamSnapshot) -> bool {
        before
            .params()
            .iter()
            .any(|(id, value)| after.get(id).map(|v| v.values != value.values).unwrap_or(true))
    }

    fn ready_grover(config: Config) -> (
        Trainer<TestBackend, GroverModel<TestBackend>, impl Optimizer<GroverModel<TestBackend>, TestBackend>>,
        ParamSnapshot,
        ParamSnapshot,
    ) {
        let mut trainer = grover_trainer(config);
        trainer.initialize_model().unwrap();
        trainer.initialize_optimizer();
        trainer.initialize_scheduler();
        let model = trainer.model().unwrap();
        let encoder = ParamSnapshot::capture::<TestBackend, _>(model.encoder());
        let heads = ParamSnapshot::capture::<TestBackend, _>(model.heads());
        (trainer, encoder, heads)
    }

    #[test]
    fn test_grover_frozen_encoder_with_zero_fine_tune_coff() {
        let temp_dir = TempDir::new().unwrap();
        let (mut trainer, encoder_before, heads_before) = ready_grover(grover_config(&temp_dir, 0.0));

        let (loss, lr) = trainer.train_epoch(None).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        assert!(lr > 0.0);

        let model = trainer.model().unwrap();
        let encoder_after = ParamSnapshot::capture::<TestBackend, _>(model.encoder());
        let heads_after = ParamSnapshot::capture::<TestBackend, _>(model.heads());
        assert!(!encoder_before.is_empty());
        for (id, value) in encoder_before.params() {
            assert_eq!(encoder_after.get(id).unwrap().values, value.values);
        }
        assert!(params_changed(&heads_before, &heads_after));
    }

    #[test]
    fn test_grover_fine_tunes_encoder() {
        let temp_dir = TempDir::new().unwrap();
        let (mut trainer, encoder_before, heads_before) = ready_grover(grover_config(&temp_dir, 0.5));

        trainer.train_epoch(None).unwrap();

        let model = trainer.model().unwrap();
        assert!(params_changed(&encoder_before, &ParamSnapshot::capture::<TestBackend, _>(model.encoder())));
        assert!(params_changed(&heads_before, &ParamSnapshot::capture::<TestBackend, _>(model.heads())));
    }

    #[test]
    fn test_grover_loss_includes_consistency() {
        let temp_dir = TempDir::new().unwrap();
        let (trainer, _, _) = ready_grover(grover_config(&temp_dir, 0.0));
        let model = trainer.model().unwrap().valid();

        let instances: Vec<&Instance> = trainer.datasets.training.instances().iter().collect();
        let batch = trainer.collator.collate::<NdArray<f32>>(&instances, &Default::default()).unwrap();
        let output = model.forward(&batch);
        let ModelOutput::Paired { atom, bond } = output.clone() else {
            panic!("expected paired heads");
        };

        let mut heads_only = trainer.spec.clone();
        heads_only.dist_coff = 0.0;
        let full: f64 = compute_loss(output.clone(), batch.lbs.clone(), batch.masks.clone(), &trainer.spec)
            .into_scalar()
            .elem();
        let without: f64 = compute_loss(output, batch.lbs.clone(), batch.masks.clone(), &heads_only)
            .into_scalar()
            .elem();
        let consistency: f64 = consistency_loss(atom, bond, batch.masks, &trainer.spec).into_scalar().elem();

        assert_eq!(trainer.spec.dist_coff, 0.5);
        assert!(consistency > 0.0);
        assert!((full - without - 0.5 * consistency).abs() < 1e-5);
    }

    #[test]
    fn test_grover_predictions_average_both_heads() {
        let temp_dir = TempDir::new().unwrap();
        let (mut trainer, _, _) = ready_grover(grover_config(&temp_dir, 0.0));
        trainer.train_epoch(None).unwrap();

        let (predictions, _) = trainer.test().unwrap();
        let model = trainer.model().unwrap().valid();
        let logits = infer(&model, &trainer.datasets.test, &trainer.collator, 3, &Default::default()).unwrap();
        let HostLogits::Paired(atom, bond) = logits else {
            panic!("expected paired logits");
        };

        let sigmoid = |x: f32| 1.0 / (1.0 + (-x).exp());
        assert_eq!(predictions.preds.len(), atom.len());
        for ((p, a), b) in predictions.preds.iter().zip(&atom).zip(&bond) {
            assert!((p - (sigmoid(*a) + sigmoid(*b)) / 2.0).abs() < 1e-5);
        }
        assert_ne!(atom, bond);
    }

    #[test]
    fn test_rejects_features_the_model_cannot_read() {
        let temp_dir = TempDir::new().unwrap();
        let datasets = Datasets {
            training: toy_dataset(4, 2, 0),
            valid: toy_dataset(2, 2, 1),
            test: toy_dataset(2, 2, 2),
        };
        let result = Trainer::<TestBackend, GroverModel<TestBackend>, _>::new(
            grover_config(&temp_dir, 1.0),
            Default::default(),
            datasets,
            Collator::new(1),
            adam_factory::<TestBackend, GroverModel<TestBackend>>(),
        );
        assert!(result.is_err());

        let mut config = toy_config(&temp_dir, UncertaintyMethod::None);
        config.result_dir = temp_dir.path().join("dnn");
        let datasets = Datasets {
            training: token_dataset(4, 0),
            valid: token_dataset(2, 1),
            test: token_dataset(2, 2),
        };
        let result = Trainer::<TestBackend, DnnModel<TestBackend>, _>::new(
            config,
            Default::default(),
            datasets,
            Collator::default(),
            adam_factory::<TestBackend, DnnModel<TestBackend>>(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_existing_results_are_kept_without_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let config = toy_config(&temp_dir, UncertaintyMethod::None);
        let metrics_path = config.run_dir().join(METRICS_FILE);
        let first = toy_trainer(config.clone()).run().unwrap();

        let stored = r#"{"roc-auc": 0.125}"#;
        std::fs::write(&metrics_path, stored).unwrap();

        let second = toy_trainer(config.clone()).run().unwrap();
        assert_eq!(std::fs::read_to_string(&metrics_path).unwrap(), stored);
        assert_eq!(second.test_metrics.roc_auc, Some(0.125));
        assert_eq!(second.predictions, first.predictions);
        assert_eq!(second.state, first.state);

        let mut overwrite = config;
        overwrite.overwrite_results = true;
        toy_trainer(overwrite).run().unwrap();
        assert_ne!(std::fs::read_to_string(&metrics_path).unwrap(), stored);
    }

    #[test]
    fn test_train_and_test_writes_results() {
        let temp_dir = TempDir::new().unwrap();
        let config = toy_config(&temp_dir, UncertaintyMethod::None);
        let run_dir = config.run_dir();

        let mut trainer = toy_trainer(config);
        let result = trainer.run().unwrap();

        assert_eq!(result.state.epoch, 2);
        assert_eq!(result.state.global_step, 6);
        assert_eq!(result.predictions.len(), 5);
        assert!(result.test_metrics.roc_auc.is_some() || result.test_metrics.nll.is_some());
        assert!(run_dir.join(METRICS_FILE).is_file());
        assert!(run_dir.join(PREDS_DIR).join("0.json").is_file());
        assert!(run_dir.join("config.json").is_file());
        assert!(run_dir.join(MODEL_DIR).join("model-best.mpk").is_file());
    }

    #[test]
    fn test_trained_model_is_reused() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = toy_config(&temp_dir, UncertaintyMethod::None);
        toy_trainer(config.clone()).run().unwrap();

        config.overwrite_results = true;
        let result = toy_trainer(config).run().unwrap();
        assert_eq!(result.state.global_step, 0);
        assert!(result.state.best_epoch.is_some());
    }

    #[test]
    fn test_mc_dropout_runs_test_loops() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = toy_config(&temp_dir, UncertaintyMethod::McDropout);
        config.dropout = 0.3;
        config.n_test = 3;
        let run_dir = config.run_dir();

        toy_trainer(config).run().unwrap();
        assert!(run_dir.join(PREDS_DIR).join("2.json").is_file());
        assert!(!run_dir.join(PREDS_DIR).join("3.json").exists());
    }

    #[test]
    fn test_swag_collects_iterates() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = toy_config(&temp_dir, UncertaintyMethod::Swag);
        config.n_swa_epochs = 3;
        config.k_swa_checkpoints = 2;
        config.n_test = 2;

        let mut trainer = toy_trainer(config);
        trainer.run().unwrap();
        let swag = trainer.swag.as_ref().unwrap();
        assert_eq!(swag.n_models(), 3);
        assert_eq!(swag.rank(), 2);
    }

    #[test]
    fn test_temperature_scaling_fits_temperature() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = toy_config(&temp_dir, UncertaintyMethod::TemperatureScaling);
        config.n_ts_epochs = 5;

        let mut trainer = toy_trainer(config);
        trainer.run().unwrap();
        assert!(trainer.temperature().unwrap() > 0.0);
    }

    #[test]
    fn test_flat_targets_zero_unobserved() {
        let dataset = Dataset::from_parts(
            vec!["C".to_string()],
            vec![MoleculeFeatures::Empty],
            vec![vec![1.0, f32::NAN, 1.0]],
            Some(vec![vec![1.0, 1.0, 0.0]]),
        )
        .unwrap();
        let (lbs, masks) = flat_targets(&dataset);
        assert_eq!(lbs, vec![1.0, 0.0, 0.0]);
        assert_eq!(masks, vec![1.0, 0.0, 0.0]);
    }
}

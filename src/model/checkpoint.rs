use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::training::metrics::Metrics;
use crate::training::TrainingState;

/// File stem of the best model record
pub const BEST_MODEL_NAME: &str = "model-best";

/// File name of the persisted training state
pub const TRAINING_STATE_FILE: &str = "training-state.json";

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Crate version that wrote the checkpoint
    pub version: String,
    /// Training epoch
    pub epoch: usize,
    /// Training step
    pub step: usize,
    /// Name of the model-selection metric
    pub metric_name: String,
    /// Validation metrics
    pub val_metrics: Metrics,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

impl CheckpointMetadata {
    pub fn new(epoch: usize, step: usize, metric_name: &str, val_metrics: Metrics) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            epoch,
            step,
            metric_name: metric_name.to_string(),
            val_metrics,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// Checkpoint manager for saving and loading model checkpoints
pub struct CheckpointManager {
    /// Directory to save checkpoints
    checkpoint_dir: PathBuf,
    /// Maximum number of periodic checkpoints to keep
    max_checkpoints: usize,
    /// Best model metric
    best_metric: Option<f64>,
    /// Direction of the model-selection metric
    higher_is_better: bool,
}

impl CheckpointManager {
    /// Create new checkpoint manager
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P, higher_is_better: bool) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)
            .with_context(|| format!("Failed to create checkpoint directory {:?}", checkpoint_dir))?;

        Ok(Self {
            checkpoint_dir,
            max_checkpoints: 2,
            best_metric: None,
            higher_is_better,
        })
    }

    /// Set maximum number of checkpoints to keep
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    /// Whether `metric` improves on the best value seen so far
    pub fn is_improvement(&self, metric: f64) -> bool {
        match self.best_metric {
            None => !metric.is_nan(),
            Some(best) if self.higher_is_better => metric > best,
            Some(best) => metric < best,
        }
    }

    /// Save model, optimizer and training state of one epoch
    pub fn save_checkpoint<B, M, O>(
        &mut self,
        model: &M,
        optimizer: &O,
        state: &TrainingState,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let checkpoint_path = self.checkpoint_dir.join(format!("checkpoint-{}.mpk", metadata.epoch));

        // Save model weights
        CompactRecorder::new()
            .record(model.clone().into_record(), checkpoint_path.clone())
            .context("Failed to save model checkpoint")?;

        // Save optimizer state
        CompactRecorder::new()
            .record(optimizer.to_record(), self.optimizer_path(metadata.epoch))
            .context("Failed to save optimizer state")?;

        write_metadata(&checkpoint_path.with_extension("json"), metadata)?;
        state.save(self.checkpoint_dir.join(TRAINING_STATE_FILE))?;

        debug!("Saved checkpoint: {:?}", checkpoint_path);

        // Clean up old checkpoints
        self.cleanup_old_checkpoints()?;

        Ok(checkpoint_path)
    }

    /// Save the model if `metric` is the best so far; returns whether it was
    pub fn save_best<B: Backend, M: Module<B>>(
        &mut self,
        model: &M,
        metadata: &CheckpointMetadata,
        metric: f64,
    ) -> Result<bool> {
        if !self.is_improvement(metric) {
            debug!(
                "Model did not improve. Current {}: {:.4}, Best: {:?}",
                metadata.metric_name, metric, self.best_metric
            );
            return Ok(false);
        }

        info!(
            "New best {}: {:.4} (previous: {:?})",
            metadata.metric_name, metric, self.best_metric
        );
        self.best_metric = Some(metric);

        let best_path = self.best_path();
        CompactRecorder::new()
            .record(model.clone().into_record(), best_path.clone())
            .context("Failed to save best model")?;
        write_metadata(&best_path.with_extension("json"), metadata)?;

        Ok(true)
    }

    /// Whether a best model has been written
    pub fn has_best(&self) -> bool {
        self.best_path().exists()
    }

    /// Load the best model into an initialized module
    pub fn load_best<B: Backend, M: Module<B>>(
        &self,
        model: M,
        device: &B::Device,
    ) -> Result<(M, CheckpointMetadata)> {
        let best_path = self.best_path();
        if !best_path.exists() {
            bail!("No best model found at {:?}", best_path);
        }
        self.load_checkpoint(model, &best_path, device)
    }

    /// Load model weights from checkpoint
    pub fn load_checkpoint<B: Backend, M: Module<B>>(
        &self,
        model: M,
        checkpoint_path: &Path,
        device: &B::Device,
    ) -> Result<(M, CheckpointMetadata)> {
        info!("Loading checkpoint from {:?}", checkpoint_path);

        let record = CompactRecorder::new()
            .load(checkpoint_path.to_path_buf(), device)
            .with_context(|| format!("Failed to load model checkpoint {:?}", checkpoint_path))?;
        let model = model.load_record(record);

        let metadata_path = checkpoint_path.with_extension("json");
        let metadata_json = fs::read_to_string(&metadata_path)
            .with_context(|| format!("Failed to read metadata file {:?}", metadata_path))?;
        let metadata: CheckpointMetadata =
            serde_json::from_str(&metadata_json).context("Failed to parse metadata")?;

        info!("Loaded checkpoint from epoch {}", metadata.epoch);
        Ok((model, metadata))
    }

    /// Restore optimizer state saved with the checkpoint of `epoch`
    pub fn load_optimizer<B, M, O>(&self, optimizer: O, epoch: usize, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = self.optimizer_path(epoch);
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Failed to load optimizer state {:?}", path))?;
        Ok(optimizer.load_record(record))
    }

    /// List periodic checkpoints as (epoch, path)
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints = Vec::new();

        for entry in fs::read_dir(&self.checkpoint_dir)
            .with_context(|| format!("Failed to read checkpoint directory {:?}", self.checkpoint_dir))?
        {
            let path = entry.context("Failed to read directory entry")?.path();
            if path.extension().map(|e| e == "mpk").unwrap_or(false) {
                let filename = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                if let Some(epoch) = filename
                    .strip_prefix("checkpoint-")
                    .and_then(|e| e.parse::<usize>().ok())
                {
                    checkpoints.push((epoch, path));
                }
            }
        }

        checkpoints.sort_by_key(|(epoch, _)| *epoch);
        Ok(checkpoints)
    }

    /// Clean up old checkpoints, keeping only the most recent ones
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;

        if checkpoints.len() > self.max_checkpoints {
            let to_remove = checkpoints.len() - self.max_checkpoints;
            for (epoch, path) in checkpoints.into_iter().take(to_remove) {
                debug!("Removing old checkpoint: {:?}", path);
                fs::remove_file(&path).ok();
                fs::remove_file(path.with_extension("json")).ok();
                fs::remove_file(self.optimizer_path(epoch)).ok();
            }
        }

        Ok(())
    }

    fn best_path(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.mpk", BEST_MODEL_NAME))
    }

    fn optimizer_path(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("optimizer-{}.mpk", epoch))
    }

    /// Get checkpoint directory path
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}

fn write_metadata(path: &Path, metadata: &CheckpointMetadata) -> Result<()> {
    let metadata_json = serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
    fs::write(path, metadata_json).with_context(|| format!("Failed to write metadata file {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FeatureType};
    use crate::model::{DnnModel, PropertyModel};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn test_model() -> DnnModel<TestBackend> {
        let config = Config {
            feature_type: FeatureType::Morgan,
            n_dnn_hidden_layers: 1,
            d_dnn_hidden: 8,
            n_tasks: Some(1),
            classes: Some(vec![0.into(), 1.into()]),
            ..Config::default()
        };
        DnnModel::init(&config, &Default::default()).unwrap()
    }

    fn metadata(epoch: usize) -> CheckpointMetadata {
        CheckpointMetadata::new(epoch, epoch * 10, "roc-auc", Metrics::default())
    }

    #[test]
    fn test_checkpoint_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path(), true).unwrap();

        let model = test_model();
        let optimizer = AdamConfig::new().init::<TestBackend, DnnModel<TestBackend>>();
        let path = manager
            .save_checkpoint(&model, &optimizer, &TrainingState::default(), &metadata(3))
            .unwrap();
        assert!(path.exists());
        assert!(temp_dir.path().join(TRAINING_STATE_FILE).exists());

        let (_, loaded) = manager
            .load_checkpoint(test_model(), &path, &Default::default())
            .unwrap();
        assert_eq!(loaded.epoch, 3);
        assert!(manager.load_optimizer(optimizer, 3, &Default::default()).is_ok());
    }

    #[test]
    fn test_keeps_recent_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path(), true).unwrap().with_max_checkpoints(2);
        let model = test_model();
        let optimizer = AdamConfig::new().init::<TestBackend, DnnModel<TestBackend>>();

        for epoch in 0..4 {
            manager
                .save_checkpoint(&model, &optimizer, &TrainingState::default(), &metadata(epoch))
                .unwrap();
        }
        let epochs: Vec<usize> = manager.list_checkpoints().unwrap().into_iter().map(|(e, _)| e).collect();
        assert_eq!(epochs, vec![2, 3]);
    }

    #[test]
    fn test_best_respects_metric_direction() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path(), false).unwrap();
        let model = test_model();

        assert!(!manager.has_best());
        assert!(manager.save_best(&model, &metadata(0), 1.0).unwrap());
        assert!(!manager.save_best(&model, &metadata(1), 2.0).unwrap());
        assert!(manager.save_best(&model, &metadata(2), 0.5).unwrap());
        assert_eq!(manager.best_metric(), Some(0.5));

        let (_, loaded) = manager.load_best(test_model(), &Default::default()).unwrap();
        assert_eq!(loaded.epoch, 2);
    }
}

pub mod callbacks;
pub mod metrics;
pub mod runner;
pub mod scheduler;
pub mod trainer;

pub use metrics::Metrics;
pub use runner::{run_experiment, ExperimentOutput};
pub use trainer::Trainer;

use crate::predict::Predictions;
use crate::utils::write_json;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Training state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    /// Best validation metric
    pub best_metric: Option<f64>,
    /// Epoch (0-based) of the best validation metric
    pub best_epoch: Option<usize>,
    /// Mean training loss per epoch
    pub train_loss_history: Vec<f64>,
    /// Validation metric per epoch; `None` when validation was skipped
    pub valid_metric_history: Vec<Option<f64>>,
    /// Last learning rate of each epoch
    pub lr_history: Vec<f64>,
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update after epoch
    pub fn update_epoch(&mut self, train_loss: f64, valid_metric: Option<f64>, lr: f64) {
        self.epoch += 1;
        self.train_loss_history.push(train_loss);
        self.valid_metric_history.push(valid_metric);
        self.lr_history.push(lr);
    }

    /// Record a new best validation metric
    pub fn mark_best(&mut self, epoch: usize, metric: f64) {
        self.best_metric = Some(metric);
        self.best_epoch = Some(epoch);
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read training state {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse training state {:?}", path))
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Final training state
    pub state: TrainingState,
    /// Aggregated test predictions
    pub predictions: Predictions,
    /// Test metrics of the aggregated predictions
    pub test_metrics: Metrics,
    /// Wall-clock duration in seconds
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_state_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let mut state = TrainingState::new();
        state.update_epoch(0.7, Some(0.81), 1e-4);
        state.update_epoch(0.5, None, 1e-4);
        state.mark_best(0, 0.81);
        state.global_step = 12;

        let path = temp_dir.path().join("state.json");
        state.save(&path).unwrap();
        let loaded = TrainingState::load(&path).unwrap();

        assert_eq!(loaded, state);
        assert_eq!(loaded.epoch, 2);
        assert_eq!(loaded.valid_metric_history, vec![Some(0.81), None]);
    }
}

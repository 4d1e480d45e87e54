use crate::training::metrics::Metrics;
use crate::training::TrainingState;
use crate::utils::{format_duration, write_json};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Training callback trait
///
/// Callbacks observe the training loop; they never change its course.
/// `metrics` is `None` for epochs without validation.
pub trait TrainingCallback: Send + Sync {
    fn on_train_begin(&mut self) {}

    fn on_train_end(&mut self, _state: &TrainingState) {}

    fn on_epoch_begin(&mut self, _epoch: usize) {}

    fn on_epoch_end(&mut self, _epoch: usize, _state: &TrainingState, _metrics: Option<&Metrics>) {}
}

/// Fans every event out to the registered callbacks
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback<C: TrainingCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_train_begin(&mut self) {
        for callback in &mut self.callbacks {
            callback.on_train_begin();
        }
    }

    pub fn on_train_end(&mut self, state: &TrainingState) {
        for callback in &mut self.callbacks {
            callback.on_train_end(state);
        }
    }

    pub fn on_epoch_begin(&mut self, epoch: usize) {
        for callback in &mut self.callbacks {
            callback.on_epoch_begin(epoch);
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, state: &TrainingState, metrics: Option<&Metrics>) {
        for callback in &mut self.callbacks {
            callback.on_epoch_end(epoch, state, metrics);
        }
    }
}

/// Progress logging callback
pub struct ProgressLoggerCallback {
    log_frequency: usize,
}

impl ProgressLoggerCallback {
    pub fn new(log_frequency: usize) -> Self {
        Self {
            log_frequency: log_frequency.max(1),
        }
    }
}

impl TrainingCallback for ProgressLoggerCallback {
    fn on_epoch_end(&mut self, epoch: usize, state: &TrainingState, metrics: Option<&Metrics>) {
        if (epoch + 1) % self.log_frequency != 0 {
            return;
        }
        let loss = state.train_loss_history.last().copied().unwrap_or(f64::NAN);
        match metrics {
            Some(metrics) => tracing::info!(
                "Epoch {} - training loss: {:.4}, validation: {}",
                epoch + 1,
                loss,
                metrics.summary()
            ),
            None => tracing::info!("Epoch {} - training loss: {:.4}", epoch + 1, loss),
        }
    }
}

/// Writes the validation metrics history to a JSON file
pub struct MetricsLoggerCallback {
    log_file: PathBuf,
    metrics_history: Vec<(usize, Metrics)>,
}

impl MetricsLoggerCallback {
    pub fn new<P: AsRef<Path>>(log_file: P) -> Self {
        Self {
            log_file: log_file.as_ref().to_path_buf(),
            metrics_history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[(usize, Metrics)] {
        &self.metrics_history
    }

    fn save_metrics(&self) -> anyhow::Result<()> {
        write_json(&self.metrics_history, &self.log_file)
    }
}

impl TrainingCallback for MetricsLoggerCallback {
    fn on_epoch_end(&mut self, epoch: usize, _state: &TrainingState, metrics: Option<&Metrics>) {
        let Some(metrics) = metrics else {
            return;
        };
        self.metrics_history.push((epoch, metrics.clone()));

        if let Err(e) = self.save_metrics() {
            tracing::warn!("Failed to save metrics: {}", e);
        }
    }
}

/// Tracks wall-clock time of the epochs
#[derive(Default)]
pub struct TimerCallback {
    start_time: Option<Instant>,
    epoch_start: Option<Instant>,
    epoch_times: Vec<Duration>,
}

impl TimerCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn average_epoch_time(&self) -> Option<Duration> {
        if self.epoch_times.is_empty() {
            None
        } else {
            let total: Duration = self.epoch_times.iter().sum();
            Some(total / self.epoch_times.len() as u32)
        }
    }

    pub fn total_time(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }
}

impl TrainingCallback for TimerCallback {
    fn on_train_begin(&mut self) {
        self.start_time = Some(Instant::now());
        tracing::info!("Training started");
    }

    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.epoch_start = Some(Instant::now());
    }

    fn on_epoch_end(&mut self, epoch: usize, _state: &TrainingState, _metrics: Option<&Metrics>) {
        if let Some(start) = self.epoch_start.take() {
            let elapsed = start.elapsed();
            self.epoch_times.push(elapsed);
            tracing::debug!("Epoch {} took {}", epoch + 1, format_duration(elapsed.as_secs_f64()));
        }
    }

    fn on_train_end(&mut self, state: &TrainingState) {
        if let Some(total) = self.total_time() {
            tracing::info!(
                "Training completed in {} ({} epochs)",
                format_duration(total.as_secs_f64()),
                state.epoch
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metrics_logger_skips_unvalidated_epochs() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("valid-metrics.json");
        let mut callback = MetricsLoggerCallback::new(&log_file);

        let metrics = Metrics {
            roc_auc: Some(0.75),
            ..Metrics::default()
        };
        callback.on_epoch_end(0, &TrainingState::new(), None);
        callback.on_epoch_end(1, &TrainingState::new(), Some(&metrics));

        assert_eq!(callback.history().len(), 1);
        let saved: Vec<(usize, Metrics)> =
            serde_json::from_str(&std::fs::read_to_string(log_file).unwrap()).unwrap();
        assert_eq!(saved, vec![(1, metrics)]);
    }

    #[test]
    fn test_timer_records_epochs() {
        let mut timer = TimerCallback::new();
        timer.on_train_begin();
        timer.on_epoch_begin(0);
        timer.on_epoch_end(0, &TrainingState::new(), None);

        assert!(timer.average_epoch_time().is_some());
        assert!(timer.total_time().is_some());
    }

    #[test]
    fn test_callback_manager() {
        let mut manager = CallbackManager::new();
        manager.add_callback(ProgressLoggerCallback::new(1));
        manager.add_callback(TimerCallback::new());
        assert_eq!(manager.len(), 2);

        let mut state = TrainingState::new();
        manager.on_train_begin();
        manager.on_epoch_begin(0);
        state.update_epoch(0.5, None, 1e-3);
        manager.on_epoch_end(0, &state, None);
        manager.on_train_end(&state);
    }
}

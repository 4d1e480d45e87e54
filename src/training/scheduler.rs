use crate::config::{Config, LrSchedulerType, ModelName};

/// End value of the polynomial schedule
const POLYNOMIAL_LR_END: f64 = 1e-7;

/// Per-step learning rate schedulers
#[derive(Debug, Clone, PartialEq)]
pub enum LearningRateScheduler {
    /// Constant learning rate
    Constant { lr: f64 },
    /// Linear warmup, then constant
    ConstantWithWarmup { lr: f64, warmup_steps: usize },
    /// Linear warmup, then linear decay to zero
    Linear { lr: f64, warmup_steps: usize, total_steps: usize },
    /// Linear warmup, then half a cosine period down to zero
    Cosine { lr: f64, warmup_steps: usize, total_steps: usize },
    /// Linear warmup, then `cycles` hard-restarted cosine periods
    CosineWithRestarts { lr: f64, warmup_steps: usize, total_steps: usize, cycles: usize },
    /// Linear warmup, then polynomial decay to `lr_end`
    Polynomial { lr: f64, warmup_steps: usize, total_steps: usize, lr_end: f64, power: f64 },
    /// Linear rise from `init_lr` to `max_lr`, exponential decay to `final_lr`
    Noam { init_lr: f64, max_lr: f64, final_lr: f64, warmup_steps: usize, total_steps: usize },
}

impl LearningRateScheduler {
    /// Create constant scheduler
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    /// Create the warmup schedule named by `kind`
    pub fn with_warmup(kind: LrSchedulerType, lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        match kind {
            LrSchedulerType::Constant => Self::Constant { lr },
            LrSchedulerType::ConstantWithWarmup => Self::ConstantWithWarmup { lr, warmup_steps },
            LrSchedulerType::Linear => Self::Linear {
                lr,
                warmup_steps,
                total_steps,
            },
            LrSchedulerType::Cosine => Self::Cosine {
                lr,
                warmup_steps,
                total_steps,
            },
            LrSchedulerType::CosineWithRestarts => Self::CosineWithRestarts {
                lr,
                warmup_steps,
                total_steps,
                cycles: 1,
            },
            LrSchedulerType::Polynomial => Self::Polynomial {
                lr,
                warmup_steps,
                total_steps,
                lr_end: POLYNOMIAL_LR_END,
                power: 1.0,
            },
        }
    }

    /// Create Noam scheduler; epochs are converted to steps
    pub fn noam(
        init_lr: f64,
        max_lr: f64,
        final_lr: f64,
        warmup_epochs: f64,
        total_epochs: usize,
        steps_per_epoch: usize,
    ) -> Self {
        Self::Noam {
            init_lr,
            max_lr,
            final_lr,
            warmup_steps: (warmup_epochs * steps_per_epoch as f64) as usize,
            total_steps: total_epochs * steps_per_epoch,
        }
    }

    /// Main training schedule of a run
    pub fn from_config(config: &Config, steps_per_epoch: usize) -> Self {
        if config.model_name == ModelName::Grover {
            return Self::noam(
                config.init_lr,
                config.max_lr,
                config.final_lr,
                config.warmup_epochs,
                config.n_epochs,
                steps_per_epoch,
            );
        }
        let total_steps = config.n_epochs * steps_per_epoch;
        let warmup_steps = (config.warmup_ratio * total_steps as f64).ceil() as usize;
        Self::with_warmup(config.lr_scheduler_type, config.lr, warmup_steps, total_steps)
    }

    /// Learning rate at optimizer step `step` (0-based)
    pub fn get_lr(&self, step: usize) -> f64 {
        match *self {
            Self::Constant { lr } => lr,
            Self::ConstantWithWarmup { lr, warmup_steps } => lr * warmup_factor(step, warmup_steps).unwrap_or(1.0),
            Self::Linear {
                lr,
                warmup_steps,
                total_steps,
            } => {
                if let Some(factor) = warmup_factor(step, warmup_steps) {
                    return lr * factor;
                }
                let remaining = total_steps.saturating_sub(step) as f64;
                let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
                lr * (remaining / span).max(0.0)
            }
            Self::Cosine {
                lr,
                warmup_steps,
                total_steps,
            } => {
                if let Some(factor) = warmup_factor(step, warmup_steps) {
                    return lr * factor;
                }
                let progress = decay_progress(step, warmup_steps, total_steps);
                lr * (0.5 * (1.0 + (std::f64::consts::PI * progress).cos())).max(0.0)
            }
            Self::CosineWithRestarts {
                lr,
                warmup_steps,
                total_steps,
                cycles,
            } => {
                if let Some(factor) = warmup_factor(step, warmup_steps) {
                    return lr * factor;
                }
                let progress = decay_progress(step, warmup_steps, total_steps);
                if progress >= 1.0 {
                    return 0.0;
                }
                let phase = (cycles as f64 * progress) % 1.0;
                lr * 0.5 * (1.0 + (std::f64::consts::PI * phase).cos())
            }
            Self::Polynomial {
                lr,
                warmup_steps,
                total_steps,
                lr_end,
                power,
            } => {
                if let Some(factor) = warmup_factor(step, warmup_steps) {
                    return lr * factor;
                }
                if step > total_steps {
                    return lr_end;
                }
                let remaining = 1.0 - decay_progress(step, warmup_steps, total_steps);
                lr_end + (lr - lr_end) * remaining.powf(power)
            }
            Self::Noam {
                init_lr,
                max_lr,
                final_lr,
                warmup_steps,
                total_steps,
            } => {
                if step <= warmup_steps {
                    let increment = (max_lr - init_lr) / warmup_steps.max(1) as f64;
                    init_lr + step as f64 * increment
                } else if step <= total_steps {
                    let decay_steps = (total_steps - warmup_steps).max(1) as f64;
                    let gamma = (final_lr / max_lr).powf(1.0 / decay_steps);
                    max_lr * gamma.powi((step - warmup_steps) as i32)
                } else {
                    final_lr
                }
            }
        }
    }
}

impl Default for LearningRateScheduler {
    fn default() -> Self {
        Self::constant(1e-4)
    }
}

/// Linear warmup factor, `None` once warmup is over
fn warmup_factor(step: usize, warmup_steps: usize) -> Option<f64> {
    (step < warmup_steps).then(|| step as f64 / warmup_steps as f64)
}

/// Fraction of the decay phase completed, in [0, 1]
fn decay_progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
    (step.saturating_sub(warmup_steps) as f64 / span).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LearningRateScheduler::constant(0.001);
        assert_eq!(scheduler.get_lr(0), 0.001);
        assert_eq!(scheduler.get_lr(100), 0.001);
    }

    #[test]
    fn test_linear_warmup_and_decay() {
        let scheduler = LearningRateScheduler::with_warmup(LrSchedulerType::Linear, 1.0, 10, 110);
        assert_eq!(scheduler.get_lr(0), 0.0);
        assert!(close(scheduler.get_lr(5), 0.5));
        assert_eq!(scheduler.get_lr(10), 1.0);
        assert!(close(scheduler.get_lr(60), 0.5));
        assert_eq!(scheduler.get_lr(110), 0.0);
    }

    #[test]
    fn test_constant_with_warmup() {
        let scheduler = LearningRateScheduler::with_warmup(LrSchedulerType::ConstantWithWarmup, 0.1, 4, 100);
        assert!(close(scheduler.get_lr(2), 0.05));
        assert_eq!(scheduler.get_lr(50), 0.1);
    }

    #[test]
    fn test_cosine_scheduler() {
        let scheduler = LearningRateScheduler::with_warmup(LrSchedulerType::Cosine, 1.0, 0, 100);
        assert_eq!(scheduler.get_lr(0), 1.0);
        assert!(close(scheduler.get_lr(50), 0.5));
        assert!(scheduler.get_lr(100).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_with_restarts_ends_at_zero() {
        let scheduler = LearningRateScheduler::with_warmup(LrSchedulerType::CosineWithRestarts, 1.0, 0, 10);
        assert_eq!(scheduler.get_lr(0), 1.0);
        assert_eq!(scheduler.get_lr(10), 0.0);
    }

    #[test]
    fn test_polynomial_reaches_end() {
        let scheduler = LearningRateScheduler::with_warmup(LrSchedulerType::Polynomial, 1.0, 0, 10);
        assert!(close(scheduler.get_lr(5), POLYNOMIAL_LR_END + (1.0 - POLYNOMIAL_LR_END) * 0.5));
        assert_eq!(scheduler.get_lr(11), POLYNOMIAL_LR_END);
    }

    #[test]
    fn test_noam_scheduler() {
        let scheduler = LearningRateScheduler::noam(1e-4, 1e-3, 1e-5, 2.0, 10, 5);
        assert!(close(scheduler.get_lr(0), 1e-4));
        assert!(close(scheduler.get_lr(10), 1e-3));
        assert!((scheduler.get_lr(50) - 1e-5).abs() < 1e-12);
        assert_eq!(scheduler.get_lr(51), 1e-5);
        assert!(scheduler.get_lr(30) < 1e-3 && scheduler.get_lr(30) > 1e-5);
    }

    #[test]
    fn test_from_config_selects_noam_for_grover() {
        let config = Config {
            model_name: ModelName::Grover,
            n_epochs: 4,
            ..Config::default()
        };
        assert!(matches!(
            LearningRateScheduler::from_config(&config, 3),
            LearningRateScheduler::Noam { total_steps: 12, .. }
        ));
    }
}

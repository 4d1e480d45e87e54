use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Monotone non-decreasing fit by pool-adjacent-violators
///
/// Predictions interpolate linearly between fitted points and are clipped
/// to the fitted range outside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicRegression {
    xs: Vec<f32>,
    ys: Vec<f32>,
}

struct Block {
    sum: f64,
    weight: f64,
    x_lo: f32,
    x_hi: f32,
}

impl IsotonicRegression {
    pub fn fit(x: &[f32], y: &[f32]) -> Result<Self> {
        if x.len() != y.len() {
            bail!("Isotonic regression needs paired inputs, got {} and {}", x.len(), y.len());
        }
        if x.is_empty() {
            bail!("Isotonic regression needs at least one point");
        }

        let mut points: Vec<(f32, f32)> = x.iter().copied().zip(y.iter().copied()).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut blocks: Vec<Block> = Vec::with_capacity(points.len());
        for (x, y) in points {
            blocks.push(Block {
                sum: y as f64,
                weight: 1.0,
                x_lo: x,
                x_hi: x,
            });
            // Merge backwards while the sequence of block means decreases
            while blocks.len() > 1 {
                let n = blocks.len();
                let last = &blocks[n - 1];
                let prev = &blocks[n - 2];
                if prev.sum / prev.weight <= last.sum / last.weight {
                    break;
                }
                if let Some(last) = blocks.pop() {
                    let prev = &mut blocks[n - 2];
                    prev.sum += last.sum;
                    prev.weight += last.weight;
                    prev.x_hi = last.x_hi;
                }
            }
        }

        let mut xs = Vec::with_capacity(blocks.len() * 2);
        let mut ys = Vec::with_capacity(blocks.len() * 2);
        for block in blocks {
            let value = (block.sum / block.weight) as f32;
            xs.push(block.x_lo);
            ys.push(value);
            if block.x_hi > block.x_lo {
                xs.push(block.x_hi);
                ys.push(value);
            }
        }
        Ok(Self { xs, ys })
    }

    pub fn predict(&self, x: f32) -> f32 {
        let n = self.xs.len();
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= self.xs[n - 1] {
            return self.ys[n - 1];
        }
        let hi = self.xs.partition_point(|&v| v <= x);
        let lo = hi - 1;
        let span = self.xs[hi] - self.xs[lo];
        if span <= 0.0 {
            return self.ys[hi];
        }
        let t = (x - self.xs[lo]) / span;
        self.ys[lo] + t * (self.ys[hi] - self.ys[lo])
    }
}

/// Per-task isotonic recalibration of predicted probabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsotonicCalibration {
    tasks: Vec<Option<IsotonicRegression>>,
}

impl IsotonicCalibration {
    /// Fit one regressor per task on observed validation entries
    ///
    /// `preds`, `lbs` and `masks` are row-major `[n, n_tasks]`.
    pub fn fit(preds: &[f32], lbs: &[f32], masks: &[f32], n_tasks: usize) -> Result<Self> {
        if n_tasks == 0 || preds.len() % n_tasks != 0 || preds.len() != lbs.len() || lbs.len() != masks.len() {
            bail!("Predictions, labels and masks must all be shaped [n, {}]", n_tasks);
        }

        let mut tasks = Vec::with_capacity(n_tasks);
        for task in 0..n_tasks {
            let (x, y): (Vec<f32>, Vec<f32>) = (task..preds.len())
                .step_by(n_tasks)
                .filter(|&i| masks[i] > 0.0)
                .map(|i| (preds[i], lbs[i]))
                .unzip();
            if x.is_empty() {
                warn!("Task {} has no observed validation labels; leaving it uncalibrated", task);
                tasks.push(None);
            } else {
                tasks.push(Some(IsotonicRegression::fit(&x, &y)?));
            }
        }
        Ok(Self { tasks })
    }

    /// Recalibrate `[n, n_tasks]` predictions in place
    pub fn calibrate(&self, preds: &mut [f32]) {
        let n_tasks = self.tasks.len();
        if n_tasks == 0 {
            return;
        }
        for (i, p) in preds.iter_mut().enumerate() {
            if let Some(regressor) = &self.tasks[i % n_tasks] {
                *p = regressor.predict(*p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pav_pools_violators() {
        let iso = IsotonicRegression::fit(&[1.0, 2.0, 3.0, 4.0], &[1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_eq!(iso.predict(1.0), 1.0);
        assert_eq!(iso.predict(2.0), 2.5);
        assert_eq!(iso.predict(3.0), 2.5);
        assert_eq!(iso.predict(4.0), 4.0);
    }

    #[test]
    fn test_interpolates_and_clips() {
        let iso = IsotonicRegression::fit(&[0.0, 1.0], &[0.0, 1.0]).unwrap();
        assert!((iso.predict(0.25) - 0.25).abs() < 1e-6);
        assert_eq!(iso.predict(-1.0), 0.0);
        assert_eq!(iso.predict(2.0), 1.0);
    }

    #[test]
    fn test_output_is_monotone() {
        let x: Vec<f32> = (0..50).map(|i| i as f32 / 50.0).collect();
        let y: Vec<f32> = (0..50).map(|i| if i % 3 == 0 { 1.0 } else { 0.0 }).collect();
        let iso = IsotonicRegression::fit(&x, &y).unwrap();

        let preds: Vec<f32> = x.iter().map(|&v| iso.predict(v)).collect();
        assert!(preds.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_calibration_per_task() {
        // Task 0 is anti-correlated, task 1 has no observed labels
        let preds = vec![0.9, 0.5, 0.1, 0.5];
        let lbs = vec![0.0, 0.0, 1.0, 0.0];
        let masks = vec![1.0, 0.0, 1.0, 0.0];

        let calibration = IsotonicCalibration::fit(&preds, &lbs, &masks, 2).unwrap();
        let mut calibrated = preds.clone();
        calibration.calibrate(&mut calibrated);

        assert_eq!(calibrated, vec![0.5, 0.5, 0.5, 0.5]);
    }
}

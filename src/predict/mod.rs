//! Normalized predictions and their persistence

use crate::config::TaskType;
use crate::model::loss::{LossSpec, VARIANCE_EPS};
use crate::model::HostLogits;
use crate::utils::write_json;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Predicted probabilities or regression values for a set of molecules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    pub task_type: TaskType,
    pub n_tasks: usize,
    /// Columns per task: 1 for sigmoid outputs and regression, C for softmax
    pub n_classes: usize,
    /// Row-major `[n, n_tasks, n_classes]`; sigmoid columns hold the positive-class probability
    pub preds: Vec<f32>,
    /// Regression variances `[n, n_tasks]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variances: Option<Vec<f32>>,
}

impl Predictions {
    /// Normalize raw logits: sigmoid, softmax or mean/variance split
    ///
    /// Dual-head logits are normalized per head and averaged.
    pub fn from_logits(logits: &HostLogits, spec: &LossSpec) -> Result<Self> {
        match logits {
            HostLogits::Single(values) => Self::normalize(values, spec),
            HostLogits::Paired(atom, bond) => {
                let atom = Self::normalize(atom, spec)?;
                let bond = Self::normalize(bond, spec)?;
                atom.average_with(&bond)
            }
        }
    }

    fn normalize(logits: &[f32], spec: &LossSpec) -> Result<Self> {
        let width = spec.n_tasks * spec.n_lbs;
        if width == 0 || logits.len() % width != 0 {
            bail!("{} logits do not fit rows of {} columns", logits.len(), width);
        }

        let mut predictions = Self {
            task_type: spec.task_type,
            n_tasks: spec.n_tasks,
            n_classes: 1,
            preds: Vec::with_capacity(logits.len()),
            variances: None,
        };

        match (spec.task_type, spec.n_lbs) {
            (TaskType::Classification, 1) => {
                predictions.preds.extend(logits.iter().map(|&x| sigmoid(x)));
            }
            (TaskType::Classification, n_classes) => {
                predictions.n_classes = n_classes;
                for chunk in logits.chunks(n_classes) {
                    predictions.preds.extend(softmax(chunk));
                }
            }
            (TaskType::Regression, 1) => predictions.preds.extend_from_slice(logits),
            (TaskType::Regression, _) => {
                let mut variances = Vec::with_capacity(logits.len() / 2);
                for pair in logits.chunks(2) {
                    predictions.preds.push(pair[0]);
                    variances.push(softplus(pair[1]) + VARIANCE_EPS as f32);
                }
                predictions.variances = Some(variances);
            }
        }
        Ok(predictions)
    }

    /// Number of molecules
    pub fn len(&self) -> usize {
        let width = self.n_tasks * self.n_classes;
        if width == 0 {
            0
        } else {
            self.preds.len() / width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Predicted value of a regression task, or first column of a classification one
    pub fn value(&self, row: usize, task: usize) -> f32 {
        self.preds[(row * self.n_tasks + task) * self.n_classes]
    }

    pub fn variance(&self, row: usize, task: usize) -> Option<f32> {
        self.variances.as_ref().map(|v| v[row * self.n_tasks + task])
    }

    /// Full class distribution of one entry; sigmoid outputs expand to `[1 - p, p]`
    pub fn class_probs(&self, row: usize, task: usize) -> Vec<f64> {
        let start = (row * self.n_tasks + task) * self.n_classes;
        if self.n_classes == 1 {
            let p = self.preds[start] as f64;
            vec![1.0 - p, p]
        } else {
            self.preds[start..start + self.n_classes].iter().map(|&p| p as f64).collect()
        }
    }

    /// `[n, n_tasks]` view for per-task calibration of sigmoid outputs
    pub fn positive_probs_mut(&mut self) -> Option<&mut [f32]> {
        (self.task_type == TaskType::Classification && self.n_classes == 1).then_some(self.preds.as_mut_slice())
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.task_type != other.task_type
            || self.n_tasks != other.n_tasks
            || self.n_classes != other.n_classes
            || self.preds.len() != other.preds.len()
        {
            bail!("Cannot combine predictions of different shapes");
        }
        Ok(())
    }

    fn average_with(&self, other: &Self) -> Result<Self> {
        self.check_compatible(other)?;
        let mean = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect::<Vec<_>>();
        Ok(Self {
            preds: mean(&self.preds, &other.preds),
            variances: match (&self.variances, &other.variances) {
                (Some(a), Some(b)) => Some(mean(a, b)),
                _ => None,
            },
            ..self.clone()
        })
    }

    /// Combine repeated inference passes
    ///
    /// Predictions are averaged. Regression variances combine the mean
    /// predicted variance with the spread of the predicted means.
    pub fn aggregate(samples: &[Predictions]) -> Result<Self> {
        let Some(first) = samples.first() else {
            bail!("No predictions to aggregate");
        };
        for sample in &samples[1..] {
            first.check_compatible(sample)?;
        }

        let k = samples.len() as f32;
        let mut preds = vec![0.0f32; first.preds.len()];
        for sample in samples {
            for (acc, &p) in preds.iter_mut().zip(&sample.preds) {
                *acc += p / k;
            }
        }

        let variances = if first.task_type == TaskType::Regression && (samples.len() > 1 || first.variances.is_some())
        {
            let mut variances = vec![0.0f32; preds.len()];
            for sample in samples {
                for (i, var) in variances.iter_mut().enumerate() {
                    let spread = (sample.preds[i] - preds[i]).powi(2);
                    let predicted = sample.variances.as_ref().map_or(0.0, |v| v[i]);
                    *var += (spread + predicted) / k;
                }
            }
            Some(variances)
        } else {
            None
        };

        Ok(Self {
            preds,
            variances,
            ..first.clone()
        })
    }

    /// Write as JSON, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(self, path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("Failed to read predictions {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse predictions {:?}", path))
    }

    /// Export one row per molecule with a column per task (and class)
    pub fn write_csv<P: AsRef<Path>>(&self, path: P, smiles: &[String]) -> Result<()> {
        let path = path.as_ref();
        if smiles.len() != self.len() {
            bail!("{} SMILES for {} predictions", smiles.len(), self.len());
        }

        let mut writer = csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;

        let mut header = vec!["smiles".to_string()];
        for task in 0..self.n_tasks {
            if self.n_classes == 1 {
                header.push(format!("task_{}", task));
            } else {
                header.extend((0..self.n_classes).map(|c| format!("task_{}_class_{}", task, c)));
            }
            if self.variances.is_some() {
                header.push(format!("task_{}_variance", task));
            }
        }
        writer.write_record(&header)?;

        let width = self.n_tasks * self.n_classes;
        for (row, s) in smiles.iter().enumerate() {
            let mut record = vec![s.clone()];
            for task in 0..self.n_tasks {
                let start = row * width + task * self.n_classes;
                record.extend(self.preds[start..start + self.n_classes].iter().map(|p| format!("{:.6}", p)));
                if let Some(var) = self.variance(row, task) {
                    record.push(format!("{:.6}", var));
                }
            }
            writer.write_record(&record)?;
        }
        writer.flush().with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(task_type: TaskType, n_tasks: usize, n_lbs: usize) -> LossSpec {
        LossSpec {
            task_type,
            n_tasks,
            n_lbs,
            dist_coff: 0.1,
            focal: None,
        }
    }

    #[test]
    fn test_sigmoid_normalization() {
        let logits = HostLogits::Single(vec![0.0, 100.0]);
        let preds = Predictions::from_logits(&logits, &spec(TaskType::Classification, 2, 1)).unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds.preds, vec![0.5, 1.0]);
        assert_eq!(preds.class_probs(0, 0), vec![0.5, 0.5]);
    }

    #[test]
    fn test_softmax_normalization() {
        let logits = HostLogits::Single(vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        let preds = Predictions::from_logits(&logits, &spec(TaskType::Classification, 1, 3)).unwrap();
        assert_eq!(preds.len(), 2);
        for p in &preds.preds[3..] {
            assert!((p - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_paired_heads_are_averaged() {
        let logits = HostLogits::Paired(vec![1.0, 0.0], vec![3.0, 2.0]);
        let preds = Predictions::from_logits(&logits, &spec(TaskType::Regression, 1, 2)).unwrap();
        assert_eq!(preds.preds, vec![2.0]);

        let expected_var = (softplus(0.0) + softplus(2.0)) / 2.0 + VARIANCE_EPS as f32;
        assert!((preds.variance(0, 0).unwrap() - expected_var).abs() < 1e-6);
    }

    #[test]
    fn test_aggregate_regression_spread() {
        let spec = spec(TaskType::Regression, 1, 1);
        let a = Predictions::from_logits(&HostLogits::Single(vec![1.0]), &spec).unwrap();
        let b = Predictions::from_logits(&HostLogits::Single(vec![3.0]), &spec).unwrap();

        let aggregated = Predictions::aggregate(&[a.clone(), b]).unwrap();
        assert_eq!(aggregated.preds, vec![2.0]);
        assert_eq!(aggregated.variances, Some(vec![1.0]));

        // A single deterministic pass carries no variance
        assert_eq!(Predictions::aggregate(&[a]).unwrap().variances, None);
    }

    #[test]
    fn test_aggregate_rejects_mismatch() {
        let a = Predictions::from_logits(&HostLogits::Single(vec![1.0]), &spec(TaskType::Regression, 1, 1)).unwrap();
        let b = Predictions::from_logits(&HostLogits::Single(vec![1.0, 2.0]), &spec(TaskType::Regression, 1, 1)).unwrap();
        assert!(Predictions::aggregate(&[a, b]).is_err());
        assert!(Predictions::aggregate(&[]).is_err());
    }

    #[test]
    fn test_save_and_export() {
        let temp_dir = TempDir::new().unwrap();
        let preds = Predictions::from_logits(&HostLogits::Single(vec![0.0, 2.0]), &spec(TaskType::Classification, 1, 1))
            .unwrap();

        let json_path = temp_dir.path().join("preds").join("0.json");
        preds.save(&json_path).unwrap();
        assert_eq!(Predictions::load(&json_path).unwrap(), preds);

        let csv_path = temp_dir.path().join("preds.csv");
        preds.write_csv(&csv_path, &["C".to_string(), "CO".to_string()]).unwrap();
        let content = std::fs::read_to_string(csv_path).unwrap();
        assert!(content.starts_with("smiles,task_0\n"));
        assert!(content.contains("C,0.500000"));

        assert!(preds.write_csv(temp_dir.path().join("bad.csv"), &[]).is_err());
    }
}

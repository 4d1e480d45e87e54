//! Host-side evaluation metrics
//!
//! Every metric is computed per task over the observed entries and then
//! averaged over the tasks where it is defined (a task whose validation
//! labels hold a single class has no ROC-AUC, for instance).

use crate::config::{EvalMetric, TaskType};
use crate::predict::Predictions;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Number of equal-width confidence bins of the ECE
const N_ECE_BINS: usize = 15;

/// Probability clamp used by log-likelihoods
const PROB_EPS: f64 = 1e-7;

/// Evaluation metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Area under the ROC curve
    #[serde(rename = "roc-auc", skip_serializing_if = "Option::is_none")]
    pub roc_auc: Option<f64>,
    /// Area under the precision-recall curve (average precision)
    #[serde(rename = "prc-auc", skip_serializing_if = "Option::is_none")]
    pub prc_auc: Option<f64>,
    /// Expected calibration error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ece: Option<f64>,
    /// Negative log-likelihood
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nll: Option<f64>,
    /// Brier score
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rmse: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mae: Option<f64>,
    /// Regression calibration error over central prediction intervals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ce: Option<f64>,
}

impl Metrics {
    /// Value of the model-selection metric
    pub fn get(&self, metric: EvalMetric) -> Option<f64> {
        match metric {
            EvalMetric::RocAuc => self.roc_auc,
            EvalMetric::PrcAuc => self.prc_auc,
            EvalMetric::Rmse => self.rmse,
            EvalMetric::Mae => self.mae,
        }
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        let fields = [
            ("roc-auc", self.roc_auc),
            ("prc-auc", self.prc_auc),
            ("ece", self.ece),
            ("nll", self.nll),
            ("brier", self.brier),
            ("rmse", self.rmse),
            ("mae", self.mae),
            ("ce", self.ce),
        ];
        fields
            .iter()
            .filter_map(|(name, value)| value.map(|v| format!("{}: {:.4}", name, v)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Evaluate predictions against `[n, n_tasks]` labels and masks
pub fn evaluate(preds: &Predictions, lbs: &[f32], masks: &[f32]) -> Result<Metrics> {
    let expected = preds.len() * preds.n_tasks;
    if lbs.len() != expected || masks.len() != expected {
        bail!(
            "Labels ({}) and masks ({}) must match {} predictions x {} tasks",
            lbs.len(),
            masks.len(),
            preds.len(),
            preds.n_tasks
        );
    }
    Ok(match preds.task_type {
        TaskType::Classification => classification_metrics(preds, lbs, masks),
        TaskType::Regression => regression_metrics(preds, lbs, masks),
    })
}

/// Observed (row, label) pairs of one task
fn observed(n: usize, n_tasks: usize, task: usize, lbs: &[f32], masks: &[f32]) -> Vec<(usize, f32)> {
    (0..n)
        .filter(|&i| masks[i * n_tasks + task] > 0.0)
        .map(|i| (i, lbs[i * n_tasks + task]))
        .collect()
}

fn mean_defined(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let defined: Vec<f64> = values.into_iter().flatten().filter(|v| v.is_finite()).collect();
    (!defined.is_empty()).then(|| defined.iter().sum::<f64>() / defined.len() as f64)
}

fn classification_metrics(preds: &Predictions, lbs: &[f32], masks: &[f32]) -> Metrics {
    let n = preds.len();
    let n_tasks = preds.n_tasks;
    let n_classes = preds.n_classes.max(2);

    let mut roc = Vec::with_capacity(n_tasks);
    let mut prc = Vec::with_capacity(n_tasks);
    let mut ece = Vec::with_capacity(n_tasks);
    let mut nll = Vec::with_capacity(n_tasks);
    let mut brier = Vec::with_capacity(n_tasks);

    for task in 0..n_tasks {
        let rows = observed(n, n_tasks, task, lbs, masks);
        if rows.is_empty() {
            continue;
        }
        let probs: Vec<Vec<f64>> = rows.iter().map(|&(i, _)| preds.class_probs(i, task)).collect();
        let labels: Vec<usize> = rows.iter().map(|&(_, y)| y.round().max(0.0) as usize).collect();

        // Binary tasks score the positive class; multi-class tasks average one-vs-rest
        let scored_classes: Vec<usize> = if n_classes == 2 { vec![1] } else { (0..n_classes).collect() };
        let mut task_roc = Vec::new();
        let mut task_prc = Vec::new();
        for &c in &scored_classes {
            let scores: Vec<f64> = probs.iter().map(|p| p[c]).collect();
            let targets: Vec<bool> = labels.iter().map(|&y| y == c).collect();
            task_roc.push(roc_auc(&scores, &targets));
            task_prc.push(average_precision(&scores, &targets));
        }
        roc.push(mean_defined(task_roc));
        prc.push(mean_defined(task_prc));

        ece.push(Some(expected_calibration_error(&probs, &labels)));
        nll.push(Some(
            probs
                .iter()
                .zip(&labels)
                .map(|(p, &y)| -p.get(y).copied().unwrap_or(0.0).clamp(PROB_EPS, 1.0).ln())
                .sum::<f64>()
                / labels.len() as f64,
        ));
        brier.push(Some(
            probs
                .iter()
                .zip(&labels)
                .map(|(p, &y)| {
                    if n_classes == 2 {
                        (p[1] - (y == 1) as u8 as f64).powi(2)
                    } else {
                        p.iter()
                            .enumerate()
                            .map(|(c, &pc)| (pc - (c == y) as u8 as f64).powi(2))
                            .sum()
                    }
                })
                .sum::<f64>()
                / labels.len() as f64,
        ));
    }

    Metrics {
        roc_auc: mean_defined(roc),
        prc_auc: mean_defined(prc),
        ece: mean_defined(ece),
        nll: mean_defined(nll),
        brier: mean_defined(brier),
        ..Metrics::default()
    }
}

fn regression_metrics(preds: &Predictions, lbs: &[f32], masks: &[f32]) -> Metrics {
    let n = preds.len();
    let n_tasks = preds.n_tasks;

    let mut rmse = Vec::with_capacity(n_tasks);
    let mut mae = Vec::with_capacity(n_tasks);
    let mut nll = Vec::with_capacity(n_tasks);
    let mut ce = Vec::with_capacity(n_tasks);

    for task in 0..n_tasks {
        let rows = observed(n, n_tasks, task, lbs, masks);
        if rows.is_empty() {
            continue;
        }
        let count = rows.len() as f64;
        let errors: Vec<f64> = rows
            .iter()
            .map(|&(i, y)| preds.value(i, task) as f64 - y as f64)
            .collect();

        rmse.push(Some((errors.iter().map(|e| e * e).sum::<f64>() / count).sqrt()));
        mae.push(Some(errors.iter().map(|e| e.abs()).sum::<f64>() / count));

        if preds.variances.is_some() {
            let vars: Vec<f64> = rows
                .iter()
                .map(|&(i, _)| preds.variance(i, task).unwrap_or(0.0).max(PROB_EPS as f32) as f64)
                .collect();
            nll.push(Some(
                errors
                    .iter()
                    .zip(&vars)
                    .map(|(e, v)| 0.5 * ((2.0 * std::f64::consts::PI * v).ln() + e * e / v))
                    .sum::<f64>()
                    / count,
            ));
            ce.push(Some(regression_calibration_error(&errors, &vars)));
        }
    }

    Metrics {
        rmse: mean_defined(rmse),
        mae: mean_defined(mae),
        nll: mean_defined(nll),
        ce: mean_defined(ce),
        ..Metrics::default()
    }
}

/// Area under the ROC curve by the rank-sum statistic; ties share ranks
pub fn roc_auc(scores: &[f64], targets: &[bool]) -> Option<f64> {
    let n_pos = targets.iter().filter(|&&t| t).count();
    let n_neg = targets.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Average 1-based rank of the tie group
        let rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += rank * order[i..=j].iter().filter(|&&k| targets[k]).count() as f64;
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    Some((rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64))
}

/// Average precision: sum over thresholds of precision times recall gain
pub fn average_precision(scores: &[f64], targets: &[bool]) -> Option<f64> {
    let n_pos = targets.iter().filter(|&&t| t).count();
    if n_pos == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut tp = 0usize;
    let mut seen = 0usize;
    let mut prev_recall = 0.0;
    let mut ap = 0.0;
    let mut i = 0;
    while i < order.len() {
        // Thresholds fall between distinct scores
        let mut j = i;
        while j < order.len() && scores[order[j]] == scores[order[i]] {
            tp += targets[order[j]] as usize;
            seen += 1;
            j += 1;
        }
        let recall = tp as f64 / n_pos as f64;
        let precision = tp as f64 / seen as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
        i = j;
    }
    Some(ap)
}

/// Expected calibration error over equal-width confidence bins
pub fn expected_calibration_error(probs: &[Vec<f64>], labels: &[usize]) -> f64 {
    let mut bin_conf = [0.0f64; N_ECE_BINS];
    let mut bin_acc = [0.0f64; N_ECE_BINS];
    let mut bin_count = [0usize; N_ECE_BINS];

    for (p, &y) in probs.iter().zip(labels) {
        let (pred, conf) = p
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (c, v)| if v > best.1 { (c, v) } else { best });
        let bin = ((conf * N_ECE_BINS as f64).ceil() as usize).clamp(1, N_ECE_BINS) - 1;
        bin_conf[bin] += conf;
        bin_acc[bin] += (pred == y) as u8 as f64;
        bin_count[bin] += 1;
    }

    let total = labels.len().max(1) as f64;
    (0..N_ECE_BINS)
        .filter(|&b| bin_count[b] > 0)
        .map(|b| (bin_acc[b] - bin_conf[b]).abs() / total)
        .sum()
}

/// Mean gap between nominal and observed coverage of central Gaussian intervals
fn regression_calibration_error(errors: &[f64], vars: &[f64]) -> f64 {
    let levels: Vec<f64> = (1..10).map(|k| k as f64 / 10.0).collect();
    let cdfs: Vec<f64> = errors
        .iter()
        .zip(vars)
        .map(|(e, v)| normal_cdf(-e / v.sqrt()))
        .collect();

    levels
        .iter()
        .map(|&level| {
            let lo = 0.5 - level / 2.0;
            let hi = 0.5 + level / 2.0;
            let covered = cdfs.iter().filter(|&&c| c >= lo && c <= hi).count() as f64 / cdfs.len() as f64;
            (covered - level).abs()
        })
        .sum::<f64>()
        / levels.len() as f64
}

/// Standard normal CDF (Abramowitz and Stegun 7.1.26)
fn normal_cdf(x: f64) -> f64 {
    let z = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.327_591_1 * z);
    let poly = t * (0.254_829_592 + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let erf = 1.0 - poly * (-z * z).exp();
    if x >= 0.0 {
        0.5 * (1.0 + erf)
    } else {
        0.5 * (1.0 - erf)
    }
}

//! Enumerated option values shared by the CLI and the persisted configuration.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Model architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Default)]
pub enum ModelName {
    /// Fully connected network over fingerprint features
    #[default]
    #[serde(rename = "DNN")]
    #[value(name = "DNN")]
    Dnn,
    /// Transformer encoder over SMILES tokens
    #[serde(rename = "ChemBERTa")]
    #[value(name = "ChemBERTa")]
    ChemBerta,
    /// Pretrained encoder with atom and bond readout heads
    #[serde(rename = "GROVER")]
    #[value(name = "GROVER")]
    Grover,
}

impl ModelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::Dnn => "DNN",
            ModelName::ChemBerta => "ChemBERTa",
            ModelName::Grover => "GROVER",
        }
    }

    /// Whether the model consumes token ids instead of fixed-size features
    pub fn uses_tokens(&self) -> bool {
        matches!(self, ModelName::ChemBerta | ModelName::Grover)
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Molecular fingerprint generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lowercase")]
pub enum FeatureType {
    #[default]
    None,
    /// Normalized RDKit 2D descriptors
    Rdkit,
    /// Binary circular fingerprint
    Morgan,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::None => "none",
            FeatureType::Rdkit => "rdkit",
            FeatureType::Morgan => "morgan",
        }
    }

    /// Dimensionality of the generated feature vector
    pub fn dim(&self) -> usize {
        match self {
            FeatureType::Rdkit => 200,
            FeatureType::Morgan => 1024,
            FeatureType::None => 0,
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Uncertainty estimation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum, Default)]
pub enum UncertaintyMethod {
    #[default]
    #[serde(rename = "none")]
    #[value(name = "none")]
    None,
    #[serde(rename = "TemperatureScaling")]
    #[value(name = "TemperatureScaling")]
    TemperatureScaling,
    #[serde(rename = "MC-Dropout")]
    #[value(name = "MC-Dropout")]
    McDropout,
    #[serde(rename = "SWAG")]
    #[value(name = "SWAG")]
    Swag,
    #[serde(rename = "BBP")]
    #[value(name = "BBP")]
    Bbp,
    #[serde(rename = "SGLD")]
    #[value(name = "SGLD")]
    Sgld,
    #[serde(rename = "Ensembles")]
    #[value(name = "Ensembles")]
    Ensembles,
    #[serde(rename = "FocalLoss")]
    #[value(name = "FocalLoss")]
    FocalLoss,
    #[serde(rename = "IsotonicCalibration")]
    #[value(name = "IsotonicCalibration")]
    IsotonicCalibration,
}

impl UncertaintyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UncertaintyMethod::None => "none",
            UncertaintyMethod::TemperatureScaling => "TemperatureScaling",
            UncertaintyMethod::McDropout => "MC-Dropout",
            UncertaintyMethod::Swag => "SWAG",
            UncertaintyMethod::Bbp => "BBP",
            UncertaintyMethod::Sgld => "SGLD",
            UncertaintyMethod::Ensembles => "Ensembles",
            UncertaintyMethod::FocalLoss => "FocalLoss",
            UncertaintyMethod::IsotonicCalibration => "IsotonicCalibration",
        }
    }

    /// Whether repeated test passes produce different predictions
    pub fn is_stochastic(&self) -> bool {
        matches!(
            self,
            UncertaintyMethod::McDropout
                | UncertaintyMethod::Swag
                | UncertaintyMethod::Bbp
                | UncertaintyMethod::Sgld
        )
    }
}

impl fmt::Display for UncertaintyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prediction task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Classification,
    Regression,
}

/// Learning rate schedule with warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum LrSchedulerType {
    Linear,
    Cosine,
    CosineWithRestarts,
    Polynomial,
    #[default]
    Constant,
    ConstantWithWarmup,
}

/// Validation metric used to select the best checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalMetric {
    #[serde(rename = "roc-auc")]
    RocAuc,
    #[serde(rename = "prc-auc")]
    PrcAuc,
    #[serde(rename = "rmse")]
    Rmse,
    #[serde(rename = "mae")]
    Mae,
}

impl EvalMetric {
    /// Whether larger values indicate a better model
    pub fn higher_is_better(&self) -> bool {
        matches!(self, EvalMetric::RocAuc | EvalMetric::PrcAuc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalMetric::RocAuc => "roc-auc",
            EvalMetric::PrcAuc => "prc-auc",
            EvalMetric::Rmse => "rmse",
            EvalMetric::Mae => "mae",
        }
    }
}

/// Compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names() {
        let method: UncertaintyMethod = serde_json::from_str("\"MC-Dropout\"").unwrap();
        assert_eq!(method, UncertaintyMethod::McDropout);
        assert_eq!(serde_json::to_string(&ModelName::ChemBerta).unwrap(), "\"ChemBERTa\"");
        assert_eq!(
            serde_json::to_string(&LrSchedulerType::CosineWithRestarts).unwrap(),
            "\"cosine_with_restarts\""
        );
        let metric: EvalMetric = serde_json::from_str("\"roc-auc\"").unwrap();
        assert!(metric.higher_is_better());
    }

    #[test]
    fn test_feature_dims() {
        assert_eq!(FeatureType::Rdkit.dim(), 200);
        assert_eq!(FeatureType::Morgan.dim(), 1024);
        assert_eq!(FeatureType::None.dim(), 0);
    }
}

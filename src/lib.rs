//! # muben: molecular property prediction with uncertainty quantification
//!
//! muben trains property predictors on SMILES datasets and wraps them in
//! uncertainty estimation and calibration methods.
//!
//! ## Features
//!
//! - Fingerprint DNN, token transformer (ChemBERTa-style) and dual-head
//!   pretrained encoder (GROVER-style) models
//! - MC-Dropout, deep ensembles, Bayes-by-backprop, SWAG, SGLD, temperature
//!   scaling, focal loss and isotonic calibration around one training loop
//! - Feature caches so featurization runs once per dataset split
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use burn::backend::Autodiff;
//! use muben::config::{Arguments, Config, META_FILE_NAME};
//! use muben::data::Featurizer;
//! use muben::training::run_experiment;
//!
//! let mut config = Config::from_args(&Arguments::default());
//! config.get_meta(None, META_FILE_NAME).unwrap();
//!
//! let featurizer = Featurizer::from_config(&config).unwrap();
//! let device = Default::default();
//! let output = run_experiment::<Autodiff<muben::DefaultBackend>>(&config, &device, &featurizer).unwrap();
//! println!("{}", output.metrics.summary());
//! ```

pub mod cli;
pub mod config;
pub mod data;
pub mod model;
pub mod predict;
pub mod training;
pub mod uncertainty;
pub mod utils;

use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

pub use config::Config;
pub use data::{Dataset, Featurizer};
pub use predict::Predictions;
pub use training::{run_experiment, Metrics, TrainingResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - molecular property prediction with uncertainty quantification",
        NAME, VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_info() {
        let info_str = info();
        assert!(info_str.contains("muben"));
        assert!(info_str.contains(VERSION));
    }
}

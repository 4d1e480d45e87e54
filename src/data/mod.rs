pub mod collate;
pub mod dataset;
pub mod features;
pub mod loader;
pub mod tokenizer;

pub use collate::{Batch, Collator};
pub use dataset::Dataset;
pub use features::{FeatureGenerator, Featurizer};
pub use tokenizer::SmilesTokenizer;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dataset partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Train,
    Valid,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Valid, Partition::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Valid => "valid",
            Partition::Test => "test",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Partition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Partition::Train),
            "valid" => Ok(Partition::Valid),
            "test" => Ok(Partition::Test),
            _ => bail!("Argument `partition` should be one of 'train', 'valid' or 'test'!"),
        }
    }
}

/// Model input of one molecule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoleculeFeatures {
    /// No precomputed input
    Empty,
    /// Fixed-width fingerprint or descriptor vector
    Vector(Vec<f32>),
    /// Token ids, special tokens included
    Tokens(Vec<u32>),
}

impl MoleculeFeatures {
    /// Short name of the input kind
    pub fn kind(&self) -> &'static str {
        match self {
            MoleculeFeatures::Empty => "no features",
            MoleculeFeatures::Vector(_) => "a feature vector",
            MoleculeFeatures::Tokens(_) => "token ids",
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            MoleculeFeatures::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tokens(&self) -> Option<&[u32]> {
        match self {
            MoleculeFeatures::Tokens(t) => Some(t),
            _ => None,
        }
    }
}

/// One molecule ready for batching
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Model input
    pub features: MoleculeFeatures,
    /// Label per task
    pub lbs: Vec<f32>,
    /// 1.0 where the label entry is observed, 0.0 otherwise
    pub masks: Vec<f32>,
}

impl Instance {
    /// Number of observed label entries
    pub fn n_observed(&self) -> usize {
        self.masks.iter().filter(|&&m| m > 0.0).count()
    }
}

//! Per-model featurization of SMILES strings

use crate::config::{Config, FeatureType};
use crate::data::tokenizer::{is_atom_token, smiles_regex, split_smiles, SmilesTokenizer};
use crate::data::MoleculeFeatures;
use crate::utils::progress_bar;
use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Fixed-width molecular descriptor generator
///
/// Implementations must be pure functions of the SMILES string; they run
/// concurrently on a worker pool.
pub trait FeatureGenerator: Send + Sync {
    /// Width of the generated vector
    fn dim(&self) -> usize;

    /// Generate the descriptor vector of one molecule
    fn generate(&self, smiles: &str) -> Result<Vec<f32>>;
}

/// Binary fingerprint hashing linear atom environments of the SMILES string
///
/// Every atom contributes the fragments made of itself and its neighbours in
/// SMILES order up to `radius` atoms away on each side. Fragments are hashed
/// (FNV-1a) into `n_bits` buckets.
#[derive(Debug, Clone)]
pub struct MorganFingerprint {
    n_bits: usize,
    radius: usize,
    regex: Regex,
}

impl MorganFingerprint {
    pub fn new(n_bits: usize, radius: usize) -> Result<Self> {
        if n_bits == 0 {
            bail!("Fingerprint width must be positive");
        }
        Ok(Self {
            n_bits,
            radius,
            regex: smiles_regex()?,
        })
    }
}

impl FeatureGenerator for MorganFingerprint {
    fn dim(&self) -> usize {
        self.n_bits
    }

    fn generate(&self, smiles: &str) -> Result<Vec<f32>> {
        let atoms: Vec<&str> = split_smiles(&self.regex, smiles)
            .into_iter()
            .filter(|t| is_atom_token(t))
            .collect();
        if atoms.is_empty() {
            bail!("No atoms found in SMILES {:?}", smiles);
        }

        let mut bits = vec![0.0f32; self.n_bits];
        for center in 0..atoms.len() {
            for r in 0..=self.radius {
                let start = center.saturating_sub(r);
                let end = (center + r + 1).min(atoms.len());
                let hash = fnv1a(r as u64, &atoms[start..end]);
                bits[(hash % self.n_bits as u64) as usize] = 1.0;
            }
        }
        Ok(bits)
    }
}

fn fnv1a(seed: u64, tokens: &[&str]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET ^ seed;
    for token in tokens {
        for byte in token.bytes().chain(std::iter::once(b'|')) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

/// The featurization step selected for a (model, feature type) pair
#[derive(Clone)]
pub enum Featurizer {
    /// Models that take no precomputed input
    None,
    /// Fingerprint or descriptor vectors
    Vector {
        feature_type: FeatureType,
        generator: Arc<dyn FeatureGenerator>,
    },
    /// Token id sequences
    Tokens(SmilesTokenizer),
}

impl std::fmt::Debug for Featurizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Featurizer::None => write!(f, "Featurizer::None"),
            Featurizer::Vector { feature_type, .. } => write!(f, "Featurizer::Vector({})", feature_type),
            Featurizer::Tokens(_) => write!(f, "Featurizer::Tokens"),
        }
    }
}

impl Featurizer {
    /// Select the built-in featurizer for a configuration
    ///
    /// RDKit descriptors have no built-in generator; use [`Featurizer::with_generator`].
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.model_name.uses_tokens() {
            let tokenizer = SmilesTokenizer::from_pretrained(
                Path::new(&config.pretrained_model_name_or_path),
                config.max_seq_length,
            )?;
            return Ok(Featurizer::Tokens(tokenizer));
        }

        match config.feature_type {
            FeatureType::None => Ok(Featurizer::None),
            FeatureType::Morgan => Ok(Featurizer::Vector {
                feature_type: FeatureType::Morgan,
                generator: Arc::new(MorganFingerprint::new(FeatureType::Morgan.dim(), 2)?),
            }),
            FeatureType::Rdkit => bail!(
                "RDKit descriptors are generated externally; supply a generator with `Featurizer::with_generator`"
            ),
        }
    }

    /// Wrap an externally supplied generator
    pub fn with_generator(feature_type: FeatureType, generator: Arc<dyn FeatureGenerator>) -> Result<Self> {
        if generator.dim() != feature_type.dim() {
            bail!(
                "Generator produces {} features but {} expects {}",
                generator.dim(),
                feature_type,
                feature_type.dim()
            );
        }
        Ok(Featurizer::Vector {
            feature_type,
            generator,
        })
    }

    /// Featurize molecules in order, using `n_workers` threads for generators
    pub fn featurize(&self, smiles: &[String], n_workers: usize) -> Result<Vec<MoleculeFeatures>> {
        match self {
            Featurizer::None => Ok(vec![MoleculeFeatures::Empty; smiles.len()]),
            Featurizer::Tokens(tokenizer) => {
                info!("Tokenizing {} molecules", smiles.len());
                Ok(smiles
                    .iter()
                    .map(|s| MoleculeFeatures::Tokens(tokenizer.encode(s)))
                    .collect())
            }
            Featurizer::Vector {
                feature_type,
                generator,
            } => {
                info!("Generating {} features with {} workers", feature_type, n_workers.max(1));
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n_workers.max(1))
                    .build()
                    .context("Failed to build feature worker pool")?;

                let pb = progress_bar(smiles.len() as u64, "features");
                let features = pool.install(|| {
                    smiles
                        .par_iter()
                        .enumerate()
                        .map(|(idx, s)| {
                            let vector = generator
                                .generate(s)
                                .with_context(|| format!("Failed to featurize molecule {}: {}", idx, s));
                            pb.inc(1);
                            vector.map(MoleculeFeatures::Vector)
                        })
                        .collect::<Result<Vec<_>>>()
                });
                pb.finish_and_clear();
                features
            }
        }
    }

    /// Pad id of token featurizers
    pub fn pad_id(&self) -> Option<u32> {
        match self {
            Featurizer::Tokens(tokenizer) => Some(tokenizer.pad_id()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tokenizer::tests::test_vocab;

    struct ConstantGenerator;

    impl FeatureGenerator for ConstantGenerator {
        fn dim(&self) -> usize {
            200
        }

        fn generate(&self, smiles: &str) -> Result<Vec<f32>> {
            Ok(vec![smiles.len() as f32; 200])
        }
    }

    #[test]
    fn test_morgan_deterministic() {
        let fp = MorganFingerprint::new(1024, 2).unwrap();
        let a = fp.generate("CC(=O)Oc1ccccc1C(=O)O").unwrap();
        let b = fp.generate("CC(=O)Oc1ccccc1C(=O)O").unwrap();
        let c = fp.generate("CCN").unwrap();

        assert_eq!(a.len(), 1024);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|&v| v == 0.0 || v == 1.0));
        assert!(a.iter().sum::<f32>() > 0.0);
    }

    #[test]
    fn test_morgan_rejects_empty() {
        let fp = MorganFingerprint::new(1024, 2).unwrap();
        assert!(fp.generate("").is_err());
    }

    #[test]
    fn test_parallel_featurize_keeps_order() {
        let featurizer = Featurizer::with_generator(FeatureType::Rdkit, Arc::new(ConstantGenerator)).unwrap();
        let smiles: Vec<String> = (1..20).map(|n| "C".repeat(n)).collect();
        let features = featurizer.featurize(&smiles, 4).unwrap();

        for (n, f) in features.iter().enumerate() {
            assert_eq!(f.as_vector().unwrap()[0], (n + 1) as f32);
        }
    }

    #[test]
    fn test_generator_dim_mismatch() {
        assert!(Featurizer::with_generator(FeatureType::Morgan, Arc::new(ConstantGenerator)).is_err());
    }

    #[test]
    fn test_token_featurizer() {
        let featurizer = Featurizer::Tokens(SmilesTokenizer::new(test_vocab(), 8).unwrap());
        let features = featurizer.featurize(&["CO".to_string()], 1).unwrap();
        assert_eq!(features[0].as_tokens().unwrap(), &[0, 4, 5, 2]);
        assert_eq!(featurizer.pad_id(), Some(1));
    }
}

use crate::config::{Config, FeatureType, ModelName};
use crate::data::features::Featurizer;
use crate::data::loader::CsvLoader;
use crate::data::{Instance, MoleculeFeatures, Partition};
use crate::utils::ensure_dir;
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Number of molecules kept per partition in debug mode
pub const DEBUG_SUBSET_SIZE: usize = 100;

/// Extension of cached feature files
pub const CACHE_EXTENSION: &str = "json.gz";

/// Attributes persisted in the feature cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CachedAttributes {
    smiles: Vec<String>,
    features: Vec<MoleculeFeatures>,
    lbs: Vec<Vec<f32>>,
    masks: Option<Vec<Vec<f32>>>,
}

const CACHED_KEYS: [&str; 4] = ["smiles", "features", "lbs", "masks"];

/// Molecules of one partition with labels, masks and model-specific features
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    smiles: Vec<String>,
    features: Vec<MoleculeFeatures>,
    lbs: Vec<Vec<f32>>,
    masks: Option<Vec<Vec<f32>>>,
    instances: Vec<Instance>,
}

impl Dataset {
    /// Create empty dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dataset from in-memory molecules and labels
    pub fn from_parts(
        smiles: Vec<String>,
        features: Vec<MoleculeFeatures>,
        lbs: Vec<Vec<f32>>,
        masks: Option<Vec<Vec<f32>>>,
    ) -> Result<Self> {
        let mut dataset = Self {
            smiles,
            features,
            lbs,
            masks,
            instances: Vec::new(),
        };
        dataset.check_shapes()?;
        dataset.instances = dataset.get_instances();
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.smiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.smiles.is_empty()
    }

    pub fn smiles(&self) -> &[String] {
        &self.smiles
    }

    pub fn features(&self) -> &[MoleculeFeatures] {
        &self.features
    }

    pub fn lbs(&self) -> &[Vec<f32>] {
        &self.lbs
    }

    /// Label masks; all ones shaped like the labels when the data had none
    pub fn masks(&self) -> Vec<Vec<f32>> {
        match &self.masks {
            Some(masks) => masks.clone(),
            None => self.lbs.iter().map(|row| vec![1.0; row.len()]).collect(),
        }
    }

    /// Packed instances
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Fail unless every molecule carries the input kind `model_name` consumes
    pub fn check_features(&self, model_name: ModelName) -> Result<()> {
        let expects_tokens = model_name.uses_tokens();
        let mismatch = self.features.iter().enumerate().find(|(_, features)| match features {
            MoleculeFeatures::Tokens(_) => !expects_tokens,
            MoleculeFeatures::Vector(_) => expects_tokens,
            MoleculeFeatures::Empty => true,
        });
        if let Some((idx, features)) = mismatch {
            bail!(
                "{} expects {} but molecule {} ({}) has {}",
                model_name,
                if expects_tokens { "token ids" } else { "a feature vector" },
                idx,
                self.smiles[idx],
                features.kind()
            );
        }
        Ok(())
    }

    pub fn get(&self, idx: usize) -> Option<&Instance> {
        self.instances.get(idx)
    }

    /// Path of the feature cache of a partition
    pub fn cache_path(config: &Config, partition: Partition) -> PathBuf {
        let method_identifier = if config.feature_type != FeatureType::None {
            format!("{}-{}", config.model_name, config.feature_type)
        } else {
            config.model_name.to_string()
        };
        config
            .data_dir
            .join("processed")
            .join(method_identifier)
            .join(format!("{}.{}", partition, CACHE_EXTENSION))
    }

    /// Load a partition, reusing cached features when allowed
    pub fn prepare(
        &mut self,
        config: &Config,
        partition: Partition,
        featurizer: &Featurizer,
    ) -> Result<&mut Self> {
        let cache_path = Self::cache_path(config, partition);

        if cache_path.exists() && !config.ignore_preprocessed_dataset {
            info!("Loading pre-processed dataset {:?}", cache_path);
            self.load(&cache_path)?;
        } else {
            let file_path = config.data_dir.join(format!("{}.csv", partition));
            self.read_csv(&file_path)?;

            info!("Creating features");
            self.create_features(featurizer, config.num_preprocess_workers)?;

            if !config.disable_dataset_saving {
                info!("Saving pre-processed dataset");
                self.save(&cache_path)?;
            }
        }

        if config.debug && self.len() > DEBUG_SUBSET_SIZE {
            debug!("Debug mode: keeping the first {} molecules", DEBUG_SUBSET_SIZE);
            self.truncate(DEBUG_SUBSET_SIZE);
        }

        self.instances = self.get_instances();
        Ok(self)
    }

    /// Read molecules, labels and masks from a partition CSV
    pub fn read_csv<P: AsRef<Path>>(&mut self, path: P) -> Result<&mut Self> {
        let records = CsvLoader::new().load(path)?;
        self.smiles = records.smiles;
        self.lbs = records.lbs;
        self.masks = records.masks;
        self.features.clear();
        self.instances.clear();
        Ok(self)
    }

    /// Compute model inputs for every molecule
    pub fn create_features(&mut self, featurizer: &Featurizer, n_workers: usize) -> Result<&mut Self> {
        self.features = featurizer.featurize(&self.smiles, n_workers)?;
        Ok(self)
    }

    /// Zip features, labels and masks into instances
    pub fn get_instances(&self) -> Vec<Instance> {
        self.features
            .iter()
            .cloned()
            .zip(self.lbs.iter().cloned())
            .zip(self.masks())
            .map(|((features, lbs), masks)| Instance { features, lbs, masks })
            .collect()
    }

    /// Replace labels (e.g. with pseudo labels) and rebuild the instances
    pub fn update_lbs(&mut self, lbs: Vec<Vec<f32>>) -> Result<&mut Self> {
        if lbs.len() != self.lbs.len() {
            bail!("Expected labels for {} molecules, got {}", self.lbs.len(), lbs.len());
        }
        if let Some(masks) = &self.masks {
            if let Some(idx) = masks.iter().zip(&lbs).position(|(m, l)| m.len() != l.len()) {
                bail!("Label width of molecule {} does not match its mask", idx);
            }
        }
        self.lbs = lbs;
        self.instances = self.get_instances();
        Ok(self)
    }

    /// Save the dataset attributes for future runs
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<&Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }

        let attributes = CachedAttributes {
            smiles: self.smiles.clone(),
            features: self.features.clone(),
            lbs: self.lbs.clone(),
            masks: self.masks.clone(),
        };

        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &attributes).context("Failed to serialize dataset")?;
        encoder
            .finish()
            .and_then(|mut w| w.flush())
            .with_context(|| format!("Failed to write {:?}", path))?;

        debug!("Saved {} molecules to {:?}", self.len(), path);
        Ok(self)
    }

    /// Load dataset attributes saved by [`Dataset::save`]
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<&mut Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let mut values: Map<String, Value> =
            serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
                .with_context(|| format!("Failed to parse dataset cache {:?}", path))?;

        let unknown: Vec<String> = values
            .keys()
            .filter(|k| !CACHED_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        for key in &unknown {
            warn!("Attribute {} is not natively defined in dataset!", key);
            values.remove(key);
        }

        let attributes: CachedAttributes = serde_json::from_value(Value::Object(values))
            .with_context(|| format!("Invalid dataset cache {:?}", path))?;

        self.smiles = attributes.smiles;
        self.features = attributes.features;
        self.lbs = attributes.lbs;
        self.masks = attributes.masks;
        self.check_shapes()?;
        Ok(self)
    }

    fn truncate(&mut self, n: usize) {
        self.smiles.truncate(n);
        self.features.truncate(n);
        self.lbs.truncate(n);
        if let Some(masks) = self.masks.as_mut() {
            masks.truncate(n);
        }
    }

    fn check_shapes(&self) -> Result<()> {
        let n = self.smiles.len();
        if self.features.len() != n || self.lbs.len() != n {
            bail!(
                "Inconsistent dataset: {} molecules, {} feature records, {} label rows",
                n,
                self.features.len(),
                self.lbs.len()
            );
        }
        if let Some(masks) = &self.masks {
            if masks.len() != n || masks.iter().zip(&self.lbs).any(|(m, l)| m.len() != l.len()) {
                bail!("Mask matrix does not match the label matrix");
            }
        }
        Ok(())
    }
}

impl std::ops::Index<usize> for Dataset {
    type Output = Instance;

    fn index(&self, idx: usize) -> &Instance {
        &self.instances[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelName;
    use std::fs;
    use tempfile::TempDir;

    fn write_partition(dir: &Path, partition: Partition, body: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(format!("{}.csv", partition)), body).unwrap();
    }

    fn morgan_config(data_dir: &Path) -> Config {
        let mut config = Config::default();
        config.data_dir = data_dir.to_path_buf();
        config.model_name = ModelName::Dnn;
        config.feature_type = FeatureType::Morgan;
        config.num_preprocess_workers = 2;
        config
    }

    #[test]
    fn test_cache_path() {
        let config = morgan_config(Path::new("data/bbbp/split-0"));
        assert_eq!(
            Dataset::cache_path(&config, Partition::Train),
            PathBuf::from("data/bbbp/split-0/processed/DNN-morgan/train.json.gz")
        );

        let mut config = config;
        config.model_name = ModelName::ChemBerta;
        config.feature_type = FeatureType::None;
        assert_eq!(
            Dataset::cache_path(&config, Partition::Valid),
            PathBuf::from("data/bbbp/split-0/processed/ChemBERTa/valid.json.gz")
        );
    }

    #[test]
    fn test_masks_default_to_ones() {
        let temp_dir = TempDir::new().unwrap();
        write_partition(temp_dir.path(), Partition::Train, "smiles,labels\nCCO,\"[1, 0]\"\nCCN,\"[0, 1]\"");

        let mut dataset = Dataset::new();
        dataset.read_csv(temp_dir.path().join("train.csv")).unwrap();
        assert_eq!(dataset.masks(), vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        write_partition(
            temp_dir.path(),
            Partition::Train,
            "smiles,labels,masks\nCCO,\"[1, 0]\",\"[1, 1]\"\nc1ccccc1O,\"[0, 1]\",\"[1, 0]\"",
        );
        let config = morgan_config(temp_dir.path());
        let featurizer = Featurizer::from_config(&config).unwrap();

        let mut first = Dataset::new();
        first.prepare(&config, Partition::Train, &featurizer).unwrap();
        assert!(Dataset::cache_path(&config, Partition::Train).exists());

        // remove the CSV so the second call can only succeed from the cache
        fs::remove_file(temp_dir.path().join("train.csv")).unwrap();
        let mut second = Dataset::new();
        second.prepare(&config, Partition::Train, &featurizer).unwrap();

        assert_eq!(first.instances(), second.instances());
        assert_eq!(second[1].masks, vec![1.0, 0.0]);
    }

    #[test]
    fn test_prepare_missing_csv() {
        let temp_dir = TempDir::new().unwrap();
        let config = morgan_config(temp_dir.path());
        let featurizer = Featurizer::from_config(&config).unwrap();

        let err = Dataset::new()
            .prepare(&config, Partition::Test, &featurizer)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_disable_dataset_saving() {
        let temp_dir = TempDir::new().unwrap();
        write_partition(temp_dir.path(), Partition::Valid, "smiles,labels\nCCO,[1]");
        let mut config = morgan_config(temp_dir.path());
        config.disable_dataset_saving = true;
        let featurizer = Featurizer::from_config(&config).unwrap();

        Dataset::new().prepare(&config, Partition::Valid, &featurizer).unwrap();
        assert!(!Dataset::cache_path(&config, Partition::Valid).exists());
    }

    #[test]
    fn test_check_features_matches_model() {
        let vectors = Dataset::from_parts(
            vec!["CCO".to_string()],
            vec![MoleculeFeatures::Vector(vec![0.0, 1.0])],
            vec![vec![1.0]],
            None,
        )
        .unwrap();
        assert!(vectors.check_features(ModelName::Dnn).is_ok());
        assert!(vectors.check_features(ModelName::ChemBerta).is_err());
        assert!(vectors.check_features(ModelName::Grover).is_err());

        let tokens = Dataset::from_parts(
            vec!["CCO".to_string()],
            vec![MoleculeFeatures::Tokens(vec![0, 4, 2])],
            vec![vec![1.0]],
            None,
        )
        .unwrap();
        assert!(tokens.check_features(ModelName::Grover).is_ok());
        assert!(tokens.check_features(ModelName::Dnn).is_err());
    }

    #[test]
    fn test_update_lbs() {
        let mut dataset = Dataset::from_parts(
            vec!["C".into(), "O".into()],
            vec![MoleculeFeatures::Empty; 2],
            vec![vec![0.0], vec![1.0]],
            None,
        )
        .unwrap();

        dataset.update_lbs(vec![vec![1.0], vec![0.0]]).unwrap();
        assert_eq!(dataset[0].lbs, vec![1.0]);
        assert_eq!(dataset[1].lbs, vec![0.0]);

        assert!(dataset.update_lbs(vec![vec![1.0]]).is_err());
    }

    #[test]
    fn test_load_warns_on_unknown_attribute() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json.gz");
        let file = File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        let value = serde_json::json!({
            "smiles": ["C"],
            "features": ["empty"],
            "lbs": [[1.0]],
            "masks": null,
            "legacy": 3
        });
        serde_json::to_writer(&mut encoder, &value).unwrap();
        encoder.finish().unwrap();

        let mut dataset = Dataset::new();
        dataset.load(&path).unwrap();
        assert_eq!(dataset.len(), 1);
    }
}

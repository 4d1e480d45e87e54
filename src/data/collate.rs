use crate::data::{Instance, MoleculeFeatures};
use anyhow::{bail, Result};
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

/// Padded model input for a minibatch
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Fingerprint features `[batch, d_feature]`
    pub features: Option<Tensor<B, 2>>,
    /// Token ids `[batch, seq_len]`
    pub atom_ids: Option<Tensor<B, 2, Int>>,
    /// `true` at padded token positions `[batch, seq_len]`
    pub pad_mask: Option<Tensor<B, 2, Bool>>,
    /// Labels `[batch, n_tasks]`; unobserved entries are zero
    pub lbs: Tensor<B, 2>,
    /// Label masks `[batch, n_tasks]`
    pub masks: Tensor<B, 2>,
}

impl<B: Backend> Batch<B> {
    pub fn batch_size(&self) -> usize {
        self.lbs.dims()[0]
    }
}

/// Turns instances into padded tensors
#[derive(Debug, Clone, Copy, Default)]
pub struct Collator {
    pad_id: u32,
}

impl Collator {
    pub fn new(pad_id: u32) -> Self {
        Self { pad_id }
    }

    /// Collate instances into a batch on `device`
    pub fn collate<B: Backend>(&self, instances: &[&Instance], device: &B::Device) -> Result<Batch<B>> {
        let Some(first) = instances.first() else {
            bail!("Cannot collate an empty batch");
        };
        let batch_size = instances.len();
        let n_tasks = first.lbs.len();

        let mut lbs = Vec::with_capacity(batch_size * n_tasks);
        let mut masks = Vec::with_capacity(batch_size * n_tasks);
        for instance in instances {
            if instance.lbs.len() != n_tasks || instance.masks.len() != n_tasks {
                bail!("Instances in a batch must share the label width {}", n_tasks);
            }
            for (&lb, &mask) in instance.lbs.iter().zip(&instance.masks) {
                let observed = mask > 0.0 && !lb.is_nan();
                lbs.push(if observed { lb } else { 0.0 });
                masks.push(if observed { 1.0 } else { 0.0 });
            }
        }

        let lbs = Tensor::<B, 2>::from_data(TensorData::new(lbs, [batch_size, n_tasks]), device);
        let masks = Tensor::<B, 2>::from_data(TensorData::new(masks, [batch_size, n_tasks]), device);

        let mut batch = Batch {
            features: None,
            atom_ids: None,
            pad_mask: None,
            lbs,
            masks,
        };

        match &first.features {
            MoleculeFeatures::Empty => {}
            MoleculeFeatures::Vector(v) => {
                batch.features = Some(self.collate_vectors(instances, v.len(), device)?);
            }
            MoleculeFeatures::Tokens(_) => {
                let (ids, pad_mask) = self.collate_tokens(instances, device)?;
                batch.atom_ids = Some(ids);
                batch.pad_mask = Some(pad_mask);
            }
        }
        Ok(batch)
    }

    fn collate_vectors<B: Backend>(
        &self,
        instances: &[&Instance],
        d_feature: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 2>> {
        let mut data = Vec::with_capacity(instances.len() * d_feature);
        for instance in instances {
            match instance.features.as_vector() {
                Some(v) if v.len() == d_feature => {
                    data.extend(v.iter().map(|&x| if x.is_finite() { x } else { 0.0 }))
                }
                _ => bail!("Instances in a batch must share a {}-wide feature vector", d_feature),
            }
        }
        Ok(Tensor::from_data(TensorData::new(data, [instances.len(), d_feature]), device))
    }

    fn collate_tokens<B: Backend>(
        &self,
        instances: &[&Instance],
        device: &B::Device,
    ) -> Result<(Tensor<B, 2, Int>, Tensor<B, 2, Bool>)> {
        let mut sequences = Vec::with_capacity(instances.len());
        for instance in instances {
            match instance.features.as_tokens() {
                Some(ids) => sequences.push(ids),
                None => bail!("Instances in a batch must all carry token ids"),
            }
        }
        let seq_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0).max(1);

        let mut ids = Vec::with_capacity(instances.len() * seq_len);
        let mut padding = Vec::with_capacity(instances.len() * seq_len);
        for seq in sequences {
            ids.extend(seq.iter().map(|&id| id as i64));
            ids.extend(std::iter::repeat(self.pad_id as i64).take(seq_len - seq.len()));
            padding.extend(std::iter::repeat(false).take(seq.len()));
            padding.extend(std::iter::repeat(true).take(seq_len - seq.len()));
        }

        let shape = [instances.len(), seq_len];
        Ok((
            Tensor::from_data(TensorData::new(ids, shape), device),
            Tensor::from_data(TensorData::new(padding, shape), device),
        ))
    }
}

/// Split `0..n` into minibatches, shuffled when an RNG is given
pub fn batch_indices(n: usize, batch_size: usize, rng: Option<&mut ChaCha8Rng>) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..n).collect();
    if let Some(rng) = rng {
        indices.shuffle(rng);
    }
    indices
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

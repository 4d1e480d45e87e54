//! Stochastic Weight Averaging-Gaussian
//!
//! Collects the first and second moments of the weights over the SWA epochs
//! plus the deviations of the last `max_rank` iterates from the running mean.
//! Sampling draws from `N(mean, diag/2 + D D^T / (2 (K - 1)))`.

use crate::uncertainty::snapshot::{ParamSnapshot, ParamValue};
use anyhow::{bail, Result};
use burn::module::ParamId;
use rand::Rng;
use rand_distr::StandardNormal;
use std::collections::{HashMap, VecDeque};

/// Lower bound of the diagonal variance
const VAR_CLAMP: f32 = 1e-30;

#[derive(Debug, Clone)]
pub struct Swag {
    max_rank: usize,
    n_models: usize,
    shapes: HashMap<ParamId, Vec<usize>>,
    mean: HashMap<ParamId, Vec<f32>>,
    sq_mean: HashMap<ParamId, Vec<f32>>,
    deviations: VecDeque<HashMap<ParamId, Vec<f32>>>,
}

impl Swag {
    pub fn new(max_rank: usize) -> Self {
        Self {
            max_rank,
            n_models: 0,
            shapes: HashMap::new(),
            mean: HashMap::new(),
            sq_mean: HashMap::new(),
            deviations: VecDeque::new(),
        }
    }

    /// Number of collected iterates
    pub fn n_models(&self) -> usize {
        self.n_models
    }

    /// Rank of the low-rank covariance term
    pub fn rank(&self) -> usize {
        self.deviations.len()
    }

    /// Fold one iterate into the moments
    pub fn collect(&mut self, snapshot: &ParamSnapshot) {
        let n = self.n_models as f32;
        let mut deviation = HashMap::with_capacity(snapshot.len());

        for (id, param) in snapshot.params() {
            self.shapes.entry(id.clone()).or_insert_with(|| param.shape.clone());
            let mean = self
                .mean
                .entry(id.clone())
                .or_insert_with(|| vec![0.0; param.values.len()]);
            let sq_mean = self
                .sq_mean
                .entry(id.clone())
                .or_insert_with(|| vec![0.0; param.values.len()]);

            let mut dev = Vec::with_capacity(param.values.len());
            for ((m, s), &x) in mean.iter_mut().zip(sq_mean.iter_mut()).zip(&param.values) {
                *m = (*m * n + x) / (n + 1.0);
                *s = (*s * n + x * x) / (n + 1.0);
                dev.push(x - *m);
            }
            deviation.insert(id.clone(), dev);
        }

        self.n_models += 1;
        if self.max_rank > 0 {
            self.deviations.push_back(deviation);
            while self.deviations.len() > self.max_rank {
                self.deviations.pop_front();
            }
        }
    }

    /// The SWA solution
    pub fn mean(&self) -> ParamSnapshot {
        ParamSnapshot::from_params(
            self.sorted_ids()
                .into_iter()
                .map(|id| {
                    let value = ParamValue {
                        values: self.mean[&id].clone(),
                        shape: self.shapes[&id].clone(),
                    };
                    (id, value)
                })
                .collect(),
        )
    }

    /// Draw one set of weights; `scale` multiplies the covariance square root
    pub fn sample<R: Rng>(&self, scale: f32, rng: &mut R) -> Result<ParamSnapshot> {
        if self.n_models == 0 {
            bail!("SWAG has not collected any model yet");
        }

        let rank = self.rank();
        let low_rank = rank >= 2;
        let z2: Vec<f32> = (0..rank).map(|_| rng.sample(StandardNormal)).collect();
        let diag_scale = if low_rank { scale / 2f32.sqrt() } else { scale };
        let rank_scale = if low_rank {
            scale / (2.0 * (rank as f32 - 1.0)).sqrt()
        } else {
            0.0
        };

        let mut params = HashMap::with_capacity(self.mean.len());
        for id in self.sorted_ids() {
            let mean = &self.mean[&id];
            let sq_mean = &self.sq_mean[&id];

            let mut values = Vec::with_capacity(mean.len());
            for j in 0..mean.len() {
                let var = (sq_mean[j] - mean[j] * mean[j]).max(VAR_CLAMP);
                let z1: f32 = rng.sample(StandardNormal);
                let mut value = mean[j] + diag_scale * var.sqrt() * z1;
                if low_rank {
                    let projected: f32 = self
                        .deviations
                        .iter()
                        .zip(&z2)
                        .map(|(dev, z)| dev[&id][j] * z)
                        .sum();
                    value += rank_scale * projected;
                }
                values.push(value);
            }

            let shape = self.shapes[&id].clone();
            params.insert(id, ParamValue { values, shape });
        }
        Ok(ParamSnapshot::from_params(params))
    }

    /// Parameter ids in a stable order so sampling is reproducible under a seed
    fn sorted_ids(&self) -> Vec<ParamId> {
        let mut ids: Vec<ParamId> = self.mean.keys().cloned().collect();
        ids.sort_by_key(|id| id.to_string());
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::random::seeded_rng;

    fn snapshot(id: &ParamId, values: Vec<f32>) -> ParamSnapshot {
        let shape = vec![values.len()];
        ParamSnapshot::from_params(HashMap::from([(id.clone(), ParamValue { values, shape })]))
    }

    #[test]
    fn test_running_moments() {
        let id = ParamId::new();
        let mut swag = Swag::new(2);
        swag.collect(&snapshot(&id, vec![1.0, 2.0]));
        swag.collect(&snapshot(&id, vec![3.0, 2.0]));
        swag.collect(&snapshot(&id, vec![5.0, 2.0]));

        assert_eq!(swag.n_models(), 3);
        assert_eq!(swag.rank(), 2);
        assert_eq!(swag.mean().get(&id).unwrap().values, vec![3.0, 2.0]);
    }

    #[test]
    fn test_sample_spreads_around_mean() {
        let id = ParamId::new();
        let mut swag = Swag::new(3);
        for x in [1.0, 3.0, 5.0, 7.0] {
            swag.collect(&snapshot(&id, vec![x, 2.0]));
        }

        let mut rng = seeded_rng(0);
        let samples: Vec<Vec<f32>> = (0..200)
            .map(|_| swag.sample(1.0, &mut rng).unwrap().get(&id).unwrap().values.clone())
            .collect();

        let mean: f32 = samples.iter().map(|s| s[0]).sum::<f32>() / samples.len() as f32;
        assert!((mean - 4.0).abs() < 0.5);
        assert!(samples.iter().any(|s| (s[0] - 4.0).abs() > 0.1));
        // A constant coordinate has no spread
        assert!(samples.iter().all(|s| (s[1] - 2.0).abs() < 1e-3));
    }

    #[test]
    fn test_sample_requires_models() {
        let mut rng = seeded_rng(0);
        assert!(Swag::new(2).sample(1.0, &mut rng).is_err());
    }
}

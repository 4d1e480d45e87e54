use crate::model::loss::{task_loss, LossSpec};
use anyhow::{bail, Result};
use burn::module::Param;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use tracing::{debug, info};

/// Single learnable temperature dividing every logit
#[derive(Module, Debug)]
pub struct TemperatureScaler<B: Backend> {
    temperature: Param<Tensor<B, 1>>,
}

impl<B: Backend> TemperatureScaler<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            temperature: Param::from_tensor(Tensor::ones([1], device)),
        }
    }

    pub fn forward(&self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        logits / self.temperature.val().unsqueeze()
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.val().into_scalar().elem()
    }
}

/// Fit a temperature on held-out logits by minimizing the task loss
///
/// `logits` is row-major `[n, n_tasks * n_lbs]`; `lbs` and `masks` are
/// `[n, n_tasks]` with unobserved labels already zeroed.
pub fn fit_temperature<B: AutodiffBackend>(
    logits: &[f32],
    lbs: &[f32],
    masks: &[f32],
    spec: &LossSpec,
    lr: f64,
    n_epochs: usize,
    device: &B::Device,
) -> Result<f32> {
    let width = spec.n_tasks * spec.n_lbs;
    if width == 0 || logits.len() % width != 0 {
        bail!("Logits of length {} do not fit {} columns", logits.len(), width);
    }
    let n = logits.len() / width;
    if lbs.len() != n * spec.n_tasks || masks.len() != lbs.len() {
        bail!("Labels and masks must be shaped [{}, {}]", n, spec.n_tasks);
    }

    let logits = Tensor::<B, 2>::from_data(TensorData::new(logits.to_vec(), [n, width]), device);
    let lbs = Tensor::<B, 2>::from_data(TensorData::new(lbs.to_vec(), [n, spec.n_tasks]), device);
    let masks = Tensor::<B, 2>::from_data(TensorData::new(masks.to_vec(), [n, spec.n_tasks]), device);

    let mut scaler = TemperatureScaler::<B>::new(device);
    let mut optimizer = AdamConfig::new().init::<B, TemperatureScaler<B>>();

    for epoch in 0..n_epochs {
        let scaled = scaler.forward(logits.clone());
        let loss = task_loss(scaled, lbs.clone(), masks.clone(), spec);
        debug!("Temperature scaling epoch {}: loss {:.4}", epoch, loss.clone().into_scalar().elem::<f32>());

        let grads = GradientsParams::from_grads(loss.backward(), &scaler);
        scaler = optimizer.step(lr, scaler, grads);
    }

    let temperature = scaler.temperature();
    info!("Fitted temperature: {:.4}", temperature);
    Ok(temperature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskType;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_overconfident_logits_get_hotter() {
        // Huge logits with half of the labels wrong
        let logits = vec![8.0, -8.0, 8.0, -8.0];
        let lbs = vec![1.0, 1.0, 0.0, 0.0];
        let masks = vec![1.0; 4];
        let spec = LossSpec {
            task_type: TaskType::Classification,
            n_tasks: 1,
            n_lbs: 1,
            dist_coff: 0.0,
            focal: None,
        };

        let temperature =
            fit_temperature::<TestBackend>(&logits, &lbs, &masks, &spec, 0.1, 50, &Default::default()).unwrap();
        assert!(temperature > 1.0);
    }

    #[test]
    fn test_rejects_misshaped_input() {
        let spec = LossSpec {
            task_type: TaskType::Classification,
            n_tasks: 2,
            n_lbs: 1,
            dist_coff: 0.0,
            focal: None,
        };
        let result = fit_temperature::<TestBackend>(&[1.0, 2.0, 3.0], &[1.0], &[1.0], &spec, 0.1, 1, &Default::default());
        assert!(result.is_err());
    }
}

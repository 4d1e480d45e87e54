use crate::model::loss::bce_with_logits;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// Sigmoid focal loss
///
/// Down-weights easy examples and focuses on hard ones, which also tempers
/// over-confident probabilities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FocalLoss {
    /// Alpha weight for positive class
    pub alpha: f32,
    /// Focusing parameter (gamma)
    pub gamma: f32,
}

impl Default for FocalLoss {
    fn default() -> Self {
        Self {
            alpha: 0.25,
            gamma: 2.0,
        }
    }
}

impl FocalLoss {
    pub fn new(alpha: f32, gamma: f32) -> Self {
        Self { alpha, gamma }
    }

    /// Elementwise focal loss of `logits` against binary `targets`
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 2> {
        let bce_loss = bce_with_logits(logits.clone(), targets.clone());
        let probs = sigmoid(logits);

        // Probability assigned to the true class (p_t)
        let p_t = probs.clone() * targets.clone()
            + probs.neg().add_scalar(1.0) * targets.clone().neg().add_scalar(1.0);

        // Focal weight: (1 - p_t)^gamma
        let focal_weight = p_t.neg().add_scalar(1.0).powf_scalar(self.gamma);

        let alpha_t = targets.clone().mul_scalar(self.alpha)
            + targets.neg().add_scalar(1.0).mul_scalar(1.0 - self.alpha);

        focal_weight * alpha_t * bce_loss
    }
}

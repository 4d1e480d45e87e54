use burn::module::Param;
use burn::prelude::*;
use burn::tensor::activation::softplus;
use burn::tensor::Distribution;

/// Initial value of the pre-softplus standard deviation
const INIT_RHO: f64 = -5.0;

#[derive(Config, Debug)]
pub struct BbpLinearConfig {
    pub d_input: usize,
    pub d_output: usize,
    /// Standard deviation of the zero-mean Gaussian weight prior
    #[config(default = 0.1)]
    pub prior_sigma: f64,
}

impl BbpLinearConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BbpLinear<B> {
        let bound = 1.0 / (self.d_input as f64).sqrt();
        let uniform = Distribution::Uniform(-bound, bound);

        BbpLinear {
            weight_mu: Param::from_tensor(Tensor::random([self.d_input, self.d_output], uniform, device)),
            weight_rho: Param::from_tensor(Tensor::full([self.d_input, self.d_output], INIT_RHO, device)),
            bias_mu: Param::from_tensor(Tensor::random([self.d_output], uniform, device)),
            bias_rho: Param::from_tensor(Tensor::full([self.d_output], INIT_RHO, device)),
            prior_sigma: self.prior_sigma,
        }
    }
}

/// Linear layer with a factorized Gaussian weight posterior
///
/// Every forward pass draws fresh weights with the reparameterization
/// trick, in training and at test time alike.
#[derive(Module, Debug)]
pub struct BbpLinear<B: Backend> {
    weight_mu: Param<Tensor<B, 2>>,
    weight_rho: Param<Tensor<B, 2>>,
    bias_mu: Param<Tensor<B, 1>>,
    bias_rho: Param<Tensor<B, 1>>,
    prior_sigma: f64,
}

impl<B: Backend> BbpLinear<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let weight = sample(self.weight_mu.val(), self.weight_rho.val());
        let bias = sample(self.bias_mu.val(), self.bias_rho.val());
        x.matmul(weight) + bias.unsqueeze()
    }

    /// KL divergence of the posterior from the prior, summed over parameters
    pub fn kl_divergence(&self) -> Tensor<B, 1> {
        let weight_kl = gaussian_kl(self.weight_mu.val(), self.weight_rho.val(), self.prior_sigma).sum();
        let bias_kl = gaussian_kl(self.bias_mu.val(), self.bias_rho.val(), self.prior_sigma).sum();
        weight_kl + bias_kl
    }
}

fn sample<B: Backend, const D: usize>(mu: Tensor<B, D>, rho: Tensor<B, D>) -> Tensor<B, D> {
    let eps = Tensor::random(mu.shape(), Distribution::Normal(0.0, 1.0), &mu.device());
    mu + softplus(rho, 1.0) * eps
}

/// KL(N(mu, sigma^2) || N(0, prior^2)) per element
fn gaussian_kl<B: Backend, const D: usize>(mu: Tensor<B, D>, rho: Tensor<B, D>, prior_sigma: f64) -> Tensor<B, D> {
    let sigma = softplus(rho, 1.0);
    let prior_var = prior_sigma * prior_sigma;

    let log_ratio = sigma.clone().log().neg().add_scalar(prior_sigma.ln());
    let spread = (sigma.powf_scalar(2.0) + mu.powf_scalar(2.0)).div_scalar(2.0 * prior_var);
    log_ratio + spread.sub_scalar(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_is_stochastic() {
        let device = Default::default();
        let layer = BbpLinearConfig::new(4, 3).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::ones([2, 4], &device);

        let a: Vec<f32> = layer.forward(x.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = layer.forward(x).into_data().to_vec().unwrap();
        assert_eq!(a.len(), 6);
        assert_ne!(a, b);
    }

    #[test]
    fn test_kl_vanishes_at_prior() {
        let device = Default::default();
        let sigma = 0.5f64;
        // softplus(rho) = sigma
        let rho = (sigma.exp() - 1.0).ln();
        let mu = Tensor::<TestBackend, 1>::zeros([3], &device);
        let rho = Tensor::<TestBackend, 1>::full([3], rho, &device);

        let kl = gaussian_kl(mu, rho, sigma).sum().into_scalar();
        assert!(kl.abs() < 1e-5);
    }
}

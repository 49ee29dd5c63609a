use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Stream offset separating the per-step re-noising draws from the block noise sample.
const STEP_NOISE_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

/// Source of the initial latent noise of a request.
pub trait NoiseProvider<B: Backend> {
    /// Draws one tensor of `shape`. Same seed and shape give bit-identical values.
    fn sample(&self, shape: [usize; 5], seed: u64, device: &B::Device) -> Tensor<B, 5>;
}

/// Standard normal noise from a seeded `StdRng`, sampled on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeededNormalNoise;

impl<B: Backend> NoiseProvider<B> for SeededNormalNoise {
    fn sample(&self, shape: [usize; 5], seed: u64, device: &B::Device) -> Tensor<B, 5> {
        let mut rng = StdRng::seed_from_u64(seed);
        normal_tensor(&mut rng, shape, device)
    }
}

/// One noise sample reused for every block of a request.
///
/// The network consumes a fixed noise shape per block; the sample is repeated across
/// blocks instead of drawing fresh noise per block.
#[derive(Debug, Clone)]
pub struct NoiseTile<B: Backend> {
    sample: Tensor<B, 5>,
}

impl<B: Backend> NoiseTile<B> {
    pub fn new(sample: Tensor<B, 5>) -> Self {
        Self { sample }
    }

    /// Initial noise of block `index`.
    pub fn for_block(&self, _index: usize) -> Tensor<B, 5> {
        self.sample.clone()
    }

    pub fn shape(&self) -> [usize; 5] {
        self.sample.dims()
    }
}

/// Request-scoped noise stream for re-noising between denoising steps.
pub struct StepNoise {
    rng: StdRng,
}

impl StepNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed ^ STEP_NOISE_STREAM),
        }
    }

    pub fn next<B: Backend>(&mut self, shape: [usize; 5], device: &B::Device) -> Tensor<B, 5> {
        normal_tensor(&mut self.rng, shape, device)
    }
}

fn normal_tensor<B: Backend, R: Rng>(rng: &mut R, shape: [usize; 5], device: &B::Device) -> Tensor<B, 5> {
    let numel = shape.iter().product();
    let values = normal_values(rng, numel);
    Tensor::from_data(TensorData::new(values, shape.to_vec()), device)
}

/// `n` standard normal values drawn from `rng`.
pub fn normal_values<R: Rng>(rng: &mut R, n: usize) -> Vec<f32> {
    StandardNormal.sample_iter(rng).take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_values_have_unit_moments() {
        let mut rng = StdRng::seed_from_u64(7);
        let values = normal_values(&mut rng, 20_000);
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / values.len() as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }

    #[test]
    fn odd_lengths_are_exact() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(normal_values(&mut rng, 5).len(), 5);
        assert!(normal_values(&mut rng, 0).is_empty());
    }
}

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor};

use crate::config::EngineConfig;

/// Few-step flow-matching schedule shared by every block of a request.
#[derive(Debug, Clone)]
pub struct FewStepSchedule {
    timesteps: Vec<f32>,
    num_train_timesteps: usize,
    context_timestep: f32,
}

impl FewStepSchedule {
    pub fn from_config(config: &EngineConfig) -> Self {
        let n = config.num_train_timesteps as f32;
        let timesteps = config
            .denoising_steps
            .iter()
            .map(|&t| {
                if config.warp_denoising_steps {
                    n * shift_sigma(t / n, config.timestep_shift)
                } else {
                    t
                }
            })
            .collect();
        Self {
            timesteps,
            num_train_timesteps: config.num_train_timesteps,
            context_timestep: config.context_noise,
        }
    }

    /// Timesteps in sampling order, noisiest first.
    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    pub fn num_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Timestep following `step`, or `None` after the last step.
    pub fn next_timestep(&self, step: usize) -> Option<f32> {
        self.timesteps.get(step + 1).copied()
    }

    /// Level of the pass that writes a clean block into the cache.
    pub fn context_timestep(&self) -> f32 {
        self.context_timestep
    }

    pub fn sigma(&self, timestep: f32) -> f32 {
        (timestep / self.num_train_timesteps as f32).clamp(0.0, 1.0)
    }

    /// Moves a clean sample to `timestep` along the straight noise path.
    pub fn add_noise<B: Backend, const D: usize>(
        &self,
        sample: Tensor<B, D>,
        noise: Tensor<B, D>,
        timestep: f32,
    ) -> Tensor<B, D> {
        let sigma = self.sigma(timestep);
        noise.mul_scalar(sigma).add(sample.mul_scalar(1.0 - sigma))
    }
}

/// Shifted flow-matching sigma: `shift * s / (1 + (shift - 1) * s)`.
pub fn shift_sigma(sigma: f32, shift: f32) -> f32 {
    shift * sigma / (1.0 + (shift - 1.0) * sigma)
}

use burn_core as burn;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::{self, RollingSinkError};

/// Floating format used for every latent tensor of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    F32,
    F16,
    Bf16,
}

/// How a raw latent frame count is snapped to a whole number of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRounding {
    Floor,
    Round,
    Ceil,
}

/// What happens to a caller while another request is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionPolicy {
    /// Wait for the in-flight request to finish.
    Queue,
    /// Fail immediately with `Busy`.
    Reject,
}

/// Accelerator the CLI places the model on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelection {
    Cpu,
    Gpu(usize),
}

/// Upper bound accepted for `max_duration_secs` (one day).
pub const MAX_DURATION_LIMIT_SECS: f64 = 86_400.0;

/// Configuration of the block-causal generation engine.
#[derive(Config, Debug)]
pub struct EngineConfig {
    /// Latent frames produced by one autoregressive step.
    #[config(default = 3)]
    pub frames_per_block: usize,
    #[config(default = 16)]
    pub latent_channels: usize,
    #[config(default = 60)]
    pub latent_height: usize,
    #[config(default = 104)]
    pub latent_width: usize,

    /// Blocks kept forever at the front of the cache.
    #[config(default = 1)]
    pub sink_size: usize,
    /// Most recent non-sink blocks kept in the cache.
    #[config(default = 6)]
    pub window_size: usize,

    /// Denoising levels on the training timestep scale, noisiest first.
    #[config(default = "vec![1000.0, 750.0, 500.0, 250.0]")]
    pub denoising_steps: Vec<f32>,
    /// Map the step list through the shifted flow-matching curve.
    #[config(default = true)]
    pub warp_denoising_steps: bool,
    #[config(default = 5.0)]
    pub timestep_shift: f32,
    #[config(default = 1000)]
    pub num_train_timesteps: usize,
    /// Noise level of the pass that writes a clean block into the cache.
    #[config(default = 0.0)]
    pub context_noise: f32,

    #[config(default = "Precision::Bf16")]
    pub precision: Precision,

    #[config(default = 16)]
    pub fps: usize,
    /// Pixel frames per latent frame (after the first).
    #[config(default = 4)]
    pub vae_temporal_stride: usize,
    #[config(default = 8)]
    pub vae_spatial_scale: usize,

    #[config(default = 5.0)]
    pub min_duration_secs: f64,
    #[config(default = 30.0)]
    pub max_duration_secs: f64,
    #[config(default = "BlockRounding::Floor")]
    pub block_rounding: BlockRounding,

    #[config(default = 0)]
    pub seed: u64,
    #[config(default = 1)]
    pub max_concurrent_requests: usize,
    #[config(default = "AdmissionPolicy::Queue")]
    pub admission: AdmissionPolicy,
    /// Keep clean latent blocks in the output (costs memory proportional to length).
    #[config(default = false)]
    pub return_latents: bool,
    #[config(default = "None")]
    pub memory_budget_bytes: Option<u64>,
    #[config(default = "DeviceSelection::Cpu")]
    pub device: DeviceSelection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Number of blocks the cache can hold.
    pub fn cache_capacity(&self) -> usize {
        self.sink_size + self.window_size
    }

    /// Shape of one latent block: `[1, frames, channels, height, width]`.
    pub fn block_shape(&self) -> [usize; 5] {
        [
            1,
            self.frames_per_block,
            self.latent_channels,
            self.latent_height,
            self.latent_width,
        ]
    }

    pub fn validate(&self) -> error::Result<()> {
        let fail = |msg: String| Err(RollingSinkError::Configuration(msg));

        if self.frames_per_block == 0 {
            return fail("frames_per_block must be positive".into());
        }
        if self.latent_channels == 0 || self.latent_height == 0 || self.latent_width == 0 {
            return fail("latent dimensions must be positive".into());
        }
        if self.cache_capacity() == 0 {
            return fail("sink_size + window_size must be at least one block".into());
        }
        if self.num_train_timesteps == 0 {
            return fail("num_train_timesteps must be positive".into());
        }
        if self.denoising_steps.is_empty() {
            return fail("denoising_steps must name at least one step".into());
        }
        let max_t = self.num_train_timesteps as f32;
        for &t in &self.denoising_steps {
            if !(t > 0.0 && t <= max_t) {
                return fail(format!("denoising step {t} outside (0, {max_t}]"));
            }
        }
        if self.denoising_steps.windows(2).any(|w| w[1] >= w[0]) {
            return fail(format!(
                "denoising_steps must be strictly decreasing, got {:?}",
                self.denoising_steps
            ));
        }
        if !(self.timestep_shift > 0.0) {
            return fail("timestep_shift must be positive".into());
        }
        if !(self.context_noise >= 0.0 && self.context_noise < max_t) {
            return fail(format!("context_noise {} outside [0, {max_t})", self.context_noise));
        }
        if self.fps == 0 || self.vae_temporal_stride == 0 || self.vae_spatial_scale == 0 {
            return fail("fps and VAE strides must be positive".into());
        }
        if !(self.min_duration_secs.is_finite() && self.max_duration_secs.is_finite())
            || self.min_duration_secs < 0.0
            || self.min_duration_secs > self.max_duration_secs
            || self.max_duration_secs > MAX_DURATION_LIMIT_SECS
        {
            return fail(format!(
                "duration range [{}, {}] is invalid (limit {MAX_DURATION_LIMIT_SECS}s)",
                self.min_duration_secs, self.max_duration_secs
            ));
        }
        if self.max_concurrent_requests != 1 {
            return fail(format!(
                "max_concurrent_requests must be 1 (single-flight engine), got {}",
                self.max_concurrent_requests
            ));
        }
        Ok(())
    }
}

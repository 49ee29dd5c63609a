use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor};
use tracing::debug;

use crate::cache::CacheSnapshot;
use crate::conditioning::Conditioning;
use crate::config::{EngineConfig, Precision};
use crate::diffusion::FewStepSchedule;
use crate::error::{Result, RollingSinkError};
use crate::noise::StepNoise;

/// Progress of one block through its denoising steps. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Pending,
    Denoising { step: usize },
    Clean,
}

/// Unit of autoregressive generation: a fixed number of latent frames.
#[derive(Debug, Clone)]
pub struct Block<B: Backend> {
    index: usize,
    latent: Tensor<B, 5>,
    status: BlockStatus,
}

impl<B: Backend> Block<B> {
    pub fn new(index: usize, noise: Tensor<B, 5>) -> Self {
        Self {
            index,
            latent: noise,
            status: BlockStatus::Pending,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn latent(&self) -> &Tensor<B, 5> {
        &self.latent
    }

    /// Consumes a clean block, returning its latent.
    pub fn into_latent(self) -> Tensor<B, 5> {
        self.latent
    }

    fn advance(&mut self, next: BlockStatus) -> Result<()> {
        let ok = match (self.status, next) {
            (BlockStatus::Pending, BlockStatus::Denoising { step: 0 }) => true,
            (BlockStatus::Denoising { step }, BlockStatus::Denoising { step: n }) => n == step + 1,
            (BlockStatus::Denoising { .. }, BlockStatus::Clean) => true,
            _ => false,
        };
        if !ok {
            return Err(RollingSinkError::InvalidTransition {
                from: format!("block {} {:?}", self.index, self.status),
                to: format!("{next:?}"),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// The denoising network as an injectable capability.
///
/// `context` holds the states of earlier clean blocks; the network reads it and never
/// mutates it. `position` is the rolled position of the block being processed.
pub trait CausalDenoiser<B: Backend> {
    /// Per-block attention state stored in the cache.
    type State: Clone;

    /// Predicts the clean latent of a noisy block at `timestep`.
    fn predict(
        &self,
        noisy: Tensor<B, 5>,
        conditioning: &Conditioning<B>,
        timestep: f32,
        context: &CacheSnapshot<'_, Self::State>,
        position: usize,
    ) -> Result<Tensor<B, 5>>;

    /// Computes the state later blocks attend to, from the (lightly noised) clean block.
    fn encode_context(
        &self,
        clean: Tensor<B, 5>,
        conditioning: &Conditioning<B>,
        timestep: f32,
        context: &CacheSnapshot<'_, Self::State>,
        position: usize,
    ) -> Result<Self::State>;
}

/// Output of a fully denoised block.
pub struct DenoisedBlock<B: Backend, S> {
    pub block: Block<B>,
    pub state: S,
}

/// Runs the few-step schedule for one block.
pub struct BlockDenoiser<N> {
    network: N,
    schedule: FewStepSchedule,
    precision: Precision,
}

impl<N> BlockDenoiser<N> {
    pub fn new(network: N, config: &EngineConfig) -> Self {
        Self {
            network,
            schedule: FewStepSchedule::from_config(config),
            precision: config.precision,
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn schedule(&self) -> &FewStepSchedule {
        &self.schedule
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Denoises `block` against `context`, returning the clean block and its cache state.
    pub fn denoise<B>(
        &self,
        mut block: Block<B>,
        context: &CacheSnapshot<'_, N::State>,
        conditioning: &Conditioning<B>,
        step_noise: &mut StepNoise,
    ) -> Result<DenoisedBlock<B, N::State>>
    where
        B: Backend,
        N: CausalDenoiser<B>,
    {
        let position = context.next_position();
        let shape = block.latent.dims();
        let device = block.latent.device();
        let mut noisy = self
            .precision
            .quantize_checked(block.latent.clone(), "initial noise")?;
        let mut clean = None;

        for (step, &t) in self.schedule.timesteps().iter().enumerate() {
            block.advance(BlockStatus::Denoising { step })?;
            let stage = format!("block {} step {step}", block.index);
            let pred = self
                .network
                .predict(noisy.clone(), conditioning, t, context, position)?;
            let pred = self.precision.quantize_checked(pred, &stage)?;
            debug!(block = block.index, step, timestep = t, "denoising step");

            match self.schedule.next_timestep(step) {
                Some(next_t) => {
                    let eps = step_noise.next::<B>(shape, &device);
                    noisy = self
                        .precision
                        .quantize_checked(self.schedule.add_noise(pred, eps, next_t), &stage)?;
                }
                None => clean = Some(pred),
            }
        }

        let clean = clean.ok_or_else(|| {
            RollingSinkError::Configuration("denoising schedule has no steps".into())
        })?;

        let context_t = self.schedule.context_timestep();
        let context_input = if context_t > 0.0 {
            let eps = step_noise.next::<B>(shape, &device);
            self.precision.quantize_checked(
                self.schedule.add_noise(clean.clone(), eps, context_t),
                "context noise",
            )?
        } else {
            clean.clone()
        };
        let state = self
            .network
            .encode_context(context_input, conditioning, context_t, context, position)?;

        block.latent = clean;
        block.advance(BlockStatus::Clean)?;
        Ok(DenoisedBlock { block, state })
    }
}

//! Request orchestration: duration planning, the block loop and cache lifecycle.

use burn_core as burn;

use std::time::Instant;

use burn::tensor::{backend::Backend, Tensor};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheStats, SinkCache};
use crate::conditioning::ConditioningEncoder;
use crate::config::EngineConfig;
use crate::decoder::LatentDecoder;
use crate::denoise::{Block, BlockDenoiser, CausalDenoiser, DenoisedBlock};
use crate::error::{Result, RollingSinkError};
use crate::noise::{NoiseProvider, NoiseTile, SeededNormalNoise, StepNoise};
use crate::video::VideoFrames;

mod plan;

pub use plan::BlockPlan;

/// Inbound request: a prompt and a duration in seconds.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub duration_secs: f64,
    /// Overrides `EngineConfig::seed`.
    pub seed: Option<u64>,
    /// Checked between blocks; a running block always completes.
    pub deadline: Option<Instant>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            prompt: prompt.into(),
            duration_secs,
            seed: None,
            deadline: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Request-level state. One path to `Done`; `Failed` is reachable from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    EncodingPrompt,
    GeneratingBlock { index: usize },
    Decoding,
    Done,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed)
    }

    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Idle, EncodingPrompt) => true,
            (EncodingPrompt, GeneratingBlock { index: 0 }) => true,
            (GeneratingBlock { index }, GeneratingBlock { index: n }) => n == index + 1,
            (GeneratingBlock { .. }, Decoding) => true,
            (Decoding, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// What a request looked like after one block turned clean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub index: usize,
    /// Block indices the block attended over, in snapshot order.
    pub context_indices: Vec<usize>,
    pub rolled_positions: Vec<usize>,
    pub cache_len: usize,
    pub evictions: u64,
}

/// Hooks into a running request. Both methods default to no-ops.
pub trait GenerationObserver {
    fn on_state(&mut self, _state: RequestState) {}
    fn on_block(&mut self, _report: &BlockReport) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl GenerationObserver for NoopObserver {}

struct RequestTracker<'a> {
    state: RequestState,
    observer: &'a mut dyn GenerationObserver,
}

impl<'a> RequestTracker<'a> {
    fn new(observer: &'a mut dyn GenerationObserver) -> Self {
        observer.on_state(RequestState::Idle);
        Self {
            state: RequestState::Idle,
            observer,
        }
    }

    fn advance(&mut self, next: RequestState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RollingSinkError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{next:?}"),
            });
        }
        self.state = next;
        self.observer.on_state(next);
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = RequestState::Failed;
            self.observer.on_state(RequestState::Failed);
        }
    }
}

/// Result of a successful request.
#[derive(Debug)]
pub struct GenerationOutput<B: Backend> {
    pub video: VideoFrames,
    pub plan: BlockPlan,
    /// Cache counters at the end of the block loop.
    pub cache_stats: CacheStats,
    /// Clean latent blocks in index order, when `return_latents` is set.
    pub latents: Option<Vec<Tensor<B, 5>>>,
}

/// Something that turns requests into videos. The engine handle is generic over it.
pub trait VideoGenerator {
    type Output;

    fn generate(&mut self, request: &GenerationRequest) -> Result<Self::Output>;
}

/// Drives the blocks of a request strictly in order and owns the sink cache.
pub struct BlockScheduler<B, N, E, D, P = SeededNormalNoise>
where
    B: Backend,
    N: CausalDenoiser<B>,
{
    config: EngineConfig,
    denoiser: BlockDenoiser<N>,
    encoder: E,
    decoder: D,
    noise: P,
    cache: SinkCache<N::State>,
    device: B::Device,
}

impl<B, N, E, D> BlockScheduler<B, N, E, D, SeededNormalNoise>
where
    B: Backend,
    N: CausalDenoiser<B>,
    E: ConditioningEncoder<B>,
    D: LatentDecoder<B>,
{
    pub fn new(config: EngineConfig, network: N, encoder: E, decoder: D, device: B::Device) -> Result<Self> {
        config.validate()?;
        let cache = SinkCache::new(config.sink_size, config.window_size)?;
        Ok(Self {
            denoiser: BlockDenoiser::new(network, &config),
            config,
            encoder,
            decoder,
            noise: SeededNormalNoise,
            cache,
            device,
        })
    }
}

impl<B, N, E, D, P> BlockScheduler<B, N, E, D, P>
where
    B: Backend,
    N: CausalDenoiser<B>,
    E: ConditioningEncoder<B>,
    D: LatentDecoder<B>,
    P: NoiseProvider<B>,
{
    /// Replaces the noise source.
    pub fn with_noise<Q: NoiseProvider<B>>(self, noise: Q) -> BlockScheduler<B, N, E, D, Q> {
        BlockScheduler {
            config: self.config,
            denoiser: self.denoiser,
            encoder: self.encoder,
            decoder: self.decoder,
            noise,
            cache: self.cache,
            device: self.device,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn denoiser(&self) -> &BlockDenoiser<N> {
        &self.denoiser
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn cache(&self) -> &SinkCache<N::State> {
        &self.cache
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn plan(&self, duration_secs: f64) -> Result<BlockPlan> {
        BlockPlan::from_duration(duration_secs, &self.config)
    }

    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput<B>> {
        self.generate_with_observer(request, &mut NoopObserver)
    }

    /// Runs one request. The cache is reset on entry and on every exit, and the
    /// decoder is reset on entry and after a failure.
    pub fn generate_with_observer(
        &mut self,
        request: &GenerationRequest,
        observer: &mut dyn GenerationObserver,
    ) -> Result<GenerationOutput<B>> {
        let started = Instant::now();
        self.cache.reset();
        let mut tracker = RequestTracker::new(observer);

        let result = self.run(request, &mut tracker);
        self.cache.reset();

        match result.and_then(|output| tracker.advance(RequestState::Done).map(|_| output)) {
            Ok(output) => {
                info!(
                    blocks = output.plan.num_blocks,
                    frames = output.video.num_frames,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generation finished"
                );
                Ok(output)
            }
            Err(err) => {
                self.decoder.reset();
                tracker.fail();
                warn!(error = %err, "generation failed");
                Err(err)
            }
        }
    }

    fn run(&mut self, request: &GenerationRequest, tracker: &mut RequestTracker<'_>) -> Result<GenerationOutput<B>> {
        if request.prompt.trim().is_empty() {
            return Err(RollingSinkError::RequestValidation("prompt is empty".into()));
        }
        let plan = BlockPlan::from_duration(request.duration_secs, &self.config)?;
        plan.check_budget(&self.config)?;
        let seed = request.seed.unwrap_or(self.config.seed);
        info!(
            duration_secs = plan.effective_secs,
            blocks = plan.num_blocks,
            latent_frames = plan.latent_frames,
            seed,
            "generation started"
        );

        tracker.advance(RequestState::EncodingPrompt)?;
        let conditioning = self.encoder.encode(&request.prompt, &self.device)?;

        self.decoder.reset();
        let tile = NoiseTile::new(self.noise.sample(self.config.block_shape(), seed, &self.device));
        let mut step_noise = StepNoise::new(seed);
        let precision = self.denoiser.precision();

        let mut chunks = Vec::with_capacity(plan.num_blocks);
        let mut latents = self.config.return_latents.then(Vec::new);

        for index in 0..plan.num_blocks {
            if let Some(deadline) = request.deadline {
                if Instant::now() >= deadline {
                    return Err(RollingSinkError::DeadlineExceeded {
                        completed_blocks: index,
                    });
                }
            }
            tracker.advance(RequestState::GeneratingBlock { index })?;

            let snapshot = self.cache.snapshot();
            let context_indices = snapshot.block_indices();
            let rolled_positions = snapshot.rolled_positions();
            let DenoisedBlock { block, state } = self.denoiser.denoise(
                Block::new(index, tile.for_block(index)),
                &snapshot,
                &conditioning,
                &mut step_noise,
            )?;
            drop(snapshot);
            self.cache.insert(CacheEntry::new(index, state))?;

            let latent = precision.quantize_checked(block.into_latent(), "decoder input")?;
            if let Some(latents) = latents.as_mut() {
                latents.push(latent.clone());
            }
            chunks.push(self.decoder.decode(latent)?);

            let report = BlockReport {
                index,
                context_indices,
                rolled_positions,
                cache_len: self.cache.len(),
                evictions: self.cache.stats().evictions,
            };
            debug!(
                block = index,
                context = ?report.context_indices,
                cache_len = report.cache_len,
                "block clean"
            );
            tracker.observer.on_block(&report);
        }

        tracker.advance(RequestState::Decoding)?;
        let video = VideoFrames::from_pixels(Tensor::cat(chunks, 1), self.config.fps)?;
        if video.num_frames != plan.pixel_frames {
            warn!(
                expected = plan.pixel_frames,
                decoded = video.num_frames,
                "decoder frame count differs from plan"
            );
        }

        Ok(GenerationOutput {
            video,
            plan,
            cache_stats: self.cache.stats(),
            latents,
        })
    }
}

impl<B, N, E, D, P> VideoGenerator for BlockScheduler<B, N, E, D, P>
where
    B: Backend,
    N: CausalDenoiser<B>,
    E: ConditioningEncoder<B>,
    D: LatentDecoder<B>,
    P: NoiseProvider<B>,
{
    type Output = GenerationOutput<B>;

    fn generate(&mut self, request: &GenerationRequest) -> Result<Self::Output> {
        self.generate_with_observer(request, &mut NoopObserver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_states_only_move_forward() {
        use RequestState::*;
        assert!(Idle.can_transition_to(EncodingPrompt));
        assert!(EncodingPrompt.can_transition_to(GeneratingBlock { index: 0 }));
        assert!(GeneratingBlock { index: 2 }.can_transition_to(GeneratingBlock { index: 3 }));
        assert!(!GeneratingBlock { index: 2 }.can_transition_to(GeneratingBlock { index: 2 }));
        assert!(!EncodingPrompt.can_transition_to(Decoding));
        assert!(GeneratingBlock { index: 0 }.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Idle));
    }
}

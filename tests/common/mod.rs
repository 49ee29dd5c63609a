#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn_ndarray::NdArray;
use burn_rolling_sink::cache::CacheSnapshot;
use burn_rolling_sink::conditioning::{Conditioning, ConditioningEncoder};
use burn_rolling_sink::config::{EngineConfig, Precision};
use burn_rolling_sink::decoder::LatentDecoder;
use burn_rolling_sink::denoise::CausalDenoiser;
use burn_rolling_sink::generate::{BlockReport, BlockScheduler, GenerationObserver, RequestState};
use burn_rolling_sink::{Result, RollingSinkError};
use burn_tensor::backend::Backend;
use burn_tensor::{ElementConversion, Tensor};
use parking_lot::Mutex;

pub type TB = NdArray<f32>;

pub fn device() -> <TB as Backend>::Device {
    Default::default()
}

/// Small latents, f32, durations down to zero and up to two minutes.
pub fn small_config() -> EngineConfig {
    EngineConfig::new()
        .with_latent_channels(4)
        .with_latent_height(4)
        .with_latent_width(4)
        .with_precision(Precision::F32)
        .with_min_duration_secs(0.0)
        .with_max_duration_secs(120.0)
}

/// Shortest duration that maps to `blocks` blocks with the default fps/stride and
/// floor rounding.
pub fn secs_for_blocks(blocks: usize) -> f64 {
    (12.0 * blocks as f64 - 9.0) / 16.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictCall {
    pub position: usize,
    pub timestep: f32,
    pub context: Vec<usize>,
}

/// Deterministic stand-in network that logs every call.
///
/// The prediction mixes in the cached states, so leaked context changes the output.
#[derive(Clone, Default)]
pub struct RecordingDenoiser {
    pub calls: Arc<Mutex<Vec<PredictCall>>>,
    pub context_passes: Arc<AtomicUsize>,
    /// Positions at which `predict` returns NaN.
    pub nan_at_position: Option<usize>,
    /// Positions at which `predict` returns 1e6: finite in f32, beyond f16 range.
    pub overflow_at_position: Option<usize>,
}

impl RecordingDenoiser {
    pub fn failing_at(position: usize) -> Self {
        Self {
            nan_at_position: Some(position),
            ..Self::default()
        }
    }

    pub fn overflowing_at(position: usize) -> Self {
        Self {
            overflow_at_position: Some(position),
            ..Self::default()
        }
    }
}

impl<B: Backend> CausalDenoiser<B> for RecordingDenoiser {
    type State = f32;

    fn predict(
        &self,
        noisy: Tensor<B, 5>,
        _conditioning: &Conditioning<B>,
        timestep: f32,
        context: &CacheSnapshot<'_, f32>,
        position: usize,
    ) -> Result<Tensor<B, 5>> {
        self.calls.lock().push(PredictCall {
            position,
            timestep,
            context: context.block_indices(),
        });
        if self.nan_at_position == Some(position) {
            return Ok(noisy.mul_scalar(f32::NAN));
        }
        if self.overflow_at_position == Some(position) {
            return Ok(noisy.zeros_like().add_scalar(1.0e6));
        }
        let carried: f32 = context.iter().map(|e| *e.state()).sum();
        Ok(noisy.mul_scalar(0.5).add_scalar(0.1 * carried + 0.01 * position as f32))
    }

    fn encode_context(
        &self,
        clean: Tensor<B, 5>,
        _conditioning: &Conditioning<B>,
        _timestep: f32,
        _context: &CacheSnapshot<'_, f32>,
        _position: usize,
    ) -> Result<f32> {
        self.context_passes.fetch_add(1, Ordering::SeqCst);
        Ok(clean.mean().into_scalar().elem::<f32>())
    }
}

/// One pixel frame per latent frame: the first three channels, clamped.
#[derive(Clone, Default)]
pub struct CountingDecoder {
    pub resets: Arc<AtomicUsize>,
    pub decoded_blocks: Arc<AtomicUsize>,
    pub fail_on_block: Option<usize>,
    since_reset: usize,
}

impl CountingDecoder {
    pub fn failing_on(block: usize) -> Self {
        Self {
            fail_on_block: Some(block),
            ..Self::default()
        }
    }
}

impl<B: Backend> LatentDecoder<B> for CountingDecoder {
    fn reset(&mut self) {
        self.since_reset = 0;
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn decode(&mut self, latent: Tensor<B, 5>) -> Result<Tensor<B, 5>> {
        if self.fail_on_block == Some(self.since_reset) {
            return Err(RollingSinkError::computation("decode", "injected failure"));
        }
        self.since_reset += 1;
        self.decoded_blocks.fetch_add(1, Ordering::SeqCst);
        let [b, f, _, h, w] = latent.dims();
        Ok(latent.slice([0..b, 0..f, 0..3, 0..h, 0..w]).clamp(-1.0, 1.0))
    }
}

/// Fixed embedding; counts how often it is asked.
#[derive(Clone, Default)]
pub struct ConstantEncoder {
    pub calls: Arc<AtomicUsize>,
}

impl<B: Backend> ConditioningEncoder<B> for ConstantEncoder {
    fn encode(&self, _prompt: &str, device: &B::Device) -> Result<Conditioning<B>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Conditioning::new(Tensor::ones([1, 2, 8], device)))
    }
}

pub type FakeScheduler = BlockScheduler<TB, RecordingDenoiser, ConstantEncoder, CountingDecoder>;

pub fn fake_scheduler(config: EngineConfig) -> (FakeScheduler, RecordingDenoiser, CountingDecoder, ConstantEncoder) {
    let denoiser = RecordingDenoiser::default();
    let decoder = CountingDecoder::default();
    let encoder = ConstantEncoder::default();
    let scheduler = BlockScheduler::new(config, denoiser.clone(), encoder.clone(), decoder.clone(), device())
        .unwrap();
    (scheduler, denoiser, decoder, encoder)
}

#[derive(Default)]
pub struct RecordingObserver {
    pub states: Vec<RequestState>,
    pub blocks: Vec<BlockReport>,
}

impl GenerationObserver for RecordingObserver {
    fn on_state(&mut self, state: RequestState) {
        self.states.push(state);
    }

    fn on_block(&mut self, report: &BlockReport) {
        self.blocks.push(report.clone());
    }
}

use burn_core as burn;

use burn::config::Config;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};

use crate::error::{self, RollingSinkError};
use crate::loader::WeightMap;
use crate::model::params::{export_linear, load_linear};

/// Latent to pixel decoder with causal internal state.
///
/// `decode` takes `[batch, frames, channels, h, w]` latents and returns pixel frames
/// `[batch, frames', 3, H, W]` in `[-1, 1]`. Output depends on every latent decoded
/// since the last `reset`, so the engine resets it at the start of each request.
pub trait LatentDecoder<B: Backend> {
    fn reset(&mut self);
    fn decode(&mut self, latent: Tensor<B, 5>) -> error::Result<Tensor<B, 5>>;
}

#[derive(Config, Debug)]
pub struct CausalFrameDecoderConfig {
    pub latent_channels: usize,
    /// Pixel frames per latent frame after the first.
    #[config(default = 4)]
    pub temporal_stride: usize,
    #[config(default = 8)]
    pub spatial_scale: usize,
}

/// Reference decoder: per-pixel projection to RGB, nearest spatial upsampling and
/// linear temporal interpolation from the previous latent frame.
///
/// The first latent frame after a reset yields one pixel frame, every later latent
/// frame yields `temporal_stride` frames.
#[derive(Debug)]
pub struct CausalFrameDecoder<B: Backend> {
    projection: Linear<B>,
    temporal_stride: usize,
    spatial_scale: usize,
    previous: Option<Tensor<B, 4>>,
}

impl CausalFrameDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CausalFrameDecoder<B> {
        CausalFrameDecoder {
            projection: LinearConfig::new(self.latent_channels, 3).init(device),
            temporal_stride: self.temporal_stride.max(1),
            spatial_scale: self.spatial_scale.max(1),
            previous: None,
        }
    }
}

impl<B: Backend> CausalFrameDecoder<B> {
    /// Pixel frames produced for `latent_frames` latent frames decoded from a reset.
    pub fn pixel_frames_for(&self, latent_frames: usize) -> usize {
        if latent_frames == 0 {
            0
        } else {
            1 + (latent_frames - 1) * self.temporal_stride
        }
    }

    pub fn projection(&self) -> &Linear<B> {
        &self.projection
    }

    /// Loads `<prefix>.projection.{weight,bias}`.
    pub fn load_weights(&mut self, weights: &WeightMap, prefix: &str) -> error::Result<()> {
        load_linear(&mut self.projection, weights, &format!("{prefix}.projection"))
    }

    pub fn export_weights(&self, prefix: &str, out: &mut WeightMap) {
        export_linear(&self.projection, &format!("{prefix}.projection"), out);
    }

    fn render(&self, frame: Tensor<B, 4>) -> Tensor<B, 4> {
        // [B, C, H, W] -> [B, H, W, C] -> [B, H, W, 3] -> [B, 3, H, W]
        let [b, _c, h, w] = frame.dims();
        let rgb = self
            .projection
            .forward(frame.permute([0, 2, 3, 1]))
            .tanh()
            .permute([0, 3, 1, 2]);
        let s = self.spatial_scale;
        if s == 1 {
            return rgb;
        }
        rgb.reshape([b, 3, h, 1, w, 1])
            .repeat_dim(3, s)
            .repeat_dim(5, s)
            .reshape([b, 3, h * s, w * s])
    }
}

impl<B: Backend> LatentDecoder<B> for CausalFrameDecoder<B> {
    fn reset(&mut self) {
        self.previous = None;
    }

    fn decode(&mut self, latent: Tensor<B, 5>) -> error::Result<Tensor<B, 5>> {
        let [b, f, c, h, w] = latent.dims();
        if f == 0 {
            return Err(RollingSinkError::computation("decode", "latent block has no frames"));
        }
        let expected = self.projection.weight.dims()[0];
        if c != expected {
            return Err(RollingSinkError::computation(
                "decode",
                format!("latent has {c} channels, decoder expects {expected}"),
            ));
        }

        let mut frames = Vec::with_capacity(f * self.temporal_stride);
        for i in 0..f {
            let current = latent
                .clone()
                .slice([0..b, i..i + 1, 0..c, 0..h, 0..w])
                .reshape([b, c, h, w]);
            match self.previous.take() {
                None => frames.push(self.render(current.clone())),
                Some(prev) => {
                    for k in 1..=self.temporal_stride {
                        let alpha = k as f32 / self.temporal_stride as f32;
                        let mixed = prev.clone().mul_scalar(1.0 - alpha) + current.clone().mul_scalar(alpha);
                        frames.push(self.render(mixed));
                    }
                }
            }
            self.previous = Some(current);
        }

        let frames: Vec<Tensor<B, 5>> = frames.into_iter().map(|t| t.unsqueeze_dim::<5>(1)).collect();
        Ok(Tensor::cat(frames, 1))
    }
}

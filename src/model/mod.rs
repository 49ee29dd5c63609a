//! Reference block-causal denoising network.

use burn_core as burn;

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, RmsNorm, RmsNormConfig};
use burn::tensor::activation::silu;
use burn::tensor::{backend::Backend, Tensor, TensorData};

use crate::cache::CacheSnapshot;
use crate::conditioning::Conditioning;
use crate::denoise::CausalDenoiser;
use crate::error::{self, RollingSinkError};
use crate::loader::WeightMap;

mod layer;
pub mod params;

pub use layer::{ContextLayer, LayerKv};

use params::{export_linear, export_rms_norm, load_linear, load_rms_norm};

#[derive(Config, Debug)]
pub struct BlockCausalTransformerConfig {
    pub latent_channels: usize,
    /// Width of the conditioning embedding.
    pub text_dim: usize,
    #[config(default = 64)]
    pub d_model: usize,
    #[config(default = 4)]
    pub n_heads: usize,
    #[config(default = 2)]
    pub n_layers: usize,
    #[config(default = 4)]
    pub ffn_ratio: usize,
    /// Spatial patch edge; latent height and width must be multiples of it.
    #[config(default = 2)]
    pub patch_size: usize,
    #[config(default = 3)]
    pub frames_per_block: usize,
    #[config(default = 1000)]
    pub num_train_timesteps: usize,
    #[config(default = 1e-6)]
    pub norm_eps: f64,
}

/// Per-layer K/V of one clean block, as stored in the sink cache.
#[derive(Debug, Clone)]
pub struct BlockKv<B: Backend> {
    pub layers: Vec<LayerKv<B>>,
}

/// Flow-matching transformer over spatial patches of a latent block.
///
/// Tokens attend to every token of their own block and to the cached K/V of the
/// snapshot blocks, never to later blocks. Keys are cached without positions; the
/// frame position embedding is added in head space at attention time from the
/// rolled position of each entry.
#[derive(Module, Debug)]
pub struct BlockCausalTransformer<B: Backend> {
    proj_in: Linear<B>,
    time_embed: Linear<B>,
    text_proj: Linear<B>,
    layers: Vec<ContextLayer<B>>,
    norm_out: RmsNorm<B>,
    proj_out: Linear<B>,
    latent_channels: usize,
    text_dim: usize,
    d_model: usize,
    n_heads: usize,
    patch_size: usize,
    frames_per_block: usize,
    num_train_timesteps: usize,
}

impl BlockCausalTransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<BlockCausalTransformer<B>> {
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(RollingSinkError::Configuration(format!(
                "d_model {} must be divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        if self.patch_size == 0 || self.latent_channels == 0 || self.frames_per_block == 0 {
            return Err(RollingSinkError::Configuration(
                "patch_size, latent_channels and frames_per_block must be positive".into(),
            ));
        }
        let patch_dim = self.latent_channels * self.patch_size * self.patch_size;
        let linear = |d_in, d_out| LinearConfig::new(d_in, d_out).init(device);
        let layers = (0..self.n_layers)
            .map(|_| {
                ContextLayer::new(
                    self.d_model,
                    self.n_heads,
                    self.d_model * self.ffn_ratio,
                    self.norm_eps,
                    device,
                )
            })
            .collect();

        Ok(BlockCausalTransformer {
            proj_in: linear(patch_dim, self.d_model),
            time_embed: linear(self.d_model, self.d_model),
            text_proj: linear(self.text_dim, self.d_model),
            layers,
            norm_out: RmsNormConfig::new(self.d_model)
                .with_epsilon(self.norm_eps)
                .init(device),
            proj_out: linear(self.d_model, patch_dim),
            latent_channels: self.latent_channels,
            text_dim: self.text_dim,
            d_model: self.d_model,
            n_heads: self.n_heads,
            patch_size: self.patch_size,
            frames_per_block: self.frames_per_block,
            num_train_timesteps: self.num_train_timesteps,
        })
    }
}

impl<B: Backend> BlockCausalTransformer<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn d_k(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// `[b, f, c, h, w]` to `[b, f * h/p * w/p, c * p * p]`.
    fn patchify(&self, latent: Tensor<B, 5>) -> Tensor<B, 3> {
        let [b, f, c, h, w] = latent.dims();
        let p = self.patch_size;
        let (hp, wp) = (h / p, w / p);
        latent
            .reshape([b * f, c, hp, p, wp, p])
            .permute([0, 2, 4, 1, 3, 5])
            .reshape([b, f * hp * wp, c * p * p])
    }

    fn unpatchify(&self, tokens: Tensor<B, 3>, shape: [usize; 5]) -> Tensor<B, 5> {
        let [b, f, c, h, w] = shape;
        let p = self.patch_size;
        let (hp, wp) = (h / p, w / p);
        tokens
            .reshape([b * f, hp, wp, c, p, p])
            .permute([0, 3, 1, 4, 2, 5])
            .reshape([b, f, c, h, w])
    }

    /// Frame position embedding of a block at rolled position `position`, broadcast to
    /// its tokens: `[1, 1, frames * tokens_per_frame, d_k]`.
    fn frame_positions(&self, position: usize, tokens_per_frame: usize, device: &B::Device) -> Tensor<B, 4> {
        let f = self.frames_per_block;
        let d_k = self.d_k();
        let positions: Vec<f32> = (0..f).map(|i| (position * f + i) as f32).collect();
        let table = Tensor::<B, 2>::from_data(TensorData::new(sinusoid(&positions, d_k), [f, d_k]), device);
        table
            .reshape([f, 1, d_k])
            .repeat_dim(1, tokens_per_frame)
            .reshape([1, 1, f * tokens_per_frame, d_k])
    }

    fn check_input(&self, latent: &Tensor<B, 5>, conditioning: &Conditioning<B>) -> error::Result<()> {
        let [_, f, c, h, w] = latent.dims();
        let p = self.patch_size;
        if f != self.frames_per_block || c != self.latent_channels || h % p != 0 || w % p != 0 {
            return Err(RollingSinkError::computation(
                "transformer input",
                format!(
                    "latent {:?} does not fit {} frames x {} channels with patch {p}",
                    latent.dims(),
                    self.frames_per_block,
                    self.latent_channels
                ),
            ));
        }
        if conditioning.dim() != self.text_dim {
            return Err(RollingSinkError::computation(
                "transformer input",
                format!("conditioning width {} != {}", conditioning.dim(), self.text_dim),
            ));
        }
        Ok(())
    }

    /// Runs the network on one block, returning the flow prediction and the block's K/V.
    pub fn forward_block(
        &self,
        latent: Tensor<B, 5>,
        conditioning: &Conditioning<B>,
        timestep: f32,
        context: &CacheSnapshot<'_, BlockKv<B>>,
        position: usize,
    ) -> error::Result<(Tensor<B, 5>, BlockKv<B>)> {
        self.check_input(&latent, conditioning)?;
        let shape = latent.dims();
        let [b, _, _, h, w] = shape;
        let device = latent.device();
        let tokens_per_frame = (h / self.patch_size) * (w / self.patch_size);

        let time = Tensor::<B, 2>::from_data(TensorData::new(sinusoid(&[timestep], self.d_model), [1, self.d_model]), &device);
        let time = silu(self.time_embed.forward(time)).reshape([1, 1, self.d_model]);
        let mut x = self.proj_in.forward(self.patchify(latent)) + time;

        let mut text = self.text_proj.forward(conditioning.embedding().clone());
        if b > 1 {
            text = text.repeat_dim(0, b);
        }

        let pos = self.frame_positions(position, tokens_per_frame, &device);
        let entry_pos: Vec<Tensor<B, 4>> = context
            .rolled_positions()
            .into_iter()
            .map(|r| self.frame_positions(r, tokens_per_frame, &device))
            .collect();

        let mut kv = Vec::with_capacity(self.layers.len());
        for (l, layer) in self.layers.iter().enumerate() {
            let mut past = Vec::with_capacity(context.len());
            for (entry, epos) in context.iter().zip(entry_pos.iter()) {
                let cached = entry.state().layers.get(l).ok_or_else(|| {
                    RollingSinkError::computation(
                        "transformer context",
                        format!("cached block {} has no layer {l}", entry.block_index()),
                    )
                })?;
                past.push((cached.k.clone() + epos.clone(), cached.v.clone()));
            }
            let (next, layer_kv) = layer.forward(x, text.clone(), pos.clone(), past);
            x = next;
            kv.push(layer_kv);
        }

        let out = self.proj_out.forward(self.norm_out.forward(x));
        Ok((self.unpatchify(out, shape), BlockKv { layers: kv }))
    }

    /// Loads every parameter from `weights`; names follow `export_weights`.
    pub fn load_weights(&mut self, weights: &WeightMap) -> error::Result<()> {
        load_linear(&mut self.proj_in, weights, "proj_in")?;
        load_linear(&mut self.time_embed, weights, "time_embed")?;
        load_linear(&mut self.text_proj, weights, "text_proj")?;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.load_weights(weights, &format!("layers.{i}"))?;
        }
        load_rms_norm(&mut self.norm_out, weights, "norm_out")?;
        load_linear(&mut self.proj_out, weights, "proj_out")
    }

    pub fn export_weights(&self) -> WeightMap {
        let mut out = WeightMap::new();
        export_linear(&self.proj_in, "proj_in", &mut out);
        export_linear(&self.time_embed, "time_embed", &mut out);
        export_linear(&self.text_proj, "text_proj", &mut out);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.export_weights(&format!("layers.{i}"), &mut out);
        }
        export_rms_norm(&self.norm_out, "norm_out", &mut out);
        export_linear(&self.proj_out, "proj_out", &mut out);
        out
    }

    fn sigma(&self, timestep: f32) -> f32 {
        (timestep / self.num_train_timesteps as f32).clamp(0.0, 1.0)
    }
}

impl<B: Backend> CausalDenoiser<B> for BlockCausalTransformer<B> {
    type State = BlockKv<B>;

    /// `x0 = x_t - sigma * v` from the predicted flow `v`.
    fn predict(
        &self,
        noisy: Tensor<B, 5>,
        conditioning: &Conditioning<B>,
        timestep: f32,
        context: &CacheSnapshot<'_, Self::State>,
        position: usize,
    ) -> error::Result<Tensor<B, 5>> {
        let (flow, _) = self.forward_block(noisy.clone(), conditioning, timestep, context, position)?;
        Ok(noisy - flow.mul_scalar(self.sigma(timestep)))
    }

    fn encode_context(
        &self,
        clean: Tensor<B, 5>,
        conditioning: &Conditioning<B>,
        timestep: f32,
        context: &CacheSnapshot<'_, Self::State>,
        position: usize,
    ) -> error::Result<Self::State> {
        let (_, kv) = self.forward_block(clean, conditioning, timestep, context, position)?;
        Ok(kv)
    }
}

/// Sinusoidal embedding of each value: `[sin(v * w_i)..., cos(v * w_i)...]`, zero padded
/// when `dim` is odd.
fn sinusoid(values: &[f32], dim: usize) -> Vec<f32> {
    let half = dim / 2;
    let mut out = Vec::with_capacity(values.len() * dim);
    for &v in values {
        let freqs = (0..half).map(|i| (-(10_000f32.ln()) * i as f32 / half.max(1) as f32).exp());
        out.extend(freqs.clone().map(|w| (v * w).sin()));
        out.extend(freqs.map(|w| (v * w).cos()));
        if dim % 2 == 1 {
            out.push(0.0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::sinusoid;

    #[test]
    fn sinusoid_starts_with_unit_frequency() {
        let emb = sinusoid(&[0.0, 1.0], 5);
        assert_eq!(emb.len(), 10);
        assert_eq!(&emb[..5], &[0.0, 0.0, 1.0, 1.0, 0.0]);
        assert!((emb[5] - 1f32.sin()).abs() < 1e-6);
    }
}

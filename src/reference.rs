//! Wiring of the built-in reference components into a ready scheduler.

use burn_core as burn;

use burn::config::Config;
use burn::tensor::backend::Backend;
use tracing::info;

use crate::conditioning::HashingTextEncoder;
use crate::config::EngineConfig;
use crate::decoder::{CausalFrameDecoder, CausalFrameDecoderConfig};
use crate::error;
use crate::generate::BlockScheduler;
use crate::loader::WeightMap;
use crate::model::{BlockCausalTransformer, BlockCausalTransformerConfig};

/// Weight-name prefix of the decoder parameters.
pub const DECODER_PREFIX: &str = "decoder";

pub type ReferenceScheduler<B> =
    BlockScheduler<B, BlockCausalTransformer<B>, HashingTextEncoder, CausalFrameDecoder<B>>;

/// Sizes of the reference network and text encoder.
#[derive(Config, Debug)]
pub struct ReferenceModelConfig {
    #[config(default = 32)]
    pub text_dim: usize,
    #[config(default = 77)]
    pub max_prompt_tokens: usize,
    #[config(default = 64)]
    pub d_model: usize,
    #[config(default = 4)]
    pub n_heads: usize,
    #[config(default = 2)]
    pub n_layers: usize,
    #[config(default = 2)]
    pub patch_size: usize,
}

impl Default for ReferenceModelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceModelConfig {
    pub fn transformer(&self, engine: &EngineConfig) -> BlockCausalTransformerConfig {
        BlockCausalTransformerConfig::new(engine.latent_channels, self.text_dim)
            .with_d_model(self.d_model)
            .with_n_heads(self.n_heads)
            .with_n_layers(self.n_layers)
            .with_patch_size(self.patch_size)
            .with_frames_per_block(engine.frames_per_block)
            .with_num_train_timesteps(engine.num_train_timesteps)
    }

    pub fn decoder(&self, engine: &EngineConfig) -> CausalFrameDecoderConfig {
        CausalFrameDecoderConfig::new(engine.latent_channels)
            .with_temporal_stride(engine.vae_temporal_stride)
            .with_spatial_scale(engine.vae_spatial_scale)
    }

    /// Builds the reference scheduler, loading `weights` when given.
    pub fn build<B: Backend>(
        &self,
        engine: EngineConfig,
        weights: Option<&WeightMap>,
        device: B::Device,
    ) -> error::Result<ReferenceScheduler<B>> {
        engine.validate()?;
        let mut network = self.transformer(&engine).init::<B>(&device)?;
        let mut decoder = self.decoder(&engine).init::<B>(&device);
        if let Some(weights) = weights {
            network.load_weights(weights)?;
            decoder.load_weights(weights, DECODER_PREFIX)?;
            info!(tensors = weights.len(), "applied weights to reference model");
        }
        let encoder = HashingTextEncoder::new(self.text_dim, self.max_prompt_tokens);
        BlockScheduler::new(engine, network, encoder, decoder, device)
    }

    /// Freshly initialised parameters of the network and decoder, by name.
    pub fn init_weights<B: Backend>(&self, engine: &EngineConfig, device: &B::Device) -> error::Result<WeightMap> {
        let network = self.transformer(engine).init::<B>(device)?;
        let decoder = self.decoder(engine).init::<B>(device);
        let mut weights = network.export_weights();
        decoder.export_weights(DECODER_PREFIX, &mut weights);
        Ok(weights)
    }
}

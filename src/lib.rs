//! Block-causal autoregressive video diffusion with a rolling attention sink.
//!
//! A diffusion network trained on short clips is run block by block: every block of
//! latent frames is denoised in a few steps while attending over a bounded cache of
//! earlier blocks. The cache keeps a frozen prefix (the sink) plus a sliding window of
//! the most recent blocks, so its size and the positions the network sees stay within
//! the training horizon however long the video gets.

pub mod error;
pub mod config;
pub mod noise;
pub mod diffusion;
pub mod cache;
pub mod conditioning;
pub mod denoise;
pub mod decoder;
pub mod generate;
pub mod engine;
pub mod loader;
pub mod model;
pub mod video;
pub mod reference;

pub use error::{Result, RollingSinkError};
pub use config::EngineConfig;
pub use cache::{CacheEntry, CacheSnapshot, SinkCache};
pub use generate::{BlockPlan, BlockScheduler, GenerationOutput, GenerationRequest, VideoGenerator};
pub use engine::Engine;

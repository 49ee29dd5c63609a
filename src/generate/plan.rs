use tracing::warn;

use crate::config::{BlockRounding, EngineConfig};
use crate::error::{Result, RollingSinkError};

/// Block layout of one request, derived from its duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockPlan {
    /// Duration requested by the caller.
    pub requested_secs: f64,
    /// Duration after clamping to the configured range.
    pub effective_secs: f64,
    pub num_blocks: usize,
    pub latent_frames: usize,
    pub pixel_frames: usize,
}

impl BlockPlan {
    /// Maps a duration to a whole number of blocks.
    ///
    /// `raw = (secs * fps + stride - 1) / stride + frames_per_block` latent frames,
    /// snapped to a multiple of `frames_per_block` by the configured rounding and
    /// never below one block.
    pub fn from_duration(duration_secs: f64, config: &EngineConfig) -> Result<Self> {
        if !duration_secs.is_finite() || duration_secs < 0.0 {
            return Err(RollingSinkError::RequestValidation(format!(
                "duration must be a finite, non-negative number of seconds, got {duration_secs}"
            )));
        }
        let effective_secs = duration_secs.clamp(config.min_duration_secs, config.max_duration_secs);
        if effective_secs != duration_secs {
            warn!(
                requested = duration_secs,
                clamped = effective_secs,
                "duration outside [{}, {}]s, clamping",
                config.min_duration_secs,
                config.max_duration_secs
            );
        }

        let fpb = config.frames_per_block;
        let stride = config.vae_temporal_stride;
        let raw = (effective_secs * config.fps as f64 + (stride as f64 - 1.0)) / stride as f64 + fpb as f64;
        let blocks = raw / fpb as f64;
        let blocks = match config.block_rounding {
            BlockRounding::Floor => blocks.floor(),
            BlockRounding::Round => blocks.round(),
            BlockRounding::Ceil => blocks.ceil(),
        }
        .max(1.0);

        let too_long = || {
            RollingSinkError::RequestValidation(format!(
                "duration {effective_secs}s needs more frames than can be addressed"
            ))
        };
        if blocks >= usize::MAX as f64 {
            return Err(too_long());
        }
        let num_blocks = blocks as usize;
        let latent_frames = num_blocks.checked_mul(fpb).ok_or_else(too_long)?;
        let pixel_frames = latent_frames
            .checked_mul(stride)
            .map(|frames| frames.saturating_sub(stride.saturating_sub(1)))
            .ok_or_else(too_long)?;
        Ok(Self {
            requested_secs: duration_secs,
            effective_secs,
            num_blocks,
            latent_frames,
            pixel_frames,
        })
    }

    pub fn was_clamped(&self) -> bool {
        self.requested_secs != self.effective_secs
    }

    /// Playback length of the decoded video.
    pub fn output_secs(&self, fps: usize) -> f64 {
        self.pixel_frames as f64 / fps as f64
    }

    /// Rough peak memory: the cache plus one in-flight block (and its re-noised copy)
    /// at the request precision, plus the decoded RGB frames as f32. Saturates at
    /// `u64::MAX`.
    pub fn estimated_peak_bytes(&self, config: &EngineConfig) -> u64 {
        let product = |factors: &[usize]| {
            factors
                .iter()
                .fold(1u64, |acc, &f| acc.saturating_mul(f as u64))
        };
        let latent_block = product(&[
            config.frames_per_block,
            config.latent_channels,
            config.latent_height,
            config.latent_width,
            config.precision.bytes_per_element(),
        ]);
        let resident_blocks = config.cache_capacity().min(self.num_blocks).saturating_add(2);
        let frame = product(&[
            config.latent_height,
            config.latent_width,
            config.vae_spatial_scale,
            config.vae_spatial_scale,
            3,
            4,
        ]);
        (resident_blocks as u64)
            .saturating_mul(latent_block)
            .saturating_add((self.pixel_frames as u64).saturating_mul(frame))
    }

    /// Fails with `ResourceExhaustion` when the plan exceeds the configured budget.
    pub fn check_budget(&self, config: &EngineConfig) -> Result<()> {
        let Some(budget) = config.memory_budget_bytes else {
            return Ok(());
        };
        let required = self.estimated_peak_bytes(config);
        if required <= budget {
            return Ok(());
        }

        Err(RollingSinkError::ResourceExhaustion {
            required_bytes: required,
            budget_bytes: budget,
            suggested_max_secs: Self::longest_fitting_secs(config, budget),
        })
    }

    /// Largest whole-second duration in range whose plan fits `budget`, or 0.
    ///
    /// Peak memory never decreases with duration, so the range is bisected.
    fn longest_fitting_secs(config: &EngineConfig, budget: u64) -> f64 {
        let fits = |secs: f64| {
            BlockPlan::from_duration(secs, config)
                .map(|plan| plan.estimated_peak_bytes(config) <= budget)
                .unwrap_or(false)
        };
        // Float to int casts saturate; the range is at most one day once validated.
        let (mut lo, mut hi) = (
            config.min_duration_secs.ceil() as u64,
            config.max_duration_secs.floor() as u64,
        );
        if lo > hi || !fits(lo as f64) {
            return 0.0;
        }
        // `lo` always fits; nothing above `hi` does.
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            if fits(mid as f64) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_matches_pixel_frames() {
        let config = EngineConfig::default();
        let plan = BlockPlan::from_duration(15.0, &config).unwrap();
        assert_eq!(plan.pixel_frames, 249);
        assert_eq!(plan.output_secs(config.fps) as usize, 15);
    }
}

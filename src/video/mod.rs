//! Host-side video frames and the container written for a finished request.

use burn_core as burn;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{Result, RollingSinkError};

/// Characters of the prompt kept in an output file name.
const MAX_STEM_CHARS: usize = 100;

/// RGB8 frames, row-major `[frames, height, width, 3]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrames {
    pub width: usize,
    pub height: usize,
    pub fps: usize,
    pub num_frames: usize,
    pub data: Vec<u8>,
}

impl VideoFrames {
    /// Converts decoded pixels `[1, frames, 3, height, width]` in `[-1, 1]` to RGB8.
    pub fn from_pixels<B: Backend>(pixels: Tensor<B, 5>, fps: usize) -> Result<Self> {
        let [batch, frames, channels, height, width] = pixels.dims();
        if batch != 1 || channels != 3 {
            return Err(RollingSinkError::computation(
                "frame assembly",
                format!("expected [1, frames, 3, h, w] pixels, got {:?}", pixels.dims()),
            ));
        }
        let values = pixels.into_data().convert::<f32>().to_vec::<f32>()?;
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(RollingSinkError::computation(
                "frame assembly",
                format!("decoder produced a non-finite value at element {pos}"),
            ));
        }

        let plane = height * width;
        let mut data = vec![0u8; frames * plane * 3];
        for f in 0..frames {
            for c in 0..3 {
                let src = &values[(f * 3 + c) * plane..(f * 3 + c + 1) * plane];
                for (p, &v) in src.iter().enumerate() {
                    data[(f * plane + p) * 3 + c] = to_u8(v);
                }
            }
        }
        Ok(Self {
            width,
            height,
            fps,
            num_frames: frames,
            data,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.width * self.height * 3
    }

    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        let len = self.frame_len();
        self.data.get(index * len..(index + 1) * len)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.fps == 0 {
            return 0.0;
        }
        self.num_frames as f64 / self.fps as f64
    }

    /// Writes a YUV4MPEG2 stream (4:4:4, BT.601 studio range).
    pub fn write_y4m<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(
            out,
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444",
            self.width, self.height, self.fps
        )?;
        let plane = self.width * self.height;
        let mut yuv = vec![0u8; plane * 3];
        for i in 0..self.num_frames {
            let Some(frame) = self.frame(i) else { break };
            for (p, rgb) in frame.chunks_exact(3).enumerate() {
                let (y, u, v) = rgb_to_yuv(rgb[0], rgb[1], rgb[2]);
                yuv[p] = y;
                yuv[plane + p] = u;
                yuv[2 * plane + p] = v;
            }
            out.write_all(b"FRAME\n")?;
            out.write_all(&yuv)?;
        }
        out.flush()
    }

    /// Creates `path` (and its parent directories) and writes the video to it.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.write_y4m(BufWriter::new(file))?;
        Ok(())
    }
}

fn to_u8(v: f32) -> u8 {
    ((v * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 16.0 + 0.257 * r + 0.504 * g + 0.098 * b;
    let u = 128.0 - 0.148 * r - 0.291 * g + 0.439 * b;
    let v = 128.0 + 0.439 * r - 0.368 * g - 0.071 * b;
    let q = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    (q(y), q(u), q(v))
}

/// `<dir>/<prompt stem>-<secs>.<micros>.y4m`.
///
/// The stem is the first 100 characters of the prompt with whitespace and path
/// separators replaced by `_`. The timestamp is the only collision guard.
pub fn output_path(dir: &Path, prompt: &str, timestamp: SystemTime) -> PathBuf {
    let mut stem: String = prompt
        .chars()
        .take(MAX_STEM_CHARS)
        .map(|c| match c {
            c if c.is_whitespace() => '_',
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    if stem.is_empty() {
        stem.push_str("video");
    }
    let since = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    dir.join(format!("{stem}-{}.{:06}.y4m", since.as_secs(), since.subsec_micros()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_mapping_clamps() {
        assert_eq!(to_u8(-1.0), 0);
        assert_eq!(to_u8(1.0), 255);
        assert_eq!(to_u8(3.0), 255);
        assert_eq!(to_u8(0.0), 128);
    }

    #[test]
    fn grey_maps_to_neutral_chroma() {
        let (_, u, v) = rgb_to_yuv(128, 128, 128);
        assert_eq!((u, v), (128, 128));
        assert_eq!(rgb_to_yuv(0, 0, 0).0, 16);
        assert_eq!(rgb_to_yuv(255, 255, 255).0, 235);
    }
}

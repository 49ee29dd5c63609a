use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use burn_core as burn;

use burn::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use burn_rolling_sink::video::{output_path, VideoFrames};
use burn_rolling_sink::RollingSinkError;
use burn_tensor::backend::Backend;

type TB = NdArray<f32>;

fn device() -> <TB as Backend>::Device {
    Default::default()
}

#[test]
fn output_path_uses_prompt_stem_and_timestamp() {
    let ts = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_000);
    let path = output_path(Path::new("videos"), "a cat/dog on the moon", ts);
    assert_eq!(
        path,
        Path::new("videos").join("a_cat_dog_on_the_moon-1700000000.123456.y4m")
    );
}

#[test]
fn output_path_truncates_long_prompts() {
    let prompt = "x".repeat(300);
    let path = output_path(Path::new("out"), &prompt, UNIX_EPOCH);
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(name, format!("{}-0.000000.y4m", "x".repeat(100)));
}

#[test]
fn pixels_become_interleaved_rgb8() {
    // Two 1x2 frames: channel planes per frame.
    let values = vec![
        -1.0f32, 1.0, // r
        0.0, 0.0, // g
        1.0, -1.0, // b
        1.0, 1.0, // r
        1.0, 1.0, // g
        1.0, 1.0, // b
    ];
    let pixels = Tensor::<TB, 5>::from_data(TensorData::new(values, [1, 2, 3, 1, 2]), &device());
    let video = VideoFrames::from_pixels(pixels, 16).unwrap();
    assert_eq!(video.num_frames, 2);
    assert_eq!((video.width, video.height), (2, 1));
    assert_eq!(video.frame(0).unwrap(), &[0, 128, 255, 255, 128, 0]);
    assert_eq!(video.frame(1).unwrap(), &[255; 6]);
    assert!(video.frame(2).is_none());
    assert_eq!(video.duration_secs(), 0.125);
}

#[test]
fn non_finite_pixels_are_rejected() {
    let pixels = Tensor::<TB, 5>::zeros([1, 1, 3, 2, 2], &device()).add_scalar(f32::NAN);
    assert!(matches!(
        VideoFrames::from_pixels(pixels, 16),
        Err(RollingSinkError::Computation { .. })
    ));
}

#[test]
fn y4m_stream_has_header_and_full_frames() {
    let pixels = Tensor::<TB, 5>::zeros([1, 3, 3, 2, 4], &device());
    let video = VideoFrames::from_pixels(pixels, 16).unwrap();
    let mut buf = Vec::new();
    video.write_y4m(&mut buf).unwrap();

    let header = b"YUV4MPEG2 W4 H2 F16:1 Ip A1:1 C444\n";
    assert!(buf.starts_with(header));
    let frame_bytes = b"FRAME\n".len() + 4 * 2 * 3;
    assert_eq!(buf.len(), header.len() + 3 * frame_bytes);
}

#[test]
fn save_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let pixels = Tensor::<TB, 5>::zeros([1, 1, 3, 2, 2], &device());
    let video = VideoFrames::from_pixels(pixels, 8).unwrap();
    let path = output_path(&dir.path().join("nested"), "hello world", UNIX_EPOCH);
    video.save(&path).unwrap();
    assert!(path.is_file());
}

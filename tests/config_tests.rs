use burn_core::config::Config;
use burn_rolling_sink::config::{AdmissionPolicy, BlockRounding, Precision};
use burn_rolling_sink::decoder::CausalFrameDecoderConfig;
use burn_rolling_sink::model::BlockCausalTransformerConfig;
use burn_rolling_sink::reference::ReferenceModelConfig;
use burn_rolling_sink::EngineConfig;

#[test]
fn engine_config_survives_a_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    let config = EngineConfig::new()
        .with_sink_size(2)
        .with_window_size(9)
        .with_precision(Precision::F16)
        .with_block_rounding(BlockRounding::Ceil)
        .with_admission(AdmissionPolicy::Reject)
        .with_memory_budget_bytes(Some(1 << 30));
    config.save(&path).unwrap();

    let loaded = EngineConfig::load(&path).unwrap();
    assert_eq!(loaded.sink_size, 2);
    assert_eq!(loaded.window_size, 9);
    assert_eq!(loaded.precision, Precision::F16);
    assert_eq!(loaded.block_rounding, BlockRounding::Ceil);
    assert_eq!(loaded.admission, AdmissionPolicy::Reject);
    assert_eq!(loaded.memory_budget_bytes, Some(1 << 30));
    loaded.validate().unwrap();
}

#[test]
fn model_configs_fill_defaults_from_partial_json() {
    let reference: ReferenceModelConfig = serde_json::from_str(r#"{"d_model": 32}"#).unwrap();
    assert_eq!(reference.d_model, 32);
    assert_eq!(reference.n_heads, 4);

    let transformer: BlockCausalTransformerConfig =
        serde_json::from_str(r#"{"latent_channels": 4, "text_dim": 8}"#).unwrap();
    assert_eq!(transformer.patch_size, 2);

    let decoder: CausalFrameDecoderConfig = serde_json::from_str(r#"{"latent_channels": 16}"#).unwrap();
    assert_eq!((decoder.temporal_stride, decoder.spatial_scale), (4, 8));
}

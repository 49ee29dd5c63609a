//! Read-only parameter stores: identifier in, `name -> tensor` map out.

use burn_core as burn;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::TensorData;
use half::{bf16, f16};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::info;

use crate::error::{Result, RollingSinkError};

/// Parameter name to host tensor (always f32).
pub type WeightMap = HashMap<String, TensorData>;

pub trait WeightStore {
    fn load(&self, identifier: &str) -> Result<WeightMap>;
}

/// Loads `<root>/<identifier>` or `<root>/<identifier>.safetensors`.
#[derive(Debug, Clone)]
pub struct SafetensorsWeightStore {
    root: PathBuf,
}

impl SafetensorsWeightStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        let direct = self.root.join(identifier);
        if direct.is_file() {
            return Ok(direct);
        }
        let with_ext = self.root.join(format!("{identifier}.safetensors"));
        if with_ext.is_file() {
            return Ok(with_ext);
        }
        Err(RollingSinkError::Configuration(format!(
            "no weights named '{identifier}' under {}",
            self.root.display()
        )))
    }
}

impl WeightStore for SafetensorsWeightStore {
    fn load(&self, identifier: &str) -> Result<WeightMap> {
        let path = self.resolve(identifier)?;
        let bytes = fs::read(&path)?;
        let weights = decode_safetensors(&bytes)?;
        info!(path = %path.display(), tensors = weights.len(), "loaded weights");
        Ok(weights)
    }
}

/// Decodes a safetensors buffer, widening F16/BF16 to f32.
pub fn decode_safetensors(bytes: &[u8]) -> Result<WeightMap> {
    let st = SafeTensors::deserialize(bytes).map_err(|e| RollingSinkError::Configuration(e.to_string()))?;
    let mut out = WeightMap::new();
    for (name, view) in st.tensors() {
        let values = to_f32(&name, &view)?;
        out.insert(name, TensorData::new(values, view.shape().to_vec()));
    }
    Ok(out)
}

fn to_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let bytes = view.data();
    let values = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        other => {
            return Err(RollingSinkError::Configuration(format!(
                "tensor '{name}' has unsupported dtype {other:?}"
            )))
        }
    };
    Ok(values)
}

/// Serializes a weight map as F32 safetensors.
pub fn encode_safetensors(weights: &WeightMap) -> Result<Vec<u8>> {
    let mut buffers = Vec::with_capacity(weights.len());
    for (name, data) in weights {
        let values = data.clone().convert::<f32>().to_vec::<f32>()?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffers.push((name.clone(), data.shape.clone(), bytes));
    }
    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| RollingSinkError::Configuration(e.to_string()))?;
        views.push((name.clone(), view));
    }
    safetensors::serialize(views, &None).map_err(|e| RollingSinkError::Configuration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_tensors_widen_to_f32() {
        let raw: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::BF16, vec![2], &raw).unwrap();
        let bytes = safetensors::serialize(vec![("w", view)], &None).unwrap();
        let map = decode_safetensors(&bytes).unwrap();
        assert_eq!(map["w"].to_vec::<f32>().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn integer_tensors_are_rejected() {
        let raw = [0u8; 8];
        let view = TensorView::new(Dtype::I64, vec![1], &raw).unwrap();
        let bytes = safetensors::serialize(vec![("ids", view)], &None).unwrap();
        assert!(matches!(
            decode_safetensors(&bytes),
            Err(RollingSinkError::Configuration(_))
        ));
    }
}

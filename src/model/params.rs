use burn_core as burn;

use burn::module::Param;
use burn::nn::{Linear, RmsNorm};
use burn::tensor::{backend::Backend, Tensor};

use crate::error::{Result, RollingSinkError};
use crate::loader::WeightMap;

fn fetch<B: Backend, const D: usize>(
    weights: &WeightMap,
    name: &str,
    expected: [usize; D],
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let data = weights
        .get(name)
        .ok_or_else(|| RollingSinkError::Configuration(format!("missing parameter '{name}'")))?;
    if data.shape != expected {
        return Err(RollingSinkError::Configuration(format!(
            "parameter '{name}' has shape {:?}, expected {expected:?}",
            data.shape
        )));
    }
    Ok(Tensor::from_data(data.clone().convert::<f32>(), device))
}

/// Loads `<prefix>.weight` (`[d_in, d_out]`) and, when the layer has one, `<prefix>.bias`.
pub fn load_linear<B: Backend>(linear: &mut Linear<B>, weights: &WeightMap, prefix: &str) -> Result<()> {
    let device = linear.weight.device();
    let dims = linear.weight.dims();
    linear.weight = Param::from_tensor(fetch(weights, &format!("{prefix}.weight"), dims, &device)?);
    if let Some(bias) = linear.bias.as_ref() {
        let bias_dims = bias.dims();
        let loaded = fetch(weights, &format!("{prefix}.bias"), bias_dims, &device)?;
        linear.bias = Some(Param::from_tensor(loaded));
    }
    Ok(())
}

pub fn load_rms_norm<B: Backend>(norm: &mut RmsNorm<B>, weights: &WeightMap, prefix: &str) -> Result<()> {
    let device = norm.gamma.device();
    let dims = norm.gamma.dims();
    norm.gamma = Param::from_tensor(fetch(weights, &format!("{prefix}.gamma"), dims, &device)?);
    Ok(())
}

pub fn export_linear<B: Backend>(linear: &Linear<B>, prefix: &str, out: &mut WeightMap) {
    out.insert(format!("{prefix}.weight"), linear.weight.val().into_data());
    if let Some(bias) = linear.bias.as_ref() {
        out.insert(format!("{prefix}.bias"), bias.val().into_data());
    }
}

pub fn export_rms_norm<B: Backend>(norm: &RmsNorm<B>, prefix: &str, out: &mut WeightMap) {
    out.insert(format!("{prefix}.gamma"), norm.gamma.val().into_data());
}

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use half::{bf16, f16};

use crate::config::Precision;
use crate::error::{Result, RollingSinkError};

impl Precision {
    pub fn bytes_per_element(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 | Precision::Bf16 => 2,
        }
    }

    pub fn round(self, value: f32) -> f32 {
        match self {
            Precision::F32 => value,
            Precision::F16 => f16::from_f32(value).to_f32(),
            Precision::Bf16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// Rounds every value through this format and fails on the first non-finite one.
    ///
    /// Values that overflow the reduced format become infinite and fail here; there is
    /// no fallback to a wider format within a request.
    pub fn quantize_checked<B: Backend, const D: usize>(
        self,
        tensor: Tensor<B, D>,
        stage: &str,
    ) -> Result<Tensor<B, D>> {
        let device = tensor.device();
        let dims = tensor.dims();
        let mut values = tensor.into_data().convert::<f32>().to_vec::<f32>()?;
        for (i, v) in values.iter_mut().enumerate() {
            let rounded = self.round(*v);
            if !rounded.is_finite() {
                return Err(RollingSinkError::computation(
                    stage,
                    format!("non-finite value {rounded} at element {i} ({self:?})"),
                ));
            }
            *v = rounded;
        }
        Ok(Tensor::from_data(TensorData::new(values, dims.to_vec()), &device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_formats_overflow_to_infinity() {
        assert!(Precision::F16.round(1.0e6).is_infinite());
        assert!(Precision::Bf16.round(1.0e6).is_finite());
        assert_eq!(Precision::F32.round(0.1), 0.1);
        assert_ne!(Precision::Bf16.round(0.1), 0.1);
    }
}

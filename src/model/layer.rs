use burn_core as burn;

use burn::module::Module;
use burn::nn::{Linear, LinearConfig, RmsNorm, RmsNormConfig};
use burn::tensor::activation::{gelu, softmax};
use burn::tensor::{backend::Backend, Tensor};

use crate::error::Result;
use crate::loader::WeightMap;

use super::params::{export_linear, export_rms_norm, load_linear, load_rms_norm};

/// Un-positioned keys and values of one block for one layer, `[batch, heads, tokens, d_k]`.
#[derive(Debug, Clone)]
pub struct LayerKv<B: Backend> {
    pub k: Tensor<B, 4>,
    pub v: Tensor<B, 4>,
}

/// Pre-norm transformer layer: block-causal self-attention, text cross-attention, MLP.
#[derive(Module, Debug)]
pub struct ContextLayer<B: Backend> {
    norm_attn: RmsNorm<B>,
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    output: Linear<B>,
    norm_cross: RmsNorm<B>,
    cross_query: Linear<B>,
    cross_key: Linear<B>,
    cross_value: Linear<B>,
    cross_output: Linear<B>,
    norm_ffn: RmsNorm<B>,
    ffn_in: Linear<B>,
    ffn_out: Linear<B>,
    n_heads: usize,
}

impl<B: Backend> ContextLayer<B> {
    pub fn new(d_model: usize, n_heads: usize, d_ffn: usize, eps: f64, device: &B::Device) -> Self {
        let linear = |d_in, d_out| LinearConfig::new(d_in, d_out).init(device);
        let norm = || RmsNormConfig::new(d_model).with_epsilon(eps).init(device);
        Self {
            norm_attn: norm(),
            query: linear(d_model, d_model),
            key: linear(d_model, d_model),
            value: linear(d_model, d_model),
            output: linear(d_model, d_model),
            norm_cross: norm(),
            cross_query: linear(d_model, d_model),
            cross_key: linear(d_model, d_model),
            cross_value: linear(d_model, d_model),
            cross_output: linear(d_model, d_model),
            norm_ffn: norm(),
            ffn_in: linear(d_model, d_ffn),
            ffn_out: linear(d_ffn, d_model),
            n_heads,
        }
    }

    /// Runs the layer on the tokens of the current block.
    ///
    /// `pos` is the position embedding of the current tokens in head space
    /// (`[1, 1, tokens, d_k]`); `context` holds the already positioned K/V of earlier
    /// blocks. Returns the new hidden state and this block's un-positioned K/V.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        text: Tensor<B, 3>,
        pos: Tensor<B, 4>,
        context: Vec<(Tensor<B, 4>, Tensor<B, 4>)>,
    ) -> (Tensor<B, 3>, LayerKv<B>) {
        let h = self.norm_attn.forward(x.clone());
        let q = self.split_heads(self.query.forward(h.clone())) + pos.clone();
        let k = self.split_heads(self.key.forward(h.clone()));
        let v = self.split_heads(self.value.forward(h));

        let (mut keys, mut values): (Vec<_>, Vec<_>) = context.into_iter().unzip();
        keys.push(k.clone() + pos);
        values.push(v.clone());
        let attn = attend(q, Tensor::cat(keys, 2), Tensor::cat(values, 2));
        let x = x + self.output.forward(merge_heads(attn));

        let h = self.norm_cross.forward(x.clone());
        let q = self.split_heads(self.cross_query.forward(h));
        let tk = self.split_heads(self.cross_key.forward(text.clone()));
        let tv = self.split_heads(self.cross_value.forward(text));
        let x = x + self.cross_output.forward(merge_heads(attend(q, tk, tv)));

        let h = self.norm_ffn.forward(x.clone());
        let x = x + self.ffn_out.forward(gelu(self.ffn_in.forward(h)));

        (x, LayerKv { k, v })
    }

    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [b, t, d] = x.dims();
        x.reshape([b, t, self.n_heads, d / self.n_heads]).swap_dims(1, 2)
    }

    fn linears(&self) -> [(&'static str, &Linear<B>); 10] {
        [
            ("query", &self.query),
            ("key", &self.key),
            ("value", &self.value),
            ("output", &self.output),
            ("cross_query", &self.cross_query),
            ("cross_key", &self.cross_key),
            ("cross_value", &self.cross_value),
            ("cross_output", &self.cross_output),
            ("ffn_in", &self.ffn_in),
            ("ffn_out", &self.ffn_out),
        ]
    }

    fn norms(&self) -> [(&'static str, &RmsNorm<B>); 3] {
        [
            ("norm_attn", &self.norm_attn),
            ("norm_cross", &self.norm_cross),
            ("norm_ffn", &self.norm_ffn),
        ]
    }

    pub fn load_weights(&mut self, weights: &WeightMap, prefix: &str) -> Result<()> {
        for (name, linear) in [
            ("query", &mut self.query),
            ("key", &mut self.key),
            ("value", &mut self.value),
            ("output", &mut self.output),
            ("cross_query", &mut self.cross_query),
            ("cross_key", &mut self.cross_key),
            ("cross_value", &mut self.cross_value),
            ("cross_output", &mut self.cross_output),
            ("ffn_in", &mut self.ffn_in),
            ("ffn_out", &mut self.ffn_out),
        ] {
            load_linear(linear, weights, &format!("{prefix}.{name}"))?;
        }
        for (name, norm) in [
            ("norm_attn", &mut self.norm_attn),
            ("norm_cross", &mut self.norm_cross),
            ("norm_ffn", &mut self.norm_ffn),
        ] {
            load_rms_norm(norm, weights, &format!("{prefix}.{name}"))?;
        }
        Ok(())
    }

    pub fn export_weights(&self, prefix: &str, out: &mut WeightMap) {
        for (name, linear) in self.linears() {
            export_linear(linear, &format!("{prefix}.{name}"), out);
        }
        for (name, norm) in self.norms() {
            export_rms_norm(norm, &format!("{prefix}.{name}"), out);
        }
    }
}

/// softmax(Q K^T / sqrt(d_k)) V over the last two dims.
fn attend<B: Backend>(q: Tensor<B, 4>, k: Tensor<B, 4>, v: Tensor<B, 4>) -> Tensor<B, 4> {
    let d_k = q.dims()[3];
    let scores = q.matmul(k.transpose()).div_scalar((d_k as f32).sqrt());
    softmax(scores, 3).matmul(v)
}

fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [b, h, t, d] = x.dims();
    x.swap_dims(1, 2).reshape([b, t, h * d])
}

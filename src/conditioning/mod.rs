use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Result, RollingSinkError};
use crate::noise::normal_values;

/// Text conditioning computed once per request and shared by every block and step.
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    embedding: Tensor<B, 3>,
}

impl<B: Backend> Conditioning<B> {
    /// Wraps an embedding of shape `[batch, tokens, dim]`.
    pub fn new(embedding: Tensor<B, 3>) -> Self {
        Self { embedding }
    }

    pub fn embedding(&self) -> &Tensor<B, 3> {
        &self.embedding
    }

    pub fn dim(&self) -> usize {
        self.embedding.dims()[2]
    }
}

/// Prompt encoder. Pure: the same text always yields the same embedding.
pub trait ConditioningEncoder<B: Backend> {
    fn encode(&self, prompt: &str, device: &B::Device) -> Result<Conditioning<B>>;
}

/// Deterministic bag-of-words encoder: each token maps to a normal vector seeded by
/// its hash.
#[derive(Debug, Clone)]
pub struct HashingTextEncoder {
    dim: usize,
    max_tokens: usize,
}

impl HashingTextEncoder {
    pub fn new(dim: usize, max_tokens: usize) -> Self {
        Self {
            dim,
            max_tokens: max_tokens.max(1),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn tokens(&self, prompt: &str) -> Vec<String> {
        prompt
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .take(self.max_tokens)
            .map(|t| t.to_lowercase())
            .collect()
    }
}

impl<B: Backend> ConditioningEncoder<B> for HashingTextEncoder {
    fn encode(&self, prompt: &str, device: &B::Device) -> Result<Conditioning<B>> {
        let tokens = self.tokens(prompt);
        if tokens.is_empty() {
            return Err(RollingSinkError::RequestValidation(
                "prompt contains no encodable text".into(),
            ));
        }
        let mut values = Vec::with_capacity(tokens.len() * self.dim);
        for token in &tokens {
            let mut rng = StdRng::seed_from_u64(fnv1a(token.as_bytes()));
            values.extend(normal_values(&mut rng, self.dim));
        }
        let data = TensorData::new(values, vec![1, tokens.len(), self.dim]);
        Ok(Conditioning::new(Tensor::from_data(data, device)))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

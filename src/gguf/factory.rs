//! Synthesizes valid GGUF containers in memory
//!
//! Test fixtures for loader and builder code that needs properly formatted
//! binary data without multi-gigabyte model files on disk. [`GgufBuilder`]
//! assembles arbitrary containers; [`phi2_fixture`] produces a complete
//! miniature Phi-2 model with every tensor the loader binds.

use half::f16;

use crate::gguf::types::{GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V3};

/// Builder for valid GGUF v3 containers
#[derive(Default)]
pub struct GgufBuilder {
    metadata: Vec<(String, u32, Vec<u8>)>,
    tensors: Vec<(String, Vec<u64>, u32, Vec<u8>)>,
}

impl GgufBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string metadata value
    #[must_use]
    pub fn add_str(mut self, key: &str, value: &str) -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(value.len() as u64).to_le_bytes());
        bytes.extend_from_slice(value.as_bytes());
        self.metadata.push((key.to_string(), 8, bytes));
        self
    }

    /// Add a u32 metadata value
    #[must_use]
    pub fn add_u32(mut self, key: &str, value: u32) -> Self {
        self.metadata
            .push((key.to_string(), 4, value.to_le_bytes().to_vec()));
        self
    }

    /// Add an f32 metadata value
    #[must_use]
    pub fn add_f32(mut self, key: &str, value: f32) -> Self {
        self.metadata
            .push((key.to_string(), 6, value.to_le_bytes().to_vec()));
        self
    }

    /// Add an F32 tensor; `dims` innermost-first
    #[must_use]
    pub fn add_f32_tensor(mut self, name: &str, dims: &[u64], data: &[f32]) -> Self {
        let bytes: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();
        self.tensors.push((name.to_string(), dims.to_vec(), 0, bytes));
        self
    }

    /// Add an F16 tensor; `dims` innermost-first
    #[must_use]
    pub fn add_f16_tensor(mut self, name: &str, dims: &[u64], data: &[f32]) -> Self {
        let bytes: Vec<u8> = data
            .iter()
            .flat_map(|f| f16::from_f32(*f).to_le_bytes())
            .collect();
        self.tensors.push((name.to_string(), dims.to_vec(), 1, bytes));
        self
    }

    /// Add a tensor with an explicit type code and raw payload
    #[must_use]
    pub fn add_raw_tensor(mut self, name: &str, dims: &[u64], type_code: u32, data: &[u8]) -> Self {
        self.tensors
            .push((name.to_string(), dims.to_vec(), type_code, data.to_vec()));
        self
    }

    /// Serialize the container
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut data = Vec::new();

        data.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        data.extend_from_slice(&GGUF_VERSION_V3.to_le_bytes());
        data.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        data.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, type_code, value_bytes) in &self.metadata {
            data.extend_from_slice(&(key.len() as u64).to_le_bytes());
            data.extend_from_slice(key.as_bytes());
            data.extend_from_slice(&type_code.to_le_bytes());
            data.extend_from_slice(value_bytes);
        }

        // Each payload offset is aligned within the data section.
        let mut offset = 0u64;
        for (name, dims, type_code, tensor_bytes) in &self.tensors {
            data.extend_from_slice(&(name.len() as u64).to_le_bytes());
            data.extend_from_slice(name.as_bytes());
            data.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for dim in dims {
                data.extend_from_slice(&dim.to_le_bytes());
            }
            data.extend_from_slice(&type_code.to_le_bytes());
            data.extend_from_slice(&offset.to_le_bytes());
            offset += pad(tensor_bytes.len()) as u64;
        }

        let aligned = pad(data.len());
        data.resize(aligned, 0);

        for (_, _, _, tensor_bytes) in &self.tensors {
            data.extend_from_slice(tensor_bytes);
            let aligned = pad(data.len());
            data.resize(aligned, 0);
        }

        data
    }
}

fn pad(len: usize) -> usize {
    len.div_ceil(GGUF_DEFAULT_ALIGNMENT) * GGUF_DEFAULT_ALIGNMENT
}

/// Shape of a miniature Phi-2 fixture model
#[derive(Debug, Clone, Copy)]
pub struct Phi2Fixture {
    /// Vocabulary size
    pub n_vocab: u64,
    /// Embedding width
    pub n_embd: u64,
    /// Feed-forward width
    pub n_ff: u64,
    /// Layer count
    pub n_layer: u64,
    /// Attention heads
    pub n_head: u64,
    /// KV heads
    pub n_head_kv: u64,
    /// Trained context length
    pub n_ctx_train: u64,
    /// Rotary dimension count
    pub n_rot: u64,
}

impl Default for Phi2Fixture {
    fn default() -> Self {
        Self {
            n_vocab: 100,
            n_embd: 64,
            n_ff: 256,
            n_layer: 2,
            n_head: 4,
            n_head_kv: 4,
            n_ctx_train: 256,
            n_rot: 16,
        }
    }
}

/// Build a complete miniature Phi-2 container: fused QKV, biases everywhere,
/// GELU FFN without a gate, F16 weights
#[must_use]
pub fn phi2_fixture(fx: Phi2Fixture) -> Vec<u8> {
    let n_embd_head = fx.n_embd / fx.n_head;
    let n_embd_gqa = n_embd_head * fx.n_head_kv;
    let qkv_dim = fx.n_embd + 2 * n_embd_gqa;

    let zeros = |n: u64| vec![0.0f32; n as usize];
    let ones = |n: u64| vec![1.0f32; n as usize];

    let mut b = GgufBuilder::new()
        .add_str("general.architecture", "phi2")
        .add_str("general.name", "phi2-fixture")
        .add_u32("phi2.context_length", fx.n_ctx_train as u32)
        .add_u32("phi2.embedding_length", fx.n_embd as u32)
        .add_u32("phi2.block_count", fx.n_layer as u32)
        .add_u32("phi2.feed_forward_length", fx.n_ff as u32)
        .add_u32("phi2.rope.dimension_count", fx.n_rot as u32)
        .add_u32("phi2.attention.head_count", fx.n_head as u32)
        .add_u32("phi2.attention.head_count_kv", fx.n_head_kv as u32)
        .add_f32("phi2.attention.layer_norm_epsilon", 1e-5)
        .add_f32("phi2.rope.freq_base", 10_000.0)
        .add_f16_tensor(
            "token_embd.weight",
            &[fx.n_embd, fx.n_vocab],
            &zeros(fx.n_embd * fx.n_vocab),
        )
        .add_f32_tensor("output_norm.weight", &[fx.n_embd], &ones(fx.n_embd))
        .add_f32_tensor("output_norm.bias", &[fx.n_embd], &zeros(fx.n_embd))
        .add_f16_tensor(
            "output.weight",
            &[fx.n_embd, fx.n_vocab],
            &zeros(fx.n_embd * fx.n_vocab),
        )
        .add_f32_tensor("output.bias", &[fx.n_vocab], &zeros(fx.n_vocab));

    for il in 0..fx.n_layer {
        let t = |suffix: &str| format!("blk.{il}.{suffix}");
        b = b
            .add_f32_tensor(&t("attn_norm.weight"), &[fx.n_embd], &ones(fx.n_embd))
            .add_f32_tensor(&t("attn_norm.bias"), &[fx.n_embd], &zeros(fx.n_embd))
            .add_f16_tensor(
                &t("attn_qkv.weight"),
                &[fx.n_embd, qkv_dim],
                &zeros(fx.n_embd * qkv_dim),
            )
            .add_f32_tensor(&t("attn_qkv.bias"), &[qkv_dim], &zeros(qkv_dim))
            .add_f16_tensor(
                &t("attn_output.weight"),
                &[fx.n_embd, fx.n_embd],
                &zeros(fx.n_embd * fx.n_embd),
            )
            .add_f32_tensor(&t("attn_output.bias"), &[fx.n_embd], &zeros(fx.n_embd))
            .add_f16_tensor(
                &t("ffn_up.weight"),
                &[fx.n_embd, fx.n_ff],
                &zeros(fx.n_embd * fx.n_ff),
            )
            .add_f32_tensor(&t("ffn_up.bias"), &[fx.n_ff], &zeros(fx.n_ff))
            .add_f16_tensor(
                &t("ffn_down.weight"),
                &[fx.n_ff, fx.n_embd],
                &zeros(fx.n_ff * fx.n_embd),
            )
            .add_f32_tensor(&t("ffn_down.bias"), &[fx.n_embd], &zeros(fx.n_embd));
    }

    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::GgufFile;

    #[test]
    fn test_fixture_parses() {
        let data = phi2_fixture(Phi2Fixture::default());
        let file = GgufFile::from_bytes(&data).expect("fixture parses");
        assert_eq!(file.require_str("general.architecture").unwrap(), "phi2");
        assert_eq!(file.require_u32("phi2.block_count").unwrap(), 2);
        assert!(file.tensor("blk.1.ffn_down.bias").is_some());
    }

    #[test]
    fn test_fixture_tensor_offsets_aligned() {
        let data = phi2_fixture(Phi2Fixture::default());
        let file = GgufFile::from_bytes(&data).unwrap();
        for info in &file.tensors {
            assert_eq!(
                info.offset as usize % GGUF_DEFAULT_ALIGNMENT,
                0,
                "{} misaligned",
                info.name
            );
        }
    }

    #[test]
    fn test_builder_empty() {
        let data = GgufBuilder::new().build();
        assert!(data.len() >= 24);
        let file = GgufFile::from_bytes(&data).unwrap();
        assert_eq!(file.header.tensor_count, 0);
    }
}

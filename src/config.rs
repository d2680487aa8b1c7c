//! Model hyperparameters and per-session context parameters
//!
//! [`Hparams`] is static per model and read out of the container header.
//! [`ContextParams`] is chosen per inference session and controls context
//! length, rope scaling, and the attention path.

use serde::Serialize;

use crate::error::LoadError;
use crate::gguf::GgufFile;

/// Metadata key prefix for the Phi-2 architecture
pub const ARCH: &str = "phi2";

/// Rope mode code for NeoX-style interleaving, the Phi-2 variant
pub const ROPE_TYPE_NEOX: i32 = 2;

/// Static model hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hparams {
    /// Embedding width
    pub n_embd: u32,
    /// Feed-forward width
    pub n_ff: u32,
    /// Decoder layer count
    pub n_layer: u32,
    /// Rotary dimension count
    pub n_rot: u32,
    /// Context length the model was trained with
    pub n_ctx_train: u32,
    /// Attention heads
    pub n_head: u32,
    /// Key/value heads (`== n_head` for Phi-2, smaller under GQA)
    pub n_head_kv: u32,
    /// Per-head key width
    pub n_embd_head_k: u32,
    /// Per-head value width
    pub n_embd_head_v: u32,
    /// Layer-norm epsilon
    pub f_norm_eps: f32,
    /// RMS-norm epsilon (unused by Phi-2 but carried for the norm op)
    pub f_norm_rms_eps: f32,
    /// Rotary frequency base the model was trained with
    pub rope_freq_base_train: f32,
    /// Maximum ALiBi bias; zero disables ALiBi
    pub f_max_alibi_bias: f32,
}

impl Hparams {
    /// Read hyperparameters from a container header
    ///
    /// # Errors
    ///
    /// Returns `LoadError::UnsupportedArch` when `general.architecture` is
    /// not `"phi2"`, and `LoadError::Parse` when a required key is missing,
    /// mistyped, or inconsistent.
    pub fn from_gguf(file: &GgufFile) -> Result<Self, LoadError> {
        let arch = file.require_str("general.architecture")?;
        if arch != ARCH {
            return Err(LoadError::UnsupportedArch(arch.to_string()));
        }

        let key = |suffix: &str| format!("{ARCH}.{suffix}");

        let n_ctx_train = file.require_u32(&key("context_length"))?;
        let n_embd = file.require_u32(&key("embedding_length"))?;
        let n_layer = file.require_u32(&key("block_count"))?;
        let n_rot = file.require_u32(&key("rope.dimension_count"))?;
        let n_head = file.require_u32(&key("attention.head_count"))?;
        let n_head_kv = file.require_u32(&key("attention.head_count_kv"))?;

        if n_head == 0 || n_head_kv == 0 || n_head % n_head_kv != 0 {
            return Err(LoadError::Parse {
                reason: format!("head counts {n_head}/{n_head_kv} are not a valid grouping"),
            });
        }

        // Per-head widths default to n_embd / n_head; the container may
        // override them with explicit key/value lengths.
        let n_embd_head_k = file
            .get_u32(&key("attention.key_length"))
            .unwrap_or(n_embd / n_head);
        let n_embd_head_v = file
            .get_u32(&key("attention.value_length"))
            .unwrap_or(n_embd_head_k);

        if n_embd_head_k * n_head != n_embd {
            return Err(LoadError::Parse {
                reason: format!(
                    "embedding width {n_embd} is not head width {n_embd_head_k} times {n_head} heads"
                ),
            });
        }

        // The correct key is feed_forward_length; Phi-2 uses 4 * n_embd
        // when the container omits it.
        let n_ff = file
            .get_u32(&key("feed_forward_length"))
            .unwrap_or(4 * n_embd);

        let f_norm_eps = file
            .get_f32(&key("attention.layer_norm_epsilon"))
            .unwrap_or(1e-5);
        let f_norm_rms_eps = file
            .get_f32(&key("attention.layer_norm_rms_epsilon"))
            .unwrap_or(1e-5);
        let rope_freq_base_train = file.get_f32(&key("rope.freq_base")).unwrap_or(10_000.0);

        Ok(Self {
            n_embd,
            n_ff,
            n_layer,
            n_rot,
            n_ctx_train,
            n_head,
            n_head_kv,
            n_embd_head_k,
            n_embd_head_v,
            f_norm_eps,
            f_norm_rms_eps,
            rope_freq_base_train,
            f_max_alibi_bias: 0.0,
        })
    }

    /// Grouped key width: `n_embd_head_k * n_head_kv`
    #[must_use]
    pub fn n_embd_k_gqa(&self) -> u32 {
        self.n_embd_head_k * self.n_head_kv
    }

    /// Grouped value width: `n_embd_head_v * n_head_kv`
    #[must_use]
    pub fn n_embd_v_gqa(&self) -> u32 {
        self.n_embd_head_v * self.n_head_kv
    }

    /// Re-emit the required header keys exactly as the loader consumed them
    #[must_use]
    pub fn report(&self) -> Vec<(String, u32)> {
        let key = |suffix: &str| format!("{ARCH}.{suffix}");
        vec![
            (key("context_length"), self.n_ctx_train),
            (key("embedding_length"), self.n_embd),
            (key("block_count"), self.n_layer),
            (key("rope.dimension_count"), self.n_rot),
            (key("attention.head_count"), self.n_head),
            (key("attention.head_count_kv"), self.n_head_kv),
        ]
    }
}

/// Per-session inference parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextParams {
    /// Inference context length; the KV cache is allocated to this size
    pub n_ctx: u32,
    /// Maximum batch size
    pub n_batch: u32,
    /// Maximum micro-batch size
    pub n_ubatch: u32,
    /// Maximum distinct sequences
    pub n_seq_max: u32,
    /// Rotary frequency base; zero inherits the trained value
    pub rope_freq_base: f32,
    /// Rotary frequency scale; zero inherits 1.0
    pub rope_freq_scale: f32,
    /// Original context length for YaRN; zero inherits `n_ctx_train`
    pub n_ctx_orig_yarn: u32,
    /// YaRN extrapolation mix factor
    pub yarn_ext_factor: f32,
    /// YaRN attention magnitude factor
    pub yarn_attn_factor: f32,
    /// YaRN low correction dim
    pub yarn_beta_fast: f32,
    /// YaRN high correction dim
    pub yarn_beta_slow: f32,
    /// Cache fragmentation fraction above which defrag is requested
    pub defrag_thold: f32,
    /// Whether attention is causal
    pub causal_attn: bool,
    /// Whether to emit the fused flash-attention op
    pub flash_attn: bool,
    /// Whether the session extracts embeddings instead of logits
    pub embeddings: bool,
    /// Whether K/Q/V ops prefer accelerator placement
    pub offload_kqv: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_ubatch: 512,
            n_seq_max: 1,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            n_ctx_orig_yarn: 0,
            yarn_ext_factor: 0.0,
            yarn_attn_factor: 1.0,
            yarn_beta_fast: 32.0,
            yarn_beta_slow: 1.0,
            defrag_thold: -1.0,
            causal_attn: true,
            flash_attn: false,
            embeddings: false,
            offload_kqv: true,
        }
    }
}

/// Rope parameters after inheriting model defaults
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeConfig {
    /// Frequency base
    pub freq_base: f32,
    /// Frequency scale
    pub freq_scale: f32,
    /// Original trained context for YaRN correction
    pub n_ctx_orig: u32,
}

impl ContextParams {
    /// Resolve rope parameters against the model's trained values
    #[must_use]
    pub fn rope(&self, hparams: &Hparams) -> RopeConfig {
        RopeConfig {
            freq_base: if self.rope_freq_base > 0.0 {
                self.rope_freq_base
            } else {
                hparams.rope_freq_base_train
            },
            freq_scale: if self.rope_freq_scale > 0.0 {
                self.rope_freq_scale
            } else {
                1.0
            },
            n_ctx_orig: if self.n_ctx_orig_yarn > 0 {
                self.n_ctx_orig_yarn
            } else {
                hparams.n_ctx_train
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::factory::{phi2_fixture, Phi2Fixture};

    fn moondream_header() -> GgufFile {
        let data = crate::gguf::factory::GgufBuilder::new()
            .add_str("general.architecture", "phi2")
            .add_str("general.name", "moondream2")
            .add_u32("phi2.context_length", 2048)
            .add_u32("phi2.embedding_length", 2560)
            .add_u32("phi2.block_count", 32)
            .add_u32("phi2.rope.dimension_count", 32)
            .add_u32("phi2.attention.head_count", 32)
            .add_u32("phi2.attention.head_count_kv", 32)
            .build();
        GgufFile::from_bytes(&data).unwrap()
    }

    #[test]
    fn test_load_and_report_moondream_header() {
        let hp = Hparams::from_gguf(&moondream_header()).unwrap();
        assert_eq!(hp.n_ctx_train, 2048);
        assert_eq!(hp.n_embd, 2560);
        assert_eq!(hp.n_layer, 32);
        assert_eq!(hp.n_head, 32);
        assert_eq!(hp.n_head_kv, 32);
        assert_eq!(hp.n_embd_head_k, 80);
        assert_eq!(hp.n_embd_head_v, 80);
        assert_eq!(hp.n_embd_k_gqa(), 2560);
        assert_eq!(hp.n_ff, 4 * 2560);
    }

    #[test]
    fn test_reject_non_phi2() {
        let data = crate::gguf::factory::GgufBuilder::new()
            .add_str("general.architecture", "llama")
            .build();
        let file = GgufFile::from_bytes(&data).unwrap();
        assert_eq!(
            Hparams::from_gguf(&file),
            Err(LoadError::UnsupportedArch("llama".to_string()))
        );
    }

    #[test]
    fn test_report_round_trips_header_keys() {
        let file = moondream_header();
        let hp = Hparams::from_gguf(&file).unwrap();
        for (key, value) in hp.report() {
            assert_eq!(file.require_u32(&key).unwrap(), value, "{key}");
        }
    }

    #[test]
    fn test_missing_required_key() {
        let data = crate::gguf::factory::GgufBuilder::new()
            .add_str("general.architecture", "phi2")
            .add_u32("phi2.context_length", 2048)
            .build();
        let file = GgufFile::from_bytes(&data).unwrap();
        assert!(matches!(
            Hparams::from_gguf(&file),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let data = crate::gguf::factory::GgufBuilder::new()
            .add_str("general.architecture", "phi2")
            .add_u32("phi2.context_length", 2048)
            .add_u32("phi2.embedding_length", 100)
            .add_u32("phi2.block_count", 1)
            .add_u32("phi2.rope.dimension_count", 16)
            .add_u32("phi2.attention.head_count", 3)
            .add_u32("phi2.attention.head_count_kv", 3)
            .build();
        let file = GgufFile::from_bytes(&data).unwrap();
        assert!(matches!(
            Hparams::from_gguf(&file),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_hparams_from_fixture() {
        let data = phi2_fixture(Phi2Fixture::default());
        let file = GgufFile::from_bytes(&data).unwrap();
        let hp = Hparams::from_gguf(&file).unwrap();
        assert_eq!(hp.n_embd, 64);
        assert_eq!(hp.n_embd_head_k, 16);
        assert_eq!(hp.n_ff, 256);
        assert!((hp.f_norm_eps - 1e-5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rope_inherits_trained_values() {
        let data = phi2_fixture(Phi2Fixture::default());
        let file = GgufFile::from_bytes(&data).unwrap();
        let hp = Hparams::from_gguf(&file).unwrap();

        let cp = ContextParams::default();
        let rope = cp.rope(&hp);
        assert!((rope.freq_base - 10_000.0).abs() < f32::EPSILON);
        assert!((rope.freq_scale - 1.0).abs() < f32::EPSILON);
        assert_eq!(rope.n_ctx_orig, hp.n_ctx_train);

        let cp = ContextParams {
            rope_freq_base: 500_000.0,
            rope_freq_scale: 0.5,
            n_ctx_orig_yarn: 4096,
            ..ContextParams::default()
        };
        let rope = cp.rope(&hp);
        assert!((rope.freq_base - 500_000.0).abs() < f32::EPSILON);
        assert!((rope.freq_scale - 0.5).abs() < f32::EPSILON);
        assert_eq!(rope.n_ctx_orig, 4096);
    }
}

//! Model loading and per-layer tensor binding
//!
//! [`Model::load`] opens a GGUF container, reads the Phi-2 hyperparameters,
//! and binds every decoder tensor by its canonical name. Tensors stay where
//! the mapping put them: a [`WeightTensor`] is a descriptor (name, type,
//! shape, payload offset), and the graph builder imports descriptors as
//! weight leaves resolved by the runtime at execution time.

use std::path::Path;

use crate::config::Hparams;
use crate::dtype::DType;
use crate::error::LoadError;
use crate::gguf::{GgufFile, TensorInfo};
use crate::graph::{GraphContext, TensorRef};

/// Non-owning descriptor of one weight tensor
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    /// Canonical name in the container
    pub name: String,
    /// Element type
    pub dtype: DType,
    /// Dimensions, innermost first
    pub ne: Vec<usize>,
    /// Payload byte offset relative to the container's data section
    pub offset: u64,
}

impl WeightTensor {
    fn from_info(info: &TensorInfo) -> Result<Self, LoadError> {
        Ok(Self {
            name: info.name.clone(),
            dtype: DType::from_gguf(info.type_code)?,
            ne: info.dims.iter().map(|&d| d as usize).collect(),
            offset: info.offset,
        })
    }

    /// Import this weight into a per-step graph arena
    pub fn import(&self, ctx: &mut GraphContext) -> TensorRef {
        ctx.weight(&self.name, self.dtype, &self.ne)
    }
}

/// QKV projection weights: Phi-2 containers carry one fused tensor, other
/// exports of the same architecture carry three
#[derive(Debug, Clone, PartialEq)]
pub enum QkvWeights {
    /// Single `[n_embd, n_embd + 2 * n_embd_gqa]` projection
    Fused {
        /// Fused weight
        wqkv: WeightTensor,
        /// Fused bias
        bqkv: Option<WeightTensor>,
    },
    /// Separate per-projection tensors
    Split {
        /// Query weight
        wq: WeightTensor,
        /// Query bias
        bq: Option<WeightTensor>,
        /// Key weight
        wk: WeightTensor,
        /// Key bias
        bk: Option<WeightTensor>,
        /// Value weight
        wv: WeightTensor,
        /// Value bias
        bv: Option<WeightTensor>,
    },
}

/// Tensors of one Phi-2 decoder layer
///
/// Only the fields the architecture uses; the FFN shares the attention
/// pre-norm output, so `ffn_norm` is bound when a container carries it but
/// stays out of the forward graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Phi2Layer {
    /// Attention pre-norm weight
    pub attn_norm: WeightTensor,
    /// Attention pre-norm bias
    pub attn_norm_b: Option<WeightTensor>,
    /// QKV projection
    pub qkv: QkvWeights,
    /// Attention output projection weight
    pub wo: WeightTensor,
    /// Attention output projection bias
    pub bo: Option<WeightTensor>,
    /// FFN norm weight, unused by the Phi-2 graph
    pub ffn_norm: Option<WeightTensor>,
    /// FFN norm bias, unused by the Phi-2 graph
    pub ffn_norm_b: Option<WeightTensor>,
    /// FFN up projection weight
    pub ffn_up: WeightTensor,
    /// FFN up projection bias
    pub ffn_up_b: Option<WeightTensor>,
    /// FFN down projection weight
    pub ffn_down: WeightTensor,
    /// FFN down projection bias
    pub ffn_down_b: Option<WeightTensor>,
}

/// A loaded Phi-2 text model
#[derive(Debug)]
pub struct Model {
    /// `general.name` from the container, informational
    pub name: String,
    /// Hyperparameters
    pub hparams: Hparams,
    /// Vocabulary size, from the token embedding shape
    pub n_vocab: usize,
    /// Decoder layers in order
    pub layers: Vec<Phi2Layer>,
    /// Token embedding table `[n_embd, n_vocab]`
    pub tok_embd: WeightTensor,
    /// Final norm weight
    pub output_norm: WeightTensor,
    /// Final norm bias
    pub output_norm_b: Option<WeightTensor>,
    /// Output projection `[n_embd, n_vocab]`
    pub output: WeightTensor,
    /// Output projection bias
    pub output_b: Option<WeightTensor>,
    /// The container the descriptors point into
    pub gguf: GgufFile,
}

impl Model {
    /// Open and bind a model file
    ///
    /// # Errors
    ///
    /// Any [`LoadError`]: open/map failures, malformed container, wrong
    /// architecture, missing tensors, or shapes inconsistent with the
    /// hyperparameters.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        Self::from_gguf(GgufFile::open(path)?)
    }

    /// Bind a model from an already parsed container
    ///
    /// # Errors
    ///
    /// See [`Model::load`].
    pub fn from_gguf(gguf: GgufFile) -> Result<Self, LoadError> {
        let hparams = Hparams::from_gguf(&gguf)?;
        let name = gguf.get_str("general.name").unwrap_or("unknown").to_string();

        let n_embd = hparams.n_embd as usize;
        let n_ff = hparams.n_ff as usize;
        let qkv_dim = (hparams.n_embd + 2 * hparams.n_embd_k_gqa()) as usize;

        let tok_embd = require(&gguf, "token_embd.weight")?;
        expect_dim0(&tok_embd, n_embd)?;
        let n_vocab = *tok_embd.ne.get(1).unwrap_or(&1);

        let output_norm = require(&gguf, "output_norm.weight")?;
        expect_shape(&output_norm, &[n_embd])?;
        let output_norm_b = optional(&gguf, "output_norm.bias")?;
        let output = require(&gguf, "output.weight")?;
        expect_shape(&output, &[n_embd, n_vocab])?;
        let output_b = optional(&gguf, "output.bias")?;

        let mut layers = Vec::with_capacity(hparams.n_layer as usize);
        for il in 0..hparams.n_layer {
            let t = |suffix: &str| format!("blk.{il}.{suffix}");

            let attn_norm = require(&gguf, &t("attn_norm.weight"))?;
            expect_shape(&attn_norm, &[n_embd])?;
            let attn_norm_b = optional(&gguf, &t("attn_norm.bias"))?;

            let qkv = if gguf.tensor(&t("attn_qkv.weight")).is_some() {
                let wqkv = require(&gguf, &t("attn_qkv.weight"))?;
                expect_shape(&wqkv, &[n_embd, qkv_dim])?;
                QkvWeights::Fused {
                    wqkv,
                    bqkv: optional(&gguf, &t("attn_qkv.bias"))?,
                }
            } else if gguf.tensor(&t("attn_q.weight")).is_some() {
                let wq = require(&gguf, &t("attn_q.weight"))?;
                expect_shape(&wq, &[n_embd, n_embd])?;
                let wk = require(&gguf, &t("attn_k.weight"))?;
                let wv = require(&gguf, &t("attn_v.weight"))?;
                QkvWeights::Split {
                    wq,
                    bq: optional(&gguf, &t("attn_q.bias"))?,
                    wk,
                    bk: optional(&gguf, &t("attn_k.bias"))?,
                    wv,
                    bv: optional(&gguf, &t("attn_v.bias"))?,
                }
            } else {
                return Err(LoadError::MissingTensor(t("attn_qkv.weight")));
            };

            let wo = require(&gguf, &t("attn_output.weight"))?;
            expect_shape(&wo, &[n_embd, n_embd])?;

            let ffn_up = require(&gguf, &t("ffn_up.weight"))?;
            expect_shape(&ffn_up, &[n_embd, n_ff])?;
            let ffn_down = require(&gguf, &t("ffn_down.weight"))?;
            expect_shape(&ffn_down, &[n_ff, n_embd])?;

            layers.push(Phi2Layer {
                attn_norm,
                attn_norm_b,
                qkv,
                wo,
                bo: optional(&gguf, &t("attn_output.bias"))?,
                ffn_norm: optional(&gguf, &t("ffn_norm.weight"))?,
                ffn_norm_b: optional(&gguf, &t("ffn_norm.bias"))?,
                ffn_up,
                ffn_up_b: optional(&gguf, &t("ffn_up.bias"))?,
                ffn_down,
                ffn_down_b: optional(&gguf, &t("ffn_down.bias"))?,
            });
        }

        Ok(Self {
            name,
            hparams,
            n_vocab,
            layers,
            tok_embd,
            output_norm,
            output_norm_b,
            output,
            output_b,
            gguf,
        })
    }
}

fn require(gguf: &GgufFile, name: &str) -> Result<WeightTensor, LoadError> {
    match gguf.tensor(name) {
        Some(info) => WeightTensor::from_info(info),
        None => Err(LoadError::MissingTensor(name.to_string())),
    }
}

fn optional(gguf: &GgufFile, name: &str) -> Result<Option<WeightTensor>, LoadError> {
    match gguf.tensor(name) {
        Some(info) => Ok(Some(WeightTensor::from_info(info)?)),
        None => Ok(None),
    }
}

fn expect_shape(w: &WeightTensor, expected: &[usize]) -> Result<(), LoadError> {
    if w.ne != expected {
        return Err(LoadError::BadShape {
            name: w.name.clone(),
            expected: expected.to_vec(),
            actual: w.ne.clone(),
        });
    }
    Ok(())
}

fn expect_dim0(w: &WeightTensor, d0: usize) -> Result<(), LoadError> {
    if w.ne.first() != Some(&d0) {
        return Err(LoadError::BadShape {
            name: w.name.clone(),
            expected: vec![d0],
            actual: w.ne.clone(),
        });
    }
    Ok(())
}

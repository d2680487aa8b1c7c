//! # Crescent
//!
//! Inference core for the Phi-2 decoder that backs the Moondream 2
//! vision-language model. Three subsystems, graph-first:
//!
//! - **Loader** ([`model`], [`gguf`], [`config`]): parses the
//!   self-describing GGUF weight container, reads the hyperparameters, and
//!   binds every decoder tensor by canonical name without copying
//!   payloads.
//! - **KV cache** ([`kv_cache`]): owns the per-layer key/value slabs that
//!   persist across forward passes and hands out the write windows and
//!   strided read views the builder wires into each step.
//! - **Graph builder** ([`build`], [`graph`]): per forward pass, emits a
//!   dataflow graph over an arena of opaque tensor handles — embedding,
//!   N × {pre-norm, fused attention with rotary position, GELU FFN,
//!   parallel residual}, final norm, output projection — interleaving
//!   cache writes with attention reads under exact stride and precision
//!   constraints.
//!
//! Execution is someone else's job: the emitted [`graph::Graph`] is handed
//! to an external tensor runtime that owns buffers, kernels, and
//! scheduling. This crate computes nothing.
//!
//! ## Example
//!
//! ```rust,no_run
//! use crescent::{
//!     build::{build_phi2, BuildCtx, NoopObserver},
//!     Batch, ContextParams, GraphContext, KvCache, Model,
//! };
//!
//! let model = Model::load("moondream2-text-model-f16.gguf")?;
//! let cparams = ContextParams::default();
//! let mut kv = KvCache::with_defaults(
//!     model.hparams.n_layer,
//!     cparams.n_ctx,
//!     model.hparams.n_embd_k_gqa(),
//!     model.hparams.n_embd_v_gqa(),
//!     cparams.flash_attn,
//! );
//!
//! let batch = Batch::from_tokens(vec![1, 2, 3], 0);
//! let mut gctx = GraphContext::new();
//! let mut observer = NoopObserver;
//! let built = build_phi2(
//!     &mut gctx,
//!     &mut BuildCtx {
//!         model: &model,
//!         cparams: &cparams,
//!         batch: &batch,
//!         kv: &mut kv,
//!         n_outputs: 1,
//!         observer: &mut observer,
//!     },
//! )?;
//! // Hand `built.graph` to the runtime, fill `built.inputs`, read the
//! // logits from `built.logits`, then commit the cache:
//! kv.commit(batch.n_tokens);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod batch;
pub mod build;
pub mod config;
pub mod dtype;
pub mod error;
pub mod gguf;
pub mod graph;
pub mod kv_cache;
pub mod model;

// Re-exports for convenience
pub use batch::Batch;
pub use config::{ContextParams, Hparams};
pub use dtype::DType;
pub use error::{BuildError, ConfigError, LoadError};
pub use graph::{Graph, GraphContext, TensorRef};
pub use kv_cache::KvCache;
pub use model::Model;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}

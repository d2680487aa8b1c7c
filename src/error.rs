//! Error types for crescent
//!
//! One enum per failure domain: loading the weight container, validating
//! session configuration, and building a forward-pass graph. Load errors
//! abort session startup; build errors abort the current step without
//! touching cache state (cache mutation only happens at graph execution).

use thiserror::Error;

/// Errors surfaced while opening and parsing a GGUF weight container
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The file could not be opened or mapped
    #[error("cannot open weight file '{path}': {reason}")]
    FileOpen {
        /// Path that failed to open
        path: String,
        /// Underlying I/O failure
        reason: String,
    },

    /// The container bytes are malformed
    #[error("malformed GGUF container: {reason}")]
    Parse {
        /// What was being read when parsing failed
        reason: String,
    },

    /// The container declares an architecture this core does not implement
    #[error("unsupported architecture '{0}', expected 'phi2'")]
    UnsupportedArch(String),

    /// A tensor required by the architecture is absent from the container
    #[error("missing tensor '{0}'")]
    MissingTensor(String),

    /// A bound tensor has a shape other than what the hyperparameters imply
    #[error("tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    BadShape {
        /// Tensor name as bound
        name: String,
        /// Shape implied by the hyperparameters
        expected: Vec<usize>,
        /// Shape declared by the container
        actual: Vec<usize>,
    },
}

/// Errors in the session configuration consulted at build time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The KV cache was allocated for a different context length
    #[error("kv cache size {kv_size} does not match context length {n_ctx}")]
    CtxMismatch {
        /// Inference context length from the context parameters
        n_ctx: u32,
        /// Capacity the cache was allocated with
        kv_size: u32,
    },
}

/// Errors raised while emitting a forward-pass graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The batch violates an input invariant
    #[error("invalid batch: {reason}")]
    InvalidBatch {
        /// Which invariant was violated
        reason: String,
    },

    /// The step would not fit in the inference context window
    #[error("context overflow: n_ctx={n_ctx} but cache holds {used} and batch adds {n_tokens}")]
    ContextFull {
        /// Inference context length
        n_ctx: u32,
        /// Occupied cache slots before this step
        used: u32,
        /// Tokens the batch would add
        n_tokens: u32,
    },

    /// Session configuration rejected before any node was emitted
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_display() {
        let err = LoadError::UnsupportedArch("llama".to_string());
        assert_eq!(
            err.to_string(),
            "unsupported architecture 'llama', expected 'phi2'"
        );
    }

    #[test]
    fn test_missing_tensor_display() {
        let err = LoadError::MissingTensor("blk.0.attn_qkv.weight".to_string());
        assert!(err.to_string().contains("blk.0.attn_qkv.weight"));
    }

    #[test]
    fn test_ctx_mismatch_through_build_error() {
        let err = BuildError::from(ConfigError::CtxMismatch {
            n_ctx: 2048,
            kv_size: 1024,
        });
        assert!(matches!(
            err,
            BuildError::Config(ConfigError::CtxMismatch {
                n_ctx: 2048,
                kv_size: 1024
            })
        ));
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn test_bad_shape_equality() {
        let a = LoadError::BadShape {
            name: "output.weight".to_string(),
            expected: vec![2560, 51200],
            actual: vec![2560, 100],
        };
        assert_eq!(a.clone(), a);
    }
}

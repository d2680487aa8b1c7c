//! Loader round-trip properties
//!
//! A container synthesized from any valid hyperparameter set must load
//! back to the same hyperparameters, and the loaded hyperparameters must
//! re-emit the header keys bit-for-bit.

use proptest::prelude::*;

use crescent::gguf::factory::GgufBuilder;
use crescent::gguf::GgufFile;
use crescent::{Hparams, LoadError};

fn header_container(
    n_ctx: u32,
    n_embd: u32,
    n_layer: u32,
    n_rot: u32,
    n_head: u32,
    n_head_kv: u32,
) -> Vec<u8> {
    GgufBuilder::new()
        .add_str("general.architecture", "phi2")
        .add_u32("phi2.context_length", n_ctx)
        .add_u32("phi2.embedding_length", n_embd)
        .add_u32("phi2.block_count", n_layer)
        .add_u32("phi2.rope.dimension_count", n_rot)
        .add_u32("phi2.attention.head_count", n_head)
        .add_u32("phi2.attention.head_count_kv", n_head_kv)
        .build()
}

proptest! {
    #[test]
    fn header_keys_round_trip(
        head_width in 1u32..=128,
        n_head_log2 in 0u32..=5,
        kv_divisor_log2 in 0u32..=5,
        n_layer in 1u32..=48,
        n_ctx in 1u32..=8192,
        n_rot in 1u32..=128,
    ) {
        let n_head = 1 << n_head_log2;
        let n_head_kv = n_head >> kv_divisor_log2.min(n_head_log2);
        let n_embd = head_width * n_head;

        let data = header_container(n_ctx, n_embd, n_layer, n_rot, n_head, n_head_kv);
        let file = GgufFile::from_bytes(&data).unwrap();
        let hparams = Hparams::from_gguf(&file).unwrap();

        prop_assert_eq!(hparams.n_embd_head_k, head_width);
        prop_assert_eq!(hparams.n_embd_head_k * hparams.n_head, hparams.n_embd);
        prop_assert_eq!(hparams.n_embd_k_gqa(), head_width * n_head_kv);

        // Every consumed key re-emits with the exact value it was read from.
        for (key, value) in hparams.report() {
            prop_assert_eq!(file.require_u32(&key).unwrap(), value);
        }
    }

    #[test]
    fn foreign_architectures_rejected(arch in "[a-z]{1,12}") {
        prop_assume!(arch != "phi2");
        let data = GgufBuilder::new()
            .add_str("general.architecture", &arch)
            .build();
        let file = GgufFile::from_bytes(&data).unwrap();
        prop_assert_eq!(
            Hparams::from_gguf(&file),
            Err(LoadError::UnsupportedArch(arch))
        );
    }

    #[test]
    fn metadata_u32_survives_serialization(
        key in "[a-z]{1,8}\\.[a-z]{1,8}",
        value in any::<u32>(),
    ) {
        let data = GgufBuilder::new().add_u32(&key, value).build();
        let file = GgufFile::from_bytes(&data).unwrap();
        prop_assert_eq!(file.require_u32(&key).unwrap(), value);
    }
}

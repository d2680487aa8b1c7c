//! Tensor element types
//!
//! The weight container reports an element type per tensor; the cache and
//! graph layers need exact byte accounting for views and strides. Block
//! quantized types store a fixed-size block for a fixed number of elements,
//! so row sizes are computed per block, never per element.

use crate::error::LoadError;

/// Element type of a tensor, matching the GGUF/GGML type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float
    F32,
    /// 16-bit IEEE float
    F16,
    /// bfloat16
    BF16,
    /// 32-bit signed integer (token ids, positions, gather indices)
    I32,
    /// 4-bit block quantization, 32 elements per 18-byte block
    Q4_0,
    /// 8-bit block quantization, 32 elements per 34-byte block
    Q8_0,
}

impl DType {
    /// Map a GGUF tensor type code to a `DType`
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Parse` for type codes this core does not consume.
    pub fn from_gguf(code: u32) -> Result<Self, LoadError> {
        match code {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            2 => Ok(Self::Q4_0),
            8 => Ok(Self::Q8_0),
            26 => Ok(Self::I32),
            30 => Ok(Self::BF16),
            other => Err(LoadError::Parse {
                reason: format!("unsupported tensor type code {other}"),
            }),
        }
    }

    /// GGUF tensor type code for this type
    #[must_use]
    pub fn to_gguf(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q8_0 => 8,
            Self::I32 => 26,
            Self::BF16 => 30,
        }
    }

    /// Number of elements covered by one storage block
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::BF16 | Self::I32 => 1,
            Self::Q4_0 | Self::Q8_0 => 32,
        }
    }

    /// Bytes occupied by one storage block
    #[must_use]
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::Q4_0 => 18,
            Self::Q8_0 => 34,
        }
    }

    /// Bytes per element for non-quantized types
    ///
    /// # Panics
    ///
    /// Panics for block-quantized types, which have no per-element size.
    #[must_use]
    pub fn element_size(self) -> usize {
        assert_eq!(
            self.block_size(),
            1,
            "element_size is undefined for block-quantized {self:?}"
        );
        self.type_size()
    }

    /// Bytes occupied by a row of `n` elements
    ///
    /// `n` must be a multiple of the block size for quantized types.
    #[must_use]
    pub fn row_size(self, n: usize) -> usize {
        assert_eq!(
            n % self.block_size(),
            0,
            "row of {n} elements is not a whole number of {self:?} blocks"
        );
        n / self.block_size() * self.type_size()
    }

    /// Whether this is a block-quantized type
    #[must_use]
    pub fn is_quantized(self) -> bool {
        self.block_size() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_size_plain_types() {
        assert_eq!(DType::F32.row_size(2560), 2560 * 4);
        assert_eq!(DType::F16.row_size(2560), 2560 * 2);
        assert_eq!(DType::I32.row_size(16), 64);
    }

    #[test]
    fn test_row_size_quantized() {
        // Q4_0: 18 bytes per 32 elements, Q8_0: 34 bytes per 32 elements
        assert_eq!(DType::Q4_0.row_size(64), 36);
        assert_eq!(DType::Q8_0.row_size(64), 68);
    }

    #[test]
    #[should_panic(expected = "whole number")]
    fn test_row_size_ragged_block_panics() {
        let _ = DType::Q4_0.row_size(33);
    }

    #[test]
    fn test_gguf_code_round_trip() {
        for dt in [
            DType::F32,
            DType::F16,
            DType::BF16,
            DType::I32,
            DType::Q4_0,
            DType::Q8_0,
        ] {
            assert_eq!(DType::from_gguf(dt.to_gguf()).unwrap(), dt);
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(matches!(
            DType::from_gguf(999),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "element_size is undefined")]
    fn test_element_size_quantized_panics() {
        let _ = DType::Q8_0.element_size();
    }
}

//! Container parsing and mapped access

use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use memmap2::Mmap;

use crate::error::LoadError;
use crate::gguf::reader;
use crate::gguf::types::{
    GgufHeader, GgufValue, TensorInfo, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V3,
};

// Bounds against corrupted headers; no real model comes close.
const MAX_TENSOR_COUNT: u64 = 100_000;
const MAX_METADATA_COUNT: u64 = 10_000;
const MAX_ARRAY_LEN: u64 = 10_000_000;
const MAX_DIMS: u32 = 4;

/// A parsed GGUF container
///
/// Holds the header, the typed metadata map, and the tensor descriptors.
/// Tensor payloads stay in the file mapping; [`GgufFile::data_offset`] and
/// [`GgufFile::alignment`] tell the runtime where and how to map them.
#[derive(Debug)]
pub struct GgufFile {
    /// Container header
    pub header: GgufHeader,
    /// Metadata key/value pairs
    pub metadata: HashMap<String, GgufValue>,
    /// Tensor descriptors in declaration order
    pub tensors: Vec<TensorInfo>,
    data_offset: usize,
    alignment: usize,
    mmap: Option<Mmap>,
}

impl GgufFile {
    /// Parse a container from bytes already in memory
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Parse` on bad magic, unsupported version, or any
    /// malformed or truncated section.
    pub fn from_bytes(data: &[u8]) -> Result<Self, LoadError> {
        let mut cursor = Cursor::new(data);

        let header = Self::parse_header(&mut cursor)?;
        let metadata = Self::parse_metadata(&mut cursor, header.metadata_count)?;
        let tensors = Self::parse_tensor_info(&mut cursor, header.tensor_count)?;

        let alignment = match metadata.get("general.alignment") {
            Some(GgufValue::U32(a)) if *a > 0 => *a as usize,
            Some(_) => {
                return Err(LoadError::Parse {
                    reason: "general.alignment is not a positive u32".to_string(),
                })
            }
            None => GGUF_DEFAULT_ALIGNMENT,
        };

        // Tensor data begins at the first aligned byte after the descriptors.
        let pos = cursor.position() as usize;
        let data_offset = pos.div_ceil(alignment) * alignment;

        Ok(Self {
            header,
            metadata,
            tensors,
            data_offset,
            alignment,
            mmap: None,
        })
    }

    /// Memory-map a container file and parse it
    ///
    /// The mapping is retained for the lifetime of the value so that tensor
    /// payloads can be read lazily without copying.
    ///
    /// # Errors
    ///
    /// Returns `LoadError::FileOpen` if the file cannot be opened or mapped,
    /// or any `from_bytes` parse error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LoadError::FileOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        // SAFETY: the mapping is read-only and the file is not mutated
        // while mapped.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| LoadError::FileOpen {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        #[cfg(unix)]
        // SAFETY: pointer and length come from the live mapping.
        unsafe {
            libc::madvise(
                mmap.as_ptr().cast_mut().cast::<libc::c_void>(),
                mmap.len(),
                libc::MADV_SEQUENTIAL,
            );
        }

        let mut parsed = Self::from_bytes(&mmap)?;
        parsed.mmap = Some(mmap);
        Ok(parsed)
    }

    /// Byte offset of the tensor data section from the start of the file
    #[must_use]
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Tensor data alignment declared by the container
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Raw mapped bytes, when the container was opened from a file
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.mmap.as_deref()
    }

    /// Look up a tensor descriptor by name
    #[must_use]
    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Look up a metadata value
    #[must_use]
    pub fn find(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    /// Required u32 metadata key
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Parse` naming the key when it is absent or not
    /// a u32.
    pub fn require_u32(&self, key: &str) -> Result<u32, LoadError> {
        match self.metadata.get(key) {
            Some(GgufValue::U32(v)) => Ok(*v),
            Some(_) => Err(LoadError::Parse {
                reason: format!("metadata key '{key}' is not a u32"),
            }),
            None => Err(LoadError::Parse {
                reason: format!("required metadata key '{key}' is missing"),
            }),
        }
    }

    /// Required string metadata key
    ///
    /// # Errors
    ///
    /// Returns `LoadError::Parse` naming the key when it is absent or not
    /// a string.
    pub fn require_str(&self, key: &str) -> Result<&str, LoadError> {
        match self.metadata.get(key) {
            Some(GgufValue::Str(v)) => Ok(v),
            Some(_) => Err(LoadError::Parse {
                reason: format!("metadata key '{key}' is not a string"),
            }),
            None => Err(LoadError::Parse {
                reason: format!("required metadata key '{key}' is missing"),
            }),
        }
    }

    /// Optional u32 metadata key; `None` when absent
    #[must_use]
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.metadata.get(key) {
            Some(GgufValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Optional f32 metadata key; `None` when absent
    #[must_use]
    pub fn get_f32(&self, key: &str) -> Option<f32> {
        match self.metadata.get(key) {
            Some(GgufValue::F32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Optional string metadata key; `None` when absent
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(GgufValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    fn parse_header(cursor: &mut Cursor<&[u8]>) -> Result<GgufHeader, LoadError> {
        let magic = reader::read_u32(cursor, "magic")?;
        if magic != GGUF_MAGIC {
            return Err(LoadError::Parse {
                reason: format!("bad magic 0x{magic:08X}, expected 0x{GGUF_MAGIC:08X}"),
            });
        }

        let version = reader::read_u32(cursor, "version")?;
        if version != GGUF_VERSION_V3 {
            return Err(LoadError::Parse {
                reason: format!("unsupported version {version}, only v{GGUF_VERSION_V3}"),
            });
        }

        let tensor_count = reader::read_u64(cursor, "tensor_count")?;
        if tensor_count > MAX_TENSOR_COUNT {
            return Err(LoadError::Parse {
                reason: format!("tensor_count {tensor_count} exceeds {MAX_TENSOR_COUNT}"),
            });
        }

        let metadata_count = reader::read_u64(cursor, "metadata_count")?;
        if metadata_count > MAX_METADATA_COUNT {
            return Err(LoadError::Parse {
                reason: format!("metadata_count {metadata_count} exceeds {MAX_METADATA_COUNT}"),
            });
        }

        Ok(GgufHeader {
            magic,
            version,
            tensor_count,
            metadata_count,
        })
    }

    fn parse_metadata(
        cursor: &mut Cursor<&[u8]>,
        count: u64,
    ) -> Result<HashMap<String, GgufValue>, LoadError> {
        let mut metadata = HashMap::new();
        for _ in 0..count {
            let key = reader::read_string(cursor, "metadata key")?;
            let type_code = reader::read_u32(cursor, "metadata value type")?;
            let value = Self::read_value(cursor, type_code, &key)?;
            metadata.insert(key, value);
        }
        Ok(metadata)
    }

    fn read_value(
        cursor: &mut Cursor<&[u8]>,
        type_code: u32,
        key: &str,
    ) -> Result<GgufValue, LoadError> {
        match type_code {
            0 => Ok(GgufValue::U8(reader::read_u8(cursor, key)?)),
            1 => Ok(GgufValue::I8(reader::read_i8(cursor, key)?)),
            2 => Ok(GgufValue::U16(reader::read_u16(cursor, key)?)),
            3 => Ok(GgufValue::I16(reader::read_i16(cursor, key)?)),
            4 => Ok(GgufValue::U32(reader::read_u32(cursor, key)?)),
            5 => Ok(GgufValue::I32(reader::read_i32(cursor, key)?)),
            6 => Ok(GgufValue::F32(reader::read_f32(cursor, key)?)),
            7 => Ok(GgufValue::Bool(reader::read_bool(cursor, key)?)),
            8 => Ok(GgufValue::Str(reader::read_string(cursor, key)?)),
            9 => {
                let element_type = reader::read_u32(cursor, "array element type")?;
                let len = reader::read_u64(cursor, "array length")?;
                if len > MAX_ARRAY_LEN {
                    return Err(LoadError::Parse {
                        reason: format!("array '{key}' length {len} exceeds {MAX_ARRAY_LEN}"),
                    });
                }
                let mut elements = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    elements.push(Self::read_value(cursor, element_type, key)?);
                }
                Ok(GgufValue::Array(elements))
            }
            10 => Ok(GgufValue::U64(reader::read_u64(cursor, key)?)),
            11 => Ok(GgufValue::I64(reader::read_i64(cursor, key)?)),
            12 => Ok(GgufValue::F64(reader::read_f64(cursor, key)?)),
            other => Err(LoadError::Parse {
                reason: format!("metadata key '{key}' has unknown value type {other}"),
            }),
        }
    }

    fn parse_tensor_info(
        cursor: &mut Cursor<&[u8]>,
        count: u64,
    ) -> Result<Vec<TensorInfo>, LoadError> {
        let mut tensors = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = reader::read_string(cursor, "tensor name")?;
            let n_dims = reader::read_u32(cursor, "tensor n_dims")?;
            if n_dims == 0 || n_dims > MAX_DIMS {
                return Err(LoadError::Parse {
                    reason: format!("tensor '{name}' has {n_dims} dims, expected 1..={MAX_DIMS}"),
                });
            }
            // Dims are stored innermost-first and stay that way; the graph
            // layer consumes this order directly.
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(reader::read_u64(cursor, "tensor dim")?);
            }
            let type_code = reader::read_u32(cursor, "tensor type")?;
            let offset = reader::read_u64(cursor, "tensor offset")?;
            tensors.push(TensorInfo {
                name,
                n_dims,
                dims,
                type_code,
                offset,
            });
        }
        Ok(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::factory::GgufBuilder;

    #[test]
    fn test_parse_empty_container() {
        let data = GgufBuilder::new().build();
        let file = GgufFile::from_bytes(&data).expect("empty container parses");
        assert_eq!(file.header.magic, GGUF_MAGIC);
        assert_eq!(file.header.version, GGUF_VERSION_V3);
        assert!(file.metadata.is_empty());
        assert!(file.tensors.is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut data = GgufBuilder::new().build();
        data[0] = b'X';
        assert!(matches!(
            GgufFile::from_bytes(&data),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_metadata_accessors() {
        let data = GgufBuilder::new()
            .add_str("general.architecture", "phi2")
            .add_u32("phi2.embedding_length", 2560)
            .add_f32("phi2.rope.freq_base", 10_000.0)
            .build();
        let file = GgufFile::from_bytes(&data).unwrap();

        assert_eq!(file.require_str("general.architecture").unwrap(), "phi2");
        assert_eq!(file.require_u32("phi2.embedding_length").unwrap(), 2560);
        assert_eq!(file.get_f32("phi2.rope.freq_base"), Some(10_000.0));
        assert_eq!(file.get_u32("phi2.block_count"), None);

        let err = file.require_u32("phi2.block_count").unwrap_err();
        assert!(err.to_string().contains("phi2.block_count"));
    }

    #[test]
    fn test_type_mismatch_is_error() {
        let data = GgufBuilder::new()
            .add_str("phi2.block_count", "thirty-two")
            .build();
        let file = GgufFile::from_bytes(&data).unwrap();
        assert!(matches!(
            file.require_u32("phi2.block_count"),
            Err(LoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_tensor_lookup_and_data_offset() {
        let weights = vec![1.0f32; 64];
        let data = GgufBuilder::new()
            .add_f32_tensor("output_norm.weight", &[64], &weights)
            .build();
        let file = GgufFile::from_bytes(&data).unwrap();

        let info = file.tensor("output_norm.weight").expect("tensor bound");
        assert_eq!(info.dims, vec![64]);
        assert_eq!(info.offset, 0);
        assert_eq!(file.alignment(), GGUF_DEFAULT_ALIGNMENT);
        assert_eq!(file.data_offset() % file.alignment(), 0);
        assert!(file.tensor("no.such.tensor").is_none());
    }

    #[test]
    fn test_open_round_trips_through_disk() {
        let data = GgufBuilder::new()
            .add_str("general.architecture", "phi2")
            .add_u32("phi2.context_length", 2048)
            .build();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, &data).unwrap();

        let file = GgufFile::open(&path).expect("mapped open");
        assert_eq!(file.require_u32("phi2.context_length").unwrap(), 2048);
        assert_eq!(file.data().unwrap().len(), data.len());
    }

    #[test]
    fn test_open_missing_file() {
        let err = GgufFile::open("/nonexistent/model.gguf").unwrap_err();
        assert!(matches!(err, LoadError::FileOpen { .. }));
    }
}

//! N-dimensional numeric arrays and their packed wire form.
//!
//! Bulk arrays travel inside the textual envelope as a tagged object:
//!
//! ```text
//! { "ARRAY": "<base64>", "DTYPE": "float64", "SHAPE": [2, 3] }
//! ```
//!
//! The base-64 body is a little-endian byte dump of the elements, zlib
//! compressed when that makes it smaller. Decoding accepts either form.

use crate::error::{MessageError, MessageResult};
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Tag holding the encoded element bytes.
pub const ARRAY_TAG: &str = "ARRAY";
/// Tag holding the element type name.
pub const DTYPE_TAG: &str = "DTYPE";
/// Tag holding the dimensions.
pub const SHAPE_TAG: &str = "SHAPE";

/// Largest decoded array body accepted from the wire (1 GiB).
pub const MAX_ARRAY_BYTES: usize = 1 << 30;

/// Element type of an [`NdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DType {
    /// Wire name of the element type.
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "uint8",
            DType::I8 => "int8",
            DType::U16 => "uint16",
            DType::I16 => "int16",
            DType::U32 => "uint32",
            DType::I32 => "int32",
            DType::U64 => "uint64",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }

    /// Parse a wire name back into a type.
    pub fn parse(name: &str) -> Option<Self> {
        let dtype = match name {
            "bool" => DType::Bool,
            "uint8" => DType::U8,
            "int8" => DType::I8,
            "uint16" => DType::U16,
            "int16" => DType::I16,
            "uint32" => DType::U32,
            "int32" => DType::I32,
            "uint64" => DType::U64,
            "int64" => DType::I64,
            "float32" => DType::F32,
            "float64" => DType::F64,
            _ => return None,
        };
        Some(dtype)
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }
}

/// Typed element storage, flattened in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Bool(Vec<bool>),
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    U64(Vec<u64>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! le_bytes {
    ($values:expr) => {
        $values.iter().flat_map(|v| v.to_le_bytes()).collect()
    };
}

macro_rules! from_le {
    ($bytes:expr, $t:ty) => {
        $bytes
            .chunks_exact(std::mem::size_of::<$t>())
            .map(|chunk| {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(chunk);
                <$t>::from_le_bytes(buf)
            })
            .collect()
    };
}

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Bool(_) => DType::Bool,
            ArrayData::U8(_) => DType::U8,
            ArrayData::I8(_) => DType::I8,
            ArrayData::U16(_) => DType::U16,
            ArrayData::I16(_) => DType::I16,
            ArrayData::U32(_) => DType::U32,
            ArrayData::I32(_) => DType::I32,
            ArrayData::U64(_) => DType::U64,
            ArrayData::I64(_) => DType::I64,
            ArrayData::F32(_) => DType::F32,
            ArrayData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Bool(v) => v.len(),
            ArrayData::U8(v) => v.len(),
            ArrayData::I8(v) => v.len(),
            ArrayData::U16(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::U32(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::U64(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            ArrayData::Bool(v) => v.iter().map(|b| *b as u8).collect(),
            ArrayData::U8(v) => v.clone(),
            ArrayData::I8(v) => le_bytes!(v),
            ArrayData::U16(v) => le_bytes!(v),
            ArrayData::I16(v) => le_bytes!(v),
            ArrayData::U32(v) => le_bytes!(v),
            ArrayData::I32(v) => le_bytes!(v),
            ArrayData::U64(v) => le_bytes!(v),
            ArrayData::I64(v) => le_bytes!(v),
            ArrayData::F32(v) => le_bytes!(v),
            ArrayData::F64(v) => le_bytes!(v),
        }
    }

    fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Self {
        match dtype {
            DType::Bool => ArrayData::Bool(bytes.iter().map(|b| *b != 0).collect()),
            DType::U8 => ArrayData::U8(bytes.to_vec()),
            DType::I8 => ArrayData::I8(from_le!(bytes, i8)),
            DType::U16 => ArrayData::U16(from_le!(bytes, u16)),
            DType::I16 => ArrayData::I16(from_le!(bytes, i16)),
            DType::U32 => ArrayData::U32(from_le!(bytes, u32)),
            DType::I32 => ArrayData::I32(from_le!(bytes, i32)),
            DType::U64 => ArrayData::U64(from_le!(bytes, u64)),
            DType::I64 => ArrayData::I64(from_le!(bytes, i64)),
            DType::F32 => ArrayData::F32(from_le!(bytes, f32)),
            DType::F64 => ArrayData::F64(from_le!(bytes, f64)),
        }
    }
}

/// A dense n-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Build an array, checking that `shape` covers exactly `data.len()` elements.
    pub fn new(shape: Vec<usize>, data: ArrayData) -> MessageResult<Self> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(MessageError::array(format!(
                "shape {:?} holds {} elements, data has {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A one-dimensional array over `data`.
    pub fn vector(data: ArrayData) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Pack the array into its tagged wire form.
    pub fn pack(&self) -> PackedArray {
        let raw = self.data.to_le_bytes();
        let body = match compress(&raw) {
            Some(compressed) if compressed.len() < raw.len() => compressed,
            _ => raw,
        };
        PackedArray {
            encoded: base64::engine::general_purpose::STANDARD.encode(body),
            dtype: self.dtype().name().to_string(),
            shape: self.shape.clone(),
        }
    }
}

fn element_count(shape: &[usize]) -> MessageResult<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| MessageError::array(format!("shape {shape:?} overflows")))
}

fn compress(raw: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    encoder.write_all(raw).ok()?;
    encoder.finish().ok()
}

/// An array still in its tagged wire form.
///
/// Relays keep arrays packed so that forwarding never pays for a decode and
/// re-encode; [`PackedArray::unpack`] reconstructs the native array.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedArray {
    pub encoded: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

impl PackedArray {
    /// Decode the body, accepting both compressed and raw dumps.
    pub fn unpack(&self) -> MessageResult<NdArray> {
        let dtype = DType::parse(&self.dtype)
            .ok_or_else(|| MessageError::array(format!("unknown dtype '{}'", self.dtype)))?;
        let expected = element_count(&self.shape)?
            .checked_mul(dtype.size())
            .filter(|size| *size <= MAX_ARRAY_BYTES)
            .ok_or_else(|| {
                MessageError::array(format!(
                    "{} x {:?} exceeds {} bytes",
                    self.dtype, self.shape, MAX_ARRAY_BYTES
                ))
            })?;
        let body = base64::engine::general_purpose::STANDARD.decode(&self.encoded)?;

        // Inflate at most one byte past the declared size.
        let mut inflated = Vec::new();
        let limit = expected as u64 + 1;
        let bytes = match ZlibDecoder::new(body.as_slice())
            .take(limit)
            .read_to_end(&mut inflated)
        {
            Ok(_) if inflated.len() == expected => inflated,
            _ if body.len() == expected => body,
            _ => {
                return Err(MessageError::array(format!(
                    "body of {} bytes does not match {} x {:?}",
                    body.len(),
                    self.dtype,
                    self.shape
                )))
            }
        };

        NdArray::new(self.shape.clone(), ArrayData::from_le_bytes(dtype, &bytes))
    }

    /// Render as the tagged JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            ARRAY_TAG: self.encoded,
            DTYPE_TAG: self.dtype,
            SHAPE_TAG: self.shape,
        })
    }

    /// Recognise a tagged JSON object. Returns `None` for ordinary maps.
    pub fn from_json(object: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        let encoded = object.get(ARRAY_TAG)?.as_str()?.to_string();
        let dtype = object.get(DTYPE_TAG)?.as_str()?.to_string();
        let shape = object
            .get(SHAPE_TAG)?
            .as_array()?
            .iter()
            .map(|d| d.as_u64().map(|d| d as usize))
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            encoded,
            dtype,
            shape,
        })
    }
}

// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 12 February 2024

/*!
Named, typed tensors as they travel between callers, the dispatcher
and native runtimes.

All element-type specific behaviour goes through a single table of
[`ElementType`] entries: byte width, name and the little-endian
encoder/decoder pair. Backends map their own type codes onto
[`ElementType`] once and never switch on raw type codes themselves.
 */

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

/// One request or response: input or output name to tensor.
pub type TensorMap = HashMap<String, Tensor>;

/// Errors produced while building or decoding tensors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TensorError {
    #[error("shape {shape:?} holds {expected} elements but {actual} were provided")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("{len} bytes is not a whole number of {element_type} elements")]
    ByteLength {
        element_type: ElementType,
        len: usize,
    },

    #[error("shape {0:?} holds more elements than fit in memory")]
    ShapeOverflow(Vec<usize>),

    #[error("unknown element type {0:?}")]
    UnknownElementType(String),
}

/// The element types a tensor can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    Bool,
}

/// Type-tagged tensor storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

struct ElementCodec {
    element_type: ElementType,
    name: &'static str,
    width: usize,
    encode: fn(&TensorData, &mut Vec<u8>),
    decode: fn(&[u8]) -> TensorData,
}

macro_rules! le_codec {
    ($variant:ident, $ty:ty, $encode:ident, $decode:ident) => {
        fn $encode(data: &TensorData, out: &mut Vec<u8>) {
            if let TensorData::$variant(values) = data {
                for value in values {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
        }

        fn $decode(bytes: &[u8]) -> TensorData {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            TensorData::$variant(
                bytes
                    .chunks_exact(WIDTH)
                    .map(|chunk| {
                        let mut raw = [0u8; WIDTH];
                        raw.copy_from_slice(chunk);
                        <$ty>::from_le_bytes(raw)
                    })
                    .collect(),
            )
        }
    };
}

le_codec!(F32, f32, encode_f32, decode_f32);
le_codec!(F64, f64, encode_f64, decode_f64);
le_codec!(I8, i8, encode_i8, decode_i8);
le_codec!(I16, i16, encode_i16, decode_i16);
le_codec!(I32, i32, encode_i32, decode_i32);
le_codec!(I64, i64, encode_i64, decode_i64);
le_codec!(U8, u8, encode_u8, decode_u8);

fn encode_bool(data: &TensorData, out: &mut Vec<u8>) {
    if let TensorData::Bool(values) = data {
        out.extend(values.iter().map(|v| u8::from(*v)));
    }
}

fn decode_bool(bytes: &[u8]) -> TensorData {
    TensorData::Bool(bytes.iter().map(|b| *b != 0).collect())
}

// Indexed by `ElementType as usize`.
static CODECS: [ElementCodec; 8] = [
    ElementCodec {
        element_type: ElementType::F32,
        name: "f32",
        width: 4,
        encode: encode_f32,
        decode: decode_f32,
    },
    ElementCodec {
        element_type: ElementType::F64,
        name: "f64",
        width: 8,
        encode: encode_f64,
        decode: decode_f64,
    },
    ElementCodec {
        element_type: ElementType::I8,
        name: "i8",
        width: 1,
        encode: encode_i8,
        decode: decode_i8,
    },
    ElementCodec {
        element_type: ElementType::I16,
        name: "i16",
        width: 2,
        encode: encode_i16,
        decode: decode_i16,
    },
    ElementCodec {
        element_type: ElementType::I32,
        name: "i32",
        width: 4,
        encode: encode_i32,
        decode: decode_i32,
    },
    ElementCodec {
        element_type: ElementType::I64,
        name: "i64",
        width: 8,
        encode: encode_i64,
        decode: decode_i64,
    },
    ElementCodec {
        element_type: ElementType::U8,
        name: "u8",
        width: 1,
        encode: encode_u8,
        decode: decode_u8,
    },
    ElementCodec {
        element_type: ElementType::Bool,
        name: "bool",
        width: 1,
        encode: encode_bool,
        decode: decode_bool,
    },
];

impl ElementType {
    /// Every supported element type, in table order.
    pub const ALL: [ElementType; 8] = [
        ElementType::F32,
        ElementType::F64,
        ElementType::I8,
        ElementType::I16,
        ElementType::I32,
        ElementType::I64,
        ElementType::U8,
        ElementType::Bool,
    ];

    #[inline]
    fn codec(self) -> &'static ElementCodec {
        &CODECS[self as usize]
    }

    /// Size of one element in bytes.
    pub fn byte_width(self) -> usize {
        self.codec().width
    }

    /// The short lowercase name, e.g. `f32`.
    pub fn name(self) -> &'static str {
        self.codec().name
    }

    /// Whether this is a floating point type.
    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for ElementType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CODECS
            .iter()
            .find(|codec| codec.name == s)
            .map(|codec| codec.element_type)
            .ok_or_else(|| TensorError::UnknownElementType(s.to_owned()))
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A Rust scalar type that can be stored in a [`Tensor`].
pub trait Element: Copy + Send + Sync + 'static + sealed::Sealed {
    /// The table entry for this type.
    const ELEMENT_TYPE: ElementType;

    /// Wrap owned values in the matching [`TensorData`] variant.
    fn into_data(values: Vec<Self>) -> TensorData;

    /// Borrow the values if `data` holds this type.
    fn slice(data: &TensorData) -> Option<&[Self]>;
}

macro_rules! element {
    ($ty:ty, $variant:ident) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$variant;

            fn into_data(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }

            fn slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

element!(f32, F32);
element!(f64, F64);
element!(i8, I8);
element!(i16, I16);
element!(i32, I32);
element!(i64, I64);
element!(u8, U8);
element!(bool, Bool);

impl TensorData {
    /// The element type of the stored values.
    pub fn element_type(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::F64(_) => ElementType::F64,
            TensorData::I8(_) => ElementType::I8,
            TensorData::I16(_) => ElementType::I16,
            TensorData::I32(_) => ElementType::I32,
            TensorData::I64(_) => ElementType::I64,
            TensorData::U8(_) => ElementType::U8,
            TensorData::Bool(_) => ElementType::Bool,
        }
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::I16(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build `len` elements of `element_type` from a generator producing
    /// `f64` values, truncated into the target type.
    pub fn from_fn(
        element_type: ElementType,
        len: usize,
        mut f: impl FnMut(usize) -> f64,
    ) -> TensorData {
        match element_type {
            ElementType::F32 => TensorData::F32((0..len).map(|i| f(i) as f32).collect()),
            ElementType::F64 => TensorData::F64((0..len).map(f).collect()),
            ElementType::I8 => TensorData::I8((0..len).map(|i| f(i) as i8).collect()),
            ElementType::I16 => TensorData::I16((0..len).map(|i| f(i) as i16).collect()),
            ElementType::I32 => TensorData::I32((0..len).map(|i| f(i) as i32).collect()),
            ElementType::I64 => TensorData::I64((0..len).map(|i| f(i) as i64).collect()),
            ElementType::U8 => TensorData::U8((0..len).map(|i| f(i) as u8).collect()),
            ElementType::Bool => TensorData::Bool((0..len).map(|i| f(i) != 0.0).collect()),
        }
    }
}

/// Number of elements in a tensor of `shape`.
pub fn element_count(shape: &[usize]) -> Result<usize, TensorError> {
    shape
        .iter()
        .try_fold(1usize, |count, dim| count.checked_mul(*dim))
        .ok_or_else(|| TensorError::ShapeOverflow(shape.to_vec()))
}

#[derive(Deserialize)]
struct TensorRepr {
    shape: Vec<usize>,
    data: TensorData,
}

impl TryFrom<TensorRepr> for Tensor {
    type Error = TensorError;

    fn try_from(repr: TensorRepr) -> Result<Self, Self::Error> {
        Tensor::new(repr.shape, repr.data)
    }
}

/// A dense tensor in row-major order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorRepr")]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Create a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, TensorError> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(TensorError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self { shape, data })
    }

    /// Create a tensor from a vector of scalars.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self, TensorError> {
        Self::new(shape, T::into_data(values))
    }

    /// A rank-0 tensor holding a single value.
    pub fn scalar<T: Element>(value: T) -> Self {
        Self {
            shape: vec![],
            data: T::into_data(vec![value]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the elements as `T`, or `None` if the element type differs.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    /// Size of the payload in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.element_type().byte_width()
    }

    /// Encode the payload as little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        (self.element_type().codec().encode)(&self.data, &mut out);
        out
    }

    /// Decode a little-endian payload into a tensor of `shape`.
    pub fn from_le_bytes(
        element_type: ElementType,
        shape: Vec<usize>,
        bytes: &[u8],
    ) -> Result<Self, TensorError> {
        let codec = element_type.codec();
        if bytes.len() % codec.width != 0 {
            return Err(TensorError::ByteLength {
                element_type,
                len: bytes.len(),
            });
        }

        Self::new(shape, (codec.decode)(bytes))
    }
}

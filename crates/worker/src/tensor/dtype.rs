//! Element types for tensors crossing the process boundary

use super::TensorData;
use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Data type of a tensor's elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl DType {
    /// All supported element types
    pub const ALL: [DType; 10] = [
        DType::Int8,
        DType::Uint8,
        DType::Int16,
        DType::Uint16,
        DType::Int32,
        DType::Uint32,
        DType::Int64,
        DType::Float16,
        DType::Float32,
        DType::Float64,
    ];

    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            DType::Int8 | DType::Uint8 => 1,
            DType::Int16 | DType::Uint16 | DType::Float16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }

    /// Parse from the wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int8" => Some(DType::Int8),
            "uint8" => Some(DType::Uint8),
            "int16" => Some(DType::Int16),
            "uint16" => Some(DType::Uint16),
            "int32" => Some(DType::Int32),
            "uint32" => Some(DType::Uint32),
            "int64" => Some(DType::Int64),
            "float16" => Some(DType::Float16),
            "float32" => Some(DType::Float32),
            "float64" => Some(DType::Float64),
            _ => None,
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Int8 => "int8",
            DType::Uint8 => "uint8",
            DType::Int16 => "int16",
            DType::Uint16 => "uint16",
            DType::Int32 => "int32",
            DType::Uint32 => "uint32",
            DType::Int64 => "int64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// Code stored in segment headers
    pub fn code(&self) -> u8 {
        match self {
            DType::Int8 => 1,
            DType::Uint8 => 2,
            DType::Int16 => 3,
            DType::Uint16 => 4,
            DType::Int32 => 5,
            DType::Uint32 => 6,
            DType::Int64 => 7,
            DType::Float16 => 8,
            DType::Float32 => 9,
            DType::Float64 => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        DType::ALL.iter().copied().find(|dtype| dtype.code() == code)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rust element types a [`super::Tensor`] can hold
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn wrap(values: Vec<Self>) -> TensorData;

    fn view(data: &TensorData) -> Option<&[Self]>;
}

macro_rules! element {
    ($ty:ty, $variant:ident, $dtype:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;

            fn wrap(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }

            fn view(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

element!(i8, I8, Int8);
element!(u8, U8, Uint8);
element!(i16, I16, Int16);
element!(u16, U16, Uint16);
element!(i32, I32, Int32);
element!(u32, U32, Uint32);
element!(i64, I64, Int64);
element!(f16, F16, Float16);
element!(f32, F32, Float32);
element!(f64, F64, Float64);

//! Named tensors exchanged with a model
//!
//! A [`Tensor`] owns its elements in one typed buffer. Output tensors may be
//! created empty (name only) and populated after execution with
//! [`Tensor::set_data`].

pub mod dtype;

pub use dtype::{DType, Element};

use half::f16;
use std::fmt;
use tensorbridge_common::{BridgeError, Result};

/// Tensor shape
pub type Shape = Vec<usize>;

/// Typed element buffer
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Apply `$body` to the vector inside any variant
macro_rules! dispatch {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            TensorData::I8($values) => $body,
            TensorData::U8($values) => $body,
            TensorData::I16($values) => $body,
            TensorData::U16($values) => $body,
            TensorData::I32($values) => $body,
            TensorData::U32($values) => $body,
            TensorData::I64($values) => $body,
            TensorData::F16($values) => $body,
            TensorData::F32($values) => $body,
            TensorData::F64($values) => $body,
        }
    };
}

/// Decode little-endian bytes into a vector of `$ty`
macro_rules! decode_le {
    ($bytes:expr, $ty:ty) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        $bytes
            .chunks_exact(WIDTH)
            .map(|chunk| {
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(chunk);
                <$ty>::from_le_bytes(raw)
            })
            .collect::<Vec<$ty>>()
    }};
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::I8(_) => DType::Int8,
            TensorData::U8(_) => DType::Uint8,
            TensorData::I16(_) => DType::Int16,
            TensorData::U16(_) => DType::Uint16,
            TensorData::I32(_) => DType::Int32,
            TensorData::U32(_) => DType::Uint32,
            TensorData::I64(_) => DType::Int64,
            TensorData::F16(_) => DType::Float16,
            TensorData::F32(_) => DType::Float32,
            TensorData::F64(_) => DType::Float64,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        dispatch!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the little-endian encoding in bytes
    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size()
    }

    /// Write the little-endian encoding into `out`, which must be exactly
    /// [`TensorData::byte_len`] bytes long
    pub fn write_le(&self, out: &mut [u8]) -> Result<()> {
        if out.len() != self.byte_len() {
            return Err(BridgeError::segment(format!(
                "destination holds {} bytes, tensor needs {}",
                out.len(),
                self.byte_len()
            )));
        }
        let width = self.dtype().size();
        dispatch!(self, values => {
            for (slot, value) in out.chunks_exact_mut(width).zip(values.iter()) {
                slot.copy_from_slice(&value.to_le_bytes());
            }
        });
        Ok(())
    }

    /// Decode little-endian bytes of the given dtype
    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % dtype.size() != 0 {
            return Err(BridgeError::protocol(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype
            )));
        }
        Ok(match dtype {
            DType::Int8 => TensorData::I8(decode_le!(bytes, i8)),
            DType::Uint8 => TensorData::U8(bytes.to_vec()),
            DType::Int16 => TensorData::I16(decode_le!(bytes, i16)),
            DType::Uint16 => TensorData::U16(decode_le!(bytes, u16)),
            DType::Int32 => TensorData::I32(decode_le!(bytes, i32)),
            DType::Uint32 => TensorData::U32(decode_le!(bytes, u32)),
            DType::Int64 => TensorData::I64(decode_le!(bytes, i64)),
            DType::Float16 => TensorData::F16(decode_le!(bytes, f16)),
            DType::Float32 => TensorData::F32(decode_le!(bytes, f32)),
            DType::Float64 => TensorData::F64(decode_le!(bytes, f64)),
        })
    }
}

/// Named tensor; `data` is `None` for an output that has not been produced yet
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    name: String,
    shape: Shape,
    data: Option<TensorData>,
}

/// Number of elements described by a shape, `None` on overflow
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
}

fn check_shape(name: &str, shape: &[usize], data: &TensorData) -> Result<()> {
    let expected = element_count(shape).ok_or_else(|| {
        BridgeError::invalid_input(format!("tensor '{}' shape {:?} is too large", name, shape))
    })?;
    if expected != data.len() {
        return Err(BridgeError::invalid_input(format!(
            "tensor '{}' has shape {:?} ({} elements) but {} values",
            name,
            shape,
            expected,
            data.len()
        )));
    }
    Ok(())
}

impl Tensor {
    /// Create a populated tensor from typed values
    pub fn new<T: Element>(name: impl Into<String>, shape: Shape, values: Vec<T>) -> Result<Self> {
        Self::from_data(name, shape, T::wrap(values))
    }

    pub fn from_data(name: impl Into<String>, shape: Shape, data: TensorData) -> Result<Self> {
        let name = name.into();
        check_shape(&name, &shape, &data)?;
        Ok(Self {
            name,
            shape,
            data: Some(data),
        })
    }

    /// Create an empty tensor to receive a model output
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            data: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Option<DType> {
        self.data.as_ref().map(TensorData::dtype)
    }

    pub fn data(&self) -> Option<&TensorData> {
        self.data.as_ref()
    }

    /// Whether the tensor has no data yet
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    /// Typed view of the elements
    pub fn values<T: Element>(&self) -> Option<&[T]> {
        self.data.as_ref().and_then(T::view)
    }

    /// Populate (or replace) shape and data
    pub fn set_data(&mut self, shape: Shape, data: TensorData) -> Result<()> {
        check_shape(&self.name, &shape, &data)?;
        self.shape = shape;
        self.data = Some(data);
        Ok(())
    }

    /// Take shape and data from `other`, keeping this tensor's name
    pub fn fill_from(&mut self, other: Tensor) {
        self.shape = other.shape;
        self.data = other.data;
    }

    /// Same tensor under another name
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Size of the element data in bytes
    pub fn byte_len(&self) -> usize {
        self.data.as_ref().map(TensorData::byte_len).unwrap_or(0)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dtype() {
            Some(dtype) => write!(
                f,
                "Tensor(name={}, shape={:?}, dtype={}, size={})",
                self.name,
                self.shape,
                dtype,
                self.data.as_ref().map(TensorData::len).unwrap_or(0)
            ),
            None => write!(f, "Tensor(name={}, empty)", self.name),
        }
    }
}

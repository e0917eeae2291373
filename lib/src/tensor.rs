// Copyright 2021 The Depot Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Dense tensor payloads in canonical form.
//!
//! A [`Tensor`] owns its element bytes in little-endian, row-major
//! (C-contiguous) order. Inputs that are not in canonical form cannot be
//! constructed; callers normalize before handing data to the engine.

use thiserror::Error;

/// Maximum tensor rank accepted by any schema.
pub const MAX_RANK: usize = 31;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor rank {rank} exceeds maximum of {MAX_RANK}")]
    RankTooLarge { rank: usize },
    #[error("data length {actual} does not match shape/dtype requirement of {expected} bytes")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("unknown dtype code {0}")]
    UnknownDType(u8),
    #[error("malformed canonical tensor bytes: {0}")]
    Malformed(&'static str),
}

/// Element type of a dense tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum DType {
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
    /// One-byte code used in canonical serializations and locators.
    pub fn code(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::I8 => 1,
            Self::U16 => 2,
            Self::I16 => 3,
            Self::U32 => 4,
            Self::I32 => 5,
            Self::U64 => 6,
            Self::I64 => 7,
            Self::F32 => 8,
            Self::F64 => 9,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, TensorError> {
        match code {
            0 => Ok(Self::U8),
            1 => Ok(Self::I8),
            2 => Ok(Self::U16),
            3 => Ok(Self::I16),
            4 => Ok(Self::U32),
            5 => Ok(Self::I32),
            6 => Ok(Self::U64),
            7 => Ok(Self::I64),
            8 => Ok(Self::F32),
            9 => Ok(Self::F64),
            other => Err(TensorError::UnknownDType(other)),
        }
    }

    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/// Rust element types that can populate a [`Tensor`].
pub trait Element: Copy {
    const DTYPE: DType;

    fn write_le_bytes(self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn write_le_bytes(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_element!(u8, DType::U8);
impl_element!(i8, DType::I8);
impl_element!(u16, DType::U16);
impl_element!(i16, DType::I16);
impl_element!(u32, DType::U32);
impl_element!(i32, DType::I32);
impl_element!(u64, DType::U64);
impl_element!(i64, DType::I64);
impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);

fn element_count(shape: &[u64]) -> usize {
    shape.iter().product::<u64>() as usize
}

/// A dense array payload: dtype, shape, and little-endian C-order bytes.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<u64>,
    data: Vec<u8>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype.name())
            .field("shape", &self.shape)
            .field("nbytes", &self.data.len())
            .finish()
    }
}

impl Tensor {
    /// Wraps already-normalized little-endian C-order bytes. The byte length
    /// must match the shape and dtype exactly.
    pub fn from_le_bytes(
        dtype: DType,
        shape: Vec<u64>,
        data: Vec<u8>,
    ) -> Result<Self, TensorError> {
        if shape.len() > MAX_RANK {
            return Err(TensorError::RankTooLarge { rank: shape.len() });
        }
        let expected = element_count(&shape) * dtype.size_of();
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// An all-zeros tensor of the given dtype and shape.
    pub fn zeros(dtype: DType, shape: &[u64]) -> Self {
        assert!(shape.len() <= MAX_RANK);
        let nbytes = element_count(shape) * dtype.size_of();
        Self {
            dtype,
            shape: shape.to_vec(),
            data: vec![0; nbytes],
        }
    }

    /// Builds a tensor from typed elements in row-major order.
    pub fn from_elements<T: Element>(shape: &[u64], elements: &[T]) -> Result<Self, TensorError> {
        if shape.len() > MAX_RANK {
            return Err(TensorError::RankTooLarge { rank: shape.len() });
        }
        if elements.len() != element_count(shape) {
            return Err(TensorError::LengthMismatch {
                expected: element_count(shape) * T::DTYPE.size_of(),
                actual: elements.len() * T::DTYPE.size_of(),
            });
        }
        let mut data = Vec::with_capacity(elements.len() * T::DTYPE.size_of());
        for element in elements {
            element.write_le_bytes(&mut data);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Element bytes, little-endian, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Canonical serialization: dtype code, rank, per-axis extents as u64
    /// little-endian, then element bytes. This is both the hash input and
    /// the wire form.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.shape.len() * 8 + self.data.len());
        out.push(self.dtype.code());
        out.push(self.shape.len() as u8);
        for extent in &self.shape {
            out.extend_from_slice(&extent.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses the canonical serialization produced by [`canonical_bytes`].
    ///
    /// [`canonical_bytes`]: Self::canonical_bytes
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, TensorError> {
        let [dtype_code, rank, rest @ ..] = bytes else {
            return Err(TensorError::Malformed("missing header"));
        };
        let dtype = DType::from_code(*dtype_code)?;
        let rank = usize::from(*rank);
        if rank > MAX_RANK {
            return Err(TensorError::RankTooLarge { rank });
        }
        if rest.len() < rank * 8 {
            return Err(TensorError::Malformed("truncated shape"));
        }
        let (shape_bytes, data) = rest.split_at(rank * 8);
        let shape = shape_bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Self::from_le_bytes(dtype, shape, data.to_vec())
    }
}

/// A sample payload routed to a backend by its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Array(Tensor),
    Str(String),
    Bytes(Vec<u8>),
}

/// Discriminant of [`Payload`], also the declared kind of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PayloadKind {
    Array,
    Str,
    Bytes,
}

impl PayloadKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Array => 0,
            Self::Str => 1,
            Self::Bytes => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, TensorError> {
        match code {
            0 => Ok(Self::Array),
            1 => Ok(Self::Str),
            2 => Ok(Self::Bytes),
            other => Err(TensorError::UnknownDType(other)),
        }
    }
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Array(_) => PayloadKind::Array,
            Self::Str(_) => PayloadKind::Str,
            Self::Bytes(_) => PayloadKind::Bytes,
        }
    }

    /// Canonical bytes of the payload, the digest input for its kind.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Self::Array(tensor) => tensor.canonical_bytes(),
            Self::Str(s) => s.as_bytes().to_vec(),
            Self::Bytes(b) => b.clone(),
        }
    }

    /// Reconstructs a payload of the given kind from its canonical bytes.
    pub fn from_canonical_bytes(kind: PayloadKind, bytes: &[u8]) -> Result<Self, TensorError> {
        match kind {
            PayloadKind::Array => Ok(Self::Array(Tensor::from_canonical_bytes(bytes)?)),
            PayloadKind::Str => String::from_utf8(bytes.to_vec())
                .map(Self::Str)
                .map_err(|_| TensorError::Malformed("string payload is not UTF-8")),
            PayloadKind::Bytes => Ok(Self::Bytes(bytes.to_vec())),
        }
    }

    pub fn nbytes(&self) -> usize {
        match self {
            Self::Array(tensor) => tensor.nbytes(),
            Self::Str(s) => s.len(),
            Self::Bytes(b) => b.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_from_elements_roundtrip() {
        let tensor = Tensor::from_elements(&[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(tensor.dtype(), DType::F32);
        assert_eq!(tensor.shape(), &[2, 3]);
        assert_eq!(tensor.nbytes(), 24);

        let parsed = Tensor::from_canonical_bytes(&tensor.canonical_bytes()).unwrap();
        assert_eq!(parsed, tensor);
    }

    #[test]
    fn test_zero_rank_scalar() {
        let scalar = Tensor::from_elements(&[], &[42i64]).unwrap();
        assert_eq!(scalar.rank(), 0);
        assert_eq!(scalar.nbytes(), 8);
        let parsed = Tensor::from_canonical_bytes(&scalar.canonical_bytes()).unwrap();
        assert_eq!(parsed, scalar);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert_matches!(
            Tensor::from_elements(&[5, 7], &[0.0f64; 34]),
            Err(TensorError::LengthMismatch { .. })
        );
        assert_matches!(
            Tensor::from_le_bytes(DType::U16, vec![3], vec![0; 5]),
            Err(TensorError::LengthMismatch {
                expected: 6,
                actual: 5
            })
        );
    }

    #[test]
    fn test_rank_limit() {
        let shape = vec![1u64; MAX_RANK + 1];
        assert_matches!(
            Tensor::from_le_bytes(DType::U8, shape, vec![0]),
            Err(TensorError::RankTooLarge { .. })
        );
    }

    #[test]
    fn test_payload_canonical_roundtrip() {
        let payload = Payload::Str("hello world".to_string());
        let bytes = payload.canonical_bytes();
        assert_eq!(
            Payload::from_canonical_bytes(PayloadKind::Str, &bytes).unwrap(),
            payload
        );

        let payload = Payload::Bytes(vec![0, 1, 2, 255]);
        let bytes = payload.canonical_bytes();
        assert_eq!(
            Payload::from_canonical_bytes(PayloadKind::Bytes, &bytes).unwrap(),
            payload
        );
    }
}

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

//! Frozen arrayset schemas.
//!
//! A schema fixes the payload kind of an arrayset, and for dense arrays the
//! element type, rank, and maximum per-axis extents. Identical schemas share
//! one digest across arraysets and repositories.

use std::collections::BTreeMap;

use prost::Message as _;
use thiserror::Error;

use crate::backend::BackendCode;
use crate::content_hash;
use crate::content_hash::SchemaId;
use crate::protos::records as proto;
use crate::tensor::DType;
use crate::tensor::MAX_RANK;
use crate::tensor::Payload;
use crate::tensor::PayloadKind;
use crate::tensor::Tensor;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema rank {rank} exceeds maximum of {MAX_RANK}")]
    RankTooLarge { rank: usize },
    #[error("schema axis extents must be positive")]
    ZeroExtent,
    #[error("payload kind {actual:?} does not match schema kind {expected:?}")]
    KindMismatch {
        expected: PayloadKind,
        actual: PayloadKind,
    },
    #[error("data dtype {actual} != schema dtype {expected}")]
    DTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("data rank {actual} != schema rank {expected}")]
    RankMismatch { expected: usize, actual: usize },
    #[error("data shape {actual:?} != fixed schema shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<u64>,
        actual: Vec<u64>,
    },
    #[error("data axis {axis} extent {actual} exceeds schema max {max}")]
    AxisTooLarge { axis: usize, actual: u64, max: u64 },
    #[error("could not decode schema blob")]
    Decode(#[from] prost::DecodeError),
    #[error("schema blob is malformed: {0}")]
    Malformed(String),
}

/// Frozen description of an arrayset's contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    kind: PayloadKind,
    dtype: DType,
    shape: Vec<u64>,
    variable_shape: bool,
    backend: BackendCode,
    backend_opts: BTreeMap<String, String>,
}

impl Schema {
    /// Schema for dense arrays of `dtype` bounded by `shape`. With
    /// `variable_shape`, samples may be smaller along any axis but must keep
    /// the rank.
    pub fn array(dtype: DType, shape: Vec<u64>, variable_shape: bool) -> Result<Self, SchemaError> {
        if shape.len() > MAX_RANK {
            return Err(SchemaError::RankTooLarge { rank: shape.len() });
        }
        if shape.contains(&0) {
            return Err(SchemaError::ZeroExtent);
        }
        Ok(Self {
            kind: PayloadKind::Array,
            dtype,
            shape,
            variable_shape,
            backend: BackendCode::FS_ARRAY,
            backend_opts: BTreeMap::new(),
        })
    }

    /// Schema for string samples.
    pub fn string() -> Self {
        Self {
            kind: PayloadKind::Str,
            dtype: DType::U8,
            shape: vec![],
            variable_shape: true,
            backend: BackendCode::KV_STR,
            backend_opts: BTreeMap::new(),
        }
    }

    /// Schema for raw bytes samples.
    pub fn bytes() -> Self {
        Self {
            kind: PayloadKind::Bytes,
            dtype: DType::U8,
            shape: vec![],
            variable_shape: true,
            backend: BackendCode::KV_BYTES,
            backend_opts: BTreeMap::new(),
        }
    }

    /// Schema describing an already-validated payload, used to route data
    /// arriving over the wire to its default backend.
    pub(crate) fn for_payload(payload: &Payload) -> Self {
        match payload {
            Payload::Array(tensor) => Self {
                kind: PayloadKind::Array,
                dtype: tensor.dtype(),
                shape: tensor.shape().to_vec(),
                variable_shape: true,
                backend: BackendCode::FS_ARRAY,
                backend_opts: BTreeMap::new(),
            },
            Payload::Str(_) => Self::string(),
            Payload::Bytes(_) => Self::bytes(),
        }
    }

    /// Overrides the default backend selection.
    pub fn with_backend(
        mut self,
        backend: BackendCode,
        opts: BTreeMap<String, String>,
    ) -> Self {
        self.backend = backend;
        self.backend_opts = opts;
        self
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Maximum per-axis extents (exact extents when not variable).
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn variable_shape(&self) -> bool {
        self.variable_shape
    }

    pub fn backend(&self) -> BackendCode {
        self.backend
    }

    pub fn backend_opts(&self) -> &BTreeMap<String, String> {
        &self.backend_opts
    }

    /// Digest of the canonical schema blob.
    pub fn digest(&self) -> SchemaId {
        content_hash::schema_digest(&self.to_blob())
    }

    /// Canonical serialization; `backend_opts` iterate sorted so the blob is
    /// deterministic.
    pub fn to_blob(&self) -> Vec<u8> {
        proto::SchemaBlob {
            kind: u32::from(self.kind.code()),
            dtype: u32::from(self.dtype.code()),
            shape: self.shape.clone(),
            variable_shape: self.variable_shape,
            backend: self.backend.as_str().to_string(),
            backend_opts: self
                .backend_opts
                .iter()
                .map(|(key, value)| proto::SchemaOption {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
        .encode_to_vec()
    }

    pub fn from_blob(bytes: &[u8]) -> Result<Self, SchemaError> {
        let blob = proto::SchemaBlob::decode(bytes)?;
        let kind = PayloadKind::from_code(blob.kind as u8)
            .map_err(|err| SchemaError::Malformed(err.to_string()))?;
        let dtype = DType::from_code(blob.dtype as u8)
            .map_err(|err| SchemaError::Malformed(err.to_string()))?;
        let backend = BackendCode::parse(&blob.backend)
            .map_err(|err| SchemaError::Malformed(err.to_string()))?;
        Ok(Self {
            kind,
            dtype,
            shape: blob.shape,
            variable_shape: blob.variable_shape,
            backend,
            backend_opts: blob
                .backend_opts
                .into_iter()
                .map(|opt| (opt.key, opt.value))
                .collect(),
        })
    }

    /// Checks a payload against this schema. Rejection never mutates any
    /// arrayset state; callers validate before writing.
    pub fn validate(&self, payload: &Payload) -> Result<(), SchemaError> {
        if payload.kind() != self.kind {
            return Err(SchemaError::KindMismatch {
                expected: self.kind,
                actual: payload.kind(),
            });
        }
        if let Payload::Array(tensor) = payload {
            self.validate_tensor(tensor)?;
        }
        Ok(())
    }

    fn validate_tensor(&self, tensor: &Tensor) -> Result<(), SchemaError> {
        if tensor.dtype() != self.dtype {
            return Err(SchemaError::DTypeMismatch {
                expected: self.dtype.name(),
                actual: tensor.dtype().name(),
            });
        }
        if tensor.rank() != self.shape.len() {
            return Err(SchemaError::RankMismatch {
                expected: self.shape.len(),
                actual: tensor.rank(),
            });
        }
        if self.variable_shape {
            for (axis, (&actual, &max)) in tensor.shape().iter().zip(&self.shape).enumerate() {
                if actual > max {
                    return Err(SchemaError::AxisTooLarge { axis, actual, max });
                }
            }
        } else if tensor.shape() != self.shape {
            return Err(SchemaError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: tensor.shape().to_vec(),
            });
        }
        Ok(())
    }
}

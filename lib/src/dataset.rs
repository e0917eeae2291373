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

//! Dataset adapter: projects aligned samples across several arraysets.
//!
//! Sample `i` is the tuple of payloads at the `i`-th key across every
//! arrayset. The adapter is read-only and stateless beyond its arrayset
//! references; batching, shuffling, and parallel loading belong to the
//! consuming framework.

use thiserror::Error;

use crate::arrayset::ArraysetError;
use crate::arrayset::ArraysetView;
use crate::sample_key::SampleKey;
use crate::tensor::Payload;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("a dataset needs at least one arrayset")]
    Empty,
    #[error("key {key} is missing from arrayset {arrayset}")]
    KeyMissing { arrayset: String, key: String },
    #[error("index {index} is out of bounds for dataset of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error(transparent)]
    Arrayset(#[from] ArraysetError),
}

/// Indexable projection of aligned samples.
#[derive(Debug)]
pub struct Dataset<'a> {
    columns: Vec<&'a ArraysetView>,
    keys: Vec<SampleKey>,
}

impl<'a> Dataset<'a> {
    /// Builds a dataset over `columns`. With no explicit key list, the first
    /// arrayset's keys are used; every key must exist in every arrayset.
    pub fn new(
        columns: Vec<&'a ArraysetView>,
        keys: Option<Vec<SampleKey>>,
    ) -> Result<Self, DatasetError> {
        let first = columns.first().ok_or(DatasetError::Empty)?;
        let keys = keys.unwrap_or_else(|| first.keys().cloned().collect());
        for column in &columns {
            for key in &keys {
                if !column.contains_key(key) {
                    return Err(DatasetError::KeyMissing {
                        arrayset: column.name().to_string(),
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(Self { columns, keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[SampleKey] {
        &self.keys
    }

    fn key_at(&self, index: usize) -> Result<&SampleKey, DatasetError> {
        self.keys
            .get(index)
            .ok_or(DatasetError::IndexOutOfBounds {
                index,
                len: self.keys.len(),
            })
    }

    /// The tuple of payloads at aligned index `i`.
    pub fn get(&self, index: usize) -> Result<Vec<Payload>, DatasetError> {
        let key = self.key_at(index)?;
        self.columns
            .iter()
            .map(|column| column.get(key).map_err(DatasetError::from))
            .collect()
    }

    /// Like [`get`] but pairs each payload with its arrayset name.
    ///
    /// [`get`]: Self::get
    pub fn get_record(&self, index: usize) -> Result<Vec<(String, Payload)>, DatasetError> {
        let key = self.key_at(index)?;
        self.columns
            .iter()
            .map(|column| {
                column
                    .get(key)
                    .map(|payload| (column.name().to_string(), payload))
                    .map_err(DatasetError::from)
            })
            .collect()
    }
}

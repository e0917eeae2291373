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

//! Metadata (label) access, versioned alongside arraysets.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::sample_key::KeyError;
use crate::sample_key::SampleKey;
use crate::staging::StagingArea;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("no metadata entry for key {0}")]
    KeyNotFound(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Immutable metadata mapping of a pinned commit.
#[derive(Debug, Clone, Default)]
pub struct MetadataView {
    entries: BTreeMap<SampleKey, String>,
}

impl MetadataView {
    pub(crate) fn new(entries: BTreeMap<SampleKey, String>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &SampleKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &SampleKey) -> Result<&str, MetadataError> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| MetadataError::KeyNotFound(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &SampleKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SampleKey, &str)> {
        self.entries.iter().map(|(key, value)| (key, value.as_str()))
    }
}

/// Mutable metadata handle of the writer checkout.
pub struct MetadataWriter<'a> {
    staging: &'a StagingArea,
}

impl<'a> MetadataWriter<'a> {
    pub(crate) fn new(staging: &'a StagingArea) -> Self {
        Self { staging }
    }

    fn entries(&self) -> Result<BTreeMap<SampleKey, String>, MetadataError> {
        Ok(self.staging.contents()?.metadata)
    }

    pub fn len(&self) -> Result<usize, MetadataError> {
        Ok(self.entries()?.len())
    }

    pub fn get(&self, key: &SampleKey) -> Result<String, MetadataError> {
        self.entries()?
            .remove(key)
            .ok_or_else(|| MetadataError::KeyNotFound(key.to_string()))
    }

    pub fn contains_key(&self, key: &SampleKey) -> Result<bool, MetadataError> {
        Ok(self.entries()?.contains_key(key))
    }

    pub fn keys(&self) -> Result<Vec<SampleKey>, MetadataError> {
        Ok(self.entries()?.into_keys().collect())
    }

    pub fn set(&self, key: SampleKey, value: impl Into<String>) -> Result<(), MetadataError> {
        self.staging.put_metadata(&key, &value.into())?;
        Ok(())
    }

    pub fn delete(&self, key: &SampleKey) -> Result<(), MetadataError> {
        if !self.contains_key(key)? {
            return Err(MetadataError::KeyNotFound(key.to_string()));
        }
        self.staging.remove_metadata(key)?;
        Ok(())
    }

    /// Bulk set; later entries win on duplicate keys.
    pub fn update(
        &self,
        entries: impl IntoIterator<Item = (SampleKey, String)>,
    ) -> Result<(), MetadataError> {
        for (key, value) in entries {
            self.staging.put_metadata(&key, &value)?;
        }
        Ok(())
    }
}

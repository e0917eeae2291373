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

//! Arrayset views over a checkout.
//!
//! [`ArraysetView`] is the read surface shared by reader and writer
//! checkouts; [`ArraysetWriter`] adds the mutation surface and stages every
//! change through the writer checkout's staging area.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use rand::Rng as _;
use thiserror::Error;

use crate::backend::BackendCode;
use crate::content_hash::DataId;
use crate::sample_key::KeyError;
use crate::sample_key::SampleKey;
use crate::schema::Schema;
use crate::schema::SchemaError;
use crate::staging::StagingArea;
use crate::store::Store;
use crate::store::StoreError;
use crate::tensor::Payload;

#[derive(Debug, Error)]
pub enum ArraysetError {
    #[error("no sample {key} in arrayset {arrayset}")]
    KeyNotFound { arrayset: String, key: String },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-only view of one arrayset, pinned to a commit's sample map.
#[derive(Debug, Clone)]
pub struct ArraysetView {
    store: Weak<Store>,
    name: String,
    schema: Schema,
    samples: BTreeMap<SampleKey, DataId>,
}

impl ArraysetView {
    pub(crate) fn new(
        store: &Arc<Store>,
        name: String,
        schema: Schema,
        samples: BTreeMap<SampleKey, DataId>,
    ) -> Self {
        Self {
            store: Arc::downgrade(store),
            name,
            schema,
            samples,
        }
    }

    fn store(&self) -> Result<Arc<Store>, StoreError> {
        self.store.upgrade().ok_or(StoreError::RepositoryClosed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn contains_key(&self, key: &SampleKey) -> bool {
        self.samples.contains_key(key)
    }

    /// Sample keys in canonical order (integers first).
    pub fn keys(&self) -> impl Iterator<Item = &SampleKey> {
        self.samples.keys()
    }

    pub fn digest_for(&self, key: &SampleKey) -> Option<&DataId> {
        self.samples.get(key)
    }

    /// Resolves a sample payload: key mapping, then hash index, then backend.
    pub fn get(&self, key: &SampleKey) -> Result<Payload, ArraysetError> {
        let digest = self.samples.get(key).ok_or_else(|| {
            ArraysetError::KeyNotFound {
                arrayset: self.name.clone(),
                key: key.to_string(),
            }
        })?;
        Ok(self.store()?.read_payload(digest)?)
    }

    /// Whether any sample's digest resolves to a not-yet-fetched remote
    /// placeholder.
    pub fn contains_remote_references(&self) -> Result<bool, ArraysetError> {
        Ok(!self.remote_sample_keys()?.is_empty())
    }

    /// Keys whose payloads still live on a remote peer.
    pub fn remote_sample_keys(&self) -> Result<Vec<SampleKey>, ArraysetError> {
        let store = self.store()?;
        let mut keys = vec![];
        for (key, digest) in &self.samples {
            if let Some(locator) = store.locator_for(digest)?
                && locator.code() == BackendCode::REMOTE
            {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }
}

/// Input accepted by [`ArraysetWriter::update`]: a mapping, or a sequence of
/// key/value pairs (right-wins on duplicates).
#[derive(Debug)]
pub enum UpdateSource {
    Pairs(Vec<(SampleKey, Payload)>),
    Map(BTreeMap<SampleKey, Payload>),
}

impl From<Vec<(SampleKey, Payload)>> for UpdateSource {
    fn from(pairs: Vec<(SampleKey, Payload)>) -> Self {
        Self::Pairs(pairs)
    }
}

impl From<BTreeMap<SampleKey, Payload>> for UpdateSource {
    fn from(map: BTreeMap<SampleKey, Payload>) -> Self {
        Self::Map(map)
    }
}

impl UpdateSource {
    fn into_pairs(self) -> Vec<(SampleKey, Payload)> {
        match self {
            Self::Pairs(pairs) => pairs,
            Self::Map(map) => map.into_iter().collect(),
        }
    }
}

/// Mutable handle to one arrayset inside the writer checkout.
#[derive(Debug)]
pub struct ArraysetWriter<'a> {
    staging: &'a StagingArea,
    name: String,
    schema: Schema,
}

impl<'a> ArraysetWriter<'a> {
    pub(crate) fn new(staging: &'a StagingArea, name: String, schema: Schema) -> Self {
        Self {
            staging,
            name,
            schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Snapshot of the current staged sample map.
    fn samples(&self) -> Result<BTreeMap<SampleKey, DataId>, ArraysetError> {
        let contents = self.staging.contents()?;
        Ok(contents
            .arraysets
            .get(&self.name)
            .map(|aset| aset.samples.clone())
            .unwrap_or_default())
    }

    pub fn len(&self) -> Result<usize, ArraysetError> {
        Ok(self.samples()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, ArraysetError> {
        Ok(self.samples()?.is_empty())
    }

    pub fn contains_key(&self, key: &SampleKey) -> Result<bool, ArraysetError> {
        Ok(self.samples()?.contains_key(key))
    }

    /// Keys staged at the time of the call. Keys inserted afterwards appear
    /// in a later snapshot; a key never appears before its sample exists.
    pub fn keys(&self) -> Result<Vec<SampleKey>, ArraysetError> {
        Ok(self.samples()?.into_keys().collect())
    }

    pub fn get(&self, key: &SampleKey) -> Result<Payload, ArraysetError> {
        let samples = self.samples()?;
        let digest = samples.get(key).ok_or_else(|| ArraysetError::KeyNotFound {
            arrayset: self.name.clone(),
            key: key.to_string(),
        })?;
        Ok(self.staging.store()?.read_payload(digest)?)
    }

    pub fn digest_for(&self, key: &SampleKey) -> Result<Option<DataId>, ArraysetError> {
        Ok(self.samples()?.get(key).cloned())
    }

    /// Validates, deduplicates, stores, and stages one sample.
    pub fn set(&self, key: SampleKey, value: Payload) -> Result<(), ArraysetError> {
        self.schema.validate(&value)?;
        let digest = self.write_payload(&value)?;
        self.staging.put_sample(&self.name, &key, &digest)?;
        Ok(())
    }

    fn write_payload(&self, value: &Payload) -> Result<DataId, ArraysetError> {
        Ok(self.staging.store()?.write_payload(value, &self.schema)?)
    }

    /// Stores a sample under a generated unique string key and returns it.
    pub fn append(&self, value: Payload) -> Result<SampleKey, ArraysetError> {
        self.schema.validate(&value)?;
        let samples = self.samples()?;
        let mut rng = rand::rng();
        let key = loop {
            let bytes: [u8; 8] = rng.random();
            let candidate = SampleKey::str(crate::hex_util::encode_hex(&bytes))?;
            if !samples.contains_key(&candidate) {
                break candidate;
            }
        };
        self.set(key.clone(), value)?;
        Ok(key)
    }

    /// Removes the key mapping. The payload itself stays in its backend
    /// until garbage collection.
    pub fn delete(&self, key: &SampleKey) -> Result<(), ArraysetError> {
        if !self.contains_key(key)? {
            return Err(ArraysetError::KeyNotFound {
                arrayset: self.name.clone(),
                key: key.to_string(),
            });
        }
        self.staging.remove_sample(&self.name, key)?;
        Ok(())
    }

    /// Bulk set with dict-update semantics: every entry is validated before
    /// the first mutation is applied, so a malformed input leaves the
    /// arrayset untouched. Later entries win on duplicate keys.
    pub fn update(&self, source: impl Into<UpdateSource>) -> Result<(), ArraysetError> {
        let pairs = source.into().into_pairs();
        for (_, value) in &pairs {
            self.schema.validate(value)?;
        }
        for (key, value) in pairs {
            let digest = self.write_payload(&value)?;
            self.staging.put_sample(&self.name, &key, &digest)?;
        }
        Ok(())
    }

    pub fn contains_remote_references(&self) -> Result<bool, ArraysetError> {
        Ok(!self.remote_sample_keys()?.is_empty())
    }

    pub fn remote_sample_keys(&self) -> Result<Vec<SampleKey>, ArraysetError> {
        let store = self.staging.store()?;
        let mut keys = vec![];
        for (key, digest) in self.samples()? {
            if let Some(locator) = store.locator_for(&digest)?
                && locator.code() == BackendCode::REMOTE
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

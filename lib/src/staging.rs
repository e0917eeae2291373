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

//! The staging area of a writer checkout.
//!
//! Staged arrayset records live in `stagenv`, staged metadata in `labelenv`.
//! On open the staging databases are seeded from the parent commit's ref
//! blob; mutations accumulate as individual records and a commit packs them
//! back into a canonical ref blob.

use std::sync::Arc;
use std::sync::Weak;

use thiserror::Error;

use crate::branch;
use crate::branch::BranchError;
use crate::commit::CommitSpec;
use crate::commit::commit_id_for;
use crate::content_hash::CommitId;
use crate::content_hash::DataId;
use crate::content_hash::SchemaId;
use crate::kv::KvWriteBatch;
use crate::object_id::ObjectId as _;
use crate::records;
use crate::records::ArraysetContents;
use crate::records::CommitContents;
use crate::store::Store;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("no changes have been staged")]
    NothingToCommit,
    #[error(transparent)]
    Branch(#[from] BranchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Uncommitted mutation buffer of the single writer checkout.
///
/// Holds a non-owning reference to the store; once the repository is closed
/// every operation fails with [`StoreError::RepositoryClosed`].
#[derive(Debug)]
pub struct StagingArea {
    store: Weak<Store>,
    parent: Option<CommitId>,
}

impl StagingArea {
    /// Opens the staging area against the parent commit. A staging database
    /// left dirty by an earlier writer resumes as-is; otherwise it is seeded
    /// from the parent's ref blob.
    pub fn open(store: &Arc<Store>, parent: Option<CommitId>) -> Result<Self, StoreError> {
        let staging = Self {
            store: Arc::downgrade(store),
            parent,
        };
        let stage_empty = store
            .envs()
            .stagenv
            .scan_prefix(records::STAGE_PREFIX)?
            .is_empty();
        if stage_empty && !staging.is_dirty()? {
            staging.reset_to_parent()?;
        }
        Ok(staging)
    }

    pub fn parent(&self) -> Option<&CommitId> {
        self.parent.as_ref()
    }

    pub fn store(&self) -> Result<Arc<Store>, StoreError> {
        self.store.upgrade().ok_or(StoreError::RepositoryClosed)
    }

    /// Whether any mutation was staged since the last commit.
    pub fn is_dirty(&self) -> Result<bool, StoreError> {
        Ok(self
            .store()?
            .envs()
            .stagenv
            .contains(records::STAGE_DIRTY_KEY)?)
    }

    fn mark_dirty(&self) -> Result<(), StoreError> {
        Ok(self
            .store()?
            .envs()
            .stagenv
            .put(records::STAGE_DIRTY_KEY, b"1")?)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let store = self.store()?;
        let envs = store.envs();
        let mut batch = KvWriteBatch::default();
        for (key, _) in envs.stagenv.scan_prefix(records::STAGE_PREFIX)? {
            batch.delete(&key);
        }
        batch.delete(records::STAGE_DIRTY_KEY);
        envs.stagenv.write(batch)?;

        let mut batch = KvWriteBatch::default();
        for (key, _) in envs.labelenv.scan_prefix(records::LABEL_PREFIX)? {
            batch.delete(&key);
        }
        envs.labelenv.write(batch)?;
        Ok(())
    }

    fn seed(&self, contents: &CommitContents) -> Result<(), StoreError> {
        let store = self.store()?;
        let envs = store.envs();
        let mut batch = KvWriteBatch::default();
        for (name, aset) in &contents.arraysets {
            batch.put(&records::stage_schema_key(name), aset.schema.as_bytes());
            for (key, digest) in &aset.samples {
                batch.put(&records::stage_sample_key(name, key), digest.as_bytes());
            }
        }
        envs.stagenv.write(batch)?;

        let mut batch = KvWriteBatch::default();
        for (key, value) in &contents.metadata {
            batch.put(&records::label_key(key), value.as_bytes());
        }
        envs.labelenv.write(batch)?;
        Ok(())
    }

    fn reset_to_parent(&self) -> Result<(), StoreError> {
        self.clear()?;
        if let Some(parent) = &self.parent {
            let contents = self.store()?.read_commit_contents(parent)?;
            self.seed(&contents)?;
        }
        Ok(())
    }

    /// Reconstructs the full staged state from the staging databases.
    pub fn contents(&self) -> Result<CommitContents, StoreError> {
        let store = self.store()?;
        let envs = store.envs();
        let mut contents = CommitContents::default();
        for (key, value) in envs.stagenv.scan_prefix(records::STAGE_PREFIX)? {
            let (name, sample) = records::parse_stage_key(&key)?;
            match sample {
                None => {
                    contents.arraysets.entry(name).or_insert_with(|| {
                        ArraysetContents {
                            schema: SchemaId::from_bytes(&value),
                            samples: Default::default(),
                        }
                    });
                }
                Some(sample_key) => {
                    // Schema records order before their samples within the
                    // arrayset prefix, so the entry always exists.
                    if let Some(aset) = contents.arraysets.get_mut(&name) {
                        aset.samples.insert(sample_key, DataId::from_bytes(&value));
                    }
                }
            }
        }
        for (key, value) in envs.labelenv.scan_prefix(records::LABEL_PREFIX)? {
            let sample_key = crate::sample_key::SampleKey::from_db_bytes(
                &key[records::LABEL_PREFIX.len()..],
            )
            .map_err(records::RecordError::from)?;
            let value = String::from_utf8(value)
                .map_err(|_| records::RecordError::Malformed("metadata value is not UTF-8"))?;
            contents.metadata.insert(sample_key, value);
        }
        Ok(contents)
    }

    // ---- mutators ----

    pub fn has_arrayset(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .store()?
            .envs()
            .stagenv
            .contains(&records::stage_schema_key(name))?)
    }

    pub fn put_arrayset(&self, name: &str, schema: &SchemaId) -> Result<(), StoreError> {
        self.store()?
            .envs()
            .stagenv
            .put(&records::stage_schema_key(name), schema.as_bytes())?;
        self.mark_dirty()
    }

    pub fn remove_arrayset(&self, name: &str) -> Result<(), StoreError> {
        let store = self.store()?;
        let envs = store.envs();
        let mut batch = KvWriteBatch::default();
        for (key, _) in envs.stagenv.scan_prefix(&records::stage_arrayset_prefix(name))? {
            batch.delete(&key);
        }
        envs.stagenv.write(batch)?;
        self.mark_dirty()
    }

    pub fn put_sample(
        &self,
        arrayset: &str,
        key: &crate::sample_key::SampleKey,
        digest: &DataId,
    ) -> Result<(), StoreError> {
        self.store()?
            .envs()
            .stagenv
            .put(&records::stage_sample_key(arrayset, key), digest.as_bytes())?;
        self.mark_dirty()
    }

    pub fn remove_sample(
        &self,
        arrayset: &str,
        key: &crate::sample_key::SampleKey,
    ) -> Result<(), StoreError> {
        self.store()?
            .envs()
            .stagenv
            .delete(&records::stage_sample_key(arrayset, key))?;
        self.mark_dirty()
    }

    pub fn put_metadata(
        &self,
        key: &crate::sample_key::SampleKey,
        value: &str,
    ) -> Result<(), StoreError> {
        self.store()?
            .envs()
            .labelenv
            .put(&records::label_key(key), value.as_bytes())?;
        self.mark_dirty()
    }

    pub fn remove_metadata(&self, key: &crate::sample_key::SampleKey) -> Result<(), StoreError> {
        self.store()?
            .envs()
            .labelenv
            .delete(&records::label_key(key))?;
        self.mark_dirty()
    }

    /// Packs the staged state into a commit and advances the branch head.
    ///
    /// Fails with [`CommitError::NothingToCommit`] when no mutation was
    /// staged. Producing a commit whose digest already exists is idempotent:
    /// the existing digest is returned and no record is rewritten.
    pub fn commit(
        &mut self,
        branch: &str,
        spec: &CommitSpec,
    ) -> Result<CommitId, CommitError> {
        if !self.is_dirty()? {
            return Err(CommitError::NothingToCommit);
        }
        let store = self.store()?;
        let contents = self.contents()?;
        let ref_blob = contents.to_ref_blob();
        let parents: Vec<CommitId> = self.parent.iter().cloned().collect();
        let id = commit_id_for(&parents, spec, &ref_blob);

        let fresh =
            store.write_commit_records(&id, &parents, &spec.to_bytes(), &ref_blob)?;
        if fresh {
            tracing::info!(commit = %id.hex(), branch, "created commit");
        }
        branch::set_branch_head(store.as_ref(), branch, &id, false)?;

        self.parent = Some(id.clone());
        self.clear()?;
        self.seed(&contents)?;
        Ok(id)
    }
}

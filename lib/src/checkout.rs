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

//! Checkouts: materialized views over a commit or the staging area.
//!
//! A [`ReaderCheckout`] is an immutable view pinned to a commit digest. The
//! [`WriterCheckout`] is exclusive per repository and is the only path to
//! mutation; dropping it releases the writer lease and the on-disk lock on
//! every exit path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use thiserror::Error;

use crate::arrayset::ArraysetError;
use crate::arrayset::ArraysetView;
use crate::arrayset::ArraysetWriter;
use crate::commit::Commit;
use crate::commit::CommitSpec;
use crate::commit::Signature;
use crate::commit::Timestamp;
use crate::content_hash::CommitId;
use crate::lock::FileLock;
use crate::metadata::MetadataError;
use crate::metadata::MetadataView;
use crate::metadata::MetadataWriter;
use crate::repo::RepoInner;
use crate::sample_key;
use crate::sample_key::KeyError;
use crate::schema::Schema;
use crate::staging::CommitError;
use crate::staging::StagingArea;
use crate::store::Store;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("arrayset {0} does not exist in this checkout")]
    ArraysetNotFound(String),
    #[error("arrayset {0} already exists")]
    ArraysetExists(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Arrayset(#[from] ArraysetError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-only view pinned to one commit.
#[derive(Debug)]
pub struct ReaderCheckout {
    commit: Commit,
    arraysets: BTreeMap<String, ArraysetView>,
    metadata: MetadataView,
}

impl ReaderCheckout {
    pub(crate) fn open(store: &Arc<Store>, commit: Commit) -> Result<Self, CheckoutError> {
        let contents = store.read_commit_contents(&commit.id)?;
        let mut arraysets = BTreeMap::new();
        for (name, aset) in contents.arraysets {
            let schema = store.get_schema(&aset.schema)?;
            arraysets.insert(
                name.clone(),
                ArraysetView::new(store, name, schema, aset.samples),
            );
        }
        Ok(Self {
            commit,
            arraysets,
            metadata: MetadataView::new(contents.metadata),
        })
    }

    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    pub fn commit_id(&self) -> &CommitId {
        &self.commit.id
    }

    pub fn arrayset_names(&self) -> impl Iterator<Item = &str> {
        self.arraysets.keys().map(String::as_str)
    }

    pub fn arrayset(&self, name: &str) -> Result<&ArraysetView, CheckoutError> {
        self.arraysets
            .get(name)
            .ok_or_else(|| CheckoutError::ArraysetNotFound(name.to_string()))
    }

    pub fn metadata(&self) -> &MetadataView {
        &self.metadata
    }

    /// Releases the checkout. Reads through retained views fail once the
    /// repository itself is closed.
    pub fn close(self) {}
}

/// The exclusive read-write view over the staging area.
pub struct WriterCheckout {
    repo: Weak<RepoInner>,
    branch: String,
    author_name: String,
    author_email: String,
    staging: StagingArea,
    _lock: FileLock,
}

impl std::fmt::Debug for WriterCheckout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterCheckout")
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl WriterCheckout {
    pub(crate) fn new(
        repo: Weak<RepoInner>,
        branch: String,
        author_name: String,
        author_email: String,
        staging: StagingArea,
        lock: FileLock,
    ) -> Self {
        Self {
            repo,
            branch,
            author_name,
            author_email,
            staging,
            _lock: lock,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Commit this staging area descends from, if any.
    pub fn parent(&self) -> Option<&CommitId> {
        self.staging.parent()
    }

    fn schema_for(&self, name: &str) -> Result<Schema, CheckoutError> {
        let contents = self.staging.contents()?;
        let aset = contents
            .arraysets
            .get(name)
            .ok_or_else(|| CheckoutError::ArraysetNotFound(name.to_string()))?;
        Ok(self.staging.store()?.get_schema(&aset.schema)?)
    }

    /// Creates a new named arrayset with a frozen schema.
    pub fn init_arrayset(
        &self,
        name: &str,
        schema: Schema,
    ) -> Result<ArraysetWriter<'_>, CheckoutError> {
        sample_key::validate_name(name)?;
        if self.staging.has_arrayset(name)? {
            return Err(CheckoutError::ArraysetExists(name.to_string()));
        }
        let store = self.staging.store()?;
        let schema_id = store.put_schema(&schema)?;
        self.staging.put_arrayset(name, &schema_id)?;
        Ok(ArraysetWriter::new(&self.staging, name.to_string(), schema))
    }

    pub fn arrayset_names(&self) -> Result<Vec<String>, CheckoutError> {
        Ok(self.staging.contents()?.arraysets.into_keys().collect())
    }

    pub fn arrayset(&self, name: &str) -> Result<ArraysetWriter<'_>, CheckoutError> {
        let schema = self.schema_for(name)?;
        Ok(ArraysetWriter::new(&self.staging, name.to_string(), schema))
    }

    /// Removes an arrayset and all its key mappings from the staged state.
    pub fn delete_arrayset(&self, name: &str) -> Result<(), CheckoutError> {
        if !self.staging.has_arrayset(name)? {
            return Err(CheckoutError::ArraysetNotFound(name.to_string()));
        }
        self.staging.remove_arrayset(name)?;
        Ok(())
    }

    pub fn metadata(&self) -> MetadataWriter<'_> {
        MetadataWriter::new(&self.staging)
    }

    /// Closes the staging transaction into a commit and advances the branch
    /// head.
    pub fn commit(&mut self, message: &str) -> Result<CommitId, CheckoutError> {
        let spec = CommitSpec {
            author: Signature {
                name: self.author_name.clone(),
                email: self.author_email.clone(),
                timestamp: Timestamp::now(),
            },
            message: message.to_string(),
        };
        Ok(self.staging.commit(&self.branch, &spec)?)
    }

    /// Releases the writer lease and the on-disk lock.
    pub fn close(self) {}
}

impl Drop for WriterCheckout {
    fn drop(&mut self) {
        if let Some(inner) = self.repo.upgrade() {
            inner.release_writer();
        }
    }
}

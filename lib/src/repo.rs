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

//! The repository shell: layout, user identity, checkout acquisition, and
//! branch-level operations.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::branch;
use crate::branch::BranchError;
use crate::branch::MergeError;
use crate::checkout::CheckoutError;
use crate::checkout::ReaderCheckout;
use crate::checkout::WriterCheckout;
use crate::commit::Commit;
use crate::commit::CommitSpec;
use crate::commit::Signature;
use crate::commit::Timestamp;
use crate::commit::commit_id_for;
use crate::content_hash::CommitId;
use crate::lock::FileLock;
use crate::lock::FileLockError;
use crate::staging::StagingArea;
use crate::store::RepoMode;
use crate::store::Store;
use crate::store::StoreError;

/// Branch created by `init` and used when none is named.
pub const DEFAULT_BRANCH: &str = "master";

const CONFIG_FILE: &str = "config.toml";
const LOCK_FILE: &str = "LOCK";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("a writer checkout is already active for this repository")]
    WriterActive,
    #[error("repository was opened read-only")]
    ReadOnlyRepository,
    #[error("branch {0} has no commits to check out")]
    BranchHasNoCommits(String),
    #[error("could not read repository config: {0}")]
    Config(String),
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
    #[error(transparent)]
    Branch(#[from] BranchError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] FileLockError),
    #[error("repository i/o failure")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RepoConfig {
    user_name: String,
    user_email: String,
}

#[derive(Debug)]
pub(crate) struct RepoInner {
    store: Arc<Store>,
    config: RepoConfig,
    lock_path: PathBuf,
    writer_active: AtomicBool,
}

impl RepoInner {
    pub(crate) fn release_writer(&self) {
        self.writer_active.store(false, Ordering::Release);
    }
}

/// A version-controlled repository of arraysets and metadata.
///
/// Checkouts hold non-owning references back to the repository; closing the
/// repository invalidates every outstanding checkout, whose operations then
/// fail with a stale-reference error.
#[derive(Debug)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    /// Creates the repository layout at `root` (idempotent) and opens it
    /// read-write with the given user identity.
    pub fn init(root: &Path, user_name: &str, user_email: &str) -> Result<Self, RepoError> {
        let store = Store::init(root)?;
        let config_path = root.join(crate::store::REPO_DIR).join(CONFIG_FILE);
        let config = RepoConfig {
            user_name: user_name.to_string(),
            user_email: user_email.to_string(),
        };
        let rendered =
            toml::to_string_pretty(&config).map_err(|err| RepoError::Config(err.to_string()))?;
        fs::write(&config_path, rendered)?;
        let repo = Self::from_store(store, config)?;
        match branch::create_branch(repo.store(), DEFAULT_BRANCH, None) {
            Ok(()) | Err(BranchError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }
        tracing::info!(root = %root.display(), "initialized repository");
        Ok(repo)
    }

    /// Opens an existing repository read-write.
    pub fn open(root: &Path) -> Result<Self, RepoError> {
        Self::open_with_mode(root, RepoMode::ReadWrite)
    }

    /// Opens an existing repository for concurrent read-only access.
    pub fn open_read_only(root: &Path) -> Result<Self, RepoError> {
        Self::open_with_mode(root, RepoMode::ReadOnly)
    }

    fn open_with_mode(root: &Path, mode: RepoMode) -> Result<Self, RepoError> {
        let store = Store::open(root, mode)?;
        let config_path = root.join(crate::store::REPO_DIR).join(CONFIG_FILE);
        let raw = fs::read_to_string(&config_path)
            .map_err(|err| RepoError::Config(format!("{}: {err}", config_path.display())))?;
        let config: RepoConfig =
            toml::from_str(&raw).map_err(|err| RepoError::Config(err.to_string()))?;
        Self::from_store(store, config)
    }

    fn from_store(store: Store, config: RepoConfig) -> Result<Self, RepoError> {
        let lock_path = store.root().join(crate::store::REPO_DIR).join(LOCK_FILE);
        Ok(Self {
            inner: Arc::new(RepoInner {
                store: Arc::new(store),
                config,
                lock_path,
                writer_active: AtomicBool::new(false),
            }),
        })
    }

    /// Low-level store handle, also used to drive remote synchronization.
    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Closes the repository: backend accessors are released and every
    /// outstanding checkout becomes stale.
    pub fn close(self) -> Result<(), RepoError> {
        self.inner.store.close()?;
        Ok(())
    }

    // ---- branches ----

    pub fn create_branch(&self, name: &str, base: Option<&CommitId>) -> Result<(), RepoError> {
        Ok(branch::create_branch(self.store(), name, base)?)
    }

    pub fn branch_names(&self) -> Result<Vec<String>, RepoError> {
        Ok(branch::branch_names(self.store())?)
    }

    pub fn branch_head(&self, name: &str) -> Result<Option<CommitId>, RepoError> {
        Ok(branch::branch_head(self.store(), name)?)
    }

    /// Topologically ordered commits reachable from the branch head.
    pub fn history(&self, name: &str) -> Result<Vec<CommitId>, RepoError> {
        Ok(branch::history(self.store(), name)?)
    }

    pub fn read_commit(&self, id: &CommitId) -> Result<Commit, RepoError> {
        Ok(self.store().read_commit(id)?)
    }

    // ---- checkouts ----

    /// Reader checkout at the head of the default branch.
    pub fn checkout(&self) -> Result<ReaderCheckout, RepoError> {
        self.checkout_branch(DEFAULT_BRANCH)
    }

    pub fn checkout_branch(&self, name: &str) -> Result<ReaderCheckout, RepoError> {
        let head = branch::branch_head(self.store(), name)?
            .ok_or_else(|| RepoError::BranchHasNoCommits(name.to_string()))?;
        self.checkout_commit(&head)
    }

    /// Reader checkout pinned to an explicit commit digest.
    pub fn checkout_commit(&self, id: &CommitId) -> Result<ReaderCheckout, RepoError> {
        let commit = self.store().read_commit(id)?;
        Ok(ReaderCheckout::open(self.store(), commit)?)
    }

    /// Opens the exclusive writer checkout on a branch. A second writer in
    /// this process or any other fails immediately.
    pub fn checkout_writer(&self, branch_name: &str) -> Result<WriterCheckout, RepoError> {
        if self.inner.store.mode() != RepoMode::ReadWrite {
            return Err(RepoError::ReadOnlyRepository);
        }
        if self
            .inner
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RepoError::WriterActive);
        }
        let lock = match FileLock::try_lock(self.inner.lock_path.clone()) {
            Ok(lock) => lock,
            Err(FileLockError::Held(_)) => {
                self.inner.release_writer();
                return Err(RepoError::WriterActive);
            }
            Err(err) => {
                self.inner.release_writer();
                return Err(err.into());
            }
        };
        let parent = match branch::branch_head(self.store(), branch_name) {
            Ok(head) => head,
            Err(err) => {
                self.inner.release_writer();
                return Err(err.into());
            }
        };
        let staging = match StagingArea::open(self.store(), parent) {
            Ok(staging) => staging,
            Err(err) => {
                self.inner.release_writer();
                return Err(err.into());
            }
        };
        Ok(WriterCheckout::new(
            Arc::downgrade(&self.inner),
            branch_name.to_string(),
            self.inner.config.user_name.clone(),
            self.inner.config.user_email.clone(),
            staging,
            lock,
        ))
    }

    // ---- merge ----

    /// Three-way merge of `theirs` into `ours`, producing a merge commit (or
    /// fast-forwarding when one side contains the other). Conflicts surface
    /// as [`MergeError::Conflicts`] and nothing is written.
    pub fn merge(
        &self,
        message: &str,
        ours: &str,
        theirs: &str,
    ) -> Result<CommitId, RepoError> {
        let store = self.store();
        let ours_head = branch::branch_head(store, ours)?
            .ok_or_else(|| RepoError::BranchHasNoCommits(ours.to_string()))?;
        let theirs_head = branch::branch_head(store, theirs)?
            .ok_or_else(|| RepoError::BranchHasNoCommits(theirs.to_string()))?;

        let base = branch::merge_base(store, &ours_head, &theirs_head)
            .map_err(MergeError::Branch)?
            .ok_or(MergeError::NoMergeBase)?;
        if base == theirs_head {
            // Nothing to merge in.
            return Ok(ours_head);
        }
        if base == ours_head {
            // Fast-forward.
            branch::set_branch_head(store, ours, &theirs_head, false)?;
            return Ok(theirs_head);
        }

        let base_contents = store.read_commit_contents(&base)?;
        let ours_contents = store.read_commit_contents(&ours_head)?;
        let theirs_contents = store.read_commit_contents(&theirs_head)?;
        let merged = branch::merge_contents(&base_contents, &ours_contents, &theirs_contents)?;

        let spec = CommitSpec {
            author: Signature {
                name: self.inner.config.user_name.clone(),
                email: self.inner.config.user_email.clone(),
                timestamp: Timestamp::now(),
            },
            message: message.to_string(),
        };
        let parents = vec![ours_head, theirs_head];
        let ref_blob = merged.to_ref_blob();
        let id = commit_id_for(&parents, &spec, &ref_blob);
        store.write_commit_records(&id, &parents, &spec.to_bytes(), &ref_blob)?;
        branch::set_branch_head(store, ours, &id, false)?;
        tracing::info!(ours, theirs, commit = %id, "merged branches");
        Ok(id)
    }
}

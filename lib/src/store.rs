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

//! The repository store: logical KV environments, backend accessors, and the
//! hash index tying digests to locators.
//!
//! The hash index is the single deduplication point. `write_payload` checks
//! for an existing digest before touching any backend, so writing the same
//! bytes twice never stores a second copy.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use crate::backend::BackendAccessor;
use crate::backend::BackendCode;
use crate::backend::BackendError;
use crate::backend::Locator;
use crate::backend::OpenMode;
use crate::commit::Commit;
use crate::commit::CommitSpec;
use crate::content_hash;
use crate::content_hash::CommitId;
use crate::content_hash::DataId;
use crate::content_hash::SchemaId;
use crate::fs_backend::FsArrayBackend;
use crate::kv::KvEnv;
use crate::kv::KvError;
use crate::kv::KvWriteBatch;
use crate::kv_backend::KvPayloadBackend;
use crate::object_id::ObjectId as _;
use crate::records;
use crate::records::CommitContents;
use crate::records::RecordError;
use crate::schema::Schema;
use crate::schema::SchemaError;
use crate::tensor::Payload;

/// Name of the repository directory holding every environment.
pub const REPO_DIR: &str = "depot";
const DATA_DIR: &str = "data";
const ENV_NAMES: [&str; 5] = ["refenv", "branchenv", "hashenv", "stagenv", "labelenv"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no repository found at {0}")]
    NoRepository(PathBuf),
    #[error("stale reference: the repository has been closed")]
    RepositoryClosed,
    #[error("commit {0} does not exist")]
    CommitNotFound(String),
    #[error("data digest {0} does not exist")]
    DataNotFound(String),
    #[error("schema digest {0} does not exist")]
    SchemaNotFound(String),
    #[error("payload for digest {expected} read back as {actual}")]
    Corrupt { expected: String, actual: String },
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("repository i/o failure")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Access mode of a whole repository handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoMode {
    ReadWrite,
    ReadOnly,
}

/// The five logical databases of the layout contract.
#[derive(Debug)]
pub struct Environments {
    pub refenv: KvEnv,
    pub branchenv: KvEnv,
    pub hashenv: KvEnv,
    pub stagenv: KvEnv,
    pub labelenv: KvEnv,
}

impl Environments {
    fn open(repo_dir: &Path, mode: RepoMode) -> StoreResult<Self> {
        let open_env = |name: &str| {
            let path = repo_dir.join(name);
            match mode {
                RepoMode::ReadWrite => KvEnv::open(&path),
                RepoMode::ReadOnly => KvEnv::open_read_only(&path),
            }
        };
        Ok(Self {
            refenv: open_env("refenv")?,
            branchenv: open_env("branchenv")?,
            hashenv: open_env("hashenv")?,
            stagenv: open_env("stagenv")?,
            labelenv: open_env("labelenv")?,
        })
    }
}

/// Store owning the environments, the per-backend accessors for the process
/// lifetime, and the data-writer lock serializing payload writes.
pub struct Store {
    root: PathBuf,
    mode: RepoMode,
    envs: Environments,
    backends: BTreeMap<BackendCode, Box<dyn BackendAccessor>>,
    data_writer_lock: Mutex<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Creates the on-disk layout at `root` and opens a read-write store.
    /// Idempotent over an existing repository.
    pub fn init(root: &Path) -> StoreResult<Self> {
        let repo_dir = root.join(REPO_DIR);
        for env in ENV_NAMES {
            fs::create_dir_all(repo_dir.join(env))?;
        }
        fs::create_dir_all(repo_dir.join(DATA_DIR))?;
        Self::open(root, RepoMode::ReadWrite)
    }

    /// Opens an existing repository at `root`.
    pub fn open(root: &Path, mode: RepoMode) -> StoreResult<Self> {
        let repo_dir = root.join(REPO_DIR);
        if !repo_dir.is_dir() {
            return Err(StoreError::NoRepository(root.to_path_buf()));
        }
        let envs = Environments::open(&repo_dir, mode)?;
        let data_dir = repo_dir.join(DATA_DIR);
        let accessor_mode = match mode {
            RepoMode::ReadWrite => OpenMode::Write,
            RepoMode::ReadOnly => OpenMode::Read,
        };
        let mut backends: BTreeMap<BackendCode, Box<dyn BackendAccessor>> = BTreeMap::new();
        backends.insert(
            BackendCode::FS_ARRAY,
            Box::new(FsArrayBackend::open(&data_dir, accessor_mode)?),
        );
        backends.insert(
            BackendCode::KV_STR,
            Box::new(KvPayloadBackend::open_str(&data_dir, accessor_mode)?),
        );
        backends.insert(
            BackendCode::KV_BYTES,
            Box::new(KvPayloadBackend::open_bytes(&data_dir, accessor_mode)?),
        );
        Ok(Self {
            root: root.to_path_buf(),
            mode,
            envs,
            backends,
            data_writer_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> RepoMode {
        self.mode
    }

    pub fn envs(&self) -> &Environments {
        &self.envs
    }

    /// Closes every backend accessor. Outstanding reads fail afterwards.
    pub fn close(&self) -> StoreResult<()> {
        for backend in self.backends.values() {
            backend.close()?;
        }
        Ok(())
    }

    fn accessor(&self, code: BackendCode) -> StoreResult<&dyn BackendAccessor> {
        self.backends.get(&code).map(|backend| &**backend).ok_or_else(|| {
            StoreError::Backend(BackendError::InvalidLocator(code.as_str().to_string()))
        })
    }

    // ---- hash index: data ----

    pub fn has_data(&self, id: &DataId) -> StoreResult<bool> {
        Ok(self.envs.hashenv.contains(&records::hash_data_key(id))?)
    }

    pub fn locator_for(&self, id: &DataId) -> StoreResult<Option<Locator>> {
        match self.envs.hashenv.get(&records::hash_data_key(id))? {
            None => Ok(None),
            Some(raw) => {
                let s = String::from_utf8(raw)
                    .map_err(|_| RecordError::Malformed("locator is not UTF-8"))?;
                Ok(Some(Locator::parse(&s)?))
            }
        }
    }

    /// Stores a payload, deduplicating through the hash index. Writing bytes
    /// that already exist is a no-op on the payload and returns the same
    /// digest.
    pub fn write_payload(&self, payload: &Payload, schema: &Schema) -> StoreResult<DataId> {
        let digest = content_hash::data_digest(payload);
        let _guard = self.data_writer_lock.lock().unwrap();
        if let Some(locator) = self.locator_for(&digest)? {
            // A remote placeholder is upgraded by a real local write.
            if locator.code() != BackendCode::REMOTE {
                return Ok(digest);
            }
        }
        let accessor = self.accessor(schema.backend())?;
        let locator = accessor.write(payload, schema)?;
        self.envs
            .hashenv
            .put(&records::hash_data_key(&digest), locator.encode().as_bytes())?;
        Ok(digest)
    }

    /// Resolves a digest to its payload through the hash index and backend.
    pub fn read_payload(&self, id: &DataId) -> StoreResult<Payload> {
        let locator = self
            .locator_for(id)?
            .ok_or_else(|| StoreError::DataNotFound(id.hex()))?;
        if locator.code() == BackendCode::REMOTE {
            return Err(StoreError::Backend(BackendError::RemoteUnavailable {
                digest: id.hex(),
            }));
        }
        let accessor = self.accessor(locator.code())?;
        Ok(accessor.read(&locator)?)
    }

    /// Like [`read_payload`] but re-hashes the bytes and fails with
    /// [`StoreError::Corrupt`] on mismatch.
    ///
    /// [`read_payload`]: Self::read_payload
    pub fn read_payload_verified(&self, id: &DataId) -> StoreResult<Payload> {
        let payload = self.read_payload(id)?;
        let actual = content_hash::data_digest(&payload);
        if &actual != id {
            tracing::warn!(expected = %id.hex(), actual = %actual.hex(), "corrupt payload");
            return Err(StoreError::Corrupt {
                expected: id.hex(),
                actual: actual.hex(),
            });
        }
        Ok(payload)
    }

    /// Stores a payload that arrived over the wire, routed to the default
    /// backend for its kind.
    pub fn write_transferred_payload(&self, payload: &Payload) -> StoreResult<DataId> {
        self.write_payload(payload, &Schema::for_payload(payload))
    }

    /// Records a digest whose payload still lives on a remote peer.
    pub fn record_remote_data(&self, id: &DataId) -> StoreResult<()> {
        let _guard = self.data_writer_lock.lock().unwrap();
        let key = records::hash_data_key(id);
        if !self.envs.hashenv.contains(&key)? {
            let locator = Locator::new(BackendCode::REMOTE, id.hex());
            self.envs.hashenv.put(&key, locator.encode().as_bytes())?;
        }
        Ok(())
    }

    pub fn all_data_digests(&self) -> StoreResult<Vec<DataId>> {
        let pairs = self.envs.hashenv.scan_prefix(records::HASH_DATA_PREFIX)?;
        Ok(pairs
            .into_iter()
            .map(|(key, _)| DataId::from_bytes(&key[records::HASH_DATA_PREFIX.len()..]))
            .collect())
    }

    pub fn data_digest_count(&self) -> StoreResult<usize> {
        Ok(self.all_data_digests()?.len())
    }

    // ---- hash index: schemas ----

    pub fn has_schema(&self, id: &SchemaId) -> StoreResult<bool> {
        Ok(self.envs.hashenv.contains(&records::hash_schema_key(id))?)
    }

    /// Stores a schema blob under its digest. Identical schemas share one
    /// record.
    pub fn put_schema(&self, schema: &Schema) -> StoreResult<SchemaId> {
        let id = schema.digest();
        self.put_schema_blob(&id, &schema.to_blob())?;
        Ok(id)
    }

    /// Raw-blob variant used by the wire layer; returns false if the digest
    /// was already present.
    pub fn put_schema_blob(&self, id: &SchemaId, blob: &[u8]) -> StoreResult<bool> {
        let key = records::hash_schema_key(id);
        if self.envs.hashenv.contains(&key)? {
            return Ok(false);
        }
        self.envs.hashenv.put(&key, blob)?;
        Ok(true)
    }

    pub fn get_schema(&self, id: &SchemaId) -> StoreResult<Schema> {
        let blob = self.schema_blob(id)?;
        Ok(Schema::from_blob(&blob)?)
    }

    pub fn schema_blob(&self, id: &SchemaId) -> StoreResult<Vec<u8>> {
        self.envs
            .hashenv
            .get(&records::hash_schema_key(id))?
            .ok_or_else(|| StoreError::SchemaNotFound(id.hex()))
    }

    pub fn all_schema_digests(&self) -> StoreResult<Vec<SchemaId>> {
        let pairs = self.envs.hashenv.scan_prefix(records::HASH_SCHEMA_PREFIX)?;
        Ok(pairs
            .into_iter()
            .map(|(key, _)| SchemaId::from_bytes(&key[records::HASH_SCHEMA_PREFIX.len()..]))
            .collect())
    }

    // ---- commits ----

    pub fn has_commit(&self, id: &CommitId) -> StoreResult<bool> {
        Ok(self.envs.refenv.contains(&records::commit_ref_key(id))?)
    }

    /// Writes the three commit records atomically. Returns false (and writes
    /// nothing) if the commit already exists.
    pub fn write_commit_records(
        &self,
        id: &CommitId,
        parents: &[CommitId],
        spec_bytes: &[u8],
        ref_blob: &[u8],
    ) -> StoreResult<bool> {
        if self.has_commit(id)? {
            return Ok(false);
        }
        let mut batch = KvWriteBatch::default();
        batch.put(&records::commit_ref_key(id), ref_blob);
        batch.put(
            &records::commit_parent_key(id),
            &records::encode_commit_parents(parents),
        );
        batch.put(&records::commit_spec_key(id), spec_bytes);
        self.envs.refenv.write(batch)?;
        Ok(true)
    }

    pub fn read_commit(&self, id: &CommitId) -> StoreResult<Commit> {
        let parents = self
            .envs
            .refenv
            .get(&records::commit_parent_key(id))?
            .ok_or_else(|| StoreError::CommitNotFound(id.hex()))?;
        let spec = self
            .envs
            .refenv
            .get(&records::commit_spec_key(id))?
            .ok_or_else(|| StoreError::CommitNotFound(id.hex()))?;
        Ok(Commit {
            id: id.clone(),
            parents: records::decode_commit_parents(&parents)?,
            spec: CommitSpec::from_bytes(&spec)?,
        })
    }

    pub fn ref_blob_bytes(&self, id: &CommitId) -> StoreResult<Vec<u8>> {
        self.envs
            .refenv
            .get(&records::commit_ref_key(id))?
            .ok_or_else(|| StoreError::CommitNotFound(id.hex()))
    }

    pub fn read_commit_contents(&self, id: &CommitId) -> StoreResult<CommitContents> {
        Ok(CommitContents::from_ref_blob(&self.ref_blob_bytes(id)?)?)
    }

    pub fn all_commit_ids(&self) -> StoreResult<Vec<CommitId>> {
        let pairs = self.envs.refenv.scan_prefix(records::COMMIT_REF_PREFIX)?;
        Ok(pairs
            .into_iter()
            .map(|(key, _)| CommitId::from_bytes(&key[records::COMMIT_REF_PREFIX.len()..]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::tensor::DType;
    use crate::tensor::Tensor;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_payload_deduplicates() {
        let (_dir, store) = temp_store();
        let schema = Schema::array(DType::F64, vec![5, 7], false).unwrap();
        let payload = Payload::Array(Tensor::zeros(DType::F64, &[5, 7]));

        let first = store.write_payload(&payload, &schema).unwrap();
        assert_eq!(store.data_digest_count().unwrap(), 1);
        let second = store.write_payload(&payload, &schema).unwrap();
        assert_eq!(first, second);
        // The hash index still has a single entry.
        assert_eq!(store.data_digest_count().unwrap(), 1);
    }

    #[test]
    fn test_read_back_bit_for_bit() {
        let (_dir, store) = temp_store();
        let schema = Schema::array(DType::I32, vec![3], false).unwrap();
        let tensor = Tensor::from_elements(&[3], &[-1i32, 0, 7]).unwrap();
        let payload = Payload::Array(tensor);

        let digest = store.write_payload(&payload, &schema).unwrap();
        assert_eq!(store.read_payload_verified(&digest).unwrap(), payload);
    }

    #[test]
    fn test_missing_digest_is_not_found() {
        let (_dir, store) = temp_store();
        let id = DataId::from_hex("00ff00ff");
        assert_matches!(
            store.read_payload(&id),
            Err(StoreError::DataNotFound(_))
        );
    }

    #[test]
    fn test_remote_placeholder_upgrade() {
        let (_dir, store) = temp_store();
        let schema = Schema::string();
        let payload = Payload::Str("later".to_string());
        let digest = content_hash::data_digest(&payload);

        store.record_remote_data(&digest).unwrap();
        assert_matches!(
            store.read_payload(&digest),
            Err(StoreError::Backend(BackendError::RemoteUnavailable { .. }))
        );

        // A real write replaces the placeholder locator.
        store.write_payload(&payload, &schema).unwrap();
        assert_eq!(store.read_payload(&digest).unwrap(), payload);
    }

    #[test]
    fn test_commit_records_idempotent() {
        let (_dir, store) = temp_store();
        let id = CommitId::from_hex("aabb");
        assert!(store
            .write_commit_records(&id, &[], b"spec", b"refs")
            .is_ok_and(|fresh| fresh));
        assert!(store
            .write_commit_records(&id, &[], b"spec", b"refs")
            .is_ok_and(|fresh| !fresh));
        assert_eq!(store.all_commit_ids().unwrap(), vec![id]);
    }

    #[test]
    fn test_schema_sharing() {
        let (_dir, store) = temp_store();
        let schema = Schema::array(DType::F32, vec![2, 2], true).unwrap();
        let id = store.put_schema(&schema).unwrap();
        assert!(!store.put_schema_blob(&id, &schema.to_blob()).unwrap());
        assert_eq!(store.get_schema(&id).unwrap(), schema);
        assert_eq!(store.all_schema_digests().unwrap(), vec![id]);
    }
}

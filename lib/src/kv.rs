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

//! Ordered transactional key-value environments.
//!
//! Each logical database of the repository (`refenv`, `branchenv`,
//! `hashenv`, `stagenv`, `labelenv`) is one RocksDB instance rooted at its
//! layout directory. Readers take snapshots and never block the writer;
//! batched writes commit atomically. Writer serialization is enforced one
//! level up by the repository writer lock.

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage engine error in {env}")]
    Engine {
        env: String,
        source: rocksdb::Error,
    },
}

pub type KvResult<T> = Result<T, KvError>;

/// One logical database.
pub struct KvEnv {
    db: rocksdb::DB,
    path: PathBuf,
}

impl std::fmt::Debug for KvEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEnv").field("path", &self.path).finish()
    }
}

impl KvEnv {
    /// Opens (creating if missing) the environment at `path` for read-write
    /// access. Only one process may hold a read-write environment.
    pub fn open(path: &Path) -> KvResult<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path).map_err(|err| Self::engine_err(path, err))?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Opens the environment read-only. Multiple reader processes may share
    /// one on-disk environment with a single writer process.
    pub fn open_read_only(path: &Path) -> KvResult<Self> {
        let opts = rocksdb::Options::default();
        let db = rocksdb::DB::open_for_read_only(&opts, path, false)
            .map_err(|err| Self::engine_err(path, err))?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    fn engine_err(path: &Path, source: rocksdb::Error) -> KvError {
        KvError::Engine {
            env: path.display().to_string(),
            source,
        }
    }

    fn map_err(&self, source: rocksdb::Error) -> KvError {
        Self::engine_err(&self.path, source)
    }

    pub fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        self.db.get(key).map_err(|err| self.map_err(err))
    }

    pub fn contains(&self, key: &[u8]) -> KvResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.db.put(key, value).map_err(|err| self.map_err(err))
    }

    pub fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.db.delete(key).map_err(|err| self.map_err(err))
    }

    /// Applies a batch of mutations atomically.
    pub fn write(&self, batch: KvWriteBatch) -> KvResult<()> {
        self.db.write(batch.0).map_err(|err| self.map_err(err))
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mode = rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward);
        let mut out = vec![];
        for item in self.db.iterator(mode) {
            let (key, value) = item.map_err(|err| self.map_err(err))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.into_vec(), value.into_vec()));
        }
        Ok(out)
    }

    /// Takes a consistent point-in-time snapshot for reads.
    pub fn snapshot(&self) -> KvSnapshot<'_> {
        KvSnapshot {
            snapshot: self.db.snapshot(),
            env: self,
        }
    }
}

/// A set of mutations applied atomically by [`KvEnv::write`].
#[derive(Default)]
pub struct KvWriteBatch(rocksdb::WriteBatch);

impl KvWriteBatch {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.0.put(key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.0.delete(key);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Serializable snapshot view of one environment.
pub struct KvSnapshot<'a> {
    snapshot: rocksdb::Snapshot<'a>,
    env: &'a KvEnv,
}

impl KvSnapshot<'_> {
    pub fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        self.snapshot.get(key).map_err(|err| self.env.map_err(err))
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mode = rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward);
        let mut out = vec![];
        for item in self.snapshot.iterator(mode) {
            let (key, value) = item.map_err(|err| self.env.map_err(err))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.into_vec(), value.into_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_env() -> (tempfile::TempDir, KvEnv) {
        let dir = tempfile::tempdir().unwrap();
        let env = KvEnv::open(dir.path()).unwrap();
        (dir, env)
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, env) = temp_env();
        assert_eq!(env.get(b"k").unwrap(), None);
        env.put(b"k", b"v").unwrap();
        assert_eq!(env.get(b"k").unwrap(), Some(b"v".to_vec()));
        env.delete(b"k").unwrap();
        assert_eq!(env.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_scan_prefix_ordered() {
        let (_dir, env) = temp_env();
        env.put(b"a:2", b"2").unwrap();
        env.put(b"a:1", b"1").unwrap();
        env.put(b"b:1", b"x").unwrap();
        let pairs = env.scan_prefix(b"a:").unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"a:1".to_vec(), b"1".to_vec()),
                (b"a:2".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn test_snapshot_isolation() {
        let (_dir, env) = temp_env();
        env.put(b"k", b"old").unwrap();
        let snapshot = env.snapshot();
        env.put(b"k", b"new").unwrap();
        env.put(b"k2", b"other").unwrap();
        assert_eq!(snapshot.get(b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(snapshot.get(b"k2").unwrap(), None);
        assert_eq!(env.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_batch_is_atomic_unit() {
        let (_dir, env) = temp_env();
        let mut batch = KvWriteBatch::default();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"missing");
        env.write(batch).unwrap();
        assert_eq!(env.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(env.get(b"b").unwrap(), Some(b"2".to_vec()));
    }
}

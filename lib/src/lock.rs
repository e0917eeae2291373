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

//! On-disk lock guarding the single writer process per repository.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileLockError {
    #[error("lock file {0} is held by another writer")]
    Held(PathBuf),
    #[error("could not create lock file {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive lock file. The lock is released (and the file removed) on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock or fails immediately when it is already held.
    pub fn try_lock(path: PathBuf) -> Result<Self, FileLockError> {
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(FileLockError::Held(path))
            }
            Err(err) => Err(FileLockError::Io { path, source: err }),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

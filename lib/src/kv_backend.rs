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

//! Backends `30` and `31`: strings and bytes in a KV environment.
//!
//! Payloads are stored under their content digest, so the locator suffix is
//! simply the digest hex.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::backend::BackendAccessor;
use crate::backend::BackendCode;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Locator;
use crate::backend::OpenMode;
use crate::content_hash;
use crate::hex_util;
use crate::kv::KvEnv;
use crate::object_id::ObjectId as _;
use crate::schema::Schema;
use crate::tensor::Payload;
use crate::tensor::PayloadKind;

pub struct KvPayloadBackend {
    code: BackendCode,
    kind: PayloadKind,
    mode: OpenMode,
    env: KvEnv,
    closed: AtomicBool,
}

impl std::fmt::Debug for KvPayloadBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvPayloadBackend")
            .field("code", &self.code)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl KvPayloadBackend {
    /// Opens the string backend (`30`) under `data_dir`.
    pub fn open_str(data_dir: &Path, mode: OpenMode) -> BackendResult<Self> {
        Self::open(data_dir, BackendCode::KV_STR, PayloadKind::Str, mode)
    }

    /// Opens the bytes backend (`31`) under `data_dir`.
    pub fn open_bytes(data_dir: &Path, mode: OpenMode) -> BackendResult<Self> {
        Self::open(data_dir, BackendCode::KV_BYTES, PayloadKind::Bytes, mode)
    }

    fn open(
        data_dir: &Path,
        code: BackendCode,
        kind: PayloadKind,
        mode: OpenMode,
    ) -> BackendResult<Self> {
        let path = data_dir.join(code.as_str());
        let env = match mode {
            OpenMode::Write => KvEnv::open(&path)?,
            OpenMode::Read => KvEnv::open_read_only(&path)?,
        };
        Ok(Self {
            code,
            kind,
            mode,
            env,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::NotWritable);
        }
        Ok(())
    }

    fn key_for(&self, locator: &Locator) -> BackendResult<Vec<u8>> {
        hex_util::decode_hex(locator.suffix())
            .ok_or_else(|| BackendError::InvalidLocator(locator.encode()))
    }
}

impl BackendAccessor for KvPayloadBackend {
    fn code(&self) -> BackendCode {
        self.code
    }

    fn kind(&self) -> PayloadKind {
        self.kind
    }

    fn write(&self, payload: &Payload, _schema: &Schema) -> BackendResult<Locator> {
        self.check_open()?;
        if self.mode != OpenMode::Write {
            return Err(BackendError::NotWritable);
        }
        if payload.kind() != self.kind {
            return Err(BackendError::WrongKind {
                code: self.code.as_str().to_string(),
                kind: payload.kind(),
            });
        }
        let digest = content_hash::data_digest(payload);
        self.env.put(digest.as_bytes(), &payload.canonical_bytes())?;
        Ok(Locator::new(self.code, digest.hex()))
    }

    fn read(&self, locator: &Locator) -> BackendResult<Payload> {
        self.check_open()?;
        let key = self.key_for(locator)?;
        let bytes = self.env.get(&key)?.ok_or_else(|| BackendError::NotFound {
            locator: locator.encode(),
        })?;
        Payload::from_canonical_bytes(self.kind, &bytes)
            .map_err(|_| BackendError::InvalidLocator(locator.encode()))
    }

    fn delete(&self, locator: &Locator) -> BackendResult<()> {
        self.check_open()?;
        if self.mode != OpenMode::Write {
            return Err(BackendError::NotWritable);
        }
        let key = self.key_for(locator)?;
        Ok(self.env.delete(&key)?)
    }

    fn close(&self) -> BackendResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_str_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = KvPayloadBackend::open_str(dir.path(), OpenMode::Write).unwrap();
        let payload = Payload::Str("some metadata".to_string());

        let locator = backend.write(&payload, &Schema::string()).unwrap();
        assert_eq!(locator.code(), BackendCode::KV_STR);
        assert_eq!(backend.read(&locator).unwrap(), payload);

        backend.delete(&locator).unwrap();
        assert_matches!(
            backend.read(&locator),
            Err(BackendError::NotFound { .. })
        );
    }

    #[test]
    fn test_kind_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let backend = KvPayloadBackend::open_bytes(dir.path(), OpenMode::Write).unwrap();
        assert_matches!(
            backend.write(&Payload::Str("not bytes".to_string()), &Schema::bytes()),
            Err(BackendError::WrongKind { .. })
        );
        backend
            .write(&Payload::Bytes(vec![1, 2, 3]), &Schema::bytes())
            .unwrap();
    }
}

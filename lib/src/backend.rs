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

//! Pluggable payload storage backends.
//!
//! A backend stores opaque payloads addressed by a backend-private locator.
//! The two-character code prefixing every locator selects the accessor.
//! Deduplication is not a backend concern; the hash index above checks for
//! an existing digest before asking a backend to store fresh bytes.

use std::fmt::Debug;

use thiserror::Error;

use crate::schema::Schema;
use crate::tensor::Payload;
use crate::tensor::PayloadKind;

/// Error taxonomy shared by every accessor.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no payload for locator {locator}")]
    NotFound { locator: String },
    #[error("payload bytes for {locator} hash to {actual}, expected {expected}")]
    Corrupt {
        locator: String,
        expected: String,
        actual: String,
    },
    #[error("backend container {container} is full")]
    Full { container: String },
    #[error("locator {0:?} is malformed")]
    InvalidLocator(String),
    #[error("payload for {digest} has not been fetched from a remote")]
    RemoteUnavailable { digest: String },
    #[error("backend {code} does not store {kind:?} payloads")]
    WrongKind { code: String, kind: PayloadKind },
    #[error("backend is not open for writing")]
    NotWritable,
    #[error("backend i/o failure")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Two-character backend selector embedded in every locator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendCode([u8; 2]);

impl BackendCode {
    /// Local filesystem containers for dense arrays.
    pub const FS_ARRAY: Self = Self(*b"01");
    /// KV-backed string store.
    pub const KV_STR: Self = Self(*b"30");
    /// KV-backed bytes store.
    pub const KV_BYTES: Self = Self(*b"31");
    /// Placeholder for payloads that live on a remote peer.
    pub const REMOTE: Self = Self(*b"50");

    pub fn parse(code: &str) -> BackendResult<Self> {
        let bytes: [u8; 2] = code
            .as_bytes()
            .try_into()
            .map_err(|_| BackendError::InvalidLocator(code.to_string()))?;
        if !bytes.iter().all(u8::is_ascii_digit) {
            return Err(BackendError::InvalidLocator(code.to_string()));
        }
        Ok(Self(bytes))
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap()
    }
}

impl Debug for BackendCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackendCode").field(&self.as_str()).finish()
    }
}

impl std::fmt::Display for BackendCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// An opaque payload address: backend code plus backend-private suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    code: BackendCode,
    suffix: String,
}

impl Locator {
    pub fn new(code: BackendCode, suffix: impl Into<String>) -> Self {
        Self {
            code,
            suffix: suffix.into(),
        }
    }

    /// Parses the stored form `"<code>:<suffix>"`.
    pub fn parse(raw: &str) -> BackendResult<Self> {
        let (code, suffix) = raw
            .split_once(':')
            .ok_or_else(|| BackendError::InvalidLocator(raw.to_string()))?;
        Ok(Self {
            code: BackendCode::parse(code)?,
            suffix: suffix.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.code.as_str(), self.suffix)
    }

    pub fn code(&self) -> BackendCode {
        self.code
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

/// Access mode of an accessor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Capability set every backend exposes.
///
/// Concurrent reads through one open accessor are permitted; writes are
/// serialized by the data-writer lock held above this layer.
pub trait BackendAccessor: Send + Sync + Debug {
    fn code(&self) -> BackendCode;

    /// The payload kind this backend stores.
    fn kind(&self) -> PayloadKind;

    /// Stores a fresh payload and returns its locator. The caller has
    /// already established that no equal payload exists.
    fn write(&self, payload: &Payload, schema: &Schema) -> BackendResult<Locator>;

    /// Resolves a locator produced by this backend.
    fn read(&self, locator: &Locator) -> BackendResult<Payload>;

    /// Removes the payload at `locator`. Append-only backends may record
    /// this as a no-op; space reclaim is a GC concern.
    fn delete(&self, locator: &Locator) -> BackendResult<()>;

    /// Releases held file handles. Reads after close fail.
    fn close(&self) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_locator_roundtrip() {
        let locator = Locator::new(BackendCode::FS_ARRAY, "abc123:0:280");
        let encoded = locator.encode();
        assert_eq!(encoded, "01:abc123:0:280");
        assert_eq!(Locator::parse(&encoded).unwrap(), locator);
    }

    #[test]
    fn test_locator_rejects_bad_prefix() {
        assert_matches!(Locator::parse("xx:stuff"), Err(BackendError::InvalidLocator(_)));
        assert_matches!(Locator::parse("nocolon"), Err(BackendError::InvalidLocator(_)));
        assert_matches!(Locator::parse("012:stuff"), Err(BackendError::InvalidLocator(_)));
    }

    #[test]
    fn test_backend_code_display() {
        assert_eq!(BackendCode::KV_STR.to_string(), "30");
        assert_eq!(BackendCode::parse("50").unwrap(), BackendCode::REMOTE);
    }
}

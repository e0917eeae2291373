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

//! Record keyspaces and the canonical ref blob.
//!
//! Key builders here define the byte layout of each logical database.
//! [`CommitContents`] is the in-memory form of a commit's full state; its
//! ref-blob serialization is canonical because the underlying maps iterate
//! in the sample-key and name orderings.

use std::collections::BTreeMap;

use prost::Message as _;
use thiserror::Error;

use crate::content_hash::CommitId;
use crate::content_hash::DataId;
use crate::content_hash::SchemaId;
use crate::object_id::ObjectId as _;
use crate::protos::records as proto;
use crate::sample_key::KeyError;
use crate::sample_key::SampleKey;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("could not decode stored record")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("record value is malformed: {0}")]
    Malformed(&'static str),
}

// refenv keyspace
pub fn commit_ref_key(id: &CommitId) -> Vec<u8> {
    [b"c:", id.as_bytes()].concat()
}

pub fn commit_parent_key(id: &CommitId) -> Vec<u8> {
    [b"p:", id.as_bytes()].concat()
}

pub fn commit_spec_key(id: &CommitId) -> Vec<u8> {
    [b"s:", id.as_bytes()].concat()
}

pub const COMMIT_REF_PREFIX: &[u8] = b"c:";

// branchenv keyspace
pub fn branch_key(name: &str) -> Vec<u8> {
    [b"branch:", name.as_bytes()].concat()
}

pub const BRANCH_PREFIX: &[u8] = b"branch:";

// hashenv keyspace: data-hash and schema-hash records side by side.
pub fn hash_data_key(id: &DataId) -> Vec<u8> {
    [b"h:", id.as_bytes()].concat()
}

pub fn hash_schema_key(id: &SchemaId) -> Vec<u8> {
    [b"s:", id.as_bytes()].concat()
}

pub const HASH_DATA_PREFIX: &[u8] = b"h:";
pub const HASH_SCHEMA_PREFIX: &[u8] = b"s:";

// stagenv keyspace: one record per staged arrayset schema and per staged
// sample. The 0xff separator cannot appear in a validated name.
pub fn stage_schema_key(arrayset: &str) -> Vec<u8> {
    [b"a:", arrayset.as_bytes(), b"\xff"].concat()
}

pub fn stage_sample_key(arrayset: &str, key: &SampleKey) -> Vec<u8> {
    [
        b"a:",
        arrayset.as_bytes(),
        b"\xff",
        key.to_db_bytes().as_slice(),
    ]
    .concat()
}

pub fn stage_arrayset_prefix(arrayset: &str) -> Vec<u8> {
    stage_schema_key(arrayset)
}

pub const STAGE_PREFIX: &[u8] = b"a:";
pub const STAGE_DIRTY_KEY: &[u8] = b"dirty";

// labelenv keyspace: staged metadata entries.
pub fn label_key(key: &SampleKey) -> Vec<u8> {
    [b"l:", key.to_db_bytes().as_slice()].concat()
}

pub const LABEL_PREFIX: &[u8] = b"l:";

/// Splits a staged sample key back into `(arrayset, Option<sample key>)`.
/// `None` marks the arrayset's schema record.
pub fn parse_stage_key(key: &[u8]) -> Result<(String, Option<SampleKey>), RecordError> {
    let rest = key
        .strip_prefix(STAGE_PREFIX)
        .ok_or(RecordError::Malformed("not a stage key"))?;
    let sep = rest
        .iter()
        .position(|&b| b == 0xff)
        .ok_or(RecordError::Malformed("missing name separator"))?;
    let name = std::str::from_utf8(&rest[..sep])
        .map_err(|_| RecordError::Malformed("arrayset name is not UTF-8"))?
        .to_string();
    let key_bytes = &rest[sep + 1..];
    if key_bytes.is_empty() {
        Ok((name, None))
    } else {
        Ok((name, Some(SampleKey::from_db_bytes(key_bytes)?)))
    }
}

/// State of one arrayset within a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraysetContents {
    pub schema: SchemaId,
    pub samples: BTreeMap<SampleKey, DataId>,
}

/// Full state captured by a commit: every arrayset and the metadata map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommitContents {
    pub arraysets: BTreeMap<String, ArraysetContents>,
    pub metadata: BTreeMap<SampleKey, String>,
}

impl CommitContents {
    /// Serializes into the canonical ref blob. Ordering is stable because
    /// the maps iterate sorted.
    pub fn to_ref_blob(&self) -> Vec<u8> {
        let arraysets = self
            .arraysets
            .iter()
            .map(|(name, contents)| proto::RefArrayset {
                name: name.clone(),
                schema_digest: contents.schema.to_bytes(),
                samples: contents
                    .samples
                    .iter()
                    .map(|(key, digest)| proto::RefSample {
                        key: key.to_db_bytes(),
                        digest: digest.to_bytes(),
                    })
                    .collect(),
            })
            .collect();
        let metadata = self
            .metadata
            .iter()
            .map(|(key, value)| proto::RefMetadata {
                key: key.to_db_bytes(),
                value: value.clone(),
            })
            .collect();
        proto::RefBlob {
            arraysets,
            metadata,
        }
        .encode_to_vec()
    }

    pub fn from_ref_blob(bytes: &[u8]) -> Result<Self, RecordError> {
        let blob = proto::RefBlob::decode(bytes)?;
        let mut contents = Self::default();
        for aset in blob.arraysets {
            let mut samples = BTreeMap::new();
            for sample in aset.samples {
                samples.insert(
                    SampleKey::from_db_bytes(&sample.key)?,
                    DataId::new(sample.digest),
                );
            }
            contents.arraysets.insert(
                aset.name,
                ArraysetContents {
                    schema: SchemaId::new(aset.schema_digest),
                    samples,
                },
            );
        }
        for meta in blob.metadata {
            contents
                .metadata
                .insert(SampleKey::from_db_bytes(&meta.key)?, meta.value);
        }
        Ok(contents)
    }

    /// Digests of every sample referenced by this state.
    pub fn data_digests(&self) -> impl Iterator<Item = &DataId> {
        self.arraysets
            .values()
            .flat_map(|contents| contents.samples.values())
    }

    /// Digests of every schema referenced by this state.
    pub fn schema_digests(&self) -> impl Iterator<Item = &SchemaId> {
        self.arraysets.values().map(|contents| &contents.schema)
    }
}

pub fn encode_commit_parents(parents: &[CommitId]) -> Vec<u8> {
    proto::CommitParents {
        parents: parents.iter().map(|id| id.to_bytes()).collect(),
    }
    .encode_to_vec()
}

pub fn decode_commit_parents(bytes: &[u8]) -> Result<Vec<CommitId>, RecordError> {
    let proto = proto::CommitParents::decode(bytes)?;
    Ok(proto.parents.into_iter().map(CommitId::new).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_contents() -> CommitContents {
        let mut contents = CommitContents::default();
        let mut samples = BTreeMap::new();
        samples.insert(SampleKey::Int(1), DataId::from_hex("0a0b"));
        samples.insert(SampleKey::str("1").unwrap(), DataId::from_hex("0c0d"));
        contents.arraysets.insert(
            "writtenaset".to_string(),
            ArraysetContents {
                schema: SchemaId::from_hex("ff00"),
                samples,
            },
        );
        contents
            .metadata
            .insert(SampleKey::str("origin").unwrap(), "somewhere".to_string());
        contents
    }

    #[test]
    fn test_ref_blob_roundtrip() {
        let contents = sample_contents();
        let blob = contents.to_ref_blob();
        assert_eq!(CommitContents::from_ref_blob(&blob).unwrap(), contents);
    }

    #[test]
    fn test_ref_blob_is_deterministic() {
        let a = sample_contents().to_ref_blob();
        let b = sample_contents().to_ref_blob();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_stage_key() {
        let schema_key = stage_schema_key("aset");
        assert_eq!(parse_stage_key(&schema_key).unwrap(), ("aset".into(), None));

        let sample_key = stage_sample_key("aset", &SampleKey::Int(7));
        assert_eq!(
            parse_stage_key(&sample_key).unwrap(),
            ("aset".into(), Some(SampleKey::Int(7)))
        );
    }

    #[test]
    fn test_stage_keys_group_by_arrayset() {
        let prefix = stage_arrayset_prefix("aset");
        let sample_key = stage_sample_key("aset", &SampleKey::str("k").unwrap());
        assert!(sample_key.starts_with(&prefix));
        let other = stage_sample_key("aset2", &SampleKey::str("k").unwrap());
        assert!(!other.starts_with(&prefix));
    }
}

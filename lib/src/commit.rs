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

use chrono::TimeZone as _;
use prost::Message as _;
use thiserror::Error;

use crate::content_hash;
use crate::content_hash::CommitId;
use crate::protos::records as proto;
use crate::records::CommitContents;
use crate::records::RecordError;

#[derive(Debug, Error)]
#[error("Out-of-range date")]
pub struct TimestampOutOfRange;

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct Timestamp {
    pub timestamp: MillisSinceEpoch,
    // time zone offset in minutes
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::offset::Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone<Offset = chrono::offset::FixedOffset>>(
        datetime: chrono::DateTime<Tz>,
    ) -> Self {
        Self {
            timestamp: MillisSinceEpoch(datetime.timestamp_millis()),
            tz_offset: datetime.offset().local_minus_utc() / 60,
        }
    }

    pub fn to_datetime(
        &self,
    ) -> Result<chrono::DateTime<chrono::FixedOffset>, TimestampOutOfRange> {
        let utc = match chrono::Utc.timestamp_opt(
            self.timestamp.0.div_euclid(1000),
            (self.timestamp.0.rem_euclid(1000)) as u32 * 1000000,
        ) {
            chrono::LocalResult::None => {
                return Err(TimestampOutOfRange);
            }
            chrono::LocalResult::Single(x) => x,
            chrono::LocalResult::Ambiguous(y, _z) => y,
        };

        Ok(utc.with_timezone(
            &chrono::FixedOffset::east_opt(self.tz_offset * 60)
                .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap()),
        ))
    }
}

/// Author identity recorded in a commit spec.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub timestamp: Timestamp,
}

/// Author, timestamp, and message of a commit.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CommitSpec {
    pub author: Signature,
    pub message: String,
}

impl CommitSpec {
    /// Canonical spec bytes, part of the commit digest input.
    pub fn to_bytes(&self) -> Vec<u8> {
        proto::CommitSpec {
            author_name: self.author.name.clone(),
            author_email: self.author.email.clone(),
            message: self.message.clone(),
            millis_since_epoch: self.author.timestamp.timestamp.0,
            tz_offset: self.author.timestamp.tz_offset,
        }
        .encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let spec = proto::CommitSpec::decode(bytes)?;
        Ok(Self {
            author: Signature {
                name: spec.author_name,
                email: spec.author_email,
                timestamp: Timestamp {
                    timestamp: MillisSinceEpoch(spec.millis_since_epoch),
                    tz_offset: spec.tz_offset,
                },
            },
            message: spec.message,
        })
    }
}

/// An immutable commit: digest, parents, and spec. The ref blob carrying the
/// full state is loaded separately via the store.
#[derive(Debug, PartialEq, Clone)]
pub struct Commit {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub spec: CommitSpec,
}

/// Computes the digest a commit with these components must carry.
pub fn commit_id_for(parents: &[CommitId], spec: &CommitSpec, ref_blob: &[u8]) -> CommitId {
    content_hash::commit_digest(parents, &spec.to_bytes(), ref_blob)
}

/// Convenience for hashing contents directly.
pub fn commit_id_for_contents(
    parents: &[CommitId],
    spec: &CommitSpec,
    contents: &CommitContents,
) -> CommitId {
    commit_id_for(parents, spec, &contents.to_ref_blob())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(message: &str) -> CommitSpec {
        CommitSpec {
            author: Signature {
                name: "Someone".to_string(),
                email: "someone@example.com".to_string(),
                timestamp: Timestamp {
                    timestamp: MillisSinceEpoch(0),
                    tz_offset: 0,
                },
            },
            message: message.to_string(),
        }
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = test_spec("initial commit");
        assert_eq!(CommitSpec::from_bytes(&spec.to_bytes()).unwrap(), spec);
    }

    #[test]
    fn test_identical_states_identical_ids() {
        let contents = CommitContents::default();
        let spec = test_spec("msg");
        let a = commit_id_for_contents(&[], &spec, &contents);
        let b = commit_id_for_contents(&[], &spec, &contents);
        assert_eq!(a, b);

        let other_spec = test_spec("different msg");
        assert_ne!(a, commit_id_for_contents(&[], &other_spec, &contents));
    }
}

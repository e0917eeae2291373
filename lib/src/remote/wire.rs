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

//! Wire frames of the remote protocol.
//!
//! Every exchange is a sequence of length-prefixed frames: a u32 big-endian
//! body length, a one-byte frame kind, and a message body. Streaming
//! operations are explicit frame sequences closed by an end marker; an error
//! mid-stream travels in-band as a [`Status`] frame and the stream then
//! terminates cleanly at the transport level.

use prost::Message;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;

/// Upper bound on one frame body.
pub const MAX_FRAME_NBYTES: usize = 64 << 20;

/// Status codes carried in-band; the numeric values follow the transport
/// convention shared with other RPC tooling.
pub mod status_code {
    pub const OK: u32 = 0;
    pub const NOT_FOUND: u32 = 5;
    pub const ALREADY_EXISTS: u32 = 6;
    pub const PERMISSION_DENIED: u32 = 7;
    pub const FAILED_PRECONDITION: u32 = 9;
    pub const INTERNAL: u32 = 13;
    pub const DATA_LOSS: u32 = 15;
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection i/o failure")]
    Io(#[from] std::io::Error),
    #[error("could not decode frame body")]
    Decode(#[from] prost::DecodeError),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("expected {expected} frame, got {got:?}")]
    UnexpectedFrame {
        expected: &'static str,
        got: FrameKind,
    },
}

/// Discriminant of every frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Status = 0,
    StreamEnd = 1,
    Handshake = 2,
    HandshakeReply = 3,
    Ping = 4,
    PingReply = 5,
    ClientConfig = 6,
    ClientConfigReply = 7,
    FetchBranch = 8,
    FetchBranchReply = 9,
    PushBranch = 10,
    PushBranchReply = 11,
    FetchCommit = 12,
    CommitHeader = 13,
    CommitChunk = 14,
    PushCommitReply = 15,
    FetchSchema = 16,
    FetchSchemaReply = 17,
    PushSchema = 18,
    PushSchemaReply = 19,
    FetchFindMissingCommits = 20,
    PushFindMissingCommits = 21,
    FindMissingCommitsReply = 22,
    FetchFindMissingSchemas = 23,
    PushFindMissingSchemas = 24,
    FindMissingSchemasReply = 25,
    FetchFindMissingHashes = 26,
    PushFindMissingHashes = 27,
    FindMissingHashesReply = 28,
    FetchFindDataOrigin = 29,
    PushFindDataOrigin = 30,
    DataOriginItem = 31,
    DataOriginReply = 32,
    FetchData = 33,
    DataHeader = 34,
    DataChunk = 35,
    FetchDataDone = 36,
    PushBegin = 37,
    PushBeginReply = 38,
    PushEnd = 39,
    PushEndReply = 40,
    PushData = 41,
    PushDataReply = 42,
}

impl FrameKind {
    // Indexed by discriminant; kept in declaration order.
    const ALL: [Self; 43] = [
        Self::Status,
        Self::StreamEnd,
        Self::Handshake,
        Self::HandshakeReply,
        Self::Ping,
        Self::PingReply,
        Self::ClientConfig,
        Self::ClientConfigReply,
        Self::FetchBranch,
        Self::FetchBranchReply,
        Self::PushBranch,
        Self::PushBranchReply,
        Self::FetchCommit,
        Self::CommitHeader,
        Self::CommitChunk,
        Self::PushCommitReply,
        Self::FetchSchema,
        Self::FetchSchemaReply,
        Self::PushSchema,
        Self::PushSchemaReply,
        Self::FetchFindMissingCommits,
        Self::PushFindMissingCommits,
        Self::FindMissingCommitsReply,
        Self::FetchFindMissingSchemas,
        Self::PushFindMissingSchemas,
        Self::FindMissingSchemasReply,
        Self::FetchFindMissingHashes,
        Self::PushFindMissingHashes,
        Self::FindMissingHashesReply,
        Self::FetchFindDataOrigin,
        Self::PushFindDataOrigin,
        Self::DataOriginItem,
        Self::DataOriginReply,
        Self::FetchData,
        Self::DataHeader,
        Self::DataChunk,
        Self::FetchDataDone,
        Self::PushBegin,
        Self::PushBeginReply,
        Self::PushEnd,
        Self::PushEndReply,
        Self::PushData,
        Self::PushDataReply,
    ];
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Self::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(WireError::UnknownKind(value))
    }
}

/// One frame as read off the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn decode<M: Message + Default>(&self) -> Result<M, WireError> {
        Ok(M::decode(self.body.as_slice())?)
    }

    /// Fails unless this frame has the expected kind.
    pub fn expect(&self, kind: FrameKind, expected: &'static str) -> Result<(), WireError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(WireError::UnexpectedFrame {
                expected,
                got: self.kind,
            })
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    message: &impl Message,
) -> Result<(), WireError> {
    let body = message.encode_to_vec();
    if body.len() > MAX_FRAME_NBYTES {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_u8(kind as u8).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WireError> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_NBYTES {
        return Err(WireError::FrameTooLarge(len));
    }
    let kind = FrameKind::try_from(reader.read_u8().await?)?;
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame { kind, body })
}

// ---- message bodies ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Status {
    pub fn ok() -> Option<Self> {
        Some(Self {
            code: status_code::OK,
            message: "OK".to_string(),
        })
    }

    pub fn err(code: u32, message: impl Into<String>) -> Option<Self> {
        Some(Self {
            code,
            message: message.into(),
        })
    }
}

/// Whether an optional status field signals success.
pub fn status_is_ok(status: &Option<Status>) -> bool {
    status
        .as_ref()
        .is_none_or(|status| status.code == status_code::OK)
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Handshake {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub password: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeReply {
    #[prost(bool, tag = "1")]
    pub push_allowed: bool,
    #[prost(message, optional, tag = "2")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingReply {
    #[prost(string, tag = "1")]
    pub result: String,
    #[prost(message, optional, tag = "2")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientConfigRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientConfigReply {
    #[prost(uint64, tag = "1")]
    pub push_max_nbytes: u64,
    #[prost(bool, tag = "2")]
    pub enable_compression: bool,
    #[prost(string, tag = "3")]
    pub optimization_target: String,
    #[prost(message, optional, tag = "4")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BranchRecord {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Head commit digest; empty for a branch with no commits.
    #[prost(bytes = "vec", tag = "2")]
    pub commit: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchBranchRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchBranchReply {
    #[prost(message, optional, tag = "1")]
    pub rec: Option<BranchRecord>,
    #[prost(message, optional, tag = "2")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushBranchRequest {
    #[prost(message, optional, tag = "1")]
    pub rec: Option<BranchRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushBranchReply {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchCommitRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub commit: Vec<u8>,
}

/// First frame of a commit transfer in either direction; the ref blob
/// follows as `CommitChunk`-kind [`DataChunk`] frames totalling
/// `total_nbytes`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub commit: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub parents: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "3")]
    pub spec: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub total_nbytes: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushCommitReply {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchemaRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub digest: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub blob: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchSchemaRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub digest: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchSchemaReply {
    #[prost(message, optional, tag = "1")]
    pub rec: Option<SchemaRecord>,
    #[prost(message, optional, tag = "2")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushSchemaRequest {
    #[prost(message, optional, tag = "1")]
    pub rec: Option<SchemaRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushSchemaReply {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingCommitsRequest {
    #[prost(message, optional, tag = "1")]
    pub branch: Option<BranchRecord>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub commits: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingCommitsReply {
    #[prost(message, optional, tag = "1")]
    pub branch: Option<BranchRecord>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub commits: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingSchemasRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub commit: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub schema_digests: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingSchemasReply {
    #[prost(bytes = "vec", tag = "1")]
    pub commit: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub schema_digests: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<Status>,
}

/// Hash-record reconciliation; `pack` is a compressed [`DigestPack`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingHashesRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub commit: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub pack: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindMissingHashesReply {
    #[prost(bytes = "vec", tag = "1")]
    pub commit: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub pack: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DigestPack {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub digests: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindDataOriginStart {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataOriginItem {
    #[prost(bytes = "vec", tag = "1")]
    pub digest: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(bool, tag = "3")]
    pub compression_desired: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataOriginReply {
    #[prost(bytes = "vec", tag = "1")]
    pub digest: Vec<u8>,
    #[prost(string, tag = "2")]
    pub uri: String,
    #[prost(uint32, tag = "3")]
    pub kind: u32,
    #[prost(bool, tag = "4")]
    pub compression_expected: bool,
    #[prost(string, tag = "5")]
    pub compression_id: String,
    #[prost(int32, tag = "6")]
    pub compression_level: i32,
    #[prost(message, optional, tag = "7")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchDataRequest {
    #[prost(string, repeated, tag = "1")]
    pub uris: Vec<String>,
}

/// Header of one payload transfer; compressed bytes follow as [`DataChunk`]
/// frames totalling `comp_nbytes`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataHeader {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(uint64, tag = "3")]
    pub comp_nbytes: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataChunk {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Closes a fetch-data stream. `unsent_uris` is the remainder the client
/// must resubmit after a partial completion.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchDataDone {
    #[prost(string, repeated, tag = "1")]
    pub unsent_uris: Vec<String>,
    #[prost(message, optional, tag = "2")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushBeginRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushBeginReply {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushEndRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushEndReply {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushDataReply {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamEnd {}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = FetchBranchRequest {
            name: "master".to_string(),
        };
        write_frame(&mut client, FrameKind::FetchBranch, &request)
            .await
            .unwrap();

        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.kind, FrameKind::FetchBranch);
        assert_eq!(frame.decode::<FetchBranchRequest>().unwrap(), request);
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(0).await.unwrap();
        client.write_u8(200).await.unwrap();
        assert_matches!(
            read_frame(&mut server).await,
            Err(WireError::UnknownKind(200))
        );
    }

    #[test]
    fn test_status_helpers() {
        assert!(status_is_ok(&Status::ok()));
        assert!(status_is_ok(&None));
        assert!(!status_is_ok(&Status::err(
            status_code::NOT_FOUND,
            "missing"
        )));
    }

    #[test]
    fn test_frame_kind_try_from() {
        assert_eq!(FrameKind::try_from(0).unwrap(), FrameKind::Status);
        assert_eq!(FrameKind::try_from(42).unwrap(), FrameKind::PushDataReply);
        assert_matches!(FrameKind::try_from(43), Err(WireError::UnknownKind(43)));
    }
}

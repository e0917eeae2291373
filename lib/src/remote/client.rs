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

//! The remote client: one method per wire operation, plus the push/fetch
//! drivers that reconcile commit, schema, and data-hash sets with a peer.

use std::collections::HashSet;

use itertools::Itertools as _;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;

use crate::branch;
use crate::branch::BranchError;
use crate::content_hash;
use crate::content_hash::CommitId;
use crate::content_hash::DataId;
use crate::content_hash::SchemaId;
use crate::object_id::ObjectId as _;
use crate::remote::chunk;
use crate::remote::wire;
use crate::remote::wire::FrameKind;
use crate::remote::wire::Status;
use crate::remote::wire::WireError;
use crate::remote::wire::read_frame;
use crate::remote::wire::status_code;
use crate::remote::wire::write_frame;
use crate::store::Store;
use crate::store::StoreError;
use crate::tensor::Payload;
use crate::tensor::PayloadKind;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server replied with status {code}: {message}")]
    Server { code: u32, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Branch(#[from] BranchError),
}

impl ClientError {
    fn from_status(status: Status) -> Self {
        Self::Server {
            code: status.code,
            message: status.message,
        }
    }
}

/// Fails unless the reply status is OK. `allow` lists additional codes
/// treated as success (idempotent re-pushes).
fn check_status(status: Option<Status>, allow: &[u32]) -> Result<u32, ClientError> {
    match status {
        None => Ok(status_code::OK),
        Some(status) if status.code == status_code::OK || allow.contains(&status.code) => {
            Ok(status.code)
        }
        Some(status) => Err(ClientError::from_status(status)),
    }
}

/// Outcome of a push driver run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushReport {
    pub commits: usize,
    pub schemas: usize,
    pub payloads: usize,
}

/// Outcome of a fetch driver run. Payloads are not transferred; fetched
/// commits reference them through remote placeholder records until
/// [`RemoteClient::fetch_data`] resolves them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub commits: usize,
    pub schemas: usize,
    pub remote_digests: Vec<DataId>,
}

/// A connection to one remote repository server.
pub struct RemoteClient {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    push_allowed: bool,
    push_max_nbytes: u64,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("push_allowed", &self.push_allowed)
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    /// Connects, authenticates, and retrieves the server-advertised limits.
    pub async fn connect(
        addr: std::net::SocketAddr,
        auth: Option<(&str, &str)>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(WireError::Io)?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            push_allowed: false,
            push_max_nbytes: 0,
        };

        let (username, password) = auth.unwrap_or_default();
        write_frame(
            &mut client.writer,
            FrameKind::Handshake,
            &wire::Handshake {
                username: username.to_string(),
                password: password.to_string(),
            },
        )
        .await?;
        let reply: wire::HandshakeReply = client
            .expect_reply(FrameKind::HandshakeReply, "HandshakeReply")
            .await?;
        check_status(reply.status, &[])?;
        client.push_allowed = reply.push_allowed;

        let config = client.get_client_config().await?;
        client.push_max_nbytes = config.push_max_nbytes;
        Ok(client)
    }

    /// Whether the server will accept push operations from this caller.
    pub fn push_allowed(&self) -> bool {
        self.push_allowed
    }

    /// Payload batch budget advertised by the server.
    pub fn push_max_nbytes(&self) -> u64 {
        self.push_max_nbytes
    }

    async fn expect_reply<M: prost::Message + Default>(
        &mut self,
        kind: FrameKind,
        name: &'static str,
    ) -> Result<M, ClientError> {
        let frame = read_frame(&mut self.reader).await?;
        if frame.kind == FrameKind::Status {
            return Err(ClientError::from_status(frame.decode()?));
        }
        frame.expect(kind, name)?;
        Ok(frame.decode()?)
    }

    // ---- unary operations ----

    pub async fn ping(&mut self) -> Result<String, ClientError> {
        write_frame(&mut self.writer, FrameKind::Ping, &wire::Ping {}).await?;
        let reply: wire::PingReply = self.expect_reply(FrameKind::PingReply, "PingReply").await?;
        check_status(reply.status, &[])?;
        Ok(reply.result)
    }

    pub async fn get_client_config(&mut self) -> Result<wire::ClientConfigReply, ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::ClientConfig,
            &wire::ClientConfigRequest {},
        )
        .await?;
        let reply: wire::ClientConfigReply = self
            .expect_reply(FrameKind::ClientConfigReply, "ClientConfigReply")
            .await?;
        check_status(reply.status.clone(), &[])?;
        Ok(reply)
    }

    /// Head of a branch on the server; `None` for a branch with no commits.
    pub async fn fetch_branch(&mut self, name: &str) -> Result<Option<CommitId>, ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::FetchBranch,
            &wire::FetchBranchRequest {
                name: name.to_string(),
            },
        )
        .await?;
        let reply: wire::FetchBranchReply = self
            .expect_reply(FrameKind::FetchBranchReply, "FetchBranchReply")
            .await?;
        check_status(reply.status, &[])?;
        let rec = reply
            .rec
            .ok_or_else(|| ClientError::Protocol("missing branch record".to_string()))?;
        if rec.commit.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CommitId::new(rec.commit)))
        }
    }

    /// Advances a branch head on the server. Pushing the unchanged head is a
    /// no-op (`false`).
    pub async fn push_branch(&mut self, name: &str, head: &CommitId) -> Result<bool, ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::PushBranch,
            &wire::PushBranchRequest {
                rec: Some(wire::BranchRecord {
                    name: name.to_string(),
                    commit: head.to_bytes(),
                }),
            },
        )
        .await?;
        let reply: wire::PushBranchReply = self
            .expect_reply(FrameKind::PushBranchReply, "PushBranchReply")
            .await?;
        Ok(check_status(reply.status, &[status_code::ALREADY_EXISTS])? == status_code::OK)
    }

    /// Downloads a commit and verifies its digest over the received parents,
    /// spec, and ref blob.
    pub async fn fetch_commit(
        &mut self,
        id: &CommitId,
    ) -> Result<(Vec<CommitId>, Vec<u8>, Vec<u8>), ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::FetchCommit,
            &wire::FetchCommitRequest {
                commit: id.to_bytes(),
            },
        )
        .await?;
        let header: wire::CommitHeader = self
            .expect_reply(FrameKind::CommitHeader, "CommitHeader")
            .await?;
        let ref_blob = self
            .read_blob(header.total_nbytes, FrameKind::CommitChunk)
            .await?;
        let parents: Vec<CommitId> = header.parents.into_iter().map(CommitId::new).collect();
        let actual = content_hash::commit_digest(&parents, &header.spec, &ref_blob);
        if &actual != id {
            return Err(ClientError::Protocol(format!(
                "fetched commit hashes to {}, expected {}",
                actual.hex(),
                id.hex()
            )));
        }
        Ok((parents, header.spec, ref_blob))
    }

    /// Uploads a commit. Returns `false` when the server already had it.
    pub async fn push_commit(
        &mut self,
        id: &CommitId,
        parents: &[CommitId],
        spec: &[u8],
        ref_blob: &[u8],
    ) -> Result<bool, ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::CommitHeader,
            &wire::CommitHeader {
                commit: id.to_bytes(),
                parents: parents.iter().map(|p| p.to_bytes()).collect(),
                spec: spec.to_vec(),
                total_nbytes: ref_blob.len() as u64,
            },
        )
        .await?;
        for data in chunk::chunk_bytes(ref_blob) {
            write_frame(
                &mut self.writer,
                FrameKind::CommitChunk,
                &wire::DataChunk {
                    data: data.to_vec(),
                },
            )
            .await?;
        }
        let reply: wire::PushCommitReply = self
            .expect_reply(FrameKind::PushCommitReply, "PushCommitReply")
            .await?;
        Ok(check_status(reply.status, &[status_code::ALREADY_EXISTS])? == status_code::OK)
    }

    pub async fn fetch_schema(&mut self, id: &SchemaId) -> Result<Vec<u8>, ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::FetchSchema,
            &wire::FetchSchemaRequest {
                digest: id.to_bytes(),
            },
        )
        .await?;
        let reply: wire::FetchSchemaReply = self
            .expect_reply(FrameKind::FetchSchemaReply, "FetchSchemaReply")
            .await?;
        check_status(reply.status, &[])?;
        let rec = reply
            .rec
            .ok_or_else(|| ClientError::Protocol("missing schema record".to_string()))?;
        let actual = content_hash::schema_digest(&rec.blob);
        if &actual != id {
            return Err(ClientError::Protocol(format!(
                "fetched schema hashes to {}, expected {}",
                actual.hex(),
                id.hex()
            )));
        }
        Ok(rec.blob)
    }

    /// Uploads a schema blob. Returns `false` when the server already had it.
    pub async fn push_schema(&mut self, id: &SchemaId, blob: &[u8]) -> Result<bool, ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::PushSchema,
            &wire::PushSchemaRequest {
                rec: Some(wire::SchemaRecord {
                    digest: id.to_bytes(),
                    blob: blob.to_vec(),
                }),
            },
        )
        .await?;
        let reply: wire::PushSchemaReply = self
            .expect_reply(FrameKind::PushSchemaReply, "PushSchemaReply")
            .await?;
        Ok(check_status(reply.status, &[status_code::ALREADY_EXISTS])? == status_code::OK)
    }

    async fn find_missing_commits(
        &mut self,
        kind: FrameKind,
        branch: &str,
        head: Option<&CommitId>,
        commits: &[CommitId],
    ) -> Result<wire::FindMissingCommitsReply, ClientError> {
        write_frame(
            &mut self.writer,
            kind,
            &wire::FindMissingCommitsRequest {
                branch: Some(wire::BranchRecord {
                    name: branch.to_string(),
                    commit: head.map(CommitId::to_bytes).unwrap_or_default(),
                }),
                commits: commits.iter().map(CommitId::to_bytes).collect(),
            },
        )
        .await?;
        let reply: wire::FindMissingCommitsReply = self
            .expect_reply(FrameKind::FindMissingCommitsReply, "FindMissingCommitsReply")
            .await?;
        check_status(reply.status.clone(), &[])?;
        Ok(reply)
    }

    /// Commits on the server's branch that this client lacks.
    pub async fn fetch_find_missing_commits(
        &mut self,
        branch: &str,
        commits: &[CommitId],
    ) -> Result<(Option<CommitId>, Vec<CommitId>), ClientError> {
        let reply = self
            .find_missing_commits(FrameKind::FetchFindMissingCommits, branch, None, commits)
            .await?;
        let head = reply
            .branch
            .filter(|rec| !rec.commit.is_empty())
            .map(|rec| CommitId::new(rec.commit));
        Ok((
            head,
            reply.commits.into_iter().map(CommitId::new).collect(),
        ))
    }

    /// Commits this client has that the server lacks.
    pub async fn push_find_missing_commits(
        &mut self,
        branch: &str,
        head: &CommitId,
        commits: &[CommitId],
    ) -> Result<Vec<CommitId>, ClientError> {
        let reply = self
            .find_missing_commits(
                FrameKind::PushFindMissingCommits,
                branch,
                Some(head),
                commits,
            )
            .await?;
        Ok(reply.commits.into_iter().map(CommitId::new).collect())
    }

    async fn find_missing_schemas(
        &mut self,
        kind: FrameKind,
        commit: &CommitId,
        schemas: &[SchemaId],
    ) -> Result<Vec<SchemaId>, ClientError> {
        write_frame(
            &mut self.writer,
            kind,
            &wire::FindMissingSchemasRequest {
                commit: commit.to_bytes(),
                schema_digests: schemas.iter().map(SchemaId::to_bytes).collect(),
            },
        )
        .await?;
        let reply: wire::FindMissingSchemasReply = self
            .expect_reply(FrameKind::FindMissingSchemasReply, "FindMissingSchemasReply")
            .await?;
        check_status(reply.status, &[])?;
        Ok(reply.schema_digests.into_iter().map(SchemaId::new).collect())
    }

    pub async fn fetch_find_missing_schemas(
        &mut self,
        commit: &CommitId,
        known: &[SchemaId],
    ) -> Result<Vec<SchemaId>, ClientError> {
        self.find_missing_schemas(FrameKind::FetchFindMissingSchemas, commit, known)
            .await
    }

    pub async fn push_find_missing_schemas(
        &mut self,
        commit: &CommitId,
        own: &[SchemaId],
    ) -> Result<Vec<SchemaId>, ClientError> {
        self.find_missing_schemas(FrameKind::PushFindMissingSchemas, commit, own)
            .await
    }

    async fn find_missing_hashes(
        &mut self,
        kind: FrameKind,
        commit: &CommitId,
        digests: &[DataId],
    ) -> Result<Vec<DataId>, ClientError> {
        let pack = chunk::pack_digests(digests.iter().map(|id| id.as_bytes()))?;
        write_frame(
            &mut self.writer,
            kind,
            &wire::FindMissingHashesRequest {
                commit: commit.to_bytes(),
                pack,
            },
        )
        .await?;
        let reply: wire::FindMissingHashesReply = self
            .expect_reply(FrameKind::FindMissingHashesReply, "FindMissingHashesReply")
            .await?;
        check_status(reply.status, &[])?;
        Ok(chunk::unpack_digests(&reply.pack)?
            .into_iter()
            .map(DataId::new)
            .collect())
    }

    pub async fn fetch_find_missing_hash_records(
        &mut self,
        commit: &CommitId,
        known: &[DataId],
    ) -> Result<Vec<DataId>, ClientError> {
        self.find_missing_hashes(FrameKind::FetchFindMissingHashes, commit, known)
            .await
    }

    pub async fn push_find_missing_hash_records(
        &mut self,
        commit: &CommitId,
        own: &[DataId],
    ) -> Result<Vec<DataId>, ClientError> {
        self.find_missing_hashes(FrameKind::PushFindMissingHashes, commit, own)
            .await
    }

    // ---- streaming operations ----

    async fn find_data_origin(
        &mut self,
        kind: FrameKind,
        items: &[(DataId, u32)],
    ) -> Result<Vec<wire::DataOriginReply>, ClientError> {
        write_frame(&mut self.writer, kind, &wire::FindDataOriginStart {}).await?;
        for (digest, payload_kind) in items {
            write_frame(
                &mut self.writer,
                FrameKind::DataOriginItem,
                &wire::DataOriginItem {
                    digest: digest.to_bytes(),
                    kind: *payload_kind,
                    compression_desired: true,
                },
            )
            .await?;
        }
        write_frame(&mut self.writer, FrameKind::StreamEnd, &wire::StreamEnd {}).await?;

        let mut replies = vec![];
        let mut error = None;
        loop {
            let frame = read_frame(&mut self.reader).await?;
            match frame.kind {
                FrameKind::DataOriginReply => replies.push(frame.decode()?),
                FrameKind::Status => error = Some(frame.decode::<Status>()?),
                FrameKind::StreamEnd => break,
                other => {
                    return Err(WireError::UnexpectedFrame {
                        expected: "DataOriginReply or StreamEnd",
                        got: other,
                    }
                    .into());
                }
            }
        }
        match error {
            Some(status) => Err(ClientError::from_status(status)),
            None => Ok(replies),
        }
    }

    /// Origin info for digests this client wants to fetch.
    pub async fn fetch_find_data_origin(
        &mut self,
        digests: &[DataId],
    ) -> Result<Vec<wire::DataOriginReply>, ClientError> {
        let items: Vec<(DataId, u32)> = digests.iter().map(|id| (id.clone(), 0)).collect();
        self.find_data_origin(FrameKind::FetchFindDataOrigin, &items)
            .await
    }

    /// Advertises digests this client plans to push; the server answers with
    /// the expected URI and compression per digest.
    pub async fn push_find_data_origin(
        &mut self,
        items: &[(DataId, u32)],
    ) -> Result<Vec<wire::DataOriginReply>, ClientError> {
        self.find_data_origin(FrameKind::PushFindDataOrigin, items)
            .await
    }

    pub async fn push_begin(&mut self) -> Result<(), ClientError> {
        write_frame(&mut self.writer, FrameKind::PushBegin, &wire::PushBeginRequest {}).await?;
        let reply: wire::PushBeginReply = self
            .expect_reply(FrameKind::PushBeginReply, "PushBeginReply")
            .await?;
        check_status(reply.status, &[])?;
        Ok(())
    }

    pub async fn push_end(&mut self) -> Result<(), ClientError> {
        write_frame(&mut self.writer, FrameKind::PushEnd, &wire::PushEndRequest {}).await?;
        let reply: wire::PushEndReply = self
            .expect_reply(FrameKind::PushEndReply, "PushEndReply")
            .await?;
        check_status(reply.status, &[])?;
        Ok(())
    }

    /// Uploads one payload's canonical bytes under the asserted `uri`
    /// digest. The server re-hashes and rejects mismatches with `DATA_LOSS`.
    pub async fn push_data(
        &mut self,
        uri: &str,
        kind: PayloadKind,
        canonical_bytes: &[u8],
    ) -> Result<(), ClientError> {
        let compressed = chunk::compress(canonical_bytes)?;
        write_frame(
            &mut self.writer,
            FrameKind::PushData,
            &wire::DataHeader {
                uri: uri.to_string(),
                kind: u32::from(kind.code()),
                comp_nbytes: compressed.len() as u64,
            },
        )
        .await?;
        for data in chunk::chunk_bytes(&compressed) {
            write_frame(
                &mut self.writer,
                FrameKind::DataChunk,
                &wire::DataChunk {
                    data: data.to_vec(),
                },
            )
            .await?;
        }
        let reply: wire::PushDataReply = self
            .expect_reply(FrameKind::PushDataReply, "PushDataReply")
            .await?;
        check_status(reply.status, &[])?;
        Ok(())
    }

    async fn read_blob(
        &mut self,
        total_nbytes: u64,
        kind: FrameKind,
    ) -> Result<Vec<u8>, ClientError> {
        let mut blob = Vec::with_capacity(total_nbytes as usize);
        while (blob.len() as u64) < total_nbytes {
            let frame = read_frame(&mut self.reader).await?;
            frame.expect(kind, "blob chunk")?;
            let chunk: wire::DataChunk = frame.decode()?;
            blob.extend_from_slice(&chunk.data);
        }
        Ok(blob)
    }

    /// One fetch-data exchange: received payloads plus the unsent remainder
    /// of a partial completion.
    async fn fetch_data_batch(
        &mut self,
        uris: &[String],
    ) -> Result<(Vec<(String, u32, Vec<u8>)>, Vec<String>), ClientError> {
        write_frame(
            &mut self.writer,
            FrameKind::FetchData,
            &wire::FetchDataRequest {
                uris: uris.to_vec(),
            },
        )
        .await?;
        let mut received = vec![];
        loop {
            let frame = read_frame(&mut self.reader).await?;
            match frame.kind {
                FrameKind::DataHeader => {
                    let header: wire::DataHeader = frame.decode()?;
                    let compressed = self
                        .read_blob(header.comp_nbytes, FrameKind::DataChunk)
                        .await?;
                    received.push((header.uri, header.kind, compressed));
                }
                FrameKind::FetchDataDone => {
                    let done: wire::FetchDataDone = frame.decode()?;
                    check_status(done.status, &[])?;
                    return Ok((received, done.unsent_uris));
                }
                FrameKind::Status => {
                    return Err(ClientError::from_status(frame.decode()?));
                }
                other => {
                    return Err(WireError::UnexpectedFrame {
                        expected: "DataHeader or FetchDataDone",
                        got: other,
                    }
                    .into());
                }
            }
        }
    }

    // ---- drivers ----

    /// Pushes a branch: reconcile commit sets, then per missing commit the
    /// schema and data-hash sets, stream the missing payloads inside a push
    /// context, upload the commits, and finally advance the branch head.
    pub async fn push(&mut self, store: &Store, branch: &str) -> Result<PushReport, ClientError> {
        let history = branch::history(store, branch)?;
        let head = history
            .last()
            .cloned()
            .ok_or_else(|| ClientError::Protocol(format!("branch {branch} has no commits")))?;
        let missing = self
            .push_find_missing_commits(branch, &head, &history)
            .await?;
        let missing_set: HashSet<&CommitId> = missing.iter().collect();
        tracing::debug!(branch, missing = missing.len(), "starting push");

        let mut report = PushReport::default();
        for id in history.iter().filter(|id| missing_set.contains(id)) {
            let contents = store.read_commit_contents(id)?;

            let schemas: Vec<SchemaId> =
                contents.schema_digests().cloned().unique().collect();
            for schema_id in self.push_find_missing_schemas(id, &schemas).await? {
                let blob = store.schema_blob(&schema_id)?;
                if self.push_schema(&schema_id, &blob).await? {
                    report.schemas += 1;
                }
            }

            let digests: Vec<DataId> = contents.data_digests().cloned().unique().collect();
            let missing_data = self.push_find_missing_hash_records(id, &digests).await?;
            if !missing_data.is_empty() {
                let mut to_send = vec![];
                for digest in &missing_data {
                    let payload = store.read_payload_verified(digest)?;
                    to_send.push((digest.clone(), payload));
                }
                self.push_begin().await?;
                let items: Vec<(DataId, u32)> = to_send
                    .iter()
                    .map(|(digest, payload)| (digest.clone(), u32::from(payload.kind().code())))
                    .collect();
                let origins = self.push_find_data_origin(&items).await?;
                for ((_, payload), origin) in to_send.iter().zip(&origins) {
                    self.push_data(&origin.uri, payload.kind(), &payload.canonical_bytes())
                        .await?;
                    report.payloads += 1;
                }
                self.push_end().await?;
            }

            let commit = store.read_commit(id)?;
            let ref_blob = store.ref_blob_bytes(id)?;
            if self
                .push_commit(id, &commit.parents, &commit.spec.to_bytes(), &ref_blob)
                .await?
            {
                report.commits += 1;
            }
        }

        self.push_branch(branch, &head).await?;
        tracing::info!(branch, ?report, "push complete");
        Ok(report)
    }

    /// Fetches a branch's commits, specs, and schemas. Payload digests new
    /// to this repository are recorded as remote placeholders; resolve them
    /// with [`fetch_data`].
    ///
    /// [`fetch_data`]: Self::fetch_data
    pub async fn fetch(&mut self, store: &Store, branch: &str) -> Result<FetchReport, ClientError> {
        let local_history = match branch::branch_head(store, branch) {
            Ok(_) => branch::history(store, branch)?,
            Err(BranchError::NotFound(_)) => vec![],
            Err(err) => return Err(err.into()),
        };
        let (server_head, missing) = self
            .fetch_find_missing_commits(branch, &local_history)
            .await?;
        let server_head = server_head
            .ok_or_else(|| ClientError::Protocol(format!("branch {branch} is empty on server")))?;
        tracing::debug!(branch, missing = missing.len(), "starting fetch");

        let mut report = FetchReport::default();
        for id in &missing {
            let (parents, spec, ref_blob) = self.fetch_commit(id).await?;

            let known_schemas = store.all_schema_digests()?;
            for schema_id in self.fetch_find_missing_schemas(id, &known_schemas).await? {
                let blob = self.fetch_schema(&schema_id).await?;
                if store.put_schema_blob(&schema_id, &blob)? {
                    report.schemas += 1;
                }
            }

            let known_digests = store.all_data_digests()?;
            for digest in self
                .fetch_find_missing_hash_records(id, &known_digests)
                .await?
            {
                store.record_remote_data(&digest)?;
                report.remote_digests.push(digest);
            }

            if store.write_commit_records(id, &parents, &spec, &ref_blob)? {
                report.commits += 1;
            }
        }

        match branch::branch_head(store, branch) {
            Ok(_) => branch::set_branch_head(store, branch, &server_head, true)?,
            Err(BranchError::NotFound(_)) => {
                branch::create_branch(store, branch, Some(&server_head))?;
            }
            Err(err) => return Err(err.into()),
        }
        tracing::info!(branch, ?report, "fetch complete");
        Ok(report)
    }

    /// Downloads payloads for the given digests, honoring the server's
    /// partial-completion contract by resubmitting any unsent remainder.
    /// Returns the number of payloads materialized locally.
    pub async fn fetch_data(
        &mut self,
        store: &Store,
        digests: &[DataId],
    ) -> Result<usize, ClientError> {
        if digests.is_empty() {
            return Ok(0);
        }
        let origins = self.fetch_find_data_origin(digests).await?;
        let mut pending: Vec<String> = origins.into_iter().map(|origin| origin.uri).collect();
        let mut fetched = 0;
        while !pending.is_empty() {
            let (received, unsent) = self.fetch_data_batch(&pending).await?;
            if received.is_empty() {
                return Err(ClientError::Protocol(
                    "server made no progress on fetch-data batch".to_string(),
                ));
            }
            for (uri, kind_code, compressed) in received {
                let raw = chunk::decompress(&compressed)?;
                let kind = PayloadKind::from_code(kind_code as u8)
                    .map_err(|err| ClientError::Protocol(err.to_string()))?;
                let payload = Payload::from_canonical_bytes(kind, &raw)
                    .map_err(|err| ClientError::Protocol(err.to_string()))?;
                let digest = content_hash::data_digest(&payload);
                if digest.hex() != uri {
                    return Err(ClientError::Protocol(format!(
                        "fetched payload hashes to {}, expected {uri}",
                        digest.hex()
                    )));
                }
                store.write_transferred_payload(&payload)?;
                fetched += 1;
            }
            pending = unsent;
        }
        tracing::info!(fetched, "fetch-data complete");
        Ok(fetched)
    }
}

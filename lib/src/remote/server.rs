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

//! The remote protocol server.
//!
//! One task per connection; every connection authenticates at handshake and
//! then issues request frames. Push mutations are gated on the writer
//! context opened by `PushBegin`/`PushEnd` (reference-counted, so nested
//! acquisition by one holder is fine) and serialized by the store's writer
//! lock. Errors are carried in-band as status frames; the transport stream
//! itself always terminates cleanly.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::BufReader;
use tokio::io::BufWriter;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use crate::branch;
use crate::branch::BranchError;
use crate::content_hash;
use crate::content_hash::CommitId;
use crate::content_hash::DataId;
use crate::content_hash::SchemaId;
use crate::object_id::ObjectId as _;
use crate::remote::chunk;
use crate::remote::config::ServerConfig;
use crate::remote::wire;
use crate::remote::wire::Frame;
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

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] crate::remote::config::ConfigError),
}

/// Shared state of one serving repository.
pub struct RemoteServer {
    store: Arc<Store>,
    config: ServerConfig,
    // Writer-context refcount across all connections.
    push_context: Mutex<usize>,
}

impl std::fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServer")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl RemoteServer {
    /// Initializes (or opens) the serving repository at `repo_root`.
    pub fn new(repo_root: &Path, config: ServerConfig) -> Result<Arc<Self>, StoreError> {
        let store = Store::init(repo_root)?;
        Ok(Arc::new(Self {
            store: Arc::new(store),
            config,
            push_context: Mutex::new(0),
        }))
    }

    /// Like [`new`], reading (and on first start writing) the server config
    /// file inside the repository directory.
    ///
    /// [`new`]: Self::new
    pub fn open(repo_root: &Path) -> Result<Arc<Self>, ServerError> {
        let config = ServerConfig::load_or_create(&repo_root.join(crate::store::REPO_DIR))?;
        Ok(Self::new(repo_root, config)?)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Accept loop; one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!(addr = ?listener.local_addr(), "server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(?peer, "connection accepted");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    tracing::debug!(?peer, %err, "connection ended with error");
                }
            });
        }
    }

    fn push_context_open(&self) -> bool {
        *self.push_context.lock().unwrap() > 0
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), WireError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);
        let mut conn = Connection {
            push_allowed: false,
            held_contexts: 0,
        };

        let result = self
            .connection_loop(&mut reader, &mut writer, &mut conn)
            .await;

        // A cancelled or dropped connection releases whatever writer
        // contexts it still holds.
        if conn.held_contexts > 0 {
            let mut count = self.push_context.lock().unwrap();
            *count = count.saturating_sub(conn.held_contexts);
        }
        result
    }

    async fn connection_loop<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        conn: &mut Connection,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let frame = read_frame(reader).await?;
        frame.expect(FrameKind::Handshake, "Handshake")?;
        let handshake: wire::Handshake = frame.decode()?;
        conn.push_allowed = !self.config.restrict_push
            || (handshake.username == self.config.username
                && handshake.password == self.config.password);
        write_frame(
            writer,
            FrameKind::HandshakeReply,
            &wire::HandshakeReply {
                push_allowed: conn.push_allowed,
                status: Status::ok(),
            },
        )
        .await?;

        loop {
            let frame = match read_frame(reader).await {
                Ok(frame) => frame,
                Err(WireError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            self.dispatch(frame, reader, writer, conn).await?;
        }
    }

    async fn dispatch<R, W>(
        &self,
        frame: Frame,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        conn: &mut Connection,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match frame.kind {
            FrameKind::Ping => {
                write_frame(
                    writer,
                    FrameKind::PingReply,
                    &wire::PingReply {
                        result: "PONG".to_string(),
                        status: Status::ok(),
                    },
                )
                .await
            }
            FrameKind::ClientConfig => {
                write_frame(
                    writer,
                    FrameKind::ClientConfigReply,
                    &wire::ClientConfigReply {
                        push_max_nbytes: self.config.push_max_nbytes,
                        enable_compression: self.config.enable_compression,
                        optimization_target: self.config.optimization_target.clone(),
                        status: Status::ok(),
                    },
                )
                .await
            }
            FrameKind::FetchBranch => self.fetch_branch(frame, writer).await,
            FrameKind::PushBranch => self.push_branch(frame, writer, conn).await,
            FrameKind::FetchCommit => self.fetch_commit(frame, writer).await,
            FrameKind::CommitHeader => self.push_commit(frame, reader, writer, conn).await,
            FrameKind::FetchSchema => self.fetch_schema(frame, writer).await,
            FrameKind::PushSchema => self.push_schema(frame, writer, conn).await,
            FrameKind::FetchFindMissingCommits => {
                self.fetch_find_missing_commits(frame, writer).await
            }
            FrameKind::PushFindMissingCommits => {
                self.push_find_missing_commits(frame, writer).await
            }
            FrameKind::FetchFindMissingSchemas => {
                self.fetch_find_missing_schemas(frame, writer).await
            }
            FrameKind::PushFindMissingSchemas => {
                self.push_find_missing_schemas(frame, writer).await
            }
            FrameKind::FetchFindMissingHashes => {
                self.fetch_find_missing_hashes(frame, writer).await
            }
            FrameKind::PushFindMissingHashes => {
                self.push_find_missing_hashes(frame, writer).await
            }
            FrameKind::FetchFindDataOrigin => self.fetch_find_data_origin(reader, writer).await,
            FrameKind::PushFindDataOrigin => self.push_find_data_origin(reader, writer).await,
            FrameKind::FetchData => self.fetch_data(frame, writer).await,
            FrameKind::PushBegin => {
                let status = if conn.push_allowed {
                    *self.push_context.lock().unwrap() += 1;
                    conn.held_contexts += 1;
                    Status::ok()
                } else {
                    push_denied()
                };
                write_frame(writer, FrameKind::PushBeginReply, &wire::PushBeginReply { status })
                    .await
            }
            FrameKind::PushEnd => {
                let status = if conn.held_contexts > 0 {
                    conn.held_contexts -= 1;
                    let mut count = self.push_context.lock().unwrap();
                    *count = count.saturating_sub(1);
                    Status::ok()
                } else {
                    Status::err(
                        status_code::FAILED_PRECONDITION,
                        "no push context is open on this connection",
                    )
                };
                write_frame(writer, FrameKind::PushEndReply, &wire::PushEndReply { status })
                    .await
            }
            FrameKind::PushData => self.push_data(frame, reader, writer, conn).await,
            other => Err(WireError::UnexpectedFrame {
                expected: "request",
                got: other,
            }),
        }
    }

    async fn fetch_branch<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FetchBranchRequest = frame.decode()?;
        let reply = match branch::branch_head(&self.store, &request.name) {
            Ok(head) => wire::FetchBranchReply {
                rec: Some(wire::BranchRecord {
                    name: request.name,
                    commit: head.map(|id| id.to_bytes()).unwrap_or_default(),
                }),
                status: Status::ok(),
            },
            Err(BranchError::NotFound(name)) => wire::FetchBranchReply {
                rec: None,
                status: Status::err(
                    status_code::NOT_FOUND,
                    format!("branch {name} does not exist on server"),
                ),
            },
            Err(err) => wire::FetchBranchReply {
                rec: None,
                status: internal(err),
            },
        };
        write_frame(writer, FrameKind::FetchBranchReply, &reply).await
    }

    /// Advances (or creates) a branch head pushed by the client. Pushing the
    /// current head again is reported `ALREADY_EXISTS` as a no-op indicator.
    async fn push_branch<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
        conn: &Connection,
    ) -> Result<(), WireError> {
        let request: wire::PushBranchRequest = frame.decode()?;
        let status = if !conn.push_allowed {
            push_denied()
        } else {
            match request.rec {
                None => Status::err(status_code::INTERNAL, "missing branch record"),
                Some(rec) => {
                    let commit = CommitId::new(rec.commit);
                    match branch::branch_head(&self.store, &rec.name) {
                        Err(BranchError::NotFound(_)) => {
                            match branch::create_branch(&self.store, &rec.name, Some(&commit)) {
                                Ok(()) => Status::ok(),
                                Err(BranchError::CommitNotFound(hex)) => Status::err(
                                    status_code::NOT_FOUND,
                                    format!("commit {hex} does not exist on server"),
                                ),
                                Err(err) => internal(err),
                            }
                        }
                        Ok(Some(head)) if head == commit => Status::err(
                            status_code::ALREADY_EXISTS,
                            format!("no change to branch {} with head {head}", rec.name),
                        ),
                        Ok(_) => {
                            match branch::set_branch_head(&self.store, &rec.name, &commit, true) {
                                Ok(()) => Status::ok(),
                                Err(BranchError::CommitNotFound(hex)) => Status::err(
                                    status_code::NOT_FOUND,
                                    format!("commit {hex} does not exist on server"),
                                ),
                                Err(err) => internal(err),
                            }
                        }
                        Err(err) => internal(err),
                    }
                }
            }
        };
        write_frame(writer, FrameKind::PushBranchReply, &wire::PushBranchReply { status }).await
    }

    async fn fetch_commit<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FetchCommitRequest = frame.decode()?;
        let id = CommitId::new(request.commit);
        let commit = match self.store.read_commit(&id) {
            Ok(commit) => commit,
            Err(StoreError::CommitNotFound(hex)) => {
                // In-band error frame; the stream then ends cleanly.
                return write_status(
                    writer,
                    status_code::NOT_FOUND,
                    format!("commit {hex} does not exist on server"),
                )
                .await;
            }
            Err(err) => {
                return write_status(writer, status_code::INTERNAL, err.to_string()).await;
            }
        };
        let ref_blob = match self.store.ref_blob_bytes(&id) {
            Ok(blob) => blob,
            Err(err) => {
                return write_status(writer, status_code::INTERNAL, err.to_string()).await;
            }
        };
        write_frame(
            writer,
            FrameKind::CommitHeader,
            &wire::CommitHeader {
                commit: id.to_bytes(),
                parents: commit.parents.iter().map(|p| p.to_bytes()).collect(),
                spec: commit.spec.to_bytes(),
                total_nbytes: ref_blob.len() as u64,
            },
        )
        .await?;
        for data in chunk::chunk_bytes(&ref_blob) {
            write_frame(
                writer,
                FrameKind::CommitChunk,
                &wire::DataChunk {
                    data: data.to_vec(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Receives a commit upload. The digest is recomputed over the received
    /// parents, spec, and ref blob before anything is recorded.
    async fn push_commit<R, W>(
        &self,
        frame: Frame,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        conn: &Connection,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let header: wire::CommitHeader = frame.decode()?;
        let ref_blob =
            read_blob(reader, header.total_nbytes, FrameKind::CommitChunk).await?;

        let status = if !conn.push_allowed {
            push_denied()
        } else {
            let claimed = CommitId::new(header.commit);
            let parents: Vec<CommitId> =
                header.parents.into_iter().map(CommitId::new).collect();
            let actual = content_hash::commit_digest(&parents, &header.spec, &ref_blob);
            if actual != claimed {
                Status::err(
                    status_code::DATA_LOSS,
                    format!(
                        "commit digest mangled, received {} != expected {}",
                        actual.hex(),
                        claimed.hex()
                    ),
                )
            } else {
                match self
                    .store
                    .write_commit_records(&claimed, &parents, &header.spec, &ref_blob)
                {
                    Ok(true) => Status::ok(),
                    Ok(false) => Status::err(
                        status_code::ALREADY_EXISTS,
                        format!("commit {} already exists", claimed.hex()),
                    ),
                    Err(err) => internal(err),
                }
            }
        };
        write_frame(writer, FrameKind::PushCommitReply, &wire::PushCommitReply { status }).await
    }

    async fn fetch_schema<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FetchSchemaRequest = frame.decode()?;
        let id = SchemaId::new(request.digest);
        let reply = match self.store.schema_blob(&id) {
            Ok(blob) => wire::FetchSchemaReply {
                rec: Some(wire::SchemaRecord {
                    digest: id.to_bytes(),
                    blob,
                }),
                status: Status::ok(),
            },
            Err(StoreError::SchemaNotFound(hex)) => wire::FetchSchemaReply {
                rec: None,
                status: Status::err(
                    status_code::NOT_FOUND,
                    format!("schema hash {hex} does not exist on server"),
                ),
            },
            Err(err) => wire::FetchSchemaReply {
                rec: None,
                status: internal(err),
            },
        };
        write_frame(writer, FrameKind::FetchSchemaReply, &reply).await
    }

    async fn push_schema<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
        conn: &Connection,
    ) -> Result<(), WireError> {
        let request: wire::PushSchemaRequest = frame.decode()?;
        let status = if !conn.push_allowed {
            push_denied()
        } else {
            match request.rec {
                None => Status::err(status_code::INTERNAL, "missing schema record"),
                Some(rec) => {
                    let claimed = SchemaId::new(rec.digest);
                    let actual = content_hash::schema_digest(&rec.blob);
                    if actual != claimed {
                        Status::err(
                            status_code::DATA_LOSS,
                            format!(
                                "schema digest mangled, received {} != expected {}",
                                actual.hex(),
                                claimed.hex()
                            ),
                        )
                    } else {
                        match self.store.put_schema_blob(&claimed, &rec.blob) {
                            Ok(true) => Status::ok(),
                            Ok(false) => Status::err(
                                status_code::ALREADY_EXISTS,
                                format!("schema {} already exists on server", claimed.hex()),
                            ),
                            Err(err) => internal(err),
                        }
                    }
                }
            }
        };
        write_frame(writer, FrameKind::PushSchemaReply, &wire::PushSchemaReply { status }).await
    }

    /// Commits on the server's branch that the client does not have.
    async fn fetch_find_missing_commits<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FindMissingCommitsRequest = frame.decode()?;
        let branch_name = request
            .branch
            .as_ref()
            .map(|rec| rec.name.clone())
            .unwrap_or_default();
        let reply = match branch::history(&self.store, &branch_name) {
            Err(BranchError::NotFound(name)) => wire::FindMissingCommitsReply {
                branch: None,
                commits: vec![],
                status: Status::err(
                    status_code::NOT_FOUND,
                    format!("branch does not exist: {name}"),
                ),
            },
            Err(err) => wire::FindMissingCommitsReply {
                branch: None,
                commits: vec![],
                status: internal(err),
            },
            Ok(history) => {
                let client_set: HashSet<&[u8]> =
                    request.commits.iter().map(Vec::as_slice).collect();
                let missing: Vec<Vec<u8>> = history
                    .iter()
                    .filter(|id| !client_set.contains(id.as_bytes()))
                    .map(|id| id.to_bytes())
                    .collect();
                let head = history.last().map(|id| id.to_bytes()).unwrap_or_default();
                wire::FindMissingCommitsReply {
                    branch: Some(wire::BranchRecord {
                        name: branch_name,
                        commit: head,
                    }),
                    commits: missing,
                    status: Status::ok(),
                }
            }
        };
        write_frame(writer, FrameKind::FindMissingCommitsReply, &reply).await
    }

    /// Commits the client has that this server does not.
    async fn push_find_missing_commits<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FindMissingCommitsRequest = frame.decode()?;
        let reply = match self.store.all_commit_ids() {
            Ok(all) => {
                let server_set: HashSet<Vec<u8>> =
                    all.into_iter().map(|id| id.to_bytes()).collect();
                let missing: Vec<Vec<u8>> = request
                    .commits
                    .iter()
                    .filter(|bytes| !server_set.contains(*bytes))
                    .cloned()
                    .collect();
                wire::FindMissingCommitsReply {
                    branch: request.branch,
                    commits: missing,
                    status: Status::ok(),
                }
            }
            Err(err) => wire::FindMissingCommitsReply {
                branch: request.branch,
                commits: vec![],
                status: internal(err),
            },
        };
        write_frame(writer, FrameKind::FindMissingCommitsReply, &reply).await
    }

    async fn fetch_find_missing_schemas<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FindMissingSchemasRequest = frame.decode()?;
        let id = CommitId::new(request.commit.clone());
        let reply = match self.store.read_commit_contents(&id) {
            Ok(contents) => {
                let client_set: HashSet<&[u8]> =
                    request.schema_digests.iter().map(Vec::as_slice).collect();
                let missing = contents
                    .schema_digests()
                    .filter(|digest| !client_set.contains(digest.as_bytes()))
                    .map(|digest| digest.to_bytes())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                wire::FindMissingSchemasReply {
                    commit: request.commit,
                    schema_digests: missing,
                    status: Status::ok(),
                }
            }
            Err(StoreError::CommitNotFound(hex)) => wire::FindMissingSchemasReply {
                commit: request.commit,
                schema_digests: vec![],
                status: Status::err(
                    status_code::NOT_FOUND,
                    format!("commit {hex} does not exist on server"),
                ),
            },
            Err(err) => wire::FindMissingSchemasReply {
                commit: request.commit,
                schema_digests: vec![],
                status: internal(err),
            },
        };
        write_frame(writer, FrameKind::FindMissingSchemasReply, &reply).await
    }

    async fn push_find_missing_schemas<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FindMissingSchemasRequest = frame.decode()?;
        let reply = match self.store.all_schema_digests() {
            Ok(all) => {
                let server_set: HashSet<Vec<u8>> =
                    all.into_iter().map(|id| id.to_bytes()).collect();
                let missing = request
                    .schema_digests
                    .iter()
                    .filter(|bytes| !server_set.contains(*bytes))
                    .cloned()
                    .collect();
                wire::FindMissingSchemasReply {
                    commit: request.commit,
                    schema_digests: missing,
                    status: Status::ok(),
                }
            }
            Err(err) => wire::FindMissingSchemasReply {
                commit: request.commit,
                schema_digests: vec![],
                status: internal(err),
            },
        };
        write_frame(writer, FrameKind::FindMissingSchemasReply, &reply).await
    }

    async fn fetch_find_missing_hashes<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FindMissingHashesRequest = frame.decode()?;
        let client_digests = chunk::unpack_digests(&request.pack)?;
        let id = CommitId::new(request.commit.clone());
        let reply = match self.store.read_commit_contents(&id) {
            Ok(contents) => {
                let client_set: HashSet<Vec<u8>> = client_digests.into_iter().collect();
                let missing: HashSet<Vec<u8>> = contents
                    .data_digests()
                    .filter(|digest| !client_set.contains(digest.as_bytes()))
                    .map(|digest| digest.to_bytes())
                    .collect();
                wire::FindMissingHashesReply {
                    commit: request.commit,
                    pack: chunk::pack_digests(missing.iter().map(Vec::as_slice))?,
                    status: Status::ok(),
                }
            }
            Err(StoreError::CommitNotFound(hex)) => wire::FindMissingHashesReply {
                commit: request.commit,
                pack: vec![],
                status: Status::err(
                    status_code::NOT_FOUND,
                    format!("commit {hex} does not exist on server"),
                ),
            },
            Err(err) => wire::FindMissingHashesReply {
                commit: request.commit,
                pack: vec![],
                status: internal(err),
            },
        };
        write_frame(writer, FrameKind::FindMissingHashesReply, &reply).await
    }

    async fn push_find_missing_hashes<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FindMissingHashesRequest = frame.decode()?;
        let client_digests = chunk::unpack_digests(&request.pack)?;
        let reply = match self.store.all_data_digests() {
            Ok(all) => {
                let server_set: HashSet<Vec<u8>> =
                    all.into_iter().map(|id| id.to_bytes()).collect();
                let missing: Vec<Vec<u8>> = client_digests
                    .into_iter()
                    .filter(|bytes| !server_set.contains(bytes))
                    .collect();
                wire::FindMissingHashesReply {
                    commit: request.commit,
                    pack: chunk::pack_digests(missing.iter().map(Vec::as_slice))?,
                    status: Status::ok(),
                }
            }
            Err(err) => wire::FindMissingHashesReply {
                commit: request.commit,
                pack: vec![],
                status: internal(err),
            },
        };
        write_frame(writer, FrameKind::FindMissingHashesReply, &reply).await
    }

    /// Bidirectional stream: origin info for digests the client wants to
    /// fetch. A digest with no hash record ends the stream with an in-band
    /// `NOT_FOUND` frame.
    async fn fetch_find_data_origin<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let items = read_origin_items(reader).await?;
        for item in &items {
            let digest = DataId::from_bytes(&item.digest);
            let locator = match self.store.locator_for(&digest) {
                Ok(Some(locator)) => locator,
                Ok(None) => {
                    write_status(
                        writer,
                        status_code::NOT_FOUND,
                        format!("hash does not exist: {}", digest.hex()),
                    )
                    .await?;
                    return write_frame(writer, FrameKind::StreamEnd, &wire::StreamEnd {})
                        .await;
                }
                Err(err) => {
                    write_status(writer, status_code::INTERNAL, err.to_string()).await?;
                    return write_frame(writer, FrameKind::StreamEnd, &wire::StreamEnd {})
                        .await;
                }
            };
            let kind = payload_kind_for_backend(locator.code());
            write_frame(
                writer,
                FrameKind::DataOriginReply,
                &wire::DataOriginReply {
                    digest: item.digest.clone(),
                    uri: digest.hex(),
                    kind: u32::from(kind.code()),
                    compression_expected: self.config.enable_compression,
                    compression_id: chunk::COMPRESSION_ID.to_string(),
                    compression_level: chunk::COMPRESSION_LEVEL,
                    status: Status::ok(),
                },
            )
            .await?;
        }
        write_frame(writer, FrameKind::StreamEnd, &wire::StreamEnd {}).await
    }

    /// Bidirectional stream: where the client should send each digest it
    /// plans to push, and the compression expected.
    async fn push_find_data_origin<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let items = read_origin_items(reader).await?;
        for item in &items {
            let digest = DataId::from_bytes(&item.digest);
            write_frame(
                writer,
                FrameKind::DataOriginReply,
                &wire::DataOriginReply {
                    digest: item.digest.clone(),
                    uri: digest.hex(),
                    kind: item.kind,
                    compression_expected: item.compression_desired,
                    compression_id: chunk::COMPRESSION_ID.to_string(),
                    compression_level: chunk::COMPRESSION_LEVEL,
                    status: Status::ok(),
                },
            )
            .await?;
        }
        write_frame(writer, FrameKind::StreamEnd, &wire::StreamEnd {}).await
    }

    /// Streams compressed payloads until the advertised byte budget is
    /// spent; the unsent remainder comes back in the closing frame for the
    /// client to resubmit.
    async fn fetch_data<W: AsyncWrite + Unpin>(
        &self,
        frame: Frame,
        writer: &mut BufWriter<W>,
    ) -> Result<(), WireError> {
        let request: wire::FetchDataRequest = frame.decode()?;
        let budget = self.config.push_max_nbytes;
        let mut spent: u64 = 0;
        let mut unsent = vec![];
        for (index, uri) in request.uris.iter().enumerate() {
            let Some(digest) = DataId::try_from_hex(uri) else {
                write_status(writer, status_code::NOT_FOUND, format!("bad uri: {uri}"))
                    .await?;
                return Ok(());
            };
            if spent >= budget {
                unsent.extend(request.uris[index..].iter().cloned());
                break;
            }
            let payload = match self.store.read_payload_verified(&digest) {
                Ok(payload) => payload,
                Err(StoreError::DataNotFound(hex)) => {
                    write_status(
                        writer,
                        status_code::NOT_FOUND,
                        format!("request uri does not exist: {hex}"),
                    )
                    .await?;
                    return Ok(());
                }
                Err(StoreError::Corrupt { expected, actual }) => {
                    write_status(
                        writer,
                        status_code::DATA_LOSS,
                        format!("payload {expected} read back as {actual}"),
                    )
                    .await?;
                    return Ok(());
                }
                Err(err) => {
                    write_status(writer, status_code::INTERNAL, err.to_string()).await?;
                    return Ok(());
                }
            };
            let raw = payload.canonical_bytes();
            spent += raw.len() as u64;
            let compressed = chunk::compress(&raw)?;
            write_frame(
                writer,
                FrameKind::DataHeader,
                &wire::DataHeader {
                    uri: uri.clone(),
                    kind: u32::from(payload.kind().code()),
                    comp_nbytes: compressed.len() as u64,
                },
            )
            .await?;
            for data in chunk::chunk_bytes(&compressed) {
                write_frame(
                    writer,
                    FrameKind::DataChunk,
                    &wire::DataChunk {
                        data: data.to_vec(),
                    },
                )
                .await?;
            }
        }
        write_frame(
            writer,
            FrameKind::FetchDataDone,
            &wire::FetchDataDone {
                unsent_uris: unsent,
                status: Status::ok(),
            },
        )
        .await
    }

    /// Receives one compressed payload. The bytes are re-hashed and compared
    /// against the client-asserted digest; on mismatch nothing from this
    /// batch is persisted.
    async fn push_data<R, W>(
        &self,
        frame: Frame,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        conn: &Connection,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let header: wire::DataHeader = frame.decode()?;
        // The chunk stream is always drained so the connection stays in
        // sync, even when the request is rejected.
        let compressed = read_blob(reader, header.comp_nbytes, FrameKind::DataChunk).await?;

        let status = if !conn.push_allowed {
            push_denied()
        } else if !self.push_context_open() {
            Status::err(
                status_code::FAILED_PRECONDITION,
                "attempt to push without opening context",
            )
        } else {
            self.persist_pushed_payload(&header.uri, header.kind, &compressed)
        };
        write_frame(writer, FrameKind::PushDataReply, &wire::PushDataReply { status }).await
    }

    fn persist_pushed_payload(
        &self,
        uri: &str,
        kind_code: u32,
        compressed: &[u8],
    ) -> Option<Status> {
        let Some(expected) = DataId::try_from_hex(uri) else {
            return Status::err(status_code::NOT_FOUND, format!("bad uri: {uri}"));
        };
        let raw = match chunk::decompress(compressed) {
            Ok(raw) => raw,
            Err(err) => return Status::err(status_code::INTERNAL, err.to_string()),
        };
        let Ok(kind) = PayloadKind::from_code(kind_code as u8) else {
            return Status::err(status_code::INTERNAL, format!("bad payload kind {kind_code}"));
        };
        let payload = match Payload::from_canonical_bytes(kind, &raw) {
            Ok(payload) => payload,
            Err(err) => return Status::err(status_code::DATA_LOSS, err.to_string()),
        };
        let received = content_hash::data_digest(&payload);
        if received != expected {
            tracing::warn!(
                received = %received.hex(),
                expected = %expected.hex(),
                "rejecting pushed payload with mangled digest"
            );
            return Status::err(
                status_code::DATA_LOSS,
                format!(
                    "hash mangled, received {} != expected digest {}",
                    received.hex(),
                    expected.hex()
                ),
            );
        }
        match self.store.write_transferred_payload(&payload) {
            Ok(_) => Status::ok(),
            Err(err) => internal(err),
        }
    }
}

struct Connection {
    push_allowed: bool,
    held_contexts: usize,
}

fn push_denied() -> Option<Status> {
    Status::err(
        status_code::PERMISSION_DENIED,
        "push operations restricted for caller",
    )
}

fn internal(err: impl std::fmt::Display) -> Option<Status> {
    Status::err(status_code::INTERNAL, err.to_string())
}

fn payload_kind_for_backend(code: crate::backend::BackendCode) -> PayloadKind {
    use crate::backend::BackendCode;
    if code == BackendCode::KV_STR {
        PayloadKind::Str
    } else if code == BackendCode::KV_BYTES {
        PayloadKind::Bytes
    } else {
        PayloadKind::Array
    }
}

async fn write_status<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    code: u32,
    message: String,
) -> Result<(), WireError> {
    let status = Status { code, message };
    write_frame(writer, FrameKind::Status, &status).await
}

/// Reads `total_nbytes` of blob data split over chunk frames of `kind`.
async fn read_blob<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    total_nbytes: u64,
    kind: FrameKind,
) -> Result<Vec<u8>, WireError> {
    let mut blob = Vec::with_capacity(total_nbytes as usize);
    while (blob.len() as u64) < total_nbytes {
        let frame = read_frame(reader).await?;
        frame.expect(kind, "blob chunk")?;
        let chunk: wire::DataChunk = frame.decode()?;
        blob.extend_from_slice(&chunk.data);
    }
    Ok(blob)
}

/// Reads `DataOriginItem` frames until the stream-end marker.
async fn read_origin_items<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Vec<wire::DataOriginItem>, WireError> {
    let mut items = vec![];
    loop {
        let frame = read_frame(reader).await?;
        match frame.kind {
            FrameKind::DataOriginItem => items.push(frame.decode()?),
            FrameKind::StreamEnd => return Ok(items),
            other => {
                return Err(WireError::UnexpectedFrame {
                    expected: "DataOriginItem or StreamEnd",
                    got: other,
                });
            }
        }
    }
}

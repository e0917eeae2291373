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

use std::net::SocketAddr;
use std::sync::Arc;

use assert_matches::assert_matches;
use depot_lib::content_hash;
use depot_lib::object_id::ObjectId as _;
use depot_lib::remote::client::ClientError;
use depot_lib::remote::client::RemoteClient;
use depot_lib::remote::config::ServerConfig;
use depot_lib::remote::server::RemoteServer;
use depot_lib::remote::wire::status_code;
use depot_lib::repo::DEFAULT_BRANCH;
use depot_lib::repo::Repository;
use depot_lib::sample_key::SampleKey;
use depot_lib::schema::Schema;
use depot_lib::store::StoreError;
use depot_lib::tensor::DType;
use depot_lib::tensor::Payload;
use tempfile::TempDir;
use testutils::init_repo;
use testutils::payload5by7;

async fn start_server(config: ServerConfig) -> (TempDir, Arc<RemoteServer>, SocketAddr) {
    let dir = testutils::new_temp_dir();
    let server = RemoteServer::new(dir.path(), config).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));
    (dir, server, addr)
}

/// Repository with two commits on master: sample 0 in the first, sample 1
/// and a metadata entry in the second.
fn two_commit_repo() -> (TempDir, Repository) {
    let (dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co
        .init_arrayset("aset", Schema::array(DType::F64, vec![5, 7], false).unwrap())
        .unwrap();
    aset.set(SampleKey::Int(0), payload5by7(0.0)).unwrap();
    co.commit("first").unwrap();

    let aset = co.arrayset("aset").unwrap();
    aset.set(SampleKey::Int(1), payload5by7(1.0)).unwrap();
    co.metadata()
        .set(SampleKey::str("origin").unwrap(), "peer-a")
        .unwrap();
    co.commit("second").unwrap();
    co.close();
    (dir, repo)
}

#[tokio::test]
async fn test_server_open_writes_config_file() {
    let dir = testutils::new_temp_dir();
    let server = RemoteServer::open(dir.path()).unwrap();
    assert!(dir.path().join("depot").join("server_config.toml").is_file());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));

    let mut client = RemoteClient::connect(addr, None).await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn test_ping_and_client_config() {
    let (_dir, _server, addr) = start_server(ServerConfig::default()).await;
    let mut client = RemoteClient::connect(addr, None).await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "PONG");

    let config = client.get_client_config().await.unwrap();
    assert_eq!(config.push_max_nbytes, 32 << 20);
    assert!(config.enable_compression);
    assert_eq!(config.optimization_target, "throughput");
}

#[tokio::test]
async fn test_push_then_fresh_peer_sees_all_commits() {
    let (_sdir, server, addr) = start_server(ServerConfig::default()).await;
    let (_rdir, repo) = two_commit_repo();
    let history = repo.history(DEFAULT_BRANCH).unwrap();

    let mut client = RemoteClient::connect(addr, None).await.unwrap();
    let report = client.push(repo.store(), DEFAULT_BRANCH).await.unwrap();
    assert_eq!(report.commits, 2);
    assert!(report.payloads >= 2);

    // A fresh peer with no commits is missing exactly the pushed chain.
    let mut peer = RemoteClient::connect(addr, None).await.unwrap();
    let (head, missing) = peer
        .fetch_find_missing_commits(DEFAULT_BRANCH, &[])
        .await
        .unwrap();
    assert_eq!(head.as_ref(), history.last());
    let mut missing_sorted = missing.clone();
    missing_sorted.sort();
    let mut expected = history.clone();
    expected.sort();
    assert_eq!(missing_sorted, expected);

    // The server branch head advanced to the pushed head.
    assert_eq!(
        peer.fetch_branch(DEFAULT_BRANCH).await.unwrap().as_ref(),
        history.last()
    );
    assert!(server.store().has_commit(history.last().unwrap()).unwrap());
}

#[tokio::test]
async fn test_push_fetch_roundtrip_transfers_everything() {
    let (_sdir, _server, addr) = start_server(ServerConfig::default()).await;
    let (_adir, repo_a) = two_commit_repo();
    let history_a = repo_a.history(DEFAULT_BRANCH).unwrap();

    let mut client = RemoteClient::connect(addr, None).await.unwrap();
    client.push(repo_a.store(), DEFAULT_BRANCH).await.unwrap();

    // Fetch into a fresh repository: records first, payloads lazily.
    let (_cdir, repo_c) = init_repo();
    let report = client.fetch(repo_c.store(), DEFAULT_BRANCH).await.unwrap();
    assert_eq!(report.commits, 2);
    assert_eq!(repo_c.history(DEFAULT_BRANCH).unwrap(), history_a);

    let reader = repo_c.checkout().unwrap();
    let aset = reader.arrayset("aset").unwrap();
    assert!(aset.contains_remote_references().unwrap());
    assert_eq!(aset.remote_sample_keys().unwrap().len(), 2);
    assert_matches!(
        aset.get(&SampleKey::Int(0)),
        Err(depot_lib::arrayset::ArraysetError::Store(StoreError::Backend(_)))
    );
    // Metadata travels with the commit records.
    assert_eq!(
        reader.metadata().get(&SampleKey::str("origin").unwrap()).unwrap(),
        "peer-a"
    );

    let fetched = client
        .fetch_data(repo_c.store(), &report.remote_digests)
        .await
        .unwrap();
    assert_eq!(fetched, 2);
    assert!(!aset.contains_remote_references().unwrap());
    assert_eq!(aset.get(&SampleKey::Int(0)).unwrap(), payload5by7(0.0));
    assert_eq!(aset.get(&SampleKey::Int(1)).unwrap(), payload5by7(1.0));
}

#[tokio::test]
async fn test_tampered_payload_is_rejected_with_data_loss() {
    let (_sdir, server, addr) = start_server(ServerConfig::default()).await;
    let mut client = RemoteClient::connect(addr, None).await.unwrap();

    let good = Payload::Str("the real bytes".to_string());
    let evil = Payload::Str("mangled in flight".to_string());
    let asserted = content_hash::data_digest(&good);

    client.push_begin().await.unwrap();
    let result = client
        .push_data(&asserted.hex(), evil.kind(), &evil.canonical_bytes())
        .await;
    assert_matches!(
        result,
        Err(ClientError::Server { code, .. }) if code == status_code::DATA_LOSS
    );
    client.push_end().await.unwrap();

    // Nothing from the rejected batch was persisted under either digest.
    assert!(!server.store().has_data(&asserted).unwrap());
    assert!(
        !server
            .store()
            .has_data(&content_hash::data_digest(&evil))
            .unwrap()
    );
}

#[tokio::test]
async fn test_push_data_outside_context_fails_precondition() {
    let (_sdir, _server, addr) = start_server(ServerConfig::default()).await;
    let mut client = RemoteClient::connect(addr, None).await.unwrap();

    let payload = Payload::Str("no context".to_string());
    let digest = content_hash::data_digest(&payload);
    let result = client
        .push_data(&digest.hex(), payload.kind(), &payload.canonical_bytes())
        .await;
    assert_matches!(
        result,
        Err(ClientError::Server { code, .. }) if code == status_code::FAILED_PRECONDITION
    );
}

#[tokio::test]
async fn test_restricted_push_requires_credentials() {
    let config = ServerConfig {
        restrict_push: true,
        username: "admin".to_string(),
        password: "hunter2".to_string(),
        ..ServerConfig::default()
    };
    let (_sdir, _server, addr) = start_server(config).await;

    let mut anon = RemoteClient::connect(addr, None).await.unwrap();
    assert!(!anon.push_allowed());
    // Reads still work for unauthenticated callers.
    assert_eq!(anon.ping().await.unwrap(), "PONG");
    assert_matches!(
        anon.push_begin().await,
        Err(ClientError::Server { code, .. }) if code == status_code::PERMISSION_DENIED
    );

    let mut admin = RemoteClient::connect(addr, Some(("admin", "hunter2")))
        .await
        .unwrap();
    assert!(admin.push_allowed());
    admin.push_begin().await.unwrap();
    admin.push_end().await.unwrap();
}

#[tokio::test]
async fn test_fetch_data_partial_completion_resubmits() {
    let config = ServerConfig {
        // Force one payload per fetch-data batch.
        push_max_nbytes: 64,
        ..ServerConfig::default()
    };
    let (_sdir, server, addr) = start_server(config).await;

    let payloads: Vec<Payload> = (0..3)
        .map(|i| Payload::Str(format!("payload number {i} ").repeat(8)))
        .collect();
    let digests: Vec<_> = payloads
        .iter()
        .map(|payload| {
            server.store().write_transferred_payload(payload).unwrap()
        })
        .collect();

    let (_cdir, repo) = init_repo();
    let mut client = RemoteClient::connect(addr, None).await.unwrap();
    let fetched = client.fetch_data(repo.store(), &digests).await.unwrap();
    assert_eq!(fetched, 3);
    for (digest, payload) in digests.iter().zip(&payloads) {
        assert_eq!(&repo.store().read_payload_verified(digest).unwrap(), payload);
    }
}

#[tokio::test]
async fn test_push_is_idempotent() {
    let (_sdir, _server, addr) = start_server(ServerConfig::default()).await;
    let (_rdir, repo) = two_commit_repo();

    let mut client = RemoteClient::connect(addr, None).await.unwrap();
    let first = client.push(repo.store(), DEFAULT_BRANCH).await.unwrap();
    assert_eq!(first.commits, 2);

    // Re-pushing transfers nothing and still succeeds.
    let second = client.push(repo.store(), DEFAULT_BRANCH).await.unwrap();
    assert_eq!(second.commits, 0);
    assert_eq!(second.schemas, 0);
    assert_eq!(second.payloads, 0);
}

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

use assert_matches::assert_matches;
use depot_lib::checkout::CheckoutError;
use depot_lib::repo::DEFAULT_BRANCH;
use depot_lib::sample_key::SampleKey;
use depot_lib::schema::Schema;
use depot_lib::staging::CommitError;
use depot_lib::tensor::DType;
use testutils::init_repo;
use testutils::payload5by7;

fn schema() -> Schema {
    Schema::array(DType::F64, vec![5, 7], false).unwrap()
}

#[test]
fn test_commit_without_mutations_fails() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    assert_matches!(
        co.commit("nothing here"),
        Err(CheckoutError::Commit(CommitError::NothingToCommit))
    );
    co.close();
}

#[test]
fn test_commit_advances_branch_head() {
    let (_dir, repo) = init_repo();
    assert_eq!(repo.branch_head(DEFAULT_BRANCH).unwrap(), None);

    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("aset", schema()).unwrap();
    aset.set(SampleKey::Int(0), payload5by7(0.0)).unwrap();
    let first = co.commit("first").unwrap();
    assert_eq!(repo.branch_head(DEFAULT_BRANCH).unwrap(), Some(first.clone()));

    let aset = co.arrayset("aset").unwrap();
    aset.set(SampleKey::Int(1), payload5by7(1.0)).unwrap();
    let second = co.commit("second").unwrap();
    co.close();

    assert_ne!(first, second);
    assert_eq!(repo.branch_head(DEFAULT_BRANCH).unwrap(), Some(second.clone()));

    // Parents link the chain.
    let commit = repo.read_commit(&second).unwrap();
    assert_eq!(commit.parents, vec![first]);
    assert_eq!(commit.spec.message, "second");
}

#[test]
fn test_history_is_parent_first() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    co.init_arrayset("aset", schema()).unwrap();
    let mut commits = vec![];
    for i in 0..3u64 {
        co.arrayset("aset")
            .unwrap()
            .set(SampleKey::Int(i), payload5by7(i as f64))
            .unwrap();
        commits.push(co.commit(&format!("commit {i}")).unwrap());
    }
    co.close();

    let history = repo.history(DEFAULT_BRANCH).unwrap();
    assert_eq!(history, commits);
    // n commits reach at most n+1 commits; no merges happened here.
    assert_eq!(history.len(), 3);
}

#[test]
fn test_checkout_commit_pins_old_state() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("aset", schema()).unwrap();
    aset.set(SampleKey::Int(0), payload5by7(1.0)).unwrap();
    let first = co.commit("first").unwrap();

    let aset = co.arrayset("aset").unwrap();
    aset.set(SampleKey::Int(0), payload5by7(2.0)).unwrap();
    co.commit("second").unwrap();
    co.close();

    let pinned = repo.checkout_commit(&first).unwrap();
    assert_eq!(
        pinned.arrayset("aset").unwrap().get(&SampleKey::Int(0)).unwrap(),
        payload5by7(1.0)
    );
    assert_eq!(pinned.commit_id(), &first);

    let head = repo.checkout().unwrap();
    assert_eq!(
        head.arrayset("aset").unwrap().get(&SampleKey::Int(0)).unwrap(),
        payload5by7(2.0)
    );
}

#[test]
fn test_metadata_versioned_with_commits() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("aset", schema()).unwrap();
    aset.set(SampleKey::Int(0), payload5by7(0.0)).unwrap();
    let meta = co.metadata();
    meta.set(SampleKey::str("origin").unwrap(), "lab-a").unwrap();
    meta.set(SampleKey::Int(7), "seven").unwrap();
    let first = co.commit("with metadata").unwrap();

    co.metadata()
        .delete(&SampleKey::str("origin").unwrap())
        .unwrap();
    co.commit("metadata removed").unwrap();
    co.close();

    let pinned = repo.checkout_commit(&first).unwrap();
    assert_eq!(
        pinned.metadata().get(&SampleKey::str("origin").unwrap()).unwrap(),
        "lab-a"
    );
    assert_eq!(pinned.metadata().get(&SampleKey::Int(7)).unwrap(), "seven");

    let head = repo.checkout().unwrap();
    assert!(!head.metadata().contains_key(&SampleKey::str("origin").unwrap()));
    assert_eq!(head.metadata().len(), 1);
}

#[test]
fn test_delete_arrayset_staged() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("doomed", schema()).unwrap();
    aset.set(SampleKey::Int(0), payload5by7(0.0)).unwrap();
    co.commit("created").unwrap();

    co.delete_arrayset("doomed").unwrap();
    assert_matches!(
        co.arrayset("doomed"),
        Err(CheckoutError::ArraysetNotFound(_))
    );
    co.commit("deleted").unwrap();
    co.close();

    let reader = repo.checkout().unwrap();
    assert_eq!(reader.arrayset_names().count(), 0);
}

#[test]
fn test_reopened_repository_sees_committed_state() {
    let (dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("aset", schema()).unwrap();
    aset.set(SampleKey::Int(0), payload5by7(4.0)).unwrap();
    let head = co.commit("persisted").unwrap();
    co.close();
    repo.close().unwrap();

    let reopened = depot_lib::repo::Repository::open(dir.path()).unwrap();
    assert_eq!(reopened.branch_head(DEFAULT_BRANCH).unwrap(), Some(head));
    let reader = reopened.checkout().unwrap();
    assert_eq!(
        reader.arrayset("aset").unwrap().get(&SampleKey::Int(0)).unwrap(),
        payload5by7(4.0)
    );
}

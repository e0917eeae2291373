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
use depot_lib::arrayset::ArraysetError;
use depot_lib::checkout::CheckoutError;
use depot_lib::repo::DEFAULT_BRANCH;
use depot_lib::repo::RepoError;
use depot_lib::sample_key::KeyError;
use depot_lib::sample_key::SampleKey;
use depot_lib::schema::Schema;
use depot_lib::schema::SchemaError;
use depot_lib::store::StoreError;
use depot_lib::tensor::DType;
use depot_lib::tensor::Payload;
use depot_lib::tensor::Tensor;
use pretty_assertions::assert_eq;
use test_case::test_case;
use testutils::init_repo;
use testutils::payload5by7;

fn f64_schema_5by7() -> Schema {
    Schema::array(DType::F64, vec![5, 7], false).unwrap()
}

#[test_case("invalid\n"; "embedded newline")]
#[test_case("inv name"; "inner space")]
#[test_case("inva@lid"; "at sign")]
#[test_case(" try"; "leading space")]
#[test_case("andthis "; "trailing space")]
#[test_case("VeryLongNameIsInvalidOver64CharactersNotAllowedVeryLongNameIsInva"; "over 64 chars")]
fn test_init_arrayset_invalid_name(name: &str) {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    assert_matches!(
        co.init_arrayset(name, f64_schema_5by7()),
        Err(CheckoutError::Key(KeyError::InvalidString(_)))
    );
}

#[test]
fn test_init_arrayset_twice_fails() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();
    assert_matches!(
        co.init_arrayset("writtenaset", f64_schema_5by7()),
        Err(CheckoutError::ArraysetExists(name)) if name == "writtenaset"
    );
}

#[test]
fn test_write_commit_read_roundtrip() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();
    aset.set(
        SampleKey::str("1").unwrap(),
        Payload::Array(Tensor::zeros(DType::F64, &[5, 7])),
    )
    .unwrap();
    co.commit("first commit").unwrap();
    co.close();

    let reader = repo.checkout().unwrap();
    let aset = reader.arrayset("writtenaset").unwrap();
    assert_eq!(aset.len(), 1);
    let payload = aset.get(&SampleKey::str("1").unwrap()).unwrap();
    assert_eq!(payload, Payload::Array(Tensor::zeros(DType::F64, &[5, 7])));
}

#[test]
fn test_int_and_str_keys_coexist() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();
    aset.set(SampleKey::Int(1), payload5by7(1.0)).unwrap();
    aset.set(SampleKey::str("1").unwrap(), payload5by7(2.0))
        .unwrap();
    co.commit("both key kinds").unwrap();
    co.close();

    let reader = repo.checkout().unwrap();
    let aset = reader.arrayset("writtenaset").unwrap();
    assert_eq!(aset.len(), 2);
    assert_eq!(aset.get(&SampleKey::Int(1)).unwrap(), payload5by7(1.0));
    assert_eq!(
        aset.get(&SampleKey::str("1").unwrap()).unwrap(),
        payload5by7(2.0)
    );
}

#[test]
fn test_duplicate_payload_keeps_single_hash_entry() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();
    aset.set(SampleKey::str("1").unwrap(), payload5by7(3.0))
        .unwrap();
    let count_after_first = repo.store().data_digest_count().unwrap();
    aset.set(SampleKey::str("2").unwrap(), payload5by7(3.0))
        .unwrap();

    // Second write of identical bytes is a no-op on the hash index.
    assert_eq!(repo.store().data_digest_count().unwrap(), count_after_first);
    let first = aset.digest_for(&SampleKey::str("1").unwrap()).unwrap();
    let second = aset.digest_for(&SampleKey::str("2").unwrap()).unwrap();
    assert!(first.is_some());
    assert_eq!(first, second);
    co.close();
}

#[test]
fn test_variable_shape_samples_keep_their_shape() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let schema = Schema::array(DType::F32, vec![10, 10], true).unwrap();
    let aset = co.init_arrayset("varaset", schema).unwrap();

    let shapes: [[u64; 2]; 3] = [[2, 5], [10, 10], [1, 1]];
    for (i, shape) in shapes.iter().enumerate() {
        aset.set(
            SampleKey::Int(i as u64),
            Payload::Array(testutils::ascending_f32(shape)),
        )
        .unwrap();
    }
    co.commit("variable shapes").unwrap();
    co.close();

    let reader = repo.checkout().unwrap();
    let aset = reader.arrayset("varaset").unwrap();
    for (i, shape) in shapes.iter().enumerate() {
        let Payload::Array(tensor) = aset.get(&SampleKey::Int(i as u64)).unwrap() else {
            panic!("expected array payload");
        };
        assert_eq!(tensor.shape(), shape.as_slice());
    }
}

#[test]
fn test_schema_rejection_leaves_state_untouched() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();

    assert_matches!(
        aset.set(
            SampleKey::Int(0),
            Payload::Array(Tensor::zeros(DType::F64, &[5, 6])),
        ),
        Err(ArraysetError::Schema(SchemaError::ShapeMismatch { .. }))
    );
    assert_matches!(
        aset.set(
            SampleKey::Int(0),
            Payload::Array(Tensor::zeros(DType::F32, &[5, 7])),
        ),
        Err(ArraysetError::Schema(SchemaError::DTypeMismatch { .. }))
    );
    assert_matches!(
        aset.set(
            SampleKey::Int(0),
            Payload::Array(Tensor::zeros(DType::F64, &[5, 7, 1])),
        ),
        Err(ArraysetError::Schema(SchemaError::RankMismatch { .. }))
    );
    assert!(aset.is_empty().unwrap());
    co.close();
}

#[test]
fn test_update_validates_before_mutating() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();

    let malformed = vec![
        (SampleKey::str("valid").unwrap(), payload5by7(1.0)),
        (
            SampleKey::str("badshape").unwrap(),
            Payload::Array(Tensor::zeros(DType::F64, &[2, 2])),
        ),
    ];
    assert_matches!(aset.update(malformed), Err(ArraysetError::Schema(_)));
    // No partial result was applied.
    assert!(aset.is_empty().unwrap());
    co.close();
}

#[test]
fn test_update_right_wins_on_duplicate_keys() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();

    // update(d1); update(d2) must equal update(d1 right-joined with d2).
    aset.update(vec![
        (SampleKey::Int(0), payload5by7(1.0)),
        (SampleKey::Int(1), payload5by7(2.0)),
    ])
    .unwrap();
    aset.update(vec![
        (SampleKey::Int(1), payload5by7(9.0)),
        (SampleKey::Int(2), payload5by7(3.0)),
    ])
    .unwrap();

    assert_eq!(aset.len().unwrap(), 3);
    assert_eq!(aset.get(&SampleKey::Int(1)).unwrap(), payload5by7(9.0));
    co.close();
}

#[test]
fn test_append_assigns_unique_keys() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();

    let first = aset.append(payload5by7(1.0)).unwrap();
    let second = aset.append(payload5by7(2.0)).unwrap();
    assert_ne!(first, second);
    assert_eq!(aset.len().unwrap(), 2);
    assert_eq!(aset.get(&first).unwrap(), payload5by7(1.0));
    co.close();
}

#[test]
fn test_delete_removes_mapping_only() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();
    let key = SampleKey::str("doomed").unwrap();
    aset.set(key.clone(), payload5by7(1.0)).unwrap();

    aset.delete(&key).unwrap();
    assert!(!aset.contains_key(&key).unwrap());
    assert_matches!(
        aset.delete(&key),
        Err(ArraysetError::KeyNotFound { .. })
    );
    // The payload is only a GC candidate; the hash index entry survives.
    assert_eq!(repo.store().data_digest_count().unwrap(), 1);
    co.close();
}

#[test]
fn test_second_writer_checkout_fails() {
    let (_dir, repo) = init_repo();
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    assert_matches!(
        repo.checkout_writer(DEFAULT_BRANCH),
        Err(RepoError::WriterActive)
    );
    co.close();
    // Closing released the writer lease on every path.
    let co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    co.close();
}

#[test]
fn test_closed_repository_invalidates_checkouts() {
    let (_dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let aset = co.init_arrayset("writtenaset", f64_schema_5by7()).unwrap();
    aset.set(SampleKey::Int(0), payload5by7(0.0)).unwrap();
    co.commit("first").unwrap();
    co.close();

    let reader = repo.checkout().unwrap();
    let aset = reader.arrayset("writtenaset").unwrap().clone();
    repo.close().unwrap();

    assert_matches!(
        aset.get(&SampleKey::Int(0)),
        Err(ArraysetError::Store(StoreError::RepositoryClosed))
    );
}

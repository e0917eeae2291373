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
use depot_lib::dataset::Dataset;
use depot_lib::dataset::DatasetError;
use depot_lib::repo::DEFAULT_BRANCH;
use depot_lib::repo::Repository;
use depot_lib::sample_key::SampleKey;
use depot_lib::schema::Schema;
use depot_lib::tensor::DType;
use depot_lib::tensor::Payload;
use tempfile::TempDir;
use testutils::init_repo;
use testutils::payload5by7;

/// Two aligned arraysets (`images`, `labels`) with integer keys 0..3, and a
/// string-valued `notes` arrayset missing key 2.
fn aligned_repo() -> (TempDir, Repository) {
    let (dir, repo) = init_repo();
    let mut co = repo.checkout_writer(DEFAULT_BRANCH).unwrap();
    let images = co
        .init_arrayset("images", Schema::array(DType::F64, vec![5, 7], false).unwrap())
        .unwrap();
    let labels = co
        .init_arrayset("labels", Schema::array(DType::I64, vec![1], false).unwrap())
        .unwrap();
    let notes = co.init_arrayset("notes", Schema::string()).unwrap();
    for i in 0..3u64 {
        images.set(SampleKey::Int(i), payload5by7(i as f64)).unwrap();
        labels
            .set(
                SampleKey::Int(i),
                Payload::Array(
                    depot_lib::tensor::Tensor::from_elements(&[1], &[i as i64]).unwrap(),
                ),
            )
            .unwrap();
        if i != 2 {
            notes
                .set(SampleKey::Int(i), Payload::Str(format!("note {i}")))
                .unwrap();
        }
    }
    co.commit("aligned data").unwrap();
    co.close();
    (dir, repo)
}

#[test]
fn test_tuple_projection() {
    let (_dir, repo) = aligned_repo();
    let reader = repo.checkout().unwrap();
    let images = reader.arrayset("images").unwrap();
    let labels = reader.arrayset("labels").unwrap();

    let dataset = Dataset::new(vec![images, labels], None).unwrap();
    assert_eq!(dataset.len(), 3);

    let row = dataset.get(1).unwrap();
    assert_eq!(row.len(), 2);
    assert_eq!(row[0], payload5by7(1.0));
    assert_eq!(
        row[1],
        Payload::Array(depot_lib::tensor::Tensor::from_elements(&[1], &[1i64]).unwrap())
    );
}

#[test]
fn test_named_record_projection() {
    let (_dir, repo) = aligned_repo();
    let reader = repo.checkout().unwrap();
    let images = reader.arrayset("images").unwrap();
    let labels = reader.arrayset("labels").unwrap();

    let dataset = Dataset::new(vec![images, labels], None).unwrap();
    let record = dataset.get_record(0).unwrap();
    assert_eq!(record[0].0, "images");
    assert_eq!(record[1].0, "labels");
}

#[test]
fn test_misaligned_keys_fail() {
    let (_dir, repo) = aligned_repo();
    let reader = repo.checkout().unwrap();
    let images = reader.arrayset("images").unwrap();
    let notes = reader.arrayset("notes").unwrap();

    assert_matches!(
        Dataset::new(vec![images, notes], None),
        Err(DatasetError::KeyMissing { arrayset, .. }) if arrayset == "notes"
    );
}

#[test]
fn test_explicit_key_list() {
    let (_dir, repo) = aligned_repo();
    let reader = repo.checkout().unwrap();
    let images = reader.arrayset("images").unwrap();
    let notes = reader.arrayset("notes").unwrap();

    // Restricting to the keys present everywhere makes the columns usable.
    let keys = vec![SampleKey::Int(0), SampleKey::Int(1)];
    let dataset = Dataset::new(vec![images, notes], Some(keys)).unwrap();
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.get(0).unwrap()[1], Payload::Str("note 0".to_string()));

    assert_matches!(
        dataset.get(5),
        Err(DatasetError::IndexOutOfBounds { index: 5, len: 2 })
    );
}

#[test]
fn test_empty_dataset_rejected() {
    assert_matches!(Dataset::new(vec![], None), Err(DatasetError::Empty));
}

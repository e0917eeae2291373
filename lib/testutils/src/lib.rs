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

use depot_lib::repo::Repository;
use depot_lib::tensor::DType;
use depot_lib::tensor::Payload;
use depot_lib::tensor::Tensor;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("depot-test-")
        .tempdir()
        .unwrap()
}

/// Fresh repository under a temp dir, with a fixed test user identity.
pub fn init_repo() -> (TempDir, Repository) {
    let temp_dir = new_temp_dir();
    let repo = Repository::init(temp_dir.path(), "Test User", "test.user@example.com").unwrap();
    (temp_dir, repo)
}

/// A `(5, 7)` f64 tensor filled with `fill`.
pub fn array5by7(fill: f64) -> Tensor {
    Tensor::from_elements(&[5, 7], &[fill; 35]).unwrap()
}

pub fn payload5by7(fill: f64) -> Payload {
    Payload::Array(array5by7(fill))
}

/// An f32 tensor of the given shape filled with ascending values.
pub fn ascending_f32(shape: &[u64]) -> Tensor {
    let count: u64 = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|i| i as f32).collect();
    Tensor::from_elements(shape, &values).unwrap()
}

pub fn zeros(dtype: DType, shape: &[u64]) -> Payload {
    Payload::Array(Tensor::zeros(dtype, shape))
}

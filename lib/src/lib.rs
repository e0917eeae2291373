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

//! Library for Depot, a content-addressed, version-controlled storage engine
//! for numeric tensor data and string/bytes metadata.
//!
//! Samples live in named, schema-constrained arraysets; every payload is
//! deduplicated through a digest-keyed hash index and stored by a pluggable
//! backend. Commits snapshot the full arrayset and metadata state into a
//! Merkle-like DAG addressed by content digests, branches are mutable
//! pointers into it, and the remote protocol reconciles commit, schema, and
//! data-hash sets between peers.

#![warn(missing_docs)]

pub mod arrayset;
pub mod backend;
pub mod branch;
pub mod checkout;
pub mod commit;
pub mod content_hash;
pub mod dataset;
pub mod fs_backend;
pub mod hex_util;
pub mod kv;
pub mod kv_backend;
pub mod lock;
pub mod metadata;
pub mod object_id;
pub mod protos;
pub mod records;
pub mod remote;
pub mod repo;
pub mod sample_key;
pub mod schema;
pub mod staging;
pub mod store;
pub mod tensor;

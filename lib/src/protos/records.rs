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

//! Message definitions for the on-disk record formats.
//!
//! Ref blobs are canonical: builders must emit arraysets sorted by name,
//! samples sorted by key (integer keys before string keys), and metadata
//! sorted by key, so that encoding is deterministic and digests are stable.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefSample {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub digest: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefArrayset {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub schema_digest: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub samples: Vec<RefSample>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefMetadata {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefBlob {
    #[prost(message, repeated, tag = "1")]
    pub arraysets: Vec<RefArrayset>,
    #[prost(message, repeated, tag = "2")]
    pub metadata: Vec<RefMetadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitParents {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub parents: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommitSpec {
    #[prost(string, tag = "1")]
    pub author_name: String,
    #[prost(string, tag = "2")]
    pub author_email: String,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(int64, tag = "4")]
    pub millis_since_epoch: i64,
    #[prost(int32, tag = "5")]
    pub tz_offset: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchemaOption {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchemaBlob {
    #[prost(uint32, tag = "1")]
    pub kind: u32,
    #[prost(uint32, tag = "2")]
    pub dtype: u32,
    #[prost(uint64, repeated, tag = "3")]
    pub shape: Vec<u64>,
    #[prost(bool, tag = "4")]
    pub variable_shape: bool,
    #[prost(string, tag = "5")]
    pub backend: String,
    #[prost(message, repeated, tag = "6")]
    pub backend_opts: Vec<SchemaOption>,
}

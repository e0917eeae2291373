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

//! Payload chunking and wire compression.

use prost::Message as _;

use crate::remote::wire::DigestPack;
use crate::remote::wire::WireError;

/// Size of one chunk of a streamed blob.
pub const CHUNK_NBYTES: usize = 32 * 1024;

/// Canonical wire compression: codec id and level carried in compression
/// options.
pub const COMPRESSION_ID: &str = "zstd";
pub const COMPRESSION_LEVEL: i32 = 3;

/// Splits a blob into ordered chunks of at most [`CHUNK_NBYTES`].
pub fn chunk_bytes(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(CHUNK_NBYTES)
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    Ok(zstd::stream::encode_all(bytes, COMPRESSION_LEVEL)?)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    Ok(zstd::stream::decode_all(bytes)?)
}

/// Packs a set of digests into one compressed blob for reconciliation.
pub fn pack_digests<'a>(digests: impl IntoIterator<Item = &'a [u8]>) -> Result<Vec<u8>, WireError> {
    let pack = DigestPack {
        digests: digests.into_iter().map(<[u8]>::to_vec).collect(),
    };
    compress(&pack.encode_to_vec())
}

pub fn unpack_digests(bytes: &[u8]) -> Result<Vec<Vec<u8>>, WireError> {
    let raw = decompress(bytes)?;
    Ok(DigestPack::decode(raw.as_slice())?.digests)
}

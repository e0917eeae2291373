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

//! The content-addressed hash space.
//!
//! Every stored object (tensor payload, string, bytes, schema, commit) is
//! addressed by a fixed-length BLAKE2b digest over a canonical byte
//! serialization. A one-byte payload-kind code is mixed into the hash input
//! so digests of different kinds never collide and so the hash function can
//! be migrated per kind later.

use blake2::Blake2b;
use digest::Digest as _;
use digest::consts::U20;

use crate::object_id::ObjectId;
use crate::object_id::id_type;
use crate::tensor::Payload;

/// Number of bytes in every digest.
pub const DIGEST_LENGTH: usize = 20;

/// Payload-kind type codes selecting the hash domain.
pub const TCODE_ARRAY: u8 = b'0';
pub const TCODE_SCHEMA: u8 = b'1';
pub const TCODE_STR: u8 = b'2';
pub const TCODE_BYTES: u8 = b'3';
pub const TCODE_COMMIT: u8 = b'4';

type Blake2b160 = Blake2b<U20>;

id_type!(
    /// Identifier of a sample payload (dense array, string, or bytes) based
    /// on its canonical content.
    pub DataId
);
id_type!(
    /// Identifier of a frozen arrayset schema. Identical schemas share one id
    /// across arraysets and across repositories.
    pub SchemaId
);
id_type!(
    /// Identifier of a commit, covering parent ids, spec, and ref blob.
    pub CommitId
);

fn hash_parts(tcode: u8, parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Blake2b160::new();
    hasher.update([tcode]);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Computes the digest of a payload under its kind-specific type code.
pub fn data_digest(payload: &Payload) -> DataId {
    let tcode = match payload {
        Payload::Array(_) => TCODE_ARRAY,
        Payload::Str(_) => TCODE_STR,
        Payload::Bytes(_) => TCODE_BYTES,
    };
    DataId::new(hash_parts(tcode, &[&payload.canonical_bytes()]))
}

/// Computes the digest of a canonical schema blob.
pub fn schema_digest(blob: &[u8]) -> SchemaId {
    SchemaId::new(hash_parts(TCODE_SCHEMA, &[blob]))
}

/// Computes a commit digest over parent digests, canonical spec bytes, and
/// the ref blob. Identical states with identical history hash identically.
pub fn commit_digest(parents: &[CommitId], spec: &[u8], ref_blob: &[u8]) -> CommitId {
    let mut hasher = Blake2b160::new();
    hasher.update([TCODE_COMMIT]);
    for parent in parents {
        hasher.update(&parent.0);
    }
    hasher.update(spec);
    hasher.update(ref_blob);
    CommitId::new(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use crate::tensor::Tensor;

    #[test]
    fn test_digest_length_and_stability() {
        let payload = Payload::Str("hello".to_string());
        let digest = data_digest(&payload);
        assert_eq!(digest.as_bytes().len(), DIGEST_LENGTH);
        assert_eq!(digest, data_digest(&Payload::Str("hello".to_string())));
    }

    #[test]
    fn test_kind_codes_separate_domains() {
        // Identical raw bytes under different kinds must not collide.
        let s = data_digest(&Payload::Str("ab".to_string()));
        let b = data_digest(&Payload::Bytes(b"ab".to_vec()));
        assert_ne!(s, b);
    }

    #[test]
    fn test_equal_tensors_equal_digests() {
        let a = Tensor::zeros(DType::F64, &[5, 7]);
        let b = Tensor::zeros(DType::F64, &[5, 7]);
        assert_eq!(
            data_digest(&Payload::Array(a)),
            data_digest(&Payload::Array(b))
        );
    }

    #[test]
    fn test_shape_is_part_of_identity() {
        let a = Tensor::zeros(DType::F64, &[35]);
        let b = Tensor::zeros(DType::F64, &[5, 7]);
        assert_ne!(
            data_digest(&Payload::Array(a)),
            data_digest(&Payload::Array(b))
        );
    }

    #[test]
    fn test_commit_digest_covers_parents_spec_and_refs() {
        let parent = CommitId::from_hex("aa00");
        let base = commit_digest(&[parent.clone()], b"spec", b"refs");
        assert_eq!(base, commit_digest(&[parent.clone()], b"spec", b"refs"));
        assert_ne!(base, commit_digest(&[], b"spec", b"refs"));
        assert_ne!(base, commit_digest(&[parent.clone()], b"spec2", b"refs"));
        assert_ne!(base, commit_digest(&[parent], b"spec", b"refs2"));
    }
}

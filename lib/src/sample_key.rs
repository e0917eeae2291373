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

//! Sample keys and arrayset/branch name validation.
//!
//! A sample key is either a non-negative integer or a short string over a
//! restricted alphabet. Integer keys order before string keys; within a
//! variant the natural ordering applies. Arrayset and branch names obey the
//! same character rules as string keys.

use std::fmt;

use thiserror::Error;

/// Maximum length of a string sample key or a container name.
pub const KEY_MAX_LEN: usize = 64;

const INT_KEY_TAG: u8 = b'0';
const STR_KEY_TAG: u8 = b'1';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key or name {0:?} must be 1-{KEY_MAX_LEN} characters of [A-Za-z0-9_.-]")]
    InvalidString(String),
    #[error("malformed key encoding")]
    MalformedEncoding,
}

fn valid_key_chars(s: &str) -> bool {
    (1..=KEY_MAX_LEN).contains(&s.len())
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Validates an arrayset or branch name.
pub fn validate_name(name: &str) -> Result<(), KeyError> {
    if valid_key_chars(name) {
        Ok(())
    } else {
        Err(KeyError::InvalidString(name.to_string()))
    }
}

/// Key of a sample within an arrayset, or of a metadata entry.
///
/// The derived ordering (integers first, then strings) is the canonical
/// ordering used by ref blobs and the staging keyspace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SampleKey {
    Int(u64),
    Str(String),
}

impl SampleKey {
    /// Builds a validated string key.
    pub fn str(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        if valid_key_chars(&key) {
            Ok(Self::Str(key))
        } else {
            Err(KeyError::InvalidString(key))
        }
    }

    /// Order-preserving byte encoding used in the staging keyspace: a
    /// variant tag, then big-endian digits for integers or raw characters
    /// for strings.
    pub fn to_db_bytes(&self) -> Vec<u8> {
        match self {
            Self::Int(n) => {
                let mut out = Vec::with_capacity(9);
                out.push(INT_KEY_TAG);
                out.extend_from_slice(&n.to_be_bytes());
                out
            }
            Self::Str(s) => {
                let mut out = Vec::with_capacity(1 + s.len());
                out.push(STR_KEY_TAG);
                out.extend_from_slice(s.as_bytes());
                out
            }
        }
    }

    pub fn from_db_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        match bytes.split_first() {
            Some((&INT_KEY_TAG, rest)) => {
                let arr: [u8; 8] = rest.try_into().map_err(|_| KeyError::MalformedEncoding)?;
                Ok(Self::Int(u64::from_be_bytes(arr)))
            }
            Some((&STR_KEY_TAG, rest)) => {
                let s = std::str::from_utf8(rest).map_err(|_| KeyError::MalformedEncoding)?;
                Self::str(s)
            }
            _ => Err(KeyError::MalformedEncoding),
        }
    }
}

impl From<u64> for SampleKey {
    fn from(n: u64) -> Self {
        Self::Int(n)
    }
}

impl TryFrom<&str> for SampleKey {
    type Error = KeyError;

    fn try_from(s: &str) -> Result<Self, KeyError> {
        Self::str(s)
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.pad(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;

    #[test_case(""; "empty")]
    #[test_case("invalid\n"; "trailing newline")]
    #[test_case("inv name"; "inner space")]
    #[test_case("inva@lid"; "at sign")]
    #[test_case(" try"; "leading space")]
    #[test_case("andthis "; "trailing space")]
    #[test_case("VeryLongNameIsInvalidOver64CharactersNotAllowedVeryLongNameIsInva"; "over 64 chars")]
    fn test_invalid_string_keys(key: &str) {
        assert_matches!(SampleKey::str(key), Err(KeyError::InvalidString(_)));
        assert_matches!(validate_name(key), Err(KeyError::InvalidString(_)));
    }

    #[test]
    fn test_valid_keys() {
        for key in ["a", "sample-1", "x.y_z", "0", "A" ] {
            SampleKey::str(key).unwrap();
        }
        // Exactly 64 characters is allowed.
        SampleKey::str("a".repeat(64)).unwrap();
    }

    #[test]
    fn test_int_and_str_keys_are_distinct() {
        assert_ne!(SampleKey::Int(1), SampleKey::str("1").unwrap());
    }

    #[test]
    fn test_ordering_ints_before_strings() {
        let mut keys = vec![
            SampleKey::str("a").unwrap(),
            SampleKey::Int(10),
            SampleKey::str("0").unwrap(),
            SampleKey::Int(2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                SampleKey::Int(2),
                SampleKey::Int(10),
                SampleKey::str("0").unwrap(),
                SampleKey::str("a").unwrap(),
            ]
        );
    }

    #[test]
    fn test_db_bytes_roundtrip_and_order() {
        let keys = [
            SampleKey::Int(0),
            SampleKey::Int(255),
            SampleKey::Int(256),
            SampleKey::str("abc").unwrap(),
        ];
        let mut encoded: Vec<Vec<u8>> = keys.iter().map(SampleKey::to_db_bytes).collect();
        for (key, bytes) in keys.iter().zip(&encoded) {
            assert_eq!(&SampleKey::from_db_bytes(bytes).unwrap(), key);
        }
        // Byte ordering of encodings matches the key ordering.
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }
}

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

//! Branches: named mutable pointers into the commit DAG, plus ancestry
//! traversal and the three-way merge over commit contents.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use itertools::Itertools as _;
use thiserror::Error;

use crate::content_hash::CommitId;
use crate::object_id::ObjectId as _;
use crate::records;
use crate::records::ArraysetContents;
use crate::records::CommitContents;
use crate::sample_key;
use crate::sample_key::KeyError;
use crate::sample_key::SampleKey;
use crate::store::Store;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum BranchError {
    #[error(transparent)]
    InvalidName(#[from] KeyError),
    #[error("branch {0} does not exist")]
    NotFound(String),
    #[error("branch {0} already exists")]
    AlreadyExists(String),
    #[error("commit {0} does not exist")]
    CommitNotFound(String),
    #[error("{new} is not a descendant of branch head {old} (use force to override)")]
    NotFastForward { old: String, new: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One record of disagreement produced by a three-way merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    /// Arrayset involved, or `None` for a metadata conflict.
    pub arrayset: Option<String>,
    /// Sample or metadata key involved, or `None` for a schema-level
    /// conflict.
    pub key: Option<SampleKey>,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge produced {} conflict(s)", .0.len())]
    Conflicts(Vec<MergeConflict>),
    #[error("commits share no ancestor")]
    NoMergeBase,
    #[error(transparent)]
    Branch(#[from] BranchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creates a branch pointing at `base` (or at nothing for a fresh
/// repository).
pub fn create_branch(
    store: &Store,
    name: &str,
    base: Option<&CommitId>,
) -> Result<(), BranchError> {
    sample_key::validate_name(name)?;
    let key = records::branch_key(name);
    if store.envs().branchenv.contains(&key).map_err(StoreError::from)? {
        return Err(BranchError::AlreadyExists(name.to_string()));
    }
    if let Some(base) = base
        && !store.has_commit(base)?
    {
        return Err(BranchError::CommitNotFound(base.hex()));
    }
    let value = base.map(CommitId::to_bytes).unwrap_or_default();
    store
        .envs()
        .branchenv
        .put(&key, &value)
        .map_err(StoreError::from)?;
    Ok(())
}

/// Head commit of `name`; `Ok(None)` for a branch with no commits yet.
pub fn branch_head(store: &Store, name: &str) -> Result<Option<CommitId>, BranchError> {
    let value = store
        .envs()
        .branchenv
        .get(&records::branch_key(name))
        .map_err(StoreError::from)?
        .ok_or_else(|| BranchError::NotFound(name.to_string()))?;
    if value.is_empty() {
        Ok(None)
    } else {
        Ok(Some(CommitId::new(value)))
    }
}

/// Advances a branch head. The new head must descend from the old one
/// unless `force` is set. Head updates are single atomic record writes.
pub fn set_branch_head(
    store: &Store,
    name: &str,
    id: &CommitId,
    force: bool,
) -> Result<(), BranchError> {
    let old = branch_head(store, name)?;
    if !store.has_commit(id)? {
        return Err(BranchError::CommitNotFound(id.hex()));
    }
    if let Some(old) = &old
        && !force
        && old != id
        && !is_ancestor(store, old, id)?
    {
        return Err(BranchError::NotFastForward {
            old: old.hex(),
            new: id.hex(),
        });
    }
    store
        .envs()
        .branchenv
        .put(&records::branch_key(name), &id.to_bytes())
        .map_err(StoreError::from)?;
    Ok(())
}

pub fn branch_names(store: &Store) -> Result<Vec<String>, BranchError> {
    let pairs = store
        .envs()
        .branchenv
        .scan_prefix(records::BRANCH_PREFIX)
        .map_err(StoreError::from)?;
    Ok(pairs
        .into_iter()
        .filter_map(|(key, _)| {
            String::from_utf8(key[records::BRANCH_PREFIX.len()..].to_vec()).ok()
        })
        .collect())
}

/// Whether `ancestor` is reachable from `descendant` through parent edges.
pub fn is_ancestor(
    store: &Store,
    ancestor: &CommitId,
    descendant: &CommitId,
) -> Result<bool, BranchError> {
    let mut queue = VecDeque::from([descendant.clone()]);
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if &id == ancestor {
            return Ok(true);
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        for parent in store.read_commit(&id)?.parents {
            queue.push_back(parent);
        }
    }
    Ok(false)
}

/// All commits reachable from the head of `name`, topologically ordered with
/// parents before children; the head is last. Empty for a branch with no
/// commits.
pub fn history(store: &Store, name: &str) -> Result<Vec<CommitId>, BranchError> {
    let Some(head) = branch_head(store, name)? else {
        return Ok(vec![]);
    };
    let mut order = vec![];
    let mut visited = HashSet::new();
    // Iterative post-order: parents emit before the commit itself.
    let mut stack = vec![(head, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !visited.insert(id.clone()) {
            continue;
        }
        let parents = store.read_commit(&id)?.parents;
        stack.push((id, true));
        for parent in parents {
            stack.push((parent, false));
        }
    }
    Ok(order)
}

/// Nearest common ancestor of `a` and `b`, breadth-first from `b`.
pub fn merge_base(
    store: &Store,
    a: &CommitId,
    b: &CommitId,
) -> Result<Option<CommitId>, BranchError> {
    let mut a_ancestors = HashSet::new();
    let mut queue = VecDeque::from([a.clone()]);
    while let Some(id) = queue.pop_front() {
        if a_ancestors.insert(id.clone()) {
            queue.extend(store.read_commit(&id)?.parents);
        }
    }
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([b.clone()]);
    while let Some(id) = queue.pop_front() {
        if a_ancestors.contains(&id) {
            return Ok(Some(id));
        }
        if seen.insert(id.clone()) {
            queue.extend(store.read_commit(&id)?.parents);
        }
    }
    Ok(None)
}

fn merge_values<T: Clone + PartialEq>(
    base: Option<&T>,
    ours: Option<&T>,
    theirs: Option<&T>,
) -> Result<Option<T>, ()> {
    if ours == theirs {
        return Ok(ours.cloned());
    }
    if ours == base {
        return Ok(theirs.cloned());
    }
    if theirs == base {
        return Ok(ours.cloned());
    }
    Err(())
}

fn merged_keys<'a, K: Ord + Clone, V>(
    maps: [&'a BTreeMap<K, V>; 3],
) -> impl Iterator<Item = K> + 'a {
    maps.into_iter()
        .flat_map(|map| map.keys().cloned())
        .sorted()
        .dedup()
}

/// Three-way merge of two commit states against their merge base. The result
/// is deterministic for identical inputs; any both-sides-changed divergence
/// is returned as the full conflict set.
pub fn merge_contents(
    base: &CommitContents,
    ours: &CommitContents,
    theirs: &CommitContents,
) -> Result<CommitContents, MergeError> {
    let mut merged = CommitContents::default();
    let mut conflicts = vec![];

    for name in merged_keys([&base.arraysets, &ours.arraysets, &theirs.arraysets]) {
        let b = base.arraysets.get(&name);
        let o = ours.arraysets.get(&name);
        let t = theirs.arraysets.get(&name);
        match (o, t) {
            (Some(o_aset), Some(t_aset)) => {
                match merge_arrayset(b, o_aset, t_aset) {
                    Ok(contents) => {
                        merged.arraysets.insert(name, contents);
                    }
                    Err(mut aset_conflicts) => {
                        for conflict in &mut aset_conflicts {
                            conflict.arrayset = Some(name.clone());
                        }
                        conflicts.extend(aset_conflicts);
                    }
                }
            }
            _ => match merge_values(b, o, t) {
                Ok(Some(contents)) => {
                    merged.arraysets.insert(name, contents);
                }
                Ok(None) => {}
                Err(()) => conflicts.push(MergeConflict {
                    arrayset: Some(name),
                    key: None,
                }),
            },
        }
    }

    for key in merged_keys([&base.metadata, &ours.metadata, &theirs.metadata]) {
        match merge_values(
            base.metadata.get(&key),
            ours.metadata.get(&key),
            theirs.metadata.get(&key),
        ) {
            Ok(Some(value)) => {
                merged.metadata.insert(key, value);
            }
            Ok(None) => {}
            Err(()) => conflicts.push(MergeConflict {
                arrayset: None,
                key: Some(key),
            }),
        }
    }

    if conflicts.is_empty() {
        Ok(merged)
    } else {
        Err(MergeError::Conflicts(conflicts))
    }
}

fn merge_arrayset(
    base: Option<&ArraysetContents>,
    ours: &ArraysetContents,
    theirs: &ArraysetContents,
) -> Result<ArraysetContents, Vec<MergeConflict>> {
    let mut conflicts = vec![];
    let schema = match merge_values(
        base.map(|aset| &aset.schema),
        Some(&ours.schema),
        Some(&theirs.schema),
    ) {
        Ok(schema) => schema.unwrap(),
        Err(()) => {
            conflicts.push(MergeConflict {
                arrayset: None,
                key: None,
            });
            ours.schema.clone()
        }
    };

    let empty = BTreeMap::new();
    let base_samples = base.map_or(&empty, |aset| &aset.samples);
    let mut samples = BTreeMap::new();
    for key in merged_keys([base_samples, &ours.samples, &theirs.samples]) {
        match merge_values(
            base_samples.get(&key),
            ours.samples.get(&key),
            theirs.samples.get(&key),
        ) {
            Ok(Some(digest)) => {
                samples.insert(key, digest);
            }
            Ok(None) => {}
            Err(()) => conflicts.push(MergeConflict {
                arrayset: None,
                key: Some(key),
            }),
        }
    }

    if conflicts.is_empty() {
        Ok(ArraysetContents { schema, samples })
    } else {
        Err(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::content_hash::DataId;
    use crate::content_hash::SchemaId;

    fn contents_with(samples: &[(u64, &'static str)]) -> CommitContents {
        let mut contents = CommitContents::default();
        let mut map = BTreeMap::new();
        for (key, hex) in samples {
            map.insert(SampleKey::Int(*key), DataId::from_hex(hex));
        }
        contents.arraysets.insert(
            "aset".to_string(),
            ArraysetContents {
                schema: SchemaId::from_hex("0101"),
                samples: map,
            },
        );
        contents
    }

    #[test]
    fn test_merge_disjoint_edits() {
        let base = contents_with(&[(1, "aa")]);
        let ours = contents_with(&[(1, "aa"), (2, "bb")]);
        let theirs = contents_with(&[(1, "aa"), (3, "cc")]);
        let merged = merge_contents(&base, &ours, &theirs).unwrap();
        let samples = &merged.arraysets["aset"].samples;
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[&SampleKey::Int(2)], DataId::from_hex("bb"));
        assert_eq!(samples[&SampleKey::Int(3)], DataId::from_hex("cc"));
    }

    #[test]
    fn test_merge_same_change_both_sides() {
        let base = contents_with(&[(1, "aa")]);
        let ours = contents_with(&[(1, "ff")]);
        let theirs = contents_with(&[(1, "ff")]);
        let merged = merge_contents(&base, &ours, &theirs).unwrap();
        assert_eq!(
            merged.arraysets["aset"].samples[&SampleKey::Int(1)],
            DataId::from_hex("ff")
        );
    }

    #[test]
    fn test_merge_conflict_reported() {
        let base = contents_with(&[(1, "aa")]);
        let ours = contents_with(&[(1, "bb")]);
        let theirs = contents_with(&[(1, "cc")]);
        assert_matches!(
            merge_contents(&base, &ours, &theirs),
            Err(MergeError::Conflicts(conflicts)) if conflicts == vec![MergeConflict {
                arrayset: Some("aset".to_string()),
                key: Some(SampleKey::Int(1)),
            }]
        );
    }

    #[test]
    fn test_merge_deletion_wins_over_no_change() {
        let base = contents_with(&[(1, "aa"), (2, "bb")]);
        let mut ours = contents_with(&[(1, "aa")]);
        ours.metadata
            .insert(SampleKey::str("note").unwrap(), "kept".to_string());
        let theirs = base.clone();
        let merged = merge_contents(&base, &ours, &theirs).unwrap();
        assert!(!merged.arraysets["aset"]
            .samples
            .contains_key(&SampleKey::Int(2)));
        assert_eq!(merged.metadata.len(), 1);
    }
}

//! Add/remove sets between an applied and a desired collection.
//!
//! Collections are compared as unordered multisets of structurally equal
//! records. Two records that share a key but differ in any field are a
//! removal plus an addition, never an in-place change.

use std::collections::HashMap;
use std::hash::Hash;

/// Changes turning an old collection into a new one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    pub adds: Vec<T>,
    pub removes: Vec<T>,
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Self {
            adds: Vec::new(),
            removes: Vec::new(),
        }
    }
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }
}

/// Computes `adds = new - old` and `removes = old - new` with multiset
/// semantics.
pub fn diff_unordered<T: PartialEq + Clone>(old: &[T], new: &[T]) -> Diff<T> {
    Diff {
        adds: multiset_minus(new, old),
        removes: multiset_minus(old, new),
    }
}

fn multiset_minus<T: PartialEq + Clone>(from: &[T], minus: &[T]) -> Vec<T> {
    let mut used = vec![false; minus.len()];
    let mut result = Vec::new();
    for item in from {
        let matched = minus
            .iter()
            .enumerate()
            .find(|(i, other)| !used[*i] && *other == item)
            .map(|(i, _)| i);
        match matched {
            Some(i) => used[i] = true,
            None => result.push(item.clone()),
        }
    }
    result
}

/// Applies a diff to a collection: removals first, then additions.
pub fn apply_diff<T: PartialEq + Clone>(current: &[T], diff: &Diff<T>) -> Vec<T> {
    let mut result = current.to_vec();
    for removed in &diff.removes {
        if let Some(pos) = result.iter().position(|item| item == removed) {
            result.remove(pos);
        }
    }
    result.extend(diff.adds.iter().cloned());
    result
}

/// Diff of two collections keyed by an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedDiff<T> {
    pub adds: Vec<T>,
    pub removes: Vec<T>,
    /// `(old, new)` pairs sharing a key but differing in content.
    pub changed: Vec<(T, T)>,
}

impl<T> KeyedDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.changed.is_empty()
    }
}

/// Compares two collections by key, keeping the order of `new` for
/// additions and changes.
pub fn diff_by_key<T, K, F>(old: &[T], new: &[T], key_fn: F) -> KeyedDiff<T>
where
    T: PartialEq + Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let old_by_key: HashMap<K, &T> = old.iter().map(|item| (key_fn(item), item)).collect();
    let new_keys: HashMap<K, ()> = new.iter().map(|item| (key_fn(item), ())).collect();

    let mut diff = KeyedDiff {
        adds: Vec::new(),
        removes: Vec::new(),
        changed: Vec::new(),
    };
    for item in new {
        match old_by_key.get(&key_fn(item)) {
            None => diff.adds.push(item.clone()),
            Some(prev) if *prev != item => diff.changed.push(((*prev).clone(), item.clone())),
            Some(_) => {}
        }
    }
    diff.removes = old
        .iter()
        .filter(|item| !new_keys.contains_key(&key_fn(item)))
        .cloned()
        .collect();
    diff
}

// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key paths into nested metadata mappings, and prefix-closed sets of them.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::iter::FromIterator;

/// A position inside nested metadata mappings, as an ordered sequence of
/// string segments. The empty path denotes the root mapping.
///
/// Paths can be written as `/`-joined strings: `"ssh/port"` means
/// `["ssh", "port"]`, and `""` means the root.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct MetaPath {
    segments: Vec<String>,
}

impl MetaPath {
    /// The empty path, denoting the root mapping.
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns the path's segments in order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns true if this is the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns true if this path starts with `prefix`. The root is a prefix
    /// of every path, including itself.
    pub fn starts_with(&self, prefix: &MetaPath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Returns a new path with `segment` appended.
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }
}

impl From<&str> for MetaPath {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::root()
        } else {
            Self {
                segments: s.split('/').map(str::to_string).collect(),
            }
        }
    }
}

impl From<&[&str]> for MetaPath {
    fn from(segments: &[&str]) -> Self {
        segments.iter().copied().collect()
    }
}

impl<const N: usize> From<[&str; N]> for MetaPath {
    fn from(segments: [&str; N]) -> Self {
        segments.iter().copied().collect()
    }
}

impl<'a> FromIterator<&'a str> for MetaPath {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().map(str::to_string).collect(),
        }
    }
}

impl FromIterator<String> for MetaPath {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            segments: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for MetaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// A set of paths with the invariant that no member is a proper prefix of
/// another. Only the highest-level paths are kept: adding `"ssh"` swallows a
/// previously added `"ssh/port"`.
///
/// Used to track which subtrees of a node's metadata have been requested.
#[derive(Clone, Debug, Default)]
pub struct PathSet {
    paths: BTreeSet<MetaPath>,
}

impl PathSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a path. Returns false without modifying the set if an existing
    /// member already covers the new path; otherwise removes all members that
    /// the new path covers, inserts it, and returns true.
    pub fn add(&mut self, new_path: MetaPath) -> bool {
        if self.covers(&new_path) {
            return false;
        }
        self.paths.retain(|existing| !existing.starts_with(&new_path));
        self.paths.insert(new_path);
        true
    }

    /// Returns true if some member of the set is a prefix of `candidate`.
    pub fn covers(&self, candidate: &MetaPath) -> bool {
        self.paths.iter().any(|existing| candidate.starts_with(existing))
    }

    /// Returns true if the subtree at `path` intersects a member's subtree:
    /// some member is a prefix of `path`, or `path` is a prefix of some
    /// member.
    pub fn overlaps(&self, path: &MetaPath) -> bool {
        self.paths
            .iter()
            .any(|existing| path.starts_with(existing) || existing.starts_with(path))
    }

    /// Iterates over the members in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &MetaPath> {
        self.paths.iter()
    }

    /// The number of members.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns true if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A layered key-value store for node metadata.
//!
//! A [`Metastack`] holds named layers of nested mappings at four fixed
//! priority tiers. Reads resolve a path across all layers, deep-merging
//! mappings so that higher-priority layers win per key.

use crate::errors::Error;
use crate::paths::MetaPath;
use indexmap::IndexMap;
use itertools::Either;
use serde_json::Value;
use std::collections::BTreeMap;
use std::iter;

/// A nested metadata mapping. Backed by a sorted map, so JSON encodings of
/// metadata are deterministic.
pub type MetaMap = serde_json::Map<String, Value>;

/// The number of priority tiers. Tier 0 holds static node and group
/// metadata, tier 1 reactor outputs, tier 2 bundle defaults. Tier 3 is
/// reserved.
pub const TIERS: usize = 4;

/// A sparsely indexed stack of named metadata layers.
///
/// Layer identity is `(tier, name)`. A lower tier index means higher
/// priority; within a tier, later-installed layers take priority over
/// earlier ones.
#[derive(Clone, Debug, Default)]
pub struct Metastack {
    tiers: [Tier; TIERS],
}

#[derive(Clone, Debug, Default)]
struct Tier {
    layers: IndexMap<String, MetaMap>,
    // Pre-merged snapshot of the whole tier, frozen by cache_partition.
    partition: Option<MetaMap>,
}

impl Tier {
    fn maps_by_priority(&self) -> impl Iterator<Item = &MetaMap> {
        match &self.partition {
            Some(merged) => Either::Left(iter::once(merged)),
            None => Either::Right(self.layers.values().rev()),
        }
    }
}

// A path resolved within a single layer: either an interior/terminal mapping
// or a terminal scalar/list.
enum Resolved<'a> {
    Mapping(&'a MetaMap),
    Leaf(&'a Value),
}

fn resolve_in<'a>(map: &'a MetaMap, path: &MetaPath) -> Option<Resolved<'a>> {
    let mut current = map;
    let mut segments = path.segments().iter();
    while let Some(segment) = segments.next() {
        match current.get(segment) {
            None => return None,
            Some(Value::Object(inner)) => current = inner,
            Some(leaf) => {
                // A scalar only terminates the path if all segments are used.
                if segments.next().is_some() {
                    return None;
                }
                return Some(Resolved::Leaf(leaf));
            }
        }
    }
    Some(Resolved::Mapping(current))
}

// Fills in keys from the lower-priority mapping, recursing where both sides
// hold mappings. Existing (higher-priority) values are left alone.
fn merge_under(acc: &mut MetaMap, lower: &MetaMap) {
    for (key, value) in lower {
        match acc.get_mut(key) {
            None => {
                acc.insert(key.clone(), value.clone());
            }
            Some(Value::Object(existing)) => {
                if let Value::Object(lower_inner) = value {
                    merge_under(existing, lower_inner);
                }
            }
            Some(_) => {}
        }
    }
}

pub(crate) fn collect_leaf_paths(map: &MetaMap, prefix: &MetaPath, out: &mut Vec<MetaPath>) {
    for (key, value) in map {
        let path = prefix.join(key);
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                collect_leaf_paths(inner, &path, out);
            }
            _ => out.push(path),
        }
    }
}

impl Metastack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the layer `(tier, name)`.
    ///
    /// Panics if `tier` is out of range.
    pub fn set_layer(&mut self, tier: usize, name: impl Into<String>, mapping: MetaMap) {
        self.tiers[tier].layers.insert(name.into(), mapping);
    }

    /// Removes the layer `(tier, name)` and returns its previous mapping, or
    /// an empty mapping if the layer was not present.
    pub fn pop_layer(&mut self, tier: usize, name: &str) -> MetaMap {
        self.tiers[tier].layers.shift_remove(name).unwrap_or_default()
    }

    /// Returns the layer names installed at `tier`, in installation order.
    pub fn layer_names(&self, tier: usize) -> impl Iterator<Item = &str> {
        self.tiers[tier].layers.keys().map(String::as_str)
    }

    /// Freezes `tier` into a pre-merged snapshot. Subsequent reads use the
    /// snapshot; later mutations to the tier's layers do not affect it.
    pub fn cache_partition(&mut self, tier: usize) {
        let mut merged = MetaMap::new();
        for map in self.tiers[tier].maps_by_priority() {
            merge_under(&mut merged, map);
        }
        self.tiers[tier].partition = Some(merged);
    }

    fn maps_by_priority(&self) -> impl Iterator<Item = &MetaMap> {
        self.tiers.iter().flat_map(Tier::maps_by_priority)
    }

    // Raw layers with their names, highest priority first, ignoring frozen
    // partitions. Blame always runs on an uncached stack.
    fn named_layers_by_priority(&self) -> impl Iterator<Item = (&str, &MetaMap)> {
        self.tiers
            .iter()
            .flat_map(|tier| tier.layers.iter().rev())
            .map(|(name, map)| (name.as_str(), map))
    }

    /// Resolves `path` across all layers.
    ///
    /// Layers are walked from highest to lowest priority. Mapping values
    /// deep-merge (the higher-priority side wins per key); the first
    /// scalar/list encountered is returned as-is if no mapping was seen
    /// above it, and otherwise ends the walk with the merged mapping.
    pub fn get(&self, path: &MetaPath) -> Result<Value, Error> {
        let mut merged: Option<MetaMap> = None;
        for map in self.maps_by_priority() {
            match resolve_in(map, path) {
                None => continue,
                Some(Resolved::Mapping(lower)) => match merged.as_mut() {
                    Some(acc) => merge_under(acc, lower),
                    None => merged = Some(lower.clone()),
                },
                Some(Resolved::Leaf(value)) => match merged {
                    // A mapping from higher-priority layers wins entirely.
                    Some(_) => break,
                    None => return Ok(value.clone()),
                },
            }
        }
        merged
            .map(Value::Object)
            .ok_or_else(|| Error::MissingKey(path.clone()))
    }

    /// Consolidates all layers into a single mapping.
    pub fn as_dict(&self) -> MetaMap {
        let mut merged = MetaMap::new();
        for map in self.maps_by_priority() {
            merge_under(&mut merged, map);
        }
        merged
    }

    /// For each leaf of the consolidated mapping, the names of the layers
    /// that hold a value at that path, in priority order.
    pub fn as_blame(&self) -> BTreeMap<MetaPath, Vec<String>> {
        let mut leaves = Vec::new();
        collect_leaf_paths(&self.as_dict(), &MetaPath::root(), &mut leaves);

        let mut blame = BTreeMap::new();
        for leaf in leaves {
            let layers: Vec<String> = self
                .named_layers_by_priority()
                .filter(|(_, map)| resolve_in(map, &leaf).is_some())
                .map(|(name, _)| name.to_string())
                .collect();
            blame.insert(leaf, layers);
        }
        blame
    }
}

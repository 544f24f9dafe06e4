// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::engine::MetadataEngine;
use crate::errors::Error;
use crate::metastack::{MetaMap, Metastack};
use crate::paths::MetaPath;
use serde_json::Value;
use std::collections::BTreeMap;

/// A lazy, per-node accessor for consolidated metadata.
///
/// Reads are served from the engine's current state; a read that cannot be
/// satisfied yet drives the metadata engine forward first. All requested
/// paths are recorded so the engine can skip reactors that cannot affect
/// anything the caller asked for.
///
/// Views are cheap handles and can be copied freely.
#[derive(Clone, Copy)]
pub struct NodeMetaView<'g> {
    engine: &'g MetadataEngine,
    node_name: &'g str,
}

impl<'g> NodeMetaView<'g> {
    pub(crate) fn new(engine: &'g MetadataEngine, node_name: &'g str) -> Self {
        Self { engine, node_name }
    }

    /// The name of the node this view belongs to.
    pub fn node_name(&self) -> &str {
        self.node_name
    }

    /// Reads the value at `path`, driving the engine if necessary.
    ///
    /// The path is either a `/`-joined string (`"ssh/port"`) or a sequence
    /// of segments. Returns [`Error::MissingKey`] if no metadata source
    /// provides the path.
    pub fn get(&self, path: impl Into<MetaPath>) -> Result<Value, Error> {
        self.engine.view_get(self.node_name, path.into())
    }

    /// Like [`get`](Self::get), but falls back to `default` when the path
    /// is not provided by any metadata source.
    pub fn get_or(
        &self,
        path: impl Into<MetaPath>,
        default: impl Into<Value>,
    ) -> Result<Value, Error> {
        match self.get(path) {
            Ok(value) => Ok(value),
            Err(Error::MissingKey(_)) => Ok(default.into()),
            Err(err) => Err(err),
        }
    }

    /// Reads a single top-level key. Unlike [`get`](Self::get) with a
    /// string path, the key is not split on `/`.
    pub fn get_key(&self, key: &str) -> Result<Value, Error> {
        self.get([key])
    }

    /// The full consolidated metadata mapping for this node.
    pub fn as_map(&self) -> Result<MetaMap, Error> {
        match self.get(MetaPath::root())? {
            Value::Object(map) => Ok(map),
            // Layers are mappings at the root, so a root read always
            // produces a mapping.
            _ => Ok(MetaMap::new()),
        }
    }

    /// A view of another node's metadata. Reading through it from within a
    /// reactor records a cross-node dependency.
    pub fn peer(&self, node_name: &str) -> Result<NodeMetaView<'g>, Error> {
        self.engine.view(node_name)
    }

    /// For each metadata leaf, the layers that contributed to it, in
    /// priority order.
    ///
    /// Forces a full uncached recomputation. Not callable from within a
    /// reactor.
    pub fn blame(&self) -> Result<BTreeMap<MetaPath, Vec<String>>, Error> {
        self.engine.blame_for(self.node_name)
    }

    /// A copy of the node's full metadata stack.
    ///
    /// Forces a full uncached recomputation. Not callable from within a
    /// reactor.
    pub fn stack(&self) -> Result<Metastack, Error> {
        self.engine.stack_for(self.node_name)
    }
}

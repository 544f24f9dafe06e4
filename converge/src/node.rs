// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Managed nodes, groups and metadata reactors.

use crate::engine::NodeMetaView;
use crate::errors::Error;
use crate::metastack::MetaMap;
use crate::paths::MetaPath;
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// The function type behind a [`Reactor`].
pub type ReactorFn = Box<dyn Fn(&NodeMetaView<'_>) -> Result<Reaction, Error>>;

/// What a reactor reported back to the engine.
///
/// A missing metadata key is not part of this enum: reactors propagate
/// [`Error::MissingKey`](crate::Error::MissingKey) with `?`, and the engine
/// tolerates it until convergence.
#[derive(Debug)]
pub enum Reaction {
    /// Install this mapping as the reactor's output layer.
    Set(MetaMap),
    /// The reactor's result can never change again; don't run it again.
    Retire,
}

/// A metadata reactor: a named function that derives part of a node's
/// metadata from this or other nodes' metadata.
#[derive(Debug)]
pub struct Reactor {
    name: String,
    provides: Vec<MetaPath>,
    run: DebugIgnore<ReactorFn>,
}

impl Reactor {
    /// Creates a reactor with the given stable name.
    pub fn new(
        name: impl Into<String>,
        run: impl Fn(&NodeMetaView<'_>) -> Result<Reaction, Error> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            provides: Vec::new(),
            run: DebugIgnore(Box::new(run)),
        }
    }

    /// Declares the paths this reactor pledges to write under. With
    /// verification enabled on the engine, returning paths outside this set
    /// is fatal; the declaration also lets the engine skip the reactor when
    /// nothing under these paths was requested.
    pub fn provides(mut self, paths: impl IntoIterator<Item = impl Into<MetaPath>>) -> Self {
        self.provides = paths.into_iter().map(Into::into).collect();
        self
    }

    /// The reactor's stable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn provided_paths(&self) -> &[MetaPath] {
        &self.provides
    }

    pub(crate) fn call(&self, view: &NodeMetaView<'_>) -> Result<Reaction, Error> {
        (self.run.0)(view)
    }
}

/// A managed node: static metadata inputs plus the reactors that derive
/// more.
#[derive(Debug)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) groups: Vec<String>,
    pub(crate) metadata: MetaMap,
    pub(crate) metadata_defaults: Vec<(String, MetaMap)>,
    pub(crate) reactors: Vec<Reactor>,
}

impl Node {
    /// Creates a node with no groups, metadata or reactors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            metadata: MetaMap::new(),
            metadata_defaults: Vec::new(),
            reactors: Vec::new(),
        }
    }

    /// Sets the node's group memberships, in declaration order.
    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the node's own raw metadata (highest-priority static layer).
    pub fn with_metadata(mut self, metadata: MetaMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds a named defaults mapping (lowest tier, typically one per
    /// bundle).
    pub fn with_metadata_default(mut self, name: impl Into<String>, defaults: MetaMap) -> Self {
        self.metadata_defaults.push((name.into(), defaults));
        self
    }

    /// Registers a reactor. Reactor names identify layers and bookkeeping
    /// entries, so a duplicate name is fatal.
    pub fn add_reactor(&mut self, reactor: Reactor) -> Result<(), Error> {
        if self.reactors.iter().any(|r| r.name == reactor.name) {
            return Err(Error::BundleError(format!(
                "metadata reactor '{}' on node {} has a name that was previously used \
                 by another metadata reactor on the same node",
                reactor.name, self.name,
            )));
        }
        self.reactors.push(reactor);
        Ok(())
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's group memberships.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub(crate) fn reactor(&self, name: &str) -> Option<&Reactor> {
        self.reactors.iter().find(|r| r.name == name)
    }
}

/// A group of nodes contributing static metadata. Groups may contain
/// subgroups; a subgroup's metadata overrides its supergroups'.
#[derive(Clone, Debug)]
pub struct Group {
    pub(crate) name: String,
    pub(crate) metadata: MetaMap,
    pub(crate) subgroups: Vec<String>,
}

impl Group {
    /// Creates a group with no metadata or subgroups.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: MetaMap::new(),
            subgroups: Vec::new(),
        }
    }

    /// Sets the group's metadata mapping.
    pub fn with_metadata(mut self, metadata: MetaMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Names the group's subgroups.
    pub fn with_subgroups(mut self, subgroups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subgroups = subgroups.into_iter().map(Into::into).collect();
        self
    }

    /// The group's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Orders a node's groups so that supergroups come before their subgroups,
/// keeping the declared order otherwise. Layers installed later take
/// priority, so this makes subgroup metadata override supergroup metadata.
pub(crate) fn flatten_group_hierarchy(
    group_names: &[String],
    groups: &IndexMap<String, Group>,
) -> Result<Vec<String>, Error> {
    for name in group_names {
        if !groups.contains_key(name) {
            return Err(Error::NoSuchGroup(name.clone()));
        }
    }
    let members: BTreeSet<&str> = group_names.iter().map(String::as_str).collect();

    // Number of supergroups each member has within the member set.
    let mut parents_left: IndexMap<&str, usize> =
        group_names.iter().map(|name| (name.as_str(), 0)).collect();
    for name in &members {
        for subgroup in &groups[*name].subgroups {
            if let Some(count) = parents_left.get_mut(subgroup.as_str()) {
                *count += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(group_names.len());
    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    while order.len() < parents_left.len() {
        let next = parents_left
            .iter()
            .find(|(name, count)| **count == 0 && !emitted.contains(*name))
            .map(|(name, _)| *name);
        let name = match next {
            Some(name) => name,
            None => {
                let remaining = parents_left
                    .keys()
                    .filter(|name| !emitted.contains(*name))
                    .map(|name| name.to_string())
                    .collect();
                return Err(Error::GroupCycle(remaining));
            }
        };
        emitted.insert(name);
        order.push(name.to_string());
        for subgroup in &groups[name].subgroups {
            if let Some(count) = parents_left.get_mut(subgroup.as_str()) {
                *count -= 1;
            }
        }
    }
    Ok(order)
}

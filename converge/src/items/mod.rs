// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration items and their dependency model.
//!
//! Items are declared in bundles and carry selectors describing how they
//! relate to other items. [`resolve::prepare_dependencies`] turns a list of
//! items into a transitively closed dependency graph ready for scheduling.

pub mod resolve;
pub mod schedule;
mod selector;

pub use selector::{find_item, resolve_selector};

use crate::errors::Error;
use indexmap::IndexMap;
use semver::Version;
use std::collections::BTreeSet;

/// The kind of synthetic items materialised from canned actions.
pub const ACTION_KIND: &str = "action";

/// A predeclared side effect exposed by an item (e.g. "reload mysql"),
/// materialised as a triggered `action` item during dependency resolution.
#[derive(Clone, Debug, Default)]
pub struct CannedAction {
    /// Selectors the synthetic action will depend on.
    pub needs: Vec<String>,
    /// Selectors that will depend on the synthetic action.
    pub needed_by: Vec<String>,
    /// Tags for the synthetic action.
    pub tags: BTreeSet<String>,
}

/// Behavior contributed by item type implementations, which live outside
/// this crate.
pub trait ItemTypes {
    /// The catalog of canned actions for an item, keyed by action name.
    fn canned_actions(&self, _item: &Item) -> IndexMap<String, CannedAction> {
        IndexMap::new()
    }

    /// The kinds that must not be applied concurrently with `kind` on the
    /// given platform. An empty list means `kind` poses no restrictions.
    fn block_concurrent(&self, _kind: &str, _os: &str, _os_version: &Version) -> Vec<String> {
        Vec::new()
    }

    /// Whether two bundles may define an item of this kind with the same id.
    fn allow_bundle_collision(&self, _kind: &str) -> bool {
        false
    }
}

/// An [`ItemTypes`] implementation with no canned actions and no
/// concurrency restrictions.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultItemTypes;

impl ItemTypes for DefaultItemTypes {}

fn validate_item_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(char::is_whitespace)
}

/// A single configuration item.
///
/// The declared fields (`needs`, `triggers`, ...) hold selectors as written
/// in the bundle. The derived fields (`deps`, `flattened_deps`, ...) are
/// populated by [`resolve::prepare_dependencies`].
#[derive(Clone, Debug)]
pub struct Item {
    kind: String,
    name: String,
    bundle: String,
    tags: BTreeSet<String>,
    pub(crate) needs: Vec<String>,
    pub(crate) needed_by: Vec<String>,
    pub(crate) triggers: Vec<String>,
    pub(crate) triggered_by: Vec<String>,
    pub(crate) precedes: Vec<String>,
    pub(crate) preceded_by: Vec<String>,
    pub(crate) triggered: bool,
    pub(crate) cascade_skip: bool,
    // filled in by the resolver
    pub(crate) deps: Vec<String>,
    pub(crate) reverse_deps: Vec<String>,
    pub(crate) concurrency_deps: Vec<String>,
    pub(crate) flattened_deps: BTreeSet<String>,
    pub(crate) incoming_deps: BTreeSet<String>,
    pub(crate) precedes_items: Vec<String>,
}

impl Item {
    /// Creates an item of the given kind and name within a bundle.
    ///
    /// Kind and name must be non-empty and free of whitespace; the kind
    /// must not contain `:`.
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        bundle: impl Into<String>,
    ) -> Result<Self, Error> {
        let kind = kind.into();
        let name = name.into();
        if !validate_item_name(&kind) || kind.contains(':') {
            return Err(Error::BundleError(format!("invalid item kind: {}", kind)));
        }
        if !validate_item_name(&name) {
            return Err(Error::BundleError(format!("invalid item name: {}", name)));
        }
        Ok(Self::unchecked(kind, name, bundle.into()))
    }

    // Canned actions produce names like "pkg:mysql:reload"; name validation
    // is skipped for them.
    pub(crate) fn new_action(name: String, bundle: String, attrs: CannedAction) -> Self {
        let mut action = Self::unchecked(ACTION_KIND.to_string(), name, bundle);
        action.needs = attrs.needs.clone();
        action.needed_by = attrs.needed_by;
        action.tags = attrs.tags;
        action.triggered = true;
        action.deps = attrs.needs;
        action
    }

    fn unchecked(kind: String, name: String, bundle: String) -> Self {
        Self {
            kind,
            name,
            bundle,
            tags: BTreeSet::new(),
            needs: Vec::new(),
            needed_by: Vec::new(),
            triggers: Vec::new(),
            triggered_by: Vec::new(),
            precedes: Vec::new(),
            preceded_by: Vec::new(),
            triggered: false,
            cascade_skip: true,
            deps: Vec::new(),
            reverse_deps: Vec::new(),
            concurrency_deps: Vec::new(),
            flattened_deps: BTreeSet::new(),
            incoming_deps: BTreeSet::new(),
            precedes_items: Vec::new(),
        }
    }

    /// Sets the item's tags.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Selectors this item depends on.
    pub fn with_needs(mut self, needs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// Selectors that depend on this item.
    pub fn with_needed_by(mut self, needed_by: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.needed_by = needed_by.into_iter().map(Into::into).collect();
        self
    }

    /// Selectors of triggered items this item fires when it changes.
    pub fn with_triggers(mut self, triggers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    /// Selectors of items whose changes fire this (triggered) item.
    pub fn with_triggered_by(
        mut self,
        triggered_by: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.triggered_by = triggered_by.into_iter().map(Into::into).collect();
        self
    }

    /// Selectors of items this item precedes (reverse of `preceded_by`).
    pub fn with_precedes(mut self, precedes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.precedes = precedes.into_iter().map(Into::into).collect();
        self
    }

    /// Selectors of triggered items that run before this item if they have
    /// anything to do.
    pub fn with_preceded_by(
        mut self,
        preceded_by: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.preceded_by = preceded_by.into_iter().map(Into::into).collect();
        self
    }

    /// Marks this item as triggered: it only applies when another item
    /// fires it.
    pub fn with_triggered(mut self, triggered: bool) -> Self {
        self.triggered = triggered;
        self
    }

    /// Whether skipping this item also skips the items depending on it.
    pub fn with_cascade_skip(mut self, cascade_skip: bool) -> Self {
        self.cascade_skip = cascade_skip;
        self
    }

    /// The item's id, `kind:name`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    /// The item's kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The item's name (the part of the id after the kind).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bundle this item was declared in.
    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    /// The item's tags.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Whether this item only applies when triggered.
    pub fn triggered(&self) -> bool {
        self.triggered
    }

    /// Whether skipping this item skips its dependents as well.
    pub fn cascade_skip(&self) -> bool {
        self.cascade_skip
    }

    /// Direct dependencies after resolution: `needs` plus all injected
    /// edges.
    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    /// The ids injected into `deps` via other items' `needed_by`.
    pub fn reverse_deps(&self) -> &[String] {
        &self.reverse_deps
    }

    /// The ids injected into `deps` to serialise concurrency-blocked kinds.
    pub fn concurrency_deps(&self) -> &[String] {
        &self.concurrency_deps
    }

    /// The transitive closure of `deps` under selector expansion.
    pub fn flattened_deps(&self) -> &BTreeSet<String> {
        &self.flattened_deps
    }

    /// Ids of items whose flattened deps contain this item.
    pub fn incoming_deps(&self) -> &BTreeSet<String> {
        &self.incoming_deps
    }

    /// Ids of items this (triggered) item precedes.
    pub fn precedes_items(&self) -> &[String] {
        &self.precedes_items
    }
}

/// A collection of config items, bound to a bundle name.
///
/// Loading bundles from disk is out of scope here; a `Bundle` is the thin
/// carrier the loader hands over.
#[derive(Clone, Debug)]
pub struct Bundle {
    name: String,
    items: Vec<Item>,
}

impl Bundle {
    /// Creates an empty bundle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    /// Adds an item, stamping it with this bundle's name.
    pub fn add_item(&mut self, mut item: Item) {
        item.bundle = self.name.clone();
        self.items.push(item);
    }

    /// The bundle's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bundle's items.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Consumes the bundle, yielding its items.
    pub fn into_items(self) -> Vec<Item> {
        self.items
    }
}

/// Collects the items of several bundles into one list, ready for
/// [`resolve::prepare_dependencies`].
pub fn collect_items(bundles: impl IntoIterator<Item = Bundle>) -> Vec<Item> {
    bundles.into_iter().flat_map(Bundle::into_items).collect()
}

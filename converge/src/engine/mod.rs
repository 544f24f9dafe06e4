// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The metadata fixed-point engine.
//!
//! Given a set of nodes and groups, the [`MetadataEngine`] layers static
//! metadata inputs with the outputs of user-written reactors and iterates
//! until every reactor's output has stabilized. Reactors may read the
//! metadata of other nodes; the engine tracks those cross-node reads and
//! re-runs dependent reactors when their inputs change.

mod cache;
mod view;

pub use view::NodeMetaView;

use crate::errors::Error;
use crate::metastack::{collect_leaf_paths, MetaMap, Metastack};
use crate::node::{flatten_group_hierarchy, Group, Node, Reaction};
use crate::paths::{MetaPath, PathSet};
use crate::quit;
use indexmap::IndexMap;
use itertools::Itertools;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

// Cap on per-node reactor iterations, the safety net against flip-flopping
// reactors.
static MAX_METADATA_ITERATIONS: Lazy<usize> = Lazy::new(|| {
    env::var("BW_MAX_METADATA_ITERATIONS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(1000)
});

static METADATA_CACHE_DIR: Lazy<Option<PathBuf>> =
    Lazy::new(|| env::var_os("BW_METADATA_CACHE_DIR").map(PathBuf::from));

/// How many flip-flop suspects to include in the iteration cap error.
const TOP_CHANGERS: usize = 25;

// Raised by engine stages when metadata processing needs to start from the
// top, or when it failed for real.
enum Interrupt {
    StartOver,
    Failed(Error),
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Failed(err)
    }
}

// Per-node view state, owned by the engine on behalf of the node's views.
#[derive(Debug, Default)]
struct ViewState {
    stack: Metastack,
    requested_paths: PathSet,
    completed_reactors: BTreeSet<String>,
    // Has this node completed all reactors relevant to the requested paths?
    satisfied: bool,
    cache_probed: bool,
    came_from_cache: bool,
}

// State of a single fixed-point computation, reset on each entry from an
// unsatisfied view.
#[derive(Debug)]
struct RunState {
    // reactors that asked never to be run again
    do_not_run_again: BTreeSet<(String, String)>,
    // reactors that reported missing keys (and which ones)
    keyerrors: BTreeMap<(String, String), Error>,
    // maps each node to all nodes that depend on it
    node_deps: BTreeMap<String, BTreeSet<String>>,
    // how often run_reactors was called per node
    iterations: BTreeMap<String, usize>,
    // A node is stable when all its relevant reactors return unchanged
    // metadata, except for those reactors that look at other nodes.
    stable: BTreeMap<String, bool>,
    // nodes encountered as a dependency but not yet run
    nodes_new: BTreeSet<String>,
    // nodes whose cross-node inputs changed and that must rerun
    nodes_triggered: BTreeSet<String>,
    // nodes that received initial processing
    nodes_seen: BTreeSet<String>,
    // reactors that have looked at other nodes
    reactors_with_deps: BTreeMap<String, BTreeSet<String>>,
    // how often each reactor changed its output
    changes: BTreeMap<(String, String), usize>,
    // how often each reactor ran
    runs: BTreeMap<(String, String), usize>,
    // how often reactors ran in total
    reactors_run: usize,
    rng: StdRng,
}

impl RunState {
    fn new(seed: u64) -> Self {
        Self {
            do_not_run_again: BTreeSet::new(),
            keyerrors: BTreeMap::new(),
            node_deps: BTreeMap::new(),
            iterations: BTreeMap::new(),
            stable: BTreeMap::new(),
            nodes_new: BTreeSet::new(),
            nodes_triggered: BTreeSet::new(),
            nodes_seen: BTreeSet::new(),
            reactors_with_deps: BTreeMap::new(),
            changes: BTreeMap::new(),
            runs: BTreeMap::new(),
            reactors_run: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

// Marks reactor execution for the duration of a call, so views switch to
// dependency recording and refuse blame/stack access.
struct ReactorGuard<'a>(&'a Cell<bool>);

impl<'a> ReactorGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for ReactorGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Drives the metadata of a set of nodes to a fixed point.
///
/// The engine owns the node and group registries and the per-node metadata
/// stacks. Metadata is accessed through [`NodeMetaView`]s obtained from
/// [`view`](Self::view); the first read on an unsatisfied view triggers a
/// build.
#[derive(Debug)]
pub struct MetadataEngine {
    nodes: IndexMap<String, Node>,
    groups: IndexMap<String, Group>,
    verify_reactor_provides: bool,
    max_iterations: usize,
    cache_dir: Option<PathBuf>,
    content_hash: Option<String>,
    seed: Option<u64>,
    views: RefCell<IndexMap<String, ViewState>>,
    run: RefCell<RunState>,
    in_a_reactor: Cell<bool>,
    // Cross-node reads observed while a reactor is executing.
    partial_accessed: RefCell<BTreeSet<String>>,
    build_lock: Mutex<()>,
}

impl MetadataEngine {
    /// Creates an engine over the given nodes and groups.
    ///
    /// The iteration cap defaults to `BW_MAX_METADATA_ITERATIONS` (1000)
    /// and the cache directory to `BW_METADATA_CACHE_DIR`.
    pub fn new(
        nodes: impl IntoIterator<Item = Node>,
        groups: impl IntoIterator<Item = Group>,
    ) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|node| (node.name.clone(), node))
                .collect(),
            groups: groups
                .into_iter()
                .map(|group| (group.name.clone(), group))
                .collect(),
            verify_reactor_provides: false,
            max_iterations: *MAX_METADATA_ITERATIONS,
            cache_dir: METADATA_CACHE_DIR.clone(),
            content_hash: None,
            seed: None,
            views: RefCell::new(IndexMap::new()),
            run: RefCell::new(RunState::new(0)),
            in_a_reactor: Cell::new(false),
            partial_accessed: RefCell::new(BTreeSet::new()),
            build_lock: Mutex::new(()),
        }
    }

    /// Sets the content hash of all metadata-contributing inputs. Enables
    /// the disk cache (together with a cache directory) and seeds the
    /// per-run RNG.
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Overrides the disk cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Checks reactor return values against their declared `provides`.
    pub fn with_verify_reactor_provides(mut self, verify: bool) -> Self {
        self.verify_reactor_provides = verify;
        self
    }

    /// Overrides the per-node reactor iteration cap.
    pub fn with_max_iterations(mut self, limit: usize) -> Self {
        self.max_iterations = limit;
        self
    }

    /// Fixes the RNG seed for reactor scheduling, instead of deriving it
    /// from the content hash.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Returns a metadata view for the given node.
    pub fn view<'g>(&'g self, node_name: &str) -> Result<NodeMetaView<'g>, Error> {
        match self.nodes.get_full(node_name) {
            Some((_, key, _)) => Ok(NodeMetaView::new(self, key.as_str())),
            None => Err(Error::NoSuchNode(node_name.to_string())),
        }
    }

    /// The consolidated metadata mapping for the given node.
    pub fn metadata(&self, node_name: &str) -> Result<MetaMap, Error> {
        self.view(node_name)?.as_map()
    }

    /// Removes the disk cache for the current content hash.
    pub fn clear_metadata_cache(&self) -> Result<(), Error> {
        if let (Some(dir), Some(hash)) = (&self.cache_dir, &self.content_hash) {
            log::debug!("removing {}/{}", dir.display(), hash);
            cache::clear(dir, hash)?;
        }
        Ok(())
    }

    // ---
    // View plumbing
    // ---

    fn lock_build(&self) -> MutexGuard<'_, ()> {
        self.build_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn view_get(&self, node_name: &str, path: MetaPath) -> Result<Value, Error> {
        {
            let mut views = self.views.borrow_mut();
            let state = views.entry(node_name.to_string()).or_default();
            if state.requested_paths.add(path.clone()) {
                state.satisfied = false;
            }
            if !state.cache_probed {
                state.cache_probed = true;
                if let (Some(dir), Some(hash)) = (&self.cache_dir, &self.content_hash) {
                    if let Some(blob) = cache::read_blob(dir, hash, node_name) {
                        // Cached stacks are flat: the consolidated mapping
                        // becomes a single static layer.
                        let mut stack = Metastack::new();
                        stack.set_layer(0, "flattened", blob);
                        state.stack = stack;
                        state.came_from_cache = true;
                        state.satisfied = true;
                    }
                }
            }
        }

        if self.in_a_reactor.get() {
            self.partial_accessed
                .borrow_mut()
                .insert(node_name.to_string());
        } else {
            let _guard = self.lock_build();
            self.build(node_name)?;
        }

        let views = self.views.borrow();
        match views.get(node_name) {
            Some(state) => state.stack.get(&path),
            None => Err(Error::MissingKey(path)),
        }
    }

    // Cached stacks are flat and useless for blame and stack access, so
    // those force a full recomputation first.
    fn ensure_uncached(&self, node_name: &str) -> Result<(), Error> {
        if self.in_a_reactor.get() {
            return Err(Error::AccessInsideReactor);
        }
        {
            let mut views = self.views.borrow_mut();
            let state = views.entry(node_name.to_string()).or_default();
            if state.came_from_cache {
                state.stack = Metastack::new();
                state.satisfied = false;
            }
        }
        let _guard = self.lock_build();
        self.build(node_name)
    }

    pub(crate) fn blame_for(
        &self,
        node_name: &str,
    ) -> Result<BTreeMap<MetaPath, Vec<String>>, Error> {
        self.ensure_uncached(node_name)?;
        let views = self.views.borrow();
        Ok(views
            .get(node_name)
            .map(|state| state.stack.as_blame())
            .unwrap_or_default())
    }

    pub(crate) fn stack_for(&self, node_name: &str) -> Result<Metastack, Error> {
        self.ensure_uncached(node_name)?;
        let views = self.views.borrow();
        Ok(views
            .get(node_name)
            .map(|state| state.stack.clone())
            .unwrap_or_default())
    }

    // ---
    // Reactor relevance
    // ---

    // All reactors that might provide some of the requested paths. A
    // reactor without a provides declaration is always relevant.
    fn relevant_reactor_names(&self, node_name: &str) -> Vec<String> {
        let node = match self.nodes.get(node_name) {
            Some(node) => node,
            None => return Vec::new(),
        };
        let views = self.views.borrow();
        let requested = views.get(node_name).map(|state| &state.requested_paths);
        node.reactors
            .iter()
            .filter(|reactor| {
                let provides = reactor.provided_paths();
                provides.is_empty()
                    || requested.map_or(false, |paths| {
                        provides.iter().any(|provided| paths.overlaps(provided))
                    })
            })
            .map(|reactor| reactor.name().to_string())
            .collect()
    }

    // Relevant reactors that have not yet been run to completion.
    fn pending_reactors(&self, node_name: &str) -> Vec<String> {
        let relevant = self.relevant_reactor_names(node_name);
        let views = self.views.borrow();
        let completed = views.get(node_name).map(|state| &state.completed_reactors);
        relevant
            .into_iter()
            .filter(|name| completed.map_or(true, |done| !done.contains(name)))
            .collect()
    }

    // ---
    // The fixed-point loop
    // ---

    fn run_seed(&self) -> u64 {
        if let Some(seed) = self.seed {
            return seed;
        }
        let mut hasher = DefaultHasher::new();
        self.content_hash.hash(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn build(&self, initial_node: &str) -> Result<(), Error> {
        if self
            .views
            .borrow()
            .get(initial_node)
            .map_or(false, |state| state.satisfied)
        {
            return Ok(());
        }

        *self.run.borrow_mut() = RunState::new(self.run_seed());
        self.run
            .borrow_mut()
            .nodes_new
            .insert(initial_node.to_string());

        while !quit::is_requested() {
            {
                let run = self.run.borrow();
                log::debug!(
                    "running metadata reactors ({} nodes, {} reactors, {} runs)",
                    run.nodes_new.len() + run.nodes_seen.len(),
                    run.changes.len(),
                    run.reactors_run,
                );
            }
            // Control flow here is a bit iffy. The stages below bail out
            // with StartOver in order to aggressively process new nodes
            // first; each stage checks for nodes in a certain state.
            match self.run_stages() {
                Ok(()) => break,
                Err(Interrupt::StartOver) => continue,
                Err(Interrupt::Failed(err)) => return Err(err),
            }
        }

        let run = self.run.borrow();
        if !run.keyerrors.is_empty() && !quit::is_requested() {
            let mut msg = String::from(
                "These metadata reactors raised a missing-key error \
                 even after all other reactors were done:",
            );
            for ((node_name, reactor_name), err) in &run.keyerrors {
                msg.push_str(&format!("\n\n  {} {}\n    {}", node_name, reactor_name, err));
            }
            return Err(Error::PersistentKeyError(msg));
        }
        log::debug!("metadata generation for selected nodes finished");
        Ok(())
    }

    fn run_stages(&self) -> Result<(), Interrupt> {
        // Newly discovered nodes are run as early as possible, so their
        // static metadata becomes available to other nodes and additional
        // nodes are discovered as quickly as possible.
        self.run_new_nodes()?;
        // Nodes become triggered when something they previously looked at
        // on another node changed.
        self.run_triggered_nodes()?;
        // Run all unstable nodes to the point where everything is stable
        // again, except for reactors that depend on other nodes.
        self.run_unstable_nodes()?;
        // Confirm nothing changes when reactors with cross-node
        // dependencies run; local-only reactors then get another chance to
        // react to what those changed.
        self.run_nodes_with_deps()?;
        // Done. Blacklist completed reactors so they don't run again if
        // additional metadata is requested later.
        self.finalize()?;
        Ok(())
    }

    fn run_new_nodes(&self) -> Result<(), Interrupt> {
        let next = self.run.borrow().nodes_new.iter().next().cloned();
        if let Some(node_name) = next {
            {
                let mut run = self.run.borrow_mut();
                run.nodes_new.remove(&node_name);
                run.nodes_seen.insert(node_name.clone());
            }
            self.initial_run_for_node(&node_name)?;
            return Err(Interrupt::StartOver);
        }
        Ok(())
    }

    fn run_triggered_nodes(&self) -> Result<(), Interrupt> {
        let next = self.run.borrow().nodes_triggered.iter().next().cloned();
        if let Some(node_name) = next {
            self.run.borrow_mut().nodes_triggered.remove(&node_name);
            log::debug!("triggered metadata run for {}", node_name);
            self.run_reactors(&node_name, true, false)?;
            return Err(Interrupt::StartOver);
        }
        Ok(())
    }

    fn run_unstable_nodes(&self) -> Result<(), Interrupt> {
        let unstable: Vec<String> = {
            let run = self.run.borrow();
            run.stable
                .iter()
                .filter(|(_, stable)| !**stable)
                .map(|(node_name, _)| node_name.clone())
                .collect()
        };
        let mut encountered_unstable = false;

        for node_name in unstable {
            log::debug!("begin metadata stabilization test for {}", node_name);
            self.run_reactors(&node_name, false, true)?;
            if self.node_is_stable(&node_name) {
                log::debug!("metadata stabilized for {}", node_name);
            } else {
                log::debug!("metadata remains unstable for {}", node_name);
                encountered_unstable = true;
            }
            if !self.run.borrow().nodes_new.is_empty() {
                // we have found a new dependency, process it immediately;
                // going wide early should be more efficient
                return Err(Interrupt::StartOver);
            }
        }
        if encountered_unstable {
            log::debug!("found an unstable node (without_deps=true)");
            return Err(Interrupt::StartOver);
        }
        Ok(())
    }

    fn run_nodes_with_deps(&self) -> Result<(), Interrupt> {
        let mut node_names: Vec<String> = {
            let run = self.run.borrow();
            run.stable.keys().cloned().collect()
        };
        {
            let mut run = self.run.borrow_mut();
            node_names.shuffle(&mut run.rng);
        }
        let mut encountered_unstable = false;

        for node_name in node_names {
            log::debug!("begin final stabilization test for {}", node_name);
            self.run_reactors(&node_name, true, false)?;
            if !self.node_is_stable(&node_name) {
                log::debug!("{} still unstable", node_name);
                encountered_unstable = true;
            }
            if !self.run.borrow().nodes_new.is_empty() {
                return Err(Interrupt::StartOver);
            }
        }
        if encountered_unstable {
            log::debug!("found an unstable node (with_deps=true)");
            return Err(Interrupt::StartOver);
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), Interrupt> {
        let node_names: Vec<String> = self.run.borrow().stable.keys().cloned().collect();
        for node_name in node_names {
            let relevant = self.relevant_reactor_names(&node_name);
            let write_cache = {
                let mut views = self.views.borrow_mut();
                let state = views.entry(node_name.clone()).or_default();
                state.completed_reactors.extend(relevant);
                state.satisfied = true;
                state.came_from_cache = false;
                // The root being requested means full metadata was built.
                state.requested_paths.covers(&MetaPath::root())
            };
            if write_cache {
                if let (Some(dir), Some(hash)) = (&self.cache_dir, &self.content_hash) {
                    let metadata = {
                        let views = self.views.borrow();
                        views
                            .get(&node_name)
                            .map(|state| state.stack.as_dict())
                            .unwrap_or_default()
                    };
                    cache::write_blob(dir, hash, &node_name, &metadata)?;
                }
            }
        }
        Ok(())
    }

    fn node_is_stable(&self, node_name: &str) -> bool {
        self.run
            .borrow()
            .stable
            .get(node_name)
            .copied()
            .unwrap_or(false)
    }

    fn initial_run_for_node(&self, node_name: &str) -> Result<(), Error> {
        log::debug!("initial metadata run for {}", node_name);
        let node = self
            .nodes
            .get(node_name)
            .ok_or_else(|| Error::NoSuchNode(node_name.to_string()))?;

        // randomize order to increase the chance of exposing clashing
        // defaults
        let mut defaults = node.metadata_defaults.clone();
        {
            let mut run = self.run.borrow_mut();
            defaults.shuffle(&mut run.rng);
        }
        let group_order = flatten_group_hierarchy(&node.groups, &self.groups)?;

        {
            let mut views = self.views.borrow_mut();
            let state = views.entry(node_name.to_string()).or_default();
            for (defaults_name, mapping) in defaults {
                state.stack.set_layer(2, defaults_name, mapping);
            }
            state.stack.cache_partition(2);

            for group_name in &group_order {
                state.stack.set_layer(
                    0,
                    format!("group:{}", group_name),
                    self.groups[group_name.as_str()].metadata.clone(),
                );
            }
            state
                .stack
                .set_layer(0, format!("node:{}", node_name), node.metadata.clone());
            state.stack.cache_partition(0);
        }

        // run all reactors once to get started
        self.run_reactors(node_name, true, true)
    }

    fn check_iteration_count(&self, node_name: &str) -> Result<(), Error> {
        let mut run = self.run.borrow_mut();
        let count = run.iterations.entry(node_name.to_string()).or_insert(0);
        *count += 1;
        if *count > self.max_iterations {
            let details = run
                .changes
                .iter()
                .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
                .take(TOP_CHANGERS)
                .map(|((node, reactor), changes)| format!("  {}\t{}\t{}", changes, node, reactor))
                .join("\n");
            return Err(Error::MaxIterationsExceeded {
                node: node_name.to_string(),
                limit: self.max_iterations,
                details,
            });
        }
        Ok(())
    }

    fn run_reactors(
        &self,
        node_name: &str,
        with_deps: bool,
        without_deps: bool,
    ) -> Result<(), Error> {
        self.check_iteration_count(node_name)?;
        let mut any_reactor_changed = false;

        // Reactors previously observed to look at other nodes run first,
        // reactors without cross-node deps second.
        for depsonly in [true, false] {
            if depsonly && !with_deps {
                continue;
            }
            if !depsonly && !without_deps {
                continue;
            }
            let mut pending = self.pending_reactors(node_name);
            {
                let mut run = self.run.borrow_mut();
                pending.shuffle(&mut run.rng);
            }
            for reactor_name in pending {
                let has_deps = {
                    let run = self.run.borrow();
                    run.reactors_with_deps
                        .get(node_name)
                        .map_or(false, |set| set.contains(&reactor_name))
                };
                if depsonly != has_deps {
                    continue;
                }
                let (changed, deps) = self.run_reactor(node_name, &reactor_name)?;
                log::debug!(
                    "{}:{} changed={} deps={:?}",
                    node_name,
                    reactor_name,
                    changed,
                    deps,
                );
                if changed {
                    any_reactor_changed = true;
                }
                let mut run = self.run.borrow_mut();
                if !deps.is_empty() {
                    // record that this reactor has dependencies; the marker
                    // is never removed, the housekeeping cost of noticing
                    // that deps went away isn't worth it
                    run.reactors_with_deps
                        .entry(node_name.to_string())
                        .or_default()
                        .insert(reactor_name.clone());
                }
                for required_node in deps {
                    if !run.nodes_seen.contains(&required_node) {
                        // a node we didn't need until now
                        run.nodes_new.insert(required_node.clone());
                    }
                    // rerun this node if the required node changes
                    run.node_deps
                        .entry(required_node)
                        .or_default()
                        .insert(node_name.to_string());
                }
            }
        }

        let mut run = self.run.borrow_mut();
        if any_reactor_changed {
            let dependents: Vec<String> = run
                .node_deps
                .get(node_name)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            for dependent in dependents {
                log::debug!("{} triggering metadata rerun on {}", node_name, dependent);
                run.nodes_triggered.insert(dependent);
            }
        }
        if with_deps && any_reactor_changed {
            run.stable.insert(node_name.to_string(), false);
        } else if without_deps {
            run.stable.insert(node_name.to_string(), !any_reactor_changed);
        }
        Ok(())
    }

    fn run_reactor(
        &self,
        node_name: &str,
        reactor_name: &str,
    ) -> Result<(bool, BTreeSet<String>), Error> {
        let key = (node_name.to_string(), reactor_name.to_string());
        {
            let run = self.run.borrow();
            if run.do_not_run_again.contains(&key) {
                return Ok((false, BTreeSet::new()));
            }
        }
        self.partial_accessed.borrow_mut().clear();
        {
            let mut run = self.run.borrow_mut();
            run.reactors_run += 1;
            *run.runs.entry(key.clone()).or_insert(0) += 1;
        }

        // make sure the reactor doesn't react to its own output
        let old_output = {
            let mut views = self.views.borrow_mut();
            let state = views.entry(node_name.to_string()).or_default();
            state.stack.pop_layer(1, reactor_name)
        };

        let node = self
            .nodes
            .get(node_name)
            .ok_or_else(|| Error::NoSuchNode(node_name.to_string()))?;
        let reactor = node.reactor(reactor_name).ok_or_else(|| {
            Error::Internal(format!(
                "reactor {} scheduled on {} but not registered",
                reactor_name, node_name,
            ))
        })?;

        let view = self.view(node_name)?;
        let result = {
            let _guard = ReactorGuard::enter(&self.in_a_reactor);
            reactor.call(&view)
        };
        let mut accessed = std::mem::take(&mut *self.partial_accessed.borrow_mut());
        accessed.remove(node_name);

        match result {
            Err(Error::MissingKey(path)) => {
                // expected while other reactors haven't populated their
                // outputs yet; only fatal if it persists at convergence
                self.run
                    .borrow_mut()
                    .keyerrors
                    .insert(key, Error::MissingKey(path));
                Ok((false, accessed))
            }
            Err(err) => {
                log::error!(
                    "exception while executing metadata reactor {} for node {}",
                    reactor_name,
                    node_name,
                );
                Err(err)
            }
            Ok(Reaction::Retire) => {
                let mut run = self.run.borrow_mut();
                run.do_not_run_again.insert(key.clone());
                // clear any previously stored missing-key error
                run.keyerrors.remove(&key);
                Ok((false, BTreeSet::new()))
            }
            Ok(Reaction::Set(new_output)) => {
                self.run.borrow_mut().keyerrors.remove(&key);

                if self.verify_reactor_provides && !reactor.provided_paths().is_empty() {
                    let undeclared = undeclared_paths(&new_output, reactor.provided_paths());
                    if !undeclared.is_empty() {
                        return Err(Error::UndeclaredReactorPaths {
                            node: node_name.to_string(),
                            reactor: reactor_name.to_string(),
                            paths: undeclared,
                        });
                    }
                }

                let changed = old_output != new_output;
                {
                    let mut views = self.views.borrow_mut();
                    let state = views.entry(node_name.to_string()).or_default();
                    state.stack.set_layer(1, reactor_name, new_output);
                }
                if changed {
                    *self.run.borrow_mut().changes.entry(key).or_insert(0) += 1;
                }
                Ok((changed, accessed))
            }
        }
    }

    // ---
    // Diagnostics for tests
    // ---

    #[cfg(test)]
    pub(crate) fn reactors_run(&self) -> usize {
        self.run.borrow().reactors_run
    }

    #[cfg(test)]
    pub(crate) fn run_count(&self, node_name: &str, reactor_name: &str) -> usize {
        self.run
            .borrow()
            .runs
            .get(&(node_name.to_string(), reactor_name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn nodes_depending_on(&self, node_name: &str) -> BTreeSet<String> {
        self.run
            .borrow()
            .node_deps
            .get(node_name)
            .cloned()
            .unwrap_or_default()
    }
}

// Leaf paths of the returned mapping that are neither inside nor above any
// declared path.
fn undeclared_paths(mapping: &MetaMap, provides: &[MetaPath]) -> Vec<MetaPath> {
    let mut leaves = Vec::new();
    collect_leaf_paths(mapping, &MetaPath::root(), &mut leaves);
    leaves
        .into_iter()
        .filter(|leaf| {
            !provides
                .iter()
                .any(|declared| leaf.starts_with(declared) || declared.starts_with(leaf))
        })
        .collect()
}

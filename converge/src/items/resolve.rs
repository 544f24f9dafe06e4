// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency preprocessing for config items.
//!
//! [`prepare_dependencies`] expands the declared relationships between items
//! (`needs`, `needed_by`, triggers, precedence, canned actions) into a
//! single transitively closed dependency set per item, and serialises items
//! of kinds that must not be applied concurrently.

use crate::errors::Error;
use crate::items::{resolve_selector, Item, ItemTypes};
use fixedbitset::FixedBitSet;
use indexmap::IndexSet;
use petgraph::algo::{has_path_connecting, DfsSpace};
use petgraph::prelude::*;
use petgraph::unionfind::UnionFind;
use semver::Version;
use std::collections::{BTreeMap, BTreeSet};

/// Performs all dependency preprocessing on a list of items.
///
/// Runs, in order: canned action injection, reverse trigger translation,
/// reverse dependency translation, trigger dependency injection,
/// `preceded_by` injection, dependency flattening and concurrency blocker
/// daisy-chaining. Later passes rely on fields produced by earlier ones.
///
/// Dependency loops are tolerated and absorbed by the flattening pass;
/// selectors naming missing referents and trigger attribute violations are
/// fatal.
pub fn prepare_dependencies(
    mut items: Vec<Item>,
    types: &dyn ItemTypes,
    os: &str,
    os_version: &Version,
) -> Result<Vec<Item>, Error> {
    check_bundle_collisions(&items, types)?;
    for item in &items {
        check_loopback_dependency(item)?;
    }
    for item in &mut items {
        item.deps = item.needs.clone();
        item.reverse_deps.clear();
        item.concurrency_deps.clear();
        item.flattened_deps.clear();
        item.incoming_deps.clear();
        item.precedes_items.clear();
    }

    inject_canned_actions(&mut items, types);
    inject_reverse_triggers(&mut items)?;
    inject_reverse_dependencies(&mut items)?;
    inject_trigger_dependencies(&mut items)?;
    inject_preceded_by_dependencies(&mut items)?;
    flatten_dependencies(&mut items)?;
    inject_concurrency_blockers(&mut items, types, os, os_version);
    check_redundant_dependencies(&items);

    Ok(items)
}

fn check_bundle_collisions(items: &[Item], types: &dyn ItemTypes) -> Result<(), Error> {
    for (idx, item) in items.iter().enumerate() {
        for other in &items[idx + 1..] {
            if item.id() == other.id()
                && item.bundle() != other.bundle()
                && !types.allow_bundle_collision(item.kind())
            {
                return Err(Error::BundleError(format!(
                    "duplicate definition of {} in bundles '{}' and '{}'",
                    item.id(),
                    item.bundle(),
                    other.bundle(),
                )));
            }
        }
    }
    Ok(())
}

fn check_loopback_dependency(item: &Item) -> Result<(), Error> {
    if item.needs.iter().any(|dep| *dep == item.id()) {
        return Err(Error::ItemDependency(format!(
            "'{}' in bundle '{}' cannot depend on itself",
            item.id(),
            item.bundle(),
        )));
    }
    Ok(())
}

// Materialises canned actions like "pkg:mysql:reload" as triggered action
// items and appends them to the item list.
fn inject_canned_actions(items: &mut Vec<Item>, types: &dyn ItemTypes) {
    let mut actions = Vec::new();
    for item in items.iter() {
        for (action_name, attrs) in types.canned_actions(item) {
            actions.push(Item::new_action(
                format!("{}:{}", item.id(), action_name),
                item.bundle().to_string(),
                attrs,
            ));
        }
    }
    items.extend(actions);
}

fn missing_referent(err: Error, item_id: &str, bundle: &str, what: &str, selector: &str) -> Error {
    match err {
        Error::NoSuchItem(_) => Error::ItemDependency(format!(
            "'{}' in bundle '{}' has a {} on '{}', which doesn't exist",
            item_id, bundle, what, selector,
        )),
        other => other,
    }
}

// Turns 'triggered_by' and 'precedes' attributes into standard triggers
// (defined on the opposing end).
fn inject_reverse_triggers(items: &mut Vec<Item>) -> Result<(), Error> {
    for idx in 0..items.len() {
        let item_id = items[idx].id();
        let bundle = items[idx].bundle().to_string();

        for selector in items[idx].triggered_by.clone() {
            let targets = resolve_selector(&selector, items).map_err(|err| {
                missing_referent(err, &item_id, &bundle, "reverse trigger (triggered_by)", &selector)
            })?;
            for target in targets {
                items[target].triggers.push(item_id.clone());
            }
        }

        for selector in items[idx].precedes.clone() {
            let targets = resolve_selector(&selector, items).map_err(|err| {
                missing_referent(err, &item_id, &bundle, "reverse trigger (precedes)", &selector)
            })?;
            for target in targets {
                items[target].preceded_by.push(item_id.clone());
            }
        }
    }
    Ok(())
}

// Turns 'needed_by' into standard dependencies on the opposing end.
fn inject_reverse_dependencies(items: &mut Vec<Item>) -> Result<(), Error> {
    for idx in 0..items.len() {
        let item_id = items[idx].id();
        let bundle = items[idx].bundle().to_string();

        for selector in items[idx].needed_by.clone() {
            let targets = resolve_selector(&selector, items).map_err(|err| {
                missing_referent(
                    err,
                    &item_id,
                    &bundle,
                    "reverse dependency (needed_by)",
                    &selector,
                )
            })?;
            for target in targets {
                if !items[target].deps.contains(&item_id) {
                    items[target].deps.push(item_id.clone());
                    items[target].reverse_deps.push(item_id.clone());
                }
            }
        }
    }
    Ok(())
}

// Injects dependencies from all triggered items to their triggering items.
fn inject_trigger_dependencies(items: &mut Vec<Item>) -> Result<(), Error> {
    for idx in 0..items.len() {
        let item_id = items[idx].id();
        let bundle = items[idx].bundle().to_string();

        for selector in items[idx].triggers.clone() {
            let targets = resolve_selector(&selector, items).map_err(|err| match err {
                Error::NoSuchItem(_) => Error::BundleError(format!(
                    "unable to find definition of '{}' triggered by '{}' in bundle '{}'",
                    selector, item_id, bundle,
                )),
                other => other,
            })?;
            for target in targets {
                if items[target].triggered {
                    items[target].deps.push(item_id.clone());
                } else {
                    return Err(Error::BundleError(format!(
                        "'{}' in bundle '{}' triggered by '{}' in bundle '{}', \
                         but missing 'triggered' attribute",
                        items[target].id(),
                        items[target].bundle(),
                        item_id,
                        bundle,
                    )));
                }
            }
        }
    }
    Ok(())
}

// Injects dependencies from all triggering items to their preceded_by items
// and attaches triggering items to preceding items.
fn inject_preceded_by_dependencies(items: &mut Vec<Item>) -> Result<(), Error> {
    for idx in 0..items.len() {
        let item_id = items[idx].id();
        let bundle = items[idx].bundle().to_string();

        if !items[idx].preceded_by.is_empty() && items[idx].triggered {
            return Err(Error::BundleError(format!(
                "triggered item '{}' in bundle '{}' must not use 'preceded_by' \
                 (use chained triggers instead)",
                item_id, bundle,
            )));
        }

        for selector in items[idx].preceded_by.clone() {
            let targets = resolve_selector(&selector, items).map_err(|err| match err {
                Error::NoSuchItem(_) => Error::BundleError(format!(
                    "unable to find definition of '{}' preceding '{}' in bundle '{}'",
                    selector, item_id, bundle,
                )),
                other => other,
            })?;
            for target in targets {
                if items[target].triggered {
                    let target_id = items[target].id();
                    items[target].precedes_items.push(item_id.clone());
                    items[idx].deps.push(target_id);
                } else {
                    return Err(Error::BundleError(format!(
                        "'{}' in bundle '{}' precedes '{}' in bundle '{}', \
                         but missing 'triggered' attribute",
                        items[target].id(),
                        items[target].bundle(),
                        item_id,
                        bundle,
                    )));
                }
            }
        }
    }
    Ok(())
}

// Causes all dependencies, direct and inherited, to be listed in each
// item's flattened_deps.
fn flatten_dependencies(items: &mut Vec<Item>) -> Result<(), Error> {
    let mut started = FixedBitSet::with_capacity(items.len());
    for idx in 0..items.len() {
        if !started.contains(idx) {
            flatten_deps_for_item(items, idx, &mut started)?;
        }
    }

    let ids: Vec<String> = items.iter().map(Item::id).collect();
    let incoming: Vec<BTreeSet<String>> = (0..items.len())
        .map(|idx| {
            items
                .iter()
                .enumerate()
                .filter(|(_, other)| other.flattened_deps.contains(&ids[idx]))
                .map(|(other_idx, _)| ids[other_idx].clone())
                .collect()
        })
        .collect();
    for (idx, incoming_deps) in incoming.into_iter().enumerate() {
        items[idx].incoming_deps = incoming_deps;
    }
    Ok(())
}

// Recursively collects all inherited dependencies of the given item. This
// can handle loops, but will ignore them: recursion into an item already in
// progress uses its partial closure.
fn flatten_deps_for_item(
    items: &mut Vec<Item>,
    idx: usize,
    started: &mut FixedBitSet,
) -> Result<(), Error> {
    started.insert(idx);
    items[idx].flattened_deps = items[idx].deps.iter().cloned().collect();

    for dep in items[idx].deps.clone() {
        let targets = match resolve_selector(&dep, items) {
            Ok(targets) => targets,
            Err(Error::NoSuchItem(_)) => {
                return Err(Error::ItemDependency(format!(
                    "'{}' in bundle '{}' has a dependency (needs) on '{}', \
                     which doesn't exist",
                    items[idx].id(),
                    items[idx].bundle(),
                    dep,
                )));
            }
            Err(err) => return Err(err),
        };
        if targets.is_empty() {
            // Selector resolved to nothing (e.g. a non-existing tag), so
            // the dependency can never be satisfied; drop it.
            items[idx].deps.retain(|existing| *existing != dep);
            continue;
        }
        for target in targets {
            if !started.contains(target) {
                flatten_deps_for_item(items, target, started)?;
            }
            let inherited: Vec<String> = items[target].flattened_deps.iter().cloned().collect();
            items[idx].flattened_deps.extend(inherited);
        }
    }
    Ok(())
}

// Looks for kinds whose items must not be applied in parallel and inserts
// daisy-chain dependencies to force a sequential apply.
fn inject_concurrency_blockers(
    items: &mut [Item],
    types: &dyn ItemTypes,
    os: &str,
    os_version: &Version,
) {
    for item in items.iter_mut() {
        item.concurrency_deps.clear();
    }

    // every kind that cannot be applied in parallel, with its blocked kinds
    let mut blockers: Vec<(String, Vec<String>)> = Vec::new();
    let mut seen_kinds: BTreeSet<&str> = BTreeSet::new();
    for item in items.iter() {
        if seen_kinds.insert(item.kind()) {
            let blocked = types.block_concurrent(item.kind(), os, os_version);
            if !blocked.is_empty() {
                blockers.push((item.kind().to_string(), blocked));
            }
        }
    }
    if blockers.is_empty() {
        return;
    }

    // Kinds whose blocked-kind lists overlap must be chained together,
    // since existing dependencies between their items have to be taken
    // into account when generating the chains. Merging is transitive, so
    // group kinds with a union-find.
    let mut kinds: IndexSet<&str> = IndexSet::new();
    for (kind, blocked) in &blockers {
        kinds.insert(kind.as_str());
        for blocked_kind in blocked {
            kinds.insert(blocked_kind.as_str());
        }
    }
    let mut union_find: UnionFind<usize> = UnionFind::new(kinds.len());
    for (kind, blocked) in &blockers {
        let kind_ix = kinds
            .get_index_of(kind.as_str())
            .expect("blocker kinds were registered above");
        for blocked_kind in blocked {
            let blocked_ix = kinds
                .get_index_of(blocked_kind.as_str())
                .expect("blocked kinds were registered above");
            union_find.union(kind_ix, blocked_ix);
        }
    }
    let mut chain_groups: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    for (ix, kind) in kinds.iter().enumerate() {
        chain_groups
            .entry(union_find.find(ix))
            .or_default()
            .insert(kind.to_string());
    }

    for blocked_kinds in chain_groups.values() {
        daisy_chain(items, blocked_kinds);
    }
}

// Chains all items of the given kinds while respecting existing
// dependencies between them.
fn daisy_chain(items: &mut [Item], blocked_kinds: &BTreeSet<String>) {
    let type_items: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| blocked_kinds.contains(item.kind()))
        .map(|(idx, _)| idx)
        .collect();

    // disregard deps on items of kinds outside this group
    let mut in_group_deps: Vec<BTreeSet<String>> = type_items
        .iter()
        .map(|&idx| {
            items[idx]
                .flattened_deps
                .iter()
                .filter(|dep| {
                    dep.split(':')
                        .next()
                        .map_or(false, |kind| blocked_kinds.contains(kind))
                })
                .cloned()
                .collect()
        })
        .collect();

    let mut processed = FixedBitSet::with_capacity(type_items.len());
    let mut previous: Option<usize> = None;
    loop {
        // The first unprocessed item without in-group deps. Running out of
        // candidates before all items are processed means the remaining
        // items already depend on another item of the group.
        let position = match (0..type_items.len())
            .find(|&pos| !processed.contains(pos) && in_group_deps[pos].is_empty())
        {
            Some(position) => position,
            None => break,
        };
        let item_idx = type_items[position];

        if let Some(previous_idx) = previous {
            let previous_id = items[previous_idx].id();
            if !items[item_idx].deps.contains(&previous_id) {
                items[item_idx].deps.push(previous_id.clone());
                items[item_idx].concurrency_deps.push(previous_id.clone());
                items[item_idx].flattened_deps.insert(previous_id);
            }
        }
        previous = Some(item_idx);
        processed.insert(position);

        // Remove all in-group deps on the processed item. This frees up
        // items depending only on it for the next round.
        let item_id = items[item_idx].id();
        for deps in in_group_deps.iter_mut() {
            deps.remove(&item_id);
        }
    }
}

// Reports direct deps that are already reachable through another direct
// dep.
fn check_redundant_dependencies(items: &[Item]) {
    let mut graph: Graph<(), ()> = Graph::with_capacity(items.len(), items.len());
    let nodes: Vec<NodeIndex> = items.iter().map(|_| graph.add_node(())).collect();

    // expand each item's direct deps once
    let mut direct: Vec<Vec<(String, Vec<usize>)>> = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let mut expanded = Vec::new();
        for dep in &item.deps {
            if let Ok(targets) = resolve_selector(dep, items) {
                for &target in &targets {
                    graph.add_edge(nodes[idx], nodes[target], ());
                }
                expanded.push((dep.clone(), targets));
            }
        }
        direct.push(expanded);
    }

    let mut space = DfsSpace::new(&graph);
    for (idx, expanded) in direct.iter().enumerate() {
        for (dep, targets) in expanded {
            let covered_elsewhere = expanded
                .iter()
                .filter(|(other_dep, _)| other_dep != dep)
                .any(|(_, other_targets)| {
                    other_targets.iter().any(|&other_target| {
                        targets.iter().any(|&target| {
                            has_path_connecting(
                                &graph,
                                nodes[other_target],
                                nodes[target],
                                Some(&mut space),
                            )
                        })
                    })
                });
            if covered_elsewhere {
                log::warn!(
                    "'{}' in bundle '{}': dependency on '{}' is already covered \
                     by another dependency",
                    items[idx].id(),
                    items[idx].bundle(),
                    dep,
                );
            }
        }
    }
}

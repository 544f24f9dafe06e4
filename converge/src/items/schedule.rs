// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for consuming a prepared item list during apply.
//!
//! The apply scheduler itself lives outside this crate; these functions
//! implement the parts of its bookkeeping that depend on the dependency
//! model: extracting ready items and cascading skips through dependents.

use crate::items::{find_item, Item};

/// Splits a list of items into those that still have dependencies and those
/// that don't.
pub fn split_items_without_deps(items: Vec<Item>) -> (Vec<Item>, Vec<Item>) {
    let mut remaining_items = Vec::new();
    let mut removed_items = Vec::new();
    for item in items {
        if item.deps.is_empty() {
            removed_items.push(item);
        } else {
            remaining_items.push(item);
        }
    }
    (remaining_items, removed_items)
}

/// Removes the given item id from the dependency lists of all items.
pub fn remove_dep_from_items(items: &mut [Item], dep: &str) {
    for item in items.iter_mut() {
        item.deps.retain(|existing| existing != dep);
    }
}

/// Returns true if the given item directly or indirectly (through other
/// items) triggers the item with the given target id.
pub fn has_trigger_path(items: &[Item], item: &Item, target_item_id: &str) -> bool {
    if item.triggers.iter().any(|id| id == target_item_id) {
        return true;
    }
    for triggered_id in &item.triggers {
        // the triggered item may already have been removed from the list
        if let Ok(triggered_idx) = find_item(triggered_id, items) {
            if has_trigger_path(items, &items[triggered_idx], target_item_id) {
                return true;
            }
        }
    }
    false
}

/// Removes the items depending on the given (skipped) item from the list.
///
/// Items whose dependency is only there to sequence a trigger or to
/// serialise concurrency-blocked kinds keep running and merely lose the
/// edge. Removal cascades through removed items with `cascade_skip`.
/// Returns the remaining items and everything that was removed.
pub fn remove_item_dependents(mut items: Vec<Item>, dep_item: &Item) -> (Vec<Item>, Vec<Item>) {
    let dep_item_id = dep_item.id();
    let mut removed_indexes = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        if !item.deps.iter().any(|dep| *dep == dep_item_id) {
            continue;
        }
        if has_trigger_path(&items, dep_item, &item.id()) {
            // triggered items cannot be removed here since they may yet be
            // triggered by another item and will be skipped anyway if they
            // aren't
            continue;
        }
        if item.concurrency_deps.iter().any(|dep| *dep == dep_item_id) {
            // don't skip items just because of concurrency deps
            continue;
        }
        removed_indexes.push(idx);
    }

    let mut removed_items = Vec::new();
    for idx in removed_indexes.into_iter().rev() {
        removed_items.push(items.remove(idx));
    }
    removed_items.reverse();

    // items that keep running lose the dangling edge
    remove_dep_from_items(&mut items, &dep_item_id);

    if !removed_items.is_empty() {
        log::debug!(
            "skipped these items because they depend on {}, which was \
             skipped previously: {}",
            dep_item_id,
            removed_items
                .iter()
                .map(Item::id)
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    let mut all_removed = Vec::new();
    for removed_item in &removed_items {
        if removed_item.cascade_skip {
            let (remaining, recursively_removed) = remove_item_dependents(items, removed_item);
            items = remaining;
            all_removed.extend(recursively_removed);
        } else {
            remove_dep_from_items(&mut items, &removed_item.id());
        }
    }

    removed_items.extend(all_removed);
    (items, removed_items)
}

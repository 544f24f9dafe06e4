// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::Error;
use crate::items::Item;

/// Resolves an item selector against a list of items, returning the indexes
/// of all matching items.
///
/// Selector grammar:
/// * `bundle:NAME` — all items of the bundle
/// * `tag:NAME` — all items carrying the tag
/// * `KIND:` — all items of the kind
/// * `KIND:NAME` — exactly the item with that id ([`Error::NoSuchItem`] if
///   absent)
///
/// A selector without a `:` is an [`Error::InvalidSelector`].
pub fn resolve_selector(selector: &str, items: &[Item]) -> Result<Vec<usize>, Error> {
    let (selector_type, selector_name) = selector
        .split_once(':')
        .ok_or_else(|| Error::InvalidSelector(selector.to_string()))?;

    Ok(match selector_type {
        "bundle" => items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.bundle() == selector_name)
            .map(|(idx, _)| idx)
            .collect(),
        "tag" => items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.tags().contains(selector_name))
            .map(|(idx, _)| idx)
            .collect(),
        kind if selector_name.is_empty() => items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.kind() == kind)
            .map(|(idx, _)| idx)
            .collect(),
        _ => vec![find_item(selector, items)?],
    })
}

/// Returns the index of the first item with the given id.
pub fn find_item(item_id: &str, items: &[Item]) -> Result<usize, Error> {
    items
        .iter()
        .position(|item| item.id() == item_id)
        .ok_or_else(|| Error::NoSuchItem(item_id.to_string()))
}

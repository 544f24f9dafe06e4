// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::fixtures::item;
use crate::errors::Error;
use crate::items::resolve::prepare_dependencies;
use crate::items::schedule::{
    has_trigger_path, remove_item_dependents, split_items_without_deps,
};
use crate::items::{
    find_item, resolve_selector, Bundle, CannedAction, DefaultItemTypes, Item, ItemTypes,
};
use indexmap::IndexMap;
use semver::Version;

fn os_version() -> Version {
    Version::new(20, 4, 0)
}

fn prepare(items: Vec<Item>, types: &dyn ItemTypes) -> Result<Vec<Item>, Error> {
    prepare_dependencies(items, types, "linux", &os_version())
}

fn by_id<'a>(items: &'a [Item], id: &str) -> &'a Item {
    &items[find_item(id, items).expect("item should exist")]
}

struct TestTypes;

impl ItemTypes for TestTypes {
    fn canned_actions(&self, item: &Item) -> IndexMap<String, CannedAction> {
        let mut actions = IndexMap::new();
        if item.kind() == "svc" {
            actions.insert("reload".to_string(), CannedAction::default());
        }
        actions
    }

    fn block_concurrent(&self, kind: &str, _os: &str, _os_version: &Version) -> Vec<String> {
        match kind {
            "k1" => vec!["k1".to_string(), "k2".to_string()],
            _ => Vec::new(),
        }
    }
}

// ---
// Selectors
// ---

#[test]
fn selector_resolution() {
    let items = vec![
        item("file", "/etc/a", "base").with_tags(["web"]),
        item("file", "/etc/b", "base"),
        item("pkg", "nginx", "web").with_tags(["web"]),
    ];

    let bundle: Vec<_> = resolve_selector("bundle:base", &items).unwrap();
    assert_eq!(bundle, vec![0, 1]);

    let tagged: Vec<_> = resolve_selector("tag:web", &items).unwrap();
    assert_eq!(tagged, vec![0, 2]);

    let kind: Vec<_> = resolve_selector("file:", &items).unwrap();
    assert_eq!(kind, vec![0, 1]);

    let single: Vec<_> = resolve_selector("pkg:nginx", &items).unwrap();
    assert_eq!(single, vec![2]);
}

#[test]
fn selector_errors() {
    let items = vec![item("file", "/etc/a", "base")];
    assert!(matches!(
        resolve_selector("no-colon", &items),
        Err(Error::InvalidSelector(_)),
    ));
    assert!(matches!(
        resolve_selector("pkg:missing", &items),
        Err(Error::NoSuchItem(_)),
    ));
    assert!(matches!(
        find_item("pkg:missing", &items),
        Err(Error::NoSuchItem(_)),
    ));
}

// ---
// Preconditions
// ---

#[test]
fn self_dependency_is_fatal() {
    let items = vec![item("file", "/etc/a", "base").with_needs(["file:/etc/a"])];
    match prepare(items, &DefaultItemTypes) {
        Err(Error::ItemDependency(msg)) => assert!(msg.contains("file:/etc/a")),
        other => panic!("expected self-dep error, got {:?}", other),
    }
}

#[test]
fn cross_bundle_collision_is_fatal() {
    let items = vec![
        item("file", "/etc/a", "base"),
        item("file", "/etc/a", "other"),
    ];
    match prepare(items, &DefaultItemTypes) {
        Err(Error::BundleError(msg)) => {
            assert!(msg.contains("base") && msg.contains("other"));
        }
        other => panic!("expected collision error, got {:?}", other),
    }
}

// ---
// Injection passes
// ---

#[test]
fn canned_actions_are_materialised() {
    let items = vec![item("svc", "mysql", "db")];
    let prepared = prepare(items, &TestTypes).unwrap();

    assert_eq!(prepared.len(), 2);
    let action = by_id(&prepared, "action:svc:mysql:reload");
    assert!(action.triggered());
    assert_eq!(action.bundle(), "db");
}

#[test]
fn triggers_become_dependencies() {
    // literal scenario: a triggered pkg and a file that fires it
    let items = vec![
        item("pkg", "p", "base").with_triggered(true),
        item("file", "/c", "base").with_triggers(["pkg:p"]),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    let pkg = by_id(&prepared, "pkg:p");
    assert!(pkg.deps().contains(&"file:/c".to_string()));
}

#[test]
fn triggering_a_non_triggered_item_is_fatal() {
    let items = vec![
        item("pkg", "p", "base"),
        item("file", "/c", "base").with_triggers(["pkg:p"]),
    ];
    match prepare(items, &DefaultItemTypes) {
        Err(Error::BundleError(msg)) => assert!(msg.contains("triggered")),
        other => panic!("expected trigger error, got {:?}", other),
    }
}

#[test]
fn triggered_by_is_translated() {
    let items = vec![
        item("pkg", "p", "base").with_triggered(true).with_triggered_by(["file:/c"]),
        item("file", "/c", "base"),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    let file = by_id(&prepared, "file:/c");
    assert!(file.triggers.contains(&"pkg:p".to_string()));
    let pkg = by_id(&prepared, "pkg:p");
    assert!(pkg.deps().contains(&"file:/c".to_string()));
}

#[test]
fn needed_by_injects_reverse_dependency() {
    let items = vec![
        item("pkg", "nginx", "web").with_needed_by(["bundle:site"]),
        item("file", "/etc/site", "site"),
        item("file", "/etc/other", "elsewhere"),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    let site_file = by_id(&prepared, "file:/etc/site");
    assert!(site_file.deps().contains(&"pkg:nginx".to_string()));
    assert_eq!(site_file.reverse_deps(), ["pkg:nginx".to_string()]);
    let other = by_id(&prepared, "file:/etc/other");
    assert!(other.deps().is_empty());
}

#[test]
fn needed_by_on_missing_item_is_fatal() {
    let items = vec![item("pkg", "nginx", "web").with_needed_by(["file:/nope"])];
    match prepare(items, &DefaultItemTypes) {
        Err(Error::ItemDependency(msg)) => assert!(msg.contains("needed_by")),
        other => panic!("expected needed_by error, got {:?}", other),
    }
}

#[test]
fn precedes_chain() {
    // cleanup precedes the service restart: the triggered cleanup runs
    // first if it has anything to do
    let items = vec![
        item("action", "cleanup", "base").with_triggered(true).with_precedes(["svc:app"]),
        item("svc", "app", "base"),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    let svc = by_id(&prepared, "svc:app");
    assert!(svc.deps().contains(&"action:cleanup".to_string()));
    let cleanup = by_id(&prepared, "action:cleanup");
    assert_eq!(cleanup.precedes_items(), ["svc:app".to_string()]);
}

#[test]
fn preceded_by_on_triggered_item_is_fatal() {
    let items = vec![
        item("svc", "app", "base").with_triggered(true).with_preceded_by(["action:x"]),
        item("action", "x", "base").with_triggered(true),
    ];
    match prepare(items, &DefaultItemTypes) {
        Err(Error::BundleError(msg)) => assert!(msg.contains("preceded_by")),
        other => panic!("expected preceded_by error, got {:?}", other),
    }
}

// ---
// Flattening
// ---

#[test]
fn unmatched_multi_selector_is_dropped() {
    let items = vec![item("file", "/etc/a", "base").with_needs(["tag:nonexistent"])];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    assert!(prepared[0].deps().is_empty());
}

#[test]
fn missing_id_dependency_is_fatal() {
    let items = vec![item("file", "/etc/a", "base").with_needs(["pkg:gone"])];
    match prepare(items, &DefaultItemTypes) {
        Err(Error::ItemDependency(msg)) => assert!(msg.contains("pkg:gone")),
        other => panic!("expected dependency error, got {:?}", other),
    }
}

#[test]
fn dependencies_flatten_transitively() {
    let items = vec![
        item("t", "a", "base").with_needs(["t:b"]),
        item("t", "b", "base").with_needs(["t:c"]),
        item("t", "c", "base"),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    let a = by_id(&prepared, "t:a");
    assert!(a.flattened_deps().contains("t:b"));
    assert!(a.flattened_deps().contains("t:c"));
    let c = by_id(&prepared, "t:c");
    assert!(c.incoming_deps().contains("t:a"));
    assert!(c.incoming_deps().contains("t:b"));
}

#[test]
fn dependency_loops_are_tolerated() {
    let items = vec![
        item("t", "a", "base").with_needs(["t:b"]),
        item("t", "b", "base").with_needs(["t:c"]),
        item("t", "c", "base").with_needs(["t:a"]),
        item("t", "d", "base").with_needs(["t:a"]),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    // the item outside the cycle sees the full closure
    let d = by_id(&prepared, "t:d");
    for dep in ["t:a", "t:b", "t:c"] {
        assert!(d.flattened_deps().contains(dep), "missing {}", dep);
    }
    let a = by_id(&prepared, "t:a");
    assert!(a.incoming_deps().contains("t:d"));
}

#[test]
fn selector_dependencies_expand_through_members() {
    let items = vec![
        item("app", "frontend", "web").with_needs(["bundle:db"]),
        item("pkg", "postgres", "db").with_needs(["file:/etc/pg"]),
        item("file", "/etc/pg", "db"),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();

    let frontend = by_id(&prepared, "app:frontend");
    assert!(frontend.flattened_deps().contains("bundle:db"));
    // inherited through the bundle members
    assert!(frontend.flattened_deps().contains("file:/etc/pg"));
}

// ---
// Concurrency blockers
// ---

#[test]
fn blocking_kinds_are_daisy_chained() {
    // literal scenario: three items of kinds k1, k2, k1
    let items = vec![
        item("k1", "one", "base"),
        item("k2", "two", "base"),
        item("k1", "three", "base"),
    ];
    let prepared = prepare(items, &TestTypes).unwrap();

    let chained: Vec<_> = prepared
        .iter()
        .filter(|item| !item.concurrency_deps().is_empty())
        .collect();
    assert_eq!(chained.len(), 2, "two items are chained after the first");
    for item in &chained {
        assert_eq!(item.concurrency_deps().len(), 1);
        assert!(item.deps().contains(&item.concurrency_deps()[0]));
        assert!(item.flattened_deps().contains(&item.concurrency_deps()[0]));
    }
    // the chain is a total order: all predecessor ids are distinct
    let mut predecessors: Vec<_> = chained
        .iter()
        .map(|item| item.concurrency_deps()[0].clone())
        .collect();
    predecessors.sort();
    predecessors.dedup();
    assert_eq!(predecessors.len(), 2);
}

#[test]
fn chain_respects_existing_dependencies() {
    let items = vec![
        item("k2", "b", "base").with_needs(["k1:a"]),
        item("k1", "a", "base"),
    ];
    let prepared = prepare(items, &TestTypes).unwrap();

    // k1:a must come first; the existing dep already serialises the pair,
    // so no synthetic edge is added
    let b = by_id(&prepared, "k2:b");
    assert_eq!(b.deps(), ["k1:a".to_string()]);
    assert!(b.concurrency_deps().is_empty());
    let a = by_id(&prepared, "k1:a");
    assert!(a.concurrency_deps().is_empty());
}

#[test]
fn unrelated_kinds_are_not_chained() {
    let items = vec![
        item("k1", "one", "base"),
        item("other", "x", "base"),
        item("other", "y", "base"),
    ];
    let prepared = prepare(items, &TestTypes).unwrap();

    for id in ["other:x", "other:y"] {
        assert!(by_id(&prepared, id).concurrency_deps().is_empty());
    }
}

// ---
// Schedule helpers
// ---

#[test]
fn split_extracts_ready_items() {
    let items = vec![
        item("t", "a", "base"),
        item("t", "b", "base").with_needs(["t:a"]),
    ];
    let prepared = prepare(items, &DefaultItemTypes).unwrap();
    let (with_deps, without_deps) = split_items_without_deps(prepared);

    assert_eq!(without_deps.len(), 1);
    assert_eq!(without_deps[0].id(), "t:a");
    assert_eq!(with_deps.len(), 1);
    assert_eq!(with_deps[0].id(), "t:b");
}

#[test]
fn skipping_cascades_through_dependents() {
    let items = vec![
        item("t", "a", "base"),
        item("t", "b", "base").with_needs(["t:a"]),
        item("t", "c", "base").with_needs(["t:b"]),
    ];
    let mut prepared = prepare(items, &DefaultItemTypes).unwrap();
    let skipped = prepared.remove(find_item("t:a", &prepared).unwrap());

    let (remaining, removed) = remove_item_dependents(prepared, &skipped);
    assert!(remaining.is_empty());
    let mut removed_ids: Vec<_> = removed.iter().map(Item::id).collect();
    removed_ids.sort();
    assert_eq!(removed_ids, vec!["t:b".to_string(), "t:c".to_string()]);
}

#[test]
fn cascade_stops_at_non_cascading_items() {
    let items = vec![
        item("t", "a", "base"),
        item("t", "b", "base").with_needs(["t:a"]).with_cascade_skip(false),
        item("t", "c", "base").with_needs(["t:b"]),
    ];
    let mut prepared = prepare(items, &DefaultItemTypes).unwrap();
    let skipped = prepared.remove(find_item("t:a", &prepared).unwrap());

    let (remaining, removed) = remove_item_dependents(prepared, &skipped);
    // b is removed, but c survives with the dangling dep dropped
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id(), "t:b");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), "t:c");
    assert!(remaining[0].deps().is_empty());
}

#[test]
fn triggered_dependents_survive_a_skip() {
    let items = vec![
        item("file", "/c", "base").with_triggers(["pkg:p"]),
        item("pkg", "p", "base").with_triggered(true),
    ];
    let mut prepared = prepare(items, &DefaultItemTypes).unwrap();
    let skipped = prepared.remove(find_item("file:/c", &prepared).unwrap());

    assert!(has_trigger_path(&prepared, &skipped, "pkg:p"));
    let (remaining, removed) = remove_item_dependents(prepared, &skipped);
    // pkg:p may yet be triggered by another item; it only loses the edge
    assert!(removed.is_empty());
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].deps().is_empty());
}

// ---
// Bundles
// ---

#[test]
fn bundles_stamp_their_items() {
    let mut bundle = Bundle::new("web");
    bundle.add_item(item("pkg", "nginx", ""));
    let items = bundle.into_items();
    assert_eq!(items[0].bundle(), "web");
}

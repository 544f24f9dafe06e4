// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::fixtures::meta;
use crate::errors::Error;
use crate::metastack::Metastack;
use crate::paths::MetaPath;
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn lower_tier_wins() {
    let mut stack = Metastack::new();
    stack.set_layer(2, "defaults", meta(json!({"port": 22, "banner": "hi"})));
    stack.set_layer(0, "node:n", meta(json!({"port": 2222})));

    assert_eq!(stack.get(&MetaPath::from("port")).unwrap(), json!(2222));
    assert_eq!(stack.get(&MetaPath::from("banner")).unwrap(), json!("hi"));
}

#[test]
fn later_layer_wins_within_tier() {
    let mut stack = Metastack::new();
    stack.set_layer(0, "group:g", meta(json!({"v": "group"})));
    stack.set_layer(0, "node:n", meta(json!({"v": "node"})));

    assert_eq!(stack.get(&MetaPath::from("v")).unwrap(), json!("node"));
}

#[test]
fn mappings_merge_recursively() {
    let mut stack = Metastack::new();
    stack.set_layer(2, "defaults", meta(json!({"ssh": {"port": 22, "proto": 2}})));
    stack.set_layer(0, "node:n", meta(json!({"ssh": {"port": 2222}})));

    assert_eq!(
        stack.get(&MetaPath::from("ssh")).unwrap(),
        json!({"port": 2222, "proto": 2}),
    );
}

#[test]
fn higher_scalar_occludes_lower_mapping() {
    let mut stack = Metastack::new();
    stack.set_layer(0, "node:n", meta(json!({"x": 1})));
    stack.set_layer(2, "defaults", meta(json!({"x": {"y": true}})));

    assert_eq!(stack.get(&MetaPath::from("x")).unwrap(), json!(1));
}

#[test]
fn higher_mapping_occludes_lower_scalar() {
    let mut stack = Metastack::new();
    stack.set_layer(0, "node:n", meta(json!({"x": {"y": true}})));
    stack.set_layer(2, "defaults", meta(json!({"x": 1})));

    assert_eq!(stack.get(&MetaPath::from("x")).unwrap(), json!({"y": true}));
}

#[test]
fn lists_are_not_merged() {
    let mut stack = Metastack::new();
    stack.set_layer(0, "node:n", meta(json!({"users": ["alice"]})));
    stack.set_layer(2, "defaults", meta(json!({"users": ["bob", "carol"]})));

    assert_eq!(
        stack.get(&MetaPath::from("users")).unwrap(),
        json!(["alice"]),
    );
}

#[test]
fn missing_path_is_an_error() {
    let mut stack = Metastack::new();
    stack.set_layer(0, "node:n", meta(json!({"a": 1})));

    match stack.get(&MetaPath::from("b/c")) {
        Err(Error::MissingKey(path)) => assert_eq!(path, MetaPath::from("b/c")),
        other => panic!("expected MissingKey, got {:?}", other),
    }
}

#[test]
fn empty_stack_has_no_root() {
    let stack = Metastack::new();
    assert!(matches!(
        stack.get(&MetaPath::root()),
        Err(Error::MissingKey(_)),
    ));
}

#[test]
fn pop_layer_returns_previous_mapping() {
    let mut stack = Metastack::new();
    stack.set_layer(1, "reactor", meta(json!({"a": 1})));

    assert_eq!(stack.pop_layer(1, "reactor"), meta(json!({"a": 1})));
    // popping again yields an empty mapping
    assert_eq!(stack.pop_layer(1, "reactor"), meta(json!({})));
    assert!(matches!(
        stack.get(&MetaPath::from("a")),
        Err(Error::MissingKey(_)),
    ));
}

#[test]
fn as_dict_consolidates_all_layers() {
    let mut stack = Metastack::new();
    stack.set_layer(2, "defaults", meta(json!({"a": 1, "nested": {"x": 1}})));
    stack.set_layer(1, "reactor", meta(json!({"b": 2, "nested": {"y": 2}})));
    stack.set_layer(0, "node:n", meta(json!({"a": 3})));

    assert_eq!(
        stack.as_dict(),
        meta(json!({"a": 3, "b": 2, "nested": {"x": 1, "y": 2}})),
    );
}

#[test]
fn blame_lists_contributing_layers_in_priority_order() {
    let mut stack = Metastack::new();
    stack.set_layer(2, "defaults", meta(json!({"a": 1, "b": 2})));
    stack.set_layer(0, "node:n", meta(json!({"a": 3})));

    let blame = stack.as_blame();
    assert_eq!(
        blame[&MetaPath::from("a")],
        vec!["node:n".to_string(), "defaults".to_string()],
    );
    assert_eq!(blame[&MetaPath::from("b")], vec!["defaults".to_string()]);
}

#[test]
fn cached_partition_ignores_later_mutations() {
    let mut stack = Metastack::new();
    stack.set_layer(0, "node:n", meta(json!({"a": 1})));
    stack.cache_partition(0);

    stack.set_layer(0, "late", meta(json!({"b": 2})));
    assert_eq!(stack.get(&MetaPath::from("a")).unwrap(), json!(1));
    assert!(matches!(
        stack.get(&MetaPath::from("b")),
        Err(Error::MissingKey(_)),
    ));
}

#[test]
fn scalar_prefix_does_not_hide_deeper_layers() {
    // One layer ends in a scalar halfway down the path; deeper paths are
    // still served by other layers.
    let mut stack = Metastack::new();
    stack.set_layer(0, "node:n", meta(json!({"x": 1})));
    stack.set_layer(2, "defaults", meta(json!({"x": {"y": "deep"}})));

    assert_eq!(stack.get(&MetaPath::from("x")).unwrap(), json!(1));
    assert_eq!(stack.get(&MetaPath::from("x/y")).unwrap(), json!("deep"));
}

// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::items::Item;
use crate::metastack::MetaMap;
use serde_json::Value;

/// Unwraps a `json!` object literal into a metadata mapping.
pub(crate) fn meta(value: Value) -> MetaMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {:?}", other),
    }
}

pub(crate) fn item(kind: &str, name: &str, bundle: &str) -> Item {
    Item::new(kind, name, bundle).expect("valid test item")
}

// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layered metadata convergence and config item dependency resolution.
//!
//! `converge` is the core of a configuration management system. For each
//! managed node it computes two derived artifacts:
//!
//! 1. A consolidated metadata mapping, obtained by layering static inputs
//!    (node attributes, group attributes, bundle defaults) with the outputs
//!    of user-written *metadata reactors* and iterating to a fixed point
//!    ([`MetadataEngine`]).
//! 2. A totally ordered execution plan of configuration items, obtained by
//!    expanding declared relationships into a transitively closed dependency
//!    graph ([`items::resolve::prepare_dependencies`]).
//!
//! Loading repositories from disk, item type implementations and remote
//! execution live outside this crate.
//!
//! # Examples
//!
//! Derive metadata with a reactor:
//!
//! ```
//! use converge::{MetadataEngine, Node, Reaction, Reactor};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), converge::Error> {
//! let mut node = Node::new("web1").with_metadata(
//!     json!({ "hostname": "web1.example.com" })
//!         .as_object()
//!         .unwrap()
//!         .clone(),
//! );
//! node.add_reactor(Reactor::new("dns", |view| {
//!     // Reading a key that another reactor hasn't provided yet simply
//!     // postpones this reactor; `?` propagates the missing key.
//!     let hostname = view.get(["hostname"])?;
//!     Ok(Reaction::Set(
//!         json!({ "dns": { "a_record": hostname } })
//!             .as_object()
//!             .unwrap()
//!             .clone(),
//!     ))
//! }))?;
//!
//! let engine = MetadataEngine::new([node], Vec::new());
//! let metadata = engine.metadata("web1")?;
//! assert_eq!(metadata["dns"]["a_record"], json!("web1.example.com"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod engine;
pub mod errors;
pub mod items;
mod metastack;
mod node;
mod paths;
pub mod quit;
#[cfg(test)]
mod unit_tests;

pub use engine::{MetadataEngine, NodeMetaView};
pub use errors::Error;
pub use metastack::{MetaMap, Metastack, TIERS};
pub use node::{Group, Node, Reaction, Reactor, ReactorFn};
pub use paths::{MetaPath, PathSet};

// Public re-exports for upstream crates used in APIs. The no_inline ensures
// that they show up as re-exports in documentation.
#[doc(no_inline)]
pub use semver::Version;
#[doc(no_inline)]
pub use serde_json::Value as JsonValue;

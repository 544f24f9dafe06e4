// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contains types that describe errors that `converge` methods can return.

use crate::paths::MetaPath;
use std::error;
use std::fmt;
use std::io;

use Error::*;

/// Error type describing the sorts of errors `converge` can return.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A node name was unknown to the engine.
    NoSuchNode(String),
    /// A group name was unknown to the engine.
    NoSuchGroup(String),
    /// A bundle name was unknown.
    NoSuchBundle(String),
    /// An item id named by a selector does not exist.
    NoSuchItem(String),
    /// An item selector without a `:` separator.
    InvalidSelector(String),
    /// An authoring error within a bundle (bad trigger wiring, duplicate
    /// reactor names, id collisions and the like).
    BundleError(String),
    /// A dependency declaration that cannot be satisfied.
    ItemDependency(String),
    /// No metadata layer provides the given path. Inside a reactor this is a
    /// transient signal, tolerated until convergence.
    MissingKey(MetaPath),
    /// Reactors still raised missing-key errors after all other reactors
    /// were done.
    PersistentKeyError(String),
    /// A node exceeded the reactor iteration cap, most likely because of
    /// flip-flopping reactors.
    MaxIterationsExceeded {
        /// The node whose iteration count ran over.
        node: String,
        /// The configured cap.
        limit: usize,
        /// The most-changed reactors, for diagnosis.
        details: String,
    },
    /// A reactor returned paths outside its declared `provides` set.
    UndeclaredReactorPaths {
        /// The node the reactor ran on.
        node: String,
        /// The offending reactor.
        reactor: String,
        /// The undeclared paths.
        paths: Vec<MetaPath>,
    },
    /// The subgroup hierarchy contains a loop.
    GroupCycle(Vec<String>),
    /// `blame` or `stack` was accessed from within a reactor.
    AccessInsideReactor,
    /// An error occurred while writing the metadata disk cache.
    CacheIo(io::Error),
    /// An internal error occurred. This is a bug.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoSuchNode(name) => write!(f, "node not found: {}", name),
            NoSuchGroup(name) => write!(f, "group not found: {}", name),
            NoSuchBundle(name) => write!(f, "bundle not found: {}", name),
            NoSuchItem(id) => write!(f, "item not found: {}", id),
            InvalidSelector(selector) => write!(f, "invalid item selector: {}", selector),
            BundleError(msg) => write!(f, "{}", msg),
            ItemDependency(msg) => write!(f, "{}", msg),
            MissingKey(path) => write!(f, "metadata key not found: {}", path),
            PersistentKeyError(msg) => write!(f, "{}", msg),
            MaxIterationsExceeded {
                node,
                limit,
                details,
            } => write!(
                f,
                "iteration cap ({}) exceeded for {}, likely an infinite loop between \
                 flip-flopping metadata reactors.\nThese are the reactors that changed \
                 most often:\n\n{}",
                limit, node, details,
            ),
            UndeclaredReactorPaths {
                node,
                reactor,
                paths,
            } => write!(
                f,
                "{} on {} returned the following key paths, but didn't declare them \
                 as provided:\n{}",
                reactor,
                node,
                paths
                    .iter()
                    .map(|path| path.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            GroupCycle(groups) => {
                write!(f, "loop in subgroup hierarchy: {}", groups.join(" -> "))
            }
            AccessInsideReactor => {
                write!(f, "cannot access blame or stack from a reactor")
            }
            CacheIo(err) => write!(f, "error while writing metadata cache: {}", err),
            Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CacheIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        CacheIo(err)
    }
}

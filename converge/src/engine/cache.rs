// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flat on-disk cache of consolidated node metadata.
//!
//! Layout: `<cache_dir>/<content_hash>/<node_name>`, one JSON document per
//! node. The mapping type is backed by a sorted map, so the encoding is
//! deterministic and a round trip reproduces the consolidated metadata
//! bit-exactly.

use crate::errors::Error;
use crate::metastack::MetaMap;
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

fn node_file(cache_dir: &Path, content_hash: &str, node_name: &str) -> PathBuf {
    cache_dir.join(content_hash).join(node_name)
}

/// Reads a node's flat metadata blob. Any IO or parse problem is a cache
/// miss.
pub(crate) fn read_blob(cache_dir: &Path, content_hash: &str, node_name: &str) -> Option<MetaMap> {
    let file = fs::File::open(node_file(cache_dir, content_hash, node_name)).ok()?;
    serde_json::from_reader(BufReader::new(file)).ok()
}

/// Writes a node's flat metadata blob unless one is already present.
pub(crate) fn write_blob(
    cache_dir: &Path,
    content_hash: &str,
    node_name: &str,
    metadata: &MetaMap,
) -> Result<(), Error> {
    let path = node_file(cache_dir, content_hash, node_name);
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        make_cache_dir(dir)?;
    }
    let encoded = serde_json::to_string(metadata)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(&path, encoded)?;
    Ok(())
}

/// Removes the per-hash cache directory, if it exists.
pub(crate) fn clear(cache_dir: &Path, content_hash: &str) -> Result<(), Error> {
    let dir = cache_dir.join(content_hash);
    match fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(unix)]
fn make_cache_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o770).create(dir)
}

#[cfg(not(unix))]
fn make_cache_dir(dir: &Path) -> io::Result<()> {
    fs::DirBuilder::new().recursive(true).create(dir)
}

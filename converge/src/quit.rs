// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cooperative cancellation for long-running metadata builds.
//!
//! The engine polls this flag at stage boundaries and returns early when it
//! is set, without marking any node's metadata as complete.

use std::sync::atomic::{AtomicBool, Ordering};

static QUIT: AtomicBool = AtomicBool::new(false);

/// Asks running engines to stop at the next stage boundary.
pub fn request() {
    QUIT.store(true, Ordering::SeqCst);
}

/// Returns true if a quit has been requested.
pub fn is_requested() -> bool {
    QUIT.load(Ordering::SeqCst)
}

/// Clears a previously requested quit.
pub fn clear() {
    QUIT.store(false, Ordering::SeqCst);
}

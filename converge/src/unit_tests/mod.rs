// Copyright (c) The converge Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod fixtures;
mod metastack_tests;
mod resolve_tests;

// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC

// Public operations on a translation context report failures with this
// error type. Validation failures on static regions are treated as
// programming bugs instead and panic, since a firmware image cannot run
// without its memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XlatError {
    // Bad alignment, zero size or a forbidden attribute combination
    InvalidArgument,
    // Address arithmetic wrapped or a configured address-space limit was
    // exceeded
    OutOfRange,
    // The region list is full or the sub-table pool is exhausted
    OutOfMemory,
    // Illegal overlap with an existing region, or an attempt to remove a
    // region that is not dynamic
    PermissionDenied,
}

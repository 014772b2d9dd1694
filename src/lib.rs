// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

//! Translation table management for the ARMv8 MMU.
//!
//! The crate builds multi-level long-descriptor translation tables from a
//! list of memory regions with access attributes, using statically
//! allocated table storage owned by a [`XlatCtx`] translation context.
//! With the `dynamic-regions` feature regions can also be added and
//! removed after the tables went live, with the necessary TLB
//! maintenance driven through the [`XlatArch`] hooks. Programming the
//! MMU control registers themselves is left to the caller, which gets
//! the base table address and address space bounds from the context.

#![no_std]

pub mod address;
pub mod arch;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod locking;
pub mod region;
pub mod types;
pub mod utils;

pub use address::{Address, PhysAddr, VirtAddr};
pub use arch::{ExceptionLevel, XlatArch};
pub use context::XlatCtx;
pub use descriptor::{Descriptor, DescriptorType};
pub use error::XlatError;
pub use region::{MemAttrFlags, MemAttributes, MemType, XlatRegion};

#[cfg(target_arch = "aarch64")]
pub use arch::AArch64;
#[cfg(target_arch = "aarch64")]
pub use context::{
    add_region, add_regions, base_table_address, change_mem_attributes, init_xlat_tables,
    mmu_max_pa, va_max_address, DEFAULT_MMAP_REGIONS, DEFAULT_PHY_ADDR_SPACE_SIZE,
    DEFAULT_VIRT_ADDR_SPACE_SIZE, DEFAULT_XLAT_TABLES,
};
#[cfg(all(target_arch = "aarch64", feature = "dynamic-regions"))]
pub use context::{add_dynamic_region, remove_dynamic_region};

#[test]
fn test_nop() {}

// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{PhysAddr, VirtAddr};
use bitflags::bitflags;

/// Memory types supported by the mapper, ordered so that going down the
/// list the types are getting stronger; conversely going up the list the
/// types are getting weaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemType {
    Device,
    NonCacheable,
    Memory,
}

bitflags! {
    /// Access attributes of a mapped region, combined with a [`MemType`]
    /// in [`MemAttributes`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemAttrFlags: u32 {
        /// Read-write access. Read-only if not set.
        const RW = 1 << 0;
        /// Non-secure. Secure if not set.
        const NS = 1 << 1;
        /// Forbid instruction fetch. Only meaningful for read-only normal
        /// memory; device memory and writable memory are mapped
        /// execute-never regardless.
        const EXECUTE_NEVER = 1 << 2;
        /// Region was added after initialization and can be removed again.
        /// Set internally by the dynamic mapping path, never by callers.
        const DYNAMIC = 1 << 3;
    }
}

/// Memory type and access attributes of one region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemAttributes {
    mem_type: MemType,
    flags: MemAttrFlags,
}

impl MemAttributes {
    /// Read-only executable normal memory.
    pub const CODE: Self = Self::new(MemType::Memory, MemAttrFlags::empty());

    /// Read-only non-executable normal memory.
    pub const RO_DATA: Self = Self::new(MemType::Memory, MemAttrFlags::EXECUTE_NEVER);

    /// Read-write normal memory, always mapped execute-never.
    pub const DATA: Self = Self::new(MemType::Memory, MemAttrFlags::RW);

    /// Read-write device memory, always mapped execute-never.
    pub const DEVICE: Self = Self::new(MemType::Device, MemAttrFlags::RW);

    pub const fn new(mem_type: MemType, flags: MemAttrFlags) -> Self {
        Self { mem_type, flags }
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn flags(&self) -> MemAttrFlags {
        self.flags
    }

    pub fn is_rw(&self) -> bool {
        self.flags.contains(MemAttrFlags::RW)
    }

    pub fn is_ns(&self) -> bool {
        self.flags.contains(MemAttrFlags::NS)
    }

    pub fn is_execute_never(&self) -> bool {
        self.flags.contains(MemAttrFlags::EXECUTE_NEVER)
    }

    pub fn is_dynamic(&self) -> bool {
        self.flags.contains(MemAttrFlags::DYNAMIC)
    }

    pub(crate) fn set_dynamic(&mut self) {
        self.flags.insert(MemAttrFlags::DYNAMIC);
    }
}

/// A single region of memory to map. Regions are accumulated in a
/// translation context and turned into translation table descriptors.
#[derive(Clone, Copy, Debug)]
pub struct XlatRegion {
    pub base_pa: PhysAddr,
    pub base_va: VirtAddr,
    pub size: usize,
    pub attr: MemAttributes,

    /// The finest block size the mapper must split this region down to.
    /// Pre-splitting a region to page granularity allows its attributes to
    /// be changed later without requiring new sub-tables.
    pub granularity: usize,
}

impl XlatRegion {
    /// A region of zero size. Terminates region arrays.
    pub const EMPTY: Self = Self {
        base_pa: PhysAddr::null(),
        base_va: VirtAddr::null(),
        size: 0,
        attr: MemAttributes::new(MemType::Device, MemAttrFlags::empty()),
        granularity: 0,
    };

    /// A region mapping `base_va` to `base_pa`, split only as far as its
    /// alignment requires.
    pub const fn new(base_pa: PhysAddr, base_va: VirtAddr, size: usize, attr: MemAttributes) -> Self {
        Self {
            base_pa,
            base_va,
            size,
            attr,
            granularity: size,
        }
    }

    /// An identity mapping of `size` bytes at `addr`.
    pub const fn flat(addr: usize, size: usize, attr: MemAttributes) -> Self {
        Self::new(PhysAddr::new(addr), VirtAddr::new(addr), size, attr)
    }

    /// Like [`XlatRegion::new()`], but force descriptors no coarser than
    /// `granularity`.
    pub const fn with_granularity(
        base_pa: PhysAddr,
        base_va: VirtAddr,
        size: usize,
        attr: MemAttributes,
        granularity: usize,
    ) -> Self {
        Self {
            base_pa,
            base_va,
            size,
            attr,
            granularity,
        }
    }

    /// Virtual address of the last byte of the region. Must not be called
    /// on the empty sentinel.
    pub(crate) fn end_va(&self) -> VirtAddr {
        self.base_va + (self.size - 1)
    }

    /// Physical address of the last byte of the region.
    pub(crate) fn end_pa(&self) -> PhysAddr {
        self.base_pa + (self.size - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::types::PAGE_SIZE_2M;

    #[test]
    fn test_attr_accessors() {
        assert!(MemAttributes::DEVICE.is_rw());
        assert!(!MemAttributes::DEVICE.is_ns());
        assert_eq!(MemAttributes::DEVICE.mem_type(), MemType::Device);

        assert!(!MemAttributes::CODE.is_execute_never());
        assert!(MemAttributes::RO_DATA.is_execute_never());
        assert!(!MemAttributes::RO_DATA.is_rw());

        let mut attr = MemAttributes::DATA;
        assert!(!attr.is_dynamic());
        attr.set_dynamic();
        assert!(attr.is_dynamic());
    }

    #[test]
    fn test_mem_type_ordering() {
        assert!(MemType::Device < MemType::NonCacheable);
        assert!(MemType::NonCacheable < MemType::Memory);
    }

    #[test]
    fn test_region_granularity() {
        let rgn = XlatRegion::flat(0x4000_0000, PAGE_SIZE_2M, MemAttributes::DATA);
        assert_eq!(rgn.granularity, PAGE_SIZE_2M);
        assert_eq!(rgn.base_pa.bits(), rgn.base_va.bits());
        assert_eq!(rgn.end_va(), VirtAddr::new(0x401f_ffff));
        assert_eq!(rgn.end_pa(), PhysAddr::new(0x401f_ffff));

        let rgn = XlatRegion::with_granularity(
            PhysAddr::new(0x4000_0000),
            VirtAddr::new(0x8000_0000),
            PAGE_SIZE_2M,
            MemAttributes::DATA,
            crate::types::PAGE_SIZE,
        );
        assert_eq!(rgn.granularity, crate::types::PAGE_SIZE);
    }
}

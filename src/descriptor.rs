// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

//! ARMv8 long-descriptor translation table entry format.
//!
//! A block descriptor maps a region of memory bigger than the granule size
//! (e.g. a 2MB region when the granule size is 4KB), a page descriptor maps
//! a single page, and a table descriptor points to the next level of
//! translation table. Page and table descriptors share an encoding; they
//! are told apart by the lookup level they appear at.

use crate::address::{Address, PhysAddr};
use crate::region::{MemAttributes, MemType};
use crate::types::{xlat_block_size, XLAT_TABLE_LEVEL_MAX};
use crate::utils::is_aligned;

const INVALID_DESC: u64 = 0x0;
const BLOCK_DESC: u64 = 0x1; /* Table levels 0-2 */
const TABLE_DESC: u64 = 0x3; /* Table levels 0-2 */
const PAGE_DESC: u64 = 0x3; /* Table level 3 */
const DESC_MASK: u64 = 0x3;

/// Output address bits of a block, page or table descriptor.
const TABLE_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

/// Lower attributes live in descriptor bits [11:2].
const fn lower_attrs(attr: u64) -> u64 {
    (attr & 0xfff) << 2
}

const AP_RO: u64 = 0x1 << 5;
const AP_RW: u64 = 0x0 << 5;
const NS: u64 = 0x1 << 3;
const ACCESS_FLAG: u64 = 1 << 8;
const OSH: u64 = 0x2 << 6;
const ISH: u64 = 0x3 << 6;

/// MAIR_ELx index of the attributes each memory type is mapped with.
const ATTR_IWBWA_OWBWA_NTR_INDEX: u64 = 0x0;
const ATTR_DEVICE_INDEX: u64 = 0x1;
const ATTR_NON_CACHEABLE_INDEX: u64 = 0x2;
const ATTR_INDEX_MASK: u64 = 0x3;

/// Upper attributes live in descriptor bits [54:52].
pub(crate) const fn upper_attrs(attr: u64) -> u64 {
    (attr & 0x7) << 52
}

/// XN: translation regimes that support one VA range (EL2 and EL3).
pub(crate) const XN: u64 = 1 << 2;
/// PXN: translation regimes that support two VA ranges (EL1&0).
pub(crate) const PXN: u64 = 1 << 1;

/// Bit position of AP[2], the read-only access permission bit.
const AP2_SHIFT: u32 = 7;

/// Kind of a decoded descriptor. Page and table descriptors share an
/// encoding, so decoding requires the lookup level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    Invalid,
    Block,
    Table,
    Page,
}

/// A single 64-bit translation table entry.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const INVALID: Self = Self(INVALID_DESC);

    /// Builds a table descriptor pointing at the sub-table located at
    /// `table_addr`.
    pub(crate) fn table(table_addr: PhysAddr) -> Self {
        Self(TABLE_DESC | table_addr.bits() as u64)
    }

    /// Builds a block or page descriptor mapping `pa` at the given level
    /// with the given attributes. `xn_mask` carries the execute-never bits
    /// of the targeted translation regime.
    ///
    /// # Panics
    ///
    /// Panics if `pa` is not aligned to the block size of `level`; the
    /// region checks are supposed to make that impossible.
    pub(crate) fn leaf(attr: MemAttributes, pa: PhysAddr, level: usize, xn_mask: u64) -> Self {
        assert!(is_aligned(pa.bits(), xlat_block_size(level)));

        let mut desc = pa.bits() as u64;

        // There are different translation table descriptors for level 3
        // and the rest.
        desc |= if level == XLAT_TABLE_LEVEL_MAX {
            PAGE_DESC
        } else {
            BLOCK_DESC
        };

        // Always set the access flag, as the engine doesn't manage access
        // flag faults.
        if attr.is_ns() {
            desc |= lower_attrs(NS);
        }
        desc |= if attr.is_rw() {
            lower_attrs(AP_RW)
        } else {
            lower_attrs(AP_RO)
        };
        desc |= lower_attrs(ACCESS_FLAG);

        match attr.mem_type() {
            MemType::Device => {
                // Device memory is always mapped execute-never to rule out
                // speculative instruction fetches from read-sensitive
                // peripherals.
                desc |= lower_attrs(ATTR_DEVICE_INDEX | OSH);
                desc |= xn_mask;
            }
            mem_type => {
                // Writable normal memory is data storage and must not be
                // executable; the XN bit is set even though SCTLR_ELx.WXN
                // already enforces this, so that the tables read
                // consistently with the MMU off. Read-only normal memory
                // is executable unless the region says otherwise.
                if attr.is_rw() || attr.is_execute_never() {
                    desc |= xn_mask;
                }

                if mem_type == MemType::Memory {
                    desc |= lower_attrs(ATTR_IWBWA_OWBWA_NTR_INDEX | ISH);
                } else {
                    desc |= lower_attrs(ATTR_NON_CACHEABLE_INDEX | OSH);
                }
            }
        }

        Self(desc)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Decodes the descriptor kind, taking the lookup level into account.
    /// Encodings that are architecturally reserved decode as `Invalid`.
    pub fn desc_type(self, level: usize) -> DescriptorType {
        match self.0 & DESC_MASK {
            BLOCK_DESC if level < XLAT_TABLE_LEVEL_MAX => DescriptorType::Block,
            TABLE_DESC if level < XLAT_TABLE_LEVEL_MAX => DescriptorType::Table,
            PAGE_DESC => DescriptorType::Page,
            _ => DescriptorType::Invalid,
        }
    }

    /// Output address of a block or page descriptor, or the sub-table
    /// address of a table descriptor.
    pub fn output_address(self) -> PhysAddr {
        PhysAddr::from(self.0 & TABLE_ADDR_MASK)
    }

    pub(crate) fn set_readonly(&mut self, readonly: bool) {
        if readonly {
            self.0 |= 1 << AP2_SHIFT;
        } else {
            self.0 &= !(1 << AP2_SHIFT);
        }
    }

    /// Sets or clears the execute-never bits of the translation regime
    /// the descriptor belongs to.
    pub(crate) fn set_execute_never(&mut self, xn: bool, xn_mask: u64) {
        if xn {
            self.0 |= xn_mask;
        } else {
            self.0 &= !xn_mask;
        }
    }

    // Decode helpers for the table dump.

    pub(crate) fn attr_index(self) -> u64 {
        (self.0 >> 2) & ATTR_INDEX_MASK
    }

    pub(crate) fn is_device(self) -> bool {
        self.attr_index() == ATTR_DEVICE_INDEX
    }

    pub(crate) fn is_non_cacheable(self) -> bool {
        self.attr_index() == ATTR_NON_CACHEABLE_INDEX
    }

    pub(crate) fn is_readonly(self) -> bool {
        self.0 & (1 << AP2_SHIFT) != 0
    }

    pub(crate) fn is_ns(self) -> bool {
        self.0 & lower_attrs(NS) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MemAttrFlags;
    use crate::types::PAGE_SIZE_2M;

    const EL1_XN_MASK: u64 = upper_attrs(PXN);
    const EL3_XN_MASK: u64 = upper_attrs(XN);

    #[test]
    fn test_leaf_normal_rw_page() {
        let desc = Descriptor::leaf(
            MemAttributes::DATA,
            PhysAddr::new(0x8_1000),
            3,
            EL1_XN_MASK,
        );
        // Page marker, AF, inner-shareable, write-back attr index 0,
        // AP[2]=0 and PXN for writable memory.
        let expected = 0x8_1000 | 0x3 | (1 << 10) | (0x3 << 8) | (1 << 53);
        assert_eq!(desc.raw(), expected);
        assert_eq!(desc.desc_type(3), DescriptorType::Page);
    }

    #[test]
    fn test_leaf_device_block() {
        let attr = MemAttributes::new(MemType::Device, MemAttrFlags::RW | MemAttrFlags::NS);
        let desc = Descriptor::leaf(attr, PhysAddr::new(0x4020_0000), 2, EL3_XN_MASK);
        // Block marker, AF, NS, outer-shareable, device attr index 1, XN.
        let expected =
            0x4020_0000 | 0x1 | (1 << 10) | (1 << 5) | (0x2 << 8) | (0x1 << 2) | (1 << 54);
        assert_eq!(desc.raw(), expected);
        assert_eq!(desc.desc_type(2), DescriptorType::Block);
    }

    #[test]
    fn test_leaf_non_cacheable() {
        let attr = MemAttributes::new(MemType::NonCacheable, MemAttrFlags::RW);
        let desc = Descriptor::leaf(attr, PhysAddr::null(), 3, EL3_XN_MASK);
        assert!(desc.is_non_cacheable());
        // Outer-shareable, attr index 2.
        assert_eq!(desc.raw() & (0x3 << 8), 0x2 << 8);
        assert_eq!(desc.attr_index(), 0x2);
    }

    #[test]
    fn test_executable_only_for_ro_normal() {
        let code = Descriptor::leaf(MemAttributes::CODE, PhysAddr::null(), 3, EL3_XN_MASK);
        assert_eq!(code.raw() & EL3_XN_MASK, 0);

        let ro_data = Descriptor::leaf(MemAttributes::RO_DATA, PhysAddr::null(), 3, EL3_XN_MASK);
        assert_eq!(ro_data.raw() & EL3_XN_MASK, EL3_XN_MASK);
        assert!(ro_data.is_readonly());

        let data = Descriptor::leaf(MemAttributes::DATA, PhysAddr::null(), 3, EL3_XN_MASK);
        assert_eq!(data.raw() & EL3_XN_MASK, EL3_XN_MASK);
        assert!(!data.is_readonly());
    }

    #[test]
    fn test_table_roundtrip() {
        let desc = Descriptor::table(PhysAddr::new(0x4_5000));
        assert_eq!(desc.desc_type(1), DescriptorType::Table);
        assert_eq!(desc.output_address(), PhysAddr::new(0x4_5000));
        // The page/table encoding is shared; only the level tells them
        // apart.
        assert_eq!(desc.desc_type(3), DescriptorType::Page);
    }

    #[test]
    fn test_update_bits() {
        let mut desc = Descriptor::leaf(MemAttributes::CODE, PhysAddr::null(), 3, EL3_XN_MASK);
        desc.set_readonly(false);
        desc.set_execute_never(true, EL3_XN_MASK);
        assert!(!desc.is_readonly());
        assert_eq!(desc.raw() & EL3_XN_MASK, EL3_XN_MASK);
        desc.set_readonly(true);
        desc.set_execute_never(false, EL3_XN_MASK);
        assert!(desc.is_readonly());
        assert_eq!(desc.raw() & EL3_XN_MASK, 0);
    }

    #[test]
    #[should_panic]
    fn test_misaligned_block_pa() {
        let _ = Descriptor::leaf(
            MemAttributes::DATA,
            PhysAddr::new(0x4000_1000),
            2,
            EL1_XN_MASK,
        );
    }

    #[test]
    fn test_block_alignment_ok() {
        let desc = Descriptor::leaf(
            MemAttributes::DATA,
            PhysAddr::new(PAGE_SIZE_2M),
            2,
            EL1_XN_MASK,
        );
        assert_eq!(desc.output_address(), PhysAddr::new(PAGE_SIZE_2M));
    }
}

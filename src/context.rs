// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

//! Translation context: region list, sub-table pool and the recursive
//! mapper that turns accumulated regions into translation tables.

use crate::address::{Address, PhysAddr, VirtAddr};
use crate::arch::{ExceptionLevel, XlatArch};
use crate::descriptor::{Descriptor, DescriptorType};
use crate::error::XlatError;
use crate::region::{MemAttributes, XlatRegion};
use crate::types::{
    xlat_addr_shift, xlat_base_level, xlat_base_table_entries, xlat_block_size, xlat_table_idx,
    MAX_VIRT_ADDR_SPACE_SIZE, MIN_LEVEL_BLOCK_DESC, MIN_VIRT_ADDR_SPACE_SIZE, PAGE_SIZE,
    XLAT_TABLE_ENTRIES, XLAT_TABLE_LEVEL_MAX, XLAT_TABLE_SIZE,
};
use crate::utils::{align_down, is_aligned, overlap};
use core::fmt;
use core::ops::{Index, IndexMut};

/// One translation table: a naturally aligned array of 64-bit descriptors
/// consumed by the hardware table walker.
#[repr(C, align(4096))]
#[derive(Debug)]
pub(crate) struct XlatTable {
    entries: [Descriptor; XLAT_TABLE_ENTRIES],
}

impl XlatTable {
    pub(crate) const EMPTY: Self = Self {
        entries: [Descriptor::INVALID; XLAT_TABLE_ENTRIES],
    };
}

impl Index<usize> for XlatTable {
    type Output = Descriptor;

    fn index(&self, index: usize) -> &Descriptor {
        &self.entries[index]
    }
}

impl IndexMut<usize> for XlatTable {
    fn index_mut(&mut self, index: usize) -> &mut Descriptor {
        &mut self.entries[index]
    }
}

/// Handle to one table owned by a context: the table at the initial
/// lookup level or a pool sub-table identified by its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TableRef {
    Base,
    Sub(usize),
}

/// What to do with one table entry when mapping a region over it,
/// depending on the descriptor found there and on how much of the entry
/// the region covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MapAction {
    /// The entry is outside the region or already maps it; leave it alone.
    None,
    /// Write a block descriptor, or a page descriptor at the last level.
    WriteLeaf,
    /// Take an empty table from the pool, point this entry at it and
    /// recurse into it.
    CreateNewTable,
    /// Follow the table descriptor already present and recurse.
    RecurseIntoTable,
}

/// A translation context: the region list, the table at the initial
/// lookup level and a fixed pool of `NUM_TABLES` sub-tables. One slot of
/// the `NUM_REGIONS`-sized region list is reserved for the terminating
/// sentinel.
///
/// The context owns the table storage, so it must stay in place once
/// regions have been mapped; table descriptors record the addresses of
/// the pool tables. The intended use is a `static` instance.
pub struct XlatCtx<const NUM_REGIONS: usize, const NUM_TABLES: usize> {
    arch: &'static dyn XlatArch,
    regions: [XlatRegion; NUM_REGIONS],
    base_table: XlatTable,
    tables: [XlatTable; NUM_TABLES],
    /// Number of regions currently contributing descriptors to each pool
    /// table. A table is free while its count is zero.
    #[cfg(feature = "dynamic-regions")]
    table_regions: [u32; NUM_TABLES],
    /// Next never-used pool table. Without dynamic regions nothing is
    /// ever unmapped, so tables are handed out in declaration order.
    #[cfg(not(feature = "dynamic-regions"))]
    next_table: usize,
    va_max_address: VirtAddr,
    pa_max_address: PhysAddr,
    max_va: VirtAddr,
    max_pa: PhysAddr,
    base_level: usize,
    base_table_entries: usize,
    exception_level: ExceptionLevel,
    xn_mask: u64,
    initialized: bool,
}

impl<const NUM_REGIONS: usize, const NUM_TABLES: usize> XlatCtx<NUM_REGIONS, NUM_TABLES> {
    /// Creates an empty context for the given virtual and physical
    /// address space sizes, targeting the given exception level.
    ///
    /// Both sizes must be powers of two; the virtual address space size
    /// picks the initial lookup level and the number of entries in the
    /// base table.
    pub const fn new(
        va_space_size: usize,
        pa_space_size: usize,
        exception_level: ExceptionLevel,
        arch: &'static dyn XlatArch,
    ) -> Self {
        assert!(va_space_size.is_power_of_two());
        assert!(
            va_space_size >= MIN_VIRT_ADDR_SPACE_SIZE && va_space_size <= MAX_VIRT_ADDR_SPACE_SIZE
        );
        assert!(pa_space_size.is_power_of_two());
        assert!(pa_space_size >= PAGE_SIZE && pa_space_size <= MAX_VIRT_ADDR_SPACE_SIZE);
        assert!(NUM_REGIONS >= 2);
        assert!(NUM_TABLES >= 1);

        Self {
            arch,
            regions: [XlatRegion::EMPTY; NUM_REGIONS],
            base_table: XlatTable::EMPTY,
            tables: [XlatTable::EMPTY; NUM_TABLES],
            #[cfg(feature = "dynamic-regions")]
            table_regions: [0; NUM_TABLES],
            #[cfg(not(feature = "dynamic-regions"))]
            next_table: 0,
            va_max_address: VirtAddr::new(va_space_size - 1),
            pa_max_address: PhysAddr::new(pa_space_size - 1),
            max_va: VirtAddr::null(),
            max_pa: PhysAddr::null(),
            base_level: xlat_base_level(va_space_size),
            base_table_entries: xlat_base_table_entries(va_space_size),
            exception_level,
            xn_mask: 0,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Physical address of the table at the initial lookup level, to be
    /// programmed into the translation table base register.
    pub fn base_table_address(&self) -> PhysAddr {
        self.table_address(TableRef::Base)
    }

    /// Inclusive top of the configured virtual address space.
    pub fn va_max_address(&self) -> VirtAddr {
        self.va_max_address
    }

    /// Inclusive top of the configured physical address space.
    pub fn pa_max_address(&self) -> PhysAddr {
        self.pa_max_address
    }

    /// Highest virtual address currently covered by a region.
    pub fn max_mapped_va(&self) -> VirtAddr {
        self.max_va
    }

    /// Highest physical address currently covered by a region.
    pub fn max_mapped_pa(&self) -> PhysAddr {
        self.max_pa
    }

    /// Highest physical address an MMU enable routine has to account
    /// for. With dynamic region support the maximum mapped address can
    /// still grow, so the whole configured space is reported.
    pub fn mmu_max_pa(&self) -> PhysAddr {
        if cfg!(feature = "dynamic-regions") {
            self.pa_max_address
        } else {
            self.max_pa
        }
    }

    /// Adds a static region to the context. Static regions can only be
    /// added before initialization and are never removed.
    ///
    /// # Panics
    ///
    /// Panics if the context is already initialized or the region fails
    /// validation; a firmware image cannot run with holes in its memory
    /// map.
    pub fn add_region(&mut self, mm: XlatRegion) {
        // Ignore empty regions
        if mm.size == 0 {
            return;
        }

        assert!(!self.initialized);

        if let Err(err) = self.add_region_check(&mm) {
            log::error!(
                "cannot add region VA:{:#x} PA:{:#x} size:{:#x}: {:?}",
                mm.base_va,
                mm.base_pa,
                mm.size,
                err
            );
            panic!("invalid static region");
        }

        self.insert_region(mm);

        if mm.end_pa() > self.max_pa {
            self.max_pa = mm.end_pa();
        }
        if mm.end_va() > self.max_va {
            self.max_va = mm.end_va();
        }
    }

    /// Adds every region of `regions` up to the first zero-size record.
    pub fn add_regions(&mut self, regions: &[XlatRegion]) {
        for mm in regions.iter().take_while(|mm| mm.size != 0) {
            self.add_region(*mm);
        }
    }

    /// Adds a region that can be removed again later. Allowed both
    /// before and after initialization; once the tables are live the
    /// region is mapped immediately and a failure due to pool exhaustion
    /// rolls every change back before returning `OutOfMemory`.
    #[cfg(feature = "dynamic-regions")]
    pub fn add_dynamic_region(&mut self, mut mm: XlatRegion) -> Result<(), XlatError> {
        // Nothing to do
        if mm.size == 0 {
            return Ok(());
        }

        mm.attr.set_dynamic();

        self.add_region_check(&mm)?;

        let idx = self.insert_region(mm);

        if self.initialized {
            let end_va = self.map_region(&mm, VirtAddr::null(), TableRef::Base, self.base_level);

            if end_va != mm.end_va() {
                // Take the region out of the list again and undo the
                // partially written mapping, if any.
                self.remove_region_at(idx);

                if mm.base_va < end_va {
                    let rollback = XlatRegion::new(
                        PhysAddr::null(),
                        mm.base_va,
                        end_va - mm.base_va,
                        mm.attr,
                    );
                    self.unmap_region(&rollback, VirtAddr::null(), TableRef::Base, self.base_level);
                }

                return Err(XlatError::OutOfMemory);
            }

            // New descriptors only ever replace invalid ones, which are
            // never TLB-cached, so a barrier publishing the writes is
            // all that is needed.
            self.arch.tlb_sync();
        }

        if mm.end_pa() > self.max_pa {
            self.max_pa = mm.end_pa();
        }
        if mm.end_va() > self.max_va {
            self.max_va = mm.end_va();
        }

        Ok(())
    }

    /// Removes the dynamic region previously added with exactly this
    /// base address and size. Leaf entries are invalidated in the TLB
    /// one by one and sub-tables no region contributes to anymore are
    /// returned to the pool.
    #[cfg(feature = "dynamic-regions")]
    pub fn remove_dynamic_region(
        &mut self,
        base_va: VirtAddr,
        size: usize,
    ) -> Result<(), XlatError> {
        let mut idx = 0;
        while self.regions[idx].size != 0 {
            if self.regions[idx].base_va == base_va && self.regions[idx].size == size {
                break;
            }
            idx += 1;
        }

        let mm = self.regions[idx];
        if mm.size == 0 {
            return Err(XlatError::InvalidArgument);
        }
        if !mm.attr.is_dynamic() {
            return Err(XlatError::PermissionDenied);
        }

        let update_max_va = mm.end_va() == self.max_va;
        let update_max_pa = mm.end_pa() == self.max_pa;

        if self.initialized {
            self.unmap_region(&mm, VirtAddr::null(), TableRef::Base, self.base_level);
            self.arch.tlb_sync();
        }

        self.remove_region_at(idx);

        if update_max_va {
            let mut max_va = VirtAddr::null();
            for other in self.regions.iter().take_while(|r| r.size != 0) {
                if other.end_va() > max_va {
                    max_va = other.end_va();
                }
            }
            self.max_va = max_va;
        }
        if update_max_pa {
            let mut max_pa = PhysAddr::null();
            for other in self.regions.iter().take_while(|r| r.size != 0) {
                if other.end_pa() > max_pa {
                    max_pa = other.end_pa();
                }
            }
            self.max_pa = max_pa;
        }

        Ok(())
    }

    /// Builds the translation tables from the accumulated region list.
    /// After this call the context only accepts dynamic region updates.
    ///
    /// # Panics
    ///
    /// Panics if the sub-table pool cannot hold the mappings the region
    /// list requires, or if the configured physical address space
    /// exceeds what the core supports.
    pub fn init(&mut self) {
        assert!(!self.initialized);

        self.dump_regions();

        if self.exception_level == ExceptionLevel::Current {
            self.exception_level = self.arch.current_el();
        }
        self.xn_mask = self.arch.xn_mask(self.exception_level);

        // All tables must be zeroed before mapping any region.
        self.base_table = XlatTable::EMPTY;
        for table in self.tables.iter_mut() {
            *table = XlatTable::EMPTY;
        }
        #[cfg(feature = "dynamic-regions")]
        {
            self.table_regions = [0; NUM_TABLES];
        }
        #[cfg(not(feature = "dynamic-regions"))]
        {
            self.next_table = 0;
        }

        let mut idx = 0;
        while self.regions[idx].size != 0 {
            let mm = self.regions[idx];
            let end_va = self.map_region(&mm, VirtAddr::null(), TableRef::Base, self.base_level);
            if end_va != mm.end_va() {
                log::error!(
                    "not enough memory to map region VA:{:#x} PA:{:#x} size:{:#x}",
                    mm.base_va,
                    mm.base_pa,
                    mm.size
                );
                panic!("translation table pool exhausted");
            }
            idx += 1;
        }

        assert!(self.pa_max_address <= self.arch.max_supported_pa());
        assert!(self.max_va <= self.va_max_address);
        assert!(self.max_pa <= self.pa_max_address);

        self.initialized = true;

        self.dump_tables();
    }

    /// Rewrites the access permissions and executability of an already
    /// mapped range of pages in place.
    ///
    /// The range must be page-aligned and mapped entirely by page
    /// descriptors; coarser block mappings are rejected and nothing is
    /// changed. Requesting writable executable memory is refused.
    pub fn change_mem_attributes(
        &mut self,
        base_va: VirtAddr,
        size: usize,
        attr: MemAttributes,
    ) -> Result<(), XlatError> {
        assert!(self.initialized);

        if !base_va.is_page_aligned() {
            log::error!("address {:#x} is not aligned on a page boundary", base_va);
            return Err(XlatError::InvalidArgument);
        }
        if size == 0 || !is_aligned(size, PAGE_SIZE) {
            log::error!("size {:#x} is not a multiple of a page size", size);
            return Err(XlatError::InvalidArgument);
        }
        if attr.is_rw() && !attr.is_execute_never() {
            log::error!("read-write + execute is forbidden");
            return Err(XlatError::InvalidArgument);
        }

        let pages_count = size / PAGE_SIZE;

        // Verify first that every page of the range is mapped at page
        // granularity; no descriptor is touched unless all of them can
        // be rewritten.
        let mut va = base_va;
        for _ in 0..pages_count {
            let Some((table, idx, level)) = self.find_table_entry(va) else {
                log::error!("address {:#x} is not mapped", va);
                return Err(XlatError::InvalidArgument);
            };
            if self.table_desc(table, idx).desc_type(level) != DescriptorType::Page {
                log::error!("address {:#x} is not mapped at page granularity", va);
                return Err(XlatError::InvalidArgument);
            }
            va = va + PAGE_SIZE;
        }

        let mut va = base_va;
        for _ in 0..pages_count {
            let Some((table, idx, _)) = self.find_table_entry(va) else {
                unreachable!();
            };

            let mut desc = self.table_desc(table, idx);
            desc.set_readonly(!attr.is_rw());
            desc.set_execute_never(attr.is_execute_never(), self.xn_mask);
            self.set_table_desc(table, idx, desc);

            // Attribute changes serve the EL1&0 regime.
            self.arch.invalidate_tlb_va(va, ExceptionLevel::El1);

            va = va + PAGE_SIZE;
        }

        self.arch.tlb_sync();

        Ok(())
    }

    /// Checks that a region may enter the region list: page-aligned,
    /// within the configured address spaces, free slot available and no
    /// forbidden overlap with any existing region.
    fn add_region_check(&self, mm: &XlatRegion) -> Result<(), XlatError> {
        if !mm.base_pa.is_page_aligned()
            || !mm.base_va.is_page_aligned()
            || !is_aligned(mm.size, PAGE_SIZE)
            || !is_aligned(mm.granularity, PAGE_SIZE)
        {
            return Err(XlatError::InvalidArgument);
        }

        // Check for overflows
        let Some(end_va) = mm.base_va.checked_add(mm.size - 1) else {
            return Err(XlatError::OutOfRange);
        };
        let Some(end_pa) = mm.base_pa.checked_add(mm.size - 1) else {
            return Err(XlatError::OutOfRange);
        };

        if end_va > self.va_max_address || end_pa > self.pa_max_address {
            return Err(XlatError::OutOfRange);
        }

        // The last array slot holds the terminating sentinel.
        if self.regions[NUM_REGIONS - 2].size != 0 {
            return Err(XlatError::OutOfMemory);
        }

        for other in self.regions.iter().take_while(|r| r.size != 0) {
            let other_end_va = other.end_va();

            // Check if one of the regions is completely inside the other
            // one.
            let fully_overlapped_va = (mm.base_va >= other.base_va && end_va <= other_end_va)
                || (other.base_va >= mm.base_va && other_end_va <= end_va);

            if fully_overlapped_va {
                // Full VA overlaps are only allowed between static
                // regions that map to the same physical addresses, and
                // only if the two areas are not exactly the same.
                #[cfg(feature = "dynamic-regions")]
                if mm.attr.is_dynamic() || other.attr.is_dynamic() {
                    return Err(XlatError::PermissionDenied);
                }

                if other.base_va.bits().wrapping_sub(other.base_pa.bits())
                    != mm.base_va.bits().wrapping_sub(mm.base_pa.bits())
                {
                    return Err(XlatError::PermissionDenied);
                }
                if mm.base_va == other.base_va && mm.size == other.size {
                    return Err(XlatError::PermissionDenied);
                }
            } else {
                // Without a full VA overlap the regions must be fully
                // separated in both VA and PA; partial overlaps are not
                // allowed.
                let other_end_pa = other.end_pa();
                let separated_pa = end_pa < other.base_pa || mm.base_pa > other_end_pa;
                let separated_va = end_va < other.base_va || mm.base_va > other_end_va;

                if !(separated_va && separated_pa) {
                    return Err(XlatError::PermissionDenied);
                }
            }
        }

        Ok(())
    }

    /// Inserts a validated region into the list, keeping it ordered by
    /// ascending end VA with smaller regions first on ties. Overlapping
    /// outer regions thereby get mapped after the regions they contain
    /// and cannot overwrite their finer descriptors. Returns the
    /// insertion index.
    fn insert_region(&mut self, mm: XlatRegion) -> usize {
        let end_va = mm.end_va();

        let mut idx = 0;
        while self.regions[idx].size != 0 && self.regions[idx].end_va() < end_va {
            idx += 1;
        }
        while self.regions[idx].size != 0
            && self.regions[idx].end_va() == end_va
            && self.regions[idx].size < mm.size
        {
            idx += 1;
        }

        // The free-slot check guarantees the terminator survives the
        // shift.
        debug_assert_eq!(self.regions[NUM_REGIONS - 1].size, 0);
        self.regions.copy_within(idx..NUM_REGIONS - 1, idx + 1);
        self.regions[idx] = mm;

        idx
    }

    #[cfg(feature = "dynamic-regions")]
    fn remove_region_at(&mut self, idx: usize) {
        self.regions.copy_within(idx + 1..NUM_REGIONS, idx);
        self.regions[NUM_REGIONS - 1] = XlatRegion::EMPTY;
    }

    /// Decides what to do with the entry covering `entry_base_va` when
    /// mapping `mm` over it.
    fn map_action(
        &self,
        mm: &XlatRegion,
        desc: Descriptor,
        entry_base_va: VirtAddr,
        level: usize,
    ) -> MapAction {
        let mm_end_va = mm.end_va();
        let entry_end_va = entry_base_va + (xlat_block_size(level) - 1);
        let desc_type = desc.desc_type(level);

        let contained = mm.base_va <= entry_base_va && mm_end_va >= entry_end_va;
        let intersects = overlap(mm.base_va, mm_end_va, entry_base_va, entry_end_va);

        if contained {
            // The entry can describe the whole translation at this
            // granularity in principle.
            if level == XLAT_TABLE_LEVEL_MAX {
                // Only page descriptors are allowed at the last level;
                // an existing one belongs to another region and is not
                // overwritten.
                match desc_type {
                    DescriptorType::Page => MapAction::None,
                    _ => {
                        debug_assert_eq!(desc_type, DescriptorType::Invalid);
                        MapAction::WriteLeaf
                    }
                }
            } else {
                match desc_type {
                    DescriptorType::Table => MapAction::RecurseIntoTable,
                    DescriptorType::Invalid => {
                        // A block descriptor requires a level that allows
                        // blocks, a destination aligned to the block size
                        // and a region granularity no finer than the
                        // block.
                        let dest_pa = mm.base_pa + (entry_base_va - mm.base_va);
                        if !is_aligned(dest_pa.bits(), xlat_block_size(level))
                            || level < MIN_LEVEL_BLOCK_DESC
                            || mm.granularity < xlat_block_size(level)
                        {
                            MapAction::CreateNewTable
                        } else {
                            MapAction::WriteLeaf
                        }
                    }
                    _ => {
                        // Another region is mapped here already, don't
                        // overwrite.
                        debug_assert_eq!(desc_type, DescriptorType::Block);
                        MapAction::None
                    }
                }
            }
        } else if intersects {
            // The entry is only partially covered, a finer table is
            // needed. Partial coverage cannot happen at the last level;
            // the region checks enforce page alignment.
            debug_assert!(level < XLAT_TABLE_LEVEL_MAX);
            match desc_type {
                DescriptorType::Invalid => MapAction::CreateNewTable,
                _ => {
                    debug_assert_eq!(desc_type, DescriptorType::Table);
                    MapAction::RecurseIntoTable
                }
            }
        } else {
            // The entry lies outside of the region.
            MapAction::None
        }
    }

    /// Recursively writes the descriptors mapping `mm` into `table` and
    /// its sub-tables. Returns the VA of the last byte mapped; a return
    /// value short of the region end reports where the sub-table pool
    /// ran dry.
    fn map_region(
        &mut self,
        mm: &XlatRegion,
        table_base_va: VirtAddr,
        table: TableRef,
        level: usize,
    ) -> VirtAddr {
        debug_assert!(level >= self.base_level && level <= XLAT_TABLE_LEVEL_MAX);

        let mm_end_va = mm.end_va();
        let entries = self.table_entries(table);
        let block_size = xlat_block_size(level);

        let (mut table_idx, mut table_idx_va) = if mm.base_va > table_base_va {
            // First index of this table affected by the region.
            let va = VirtAddr::from(align_down(mm.base_va.bits(), block_size));
            ((va - table_base_va) >> xlat_addr_shift(level), va)
        } else {
            (0, table_base_va)
        };
        debug_assert!(table_idx < entries);

        #[cfg(feature = "dynamic-regions")]
        {
            if level > self.base_level {
                self.inc_region_count(table);
            }
        }

        while table_idx < entries {
            let desc = self.table_desc(table, table_idx);

            match self.map_action(mm, desc, table_idx_va, level) {
                MapAction::None => (),
                MapAction::WriteLeaf => {
                    let dest_pa = mm.base_pa + (table_idx_va - mm.base_va);
                    let leaf = Descriptor::leaf(mm.attr, dest_pa, level, self.xn_mask);
                    self.set_table_desc(table, table_idx, leaf);
                }
                MapAction::CreateNewTable => {
                    let Some(idx) = self.table_get_empty() else {
                        // Not enough free tables to map this region.
                        return table_idx_va;
                    };
                    let subtable = TableRef::Sub(idx);
                    let table_desc = Descriptor::table(self.table_address(subtable));
                    self.set_table_desc(table, table_idx, table_desc);

                    let end_va = self.map_region(mm, table_idx_va, subtable, level + 1);
                    if end_va != table_idx_va + (block_size - 1) {
                        return end_va;
                    }
                }
                MapAction::RecurseIntoTable => {
                    let subtable = self.subtable_ref(desc);
                    let end_va = self.map_region(mm, table_idx_va, subtable, level + 1);
                    if end_va != table_idx_va + (block_size - 1) {
                        return end_va;
                    }
                }
            }

            table_idx += 1;
            table_idx_va = table_idx_va + block_size;

            // Reached the end of the region.
            if mm_end_va <= table_idx_va {
                break;
            }
        }

        table_idx_va - 1
    }

    /// Mirror of [`Self::map_region()`]: erases the descriptors mapping
    /// `mm`, invalidates every erased leaf in the TLB and reclaims
    /// sub-tables that no region contributes to anymore.
    #[cfg(feature = "dynamic-regions")]
    fn unmap_region(
        &mut self,
        mm: &XlatRegion,
        table_base_va: VirtAddr,
        table: TableRef,
        level: usize,
    ) {
        debug_assert!(level >= self.base_level && level <= XLAT_TABLE_LEVEL_MAX);

        let region_end_va = mm.end_va();
        let entries = self.table_entries(table);
        let block_size = xlat_block_size(level);

        let (mut table_idx, mut table_idx_va) = if mm.base_va > table_base_va {
            let va = VirtAddr::from(align_down(mm.base_va.bits(), block_size));
            ((va - table_base_va) >> xlat_addr_shift(level), va)
        } else {
            (0, table_base_va)
        };
        debug_assert!(table_idx < entries);

        while table_idx < entries {
            let entry_end_va = table_idx_va + (block_size - 1);
            let desc = self.table_desc(table, table_idx);
            let desc_type = desc.desc_type(level);

            let contained = mm.base_va <= table_idx_va && region_end_va >= entry_end_va;
            let intersects = overlap(mm.base_va, region_end_va, table_idx_va, entry_end_va);

            if contained {
                if level == XLAT_TABLE_LEVEL_MAX {
                    // Only page descriptors are allowed at the last
                    // level.
                    debug_assert_eq!(desc_type, DescriptorType::Page);
                    self.invalidate_entry(table, table_idx, table_idx_va);
                } else if desc_type == DescriptorType::Table {
                    self.unmap_subtable(mm, desc, table, table_idx, table_idx_va, level);
                } else {
                    debug_assert_eq!(desc_type, DescriptorType::Block);
                    self.invalidate_entry(table, table_idx, table_idx_va);
                }
            } else if intersects {
                // A partially covered entry must sit above a sub-table;
                // anything else means the region was never fully mapped.
                debug_assert!(level < XLAT_TABLE_LEVEL_MAX);
                debug_assert_eq!(desc_type, DescriptorType::Table);
                if desc_type == DescriptorType::Table {
                    self.unmap_subtable(mm, desc, table, table_idx, table_idx_va, level);
                }
            }

            table_idx += 1;
            table_idx_va = table_idx_va + block_size;

            // Reached the end of the region.
            if region_end_va <= table_idx_va {
                break;
            }
        }

        if level > self.base_level {
            self.dec_region_count(table);
        }
    }

    /// Recurses into the sub-table behind `desc` to unmap `mm`, then
    /// drops the reference to it from the parent if it became empty.
    #[cfg(feature = "dynamic-regions")]
    fn unmap_subtable(
        &mut self,
        mm: &XlatRegion,
        desc: Descriptor,
        parent: TableRef,
        parent_idx: usize,
        entry_va: VirtAddr,
        level: usize,
    ) {
        let subtable = self.subtable_ref(desc);
        self.unmap_region(mm, entry_va, subtable, level + 1);

        if self.table_is_empty(subtable) {
            self.invalidate_entry(parent, parent_idx, entry_va);
        }
    }

    #[cfg(feature = "dynamic-regions")]
    fn invalidate_entry(&mut self, table: TableRef, idx: usize, va: VirtAddr) {
        self.set_table_desc(table, idx, Descriptor::INVALID);
        self.arch.invalidate_tlb_va(va, self.exception_level);
    }

    /// Walks the tree to the descriptor mapping `va`. Returns the table,
    /// index and level of the block or page descriptor, or `None` when
    /// the address is not mapped.
    fn find_table_entry(&self, va: VirtAddr) -> Option<(TableRef, usize, usize)> {
        let mut table = TableRef::Base;
        let mut entries = self.base_table_entries;

        for level in self.base_level..=XLAT_TABLE_LEVEL_MAX {
            let idx = xlat_table_idx(va.bits(), level);
            if idx >= entries {
                return None;
            }

            let desc = self.table_desc(table, idx);
            match desc.desc_type(level) {
                DescriptorType::Invalid => return None,
                DescriptorType::Block | DescriptorType::Page => return Some((table, idx, level)),
                DescriptorType::Table => {
                    table = self.subtable_ref(desc);
                    entries = XLAT_TABLE_ENTRIES;
                }
            }
        }

        None
    }

    fn table_entries(&self, table: TableRef) -> usize {
        match table {
            TableRef::Base => self.base_table_entries,
            TableRef::Sub(_) => XLAT_TABLE_ENTRIES,
        }
    }

    fn table_desc(&self, table: TableRef, idx: usize) -> Descriptor {
        match table {
            TableRef::Base => self.base_table[idx],
            TableRef::Sub(i) => self.tables[i][idx],
        }
    }

    fn set_table_desc(&mut self, table: TableRef, idx: usize, desc: Descriptor) {
        match table {
            TableRef::Base => self.base_table[idx] = desc,
            TableRef::Sub(i) => self.tables[i][idx] = desc,
        }
    }

    /// Address of the table storage. The tables live in the image and
    /// are expected to be identity-mapped, so this doubles as the
    /// physical address stored in table descriptors.
    fn table_address(&self, table: TableRef) -> PhysAddr {
        let ptr: *const XlatTable = match table {
            TableRef::Base => &self.base_table,
            TableRef::Sub(i) => &self.tables[i],
        };
        PhysAddr::from(ptr as usize)
    }

    /// Recovers the pool table a table descriptor points at. This is the
    /// single place where a descriptor payload is interpreted as a table
    /// again; the offset from the pool base yields the index.
    fn subtable_ref(&self, desc: Descriptor) -> TableRef {
        let addr = desc.output_address().bits();
        let pool_base = self.tables.as_ptr() as usize;
        let idx = addr.wrapping_sub(pool_base) / XLAT_TABLE_SIZE;

        assert!(idx < NUM_TABLES && addr == pool_base + idx * XLAT_TABLE_SIZE);

        TableRef::Sub(idx)
    }

    /// Hands out the index of an unused pool table, if any is left.
    #[cfg(feature = "dynamic-regions")]
    fn table_get_empty(&mut self) -> Option<usize> {
        self.table_regions.iter().position(|&count| count == 0)
    }

    #[cfg(not(feature = "dynamic-regions"))]
    fn table_get_empty(&mut self) -> Option<usize> {
        if self.next_table < NUM_TABLES {
            let idx = self.next_table;
            self.next_table += 1;
            Some(idx)
        } else {
            None
        }
    }

    #[cfg(feature = "dynamic-regions")]
    fn inc_region_count(&mut self, table: TableRef) {
        let TableRef::Sub(idx) = table else {
            unreachable!("region count on the base table");
        };
        self.table_regions[idx] += 1;
    }

    #[cfg(feature = "dynamic-regions")]
    fn dec_region_count(&mut self, table: TableRef) {
        let TableRef::Sub(idx) = table else {
            unreachable!("region count on the base table");
        };
        self.table_regions[idx] -= 1;
    }

    #[cfg(feature = "dynamic-regions")]
    fn table_is_empty(&self, table: TableRef) -> bool {
        let TableRef::Sub(idx) = table else {
            unreachable!("region count on the base table");
        };
        self.table_regions[idx] == 0
    }

    #[cfg(feature = "dynamic-regions")]
    fn used_tables(&self) -> usize {
        self.table_regions.iter().filter(|&&count| count != 0).count()
    }

    #[cfg(not(feature = "dynamic-regions"))]
    fn used_tables(&self) -> usize {
        self.next_table
    }

    fn dump_regions(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        log::trace!("mmap:");
        for mm in self.regions.iter().take_while(|r| r.size != 0) {
            log::trace!(
                " VA:{:#x} PA:{:#x} size:{:#x} granularity:{:#x} {:?}",
                mm.base_va,
                mm.base_pa,
                mm.size,
                mm.granularity,
                mm.attr
            );
        }
    }

    /// Logs the state of the translation tables at trace level.
    pub fn dump_tables(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        log::trace!("Translation tables state:");
        log::trace!("  Targeted EL: {:?}", self.exception_level);
        log::trace!("  Max allowed PA: {:#x}", self.pa_max_address);
        log::trace!("  Max allowed VA: {:#x}", self.va_max_address);
        log::trace!("  Max mapped PA: {:#x}", self.max_pa);
        log::trace!("  Max mapped VA: {:#x}", self.max_va);
        log::trace!("  Initial lookup level: {}", self.base_level);
        log::trace!("  Entries @initial lookup level: {}", self.base_table_entries);
        log::trace!(
            "  Used {} sub-tables out of {} (spare: {})",
            self.used_tables(),
            NUM_TABLES,
            NUM_TABLES - self.used_tables()
        );

        self.dump_table(VirtAddr::null(), TableRef::Base, self.base_level);
    }

    fn dump_table(&self, table_base_va: VirtAddr, table: TableRef, level: usize) {
        const LEVEL_SPACERS: [&str; 4] = ["[LV0] ", "  [LV1] ", "    [LV2] ", "      [LV3] "];

        let block_size = xlat_block_size(level);
        let mut table_idx_va = table_base_va;

        // Runs of invalid descriptors are elided: only the first one of
        // a run is logged together with the length of the run.
        let mut invalid_row_count = 0usize;

        for idx in 0..self.table_entries(table) {
            let desc = self.table_desc(table, idx);
            let desc_type = desc.desc_type(level);

            if desc_type == DescriptorType::Invalid {
                if invalid_row_count == 0 {
                    log::trace!(
                        "{}VA:{:#x} size:{:#x}",
                        LEVEL_SPACERS[level],
                        table_idx_va,
                        block_size
                    );
                }
                invalid_row_count += 1;
            } else {
                if invalid_row_count > 1 {
                    log::trace!(
                        "{}({} invalid descriptors omitted)",
                        LEVEL_SPACERS[level],
                        invalid_row_count - 1
                    );
                }
                invalid_row_count = 0;

                if desc_type == DescriptorType::Table {
                    log::trace!(
                        "{}VA:{:#x} size:{:#x}",
                        LEVEL_SPACERS[level],
                        table_idx_va,
                        block_size
                    );
                    self.dump_table(table_idx_va, self.subtable_ref(desc), level + 1);
                } else {
                    let mem_type = if desc.is_device() {
                        "DEV"
                    } else if desc.is_non_cacheable() {
                        "NC"
                    } else {
                        "MEM"
                    };
                    log::trace!(
                        "{}VA:{:#x} PA:{:#x} size:{:#x} {}{}{}{}",
                        LEVEL_SPACERS[level],
                        table_idx_va,
                        desc.output_address(),
                        block_size,
                        mem_type,
                        if desc.is_readonly() { "-RO" } else { "-RW" },
                        if desc.is_ns() { "-NS" } else { "-S" },
                        if desc.raw() & self.xn_mask != 0 {
                            "-XN"
                        } else {
                            "-EXEC"
                        }
                    );
                }
            }

            table_idx_va = table_idx_va + block_size;
        }

        if invalid_row_count > 1 {
            log::trace!(
                "{}({} invalid descriptors omitted)",
                LEVEL_SPACERS[level],
                invalid_row_count - 1
            );
        }
    }
}

impl<const NUM_REGIONS: usize, const NUM_TABLES: usize> fmt::Debug
    for XlatCtx<NUM_REGIONS, NUM_TABLES>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XlatCtx")
            .field("base_level", &self.base_level)
            .field("base_table_entries", &self.base_table_entries)
            .field("va_max_address", &self.va_max_address)
            .field("pa_max_address", &self.pa_max_address)
            .field("max_va", &self.max_va)
            .field("max_pa", &self.max_pa)
            .field("exception_level", &self.exception_level)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

/// Region capacity of the process-wide default context.
#[cfg(target_arch = "aarch64")]
pub const DEFAULT_MMAP_REGIONS: usize = 16;

/// Sub-table pool size of the process-wide default context.
#[cfg(target_arch = "aarch64")]
pub const DEFAULT_XLAT_TABLES: usize = 8;

/// Address space sizes of the process-wide default context.
#[cfg(target_arch = "aarch64")]
pub const DEFAULT_VIRT_ADDR_SPACE_SIZE: usize = 1 << 32;
#[cfg(target_arch = "aarch64")]
pub const DEFAULT_PHY_ADDR_SPACE_SIZE: usize = 1 << 32;

#[cfg(target_arch = "aarch64")]
static DEFAULT_CTX: crate::locking::SpinLock<
    XlatCtx<{ DEFAULT_MMAP_REGIONS + 1 }, DEFAULT_XLAT_TABLES>,
> = crate::locking::SpinLock::new(XlatCtx::new(
    DEFAULT_VIRT_ADDR_SPACE_SIZE,
    DEFAULT_PHY_ADDR_SPACE_SIZE,
    ExceptionLevel::Current,
    &crate::arch::AArch64,
));

/// Initializes the default translation context. See [`XlatCtx::init()`].
#[cfg(target_arch = "aarch64")]
pub fn init_xlat_tables() {
    DEFAULT_CTX.lock().init();
}

/// Adds a static region to the default context. See
/// [`XlatCtx::add_region()`].
#[cfg(target_arch = "aarch64")]
pub fn add_region(mm: XlatRegion) {
    DEFAULT_CTX.lock().add_region(mm);
}

/// Adds static regions to the default context up to the first zero-size
/// record. See [`XlatCtx::add_regions()`].
#[cfg(target_arch = "aarch64")]
pub fn add_regions(regions: &[XlatRegion]) {
    DEFAULT_CTX.lock().add_regions(regions);
}

/// Adds a dynamic region to the default context. See
/// [`XlatCtx::add_dynamic_region()`].
#[cfg(all(target_arch = "aarch64", feature = "dynamic-regions"))]
pub fn add_dynamic_region(mm: XlatRegion) -> Result<(), XlatError> {
    DEFAULT_CTX.lock().add_dynamic_region(mm)
}

/// Removes a dynamic region from the default context. See
/// [`XlatCtx::remove_dynamic_region()`].
#[cfg(all(target_arch = "aarch64", feature = "dynamic-regions"))]
pub fn remove_dynamic_region(base_va: VirtAddr, size: usize) -> Result<(), XlatError> {
    DEFAULT_CTX.lock().remove_dynamic_region(base_va, size)
}

/// Changes attributes of mapped pages in the default context. See
/// [`XlatCtx::change_mem_attributes()`].
#[cfg(target_arch = "aarch64")]
pub fn change_mem_attributes(
    base_va: VirtAddr,
    size: usize,
    attr: MemAttributes,
) -> Result<(), XlatError> {
    DEFAULT_CTX.lock().change_mem_attributes(base_va, size, attr)
}

/// Base table address of the default context, for MMU programming.
#[cfg(target_arch = "aarch64")]
pub fn base_table_address() -> PhysAddr {
    DEFAULT_CTX.lock().base_table_address()
}

/// Highest physical address the MMU setup of the default context has to
/// cover.
#[cfg(target_arch = "aarch64")]
pub fn mmu_max_pa() -> PhysAddr {
    DEFAULT_CTX.lock().mmu_max_pa()
}

/// Inclusive top of the virtual address space of the default context.
#[cfg(target_arch = "aarch64")]
pub fn va_max_address() -> VirtAddr {
    DEFAULT_CTX.lock().va_max_address()
}

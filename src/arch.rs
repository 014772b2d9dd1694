// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{PhysAddr, VirtAddr};
use crate::descriptor::{upper_attrs, PXN, XN};

/// Exception level a translation context targets. The level picks the
/// translation regime and with it the execute-never encoding and the TLB
/// maintenance instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionLevel {
    /// Resolve to the exception level the caller executes at when the
    /// context is initialized.
    Current,
    El1,
    El3,
}

/// Architectural services the mapper consumes. The context calls these
/// for TLB maintenance and for querying translation regime properties;
/// everything else about MMU programming stays with the caller.
/// Implementations are shared through `'static` references, including
/// from statically allocated contexts, and must be `Sync`.
pub trait XlatArch: Sync {
    /// Broadcast-invalidate TLB entries translating `va` in the regime of
    /// `el`.
    fn invalidate_tlb_va(&self, va: VirtAddr, el: ExceptionLevel);

    /// Data synchronization barrier on the inner-shareable domain,
    /// completing outstanding TLB maintenance.
    fn tlb_sync(&self);

    /// The exception level the caller executes at. Never returns
    /// [`ExceptionLevel::Current`].
    fn current_el(&self) -> ExceptionLevel;

    /// Execute-never descriptor bits of the translation regime of `el`:
    /// the XN bit for single-VA-range regimes (EL2 and EL3), PXN for
    /// EL1&0.
    fn xn_mask(&self, el: ExceptionLevel) -> u64 {
        debug_assert!(el != ExceptionLevel::Current);
        if el == ExceptionLevel::El3 {
            upper_attrs(XN)
        } else {
            upper_attrs(PXN)
        }
    }

    /// Inclusive upper bound of the physical address range supported by
    /// the core.
    fn max_supported_pa(&self) -> PhysAddr;
}

/// Hook implementation for bare-metal AArch64.
#[cfg(target_arch = "aarch64")]
#[derive(Clone, Copy, Debug)]
pub struct AArch64;

#[cfg(target_arch = "aarch64")]
impl XlatArch for AArch64 {
    fn invalidate_tlb_va(&self, va: VirtAddr, el: ExceptionLevel) {
        use crate::address::Address;
        use crate::types::PAGE_SHIFT;
        use core::arch::asm;

        // TLBI by VA takes VA[55:12] in the low operand bits.
        let arg = (va.bits() >> PAGE_SHIFT) as u64;
        // SAFETY: TLB maintenance has no memory effects visible to Rust.
        unsafe {
            match el {
                ExceptionLevel::El3 => {
                    asm!("tlbi vae3is, {}", in(reg) arg, options(nostack, preserves_flags))
                }
                _ => asm!("tlbi vaae1is, {}", in(reg) arg, options(nostack, preserves_flags)),
            }
        }
    }

    fn tlb_sync(&self) {
        // SAFETY: barriers have no memory effects visible to Rust.
        unsafe {
            core::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags));
        }
    }

    fn current_el(&self) -> ExceptionLevel {
        let current_el: u64;
        // SAFETY: reads a system register into a local.
        unsafe {
            core::arch::asm!("mrs {}, CurrentEL", out(reg) current_el,
                             options(nomem, nostack, preserves_flags));
        }
        match (current_el >> 2) & 0x3 {
            1 => ExceptionLevel::El1,
            3 => ExceptionLevel::El3,
            el => panic!("translation tables not supported at EL{}", el),
        }
    }

    fn max_supported_pa(&self) -> PhysAddr {
        const PARANGE_BITS: [u32; 6] = [32, 36, 40, 42, 44, 48];

        let mmfr0: u64;
        // SAFETY: reads a system register into a local.
        unsafe {
            core::arch::asm!("mrs {}, id_aa64mmfr0_el1", out(reg) mmfr0,
                             options(nomem, nostack, preserves_flags));
        }
        let parange = (mmfr0 & 0xf) as usize;
        assert!(parange < PARANGE_BITS.len());

        PhysAddr::from((1u64 << PARANGE_BITS[parange]) - 1)
    }
}

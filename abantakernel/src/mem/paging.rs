// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
// src/mem/paging.rs
//! Identity map `[0, size)` with 2 MiB pages: one PML4, one PDPT, one PD per GiB.
//!
//! The tables live in pages reserved while boot services were still up; this
//! module never allocates.

use x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{PageTable, PageTableFlags as F, PhysFrame},
};

use super::{PAGE_SIZE, Region, align_up, is_page_aligned};
use crate::error::PagingError;

pub const LARGE_PAGE: u64 = 2 * 1024 * 1024;
pub const GIB: u64 = 1 << 30;
const ENTRIES: usize = 512;

/// One PDPT covers 512 GiB; that is as far as this builder goes.
pub const MAX_IDENTITY: u64 = ENTRIES as u64 * GIB;

#[inline]
fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}
#[inline]
fn pdpt_index(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}
#[inline]
fn pd_index(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}

pub struct PageTableBuilder {
    tables: Region,
}

/// A complete hierarchy, ready for CR3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableRoot {
    pml4: u64,
    mapped: u64,
}

impl PageTableBuilder {
    /// `tables` is the page run reserved before ExitBootServices.
    pub fn new(tables: Region) -> Result<Self, PagingError> {
        if !is_page_aligned(tables.base()) {
            return Err(PagingError::Misaligned(tables.base()));
        }
        Ok(Self { tables })
    }

    /// Table pages an identity map of `size` bytes needs.
    pub fn pages_needed(size: u64) -> usize {
        let gibs = size.div_ceil(GIB).max(1);
        2 + gibs as usize
    }

    fn reserved_pages(&self) -> usize {
        self.tables.len() / PAGE_SIZE
    }

    fn table_at(&self, index: usize) -> u64 {
        self.tables.base() + (index * PAGE_SIZE) as u64
    }

    /// Write the whole hierarchy for `[0, size)`. Validation happens before
    /// the first table write.
    ///
    /// # Safety
    /// The reserved pages must be identity-addressable and unused by anything
    /// else, including the frame allocator.
    pub unsafe fn build_identity(self, size: u64) -> Result<PageTableRoot, PagingError> {
        if size == 0 {
            return Err(PagingError::EmptyRange);
        }
        let span = match align_up(size, LARGE_PAGE) {
            Some(s) if s <= MAX_IDENTITY => s,
            _ => {
                return Err(PagingError::RangeTooLarge {
                    requested: size,
                    limit: MAX_IDENTITY,
                });
            }
        };
        let needed = Self::pages_needed(span);
        if needed > self.reserved_pages() {
            return Err(PagingError::ReservationTooSmall {
                needed,
                reserved: self.reserved_pages(),
            });
        }

        let table_flags = F::PRESENT | F::WRITABLE;
        let leaf_flags = F::PRESENT | F::WRITABLE | F::HUGE_PAGE;

        for i in 0..needed {
            unsafe { Self::table(self.table_at(i)).zero() };
        }
        let pml4 = unsafe { Self::table(self.table_at(0)) };
        let pdpt = unsafe { Self::table(self.table_at(1)) };
        pml4[pml4_index(0)].set_addr(PhysAddr::new(self.table_at(1)), table_flags);

        let mut pa = 0u64;
        while pa < span {
            let pd_page = self.table_at(2 + pdpt_index(pa));
            if pd_index(pa) == 0 {
                pdpt[pdpt_index(pa)].set_addr(PhysAddr::new(pd_page), table_flags);
            }
            let pd = unsafe { Self::table(pd_page) };
            pd[pd_index(pa)].set_addr(PhysAddr::new(pa), leaf_flags);
            pa += LARGE_PAGE;
        }

        log::info!(
            "[paging] identity 0..{:#x} with {} 2MiB pages, {} table pages at {:#x}",
            span,
            span / LARGE_PAGE,
            needed,
            self.tables.base()
        );
        Ok(PageTableRoot {
            pml4: self.table_at(0),
            mapped: span,
        })
    }

    unsafe fn table(addr: u64) -> &'static mut PageTable {
        unsafe { &mut *(addr as *mut PageTable) }
    }
}

impl PageTableRoot {
    pub fn phys(&self) -> u64 {
        self.pml4
    }

    pub fn mapped(&self) -> u64 {
        self.mapped
    }

    /// Walk the hierarchy for `va`.
    ///
    /// # Safety
    /// The tables must still be addressable at their physical addresses.
    pub unsafe fn translate(&self, va: u64) -> Option<u64> {
        let pml4 = unsafe { &*(self.pml4 as *const PageTable) };
        let e = &pml4[pml4_index(va)];
        if !e.flags().contains(F::PRESENT) {
            return None;
        }
        let pdpt = unsafe { &*(e.addr().as_u64() as *const PageTable) };
        let e = &pdpt[pdpt_index(va)];
        if !e.flags().contains(F::PRESENT) {
            return None;
        }
        let pd = unsafe { &*(e.addr().as_u64() as *const PageTable) };
        let e = &pd[pd_index(va)];
        if !e.flags().contains(F::PRESENT | F::HUGE_PAGE) {
            return None;
        }
        Some(e.addr().as_u64() + (va & (LARGE_PAGE - 1)))
    }

    /// Load CR3. Last step of the page-table phase.
    ///
    /// # Safety
    /// Code, stack, the frame pool and every loaded image must lie inside the
    /// mapped extent. Interrupts must be off.
    pub unsafe fn install(&self) {
        let frame = PhysFrame::containing_address(PhysAddr::new(self.pml4));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
        log::info!("[paging] CR3 <- {:#x}", self.pml4);
    }
}

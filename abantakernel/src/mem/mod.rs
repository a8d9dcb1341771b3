// SPDX-License-Identifier: JOSSL-1.0
// Copyright (C) 2025 The Jotunheim Project
//! Physical memory after the firmware is gone.
//!
//! Everything is identity mapped, so a physical address is also the pointer
//! the CPU uses. Allocations are always handed out as a [`Region`]; writes go
//! through [`PageSource::bytes_mut`] on that region, never through a bare
//! address.

pub mod frame;
pub mod paging;

use crate::error::AllocationError;

pub const PAGE_SIZE: usize = 4096;

#[inline]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

#[inline]
pub fn align_up(x: u64, a: u64) -> Option<u64> {
    Some(x.checked_add(a - 1)? & !(a - 1))
}

#[inline]
pub const fn is_page_aligned(x: u64) -> bool {
    (x & (PAGE_SIZE as u64 - 1)) == 0
}

/// `[base, base + len)` owned by whoever holds the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: u64,
    len: usize,
}

impl Region {
    pub const fn new(base: u64, len: usize) -> Self {
        Self { base, len }
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    /// Whether `[addr, addr + len)` lies entirely inside.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        match addr.checked_add(len as u64) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }

    /// Byte offset of `addr` when `[addr, addr + len)` fits, else `None`.
    pub fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        self.contains(addr, len).then(|| (addr - self.base) as usize)
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    pub fn pages(&self) -> impl Iterator<Item = u64> {
        let base = self.base;
        let n = self.len.div_ceil(PAGE_SIZE) as u64;
        (0..n).map(move |i| base + i * PAGE_SIZE as u64)
    }
}

/// Where loaded images get their memory.
///
/// [`frame::PhysPageAllocator`] is the real implementation; tests use an
/// arena that pretends to live at arbitrary physical addresses.
pub trait PageSource {
    /// Memory anywhere, at least `size` bytes, page aligned.
    fn allocate(&mut self, size: usize) -> Result<Region, AllocationError>;

    /// Exactly the pages covering `[addr, addr + size)`. `addr` is page aligned.
    fn allocate_at(&mut self, addr: u64, size: usize) -> Result<Region, AllocationError>;

    /// Give a region back. The caller must own it.
    fn release(&mut self, region: Region);

    /// Bytes backing `region`, or `None` if it is not memory this source manages.
    fn bytes(&self, region: &Region) -> Option<&[u8]>;

    fn bytes_mut(&mut self, region: &Region) -> Option<&mut [u8]>;
}
